use std::time::Duration;

use vibe_scope::prelude::*;

#[derive(Debug)]
struct Room(&'static str);

#[derive(Debug)]
struct Player(&'static str);

#[derive(Debug)]
struct Chat {
    from: &'static str,
    text: &'static str,
}

#[tokio::main]
async fn main() -> Result<()> {
    let app = ScopeApp::build()
        .with_config(
            AppConfig::new("scope-demo")
                .with_signal_handling(false)
                .with_logging(LoggingConfig::new("info")),
        )
        .add_module(TraceModule::new())
        .add_module(TimerModule::new())
        .build()
        .await?;

    let server = app.start().await?;
    let manager = app.manager();

    let lobby = manager.enter_child(&server, Room("lobby"), Some("lobby"))?;
    let alice = manager.enter_child(&lobby, Player("alice"), Some("alice"))?;
    let bob = manager.enter_child(&lobby, Player("bob"), Some("bob"))?;

    manager.register_filter(&lobby, FilterOptions::named("mute-bob"), |chat: &Chat, _| {
        Ok(Some(chat.from != "bob"))
    });
    manager.register_listener(
        &lobby,
        ListenerOptions::named("room-log").with_filter(true),
        |chat: &Chat, scope| {
            println!("[{}] {}: {}", scope.current(), chat.from, chat.text);
            Ok(())
        },
    );
    manager.register_listener(&server, ListenerOptions::named("audit"), |chat: &Chat, _| {
        println!("audit saw message from {}", chat.from);
        Ok(())
    });

    manager.publish(&alice, Chat { from: "alice", text: "hi all" });
    manager.publish(&bob, Chat { from: "bob", text: "spam spam" });

    if let Some(timer) = manager.module::<TimerModule>() {
        timer.schedule(manager, &bob, Duration::from_millis(50), |manager, ctx| {
            println!("{} idle, disconnecting", ctx);
            manager.exit(ctx);
        })?;
    }
    tokio::time::sleep(Duration::from_millis(100)).await;
    println!("bob exited: {}", bob.is_exited());

    if let Some(tracer) = manager.module::<TraceModule>() {
        println!("{:?}", tracer.stats());
    }

    app.shutdown().await?;
    println!("{} done", vibe_scope::build_info());
    Ok(())
}
