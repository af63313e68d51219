//! Timers scoped to a context's lifetime

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, sleep, Instant, MissedTickBehavior};
use tracing::{debug, trace};

use crate::core::context::{Context, ContextId};
use crate::core::manager::ContextManager;
use crate::core::module::{Module, ModuleMetadata};
use crate::error::{Result, VibeError};

/// Runs delayed and periodic tasks on behalf of contexts.
///
/// Pending tasks are aborted when their context exits or when the module is
/// disabled. A task never starts once its context has exited.
#[derive(Default)]
pub struct TimerModule {
    runtime: Mutex<Option<Handle>>,
    tasks: Mutex<HashMap<ContextId, Vec<JoinHandle<()>>>>,
}

impl TimerModule {
    pub const ID: &'static str = "timer";

    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `task` once after `delay`.
    pub fn schedule<F>(
        &self,
        manager: &ContextManager,
        context: &Context,
        delay: Duration,
        task: F,
    ) -> Result<()>
    where
        F: FnOnce(&ContextManager, &Context) + Send + 'static,
    {
        let runtime = self.runtime()?;
        if context.is_exited() {
            return Err(VibeError::ContextExited(context.id()));
        }

        let (manager, ctx) = (manager.clone(), context.clone());
        let join = runtime.spawn(async move {
            sleep(delay).await;
            if !ctx.is_exited() {
                trace!(context = %ctx, "timer fired");
                task(&manager, &ctx);
            }
        });
        self.track(context, join);
        Ok(())
    }

    /// Runs `task` every `period`, first after one full period.
    pub fn repeat<F>(
        &self,
        manager: &ContextManager,
        context: &Context,
        period: Duration,
        task: F,
    ) -> Result<()>
    where
        F: Fn(&ContextManager, &Context) + Send + Sync + 'static,
    {
        if period.is_zero() {
            return Err(VibeError::Configuration(
                "Timer period must be greater than zero".to_string(),
            ));
        }
        let runtime = self.runtime()?;
        if context.is_exited() {
            return Err(VibeError::ContextExited(context.id()));
        }

        let (manager, ctx) = (manager.clone(), context.clone());
        let join = runtime.spawn(async move {
            let mut ticks = interval_at(Instant::now() + period, period);
            ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticks.tick().await;
                if ctx.is_exited() {
                    break;
                }
                task(&manager, &ctx);
            }
        });
        self.track(context, join);
        Ok(())
    }

    /// Number of tasks for `context` that have not finished yet.
    pub fn active_tasks(&self, context: &Context) -> usize {
        self.tasks
            .lock()
            .get(&context.id())
            .map_or(0, |handles| handles.iter().filter(|h| !h.is_finished()).count())
    }

    fn runtime(&self) -> Result<Handle> {
        self.runtime
            .lock()
            .clone()
            .ok_or_else(|| VibeError::Runtime("Timer module is not enabled".to_string()))
    }

    fn track(&self, context: &Context, join: JoinHandle<()>) {
        {
            let mut tasks = self.tasks.lock();
            let handles = tasks.entry(context.id()).or_default();
            handles.retain(|h| !h.is_finished());
            handles.push(join);
        }
        // The context may have exited between the check and the insert.
        if context.is_exited() {
            self.cancel(context.id());
        }
    }

    fn cancel(&self, id: ContextId) -> usize {
        let handles = self.tasks.lock().remove(&id).unwrap_or_default();
        for handle in &handles {
            handle.abort();
        }
        handles.len()
    }
}

#[async_trait]
impl Module for TimerModule {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata::new(Self::ID).with_description("Context-scoped delayed and periodic tasks")
    }

    async fn pre_enable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        let handle = Handle::try_current()?;
        *self.runtime.lock() = Some(handle);
        Ok(())
    }

    async fn post_disable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        *self.runtime.lock() = None;
        let drained: Vec<_> = self.tasks.lock().drain().collect();
        let mut aborted = 0;
        for (_, handles) in drained {
            for handle in handles {
                handle.abort();
                aborted += 1;
            }
        }
        debug!(aborted, "timer module disabled");
        Ok(())
    }

    fn post_exit(&self, _manager: &ContextManager, context: &Context) {
        let aborted = self.cancel(context.id());
        if aborted > 0 {
            debug!(context = %context, aborted, "timers cancelled");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Arc;

    async fn enabled_manager() -> (ContextManager, Arc<TimerModule>) {
        let manager = ContextManager::new();
        manager.register_module(TimerModule::new()).unwrap();
        manager.enable_modules().await.unwrap();
        let timer = manager.module::<TimerModule>().unwrap();
        (manager, timer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_schedule_fires_once() {
        let (manager, timer) = enabled_manager().await;
        let root = manager.enter_root("root", None).unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        timer
            .schedule(&manager, &root, Duration::from_secs(5), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        assert_eq!(timer.active_tasks(&root), 1);

        sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.active_tasks(&root), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_cancels_pending_timers() {
        let (manager, timer) = enabled_manager().await;
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        let fired = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&fired);
        timer
            .repeat(&manager, &child, Duration::from_secs(1), move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        sleep(Duration::from_millis(2500)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);

        manager.exit(&root);
        sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
        assert_eq!(timer.active_tasks(&child), 0);
        assert!(matches!(
            timer.schedule(&manager, &child, Duration::from_secs(1), |_, _| {}),
            Err(VibeError::ContextExited(_))
        ));
    }

    #[tokio::test]
    async fn test_requires_enable() {
        let manager = ContextManager::new();
        let timer = TimerModule::new();
        let root = manager.enter_root("root", None).unwrap();
        assert!(matches!(
            timer.schedule(&manager, &root, Duration::from_secs(1), |_, _| {}),
            Err(VibeError::Runtime(_))
        ));
        timer.pre_enable(&manager).await.unwrap();
        assert!(timer.repeat(&manager, &root, Duration::ZERO, |_, _| {}).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_aborts_everything() {
        let (manager, timer) = enabled_manager().await;
        let root = manager.enter_root("root", None).unwrap();
        timer
            .schedule(&manager, &root, Duration::from_secs(60), |_, _| {})
            .unwrap();

        manager.disable_modules().await.unwrap();
        assert_eq!(timer.active_tasks(&root), 0);
        assert!(timer
            .schedule(&manager, &root, Duration::from_secs(1), |_, _| {})
            .is_err());
    }
}
