//! Event system: listener registration and leaf-to-root bubbling

use std::any::{Any, TypeId};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, error, trace};

use crate::core::bean::BeanRegistry;
use crate::core::context::{Context, ContextId, EdgeChange, LifecycleState};
use crate::core::filter::FilterCache;
use crate::core::manager::ContextManager;
use crate::error::VibeError;

/// Event priority, carried as a dispatch-scoped bean
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum Priority {
    High = 0,
    #[default]
    Medium = 1,
    Low = 2,
}

/// Lifecycle notifications delivered to the listeners of the contexts involved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    PreEnter(ContextId),
    PostEnter(ContextId),
    PreExit(ContextId),
    PostExit(ContextId),
    PreEdgeAdd(EdgeChange),
    PostEdgeAdd(EdgeChange),
    PreEdgeRemove(EdgeChange),
    PostEdgeRemove(EdgeChange),
}

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "listener-{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListenerOptions {
    pub name: Option<String>,
    pub filter: bool,
    pub intercept: bool,
    pub listen: bool,
}

impl ListenerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Consult the filter engine before invoking the callback.
    pub fn with_filter(mut self, filter: bool) -> Self {
        self.filter = filter;
        self
    }

    /// Stop bubbling past the owning context once this listener runs.
    pub fn with_intercept(mut self, intercept: bool) -> Self {
        self.intercept = intercept;
        self
    }

    /// Mark the event as listened once this listener runs.
    pub fn with_listen(mut self, listen: bool) -> Self {
        self.listen = listen;
        self
    }
}

type ListenerFn = Box<dyn Fn(&dyn Any, &mut EventScope) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub(crate) enum ListenerType {
    Exact { type_id: TypeId, name: &'static str },
    Any,
}

impl ListenerType {
    fn accepts(self, value: &dyn Any) -> bool {
        match self {
            ListenerType::Exact { type_id, .. } => value.type_id() == type_id,
            ListenerType::Any => true,
        }
    }

    fn name(self) -> &'static str {
        match self {
            ListenerType::Exact { name, .. } => name,
            ListenerType::Any => "any",
        }
    }
}

pub(crate) struct ListenerEntry {
    id: ListenerId,
    name: String,
    event_type: ListenerType,
    options: ListenerOptions,
    callback: ListenerFn,
}

impl ListenerEntry {
    pub(crate) fn id(&self) -> ListenerId {
        self.id
    }
}

/// Per-dispatch state handed to listener callbacks
pub struct EventScope {
    origin: Context,
    current: Context,
    value_type: &'static str,
    intercepted: bool,
    listened: bool,
    beans: BeanRegistry,
}

impl EventScope {
    pub fn origin(&self) -> &Context {
        &self.origin
    }

    /// The context whose listeners are currently running.
    pub fn current(&self) -> &Context {
        &self.current
    }

    pub fn value_type(&self) -> &'static str {
        self.value_type
    }

    /// Stops bubbling once the current context's listeners have run.
    pub fn intercept(&mut self) {
        self.intercepted = true;
    }

    pub fn is_intercepted(&self) -> bool {
        self.intercepted
    }

    pub fn listen(&mut self) {
        self.listened = true;
    }

    pub fn is_listened(&self) -> bool {
        self.listened
    }

    pub fn beans(&self) -> &BeanRegistry {
        &self.beans
    }

    pub fn beans_mut(&mut self) -> &mut BeanRegistry {
        &mut self.beans
    }

    pub fn priority(&self) -> Priority {
        self.beans.get::<Priority>().map(|p| *p).unwrap_or_default()
    }
}

/// A published value together with the outcome of its dispatch
pub struct EventContext<T> {
    value: T,
    scope: EventScope,
}

impl<T> EventContext<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn origin(&self) -> &Context {
        &self.scope.origin
    }

    pub fn is_intercepted(&self) -> bool {
        self.scope.intercepted
    }

    pub fn is_listened(&self) -> bool {
        self.scope.listened
    }

    pub fn beans(&self) -> &BeanRegistry {
        &self.scope.beans
    }

    pub fn priority(&self) -> Priority {
        self.scope.priority()
    }

    pub fn scope(&self) -> &EventScope {
        &self.scope
    }
}

impl<T: Any> EventContext<T> {
    fn new(value: T, origin: &Context, beans: BeanRegistry) -> Self {
        Self {
            value,
            scope: EventScope {
                origin: origin.clone(),
                current: origin.clone(),
                value_type: std::any::type_name::<T>(),
                intercepted: false,
                listened: false,
                beans,
            },
        }
    }
}

/// Turns a caught panic payload into an error carrying its message.
pub(crate) fn panic_error(payload: &(dyn Any + Send)) -> anyhow::Error {
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    anyhow::anyhow!("panicked: {}", message)
}

impl ContextManager {
    /// Registers a listener for values of type `E` on `context`.
    ///
    /// Returns `None` when the context has already exited.
    pub fn register_listener<E, F>(
        &self,
        context: &Context,
        options: ListenerOptions,
        callback: F,
    ) -> Option<ListenerId>
    where
        E: Any,
        F: Fn(&E, &mut EventScope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let event_type = ListenerType::Exact {
            type_id: TypeId::of::<E>(),
            name: std::any::type_name::<E>(),
        };
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<F>().to_string());
        let callback: ListenerFn = Box::new(move |value: &dyn Any, scope: &mut EventScope| {
            match value.downcast_ref::<E>() {
                Some(event) => callback(event, scope),
                None => Ok(()),
            }
        });
        self.insert_listener(context, name, event_type, options, callback)
    }

    /// Registers a listener receiving every published value.
    pub fn register_any_listener<F>(
        &self,
        context: &Context,
        options: ListenerOptions,
        callback: F,
    ) -> Option<ListenerId>
    where
        F: Fn(&dyn Any, &mut EventScope) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<F>().to_string());
        self.insert_listener(context, name, ListenerType::Any, options, Box::new(callback))
    }

    fn insert_listener(
        &self,
        context: &Context,
        name: String,
        event_type: ListenerType,
        options: ListenerOptions,
        callback: ListenerFn,
    ) -> Option<ListenerId> {
        let mut state = context.lock();
        if state.lifecycle == LifecycleState::Exited {
            debug!(context = %context, listener = %name, "ignoring listener on exited context");
            return None;
        }
        let id = ListenerId::next();
        trace!(context = %context, listener = %name, event_type = event_type.name(), "registering listener");
        state.listeners.push(std::sync::Arc::new(ListenerEntry {
            id,
            name,
            event_type,
            options,
            callback,
        }));
        Some(id)
    }

    pub fn unregister_listener(&self, context: &Context, id: ListenerId) -> bool {
        let mut state = context.lock();
        let before = state.listeners.len();
        state.listeners.retain(|l| l.id() != id);
        state.listeners.len() != before
    }

    pub fn publish<T: Any>(&self, origin: &Context, value: T) -> EventContext<T> {
        self.publish_with(origin, value, BeanRegistry::new())
    }

    pub fn publish_with_priority<T: Any>(
        &self,
        origin: &Context,
        value: T,
        priority: Priority,
    ) -> EventContext<T> {
        let mut beans = BeanRegistry::new();
        beans.insert(priority);
        self.publish_with(origin, value, beans)
    }

    /// Bubbles `value` from `origin` towards the roots, seeding the
    /// dispatch-scoped registry with `beans`.
    pub fn publish_with<T: Any>(
        &self,
        origin: &Context,
        value: T,
        beans: BeanRegistry,
    ) -> EventContext<T> {
        let mut event = EventContext::new(value, origin, beans);
        self.modules()
            .broadcast(|m| m.pre_publish(self, origin, &event.value));

        let order = self.bubble_order(origin);
        trace!(origin = %origin, event_type = event.scope.value_type, contexts = order.len(), "publishing");
        for context in &order {
            self.dispatch_at(context, &event.value, &mut event.scope);
            if event.scope.intercepted {
                debug!(origin = %origin, at = %context, event_type = event.scope.value_type, "event intercepted");
                break;
            }
        }

        self.modules()
            .broadcast(|m| m.post_publish(self, origin, &event.value, &event.scope));
        event
    }

    /// Delivers a lifecycle notification to `context`'s own listeners only.
    pub(crate) fn notify(&self, context: &Context, event: LifecycleEvent) {
        let mut event = EventContext::new(event, context, BeanRegistry::new());
        self.dispatch_at(context, &event.value, &mut event.scope);
    }

    fn dispatch_at(&self, context: &Context, value: &dyn Any, scope: &mut EventScope) {
        let listeners = context.lock().listeners.clone();
        if listeners.is_empty() {
            return;
        }
        scope.current = context.clone();

        for listener in listeners {
            if !listener.event_type.accepts(value) {
                continue;
            }
            if listener.options.filter {
                let verdict = self.resolve_filter(context, value, &mut FilterCache::default());
                if verdict == Some(false) {
                    trace!(context = %context, listener = %listener.name, "listener skipped by filter");
                    continue;
                }
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| (listener.callback)(value, scope)))
                .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())));
            if let Err(source) = outcome {
                let err = VibeError::Listener {
                    listener: listener.name.clone(),
                    event_type: scope.value_type,
                    context: context.id(),
                    source,
                };
                error!(error = %err, "listener failed");
            }

            if listener.options.listen {
                scope.listened = true;
            }
            if listener.options.intercept {
                scope.intercepted = true;
            }
        }
    }

    /// Topological leaf-to-root order over `origin` and its ancestors.
    ///
    /// A context is emitted only after every child of it inside the set has
    /// been emitted, so shared ancestors appear exactly once.
    pub(crate) fn bubble_order(&self, origin: &Context) -> Vec<Context> {
        let mut members: HashMap<ContextId, (Context, Vec<ContextId>)> = HashMap::new();
        let mut pending: HashMap<ContextId, usize> = HashMap::new();
        let mut stack = vec![origin.clone()];

        while let Some(context) = stack.pop() {
            if members.contains_key(&context.id()) {
                continue;
            }
            let parents: Vec<Context> = context
                .parents()
                .into_iter()
                .filter_map(|id| self.context(id))
                .collect();
            for parent in &parents {
                *pending.entry(parent.id()).or_insert(0) += 1;
                stack.push(parent.clone());
            }
            let parent_ids = parents.iter().map(Context::id).collect();
            members.insert(context.id(), (context, parent_ids));
        }

        let mut order = Vec::with_capacity(members.len());
        let mut queue = VecDeque::from([origin.id()]);
        while let Some(id) = queue.pop_front() {
            let Some((context, parents)) = members.get(&id) else {
                continue;
            };
            order.push(context.clone());
            for parent in parents {
                if let Some(count) = pending.get_mut(parent) {
                    *count -= 1;
                    if *count == 0 {
                        queue.push_back(*parent);
                    }
                }
            }
        }
        order
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::filter::{BuiltinResolver, FilterOptions};
    use std::sync::Arc;
    use parking_lot::Mutex;

    #[derive(Debug)]
    struct Chat(&'static str);

    #[derive(Debug)]
    struct Other;

    fn recorder() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_bubbles_to_ancestor_once() {
        let manager = ContextManager::new();
        let root = manager.enter_root("server", None).unwrap();
        let a = manager.enter_child(&root, "a", None).unwrap();
        let b = manager.enter_child(&a, "b", None).unwrap();

        let seen = recorder();
        let log = Arc::clone(&seen);
        manager.register_listener(&root, ListenerOptions::new(), move |chat: &Chat, _| {
            log.lock().push(chat.0.to_string());
            Ok(())
        });

        manager.publish(&b, Chat("hi"));
        assert_eq!(*seen.lock(), vec!["hi".to_string()]);
    }

    #[test]
    fn test_order_is_leaf_to_root_and_registration_order() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        let seen = recorder();
        for (ctx, label) in [(&root, "root-1"), (&child, "child-1"), (&child, "child-2"), (&root, "root-2")] {
            let log = Arc::clone(&seen);
            manager.register_listener(ctx, ListenerOptions::named(label), move |_: &Chat, _| {
                log.lock().push(label.to_string());
                Ok(())
            });
        }

        manager.publish(&child, Chat("x"));
        assert_eq!(*seen.lock(), vec!["child-1", "child-2", "root-1", "root-2"]);
    }

    #[test]
    fn test_type_matching() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();

        let seen = recorder();
        let typed = Arc::clone(&seen);
        manager.register_listener(&root, ListenerOptions::new(), move |_: &Chat, _| {
            typed.lock().push("chat".to_string());
            Ok(())
        });
        let any = Arc::clone(&seen);
        manager.register_any_listener(&root, ListenerOptions::new(), move |_, scope| {
            any.lock().push(scope.value_type().to_string());
            Ok(())
        });

        manager.publish(&root, Other);
        assert_eq!(seen.lock().len(), 1);
        assert!(seen.lock()[0].ends_with("Other"));
    }

    #[test]
    fn test_diamond_visits_shared_ancestor_once() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let left = manager.enter_child(&root, "left", None).unwrap();
        let right = manager.enter_child(&root, "right", None).unwrap();
        let leaf = manager
            .build_context()
            .owner("leaf")
            .parent(&left)
            .parent(&right)
            .resolver(BuiltinResolver::All)
            .create()
            .unwrap();

        let order: Vec<ContextId> = manager.bubble_order(&leaf).iter().map(Context::id).collect();
        assert_eq!(order.len(), 4);
        assert_eq!(order[0], leaf.id());
        assert_eq!(order[3], root.id());

        let hits = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&hits);
        manager.register_listener(&root, ListenerOptions::new(), move |_: &Chat, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        manager.publish(&leaf, Chat("once"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_intercept_stops_bubbling() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let a = manager.enter_child(&root, "a", None).unwrap();
        let b = manager.enter_child(&a, "b", None).unwrap();

        let seen = recorder();
        let at_a = Arc::clone(&seen);
        manager.register_listener(&a, ListenerOptions::new(), move |_: &Chat, scope| {
            at_a.lock().push("a".to_string());
            scope.intercept();
            Ok(())
        });
        let at_root = Arc::clone(&seen);
        manager.register_listener(&root, ListenerOptions::new(), move |_: &Chat, _| {
            at_root.lock().push("root".to_string());
            Ok(())
        });

        let event = manager.publish(&b, Chat("stop"));
        assert!(event.is_intercepted());
        assert_eq!(*seen.lock(), vec!["a".to_string()]);
    }

    #[test]
    fn test_option_flags() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        manager.register_listener(
            &child,
            ListenerOptions::named("consumer").with_listen(true).with_intercept(true),
            |_: &Chat, _| Ok(()),
        );
        let reached_root = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&reached_root);
        manager.register_listener(&root, ListenerOptions::new(), move |_: &Chat, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let event = manager.publish(&child, Chat("m"));
        assert!(event.is_listened());
        assert!(event.is_intercepted());
        assert_eq!(reached_root.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failing_listener_is_isolated() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        manager.register_listener(&child, ListenerOptions::named("broken"), |_: &Chat, _| {
            Err(anyhow::anyhow!("listener exploded"))
        });
        let hits = Arc::new(AtomicU64::new(0));
        let sibling = Arc::clone(&hits);
        manager.register_listener(&child, ListenerOptions::new(), move |_: &Chat, _| {
            sibling.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        let ancestor = Arc::clone(&hits);
        manager.register_listener(&root, ListenerOptions::new(), move |_: &Chat, _| {
            ancestor.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        manager.publish(&child, Chat("boom"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_panicking_listener_is_isolated() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        manager.register_listener(&child, ListenerOptions::named("explodes"), |_: &Chat, _| {
            panic!("listener bug");
        });
        let hits = Arc::new(AtomicU64::new(0));
        for ctx in [&child, &root] {
            let counter = Arc::clone(&hits);
            manager.register_listener(ctx, ListenerOptions::new(), move |_: &Chat, _| {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            });
        }

        let event = manager.publish(&child, Chat("still delivered"));
        assert_eq!(hits.load(Ordering::SeqCst), 2);
        assert!(!event.is_intercepted());
    }

    #[test]
    fn test_panic_error_message() {
        let err = panic_error(&"boom");
        assert_eq!(err.to_string(), "panicked: boom");
        let err = panic_error(&String::from("owned"));
        assert_eq!(err.to_string(), "panicked: owned");
    }

    #[test]
    fn test_filtered_listener() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        manager.register_filter(&root, FilterOptions::new(), |chat: &Chat, _| {
            Ok(Some(chat.0 != "spam"))
        });
        let seen = recorder();
        let log = Arc::clone(&seen);
        manager.register_listener(&child, ListenerOptions::new().with_filter(true), move |chat: &Chat, _| {
            log.lock().push(chat.0.to_string());
            Ok(())
        });

        manager.publish(&child, Chat("spam"));
        manager.publish(&child, Chat("hello"));
        assert_eq!(*seen.lock(), vec!["hello".to_string()]);
    }

    #[test]
    fn test_priority_bean() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();

        let seen = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&seen);
        manager.register_listener(&root, ListenerOptions::new(), move |_: &Chat, scope| {
            *slot.lock() = Some(scope.priority());
            Ok(())
        });

        let event = manager.publish_with_priority(&root, Chat("urgent"), Priority::High);
        assert_eq!(*seen.lock(), Some(Priority::High));
        assert_eq!(event.priority(), Priority::High);
        assert_eq!(manager.publish(&root, Chat("calm")).priority(), Priority::Medium);
    }

    #[test]
    fn test_unregister_and_exit_removes_listeners() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let id = manager
            .register_listener(&root, ListenerOptions::new(), |_: &Chat, _| Ok(()))
            .unwrap();
        assert!(manager.unregister_listener(&root, id));
        assert!(!manager.unregister_listener(&root, id));

        manager.register_listener(&root, ListenerOptions::new(), |_: &Chat, _| Ok(()));
        assert_eq!(root.listener_count(), 1);
        manager.exit(&root);
        assert_eq!(root.listener_count(), 0);
        assert!(manager
            .register_listener(&root, ListenerOptions::new(), |_: &Chat, _| Ok(()))
            .is_none());
    }

    #[test]
    fn test_lifecycle_events_reach_own_listeners() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = Arc::clone(&seen);
        manager.register_listener(&child, ListenerOptions::new(), move |event: &LifecycleEvent, _| {
            log.lock().push(*event);
            Ok(())
        });

        manager.exit(&child);
        // Listeners are dropped after post-exit, before the parent edge goes.
        assert_eq!(
            *seen.lock(),
            vec![LifecycleEvent::PreExit(child.id()), LifecycleEvent::PostExit(child.id())]
        );
        assert!(root.children().is_empty());
    }
}
