//! Tracing of every module hook

use async_trait::async_trait;
use std::any::Any;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace};

use crate::core::bean::BeanRef;
use crate::core::context::{Context, EdgeChange};
use crate::core::event::EventScope;
use crate::core::manager::ContextManager;
use crate::core::module::{Module, ModuleMetadata};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TraceStats {
    pub created: u64,
    pub entered: u64,
    pub exited: u64,
    pub edges_added: u64,
    pub edges_removed: u64,
    pub beans_added: u64,
    pub beans_removed: u64,
    pub published: u64,
    pub intercepted: u64,
}

#[derive(Default)]
struct Counters {
    created: AtomicU64,
    entered: AtomicU64,
    exited: AtomicU64,
    edges_added: AtomicU64,
    edges_removed: AtomicU64,
    beans_added: AtomicU64,
    beans_removed: AtomicU64,
    published: AtomicU64,
    intercepted: AtomicU64,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Logs every hook through `tracing` and counts completed transitions
#[derive(Default)]
pub struct TraceModule {
    counters: Counters,
}

impl TraceModule {
    pub const ID: &'static str = "trace";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> TraceStats {
        let c = &self.counters;
        TraceStats {
            created: c.created.load(Ordering::Relaxed),
            entered: c.entered.load(Ordering::Relaxed),
            exited: c.exited.load(Ordering::Relaxed),
            edges_added: c.edges_added.load(Ordering::Relaxed),
            edges_removed: c.edges_removed.load(Ordering::Relaxed),
            beans_added: c.beans_added.load(Ordering::Relaxed),
            beans_removed: c.beans_removed.load(Ordering::Relaxed),
            published: c.published.load(Ordering::Relaxed),
            intercepted: c.intercepted.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl Module for TraceModule {
    fn metadata(&self) -> ModuleMetadata {
        ModuleMetadata::new(Self::ID).with_description("Logs context lifecycle hooks")
    }

    async fn post_enable(&self, manager: &ContextManager) -> anyhow::Result<()> {
        info!(contexts = manager.context_count(), "trace module enabled");
        Ok(())
    }

    async fn pre_disable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        info!(stats = ?self.stats(), "trace module disabling");
        Ok(())
    }

    fn on_init(&self, _manager: &ContextManager, context: &Context) {
        bump(&self.counters.created);
        debug!(context = %context, owner = context.owner_type(), "init");
    }

    fn pre_enter(&self, _manager: &ContextManager, context: &Context) {
        trace!(context = %context, "pre-enter");
    }

    fn post_enter(&self, _manager: &ContextManager, context: &Context) {
        bump(&self.counters.entered);
        debug!(context = %context, parents = ?context.parents(), "entered");
    }

    fn pre_exit(&self, _manager: &ContextManager, context: &Context) {
        trace!(context = %context, "pre-exit");
    }

    fn post_exit(&self, _manager: &ContextManager, context: &Context) {
        bump(&self.counters.exited);
        debug!(context = %context, "exited");
    }

    fn pre_edge_add(&self, _manager: &ContextManager, change: &EdgeChange) {
        trace!(edge = %change.edge, relocation = change.is_relocation(), "pre-edge-add");
    }

    fn post_edge_add(&self, _manager: &ContextManager, change: &EdgeChange) {
        bump(&self.counters.edges_added);
        debug!(edge = %change.edge, relocation = change.is_relocation(), "edge added");
    }

    fn pre_edge_remove(&self, _manager: &ContextManager, change: &EdgeChange) {
        trace!(edge = %change.edge, relocation = change.is_relocation(), "pre-edge-remove");
    }

    fn post_edge_remove(&self, _manager: &ContextManager, change: &EdgeChange) {
        bump(&self.counters.edges_removed);
        debug!(edge = %change.edge, relocation = change.is_relocation(), "edge removed");
    }

    fn pre_bean_add(&self, _manager: &ContextManager, context: &Context, bean: &BeanRef) {
        trace!(context = %context, bean = ?bean, "pre-bean-add");
    }

    fn post_bean_add(&self, _manager: &ContextManager, context: &Context, bean: &BeanRef) {
        bump(&self.counters.beans_added);
        trace!(context = %context, bean = ?bean, "bean added");
    }

    fn pre_bean_remove(&self, _manager: &ContextManager, context: &Context, bean: &BeanRef) {
        trace!(context = %context, bean = ?bean, "pre-bean-remove");
    }

    fn post_bean_remove(&self, _manager: &ContextManager, context: &Context, bean: &BeanRef) {
        bump(&self.counters.beans_removed);
        trace!(context = %context, bean = ?bean, "bean removed");
    }

    fn pre_publish(&self, _manager: &ContextManager, origin: &Context, _value: &dyn Any) {
        trace!(origin = %origin, "pre-publish");
    }

    fn post_publish(&self, _manager: &ContextManager, origin: &Context, _value: &dyn Any, scope: &EventScope) {
        bump(&self.counters.published);
        if scope.is_intercepted() {
            bump(&self.counters.intercepted);
        }
        trace!(
            origin = %origin,
            event_type = scope.value_type(),
            intercepted = scope.is_intercepted(),
            listened = scope.is_listened(),
            "published"
        );
    }
}
