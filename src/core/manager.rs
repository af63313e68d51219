//! Context manager: arena of live contexts, graph mutation and lifecycle

use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, trace};

use crate::core::bean::BeanRef;
use crate::core::context::{
    lock_pair, Context, ContextBuilder, ContextId, Edge, EdgeChange, LifecycleState,
};
use crate::core::event::LifecycleEvent;
use crate::core::module::{Module, ModuleState};
use crate::error::{Result, ResultExt, VibeError};
use crate::runtime::module_dispatcher::ModuleDispatcher;

/// Manager configuration
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Default for new contexts: exit once the last parent edge is removed
    pub exit_if_no_parent: bool,
    /// Upper bound for each module enable/disable phase
    pub module_timeout: Duration,
    /// Keep enabling remaining modules when one fails
    pub continue_on_module_failure: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            exit_if_no_parent: true,
            module_timeout: Duration::from_secs(30),
            continue_on_module_failure: false,
        }
    }
}

impl ManagerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_exit_if_no_parent(mut self, exit: bool) -> Self {
        self.exit_if_no_parent = exit;
        self
    }

    pub fn with_module_timeout(mut self, timeout: Duration) -> Self {
        self.module_timeout = timeout;
        self
    }

    pub fn with_continue_on_module_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_module_failure = continue_on_failure;
        self
    }
}

struct ManagerInner {
    config: ManagerConfig,
    contexts: RwLock<HashMap<ContextId, Context>>,
    roots: RwLock<Vec<ContextId>>,
    /// Serializes edge validation with edge mutation.
    topology: Mutex<()>,
    /// Edges whose removal is in progress; the claimant alone fires hooks.
    removing: Mutex<HashSet<Edge>>,
    modules: ModuleDispatcher,
    next_id: AtomicU64,
}

#[derive(Clone, Copy)]
enum EdgePhase {
    PreAdd,
    PostAdd,
    PreRemove,
    PostRemove,
}

/// Owner of the context graph
///
/// Cloning yields another handle to the same graph. Every graph mutation,
/// lifecycle transition, bean change and publish goes through here so that
/// modules observe them all.
#[derive(Clone)]
pub struct ContextManager {
    inner: Arc<ManagerInner>,
}

impl Default for ContextManager {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ContextManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContextManager")
            .field("contexts", &self.context_count())
            .field("roots", &self.inner.roots.read().len())
            .field("modules", &self.inner.modules.count())
            .finish()
    }
}

impl ContextManager {
    pub fn new() -> Self {
        Self::with_config(ManagerConfig::default())
    }

    pub fn with_config(config: ManagerConfig) -> Self {
        let modules =
            ModuleDispatcher::new(config.module_timeout, config.continue_on_module_failure);
        Self {
            inner: Arc::new(ManagerInner {
                config,
                contexts: RwLock::new(HashMap::new()),
                roots: RwLock::new(Vec::new()),
                topology: Mutex::new(()),
                removing: Mutex::new(HashSet::new()),
                modules,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Looks up a live context. Exited contexts are no longer reachable.
    pub fn context(&self, id: ContextId) -> Option<Context> {
        self.inner.contexts.read().get(&id).cloned()
    }

    pub fn context_count(&self) -> usize {
        self.inner.contexts.read().len()
    }

    pub fn roots(&self) -> Vec<Context> {
        let roots = self.inner.roots.read().clone();
        roots.into_iter().filter_map(|id| self.context(id)).collect()
    }

    pub fn is_root(&self, context: &Context) -> bool {
        self.inner.roots.read().contains(&context.id())
    }

    pub(crate) fn modules(&self) -> &ModuleDispatcher {
        &self.inner.modules
    }

    // ---- context creation ----

    pub fn build_context(&self) -> ContextBuilder<'_> {
        ContextBuilder::new(self)
    }

    /// Creates a context for `owner` attached under every context in
    /// `parents`. With more than one parent, use [`build_context`] and set a
    /// filter resolver.
    ///
    /// [`build_context`]: ContextManager::build_context
    pub fn create_context<T: Any + Send + Sync>(
        &self,
        owner: T,
        parents: &[&Context],
        key: Option<&str>,
    ) -> Result<Context> {
        let mut builder = self.build_context().owner(owner).parents(parents.iter().copied());
        if let Some(key) = key {
            builder = builder.key(key);
        }
        builder.create()
    }

    pub(crate) fn create_from_builder(&self, builder: ContextBuilder<'_>) -> Result<Context> {
        let parents = builder.parents;

        let mut seen = HashSet::new();
        for parent in &parents {
            if parent.is_exited() {
                return Err(VibeError::ContextExited(parent.id()));
            }
            if !seen.insert(parent.id()) {
                return Err(VibeError::Configuration(format!(
                    "Parent {} listed twice",
                    parent
                )));
            }
        }
        if parents.len() > 1 && builder.resolver.is_none() {
            return Err(VibeError::Configuration(format!(
                "A context with {} parents requires a filter resolver",
                parents.len()
            )));
        }

        let id = ContextId::from_raw(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let owner_type = builder.owner.as_ref().map_or("()", BeanRef::type_name);
        let context = Context::new(
            id,
            builder.key,
            owner_type,
            builder
                .exit_if_no_parent
                .unwrap_or(self.inner.config.exit_if_no_parent),
            builder.resolver,
        );
        self.inner.contexts.write().insert(id, context.clone());
        debug!(context = %context, owner = owner_type, "context created");

        self.modules().broadcast(|m| m.on_init(self, &context));
        if let Some(owner) = builder.owner {
            self.insert_bean(&context, owner);
        }

        for parent in &parents {
            let attached = self.add_edge(parent, &context, None).and_then(|added| {
                if added || context.has_parent(parent.id()) {
                    Ok(())
                } else {
                    Err(VibeError::ContextExited(parent.id()))
                }
            });
            if let Err(e) = attached {
                self.exit(&context);
                return Err(e);
            }
        }
        Ok(context)
    }

    /// Creates a parentless context and enters it immediately. Roots only
    /// exit explicitly.
    pub fn enter_root<T: Any + Send + Sync>(&self, owner: T, key: Option<&str>) -> Result<Context> {
        let context = self.create_context(owner, &[], key)?;
        self.fire_pre_enter(&context);
        if context.transition(LifecycleState::Entered).is_none() {
            return Err(VibeError::ContextExited(context.id()));
        }
        self.inner.roots.write().push(context.id());
        debug!(context = %context, "root entered");
        self.fire_post_enter(&context);
        Ok(context)
    }

    /// Creates a context under `parent`. It enters when the edge is added.
    pub fn enter_child<T: Any + Send + Sync>(
        &self,
        parent: &Context,
        owner: T,
        key: Option<&str>,
    ) -> Result<Context> {
        self.create_context(owner, &[parent], key)
    }

    // ---- edges ----

    /// Attaches `child` under `parent`.
    ///
    /// Returns `Ok(false)` when the edge already exists or either end has
    /// exited. An `Initialized` child enters as part of the first attach. With
    /// `replace`, which must name a current parent edge of `child`, that edge
    /// is removed afterwards without triggering an orphan exit.
    pub fn add_edge(&self, parent: &Context, child: &Context, replace: Option<Edge>) -> Result<bool> {
        if parent.is_exited() || child.is_exited() {
            debug!(parent = %parent, child = %child, "ignoring edge involving an exited context");
            return Ok(false);
        }
        if child.has_parent(parent.id()) {
            return Ok(false);
        }
        self.validate_edge(parent, child, replace)?;

        let change = EdgeChange {
            edge: Edge::new(parent.id(), child.id()),
            replace,
        };
        let entering = child.state() == LifecycleState::Initialized;
        if entering {
            self.fire_pre_enter(child);
        }
        self.fire_edge(EdgePhase::PreAdd, &change, parent, child);

        let added = {
            let _topology = self.inner.topology.lock();
            if parent.is_exited() || child.is_exited() || child.has_parent(parent.id()) {
                false
            } else {
                self.validate_edge(parent, child, replace)?;
                let (mut p, mut c) = lock_pair(parent, child);
                p.children.push(child.id());
                c.parents.push(parent.id());
                true
            }
        };
        if !added {
            debug!(edge = %change.edge, "edge lost a race with exit or a duplicate add");
            return Ok(false);
        }

        let entered = entering && child.transition(LifecycleState::Entered).is_some();
        debug!(edge = %change.edge, entered, "edge added");
        self.fire_edge(EdgePhase::PostAdd, &change, parent, child);
        if entered {
            self.fire_post_enter(child);
        }

        if let Some(old_parent) = replace.and_then(|old| self.context(old.parent)) {
            self.remove_edge(&old_parent, child, Some(change.edge));
        }
        Ok(true)
    }

    /// Detaches `child` from `parent`. Returns `false` if there was no such
    /// edge. A non-root child left without parents exits when its
    /// `exit_if_no_parent` flag is set, unless the removal is a relocation.
    pub fn remove_edge(&self, parent: &Context, child: &Context, replace: Option<Edge>) -> bool {
        let change = EdgeChange {
            edge: Edge::new(parent.id(), child.id()),
            replace,
        };
        {
            let _topology = self.inner.topology.lock();
            if !child.has_parent(parent.id()) || !self.inner.removing.lock().insert(change.edge) {
                return false;
            }
        }
        self.fire_edge(EdgePhase::PreRemove, &change, parent, child);

        let orphaned = {
            let _topology = self.inner.topology.lock();
            let (mut p, mut c) = lock_pair(parent, child);
            let before = c.parents.len();
            c.parents.retain(|id| *id != parent.id());
            if c.parents.len() == before {
                None
            } else {
                p.children.retain(|id| *id != child.id());
                Some(
                    c.parents.is_empty()
                        && c.exit_if_no_parent
                        && c.lifecycle != LifecycleState::Exited,
                )
            }
        };
        self.inner.removing.lock().remove(&change.edge);
        let Some(orphaned) = orphaned else {
            return false;
        };

        debug!(edge = %change.edge, "edge removed");
        self.fire_edge(EdgePhase::PostRemove, &change, parent, child);

        if orphaned && replace.is_none() && !self.is_root(child) {
            debug!(context = %child, "last parent removed");
            self.exit(child);
        }
        true
    }

    fn validate_edge(&self, parent: &Context, child: &Context, replace: Option<Edge>) -> Result<()> {
        if parent.id() == child.id() {
            return Err(VibeError::Configuration(format!(
                "Context {} cannot be its own parent",
                child
            )));
        }
        if self.is_ancestor(child.id(), parent) {
            return Err(VibeError::Configuration(format!(
                "Edge {} -> {} would create a cycle",
                parent, child
            )));
        }

        let state = child.lock();
        let mut kept = state.parents.len();
        if let Some(old) = replace {
            if old.child != child.id() || !state.parents.contains(&old.parent) {
                return Err(VibeError::Configuration(format!(
                    "Replaced edge {} is not an edge of {}",
                    old, child
                )));
            }
            kept -= 1;
        }
        if kept > 0 && state.resolver.is_none() {
            return Err(VibeError::Configuration(format!(
                "Context {} already has a parent; set a filter resolver before adding {}",
                child, parent
            )));
        }
        Ok(())
    }

    /// True if `candidate` is `start` or one of its ancestors.
    fn is_ancestor(&self, candidate: ContextId, start: &Context) -> bool {
        let mut visited = HashSet::new();
        let mut stack = vec![start.id()];
        while let Some(id) = stack.pop() {
            if id == candidate {
                return true;
            }
            if !visited.insert(id) {
                continue;
            }
            if let Some(context) = self.context(id) {
                stack.extend(context.parents());
            }
        }
        false
    }

    // ---- exit ----

    /// Exits `context`: children are detached first (cascading to those left
    /// without parents), then listeners, filters and beans are released and
    /// the context leaves the graph. Returns `false` if it had already exited.
    pub fn exit(&self, context: &Context) -> bool {
        let Some(previous) = context.transition(LifecycleState::Exited) else {
            return false;
        };
        debug!(context = %context, ?previous, "exiting");

        // Wait out edge additions that validated before the transition.
        drop(self.inner.topology.lock());

        self.modules().broadcast(|m| m.pre_exit(self, context));
        self.notify(context, LifecycleEvent::PreExit(context.id()));

        for child in context.children().into_iter().filter_map(|id| self.context(id)) {
            self.remove_edge(context, &child, None);
        }

        self.modules().broadcast(|m| m.post_exit(self, context));
        self.notify(context, LifecycleEvent::PostExit(context.id()));

        let released = {
            let mut state = context.lock();
            state.listeners.clear();
            state.filters.clear();
            state.resolver = None;
            state.beans.take_all()
        };

        for parent in context.parents().into_iter().filter_map(|id| self.context(id)) {
            self.remove_edge(&parent, context, None);
        }

        self.inner.roots.write().retain(|id| *id != context.id());
        self.inner.contexts.write().remove(&context.id());
        trace!(context = %context, beans = released.len(), "context released");
        drop(released);
        true
    }

    /// Exits every root, most recent first, then anything still live.
    /// Returns the number of contexts that exited as a direct result.
    pub fn exit_all(&self) -> usize {
        let mut exited = 0;
        let roots: Vec<ContextId> = self.inner.roots.read().iter().rev().copied().collect();
        for root in roots.into_iter().filter_map(|id| self.context(id)) {
            if self.exit(&root) {
                exited += 1;
            }
        }
        let remaining: Vec<Context> = self.inner.contexts.read().values().cloned().collect();
        for context in remaining {
            if self.exit(&context) {
                exited += 1;
            }
        }
        exited
    }

    // ---- beans ----

    /// Adds `value` as the unnamed bean of its type, replacing any previous
    /// one. Returns `false` once the context has exited.
    pub fn add_bean<T: Any + Send + Sync>(&self, context: &Context, value: T) -> bool {
        self.insert_bean(context, BeanRef::new(value, None))
    }

    pub fn add_named_bean<T: Any + Send + Sync>(
        &self,
        context: &Context,
        key: impl Into<String>,
        value: T,
    ) -> bool {
        self.insert_bean(context, BeanRef::new(value, Some(key.into())))
    }

    fn insert_bean(&self, context: &Context, bean: BeanRef) -> bool {
        if context.is_exited() {
            debug!(context = %context, bean = ?bean, "ignoring bean on exited context");
            return false;
        }
        let occupied = context
            .lock()
            .beans
            .iter()
            .find(|b| b.same_slot(&bean))
            .cloned();
        if let Some(previous) = occupied {
            self.remove_bean_ref(context, &previous);
        }

        self.modules().broadcast(|m| m.pre_bean_add(self, context, &bean));
        {
            let mut state = context.lock();
            if state.lifecycle == LifecycleState::Exited {
                return false;
            }
            state.beans.insert_ref(bean.clone());
        }
        trace!(context = %context, bean = ?bean, "bean added");
        self.modules().broadcast(|m| m.post_bean_add(self, context, &bean));
        true
    }

    /// Resolves a bean of type `T`, searching `context` first and then its
    /// ancestors, nearest first.
    pub fn get_bean<T: Any + Send + Sync>(&self, context: &Context, key: Option<&str>) -> Option<Arc<T>> {
        let type_id = TypeId::of::<T>();
        let mut visited = HashSet::new();
        let mut queue = VecDeque::from([context.clone()]);

        while let Some(current) = queue.pop_front() {
            if !visited.insert(current.id()) {
                continue;
            }
            let (found, parents) = {
                let state = current.lock();
                (state.beans.find(type_id, key).cloned(), state.parents.clone())
            };
            if let Some(bean) = found {
                return bean.downcast::<T>();
            }
            queue.extend(parents.into_iter().filter_map(|id| self.context(id)));
        }
        None
    }

    /// Looks only at `context`'s own beans.
    pub fn get_local_bean<T: Any + Send + Sync>(&self, context: &Context, key: Option<&str>) -> Option<Arc<T>> {
        context
            .lock()
            .beans
            .find(TypeId::of::<T>(), key)
            .and_then(BeanRef::downcast::<T>)
    }

    pub fn get_bean_or_fail<T: Any + Send + Sync>(&self, context: &Context, key: Option<&str>) -> Result<Arc<T>> {
        self.get_bean::<T>(context, key)
            .ok_or_else(|| {
                let name = std::any::type_name::<T>();
                VibeError::BeanNotFound(match key {
                    Some(key) => format!("{} (key: {})", name, key),
                    None => name.to_string(),
                })
            })
            .with_context(context.id())
    }

    /// Removes the local bean of type `T` and returns it.
    pub fn remove_bean<T: Any + Send + Sync>(&self, context: &Context, key: Option<&str>) -> Option<Arc<T>> {
        let bean = context.lock().beans.find(TypeId::of::<T>(), key).cloned()?;
        if !self.remove_bean_ref(context, &bean) {
            return None;
        }
        bean.downcast::<T>()
    }

    fn remove_bean_ref(&self, context: &Context, bean: &BeanRef) -> bool {
        self.modules().broadcast(|m| m.pre_bean_remove(self, context, bean));
        let removed = context.lock().beans.remove_slot(bean);
        if removed.is_none() {
            return false;
        }
        trace!(context = %context, bean = ?bean, "bean removed");
        self.modules().broadcast(|m| m.post_bean_remove(self, context, bean));
        true
    }

    // ---- modules ----

    pub fn register_module<M: Module>(&self, module: M) -> Result<()> {
        self.register_module_with_id(module, None)
    }

    /// Registers `module`, overriding its metadata id when `id` is given.
    pub fn register_module_with_id<M: Module>(&self, module: M, id: Option<&str>) -> Result<()> {
        let label = id.map_or_else(|| module.metadata().id, str::to_string);
        self.inner.modules.register(module, id).with_module(&label)
    }

    /// Enables every registered module not yet enabled, in dependency order.
    pub async fn enable_modules(&self) -> Result<()> {
        self.inner.modules.enable_all(self).await
    }

    /// Disables enabled modules in reverse dependency order.
    pub async fn disable_modules(&self) -> Result<()> {
        self.inner.modules.disable_all(self).await
    }

    pub fn module<M: Module>(&self) -> Option<Arc<M>> {
        self.inner.modules.get::<M>()
    }

    pub fn module_by_id(&self, id: &str) -> Option<Arc<dyn Module>> {
        self.inner.modules.get_by_id(id)
    }

    pub fn require_module<M: Module>(&self) -> Result<Arc<M>> {
        self.module::<M>()
            .ok_or_else(|| VibeError::ModuleNotFound(std::any::type_name::<M>().to_string()))
    }

    pub fn module_state(&self, id: &str) -> Option<ModuleState> {
        self.inner.modules.state(id)
    }

    pub fn module_states(&self) -> Vec<(String, ModuleState)> {
        self.inner.modules.list()
    }

    // ---- hook fan-out ----

    fn fire_pre_enter(&self, context: &Context) {
        self.modules().broadcast(|m| m.pre_enter(self, context));
        self.notify(context, LifecycleEvent::PreEnter(context.id()));
    }

    fn fire_post_enter(&self, context: &Context) {
        self.modules().broadcast(|m| m.post_enter(self, context));
        self.notify(context, LifecycleEvent::PostEnter(context.id()));
    }

    fn fire_edge(&self, phase: EdgePhase, change: &EdgeChange, parent: &Context, child: &Context) {
        let event = match phase {
            EdgePhase::PreAdd => {
                self.modules().broadcast(|m| m.pre_edge_add(self, change));
                LifecycleEvent::PreEdgeAdd(*change)
            }
            EdgePhase::PostAdd => {
                self.modules().broadcast(|m| m.post_edge_add(self, change));
                LifecycleEvent::PostEdgeAdd(*change)
            }
            EdgePhase::PreRemove => {
                self.modules().broadcast(|m| m.pre_edge_remove(self, change));
                LifecycleEvent::PreEdgeRemove(*change)
            }
            EdgePhase::PostRemove => {
                self.modules().broadcast(|m| m.post_edge_remove(self, change));
                LifecycleEvent::PostEdgeRemove(*change)
            }
        };
        self.notify(parent, event);
        self.notify(child, event);
    }
}
