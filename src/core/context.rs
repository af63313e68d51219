//! Context nodes: identity, lifecycle state and graph edges

use std::any::Any;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use crate::core::bean::{BeanRef, BeanRegistry};
use crate::core::event::ListenerEntry;
use crate::core::filter::{FilterEntry, FilterResolver};
use crate::core::manager::ContextManager;
use crate::error::Result;

/// Stable handle of a context inside its manager's arena.
///
/// Ids grow monotonically and double as the global lock order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContextId(u64);

impl ContextId {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Initialized,
    Entered,
    Exited,
}

impl LifecycleState {
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        matches!(
            (self, next),
            (LifecycleState::Initialized, LifecycleState::Entered)
                | (LifecycleState::Initialized, LifecycleState::Exited)
                | (LifecycleState::Entered, LifecycleState::Exited)
        )
    }
}

/// A parent/child relation between two contexts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Edge {
    pub parent: ContextId,
    pub child: ContextId,
}

impl Edge {
    pub fn new(parent: ContextId, child: ContextId) -> Self {
        Self { parent, child }
    }
}

impl fmt::Display for Edge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.parent, self.child)
    }
}

/// An edge being added or removed, optionally relocating a previous edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EdgeChange {
    pub edge: Edge,
    pub replace: Option<Edge>,
}

impl EdgeChange {
    pub fn is_relocation(&self) -> bool {
        self.replace.is_some()
    }
}

pub(crate) struct NodeState {
    pub(crate) lifecycle: LifecycleState,
    pub(crate) parents: Vec<ContextId>,
    pub(crate) children: Vec<ContextId>,
    pub(crate) beans: BeanRegistry,
    pub(crate) listeners: Vec<Arc<ListenerEntry>>,
    pub(crate) filters: Vec<Arc<FilterEntry>>,
    pub(crate) resolver: Option<Arc<dyn FilterResolver>>,
    pub(crate) exit_if_no_parent: bool,
}

pub(crate) struct ContextNode {
    id: ContextId,
    key: Option<String>,
    owner_type: &'static str,
    state: Mutex<NodeState>,
}

/// Cheap, clonable handle to a node of the context graph
#[derive(Clone)]
pub struct Context {
    node: Arc<ContextNode>,
}

impl Context {
    pub(crate) fn new(
        id: ContextId,
        key: Option<String>,
        owner_type: &'static str,
        exit_if_no_parent: bool,
        resolver: Option<Arc<dyn FilterResolver>>,
    ) -> Self {
        Self {
            node: Arc::new(ContextNode {
                id,
                key,
                owner_type,
                state: Mutex::new(NodeState {
                    lifecycle: LifecycleState::Initialized,
                    parents: Vec::new(),
                    children: Vec::new(),
                    beans: BeanRegistry::new(),
                    listeners: Vec::new(),
                    filters: Vec::new(),
                    resolver,
                    exit_if_no_parent,
                }),
            }),
        }
    }

    pub fn id(&self) -> ContextId {
        self.node.id
    }

    pub fn key(&self) -> Option<&str> {
        self.node.key.as_deref()
    }

    /// Type name of the owner object the context was created for.
    pub fn owner_type(&self) -> &'static str {
        self.node.owner_type
    }

    pub fn state(&self) -> LifecycleState {
        self.lock().lifecycle
    }

    pub fn is_exited(&self) -> bool {
        self.state() == LifecycleState::Exited
    }

    pub fn parents(&self) -> Vec<ContextId> {
        self.lock().parents.clone()
    }

    pub fn children(&self) -> Vec<ContextId> {
        self.lock().children.clone()
    }

    pub fn has_parent(&self, parent: ContextId) -> bool {
        self.lock().parents.contains(&parent)
    }

    pub fn exit_if_no_parent(&self) -> bool {
        self.lock().exit_if_no_parent
    }

    pub fn set_exit_if_no_parent(&self, exit: bool) {
        self.lock().exit_if_no_parent = exit;
    }

    /// Installs the strategy combining parent filter results. Returns `false`
    /// once the context has exited.
    pub fn set_filter_resolver<R: FilterResolver + 'static>(&self, resolver: R) -> bool {
        let mut state = self.lock();
        if state.lifecycle == LifecycleState::Exited {
            return false;
        }
        state.resolver = Some(Arc::new(resolver));
        true
    }

    pub fn has_filter_resolver(&self) -> bool {
        self.lock().resolver.is_some()
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn filter_count(&self) -> usize {
        self.lock().filters.len()
    }

    pub fn bean_count(&self) -> usize {
        self.lock().beans.len()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, NodeState> {
        self.node.state.lock()
    }

    /// Single guarded transition point for the lifecycle state machine.
    /// Returns the previous state when the move was allowed.
    pub(crate) fn transition(&self, next: LifecycleState) -> Option<LifecycleState> {
        let mut state = self.lock();
        let previous = state.lifecycle;
        if !previous.can_transition_to(next) {
            return None;
        }
        state.lifecycle = next;
        Some(previous)
    }
}

/// Locks two distinct nodes in ascending id order, returned as (a, b).
pub(crate) fn lock_pair<'a>(
    a: &'a Context,
    b: &'a Context,
) -> (MutexGuard<'a, NodeState>, MutexGuard<'a, NodeState>) {
    debug_assert_ne!(a.id(), b.id());
    if a.id() < b.id() {
        let a_guard = a.lock();
        let b_guard = b.lock();
        (a_guard, b_guard)
    } else {
        let b_guard = b.lock();
        let a_guard = a.lock();
        (a_guard, b_guard)
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        self.id() == other.id()
    }
}

impl Eq for Context {}

impl Hash for Context {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id().hash(state);
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.id())
            .field("key", &self.key())
            .field("owner_type", &self.owner_type())
            .finish()
    }
}

impl fmt::Display for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key() {
            Some(key) => write!(f, "{}({})", self.id(), key),
            None => write!(f, "{}", self.id()),
        }
    }
}

/// Builder for contexts that need more than an owner and parents
pub struct ContextBuilder<'m> {
    manager: &'m ContextManager,
    pub(crate) owner: Option<BeanRef>,
    pub(crate) key: Option<String>,
    pub(crate) parents: Vec<Context>,
    pub(crate) resolver: Option<Arc<dyn FilterResolver>>,
    pub(crate) exit_if_no_parent: Option<bool>,
}

impl<'m> ContextBuilder<'m> {
    pub(crate) fn new(manager: &'m ContextManager) -> Self {
        Self {
            manager,
            owner: None,
            key: None,
            parents: Vec::new(),
            resolver: None,
            exit_if_no_parent: None,
        }
    }

    pub fn owner<T: Any + Send + Sync>(mut self, owner: T) -> Self {
        self.owner = Some(BeanRef::new(owner, None));
        self
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn parent(mut self, parent: &Context) -> Self {
        self.parents.push(parent.clone());
        self
    }

    pub fn parents<'c, I>(mut self, parents: I) -> Self
    where
        I: IntoIterator<Item = &'c Context>,
    {
        self.parents.extend(parents.into_iter().cloned());
        self
    }

    pub fn resolver<R: FilterResolver + 'static>(mut self, resolver: R) -> Self {
        self.resolver = Some(Arc::new(resolver));
        self
    }

    pub fn exit_if_no_parent(mut self, exit: bool) -> Self {
        self.exit_if_no_parent = Some(exit);
        self
    }

    pub fn create(self) -> Result<Context> {
        let manager = self.manager;
        manager.create_from_builder(self)
    }
}
