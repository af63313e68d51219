//! Filter system: admission checks resolved through a context's ancestry
//!
//! A check starts at a context and consults its own filters first. When none
//! of them is conclusive the decision is taken from the parents: passed
//! straight through for a single parent, or combined by the context's
//! [`FilterResolver`] when several parents are attached.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::{debug, error, trace, warn};

use crate::core::context::{Context, LifecycleState};
use crate::core::event::panic_error;
use crate::core::manager::ContextManager;
use crate::error::VibeError;

/// Combines the filter results of several parent contexts into one.
pub trait FilterResolver: Send + Sync {
    /// `evaluate` resolves a single parent; implementations may stop early.
    fn resolve(
        &self,
        parents: &[Context],
        evaluate: &mut dyn FnMut(&Context) -> Option<bool>,
    ) -> Option<bool>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuiltinResolver {
    /// Every parent must be non-false; any `false` blocks.
    All,
    /// A single non-false parent admits.
    Any,
    /// Always inconclusive.
    Null,
}

impl FilterResolver for BuiltinResolver {
    fn resolve(
        &self,
        parents: &[Context],
        evaluate: &mut dyn FnMut(&Context) -> Option<bool>,
    ) -> Option<bool> {
        match self {
            BuiltinResolver::All => {
                let mut admitted = false;
                for parent in parents {
                    match evaluate(parent) {
                        Some(false) => return Some(false),
                        Some(true) => admitted = true,
                        None => {}
                    }
                }
                admitted.then_some(true)
            }
            BuiltinResolver::Any => {
                let mut inconclusive = false;
                for parent in parents {
                    match evaluate(parent) {
                        Some(true) => return Some(true),
                        None => inconclusive = true,
                        Some(false) => {}
                    }
                }
                if inconclusive || parents.is_empty() {
                    None
                } else {
                    Some(false)
                }
            }
            BuiltinResolver::Null => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            BuiltinResolver::All => "all",
            BuiltinResolver::Any => "any",
            BuiltinResolver::Null => "null",
        }
    }
}

static NEXT_FILTER_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FilterId(u64);

impl FilterId {
    fn next() -> Self {
        Self(NEXT_FILTER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for FilterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "filter-{}", self.0)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FilterOptions {
    pub name: Option<String>,
    pub cache: bool,
}

impl FilterOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    /// Memoise the verdict for the rest of the current check.
    pub fn with_cache(mut self, cache: bool) -> Self {
        self.cache = cache;
        self
    }
}

type FilterFn = Box<dyn Fn(&dyn Any, &Context) -> anyhow::Result<Option<bool>> + Send + Sync>;

pub(crate) struct FilterEntry {
    id: FilterId,
    name: String,
    value_type: Option<(TypeId, &'static str)>,
    cache: bool,
    predicate: FilterFn,
}

impl FilterEntry {
    fn accepts(&self, value: &dyn Any) -> bool {
        self.value_type.map_or(true, |(t, _)| value.type_id() == t)
    }
}

/// Verdicts of cached filters, keyed by filter identity
#[derive(Debug, Default, Clone)]
pub struct FilterCache {
    verdicts: HashMap<FilterId, Option<bool>>,
}

impl FilterCache {
    pub fn get(&self, id: FilterId) -> Option<Option<bool>> {
        self.verdicts.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.verdicts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.verdicts.is_empty()
    }
}

/// Outcome of one admission check
pub struct FilterContext<T> {
    value: T,
    context: Context,
    result: Option<bool>,
    cache: FilterCache,
}

impl<T> FilterContext<T> {
    pub fn value(&self) -> &T {
        &self.value
    }

    pub fn into_value(self) -> T {
        self.value
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// `None` means no filter was conclusive.
    pub fn result(&self) -> Option<bool> {
        self.result
    }

    pub fn set_result(&mut self, result: Option<bool>) {
        self.result = result;
    }

    /// Inconclusive checks admit.
    pub fn is_allowed(&self) -> bool {
        self.result != Some(false)
    }

    pub fn cache(&self) -> &FilterCache {
        &self.cache
    }
}

impl ContextManager {
    pub fn register_filter<T, F>(
        &self,
        context: &Context,
        options: FilterOptions,
        predicate: F,
    ) -> Option<FilterId>
    where
        T: Any,
        F: Fn(&T, &Context) -> anyhow::Result<Option<bool>> + Send + Sync + 'static,
    {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<F>().to_string());
        let predicate: FilterFn = Box::new(move |value: &dyn Any, context: &Context| {
            match value.downcast_ref::<T>() {
                Some(value) => predicate(value, context),
                None => Ok(None),
            }
        });
        let value_type = (TypeId::of::<T>(), std::any::type_name::<T>());
        self.insert_filter(context, name, Some(value_type), options.cache, predicate)
    }

    /// Registers a filter consulted for values of every type.
    pub fn register_any_filter<F>(
        &self,
        context: &Context,
        options: FilterOptions,
        predicate: F,
    ) -> Option<FilterId>
    where
        F: Fn(&dyn Any, &Context) -> anyhow::Result<Option<bool>> + Send + Sync + 'static,
    {
        let name = options
            .name
            .clone()
            .unwrap_or_else(|| std::any::type_name::<F>().to_string());
        self.insert_filter(context, name, None, options.cache, Box::new(predicate))
    }

    fn insert_filter(
        &self,
        context: &Context,
        name: String,
        value_type: Option<(TypeId, &'static str)>,
        cache: bool,
        predicate: FilterFn,
    ) -> Option<FilterId> {
        let mut state = context.lock();
        if state.lifecycle == LifecycleState::Exited {
            debug!(context = %context, filter = %name, "ignoring filter on exited context");
            return None;
        }
        let id = FilterId::next();
        trace!(context = %context, filter = %name, cache, "registering filter");
        state.filters.push(Arc::new(FilterEntry {
            id,
            name,
            value_type,
            cache,
            predicate,
        }));
        Some(id)
    }

    pub fn unregister_filter(&self, context: &Context, id: FilterId) -> bool {
        let mut state = context.lock();
        let before = state.filters.len();
        state.filters.retain(|f| f.id != id);
        state.filters.len() != before
    }

    pub fn filter<T: Any>(&self, context: &Context, value: T) -> FilterContext<T> {
        let mut cache = FilterCache::default();
        let result = self.resolve_filter(context, &value, &mut cache);
        trace!(context = %context, value_type = std::any::type_name::<T>(), ?result, "filter resolved");
        FilterContext {
            value,
            context: context.clone(),
            result,
            cache,
        }
    }

    /// Re-runs a check, reusing the verdicts its cached filters produced.
    pub fn replay_filter<T: Any>(&self, check: &mut FilterContext<T>) -> Option<bool> {
        let context = check.context.clone();
        check.result = self.resolve_filter(&context, &check.value, &mut check.cache);
        check.result
    }

    pub(crate) fn resolve_filter(
        &self,
        context: &Context,
        value: &dyn Any,
        cache: &mut FilterCache,
    ) -> Option<bool> {
        let (filters, parent_ids, resolver) = {
            let state = context.lock();
            (state.filters.clone(), state.parents.clone(), state.resolver.clone())
        };

        for filter in filters.iter().filter(|f| f.accepts(value)) {
            let verdict = if filter.cache {
                match cache.get(filter.id) {
                    Some(verdict) => verdict,
                    None => {
                        let verdict = self.run_filter(filter, context, value);
                        cache.verdicts.insert(filter.id, verdict);
                        verdict
                    }
                }
            } else {
                self.run_filter(filter, context, value)
            };
            if verdict.is_some() {
                return verdict;
            }
        }

        let parents: Vec<Context> = parent_ids
            .into_iter()
            .filter_map(|id| self.context(id))
            .collect();
        match (resolver, parents.as_slice()) {
            (Some(resolver), _) => {
                resolver.resolve(&parents, &mut |parent: &Context| {
                    self.resolve_filter(parent, value, cache)
                })
            }
            (None, []) => None,
            (None, [parent]) => self.resolve_filter(parent, value, cache),
            (None, _) => {
                warn!(context = %context, parents = parents.len(), "multiple parents without a filter resolver");
                None
            }
        }
    }

    fn run_filter(&self, filter: &FilterEntry, context: &Context, value: &dyn Any) -> Option<bool> {
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| (filter.predicate)(value, context)))
            .unwrap_or_else(|payload| Err(panic_error(payload.as_ref())));
        match outcome {
            Ok(verdict) => verdict,
            Err(source) => {
                let err = VibeError::Filter {
                    filter: filter.name.clone(),
                    value_type: filter.value_type.map_or("any", |(_, name)| name),
                    context: context.id(),
                    source,
                };
                error!(error = %err, "filter failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Join(&'static str);

    fn verdicts(values: &[Option<bool>]) -> (Vec<Context>, Vec<Option<bool>>) {
        let parents = (0..values.len())
            .map(|i| {
                Context::new(
                    crate::core::context::ContextId::from_raw(i as u64 + 100),
                    None,
                    "parent",
                    true,
                    None,
                )
            })
            .collect();
        (parents, values.to_vec())
    }

    fn run(resolver: BuiltinResolver, values: &[Option<bool>]) -> Option<bool> {
        let (parents, results) = verdicts(values);
        let mut evaluate = |parent: &Context| {
            let index = (parent.id().as_raw() - 100) as usize;
            results[index]
        };
        resolver.resolve(&parents, &mut evaluate)
    }

    #[test]
    fn test_builtin_all() {
        assert_eq!(run(BuiltinResolver::All, &[Some(false), Some(true)]), Some(false));
        assert_eq!(run(BuiltinResolver::All, &[Some(true), None]), Some(true));
        assert_eq!(run(BuiltinResolver::All, &[None, None]), None);
        assert_eq!(run(BuiltinResolver::All, &[]), None);
    }

    #[test]
    fn test_builtin_any() {
        assert_eq!(run(BuiltinResolver::Any, &[Some(false), Some(true)]), Some(true));
        assert_eq!(run(BuiltinResolver::Any, &[Some(false), Some(false)]), Some(false));
        assert_eq!(run(BuiltinResolver::Any, &[Some(false), None]), None);
        assert_eq!(run(BuiltinResolver::Any, &[]), None);
    }

    #[test]
    fn test_builtin_null() {
        assert_eq!(run(BuiltinResolver::Null, &[Some(false), Some(true)]), None);
    }

    #[test]
    fn test_local_filter_wins_in_registration_order() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();

        manager.register_filter(&root, FilterOptions::named("abstain"), |_: &Join, _| Ok(None));
        manager.register_filter(&root, FilterOptions::named("deny"), |_: &Join, _| Ok(Some(false)));
        manager.register_filter(&root, FilterOptions::named("allow"), |_: &Join, _| Ok(Some(true)));

        let check = manager.filter(&root, Join("x"));
        assert_eq!(check.result(), Some(false));
        assert!(!check.is_allowed());
    }

    #[test]
    fn test_inconclusive_allows() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let check = manager.filter(&root, Join("x"));
        assert_eq!(check.result(), None);
        assert!(check.is_allowed());
    }

    #[test]
    fn test_single_parent_pass_through() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();
        manager.register_filter(&root, FilterOptions::new(), |join: &Join, _| {
            Ok(Some(join.0.starts_with("vip")))
        });

        assert_eq!(manager.filter(&child, Join("vip-alice")).result(), Some(true));
        assert_eq!(manager.filter(&child, Join("bob")).result(), Some(false));
    }

    #[test]
    fn test_typed_filter_ignores_other_types() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        manager.register_filter(&root, FilterOptions::new(), |_: &Join, _| Ok(Some(false)));

        assert_eq!(manager.filter(&root, 5_u32).result(), None);

        manager.register_any_filter(&root, FilterOptions::new(), |value, _| {
            Ok(value.downcast_ref::<u32>().map(|v| *v > 3))
        });
        assert_eq!(manager.filter(&root, 5_u32).result(), Some(true));
    }

    #[test]
    fn test_multi_parent_all_resolver() {
        let manager = ContextManager::new();
        let p1 = manager.enter_root("p1", None).unwrap();
        let p2 = manager.enter_root("p2", None).unwrap();
        manager.register_filter(&p1, FilterOptions::new(), |_: &Join, _| Ok(Some(false)));
        manager.register_filter(&p2, FilterOptions::new(), |_: &Join, _| Ok(Some(true)));

        let x = manager
            .build_context()
            .owner("x")
            .parent(&p1)
            .parent(&p2)
            .resolver(BuiltinResolver::All)
            .create()
            .unwrap();
        assert_eq!(manager.filter(&x, Join("x")).result(), Some(false));

        x.set_filter_resolver(BuiltinResolver::Any);
        assert_eq!(manager.filter(&x, Join("x")).result(), Some(true));
    }

    #[test]
    fn test_cached_filter_runs_once_per_check() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let left = manager.enter_child(&root, "left", None).unwrap();
        let right = manager.enter_child(&root, "right", None).unwrap();
        let leaf = manager
            .build_context()
            .owner("leaf")
            .parents([&left, &right])
            .resolver(BuiltinResolver::All)
            .create()
            .unwrap();

        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        manager.register_filter(&root, FilterOptions::new().with_cache(true), move |_: &Join, _| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Some(true))
        });

        let mut check = manager.filter(&leaf, Join("diamond"));
        assert_eq!(check.result(), Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(check.cache().len(), 1);

        assert_eq!(manager.replay_filter(&mut check), Some(true));
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        manager.filter(&leaf, Join("fresh"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_failing_filter_is_inconclusive() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        manager.register_filter(&root, FilterOptions::named("broken"), |_: &Join, _| {
            Err(anyhow::anyhow!("filter exploded"))
        });
        manager.register_filter(&root, FilterOptions::new(), |_: &Join, _| Ok(Some(true)));

        assert_eq!(manager.filter(&root, Join("x")).result(), Some(true));
    }

    #[test]
    fn test_panicking_filter_is_inconclusive() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let child = manager.enter_child(&root, "child", None).unwrap();
        manager.register_filter(&child, FilterOptions::named("panics"), |_: &Join, _| {
            panic!("filter bug");
        });
        manager.register_filter(&root, FilterOptions::new(), |_: &Join, _| Ok(Some(false)));

        assert_eq!(manager.filter(&child, Join("x")).result(), Some(false));
    }

    #[test]
    fn test_unregister_filter() {
        let manager = ContextManager::new();
        let root = manager.enter_root("root", None).unwrap();
        let id = manager
            .register_filter(&root, FilterOptions::new(), |_: &Join, _| Ok(Some(false)))
            .unwrap();
        assert!(manager.unregister_filter(&root, id));
        assert_eq!(manager.filter(&root, Join("x")).result(), None);
        assert_eq!(root.filter_count(), 0);
    }
}
