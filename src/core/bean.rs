//! Bean registry: typed and keyed objects attached to a context

use std::any::{Any, TypeId};
use std::fmt;
use std::sync::Arc;

/// Type-erased bean payload
pub type BeanValue = Arc<dyn Any + Send + Sync>;

/// A bean together with the type and key it was registered under
#[derive(Clone)]
pub struct BeanRef {
    type_id: TypeId,
    type_name: &'static str,
    key: Option<String>,
    value: BeanValue,
}

impl BeanRef {
    pub fn new<T: Any + Send + Sync>(value: T, key: Option<String>) -> Self {
        Self::from_arc(Arc::new(value), key)
    }

    pub fn from_arc<T: Any + Send + Sync>(value: Arc<T>, key: Option<String>) -> Self {
        Self {
            type_id: TypeId::of::<T>(),
            type_name: std::any::type_name::<T>(),
            key,
            value,
        }
    }

    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn value(&self) -> &BeanValue {
        &self.value
    }

    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    pub fn downcast<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        Arc::clone(&self.value).downcast::<T>().ok()
    }

    /// An absent `key` matches beans under any key.
    pub(crate) fn matches(&self, type_id: TypeId, key: Option<&str>) -> bool {
        self.type_id == type_id && key.map_or(true, |k| self.key.as_deref() == Some(k))
    }

    pub(crate) fn same_slot(&self, other: &BeanRef) -> bool {
        self.type_id == other.type_id && self.key == other.key
    }
}

impl fmt::Debug for BeanRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BeanRef")
            .field("type_name", &self.type_name)
            .field("key", &self.key)
            .finish()
    }
}

/// Type-safe bean container
///
/// Each (type, key) slot holds at most one bean. Lookups without a key return
/// the earliest registered bean of the requested type.
#[derive(Default, Clone)]
pub struct BeanRegistry {
    beans: Vec<BeanRef>,
}

impl BeanRegistry {
    pub fn new() -> Self {
        Self { beans: Vec::new() }
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<BeanRef> {
        self.insert_ref(BeanRef::new(value, None))
    }

    pub fn insert_named<T: Any + Send + Sync>(
        &mut self,
        key: impl Into<String>,
        value: T,
    ) -> Option<BeanRef> {
        self.insert_ref(BeanRef::new(value, Some(key.into())))
    }

    /// Stores `bean`, returning whatever previously occupied its slot.
    pub fn insert_ref(&mut self, bean: BeanRef) -> Option<BeanRef> {
        if let Some(existing) = self.beans.iter_mut().find(|b| b.same_slot(&bean)) {
            return Some(std::mem::replace(existing, bean));
        }
        self.beans.push(bean);
        None
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        self.find(TypeId::of::<T>(), None)
            .and_then(BeanRef::downcast::<T>)
    }

    pub fn get_named<T: Any + Send + Sync>(&self, key: &str) -> Option<Arc<T>> {
        self.find(TypeId::of::<T>(), Some(key))
            .and_then(BeanRef::downcast::<T>)
    }

    pub(crate) fn find(&self, type_id: TypeId, key: Option<&str>) -> Option<&BeanRef> {
        self.beans.iter().find(|b| b.matches(type_id, key))
    }

    pub fn contains<T: Any>(&self) -> bool {
        self.find(TypeId::of::<T>(), None).is_some()
    }

    pub fn remove<T: Any + Send + Sync>(&mut self, key: Option<&str>) -> Option<BeanRef> {
        self.remove_matching(TypeId::of::<T>(), key)
    }

    pub(crate) fn remove_matching(&mut self, type_id: TypeId, key: Option<&str>) -> Option<BeanRef> {
        let index = self.beans.iter().position(|b| b.matches(type_id, key))?;
        Some(self.beans.remove(index))
    }

    /// Removes the bean occupying exactly `bean`'s (type, key) slot.
    pub(crate) fn remove_slot(&mut self, bean: &BeanRef) -> Option<BeanRef> {
        let index = self.beans.iter().position(|b| b.same_slot(bean))?;
        Some(self.beans.remove(index))
    }

    pub(crate) fn take_all(&mut self) -> Vec<BeanRef> {
        std::mem::take(&mut self.beans)
    }

    pub fn iter(&self) -> impl Iterator<Item = &BeanRef> {
        self.beans.iter()
    }

    pub fn len(&self) -> usize {
        self.beans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.beans.is_empty()
    }
}

impl fmt::Debug for BeanRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.beans.iter()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Database {
        url: String,
    }

    #[test]
    fn test_insert_and_get() {
        let mut registry = BeanRegistry::new();
        registry.insert(42_i32);
        registry.insert(Database { url: "mem://".to_string() });

        assert_eq!(registry.get::<i32>().as_deref(), Some(&42));
        assert_eq!(registry.get::<Database>().unwrap().url, "mem://");
        assert!(registry.get::<String>().is_none());
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_same_slot_is_replaced() {
        let mut registry = BeanRegistry::new();
        assert!(registry.insert(1_u8).is_none());
        let previous = registry.insert(2_u8).unwrap();

        assert_eq!(previous.downcast::<u8>().as_deref(), Some(&1));
        assert_eq!(registry.get::<u8>().as_deref(), Some(&2));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_named_beans() {
        let mut registry = BeanRegistry::new();
        registry.insert_named("primary", "a".to_string());
        registry.insert_named("replica", "b".to_string());

        assert_eq!(registry.get_named::<String>("replica").as_deref().map(String::as_str), Some("b"));
        // Unkeyed lookups fall back to the earliest registration.
        assert_eq!(registry.get::<String>().as_deref().map(String::as_str), Some("a"));
        assert!(registry.get_named::<String>("missing").is_none());
    }

    #[test]
    fn test_remove() {
        let mut registry = BeanRegistry::new();
        registry.insert_named("x", 5_u64);
        assert!(registry.remove::<u64>(Some("y")).is_none());

        let removed = registry.remove::<u64>(Some("x")).unwrap();
        assert_eq!(removed.key(), Some("x"));
        assert!(removed.is::<u64>());
        assert!(registry.is_empty());
    }
}
