//! Module system: cross-cutting extensions observing every lifecycle hook

use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::fmt;

use crate::core::bean::BeanRef;
use crate::core::context::{Context, EdgeChange};
use crate::core::event::EventScope;
use crate::core::manager::ContextManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Registered,
    Enabled,
    Disabled,
    Failed,
}

/// A module another module must be enabled after
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleDependency {
    Id(String),
    Type { type_id: TypeId, name: &'static str },
}

impl ModuleDependency {
    pub fn of<M: Module>() -> Self {
        ModuleDependency::Type {
            type_id: TypeId::of::<M>(),
            name: std::any::type_name::<M>(),
        }
    }
}

impl fmt::Display for ModuleDependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleDependency::Id(id) => write!(f, "{}", id),
            ModuleDependency::Type { name, .. } => write!(f, "{}", name),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ModuleMetadata {
    pub id: String,
    pub description: String,
    pub dependencies: Vec<ModuleDependency>,
}

impl ModuleMetadata {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: String::new(),
            dependencies: Vec::new(),
        }
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.dependencies.push(ModuleDependency::Id(id.into()));
        self
    }

    pub fn depends_on_type<M: Module>(mut self) -> Self {
        self.dependencies.push(ModuleDependency::of::<M>());
        self
    }
}

/// Module trait
///
/// Enable and disable phases are async so the dispatcher can bound them with a
/// timeout. Every other hook runs synchronously on the thread performing the
/// transition, in enable order, and must not block.
#[async_trait]
pub trait Module: Any + Send + Sync {
    fn metadata(&self) -> ModuleMetadata;

    async fn pre_enable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_enable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        Ok(())
    }

    async fn pre_disable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        Ok(())
    }

    async fn post_disable(&self, _manager: &ContextManager) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_init(&self, _manager: &ContextManager, _context: &Context) {}

    fn pre_enter(&self, _manager: &ContextManager, _context: &Context) {}

    fn post_enter(&self, _manager: &ContextManager, _context: &Context) {}

    fn pre_exit(&self, _manager: &ContextManager, _context: &Context) {}

    fn post_exit(&self, _manager: &ContextManager, _context: &Context) {}

    fn pre_edge_add(&self, _manager: &ContextManager, _change: &EdgeChange) {}

    fn post_edge_add(&self, _manager: &ContextManager, _change: &EdgeChange) {}

    fn pre_edge_remove(&self, _manager: &ContextManager, _change: &EdgeChange) {}

    fn post_edge_remove(&self, _manager: &ContextManager, _change: &EdgeChange) {}

    fn pre_bean_add(&self, _manager: &ContextManager, _context: &Context, _bean: &BeanRef) {}

    fn post_bean_add(&self, _manager: &ContextManager, _context: &Context, _bean: &BeanRef) {}

    fn pre_bean_remove(&self, _manager: &ContextManager, _context: &Context, _bean: &BeanRef) {}

    fn post_bean_remove(&self, _manager: &ContextManager, _context: &Context, _bean: &BeanRef) {}

    fn pre_publish(&self, _manager: &ContextManager, _origin: &Context, _value: &dyn Any) {}

    fn post_publish(
        &self,
        _manager: &ContextManager,
        _origin: &Context,
        _value: &dyn Any,
        _scope: &EventScope,
    ) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestModule;

    #[async_trait]
    impl Module for TestModule {
        fn metadata(&self) -> ModuleMetadata {
            ModuleMetadata::new("test").with_description("A test module")
        }
    }

    #[test]
    fn test_module_metadata_builder() {
        let meta = ModuleMetadata::new("sessions")
            .with_description("Session tracking")
            .depends_on("timer")
            .depends_on_type::<TestModule>();

        assert_eq!(meta.id, "sessions");
        assert_eq!(meta.description, "Session tracking");
        assert_eq!(meta.dependencies.len(), 2);
        assert_eq!(meta.dependencies[0], ModuleDependency::Id("timer".to_string()));
        assert_eq!(meta.dependencies[1], ModuleDependency::of::<TestModule>());
        assert!(meta.dependencies[1].to_string().ends_with("TestModule"));
    }

    #[tokio::test]
    async fn test_default_phases_succeed() {
        let manager = ContextManager::new();
        let module = TestModule;
        assert!(module.pre_enable(&manager).await.is_ok());
        assert!(module.post_disable(&manager).await.is_ok());
        assert_eq!(module.metadata().id, "test");
    }
}
