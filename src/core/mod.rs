//! Core module: context graph, events, filters, beans and modules

pub mod bean;
pub mod context;
pub mod event;
pub mod filter;
pub mod manager;
pub mod module;

pub use bean::{BeanRef, BeanRegistry, BeanValue};
pub use context::{Context, ContextBuilder, ContextId, Edge, EdgeChange, LifecycleState};
pub use event::{EventContext, EventScope, LifecycleEvent, ListenerId, ListenerOptions, Priority};
pub use filter::{BuiltinResolver, FilterCache, FilterContext, FilterId, FilterOptions, FilterResolver};
pub use manager::{ContextManager, ManagerConfig};
pub use module::{Module, ModuleDependency, ModuleMetadata, ModuleState};
