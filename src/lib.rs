//! Vibe Scope - hierarchical contexts with bubbling events
//!
//! A directed acyclic graph of lifecycle-managed contexts. Events published at
//! a context bubble leaf to root, filters combine verdicts from multiple
//! parents, beans resolve from the nearest ancestor, and modules observe every
//! transition.

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod core;
pub mod error;
pub mod modules;
pub mod runtime;

pub mod prelude {
    //! Commonly used types and traits

    pub use crate::core::{BeanRef, BeanRegistry, Context, ContextId, ContextManager, ManagerConfig};
    pub use crate::core::{BuiltinResolver, FilterContext, FilterOptions, FilterResolver};
    pub use crate::core::{Edge, EdgeChange, LifecycleEvent, LifecycleState};
    pub use crate::core::{EventContext, EventScope, ListenerOptions, Priority};
    pub use crate::core::{Module, ModuleMetadata, ModuleState};
    pub use crate::error::{Result, ResultExt, VibeError};
    pub use crate::modules::{TimerModule, TraceModule};
    pub use crate::runtime::{AppBuilder, AppConfig, AppInfo, LoggingConfig, ScopeApp};
    pub use async_trait::async_trait;
}

pub use crate::core::{Context, ContextManager, Module};
pub use crate::error::{Result, VibeError};
pub use crate::runtime::ScopeApp;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn build_info() -> String {
    format!("Vibe Scope {}", VERSION)
}
