//! Runtime module: application, logging and module dispatch

pub mod app;
pub mod logging;
pub mod module_dispatcher;

pub use app::{AppBuilder, AppConfig, AppInfo, ScopeApp};
pub use logging::{init_logging, LoggingConfig};
pub use module_dispatcher::ModuleDispatcher;
