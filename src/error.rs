//! Error handling system

use thiserror::Error;

use crate::core::context::ContextId;

#[derive(Error, Debug)]
pub enum VibeError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Listener '{listener}' failed handling {event_type} in context {context}: {source}")]
    Listener {
        listener: String,
        event_type: &'static str,
        context: ContextId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Filter '{filter}' failed checking {value_type} in context {context}: {source}")]
    Filter {
        filter: String,
        value_type: &'static str,
        context: ContextId,
        #[source]
        source: anyhow::Error,
    },

    #[error("Context {0} has already exited")]
    ContextExited(ContextId),

    #[error("Bean not found: {0}")]
    BeanNotFound(String),

    #[error("Module not found: {0}")]
    ModuleNotFound(String),

    #[error("Module '{module}' failed during {phase}: {message}")]
    ModuleError {
        module: String,
        phase: &'static str,
        message: String,
    },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, VibeError>;

pub trait ResultExt<T> {
    fn with_module(self, module: &str) -> Result<T>;
    fn with_context(self, context: ContextId) -> Result<T>;
}

impl<T> ResultExt<T> for Result<T> {
    fn with_module(self, module: &str) -> Result<T> {
        self.map_err(|e| match e {
            VibeError::Configuration(msg) => {
                VibeError::Configuration(format!("{} [module: {}]", msg, module))
            }
            VibeError::ModuleError { phase, message, .. } => VibeError::ModuleError {
                module: module.to_string(),
                phase,
                message,
            },
            other => VibeError::ModuleError {
                module: module.to_string(),
                phase: "unknown",
                message: other.to_string(),
            },
        })
    }

    fn with_context(self, context: ContextId) -> Result<T> {
        self.map_err(|e| match e {
            VibeError::Configuration(msg) => {
                VibeError::Configuration(format!("{} [context: {}]", msg, context))
            }
            VibeError::BeanNotFound(msg) => {
                VibeError::BeanNotFound(format!("{} [context: {}]", msg, context))
            }
            other => other,
        })
    }
}

impl From<std::io::Error> for VibeError {
    fn from(error: std::io::Error) -> Self {
        VibeError::Io(error.to_string())
    }
}

impl VibeError {
    pub fn is_configuration(&self) -> bool {
        matches!(self, VibeError::Configuration(_))
    }
}
