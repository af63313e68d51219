//! Application runtime

use crate::core::{Context, ContextManager, ManagerConfig, Module};
use crate::error::{Result, VibeError};
use crate::runtime::logging::{init_logging, LoggingConfig};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::time::{sleep, timeout, Duration};
use tracing::info;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub name: String,
    pub version: String,
    pub description: String,
    pub manager_config: ManagerConfig,
    pub logging: Option<LoggingConfig>,
    pub graceful_shutdown_timeout: Duration,
    pub enable_signal_handling: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "VibeScopeApp".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            description: String::new(),
            manager_config: ManagerConfig::default(),
            logging: None,
            graceful_shutdown_timeout: Duration::from_secs(30),
            enable_signal_handling: true,
        }
    }
}

impl AppConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_description(mut self, desc: impl Into<String>) -> Self {
        self.description = desc.into();
        self
    }

    pub fn with_manager_config(mut self, config: ManagerConfig) -> Self {
        self.manager_config = config;
        self
    }

    pub fn with_logging(mut self, logging: LoggingConfig) -> Self {
        self.logging = Some(logging);
        self
    }

    pub fn with_graceful_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.graceful_shutdown_timeout = timeout;
        self
    }

    pub fn with_signal_handling(mut self, enable: bool) -> Self {
        self.enable_signal_handling = enable;
        self
    }
}

/// Owner of the application's root context, resolvable as a bean from
/// every context below it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppInfo {
    pub name: String,
    pub version: String,
}

type Registration = Box<dyn FnOnce(&ContextManager) -> Result<()> + Send>;

pub struct AppBuilder {
    config: Option<AppConfig>,
    modules: Vec<Registration>,
}

impl AppBuilder {
    pub fn new() -> Self {
        Self {
            config: None,
            modules: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    pub fn add_module<M: Module>(mut self, module: M) -> Self {
        self.modules
            .push(Box::new(move |manager| manager.register_module(module)));
        self
    }

    pub fn add_module_with_id<M: Module>(mut self, module: M, id: impl Into<String>) -> Self {
        let id = id.into();
        self.modules.push(Box::new(move |manager| {
            manager.register_module_with_id(module, Some(id.as_str()))
        }));
        self
    }

    pub async fn build(mut self) -> Result<ScopeApp> {
        let config = self.config.take().unwrap_or_default();
        if let Some(logging) = &config.logging {
            init_logging(logging)?;
        }

        let manager = ContextManager::with_config(config.manager_config.clone());
        for register in self.modules {
            register(&manager)?;
        }

        Ok(ScopeApp {
            config,
            manager,
            root: Mutex::new(None),
            is_running: Arc::new(tokio::sync::RwLock::new(false)),
        })
    }
}

impl Default for AppBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub struct ScopeApp {
    config: AppConfig,
    manager: ContextManager,
    root: Mutex<Option<Context>>,
    is_running: Arc<tokio::sync::RwLock<bool>>,
}

impl ScopeApp {
    pub fn build() -> AppBuilder {
        AppBuilder::new()
    }

    /// Enables modules and enters the application root context.
    pub async fn start(&self) -> Result<Context> {
        let mut running = self.is_running.write().await;
        if *running {
            return Err(VibeError::Runtime("Application already running".to_string()));
        }

        self.manager.enable_modules().await?;
        let info = AppInfo {
            name: self.config.name.clone(),
            version: self.config.version.clone(),
        };
        let root = self.manager.enter_root(info, Some(self.config.name.as_str()))?;
        *self.root.lock() = Some(root.clone());
        *running = true;

        info!(app = %self.config.name, version = %self.config.version, root = %root, "application started");
        Ok(root)
    }

    /// Starts, then waits for a termination signal if signal handling is on.
    pub async fn run(&self) -> Result<()> {
        self.start().await?;

        if self.config.enable_signal_handling {
            self.wait_for_shutdown().await?;
        }

        Ok(())
    }

    async fn wait_for_shutdown(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sigint = signal(SignalKind::interrupt())?;
            let mut sigterm = signal(SignalKind::terminate())?;

            tokio::select! {
                _ = sigint.recv() => {}
                _ = sigterm.recv() => {}
            }
        }

        #[cfg(windows)]
        {
            use tokio::signal::ctrl_c;

            ctrl_c()
                .await
                .map_err(|e| VibeError::Runtime(format!("Signal error: {}", e)))?;
        }

        info!(app = %self.config.name, "shutdown signal received");
        self.shutdown().await
    }

    /// Exits every live context, then disables modules.
    pub async fn shutdown(&self) -> Result<()> {
        {
            let running = self.is_running.read().await;
            if !*running {
                return Ok(());
            }
        }

        let exited = self.manager.exit_all();
        self.root.lock().take();
        self.manager.disable_modules().await?;

        let mut running = self.is_running.write().await;
        *running = false;

        info!(app = %self.config.name, exited, "application stopped");
        Ok(())
    }

    pub async fn force_shutdown(&self) -> Result<()> {
        match timeout(self.config.graceful_shutdown_timeout, self.shutdown()).await {
            Ok(result) => result,
            Err(_) => Err(VibeError::Timeout("Shutdown timeout".to_string())),
        }
    }

    /// Root context while the application is running.
    pub fn root(&self) -> Option<Context> {
        self.root.lock().clone()
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn manager(&self) -> &ContextManager {
        &self.manager
    }

    pub async fn is_running(&self) -> bool {
        *self.is_running.read().await
    }

    pub async fn wait_until_started(&self, timeout: Duration) -> Result<()> {
        let start = std::time::Instant::now();

        while start.elapsed() < timeout {
            if *self.is_running.read().await {
                return Ok(());
            }
            sleep(Duration::from_millis(10)).await;
        }

        Err(VibeError::Timeout(
            "Application failed to start within timeout".to_string(),
        ))
    }
}
