//! Module dispatcher: dependency ordering, enable/disable and hook broadcast

use crate::core::module::{Module, ModuleDependency, ModuleState};
use crate::core::ContextManager;
use crate::error::{Result, VibeError};
use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

struct ModuleEntry {
    id: String,
    type_id: TypeId,
    type_name: &'static str,
    dependencies: Vec<ModuleDependency>,
    module: Arc<dyn Module>,
    instance: Arc<dyn Any + Send + Sync>,
    state: ModuleState,
}

pub struct ModuleDispatcher {
    /// Registered modules, kept in dependency order.
    entries: RwLock<Vec<ModuleEntry>>,
    /// Hook recipients in enable order.
    enabled: RwLock<Arc<Vec<Arc<dyn Module>>>>,
    timeout: Duration,
    continue_on_failure: bool,
}

impl ModuleDispatcher {
    pub fn new(timeout: Duration, continue_on_failure: bool) -> Self {
        Self {
            entries: RwLock::new(Vec::new()),
            enabled: RwLock::new(Arc::new(Vec::new())),
            timeout,
            continue_on_failure,
        }
    }

    /// Adds a module and recomputes the enable order. On a duplicate id, a
    /// missing dependency or a dependency cycle nothing is registered.
    pub fn register<M: Module>(&self, module: M, id: Option<&str>) -> Result<()> {
        let metadata = module.metadata();
        let id = id.map_or(metadata.id, str::to_string);

        let mut entries = self.entries.write();
        if entries.iter().any(|e| e.id == id) {
            return Err(VibeError::Configuration(format!(
                "Module {} already registered",
                id
            )));
        }

        let module = Arc::new(module);
        entries.push(ModuleEntry {
            id: id.clone(),
            type_id: TypeId::of::<M>(),
            type_name: std::any::type_name::<M>(),
            dependencies: metadata.dependencies,
            module: Arc::clone(&module) as Arc<dyn Module>,
            instance: module as Arc<dyn Any + Send + Sync>,
            state: ModuleState::Registered,
        });

        match resolve_order(&entries) {
            Ok(order) => {
                let mut slots: Vec<Option<ModuleEntry>> = entries.drain(..).map(Some).collect();
                entries.extend(order.into_iter().filter_map(|i| slots[i].take()));
                debug!(module = %id, "module registered");
                Ok(())
            }
            Err(e) => {
                entries.pop();
                Err(e)
            }
        }
    }

    /// Enables every module that is not enabled yet: all `pre_enable` phases
    /// in dependency order, then all `post_enable` phases.
    pub async fn enable_all(&self, manager: &ContextManager) -> Result<()> {
        let pending = self.snapshot(|state| {
            matches!(state, ModuleState::Registered | ModuleState::Disabled)
        });
        if pending.is_empty() {
            return Ok(());
        }

        let mut failed: HashSet<String> = HashSet::new();
        let mut started: Vec<usize> = Vec::new();
        for phase in ["pre_enable", "post_enable"] {
            for (index, (id, module, dependencies)) in pending.iter().enumerate() {
                if failed.contains(id) {
                    continue;
                }
                if let Some(dep) = dependencies.iter().find(|d| failed.contains(*d)) {
                    warn!(module = %id, dependency = %dep, "skipping module with failed dependency");
                    failed.insert(id.clone());
                    self.set_state(id, ModuleState::Failed);
                    continue;
                }

                let result = match phase {
                    "pre_enable" => self.run_phase(id, phase, module.pre_enable(manager)).await,
                    _ => self.run_phase(id, phase, module.post_enable(manager)).await,
                };
                match result {
                    Ok(()) if phase == "pre_enable" => started.push(index),
                    Ok(()) => {}
                    Err(e) => {
                        error!(module = %id, phase, error = %e, "module failed to enable");
                        failed.insert(id.clone());
                        self.set_state(id, ModuleState::Failed);
                        if !self.continue_on_failure {
                            self.roll_back(manager, &pending, &started, &failed).await;
                            self.rebuild_enabled();
                            return Err(e);
                        }
                    }
                }
            }
        }

        for (id, _, _) in &pending {
            if !failed.contains(id) {
                self.set_state(id, ModuleState::Enabled);
                info!(module = %id, "module enabled");
            }
        }
        self.rebuild_enabled();
        Ok(())
    }

    /// Disables enabled modules in reverse order. Failures are logged, not
    /// returned, so every module gets its chance to clean up.
    pub async fn disable_all(&self, manager: &ContextManager) -> Result<()> {
        let mut enabled = self.snapshot(|state| state == ModuleState::Enabled);
        if enabled.is_empty() {
            return Ok(());
        }
        enabled.reverse();

        for (id, module, _) in &enabled {
            if let Err(e) = self.run_phase(id, "pre_disable", module.pre_disable(manager)).await {
                warn!(module = %id, error = %e, "pre_disable failed");
            }
        }

        for (id, _, _) in &enabled {
            self.set_state(id, ModuleState::Disabled);
        }
        self.rebuild_enabled();

        for (id, module, _) in &enabled {
            if let Err(e) = self.run_phase(id, "post_disable", module.post_disable(manager)).await {
                warn!(module = %id, error = %e, "post_disable failed");
            }
            info!(module = %id, "module disabled");
        }
        Ok(())
    }

    /// Runs the disable phases, in reverse, for modules whose `pre_enable`
    /// succeeded before an aborted enable. Failed modules keep their state.
    async fn roll_back(
        &self,
        manager: &ContextManager,
        pending: &[(String, Arc<dyn Module>, Vec<String>)],
        started: &[usize],
        failed: &HashSet<String>,
    ) {
        for (id, module, _) in started.iter().rev().map(|&i| &pending[i]) {
            if let Err(e) = self.run_phase(id, "pre_disable", module.pre_disable(manager)).await {
                warn!(module = %id, error = %e, "pre_disable failed during rollback");
            }
            if let Err(e) = self.run_phase(id, "post_disable", module.post_disable(manager)).await {
                warn!(module = %id, error = %e, "post_disable failed during rollback");
            }
            if !failed.contains(id) {
                self.set_state(id, ModuleState::Disabled);
            }
            debug!(module = %id, "module rolled back");
        }
    }

    async fn run_phase<F>(&self, id: &str, phase: &'static str, future: F) -> Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        match timeout(self.timeout, future).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(VibeError::ModuleError {
                module: id.to_string(),
                phase,
                message: e.to_string(),
            }),
            Err(_) => Err(VibeError::Timeout(format!(
                "Module {} {} timeout after {:?}",
                id, phase, self.timeout
            ))),
        }
    }

    /// Invokes `hook` on every enabled module, in enable order.
    pub fn broadcast<F>(&self, mut hook: F)
    where
        F: FnMut(&dyn Module),
    {
        let modules = Arc::clone(&self.enabled.read());
        for module in modules.iter() {
            hook(module.as_ref());
        }
    }

    fn snapshot<P>(&self, wanted: P) -> Vec<(String, Arc<dyn Module>, Vec<String>)>
    where
        P: Fn(ModuleState) -> bool,
    {
        let entries = self.entries.read();
        entries
            .iter()
            .filter(|e| wanted(e.state))
            .map(|e| {
                let deps = e
                    .dependencies
                    .iter()
                    .filter_map(|d| find_dependency(&entries, d))
                    .map(|i| entries[i].id.clone())
                    .collect();
                (e.id.clone(), Arc::clone(&e.module), deps)
            })
            .collect()
    }

    fn set_state(&self, id: &str, state: ModuleState) {
        if let Some(entry) = self.entries.write().iter_mut().find(|e| e.id == id) {
            entry.state = state;
        }
    }

    fn rebuild_enabled(&self) {
        let enabled: Vec<Arc<dyn Module>> = self
            .entries
            .read()
            .iter()
            .filter(|e| e.state == ModuleState::Enabled)
            .map(|e| Arc::clone(&e.module))
            .collect();
        *self.enabled.write() = Arc::new(enabled);
    }

    pub fn get<M: Module>(&self) -> Option<Arc<M>> {
        let type_id = TypeId::of::<M>();
        self.entries
            .read()
            .iter()
            .find(|e| e.type_id == type_id)
            .and_then(|e| Arc::clone(&e.instance).downcast::<M>().ok())
    }

    pub fn get_by_id(&self, id: &str) -> Option<Arc<dyn Module>> {
        self.entries
            .read()
            .iter()
            .find(|e| e.id == id)
            .map(|e| Arc::clone(&e.module))
    }

    pub fn state(&self, id: &str) -> Option<ModuleState> {
        self.entries.read().iter().find(|e| e.id == id).map(|e| e.state)
    }

    /// Module ids and states in dependency order.
    pub fn list(&self) -> Vec<(String, ModuleState)> {
        self.entries
            .read()
            .iter()
            .map(|e| (e.id.clone(), e.state))
            .collect()
    }

    pub fn count(&self) -> usize {
        self.entries.read().len()
    }
}

fn find_dependency(entries: &[ModuleEntry], dependency: &ModuleDependency) -> Option<usize> {
    entries.iter().position(|e| match dependency {
        ModuleDependency::Id(id) => e.id == *id,
        ModuleDependency::Type { type_id, .. } => e.type_id == *type_id,
    })
}

/// Dependency-first order over `entries`, stable with respect to their
/// current order.
fn resolve_order(entries: &[ModuleEntry]) -> Result<Vec<usize>> {
    let mut dependencies = Vec::with_capacity(entries.len());
    for entry in entries {
        let mut resolved = Vec::with_capacity(entry.dependencies.len());
        for dependency in &entry.dependencies {
            let index = find_dependency(entries, dependency).ok_or_else(|| {
                VibeError::Configuration(format!(
                    "Module {} ({}) depends on missing module {}",
                    entry.id, entry.type_name, dependency
                ))
            })?;
            resolved.push(index);
        }
        dependencies.push(resolved);
    }

    let mut order: Vec<usize> = Vec::with_capacity(entries.len());
    let mut unresolved: Vec<usize> = (0..entries.len()).collect();

    while !unresolved.is_empty() {
        let mut remaining = Vec::new();
        for index in unresolved.iter().copied() {
            if dependencies[index].iter().all(|dep| order.contains(dep)) {
                order.push(index);
            } else {
                remaining.push(index);
            }
        }

        if remaining.len() == unresolved.len() {
            let ids: Vec<&str> = remaining.iter().map(|&i| entries[i].id.as_str()).collect();
            return Err(VibeError::Configuration(format!(
                "Circular module dependency detected: {:?}",
                ids
            )));
        }
        unresolved = remaining;
    }

    Ok(order)
}
