use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::traits::Module;
use crate::types::{is_not_implemented, ModuleState};

// ---------------------------------------------------------------------------
// RegistryError
// ---------------------------------------------------------------------------

/// Errors returned by [`ModuleRegistry`] operations.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("registration was closed")]
    RegistrationClosed,
    #[error("module name {name} had been registered")]
    DuplicateName { name: String },
    #[error("unregistered module {name}")]
    UnknownModule { name: String },
    #[error("module configuration must be a JSON object, got {kind}")]
    InvalidConfig { kind: &'static str },
    #[error("failed to initialize module {module}: {source}")]
    Initialize {
        module: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("registry has not been initialized")]
    NotInitialized,
    #[error("module {module} exited with error: {source}")]
    Serve {
        module: String,
        #[source]
        source: anyhow::Error,
    },
}

// ---------------------------------------------------------------------------
// Entry
// ---------------------------------------------------------------------------

/// A registered module together with its lifecycle state.
struct Entry {
    module: Arc<dyn Module>,
    state: Mutex<ModuleState>,
}

impl Entry {
    fn new(module: Arc<dyn Module>) -> Self {
        Self {
            module,
            state: Mutex::new(ModuleState::Registered),
        }
    }

    fn name(&self) -> &str {
        self.module.name()
    }

    fn state(&self) -> ModuleState {
        *self.state.lock()
    }

    fn set_state(&self, state: ModuleState) {
        *self.state.lock() = state;
    }

    /// Moves a live module to `to`. Returns false if the module was not live,
    /// so each transition out of a live state happens at most once.
    fn leave_live_state(&self, to: ModuleState) -> bool {
        let mut state = self.state.lock();
        if !state.needs_finalize() || *state == to {
            return false;
        }
        *state = to;
        true
    }

    /// Marks a module that was initialized but not yet shut down as serving.
    fn begin_serving(&self) {
        let mut state = self.state.lock();
        if *state == ModuleState::Initialized {
            *state = ModuleState::Serving;
        }
    }

    async fn finalize(&self) {
        if !self.leave_live_state(ModuleState::Finalized) {
            return;
        }
        self.module.finalize().await;
        info!(module = self.name(), "module finalized");
    }
}

// ---------------------------------------------------------------------------
// ModuleRegistry
// ---------------------------------------------------------------------------

/// Owns the process's modules and drives their lifecycle.
///
/// Registration is open until [`initialize`](Self::initialize) is called.
/// Until then modules are kept sorted by name under a mutex so duplicate
/// names are found by binary search. `initialize` freezes the set into
/// priority order (ties broken by name), after which it is read without
/// locking.
pub struct ModuleRegistry {
    /// Modules sorted by name; drained into `frozen` by `initialize`.
    pending: Mutex<Vec<Arc<Entry>>>,
    /// Modules sorted by (priority, name); set once by `initialize`.
    frozen: OnceLock<Vec<Arc<Entry>>>,
    /// Set when every module initialized successfully.
    initialized: AtomicBool,
    /// Single-use trigger: the first `shutdown` call wins.
    shutdown_requested: AtomicBool,
}

impl ModuleRegistry {
    /// Creates an empty registry with registration open.
    #[must_use]
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(Vec::new()),
            frozen: OnceLock::new(),
            initialized: AtomicBool::new(false),
            shutdown_requested: AtomicBool::new(false),
        }
    }

    /// Registers a module.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateName` if a module with the same name is registered
    /// (the registry is left unchanged), or `RegistrationClosed` after
    /// `initialize`.
    pub fn register(&self, module: Arc<dyn Module>) -> Result<(), RegistryError> {
        let mut pending = self.pending.lock();
        if self.frozen.get().is_some() {
            return Err(RegistryError::RegistrationClosed);
        }

        let name = module.name();
        match pending.binary_search_by(|entry| entry.name().cmp(name)) {
            Ok(_) => Err(RegistryError::DuplicateName {
                name: name.to_string(),
            }),
            Err(index) => {
                debug!(module = name, priority = module.priority(), "module registered");
                pending.insert(index, Arc::new(Entry::new(module)));
                Ok(())
            }
        }
    }

    /// Removes the named modules.
    ///
    /// Either every name is removed or none is.
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` for the first name that is not registered, or
    /// `RegistrationClosed` after `initialize`.
    pub fn deregister(&self, names: &[&str]) -> Result<(), RegistryError> {
        let mut pending = self.pending.lock();
        if self.frozen.get().is_some() {
            return Err(RegistryError::RegistrationClosed);
        }
        ensure_registered(&pending, names)?;

        pending.retain(|entry| !names.contains(&entry.name()));
        Ok(())
    }

    /// Removes every module except the named ones.
    ///
    /// # Errors
    ///
    /// Returns `UnknownModule` for the first name that is not registered
    /// (nothing is removed), or `RegistrationClosed` after `initialize`.
    pub fn deregister_all_except(&self, names: &[&str]) -> Result<(), RegistryError> {
        let mut pending = self.pending.lock();
        if self.frozen.get().is_some() {
            return Err(RegistryError::RegistrationClosed);
        }
        ensure_registered(&pending, names)?;

        pending.retain(|entry| names.contains(&entry.name()));
        Ok(())
    }

    /// Returns the registered module names in name order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = match self.frozen.get() {
            Some(entries) => entries.iter().map(|e| e.name().to_string()).collect(),
            None => self
                .pending
                .lock()
                .iter()
                .map(|e| e.name().to_string())
                .collect(),
        };
        names.sort();
        names
    }

    /// Returns the lifecycle state of a module, or `None` if it is not registered.
    #[must_use]
    pub fn state(&self, name: &str) -> Option<ModuleState> {
        match self.frozen.get() {
            Some(entries) => entries.iter().find(|e| e.name() == name).map(|e| e.state()),
            None => {
                let pending = self.pending.lock();
                pending
                    .binary_search_by(|entry| entry.name().cmp(name))
                    .ok()
                    .map(|index| pending[index].state())
            }
        }
    }

    /// Returns true once `shutdown` has been requested.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_requested.load(Ordering::SeqCst)
    }

    /// Initializes every module in ascending priority order.
    ///
    /// `config` must be a JSON object keyed by module name (or `null`); each
    /// module receives only its own section. Registration is closed from this
    /// point on, whatever the outcome.
    ///
    /// If a module fails, every module initialized before it is finalized in
    /// reverse order and later modules are never initialized.
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if `config` is neither an object nor `null`,
    /// `RegistrationClosed` if called twice, or `Initialize` with the failing
    /// module's error.
    pub async fn initialize(&self, config: &Value) -> Result<(), RegistryError> {
        let sections = config_sections(config)?;
        let entries = self.freeze()?;

        for (index, entry) in entries.iter().enumerate() {
            let name = entry.name();
            let section = sections.and_then(|map| map.get(name));

            if let Err(source) = entry.module.initialize(section).await {
                warn!(module = name, error = %source, "failed to initialize module");
                entry.set_state(ModuleState::Failed);

                for prior in entries[..index].iter().rev() {
                    prior.finalize().await;
                }
                return Err(RegistryError::Initialize {
                    module: name.to_string(),
                    source,
                });
            }

            entry.set_state(ModuleState::Initialized);
            info!(
                module = name,
                priority = entry.module.priority(),
                "module initialized"
            );
        }

        self.initialized.store(true, Ordering::SeqCst);
        Ok(())
    }

    /// Runs every module's `serve` concurrently and waits for all of them.
    ///
    /// A module returning the `NotImplemented` sentinel exits silently. Any
    /// other error (or a panic) triggers [`shutdown`](Self::shutdown) for the
    /// whole registry; the remaining modules are still awaited.
    ///
    /// # Errors
    ///
    /// Returns `NotInitialized` before a successful `initialize`, otherwise
    /// the first module failure once every serve task has exited.
    pub async fn serve(&self) -> Result<(), RegistryError> {
        if !self.initialized.load(Ordering::SeqCst) {
            return Err(RegistryError::NotInitialized);
        }
        let entries = self.entries();

        if self.is_shutting_down() {
            info!("shutdown requested before serve, not starting modules");
            return Ok(());
        }

        let mut running: FuturesUnordered<_> = entries
            .iter()
            .map(|entry| {
                entry.begin_serving();
                let module = Arc::clone(&entry.module);
                let handle = tokio::spawn(async move { module.serve().await });
                let entry = Arc::clone(entry);
                async move { (entry, handle.await) }
            })
            .collect();

        let mut first_failure = None;
        while let Some((entry, outcome)) = running.next().await {
            let name = entry.name();
            let failure = match outcome {
                Ok(Ok(())) => {
                    info!(module = name, "module exited gracefully");
                    None
                }
                Ok(Err(err)) if is_not_implemented(&err) => {
                    debug!(module = name, "module has no serve duty");
                    None
                }
                Ok(Err(err)) => Some(err),
                Err(join_err) => Some(anyhow::anyhow!("serve task aborted: {join_err}")),
            };

            if let Some(source) = failure {
                warn!(module = name, error = %source, "module exited with error, shutting down");
                self.shutdown().await;
                if first_failure.is_none() {
                    first_failure = Some(RegistryError::Serve {
                        module: name.to_string(),
                        source,
                    });
                }
            }
        }

        first_failure.map_or(Ok(()), Err)
    }

    /// Delivers `shutdown` to every initialized module.
    ///
    /// Only the first call has an effect; concurrent and later calls return
    /// immediately. Safe to call before `initialize` (modules are then never
    /// served).
    pub async fn shutdown(&self) {
        if self.shutdown_requested.swap(true, Ordering::SeqCst) {
            debug!("shutdown already requested");
            return;
        }
        info!("shutting down modules");

        let Some(entries) = self.frozen.get() else {
            return;
        };
        for entry in entries {
            if entry.leave_live_state(ModuleState::ShuttingDown) {
                entry.module.shutdown().await;
            }
        }
    }

    /// Finalizes every module still holding initialized resources, in
    /// reverse priority order.
    ///
    /// Modules already finalized by an `initialize` rollback are skipped.
    pub async fn finalize(&self) {
        let Some(entries) = self.frozen.get() else {
            return;
        };
        for entry in entries.iter().rev() {
            entry.finalize().await;
        }
    }

    /// Drains the pending set into priority order and closes registration.
    fn freeze(&self) -> Result<&[Arc<Entry>], RegistryError> {
        let mut pending = self.pending.lock();
        if self.frozen.get().is_some() {
            return Err(RegistryError::RegistrationClosed);
        }

        let mut ordered = std::mem::take(&mut *pending);
        // `pending` is name-sorted and the sort is stable; the explicit
        // tie-break keeps the order independent of that.
        ordered.sort_by(|a, b| {
            a.module
                .priority()
                .cmp(&b.module.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Ok(self.frozen.get_or_init(|| ordered))
    }

    fn entries(&self) -> &[Arc<Entry>] {
        self.frozen.get().map_or(&[], Vec::as_slice)
    }
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn ensure_registered(pending: &[Arc<Entry>], names: &[&str]) -> Result<(), RegistryError> {
    for name in names {
        if pending
            .binary_search_by(|entry| entry.name().cmp(name))
            .is_err()
        {
            return Err(RegistryError::UnknownModule {
                name: (*name).to_string(),
            });
        }
    }
    Ok(())
}

fn config_sections(config: &Value) -> Result<Option<&Map<String, Value>>, RegistryError> {
    match config {
        Value::Null => Ok(None),
        Value::Object(map) => Ok(Some(map)),
        Value::Bool(_) => Err(RegistryError::InvalidConfig { kind: "boolean" }),
        Value::Number(_) => Err(RegistryError::InvalidConfig { kind: "number" }),
        Value::String(_) => Err(RegistryError::InvalidConfig { kind: "string" }),
        Value::Array(_) => Err(RegistryError::InvalidConfig { kind: "array" }),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
