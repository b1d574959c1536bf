//! Config store: the narrow get/set contract over session parameters and port bindings.
//!
//! The store is synchronous and cheap: getters return clones, setters validate before
//! touching anything and, when a file path is attached, persist the whole settings
//! document as TOML.

use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tracing::{debug, info};

use super::{PortBinding, Settings};
use crate::error::{AppResult, DaqError};
use crate::instrument::InstrumentSlot;
use crate::params::{StabilizationParameters, TestParameters};

/// Parameter and binding storage shared by the API, the console and session starts.
pub trait ConfigStore: Send + Sync {
    /// Current ramp test parameters.
    fn get_test_params(&self) -> TestParameters;
    /// Validates and replaces the ramp test parameters.
    fn set_test_params(&self, params: TestParameters) -> AppResult<()>;
    /// Current stabilization parameters.
    fn get_stabilization_params(&self) -> StabilizationParameters;
    /// Validates and replaces the stabilization parameters.
    fn set_stabilization_params(&self, params: StabilizationParameters) -> AppResult<()>;
    /// Port binding of `slot`, if one is configured.
    fn get_port_binding(&self, slot: InstrumentSlot) -> Option<PortBinding>;
    /// Validates and replaces the binding of `slot`.
    fn set_port_binding(&self, slot: InstrumentSlot, binding: PortBinding) -> AppResult<()>;
}

/// [`ConfigStore`] backed by a [`Settings`] document.
pub struct SettingsStore {
    settings: RwLock<Settings>,
    path: Option<PathBuf>,
}

impl SettingsStore {
    /// In-memory store.
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: RwLock::new(settings),
            path: None,
        }
    }

    /// Store that writes every accepted change to `path`.
    pub fn persistent(settings: Settings, path: impl Into<PathBuf>) -> Self {
        Self {
            settings: RwLock::new(settings),
            path: Some(path.into()),
        }
    }

    /// A copy of the whole settings document.
    pub fn settings(&self) -> Settings {
        match self.settings.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Path changes are persisted to, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn update(&self, what: &str, apply: impl FnOnce(&mut Settings)) -> AppResult<()> {
        let mut guard = self
            .settings
            .write()
            .map_err(|_| DaqError::Config("settings lock poisoned".to_string()))?;
        let mut next = guard.clone();
        apply(&mut next);
        if let Some(path) = &self.path {
            persist(&next, path)?;
            info!(path = %path.display(), "Saved {}", what);
        } else {
            debug!("Updated {}", what);
        }
        *guard = next;
        Ok(())
    }
}

fn persist(settings: &Settings, path: &Path) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let document = toml::to_string_pretty(settings)?;
    std::fs::write(path, document)?;
    Ok(())
}

impl ConfigStore for SettingsStore {
    fn get_test_params(&self) -> TestParameters {
        self.settings().test
    }

    fn set_test_params(&self, params: TestParameters) -> AppResult<()> {
        params.validate()?;
        self.update("test parameters", |s| s.test = params)
    }

    fn get_stabilization_params(&self) -> StabilizationParameters {
        self.settings().stabilization
    }

    fn set_stabilization_params(&self, params: StabilizationParameters) -> AppResult<()> {
        params.validate()?;
        self.update("stabilization parameters", |s| s.stabilization = params)
    }

    fn get_port_binding(&self, slot: InstrumentSlot) -> Option<PortBinding> {
        self.settings().instruments.get(&slot).cloned()
    }

    fn set_port_binding(&self, slot: InstrumentSlot, binding: PortBinding) -> AppResult<()> {
        binding.validate()?;
        self.update("port binding", |s| {
            s.instruments.insert(slot, binding);
        })
    }
}
