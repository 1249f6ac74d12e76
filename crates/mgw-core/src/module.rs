//! Device module capability
//!
//! Per-device-type business logic is supplied by device modules. The engine
//! only needs to know which device types a module supports and how a module
//! folds a new status into an accumulated error summary.

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

use crate::device::DeviceIdentity;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ModuleError {
    #[error("Device type {0} not supported")]
    DeviceTypeNotSupported(u32),

    #[error("Error aggregation failed: {0}")]
    AggregationFailed(String),
}

/// Business logic of one device module
pub trait DeviceModule: Send + Sync {
    /// Module number this implementation serves
    fn module_number(&self) -> u32;

    fn is_device_type_supported(&self, device_type: u32) -> bool;

    /// Fold `status` into `current_error` and return the new error summary
    fn aggregate_error(
        &self,
        current_error: &[u8],
        status: &[u8],
        device_type: u32,
    ) -> Result<Vec<u8>, ModuleError>;
}

/// Registry of the device modules available to the process
#[derive(Clone, Default)]
pub struct ModuleLibrary {
    modules: BTreeMap<u32, Arc<dyn DeviceModule>>,
}

impl ModuleLibrary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a module, replacing any module with the same number
    pub fn register(&mut self, module: Arc<dyn DeviceModule>) {
        let number = module.module_number();
        if self.modules.insert(number, module).is_some() {
            tracing::warn!(module = number, "Replaced previously registered device module");
        }
    }

    pub fn get(&self, module: u32) -> Option<&Arc<dyn DeviceModule>> {
        self.modules.get(&module)
    }

    pub fn contains(&self, module: u32) -> bool {
        self.modules.contains_key(&module)
    }

    /// Whether the module of `device` is registered and supports its type
    pub fn is_device_supported(&self, device: &DeviceIdentity) -> bool {
        self.modules
            .get(&device.module)
            .map(|m| m.is_device_type_supported(device.device_type))
            .unwrap_or(false)
    }

    pub fn module_numbers(&self) -> Vec<u32> {
        self.modules.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

impl std::fmt::Debug for ModuleLibrary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleLibrary")
            .field("modules", &self.module_numbers())
            .finish()
    }
}
