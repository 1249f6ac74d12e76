//! Built-in device modules
//!
//! Device modules are configured statically in the daemon's config file.

use std::sync::Arc;

use mgw_core::{DeviceModule, ModuleError, ModuleLibrary};
use serde::{Deserialize, Serialize};

/// How a module folds statuses into the error summary of a device
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorAggregation {
    /// The newest status becomes the error summary
    #[default]
    Latest,
    /// No error summary is kept
    None,
}

/// `[[modules]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleConfig {
    pub number: u32,
    pub device_types: Vec<u32>,
    #[serde(default)]
    pub error_aggregation: ErrorAggregation,
}

/// Device module described entirely by configuration
#[derive(Debug)]
pub struct StaticModule {
    number: u32,
    device_types: Vec<u32>,
    aggregation: ErrorAggregation,
}

impl StaticModule {
    pub fn new(config: &ModuleConfig) -> Self {
        Self {
            number: config.number,
            device_types: config.device_types.clone(),
            aggregation: config.error_aggregation,
        }
    }
}

impl DeviceModule for StaticModule {
    fn module_number(&self) -> u32 {
        self.number
    }

    fn is_device_type_supported(&self, device_type: u32) -> bool {
        self.device_types.contains(&device_type)
    }

    fn aggregate_error(
        &self,
        _current_error: &[u8],
        status: &[u8],
        device_type: u32,
    ) -> Result<Vec<u8>, ModuleError> {
        if !self.is_device_type_supported(device_type) {
            return Err(ModuleError::DeviceTypeNotSupported(device_type));
        }
        Ok(match self.aggregation {
            ErrorAggregation::Latest => status.to_vec(),
            ErrorAggregation::None => Vec::new(),
        })
    }
}

pub fn build_library(modules: &[ModuleConfig]) -> ModuleLibrary {
    let mut library = ModuleLibrary::new();
    for config in modules {
        library.register(Arc::new(StaticModule::new(config)));
    }
    library
}
