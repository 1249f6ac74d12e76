//! Daemon configuration file
//!
//! ```toml
//! [log]
//! filter = "info"
//!
//! [external]
//! company = "fleet"
//! vehicle_name = "car_1"
//!
//! [[external.endpoints]]
//! modules = [1]
//! [external.endpoints.transport]
//! type = "mqtt"
//! host = "broker.local"
//!
//! [[modules]]
//! number = 1
//! device_types = [0, 1]
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use mgw_external::{ConfigError, ExternalClientConfig};
use serde::Deserialize;
use thiserror::Error;

use crate::modules::ModuleConfig;

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error(transparent)]
    Invalid(#[from] ConfigError),

    #[error("Endpoint '{endpoint}' serves module {module}, which has no [[modules]] entry")]
    MissingModule { endpoint: String, module: u32 },

    #[error("Module {0} is configured twice")]
    DuplicateModule(u32),
}

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub log: LogConfig,
    pub external: ExternalClientConfig,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    /// Filter directives, overridden by RUST_LOG
    #[serde(default = "default_filter")]
    pub filter: String,
    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

fn default_filter() -> String {
    "mgwd=info,mgw_external=info,mgw_core=info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: default_filter(),
            json: false,
        }
    }
}

impl GatewayConfig {
    /// Load and validate a configuration file
    pub fn load(path: &Path) -> Result<Self, LoadError> {
        let content = std::fs::read_to_string(path).map_err(|source| LoadError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| LoadError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), LoadError> {
        self.external.validate()?;

        let mut numbers = HashSet::new();
        for module in &self.modules {
            if !numbers.insert(module.number) {
                return Err(LoadError::DuplicateModule(module.number));
            }
        }
        for endpoint in &self.external.endpoints {
            if let Some(&module) = endpoint.modules.iter().find(|m| !numbers.contains(*m)) {
                return Err(LoadError::MissingModule {
                    endpoint: endpoint.name.clone(),
                    module,
                });
            }
        }
        Ok(())
    }
}
