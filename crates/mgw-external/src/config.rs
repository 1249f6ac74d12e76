//! External client configuration
//!
//! Configuration types for the external session engine: vehicle identity,
//! protocol timeouts and the list of fleet-server endpoints with the device
//! modules each of them serves.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid {field}: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Endpoint '{0}' does not serve any module")]
    EndpointWithoutModules(String),

    #[error("Module {module} is served by both '{first}' and '{second}'")]
    DuplicateModule {
        module: u32,
        first: String,
        second: String,
    },
}

/// Configuration of the external client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExternalClientConfig {
    /// Company name, part of every connect request
    pub company: String,
    /// Vehicle name, also used as the session id prefix
    pub vehicle_name: String,
    /// Length of the random session id suffix
    #[serde(default = "default_session_id_length")]
    pub session_id_length: usize,
    /// Delay before a failed connection is retried
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,
    /// Bound on every read performed during a handshake
    #[serde(default = "default_response_timeout")]
    pub response_timeout_ms: u64,
    /// Time a sent status may stay unacknowledged
    #[serde(default = "default_status_ack_timeout")]
    pub status_ack_timeout_ms: u64,
    /// Read granularity of the steady-state receive loop
    #[serde(default = "default_receive_poll")]
    pub receive_poll_ms: u64,
    /// Maximum pending commands per local device
    #[serde(default = "default_command_backlog")]
    pub command_backlog: usize,
    /// Fleet-server endpoints
    #[serde(default)]
    pub endpoints: Vec<EndpointConfig>,
}

fn default_session_id_length() -> usize {
    8
}

fn default_reconnect_delay() -> u64 {
    5000
}

fn default_response_timeout() -> u64 {
    5000
}

fn default_status_ack_timeout() -> u64 {
    30000
}

fn default_receive_poll() -> u64 {
    500
}

fn default_command_backlog() -> usize {
    50
}

impl ExternalClientConfig {
    pub fn new(company: impl Into<String>, vehicle_name: impl Into<String>) -> Self {
        Self {
            company: company.into(),
            vehicle_name: vehicle_name.into(),
            session_id_length: default_session_id_length(),
            reconnect_delay_ms: default_reconnect_delay(),
            response_timeout_ms: default_response_timeout(),
            status_ack_timeout_ms: default_status_ack_timeout(),
            receive_poll_ms: default_receive_poll(),
            command_backlog: default_command_backlog(),
            endpoints: Vec::new(),
        }
    }

    pub fn vehicle(&self) -> VehicleIdentity {
        VehicleIdentity {
            company: self.company.clone(),
            vehicle_name: self.vehicle_name.clone(),
        }
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    pub fn status_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.status_ack_timeout_ms)
    }

    pub fn receive_poll(&self) -> Duration {
        Duration::from_millis(self.receive_poll_ms)
    }

    /// Check the configuration for values the engine cannot work with
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_name("company", &self.company)?;
        validate_name("vehicle_name", &self.vehicle_name)?;

        if self.session_id_length == 0 {
            return Err(invalid("session_id_length", "must be greater than zero"));
        }
        for (field, value) in [
            ("reconnect_delay_ms", self.reconnect_delay_ms),
            ("response_timeout_ms", self.response_timeout_ms),
            ("status_ack_timeout_ms", self.status_ack_timeout_ms),
            ("receive_poll_ms", self.receive_poll_ms),
        ] {
            if value == 0 {
                return Err(invalid(field, "must be greater than zero"));
            }
        }
        if self.command_backlog == 0 {
            return Err(invalid("command_backlog", "must be greater than zero"));
        }

        let mut owners: HashMap<u32, &str> = HashMap::new();
        for endpoint in &self.endpoints {
            if endpoint.modules.is_empty() {
                return Err(ConfigError::EndpointWithoutModules(endpoint.name.clone()));
            }
            for &module in &endpoint.modules {
                if let Some(first) = owners.insert(module, &endpoint.name) {
                    return Err(ConfigError::DuplicateModule {
                        module,
                        first: first.to_string(),
                        second: endpoint.name.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

fn validate_name(field: &'static str, value: &str) -> Result<(), ConfigError> {
    if value.is_empty() {
        return Err(invalid(field, "must not be empty"));
    }
    if !value
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(ConfigError::InvalidField {
            field,
            reason: format!(
                "'{}' may only contain lower-case letters, digits and '_'",
                value
            ),
        });
    }
    Ok(())
}

/// Company and vehicle the gateway speaks for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VehicleIdentity {
    pub company: String,
    pub vehicle_name: String,
}

/// One fleet-server endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Name used in logs
    #[serde(default = "default_endpoint_name")]
    pub name: String,
    /// Device modules routed to this endpoint
    pub modules: Vec<u32>,
    pub transport: TransportConfig,
}

fn default_endpoint_name() -> String {
    "external".to_string()
}

// =============================================================================
// Transport Configuration
// =============================================================================

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransportConfig {
    /// Publish/subscribe broker (MQTT)
    Mqtt(MqttConfig),
    /// Length-delimited stream over TCP, optionally TLS
    Stream(StreamConfig),
    /// In-process test double
    Mock(MockConfig),
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self::Mock(MockConfig::default())
    }
}

/// MQTT broker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    /// Keep-alive interval in seconds
    #[serde(default = "default_mqtt_keepalive")]
    pub keepalive_secs: u64,
    /// Time allowed for the broker to accept the connection
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_mqtt_keepalive() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    5000
}

/// Stream transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
    /// TLS settings; plaintext when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// PEM file with the trusted CA certificates
    pub ca_file: PathBuf,
    /// Server name to verify; defaults to the host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Mock transport configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MockConfig {
    /// Simulated latency in milliseconds
    #[serde(default)]
    pub latency_ms: u64,
}
