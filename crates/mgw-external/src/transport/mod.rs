//! Transport layer for the external protocol
//!
//! This module provides channels to fleet-server endpoints:
//! - MQTT broker client (feature `mqtt`)
//! - Length-delimited stream over TCP with optional TLS
//! - Mock channel for testing
//!
//! # Example
//!
//! ```ignore
//! use mgw_external::transport::{create_channel, ExternalChannel};
//! use mgw_external::config::TransportConfig;
//!
//! let config = TransportConfig::Mock(Default::default());
//! let channel = create_channel(&config, &vehicle)?;
//! channel.open().await?;
//! ```

mod adapter;
pub mod error;
pub mod mock;
pub mod stream;

#[cfg(feature = "mqtt")]
pub mod mqtt;

pub use adapter::ExternalChannel;
pub use error::TransportError;

use std::sync::Arc;

use crate::config::{TransportConfig, VehicleIdentity};

/// Create a channel based on configuration
///
/// The channel is not opened; that happens at the start of every handshake.
#[cfg_attr(not(feature = "mqtt"), allow(unused_variables))]
pub fn create_channel(
    config: &TransportConfig,
    vehicle: &VehicleIdentity,
) -> Result<Arc<dyn ExternalChannel>, TransportError> {
    match config {
        #[cfg(feature = "mqtt")]
        TransportConfig::Mqtt(cfg) => Ok(Arc::new(mqtt::MqttChannel::new(cfg, vehicle))),
        #[cfg(not(feature = "mqtt"))]
        TransportConfig::Mqtt(_) => Err(TransportError::Unsupported(
            "MQTT requires the 'mqtt' feature".to_string(),
        )),
        TransportConfig::Stream(cfg) => Ok(Arc::new(stream::StreamChannel::new(cfg)?)),
        TransportConfig::Mock(cfg) => Ok(Arc::new(mock::MockChannel::new(cfg))),
    }
}
