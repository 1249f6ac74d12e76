//! mgw-external - External session protocol engine of the module gateway
//!
//! This crate keeps the sessions between the gateway and its fleet-server
//! endpoints: the per-endpoint handshake, at-least-once status delivery with
//! acknowledgement timeouts, and the replay of statuses that could not be
//! delivered.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      ExternalClient                         │
//! │  status queue ─► routing by module ─► connection            │
//! │                                                             │
//! │  ┌───────────────────────┐     ┌───────────────────────┐    │
//! │  │ ExternalConnection #0 │ ... │ ExternalConnection #n │    │
//! │  │                       │     └───────────────────────┘    │
//! │  │ ┌───────────────────┐ │                                  │
//! │  │ │SentMessagesHandler│ │  in-flight statuses, timers      │
//! │  │ └───────────────────┘ │                                  │
//! │  │ ┌───────────────────┐ │                                  │
//! │  │ │ ErrorAggregator   │ │  backlog per device module       │
//! │  │ └───────────────────┘ │                                  │
//! │  │ ┌───────────────────┐ │                                  │
//! │  │ │ ExternalChannel   │ │  MQTT / stream / mock            │
//! │  │ └───────────────────┘ │                                  │
//! │  └───────────────────────┘                                  │
//! │                                                             │
//! │  reconnect queue ◄── timeouts, receive failures             │
//! │  command queue   ──► local devices                          │
//! └─────────────────────────────────────────────────────────────┘
//! ```

pub mod aggregator;
pub mod client;
pub mod config;
pub mod connection;
pub mod transport;

pub use aggregator::{AggregatorError, ErrorAggregator};
pub use client::{ClientError, ExternalClient};
pub use config::{
    ConfigError, EndpointConfig, ExternalClientConfig, MockConfig, MqttConfig, StreamConfig,
    TlsConfig, TransportConfig, VehicleIdentity,
};
pub use connection::{
    AckError, AckOutcome, ConnectionError, ConnectionId, ConnectionState, ExternalConnection,
    NotAckedStatus, ReconnectRequest, SentMessagesHandler,
};
pub use transport::{create_channel, ExternalChannel, TransportError};

// Re-export for convenience
pub use mgw_core::{
    AggregatedStatus, CommandQueue, DeviceCommand, DeviceIdentity, DeviceModule, DeviceState,
    DeviceStatus, ModuleError, ModuleLibrary,
};
