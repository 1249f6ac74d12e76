//! mgw-core - Core traits and types for the module gateway
//!
//! This crate provides the vocabulary shared between the local device side
//! and the external session engine: device identities, the external wire
//! messages, the device-module capability trait and the local queues.

pub mod device;
pub mod messages;
pub mod module;
pub mod queue;

pub use device::DeviceIdentity;
pub use messages::{
    Command, CommandResponse, CommandResponseType, ConnectRequest, ConnectResponse,
    ConnectResponseType, DeviceState, DeviceStatus, ExternalClientMessage, ExternalServerMessage,
    Status, StatusResponse, StatusResponseType,
};
pub use module::{DeviceModule, ModuleError, ModuleLibrary};
pub use queue::{AggregatedStatus, CommandQueue, DeviceCommand};
