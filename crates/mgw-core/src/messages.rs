//! External wire messages
//!
//! Messages exchanged between the gateway and a remote fleet server. The
//! gateway sends [`ExternalClientMessage`]s and receives
//! [`ExternalServerMessage`]s. Every message carries the session id of the
//! handshake it belongs to.

use serde::{Deserialize, Serialize};

use crate::device::DeviceIdentity;

/// Connect request, first message of a handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectRequest {
    pub session_id: String,
    pub company: String,
    pub vehicle_name: String,
    pub devices: Vec<DeviceIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectResponseType {
    Ok,
    AlreadyLogged,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectResponse {
    pub session_id: String,
    #[serde(rename = "type")]
    pub response_type: ConnectResponseType,
}

/// State of a device as reported in a status message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceState {
    /// First contact of the device within the current session
    Connecting,
    /// Regular status update
    Running,
    /// Device left the vehicle
    Disconnect,
    /// Device reports an error condition
    Error,
}

/// Status payload of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub device: DeviceIdentity,
    pub status_data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    pub session_id: String,
    pub device_state: DeviceState,
    pub message_counter: u32,
    pub device_status: DeviceStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<Vec<u8>>,
}

impl Status {
    pub fn device(&self) -> &DeviceIdentity {
        &self.device_status.device
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusResponseType {
    Ok,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub session_id: String,
    #[serde(rename = "type")]
    pub response_type: StatusResponseType,
    pub message_counter: u32,
}

/// Command for one device pushed by the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub session_id: String,
    pub message_counter: u32,
    pub device: DeviceIdentity,
    pub command_data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CommandResponseType {
    Ok,
    DeviceNotConnected,
    DeviceNotSupported,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    pub session_id: String,
    #[serde(rename = "type")]
    pub response_type: CommandResponseType,
    pub message_counter: u32,
}

/// Messages sent by the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum ExternalClientMessage {
    Connect(ConnectRequest),
    Status(Status),
    CommandResponse(CommandResponse),
}

impl ExternalClientMessage {
    pub fn session_id(&self) -> &str {
        match self {
            Self::Connect(m) => &m.session_id,
            Self::Status(m) => &m.session_id,
            Self::CommandResponse(m) => &m.session_id,
        }
    }

    /// Short label for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connect(_) => "connect",
            Self::Status(_) => "status",
            Self::CommandResponse(_) => "command_response",
        }
    }
}

/// Messages received from the server
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "message", rename_all = "snake_case")]
pub enum ExternalServerMessage {
    ConnectResponse(ConnectResponse),
    StatusResponse(StatusResponse),
    Command(Command),
}

impl ExternalServerMessage {
    pub fn session_id(&self) -> &str {
        match self {
            Self::ConnectResponse(m) => &m.session_id,
            Self::StatusResponse(m) => &m.session_id,
            Self::Command(m) => &m.session_id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::ConnectResponse(_) => "connect_response",
            Self::StatusResponse(_) => "status_response",
            Self::Command(_) => "command",
        }
    }
}
