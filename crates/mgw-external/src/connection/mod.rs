//! Sessions with fleet-server endpoints
//!
//! This module holds the per-endpoint connection state machine and the
//! tracking of statuses that still await acknowledgement.

mod external;
mod sent_messages;

pub use external::ExternalConnection;
pub use sent_messages::{AckError, AckOutcome, NotAckedStatus, SentMessagesHandler, TimeoutCallback};

use std::fmt;

use thiserror::Error;

use crate::aggregator::AggregatorError;
use crate::transport::TransportError;

/// Connection state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Constructed or torn down, no session
    #[default]
    NotInitialized,
    /// A handshake was attempted and failed, or is about to start
    NotConnected,
    /// Handshake in progress
    Connecting,
    /// Session established
    Connected,
}

impl ConnectionState {
    fn as_u8(self) -> u8 {
        match self {
            Self::NotInitialized => 0,
            Self::NotConnected => 1,
            Self::Connecting => 2,
            Self::Connected => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::NotConnected,
            2 => Self::Connecting,
            3 => Self::Connected,
            _ => Self::NotInitialized,
        }
    }
}

/// Handle of a connection owned by the external client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub usize);

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Request to tear a connection down, queued to the external client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectRequest {
    pub connection: ConnectionId,
    /// Start a new handshake after the teardown; otherwise leave it idle
    pub reconnect: bool,
}

/// Connection errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Operation not allowed in state {0:?}")]
    InvalidState(ConnectionState),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("No {0} received in time")]
    NoResponse(&'static str),

    #[error("Expected {expected}, received {received}")]
    UnexpectedMessage {
        expected: &'static str,
        received: &'static str,
    },

    #[error("Session id mismatch: expected {expected}, received {received}")]
    SessionMismatch { expected: String, received: String },

    #[error("Server reports the vehicle as already logged in")]
    AlreadyLogged,

    #[error(transparent)]
    UnknownAcknowledgement(#[from] AckError),

    #[error("Command counter desynchronized: expected {expected}, received {received}")]
    Desynchronized { expected: u32, received: u32 },

    #[error(transparent)]
    Aggregator(#[from] AggregatorError),
}
