//! Mock channel for testing
//!
//! Simulates a well-behaved fleet server: connect requests are answered with
//! the same session id, every status is acknowledged, and every device that
//! is announced with a `CONNECTING` status gets one command once the pending
//! acknowledgements have been read. The behavior can be altered per test.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use mgw_core::{
    Command, ConnectResponse, ConnectResponseType, DeviceState, ExternalClientMessage,
    ExternalServerMessage, Status, StatusResponse, StatusResponseType,
};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use super::{ExternalChannel, TransportError};
use crate::config::MockConfig;

/// How the simulated server answers a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectReply {
    /// `OK` with the requested session id
    Accept,
    /// `OK` carrying a different session id
    WrongSession,
    /// `ALREADY_LOGGED`
    AlreadyLogged,
    /// No answer at all
    Silent,
}

/// Adjustable behavior of the simulated server
#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub refuse_open: bool,
    pub fail_send: bool,
    pub connect_reply: ConnectReply,
    pub acknowledge_statuses: bool,
    /// Acknowledge statuses under a different session id
    pub foreign_acks: bool,
    pub push_commands: bool,
    /// Payload of the commands pushed for newly announced devices
    pub command_data: Vec<u8>,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            refuse_open: false,
            fail_send: false,
            connect_reply: ConnectReply::Accept,
            acknowledge_statuses: true,
            foreign_acks: false,
            push_commands: true,
            command_data: Vec::new(),
        }
    }
}

/// Mock channel for testing
pub struct MockChannel {
    config: MockConfig,
    open: AtomicBool,
    open_count: AtomicUsize,
    behavior: Mutex<MockBehavior>,
    /// Replies that are read first
    inbound: Mutex<VecDeque<ExternalServerMessage>>,
    /// Commands released once `inbound` is drained
    deferred: Mutex<VecDeque<ExternalServerMessage>>,
    sent: Mutex<Vec<ExternalClientMessage>>,
    command_counter: AtomicU32,
    notify: Notify,
}

impl MockChannel {
    pub fn new(config: &MockConfig) -> Self {
        Self {
            config: config.clone(),
            open: AtomicBool::new(false),
            open_count: AtomicUsize::new(0),
            behavior: Mutex::new(MockBehavior::default()),
            inbound: Mutex::new(VecDeque::new()),
            deferred: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            command_counter: AtomicU32::new(0),
            notify: Notify::new(),
        }
    }

    /// Change the simulated server behavior
    pub fn configure(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock());
    }

    /// Inject a message as if the server had sent it
    pub fn inject(&self, message: ExternalServerMessage) {
        self.inbound.lock().push_back(message);
        self.notify.notify_one();
    }

    /// All messages sent through this channel, across sessions
    pub fn sent(&self) -> Vec<ExternalClientMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_statuses(&self) -> Vec<Status> {
        self.sent
            .lock()
            .iter()
            .filter_map(|m| match m {
                ExternalClientMessage::Status(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Number of successful `open` calls
    pub fn open_count(&self) -> usize {
        self.open_count.load(Ordering::SeqCst)
    }

    fn respond(&self, message: &ExternalClientMessage) {
        let behavior = self.behavior.lock().clone();
        match message {
            ExternalClientMessage::Connect(request) => {
                let (session_id, response_type) = match behavior.connect_reply {
                    ConnectReply::Accept => (request.session_id.clone(), ConnectResponseType::Ok),
                    ConnectReply::WrongSession => {
                        (format!("{}_other", request.session_id), ConnectResponseType::Ok)
                    }
                    ConnectReply::AlreadyLogged => {
                        (request.session_id.clone(), ConnectResponseType::AlreadyLogged)
                    }
                    ConnectReply::Silent => return,
                };
                self.inject(ExternalServerMessage::ConnectResponse(ConnectResponse {
                    session_id,
                    response_type,
                }));
            }
            ExternalClientMessage::Status(status) => {
                if behavior.acknowledge_statuses {
                    let session_id = if behavior.foreign_acks {
                        format!("{}_other", status.session_id)
                    } else {
                        status.session_id.clone()
                    };
                    self.inject(ExternalServerMessage::StatusResponse(StatusResponse {
                        session_id,
                        response_type: StatusResponseType::Ok,
                        message_counter: status.message_counter,
                    }));
                }
                if behavior.push_commands && status.device_state == DeviceState::Connecting {
                    let counter = self.command_counter.fetch_add(1, Ordering::SeqCst);
                    self.deferred
                        .lock()
                        .push_back(ExternalServerMessage::Command(Command {
                            session_id: status.session_id.clone(),
                            message_counter: counter,
                            device: status.device().clone(),
                            command_data: behavior.command_data.clone(),
                        }));
                    self.notify.notify_one();
                }
            }
            ExternalClientMessage::CommandResponse(_) => {}
        }
    }

    fn next_message(&self) -> Option<ExternalServerMessage> {
        if let Some(message) = self.inbound.lock().pop_front() {
            return Some(message);
        }
        self.deferred.lock().pop_front()
    }
}

#[async_trait]
impl ExternalChannel for MockChannel {
    async fn open(&self) -> Result<(), TransportError> {
        if self.behavior.lock().refuse_open {
            return Err(TransportError::ConnectionFailed(
                "Mock server refused connection".to_string(),
            ));
        }
        self.open.store(true, Ordering::SeqCst);
        self.open_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&self, message: &ExternalClientMessage) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        if self.behavior.lock().fail_send {
            return Err(TransportError::SendFailed("Mock send failure".to_string()));
        }

        // Simulate latency
        if self.config.latency_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        tracing::debug!(kind = message.kind(), "Mock channel: sent message");
        self.sent.lock().push(message.clone());
        self.respond(message);
        Ok(())
    }

    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<ExternalServerMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.open.load(Ordering::SeqCst) {
                return Err(TransportError::ConnectionClosed);
            }
            if let Some(message) = self.next_message() {
                return Ok(Some(message));
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return Ok(self.next_message());
            }
        }
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        self.inbound.lock().clear();
        self.deferred.lock().clear();
        self.notify.notify_waiters();
    }

    fn describe(&self) -> String {
        "mock://".to_string()
    }
}
