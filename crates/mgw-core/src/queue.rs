//! Local queue items and the shared command queue

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

use crate::device::DeviceIdentity;

/// Aggregated device status handed over by the local server side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AggregatedStatus {
    pub device: DeviceIdentity,
    pub status: Vec<u8>,
    /// The device left the vehicle; `status` is its final status
    #[serde(default)]
    pub disconnect: bool,
}

impl AggregatedStatus {
    pub fn running(device: DeviceIdentity, status: Vec<u8>) -> Self {
        Self {
            device,
            status,
            disconnect: false,
        }
    }

    pub fn disconnected(device: DeviceIdentity, status: Vec<u8>) -> Self {
        Self {
            device,
            status,
            disconnect: true,
        }
    }
}

/// Command received from a fleet server for a local device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCommand {
    pub device: DeviceIdentity,
    pub command: Vec<u8>,
}

/// FIFO of commands for locally connected devices
///
/// Each device may have at most `per_device_limit` commands pending. Pushing
/// another one drops the oldest pending command of that device.
pub struct CommandQueue {
    per_device_limit: usize,
    queue: Mutex<VecDeque<DeviceCommand>>,
    notify: Notify,
}

impl CommandQueue {
    pub fn new(per_device_limit: usize) -> Self {
        Self {
            per_device_limit: per_device_limit.max(1),
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    pub fn push(&self, command: DeviceCommand) {
        {
            let mut queue = self.queue.lock();
            let pending = queue
                .iter()
                .filter(|c| c.device == command.device)
                .count();
            if pending >= self.per_device_limit {
                if let Some(pos) = queue.iter().position(|c| c.device == command.device) {
                    queue.remove(pos);
                    warn!(
                        device = %command.device,
                        limit = self.per_device_limit,
                        "Command backlog full, dropped oldest command"
                    );
                }
            }
            queue.push_back(command);
        }
        self.notify.notify_one();
    }

    pub fn try_pop(&self) -> Option<DeviceCommand> {
        self.queue.lock().pop_front()
    }

    /// Wait up to `timeout` for the next command
    pub async fn pop(&self, timeout: Duration) -> Option<DeviceCommand> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(command) = self.try_pop() {
                return Some(command);
            }
            if tokio::time::timeout_at(deadline, self.notify.notified())
                .await
                .is_err()
            {
                return self.try_pop();
            }
        }
    }

    pub fn pending_for(&self, device: &DeviceIdentity) -> usize {
        self.queue
            .lock()
            .iter()
            .filter(|c| &c.device == device)
            .count()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}
