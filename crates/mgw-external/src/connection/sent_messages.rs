//! Tracking of sent but not yet acknowledged statuses

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use mgw_core::{DeviceIdentity, Status, StatusResponse};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Callback run when a status is not acknowledged in time
pub type TimeoutCallback = Arc<dyn Fn() + Send + Sync>;

/// One in-flight status with its expiry timer
pub struct NotAckedStatus {
    status: Status,
    sent_at: Instant,
    timer: JoinHandle<()>,
}

impl NotAckedStatus {
    pub fn status(&self) -> &Status {
        &self.status
    }

    /// Time since the status was registered
    pub fn age(&self) -> Duration {
        self.sent_at.elapsed()
    }

    fn cancel(&self) {
        self.timer.abort();
    }
}

/// Result of a successful acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Acknowledged,
    /// Nothing is in flight and no device is connected any more
    SessionEmpty,
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum AckError {
    #[error("No status with message counter {0} is awaiting acknowledgement")]
    UnknownCounter(u32),
}

struct HandlerState {
    not_acked: BTreeMap<u32, NotAckedStatus>,
    connected: HashSet<DeviceIdentity>,
    /// Set by the first expired timer of the current session
    timeout_handled: bool,
    /// Bumped whenever timers are cleared; older timers become inert
    generation: u64,
}

/// Tracks in-flight statuses and connected devices of one connection
pub struct SentMessagesHandler {
    ack_timeout: Duration,
    on_timeout: TimeoutCallback,
    state: Arc<Mutex<HandlerState>>,
}

impl SentMessagesHandler {
    pub fn new(ack_timeout: Duration, on_timeout: TimeoutCallback) -> Self {
        Self {
            ack_timeout,
            on_timeout,
            state: Arc::new(Mutex::new(HandlerState {
                not_acked: BTreeMap::new(),
                connected: HashSet::new(),
                timeout_handled: false,
                generation: 0,
            })),
        }
    }

    /// Register a sent status and start its expiry timer
    ///
    /// Must be called from within a tokio runtime.
    pub fn add_not_acked_status(&self, status: Status) {
        let counter = status.message_counter;
        let mut state = self.state.lock();
        let timer = tokio::spawn(expire(
            self.state.clone(),
            counter,
            state.generation,
            self.ack_timeout,
            self.on_timeout.clone(),
        ));

        let entry = NotAckedStatus {
            status,
            sent_at: Instant::now(),
            timer,
        };
        if let Some(previous) = state.not_acked.insert(counter, entry) {
            previous.cancel();
            warn!(counter, "Replaced in-flight status with the same message counter");
        }
    }

    /// Match an acknowledgement to its in-flight status
    pub fn acknowledge_status(&self, response: &StatusResponse) -> Result<AckOutcome, AckError> {
        let counter = response.message_counter;
        let mut state = self.state.lock();
        let entry = state
            .not_acked
            .remove(&counter)
            .ok_or(AckError::UnknownCounter(counter))?;
        entry.cancel();

        if let Some(&oldest) = state.not_acked.keys().next() {
            if oldest < counter {
                debug!(counter, oldest, "Status acknowledged out of order");
            }
        }
        debug!(counter, age_ms = entry.age().as_millis() as u64, "Status acknowledged");

        if state.connected.is_empty() && state.not_acked.is_empty() {
            Ok(AckOutcome::SessionEmpty)
        } else {
            Ok(AckOutcome::Acknowledged)
        }
    }

    /// Returns true if the device was not connected before
    pub fn add_device_as_connected(&self, device: &DeviceIdentity) -> bool {
        self.state.lock().connected.insert(device.clone())
    }

    /// Returns true if the device was connected
    pub fn delete_connected_device(&self, device: &DeviceIdentity) -> bool {
        self.state.lock().connected.remove(device)
    }

    pub fn is_device_connected(&self, device: &DeviceIdentity) -> bool {
        self.state.lock().connected.contains(device)
    }

    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        self.state.lock().connected.iter().cloned().collect()
    }

    /// Cancel every pending timer and re-arm the timeout guard
    ///
    /// In-flight entries are kept so they can still be collected with
    /// [`get_not_acked_statuses`](Self::get_not_acked_statuses).
    pub fn clear_all_timers(&self) {
        let mut state = self.state.lock();
        for entry in state.not_acked.values() {
            entry.cancel();
        }
        state.timeout_handled = false;
        state.generation = state.generation.wrapping_add(1);
    }

    /// In-flight statuses ordered by message counter
    pub fn get_not_acked_statuses(&self) -> Vec<Status> {
        self.state
            .lock()
            .not_acked
            .values()
            .map(|e| e.status().clone())
            .collect()
    }

    pub fn not_acked_count(&self) -> usize {
        self.state.lock().not_acked.len()
    }

    /// Forget every in-flight status and connected device
    pub fn clear(&self) {
        let mut state = self.state.lock();
        for entry in state.not_acked.values() {
            entry.cancel();
        }
        state.not_acked.clear();
        state.connected.clear();
    }
}

impl Drop for SentMessagesHandler {
    fn drop(&mut self) {
        for entry in self.state.lock().not_acked.values() {
            entry.cancel();
        }
    }
}

async fn expire(
    state: Arc<Mutex<HandlerState>>,
    counter: u32,
    generation: u64,
    timeout: Duration,
    on_timeout: TimeoutCallback,
) {
    tokio::time::sleep(timeout).await;

    let fire = {
        let mut state = state.lock();
        if state.generation != generation
            || !state.not_acked.contains_key(&counter)
            || state.timeout_handled
        {
            false
        } else {
            state.timeout_handled = true;
            true
        }
    };

    if fire {
        warn!(counter, "Status was not acknowledged in time");
        on_timeout();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mgw_core::{DeviceState, DeviceStatus, StatusResponseType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn device(role: &str) -> DeviceIdentity {
        DeviceIdentity::new(1, 0, role, role, 0)
    }

    fn status(counter: u32) -> Status {
        Status {
            session_id: "car_s".to_string(),
            device_state: DeviceState::Running,
            message_counter: counter,
            device_status: DeviceStatus {
                device: device("a"),
                status_data: vec![counter as u8],
            },
            error_message: None,
        }
    }

    fn ack(counter: u32) -> StatusResponse {
        StatusResponse {
            session_id: "car_s".to_string(),
            response_type: StatusResponseType::Ok,
            message_counter: counter,
        }
    }

    fn handler(timeout_ms: u64) -> (SentMessagesHandler, Arc<AtomicUsize>) {
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        let handler = SentMessagesHandler::new(
            Duration::from_millis(timeout_ms),
            Arc::new(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (handler, fired)
    }

    #[tokio::test]
    async fn test_acknowledge_cancels_timer() {
        let (handler, fired) = handler(30);
        handler.add_device_as_connected(&device("a"));
        handler.add_not_acked_status(status(0));

        assert_eq!(
            handler.acknowledge_status(&ack(0)),
            Ok(AckOutcome::Acknowledged)
        );
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        assert_eq!(handler.not_acked_count(), 0);
    }

    #[tokio::test]
    async fn test_unknown_counter() {
        let (handler, _) = handler(1000);
        handler.add_not_acked_status(status(3));
        assert_eq!(
            handler.acknowledge_status(&ack(4)),
            Err(AckError::UnknownCounter(4))
        );
        assert_eq!(handler.not_acked_count(), 1);
    }

    #[tokio::test]
    async fn test_session_empty_after_last_ack() {
        let (handler, _) = handler(1000);
        handler.add_device_as_connected(&device("a"));
        handler.add_not_acked_status(status(0));
        handler.add_not_acked_status(status(1));

        assert!(handler.delete_connected_device(&device("a")));
        assert_eq!(
            handler.acknowledge_status(&ack(0)),
            Ok(AckOutcome::Acknowledged)
        );
        assert_eq!(
            handler.acknowledge_status(&ack(1)),
            Ok(AckOutcome::SessionEmpty)
        );
    }

    #[tokio::test]
    async fn test_timeout_fires_once_for_many_statuses() {
        let (handler, fired) = handler(20);
        for counter in 0..5 {
            handler.add_not_acked_status(status(counter));
        }
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_concurrent_acks_and_expiry_fire_once() {
        let (handler, fired) = handler(20);
        let handler = Arc::new(handler);
        for counter in 0..10 {
            handler.add_not_acked_status(status(counter));
        }

        let acker = handler.clone();
        let acks = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(19)).await;
            for counter in (0..10).step_by(2) {
                let _ = acker.acknowledge_status(&ack(counter));
            }
        });
        acks.await.unwrap();
        tokio::time::sleep(Duration::from_millis(120)).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_all_timers_rearms_guard() {
        let (handler, fired) = handler(20);
        handler.add_not_acked_status(status(0));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        handler.clear_all_timers();
        assert_eq!(handler.get_not_acked_statuses().len(), 1);
        handler.clear();

        handler.add_not_acked_status(status(1));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cleared_timers_never_fire() {
        let (handler, fired) = handler(20);
        handler.add_not_acked_status(status(0));
        handler.add_not_acked_status(status(1));
        handler.clear_all_timers();

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let counters: Vec<u32> = handler
            .get_not_acked_statuses()
            .iter()
            .map(|s| s.message_counter)
            .collect();
        assert_eq!(counters, vec![0, 1]);
    }
}
