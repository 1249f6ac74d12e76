//! Connection to one fleet-server endpoint
//!
//! A connection lives as long as the process. Each successful handshake
//! starts a session that ends with [`ExternalConnection::deinitialize_connection`].
//!
//! Handshake:
//! 1. connect request / connect response
//! 2. one `CONNECTING` status per connected device, then one acknowledgement each
//! 3. one command per connected device
//!
//! Statuses that are unacknowledged when a session ends are folded back into
//! the error aggregators and replayed by the next handshake.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use std::sync::Arc;

use mgw_core::{
    Command, CommandQueue, CommandResponse, CommandResponseType, ConnectRequest,
    ConnectResponseType, DeviceCommand, DeviceIdentity, DeviceState, DeviceStatus,
    ExternalClientMessage, ExternalServerMessage, ModuleLibrary, Status,
};
use parking_lot::{Mutex, RwLock};
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    AckOutcome, ConnectionError, ConnectionId, ConnectionState, ReconnectRequest,
    SentMessagesHandler,
};
use crate::aggregator::{AggregatorError, ErrorAggregator};
use crate::config::{EndpointConfig, ExternalClientConfig};
use crate::transport::ExternalChannel;

/// Session engine for one endpoint
pub struct ExternalConnection {
    id: ConnectionId,
    name: String,
    config: Arc<ExternalClientConfig>,
    channel: Arc<dyn ExternalChannel>,
    /// Device modules served by this endpoint
    modules: ModuleLibrary,
    state: AtomicU8,
    session_id: RwLock<String>,
    /// Counter of outgoing statuses
    client_counter: AtomicU32,
    /// Counter of the last accepted inbound command
    server_counter: Mutex<Option<u32>>,
    sent: SentMessagesHandler,
    aggregators: Mutex<BTreeMap<u32, ErrorAggregator>>,
    commands: Arc<CommandQueue>,
    reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    receiver: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl ExternalConnection {
    pub fn new(
        id: ConnectionId,
        endpoint: &EndpointConfig,
        config: Arc<ExternalClientConfig>,
        channel: Arc<dyn ExternalChannel>,
        library: &ModuleLibrary,
        commands: Arc<CommandQueue>,
        reconnect_tx: mpsc::UnboundedSender<ReconnectRequest>,
    ) -> Self {
        let mut modules = ModuleLibrary::new();
        let mut aggregators = BTreeMap::new();
        for &number in &endpoint.modules {
            match library.get(number) {
                Some(module) => {
                    modules.register(module.clone());
                    aggregators.insert(number, ErrorAggregator::new(module.clone()));
                }
                None => {
                    warn!(connection = %id, module = number, "Endpoint references unknown device module")
                }
            }
        }

        let timeout_tx = reconnect_tx.clone();
        let sent = SentMessagesHandler::new(
            config.status_ack_timeout(),
            Arc::new(move || {
                let request = ReconnectRequest {
                    connection: id,
                    reconnect: true,
                };
                if timeout_tx.send(request).is_err() {
                    debug!(connection = %id, "Reconnect queue closed, timeout ignored");
                }
            }),
        );

        Self {
            id,
            name: endpoint.name.clone(),
            config,
            channel,
            modules,
            state: AtomicU8::new(ConnectionState::NotInitialized.as_u8()),
            session_id: RwLock::new(String::new()),
            client_counter: AtomicU32::new(0),
            server_counter: Mutex::new(None),
            sent,
            aggregators: Mutex::new(aggregators),
            commands,
            reconnect_tx,
            receiver: tokio::sync::Mutex::new(None),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Session id of the current or last handshake
    pub fn session_id(&self) -> String {
        self.session_id.read().clone()
    }

    pub fn module_numbers(&self) -> Vec<u32> {
        self.modules.module_numbers()
    }

    pub fn serves_module(&self, module: u32) -> bool {
        self.modules.contains(module)
    }

    pub fn describe_channel(&self) -> String {
        self.channel.describe()
    }

    pub fn is_device_connected(&self, device: &DeviceIdentity) -> bool {
        self.sent.is_device_connected(device)
    }

    pub fn connected_devices(&self) -> Vec<DeviceIdentity> {
        self.sent.connected_devices()
    }

    pub fn not_acked_count(&self) -> usize {
        self.sent.not_acked_count()
    }

    /// Last status buffered for `device`
    pub fn buffered_status(&self, device: &DeviceIdentity) -> Result<Vec<u8>, AggregatorError> {
        let aggregators = self.aggregators.lock();
        aggregators
            .get(&device.module)
            .ok_or(AggregatorError::DeviceNotSupported {
                module: device.module,
                device_type: device.device_type,
            })?
            .get_last_status(device)
    }

    /// Error summary buffered for `device`
    pub fn buffered_error(&self, device: &DeviceIdentity) -> Result<Vec<u8>, AggregatorError> {
        let aggregators = self.aggregators.lock();
        aggregators
            .get(&device.module)
            .ok_or(AggregatorError::DeviceNotSupported {
                module: device.module,
                device_type: device.device_type,
            })?
            .get_error(device)
    }

    /// Fold a status that cannot be sent now into the error aggregator
    ///
    /// Returns false if the device is not served by this connection.
    pub fn buffer_status(&self, status: &DeviceStatus) -> bool {
        let mut aggregators = self.aggregators.lock();
        let Some(aggregator) = aggregators.get_mut(&status.device.module) else {
            return false;
        };
        match aggregator.add(&status.status_data, &status.device) {
            Ok(()) => true,
            Err(e) => {
                warn!(connection = %self.id, device = %status.device, %e, "Status could not be buffered");
                false
            }
        }
    }

    /// Drop the buffered backlog of a device that left the vehicle
    pub fn forget_device(&self, device: &DeviceIdentity) {
        if let Some(aggregator) = self.aggregators.lock().get_mut(&device.module) {
            aggregator.remove_device(device);
        }
    }

    fn next_counter(&self) -> u32 {
        self.client_counter.fetch_add(1, Ordering::SeqCst)
    }

    fn reset_counters(&self) {
        self.client_counter.store(0, Ordering::SeqCst);
        *self.server_counter.lock() = None;
    }

    fn generate_session_id(&self) -> String {
        let previous = self.session_id.read().clone();
        loop {
            let suffix: String = rand::thread_rng()
                .sample_iter(&Alphanumeric)
                .take(self.config.session_id_length)
                .map(char::from)
                .collect();
            let session_id = format!("{}{}", self.config.vehicle_name, suffix);
            if session_id != previous {
                return session_id;
            }
        }
    }

    fn check_session(&self, received: &str) -> Result<(), ConnectionError> {
        let expected = self.session_id.read();
        if *expected != received {
            return Err(ConnectionError::SessionMismatch {
                expected: expected.clone(),
                received: received.to_string(),
            });
        }
        Ok(())
    }

    fn request_reconnect(&self, reconnect: bool) {
        let request = ReconnectRequest {
            connection: self.id,
            reconnect,
        };
        if self.reconnect_tx.send(request).is_err() {
            debug!(connection = %self.id, "Reconnect queue closed");
        }
    }

    // =========================================================================
    // Handshake
    // =========================================================================

    /// Run the three-phase handshake
    ///
    /// `connected_devices` are the devices currently attached locally, each
    /// with its latest status. Buffered statuses from the error aggregators
    /// take precedence over the given ones. On failure the connection is left
    /// in [`ConnectionState::NotConnected`] and the caller schedules a retry.
    ///
    /// Two handshakes must not run concurrently on one connection.
    pub async fn initialize_connection(
        self: &Arc<Self>,
        connected_devices: Vec<DeviceStatus>,
    ) -> Result<(), ConnectionError> {
        let current = self.state();
        if !matches!(
            current,
            ConnectionState::NotInitialized | ConnectionState::NotConnected
        ) {
            return Err(ConnectionError::InvalidState(current));
        }
        self.state
            .compare_exchange(
                current.as_u8(),
                ConnectionState::NotConnected.as_u8(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .map_err(|actual| ConnectionError::InvalidState(ConnectionState::from_u8(actual)))?;

        self.stop_receiver().await;
        self.sent.clear_all_timers();
        self.sent.clear();
        self.reset_counters();

        if let Err(e) = self.channel.open().await {
            warn!(connection = %self.id, channel = %self.channel.describe(), %e, "Failed to open channel");
            return Err(e.into());
        }
        self.set_state(ConnectionState::Connecting);

        match self.handshake(&connected_devices).await {
            Ok(()) => {
                // The backlog has been replayed
                for aggregator in self.aggregators.lock().values_mut() {
                    aggregator.clear();
                }
                self.set_state(ConnectionState::Connected);
                self.start_receiver().await;
                info!(
                    connection = %self.id,
                    endpoint = %self.name,
                    session_id = %self.session_id(),
                    devices = connected_devices.len(),
                    "Connected to fleet server"
                );
                Ok(())
            }
            Err(e) => {
                warn!(connection = %self.id, endpoint = %self.name, %e, "Handshake failed");
                self.sent.clear_all_timers();
                self.sent.clear();
                self.channel.close().await;
                self.set_state(ConnectionState::NotConnected);
                Err(e)
            }
        }
    }

    async fn handshake(&self, devices: &[DeviceStatus]) -> Result<(), ConnectionError> {
        let session_id = self.generate_session_id();
        *self.session_id.write() = session_id.clone();
        debug!(connection = %self.id, %session_id, "Starting handshake");

        self.connect_phase(&session_id, devices).await?;
        self.status_phase(&session_id, devices).await?;
        self.command_phase(devices.len()).await
    }

    async fn receive_handshake(
        &self,
        expected: &'static str,
    ) -> Result<ExternalServerMessage, ConnectionError> {
        self.channel
            .receive(self.config.response_timeout())
            .await?
            .ok_or(ConnectionError::NoResponse(expected))
    }

    async fn connect_phase(
        &self,
        session_id: &str,
        devices: &[DeviceStatus],
    ) -> Result<(), ConnectionError> {
        let request = ConnectRequest {
            session_id: session_id.to_string(),
            company: self.config.company.clone(),
            vehicle_name: self.config.vehicle_name.clone(),
            devices: devices.iter().map(|d| d.device.clone()).collect(),
        };
        self.channel
            .send(&ExternalClientMessage::Connect(request))
            .await?;

        match self.receive_handshake("connect response").await? {
            ExternalServerMessage::ConnectResponse(response) => {
                self.check_session(&response.session_id)?;
                if response.response_type == ConnectResponseType::AlreadyLogged {
                    return Err(ConnectionError::AlreadyLogged);
                }
                Ok(())
            }
            other => Err(ConnectionError::UnexpectedMessage {
                expected: "connect_response",
                received: other.kind(),
            }),
        }
    }

    async fn status_phase(
        &self,
        session_id: &str,
        devices: &[DeviceStatus],
    ) -> Result<(), ConnectionError> {
        for device_status in devices {
            let status = self.replay_status(session_id, device_status);
            self.sent.add_device_as_connected(&device_status.device);
            self.sent.add_not_acked_status(status.clone());
            self.channel
                .send(&ExternalClientMessage::Status(status))
                .await?;
        }

        for _ in devices {
            match self.receive_handshake("status response").await? {
                ExternalServerMessage::StatusResponse(response) => {
                    self.check_session(&response.session_id)?;
                    self.sent.acknowledge_status(&response)?;
                }
                other => {
                    return Err(ConnectionError::UnexpectedMessage {
                        expected: "status_response",
                        received: other.kind(),
                    })
                }
            }
        }
        Ok(())
    }

    async fn command_phase(&self, expected_commands: usize) -> Result<(), ConnectionError> {
        for _ in 0..expected_commands {
            match self.receive_handshake("command").await? {
                ExternalServerMessage::Command(command) => self.handle_command(command).await?,
                other => {
                    return Err(ConnectionError::UnexpectedMessage {
                        expected: "command",
                        received: other.kind(),
                    })
                }
            }
        }
        Ok(())
    }

    /// First-contact status of a device, preferring the buffered backlog
    fn replay_status(&self, session_id: &str, device_status: &DeviceStatus) -> Status {
        let device = &device_status.device;
        let (status_data, error_message) = {
            let aggregators = self.aggregators.lock();
            match aggregators.get(&device.module) {
                Some(aggregator) => (
                    aggregator
                        .get_last_status(device)
                        .unwrap_or_else(|_| device_status.status_data.clone()),
                    aggregator.get_error(device).ok(),
                ),
                None => (device_status.status_data.clone(), None),
            }
        };

        Status {
            session_id: session_id.to_string(),
            device_state: DeviceState::Connecting,
            message_counter: self.next_counter(),
            device_status: DeviceStatus {
                device: device.clone(),
                status_data,
            },
            error_message,
        }
    }

    // =========================================================================
    // Steady state
    // =========================================================================

    /// Send a status within the current session
    ///
    /// Returns false if there is no session; the caller then buffers the
    /// status. A failing send still returns true: the status stays tracked
    /// and is folded back into the error aggregator by the teardown that the
    /// failure schedules.
    pub async fn send_status(
        &self,
        status: DeviceStatus,
        requested_state: DeviceState,
        error_message: Option<Vec<u8>>,
    ) -> bool {
        if !self.is_connected() {
            return false;
        }

        let device = &status.device;
        let device_state = match requested_state {
            DeviceState::Disconnect => {
                self.sent.delete_connected_device(device);
                DeviceState::Disconnect
            }
            DeviceState::Running if self.sent.add_device_as_connected(device) => {
                debug!(connection = %self.id, %device, "Promoting first status of device to CONNECTING");
                DeviceState::Connecting
            }
            DeviceState::Connecting => {
                self.sent.add_device_as_connected(device);
                DeviceState::Connecting
            }
            other => other,
        };

        {
            let mut aggregators = self.aggregators.lock();
            if let Some(aggregator) = aggregators.get_mut(&device.module) {
                let recorded = if aggregator.is_device_registered(device) {
                    aggregator.set_last_status(&status.status_data, device)
                } else {
                    aggregator.add(&status.status_data, device)
                };
                if let Err(e) = recorded {
                    debug!(connection = %self.id, %device, %e, "No baseline recorded");
                }
            }
        }

        let message = Status {
            session_id: self.session_id(),
            device_state,
            message_counter: self.next_counter(),
            device_status: status,
            error_message,
        };
        let counter = message.message_counter;
        self.sent.add_not_acked_status(message.clone());

        if let Err(e) = self.channel.send(&ExternalClientMessage::Status(message)).await {
            error!(connection = %self.id, counter, %e, "Failed to send status, reconnecting");
            self.request_reconnect(true);
        }
        true
    }

    /// Handle a command pushed by the server
    ///
    /// Command counters must be strictly sequential after the first command
    /// of a session.
    async fn handle_command(&self, command: Command) -> Result<(), ConnectionError> {
        self.check_session(&command.session_id)?;
        {
            let mut last = self.server_counter.lock();
            if let Some(previous) = *last {
                let expected = previous.wrapping_add(1);
                if command.message_counter != expected {
                    return Err(ConnectionError::Desynchronized {
                        expected,
                        received: command.message_counter,
                    });
                }
            }
            *last = Some(command.message_counter);
        }

        let device = command.device;
        let response_type = if self.sent.is_device_connected(&device) {
            self.commands.push(DeviceCommand {
                device: device.clone(),
                command: command.command_data,
            });
            CommandResponseType::Ok
        } else if !self.modules.is_device_supported(&device) {
            warn!(connection = %self.id, %device, "Command for unsupported device");
            CommandResponseType::DeviceNotSupported
        } else {
            warn!(connection = %self.id, %device, "Command for device that is not connected");
            CommandResponseType::DeviceNotConnected
        };

        let response = CommandResponse {
            session_id: self.session_id(),
            response_type,
            message_counter: command.message_counter,
        };
        self.channel
            .send(&ExternalClientMessage::CommandResponse(response))
            .await?;
        Ok(())
    }

    async fn start_receiver(self: &Arc<Self>) {
        let connection = Arc::clone(self);
        let handle = tokio::spawn(async move { connection.receive_loop().await });
        *self.receiver.lock().await = Some(handle);
    }

    async fn stop_receiver(&self) {
        if let Some(handle) = self.receiver.lock().await.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    async fn receive_loop(&self) {
        let poll = self.config.receive_poll();
        loop {
            match self.state() {
                ConnectionState::Connected => {}
                ConnectionState::Connecting => {
                    tokio::time::sleep(poll).await;
                    continue;
                }
                state => {
                    debug!(connection = %self.id, ?state, "Receive loop stopped");
                    return;
                }
            }

            let message = match self.channel.receive(poll).await {
                Ok(Some(message)) => message,
                Ok(None) => continue,
                Err(e) => {
                    warn!(connection = %self.id, %e, "Receive failed, reconnecting");
                    self.request_reconnect(true);
                    return;
                }
            };

            match message {
                ExternalServerMessage::Command(command) => {
                    if let Err(e) = self.handle_command(command).await {
                        warn!(connection = %self.id, %e, "Command rejected, reconnecting");
                        self.request_reconnect(true);
                        return;
                    }
                }
                ExternalServerMessage::StatusResponse(response) => {
                    if let Err(e) = self.check_session(&response.session_id) {
                        warn!(connection = %self.id, %e, "Acknowledgement rejected, reconnecting");
                        self.request_reconnect(true);
                        return;
                    }
                    match self.sent.acknowledge_status(&response) {
                        Ok(AckOutcome::Acknowledged) => {}
                        Ok(AckOutcome::SessionEmpty) => {
                            info!(connection = %self.id, "No device connected and nothing in flight, closing session");
                            self.request_reconnect(false);
                            return;
                        }
                        Err(e) => warn!(connection = %self.id, %e, "Ignoring acknowledgement"),
                    }
                }
                other => {
                    warn!(connection = %self.id, kind = other.kind(), "Unexpected message, reconnecting");
                    self.request_reconnect(true);
                    return;
                }
            }
        }
    }

    // =========================================================================
    // Teardown
    // =========================================================================

    /// End the current session
    ///
    /// When `complete` is false, every unacknowledged status is folded back
    /// into its error aggregator for replay; when true, the aggregators are
    /// emptied instead. No timer or receive loop of the session is active
    /// once this returns. Must not be called from the receive loop.
    pub async fn deinitialize_connection(&self, complete: bool) {
        self.set_state(ConnectionState::NotInitialized);
        self.reset_counters();
        self.sent.clear_all_timers();
        self.stop_receiver().await;
        self.channel.close().await;

        let pending = self.sent.get_not_acked_statuses();
        {
            let mut aggregators = self.aggregators.lock();
            if complete {
                for aggregator in aggregators.values_mut() {
                    aggregator.clear();
                }
            } else {
                for status in &pending {
                    let device = status.device();
                    let Some(aggregator) = aggregators.get_mut(&device.module) else {
                        continue;
                    };
                    if let Err(e) = aggregator.add(&status.device_status.status_data, device) {
                        warn!(connection = %self.id, %device, %e, "Unacknowledged status lost");
                    }
                }
            }
        }
        self.sent.clear();

        info!(
            connection = %self.id,
            endpoint = %self.name,
            complete,
            replayed = if complete { 0 } else { pending.len() },
            "Connection torn down"
        );
    }
}
