//! External client
//!
//! Owns one [`ExternalConnection`] per configured endpoint and drives them
//! from a single event loop. Outgoing statuses are routed by module number;
//! teardown requests, handshake completions and retry timers are serialized
//! through dedicated queues so that a connection never runs two handshakes
//! at once.

use std::collections::HashMap;
use std::sync::Arc;

use mgw_core::{
    AggregatedStatus, CommandQueue, DeviceIdentity, DeviceState, DeviceStatus, ModuleLibrary,
};
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigError, ExternalClientConfig};
use crate::connection::{ConnectionId, ConnectionState, ExternalConnection, ReconnectRequest};
use crate::transport::{create_channel, ExternalChannel, TransportError};

/// Capacity of the inbound status queue
const STATUS_QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{provided} channels provided for {expected} endpoints")]
    ChannelCount { expected: usize, provided: usize },

    #[error("Endpoint '{endpoint}' serves module {module}, which is not loaded")]
    UnknownModule { endpoint: String, module: u32 },
}

/// Outcome of a handshake task
#[derive(Debug)]
struct HandshakeFinished {
    connection: ConnectionId,
    connected: bool,
}

/// Orchestrates all external connections of the process
pub struct ExternalClient {
    config: Arc<ExternalClientConfig>,
    connections: Vec<Arc<ExternalConnection>>,
    /// Module number to the connection serving it
    routing: HashMap<u32, ConnectionId>,
    status_tx: mpsc::Sender<AggregatedStatus>,
    status_rx: mpsc::Receiver<AggregatedStatus>,
    commands: Arc<CommandQueue>,
    reconnect_rx: mpsc::UnboundedReceiver<ReconnectRequest>,
    handshake_tx: mpsc::UnboundedSender<HandshakeFinished>,
    handshake_rx: mpsc::UnboundedReceiver<HandshakeFinished>,
    retry_tx: mpsc::UnboundedSender<ConnectionId>,
    retry_rx: mpsc::UnboundedReceiver<ConnectionId>,
    /// Latest status of every locally connected device
    registry: HashMap<DeviceIdentity, Vec<u8>>,
    /// Running handshake tasks
    handshakes: HashMap<ConnectionId, JoinHandle<()>>,
    /// Teardown requests that arrived while their connection was handshaking
    deferred_teardowns: HashMap<ConnectionId, ReconnectRequest>,
    /// Statuses that arrived while their connection was handshaking
    parked: HashMap<ConnectionId, Vec<AggregatedStatus>>,
    /// Armed reconnect timers, at most one per connection
    retries: HashMap<ConnectionId, JoinHandle<()>>,
}

impl ExternalClient {
    /// Create a client with one channel per configured endpoint
    pub fn new(config: ExternalClientConfig, modules: ModuleLibrary) -> Result<Self, ClientError> {
        let vehicle = config.vehicle();
        let channels = config
            .endpoints
            .iter()
            .map(|endpoint| create_channel(&endpoint.transport, &vehicle))
            .collect::<Result<Vec<_>, _>>()?;
        Self::from_channels(config, modules, channels)
    }

    /// Create a client over existing channels, one per endpoint in order
    pub fn from_channels(
        config: ExternalClientConfig,
        modules: ModuleLibrary,
        channels: Vec<Arc<dyn ExternalChannel>>,
    ) -> Result<Self, ClientError> {
        config.validate()?;
        if channels.len() != config.endpoints.len() {
            return Err(ClientError::ChannelCount {
                expected: config.endpoints.len(),
                provided: channels.len(),
            });
        }
        for endpoint in &config.endpoints {
            if let Some(&module) = endpoint.modules.iter().find(|m| !modules.contains(**m)) {
                return Err(ClientError::UnknownModule {
                    endpoint: endpoint.name.clone(),
                    module,
                });
            }
        }

        let config = Arc::new(config);
        let commands = Arc::new(CommandQueue::new(config.command_backlog));
        let (status_tx, status_rx) = mpsc::channel(STATUS_QUEUE_CAPACITY);
        let (reconnect_tx, reconnect_rx) = mpsc::unbounded_channel();
        let (handshake_tx, handshake_rx) = mpsc::unbounded_channel();
        let (retry_tx, retry_rx) = mpsc::unbounded_channel();

        let mut connections = Vec::with_capacity(channels.len());
        let mut routing = HashMap::new();
        for (index, (endpoint, channel)) in config.endpoints.iter().zip(channels).enumerate() {
            let id = ConnectionId(index);
            for &module in &endpoint.modules {
                routing.insert(module, id);
            }
            info!(
                connection = %id,
                endpoint = %endpoint.name,
                channel = %channel.describe(),
                modules = ?endpoint.modules,
                "Registered external endpoint"
            );
            connections.push(Arc::new(ExternalConnection::new(
                id,
                endpoint,
                config.clone(),
                channel,
                &modules,
                commands.clone(),
                reconnect_tx.clone(),
            )));
        }

        Ok(Self {
            config,
            connections,
            routing,
            status_tx,
            status_rx,
            commands,
            reconnect_rx,
            handshake_tx,
            handshake_rx,
            retry_tx,
            retry_rx,
            registry: HashMap::new(),
            handshakes: HashMap::new(),
            deferred_teardowns: HashMap::new(),
            parked: HashMap::new(),
            retries: HashMap::new(),
        })
    }

    /// Queue on which the local server side hands over device statuses
    pub fn status_sender(&self) -> mpsc::Sender<AggregatedStatus> {
        self.status_tx.clone()
    }

    /// Commands received from fleet servers for local devices
    pub fn commands(&self) -> Arc<CommandQueue> {
        self.commands.clone()
    }

    pub fn connections(&self) -> &[Arc<ExternalConnection>] {
        &self.connections
    }

    /// Connection serving `module`
    pub fn route(&self, module: u32) -> Option<&Arc<ExternalConnection>> {
        self.routing.get(&module).map(|id| &self.connections[id.0])
    }

    /// Run until `shutdown` turns true or its sender is dropped
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            vehicle = %self.config.vehicle_name,
            endpoints = self.connections.len(),
            "External client started"
        );

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                Some(request) = self.reconnect_rx.recv() => self.handle_reconnect(request).await,
                Some(finished) = self.handshake_rx.recv() => self.handle_handshake_finished(finished).await,
                Some(id) = self.retry_rx.recv() => self.handle_retry(id),
                Some(status) = self.status_rx.recv() => self.dispatch_status(status).await,
            }
        }

        self.shutdown().await;
    }

    async fn handle_reconnect(&mut self, request: ReconnectRequest) {
        let id = request.connection;
        if self.handshakes.contains_key(&id) {
            // The new session's receive loop can fail before the handshake
            // task has reported back
            debug!(connection = %id, "Handshake still running, teardown deferred");
            self.deferred_teardowns
                .entry(id)
                .and_modify(|deferred| deferred.reconnect |= request.reconnect)
                .or_insert(request);
            return;
        }
        let connection = self.connections[id.0].clone();
        if connection.state() == ConnectionState::NotInitialized {
            debug!(connection = %id, "Connection already torn down");
        } else {
            connection.deinitialize_connection(false).await;
        }

        if request.reconnect {
            self.start_handshake(id);
        } else {
            info!(connection = %id, "Connection idle until a device reports");
        }
    }

    async fn handle_handshake_finished(&mut self, finished: HandshakeFinished) {
        let id = finished.connection;
        self.handshakes.remove(&id);
        let deferred = self.deferred_teardowns.remove(&id);
        if !finished.connected {
            self.schedule_retry(id);
        } else if let Some(request) = deferred {
            self.handle_reconnect(request).await;
        }

        let parked = self.parked.remove(&id).unwrap_or_default();
        if self.handshakes.contains_key(&id) {
            if !parked.is_empty() {
                self.parked.insert(id, parked);
            }
            return;
        }
        if !parked.is_empty() {
            debug!(connection = %id, count = parked.len(), "Dispatching statuses parked during handshake");
        }
        for status in parked {
            self.deliver(id, status).await;
        }
    }

    fn handle_retry(&mut self, id: ConnectionId) {
        self.retries.remove(&id);
        let connection = &self.connections[id.0];
        if connection.is_connected() || self.handshakes.contains_key(&id) {
            return;
        }
        debug!(connection = %id, "Retrying connection");
        self.start_handshake(id);
    }

    async fn dispatch_status(&mut self, status: AggregatedStatus) {
        if status.disconnect {
            self.registry.remove(&status.device);
        } else {
            self.registry
                .insert(status.device.clone(), status.status.clone());
        }

        let Some(&id) = self.routing.get(&status.device.module) else {
            warn!(device = %status.device, "No endpoint serves the module of this device");
            return;
        };

        if self.handshakes.contains_key(&id) {
            self.parked.entry(id).or_default().push(status);
            return;
        }
        self.deliver(id, status).await;
    }

    /// Send a status, or buffer it and make sure a handshake will follow
    async fn deliver(&mut self, id: ConnectionId, status: AggregatedStatus) {
        let connection = self.connections[id.0].clone();
        let device_state = if status.disconnect {
            DeviceState::Disconnect
        } else {
            DeviceState::Running
        };
        let device_status = DeviceStatus {
            device: status.device,
            status_data: status.status,
        };

        if connection
            .send_status(device_status.clone(), device_state, None)
            .await
        {
            return;
        }

        if status.disconnect {
            connection.forget_device(&device_status.device);
        } else if !connection.buffer_status(&device_status) {
            warn!(connection = %id, device = %device_status.device, "Status dropped, device not supported");
            return;
        }

        match connection.state() {
            ConnectionState::NotInitialized if !status.disconnect => self.start_handshake(id),
            ConnectionState::NotInitialized => {}
            _ => self.schedule_retry(id),
        }
    }

    fn start_handshake(&mut self, id: ConnectionId) {
        if self.handshakes.contains_key(&id) {
            return;
        }
        if let Some(timer) = self.retries.remove(&id) {
            timer.abort();
        }

        let connection = self.connections[id.0].clone();
        let mut devices: Vec<DeviceStatus> = self
            .registry
            .iter()
            .filter(|(device, _)| connection.serves_module(device.module))
            .map(|(device, data)| DeviceStatus {
                device: device.clone(),
                status_data: data.clone(),
            })
            .collect();
        devices.sort_by(|a, b| {
            let key = |d: &DeviceIdentity| (d.priority, d.module, d.device_type, d.role.clone());
            key(&a.device).cmp(&key(&b.device))
        });

        debug!(connection = %id, devices = devices.len(), "Starting handshake");
        let done = self.handshake_tx.clone();
        let handle = tokio::spawn(async move {
            let connected = connection.initialize_connection(devices).await.is_ok();
            let _ = done.send(HandshakeFinished {
                connection: id,
                connected,
            });
        });
        self.handshakes.insert(id, handle);
    }

    fn schedule_retry(&mut self, id: ConnectionId) {
        if self.retries.contains_key(&id) {
            return;
        }
        let delay = self.config.reconnect_delay();
        let tx = self.retry_tx.clone();
        debug!(connection = %id, delay_ms = delay.as_millis() as u64, "Reconnect scheduled");
        self.retries.insert(
            id,
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = tx.send(id);
            }),
        );
    }

    async fn shutdown(&mut self) {
        info!("Shutting down external client");
        self.deferred_teardowns.clear();
        for (_, timer) in self.retries.drain() {
            timer.abort();
        }
        for (_, handshake) in self.handshakes.drain() {
            handshake.abort();
            let _ = handshake.await;
        }
        for connection in &self.connections {
            connection.deinitialize_connection(true).await;
        }
        info!("External client stopped");
    }
}
