//! MQTT broker channel
//!
//! The gateway publishes on `{company}/{vehicle}/module_gateway` and listens
//! on `{company}/{vehicle}/external_server`. Both directions use QoS 1.

use std::time::Duration;

use async_trait::async_trait;
use mgw_core::{ExternalClientMessage, ExternalServerMessage};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{ExternalChannel, TransportError};
use crate::config::{MqttConfig, VehicleIdentity};

const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

enum BrokerEvent {
    Connected,
    Message(Vec<u8>),
    Disconnected(String),
}

/// MQTT channel to a fleet server
pub struct MqttChannel {
    config: MqttConfig,
    client_id: String,
    publish_topic: String,
    subscribe_topic: String,
    client: parking_lot::Mutex<Option<AsyncClient>>,
    events: tokio::sync::Mutex<Option<mpsc::Receiver<BrokerEvent>>>,
    poller: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttChannel {
    pub fn new(config: &MqttConfig, vehicle: &VehicleIdentity) -> Self {
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(6)
            .map(char::from)
            .collect();
        let prefix = format!("{}/{}", vehicle.company, vehicle.vehicle_name);

        Self {
            config: config.clone(),
            client_id: format!("{}_{}_mgw_{}", vehicle.company, vehicle.vehicle_name, suffix),
            publish_topic: format!("{}/module_gateway", prefix),
            subscribe_topic: format!("{}/external_server", prefix),
            client: parking_lot::Mutex::new(None),
            events: tokio::sync::Mutex::new(None),
            poller: parking_lot::Mutex::new(None),
        }
    }

    pub fn publish_topic(&self) -> &str {
        &self.publish_topic
    }

    pub fn subscribe_topic(&self) -> &str {
        &self.subscribe_topic
    }

    fn stop_poller(&self) {
        if let Some(handle) = self.poller.lock().take() {
            handle.abort();
        }
    }
}

async fn poll_broker(mut eventloop: EventLoop, events: mpsc::Sender<BrokerEvent>) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => BrokerEvent::Connected,
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                BrokerEvent::Message(publish.payload.to_vec())
            }
            Ok(_) => continue,
            Err(e) => {
                let _ = events.send(BrokerEvent::Disconnected(e.to_string())).await;
                break;
            }
        };
        if events.send(event).await.is_err() {
            break;
        }
    }
}

#[async_trait]
impl ExternalChannel for MqttChannel {
    async fn open(&self) -> Result<(), TransportError> {
        self.close().await;

        let mut options =
            MqttOptions::new(self.client_id.clone(), self.config.host.clone(), self.config.port);
        options.set_keep_alive(Duration::from_secs(self.config.keepalive_secs));
        options.set_clean_session(true);

        info!(broker = %self.describe(), topic = %self.subscribe_topic, "Connecting to MQTT broker");

        let (client, eventloop) = AsyncClient::new(options, REQUEST_CAPACITY);
        let (tx, mut rx) = mpsc::channel(EVENT_CAPACITY);
        *self.poller.lock() = Some(tokio::spawn(poll_broker(eventloop, tx)));

        let timeout = Duration::from_millis(self.config.connect_timeout_ms);
        let connack = tokio::time::timeout(timeout, async {
            loop {
                match rx.recv().await {
                    Some(BrokerEvent::Connected) => return Ok(()),
                    Some(BrokerEvent::Disconnected(reason)) => {
                        return Err(TransportError::ConnectionFailed(reason))
                    }
                    Some(BrokerEvent::Message(_)) => continue,
                    None => return Err(TransportError::ConnectionClosed),
                }
            }
        })
        .await
        .map_err(|_| TransportError::Timeout("Broker did not acknowledge connection".into()))
        .and_then(|result| result);

        if let Err(e) = connack {
            self.stop_poller();
            return Err(e);
        }

        if let Err(e) = client
            .subscribe(self.subscribe_topic.clone(), QoS::AtLeastOnce)
            .await
        {
            self.stop_poller();
            return Err(TransportError::ConnectionFailed(format!("Subscribe: {}", e)));
        }

        *self.client.lock() = Some(client);
        *self.events.lock().await = Some(rx);
        Ok(())
    }

    async fn send(&self, message: &ExternalClientMessage) -> Result<(), TransportError> {
        let payload = serde_json::to_vec(message)?;
        let client = self
            .client
            .lock()
            .clone()
            .ok_or(TransportError::ConnectionClosed)?;

        client
            .publish(self.publish_topic.clone(), QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn receive(
        &self,
        timeout: Duration,
    ) -> Result<Option<ExternalServerMessage>, TransportError> {
        let deadline = Instant::now() + timeout;
        let mut guard = self.events.lock().await;
        let events = guard.as_mut().ok_or(TransportError::ConnectionClosed)?;

        loop {
            match tokio::time::timeout_at(deadline, events.recv()).await {
                Err(_) => return Ok(None),
                Ok(None) => return Err(TransportError::ConnectionClosed),
                Ok(Some(BrokerEvent::Message(payload))) => {
                    return Ok(Some(serde_json::from_slice(&payload)?));
                }
                Ok(Some(BrokerEvent::Connected)) => {
                    debug!("Broker re-acknowledged connection");
                }
                Ok(Some(BrokerEvent::Disconnected(reason))) => {
                    warn!(%reason, "Lost connection to MQTT broker");
                    return Err(TransportError::ReceiveFailed(reason));
                }
            }
        }
    }

    async fn close(&self) {
        let client = self.client.lock().take();
        if let Some(client) = client {
            if let Err(e) = client.disconnect().await {
                debug!(%e, "MQTT disconnect failed");
            }
        }
        self.stop_poller();
        self.events.lock().await.take();
    }

    fn describe(&self) -> String {
        format!("mqtt://{}:{}", self.config.host, self.config.port)
    }
}
