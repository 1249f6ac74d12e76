//! Integration tests for ExternalConnection
//!
//! A MockChannel plays the fleet server; the tests drive handshakes,
//! steady-state traffic and teardown through the public connection API.

mod common;

use std::sync::Arc;
use std::time::Duration;

use common::*;
use mgw_core::{
    Command, CommandResponseType, DeviceState, ExternalClientMessage, ExternalServerMessage,
};
use mgw_external::transport::mock::{ConnectReply, MockChannel};
use mgw_external::{
    AggregatorError, CommandQueue, ConnectionError, ConnectionId, ConnectionState,
    ExternalClientConfig, ExternalConnection, ReconnectRequest,
};
use pretty_assertions::assert_eq;
use rstest::rstest;
use tokio::sync::mpsc;

// =============================================================================
// Harness
// =============================================================================

struct Harness {
    connection: Arc<ExternalConnection>,
    channel: Arc<MockChannel>,
    commands: Arc<CommandQueue>,
    reconnects: mpsc::UnboundedReceiver<ReconnectRequest>,
}

fn harness_with(config: ExternalClientConfig) -> Harness {
    let channel = mock();
    let commands = Arc::new(CommandQueue::new(config.command_backlog));
    let (tx, reconnects) = mpsc::unbounded_channel();
    let endpoint = config.endpoints[0].clone();
    let connection = Arc::new(ExternalConnection::new(
        ConnectionId(0),
        &endpoint,
        Arc::new(config),
        channel.clone(),
        &library(&[1]),
        commands.clone(),
        tx,
    ));
    Harness {
        connection,
        channel,
        commands,
        reconnects,
    }
}

fn harness() -> Harness {
    harness_with(config(vec![endpoint("primary", vec![1])]))
}

impl Harness {
    async fn next_reconnect(&mut self) -> Option<ReconnectRequest> {
        tokio::time::timeout(Duration::from_secs(2), self.reconnects.recv())
            .await
            .ok()
            .flatten()
    }

    fn command_responses(&self) -> Vec<(u32, CommandResponseType)> {
        self.channel
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                ExternalClientMessage::CommandResponse(r) => {
                    Some((r.message_counter, r.response_type))
                }
                _ => None,
            })
            .collect()
    }

    fn inject_command(&self, counter: u32, device: mgw_core::DeviceIdentity) {
        self.channel.inject(ExternalServerMessage::Command(Command {
            session_id: self.connection.session_id(),
            message_counter: counter,
            device,
            command_data: vec![0xC0],
        }));
    }
}

// =============================================================================
// Handshake
// =============================================================================

#[tokio::test]
async fn test_handshake_with_devices() {
    let h = harness();
    let a = device(1, "a");
    let b = device(1, "b");

    h.connection
        .initialize_connection(vec![device_status(&a, &[1]), device_status(&b, &[2])])
        .await
        .unwrap();

    assert_eq!(h.connection.state(), ConnectionState::Connected);
    let kinds: Vec<&str> = h.channel.sent().iter().map(|m| m.kind()).collect();
    assert_eq!(
        kinds,
        vec!["connect", "status", "status", "command_response", "command_response"]
    );

    let statuses = h.channel.sent_statuses();
    assert!(statuses
        .iter()
        .all(|s| s.device_state == DeviceState::Connecting));
    assert_eq!(statuses[0].message_counter, 0);
    assert_eq!(statuses[1].message_counter, 1);
    assert_eq!(statuses[0].device_status.status_data, vec![1]);

    assert_eq!(
        h.command_responses(),
        vec![(0, CommandResponseType::Ok), (1, CommandResponseType::Ok)]
    );
    assert_eq!(h.commands.len(), 2);
    assert!(h.connection.is_device_connected(&a));
    assert!(h.connection.is_device_connected(&b));
    assert_eq!(h.connection.not_acked_count(), 0);
}

#[tokio::test]
async fn test_handshake_without_devices() {
    let h = harness();
    h.connection.initialize_connection(vec![]).await.unwrap();

    assert_eq!(h.connection.state(), ConnectionState::Connected);
    assert_eq!(h.channel.sent().len(), 1);
    assert!(h.connection.connected_devices().is_empty());
}

#[tokio::test]
async fn test_session_id_format_and_renewal() {
    let h = harness();
    h.connection.initialize_connection(vec![]).await.unwrap();
    let first = h.connection.session_id();
    assert!(first.starts_with("car_1"));
    assert_eq!(first.len(), "car_1".len() + 8);

    h.connection.deinitialize_connection(false).await;
    h.connection.initialize_connection(vec![]).await.unwrap();
    assert_ne!(h.connection.session_id(), first);
}

#[rstest]
#[case::wrong_session(ConnectReply::WrongSession)]
#[case::already_logged(ConnectReply::AlreadyLogged)]
#[case::silent(ConnectReply::Silent)]
#[tokio::test]
async fn test_connect_phase_failures(#[case] reply: ConnectReply) {
    let h = harness();
    h.channel.configure(|b| b.connect_reply = reply);

    let result = h
        .connection
        .initialize_connection(vec![device_status(&device(1, "a"), &[1])])
        .await;

    match (reply, result) {
        (ConnectReply::WrongSession, Err(ConnectionError::SessionMismatch { .. })) => {}
        (ConnectReply::AlreadyLogged, Err(ConnectionError::AlreadyLogged)) => {}
        (ConnectReply::Silent, Err(ConnectionError::NoResponse(_))) => {}
        (reply, result) => panic!("Unexpected result for {:?}: {:?}", reply, result),
    }
    assert_eq!(h.connection.state(), ConnectionState::NotConnected);
    assert!(!h.channel.is_open());
    assert!(h.channel.sent_statuses().is_empty());
}

#[tokio::test]
async fn test_missing_acknowledgement_fails_handshake() {
    let h = harness();
    h.channel.configure(|b| b.acknowledge_statuses = false);
    let a = device(1, "a");

    let result = h
        .connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await;

    assert!(matches!(result, Err(ConnectionError::UnexpectedMessage { .. })));
    assert_eq!(h.connection.state(), ConnectionState::NotConnected);
    assert_eq!(h.connection.not_acked_count(), 0);
    assert!(!h.connection.is_device_connected(&a));
}

#[tokio::test]
async fn test_foreign_session_ack_fails_handshake() {
    let h = harness();
    h.channel.configure(|b| b.foreign_acks = true);
    let a = device(1, "a");

    let result = h
        .connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await;

    assert!(matches!(result, Err(ConnectionError::SessionMismatch { .. })));
    assert_eq!(h.connection.state(), ConnectionState::NotConnected);
    assert_eq!(h.connection.not_acked_count(), 0);
    assert!(!h.connection.is_device_connected(&a));
    assert!(!h.channel.is_open());
}

#[tokio::test]
async fn test_missing_command_fails_handshake() {
    let h = harness();
    h.channel.configure(|b| b.push_commands = false);
    let a = device(1, "a");

    let result = h
        .connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await;

    assert!(matches!(result, Err(ConnectionError::NoResponse("command"))));
    assert_eq!(h.connection.state(), ConnectionState::NotConnected);
    assert_eq!(h.connection.not_acked_count(), 0);
    assert!(!h.connection.is_device_connected(&a));
    assert!(h.command_responses().is_empty());
    assert!(h.commands.is_empty());

    h.channel.configure(|b| b.push_commands = true);
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();
    assert_eq!(h.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_refused_channel_leaves_connection_not_connected() {
    let h = harness();
    h.channel.configure(|b| b.refuse_open = true);

    let result = h.connection.initialize_connection(vec![]).await;
    assert!(matches!(result, Err(ConnectionError::Transport(_))));
    assert_eq!(h.connection.state(), ConnectionState::NotConnected);

    h.channel.configure(|b| b.refuse_open = false);
    h.connection.initialize_connection(vec![]).await.unwrap();
    assert_eq!(h.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_initialize_rejected_while_connected() {
    let h = harness();
    h.connection.initialize_connection(vec![]).await.unwrap();
    let result = h.connection.initialize_connection(vec![]).await;
    assert!(matches!(
        result,
        Err(ConnectionError::InvalidState(ConnectionState::Connected))
    ));
}

// =============================================================================
// Steady state
// =============================================================================

#[tokio::test]
async fn test_send_status_without_session_is_refused() {
    let h = harness();
    let sent = h
        .connection
        .send_status(device_status(&device(1, "a"), &[1]), DeviceState::Running, None)
        .await;
    assert!(!sent);
    assert!(h.channel.sent().is_empty());
}

#[tokio::test]
async fn test_first_running_status_is_promoted() {
    let h = harness();
    let a = device(1, "a");
    h.connection.initialize_connection(vec![]).await.unwrap();

    assert!(
        h.connection
            .send_status(device_status(&a, &[1]), DeviceState::Running, None)
            .await
    );
    assert!(
        h.connection
            .send_status(device_status(&a, &[2]), DeviceState::Running, None)
            .await
    );

    let states: Vec<(u32, DeviceState)> = h
        .channel
        .sent_statuses()
        .iter()
        .map(|s| (s.message_counter, s.device_state))
        .collect();
    assert_eq!(
        states,
        vec![(0, DeviceState::Connecting), (1, DeviceState::Running)]
    );

    // The mock pushes a command for the newly announced device
    assert!(wait_for(|| h.commands.len() == 1).await);
    assert!(wait_for(|| h.connection.not_acked_count() == 0).await);
}

#[tokio::test]
async fn test_commands_answered_per_device_state() {
    let h = harness();
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();

    // Handshake consumed command counter 0
    h.inject_command(1, device(1, "absent"));
    h.inject_command(2, mgw_core::DeviceIdentity::new(1, 7, "odd", "odd", 0));
    h.inject_command(3, device(9, "foreign"));
    h.inject_command(4, a.clone());

    assert!(wait_for(|| h.command_responses().len() == 5).await);
    assert_eq!(
        h.command_responses(),
        vec![
            (0, CommandResponseType::Ok),
            (1, CommandResponseType::DeviceNotConnected),
            (2, CommandResponseType::DeviceNotSupported),
            (3, CommandResponseType::DeviceNotSupported),
            (4, CommandResponseType::Ok),
        ]
    );
    assert_eq!(h.commands.pending_for(&a), 2);
    assert_eq!(h.connection.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn test_command_counter_gap_requests_reconnect() {
    let mut h = harness();
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();

    h.inject_command(5, a);
    assert_eq!(
        h.next_reconnect().await,
        Some(ReconnectRequest {
            connection: ConnectionId(0),
            reconnect: true,
        })
    );
}

#[tokio::test]
async fn test_foreign_session_ack_requests_reconnect() {
    let mut h = harness();
    h.connection.initialize_connection(vec![]).await.unwrap();

    h.channel
        .inject(ExternalServerMessage::StatusResponse(mgw_core::StatusResponse {
            session_id: "someone_else".to_string(),
            response_type: mgw_core::StatusResponseType::Ok,
            message_counter: 0,
        }));
    let request = h.next_reconnect().await.unwrap();
    assert!(request.reconnect);
}

#[tokio::test]
async fn test_last_disconnect_ends_session() {
    let mut h = harness();
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();

    assert!(
        h.connection
            .send_status(device_status(&a, &[0]), DeviceState::Disconnect, None)
            .await
    );
    assert!(!h.connection.is_device_connected(&a));
    assert_eq!(
        h.next_reconnect().await,
        Some(ReconnectRequest {
            connection: ConnectionId(0),
            reconnect: false,
        })
    );
}

#[tokio::test]
async fn test_failed_send_keeps_status_and_requests_reconnect() {
    let mut h = harness();
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();

    h.channel.configure(|b| b.fail_send = true);
    assert!(
        h.connection
            .send_status(device_status(&a, &[2]), DeviceState::Running, None)
            .await
    );
    assert_eq!(h.connection.not_acked_count(), 1);
    assert!(h.next_reconnect().await.unwrap().reconnect);

    h.connection.deinitialize_connection(false).await;
    assert_eq!(h.connection.buffered_status(&a), Ok(vec![2]));
}

#[tokio::test]
async fn test_ack_timeout_requests_single_reconnect() {
    let mut config = config(vec![endpoint("primary", vec![1])]);
    config.status_ack_timeout_ms = 50;
    let mut h = harness_with(config);
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();

    h.channel.configure(|b| b.acknowledge_statuses = false);
    for data in 2..5u8 {
        h.connection
            .send_status(device_status(&a, &[data]), DeviceState::Running, None)
            .await;
    }

    let request = h.next_reconnect().await.unwrap();
    assert!(request.reconnect);
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(h.reconnects.try_recv().is_err());
}

// =============================================================================
// Teardown and replay
// =============================================================================

#[tokio::test]
async fn test_unacknowledged_status_is_replayed() {
    let h = harness();
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();
    assert_eq!(
        h.connection.buffered_status(&a),
        Err(AggregatorError::DeviceNotRegistered(a.clone()))
    );

    h.channel.configure(|b| b.acknowledge_statuses = false);
    h.connection
        .send_status(device_status(&a, &[2]), DeviceState::Running, None)
        .await;
    assert_eq!(h.connection.not_acked_count(), 1);

    h.connection.deinitialize_connection(false).await;
    assert_eq!(h.connection.state(), ConnectionState::NotInitialized);
    assert_eq!(h.connection.not_acked_count(), 0);
    assert!(!h.channel.is_open());
    assert_eq!(h.connection.buffered_status(&a), Ok(vec![2]));

    h.channel.clear_sent();
    h.channel.configure(|b| b.acknowledge_statuses = true);
    h.connection
        .initialize_connection(vec![device_status(&a, &[9])])
        .await
        .unwrap();

    let replayed = &h.channel.sent_statuses()[0];
    assert_eq!(replayed.device_state, DeviceState::Connecting);
    assert_eq!(replayed.message_counter, 0);
    assert_eq!(replayed.device_status.status_data, vec![2]);
    assert_eq!(replayed.error_message, Some(vec![2, 2]));
    assert!(h.connection.buffered_status(&a).is_err());
}

#[tokio::test]
async fn test_replay_after_idle_drop_uses_latest_status() {
    let h = harness();
    let a = device(1, "a");
    h.connection
        .initialize_connection(vec![device_status(&a, &[1])])
        .await
        .unwrap();

    for data in [2, 3, 4] {
        h.connection
            .send_status(device_status(&a, &[data]), DeviceState::Running, None)
            .await;
    }
    assert!(wait_for(|| h.connection.not_acked_count() == 0).await);

    h.connection.deinitialize_connection(false).await;
    h.channel.clear_sent();
    h.connection
        .initialize_connection(vec![device_status(&a, &[4])])
        .await
        .unwrap();

    let replayed = &h.channel.sent_statuses()[0];
    assert_eq!(replayed.device_state, DeviceState::Connecting);
    assert_eq!(replayed.device_status.status_data, vec![4]);
}

#[tokio::test]
async fn test_complete_teardown_drops_backlog() {
    let h = harness();
    let a = device(1, "a");
    assert!(h.connection.buffer_status(&device_status(&a, &[3])));
    assert_eq!(h.connection.buffered_status(&a), Ok(vec![3]));

    h.connection.deinitialize_connection(true).await;
    assert!(h.connection.buffered_status(&a).is_err());
}

#[tokio::test]
async fn test_buffer_rejects_foreign_module() {
    let h = harness();
    assert!(!h.connection.buffer_status(&device_status(&device(4, "x"), &[1])));
}
