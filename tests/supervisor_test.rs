use std::sync::Arc;

use citygate::{error::SupervisorError, ConnectionState, ConnectionSupervisor};
use gateway::MemoryGateway;
use tokio::time::Instant;

fn gaps_in_secs(attempts: &[Instant]) -> Vec<u64> {
    attempts
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_secs())
        .collect()
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_gives_up_after_five_retries() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.fail_all_connects(true);
    let supervisor = ConnectionSupervisor::new(gateway.clone());

    let err = supervisor
        .connect()
        .await
        .expect_err("connect should be exhausted");
    match err {
        SupervisorError::ConnectExhausted { attempts, .. } => assert_eq!(attempts, 6),
        other => panic!("unexpected error: {other}"),
    }

    // One initial attempt plus five retries
    let attempts = gateway.connect_attempts();
    assert_eq!(attempts.len(), 6);
    assert_eq!(gaps_in_secs(&attempts), vec![30, 60, 90, 120, 120]);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_initial_connect_recovers_mid_backoff() {
    let gateway = Arc::new(MemoryGateway::new());
    gateway.fail_next_connects(2);
    let supervisor = ConnectionSupervisor::new(gateway.clone());

    supervisor.connect().await.expect("connect should recover");

    let attempts = gateway.connect_attempts();
    assert_eq!(gaps_in_secs(&attempts), vec![30, 60]);
    assert_eq!(supervisor.state(), ConnectionState::Connected);
    assert!(supervisor.status().is_connected());
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_gives_up_without_crashing() {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = Arc::new(ConnectionSupervisor::new(gateway.clone()));
    supervisor.connect().await.expect("initial connect");

    gateway.fail_all_connects(true);
    let dropped_at = Instant::now();
    let reconnect = supervisor
        .on_disconnected("connection reset")
        .expect("reconnect should be scheduled");
    assert_eq!(supervisor.state(), ConnectionState::Reconnecting);

    reconnect.await.expect("reconnect task should not panic");

    // First entry is the initial connect
    let attempts = gateway.connect_attempts();
    let reconnects = &attempts[1..];
    assert_eq!(reconnects.len(), 6);
    assert_eq!((reconnects[0] - dropped_at).as_secs(), 5);
    assert_eq!(gaps_in_secs(reconnects), vec![15, 30, 45, 60, 60]);
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_reconnect_restores_connected_state() {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = Arc::new(ConnectionSupervisor::new(gateway.clone()));
    supervisor.connect().await.expect("initial connect");

    gateway.fail_next_connects(1);
    let reconnect = supervisor
        .on_disconnected("heartbeat not acknowledged")
        .expect("reconnect should be scheduled");
    reconnect.await.expect("reconnect task should not panic");

    assert_eq!(gateway.connect_attempts().len(), 3);
    assert_eq!(supervisor.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_only_counts_from_connected() {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = Arc::new(ConnectionSupervisor::new(gateway.clone()));

    // Never connected: nothing to recover
    assert!(supervisor.on_disconnected("stray close").is_none());

    supervisor.connect().await.expect("initial connect");
    let reconnect = supervisor.on_disconnected("first drop");
    assert!(reconnect.is_some());

    // A second drop while already reconnecting is absorbed
    assert!(supervisor.on_disconnected("second drop").is_none());

    reconnect
        .expect("reconnect scheduled")
        .await
        .expect("reconnect task should not panic");
    assert_eq!(gateway.connect_attempts().len(), 2);
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let gateway = Arc::new(MemoryGateway::new());
    let supervisor = ConnectionSupervisor::new(gateway.clone());
    supervisor.connect().await.expect("initial connect");

    let err = supervisor.connect().await.expect_err("already connected");
    assert!(matches!(
        err,
        SupervisorError::AlreadyActive(ConnectionState::Connected)
    ));
    assert_eq!(gateway.connect_attempts().len(), 1);
}
