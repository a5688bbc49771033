//! Session lifecycle against stub transports.

use tokio::sync::mpsc;

use blerelay_services::testing::{StubCall, NOTIFY_HANDLE, NOTIFY_UUID, SERVICE_UUID, WRITE_HANDLE, WRITE_UUID};
use blerelay_services::{ErrorKind, SessionEvent, SessionEventSink, SessionRequest, SessionState};

use crate::*;

fn request(relay: &Relay, client: &str, dev: MacAddress, proxy: &str, sink: Option<SessionEventSink>) -> SessionRequest {
    SessionRequest {
        client_id: client.to_string(),
        mac: dev,
        proxy_name: proxy.to_string(),
        transport: relay.state.registry.get_transport(proxy).expect("proxy connected"),
        service_uuid: SERVICE_UUID.to_string(),
        notify_uuid: NOTIFY_UUID.to_string(),
        write_uuid: WRITE_UUID.to_string(),
        device_name: Some("SFP".into()),
        events: sink,
    }
}

/// A second connect from the same client replaces the first session.
#[tokio::test]
async fn reconnect_replaces_previous_session() {
    let relay = Relay::start().await;
    let sessions = &relay.state.sessions;
    let first = mac("AA:BB:CC:DD:EE:20");
    let second = mac("AA:BB:CC:DD:EE:21");

    sessions.connect(request(&relay, "client-1", first, PROXY_A, None)).await.unwrap();
    let info = sessions
        .connect(request(&relay, "client-1", second, PROXY_B, None))
        .await
        .unwrap();

    assert_eq!(sessions.len(), 1);
    assert_eq!(info.mac_address, second);
    assert_eq!(sessions.get("client-1").unwrap().mac_address, second);
    assert_eq!(sessions.state("client-1"), SessionState::Connected);

    let a_calls = relay.proxy_a.calls();
    assert!(a_calls.contains(&StubCall::DeviceConnect(first)));
    assert!(a_calls.contains(&StubCall::DeviceDisconnect(first)));
    assert!(relay.proxy_b.calls().contains(&StubCall::DeviceConnect(second)));
}

#[tokio::test]
async fn sessions_are_isolated_per_client() {
    let relay = Relay::start().await;
    let sessions = &relay.state.sessions;
    let dev_1 = mac("AA:BB:CC:DD:EE:22");
    let dev_2 = mac("AA:BB:CC:DD:EE:23");

    sessions.connect(request(&relay, "c1", dev_1, PROXY_A, None)).await.unwrap();
    sessions.connect(request(&relay, "c2", dev_2, PROXY_A, None)).await.unwrap();
    assert_eq!(sessions.len(), 2);

    assert!(sessions.disconnect("c1").await);
    assert!(!sessions.is_connected("c1"));
    assert!(sessions.is_connected("c2"));
    assert!(!relay.proxy_a.calls().contains(&StubCall::DeviceDisconnect(dev_2)));
}

/// Bytes written come back unchanged through the echoing stub.
#[tokio::test]
async fn write_and_echo_round_trip() {
    let relay = Relay::start().await;
    relay.proxy_a.echo_writes_to(NOTIFY_HANDLE);
    let dev = mac("AA:BB:CC:DD:EE:24");
    let (tx, mut rx) = mpsc::unbounded_channel();

    let info = relay
        .state
        .sessions
        .connect(request(&relay, "echo", dev, PROXY_A, Some(tx)))
        .await
        .unwrap();
    assert_eq!(info.notify_handle, NOTIFY_HANDLE);
    assert_eq!(info.write_handle, WRITE_HANDLE);
    assert!(info.subscribed);

    let payload = [0x00, 0xFF, 0x10, 0x80, 0x7F];
    relay
        .state
        .sessions
        .write("echo", WRITE_UUID, &payload, true)
        .await
        .unwrap();

    match tokio::time::timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap()
    {
        SessionEvent::Notification(n) => {
            assert_eq!(n.characteristic_uuid, NOTIFY_UUID);
            assert_eq!(&n.data[..], &payload);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[tokio::test]
async fn write_without_session_touches_no_transport() {
    let relay = Relay::start().await;
    let err = relay
        .state
        .sessions
        .write("nobody", WRITE_UUID, &[1], true)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Client);
    assert_eq!(relay.proxy_a.write_count(), 0);
    assert_eq!(relay.proxy_b.write_count(), 0);
}

#[tokio::test]
async fn failed_device_connect_leaves_no_session() {
    let relay = Relay::start().await;
    relay.proxy_a.fail_device_connect(-3);
    let dev = mac("AA:BB:CC:DD:EE:25");

    let err = relay
        .state
        .sessions
        .connect(request(&relay, "c", dev, PROXY_A, None))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Infrastructure);
    assert!(relay.state.sessions.is_empty());
    assert_eq!(relay.state.sessions.state("c"), SessionState::Absent);
}

/// Removing a proxy ends the sessions that ran through it, and only those.
#[tokio::test]
async fn removed_proxy_ends_its_sessions() {
    let relay = Relay::start().await;
    let sessions = &relay.state.sessions;
    let (tx, mut rx) = mpsc::unbounded_channel();
    sessions
        .connect(request(&relay, "c1", mac("AA:BB:CC:DD:EE:26"), PROXY_A, Some(tx)))
        .await
        .unwrap();
    sessions
        .connect(request(&relay, "c2", mac("AA:BB:CC:DD:EE:27"), PROXY_B, None))
        .await
        .unwrap();

    relay.state.registry.remove(PROXY_A);

    let event = tokio::time::timeout(OP_TIMEOUT, rx.recv()).await.unwrap().unwrap();
    assert_eq!(
        event,
        SessionEvent::Ended {
            reason: "Proxy connection lost".into()
        }
    );
    assert!(eventually(|| sessions.state("c1") == SessionState::Absent).await);
    assert_eq!(sessions.state("c2"), SessionState::Connected);
    let err = sessions.write("c1", WRITE_UUID, &[1], true).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Client);
}

/// A proxy connection that drops on its own is reaped and its sessions end.
#[tokio::test]
async fn dropped_proxy_connection_ends_sessions() {
    let relay = Relay::start().await;
    let sessions = &relay.state.sessions;
    sessions
        .connect(request(&relay, "c1", mac("AA:BB:CC:DD:EE:28"), PROXY_B, None))
        .await
        .unwrap();

    relay.proxy_b.set_connected(false);
    assert!(eventually(|| sessions.is_empty()).await);

    // The reconnect tick reaps the dead transport and opens a fresh one.
    assert_eq!(relay.state.registry.connect_pending(relay.router.handler()).await, 2);
    assert_eq!(relay.connector.connect_count(), 3);
}
