//! End-to-end WebSocket protocol over a real socket.

use serde_json::json;

use blerelay_services::testing::{StubCall, NOTIFY_HANDLE, NOTIFY_UUID, SERVICE_UUID, WRITE_UUID};

use crate::*;

#[tokio::test]
async fn unseen_device_is_reported_with_canonical_mac() -> Result<()> {
    let relay = Relay::start().await;
    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;

    ws.send(json!({
        "type": "connect",
        "mac_address": "aa-bb-cc-dd-ee-ff",
        "service_uuid": SERVICE_UUID,
        "notify_char_uuid": NOTIFY_UUID,
        "write_char_uuid": WRITE_UUID,
    }))
    .await?;

    let event = ws.recv().await?;
    assert_eq!(event["type"], "error");
    let message = event["error"].as_str().unwrap_or_default();
    assert!(message.contains("AA:BB:CC:DD:EE:FF"), "{message}");
    assert!(message.starts_with("No proxy has seen device"), "{message}");
    assert_eq!(event["details"]["kind"], "client");
    assert!(relay.state.sessions.is_empty());
    Ok(())
}

#[tokio::test]
async fn connect_write_and_receive_echo() -> Result<()> {
    let relay = Relay::start().await;
    relay.proxy_b.echo_writes_to(NOTIFY_HANDLE);
    let dev = mac("AA:BB:CC:DD:EE:30");
    relay.advertise(PROXY_A, dev, "SFP-Wizard", -80);
    relay.advertise(PROXY_B, dev, "SFP-Wizard", -45);

    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;

    // No UUIDs: retrieved from the device through the best proxy.
    ws.send(json!({ "type": "connect", "mac_address": "aa:bb:cc:dd:ee:30" })).await?;
    let connected = ws.recv().await?;
    assert_eq!(connected["type"], "connected", "{connected}");
    assert_eq!(connected["device_address"], "AA:BB:CC:DD:EE:30");
    assert_eq!(connected["device_name"], "SFP-Wizard");
    assert_eq!(connected["proxy_used"], PROXY_B);
    assert_eq!(connected["service_uuid"], SERVICE_UUID);
    assert_eq!(connected["notify_char_uuid"], NOTIFY_UUID);
    assert_eq!(connected["write_char_uuid"], WRITE_UUID);

    ws.send(json!({
        "type": "write",
        "characteristic_uuid": WRITE_UUID,
        "data": "AAECA/8=",
    }))
    .await?;

    // Status ack and echoed notification may arrive in either order.
    let mut saw_status = false;
    let mut saw_notification = false;
    for _ in 0..2 {
        let event = ws.recv().await?;
        match event["type"].as_str() {
            Some("status") => {
                assert_eq!(event["connected"], true);
                assert_eq!(event["message"], format!("Wrote 5 bytes to {WRITE_UUID}"));
                saw_status = true;
            }
            Some("notification") => {
                assert_eq!(event["characteristic_uuid"], NOTIFY_UUID);
                assert_eq!(event["data"], "AAECA/8=");
                saw_notification = true;
            }
            other => panic!("unexpected event {other:?}: {event}"),
        }
    }
    assert!(saw_status && saw_notification);

    let writes: Vec<_> = relay
        .proxy_b
        .calls()
        .into_iter()
        .filter(|c| matches!(c, StubCall::Write { .. }))
        .collect();
    assert_eq!(
        writes,
        vec![StubCall::Write {
            address: dev,
            handle: blerelay_services::testing::WRITE_HANDLE,
            data: vec![0x00, 0x01, 0x02, 0x03, 0xFF],
            response: true,
        }]
    );
    assert_eq!(relay.proxy_a.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn write_without_session_is_an_error_event() -> Result<()> {
    let relay = Relay::start().await;
    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;

    ws.send(json!({ "type": "write", "characteristic_uuid": WRITE_UUID, "data": "AQ==" }))
        .await?;
    let event = ws.recv().await?;
    assert_eq!(event["type"], "error");
    assert_eq!(event["details"]["kind"], "client");
    assert_eq!(relay.proxy_a.write_count() + relay.proxy_b.write_count(), 0);
    Ok(())
}

#[tokio::test]
async fn malformed_messages_keep_the_connection_open() -> Result<()> {
    let relay = Relay::start().await;
    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;

    ws.send_raw("this is not json").await?;
    let event = ws.recv().await?;
    assert_eq!(event["type"], "error");
    assert!(event["error"].as_str().unwrap_or_default().starts_with("Invalid JSON"));

    ws.send(json!({ "type": "teleport" })).await?;
    let event = ws.recv().await?;
    assert_eq!(event["error"], "Unknown message type: teleport");

    ws.send(json!({ "type": "subscribe", "characteristic_uuid": NOTIFY_UUID })).await?;
    let event = ws.recv().await?;
    assert_eq!(event["type"], "status");
    assert_eq!(event["message"], format!("Subscribed to {NOTIFY_UUID} (active on connect)"));
    Ok(())
}

/// Closing the socket releases the device.
#[tokio::test]
async fn closing_socket_tears_down_session() -> Result<()> {
    let relay = Relay::start().await;
    let dev = mac("AA:BB:CC:DD:EE:31");
    relay.advertise(PROXY_A, dev, "SFP", -50);

    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;
    ws.send(json!({ "type": "connect", "mac_address": "AA:BB:CC:DD:EE:31" })).await?;
    assert_eq!(ws.recv().await?["type"], "connected");
    assert_eq!(relay.state.sessions.len(), 1);

    ws.close().await?;
    let proxy = relay.proxy_a.clone();
    let released = eventually(|| proxy.calls().ends_with(&[StubCall::DeviceDisconnect(dev)])).await;
    assert!(released, "device not released after socket close");
    assert!(relay.state.sessions.is_empty());
    assert!(proxy.calls().contains(&StubCall::Notify {
        address: dev,
        handle: NOTIFY_HANDLE,
        enable: false,
    }));
    Ok(())
}

#[tokio::test]
async fn disconnect_message_is_acknowledged() -> Result<()> {
    let relay = Relay::start().await;
    let dev = mac("AA:BB:CC:DD:EE:32");
    relay.advertise(PROXY_A, dev, "SFP", -50);

    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;
    ws.send(json!({ "type": "connect", "mac_address": "AA:BB:CC:DD:EE:32" })).await?;
    assert_eq!(ws.recv().await?["type"], "connected");

    ws.send(json!({ "type": "disconnect" })).await?;
    let event = ws.recv().await?;
    assert_eq!(event["type"], "disconnected");
    assert_eq!(event["reason"], "User requested disconnect");
    assert!(relay.state.sessions.is_empty());
    Ok(())
}

/// The proxy reporting the device gone ends the session and tells the client.
#[tokio::test]
async fn device_drop_is_pushed_to_client() -> Result<()> {
    let relay = Relay::start().await;
    let dev = mac("AA:BB:CC:DD:EE:33");
    relay.advertise(PROXY_A, dev, "SFP", -50);

    let addr = relay.serve().await;
    let mut ws = WsClient::connect(addr).await?;
    ws.send(json!({ "type": "connect", "mac_address": "AA:BB:CC:DD:EE:33" })).await?;
    assert_eq!(ws.recv().await?["type"], "connected");

    relay.proxy_a.drop_device(dev);
    let event = ws.recv().await?;
    assert_eq!(event["type"], "disconnected");
    assert_eq!(event["reason"], "Device disconnected");
    assert!(relay.state.sessions.is_empty());

    ws.send(json!({ "type": "write", "characteristic_uuid": WRITE_UUID, "data": "AQ==" })).await?;
    assert_eq!(ws.recv().await?["details"]["kind"], "client");
    Ok(())
}
