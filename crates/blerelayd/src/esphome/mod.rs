//! ESPHome native API transport.
//!
//! One TCP connection per proxy, split into a writer task draining an
//! outbound queue and a reader task that answers keep-alives, feeds
//! advertisements and notifications to their subscribers, and republishes
//! everything else on an inbound broadcast. Requests subscribe to that
//! broadcast before sending and match their response by message type,
//! device address and handle, so operations for different devices can
//! interleave on one connection.

pub mod codec;
pub mod messages;
pub mod parse;

use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

use blerelay_core::MacAddress;
use blerelay_services::{
    AdvertisementSink, GattNotification, GattService, ProxyTransport, RawAdvertisement, TransportConnector,
    TransportError,
};

use codec::{Frame, FrameCodec};
use messages::*;

const CLIENT_INFO: &str = "blerelay";
const API_VERSION: (u32, u32) = (1, 10);
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

type FramedConn = Framed<TcpStream, FrameCodec>;

fn encode<M: ApiMessage>(msg: &M) -> Frame {
    Frame::new(M::TYPE, msg.encode_to_vec())
}

/// Decode any payload shape; acks share one struct across message types.
fn decode_frame<M: prost::Message + Default>(frame: &Frame) -> Result<M, TransportError> {
    M::decode(frame.payload.clone())
        .map_err(|e| TransportError::Protocol(format!("bad message type {}: {e}", frame.msg_type)))
}

// ── Connector ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
pub struct EspHomeConnector;

#[async_trait]
impl TransportConnector for EspHomeConnector {
    async fn connect(
        &self,
        host: &str,
        port: u16,
        password: &str,
    ) -> Result<Arc<dyn ProxyTransport>, TransportError> {
        let client = EspHomeClient::connect(host, port, password).await?;
        Ok(Arc::new(client))
    }
}

// ── Client ────────────────────────────────────────────────────────────────────

struct Shared {
    peer: String,
    feature_flags: u32,
    outbound: mpsc::UnboundedSender<Frame>,
    inbound: broadcast::Sender<Frame>,
    notifications: broadcast::Sender<GattNotification>,
    disconnections: broadcast::Sender<MacAddress>,
    adv_sink: Mutex<Option<AdvertisementSink>>,
    /// Address type learned from advertisements, forwarded on connect.
    address_types: DashMap<u64, u32>,
    closed: CancellationToken,
}

pub struct EspHomeClient {
    shared: Arc<Shared>,
}

impl EspHomeClient {
    /// Open a plaintext API connection and complete the handshake.
    pub async fn connect(host: &str, port: u16, password: &str) -> Result<Self, TransportError> {
        let stream = TcpStream::connect((host, port)).await?;
        stream.set_nodelay(true)?;
        let mut conn = Framed::new(stream, FrameCodec);

        let hello: HelloResponse = exchange(
            &mut conn,
            &HelloRequest {
                client_info: CLIENT_INFO.into(),
                api_version_major: API_VERSION.0,
                api_version_minor: API_VERSION.1,
            },
        )
        .await?;
        let auth: ConnectResponse = exchange(
            &mut conn,
            &ConnectRequest {
                password: password.to_string(),
            },
        )
        .await?;
        if auth.invalid_password {
            return Err(TransportError::Rejected("invalid password".into()));
        }
        let info: DeviceInfoResponse = exchange(&mut conn, &DeviceInfoRequest {}).await?;

        let peer = format!("{host}:{port}");
        tracing::info!(
            peer = %peer,
            name = %hello.name,
            server = %hello.server_info,
            api_major = hello.api_version_major,
            api_minor = hello.api_version_minor,
            esphome = %info.esphome_version,
            features = info.bluetooth_proxy_feature_flags,
            active_connections = info.bluetooth_proxy_feature_flags & FEATURE_ACTIVE_CONNECTIONS != 0,
            "proxy handshake complete"
        );

        let (sink, stream) = conn.split();
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound, _) = broadcast::channel(256);
        let (notifications, _) = broadcast::channel(256);
        let (disconnections, _) = broadcast::channel(32);
        let shared = Arc::new(Shared {
            peer,
            feature_flags: info.bluetooth_proxy_feature_flags,
            outbound,
            inbound,
            notifications,
            disconnections,
            adv_sink: Mutex::new(None),
            address_types: DashMap::new(),
            closed: CancellationToken::new(),
        });

        tokio::spawn(write_loop(sink, outbound_rx, shared.closed.clone()));
        tokio::spawn(read_loop(shared.clone(), stream));

        Ok(Self { shared })
    }

    fn has_feature(&self, flag: u32) -> bool {
        self.shared.feature_flags & flag != 0
    }

    /// Send `frame` and wait until `matcher` accepts a response.
    async fn request<T>(
        &self,
        frame: Frame,
        mut matcher: impl FnMut(&Frame) -> Result<Option<T>, TransportError>,
    ) -> Result<T, TransportError> {
        let mut inbound = self.shared.inbound.subscribe();
        self.shared.send(frame)?;
        loop {
            tokio::select! {
                _ = self.shared.closed.cancelled() => return Err(TransportError::Closed),
                recv = inbound.recv() => match recv {
                    Ok(frame) => {
                        if let Some(value) = matcher(&frame)? {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(peer = %self.shared.peer, skipped = n, "response listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => return Err(TransportError::Closed),
                },
            }
        }
    }

    /// Request whose only answer is a GATT acknowledgement for `(address, handle)`.
    async fn gatt_request(&self, frame: Frame, ack_type: u32, address: u64, handle: u32) -> Result<(), TransportError> {
        self.request(frame, |f| {
            if f.msg_type == ack_type {
                let ack: BluetoothGattAck = decode_frame(f)?;
                return Ok((ack.address == address && ack.handle == handle).then_some(()));
            }
            if f.msg_type == BluetoothGattErrorResponse::TYPE {
                let err: BluetoothGattErrorResponse = decode_frame(f)?;
                if err.address == address && err.handle == handle {
                    return Err(TransportError::Gatt {
                        handle,
                        code: err.error,
                    });
                }
            }
            lost_connection(f, address)
        })
        .await
    }
}

/// Fails the pending request if the device dropped its connection.
fn lost_connection<T>(frame: &Frame, address: u64) -> Result<Option<T>, TransportError> {
    if frame.msg_type == BluetoothDeviceConnectionResponse::TYPE {
        let resp: BluetoothDeviceConnectionResponse = decode_frame(frame)?;
        if resp.address == address && !resp.connected {
            return Err(TransportError::Device { code: resp.error });
        }
    }
    Ok(None)
}

impl Drop for EspHomeClient {
    fn drop(&mut self) {
        self.shared.closed.cancel();
    }
}

impl Shared {
    fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        self.outbound.send(frame).map_err(|_| TransportError::Closed)
    }

    fn deliver(&self, adv: RawAdvertisement) {
        let sink = self.adv_sink.lock().clone();
        if let Some(sink) = sink {
            sink(adv);
        }
    }

    fn remember_address_type(&self, address: u64, address_type: u32) {
        self.address_types.insert(address, address_type);
    }

    fn dispatch(&self, frame: Frame) -> Result<(), TransportError> {
        match frame.msg_type {
            t if t == PingRequest::TYPE => self.send(encode(&PingResponse {})),
            t if t == GetTimeRequest::TYPE => {
                let epoch_seconds = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .map(|d| d.as_secs() as u32)
                    .unwrap_or(0);
                self.send(encode(&GetTimeResponse { epoch_seconds }))
            }
            t if t == DisconnectRequest::TYPE => {
                tracing::info!(peer = %self.peer, "proxy requested disconnect");
                let _ = self.send(encode(&DisconnectResponse {}));
                self.closed.cancel();
                Ok(())
            }
            t if t == BluetoothLeAdvertisementResponse::TYPE => {
                let adv: BluetoothLeAdvertisementResponse = decode_frame(&frame)?;
                self.remember_address_type(adv.address, adv.address_type);
                self.deliver(RawAdvertisement {
                    address: MacAddress::from_u64(adv.address),
                    name: String::from_utf8_lossy(&adv.name).into_owned(),
                    rssi: adv.rssi,
                    data: None,
                });
                Ok(())
            }
            t if t == BluetoothLeRawAdvertisementsResponse::TYPE => {
                let batch: BluetoothLeRawAdvertisementsResponse = decode_frame(&frame)?;
                for adv in batch.advertisements {
                    self.remember_address_type(adv.address, adv.address_type);
                    self.deliver(RawAdvertisement {
                        address: MacAddress::from_u64(adv.address),
                        name: parse::local_name(&adv.data).unwrap_or_default(),
                        rssi: adv.rssi,
                        data: Some(adv.data),
                    });
                }
                Ok(())
            }
            t if t == BluetoothGattNotifyDataResponse::TYPE => {
                let data: BluetoothGattNotifyDataResponse = decode_frame(&frame)?;
                if let Some(address) = MacAddress::from_u64(data.address) {
                    let _ = self.notifications.send(GattNotification {
                        address,
                        handle: data.handle,
                        data: Bytes::from(data.data),
                    });
                }
                Ok(())
            }
            t if t == BluetoothDeviceConnectionResponse::TYPE => {
                let resp: BluetoothDeviceConnectionResponse = decode_frame(&frame)?;
                if !resp.connected {
                    if let Some(address) = MacAddress::from_u64(resp.address) {
                        tracing::debug!(peer = %self.peer, mac = %address, error = resp.error, "device disconnected");
                        let _ = self.disconnections.send(address);
                    }
                }
                let _ = self.inbound.send(frame);
                Ok(())
            }
            _ => {
                let _ = self.inbound.send(frame);
                Ok(())
            }
        }
    }
}

/// Handshake step on the unsplit connection: send `req`, wait for `Resp`.
async fn exchange<Req: ApiMessage, Resp: ApiMessage>(conn: &mut FramedConn, req: &Req) -> Result<Resp, TransportError> {
    conn.send(encode(req)).await?;
    while let Some(frame) = conn.next().await {
        let frame = frame?;
        if frame.msg_type == Resp::TYPE {
            return decode_frame(&frame);
        }
        if frame.msg_type == PingRequest::TYPE {
            conn.send(encode(&PingResponse {})).await?;
        } else if frame.msg_type == DisconnectRequest::TYPE {
            return Err(TransportError::Closed);
        }
    }
    Err(TransportError::Closed)
}

async fn write_loop(
    mut sink: SplitSink<FramedConn, Frame>,
    mut outbound: mpsc::UnboundedReceiver<Frame>,
    closed: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            Some(frame) = outbound.recv() => {
                if let Err(e) = sink.send(frame).await {
                    tracing::warn!(error = %e, "proxy write failed");
                    break;
                }
            }
            _ = closed.cancelled() => break,
        }
    }
    closed.cancel();
    let _ = sink.close().await;
}

async fn read_loop(shared: Arc<Shared>, mut stream: SplitStream<FramedConn>) {
    loop {
        let frame = tokio::select! {
            _ = shared.closed.cancelled() => break,
            next = stream.next() => match next {
                Some(Ok(frame)) => frame,
                Some(Err(e)) => {
                    tracing::warn!(peer = %shared.peer, error = %e, "proxy connection failed");
                    break;
                }
                None => {
                    tracing::info!(peer = %shared.peer, "proxy closed connection");
                    break;
                }
            },
        };
        let msg_type = frame.msg_type;
        if let Err(e) = shared.dispatch(frame) {
            tracing::debug!(peer = %shared.peer, msg_type, error = %e, "dropped proxy frame");
        }
    }
    shared.closed.cancel();
}

#[async_trait]
impl ProxyTransport for EspHomeClient {
    async fn subscribe_advertisements(&self, sink: AdvertisementSink) -> Result<(), TransportError> {
        *self.shared.adv_sink.lock() = Some(sink);
        let flags = if self.has_feature(FEATURE_RAW_ADVERTISEMENTS) {
            ADV_FLAG_RAW
        } else {
            0
        };
        self.shared
            .send(encode(&SubscribeBluetoothLeAdvertisementsRequest { flags }))
    }

    async fn device_connect(&self, address: MacAddress) -> Result<(), TransportError> {
        let addr = address.to_u64();
        let request_type = if self.has_feature(FEATURE_REMOTE_CACHING) {
            REQUEST_CONNECT_V3_WITHOUT_CACHE
        } else {
            REQUEST_CONNECT
        };
        let address_type = self.shared.address_types.get(&addr).map(|t| *t);
        let req = BluetoothDeviceRequest {
            address: addr,
            request_type,
            has_address_type: address_type.is_some(),
            address_type: address_type.unwrap_or_default(),
        };

        let mtu = self
            .request(encode(&req), |f| {
                if f.msg_type != BluetoothDeviceConnectionResponse::TYPE {
                    return Ok(None);
                }
                let resp: BluetoothDeviceConnectionResponse = decode_frame(f)?;
                if resp.address != addr {
                    return Ok(None);
                }
                if resp.connected {
                    Ok(Some(resp.mtu))
                } else if resp.error != 0 {
                    Err(TransportError::Device { code: resp.error })
                } else {
                    Ok(None)
                }
            })
            .await?;
        tracing::debug!(peer = %self.shared.peer, mac = %address, mtu, "device connected");
        Ok(())
    }

    async fn device_disconnect(&self, address: MacAddress) -> Result<(), TransportError> {
        let addr = address.to_u64();
        let req = BluetoothDeviceRequest {
            address: addr,
            request_type: REQUEST_DISCONNECT,
            ..Default::default()
        };
        self.request(encode(&req), |f| {
            if f.msg_type != BluetoothDeviceConnectionResponse::TYPE {
                return Ok(None);
            }
            let resp: BluetoothDeviceConnectionResponse = decode_frame(f)?;
            Ok((resp.address == addr && !resp.connected).then_some(()))
        })
        .await
    }

    async fn gatt_services(&self, address: MacAddress) -> Result<Vec<GattService>, TransportError> {
        let addr = address.to_u64();
        let mut services = Vec::new();
        self.request(encode(&BluetoothGattGetServicesRequest { address: addr }), |f| {
            match f.msg_type {
                t if t == BluetoothGattGetServicesResponse::TYPE => {
                    let resp: BluetoothGattGetServicesResponse = decode_frame(f)?;
                    if resp.address == addr {
                        services.extend(resp.services.iter().map(parse::service));
                    }
                    Ok(None)
                }
                t if t == BluetoothGattGetServicesDoneResponse::TYPE => {
                    let done: BluetoothGattGetServicesDoneResponse = decode_frame(f)?;
                    Ok((done.address == addr).then_some(()))
                }
                t if t == BluetoothGattErrorResponse::TYPE => {
                    let err: BluetoothGattErrorResponse = decode_frame(f)?;
                    if err.address == addr {
                        return Err(TransportError::Gatt {
                            handle: err.handle,
                            code: err.error,
                        });
                    }
                    Ok(None)
                }
                _ => lost_connection(f, addr),
            }
        })
        .await?;
        Ok(services)
    }

    async fn gatt_write(
        &self,
        address: MacAddress,
        handle: u32,
        data: &[u8],
        response: bool,
    ) -> Result<(), TransportError> {
        let addr = address.to_u64();
        let frame = encode(&BluetoothGattWriteRequest {
            address: addr,
            handle,
            response,
            data: data.to_vec(),
        });
        if !response {
            return self.shared.send(frame);
        }
        self.gatt_request(frame, GATT_WRITE_RESPONSE, addr, handle).await
    }

    async fn gatt_notify(&self, address: MacAddress, handle: u32, enable: bool) -> Result<(), TransportError> {
        let addr = address.to_u64();
        let frame = encode(&BluetoothGattNotifyRequest {
            address: addr,
            handle,
            enable,
        });
        self.gatt_request(frame, GATT_NOTIFY_RESPONSE, addr, handle).await
    }

    fn notifications(&self) -> broadcast::Receiver<GattNotification> {
        self.shared.notifications.subscribe()
    }

    fn device_disconnections(&self) -> broadcast::Receiver<MacAddress> {
        self.shared.disconnections.subscribe()
    }

    fn is_connected(&self) -> bool {
        !self.shared.closed.is_cancelled()
    }

    async fn closed(&self) {
        self.shared.closed.cancelled().await;
    }

    async fn disconnect(&self) {
        if self.shared.closed.is_cancelled() {
            return;
        }
        let goodbye = self.request(encode(&DisconnectRequest {}), |f| {
            Ok((f.msg_type == DisconnectResponse::TYPE).then_some(()))
        });
        if tokio::time::timeout(DISCONNECT_GRACE, goodbye).await.is_err() {
            tracing::debug!(peer = %self.shared.peer, "no disconnect response from proxy");
        }
        self.shared.closed.cancel();
        tracing::info!(peer = %self.shared.peer, "proxy connection closed");
    }
}
