//! ESPHome native API messages used by the relay.
//!
//! Only the fields the relay reads or writes are declared; prost skips the
//! rest on decode.

use prost::Message;

/// Message type id on the wire.
pub trait ApiMessage: Message + Default {
    const TYPE: u32;
}

macro_rules! api_message {
    ($($name:ident = $id:expr),* $(,)?) => {
        $(impl ApiMessage for $name { const TYPE: u32 = $id; })*
    };
}

// ── Connection ────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct HelloRequest {
    #[prost(string, tag = "1")]
    pub client_info: String,
    #[prost(uint32, tag = "2")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "3")]
    pub api_version_minor: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct HelloResponse {
    #[prost(uint32, tag = "1")]
    pub api_version_major: u32,
    #[prost(uint32, tag = "2")]
    pub api_version_minor: u32,
    #[prost(string, tag = "3")]
    pub server_info: String,
    #[prost(string, tag = "4")]
    pub name: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectRequest {
    #[prost(string, tag = "1")]
    pub password: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct ConnectResponse {
    #[prost(bool, tag = "1")]
    pub invalid_password: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DisconnectResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct PingRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct PingResponse {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct DeviceInfoResponse {
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(string, tag = "3")]
    pub mac_address: String,
    #[prost(string, tag = "4")]
    pub esphome_version: String,
    #[prost(uint32, tag = "15")]
    pub bluetooth_proxy_feature_flags: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetTimeRequest {}

#[derive(Clone, PartialEq, Message)]
pub struct GetTimeResponse {
    #[prost(fixed32, tag = "1")]
    pub epoch_seconds: u32,
}

// ── Advertisements ────────────────────────────────────────────────────────────

pub const ADV_FLAG_RAW: u32 = 1;

#[derive(Clone, PartialEq, Message)]
pub struct SubscribeBluetoothLeAdvertisementsRequest {
    #[prost(uint32, tag = "1")]
    pub flags: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothLeAdvertisementResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bytes = "vec", tag = "2")]
    pub name: Vec<u8>,
    #[prost(sint32, tag = "3")]
    pub rssi: i32,
    #[prost(uint32, tag = "7")]
    pub address_type: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothLeRawAdvertisement {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(sint32, tag = "2")]
    pub rssi: i32,
    #[prost(uint32, tag = "3")]
    pub address_type: u32,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothLeRawAdvertisementsResponse {
    #[prost(message, repeated, tag = "1")]
    pub advertisements: Vec<BluetoothLeRawAdvertisement>,
}

// ── Device connections ────────────────────────────────────────────────────────

pub const REQUEST_CONNECT: u32 = 0;
pub const REQUEST_DISCONNECT: u32 = 1;
pub const REQUEST_CONNECT_V3_WITHOUT_CACHE: u32 = 5;

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothDeviceRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub request_type: u32,
    #[prost(bool, tag = "3")]
    pub has_address_type: bool,
    #[prost(uint32, tag = "4")]
    pub address_type: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothDeviceConnectionResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(bool, tag = "2")]
    pub connected: bool,
    #[prost(uint32, tag = "3")]
    pub mtu: u32,
    #[prost(int32, tag = "4")]
    pub error: i32,
}

// ── GATT ──────────────────────────────────────────────────────────────────────

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattGetServicesRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattCharacteristic {
    #[prost(uint64, repeated, tag = "1")]
    pub uuid: Vec<u64>,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(uint32, tag = "3")]
    pub properties: u32,
    #[prost(uint32, tag = "5")]
    pub short_uuid: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattService {
    #[prost(uint64, repeated, tag = "1")]
    pub uuid: Vec<u64>,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(message, repeated, tag = "3")]
    pub characteristics: Vec<BluetoothGattCharacteristic>,
    #[prost(uint32, tag = "4")]
    pub short_uuid: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattGetServicesResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(message, repeated, tag = "2")]
    pub services: Vec<BluetoothGattService>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattGetServicesDoneResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattWriteRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bool, tag = "3")]
    pub response: bool,
    #[prost(bytes = "vec", tag = "4")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattNotifyRequest {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bool, tag = "3")]
    pub enable: bool,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattNotifyDataResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(bytes = "vec", tag = "3")]
    pub data: Vec<u8>,
}

#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattErrorResponse {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
    #[prost(int32, tag = "3")]
    pub error: i32,
}

/// Shared shape of the write and notify acknowledgements.
#[derive(Clone, PartialEq, Message)]
pub struct BluetoothGattAck {
    #[prost(uint64, tag = "1")]
    pub address: u64,
    #[prost(uint32, tag = "2")]
    pub handle: u32,
}

pub const GATT_WRITE_RESPONSE: u32 = 83;
pub const GATT_NOTIFY_RESPONSE: u32 = 84;

api_message! {
    HelloRequest = 1,
    HelloResponse = 2,
    ConnectRequest = 3,
    ConnectResponse = 4,
    DisconnectRequest = 5,
    DisconnectResponse = 6,
    PingRequest = 7,
    PingResponse = 8,
    DeviceInfoRequest = 9,
    DeviceInfoResponse = 10,
    GetTimeRequest = 36,
    GetTimeResponse = 37,
    SubscribeBluetoothLeAdvertisementsRequest = 66,
    BluetoothLeAdvertisementResponse = 67,
    BluetoothDeviceRequest = 68,
    BluetoothDeviceConnectionResponse = 69,
    BluetoothGattGetServicesRequest = 70,
    BluetoothGattGetServicesResponse = 71,
    BluetoothGattGetServicesDoneResponse = 72,
    BluetoothGattWriteRequest = 75,
    BluetoothGattNotifyRequest = 78,
    BluetoothGattNotifyDataResponse = 79,
    BluetoothGattErrorResponse = 82,
    BluetoothLeRawAdvertisementsResponse = 93,
}

// ── Feature flags (DeviceInfoResponse.bluetooth_proxy_feature_flags) ─────────

pub const FEATURE_ACTIVE_CONNECTIONS: u32 = 1 << 1;
pub const FEATURE_REMOTE_CACHING: u32 = 1 << 2;
pub const FEATURE_RAW_ADVERTISEMENTS: u32 = 1 << 5;
