//! Decoding helpers for advertisement payloads and GATT tables.

use uuid::Uuid;

use blerelay_services::{CharProperties, GattCharacteristic, GattService};

use super::messages::{BluetoothGattCharacteristic, BluetoothGattService};

const AD_SHORTENED_LOCAL_NAME: u8 = 0x08;
const AD_COMPLETE_LOCAL_NAME: u8 = 0x09;

/// Local name from raw advertisement data: the complete name if present,
/// otherwise the shortened one.
pub fn local_name(data: &[u8]) -> Option<String> {
    let mut shortened = None;
    let mut i = 0;
    while i < data.len() {
        let len = data[i] as usize;
        if len == 0 || i + 1 + len > data.len() {
            break;
        }
        let ad_type = data[i + 1];
        let value = &data[i + 2..i + 1 + len];
        match ad_type {
            AD_COMPLETE_LOCAL_NAME => return Some(String::from_utf8_lossy(value).into_owned()),
            AD_SHORTENED_LOCAL_NAME if shortened.is_none() => {
                shortened = Some(String::from_utf8_lossy(value).into_owned());
            }
            _ => {}
        }
        i += 1 + len;
    }
    shortened
}

/// Hyphenated uppercase UUID from the proxy's `(high, low)` pair, or from
/// the short form over the Bluetooth base UUID.
pub fn gatt_uuid(pair: &[u64], short: u32) -> String {
    match pair {
        [hi, lo] => Uuid::from_u64_pair(*hi, *lo).hyphenated().to_string().to_uppercase(),
        _ => format!("{short:08X}-0000-1000-8000-00805F9B34FB"),
    }
}

pub fn service(svc: &BluetoothGattService) -> GattService {
    GattService {
        uuid: gatt_uuid(&svc.uuid, svc.short_uuid),
        handle: svc.handle,
        characteristics: svc.characteristics.iter().map(characteristic).collect(),
    }
}

fn characteristic(c: &BluetoothGattCharacteristic) -> GattCharacteristic {
    GattCharacteristic {
        uuid: gatt_uuid(&c.uuid, c.short_uuid),
        handle: c.handle,
        properties: CharProperties(c.properties),
    }
}
