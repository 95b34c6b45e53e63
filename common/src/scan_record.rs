use crate::uuid::Uuid;
use std::collections::HashMap;

// AD structure type bytes, Bluetooth Core Spec Supplement Part A, Section 1.
// Mirrors the encode-side constants used for advertising, read here in the
// decode direction.
const FLAGS: u8 = 0x01;
const INCOMPLETE_LIST_16_BIT_SERVICE_UUIDS: u8 = 0x02;
const COMPLETE_LIST_16_BIT_SERVICE_UUIDS: u8 = 0x03;
const INCOMPLETE_LIST_32_BIT_SERVICE_UUIDS: u8 = 0x04;
const COMPLETE_LIST_32_BIT_SERVICE_UUIDS: u8 = 0x05;
const INCOMPLETE_LIST_128_BIT_SERVICE_UUIDS: u8 = 0x06;
const COMPLETE_LIST_128_BIT_SERVICE_UUIDS: u8 = 0x07;
const SHORTENED_LOCAL_NAME: u8 = 0x08;
const COMPLETE_LOCAL_NAME: u8 = 0x09;
const TX_POWER_LEVEL: u8 = 0x0a;
const SERVICE_DATA_16_BIT_UUID: u8 = 0x16;
const SERVICE_DATA_32_BIT_UUID: u8 = 0x20;
const SERVICE_DATA_128_BIT_UUID: u8 = 0x21;
const MANUFACTURER_SPECIFIC_DATA: u8 = 0xff;

/// Parsed contents of a raw BLE advertisement or scan-response payload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanRecord {
    pub flags: Option<u8>,
    pub advertised_services: Vec<Uuid>,
    pub manufacturer_data: HashMap<u16, Vec<u8>>,
    pub service_data: HashMap<Uuid, Vec<u8>>,
    pub tx_power: Option<i8>,
    pub local_name: Option<String>,
}

impl ScanRecord {
    /// Parses a concatenated sequence of AD structures. Structures that are
    /// truncated or whose length byte doesn't fit the remaining bytes are
    /// skipped rather than aborting the whole parse: an advertisement is
    /// never unparseable, only partially uninterpreted.
    pub fn parse(bytes: &[u8]) -> ScanRecord {
        let mut record = ScanRecord::default();
        let mut i = 0usize;

        while i < bytes.len() {
            let len = bytes[i] as usize;
            if len == 0 {
                break;
            }
            if i + 1 + len > bytes.len() {
                break;
            }
            let ad_type = bytes[i + 1];
            let data = &bytes[i + 2..i + 1 + len];

            match ad_type {
                FLAGS => {
                    record.flags = data.first().copied();
                }
                INCOMPLETE_LIST_16_BIT_SERVICE_UUIDS | COMPLETE_LIST_16_BIT_SERVICE_UUIDS => {
                    parse_uuid_list(data, 2, &mut record.advertised_services);
                }
                INCOMPLETE_LIST_32_BIT_SERVICE_UUIDS | COMPLETE_LIST_32_BIT_SERVICE_UUIDS => {
                    parse_uuid_list(data, 4, &mut record.advertised_services);
                }
                INCOMPLETE_LIST_128_BIT_SERVICE_UUIDS | COMPLETE_LIST_128_BIT_SERVICE_UUIDS => {
                    parse_uuid_list(data, 16, &mut record.advertised_services);
                }
                SHORTENED_LOCAL_NAME | COMPLETE_LOCAL_NAME => {
                    record.local_name = std::str::from_utf8(data).ok().map(|s| s.to_string());
                }
                TX_POWER_LEVEL => {
                    record.tx_power = data.first().map(|&b| b as i8);
                }
                SERVICE_DATA_16_BIT_UUID => insert_service_data(data, 2, &mut record.service_data),
                SERVICE_DATA_32_BIT_UUID => insert_service_data(data, 4, &mut record.service_data),
                SERVICE_DATA_128_BIT_UUID => insert_service_data(data, 16, &mut record.service_data),
                MANUFACTURER_SPECIFIC_DATA => {
                    if data.len() >= 2 {
                        let id = u16::from_le_bytes([data[0], data[1]]);
                        record.manufacturer_data.insert(id, data[2..].to_vec());
                    }
                }
                _ => {}
            }

            i += 1 + len;
        }

        record
    }
}

fn parse_uuid_list(data: &[u8], width: usize, out: &mut Vec<Uuid>) {
    let mut i = 0;
    while i + width <= data.len() {
        if let Some(uuid) = uuid_from_le_bytes(&data[i..i + width]) {
            out.push(uuid);
        }
        i += width;
    }
}

fn insert_service_data(data: &[u8], width: usize, out: &mut HashMap<Uuid, Vec<u8>>) {
    if data.len() < width {
        return;
    }
    if let Some(uuid) = uuid_from_le_bytes(&data[..width]) {
        out.insert(uuid, data[width..].to_vec());
    }
}

fn uuid_from_le_bytes(bytes: &[u8]) -> Option<Uuid> {
    match bytes.len() {
        2 => Uuid::from_string(format!("{:02x}{:02x}", bytes[1], bytes[0])),
        4 => Uuid::from_string(format!("{:02x}{:02x}{:02x}{:02x}", bytes[3], bytes[2], bytes[1], bytes[0])),
        16 => {
            let mut be = bytes.to_vec();
            be.reverse();
            Uuid::from_bytes(&be)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_flags_and_local_name() {
        let bytes = [
            0x02, FLAGS, 0x06, // flags = 0x06
            0x08, COMPLETE_LOCAL_NAME, b'h', b'i',
        ];
        let record = ScanRecord::parse(&bytes);
        assert_eq!(record.flags, Some(0x06));
        assert_eq!(record.local_name.as_deref(), Some("hi"));
    }

    #[test]
    fn parses_manufacturer_data() {
        let bytes = [0x05, MANUFACTURER_SPECIFIC_DATA, 0x4c, 0x00, 0xaa, 0xbb];
        let record = ScanRecord::parse(&bytes);
        assert_eq!(record.manufacturer_data.get(&0x004c), Some(&vec![0xaa, 0xbb]));
    }

    #[test]
    fn parses_16_bit_service_uuid_list() {
        let bytes = [0x03, COMPLETE_LIST_16_BIT_SERVICE_UUIDS, 0x00, 0x18];
        let record = ScanRecord::parse(&bytes);
        assert_eq!(record.advertised_services.len(), 1);
        assert_eq!(record.advertised_services[0].get_shortest_slice(), &[0x18, 0x00]);
    }

    #[test]
    fn truncated_structure_is_skipped_not_fatal() {
        let bytes = [0x05, FLAGS, 0x01];
        let record = ScanRecord::parse(&bytes);
        assert_eq!(record.flags, None);
    }

    #[test]
    fn tx_power_is_signed() {
        let bytes = [0x02, TX_POWER_LEVEL, 0xf6];
        let record = ScanRecord::parse(&bytes);
        assert_eq!(record.tx_power, Some(-10));
    }
}
