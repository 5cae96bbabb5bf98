//! BLE advertisement payloads for mesh membership
//!
//! Builds the manufacturer payload our peripheral role broadcasts and classifies
//! what the central role observes. The service UUID is only a coarse scan
//! filter; membership is decided by the payload's magic and version.

use crate::logging::log_hex;
use crate::transport::abstraction::PeripheralHandle;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

/// Payload magic, "NMP"
pub const MANUFACTURER_MAGIC: [u8; 3] = [0x4E, 0x4D, 0x50];

/// Only version this build understands
pub const PROTOCOL_VERSION: u8 = 0x01;

/// magic (3) + version (1) + device type (1)
pub const PAYLOAD_HEADER_LEN: usize = 5;

/// Advertised name bound; the legacy advertising PDU has little room left
pub const MAX_NAME_BYTES: usize = 10;

/// Platform family announced in the device-type byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceFamily {
    Android,
    Ios,
}

impl DeviceFamily {
    pub fn type_byte(self) -> u8 {
        match self {
            DeviceFamily::Android => 0x01,
            DeviceFamily::Ios => 0x02,
        }
    }

    pub fn from_type_byte(byte: u8) -> Option<Self> {
        match byte {
            0x01 => Some(DeviceFamily::Android),
            0x02 => Some(DeviceFamily::Ios),
            _ => None,
        }
    }
}

impl fmt::Display for DeviceFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceFamily::Android => write!(f, "android"),
            DeviceFamily::Ios => write!(f, "ios"),
        }
    }
}

/// Reasons an advertisement is not one of ours
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("No manufacturer payload")]
    MissingPayload,
    #[error("Manufacturer magic mismatch")]
    BadMagic,
    #[error("Payload too short: {0} bytes")]
    TooShort(usize),
    #[error("Unsupported protocol version: {0}")]
    UnsupportedVersion(u8),
    #[error("Unknown device type: 0x{0:02X}")]
    UnknownDeviceType(u8),
}

/// Decoded manufacturer payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManufacturerPayload {
    pub family: DeviceFamily,
    pub name: Option<String>,
}

impl ManufacturerPayload {
    /// Build a payload, truncating the name to [`MAX_NAME_BYTES`]
    pub fn new(family: DeviceFamily, name: Option<&str>) -> Self {
        Self::with_name_limit(family, name, MAX_NAME_BYTES)
    }

    pub fn with_name_limit(
        family: DeviceFamily,
        name: Option<&str>,
        max_name_bytes: usize,
    ) -> Self {
        let name = name
            .map(|n| truncate_utf8(n.trim(), max_name_bytes))
            .filter(|n| !n.is_empty())
            .map(str::to_string);
        Self { family, name }
    }

    pub fn encode(&self) -> Vec<u8> {
        let name = self.name.as_deref().unwrap_or_default().as_bytes();
        let mut bytes = Vec::with_capacity(PAYLOAD_HEADER_LEN + name.len());
        bytes.extend_from_slice(&MANUFACTURER_MAGIC);
        bytes.push(PROTOCOL_VERSION);
        bytes.push(self.family.type_byte());
        bytes.extend_from_slice(name);
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, ClassifyError> {
        if bytes.len() < MANUFACTURER_MAGIC.len() || bytes[..3] != MANUFACTURER_MAGIC {
            return Err(ClassifyError::BadMagic);
        }
        if bytes.len() < PAYLOAD_HEADER_LEN {
            return Err(ClassifyError::TooShort(bytes.len()));
        }
        if bytes[3] != PROTOCOL_VERSION {
            return Err(ClassifyError::UnsupportedVersion(bytes[3]));
        }
        let family = DeviceFamily::from_type_byte(bytes[4])
            .ok_or(ClassifyError::UnknownDeviceType(bytes[4]))?;

        let tail = &bytes[PAYLOAD_HEADER_LEN..];
        let name = if tail.is_empty() {
            None
        } else {
            match std::str::from_utf8(tail) {
                Ok(name) => Some(name.to_string()),
                Err(e) => {
                    debug!("Discarding undecodable advertised name: {}", e);
                    None
                }
            }
        };

        Ok(Self { family, name })
    }
}

/// Longest prefix of `s` that fits in `max_bytes` without splitting a character
pub fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// One scan observation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdvertisementRecord {
    pub peripheral: PeripheralHandle,
    pub rssi: i16,
    pub local_name: Option<String>,
    pub service_uuids: Vec<Uuid>,
    /// Vendor payload with the company identifier already stripped
    pub manufacturer_data: Option<Vec<u8>>,
}

/// An advertisement accepted as a mesh member
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedAdvertisement {
    pub peripheral: PeripheralHandle,
    pub family: DeviceFamily,
    pub display_name: String,
    pub rssi: i16,
}

/// Decides mesh membership from advertisement records
#[derive(Debug, Clone)]
pub struct AdvertisementClassifier {
    service_uuid: Uuid,
}

impl AdvertisementClassifier {
    pub fn new(service_uuid: Uuid) -> Self {
        Self { service_uuid }
    }

    pub fn service_uuid(&self) -> Uuid {
        self.service_uuid
    }

    /// Whether the record lists our service; informational only
    pub fn advertises_service(&self, record: &AdvertisementRecord) -> bool {
        record.service_uuids.contains(&self.service_uuid)
    }

    pub fn classify(
        &self,
        record: &AdvertisementRecord,
    ) -> Result<ClassifiedAdvertisement, ClassifyError> {
        let bytes = record
            .manufacturer_data
            .as_deref()
            .ok_or(ClassifyError::MissingPayload)?;

        let payload = match ManufacturerPayload::decode(bytes) {
            Ok(payload) => payload,
            Err(e) => {
                log_hex("Rejected manufacturer payload", bytes);
                return Err(e);
            }
        };
        log_hex("Accepted manufacturer payload", bytes);

        let display_name = payload
            .name
            .or_else(|| record.local_name.clone().filter(|n| !n.is_empty()))
            .unwrap_or_else(|| "Unknown".to_string());

        Ok(ClassifiedAdvertisement {
            peripheral: record.peripheral.clone(),
            family: payload.family,
            display_name,
            rssi: record.rssi,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn service() -> Uuid {
        Uuid::from_u128(0xfa87c0d0_afac_11de_8a39_0800200c9a66)
    }

    fn record(data: Option<Vec<u8>>, local_name: Option<&str>) -> AdvertisementRecord {
        AdvertisementRecord {
            peripheral: PeripheralHandle::new("P1"),
            rssi: -60,
            local_name: local_name.map(str::to_string),
            service_uuids: vec![service()],
            manufacturer_data: data,
        }
    }

    #[test]
    fn test_classify_android_without_name() {
        let classifier = AdvertisementClassifier::new(service());
        let result = classifier
            .classify(&record(Some(vec![0x4E, 0x4D, 0x50, 0x01, 0x01]), None))
            .unwrap();
        assert_eq!(result.family, DeviceFamily::Android);
        assert_eq!(result.display_name, "Unknown");
    }

    #[test]
    fn test_classify_ios_falls_back_to_local_name() {
        let classifier = AdvertisementClassifier::new(service());
        let result = classifier
            .classify(&record(Some(vec![0x4E, 0x4D, 0x50, 0x01, 0x02]), Some("iPad")))
            .unwrap();
        assert_eq!(result.family, DeviceFamily::Ios);
        assert_eq!(result.display_name, "iPad");
    }

    #[test]
    fn test_payload_name_wins_over_local_name() {
        let classifier = AdvertisementClassifier::new(service());
        let bytes = ManufacturerPayload::new(DeviceFamily::Android, Some("pixel")).encode();
        let result = classifier.classify(&record(Some(bytes), Some("other"))).unwrap();
        assert_eq!(result.display_name, "pixel");
    }

    #[test]
    fn test_reject_without_magic() {
        let classifier = AdvertisementClassifier::new(service());
        assert_eq!(
            classifier.classify(&record(Some(vec![0x00, 0x00, 0x00]), None)),
            Err(ClassifyError::BadMagic)
        );
        assert_eq!(
            classifier.classify(&record(None, Some("Speaker"))),
            Err(ClassifyError::MissingPayload)
        );
    }

    #[test]
    fn test_reject_truncated_header() {
        assert_eq!(
            ManufacturerPayload::decode(&[0x4E, 0x4D, 0x50, 0x01]),
            Err(ClassifyError::TooShort(4))
        );
    }

    #[test]
    fn test_reject_wrong_version() {
        assert_eq!(
            ManufacturerPayload::decode(&[0x4E, 0x4D, 0x50, 0x02, 0x01]),
            Err(ClassifyError::UnsupportedVersion(2))
        );
    }

    #[test]
    fn test_reject_unknown_device_type() {
        assert_eq!(
            ManufacturerPayload::decode(&[0x4E, 0x4D, 0x50, 0x01, 0x07]),
            Err(ClassifyError::UnknownDeviceType(7))
        );
    }

    #[test]
    fn test_invalid_utf8_name_is_discarded_not_rejected() {
        let payload =
            ManufacturerPayload::decode(&[0x4E, 0x4D, 0x50, 0x01, 0x02, 0xFF, 0xFE]).unwrap();
        assert_eq!(payload.family, DeviceFamily::Ios);
        assert_eq!(payload.name, None);
    }

    #[test]
    fn test_encoder_truncates_on_char_boundary() {
        // "é" is two bytes; ten bytes would split the fifth one
        let payload = ManufacturerPayload::new(DeviceFamily::Ios, Some("ééééééé"));
        assert_eq!(payload.name.as_deref(), Some("ééééé"));
        assert_eq!(payload.encode().len(), PAYLOAD_HEADER_LEN + 10);
    }

    #[test]
    fn test_encoder_drops_blank_name() {
        let payload = ManufacturerPayload::new(DeviceFamily::Android, Some("   "));
        assert_eq!(payload.name, None);
        assert_eq!(payload.encode(), vec![0x4E, 0x4D, 0x50, 0x01, 0x01]);
    }

    #[test]
    fn test_advertises_service() {
        let classifier = AdvertisementClassifier::new(service());
        let mut rec = record(None, None);
        assert!(classifier.advertises_service(&rec));
        rec.service_uuids.clear();
        assert!(!classifier.advertises_service(&rec));
    }

    proptest! {
        #[test]
        fn prop_magicless_payloads_never_classify(
            bytes in proptest::collection::vec(any::<u8>(), 0..32)
        ) {
            prop_assume!(bytes.len() < 3 || bytes[..3] != MANUFACTURER_MAGIC);
            let classifier = AdvertisementClassifier::new(service());
            prop_assert!(classifier.classify(&record(Some(bytes), Some("x"))).is_err());
        }

        #[test]
        fn prop_encoded_names_stay_within_bound(name in "\\PC{0,24}") {
            let payload = ManufacturerPayload::new(DeviceFamily::Android, Some(&name));
            let encoded = payload.encode();
            prop_assert!(encoded.len() <= PAYLOAD_HEADER_LEN + MAX_NAME_BYTES);
            let decoded = ManufacturerPayload::decode(&encoded).unwrap();
            prop_assert_eq!(decoded, payload);
        }
    }
}
