//! Engine configuration
//!
//! Everything here has a working default; hosts override what they need
//! (usually from a JSON file) and call [`EngineConfig::validate`] once.

use crate::logging::LogLevel;
use crate::transport::ble::{DeviceFamily, ScanStrategyConfig, DEFAULT_WRITE_LEN, MAX_NAME_BYTES};
use crate::NearbyError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

/// Service UUID used when `initialize` gets none
pub const DEFAULT_SERVICE_UUID: &str = "fa87c0d0-afac-11de-8a39-0800200c9a66";

/// Expansion suffix for 16/32-bit Bluetooth SIG short UUIDs
pub const BLUETOOTH_BASE_UUID_SUFFIX: &str = "-0000-1000-8000-00805f9b34fb";

pub const DEFAULT_DISPLAY_NAME: &str = "nearby-device";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Session service type and BLE discovery scope
    pub service_id: String,
    /// Service UUID string in any accepted form; `None` uses the default
    pub service_uuid: Option<String>,
    /// Name advertised on both transports
    pub display_name: String,
    /// Family announced in our manufacturer payload
    pub device_family: DeviceFamily,
    /// Per radio command bound in milliseconds (default 10s)
    pub command_timeout_ms: u64,
    /// Connection attempt bound in milliseconds (default 30s)
    pub connection_timeout_ms: u64,
    pub scan: ScanStrategyConfig,
    /// Byte bound for the name inside the manufacturer payload
    pub max_name_bytes: usize,
    /// Bytes per GATT write, header included
    pub write_len: usize,
    pub log_level: LogLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            service_id: "nearby-multipeer".to_string(),
            service_uuid: None,
            display_name: DEFAULT_DISPLAY_NAME.to_string(),
            device_family: DeviceFamily::Android,
            command_timeout_ms: 10_000,
            connection_timeout_ms: 30_000,
            scan: ScanStrategyConfig::default(),
            max_name_bytes: MAX_NAME_BYTES,
            write_len: DEFAULT_WRITE_LEN,
            log_level: LogLevel::Info,
        }
    }
}

impl EngineConfig {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    /// Configured service UUID, or the default
    pub fn resolved_service_uuid(&self) -> Result<Uuid, NearbyError> {
        match self.service_uuid.as_deref() {
            Some(raw) if !raw.trim().is_empty() => parse_service_uuid(raw),
            _ => parse_service_uuid(DEFAULT_SERVICE_UUID),
        }
    }

    pub fn validate(&self) -> Result<(), NearbyError> {
        if self.service_id.trim().is_empty() {
            return Err(NearbyError::InvalidConfiguration(
                "service id must not be empty".to_string(),
            ));
        }
        if self.display_name.trim().is_empty() {
            return Err(NearbyError::InvalidConfiguration(
                "display name must not be empty".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 || self.connection_timeout_ms == 0 {
            return Err(NearbyError::InvalidConfiguration(
                "timeouts must be > 0".to_string(),
            ));
        }
        if self.max_name_bytes > MAX_NAME_BYTES {
            return Err(NearbyError::InvalidConfiguration(format!(
                "max_name_bytes must be <= {}",
                MAX_NAME_BYTES
            )));
        }
        crate::transport::ble::GattFragmenter::new(self.write_len)
            .map_err(|e| NearbyError::InvalidConfiguration(e.to_string()))?;
        self.scan.validate()?;
        self.resolved_service_uuid()?;
        Ok(())
    }
}

/// Normalize a service UUID string.
///
/// Accepts 16/32-bit short forms (optionally `0x`-prefixed, expanded against
/// the Bluetooth base UUID), 32 undashed hex digits, and the dashed 128-bit
/// form. Case and surrounding whitespace are ignored.
pub fn parse_service_uuid(input: &str) -> Result<Uuid, NearbyError> {
    let invalid =
        || NearbyError::InvalidConfiguration(format!("malformed service UUID '{}'", input));

    let lowered = input.trim().to_ascii_lowercase();
    let raw = lowered.strip_prefix("0x").unwrap_or(&lowered);

    if raw.len() < 4 {
        return Err(invalid());
    }

    let canonical = if raw.len() <= 8 {
        if !is_hex(raw) {
            return Err(invalid());
        }
        format!("{:0>8}{}", raw, BLUETOOTH_BASE_UUID_SUFFIX)
    } else if !raw.contains('-') {
        if raw.len() != 32 || !is_hex(raw) {
            return Err(invalid());
        }
        format!(
            "{}-{}-{}-{}-{}",
            &raw[0..8],
            &raw[8..12],
            &raw[12..16],
            &raw[16..20],
            &raw[20..32]
        )
    } else {
        let groups: Vec<&str> = raw.split('-').collect();
        let lengths: Vec<usize> = groups.iter().map(|g| g.len()).collect();
        if lengths != [8, 4, 4, 4, 12] || !groups.iter().all(|g| is_hex(g)) {
            return Err(invalid());
        }
        raw.to_string()
    };

    Uuid::parse_str(&canonical).map_err(|_| invalid())
}

fn is_hex(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.connection_timeout(), Duration::from_secs(30));
        assert_eq!(
            config.resolved_service_uuid().unwrap().to_string(),
            DEFAULT_SERVICE_UUID
        );
    }

    #[test]
    fn test_config_partial_json_uses_defaults() {
        let config: EngineConfig =
            serde_json::from_str(r#"{"service_id":"chat","log_level":4}"#).unwrap();
        assert_eq!(config.service_id, "chat");
        assert_eq!(config.log_level, LogLevel::Debug);
        assert_eq!(config.connection_timeout_ms, 30_000);
    }

    #[test]
    fn test_config_rejects_bad_values() {
        let mut config = EngineConfig::default();
        config.service_id = "  ".to_string();
        assert!(config.validate().is_err());

        let mut config = EngineConfig::default();
        config.write_len = 4;
        assert!(matches!(
            config.validate(),
            Err(NearbyError::InvalidConfiguration(_))
        ));

        let mut config = EngineConfig::default();
        config.service_uuid = Some("xyz".to_string());
        assert!(matches!(
            config.validate(),
            Err(NearbyError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn test_short_uuid_forms_expand() {
        assert_eq!(
            parse_service_uuid("180D").unwrap().to_string(),
            "0000180d-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            parse_service_uuid("0xFEAA").unwrap().to_string(),
            "0000feaa-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            parse_service_uuid("1234abcd").unwrap().to_string(),
            "1234abcd-0000-1000-8000-00805f9b34fb"
        );
    }

    #[test]
    fn test_full_uuid_forms() {
        assert_eq!(
            parse_service_uuid(" FA87C0D0AFAC11DE8A390800200C9A66 ").unwrap().to_string(),
            DEFAULT_SERVICE_UUID
        );
        assert_eq!(
            parse_service_uuid("FA87C0D0-AFAC-11DE-8A39-0800200C9A66").unwrap().to_string(),
            DEFAULT_SERVICE_UUID
        );
    }

    #[test]
    fn test_malformed_uuids_rejected() {
        for bad in [
            "",
            "0x",
            "abc",
            "zzzz",
            "fa87c0d0afac11de8a39",
            "fa87c0d0-afac-11de-8a39",
            "{fa87c0d0-afac-11de-8a39-0800200c9a66}",
        ] {
            assert!(
                matches!(parse_service_uuid(bad), Err(NearbyError::InvalidConfiguration(_))),
                "accepted {:?}",
                bad
            );
        }
    }

    proptest! {
        #[test]
        fn prop_parse_never_panics(input in "\\PC{0,48}") {
            let _ = parse_service_uuid(&input);
        }

        #[test]
        fn prop_short_forms_use_base_uuid(value in any::<u16>()) {
            let parsed = parse_service_uuid(&format!("{:04x}", value)).unwrap();
            prop_assert!(parsed.to_string().ends_with(BLUETOOTH_BASE_UUID_SUFFIX));
        }
    }
}
