//! Session-protocol framing
//!
//! Application text goes over the session as raw UTF-8. The only control
//! message is the disconnect notice, a small JSON object sent before a peer
//! tears its side down.

use crate::transport::abstraction::TransportError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

pub const DISCONNECT_REASON: &str = "Disconnected by user";

/// Discovery-info key carrying the service id
pub const SERVICE_ID_KEY: &str = "serviceId";

#[derive(Debug, Serialize, Deserialize)]
struct ControlNotice {
    reason: String,
}

/// One unit of data on a session link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFrame {
    Text(String),
    DisconnectNotice,
}

impl SessionFrame {
    pub fn encode(&self) -> Result<Vec<u8>, TransportError> {
        match self {
            SessionFrame::Text(text) => Ok(text.as_bytes().to_vec()),
            SessionFrame::DisconnectNotice => serde_json::to_vec(&ControlNotice {
                reason: DISCONNECT_REASON.to_string(),
            })
            .map_err(|e| TransportError::InvalidPayload(e.to_string())),
        }
    }

    pub fn decode(data: &[u8]) -> Result<Self, TransportError> {
        if let Ok(notice) = serde_json::from_slice::<ControlNotice>(data) {
            if notice.reason == DISCONNECT_REASON {
                return Ok(SessionFrame::DisconnectNotice);
            }
        }
        let text = std::str::from_utf8(data)
            .map_err(|e| TransportError::InvalidPayload(format!("not UTF-8: {}", e)))?;
        Ok(SessionFrame::Text(text.to_string()))
    }
}

/// Discovery info advertised alongside the display name
pub fn discovery_info(service_id: &str) -> HashMap<String, String> {
    HashMap::from([(SERVICE_ID_KEY.to_string(), service_id.to_string())])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disconnect_notice_wire_format() {
        let bytes = SessionFrame::DisconnectNotice.encode().unwrap();
        assert_eq!(bytes, br#"{"reason":"Disconnected by user"}"#.to_vec());
        assert_eq!(
            SessionFrame::decode(&bytes).unwrap(),
            SessionFrame::DisconnectNotice
        );
    }

    #[test]
    fn test_text_frames_pass_through() {
        assert_eq!(
            SessionFrame::decode(b"hello").unwrap(),
            SessionFrame::Text("hello".to_string())
        );
        // JSON with another reason is ordinary application text
        assert_eq!(
            SessionFrame::decode(br#"{"reason":"lunch"}"#).unwrap(),
            SessionFrame::Text(r#"{"reason":"lunch"}"#.to_string())
        );
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        assert!(matches!(
            SessionFrame::decode(&[0xFF, 0xFE]),
            Err(TransportError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_discovery_info_carries_service_id() {
        let info = discovery_info("nearby-chat");
        assert_eq!(info.get(SERVICE_ID_KEY).map(String::as_str), Some("nearby-chat"));
    }
}
