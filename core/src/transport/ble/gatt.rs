//! GATT message framing
//!
//! Text messages travel over one characteristic. Anything longer than a single
//! write is split into fragments, each carrying a small header so the receiver
//! can report progress and rebuild the message.

use thiserror::Error;
use uuid::Uuid;

/// Message characteristic, written by centrals and notified by peripherals
pub const MESSAGE_CHARACTERISTIC_UUID: Uuid =
    Uuid::from_u128(0x34B1CF4D_1069_4AD6_89B6_E161D79BE4D8);

/// Maximum GATT attribute value size (protocol limitation)
pub const MAX_CHARACTERISTIC_SIZE: usize = 512;

/// Write size that fits a typical negotiated MTU on both platform families
pub const DEFAULT_WRITE_LEN: usize = 180;

/// Errors for GATT framing
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GattError {
    #[error("Fragmentation error: {0}")]
    FragmentationError(String),
    #[error("Reassembly error: {0}")]
    ReassemblyError(String),
}

/// Fragment header: [message_len: u32 | fragment_index: u16 | fragment_count: u16], big-endian
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GattFragmentHeader {
    /// Length of the whole message in bytes
    pub message_len: u32,
    /// Index of this fragment (0-based)
    pub fragment_index: u16,
    /// Total number of fragments
    pub fragment_count: u16,
}

impl GattFragmentHeader {
    pub const HEADER_SIZE: usize = 8;

    pub fn new(
        message_len: u32,
        fragment_index: u16,
        fragment_count: u16,
    ) -> Result<Self, GattError> {
        if fragment_count == 0 || fragment_index >= fragment_count {
            return Err(GattError::FragmentationError(format!(
                "Fragment index {} out of range for {} fragments",
                fragment_index, fragment_count
            )));
        }
        Ok(Self {
            message_len,
            fragment_index,
            fragment_count,
        })
    }

    pub fn to_bytes(&self) -> [u8; Self::HEADER_SIZE] {
        let mut bytes = [0u8; Self::HEADER_SIZE];
        bytes[0..4].copy_from_slice(&self.message_len.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.fragment_index.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.fragment_count.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GattError> {
        if bytes.len() < Self::HEADER_SIZE {
            return Err(GattError::ReassemblyError(
                "Fragment header too short".to_string(),
            ));
        }
        let message_len = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        let fragment_index = u16::from_be_bytes([bytes[4], bytes[5]]);
        let fragment_count = u16::from_be_bytes([bytes[6], bytes[7]]);
        Self::new(message_len, fragment_index, fragment_count)
            .map_err(|e| GattError::ReassemblyError(e.to_string()))
    }
}

/// Splits messages into characteristic-sized writes
#[derive(Debug, Clone, Copy)]
pub struct GattFragmenter {
    write_len: usize,
}

impl GattFragmenter {
    pub fn new(write_len: usize) -> Result<Self, GattError> {
        if write_len <= GattFragmentHeader::HEADER_SIZE || write_len > MAX_CHARACTERISTIC_SIZE {
            return Err(GattError::FragmentationError(format!(
                "Write length {} outside ({}, {}]",
                write_len,
                GattFragmentHeader::HEADER_SIZE,
                MAX_CHARACTERISTIC_SIZE
            )));
        }
        Ok(Self { write_len })
    }

    pub fn max_payload_per_write(&self) -> usize {
        self.write_len - GattFragmentHeader::HEADER_SIZE
    }

    /// Split a message; an empty message still yields one fragment
    pub fn fragment(&self, data: &[u8]) -> Result<Vec<Vec<u8>>, GattError> {
        let max_payload = self.max_payload_per_write();
        let message_len = u32::try_from(data.len()).map_err(|_| {
            GattError::FragmentationError("Message too large for GATT fragmentation".to_string())
        })?;

        let count = data.len().div_ceil(max_payload).max(1);
        let fragment_count = u16::try_from(count).map_err(|_| {
            GattError::FragmentationError("Message too large for GATT fragmentation".to_string())
        })?;

        if data.is_empty() {
            let header = GattFragmentHeader::new(0, 0, 1)?;
            return Ok(vec![header.to_bytes().to_vec()]);
        }

        let mut fragments = Vec::with_capacity(count);
        for (index, chunk) in data.chunks(max_payload).enumerate() {
            let header = GattFragmentHeader::new(message_len, index as u16, fragment_count)?;
            let mut fragment = header.to_bytes().to_vec();
            fragment.extend_from_slice(chunk);
            fragments.push(fragment);
        }

        Ok(fragments)
    }
}

impl Default for GattFragmenter {
    fn default() -> Self {
        Self {
            write_len: DEFAULT_WRITE_LEN,
        }
    }
}

/// Result of feeding one fragment to a [`GattReassembler`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReassemblyProgress {
    /// More fragments expected
    Partial { received_bytes: u64, total_bytes: u64 },
    /// Last fragment arrived
    Complete(Vec<u8>),
}

/// Streaming reassembler for one link.
///
/// GATT writes on a link arrive in order, so fragments must arrive in index
/// order. Index 0 always starts a new message and drops any partial one.
#[derive(Debug, Default)]
pub struct GattReassembler {
    current: Option<PartialMessage>,
}

#[derive(Debug)]
struct PartialMessage {
    message_len: u32,
    fragment_count: u16,
    next_index: u16,
    buffer: Vec<u8>,
}

impl GattReassembler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_idle(&self) -> bool {
        self.current.is_none()
    }

    pub fn push(&mut self, fragment: &[u8]) -> Result<ReassemblyProgress, GattError> {
        let header = GattFragmentHeader::from_bytes(fragment)?;
        let body = &fragment[GattFragmentHeader::HEADER_SIZE..];

        if header.fragment_index == 0 {
            self.current = Some(PartialMessage {
                message_len: header.message_len,
                fragment_count: header.fragment_count,
                next_index: 0,
                buffer: Vec::new(),
            });
        }

        let Some(partial) = self.current.as_mut() else {
            return Err(GattError::ReassemblyError(format!(
                "Fragment {} arrived without a message in progress",
                header.fragment_index
            )));
        };

        if header.fragment_index != partial.next_index
            || header.fragment_count != partial.fragment_count
            || header.message_len != partial.message_len
        {
            let expected = partial.next_index;
            self.current = None;
            return Err(GattError::ReassemblyError(format!(
                "Fragment out of order: expected index {}, got {}",
                expected, header.fragment_index
            )));
        }

        partial.buffer.extend_from_slice(body);
        partial.next_index += 1;

        if partial.buffer.len() > partial.message_len as usize {
            self.current = None;
            return Err(GattError::ReassemblyError(
                "Fragments exceed declared message length".to_string(),
            ));
        }

        if partial.next_index < partial.fragment_count {
            return Ok(ReassemblyProgress::Partial {
                received_bytes: partial.buffer.len() as u64,
                total_bytes: partial.message_len as u64,
            });
        }

        let finished = self.current.take().map(|p| p.buffer).unwrap_or_default();
        if finished.len() != header.message_len as usize {
            return Err(GattError::ReassemblyError(format!(
                "Expected {} bytes, got {}",
                header.message_len,
                finished.len()
            )));
        }
        Ok(ReassemblyProgress::Complete(finished))
    }

    pub fn reset(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_characteristic_uuid() {
        assert_eq!(
            MESSAGE_CHARACTERISTIC_UUID.to_string(),
            "34b1cf4d-1069-4ad6-89b6-e161d79be4d8"
        );
    }

    #[test]
    fn test_header_is_big_endian() {
        let header = GattFragmentHeader::new(0x0102_0304, 1, 2).unwrap();
        assert_eq!(header.to_bytes(), [1, 2, 3, 4, 0, 1, 0, 2]);
        assert_eq!(GattFragmentHeader::from_bytes(&header.to_bytes()).unwrap(), header);
    }

    #[test]
    fn test_header_rejects_bad_index() {
        assert!(GattFragmentHeader::new(10, 2, 2).is_err());
        assert!(GattFragmentHeader::new(10, 0, 0).is_err());
        assert!(GattFragmentHeader::from_bytes(&[0, 0, 0]).is_err());
    }

    #[test]
    fn test_fragmenter_bounds() {
        assert!(GattFragmenter::new(8).is_err());
        assert!(GattFragmenter::new(513).is_err());
        assert_eq!(GattFragmenter::new(20).unwrap().max_payload_per_write(), 12);
    }

    #[test]
    fn test_small_message_single_fragment() {
        let fragments = GattFragmenter::default().fragment(b"hello").unwrap();
        assert_eq!(fragments.len(), 1);
        assert_eq!(&fragments[0][GattFragmentHeader::HEADER_SIZE..], b"hello");
    }

    #[test]
    fn test_empty_message_single_fragment() {
        let fragments = GattFragmenter::default().fragment(b"").unwrap();
        assert_eq!(fragments.len(), 1);

        let mut reassembler = GattReassembler::new();
        assert_eq!(
            reassembler.push(&fragments[0]).unwrap(),
            ReassemblyProgress::Complete(Vec::new())
        );
    }

    #[test]
    fn test_reassembly_reports_progress() {
        let fragmenter = GattFragmenter::new(20).unwrap();
        let message = vec![0xAB; 30];
        let fragments = fragmenter.fragment(&message).unwrap();
        assert_eq!(fragments.len(), 3);

        let mut reassembler = GattReassembler::new();
        assert_eq!(
            reassembler.push(&fragments[0]).unwrap(),
            ReassemblyProgress::Partial {
                received_bytes: 12,
                total_bytes: 30
            }
        );
        assert_eq!(
            reassembler.push(&fragments[1]).unwrap(),
            ReassemblyProgress::Partial {
                received_bytes: 24,
                total_bytes: 30
            }
        );
        assert_eq!(
            reassembler.push(&fragments[2]).unwrap(),
            ReassemblyProgress::Complete(message)
        );
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_out_of_order_fragment_resets() {
        let fragmenter = GattFragmenter::new(20).unwrap();
        let fragments = fragmenter.fragment(&[7u8; 30]).unwrap();

        let mut reassembler = GattReassembler::new();
        reassembler.push(&fragments[0]).unwrap();
        assert!(reassembler.push(&fragments[2]).is_err());
        assert!(reassembler.is_idle());
    }

    #[test]
    fn test_continuation_without_start_is_rejected() {
        let fragmenter = GattFragmenter::new(20).unwrap();
        let fragments = fragmenter.fragment(&[1u8; 30]).unwrap();

        let mut reassembler = GattReassembler::new();
        assert!(reassembler.push(&fragments[1]).is_err());
    }

    #[test]
    fn test_new_message_replaces_partial() {
        let fragmenter = GattFragmenter::new(20).unwrap();
        let first = fragmenter.fragment(&[1u8; 30]).unwrap();
        let second = fragmenter.fragment(b"short").unwrap();

        let mut reassembler = GattReassembler::new();
        reassembler.push(&first[0]).unwrap();
        assert_eq!(
            reassembler.push(&second[0]).unwrap(),
            ReassemblyProgress::Complete(b"short".to_vec())
        );
    }
}
