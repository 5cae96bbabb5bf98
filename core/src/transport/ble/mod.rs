/// BLE (Bluetooth Low Energy) Transport Module
///
/// Protocol-level pieces for the BLE side of the engine:
///
/// - **advertisement**: manufacturer payload encoding and mesh-membership classification
/// - **gatt**: message characteristic framing with fragmentation and reassembly
/// - **radio_lane**: serialized execution of BLE stack operations with per-command timeouts
/// - **scanner**: staged broad-then-filtered scan schedule
///
/// Platform code performs the actual radio work behind the adapter traits; everything
/// here is testable without BLE hardware.

pub mod advertisement;
pub mod gatt;
pub mod radio_lane;
pub mod scanner;

// Re-export commonly used types
pub use advertisement::{
    truncate_utf8, AdvertisementClassifier, AdvertisementRecord, ClassifiedAdvertisement,
    ClassifyError, DeviceFamily, ManufacturerPayload, MANUFACTURER_MAGIC, MAX_NAME_BYTES,
    PROTOCOL_VERSION,
};

pub use gatt::{
    GattError, GattFragmentHeader, GattFragmenter, GattReassembler, ReassemblyProgress,
    DEFAULT_WRITE_LEN, MAX_CHARACTERISTIC_SIZE, MESSAGE_CHARACTERISTIC_UUID,
};

pub use radio_lane::{RadioError, RadioLane, RadioLaneStats, RadioTicket, DEFAULT_COMMAND_TIMEOUT};

pub use scanner::{ScanSchedule, ScanStage, ScanStep, ScanStrategyConfig, ScannerError};
