// Transport module: adapter traits, BLE protocol pieces, loopback medium

pub mod abstraction;
pub mod ble;
pub mod loopback;
pub mod session;

pub use abstraction::{
    AdapterEvent, AdapterEventSender, AdvertisementData, BleCentral, BleLinkRole, BlePeripheral,
    InvitationResponder, NativeHandle, PeripheralHandle, ScanRequest, SessionPeerHandle,
    SessionTransport, TransportError, TransportKind, Transports,
};
pub use ble::{
    AdvertisementClassifier, AdvertisementRecord, ClassifiedAdvertisement, ClassifyError,
    DeviceFamily, GattError, GattFragmenter, GattReassembler, ManufacturerPayload, RadioError,
    RadioLane, RadioLaneStats, ReassemblyProgress, ScanSchedule, ScanStage, ScanStep,
    ScanStrategyConfig, ScannerError, MESSAGE_CHARACTERISTIC_UUID,
};
pub use loopback::{LoopbackDevice, LoopbackMedium};
pub use session::{discovery_info, SessionFrame, DISCONNECT_REASON};
