//! Discovery integration tests
//!
//! Drive engines over the loopback medium:
//! 1. BLE advertisement classification and link loss
//! 2. Session-protocol browsing
//! 3. Staged scan narrowing
//! 4. Silence after cleanup
//!
//! Run with: cargo test --test integration_discovery

mod common;

use common::*;
use nearby_multipeer_core::engine::ConnectionState;
use nearby_multipeer_core::transport::{
    AdvertisementRecord, ManufacturerPayload, PeripheralHandle, ScanRequest, ScanStage,
};
use nearby_multipeer_core::{
    parse_service_uuid, AdapterEvent, DeviceFamily, LoopbackMedium, NearbyEvent, TransportKind,
    DEFAULT_SERVICE_UUID,
};
use std::time::Duration;

fn record(peripheral: &str, manufacturer_data: Option<Vec<u8>>) -> AdvertisementRecord {
    AdvertisementRecord {
        peripheral: PeripheralHandle::new(peripheral),
        rssi: -60,
        local_name: None,
        service_uuids: vec![parse_service_uuid(DEFAULT_SERVICE_UUID).unwrap()],
        manufacturer_data,
    }
}

#[tokio::test(start_paused = true)]
async fn test_ble_endpoint_found_then_lost() {
    let medium = LoopbackMedium::new();
    let mut alpha = peer(&medium, "AA:01", "alpha");
    alpha.engine.initialize("svc1", None).await.unwrap();
    alpha.engine.start_discovery().await.unwrap();

    let payload = ManufacturerPayload::new(DeviceFamily::Android, Some("Pixel")).encode();
    medium.inject(
        "AA:01",
        AdapterEvent::AdvertisementObserved(record("P1", Some(payload.clone()))),
    );
    // Repeated advertisements from a known peripheral are not new endpoints
    medium.inject(
        "AA:01",
        AdapterEvent::AdvertisementObserved(record("P1", Some(payload))),
    );

    let event = alpha.expect("endpointFound P1", found("P1")).await;
    match event {
        NearbyEvent::EndpointFound(e) => {
            assert_eq!(e.endpoint_name, "Pixel");
            assert_eq!(e.service_id.as_deref(), Some("svc1"));
        }
        other => panic!("unexpected {}", other),
    }

    let endpoints = alpha.engine.endpoints().await.unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].transport, TransportKind::Ble);
    assert_eq!(endpoints[0].connection_state, ConnectionState::Discovered);
    assert_eq!(endpoints[0].device_family, Some(DeviceFamily::Android));

    medium.inject(
        "AA:01",
        AdapterEvent::PeripheralDisconnected {
            peripheral: PeripheralHandle::new("P1"),
            reason: Some("supervision timeout".to_string()),
        },
    );

    let events = alpha.collect(Duration::from_secs(1)).await;
    assert_eq!(count(&events, found("P1")), 0);
    assert_eq!(count(&events, lost("P1")), 1);
    assert!(alpha.engine.endpoints().await.unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_classifier_gates_endpoint_found() {
    let medium = LoopbackMedium::new();
    let mut alpha = peer(&medium, "AA:01", "alpha");
    alpha.engine.initialize("svc1", None).await.unwrap();
    alpha.engine.start_discovery().await.unwrap();

    for (peripheral, data) in [
        ("NOMAGIC", Some(vec![0x00, 0x00, 0x00])),
        ("NODATA", None),
        ("SHORT", Some(vec![0x4E, 0x4D, 0x50, 0x01])),
        ("IOS", Some(vec![0x4E, 0x4D, 0x50, 0x01, 0x02])),
    ] {
        medium.inject(
            "AA:01",
            AdapterEvent::AdvertisementObserved(record(peripheral, data)),
        );
    }

    let events = alpha.collect(Duration::from_secs(1)).await;
    assert_eq!(count(&events, found("NOMAGIC")), 0);
    assert_eq!(count(&events, found("NODATA")), 0);
    assert_eq!(count(&events, found("SHORT")), 0);
    assert_eq!(count(&events, found("IOS")), 1);

    let endpoints = alpha.engine.endpoints().await.unwrap();
    assert_eq!(endpoints.len(), 1);
    assert_eq!(endpoints[0].display_name, "Unknown");
    assert_eq!(endpoints[0].device_family, Some(DeviceFamily::Ios));
}

#[tokio::test(start_paused = true)]
async fn test_session_and_ble_discovery_are_independent() {
    let medium = LoopbackMedium::new();
    let alpha = peer(&medium, "AA:01", "alpha");
    let mut bravo = peer(&medium, "BB:02", "bravo");

    alpha.engine.initialize(SERVICE, None).await.unwrap();
    bravo.engine.initialize(SERVICE, None).await.unwrap();
    alpha.engine.start_advertising().await.unwrap();
    bravo.engine.start_discovery().await.unwrap();

    let session = bravo.expect("session endpointFound", found("alpha")).await;
    match session {
        NearbyEvent::EndpointFound(e) => assert_eq!(e.service_id.as_deref(), Some(SERVICE)),
        other => panic!("unexpected {}", other),
    }
    bravo.expect("BLE endpointFound", found("AA:01")).await;

    // Same device seen over both transports stays two endpoints
    let endpoints = bravo.engine.endpoints().await.unwrap();
    assert_eq!(endpoints.len(), 2);
    let transports: Vec<TransportKind> = endpoints.iter().map(|e| e.transport).collect();
    assert!(transports.contains(&TransportKind::SessionProtocol));
    assert!(transports.contains(&TransportKind::Ble));

    alpha.engine.stop_advertising().await.unwrap();
    bravo.expect("session endpointLost", lost("alpha")).await;
    let remaining = bravo.engine.endpoints().await.unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].endpoint_id, "AA:01");
}

#[tokio::test(start_paused = true)]
async fn test_staged_scan_narrows_to_service_filter() {
    let medium = LoopbackMedium::new();
    let alpha = peer(&medium, "AA:01", "alpha");
    alpha.engine.initialize(SERVICE, None).await.unwrap();
    alpha.engine.start_discovery().await.unwrap();

    assert_eq!(medium.scan_request("AA:01"), Some(ScanRequest::broad()));
    assert_eq!(
        alpha.engine.status().await.unwrap().scan_stage,
        ScanStage::WarmUp
    );

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(
        alpha.engine.status().await.unwrap().scan_stage,
        ScanStage::Extended
    );
    assert_eq!(medium.scan_request("AA:01"), Some(ScanRequest::broad()));

    tokio::time::sleep(Duration::from_secs(10)).await;
    let status = alpha.engine.status().await.unwrap();
    assert_eq!(status.scan_stage, ScanStage::Filtered);
    let uuid = parse_service_uuid(DEFAULT_SERVICE_UUID).unwrap();
    assert_eq!(medium.scan_request("AA:01"), Some(ScanRequest::filtered(uuid)));

    alpha.engine.stop_discovery().await.unwrap();
    assert_eq!(medium.scan_request("AA:01"), None);
    assert_eq!(
        alpha.engine.status().await.unwrap().scan_stage,
        ScanStage::Idle
    );
}

#[tokio::test(start_paused = true)]
async fn test_filtered_scan_still_finds_service_advertisers() {
    let medium = LoopbackMedium::new();
    let mut alpha = peer(&medium, "AA:01", "alpha");
    let bravo = peer(&medium, "BB:02", "bravo");
    alpha.engine.initialize(SERVICE, None).await.unwrap();
    bravo.engine.initialize(SERVICE, None).await.unwrap();

    alpha.engine.start_discovery().await.unwrap();
    tokio::time::sleep(Duration::from_secs(20)).await;
    assert_eq!(
        alpha.engine.status().await.unwrap().scan_stage,
        ScanStage::Filtered
    );

    bravo.engine.start_advertising().await.unwrap();
    alpha.expect("BLE endpointFound", found("BB:02")).await;
}

#[tokio::test(start_paused = true)]
async fn test_cleanup_empties_directory_and_silences_events() {
    let medium = LoopbackMedium::new();
    let mut alpha = peer(&medium, "AA:01", "alpha");
    let bravo = peer(&medium, "BB:02", "bravo");
    alpha.engine.initialize(SERVICE, None).await.unwrap();
    bravo.engine.initialize(SERVICE, None).await.unwrap();
    bravo.engine.start_advertising().await.unwrap();
    alpha.engine.start_discovery().await.unwrap();
    alpha.expect("endpointFound", found("bravo")).await;

    alpha.engine.cleanup().await.unwrap();
    // bravo may also have been found over BLE before cleanup ran
    let before = alpha.drain();
    assert!(
        before
            .iter()
            .all(|e| matches!(e, NearbyEvent::EndpointFound(_))),
        "unexpected events: {:?}",
        before
    );
    assert!(alpha.engine.endpoints().await.unwrap().is_empty());
    assert!(!medium.browsing("AA:01"));
    assert_eq!(medium.scan_request("AA:01"), None);

    // Stale scan windows fire and adapter events keep arriving
    let payload = ManufacturerPayload::new(DeviceFamily::Android, Some("late")).encode();
    medium.inject(
        "AA:01",
        AdapterEvent::AdvertisementObserved(record("LATE", Some(payload))),
    );
    bravo.engine.stop_advertising().await.unwrap();
    bravo.engine.start_advertising().await.unwrap();
    let events = alpha.collect(Duration::from_secs(40)).await;
    assert!(events.is_empty(), "events after cleanup: {:?}", events);

    alpha.engine.initialize(SERVICE, None).await.unwrap();
    alpha.engine.start_discovery().await.unwrap();
    alpha.expect("endpointFound after re-init", found("bravo")).await;
}

#[tokio::test(start_paused = true)]
async fn test_adapter_events_ignored_before_initialize() {
    let medium = LoopbackMedium::new();
    let mut alpha = peer(&medium, "AA:01", "alpha");

    let payload = ManufacturerPayload::new(DeviceFamily::Ios, None).encode();
    medium.inject(
        "AA:01",
        AdapterEvent::AdvertisementObserved(record("EARLY", Some(payload))),
    );
    let events = alpha.collect(Duration::from_secs(1)).await;
    assert!(events.is_empty());
}
