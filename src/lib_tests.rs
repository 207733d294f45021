//! Two stations talking to each other over mock transceivers.

use alloc::vec;

use crate::config::StationSettings;
use crate::connect::ConnectRequestQos;
use crate::discovery::DiscoveryStatus;
use crate::frame::{ConnectionAddress, DeviceAddress, FrameHeader, FrameKind, SlotCount, XidFrame};
use crate::station::tests::{Harness, OWN_ADDRESS, PEER_ADDRESS};
use crate::station::{DisconnectReason, StationMode, StationRole};
use crate::testing::Indication;
use crate::wrapper::wrap_to_vec;

fn pair() -> (Harness, Harness) {
    let local = Harness::new();
    let remote = Harness::with_settings(StationSettings {
        device_address: Some(PEER_ADDRESS.0),
        discovery_info: b"remote".to_vec(),
        ..Default::default()
    });
    (local, remote)
}

/// Moves every transmitted frame to the other side until both are quiet.
fn exchange(a: &mut Harness, b: &mut Harness) {
    loop {
        let from_a = a.phy.take_sent();
        for frame in &from_a {
            b.station.receive(&frame.bytes);
        }
        let from_b = b.phy.take_sent();
        for frame in &from_b {
            a.station.receive(&frame.bytes);
        }
        if from_a.is_empty() && from_b.is_empty() {
            break;
        }
    }
}

#[test]
fn test_discovery_between_stations() {
    let (mut local, mut remote) = pair();
    local.station.discovery_request(6, b"local").unwrap();
    exchange(&mut local, &mut remote);
    assert_eq!(remote.station.mode(), StationMode::Reply);

    for _ in 0..6 {
        local.advance_ms(50);
        remote.advance_ms(50);
        exchange(&mut local, &mut remote);
    }

    let confirms = local.handler.take();
    let [Indication::DiscoveryConfirm(logs, DiscoveryStatus::Complete)] = confirms.as_slice() else {
        panic!("unexpected indications: {:?}", confirms);
    };
    assert_eq!(logs.len(), 1);
    assert_eq!(logs[0].address, PEER_ADDRESS);
    assert!(logs[0].solicited);
    assert_eq!(logs[0].info.as_slice(), b"remote");

    let indications = remote.handler.take();
    let [Indication::Discovery(log)] = indications.as_slice() else {
        panic!("unexpected indications: {:?}", indications);
    };
    assert_eq!(log.address, OWN_ADDRESS);
    assert_eq!(log.info.as_slice(), b"local");
    assert_eq!(remote.station.mode(), StationMode::Ndm);
    assert_eq!(local.station.mode(), StationMode::Ndm);
}

/// XID the remote sends while sniffing.
fn sniff_from(harness: &mut Harness, source: DeviceAddress) {
    let xid = XidFrame::new(source, DeviceAddress::BROADCAST, SlotCount::One, 0);
    let header = FrameHeader::response(ConnectionAddress::BROADCAST, FrameKind::XidResponse.control(true));
    let bytes = wrap_to_vec(&header, &[xid.encode().as_slice()], 10).unwrap();
    harness.station.receive(&bytes);
}

#[test]
fn test_connect_and_disconnect_between_stations() {
    let (mut local, mut remote) = pair();
    local.station.connect_request(PEER_ADDRESS, ConnectRequestQos::default()).unwrap();
    sniff_from(&mut local, PEER_ADDRESS);
    exchange(&mut local, &mut remote);

    assert_eq!(local.station.mode(), StationMode::Nrm);
    assert_eq!(local.station.role(), StationRole::Primary);
    assert_eq!(remote.station.mode(), StationMode::Nrm);
    assert_eq!(remote.station.role(), StationRole::Secondary);
    assert_eq!(local.station.baud_rate(), 115200);
    assert_eq!(remote.station.baud_rate(), 115200);

    let confirms = local.handler.take();
    let [Indication::ConnectConfirm(address, confirmed)] = confirms.as_slice() else {
        panic!("unexpected indications: {:?}", confirms);
    };
    let indications = remote.handler.take();
    let [Indication::Connect(remote_address, peer, indicated)] = indications.as_slice() else {
        panic!("unexpected indications: {:?}", indications);
    };
    assert_eq!(address, remote_address);
    assert_eq!(*peer, OWN_ADDRESS);
    assert_eq!(confirmed, indicated);
    assert_eq!(confirmed.baud_rate, 115200);
    assert_eq!(confirmed.disconnect_threshold_s, 40);

    // Polls are answered, the link stays up
    for _ in 0..10 {
        local.advance_ms(500);
        exchange(&mut local, &mut remote);
    }
    assert_eq!(local.station.mode(), StationMode::Nrm);
    assert!(local.handler.is_empty());

    local.station.disconnect_request(*address).unwrap();
    exchange(&mut local, &mut remote);
    assert_eq!(local.station.mode(), StationMode::Ndm);
    assert_eq!(remote.station.mode(), StationMode::Ndm);
    assert_eq!(remote.station.baud_rate(), 9600);
    assert_eq!(remote.handler.take(), vec![Indication::Disconnect(*address, DisconnectReason::Remote)]);
    assert!(local.handler.is_empty());
}

#[test]
fn test_unitdata_between_stations() {
    let (mut local, mut remote) = pair();
    local.station.unitdata_request(b"broadcast").unwrap();
    exchange(&mut local, &mut remote);
    assert_eq!(remote.handler.take(), vec![Indication::Unitdata(b"broadcast".to_vec())]);
}
