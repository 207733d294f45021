//! Connection setup, supervision and teardown.
//!
//! ```text
//! Primary                         Secondary
//!   SNRM(src, dst, ca, params) ->
//!                              <- UA(src, dst, params)   | DM
//!   switch baud rate                switch baud rate
//!   RR(P, nr=0)              ->
//!                              <- RR(F)
//! ```
//!
//! The primary negotiates when the UA arrives, the secondary when the SNRM
//! arrives. Both sides answer at the contention rate and switch to the
//! negotiated rate afterwards.

use core::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::connection::{Connection, ConnectionState};
use crate::discovery::parse_xid;
use crate::error::Error;
use crate::frame::{ConnectionAddress, DeviceAddress, FrameHeader, FrameKind, SnrmFrame, UaFrame};
use crate::hal::{Phy, RandomSource, TimerHal};
use crate::negotiation::{
    NEGOTIATION_PARAMS_MAX_LEN, NegotiationParams, NegotiationValues, merge, populate_params,
    translate_params_to_values, translate_values_to_params, update_params,
};
use crate::station::{
    DisconnectReason, Dispatch, Station, StationHandler, StationMode, StationResult, StationRole, TimerEvent,
};
use crate::timer::TimerHandle;

/// Link properties the user asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectRequestQos {
    pub baud_rate: u32,
    pub max_turn_around_time_ms: u16,
    pub disconnect_threshold_s: u8,
    pub data_size: u16,
}

impl Default for ConnectRequestQos {
    fn default() -> Self {
        Self { baud_rate: 115200, max_turn_around_time_ms: 500, disconnect_threshold_s: 40, data_size: 2048 }
    }
}

/// Link properties agreed with the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectResponseQos {
    pub baud_rate: u32,
    pub data_size: u16,
    pub disconnect_threshold_s: u8,
}

impl From<&NegotiationValues> for ConnectResponseQos {
    fn from(values: &NegotiationValues) -> Self {
        Self {
            baud_rate: values.baud_rate,
            data_size: values.data_size,
            disconnect_threshold_s: values.disconnect_threshold_s,
        }
    }
}

/// Connect request waiting for the target to show up.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingConnect {
    target: DeviceAddress,
    qos: ConnectRequestQos,
}

/// Merges both proposals and resolves the values of each side. The
/// connection is only updated when everything succeeds.
fn negotiate(connection: &mut Connection, remote_params: &NegotiationParams) -> Result<(), Error> {
    let mut local = connection.local_params;
    let mut remote = *remote_params;
    merge(&mut local, &mut remote)?;
    let local_values = translate_params_to_values(&local)?;
    let remote_values = translate_params_to_values(&remote)?;

    connection.local_params = local;
    connection.local_values = local_values;
    connection.remote_values = remote_values;
    connection.state = ConnectionState::Negotiated;
    Ok(())
}

/// Peer parameters: IrLAP defaults overridden by the received records.
fn remote_params(records: &[u8]) -> Result<NegotiationParams, Error> {
    let mut params = NegotiationParams::irlap_defaults();
    update_params(&mut params, records)?;
    Ok(params)
}

impl<P: Phy, T: TimerHal, R: RandomSource, U: StationHandler> Station<P, T, R, U> {
    /// Waits for the sniffing station `target` to announce itself, then
    /// connects to it. The outcome is delivered through
    /// [`StationHandler::connect_confirm`] or
    /// [`StationHandler::disconnect_indication`].
    pub fn connect_request(&mut self, target: DeviceAddress, qos: ConnectRequestQos) -> StationResult<(), P::Error> {
        if self.mode != StationMode::Ndm {
            warn!("Station is not in NDM, can't connect");
            return Err(Error::StationState(self.mode).into());
        }
        if !target.is_unicast() {
            return Err(Error::Address.into());
        }
        debug!("Waiting for {} to connect", target);
        self.mode = StationMode::Sconn;
        self.pending_connect = Some(PendingConnect { target, qos });
        Ok(())
    }

    /// Our proposal, limited by the settings, the transceiver and `qos`.
    fn local_proposal(&self, qos: Option<&ConnectRequestQos>) -> NegotiationParams {
        let mut values = self.settings.negotiation;
        if let Some(qos) = qos {
            values.baud_rate = values.baud_rate.min(qos.baud_rate);
            values.max_turn_around_time_ms = values.max_turn_around_time_ms.min(qos.max_turn_around_time_ms);
            values.disconnect_threshold_s = values.disconnect_threshold_s.min(qos.disconnect_threshold_s);
            values.data_size = values.data_size.min(qos.data_size);
        }
        translate_values_to_params(&values, self.phy.supported_baudrates())
    }

    fn arm_p_timer(&mut self, address: ConnectionAddress) -> StationResult<(), P::Error> {
        let Some(connection) = self.connections.get(address) else {
            return Err(Error::NoConnection.into());
        };
        let timeout = if connection.is_negotiated() {
            Duration::from_millis(connection.local_values.max_turn_around_time_ms as u64)
        } else {
            self.settings.p_timeout
        };
        let handle = self.timers.set_timer(timeout, TimerEvent::PTimer(address))?;
        if let Some(connection) = self.connections.get_mut(address) {
            connection.p_timer = Some(handle);
        }
        Ok(())
    }

    fn stop_p_timer(&mut self, address: ConnectionAddress) {
        if let Some(handle) = self.connections.get_mut(address).and_then(|connection| connection.p_timer.take()) {
            let _ = self.timers.clear_timer(handle);
        }
    }

    /// Frees a connection and returns to the contention state.
    fn release_connection(&mut self, address: ConnectionAddress) {
        self.stop_p_timer(address);
        self.connections.free(address);
        if self.connections.is_empty() {
            self.mode = StationMode::Ndm;
            self.role = StationRole::None;
            if let Err(err) = self.set_baud_rate(self.settings.contention_baud_rate) {
                error!("Failed to restore contention baud rate: {}", err);
            }
        }
        debug!("Connection {} released", address.value());
    }

    fn drop_connection(&mut self, address: ConnectionAddress, reason: DisconnectReason) {
        self.release_connection(address);
        self.handler.disconnect_indication(address, reason);
    }

    /// Sends a frame on an established connection: negotiated baud rate and
    /// the start markers the peer asked for.
    fn send_link_frame(
        &mut self,
        address: ConnectionAddress,
        header: &FrameHeader,
        fragments: &[&[u8]],
    ) -> StationResult<(), P::Error> {
        let additional_bofs = self
            .connections
            .get(address)
            .map_or(0, |connection| connection.remote_values.additional_bofs as usize);
        self.send_frame(header, fragments, additional_bofs)
    }

    /// A sniffing station announced itself while we wait to connect to it.
    pub(crate) fn on_sniff_xid(&mut self, _header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        if self.mode != StationMode::Sconn {
            return Ok(Dispatch::NotHandled);
        }
        let Some(pending) = self.pending_connect else {
            return Ok(Dispatch::NotHandled);
        };
        let xid = parse_xid(payload)?;
        if xid.source != pending.target {
            debug!("Ignoring XID from unexpected address {}", xid.source);
            return Ok(Dispatch::NotHandled);
        }

        let params = self.local_proposal(Some(&pending.qos));
        let address = self.connections.allocate(&mut self.rng, pending.target, params)?.address;
        if let Err(err) = self.send_snrm(address).and_then(|()| self.arm_p_timer(address)) {
            error!("Failed to start connection setup: {}", err);
            self.stop_p_timer(address);
            self.connections.free(address);
            return Err(err);
        }

        self.pending_connect = None;
        self.mode = StationMode::Ssetup;
        Ok(Dispatch::Handled)
    }

    fn send_snrm(&mut self, address: ConnectionAddress) -> StationResult<(), P::Error> {
        let Some(connection) = self.connections.get(address) else {
            return Err(Error::NoConnection.into());
        };
        let mut records = [0u8; NEGOTIATION_PARAMS_MAX_LEN];
        let len = populate_params(&mut records, &connection.local_params)?;
        let snrm = SnrmFrame {
            source: self.address,
            destination: connection.remote,
            connection_address: address,
            params: &records[..len],
        };
        let header = FrameHeader::command(ConnectionAddress::BROADCAST, FrameKind::Snrm.control(true));
        debug!("Sending SNRM to {} on connection {}", snrm.destination, address.value());
        self.send_contention_frame(&header, &[snrm.encode().as_slice()])
    }

    /// The peer accepted our SNRM.
    pub(crate) fn on_ua_response(&mut self, header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        let address = header.address;
        let Some(connection) = self.connections.get_mut(address) else {
            debug!("Ignoring UA outside a connection");
            return Err(Error::NoConnection.into());
        };
        if self.mode != StationMode::Ssetup {
            return Err(Error::StationState(self.mode).into());
        }

        let (_, ua) = UaFrame::parse(payload).map_err(|_| Error::MalformedFrame)?;
        if ua.source != connection.remote {
            warn!("UA from {} while connecting to {}", ua.source, connection.remote);
            return Err(Error::Address.into());
        }
        let params = remote_params(ua.params)?;
        if let Err(err) = negotiate(connection, &params) {
            warn!("Failed to negotiate connection parameters: {}", err);
            return Err(err.into());
        }
        let local_values = connection.local_values;
        let qos = ConnectResponseQos::from(&connection.remote_values);

        let rr = FrameHeader::command(address, FrameKind::Rr.supervisory_control(0, true));
        let polled = self
            .set_baud_rate(local_values.baud_rate)
            .and_then(|()| self.send_link_frame(address, &rr, &[]));
        if let Err(err) = polled {
            error!("Failed to poll new connection {}: {}", address.value(), err);
            self.drop_connection(address, DisconnectReason::SetupFailed);
            return Err(err);
        }

        self.stop_p_timer(address);
        self.role = StationRole::Primary;
        self.mode = StationMode::Nrm;
        if let Err(err) = self.arm_p_timer(address) {
            error!("Failed to supervise connection {}: {}", address.value(), err);
            self.drop_connection(address, DisconnectReason::SetupFailed);
            return Err(err);
        }
        debug!("Connected as primary at {} baud", local_values.baud_rate);
        self.handler.connect_confirm(address, &qos);
        Ok(Dispatch::Handled)
    }

    /// The peer refused our SNRM.
    pub(crate) fn on_dm_response(&mut self, header: &FrameHeader, _payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        if !self.connections.contains(header.address) {
            debug!("Ignoring DM outside a connection");
            return Err(Error::NoConnection.into());
        }
        if self.mode != StationMode::Ssetup {
            return Err(Error::StationState(self.mode).into());
        }
        debug!("Connection {} refused", header.address.value());
        self.drop_connection(header.address, DisconnectReason::Refused);
        Ok(Dispatch::Handled)
    }

    /// A primary asks us to connect.
    pub(crate) fn on_snrm_command(&mut self, _header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        let (_, snrm) = SnrmFrame::parse(payload).map_err(|_| Error::MalformedFrame)?;
        if snrm.destination != self.address {
            trace!("Ignoring SNRM for {}", snrm.destination);
            return Ok(Dispatch::Handled);
        }
        if self.mode != StationMode::Ndm {
            return Err(Error::StationState(self.mode).into());
        }
        let address = snrm.connection_address;
        if !address.is_assignable() {
            return Err(Error::Address.into());
        }

        let mut connection = Connection::new(address, snrm.source, self.local_proposal(None));
        let negotiated = remote_params(snrm.params).and_then(|params| negotiate(&mut connection, &params));
        if let Err(err) = negotiated {
            warn!("Refusing connection from {}: {}", snrm.source, err);
            let dm = FrameHeader::response(address, FrameKind::Dm.control(true));
            self.send_contention_frame(&dm, &[])?;
            return Ok(Dispatch::Handled);
        }

        let mut records = [0u8; NEGOTIATION_PARAMS_MAX_LEN];
        let len = populate_params(&mut records, &connection.local_params)?;
        let ua = UaFrame { source: self.address, destination: snrm.source, params: &records[..len] };
        let header = FrameHeader::response(address, FrameKind::Ua.control(true));
        self.send_contention_frame(&header, &[ua.encode().as_slice()])?;

        let qos = ConnectResponseQos::from(&connection.remote_values);
        let baud_rate = connection.local_values.baud_rate;
        self.connections.insert(connection)?;
        self.set_baud_rate(baud_rate)?;
        self.role = StationRole::Secondary;
        self.mode = StationMode::Nrm;
        debug!("Connected as secondary to {} at {} baud", snrm.source, baud_rate);
        self.handler.connect_indication(address, snrm.source, &qos);
        Ok(Dispatch::Handled)
    }

    pub(crate) fn on_p_timeout(&mut self, handle: TimerHandle, address: ConnectionAddress) -> StationResult<(), P::Error> {
        let Some(connection) = self.connections.get_mut(address) else {
            return Ok(());
        };
        if connection.p_timer != Some(handle) {
            trace!("Ignoring stale P timer");
            return Ok(());
        }
        connection.p_timer = None;

        match self.mode {
            StationMode::Ssetup => {
                debug!("No answer to SNRM on connection {}", address.value());
                self.drop_connection(address, DisconnectReason::SetupTimeout);
                Ok(())
            }
            StationMode::Nrm if self.role == StationRole::Primary => {
                connection.missed_polls += 1;
                let silent_ms = connection.missed_polls * connection.local_values.max_turn_around_time_ms as u32;
                if silent_ms >= connection.remote_values.disconnect_threshold_s as u32 * 1000 {
                    warn!("Connection {} lost after {} ms of silence", address.value(), silent_ms);
                    self.drop_connection(address, DisconnectReason::LinkTimeout);
                    return Ok(());
                }
                let rr = FrameHeader::command(address, FrameKind::Rr.supervisory_control(0, true));
                self.send_link_frame(address, &rr, &[])?;
                self.arm_p_timer(address)
            }
            _ => Ok(()),
        }
    }

    /// Poll from the primary.
    pub(crate) fn on_rr_command(&mut self, header: &FrameHeader, _payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        if self.mode != StationMode::Nrm || self.role != StationRole::Secondary {
            return Err(Error::StationState(self.mode).into());
        }
        if !header.poll_final() {
            return Ok(Dispatch::Handled);
        }
        let rr = FrameHeader::response(header.address, FrameKind::Rr.supervisory_control(0, true));
        self.send_link_frame(header.address, &rr, &[])?;
        Ok(Dispatch::Handled)
    }

    /// Answer from the secondary.
    pub(crate) fn on_rr_response(&mut self, header: &FrameHeader, _payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        if self.mode != StationMode::Nrm || self.role != StationRole::Primary {
            return Err(Error::StationState(self.mode).into());
        }
        if let Some(connection) = self.connections.get_mut(header.address) {
            connection.missed_polls = 0;
        }
        Ok(Dispatch::Handled)
    }

    /// Closes a connection: sends DISC and tears the link down locally.
    pub fn disconnect_request(&mut self, address: ConnectionAddress) -> StationResult<(), P::Error> {
        if !self.connections.contains(address) {
            return Err(Error::NoConnection.into());
        }
        if self.mode != StationMode::Nrm {
            return Err(Error::StationState(self.mode).into());
        }
        let disc = FrameHeader::command(address, FrameKind::Disc.control(true));
        let sent = self.send_link_frame(address, &disc, &[]);
        self.release_connection(address);
        sent
    }

    /// The peer closes the connection.
    pub(crate) fn on_disc_command(&mut self, header: &FrameHeader, _payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        let address = header.address;
        let Some(connection) = self.connections.get(address) else {
            return Err(Error::NoConnection.into());
        };
        if self.mode != StationMode::Nrm {
            return Err(Error::StationState(self.mode).into());
        }
        let ua = UaFrame { source: self.address, destination: connection.remote, params: &[] };
        let reply = FrameHeader::response(address, FrameKind::Ua.control(true));
        let sent = self.send_link_frame(address, &reply, &[ua.encode().as_slice()]);
        debug!("Connection {} closed by peer", address.value());
        self.drop_connection(address, DisconnectReason::Remote);
        sent.map(|()| Dispatch::Handled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StationError;
    use crate::frame::{SlotCount, XidFrame};
    use crate::negotiation::{BAUD_RATE_9600, BAUD_RATE_115200};
    use crate::station::tests::{Harness, OWN_ADDRESS, PEER_ADDRESS};
    use crate::testing::Indication;
    use alloc::vec;
    use alloc::vec::Vec;

    fn sniff_xid(source: DeviceAddress) -> (FrameHeader, Vec<u8>) {
        let xid = XidFrame::new(source, DeviceAddress::BROADCAST, SlotCount::One, 0);
        let header = FrameHeader::response(ConnectionAddress::BROADCAST, FrameKind::XidResponse.control(true));
        (header, xid.encode())
    }

    fn ua_payload(params: &NegotiationParams) -> Vec<u8> {
        let mut records = [0u8; NEGOTIATION_PARAMS_MAX_LEN];
        let len = populate_params(&mut records, params).unwrap();
        UaFrame { source: PEER_ADDRESS, destination: OWN_ADDRESS, params: &records[..len] }.encode()
    }

    fn peer_params() -> NegotiationParams {
        NegotiationParams {
            baud_rate: BAUD_RATE_9600 | BAUD_RATE_115200,
            max_turn_around_time: 0x01,
            data_size: 0x07,
            window_size: 0x01,
            additional_bofs: 0x80,
            min_turn_around_time: 0x04,
            disconnect_threshold: 0x01,
        }
    }

    /// Runs the primary side up to SSETUP, returning the connection address.
    fn setup(harness: &mut Harness) -> ConnectionAddress {
        harness.station.connect_request(PEER_ADDRESS, ConnectRequestQos::default()).unwrap();
        let (header, payload) = sniff_xid(PEER_ADDRESS);
        harness.deliver(header, &payload);
        assert_eq!(harness.station.mode(), StationMode::Ssetup);
        harness.station.connections().iter().next().unwrap().address
    }

    fn connect(harness: &mut Harness) -> ConnectionAddress {
        let address = setup(harness);
        harness.deliver(FrameHeader::response(address, FrameKind::Ua.control(true)), &ua_payload(&peer_params()));
        assert_eq!(harness.station.mode(), StationMode::Nrm);
        harness.phy.take_sent();
        harness.handler.take();
        address
    }

    #[test]
    fn test_connect_request_requires_ndm() {
        let mut harness = Harness::new();
        harness.station.connect_request(PEER_ADDRESS, ConnectRequestQos::default()).unwrap();
        assert_eq!(harness.station.mode(), StationMode::Sconn);
        assert!(matches!(
            harness.station.connect_request(PEER_ADDRESS, ConnectRequestQos::default()),
            Err(StationError::Link(Error::StationState(StationMode::Sconn)))
        ));
    }

    #[test]
    fn test_connect_request_rejects_broadcast_target() {
        let mut harness = Harness::new();
        assert!(matches!(
            harness.station.connect_request(DeviceAddress::BROADCAST, ConnectRequestQos::default()),
            Err(StationError::Link(Error::Address))
        ));
        assert_eq!(harness.station.mode(), StationMode::Ndm);
    }

    #[test]
    fn test_sniff_xid_from_target_sends_snrm() {
        let mut harness = Harness::new();
        let address = setup(&mut harness);
        assert!(address.is_assignable());

        let sent = harness.phy.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].baud_rate, 9600);
        let raw = sent[0].unwrapped();
        let (payload, header) = FrameHeader::parse(&raw).unwrap();
        assert!(header.command);
        assert!(header.poll_final());
        assert!(header.address.is_broadcast());
        assert_eq!(header.kind(), Some(FrameKind::Snrm));

        let (_, snrm) = SnrmFrame::parse(payload).unwrap();
        assert_eq!(snrm.source, OWN_ADDRESS);
        assert_eq!(snrm.destination, PEER_ADDRESS);
        assert_eq!(snrm.connection_address, address);
        let mut proposal = NegotiationParams::default();
        update_params(&mut proposal, snrm.params).unwrap();
        // Limited to what the transceiver supports
        assert_eq!(proposal.baud_rate, BAUD_RATE_9600 | BAUD_RATE_115200);
        assert_eq!(harness.clock.alarm_delay(), Some(500_000));
    }

    #[test]
    fn test_sniff_xid_from_other_station_is_ignored() {
        let mut harness = Harness::new();
        harness.station.connect_request(PEER_ADDRESS, ConnectRequestQos::default()).unwrap();
        let (header, payload) = sniff_xid(DeviceAddress(0x0BAD_CAFE));
        harness.deliver(header, &payload);
        assert_eq!(harness.station.mode(), StationMode::Sconn);
        assert!(harness.station.connections().is_empty());
        assert!(harness.phy.sent().is_empty());
    }

    #[test]
    fn test_invalid_sniff_xid_does_not_connect() {
        let mut harness = Harness::new();
        harness.station.connect_request(PEER_ADDRESS, ConnectRequestQos::default()).unwrap();
        let (header, mut payload) = sniff_xid(PEER_ADDRESS);
        // Unknown format id
        payload[0] = 0x02;
        harness.deliver(header, &payload);
        assert_eq!(harness.station.mode(), StationMode::Sconn);
        assert!(harness.station.connections().is_empty());
        assert!(harness.phy.sent().is_empty());

        let (header, payload) = sniff_xid(PEER_ADDRESS);
        harness.deliver(header, &payload);
        assert_eq!(harness.station.mode(), StationMode::Ssetup);
    }

    #[test]
    fn test_ua_completes_connection() {
        let mut harness = Harness::new();
        let address = setup(&mut harness);
        harness.phy.take_sent();

        harness.deliver(FrameHeader::response(address, FrameKind::Ua.control(true)), &ua_payload(&peer_params()));
        assert_eq!(harness.station.mode(), StationMode::Nrm);
        assert_eq!(harness.station.role(), StationRole::Primary);
        assert_eq!(harness.station.baud_rate(), 115200);

        let sent = harness.phy.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].baud_rate, 115200);
        let raw = sent[0].unwrapped();
        let (payload, header) = FrameHeader::parse(&raw).unwrap();
        assert!(payload.is_empty());
        assert_eq!(header.address, address);
        assert!(header.command);
        assert_eq!(header.kind(), Some(FrameKind::Rr));
        assert_eq!(header.nr(), 0);
        assert!(header.poll_final());

        let qos = ConnectResponseQos { baud_rate: 115200, data_size: 256, disconnect_threshold_s: 3 };
        assert_eq!(harness.handler.take(), vec![Indication::ConnectConfirm(address, qos)]);

        let connection = harness.station.connections().get(address).unwrap();
        assert!(connection.is_negotiated());
        assert_eq!(connection.local_values.baud_rate, 115200);
        // Steady-state P timer runs on the negotiated max turn-around time
        assert!(connection.p_timer.is_some());
        assert_eq!(harness.clock.alarm_delay(), Some(500_000));
    }

    #[test]
    fn test_failed_first_poll_returns_to_ndm() {
        let mut harness = Harness::new();
        let address = setup(&mut harness);
        harness.phy.take_sent();

        harness.phy.fail_tx(true);
        harness.deliver(FrameHeader::response(address, FrameKind::Ua.control(true)), &ua_payload(&peer_params()));
        harness.phy.fail_tx(false);

        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert_eq!(harness.station.role(), StationRole::None);
        assert_eq!(harness.station.baud_rate(), 9600);
        assert!(harness.station.connections().is_empty());
        assert!(!harness.clock.alarm_is_set());
        assert_eq!(harness.handler.take(), vec![Indication::Disconnect(address, DisconnectReason::SetupFailed)]);

        // Nothing is left running
        harness.advance_ms(10_000);
        assert!(harness.handler.is_empty());
        assert_eq!(harness.station.mode(), StationMode::Ndm);
    }

    #[test]
    fn test_ua_without_common_baud_rate_keeps_setup() {
        let mut harness = Harness::new();
        let address = setup(&mut harness);
        harness.phy.take_sent();

        let mut params = peer_params();
        params.baud_rate = crate::negotiation::BAUD_RATE_57600;
        harness.deliver(FrameHeader::response(address, FrameKind::Ua.control(true)), &ua_payload(&params));
        assert_eq!(harness.station.mode(), StationMode::Ssetup);
        assert!(harness.phy.sent().is_empty());
        assert!(harness.handler.is_empty());

        // The P timer still ends the attempt
        harness.advance_ms(500);
        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert_eq!(harness.handler.take(), vec![Indication::Disconnect(address, DisconnectReason::SetupTimeout)]);
    }

    #[test]
    fn test_dm_refuses_connection() {
        let mut harness = Harness::new();
        let address = setup(&mut harness);
        harness.deliver(FrameHeader::response(address, FrameKind::Dm.control(true)), &[]);
        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert!(harness.station.connections().is_empty());
        assert_eq!(harness.handler.take(), vec![Indication::Disconnect(address, DisconnectReason::Refused)]);
        assert!(!harness.clock.alarm_is_set());
    }

    #[test]
    fn test_snrm_timeout() {
        let mut harness = Harness::new();
        let address = setup(&mut harness);
        harness.advance_ms(499);
        assert_eq!(harness.station.mode(), StationMode::Ssetup);
        harness.advance_ms(1);
        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert!(harness.station.connections().is_empty());
        assert_eq!(harness.handler.take(), vec![Indication::Disconnect(address, DisconnectReason::SetupTimeout)]);
    }

    #[test]
    fn test_ua_outside_setup_is_rejected() {
        let mut harness = Harness::new();
        let address = connect(&mut harness);
        harness.deliver(FrameHeader::response(address, FrameKind::Ua.control(true)), &ua_payload(&peer_params()));
        assert_eq!(harness.station.mode(), StationMode::Nrm);
        assert!(harness.phy.sent().is_empty());
        assert!(harness.handler.is_empty());
    }

    #[test]
    fn test_broadcast_ua_has_no_connection() {
        let mut harness = Harness::new();
        setup(&mut harness);
        harness.deliver(
            FrameHeader::response(ConnectionAddress::BROADCAST, FrameKind::Ua.control(true)),
            &ua_payload(&peer_params()),
        );
        assert_eq!(harness.station.mode(), StationMode::Ssetup);
    }

    #[test]
    fn test_primary_polls_and_drops_silent_link() {
        let mut harness = Harness::new();
        let address = connect(&mut harness);

        // Disconnect threshold 3 s at 500 ms per poll
        for _ in 0..5 {
            harness.advance_ms(500);
        }
        let polls = harness.phy.take_sent();
        assert_eq!(polls.len(), 5);
        assert!(polls.iter().all(|frame| frame.baud_rate == 115200));
        assert_eq!(harness.station.mode(), StationMode::Nrm);

        harness.advance_ms(500);
        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert_eq!(harness.station.role(), StationRole::None);
        assert_eq!(harness.station.baud_rate(), 9600);
        assert_eq!(harness.handler.take(), vec![Indication::Disconnect(address, DisconnectReason::LinkTimeout)]);
    }

    #[test]
    fn test_rr_response_keeps_link_alive() {
        let mut harness = Harness::new();
        let address = connect(&mut harness);
        for _ in 0..20 {
            harness.advance_ms(500);
            harness.deliver(FrameHeader::response(address, FrameKind::Rr.supervisory_control(0, true)), &[]);
        }
        assert_eq!(harness.station.mode(), StationMode::Nrm);
        assert!(harness.handler.is_empty());
    }

    #[test]
    fn test_disconnect_request_sends_disc() {
        let mut harness = Harness::new();
        let address = connect(&mut harness);
        harness.station.disconnect_request(address).unwrap();

        let sent = harness.phy.take_sent();
        let raw = sent[0].unwrapped();
        let (_, header) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.kind(), Some(FrameKind::Disc));
        assert_eq!(header.address, address);
        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert!(harness.station.connections().is_empty());
        assert!(!harness.clock.alarm_is_set());
        assert!(matches!(
            harness.station.disconnect_request(address),
            Err(StationError::Link(Error::NoConnection))
        ));
    }

    fn snrm_payload(address: ConnectionAddress, params: &NegotiationParams) -> Vec<u8> {
        let mut records = [0u8; NEGOTIATION_PARAMS_MAX_LEN];
        let len = populate_params(&mut records, params).unwrap();
        SnrmFrame { source: PEER_ADDRESS, destination: OWN_ADDRESS, connection_address: address, params: &records[..len] }
            .encode()
    }

    fn snrm_header() -> FrameHeader {
        FrameHeader::command(ConnectionAddress::BROADCAST, FrameKind::Snrm.control(true))
    }

    #[test]
    fn test_snrm_accepted_as_secondary() {
        let mut harness = Harness::new();
        let address = ConnectionAddress::new(0x31).unwrap();
        harness.deliver(snrm_header(), &snrm_payload(address, &peer_params()));

        assert_eq!(harness.station.mode(), StationMode::Nrm);
        assert_eq!(harness.station.role(), StationRole::Secondary);
        assert_eq!(harness.station.baud_rate(), 115200);
        assert!(harness.station.connections().contains(address));

        let sent = harness.phy.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].baud_rate, 9600);
        let raw = sent[0].unwrapped();
        let (payload, header) = FrameHeader::parse(&raw).unwrap();
        assert!(!header.command);
        assert_eq!(header.address, address);
        assert_eq!(header.kind(), Some(FrameKind::Ua));
        let (_, ua) = UaFrame::parse(payload).unwrap();
        assert_eq!(ua.source, OWN_ADDRESS);
        assert_eq!(ua.destination, PEER_ADDRESS);
        let mut answer = NegotiationParams::default();
        update_params(&mut answer, ua.params).unwrap();
        assert_eq!(answer.baud_rate, BAUD_RATE_115200);

        let qos = ConnectResponseQos { baud_rate: 115200, data_size: 256, disconnect_threshold_s: 3 };
        assert_eq!(harness.handler.take(), vec![Indication::Connect(address, PEER_ADDRESS, qos)]);
    }

    #[test]
    fn test_snrm_without_common_parameters_is_answered_with_dm() {
        let mut harness = Harness::new();
        let address = ConnectionAddress::new(0x31).unwrap();
        let mut params = peer_params();
        // Beyond what the transceiver supports
        params.baud_rate = crate::negotiation::BAUD_RATE_4000000;
        harness.deliver(snrm_header(), &snrm_payload(address, &params));

        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert!(harness.station.connections().is_empty());
        let sent = harness.phy.take_sent();
        let raw = sent[0].unwrapped();
        let (_, header) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.kind(), Some(FrameKind::Dm));
        assert_eq!(header.address, address);
        assert!(harness.handler.is_empty());
    }

    #[test]
    fn test_snrm_for_other_station_is_ignored() {
        let mut harness = Harness::new();
        let address = ConnectionAddress::new(0x31).unwrap();
        let mut records = [0u8; NEGOTIATION_PARAMS_MAX_LEN];
        let len = populate_params(&mut records, &peer_params()).unwrap();
        let snrm = SnrmFrame {
            source: PEER_ADDRESS,
            destination: DeviceAddress(0x0BAD_CAFE),
            connection_address: address,
            params: &records[..len],
        };
        harness.deliver(snrm_header(), &snrm.encode());
        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert!(harness.phy.sent().is_empty());
    }

    #[test]
    fn test_secondary_answers_poll() {
        let mut harness = Harness::new();
        let address = ConnectionAddress::new(0x31).unwrap();
        harness.deliver(snrm_header(), &snrm_payload(address, &peer_params()));
        harness.phy.take_sent();

        harness.deliver(FrameHeader::command(address, FrameKind::Rr.supervisory_control(0, true)), &[]);
        let sent = harness.phy.take_sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].baud_rate, 115200);
        let raw = sent[0].unwrapped();
        let (_, header) = FrameHeader::parse(&raw).unwrap();
        assert!(!header.command);
        assert!(header.poll_final());
        assert_eq!(header.kind(), Some(FrameKind::Rr));
    }

    #[test]
    fn test_disc_from_peer_closes_link() {
        let mut harness = Harness::new();
        let address = ConnectionAddress::new(0x31).unwrap();
        harness.deliver(snrm_header(), &snrm_payload(address, &peer_params()));
        harness.phy.take_sent();
        harness.handler.take();

        harness.deliver(FrameHeader::command(address, FrameKind::Disc.control(true)), &[]);
        let sent = harness.phy.take_sent();
        let raw = sent[0].unwrapped();
        let (_, header) = FrameHeader::parse(&raw).unwrap();
        assert_eq!(header.kind(), Some(FrameKind::Ua));
        assert_eq!(sent[0].baud_rate, 115200);

        assert_eq!(harness.station.mode(), StationMode::Ndm);
        assert_eq!(harness.station.baud_rate(), 9600);
        assert_eq!(harness.handler.take(), vec![Indication::Disconnect(address, DisconnectReason::Remote)]);
    }
}
