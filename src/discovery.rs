//! Slotted XID discovery, as querying station and as replier.
//!
//! The querying station sends one XID command per slot, waits one slot time
//! after each and closes with a final command carrying its discovery info:
//!
//! ```text
//! Query   XID(0) ... XID(1) ... XID(n-1) ... XID(0xFF, info)
//! Reply          ^ picks a slot in [announced, n) and answers there
//! ```

use alloc::vec::Vec;

use heapless::Vec as HeaplessVec;
use tracing::{debug, trace, warn};

use crate::error::Error;
use crate::frame::{
    ConnectionAddress, DISCOVERY_INFO_MAX_LEN, DeviceAddress, FrameHeader, FrameKind, SlotCount, XID_FLAGS_NEW_ADDRESS,
    XID_SLOT_FINAL, XidFrame,
};
use crate::hal::{Phy, RandomSource, TimerHal};
use crate::station::{Dispatch, Station, StationHandler, StationMode, StationResult, TimerEvent};
use crate::timer::TimerHandle;

/// One discovered (or discovering) station.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveryLog {
    /// Found by our own query rather than by answering someone else's.
    pub solicited: bool,
    pub sniff: bool,
    pub address: DeviceAddress,
    pub version: u8,
    pub info: HeaplessVec<u8, DISCOVERY_INFO_MAX_LEN>,
}

impl DiscoveryLog {
    fn from_xid(xid: &XidFrame, solicited: bool) -> Self {
        Self {
            solicited,
            sniff: false,
            address: xid.source,
            version: xid.version,
            info: xid.discovery_info.clone(),
        }
    }
}

/// How a query ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryStatus {
    Complete,
    /// Two responders used the same device address.
    AddressConflict,
    /// Aborted because the media became busy.
    MediaBusy,
    /// Aborted because a frame could not be sent.
    TransmitFailed,
}

#[derive(Debug)]
pub(crate) struct QueryState {
    slots: SlotCount,
    slot: u8,
    info: HeaplessVec<u8, DISCOVERY_INFO_MAX_LEN>,
    target: DeviceAddress,
    new_address: bool,
    logs: Vec<DiscoveryLog>,
    conflict: bool,
    timer: Option<TimerHandle>,
}

#[derive(Debug)]
pub(crate) struct ReplyState {
    querier: DeviceAddress,
    reply_slot: u8,
    replied: bool,
    timer: Option<TimerHandle>,
    /// Address we answered to before the querier made us pick a new one.
    previous_address: Option<DeviceAddress>,
}

#[derive(Debug, Default)]
pub(crate) enum DiscoveryState {
    #[default]
    Idle,
    Query(QueryState),
    Reply(ReplyState),
}

/// Parses a discovery XID and checks format id, version and source.
pub(crate) fn parse_xid(payload: &[u8]) -> Result<XidFrame, Error> {
    XidFrame::parse(payload)
        .ok()
        .map(|(_, xid)| xid)
        .filter(XidFrame::is_valid)
        .ok_or(Error::MalformedFrame)
}

impl<P: Phy, T: TimerHal, R: RandomSource, U: StationHandler> Station<P, T, R, U> {
    /// Starts a discovery over `slots` slots (1, 6, 8 or 16).
    ///
    /// `info` is attached to the final XID command. The outcome is delivered
    /// through [`StationHandler::discovery_confirm`].
    pub fn discovery_request(&mut self, slots: u8, info: &[u8]) -> StationResult<(), P::Error> {
        let slots = SlotCount::from_count(slots).ok_or(Error::InvalidSlotCount(slots))?;
        let info = HeaplessVec::from_slice(info).map_err(|_| Error::DiscoveryInfoTooLong(info.len()))?;
        self.start_query(slots, info, DeviceAddress::BROADCAST, false)
    }

    /// Runs a query asking the station at `address` to pick a new device
    /// address.
    pub fn resolve_address_conflict(&mut self, slots: u8, address: DeviceAddress) -> StationResult<(), P::Error> {
        let slots = SlotCount::from_count(slots).ok_or(Error::InvalidSlotCount(slots))?;
        if !address.is_unicast() {
            return Err(Error::Address.into());
        }
        self.start_query(slots, HeaplessVec::new(), address, true)
    }

    fn start_query(
        &mut self,
        slots: SlotCount,
        info: HeaplessVec<u8, DISCOVERY_INFO_MAX_LEN>,
        target: DeviceAddress,
        new_address: bool,
    ) -> StationResult<(), P::Error> {
        if self.mode != StationMode::Ndm {
            return Err(Error::StationState(self.mode).into());
        }
        if self.media_busy {
            return Err(Error::MediaBusy.into());
        }

        debug!("Starting discovery over {} slots", slots.count());
        self.mode = StationMode::Query;
        self.discovery = DiscoveryState::Query(QueryState {
            slots,
            slot: 0,
            info,
            target,
            new_address,
            logs: Vec::new(),
            conflict: false,
            timer: None,
        });

        if let Err(err) = self.send_query_slot(0) {
            self.discovery = DiscoveryState::Idle;
            self.mode = StationMode::Ndm;
            return Err(err);
        }
        Ok(())
    }

    /// Sends the XID command of `slot` and, unless it is the final one,
    /// arms the slot timer.
    fn send_query_slot(&mut self, slot: u8) -> StationResult<(), P::Error> {
        let DiscoveryState::Query(query) = &self.discovery else {
            return Ok(());
        };
        let mut xid = XidFrame::new(self.address, query.target, query.slots, slot);
        if query.new_address {
            xid.flags |= XID_FLAGS_NEW_ADDRESS;
        }
        if slot == XID_SLOT_FINAL {
            xid.discovery_info = query.info.clone();
        }

        let header = FrameHeader::command(ConnectionAddress::BROADCAST, FrameKind::XidCommand.control(true));
        self.send_contention_frame(&header, &[xid.encode().as_slice()])?;
        trace!("Sent discovery slot {:#04x}", slot);

        if slot != XID_SLOT_FINAL {
            let handle = self.timers.set_timer(self.settings.slot_timeout, TimerEvent::Slot)?;
            if let DiscoveryState::Query(query) = &mut self.discovery {
                query.timer = Some(handle);
            }
        }
        Ok(())
    }

    pub(crate) fn on_slot_timeout(&mut self, handle: TimerHandle) -> StationResult<(), P::Error> {
        let DiscoveryState::Query(query) = &mut self.discovery else {
            return Ok(());
        };
        if self.mode != StationMode::Query || query.timer != Some(handle) {
            trace!("Ignoring stale slot timer");
            return Ok(());
        }

        query.timer = None;
        let next = query.slot + 1;
        if next < query.slots.count() {
            query.slot = next;
            if let Err(err) = self.send_query_slot(next) {
                self.finish_query(Some(DiscoveryStatus::TransmitFailed));
                return Err(err);
            }
            return Ok(());
        }

        let sent = self.send_query_slot(XID_SLOT_FINAL);
        let status = sent.as_ref().err().map(|_| DiscoveryStatus::TransmitFailed);
        self.finish_query(status);
        sent
    }

    /// Ends a running query and confirms it to the user.
    fn finish_query(&mut self, status: Option<DiscoveryStatus>) {
        let DiscoveryState::Query(query) = core::mem::take(&mut self.discovery) else {
            return;
        };
        if let Some(handle) = query.timer {
            let _ = self.timers.clear_timer(handle);
        }
        self.mode = StationMode::Ndm;

        let status = status.unwrap_or(if query.conflict {
            DiscoveryStatus::AddressConflict
        } else {
            DiscoveryStatus::Complete
        });
        debug!("Discovery finished ({:?}), {} stations found", status, query.logs.len());
        self.handler.discovery_confirm(&query.logs, status);
    }

    pub(crate) fn abort_query(&mut self, status: DiscoveryStatus) {
        if self.mode == StationMode::Query {
            self.finish_query(Some(status));
        }
    }

    /// Logs a station answering our query.
    pub(crate) fn on_xid_response(&mut self, _header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        if self.mode != StationMode::Query {
            return Ok(Dispatch::NotHandled);
        }
        let xid = parse_xid(payload)?;
        if xid.destination != self.address {
            trace!("Ignoring XID response for {}", xid.destination);
            return Ok(Dispatch::Handled);
        }

        let own_address = self.address;
        let DiscoveryState::Query(query) = &mut self.discovery else {
            return Ok(Dispatch::NotHandled);
        };
        if xid.source == own_address || query.logs.iter().any(|log| log.address == xid.source) {
            warn!("Address conflict on {}", xid.source);
            query.conflict = true;
        } else {
            debug!("Discovered {}", xid.source);
            query.logs.push(DiscoveryLog::from_xid(&xid, true));
        }
        Ok(Dispatch::Handled)
    }

    /// Takes part in someone else's discovery.
    pub(crate) fn on_xid_command(&mut self, _header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        match self.mode {
            StationMode::Ndm | StationMode::Reply => {}
            StationMode::Sconn => return Ok(Dispatch::NotHandled),
            mode => return Err(Error::StationState(mode).into()),
        }
        let xid = parse_xid(payload)?;
        let mut previous_address = match &self.discovery {
            DiscoveryState::Reply(reply) => reply.previous_address,
            _ => None,
        };
        let for_us = xid.destination.is_broadcast()
            || xid.destination == self.address
            || Some(xid.destination) == previous_address;
        if !for_us {
            trace!("Ignoring XID command for {}", xid.destination);
            return Ok(Dispatch::Handled);
        }
        if xid.new_address_requested() && xid.destination == self.address {
            previous_address = Some(self.address);
            self.regenerate_address()?;
            if let DiscoveryState::Reply(reply) = &mut self.discovery {
                reply.previous_address = previous_address;
            }
        }

        if xid.is_final() {
            self.on_final_xid(&xid)?;
            return Ok(Dispatch::Handled);
        }

        let total = xid.slot_count().count();
        if xid.slot >= total {
            return Err(Error::MalformedFrame.into());
        }

        if self.mode == StationMode::Ndm {
            let reply_slot = self.rng.random_u8(xid.slot, total).map_err(Error::from)?;
            let window = self.settings.slot_timeout * u32::from(total - xid.slot);
            let timer = self.timers.set_timer(window, TimerEvent::ReplyWindow)?;
            debug!("Answering discovery of {} in slot {}", xid.source, reply_slot);
            self.mode = StationMode::Reply;
            self.discovery = DiscoveryState::Reply(ReplyState {
                querier: xid.source,
                reply_slot,
                replied: false,
                timer: Some(timer),
                previous_address,
            });
        }

        let DiscoveryState::Reply(reply) = &self.discovery else {
            return Ok(Dispatch::Handled);
        };
        if !reply.replied && reply.querier == xid.source && xid.slot >= reply.reply_slot {
            self.send_xid_reply(xid.source, xid.slot_count(), xid.slot)?;
        }
        Ok(Dispatch::Handled)
    }

    fn on_final_xid(&mut self, xid: &XidFrame) -> StationResult<(), P::Error> {
        let mut sent = Ok(());
        if let DiscoveryState::Reply(reply) = core::mem::take(&mut self.discovery) {
            if !reply.replied && reply.querier == xid.source {
                sent = self.send_xid_reply(xid.source, xid.slot_count(), reply.reply_slot);
            }
            if let Some(handle) = reply.timer {
                let _ = self.timers.clear_timer(handle);
            }
        }
        self.mode = StationMode::Ndm;
        debug!("Discovered by {}", xid.source);
        self.handler.discovery_indication(&DiscoveryLog::from_xid(xid, false));
        sent
    }

    fn send_xid_reply(&mut self, querier: DeviceAddress, slots: SlotCount, slot: u8) -> StationResult<(), P::Error> {
        let mut xid = XidFrame::new(self.address, querier, slots, slot);
        xid.discovery_info = HeaplessVec::from_slice(&self.settings.discovery_info)
            .map_err(|_| Error::DiscoveryInfoTooLong(self.settings.discovery_info.len()))?;
        let header = FrameHeader::response(ConnectionAddress::BROADCAST, FrameKind::XidResponse.control(true));
        self.send_contention_frame(&header, &[xid.encode().as_slice()])?;
        if let DiscoveryState::Reply(reply) = &mut self.discovery {
            reply.replied = true;
        }
        Ok(())
    }

    pub(crate) fn on_reply_timeout(&mut self, handle: TimerHandle) {
        if let DiscoveryState::Reply(reply) = &self.discovery {
            if self.mode == StationMode::Reply && reply.timer == Some(handle) {
                debug!("Discovery reply window closed");
                self.discovery = DiscoveryState::Idle;
                self.mode = StationMode::Ndm;
            }
        }
    }
}
