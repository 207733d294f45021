//! Connectionless datagrams sent as broadcast UI commands.

use tracing::{debug, trace};

use crate::error::Error;
use crate::frame::{ConnectionAddress, FrameHeader, FrameKind};
use crate::hal::{Phy, RandomSource, TimerHal};
use crate::station::{Dispatch, Station, StationHandler, StationMode, StationResult, TimerEvent};

impl<P: Phy, T: TimerHal, R: RandomSource, U: StationHandler> Station<P, T, R, U> {
    /// Broadcasts `data` to every station in range.
    ///
    /// Only one datagram may be sent per unitdata interval.
    pub fn unitdata_request(&mut self, data: &[u8]) -> StationResult<(), P::Error> {
        let max = self.settings.unitdata_max_size;
        if data.len() > max {
            return Err(Error::UnitdataTooLong { len: data.len(), max }.into());
        }
        if self.mode != StationMode::Ndm {
            return Err(Error::StationState(self.mode).into());
        }
        if self.media_busy {
            debug!("Media busy, refusing unitdata");
            return Err(Error::MediaBusy.into());
        }
        if self.unitdata_timer.is_some() {
            return Err(Error::UnitdataTimeLimit.into());
        }

        let header = FrameHeader::command(ConnectionAddress::BROADCAST, FrameKind::Ui.control(true));
        self.send_contention_frame(&header, &[data])?;
        let handle = self.timers.set_timer(self.settings.unitdata_interval, TimerEvent::UnitdataInterval)?;
        self.unitdata_timer = Some(handle);
        trace!("Sent {} bytes of unitdata", data.len());
        Ok(())
    }

    pub(crate) fn on_ui_command(&mut self, header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        if !header.address.is_broadcast() {
            return Err(Error::NotImplemented.into());
        }
        trace!("Received {} bytes of unitdata", payload.len());
        self.handler.unitdata_indication(payload);
        Ok(Dispatch::Handled)
    }
}
