//! Loopback test service: TEST commands are echoed back as TEST responses.

use tracing::{debug, trace};

use crate::error::Error;
use crate::frame::{ConnectionAddress, DeviceAddress, FrameHeader, FrameKind, MAX_DATA_SIZE, TEST_HEADER_SIZE, TestFrame};
use crate::hal::{Phy, RandomSource, TimerHal};
use crate::station::{Dispatch, Station, StationHandler, StationMode, StationResult};

impl<P: Phy, T: TimerHal, R: RandomSource, U: StationHandler> Station<P, T, R, U> {
    /// Sends a TEST command to `destination`. The echo is delivered through
    /// [`StationHandler::test_confirm`].
    pub fn test_request(&mut self, destination: DeviceAddress, data: &[u8]) -> StationResult<(), P::Error> {
        if self.mode != StationMode::Ndm {
            return Err(Error::StationState(self.mode).into());
        }
        if self.media_busy {
            return Err(Error::MediaBusy.into());
        }
        if data.len() + TEST_HEADER_SIZE > MAX_DATA_SIZE {
            return Err(Error::FrameTooLarge.into());
        }

        let test = TestFrame { source: self.address, destination, data };
        let header = FrameHeader::command(ConnectionAddress::BROADCAST, FrameKind::Test.control(true));
        debug!("Sending TEST to {}", destination);
        self.send_contention_frame(&header, &[test.header_bytes().as_slice(), data])
    }

    pub(crate) fn on_test_command(&mut self, header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        let (_, test) = TestFrame::parse(payload).map_err(|_| Error::MalformedFrame)?;
        if test.destination != self.address && !test.destination.is_broadcast() {
            trace!("Ignoring TEST for {}", test.destination);
            return Ok(Dispatch::Handled);
        }
        if self.mode != StationMode::Ndm {
            return Err(Error::StationState(self.mode).into());
        }

        let echo = TestFrame { source: self.address, destination: test.source, data: test.data };
        let reply = FrameHeader::response(header.address, FrameKind::Test.control(true));
        debug!("Echoing {} bytes to {}", test.data.len(), test.source);
        self.send_contention_frame(&reply, &[echo.header_bytes().as_slice(), test.data])?;
        Ok(Dispatch::Handled)
    }

    pub(crate) fn on_test_response(&mut self, _header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        let (_, test) = TestFrame::parse(payload).map_err(|_| Error::MalformedFrame)?;
        if test.destination != self.address {
            trace!("Ignoring TEST response for {}", test.destination);
            return Ok(Dispatch::Handled);
        }
        self.handler.test_confirm(test.source, test.data);
        Ok(Dispatch::Handled)
    }
}
