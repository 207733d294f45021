//! IrLAP station: mode machine, media-busy tracking and frame dispatch.
//!
//! A [`Station`] owns the transceiver, the timer service and every piece of
//! link state. The embedder feeds it from three sources:
//!
//! - received bytes ([`Station::receive`] or [`Station::on_phy_event`])
//! - the hardware alarm ([`Station::on_alarm`])
//! - service requests (discovery, connect, unitdata, test)
//!
//! Alarm expiries and conditions detected while receiving are queued and run
//! by [`Station::process_events`], which the embedder calls from its main
//! loop.
//!
//! # Example
//!
//! ```ignore
//! let mut station = Station::new(StationSettings::default(), phy, alarm, OsRandom, handler)?;
//! station.discovery_request(8, b"printer")?;
//! loop {
//!     if alarm_fired() {
//!         station.on_alarm()?;
//!     }
//!     if let Some(event) = phy_event() {
//!         station.on_phy_event(event)?;
//!     }
//!     station.process_events()?;
//! }
//! ```

use alloc::vec::Vec;

use tracing::{debug, error, trace, warn};

use crate::config::StationSettings;
use crate::connect::{ConnectResponseQos, PendingConnect};
use crate::connection::ConnectionRegistry;
use crate::discovery::{DiscoveryLog, DiscoveryState, DiscoveryStatus};
use crate::error::{Error, StationError};
use crate::event_queue::{EVENT_QUEUE_SIZE, EventQueue};
use crate::frame::{ConnectionAddress, DISCOVERY_INFO_MAX_LEN, DeviceAddress, FrameHeader, FrameKind};
use crate::hal::{Phy, PhyEvent, RandomSource, TimerHal};
use crate::timer::{TimerHandle, TimerService};
use crate::wrapper::{WrapperState, wrap_to_vec};

/// Bytes read from the transceiver per `rx` call.
const RX_CHUNK_SIZE: usize = 64;

/// Attempts to draw a unicast device address before giving up.
const ADDRESS_ATTEMPTS: usize = 8;

pub type StationResult<T, E> = core::result::Result<T, StationError<E>>;

/// Station modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationMode {
    /// Normal disconnected mode, the contention state.
    Ndm,
    /// Normal response mode, a connection is up.
    Nrm,
    /// Running a discovery as the querying station.
    Query,
    /// Answering another station's discovery.
    Reply,
    /// Waiting for a sniffing station to announce itself.
    Sconn,
    /// SNRM sent, waiting for UA or DM.
    Ssetup,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationRole {
    None,
    Primary,
    Secondary,
}

/// Why a connection went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer answered SNRM with DM.
    Refused,
    /// No answer to SNRM.
    SetupTimeout,
    /// The peer stopped answering polls.
    LinkTimeout,
    /// The peer sent DISC.
    Remote,
    /// Our side of the handshake failed, e.g. the first poll could not be sent.
    SetupFailed,
}

/// Payload of the station's timers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    MediaBusy,
    Slot,
    ReplyWindow,
    PTimer(ConnectionAddress),
    UnitdataInterval,
}

/// Work deferred to [`Station::process_events`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StationEvent {
    Timer(TimerHandle, TimerEvent),
    /// The media became busy while a query was running.
    DiscoveryMediaBusy,
}

/// Service primitives delivered to the link user. Every method defaults to
/// doing nothing.
pub trait StationHandler {
    fn discovery_confirm(&mut self, _logs: &[DiscoveryLog], _status: DiscoveryStatus) {}

    fn discovery_indication(&mut self, _log: &DiscoveryLog) {}

    fn connect_indication(
        &mut self,
        _address: ConnectionAddress,
        _remote: DeviceAddress,
        _qos: &ConnectResponseQos,
    ) {
    }

    fn connect_confirm(&mut self, _address: ConnectionAddress, _qos: &ConnectResponseQos) {}

    fn disconnect_indication(&mut self, _address: ConnectionAddress, _reason: DisconnectReason) {}

    fn unitdata_indication(&mut self, _data: &[u8]) {}

    fn test_confirm(&mut self, _source: DeviceAddress, _data: &[u8]) {}
}

impl StationHandler for () {}

/// Outcome of a frame handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    Handled,
    NotHandled,
}

/// Frame handlers, tried in the order [`Route::for_frame`] lists them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Route {
    XidCommand,
    XidResponse,
    Sniff,
    SnrmCommand,
    UaResponse,
    DmResponse,
    DiscCommand,
    RrCommand,
    RrResponse,
    UiCommand,
    TestCommand,
    TestResponse,
    FrmrResponse,
}

impl Route {
    fn for_frame(kind: FrameKind, command: bool) -> &'static [Route] {
        match (kind, command) {
            (FrameKind::XidCommand, true) => &[Route::XidCommand, Route::Sniff],
            (FrameKind::XidResponse, false) => &[Route::XidResponse, Route::Sniff],
            (FrameKind::Snrm, true) => &[Route::SnrmCommand],
            (FrameKind::Ua, false) => &[Route::UaResponse],
            (FrameKind::Dm, false) => &[Route::DmResponse],
            (FrameKind::Disc, true) => &[Route::DiscCommand],
            (FrameKind::Rr, true) => &[Route::RrCommand],
            (FrameKind::Rr, false) => &[Route::RrResponse],
            (FrameKind::Ui, true) => &[Route::UiCommand],
            (FrameKind::Test, true) => &[Route::TestCommand],
            (FrameKind::Test, false) => &[Route::TestResponse],
            (FrameKind::Frmr, false) => &[Route::FrmrResponse],
            _ => &[],
        }
    }
}

/// An IrLAP station bound to one transceiver.
#[derive(Debug)]
pub struct Station<P: Phy, T: TimerHal, R: RandomSource, U: StationHandler> {
    pub(crate) settings: StationSettings,
    pub(crate) phy: P,
    pub(crate) timers: TimerService<T, TimerEvent>,
    pub(crate) rng: R,
    pub(crate) handler: U,
    pub(crate) address: DeviceAddress,
    pub(crate) mode: StationMode,
    pub(crate) role: StationRole,
    pub(crate) baud_rate: u32,
    pub(crate) media_busy: bool,
    pub(crate) busy_count: u8,
    pub(crate) busy_timer: Option<TimerHandle>,
    pub(crate) connections: ConnectionRegistry,
    pub(crate) discovery: DiscoveryState,
    pub(crate) pending_connect: Option<PendingConnect>,
    pub(crate) unitdata_timer: Option<TimerHandle>,
    pub(crate) wrapper: WrapperState,
    pub(crate) events: EventQueue<StationEvent, EVENT_QUEUE_SIZE>,
}

impl<P: Phy, T: TimerHal, R: RandomSource, U: StationHandler> Station<P, T, R, U> {
    /// Creates a station in NDM, listening at the contention baud rate.
    pub fn new(settings: StationSettings, phy: P, timer_hal: T, rng: R, handler: U) -> StationResult<Self, P::Error> {
        if settings.discovery_info.len() > DISCOVERY_INFO_MAX_LEN {
            return Err(Error::DiscoveryInfoTooLong(settings.discovery_info.len()).into());
        }

        let mut station = Self {
            settings,
            phy,
            timers: TimerService::new(timer_hal),
            rng,
            handler,
            address: DeviceAddress::NULL,
            mode: StationMode::Ndm,
            role: StationRole::None,
            baud_rate: 0,
            media_busy: false,
            busy_count: 0,
            busy_timer: None,
            connections: ConnectionRegistry::new(),
            discovery: DiscoveryState::default(),
            pending_connect: None,
            unitdata_timer: None,
            wrapper: WrapperState::new(),
            events: EventQueue::new(),
        };

        match station.settings.device_address {
            Some(address) => station.address = DeviceAddress(address),
            None => station.regenerate_address()?,
        }
        station.set_baud_rate(station.settings.contention_baud_rate)?;
        station.phy.rx_enable().map_err(StationError::Transport)?;
        debug!("Station {} ready", station.address);
        Ok(station)
    }

    pub fn address(&self) -> DeviceAddress {
        self.address
    }

    pub fn mode(&self) -> StationMode {
        self.mode
    }

    pub fn role(&self) -> StationRole {
        self.role
    }

    pub fn is_media_busy(&self) -> bool {
        self.media_busy
    }

    /// Baud rate the transceiver is currently set to.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn settings(&self) -> &StationSettings {
        &self.settings
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.connections
    }

    pub fn handler(&self) -> &U {
        &self.handler
    }

    pub fn handler_mut(&mut self) -> &mut U {
        &mut self.handler
    }

    pub fn phy(&self) -> &P {
        &self.phy
    }

    pub fn phy_mut(&mut self) -> &mut P {
        &mut self.phy
    }

    /// Draws a new random device address.
    pub fn regenerate_address(&mut self) -> crate::error::Result<()> {
        for _ in 0..ADDRESS_ATTEMPTS {
            let address = DeviceAddress(self.rng.random_u32()?);
            if address.is_unicast() {
                debug!("Device address is now {}", address);
                self.address = address;
                return Ok(());
            }
        }
        Err(Error::Address)
    }

    pub(crate) fn set_baud_rate(&mut self, baud_rate: u32) -> StationResult<(), P::Error> {
        if baud_rate != self.baud_rate {
            self.phy.set_baudrate(baud_rate).map_err(StationError::Transport)?;
            debug!("Baud rate set to {}", baud_rate);
            self.baud_rate = baud_rate;
        }
        Ok(())
    }

    /// Wraps and transmits one frame at the current baud rate.
    pub(crate) fn send_frame(
        &mut self,
        header: &FrameHeader,
        fragments: &[&[u8]],
        additional_bofs: usize,
    ) -> StationResult<(), P::Error> {
        let frame = wrap_to_vec(header, fragments, additional_bofs)?;
        trace!("Sending {} byte frame, control {:#04x}", frame.len(), header.control);

        self.phy.tx_enable().map_err(StationError::Transport)?;
        let sent = self.phy.tx(&frame).and_then(|()| self.phy.tx_wait());
        // The transmitter is released even when sending failed
        let disabled = self.phy.tx_disable();
        if let Err(err) = &sent {
            error!("Failed to send frame: {:?}", err);
        }
        sent.and(disabled).map_err(StationError::Transport)
    }

    /// Sends a frame of the contention state: contention baud rate and the
    /// extra start markers.
    pub(crate) fn send_contention_frame(
        &mut self,
        header: &FrameHeader,
        fragments: &[&[u8]],
    ) -> StationResult<(), P::Error> {
        self.set_baud_rate(self.settings.contention_baud_rate)?;
        let additional_bofs = self.settings.contention_additional_bofs;
        self.send_frame(header, fragments, additional_bofs)
    }

    /// Counts a receive error, marking the media busy at the threshold.
    pub(crate) fn note_receive_error(&mut self) {
        self.busy_count = self.busy_count.saturating_add(1);
        trace!("Receive error {}", self.busy_count);
        if self.busy_count >= self.settings.media_busy_threshold {
            self.set_media_busy();
        }
    }

    /// Marks the media busy and restarts the busy timer.
    pub(crate) fn set_media_busy(&mut self) {
        if let Some(handle) = self.busy_timer.take() {
            // Already fired when the expiry is still queued
            let _ = self.timers.clear_timer(handle);
        }
        match self.timers.set_timer(self.settings.media_busy_timeout, TimerEvent::MediaBusy) {
            Ok(handle) => self.busy_timer = Some(handle),
            Err(err) => error!("Failed to arm media busy timer: {}", err),
        }

        if !self.media_busy {
            debug!("Media busy");
            self.media_busy = true;
            if self.mode == StationMode::Query {
                if let Err(err) = self.events.enqueue(StationEvent::DiscoveryMediaBusy) {
                    error!("Failed to queue discovery abort: {}", err);
                }
            }
        }
    }

    fn clear_media_busy(&mut self, handle: TimerHandle) {
        if self.busy_timer != Some(handle) {
            trace!("Ignoring stale media busy timer");
            return;
        }
        debug!("Media idle");
        self.busy_timer = None;
        self.media_busy = false;
        self.busy_count = 0;
    }

    /// Feeds received bytes through the unwrapper and dispatches every
    /// complete frame.
    pub fn receive(&mut self, bytes: &[u8]) {
        let mut frames = Vec::new();
        if self.wrapper.unwrap(bytes, |frame| frames.push(frame.to_vec())) {
            self.note_receive_error();
        }

        for frame in frames {
            if let Err(err) = self.dispatch_frame(&frame) {
                if err.link() == Some(Error::MalformedFrame) {
                    self.note_receive_error();
                }
                warn!("Dropped frame: {}", err);
            }
        }
    }

    /// Handles a transceiver receive event.
    pub fn on_phy_event(&mut self, event: PhyEvent) -> StationResult<(), P::Error> {
        match event {
            PhyEvent::DataRx => {
                let mut buffer = [0u8; RX_CHUNK_SIZE];
                loop {
                    let len = self.phy.rx(&mut buffer).map_err(StationError::Transport)?;
                    if len == 0 {
                        break;
                    }
                    self.receive(&buffer[..len]);
                }
            }
            PhyEvent::FramingError | PhyEvent::RxOverflow => {
                debug!("Transceiver reported {:?}", event);
                self.note_receive_error();
            }
        }
        Ok(())
    }

    /// Handles a carrier-detect report from the transceiver.
    pub fn on_carrier_detect(&mut self, active: bool) {
        if active {
            self.set_media_busy();
        }
    }

    /// Collects expired timers. Call when the hardware alarm fires.
    ///
    /// Only as many timers as the event queue has room for are collected.
    /// With [`Error::QueueFull`] the others stay due and the alarm fires again
    /// at once; run [`Station::process_events`] and call this again.
    pub fn on_alarm(&mut self) -> crate::error::Result<()> {
        for (handle, event) in self.timers.expire_at_most(self.events.free()) {
            self.events.enqueue(StationEvent::Timer(handle, event))?;
        }
        if self.timers.has_due() {
            warn!("Event queue full, {} timers left due", self.events.len());
            return Err(Error::QueueFull);
        }
        Ok(())
    }

    /// Runs queued events. Every event is processed; the first error is
    /// returned.
    pub fn process_events(&mut self) -> StationResult<(), P::Error> {
        let mut result = Ok(());
        while let Some(event) = self.events.dequeue() {
            if let Err(err) = self.handle_event(event) {
                warn!("Event {:?} failed: {}", event, err);
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        result
    }

    fn handle_event(&mut self, event: StationEvent) -> StationResult<(), P::Error> {
        match event {
            StationEvent::Timer(handle, TimerEvent::MediaBusy) => {
                self.clear_media_busy(handle);
                Ok(())
            }
            StationEvent::Timer(handle, TimerEvent::Slot) => self.on_slot_timeout(handle),
            StationEvent::Timer(handle, TimerEvent::ReplyWindow) => {
                self.on_reply_timeout(handle);
                Ok(())
            }
            StationEvent::Timer(handle, TimerEvent::PTimer(address)) => self.on_p_timeout(handle, address),
            StationEvent::Timer(handle, TimerEvent::UnitdataInterval) => {
                if self.unitdata_timer == Some(handle) {
                    self.unitdata_timer = None;
                }
                Ok(())
            }
            StationEvent::DiscoveryMediaBusy => {
                self.abort_query(DiscoveryStatus::MediaBusy);
                Ok(())
            }
        }
    }

    fn route(&mut self, route: Route, header: &FrameHeader, payload: &[u8]) -> StationResult<Dispatch, P::Error> {
        match route {
            Route::XidCommand => self.on_xid_command(header, payload),
            Route::XidResponse => self.on_xid_response(header, payload),
            Route::Sniff => self.on_sniff_xid(header, payload),
            Route::SnrmCommand => self.on_snrm_command(header, payload),
            Route::UaResponse => self.on_ua_response(header, payload),
            Route::DmResponse => self.on_dm_response(header, payload),
            Route::DiscCommand => self.on_disc_command(header, payload),
            Route::RrCommand => self.on_rr_command(header, payload),
            Route::RrResponse => self.on_rr_response(header, payload),
            Route::UiCommand => self.on_ui_command(header, payload),
            Route::TestCommand => self.on_test_command(header, payload),
            Route::TestResponse => self.on_test_response(header, payload),
            Route::FrmrResponse => {
                warn!("Peer rejected a frame on connection {}", header.address.value());
                Ok(Dispatch::Handled)
            }
        }
    }

    fn dispatch_frame(&mut self, frame: &[u8]) -> StationResult<(), P::Error> {
        let (payload, header) = FrameHeader::parse(frame).map_err(|_| Error::MalformedFrame)?;

        if !header.address.is_broadcast() && !self.connections.contains(header.address) {
            debug!("Dropping frame for unknown connection {}", header.address.value());
            return Ok(());
        }
        let Some(kind) = header.kind() else {
            debug!("Ignoring frame with control {:#04x}", header.control);
            return Ok(());
        };

        // The first handler reporting Handled ends the search
        for &route in Route::for_frame(kind, header.command) {
            if self.route(route, &header, payload)? == Dispatch::Handled {
                return Ok(());
            }
        }
        trace!("Unhandled {:?} frame (command: {})", kind, header.command);
        Ok(())
    }
}
