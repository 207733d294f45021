//! Mock transceiver, clock, random source and service handler for tests.
//!
//! Mocks share their state through `Rc<RefCell<_>>` so a test keeps a clone
//! for inspection while the station owns the other.

use alloc::collections::VecDeque;
use alloc::rc::Rc;
use alloc::vec::Vec;
use core::cell::RefCell;

use crate::connect::ConnectResponseQos;
use crate::discovery::{DiscoveryLog, DiscoveryStatus};
use crate::frame::{ConnectionAddress, DeviceAddress};
use crate::hal::{HalError, Phy, RandomSource, TimerHal};
use crate::negotiation::{BAUD_RATE_9600, BAUD_RATE_115200};
use crate::station::{DisconnectReason, StationHandler};
use crate::wrapper::WrapperState;

#[derive(Debug)]
struct ClockState {
    ticks: u64,
    max: u64,
    ns_per_tick: u64,
    alarm: Option<u64>,
    set_alarm_calls: usize,
    fail_set_alarm: bool,
}

/// Free-running counter with a recorded alarm.
#[derive(Debug, Clone)]
pub struct MockClock(Rc<RefCell<ClockState>>);

impl MockClock {
    /// 1 us per tick, 32-bit counter.
    pub fn new() -> Self {
        Self::with_range(u32::MAX as u64, 1_000)
    }

    pub fn with_range(max: u64, ns_per_tick: u64) -> Self {
        Self(Rc::new(RefCell::new(ClockState {
            ticks: 0,
            max,
            ns_per_tick,
            alarm: None,
            set_alarm_calls: 0,
            fail_set_alarm: false,
        })))
    }

    pub fn set_ticks(&self, ticks: u64) {
        self.0.borrow_mut().ticks = ticks;
    }

    /// Advances the counter, wrapping past the maximum.
    pub fn advance_ticks(&self, ticks: u64) {
        let mut state = self.0.borrow_mut();
        let mut next = state.ticks + ticks;
        while next > state.max {
            next -= state.max;
        }
        state.ticks = next;
    }

    pub fn advance_ms(&self, ms: u64) {
        let ticks = ms * 1_000_000 / self.0.borrow().ns_per_tick;
        self.advance_ticks(ticks);
    }

    /// Delay passed to the most recent `set_alarm` while the alarm is armed.
    pub fn alarm_delay(&self) -> Option<u64> {
        self.0.borrow().alarm
    }

    pub fn alarm_is_set(&self) -> bool {
        self.0.borrow().alarm.is_some()
    }

    pub fn set_alarm_calls(&self) -> usize {
        self.0.borrow().set_alarm_calls
    }

    pub fn fail_set_alarm(&self, fail: bool) {
        self.0.borrow_mut().fail_set_alarm = fail;
    }
}

impl TimerHal for MockClock {
    fn get_time(&self) -> u64 {
        self.0.borrow().ticks
    }

    fn max_time_value(&self) -> u64 {
        self.0.borrow().max
    }

    fn ns_per_tick(&self) -> u64 {
        self.0.borrow().ns_per_tick
    }

    fn set_alarm(&mut self, delay_ticks: u64) -> Result<(), HalError> {
        let mut state = self.0.borrow_mut();
        if state.fail_set_alarm {
            return Err(HalError::AlarmUnavailable);
        }
        state.set_alarm_calls += 1;
        state.alarm = Some(delay_ticks);
        Ok(())
    }

    fn clear_alarm(&mut self) {
        self.0.borrow_mut().alarm = None;
    }
}

/// Transceiver operations in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PhyCall {
    SetBaudrate(u32),
    TxEnable,
    Tx(usize),
    TxWait,
    TxDisable,
    RxEnable,
    RxDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MockPhyError;

/// A transmitted frame, as raw wire bytes.
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub baud_rate: u32,
    pub bytes: Vec<u8>,
}

impl SentFrame {
    /// Header and payload with start markers, escapes and CRC removed.
    pub fn unwrapped(&self) -> Vec<u8> {
        let mut state = WrapperState::new();
        let mut frames = Vec::new();
        let violation = state.unwrap(&self.bytes, |frame| frames.push(frame.to_vec()));
        assert!(!violation, "sent frame is not well formed");
        assert_eq!(frames.len(), 1);
        frames.remove(0)
    }

    /// Number of 0xFF start markers in front of the frame.
    pub fn additional_bofs(&self) -> usize {
        self.bytes.iter().take_while(|&&byte| byte == 0xFF).count()
    }
}

#[derive(Debug)]
struct PhyState {
    baud_rate: u32,
    supported: u16,
    calls: Vec<PhyCall>,
    sent: Vec<SentFrame>,
    rx: VecDeque<Vec<u8>>,
    fail_tx: bool,
}

#[derive(Debug, Clone)]
pub struct MockPhy(Rc<RefCell<PhyState>>);

impl MockPhy {
    pub fn new() -> Self {
        Self(Rc::new(RefCell::new(PhyState {
            baud_rate: 0,
            supported: BAUD_RATE_9600 | BAUD_RATE_115200,
            calls: Vec::new(),
            sent: Vec::new(),
            rx: VecDeque::new(),
            fail_tx: false,
        })))
    }

    pub fn calls(&self) -> Vec<PhyCall> {
        self.0.borrow().calls.clone()
    }

    pub fn clear_calls(&self) {
        self.0.borrow_mut().calls.clear();
    }

    pub fn sent(&self) -> Vec<SentFrame> {
        self.0.borrow().sent.clone()
    }

    /// Returns and forgets everything transmitted so far.
    pub fn take_sent(&self) -> Vec<SentFrame> {
        core::mem::take(&mut self.0.borrow_mut().sent)
    }

    pub fn push_rx(&self, bytes: &[u8]) {
        self.0.borrow_mut().rx.push_back(bytes.to_vec());
    }

    pub fn fail_tx(&self, fail: bool) {
        self.0.borrow_mut().fail_tx = fail;
    }
}

impl Phy for MockPhy {
    type Error = MockPhyError;

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        state.calls.push(PhyCall::SetBaudrate(baudrate));
        state.baud_rate = baudrate;
        Ok(())
    }

    fn tx_enable(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().calls.push(PhyCall::TxEnable);
        Ok(())
    }

    fn tx(&mut self, data: &[u8]) -> Result<(), Self::Error> {
        let mut state = self.0.borrow_mut();
        state.calls.push(PhyCall::Tx(data.len()));
        if state.fail_tx {
            return Err(MockPhyError);
        }
        let baud_rate = state.baud_rate;
        state.sent.push(SentFrame { baud_rate, bytes: data.to_vec() });
        Ok(())
    }

    fn tx_wait(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().calls.push(PhyCall::TxWait);
        Ok(())
    }

    fn tx_disable(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().calls.push(PhyCall::TxDisable);
        Ok(())
    }

    fn rx_enable(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().calls.push(PhyCall::RxEnable);
        Ok(())
    }

    fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error> {
        let mut state = self.0.borrow_mut();
        let Some(mut chunk) = state.rx.pop_front() else {
            return Ok(0);
        };
        let len = chunk.len().min(buffer.len());
        buffer[..len].copy_from_slice(&chunk[..len]);
        if len < chunk.len() {
            state.rx.push_front(chunk.split_off(len));
        }
        Ok(len)
    }

    fn rx_disable(&mut self) -> Result<(), Self::Error> {
        self.0.borrow_mut().calls.push(PhyCall::RxDisable);
        Ok(())
    }

    fn supported_baudrates(&self) -> u16 {
        self.0.borrow().supported
    }
}

/// Replays given bytes, or counts upwards forever.
#[derive(Debug)]
pub struct MockRandom {
    bytes: VecDeque<u8>,
    counter: Option<u8>,
}

impl MockRandom {
    /// Fails with [`HalError::RandomUnavailable`] once `bytes` are used up.
    pub fn new(bytes: &[u8]) -> Self {
        Self { bytes: bytes.iter().copied().collect(), counter: None }
    }

    pub fn counting() -> Self {
        Self { bytes: VecDeque::new(), counter: Some(0) }
    }
}

impl RandomSource for MockRandom {
    fn fill_bytes(&mut self, buffer: &mut [u8]) -> Result<(), HalError> {
        for byte in buffer.iter_mut() {
            *byte = match (self.bytes.pop_front(), self.counter.as_mut()) {
                (Some(value), _) => value,
                (None, Some(counter)) => {
                    let value = *counter;
                    *counter = counter.wrapping_add(1);
                    value
                }
                (None, None) => return Err(HalError::RandomUnavailable),
            };
        }
        Ok(())
    }
}

/// Service primitives delivered to the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Indication {
    DiscoveryConfirm(Vec<DiscoveryLog>, DiscoveryStatus),
    Discovery(DiscoveryLog),
    Connect(ConnectionAddress, DeviceAddress, ConnectResponseQos),
    ConnectConfirm(ConnectionAddress, ConnectResponseQos),
    Disconnect(ConnectionAddress, DisconnectReason),
    Unitdata(Vec<u8>),
    TestConfirm(DeviceAddress, Vec<u8>),
}

#[derive(Debug, Clone, Default)]
pub struct MockHandler(Rc<RefCell<Vec<Indication>>>);

impl MockHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<Indication> {
        core::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }

    fn push(&self, indication: Indication) {
        self.0.borrow_mut().push(indication);
    }
}

impl StationHandler for MockHandler {
    fn discovery_confirm(&mut self, logs: &[DiscoveryLog], status: DiscoveryStatus) {
        self.push(Indication::DiscoveryConfirm(logs.to_vec(), status));
    }

    fn discovery_indication(&mut self, log: &DiscoveryLog) {
        self.push(Indication::Discovery(log.clone()));
    }

    fn connect_indication(&mut self, address: ConnectionAddress, remote: DeviceAddress, qos: &ConnectResponseQos) {
        self.push(Indication::Connect(address, remote, *qos));
    }

    fn connect_confirm(&mut self, address: ConnectionAddress, qos: &ConnectResponseQos) {
        self.push(Indication::ConnectConfirm(address, *qos));
    }

    fn disconnect_indication(&mut self, address: ConnectionAddress, reason: DisconnectReason) {
        self.push(Indication::Disconnect(address, reason));
    }

    fn unitdata_indication(&mut self, data: &[u8]) {
        self.push(Indication::Unitdata(data.to_vec()));
    }

    fn test_confirm(&mut self, source: DeviceAddress, data: &[u8]) {
        self.push(Indication::TestConfirm(source, data.to_vec()));
    }
}
