//! Hardware abstraction traits the station is built on.
//!
//! A station needs exactly three collaborators:
//!
//! - [`Phy`]: the infrared transceiver (UART-style SIR transport)
//! - [`TimerHal`]: one free-running counter plus one one-shot alarm
//! - [`RandomSource`]: random bytes for addresses and slot selection
//!
//! Interrupt-side plumbing stays with the implementor: when the transceiver
//! raises a receive event the embedder forwards it to
//! [`Station::on_phy_event`](crate::station::Station::on_phy_event), and when
//! the alarm fires it calls [`Station::on_alarm`](crate::station::Station::on_alarm).

/// Errors reported by timer and random HALs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HalError {
    #[error("random source unavailable")]
    RandomUnavailable,
    #[error("alarm could not be armed")]
    AlarmUnavailable,
}

/// Receive-side events delivered by the transceiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhyEvent {
    /// Bytes are ready to be read with [`Phy::rx`].
    DataRx,
    /// The UART saw a framing error.
    FramingError,
    /// The receiver dropped bytes.
    RxOverflow,
}

/// Infrared transceiver.
///
/// Every frame is sent as `tx_enable -> tx -> tx_wait -> tx_disable`.
pub trait Phy {
    /// The error type returned by transceiver operations.
    type Error: core::fmt::Debug;

    fn set_baudrate(&mut self, baudrate: u32) -> Result<(), Self::Error>;

    fn tx_enable(&mut self) -> Result<(), Self::Error>;

    fn tx(&mut self, data: &[u8]) -> Result<(), Self::Error>;

    /// Blocks until all bytes handed to [`Phy::tx`] are on the air.
    fn tx_wait(&mut self) -> Result<(), Self::Error>;

    fn tx_disable(&mut self) -> Result<(), Self::Error>;

    fn rx_enable(&mut self) -> Result<(), Self::Error>;

    /// Reads pending bytes into `buffer`, returning how many were read.
    fn rx(&mut self, buffer: &mut [u8]) -> Result<usize, Self::Error>;

    fn rx_disable(&mut self) -> Result<(), Self::Error>;

    /// Supported baud rates as a bitmask in the layout of the baud rate
    /// negotiation parameter (bit 0 = 2400, bit 1 = 9600, ... bit 8 = 4 Mbit/s).
    fn supported_baudrates(&self) -> u16;

    /// Starts carrier detection, if the transceiver supports it.
    ///
    /// Detected carrier is reported through
    /// [`Station::on_carrier_detect`](crate::station::Station::on_carrier_detect).
    fn carrier_detect_enable(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn carrier_detect_disable(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }
}

/// Monotonic counter and single one-shot alarm.
pub trait TimerHal {
    /// Current counter value in HAL ticks.
    fn get_time(&self) -> u64;

    /// Largest value [`TimerHal::get_time`] returns before wrapping to zero.
    fn max_time_value(&self) -> u64;

    fn ns_per_tick(&self) -> u64;

    /// Arms the alarm to fire `delay_ticks` from now, replacing any armed alarm.
    fn set_alarm(&mut self, delay_ticks: u64) -> Result<(), HalError>;

    fn clear_alarm(&mut self);
}

/// Source of random bytes.
pub trait RandomSource {
    fn fill_bytes(&mut self, buffer: &mut [u8]) -> Result<(), HalError>;

    /// Uniformly distributed value in `min..max`.
    ///
    /// Returns `min` if the range is empty.
    fn random_u8(&mut self, min: u8, max: u8) -> Result<u8, HalError> {
        if max <= min {
            return Ok(min);
        }
        let range = (max - min) as u16;
        // Largest multiple of `range` that fits a byte, to avoid modulo bias
        let limit = 256 - (256 % range);
        loop {
            let mut byte = [0u8; 1];
            self.fill_bytes(&mut byte)?;
            let value = byte[0] as u16;
            if value < limit {
                return Ok(min + (value % range) as u8);
            }
        }
    }

    fn random_u32(&mut self) -> Result<u32, HalError> {
        let mut bytes = [0u8; 4];
        self.fill_bytes(&mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }
}

/// Random source backed by the platform RNG through `getrandom`.
///
/// On bare-metal targets `getrandom` needs a custom backend, see
/// [`getrandom_impl`](crate::getrandom_impl).
#[derive(Debug, Clone, Copy, Default)]
pub struct OsRandom;

impl RandomSource for OsRandom {
    fn fill_bytes(&mut self, buffer: &mut [u8]) -> Result<(), HalError> {
        getrandom::getrandom(buffer).map_err(|_| HalError::RandomUnavailable)
    }
}
