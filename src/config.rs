//! Station settings.

use alloc::vec::Vec;
use core::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::negotiation::NegotiationValues;

/// Unitdata payloads above this size are refused.
pub const UNITDATA_MAX_SIZE: usize = 384;

/// Settings for an IrLAP station.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct StationSettings {
    /// Fixed device address. A random address is generated when `None`.
    /// Default: None.
    pub device_address: Option<u32>,
    /// Receive errors after which the media counts as busy.
    /// Default: 10.
    pub media_busy_threshold: u8,
    /// How long the media stays busy after the threshold was reached.
    /// Default: 650 ms.
    pub media_busy_timeout: Duration,
    /// Length of one discovery slot.
    /// Default: 50 ms.
    pub slot_timeout: Duration,
    /// P-timer before parameters are negotiated.
    /// Default: 500 ms.
    pub p_timeout: Duration,
    /// Minimum spacing between two unitdata frames.
    /// Default: 500 ms.
    pub unitdata_interval: Duration,
    /// Largest unitdata payload.
    /// Default: 384 bytes.
    pub unitdata_max_size: usize,
    /// Baud rate of the contention state (discovery, unitdata, test).
    /// Default: 9600.
    pub contention_baud_rate: u32,
    /// Extra start markers in front of contention frames.
    /// Default: 10.
    pub contention_additional_bofs: usize,
    /// Discovery info sent with our XID responses, at most 32 bytes.
    /// Default: empty.
    pub discovery_info: Vec<u8>,
    /// Best values this station accepts. Limited by the transceiver's
    /// supported baud rates when the proposal is built.
    /// Default: 4 Mbit/s, 500 ms, 2048 bytes, window 7, no additional BOFs,
    /// 1 ms min turn-around, 40 s disconnect threshold.
    pub negotiation: NegotiationValues,
}

impl Default for StationSettings {
    fn default() -> Self {
        Self {
            device_address: None,
            media_busy_threshold: 10,
            media_busy_timeout: Duration::from_millis(650),
            slot_timeout: Duration::from_millis(50),
            p_timeout: Duration::from_millis(500),
            unitdata_interval: Duration::from_millis(500),
            unitdata_max_size: UNITDATA_MAX_SIZE,
            contention_baud_rate: 9600,
            contention_additional_bofs: 10,
            discovery_info: Vec::new(),
            negotiation: NegotiationValues {
                baud_rate: 4_000_000,
                max_turn_around_time_ms: 500,
                data_size: 2048,
                window_size: 7,
                additional_bofs: 0,
                min_turn_around_time_us: 1000,
                disconnect_threshold_s: 40,
            },
        }
    }
}
