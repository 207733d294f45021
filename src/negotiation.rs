//! Connection parameter negotiation.
//!
//! Both stations announce a bitmask of acceptable options for each of seven
//! parameters. Parameters whose id has bit 7 clear are *dependent* and must be
//! shared by both sides (bitwise AND); the others are *independent* and each
//! side keeps its own. Afterwards every field is reduced to its most
//! significant set bit, which always encodes the strongest option (highest
//! baud rate, largest data size, ...).
//!
//! # Wire format
//!
//! ```text
//! +----+-----+-----------+----+-----+-----------+
//! | PI | PL  | PV (PL)   | PI | PL  | PV        | ...
//! +----+-----+-----------+----+-----+-----------+
//! ```

use derive_try_from_primitive::TryFromPrimitive;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

use crate::error::{self, Error};

/// Largest encoded parameter block (baud rate with two value bytes plus six
/// single-byte parameters).
pub const NEGOTIATION_PARAMS_MAX_LEN: usize = 22;

/// Field value meaning "no option offered".
pub const PARAM_UNSET: u16 = 0;

/// Bit of the parameter id marking an independent parameter.
pub const PARAM_ID_INDEPENDENT: u8 = 0b1000_0000;

/// Baud rate bit in the second value byte (4 Mbit/s).
const BAUD_RATE_MASK_HI: u8 = 0b0000_0001;

pub const BAUD_RATE_2400: u16 = 0x0001;
pub const BAUD_RATE_9600: u16 = 0x0002;
pub const BAUD_RATE_19200: u16 = 0x0004;
pub const BAUD_RATE_38400: u16 = 0x0008;
pub const BAUD_RATE_57600: u16 = 0x0010;
pub const BAUD_RATE_115200: u16 = 0x0020;
pub const BAUD_RATE_576000: u16 = 0x0040;
pub const BAUD_RATE_1152000: u16 = 0x0080;
pub const BAUD_RATE_4000000: u16 = 0x0100;

/// Baud rate per bit of the baud rate parameter.
pub const BAUD_RATES: [u32; 9] = [2400, 9600, 19200, 38400, 57600, 115200, 576000, 1152000, 4000000];

/// Max turn-around time in ms per bit.
const MAX_TURN_AROUND_TIMES_MS: [u16; 4] = [500, 250, 100, 50];

/// Additional BOFs at 115200 baud per bit.
const ADDITIONAL_BOFS_115200: [u8; 8] = [48, 24, 12, 5, 3, 2, 1, 0];

/// Min turn-around time in us per bit.
const MIN_TURN_AROUND_TIMES_US: [u16; 8] = [10000, 5000, 1000, 500, 100, 50, 10, 0];

/// Disconnect threshold in s per bit.
const DISCONNECT_THRESHOLDS_S: [u8; 8] = [3, 8, 12, 16, 20, 25, 30, 40];

const MIN_DATA_SIZE: u16 = 64;
const MIN_WINDOW_SIZE: u8 = 1;

/// Additional BOF divisor per baud rate, relative to 115200 baud.
const ADDITIONAL_BOFS_DIVISORS: [(u32, u8); 6] =
    [(2400, 48), (9600, 12), (19200, 6), (38400, 3), (57600, 2), (115200, 1)];

/// Maximum line capacity in bytes for a 500 ms max turn-around time.
const MAX_LINE_CAPACITY_500MS: [(u32, u32); 8] = [
    (9600, 400),
    (19200, 800),
    (38400, 1600),
    (57600, 2360),
    (115200, 4800),
    (576000, 28800),
    (1152000, 57600),
    (4000000, 200000),
];

/// Negotiation parameter identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[rustfmt::skip]
pub enum ParamId {
    BaudRate            = 0x01,
    MaxTurnAroundTime   = 0x82,
    DataSize            = 0x83,
    WindowSize          = 0x84,
    AdditionalBofs      = 0x85,
    MinTurnAroundTime   = 0x86,
    DisconnectThreshold = 0x08,
}

impl ParamId {
    /// All parameters in encoding order.
    pub const ALL: [ParamId; 7] = [
        Self::BaudRate,
        Self::MaxTurnAroundTime,
        Self::DataSize,
        Self::WindowSize,
        Self::AdditionalBofs,
        Self::MinTurnAroundTime,
        Self::DisconnectThreshold,
    ];

    pub const fn is_independent(self) -> bool {
        self as u8 & PARAM_ID_INDEPENDENT != 0
    }

    /// Valid bits of the parameter value.
    pub const fn mask(self) -> u16 {
        match self {
            Self::BaudRate => 0x01FF,
            Self::MaxTurnAroundTime => 0x0F,
            Self::DataSize => 0x3F,
            Self::WindowSize => 0x7F,
            Self::AdditionalBofs | Self::MinTurnAroundTime | Self::DisconnectThreshold => 0xFF,
        }
    }

    const fn max_len(self) -> usize {
        match self {
            Self::BaudRate => 2,
            _ => 1,
        }
    }
}

/// Candidate options per parameter, one bit per option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NegotiationParams {
    pub baud_rate: u16,
    pub max_turn_around_time: u16,
    pub data_size: u16,
    pub window_size: u16,
    pub additional_bofs: u16,
    pub min_turn_around_time: u16,
    pub disconnect_threshold: u16,
}

impl NegotiationParams {
    /// IrLAP defaults, assumed for every parameter a peer does not send.
    pub const fn irlap_defaults() -> Self {
        Self {
            baud_rate: BAUD_RATE_9600,
            max_turn_around_time: 0x01,
            data_size: 0x01,
            window_size: 0x01,
            additional_bofs: 0x80,
            min_turn_around_time: 0xFF,
            disconnect_threshold: 0x01,
        }
    }

    pub const fn get(&self, id: ParamId) -> u16 {
        match id {
            ParamId::BaudRate => self.baud_rate,
            ParamId::MaxTurnAroundTime => self.max_turn_around_time,
            ParamId::DataSize => self.data_size,
            ParamId::WindowSize => self.window_size,
            ParamId::AdditionalBofs => self.additional_bofs,
            ParamId::MinTurnAroundTime => self.min_turn_around_time,
            ParamId::DisconnectThreshold => self.disconnect_threshold,
        }
    }

    pub fn set(&mut self, id: ParamId, value: u16) {
        let field = match id {
            ParamId::BaudRate => &mut self.baud_rate,
            ParamId::MaxTurnAroundTime => &mut self.max_turn_around_time,
            ParamId::DataSize => &mut self.data_size,
            ParamId::WindowSize => &mut self.window_size,
            ParamId::AdditionalBofs => &mut self.additional_bofs,
            ParamId::MinTurnAroundTime => &mut self.min_turn_around_time,
            ParamId::DisconnectThreshold => &mut self.disconnect_threshold,
        };
        *field = value;
    }

    /// Reduces every field to its most significant set bit.
    pub fn normalize(&mut self) {
        for id in ParamId::ALL {
            self.set(id, most_significant_bit(self.get(id)));
        }
    }
}

/// Concrete operating values resolved from normalized parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NegotiationValues {
    pub baud_rate: u32,
    pub max_turn_around_time_ms: u16,
    pub data_size: u16,
    pub window_size: u8,
    pub additional_bofs: u8,
    pub min_turn_around_time_us: u16,
    pub disconnect_threshold_s: u8,
}

impl Default for NegotiationValues {
    /// Values of a link running on IrLAP defaults.
    fn default() -> Self {
        Self {
            baud_rate: 9600,
            max_turn_around_time_ms: 500,
            data_size: 64,
            window_size: 1,
            additional_bofs: 0,
            min_turn_around_time_us: 0,
            disconnect_threshold_s: 3,
        }
    }
}

const fn most_significant_bit(value: u16) -> u16 {
    if value == 0 { PARAM_UNSET } else { 1 << (15 - value.leading_zeros()) }
}

/// Index of the single set bit, `None` unless exactly one bit is set.
const fn bit_index(bits: u16) -> Option<usize> {
    if bits.count_ones() == 1 { Some(bits.trailing_zeros() as usize) } else { None }
}

/// Merges two proposals in place.
///
/// Dependent fields become the intersection of both proposals, then both
/// sides are normalized. Neither proposal is modified on failure.
pub fn merge(a: &mut NegotiationParams, b: &mut NegotiationParams) -> error::Result<()> {
    let mut merged_a = *a;
    let mut merged_b = *b;
    for id in ParamId::ALL {
        if merged_a.get(id) == PARAM_UNSET || merged_b.get(id) == PARAM_UNSET {
            return Err(Error::InvalidParameters);
        }
        if !id.is_independent() {
            let common = merged_a.get(id) & merged_b.get(id);
            if common == PARAM_UNSET {
                return Err(Error::NoCommonParameters);
            }
            merged_a.set(id, common);
            merged_b.set(id, common);
        }
    }
    merged_a.normalize();
    merged_b.normalize();
    *a = merged_a;
    *b = merged_b;
    Ok(())
}

fn additional_bofs_for(bits: u16, baud_rate: u32) -> Option<u8> {
    let raw = *ADDITIONAL_BOFS_115200.get(bit_index(bits)?)?;
    let scaled = ADDITIONAL_BOFS_DIVISORS
        .iter()
        .find(|(rate, _)| *rate == baud_rate)
        .map_or(0, |(_, divisor)| raw / divisor);
    Some(scaled)
}

/// Maximum line capacity for a baud rate and max turn-around time.
pub fn max_line_capacity(baud_rate: u32, max_turn_around_time_ms: u16) -> Option<u32> {
    MAX_LINE_CAPACITY_500MS
        .iter()
        .find(|(rate, _)| *rate == baud_rate)
        .map(|(_, capacity)| capacity * max_turn_around_time_ms as u32 / 500)
}

/// Bytes the requested values need within one max turn-around time.
pub fn requested_line_capacity(values: &NegotiationValues) -> u64 {
    let turn_around_bytes = values.baud_rate as u64 * values.min_turn_around_time_us as u64 / 1_000_000;
    values.window_size as u64 * (values.data_size as u64 + 6 + values.additional_bofs as u64)
        + turn_around_bytes
}

/// Shrinks window and data size alternately until the line capacity fits.
///
/// Returns the number of reduction steps taken.
fn fit_line_capacity(values: &mut NegotiationValues) -> error::Result<u32> {
    let max = max_line_capacity(values.baud_rate, values.max_turn_around_time_ms)
        .ok_or(Error::InvalidParameters)? as u64;
    let mut reduce_window = true;
    let mut steps = 0;
    while requested_line_capacity(values) > max {
        if values.window_size <= MIN_WINDOW_SIZE && values.data_size <= MIN_DATA_SIZE {
            return Err(Error::InvalidParameters);
        }
        if reduce_window {
            values.window_size = (values.window_size / 2).max(MIN_WINDOW_SIZE);
        } else {
            values.data_size = (values.data_size / 2).max(MIN_DATA_SIZE);
        }
        reduce_window = !reduce_window;
        steps += 1;
    }
    Ok(steps)
}

/// Resolves parameters into operating values and fits them to the line
/// capacity of the resulting baud rate.
pub fn translate_params_to_values(params: &NegotiationParams) -> error::Result<NegotiationValues> {
    let mut params = *params;
    params.normalize();

    let invalid = Error::InvalidParameters;
    let baud_rate = *BAUD_RATES.get(bit_index(params.baud_rate).ok_or(invalid)?).ok_or(invalid)?;
    let max_turn_around_time_ms = *MAX_TURN_AROUND_TIMES_MS
        .get(bit_index(params.max_turn_around_time).ok_or(invalid)?)
        .ok_or(invalid)?;
    let data_size_bit = bit_index(params.data_size & ParamId::DataSize.mask()).ok_or(invalid)?;
    let window_size_bit = bit_index(params.window_size & ParamId::WindowSize.mask()).ok_or(invalid)?;
    let additional_bofs = additional_bofs_for(params.additional_bofs, baud_rate).ok_or(invalid)?;
    let min_turn_around_time_us = *MIN_TURN_AROUND_TIMES_US
        .get(bit_index(params.min_turn_around_time).ok_or(invalid)?)
        .ok_or(invalid)?;
    let disconnect_threshold_s = *DISCONNECT_THRESHOLDS_S
        .get(bit_index(params.disconnect_threshold).ok_or(invalid)?)
        .ok_or(invalid)?;

    if baud_rate < 115200 && max_turn_around_time_ms != 500 {
        return Err(invalid);
    }

    let mut values = NegotiationValues {
        baud_rate,
        max_turn_around_time_ms,
        data_size: MIN_DATA_SIZE << data_size_bit,
        window_size: MIN_WINDOW_SIZE + window_size_bit as u8,
        additional_bofs,
        min_turn_around_time_us,
        disconnect_threshold_s,
    };
    fit_line_capacity(&mut values)?;
    Ok(values)
}

/// Builds a proposal accepting everything up to the given maxima.
///
/// Baud rates are limited to those in `supported_baudrates`. Max turn-around
/// time offers the longest time not above the requested one, additional BOFs
/// and min turn-around time offer the smallest option covering the request.
pub fn translate_values_to_params(values: &NegotiationValues, supported_baudrates: u16) -> NegotiationParams {
    let mut params = NegotiationParams::default();
    for (bit, rate) in BAUD_RATES.iter().enumerate() {
        if *rate <= values.baud_rate {
            params.baud_rate |= 1 << bit;
        }
    }
    params.baud_rate &= supported_baudrates & ParamId::BaudRate.mask();

    params.max_turn_around_time = MAX_TURN_AROUND_TIMES_MS
        .iter()
        .position(|&time| time <= values.max_turn_around_time_ms)
        .map_or(PARAM_UNSET, |bit| 1 << bit);

    for bit in 0..6 {
        if MIN_DATA_SIZE << bit <= values.data_size {
            params.data_size |= 1 << bit;
        }
    }
    for bit in 0..7u16 {
        if MIN_WINDOW_SIZE as u16 + bit <= values.window_size as u16 {
            params.window_size |= 1 << bit;
        }
    }

    // Tables are sorted descending, the last option still covering the request wins
    params.additional_bofs = ADDITIONAL_BOFS_115200
        .iter()
        .rposition(|&bofs| bofs >= values.additional_bofs)
        .map_or(0x01, |bit| 1 << bit);
    params.min_turn_around_time = MIN_TURN_AROUND_TIMES_US
        .iter()
        .rposition(|&time| time >= values.min_turn_around_time_us)
        .map_or(0x01, |bit| 1 << bit);

    for (bit, threshold) in DISCONNECT_THRESHOLDS_S.iter().enumerate() {
        if *threshold <= values.disconnect_threshold_s {
            params.disconnect_threshold |= 1 << bit;
        }
    }
    params
}

/// Applies TLV records from `data` to `params`.
///
/// Unknown parameter ids are skipped. A trailing single byte is left
/// unconsumed. Returns the number of bytes consumed; `params` is left
/// untouched on error.
pub fn update_params(params: &mut NegotiationParams, data: &[u8]) -> error::Result<usize> {
    let mut updated = *params;
    let mut pos = 0;
    while data.len() - pos >= 2 {
        let id = data[pos];
        let len = data[pos + 1] as usize;
        pos += 2;
        let value = data.get(pos..pos + len).ok_or(Error::InvalidParameters)?;
        pos += len;

        let Ok(id) = ParamId::try_from(id) else {
            continue;
        };
        if value.is_empty() || value.len() > id.max_len() {
            return Err(Error::InvalidParameters);
        }
        let raw = match id {
            ParamId::BaudRate => {
                let hi = value.get(1).map_or(0, |hi| hi & BAUD_RATE_MASK_HI);
                value[0] as u16 | (hi as u16) << 8
            }
            _ => value[0] as u16 & id.mask(),
        };
        updated.set(id, raw);
    }
    *params = updated;
    Ok(pos)
}

/// Encodes every set parameter as a TLV record into `dst`.
///
/// Returns the number of bytes written.
pub fn populate_params(dst: &mut [u8], params: &NegotiationParams) -> error::Result<usize> {
    let mut pos = 0;
    for id in ParamId::ALL {
        let value = params.get(id) & id.mask();
        if value == PARAM_UNSET {
            continue;
        }
        let len = if value > 0xFF { 2 } else { 1 };
        let needed = pos + 2 + len;
        if dst.len() < needed {
            return Err(Error::BufferTooSmall { needed, available: dst.len() });
        }
        dst[pos] = id as u8;
        dst[pos + 1] = len as u8;
        dst[pos + 2] = (value & 0xFF) as u8;
        if len == 2 {
            dst[pos + 3] = (value >> 8) as u8;
        }
        pos = needed;
    }
    Ok(pos)
}
