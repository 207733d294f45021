//! IrLAP frame layout: addresses, header, control field and the payloads of
//! the unnumbered frames the station exchanges.
//!
//! ```text
//! +---------+---------+------------------------------+
//! | Address | Control | Information (frame specific) |
//! |  (1)    |  (1)    | (n)                          |
//! +---------+---------+------------------------------+
//! ```
//!
//! - **Address**: 7-bit connection address in bits 1-7, C/R bit in bit 0
//!   (1 = command)
//! - **Control**: format in bits 0-1 (`11` unnumbered, `01` supervisory,
//!   `x0` information), poll/final in bit 4
//!
//! Device addresses inside payloads are 32-bit little-endian.

use alloc::vec::Vec;
use core::fmt;

use derive_try_from_primitive::TryFromPrimitive;
use nom::{
    IResult, Parser,
    error::{Error as NomError, ErrorKind},
    number::complete::{le_u32, u8},
};

/// Format identifier of discovery XID frames.
pub const FORMAT_ID: u8 = 0x01;

/// IrLAP protocol version carried in XID frames.
pub const VERSION: u8 = 0x00;

/// Size of the address and control fields.
pub const HEADER_SIZE: usize = 2;

/// Largest information field of a data frame.
pub const MAX_DATA_SIZE: usize = 2048;

/// Command/response bit of the address field.
pub const CR_BIT: u8 = 0b0000_0001;

/// Poll/final bit of the control field.
pub const POLL_FINAL: u8 = 0b0001_0000;

pub const FORMAT_MASK: u8 = 0b0000_0011;
pub const FORMAT_UNNUMBERED: u8 = 0b0000_0011;
pub const FORMAT_SUPERVISORY: u8 = 0b0000_0001;

/// Receive sequence number of supervisory frames.
pub const SUPERVISORY_NR_MASK: u8 = 0b1110_0000;
const SUPERVISORY_NR_SHIFT: u8 = 5;

/// Slot number of the final discovery XID command.
pub const XID_SLOT_FINAL: u8 = 0xFF;

/// XID flags: slot count code.
pub const XID_FLAGS_SLOTS_MASK: u8 = 0b0000_0011;

/// XID flags: the addressed station must pick a new device address.
pub const XID_FLAGS_NEW_ADDRESS: u8 = 0b0000_0100;

/// XID frame size without discovery info.
pub const XID_FRAME_SIZE: usize = 12;

pub const DISCOVERY_INFO_MAX_LEN: usize = 32;

/// Source and destination address in front of TEST data.
pub const TEST_HEADER_SIZE: usize = 8;

/// 7-bit connection address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionAddress(u8);

impl ConnectionAddress {
    pub const NULL: Self = Self(0x00);
    pub const BROADCAST: Self = Self(0x7F);

    /// Smallest address assignable to a connection.
    pub const MIN: u8 = 0x01;
    /// Largest address assignable to a connection.
    pub const MAX: u8 = 0x7E;

    /// Returns `None` for values wider than 7 bits.
    pub const fn new(value: u8) -> Option<Self> {
        if value <= Self::BROADCAST.0 { Some(Self(value)) } else { None }
    }

    /// Extracts the address from an address field, dropping the C/R bit.
    pub const fn from_address_field(field: u8) -> Self {
        Self(field >> 1)
    }

    pub const fn value(self) -> u8 {
        self.0
    }

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// Whether the address may identify a connection.
    pub const fn is_assignable(self) -> bool {
        self.0 >= Self::MIN && self.0 <= Self::MAX
    }

    /// Address field byte with the C/R bit set as given.
    pub const fn to_address_field(self, command: bool) -> u8 {
        (self.0 << 1) | if command { CR_BIT } else { 0 }
    }
}

/// 32-bit device address.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct DeviceAddress(pub u32);

impl DeviceAddress {
    pub const NULL: Self = Self(0x0000_0000);
    pub const BROADCAST: Self = Self(0xFFFF_FFFF);

    pub const fn is_broadcast(self) -> bool {
        self.0 == Self::BROADCAST.0
    }

    /// Whether the address may identify a single station.
    pub const fn is_unicast(self) -> bool {
        self.0 != Self::NULL.0 && self.0 != Self::BROADCAST.0
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, value) = le_u32(input)?;
        Ok((input, Self(value)))
    }

    pub const fn to_bytes(self) -> [u8; 4] {
        self.0.to_le_bytes()
    }
}

impl fmt::Debug for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceAddress({:08x})", self.0)
    }
}

impl fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Frame types distinguished by the control field with poll/final (and for
/// supervisory frames, N(R)) cleared.
///
/// Some command and response codes share a value (SNRM/RNRM, DISC/RD); the
/// C/R bit of the address field tells them apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
#[rustfmt::skip]
pub enum FrameKind {
    Ui          = 0x03,
    Disc        = 0x43,
    Ua          = 0x63,
    Snrm        = 0x83,
    Frmr        = 0x87,
    Test        = 0xE3,
    Dm          = 0x0F,
    XidCommand  = 0x2F,
    XidResponse = 0xAF,
    Rr          = 0x01,
    Rnr         = 0x05,
    Rej         = 0x09,
    Srej        = 0x0D,
}

impl FrameKind {
    /// Classifies a control field. Information frames yield `None`.
    pub fn from_control(control: u8) -> Option<Self> {
        let pattern = match control & FORMAT_MASK {
            FORMAT_UNNUMBERED => control & !POLL_FINAL,
            FORMAT_SUPERVISORY => control & !(POLL_FINAL | SUPERVISORY_NR_MASK),
            _ => return None,
        };
        Self::try_from(pattern).ok()
    }

    /// Control field for this kind with the poll/final bit as given.
    pub const fn control(self, poll_final: bool) -> u8 {
        self as u8 | if poll_final { POLL_FINAL } else { 0 }
    }

    /// Control field of a supervisory frame acknowledging up to `nr`.
    pub const fn supervisory_control(self, nr: u8, poll_final: bool) -> u8 {
        self.control(poll_final) | ((nr << SUPERVISORY_NR_SHIFT) & SUPERVISORY_NR_MASK)
    }
}

/// Address and control fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub address: ConnectionAddress,
    pub command: bool,
    pub control: u8,
}

impl FrameHeader {
    pub const fn command(address: ConnectionAddress, control: u8) -> Self {
        Self { address, command: true, control }
    }

    pub const fn response(address: ConnectionAddress, control: u8) -> Self {
        Self { address, command: false, control }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (address, control)) = (u8, u8).parse(input)?;
        Ok((
            input,
            Self {
                address: ConnectionAddress::from_address_field(address),
                command: address & CR_BIT != 0,
                control,
            },
        ))
    }

    pub const fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        [self.address.to_address_field(self.command), self.control]
    }

    pub const fn poll_final(&self) -> bool {
        self.control & POLL_FINAL != 0
    }

    pub fn kind(&self) -> Option<FrameKind> {
        FrameKind::from_control(self.control)
    }

    /// N(R) of a supervisory frame.
    pub const fn nr(&self) -> u8 {
        (self.control & SUPERVISORY_NR_MASK) >> SUPERVISORY_NR_SHIFT
    }
}

/// Number of discovery slots, encoded in the low bits of the XID flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive)]
#[repr(u8)]
pub enum SlotCount {
    One = 0b00,
    Six = 0b01,
    Eight = 0b10,
    Sixteen = 0b11,
}

impl SlotCount {
    /// Maps a slot count to its code. Only 1, 6, 8 and 16 are legal.
    pub const fn from_count(count: u8) -> Option<Self> {
        match count {
            1 => Some(Self::One),
            6 => Some(Self::Six),
            8 => Some(Self::Eight),
            16 => Some(Self::Sixteen),
            _ => None,
        }
    }

    pub const fn count(self) -> u8 {
        match self {
            Self::One => 1,
            Self::Six => 6,
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }
}

/// Discovery XID command or response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XidFrame {
    pub format_id: u8,
    pub source: DeviceAddress,
    pub destination: DeviceAddress,
    pub flags: u8,
    pub slot: u8,
    pub version: u8,
    pub discovery_info: heapless::Vec<u8, DISCOVERY_INFO_MAX_LEN>,
}

impl XidFrame {
    pub fn new(source: DeviceAddress, destination: DeviceAddress, slots: SlotCount, slot: u8) -> Self {
        Self {
            format_id: FORMAT_ID,
            source,
            destination,
            flags: slots as u8,
            slot,
            version: VERSION,
            discovery_info: heapless::Vec::new(),
        }
    }

    pub fn parse(input: &[u8]) -> IResult<&[u8], Self> {
        let (input, (format_id, source, destination, flags, slot, version)) =
            (u8, DeviceAddress::parse, DeviceAddress::parse, u8, u8, u8).parse(input)?;
        let discovery_info = heapless::Vec::from_slice(input)
            .map_err(|_| nom::Err::Error(NomError::new(input, ErrorKind::TooLarge)))?;
        let input = &input[input.len()..];
        Ok((input, Self { format_id, source, destination, flags, slot, version, discovery_info }))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(XID_FRAME_SIZE + self.discovery_info.len());
        out.push(self.format_id);
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());
        out.push(self.flags);
        out.push(self.slot);
        out.push(self.version);
        out.extend_from_slice(&self.discovery_info);
        out
    }

    /// Format id, version and source address must be acceptable.
    pub fn is_valid(&self) -> bool {
        self.format_id == FORMAT_ID && self.version == VERSION && self.source.is_unicast()
    }

    pub fn slot_count(&self) -> SlotCount {
        // Every two-bit code is a valid slot count
        SlotCount::try_from(self.flags & XID_FLAGS_SLOTS_MASK).unwrap_or(SlotCount::One)
    }

    pub const fn is_final(&self) -> bool {
        self.slot == XID_SLOT_FINAL
    }

    pub const fn new_address_requested(&self) -> bool {
        self.flags & XID_FLAGS_NEW_ADDRESS != 0
    }
}

/// SNRM command information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnrmFrame<'a> {
    pub source: DeviceAddress,
    pub destination: DeviceAddress,
    pub connection_address: ConnectionAddress,
    /// Negotiation parameters as TLV records.
    pub params: &'a [u8],
}

impl<'a> SnrmFrame<'a> {
    pub const MIN_SIZE: usize = 9;

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Self> {
        let (input, (source, destination, connection_address)) =
            (DeviceAddress::parse, DeviceAddress::parse, u8).parse(input)?;
        let (params, input) = input.split_at(input.len());
        Ok((
            input,
            Self {
                source,
                destination,
                connection_address: ConnectionAddress::from_address_field(connection_address),
                params,
            },
        ))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::MIN_SIZE + self.params.len());
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());
        out.push(self.connection_address.to_address_field(false));
        out.extend_from_slice(self.params);
        out
    }
}

/// UA response information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UaFrame<'a> {
    pub source: DeviceAddress,
    pub destination: DeviceAddress,
    /// Negotiation parameters, present when answering SNRM.
    pub params: &'a [u8],
}

impl<'a> UaFrame<'a> {
    pub const MIN_SIZE: usize = 8;

    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Self> {
        let (input, (source, destination)) =
            (DeviceAddress::parse, DeviceAddress::parse).parse(input)?;
        let (params, input) = input.split_at(input.len());
        Ok((input, Self { source, destination, params }))
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::MIN_SIZE + self.params.len());
        out.extend_from_slice(&self.source.to_bytes());
        out.extend_from_slice(&self.destination.to_bytes());
        out.extend_from_slice(self.params);
        out
    }
}

/// TEST command or response information field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TestFrame<'a> {
    pub source: DeviceAddress,
    pub destination: DeviceAddress,
    pub data: &'a [u8],
}

impl<'a> TestFrame<'a> {
    pub fn parse(input: &'a [u8]) -> IResult<&'a [u8], Self> {
        let (input, (source, destination)) =
            (DeviceAddress::parse, DeviceAddress::parse).parse(input)?;
        let (data, input) = input.split_at(input.len());
        Ok((input, Self { source, destination, data }))
    }

    /// The address part; the data is sent as a separate fragment.
    pub fn header_bytes(&self) -> [u8; TEST_HEADER_SIZE] {
        let mut out = [0u8; TEST_HEADER_SIZE];
        out[..4].copy_from_slice(&self.source.to_bytes());
        out[4..].copy_from_slice(&self.destination.to_bytes());
        out
    }
}
