//! Error types shared by every layer of the link engine.

use crate::hal::HalError;
use crate::station::StationMode;

/// Errors produced by the link engine itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Device or connection address is null, broadcast or otherwise unusable.
    #[error("invalid address")]
    Address,
    /// Unitdata payload exceeds the connectionless limit.
    #[error("unitdata of {len} bytes exceeds the limit of {max} bytes")]
    UnitdataTooLong { len: usize, max: usize },
    /// Operation is not allowed in the current station mode.
    #[error("operation not allowed in station mode {0:?}")]
    StationState(StationMode),
    /// The unitdata inter-send interval has not elapsed yet.
    #[error("unitdata interval has not elapsed")]
    UnitdataTimeLimit,
    /// The medium is busy after repeated framing errors.
    #[error("media busy")]
    MediaBusy,
    #[error("not implemented")]
    NotImplemented,
    /// All connection addresses are in use.
    #[error("no connection address available")]
    NoConnectionAddressAvailable,
    /// A dependent negotiation parameter has no value both sides accept.
    #[error("no common negotiation parameters found")]
    NoCommonParameters,
    /// Negotiation parameters are unset, unknown or do not fit the line capacity.
    #[error("invalid negotiation parameters")]
    InvalidParameters,
    /// No connection with the given address.
    #[error("no such connection")]
    NoConnection,
    /// Discovery slot count other than 1, 6, 8 or 16.
    #[error("unsupported number of discovery slots: {0}")]
    InvalidSlotCount(u8),
    /// Discovery info longer than 32 bytes.
    #[error("discovery info of {0} bytes is too long")]
    DiscoveryInfoTooLong(usize),
    /// Output buffer is too small.
    #[error("buffer too small: {needed} bytes needed, {available} available")]
    BufferTooSmall { needed: usize, available: usize },
    /// Frame does not fit the receive buffer of any peer.
    #[error("frame too large")]
    FrameTooLarge,
    /// Frame payload could not be decoded.
    #[error("malformed frame")]
    MalformedFrame,
    /// Timer handle is unknown, stale or already disabled.
    #[error("invalid timer handle")]
    InvalidTimer,
    #[error("out of memory")]
    OutOfMemory,
    #[error("event queue full")]
    QueueFull,
    #[error(transparent)]
    Hal(#[from] HalError),
}

pub type Result<T> = core::result::Result<T, Error>;

/// Errors returned by station requests that touch the transceiver.
#[derive(Debug, thiserror::Error)]
pub enum StationError<E> {
    /// Error from the transceiver, passed through unchanged.
    #[error("transport error: {0:?}")]
    Transport(E),
    #[error(transparent)]
    Link(#[from] Error),
}

impl<E> StationError<E> {
    /// Returns the link error, if this is one.
    pub fn link(&self) -> Option<Error> {
        match self {
            Self::Link(err) => Some(*err),
            Self::Transport(_) => None,
        }
    }
}
