//! # irlap
//!
//! A `no_std` IrLAP (Infrared Link Access Protocol) engine for devices with a
//! single infrared transceiver and one hardware alarm.
//!
//! The crate is split into three layers:
//!
//! - [`timer`]: deadline timers multiplexed onto one hardware alarm
//! - [`wrapper`] and [`crc`]: the asynchronous (SIR) frame codec with byte
//!   stuffing and a 16-bit frame check sequence
//! - [`station`]: the protocol engine with discovery, connection setup and
//!   parameter negotiation, plus the unitdata and test services
//!
//! Hardware is reached through the traits in [`hal`]; the link user receives
//! service indications through [`StationHandler`].
//!
//! ## Example
//!
//! ```ignore
//! use irlap::{OsRandom, Station, StationSettings};
//!
//! let mut station = Station::new(StationSettings::default(), uart, alarm, OsRandom, handler)?;
//! station.discovery_request(6, b"")?;
//! ```
#![cfg_attr(not(feature = "std"), no_std)]

extern crate alloc;

pub mod config;
pub mod connect;
pub mod connection;
pub mod crc;
pub mod discovery;
pub mod error;
pub mod event_queue;
pub mod frame;
pub mod hal;
pub mod negotiation;
pub mod station;
pub mod test_service;
pub mod time;
pub mod timer;
pub mod unitdata;
pub mod wrapper;

#[cfg(all(target_arch = "arm", target_os = "none"))]
pub mod getrandom_impl;

#[cfg(test)]
mod testing;

#[cfg(test)]
mod lib_tests;

pub use config::StationSettings;
pub use connect::{ConnectRequestQos, ConnectResponseQos};
pub use connection::{Connection, ConnectionRegistry, ConnectionState};
pub use discovery::{DiscoveryLog, DiscoveryStatus};
pub use error::{Error, StationError};
pub use frame::{ConnectionAddress, DeviceAddress};
pub use hal::{HalError, OsRandom, Phy, PhyEvent, RandomSource, TimerHal};
pub use negotiation::{NegotiationParams, NegotiationValues};
pub use station::{DisconnectReason, Station, StationHandler, StationMode, StationResult, StationRole};
pub use timer::{TimerHandle, TimerService};
