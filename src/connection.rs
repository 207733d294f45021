//! Connection records and the registry keyed by connection address.

use alloc::collections::BTreeMap;

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::frame::{ConnectionAddress, DeviceAddress};
use crate::hal::RandomSource;
use crate::negotiation::{NegotiationParams, NegotiationValues};
use crate::timer::TimerHandle;

/// Progress of a connection through setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// SNRM sent or received, parameters not yet agreed.
    Setup,
    /// Parameters agreed, link in normal response mode.
    Negotiated,
}

/// One link to a remote station.
#[derive(Debug, Clone)]
pub struct Connection {
    pub address: ConnectionAddress,
    pub remote: DeviceAddress,
    pub state: ConnectionState,
    /// Our proposal, normalized once negotiated.
    pub local_params: NegotiationParams,
    pub local_values: NegotiationValues,
    pub remote_values: NegotiationValues,
    pub p_timer: Option<TimerHandle>,
    /// Final timer of the secondary role. Not armed yet.
    pub f_timer: Option<TimerHandle>,
    /// Consecutive polls left unanswered.
    pub missed_polls: u32,
}

impl Connection {
    pub fn new(address: ConnectionAddress, remote: DeviceAddress, local_params: NegotiationParams) -> Self {
        Self {
            address,
            remote,
            state: ConnectionState::Setup,
            local_params,
            local_values: NegotiationValues::default(),
            remote_values: NegotiationValues::default(),
            p_timer: None,
            f_timer: None,
            missed_polls: 0,
        }
    }

    pub fn is_negotiated(&self) -> bool {
        self.state == ConnectionState::Negotiated
    }
}

/// Live connections, at most one per connection address.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: BTreeMap<ConnectionAddress, Connection>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self { connections: BTreeMap::new() }
    }

    fn free_addresses(&self) -> impl Iterator<Item = ConnectionAddress> + '_ {
        (ConnectionAddress::MIN..=ConnectionAddress::MAX)
            .filter_map(ConnectionAddress::new)
            .filter(|address| !self.connections.contains_key(address))
    }

    /// Creates a connection on a uniformly chosen free address.
    pub fn allocate<R: RandomSource>(
        &mut self,
        rng: &mut R,
        remote: DeviceAddress,
        local_params: NegotiationParams,
    ) -> Result<&mut Connection> {
        let free = self.free_addresses().count();
        debug!("{} free connection addresses", free);
        if free == 0 {
            warn!("No free connection address for {}", remote);
            return Err(Error::NoConnectionAddressAvailable);
        }

        // At most 126 free addresses, the count always fits a byte
        let index = rng.random_u8(0, free as u8)?;
        let address = self
            .free_addresses()
            .nth(index as usize)
            .ok_or(Error::NoConnectionAddressAvailable)?;
        debug!("Allocated connection address {}", address.value());
        self.insert(Connection::new(address, remote, local_params))
    }

    /// Registers a connection whose address the peer picked.
    pub fn insert(&mut self, connection: Connection) -> Result<&mut Connection> {
        let address = connection.address;
        if !address.is_assignable() || self.connections.contains_key(&address) {
            return Err(Error::Address);
        }
        Ok(self.connections.entry(address).or_insert(connection))
    }

    pub fn get(&self, address: ConnectionAddress) -> Option<&Connection> {
        self.connections.get(&address)
    }

    pub fn get_mut(&mut self, address: ConnectionAddress) -> Option<&mut Connection> {
        self.connections.get_mut(&address)
    }

    /// Removes a connection, returning it for cleanup of its timers.
    pub fn free(&mut self, address: ConnectionAddress) -> Option<Connection> {
        self.connections.remove(&address)
    }

    pub fn contains(&self, address: ConnectionAddress) -> bool {
        self.connections.contains_key(&address)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Connection> {
        self.connections.values()
    }
}
