use std::{
    net::IpAddr,
    time::{Duration, Instant},
};

use thiserror::Error;
use thunderdome::{Arena, Index};
use tracing::{event, Level};

/// Minimum time between repeated per-host limit warnings.
const HOST_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// Stable handle of a registered connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Slot(Index);

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    #[error("server is at its limit of {limit} connections")]
    Capacity { limit: usize },
    #[error("too many connections from {addr}, limit is {limit}")]
    PerHost { addr: IpAddr, limit: usize },
    #[error("hostname of {addr} does not resolve back to it")]
    Verification { addr: IpAddr },
    #[error("listener requires TLS, but none is configured")]
    NoTls,
}

struct Entry<C> {
    peer: IpAddr,
    value: C,
}

/// Owner of all active connections, enforcing the global and per-host limits.
pub struct ConnectionRegistry<C> {
    entries: Arena<Entry<C>>,
    max_clients: usize,
    max_per_host: usize,
    last_host_warning: Option<Instant>,
}

impl<C> ConnectionRegistry<C> {
    pub fn new(max_clients: usize, max_per_host: usize) -> Self {
        Self {
            entries: Arena::new(),
            max_clients,
            max_per_host,
            last_host_warning: None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn count_host(&self, addr: IpAddr) -> usize {
        self.entries
            .iter()
            .filter(|(_, entry)| entry.peer == addr)
            .count()
    }

    /// Check whether a new connection from `peer` fits within the limits.
    pub fn admit(&mut self, peer: IpAddr, now: Instant) -> Result<(), RejectReason> {
        if self.entries.len() >= self.max_clients {
            return Err(RejectReason::Capacity {
                limit: self.max_clients,
            });
        }

        if self.count_host(peer) >= self.max_per_host {
            let warn = self
                .last_host_warning
                .map(|last| now.saturating_duration_since(last) >= HOST_WARNING_INTERVAL)
                .unwrap_or(true);

            if warn {
                self.last_host_warning = Some(now);
                event!(
                    Level::WARN,
                    %peer,
                    limit = self.max_per_host,
                    "possible denial of service attack, too many connections from one host"
                );
            }

            return Err(RejectReason::PerHost {
                addr: peer,
                limit: self.max_per_host,
            });
        }

        Ok(())
    }

    pub fn insert(&mut self, peer: IpAddr, value: C) -> Slot {
        Slot(self.entries.insert(Entry { peer, value }))
    }

    pub fn get(&self, slot: Slot) -> Option<&C> {
        self.entries.get(slot.0).map(|entry| &entry.value)
    }

    pub fn get_mut(&mut self, slot: Slot) -> Option<&mut C> {
        self.entries.get_mut(slot.0).map(|entry| &mut entry.value)
    }

    pub fn remove(&mut self, slot: Slot) -> Option<C> {
        self.entries.remove(slot.0).map(|entry| entry.value)
    }

    pub fn slots(&self) -> Vec<Slot> {
        self.entries.iter().map(|(index, _)| Slot(index)).collect()
    }

    /// When the last per-host warning was logged.
    #[cfg(test)]
    fn warned_at(&self) -> Option<Instant> {
        self.last_host_warning
    }
}
