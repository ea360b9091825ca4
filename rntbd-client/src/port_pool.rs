//! Local source-port reuse.
//!
//! Busy hosts can run out of ephemeral ports. A port pool hands out local
//! ports that may be bound with address reuse and shared by connections to
//! different remote endpoints.

use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;

/// Address family of a local port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::V4,
            SocketAddr::V6(_) => AddressFamily::V6,
        }
    }
}

/// Source of candidate local ports.
pub trait UserPortPool: Send + Sync {
    /// Ports worth trying, in order.
    fn candidate_ports(&self, family: AddressFamily) -> Vec<u16>;

    /// A connection is now bound to `port`.
    fn add_reference(&self, family: AddressFamily, port: u16);

    /// A connection bound to `port` was disposed.
    fn remove_reference(&self, family: AddressFamily, port: u16);

    /// `port` cannot be bound on this host.
    fn mark_unusable(&self, family: AddressFamily, port: u16);
}

#[derive(Debug, Default)]
struct FamilyPorts {
    references: HashMap<u16, usize>,
    unusable: BTreeSet<u16>,
}

/// In-memory reference-counted pool.
///
/// Candidates are the ports already holding references, in ascending order,
/// so new connections reuse known good ports before the OS assigns fresh ones.
#[derive(Debug, Default)]
pub struct SimplePortPool {
    families: Mutex<HashMap<AddressFamily, FamilyPorts>>,
    max_references: Option<usize>,
}

impl SimplePortPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stops offering a port once this many connections share it.
    pub fn with_max_references(mut self, max: usize) -> Self {
        self.max_references = Some(max);
        self
    }

    pub fn reference_count(&self, family: AddressFamily, port: u16) -> usize {
        self.families
            .lock()
            .get(&family)
            .and_then(|ports| ports.references.get(&port).copied())
            .unwrap_or(0)
    }

    pub fn is_unusable(&self, family: AddressFamily, port: u16) -> bool {
        self.families
            .lock()
            .get(&family)
            .is_some_and(|ports| ports.unusable.contains(&port))
    }
}

impl UserPortPool for SimplePortPool {
    fn candidate_ports(&self, family: AddressFamily) -> Vec<u16> {
        let families = self.families.lock();
        let Some(ports) = families.get(&family) else {
            return Vec::new();
        };
        let mut candidates: Vec<u16> = ports
            .references
            .iter()
            .filter(|(port, count)| {
                !ports.unusable.contains(*port)
                    && self.max_references.map_or(true, |max| **count < max)
            })
            .map(|(port, _)| *port)
            .collect();
        candidates.sort_unstable();
        candidates
    }

    fn add_reference(&self, family: AddressFamily, port: u16) {
        let mut families = self.families.lock();
        *families
            .entry(family)
            .or_default()
            .references
            .entry(port)
            .or_insert(0) += 1;
    }

    fn remove_reference(&self, family: AddressFamily, port: u16) {
        let mut families = self.families.lock();
        let Some(ports) = families.get_mut(&family) else {
            return;
        };
        if let Some(count) = ports.references.get_mut(&port) {
            *count -= 1;
            if *count == 0 {
                ports.references.remove(&port);
            }
        }
    }

    fn mark_unusable(&self, family: AddressFamily, port: u16) {
        let mut families = self.families.lock();
        let ports = families.entry(family).or_default();
        ports.unusable.insert(port);
        tracing::debug!("local port {} ({:?}) marked unusable", port, family);
    }
}
