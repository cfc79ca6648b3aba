//! Free port discovery on the loopback interfaces.
//!
//! A candidate is usable when it is not well-known, not on the restricted
//! list and can be bound on both `127.0.0.1` and `::1`. Probes bind and drop
//! immediately; nothing is reserved, so another process may still grab the
//! port before the companion does.

use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

/// Number of consecutive ports probed before giving up.
pub const MAX_PORT_ATTEMPTS: u16 = 100;

/// Ports browsers refuse to talk HTTP to. Sorted for binary search.
const RESTRICTED_PORTS: &[u16] = &[
    1, 7, 9, 11, 13, 15, 17, 19, 20, 21, 22, 23, 25, 37, 42, 43, 53, 69, 77, 79, 87, 95, 101, 102,
    103, 104, 109, 110, 111, 113, 115, 117, 119, 123, 135, 137, 139, 143, 161, 179, 389, 427, 465,
    512, 513, 514, 515, 526, 530, 531, 532, 540, 548, 554, 556, 563, 587, 601, 636, 989, 990, 993,
    995, 1719, 1720, 1723, 2049, 3659, 4045, 5060, 5061, 6000, 6566, 6665, 6666, 6667, 6668, 6669,
    6697, 10080,
];

/// Ports below 1024 need elevated privileges on most systems.
pub fn is_well_known(port: u16) -> bool {
    port < 1024
}

pub fn is_restricted(port: u16) -> bool {
    RESTRICTED_PORTS.binary_search(&port).is_ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Probe {
    Free,
    InUse,
    /// The address family or loopback address does not exist on this host.
    Unsupported,
}

#[derive(Debug, Clone)]
pub struct PortAllocator {
    max_attempts: u16,
}

impl Default for PortAllocator {
    fn default() -> Self {
        Self {
            max_attempts: MAX_PORT_ATTEMPTS,
        }
    }
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocator probing at most `max_attempts` ports. Zero disables probing,
    /// so every preferred port is used as is.
    pub fn with_max_attempts(max_attempts: u16) -> Self {
        Self { max_attempts }
    }

    /// Finds the first usable port at or after `preferred`.
    /// Falls back to `preferred` itself when nothing is found.
    pub fn find_available(&self, preferred: u16) -> u16 {
        self.find_available_excluding(preferred, &[])
    }

    /// Same as [`find_available`](Self::find_available) but also skips ports
    /// already claimed by the caller.
    pub fn find_available_excluding(&self, preferred: u16, claimed: &[u16]) -> u16 {
        tracing::debug!("Finding port starting from {}", preferred);

        for offset in 0..self.max_attempts {
            let candidate = match preferred.checked_add(offset) {
                Some(port) => port,
                None => break,
            };
            if claimed.contains(&candidate) {
                continue;
            }
            if self.is_port_available(candidate) {
                if candidate != preferred {
                    tracing::info!("Port {} was in use, using {} instead", preferred, candidate);
                } else {
                    tracing::info!("Using port {}", candidate);
                }
                return candidate;
            }
        }

        tracing::warn!(
            "Could not find an available port after {} attempts, using {} anyway",
            self.max_attempts,
            preferred
        );
        preferred
    }

    pub fn is_port_available(&self, port: u16) -> bool {
        if port == 0 || is_well_known(port) || is_restricted(port) {
            return false;
        }

        // Both loopbacks must be free; a missing IPv6 stack is not a conflict.
        let v4 = probe(SocketAddr::from((Ipv4Addr::LOCALHOST, port)));
        if v4 != Probe::Free {
            return false;
        }
        let v6 = probe(SocketAddr::from((Ipv6Addr::LOCALHOST, port)));
        v6 != Probe::InUse
    }
}

fn probe(addr: SocketAddr) -> Probe {
    let socket = match Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP)) {
        Ok(socket) => socket,
        Err(e) => {
            tracing::debug!("Cannot create socket for {}: {}", addr, e);
            return Probe::Unsupported;
        }
    };

    if addr.is_ipv6() {
        let _ = socket.set_only_v6(true);
    }
    // Matches what a listening server sets, so TIME_WAIT leftovers don't count as busy.
    #[cfg(unix)]
    let _ = socket.set_reuse_address(true);

    match socket.bind(&addr.into()).and_then(|_| socket.listen(1)) {
        Ok(()) => Probe::Free,
        Err(e) if e.kind() == io::ErrorKind::AddrNotAvailable => Probe::Unsupported,
        Err(e) => {
            tracing::trace!("Port probe on {} failed: {}", addr, e);
            Probe::InUse
        }
    }
}
