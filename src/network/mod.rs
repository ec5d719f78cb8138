//! # Network Module - Discovery and Connection Upkeep
//!
//! The live view of which dispensers are reachable right now, and the jobs that
//! keep it current:
//!
//! - [`scanner`] probes every host of a /24 concurrently and returns the devices
//!   that identified themselves.
//! - [`reconcile`] folds a scan into the connection table, and owns explicit
//!   connect-by-address plus the bounded reconnect budget.
//! - [`health`] re-probes table entries on a fixed period, single-flight, and is
//!   suppressed by a cooldown while dispensing is under way.
//! - [`table`] is the connection table itself.
//!
//! None of these touch disk directly; registry updates go through
//! [`crate::storage::IdentityRegistry`], which persists itself.

pub mod health;
pub mod reconcile;
pub mod scanner;
pub mod table;

use std::fmt;
use std::net::{Ipv4Addr, UdpSocket};
use std::str::FromStr;
use thiserror::Error;

pub use health::{Cooldown, HealthMonitor, HealthReport};
pub use reconcile::{connect_by_address, reconcile, ReconcileOutcome, ReconnectTracker};
pub use scanner::{scan_addresses, scan_subnet, ScanHit, ScanMap};
pub use table::{ConnectionEntry, ConnectionStatus, ConnectionTable};

use crate::device::TransportError;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("device {0} is not registered")]
    UnknownDevice(String),
    #[error("no network address known for device {0}")]
    NoNetworkAddress(String),
    #[error("address answered as {found}, expected {expected}")]
    IdentityMismatch { expected: String, found: String },
    #[error("device did not report a hardware address")]
    MissingIdentity,
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// First three octets of a /24 network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubnetPrefix([u8; 3]);

impl SubnetPrefix {
    pub fn new(a: u8, b: u8, c: u8) -> Self {
        Self([a, b, c])
    }

    /// Every usable host address in the /24, `.1` through `.254`.
    pub fn hosts(&self) -> impl Iterator<Item = String> + '_ {
        (1u8..=254).map(move |h| self.host(h))
    }

    pub fn host(&self, last: u8) -> String {
        format!("{}.{}.{}.{}", self.0[0], self.0[1], self.0[2], last)
    }

    /// Prefix of the host's primary IPv4 address. The UDP socket is only used
    /// to ask the routing table which source address would be chosen; nothing
    /// is sent.
    pub fn detect() -> Option<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).ok()?;
        socket.connect((Ipv4Addr::new(8, 8, 8, 8), 80)).ok()?;
        match socket.local_addr().ok()?.ip() {
            std::net::IpAddr::V4(ip) if !ip.is_unspecified() && !ip.is_loopback() => {
                let o = ip.octets();
                Some(Self([o[0], o[1], o[2]]))
            }
            _ => None,
        }
    }
}

impl fmt::Display for SubnetPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("'{0}' is not a /24 prefix like 192.168.1")]
pub struct PrefixParseError(String);

impl FromStr for SubnetPrefix {
    type Err = PrefixParseError;

    /// Accepts `192.168.1`, `192.168.1.` and `192.168.1.0/24`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || PrefixParseError(s.to_string());
        let trimmed = s.trim();
        let body = match trimmed.strip_suffix("/24") {
            Some(net) => net.strip_suffix(".0").ok_or_else(err)?,
            None => trimmed.strip_suffix('.').unwrap_or(trimmed),
        };
        let parts: Vec<&str> = body.split('.').collect();
        if parts.len() != 3 {
            return Err(err());
        }
        let mut octets = [0u8; 3];
        for (slot, part) in octets.iter_mut().zip(&parts) {
            *slot = part.parse().map_err(|_| err())?;
        }
        Ok(Self(octets))
    }
}
