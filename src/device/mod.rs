//! # Device Module - Dispenser Wire Contract
//!
//! Everything the rest of the crate knows about a physical dispenser lives here:
//! how its hardware address is canonicalised, what its identity endpoint returns,
//! how a dispense command is encoded, and how transport failures are classified.
//!
//! ## Wire contract
//!
//! ```text
//! GET  /          -> 200 {"hardwareAddress": "AA:BB:CC:DD:EE:FF", "status": "ready"}
//! POST /dispense  <- {"amount": "TV50 FF FF FF"}
//!                 -> 200 accepted, anything else is a failure
//! ```
//!
//! Older firmware reports the hardware address under `mac`; both spellings are
//! accepted. A missing `status` means `ready`.
//!
//! ## Transport seam
//!
//! [`DeviceTransport`] is the only way the discovery, health and dispatch code
//! talks to devices. [`http::HttpTransport`] is the production implementation;
//! tests substitute an in-memory transport.

pub mod http;
#[cfg(test)]
pub mod mock;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub use http::HttpTransport;

/// Status string a device reports when idle.
pub const READY_STATUS: &str = "ready";

/// Canonicalise a hardware address: separators stripped, letters uppercased.
///
/// `AA:bb-CC.dd ee:FF` and `aabbccddeeff` both become `AABBCCDDEEFF`.
/// The function is idempotent.
pub fn normalize_address(raw: &str) -> String {
    raw.chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// Self-reported identity returned by `GET /`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityReport {
    #[serde(
        rename = "hardwareAddress",
        alias = "mac",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub hardware_address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl IdentityReport {
    pub fn new(hardware_address: &str) -> Self {
        Self {
            hardware_address: Some(hardware_address.to_string()),
            status: Some(READY_STATUS.to_string()),
        }
    }

    /// Normalised hardware address, if the device reported a non-empty one.
    pub fn normalized_address(&self) -> Option<String> {
        self.hardware_address
            .as_deref()
            .map(normalize_address)
            .filter(|a| !a.is_empty())
    }

    /// Reported status; absence means `ready`.
    pub fn status(&self) -> &str {
        self.status.as_deref().unwrap_or(READY_STATUS)
    }

    /// A response counts as a device only if it names a hardware address or
    /// explicitly reports `ready`.
    pub fn is_acceptable(&self) -> bool {
        self.normalized_address().is_some()
            || self.status.as_deref().map(|s| s.eq_ignore_ascii_case(READY_STATUS)) == Some(true)
    }
}

/// Body of `POST /dispense`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispenseRequest {
    pub amount: String,
}

impl DispenseRequest {
    pub fn for_quantity(total_quantity: u32) -> Self {
        Self {
            amount: format!("TV{} FF FF FF", total_quantity),
        }
    }
}

/// Why a single item or device operation failed. Persisted with item status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    Timeout,
    Refused,
    Unreachable,
    /// Device answered with a non-success status.
    Rejected,
    NotConnected,
    OverLimit,
    /// Quantity read as zero, so there is nothing to send.
    NoQuantity,
    /// A run was cut short by a restart while the item was in flight.
    Interrupted,
    Other,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            FailureReason::Timeout => "timeout",
            FailureReason::Refused => "connection refused",
            FailureReason::Unreachable => "host unreachable",
            FailureReason::Rejected => "rejected by device",
            FailureReason::NotConnected => "device not connected",
            FailureReason::OverLimit => "over volume limit",
            FailureReason::NoQuantity => "no quantity",
            FailureReason::Interrupted => "interrupted",
            FailureReason::Other => "communication error",
        };
        f.write_str(text)
    }
}

/// Transport-class failures talking to one device.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out")]
    Timeout,
    #[error("connection refused")]
    Refused,
    #[error("host unreachable")]
    Unreachable,
    #[error("device answered with status {0}")]
    Status(u16),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("transport error: {0}")]
    Other(String),
}

impl TransportError {
    pub fn reason(&self) -> FailureReason {
        match self {
            TransportError::Timeout => FailureReason::Timeout,
            TransportError::Refused => FailureReason::Refused,
            TransportError::Unreachable => FailureReason::Unreachable,
            TransportError::Status(_) => FailureReason::Rejected,
            TransportError::Malformed(_) | TransportError::Other(_) => FailureReason::Other,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::Timeout)
    }
}

/// Network access to dispensers, keyed by network address (`host` or `host:port`).
#[async_trait]
pub trait DeviceTransport: Send + Sync {
    /// Ask a device who it is (`GET /`).
    async fn probe(&self, network_address: &str) -> Result<IdentityReport, TransportError>;

    /// Send one dispense command (`POST /dispense`). `Ok` only on HTTP 200.
    async fn dispense(&self, network_address: &str, total_quantity: u32)
        -> Result<(), TransportError>;
}
