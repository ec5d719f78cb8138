//! # Syrupnet - Networked Syrup Dispenser Coordinator
//!
//! Syrupnet finds liquid-medicine dispensers on the local /24, keeps track of
//! which ones are reachable, reads prescription exports from a watched
//! directory and sends each prescribed item to the dispenser bound to its code.
//!
//! ## Features
//!
//! - **Discovery**: concurrent identity probes across the subnet, reconciled into
//!   a live connection table with a bounded reconnect budget.
//! - **Health Monitoring**: periodic single-flight re-probing that never touches a
//!   device mid-dispense and pauses entirely while dispensing is under way.
//! - **Dispensing**: parallel per-item dispatch with per-item status, retry of
//!   failed or selected items, and a per-item volume ceiling.
//! - **Ingestion**: legacy Korean code-page or UTF-8 text exports, or XML orders.
//! - **Restart Safety**: identity bindings and transmission status are written
//!   through to JSON files under the data directory, with tar.gz backups.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use syrupnet::config::Config;
//! use syrupnet::device::HttpTransport;
//! use syrupnet::service::Coordinator;
//! use syrupnet::storage::Storage;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.toml").await?;
//!     let storage = Storage::open(&config.storage.data_dir)?;
//!     let transport = Arc::new(HttpTransport::new(
//!         config.network.device_port,
//!         config.network.probe_timeout(),
//!         config.dispense.request_timeout(),
//!     )?);
//!
//!     let mut coordinator = Coordinator::new(config, storage, transport)?;
//!     coordinator.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`device`] - Device wire contract, address normalization and HTTP transport
//! - [`network`] - Subnet scanner, connection table, reconciler and health monitor
//! - [`dispense`] - Per-item dispatch state machine and batch reports
//! - [`prescription`] - Encoding detection, parsing and directory ingestion
//! - [`storage`] - Identity registry, status store, settings files and backups
//! - [`fleet`] - Shared state behind one lock
//! - [`service`] - Coordinator loop and auto-dispatch queue
//! - [`config`] - Configuration management and validation
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────┐
//! │   Coordinator   │ ← Ticks, auto-dispatch, shutdown
//! └─────────────────┘
//!     │         │
//! ┌────────┐ ┌──────────┐
//! │Network │ │ Dispense │ ← Discovery / health, item dispatch
//! └────────┘ └──────────┘
//!     │         │
//! ┌─────────────────┐
//! │  Fleet + Store  │ ← Registry, connection table, status (persisted)
//! └─────────────────┘
//! ```

pub mod config;
pub mod device;
pub mod dispense;
pub mod fleet;
pub mod logutil;
pub mod metrics;
pub mod network;
pub mod prescription;
pub mod service;
pub mod storage;
