//! # daq-scan
//!
//! Generic step-scan engine for motorized data acquisition.
//!
//! A scan moves one or more motors through an N-dimensional grid of
//! positions, takes a measurement from a set of input devices at every
//! point and streams the readings to a datafile and a live plot. Pauses
//! and aborts can be requested at any time; the engine retries the
//! interrupted step or unwinds cleanly.
//!
//! ## Crate Structure
//!
//! - **`config`**: Scan descriptions loaded from TOML with `figment`.
//! - **`settings`**: Application settings and simulated devices.
//! - **`hardware`**: Capability traits for motors, triggerable devices,
//!   inputs, relays and digital outputs, plus mock implementations.
//! - **`records`**: Name lookup of devices and of running parent scans.
//! - **`interrupt`**: Pause/abort flag and pause handlers.
//! - **`retry`**: Retry-on-pause wrapper used around moves and acquisitions.
//! - **`measurement`**: How one data point is acquired.
//! - **`permit`**: Permit and fault handler lists.
//! - **`sink`**: Datafile and plot outputs.
//! - **`registry`**: Driver tables for every pluggable class.
//! - **`coordinator`**: Motion, acquisition and readout of one line.
//! - **`walker`**: Enumeration of the outer dimensions.
//! - **`xafs`**: Multi-region XAFS scans built from child linear scans.
//! - **`engine`**: Scan setup, repeats and teardown.
//! - **`logging`**: Tracing subscriber setup.
//! - **`error`**: `ScanError` and its numeric codes.

pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod interrupt;
pub mod logging;
pub mod measurement;
pub mod permit;
pub mod records;
pub mod registry;
pub mod retry;
pub mod settings;
pub mod sink;
pub mod walker;
pub mod xafs;

pub use config::ScanConfig;
pub use engine::{ScanEngine, ScanOutcome, ScanReport};
pub use error::{ScanError, ScanResult};
pub use records::Records;
pub use registry::DriverRegistry;
