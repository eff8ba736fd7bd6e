//! # hitch-common
//!
//! Shared utilities and types for the Hitch container networking plugins.
//!
//! This crate provides common functionality used across all Hitch crates:
//! - Error taxonomy
//! - MAC addresses and endpoint IDs
//! - Standard filesystem paths
//! - The persistent, lockable state store
//! - Telemetry sinks

#![warn(missing_docs)]

pub mod error;
pub mod id;
pub mod paths;
pub mod store;
pub mod telemetry;

pub use error::{HitchError, HitchResult};
pub use id::MacAddress;
pub use paths::HitchPaths;
pub use store::{JsonFileStore, KeyValueStore};
pub use telemetry::{Metric, Report, TelemetrySink};
