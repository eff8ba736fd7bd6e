//! # hitch-cni
//!
//! CNI plugin attaching containers to Linux bridge, Open vSwitch and routed
//! networks, plus the monitor that keeps their ebtables rules in place.
//!
//! The `hitch-cni` binary reads the CNI environment and the network
//! configuration on stdin, runs one [`plugin::NetPlugin`] command under the
//! state lock and prints the result. The `hitch-netmon` binary runs
//! [`monitor::reconcile_once`] on an interval.

#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod ipam;
pub mod logging;
pub mod monitor;
pub mod plugin;
pub mod request;
pub mod result;

pub use config::{NetConf, PluginConfig};
pub use ipam::{DelegatedIpam, Ipam};
pub use plugin::NetPlugin;
pub use request::{CniArgs, CniCommand, PluginRequest};
pub use result::{CniError, CniResult, VersionResult};

/// Process name of the plugin binary.
pub const PLUGIN_NAME: &str = "hitch-cni";

/// Process name of the network monitor binary.
pub const MONITOR_NAME: &str = "hitch-netmon";
