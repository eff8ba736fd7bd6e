//! # hitch-network
//!
//! Bridge, endpoint and forwarding-rule management for Hitch.
//!
//! The [`NetworkManager`] owns the network and endpoint state. It attaches
//! host uplinks to a Linux bridge or an Open vSwitch bridge through a
//! [`network::NetworkClient`], and plumbs container interfaces through an
//! [`endpoint::EndpointClient`] chosen per endpoint. Every kernel change goes
//! through a [`ControlPlane`], so the whole engine runs against the in-memory
//! host in `fake` under test.

#![warn(missing_docs)]

pub mod ebtables;
pub mod endpoint;
pub mod exec;
pub mod iptables;
pub mod link;
pub mod manager;
pub mod netns;
pub mod network;
pub mod ovsctl;
pub mod reconcile;
pub mod types;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

use std::sync::Arc;

pub use exec::{CommandOutput, ControlPlane, HostCommand, ShellControlPlane};
pub use manager::{NetworkManager, NetworkState};
pub use netns::{KernelNamespaces, Namespace, NamespaceGuard, NamespaceSwitcher};
pub use reconcile::RuleReconciler;
pub use types::{
    DnsConfig, Endpoint, EndpointInfo, ExternalInterface, Network, NetworkInfo, NetworkMode, Route,
};

/// Handles to the host the engine programs.
#[derive(Clone)]
pub struct HostContext {
    /// Runs link, rule and switch commands.
    pub control_plane: Arc<dyn ControlPlane>,
    /// Opens and switches network namespaces.
    pub namespaces: Arc<dyn NamespaceSwitcher>,
}

impl HostContext {
    /// The real host: shell commands and `setns(2)`.
    #[must_use]
    pub fn system() -> Self {
        Self {
            control_plane: Arc::new(ShellControlPlane),
            namespaces: Arc::new(KernelNamespaces),
        }
    }

    /// Build a context from explicit parts.
    #[must_use]
    pub fn new(control_plane: Arc<dyn ControlPlane>, namespaces: Arc<dyn NamespaceSwitcher>) -> Self {
        Self {
            control_plane,
            namespaces,
        }
    }
}

impl std::fmt::Debug for HostContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostContext").finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "testing"))]
impl HostContext {
    /// Context backed by a single in-memory host.
    #[must_use]
    pub fn fake(host: &Arc<fake::FakeHost>) -> Self {
        Self {
            control_plane: host.clone(),
            namespaces: host.clone(),
        }
    }
}
