//! Common error types for the Hitch plugins.

use miette::Diagnostic;
use thiserror::Error;

/// Result type alias using [`HitchError`].
pub type HitchResult<T> = Result<T, HitchError>;

/// Errors raised while provisioning container networks.
#[derive(Error, Diagnostic, Debug)]
pub enum HitchError {
    /// An endpoint with the same ID already exists in the network.
    #[error("Endpoint {endpoint} already exists in network {network}")]
    #[diagnostic(
        code(hitch::endpoint::duplicate),
        help("Delete the existing endpoint before adding it again")
    )]
    DuplicateEndpoint {
        /// The network ID.
        network: String,
        /// The endpoint ID.
        endpoint: String,
    },

    /// Endpoint not found.
    #[error("Endpoint {endpoint} not found in network {network}")]
    #[diagnostic(code(hitch::endpoint::not_found))]
    EndpointNotFound {
        /// The network ID.
        network: String,
        /// The endpoint ID.
        endpoint: String,
    },

    /// Network not found.
    #[error("Network not found: {id}")]
    #[diagnostic(code(hitch::network::not_found))]
    NetworkNotFound {
        /// The network ID that was not found.
        id: String,
    },

    /// Network already exists.
    #[error("Network already exists: {id}")]
    #[diagnostic(code(hitch::network::exists))]
    NetworkExists {
        /// The network ID.
        id: String,
    },

    /// Network still has active endpoints.
    #[error("Network {id} still has {count} active endpoint(s)")]
    #[diagnostic(
        code(hitch::network::in_use),
        help("Delete all endpoints in the network before deleting it")
    )]
    NetworkHasEndpoints {
        /// The network ID.
        id: String,
        /// Number of remaining endpoints.
        count: usize,
    },

    /// Unknown network mode.
    #[error("Invalid network mode: {mode}")]
    #[diagnostic(
        code(hitch::network::invalid_mode),
        help("Supported modes are 'bridge', 'tunnel' and 'transparent'")
    )]
    InvalidNetworkMode {
        /// The rejected mode.
        mode: String,
    },

    /// The kernel refused to create an interface.
    #[error("Failed to create interface {name}: {reason}")]
    #[diagnostic(code(hitch::interface::create_failed))]
    InterfaceCreationFailed {
        /// Interface name.
        name: String,
        /// Underlying failure.
        reason: String,
    },

    /// A forwarding rule could not be programmed.
    #[error("Failed to program rule '{rule}': {reason}")]
    #[diagnostic(code(hitch::rule::programming_failed))]
    RuleProgrammingFailed {
        /// The rule text.
        rule: String,
        /// Underlying failure.
        reason: String,
    },

    /// A network namespace could not be opened, entered or exited.
    #[error("Namespace {operation} failed for {path}: {reason}")]
    #[diagnostic(code(hitch::namespace::failed))]
    NamespaceOperationFailed {
        /// The namespace operation (open, enter, exit).
        operation: String,
        /// Namespace path.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// The host interface a network needs is missing or unusable.
    #[error("External interface unavailable: {name}")]
    #[diagnostic(
        code(hitch::interface::external_unavailable),
        help("Check that the host interface exists and carries an address in the network subnet")
    )]
    ExternalInterfaceUnavailable {
        /// Interface name or subnet that was searched for.
        name: String,
    },

    /// The state store lock could not be acquired.
    #[error("Failed to acquire lock {path}: {reason}")]
    #[diagnostic(code(hitch::store::lock_failed))]
    LockAcquisitionFailed {
        /// Lock file path.
        path: String,
        /// Underlying failure.
        reason: String,
    },

    /// A host command exited unsuccessfully.
    #[error("Command '{command}' failed (status {status:?}): {stderr}")]
    #[diagnostic(code(hitch::kernel::command_failed))]
    KernelCommandFailed {
        /// The rendered command line.
        command: String,
        /// Exit status, if the process exited normally.
        status: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// A key is not present in the state store.
    #[error("State key not found: {key}")]
    #[diagnostic(code(hitch::store::not_found))]
    StateNotFound {
        /// The missing key.
        key: String,
    },

    /// I/O error.
    #[error("I/O error: {0}")]
    #[diagnostic(code(hitch::io))]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    #[diagnostic(code(hitch::serialization))]
    Serialization(String),

    /// Feature not supported on this platform.
    #[error("Feature not supported: {feature}")]
    #[diagnostic(code(hitch::unsupported))]
    Unsupported {
        /// The unsupported feature.
        feature: String,
    },

    /// Configuration error.
    #[error("Configuration error: {message}")]
    #[diagnostic(code(hitch::config))]
    Config {
        /// The error message.
        message: String,
    },

    /// Internal error (should not happen).
    #[error("Internal error: {message}")]
    #[diagnostic(
        code(hitch::internal),
        help("This is a bug, please report it at https://github.com/hitch-net/hitch/issues")
    )]
    Internal {
        /// The error message.
        message: String,
    },
}

impl HitchError {
    /// CNI error code reported to the container runtime.
    ///
    /// Codes below 100 are reserved by the CNI specification; plugin specific
    /// failures use the 100+ range.
    #[must_use]
    pub const fn cni_code(&self) -> u32 {
        match self {
            Self::Config { .. } | Self::InvalidNetworkMode { .. } => 7,
            Self::Serialization(_) => 6,
            Self::Unsupported { .. } => 4,
            Self::DuplicateEndpoint { .. } => 100,
            Self::EndpointNotFound { .. } | Self::NetworkNotFound { .. } => 101,
            Self::NetworkExists { .. } | Self::NetworkHasEndpoints { .. } => 102,
            Self::InterfaceCreationFailed { .. } => 103,
            Self::RuleProgrammingFailed { .. } => 104,
            Self::NamespaceOperationFailed { .. } => 105,
            Self::ExternalInterfaceUnavailable { .. } => 106,
            Self::LockAcquisitionFailed { .. } => 107,
            Self::KernelCommandFailed { .. } => 108,
            Self::StateNotFound { .. } | Self::Io(_) | Self::Internal { .. } => 999,
        }
    }

    /// Returns true for errors that mean "the thing is already gone".
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::EndpointNotFound { .. } | Self::NetworkNotFound { .. } | Self::StateNotFound { .. }
        )
    }
}

impl From<serde_json::Error> for HitchError {
    fn from(err: serde_json::Error) -> Self {
        HitchError::Serialization(err.to_string())
    }
}
