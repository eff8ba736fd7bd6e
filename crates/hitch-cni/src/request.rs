//! A single plugin invocation as described by the CNI environment.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use clap::ValueEnum;
use hitch_common::{HitchError, HitchResult, id};

/// Operation requested through `CNI_COMMAND`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
#[value(rename_all = "UPPER")]
pub enum CniCommand {
    /// Attach a container to a network.
    Add,
    /// Detach a container.
    Del,
    /// Refresh settings of an attached container.
    Update,
    /// Report the stored attachment.
    Get,
    /// Report supported CNI versions.
    Version,
}

impl CniCommand {
    /// Command name as it appears in `CNI_COMMAND`.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "ADD",
            Self::Del => "DEL",
            Self::Update => "UPDATE",
            Self::Get => "GET",
            Self::Version => "VERSION",
        }
    }
}

impl fmt::Display for CniCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Key for a stable host interface name: `K8S_POD_NAMESPACE.K8S_POD_NAME`.
const POD_NAMESPACE: &str = "K8S_POD_NAMESPACE";
const POD_NAME: &str = "K8S_POD_NAME";

/// Parsed `CNI_ARGS`: `KEY=VALUE` pairs separated by `;`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CniArgs {
    raw: String,
    pairs: BTreeMap<String, String>,
}

impl CniArgs {
    /// Value of `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs.get(key).map(String::as_str)
    }

    /// The string as passed in.
    #[must_use]
    pub fn as_raw(&self) -> &str {
        &self.raw
    }

    /// `namespace.pod` when both Kubernetes keys are set.
    #[must_use]
    pub fn pod_key(&self) -> Option<String> {
        let namespace = self.get(POD_NAMESPACE).filter(|s| !s.is_empty())?;
        let pod = self.get(POD_NAME).filter(|s| !s.is_empty())?;
        Some(format!("{namespace}.{pod}"))
    }
}

impl FromStr for CniArgs {
    type Err = HitchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut pairs = BTreeMap::new();
        for fragment in s.split(';').map(str::trim).filter(|f| !f.is_empty()) {
            let Some((key, value)) = fragment.split_once('=') else {
                return Err(HitchError::Config {
                    message: format!("invalid CNI_ARGS pair: {fragment}"),
                });
            };
            pairs.insert(key.trim().to_string(), value.trim().to_string());
        }

        Ok(Self {
            raw: s.to_string(),
            pairs,
        })
    }
}

/// Everything the runtime handed to one invocation.
#[derive(Debug, Clone)]
pub struct PluginRequest {
    /// Requested operation.
    pub command: CniCommand,
    /// Container ID.
    pub container_id: String,
    /// Container network namespace path.
    pub netns: Option<PathBuf>,
    /// Interface name inside the container.
    pub if_name: String,
    /// Extra arguments.
    pub args: CniArgs,
    /// Directories searched for delegated plugins.
    pub plugin_paths: Vec<PathBuf>,
    /// Raw network configuration.
    pub stdin: Vec<u8>,
}

impl PluginRequest {
    /// Endpoint ID of the container interface.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::Config`] if the container ID is empty.
    pub fn endpoint_id(&self) -> HitchResult<String> {
        id::endpoint_id(&self.container_id, &self.if_name)
    }

    /// Key that keeps host interface names stable across pod restarts.
    #[must_use]
    pub fn veth_key(&self) -> Option<String> {
        self.args.pod_key()
    }
}

/// Split a `CNI_PATH` value into directories.
#[must_use]
pub fn split_plugin_paths(value: &str) -> Vec<PathBuf> {
    std::env::split_paths(value)
        .filter(|p| !p.as_os_str().is_empty())
        .collect()
}
