//! Command line definitions and handlers.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use color_eyre::eyre::Result;
use hitch_common::{HitchError, HitchPaths, HitchResult, JsonFileStore};
use hitch_network::{HostContext, RuleReconciler};
use serde::Serialize;
use tokio::io::AsyncReadExt;

use crate::config::{DEFAULT_CNI_VERSION, PluginConfig};
use crate::ipam::DelegatedIpam;
use crate::logging::{self, LogFormat, LogTarget};
use crate::monitor;
use crate::plugin::NetPlugin;
use crate::request::{CniArgs, CniCommand, PluginRequest, split_plugin_paths};
use crate::result::{CniError, CniResult, VersionResult};

/// Hitch CNI plugin
///
/// Reads the operation from the CNI_* environment and the network
/// configuration from stdin, and prints the result as JSON.
#[derive(Parser)]
#[command(name = "hitch-cni")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Root directory for hitch state and logs
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Write telemetry reports to the log directory
    #[arg(long, env = "HITCH_TELEMETRY")]
    pub telemetry: bool,

    /// Operation to run
    #[arg(long, env = "CNI_COMMAND", value_enum, ignore_case = true)]
    pub command: Option<CniCommand>,

    /// Container ID
    #[arg(long, env = "CNI_CONTAINERID", default_value = "")]
    pub container_id: String,

    /// Container network namespace path
    #[arg(long, env = "CNI_NETNS")]
    pub netns: Option<PathBuf>,

    /// Interface name inside the container
    #[arg(long, env = "CNI_IFNAME", default_value = "eth0")]
    pub if_name: String,

    /// Extra arguments, `KEY=VALUE` pairs separated by `;`
    #[arg(long, env = "CNI_ARGS", default_value = "")]
    pub cni_args: String,

    /// Directories searched for delegated plugins
    #[arg(long, env = "CNI_PATH", default_value = "")]
    pub cni_path: String,
}

impl Cli {
    /// Plugin settings from the flags.
    #[must_use]
    pub fn plugin_config(&self) -> PluginConfig {
        let config = PluginConfig::default().with_telemetry(self.telemetry);
        match &self.root {
            Some(root) => config.with_root(root),
            None => config,
        }
    }

    /// Install the subscriber. Logs go to a file since stdout carries the
    /// result.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber cannot be installed.
    pub fn init_logging(&self) -> Result<()> {
        let log_file = self.plugin_config().paths.logs().join("hitch-cni.log");
        logging::init(LogTarget::File(&log_file), self.debug, self.log_format)
    }

    fn request(&self, command: CniCommand, stdin: Vec<u8>) -> HitchResult<PluginRequest> {
        Ok(PluginRequest {
            command,
            container_id: self.container_id.clone(),
            netns: self.netns.clone().filter(|p| !p.as_os_str().is_empty()),
            if_name: self.if_name.clone(),
            args: self.cni_args.parse::<CniArgs>()?,
            plugin_paths: split_plugin_paths(&self.cni_path),
            stdin,
        })
    }

    /// Execute the requested operation.
    ///
    /// Plugin failures are printed as a CNI error object and turned into a
    /// failing exit code.
    ///
    /// # Errors
    ///
    /// Returns an error only if stdin or stdout fail.
    pub async fn execute(self) -> Result<ExitCode> {
        let Some(command) = self.command else {
            let err = HitchError::Config {
                message: "CNI_COMMAND is not set".to_string(),
            };
            print_json(&CniError::new(DEFAULT_CNI_VERSION, &err))?;
            return Ok(ExitCode::FAILURE);
        };

        if command == CniCommand::Version {
            print_json(&VersionResult::default())?;
            return Ok(ExitCode::SUCCESS);
        }

        let mut stdin = Vec::new();
        tokio::io::stdin().read_to_end(&mut stdin).await?;
        let cni_version = cni_version_of(&stdin);
        tracing::debug!(%command, container_id = %self.container_id, if_name = %self.if_name, "Received request");

        let config = self.plugin_config();
        let outcome = match self.request(command, stdin) {
            // Namespace switches are per thread, so the whole command stays on one.
            Ok(request) => tokio::task::spawn_blocking(move || run(config, &request)).await?,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(Some(result)) => {
                print_json(&result)?;
                Ok(ExitCode::SUCCESS)
            }
            Ok(None) => Ok(ExitCode::SUCCESS),
            Err(e) => {
                tracing::error!(%command, error = %e, "Plugin command failed");
                print_json(&CniError::new(&cni_version, &e))?;
                Ok(ExitCode::FAILURE)
            }
        }
    }
}

/// Run a request against the real host.
///
/// # Errors
///
/// Returns the plugin's error.
pub fn run(config: PluginConfig, request: &PluginRequest) -> HitchResult<Option<CniResult>> {
    config.paths.create_dirs()?;
    let store = JsonFileStore::new(config.paths.state_file()).with_lock_timeout(config.lock_timeout);
    let telemetry = config.telemetry_sink();
    let mut plugin = NetPlugin::new(config, HostContext::system(), store, DelegatedIpam, telemetry);
    plugin.execute(request)
}

fn cni_version_of(stdin: &[u8]) -> String {
    serde_json::from_slice::<serde_json::Value>(stdin)
        .ok()
        .and_then(|conf| conf.get("cniVersion")?.as_str().map(ToString::to_string))
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| DEFAULT_CNI_VERSION.to_string())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}

/// Hitch network monitor
///
/// Periodically compares the ebtables rules with the recorded network state
/// and repairs rules that stay out of place.
#[derive(Parser)]
#[command(name = "hitch-netmon")]
#[command(author, version, about, long_about = None)]
pub struct MonitorCli {
    /// Root directory for hitch state and logs
    #[arg(long)]
    pub root: Option<PathBuf>,

    /// Seconds between passes
    #[arg(long, default_value_t = 10)]
    pub interval: u64,

    /// Also remove copies of our rules from the built-in chains
    #[arg(long)]
    pub monitor_all_chains: bool,

    /// Enable debug logging
    #[arg(long)]
    pub debug: bool,

    /// Log line format
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

impl MonitorCli {
    fn paths(&self) -> HitchPaths {
        self.root
            .as_ref()
            .map_or_else(HitchPaths::new, HitchPaths::with_root)
    }

    /// Install the subscriber, logging to stderr.
    ///
    /// # Errors
    ///
    /// Returns an error if the subscriber cannot be installed.
    pub fn init_logging(&self) -> Result<()> {
        logging::init(LogTarget::Stderr, self.debug, self.log_format)
    }

    /// Run passes until interrupted.
    ///
    /// # Errors
    ///
    /// Returns an error if the PID file cannot be written or a pass panics.
    pub async fn execute(self) -> Result<()> {
        let paths = self.paths();
        paths.create_dirs()?;
        let pid_file = paths.monitor_pid();
        monitor::write_pid_file(&pid_file)?;

        let host = HostContext::system();
        let mut store = JsonFileStore::new(paths.state_file());
        let mut reconciler = RuleReconciler::new(self.monitor_all_chains);
        let mut ticker = tokio::time::interval(Duration::from_secs(self.interval.max(1)));

        tracing::info!(
            interval = self.interval,
            monitor_all_chains = self.monitor_all_chains,
            "Network monitor started"
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let host = host.clone();
                    let (returned_store, returned_reconciler, outcome) = tokio::task::spawn_blocking(move || {
                        let outcome = monitor::reconcile_once(&mut store, &host, &mut reconciler);
                        (store, reconciler, outcome)
                    })
                    .await?;
                    store = returned_store;
                    reconciler = returned_reconciler;

                    match outcome {
                        Ok(summary) if summary.added + summary.deleted > 0 => {
                            tracing::info!(added = summary.added, deleted = summary.deleted, "Repaired ebtables rules");
                        }
                        Ok(_) => tracing::debug!("Rules in sync"),
                        Err(e) => tracing::warn!(error = %e, "Reconciliation pass failed"),
                    }
                }
                signal = tokio::signal::ctrl_c() => {
                    signal?;
                    tracing::info!("Network monitor stopping");
                    break;
                }
            }
        }

        if let Err(e) = std::fs::remove_file(&pid_file) {
            tracing::warn!(path = %pid_file.display(), error = %e, "Failed to remove PID file");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cli_reads_cni_flags() {
        let cli = Cli::try_parse_from([
            "hitch-cni",
            "--command",
            "add",
            "--container-id",
            "1a2b3c4d5e6f",
            "--netns",
            "/var/run/netns/c1",
            "--cni-args",
            "K8S_POD_NAMESPACE=default;K8S_POD_NAME=web-0",
            "--cni-path",
            "/opt/cni/bin",
            "--root",
            "/tmp/hitch",
        ])
        .unwrap();

        assert_eq!(cli.command, Some(CniCommand::Add));
        assert_eq!(cli.if_name, "eth0");
        assert_eq!(cli.plugin_config().paths.root, PathBuf::from("/tmp/hitch"));

        let request = cli.request(CniCommand::Add, Vec::new()).unwrap();
        assert_eq!(request.veth_key().as_deref(), Some("default.web-0"));
        assert_eq!(request.plugin_paths, vec![PathBuf::from("/opt/cni/bin")]);
        assert_eq!(request.netns, Some(PathBuf::from("/var/run/netns/c1")));
    }

    #[test]
    fn bad_cni_args_fail_the_request() {
        let cli = Cli::try_parse_from(["hitch-cni", "--command", "DEL", "--cni-args", "oops"]).unwrap();
        assert!(cli.request(CniCommand::Del, Vec::new()).is_err());
    }

    #[test]
    fn version_comes_from_config() {
        assert_eq!(cni_version_of(br#"{"cniVersion":"0.4.0","name":"n1"}"#), "0.4.0");
        assert_eq!(cni_version_of(b"garbage"), DEFAULT_CNI_VERSION);
        assert_eq!(cni_version_of(br#"{"cniVersion":""}"#), DEFAULT_CNI_VERSION);
    }

    #[test]
    fn monitor_defaults() {
        let cli = MonitorCli::try_parse_from(["hitch-netmon"]).unwrap();
        assert_eq!(cli.interval, 10);
        assert!(!cli.monitor_all_chains);

        let cli = MonitorCli::try_parse_from(["hitch-netmon", "--interval", "30", "--monitor-all-chains", "--root", "/data"]).unwrap();
        assert_eq!(cli.interval, 30);
        assert!(cli.monitor_all_chains);
        assert_eq!(cli.paths().runtime, PathBuf::from("/data/run"));
    }
}
