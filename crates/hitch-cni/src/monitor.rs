//! Network monitor process management and its reconciliation tick.

use std::path::Path;
use std::process::{Command, Stdio};

use hitch_common::store::is_process_running;
use hitch_common::{HitchError, HitchPaths, HitchResult, KeyValueStore};
use hitch_network::reconcile::PassSummary;
use hitch_network::{HostContext, NetworkManager, RuleReconciler};

use crate::config::NetworkMonitorConf;

/// Whether the monitor recorded in `pid_file` is alive.
#[must_use]
pub fn is_monitor_running(pid_file: &Path, name: &str) -> bool {
    std::fs::read_to_string(pid_file)
        .ok()
        .and_then(|s| s.trim().parse::<u32>().ok())
        .is_some_and(|pid| is_process_running(pid, name))
}

/// Record the current process as the running monitor.
///
/// # Errors
///
/// Returns an error if the PID file cannot be written.
pub fn write_pid_file(pid_file: &Path) -> HitchResult<()> {
    if let Some(parent) = pid_file.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pid_file, std::process::id().to_string())?;
    Ok(())
}

/// Arguments the monitor is started with.
#[must_use]
pub fn monitor_args(conf: &NetworkMonitorConf, paths: &HitchPaths) -> Vec<String> {
    let mut args = vec!["--root".to_string(), paths.root.display().to_string()];
    if let Some(interval) = conf.interval.filter(|i| *i > 0) {
        args.push("--interval".to_string());
        args.push(interval.to_string());
    }
    if conf.monitor_all_chains {
        args.push("--monitor-all-chains".to_string());
    }
    args
}

/// Spawn the monitor from `bin_dir` unless it is disabled or already running.
///
/// Returns whether a process was started.
///
/// # Errors
///
/// Returns [`HitchError::Config`] if the monitor has no name, or an I/O
/// error if it cannot be spawned.
#[allow(clippy::zombie_processes)] // the monitor outlives the plugin
pub fn start_monitor_if_not_running(
    conf: &NetworkMonitorConf,
    paths: &HitchPaths,
    bin_dir: &Path,
) -> HitchResult<bool> {
    if conf.name.is_empty() {
        return Err(HitchError::Config {
            message: "network monitor name is empty".to_string(),
        });
    }
    if conf.disable {
        tracing::debug!("Network monitor disabled");
        return Ok(false);
    }
    if is_monitor_running(&paths.monitor_pid(), &conf.name) {
        tracing::debug!(name = %conf.name, "Network monitor already running");
        return Ok(false);
    }

    let binary = bin_dir.join(&conf.name);
    let child = Command::new(&binary)
        .args(monitor_args(conf, paths))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()?;
    tracing::info!(binary = %binary.display(), pid = child.id(), "Started network monitor");
    Ok(true)
}

/// One monitor tick: lock the store, load the state, run a reconciler pass
/// and unlock.
///
/// # Errors
///
/// Returns an error if the lock cannot be taken, the state cannot be read, or
/// the live rules cannot be listed.
pub fn reconcile_once<S: KeyValueStore>(
    store: &mut S,
    host: &HostContext,
    reconciler: &mut RuleReconciler,
) -> HitchResult<PassSummary> {
    store.lock(true)?;
    let result = NetworkManager::restore(host.clone(), store)
        .and_then(|manager| reconciler.run_pass(host.control_plane.as_ref(), &manager.desired_l2_rules()));
    if let Err(e) = store.unlock(false) {
        tracing::warn!(error = %e, "Failed to release store lock");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn args_follow_config() {
        let paths = HitchPaths::with_root("/var/lib/hitch");
        let conf = NetworkMonitorConf {
            name: crate::MONITOR_NAME.to_string(),
            disable: false,
            interval: Some(30),
            monitor_all_chains: true,
        };
        assert_eq!(
            monitor_args(&conf, &paths),
            vec!["--root", "/var/lib/hitch", "--interval", "30", "--monitor-all-chains"]
        );

        let plain = NetworkMonitorConf {
            name: crate::MONITOR_NAME.to_string(),
            ..NetworkMonitorConf::default()
        };
        assert_eq!(monitor_args(&plain, &paths), vec!["--root", "/var/lib/hitch"]);
    }

    #[test]
    fn nameless_monitor_is_rejected() {
        let paths = HitchPaths::with_root("/nonexistent");
        let err = start_monitor_if_not_running(&NetworkMonitorConf::default(), &paths, Path::new("/bin")).unwrap_err();
        assert!(matches!(err, HitchError::Config { .. }));
    }

    #[test]
    fn disabled_monitor_is_not_started() {
        let paths = HitchPaths::with_root("/nonexistent");
        let conf = NetworkMonitorConf {
            name: crate::MONITOR_NAME.to_string(),
            disable: true,
            ..NetworkMonitorConf::default()
        };
        assert!(!start_monitor_if_not_running(&conf, &paths, Path::new("/nonexistent/bin")).unwrap());
    }

    #[test]
    fn pid_file_of_dead_process_is_not_running() {
        let temp = TempDir::new().unwrap();
        let pid_file = temp.path().join("netmon.pid");
        assert!(!is_monitor_running(&pid_file, "hitch-netmon"));

        std::fs::write(&pid_file, "not-a-pid").unwrap();
        assert!(!is_monitor_running(&pid_file, "hitch-netmon"));

        write_pid_file(&pid_file).unwrap();
        assert_eq!(
            std::fs::read_to_string(&pid_file).unwrap(),
            std::process::id().to_string()
        );
        // Our own PID runs the test binary, not the monitor.
        assert!(!is_monitor_running(&pid_file, "hitch-netmon"));
    }

    #[test]
    fn pid_file_parent_is_created() {
        let temp = TempDir::new().unwrap();
        let pid_file: PathBuf = temp.path().join("run/netmon.pid");
        write_pid_file(&pid_file).unwrap();
        assert!(pid_file.exists());
    }
}
