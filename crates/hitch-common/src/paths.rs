//! Standard filesystem paths for Hitch.

use std::path::PathBuf;

use once_cell::sync::Lazy;

/// Default root directory for Hitch data.
pub static HITCH_ROOT: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HITCH_ROOT")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/var/lib/hitch"))
});

/// Default runtime directory for Hitch.
pub static HITCH_RUNTIME_DIR: Lazy<PathBuf> = Lazy::new(|| {
    std::env::var("HITCH_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("/run/hitch"))
});

/// Name of the persisted network state file.
pub const STATE_FILE_NAME: &str = "hitch-vnet.json";

/// Standard paths used by the plugins.
#[derive(Debug, Clone)]
pub struct HitchPaths {
    /// Root data directory (default: /var/lib/hitch).
    pub root: PathBuf,
    /// Runtime directory (default: /run/hitch).
    pub runtime: PathBuf,
}

impl HitchPaths {
    /// Create paths with default locations.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create paths with a custom root directory.
    #[must_use]
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let runtime = root.join("run");
        Self { root, runtime }
    }

    /// Network state file.
    #[must_use]
    pub fn state_file(&self) -> PathBuf {
        self.root.join(STATE_FILE_NAME)
    }

    /// Lock file guarding the state file.
    #[must_use]
    pub fn lock_file(&self) -> PathBuf {
        self.root.join(format!("{STATE_FILE_NAME}.lock"))
    }

    /// Log directory.
    #[must_use]
    pub fn logs(&self) -> PathBuf {
        self.root.join("log")
    }

    /// Telemetry report file.
    #[must_use]
    pub fn telemetry_file(&self) -> PathBuf {
        self.logs().join("telemetry.jsonl")
    }

    /// PID file of the network monitor.
    #[must_use]
    pub fn monitor_pid(&self) -> PathBuf {
        self.runtime.join("netmon.pid")
    }

    /// Create all necessary directories.
    ///
    /// # Errors
    ///
    /// Returns an error if directory creation fails.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.root)?;
        std::fs::create_dir_all(&self.runtime)?;
        std::fs::create_dir_all(self.logs())?;
        Ok(())
    }
}

impl Default for HitchPaths {
    fn default() -> Self {
        Self {
            root: HITCH_ROOT.clone(),
            runtime: HITCH_RUNTIME_DIR.clone(),
        }
    }
}
