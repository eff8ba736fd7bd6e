//! Persistent key-value state store with a cross-process lock.
//!
//! Every plugin invocation is its own process, so all mutation of network
//! state happens under an exclusive lock file. The lock file records the
//! owner's PID so a later invocation can tell whether a leftover lock belongs
//! to a process that crashed. The lock file only appears once the PID is in
//! it, so an unreadable lock file is left over from something else and only
//! counts as abandoned once it is older than the lock timeout.

use std::collections::BTreeMap;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::error::{HitchError, HitchResult};

/// Default time to wait for the lock before giving up.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Interval between lock acquisition attempts.
const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(100);

/// Length limit of `/proc/<pid>/comm`.
const COMM_MAX_LEN: usize = 15;

/// Durable key-value storage shared by plugin invocations.
pub trait KeyValueStore {
    /// Acquire the exclusive lock. With `wait`, retry until the lock timeout.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::LockAcquisitionFailed`] if the lock is held elsewhere.
    fn lock(&mut self, wait: bool) -> HitchResult<()>;

    /// Release the lock. `force` removes it even if this store does not hold it.
    ///
    /// # Errors
    ///
    /// Returns an error if the lock file cannot be removed.
    fn unlock(&mut self, force: bool) -> HitchResult<()>;

    /// Read and decode a value.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::StateNotFound`] if the key is absent.
    fn read<T: DeserializeOwned>(&mut self, key: &str) -> HitchResult<T>;

    /// Encode and durably write a value.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding or the file write fails.
    fn write<T: Serialize>(&mut self, key: &str, value: &T) -> HitchResult<()>;

    /// Whether the current lock holder is gone, so the lock may be cleared.
    ///
    /// `holders` names every program that takes this lock. A lock owned by a
    /// live process running any of them is never stale.
    fn is_lock_stale(&self, holders: &[&str]) -> bool;
}

/// State store backed by a single JSON file and a sibling lock file.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock_path: PathBuf,
    data: BTreeMap<String, serde_json::Value>,
    loaded: bool,
    locked: bool,
    lock_timeout: Duration,
}

impl JsonFileStore {
    /// Create a store for the given state file. The lock file is `<path>.lock`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let mut lock_name = path.as_os_str().to_owned();
        lock_name.push(".lock");

        Self {
            path,
            lock_path: PathBuf::from(lock_name),
            data: BTreeMap::new(),
            loaded: false,
            locked: false,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// Set how long [`KeyValueStore::lock`] waits.
    #[must_use]
    pub const fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Path of the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Path of the lock file.
    #[must_use]
    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }

    /// Whether this store currently holds the lock.
    #[must_use]
    pub const fn is_locked(&self) -> bool {
        self.locked
    }

    /// PID recorded in the lock file, if any.
    #[must_use]
    pub fn lock_owner(&self) -> Option<u32> {
        std::fs::read_to_string(&self.lock_path)
            .ok()
            .and_then(|s| s.trim().parse().ok())
    }

    fn try_create_lock(&self) -> std::io::Result<()> {
        let dir = self
            .lock_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)?;

        let mut file = tempfile::NamedTempFile::new_in(dir)?;
        write!(file, "{}", std::process::id())?;
        file.as_file().sync_all()?;
        file.persist_noclobber(&self.lock_path)
            .map(drop)
            .map_err(|e| e.error)
    }

    /// Whether an unreadable lock file has outlived the lock timeout.
    fn is_unreadable_lock_abandoned(&self) -> bool {
        std::fs::metadata(&self.lock_path)
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| modified.elapsed().ok())
            .is_some_and(|age| age >= self.lock_timeout)
    }

    fn load(&mut self) -> HitchResult<()> {
        match std::fs::read_to_string(&self.path) {
            Ok(json) if json.trim().is_empty() => self.data.clear(),
            Ok(json) => self.data = serde_json::from_str(&json)?,
            Err(e) if e.kind() == ErrorKind::NotFound => self.data.clear(),
            Err(e) => return Err(e.into()),
        }

        self.loaded = true;
        tracing::debug!(path = %self.path.display(), keys = self.data.len(), "Loaded state");
        Ok(())
    }

    fn flush(&self) -> HitchResult<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let json = serde_json::to_string_pretty(&self.data)?;
        let mut tmp_name = self.path.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), "Saved state");
        Ok(())
    }
}

impl KeyValueStore for JsonFileStore {
    fn lock(&mut self, wait: bool) -> HitchResult<()> {
        if self.locked {
            return Ok(());
        }

        let started = Instant::now();
        loop {
            match self.try_create_lock() {
                Ok(()) => break,
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if !wait || started.elapsed() >= self.lock_timeout {
                        return Err(HitchError::LockAcquisitionFailed {
                            path: self.lock_path.display().to_string(),
                            reason: format!(
                                "held by pid {}",
                                self.lock_owner()
                                    .map_or_else(|| "unknown".to_string(), |p| p.to_string())
                            ),
                        });
                    }
                    std::thread::sleep(LOCK_RETRY_INTERVAL);
                }
                Err(e) => {
                    return Err(HitchError::LockAcquisitionFailed {
                        path: self.lock_path.display().to_string(),
                        reason: e.to_string(),
                    });
                }
            }
        }

        self.locked = true;
        tracing::debug!(path = %self.lock_path.display(), "Acquired store lock");

        // Another process may have written since we last looked.
        self.load()
    }

    fn unlock(&mut self, force: bool) -> HitchResult<()> {
        if !self.locked && !force {
            return Ok(());
        }

        match std::fs::remove_file(&self.lock_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        self.locked = false;
        tracing::debug!(path = %self.lock_path.display(), force, "Released store lock");
        Ok(())
    }

    fn read<T: DeserializeOwned>(&mut self, key: &str) -> HitchResult<T> {
        if !self.loaded {
            self.load()?;
        }

        let value = self
            .data
            .get(key)
            .cloned()
            .ok_or_else(|| HitchError::StateNotFound {
                key: key.to_string(),
            })?;
        Ok(serde_json::from_value(value)?)
    }

    fn write<T: Serialize>(&mut self, key: &str, value: &T) -> HitchResult<()> {
        if !self.loaded {
            self.load()?;
        }

        self.data
            .insert(key.to_string(), serde_json::to_value(value)?);
        self.flush()
    }

    fn is_lock_stale(&self, holders: &[&str]) -> bool {
        let Some(pid) = self.lock_owner() else {
            return self.is_unreadable_lock_abandoned();
        };

        if pid == std::process::id() {
            return false;
        }
        let Some(comm) = process_comm(pid) else {
            tracing::info!(pid, "Lock holder is no longer running");
            return true;
        };
        if holders.iter().any(|name| comm_matches(&comm, name)) {
            return false;
        }
        tracing::info!(pid, comm = %comm, "Lock PID belongs to another program");
        true
    }
}

/// The `comm` of a live process, `None` if it is gone.
fn process_comm(pid: u32) -> Option<String> {
    std::fs::read_to_string(format!("/proc/{pid}/comm"))
        .ok()
        .map(|comm| comm.trim().to_string())
}

fn comm_matches(comm: &str, process_name: &str) -> bool {
    process_name.chars().take(COMM_MAX_LEN).eq(comm.chars())
}

/// Whether `pid` is alive and runs the program `process_name`.
///
/// PIDs are recycled, so a live PID only counts if its `comm` matches.
#[must_use]
pub fn is_process_running(pid: u32, process_name: &str) -> bool {
    process_comm(pid).is_some_and(|comm| comm_matches(&comm, process_name))
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        if self.locked {
            if let Err(e) = self.unlock(false) {
                tracing::warn!(error = %e, "Failed to release store lock on drop");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        name: String,
        count: u32,
    }

    #[test]
    fn write_and_read_back() {
        let temp = tempdir().unwrap();
        let mut store = JsonFileStore::new(temp.path().join("state.json"));
        store.lock(false).unwrap();

        let sample = Sample {
            name: "n1".to_string(),
            count: 3,
        };
        store.write("Network", &sample).unwrap();

        let mut reopened = JsonFileStore::new(temp.path().join("state.json"));
        let loaded: Sample = reopened.read("Network").unwrap();
        assert_eq!(loaded, sample);
    }

    #[test]
    fn missing_key_is_not_found() {
        let temp = tempdir().unwrap();
        let mut store = JsonFileStore::new(temp.path().join("state.json"));
        let err = store.read::<Sample>("Network").unwrap_err();
        assert!(matches!(err, HitchError::StateNotFound { .. }));
    }

    #[test]
    fn lock_is_exclusive() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");

        let mut first = JsonFileStore::new(&path);
        first.lock(false).unwrap();
        assert_eq!(first.lock_owner(), Some(std::process::id()));

        let mut second = JsonFileStore::new(&path).with_lock_timeout(Duration::from_millis(150));
        let err = second.lock(true).unwrap_err();
        assert!(matches!(err, HitchError::LockAcquisitionFailed { .. }));

        first.unlock(false).unwrap();
        second.lock(false).unwrap();
        assert!(second.is_locked());
    }

    #[test]
    fn drop_releases_lock() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        {
            let mut store = JsonFileStore::new(&path);
            store.lock(false).unwrap();
        }
        assert!(!temp.path().join("state.json.lock").exists());
    }

    #[test]
    fn lock_of_dead_process_is_stale() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("state.json");
        // PIDs are capped well below this value on Linux.
        std::fs::write(temp.path().join("state.json.lock"), "99999999").unwrap();

        let mut store = JsonFileStore::new(&path);
        assert!(store.is_lock_stale(&["hitch-cni"]));
        assert!(store.lock(false).is_err());

        store.unlock(true).unwrap();
        store.lock(false).unwrap();
    }

    #[test]
    fn own_lock_is_not_stale() {
        let temp = tempdir().unwrap();
        let mut store = JsonFileStore::new(temp.path().join("state.json"));
        store.lock(false).unwrap();
        assert!(!store.is_lock_stale(&["hitch-cni"]));
    }

    #[test]
    fn lock_file_holds_pid_and_no_leftovers() {
        let temp = tempdir().unwrap();
        let mut store = JsonFileStore::new(temp.path().join("state.json"));
        store.lock(false).unwrap();

        assert_eq!(
            std::fs::read_to_string(store.lock_path()).unwrap(),
            std::process::id().to_string()
        );
        let names: Vec<_> = std::fs::read_dir(temp.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("state.json.lock")]);
    }

    #[test]
    fn live_holder_of_any_listed_program_is_not_stale() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path().join("state.json"));
        let mut holder = std::process::Command::new("sleep").arg("30").spawn().unwrap();
        std::fs::write(store.lock_path(), holder.id().to_string()).unwrap();

        let monitor_held = store.is_lock_stale(&["hitch-cni", "sleep"]);
        // A recycled PID running something unrelated.
        let foreign = store.is_lock_stale(&["hitch-cni", "hitch-netmon"]);

        holder.kill().unwrap();
        holder.wait().unwrap();
        assert!(!monitor_held);
        assert!(foreign);
    }

    #[test]
    fn fresh_empty_lock_is_not_stale() {
        let temp = tempdir().unwrap();
        let store = JsonFileStore::new(temp.path().join("state.json"));
        std::fs::write(store.lock_path(), "").unwrap();
        assert!(!store.is_lock_stale(&["hitch-cni"]));

        let old = std::time::SystemTime::now() - Duration::from_secs(60);
        std::fs::File::options()
            .write(true)
            .open(store.lock_path())
            .unwrap()
            .set_modified(old)
            .unwrap();
        assert!(store.is_lock_stale(&["hitch-cni"]));
    }
}
