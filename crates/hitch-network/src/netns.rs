//! Network namespace switching.
//!
//! Entering a namespace switches the calling thread only. The
//! [`NamespaceGuard`] returned by [`Namespace::enter`] is `!Send`, so the code
//! that runs inside the namespace stays on the thread that switched, and the
//! previous namespace is restored when the guard is exited or dropped.

use std::fs::File;
use std::marker::PhantomData;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use hitch_common::{HitchError, HitchResult};

/// Namespace of the calling thread.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// An open reference to a network namespace.
#[derive(Debug)]
pub struct NsHandle {
    id: String,
    fd: Option<OwnedFd>,
}

impl NsHandle {
    /// Handle without a file descriptor, for switchers that track
    /// namespaces by name.
    #[must_use]
    pub fn named(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fd: None,
        }
    }

    /// Handle backed by an open namespace file.
    #[must_use]
    pub fn from_fd(id: impl Into<String>, fd: OwnedFd) -> Self {
        Self {
            id: id.into(),
            fd: Some(fd),
        }
    }

    /// Identifier, the path the handle was opened from.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Namespace file descriptor, if any.
    #[must_use]
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.fd.as_ref().map(AsFd::as_fd)
    }
}

/// Opens namespaces and switches the calling thread between them.
pub trait NamespaceSwitcher: Send + Sync {
    /// Open the namespace at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace does not exist.
    fn open(&self, path: &Path) -> HitchResult<NsHandle>;

    /// Handle to the calling thread's current namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the current namespace cannot be opened.
    fn current(&self) -> HitchResult<NsHandle>;

    /// Move the calling thread into `handle`'s namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the switch fails.
    fn switch_to(&self, handle: &NsHandle) -> HitchResult<()>;
}

/// Switcher using `setns(2)`.
#[derive(Debug, Default, Clone, Copy)]
pub struct KernelNamespaces;

impl KernelNamespaces {
    fn open_file(path: &Path, operation: &str) -> HitchResult<NsHandle> {
        let file = File::open(path).map_err(|e| HitchError::NamespaceOperationFailed {
            operation: operation.to_string(),
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        Ok(NsHandle::from_fd(path.display().to_string(), OwnedFd::from(file)))
    }
}

impl NamespaceSwitcher for KernelNamespaces {
    fn open(&self, path: &Path) -> HitchResult<NsHandle> {
        Self::open_file(path, "open")
    }

    fn current(&self) -> HitchResult<NsHandle> {
        Self::open_file(Path::new(THREAD_NETNS), "get current")
    }

    #[allow(unsafe_code)]
    fn switch_to(&self, handle: &NsHandle) -> HitchResult<()> {
        let fd = handle.fd().ok_or_else(|| HitchError::NamespaceOperationFailed {
            operation: "setns".to_string(),
            path: handle.id().to_string(),
            reason: "handle has no file descriptor".to_string(),
        })?;

        // SAFETY: `fd` is a valid open namespace file borrowed from `handle`
        // for the duration of the call.
        let ret = unsafe { libc::setns(fd.as_raw_fd(), libc::CLONE_NEWNET) };
        if ret != 0 {
            return Err(HitchError::NamespaceOperationFailed {
                operation: "setns".to_string(),
                path: handle.id().to_string(),
                reason: std::io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }
}

/// An open network namespace.
///
/// Dropping the namespace closes it.
pub struct Namespace {
    path: PathBuf,
    handle: NsHandle,
    switcher: Arc<dyn NamespaceSwitcher>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("path", &self.path).finish_non_exhaustive()
    }
}

impl Namespace {
    /// Open the namespace at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::NamespaceOperationFailed`] if it cannot be opened.
    pub fn open(switcher: Arc<dyn NamespaceSwitcher>, path: &Path) -> HitchResult<Self> {
        tracing::debug!(path = %path.display(), "Opening network namespace");
        let handle = switcher.open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            handle,
            switcher,
        })
    }

    /// Namespace path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Switch the calling thread into this namespace.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::NamespaceOperationFailed`] if the switch fails.
    /// The thread is left in its original namespace in that case.
    pub fn enter(&self) -> HitchResult<NamespaceGuard<'_>> {
        let previous = self.switcher.current()?;

        tracing::debug!(path = %self.path.display(), from = previous.id(), "Entering network namespace");
        self.switcher
            .switch_to(&self.handle)
            .map_err(|e| HitchError::NamespaceOperationFailed {
                operation: "enter".to_string(),
                path: self.path.display().to_string(),
                reason: e.to_string(),
            })?;

        Ok(NamespaceGuard {
            namespace: self,
            previous: Some(previous),
            _not_send: PhantomData,
        })
    }

    /// Close the namespace.
    pub fn close(self) {
        tracing::debug!(path = %self.path.display(), "Closing network namespace");
    }
}

/// Proof that the calling thread is inside a [`Namespace`].
///
/// The previous namespace is restored by [`NamespaceGuard::exit`], or on drop
/// if the guard goes out of scope first (error paths).
#[must_use = "dropping the guard immediately leaves the namespace"]
pub struct NamespaceGuard<'a> {
    namespace: &'a Namespace,
    previous: Option<NsHandle>,
    // Namespace membership is per thread.
    _not_send: PhantomData<*const ()>,
}

impl NamespaceGuard<'_> {
    /// Return to the namespace the thread was in before entering.
    ///
    /// # Errors
    ///
    /// Returns [`HitchError::NamespaceOperationFailed`] if the switch back
    /// fails.
    pub fn exit(mut self) -> HitchResult<()> {
        self.restore()
    }

    fn restore(&mut self) -> HitchResult<()> {
        let Some(previous) = self.previous.take() else {
            return Ok(());
        };

        tracing::debug!(
            path = %self.namespace.path.display(),
            to = previous.id(),
            "Exiting network namespace"
        );
        self.namespace
            .switcher
            .switch_to(&previous)
            .map_err(|e| HitchError::NamespaceOperationFailed {
                operation: "exit".to_string(),
                path: self.namespace.path.display().to_string(),
                reason: e.to_string(),
            })
    }
}

impl Drop for NamespaceGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            tracing::error!(error = %e, "Failed to restore network namespace");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakeHost;

    #[test]
    fn enter_and_exit_restore_previous() {
        let host = Arc::new(FakeHost::new());
        host.add_namespace("/var/run/netns/c1");

        let ns = Namespace::open(host.clone(), Path::new("/var/run/netns/c1")).unwrap();
        let guard = ns.enter().unwrap();
        assert_eq!(host.current_namespace(), "/var/run/netns/c1");
        guard.exit().unwrap();
        assert_eq!(host.current_namespace(), FakeHost::HOST_NS);
        ns.close();
    }

    #[test]
    fn drop_restores_on_error_path() {
        let host = Arc::new(FakeHost::new());
        host.add_namespace("/var/run/netns/c1");
        let ns = Namespace::open(host.clone(), Path::new("/var/run/netns/c1")).unwrap();

        let result: HitchResult<()> = (|| {
            let _guard = ns.enter()?;
            Err(HitchError::Internal {
                message: "boom".to_string(),
            })
        })();

        assert!(result.is_err());
        assert_eq!(host.current_namespace(), FakeHost::HOST_NS);
    }

    #[test]
    fn open_missing_namespace_fails() {
        let host = Arc::new(FakeHost::new());
        let err = Namespace::open(host, Path::new("/var/run/netns/missing")).unwrap_err();
        assert!(matches!(err, HitchError::NamespaceOperationFailed { .. }));
    }
}
