//! Network-namespace surgery.
//!
//! Entering a namespace with `setns(2)` changes the *calling thread's*
//! ambient namespace, so the whole switch-configure-restore sequence runs on
//! one blocking thread, serialized behind a process-wide lock, with the
//! original namespace restored on every exit path by an RAII guard.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use once_cell::sync::Lazy;
use tracing::{debug, error};

use crate::error::{FabricError, FabricResult};
use crate::shell;

/// Directory of named namespace handles, as used by `ip netns`.
pub const NETNS_RUN_DIR: &str = "/var/run/netns";

/// Host-local mutual exclusion for namespace switching. Only one thread may
/// be away from the host namespace at a time.
static NETNS_LOCK: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

/// Exposes a process's network namespace as a named handle under
/// [`NETNS_RUN_DIR`], returning the handle path.
///
/// The handle is a symlink to `/proc/<pid>/ns/net`; creating it again for
/// the same pid is a no-op.
pub fn bind_process_netns(pid: u32) -> FabricResult<PathBuf> {
    std::fs::create_dir_all(NETNS_RUN_DIR)
        .map_err(|e| FabricError::namespace("mkdir", e.to_string()))?;

    let link = Path::new(NETNS_RUN_DIR).join(pid.to_string());
    if !link.exists() {
        let target = format!("/proc/{}/ns/net", pid);
        std::os::unix::fs::symlink(&target, &link)
            .map_err(|e| FabricError::namespace("bind", format!("{} -> {}: {}", link.display(), target, e)))?;
        debug!(pid, handle = %link.display(), "bound container namespace");
    }
    Ok(link)
}

fn setns(fd: i32) -> std::io::Result<()> {
    // SAFETY: fd is a live file descriptor for a network-namespace file;
    // setns has no memory-safety preconditions beyond that.
    let rc = unsafe { libc::setns(fd, libc::CLONE_NEWNET) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

/// Switches the current thread into the namespace at `handle`; switches
/// back when dropped.
#[derive(Debug)]
struct NetnsGuard {
    original: File,
}

impl NetnsGuard {
    fn enter(handle: &Path) -> FabricResult<Self> {
        let original = File::open("/proc/self/ns/net")
            .map_err(|e| FabricError::namespace("open-own-ns", e.to_string()))?;
        let target = File::open(handle)
            .map_err(|e| FabricError::namespace("open-target-ns", e.to_string()))?;
        setns(target.as_raw_fd())
            .map_err(|e| FabricError::namespace("setns", e.to_string()))?;
        Ok(NetnsGuard { original })
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        if let Err(e) = setns(self.original.as_raw_fd()) {
            // The thread is stranded in a foreign namespace. Nothing to do
            // but scream; the lock stays honest because we still hold it.
            error!(error = %e, "failed to restore original namespace");
        }
    }
}

/// Runs `f` with the calling thread switched into the namespace at
/// `handle`.
///
/// Must be called from a blocking-capable thread (`spawn_blocking`), never
/// from an async task directly. Holds the process-wide namespace lock for
/// the full duration; the original namespace is restored on all exits,
/// including panics.
pub fn within<T>(handle: &Path, f: impl FnOnce() -> FabricResult<T>) -> FabricResult<T> {
    let _excl = NETNS_LOCK.lock().expect("netns lock poisoned");
    let _guard = NetnsGuard::enter(handle)?;
    f()
}

/// Runs a sequence of `(step, command)` pairs inside the namespace at
/// `handle`. Stops at the first failure, naming the failing step.
pub fn run_commands(handle: &Path, commands: &[(&'static str, String)]) -> FabricResult<()> {
    within(handle, || {
        for (step, cmd) in commands {
            shell::exec_blocking_or_throw(cmd)
                .map_err(|e| FabricError::attachment(step, e))?;
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_path_shape() {
        let link = Path::new(NETNS_RUN_DIR).join("4242");
        assert_eq!(link.to_str().unwrap(), "/var/run/netns/4242");
    }

    #[test]
    fn test_enter_missing_handle_fails() {
        let err = NetnsGuard::enter(Path::new("/var/run/netns/no-such-ns")).unwrap_err();
        match err {
            FabricError::Namespace { operation, .. } => {
                assert!(operation == "open-own-ns" || operation == "open-target-ns");
            }
            other => panic!("expected namespace error, got {:?}", other),
        }
    }
}
