//! Helper process launching
//!
//! Validates the helper executable and runs one launch-to-exit cycle:
//! spawn with no arguments and a cleared environment, publish the pid in
//! the [`IdentityRegistry`] (the startup handshake), wait for the
//! process to exit, and clear the registry again.

use crate::error::{Error, Result};
use crate::registry::IdentityRegistry;
use async_trait::async_trait;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use tokio::process::Command;
use tokio::sync::oneshot;

/// One-shot signal completed when the first helper handshake succeeds,
/// or failed by the supervisor when the first launch attempt does.
pub type StartupSignal = oneshot::Sender<Result<()>>;

/// Launches the supervised helper.
#[async_trait]
pub trait Launcher: Send + Sync + 'static {
    /// Validate the helper executable. Performed before every launch and
    /// again by the supervisor before it starts at all.
    fn validate(&self) -> Result<()>;

    /// Run one launch-to-exit cycle of the helper.
    ///
    /// On a successful handshake the identity is registered and
    /// `startup` (if still pending) is completed. The registry is always
    /// clear again by the time this returns. Spawn and handshake
    /// failures are returned as errors.
    async fn run_once(
        &self,
        registry: &IdentityRegistry,
        startup: &mut Option<StartupSignal>,
    ) -> Result<ExitStatus>;
}

/// Launcher for the real helper executable configured on this host.
pub struct HelperLauncher {
    path: PathBuf,
}

impl HelperLauncher {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

#[async_trait]
impl Launcher for HelperLauncher {
    // Basic trust checks only. The gap between check and exec is a known
    // TOCTOU window; the operator already has equivalent privileges.
    fn validate(&self) -> Result<()> {
        let file = match std::fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(Error::PackageMissing)
            }
            Err(e) => return Err(Error::Io(e)),
        };

        let meta = file.metadata()?;
        if !meta.is_file() {
            return Err(Error::Unsafe("not a regular file".into()));
        }

        if mount_is_noexec(&self.path)? {
            return Err(Error::Unsafe("mounted noexec".into()));
        }

        if open_for_write(&file) {
            return Err(Error::Unsafe("open for writing".into()));
        }

        Ok(())
    }

    async fn run_once(
        &self,
        registry: &IdentityRegistry,
        startup: &mut Option<StartupSignal>,
    ) -> Result<ExitStatus> {
        let mut child = Command::new(&self.path)
            .env_clear()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::PackageMissing,
                _ => Error::Io(e),
            })?;

        let Some(pid) = child.id().map(|pid| pid as i32) else {
            let status = child.wait().await?;
            return Err(Error::Internal(format!(
                "helper exited during spawn: {status}"
            )));
        };

        if let Err(e) = registry.register(pid) {
            // The launch raced a shutdown; reap the child and report
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        if let Some(tx) = startup.take() {
            let _ = tx.send(Ok(()));
        }

        let status = child.wait().await;
        registry.clear(pid);
        Ok(status?)
    }
}

fn mount_is_noexec(path: &Path) -> Result<bool> {
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|_| Error::Unsafe("path contains NUL".into()))?;
    let mut vfs: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(cpath.as_ptr(), &mut vfs) };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok(vfs.f_flag & libc::ST_NOEXEC != 0)
}

/// A read lease is refused while any other opener holds the file for
/// writing. Requires CAP_LEASE; on an unrelated errno the check accepts
/// the file.
fn open_for_write(file: &std::fs::File) -> bool {
    let fd = file.as_raw_fd();
    let rc = unsafe { libc::fcntl(fd, libc::F_SETLEASE, libc::F_RDLCK) };
    if rc == 0 {
        unsafe { libc::fcntl(fd, libc::F_SETLEASE, libc::F_UNLCK) };
        return false;
    }
    let err = std::io::Error::last_os_error();
    matches!(
        err.raw_os_error(),
        Some(libc::EAGAIN) | Some(libc::EBUSY)
    )
}
