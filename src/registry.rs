//! Helper identity registry
//!
//! The single source of truth for "the currently running helper". The
//! supervisor publishes an identity here after each successful launch and
//! clears it when the helper exits; the control surface authenticates
//! privileged callers against the recorded pid.

use crate::error::{Error, Result};
use std::sync::Mutex;

/// Identity of the currently running helper process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HelperIdentity {
    /// Process id of the helper
    pub pid: i32,
}

#[derive(Debug, Default)]
struct RegistryState {
    current: Option<HelperIdentity>,
    disabled: bool,
}

/// Thread-safe record of the current helper identity.
///
/// The disable flag shares the identity mutex, so a launch handshake can
/// never race a shutdown: a helper either registers before the flag is
/// set (and `disable_and_kill` sees and kills it), or it observes the
/// flag and is refused.
#[derive(Debug, Default)]
pub struct IdentityRegistry {
    state: Mutex<RegistryState>,
}

impl IdentityRegistry {
    /// Create an empty registry. Registrations are allowed until the
    /// first `disable_and_kill`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a freshly launched helper.
    ///
    /// Refuses with `Busy` when registrations are disabled (the launch
    /// raced a shutdown). A second registration while one is live is a
    /// supervisor invariant violation; it is logged and refused.
    pub fn register(&self, pid: i32) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if state.disabled {
            return Err(Error::Busy);
        }
        if let Some(existing) = state.current {
            tracing::error!(
                existing = existing.pid,
                new = pid,
                "refusing to register a second helper identity"
            );
            return Err(Error::AlreadyRunning);
        }
        state.current = Some(HelperIdentity { pid });
        tracing::info!(pid, "helper registered");
        Ok(())
    }

    /// Clear the identity after the helper exits.
    pub fn clear(&self, pid: i32) {
        let mut state = self.state.lock().unwrap();
        match state.current {
            Some(identity) if identity.pid == pid => state.current = None,
            Some(identity) => tracing::warn!(
                registered = identity.pid,
                exited = pid,
                "exited pid does not match the registered helper"
            ),
            None => tracing::warn!(pid, "clear with no registered helper"),
        }
    }

    /// Current helper identity, if one is registered.
    pub fn current(&self) -> Option<HelperIdentity> {
        self.state.lock().unwrap().current
    }

    /// Current helper pid, or 0 when none is registered.
    pub fn pid(&self) -> i32 {
        self.current().map(|identity| identity.pid).unwrap_or(0)
    }

    /// Allow registrations again. Called only when the supervisor starts.
    pub fn enable(&self) {
        self.state.lock().unwrap().disabled = false;
    }

    /// Forbid further registrations, then SIGKILL the registered helper
    /// if one exists. Best-effort: callers log failures and proceed.
    pub fn disable_and_kill(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.disabled = true;
        let Some(identity) = state.current else {
            return Ok(());
        };
        let rc = unsafe { libc::kill(identity.pid, libc::SIGKILL) };
        if rc != 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
