//! Console locking
//!
//! During sensitive operations the helper can ask for the display to be
//! switched to a dedicated virtual console, with switching away locked
//! until it is released.

use crate::error::{Error, Result};
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Mutex;

/// Low-level virtual console operations, resolved once at startup.
pub trait ConsoleGate: Send + Sync + 'static {
    /// Number of the currently active VT.
    fn current(&self) -> Result<u16>;

    /// Make `vt` the active console.
    fn activate(&self, vt: u16) -> Result<()>;

    /// Block until `vt` is the active console.
    fn wait_active(&self, vt: u16) -> Result<()>;

    /// Engage or release the switch lock.
    fn lock_switch(&self, locked: bool) -> Result<()>;
}

#[derive(Debug, Default)]
struct LockState {
    locked: bool,
    previous_vt: u16,
}

/// Serialized access to the console-lock collaborator.
///
/// The lock flag and the VT to restore live under one mutex; callers
/// from any execution context go through [`set_locked`].
///
/// [`set_locked`]: ConsoleLock::set_locked
pub struct ConsoleLock {
    gate: Box<dyn ConsoleGate>,
    locked_vt: u16,
    state: Mutex<LockState>,
}

impl ConsoleLock {
    pub fn new(gate: impl ConsoleGate, locked_vt: u16) -> Self {
        Self {
            gate: Box::new(gate),
            locked_vt,
            state: Mutex::new(LockState::default()),
        }
    }

    /// Current lock flag.
    pub fn locked(&self) -> bool {
        self.state.lock().unwrap().locked
    }

    /// Engage or release the console lock. Writing the current value is
    /// a success no-op; on a gate failure the flag is left unchanged.
    pub fn set_locked(&self, locked: bool) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if locked == state.locked {
            return Ok(());
        }
        if locked {
            let previous = self.gate.current()?;
            self.gate.activate(self.locked_vt)?;
            self.gate.wait_active(self.locked_vt)?;
            self.gate.lock_switch(true)?;
            state.previous_vt = previous;
        } else {
            self.gate.lock_switch(false)?;
            self.gate.activate(state.previous_vt)?;
        }
        state.locked = locked;
        tracing::info!(locked, "console lock changed");
        Ok(())
    }
}

// VT ioctls from <linux/vt.h>
const VT_GETSTATE: libc::c_ulong = 0x5603;
const VT_ACTIVATE: libc::c_ulong = 0x5606;
const VT_WAITACTIVE: libc::c_ulong = 0x5607;
const VT_LOCKSWITCH: libc::c_ulong = 0x560b;
const VT_UNLOCKSWITCH: libc::c_ulong = 0x560c;

#[repr(C)]
struct VtStat {
    v_active: libc::c_ushort,
    #[allow(dead_code)]
    v_signal: libc::c_ushort,
    #[allow(dead_code)]
    v_state: libc::c_ushort,
}

/// Console gate backed by VT ioctls on the configured tty device.
pub struct VtConsole {
    tty_path: PathBuf,
}

impl VtConsole {
    pub fn new(tty_path: PathBuf) -> Self {
        Self { tty_path }
    }

    // Requires root, or membership in the tty group
    fn open_tty(&self) -> Result<std::fs::File> {
        Ok(std::fs::File::open(&self.tty_path)?)
    }

    fn ioctl(&self, request: libc::c_ulong, arg: libc::c_ulong) -> Result<()> {
        let tty = self.open_tty()?;
        let rc = unsafe { libc::ioctl(tty.as_raw_fd(), request, arg) };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}

impl ConsoleGate for VtConsole {
    fn current(&self) -> Result<u16> {
        let tty = self.open_tty()?;
        let mut stat = VtStat {
            v_active: 0,
            v_signal: 0,
            v_state: 0,
        };
        let rc = unsafe { libc::ioctl(tty.as_raw_fd(), VT_GETSTATE, &mut stat) };
        if rc < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        Ok(stat.v_active)
    }

    fn activate(&self, vt: u16) -> Result<()> {
        self.ioctl(VT_ACTIVATE, vt as libc::c_ulong)
    }

    fn wait_active(&self, vt: u16) -> Result<()> {
        self.ioctl(VT_WAITACTIVE, vt as libc::c_ulong)
    }

    fn lock_switch(&self, locked: bool) -> Result<()> {
        let request = if locked { VT_LOCKSWITCH } else { VT_UNLOCKSWITCH };
        self.ioctl(request, 0)
    }
}
