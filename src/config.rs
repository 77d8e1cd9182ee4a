//! vigild configuration management

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Main vigild configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VigildConfig {
    /// Supervised helper configuration
    #[serde(default)]
    pub helper: HelperConfig,

    /// Control socket configuration
    #[serde(default)]
    pub control: ControlConfig,

    /// Console lock configuration
    #[serde(default)]
    pub console: ConsoleConfig,
}

/// Supervised helper configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Absolute path to the helper executable
    pub path: PathBuf,

    /// Seconds to wait between a helper exit and the next relaunch
    pub cooldown_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/usr/local/sbin/vigil-agent"),
            cooldown_secs: 5,
        }
    }
}

/// Control socket configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControlConfig {
    /// Path of the Unix control socket
    pub socket_path: PathBuf,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/vigild/control.sock"),
        }
    }
}

/// Console lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsoleConfig {
    /// TTY device used to issue VT ioctls
    pub tty_path: PathBuf,

    /// VT reserved for the locked console
    pub locked_vt: u16,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            tty_path: PathBuf::from("/dev/tty0"),
            // Arbitrary high VT, unlikely to be in use
            locked_vt: 25,
        }
    }
}
