//! Power actions and suspend/resume bridging
//!
//! Two concerns live here: executing the power actions the helper may
//! request through the control surface, and pausing/restarting the
//! supervisor around system suspend.

use crate::error::{Error, Result};
use crate::launcher::Launcher;
use crate::supervisor::Supervisor;
use async_trait::async_trait;
use std::sync::Arc;

/// Power action accepted by the control surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerAction {
    Poweroff,
    Reboot,
}

impl PowerAction {
    /// Parse an action body. Exact byte match only.
    pub fn parse(body: &str) -> Result<Self> {
        match body {
            "poweroff" => Ok(Self::Poweroff),
            "reboot" => Ok(Self::Reboot),
            _ => Err(Error::InvalidArgument("unknown power action".into())),
        }
    }
}

/// Executes accepted power actions.
pub trait PowerController: Send + Sync + 'static {
    /// Flush durable state before the machine goes away.
    fn flush(&self);

    /// Carry out the action. Not expected to return on success.
    fn initiate(&self, action: PowerAction);
}

/// Power controller backed by the reboot syscall, with a systemctl
/// fallback when the syscall is refused.
pub struct SystemPowerController;

impl PowerController for SystemPowerController {
    fn flush(&self) {
        unsafe { libc::sync() };
    }

    fn initiate(&self, action: PowerAction) {
        let cmd = match action {
            PowerAction::Poweroff => libc::LINUX_REBOOT_CMD_POWER_OFF,
            PowerAction::Reboot => libc::LINUX_REBOOT_CMD_RESTART,
        };
        unsafe { libc::reboot(cmd) };
        tracing::error!("reboot syscall failed, trying systemctl");

        let verb = match action {
            PowerAction::Poweroff => "poweroff",
            PowerAction::Reboot => "reboot",
        };
        match std::process::Command::new("systemctl").arg(verb).status() {
            Ok(status) if status.success() => {}
            Ok(status) => tracing::error!(%status, verb, "systemctl failed"),
            Err(e) => tracing::error!(error = %e, verb, "failed to run systemctl"),
        }
    }
}

/// Logical power-state transitions the supervisor reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    Suspending,
    Resumed,
}

/// Source of power-state transition notifications.
#[async_trait]
pub trait PowerEventSource: Send {
    /// Next event, or `None` when the source is torn down.
    async fn next_event(&mut self) -> Option<PowerEvent>;
}

/// Event source driven by SIGUSR1 (suspending) and SIGUSR2 (resumed),
/// sent by the system sleep hooks.
pub struct SignalPowerSource {
    suspend: tokio::signal::unix::Signal,
    resume: tokio::signal::unix::Signal,
}

impl SignalPowerSource {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};
        Ok(Self {
            suspend: signal(SignalKind::user_defined1())?,
            resume: signal(SignalKind::user_defined2())?,
        })
    }
}

#[async_trait]
impl PowerEventSource for SignalPowerSource {
    async fn next_event(&mut self) -> Option<PowerEvent> {
        tokio::select! {
            received = self.suspend.recv() => received.map(|_| PowerEvent::Suspending),
            received = self.resume.recv() => received.map(|_| PowerEvent::Resumed),
        }
    }
}

/// Pauses and restarts the supervisor around suspend/resume.
pub struct PowerEventBridge<L: Launcher> {
    supervisor: Arc<Supervisor<L>>,
}

impl<L: Launcher> PowerEventBridge<L> {
    pub fn new(supervisor: Arc<Supervisor<L>>) -> Self {
        Self { supervisor }
    }

    /// Handle a pre-suspend notification. A failure to stop never blocks
    /// the suspend itself.
    pub async fn on_suspending(&self) {
        tracing::info!("pre-suspend notification, stopping helper and supervisor");
        if let Err(e) = self.supervisor.stop().await {
            tracing::warn!(error = %e, "failed to stop supervisor before suspend");
        }
    }

    /// Handle a post-resume notification. A failed restart is logged and
    /// left for the administrator; there is no automatic retry.
    pub async fn on_resumed(&self) {
        tracing::info!("post-resume notification, restarting helper and supervisor");
        if let Err(e) = self.supervisor.start().await {
            tracing::error!(error = %e, "failed to restart supervisor after resume");
        }
    }

    /// Drive the bridge from an event source until it ends.
    pub async fn run<S: PowerEventSource>(self, mut source: S) {
        while let Some(event) = source.next_event().await {
            match event {
                PowerEvent::Suspending => self.on_suspending().await,
                PowerEvent::Resumed => self.on_resumed().await,
            }
        }
    }
}
