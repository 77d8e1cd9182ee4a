//! Supervisor loop
//!
//! Long-lived background task that launches the helper, waits for it to
//! exit, and relaunches it after a cooldown. `start` blocks its caller
//! until the first helper handshake; `stop` kills the helper, then waits
//! for the task to fully exit before returning.

use crate::error::{Error, Result};
use crate::launcher::{Launcher, StartupSignal};
use crate::registry::IdentityRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

/// Default delay between a helper exit and the next relaunch attempt.
pub const RELAUNCH_COOLDOWN: Duration = Duration::from_secs(5);

struct Runner {
    task: JoinHandle<()>,
    stop_tx: watch::Sender<bool>,
}

/// Launches and continuously supervises the helper process.
pub struct Supervisor<L: Launcher> {
    pub(crate) launcher: Arc<L>,
    registry: Arc<IdentityRegistry>,
    cooldown: Duration,
    runner: Mutex<Option<Runner>>,
}

impl<L: Launcher> Supervisor<L> {
    pub fn new(launcher: L, registry: Arc<IdentityRegistry>) -> Self {
        Self::with_cooldown(launcher, registry, RELAUNCH_COOLDOWN)
    }

    pub fn with_cooldown(
        launcher: L,
        registry: Arc<IdentityRegistry>,
        cooldown: Duration,
    ) -> Self {
        Self {
            launcher: Arc::new(launcher),
            registry,
            cooldown,
            runner: Mutex::new(None),
        }
    }

    /// Whether the background runner is currently active.
    pub async fn is_running(&self) -> bool {
        self.runner.lock().await.is_some()
    }

    /// Start the supervisor and wait for the helper's first handshake.
    ///
    /// Validation failures and a failed first launch are returned with
    /// the runner already gone. If this call is abandoned mid-wait the
    /// runner keeps going; a later `stop` reaps it.
    pub async fn start(&self) -> Result<()> {
        let mut slot = self.runner.lock().await;
        if slot.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.launcher.validate()?;
        self.registry.enable();

        let (stop_tx, stop_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel();
        let task = tokio::spawn(run_loop(
            Arc::clone(&self.launcher),
            Arc::clone(&self.registry),
            self.cooldown,
            stop_rx,
            ready_tx,
        ));
        *slot = Some(Runner { task, stop_tx });
        drop(slot);

        tracing::debug!("runner started, waiting for first helper handshake");
        match ready_rx.await {
            Ok(Ok(())) => {
                tracing::debug!("helper started successfully");
                Ok(())
            }
            Ok(Err(e)) => {
                // First launch failed; the runner has already terminated
                if let Some(runner) = self.runner.lock().await.take() {
                    let _ = runner.task.await;
                }
                Err(e)
            }
            Err(_) => Err(Error::Interrupted),
        }
    }

    /// Stop the supervisor: forbid relaunches, kill the helper, then
    /// wait for the runner to fully exit. The join is deliberately not
    /// cancellable; shutdown needs the task gone before proceeding.
    pub async fn stop(&self) -> Result<()> {
        let runner = self
            .runner
            .lock()
            .await
            .take()
            .ok_or(Error::NotRunning)?;

        if let Err(e) = self.registry.disable_and_kill() {
            tracing::error!(error = %e, "failed to kill helper while stopping");
        }
        let _ = runner.stop_tx.send(true);
        if let Err(e) = runner.task.await {
            tracing::error!(error = %e, "supervisor runner task failed");
        }
        Ok(())
    }
}

async fn run_loop<L: Launcher>(
    launcher: Arc<L>,
    registry: Arc<IdentityRegistry>,
    cooldown: Duration,
    mut stop_rx: watch::Receiver<bool>,
    ready_tx: StartupSignal,
) {
    let mut startup = Some(ready_tx);
    loop {
        match launcher.run_once(&registry, &mut startup).await {
            Ok(status) => tracing::warn!(%status, "helper has quit"),
            Err(e) => {
                // Failing before the first handshake fails start() itself
                if let Some(tx) = startup.take() {
                    let _ = tx.send(Err(e));
                    return;
                }
                tracing::warn!(error = %e, "helper launch failed");
            }
        }

        if *stop_rx.borrow() {
            break;
        }

        // Don't frantically restart, in case of crash-loops
        tokio::select! {
            _ = tokio::time::sleep(cooldown) => {}
            _ = stop_rx.wait_for(|&stop| stop) => break,
        }
    }

    if let Err(e) = registry.disable_and_kill() {
        tracing::error!(error = %e, "failed to kill helper from runner");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
    use std::sync::Mutex as StdMutex;
    use tokio::time::Instant;

    /// How long a fake helper "runs" before exiting on its own.
    pub(crate) enum FakeLifetime {
        Immediate,
        Secs(u64),
    }

    /// Scripted launcher: registers an impossible pid, signals the
    /// handshake, then simulates the helper lifetime with the test clock.
    pub(crate) struct FakeLauncher {
        pub launches: StdMutex<Vec<Instant>>,
        pub lifetime: FakeLifetime,
        pub fail_validate: AtomicBool,
        pub fail_spawn: AtomicBool,
        next_pid: AtomicI32,
    }

    impl FakeLauncher {
        pub fn new(lifetime: FakeLifetime) -> Self {
            Self {
                launches: StdMutex::new(Vec::new()),
                lifetime,
                fail_validate: AtomicBool::new(false),
                fail_spawn: AtomicBool::new(false),
                // Far above pid_max, so a stray SIGKILL hits nothing
                next_pid: AtomicI32::new(9_000_000),
            }
        }

        pub fn launch_count(&self) -> usize {
            self.launches.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Launcher for FakeLauncher {
        fn validate(&self) -> Result<()> {
            if self.fail_validate.load(Ordering::SeqCst) {
                return Err(Error::Unsafe("scripted validation failure".into()));
            }
            Ok(())
        }

        async fn run_once(
            &self,
            registry: &IdentityRegistry,
            startup: &mut Option<StartupSignal>,
        ) -> Result<ExitStatus> {
            self.launches.lock().unwrap().push(Instant::now());
            if self.fail_spawn.load(Ordering::SeqCst) {
                return Err(Error::PackageMissing);
            }
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            registry.register(pid)?;
            if let Some(tx) = startup.take() {
                let _ = tx.send(Ok(()));
            }
            match self.lifetime {
                FakeLifetime::Immediate => {}
                FakeLifetime::Secs(secs) => {
                    tokio::time::sleep(Duration::from_secs(secs)).await
                }
            }
            registry.clear(pid);
            Ok(ExitStatus::from_raw(0))
        }
    }

    fn supervisor(lifetime: FakeLifetime) -> (Arc<Supervisor<FakeLauncher>>, Arc<IdentityRegistry>) {
        let registry = Arc::new(IdentityRegistry::new());
        let supervisor = Arc::new(Supervisor::new(
            FakeLauncher::new(lifetime),
            Arc::clone(&registry),
        ));
        (supervisor, registry)
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_stop_cycles_end_stopped() {
        let (supervisor, registry) = supervisor(FakeLifetime::Secs(3600));

        for _ in 0..2 {
            supervisor.start().await.unwrap();
            assert!(supervisor.is_running().await);
            assert!(registry.pid() > 0);

            supervisor.stop().await.unwrap();
            assert!(!supervisor.is_running().await);
            assert_eq!(registry.pid(), 0);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_twice_is_already_running() {
        let (supervisor, _registry) = supervisor(FakeLifetime::Secs(3600));
        supervisor.start().await.unwrap();
        assert!(matches!(
            supervisor.start().await,
            Err(Error::AlreadyRunning)
        ));
        supervisor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_validation_failure_does_not_start() {
        let (supervisor, _registry) = supervisor(FakeLifetime::Secs(3600));
        supervisor
            .launcher
            .fail_validate
            .store(true, Ordering::SeqCst);

        assert!(matches!(supervisor.start().await, Err(Error::Unsafe(_))));
        assert!(!supervisor.is_running().await);
        assert_eq!(supervisor.launcher.launch_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_launch_failure_terminates_loop() {
        let (supervisor, registry) = supervisor(FakeLifetime::Immediate);
        supervisor.launcher.fail_spawn.store(true, Ordering::SeqCst);

        assert!(matches!(
            supervisor.start().await,
            Err(Error::PackageMissing)
        ));
        assert!(!supervisor.is_running().await);
        assert_eq!(registry.pid(), 0);
        assert_eq!(supervisor.launcher.launch_count(), 1);

        // No relaunch attempts happen afterwards
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(supervisor.launcher.launch_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_crash_loop_relaunches_spaced_by_cooldown() {
        let (supervisor, _registry) = supervisor(FakeLifetime::Immediate);
        supervisor.start().await.unwrap();

        tokio::time::sleep(Duration::from_secs(17)).await;
        supervisor.stop().await.unwrap();

        let launches = supervisor.launcher.launches.lock().unwrap().clone();
        assert_eq!(launches.len(), 4);
        for pair in launches.windows(2) {
            assert!(pair[1] - pair[0] >= RELAUNCH_COOLDOWN);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_steady_state_launch_failures_are_retried() {
        let (supervisor, _registry) = supervisor(FakeLifetime::Immediate);
        supervisor.start().await.unwrap();

        // Later launches fail, but the loop keeps retrying
        supervisor.launcher.fail_spawn.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(12)).await;
        assert!(supervisor.is_running().await);
        assert!(supervisor.launcher.launch_count() >= 2);

        supervisor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_without_start() {
        let (supervisor, _registry) = supervisor(FakeLifetime::Immediate);
        assert!(matches!(supervisor.stop().await, Err(Error::NotRunning)));
    }
}
