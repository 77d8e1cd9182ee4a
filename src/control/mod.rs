//! Authenticated control surface
//!
//! The externally reachable endpoints: status query, console-lock
//! toggle, operator alerts, and power actions. Every write routes
//! through an identity check before acting; the caller's peer
//! credentials are the entire trust boundary.
//!
//! There is a narrow window between the helper being exec'd and its
//! identity landing in the registry during which the helper's own
//! requests are refused. This mirrors the registration handshake and is
//! accepted.

pub mod protocol;
pub mod server;

use crate::console::ConsoleLock;
use crate::error::{Error, Result};
use crate::power::{PowerAction, PowerController};
use crate::registry::IdentityRegistry;
use self::protocol::{Request, Response};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Upper bound on alert payloads.
pub const MAX_ALERT_BYTES: usize = 1024;

/// Identity of a control caller, taken from peer credentials.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Principal {
    /// Caller pid; 0 when the transport could not resolve one.
    pub pid: i32,
    /// Caller uid.
    pub uid: u32,
}

impl Principal {
    /// Whether this is an administrative caller.
    pub fn privileged(&self) -> bool {
        self.uid == 0
    }
}

/// Timestamps captured when the daemon came up.
#[derive(Debug, Clone, Copy)]
pub struct InsertTime {
    /// Wall-clock nanoseconds since the Unix epoch.
    pub wall_ns: i64,
    /// Boot-relative monotonic nanoseconds (CLOCK_BOOTTIME).
    pub boot_ns: i64,
}

impl InsertTime {
    /// Capture the current instant on both clocks.
    pub fn now() -> Self {
        let wall_ns = chrono::Utc::now().timestamp_nanos_opt().unwrap_or(i64::MAX);
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        unsafe { libc::clock_gettime(libc::CLOCK_BOOTTIME, &mut ts) };
        let boot_ns = ts.tv_sec as i64 * 1_000_000_000 + ts.tv_nsec as i64;
        Self { wall_ns, boot_ns }
    }
}

/// The authenticated control endpoints.
pub struct ControlSurface {
    registry: Arc<IdentityRegistry>,
    console: Arc<ConsoleLock>,
    power: Arc<dyn PowerController>,
    power_pending: AtomicBool,
    inserted: InsertTime,
}

impl ControlSurface {
    pub fn new(
        registry: Arc<IdentityRegistry>,
        console: Arc<ConsoleLock>,
        power: Arc<dyn PowerController>,
    ) -> Self {
        Self {
            registry,
            console,
            power,
            power_pending: AtomicBool::new(false),
            inserted: InsertTime::now(),
        }
    }

    /// Current helper pid, or 0 when none is running.
    pub fn pid(&self) -> i32 {
        self.registry.pid()
    }

    /// Daemon start timestamps.
    pub fn insert_time(&self) -> InsertTime {
        self.inserted
    }

    /// Current console lock flag.
    pub fn lock(&self) -> bool {
        self.console.locked()
    }

    /// Engage or release the console lock. Privileged callers only.
    pub fn set_lock(&self, caller: Principal, locked: bool) -> Result<()> {
        if !caller.privileged() {
            return Err(Error::Forbidden);
        }
        self.console.set_locked(locked)
    }

    /// Surface an operator alert from the helper.
    pub fn alert(&self, caller: Principal, message: &[u8]) -> Result<()> {
        self.authenticate_helper(caller)?;
        if message.len() > MAX_ALERT_BYTES {
            return Err(Error::TooLarge);
        }
        let text = String::from_utf8_lossy(message);
        tracing::error!(target: "vigild::alert", pid = caller.pid, "{}", text);
        Ok(())
    }

    /// Accept a power action from the helper and schedule its execution.
    ///
    /// Durable state is flushed before this returns; the action itself
    /// runs on a detached one-shot task and is expected to terminate the
    /// system.
    pub fn power(&self, caller: Principal, body: &str) -> Result<()> {
        self.authenticate_helper(caller)?;
        let action = PowerAction::parse(body)?;
        if self
            .power_pending
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::Busy);
        }

        tracing::warn!(?action, pid = caller.pid, "power action accepted");
        self.power.flush();
        let controller = Arc::clone(&self.power);
        tokio::task::spawn_blocking(move || controller.initiate(action));
        Ok(())
    }

    /// Execute one control request on behalf of `caller`.
    pub fn handle(&self, caller: Principal, request: Request) -> Response {
        let result = match request {
            Request::Pid => return Response::Pid { pid: self.pid() },
            Request::InsertTime => {
                let t = self.insert_time();
                return Response::InsertTime {
                    wall_ns: t.wall_ns,
                    boot_ns: t.boot_ns,
                };
            }
            Request::GetLock => {
                return Response::Lock {
                    locked: self.lock(),
                }
            }
            Request::SetLock { locked } => self.set_lock(caller, locked),
            Request::Alert { message } => self.alert(caller, message.as_bytes()),
            Request::Power { action } => self.power(caller, &action),
        };
        match result {
            Ok(()) => Response::Ok,
            Err(e) => Response::error(&e),
        }
    }

    fn authenticate_helper(&self, caller: Principal) -> Result<()> {
        let registered = self.registry.pid();
        if registered == 0 || caller.pid == 0 || caller.pid != registered {
            return Err(Error::Forbidden);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::tests::FakeGate;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    /// Records flushes and initiated actions instead of acting on them.
    #[derive(Default)]
    struct RecordingPower {
        flushes: AtomicUsize,
        actions: Mutex<Vec<PowerAction>>,
    }

    impl PowerController for Arc<RecordingPower> {
        fn flush(&self) {
            self.flushes.fetch_add(1, Ordering::SeqCst);
        }

        fn initiate(&self, action: PowerAction) {
            self.actions.lock().unwrap().push(action);
        }
    }

    const HELPER: Principal = Principal { pid: 4242, uid: 0 };
    const STRANGER: Principal = Principal { pid: 4243, uid: 1000 };
    const ADMIN: Principal = Principal { pid: 77, uid: 0 };
    const NOBODY: Principal = Principal { pid: 0, uid: 1000 };

    fn surface() -> (ControlSurface, Arc<RecordingPower>, Arc<IdentityRegistry>) {
        let registry = Arc::new(IdentityRegistry::new());
        let gate = Arc::new(FakeGate::default());
        let console = Arc::new(ConsoleLock::new(gate, 25));
        let power = Arc::new(RecordingPower::default());
        let surface = ControlSurface::new(
            Arc::clone(&registry),
            console,
            Arc::new(Arc::clone(&power)),
        );
        (surface, power, registry)
    }

    async fn wait_for_actions(power: &RecordingPower, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while power.actions.lock().unwrap().len() < count {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[test]
    fn test_pid_reports_zero_without_helper() {
        let (surface, _power, registry) = surface();
        assert_eq!(surface.pid(), 0);
        registry.register(4242).unwrap();
        assert_eq!(surface.pid(), 4242);
    }

    #[test]
    fn test_insert_time_is_captured() {
        let (surface, _power, _registry) = surface();
        let t = surface.insert_time();
        assert!(t.wall_ns > 0);
        assert!(t.boot_ns > 0);
    }

    #[test]
    fn test_alert_requires_matching_pid() {
        let (surface, _power, registry) = surface();
        registry.register(HELPER.pid).unwrap();

        surface.alert(HELPER, b"tamper detected").unwrap();
        assert!(matches!(
            surface.alert(STRANGER, b"fake"),
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            surface.alert(NOBODY, b"fake"),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn test_alert_rejected_without_helper() {
        let (surface, _power, _registry) = surface();
        assert!(matches!(
            surface.alert(HELPER, b"anyone there"),
            Err(Error::Forbidden)
        ));
    }

    #[test]
    fn test_alert_size_bound() {
        let (surface, _power, registry) = surface();
        registry.register(HELPER.pid).unwrap();

        let max = vec![b'a'; MAX_ALERT_BYTES];
        surface.alert(HELPER, &max).unwrap();

        let too_big = vec![b'a'; MAX_ALERT_BYTES + 1];
        assert!(matches!(
            surface.alert(HELPER, &too_big),
            Err(Error::TooLarge)
        ));
    }

    #[tokio::test]
    async fn test_power_schedules_exactly_one_action() {
        let (surface, power, registry) = surface();
        registry.register(HELPER.pid).unwrap();

        surface.power(HELPER, "poweroff").unwrap();
        assert!(matches!(
            surface.power(HELPER, "poweroff"),
            Err(Error::Busy)
        ));
        assert!(matches!(surface.power(HELPER, "reboot"), Err(Error::Busy)));

        wait_for_actions(&power, 1).await;
        assert_eq!(*power.actions.lock().unwrap(), vec![PowerAction::Poweroff]);
        assert_eq!(power.flushes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_power_rejections_do_not_consume_token() {
        let (surface, power, registry) = surface();
        registry.register(HELPER.pid).unwrap();

        assert!(matches!(
            surface.power(STRANGER, "poweroff"),
            Err(Error::Forbidden)
        ));
        assert!(matches!(
            surface.power(HELPER, "halt"),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(power.flushes.load(Ordering::SeqCst), 0);

        surface.power(HELPER, "reboot").unwrap();
        wait_for_actions(&power, 1).await;
        assert_eq!(*power.actions.lock().unwrap(), vec![PowerAction::Reboot]);
    }

    #[test]
    fn test_set_lock_requires_privilege() {
        let (surface, _power, _registry) = surface();
        assert!(matches!(
            surface.set_lock(STRANGER, true),
            Err(Error::Forbidden)
        ));
        assert!(!surface.lock());

        surface.set_lock(ADMIN, true).unwrap();
        assert!(surface.lock());
        surface.set_lock(ADMIN, false).unwrap();
        assert!(!surface.lock());
    }

    #[tokio::test]
    async fn test_handle_dispatch() {
        let (surface, _power, registry) = surface();
        registry.register(HELPER.pid).unwrap();

        assert_eq!(
            surface.handle(NOBODY, Request::Pid),
            Response::Pid { pid: HELPER.pid }
        );
        assert_eq!(
            surface.handle(NOBODY, Request::GetLock),
            Response::Lock { locked: false }
        );
        assert_eq!(
            surface.handle(
                HELPER,
                Request::Alert {
                    message: "ping".into()
                }
            ),
            Response::Ok
        );
        match surface.handle(
            STRANGER,
            Request::Power {
                action: "poweroff".into(),
            },
        ) {
            Response::Error { kind, .. } => {
                assert_eq!(kind, protocol::ErrorKind::Forbidden)
            }
            other => panic!("unexpected response: {other:?}"),
        }
        match surface.handle(NOBODY, Request::InsertTime) {
            Response::InsertTime { wall_ns, boot_ns } => {
                assert!(wall_ns > 0);
                assert!(boot_ns > 0);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
}
