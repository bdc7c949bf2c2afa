//! Shutdown coordination
//!
//! Exactly one shutdown sequence runs per process. Whoever asks first
//! (a signal, a panic, or the daemon itself) drives it; later requests are
//! ignored and can wait for the outcome with [`LifecycleController::finished`].

use crate::error::Result;
use crate::events::{DaemonEvent, EventBus};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

pub const EXIT_OK: i32 = 0;
pub const EXIT_FATAL: i32 = 1;
pub const EXIT_TIMEOUT: i32 = 2;

pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// Why the process is going down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownReason {
    Signal(String),
    Fatal(String),
    Requested(String),
}

impl ShutdownReason {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ShutdownReason::Fatal(_))
    }
}

impl fmt::Display for ShutdownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShutdownReason::Signal(name) => write!(f, "received {}", name),
            ShutdownReason::Fatal(msg) => write!(f, "fatal error: {}", msg),
            ShutdownReason::Requested(msg) => f.write_str(msg),
        }
    }
}

pub struct LifecycleController {
    bus: EventBus,
    timeout: Duration,
    begun: AtomicBool,
    outcome: watch::Sender<Option<i32>>,
}

impl LifecycleController {
    pub fn new(bus: EventBus, timeout: Duration) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            bus,
            timeout,
            begun: AtomicBool::new(false),
            outcome,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_shutting_down(&self) -> bool {
        self.begun.load(Ordering::SeqCst)
    }

    /// Exit code once the shutdown sequence has finished
    pub fn exit_code(&self) -> Option<i32> {
        *self.outcome.borrow()
    }

    /// Run the shutdown sequence with `stop` bounded by the deadline.
    ///
    /// Returns the exit code, or `None` when a shutdown was already under way.
    pub async fn shutdown<F, Fut>(&self, reason: ShutdownReason, stop: F) -> Option<i32>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        if self.begun.swap(true, Ordering::SeqCst) {
            info!("Shutdown already in progress, ignoring: {}", reason);
            return None;
        }

        info!("Shutting down: {}", reason);
        self.bus.publish(DaemonEvent::DaemonStopping {
            reason: reason.to_string(),
        });

        let code = match tokio::time::timeout(self.timeout, stop()).await {
            Ok(Ok(())) if reason.is_fatal() => EXIT_FATAL,
            Ok(Ok(())) => EXIT_OK,
            Ok(Err(e)) => {
                error!("Error during shutdown: {}", e);
                EXIT_FATAL
            }
            Err(_) => {
                error!("Shutdown did not finish within {:?}", self.timeout);
                EXIT_TIMEOUT
            }
        };

        self.outcome.send_replace(Some(code));
        Some(code)
    }

    /// Wait until some caller has completed the shutdown sequence
    pub async fn finished(&self) -> i32 {
        let mut rx = self.outcome.subscribe();
        let code = match rx.wait_for(|code| code.is_some()).await {
            Ok(code) => (*code).unwrap_or(EXIT_OK),
            Err(_) => EXIT_FATAL,
        };
        code
    }
}

/// Resolve on the first SIGINT, SIGTERM or SIGHUP
pub async fn wait_for_signal() -> ShutdownReason {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Cannot listen for SIGINT: {}", e);
            std::future::pending::<()>().await;
        }
        "SIGINT".to_string()
    };

    #[cfg(unix)]
    {
        use tokio::signal::unix::SignalKind;
        tokio::select! {
            name = ctrl_c => ShutdownReason::Signal(name),
            name = unix_signal(SignalKind::terminate(), "SIGTERM") => ShutdownReason::Signal(name),
            name = unix_signal(SignalKind::hangup(), "SIGHUP") => ShutdownReason::Signal(name),
        }
    }

    #[cfg(not(unix))]
    {
        ShutdownReason::Signal(ctrl_c.await)
    }
}

#[cfg(unix)]
async fn unix_signal(kind: tokio::signal::unix::SignalKind, name: &'static str) -> String {
    match tokio::signal::unix::signal(kind) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for {}: {}", name, e);
            std::future::pending::<()>().await;
        }
    }
    name.to_string()
}

/// Chain a panic hook that reports a fatal shutdown request.
///
/// The previous hook still runs first, so the panic message is printed as usual.
pub fn install_panic_hook(tx: mpsc::UnboundedSender<ShutdownReason>) {
    let previous = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        previous(info);
        let _ = tx.send(ShutdownReason::Fatal(format!("panic: {}", info)));
    }));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::DaemonError;
    use std::sync::Arc;

    fn controller(timeout: Duration) -> (LifecycleController, EventBus) {
        let bus = EventBus::default();
        (LifecycleController::new(bus.clone(), timeout), bus)
    }

    #[tokio::test]
    async fn test_clean_shutdown_exits_zero() {
        let (lc, bus) = controller(Duration::from_secs(1));
        let code = lc
            .shutdown(ShutdownReason::Signal("SIGTERM".into()), || async { Ok(()) })
            .await;
        assert_eq!(code, Some(EXIT_OK));
        assert_eq!(lc.exit_code(), Some(EXIT_OK));

        let stopping = bus.history_of("daemon_stopping", 10);
        assert_eq!(stopping.len(), 1);
        assert_eq!(
            stopping[0].event,
            DaemonEvent::DaemonStopping {
                reason: "received SIGTERM".into()
            }
        );
    }

    #[tokio::test]
    async fn test_second_request_is_ignored() {
        let (lc, bus) = controller(Duration::from_secs(1));
        lc.shutdown(ShutdownReason::Requested("done".into()), || async { Ok(()) })
            .await;
        let ran_again = Arc::new(AtomicBool::new(false));
        let flag = ran_again.clone();
        let again = lc
            .shutdown(ShutdownReason::Signal("SIGINT".into()), move || async move {
                flag.store(true, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(again, None);
        assert!(!ran_again.load(Ordering::SeqCst));
        assert_eq!(bus.history_of("daemon_stopping", 10).len(), 1);
    }

    #[tokio::test]
    async fn test_deadline_exceeded_exits_two() {
        let (lc, _bus) = controller(Duration::from_millis(50));
        let code = lc
            .shutdown(ShutdownReason::Signal("SIGTERM".into()), || async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert_eq!(code, Some(EXIT_TIMEOUT));
    }

    #[tokio::test]
    async fn test_fatal_and_failed_stop_exit_one() {
        let (lc, _bus) = controller(Duration::from_secs(1));
        let code = lc
            .shutdown(ShutdownReason::Fatal("panic".into()), || async { Ok(()) })
            .await;
        assert_eq!(code, Some(EXIT_FATAL));

        let (lc, _bus) = controller(Duration::from_secs(1));
        let code = lc
            .shutdown(ShutdownReason::Signal("SIGTERM".into()), || async {
                Err(DaemonError::StoreClosed)
            })
            .await;
        assert_eq!(code, Some(EXIT_FATAL));
    }

    #[tokio::test]
    async fn test_finished_waits_for_outcome() {
        let (lc, _bus) = controller(Duration::from_secs(1));
        let lc = Arc::new(lc);

        let waiter = {
            let lc = lc.clone();
            tokio::spawn(async move { lc.finished().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        lc.shutdown(ShutdownReason::Requested("max iterations".into()), || async { Ok(()) })
            .await;
        assert_eq!(waiter.await.unwrap(), EXIT_OK);
    }

    #[test]
    fn test_reason_display() {
        assert_eq!(ShutdownReason::Signal("SIGHUP".into()).to_string(), "received SIGHUP");
        assert!(ShutdownReason::Fatal("x".into()).is_fatal());
        assert!(!ShutdownReason::Requested("x".into()).is_fatal());
    }
}
