//! Readiness gate.
//!
//! A one-shot latch a generation fires once its listeners accept
//! connections. Waiting after the latch fired returns immediately, so there
//! is no missed-wakeup window between signalling and waiting.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info};

/// Forwards the readiness signal outside the process
pub trait ReadyNotifier: Send + Sync {
    fn notify_ready(&self) -> io::Result<()>;
}

/// One-shot readiness latch
pub struct ReadinessGate {
    ready: watch::Sender<bool>,
    notifier: Option<Arc<dyn ReadyNotifier>>,
}

impl ReadinessGate {
    pub fn new() -> Self {
        Self {
            ready: watch::Sender::new(false),
            notifier: None,
        }
    }

    /// Gate that also tells `notifier` when it fires
    pub fn with_notifier(notifier: Arc<dyn ReadyNotifier>) -> Self {
        Self {
            ready: watch::Sender::new(false),
            notifier: Some(notifier),
        }
    }

    /// Fire the latch.
    ///
    /// Returns `Ok(true)` the first time and `Ok(false)` on every later call,
    /// which does nothing. The notifier runs only on the first call; its
    /// error is returned but the local latch stays fired.
    pub fn signal_ready(&self) -> io::Result<bool> {
        let first = self.ready.send_if_modified(|ready| {
            if *ready {
                false
            } else {
                *ready = true;
                true
            }
        });

        if !first {
            debug!("Readiness already signalled");
            return Ok(false);
        }

        info!("Generation signalled readiness");
        if let Some(notifier) = &self.notifier {
            notifier.notify_ready()?;
        }
        Ok(true)
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the latch fires; `false` if `timeout` elapsed first
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        let mut rx = self.ready.subscribe();
        let ready = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|ready| *ready)).await,
            Ok(Ok(_))
        );
        ready
    }
}

impl Default for ReadinessGate {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingNotifier(AtomicUsize);

    impl ReadyNotifier for CountingNotifier {
        fn notify_ready(&self) -> io::Result<()> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct BrokenNotifier;

    impl ReadyNotifier for BrokenNotifier {
        fn notify_ready(&self) -> io::Result<()> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }
    }

    #[tokio::test]
    async fn test_signal_before_wait() {
        let gate = ReadinessGate::new();
        assert!(gate.signal_ready().unwrap());
        assert!(gate.is_ready());
        assert!(gate.wait_ready(Duration::from_millis(10)).await);
    }

    #[tokio::test]
    async fn test_wait_before_signal() {
        let gate = Arc::new(ReadinessGate::new());
        let waiter = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move { gate.wait_ready(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        gate.signal_ready().unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let gate = ReadinessGate::new();
        assert!(!gate.wait_ready(Duration::from_millis(20)).await);
        assert!(!gate.is_ready());
    }

    #[tokio::test]
    async fn test_second_signal_is_noop() {
        let notifier = Arc::new(CountingNotifier::default());
        let gate = ReadinessGate::with_notifier(notifier.clone());

        assert!(gate.signal_ready().unwrap());
        assert!(!gate.signal_ready().unwrap());
        assert_eq!(notifier.0.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notifier_failure_keeps_latch() {
        let gate = ReadinessGate::with_notifier(Arc::new(BrokenNotifier));
        assert!(gate.signal_ready().is_err());
        assert!(gate.is_ready());
        assert!(!gate.signal_ready().unwrap());
    }
}
