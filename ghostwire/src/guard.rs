//! Deadline-bounded calls across the process boundary into a target application.
//!
//! Every accessibility read or action runs on a worker thread and the caller waits
//! with `recv_timeout`. A frozen target can wedge the worker forever, so a worker that
//! misses a deadline is abandoned and the next call gets a fresh one.

use crate::errors::AutomationError;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Mutex;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug)]
pub struct ForeignCallGuard {
    timeout: Duration,
    // Only held while cloning the sender, never across the wait.
    worker: Mutex<Option<mpsc::Sender<Job>>>,
}

impl ForeignCallGuard {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            worker: Mutex::new(None),
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Run `f` against the target with the guard's deadline.
    ///
    /// `f` must not call back into the guard: the worker runs one job at a time.
    pub fn call<T, F>(&self, what: &str, f: F) -> Result<T, AutomationError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, AutomationError> + Send + 'static,
    {
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let _ = result_tx.send(f());
        });

        let sender = self.sender()?;
        if let Err(mpsc::SendError(job)) = sender.send(job) {
            // The worker exited (it panicked inside a platform call); start over once.
            debug!(what, "foreign call worker gone, respawning");
            self.abandon_worker();
            self.sender()?.send(job).map_err(|_| {
                AutomationError::Internal(format!("foreign call worker unavailable for {what}"))
            })?;
        }

        match result_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    what,
                    timeout_ms = self.timeout.as_millis(),
                    "target did not answer in time, abandoning worker"
                );
                self.abandon_worker();
                Err(AutomationError::Timeout(format!(
                    "{what} did not complete within {:?}",
                    self.timeout
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AutomationError::PlatformError(format!(
                "{what} aborted inside the target process"
            ))),
        }
    }

    fn sender(&self) -> Result<mpsc::Sender<Job>, AutomationError> {
        let mut slot = self
            .worker
            .lock()
            .map_err(|_| AutomationError::Internal("foreign call guard poisoned".to_string()))?;
        if let Some(sender) = slot.as_ref() {
            return Ok(sender.clone());
        }
        let (tx, rx) = mpsc::channel::<Job>();
        thread::Builder::new()
            .name("ghostwire-ax-worker".to_string())
            .spawn(move || {
                // Exits once every sender is dropped and the queue drains.
                while let Ok(job) = rx.recv() {
                    job();
                }
            })
            .map_err(|e| AutomationError::Internal(format!("failed to spawn worker: {e}")))?;
        *slot = Some(tx.clone());
        Ok(tx)
    }

    fn abandon_worker(&self) {
        if let Ok(mut slot) = self.worker.lock() {
            slot.take();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn returns_value_within_deadline() {
        let guard = ForeignCallGuard::new(Duration::from_secs(1));
        let value = guard.call("answer", || Ok(42)).unwrap();
        assert_eq!(value, 42);
    }

    #[test]
    fn propagates_errors_from_the_call() {
        let guard = ForeignCallGuard::new(Duration::from_secs(1));
        let err = guard
            .call::<(), _>("fails", || {
                Err(AutomationError::PlatformError("nope".to_string()))
            })
            .unwrap_err();
        assert_eq!(err, AutomationError::PlatformError("nope".to_string()));
    }

    #[test]
    fn frozen_call_times_out_and_next_call_gets_fresh_worker() {
        let guard = ForeignCallGuard::new(Duration::from_millis(50));
        let start = Instant::now();
        let err = guard
            .call("frozen", || {
                thread::sleep(Duration::from_millis(500));
                Ok(())
            })
            .unwrap_err();
        assert!(matches!(err, AutomationError::Timeout(_)));
        assert!(start.elapsed() < Duration::from_millis(400));

        // The stuck worker is still sleeping; this must not queue behind it.
        let value = guard.call("after", || Ok("fresh")).unwrap();
        assert_eq!(value, "fresh");
    }

    #[test]
    fn panicking_call_reports_platform_error() {
        let guard = ForeignCallGuard::new(Duration::from_secs(1));
        let err = guard
            .call::<(), _>("panics", || panic!("target exploded"))
            .unwrap_err();
        assert!(matches!(err, AutomationError::PlatformError(_)));
        assert_eq!(guard.call("recovers", || Ok(1)).unwrap(), 1);
    }
}
