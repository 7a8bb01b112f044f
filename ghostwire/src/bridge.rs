//! Synchronous bridge for asynchronous capture and peer calls.
//!
//! The request loop is blocking, while window capture and the grounding and DevTools
//! peers are async. `SyncBridge::run` drives one future on a private runtime and
//! waits for it with a wall-clock deadline. A single-slot permit channel allows at
//! most one bridged call in flight; the permit moves into the spawned task, so a
//! call that overran its deadline keeps the slot until it actually finishes.

use crate::errors::AutomationError;
use std::future::Future;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

// Extra wait on the outer receive so the in-task timeout normally fires first.
const DEADLINE_GRACE: Duration = Duration::from_millis(250);

pub struct SyncBridge {
    runtime: Option<tokio::runtime::Runtime>,
    permit_tx: SyncSender<()>,
    permit_rx: Mutex<Receiver<()>>,
}

/// Proof that the holder owns the single in-flight slot. Dropping it frees the slot.
struct InFlightPermit {
    release: SyncSender<()>,
}

impl Drop for InFlightPermit {
    fn drop(&mut self) {
        let _ = self.release.try_send(());
    }
}

impl SyncBridge {
    pub fn new() -> Result<Self, AutomationError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("ghostwire-bridge")
            .enable_all()
            .build()
            .map_err(|e| AutomationError::Internal(format!("failed to start bridge runtime: {e}")))?;
        let (permit_tx, permit_rx) = mpsc::sync_channel(1);
        permit_tx
            .send(())
            .map_err(|_| AutomationError::Internal("bridge permit channel closed".to_string()))?;
        Ok(Self {
            runtime: Some(runtime),
            permit_tx,
            permit_rx: Mutex::new(permit_rx),
        })
    }

    /// Whether a bridged call is currently outstanding.
    pub fn is_busy(&self) -> bool {
        match self.permit_rx.lock() {
            Ok(rx) => match rx.try_recv() {
                Ok(()) => {
                    let _ = self.permit_tx.try_send(());
                    false
                }
                Err(_) => true,
            },
            Err(_) => true,
        }
    }

    /// Block on `future` for at most `deadline`.
    #[instrument(level = "debug", skip(self, future))]
    pub fn run<F, T>(&self, label: &str, deadline: Duration, future: F) -> Result<T, AutomationError>
    where
        F: Future<Output = Result<T, AutomationError>> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire(label)?;
        let start = Instant::now();
        let (result_tx, result_rx) = mpsc::sync_channel(1);
        let task_label = label.to_string();

        self.runtime()?.spawn(async move {
            let outcome = match tokio::time::timeout(deadline, future).await {
                Ok(result) => result,
                Err(_) => Err(AutomationError::Timeout(format!(
                    "{task_label} exceeded its {deadline:?} deadline"
                ))),
            };
            // Free the slot before the caller wakes up.
            drop(permit);
            let _ = result_tx.send(outcome);
        });

        match result_rx.recv_timeout(deadline + DEADLINE_GRACE) {
            Ok(result) => {
                debug!(
                    label,
                    duration_ms = start.elapsed().as_millis(),
                    ok = result.is_ok(),
                    "bridged call finished"
                );
                result
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(label, ?deadline, "bridged call overran its deadline");
                Err(AutomationError::Timeout(format!(
                    "{label} exceeded its {deadline:?} deadline"
                )))
            }
            Err(RecvTimeoutError::Disconnected) => Err(AutomationError::Internal(format!(
                "{label} was dropped before producing a result"
            ))),
        }
    }

    fn runtime(&self) -> Result<&tokio::runtime::Runtime, AutomationError> {
        self.runtime
            .as_ref()
            .ok_or_else(|| AutomationError::Internal("bridge runtime already shut down".to_string()))
    }

    fn acquire(&self, label: &str) -> Result<InFlightPermit, AutomationError> {
        let rx = self
            .permit_rx
            .lock()
            .map_err(|_| AutomationError::Internal("bridge permit lock poisoned".to_string()))?;
        match rx.try_recv() {
            Ok(()) => Ok(InFlightPermit {
                release: self.permit_tx.clone(),
            }),
            Err(TryRecvError::Empty) => Err(AutomationError::Busy(format!(
                "cannot start {label} while another capture or peer call is outstanding"
            ))),
            Err(TryRecvError::Disconnected) => Err(AutomationError::Internal(
                "bridge permit channel closed".to_string(),
            )),
        }
    }
}

impl Drop for SyncBridge {
    fn drop(&mut self) {
        // Abandoned calls keep running on the worker threads; do not wait for them.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

impl std::fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncBridge")
            .field("busy", &self.is_busy())
            .finish()
    }
}
