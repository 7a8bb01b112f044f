//! Bringing a target forward and giving focus back afterwards.

use crate::config::FocusConfig;
use crate::errors::AutomationError;
use crate::platforms::{AccessibilityEngine, ProcessInfo};
use crate::UIElement;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How an activation request ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FocusOutcome {
    Confirmed { pid: i32, attempts: u32 },
    /// The request was sent but the target never showed up as frontmost.
    Unconfirmed { pid: i32, attempts: u32 },
}

impl FocusOutcome {
    pub fn is_confirmed(&self) -> bool {
        matches!(self, FocusOutcome::Confirmed { .. })
    }

    pub fn pid(&self) -> i32 {
        match self {
            FocusOutcome::Confirmed { pid, .. } | FocusOutcome::Unconfirmed { pid, .. } => *pid,
        }
    }
}

/// The frontmost application at the start of an action.
#[derive(Debug, Clone)]
pub struct FocusSnapshot {
    pub process: Option<ProcessInfo>,
    pub taken_at: Instant,
}

pub struct FocusManager {
    engine: Arc<dyn AccessibilityEngine>,
    config: FocusConfig,
}

impl FocusManager {
    pub fn new(engine: Arc<dyn AccessibilityEngine>, config: FocusConfig) -> Self {
        Self { engine, config }
    }

    pub fn snapshot(&self) -> Result<FocusSnapshot, AutomationError> {
        Ok(FocusSnapshot {
            process: self.engine.frontmost_process()?,
            taken_at: Instant::now(),
        })
    }

    /// Activate a process by name, optionally raising one of its windows.
    #[instrument(skip(self))]
    pub fn focus(
        &self,
        process_name: &str,
        window_title: Option<&str>,
    ) -> Result<FocusOutcome, AutomationError> {
        let process = self.engine.process_by_name(process_name)?;
        let window = match window_title {
            Some(title) => self.engine.window(process.pid, Some(title))?,
            None => None,
        };
        self.focus_process(&process, window.as_ref())
    }

    /// Activate, then poll until the process is frontmost. A full round is retried
    /// before giving up with [`FocusOutcome::Unconfirmed`].
    #[instrument(skip(self, process, window), fields(pid = process.pid, app = %process.name))]
    pub fn focus_process(
        &self,
        process: &ProcessInfo,
        window: Option<&UIElement>,
    ) -> Result<FocusOutcome, AutomationError> {
        let start = Instant::now();
        if self.is_frontmost(process.pid)? {
            if let Some(window) = window {
                self.raise(window);
            }
            debug!("already frontmost");
            return Ok(FocusOutcome::Confirmed {
                pid: process.pid,
                attempts: 0,
            });
        }

        let rounds = 1 + self.config.retries;
        for attempt in 1..=rounds {
            self.engine.activate(process.pid)?;
            if let Some(window) = window {
                self.raise(window);
            }
            if self.poll_frontmost(process.pid)? {
                info!(
                    attempts = attempt,
                    duration_ms = start.elapsed().as_millis(),
                    "Activation confirmed"
                );
                return Ok(FocusOutcome::Confirmed {
                    pid: process.pid,
                    attempts: attempt,
                });
            }
            debug!(attempt, "activation not confirmed yet");
        }

        warn!(
            attempts = rounds,
            duration_ms = start.elapsed().as_millis(),
            "Activation sent but never confirmed"
        );
        Ok(FocusOutcome::Unconfirmed {
            pid: process.pid,
            attempts: rounds,
        })
    }

    /// Give focus back to the snapshot's process if something else is frontmost now.
    #[instrument(skip(self, snapshot))]
    pub fn restore(&self, snapshot: &FocusSnapshot) -> Result<(), AutomationError> {
        let Some(previous) = &snapshot.process else {
            return Ok(());
        };
        if self.is_frontmost(previous.pid)? {
            return Ok(());
        }
        debug!(pid = previous.pid, app = %previous.name, "restoring focus");
        self.engine.activate(previous.pid)
    }

    /// Runs `body` and restores the frontmost application afterwards, also when
    /// `body` fails or panics.
    pub fn with_focus_restore<T>(&self, body: impl FnOnce() -> T) -> T {
        let _restore = match self.snapshot() {
            Ok(snapshot) => Some(RestoreOnDrop {
                manager: self,
                snapshot,
            }),
            Err(e) => {
                warn!(error = %e, "cannot read the frontmost app; focus will not be restored");
                None
            }
        };
        body()
    }

    fn is_frontmost(&self, pid: i32) -> Result<bool, AutomationError> {
        Ok(self
            .engine
            .frontmost_process()?
            .is_some_and(|front| front.pid == pid))
    }

    fn poll_frontmost(&self, pid: i32) -> Result<bool, AutomationError> {
        let window = Duration::from_millis(self.config.confirm_window_ms);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let start = Instant::now();
        loop {
            if self.is_frontmost(pid)? {
                return Ok(true);
            }
            if start.elapsed() >= window {
                return Ok(false);
            }
            std::thread::sleep(interval);
        }
    }

    fn raise(&self, window: &UIElement) {
        if let Err(e) = self.engine.raise_window(window) {
            debug!(error = %e, "window raise failed");
        }
    }
}

struct RestoreOnDrop<'a> {
    manager: &'a FocusManager,
    snapshot: FocusSnapshot,
}

impl Drop for RestoreOnDrop<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.manager.restore(&self.snapshot) {
            warn!(error = %e, "focus restore failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::Rect;
    use crate::platforms::memory::{Activation, MemoryApp, MemoryEngine, MemoryNode};

    fn engine() -> Arc<MemoryEngine> {
        Arc::new(
            MemoryEngine::new()
                .with_app(MemoryApp::new(100, "Finder"))
                .with_app(
                    MemoryApp::new(200, "Mail")
                        .window(MemoryNode::window("Inbox", Rect::new(0.0, 0.0, 800.0, 600.0)))
                        .activation(Activation::Lagged(Duration::from_millis(120))),
                )
                .with_app(MemoryApp::new(300, "Stuck").activation(Activation::Ignored)),
        )
    }

    fn fast() -> FocusConfig {
        FocusConfig {
            poll_interval_ms: 10,
            confirm_window_ms: 300,
            retries: 1,
            restore: true,
        }
    }

    #[test]
    fn lagged_activation_is_confirmed_by_polling() {
        let engine = engine();
        let focus = FocusManager::new(engine.clone(), fast());
        let outcome = focus.focus("mail", Some("Inbox")).unwrap();
        assert_eq!(outcome, FocusOutcome::Confirmed { pid: 200, attempts: 1 });
        assert_eq!(engine.frontmost_pid(), Some(200));
    }

    #[test]
    fn ignored_activation_is_reported_unconfirmed_after_retry() {
        let engine = engine();
        let focus = FocusManager::new(engine.clone(), fast());
        let outcome = focus.focus("Stuck", None).unwrap();
        assert_eq!(outcome, FocusOutcome::Unconfirmed { pid: 300, attempts: 2 });
        assert_eq!(engine.activation_requests(300), 2);
    }

    #[test]
    fn restores_frontmost_even_when_the_body_fails() {
        let engine = engine();
        let focus = FocusManager::new(engine.clone(), fast());
        let result: Result<(), AutomationError> = focus.with_focus_restore(|| {
            engine.set_frontmost(300);
            Err(AutomationError::ExecutionFailed("boom".into()))
        });
        assert!(result.is_err());
        assert_eq!(engine.frontmost_pid(), Some(100));
    }

    #[test]
    fn restores_frontmost_when_the_body_panics() {
        let engine = engine();
        let focus = FocusManager::new(engine.clone(), fast());
        let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            focus.with_focus_restore(|| {
                engine.set_frontmost(300);
                panic!("body blew up");
            })
        }));
        assert!(outcome.is_err());
        assert_eq!(engine.frontmost_pid(), Some(100));
    }
}
