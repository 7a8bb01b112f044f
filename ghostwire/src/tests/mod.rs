mod e2e_tests;

use crate::devtools::{StructuralMatch, StructuralPeer, StructuralQuery};
use crate::grounding::{GroundRequest, GroundResponse, GroundingPeer};
use crate::platforms::memory::MemoryEngine;
use crate::{AutomationError, Config, Desktop};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

// Initialize tracing for tests. Safe to call from every test.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(tracing::Level::DEBUG.into()))
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .with_test_writer()
        .try_init();
}

/// Fast focus polling and no typing delays.
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.focus.poll_interval_ms = 5;
    config.focus.confirm_window_ms = 100;
    config.typing.char_delay_ms = 0;
    config.typing.settle_ms = 0;
    config
}

pub fn desktop(engine: &Arc<MemoryEngine>) -> Desktop {
    Desktop::with_engine(engine.clone(), test_config()).unwrap()
}

/// Structural peer with canned matches that records every query.
#[derive(Default)]
pub struct CannedStructural {
    pub matches: Vec<StructuralMatch>,
    pub queries: Mutex<Vec<StructuralQuery>>,
}

#[async_trait::async_trait]
impl StructuralPeer for CannedStructural {
    async fn query(&self, query: StructuralQuery) -> Result<Vec<StructuralMatch>, AutomationError> {
        if let Ok(mut queries) = self.queries.lock() {
            queries.push(query);
        }
        Ok(self.matches.clone())
    }
}

impl CannedStructural {
    pub fn calls(&self) -> usize {
        self.queries.lock().map(|q| q.len()).unwrap_or(0)
    }
}

/// Grounding peer that always answers the centre of the capture.
pub struct CannedGrounding {
    pub confidence: f64,
    pub calls: AtomicUsize,
}

impl CannedGrounding {
    pub fn new(confidence: f64) -> Self {
        Self {
            confidence,
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait::async_trait]
impl GroundingPeer for CannedGrounding {
    async fn ground(&self, request: GroundRequest) -> Result<GroundResponse, AutomationError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(GroundResponse {
            x: request.screen_w / 2.0,
            y: request.screen_h / 2.0,
            normalized_x: Some(0.5),
            normalized_y: Some(0.5),
            confidence: self.confidence,
            raw: "[0.5, 0.5]".to_string(),
            inference_ms: 5,
            method: Some("full-screen".to_string()),
            error: None,
        })
    }
}
