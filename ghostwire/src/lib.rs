//! Desktop UI automation through accessibility APIs
//!
//! Resolves human-level descriptions of UI targets ("the Compose button") against a
//! running application's accessibility tree, falls back to a browser's DevTools
//! endpoint and to visual grounding when the tree is not informative, and acts on the
//! result with verification.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument, warn};

pub mod actions;
pub mod bridge;
pub mod cascade;
pub mod config;
pub mod devtools;
pub mod element;
pub mod errors;
pub mod focus;
pub mod geometry;
pub mod grounding;
pub mod guard;
pub mod keys;
pub mod locator;
pub mod platforms;
pub mod response;
pub mod roles;
pub mod search;
#[cfg(test)]
mod tests;
pub mod utils;

pub use actions::{ActionResult, AttemptOutcome, ExecutionTier, ScrollDirection, TierAttempt};
pub use bridge::SyncBridge;
pub use cascade::{Cascade, Resolution, ResolutionSummary, Resolved, Source, Target, TrailEntry};
pub use config::Config;
pub use devtools::{StructuralMatch, StructuralPeer, StructuralQuery};
pub use element::{CallScope, Candidate, ElementHandle, ElementSummary, UIElement, UIElementAttributes};
pub use errors::{AutomationError, ErrorKind};
pub use focus::{FocusOutcome, FocusSnapshot};
pub use geometry::{Point, Rect, Size};
pub use grounding::{GroundRequest, GroundResponse, GroundingPeer};
pub use keys::KeyCombo;
pub use locator::Locator;
pub use platforms::{AccessibilityEngine, MouseButton, ProcessInfo};
pub use response::{Request, Response};
pub use search::SearchIntent;

use actions::ActionExecutor;
use cascade::TierContext;
use devtools::DevToolsClient;
use focus::FocusManager;
use grounding::GroundingClient;

/// Which application (and optionally which of its windows) a request is aimed at.
/// With no app the frontmost application is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppTarget {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ResolveRequest {
    #[serde(flatten)]
    pub target: AppTarget,
    #[serde(flatten)]
    pub locator: Locator,
    #[serde(default)]
    pub intent: SearchIntent,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ClickRequest {
    #[serde(flatten)]
    pub target: AppTarget,
    #[serde(flatten)]
    pub locator: Locator,
    #[serde(default)]
    pub x: Option<f64>,
    #[serde(default)]
    pub y: Option<f64>,
    #[serde(default)]
    pub button: MouseButton,
    #[serde(default = "single_click")]
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct TypeRequest {
    #[serde(flatten)]
    pub target: AppTarget,
    /// Empty means "whatever holds keyboard focus"
    #[serde(flatten)]
    pub locator: Locator,
    pub text: String,
    #[serde(default)]
    pub clear: bool,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct PressRequest {
    #[serde(flatten)]
    pub target: AppTarget,
    pub key: String,
    #[serde(default)]
    pub modifiers: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct HotkeyRequest {
    #[serde(flatten)]
    pub target: AppTarget,
    /// Modifiers followed by the key, e.g. `["cmd", "shift", "t"]`
    pub keys: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ScrollRequest {
    #[serde(flatten)]
    pub target: AppTarget,
    pub direction: ScrollDirection,
    /// Wheel lines
    #[serde(default = "default_scroll_amount")]
    pub amount: u32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FocusRequest {
    pub app: String,
    #[serde(default)]
    pub window: Option<String>,
}

fn single_click() -> u32 {
    1
}

fn default_scroll_amount() -> u32 {
    3
}

/// Where a locator resolved, without acting on it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolveReport {
    pub source: Source,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementSummary>,
    pub candidates: Vec<ResolutionSummary>,
    pub fallback_trail: Vec<TrailEntry>,
    pub duration_ms: u64,
}

/// The main entry point for UI automation
pub struct Desktop {
    engine: Arc<dyn AccessibilityEngine>,
    config: Config,
    bridge: SyncBridge,
    cascade: Cascade,
    focus: Arc<FocusManager>,
    executor: ActionExecutor,
}

/// Assembles a [`Desktop`] from an engine and optional peers.
pub struct DesktopBuilder {
    config: Config,
    engine: Option<Arc<dyn AccessibilityEngine>>,
    structural: Option<Arc<dyn StructuralPeer>>,
    grounding: Option<Arc<dyn GroundingPeer>>,
}

impl DesktopBuilder {
    pub fn engine(mut self, engine: Arc<dyn AccessibilityEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn structural_peer(mut self, peer: Arc<dyn StructuralPeer>) -> Self {
        self.structural = Some(peer);
        self
    }

    pub fn grounding_peer(mut self, peer: Arc<dyn GroundingPeer>) -> Self {
        self.grounding = Some(peer);
        self
    }

    pub fn build(self) -> Result<Desktop, AutomationError> {
        let engine = match self.engine {
            Some(engine) => engine,
            None => platforms::create_engine(&self.config)?,
        };
        let structural = self.structural.filter(|_| self.config.structural.enabled);
        let grounding = self.grounding.filter(|_| self.config.vision.enabled);
        let focus = Arc::new(FocusManager::new(engine.clone(), self.config.focus.clone()));
        Ok(Desktop {
            executor: ActionExecutor::new(engine.clone(), focus.clone(), self.config.typing.clone()),
            cascade: Cascade::standard(structural, grounding),
            bridge: SyncBridge::new()?,
            focus,
            engine,
            config: self.config,
        })
    }
}

impl Desktop {
    /// Platform engine plus the DevTools and grounding clients the config enables.
    #[instrument(skip(config))]
    pub fn new(config: Config) -> Result<Self, AutomationError> {
        let start = Instant::now();
        info!("Initializing Desktop automation engine");

        let mut builder = Self::builder(config.clone());
        if config.structural.enabled {
            builder = builder.structural_peer(Arc::new(DevToolsClient::new(
                config.structural.devtools_ports.clone(),
                config.structural.max_matches,
            )?));
        }
        if config.vision.enabled {
            builder = builder.grounding_peer(Arc::new(GroundingClient::new(
                &config.vision,
                config.vision_port(),
            )?));
        }
        let desktop = builder.build()?;

        info!(
            duration_ms = start.elapsed().as_millis(),
            tiers = ?desktop.cascade.sources(),
            "Desktop automation engine initialized"
        );
        Ok(desktop)
    }

    pub fn builder(config: Config) -> DesktopBuilder {
        DesktopBuilder {
            config,
            engine: None,
            structural: None,
            grounding: None,
        }
    }

    /// A desktop over `engine` with no external peers.
    pub fn with_engine(engine: Arc<dyn AccessibilityEngine>, config: Config) -> Result<Self, AutomationError> {
        Self::builder(config).engine(engine).build()
    }

    pub fn engine(&self) -> &Arc<dyn AccessibilityEngine> {
        &self.engine
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    #[instrument(skip(self, request), fields(locator = %request.locator.describe()))]
    pub fn resolve(&self, request: &ResolveRequest) -> Result<ResolveReport, AutomationError> {
        let start = Instant::now();
        let scope = CallScope::new();
        let target = self.target(&scope, &request.target)?;
        let resolved = self.resolve_in(&scope, &target, &request.locator, request.intent)?;

        let best = resolved.best().summary();
        let report = ResolveReport {
            source: resolved.source,
            point: best.point,
            score: best.score,
            confidence: best.confidence,
            element: best.element,
            candidates: resolved
                .resolutions
                .iter()
                .take(self.config.search.max_candidates.max(1))
                .map(Resolution::summary)
                .collect(),
            fallback_trail: resolved.trail,
            duration_ms: start.elapsed().as_millis() as u64,
        };
        info!(
            source = report.source.as_str(),
            duration_ms = report.duration_ms,
            "Locator resolved"
        );
        Ok(report)
    }

    #[instrument(skip(self, request), fields(locator = %request.locator.describe()))]
    pub fn click(&self, request: &ClickRequest) -> Result<ActionResult, AutomationError> {
        let start = Instant::now();
        let result = self.restoring_focus(|| {
            let scope = CallScope::new();
            match (request.x, request.y) {
                (Some(x), Some(y)) => {
                    let target = match request.target.app {
                        Some(_) => Some(self.target(&scope, &request.target)?),
                        None => None,
                    };
                    self.executor
                        .click_at(target.as_ref(), Point::new(x, y), request.button, request.count)
                }
                (None, None) => {
                    let target = self.target(&scope, &request.target)?;
                    let Resolved {
                        source,
                        resolutions,
                        trail,
                    } = self.resolve_in(&scope, &target, &request.locator, SearchIntent::Locate)?;
                    let best = &resolutions[0];
                    Ok(self
                        .executor
                        .click(&target, best, request.button, request.count)?
                        .with_resolution(source, best, trail))
                }
                _ => Err(AutomationError::InvalidArgument(
                    "coordinates need both x and y".to_string(),
                )),
            }
        });
        log_outcome("Click", start, &result);
        result
    }

    #[instrument(skip(self, request), fields(locator = %request.locator.describe(), clear = request.clear))]
    pub fn type_text(&self, request: &TypeRequest) -> Result<ActionResult, AutomationError> {
        let start = Instant::now();
        let result = self.restoring_focus(|| {
            let scope = CallScope::new();
            let target = self.target(&scope, &request.target)?;
            if request.locator.is_empty() {
                return self
                    .executor
                    .type_text(&target, None, &request.text, request.clear);
            }
            let Resolved {
                source,
                resolutions,
                trail,
            } = self.resolve_in(&scope, &target, &request.locator, SearchIntent::Edit)?;
            let best = &resolutions[0];
            Ok(self
                .executor
                .type_text(&target, Some(best), &request.text, request.clear)?
                .with_resolution(source, best, trail))
        });
        log_outcome("Type", start, &result);
        result
    }

    #[instrument(skip(self, request), fields(key = %request.key))]
    pub fn press(&self, request: &PressRequest) -> Result<ActionResult, AutomationError> {
        let start = Instant::now();
        let combo = KeyCombo::from_parts(&request.key, &request.modifiers)?;
        let result = self.press_combo(&request.target, &combo);
        log_outcome("Key press", start, &result);
        result
    }

    #[instrument(skip(self, request), fields(keys = ?request.keys))]
    pub fn hotkey(&self, request: &HotkeyRequest) -> Result<ActionResult, AutomationError> {
        let start = Instant::now();
        let combo = KeyCombo::from_keys(&request.keys)?;
        let result = self.press_combo(&request.target, &combo);
        log_outcome("Hotkey", start, &result);
        result
    }

    #[instrument(skip(self, request), fields(direction = ?request.direction, amount = request.amount))]
    pub fn scroll(&self, request: &ScrollRequest) -> Result<ActionResult, AutomationError> {
        let start = Instant::now();
        let result = self.restoring_focus(|| {
            let scope = CallScope::new();
            let target = self.target(&scope, &request.target)?;
            self.executor.scroll(&target, request.direction, request.amount)
        });
        log_outcome("Scroll", start, &result);
        result
    }

    /// Bring an application forward. Focus is not given back afterwards.
    #[instrument(skip(self))]
    pub fn focus(&self, request: &FocusRequest) -> Result<FocusOutcome, AutomationError> {
        let start = Instant::now();
        let outcome = self.focus.focus(&request.app, request.window.as_deref())?;
        info!(
            duration_ms = start.elapsed().as_millis(),
            confirmed = outcome.is_confirmed(),
            "Focus finished"
        );
        Ok(outcome)
    }

    fn press_combo(&self, app: &AppTarget, combo: &KeyCombo) -> Result<ActionResult, AutomationError> {
        self.restoring_focus(|| {
            let scope = CallScope::new();
            let target = match app.app {
                Some(_) => Some(self.target(&scope, app)?),
                None => None,
            };
            self.executor.press(target.as_ref(), combo)
        })
    }

    fn restoring_focus<T>(
        &self,
        body: impl FnOnce() -> Result<T, AutomationError>,
    ) -> Result<T, AutomationError> {
        if self.config.focus.restore {
            self.focus.with_focus_restore(body)
        } else {
            body()
        }
    }

    /// Process, application element and window for one call.
    fn target<'s>(&self, scope: &'s CallScope, app: &AppTarget) -> Result<Target<'s>, AutomationError> {
        let process = match &app.app {
            Some(name) => self.engine.process_by_name(name)?,
            None => self.engine.frontmost_process()?.ok_or_else(|| {
                AutomationError::ElementNotFound("no application is frontmost".to_string())
            })?,
        };
        let application = scope.adopt(self.engine.application(process.pid)?);
        let window = self
            .engine
            .window(process.pid, app.window.as_deref())?
            .map(|w| scope.adopt(w));
        let window_frame = window.as_ref().and_then(|w| w.bounds().ok());
        let window_title = window
            .as_ref()
            .and_then(|w| w.attributes().ok())
            .and_then(|a| a.name)
            .or_else(|| app.window.clone());
        Ok(Target {
            process,
            app: application,
            window,
            window_title,
            window_frame,
        })
    }

    fn resolve_in<'s>(
        &self,
        scope: &'s CallScope,
        target: &Target<'s>,
        locator: &Locator,
        intent: SearchIntent,
    ) -> Result<Resolved<'s>, AutomationError> {
        let displays: Vec<Rect> = match self.engine.displays() {
            Ok(displays) => displays.into_iter().map(|d| d.frame).collect(),
            Err(e) => {
                warn!(error = %e, "display list unavailable; visibility bonus disabled");
                Vec::new()
            }
        };
        let ctx = TierContext {
            scope,
            target,
            intent,
            engine: &self.engine,
            bridge: &self.bridge,
            config: &self.config,
            displays: &displays,
        };
        self.cascade.resolve(&ctx, locator)
    }
}

fn log_outcome<T>(what: &str, start: Instant, result: &Result<T, AutomationError>) {
    match result {
        Ok(_) => info!(duration_ms = start.elapsed().as_millis(), "{what} completed"),
        Err(e) => warn!(
            duration_ms = start.elapsed().as_millis(),
            error = %e,
            "{what} failed"
        ),
    }
}
