//! Element resolution with a fallback chain.
//!
//! Tiers run in a fixed order and the first one that produces a result wins. Each
//! tier that produced nothing is recorded in the fallback trail so the caller can
//! see what was tried. Errors that make every later tier pointless (no permission,
//! no platform support) end the resolution; anything else is recorded and the
//! cascade moves on.

mod native;
mod semantic;
mod structural;
mod vision;

pub use native::NativeTier;
pub use semantic::SemanticTier;
pub use structural::StructuralTier;
pub use vision::VisionTier;

use crate::bridge::SyncBridge;
use crate::devtools::StructuralPeer;
use crate::element::{CallScope, Candidate, ElementHandle, ElementSummary};
use crate::errors::ErrorKind;
use crate::geometry::{Point, Rect};
use crate::grounding::GroundingPeer;
use crate::platforms::{AccessibilityEngine, ProcessInfo};
use crate::search::{DepthPolicy, SearchIntent, SearchOptions};
use crate::{AutomationError, Config, Locator};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Which tier produced a resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Native,
    Semantic,
    Structural,
    Vision,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Native => "native",
            Source::Semantic => "semantic",
            Source::Structural => "structural",
            Source::Vision => "vision",
        }
    }
}

/// One resolved target.
#[derive(Debug, Clone)]
pub enum Resolution<'s> {
    /// A live element in the accessibility tree
    Element(Candidate<'s>),
    /// A screen position reported by an external peer
    Point {
        point: Point,
        confidence: f64,
        label: Option<String>,
    },
}

impl Resolution<'_> {
    /// Screen-space point an input event would be aimed at.
    pub fn screen_point(&self) -> Option<Point> {
        match self {
            Resolution::Element(candidate) => candidate
                .bounds
                .filter(|b| !b.is_empty())
                .map(|b| b.center()),
            Resolution::Point { point, .. } => Some(*point),
        }
    }

    pub fn summary(&self) -> ResolutionSummary {
        match self {
            Resolution::Element(candidate) => ResolutionSummary {
                point: self.screen_point(),
                score: Some(candidate.score),
                confidence: None,
                element: Some(candidate.summary()),
                label: None,
            },
            Resolution::Point {
                point,
                confidence,
                label,
            } => ResolutionSummary {
                point: Some(*point),
                score: None,
                confidence: Some(*confidence),
                element: None,
                label: label.clone(),
            },
        }
    }
}

/// Owned view of a resolution, returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolutionSummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementSummary>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// What one tier found.
#[derive(Debug)]
pub enum TierResult<'s> {
    Present(Vec<Resolution<'s>>),
    Absent,
    /// The tier could not run at all (missing peer, missing input)
    Unavailable(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TrailOutcome {
    Absent,
    Unavailable,
    Failed,
}

/// A tier that ran without producing a result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrailEntry {
    pub source: Source,
    pub outcome: TrailOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    pub duration_ms: u64,
}

/// The application and window a request is aimed at, bound to one call.
#[derive(Debug)]
pub struct Target<'s> {
    pub process: ProcessInfo,
    pub app: ElementHandle<'s>,
    pub window: Option<ElementHandle<'s>>,
    pub window_title: Option<String>,
    pub window_frame: Option<Rect>,
}

impl<'s> Target<'s> {
    /// Window when there is one, otherwise the application element.
    pub fn search_root(&self) -> &ElementHandle<'s> {
        self.window.as_ref().unwrap_or(&self.app)
    }
}

/// Everything a tier may use while resolving.
pub struct TierContext<'a, 's> {
    pub scope: &'s CallScope,
    pub target: &'a Target<'s>,
    pub intent: SearchIntent,
    pub engine: &'a Arc<dyn AccessibilityEngine>,
    pub bridge: &'a SyncBridge,
    pub config: &'a Config,
    pub displays: &'a [Rect],
}

impl TierContext<'_, '_> {
    pub(crate) fn search_options(&self, locator: &Locator) -> SearchOptions {
        let search = &self.config.search;
        SearchOptions {
            depth: DepthPolicy::Semantic(locator.depth_budget().unwrap_or(search.depth)),
            max_raw_depth: search.max_raw_depth,
            max_nodes: search.max_nodes,
            min_score: search.min_score,
            intent: self.intent,
            displays: self.displays.to_vec(),
        }
    }
}

/// One strategy in the fallback chain.
pub trait ResolutionTier: Send + Sync {
    fn source(&self) -> Source;

    /// Receives its own copy of the locator.
    fn try_resolve<'s>(
        &self,
        ctx: &TierContext<'_, 's>,
        locator: Locator,
    ) -> Result<TierResult<'s>, AutomationError>;
}

/// Result of a successful cascade run.
#[derive(Debug)]
pub struct Resolved<'s> {
    pub source: Source,
    /// Best first, deduplicated by screen position
    pub resolutions: Vec<Resolution<'s>>,
    pub trail: Vec<TrailEntry>,
}

impl<'s> Resolved<'s> {
    pub fn best(&self) -> &Resolution<'s> {
        // Never empty: the cascade only builds a Resolved from a non-empty tier result.
        &self.resolutions[0]
    }
}

pub struct Cascade {
    tiers: Vec<Box<dyn ResolutionTier>>,
}

impl Cascade {
    pub fn new(tiers: Vec<Box<dyn ResolutionTier>>) -> Self {
        Self { tiers }
    }

    /// Native, semantic, structural, vision.
    pub fn standard(
        structural: Option<Arc<dyn StructuralPeer>>,
        grounding: Option<Arc<dyn GroundingPeer>>,
    ) -> Self {
        Self::new(vec![
            Box::new(NativeTier),
            Box::new(SemanticTier),
            Box::new(StructuralTier::new(structural)),
            Box::new(VisionTier::new(grounding)),
        ])
    }

    pub fn sources(&self) -> Vec<Source> {
        self.tiers.iter().map(|t| t.source()).collect()
    }

    #[instrument(skip(self, ctx), fields(app = %ctx.target.process.name))]
    pub fn resolve<'s>(
        &self,
        ctx: &TierContext<'_, 's>,
        locator: &Locator,
    ) -> Result<Resolved<'s>, AutomationError> {
        locator.validate()?;
        let start = Instant::now();
        let mut trail = Vec::new();

        for tier in &self.tiers {
            let source = tier.source();
            let tier_start = Instant::now();
            let outcome = tier.try_resolve(ctx, locator.clone());
            let duration_ms = tier_start.elapsed().as_millis() as u64;

            match outcome {
                Ok(TierResult::Present(found)) => {
                    let resolutions = dedupe(found);
                    if resolutions.is_empty() {
                        trail.push(entry(source, TrailOutcome::Absent, None, None, duration_ms));
                        continue;
                    }
                    info!(
                        source = source.as_str(),
                        results = resolutions.len(),
                        skipped_tiers = trail.len(),
                        duration_ms = start.elapsed().as_millis(),
                        "Locator resolved"
                    );
                    return Ok(Resolved {
                        source,
                        resolutions,
                        trail,
                    });
                }
                Ok(TierResult::Absent) => {
                    debug!(source = source.as_str(), duration_ms, "tier found nothing");
                    trail.push(entry(source, TrailOutcome::Absent, None, None, duration_ms));
                }
                Ok(TierResult::Unavailable(reason)) => {
                    debug!(source = source.as_str(), %reason, "tier unavailable");
                    trail.push(entry(
                        source,
                        TrailOutcome::Unavailable,
                        None,
                        Some(reason),
                        duration_ms,
                    ));
                }
                Err(e) if e.aborts_resolution() => {
                    warn!(source = source.as_str(), error = %e, "resolution aborted");
                    return Err(e);
                }
                Err(e) => {
                    let outcome = if e.kind() == ErrorKind::PeerUnavailable {
                        TrailOutcome::Unavailable
                    } else {
                        TrailOutcome::Failed
                    };
                    warn!(source = source.as_str(), error = %e, "tier failed, falling back");
                    trail.push(entry(
                        source,
                        outcome,
                        Some(e.kind()),
                        Some(e.to_string()),
                        duration_ms,
                    ));
                }
            }
        }

        let tried = trail
            .iter()
            .map(|t| format!("{} ({:?})", t.source.as_str(), t.outcome).to_lowercase())
            .collect::<Vec<_>>()
            .join(", ");
        info!(
            duration_ms = start.elapsed().as_millis(),
            tried = %tried,
            "Locator did not resolve"
        );
        Err(AutomationError::ElementNotFound(format!(
            "nothing matched '{}' in {}; tried {}",
            locator.describe(),
            ctx.target.process.name,
            tried
        )))
    }
}

fn entry(
    source: Source,
    outcome: TrailOutcome,
    error_kind: Option<ErrorKind>,
    detail: Option<String>,
    duration_ms: u64,
) -> TrailEntry {
    TrailEntry {
        source,
        outcome,
        error_kind,
        detail,
        duration_ms,
    }
}

/// Drops results that land on the same on-screen point as an earlier one.
fn dedupe(resolutions: Vec<Resolution<'_>>) -> Vec<Resolution<'_>> {
    let mut seen_points = HashSet::new();
    let mut seen_elements = HashSet::new();
    resolutions
        .into_iter()
        .filter(|resolution| match resolution.screen_point() {
            Some(point) => seen_points.insert(point.rounded()),
            None => match resolution {
                Resolution::Element(c) => seen_elements.insert(c.handle.object_id()),
                Resolution::Point { .. } => true,
            },
        })
        .collect()
}
