use super::{Resolution, ResolutionTier, Source, TierContext, TierResult};
use crate::geometry::{grounding_to_screen, image_to_screen, Point, Size};
use crate::grounding::{GroundRequest, GroundingPeer};
use crate::{AutomationError, Locator};
use base64::Engine as _;
use std::sync::Arc;
use tracing::debug;

/// Window capture sent to the grounding service with the locator's description.
pub struct VisionTier {
    peer: Option<Arc<dyn GroundingPeer>>,
}

impl VisionTier {
    pub fn new(peer: Option<Arc<dyn GroundingPeer>>) -> Self {
        Self { peer }
    }
}

impl ResolutionTier for VisionTier {
    fn source(&self) -> Source {
        Source::Vision
    }

    fn try_resolve<'s>(
        &self,
        ctx: &TierContext<'_, 's>,
        locator: Locator,
    ) -> Result<TierResult<'s>, AutomationError> {
        let Some(peer) = self.peer.clone() else {
            return Ok(TierResult::Unavailable("no grounding service configured".to_string()));
        };
        if locator.structural_id().is_some() {
            return Ok(TierResult::Unavailable(
                "identifiers cannot be matched on a screenshot".to_string(),
            ));
        }

        let engine = Arc::clone(ctx.engine);
        let pid = ctx.target.process.pid;
        let title = ctx.target.window_title.clone();
        let capture = ctx.bridge.run("window capture", ctx.config.timeouts.capture(), async move {
            engine.capture_window(pid, title.as_deref()).await
        })?;

        let window = capture.window_frame;
        let request = GroundRequest {
            image: base64::engine::general_purpose::STANDARD.encode(&capture.png),
            description: locator.describe(),
            screen_w: window.width,
            screen_h: window.height,
            crop_box: None,
        };
        let grounded = ctx.bridge.run(
            "visual grounding",
            ctx.config.timeouts.grounding(),
            async move { peer.ground(request).await },
        )?;

        if grounded.confidence < ctx.config.vision.min_confidence {
            debug!(
                confidence = grounded.confidence,
                error = ?grounded.error,
                "grounding below confidence threshold"
            );
            return Ok(TierResult::Absent);
        }

        let point = match (grounded.normalized_x, grounded.normalized_y) {
            (Some(nx), Some(ny)) => Some(grounding_to_screen(
                Point::new(nx, ny),
                &window,
                &capture.display_frame,
            )),
            _ => image_to_screen(
                Point::new(grounded.x, grounded.y),
                Size::new(window.width, window.height),
                &window,
                &capture.display_frame,
            ),
        };
        let Some(point) = point else {
            return Ok(TierResult::Absent);
        };
        Ok(TierResult::Present(vec![Resolution::Point {
            point,
            confidence: grounded.confidence,
            label: grounded.method,
        }]))
    }
}
