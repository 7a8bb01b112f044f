use super::{Resolution, ResolutionTier, Source, TierContext, TierResult};
use crate::devtools::{StructuralPeer, StructuralQuery};
use crate::geometry::renderer_to_screen;
use crate::{AutomationError, Locator};
use std::sync::Arc;

/// DOM lookup through the renderer's DevTools endpoint, mapped into screen space.
pub struct StructuralTier {
    peer: Option<Arc<dyn StructuralPeer>>,
}

impl StructuralTier {
    pub fn new(peer: Option<Arc<dyn StructuralPeer>>) -> Self {
        Self { peer }
    }
}

impl ResolutionTier for StructuralTier {
    fn source(&self) -> Source {
        Source::Structural
    }

    fn try_resolve<'s>(
        &self,
        ctx: &TierContext<'_, 's>,
        locator: Locator,
    ) -> Result<TierResult<'s>, AutomationError> {
        let Some(peer) = self.peer.clone() else {
            return Ok(TierResult::Unavailable("no structural peer configured".to_string()));
        };
        let Some(text) = locator.query_text().map(str::to_string) else {
            return Ok(TierResult::Unavailable("locator has no text to look up".to_string()));
        };
        let Some(window_frame) = ctx.target.window_frame else {
            return Ok(TierResult::Unavailable("target has no window frame".to_string()));
        };

        let query = StructuralQuery {
            app_name: ctx.target.process.name.clone(),
            window_title: ctx.target.window_title.clone(),
            text,
            role: locator.role_filter().map(str::to_string),
            identifier: locator.structural_id().map(str::to_string),
        };
        let matches = ctx.bridge.run(
            "structural lookup",
            ctx.config.timeouts.structural(),
            async move { peer.query(query).await },
        )?;

        let resolutions: Vec<Resolution<'s>> = matches
            .into_iter()
            .take(ctx.config.structural.max_matches.max(1))
            .filter(|m| !m.viewport_rect.is_empty())
            .map(|m| Resolution::Point {
                point: renderer_to_screen(m.viewport_rect.center(), m.content_offset, &window_frame),
                confidence: (m.score as f64 / 100.0).clamp(0.0, 1.0),
                label: m.label,
            })
            .collect();
        if resolutions.is_empty() {
            Ok(TierResult::Absent)
        } else {
            Ok(TierResult::Present(resolutions))
        }
    }
}
