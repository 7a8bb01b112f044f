use super::{Resolution, ResolutionTier, Source, TierContext, TierResult};
use crate::element::Candidate;
use crate::search::{self, find_by_structural_id};
use crate::{AutomationError, Locator};
use tracing::debug;

/// Exact identifier lookup, then the accessibility framework's own indexed search.
pub struct NativeTier;

impl ResolutionTier for NativeTier {
    fn source(&self) -> Source {
        Source::Native
    }

    fn try_resolve<'s>(
        &self,
        ctx: &TierContext<'_, 's>,
        locator: Locator,
    ) -> Result<TierResult<'s>, AutomationError> {
        let root = ctx.target.search_root();
        let options = ctx.search_options(&locator);

        if let Some(id) = locator.structural_id() {
            let caps = &ctx.config.search;
            if let Some(handle) =
                find_by_structural_id(id, root, caps.id_lookup_max_depth, caps.id_lookup_max_nodes)?
            {
                let attributes = handle.attributes()?;
                let bounds = handle.bounds().ok();
                // Identifiers are unique per window, so a role or text mismatch ends the lookup.
                let Some(score) = search::score(&attributes, bounds.as_ref(), &locator, &options) else {
                    debug!(id, role = %attributes.role, "structural id matched, other criteria did not");
                    return Ok(TierResult::Absent);
                };
                debug!(id, "structural id matched");
                return Ok(TierResult::Present(vec![Resolution::Element(Candidate {
                    handle,
                    score,
                    attributes,
                    bounds,
                })]));
            }
        }

        let Some(found) = ctx.engine.native_search(root.element(), &locator)? else {
            return Ok(TierResult::Unavailable(
                "the accessibility framework offers no indexed search here".to_string(),
            ));
        };

        let mut candidates = Vec::new();
        for element in found {
            let Ok(attributes) = element.attributes() else {
                continue;
            };
            let bounds = element.bounds().ok();
            if let Some(score) = search::score(&attributes, bounds.as_ref(), &locator, &options) {
                candidates.push(Candidate {
                    handle: ctx.scope.adopt(element),
                    score,
                    attributes,
                    bounds,
                });
            }
        }
        if candidates.is_empty() {
            return Ok(TierResult::Absent);
        }
        search::rank(&mut candidates);
        Ok(TierResult::Present(
            candidates.into_iter().map(Resolution::Element).collect(),
        ))
    }
}
