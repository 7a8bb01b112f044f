use super::{Resolution, ResolutionTier, Source, TierContext, TierResult};
use crate::search;
use crate::{AutomationError, Locator};

/// Depth-budgeted walk of the accessibility tree where layout containers are free.
pub struct SemanticTier;

impl ResolutionTier for SemanticTier {
    fn source(&self) -> Source {
        Source::Semantic
    }

    fn try_resolve<'s>(
        &self,
        ctx: &TierContext<'_, 's>,
        locator: Locator,
    ) -> Result<TierResult<'s>, AutomationError> {
        let options = ctx.search_options(&locator);
        let candidates = search::search(&locator, ctx.target.search_root(), &options)?;
        if candidates.is_empty() {
            Ok(TierResult::Absent)
        } else {
            Ok(TierResult::Present(
                candidates.into_iter().map(Resolution::Element).collect(),
            ))
        }
    }
}
