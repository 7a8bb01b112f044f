//! Accessibility-tree search.
//!
//! Walks a window's tree depth-first and scores every node against a [`Locator`].
//! Depth is counted semantically: unlabeled structural containers ("tunnels") are
//! free to pass through, so content nested inside twenty wrapper groups is still
//! within a small budget. Raw depth and visited nodes are capped separately.

use crate::element::{Candidate, ElementHandle, UIElementAttributes};
use crate::geometry::Rect;
use crate::locator::Locator;
use crate::{roles, utils, AutomationError};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

pub const SCORE_EXACT: i32 = 100;
pub const SCORE_PREFIX: i32 = 75;
pub const SCORE_SUBSTRING: i32 = 50;
/// A node matched by role alone
pub const SCORE_ROLE_ONLY: i32 = 50;
pub const BONUS_EDITABLE: i32 = 200;
pub const BONUS_VISIBLE: i32 = 25;

/// What the caller is going to do with the result.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchIntent {
    #[default]
    Locate,
    /// Typing; editable roles are preferred
    Edit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DepthPolicy {
    /// Tunnels are free, content costs one level
    Semantic(usize),
    /// Every level costs one
    Raw(usize),
}

#[derive(Debug, Clone)]
pub struct SearchOptions {
    pub depth: DepthPolicy,
    pub max_raw_depth: usize,
    pub max_nodes: usize,
    pub min_score: i32,
    pub intent: SearchIntent,
    /// Visible display frames; candidates on screen get a bonus
    pub displays: Vec<Rect>,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            depth: DepthPolicy::Semantic(crate::locator::DEFAULT_SEARCH_DEPTH),
            max_raw_depth: 64,
            max_nodes: 5_000,
            min_score: SCORE_SUBSTRING,
            intent: SearchIntent::Locate,
            displays: Vec::new(),
        }
    }
}

/// A tunnel is a container role with nothing of its own to read.
pub fn is_tunnel(attributes: &UIElementAttributes) -> bool {
    roles::is_tunnel_role(&attributes.role) && !attributes.has_text()
}

/// How well a node's own attributes match the locator, before bonuses.
fn base_score(attributes: &UIElementAttributes, locator: &Locator) -> Option<i32> {
    // An identifier is an exact criterion in every combination.
    if let Some(wanted) = locator.structural_id() {
        if attributes.identifier.as_deref() != Some(wanted) {
            return None;
        }
    }
    if let Some(role) = locator.role_filter() {
        if !roles::role_matches(role, &attributes.role) {
            return None;
        }
    }
    match locator.query_text() {
        Some(query) => {
            let query = utils::normalize(query);
            if query.is_empty() {
                return None;
            }
            attributes
                .searchable_text()
                .filter_map(|text| {
                    let text = utils::normalize(text);
                    if text == query {
                        Some(SCORE_EXACT)
                    } else if text.starts_with(&query) {
                        Some(SCORE_PREFIX)
                    } else if text.contains(&query) {
                        Some(SCORE_SUBSTRING)
                    } else {
                        None
                    }
                })
                .max()
        }
        None if locator.structural_id().is_some() => Some(SCORE_EXACT),
        None if locator.role_filter().is_some() => Some(SCORE_ROLE_ONLY),
        None => None,
    }
}

/// Full score of a node, or `None` when it does not match or falls below the minimum.
pub fn score(
    attributes: &UIElementAttributes,
    bounds: Option<&Rect>,
    locator: &Locator,
    options: &SearchOptions,
) -> Option<i32> {
    let mut score = base_score(attributes, locator)?;
    if options.intent == SearchIntent::Edit && roles::is_editable_role(&attributes.role) {
        score += BONUS_EDITABLE;
    }
    if let Some(bounds) = bounds {
        if options.displays.iter().any(|display| display.intersects(bounds)) {
            score += BONUS_VISIBLE;
        }
    }
    (score >= options.min_score).then_some(score)
}

/// Stable sort, best first. Equal scores keep traversal order.
pub fn rank(candidates: &mut [Candidate<'_>]) {
    candidates.sort_by(|a, b| b.score.cmp(&a.score));
}

/// Search the tree under `root` (exclusive) for nodes matching `locator`.
///
/// Unreadable subtrees are skipped; only an unreadable root is an error.
#[instrument(level = "debug", skip(root, options))]
pub fn search<'s>(
    locator: &Locator,
    root: &ElementHandle<'s>,
    options: &SearchOptions,
) -> Result<Vec<Candidate<'s>>, AutomationError> {
    let root_attributes = root.attributes()?;
    let (budget, semantic) = match options.depth {
        DepthPolicy::Semantic(budget) => (budget, true),
        DepthPolicy::Raw(limit) => (limit, false),
    };

    struct Frame<'s> {
        handle: ElementHandle<'s>,
        attributes: UIElementAttributes,
        depth: usize,
        raw_depth: usize,
    }

    let mut candidates = Vec::new();
    let mut visited = 0usize;
    let mut skipped = 0usize;
    let mut stack = vec![Frame {
        handle: root.clone(),
        attributes: root_attributes,
        depth: 0,
        raw_depth: 0,
    }];

    while let Some(frame) = stack.pop() {
        let step = if semantic && is_tunnel(&frame.attributes) { 0 } else { 1 };
        let child_depth = frame.depth + step;
        if child_depth > budget || frame.raw_depth + 1 > options.max_raw_depth {
            continue;
        }
        let children = match frame.handle.children() {
            Ok(children) => children,
            Err(e) => {
                debug!(error = %e, "skipping unreadable subtree");
                skipped += 1;
                continue;
            }
        };
        let mut next = Vec::with_capacity(children.len());
        for child in children {
            if visited >= options.max_nodes {
                break;
            }
            visited += 1;
            let attributes = match child.attributes() {
                Ok(attributes) => attributes,
                Err(e) => {
                    debug!(error = %e, "skipping unreadable node");
                    skipped += 1;
                    continue;
                }
            };
            let bounds = child.bounds().ok();
            if let Some(score) = score(&attributes, bounds.as_ref(), locator, options) {
                candidates.push(Candidate {
                    handle: child.clone(),
                    score,
                    attributes: attributes.clone(),
                    bounds,
                });
            }
            next.push(Frame {
                handle: child,
                attributes,
                depth: child_depth,
                raw_depth: frame.raw_depth + 1,
            });
        }
        // Reverse so the first child is explored first.
        stack.extend(next.into_iter().rev());
        if visited >= options.max_nodes {
            debug!(visited, "node cap reached");
            break;
        }
    }

    rank(&mut candidates);
    debug!(visited, skipped, found = candidates.len(), "search finished");
    Ok(candidates)
}

/// Raw-depth walk for a node whose identifier equals `id`. Ignores the semantic budget.
#[instrument(level = "debug", skip(root))]
pub fn find_by_structural_id<'s>(
    id: &str,
    root: &ElementHandle<'s>,
    max_depth: usize,
    max_nodes: usize,
) -> Result<Option<ElementHandle<'s>>, AutomationError> {
    root.attributes()?;
    let mut visited = 0usize;
    let mut stack = vec![(root.clone(), 0usize)];
    while let Some((handle, depth)) = stack.pop() {
        if depth >= max_depth {
            continue;
        }
        let Ok(children) = handle.children() else {
            continue;
        };
        let mut next = Vec::with_capacity(children.len());
        for child in children {
            visited += 1;
            if visited > max_nodes {
                debug!(visited, "id lookup node cap reached");
                return Ok(None);
            }
            let identifier = child.attributes().ok().and_then(|a| a.identifier);
            if identifier.as_deref() == Some(id) {
                return Ok(Some(child));
            }
            next.push((child, depth + 1));
        }
        stack.extend(next.into_iter().rev());
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::element::CallScope;
    use crate::platforms::memory::{MemoryApp, MemoryEngine, MemoryNode};
    use crate::platforms::AccessibilityEngine;

    fn nested(levels: usize, leaf: MemoryNode) -> MemoryNode {
        (0..levels).fold(leaf, |inner, _| MemoryNode::group().child(inner))
    }

    fn engine_with(window: MemoryNode) -> MemoryEngine {
        MemoryEngine::new().with_app(MemoryApp::new(1, "App").window(window))
    }

    fn window_of(engine: &MemoryEngine) -> crate::UIElement {
        engine.window(1, None).unwrap().unwrap()
    }

    #[test]
    fn tunnels_do_not_spend_the_depth_budget() {
        let engine = engine_with(
            MemoryNode::window("Doc", Rect::new(0.0, 0.0, 800.0, 600.0))
                .child(nested(30, MemoryNode::button("Send"))),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let locator = Locator::query("Send");

        let semantic = SearchOptions {
            depth: DepthPolicy::Semantic(5),
            ..SearchOptions::default()
        };
        let found = search(&locator, &root, &semantic).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].attributes.role, "AXButton");

        let naive = SearchOptions {
            depth: DepthPolicy::Raw(5),
            ..SearchOptions::default()
        };
        assert!(search(&locator, &root, &naive).unwrap().is_empty());
    }

    #[test]
    fn labelled_groups_cost_depth() {
        let labelled = (0..4).fold(MemoryNode::button("Send"), |inner, i| {
            MemoryNode::group().description(format!("section {i}")).child(inner)
        });
        let engine = engine_with(
            MemoryNode::window("Doc", Rect::new(0.0, 0.0, 800.0, 600.0)).child(labelled),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let shallow = SearchOptions {
            depth: DepthPolicy::Semantic(3),
            ..SearchOptions::default()
        };
        assert!(search(&Locator::query("Send"), &root, &shallow).unwrap().is_empty());
    }

    #[test]
    fn editable_field_beats_link_when_typing() {
        let engine = engine_with(
            MemoryNode::window("Compose", Rect::new(0.0, 0.0, 800.0, 600.0)).children([
                MemoryNode::link("To do list").frame(Rect::new(10.0, 10.0, 100.0, 20.0)),
                MemoryNode::text_field("To").frame(Rect::new(10.0, 40.0, 300.0, 20.0)),
            ]),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let options = SearchOptions {
            intent: SearchIntent::Edit,
            displays: vec![Rect::new(0.0, 0.0, 1728.0, 1117.0)],
            ..SearchOptions::default()
        };
        let found = search(&Locator::query("to"), &root, &options).unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[0].attributes.role, "AXTextField");
        assert_eq!(found[0].score, SCORE_EXACT + BONUS_EDITABLE + BONUS_VISIBLE);
        assert_eq!(found[1].score, SCORE_PREFIX + BONUS_VISIBLE);
    }

    #[test]
    fn exact_outranks_prefix_outranks_substring_and_ties_keep_order() {
        let engine = engine_with(
            MemoryNode::window("W", Rect::new(0.0, 0.0, 800.0, 600.0)).children([
                MemoryNode::button("Resend"),
                MemoryNode::button("Send later"),
                MemoryNode::button("Send"),
                MemoryNode::button("Send now"),
            ]),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let found = search(&Locator::query("send"), &root, &SearchOptions::default()).unwrap();
        let names: Vec<_> = found
            .iter()
            .map(|c| c.attributes.name.clone().unwrap())
            .collect();
        assert_eq!(names, vec!["Send", "Send later", "Send now", "Resend"]);
    }

    #[test]
    fn role_filter_alone_matches_every_node_of_that_role() {
        let engine = engine_with(
            MemoryNode::window("W", Rect::new(0.0, 0.0, 800.0, 600.0)).children([
                MemoryNode::button("One"),
                MemoryNode::static_text("Two"),
                MemoryNode::button("Three"),
            ]),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let found = search(&Locator::role("button"), &root, &SearchOptions::default()).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.iter().all(|c| c.score == SCORE_ROLE_ONLY));
    }

    #[test]
    fn role_with_identifier_needs_the_identifier_too() {
        let engine = engine_with(
            MemoryNode::window("W", Rect::new(0.0, 0.0, 800.0, 600.0)).children([
                MemoryNode::button("Delete everything"),
                MemoryNode::button("Send").identifier("other-id"),
            ]),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));

        let missing = Locator::role("button").with_identifier("send-button");
        assert!(search(&missing, &root, &SearchOptions::default())
            .unwrap()
            .is_empty());

        let present = Locator::role("button").with_identifier("other-id");
        let found = search(&present, &root, &SearchOptions::default()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].score, SCORE_EXACT);
        assert_eq!(found[0].attributes.name.as_deref(), Some("Send"));
    }

    #[test]
    fn node_cap_bounds_the_walk() {
        let buttons = (0..50).map(|i| MemoryNode::button(format!("Item {i}")));
        let engine = engine_with(
            MemoryNode::window("W", Rect::new(0.0, 0.0, 800.0, 600.0)).children(buttons),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let options = SearchOptions {
            max_nodes: 10,
            ..SearchOptions::default()
        };
        let found = search(&Locator::query("item"), &root, &options).unwrap();
        assert_eq!(found.len(), 10);
    }

    #[test]
    fn structural_id_lookup_ignores_semantic_budget() {
        let deep = (0..40).fold(
            MemoryNode::text_field("Subject").identifier("subject-input"),
            |inner, i| MemoryNode::group().description(format!("pane {i}")).child(inner),
        );
        let engine = engine_with(
            MemoryNode::window("W", Rect::new(0.0, 0.0, 800.0, 600.0)).child(deep),
        );
        let scope = CallScope::new();
        let root = scope.adopt(window_of(&engine));
        let hit = find_by_structural_id("subject-input", &root, 256, 10_000).unwrap();
        assert!(hit.is_some());
        assert!(find_by_structural_id("missing", &root, 256, 10_000)
            .unwrap()
            .is_none());
    }
}
