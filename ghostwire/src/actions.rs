//! Performing actions on resolved targets and checking that they took effect.
//!
//! Each action walks a short ladder of execution tiers: the accessibility framework's
//! own primitive first, then synthetic OS input at the element's position, then (for
//! typing) a click on the field followed by per-character keystrokes. Every rung is
//! recorded in the result whether it worked or not.

use crate::cascade::{Resolution, Source, Target, TrailEntry};
use crate::config::TypingConfig;
use crate::element::{ElementHandle, ElementSummary};
use crate::errors::AutomationError;
use crate::focus::{FocusManager, FocusOutcome};
use crate::geometry::{Point, Rect};
use crate::keys::{Key, KeyCombo, NamedKey};
use crate::platforms::{AccessibilityEngine, MouseButton};
use crate::utils::{char_prefix, normalize};
use crate::roles;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, instrument, warn};

/// How deep under the window a scroll container is looked for.
pub const SCROLL_SEARCH_DEPTH: usize = 3;
/// Wheel lines per native scroll page.
pub const LINES_PER_PAGE: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    /// Wheel deltas for `lines`. Positive moves content down or right.
    pub fn wheel_delta(&self, lines: u32) -> (i32, i32) {
        let lines = lines.min(i32::MAX as u32) as i32;
        match self {
            ScrollDirection::Up => (0, lines),
            ScrollDirection::Down => (0, -lines),
            ScrollDirection::Left => (lines, 0),
            ScrollDirection::Right => (-lines, 0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionTier {
    NativeAssistive,
    SyntheticInput,
    CoordinateBased,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    Unavailable { reason: String },
    ExecutionFailed { error: String },
    VerificationFailed { read_back: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TierAttempt {
    pub tier: ExecutionTier,
    pub method: String,
    #[serde(flatten)]
    pub outcome: AttemptOutcome,
    pub duration_ms: u64,
}

/// What an action did. Returned and logged, never stored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionResult {
    pub success: bool,
    pub tier: ExecutionTier,
    pub method: String,
    /// Read-back text for verified typing
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confirmation: Option<String>,
    pub attempts: Vec<TierAttempt>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub point: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub element: Option<ElementSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fallback_trail: Vec<TrailEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub focus: Option<FocusOutcome>,
    pub duration_ms: u64,
}

impl ActionResult {
    fn succeeded(attempts: Vec<TierAttempt>, confirmation: Option<String>, start: Instant) -> Self {
        // Only called after a successful attempt has been pushed.
        let (tier, method) = attempts
            .last()
            .map(|a| (a.tier, a.method.clone()))
            .unwrap_or((ExecutionTier::SyntheticInput, String::new()));
        Self {
            success: true,
            tier,
            method,
            confirmation,
            attempts,
            source: None,
            point: None,
            element: None,
            fallback_trail: Vec::new(),
            focus: None,
            duration_ms: start.elapsed().as_millis() as u64,
        }
    }

    pub(crate) fn with_resolution(mut self, source: Source, resolution: &Resolution<'_>, trail: Vec<TrailEntry>) -> Self {
        let summary = resolution.summary();
        self.source = Some(source);
        self.point = self.point.or(summary.point);
        self.element = summary.element;
        self.fallback_trail = trail;
        self
    }
}

/// What a typed field should read once the text has landed.
struct Expectation {
    /// Normalized value before any input
    before: String,
    whole: String,
    head: String,
    /// Leading characters of the text, reported on failure
    prefix: String,
}

impl Expectation {
    fn new(before: &str, text: &str, clear: bool, prefix_chars: usize) -> Self {
        let prefix = char_prefix(text, prefix_chars);
        let base = if clear { "" } else { before };
        Self {
            before: normalize(before),
            whole: normalize(&format!("{base}{text}")),
            head: normalize(&format!("{base}{prefix}")),
            prefix: prefix.to_string(),
        }
    }

    /// The full expected value, or, for text longer than the prefix, a changed field
    /// that starts with the expected head. Editors are free to rewrite the tail.
    fn met_by(&self, read: &str) -> bool {
        let read = normalize(read);
        read == self.whole
            || (self.head != self.whole && read != self.before && read.starts_with(&self.head))
    }
}

enum ReadBack {
    Confirmed(String),
    Mismatch(String),
    /// Secure fields never echo their value
    Unchecked,
}

struct Ladder {
    attempts: Vec<TierAttempt>,
    start: Instant,
}

impl Ladder {
    fn new() -> Self {
        Self {
            attempts: Vec::new(),
            start: Instant::now(),
        }
    }

    fn record(&mut self, tier: ExecutionTier, method: &str, outcome: AttemptOutcome, started: Instant) {
        debug!(?tier, method, ?outcome, "execution tier finished");
        self.attempts.push(TierAttempt {
            tier,
            method: method.to_string(),
            outcome,
            duration_ms: started.elapsed().as_millis() as u64,
        });
    }

    fn last_read_back(&self) -> Option<&str> {
        self.attempts.iter().rev().find_map(|a| match &a.outcome {
            AttemptOutcome::VerificationFailed { read_back } => Some(read_back.as_str()),
            _ => None,
        })
    }

    fn failure_summary(&self) -> String {
        self.attempts
            .iter()
            .map(|a| match &a.outcome {
                AttemptOutcome::ExecutionFailed { error } => format!("{}: {error}", a.method),
                AttemptOutcome::Unavailable { reason } => format!("{}: {reason}", a.method),
                AttemptOutcome::VerificationFailed { read_back } => {
                    format!("{}: read back {read_back:?}", a.method)
                }
                AttemptOutcome::Succeeded => format!("{}: ok", a.method),
            })
            .collect::<Vec<_>>()
            .join("; ")
    }
}

pub struct ActionExecutor {
    engine: Arc<dyn AccessibilityEngine>,
    focus: Arc<FocusManager>,
    typing: TypingConfig,
}

impl ActionExecutor {
    pub fn new(
        engine: Arc<dyn AccessibilityEngine>,
        focus: Arc<FocusManager>,
        typing: TypingConfig,
    ) -> Self {
        Self {
            engine,
            focus,
            typing,
        }
    }

    /// Click whatever the cascade resolved.
    pub fn click(
        &self,
        target: &Target<'_>,
        resolution: &Resolution<'_>,
        button: MouseButton,
        count: u32,
    ) -> Result<ActionResult, AutomationError> {
        match resolution {
            Resolution::Element(candidate) => {
                self.click_element(target, &candidate.handle, button, count)
            }
            Resolution::Point { point, .. } => self.click_at(Some(target), *point, button, count),
        }
    }

    #[instrument(skip(self, target, element))]
    pub fn click_element(
        &self,
        target: &Target<'_>,
        element: &ElementHandle<'_>,
        button: MouseButton,
        count: u32,
    ) -> Result<ActionResult, AutomationError> {
        let bounds = preflight(element)?;
        let mut ladder = Ladder::new();

        let native_action = match (button, count) {
            (MouseButton::Left, 1) => Some("AXPress"),
            (MouseButton::Right, 1) => Some("AXShowMenu"),
            _ => None,
        };
        let advertised = element.actions().unwrap_or_default();
        let started = Instant::now();
        match native_action {
            Some(action) if advertised.iter().any(|a| a == action) => {
                match element.perform_action(action) {
                    Ok(()) => {
                        ladder.record(ExecutionTier::NativeAssistive, action, AttemptOutcome::Succeeded, started);
                        return Ok(self.finish(ladder, None, Some(bounds.center())));
                    }
                    Err(e) if e.aborts_resolution() => return Err(e),
                    Err(e) => ladder.record(
                        ExecutionTier::NativeAssistive,
                        action,
                        AttemptOutcome::ExecutionFailed { error: e.to_string() },
                        started,
                    ),
                }
            }
            Some(action) => ladder.record(
                ExecutionTier::NativeAssistive,
                action,
                AttemptOutcome::Unavailable {
                    reason: "element does not advertise the action".to_string(),
                },
                started,
            ),
            None => ladder.record(
                ExecutionTier::NativeAssistive,
                "none",
                AttemptOutcome::Unavailable {
                    reason: format!("no native primitive for {button:?} x{count}"),
                },
                started,
            ),
        }

        let started = Instant::now();
        let focus = self.bring_forward(target)?;
        match self.engine.mouse_click(bounds.center(), button, count) {
            Ok(()) => {
                ladder.record(ExecutionTier::SyntheticInput, "mouse_click", AttemptOutcome::Succeeded, started);
                let mut result = self.finish(ladder, None, Some(bounds.center()));
                result.focus = Some(focus);
                Ok(result)
            }
            Err(e) => {
                ladder.record(
                    ExecutionTier::SyntheticInput,
                    "mouse_click",
                    AttemptOutcome::ExecutionFailed { error: e.to_string() },
                    started,
                );
                Err(AutomationError::ExecutionFailed(ladder.failure_summary()))
            }
        }
    }

    /// Click a screen position, bringing `target` forward first when given.
    #[instrument(skip(self, target))]
    pub fn click_at(
        &self,
        target: Option<&Target<'_>>,
        point: Point,
        button: MouseButton,
        count: u32,
    ) -> Result<ActionResult, AutomationError> {
        let mut ladder = Ladder::new();
        let focus = target.map(|t| self.bring_forward(t)).transpose()?;
        let started = Instant::now();
        self.engine.mouse_click(point, button, count)?;
        ladder.record(ExecutionTier::CoordinateBased, "mouse_click", AttemptOutcome::Succeeded, started);
        let mut result = self.finish(ladder, None, Some(point));
        result.focus = focus;
        Ok(result)
    }

    /// Type into a resolved target, or into whatever holds focus when there is none.
    pub fn type_text(
        &self,
        target: &Target<'_>,
        resolution: Option<&Resolution<'_>>,
        text: &str,
        clear: bool,
    ) -> Result<ActionResult, AutomationError> {
        match resolution {
            Some(Resolution::Element(candidate)) => {
                self.type_into_element(target, &candidate.handle, text, clear)
            }
            Some(Resolution::Point { point, .. }) => self.type_at(target, *point, text, clear),
            None => self.type_into_focused(target, text, clear),
        }
    }

    #[instrument(skip(self, target, element, text), fields(chars = text.chars().count()))]
    pub fn type_into_element(
        &self,
        target: &Target<'_>,
        element: &ElementHandle<'_>,
        text: &str,
        clear: bool,
    ) -> Result<ActionResult, AutomationError> {
        let bounds = preflight(element)?;
        let secure = element.attributes()?.role == roles::SECURE_TEXT_FIELD;
        let before = if secure {
            String::new()
        } else {
            element.value()?.unwrap_or_default()
        };
        let expect = Expectation::new(&before, text, clear, self.typing.verify_prefix_chars);
        let mut ladder = Ladder::new();

        // Tier 1: write the value directly.
        let started = Instant::now();
        let native = || -> Result<(), AutomationError> {
            if clear {
                element.set_value(text)
            } else {
                element.set_value(&format!("{before}{text}"))
            }
        };
        if let Some(confirmation) = self.verified(
            &mut ladder,
            ExecutionTier::NativeAssistive,
            "set_value",
            element,
            &expect,
            secure,
            started,
            native,
        ) {
            return Ok(self.finish(ladder, confirmation, None));
        }

        // Tier 2: focus the field and send the text as one synthetic burst.
        let started = Instant::now();
        let focus = self.bring_forward(target)?;
        let (wipe, payload) = self.retry_input(element, &before, text, clear, secure);
        let bulk = || -> Result<(), AutomationError> {
            element.focus()?;
            if wipe {
                self.clear_focused()?;
            }
            self.engine.type_text(&payload)
        };
        if let Some(confirmation) = self.verified(
            &mut ladder,
            ExecutionTier::SyntheticInput,
            "type_text",
            element,
            &expect,
            secure,
            started,
            bulk,
        ) {
            let mut result = self.finish(ladder, confirmation, None);
            result.focus = Some(focus);
            return Ok(result);
        }

        // Tier 3: click into the field and type one character at a time.
        let started = Instant::now();
        self.bring_forward(target)?;
        let (wipe, payload) = self.retry_input(element, &before, text, clear, secure);
        let per_char = || -> Result<(), AutomationError> {
            self.engine.mouse_click(bounds.center(), MouseButton::Left, 1)?;
            if wipe {
                self.clear_focused()?;
            }
            self.type_per_char(&payload)
        };
        if let Some(confirmation) = self.verified(
            &mut ladder,
            ExecutionTier::CoordinateBased,
            "click_then_keystrokes",
            element,
            &expect,
            secure,
            started,
            per_char,
        ) {
            let mut result = self.finish(ladder, confirmation, Some(bounds.center()));
            result.focus = Some(focus);
            return Ok(result);
        }

        warn!(attempts = %ladder.failure_summary(), "typing could not be verified");
        match ladder.last_read_back() {
            Some(actual) => Err(AutomationError::VerificationFailed {
                expected: expect.prefix,
                actual: actual.to_string(),
            }),
            None => Err(AutomationError::ExecutionFailed(ladder.failure_summary())),
        }
    }

    /// Coordinates from an external peer: click there, then type.
    #[instrument(skip(self, target, text))]
    pub fn type_at(
        &self,
        target: &Target<'_>,
        point: Point,
        text: &str,
        clear: bool,
    ) -> Result<ActionResult, AutomationError> {
        let mut ladder = Ladder::new();
        let focus = self.bring_forward(target)?;
        let started = Instant::now();
        self.engine.mouse_click(point, MouseButton::Left, 1)?;
        if clear {
            self.clear_focused()?;
        }
        // Whatever took focus after the click is the field that gets the text.
        let field = self
            .engine
            .focused_element(target.process.pid)?
            .map(|field| target.app.alongside(field));
        let before = field
            .as_ref()
            .and_then(|f| f.value().ok().flatten())
            .unwrap_or_default();
        self.engine.type_text(text)?;
        ladder.record(ExecutionTier::CoordinateBased, "click_then_type", AttemptOutcome::Succeeded, started);

        let confirmation = match &field {
            Some(field) => {
                let secure = field
                    .attributes()
                    .map(|a| a.role == roles::SECURE_TEXT_FIELD)
                    .unwrap_or(false);
                let expect = Expectation::new(&before, text, clear, self.typing.verify_prefix_chars);
                match self.read_back(field, &expect, secure)? {
                    ReadBack::Confirmed(read) => Some(read),
                    ReadBack::Mismatch(read) => {
                        return Err(AutomationError::VerificationFailed {
                            expected: expect.prefix,
                            actual: read,
                        })
                    }
                    ReadBack::Unchecked => None,
                }
            }
            None => None,
        };
        let mut result = self.finish(ladder, confirmation, Some(point));
        result.focus = Some(focus);
        Ok(result)
    }

    #[instrument(skip(self, target, text))]
    pub fn type_into_focused(
        &self,
        target: &Target<'_>,
        text: &str,
        clear: bool,
    ) -> Result<ActionResult, AutomationError> {
        let focus = self.bring_forward(target)?;
        if let Some(field) = self.engine.focused_element(target.process.pid)? {
            let field = target.app.alongside(field);
            let mut result = self.type_into_element(target, &field, text, clear)?;
            result.focus = Some(focus);
            return Ok(result);
        }

        debug!("no focused element reported, typing blind");
        let mut ladder = Ladder::new();
        let started = Instant::now();
        if clear {
            self.clear_focused()?;
        }
        self.engine.type_text(text)?;
        ladder.record(ExecutionTier::SyntheticInput, "type_text", AttemptOutcome::Succeeded, started);
        let mut result = self.finish(ladder, None, None);
        result.focus = Some(focus);
        Ok(result)
    }

    /// Press one key combination, bringing `target` forward first when given.
    #[instrument(skip(self, target), fields(combo = %combo))]
    pub fn press(&self, target: Option<&Target<'_>>, combo: &KeyCombo) -> Result<ActionResult, AutomationError> {
        let mut ladder = Ladder::new();
        let focus = target.map(|t| self.bring_forward(t)).transpose()?;
        let started = Instant::now();
        let pressed = self.engine.key_press(combo);
        if combo.has_modifiers() {
            self.release_modifiers();
        }
        pressed?;
        ladder.record(ExecutionTier::SyntheticInput, "key_press", AttemptOutcome::Succeeded, started);
        let mut result = self.finish(ladder, None, None);
        result.focus = focus;
        Ok(result)
    }

    /// Scroll the first scroll container under the window, or the window itself.
    #[instrument(skip(self, target))]
    pub fn scroll(
        &self,
        target: &Target<'_>,
        direction: ScrollDirection,
        amount: u32,
    ) -> Result<ActionResult, AutomationError> {
        let mut ladder = Ladder::new();
        let lines = amount.max(1);
        let container = find_scrollable(target.search_root(), SCROLL_SEARCH_DEPTH);

        let started = Instant::now();
        match &container {
            Some(container) => {
                let pages = lines.div_ceil(LINES_PER_PAGE).max(1);
                match container.scroll(direction, pages) {
                    Ok(()) => {
                        ladder.record(ExecutionTier::NativeAssistive, "scroll_by_page", AttemptOutcome::Succeeded, started);
                        let point = container.bounds().ok().filter(|b| !b.is_empty()).map(|b| b.center());
                        return Ok(self.finish(ladder, None, point));
                    }
                    Err(e) => ladder.record(
                        ExecutionTier::NativeAssistive,
                        "scroll_by_page",
                        AttemptOutcome::ExecutionFailed { error: e.to_string() },
                        started,
                    ),
                }
            }
            None => ladder.record(
                ExecutionTier::NativeAssistive,
                "scroll_by_page",
                AttemptOutcome::Unavailable {
                    reason: "no scroll container under the window".to_string(),
                },
                started,
            ),
        }

        let centre = target
            .window_frame
            .filter(|f| !f.is_empty())
            .map(|f| f.center())
            .ok_or_else(|| {
                AutomationError::NotActionable(format!(
                    "{} has no window to scroll",
                    target.process.name
                ))
            })?;
        let started = Instant::now();
        let focus = self.bring_forward(target)?;
        let (dx, dy) = direction.wheel_delta(lines);
        self.engine.scroll_wheel(centre, dx, dy)?;
        ladder.record(ExecutionTier::CoordinateBased, "scroll_wheel", AttemptOutcome::Succeeded, started);
        let mut result = self.finish(ladder, None, Some(centre));
        result.focus = Some(focus);
        Ok(result)
    }

    fn bring_forward(&self, target: &Target<'_>) -> Result<FocusOutcome, AutomationError> {
        self.focus
            .focus_process(&target.process, target.window.as_ref().map(|w| w.element()))
    }

    /// Runs one typing tier and checks the field afterwards. `Some` on success.
    #[allow(clippy::too_many_arguments)]
    fn verified(
        &self,
        ladder: &mut Ladder,
        tier: ExecutionTier,
        method: &str,
        element: &ElementHandle<'_>,
        expect: &Expectation,
        secure: bool,
        started: Instant,
        input: impl FnOnce() -> Result<(), AutomationError>,
    ) -> Option<Option<String>> {
        let outcome = input().and_then(|()| self.read_back(element, expect, secure));
        match outcome {
            Ok(ReadBack::Confirmed(read)) => {
                ladder.record(tier, method, AttemptOutcome::Succeeded, started);
                Some(Some(read))
            }
            Ok(ReadBack::Unchecked) => {
                ladder.record(tier, method, AttemptOutcome::Succeeded, started);
                Some(None)
            }
            Ok(ReadBack::Mismatch(read)) => {
                ladder.record(tier, method, AttemptOutcome::VerificationFailed { read_back: read }, started);
                None
            }
            Err(e) => {
                ladder.record(tier, method, AttemptOutcome::ExecutionFailed { error: e.to_string() }, started);
                None
            }
        }
    }

    fn read_back(
        &self,
        field: &ElementHandle<'_>,
        expect: &Expectation,
        secure: bool,
    ) -> Result<ReadBack, AutomationError> {
        if secure {
            return Ok(ReadBack::Unchecked);
        }
        std::thread::sleep(Duration::from_millis(self.typing.settle_ms));
        let read = field.value()?.unwrap_or_default();
        if expect.met_by(&read) {
            Ok(ReadBack::Confirmed(read))
        } else {
            Ok(ReadBack::Mismatch(read))
        }
    }

    /// Input for a retry rung. When a failed rung left part of the text behind, the
    /// field is wiped and the original value typed back in front of the text.
    fn retry_input(
        &self,
        element: &ElementHandle<'_>,
        before: &str,
        text: &str,
        clear: bool,
        secure: bool,
    ) -> (bool, String) {
        if clear || secure {
            return (clear, text.to_string());
        }
        let current = element.value().ok().flatten().unwrap_or_default();
        if current == before {
            (false, text.to_string())
        } else {
            debug!("field changed under a failed attempt, retyping from the original value");
            (true, format!("{before}{text}"))
        }
    }

    /// Select everything in the focused field and delete it.
    fn clear_focused(&self) -> Result<(), AutomationError> {
        let selected = self.engine.key_press(&KeyCombo::select_all());
        self.release_modifiers();
        selected?;
        self.engine.key_press(&KeyCombo::new(Key::Named(NamedKey::Delete)))
    }

    fn type_per_char(&self, text: &str) -> Result<(), AutomationError> {
        let delay = Duration::from_millis(self.typing.char_delay_ms);
        let mut buf = [0u8; 4];
        for ch in text.chars() {
            self.engine.type_text(ch.encode_utf8(&mut buf))?;
            if !delay.is_zero() {
                std::thread::sleep(delay);
            }
        }
        Ok(())
    }

    fn release_modifiers(&self) {
        if let Err(e) = self.engine.reset_modifiers() {
            warn!(error = %e, "could not reset modifier state");
        }
    }

    fn finish(&self, ladder: Ladder, confirmation: Option<String>, point: Option<Point>) -> ActionResult {
        let mut result = ActionResult::succeeded(ladder.attempts, confirmation, ladder.start);
        result.point = point;
        info!(
            tier = ?result.tier,
            method = %result.method,
            attempts = result.attempts.len(),
            duration_ms = result.duration_ms,
            "Action completed"
        );
        result
    }
}

/// The element must be enabled and take up space on screen.
fn preflight(element: &ElementHandle<'_>) -> Result<Rect, AutomationError> {
    if !element.is_enabled()? {
        return Err(AutomationError::NotActionable(format!(
            "{} is disabled",
            describe(element)
        )));
    }
    let bounds = element.bounds()?;
    if bounds.is_empty() {
        return Err(AutomationError::NotActionable(format!(
            "{} has no on-screen size",
            describe(element)
        )));
    }
    Ok(bounds)
}

fn describe(element: &ElementHandle<'_>) -> String {
    match element.attributes() {
        Ok(attributes) => match attributes.display_text() {
            Some(text) => format!("{} {text:?}", attributes.role),
            None => attributes.role.clone(),
        },
        Err(_) => "element".to_string(),
    }
}

/// Breadth-first, nearest scroll container within `max_depth` levels under `root`.
fn find_scrollable<'s>(root: &ElementHandle<'s>, max_depth: usize) -> Option<ElementHandle<'s>> {
    let mut queue = VecDeque::from([(root.clone(), 0usize)]);
    while let Some((handle, depth)) = queue.pop_front() {
        if depth >= max_depth {
            continue;
        }
        let Ok(children) = handle.children() else {
            continue;
        };
        for child in children {
            let scrollable = child
                .attributes()
                .map(|a| roles::is_scrollable_role(&a.role))
                .unwrap_or(false);
            if scrollable {
                return Some(child);
            }
            queue.push_back((child, depth + 1));
        }
    }
    None
}
