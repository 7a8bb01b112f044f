//! In-memory accessibility engine.
//!
//! A scriptable desktop: applications with window trees, displays, a frontmost
//! process and simulated input. Clicks hit-test the tree and move keyboard focus,
//! typing edits the focused node, and every input is appended to an event log.
//! Nodes can be made slow, can ignore or reject value writes, and applications can
//! activate late or not at all, which is what the focus and verification paths need.

use crate::actions::ScrollDirection;
use crate::element::{UIElementAttributes, UIElementImpl};
use crate::geometry::{Point, Rect};
use crate::guard::ForeignCallGuard;
use crate::keys::{Key, KeyCombo, Modifier, NamedKey};
use crate::platforms::{AccessibilityEngine, CaptureResult, DisplayInfo, MouseButton, ProcessInfo};
use crate::{roles, utils, AutomationError, Locator, UIElement};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::debug;

/// What a node does when its value is written through the accessibility API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueWrites {
    Accept,
    /// The write reports success but the value does not change
    Ignore,
    Reject,
    /// Only the first n characters of a write land
    Truncate(usize),
}

/// What a focused node does with synthetic typing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Typing {
    Accept,
    /// Multi-character input events are lost; one character at a time works
    DropBulk,
    Ignore,
}

/// How an application reacts to activation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Immediate,
    Lagged(Duration),
    Ignored,
}

/// One node of a scripted window tree.
#[derive(Debug, Clone)]
pub struct MemoryNode {
    role: String,
    title: Option<String>,
    label: Option<String>,
    value: Option<String>,
    description: Option<String>,
    identifier: Option<String>,
    enabled: bool,
    frame: Rect,
    actions: Vec<String>,
    value_writes: ValueWrites,
    typing: Typing,
    delay: Option<Duration>,
    children: Vec<MemoryNode>,
}

impl MemoryNode {
    pub fn new(role: impl Into<String>) -> Self {
        let role = role.into();
        let editable = roles::is_editable_role(&role);
        Self {
            value: editable.then(String::new),
            value_writes: if editable {
                ValueWrites::Accept
            } else {
                ValueWrites::Reject
            },
            typing: if editable { Typing::Accept } else { Typing::Ignore },
            role,
            title: None,
            label: None,
            description: None,
            identifier: None,
            enabled: true,
            frame: Rect::default(),
            actions: Vec::new(),
            delay: None,
            children: Vec::new(),
        }
    }

    pub fn window(title: impl Into<String>, frame: Rect) -> Self {
        Self::new(roles::WINDOW)
            .title(title)
            .frame(frame)
            .action("AXRaise")
    }

    pub fn button(title: impl Into<String>) -> Self {
        Self::new("AXButton").title(title).action("AXPress")
    }

    pub fn link(text: impl Into<String>) -> Self {
        Self::new("AXLink").title(text).action("AXPress")
    }

    pub fn text_field(label: impl Into<String>) -> Self {
        Self::new("AXTextField").label(label)
    }

    pub fn static_text(text: impl Into<String>) -> Self {
        Self::new("AXStaticText").value(text)
    }

    pub fn group() -> Self {
        Self::new("AXGroup")
    }

    pub fn scroll_area() -> Self {
        Self::new("AXScrollArea")
            .action("AXScrollUpByPage")
            .action("AXScrollDownByPage")
            .action("AXScrollLeftByPage")
            .action("AXScrollRightByPage")
    }

    pub fn title(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }

    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = Some(label.into());
        self
    }

    pub fn value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self
    }

    pub fn description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn identifier(mut self, identifier: impl Into<String>) -> Self {
        self.identifier = Some(identifier.into());
        self
    }

    pub fn frame(mut self, frame: Rect) -> Self {
        self.frame = frame;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn action(mut self, action: impl Into<String>) -> Self {
        self.actions.push(action.into());
        self
    }

    pub fn value_writes(mut self, behavior: ValueWrites) -> Self {
        self.value_writes = behavior;
        self
    }

    pub fn typing(mut self, behavior: Typing) -> Self {
        self.typing = behavior;
        self
    }

    /// Every accessibility call on this node blocks for `delay` first.
    pub fn slow(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn child(mut self, child: MemoryNode) -> Self {
        self.children.push(child);
        self
    }

    pub fn children(mut self, children: impl IntoIterator<Item = MemoryNode>) -> Self {
        self.children.extend(children);
        self
    }
}

/// A scripted running application.
#[derive(Debug, Clone)]
pub struct MemoryApp {
    pid: i32,
    name: String,
    bundle_id: Option<String>,
    windows: Vec<MemoryNode>,
    activation: Activation,
}

impl MemoryApp {
    pub fn new(pid: i32, name: impl Into<String>) -> Self {
        Self {
            pid,
            name: name.into(),
            bundle_id: None,
            windows: Vec::new(),
            activation: Activation::Immediate,
        }
    }

    pub fn bundle_id(mut self, bundle_id: impl Into<String>) -> Self {
        self.bundle_id = Some(bundle_id.into());
        self
    }

    pub fn window(mut self, window: MemoryNode) -> Self {
        self.windows.push(window);
        self
    }

    pub fn activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }
}

/// Everything the engine was asked to do, in order.
#[derive(Debug, Clone, PartialEq)]
pub enum InputEvent {
    Activate(i32),
    Raise(Option<String>),
    MouseClick {
        point: Point,
        button: MouseButton,
        count: u32,
        target: Option<String>,
    },
    Key(String),
    Text(String),
    Scroll {
        point: Point,
        dx: i32,
        dy: i32,
    },
    ModifierReset,
    Action {
        target: Option<String>,
        action: String,
    },
    SetValue {
        target: Option<String>,
        value: String,
    },
}

#[derive(Debug)]
struct NodeData {
    pid: i32,
    role: String,
    title: Option<String>,
    label: Option<String>,
    value: Option<String>,
    description: Option<String>,
    identifier: Option<String>,
    enabled: bool,
    frame: Rect,
    actions: Vec<String>,
    value_writes: ValueWrites,
    typing: Typing,
    delay: Option<Duration>,
    children: Vec<usize>,
    press_count: u32,
    scroll_pages: i32,
}

impl NodeData {
    fn display_name(&self) -> Option<String> {
        self.identifier
            .clone()
            .or_else(|| self.title.clone())
            .or_else(|| self.label.clone())
    }

    fn answers_to(&self, name: &str) -> bool {
        [&self.identifier, &self.title, &self.label]
            .into_iter()
            .any(|field| field.as_deref() == Some(name))
    }
}

#[derive(Debug)]
struct AppData {
    pid: i32,
    name: String,
    bundle_id: Option<String>,
    root: usize,
    windows: Vec<usize>,
    activation: Activation,
}

#[derive(Debug, Default)]
struct State {
    nodes: Vec<NodeData>,
    apps: Vec<AppData>,
    displays: Vec<DisplayInfo>,
    frontmost: Option<i32>,
    pending_activation: Option<(i32, Instant)>,
    focused: HashMap<i32, usize>,
    select_all_armed: bool,
    events: Vec<InputEvent>,
}

impl State {
    fn insert(&mut self, pid: i32, node: MemoryNode) -> usize {
        let index = self.nodes.len();
        self.nodes.push(NodeData {
            pid,
            role: node.role,
            title: node.title,
            label: node.label,
            value: node.value,
            description: node.description,
            identifier: node.identifier,
            enabled: node.enabled,
            frame: node.frame,
            actions: node.actions,
            value_writes: node.value_writes,
            typing: node.typing,
            delay: node.delay,
            children: Vec::new(),
            press_count: 0,
            scroll_pages: 0,
        });
        let children: Vec<usize> = node
            .children
            .into_iter()
            .map(|child| self.insert(pid, child))
            .collect();
        self.nodes[index].children = children;
        index
    }

    fn app(&self, pid: i32) -> Result<&AppData, AutomationError> {
        self.apps
            .iter()
            .find(|app| app.pid == pid)
            .ok_or_else(|| AutomationError::ElementNotFound(format!("no process with pid {pid}")))
    }

    fn settle_activation(&mut self) {
        if let Some((pid, ready_at)) = self.pending_activation {
            if Instant::now() >= ready_at {
                self.frontmost = Some(pid);
                self.pending_activation = None;
            }
        }
    }

    fn find_named(&self, name: &str) -> Option<&NodeData> {
        self.nodes.iter().find(|node| node.answers_to(name))
    }

    /// Deepest node under `point` in the frontmost application's windows.
    fn hit_test(&self, point: Point) -> Option<usize> {
        let pid = self.frontmost?;
        let app = self.apps.iter().find(|app| app.pid == pid)?;
        let mut hit = None;
        for &window in &app.windows {
            if !self.nodes[window].frame.contains(point) {
                continue;
            }
            let mut stack = vec![window];
            while let Some(index) = stack.pop() {
                let node = &self.nodes[index];
                if node.frame.contains(point) {
                    hit = Some(index);
                }
                // Frameless containers still hold framed children.
                stack.extend(node.children.iter().copied());
            }
            if hit.is_some() {
                break;
            }
        }
        hit
    }

    fn press(&mut self, index: usize, action: &str) -> Result<(), AutomationError> {
        let node = &mut self.nodes[index];
        if !node.actions.iter().any(|a| a == action) {
            return Err(AutomationError::UnsupportedOperation(format!(
                "{} does not support {action}",
                node.role
            )));
        }
        match action {
            "AXPress" => node.press_count += 1,
            "AXScrollDownByPage" | "AXScrollRightByPage" => node.scroll_pages += 1,
            "AXScrollUpByPage" | "AXScrollLeftByPage" => node.scroll_pages -= 1,
            _ => {}
        }
        let target = node.display_name();
        self.events.push(InputEvent::Action {
            target,
            action: action.to_string(),
        });
        Ok(())
    }

    fn focused_node(&mut self) -> Option<&mut NodeData> {
        let pid = self.frontmost?;
        let index = *self.focused.get(&pid)?;
        self.nodes.get_mut(index)
    }
}

fn lock(state: &Mutex<State>) -> Result<MutexGuard<'_, State>, AutomationError> {
    state
        .lock()
        .map_err(|_| AutomationError::Internal("memory engine state poisoned".to_string()))
}

pub struct MemoryElement {
    state: Arc<Mutex<State>>,
    index: usize,
}

impl std::fmt::Debug for MemoryElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryElement")
            .field("index", &self.index)
            .finish()
    }
}

impl MemoryElement {
    fn with_node<T>(&self, f: impl FnOnce(&mut State, usize) -> T) -> Result<T, AutomationError> {
        let delay = lock(&self.state)?
            .nodes
            .get(self.index)
            .and_then(|node| node.delay);
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }
        let mut state = lock(&self.state)?;
        if self.index >= state.nodes.len() {
            return Err(AutomationError::ElementNotFound(
                "element no longer exists".to_string(),
            ));
        }
        Ok(f(&mut state, self.index))
    }
}

impl UIElementImpl for MemoryElement {
    fn object_id(&self) -> usize {
        self.index
    }

    fn attributes(&self) -> Result<UIElementAttributes, AutomationError> {
        self.with_node(|state, i| {
            let node = &state.nodes[i];
            UIElementAttributes {
                role: node.role.clone(),
                name: node.title.clone(),
                label: node.label.clone(),
                value: node.value.clone(),
                description: node.description.clone(),
                identifier: node.identifier.clone(),
                enabled: Some(node.enabled),
            }
        })
    }

    fn children(&self) -> Result<Vec<Arc<dyn UIElementImpl>>, AutomationError> {
        self.with_node(|state, i| {
            state.nodes[i]
                .children
                .iter()
                .map(|&index| {
                    Arc::new(MemoryElement {
                        state: self.state.clone(),
                        index,
                    }) as Arc<dyn UIElementImpl>
                })
                .collect()
        })
    }

    fn bounds(&self) -> Result<Rect, AutomationError> {
        self.with_node(|state, i| state.nodes[i].frame)
    }

    fn process_id(&self) -> Result<i32, AutomationError> {
        self.with_node(|state, i| state.nodes[i].pid)
    }

    fn actions(&self) -> Result<Vec<String>, AutomationError> {
        self.with_node(|state, i| state.nodes[i].actions.clone())
    }

    fn perform_action(&self, action: &str) -> Result<(), AutomationError> {
        self.with_node(|state, i| state.press(i, action))?
    }

    fn value(&self) -> Result<Option<String>, AutomationError> {
        self.with_node(|state, i| state.nodes[i].value.clone())
    }

    fn set_value(&self, value: &str) -> Result<(), AutomationError> {
        self.with_node(|state, i| {
            let node = &mut state.nodes[i];
            let target = node.display_name();
            match node.value_writes {
                ValueWrites::Accept => node.value = Some(value.to_string()),
                ValueWrites::Ignore => {}
                ValueWrites::Truncate(n) => node.value = Some(value.chars().take(n).collect()),
                ValueWrites::Reject => {
                    return Err(AutomationError::PlatformError(format!(
                        "AXValue is not settable on {}",
                        node.role
                    )))
                }
            }
            state.events.push(InputEvent::SetValue {
                target,
                value: value.to_string(),
            });
            Ok(())
        })?
    }

    fn focus(&self) -> Result<(), AutomationError> {
        self.with_node(|state, i| {
            let pid = state.nodes[i].pid;
            state.focused.insert(pid, i);
            state.select_all_armed = false;
        })
    }

    fn is_enabled(&self) -> Result<bool, AutomationError> {
        self.with_node(|state, i| state.nodes[i].enabled)
    }

    fn scroll(&self, direction: ScrollDirection, pages: u32) -> Result<(), AutomationError> {
        let action = match direction {
            ScrollDirection::Up => "AXScrollUpByPage",
            ScrollDirection::Down => "AXScrollDownByPage",
            ScrollDirection::Left => "AXScrollLeftByPage",
            ScrollDirection::Right => "AXScrollRightByPage",
        };
        self.with_node(|state, i| {
            for _ in 0..pages.max(1) {
                state.press(i, action)?;
            }
            Ok(())
        })?
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Scriptable engine backed by an in-process tree.
pub struct MemoryEngine {
    state: Arc<Mutex<State>>,
    guard: Arc<ForeignCallGuard>,
    native_index: bool,
}

pub const DEFAULT_DISPLAY: Rect = Rect::new(0.0, 0.0, 1728.0, 1117.0);

impl MemoryEngine {
    pub fn new() -> Self {
        let state = State {
            displays: vec![DisplayInfo {
                id: 1,
                frame: DEFAULT_DISPLAY,
                scale_factor: 2.0,
                is_primary: true,
            }],
            ..State::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            guard: Arc::new(ForeignCallGuard::new(Duration::from_secs(3))),
            native_index: true,
        }
    }

    /// Adds an application. The first one added becomes frontmost.
    pub fn with_app(self, app: MemoryApp) -> Self {
        if let Ok(mut state) = self.state.lock() {
            let root = state.insert(
                app.pid,
                MemoryNode::new(roles::APPLICATION).title(app.name.clone()),
            );
            let windows: Vec<usize> = app
                .windows
                .into_iter()
                .map(|window| state.insert(app.pid, window))
                .collect();
            state.nodes[root].children = windows.clone();
            if state.frontmost.is_none() {
                state.frontmost = Some(app.pid);
            }
            state.apps.push(AppData {
                pid: app.pid,
                name: app.name,
                bundle_id: app.bundle_id,
                root,
                windows,
                activation: app.activation,
            });
        }
        self
    }

    pub fn with_displays(self, frames: impl IntoIterator<Item = Rect>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.displays = frames
                .into_iter()
                .enumerate()
                .map(|(i, frame)| DisplayInfo {
                    id: i as u32 + 1,
                    frame,
                    scale_factor: 2.0,
                    is_primary: i == 0,
                })
                .collect();
        }
        self
    }

    pub fn with_frontmost(self, pid: i32) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.frontmost = Some(pid);
        }
        self
    }

    pub fn with_element_timeout(mut self, timeout: Duration) -> Self {
        self.guard = Arc::new(ForeignCallGuard::new(timeout));
        self
    }

    /// Disables `native_search`, as on frameworks without an indexed query.
    pub fn without_native_index(mut self) -> Self {
        self.native_index = false;
        self
    }

    pub fn events(&self) -> Vec<InputEvent> {
        self.state
            .lock()
            .map(|state| state.events.clone())
            .unwrap_or_default()
    }

    pub fn clear_events(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.events.clear();
        }
    }

    /// Value of the node whose identifier, title or label is `name`.
    pub fn value_of(&self, name: &str) -> Option<String> {
        let state = self.state.lock().ok()?;
        state.find_named(name).and_then(|node| node.value.clone())
    }

    pub fn press_count(&self, name: &str) -> u32 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.find_named(name).map(|node| node.press_count))
            .unwrap_or(0)
    }

    pub fn scroll_pages(&self, name: &str) -> i32 {
        self.state
            .lock()
            .ok()
            .and_then(|state| state.find_named(name).map(|node| node.scroll_pages))
            .unwrap_or(0)
    }

    pub fn frontmost_pid(&self) -> Option<i32> {
        let mut state = self.state.lock().ok()?;
        state.settle_activation();
        state.frontmost
    }

    /// Switch the frontmost app behind the automation's back.
    pub fn set_frontmost(&self, pid: i32) {
        if let Ok(mut state) = self.state.lock() {
            state.frontmost = Some(pid);
            state.pending_activation = None;
        }
    }

    pub fn activation_requests(&self, pid: i32) -> usize {
        self.events()
            .iter()
            .filter(|event| **event == InputEvent::Activate(pid))
            .count()
    }

    fn wrap(&self, index: usize) -> UIElement {
        UIElement::new(
            Arc::new(MemoryElement {
                state: self.state.clone(),
                index,
            }),
            self.guard.clone(),
        )
    }

    fn node_index(element: &UIElement) -> Result<usize, AutomationError> {
        element
            .as_any()
            .downcast_ref::<MemoryElement>()
            .map(|e| e.index)
            .ok_or_else(|| {
                AutomationError::InvalidArgument("element does not belong to this engine".to_string())
            })
    }

    fn matches_locator(node: &NodeData, locator: &Locator) -> bool {
        if let Some(role) = locator.role_filter() {
            if !roles::role_matches(role, &node.role) {
                return false;
            }
        }
        if let Some(id) = locator.structural_id() {
            if node.identifier.as_deref() != Some(id) {
                return false;
            }
        }
        match locator.query_text() {
            Some(query) => {
                let query = utils::normalize(query);
                [&node.title, &node.label, &node.value, &node.description]
                    .into_iter()
                    .filter_map(|f| f.as_deref())
                    .any(|text| utils::normalize(text).contains(&query))
            }
            None => true,
        }
    }

    fn render_png(width: u32, height: u32) -> Result<Vec<u8>, AutomationError> {
        let image = image::RgbaImage::from_pixel(width, height, image::Rgba([236, 236, 236, 255]));
        let mut png = Vec::new();
        image::DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
            .map_err(|e| AutomationError::Internal(format!("failed to encode capture: {e}")))?;
        Ok(png)
    }
}

impl Default for MemoryEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl AccessibilityEngine for MemoryEngine {
    fn process_by_name(&self, name: &str) -> Result<ProcessInfo, AutomationError> {
        let state = lock(&self.state)?;
        let wanted = utils::normalize(name);
        state
            .apps
            .iter()
            .find(|app| utils::normalize(&app.name) == wanted)
            .map(|app| ProcessInfo {
                pid: app.pid,
                name: app.name.clone(),
                bundle_id: app.bundle_id.clone(),
            })
            .ok_or_else(|| AutomationError::ElementNotFound(format!("application '{name}' is not running")))
    }

    fn frontmost_process(&self) -> Result<Option<ProcessInfo>, AutomationError> {
        let mut state = lock(&self.state)?;
        state.settle_activation();
        let Some(pid) = state.frontmost else {
            return Ok(None);
        };
        let app = state.app(pid)?;
        Ok(Some(ProcessInfo {
            pid,
            name: app.name.clone(),
            bundle_id: app.bundle_id.clone(),
        }))
    }

    fn application(&self, pid: i32) -> Result<UIElement, AutomationError> {
        let root = lock(&self.state)?.app(pid)?.root;
        Ok(self.wrap(root))
    }

    fn window(&self, pid: i32, title: Option<&str>) -> Result<Option<UIElement>, AutomationError> {
        let state = lock(&self.state)?;
        let app = state.app(pid)?;
        let titled = title.and_then(|wanted| {
            let wanted = utils::normalize(wanted);
            app.windows.iter().copied().find(|&w| {
                state.nodes[w]
                    .title
                    .as_deref()
                    .is_some_and(|t| utils::normalize(t).contains(&wanted))
            })
        });
        let index = titled.or_else(|| app.windows.first().copied());
        drop(state);
        Ok(index.map(|i| self.wrap(i)))
    }

    fn focused_element(&self, pid: i32) -> Result<Option<UIElement>, AutomationError> {
        let state = lock(&self.state)?;
        state.app(pid)?;
        let focused = state.focused.get(&pid).copied();
        drop(state);
        Ok(focused.map(|i| self.wrap(i)))
    }

    fn native_search(
        &self,
        root: &UIElement,
        locator: &Locator,
    ) -> Result<Option<Vec<UIElement>>, AutomationError> {
        if !self.native_index {
            return Ok(None);
        }
        let root = Self::node_index(root)?;
        let state = lock(&self.state)?;
        let mut hits = Vec::new();
        let mut stack: Vec<usize> = state.nodes[root].children.iter().rev().copied().collect();
        while let Some(index) = stack.pop() {
            let node = &state.nodes[index];
            if Self::matches_locator(node, locator) {
                hits.push(index);
            }
            stack.extend(node.children.iter().rev().copied());
        }
        drop(state);
        debug!(hits = hits.len(), "memory native search");
        Ok(Some(hits.into_iter().map(|i| self.wrap(i)).collect()))
    }

    fn activate(&self, pid: i32) -> Result<(), AutomationError> {
        let mut state = lock(&self.state)?;
        let activation = state.app(pid)?.activation;
        state.events.push(InputEvent::Activate(pid));
        match activation {
            Activation::Immediate => {
                state.frontmost = Some(pid);
                state.pending_activation = None;
            }
            Activation::Lagged(lag) => {
                if state.frontmost != Some(pid) {
                    state.pending_activation = Some((pid, Instant::now() + lag));
                }
            }
            Activation::Ignored => {}
        }
        Ok(())
    }

    fn raise_window(&self, window: &UIElement) -> Result<(), AutomationError> {
        let index = Self::node_index(window)?;
        let mut state = lock(&self.state)?;
        let title = state.nodes[index].title.clone();
        state.events.push(InputEvent::Raise(title));
        Ok(())
    }

    fn displays(&self) -> Result<Vec<DisplayInfo>, AutomationError> {
        Ok(lock(&self.state)?.displays.clone())
    }

    async fn capture_window(
        &self,
        pid: i32,
        window_title: Option<&str>,
    ) -> Result<CaptureResult, AutomationError> {
        let window = self
            .window(pid, window_title)?
            .ok_or_else(|| AutomationError::ElementNotFound(format!("pid {pid} has no window")))?;
        let window_frame = window.bounds()?;
        let displays = self.displays()?;
        let display_frame = displays
            .iter()
            .find(|d| d.frame.contains(window_frame.center()))
            .or(displays.first())
            .map(|d| d.frame)
            .unwrap_or(DEFAULT_DISPLAY);
        // Quarter-size image: grounding only ever sees normalised coordinates.
        let width = (window_frame.width / 4.0).max(1.0) as u32;
        let height = (window_frame.height / 4.0).max(1.0) as u32;
        Ok(CaptureResult {
            png: Self::render_png(width, height)?,
            width,
            height,
            window_frame,
            display_frame,
        })
    }

    fn mouse_click(
        &self,
        point: Point,
        button: MouseButton,
        count: u32,
    ) -> Result<(), AutomationError> {
        let mut state = lock(&self.state)?;
        let hit = state.hit_test(point);
        let target = hit.and_then(|i| state.nodes[i].display_name());
        state.events.push(InputEvent::MouseClick {
            point,
            button,
            count,
            target,
        });
        if let Some(index) = hit {
            let pid = state.nodes[index].pid;
            state.focused.insert(pid, index);
            state.select_all_armed = false;
            let node = &mut state.nodes[index];
            if button == MouseButton::Left
                && node.enabled
                && node.actions.iter().any(|a| a == "AXPress")
            {
                node.press_count += 1;
            }
        }
        Ok(())
    }

    fn key_press(&self, combo: &KeyCombo) -> Result<(), AutomationError> {
        let mut state = lock(&self.state)?;
        state.events.push(InputEvent::Key(combo.to_string()));
        let select_all = combo.key == Key::Char('a') && combo.modifiers == [Modifier::Command];
        let delete = combo.key == Key::Named(NamedKey::Delete) && !combo.has_modifiers();
        let armed = state.select_all_armed;
        state.select_all_armed = select_all;
        if delete {
            if let Some(node) = state.focused_node() {
                if node.typing != Typing::Ignore {
                    let value = node.value.get_or_insert_with(String::new);
                    if armed {
                        value.clear();
                    } else {
                        value.pop();
                    }
                }
            }
        }
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<(), AutomationError> {
        let mut state = lock(&self.state)?;
        state.events.push(InputEvent::Text(text.to_string()));
        let armed = std::mem::take(&mut state.select_all_armed);
        if let Some(node) = state.focused_node() {
            let accepted = match node.typing {
                Typing::Accept => true,
                Typing::DropBulk => text.chars().count() <= 1,
                Typing::Ignore => false,
            };
            if accepted {
                let value = node.value.get_or_insert_with(String::new);
                if armed {
                    value.clear();
                }
                value.push_str(text);
            }
        }
        Ok(())
    }

    fn scroll_wheel(&self, point: Point, dx: i32, dy: i32) -> Result<(), AutomationError> {
        lock(&self.state)?
            .events
            .push(InputEvent::Scroll { point, dx, dy });
        Ok(())
    }

    fn reset_modifiers(&self) -> Result<(), AutomationError> {
        lock(&self.state)?.events.push(InputEvent::ModifierReset);
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mail() -> MemoryEngine {
        MemoryEngine::new().with_app(
            MemoryApp::new(100, "Mail").window(
                MemoryNode::window("Inbox", Rect::new(100.0, 100.0, 800.0, 600.0)).children([
                    MemoryNode::button("Compose").frame(Rect::new(120.0, 140.0, 80.0, 24.0)),
                    MemoryNode::text_field("To")
                        .identifier("to-field")
                        .frame(Rect::new(120.0, 200.0, 400.0, 24.0)),
                ]),
            ),
        )
    }

    #[test]
    fn click_hit_tests_and_focuses() {
        let engine = mail();
        engine
            .mouse_click(Point::new(150.0, 150.0), MouseButton::Left, 1)
            .unwrap();
        assert_eq!(engine.press_count("Compose"), 1);

        engine
            .mouse_click(Point::new(200.0, 210.0), MouseButton::Left, 1)
            .unwrap();
        engine.type_text("bob@example.com").unwrap();
        assert_eq!(engine.value_of("to-field").as_deref(), Some("bob@example.com"));
    }

    #[test]
    fn select_all_then_delete_clears_the_field() {
        let engine = mail();
        engine
            .mouse_click(Point::new(200.0, 210.0), MouseButton::Left, 1)
            .unwrap();
        engine.type_text("old").unwrap();
        engine.key_press(&KeyCombo::select_all()).unwrap();
        engine.key_press(&"delete".parse().unwrap()).unwrap();
        engine.type_text("new").unwrap();
        assert_eq!(engine.value_of("To").as_deref(), Some("new"));
    }

    #[test]
    fn lagged_activation_settles_later() {
        let engine = mail().with_app(
            MemoryApp::new(200, "Notes").activation(Activation::Lagged(Duration::from_millis(30))),
        );
        engine.activate(200).unwrap();
        assert_eq!(engine.frontmost_pid(), Some(100));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(engine.frontmost_pid(), Some(200));
    }

    #[test]
    fn native_search_is_unbounded_but_optional() {
        let engine = mail();
        let app = engine.application(100).unwrap();
        let hits = engine
            .native_search(&app, &Locator::query("compose").with_role("button"))
            .unwrap()
            .unwrap();
        assert_eq!(hits.len(), 1);

        let engine = mail().without_native_index();
        let app = engine.application(100).unwrap();
        assert!(engine
            .native_search(&app, &Locator::query("compose"))
            .unwrap()
            .is_none());
    }
}
