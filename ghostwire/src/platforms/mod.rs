use crate::geometry::{Point, Rect};
use crate::keys::KeyCombo;
use crate::{AutomationError, Config, Locator, UIElement};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub mod memory;
#[cfg(target_os = "macos")]
pub mod macos;

/// A running application
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub pid: i32,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bundle_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DisplayInfo {
    pub id: u32,
    /// Screen-space frame in points
    pub frame: Rect,
    pub scale_factor: f64,
    pub is_primary: bool,
}

/// A window capture plus the geometry it was taken under
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// PNG-encoded image
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub window_frame: Rect,
    pub display_frame: Rect,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

/// The common trait that all platform-specific engines must implement
#[async_trait::async_trait]
pub trait AccessibilityEngine: Send + Sync {
    /// Find a running application by its localized name (case-insensitive)
    fn process_by_name(&self, name: &str) -> Result<ProcessInfo, AutomationError>;

    /// The application currently receiving keyboard input
    fn frontmost_process(&self) -> Result<Option<ProcessInfo>, AutomationError>;

    /// Application root element for a process
    fn application(&self, pid: i32) -> Result<UIElement, AutomationError>;

    /// A window of the process. When `title` is given and nothing matches it, the
    /// process's first window is returned instead.
    fn window(&self, pid: i32, title: Option<&str>) -> Result<Option<UIElement>, AutomationError>;

    /// The element holding keyboard focus inside the process
    fn focused_element(&self, pid: i32) -> Result<Option<UIElement>, AutomationError>;

    /// The framework's own indexed search under `root`. `None` when the framework
    /// offers no such search for this root.
    fn native_search(
        &self,
        _root: &UIElement,
        _locator: &Locator,
    ) -> Result<Option<Vec<UIElement>>, AutomationError> {
        Ok(None)
    }

    /// Ask the window server to bring the process forward. Does not wait.
    fn activate(&self, pid: i32) -> Result<(), AutomationError>;

    fn raise_window(&self, window: &UIElement) -> Result<(), AutomationError>;

    fn displays(&self) -> Result<Vec<DisplayInfo>, AutomationError>;

    /// Capture a window of the process together with its frame and display frame
    async fn capture_window(
        &self,
        pid: i32,
        window_title: Option<&str>,
    ) -> Result<CaptureResult, AutomationError>;

    fn mouse_click(&self, point: Point, button: MouseButton, count: u32)
        -> Result<(), AutomationError>;

    fn key_press(&self, combo: &KeyCombo) -> Result<(), AutomationError>;

    /// Type text into whatever holds keyboard focus
    fn type_text(&self, text: &str) -> Result<(), AutomationError>;

    fn scroll_wheel(&self, point: Point, dx: i32, dy: i32) -> Result<(), AutomationError>;

    /// Post a neutral modifier state so no modifier stays logically held
    fn reset_modifiers(&self) -> Result<(), AutomationError>;

    /// Enable downcasting to concrete engine types
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Create the appropriate engine for the current platform
pub fn create_engine(config: &Config) -> Result<Arc<dyn AccessibilityEngine>, AutomationError> {
    #[cfg(target_os = "macos")]
    {
        Ok(Arc::new(macos::MacOSEngine::new(config.timeouts.element())?))
    }
    #[cfg(not(target_os = "macos"))]
    {
        let _ = config;
        Err(AutomationError::UnsupportedPlatform(
            "only macOS has a native accessibility engine; use the in-memory engine elsewhere"
                .to_string(),
        ))
    }
}
