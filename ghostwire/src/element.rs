use crate::actions::ScrollDirection;
use crate::errors::AutomationError;
use crate::geometry::Rect;
use crate::guard::ForeignCallGuard;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Attributes associated with a UI element
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UIElementAttributes {
    pub role: String,
    /// AXTitle
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Text of the element's title element, if it has one
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Framework-assigned identifier (AXIdentifier, DOM id)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enabled: Option<bool>,
}

impl UIElementAttributes {
    /// Whether the element carries any human-readable text of its own.
    pub fn has_text(&self) -> bool {
        [&self.name, &self.value, &self.description]
            .into_iter()
            .any(|field| field.as_deref().is_some_and(|s| !s.trim().is_empty()))
    }

    /// Text fields a free-text query is matched against.
    pub fn searchable_text(&self) -> impl Iterator<Item = &str> {
        [
            &self.name,
            &self.label,
            &self.value,
            &self.description,
            &self.identifier,
        ]
        .into_iter()
        .filter_map(|field| field.as_deref())
        .filter(|s| !s.is_empty())
    }

    pub fn display_text(&self) -> Option<&str> {
        self.name
            .as_deref()
            .or(self.label.as_deref())
            .or(self.description.as_deref())
            .or(self.value.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Interface for platform-specific element implementations.
///
/// Implementations talk to the target process directly and may block; callers
/// always go through [`UIElement`], which bounds every call with the foreign-call guard.
pub(crate) trait UIElementImpl: Send + Sync + Debug {
    fn object_id(&self) -> usize;
    fn attributes(&self) -> Result<UIElementAttributes, AutomationError>;
    fn children(&self) -> Result<Vec<Arc<dyn UIElementImpl>>, AutomationError>;
    fn bounds(&self) -> Result<Rect, AutomationError>;
    fn process_id(&self) -> Result<i32, AutomationError>;
    fn actions(&self) -> Result<Vec<String>, AutomationError>;
    fn perform_action(&self, action: &str) -> Result<(), AutomationError>;
    fn value(&self) -> Result<Option<String>, AutomationError>;
    fn set_value(&self, value: &str) -> Result<(), AutomationError>;
    fn focus(&self) -> Result<(), AutomationError>;
    fn is_enabled(&self) -> Result<bool, AutomationError>;
    fn scroll(&self, direction: ScrollDirection, pages: u32) -> Result<(), AutomationError>;
    fn as_any(&self) -> &dyn std::any::Any;
}

/// Represents a UI element in a desktop application
#[derive(Clone)]
pub struct UIElement {
    inner: Arc<dyn UIElementImpl>,
    guard: Arc<ForeignCallGuard>,
}

impl UIElement {
    pub(crate) fn new(inner: Arc<dyn UIElementImpl>, guard: Arc<ForeignCallGuard>) -> Self {
        Self { inner, guard }
    }

    fn call<T, F>(&self, what: &str, f: F) -> Result<T, AutomationError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn UIElementImpl) -> Result<T, AutomationError> + Send + 'static,
    {
        let inner = self.inner.clone();
        self.guard.call(what, move || f(inner.as_ref()))
    }

    pub fn object_id(&self) -> usize {
        self.inner.object_id()
    }

    /// Get all attributes of the element
    pub fn attributes(&self) -> Result<UIElementAttributes, AutomationError> {
        self.call("read attributes", |e| e.attributes())
    }

    /// Get child elements
    pub fn children(&self) -> Result<Vec<UIElement>, AutomationError> {
        let children = self.call("read children", |e| e.children())?;
        Ok(children
            .into_iter()
            .map(|inner| UIElement::new(inner, self.guard.clone()))
            .collect())
    }

    /// Screen-space frame
    pub fn bounds(&self) -> Result<Rect, AutomationError> {
        self.call("read bounds", |e| e.bounds())
    }

    pub fn process_id(&self) -> Result<i32, AutomationError> {
        self.call("read pid", |e| e.process_id())
    }

    /// Names of the accessibility actions the element advertises
    pub fn actions(&self) -> Result<Vec<String>, AutomationError> {
        self.call("list actions", |e| e.actions())
    }

    /// Perform a named action on this element
    pub fn perform_action(&self, action: &str) -> Result<(), AutomationError> {
        let action = action.to_string();
        self.call("perform action", move |e| e.perform_action(&action))
    }

    /// Current value as text, if the element has one
    pub fn value(&self) -> Result<Option<String>, AutomationError> {
        self.call("read value", |e| e.value())
    }

    /// Set value of this element
    pub fn set_value(&self, value: &str) -> Result<(), AutomationError> {
        let value = value.to_string();
        self.call("set value", move |e| e.set_value(&value))
    }

    /// Focus this element
    pub fn focus(&self) -> Result<(), AutomationError> {
        self.call("focus element", |e| e.focus())
    }

    /// Check if element is enabled
    pub fn is_enabled(&self) -> Result<bool, AutomationError> {
        self.call("read enabled", |e| e.is_enabled())
    }

    /// Scroll the element by whole pages
    pub fn scroll(&self, direction: ScrollDirection, pages: u32) -> Result<(), AutomationError> {
        self.call("scroll element", move |e| e.scroll(direction, pages))
    }

    pub(crate) fn as_any(&self) -> &dyn std::any::Any {
        self.inner.as_any()
    }
}

impl Debug for UIElement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UIElement")
            .field("inner", &self.inner)
            .finish()
    }
}

impl PartialEq for UIElement {
    fn eq(&self, other: &Self) -> bool {
        self.inner.object_id() == other.inner.object_id()
    }
}

impl Eq for UIElement {}

impl std::hash::Hash for UIElement {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.inner.object_id().hash(state);
    }
}

static NEXT_SCOPE_ID: AtomicU64 = AtomicU64::new(1);

/// The lifetime of one request. Element handles borrow from it and die with it.
#[derive(Debug)]
pub struct CallScope {
    id: u64,
    started: Instant,
}

impl CallScope {
    pub fn new() -> Self {
        Self {
            id: NEXT_SCOPE_ID.fetch_add(1, Ordering::Relaxed),
            started: Instant::now(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Bind a live element to this scope.
    pub fn adopt(&self, element: UIElement) -> ElementHandle<'_> {
        ElementHandle {
            element,
            _scope: PhantomData,
        }
    }
}

impl Default for CallScope {
    fn default() -> Self {
        Self::new()
    }
}

/// A live element reference that cannot outlive the [`CallScope`] it was found in.
///
/// The underlying [`UIElement`] is never handed out; every read and write goes through
/// the handle, so nothing found during a call survives it.
///
/// ```compile_fail
/// use ghostwire::{ElementHandle, UIElement};
///
/// fn keep(handle: &ElementHandle<'_>) -> UIElement {
///     (**handle).clone()
/// }
/// ```
///
/// ```compile_fail
/// use ghostwire::{CallScope, ElementHandle, UIElement};
///
/// fn outlive(element: UIElement) -> ElementHandle<'static> {
///     let scope = CallScope::new();
///     scope.adopt(element)
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ElementHandle<'s> {
    element: UIElement,
    _scope: PhantomData<&'s CallScope>,
}

impl<'s> ElementHandle<'s> {
    /// Children, bound to the same scope.
    pub fn children(&self) -> Result<Vec<ElementHandle<'s>>, AutomationError> {
        Ok(self
            .element
            .children()?
            .into_iter()
            .map(|element| self.alongside(element))
            .collect())
    }

    /// Bind another live element to this handle's scope.
    pub(crate) fn alongside(&self, element: UIElement) -> ElementHandle<'s> {
        ElementHandle {
            element,
            _scope: PhantomData,
        }
    }

    pub(crate) fn element(&self) -> &UIElement {
        &self.element
    }

    pub fn object_id(&self) -> usize {
        self.element.object_id()
    }

    pub fn attributes(&self) -> Result<UIElementAttributes, AutomationError> {
        self.element.attributes()
    }

    pub fn bounds(&self) -> Result<Rect, AutomationError> {
        self.element.bounds()
    }

    pub fn process_id(&self) -> Result<i32, AutomationError> {
        self.element.process_id()
    }

    pub fn actions(&self) -> Result<Vec<String>, AutomationError> {
        self.element.actions()
    }

    pub fn perform_action(&self, action: &str) -> Result<(), AutomationError> {
        self.element.perform_action(action)
    }

    pub fn value(&self) -> Result<Option<String>, AutomationError> {
        self.element.value()
    }

    pub fn set_value(&self, value: &str) -> Result<(), AutomationError> {
        self.element.set_value(value)
    }

    pub fn focus(&self) -> Result<(), AutomationError> {
        self.element.focus()
    }

    pub fn is_enabled(&self) -> Result<bool, AutomationError> {
        self.element.is_enabled()
    }

    pub fn scroll(&self, direction: ScrollDirection, pages: u32) -> Result<(), AutomationError> {
        self.element.scroll(direction, pages)
    }
}

/// A scored search hit. Lives no longer than the scope of its handle.
#[derive(Debug, Clone)]
pub struct Candidate<'s> {
    pub handle: ElementHandle<'s>,
    pub score: i32,
    pub attributes: UIElementAttributes,
    pub bounds: Option<Rect>,
}

/// Owned description of an element, safe to return after the call ends.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ElementSummary {
    pub role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frame: Option<Rect>,
}

impl Candidate<'_> {
    pub fn summary(&self) -> ElementSummary {
        ElementSummary {
            role: self.attributes.role.clone(),
            text: self.attributes.display_text().map(str::to_string),
            identifier: self.attributes.identifier.clone(),
            frame: self.bounds,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_presence_ignores_label_and_blank_fields() {
        let attrs = UIElementAttributes {
            role: "AXGroup".into(),
            name: Some("  ".into()),
            label: Some("Toolbar".into()),
            ..Default::default()
        };
        assert!(!attrs.has_text());
        assert_eq!(attrs.searchable_text().collect::<Vec<_>>(), vec!["  ", "Toolbar"]);
    }

    #[test]
    fn handles_read_and_write_through_the_element() {
        use crate::platforms::memory::{MemoryApp, MemoryEngine, MemoryNode};
        use crate::platforms::AccessibilityEngine;

        let field_frame = Rect::new(10.0, 10.0, 200.0, 20.0);
        let engine = MemoryEngine::new().with_app(MemoryApp::new(1, "Notes").window(
            MemoryNode::window("Note", Rect::new(0.0, 0.0, 400.0, 300.0))
                .child(MemoryNode::text_field("Body").frame(field_frame)),
        ));
        let scope = CallScope::new();
        let window = scope.adopt(engine.window(1, None).unwrap().unwrap());
        let field = window.children().unwrap().remove(0);
        assert_eq!(field.attributes().unwrap().role, "AXTextField");
        assert_eq!(field.bounds().unwrap(), field_frame);
        field.set_value("hi").unwrap();
        assert_eq!(field.value().unwrap().as_deref(), Some("hi"));
    }

    #[test]
    fn scopes_get_distinct_ids() {
        let a = CallScope::new();
        let b = CallScope::new();
        assert_ne!(a.id(), b.id());
    }
}
