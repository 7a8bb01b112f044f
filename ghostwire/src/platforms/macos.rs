use crate::actions::ScrollDirection;
use crate::element::{UIElementAttributes, UIElementImpl};
use crate::geometry::{Point, Rect};
use crate::guard::ForeignCallGuard;
use crate::keys::{Key, KeyCombo, Modifier, NamedKey};
use crate::platforms::{AccessibilityEngine, CaptureResult, DisplayInfo, MouseButton, ProcessInfo};
use crate::{roles, utils, AutomationError, Locator, UIElement};

use accessibility::{AXAttribute, AXUIElement, AXUIElementAttributes};
use core_foundation::array::{__CFArray, CFArrayGetCount, CFArrayGetTypeID, CFArrayGetValueAtIndex};
use core_foundation::base::{CFGetTypeID, CFHash, CFType, CFTypeRef, TCFType};
use core_foundation::boolean::CFBoolean;
use core_foundation::dictionary::CFDictionary;
use core_foundation::number::CFNumber;
use core_foundation::string::CFString;
use core_graphics::display::{CGPoint, CGSize};
use core_graphics::event::{
    CGEvent, CGEventFlags, CGEventTapLocation, CGEventType, CGKeyCode, CGMouseButton, EventField,
    ScrollEventUnit,
};
use core_graphics::event_source::{CGEventSource, CGEventSourceStateID};
use image::{DynamicImage, ImageFormat};
use std::fmt;
use std::io::Cursor;
use std::os::raw::c_void;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

#[link(name = "ApplicationServices", kind = "framework")]
unsafe extern "C" {
    fn AXUIElementSetAttributeValue(element: *mut c_void, attribute: *const c_void, value: *const c_void) -> i32;
    fn AXUIElementCopyParameterizedAttributeValue(
        element: *mut c_void,
        attribute: *const c_void,
        parameter: *const c_void,
        result: *mut CFTypeRef,
    ) -> i32;
    fn AXUIElementSetMessagingTimeout(element: *mut c_void, seconds: f32) -> i32;
    fn AXUIElementGetPid(element: *mut c_void, pid: *mut i32) -> i32;
    fn AXValueGetValue(value: *const c_void, type_: u32, out: *mut c_void) -> i32;
}

const K_AXVALUE_CGPOINT_TYPE: u32 = 1;
const K_AXVALUE_CGSIZE_TYPE: u32 = 2;

const AX_ERROR_ATTRIBUTE_UNSUPPORTED: i32 = -25205;
const AX_ERROR_NO_VALUE: i32 = -25212;
const AX_ERROR_PARAMETERIZED_ATTRIBUTE_UNSUPPORTED: i32 = -25213;

const KEY_RETURN: u16 = 36;
const KEY_TAB: u16 = 48;
const KEY_SPACE: u16 = 49;
const KEY_DELETE: u16 = 51;
const KEY_ESCAPE: u16 = 53;
const KEY_FORWARD_DELETE: u16 = 117;
const KEY_HOME: u16 = 115;
const KEY_END: u16 = 119;
const KEY_PAGE_UP: u16 = 116;
const KEY_PAGE_DOWN: u16 = 121;
const KEY_ARROW_LEFT: u16 = 123;
const KEY_ARROW_RIGHT: u16 = 124;
const KEY_ARROW_DOWN: u16 = 125;
const KEY_ARROW_UP: u16 = 126;

// Left-hand modifier keys, released by `reset_modifiers`
const MODIFIER_KEYS: [u16; 5] = [55, 56, 58, 59, 63];

// Longest string a single keyboard event carries
const TYPE_CHUNK_UTF16: usize = 20;

/// Thread-safe wrapper for AXUIElement
#[derive(Clone)]
pub struct ThreadSafeAXUIElement(Arc<AXUIElement>);

// SAFETY: the accessibility API may be called from any thread and the Core
// Foundation objects behind AXUIElement are reference counted atomically.
unsafe impl Send for ThreadSafeAXUIElement {}
unsafe impl Sync for ThreadSafeAXUIElement {}

impl ThreadSafeAXUIElement {
    pub fn new(element: AXUIElement) -> Self {
        Self(Arc::new(element))
    }

    pub fn application(pid: i32) -> Self {
        Self(Arc::new(AXUIElement::application(pid)))
    }

    fn as_ptr(&self) -> *mut c_void {
        self.0.as_concrete_TypeRef() as *mut c_void
    }

    fn raw_attribute(&self, name: &str) -> Option<CFType> {
        self.0.attribute(&AXAttribute::new(&CFString::new(name))).ok()
    }

    fn string_attribute(&self, name: &str) -> Option<String> {
        self.raw_attribute(name)
            .and_then(|value| value.downcast_into::<CFString>())
            .map(|s| s.to_string())
    }

    fn bool_attribute(&self, name: &str) -> Option<bool> {
        self.raw_attribute(name)
            .and_then(|value| value.downcast_into::<CFBoolean>())
            .map(bool::from)
    }

    fn element_attribute(&self, name: &str) -> Option<ThreadSafeAXUIElement> {
        self.raw_attribute(name)
            .and_then(|value| value.downcast::<AXUIElement>())
            .map(ThreadSafeAXUIElement::new)
    }

    fn set_attribute(&self, name: &str, value: &CFType) -> Result<(), i32> {
        let attr = CFString::new(name);
        let code = unsafe {
            AXUIElementSetAttributeValue(
                self.as_ptr(),
                attr.as_concrete_TypeRef() as *const c_void,
                value.as_CFTypeRef() as *const c_void,
            )
        };
        if code == 0 { Ok(()) } else { Err(code) }
    }
}

impl fmt::Debug for ThreadSafeAXUIElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ThreadSafeAXUIElement")
            .field(&"<AXUIElement>")
            .finish()
    }
}

fn platform_error(what: &str, code: impl fmt::Display) -> AutomationError {
    AutomationError::PlatformError(format!("{what}: {code}"))
}

/// Wrap the elements of a CFArray of AXUIElements.
///
/// # Safety
/// `value` must be a live CFTypeRef.
unsafe fn elements_in_array(value: CFTypeRef) -> Vec<ThreadSafeAXUIElement> {
    if unsafe { CFGetTypeID(value) } != unsafe { CFArrayGetTypeID() } {
        return Vec::new();
    }
    let array = value as *const __CFArray;
    let count = unsafe { CFArrayGetCount(array) };
    (0..count)
        .filter_map(|i| {
            let item = unsafe { CFArrayGetValueAtIndex(array, i) };
            (!item.is_null()).then(|| {
                ThreadSafeAXUIElement::new(unsafe { AXUIElement::wrap_under_get_rule(item as *mut _) })
            })
        })
        .collect()
}

pub struct MacOSUIElement {
    element: ThreadSafeAXUIElement,
}

impl fmt::Debug for MacOSUIElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Formatting never messages the target process.
        f.debug_struct("MacOSUIElement")
            .field("hash", &format_args!("{:#x}", self.object_id()))
            .finish()
    }
}

impl MacOSUIElement {
    fn new(element: ThreadSafeAXUIElement) -> Self {
        Self { element }
    }

    fn point_attribute(&self) -> Option<CGPoint> {
        let position = self.element.raw_attribute("AXPosition")?;
        let mut point = CGPoint { x: 0.0, y: 0.0 };
        let ok = unsafe {
            AXValueGetValue(
                position.as_CFTypeRef() as *const c_void,
                K_AXVALUE_CGPOINT_TYPE,
                &mut point as *mut CGPoint as *mut c_void,
            )
        };
        (ok != 0).then_some(point)
    }

    fn size_attribute(&self) -> Option<CGSize> {
        let size = self.element.raw_attribute("AXSize")?;
        let mut cg_size = CGSize {
            width: 0.0,
            height: 0.0,
        };
        let ok = unsafe {
            AXValueGetValue(
                size.as_CFTypeRef() as *const c_void,
                K_AXVALUE_CGSIZE_TYPE,
                &mut cg_size as *mut CGSize as *mut c_void,
            )
        };
        (ok != 0).then_some(cg_size)
    }
}

impl UIElementImpl for MacOSUIElement {
    fn object_id(&self) -> usize {
        // Equal AX elements hash equal even through distinct references.
        unsafe { CFHash(self.element.0.as_CFTypeRef()) as usize }
    }

    fn attributes(&self) -> Result<UIElementAttributes, AutomationError> {
        let role = self
            .element
            .string_attribute("AXRole")
            .ok_or_else(|| AutomationError::ElementNotFound("element no longer exists".to_string()))?;
        let label = self
            .element
            .element_attribute("AXTitleUIElement")
            .and_then(|title| title.string_attribute("AXValue").or_else(|| title.string_attribute("AXTitle")));

        Ok(UIElementAttributes {
            role,
            name: self.element.string_attribute("AXTitle"),
            label,
            value: self.value()?,
            description: self.element.string_attribute("AXDescription"),
            identifier: self.element.string_attribute("AXIdentifier"),
            enabled: self.element.bool_attribute("AXEnabled"),
        })
    }

    fn children(&self) -> Result<Vec<Arc<dyn UIElementImpl>>, AutomationError> {
        match self.element.0.children() {
            Ok(children) => Ok(children
                .iter()
                .map(|child| {
                    Arc::new(MacOSUIElement::new(ThreadSafeAXUIElement::new(child.clone())))
                        as Arc<dyn UIElementImpl>
                })
                .collect()),
            // Leaves report "no value" rather than an empty array
            Err(accessibility::Error::Ax(AX_ERROR_NO_VALUE)) => Ok(Vec::new()),
            Err(e) => Err(platform_error("Failed to get children", e)),
        }
    }

    fn bounds(&self) -> Result<Rect, AutomationError> {
        let point = self.point_attribute().unwrap_or(CGPoint { x: 0.0, y: 0.0 });
        let size = self.size_attribute().unwrap_or(CGSize {
            width: 0.0,
            height: 0.0,
        });
        Ok(Rect::new(point.x, point.y, size.width, size.height))
    }

    fn process_id(&self) -> Result<i32, AutomationError> {
        let mut pid: i32 = 0;
        let code = unsafe { AXUIElementGetPid(self.element.as_ptr(), &mut pid) };
        if code == 0 {
            Ok(pid)
        } else {
            Err(platform_error("Failed to get element pid", code))
        }
    }

    fn actions(&self) -> Result<Vec<String>, AutomationError> {
        match self.element.0.action_names() {
            Ok(names) => Ok(names.iter().map(|name| name.to_string()).collect()),
            Err(accessibility::Error::Ax(AX_ERROR_NO_VALUE)) => Ok(Vec::new()),
            Err(e) => Err(platform_error("Failed to list actions", e)),
        }
    }

    fn perform_action(&self, action: &str) -> Result<(), AutomationError> {
        let action_attr = AXAttribute::new(&CFString::new(action));
        self.element
            .0
            .perform_action(&action_attr.as_CFString())
            .map_err(|e| platform_error(&format!("Failed to perform action {action}"), e))
    }

    fn value(&self) -> Result<Option<String>, AutomationError> {
        let Some(value) = self.element.raw_attribute("AXValue") else {
            return Ok(None);
        };
        if let Some(text) = value.downcast::<CFString>() {
            return Ok(Some(text.to_string()));
        }
        Ok(value
            .downcast::<CFNumber>()
            .and_then(|n| n.to_f64())
            .map(|n| n.to_string()))
    }

    fn set_value(&self, value: &str) -> Result<(), AutomationError> {
        let text = CFString::new(value);
        self.element
            .set_attribute("AXValue", &text.as_CFType())
            .map_err(|code| platform_error("Failed to set value", code))
    }

    fn focus(&self) -> Result<(), AutomationError> {
        self.element
            .set_attribute("AXFocused", &CFBoolean::true_value().as_CFType())
            .map_err(|code| platform_error("Failed to focus element", code))
    }

    fn is_enabled(&self) -> Result<bool, AutomationError> {
        // Elements without AXEnabled (static text, groups) are never disabled.
        Ok(self.element.bool_attribute("AXEnabled").unwrap_or(true))
    }

    fn scroll(&self, direction: ScrollDirection, pages: u32) -> Result<(), AutomationError> {
        let action = match direction {
            ScrollDirection::Up => "AXScrollUpByPage",
            ScrollDirection::Down => "AXScrollDownByPage",
            ScrollDirection::Left => "AXScrollLeftByPage",
            ScrollDirection::Right => "AXScrollRightByPage",
        };
        if !self.actions()?.iter().any(|a| a == action) {
            return Err(AutomationError::UnsupportedOperation(format!(
                "element does not advertise {action}"
            )));
        }
        for _ in 0..pages {
            self.perform_action(action)?;
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

/// Running applications as seen by NSWorkspace
fn running_applications() -> Vec<ProcessInfo> {
    let mut found = Vec::new();
    unsafe {
        use objc::{class, msg_send, sel, sel_impl};

        let workspace_class = class!(NSWorkspace);
        let shared_workspace: *mut objc::runtime::Object = msg_send![workspace_class, sharedWorkspace];
        let apps: *mut objc::runtime::Object = msg_send![shared_workspace, runningApplications];
        let count: usize = msg_send![apps, count];
        for i in 0..count {
            let app: *mut objc::runtime::Object = msg_send![apps, objectAtIndex: i];
            if let Some(info) = process_info(app) {
                found.push(info);
            }
        }
    }
    found
}

/// # Safety
/// `app` must be null or an NSRunningApplication.
unsafe fn process_info(app: *mut objc::runtime::Object) -> Option<ProcessInfo> {
    use objc::{msg_send, sel, sel_impl};

    if app.is_null() {
        return None;
    }
    let name: *mut objc::runtime::Object = unsafe { msg_send![app, localizedName] };
    let bundle: *mut objc::runtime::Object = unsafe { msg_send![app, bundleIdentifier] };
    let pid: i32 = unsafe { msg_send![app, processIdentifier] };
    Some(ProcessInfo {
        pid,
        name: unsafe { nsstring_to_string(name) }?,
        bundle_id: unsafe { nsstring_to_string(bundle) },
    })
}

/// # Safety
/// `nsstring` must be null or an NSString.
unsafe fn nsstring_to_string(nsstring: *mut objc::runtime::Object) -> Option<String> {
    use objc::{msg_send, sel, sel_impl};

    if nsstring.is_null() {
        return None;
    }
    let bytes: *const std::os::raw::c_char = unsafe { msg_send![nsstring, UTF8String] };
    let len: usize = unsafe { msg_send![nsstring, lengthOfBytesUsingEncoding: 4] }; // NSUTF8StringEncoding = 4
    if bytes.is_null() {
        return None;
    }
    let slice = unsafe { std::slice::from_raw_parts(bytes as *const u8, len) };
    Some(String::from_utf8_lossy(slice).into_owned())
}

fn key_code(key: &Key) -> Result<u16, AutomationError> {
    let code = match key {
        Key::Named(named) => match named {
            NamedKey::Return => KEY_RETURN,
            NamedKey::Tab => KEY_TAB,
            NamedKey::Space => KEY_SPACE,
            NamedKey::Delete => KEY_DELETE,
            NamedKey::ForwardDelete => KEY_FORWARD_DELETE,
            NamedKey::Escape => KEY_ESCAPE,
            NamedKey::Left => KEY_ARROW_LEFT,
            NamedKey::Right => KEY_ARROW_RIGHT,
            NamedKey::Up => KEY_ARROW_UP,
            NamedKey::Down => KEY_ARROW_DOWN,
            NamedKey::Home => KEY_HOME,
            NamedKey::End => KEY_END,
            NamedKey::PageUp => KEY_PAGE_UP,
            NamedKey::PageDown => KEY_PAGE_DOWN,
        },
        Key::Function(n) => {
            const FUNCTION_KEYS: [u16; 20] = [
                122, 120, 99, 118, 96, 97, 98, 100, 101, 109, 103, 111, 105, 107, 113, 106, 64, 79, 80,
                90,
            ];
            FUNCTION_KEYS[(*n as usize).saturating_sub(1).min(19)]
        }
        // ANSI layout
        Key::Char(c) => match c {
            'a' => 0, 's' => 1, 'd' => 2, 'f' => 3, 'h' => 4, 'g' => 5, 'z' => 6, 'x' => 7,
            'c' => 8, 'v' => 9, 'b' => 11, 'q' => 12, 'w' => 13, 'e' => 14, 'r' => 15,
            'y' => 16, 't' => 17, '1' => 18, '2' => 19, '3' => 20, '4' => 21, '6' => 22,
            '5' => 23, '=' => 24, '9' => 25, '7' => 26, '-' => 27, '8' => 28, '0' => 29,
            ']' => 30, 'o' => 31, 'u' => 32, '[' => 33, 'i' => 34, 'p' => 35, 'l' => 37,
            'j' => 38, '\'' => 39, 'k' => 40, ';' => 41, '\\' => 42, ',' => 43, '/' => 44,
            'n' => 45, 'm' => 46, '.' => 47, '`' => 50, ' ' => KEY_SPACE,
            other => {
                return Err(AutomationError::InvalidArgument(format!(
                    "No key code for '{other}' on this keyboard layout"
                )));
            }
        },
    };
    Ok(code)
}

fn modifier_flags(modifiers: &[Modifier]) -> CGEventFlags {
    let mut flags = CGEventFlags::empty();
    for modifier in modifiers {
        flags.insert(match modifier {
            Modifier::Command => CGEventFlags::CGEventFlagCommand,
            Modifier::Shift => CGEventFlags::CGEventFlagShift,
            Modifier::Option => CGEventFlags::CGEventFlagAlternate,
            Modifier::Control => CGEventFlags::CGEventFlagControl,
            Modifier::Function => CGEventFlags::CGEventFlagSecondaryFn,
        });
    }
    flags
}

/// Split text so no chunk exceeds what one keyboard event can carry.
fn utf16_chunks(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut units = 0;
    for c in text.chars() {
        if units + c.len_utf16() > TYPE_CHUNK_UTF16 {
            chunks.push(std::mem::take(&mut current));
            units = 0;
        }
        units += c.len_utf16();
        current.push(c);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

struct SearchPredicate(CFDictionary<CFString, CFType>);

// SAFETY: the dictionary is immutable once built and only read by the worker.
unsafe impl Send for SearchPredicate {}

pub struct MacOSEngine {
    guard: Arc<ForeignCallGuard>,
}

impl MacOSEngine {
    pub fn new(element_timeout: Duration) -> Result<Self, AutomationError> {
        let accessibility_enabled = unsafe {
            use core_foundation::dictionary::CFDictionaryRef;

            #[link(name = "ApplicationServices", kind = "framework")]
            unsafe extern "C" {
                fn AXIsProcessTrustedWithOptions(options: CFDictionaryRef) -> bool;
            }

            let check_attr = CFString::new("AXTrustedCheckOptionPrompt");
            let options = CFDictionary::from_CFType_pairs(&[(
                check_attr.as_CFType(),
                CFBoolean::true_value().as_CFType(),
            )]);
            AXIsProcessTrustedWithOptions(options.as_concrete_TypeRef())
        };

        if !accessibility_enabled {
            return Err(AutomationError::PermissionDenied(
                "Accessibility permissions not granted".to_string(),
            ));
        }

        // The framework's own per-message timeout stays just under the guard's.
        let system_wide = AXUIElement::system_wide();
        let seconds = element_timeout.as_secs_f32().max(0.5);
        unsafe {
            AXUIElementSetMessagingTimeout(system_wide.as_concrete_TypeRef() as *mut c_void, seconds * 0.9);
        }

        Ok(Self {
            guard: Arc::new(ForeignCallGuard::new(element_timeout)),
        })
    }

    fn wrap(&self, element: ThreadSafeAXUIElement) -> UIElement {
        UIElement::new(Arc::new(MacOSUIElement::new(element)), self.guard.clone())
    }

    fn event_source() -> Result<CGEventSource, AutomationError> {
        CGEventSource::new(CGEventSourceStateID::HIDSystemState)
            .map_err(|_| AutomationError::PlatformError("Failed to create event source".to_string()))
    }

    fn post_key(source: &CGEventSource, code: u16, down: bool, flags: CGEventFlags) -> Result<(), AutomationError> {
        let event = CGEvent::new_keyboard_event(source.clone(), code as CGKeyCode, down)
            .map_err(|_| AutomationError::PlatformError("Failed to create key event".to_string()))?;
        event.set_flags(flags);
        event.post(CGEventTapLocation::HID);
        Ok(())
    }

    fn post_mouse(
        source: &CGEventSource,
        kind: CGEventType,
        point: CGPoint,
        button: CGMouseButton,
        click_state: i64,
    ) -> Result<(), AutomationError> {
        let event = CGEvent::new_mouse_event(source.clone(), kind, point, button)
            .map_err(|_| AutomationError::PlatformError("Failed to create mouse event".to_string()))?;
        if click_state > 0 {
            event.set_integer_value_field(EventField::MOUSE_EVENT_CLICK_STATE, click_state);
        }
        event.post(CGEventTapLocation::HID);
        Ok(())
    }

    fn search_predicate(locator: &Locator) -> CFDictionary<CFString, CFType> {
        let mut pairs = vec![
            (CFString::new("AXSearchKey"), CFString::new("AXAnyTypeSearchKey").as_CFType()),
            (CFString::new("AXResultsLimit"), CFNumber::from(-1).as_CFType()),
            (CFString::new("AXDirection"), CFString::new("AXDirectionNext").as_CFType()),
            (CFString::new("AXImmediateDescendantsOnly"), CFBoolean::false_value().as_CFType()),
        ];
        if let Some(text) = locator.query_text() {
            pairs.push((CFString::new("AXSearchText"), CFString::new(text).as_CFType()));
        }
        CFDictionary::from_CFType_pairs(&pairs)
    }
}

#[async_trait::async_trait]
impl AccessibilityEngine for MacOSEngine {
    fn process_by_name(&self, name: &str) -> Result<ProcessInfo, AutomationError> {
        let wanted = utils::normalize(name);
        running_applications()
            .into_iter()
            .find(|app| utils::normalize(&app.name) == wanted)
            .ok_or_else(|| AutomationError::ElementNotFound(format!("application '{name}' is not running")))
    }

    fn frontmost_process(&self) -> Result<Option<ProcessInfo>, AutomationError> {
        unsafe {
            use objc::{class, msg_send, sel, sel_impl};

            let workspace_class = class!(NSWorkspace);
            let shared_workspace: *mut objc::runtime::Object = msg_send![workspace_class, sharedWorkspace];
            let app: *mut objc::runtime::Object = msg_send![shared_workspace, frontmostApplication];
            Ok(process_info(app))
        }
    }

    fn application(&self, pid: i32) -> Result<UIElement, AutomationError> {
        Ok(self.wrap(ThreadSafeAXUIElement::application(pid)))
    }

    #[instrument(level = "debug", skip(self))]
    fn window(&self, pid: i32, title: Option<&str>) -> Result<Option<UIElement>, AutomationError> {
        let wanted = title.map(utils::normalize);
        let window = self.guard.call("list windows", move || {
            let app = ThreadSafeAXUIElement::application(pid);
            let windows: Vec<ThreadSafeAXUIElement> = match app.0.windows() {
                Ok(windows) => windows.iter().map(|w| ThreadSafeAXUIElement::new(w.clone())).collect(),
                Err(accessibility::Error::Ax(AX_ERROR_NO_VALUE)) => Vec::new(),
                Err(e) => return Err(platform_error("Failed to list windows", e)),
            };
            let titled = wanted.as_deref().and_then(|wanted| {
                windows.iter().find(|w| {
                    w.string_attribute("AXTitle")
                        .is_some_and(|t| utils::normalize(&t).contains(wanted))
                })
            });
            Ok(titled.or(windows.first()).cloned())
        })?;
        Ok(window.map(|w| self.wrap(w)))
    }

    fn focused_element(&self, pid: i32) -> Result<Option<UIElement>, AutomationError> {
        let focused = self.guard.call("read focused element", move || {
            Ok(ThreadSafeAXUIElement::application(pid).element_attribute("AXFocusedUIElement"))
        })?;
        Ok(focused.map(|e| self.wrap(e)))
    }

    /// Uses `AXUIElementsForSearchPredicate`, which web areas and some native
    /// containers answer. Roots that do not support it return `None`.
    #[instrument(level = "debug", skip(self, root), fields(locator = %locator.describe()))]
    fn native_search(
        &self,
        root: &UIElement,
        locator: &Locator,
    ) -> Result<Option<Vec<UIElement>>, AutomationError> {
        if locator.query_text().is_none() && locator.role_filter().is_none() {
            return Ok(None);
        }
        let Some(root) = root.as_any().downcast_ref::<MacOSUIElement>() else {
            return Ok(None);
        };
        let root = root.element.clone();
        let predicate = SearchPredicate(Self::search_predicate(locator));
        let role = locator.role_filter().map(str::to_string);

        let hits = self.guard.call("native search", move || {
            let attr = CFString::new("AXUIElementsForSearchPredicate");
            let mut result: CFTypeRef = std::ptr::null();
            let code = unsafe {
                AXUIElementCopyParameterizedAttributeValue(
                    root.as_ptr(),
                    attr.as_concrete_TypeRef() as *const c_void,
                    predicate.0.as_CFTypeRef() as *const c_void,
                    &mut result,
                )
            };
            match code {
                0 if !result.is_null() => {
                    let owned = unsafe { CFType::wrap_under_create_rule(result) };
                    let hits = unsafe { elements_in_array(owned.as_CFTypeRef()) };
                    // Role reads message the target too, so they stay on the guarded worker.
                    Ok(Some(match &role {
                        Some(filter) => hits
                            .into_iter()
                            .filter(|hit| {
                                hit.string_attribute("AXRole")
                                    .is_some_and(|actual| roles::role_matches(filter, &actual))
                            })
                            .collect(),
                        None => hits,
                    }))
                }
                0 => Ok(Some(Vec::new())),
                AX_ERROR_ATTRIBUTE_UNSUPPORTED | AX_ERROR_PARAMETERIZED_ATTRIBUTE_UNSUPPORTED | AX_ERROR_NO_VALUE => {
                    Ok(None)
                }
                other => Err(platform_error("Search predicate failed", other)),
            }
        });

        let Some(hits) = hits? else {
            debug!("root does not answer search predicates");
            return Ok(None);
        };
        let elements = hits.into_iter().map(|hit| self.wrap(hit)).collect::<Vec<_>>();
        debug!(hits = elements.len(), "native search finished");
        Ok(Some(elements))
    }

    fn activate(&self, pid: i32) -> Result<(), AutomationError> {
        unsafe {
            use objc::{class, msg_send, sel, sel_impl};

            let nsra_class = class!(NSRunningApplication);
            let app: *mut objc::runtime::Object =
                msg_send![nsra_class, runningApplicationWithProcessIdentifier: pid];
            if app.is_null() {
                return Err(AutomationError::ElementNotFound(format!("no running application with pid {pid}")));
            }
            let _: bool = msg_send![app, activateWithOptions: 1]; // NSApplicationActivateIgnoringOtherApps = 1
        }
        Ok(())
    }

    fn raise_window(&self, window: &UIElement) -> Result<(), AutomationError> {
        window.perform_action("AXRaise")
    }

    fn displays(&self) -> Result<Vec<DisplayInfo>, AutomationError> {
        let monitors = xcap::Monitor::all()
            .map_err(|e| platform_error("Failed to get monitors", e))?;
        monitors
            .iter()
            .map(|monitor| {
                let read = |e: xcap::XCapError| platform_error("Failed to read monitor", e);
                Ok(DisplayInfo {
                    id: monitor.id().map_err(read)?,
                    frame: Rect::new(
                        monitor.x().map_err(read)? as f64,
                        monitor.y().map_err(read)? as f64,
                        monitor.width().map_err(read)? as f64,
                        monitor.height().map_err(read)? as f64,
                    ),
                    scale_factor: monitor.scale_factor().map_err(read)? as f64,
                    is_primary: monitor.is_primary().map_err(read)?,
                })
            })
            .collect()
    }

    #[instrument(level = "debug", skip(self))]
    async fn capture_window(
        &self,
        pid: i32,
        window_title: Option<&str>,
    ) -> Result<CaptureResult, AutomationError> {
        let windows = xcap::Window::all().map_err(|e| platform_error("Failed to list windows", e))?;
        let wanted = window_title.map(utils::normalize);
        let mut owned: Vec<xcap::Window> = windows
            .into_iter()
            .filter(|w| w.pid().is_ok_and(|p| p as i32 == pid) && !w.is_minimized().unwrap_or(false))
            .collect();
        let index = wanted
            .as_deref()
            .and_then(|wanted| {
                owned
                    .iter()
                    .position(|w| w.title().is_ok_and(|t| utils::normalize(&t).contains(wanted)))
            })
            .unwrap_or(0);
        if owned.is_empty() {
            return Err(AutomationError::ElementNotFound(format!("process {pid} has no capturable window")));
        }
        let window = owned.swap_remove(index);

        let read = |e: xcap::XCapError| platform_error("Failed to read window geometry", e);
        let window_frame = Rect::new(
            window.x().map_err(read)? as f64,
            window.y().map_err(read)? as f64,
            window.width().map_err(read)? as f64,
            window.height().map_err(read)? as f64,
        );
        let image = window
            .capture_image()
            .map_err(|e| platform_error("Failed to capture window", e))?;
        let (width, height) = (image.width(), image.height());

        let mut png = Vec::new();
        DynamicImage::ImageRgba8(image)
            .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
            .map_err(|e| platform_error("Failed to encode capture", e))?;

        let displays = self.displays()?;
        let center = window_frame.center();
        let display_frame = displays
            .iter()
            .find(|d| d.frame.contains(center))
            .or_else(|| displays.iter().find(|d| d.is_primary))
            .map(|d| d.frame)
            .unwrap_or(window_frame);

        debug!(width, height, ?window_frame, "captured window");
        Ok(CaptureResult {
            png,
            width,
            height,
            window_frame,
            display_frame,
        })
    }

    fn mouse_click(&self, point: Point, button: MouseButton, count: u32) -> Result<(), AutomationError> {
        let source = Self::event_source()?;
        let location = CGPoint::new(point.x, point.y);
        let (down, up, cg_button) = match button {
            MouseButton::Left => (CGEventType::LeftMouseDown, CGEventType::LeftMouseUp, CGMouseButton::Left),
            MouseButton::Right => (CGEventType::RightMouseDown, CGEventType::RightMouseUp, CGMouseButton::Right),
            MouseButton::Middle => (CGEventType::OtherMouseDown, CGEventType::OtherMouseUp, CGMouseButton::Center),
        };

        Self::post_mouse(&source, CGEventType::MouseMoved, location, cg_button, 0)?;
        std::thread::sleep(Duration::from_millis(50));
        for click in 1..=count.max(1) as i64 {
            Self::post_mouse(&source, down, location, cg_button, click)?;
            std::thread::sleep(Duration::from_millis(30));
            Self::post_mouse(&source, up, location, cg_button, click)?;
        }
        debug!(x = point.x, y = point.y, ?button, count, "posted mouse click");
        Ok(())
    }

    fn key_press(&self, combo: &KeyCombo) -> Result<(), AutomationError> {
        let code = key_code(&combo.key)?;
        let flags = modifier_flags(&combo.modifiers);
        let source = Self::event_source()?;
        Self::post_key(&source, code, true, flags)?;
        std::thread::sleep(Duration::from_millis(50));
        Self::post_key(&source, code, false, flags)?;
        debug!(%combo, "posted key press");
        Ok(())
    }

    fn type_text(&self, text: &str) -> Result<(), AutomationError> {
        let source = Self::event_source()?;
        for chunk in utf16_chunks(text) {
            for down in [true, false] {
                let event = CGEvent::new_keyboard_event(source.clone(), 0, down)
                    .map_err(|_| AutomationError::PlatformError("Failed to create key event".to_string()))?;
                event.set_flags(CGEventFlags::CGEventFlagNull);
                event.set_string(&chunk);
                event.post(CGEventTapLocation::HID);
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        Ok(())
    }

    fn scroll_wheel(&self, point: Point, dx: i32, dy: i32) -> Result<(), AutomationError> {
        let source = Self::event_source()?;
        Self::post_mouse(
            &source,
            CGEventType::MouseMoved,
            CGPoint::new(point.x, point.y),
            CGMouseButton::Left,
            0,
        )?;
        let event = CGEvent::new_scroll_event(source, ScrollEventUnit::LINE, 2, dy, dx, 0)
            .map_err(|_| AutomationError::PlatformError("Failed to create scroll event".to_string()))?;
        event.post(CGEventTapLocation::HID);
        Ok(())
    }

    fn reset_modifiers(&self) -> Result<(), AutomationError> {
        let source = Self::event_source()?;
        for code in MODIFIER_KEYS {
            if let Err(e) = Self::post_key(&source, code, false, CGEventFlags::CGEventFlagNull) {
                warn!(code, error = %e, "failed to release modifier");
            }
        }
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunks_respect_utf16_width() {
        let text = "a".repeat(45);
        let chunks = utf16_chunks(&text);
        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![20, 20, 5]);

        // Astral characters take two units and are never split.
        let emoji = "😀".repeat(11);
        let chunks = utf16_chunks(&emoji);
        assert_eq!(chunks[0].chars().count(), 10);
        assert_eq!(chunks[1].chars().count(), 1);
    }

    #[test]
    fn key_codes_cover_named_and_function_keys() {
        assert_eq!(key_code(&Key::Named(NamedKey::Return)).unwrap(), KEY_RETURN);
        assert_eq!(key_code(&Key::Function(5)).unwrap(), 96);
        assert_eq!(key_code(&Key::Char('n')).unwrap(), 45);
        assert!(key_code(&Key::Char('é')).is_err());
    }

    #[test]
    fn debug_output_needs_no_attribute_reads() {
        // No process has this pid, so any attribute read would fail or stall.
        let element = MacOSUIElement::new(ThreadSafeAXUIElement::application(i32::MAX));
        let printed = format!("{element:?}");
        assert!(printed.starts_with("MacOSUIElement { hash: 0x"));
        assert!(!printed.contains("role"));
    }

    #[test]
    fn modifiers_become_event_flags() {
        let flags = modifier_flags(&[Modifier::Command, Modifier::Shift]);
        assert!(flags.contains(CGEventFlags::CGEventFlagCommand));
        assert!(flags.contains(CGEventFlags::CGEventFlagShift));
        assert!(!flags.contains(CGEventFlags::CGEventFlagControl));
    }
}
