//! Key and key-combination model.
//!
//! Combinations are written the way people type them in chat: `cmd+shift+t`,
//! `ctrl+a`, `return`, `f5`. Parsing is platform-neutral; engines translate a
//! [`KeyCombo`] into their own key codes.

use crate::errors::AutomationError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modifier {
    Command,
    Shift,
    Option,
    Control,
    Function,
}

impl Modifier {
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "cmd" | "command" | "meta" | "super" => Some(Modifier::Command),
            "shift" => Some(Modifier::Shift),
            "alt" | "option" | "opt" => Some(Modifier::Option),
            "ctrl" | "control" => Some(Modifier::Control),
            "fn" => Some(Modifier::Function),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Modifier::Command => "cmd",
            Modifier::Shift => "shift",
            Modifier::Option => "alt",
            Modifier::Control => "ctrl",
            Modifier::Function => "fn",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NamedKey {
    Return,
    Tab,
    Space,
    Delete,
    ForwardDelete,
    Escape,
    Left,
    Right,
    Up,
    Down,
    Home,
    End,
    PageUp,
    PageDown,
}

impl NamedKey {
    fn parse(name: &str) -> Option<Self> {
        let key = match name {
            "return" | "enter" => NamedKey::Return,
            "tab" => NamedKey::Tab,
            "space" => NamedKey::Space,
            "delete" | "backspace" => NamedKey::Delete,
            "forwarddelete" | "del" => NamedKey::ForwardDelete,
            "esc" | "escape" => NamedKey::Escape,
            "left" | "arrowleft" => NamedKey::Left,
            "right" | "arrowright" => NamedKey::Right,
            "up" | "arrowup" => NamedKey::Up,
            "down" | "arrowdown" => NamedKey::Down,
            "home" => NamedKey::Home,
            "end" => NamedKey::End,
            "pageup" => NamedKey::PageUp,
            "pagedown" => NamedKey::PageDown,
            _ => return None,
        };
        Some(key)
    }

    fn as_str(&self) -> &'static str {
        match self {
            NamedKey::Return => "return",
            NamedKey::Tab => "tab",
            NamedKey::Space => "space",
            NamedKey::Delete => "delete",
            NamedKey::ForwardDelete => "forwarddelete",
            NamedKey::Escape => "escape",
            NamedKey::Left => "left",
            NamedKey::Right => "right",
            NamedKey::Up => "up",
            NamedKey::Down => "down",
            NamedKey::Home => "home",
            NamedKey::End => "end",
            NamedKey::PageUp => "pageup",
            NamedKey::PageDown => "pagedown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Key {
    Named(NamedKey),
    /// F1 to F20
    Function(u8),
    /// A printable character, lowercased for letters
    Char(char),
}

impl Key {
    pub fn parse(name: &str) -> Result<Self, AutomationError> {
        let lowered = name.trim().to_lowercase();
        if let Some(named) = NamedKey::parse(lowered.replace(['_', '-'], "").as_str()) {
            return Ok(Key::Named(named));
        }
        if let Some(n) = lowered.strip_prefix('f').and_then(|n| n.parse::<u8>().ok()) {
            if (1..=20).contains(&n) {
                return Ok(Key::Function(n));
            }
        }
        let mut chars = lowered.chars();
        match (chars.next(), chars.next()) {
            (Some(c), None) if !c.is_control() => Ok(Key::Char(c)),
            _ => Err(AutomationError::InvalidArgument(format!("Unknown key: {name}"))),
        }
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Key::Named(named) => f.write_str(named.as_str()),
            Key::Function(n) => write!(f, "f{n}"),
            Key::Char(c) => write!(f, "{c}"),
        }
    }
}

/// A key with the modifiers held while it is pressed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct KeyCombo {
    pub modifiers: Vec<Modifier>,
    pub key: Key,
}

impl KeyCombo {
    pub fn new(key: Key) -> Self {
        Self {
            modifiers: Vec::new(),
            key,
        }
    }

    pub fn with_modifier(mut self, modifier: Modifier) -> Self {
        if !self.modifiers.contains(&modifier) {
            self.modifiers.push(modifier);
            self.modifiers.sort();
        }
        self
    }

    /// Key plus an explicit modifier list, as the press operation receives them.
    pub fn from_parts(key: &str, modifiers: &[String]) -> Result<Self, AutomationError> {
        let mut combo = KeyCombo::new(Key::parse(key)?);
        for name in modifiers {
            let modifier = Modifier::parse(name).ok_or_else(|| {
                AutomationError::InvalidArgument(format!("Unknown modifier: {name}"))
            })?;
            combo = combo.with_modifier(modifier);
        }
        Ok(combo)
    }

    /// A combination given as separate keys, e.g. `["cmd", "shift", "t"]`.
    pub fn from_keys(keys: &[String]) -> Result<Self, AutomationError> {
        match keys.split_last() {
            Some((key, modifiers)) => KeyCombo::from_parts(key, modifiers),
            None => Err(AutomationError::InvalidArgument(
                "Empty key combination".to_string(),
            )),
        }
    }

    pub fn has_modifiers(&self) -> bool {
        !self.modifiers.is_empty()
    }

    pub fn select_all() -> Self {
        KeyCombo::new(Key::Char('a')).with_modifier(Modifier::Command)
    }
}

impl FromStr for KeyCombo {
    type Err = AutomationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(AutomationError::InvalidArgument(
                "Empty key combination".to_string(),
            ));
        }
        // "cmd++" means cmd and the plus key
        let (body, plus_key) = match trimmed.strip_suffix("++") {
            Some(body) => (body, true),
            None if trimmed == "+" => ("", true),
            None => (trimmed, false),
        };
        let mut parts: Vec<String> = if body.is_empty() {
            Vec::new()
        } else {
            body.split('+').map(|p| p.trim().to_string()).collect()
        };
        if plus_key {
            parts.push("+".to_string());
        }
        if parts.iter().any(|p| p.is_empty()) {
            return Err(AutomationError::InvalidArgument(format!(
                "Malformed key combination: {s}"
            )));
        }
        KeyCombo::from_keys(&parts)
    }
}

impl fmt::Display for KeyCombo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for modifier in &self.modifiers {
            write!(f, "{}+", modifier.as_str())?;
        }
        write!(f, "{}", self.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_modifier_aliases_in_any_order() {
        let combo: KeyCombo = "Shift+Command+T".parse().unwrap();
        assert_eq!(combo.key, Key::Char('t'));
        assert_eq!(combo.modifiers, vec![Modifier::Command, Modifier::Shift]);
        assert_eq!(combo.to_string(), "cmd+shift+t");
        let alt: KeyCombo = "option+ctrl+left".parse().unwrap();
        assert_eq!(alt.key, Key::Named(NamedKey::Left));
        assert_eq!(alt.modifiers, vec![Modifier::Option, Modifier::Control]);
    }

    #[test]
    fn named_function_and_plus_keys() {
        assert_eq!("enter".parse::<KeyCombo>().unwrap().key, Key::Named(NamedKey::Return));
        assert_eq!("page_down".parse::<KeyCombo>().unwrap().key, Key::Named(NamedKey::PageDown));
        assert_eq!("F5".parse::<KeyCombo>().unwrap().key, Key::Function(5));
        let zoom: KeyCombo = "cmd++".parse().unwrap();
        assert_eq!(zoom.key, Key::Char('+'));
        assert!(zoom.has_modifiers());
    }

    #[test]
    fn rejects_unknown_keys_and_modifiers() {
        assert!("hyper+k".parse::<KeyCombo>().is_err());
        assert!("cmd+".parse::<KeyCombo>().is_err());
        assert!("f42".parse::<KeyCombo>().is_err());
        assert!("".parse::<KeyCombo>().is_err());
    }

    #[test]
    fn builds_from_separate_keys() {
        let keys = vec!["ctrl".to_string(), "shift".to_string(), "esc".to_string()];
        let combo = KeyCombo::from_keys(&keys).unwrap();
        assert_eq!(combo.key, Key::Named(NamedKey::Escape));
        assert_eq!(combo.modifiers, vec![Modifier::Shift, Modifier::Control]);
    }
}
