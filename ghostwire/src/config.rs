//! Runtime configuration.
//!
//! Loaded from an optional JSON file, then overridden by environment variables.
//! Every field has a default, so an empty file or no file at all is valid.

use crate::errors::AutomationError;
use crate::locator::DEFAULT_SEARCH_DEPTH;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

pub const CONFIG_PATH_ENV: &str = "GHOSTWIRE_CONFIG";
pub const VISION_URL_ENV: &str = "GHOSTWIRE_VISION_URL";
pub const VISION_PORT_ENV: &str = "GHOST_VISION_PORT";
pub const DEVTOOLS_PORTS_ENV: &str = "GHOSTWIRE_DEVTOOLS_PORTS";
pub const ELEMENT_TIMEOUT_ENV: &str = "GHOSTWIRE_ELEMENT_TIMEOUT_MS";

pub const DEFAULT_VISION_PORT: u16 = 9876;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub search: SearchConfig,
    pub timeouts: TimeoutConfig,
    pub focus: FocusConfig,
    pub vision: VisionConfig,
    pub structural: StructuralConfig,
    pub typing: TypingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// Semantic depth budget when the locator does not set one
    pub depth: usize,
    /// Absolute cap on tree depth regardless of tunnels
    pub max_raw_depth: usize,
    pub max_nodes: usize,
    /// Raw depth cap for structural-id lookup
    pub id_lookup_max_depth: usize,
    pub id_lookup_max_nodes: usize,
    pub min_score: i32,
    /// Candidates reported back to the caller on resolve
    pub max_candidates: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_SEARCH_DEPTH,
            max_raw_depth: 64,
            max_nodes: 5_000,
            id_lookup_max_depth: 256,
            id_lookup_max_nodes: 50_000,
            min_score: 50,
            max_candidates: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Per call into the target's accessibility tree
    pub element_ms: u64,
    pub capture_ms: u64,
    pub grounding_ms: u64,
    pub structural_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            element_ms: 3_000,
            capture_ms: 10_000,
            grounding_ms: 60_000,
            structural_ms: 5_000,
        }
    }
}

impl TimeoutConfig {
    pub fn element(&self) -> Duration {
        Duration::from_millis(self.element_ms)
    }

    pub fn capture(&self) -> Duration {
        Duration::from_millis(self.capture_ms)
    }

    pub fn grounding(&self) -> Duration {
        Duration::from_millis(self.grounding_ms)
    }

    pub fn structural(&self) -> Duration {
        Duration::from_millis(self.structural_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FocusConfig {
    pub poll_interval_ms: u64,
    pub confirm_window_ms: u64,
    /// Extra activate-and-poll rounds after the first
    pub retries: u32,
    /// Give focus back to the previous app after each action
    pub restore: bool,
}

impl Default for FocusConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 50,
            confirm_window_ms: 1_000,
            retries: 1,
            restore: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VisionConfig {
    pub enabled: bool,
    pub url: String,
    pub min_confidence: f64,
    /// Command that starts the sidecar when it is not running. Empty disables launch.
    pub launch_command: Vec<String>,
    pub idle_timeout_secs: u64,
    pub startup_wait_ms: u64,
}

impl Default for VisionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: format!("http://127.0.0.1:{DEFAULT_VISION_PORT}"),
            min_confidence: 0.5,
            launch_command: Vec::new(),
            idle_timeout_secs: 600,
            startup_wait_ms: 30_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StructuralConfig {
    pub enabled: bool,
    pub devtools_ports: Vec<u16>,
    pub max_matches: usize,
}

impl Default for StructuralConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            devtools_ports: vec![9222],
            max_matches: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TypingConfig {
    /// Characters of the typed text that must show up in the read-back
    pub verify_prefix_chars: usize,
    pub char_delay_ms: u64,
    /// Settle time between input and read-back
    pub settle_ms: u64,
}

impl Default for TypingConfig {
    fn default() -> Self {
        Self {
            verify_prefix_chars: 12,
            char_delay_ms: 8,
            settle_ms: 60,
        }
    }
}

impl Config {
    /// Loads `path` (or `$GHOSTWIRE_CONFIG`) and applies environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, AutomationError> {
        let env_path = std::env::var(CONFIG_PATH_ENV).ok();
        let path = path.or(env_path.as_deref().map(Path::new));
        let mut config = match path {
            Some(path) => {
                debug!(path = %path.display(), "loading config file");
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AutomationError::InvalidArgument(format!(
                        "cannot read config {}: {e}",
                        path.display()
                    ))
                })?;
                Self::from_json(&raw)?
            }
            None => Config::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_json(raw: &str) -> Result<Self, AutomationError> {
        serde_json::from_str(raw)
            .map_err(|e| AutomationError::InvalidArgument(format!("invalid config: {e}")))
    }

    /// Applies overrides from a key lookup (the process environment in production).
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(VISION_URL_ENV).filter(|u| !u.trim().is_empty()) {
            self.vision.url = url.trim().trim_end_matches('/').to_string();
        } else if let Some(port) = lookup(VISION_PORT_ENV) {
            match port.trim().parse::<u16>() {
                Ok(port) => self.vision.url = format!("http://127.0.0.1:{port}"),
                Err(_) => warn!(value = %port, "ignoring invalid {VISION_PORT_ENV}"),
            }
        }
        if let Some(ports) = lookup(DEVTOOLS_PORTS_ENV) {
            let parsed: Result<Vec<u16>, _> = ports
                .split(',')
                .map(str::trim)
                .filter(|p| !p.is_empty())
                .map(str::parse::<u16>)
                .collect();
            match parsed {
                Ok(ports) => self.structural.devtools_ports = ports,
                Err(_) => warn!(value = %ports, "ignoring invalid {DEVTOOLS_PORTS_ENV}"),
            }
        }
        if let Some(ms) = lookup(ELEMENT_TIMEOUT_ENV) {
            match ms.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.timeouts.element_ms = ms,
                _ => warn!(value = %ms, "ignoring invalid {ELEMENT_TIMEOUT_ENV}"),
            }
        }
    }

    /// The port the sidecar should listen on, taken from the configured URL.
    pub fn vision_port(&self) -> u16 {
        self.vision
            .url
            .rsplit(':')
            .next()
            .and_then(|tail| tail.trim_end_matches('/').parse().ok())
            .unwrap_or(DEFAULT_VISION_PORT)
    }
}
