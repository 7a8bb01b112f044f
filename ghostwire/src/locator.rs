use crate::errors::AutomationError;
use serde::{Deserialize, Serialize};

/// Default semantic depth budget when a locator does not carry its own.
pub const DEFAULT_SEARCH_DEPTH: usize = 22;

/// Search criteria for a single UI target.
///
/// A locator is immutable once built; each resolution tier gets its own copy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Locator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    identifier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    depth: Option<usize>,
}

impl Locator {
    /// Locate by free text ("Compose", "To")
    pub fn query(text: impl Into<String>) -> Self {
        Self {
            query: Some(text.into()),
            ..Self::default()
        }
    }

    /// Locate by role alone ("button", "AXTextField")
    pub fn role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Self::default()
        }
    }

    /// Locate by a framework-assigned structural identifier
    pub fn identifier(id: impl Into<String>) -> Self {
        Self {
            identifier: Some(id.into()),
            ..Self::default()
        }
    }

    pub fn with_query(mut self, text: impl Into<String>) -> Self {
        self.query = Some(text.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn with_identifier(mut self, id: impl Into<String>) -> Self {
        self.identifier = Some(id.into());
        self
    }

    pub fn with_depth(mut self, depth: usize) -> Self {
        self.depth = Some(depth);
        self
    }

    pub fn query_text(&self) -> Option<&str> {
        self.query.as_deref().filter(|q| !q.trim().is_empty())
    }

    pub fn role_filter(&self) -> Option<&str> {
        self.role.as_deref().filter(|r| !r.trim().is_empty())
    }

    pub fn structural_id(&self) -> Option<&str> {
        self.identifier.as_deref().filter(|id| !id.is_empty())
    }

    pub fn depth_budget(&self) -> Option<usize> {
        self.depth
    }

    /// True when no criterion is set.
    pub fn is_empty(&self) -> bool {
        self.query_text().is_none() && self.role_filter().is_none() && self.structural_id().is_none()
    }

    /// A locator must name at least one criterion.
    pub fn validate(&self) -> Result<(), AutomationError> {
        if self.is_empty() {
            return Err(AutomationError::InvalidArgument(
                "locator needs a query, a role or an identifier".to_string(),
            ));
        }
        Ok(())
    }

    /// Human-readable description sent to the grounding service.
    pub fn describe(&self) -> String {
        match (self.query_text(), self.role_filter()) {
            (Some(query), Some(role)) => format!("{query} {}", crate::roles::display_name(role)),
            (Some(query), None) => query.to_string(),
            (None, Some(role)) => crate::roles::display_name(role).to_string(),
            (None, None) => self.structural_id().unwrap_or_default().to_string(),
        }
    }
}

impl From<&str> for Locator {
    fn from(text: &str) -> Self {
        Locator::query(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_locator_is_rejected() {
        assert!(Locator::default().validate().is_err());
        assert!(Locator::query("   ").validate().is_err());
        assert!(Locator::role("button").validate().is_ok());
    }

    #[test]
    fn deserializes_from_flat_arguments() {
        let locator: Locator =
            serde_json::from_value(serde_json::json!({"query": "Compose", "role": "button"})).unwrap();
        assert_eq!(locator, Locator::query("Compose").with_role("button"));
        assert_eq!(locator.describe(), "Compose button");
    }
}
