//! The reply envelope sent back to the calling agent.

use crate::errors::{AutomationError, ErrorKind};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One line of the request stream: `{"id", "op", "args"}`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    #[serde(default)]
    pub id: Value,
    pub op: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Response {
    pub id: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorBody {
    pub kind: ErrorKind,
    pub message: String,
}

impl Response {
    pub fn ok(id: Value, payload: impl Serialize) -> Self {
        match serde_json::to_value(payload) {
            Ok(payload) => Self {
                id,
                success: true,
                payload: Some(payload),
                error: None,
                suggestion: None,
            },
            Err(e) => Self::failure(
                id,
                &AutomationError::Internal(format!("cannot serialize result: {e}")),
            ),
        }
    }

    pub fn failure(id: Value, error: &AutomationError) -> Self {
        Self {
            id,
            success: false,
            payload: None,
            error: Some(ErrorBody {
                kind: error.kind(),
                message: error.to_string(),
            }),
            suggestion: Some(error.suggestion().to_string()),
        }
    }

    pub fn from_result<T: Serialize>(id: Value, result: Result<T, AutomationError>) -> Self {
        match result {
            Ok(payload) => Self::ok(id, payload),
            Err(e) => Self::failure(id, &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn failures_carry_kind_and_suggestion() {
        let response = Response::failure(
            json!(7),
            &AutomationError::PeerUnavailable("sidecar down".into()),
        );
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["id"], 7);
        assert_eq!(value["success"], false);
        assert_eq!(value["error"]["kind"], "peer_unavailable");
        assert!(value["suggestion"].as_str().unwrap().contains("sidecar"));
        assert!(value.get("payload").is_none());
    }

    #[test]
    fn requests_default_missing_id_and_args() {
        let request: Request = serde_json::from_str(r#"{"op":"focus"}"#).unwrap();
        assert_eq!(request.id, Value::Null);
        assert_eq!(request.args, Value::Null);
    }
}
