//! Structural lookup through a browser's DevTools protocol.
//!
//! Renderers that expose only generic containers to the accessibility tree still have
//! a DOM. The client finds the page target behind the window via `/json/list`, then
//! runs a single `Runtime.evaluate` that returns matching nodes in viewport space.

use crate::errors::AutomationError;
use crate::geometry::{Point, Rect};
use crate::utils::normalize;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, instrument, warn};

const DISCOVERY_TIMEOUT: Duration = Duration::from_millis(800);
const EVALUATE_ID: u64 = 1;

/// What to look for in the page behind a window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StructuralQuery {
    pub app_name: String,
    pub window_title: Option<String>,
    pub text: String,
    pub role: Option<String>,
    /// DOM id the node must carry
    pub identifier: Option<String>,
}

/// A DOM node that matched, in the renderer's viewport space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructuralMatch {
    pub viewport_rect: Rect,
    /// Where the viewport starts inside the window
    pub content_offset: Point,
    pub label: Option<String>,
    pub score: i32,
}

#[async_trait::async_trait]
pub trait StructuralPeer: Send + Sync {
    /// Matches ordered best first. `PeerUnavailable` when no renderer answers.
    async fn query(&self, query: StructuralQuery) -> Result<Vec<StructuralMatch>, AutomationError>;
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PageTarget {
    #[serde(default)]
    title: String,
    #[serde(rename = "type")]
    kind: String,
    web_socket_debugger_url: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluatePayload {
    offset_x: f64,
    offset_y: f64,
    matches: Vec<DomMatch>,
}

#[derive(Debug, Deserialize)]
struct DomMatch {
    x: f64,
    y: f64,
    width: f64,
    height: f64,
    label: Option<String>,
    score: i32,
}

pub struct DevToolsClient {
    http: reqwest::Client,
    ports: Vec<u16>,
    max_matches: usize,
}

impl DevToolsClient {
    pub fn new(ports: Vec<u16>, max_matches: usize) -> Result<Self, AutomationError> {
        let http = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .build()
            .map_err(|e| AutomationError::Internal(format!("http client: {e}")))?;
        Ok(Self {
            http,
            ports,
            max_matches,
        })
    }

    async fn list_pages(&self) -> Result<Vec<PageTarget>, AutomationError> {
        let mut pages = Vec::new();
        let mut reachable = false;
        for port in &self.ports {
            let url = format!("http://127.0.0.1:{port}/json/list");
            match self.http.get(&url).send().await {
                Ok(response) => match response.json::<Vec<PageTarget>>().await {
                    Ok(targets) => {
                        reachable = true;
                        pages.extend(targets.into_iter().filter(|t| {
                            t.kind == "page" && t.web_socket_debugger_url.is_some()
                        }));
                    }
                    Err(e) => warn!(port, error = %e, "unreadable DevTools target list"),
                },
                Err(e) => debug!(port, error = %e, "DevTools port not answering"),
            }
        }
        if !reachable {
            return Err(AutomationError::PeerUnavailable(format!(
                "no DevTools endpoint on ports {:?}",
                self.ports
            )));
        }
        Ok(pages)
    }

    async fn evaluate(&self, ws_url: &str, expression: String) -> Result<Value, AutomationError> {
        let (mut socket, _) = tokio_tungstenite::connect_async(ws_url)
            .await
            .map_err(|e| AutomationError::PeerUnavailable(format!("DevTools socket: {e}")))?;
        let request = json!({
            "id": EVALUATE_ID,
            "method": "Runtime.evaluate",
            "params": { "expression": expression, "returnByValue": true },
        });
        socket
            .send(Message::Text(request.to_string().into()))
            .await
            .map_err(|e| AutomationError::PeerUnavailable(format!("DevTools send: {e}")))?;

        while let Some(message) = socket.next().await {
            let message = message
                .map_err(|e| AutomationError::PeerUnavailable(format!("DevTools read: {e}")))?;
            let Message::Text(text) = message else {
                continue;
            };
            let reply: Value = serde_json::from_str(text.as_str())
                .map_err(|e| AutomationError::ExecutionFailed(format!("DevTools reply: {e}")))?;
            if reply.get("id").and_then(Value::as_u64) != Some(EVALUATE_ID) {
                continue;
            }
            let _ = socket.close(None).await;
            return unwrap_evaluation(reply);
        }
        Err(AutomationError::PeerUnavailable(
            "DevTools socket closed before replying".to_string(),
        ))
    }
}

#[async_trait::async_trait]
impl StructuralPeer for DevToolsClient {
    #[instrument(skip(self), fields(app = %query.app_name, text = %query.text))]
    async fn query(&self, query: StructuralQuery) -> Result<Vec<StructuralMatch>, AutomationError> {
        let start = Instant::now();
        let pages = self.list_pages().await?;
        let Some(page) = pick_page(&pages, query.window_title.as_deref()) else {
            debug!(
                app = %query.app_name,
                window = ?query.window_title,
                pages = pages.len(),
                "no DevTools page belongs to the target window"
            );
            return Ok(Vec::new());
        };
        let Some(ws_url) = page.web_socket_debugger_url.as_deref() else {
            return Ok(Vec::new());
        };

        let expression = lookup_script(
            &query.text,
            query.role.as_deref(),
            query.identifier.as_deref(),
            self.max_matches,
        );
        let value = self.evaluate(ws_url, expression).await?;
        let payload: EvaluatePayload = serde_json::from_value(value)
            .map_err(|e| AutomationError::ExecutionFailed(format!("unexpected lookup result: {e}")))?;

        let offset = Point::new(payload.offset_x, payload.offset_y);
        let matches: Vec<StructuralMatch> = payload
            .matches
            .into_iter()
            .map(|m| StructuralMatch {
                viewport_rect: Rect::new(m.x, m.y, m.width, m.height),
                content_offset: offset,
                label: m.label,
                score: m.score,
            })
            .collect();
        info!(
            page = %page.title,
            matches = matches.len(),
            duration_ms = start.elapsed().as_millis(),
            "DevTools lookup finished"
        );
        Ok(matches)
    }
}

/// The page whose title appears in the window title, or none.
fn pick_page<'a>(pages: &'a [PageTarget], window_title: Option<&str>) -> Option<&'a PageTarget> {
    let window = window_title.map(normalize).filter(|t| !t.is_empty())?;
    pages
        .iter()
        .filter(|page| {
            let title = normalize(&page.title);
            !title.is_empty() && window.contains(&title)
        })
        // "Inbox" and "Inbox (3)" can both fit; the longest title is the closest.
        .max_by_key(|page| normalize(&page.title).chars().count())
}

fn unwrap_evaluation(reply: Value) -> Result<Value, AutomationError> {
    if let Some(error) = reply.get("error") {
        return Err(AutomationError::ExecutionFailed(format!(
            "Runtime.evaluate rejected: {error}"
        )));
    }
    let result = reply.get("result").cloned().unwrap_or(Value::Null);
    if let Some(details) = result.get("exceptionDetails") {
        let text = details
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or("script threw");
        return Err(AutomationError::ExecutionFailed(format!(
            "lookup script failed: {text}"
        )));
    }
    result
        .get("result")
        .and_then(|r| r.get("value"))
        .cloned()
        .ok_or_else(|| AutomationError::ExecutionFailed("lookup returned no value".to_string()))
}

/// DOM roles and tag names that stand for an accessibility role filter.
pub fn dom_roles(role: &str) -> Vec<&'static str> {
    match role.trim().to_ascii_lowercase().trim_start_matches("ax") {
        "button" | "menuitem" | "popupbutton" => vec!["button", "menuitem", "summary"],
        "link" => vec!["a", "link"],
        "textfield" | "textarea" | "input" | "text" | "textbox" | "field" | "searchfield"
        | "combobox" => vec!["input", "textarea", "textbox", "searchbox", "combobox", "div"],
        "checkbox" => vec!["checkbox"],
        "tab" => vec!["tab"],
        _ => Vec::new(),
    }
}

fn lookup_script(text: &str, role: Option<&str>, identifier: Option<&str>, limit: usize) -> String {
    let wanted = serde_json::to_string(&normalize(text)).unwrap_or_else(|_| "\"\"".to_string());
    let roles = serde_json::to_string(&role.map(dom_roles).unwrap_or_default())
        .unwrap_or_else(|_| "[]".to_string());
    let wanted_id = serde_json::to_string(&identifier).unwrap_or_else(|_| "null".to_string());
    format!(
        r#"(() => {{
  const wanted = {wanted};
  const roles = {roles};
  const wantedId = {wanted_id};
  const norm = (t) => String(t).replace(/[\u200B-\u200D\uFEFF]/g, '').replace(/\s+/g, ' ').trim().toLowerCase();
  const selector = 'a,button,input,textarea,select,summary,label,[role],[contenteditable="true"],[tabindex]';
  const out = [];
  for (const el of document.querySelectorAll(selector)) {{
    const r = el.getBoundingClientRect();
    if (r.width <= 0 || r.height <= 0) continue;
    if (wantedId !== null && el.id !== wantedId) continue;
    const role = (el.getAttribute('role') || el.tagName).toLowerCase();
    if (roles.length && !roles.includes(role)) continue;
    const texts = [el.innerText, el.value, el.getAttribute('aria-label'), el.getAttribute('title'), el.getAttribute('placeholder')]
      .filter((t) => t).map(norm).filter((t) => t.length);
    let score = 0;
    for (const t of texts) {{
      if (t === wanted) score = Math.max(score, 100);
      else if (t.startsWith(wanted)) score = Math.max(score, 75);
      else if (t.includes(wanted)) score = Math.max(score, 50);
    }}
    if (!score) continue;
    out.push({{ x: r.left, y: r.top, width: r.width, height: r.height, label: texts[0] || null, score }});
  }}
  out.sort((a, b) => b.score - a.score);
  return {{
    offsetX: Math.max(0, (window.outerWidth - window.innerWidth) / 2),
    offsetY: Math.max(0, window.outerHeight - window.innerHeight),
    matches: out.slice(0, {limit}),
  }};
}})()"#
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(title: &str) -> PageTarget {
        PageTarget {
            title: title.to_string(),
            kind: "page".to_string(),
            web_socket_debugger_url: Some(format!("ws://127.0.0.1:9222/devtools/page/{title}")),
        }
    }

    #[test]
    fn picks_the_page_named_in_the_window_title() {
        let pages = vec![page("Inbox"), page("Drafts - Mail")];
        let picked = pick_page(&pages, Some("Drafts - Mail - Chromium")).unwrap();
        assert_eq!(picked.title, "Drafts - Mail");
        assert!(pick_page(&[], Some("Inbox")).is_none());
    }

    #[test]
    fn no_page_without_a_title_match() {
        let pages = vec![page("Bank - Transfer"), page("Slack | general")];
        assert!(pick_page(&pages, Some("Notes - Chromium")).is_none());
        assert!(pick_page(&pages, None).is_none());
        assert!(pick_page(&pages, Some("   ")).is_none());
    }

    #[test]
    fn longest_matching_title_wins() {
        let pages = vec![page("Inbox"), page("Inbox (3) - Mail")];
        let picked = pick_page(&pages, Some("Inbox (3) - Mail - Chromium")).unwrap();
        assert_eq!(picked.title, "Inbox (3) - Mail");
    }

    #[test]
    fn evaluation_reply_is_unwrapped_or_reported() {
        let ok = json!({"id": 1, "result": {"result": {"type": "object", "value": {"offsetX": 0, "offsetY": 80, "matches": []}}}});
        let payload: EvaluatePayload = serde_json::from_value(unwrap_evaluation(ok).unwrap()).unwrap();
        assert_eq!(payload.offset_y, 80.0);
        assert!(payload.matches.is_empty());

        let thrown = json!({"id": 1, "result": {"result": {}, "exceptionDetails": {"text": "Uncaught"}}});
        assert!(matches!(
            unwrap_evaluation(thrown),
            Err(AutomationError::ExecutionFailed(_))
        ));
    }

    #[test]
    fn script_embeds_query_as_a_json_literal() {
        let script = lookup_script("Say \"hi\"", Some("button"), None, 3);
        assert!(script.contains(r#"const wanted = "say \"hi\"";"#));
        assert!(script.contains("const wantedId = null;"));
        assert!(script.contains(r#"["button","menuitem","summary"]"#));
        assert!(script.contains("out.slice(0, 3)"));
    }

    #[test]
    fn script_filters_on_the_dom_id_when_given() {
        let script = lookup_script("Send", None, Some("send-button"), 5);
        assert!(script.contains(r#"const wantedId = "send-button";"#));
        assert!(script.contains("el.id !== wantedId"));
    }

    #[tokio::test]
    async fn closed_ports_mean_the_peer_is_unavailable() {
        let client = DevToolsClient::new(vec![1], 5).unwrap();
        let err = client
            .query(StructuralQuery {
                app_name: "Chromium".to_string(),
                window_title: None,
                text: "Send".to_string(),
                role: None,
                identifier: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, AutomationError::PeerUnavailable(_)));
    }
}
