use crate::utils::parse_args;
use ghostwire::{
    AutomationError, ClickRequest, Desktop, FocusRequest, HotkeyRequest, PressRequest, Request,
    ResolveRequest, Response, ScrollRequest, TypeRequest,
};
use serde::Serialize;
use serde_json::Value;
use std::io::{BufRead, Write};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

pub const OPERATIONS: [&str; 7] = ["resolve", "click", "type", "press", "hotkey", "scroll", "focus"];

/// Run one request against the desktop and wrap the outcome.
#[instrument(skip(desktop, request), fields(op = %request.op))]
pub fn dispatch(desktop: &Desktop, request: Request) -> Response {
    let start = Instant::now();
    let Request { id, op, args } = request;
    let response = match op.as_str() {
        "resolve" => run(id, &op, args, |r: ResolveRequest| desktop.resolve(&r)),
        "click" => run(id, &op, args, |r: ClickRequest| desktop.click(&r)),
        "type" => run(id, &op, args, |r: TypeRequest| desktop.type_text(&r)),
        "press" => run(id, &op, args, |r: PressRequest| desktop.press(&r)),
        "hotkey" => run(id, &op, args, |r: HotkeyRequest| desktop.hotkey(&r)),
        "scroll" => run(id, &op, args, |r: ScrollRequest| desktop.scroll(&r)),
        "focus" => run(id, &op, args, |r: FocusRequest| desktop.focus(&r)),
        other => Response::failure(
            id,
            &AutomationError::InvalidArgument(format!(
                "unknown operation '{other}'; expected one of {}",
                OPERATIONS.join(", ")
            )),
        ),
    };
    info!(
        success = response.success,
        duration_ms = start.elapsed().as_millis() as u64,
        "request handled"
    );
    response
}

fn run<A, T, F>(id: Value, op: &str, args: Value, call: F) -> Response
where
    A: serde::de::DeserializeOwned,
    T: Serialize,
    F: FnOnce(A) -> Result<T, AutomationError>,
{
    let result = parse_args::<A>(op, args).and_then(call);
    Response::from_result(id, result)
}

/// Read requests line by line until the input closes. Returns the number handled.
pub fn serve<R: BufRead, W: Write>(desktop: &Desktop, input: R, mut output: W) -> std::io::Result<usize> {
    let mut handled = 0;
    for line in input.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let response = match serde_json::from_str::<Request>(&line) {
            Ok(request) => dispatch(desktop, request),
            Err(e) => {
                warn!(error = %e, "unparseable request line");
                // Recover the id if the line was at least a JSON object.
                let id = serde_json::from_str::<Value>(&line)
                    .ok()
                    .and_then(|v| v.get("id").cloned())
                    .unwrap_or(Value::Null);
                Response::failure(id, &AutomationError::InvalidArgument(format!("malformed request: {e}")))
            }
        };
        let encoded = serde_json::to_string(&response).map_err(std::io::Error::other)?;
        writeln!(output, "{encoded}")?;
        output.flush()?;
        handled += 1;
        debug!(handled, "response written");
    }
    Ok(handled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ghostwire::platforms::memory::{InputEvent, MemoryApp, MemoryEngine, MemoryNode};
    use ghostwire::{Config, Rect};
    use serde_json::json;
    use std::sync::Arc;

    fn desktop() -> (Arc<MemoryEngine>, Desktop) {
        let engine = Arc::new(
            MemoryEngine::new().with_app(
                MemoryApp::new(5, "Calendar").window(
                    MemoryNode::window("Day", Rect::new(0.0, 0.0, 900.0, 700.0))
                        .child(MemoryNode::button("Today").frame(Rect::new(20.0, 20.0, 60.0, 24.0))),
                ),
            ),
        );
        let mut config = Config::default();
        config.focus.poll_interval_ms = 5;
        config.focus.confirm_window_ms = 100;
        let desktop = Desktop::with_engine(engine.clone(), config).unwrap();
        (engine, desktop)
    }

    fn lines(output: Vec<u8>) -> Vec<Value> {
        String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect()
    }

    #[test]
    fn one_response_per_request_line() {
        let (engine, desktop) = desktop();
        let input = concat!(
            r#"{"id": 1, "op": "click", "args": {"app": "Calendar", "query": "today", "role": "button"}}"#,
            "\n\n",
            r#"{"id": "two", "op": "press", "args": {"key": "escape"}}"#,
            "\n",
        );
        let mut output = Vec::new();
        let handled = serve(&desktop, input.as_bytes(), &mut output).unwrap();
        assert_eq!(handled, 2);

        let responses = lines(output);
        assert_eq!(responses[0]["id"], 1);
        assert_eq!(responses[0]["success"], true);
        assert_eq!(responses[0]["payload"]["tier"], "native_assistive");
        assert_eq!(responses[1]["id"], "two");
        assert_eq!(engine.press_count("Today"), 1);
        assert!(engine.events().contains(&InputEvent::Key("escape".to_string())));
    }

    #[test]
    fn unknown_operations_and_bad_lines_are_invalid_arguments() {
        let (_, desktop) = desktop();
        let input = "{\"id\": 7, \"op\": \"drag\"}\nnot json\n{\"id\": 9}\n";
        let mut output = Vec::new();
        serve(&desktop, input.as_bytes(), &mut output).unwrap();

        let responses = lines(output);
        assert_eq!(responses.len(), 3);
        for response in &responses {
            assert_eq!(response["success"], false);
            assert_eq!(response["error"]["kind"], "invalid_argument");
        }
        assert_eq!(responses[0]["id"], 7);
        assert_eq!(responses[1]["id"], Value::Null);
        assert_eq!(responses[2]["id"], 9);
    }

    #[test]
    fn failures_carry_kind_and_suggestion() {
        let (_, desktop) = desktop();
        let response = dispatch(
            &desktop,
            Request {
                id: json!(3),
                op: "resolve".to_string(),
                args: json!({"app": "Calendar", "query": "Tomorrow"}),
            },
        );
        assert!(!response.success);
        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["error"]["kind"], "not_found");
        assert!(value["suggestion"].is_string());
    }
}
