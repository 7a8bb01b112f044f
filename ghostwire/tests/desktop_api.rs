use ghostwire::platforms::memory::{InputEvent, MemoryApp, MemoryEngine, MemoryNode};
use ghostwire::{
    Config, Desktop, FocusOutcome, FocusRequest, HotkeyRequest, PressRequest, Rect,
    ResolveRequest, Response, ScrollRequest, Source,
};
use serde_json::{json, Value};
use std::sync::Arc;

fn config() -> Config {
    Config::from_json(
        r#"{
            "focus": {"poll_interval_ms": 5, "confirm_window_ms": 100},
            "typing": {"char_delay_ms": 0, "settle_ms": 0}
        }"#,
    )
    .unwrap()
}

fn notes() -> Arc<MemoryEngine> {
    Arc::new(
        MemoryEngine::new()
            .with_app(MemoryApp::new(10, "Finder"))
            .with_app(
                MemoryApp::new(20, "Notes").bundle_id("com.apple.Notes").window(
                    MemoryNode::window("All Notes", Rect::new(50.0, 50.0, 1000.0, 700.0)).children([
                        MemoryNode::button("New Note").frame(Rect::new(60.0, 60.0, 90.0, 24.0)),
                        MemoryNode::scroll_area()
                            .identifier("note-list")
                            .frame(Rect::new(50.0, 100.0, 300.0, 650.0))
                            .child(MemoryNode::static_text("Groceries")),
                    ]),
                ),
            ),
    )
}

fn request<T: serde::de::DeserializeOwned>(args: Value) -> T {
    serde_json::from_value(args).unwrap()
}

#[test]
fn resolve_request_parses_flat_arguments() {
    let engine = notes();
    let desktop = Desktop::with_engine(engine.clone(), config()).unwrap();
    let report = desktop
        .resolve(&request::<ResolveRequest>(
            json!({"app": "Notes", "query": "new note", "role": "button"}),
        ))
        .unwrap();
    assert_eq!(report.source, Source::Native);

    let response = Response::from_result(json!("r-1"), Ok(report));
    let value = serde_json::to_value(&response).unwrap();
    assert_eq!(value["success"], true);
    assert_eq!(value["payload"]["source"], "native");
    assert_eq!(value["payload"]["element"]["role"], "AXButton");
}

#[test]
fn missing_app_is_reported_with_a_suggestion() {
    let desktop = Desktop::with_engine(notes(), config()).unwrap();
    let result = desktop.resolve(&request::<ResolveRequest>(json!({"app": "Pages", "query": "x"})));
    let value = serde_json::to_value(Response::from_result(json!(3), result)).unwrap();
    assert_eq!(value["success"], false);
    assert_eq!(value["error"]["kind"], "not_found");
    assert!(value["suggestion"].as_str().is_some_and(|s| !s.is_empty()));
}

#[test]
fn empty_locator_is_an_invalid_argument() {
    let desktop = Desktop::with_engine(notes(), config()).unwrap();
    let err = desktop
        .resolve(&request::<ResolveRequest>(json!({"app": "Notes"})))
        .unwrap_err();
    assert_eq!(err.kind(), ghostwire::ErrorKind::InvalidArgument);
}

#[test]
fn hotkey_targets_the_app_then_gives_focus_back() {
    let engine = notes();
    let desktop = Desktop::with_engine(engine.clone(), config()).unwrap();
    desktop
        .hotkey(&request::<HotkeyRequest>(json!({"app": "Notes", "keys": ["cmd", "n"]})))
        .unwrap();
    let events = engine.events();
    assert!(events.contains(&InputEvent::Activate(20)));
    assert!(events.contains(&InputEvent::Key("cmd+n".to_string())));
    assert!(events.contains(&InputEvent::ModifierReset));
    assert_eq!(engine.frontmost_pid(), Some(10));
}

#[test]
fn press_without_app_goes_to_the_frontmost_app() {
    let engine = notes();
    let desktop = Desktop::with_engine(engine.clone(), config()).unwrap();
    desktop
        .press(&request::<PressRequest>(json!({"key": "escape"})))
        .unwrap();
    assert_eq!(engine.events(), vec![InputEvent::Key("escape".to_string())]);
}

#[test]
fn scroll_uses_the_note_list() {
    let engine = notes();
    let desktop = Desktop::with_engine(engine.clone(), config()).unwrap();
    let result = desktop
        .scroll(&request::<ScrollRequest>(
            json!({"app": "Notes", "direction": "down", "amount": 12}),
        ))
        .unwrap();
    assert_eq!(result.method, "scroll_by_page");
    assert_eq!(engine.scroll_pages("note-list"), 2);
}

#[test]
fn focus_reports_confirmation() {
    let engine = notes();
    let desktop = Desktop::with_engine(engine.clone(), config()).unwrap();
    let outcome = desktop
        .focus(&FocusRequest {
            app: "notes".to_string(),
            window: Some("All Notes".to_string()),
        })
        .unwrap();
    assert_eq!(outcome, FocusOutcome::Confirmed { pid: 20, attempts: 1 });
    assert_eq!(engine.frontmost_pid(), Some(20));
}
