use super::{desktop, init_tracing, test_config, CannedGrounding, CannedStructural};
use crate::cascade::TrailOutcome;
use crate::devtools::StructuralMatch;
use crate::platforms::memory::{InputEvent, MemoryApp, MemoryEngine, MemoryNode, Typing, ValueWrites};
use crate::{
    AppTarget, AutomationError, ClickRequest, Desktop, ExecutionTier, FocusRequest, Locator,
    MouseButton, Point, Rect, ResolveRequest, SearchIntent, Source, TypeRequest,
};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::info;

const MAIL_WINDOW: Rect = Rect::new(100.0, 100.0, 800.0, 600.0);

fn mail(content: Vec<MemoryNode>) -> MemoryApp {
    MemoryApp::new(42, "Mail").window(MemoryNode::window("New Message", MAIL_WINDOW).children(content))
}

fn in_mail(locator: Locator) -> ResolveRequest {
    ResolveRequest {
        target: AppTarget {
            app: Some("Mail".to_string()),
            window: None,
        },
        locator,
        intent: SearchIntent::Locate,
    }
}

fn click_in_mail(locator: Locator) -> ClickRequest {
    ClickRequest {
        target: AppTarget {
            app: Some("Mail".to_string()),
            window: None,
        },
        locator,
        x: None,
        y: None,
        button: MouseButton::Left,
        count: 1,
    }
}

fn nested_in_tunnels(levels: usize, leaf: MemoryNode) -> MemoryNode {
    (0..levels).fold(leaf, |inner, _| MemoryNode::group().child(inner))
}

fn clicks(engine: &MemoryEngine) -> Vec<Point> {
    engine
        .events()
        .into_iter()
        .filter_map(|event| match event {
            InputEvent::MouseClick { point, .. } => Some(point),
            _ => None,
        })
        .collect()
}

#[test]
fn native_button_resolves_on_the_first_tier() {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![
        MemoryNode::button("Compose").frame(Rect::new(120.0, 110.0, 90.0, 28.0)),
        MemoryNode::button("Compose later").frame(Rect::new(220.0, 110.0, 120.0, 28.0)),
    ])));
    let desktop = desktop(&engine);

    let report = desktop
        .resolve(&in_mail(Locator::query("Compose").with_role("button")))
        .unwrap();
    info!(?report, "resolved");
    assert_eq!(report.source, Source::Native);
    assert!(report.fallback_trail.is_empty());
    assert_eq!(report.point, Some(Point::new(165.0, 124.0)));
    assert_eq!(report.candidates.len(), 2);

    let result = desktop
        .click(&click_in_mail(Locator::query("Compose").with_role("button")))
        .unwrap();
    assert_eq!(result.tier, ExecutionTier::NativeAssistive);
    assert_eq!(engine.press_count("Compose"), 1);
    assert_eq!(engine.press_count("Compose later"), 0);
}

#[test]
fn structural_id_wins_before_any_other_tier() {
    init_tracing();
    let engine = Arc::new(
        MemoryEngine::new()
            .with_app(mail(vec![nested_in_tunnels(
                40,
                MemoryNode::button("Send").identifier("send-button").frame(Rect::new(800.0, 650.0, 60.0, 24.0)),
            )]))
            .without_native_index(),
    );
    let structural = Arc::new(CannedStructural::default());
    let desktop = Desktop::builder(test_config())
        .engine(engine.clone())
        .structural_peer(structural.clone())
        .build()
        .unwrap();

    let locator = Locator::identifier("send-button").with_depth(2);
    let report = desktop.resolve(&in_mail(locator)).unwrap();
    assert_eq!(report.source, Source::Native);
    assert!(report.fallback_trail.is_empty());
    assert_eq!(structural.calls(), 0);
}

#[test]
fn tunnels_do_not_spend_the_depth_budget() {
    let engine = Arc::new(
        MemoryEngine::new()
            .with_app(mail(vec![nested_in_tunnels(
                30,
                MemoryNode::button("Archive").frame(Rect::new(120.0, 110.0, 80.0, 24.0)),
            )]))
            .without_native_index(),
    );
    let report = desktop(&engine)
        .resolve(&in_mail(Locator::query("Archive").with_depth(5)))
        .unwrap();
    assert_eq!(report.source, Source::Semantic);
    assert_eq!(report.fallback_trail.len(), 1);
    assert_eq!(report.fallback_trail[0].source, Source::Native);
    assert_eq!(report.fallback_trail[0].outcome, TrailOutcome::Unavailable);
}

#[test]
fn typing_prefers_the_field_over_a_matching_link() {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![
        MemoryNode::link("Recipient settings").frame(Rect::new(120.0, 110.0, 140.0, 20.0)),
        MemoryNode::text_field("Recipient").frame(Rect::new(120.0, 140.0, 400.0, 24.0)),
    ])));
    let result = desktop(&engine)
        .type_text(&TypeRequest {
            target: AppTarget {
                app: Some("Mail".to_string()),
                window: None,
            },
            locator: Locator::query("recipient"),
            text: "bob@example.com".to_string(),
            clear: false,
        })
        .unwrap();
    assert_eq!(result.element.as_ref().map(|e| e.role.as_str()), Some("AXTextField"));
    assert_eq!(result.tier, ExecutionTier::NativeAssistive);
    assert_eq!(engine.value_of("Recipient").as_deref(), Some("bob@example.com"));
    assert_eq!(engine.press_count("Recipient settings"), 0);
}

#[test]
fn ignored_value_write_escalates_to_click_and_keystrokes() {
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![MemoryNode::text_field("Subject")
        .frame(Rect::new(120.0, 170.0, 400.0, 24.0))
        .value_writes(ValueWrites::Ignore)
        .typing(Typing::DropBulk)])));
    let result = desktop(&engine)
        .type_text(&TypeRequest {
            target: AppTarget {
                app: Some("Mail".to_string()),
                window: None,
            },
            locator: Locator::query("Subject"),
            text: "Quarterly numbers".to_string(),
            clear: false,
        })
        .unwrap();
    assert_eq!(result.tier, ExecutionTier::CoordinateBased);
    assert_eq!(result.method, "click_then_keystrokes");
    assert!(matches!(
        result.attempts[0].outcome,
        crate::AttemptOutcome::VerificationFailed { .. }
    ));
    assert_eq!(engine.value_of("Subject").as_deref(), Some("Quarterly numbers"));
}

#[test]
fn renderer_matches_are_offset_by_the_window_origin() {
    init_tracing();
    // A web view that exposes nothing but unlabeled containers.
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![nested_in_tunnels(
        6,
        MemoryNode::new("AXWebArea").child(MemoryNode::group().frame(Rect::new(100.0, 180.0, 800.0, 520.0))),
    )])));
    let structural = Arc::new(CannedStructural {
        matches: vec![StructuralMatch {
            viewport_rect: Rect::new(10.0, 20.0, 60.0, 30.0),
            content_offset: Point::new(0.0, 80.0),
            label: Some("send".to_string()),
            score: 100,
        }],
        ..Default::default()
    });
    let desktop = Desktop::builder(test_config())
        .engine(engine.clone())
        .structural_peer(structural.clone())
        .build()
        .unwrap();

    let report = desktop.resolve(&in_mail(Locator::query("Send"))).unwrap();
    assert_eq!(report.source, Source::Structural);
    assert_eq!(report.point, Some(Point::new(140.0, 215.0)));
    let sources: Vec<Source> = report.fallback_trail.iter().map(|t| t.source).collect();
    assert_eq!(sources, vec![Source::Native, Source::Semantic]);

    let query = structural.queries.lock().unwrap()[0].clone();
    assert_eq!(query.text, "Send");
    assert_eq!(query.window_title.as_deref(), Some("New Message"));

    desktop.click(&click_in_mail(Locator::query("Send"))).unwrap();
    assert_eq!(clicks(&engine), vec![Point::new(140.0, 215.0)]);
}

#[test]
fn low_confidence_grounding_never_clicks() {
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![MemoryNode::group()])));
    let grounding = Arc::new(CannedGrounding::new(0.4));
    let desktop = Desktop::builder(test_config())
        .engine(engine.clone())
        .grounding_peer(grounding.clone())
        .build()
        .unwrap();

    let err = desktop.click(&click_in_mail(Locator::query("Send"))).unwrap_err();
    assert!(matches!(err, AutomationError::ElementNotFound(_)));
    assert_eq!(grounding.calls.load(Ordering::SeqCst), 1);
    assert!(clicks(&engine).is_empty());
}

#[test]
fn confident_grounding_clicks_the_mapped_point() {
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![MemoryNode::group()])));
    let desktop = Desktop::builder(test_config())
        .engine(engine.clone())
        .grounding_peer(Arc::new(CannedGrounding::new(0.6)))
        .build()
        .unwrap();

    let result = desktop.click(&click_in_mail(Locator::query("Send"))).unwrap();
    assert_eq!(result.source, Some(Source::Vision));
    assert_eq!(result.tier, ExecutionTier::CoordinateBased);
    assert_eq!(clicks(&engine), vec![MAIL_WINDOW.center()]);
}

#[test]
fn focus_is_restored_after_a_failed_action() {
    let engine = Arc::new(
        MemoryEngine::new()
            .with_app(MemoryApp::new(7, "Finder"))
            .with_app(mail(vec![MemoryNode::button("Send")
                .frame(Rect::new(120.0, 110.0, 60.0, 24.0))
                .disabled()])),
    );
    let desktop = desktop(&engine);
    desktop
        .focus(&FocusRequest {
            app: "Mail".to_string(),
            window: None,
        })
        .unwrap();
    engine.set_frontmost(7);

    let mut request = click_in_mail(Locator::query("Send"));
    request.x = Some(150.0);
    request.y = Some(120.0);
    desktop.click(&request).unwrap();
    assert_eq!(engine.frontmost_pid(), Some(7));

    let err = desktop.click(&click_in_mail(Locator::query("Send"))).unwrap_err();
    assert!(matches!(err, AutomationError::NotActionable(_)));
    assert_eq!(engine.frontmost_pid(), Some(7));
}

#[test]
fn half_given_coordinates_are_rejected() {
    let engine = Arc::new(MemoryEngine::new().with_app(mail(Vec::new())));
    let mut request = click_in_mail(Locator::default());
    request.x = Some(10.0);
    let err = desktop(&engine).click(&request).unwrap_err();
    assert!(matches!(err, AutomationError::InvalidArgument(_)));
}

#[test]
fn role_and_identifier_click_never_lands_on_another_button() {
    init_tracing();
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![
        MemoryNode::button("Delete everything").frame(Rect::new(120.0, 110.0, 140.0, 28.0)),
        MemoryNode::button("Send")
            .identifier("other-id")
            .frame(Rect::new(280.0, 110.0, 60.0, 28.0)),
    ])));
    let grounding = Arc::new(CannedGrounding::new(0.9));
    let desktop = Desktop::builder(test_config())
        .engine(engine.clone())
        .grounding_peer(grounding.clone())
        .build()
        .unwrap();

    let locator = Locator::role("button").with_identifier("send-button");
    let err = desktop.click(&click_in_mail(locator)).unwrap_err();
    assert!(matches!(err, AutomationError::ElementNotFound(_)));
    assert_eq!(engine.press_count("Delete everything"), 0);
    assert_eq!(engine.press_count("Send"), 0);
    assert_eq!(grounding.calls.load(Ordering::SeqCst), 0);
    assert!(clicks(&engine).is_empty());
}

#[test]
fn typing_into_a_prefilled_field_that_ignores_input_fails() {
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![MemoryNode::text_field("Subject")
        .frame(Rect::new(120.0, 170.0, 400.0, 24.0))
        .value("hello world")
        .value_writes(ValueWrites::Ignore)
        .typing(Typing::Ignore)])));
    let err = desktop(&engine)
        .type_text(&TypeRequest {
            target: AppTarget {
                app: Some("Mail".to_string()),
                window: None,
            },
            locator: Locator::query("Subject"),
            text: "hello".to_string(),
            clear: true,
        })
        .unwrap_err();
    assert_eq!(
        err,
        AutomationError::VerificationFailed {
            expected: "hello".to_string(),
            actual: "hello world".to_string(),
        }
    );
    assert_eq!(engine.value_of("Subject").as_deref(), Some("hello world"));
}

#[test]
fn zero_size_button_is_reported_not_actionable() {
    let engine = Arc::new(MemoryEngine::new().with_app(mail(vec![
        MemoryNode::button("Send").frame(Rect::new(120.0, 110.0, 0.0, 0.0)),
    ])));
    let err = desktop(&engine)
        .click(&click_in_mail(Locator::query("Send").with_role("button")))
        .unwrap_err();
    assert!(matches!(err, AutomationError::NotActionable(_)));
    assert_eq!(engine.press_count("Send"), 0);
    assert!(clicks(&engine).is_empty());
}
