#![forbid(unsafe_code)]

//! End-to-end tests for [`WebSession`]: JSON frames in, JSON frames out.
//!
//! Run:
//!   cargo test -p wisp-web --test web_session

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use tracing_subscriber::layer::SubscriberExt;
use wisp_core::{FormId, WidgetId, WidgetValue};
use wisp_runtime::{DispatchOutcome, FormError, RuntimeConfig, WispError};
use wisp_web::{MemoryUploadClient, UploadTicket, WebBackendError, WebSession, WireError};

// ============================================================================
// Helpers
// ============================================================================

fn web() -> WebSession<MemoryUploadClient> {
    WebSession::new(RuntimeConfig::default(), MemoryUploadClient::new())
}

fn push_all(web: &mut WebSession<MemoryUploadClient>, frames: &[Value]) {
    for frame in frames {
        web.push_inbound(&frame.to_string()).unwrap();
    }
}

fn new_session(index: u64, run: &str) -> Value {
    json!({
        "index": index,
        "type": "new_session",
        "session_id": "s1",
        "script_run_id": run,
        "page_script_hash": "main",
    })
}

fn finished(index: u64, run: &str) -> Value {
    json!({ "index": index, "type": "script_finished", "script_run_id": run, "status": "success" })
}

fn checkbox(index: u64, position: usize, id: &str) -> Value {
    json!({
        "index": index,
        "type": "delta",
        "path": [0, position],
        "op": "add_element",
        "element": {
            "kind": "checkbox",
            "widget": { "id": id, "default": { "kind": "bool", "value": false } },
        },
    })
}

fn form_page() -> Vec<Value> {
    vec![
        new_session(1, "r1"),
        json!({
            "index": 2, "type": "delta", "path": [0, 0], "op": "add_block",
            "block": { "kind": "form", "form_id": "f" },
        }),
        json!({
            "index": 3, "type": "delta", "path": [0, 0, 0], "op": "add_element",
            "element": { "kind": "file_uploader", "widget": {
                "id": "doc", "form_id": "f", "default": { "kind": "bytes", "value": [] },
            }},
        }),
        json!({
            "index": 4, "type": "delta", "path": [0, 0, 1], "op": "add_element",
            "element": { "kind": "form_submit_button", "widget": {
                "id": "submit", "form_id": "f", "default": { "kind": "trigger", "value": false },
            }},
        }),
        finished(5, "r1"),
    ]
}

fn parse(frames: &[String]) -> Vec<Value> {
    frames
        .iter()
        .map(|f| serde_json::from_str(f).unwrap())
        .collect()
}

fn widget_value<'a>(rerun: &'a Value, id: &str) -> Option<&'a Value> {
    rerun["widget_states"]
        .as_array()?
        .iter()
        .find(|s| s["id"] == id)
        .map(|s| &s["value"])
}

// ============================================================================
// Reruns
// ============================================================================

#[test]
fn edits_in_one_task_become_one_rerun_frame() {
    let mut web = web();
    push_all(&mut web, &[new_session(1, "r1"), checkbox(2, 0, "cb1"), finished(3, "r1")]);
    assert_eq!(web.end_of_task(), 0);

    web.session_mut()
        .set_query_params(BTreeMap::from([("tab".to_string(), "a".to_string())]));
    for checked in [true, false, true] {
        web.session_mut()
            .set_value(&WidgetId::new("cb1"), WidgetValue::Bool(checked))
            .unwrap();
    }
    assert_eq!(web.end_of_task(), 1);

    let frames = parse(&web.drain_outbound());
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["type"], "rerun_script");
    assert_eq!(frames[0]["query_params"], json!({ "tab": "a" }));
    assert_eq!(frames[0]["page_script_hash"], "main");
    assert_eq!(frames[0]["fragment_id"], Value::Null);
    assert_eq!(
        widget_value(&frames[0], "cb1"),
        Some(&json!({ "kind": "bool", "value": true }))
    );
    assert!(web.drain_outbound().is_empty());
}

#[test]
fn stop_while_in_flight_sends_stop_frame() {
    let mut web = web();
    push_all(&mut web, &[new_session(1, "r1"), checkbox(2, 0, "cb1"), finished(3, "r1")]);
    web.session_mut()
        .set_value(&WidgetId::new("cb1"), WidgetValue::Bool(true))
        .unwrap();
    web.end_of_task();
    web.drain_outbound();

    web.session_mut().stop_script();
    assert_eq!(web.end_of_task(), 1);
    assert_eq!(web.drain_outbound(), vec![r#"{"type":"stop_script"}"#.to_string()]);
}

// ============================================================================
// Uploads
// ============================================================================

#[test]
fn uploads_go_to_the_client_and_gate_submit() {
    let mut web = web();
    push_all(&mut web, &form_page());
    let form = FormId::new("f");
    let doc = WidgetId::new("doc");

    web.session_mut().upload_file(&doc, vec![7, 7, 7]);
    assert_eq!(web.end_of_task(), 0, "upload bytes never hit the channel");
    assert_eq!(web.uploads_in_flight(), 1);
    let started = &web.uploads().started()[0];
    assert_eq!(started.widget_id, doc);
    assert_eq!(started.bytes, vec![7, 7, 7]);
    let ticket = started.ticket;

    let err = web
        .session_mut()
        .submit_form(&form, &WidgetId::new("submit"))
        .unwrap_err();
    assert!(matches!(
        err,
        WispError::Form(FormError::UploadsInProgress { count: 1, .. })
    ));

    assert!(web.upload_finished(ticket));
    assert!(!web.upload_finished(ticket));
    assert_eq!(web.uploads_in_flight(), 0);

    web.session_mut()
        .submit_form(&form, &WidgetId::new("submit"))
        .unwrap();
    assert_eq!(web.end_of_task(), 1);
    let frames = parse(&web.drain_outbound());
    assert_eq!(
        widget_value(&frames[0], "submit"),
        Some(&json!({ "kind": "trigger", "value": true }))
    );
}

#[test]
fn unknown_ticket_changes_nothing() {
    let mut web = web();
    push_all(&mut web, &form_page());
    assert!(!web.upload_finished(UploadTicket::new(42)));
}

// ============================================================================
// Errors
// ============================================================================

#[test]
fn duplicate_index_is_dropped() {
    let mut web = web();
    push_all(&mut web, &[new_session(1, "r1"), checkbox(2, 0, "a")]);
    let outcome = web.push_inbound(&checkbox(2, 1, "b").to_string()).unwrap();
    assert!(matches!(outcome, DispatchOutcome::Dropped(_)));
    assert!(!web.session().store().contains(&WidgetId::new("b")));
}

#[test]
fn invalid_value_payload_is_a_wire_error() {
    let mut web = web();
    push_all(&mut web, &[new_session(1, "r1")]);
    let frame = json!({
        "index": 2, "type": "delta", "path": [0, 0], "op": "add_element",
        "element": { "kind": "number_input", "widget": {
            "id": "n", "default": { "kind": "int", "value": "seven" },
        }},
    });
    assert_eq!(
        web.push_inbound(&frame.to_string()),
        Err(WebBackendError::Wire(WireError::InvalidValue { kind: "int" }))
    );
    assert_eq!(web.session().tree().widget_ids().len(), 0);
}

#[derive(Default, Clone)]
struct WarnCapture(Arc<Mutex<Vec<(String, String)>>>);

struct MessageVisitor(String);

impl tracing::field::Visit for MessageVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            self.0 = format!("{value:?}");
        }
    }
}

impl<S: tracing::Subscriber> tracing_subscriber::Layer<S> for WarnCapture {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        if *event.metadata().level() == tracing::Level::WARN {
            let mut visitor = MessageVisitor(String::new());
            event.record(&mut visitor);
            self.0
                .lock()
                .unwrap()
                .push((event.metadata().target().to_string(), visitor.0));
        }
    }
}

#[test]
fn undecodable_frame_is_logged() {
    let capture = WarnCapture::default();
    let subscriber = tracing_subscriber::registry().with(capture.clone());
    tracing::subscriber::with_default(subscriber, || {
        let mut web = web();
        assert!(web.push_inbound("[1, 2").is_err());
    });
    let warnings = capture.0.lock().unwrap().clone();
    assert_eq!(
        warnings,
        vec![("wisp.web".to_string(), "undecodable inbound frame".to_string())]
    );
}
