#![forbid(unsafe_code)]

//! Tracing coverage for dispatch and reconcile.
//!
//! Verifies that dropped messages are logged under `wisp.dispatch` and that
//! every reconcile runs inside a `wisp.reconcile` span carrying its counts.
//!
//! Run:
//!   cargo test -p wisp-runtime --test tracing_dispatch

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::registry::LookupSpan;
use wisp_core::{
    Delta, DeltaOp, DeltaPath, ElementSpec, ForwardMsg, IndexedMessage, NewSession,
    ScriptFinished, ScriptFinishedStatus, ScriptRunId, WidgetId, WidgetSpec, WidgetValue,
};
use wisp_runtime::{AppSession, DispatchOutcome};

// ============================================================================
// Capture layer
// ============================================================================

#[derive(Debug, Clone)]
struct CapturedSpan {
    name: String,
    fields: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct CapturedEvent {
    level: tracing::Level,
    target: String,
    message: String,
    fields: HashMap<String, String>,
}

#[derive(Default, Clone)]
struct CaptureHandle {
    spans: Arc<Mutex<Vec<CapturedSpan>>>,
    events: Arc<Mutex<Vec<CapturedEvent>>>,
    span_index: Arc<Mutex<HashMap<u64, usize>>>,
}

impl CaptureHandle {
    fn spans(&self) -> Vec<CapturedSpan> {
        self.spans.lock().unwrap().clone()
    }

    fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().unwrap().clone()
    }
}

struct FieldVisitor(Vec<(String, String)>);

impl tracing::field::Visit for FieldVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        self.0.push((field.name().to_string(), format!("{value:?}")));
    }

    fn record_u64(&mut self, field: &tracing::field::Field, value: u64) {
        self.0.push((field.name().to_string(), value.to_string()));
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        self.0.push((field.name().to_string(), value.to_string()));
    }
}

impl<S> tracing_subscriber::Layer<S> for CaptureHandle
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(
        &self,
        attrs: &tracing::span::Attributes<'_>,
        id: &tracing::span::Id,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        attrs.record(&mut visitor);
        let mut spans = self.spans.lock().unwrap();
        self.span_index
            .lock()
            .unwrap()
            .insert(id.into_u64(), spans.len());
        spans.push(CapturedSpan {
            name: attrs.metadata().name().to_string(),
            fields: visitor.0.into_iter().collect(),
        });
    }

    fn on_record(
        &self,
        id: &tracing::span::Id,
        values: &tracing::span::Record<'_>,
        _ctx: tracing_subscriber::layer::Context<'_, S>,
    ) {
        let mut visitor = FieldVisitor(Vec::new());
        values.record(&mut visitor);
        let index = self.span_index.lock().unwrap();
        if let Some(&idx) = index.get(&id.into_u64())
            && let Some(span) = self.spans.lock().unwrap().get_mut(idx)
        {
            span.fields.extend(visitor.0);
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, _ctx: tracing_subscriber::layer::Context<'_, S>) {
        let mut visitor = FieldVisitor(Vec::new());
        event.record(&mut visitor);
        let fields: HashMap<String, String> = visitor.0.into_iter().collect();
        self.events.lock().unwrap().push(CapturedEvent {
            level: *event.metadata().level(),
            target: event.metadata().target().to_string(),
            message: fields.get("message").cloned().unwrap_or_default(),
            fields,
        });
    }
}

fn with_capture<F: FnOnce()>(f: F) -> CaptureHandle {
    let handle = CaptureHandle::default();
    let subscriber = tracing_subscriber::registry()
        .with(tracing_subscriber::filter::LevelFilter::TRACE)
        .with(handle.clone());
    tracing::subscriber::with_default(subscriber, f);
    handle
}

// ============================================================================
// Helpers
// ============================================================================

fn new_session(index: u64, run: &str) -> IndexedMessage {
    IndexedMessage::new(
        index,
        ForwardMsg::NewSession(NewSession {
            session_id: "s1".into(),
            script_run_id: ScriptRunId::new(run),
            page_script_hash: "page".into(),
            fragment_ids_this_run: Vec::new(),
        }),
    )
}

fn add_checkbox(index: u64, position: usize, id: &str) -> IndexedMessage {
    IndexedMessage::new(
        index,
        ForwardMsg::Delta(Delta {
            path: DeltaPath::new(vec![0, position]),
            op: DeltaOp::AddElement(ElementSpec::widget(
                "checkbox",
                WidgetSpec::new(WidgetId::new(id)).with_default(WidgetValue::Bool(false)),
            )),
            fragment_id: None,
        }),
    )
}

fn finished(index: u64, run: &str) -> IndexedMessage {
    IndexedMessage::new(
        index,
        ForwardMsg::ScriptFinished(ScriptFinished {
            script_run_id: ScriptRunId::new(run),
            status: ScriptFinishedStatus::Success,
        }),
    )
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn dropped_message_is_logged() {
    let handle = with_capture(|| {
        let mut session = AppSession::default();
        session.handle_message(new_session(1, "r1")).unwrap();
        session.handle_message(add_checkbox(2, 0, "cb1")).unwrap();
        let outcome = session.handle_message(add_checkbox(2, 1, "cb2")).unwrap();
        assert!(matches!(outcome, DispatchOutcome::Dropped(_)));
    });

    let events = handle.events();
    let dropped = events
        .iter()
        .find(|e| e.message == "dropped out-of-order message")
        .expect("dropped message should be logged");
    assert_eq!(dropped.level, tracing::Level::WARN);
    assert_eq!(dropped.target, "wisp.dispatch");
    assert_eq!(dropped.fields.get("index").map(String::as_str), Some("2"));
    assert_eq!(dropped.fields.get("last_accepted").map(String::as_str), Some("2"));
}

#[test]
fn reconcile_span_records_counts() {
    let handle = with_capture(|| {
        let mut session = AppSession::default();
        session.handle_message(new_session(1, "r1")).unwrap();
        session.handle_message(add_checkbox(2, 0, "a")).unwrap();
        session.handle_message(add_checkbox(3, 1, "b")).unwrap();
        session.handle_message(finished(4, "r1")).unwrap();

        session.handle_message(new_session(5, "r2")).unwrap();
        session.handle_message(add_checkbox(6, 0, "a")).unwrap();
        session.handle_message(finished(7, "r2")).unwrap();
    });

    let spans: Vec<CapturedSpan> = handle
        .spans()
        .into_iter()
        .filter(|s| s.name == "wisp.reconcile")
        .collect();
    assert_eq!(spans.len(), 2, "one reconcile per finished run");
    let last = &spans[1];
    assert_eq!(last.fields.get("retained").map(String::as_str), Some("1"));
    assert_eq!(last.fields.get("orphaned").map(String::as_str), Some("1"));
    assert_eq!(last.fields.get("deleted").map(String::as_str), Some("0"));
    assert!(last.fields.contains_key("duration_us"));
}

#[test]
fn coalesced_rerun_is_logged() {
    let handle = with_capture(|| {
        let mut session = AppSession::default();
        session.handle_message(new_session(1, "r1")).unwrap();
        session.handle_message(add_checkbox(2, 0, "cb")).unwrap();
        session.handle_message(finished(3, "r1")).unwrap();
        session.set_value(&WidgetId::new("cb"), WidgetValue::Bool(true)).unwrap();
        session.set_value(&WidgetId::new("cb"), WidgetValue::Bool(false)).unwrap();
        assert!(session.end_of_task());
    });

    let events = handle.events();
    assert!(
        events
            .iter()
            .any(|e| e.target == "wisp.rerun" && e.message == "rerun coalesced")
    );
    assert_eq!(
        events
            .iter()
            .filter(|e| e.target == "wisp.rerun" && e.message == "rerun sent")
            .count(),
        1
    );
}
