#![forbid(unsafe_code)]

//! JSON wire codec for the backend connection.
//!
//! [`decode_forward_msg`] turns one inbound JSON frame into an
//! [`IndexedMessage`]; [`encode_back_msg`] renders a [`BackMsg`] as JSON.
//!
//! # Design
//!
//! Inbound frames are flat objects discriminated by `"type"`. They are first
//! deserialized into permissive `Raw*` structs (every optional field is
//! `#[serde(default)]`) and then validated by hand, so a missing or unknown
//! field yields a precise [`WireError`] instead of a generic serde message.
//!
//! Widget values travel as `{"kind": "<kind>", "value": <payload>}` where
//! `<kind>` is [`ValueKind::name`]. Payloads:
//!
//! | kind             | payload                   |
//! |------------------|---------------------------|
//! | `bool`           | boolean                   |
//! | `double`         | number                    |
//! | `int`            | integer                   |
//! | `double_range`   | `[low, high]`             |
//! | `string`, `json` | string                    |
//! | `string_array`   | array of strings          |
//! | `bytes`          | array of integers 0..=255 |
//! | `trigger`        | boolean (absent = false)  |
//! | `string_trigger` | string or null            |

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::{Value, json};
use wisp_core::{
    BackMsg, BlockKind, Delta, DeltaOp, DeltaPath, ElementSpec, FormBlock, FormId, ForwardMsg,
    FragmentId, IndexedMessage, NewSession, RerunRequest, ScriptFinished, ScriptFinishedStatus,
    ScriptRunId, SessionEvent, ValueKind, WidgetId, WidgetSpec, WidgetValue,
};

/// Errors from decoding an inbound frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireError {
    /// Malformed JSON, or a field of the wrong JSON type.
    Json(String),
    /// Missing required field.
    MissingField(&'static str),
    /// A discriminating field holds a value this client does not know.
    UnknownVariant { field: &'static str, value: String },
    /// A widget value payload does not match its declared kind.
    InvalidValue { kind: &'static str },
}

impl core::fmt::Display for WireError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Json(msg) => write!(f, "JSON parse error: {msg}"),
            Self::MissingField(field) => write!(f, "missing required field: {field}"),
            Self::UnknownVariant { field, value } => write!(f, "unknown {field}: {value}"),
            Self::InvalidValue { kind } => write!(f, "payload is not a valid {kind} value"),
        }
    }
}

impl std::error::Error for WireError {}

#[derive(Debug, Deserialize)]
struct RawForwardMsg {
    index: Option<u64>,
    #[serde(rename = "type")]
    kind: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    script_run_id: Option<String>,
    #[serde(default)]
    page_script_hash: Option<String>,
    #[serde(default)]
    fragment_ids_this_run: Option<Vec<String>>,
    #[serde(default)]
    path: Option<Vec<usize>>,
    #[serde(default)]
    op: Option<String>,
    #[serde(default)]
    fragment_id: Option<String>,
    #[serde(default)]
    element: Option<RawElement>,
    #[serde(default)]
    block: Option<RawBlock>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    event: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawElement {
    kind: String,
    #[serde(default)]
    widget: Option<RawWidget>,
    #[serde(default)]
    props: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct RawWidget {
    id: String,
    #[serde(default)]
    form_id: Option<String>,
    #[serde(default)]
    default: Option<RawValue>,
    #[serde(default)]
    forced: Option<RawValue>,
}

#[derive(Debug, Deserialize)]
struct RawValue {
    kind: String,
    #[serde(default)]
    value: Value,
}

#[derive(Debug, Deserialize)]
struct RawBlock {
    kind: String,
    #[serde(default)]
    label: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    form_id: Option<String>,
    #[serde(default)]
    clear_on_submit: Option<bool>,
    #[serde(default)]
    enter_to_submit: Option<bool>,
}

/// Decode one inbound JSON frame.
///
/// # Errors
///
/// Returns a [`WireError`] describing the first problem found.
pub fn decode_forward_msg(json: &str) -> Result<IndexedMessage, WireError> {
    let raw: RawForwardMsg =
        serde_json::from_str(json).map_err(|e| WireError::Json(e.to_string()))?;
    let index = raw.index.ok_or(WireError::MissingField("index"))?;
    let kind = raw.kind.clone().ok_or(WireError::MissingField("type"))?;

    let msg = match kind.as_str() {
        "new_session" => ForwardMsg::NewSession(decode_new_session(&raw)?),
        "delta" => ForwardMsg::Delta(decode_delta(raw)?),
        "script_finished" => ForwardMsg::ScriptFinished(decode_script_finished(&raw)?),
        "session_event" => ForwardMsg::SessionEvent(decode_session_event(raw)?),
        other => {
            return Err(WireError::UnknownVariant {
                field: "type",
                value: other.to_string(),
            });
        }
    };
    Ok(IndexedMessage::new(index, msg))
}

fn decode_new_session(raw: &RawForwardMsg) -> Result<NewSession, WireError> {
    let session_id = raw
        .session_id
        .clone()
        .ok_or(WireError::MissingField("session_id"))?;
    let script_run_id = raw
        .script_run_id
        .as_deref()
        .map(ScriptRunId::new)
        .ok_or(WireError::MissingField("script_run_id"))?;
    Ok(NewSession {
        session_id,
        script_run_id,
        page_script_hash: raw.page_script_hash.clone().unwrap_or_default(),
        fragment_ids_this_run: raw
            .fragment_ids_this_run
            .iter()
            .flatten()
            .map(FragmentId::new)
            .collect(),
    })
}

fn decode_delta(raw: RawForwardMsg) -> Result<Delta, WireError> {
    let path = raw.path.ok_or(WireError::MissingField("path"))?;
    let op = match raw.op.as_deref().ok_or(WireError::MissingField("op"))? {
        "add_element" => {
            let element = raw.element.ok_or(WireError::MissingField("element"))?;
            DeltaOp::AddElement(decode_element(element)?)
        }
        "add_block" => {
            let block = raw.block.ok_or(WireError::MissingField("block"))?;
            DeltaOp::AddBlock(decode_block(block)?)
        }
        "remove" => DeltaOp::Remove,
        other => {
            return Err(WireError::UnknownVariant {
                field: "op",
                value: other.to_string(),
            });
        }
    };
    Ok(Delta {
        path: DeltaPath::new(path),
        op,
        fragment_id: raw.fragment_id.as_deref().map(FragmentId::new),
    })
}

fn decode_element(raw: RawElement) -> Result<ElementSpec, WireError> {
    let widget = raw.widget.map(decode_widget).transpose()?;
    Ok(ElementSpec {
        kind: raw.kind,
        widget,
        props: raw.props,
    })
}

fn decode_widget(raw: RawWidget) -> Result<WidgetSpec, WireError> {
    if raw.id.is_empty() {
        return Err(WireError::MissingField("widget.id"));
    }
    let mut spec = WidgetSpec::new(WidgetId::new(&raw.id));
    if let Some(form_id) = raw.form_id.as_deref().filter(|f| !f.is_empty()) {
        spec = spec.in_form(FormId::new(form_id));
    }
    if let Some(default) = &raw.default {
        spec = spec.with_default(decode_value(default)?);
    }
    if let Some(forced) = &raw.forced {
        spec = spec.with_forced(decode_value(forced)?);
    }
    Ok(spec)
}

fn decode_block(raw: RawBlock) -> Result<BlockKind, WireError> {
    let kind = match raw.kind.as_str() {
        "vertical" => BlockKind::Vertical,
        "horizontal" => BlockKind::Horizontal,
        "column" => BlockKind::Column,
        "expander" => BlockKind::Expander {
            label: raw.label.unwrap_or_default(),
        },
        "tab" => BlockKind::Tab {
            label: raw.label.unwrap_or_default(),
        },
        "dialog" => BlockKind::Dialog {
            title: raw.title.unwrap_or_default(),
        },
        "form" => {
            let form_id = raw
                .form_id
                .as_deref()
                .ok_or(WireError::MissingField("block.form_id"))?;
            let mut form = FormBlock::new(FormId::new(form_id));
            if let Some(clear) = raw.clear_on_submit {
                form.clear_on_submit = clear;
            }
            if let Some(enter) = raw.enter_to_submit {
                form.enter_to_submit = enter;
            }
            BlockKind::Form(form)
        }
        other => {
            return Err(WireError::UnknownVariant {
                field: "block.kind",
                value: other.to_string(),
            });
        }
    };
    Ok(kind)
}

fn decode_script_finished(raw: &RawForwardMsg) -> Result<ScriptFinished, WireError> {
    let script_run_id = raw
        .script_run_id
        .as_deref()
        .map(ScriptRunId::new)
        .ok_or(WireError::MissingField("script_run_id"))?;
    let status = match raw.status.as_deref().ok_or(WireError::MissingField("status"))? {
        "success" => ScriptFinishedStatus::Success,
        "fragment_success" => ScriptFinishedStatus::FragmentSuccess,
        "compile_error" => ScriptFinishedStatus::CompileError,
        "early_for_rerun" => ScriptFinishedStatus::EarlyForRerun,
        other => {
            return Err(WireError::UnknownVariant {
                field: "status",
                value: other.to_string(),
            });
        }
    };
    Ok(ScriptFinished {
        script_run_id,
        status,
    })
}

fn decode_session_event(raw: RawForwardMsg) -> Result<SessionEvent, WireError> {
    match raw.event.as_deref().ok_or(WireError::MissingField("event"))? {
        "script_changed_on_disk" => Ok(SessionEvent::ScriptChangedOnDisk),
        "script_compilation_error" => Ok(SessionEvent::ScriptCompilationError(
            raw.message.unwrap_or_default(),
        )),
        "session_ended" => Ok(SessionEvent::SessionEnded),
        other => Err(WireError::UnknownVariant {
            field: "event",
            value: other.to_string(),
        }),
    }
}

const VALUE_KINDS: [ValueKind; 10] = [
    ValueKind::Bool,
    ValueKind::Double,
    ValueKind::Int,
    ValueKind::DoubleRange,
    ValueKind::String,
    ValueKind::StringArray,
    ValueKind::Bytes,
    ValueKind::Json,
    ValueKind::Trigger,
    ValueKind::StringTrigger,
];

fn decode_value(raw: &RawValue) -> Result<WidgetValue, WireError> {
    let kind = VALUE_KINDS
        .into_iter()
        .find(|k| k.name() == raw.kind)
        .ok_or_else(|| WireError::UnknownVariant {
            field: "value.kind",
            value: raw.kind.clone(),
        })?;

    let decoded = match (kind, &raw.value) {
        (ValueKind::Bool, Value::Bool(b)) => Some(WidgetValue::Bool(*b)),
        (ValueKind::Double, Value::Number(n)) => n.as_f64().map(WidgetValue::Double),
        (ValueKind::Int, Value::Number(n)) => n.as_i64().map(WidgetValue::Int),
        (ValueKind::DoubleRange, Value::Array(items)) => match items.as_slice() {
            [low, high] => low
                .as_f64()
                .zip(high.as_f64())
                .map(|(low, high)| WidgetValue::DoubleRange(low, high)),
            _ => None,
        },
        (ValueKind::String, Value::String(s)) => Some(WidgetValue::String(s.clone())),
        (ValueKind::StringArray, Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_owned))
            .collect::<Option<Vec<_>>>()
            .map(WidgetValue::StringArray),
        (ValueKind::Bytes, Value::Array(items)) => items
            .iter()
            .map(|v| v.as_u64().and_then(|b| u8::try_from(b).ok()))
            .collect::<Option<Vec<_>>>()
            .map(WidgetValue::Bytes),
        (ValueKind::Json, Value::String(s)) => Some(WidgetValue::Json(s.clone())),
        (ValueKind::Trigger, Value::Bool(b)) => Some(WidgetValue::Trigger(*b)),
        (ValueKind::Trigger, Value::Null) => Some(WidgetValue::Trigger(false)),
        (ValueKind::StringTrigger, Value::String(s)) => {
            Some(WidgetValue::StringTrigger(Some(s.clone())))
        }
        (ValueKind::StringTrigger, Value::Null) => Some(WidgetValue::StringTrigger(None)),
        _ => None,
    };
    decoded.ok_or(WireError::InvalidValue { kind: kind.name() })
}

fn encode_value(value: &WidgetValue) -> Value {
    let payload = match value {
        WidgetValue::Bool(b) | WidgetValue::Trigger(b) => json!(b),
        WidgetValue::Double(v) => json!(v),
        WidgetValue::Int(v) => json!(v),
        WidgetValue::DoubleRange(low, high) => json!([low, high]),
        WidgetValue::String(s) | WidgetValue::Json(s) => json!(s),
        WidgetValue::StringArray(items) => json!(items),
        WidgetValue::Bytes(bytes) => json!(bytes),
        WidgetValue::StringTrigger(s) => json!(s),
    };
    json!({ "kind": value.kind().name(), "value": payload })
}

fn encode_rerun(request: &RerunRequest) -> Value {
    let widget_states: Vec<Value> = request
        .widget_states
        .iter()
        .map(|state| json!({ "id": state.id.as_str(), "value": encode_value(&state.value) }))
        .collect();
    json!({
        "type": "rerun_script",
        "widget_states": widget_states,
        "query_params": request.query_params,
        "page_script_hash": request.page_script_hash,
        "fragment_id": request.fragment_id.as_ref().map(FragmentId::as_str),
    })
}

/// Render an outbound message as a single-line JSON string.
#[must_use]
pub fn encode_back_msg(msg: &BackMsg) -> String {
    let value = match msg {
        BackMsg::RerunScript(request) => encode_rerun(request),
        BackMsg::StopScript => json!({ "type": "stop_script" }),
        BackMsg::FileUpload { widget_id, bytes } => json!({
            "type": "file_upload",
            "widget_id": widget_id.as_str(),
            "size": bytes.len(),
        }),
    };
    value.to_string()
}
