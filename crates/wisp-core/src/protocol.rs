#![forbid(unsafe_code)]

//! Protocol messages exchanged with the backend.
//!
//! Inbound ([`ForwardMsg`]) messages arrive wrapped in an [`IndexedMessage`]
//! carrying a per-session sequence index. Outbound ([`BackMsg`]) messages
//! are produced by the runtime and drained by the transport.

use std::collections::BTreeMap;

use crate::element_tree::{DeltaOp, DeltaPath};
use crate::ids::{FragmentId, ScriptRunId, WidgetId};
use crate::widget::{WidgetState, WidgetValue};

/// An inbound message with its sequence index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexedMessage {
    pub index: u64,
    pub msg: ForwardMsg,
}

impl IndexedMessage {
    #[must_use]
    pub fn new(index: u64, msg: ForwardMsg) -> Self {
        Self { index, msg }
    }
}

/// Messages sent by the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum ForwardMsg {
    NewSession(NewSession),
    Delta(Delta),
    ScriptFinished(ScriptFinished),
    SessionEvent(SessionEvent),
}

impl ForwardMsg {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::NewSession(_) => "new_session",
            Self::Delta(_) => "delta",
            Self::ScriptFinished(_) => "script_finished",
            Self::SessionEvent(_) => "session_event",
        }
    }
}

/// Start of a script run. The first one of a session opens the session.
#[derive(Debug, Clone, PartialEq)]
pub struct NewSession {
    pub session_id: String,
    pub script_run_id: ScriptRunId,
    pub page_script_hash: String,
    /// Non-empty when only these fragments are being rerun.
    pub fragment_ids_this_run: Vec<FragmentId>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delta {
    pub path: DeltaPath,
    pub op: DeltaOp,
    pub fragment_id: Option<FragmentId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFinishedStatus {
    Success,
    FragmentSuccess,
    CompileError,
    /// The run was interrupted because a newer rerun was requested.
    EarlyForRerun,
}

impl ScriptFinishedStatus {
    /// Whether the element tree now reflects a complete run.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success | Self::FragmentSuccess)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScriptFinished {
    pub script_run_id: ScriptRunId,
    pub status: ScriptFinishedStatus,
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ScriptChangedOnDisk,
    ScriptCompilationError(String),
    /// The backend discarded the session; the next message opens a new one.
    SessionEnded,
}

/// Payload of a rerun: the committed widget values plus page context.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RerunRequest {
    /// Sorted by widget id.
    pub widget_states: Vec<WidgetState>,
    pub query_params: BTreeMap<String, String>,
    pub page_script_hash: String,
    pub fragment_id: Option<FragmentId>,
}

impl RerunRequest {
    #[must_use]
    pub fn get(&self, id: &WidgetId) -> Option<&WidgetValue> {
        self.widget_states
            .binary_search_by(|state| state.id.cmp(id))
            .ok()
            .map(|i| &self.widget_states[i].value)
    }
}

/// Messages sent to the backend.
#[derive(Debug, Clone, PartialEq)]
pub enum BackMsg {
    RerunScript(RerunRequest),
    StopScript,
    FileUpload { widget_id: WidgetId, bytes: Vec<u8> },
}
