#![forbid(unsafe_code)]

//! Deterministic session recording and replay.
//!
//! [`SessionRecorder`] wraps a [`WebSession`] and records every inbound
//! frame and user action. At each task boundary it checksums the outbound
//! frames with FNV-1a and chains the checksum onto the previous one.
//! [`replay`] feeds a recorded trace through a fresh session and reports the
//! first task whose outbound checksum differs.
//!
//! # Determinism contract
//!
//! Given the same trace, the same [`RuntimeConfig`] and a deterministic
//! [`UploadClient`], replay produces identical outbound frames. Nothing in
//! the session reads a clock or spawns work: state changes only through
//! recorded records.

use std::collections::BTreeMap;

use wisp_core::{FormId, KindMismatchError, WidgetId, WidgetValue};
use wisp_runtime::{DispatchOutcome, RuntimeConfig, WispError, WriteOutcome};

use crate::upload::{UploadClient, UploadTicket};
use crate::{WebBackendError, WebSession};

/// Schema version for session traces.
pub const SCHEMA_VERSION: &str = "wisp-session-v1";

const FNV_OFFSET_BASIS: u64 = 0xcbf29ce484222325;
const FNV_PRIME: u64 = 0x100000001b3;

fn fnv1a64_bytes(mut hash: u64, bytes: &[u8]) -> u64 {
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

fn fnv1a64_pair(prev: u64, next: u64) -> u64 {
    let hash = fnv1a64_bytes(FNV_OFFSET_BASIS, &prev.to_le_bytes());
    fnv1a64_bytes(hash, &next.to_le_bytes())
}

/// Checksum of the frames emitted by one task. Each frame is terminated by
/// a zero byte so `["ab"]` and `["a", "b"]` differ.
fn checksum_frames(frames: &[String]) -> u64 {
    frames.iter().fold(FNV_OFFSET_BASIS, |hash, frame| {
        fnv1a64_bytes(fnv1a64_bytes(hash, frame.as_bytes()), &[0])
    })
}

/// A single record in a session trace.
#[derive(Debug, Clone, PartialEq)]
pub enum TraceRecord {
    /// Session header (must be first).
    Header {
        schema: String,
        config: RuntimeConfig,
    },
    /// An inbound JSON frame, recorded even if it failed to decode.
    Inbound { json: String },
    SetValue {
        widget_id: WidgetId,
        value: WidgetValue,
    },
    SubmitForm {
        form_id: FormId,
        button: WidgetId,
    },
    ClearForm { form_id: FormId },
    StopScript,
    UploadFile { widget_id: WidgetId, bytes: Vec<u8> },
    UploadFinished { ticket: UploadTicket },
    QueryParams { params: BTreeMap<String, String> },
    /// Task boundary checkpoint.
    EndOfTask {
        task_idx: u64,
        frames: usize,
        checksum: u64,
        checksum_chain: u64,
    },
    /// Trace summary (must be last).
    Summary {
        total_tasks: u64,
        final_checksum_chain: u64,
    },
}

/// A complete recorded session trace.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionTrace {
    pub records: Vec<TraceRecord>,
}

impl SessionTrace {
    /// Number of task checkpoints in the trace.
    #[must_use]
    pub fn task_count(&self) -> u64 {
        self.records
            .iter()
            .filter(|r| matches!(r, TraceRecord::EndOfTask { .. }))
            .count() as u64
    }

    #[must_use]
    pub fn final_checksum_chain(&self) -> Option<u64> {
        self.records.iter().rev().find_map(|r| match r {
            TraceRecord::Summary {
                final_checksum_chain,
                ..
            } => Some(*final_checksum_chain),
            _ => None,
        })
    }
}

/// Records a session for deterministic replay.
#[derive(Debug)]
pub struct SessionRecorder<U> {
    web: WebSession<U>,
    records: Vec<TraceRecord>,
    task_idx: u64,
    checksum_chain: u64,
}

impl<U: UploadClient> SessionRecorder<U> {
    #[must_use]
    pub fn new(config: RuntimeConfig, uploads: U) -> Self {
        let records = vec![TraceRecord::Header {
            schema: SCHEMA_VERSION.to_string(),
            config: config.clone(),
        }];
        Self {
            web: WebSession::new(config, uploads),
            records,
            task_idx: 0,
            checksum_chain: 0,
        }
    }

    pub fn push_inbound(&mut self, json: &str) -> Result<DispatchOutcome, WebBackendError> {
        self.records.push(TraceRecord::Inbound {
            json: json.to_string(),
        });
        self.web.push_inbound(json)
    }

    pub fn set_value(
        &mut self,
        widget_id: &WidgetId,
        value: WidgetValue,
    ) -> Result<WriteOutcome, KindMismatchError> {
        self.records.push(TraceRecord::SetValue {
            widget_id: widget_id.clone(),
            value: value.clone(),
        });
        self.web.session_mut().set_value(widget_id, value)
    }

    pub fn submit_form(&mut self, form_id: &FormId, button: &WidgetId) -> Result<(), WispError> {
        self.records.push(TraceRecord::SubmitForm {
            form_id: form_id.clone(),
            button: button.clone(),
        });
        self.web.session_mut().submit_form(form_id, button)
    }

    pub fn clear_form(&mut self, form_id: &FormId) -> usize {
        self.records.push(TraceRecord::ClearForm {
            form_id: form_id.clone(),
        });
        self.web.session_mut().clear_form(form_id)
    }

    pub fn stop_script(&mut self) {
        self.records.push(TraceRecord::StopScript);
        self.web.session_mut().stop_script();
    }

    pub fn upload_file(&mut self, widget_id: &WidgetId, bytes: Vec<u8>) {
        self.records.push(TraceRecord::UploadFile {
            widget_id: widget_id.clone(),
            bytes: bytes.clone(),
        });
        self.web.session_mut().upload_file(widget_id, bytes);
    }

    pub fn upload_finished(&mut self, ticket: UploadTicket) -> bool {
        self.records.push(TraceRecord::UploadFinished { ticket });
        self.web.upload_finished(ticket)
    }

    pub fn set_query_params(&mut self, params: BTreeMap<String, String>) {
        self.records.push(TraceRecord::QueryParams {
            params: params.clone(),
        });
        self.web.session_mut().set_query_params(params);
    }

    /// End the task, checkpoint its outbound frames, and return them.
    pub fn end_of_task(&mut self) -> Vec<String> {
        self.web.end_of_task();
        let frames = self.web.drain_outbound();
        let checksum = checksum_frames(&frames);
        let chain = fnv1a64_pair(self.checksum_chain, checksum);
        self.records.push(TraceRecord::EndOfTask {
            task_idx: self.task_idx,
            frames: frames.len(),
            checksum,
            checksum_chain: chain,
        });
        self.task_idx += 1;
        self.checksum_chain = chain;
        frames
    }

    /// Finish recording and return the completed trace.
    #[must_use]
    pub fn finish(mut self) -> SessionTrace {
        self.records.push(TraceRecord::Summary {
            total_tasks: self.task_idx,
            final_checksum_chain: self.checksum_chain,
        });
        SessionTrace {
            records: self.records,
        }
    }

    #[must_use]
    pub fn web(&self) -> &WebSession<U> {
        &self.web
    }
}

/// Result of replaying a session trace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayResult {
    pub total_tasks: u64,
    pub final_checksum_chain: u64,
    /// First task whose outbound checksum differed, if any.
    pub first_mismatch: Option<ReplayMismatch>,
}

impl ReplayResult {
    /// Whether the replay produced identical checksums.
    #[must_use]
    pub fn ok(&self) -> bool {
        self.first_mismatch.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplayMismatch {
    pub task_idx: u64,
    pub expected: u64,
    pub actual: u64,
}

/// Errors that can occur during replay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
    /// The trace does not start with a header record.
    MissingHeader,
    /// The header names a schema this build cannot replay.
    UnsupportedSchema(String),
}

impl core::fmt::Display for ReplayError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::MissingHeader => write!(f, "trace missing header record"),
            Self::UnsupportedSchema(schema) => write!(f, "unsupported trace schema: {schema}"),
        }
    }
}

impl std::error::Error for ReplayError {}

/// Replay a recorded trace through a fresh session.
///
/// Errors returned by individual records are not compared: they reproduce
/// deterministically, and their effect shows up in later outbound frames.
pub fn replay<U: UploadClient>(uploads: U, trace: &SessionTrace) -> Result<ReplayResult, ReplayError> {
    let config = match trace.records.first() {
        Some(TraceRecord::Header { schema, config }) => {
            if schema != SCHEMA_VERSION {
                return Err(ReplayError::UnsupportedSchema(schema.clone()));
            }
            config.clone()
        }
        _ => return Err(ReplayError::MissingHeader),
    };

    let mut web = WebSession::new(config, uploads);
    let mut total_tasks: u64 = 0;
    let mut checksum_chain: u64 = 0;
    let mut first_mismatch = None;

    for record in &trace.records {
        match record {
            TraceRecord::Inbound { json } => {
                let _ = web.push_inbound(json);
            }
            TraceRecord::SetValue { widget_id, value } => {
                let _ = web.session_mut().set_value(widget_id, value.clone());
            }
            TraceRecord::SubmitForm { form_id, button } => {
                let _ = web.session_mut().submit_form(form_id, button);
            }
            TraceRecord::ClearForm { form_id } => {
                web.session_mut().clear_form(form_id);
            }
            TraceRecord::StopScript => web.session_mut().stop_script(),
            TraceRecord::UploadFile { widget_id, bytes } => {
                web.session_mut().upload_file(widget_id, bytes.clone());
            }
            TraceRecord::UploadFinished { ticket } => {
                web.upload_finished(*ticket);
            }
            TraceRecord::QueryParams { params } => {
                web.session_mut().set_query_params(params.clone());
            }
            TraceRecord::EndOfTask {
                task_idx,
                checksum: expected,
                ..
            } => {
                web.end_of_task();
                let actual = checksum_frames(&web.drain_outbound());
                checksum_chain = fnv1a64_pair(checksum_chain, actual);
                if actual != *expected && first_mismatch.is_none() {
                    first_mismatch = Some(ReplayMismatch {
                        task_idx: *task_idx,
                        expected: *expected,
                        actual,
                    });
                }
                total_tasks += 1;
            }
            TraceRecord::Header { .. } | TraceRecord::Summary { .. } => {}
        }
    }

    Ok(ReplayResult {
        total_tasks,
        final_checksum_chain: checksum_chain,
        first_mismatch,
    })
}
