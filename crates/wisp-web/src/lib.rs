#![forbid(unsafe_code)]

//! `wisp-web` connects a Wisp [`AppSession`] to a JSON message channel.
//!
//! Design goals:
//! - **Host-driven I/O**: the embedding environment pushes inbound frames and
//!   drains outbound frames; this crate never touches a socket.
//! - **Task-boundary flushing**: the host calls [`WebSession::end_of_task`]
//!   once per event-loop task, so edits made within one task coalesce into a
//!   single rerun request.
//! - **No blocking / no threads**: suitable for `wasm32-unknown-unknown`.

pub mod session_record;
pub mod upload;
pub mod wire;

use std::collections::{BTreeMap, VecDeque};

use tracing::{debug, warn};
use wisp_core::{BackMsg, WidgetId};
use wisp_runtime::{AppSession, DispatchOutcome, RuntimeConfig, WispError};

pub use upload::{MemoryUploadClient, StartedUpload, UploadClient, UploadTicket};
pub use wire::{WireError, decode_forward_msg, encode_back_msg};

/// Web transport error type.
#[derive(Debug, Clone, PartialEq)]
pub enum WebBackendError {
    /// The inbound frame could not be decoded.
    Wire(WireError),
    /// The frame decoded but the session rejected it.
    Session(WispError),
}

impl core::fmt::Display for WebBackendError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::Wire(e) => write!(f, "wire error: {e}"),
            Self::Session(e) => write!(f, "session error: {e}"),
        }
    }
}

impl std::error::Error for WebBackendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Wire(e) => Some(e),
            Self::Session(e) => Some(e),
        }
    }
}

impl From<WireError> for WebBackendError {
    fn from(e: WireError) -> Self {
        Self::Wire(e)
    }
}

impl From<WispError> for WebBackendError {
    fn from(e: WispError) -> Self {
        Self::Session(e)
    }
}

/// An [`AppSession`] fed from, and draining to, JSON frames.
#[derive(Debug)]
pub struct WebSession<U> {
    session: AppSession,
    uploads: U,
    in_flight_uploads: BTreeMap<UploadTicket, WidgetId>,
    outbound: VecDeque<String>,
}

impl<U: UploadClient> WebSession<U> {
    #[must_use]
    pub fn new(config: RuntimeConfig, uploads: U) -> Self {
        Self {
            session: AppSession::new(config),
            uploads,
            in_flight_uploads: BTreeMap::new(),
            outbound: VecDeque::new(),
        }
    }

    /// Decode and dispatch one inbound frame.
    ///
    /// # Errors
    ///
    /// [`WebBackendError::Wire`] for undecodable frames (the session is left
    /// untouched), [`WebBackendError::Session`] for errors the session raised.
    pub fn push_inbound(&mut self, json: &str) -> Result<DispatchOutcome, WebBackendError> {
        let message = decode_forward_msg(json).inspect_err(|e| {
            warn!(target: "wisp.web", error = %e, "undecodable inbound frame");
        })?;
        Ok(self.session.handle_message(message)?)
    }

    /// End the current event-loop task: flush the rerun queue, start any
    /// queued uploads, and encode everything else for the channel.
    ///
    /// Returns the number of frames added to the outbound queue.
    pub fn end_of_task(&mut self) -> usize {
        self.session.end_of_task();
        let mut encoded = 0;
        for msg in self.session.drain_outbound() {
            match msg {
                BackMsg::FileUpload { widget_id, bytes } => {
                    let ticket = self.uploads.begin_upload(&widget_id, bytes);
                    debug!(
                        target: "wisp.web",
                        widget = %widget_id,
                        ticket = ticket.get(),
                        "upload started"
                    );
                    self.in_flight_uploads.insert(ticket, widget_id);
                }
                other => {
                    self.outbound.push_back(encode_back_msg(&other));
                    encoded += 1;
                }
            }
        }
        encoded
    }

    /// Take every encoded outbound frame, oldest first.
    pub fn drain_outbound(&mut self) -> Vec<String> {
        self.outbound.drain(..).collect()
    }

    /// Report a finished upload. Returns `false` for an unknown ticket.
    pub fn upload_finished(&mut self, ticket: UploadTicket) -> bool {
        match self.in_flight_uploads.remove(&ticket) {
            Some(widget_id) => {
                self.session.upload_finished(&widget_id);
                true
            }
            None => {
                warn!(target: "wisp.web", ticket = ticket.get(), "unknown upload ticket");
                false
            }
        }
    }

    #[must_use]
    pub fn uploads_in_flight(&self) -> usize {
        self.in_flight_uploads.len()
    }

    #[must_use]
    pub fn session(&self) -> &AppSession {
        &self.session
    }

    /// The session, for user actions (`set_value`, `submit_form`, ...).
    pub fn session_mut(&mut self) -> &mut AppSession {
        &mut self.session
    }

    #[must_use]
    pub fn uploads(&self) -> &U {
        &self.uploads
    }
}
