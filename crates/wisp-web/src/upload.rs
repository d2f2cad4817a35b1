#![forbid(unsafe_code)]

//! File upload hand-off.
//!
//! The transport never sends file bytes over the message channel. A
//! [`BackMsg::FileUpload`](wisp_core::BackMsg::FileUpload) drained from the
//! runtime is handed to an [`UploadClient`], which starts the transfer and
//! returns a ticket. The host reports completion with
//! [`WebSession::upload_finished`](crate::WebSession::upload_finished).

use wisp_core::WidgetId;

/// Handle for one in-flight upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UploadTicket(u64);

impl UploadTicket {
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

/// Starts file transfers on behalf of a widget.
///
/// Implementations must not block. Tickets must be unique per client; for
/// [`replay`](crate::session_record::replay) to reproduce a recording they
/// must also be issued deterministically.
pub trait UploadClient {
    fn begin_upload(&mut self, widget_id: &WidgetId, bytes: Vec<u8>) -> UploadTicket;
}

/// A started upload as seen by [`MemoryUploadClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartedUpload {
    pub ticket: UploadTicket,
    pub widget_id: WidgetId,
    pub bytes: Vec<u8>,
}

/// In-memory client issuing sequential tickets starting at 1.
#[derive(Debug, Default)]
pub struct MemoryUploadClient {
    next: u64,
    started: Vec<StartedUpload>,
}

impl MemoryUploadClient {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every upload started so far, oldest first.
    #[must_use]
    pub fn started(&self) -> &[StartedUpload] {
        &self.started
    }
}

impl UploadClient for MemoryUploadClient {
    fn begin_upload(&mut self, widget_id: &WidgetId, bytes: Vec<u8>) -> UploadTicket {
        self.next += 1;
        let ticket = UploadTicket::new(self.next);
        self.started.push(StartedUpload {
            ticket,
            widget_id: widget_id.clone(),
            bytes,
        });
        ticket
    }
}
