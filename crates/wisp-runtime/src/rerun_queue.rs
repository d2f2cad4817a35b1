#![forbid(unsafe_code)]

//! Rerun request coalescing.
//!
//! # Design
//!
//! At most one rerun is in flight and at most one is pending. The queue
//! holds only the *intent* to rerun (and its fragment scope); the payload
//! is built by the caller at the moment the request is sent, so a deferred
//! rerun always carries the values committed at send time. The pending
//! rerun is sent when the host calls [`RerunQueue::flush`] at the end of its
//! event-loop task and nothing is in flight, or when the in-flight run
//! completes.
//!
//! ```text
//!            request            flush                run_started(r)
//!   Idle ──────────────▶ Pending ───────▶ InFlight(sent) ─────────────▶ InFlight(r)
//!    ▲                                                                     │
//!    │                      complete(r), nothing pending                   │
//!    └─────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Invariants
//!
//! 1. A sent request is bound to the first run that starts after it; only
//!    the completion of that run releases the in-flight slot. Completion of
//!    a run that was already executing when the request was sent is ignored.
//! 2. At most one `RerunScript` is outstanding at any time.
//!
//! # Fragments
//!
//! Merging a fragment-scoped request with a full-run request yields a full
//! run. Merging two different fragments widens to a full run unless the
//! widening is disabled in the config, in which case the newer fragment
//! wins.

use std::collections::VecDeque;

use tracing::debug;
use wisp_core::{BackMsg, FragmentId, RerunRequest, ScriptRunId};

use crate::metrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Pending,
    InFlight,
}

/// A queued rerun that has not been sent yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingRerun {
    /// `None` reruns the whole script.
    pub fragment_id: Option<FragmentId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum InFlight {
    /// Sent; the backend has not announced the run serving it.
    Sent,
    /// The backend started this run after the request was sent.
    Running(ScriptRunId),
}

#[derive(Debug, Clone)]
pub struct RerunQueue {
    pending: Option<PendingRerun>,
    in_flight: Option<InFlight>,
    outbox: VecDeque<BackMsg>,
    widen_conflicting_fragments: bool,
}

impl Default for RerunQueue {
    fn default() -> Self {
        Self::new(true)
    }
}

impl RerunQueue {
    #[must_use]
    pub fn new(widen_conflicting_fragments: bool) -> Self {
        Self {
            pending: None,
            in_flight: None,
            outbox: VecDeque::new(),
            widen_conflicting_fragments,
        }
    }

    #[must_use]
    pub fn state(&self) -> QueueState {
        if self.in_flight.is_some() {
            QueueState::InFlight
        } else if self.pending.is_some() {
            QueueState::Pending
        } else {
            QueueState::Idle
        }
    }

    #[must_use]
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    #[must_use]
    pub fn pending(&self) -> Option<&PendingRerun> {
        self.pending.as_ref()
    }

    /// The run serving the in-flight request, once the backend started it.
    #[must_use]
    pub fn serving_run(&self) -> Option<&ScriptRunId> {
        match &self.in_flight {
            Some(InFlight::Running(run)) => Some(run),
            _ => None,
        }
    }

    /// Queue a rerun scoped to `fragment_id`, merging with any pending one.
    pub fn request(&mut self, fragment_id: Option<FragmentId>) {
        let fragment_id = match self.pending.take() {
            Some(previous) => {
                let merged = match (previous.fragment_id, fragment_id) {
                    (Some(old), Some(new)) if old == new => Some(new),
                    (Some(_), Some(new)) if !self.widen_conflicting_fragments => Some(new),
                    _ => None,
                };
                metrics::record_rerun_coalesced();
                debug!(target: "wisp.rerun", fragment = ?merged, "rerun coalesced");
                merged
            }
            None => fragment_id,
        };
        self.pending = Some(PendingRerun { fragment_id });
    }

    /// Send the pending rerun if nothing is in flight. `build` produces the
    /// payload from the state at this moment. Returns whether a message was
    /// queued for the transport.
    pub fn flush(&mut self, build: impl FnOnce(Option<FragmentId>) -> RerunRequest) -> bool {
        if self.in_flight.is_some() {
            return false;
        }
        let Some(pending) = self.pending.take() else {
            return false;
        };
        let request = build(pending.fragment_id);
        debug!(
            target: "wisp.rerun",
            widgets = request.widget_states.len(),
            fragment = ?request.fragment_id,
            "rerun sent"
        );
        self.outbox.push_back(BackMsg::RerunScript(request));
        self.in_flight = Some(InFlight::Sent);
        metrics::record_rerun_sent();
        true
    }

    /// The backend started `run`. The first run after a send serves it.
    pub fn run_started(&mut self, run: &ScriptRunId) {
        if self.in_flight == Some(InFlight::Sent) {
            debug!(target: "wisp.rerun", %run, "rerun started");
            self.in_flight = Some(InFlight::Running(run.clone()));
        }
    }

    /// `run` finished. If it served the in-flight request, release the slot
    /// and send the pending rerun, if any.
    pub fn complete(
        &mut self,
        run: &ScriptRunId,
        build: impl FnOnce(Option<FragmentId>) -> RerunRequest,
    ) -> bool {
        match &self.in_flight {
            Some(InFlight::Running(serving)) if serving == run => {
                self.in_flight = None;
                self.flush(build)
            }
            Some(_) => {
                debug!(target: "wisp.rerun", %run, "finish of earlier run leaves rerun in flight");
                false
            }
            None => false,
        }
    }

    /// Cancel the current rerun.
    ///
    /// A pending request that was never sent is dropped. If a run is in
    /// flight (or the backend is running a script on its own), a stop
    /// message is queued. Either way the queue returns to idle.
    pub fn stop(&mut self, backend_running: bool) {
        let dropped = self.pending.take().is_some();
        let stop_sent = self.in_flight.is_some() || backend_running;
        if stop_sent {
            self.outbox.push_back(BackMsg::StopScript);
        }
        self.in_flight = None;
        debug!(target: "wisp.rerun", dropped, stop_sent, "rerun stopped");
    }

    /// Queue a non-rerun message, e.g. a file upload.
    pub fn push_message(&mut self, msg: BackMsg) {
        self.outbox.push_back(msg);
    }

    pub fn drain_outbox(&mut self) -> Vec<BackMsg> {
        self.outbox.drain(..).collect()
    }

    pub fn reset(&mut self) {
        self.pending = None;
        self.in_flight = None;
        self.outbox.clear();
    }
}
