#![forbid(unsafe_code)]

//! Ordered routing of inbound protocol messages.
//!
//! # Lifecycle
//!
//! ```text
//!                    NewSession
//!   AwaitingFirstSession ───────▶ SessionActive ──┐ NewSession (same id): next run
//!            ▲                        │  ▲        │
//!            │ SessionEnded           │  └────────┘
//!            └────────────────────────┘
//! ```
//!
//! A `NewSession` carrying a session id different from the active one
//! starts a fresh session: the tree, store, forms, and rerun queue are
//! reset and the sequence baseline restarts. A `NewSession` with the active
//! id is the next run of a resumed session and keeps all state.
//!
//! # Ordering
//!
//! Every message carries an index that must be strictly greater than the
//! last accepted one. An out-of-order message is logged and dropped; after
//! `order_error_reload_threshold` consecutive drops the dispatcher returns
//! a fatal [`WispError::ProtocolOrder`] and the host should reload.
//!
//! # Reconcile
//!
//! [`Dispatcher::handle`] is the only caller of
//! [`WidgetStateStore::reconcile`](crate::store::WidgetStateStore::reconcile):
//! once per successful `ScriptFinished`, against the tree's widget ids after
//! stale nodes are cleared.

use std::collections::BTreeSet;

use tracing::{debug, info, warn};
use wisp_core::{
    BlockKind, Delta, DeltaOp, ForwardMsg, FragmentId, IndexedMessage, KindMismatchError,
    NewSession, RunStamp, ScriptFinished, ScriptFinishedStatus, ScriptRunId, SessionEvent,
    TreeError, WidgetSpec,
};

use crate::config::RuntimeConfig;
use crate::error::{
    ProtocolOrderError, SessionLifecycleError, UnregisteredFormSubmitError, WispError,
};
use crate::forms::{FormCleared, FormConfig};
use crate::metrics;
use crate::session::SessionState;
use crate::store::{ReconcileReport, WriteSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    AwaitingFirstSession,
    SessionActive,
}

impl SessionPhase {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::AwaitingFirstSession => "awaiting first session",
            Self::SessionActive => "session active",
        }
    }
}

/// What a completed run did to the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub script_run_id: ScriptRunId,
    pub status: ScriptFinishedStatus,
    pub stale_nodes_removed: usize,
    /// `None` unless the run succeeded.
    pub reconcile: Option<ReconcileReport>,
    pub form_warnings: Vec<UnregisteredFormSubmitError>,
    /// The run served the in-flight rerun and the deferred one was sent.
    pub next_rerun_sent: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscardReason {
    /// The client stopped this run.
    CancelledRun(ScriptRunId),
    /// A newer run has started.
    NotCurrentRun(ScriptRunId),
}

/// Result of one accepted or rejected message.
#[derive(Debug, Clone, PartialEq)]
pub enum DispatchOutcome {
    SessionStarted {
        fresh: bool,
        script_run_id: ScriptRunId,
    },
    /// A delta was applied. Hydration failures are local to their widget.
    Applied {
        widget_errors: Vec<KindMismatchError>,
    },
    RunFinished(RunSummary),
    Discarded(DiscardReason),
    Dropped(ProtocolOrderError),
    /// A delta addressed a node that does not exist; the tree is unchanged.
    StaleUi(TreeError),
    ScriptChangedOnDisk,
    CompilationError(String),
    SessionEnded,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    phase: SessionPhase,
    last_index: Option<u64>,
    session_id: Option<String>,
    current_run: ScriptRunId,
    fragment_ids_this_run: Vec<FragmentId>,
    cancelled_runs: BTreeSet<ScriptRunId>,
    consecutive_order_errors: u32,
    script_running: bool,
    reload_threshold: u32,
    clear_stale: bool,
}

impl Dispatcher {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            phase: SessionPhase::AwaitingFirstSession,
            last_index: None,
            session_id: None,
            current_run: ScriptRunId::initial(),
            fragment_ids_this_run: Vec::new(),
            cancelled_runs: BTreeSet::new(),
            consecutive_order_errors: 0,
            script_running: false,
            reload_threshold: config.order_error_reload_threshold,
            clear_stale: config.clear_stale_nodes,
        }
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    #[must_use]
    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    #[must_use]
    pub fn current_run(&self) -> &ScriptRunId {
        &self.current_run
    }

    /// Whether the backend is executing a run the client has not stopped.
    #[must_use]
    pub fn script_running(&self) -> bool {
        self.script_running
    }

    /// Mark the current run as stopped by the client. Later deltas and the
    /// `ScriptFinished` of this run are discarded.
    pub fn cancel_current_run(&mut self) {
        if self.script_running {
            self.cancelled_runs.insert(self.current_run.clone());
            self.script_running = false;
            debug!(target: "wisp.dispatch", run = %self.current_run, "run cancelled");
        }
    }

    /// Route one inbound message.
    pub fn handle(
        &mut self,
        state: &mut SessionState,
        message: IndexedMessage,
    ) -> Result<DispatchOutcome, WispError> {
        let IndexedMessage { index, msg } = message;

        if let ForwardMsg::NewSession(new_session) = &msg
            && self.session_id.as_deref() != Some(new_session.session_id.as_str())
        {
            self.reset(state);
        }

        if self.phase == SessionPhase::AwaitingFirstSession
            && !matches!(msg, ForwardMsg::NewSession(_))
        {
            warn!(
                target: "wisp.dispatch",
                index,
                message = msg.name(),
                "message before session start"
            );
            return Err(SessionLifecycleError {
                message: msg.name(),
                phase: self.phase.name(),
            }
            .into());
        }

        if let Some(last) = self.last_index
            && index <= last
        {
            return self.drop_out_of_order(index, last, msg.name());
        }
        self.last_index = Some(index);
        self.consecutive_order_errors = 0;

        match msg {
            ForwardMsg::NewSession(new_session) => Ok(self.start_run(state, new_session)),
            ForwardMsg::Delta(delta) => self.apply_delta(state, delta),
            ForwardMsg::ScriptFinished(finished) => Ok(self.finish_run(state, finished)),
            ForwardMsg::SessionEvent(event) => Ok(self.session_event(state, event)),
        }
    }

    fn drop_out_of_order(
        &mut self,
        index: u64,
        last: u64,
        message: &'static str,
    ) -> Result<DispatchOutcome, WispError> {
        self.consecutive_order_errors += 1;
        metrics::record_message_dropped();
        let err = ProtocolOrderError {
            index,
            last_accepted: last,
            message,
            consecutive: self.consecutive_order_errors,
        };
        warn!(
            target: "wisp.dispatch",
            index,
            last_accepted = last,
            message,
            consecutive = self.consecutive_order_errors,
            "dropped out-of-order message"
        );
        if self.consecutive_order_errors >= self.reload_threshold {
            Err(err.into())
        } else {
            Ok(DispatchOutcome::Dropped(err))
        }
    }

    fn reset(&mut self, state: &mut SessionState) {
        if self.session_id.is_some() {
            info!(target: "wisp.dispatch", previous = ?self.session_id, "fresh session, state reset");
        }
        state.reset();
        self.phase = SessionPhase::AwaitingFirstSession;
        self.last_index = None;
        self.session_id = None;
        self.current_run = ScriptRunId::initial();
        self.fragment_ids_this_run.clear();
        self.cancelled_runs.clear();
        self.consecutive_order_errors = 0;
        self.script_running = false;
    }

    fn start_run(&mut self, state: &mut SessionState, new_session: NewSession) -> DispatchOutcome {
        let fresh = self.phase == SessionPhase::AwaitingFirstSession;
        state.context.page_script_hash = new_session.page_script_hash;
        self.phase = SessionPhase::SessionActive;
        self.session_id = Some(new_session.session_id);
        self.current_run = new_session.script_run_id.clone();
        self.fragment_ids_this_run = new_session.fragment_ids_this_run;
        self.script_running = true;
        state.queue.run_started(&self.current_run);
        info!(
            target: "wisp.dispatch",
            run = %self.current_run,
            fresh,
            fragments = self.fragment_ids_this_run.len(),
            "script run started"
        );
        DispatchOutcome::SessionStarted {
            fresh,
            script_run_id: new_session.script_run_id,
        }
    }

    fn apply_delta(
        &mut self,
        state: &mut SessionState,
        delta: Delta,
    ) -> Result<DispatchOutcome, WispError> {
        if self.cancelled_runs.contains(&self.current_run) {
            return Ok(DispatchOutcome::Discarded(DiscardReason::CancelledRun(
                self.current_run.clone(),
            )));
        }
        let Delta {
            path,
            op,
            fragment_id,
        } = delta;
        let stamp = RunStamp::new(self.current_run.clone()).with_fragment(fragment_id.clone());

        let hydrate = match &op {
            DeltaOp::AddElement(spec) => spec.widget.clone(),
            _ => None,
        };
        let form_block = match &op {
            DeltaOp::AddBlock(BlockKind::Form(form)) => Some(form.clone()),
            _ => None,
        };

        match state.tree.apply_delta(&path, op, &stamp) {
            Ok(()) => {}
            Err(TreeError::Collision(collision)) => {
                warn!(target: "wisp.dispatch", %path, error = %collision, "widget id collision");
                return Err(collision.into());
            }
            Err(err) => {
                warn!(target: "wisp.dispatch", %path, error = %err, "stale UI delta");
                return Ok(DispatchOutcome::StaleUi(err));
            }
        }

        if let Some(form) = form_block {
            state.forms.register_form(&form.form_id, FormConfig::from(&form));
        }
        let widget_errors = match hydrate {
            Some(widget) => hydrate_widget(state, widget, fragment_id),
            None => Vec::new(),
        };
        Ok(DispatchOutcome::Applied { widget_errors })
    }

    fn finish_run(&mut self, state: &mut SessionState, finished: ScriptFinished) -> DispatchOutcome {
        let ScriptFinished {
            script_run_id,
            status,
        } = finished;
        if self.cancelled_runs.remove(&script_run_id) {
            debug!(target: "wisp.dispatch", run = %script_run_id, "finish of stopped run discarded");
            return DispatchOutcome::Discarded(DiscardReason::CancelledRun(script_run_id));
        }
        if script_run_id != self.current_run {
            debug!(target: "wisp.dispatch", run = %script_run_id, "finish of old run discarded");
            return DispatchOutcome::Discarded(DiscardReason::NotCurrentRun(script_run_id));
        }
        self.script_running = false;

        let mut summary = RunSummary {
            script_run_id,
            status,
            stale_nodes_removed: 0,
            reconcile: None,
            form_warnings: Vec::new(),
            next_rerun_sent: false,
        };

        if status.is_success() {
            if self.clear_stale {
                let fragments = (status == ScriptFinishedStatus::FragmentSuccess
                    && !self.fragment_ids_this_run.is_empty())
                .then_some(self.fragment_ids_this_run.as_slice());
                summary.stale_nodes_removed =
                    state.tree.clear_stale_nodes(&summary.script_run_id, fragments);
            }
            summary.form_warnings = state.forms.set_submit_counts(&state.tree.form_submit_counts());

            let report = state.store.reconcile(&state.tree.widget_ids());
            for id in &report.deleted {
                state.forms.unsubscribe_widget(id);
            }
            summary.reconcile = Some(report);
        }

        summary.next_rerun_sent = state.complete_rerun(&summary.script_run_id);
        info!(
            target: "wisp.dispatch",
            run = %summary.script_run_id,
            ?status,
            stale_nodes_removed = summary.stale_nodes_removed,
            next_rerun_sent = summary.next_rerun_sent,
            "script run finished"
        );
        DispatchOutcome::RunFinished(summary)
    }

    fn session_event(&mut self, state: &mut SessionState, event: SessionEvent) -> DispatchOutcome {
        match event {
            SessionEvent::ScriptChangedOnDisk => DispatchOutcome::ScriptChangedOnDisk,
            SessionEvent::ScriptCompilationError(message) => {
                warn!(target: "wisp.dispatch", %message, "script compilation error");
                DispatchOutcome::CompilationError(message)
            }
            SessionEvent::SessionEnded => {
                self.reset(state);
                DispatchOutcome::SessionEnded
            }
        }
    }
}

/// Bind a freshly mounted widget and apply its default and forced values.
fn hydrate_widget(
    state: &mut SessionState,
    widget: WidgetSpec,
    fragment_id: Option<FragmentId>,
) -> Vec<KindMismatchError> {
    let WidgetSpec {
        id,
        form_id,
        default,
        forced,
    } = widget;
    let mut errors = Vec::new();
    state.store.bind(&id, form_id.clone(), fragment_id);

    if let Some(value) = default.clone()
        && let Err(err) = state.store.set_value(&id, value, WriteSource::BackendHydration)
    {
        warn!(target: "wisp.store", error = %err, "hydration kind mismatch");
        errors.push(err);
    }
    if let Some(value) = forced
        && let Err(err) = state.store.force_value(&id, value)
    {
        warn!(target: "wisp.store", error = %err, "forced value kind mismatch");
        errors.push(err);
    }
    if let Some(form_id) = form_id {
        state.forms.subscribe(
            &form_id,
            &id,
            Box::new(move |_: &FormCleared| default.clone()),
        );
    }
    errors
}
