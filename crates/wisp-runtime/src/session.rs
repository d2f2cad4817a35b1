#![forbid(unsafe_code)]

//! Session-scoped owner of the reconciliation state.
//!
//! An [`AppSession`] is created per browser session and passed by reference
//! to everything that needs widget state; nothing here is global. The host
//! drives it from its event loop:
//!
//! 1. inbound messages go to [`AppSession::handle_message`];
//! 2. widget components write through [`AppSession::set_value`] (or a
//!    [`WidgetHandle`]);
//! 3. at the end of each event-loop task the host calls
//!    [`AppSession::end_of_task`] and sends whatever
//!    [`AppSession::drain_outbound`] returns.
//!
//! Every change made within one task therefore reaches the backend as a
//! single rerun request.

use std::collections::BTreeMap;

use tracing::{debug, warn};
use wisp_core::{
    BackMsg, ElementTree, FormId, FragmentId, FromWidgetValue, IndexedMessage, KindMismatchError,
    RerunRequest, ScriptRunId, TreeError, ValueKind, WidgetId, WidgetValue,
};

use crate::config::{ConfigError, RuntimeConfig};
use crate::dispatcher::{DispatchOutcome, Dispatcher, SessionPhase};
use crate::error::{FormError, UnregisteredFormSubmitError, WispError};
use crate::forms::{ClearListener, FormCleared, FormCoordinator};
use crate::rerun_queue::{QueueState, RerunQueue};
use crate::store::{WidgetStateStore, WriteOutcome, WriteSource};

/// Page context sent with every rerun.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageContext {
    pub query_params: BTreeMap<String, String>,
    pub page_script_hash: String,
}

/// The mutable state a session owns.
#[derive(Debug)]
pub struct SessionState {
    pub tree: ElementTree,
    pub store: WidgetStateStore,
    pub forms: FormCoordinator,
    pub queue: RerunQueue,
    pub context: PageContext,
    /// Forms submitted with `clear_on_submit`, cleared once their rerun is sent.
    clear_after_send: Vec<FormId>,
}

impl SessionState {
    #[must_use]
    pub fn new(config: &RuntimeConfig) -> Self {
        Self {
            tree: ElementTree::new(),
            store: WidgetStateStore::new(config.orphan_grace_reruns),
            forms: FormCoordinator::new(),
            queue: RerunQueue::new(config.widen_conflicting_fragment_reruns),
            context: PageContext::default(),
            clear_after_send: Vec::new(),
        }
    }

    /// Send the pending rerun if nothing is in flight.
    pub(crate) fn flush_rerun(&mut self) -> bool {
        let Self {
            store,
            queue,
            context,
            ..
        } = self;
        let sent = queue.flush(|fragment_id| build_rerun(store, context, fragment_id));
        if sent {
            self.clear_submitted_forms();
        }
        sent
    }

    /// `run` finished; send the deferred rerun if `run` served the one in
    /// flight.
    pub(crate) fn complete_rerun(&mut self, run: &ScriptRunId) -> bool {
        let Self {
            store,
            queue,
            context,
            ..
        } = self;
        let sent = queue.complete(run, |fragment_id| build_rerun(store, context, fragment_id));
        if sent {
            self.clear_submitted_forms();
        }
        sent
    }

    /// Broadcast a clear to every widget of `form_id`. Returns the number of
    /// widgets reset.
    pub(crate) fn clear_form(&mut self, form_id: &FormId) -> usize {
        let resets = self.forms.broadcast_clear(form_id);
        let count = resets.len();
        for (id, value) in resets {
            self.store.reset_value(&id, value);
        }
        count
    }

    fn clear_submitted_forms(&mut self) {
        for form_id in std::mem::take(&mut self.clear_after_send) {
            self.clear_form(&form_id);
        }
    }

    /// Forget everything except the query parameters, which belong to the
    /// page rather than the session.
    pub(crate) fn reset(&mut self) {
        self.tree.clear();
        self.store.clear();
        self.forms.clear();
        self.queue.reset();
        self.clear_after_send.clear();
        self.context.page_script_hash.clear();
    }
}

/// The request for a rerun sent now: committed values at this moment.
/// Fired triggers go idle once they are in a request.
fn build_rerun(
    store: &mut WidgetStateStore,
    context: &PageContext,
    fragment_id: Option<FragmentId>,
) -> RerunRequest {
    let request = RerunRequest {
        widget_states: store.snapshot(),
        query_params: context.query_params.clone(),
        page_script_hash: context.page_script_hash.clone(),
        fragment_id,
    };
    store.mark_sent();
    request
}

/// Something the host should show the user or developer.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionNotice {
    /// A delta could not be applied; the UI may be out of date.
    StaleUi(TreeError),
    /// The session can no longer be trusted; ask the user to reload.
    PleaseRefresh(WispError),
    ScriptChanged,
    CompilationError(String),
    FormWarning(UnregisteredFormSubmitError),
    /// Inline error for one widget.
    WidgetError(KindMismatchError),
    /// Visible exception banner, e.g. a widget id collision.
    Exception(WispError),
}

/// The boundary a widget component implements to take part in
/// reconciliation.
pub trait WidgetComponent {
    fn widget_id(&self) -> &WidgetId;

    /// The type-correct value the widget starts at and resets to.
    fn default_value(&self) -> WidgetValue;

    fn form_id(&self) -> Option<&FormId> {
        None
    }
}

#[derive(Debug)]
pub struct AppSession {
    config: RuntimeConfig,
    dispatcher: Dispatcher,
    state: SessionState,
    notices: Vec<SessionNotice>,
}

impl Default for AppSession {
    fn default() -> Self {
        Self::new(RuntimeConfig::default())
    }
}

impl AppSession {
    /// Create a session. Out-of-range values are raised to their minimum
    /// with a warning; use [`try_new`](Self::try_new) to reject them.
    #[must_use]
    pub fn new(config: RuntimeConfig) -> Self {
        for problem in config.validate() {
            warn!(target: "wisp.config", %problem, "config value raised to its minimum");
        }
        Self::with_config(config.normalized())
    }

    /// Create a session, rejecting an invalid config.
    ///
    /// # Errors
    ///
    /// [`ConfigError::Validation`] listing every out-of-range value.
    pub fn try_new(config: RuntimeConfig) -> Result<Self, ConfigError> {
        let problems = config.validate();
        if problems.is_empty() {
            Ok(Self::with_config(config))
        } else {
            Err(ConfigError::Validation(problems))
        }
    }

    fn with_config(config: RuntimeConfig) -> Self {
        Self {
            dispatcher: Dispatcher::new(&config),
            state: SessionState::new(&config),
            config,
            notices: Vec::new(),
        }
    }

    #[must_use]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.dispatcher.phase()
    }

    #[must_use]
    pub fn tree(&self) -> &ElementTree {
        &self.state.tree
    }

    #[must_use]
    pub fn store(&self) -> &WidgetStateStore {
        &self.state.store
    }

    #[must_use]
    pub fn forms(&self) -> &FormCoordinator {
        &self.state.forms
    }

    #[must_use]
    pub fn queue_state(&self) -> QueueState {
        self.state.queue.state()
    }

    #[must_use]
    pub fn context(&self) -> &PageContext {
        &self.state.context
    }

    /// Route one inbound message. Errors are also recorded as notices.
    pub fn handle_message(&mut self, message: IndexedMessage) -> Result<DispatchOutcome, WispError> {
        let result = self.dispatcher.handle(&mut self.state, message);
        match &result {
            Ok(DispatchOutcome::StaleUi(err)) => {
                self.notices.push(SessionNotice::StaleUi(err.clone()));
            }
            Ok(DispatchOutcome::Applied { widget_errors }) => {
                self.notices
                    .extend(widget_errors.iter().cloned().map(SessionNotice::WidgetError));
            }
            Ok(DispatchOutcome::RunFinished(summary)) => {
                self.notices
                    .extend(summary.form_warnings.iter().cloned().map(SessionNotice::FormWarning));
            }
            Ok(DispatchOutcome::ScriptChangedOnDisk) => {
                self.notices.push(SessionNotice::ScriptChanged);
            }
            Ok(DispatchOutcome::CompilationError(message)) => {
                self.notices
                    .push(SessionNotice::CompilationError(message.clone()));
            }
            Ok(_) => {}
            Err(err) if err.requires_reload() => {
                self.notices.push(SessionNotice::PleaseRefresh(err.clone()));
            }
            Err(err) => self.notices.push(SessionNotice::Exception(err.clone())),
        }
        result
    }

    /// Read a widget value, checked against `expected`.
    pub fn get_value(
        &self,
        id: &WidgetId,
        expected: ValueKind,
    ) -> Result<Option<&WidgetValue>, KindMismatchError> {
        self.state.store.get_value(id, expected)
    }

    pub fn get<T: FromWidgetValue>(&self, id: &WidgetId) -> Result<Option<T>, KindMismatchError> {
        self.state.store.get(id)
    }

    /// Apply a user edit. Outside a form this queues a rerun.
    pub fn set_value(
        &mut self,
        id: &WidgetId,
        value: WidgetValue,
    ) -> Result<WriteOutcome, KindMismatchError> {
        let outcome = self
            .state
            .store
            .set_value(id, value, WriteSource::UserAction)?;
        match &outcome {
            WriteOutcome::Committed {
                rerun: true,
                fragment,
            } => self.request_rerun(fragment.clone()),
            WriteOutcome::Buffered { form_id } => self.state.forms.mark_pending(form_id),
            _ => {}
        }
        Ok(outcome)
    }

    /// Queue a rerun. Its widget values are read when it is sent.
    ///
    /// `fragment` scopes the rerun; `None` reruns the whole script.
    pub fn request_rerun(&mut self, fragment: Option<FragmentId>) {
        self.state.queue.request(fragment);
    }

    /// Submit a form through one of its submit buttons: every buffered
    /// value is committed and exactly one rerun is queued.
    ///
    /// Nothing is committed unless the submit is valid: the form must have a
    /// submit button and no uploads in progress, and `button` must be a
    /// trigger bound to `form_id`.
    pub fn submit_form(&mut self, form_id: &FormId, button: &WidgetId) -> Result<(), WispError> {
        let counts = self.state.tree.form_submit_counts();
        if counts.contains_key(form_id) {
            self.state.forms.set_submit_counts(&counts);
        }
        let plan = self.state.forms.check_submit(form_id)?;
        if self.state.store.form_of(button) != Some(form_id) {
            return Err(FormError::ForeignSubmitButton {
                form_id: form_id.clone(),
                button: button.clone(),
            }
            .into());
        }
        self.state.store.check_trigger(button)?;

        let committed = self.state.store.commit_form(form_id);
        self.state.store.fire_trigger(button)?;
        let fragment = self.state.store.fragment_of(button).cloned();
        self.request_rerun(fragment);
        self.state.forms.finish_submit(form_id);
        debug!(
            target: "wisp.forms",
            form = %form_id,
            committed = committed.len(),
            "form submit queued"
        );

        if plan.clear_on_submit && !self.state.clear_after_send.contains(form_id) {
            self.state.clear_after_send.push(form_id.clone());
        }
        Ok(())
    }

    /// Broadcast a clear to every widget of `form_id`; each listener
    /// decides its own reset value. Returns the number of widgets reset.
    pub fn clear_form(&mut self, form_id: &FormId) -> usize {
        self.state.clear_form(form_id)
    }

    /// Register a mounted widget component and hydrate its default.
    pub fn mount(
        &mut self,
        component: &dyn WidgetComponent,
    ) -> Result<WriteOutcome, KindMismatchError> {
        let id = component.widget_id().clone();
        let form_id = component.form_id().cloned();
        let fragment = self.state.store.fragment_of(&id).cloned();
        self.state.store.bind(&id, form_id.clone(), fragment);
        let default = component.default_value();
        let outcome = self
            .state
            .store
            .set_value(&id, default.clone(), WriteSource::BackendHydration)?;
        if let Some(form_id) = form_id {
            self.state
                .forms
                .subscribe(&form_id, &id, Box::new(move |_: &FormCleared| Some(default.clone())));
        }
        Ok(outcome)
    }

    /// Drop a component's clear listener. Its value stays until reconcile.
    pub fn unmount(&mut self, component: &dyn WidgetComponent) {
        if let Some(form_id) = component.form_id() {
            self.state.forms.unsubscribe(form_id, component.widget_id());
        }
    }

    /// The capability a single widget uses to read and write its own value.
    pub fn widget(&mut self, id: WidgetId) -> WidgetHandle<'_> {
        WidgetHandle { session: self, id }
    }

    /// Stop the current run. Client state rolls back at once; a late
    /// `ScriptFinished` for the stopped run is discarded.
    pub fn stop_script(&mut self) {
        let running = self.dispatcher.script_running();
        self.state.queue.stop(running);
        self.state.clear_after_send.clear();
        self.dispatcher.cancel_current_run();
    }

    /// Flush the rerun queue. Call once at the end of every event-loop task.
    pub fn end_of_task(&mut self) -> bool {
        self.state.flush_rerun()
    }

    pub fn drain_outbound(&mut self) -> Vec<BackMsg> {
        self.state.queue.drain_outbox()
    }

    /// Queue a file upload for `widget_id`. A form owning the widget
    /// cannot be submitted until [`upload_finished`](Self::upload_finished).
    pub fn upload_file(&mut self, widget_id: &WidgetId, bytes: Vec<u8>) {
        if let Some(form_id) = self.state.store.form_of(widget_id).cloned() {
            self.state.forms.begin_upload(&form_id);
        }
        self.state.queue.push_message(BackMsg::FileUpload {
            widget_id: widget_id.clone(),
            bytes,
        });
    }

    pub fn upload_finished(&mut self, widget_id: &WidgetId) {
        match self.state.store.form_of(widget_id).cloned() {
            Some(form_id) => self.state.forms.finish_upload(&form_id),
            None => warn!(target: "wisp.forms", widget = %widget_id, "upload finished outside a form"),
        }
    }

    pub fn set_query_params(&mut self, query_params: BTreeMap<String, String>) {
        self.state.context.query_params = query_params;
    }

    pub fn take_notices(&mut self) -> Vec<SessionNotice> {
        std::mem::take(&mut self.notices)
    }
}

/// Scoped access to one widget's value.
///
/// Components hold a handle for their own id only, so they cannot touch
/// other widgets' state.
pub struct WidgetHandle<'a> {
    session: &'a mut AppSession,
    id: WidgetId,
}

impl WidgetHandle<'_> {
    #[must_use]
    pub fn id(&self) -> &WidgetId {
        &self.id
    }

    pub fn get<T: FromWidgetValue>(&self) -> Result<Option<T>, KindMismatchError> {
        self.session.get(&self.id)
    }

    pub fn set(&mut self, value: impl FromWidgetValue) -> Result<WriteOutcome, KindMismatchError> {
        self.session.set_value(&self.id, value.into_widget_value())
    }

    pub fn set_value(&mut self, value: WidgetValue) -> Result<WriteOutcome, KindMismatchError> {
        self.session.set_value(&self.id, value)
    }

    /// Install this widget's clear listener for `form_id`.
    pub fn on_form_cleared(&mut self, form_id: &FormId, listener: ClearListener) {
        self.session
            .state
            .forms
            .subscribe(form_id, &self.id, listener);
    }
}
