#![forbid(unsafe_code)]

//! Form coordination: buffering state, submit validation, and clear
//! broadcasts.
//!
//! # Design
//!
//! Widgets inside a form do not trigger reruns on change. The store holds
//! their edits in its uncommitted layer; the [`FormCoordinator`] tracks
//! which forms have pending edits, how many submit buttons each form has,
//! and the uploads still in flight.
//!
//! Clear listeners are keyed by `(form, widget)`, so subscribing twice
//! replaces the first listener and the form never holds a stale callback.
//!
//! # Invariants
//!
//! 1. A form is registered iff it appeared in the tree or has pending edits.
//! 2. `check_submit` fails for a form with zero submit buttons or with
//!    uploads in progress.
//! 3. `broadcast_clear` visits listeners in widget id order.

use std::collections::BTreeMap;
use std::fmt;

use tracing::{debug, warn};
use wisp_core::{FormBlock, FormId, WidgetId, WidgetValue};

use crate::error::{FormError, UnregisteredFormSubmitError};

/// Per-form behavior flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormConfig {
    /// Reset member widgets to their defaults after a successful submit.
    pub clear_on_submit: bool,
    /// Pressing Enter in a text input submits the form.
    pub enter_to_submit: bool,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            clear_on_submit: false,
            enter_to_submit: true,
        }
    }
}

impl From<&FormBlock> for FormConfig {
    fn from(block: &FormBlock) -> Self {
        Self {
            clear_on_submit: block.clear_on_submit,
            enter_to_submit: block.enter_to_submit,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormState {
    pub form_id: FormId,
    pub has_pending_changes: bool,
    pub submit_button_count: usize,
    pub uploads_in_progress: usize,
    pub config: FormConfig,
}

impl FormState {
    fn new(form_id: FormId, config: FormConfig) -> Self {
        Self {
            form_id,
            has_pending_changes: false,
            submit_button_count: 0,
            uploads_in_progress: 0,
            config,
        }
    }
}

/// Passed to clear listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormCleared {
    pub form_id: FormId,
    pub widget_id: WidgetId,
}

/// Returns the value the widget resets to, or `None` to leave it as is.
pub type ClearListener = Box<dyn FnMut(&FormCleared) -> Option<WidgetValue>>;

/// A validated submit, returned by [`FormCoordinator::check_submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitPlan {
    pub clear_on_submit: bool,
}

#[derive(Default)]
pub struct FormCoordinator {
    forms: BTreeMap<FormId, FormState>,
    listeners: BTreeMap<(FormId, WidgetId), ClearListener>,
}

impl fmt::Debug for FormCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FormCoordinator")
            .field("forms", &self.forms)
            .field("listener_count", &self.listeners.len())
            .finish()
    }
}

impl FormCoordinator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a form or refresh its config.
    pub fn register_form(&mut self, form_id: &FormId, config: FormConfig) {
        self.forms
            .entry(form_id.clone())
            .and_modify(|state| state.config = config)
            .or_insert_with(|| FormState::new(form_id.clone(), config));
    }

    #[must_use]
    pub fn state(&self, form_id: &FormId) -> Option<&FormState> {
        self.forms.get(form_id)
    }

    /// Whether edits to members of `form_id` are held until submit.
    #[must_use]
    pub fn is_form_buffering(&self, form_id: &FormId) -> bool {
        self.forms.contains_key(form_id)
    }

    /// Record a buffered edit.
    pub fn mark_pending(&mut self, form_id: &FormId) {
        self.forms
            .entry(form_id.clone())
            .or_insert_with(|| FormState::new(form_id.clone(), FormConfig::default()))
            .has_pending_changes = true;
    }

    /// Sync submit-button counts from the tree.
    ///
    /// Forms missing from `counts` are dropped unless they hold pending
    /// edits. Returns a warning for every form with no submit button.
    pub fn set_submit_counts(
        &mut self,
        counts: &BTreeMap<FormId, usize>,
    ) -> Vec<UnregisteredFormSubmitError> {
        self.forms
            .retain(|id, state| counts.contains_key(id) || state.has_pending_changes);
        let mut warnings = Vec::new();
        for (form_id, &count) in counts {
            let state = self
                .forms
                .entry(form_id.clone())
                .or_insert_with(|| FormState::new(form_id.clone(), FormConfig::default()));
            state.submit_button_count = count;
            if count == 0 {
                warn!(target: "wisp.forms", form = %form_id, "form has no submit button");
                warnings.push(UnregisteredFormSubmitError {
                    form_id: form_id.clone(),
                });
            }
        }
        warnings
    }

    pub fn begin_upload(&mut self, form_id: &FormId) {
        if let Some(state) = self.forms.get_mut(form_id) {
            state.uploads_in_progress += 1;
        }
    }

    pub fn finish_upload(&mut self, form_id: &FormId) {
        if let Some(state) = self.forms.get_mut(form_id) {
            state.uploads_in_progress = state.uploads_in_progress.saturating_sub(1);
        }
    }

    /// Validate a submit of `form_id`.
    pub fn check_submit(&self, form_id: &FormId) -> Result<SubmitPlan, FormError> {
        let state = self
            .forms
            .get(form_id)
            .ok_or_else(|| FormError::UnknownForm(form_id.clone()))?;
        if state.submit_button_count == 0 {
            return Err(FormError::NoSubmitTrigger(UnregisteredFormSubmitError {
                form_id: form_id.clone(),
            }));
        }
        if state.uploads_in_progress > 0 {
            return Err(FormError::UploadsInProgress {
                form_id: form_id.clone(),
                count: state.uploads_in_progress,
            });
        }
        Ok(SubmitPlan {
            clear_on_submit: state.config.clear_on_submit,
        })
    }

    /// Mark a submit as sent: pending edits are now committed.
    pub fn finish_submit(&mut self, form_id: &FormId) {
        if let Some(state) = self.forms.get_mut(form_id) {
            state.has_pending_changes = false;
        }
        debug!(target: "wisp.forms", form = %form_id, "form submitted");
    }

    /// Install the clear listener for a widget, replacing any previous one.
    pub fn subscribe(&mut self, form_id: &FormId, widget_id: &WidgetId, listener: ClearListener) {
        self.listeners
            .insert((form_id.clone(), widget_id.clone()), listener);
    }

    /// Returns whether a listener was removed.
    pub fn unsubscribe(&mut self, form_id: &FormId, widget_id: &WidgetId) -> bool {
        self.listeners
            .remove(&(form_id.clone(), widget_id.clone()))
            .is_some()
    }

    /// Remove a widget's listener from every form.
    pub fn unsubscribe_widget(&mut self, widget_id: &WidgetId) -> usize {
        let before = self.listeners.len();
        self.listeners.retain(|(_, id), _| id != widget_id);
        before - self.listeners.len()
    }

    #[must_use]
    pub fn listener_count(&self, form_id: &FormId) -> usize {
        self.listeners.keys().filter(|(f, _)| f == form_id).count()
    }

    /// Call every clear listener of `form_id`; returns the resets to apply.
    pub fn broadcast_clear(&mut self, form_id: &FormId) -> Vec<(WidgetId, WidgetValue)> {
        let mut resets = Vec::new();
        for ((form, widget_id), listener) in self.listeners.iter_mut() {
            if form != form_id {
                continue;
            }
            let event = FormCleared {
                form_id: form.clone(),
                widget_id: widget_id.clone(),
            };
            if let Some(value) = listener(&event) {
                resets.push((widget_id.clone(), value));
            }
        }
        if let Some(state) = self.forms.get_mut(form_id) {
            state.has_pending_changes = false;
        }
        debug!(target: "wisp.forms", form = %form_id, resets = resets.len(), "form cleared");
        resets
    }

    pub fn clear(&mut self) {
        self.forms.clear();
        self.listeners.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    fn form(id: &str) -> FormId {
        FormId::new(id)
    }

    fn counts(entries: &[(&str, usize)]) -> BTreeMap<FormId, usize> {
        entries.iter().map(|(f, n)| (form(f), *n)).collect()
    }

    #[test]
    fn missing_submit_button_warns_and_blocks_submit() {
        let mut forms = FormCoordinator::new();
        let warnings = forms.set_submit_counts(&counts(&[("f", 0)]));
        assert_eq!(warnings, vec![UnregisteredFormSubmitError { form_id: form("f") }]);
        assert!(matches!(
            forms.check_submit(&form("f")),
            Err(FormError::NoSubmitTrigger(_))
        ));
    }

    #[test]
    fn uploads_block_submit() {
        let mut forms = FormCoordinator::new();
        forms.set_submit_counts(&counts(&[("f", 1)]));
        forms.begin_upload(&form("f"));
        assert_eq!(
            forms.check_submit(&form("f")),
            Err(FormError::UploadsInProgress { form_id: form("f"), count: 1 })
        );
        forms.finish_upload(&form("f"));
        assert_eq!(
            forms.check_submit(&form("f")),
            Ok(SubmitPlan { clear_on_submit: false })
        );
    }

    #[test]
    fn unknown_form() {
        let forms = FormCoordinator::new();
        assert_eq!(
            forms.check_submit(&form("nope")),
            Err(FormError::UnknownForm(form("nope")))
        );
    }

    #[test]
    fn absent_forms_dropped_unless_pending() {
        let mut forms = FormCoordinator::new();
        forms.set_submit_counts(&counts(&[("a", 1), ("b", 1)]));
        forms.mark_pending(&form("a"));
        forms.set_submit_counts(&counts(&[]));
        assert!(forms.is_form_buffering(&form("a")));
        assert!(!forms.is_form_buffering(&form("b")));
    }

    #[test]
    fn subscribe_is_idempotent() {
        let mut forms = FormCoordinator::new();
        let calls = Rc::new(Cell::new(0));
        for _ in 0..3 {
            let calls = Rc::clone(&calls);
            forms.subscribe(
                &form("f"),
                &WidgetId::new("w"),
                Box::new(move |_: &FormCleared| {
                    calls.set(calls.get() + 1);
                    Some(WidgetValue::Int(0))
                }),
            );
        }
        assert_eq!(forms.listener_count(&form("f")), 1);
        let resets = forms.broadcast_clear(&form("f"));
        assert_eq!(resets, vec![(WidgetId::new("w"), WidgetValue::Int(0))]);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn broadcast_only_reaches_target_form() {
        let mut forms = FormCoordinator::new();
        forms.subscribe(&form("a"), &WidgetId::new("x"), Box::new(|_: &FormCleared| Some(WidgetValue::Bool(false))));
        forms.subscribe(&form("b"), &WidgetId::new("y"), Box::new(|_: &FormCleared| Some(WidgetValue::Bool(false))));
        forms.subscribe(&form("a"), &WidgetId::new("z"), Box::new(|_: &FormCleared| None));
        let resets = forms.broadcast_clear(&form("a"));
        assert_eq!(resets, vec![(WidgetId::new("x"), WidgetValue::Bool(false))]);
    }

    #[test]
    fn unsubscribe_widget_removes_all_forms() {
        let mut forms = FormCoordinator::new();
        forms.subscribe(&form("a"), &WidgetId::new("x"), Box::new(|_: &FormCleared| None));
        forms.subscribe(&form("b"), &WidgetId::new("x"), Box::new(|_: &FormCleared| None));
        assert_eq!(forms.unsubscribe_widget(&WidgetId::new("x")), 2);
        assert!(!forms.unsubscribe(&form("a"), &WidgetId::new("x")));
    }

    #[test]
    fn config_from_block() {
        let mut block = FormBlock::new(form("f"));
        block.clear_on_submit = true;
        let config = FormConfig::from(&block);
        assert!(config.clear_on_submit);
        assert!(config.enter_to_submit);
    }
}
