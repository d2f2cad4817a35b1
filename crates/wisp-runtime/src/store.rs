#![forbid(unsafe_code)]

//! Widget State Store: the session's single source of truth for widget values.
//!
//! # Design
//!
//! Each entry keeps two values:
//!
//! - `value`: what the widget shows and what reads return, including writes
//!   buffered by an unsubmitted form;
//! - `committed`: what the backend sees in the next rerun request.
//!
//! Writes outside a form update both. User writes to a form member update
//! only `value` until the form is submitted ([`WidgetStateStore::commit_form`]).
//!
//! # Write rules
//!
//! | source              | rule                                                            |
//! |---------------------|-----------------------------------------------------------------|
//! | `UserAction`        | always applied; outside a form the caller must request a rerun  |
//! | `BackendHydration`  | mount-time default; ignored over a user-chosen value and while a user action is pending |
//! | `force_value`       | script-assigned value; ignored only while a user action is pending |
//!
//! A user action stays pending until the next [`reconcile`](WidgetStateStore::reconcile):
//! the backend computed its hydration values from pre-interaction state, so
//! the interaction wins.
//!
//! # Orphans
//!
//! `reconcile` marks entries whose id is absent from the current tree as
//! orphaned instead of deleting them. An orphan is deleted once it has been
//! absent for more than `grace` consecutive reconciles (default 1), so a
//! widget hidden for exactly one rerun comes back with its value while a
//! widget gone for longer leaves nothing behind for a future widget reusing
//! its id.

use std::collections::BTreeSet;

use ahash::AHashMap;
use tracing::{debug, debug_span};
use web_time::Instant;
use wisp_core::{
    FormId, FragmentId, FromWidgetValue, KindMismatchError, ValueKind, WidgetId, WidgetState,
    WidgetValue,
};

/// Who produced a write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSource {
    UserAction,
    BackendHydration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Hydrated,
    Forced,
    User,
}

#[derive(Debug, Clone)]
struct Entry {
    value: WidgetValue,
    committed: Option<WidgetValue>,
    origin: Origin,
    /// A user action landed since the last reconcile.
    pending_user: bool,
    /// Consecutive reconciles the id was absent from the tree.
    absent_reruns: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Binding {
    form: Option<FormId>,
    fragment: Option<FragmentId>,
}

/// What a write did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Visible to the backend. `rerun` is true for user actions, which must
    /// be followed by a rerun request scoped to `fragment`.
    Committed {
        rerun: bool,
        fragment: Option<FragmentId>,
    },
    /// Held in the widget's form until submit.
    Buffered { form_id: FormId },
    Ignored(IgnoredWrite),
}

/// Why a backend write was not applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IgnoredWrite {
    /// A user action for this widget is pending reconciliation.
    PendingUserAction,
    /// The widget holds a user-chosen value; mount defaults never replace it.
    UserValueRetained,
}

/// Result of one [`WidgetStateStore::reconcile`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub retained: usize,
    /// Orphans whose id reappeared.
    pub revived: Vec<WidgetId>,
    /// Entries newly marked orphaned.
    pub orphaned: Vec<WidgetId>,
    pub deleted: Vec<WidgetId>,
}

/// Authoritative client-side widget values for one session.
#[derive(Debug, Clone)]
pub struct WidgetStateStore {
    entries: AHashMap<WidgetId, Entry>,
    bindings: AHashMap<WidgetId, Binding>,
    grace: u32,
    reconciles: u64,
}

impl Default for WidgetStateStore {
    fn default() -> Self {
        Self::new(1)
    }
}

impl WidgetStateStore {
    /// Create a store whose orphans survive `grace` absent reconciles.
    #[must_use]
    pub fn new(grace: u32) -> Self {
        Self {
            entries: AHashMap::new(),
            bindings: AHashMap::new(),
            grace,
            reconciles: 0,
        }
    }

    /// Record which form and fragment a widget belongs to.
    pub fn bind(&mut self, id: &WidgetId, form: Option<FormId>, fragment: Option<FragmentId>) {
        self.bindings.insert(id.clone(), Binding { form, fragment });
    }

    #[must_use]
    pub fn form_of(&self, id: &WidgetId) -> Option<&FormId> {
        self.bindings.get(id).and_then(|b| b.form.as_ref())
    }

    #[must_use]
    pub fn fragment_of(&self, id: &WidgetId) -> Option<&FragmentId> {
        self.bindings.get(id).and_then(|b| b.fragment.as_ref())
    }

    /// Ids bound to `form_id`, sorted.
    #[must_use]
    pub fn form_members(&self, form_id: &FormId) -> Vec<WidgetId> {
        let mut ids: Vec<WidgetId> = self
            .bindings
            .iter()
            .filter(|(_, b)| b.form.as_ref() == Some(form_id))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Read a widget's current value, checked against `expected`.
    ///
    /// `Ok(None)` means no value is set.
    pub fn get_value(
        &self,
        id: &WidgetId,
        expected: ValueKind,
    ) -> Result<Option<&WidgetValue>, KindMismatchError> {
        match self.entries.get(id) {
            Some(entry) => entry.value.expect_kind(id, expected).map(Some),
            None => Ok(None),
        }
    }

    /// Typed read.
    pub fn get<T: FromWidgetValue>(&self, id: &WidgetId) -> Result<Option<T>, KindMismatchError> {
        Ok(self
            .get_value(id, T::KIND)?
            .and_then(T::from_widget_value))
    }

    /// The value the backend will see, if any.
    #[must_use]
    pub fn committed(&self, id: &WidgetId) -> Option<&WidgetValue> {
        self.entries.get(id).and_then(|e| e.committed.as_ref())
    }

    /// Write a widget value.
    ///
    /// Fails if a live entry holds a different kind. An orphaned entry of a
    /// different kind is stale and is replaced.
    pub fn set_value(
        &mut self,
        id: &WidgetId,
        value: WidgetValue,
        source: WriteSource,
    ) -> Result<WriteOutcome, KindMismatchError> {
        self.check_kind(id, &value)?;
        let outcome = match source {
            WriteSource::UserAction => self.write_user(id, value),
            WriteSource::BackendHydration => self.write_backend(id, value, Origin::Hydrated),
        };
        debug!(target: "wisp.store", widget = %id, ?source, ?outcome, "set_value");
        Ok(outcome)
    }

    /// Apply a value the script assigned to the widget.
    pub fn force_value(
        &mut self,
        id: &WidgetId,
        value: WidgetValue,
    ) -> Result<WriteOutcome, KindMismatchError> {
        self.check_kind(id, &value)?;
        let outcome = self.write_backend(id, value, Origin::Forced);
        debug!(target: "wisp.store", widget = %id, ?outcome, "force_value");
        Ok(outcome)
    }

    /// Fire a trigger and commit it directly, bypassing any form buffer.
    ///
    /// Used for form submit buttons, whose click is the submit itself.
    pub fn fire_trigger(&mut self, id: &WidgetId) -> Result<(), KindMismatchError> {
        self.check_trigger(id)?;
        let value = WidgetValue::Trigger(true);
        self.upsert(id, value, Origin::User, true);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.pending_user = true;
        }
        Ok(())
    }

    /// Reset a widget to `value` in both layers (form clear).
    pub fn reset_value(&mut self, id: &WidgetId, value: WidgetValue) {
        self.upsert(id, value, Origin::Hydrated, true);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.pending_user = false;
        }
    }

    /// Whether [`fire_trigger`](Self::fire_trigger) would accept `id`.
    pub fn check_trigger(&self, id: &WidgetId) -> Result<(), KindMismatchError> {
        self.check_kind(id, &WidgetValue::Trigger(true))
    }

    fn check_kind(&self, id: &WidgetId, value: &WidgetValue) -> Result<(), KindMismatchError> {
        match self.entries.get(id) {
            Some(entry) if entry.absent_reruns == 0 && entry.value.kind() != value.kind() => {
                Err(KindMismatchError {
                    id: id.clone(),
                    expected: entry.value.kind(),
                    found: value.kind(),
                })
            }
            _ => Ok(()),
        }
    }

    fn write_user(&mut self, id: &WidgetId, value: WidgetValue) -> WriteOutcome {
        let binding = self.bindings.get(id).cloned().unwrap_or_default();
        let buffered = binding.form.is_some();
        self.upsert(id, value, Origin::User, !buffered);
        if let Some(entry) = self.entries.get_mut(id) {
            entry.pending_user = true;
        }
        match binding.form {
            Some(form_id) => WriteOutcome::Buffered { form_id },
            None => WriteOutcome::Committed {
                rerun: true,
                fragment: binding.fragment,
            },
        }
    }

    fn write_backend(&mut self, id: &WidgetId, value: WidgetValue, origin: Origin) -> WriteOutcome {
        if let Some(entry) = self.entries.get(id)
            && entry.value.kind() == value.kind()
        {
            if entry.pending_user {
                return WriteOutcome::Ignored(IgnoredWrite::PendingUserAction);
            }
            if origin == Origin::Hydrated && entry.origin == Origin::User {
                return WriteOutcome::Ignored(IgnoredWrite::UserValueRetained);
            }
        }
        self.upsert(id, value, origin, true);
        WriteOutcome::Committed {
            rerun: false,
            fragment: self.fragment_of(id).cloned(),
        }
    }

    fn upsert(&mut self, id: &WidgetId, value: WidgetValue, origin: Origin, commit: bool) {
        match self.entries.get_mut(id) {
            Some(entry) if entry.value.kind() == value.kind() => {
                if commit {
                    entry.committed = Some(value.clone());
                }
                entry.value = value;
                entry.origin = origin;
            }
            _ => {
                let committed = commit.then(|| value.clone());
                self.entries.insert(
                    id.clone(),
                    Entry {
                        value,
                        committed,
                        origin,
                        pending_user: false,
                        absent_reruns: 0,
                    },
                );
            }
        }
    }

    /// Commit every buffered value of `form_id`. Returns the committed ids.
    pub fn commit_form(&mut self, form_id: &FormId) -> Vec<WidgetId> {
        let mut committed = Vec::new();
        for id in self.form_members(form_id) {
            if let Some(entry) = self.entries.get_mut(&id)
                && entry.committed.as_ref() != Some(&entry.value)
            {
                entry.committed = Some(entry.value.clone());
                committed.push(id);
            }
        }
        committed
    }

    /// Whether `form_id` has values not yet committed.
    #[must_use]
    pub fn has_uncommitted(&self, form_id: &FormId) -> bool {
        self.form_members(form_id).iter().any(|id| {
            self.entries
                .get(id)
                .is_some_and(|e| e.committed.as_ref() != Some(&e.value))
        })
    }

    /// Committed values, sorted by id: the widget states of a rerun request.
    #[must_use]
    pub fn snapshot(&self) -> Vec<WidgetState> {
        let mut states: Vec<WidgetState> = self
            .entries
            .iter()
            .filter_map(|(id, e)| {
                e.committed
                    .as_ref()
                    .map(|v| WidgetState::new(id.clone(), v.clone()))
            })
            .collect();
        states.sort_by(|a, b| a.id.cmp(&b.id));
        states
    }

    /// Mark the current snapshot as sent: fired triggers revert to idle.
    pub fn mark_sent(&mut self) {
        for entry in self.entries.values_mut() {
            if entry.committed.as_ref().is_some_and(WidgetValue::is_fired_trigger)
                && let Some(idle) = WidgetValue::idle_trigger(entry.value.kind())
            {
                entry.value = idle.clone();
                entry.committed = Some(idle);
            }
        }
    }

    /// Reconcile against the widget ids of a completed run.
    pub fn reconcile(&mut self, current: &BTreeSet<WidgetId>) -> ReconcileReport {
        let start = Instant::now();
        self.reconciles += 1;
        let _span = debug_span!(
            "wisp.reconcile",
            reconcile = self.reconciles,
            present = current.len(),
            retained = tracing::field::Empty,
            orphaned = tracing::field::Empty,
            deleted = tracing::field::Empty,
            duration_us = tracing::field::Empty,
        )
        .entered();

        let mut report = ReconcileReport::default();
        let grace = self.grace;
        self.entries.retain(|id, entry| {
            entry.pending_user = false;
            if current.contains(id) {
                if entry.absent_reruns > 0 {
                    report.revived.push(id.clone());
                }
                entry.absent_reruns = 0;
                report.retained += 1;
                return true;
            }
            entry.absent_reruns += 1;
            if entry.absent_reruns > grace {
                report.deleted.push(id.clone());
                false
            } else {
                if entry.absent_reruns == 1 {
                    report.orphaned.push(id.clone());
                }
                true
            }
        });
        let entries = &self.entries;
        self.bindings
            .retain(|id, _| current.contains(id) || entries.contains_key(id));

        report.revived.sort();
        report.orphaned.sort();
        report.deleted.sort();

        let span = tracing::Span::current();
        span.record("retained", report.retained);
        span.record("orphaned", report.orphaned.len());
        span.record("deleted", report.deleted.len());
        span.record("duration_us", start.elapsed().as_micros() as u64);
        debug!(
            target: "wisp.store",
            revived = ?report.revived,
            orphaned = ?report.orphaned,
            deleted = ?report.deleted,
            "reconciled widget states"
        );
        report
    }

    #[must_use]
    pub fn is_orphaned(&self, id: &WidgetId) -> bool {
        self.entries.get(id).is_some_and(|e| e.absent_reruns > 0)
    }

    #[must_use]
    pub fn contains(&self, id: &WidgetId) -> bool {
        self.entries.contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop all values and bindings (fresh session).
    pub fn clear(&mut self) {
        self.entries.clear();
        self.bindings.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> WidgetId {
        WidgetId::new(s)
    }

    fn ids(list: &[&str]) -> BTreeSet<WidgetId> {
        list.iter().map(|s| id(s)).collect()
    }

    #[test]
    fn unset_reads_none() {
        let store = WidgetStateStore::default();
        assert_eq!(store.get_value(&id("x"), ValueKind::Bool), Ok(None));
        assert_eq!(store.get::<bool>(&id("x")), Ok(None));
    }

    #[test]
    fn user_action_commits_and_requests_rerun() {
        let mut store = WidgetStateStore::default();
        let outcome = store
            .set_value(&id("cb1"), WidgetValue::Bool(true), WriteSource::UserAction)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Committed { rerun: true, fragment: None });
        assert_eq!(store.get::<bool>(&id("cb1")), Ok(Some(true)));
        assert_eq!(store.committed(&id("cb1")), Some(&WidgetValue::Bool(true)));
    }

    #[test]
    fn kind_mismatch_on_read_is_local() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("n1"), WidgetValue::Double(5.0), WriteSource::UserAction)
            .unwrap();
        store
            .set_value(&id("s1"), WidgetValue::String("ok".into()), WriteSource::UserAction)
            .unwrap();
        let err = store.get_value(&id("n1"), ValueKind::String).unwrap_err();
        assert_eq!(err.expected, ValueKind::String);
        assert_eq!(err.found, ValueKind::Double);
        assert_eq!(store.get::<String>(&id("s1")), Ok(Some("ok".to_string())));
    }

    #[test]
    fn kind_mismatch_on_live_write() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("w"), WidgetValue::Int(1), WriteSource::BackendHydration)
            .unwrap();
        let err = store
            .set_value(&id("w"), WidgetValue::Bool(true), WriteSource::UserAction)
            .unwrap_err();
        assert_eq!(err.expected, ValueKind::Int);
        assert_eq!(store.get::<i64>(&id("w")), Ok(Some(1)));
    }

    #[test]
    fn orphan_of_other_kind_is_replaced() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("w"), WidgetValue::Int(1), WriteSource::UserAction)
            .unwrap();
        store.reconcile(&ids(&[]));
        assert!(store.is_orphaned(&id("w")));
        store
            .set_value(&id("w"), WidgetValue::Bool(true), WriteSource::BackendHydration)
            .unwrap();
        assert_eq!(store.get::<bool>(&id("w")), Ok(Some(true)));
    }

    #[test]
    fn user_action_beats_later_hydration() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("s"), WidgetValue::Double(2.0), WriteSource::UserAction)
            .unwrap();
        let outcome = store
            .set_value(&id("s"), WidgetValue::Double(1.0), WriteSource::BackendHydration)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Ignored(IgnoredWrite::PendingUserAction));
        assert_eq!(store.get::<f64>(&id("s")), Ok(Some(2.0)));
    }

    #[test]
    fn user_action_after_hydration_wins() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("s"), WidgetValue::Double(1.0), WriteSource::BackendHydration)
            .unwrap();
        store
            .set_value(&id("s"), WidgetValue::Double(2.0), WriteSource::UserAction)
            .unwrap();
        assert_eq!(store.get::<f64>(&id("s")), Ok(Some(2.0)));
    }

    #[test]
    fn hydration_never_clobbers_user_value_after_reconcile() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("cb"), WidgetValue::Bool(false), WriteSource::BackendHydration)
            .unwrap();
        store
            .set_value(&id("cb"), WidgetValue::Bool(true), WriteSource::UserAction)
            .unwrap();
        store.reconcile(&ids(&["cb"]));
        let outcome = store
            .set_value(&id("cb"), WidgetValue::Bool(false), WriteSource::BackendHydration)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Ignored(IgnoredWrite::UserValueRetained));
        assert_eq!(store.get::<bool>(&id("cb")), Ok(Some(true)));
    }

    #[test]
    fn forced_value_overrides_settled_user_value() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("t"), WidgetValue::String("user".into()), WriteSource::UserAction)
            .unwrap();
        assert_eq!(
            store.force_value(&id("t"), WidgetValue::String("script".into())).unwrap(),
            WriteOutcome::Ignored(IgnoredWrite::PendingUserAction)
        );
        store.reconcile(&ids(&["t"]));
        store
            .force_value(&id("t"), WidgetValue::String("script".into()))
            .unwrap();
        assert_eq!(store.get::<String>(&id("t")), Ok(Some("script".into())));
    }

    #[test]
    fn form_writes_buffer_until_commit() {
        let mut store = WidgetStateStore::default();
        let form = FormId::new("f");
        store.bind(&id("a"), Some(form.clone()), None);
        store
            .set_value(&id("a"), WidgetValue::Int(0), WriteSource::BackendHydration)
            .unwrap();
        let outcome = store
            .set_value(&id("a"), WidgetValue::Int(7), WriteSource::UserAction)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Buffered { form_id: form.clone() });
        assert_eq!(store.get::<i64>(&id("a")), Ok(Some(7)));
        assert_eq!(store.committed(&id("a")), Some(&WidgetValue::Int(0)));
        assert!(store.has_uncommitted(&form));

        assert_eq!(store.commit_form(&form), vec![id("a")]);
        assert_eq!(store.committed(&id("a")), Some(&WidgetValue::Int(7)));
        assert!(!store.has_uncommitted(&form));
    }

    #[test]
    fn triggers_revert_after_send() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("btn"), WidgetValue::Trigger(true), WriteSource::UserAction)
            .unwrap();
        assert_eq!(
            store.snapshot(),
            vec![WidgetState::new(id("btn"), WidgetValue::Trigger(true))]
        );
        store.mark_sent();
        assert_eq!(store.committed(&id("btn")), Some(&WidgetValue::Trigger(false)));
        assert_eq!(
            store.get_value(&id("btn"), ValueKind::Trigger),
            Ok(Some(&WidgetValue::Trigger(false)))
        );
    }

    #[test]
    fn snapshot_is_sorted_and_committed_only() {
        let mut store = WidgetStateStore::default();
        store.bind(&id("in_form"), Some(FormId::new("f")), None);
        store
            .set_value(&id("in_form"), WidgetValue::Int(1), WriteSource::UserAction)
            .unwrap();
        store
            .set_value(&id("b"), WidgetValue::Int(2), WriteSource::UserAction)
            .unwrap();
        store
            .set_value(&id("a"), WidgetValue::Int(3), WriteSource::UserAction)
            .unwrap();
        let snapshot_states = store.snapshot();
        let snapshot: Vec<&str> = snapshot_states.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(snapshot, vec!["a", "b"]);
    }

    #[test]
    fn two_rerun_grace() {
        let mut store = WidgetStateStore::default();
        store
            .set_value(&id("w"), WidgetValue::Int(5), WriteSource::UserAction)
            .unwrap();
        store.reconcile(&ids(&["w"]));

        let report = store.reconcile(&ids(&[]));
        assert_eq!(report.orphaned, vec![id("w")]);
        assert!(store.is_orphaned(&id("w")));

        let report = store.reconcile(&ids(&["w"]));
        assert_eq!(report.revived, vec![id("w")]);
        assert_eq!(store.get::<i64>(&id("w")), Ok(Some(5)));

        store.reconcile(&ids(&[]));
        let report = store.reconcile(&ids(&[]));
        assert_eq!(report.deleted, vec![id("w")]);
        assert!(!store.contains(&id("w")));
    }

    #[test]
    fn larger_grace_keeps_orphans_longer() {
        let mut store = WidgetStateStore::new(3);
        store
            .set_value(&id("w"), WidgetValue::Int(5), WriteSource::UserAction)
            .unwrap();
        for _ in 0..3 {
            store.reconcile(&ids(&[]));
            assert!(store.contains(&id("w")));
        }
        store.reconcile(&ids(&[]));
        assert!(!store.contains(&id("w")));
    }

    #[test]
    fn reconcile_drops_bindings_of_deleted_widgets() {
        let mut store = WidgetStateStore::default();
        let form = FormId::new("f");
        store.bind(&id("a"), Some(form.clone()), None);
        store
            .set_value(&id("a"), WidgetValue::Int(1), WriteSource::BackendHydration)
            .unwrap();
        store.reconcile(&ids(&[]));
        store.reconcile(&ids(&[]));
        assert!(store.form_members(&form).is_empty());
    }

    #[test]
    fn fragment_scoped_rerun() {
        let mut store = WidgetStateStore::default();
        let frag = FragmentId::new("frag");
        store.bind(&id("x"), None, Some(frag.clone()));
        let outcome = store
            .set_value(&id("x"), WidgetValue::Bool(true), WriteSource::UserAction)
            .unwrap();
        assert_eq!(outcome, WriteOutcome::Committed { rerun: true, fragment: Some(frag) });
    }
}
