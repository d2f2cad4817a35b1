#![forbid(unsafe_code)]

//! Wisp Runtime
//!
//! Session-scoped widget state reconciliation for the Wisp client.
//!
//! # Key Components
//!
//! - [`WidgetStateStore`] - authoritative widget values, orphan grace, rerun snapshots
//! - [`FormCoordinator`] - form buffering, submit validation, clear broadcasts
//! - [`RerunQueue`] - at most one rerun in flight, pending reruns built at send time
//! - [`Dispatcher`] - ordered routing of inbound messages and session lifecycle
//! - [`AppSession`] - the session-owned facade tying the above together
//!
//! # Role in Wisp
//! `wisp-runtime` sits between the protocol types of `wisp-core` and the
//! transport glue of `wisp-web`. It never performs I/O: the host pushes
//! inbound messages, calls [`AppSession::end_of_task`] when its event-loop
//! task ends, and drains the outbound messages.

pub mod config;
pub mod dispatcher;
pub mod error;
pub mod forms;
#[cfg(feature = "log-init")]
pub mod logging;
pub mod metrics;
pub mod rerun_queue;
pub mod session;
pub mod store;

pub use config::{ConfigError, RuntimeConfig};
pub use dispatcher::{DiscardReason, DispatchOutcome, Dispatcher, RunSummary, SessionPhase};
pub use error::{
    FormError, ProtocolOrderError, SessionLifecycleError, Severity, UnregisteredFormSubmitError,
    WispError,
};
pub use forms::{ClearListener, FormCleared, FormConfig, FormCoordinator, FormState, SubmitPlan};
pub use metrics::{messages_dropped_total, reruns_coalesced_total, reruns_sent_total};
pub use rerun_queue::{PendingRerun, QueueState, RerunQueue};
pub use session::{
    AppSession, PageContext, SessionNotice, SessionState, WidgetComponent, WidgetHandle,
};
pub use store::{IgnoredWrite, ReconcileReport, WidgetStateStore, WriteOutcome, WriteSource};
