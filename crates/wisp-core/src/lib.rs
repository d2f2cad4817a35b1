#![forbid(unsafe_code)]

//! Core data model for the Wisp client.
//!
//! # Role in Wisp
//! `wisp-core` holds the value types every other layer agrees on: widget
//! identity and typed widget values, the element tree materialized from the
//! backend's delta stream, and the inbound/outbound protocol messages.
//!
//! # How it fits in the system
//! The runtime (`wisp-runtime`) owns a session's [`ElementTree`] and widget
//! state and drives them from [`ForwardMsg`] values. The web layer
//! (`wisp-web`) decodes those messages from the wire and encodes the
//! [`BackMsg`] values the runtime emits. Nothing in this crate performs I/O.

pub mod element_tree;
pub mod ids;
pub mod protocol;
pub mod widget;

pub use element_tree::{
    BlockKind, BlockNode, DeltaOp, DeltaPath, ElementNode, ElementSpec, ElementTree, FormBlock,
    Node, RootContainer, RunStamp, SUBMIT_BUTTON_KIND, TreeError, WidgetIdCollisionError,
    WidgetSpec,
};
pub use ids::{FormId, FragmentId, ScriptRunId, WidgetId};
pub use protocol::{
    BackMsg, Delta, ForwardMsg, IndexedMessage, NewSession, RerunRequest, ScriptFinished,
    ScriptFinishedStatus, SessionEvent,
};
pub use widget::{FromWidgetValue, KindMismatchError, ValueKind, WidgetState, WidgetValue};
