#![forbid(unsafe_code)]

//! Runtime error types.
//!
//! Every error maps to a [`Severity`] that tells the host how far the
//! failure reaches:
//!
//! | severity  | scope                                   | host reaction            |
//! |-----------|-----------------------------------------|--------------------------|
//! | `Widget`  | one widget                              | inline error on it       |
//! | `Warning` | one form or one message                 | log / developer warning  |
//! | `Fatal`   | the session's view of the backend       | reload prompt            |

use std::fmt;

use wisp_core::{FormId, KindMismatchError, WidgetId, WidgetIdCollisionError};

/// How far an error reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Widget,
    Warning,
    Fatal,
}

/// A message arrived with a sequence index at or below the last accepted one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProtocolOrderError {
    pub index: u64,
    pub last_accepted: u64,
    pub message: &'static str,
    /// Out-of-order messages seen in a row, this one included.
    pub consecutive: u32,
}

impl fmt::Display for ProtocolOrderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} message #{} arrived after #{} ({} out of order in a row)",
            self.message, self.index, self.last_accepted, self.consecutive
        )
    }
}

impl std::error::Error for ProtocolOrderError {}

/// A message is not valid in the current session phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionLifecycleError {
    pub message: &'static str,
    pub phase: &'static str,
}

impl fmt::Display for SessionLifecycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} message received while {}", self.message, self.phase)
    }
}

impl std::error::Error for SessionLifecycleError {}

/// A form exists but has no submit button.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnregisteredFormSubmitError {
    pub form_id: FormId,
}

impl fmt::Display for UnregisteredFormSubmitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "form '{}' has no submit button; its values can never be sent",
            self.form_id
        )
    }
}

impl std::error::Error for UnregisteredFormSubmitError {}

/// Errors from form operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormError {
    UnknownForm(FormId),
    NoSubmitTrigger(UnregisteredFormSubmitError),
    UploadsInProgress { form_id: FormId, count: usize },
    /// The submitting widget is not bound to the form.
    ForeignSubmitButton { form_id: FormId, button: WidgetId },
}

impl fmt::Display for FormError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownForm(id) => write!(f, "unknown form '{id}'"),
            Self::NoSubmitTrigger(e) => write!(f, "{e}"),
            Self::UploadsInProgress { form_id, count } => {
                write!(f, "form '{form_id}' has {count} upload(s) in progress")
            }
            Self::ForeignSubmitButton { form_id, button } => {
                write!(f, "widget '{button}' cannot submit form '{form_id}'")
            }
        }
    }
}

impl std::error::Error for FormError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::NoSubmitTrigger(e) => Some(e),
            _ => None,
        }
    }
}

/// Any error the runtime surfaces to its host.
#[derive(Debug, Clone, PartialEq)]
pub enum WispError {
    ProtocolOrder(ProtocolOrderError),
    Lifecycle(SessionLifecycleError),
    KindMismatch(KindMismatchError),
    WidgetIdCollision(WidgetIdCollisionError),
    Form(FormError),
}

impl WispError {
    #[must_use]
    pub fn severity(&self) -> Severity {
        match self {
            Self::KindMismatch(_) => Severity::Widget,
            Self::Form(_) => Severity::Warning,
            Self::ProtocolOrder(_) | Self::Lifecycle(_) | Self::WidgetIdCollision(_) => {
                Severity::Fatal
            }
        }
    }

    /// Whether the client's view can no longer be trusted and the page
    /// should reload.
    #[must_use]
    pub fn requires_reload(&self) -> bool {
        matches!(self, Self::ProtocolOrder(_) | Self::Lifecycle(_))
    }
}

impl fmt::Display for WispError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ProtocolOrder(e) => write!(f, "protocol order: {e}"),
            Self::Lifecycle(e) => write!(f, "session lifecycle: {e}"),
            Self::KindMismatch(e) => write!(f, "{e}"),
            Self::WidgetIdCollision(e) => write!(f, "{e}"),
            Self::Form(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for WispError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ProtocolOrder(e) => Some(e),
            Self::Lifecycle(e) => Some(e),
            Self::KindMismatch(e) => Some(e),
            Self::WidgetIdCollision(e) => Some(e),
            Self::Form(e) => Some(e),
        }
    }
}

impl From<ProtocolOrderError> for WispError {
    fn from(e: ProtocolOrderError) -> Self {
        Self::ProtocolOrder(e)
    }
}

impl From<SessionLifecycleError> for WispError {
    fn from(e: SessionLifecycleError) -> Self {
        Self::Lifecycle(e)
    }
}

impl From<KindMismatchError> for WispError {
    fn from(e: KindMismatchError) -> Self {
        Self::KindMismatch(e)
    }
}

impl From<FormError> for WispError {
    fn from(e: FormError) -> Self {
        Self::Form(e)
    }
}

impl From<WidgetIdCollisionError> for WispError {
    fn from(e: WidgetIdCollisionError) -> Self {
        Self::WidgetIdCollision(e)
    }
}
