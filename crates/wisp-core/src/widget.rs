#![forbid(unsafe_code)]

//! Typed widget values.
//!
//! Every stored value carries its [`ValueKind`], so reading a value under the
//! wrong kind fails with a [`KindMismatchError`] instead of coercing.
//!
//! # Triggers
//!
//! [`WidgetValue::Trigger`] and [`WidgetValue::StringTrigger`] are one-shot:
//! a fired trigger is sent to the backend in exactly one rerun request and
//! then reverts to its idle value (see [`WidgetValue::idle_trigger`]).

use std::fmt;

use crate::ids::WidgetId;

/// Discriminant of a [`WidgetValue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueKind {
    Bool,
    Double,
    Int,
    DoubleRange,
    String,
    StringArray,
    Bytes,
    Json,
    Trigger,
    StringTrigger,
}

impl ValueKind {
    /// Stable lowercase name used in logs and on the wire.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Bool => "bool",
            Self::Double => "double",
            Self::Int => "int",
            Self::DoubleRange => "double_range",
            Self::String => "string",
            Self::StringArray => "string_array",
            Self::Bytes => "bytes",
            Self::Json => "json",
            Self::Trigger => "trigger",
            Self::StringTrigger => "string_trigger",
        }
    }

    /// Whether values of this kind are one-shot.
    #[must_use]
    pub const fn is_trigger(self) -> bool {
        matches!(self, Self::Trigger | Self::StringTrigger)
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The value a widget holds.
#[derive(Debug, Clone, PartialEq)]
pub enum WidgetValue {
    Bool(bool),
    Double(f64),
    Int(i64),
    /// Inclusive numeric range, e.g. a two-handle slider.
    DoubleRange(f64, f64),
    String(String),
    StringArray(Vec<String>),
    Bytes(Vec<u8>),
    /// Opaque JSON text owned by the widget.
    Json(String),
    /// Button-style trigger; `true` while fired and unsent.
    Trigger(bool),
    /// Chat-style text submit; `Some` while fired and unsent.
    StringTrigger(Option<String>),
}

impl WidgetValue {
    #[must_use]
    pub fn kind(&self) -> ValueKind {
        match self {
            Self::Bool(_) => ValueKind::Bool,
            Self::Double(_) => ValueKind::Double,
            Self::Int(_) => ValueKind::Int,
            Self::DoubleRange(..) => ValueKind::DoubleRange,
            Self::String(_) => ValueKind::String,
            Self::StringArray(_) => ValueKind::StringArray,
            Self::Bytes(_) => ValueKind::Bytes,
            Self::Json(_) => ValueKind::Json,
            Self::Trigger(_) => ValueKind::Trigger,
            Self::StringTrigger(_) => ValueKind::StringTrigger,
        }
    }

    /// True for a trigger that has fired and not yet been sent.
    #[must_use]
    pub fn is_fired_trigger(&self) -> bool {
        matches!(self, Self::Trigger(true) | Self::StringTrigger(Some(_)))
    }

    /// The idle value of a trigger kind, `None` for every other kind.
    #[must_use]
    pub fn idle_trigger(kind: ValueKind) -> Option<Self> {
        match kind {
            ValueKind::Trigger => Some(Self::Trigger(false)),
            ValueKind::StringTrigger => Some(Self::StringTrigger(None)),
            _ => None,
        }
    }

    /// Check this value against an expected kind.
    pub fn expect_kind(
        &self,
        id: &WidgetId,
        expected: ValueKind,
    ) -> Result<&Self, KindMismatchError> {
        if self.kind() == expected {
            Ok(self)
        } else {
            Err(KindMismatchError {
                id: id.clone(),
                expected,
                found: self.kind(),
            })
        }
    }
}

/// A widget's current value, keyed by its id.
#[derive(Debug, Clone, PartialEq)]
pub struct WidgetState {
    pub id: WidgetId,
    pub value: WidgetValue,
}

impl WidgetState {
    #[must_use]
    pub fn new(id: WidgetId, value: WidgetValue) -> Self {
        Self { id, value }
    }
}

/// A value exists for the widget but under a different kind than requested.
///
/// Local to one widget read: the caller renders an inline error for that
/// widget and siblings are unaffected.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KindMismatchError {
    pub id: WidgetId,
    pub expected: ValueKind,
    pub found: ValueKind,
}

impl fmt::Display for KindMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "widget '{}' holds a {} value, expected {}",
            self.id, self.found, self.expected
        )
    }
}

impl std::error::Error for KindMismatchError {}

/// Native Rust types that map onto exactly one [`ValueKind`].
pub trait FromWidgetValue: Sized {
    const KIND: ValueKind;

    /// Extract from a value already checked to be of [`Self::KIND`].
    fn from_widget_value(value: &WidgetValue) -> Option<Self>;

    fn into_widget_value(self) -> WidgetValue;
}

impl FromWidgetValue for bool {
    const KIND: ValueKind = ValueKind::Bool;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::Bool(self)
    }
}

impl FromWidgetValue for f64 {
    const KIND: ValueKind = ValueKind::Double;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::Double(v) => Some(*v),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::Double(self)
    }
}

impl FromWidgetValue for i64 {
    const KIND: ValueKind = ValueKind::Int;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::Int(self)
    }
}

impl FromWidgetValue for (f64, f64) {
    const KIND: ValueKind = ValueKind::DoubleRange;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::DoubleRange(lo, hi) => Some((*lo, *hi)),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::DoubleRange(self.0, self.1)
    }
}

impl FromWidgetValue for String {
    const KIND: ValueKind = ValueKind::String;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::String(self)
    }
}

impl FromWidgetValue for Vec<String> {
    const KIND: ValueKind = ValueKind::StringArray;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::StringArray(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::StringArray(self)
    }
}

impl FromWidgetValue for Vec<u8> {
    const KIND: ValueKind = ValueKind::Bytes;

    fn from_widget_value(value: &WidgetValue) -> Option<Self> {
        match value {
            WidgetValue::Bytes(v) => Some(v.clone()),
            _ => None,
        }
    }

    fn into_widget_value(self) -> WidgetValue {
        WidgetValue::Bytes(self)
    }
}
