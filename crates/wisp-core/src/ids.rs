#![forbid(unsafe_code)]

//! String-backed identifiers.
//!
//! All ids are cheap to clone (`Arc<str>`) because they are copied into
//! tree nodes, store entries, and every outgoing rerun snapshot.

use std::fmt;
use std::sync::Arc;

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub struct $name(Arc<str>);

        impl $name {
            /// Create an id from any string-like value.
            #[must_use]
            pub fn new(id: impl AsRef<str>) -> Self {
                Self(Arc::from(id.as_ref()))
            }

            /// Borrow the raw id.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self::new(id)
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(Arc::from(id))
            }
        }
    };
}

string_id!(
    /// Opaque identifier of one widget instance within a session.
    ///
    /// Backend-generated ids have the shape `$$ID-<hash>-<user key>`; the
    /// hash covers the widget's auto-derived identity, so two widgets sharing
    /// a user key never share an id.
    WidgetId
);

string_id!(
    /// Identifier of a form block.
    FormId
);

string_id!(
    /// Identifier of one backend script execution.
    ScriptRunId
);

string_id!(
    /// Identifier of an independently rerunnable fragment.
    FragmentId
);

impl WidgetId {
    /// Prefix of backend-generated widget ids.
    pub const GENERATED_PREFIX: &'static str = "$$ID-";

    /// The user-assigned key embedded in a generated id, if any.
    #[must_use]
    pub fn user_key(&self) -> Option<&str> {
        let rest = self.0.strip_prefix(Self::GENERATED_PREFIX)?;
        let (_hash, key) = rest.split_once('-')?;
        (!key.is_empty()).then_some(key)
    }
}

impl ScriptRunId {
    /// Run id used before the first script run is known.
    #[must_use]
    pub fn initial() -> Self {
        Self::new("")
    }
}
