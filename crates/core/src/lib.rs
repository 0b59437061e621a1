//! Converge core types: error kinds shared by every crate, DNS-1123 naming,
//! finalizer patches and the status accessors used by the poller.

#![forbid(unsafe_code)]

pub mod finalizer;
pub mod naming;
pub mod status;

/// Boxed error kept as the source of [`Error::Transport`].
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the reconciliation primitives.
///
/// Lower layers never log-and-drop these; each one is handed back to the
/// immediate caller untouched.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("not_found: {0}")]
    NotFound(String),
    /// The version token sent with an update no longer matches the store.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport: {0}")]
    Transport(#[source] BoxError),
    #[error("invalid_argument: {0}")]
    InvalidArgument(String),
    #[error("invalid_label: {label:?}: {reason}")]
    InvalidLabel { label: String, reason: String },
    #[error("cancelled")]
    Cancelled,
}

impl Error {
    pub fn transport<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Transport(Box::new(err))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

pub mod prelude {
    pub use super::finalizer::{finalizer_add_patch, finalizer_delete_patch, has_finalizer, STATUS_CLEANUP_FINALIZER};
    pub use super::naming::ResourceNamer;
    pub use super::status::{Condition, ConditionStatus, StatusGetter, AVAILABLE};
    pub use super::{Error, Result};
}
