use crate::usage::UsageSnapshot;
use std::borrow::Cow;
use std::sync::Arc;

/// Coarse classification of a [`QuotaError`], stable across variants added later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    InvalidArgument,
    Abort,
    IoFailure,
}

/// Errors produced by the quota core.
///
/// Cloneable: an initialization attempt hands the same outcome to every attached waiter.
#[derive(Clone)]
#[qhub_derive::qhub_error]
pub enum QuotaError {
    #[error("Invalid argument{}: {message}", format_context(.context))]
    InvalidArgument { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Operation aborted{}: {message}", format_context(.context))]
    Abort { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("I/O failure{}: {source}", format_context(.context))]
    Io { source: Arc<std::io::Error>, context: Option<Cow<'static, str>> },

    #[error("Storage failure{}: {source}", format_context(.context))]
    Storage { source: qhub_storage::StorageError, context: Option<Cow<'static, str>> },

    #[error("Corrupted record{}: {source}", format_context(.context))]
    Codec { source: Arc<postcard::Error>, context: Option<Cow<'static, str>> },

    #[error("Internal error{}: {message}", format_context(.context))]
    Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Usage enumeration cancelled{}", format_context(.context))]
    Cancelled { partial: UsageSnapshot, context: Option<Cow<'static, str>> },
}

impl QuotaError {
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidArgument { .. } => ErrorKind::InvalidArgument,
            Self::Abort { .. } | Self::Cancelled { .. } => ErrorKind::Abort,
            Self::Io { .. } | Self::Storage { .. } | Self::Codec { .. } | Self::Internal { .. } => {
                ErrorKind::IoFailure
            },
        }
    }

    pub(crate) fn invalid(message: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument { message: message.into(), context: None }
    }

    pub(crate) fn abort(message: impl Into<Cow<'static, str>>) -> Self {
        Self::Abort { message: message.into(), context: None }
    }

    pub(crate) fn shutting_down() -> Self {
        Self::abort("quota manager is shutting down")
    }

    /// An invariant violation. Fatal in debug builds.
    pub(crate) fn internal(message: impl Into<Cow<'static, str>>) -> Self {
        let message = message.into();
        debug_assert!(false, "quota invariant violated: {message}");
        tracing::error!(%message, "Quota invariant violated");
        Self::Internal { message, context: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_collapse_failures() {
        assert_eq!(QuotaError::invalid("bad").kind(), ErrorKind::InvalidArgument);
        let cancelled = QuotaError::Cancelled { partial: UsageSnapshot::default(), context: None };
        assert_eq!(cancelled.kind(), ErrorKind::Abort);

        let io: QuotaError = std::io::Error::other("disk").into();
        assert_eq!(io.kind(), ErrorKind::IoFailure);
    }

    #[test]
    fn context_is_attached_to_shared_sources() {
        let result: Result<(), std::io::Error> = Err(std::io::Error::other("disk"));
        let err = result.context("Listing repository").expect_err("error");
        assert!(err.to_string().contains("(Listing repository)"));
        let cloned = err.clone();
        assert_eq!(cloned.to_string(), err.to_string());
    }
}
