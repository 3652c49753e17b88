use std::borrow::Cow;
use std::sync::Arc;

/// Errors raised by the sandboxed filesystem primitives.
///
/// Cloneable so a single failure can be handed to every waiter of a shared operation.
#[derive(Clone)]
#[qhub_derive::qhub_error]
pub enum StorageError {
    #[error("File not found{}: {message}", format_context(.context))]
    FileNotFound { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Path traversal security violation{}: {message}", format_context(.context))]
    PathTraversalAttempt { message: Cow<'static, str>, context: Option<Cow<'static, str>> },

    #[error("Hardware I/O failure{}: {source}", format_context(.context))]
    Io { source: Arc<std::io::Error>, context: Option<Cow<'static, str>> },

    #[error("Directory walk failure{}: {source}", format_context(.context))]
    Walk { source: Arc<walkdir::Error>, context: Option<Cow<'static, str>> },

    #[error("Decompression failure{}: {source}", format_context(.context))]
    Decompress { source: Arc<lz4_flex::block::DecompressError>, context: Option<Cow<'static, str>> },
}
