#![allow(unreachable_pub)]
#![allow(clippy::needless_pass_by_value)]

//! # Macros
//!
//! Procedural macros shared by the QuotaHub crates.
//!
//! * [`macro@main`] bootstraps a Tokio runtime from a `qhub_runtime` profile.
//! * [`macro@qhub_error`] turns a plain enum into a context-aware `thiserror` error type.
//!
//! The examples are `ignore`d because a proc-macro crate cannot use its own macros in doctests.

mod macros;

use proc_macro::TokenStream;
use syn::{DeriveInput, ItemFn, parse_macro_input};

/// Attribute macro to bootstrap the QuotaHub Tokio runtime.
///
/// Transforms an `async fn main` into a standard `fn main` that builds a runtime from one of the
/// `qhub_runtime::RuntimeConfig` presets and blocks on the body.
///
/// # Arguments
///
/// * `high_performance` - Larger stacks and longer keep-alive, for long-running processes.
/// * `memory_efficient` - Fewer workers and smaller stacks, for short-lived tools.
/// * `default` - Worker threads auto-detected from available parallelism.
///
/// # Examples
///
/// ```rust,ignore
/// #[qhub_runtime::main(memory_efficient)]
/// async fn main() -> anyhow::Result<()> {
///     Ok(())
/// }
/// ```
#[proc_macro_attribute]
pub fn main(args: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    macros::runtime::expand_main(args.into(), input).into()
}

/// Attribute macro for defining crate-level error enums.
///
/// # Features
///
/// * **Automatic Derives**: Injects `#[derive(Debug, thiserror::Error)]` unless already present.
///   Other derives such as `Clone` are left to the enum.
/// * **Context Support**: Generates a companion `<Name>Ext` trait that adds `.context()`
///   to `Result<T, Name>` and to results of every wrapped source error.
/// * **Standard Conversions**: Implements `From<T>` for variants with a `source` field.
///   When the source is held as `Arc<T>`, the conversion accepts the bare `T` and wraps it,
///   which keeps the error `Clone` while still supporting `?` on upstream results.
/// * **Internal Fallback**: `From<&'static str>` and `From<String>` when an `Internal` variant
///   is present.
///
/// # Requirements
///
/// 1. The macro must be applied to an **enum** with named-field variants.
/// 2. Variants with a source must carry a `context: Option<Cow<'static, str>>` field.
///
/// # Example
///
/// ```rust,ignore
/// use std::borrow::Cow;
/// use std::sync::Arc;
///
/// #[derive(Clone)]
/// #[qhub_derive::qhub_error]
/// pub enum CacheError {
///     #[error("I/O failure{}: {source}", format_context(.context))]
///     Io { source: Arc<std::io::Error>, context: Option<Cow<'static, str>> },
///
///     #[error("Internal fault{}: {message}", format_context(.context))]
///     Internal { message: Cow<'static, str>, context: Option<Cow<'static, str>> },
/// }
///
/// fn load(path: &std::path::Path) -> Result<Vec<u8>, CacheError> {
///     std::fs::read(path).context("Reading usage cache")
/// }
/// ```
#[proc_macro_attribute]
pub fn qhub_error(_args: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as DeriveInput);
    macros::error::expand_derive(input).into()
}
