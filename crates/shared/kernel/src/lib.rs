//! Kernel utilities shared by the QuotaHub crates and binaries.
//! Keep this crate lightweight: configuration loading and origin validation only.
//!
//! ## Origin validation
//! ```rust
//! use qhub_kernel::security::OriginGuard;
//!
//! let key = OriginGuard::parse("HTTPS://Docs.Example.com^userContextId=2").unwrap();
//! assert_eq!(key.origin, "https://docs.example.com");
//! assert_eq!(key.group, "example.com");
//! assert_eq!(OriginGuard::sanitize(&key.full_origin()), "https+++docs.example.com^userContextId=2");
//! ```
//!
//! ## Config loading
//! ```rust,ignore
//! use qhub_kernel::config::load_config;
//! let cfg: qhub_domain::config::AppConfig = load_config(Some("qhub.toml")).unwrap();
//! ```
pub mod config;
pub mod security;

pub use qhub_domain as domain;
