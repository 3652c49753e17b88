//! # Domain Models
//!
//! Pure data shared by every QuotaHub crate, with minimal dependencies (`serde`, `bitflags`).
//! Keep it lean: no I/O or heavy logic, just keys, enumerations, configuration and simple helpers.

pub mod config;
pub mod engine;
pub mod keys;
pub mod persistence;

pub use engine::{EngineKind, EngineSet};
pub use keys::{ClientKey, OriginKey, PrincipalKey};
pub use persistence::PersistenceKind;
