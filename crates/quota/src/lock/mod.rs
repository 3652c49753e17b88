//! Hierarchical directory locks.
//!
//! A lock is created against a [`LockScope`], prepared (registered, which fixes its place in
//! the queue) and then acquired. It resolves once every earlier conflicting lock has dropped.

mod handle;
mod registry;
mod scope;

pub use handle::{BlockerSnapshot, DirectoryLock, PendingLock};
pub use registry::LockId;
pub(crate) use registry::{LockTable, Waiter};
pub use scope::{LockScope, OriginPattern, OriginScope};
