mod arena;
pub(crate) mod eviction;
mod record;
mod tree;

pub use record::{CachedOrigin, Estimate, OriginSeed, OriginUsage, UsageSnapshot};
pub use tree::{Limits, Overage};
pub(crate) use tree::UsageTree;

/// Microseconds since the Unix epoch.
pub(crate) fn now() -> i64 {
    chrono::Utc::now().timestamp_micros()
}
