use qhub_domain::{EngineKind, OriginKey, PersistenceKind, PrincipalKey};
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Bytes per engine plus their total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UsageSnapshot {
    engines: [u64; EngineKind::COUNT],
    total: u64,
}

impl UsageSnapshot {
    #[must_use]
    pub const fn engine(&self, kind: EngineKind) -> u64 {
        self.engines[kind.index()]
    }

    #[must_use]
    pub const fn total(&self) -> u64 {
        self.total
    }

    pub const fn add_engine(&mut self, kind: EngineKind, bytes: u64) {
        self.engines[kind.index()] = self.engines[kind.index()].saturating_add(bytes);
        self.total = self.total.saturating_add(bytes);
    }

    /// Adds bytes that are not attributed to any engine.
    pub(crate) const fn add_unattributed(&mut self, bytes: u64) {
        self.total = self.total.saturating_add(bytes);
    }
}

impl Add for UsageSnapshot {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self {
        self += rhs;
        self
    }
}

impl AddAssign for UsageSnapshot {
    fn add_assign(&mut self, rhs: Self) {
        for (mine, theirs) in self.engines.iter_mut().zip(rhs.engines) {
            *mine = mine.saturating_add(theirs);
        }
        self.total = self.total.saturating_add(rhs.total);
    }
}

/// One row of [`crate::QuotaManager::get_usage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginUsage {
    pub key: OriginKey,
    pub usage: UsageSnapshot,
    pub persisted: bool,
    /// Last access in microseconds since the Unix epoch.
    pub access_time: i64,
}

/// Group usage against its ceiling, as reported by [`crate::QuotaManager::estimate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Estimate {
    pub usage: u64,
    pub limit: u64,
}

/// Values used to create or refresh an origin record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OriginSeed {
    /// Measured bytes per engine; `None` when the engine has not reported yet.
    pub engine_usage: [Option<u64>; EngineKind::COUNT],
    /// Total bytes, used when no engine reported.
    pub usage: u64,
    pub access_time: i64,
    pub persisted: bool,
    pub directory_exists: bool,
}

impl OriginSeed {
    /// Sum of the reported engines, or `usage` when none reported.
    #[must_use]
    pub fn effective_usage(&self) -> u64 {
        if self.engine_usage.iter().all(Option::is_none) {
            self.usage
        } else {
            self.engine_usage.iter().flatten().sum()
        }
    }
}

/// A usage-cache row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CachedOrigin {
    pub persistence: PersistenceKind,
    pub suffix: String,
    pub group: String,
    pub origin: String,
    pub persisted: bool,
    pub usage: u64,
    pub access_time: i64,
}

impl CachedOrigin {
    #[must_use]
    pub fn key(&self) -> OriginKey {
        PrincipalKey::new(self.origin.clone(), self.group.clone(), self.suffix.clone())
            .with_persistence(self.persistence)
    }
}

#[derive(Debug)]
pub(crate) struct OriginRecord {
    pub(crate) key: OriginKey,
    pub(crate) group: usize,
    pub(crate) engines: [Option<u64>; EngineKind::COUNT],
    pub(crate) usage: u64,
    pub(crate) access_time: i64,
    pub(crate) persisted: bool,
    /// The origin directory has not been materialized yet.
    pub(crate) pending: bool,
}

impl OriginRecord {
    pub(crate) fn snapshot(&self) -> UsageSnapshot {
        let mut snapshot = UsageSnapshot::default();
        let mut attributed = 0_u64;
        for kind in EngineKind::ALL {
            if let Some(bytes) = self.engines[kind.index()] {
                snapshot.add_engine(kind, bytes);
                attributed = attributed.saturating_add(bytes);
            }
        }
        snapshot.add_unattributed(self.usage.saturating_sub(attributed));
        snapshot
    }
}

#[derive(Debug)]
pub(crate) struct GroupRecord {
    pub(crate) persistence: PersistenceKind,
    pub(crate) group: String,
    pub(crate) usage: u64,
    pub(crate) children: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshots_sum_per_engine() {
        let mut a = UsageSnapshot::default();
        a.add_engine(EngineKind::Cache, 10);
        let mut b = UsageSnapshot::default();
        b.add_engine(EngineKind::Cache, 5);
        b.add_engine(EngineKind::Blob, 1);

        let sum = a + b;
        assert_eq!(sum.engine(EngineKind::Cache), 15);
        assert_eq!(sum.engine(EngineKind::Blob), 1);
        assert_eq!(sum.total(), 16);
    }

    #[test]
    fn seed_prefers_engine_figures() {
        let mut seed = OriginSeed { usage: 99, ..OriginSeed::default() };
        assert_eq!(seed.effective_usage(), 99);
        seed.engine_usage[EngineKind::Document.index()] = Some(7);
        assert_eq!(seed.effective_usage(), 7);
    }
}
