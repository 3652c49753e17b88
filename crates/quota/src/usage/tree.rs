use crate::lock::LockScope;
use crate::usage::arena::Arena;
use crate::usage::record::{CachedOrigin, GroupRecord, OriginRecord, OriginSeed, OriginUsage, UsageSnapshot};
use fxhash::FxHashMap;
use qhub_domain::{ClientKey, EngineKind, OriginKey, PersistenceKind, PrincipalKey};
use tracing::{debug, trace};

type OriginSlot = (PersistenceKind, String);
type GroupSlot = (PersistenceKind, String);

/// Global and per-group ceilings for temporary storage, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub global: u64,
    pub group: u64,
}

/// How far temporary storage is above a ceiling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Overage {
    Global { excess: u64 },
    Group { group: String, excess: u64 },
}

impl Overage {
    #[must_use]
    pub const fn excess(&self) -> u64 {
        match self {
            Self::Global { excess } | Self::Group { excess, .. } => *excess,
        }
    }
}

/// Per-origin and per-group byte counters.
///
/// Origins and groups live in arenas; an origin record refers to its group by slot. Group usage
/// is the sum of its origins; the temporary counter is the sum of the non-persistent groups.
#[derive(Debug)]
pub(crate) struct UsageTree {
    origins: Arena<OriginSlot, OriginRecord>,
    groups: Arena<GroupSlot, GroupRecord>,
    temporary: u64,
    limits: Limits,
}

impl UsageTree {
    pub(crate) fn new(limits: Limits) -> Self {
        Self { origins: Arena::default(), groups: Arena::default(), temporary: 0, limits }
    }

    pub(crate) const fn limits(&self) -> Limits {
        self.limits
    }

    pub(crate) const fn temporary_usage(&self) -> u64 {
        self.temporary
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.origins.len()
    }

    /// Creates or refreshes the record of `key`. Seeding the same values twice is a no-op.
    pub(crate) fn seed_origin(&mut self, key: &OriginKey, seed: &OriginSeed) {
        let slot = self.ensure_origin(key, seed.access_time);
        let usage = seed.effective_usage();
        let Some(record) = self.origins.get_mut(slot) else {
            return;
        };
        let old = record.usage;
        record.engines = seed.engine_usage;
        record.usage = usage;
        record.access_time = record.access_time.max(seed.access_time);
        record.persisted = seed.persisted;
        record.pending = !seed.directory_exists;
        let group = record.group;
        self.shift(group, key.persistence, old, usage);
        trace!(origin = %key, bytes = usage, "Origin seeded");
    }

    /// Marks the directory of `key` as present, creating a zero-usage record if needed.
    pub(crate) fn materialize(&mut self, key: &OriginKey, now: i64) {
        let slot = self.ensure_origin(key, now);
        if let Some(record) = self.origins.get_mut(slot) {
            record.pending = false;
            record.access_time = record.access_time.max(now);
        }
    }

    /// Records a measurement for one engine of an origin that may only have a cached total.
    ///
    /// An engine measured for the first time is assumed to be part of the unattributed total.
    pub(crate) fn set_engine_usage(&mut self, client: &ClientKey, bytes: u64, now: i64) {
        let slot = self.ensure_origin(&client.origin, now);
        let Some(record) = self.origins.get_mut(slot) else {
            return;
        };
        let old = record.usage;
        let index = client.engine.index();
        let new = match record.engines[index] {
            Some(previous) => old.saturating_sub(previous).saturating_add(bytes),
            None => {
                let attributed: u64 = record.engines.iter().flatten().sum();
                let unattributed = old.saturating_sub(attributed);
                old.saturating_add(bytes.saturating_sub(unattributed.min(bytes)))
            },
        };
        record.engines[index] = Some(bytes);
        record.usage = new;
        record.pending = false;
        let group = record.group;
        self.shift(group, client.origin.persistence, old, new);
    }

    /// Applies a signed delta reported by an engine.
    ///
    /// Decreases clamp at zero, against the engine's figure when known and the origin total
    /// otherwise. An increase means the engine wrote into its client directory, so the record is
    /// no longer pending, even when it was pruned and recreated here. Returns the ceiling now
    /// exceeded, if an increase pushed usage over one.
    pub(crate) fn adjust_usage(&mut self, client: &ClientKey, delta: i64, now: i64) -> Option<Overage> {
        let slot = self.ensure_origin(&client.origin, now);
        let record = self.origins.get_mut(slot)?;
        let index = client.engine.index();
        let old = record.usage;
        let magnitude = delta.unsigned_abs();

        if delta >= 0 {
            record.engines[index] = Some(record.engines[index].unwrap_or(0).saturating_add(magnitude));
            record.usage = old.saturating_add(magnitude);
            record.pending = false;
        } else {
            let cap = record.engines[index].unwrap_or(old).min(old);
            let clamped = magnitude.min(cap);
            if let Some(engine) = record.engines[index].as_mut() {
                *engine -= clamped;
            }
            record.usage = old - clamped;
        }

        let new = record.usage;
        let group = record.group;
        self.shift(group, client.origin.persistence, old, new);
        debug!(client = %client, delta, bytes = new, "Usage adjusted");

        if delta > 0 && client.origin.persistence.is_best_effort() {
            self.over_limit()
        } else {
            None
        }
    }

    /// The most pressing exceeded ceiling: the global one first, then the largest group excess.
    pub(crate) fn over_limit(&self) -> Option<Overage> {
        if self.temporary > self.limits.global {
            return Some(Overage::Global { excess: self.temporary - self.limits.global });
        }
        let mut totals: FxHashMap<&str, u64> = FxHashMap::default();
        for (_, (persistence, name), group) in self.groups.iter() {
            if persistence.is_best_effort() {
                *totals.entry(name.as_str()).or_default() += group.usage;
            }
        }
        totals
            .into_iter()
            .filter(|(_, usage)| *usage > self.limits.group)
            .max_by(|a, b| a.1.cmp(&b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(group, usage)| Overage::Group {
                group: group.to_owned(),
                excess: usage - self.limits.group,
            })
    }

    /// Temporary usage of a group across the non-persistent kinds.
    pub(crate) fn group_usage(&self, group: &str) -> u64 {
        PersistenceKind::BEST_EFFORT
            .into_iter()
            .filter_map(|kind| self.groups.find(&(kind, group.to_owned())))
            .filter_map(|slot| self.groups.get(slot))
            .map(|g| g.usage)
            .sum()
    }

    pub(crate) fn touch(&mut self, key: &OriginKey, now: i64) {
        if let Some(record) =
            self.origins.find(&slot_of(key)).and_then(|slot| self.origins.get_mut(slot))
        {
            record.access_time = record.access_time.max(now);
        }
    }

    /// Marks `key` persisted, creating its record if needed. Returns whether it changed.
    pub(crate) fn persist(&mut self, key: &OriginKey, now: i64) -> bool {
        let slot = self.ensure_origin(key, now);
        self.origins.get_mut(slot).is_some_and(|record| {
            let changed = !record.persisted;
            record.persisted = true;
            changed
        })
    }

    pub(crate) fn is_persisted(&self, key: &OriginKey) -> Option<bool> {
        self.record(key).map(|r| r.persisted)
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, key: &OriginKey) -> bool {
        self.record(key).is_some()
    }

    /// Usage of a principal summed over every persistence kind.
    pub(crate) fn usage_for(&self, principal: &PrincipalKey) -> UsageSnapshot {
        PersistenceKind::ALL
            .into_iter()
            .filter_map(|kind| self.record(&principal.with_persistence(kind)))
            .fold(UsageSnapshot::default(), |acc, r| acc + r.snapshot())
    }

    #[cfg(test)]
    pub(crate) fn origin_usage(&self, key: &OriginKey) -> Option<OriginUsage> {
        self.record(key).map(to_row)
    }

    /// Picks eviction victims: unlocked, non-persisted, non-persistent origins with usage, least
    /// recently accessed first (ties by origin), until `overage` is covered or none are left.
    pub(crate) fn select_victims(
        &self,
        overage: &Overage,
        is_locked: impl Fn(PersistenceKind, &str) -> bool,
    ) -> Vec<(OriginKey, u64)> {
        let group_filter = match overage {
            Overage::Group { group, .. } => Some(group.as_str()),
            Overage::Global { .. } => None,
        };

        let mut candidates: Vec<&OriginRecord> = self
            .origins
            .iter()
            .map(|(_, _, record)| record)
            .filter(|r| r.key.persistence.is_best_effort() && !r.persisted && r.usage > 0)
            .filter(|r| group_filter.is_none_or(|g| r.key.group == g))
            .filter(|r| !is_locked(r.key.persistence, &r.key.full_origin()))
            .collect();
        candidates.sort_by(|a, b| {
            a.access_time
                .cmp(&b.access_time)
                .then_with(|| a.key.full_origin().cmp(&b.key.full_origin()))
                .then_with(|| a.key.persistence.cmp(&b.key.persistence))
        });

        let mut freed = 0_u64;
        let mut victims = Vec::new();
        for record in candidates {
            if freed >= overage.excess() {
                break;
            }
            freed = freed.saturating_add(record.usage);
            victims.push((record.key.clone(), record.usage));
        }
        victims
    }

    /// Removes the record of `key`, returning the bytes it accounted for.
    pub(crate) fn remove_origin(&mut self, key: &OriginKey) -> u64 {
        let Some(slot) = self.origins.find(&slot_of(key)) else {
            return 0;
        };
        let Some((_, record)) = self.origins.remove(slot) else {
            return 0;
        };
        self.shift(record.group, key.persistence, record.usage, 0);
        self.release_group(record.group);
        debug!(origin = %key, bytes = record.usage, "Origin record removed");
        record.usage
    }

    /// Drops the figure of one engine after its data was deleted; `measured` is used when the
    /// engine had not reported yet.
    pub(crate) fn clear_engine(&mut self, key: &OriginKey, engine: EngineKind, measured: u64) {
        let Some(record) = self.origins.find(&slot_of(key)).and_then(|s| self.origins.get_mut(s))
        else {
            return;
        };
        let old = record.usage;
        let removed = record.engines[engine.index()].take().unwrap_or(measured);
        record.usage = old.saturating_sub(removed);
        let (group, new) = (record.group, record.usage);
        self.shift(group, key.persistence, old, new);
    }

    /// Removes an unused record: zero usage and not persisted.
    pub(crate) fn prune_if_unused(&mut self, persistence: PersistenceKind, full_origin: &str) -> bool {
        let slot = (persistence, full_origin.to_owned());
        let unused = self
            .origins
            .find(&slot)
            .and_then(|s| self.origins.get(s))
            .is_some_and(|r| r.usage == 0 && !r.persisted);
        if !unused {
            return false;
        }
        if let Some((_, record)) = self.origins.find(&slot).and_then(|s| self.origins.remove(s)) {
            self.release_group(record.group);
            trace!(origin = %record.key, "Unused origin record pruned");
        }
        true
    }

    /// Keys of the records a lock scope reaches.
    pub(crate) fn keys_in(&self, scope: &LockScope) -> Vec<OriginKey> {
        self.origins
            .iter()
            .filter(|(_, (persistence, full), _)| scope.covers_origin(*persistence, full))
            .map(|(_, _, r)| r.key.clone())
            .collect()
    }

    pub(crate) fn keys_in_group(&self, group: &str) -> Vec<OriginKey> {
        self.origins
            .iter()
            .filter(|(_, (persistence, _), r)| persistence.is_best_effort() && r.key.group == group)
            .map(|(_, _, r)| r.key.clone())
            .collect()
    }

    pub(crate) fn rows(&self) -> Vec<OriginUsage> {
        let mut rows: Vec<OriginUsage> = self.origins.iter().map(|(_, _, r)| to_row(r)).collect();
        rows.sort_by(|a, b| a.key.cmp(&b.key));
        rows
    }

    /// Rows for the usage cache.
    pub(crate) fn snapshot_rows(&self) -> Vec<CachedOrigin> {
        self.origins
            .iter()
            .filter(|(_, _, r)| !r.pending)
            .map(|(_, _, r)| CachedOrigin {
                persistence: r.key.persistence,
                suffix: r.key.suffix.clone(),
                group: r.key.group.clone(),
                origin: r.key.origin.clone(),
                persisted: r.persisted,
                usage: r.usage,
                access_time: r.access_time,
            })
            .collect()
    }

    pub(crate) fn reset(&mut self) {
        self.origins.clear();
        self.groups.clear();
        self.temporary = 0;
    }

    /// Checks the aggregation invariants.
    #[cfg(test)]
    pub(crate) fn is_consistent(&self) -> bool {
        let mut sums: FxHashMap<usize, (u64, usize)> = FxHashMap::default();
        for (_, _, record) in self.origins.iter() {
            let entry = sums.entry(record.group).or_default();
            entry.0 += record.usage;
            entry.1 += 1;
        }
        let mut temporary = 0_u64;
        for (slot, (persistence, _), group) in self.groups.iter() {
            let (usage, children) = sums.get(&slot).copied().unwrap_or_default();
            if usage != group.usage || children != group.children || children == 0 {
                return false;
            }
            if persistence.is_best_effort() {
                temporary += group.usage;
            }
        }
        temporary == self.temporary
    }

    fn record(&self, key: &OriginKey) -> Option<&OriginRecord> {
        self.origins.find(&slot_of(key)).and_then(|slot| self.origins.get(slot))
    }

    fn ensure_origin(&mut self, key: &OriginKey, now: i64) -> usize {
        let (group, _) = self.groups.find_or_insert_with(&(key.persistence, key.group.clone()), || {
            GroupRecord {
                persistence: key.persistence,
                group: key.group.clone(),
                usage: 0,
                children: 0,
            }
        });
        let (slot, fresh) = self.origins.find_or_insert_with(&slot_of(key), || OriginRecord {
            key: key.clone(),
            group,
            engines: [None; EngineKind::COUNT],
            usage: 0,
            access_time: now,
            persisted: false,
            pending: true,
        });
        if fresh && let Some(record) = self.groups.get_mut(group) {
            record.children += 1;
        }
        slot
    }

    fn shift(&mut self, group: usize, persistence: PersistenceKind, old: u64, new: u64) {
        if let Some(record) = self.groups.get_mut(group) {
            record.usage = record.usage.saturating_sub(old).saturating_add(new);
        }
        if persistence.is_best_effort() {
            self.temporary = self.temporary.saturating_sub(old).saturating_add(new);
        }
    }

    fn release_group(&mut self, group: usize) {
        let empty = self.groups.get_mut(group).is_some_and(|record| {
            record.children = record.children.saturating_sub(1);
            record.children == 0
        });
        if empty && let Some((_, record)) = self.groups.remove(group) {
            trace!(group = %record.group, persistence = %record.persistence, "Group record removed");
        }
    }
}

fn slot_of(key: &OriginKey) -> OriginSlot {
    (key.persistence, key.full_origin())
}

fn to_row(record: &OriginRecord) -> OriginUsage {
    OriginUsage {
        key: record.key.clone(),
        usage: record.snapshot(),
        persisted: record.persisted,
        access_time: record.access_time,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const LIMITS: Limits = Limits { global: 1000, group: 600 };

    fn key(kind: PersistenceKind, origin: &str, group: &str) -> OriginKey {
        PrincipalKey::new(origin, group, "").with_persistence(kind)
    }

    fn seeded(usage: u64, access_time: i64) -> OriginSeed {
        OriginSeed { usage, access_time, directory_exists: true, ..OriginSeed::default() }
    }

    #[test]
    fn decrease_clamps_at_zero() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        tree.seed_origin(&a, &seeded(100, 1));
        assert_eq!(tree.group_usage("a.com"), 100);

        assert!(tree.adjust_usage(&a.client(EngineKind::Document), -150, 2).is_none());
        assert_eq!(tree.origin_usage(&a).map(|r| r.usage.total()), Some(0));
        assert_eq!(tree.group_usage("a.com"), 0);
        assert_eq!(tree.temporary_usage(), 0);
        assert!(tree.is_consistent());
    }

    #[test]
    fn seeding_is_idempotent() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Temporary, "https://a.com", "a.com");
        let mut seed = seeded(0, 5);
        seed.engine_usage[EngineKind::Cache.index()] = Some(40);
        tree.seed_origin(&a, &seed);
        tree.seed_origin(&a, &seed);

        let row = tree.origin_usage(&a).expect("record");
        assert_eq!(row.usage.engine(EngineKind::Cache), 40);
        assert_eq!(tree.temporary_usage(), 40);
        assert_eq!(tree.len(), 1);
        assert!(tree.is_consistent());
    }

    #[test]
    fn persistent_usage_is_not_temporary() {
        let mut tree = UsageTree::new(LIMITS);
        let p = key(PersistenceKind::Persistent, "https://p.com", "p.com");
        assert!(tree.adjust_usage(&p.client(EngineKind::Blob), 5000, 1).is_none());
        assert_eq!(tree.temporary_usage(), 0);
        assert_eq!(tree.usage_for(&p.principal()).total(), 5000);
    }

    #[test]
    fn increases_report_global_then_group_overage() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        let b = key(PersistenceKind::Temporary, "https://b.com", "b.com");

        assert_eq!(
            tree.adjust_usage(&a.client(EngineKind::Cache), 700, 1),
            Some(Overage::Group { group: "a.com".to_owned(), excess: 100 })
        );
        assert_eq!(
            tree.adjust_usage(&b.client(EngineKind::Cache), 400, 2),
            Some(Overage::Global { excess: 100 })
        );
    }

    #[test]
    fn victims_follow_access_order() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        let b = key(PersistenceKind::Default, "https://b.com", "b.com");
        let c = key(PersistenceKind::Default, "https://c.com", "c.com");
        tree.seed_origin(&a, &seeded(200, 1));
        tree.seed_origin(&b, &seeded(400, 2));
        tree.seed_origin(&c, &seeded(100, 3));

        let victims = tree.select_victims(&Overage::Global { excess: 500 }, |_, _| false);
        let names: Vec<_> = victims.iter().map(|(k, _)| k.origin.as_str()).collect();
        assert_eq!(names, vec!["https://a.com", "https://b.com"]);
    }

    #[test]
    fn victims_skip_locked_and_persisted() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        let b = key(PersistenceKind::Default, "https://b.com", "b.com");
        let c = key(PersistenceKind::Default, "https://c.com", "c.com");
        tree.seed_origin(&a, &seeded(200, 1));
        tree.seed_origin(&b, &OriginSeed { persisted: true, ..seeded(400, 2) });
        tree.seed_origin(&c, &seeded(100, 3));

        let victims = tree.select_victims(&Overage::Global { excess: 10_000 }, |_, origin| {
            origin == "https://a.com"
        });
        assert_eq!(victims, vec![(c, 100)]);
    }

    #[test]
    fn engine_measurement_absorbs_cached_total() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        tree.seed_origin(&a, &seeded(100, 1));
        tree.set_engine_usage(&a.client(EngineKind::Document), 60, 2);
        assert_eq!(tree.origin_usage(&a).map(|r| r.usage.total()), Some(100));
        tree.set_engine_usage(&a.client(EngineKind::Document), 80, 3);
        assert_eq!(tree.origin_usage(&a).map(|r| r.usage.total()), Some(120));
        assert!(tree.is_consistent());
    }

    #[test]
    fn prune_removes_only_unused_records() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        tree.seed_origin(&a, &seeded(0, 1));
        tree.persist(&a, 2);
        assert!(!tree.prune_if_unused(a.persistence, "https://a.com"));

        let b = key(PersistenceKind::Default, "https://b.com", "b.com");
        tree.seed_origin(&b, &seeded(0, 1));
        assert!(tree.prune_if_unused(b.persistence, "https://b.com"));
        assert!(!tree.contains(&b));
        assert!(tree.is_consistent());
    }

    #[test]
    fn usage_reported_after_a_prune_reaches_the_cache_rows() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Temporary, "https://a.com", "a.com");
        tree.materialize(&a, 1);
        assert!(tree.prune_if_unused(a.persistence, "https://a.com"));

        tree.adjust_usage(&a.client(EngineKind::KeyValue), 500, 2);
        let rows = tree.snapshot_rows();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].usage, 500);
    }

    #[test]
    fn pending_records_stay_out_of_the_cache_rows() {
        let mut tree = UsageTree::new(LIMITS);
        let a = key(PersistenceKind::Default, "https://a.com", "a.com");
        tree.persist(&a, 1);
        tree.adjust_usage(&a.client(EngineKind::Cache), -10, 2);
        assert!(tree.snapshot_rows().is_empty());
    }

    proptest! {
        #[test]
        fn aggregation_holds_after_every_adjustment(
            ops in prop::collection::vec((0usize..4, 0usize..3, 0usize..4, -500i64..500), 1..64)
        ) {
            let origins = ["https://a.com", "https://b.a.com", "https://c.com", "https://d.org"];
            let groups = ["a.com", "a.com", "c.com", "d.org"];
            let mut tree = UsageTree::new(LIMITS);
            for (origin, kind, engine, delta) in ops {
                let kind = PersistenceKind::ALL[kind];
                let key = key(kind, origins[origin], groups[origin]);
                tree.adjust_usage(&key.client(EngineKind::ALL[engine]), delta, 0);
                prop_assert!(tree.is_consistent());
            }
        }
    }
}
