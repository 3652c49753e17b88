//! Per-scope bootstrap: storage root, persistent root, temporary root, group, origin, client.
//!
//! Every initializer runs on the coordinator through [`tracker::run`], so concurrent callers
//! share one attempt and a finished scope does no further I/O until it is reset.

mod tracker;

pub(crate) use tracker::{InitMarkers, with_markers};

use crate::engine::StorageEngine;
use crate::error::QuotaError;
use crate::fs::{Filesystem, OriginMetadata};
use crate::layout;
use crate::lock::LockScope;
use crate::manager::ManagerInner;
use crate::usage::{OriginSeed, eviction, now};
use fxhash::FxHashMap;
use qhub_domain::{ClientKey, OriginKey, PersistenceKind, PrincipalKey};
use qhub_kernel::security::OriginGuard;
use std::sync::Arc;
use tracker::{InitTracker, always, run};
use tracing::{debug, info, warn};

fn storage(m: &mut InitMarkers) -> &mut InitTracker<(), ()> {
    &mut m.storage
}

fn persistent(m: &mut InitMarkers) -> &mut InitTracker<(), ()> {
    &mut m.persistent
}

fn temporary(m: &mut InitMarkers) -> &mut InitTracker<(), ()> {
    &mut m.temporary
}

fn groups(m: &mut InitMarkers) -> &mut InitTracker<String, ()> {
    &mut m.groups
}

fn origins(m: &mut InitMarkers) -> &mut InitTracker<OriginKey, bool> {
    &mut m.origins
}

fn clients(m: &mut InitMarkers) -> &mut InitTracker<ClientKey, ()> {
    &mut m.clients
}

const fn exists(value: &bool) -> bool {
    *value
}

/// Creates the repository directories. Returns whether this call did the work.
pub(crate) async fn initialize_storage(inner: &Arc<ManagerInner>) -> Result<bool, QuotaError> {
    let (_, fresh) = run(&inner.markers, storage, (), always, async {
        let missing = {
            let _lock = inner.lock(LockScope::universal(), false).await?;
            inner
                .blocking(|fs| {
                    let mut missing = Vec::new();
                    for kind in PersistenceKind::ALL {
                        if !fs.exists(&layout::repository_dir(kind))? {
                            missing.push(kind);
                        }
                    }
                    Ok(missing)
                })
                .await?
        };

        for kind in missing {
            let _lock = inner.lock(LockScope::repository(kind), true).await?;
            inner.blocking(move |fs| fs.create_directory(&layout::repository_dir(kind))).await?;
            debug!(repository = %kind, "Repository created");
        }
        info!("Storage initialized");
        Ok(())
    })
    .await?;
    Ok(fresh)
}

/// Scans the persistent repository and seeds its origins.
pub(crate) async fn initialize_persistent_storage(inner: &Arc<ManagerInner>) -> Result<bool, QuotaError> {
    initialize_storage(inner).await?;
    let (_, fresh) = run(&inner.markers, persistent, (), always, async {
        let _lock = inner.lock(LockScope::repository(PersistenceKind::Persistent), false).await?;
        let engines = inner.engines.clone();
        let scanned = inner
            .blocking(move |fs| {
                let mut seeds = Vec::new();
                let repository = layout::repository_dir(PersistenceKind::Persistent);
                for name in fs.list_directories(&repository)? {
                    seeds.extend(scan_origin(fs, &engines, PersistenceKind::Persistent, &name)?);
                }
                Ok(seeds)
            })
            .await?;

        seed_scanned(inner, &scanned)?;
        info!(origins = scanned.len(), "Persistent storage initialized");
        Ok(())
    })
    .await?;
    Ok(fresh)
}

/// Seeds the usage tree for temporary storage, from the usage cache where its rows still match a
/// directory on disk and from the engines otherwise, then enforces the limits.
pub(crate) async fn initialize_temporary_storage(inner: &Arc<ManagerInner>) -> Result<bool, QuotaError> {
    initialize_storage(inner).await?;
    let (_, fresh) = run(&inner.markers, temporary, (), always, async {
        let scanned = {
            let _lock = inner.lock(LockScope::universal(), false).await?;
            let engines = inner.engines.clone();
            let cache = inner.cache.clone();
            let scanned = inner
                .blocking(move |fs| {
                    let cached = match cache {
                        Some(cache) => {
                            let rows = cache.load()?;
                            cache.invalidate()?;
                            rows.unwrap_or_default()
                        },
                        None => Vec::new(),
                    };
                    let mut by_directory: FxHashMap<(PersistenceKind, String), _> = cached
                        .into_iter()
                        .map(|row| ((row.persistence, OriginGuard::sanitize(&row.key().full_origin())), row))
                        .collect();

                    let mut seeds = Vec::new();
                    for kind in PersistenceKind::BEST_EFFORT {
                        for name in fs.list_directories(&layout::repository_dir(kind))? {
                            if let Some(row) = by_directory.remove(&(kind, name.clone())) {
                                let seed = OriginSeed {
                                    usage: row.usage,
                                    access_time: row.access_time,
                                    persisted: row.persisted,
                                    directory_exists: true,
                                    ..OriginSeed::default()
                                };
                                seeds.push((row.key(), seed));
                            } else {
                                seeds.extend(scan_origin(fs, &engines, kind, &name)?);
                            }
                        }
                    }
                    if !by_directory.is_empty() {
                        debug!(stale = by_directory.len(), "Dropped cached rows without a directory");
                    }
                    Ok(seeds)
                })
                .await?;
            seed_scanned(inner, &scanned)?;
            scanned
        };

        let usage = inner.state.with(|core| core.usage.temporary_usage());
        info!(origins = scanned.len(), bytes = usage, "Temporary storage initialized");
        eviction::enforce_limits(inner).await?;
        Ok(())
    })
    .await?;
    Ok(fresh)
}

/// Makes sure the known origins of a group are initialized.
pub(crate) async fn initialize_group(
    inner: &Arc<ManagerInner>,
    principal: &PrincipalKey,
) -> Result<bool, QuotaError> {
    initialize_temporary_storage(inner).await?;
    let (_, fresh) = run(&inner.markers, groups, principal.group.clone(), always, async {
        let keys = inner.state.with(|core| core.usage.keys_in_group(&principal.group));
        for key in &keys {
            initialize_origin(inner, key, false).await?;
        }
        debug!(group = %principal.group, origins = keys.len(), "Group initialized");
        Ok(())
    })
    .await?;
    Ok(fresh)
}

/// Initializes the repository holding `persistence`.
pub(crate) async fn initialize_repository(
    inner: &Arc<ManagerInner>,
    persistence: PersistenceKind,
) -> Result<(), QuotaError> {
    if persistence.is_best_effort() {
        initialize_temporary_storage(inner).await?;
    } else {
        initialize_persistent_storage(inner).await?;
    }
    Ok(())
}

/// Returns whether the origin directory exists afterwards. A missing directory that was not
/// created is not remembered, so a later call with `create` still creates it.
///
/// A creating caller that attached to an attempt which did not create starts its own.
pub(crate) async fn initialize_origin(
    inner: &Arc<ManagerInner>,
    key: &OriginKey,
    create: bool,
) -> Result<bool, QuotaError> {
    initialize_repository(inner, key.persistence).await?;
    loop {
        let attempt = open_origin(inner, key, create);
        let (exists_now, _) = run(&inner.markers, origins, key.clone(), exists, attempt).await?;
        if exists_now || !create {
            return Ok(exists_now);
        }
        debug!(origin = %key, "Attached attempt did not create the origin, retrying");
    }
}

async fn open_origin(inner: &Arc<ManagerInner>, key: &OriginKey, create: bool) -> Result<bool, QuotaError> {
    let dir = layout::origin_dir(key);
    let present = {
        let _lock = inner.lock(LockScope::origin(key), false).await?;
        let dir = dir.clone();
        inner.blocking(move |fs| fs.exists(&dir)).await?
    };
    if present {
        inner.state.with(|core| core.usage.materialize(key, now()));
        return Ok(true);
    }
    if !create {
        return Ok(false);
    }

    let _lock = inner.lock(LockScope::origin(key), true).await?;
    let metadata = OriginMetadata { key: key.clone(), persisted: false, last_access: now() };
    inner
        .blocking(move |fs| {
            fs.create_directory(&dir)?;
            if fs.read_metadata(&dir)?.is_none() {
                fs.write_metadata(&dir, &metadata)?;
            }
            Ok(())
        })
        .await?;
    inner.state.with(|core| core.usage.materialize(key, now()));
    info!(origin = %key, "Origin initialized");
    Ok(true)
}

/// Creates the engine directory of `client` and records what the engine already holds.
pub(crate) async fn initialize_client(inner: &Arc<ManagerInner>, client: &ClientKey) -> Result<bool, QuotaError> {
    initialize_origin(inner, &client.origin, true).await?;
    let (_, fresh) = run(&inner.markers, clients, client.clone(), always, async {
        let engine = inner.engine(client.engine)?;
        let _lock = inner.lock(LockScope::client(client), true).await?;
        let (dir, origin) = (layout::client_dir(client), client.origin.clone());
        let bytes = inner
            .blocking(move |fs| {
                fs.create_directory(&dir)?;
                engine.init_origin(fs, &origin)
            })
            .await?;
        inner.state.with(|core| core.usage.set_engine_usage(client, bytes, now()));
        debug!(client = %client, bytes, "Client initialized");
        Ok(())
    })
    .await?;
    Ok(fresh)
}

/// Reads the metadata of one origin directory and asks every engine for its usage.
///
/// Directories without readable metadata are skipped.
fn scan_origin(
    fs: &dyn Filesystem,
    engines: &[Arc<dyn StorageEngine>],
    kind: PersistenceKind,
    name: &str,
) -> Result<Option<(OriginKey, OriginSeed)>, QuotaError> {
    let dir = layout::repository_dir(kind).join(name);
    let Some(metadata) = fs.read_metadata(&dir)? else {
        warn!(repository = %kind, directory = name, "Skipping origin directory without metadata");
        return Ok(None);
    };
    if metadata.key.persistence != kind {
        warn!(repository = %kind, origin = %metadata.key, "Skipping origin filed under another repository");
        return Ok(None);
    }

    let mut seed = OriginSeed {
        access_time: metadata.last_access,
        persisted: metadata.persisted,
        directory_exists: true,
        ..OriginSeed::default()
    };
    for engine in engines {
        seed.engine_usage[engine.kind().index()] = Some(engine.init_origin(fs, &metadata.key)?);
    }
    Ok(Some((metadata.key, seed)))
}

fn seed_scanned(inner: &ManagerInner, scanned: &[(OriginKey, OriginSeed)]) -> Result<(), QuotaError> {
    inner.state.with(|core| {
        for (key, seed) in scanned {
            core.usage.seed_origin(key, seed);
        }
    });
    with_markers(&inner.markers, |m| {
        for (key, _) in scanned {
            m.origins.mark_initialized(key.clone(), true);
        }
    })
}
