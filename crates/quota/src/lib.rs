//! # Quota
//!
//! Coordinates storage engines that share per-origin directories below one root.
//!
//! * **Directory locks** ([`lock`]): hierarchical, insertion-ordered, shared or exclusive.
//! * **Usage tree**: per-origin and per-group byte counters with LRU eviction of temporary
//!   storage once a global or group ceiling is exceeded.
//! * **Initialization**: storage, persistent, temporary, group, origin and client scopes are each
//!   bootstrapped once; concurrent requests share the attempt in flight.
//! * **Operations**: clear, usage enumeration, persist and shutdown run through a four-phase
//!   pipeline that takes its directory lock on the coordinator and does disk work on the pool.
//!
//! [`QuotaManager`] composes all of it behind async entry points.
//!
//! ## Example
//!
//! ```rust,no_run
//! use qhub_domain::{EngineKind, PersistenceKind, PrincipalKey};
//! use qhub_quota::QuotaManager;
//!
//! # async fn run() -> Result<(), qhub_quota::QuotaError> {
//! let manager = QuotaManager::builder().root("./storage").build()?;
//! let client = PrincipalKey::new("https://a.com", "a.com", "")
//!     .with_persistence(PersistenceKind::Default)
//!     .client(EngineKind::Cache);
//!
//! let lock = manager.open_client_directory(client.clone(), true).await?;
//! manager.update_usage(&client, 4096);
//! drop(lock);
//!
//! manager.shutdown().await?;
//! # Ok(())
//! # }
//! ```

mod builder;
mod cache;
mod engine;
mod error;
mod fs;
mod init;
pub mod layout;
pub mod lock;
mod manager;
mod pipeline;
mod state;
mod usage;

pub use builder::{NoRoot, QuotaManagerBuilder, WithRoot};
pub use cache::{FileUsageCache, UsageCache};
pub use tokio_util::sync::CancellationToken;
pub use engine::{DirectoryEngine, StorageEngine};
pub use error::{ErrorKind, QuotaError, QuotaErrorExt};
pub use fs::{Filesystem, OriginMetadata};
pub use lock::{BlockerSnapshot, DirectoryLock, LockId, LockScope, OriginPattern, OriginScope, PendingLock};
pub use manager::{QuotaManager, UsageReporter};
pub use pipeline::{CallbackOptions, ClearTarget, OperationCallbacks, OperationListeners, PipelineState};
pub use usage::{CachedOrigin, Estimate, Limits, OriginSeed, OriginUsage, Overage, UsageSnapshot};
