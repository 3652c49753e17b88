use crate::cache::{FileUsageCache, UsageCache};
use crate::engine::{DirectoryEngine, StorageEngine};
use crate::error::{QuotaError, QuotaErrorExt};
use crate::fs::Filesystem;
use crate::init::InitMarkers;
use crate::manager::{ManagerInner, QuotaManager};
use crate::state::SharedState;
use crate::usage::Limits;
use private::Sealed;
use qhub_domain::config::QuotaConfig;
use qhub_runtime::{Executors, RuntimeConfig, ThreadBound};
use qhub_storage::Storage;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::info;

#[derive(Debug, Default)]
pub struct NoRoot;
#[derive(Debug)]
pub struct WithRoot(PathBuf);

mod private {
    pub(super) trait Sealed {}
}
impl Sealed for NoRoot {}
impl Sealed for WithRoot {}

/// Builds a [`QuotaManager`]. Only `root` is required; everything else falls back to the
/// reference implementations configured by [`QuotaConfig`].
#[allow(private_bounds)]
#[derive(Debug, Default)]
pub struct QuotaManagerBuilder<S: Sealed = NoRoot> {
    state: S,
    config: QuotaConfig,
    engines: Vec<Arc<dyn StorageEngine>>,
    fs: Option<Arc<dyn Filesystem>>,
    cache: Option<Arc<dyn UsageCache>>,
    executors: Option<Executors>,
}

#[allow(private_bounds)]
impl<S: Sealed> QuotaManagerBuilder<S> {
    #[must_use = "Sets limits, engines and cache options"]
    pub fn config(mut self, config: QuotaConfig) -> Self {
        self.config = config;
        self
    }

    /// Adds an engine. When none is added, a [`DirectoryEngine`] per configured engine is used.
    #[must_use = "Registers a storage engine"]
    pub fn engine(mut self, engine: Arc<dyn StorageEngine>) -> Self {
        self.engines.push(engine);
        self
    }

    #[must_use = "Replaces the filesystem adapter"]
    pub fn filesystem(mut self, fs: Arc<dyn Filesystem>) -> Self {
        self.fs = Some(fs);
        self
    }

    #[must_use = "Replaces the usage cache"]
    pub fn cache(mut self, cache: Arc<dyn UsageCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    #[must_use = "Shares existing executors"]
    pub fn executors(mut self, executors: Executors) -> Self {
        self.executors = Some(executors);
        self
    }

    fn transition<N: Sealed>(self, state: N) -> QuotaManagerBuilder<N> {
        QuotaManagerBuilder {
            state,
            config: self.config,
            engines: self.engines,
            fs: self.fs,
            cache: self.cache,
            executors: self.executors,
        }
    }
}

impl QuotaManagerBuilder<NoRoot> {
    #[must_use = "Creates a new quota manager builder"]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use = "Sets the storage root"]
    pub fn root(self, path: impl Into<PathBuf>) -> QuotaManagerBuilder<WithRoot> {
        self.transition(WithRoot(path.into()))
    }
}

impl QuotaManagerBuilder<WithRoot> {
    /// Opens the storage root and starts the executors.
    ///
    /// # Errors
    ///
    /// Returns [`QuotaError::Storage`] if the root cannot be created.
    /// Returns [`QuotaError::Io`] if the executors cannot start.
    /// Returns [`QuotaError::InvalidArgument`] if two engines share a kind.
    pub fn build(self) -> Result<QuotaManager, QuotaError> {
        let storage = Storage::builder().root(&self.state.0).open().context("Opening storage root")?;
        let root = storage.root().to_path_buf();

        let engines = if self.engines.is_empty() {
            self.config
                .engines
                .kinds()
                .map(|kind| Arc::new(DirectoryEngine::new(kind)) as Arc<dyn StorageEngine>)
                .collect()
        } else {
            self.engines
        };
        for (i, engine) in engines.iter().enumerate() {
            if engines[..i].iter().any(|other| other.kind() == engine.kind()) {
                return Err(QuotaError::invalid(format!("engine '{}' registered twice", engine.kind())));
            }
        }

        let cache = match self.cache {
            Some(cache) => Some(cache),
            None if self.config.usage_cache => {
                Some(Arc::new(FileUsageCache::open(&root, self.config.cache_compression)?) as Arc<dyn UsageCache>)
            },
            None => None,
        };

        let executors = match self.executors {
            Some(executors) => executors,
            None => Executors::start(&RuntimeConfig::io_pool(self.config.io_threads))
                .map_err(std::io::Error::other)
                .context("Starting executors")?,
        };

        let limits = Limits { global: self.config.temporary_limit, group: self.config.group_limit() };
        let fs = self.fs.unwrap_or_else(|| Arc::new(storage));
        info!(
            root = %root.display(),
            global_limit = limits.global,
            group_limit = limits.group,
            engines = engines.len(),
            cache = cache.is_some(),
            "Quota manager ready"
        );

        Ok(QuotaManager {
            inner: Arc::new(ManagerInner {
                executors,
                state: Arc::new(SharedState::new(limits)),
                fs,
                root,
                engines,
                cache,
                markers: ThreadBound::new(InitMarkers::default()),
                maintenance: ThreadBound::new(false),
                evicting: AtomicBool::new(false),
            }),
        })
    }
}
