//! # Runtime
//!
//! Tokio runtime profiles and the two-executor model used by the quota core.
//!
//! ## Profiles
//! * **High Performance**: larger stacks and longer keep-alive for long-running processes.
//! * **Memory Efficient**: fewer workers and smaller stacks for short-lived tools.
//! * **IO Pool**: a single async worker and a bounded blocking pool, used for directory mutation.
//!
//! ## Executors
//! [`Executors`] pairs a serial *coordinator* (a current-thread runtime on a dedicated thread)
//! with a *worker pool* (a blocking pool). State that only the coordinator may touch is wrapped
//! in [`ThreadBound`], which hands out its contents only against a [`CoordinatorToken`].
//!
//! ## Example
//!
//! ```rust,ignore
//! #[qhub_runtime::main(memory_efficient, worker_threads = 2)]
//! async fn main() -> anyhow::Result<()> {
//!     let executors = qhub_runtime::Executors::start(&qhub_runtime::RuntimeConfig::io_pool(4))?;
//!     let answer = executors.coordinate(async { 42 }).await?;
//!     assert_eq!(answer, 42);
//!     Ok(())
//! }
//! ```

mod bound;
mod executor;

pub use anyhow::Result;
pub use bound::{CoordinatorToken, ThreadBound};
pub use executor::Executors;
pub use qhub_derive::main;

use anyhow::anyhow;
use std::{sync::OnceLock, thread::available_parallelism, time::Duration};
use tokio::runtime::{Builder, Runtime};
use tracing::debug;

/// The default number of worker threads if detection fails.
const DEFAULT_WORKER_THREADS: usize = 4;
/// The default stack size for threads (3 `MiB`).
const DEFAULT_STACK_SIZE: usize = 3 * 1024 * 1024;
/// Minimum allowed stack size (1 `MiB`).
const MIN_STACK_SIZE: usize = 1024 * 1024;
/// Maximum allowed stack size (16 `MiB`).
const MAX_STACK_SIZE: usize = 16 * 1024 * 1024;
/// Upper bound of the blocking pool, matching Tokio's own default.
const DEFAULT_BLOCKING_THREADS: usize = 512;
/// How long an idle thread stays alive.
const THREAD_KEEP_ALIVE: Duration = Duration::from_secs(60);

static WORKER_THREADS: OnceLock<usize> = OnceLock::new();

/// Detects the worker thread count from `TOKIO_WORKER_THREADS` or the hardware.
fn get_worker_threads() -> usize {
    *WORKER_THREADS.get_or_init(|| {
        std::env::var("TOKIO_WORKER_THREADS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .filter(|&n| n > 0 && n <= 1024)
            .unwrap_or_else(|| {
                available_parallelism()
                    .map(std::num::NonZero::get)
                    .unwrap_or(DEFAULT_WORKER_THREADS)
            })
    })
}

fn validate_stack_size(stack_size: usize) -> usize {
    stack_size.clamp(MIN_STACK_SIZE, MAX_STACK_SIZE)
}

fn valid_thread_name(name: &str) -> String {
    if name.trim().is_empty() { "qhub-worker".to_owned() } else { name.to_owned() }
}

pub(crate) fn normalize_config(config: &RuntimeConfig) -> RuntimeConfig {
    RuntimeConfig {
        worker_threads: config.worker_threads.clamp(1, 1024),
        blocking_threads: config.blocking_threads.clamp(1, DEFAULT_BLOCKING_THREADS),
        stack_size: validate_stack_size(config.stack_size),
        thread_name: valid_thread_name(&config.thread_name),
        thread_keep_alive: config.thread_keep_alive,
    }
}

/// Configuration for a multi-threaded Tokio runtime.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub worker_threads: usize,
    pub blocking_threads: usize,
    pub stack_size: usize,
    pub thread_name: String,
    pub thread_keep_alive: Duration,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: get_worker_threads(),
            blocking_threads: DEFAULT_BLOCKING_THREADS,
            stack_size: DEFAULT_STACK_SIZE,
            thread_name: "qhub-worker".to_owned(),
            thread_keep_alive: THREAD_KEEP_ALIVE,
        }
    }
}

impl RuntimeConfig {
    /// Preset for long-running processes.
    #[must_use = "Use this configuration for long-running processes"]
    pub fn high_performance() -> Self {
        Self {
            worker_threads: get_worker_threads(),
            stack_size: 4 * 1024 * 1024,
            thread_name: "qhub-hp".to_owned(),
            thread_keep_alive: Duration::from_secs(300),
            ..Self::default()
        }
    }

    /// Preset for short-lived tools where memory footprint matters.
    #[must_use = "Use this configuration for short-lived tools"]
    pub fn memory_efficient() -> Self {
        Self {
            worker_threads: (get_worker_threads() / 2).max(1),
            stack_size: 2 * 1024 * 1024,
            thread_name: "qhub-mem".to_owned(),
            thread_keep_alive: Duration::from_secs(30),
            ..Self::default()
        }
    }

    /// Preset for the directory-mutation worker pool: one async worker, `threads` blocking threads.
    #[must_use = "Use this configuration for the blocking I/O pool"]
    pub fn io_pool(threads: usize) -> Self {
        Self {
            worker_threads: 1,
            blocking_threads: threads.max(1),
            thread_name: "qhub-io".to_owned(),
            ..Self::default()
        }
    }

    #[must_use = "Customize the number of worker threads for the runtime"]
    pub fn with_worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads.clamp(1, 1024);
        self
    }

    #[must_use = "Customize the blocking pool size"]
    pub fn with_blocking_threads(mut self, threads: usize) -> Self {
        self.blocking_threads = threads.clamp(1, DEFAULT_BLOCKING_THREADS);
        self
    }

    #[must_use = "Customize the stack size for worker threads"]
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = validate_stack_size(size);
        self
    }

    #[must_use = "Customize the thread name"]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = valid_thread_name(&name.into());
        self
    }

    #[must_use = "Customize how long idle threads stay alive"]
    pub const fn with_thread_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.thread_keep_alive = keep_alive;
        self
    }
}

/// Creates a multi-threaded Tokio runtime from `config`.
///
/// Values outside the supported bounds are clamped rather than rejected.
///
/// # Errors
///
/// Returns an [`anyhow::Error`] if the runtime cannot be created, typically because the OS
/// refused to spawn threads.
pub fn build_runtime_with_config(config: &RuntimeConfig) -> Result<Runtime> {
    let config = normalize_config(config);
    debug!(config = ?config, "Building tokio runtime");

    let mut builder = Builder::new_multi_thread();
    builder
        .worker_threads(config.worker_threads)
        .max_blocking_threads(config.blocking_threads)
        .thread_name(&config.thread_name)
        .thread_stack_size(config.stack_size)
        .thread_keep_alive(config.thread_keep_alive);

    builder.enable_all();

    builder.build().map_err(|e| anyhow!("Failed to initialize runtime: {e}"))
}
