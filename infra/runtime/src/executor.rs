use crate::bound::{CoordinatorToken, mark_coordinator_thread};
use crate::{RuntimeConfig, build_runtime_with_config, normalize_config};
use anyhow::{Context, anyhow};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::Arc;
use tokio::runtime::{Builder, Handle};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

#[derive(Debug)]
struct Shared {
    coordinator: Handle,
    io: Handle,
    stop: Mutex<Option<oneshot::Sender<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.lock().take() {
            let _ = stop.send(());
        }
    }
}

/// The coordinator / worker-pool executor pair.
///
/// * The **coordinator** is a current-thread runtime driven by a dedicated OS thread, so every
///   task spawned with [`Executors::coordinate`] runs serially on that one thread.
/// * The **worker pool** is the blocking pool of a separate runtime; [`Executors::spawn_io`]
///   is the only way to reach it.
///
/// Cloning is cheap. Both runtimes stop once the last clone is dropped; the runtimes are torn
/// down on the coordinator thread itself, so dropping from inside an async context is safe.
#[derive(Debug, Clone)]
pub struct Executors {
    shared: Arc<Shared>,
}

impl Executors {
    /// Starts the coordinator thread and the worker pool described by `io_config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the coordinator thread or either runtime cannot be created.
    pub fn start(io_config: &RuntimeConfig) -> crate::Result<Self> {
        let config = normalize_config(io_config);
        let (ready_tx, ready_rx) = std::sync::mpsc::channel();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let thread_name = format!("{}-coordinator", config.thread_name);

        std::thread::Builder::new()
            .name(thread_name)
            .stack_size(config.stack_size)
            .spawn(move || {
                let coordinator = match Builder::new_current_thread().enable_all().build() {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(anyhow!("Failed to build coordinator: {e}")));
                        return;
                    },
                };
                let io = match build_runtime_with_config(&config) {
                    Ok(rt) => rt,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    },
                };

                if ready_tx.send(Ok((coordinator.handle().clone(), io.handle().clone()))).is_err()
                {
                    return;
                }

                mark_coordinator_thread();
                coordinator.block_on(async {
                    let _ = stop_rx.await;
                });

                io.shutdown_background();
                coordinator.shutdown_background();
                debug!("Coordinator thread stopped");
            })
            .context("Failed to spawn coordinator thread")?;

        let (coordinator, io) = ready_rx
            .recv()
            .map_err(|_| anyhow!("Coordinator thread exited during startup"))??;

        info!(io_threads = io_config.blocking_threads, "Executors started");

        Ok(Self {
            shared: Arc::new(Shared { coordinator, io, stop: Mutex::new(Some(stop_tx)) }),
        })
    }

    /// Runs `future` on the coordinator.
    pub fn coordinate<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.shared.coordinator.spawn(future)
    }

    /// Runs the blocking closure `f` on the worker pool.
    pub fn spawn_io<F, R>(&self, f: F) -> JoinHandle<R>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        self.shared.io.spawn_blocking(f)
    }

    /// Whether the caller is running on the coordinator thread.
    #[must_use]
    pub fn on_coordinator() -> bool {
        CoordinatorToken::current().is_some()
    }
}
