//! Single designated execution context for endpoint handlers.
//!
//! Handlers touch host state that is only safe to use from one thread, so
//! every handler future is polled on a dedicated thread that owns a
//! current-thread runtime. Callers on any runtime hand work over and await
//! the result.

use crate::error::RemoteError;
use futures::future::LocalBoxFuture;
use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::thread;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

type Job = Box<dyn FnOnce() -> LocalBoxFuture<'static, ()> + Send>;

/// Handle to a handler thread. Clones feed the same thread; the thread exits
/// once every clone is dropped and its queued work has finished.
#[derive(Clone)]
pub struct HandlerExecutor {
    jobs: mpsc::UnboundedSender<Job>,
    name: Arc<str>,
}

impl HandlerExecutor {
    /// Start a new handler thread.
    ///
    /// If the thread or its runtime cannot be created the failure is logged
    /// and every later [`run`](Self::run) reports `unavailable`.
    pub fn spawn(name: &str) -> Self {
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();
        let thread_name = name.to_string();

        let started = thread::Builder::new()
            .name(thread_name.clone())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(err) => {
                        error!(thread = %thread_name, error = %err, "failed to build handler runtime");
                        return;
                    }
                };
                let local = tokio::task::LocalSet::new();
                local.block_on(&runtime, async move {
                    while let Some(job) = queue.recv().await {
                        tokio::task::spawn_local(job());
                    }
                });
                // Let handlers that are still running finish.
                runtime.block_on(local);
                debug!(thread = %thread_name, "handler executor stopped");
            });

        if let Err(err) = started {
            error!(thread = %name, error = %err, "failed to spawn handler thread");
        }

        Self {
            jobs,
            name: Arc::from(name),
        }
    }

    /// Process-wide executor shared by every dispatcher that does not bring
    /// its own.
    pub fn shared() -> HandlerExecutor {
        static SHARED: OnceLock<HandlerExecutor> = OnceLock::new();
        SHARED
            .get_or_init(|| HandlerExecutor::spawn("encore-handlers"))
            .clone()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `task` on the handler thread and wait for its output.
    ///
    /// The future built by `task` does not need to be `Send`; it never leaves
    /// the handler thread.
    pub async fn run<F, Fut, T>(&self, task: F) -> Result<T, RemoteError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let job: Job = Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(task().await);
            })
        });
        self.jobs
            .send(job)
            .map_err(|_| RemoteError::unavailable("handler executor has shut down"))?;
        rx.await
            .map_err(|_| RemoteError::unavailable("handler stopped before producing a result"))
    }
}

impl std::fmt::Debug for HandlerExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerExecutor")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}
