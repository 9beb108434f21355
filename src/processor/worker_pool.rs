//! Fixed-size pools of supervised tokio tasks.
//!
//! A worker that returns an error or panics is reported to the
//! [`FatalErrorHandler`], which cancels the run so the rest of the pipeline
//! drains.

use crate::runtime::fatal::FatalErrorHandler;
use anyhow::Result;
use futures::future::join_all;
use futures::FutureExt;
use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use tokio::task::JoinHandle;

pub(crate) struct WorkerPool {
    role: &'static str,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub(crate) fn launch<F, Fut>(
        role: &'static str,
        size: usize,
        fatal_handler: &FatalErrorHandler,
        mut make_worker: F,
    ) -> Self
    where
        F: FnMut(usize) -> Fut,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let workers = (0..size.max(1))
            .map(|worker_id| {
                spawn_supervised(role, worker_id, make_worker(worker_id), fatal_handler.clone())
            })
            .collect();

        tracing::debug!(role, size, "worker pool launched");
        Self { role, workers }
    }

    pub(crate) fn size(&self) -> usize {
        self.workers.len()
    }

    /// Waits for every worker to return.
    pub(crate) async fn join(self) {
        let role = self.role;
        for result in join_all(self.workers).await {
            if let Err(err) = result {
                tracing::warn!(role, error = %err, "worker task did not complete cleanly");
            }
        }
        tracing::debug!(role, "worker pool drained");
    }
}

fn spawn_supervised<Fut>(
    role: &'static str,
    worker_id: usize,
    task: Fut,
    fatal_handler: FatalErrorHandler,
) -> JoinHandle<()>
where
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        match AssertUnwindSafe(task).catch_unwind().await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::error!(role, worker = worker_id, error = %err, "worker exited with error");
                let context = format!("{role} worker {worker_id} exited with error");
                fatal_handler.trigger(&context, err.context(context.clone()));
            }
            Err(panic_payload) => {
                let panic_msg = panic_message(panic_payload.as_ref());
                tracing::error!(role, worker = worker_id, panic = %panic_msg, "worker panicked");
                let context = format!("{role} worker {worker_id} panicked");
                fatal_handler.trigger(&context, anyhow::anyhow!("{context}: {panic_msg}"));
            }
        }
    })
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
