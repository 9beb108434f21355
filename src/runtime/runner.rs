use crate::processor::pipeline::{Pipeline, PipelineReport};
use anyhow::Result;
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Exit status used when a second signal interrupts the drain.
pub const FORCED_EXIT_CODE: i32 = 130;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownRequest {
    /// First request: stop producing heights and drain.
    Graceful,
    /// Any later request: the operator does not want to wait for the drain.
    Forced,
}

/// Counts shutdown requests against a root token.
#[derive(Debug, Clone)]
pub struct ShutdownController {
    token: CancellationToken,
    requests: Arc<AtomicUsize>,
}

impl ShutdownController {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            token,
            requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn request(&self) -> ShutdownRequest {
        if self.requests.fetch_add(1, Ordering::SeqCst) == 0 {
            self.token.cancel();
            ShutdownRequest::Graceful
        } else {
            ShutdownRequest::Forced
        }
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

/// Wires OS signals to a root [`CancellationToken`] and runs a pipeline under
/// it.
///
/// The first SIGINT/SIGTERM starts a graceful drain. A second one terminates
/// the process immediately with [`FORCED_EXIT_CODE`].
pub struct Runner {
    controller: ShutdownController,
    signals: Option<JoinHandle<()>>,
}

impl Default for Runner {
    fn default() -> Self {
        Self::new()
    }
}

impl Runner {
    pub fn new() -> Self {
        Self {
            controller: ShutdownController::new(CancellationToken::new()),
            signals: None,
        }
    }

    /// Root shutdown token; cancelling it has the same effect as a first
    /// signal.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.controller.token()
    }

    pub fn controller(&self) -> ShutdownController {
        self.controller.clone()
    }

    /// Starts listening for signals. Idempotent. Call early so that setup
    /// steps that retry (such as connecting the store) can be interrupted.
    pub fn listen_for_signals(&mut self) {
        if self.signals.is_some() {
            return;
        }
        let controller = self.controller.clone();
        self.signals = Some(tokio::spawn(watch_signals(controller)));
    }

    /// Runs `pipeline` until it stops, listening for signals meanwhile.
    pub async fn run(mut self, pipeline: Pipeline) -> Result<PipelineReport> {
        self.listen_for_signals();
        tracing::info!("runner started; send SIGINT or SIGTERM to stop");

        let result = pipeline.run(self.controller.token()).await;

        if let Some(handle) = self.signals.take() {
            handle.abort();
        }
        result
    }
}

impl Drop for Runner {
    fn drop(&mut self) {
        if let Some(handle) = self.signals.take() {
            handle.abort();
        }
    }
}

async fn watch_signals(controller: ShutdownController) {
    let mut signals = match Signals::install() {
        Ok(signals) => signals,
        Err(err) => {
            tracing::warn!(error = %err, "failed to install signal handlers");
            return;
        }
    };

    loop {
        let name = match signals.next().await {
            Ok(name) => name,
            Err(err) => {
                tracing::warn!(error = %err, "signal listener failed");
                return;
            }
        };

        match controller.request() {
            ShutdownRequest::Graceful => {
                tracing::info!(
                    signal = name,
                    "shutdown requested; draining in-flight heights (signal again to exit immediately)"
                );
            }
            ShutdownRequest::Forced => {
                tracing::warn!(
                    signal = name,
                    "forced exit during drain; in-flight heights may be missing from the store \
                     and manual recovery from the activity log may be required"
                );
                std::process::exit(FORCED_EXIT_CODE);
            }
        }
    }
}

struct Signals {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
}

impl Signals {
    fn install() -> io::Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: signal::unix::signal(signal::unix::SignalKind::terminate())?,
        })
    }

    async fn next(&mut self) -> io::Result<&'static str> {
        #[cfg(unix)]
        {
            tokio::select! {
                result = signal::ctrl_c() => result.map(|_| "SIGINT"),
                _ = self.terminate.recv() => Ok("SIGTERM"),
            }
        }
        #[cfg(not(unix))]
        {
            signal::ctrl_c().await.map(|_| "ctrl-c")
        }
    }
}
