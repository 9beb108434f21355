//! First-error-wins capture for failures that must stop the pipeline.

use anyhow::Error as AnyError;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Records the first fatal error and cancels both the run token and the root
/// token so every task starts draining.
#[derive(Clone)]
pub struct FatalErrorHandler {
    inner: Arc<FatalInner>,
}

struct FatalInner {
    triggered: AtomicBool,
    root_shutdown: CancellationToken,
    run_shutdown: CancellationToken,
    captured: Mutex<Option<CapturedFatalError>>,
}

#[derive(Clone)]
struct CapturedFatalError(Arc<AnyError>);

impl fmt::Debug for CapturedFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("CapturedFatalError").field(&self.0).finish()
    }
}

impl fmt::Display for CapturedFatalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Alternate form keeps the context chain in the final exit message.
        write!(f, "{:#}", self.0.as_ref())
    }
}

impl std::error::Error for CapturedFatalError {}

impl FatalErrorHandler {
    pub fn new(root_shutdown: CancellationToken, run_shutdown: CancellationToken) -> Self {
        Self {
            inner: Arc::new(FatalInner {
                triggered: AtomicBool::new(false),
                root_shutdown,
                run_shutdown,
                captured: Mutex::new(None),
            }),
        }
    }

    /// Captures `error` if it is the first one and starts shutdown. Later
    /// errors are logged at debug level and otherwise dropped.
    pub fn trigger(&self, context: &str, error: AnyError) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            tracing::debug!(context, error = %error, "additional fatal error after shutdown began");
            return;
        }

        tracing::error!(
            context,
            error = %format!("{error:#}"),
            "fatal pipeline error; initiating shutdown"
        );

        if let Ok(mut slot) = self.inner.captured.lock() {
            slot.get_or_insert_with(|| CapturedFatalError(Arc::new(error)));
        }

        self.inner.run_shutdown.cancel();
        self.inner.root_shutdown.cancel();
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn error(&self) -> Option<AnyError> {
        self.inner
            .captured
            .lock()
            .ok()?
            .as_ref()
            .map(|captured| AnyError::new(captured.clone()))
    }
}
