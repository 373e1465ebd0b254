//! Lifecycle Management
//!
//! Fail-stop plumbing shared by the elector and the observer: a resettable,
//! cancellable run context, a one-shot done signal and OS shutdown signal
//! handling. Nothing in here knows about leadership.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Read-only view of a shutdown signal.
///
/// Once fired it stays fired forever. Cloning is cheap and every clone
/// observes the same signal.
#[derive(Debug, Clone)]
pub struct Done(CancellationToken);

impl Done {
    /// A signal that only fires if someone holding the token cancels it.
    /// Useful for collaborators that never stop on their own.
    pub fn never() -> Self {
        Self(CancellationToken::new())
    }

    /// Check whether the signal has fired
    pub fn is_done(&self) -> bool {
        self.0.is_cancelled()
    }

    /// Wait until the signal fires
    pub async fn wait(&self) {
        self.0.cancelled().await
    }
}

impl From<CancellationToken> for Done {
    fn from(token: CancellationToken) -> Self {
        Self(token)
    }
}

/// Fail-stop primitive.
///
/// The run context is always a child of the done token, so `stonith`
/// cancels whatever context is current and any context handed out by a
/// later `reset` is born cancelled.
#[derive(Clone)]
pub struct Stonither {
    inner: Arc<StonitherInner>,
}

struct StonitherInner {
    /// Current run context
    context: Mutex<CancellationToken>,
    /// Fired exactly once, never reset
    done: CancellationToken,
    /// Set by the first effective stonith
    stopped: AtomicBool,
}

impl Stonither {
    /// Create a new lifecycle with a fresh run context
    pub fn new() -> Self {
        let done = CancellationToken::new();
        let context = done.child_token();
        Self {
            inner: Arc::new(StonitherInner {
                context: Mutex::new(context),
                done,
                stopped: AtomicBool::new(false),
            }),
        }
    }

    fn context_guard(&self) -> MutexGuard<'_, CancellationToken> {
        self.inner
            .context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Get the current run context
    pub fn context(&self) -> CancellationToken {
        self.context_guard().clone()
    }

    /// Cancel the run context and fire the done signal.
    ///
    /// Safe to call concurrently and repeatedly; returns `true` only for
    /// the call that actually stopped the lifecycle.
    pub fn stonith(&self) -> bool {
        let first = !self.inner.stopped.swap(true, Ordering::SeqCst);
        self.context_guard().cancel();
        self.inner.done.cancel();
        if first {
            tracing::info!("stonith: run context cancelled, done signal fired");
        }
        first
    }

    /// Replace the run context with a fresh one, cancelling the previous one.
    /// The done signal is left untouched.
    pub fn reset(&self) -> CancellationToken {
        let mut context = self.context_guard();
        context.cancel();
        *context = self.inner.done.child_token();
        context.clone()
    }

    /// Get the done signal
    pub fn done(&self) -> Done {
        Done(self.inner.done.clone())
    }

    /// Check whether stonith has been called
    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Hook SIGINT/SIGTERM: the first signal triggers `stonith`, a second one
    /// while still shutting down terminates the process.
    ///
    /// The listener task ends on its own if the lifecycle stops before any
    /// signal arrives.
    pub fn install_os_signals(&self) -> Result<JoinHandle<()>> {
        let mut signals = ShutdownSignals::new()?;
        let stonither = self.clone();
        let done = self.done();

        Ok(tokio::spawn(async move {
            tokio::select! {
                _ = signals.recv() => {}
                _ = done.wait() => {
                    tracing::debug!("lifecycle stopped, releasing signal listener");
                    return;
                }
            }
            tracing::warn!("Received shutdown signal, stopping...");
            stonither.stonith();

            signals.recv().await;
            tracing::error!("Received second shutdown signal, exiting now");
            std::process::exit(1);
        }))
    }
}

impl Default for Stonither {
    fn default() -> Self {
        Self::new()
    }
}

/// Interrupt and terminate signal listener
struct ShutdownSignals {
    #[cfg(unix)]
    terminate: tokio::signal::unix::Signal,
}

impl ShutdownSignals {
    fn new() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?,
        })
    }

    #[cfg(unix)]
    async fn recv(&mut self) {
        tokio::select! {
            Ok(()) = tokio::signal::ctrl_c() => {}
            Some(()) = self.terminate.recv() => {}
            else => std::future::pending::<()>().await,
        }
    }

    #[cfg(not(unix))]
    async fn recv(&mut self) {
        if tokio::signal::ctrl_c().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}
