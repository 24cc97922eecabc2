//! Serving-loop supervisor
//!
//! The RPC server, the HTTP server and the demultiplexer each run as their
//! own task. The supervisor waits for whichever finishes first: a clean exit
//! ends the run successfully, an error ends it with that error, and
//! cancelling the governing token ends it with [`TransportError::Cancelled`].
//! Loops still running at that point are aborted.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;

use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::error::{BoxError, TransportError};

type LoopFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;

struct LoopExit {
    name: &'static str,
    result: Result<(), BoxError>,
}

/// Runs named serving loops until the first one exits
#[derive(Default)]
pub struct TransportSupervisor {
    loops: Vec<(&'static str, LoopFuture)>,
}

impl TransportSupervisor {
    /// Create an empty supervisor
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a serving loop
    pub fn with_loop<F, E>(mut self, name: &'static str, fut: F) -> Self
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
        E: Into<BoxError>,
    {
        self.loops
            .push((name, Box::pin(async move { fut.await.map_err(Into::into) })));
        self
    }

    /// Number of registered loops
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    /// Whether no loops are registered
    pub fn is_empty(&self) -> bool {
        self.loops.is_empty()
    }

    /// Start every loop and return when the first one exits or `cancel` fires
    pub async fn run(self, cancel: CancellationToken) -> Result<(), TransportError> {
        if self.loops.is_empty() {
            return Err(TransportError::NoLoops);
        }

        // one slot per loop so no sender ever blocks
        let (tx, mut rx) = mpsc::channel::<LoopExit>(self.loops.len());
        let mut tasks = JoinSet::new();

        for (name, fut) in self.loops {
            let tx = tx.clone();
            tasks.spawn(async move {
                let result = match AssertUnwindSafe(fut).catch_unwind().await {
                    Ok(result) => result,
                    Err(_) => Err(format!("{} panicked", name).into()),
                };
                let _ = tx.send(LoopExit { name, result }).await;
            });
        }
        drop(tx);

        let outcome = tokio::select! {
            exit = rx.recv() => match exit {
                Some(LoopExit { name, result: Ok(()) }) => {
                    tracing::info!("{} exited; shutting down transport", name);
                    Ok(())
                }
                Some(LoopExit { name, result: Err(source) }) => {
                    tracing::error!("{} failed: {}", name, source);
                    Err(TransportError::LoopFailed { name, source })
                }
                // every task reports before exiting, so this needs all of them aborted
                None => Err(TransportError::NoLoops),
            },
            _ = cancel.cancelled() => {
                tracing::info!("Transport cancelled");
                Err(TransportError::Cancelled)
            }
        };

        tasks.abort_all();
        outcome
    }
}
