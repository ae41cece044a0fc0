//! Compile-time composition-root shutdown aggregation, grounded on
//! `original_source/pkg/io/lifecycle.go`'s `Closer`/`Closers`. Replaces the reflective
//! DI container some revisions of the source used (original spec §9 design note).

use std::time::Duration;

use tracing::error;

type CloseFuture = std::pin::Pin<Box<dyn std::future::Future<Output = anyhow::Result<()>> + Send>>;

pub struct Closer {
    name: &'static str,
    close: Box<dyn FnOnce() -> CloseFuture + Send>,
}

impl Closer {
    pub fn new<F, Fut>(name: &'static str, close: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name,
            close: Box::new(move || Box::pin(close())),
        }
    }
}

/// An aggregate of shutdown handles, closed in reverse construction order under a
/// bounded deadline. Built up by the composition root as each dependency is
/// constructed; errors are logged but never block shutdown past the deadline.
#[derive(Default)]
pub struct Closers(Vec<Closer>);

impl Closers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, closer: Closer) {
        self.0.push(closer);
    }

    /// Runs every registered closer, most-recently-constructed first, bounding the
    /// whole sequence by `timeout`. A closer that errors or overruns is logged and
    /// the remaining closers still run on whatever time budget is left.
    pub async fn close_with_timeout(self, timeout: Duration) {
        let deadline = tokio::time::Instant::now() + timeout;

        for closer in self.0.into_iter().rev() {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                error!(component = closer.name, "shutdown deadline exceeded, abandoning");
                continue;
            }

            match tokio::time::timeout(remaining, (closer.close)()).await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => error!(component = closer.name, %err, "error during shutdown"),
                Err(_) => error!(component = closer.name, "shutdown timed out"),
            }
        }
    }
}
