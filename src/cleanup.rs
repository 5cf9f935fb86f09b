use crate::error::Result;
use futures::future::{FutureExt, LocalBoxFuture};
use std::future::Future;
use tracing::{error, info};

struct Cleanup {
    name: String,
    action: LocalBoxFuture<'static, Result<()>>,
}

/// Deferred teardown actions, executed last-in first-out.
#[derive(Default)]
pub struct CleanupStack {
    actions: Vec<Cleanup>,
}

impl CleanupStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn defer<F>(&mut self, name: impl Into<String>, action: F)
    where
        F: Future<Output = Result<()>> + 'static,
    {
        self.actions.push(Cleanup {
            name: name.into(),
            action: action.boxed_local(),
        });
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    /// Runs every action, even after one fails, and returns the first error.
    pub async fn run(self) -> Result<()> {
        if self.is_empty() {
            return Ok(());
        }

        info!(count = self.len(), "running deferred cleanups");
        let mut first_error = None;

        for cleanup in self.actions.into_iter().rev() {
            info!(action = %cleanup.name, "running cleanup");

            if let Err(e) = cleanup.action.await {
                error!(action = %cleanup.name, error = %e, "cleanup failed");
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Runs `cleanups` and merges their outcome with the body's result, the
/// body's error taking precedence.
pub async fn finish<T>(result: Result<T>, cleanups: CleanupStack) -> Result<T> {
    let cleanup_result = cleanups.run().await;

    match (result, cleanup_result) {
        (Err(e), _) => Err(e),
        (Ok(_), Err(e)) => Err(e),
        (Ok(value), Ok(())) => Ok(value),
    }
}
