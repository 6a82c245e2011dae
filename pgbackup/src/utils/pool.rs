//! Bounded worker pool for file-level parallelism.
//!
//! Every item runs on the blocking thread pool behind a semaphore with
//! `threads` permits. The first real failure cancels the remaining items;
//! an external cancellation surfaces as [`EngineError::Interrupted`].

use crate::utils::errors::{EngineError, Result};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Run `work` over every item with at most `threads` items in flight.
///
/// Results are returned in input order.
pub async fn run_bounded<I, R, F>(
    items: Vec<I>,
    threads: usize,
    cancel: &CancellationToken,
    work: F,
) -> Result<Vec<R>>
where
    I: Send + 'static,
    R: Send + 'static,
    F: Fn(I) -> Result<R> + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let semaphore = Arc::new(Semaphore::new(threads.max(1)));
    let abort = cancel.child_token();

    let mut handles = Vec::with_capacity(items.len());
    for item in items {
        let sem = Arc::clone(&semaphore);
        let work = Arc::clone(&work);
        let abort = abort.clone();

        handles.push(tokio::spawn(async move {
            let permit = tokio::select! {
                permit = sem.acquire_owned() => permit
                    .map_err(|e| EngineError::Worker(format!("Semaphore closed: {}", e)))?,
                _ = abort.cancelled() => return Err(EngineError::interrupted()),
            };

            if abort.is_cancelled() {
                return Err(EngineError::interrupted());
            }

            let result = tokio::task::spawn_blocking(move || (*work)(item))
                .await
                .map_err(|e| EngineError::Worker(format!("Worker task panicked: {}", e)))?;
            drop(permit);

            if result.is_err() {
                abort.cancel();
            }
            result
        }));
    }

    let mut results = Vec::with_capacity(handles.len());
    let mut first_error: Option<EngineError> = None;

    for handle in handles {
        let outcome = match handle.await {
            Ok(outcome) => outcome,
            Err(e) => Err(EngineError::Worker(format!("Worker task failed: {}", e))),
        };

        match outcome {
            Ok(value) => results.push(value),
            Err(e) => {
                abort.cancel();
                // Interruptions caused by a sibling failure are noise.
                let induced = matches!(e, EngineError::Interrupted(_)) && !cancel.is_cancelled();
                match &first_error {
                    None => first_error = Some(e),
                    Some(EngineError::Interrupted(_)) if !induced => first_error = Some(e),
                    Some(_) => debug!("Suppressed worker error: {}", e),
                }
            }
        }
    }

    if cancel.is_cancelled() {
        return Err(EngineError::interrupted());
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(results),
    }
}
