//! Read-modify-write with bounded retry on optimistic-concurrency conflicts

use super::ClusterError;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Exponential backoff between conflict retries
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Backoff {
    /// Maximum number of attempts, including the first
    pub steps: u32,
    /// Delay after the first conflict
    pub initial: Duration,
    /// Multiplier applied to the delay after each conflict
    pub factor: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            steps: 4,
            initial: Duration::from_millis(10),
            factor: 5,
        }
    }
}

impl Backoff {
    fn delay(&self, attempt: u32) -> Duration {
        self.initial * self.factor.saturating_pow(attempt)
    }
}

/// Run `op` until it succeeds, fails with anything but a conflict, or the
/// backoff is exhausted
///
/// `op` must re-read the object it writes on every call so that each attempt
/// carries a fresh resourceVersion. The final conflict is returned as is.
///
/// # Example
/// ```ignore
/// retry_on_conflict(Backoff::default(), || async {
///     let mut hpa: HorizontalPodAutoscaler = cluster.get(ns, name).await?;
///     hpa.spec = Some(desired.clone());
///     cluster.replace(ns, &hpa).await?;
///     Ok(())
/// })
/// .await?;
/// ```
pub async fn retry_on_conflict<T, E, F, Fut>(backoff: Backoff, mut op: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: AsConflict,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt + 1 < backoff.steps => {
                let delay = backoff.delay(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Conflict, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// Errors that can report an optimistic-concurrency conflict
pub trait AsConflict {
    fn is_conflict(&self) -> bool;
}

impl AsConflict for ClusterError {
    fn is_conflict(&self) -> bool {
        ClusterError::is_conflict(self)
    }
}
