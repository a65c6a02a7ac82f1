//! Cooperative cancellation (spec §4.1 step 4, §4.5 "cancel wins").
//!
//! The job row is the source of truth (`cancel_requested_at`), so the only thing worth
//! keeping in-process is a cheap flag a long-running step can poll without round-tripping
//! to the database on every loop iteration.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use moonmind_core::ids::JobId;
use moonmind_core::Result;
use moonmind_db::Repository;

/// Cooperative-cancellation flag. Clone is cheap and shares state, same shape as the
/// teacher's worker-side token.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self {
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Poll `job_id`'s `cancel_requested_at` and trip `token` the first time it's observed
/// set. Returns whether the job is cancel-requested. Intended to be called once per
/// heartbeat cycle by whatever drives a job's execution loop.
pub async fn sync_cancellation(
    repo: &Repository,
    job_id: JobId,
    token: &CancellationToken,
) -> Result<bool> {
    if token.is_cancelled() {
        return Ok(true);
    }
    let job = repo.require_job(job_id).await?;
    if job.is_cancel_requested() {
        token.cancel();
        return Ok(true);
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_starts_uncancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }
}
