//! Submit-then-poll driver shared by every provider that runs asynchronous jobs.

use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// A job accepted by a provider and not yet finished. Lives for one call.
#[derive(Debug, Clone)]
pub struct ExternalJob {
    pub id: String,
    pub submitted_at: Instant,
    pub last_polled_status: Option<String>,
}

impl ExternalJob {
    fn new(id: String) -> Self {
        Self {
            id,
            submitted_at: Instant::now(),
            last_polled_status: None,
        }
    }
}

/// What one status check observed.
///
/// Providers translate their own status vocabulary into this; that mapping is
/// where "success" and "failure" get defined per provider.
#[derive(Debug)]
pub enum JobState<T> {
    /// Not terminal yet; carries the raw provider status for logging.
    Running(String),
    Succeeded(T),
    Failed { status: String, detail: String },
}

/// How long to keep checking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollBudget {
    /// Stop after this many status checks.
    Attempts(u32),
    /// Stop once this much time has passed since submission.
    WallClock(Duration),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub interval: Duration,
    pub budget: PollBudget,
}

impl PollPolicy {
    pub fn attempts(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            budget: PollBudget::Attempts(max_attempts),
        }
    }

    pub fn wall_clock(interval: Duration, limit: Duration) -> Self {
        Self {
            interval,
            budget: PollBudget::WallClock(limit),
        }
    }

    fn exhausted(&self, attempts: u32, job: &ExternalJob) -> bool {
        match self.budget {
            PollBudget::Attempts(max) => attempts >= max,
            PollBudget::WallClock(limit) => job.submitted_at.elapsed() >= limit,
        }
    }
}

/// Submit a job once, then check its status every `policy.interval` until it
/// reaches a terminal state or the budget runs out.
///
/// - `Succeeded` returns the extracted value. Extraction problems should be
///   returned from `check` as non-transient errors; they end the loop.
/// - `Failed` ends the loop with [`Error::JobFailed`]; it is never retried.
/// - Transient errors from `check` (see [`Error::is_transient`]) are logged
///   and retried within the budget.
/// - An exhausted budget yields [`Error::JobTimeout`].
pub async fn poll_until_terminal<T, S, SF, C, CF>(
    provider: &'static str,
    submit: S,
    mut check: C,
    policy: &PollPolicy,
) -> Result<T>
where
    S: FnOnce() -> SF,
    SF: Future<Output = Result<String>>,
    C: FnMut(String) -> CF,
    CF: Future<Output = Result<JobState<T>>>,
{
    let id = submit().await?;
    if id.trim().is_empty() {
        return Err(Error::MalformedResponse {
            provider,
            detail: "job submission returned an empty id".into(),
        });
    }

    let mut job = ExternalJob::new(id);
    info!(provider, job_id = %job.id, "job submitted");

    let mut attempts: u32 = 0;
    loop {
        if policy.exhausted(attempts, &job) {
            warn!(
                provider,
                job_id = %job.id,
                attempts,
                last_status = job.last_polled_status.as_deref().unwrap_or("none"),
                "job polling budget exhausted"
            );
            return Err(Error::JobTimeout {
                job_id: job.id,
                attempts,
                interval: policy.interval,
            });
        }

        tokio::time::sleep(policy.interval).await;
        attempts += 1;

        match check(job.id.clone()).await {
            Ok(JobState::Succeeded(value)) => {
                info!(provider, job_id = %job.id, attempts, "job completed");
                return Ok(value);
            }
            Ok(JobState::Failed { status, detail }) => {
                return Err(Error::JobFailed {
                    provider,
                    job_id: job.id,
                    status,
                    detail,
                });
            }
            Ok(JobState::Running(status)) => {
                debug!(provider, job_id = %job.id, attempt = attempts, %status, "job still running");
                job.last_polled_status = Some(status);
            }
            Err(e) if e.is_transient() => {
                warn!(provider, job_id = %job.id, attempt = attempts, error = %e, "status check failed, will retry");
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    fn script(states: Vec<Result<JobState<&'static str>>>) -> Mutex<VecDeque<Result<JobState<&'static str>>>> {
        Mutex::new(states.into())
    }

    fn transient() -> Error {
        Error::Transport {
            provider: "test",
            status: None,
            body: String::new(),
            message: "connection reset".into(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_returns_value_on_success() {
        let states = script(vec![
            Ok(JobState::Running("queued".into())),
            Ok(JobState::Running("processing".into())),
            Ok(JobState::Succeeded("done")),
        ]);
        let policy = PollPolicy::attempts(Duration::from_secs(5), 60);

        let started = Instant::now();
        let value = poll_until_terminal(
            "test",
            || async { Ok("job-1".to_string()) },
            |_| {
                let next = states.lock().unwrap().pop_front().unwrap();
                async move { next }
            },
            &policy,
        )
        .await
        .unwrap();

        assert_eq!(value, "done");
        assert_eq!(started.elapsed(), Duration::from_secs(15));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_short_circuits() {
        let checks = AtomicU32::new(0);
        let policy = PollPolicy::attempts(Duration::from_secs(5), 60);

        let err = poll_until_terminal::<(), _, _, _, _>(
            "test",
            || async { Ok("job-2".to_string()) },
            |_| {
                checks.fetch_add(1, Ordering::SeqCst);
                async {
                    Ok(JobState::Failed {
                        status: "failed".into(),
                        detail: "bad audio".into(),
                    })
                }
            },
            &policy,
        )
        .await
        .unwrap_err();

        assert_eq!(checks.load(Ordering::SeqCst), 1);
        match err {
            Error::JobFailed { job_id, status, .. } => {
                assert_eq!(job_id, "job-2");
                assert_eq!(status, "failed");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_are_retried() {
        let states = script(vec![
            Err(transient()),
            Err(transient()),
            Ok(JobState::Succeeded("ok")),
        ]);
        let policy = PollPolicy::attempts(Duration::from_secs(1), 5);

        let value = poll_until_terminal(
            "test",
            || async { Ok("job-3".to_string()) },
            |_| {
                let next = states.lock().unwrap().pop_front().unwrap();
                async move { next }
            },
            &policy,
        )
        .await
        .unwrap();
        assert_eq!(value, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_malformed_result_is_not_retried() {
        let checks = AtomicU32::new(0);
        let policy = PollPolicy::attempts(Duration::from_secs(1), 5);

        let err = poll_until_terminal::<(), _, _, _, _>(
            "test",
            || async { Ok("job-4".to_string()) },
            |_| {
                checks.fetch_add(1, Ordering::SeqCst);
                async {
                    Err(Error::MalformedResponse {
                        provider: "test",
                        detail: "completed job has no audio url".into(),
                    })
                }
            },
            &policy,
        )
        .await
        .unwrap_err();

        assert_eq!(checks.load(Ordering::SeqCst), 1);
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempt_budget_exhaustion_times_out() {
        let checks = AtomicU32::new(0);
        let policy = PollPolicy::attempts(Duration::from_secs(5), 60);

        let started = Instant::now();
        let err = poll_until_terminal::<(), _, _, _, _>(
            "test",
            || async { Ok("job-5".to_string()) },
            |_| {
                checks.fetch_add(1, Ordering::SeqCst);
                async { Ok(JobState::Running("processing".into())) }
            },
            &policy,
        )
        .await
        .unwrap_err();

        assert_eq!(checks.load(Ordering::SeqCst), 60);
        assert!(started.elapsed() <= Duration::from_secs(5 * 60));
        match err {
            Error::JobTimeout {
                job_id,
                attempts,
                interval,
            } => {
                assert_eq!(job_id, "job-5");
                assert_eq!(attempts, 60);
                assert_eq!(interval, Duration::from_secs(5));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wall_clock_budget() {
        let policy = PollPolicy::wall_clock(Duration::from_secs(5), Duration::from_secs(60));

        let started = Instant::now();
        let err = poll_until_terminal::<(), _, _, _, _>(
            "test",
            || async { Ok("job-6".to_string()) },
            |_| async { Ok(JobState::Running("IN_PROGRESS".into())) },
            &policy,
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::JobTimeout { attempts: 12, .. }));
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_error_skips_polling() {
        let checks = AtomicU32::new(0);
        let policy = PollPolicy::attempts(Duration::from_secs(1), 3);

        let err = poll_until_terminal::<(), _, _, _, _>(
            "test",
            || async {
                Err(Error::CredentialMissing {
                    provider: "test",
                    variable: "TEST_KEY",
                })
            },
            |_| {
                checks.fetch_add(1, Ordering::SeqCst);
                async { Ok(JobState::Succeeded(())) }
            },
            &policy,
        )
        .await
        .unwrap_err();

        assert_eq!(checks.load(Ordering::SeqCst), 0);
        assert!(matches!(err, Error::CredentialMissing { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_job_id_is_malformed() {
        let policy = PollPolicy::attempts(Duration::from_secs(1), 3);
        let err = poll_until_terminal::<(), _, _, _, _>(
            "test",
            || async { Ok("  ".to_string()) },
            |_| async { Ok(JobState::Succeeded(())) },
            &policy,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::MalformedResponse { .. }));
    }
}
