//! Job entity

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Deferred execution of an `async` activity
    AsyncContinuation,
    /// Timer event firing
    Timer,
}

impl JobKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AsyncContinuation => "async_continuation",
            Self::Timer => "timer",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "async_continuation" => Some(Self::AsyncContinuation),
            "timer" => Some(Self::Timer),
            _ => None,
        }
    }
}

impl std::fmt::Display for JobKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Work the async executor picks up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub kind: JobKind,
    pub instance_id: Uuid,
    pub execution_id: Uuid,
    pub activity_id: String,
    pub due_at: DateTime<Utc>,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub lock_owner: Option<String>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    /// Retries exhausted; only runs again after `set_job_retries`
    pub dead_letter: bool,
    pub created_at: DateTime<Utc>,
    pub revision: i64,
}

impl Job {
    pub(crate) fn new(
        kind: JobKind,
        instance_id: Uuid,
        execution_id: Uuid,
        activity_id: impl Into<String>,
        due_at: DateTime<Utc>,
        retries: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            kind,
            instance_id,
            execution_id,
            activity_id: activity_id.into(),
            due_at,
            retries,
            exception_message: None,
            lock_owner: None,
            lock_expires_at: None,
            dead_letter: false,
            created_at: now,
            revision: 0,
        }
    }

    /// Whether an acquisition at `now` may lock this job
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.dead_letter
            && self.due_at <= now
            && self.lock_expires_at.map_or(true, |expires| expires <= now)
    }

    /// Drop the lock so the next acquisition picks the job up again
    pub fn unlock(&mut self) {
        self.lock_owner = None;
        self.lock_expires_at = None;
    }

    /// Record a failed attempt
    ///
    /// The job is unlocked, due again after `retry_wait`, and moved to the
    /// dead letter state once no retries remain.
    pub fn record_failure(
        &mut self,
        message: impl Into<String>,
        now: DateTime<Utc>,
        retry_wait: std::time::Duration,
    ) {
        self.retries = self.retries.saturating_sub(1);
        self.exception_message = Some(message.into());
        self.unlock();
        if self.retries == 0 {
            self.dead_letter = true;
        } else {
            let wait = chrono::Duration::from_std(retry_wait).unwrap_or(chrono::Duration::zero());
            self.due_at = now + wait;
        }
    }
}

/// Filter for listing jobs
#[derive(Debug, Clone, Default)]
pub struct JobFilter {
    pub kind: Option<JobKind>,
    pub instance_id: Option<Uuid>,
    pub dead_letter: Option<bool>,
}

impl JobFilter {
    pub fn matches(&self, job: &Job) -> bool {
        self.kind.map_or(true, |k| job.kind == k)
            && self.instance_id.map_or(true, |id| job.instance_id == id)
            && self.dead_letter.map_or(true, |d| job.dead_letter == d)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn job(now: DateTime<Utc>) -> Job {
        Job::new(
            JobKind::AsyncContinuation,
            Uuid::now_v7(),
            Uuid::now_v7(),
            "ship",
            now,
            2,
            now,
        )
    }

    #[test]
    fn test_failure_delays_then_dead_letters() {
        let now = Utc::now();
        let mut job = job(now);
        job.lock_owner = Some("worker".into());
        job.lock_expires_at = Some(now + chrono::Duration::minutes(5));

        job.record_failure("boom", now, Duration::from_secs(10));
        assert_eq!(job.retries, 1);
        assert!(!job.dead_letter);
        assert_eq!(job.due_at, now + chrono::Duration::seconds(10));
        assert!(job.lock_owner.is_none());
        assert!(!job.is_acquirable(now));
        assert!(job.is_acquirable(now + chrono::Duration::seconds(10)));

        job.record_failure("boom again", now, Duration::from_secs(10));
        assert_eq!(job.retries, 0);
        assert!(job.dead_letter);
        assert_eq!(job.exception_message.as_deref(), Some("boom again"));
        assert!(!job.is_acquirable(now + chrono::Duration::days(1)));
    }

    #[test]
    fn test_unlock_keeps_retries_and_due_date() {
        let now = Utc::now();
        let mut job = job(now);
        job.lock_owner = Some("worker".into());
        job.lock_expires_at = Some(now + chrono::Duration::minutes(5));

        job.unlock();
        assert_eq!(job.retries, 2);
        assert_eq!(job.due_at, now);
        assert!(job.exception_message.is_none());
        assert!(job.is_acquirable(now));
    }

    #[test]
    fn test_locked_job_is_not_acquirable_until_expiry() {
        let now = Utc::now();
        let mut job = job(now);
        job.lock_owner = Some("a".into());
        job.lock_expires_at = Some(now + chrono::Duration::seconds(30));
        assert!(!job.is_acquirable(now));
        assert!(job.is_acquirable(now + chrono::Duration::seconds(30)));
    }
}
