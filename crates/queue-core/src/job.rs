//! The `Job` record and its state machine.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Relative importance of a job. Ordered so that `Critical > High > Medium > Low`
/// both by `Ord` and by the `weight()` persisted alongside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank such that higher weight claims earlier.
    pub fn weight(self) -> i32 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
            Priority::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

/// Persisted top-level job state. `Failed` and `Timeout` from the design are
/// transient and only ever appear inside [`ExecutionRecord`] entries, never
/// as a top-level `State`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    Pending,
    Scheduled,
    Processing,
    Completed,
    Dead,
    Cancelled,
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            State::Pending => "pending",
            State::Scheduled => "scheduled",
            State::Processing => "processing",
            State::Completed => "completed",
            State::Dead => "dead",
            State::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// One attempt's outcome, appended to `Job::execution_history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub attempt: u32,
    pub worker_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub exit_code: Option<i32>,
    /// `None` on success.
    pub error: Option<String>,
}

/// Caller-supplied description of work to enqueue. Defaults for omitted
/// fields are filled in by `QueueService::enqueue` from configuration.
#[derive(Debug, Clone)]
pub struct JobSpec {
    pub id: Option<JobId>,
    pub command: String,
    pub priority: Priority,
    pub max_retries: u32,
    pub timeout: Duration,
    pub run_at: Option<DateTime<Utc>>,
}

impl JobSpec {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            id: None,
            command: command.into(),
            priority: Priority::default(),
            max_retries: 3,
            timeout: Duration::minutes(30),
            run_at: None,
        }
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn run_at(mut self, run_at: DateTime<Utc>) -> Self {
        self.run_at = Some(run_at);
        self
    }
}

/// A persistent unit of work. See the crate's module docs for the full
/// state machine this type participates in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub command: String,
    pub priority: Priority,
    pub state: State,
    pub attempts: u32,
    pub max_retries: u32,
    pub timeout: Duration,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub run_at: Option<DateTime<Utc>>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub deadline_at: Option<DateTime<Utc>>,
    pub worker_id: Option<String>,
    pub exit_code: Option<i32>,
    pub error_message: Option<String>,
    pub version: i64,
    pub output_ref: Option<String>,
    pub execution_history: Vec<ExecutionRecord>,
}

impl Job {
    /// Build a fresh job from a spec, as `QueueService::enqueue` does after
    /// filling in defaults. State is `Scheduled` if `run_at` is in the
    /// future, `Pending` otherwise.
    pub fn from_spec(spec: JobSpec, now: DateTime<Utc>) -> Self {
        let run_at = spec.run_at;
        let state = match run_at {
            Some(t) if t > now => State::Scheduled,
            _ => State::Pending,
        };
        Self {
            id: spec.id.unwrap_or_default(),
            command: spec.command,
            priority: spec.priority,
            state,
            attempts: 0,
            max_retries: spec.max_retries,
            timeout: spec.timeout,
            created_at: now,
            updated_at: now,
            run_at,
            claimed_at: None,
            started_at: None,
            deadline_at: None,
            worker_id: None,
            exit_code: None,
            error_message: None,
            version: 1,
            output_ref: None,
            execution_history: Vec::new(),
        }
    }

    /// Whether `attempts < max_retries`, i.e. another attempt is still owed
    /// before the job is permanently dead.
    pub fn should_retry(&self) -> bool {
        self.attempts < self.max_retries
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Completed | State::Dead | State::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_spec_pending_when_run_at_is_past_or_absent() {
        let now = Utc::now();
        let job = Job::from_spec(JobSpec::new("echo hi"), now);
        assert_eq!(job.state, State::Pending);
        assert_eq!(job.version, 1);
        assert_eq!(job.attempts, 0);
    }

    #[test]
    fn from_spec_scheduled_when_run_at_future() {
        let now = Utc::now();
        let spec = JobSpec::new("echo hi").run_at(now + Duration::seconds(30));
        let job = Job::from_spec(spec, now);
        assert_eq!(job.state, State::Scheduled);
    }

    #[test]
    fn should_retry_respects_max_retries() {
        let now = Utc::now();
        let mut job = Job::from_spec(JobSpec::new("x").max_retries(2), now);
        assert!(job.should_retry());
        job.attempts = 2;
        assert!(!job.should_retry());
    }

    #[test]
    fn priority_ordering_matches_weight() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Medium);
        assert!(Priority::Medium > Priority::Low);
        assert!(Priority::Critical.weight() > Priority::Low.weight());
    }
}
