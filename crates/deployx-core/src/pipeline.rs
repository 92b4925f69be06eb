//! Pipeline and job records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{JobId, PipelineId, RepositoryId};

/// Status of a pipeline run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PipelineStatus {
    Pending,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl PipelineStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PipelineStatus::Success | PipelineStatus::Failed | PipelineStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStatus::Pending => "PENDING",
            PipelineStatus::Running => "RUNNING",
            PipelineStatus::Success => "SUCCESS",
            PipelineStatus::Failed => "FAILED",
            PipelineStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PipelineStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "PENDING" => Ok(PipelineStatus::Pending),
            "RUNNING" => Ok(PipelineStatus::Running),
            "SUCCESS" => Ok(PipelineStatus::Success),
            "FAILED" => Ok(PipelineStatus::Failed),
            "CANCELLED" => Ok(PipelineStatus::Cancelled),
            _ => Err(format!("Unknown pipeline status: {}", s)),
        }
    }
}

/// Status of a single job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    Queued,
    Running,
    Success,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Success | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Success => "SUCCESS",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "SUCCESS" => Ok(JobStatus::Success),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            _ => Err(format!("Unknown job status: {}", s)),
        }
    }
}

/// One triggered run against a repository.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Pipeline {
    pub id: PipelineId,
    pub repository_id: RepositoryId,
    pub status: PipelineStatus,
    pub branch: String,
    pub commit_id: Option<String>,
    /// Trigger origin, e.g. `manual` or `github:octocat`.
    pub triggered_by: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// One executable step of a pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: JobId,
    pub pipeline_id: PipelineId,
    /// Zero-based index of the step in the manifest.
    pub position: i32,
    pub name: String,
    pub command: String,
    pub status: JobStatus,
    /// Number of times an engine has claimed this job.
    pub attempt: i32,
    pub logs: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// A named step from a pipeline manifest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Step {
    pub name: String,
    pub command: String,
}

impl Step {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }
}

/// Derive a pipeline verdict from the statuses of its jobs.
///
/// Returns `None` while any job is still queued or running. Once every job
/// is terminal the verdict is `Failed` if any job failed, `Success` if all
/// succeeded, and `Cancelled` otherwise. The result depends only on the
/// multiset of statuses, never on the order they were observed in.
pub fn rollup<I>(statuses: I) -> Option<PipelineStatus>
where
    I: IntoIterator<Item = JobStatus>,
{
    let mut any_failed = false;
    let mut all_success = true;

    for status in statuses {
        match status {
            JobStatus::Queued | JobStatus::Running => return None,
            JobStatus::Failed => any_failed = true,
            JobStatus::Cancelled => all_success = false,
            JobStatus::Success => {}
        }
    }

    Some(if any_failed {
        PipelineStatus::Failed
    } else if all_success {
        PipelineStatus::Success
    } else {
        PipelineStatus::Cancelled
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use JobStatus::*;

    #[test]
    fn test_rollup_waits_for_non_terminal_jobs() {
        assert_eq!(rollup([Success, Running, Failed]), None);
        assert_eq!(rollup([Queued]), None);
    }

    #[test]
    fn test_rollup_all_success() {
        assert_eq!(
            rollup([Success, Success, Success]),
            Some(PipelineStatus::Success)
        );
    }

    #[test]
    fn test_rollup_any_failure_wins() {
        assert_eq!(
            rollup([Success, Failed, Cancelled]),
            Some(PipelineStatus::Failed)
        );
        assert_eq!(rollup([Cancelled, Failed]), Some(PipelineStatus::Failed));
    }

    #[test]
    fn test_rollup_cancelled_mix() {
        assert_eq!(
            rollup([Success, Cancelled]),
            Some(PipelineStatus::Cancelled)
        );
        assert_eq!(
            rollup([Cancelled, Cancelled]),
            Some(PipelineStatus::Cancelled)
        );
    }

    #[test]
    fn test_rollup_is_order_independent() {
        let statuses = [Success, Failed, Success, Cancelled];
        let expected = rollup(statuses);

        // every rotation of the same multiset gives the same verdict
        for shift in 0..statuses.len() {
            let mut rotated = statuses;
            rotated.rotate_left(shift);
            assert_eq!(rollup(rotated), expected);
            rotated.reverse();
            assert_eq!(rollup(rotated), expected);
        }
    }

    #[test]
    fn test_status_parse_and_display() {
        for status in [Queued, Running, Success, Failed, Cancelled] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
        }
        assert_eq!(
            "running".parse::<PipelineStatus>().unwrap(),
            PipelineStatus::Running
        );
        assert!("DONE".parse::<PipelineStatus>().is_err());
    }

    #[test]
    fn test_status_serializes_upper_case() {
        let json = serde_json::to_string(&PipelineStatus::Cancelled).unwrap();
        assert_eq!(json, "\"CANCELLED\"");
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!PipelineStatus::Pending.is_terminal());
        assert!(!PipelineStatus::Running.is_terminal());
        assert!(PipelineStatus::Failed.is_terminal());
        assert!(!Queued.is_terminal());
        assert!(Cancelled.is_terminal());
    }
}
