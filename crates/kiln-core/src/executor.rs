//! Executor trait and execution types.
//!
//! Executors run job pipelines as isolated tasks (pods, containers) and
//! report their status and console output back to the service.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use crate::job::PipelineSpec;
use crate::{JobId, Result};

/// Label marking a task as owned by this service.
pub const MANAGED_LABEL: &str = "kiln.dev/managed";
/// Label carrying the owning job id.
pub const JOB_ID_LABEL: &str = "kiln.dev/job-id";
/// Label carrying the (sanitized) job name.
pub const JOB_NAME_LABEL: &str = "kiln.dev/job-name";

/// Everything an executor needs to start a task for a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSpec {
    pub job_id: JobId,
    pub job_name: String,
    pub pipeline: PipelineSpec,
}

/// CPU and memory settings for a named resource profile.
///
/// Values use the Kubernetes quantity syntax (`"500m"`, `"2Gi"`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceProfile {
    pub cpu_request: Option<String>,
    pub memory_request: Option<String>,
    pub cpu_limit: Option<String>,
    pub memory_limit: Option<String>,
}

/// Handle to a task started by an executor.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskHandle {
    /// The job this task runs.
    pub job_id: JobId,
    /// Executor-specific identifier (pod name, container id).
    pub task_id: String,
    /// Name of the executor running this task.
    pub executor: String,
}

/// Scheduler-reported state of a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Active,
    Succeeded,
    Failed {
        exit_code: Option<i64>,
        message: String,
    },
    /// The executor lost track of the task (retry budget exhausted).
    Unknown { reason: String },
    /// The task was stopped on request.
    Cancelled,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Succeeded
                | TaskStatus::Failed { .. }
                | TaskStatus::Unknown { .. }
                | TaskStatus::Cancelled
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// A line of console output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputLine {
    pub timestamp: DateTime<Utc>,
    pub stream: OutputStream,
    pub content: String,
}

impl OutputLine {
    pub fn stdout(content: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            stream: OutputStream::Stdout,
            content: content.into(),
        }
    }
}

/// One item of a task's watch stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionEvent {
    Status(TaskStatus),
    Output(OutputLine),
    /// The output stream broke and could not be resumed within the retry
    /// budget. Output after this point is missing.
    OutputLost { reason: String },
}

/// Binds job lifecycles to a task scheduler.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Submit a task. Rejections by the scheduler surface as
    /// [`crate::Error::Submission`] and are not retried.
    async fn start(&self, spec: TaskSpec) -> Result<TaskHandle>;

    /// Follow a task's status changes and output.
    ///
    /// Output keeps emission order, and every output line precedes the final
    /// status event. The stream ends after a terminal status. A broken
    /// output stream is resumed where it stopped; when that fails the
    /// stream carries [`ExecutionEvent::OutputLost`].
    async fn watch(&self, handle: &TaskHandle) -> Result<BoxStream<'static, ExecutionEvent>>;

    /// Forcefully terminate a task. Stopping a task that no longer exists
    /// succeeds.
    async fn stop(&self, handle: &TaskHandle) -> Result<()>;

    /// List live tasks owned by this service, for startup reconciliation.
    async fn reconcile(&self) -> Result<Vec<TaskHandle>>;
}

/// Make a string usable as a label value: lowercase alphanumerics, `-`, `_`
/// and `.`, at most 63 characters, alphanumeric at both ends.
pub fn sanitize_label_value(input: &str) -> String {
    let mut sanitized: String = input
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    sanitized.truncate(63);
    sanitized
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses() {
        assert!(!TaskStatus::Pending.is_terminal());
        assert!(!TaskStatus::Active.is_terminal());
        assert!(TaskStatus::Succeeded.is_terminal());
        assert!(TaskStatus::Cancelled.is_terminal());
        assert!(
            TaskStatus::Unknown {
                reason: "watch lost".to_string()
            }
            .is_terminal()
        );
    }

    #[test]
    fn test_sanitize_label_value() {
        assert_eq!(sanitize_label_value("Build #123"), "build--123");
        assert_eq!(sanitize_label_value("--release--"), "release");
        assert_eq!(sanitize_label_value(&"a".repeat(100)).len(), 63);
        assert_eq!(sanitize_label_value("###"), "");
    }
}
