//! Job records, phases and submitted job definitions.

use chrono::{DateTime, Utc};
use derive_more::Display;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::{Error, JobId, Result};

/// Coarse lifecycle state of a job.
///
/// Phases are ordered `Created < Scheduled < Running < {Succeeded, Failed, Aborted}`.
/// A job only ever moves forward along that order and stops at the first
/// terminal phase it reaches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[display("created")]
    Created,
    #[display("scheduled")]
    Scheduled,
    #[display("running")]
    Running,
    #[display("succeeded")]
    Succeeded,
    #[display("failed")]
    Failed,
    #[display("aborted")]
    Aborted,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::Created,
        Phase::Scheduled,
        Phase::Running,
        Phase::Succeeded,
        Phase::Failed,
        Phase::Aborted,
    ];

    /// Position in the phase order. All terminal phases share the last rank.
    pub fn rank(self) -> u8 {
        match self {
            Phase::Created => 0,
            Phase::Scheduled => 1,
            Phase::Running => 2,
            Phase::Succeeded | Phase::Failed | Phase::Aborted => 3,
        }
    }

    pub fn is_terminal(self) -> bool {
        self.rank() == 3
    }

    /// Whether `next` is a legal successor of `self`.
    ///
    /// Non-terminal phases advance one step at a time. `Succeeded` is only
    /// reachable from `Running`; `Aborted` and `Failed` may end any
    /// unfinished job.
    pub fn can_transition_to(self, next: Phase) -> bool {
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Phase::Created, Phase::Scheduled) | (Phase::Scheduled, Phase::Running) => true,
            (Phase::Running, Phase::Succeeded) => true,
            (_, Phase::Failed | Phase::Aborted) => true,
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Scheduled => "scheduled",
            Phase::Running => "running",
            Phase::Succeeded => "succeeded",
            Phase::Failed => "failed",
            Phase::Aborted => "aborted",
        }
    }
}

impl std::str::FromStr for Phase {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Phase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| Error::InvalidInput(format!("unknown phase: {}", s)))
    }
}

/// Reference to the event that caused a job to be submitted.
///
/// Owned by the trigger layer; Kiln stores it but never interprets it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerMetadata {
    pub repository: Option<String>,
    pub revision: Option<String>,
    pub actor: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub extra: serde_json::Value,
}

fn default_profile() -> String {
    "default".to_string()
}

/// What to run for a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSpec {
    /// Container image to run.
    pub image: String,
    /// Command to execute. Empty means the image entrypoint.
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Resource profile name, resolved by the executor.
    #[serde(default = "default_profile")]
    pub profile: String,
    /// Maximum run time in seconds; falls back to the service default.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

/// A validated request to run a pipeline, as delivered by the trigger layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub trigger: TriggerMetadata,
    pub pipeline: PipelineSpec,
}

impl JobSpec {
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::InvalidInput("job name must not be empty".to_string()));
        }
        if self.pipeline.image.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "job '{}' does not name an image",
                self.name
            )));
        }
        if self.pipeline.profile.trim().is_empty() {
            return Err(Error::InvalidInput(format!(
                "job '{}' does not name a resource profile",
                self.name
            )));
        }
        if self.pipeline.timeout_secs == Some(0) {
            return Err(Error::InvalidInput("timeout_secs must be positive".to_string()));
        }
        Ok(())
    }
}

/// A named, contiguous slice of a job's log.
///
/// Offsets are positions in the job-wide log, i.e. all segments of the job
/// concatenated in order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogSegment {
    pub name: String,
    pub start_offset: u64,
    /// `None` while the segment is still being written.
    pub end_offset: Option<u64>,
}

impl LogSegment {
    pub fn is_open(&self) -> bool {
        self.end_offset.is_none()
    }
}

/// One entry of a job's append-only transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTransition {
    /// Position in the job's log, starting at 0 for creation.
    pub seq: u32,
    pub from: Option<Phase>,
    pub to: Phase,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// One pipeline run, tracked end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub phase: Phase,
    pub trigger: TriggerMetadata,
    pub pipeline: PipelineSpec,
    /// Why the job ended up `Failed` or `Aborted`.
    pub reason: Option<String>,
    /// Set when output could not be persisted; the stored log is truncated.
    pub log_incomplete: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub segments: Vec<LogSegment>,
}

impl Job {
    pub fn new(spec: JobSpec) -> Self {
        Self {
            id: JobId::new(),
            name: spec.name,
            phase: Phase::Created,
            trigger: spec.trigger,
            pipeline: spec.pipeline,
            reason: None,
            log_incomplete: false,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            segments: Vec::new(),
        }
    }

    /// Move the job to `next`, stamping timestamps.
    ///
    /// Fails with [`Error::Conflict`] when the move would go backwards, stay
    /// in place, or leave a terminal phase.
    pub fn transition(
        &mut self,
        next: Phase,
        reason: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<()> {
        if !self.phase.can_transition_to(next) {
            return Err(Error::Conflict(format!(
                "job {} cannot move from {} to {}",
                self.id, self.phase, next
            )));
        }
        if next == Phase::Running {
            self.started_at = Some(at);
        }
        if next.is_terminal() {
            self.ended_at = Some(at);
            self.reason = reason;
        }
        self.phase = next;
        Ok(())
    }

    /// Insert or replace the segment reference with the same name.
    pub fn upsert_segment(&mut self, segment: LogSegment) {
        match self.segments.iter_mut().find(|s| s.name == segment.name) {
            Some(existing) => *existing = segment,
            None => {
                self.segments.push(segment);
                self.segments.sort_by_key(|s| s.start_offset);
            }
        }
    }
}

/// Criteria for listing jobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobFilter {
    /// Only jobs in one of these phases. Empty means any phase.
    #[serde(default)]
    pub phases: Vec<Phase>,
    /// Case-insensitive substring of the job name.
    #[serde(default)]
    pub name_contains: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn in_phases(phases: impl IntoIterator<Item = Phase>) -> Self {
        Self {
            phases: phases.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        if !self.phases.is_empty() && !self.phases.contains(&job.phase) {
            return false;
        }
        match &self.name_contains {
            Some(needle) => job.name.to_lowercase().contains(&needle.to_lowercase()),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_spec(name: &str) -> JobSpec {
        JobSpec {
            name: name.to_string(),
            trigger: TriggerMetadata::default(),
            pipeline: PipelineSpec {
                image: "alpine:3.20".to_string(),
                command: vec!["echo".to_string(), "hello".to_string()],
                working_dir: None,
                env: HashMap::new(),
                profile: "default".to_string(),
                timeout_secs: None,
            },
        }
    }

    #[test]
    fn test_forward_transitions_are_allowed() {
        assert!(Phase::Created.can_transition_to(Phase::Scheduled));
        assert!(Phase::Scheduled.can_transition_to(Phase::Running));
        assert!(Phase::Running.can_transition_to(Phase::Succeeded));
        assert!(Phase::Created.can_transition_to(Phase::Failed));
        assert!(Phase::Scheduled.can_transition_to(Phase::Aborted));
    }

    #[test]
    fn test_backward_and_repeated_transitions_are_rejected() {
        assert!(!Phase::Running.can_transition_to(Phase::Scheduled));
        assert!(!Phase::Running.can_transition_to(Phase::Running));
        assert!(!Phase::Succeeded.can_transition_to(Phase::Failed));
        assert!(!Phase::Aborted.can_transition_to(Phase::Succeeded));
    }

    #[test]
    fn test_phases_cannot_be_skipped() {
        assert!(!Phase::Created.can_transition_to(Phase::Running));
        assert!(!Phase::Created.can_transition_to(Phase::Succeeded));
        assert!(!Phase::Scheduled.can_transition_to(Phase::Succeeded));
        assert!(Phase::Scheduled.can_transition_to(Phase::Failed));
        assert!(Phase::Running.can_transition_to(Phase::Aborted));
    }

    #[test]
    fn test_phase_parses_its_own_name() {
        for phase in Phase::ALL {
            assert_eq!(phase.as_str().parse::<Phase>().unwrap(), phase);
            assert_eq!(phase.to_string(), phase.as_str());
        }
        assert!("paused".parse::<Phase>().is_err());
    }

    #[test]
    fn test_transition_stamps_timestamps() {
        let mut job = Job::new(make_spec("build-123"));
        let now = Utc::now();
        job.transition(Phase::Scheduled, None, now).unwrap();
        assert!(job.started_at.is_none());
        job.transition(Phase::Running, None, now).unwrap();
        assert_eq!(job.started_at, Some(now));
        job.transition(Phase::Failed, Some("exit code 2".to_string()), now)
            .unwrap();
        assert_eq!(job.ended_at, Some(now));
        assert_eq!(job.reason.as_deref(), Some("exit code 2"));

        let err = job.transition(Phase::Succeeded, None, now).unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
        assert_eq!(job.phase, Phase::Failed);
    }

    #[test]
    fn test_upsert_segment_replaces_by_name() {
        let mut job = Job::new(make_spec("build"));
        job.upsert_segment(LogSegment {
            name: "prepare".to_string(),
            start_offset: 0,
            end_offset: None,
        });
        job.upsert_segment(LogSegment {
            name: "prepare".to_string(),
            start_offset: 0,
            end_offset: Some(12),
        });
        job.upsert_segment(LogSegment {
            name: "build".to_string(),
            start_offset: 12,
            end_offset: None,
        });
        assert_eq!(job.segments.len(), 2);
        assert_eq!(job.segments[0].end_offset, Some(12));
        assert!(job.segments[1].is_open());
    }

    #[test]
    fn test_spec_validation() {
        assert!(make_spec("ok").validate().is_ok());
        assert!(make_spec(" ").validate().is_err());
        let mut spec = make_spec("no-image");
        spec.pipeline.image.clear();
        assert!(spec.validate().is_err());
    }

    #[test]
    fn test_spec_defaults_profile_when_deserialized() {
        let spec: JobSpec = serde_json::from_value(serde_json::json!({
            "name": "build-123",
            "pipeline": { "image": "rust:1.85", "command": ["cargo", "test"] }
        }))
        .unwrap();
        assert_eq!(spec.pipeline.profile, "default");
        assert!(spec.trigger.repository.is_none());
    }

    #[test]
    fn test_filter_matches_phase_and_name() {
        let mut job = Job::new(make_spec("Build-Frontend"));
        let filter = JobFilter {
            phases: vec![Phase::Created],
            name_contains: Some("frontend".to_string()),
            limit: None,
        };
        assert!(filter.matches(&job));
        job.transition(Phase::Scheduled, None, Utc::now()).unwrap();
        assert!(!filter.matches(&job));
        assert!(JobFilter::default().matches(&job));
    }
}
