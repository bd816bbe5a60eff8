//! Live updates published to job subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Phase;

/// An update about one job, as seen by a live viewer or a replay reader.
///
/// Log-related updates carry `offset`, the byte position in the job-wide log
/// (all segments concatenated) where the item starts. Each line occupies its
/// text plus one newline byte.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobUpdate {
    Phase {
        phase: Phase,
        reason: Option<String>,
        at: DateTime<Utc>,
    },
    SegmentOpened {
        name: String,
        offset: u64,
    },
    Line {
        segment: String,
        offset: u64,
        text: String,
    },
    SegmentClosed {
        name: String,
        offset: u64,
    },
}

impl JobUpdate {
    /// Whether this update ends a subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobUpdate::Phase { phase, .. } if phase.is_terminal())
    }

    /// Log offset right after this update.
    pub fn end_offset(&self) -> Option<u64> {
        match self {
            JobUpdate::Phase { .. } => None,
            JobUpdate::SegmentOpened { offset, .. } | JobUpdate::SegmentClosed { offset, .. } => {
                Some(*offset)
            }
            JobUpdate::Line { offset, text, .. } => Some(offset + text.len() as u64 + 1),
        }
    }
}
