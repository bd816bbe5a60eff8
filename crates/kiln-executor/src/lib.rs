//! Task execution backends for Kiln.
//!
//! - Kubernetes (production): one pod per job
//! - Local Docker (development): one container per job

pub mod docker;
pub mod kubernetes;

pub use docker::LocalDockerExecutor;
pub use kiln_core::executor::{
    ExecutionEvent, Executor, OutputLine, OutputStream, ResourceProfile, TaskHandle, TaskSpec,
    TaskStatus,
};
pub use kubernetes::KubernetesExecutor;

use chrono::{DateTime, Utc};
use kiln_core::{Error, Result};
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Look up the resource profile a job asks for.
pub(crate) fn resolve_profile<'a>(
    profiles: &'a BTreeMap<String, ResourceProfile>,
    name: &str,
) -> Result<&'a ResourceProfile> {
    profiles
        .get(name)
        .ok_or_else(|| Error::Submission(format!("unknown resource profile: {}", name)))
}

/// The default profile set: a single unconstrained `default` profile.
pub fn default_profiles() -> BTreeMap<String, ResourceProfile> {
    BTreeMap::from([("default".to_string(), ResourceProfile::default())])
}

#[derive(Debug, Default)]
struct Stops {
    watched: HashSet<String>,
    stopped: HashSet<String>,
}

/// Tasks stopped on request while being watched, so their watchers report
/// `Cancelled`. Only watched tasks are remembered, and each entry is dropped
/// when its watcher ends.
#[derive(Debug, Clone, Default)]
pub(crate) struct StopRegistry(Arc<Mutex<Stops>>);

impl StopRegistry {
    fn lock(&self) -> MutexGuard<'_, Stops> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A watcher started following the task.
    pub(crate) fn watching(&self, task_id: &str) {
        self.lock().watched.insert(task_id.to_string());
    }

    pub(crate) fn mark(&self, task_id: &str) {
        let mut stops = self.lock();
        if stops.watched.contains(task_id) {
            stops.stopped.insert(task_id.to_string());
        }
    }

    pub(crate) fn contains(&self, task_id: &str) -> bool {
        self.lock().stopped.contains(task_id)
    }

    /// The watcher ended; forget the task.
    pub(crate) fn finish(&self, task_id: &str) {
        let mut stops = self.lock();
        stops.watched.remove(task_id);
        stops.stopped.remove(task_id);
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        let stops = self.lock();
        stops.watched.len() + stops.stopped.len()
    }
}

/// Position in a timestamped log stream, so a reconnected stream can skip
/// lines that were already forwarded.
///
/// Both schedulers prefix each line with an RFC 3339 timestamp when asked,
/// and resume from a whole second, so lines sharing the last delivered
/// timestamp are counted and skipped on the next connection.
#[derive(Debug, Default)]
pub(crate) struct LogCursor {
    last: Option<DateTime<Utc>>,
    at_last: usize,
    skip: usize,
    delivered: u64,
}

impl LogCursor {
    /// Where a new connection should start reading.
    pub(crate) fn since(&self) -> Option<DateTime<Utc>> {
        self.last
    }

    /// Lines let through so far.
    pub(crate) fn delivered(&self) -> u64 {
        self.delivered
    }

    /// Call before reading from a new connection.
    pub(crate) fn reconnect(&mut self) {
        self.skip = self.at_last;
    }

    /// Strip the timestamp from `raw`. Returns `None` if the line was
    /// already delivered on an earlier connection.
    pub(crate) fn admit(&mut self, raw: &str) -> Option<OutputLine> {
        let (stamp, content) = raw.split_once(' ').unwrap_or((raw, ""));
        let Ok(at) = DateTime::parse_from_rfc3339(stamp) else {
            self.delivered += 1;
            return Some(OutputLine::stdout(raw));
        };
        let at = at.with_timezone(&Utc);
        match self.last {
            Some(last) if at < last => return None,
            Some(last) if at == last => {
                if self.skip > 0 {
                    self.skip -= 1;
                    return None;
                }
                self.at_last += 1;
            }
            _ => {
                self.last = Some(at);
                self.at_last = 1;
                self.skip = 0;
            }
        }
        self.delivered += 1;
        Some(OutputLine {
            timestamp: at,
            stream: OutputStream::Stdout,
            content: content.to_string(),
        })
    }
}

/// Split a chunk of raw output into lines, keeping an unterminated tail in
/// `pending` for the next chunk.
pub(crate) fn split_lines(pending: &mut String, chunk: &str) -> Vec<String> {
    pending.push_str(chunk);
    let mut lines = Vec::new();
    while let Some(pos) = pending.find('\n') {
        let line: String = pending.drain(..=pos).collect();
        lines.push(line.trim_end_matches(['\n', '\r']).to_string());
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_profile() {
        let profiles = default_profiles();
        assert!(resolve_profile(&profiles, "default").is_ok());
        assert!(matches!(
            resolve_profile(&profiles, "huge"),
            Err(Error::Submission(_))
        ));
    }

    #[test]
    fn test_split_lines_keeps_partial_tail() {
        let mut pending = String::new();
        assert_eq!(split_lines(&mut pending, "one\ntw"), vec!["one"]);
        assert_eq!(pending, "tw");
        assert_eq!(split_lines(&mut pending, "o\r\nthree\n"), vec!["two", "three"]);
        assert!(pending.is_empty());
    }

    #[test]
    fn test_stop_registry_forgets_finished_watchers() {
        let stops = StopRegistry::default();
        stops.watching("kiln-job-1");
        stops.mark("kiln-job-1");
        assert!(stops.contains("kiln-job-1"));
        stops.finish("kiln-job-1");
        assert!(!stops.contains("kiln-job-1"));

        // Stopping tasks nobody watches (reconcile orphans) leaves nothing behind.
        for n in 0..100 {
            stops.mark(&format!("orphan-{}", n));
        }
        assert_eq!(stops.len(), 0);
    }

    #[test]
    fn test_log_cursor_strips_timestamps() {
        let mut cursor = LogCursor::default();
        let line = cursor
            .admit("2026-03-01T10:00:00.000000001Z cargo build")
            .unwrap();
        assert_eq!(line.content, "cargo build");
        assert_eq!(
            cursor.since().unwrap().to_rfc3339(),
            "2026-03-01T10:00:00.000000001+00:00"
        );
        assert_eq!(cursor.admit("2026-03-01T10:00:01Z ").unwrap().content, "");
        assert_eq!(cursor.admit("no timestamp").unwrap().content, "no timestamp");
        assert_eq!(cursor.delivered(), 3);
    }

    #[test]
    fn test_log_cursor_skips_replayed_lines_after_reconnect() {
        let mut cursor = LogCursor::default();
        let first = [
            "2026-03-01T10:00:00.1Z one",
            "2026-03-01T10:00:00.2Z two",
            "2026-03-01T10:00:00.2Z two again",
        ];
        for raw in first {
            assert!(cursor.admit(raw).is_some());
        }

        cursor.reconnect();
        let replay = [
            "2026-03-01T10:00:00.1Z one",
            "2026-03-01T10:00:00.2Z two",
            "2026-03-01T10:00:00.2Z two again",
            "2026-03-01T10:00:00.2Z two, third time",
            "2026-03-01T10:00:00.3Z three",
        ];
        let fresh: Vec<String> = replay
            .iter()
            .filter_map(|raw| cursor.admit(raw))
            .map(|line| line.content)
            .collect();
        assert_eq!(fresh, vec!["two, third time", "three"]);
        assert_eq!(cursor.delivered(), 5);
    }
}
