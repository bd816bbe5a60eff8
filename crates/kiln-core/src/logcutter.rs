//! Splits a job's console output into named segments.
//!
//! A [`Cutter`] is immutable configuration: it can be shared by any number of
//! jobs at once. Each classification run gets its own [`CutSession`], so no
//! state leaks between jobs and the same input always produces the same
//! segments.

use futures::stream::{self, Stream, StreamExt};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Marker recognised when nothing else is configured: `=== build ===`.
pub const DEFAULT_MARKER: &str = "^=== ([A-Za-z0-9_.-]+) ===$";

/// Segment that collects output printed before the first marker.
pub const DEFAULT_SEGMENT: &str = "default";

/// Output of the cutter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SegmentEvent {
    /// A new segment starts.
    Open(String),
    /// A line belonging to the open segment.
    Line(String),
    /// The open segment ends.
    Close,
}

/// Boundary-marker based classifier configuration.
#[derive(Debug, Clone)]
pub struct Cutter {
    marker: Regex,
    default_segment: String,
}

impl Cutter {
    /// Build a cutter from a marker pattern. The pattern's first capture group
    /// names the segment a matching line opens.
    pub fn new(marker: &str, default_segment: impl Into<String>) -> Result<Self> {
        let marker = Regex::new(marker)
            .map_err(|e| Error::InvalidInput(format!("invalid marker pattern: {}", e)))?;
        if marker.captures_len() < 2 {
            return Err(Error::InvalidInput(
                "marker pattern needs a capture group for the segment name".to_string(),
            ));
        }
        let default_segment = default_segment.into();
        if default_segment.trim().is_empty() {
            return Err(Error::InvalidInput(
                "default segment name must not be empty".to_string(),
            ));
        }
        Ok(Self {
            marker,
            default_segment,
        })
    }

    pub fn marker(&self) -> &str {
        self.marker.as_str()
    }

    pub fn default_segment(&self) -> &str {
        &self.default_segment
    }

    /// Segment name opened by `line`, if it is a marker line.
    pub fn marker_name<'l>(&self, line: &'l str) -> Option<&'l str> {
        self.marker
            .captures(line.trim())
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str())
            .filter(|name| !name.is_empty())
    }

    /// Start an independent classification run.
    pub fn session(&self) -> CutSession {
        CutSession {
            cutter: self.clone(),
            open: false,
        }
    }

    /// Classify a stream of lines lazily.
    pub fn classify<S>(&self, lines: S) -> impl Stream<Item = SegmentEvent> + Send + 'static
    where
        S: Stream<Item = String> + Send + 'static,
    {
        lines
            .map(Some)
            .chain(stream::once(async { None }))
            .scan(self.session(), |session, line| {
                let events = match line {
                    Some(line) => session.feed(&line),
                    None => session.finish().into_iter().collect(),
                };
                futures::future::ready(Some(stream::iter(events)))
            })
            .flatten()
    }

    /// Classify a finite list of lines in one go.
    pub fn cut_lines<I, L>(&self, lines: I) -> Vec<SegmentEvent>
    where
        I: IntoIterator<Item = L>,
        L: AsRef<str>,
    {
        let mut session = self.session();
        let mut events: Vec<SegmentEvent> = lines
            .into_iter()
            .flat_map(|line| session.feed(line.as_ref()))
            .collect();
        events.extend(session.finish());
        events
    }
}

impl Default for Cutter {
    fn default() -> Self {
        Self {
            marker: Regex::new(DEFAULT_MARKER).expect("default marker is a valid pattern"),
            default_segment: DEFAULT_SEGMENT.to_string(),
        }
    }
}

/// State of one classification run.
#[derive(Debug, Clone)]
pub struct CutSession {
    cutter: Cutter,
    open: bool,
}

impl CutSession {
    /// Classify the next line.
    pub fn feed(&mut self, line: &str) -> Vec<SegmentEvent> {
        let mut events = Vec::with_capacity(2);
        if let Some(name) = self.cutter.marker_name(line) {
            if self.open {
                events.push(SegmentEvent::Close);
            }
            events.push(SegmentEvent::Open(name.to_string()));
            self.open = true;
            return events;
        }

        if !self.open {
            events.push(SegmentEvent::Open(self.cutter.default_segment.clone()));
            self.open = true;
        }
        events.push(SegmentEvent::Line(line.to_string()));
        events
    }

    /// End the run, closing the open segment if there is one.
    pub fn finish(&mut self) -> Option<SegmentEvent> {
        if std::mem::take(&mut self.open) {
            Some(SegmentEvent::Close)
        } else {
            None
        }
    }

    pub fn is_open(&self) -> bool {
        self.open
    }
}
