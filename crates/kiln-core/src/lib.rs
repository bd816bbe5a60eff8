//! Core domain types and traits for the Kiln job pipeline.
//!
//! This crate contains:
//! - Job identifiers, phases and the monotonic phase order
//! - The executor trait and execution events
//! - The log cutter that splits console output into segments
//! - Live update events published to subscribers
//! - Retry policy for transient infrastructure errors

pub mod error;
pub mod event;
pub mod executor;
pub mod id;
pub mod job;
pub mod logcutter;
pub mod retry;

pub use error::{Error, Result};
pub use event::JobUpdate;
pub use id::JobId;
pub use job::{Job, JobFilter, JobSpec, LogSegment, Phase, PhaseTransition, TriggerMetadata};
pub use logcutter::{CutSession, Cutter, SegmentEvent};
pub use retry::RetryPolicy;
