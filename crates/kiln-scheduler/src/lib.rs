//! Job orchestration for Kiln.
//!
//! The [`Service`] accepts job submissions, drives each job's task through an
//! [`kiln_core::executor::Executor`], pumps its output through the log cutter
//! into the log store, records every phase change in the job store and fans
//! live updates out to subscribers.

mod hub;
mod pump;
pub mod reconcile;
pub mod service;
mod subscription;

#[cfg(test)]
mod testing;

pub use reconcile::ReconcileReport;
pub use service::{Service, ServiceConfig};
