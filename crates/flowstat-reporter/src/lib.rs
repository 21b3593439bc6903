//! Periodic flow statistics reporting.
//!
//! On every tick the [`job::ReportingJob`] picks the most recently settled
//! 10 second window, reads per-resource statistics for it, classifies each
//! resource and dispatches one flat record per (resource, window) pair to the
//! configured sink.

pub mod classifier;
pub mod dispatch;
mod error;
pub mod job;
pub mod net;
pub mod record;
pub mod registry;
pub mod settings;
pub mod stats;
pub mod window;

pub use error::{Error, Result};
