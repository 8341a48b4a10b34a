//! # tl-scheduler
//!
//! The scheduling loop that ties an optimizer engine to a wrapper, with its
//! options, improvement-based global stopping, snapshot persistence, backfill
//! reconciliation and the configuration document.

pub mod backfill;
pub mod config;
pub mod options;
pub mod scheduler;
pub mod snapshot;
pub mod stopping;

pub use backfill::*;
pub use config::*;
pub use options::*;
pub use scheduler::*;
pub use snapshot::*;
pub use stopping::*;
