//! # tl-runner
//!
//! Everything between the scheduler and the external model: the wrapper
//! contract and its instrumentation, the job runner, metric evaluation with
//! its fetch cache and scoring registry, and the script wrapper with its
//! trial directory layout and process registry.

pub mod artifacts;
pub mod cache;
pub mod metric;
pub mod process;
pub mod runner;
pub mod scoring;
pub mod script;
pub mod wrapper;

pub use artifacts::*;
pub use cache::*;
pub use metric::*;
pub use process::*;
pub use runner::*;
pub use scoring::*;
pub use script::*;
pub use wrapper::*;
