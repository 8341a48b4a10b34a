//! # tl-types
//!
//! Core types for Trellis: trials and their status state machine, search
//! spaces, metric configuration, the experiment ledger and the error
//! taxonomy shared by every crate.

pub mod errors;
pub mod experiment;
pub mod metric;
pub mod search_space;
pub mod trial;

pub use errors::*;
pub use experiment::*;
pub use metric::*;
pub use search_space::*;
pub use trial::*;
