//! # tl-optimizer
//!
//! The optimizer engine interface driven by the scheduler, and the built-in
//! step-wise generation strategy (random, grid and a bayesian-flavoured
//! heuristic).

pub mod engine;
pub mod generation;
pub mod search;

pub use engine::*;
pub use generation::*;
pub use search::*;
