//! Core workflow logic for mise: vote tallies, recipe analysis, derived-row
//! materialization, and the message runtime that drives them.

pub mod analysis;
pub mod bus;
pub mod error;
pub mod events;
pub mod grocery;
pub mod lifecycle;
pub mod materialize;
pub mod runtime;

pub use error::{Disposition, PlanFailure, WorkerError};
