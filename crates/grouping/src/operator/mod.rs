//! Pipeline stages.

mod barrier;
mod grouping;

pub use barrier::{Arrival, ArrivalBarrier};
pub use grouping::{GroupingOperator, Scope, StageState};
