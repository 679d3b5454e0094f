//! Execution environment of grouping stages: upstream sources and the
//! worker runtime that hosts stage replicas.

mod runtime;
mod source;

pub use runtime::{
    LocalStore, LocalStoreMarker, Runtime, RuntimeError, RuntimeHandle,
    WorkerPanicInfo,
};
pub use source::{ChannelSource, RecordSource, VecSource};
