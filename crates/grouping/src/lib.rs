//! Replicated grouping for record pipelines.
//!
//! A grouping stage consumes its whole upstream, groups records by a
//! configurable set of key fields and produces one record per distinct key,
//! optionally annotated with the number of records in the group
//! ([`GroupingConfig::with_count`]) and optionally carrying every field of
//! the first record seen for the key ([`GroupingConfig::retain_others`]).
//!
//! The stage is built to run replicated across the worker threads of a
//! [`Runtime`]: the replicas at one pipeline position count into a single
//! concurrent [`GroupingMap`], the last replica to exhaust its upstream seals
//! the map, and all replicas then drain it together with every group handed
//! to exactly one of them.
//!
//! ```
//! use grouping::{record, GroupingConfig, GroupingOperator, Runtime, VecSource};
//! use std::sync::{Arc, Mutex};
//!
//! let groups = Arc::new(Mutex::new(Vec::new()));
//! let groups_clone = groups.clone();
//!
//! Runtime::run(4, move || {
//!     // Each worker contributes the same two keys.
//!     let source = VecSource::new(vec![record! { "k" => 1 }, record! { "k" => 2 }]);
//!     let mut stage = GroupingOperator::new(GroupingConfig::new(["k"]).with_count(true), source)
//!         .unwrap();
//!     while let Some(group) = stage.next().unwrap() {
//!         groups_clone.lock().unwrap().push(group);
//!     }
//! })
//! .join()
//! .unwrap();
//!
//! let mut groups = groups.lock().unwrap().clone();
//! groups.sort_by_key(|group| group.get("k").and_then(|k| k.as_int()));
//! assert_eq!(
//!     groups,
//!     vec![record! { "k" => 1, "count" => 4 }, record! { "k" => 2, "count" => 4 }]
//! );
//! ```

pub mod config;
pub mod error;
pub mod group;
pub mod hash;
pub mod metrics;
pub mod operator;
pub mod pipeline;
pub mod record;

pub use config::GroupingConfig;
pub use error::{ConfigError, DetailedError, StageError};
pub use group::{GroupEntry, GroupKey, GroupingAdapter, GroupingMap};
pub use operator::{ArrivalBarrier, GroupingOperator, Scope, StageState};
pub use pipeline::{ChannelSource, RecordSource, Runtime, RuntimeError, RuntimeHandle, VecSource};
pub use record::{Record, Value};
