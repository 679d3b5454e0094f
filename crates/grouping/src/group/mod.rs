//! Grouping state shared by the replicas of a grouping stage.

mod adapter;
mod key;
mod map;

pub use adapter::GroupingAdapter;
pub use key::GroupKey;
pub use map::{GroupEntry, GroupingMap};
