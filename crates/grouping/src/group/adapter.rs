use crate::{
    config::{GroupingConfig, COUNT_FIELD},
    group::{GroupKey, GroupingMap},
    Record, Value,
};
use std::{sync::Arc, time::Duration};

/// Turns records into group keys and groups back into output records.
///
/// The adapter projects each input record onto the configured key fields and
/// counts the resulting key in a [`GroupingMap`].  When draining, it renders
/// each key as an output record:
///
/// * with `retain_others`, the output is a copy of the first input record
///   seen for the key, otherwise just the key fields;
/// * with `with_count`, a [`COUNT_FIELD`] field carrying the number of
///   occurrences of the key is appended.
///
/// Cloning an adapter, or calling [`Self::replicate`], yields a handle to
/// the same map.  [`Self::isolated`] yields an adapter with the same
/// configuration over a fresh map.
#[derive(Clone, Debug)]
pub struct GroupingAdapter {
    config: Arc<GroupingConfig>,
    map: Arc<GroupingMap>,
}

impl GroupingAdapter {
    pub fn new(config: GroupingConfig) -> Self {
        let map = Arc::new(GroupingMap::from_config(&config));
        Self {
            config: Arc::new(config),
            map,
        }
    }

    pub fn config(&self) -> &GroupingConfig {
        &self.config
    }

    pub fn map(&self) -> &Arc<GroupingMap> {
        &self.map
    }

    /// Returns `true` if `self` and `other` count into the same map.
    pub fn shares_map_with(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.map, &other.map)
    }

    /// Projects `record` onto the key fields.
    pub fn key_of(&self, record: &Record) -> GroupKey {
        GroupKey::project(record, &self.config.key_fields)
    }

    /// Counts one occurrence of the group `record` belongs to.  Returns
    /// `true` if this created the group.
    pub fn count(&self, record: &Record) -> bool {
        let key = self.key_of(record);
        if self.config.retain_others {
            self.map.increment_with(key, || record.clone())
        } else {
            self.map.increment(key)
        }
    }

    /// Current count of the group `record` belongs to.
    pub fn get_count(&self, record: &Record) -> Option<u64> {
        self.map.get_count(&self.key_of(record))
    }

    /// Produces the next output record, or `None` when all groups have been
    /// handed out.  Blocks until [`Self::finish`] has been called on this
    /// adapter or one sharing its map.
    pub fn next(&self) -> Option<Record> {
        let key = self.map.take_next()?;

        let mut output = if self.config.retain_others {
            match self.map.retained(&key) {
                Some(retained) => (*retained).clone(),
                None => key.to_record(),
            }
        } else {
            key.to_record()
        };

        if self.config.with_count {
            let Some(count) = self.map.get_count(&key) else {
                panic!("group {key} was removed from a sealed grouping map; was the map cleared while draining?");
            };
            output.add_field(COUNT_FIELD, Value::Int(count as i64));
        }

        Some(output)
    }

    pub fn size(&self) -> usize {
        self.map.size()
    }

    /// Seals the underlying map.  Returns `true` if this call performed the
    /// transition.
    pub fn finish(&self) -> bool {
        self.map.seal()
    }

    /// Waits up to `timeout` for [`Self::finish`] to be called on this
    /// adapter or one sharing its map.  Returns `true` once it has been.
    pub fn wait_finished(&self, timeout: Duration) -> bool {
        self.map.wait_sealed(timeout)
    }

    /// Clears the underlying map.  Same preconditions as
    /// [`GroupingMap::clear`].
    pub fn reset(&self) {
        self.map.clear()
    }

    /// Returns an adapter sharing this adapter's map.
    pub fn replicate(&self) -> Self {
        self.clone()
    }

    /// Returns an adapter with the same configuration and a new, empty map.
    pub fn isolated(&self) -> Self {
        Self {
            config: self.config.clone(),
            map: Arc::new(GroupingMap::from_config(&self.config)),
        }
    }
}
