//! Replicated grouping stage.

use crate::{
    config::GroupingConfig,
    error::{ConfigError, StageError},
    group::GroupingAdapter,
    operator::ArrivalBarrier,
    pipeline::{LocalStoreMarker, RecordSource, Runtime},
    Record,
};
use std::{sync::Arc, time::Duration};
use tracing::debug;
use typedmap::TypedMapKey;

/// `TypedMapKey` entry used to share grouping state across the replicas of
/// the same stage in multiple workers.
#[derive(Hash, PartialEq, Eq)]
struct GroupingStateId {
    id: usize,
}

impl GroupingStateId {
    fn new(id: usize) -> Self {
        Self { id }
    }
}

impl TypedMapKey<LocalStoreMarker> for GroupingStateId {
    type Value = SharedGroupState;
}

/// State shared by all replicas cooperating on one map.
#[derive(Clone, Debug)]
struct SharedGroupState {
    adapter: GroupingAdapter,
    barrier: Arc<ArrivalBarrier>,
}

/// How long a replica waiting for its siblings sleeps between two checks of
/// the kill signal.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(10);

impl SharedGroupState {
    fn new(adapter: GroupingAdapter, parties: usize) -> Self {
        Self {
            adapter,
            barrier: Arc::new(ArrivalBarrier::new(parties)),
        }
    }

    // Removes a replica that will not arrive again, given the phase it
    // arrived in during the current pass.  Seals the map if the remaining
    // replicas were only waiting for this one.
    fn depart(&self, arrival: Option<u64>) {
        let completed = match arrival {
            Some(phase) => self.barrier.deregister(phase),
            None => self.barrier.arrive_and_deregister(),
        };
        if completed && self.adapter.finish() {
            debug!("grouping map sealed by a departing replica");
        }
    }
}

/// How a replica relates to its siblings.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Scope {
    /// Replicas at the same position of the outermost pipeline share one
    /// map, so grouping is global across workers.
    Outer,
    /// A replica inside a nested sub-pipeline owns its map.
    Nested,
}

/// Lifecycle of a single replica.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StageState {
    /// Pulling records from upstream and counting them.
    Accumulating,
    /// Upstream is exhausted; the replica has not yet arrived at the
    /// barrier.
    Exhausted,
    /// Handing out groups from the sealed map.
    Draining,
    /// All groups have been handed out.
    Done,
}

/// A pipeline stage that groups the records of its upstream by a set of key
/// fields.
///
/// The stage consumes its whole upstream on the first call to
/// [`next`](Self::next), then produces one record per distinct key.
/// Replicas of the stage running in different worker threads count into one
/// shared map; the last replica to exhaust its upstream seals the map, after
/// which all replicas drain it together, each group being handed to exactly
/// one of them.
///
/// # Example
///
/// ```
/// use grouping::{record, GroupingConfig, GroupingOperator, VecSource};
///
/// let source = VecSource::new(vec![
///     record! { "text" => "one" },
///     record! { "text" => "two" },
///     record! { "text" => "two" },
/// ]);
/// let mut stage =
///     GroupingOperator::new(GroupingConfig::new(["text"]).with_count(true), source).unwrap();
///
/// let mut groups = Vec::new();
/// while let Some(group) = stage.next().unwrap() {
///     groups.push(group);
/// }
/// groups.sort_by_key(|group| group.get("count").and_then(|count| count.as_int()));
///
/// assert_eq!(
///     groups,
///     vec![
///         record! { "text" => "one", "count" => 1 },
///         record! { "text" => "two", "count" => 2 },
///     ]
/// );
/// ```
#[derive(Debug)]
pub struct GroupingOperator<S> {
    upstream: S,
    shared: SharedGroupState,
    scope: Scope,
    state: StageState,
    // Phase in which this replica arrived at the barrier during the current
    // pass, if it did.
    arrival: Option<u64>,
    local_size: usize,
    records_consumed: u64,
}

impl<S> GroupingOperator<S>
where
    S: RecordSource,
{
    /// Creates a grouping stage reading from `upstream`.
    ///
    /// Inside a [`Runtime`], the replicas that every worker creates at the
    /// same position of its pipeline share one map; the barrier expects one
    /// replica per worker.  A replica that fails to build leaves the
    /// barrier, so its siblings still complete.  All replicas must be built
    /// with the same configuration, otherwise the ones that disagree with
    /// the shared state fail with [`ConfigError::MismatchedReplica`].
    ///
    /// Outside a runtime the stage owns its map.
    pub fn new(config: GroupingConfig, upstream: S) -> Result<Self, ConfigError> {
        let Some(runtime) = Runtime::runtime() else {
            config.validate(upstream.schema())?;
            let shared = SharedGroupState::new(GroupingAdapter::new(config), 1);
            return Ok(Self::with_shared(upstream, shared, Scope::Outer));
        };

        // Every worker draws the id, even if its own replica turns out to be
        // invalid, so that later stages keep matching ids across workers.
        let stage_id = runtime.sequence_next();
        let shared = runtime
            .local_store()
            .entry(GroupingStateId::new(stage_id))
            .or_insert_with(|| {
                SharedGroupState::new(
                    GroupingAdapter::new(config.clone()),
                    Runtime::num_workers(),
                )
            })
            .value()
            .clone();

        let checked = config.validate(upstream.schema()).and_then(|()| {
            if shared.adapter.config() == &config {
                Ok(())
            } else {
                Err(ConfigError::MismatchedReplica)
            }
        });
        if let Err(error) = checked {
            shared.depart(None);
            return Err(error);
        }

        Ok(Self::with_shared(upstream, shared, Scope::Outer))
    }

    fn with_shared(upstream: S, shared: SharedGroupState, scope: Scope) -> Self {
        Self {
            upstream,
            shared,
            scope,
            state: StageState::Accumulating,
            arrival: None,
            local_size: 0,
            records_consumed: 0,
        }
    }

    /// Creates a sibling replica reading from `upstream` that shares this
    /// stage's map and barrier.
    ///
    /// # Panics
    ///
    /// Panics if a replica already arrived at the barrier in the current
    /// pass.
    pub fn replicate<U>(&self, upstream: U) -> GroupingOperator<U>
    where
        U: RecordSource,
    {
        self.shared.barrier.register();
        GroupingOperator::with_shared(upstream, self.shared.clone(), self.scope)
    }

    /// Creates a replica for a nested sub-pipeline, with the same
    /// configuration over its own, empty map.
    pub fn sub_replicate<U>(&self, upstream: U) -> GroupingOperator<U>
    where
        U: RecordSource,
    {
        let shared = SharedGroupState::new(self.shared.adapter.isolated(), 1);
        GroupingOperator::with_shared(upstream, shared, Scope::Nested)
    }

    /// Returns the next group, or `None` once every group has been handed
    /// out.
    ///
    /// The first call consumes the whole upstream.  Replicas that share a
    /// map block until the last of them has exhausted its upstream, or until
    /// the runtime is killed.
    pub fn next(&mut self) -> Result<Option<Record>, StageError<S::Error>> {
        loop {
            match self.state {
                StageState::Accumulating => self.accumulate()?,
                StageState::Exhausted => self.arrive(),
                StageState::Draining => {
                    if Runtime::kill_in_progress() {
                        return Err(StageError::Killed);
                    }
                    if !self.shared.adapter.wait_finished(KILL_POLL_INTERVAL) {
                        continue;
                    }
                    match self.shared.adapter.next() {
                        Some(group) => return Ok(Some(group)),
                        None => self.state = StageState::Done,
                    }
                }
                StageState::Done => return Ok(None),
            }
        }
    }

    fn accumulate(&mut self) -> Result<(), StageError<S::Error>> {
        let mut consumed = 0;
        let result = loop {
            if Runtime::kill_in_progress() {
                break Err(StageError::Killed);
            }
            match self.upstream.next() {
                Ok(Some(record)) => {
                    self.shared.adapter.count(&record);
                    consumed += 1;
                }
                Ok(None) => break Ok(()),
                Err(error) => break Err(StageError::Upstream(error)),
            }
        };

        self.records_consumed += consumed;
        result?;

        self.local_size = self.shared.adapter.size();
        self.state = StageState::Exhausted;
        Ok(())
    }

    fn arrive(&mut self) {
        let arrival = self.shared.barrier.arrive();
        self.arrival = Some(arrival.phase);

        if arrival.is_last() && self.shared.adapter.finish() {
            debug!(
                "worker {} sealed grouping map with {} groups",
                Runtime::worker_index(),
                self.shared.adapter.size()
            );
        }
        self.state = StageState::Draining;
    }

    /// Rewinds the stage for another pass over its upstream.
    ///
    /// Returns `false`, leaving the stage untouched, if the upstream cannot
    /// be rewound.  Every replica sharing the map must be reset before any
    /// of them starts the next pass.
    pub fn reset(&mut self) -> bool {
        if !self.upstream.reset() {
            return false;
        }

        self.shared.adapter.reset();
        self.shared.barrier.reset();
        self.state = StageState::Accumulating;
        self.arrival = None;
        self.local_size = 0;
        self.records_consumed = 0;
        true
    }
}

impl<S> GroupingOperator<S> {
    pub fn scope(&self) -> Scope {
        self.scope
    }

    pub fn state(&self) -> StageState {
        self.state
    }

    pub fn adapter(&self) -> &GroupingAdapter {
        &self.shared.adapter
    }

    /// Approximate number of distinct groups in the map.
    pub fn size(&self) -> usize {
        self.shared.adapter.size()
    }

    /// Number of distinct groups in the map when this replica exhausted its
    /// upstream.
    pub fn local_size(&self) -> usize {
        self.local_size
    }

    /// Number of records this replica pulled from its upstream in the
    /// current pass.
    pub fn records_consumed(&self) -> u64 {
        self.records_consumed
    }

    /// Returns `true` if `self` and `other` count into the same map.
    pub fn shares_map_with<U>(&self, other: &GroupingOperator<U>) -> bool {
        self.shared.adapter.shares_map_with(&other.shared.adapter)
    }
}

impl<S> Drop for GroupingOperator<S> {
    // A replica that goes away must not leave its siblings waiting for it.
    fn drop(&mut self) {
        self.shared.depart(self.arrival);
    }
}
