//! Bounded concurrent grouping map.
//!
//! [`GroupingMap`] is a thread-safe multiset keyed by [`GroupKey`].  Its
//! lifecycle has two phases:
//!
//! * **Accumulating**: any number of threads call [`GroupingMap::increment`]
//!   concurrently.  Every [`checkpoint
//!   interval`](GroupingMap::with_checkpoint_interval) increments, if the map
//!   holds more than `max_types` keys, keys with low counts are pruned.
//!
//! * **Sealed**: the first call to [`GroupingMap::seal`] snapshots all keys
//!   into a hand-off sequence.  Threads call [`GroupingMap::take_next`] to
//!   pull keys from the sequence; each key is handed out exactly once across
//!   all callers.  Increments that arrive after the seal are ignored.
//!
//! [`GroupingMap::clear`] returns the map to the accumulating phase.
//!
//! ```text
//!              increment/prune           take_next
//!             ┌──────────────┐          ┌─────────┐
//!             │              ▼          │         ▼
//!  ──────►  Accumulating ────seal────► Sealed ──────► exhausted
//!             ▲                           │
//!             └──────────clear────────────┘
//! ```

use crate::{
    config::{GroupingConfig, DEFAULT_CHECKPOINT_INTERVAL, DEFAULT_PRUNE_THRESHOLD},
    group::GroupKey,
    metrics::MapMetrics,
    Record,
};
use arc_swap::ArcSwapOption;
use crossbeam::utils::CachePadded;
use hashbrown::{hash_map::Entry, HashMap};
use std::{
    fmt::{self, Debug, Formatter},
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Condvar, Mutex, RwLock, TryLockError,
    },
    time::Duration,
};
use tracing::{debug, warn};

/// Number of occurrences of a group, plus the first record that produced it
/// when the map retains payloads.
pub struct GroupEntry {
    count: AtomicU64,
    retained: Option<Arc<Record>>,
}

impl GroupEntry {
    fn new(retained: Option<Arc<Record>>) -> Self {
        Self {
            count: AtomicU64::new(1),
            retained,
        }
    }

    fn increment(&self) {
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    pub fn retained(&self) -> Option<&Arc<Record>> {
        self.retained.as_ref()
    }
}

type Shard = CachePadded<RwLock<HashMap<GroupKey, GroupEntry>>>;

/// Keys captured by [`GroupingMap::seal`], handed out one at a time.
struct Drain {
    keys: Vec<GroupKey>,
    next: AtomicUsize,
}

impl Drain {
    fn new(keys: Vec<GroupKey>) -> Self {
        Self {
            keys,
            next: AtomicUsize::new(0),
        }
    }

    fn take(&self) -> Option<GroupKey> {
        if self.next.load(Ordering::Relaxed) >= self.keys.len() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed);
        self.keys.get(index).cloned()
    }

    fn remaining(&self) -> usize {
        self.keys
            .len()
            .saturating_sub(self.next.load(Ordering::Relaxed))
    }
}

/// A thread-safe multiset of group keys with bounded cardinality and
/// one-shot drain semantics.  See [module documentation](self).
pub struct GroupingMap {
    shards: Box<[Shard]>,

    // Approximate number of distinct keys.
    distinct: AtomicUsize,

    // Increments accepted since construction or the last `clear`.
    processed: CachePadded<AtomicU64>,

    max_types: Option<usize>,
    prune_threshold: u64,
    checkpoint_interval: u64,

    // Raised by `seal` before it snapshots the shards.  Writers check it
    // while holding their shard lock.
    sealed: AtomicBool,

    // Published under `seal_lock`.
    drain: ArcSwapOption<Drain>,
    seal_lock: Mutex<()>,
    drain_ready: Condvar,

    // Effective seals since construction.
    seals: AtomicUsize,

    metrics: MapMetrics,
}

impl Debug for GroupingMap {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GroupingMap")
            .field("shards", &self.shards.len())
            .field("size", &self.size())
            .field("processed", &self.processed())
            .field("max_types", &self.max_types)
            .field("prune_threshold", &self.prune_threshold)
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Default for GroupingMap {
    fn default() -> Self {
        Self::new(crate::config::DEFAULT_SHARDS)
    }
}

impl GroupingMap {
    /// Creates an empty, unbounded map with `shards` lock shards.
    pub fn new(shards: usize) -> Self {
        assert_ne!(shards, 0, "a grouping map needs at least one shard");

        Self {
            shards: (0..shards)
                .map(|_| CachePadded::new(RwLock::new(HashMap::new())))
                .collect(),
            distinct: AtomicUsize::new(0),
            processed: CachePadded::new(AtomicU64::new(0)),
            max_types: None,
            prune_threshold: DEFAULT_PRUNE_THRESHOLD,
            checkpoint_interval: DEFAULT_CHECKPOINT_INTERVAL,
            sealed: AtomicBool::new(false),
            drain: ArcSwapOption::empty(),
            seal_lock: Mutex::new(()),
            drain_ready: Condvar::new(),
            seals: AtomicUsize::new(0),
            metrics: MapMetrics::new(),
        }
    }

    pub fn from_config(config: &GroupingConfig) -> Self {
        Self::new(config.shards)
            .with_max_types(config.max_types_limit(), config.prune_threshold)
            .with_checkpoint_interval(config.checkpoint_interval)
    }

    /// Bounds the number of distinct keys to `max_types`: when the cap is
    /// exceeded at a checkpoint, keys seen fewer than `prune_threshold`
    /// times are removed.
    pub fn with_max_types(mut self, max_types: Option<usize>, prune_threshold: u64) -> Self {
        self.max_types = max_types;
        self.prune_threshold = prune_threshold;
        self
    }

    pub fn with_checkpoint_interval(mut self, checkpoint_interval: u64) -> Self {
        assert_ne!(checkpoint_interval, 0);
        self.checkpoint_interval = checkpoint_interval;
        self
    }

    pub fn max_types(&self) -> Option<usize> {
        self.max_types
    }

    pub fn prune_threshold(&self) -> u64 {
        self.prune_threshold
    }

    pub fn checkpoint_interval(&self) -> u64 {
        self.checkpoint_interval
    }

    fn shard(&self, key: &GroupKey) -> &Shard {
        &self.shards[(key.fingerprint() % self.shards.len() as u64) as usize]
    }

    /// Counts one occurrence of `key`.
    ///
    /// Returns `true` if the key was not present and has been inserted with
    /// count 1.  Returns `false` if an existing count was incremented or if
    /// the map is sealed, in which case the increment is ignored.
    pub fn increment(&self, key: GroupKey) -> bool {
        self.upsert(key, || None)
    }

    /// Like [`Self::increment`], but when `key` gets inserted, also stores
    /// the record returned by `payload` with it.  The payload is attached
    /// atomically with the insertion, so the retained record is always the
    /// one that created the group.
    pub fn increment_with<F>(&self, key: GroupKey, payload: F) -> bool
    where
        F: FnOnce() -> Record,
    {
        self.upsert(key, || Some(Arc::new(payload())))
    }

    fn upsert<F>(&self, key: GroupKey, payload: F) -> bool
    where
        F: FnOnce() -> Option<Arc<Record>>,
    {
        let shard = self.shard(&key);

        // Existing keys only need a shared lock: counts are atomic.
        let found = {
            let groups = shard.read().unwrap();
            if self.sealed.load(Ordering::Acquire) {
                return self.reject_late();
            }
            groups.get(&key).map(GroupEntry::increment).is_some()
        };

        let inserted = if found {
            false
        } else {
            let mut groups = shard.write().unwrap();
            if self.sealed.load(Ordering::Acquire) {
                return self.reject_late();
            }
            match groups.entry(key) {
                Entry::Occupied(entry) => {
                    entry.get().increment();
                    false
                }
                Entry::Vacant(entry) => {
                    entry.insert(GroupEntry::new(payload()));
                    self.distinct.fetch_add(1, Ordering::Relaxed);
                    true
                }
            }
        };

        self.checkpoint();
        inserted
    }

    fn reject_late(&self) -> bool {
        self.metrics.late_records.increment(1);
        false
    }

    fn checkpoint(&self) {
        self.metrics.records_processed.increment(1);
        let processed = self.processed.fetch_add(1, Ordering::Relaxed) + 1;
        if processed % self.checkpoint_interval != 0 {
            return;
        }

        if let Some(max_types) = self.max_types {
            if self.size() > max_types {
                self.prune(self.prune_threshold);
                let size = self.size();
                if size > max_types {
                    warn!(
                        "grouping map still holds {size} distinct keys after pruning keys seen fewer than {} times (limit: {max_types})",
                        self.prune_threshold
                    );
                }
            }
        }
    }

    /// Removes every key whose count is below `min_count` and returns the
    /// number of removed keys.
    ///
    /// Runs concurrently with increments, one shard at a time, so a key
    /// incremented while its shard is being pruned may or may not survive.
    /// Does nothing once the map is sealed.
    pub fn prune(&self, min_count: u64) -> usize {
        let mut removed = 0;

        for shard in self.shards.iter() {
            let mut groups = shard.write().unwrap();
            if self.sealed.load(Ordering::Acquire) {
                break;
            }
            let before = groups.len();
            groups.retain(|_, entry| entry.count() >= min_count);
            let removed_here = before - groups.len();
            self.distinct.fetch_sub(removed_here, Ordering::Relaxed);
            removed += removed_here;
        }

        self.metrics.prune_passes.increment(1);
        self.metrics.pruned_keys.increment(removed as u64);
        self.metrics.distinct_keys.set(self.size() as f64);
        debug!(
            "pruned {removed} keys seen fewer than {min_count} times, {} keys left",
            self.size()
        );
        removed
    }

    /// Returns the current count of `key`, or `None` if the map does not
    /// hold it.
    pub fn get_count(&self, key: &GroupKey) -> Option<u64> {
        self.shard(key).read().unwrap().get(key).map(GroupEntry::count)
    }

    /// Returns the record retained with `key`, if any.
    pub fn retained(&self, key: &GroupKey) -> Option<Arc<Record>> {
        self.shard(key)
            .read()
            .unwrap()
            .get(key)
            .and_then(|entry| entry.retained().cloned())
    }

    /// Approximate number of distinct keys.
    pub fn size(&self) -> usize {
        self.distinct.load(Ordering::Relaxed)
    }

    /// Number of increments accepted since construction or the last
    /// [`Self::clear`].
    pub fn processed(&self) -> u64 {
        self.processed.load(Ordering::Relaxed)
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    /// Number of effective [`Self::seal`] calls since the map was created.
    pub fn seal_count(&self) -> usize {
        self.seals.load(Ordering::Acquire)
    }

    /// Number of keys not yet handed out by [`Self::take_next`], or `None`
    /// if the map is not sealed.
    pub fn remaining(&self) -> Option<usize> {
        self.drain.load_full().map(|drain| drain.remaining())
    }

    /// Switches the map from accumulating to draining.
    ///
    /// Only the first call since construction or the last [`Self::clear`]
    /// has an effect and returns `true`: it snapshots every key currently in
    /// the map into the hand-off sequence read by [`Self::take_next`] and
    /// wakes up threads blocked there.  Later calls return `false`.
    pub fn seal(&self) -> bool {
        let _guard = self.seal_lock.lock().unwrap();
        if self.drain.load().is_some() {
            return false;
        }

        self.sealed.store(true, Ordering::SeqCst);

        // Exclusive locks wait out increments that passed the `sealed` check
        // before it was raised.
        let mut keys = Vec::with_capacity(self.size());
        for shard in self.shards.iter() {
            let groups = shard.write().unwrap();
            keys.extend(groups.keys().cloned());
        }

        debug!("sealed grouping map with {} distinct keys", keys.len());
        self.metrics.seals.increment(1);
        self.metrics.distinct_keys.set(keys.len() as f64);
        self.seals.fetch_add(1, Ordering::AcqRel);

        self.drain.store(Some(Arc::new(Drain::new(keys))));
        self.drain_ready.notify_all();
        true
    }

    /// Returns the next key from the hand-off sequence, or `None` once it is
    /// exhausted.
    ///
    /// Blocks until [`Self::seal`] has been called.  Safe to call from many
    /// threads: every key is returned to exactly one caller.
    pub fn take_next(&self) -> Option<GroupKey> {
        if let Some(drain) = self.drain.load_full() {
            return drain.take();
        }

        let drain = {
            let mut guard = self.seal_lock.lock().unwrap();
            loop {
                if let Some(drain) = self.drain.load_full() {
                    break drain;
                }
                guard = self.drain_ready.wait(guard).unwrap();
            }
        };
        drain.take()
    }

    /// Waits up to `timeout` for [`Self::seal`] to be called.  Returns
    /// `true` if the map is sealed, in which case [`Self::take_next`] does
    /// not block.
    pub fn wait_sealed(&self, timeout: Duration) -> bool {
        if self.drain.load().is_some() {
            return true;
        }

        let guard = self.seal_lock.lock().unwrap();
        let (_guard, _) = self
            .drain_ready
            .wait_timeout_while(guard, timeout, |_| self.drain.load().is_none())
            .unwrap();
        self.drain.load().is_some()
    }

    /// Resets the map to an empty accumulating state.
    ///
    /// # Panics
    ///
    /// Must not be called while other threads increment, prune, seal or
    /// drain the map.  Panics if it detects a shard in use by another
    /// operation.
    pub fn clear(&self) {
        let _guard = self.seal_lock.lock().unwrap();

        for shard in self.shards.iter() {
            match shard.try_write() {
                Ok(mut groups) => groups.clear(),
                Err(TryLockError::Poisoned(error)) => error.into_inner().clear(),
                Err(TryLockError::WouldBlock) => {
                    panic!("GroupingMap::clear() called while the map is in use by another thread")
                }
            }
        }

        self.distinct.store(0, Ordering::Relaxed);
        self.processed.store(0, Ordering::Relaxed);
        self.drain.store(None);
        self.sealed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod test {
    use super::GroupingMap;
    use crate::{group::GroupKey, record};
    use std::{
        collections::HashSet,
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::Duration,
    };

    fn key(text: &str) -> GroupKey {
        GroupKey::from_record(record! { "text" => text })
    }

    fn drain_all(map: &GroupingMap) -> Vec<GroupKey> {
        let mut keys = Vec::new();
        while let Some(key) = map.take_next() {
            keys.push(key);
        }
        keys
    }

    #[test]
    fn increment_and_count() {
        let map = GroupingMap::new(4);

        assert!(map.increment(key("one")));
        assert!(map.increment(key("two")));
        assert!(!map.increment(key("two")));
        assert!(!map.increment(key("two")));

        assert_eq!(map.get_count(&key("one")), Some(1));
        assert_eq!(map.get_count(&key("two")), Some(3));
        assert_eq!(map.get_count(&key("three")), None);
        assert_eq!(map.size(), 2);
        assert_eq!(map.processed(), 4);
    }

    #[test]
    fn retains_first_payload() {
        let map = GroupingMap::new(4);

        assert!(map.increment_with(key("a"), || record! { "text" => "a", "seq" => 1 }));
        assert!(!map.increment_with(key("a"), || record! { "text" => "a", "seq" => 2 }));
        assert!(map.increment(key("b")));

        assert_eq!(
            map.retained(&key("a")).as_deref(),
            Some(&record! { "text" => "a", "seq" => 1 })
        );
        assert_eq!(map.retained(&key("b")), None);
    }

    #[test]
    fn prune_removes_rare_keys() {
        let map = GroupingMap::new(2);
        for (text, n) in [("a", 1), ("b", 2), ("c", 3)] {
            for _ in 0..n {
                map.increment(key(text));
            }
        }

        assert_eq!(map.prune(2), 1);
        assert_eq!(map.size(), 2);
        assert_eq!(map.get_count(&key("a")), None);
        assert_eq!(map.get_count(&key("b")), Some(2));
        assert_eq!(map.get_count(&key("c")), Some(3));
    }

    #[test]
    fn checkpoint_bounds_cardinality() {
        const MAX_TYPES: usize = 20;
        const INTERVAL: u64 = 100;

        let map = GroupingMap::new(8)
            .with_max_types(Some(MAX_TYPES), 2)
            .with_checkpoint_interval(INTERVAL);

        let hot = ["h0", "h1", "h2", "h3", "h4"];
        for i in 0..10_000usize {
            if i % 2 == 0 {
                map.increment(key(hot[(i / 2) % hot.len()]));
            } else {
                map.increment(key(&format!("unique-{i}")));
            }
            assert!(map.size() <= MAX_TYPES + INTERVAL as usize);
        }

        // The last increment hit a checkpoint, which pruned all singletons.
        assert_eq!(map.size(), hot.len());
        for text in hot {
            assert_eq!(map.get_count(&key(text)), Some(1000));
        }
    }

    #[test]
    fn concurrent_checkpoints_bound_cardinality() {
        const MAX_TYPES: usize = 50;
        const INTERVAL: u64 = 1000;

        let map = Arc::new(
            GroupingMap::new(16)
                .with_max_types(Some(MAX_TYPES), 2)
                .with_checkpoint_interval(INTERVAL),
        );

        let handles = (0..8)
            .map(|t| {
                let map = map.clone();
                thread::spawn(move || {
                    for i in 0..20_000usize {
                        if i % 4 == 0 {
                            map.increment(key(&format!("hot-{}", i % 10)));
                        } else {
                            map.increment(key(&format!("unique-{t}-{i}")));
                        }
                    }
                })
            })
            .collect::<Vec<_>>();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(map.processed(), 160_000);
        // The final batch of increments landed after the last checkpoint.
        map.prune(map.prune_threshold());
        assert!(map.size() <= MAX_TYPES);
    }

    #[test]
    fn seal_takes_effect_once() {
        for threads in [1, 2, 8, 64] {
            let map = Arc::new(GroupingMap::new(4));
            map.increment(key("x"));

            let barrier = Arc::new(Barrier::new(threads));
            let winners = Arc::new(AtomicUsize::new(0));
            let handles = (0..threads)
                .map(|_| {
                    let map = map.clone();
                    let barrier = barrier.clone();
                    let winners = winners.clone();
                    thread::spawn(move || {
                        barrier.wait();
                        if map.seal() {
                            winners.fetch_add(1, Ordering::Relaxed);
                        }
                    })
                })
                .collect::<Vec<_>>();
            for handle in handles {
                handle.join().unwrap();
            }

            assert_eq!(winners.load(Ordering::Relaxed), 1);
            assert_eq!(map.seal_count(), 1);
            assert_eq!(drain_all(&map), vec![key("x")]);
        }
    }

    #[test]
    fn take_next_waits_for_seal() {
        let map = Arc::new(GroupingMap::new(4));
        map.increment(key("a"));

        let reader = {
            let map = map.clone();
            thread::spawn(move || drain_all(&map))
        };

        thread::sleep(Duration::from_millis(50));
        assert!(!reader.is_finished());
        map.seal();

        assert_eq!(reader.join().unwrap(), vec![key("a")]);
    }

    #[test]
    fn concurrent_drain_delivers_each_key_once() {
        let map = Arc::new(GroupingMap::new(16));
        for i in 0..10_000 {
            map.increment(key(&i.to_string()));
        }
        map.seal();

        let handles = (0..8)
            .map(|_| {
                let map = map.clone();
                thread::spawn(move || drain_all(&map))
            })
            .collect::<Vec<_>>();

        let mut total = 0;
        let mut all = HashSet::new();
        for handle in handles {
            let keys = handle.join().unwrap();
            total += keys.len();
            all.extend(keys);
        }

        assert_eq!(total, 10_000);
        assert_eq!(all.len(), 10_000);
        assert_eq!(map.remaining(), Some(0));
    }

    #[test]
    fn late_increments_are_ignored() {
        let map = GroupingMap::new(4);
        map.increment(key("a"));
        map.seal();

        assert!(!map.increment(key("a")));
        assert!(!map.increment(key("b")));
        assert_eq!(map.prune(100), 0);

        assert_eq!(map.get_count(&key("a")), Some(1));
        assert_eq!(map.get_count(&key("b")), None);
        // Only the increment that landed before the seal is accounted for.
        assert_eq!(map.processed(), 1);
        assert_eq!(drain_all(&map), vec![key("a")]);
    }

    #[test]
    fn wait_sealed_times_out_until_sealed() {
        let map = Arc::new(GroupingMap::new(4));
        map.increment(key("a"));
        assert!(!map.wait_sealed(Duration::from_millis(10)));

        let sealer = {
            let map = map.clone();
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                map.seal()
            })
        };
        while !map.wait_sealed(Duration::from_millis(5)) {}
        assert!(sealer.join().unwrap());

        // Sealed maps answer without waiting.
        assert!(map.wait_sealed(Duration::ZERO));
        assert_eq!(drain_all(&map), vec![key("a")]);
    }

    #[test]
    fn clear_starts_a_new_cycle() {
        let map = GroupingMap::new(4);
        map.increment(key("a"));
        map.seal();
        assert_eq!(drain_all(&map).len(), 1);

        map.clear();
        assert!(!map.is_sealed());
        assert_eq!(map.size(), 0);
        assert_eq!(map.remaining(), None);

        assert!(map.increment(key("b")));
        assert!(map.seal());
        assert_eq!(drain_all(&map), vec![key("b")]);
        assert_eq!(map.seal_count(), 2);
    }

    #[test]
    #[should_panic(expected = "in use by another thread")]
    fn clear_while_in_use_panics() {
        let map = GroupingMap::new(1);
        let _in_flight = map.shards[0].read().unwrap();
        map.clear();
    }

    #[test]
    fn empty_map_drains_nothing() {
        let map = GroupingMap::new(4);
        assert!(map.seal());
        assert_eq!(map.take_next(), None);
        assert_eq!(map.take_next(), None);
    }
}
