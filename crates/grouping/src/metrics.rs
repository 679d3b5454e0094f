//! Grouping metrics.
//!
//! The constants defined in this module are the names of metrics that the
//! grouping stage maintains via [`metrics`] crate interfaces.  Nothing is
//! recorded unless the embedding application installs a recorder.

use ::metrics::{counter, describe_counter, describe_gauge, gauge, Counter, Gauge, Unit};

/// Total number of increments accepted by grouping maps.  Increments that
/// arrive after a map was sealed are counted by [`LATE_RECORDS`] instead.
pub const RECORDS_PROCESSED: &str = "records_processed";

/// Number of records that arrived after the grouping map was sealed and were
/// ignored.
pub const LATE_RECORDS: &str = "late_records";

/// Number of prune passes run to keep the map under its cardinality cap.
pub const PRUNE_PASSES: &str = "prune_passes";

/// Number of keys removed by prune passes.
pub const PRUNED_KEYS: &str = "pruned_keys";

/// Number of effective seal transitions.
pub const SEALS: &str = "seals";

/// Number of distinct keys held by the map, updated on seal and prune.
pub const DISTINCT_KEYS: &str = "distinct_keys";

/// Creates the appropriate metric name for this metric.
/// As these metrics are grouping related, they are prefixed with `grouping_`.
fn metric_name(name: &str) -> String {
    format!("grouping_{}", name)
}

/// Registers descriptions for all grouping metrics with the installed
/// recorder.
pub fn describe_metrics() {
    describe_counter!(
        metric_name(RECORDS_PROCESSED),
        Unit::Count,
        "Increments accepted by grouping maps before they were sealed"
    );
    describe_counter!(
        metric_name(LATE_RECORDS),
        Unit::Count,
        "Records ignored because they arrived after the grouping map was sealed"
    );
    describe_counter!(
        metric_name(PRUNE_PASSES),
        Unit::Count,
        "Prune passes run to keep grouping maps under their cardinality cap"
    );
    describe_counter!(
        metric_name(PRUNED_KEYS),
        Unit::Count,
        "Keys removed by prune passes"
    );
    describe_counter!(
        metric_name(SEALS),
        Unit::Count,
        "Effective seal transitions of grouping maps"
    );
    describe_gauge!(
        metric_name(DISTINCT_KEYS),
        Unit::Count,
        "Distinct keys held by the grouping map"
    );
}

/// Metric handles owned by a single grouping map.
pub(crate) struct MapMetrics {
    pub records_processed: Counter,
    pub late_records: Counter,
    pub prune_passes: Counter,
    pub pruned_keys: Counter,
    pub seals: Counter,
    pub distinct_keys: Gauge,
}

impl MapMetrics {
    pub fn new() -> Self {
        Self {
            records_processed: counter!(metric_name(RECORDS_PROCESSED)),
            late_records: counter!(metric_name(LATE_RECORDS)),
            prune_passes: counter!(metric_name(PRUNE_PASSES)),
            pruned_keys: counter!(metric_name(PRUNED_KEYS)),
            seals: counter!(metric_name(SEALS)),
            distinct_keys: gauge!(metric_name(DISTINCT_KEYS)),
        }
    }
}
