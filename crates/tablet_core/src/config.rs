//! Tablet configuration.

use std::time::Duration;

/// Configuration for opening a tablet.
#[derive(Debug, Clone)]
pub struct TabletConfig {
    /// Whether to create the tablet directory if it doesn't exist.
    pub create_if_missing: bool,

    /// Whether to sync the WAL after every write batch.
    pub sync_on_commit: bool,

    /// Row count at which row-set compaction starts a new output container.
    pub max_rows_per_rowset: usize,

    /// Minimum number of REDO stores before minor delta compaction applies.
    pub minor_compaction_min_stores: usize,

    /// How many timestamps of UNDO history to keep.
    ///
    /// `None` keeps all history forever. With `Some(n)`, compactions may
    /// discard history older than `now - n` that no open scan still needs,
    /// and reads below that mark fail with `SnapshotTooOld`.
    pub history_retention: Option<u64>,

    /// Rows buffered per refill when a scan walks the mutable store.
    pub scan_batch_size: usize,

    /// Interval of the background maintenance thread (`None` = disabled).
    pub maintenance_interval: Option<Duration>,

    /// Mutable store row count that triggers a background flush.
    pub flush_threshold_rows: usize,

    /// Delta memory store size that triggers a background delta flush.
    pub delta_flush_threshold: usize,
}

impl Default for TabletConfig {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            sync_on_commit: true,
            max_rows_per_rowset: 100_000,
            minor_compaction_min_stores: 2,
            history_retention: None,
            scan_batch_size: 128,
            maintenance_interval: None,
            flush_threshold_rows: 10_000,
            delta_flush_threshold: 1_000,
        }
    }
}

impl TabletConfig {
    /// Creates a configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the tablet if missing.
    #[must_use]
    pub const fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether to sync the WAL on every write batch.
    #[must_use]
    pub const fn sync_on_commit(mut self, value: bool) -> Self {
        self.sync_on_commit = value;
        self
    }

    /// Sets the maximum number of rows per compaction output.
    #[must_use]
    pub const fn max_rows_per_rowset(mut self, rows: usize) -> Self {
        self.max_rows_per_rowset = rows;
        self
    }

    /// Sets the REDO store count that makes a row set a minor compaction candidate.
    #[must_use]
    pub const fn minor_compaction_min_stores(mut self, stores: usize) -> Self {
        self.minor_compaction_min_stores = stores;
        self
    }

    /// Sets the history retention window, in timestamps.
    #[must_use]
    pub const fn history_retention(mut self, window: Option<u64>) -> Self {
        self.history_retention = window;
        self
    }

    /// Sets the mutable store refill size used by scans.
    #[must_use]
    pub const fn scan_batch_size(mut self, rows: usize) -> Self {
        self.scan_batch_size = rows;
        self
    }

    /// Enables background maintenance at the given interval.
    #[must_use]
    pub const fn maintenance_interval(mut self, interval: Option<Duration>) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Sets the mutable store size that triggers a background flush.
    #[must_use]
    pub const fn flush_threshold_rows(mut self, rows: usize) -> Self {
        self.flush_threshold_rows = rows;
        self
    }

    /// Sets the delta memory store size that triggers a background delta flush.
    #[must_use]
    pub const fn delta_flush_threshold(mut self, records: usize) -> Self {
        self.delta_flush_threshold = records;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = TabletConfig::default();
        assert!(config.create_if_missing);
        assert!(config.sync_on_commit);
        assert_eq!(config.history_retention, None);
        assert_eq!(config.maintenance_interval, None);
    }

    #[test]
    fn builder_pattern() {
        let config = TabletConfig::new()
            .sync_on_commit(false)
            .max_rows_per_rowset(10)
            .history_retention(Some(50))
            .maintenance_interval(Some(Duration::from_millis(20)));

        assert!(!config.sync_on_commit);
        assert_eq!(config.max_rows_per_rowset, 10);
        assert_eq!(config.history_retention, Some(50));
        assert_eq!(config.maintenance_interval, Some(Duration::from_millis(20)));
    }
}
