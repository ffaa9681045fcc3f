//! Test fixtures and tablet helpers.
//!
//! Provides the two schemas the fuzz suite runs against and a tablet that
//! lives in its own temporary directory and can be restarted in place.

use std::ops::Deref;
use std::path::Path;
use tablet_core::{Row, RowKey, Schema, Tablet, TabletConfig, TabletResult, Value, Values};
use tempfile::TempDir;

/// Name of the key column in the fixture schemas.
pub const KEY_COLUMN: &str = "key";

/// Name of the value column in [`int_schema`].
pub const VALUE_COLUMN: &str = "val";

/// A `(key INT, val INT NULL)` schema.
#[must_use]
pub fn int_schema() -> Schema {
    Schema::new([KEY_COLUMN], [VALUE_COLUMN]).expect("fixture schema is valid")
}

/// A schema with a single key column and no value columns.
#[must_use]
pub fn pk_only_schema() -> Schema {
    Schema::new([KEY_COLUMN], std::iter::empty::<&str>()).expect("fixture schema is valid")
}

/// Tablet configuration for tests: no fsync and no background thread.
#[must_use]
pub fn test_config() -> TabletConfig {
    TabletConfig::default()
        .sync_on_commit(false)
        .maintenance_interval(None)
}

/// Builds `val = v`, or `val = NULL` for `None`.
#[must_use]
pub fn int_values(v: Option<i64>) -> Values {
    let value = v.map_or(Value::Null, Value::Int);
    [(VALUE_COLUMN.to_string(), value)].into_iter().collect()
}

/// Builds a `(key, val)` row.
#[must_use]
pub fn int_row(key: i64, val: Option<i64>) -> Row {
    Row::new(RowKey::int(key), int_values(val))
}

/// Reads the `(key, val)` pair back out of a fixture row.
#[must_use]
pub fn decode_int_row(row: &Row) -> (i64, Option<i64>) {
    let key = row.key.columns().first().and_then(Value::as_int).unwrap_or_default();
    let val = row.get(VALUE_COLUMN).and_then(Value::as_int);
    (key, val)
}

/// A tablet in a temporary directory, removed on drop.
pub struct TestTablet {
    tablet: Option<Tablet>,
    dir: TempDir,
}

impl TestTablet {
    /// Creates an empty tablet.
    pub fn create(schema: Schema, config: TabletConfig) -> TabletResult<Self> {
        let dir = TempDir::new()?;
        let tablet = Tablet::create(dir.path(), schema, config)?;
        Ok(Self {
            tablet: Some(tablet),
            dir,
        })
    }

    /// Creates an empty tablet with [`int_schema`] and [`test_config`].
    #[must_use]
    pub fn int() -> Self {
        Self::create(int_schema(), test_config()).expect("failed to create test tablet")
    }

    /// Returns the tablet.
    #[must_use]
    pub fn tablet(&self) -> &Tablet {
        self.tablet.as_ref().expect("tablet is open between restarts")
    }

    /// Closes the tablet and recovers it from its directory.
    pub fn restart(&mut self) -> TabletResult<()> {
        let tablet = self.tablet.take().expect("tablet is open between restarts");
        self.tablet = Some(tablet.restart()?);
        Ok(())
    }

    /// Closes the tablet, runs `f` on its directory, then reopens it.
    ///
    /// Used to damage files the way a crash would.
    pub fn while_closed<F>(&mut self, f: F) -> TabletResult<()>
    where
        F: FnOnce(&Path) -> std::io::Result<()>,
    {
        let tablet = self.tablet.take().expect("tablet is open between restarts");
        let config = tablet.config().clone();
        drop(tablet);
        f(self.dir.path())?;
        self.tablet = Some(Tablet::open(self.dir.path(), config)?);
        Ok(())
    }

    /// Returns the tablet directory.
    #[must_use]
    pub fn path(&self) -> &Path {
        self.dir.path()
    }
}

impl Deref for TestTablet {
    type Target = Tablet;

    fn deref(&self) -> &Self::Target {
        self.tablet()
    }
}

/// Runs a test with a fresh [`int_schema`] tablet.
pub fn with_temp_tablet<F, R>(f: F) -> R
where
    F: FnOnce(&mut TestTablet) -> R,
{
    let mut tablet = TestTablet::int();
    f(&mut tablet)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tablet_core::{RowOp, ScanSpec};

    #[test]
    fn schemas() {
        assert!(!int_schema().is_pk_only());
        assert!(pk_only_schema().is_pk_only());
    }

    #[test]
    fn restart_keeps_rows() {
        with_temp_tablet(|t| {
            t.apply(RowOp::Insert(int_row(1, Some(5)))).unwrap();
            t.restart().unwrap();
            let rows: Vec<_> = t
                .scan(ScanSpec::new())
                .unwrap()
                .map(|r| decode_int_row(&r.unwrap()))
                .collect();
            assert_eq!(rows, vec![(1, Some(5))]);
        });
    }
}
