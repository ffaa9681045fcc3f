//! Property-based test generators using proptest.
//!
//! Raw operation sequences are generated freely and then passed through
//! [`CaseBuilder`], so every generated case is valid and shrinking removes
//! operations without ever producing an invalid one.

use crate::fixtures::int_row;
use crate::fuzz::{CaseBuilder, OpSet, TestOp, TestOpKind};
use proptest::prelude::*;
use tablet_core::{RowKey, RowOp};

/// Strategy for one operation kind from `set`.
pub fn op_kind_strategy(set: OpSet) -> impl Strategy<Value = TestOpKind> {
    prop::sample::select(set.kinds())
}

/// Strategy for a valid fuzz case built from up to `max_offers` offered
/// operations over `keyspace` keys.
pub fn test_case_strategy(
    max_offers: usize,
    set: OpSet,
    keyspace: usize,
) -> impl Strategy<Value = Vec<TestOp>> {
    prop::collection::vec(
        (op_kind_strategy(set), 0..keyspace.max(1), any::<u64>()),
        0..=max_offers,
    )
    .prop_map(move |offers| {
        let mut builder = CaseBuilder::new(keyspace);
        for (kind, key, pick) in offers {
            builder.offer(kind, key, pick);
        }
        builder.finish()
    })
}

/// Strategy for a nullable value.
pub fn value_strategy() -> impl Strategy<Value = Option<i64>> {
    prop::option::of(-1_000i64..1_000)
}

/// Strategy for a single row operation on the int fixture schema, not
/// necessarily valid for the tablet's current contents.
pub fn row_op_strategy(keyspace: i64) -> impl Strategy<Value = RowOp> {
    let key = 0..keyspace.max(1);
    prop_oneof![
        3 => (key.clone(), value_strategy()).prop_map(|(k, v)| RowOp::Insert(int_row(k, v))),
        1 => key.clone().prop_map(|k| RowOp::InsertPkOnly(RowKey::int(k))),
        2 => (key.clone(), value_strategy()).prop_map(|(k, v)| RowOp::Upsert(int_row(k, v))),
        1 => key.clone().prop_map(|k| RowOp::UpsertPkOnly(RowKey::int(k))),
        3 => (key.clone(), value_strategy()).prop_map(|(k, v)| RowOp::Update {
            key: RowKey::int(k),
            values: int_row(k, v).values,
        }),
        2 => key.prop_map(|k| RowOp::Delete(RowKey::int(k))),
    ]
}

/// Strategy for a list of batches of row operations.
pub fn batches_strategy(
    keyspace: i64,
    max_batches: usize,
    max_batch_len: usize,
) -> impl Strategy<Value = Vec<Vec<RowOp>>> {
    prop::collection::vec(
        prop::collection::vec(row_op_strategy(keyspace), 1..=max_batch_len.max(1)),
        0..=max_batches,
    )
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 64,
            max_shrink_iters: 500,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 16,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}
