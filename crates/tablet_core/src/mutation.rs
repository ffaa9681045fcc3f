//! Turning row operations into store changes.
//!
//! An operation's effect depends only on the schema and on the key's
//! current live values. The same planning runs when a batch is first
//! applied and when recovery re-executes it against the logged target, so
//! both paths agree on what every operation did.

use crate::error::{TabletError, TabletResult};
use crate::row::{RowChange, RowOp, Schema, Values};

/// What an operation does to its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    /// Create a new version with these full values.
    Insert(Values),
    /// Change the live version.
    Mutate(RowChange),
    /// Succeed without changing anything.
    Nothing,
}

/// Plans `op` against the key's live values (`None` if absent or deleted).
///
/// # Errors
///
/// Returns a per-operation error: `Validation` for a malformed operation,
/// `KeyExists` for an insert of a live key and `KeyNotFound` for an update
/// or delete of an absent one.
pub fn plan(schema: &Schema, op: &RowOp, live: Option<&Values>) -> TabletResult<Effect> {
    schema.validate_key(op.key())?;
    match op {
        RowOp::Insert(row) => {
            let values = schema.complete(&row.values)?;
            match live {
                Some(_) => Err(TabletError::KeyExists {
                    key: row.key.clone(),
                }),
                None => Ok(Effect::Insert(values)),
            }
        }
        RowOp::InsertPkOnly(key) => match live {
            Some(_) => Err(TabletError::KeyExists { key: key.clone() }),
            None => Ok(Effect::Insert(schema.null_values())),
        },
        RowOp::Upsert(row) => {
            let values = schema.complete(&row.values)?;
            match live {
                None => Ok(Effect::Insert(values)),
                Some(current) => Ok(update_effect(current, &row.values)),
            }
        }
        RowOp::UpsertPkOnly(_) => match live {
            None => Ok(Effect::Insert(schema.null_values())),
            Some(_) => Ok(Effect::Nothing),
        },
        RowOp::Update { key, values } => {
            if values.is_empty() {
                return Err(TabletError::validation(format!(
                    "update of {key} sets no columns"
                )));
            }
            schema.validate_columns(values.keys())?;
            match live {
                None => Err(TabletError::KeyNotFound { key: key.clone() }),
                Some(current) => Ok(update_effect(current, values)),
            }
        }
        RowOp::Delete(key) => match live {
            None => Err(TabletError::KeyNotFound { key: key.clone() }),
            Some(_) => Ok(Effect::Mutate(RowChange::Delete)),
        },
    }
}

/// An update that sets only the supplied columns. Columns already holding
/// the supplied value are still recorded so the history shows the write.
fn update_effect(current: &Values, supplied: &Values) -> Effect {
    if supplied.is_empty() {
        return Effect::Nothing;
    }
    debug_assert!(supplied.keys().all(|c| current.contains_key(c)));
    Effect::Mutate(RowChange::Update(
        supplied
            .iter()
            .map(|(name, value)| (name.clone(), value.clone()))
            .collect(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::row::{Row, RowKey, Value};

    fn schema() -> Schema {
        Schema::new(["key"], ["val"]).unwrap()
    }

    fn vals(v: i64) -> Values {
        [("val".to_string(), Value::Int(v))].into_iter().collect()
    }

    fn row(k: i64, v: i64) -> Row {
        Row::new(RowKey::int(k), vals(v))
    }

    #[test]
    fn insert_requires_absent_key() {
        let s = schema();
        assert_eq!(
            plan(&s, &RowOp::Insert(row(1, 5)), None).unwrap(),
            Effect::Insert(vals(5))
        );
        assert!(matches!(
            plan(&s, &RowOp::Insert(row(1, 5)), Some(&vals(1))),
            Err(TabletError::KeyExists { .. })
        ));
    }

    #[test]
    fn insert_fills_missing_columns_with_null() {
        let s = schema();
        let op = RowOp::Insert(Row::new(RowKey::int(1), Values::new()));
        let nulls: Values = [("val".to_string(), Value::Null)].into_iter().collect();
        assert_eq!(plan(&s, &op, None).unwrap(), Effect::Insert(nulls.clone()));
        assert_eq!(
            plan(&s, &RowOp::InsertPkOnly(RowKey::int(1)), None).unwrap(),
            Effect::Insert(nulls)
        );
    }

    #[test]
    fn upsert_pk_only_keeps_live_values() {
        let s = schema();
        let op = RowOp::UpsertPkOnly(RowKey::int(1));
        assert_eq!(plan(&s, &op, Some(&vals(5))).unwrap(), Effect::Nothing);
        assert!(matches!(plan(&s, &op, None).unwrap(), Effect::Insert(_)));
    }

    #[test]
    fn upsert_of_live_key_updates() {
        let s = schema();
        assert_eq!(
            plan(&s, &RowOp::Upsert(row(1, 8)), Some(&vals(5))).unwrap(),
            Effect::Mutate(RowChange::Update(vec![("val".into(), Value::Int(8))]))
        );
    }

    #[test]
    fn update_and_delete_require_live_key() {
        let s = schema();
        let update = RowOp::Update {
            key: RowKey::int(1),
            values: vals(2),
        };
        assert!(matches!(
            plan(&s, &update, None),
            Err(TabletError::KeyNotFound { .. })
        ));
        assert!(matches!(
            plan(&s, &RowOp::Delete(RowKey::int(1)), None),
            Err(TabletError::KeyNotFound { .. })
        ));
        assert_eq!(
            plan(&s, &RowOp::Delete(RowKey::int(1)), Some(&vals(1))).unwrap(),
            Effect::Mutate(RowChange::Delete)
        );
    }

    #[test]
    fn malformed_operations_are_rejected() {
        let s = schema();
        let unknown = RowOp::Update {
            key: RowKey::int(1),
            values: [("nope".to_string(), Value::Int(1))].into_iter().collect(),
        };
        assert!(matches!(
            plan(&s, &unknown, Some(&vals(1))),
            Err(TabletError::Validation { .. })
        ));
        let empty = RowOp::Update {
            key: RowKey::int(1),
            values: Values::new(),
        };
        assert!(plan(&s, &empty, Some(&vals(1))).is_err());
        let wide_key = RowOp::Delete(RowKey(vec![Value::Int(1), Value::Int(2)]));
        assert!(matches!(
            plan(&s, &wide_key, Some(&vals(1))),
            Err(TabletError::Validation { .. })
        ));
    }
}
