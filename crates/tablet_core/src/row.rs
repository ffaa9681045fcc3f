//! Row model: values, keys, schemas, change lists and row operations.

use crate::error::{TabletError, TabletResult};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// A single cell value.
///
/// Values are totally ordered so composite keys sort deterministically:
/// `Null < Bool < Int < Text < Bytes`, then by content.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Value {
    /// SQL-style NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// UTF-8 text.
    Text(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl Value {
    /// Returns true for `Value::Null`.
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the integer payload, if any.
    #[must_use]
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Self::Int(v) => Some(*v),
            _ => None,
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Text(v.to_string())
    }
}

impl From<Option<i64>> for Value {
    fn from(v: Option<i64>) -> Self {
        v.map_or(Self::Null, Self::Int)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => write!(f, "NULL"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Text(s) => write!(f, "{s:?}"),
            Self::Bytes(b) => {
                write!(f, "0x")?;
                for byte in b {
                    write!(f, "{byte:02x}")?;
                }
                Ok(())
            }
        }
    }
}

/// Primary key tuple, compared column by column.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RowKey(pub Vec<Value>);

impl RowKey {
    /// Creates a single-column key.
    #[must_use]
    pub fn single(value: Value) -> Self {
        Self(vec![value])
    }

    /// Creates a single integer-column key.
    #[must_use]
    pub fn int(value: i64) -> Self {
        Self(vec![Value::Int(value)])
    }

    /// Returns the key columns.
    #[must_use]
    pub fn columns(&self) -> &[Value] {
        &self.0
    }
}

impl fmt::Display for RowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "(")?;
        for (i, v) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}

/// Non-key column values of one row, by column name.
pub type Values = BTreeMap<String, Value>;

/// A materialized row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Row {
    /// Primary key.
    pub key: RowKey,
    /// Non-key values.
    pub values: Values,
}

impl Row {
    /// Creates a row.
    #[must_use]
    pub fn new(key: RowKey, values: Values) -> Self {
        Self { key, values }
    }

    /// Returns the value of `column`, if present.
    #[must_use]
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.values.get(column)
    }
}

impl fmt::Display for Row {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key)?;
        for (name, value) in &self.values {
            write!(f, " {name}={value}")?;
        }
        Ok(())
    }
}

/// Column layout of a tablet.
///
/// The schema is fixed when the tablet is created and persisted in its
/// manifest. A schema without value columns is a primary-key-only table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    key_columns: Vec<String>,
    value_columns: Vec<String>,
}

impl Schema {
    /// Creates a schema.
    ///
    /// # Errors
    ///
    /// Returns a validation error if there is no key column or a column
    /// name repeats.
    pub fn new(
        key_columns: impl IntoIterator<Item = impl Into<String>>,
        value_columns: impl IntoIterator<Item = impl Into<String>>,
    ) -> TabletResult<Self> {
        let key_columns: Vec<String> = key_columns.into_iter().map(Into::into).collect();
        let value_columns: Vec<String> = value_columns.into_iter().map(Into::into).collect();
        if key_columns.is_empty() {
            return Err(TabletError::validation("schema needs at least one key column"));
        }
        let mut seen = std::collections::BTreeSet::new();
        for name in key_columns.iter().chain(&value_columns) {
            if !seen.insert(name.as_str()) {
                return Err(TabletError::validation(format!(
                    "duplicate column name {name:?}"
                )));
            }
        }
        Ok(Self {
            key_columns,
            value_columns,
        })
    }

    /// Returns the key column names.
    #[must_use]
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Returns the non-key column names.
    #[must_use]
    pub fn value_columns(&self) -> &[String] {
        &self.value_columns
    }

    /// Returns true if the schema has no non-key columns.
    #[must_use]
    pub fn is_pk_only(&self) -> bool {
        self.value_columns.is_empty()
    }

    /// Returns a value map with every non-key column set to NULL.
    #[must_use]
    pub fn null_values(&self) -> Values {
        self.value_columns
            .iter()
            .map(|c| (c.clone(), Value::Null))
            .collect()
    }

    /// Checks the arity of a key.
    ///
    /// # Errors
    ///
    /// Returns a validation error on a column count mismatch.
    pub fn validate_key(&self, key: &RowKey) -> TabletResult<()> {
        if key.0.len() != self.key_columns.len() {
            return Err(TabletError::validation(format!(
                "key {key} has {} columns, schema has {}",
                key.0.len(),
                self.key_columns.len()
            )));
        }
        Ok(())
    }

    /// Checks that every named column is a non-key column.
    ///
    /// # Errors
    ///
    /// Returns a validation error naming the first unknown column.
    pub fn validate_columns<'a>(
        &self,
        names: impl IntoIterator<Item = &'a String>,
    ) -> TabletResult<()> {
        for name in names {
            if !self.value_columns.contains(name) {
                return Err(TabletError::validation(format!(
                    "unknown value column {name:?}"
                )));
            }
        }
        Ok(())
    }

    /// Expands a partial value map to a full row, filling gaps with NULL.
    ///
    /// # Errors
    ///
    /// Returns a validation error on an unknown column.
    pub fn complete(&self, partial: &Values) -> TabletResult<Values> {
        self.validate_columns(partial.keys())?;
        let mut full = self.null_values();
        for (name, value) in partial {
            full.insert(name.clone(), value.clone());
        }
        Ok(full)
    }
}

/// A change to one row, as carried by mutable-store change lists and delta
/// records.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowChange {
    /// Set the listed columns on a live row.
    Update(Vec<(String, Value)>),
    /// Delete a live row.
    Delete,
    /// Bring an absent row back with a full set of values.
    Reinsert(Values),
}

impl RowChange {
    /// Applies the change to a row state.
    ///
    /// # Errors
    ///
    /// Returns a corruption error when the change does not fit the state
    /// (updating or deleting an absent row, reinserting a live one).
    pub fn apply(&self, state: &mut Option<Values>, key: &RowKey) -> TabletResult<()> {
        match self {
            Self::Update(columns) => {
                let values = state.as_mut().ok_or_else(|| {
                    TabletError::corruption(format!("update applied to absent row {key}"))
                })?;
                for (name, value) in columns {
                    values.insert(name.clone(), value.clone());
                }
            }
            Self::Delete => {
                if state.take().is_none() {
                    return Err(TabletError::corruption(format!(
                        "delete applied to absent row {key}"
                    )));
                }
            }
            Self::Reinsert(values) => {
                if state.is_some() {
                    return Err(TabletError::corruption(format!(
                        "reinsert applied to live row {key}"
                    )));
                }
                *state = Some(values.clone());
            }
        }
        Ok(())
    }

    /// Returns the change that turns `from` into `to`, or `None` if the two
    /// states are equal.
    #[must_use]
    pub fn between(from: &Option<Values>, to: &Option<Values>) -> Option<Self> {
        match (from, to) {
            (None, None) => None,
            (Some(_), None) => Some(Self::Delete),
            (None, Some(values)) => Some(Self::Reinsert(values.clone())),
            (Some(old), Some(new)) => {
                let columns: Vec<(String, Value)> = new
                    .iter()
                    .filter(|(name, value)| old.get(*name) != Some(*value))
                    .map(|(name, value)| (name.clone(), value.clone()))
                    .collect();
                if columns.is_empty() {
                    None
                } else {
                    Some(Self::Update(columns))
                }
            }
        }
    }
}

impl fmt::Display for RowChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Update(columns) => {
                write!(f, "SET")?;
                for (name, value) in columns {
                    write!(f, " {name}={value}")?;
                }
                Ok(())
            }
            Self::Delete => write!(f, "DELETE"),
            Self::Reinsert(values) => {
                write!(f, "REINSERT")?;
                for (name, value) in values {
                    write!(f, " {name}={value}")?;
                }
                Ok(())
            }
        }
    }
}

/// One row operation inside a write batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RowOp {
    /// Insert a new row; fails if the key is live. Missing columns are NULL.
    Insert(Row),
    /// Insert a row with every non-key column NULL.
    InsertPkOnly(RowKey),
    /// Insert the row, or overwrite the supplied columns of the live row.
    Upsert(Row),
    /// Insert a NULL-valued row, or leave a live row untouched.
    UpsertPkOnly(RowKey),
    /// Set columns of a live row; fails if the key is absent.
    Update {
        /// Target key.
        key: RowKey,
        /// Columns to set.
        values: Values,
    },
    /// Delete a live row; fails if the key is absent.
    Delete(RowKey),
}

impl RowOp {
    /// Returns the key the operation targets.
    #[must_use]
    pub fn key(&self) -> &RowKey {
        match self {
            Self::Insert(row) | Self::Upsert(row) => &row.key,
            Self::InsertPkOnly(key) | Self::UpsertPkOnly(key) | Self::Delete(key) => key,
            Self::Update { key, .. } => key,
        }
    }

    /// Returns the operation name.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Insert(_) => "INSERT",
            Self::InsertPkOnly(_) => "INSERT_PK_ONLY",
            Self::Upsert(_) => "UPSERT",
            Self::UpsertPkOnly(_) => "UPSERT_PK_ONLY",
            Self::Update { .. } => "UPDATE",
            Self::Delete(_) => "DELETE",
        }
    }
}
