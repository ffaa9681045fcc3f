//! Create, put and delete command implementations.

use super::open_tablet;
use std::path::Path;
use tablet_core::{Row, RowKey, RowOp, Schema, Tablet, TabletConfig, Value, Values};

/// Parses a command-line value: `null`, `true`, `false`, an integer, or
/// anything else as text.
pub fn parse_value(s: &str) -> Value {
    match s {
        "null" | "NULL" => Value::Null,
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => s.parse::<i64>().map_or_else(|_| Value::from(s), Value::Int),
    }
}

/// Parses comma-separated key column values against `schema`.
pub fn parse_key(schema: &Schema, s: &str) -> Result<RowKey, Box<dyn std::error::Error>> {
    let values: Vec<Value> = s.split(',').map(|part| parse_value(part.trim())).collect();
    if values.len() != schema.key_columns().len() {
        return Err(format!(
            "key has {} columns, schema has {}",
            values.len(),
            schema.key_columns().len()
        )
        .into());
    }
    Ok(RowKey(values))
}

/// Parses `column=value` assignments.
pub fn parse_assignments(assignments: &[String]) -> Result<Values, Box<dyn std::error::Error>> {
    assignments
        .iter()
        .map(|a| {
            let (column, value) = a
                .split_once('=')
                .ok_or_else(|| format!("expected column=value, got {a:?}"))?;
            Ok((column.trim().to_string(), parse_value(value.trim())))
        })
        .collect()
}

/// Runs the create command.
pub fn create(
    path: &Path,
    keys: Vec<String>,
    values: Vec<String>,
) -> Result<(), Box<dyn std::error::Error>> {
    let schema = Schema::new(keys, values)?;
    let tablet = Tablet::create(path, schema, TabletConfig::default())?;
    println!("Created tablet at {}", tablet.path().display());
    Ok(())
}

/// Runs the put command.
pub fn put(
    path: &Path,
    key: &str,
    assignments: &[String],
    upsert: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let tablet = open_tablet(path)?;
    let key = parse_key(tablet.schema(), key)?;
    let values = parse_assignments(assignments)?;
    let op = match (upsert, values.is_empty()) {
        (false, true) => RowOp::InsertPkOnly(key),
        (true, true) => RowOp::UpsertPkOnly(key),
        (false, false) => RowOp::Insert(Row::new(key, values)),
        (true, false) => RowOp::Upsert(Row::new(key, values)),
    };
    let ts = tablet.apply(op)?;
    println!("Applied at {ts}");
    Ok(())
}

/// Runs the delete command.
pub fn delete(path: &Path, key: &str) -> Result<(), Box<dyn std::error::Error>> {
    let tablet = open_tablet(path)?;
    let key = parse_key(tablet.schema(), key)?;
    let ts = tablet.apply(RowOp::Delete(key))?;
    println!("Deleted at {ts}");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn values_parse_by_shape() {
        assert_eq!(parse_value("null"), Value::Null);
        assert_eq!(parse_value("-4"), Value::Int(-4));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value("abc"), Value::Text("abc".into()));
    }

    #[test]
    fn keys_must_match_schema() {
        let schema = Schema::new(["a", "b"], ["v"]).unwrap();
        assert_eq!(
            parse_key(&schema, "1, x").unwrap(),
            RowKey(vec![Value::Int(1), Value::Text("x".into())])
        );
        assert!(parse_key(&schema, "1").is_err());
    }

    #[test]
    fn put_then_delete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t");
        create(&path, vec!["key".into()], vec!["val".into()]).unwrap();
        put(&path, "1", &["val=5".into()], false).unwrap();
        assert!(put(&path, "1", &[], false).is_err());
        put(&path, "1", &["val=6".into()], true).unwrap();

        let tablet = open_tablet(&path).unwrap();
        let row = tablet.get(&RowKey::int(1), None).unwrap().unwrap();
        assert_eq!(row.get("val"), Some(&Value::Int(6)));
        drop(tablet);

        delete(&path, "1").unwrap();
        assert!(delete(&path, "1").is_err());
    }
}
