// ABOUTME: Converts pgoutput tuples into ordered JSON objects
// ABOUTME: Text values are typed by column oid; unchanged TOAST columns are omitted

use super::protocol::{ColumnDescriptor, TupleData, TupleValue};
use crate::error::{Error, Result};
use crate::types::JsonObject;
use serde_json::{Number, Value};
use tokio_postgres::types::Type;

/// Build a column-ordered object from a tuple.
///
/// When `only_keys` is set, non-key columns are skipped.
pub fn tuple_to_object(
    columns: &[ColumnDescriptor],
    tuple: &TupleData,
    only_keys: bool,
) -> Result<JsonObject> {
    if tuple.0.len() > columns.len() {
        return Err(Error::protocol(format!(
            "Tuple has {} values but relation has {} columns",
            tuple.0.len(),
            columns.len()
        )));
    }

    let mut object = JsonObject::new();
    for (column, value) in columns.iter().zip(tuple.0.iter()) {
        if only_keys && !column.is_key {
            continue;
        }
        let json = match value {
            TupleValue::UnchangedToast => continue,
            TupleValue::Null => Value::Null,
            TupleValue::Text(bytes) => {
                let text = std::str::from_utf8(bytes).map_err(|e| {
                    Error::protocol(format!("Column '{}' is not valid UTF-8: {}", column.name, e))
                })?;
                text_to_json(column.type_oid, text)
            }
            TupleValue::Binary(bytes) => {
                Value::String(bytes.iter().map(|b| format!("{:02x}", b)).collect())
            }
        };
        object.insert(column.name.clone(), json);
    }
    Ok(object)
}

/// Type a text-format column value by its oid
pub fn text_to_json(type_oid: u32, text: &str) -> Value {
    let Some(ty) = Type::from_oid(type_oid) else {
        return Value::String(text.to_string());
    };

    match ty {
        Type::BOOL => Value::Bool(text == "t" || text == "true"),
        Type::INT2 | Type::INT4 | Type::INT8 | Type::OID => text
            .parse::<i64>()
            .map(|n| Value::Number(n.into()))
            .unwrap_or_else(|_| Value::String(text.to_string())),
        Type::FLOAT4 | Type::FLOAT8 => text
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(text.to_string())),
        Type::JSON | Type::JSONB => {
            serde_json::from_str(text).unwrap_or_else(|_| Value::String(text.to_string()))
        }
        _ => Value::String(text.to_string()),
    }
}
