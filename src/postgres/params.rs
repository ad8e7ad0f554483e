// ABOUTME: JSON value binding and row decoding for tokio-postgres
// ABOUTME: Parameters adapt to the server-inferred type; rows decode by column type

use crate::error::{Error, Result};
use crate::types::JsonObject;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use rust_decimal::Decimal;
use serde_json::{Number, Value};
use std::error::Error as StdError;
use std::str::FromStr;
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;

type BoxError = Box<dyn StdError + Sync + Send>;

/// Binds a JSON value to whatever type the server inferred for the parameter
#[derive(Debug)]
pub struct JsonParam<'a>(pub &'a Value);

impl ToSql for JsonParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> std::result::Result<IsNull, BoxError> {
        let value = self.0;
        if value.is_null() {
            return Ok(IsNull::Yes);
        }

        match *ty {
            Type::BOOL => as_bool(value)?.to_sql(ty, out),
            Type::INT2 => i16::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::INT4 => i32::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::INT8 => as_i64(value)?.to_sql(ty, out),
            Type::OID => u32::try_from(as_i64(value)?)?.to_sql(ty, out),
            Type::FLOAT4 => (as_f64(value)? as f32).to_sql(ty, out),
            Type::FLOAT8 => as_f64(value)?.to_sql(ty, out),
            Type::NUMERIC => {
                let text = as_text(value);
                Decimal::from_str(&text)
                    .or_else(|_| Decimal::from_scientific(&text))?
                    .to_sql(ty, out)
            }
            Type::JSON | Type::JSONB => value.to_sql(ty, out),
            Type::UUID => uuid::Uuid::parse_str(&as_text(value))?.to_sql(ty, out),
            Type::TIMESTAMPTZ => parse_timestamptz(&as_text(value))?.to_sql(ty, out),
            Type::TIMESTAMP => parse_timestamp(&as_text(value))?.to_sql(ty, out),
            Type::DATE => NaiveDate::parse_from_str(&as_text(value), "%Y-%m-%d")?.to_sql(ty, out),
            // Text-like and unknown types take the text form
            _ => as_text(value).to_sql(ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn as_bool(value: &Value) -> std::result::Result<bool, BoxError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::String(s) => match s.as_str() {
            "t" | "true" | "TRUE" | "1" => Ok(true),
            "f" | "false" | "FALSE" | "0" => Ok(false),
            _ => Err(format!("Cannot bind '{}' as boolean", s).into()),
        },
        Value::Number(n) => Ok(n.as_i64().map(|n| n != 0).unwrap_or(false)),
        other => Err(format!("Cannot bind {} as boolean", other).into()),
    }
}

fn as_i64(value: &Value) -> std::result::Result<i64, BoxError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64))
            .ok_or_else(|| format!("Cannot bind {} as integer", n).into()),
        Value::String(s) => Ok(s.trim().parse::<i64>()?),
        Value::Bool(b) => Ok(i64::from(*b)),
        other => Err(format!("Cannot bind {} as integer", other).into()),
    }
}

fn as_f64(value: &Value) -> std::result::Result<f64, BoxError> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| format!("Cannot bind {} as float", n).into()),
        Value::String(s) => Ok(s.trim().parse::<f64>()?),
        other => Err(format!("Cannot bind {} as float", other).into()),
    }
}

fn as_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_timestamptz(text: &str) -> std::result::Result<DateTime<Utc>, BoxError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }
    // Postgres text output, e.g. "2024-05-01 10:00:00.123+02"
    Ok(DateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f%#z")?.with_timezone(&Utc))
}

fn parse_timestamp(text: &str) -> std::result::Result<NaiveDateTime, BoxError> {
    NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f"))
        .map_err(Into::into)
}

/// Decode a row into a column-ordered JSON object
pub fn row_to_json(row: &Row) -> Result<JsonObject> {
    let mut object = JsonObject::new();
    for (index, column) in row.columns().iter().enumerate() {
        object.insert(column.name().to_string(), column_to_json(row, index)?);
    }
    Ok(object)
}

fn column_to_json(row: &Row, index: usize) -> Result<Value> {
    let column = &row.columns()[index];

    let value = match *column.type_() {
        Type::BOOL => row.try_get::<_, Option<bool>>(index)?.map(Value::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)?
            .map(|v| Value::from(v as i64)),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)?
            .map(|v| Value::from(v as i64)),
        Type::INT8 => row.try_get::<_, Option<i64>>(index)?.map(Value::from),
        Type::OID => row.try_get::<_, Option<u32>>(index)?.map(Value::from),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)?
            .map(|v| float_to_json(v as f64)),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(index)?.map(float_to_json),
        // Strings keep full precision
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(index)?
            .map(|d| Value::String(d.to_string())),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(index)?.map(Value::String)
        }
        Type::JSON | Type::JSONB => row.try_get::<_, Option<Value>>(index)?,
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(index)?
            .map(|u| Value::String(u.to_string())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)?
            .map(|dt| Value::String(dt.to_rfc3339())),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)?
            .map(|dt| Value::String(dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(index)?
            .map(|d| Value::String(d.to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(index)?
            .map(|t| Value::String(t.to_string())),
        Type::BYTEA => row.try_get::<_, Option<Vec<u8>>>(index)?.map(|bytes| {
            Value::String(format!(
                "\\x{}",
                bytes.iter().map(|b| format!("{:02x}", b)).collect::<String>()
            ))
        }),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<Option<String>>>>(index)?
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect())),
        Type::INT4_ARRAY => row
            .try_get::<_, Option<Vec<Option<i32>>>>(index)?
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect())),
        Type::INT8_ARRAY => row
            .try_get::<_, Option<Vec<Option<i64>>>>(index)?
            .map(|items| Value::Array(items.into_iter().map(Value::from).collect())),
        ref other => match row.try_get::<_, Option<String>>(index) {
            Ok(text) => text.map(Value::String),
            Err(_) => {
                return Err(Error::conversion(format!(
                    "Unsupported result column type '{}' for column '{}'; cast it to text in the transformation",
                    other.name(),
                    column.name()
                )))
            }
        },
    };

    Ok(value.unwrap_or(Value::Null))
}

fn float_to_json(value: f64) -> Value {
    Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn encode(value: &Value, ty: &Type) -> BytesMut {
        let mut out = BytesMut::new();
        let is_null = JsonParam(value).to_sql(ty, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::No));
        out
    }

    #[test]
    fn test_null_binds_as_null() {
        let mut out = BytesMut::new();
        let is_null = JsonParam(&Value::Null).to_sql(&Type::INT4, &mut out).unwrap();
        assert!(matches!(is_null, IsNull::Yes));
    }

    #[test]
    fn test_integer_binding_accepts_numbers_and_strings() {
        assert_eq!(&encode(&json!(42), &Type::INT4)[..], &42i32.to_be_bytes());
        assert_eq!(&encode(&json!("42"), &Type::INT8)[..], &42i64.to_be_bytes());
    }

    #[test]
    fn test_integer_binding_rejects_overflow() {
        let mut out = BytesMut::new();
        assert!(JsonParam(&json!(70000))
            .to_sql(&Type::INT2, &mut out)
            .is_err());
    }

    #[test]
    fn test_text_binding_of_non_string() {
        assert_eq!(&encode(&json!(7), &Type::TEXT)[..], b"7");
        assert_eq!(&encode(&json!("abc"), &Type::VARCHAR)[..], b"abc");
    }

    #[test]
    fn test_bool_binding() {
        assert_eq!(&encode(&json!(true), &Type::BOOL)[..], &[1u8]);
        assert_eq!(&encode(&json!("f"), &Type::BOOL)[..], &[0u8]);
    }

    #[test]
    fn test_timestamp_parsing() {
        let rfc = parse_timestamptz("2024-05-01T10:00:00Z").unwrap();
        let pg = parse_timestamptz("2024-05-01 12:00:00+02").unwrap();
        assert_eq!(rfc, pg);
        assert!(parse_timestamp("2024-05-01 10:00:00.5").is_ok());
        assert!(parse_timestamp("2024-05-01T10:00:00").is_ok());
    }

    #[test]
    fn test_accepts_any_type() {
        assert!(<JsonParam as ToSql>::accepts(&Type::POINT));
    }
}
