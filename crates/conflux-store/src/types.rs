//! Store-type table and type-directed parameter conversion.
//!
//! Maps lower-cased Postgres type names to a fixed set of bind families and
//! converts JSON field values into native binds for those families. A type
//! name with no entry is a schema-mapping gap and fails loudly; it is never
//! treated as a per-request error.
use crate::{Result, SchemaColumn, StoreError};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rust_decimal::Decimal;
use serde_json::Value;
use std::str::FromStr;
use uuid::Uuid;

/// Bind families supported by the update-statement compiler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreType {
    SmallInt,
    Int,
    BigInt,
    Bool,
    /// Fixed-length character (`char`/`bpchar`).
    Char,
    VarChar,
    Text,
    Date,
    Timestamp,
    TimestampTz,
    Numeric,
    Real,
    Double,
    Uuid,
    Bytea,
    Json,
}

/// Look up the bind family for a lower-cased store type name.
pub fn store_type(sql_type: &str) -> Option<StoreType> {
    let t = match sql_type {
        "int2" | "smallint" => StoreType::SmallInt,
        "int4" | "int" | "integer" => StoreType::Int,
        "int8" | "bigint" => StoreType::BigInt,
        "bool" | "boolean" => StoreType::Bool,
        "bpchar" | "char" => StoreType::Char,
        "varchar" => StoreType::VarChar,
        "text" => StoreType::Text,
        "date" => StoreType::Date,
        "timestamp" => StoreType::Timestamp,
        "timestamptz" => StoreType::TimestampTz,
        "numeric" | "decimal" => StoreType::Numeric,
        "float4" | "real" => StoreType::Real,
        "float8" | "double precision" => StoreType::Double,
        "uuid" => StoreType::Uuid,
        "bytea" => StoreType::Bytea,
        "json" | "jsonb" => StoreType::Json,
        _ => return None,
    };
    Some(t)
}

/// A parameter value carrying its native store type. `None` payloads bind as
/// typed SQL NULLs.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    SmallInt(Option<i16>),
    Int(Option<i32>),
    BigInt(Option<i64>),
    Bool(Option<bool>),
    Text(Option<String>),
    Date(Option<NaiveDate>),
    Timestamp(Option<NaiveDateTime>),
    TimestampTz(Option<DateTime<Utc>>),
    Numeric(Option<Decimal>),
    Real(Option<f32>),
    Double(Option<f64>),
    Uuid(Option<Uuid>),
    Bytea(Option<Vec<u8>>),
    Json(Option<Value>),
}

fn invalid(column: &SchemaColumn, reason: impl Into<String>) -> StoreError {
    StoreError::InvalidValue {
        column: column.column_name.clone(),
        reason: reason.into(),
    }
}

fn lookup(column: &SchemaColumn) -> Result<StoreType> {
    store_type(&column.sql_type).ok_or_else(|| StoreError::UnmappedType {
        column: column.column_name.clone(),
        sql_type: column.sql_type.clone(),
    })
}

/// Convert a changed-field JSON value into the column's native bind.
pub fn bind_value(column: &SchemaColumn, value: &Value) -> Result<BindValue> {
    let store_type = lookup(column)?;

    if value.is_null() {
        return Ok(null_bind(store_type));
    }

    let bind = match store_type {
        StoreType::SmallInt => BindValue::SmallInt(Some(
            as_i64(column, value)?
                .try_into()
                .map_err(|_| invalid(column, "out of range for smallint"))?,
        )),
        StoreType::Int => BindValue::Int(Some(
            as_i64(column, value)?
                .try_into()
                .map_err(|_| invalid(column, "out of range for integer"))?,
        )),
        StoreType::BigInt => BindValue::BigInt(Some(as_i64(column, value)?)),
        StoreType::Bool => BindValue::Bool(Some(
            value
                .as_bool()
                .ok_or_else(|| invalid(column, "expected a boolean"))?,
        )),
        StoreType::Char | StoreType::VarChar | StoreType::Text => {
            BindValue::Text(Some(as_str(column, value)?.to_string()))
        }
        StoreType::Date => BindValue::Date(Some(
            NaiveDate::parse_from_str(as_str(column, value)?, "%Y-%m-%d")
                .map_err(|err| invalid(column, format!("bad date: {err}")))?,
        )),
        StoreType::Timestamp => BindValue::Timestamp(Some(parse_naive_datetime(
            column,
            as_str(column, value)?,
        )?)),
        StoreType::TimestampTz => BindValue::TimestampTz(Some(
            DateTime::parse_from_rfc3339(as_str(column, value)?)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|err| invalid(column, format!("bad timestamptz: {err}")))?,
        )),
        StoreType::Numeric => BindValue::Numeric(Some(parse_decimal(column, value)?)),
        StoreType::Real => BindValue::Real(Some(to_f32(column, as_f64(column, value)?)?)),
        StoreType::Double => BindValue::Double(Some(as_f64(column, value)?)),
        StoreType::Uuid => BindValue::Uuid(Some(
            Uuid::parse_str(as_str(column, value)?)
                .map_err(|err| invalid(column, format!("bad uuid: {err}")))?,
        )),
        // Byte payloads arrive as opaque JSON strings.
        StoreType::Bytea => BindValue::Bytea(Some(as_str(column, value)?.as_bytes().to_vec())),
        StoreType::Json => BindValue::Json(Some(value.clone())),
    };

    Ok(bind)
}

/// Convert the partition key string into the primary-key column's native
/// bind. Partition keys are the string form of the key value, so every
/// family parses from text here.
pub fn bind_partition_key(column: &SchemaColumn, partition_key: &str) -> Result<BindValue> {
    let store_type = lookup(column)?;

    let bind = match store_type {
        StoreType::SmallInt => BindValue::SmallInt(Some(parse_key(column, partition_key)?)),
        StoreType::Int => BindValue::Int(Some(parse_key(column, partition_key)?)),
        StoreType::BigInt => BindValue::BigInt(Some(parse_key(column, partition_key)?)),
        StoreType::Char | StoreType::VarChar | StoreType::Text => {
            BindValue::Text(Some(partition_key.to_string()))
        }
        StoreType::Uuid => BindValue::Uuid(Some(
            Uuid::parse_str(partition_key)
                .map_err(|err| invalid(column, format!("bad uuid key: {err}")))?,
        )),
        StoreType::Numeric => BindValue::Numeric(Some(
            Decimal::from_str(partition_key)
                .map_err(|err| invalid(column, format!("bad numeric key: {err}")))?,
        )),
        _ => {
            return Err(invalid(
                column,
                format!("unsupported partition key type {}", column.sql_type),
            ))
        }
    };

    Ok(bind)
}

fn null_bind(store_type: StoreType) -> BindValue {
    match store_type {
        StoreType::SmallInt => BindValue::SmallInt(None),
        StoreType::Int => BindValue::Int(None),
        StoreType::BigInt => BindValue::BigInt(None),
        StoreType::Bool => BindValue::Bool(None),
        StoreType::Char | StoreType::VarChar | StoreType::Text => BindValue::Text(None),
        StoreType::Date => BindValue::Date(None),
        StoreType::Timestamp => BindValue::Timestamp(None),
        StoreType::TimestampTz => BindValue::TimestampTz(None),
        StoreType::Numeric => BindValue::Numeric(None),
        StoreType::Real => BindValue::Real(None),
        StoreType::Double => BindValue::Double(None),
        StoreType::Uuid => BindValue::Uuid(None),
        StoreType::Bytea => BindValue::Bytea(None),
        StoreType::Json => BindValue::Json(None),
    }
}

fn as_i64(column: &SchemaColumn, value: &Value) -> Result<i64> {
    value
        .as_i64()
        .ok_or_else(|| invalid(column, "expected an integer"))
}

fn as_f64(column: &SchemaColumn, value: &Value) -> Result<f64> {
    value
        .as_f64()
        .ok_or_else(|| invalid(column, "expected a number"))
}

fn as_str<'v>(column: &SchemaColumn, value: &'v Value) -> Result<&'v str> {
    value
        .as_str()
        .ok_or_else(|| invalid(column, "expected a string"))
}

// Narrowing to f32 must not silently overflow to infinity; subnormal loss
// of precision is acceptable, range loss is not.
fn to_f32(column: &SchemaColumn, value: f64) -> Result<f32> {
    let narrowed = value as f32;
    if value.is_finite() && !narrowed.is_finite() {
        return Err(invalid(column, "out of range for real"));
    }
    Ok(narrowed)
}

fn parse_key<T: FromStr>(column: &SchemaColumn, key: &str) -> Result<T> {
    key.parse()
        .map_err(|_| invalid(column, format!("bad integer key {key:?}")))
}

// Timestamps arrive either ISO ("2021-10-17T03:19:54.5433333") or with a
// space separator; fractional seconds are optional in both.
fn parse_naive_datetime(column: &SchemaColumn, raw: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .or_else(|_| NaiveDateTime::parse_from_str(raw, "%Y-%m-%d %H:%M:%S%.f"))
        .map_err(|err| invalid(column, format!("bad timestamp: {err}")))
}

fn parse_decimal(column: &SchemaColumn, value: &Value) -> Result<Decimal> {
    let raw = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => return Err(invalid(column, "expected a number or numeric string")),
    };
    Decimal::from_str(&raw).map_err(|err| invalid(column, format!("bad numeric: {err}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn column(name: &str, sql_type: &str) -> SchemaColumn {
        SchemaColumn {
            column_name: name.to_string(),
            is_primary_key: false,
            is_identity: false,
            is_nullable: true,
            sql_type: sql_type.to_string(),
            size: 0,
            precision: 0,
            scale: 0,
        }
    }

    #[test]
    fn type_table_covers_the_common_families() {
        assert_eq!(store_type("int4"), Some(StoreType::Int));
        assert_eq!(store_type("bigint"), Some(StoreType::BigInt));
        assert_eq!(store_type("bool"), Some(StoreType::Bool));
        assert_eq!(store_type("bpchar"), Some(StoreType::Char));
        assert_eq!(store_type("varchar"), Some(StoreType::VarChar));
        assert_eq!(store_type("timestamptz"), Some(StoreType::TimestampTz));
        assert_eq!(store_type("numeric"), Some(StoreType::Numeric));
        assert_eq!(store_type("uuid"), Some(StoreType::Uuid));
        assert_eq!(store_type("jsonb"), Some(StoreType::Json));
        assert_eq!(store_type("money"), None);
    }

    #[test]
    fn integer_conversions_enforce_range() {
        let c = column("N", "int2");
        assert_eq!(
            bind_value(&c, &json!(7)).unwrap(),
            BindValue::SmallInt(Some(7))
        );
        assert!(matches!(
            bind_value(&c, &json!(100_000)),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[test]
    fn null_binds_keep_their_family() {
        let c = column("Label", "varchar");
        assert_eq!(bind_value(&c, &Value::Null).unwrap(), BindValue::Text(None));
    }

    #[test]
    fn numeric_accepts_json_numbers_and_strings() {
        let c = column("DollarAmount", "numeric");
        let from_number = bind_value(&c, &json!(100.25)).unwrap();
        let from_string = bind_value(&c, &json!("100.25")).unwrap();
        assert_eq!(from_number, from_string);
    }

    #[test]
    fn real_conversion_enforces_range() {
        let c = column("Reading", "float4");
        assert_eq!(
            bind_value(&c, &json!(2.5)).unwrap(),
            BindValue::Real(Some(2.5))
        );
        assert!(matches!(
            bind_value(&c, &json!(1.0e39)),
            Err(StoreError::InvalidValue { .. })
        ));
    }

    #[test]
    fn timestamp_parses_fractional_seconds() {
        let c = column("RightNow", "timestamp");
        let bind = bind_value(&c, &json!("2021-10-17T03:19:54.5433333")).unwrap();
        match bind {
            BindValue::Timestamp(Some(ts)) => {
                assert_eq!(ts.format("%Y-%m-%d").to_string(), "2021-10-17");
            }
            other => panic!("unexpected bind: {other:?}"),
        }
    }

    #[test]
    fn unmapped_type_is_a_configuration_error() {
        let c = column("Total", "money");
        assert!(matches!(
            bind_value(&c, &json!(1)),
            Err(StoreError::UnmappedType { .. })
        ));
    }

    #[test]
    fn partition_keys_parse_by_column_type() {
        assert_eq!(
            bind_partition_key(&column("Id", "int4"), "5002").unwrap(),
            BindValue::Int(Some(5002))
        );
        assert_eq!(
            bind_partition_key(&column("Id", "varchar"), "abc").unwrap(),
            BindValue::Text(Some("abc".into()))
        );
        assert!(bind_partition_key(&column("Id", "int4"), "abc").is_err());
    }
}
