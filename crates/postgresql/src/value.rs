//! Conversion between [`SqlValue`] and PostgreSQL wire types.
//!
//! Values arriving from the Local Store are loosely typed (SQLite stores
//! timestamps as text, booleans as integers, and so on), so binding
//! dispatches on the *target* column type reported by the server and
//! converts accordingly.

use base64::Engine;
use bytes::BytesMut;
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::error::Error;
use std::str::FromStr;
use sync_core::{timestamp, SqlValue};
use tokio_postgres::types::{to_sql_checked, IsNull, ToSql, Type};
use tokio_postgres::Row;
use tracing::warn;

type BoxError = Box<dyn Error + Sync + Send>;

/// Binds a [`SqlValue`] as a statement parameter of whatever type the
/// server expects.
#[derive(Debug)]
pub struct PgParam<'a>(pub &'a SqlValue);

impl ToSql for PgParam<'_> {
    fn to_sql(&self, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
        match self.0 {
            SqlValue::Null => Ok(IsNull::Yes),
            SqlValue::Bool(b) => encode_bool(*b, ty, out),
            SqlValue::Int(i) => encode_int(*i, ty, out),
            SqlValue::Float(f) => encode_float(*f, ty, out),
            SqlValue::Decimal(d) => encode_decimal(*d, ty, out),
            SqlValue::Text(s) => encode_text(s, ty, out),
            SqlValue::Bytes(b) => match *ty {
                Type::BYTEA => b.to_sql(ty, out),
                _ => base64::engine::general_purpose::STANDARD
                    .encode(b)
                    .to_sql(ty, out),
            },
            SqlValue::Timestamp(dt) => encode_timestamp(*dt, ty, out),
        }
    }

    fn accepts(_ty: &Type) -> bool {
        true
    }

    to_sql_checked!();
}

fn is_textual(ty: &Type) -> bool {
    matches!(
        *ty,
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME | Type::UNKNOWN
    )
}

fn encode_bool(b: bool, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::BOOL => b.to_sql(ty, out),
        Type::INT2 | Type::INT4 | Type::INT8 | Type::NUMERIC => encode_int(i64::from(b), ty, out),
        _ => b.to_string().to_sql(ty, out),
    }
}

fn encode_int(i: i64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::INT2 => i16::try_from(i)?.to_sql(ty, out),
        Type::INT4 => i32::try_from(i)?.to_sql(ty, out),
        Type::INT8 => i.to_sql(ty, out),
        Type::NUMERIC => Decimal::from(i).to_sql(ty, out),
        Type::FLOAT4 => (i as f32).to_sql(ty, out),
        Type::FLOAT8 => (i as f64).to_sql(ty, out),
        Type::BOOL => (i != 0).to_sql(ty, out),
        _ => i.to_string().to_sql(ty, out),
    }
}

fn encode_float(f: f64, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::FLOAT4 => (f as f32).to_sql(ty, out),
        Type::FLOAT8 => f.to_sql(ty, out),
        Type::NUMERIC => Decimal::try_from(f)?.to_sql(ty, out),
        Type::INT2 | Type::INT4 | Type::INT8 if f.fract() == 0.0 => encode_int(f as i64, ty, out),
        _ => f.to_string().to_sql(ty, out),
    }
}

fn encode_decimal(d: Decimal, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::NUMERIC => d.to_sql(ty, out),
        Type::FLOAT4 | Type::FLOAT8 => {
            let f = d.to_f64().ok_or("decimal out of range for float")?;
            encode_float(f, ty, out)
        }
        Type::INT2 | Type::INT4 | Type::INT8 if d.fract().is_zero() => {
            let i = d.to_i64().ok_or("decimal out of range for integer")?;
            encode_int(i, ty, out)
        }
        _ => d.to_string().to_sql(ty, out),
    }
}

fn encode_timestamp(dt: DateTime<Utc>, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    match *ty {
        Type::TIMESTAMPTZ => dt.to_sql(ty, out),
        Type::TIMESTAMP => dt.naive_utc().to_sql(ty, out),
        Type::DATE => dt.date_naive().to_sql(ty, out),
        _ => timestamp::canonical(&dt).to_sql(ty, out),
    }
}

fn encode_text(s: &str, ty: &Type, out: &mut BytesMut) -> Result<IsNull, BoxError> {
    if is_textual(ty) {
        return s.to_sql(ty, out);
    }

    let trimmed = s.trim();
    match *ty {
        Type::INT2 | Type::INT4 | Type::INT8 => encode_int(trimmed.parse()?, ty, out),
        Type::FLOAT4 | Type::FLOAT8 => encode_float(trimmed.parse()?, ty, out),
        Type::NUMERIC => Decimal::from_str(trimmed)?.to_sql(ty, out),
        Type::BOOL => parse_bool(trimmed)
            .ok_or_else(|| format!("invalid boolean: {trimmed}"))?
            .to_sql(ty, out),
        Type::TIMESTAMPTZ | Type::TIMESTAMP => {
            encode_timestamp(timestamp::parse(trimmed, Tz::UTC)?, ty, out)
        }
        Type::DATE => match NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
            Ok(date) => date.to_sql(ty, out),
            Err(_) => encode_timestamp(timestamp::parse(trimmed, Tz::UTC)?, ty, out),
        },
        Type::TIME => NaiveTime::from_str(trimmed)?.to_sql(ty, out),
        Type::JSON | Type::JSONB => serde_json::from_str::<serde_json::Value>(s)?.to_sql(ty, out),
        Type::UUID => uuid::Uuid::parse_str(trimmed)?.to_sql(ty, out),
        // Captured blobs arrive as `\x` hex, engine-built payloads as base64.
        Type::BYTEA => match trimmed.strip_prefix("\\x") {
            Some(digits) => hex::decode(digits)?.to_sql(ty, out),
            None => base64::engine::general_purpose::STANDARD
                .decode(trimmed)?
                .to_sql(ty, out),
        },
        // Let the server reject what it cannot cast.
        _ => s.to_sql(&Type::TEXT, out),
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.to_ascii_lowercase().as_str() {
        "1" | "t" | "true" | "y" | "yes" => Some(true),
        "0" | "f" | "false" | "n" | "no" => Some(false),
        _ => None,
    }
}

/// Wrap a parameter slice for `Client::query`.
pub fn params(values: &[SqlValue]) -> Vec<PgParam<'_>> {
    values.iter().map(PgParam).collect()
}

/// Borrow wrapped parameters as the trait-object slice the driver takes.
pub fn as_refs<'a>(params: &'a [PgParam<'a>]) -> Vec<&'a (dyn ToSql + Sync)> {
    params.iter().map(|p| p as &(dyn ToSql + Sync)).collect()
}

/// Convert one column of a PostgreSQL row.
pub fn convert_value(row: &Row, index: usize) -> Result<SqlValue, tokio_postgres::Error> {
    let pg_type = row.columns()[index].type_();

    Ok(match *pg_type {
        Type::BOOL => row
            .try_get::<_, Option<bool>>(index)?
            .map_or(SqlValue::Null, SqlValue::Bool),
        Type::INT2 => row
            .try_get::<_, Option<i16>>(index)?
            .map_or(SqlValue::Null, |i| SqlValue::Int(i64::from(i))),
        Type::INT4 => row
            .try_get::<_, Option<i32>>(index)?
            .map_or(SqlValue::Null, |i| SqlValue::Int(i64::from(i))),
        Type::INT8 => row
            .try_get::<_, Option<i64>>(index)?
            .map_or(SqlValue::Null, SqlValue::Int),
        Type::FLOAT4 => row
            .try_get::<_, Option<f32>>(index)?
            .map_or(SqlValue::Null, |f| SqlValue::Float(f64::from(f))),
        Type::FLOAT8 => row
            .try_get::<_, Option<f64>>(index)?
            .map_or(SqlValue::Null, SqlValue::Float),
        Type::NUMERIC => row
            .try_get::<_, Option<Decimal>>(index)?
            .map_or(SqlValue::Null, SqlValue::Decimal),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => row
            .try_get::<_, Option<String>>(index)?
            .map_or(SqlValue::Null, SqlValue::Text),
        Type::TIMESTAMP => row
            .try_get::<_, Option<NaiveDateTime>>(index)?
            .map_or(SqlValue::Null, |ts| SqlValue::Timestamp(ts.and_utc())),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<DateTime<Utc>>>(index)?
            .map_or(SqlValue::Null, SqlValue::Timestamp),
        Type::DATE => row
            .try_get::<_, Option<NaiveDate>>(index)?
            .map_or(SqlValue::Null, |d| SqlValue::Text(d.format("%Y-%m-%d").to_string())),
        Type::TIME => row
            .try_get::<_, Option<NaiveTime>>(index)?
            .map_or(SqlValue::Null, |t| SqlValue::Text(t.to_string())),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(index)?
            .map_or(SqlValue::Null, |j| SqlValue::Text(j.to_string())),
        Type::UUID => row
            .try_get::<_, Option<uuid::Uuid>>(index)?
            .map_or(SqlValue::Null, |u| SqlValue::Text(u.to_string())),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(index)?
            .map_or(SqlValue::Null, SqlValue::Bytes),
        _ => {
            // For unknown types, try to get as string
            match row.try_get::<_, Option<String>>(index) {
                Ok(v) => v.map_or(SqlValue::Null, SqlValue::Text),
                Err(e) => {
                    warn!("Unsupported PostgreSQL type {pg_type:?}, reading as NULL: {e}");
                    SqlValue::Null
                }
            }
        }
    })
}

pub fn convert_row(row: &Row) -> Result<Vec<SqlValue>, tokio_postgres::Error> {
    (0..row.len()).map(|i| convert_value(row, i)).collect()
}
