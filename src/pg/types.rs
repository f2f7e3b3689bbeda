//! PostgreSQL type encoding and decoding.
//!
//! Values travel in binary format where we have a codec for the type and in
//! text format otherwise. Dates and times use the server epoch 2000-01-01.
//! Reference: https://www.postgresql.org/docs/current/protocol-overview.html#PROTOCOL-FORMAT-CODES

use chrono::{DateTime, Duration, NaiveDate, NaiveDateTime, NaiveTime, Utc};

use crate::error::{Error, Result};

// ============================================================================
// Type OIDs
// ============================================================================

/// PostgreSQL type object identifiers (OIDs).
///
/// These are the built-in type OIDs from PostgreSQL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Oid(pub i32);

impl Oid {
    /// Let the server infer the type.
    pub const UNSPECIFIED: Oid = Oid(0);

    pub const BOOL: Oid = Oid(16);
    pub const BYTEA: Oid = Oid(17);
    pub const CHAR: Oid = Oid(18);
    pub const NAME: Oid = Oid(19);
    pub const INT8: Oid = Oid(20);
    pub const INT2: Oid = Oid(21);
    pub const INT4: Oid = Oid(23);
    pub const TEXT: Oid = Oid(25);
    pub const OID_TYPE: Oid = Oid(26);
    pub const JSON: Oid = Oid(114);
    pub const FLOAT4: Oid = Oid(700);
    pub const FLOAT8: Oid = Oid(701);
    pub const UNKNOWN: Oid = Oid(705);
    pub const BPCHAR: Oid = Oid(1042);
    pub const VARCHAR: Oid = Oid(1043);
    pub const DATE: Oid = Oid(1082);
    pub const TIME: Oid = Oid(1083);
    pub const TIMESTAMP: Oid = Oid(1114);
    pub const TIMESTAMPTZ: Oid = Oid(1184);
    pub const INTERVAL: Oid = Oid(1186);
    pub const NUMERIC: Oid = Oid(1700);
    pub const UUID: Oid = Oid(2950);
    pub const JSONB: Oid = Oid(3802);

    #[inline]
    pub fn from_i32(oid: i32) -> Self {
        Oid(oid)
    }

    #[inline]
    pub fn as_i32(self) -> i32 {
        self.0
    }

    pub fn is_text_like(self) -> bool {
        matches!(
            self,
            Oid::TEXT | Oid::VARCHAR | Oid::BPCHAR | Oid::CHAR | Oid::NAME | Oid::UNKNOWN
        )
    }

    pub fn is_integer(self) -> bool {
        matches!(self, Oid::INT2 | Oid::INT4 | Oid::INT8 | Oid::OID_TYPE)
    }

    pub fn is_float(self) -> bool {
        matches!(self, Oid::FLOAT4 | Oid::FLOAT8)
    }

    /// Whether result columns of this type are requested in binary format.
    /// Everything else comes back as text.
    pub fn has_binary_decoder(self) -> bool {
        self.is_text_like()
            || self.is_integer()
            || self.is_float()
            || matches!(
                self,
                Oid::BOOL
                    | Oid::BYTEA
                    | Oid::UUID
                    | Oid::DATE
                    | Oid::TIME
                    | Oid::TIMESTAMP
                    | Oid::TIMESTAMPTZ
                    | Oid::JSON
                    | Oid::JSONB
            )
    }

    /// Human-readable type name for error messages.
    pub fn name(self) -> String {
        let known = match self {
            Oid::BOOL => "bool",
            Oid::BYTEA => "bytea",
            Oid::CHAR => "char",
            Oid::NAME => "name",
            Oid::INT8 => "int8",
            Oid::INT2 => "int2",
            Oid::INT4 => "int4",
            Oid::TEXT => "text",
            Oid::OID_TYPE => "oid",
            Oid::JSON => "json",
            Oid::FLOAT4 => "float4",
            Oid::FLOAT8 => "float8",
            Oid::UNKNOWN => "unknown",
            Oid::BPCHAR => "bpchar",
            Oid::VARCHAR => "varchar",
            Oid::DATE => "date",
            Oid::TIME => "time",
            Oid::TIMESTAMP => "timestamp",
            Oid::TIMESTAMPTZ => "timestamptz",
            Oid::INTERVAL => "interval",
            Oid::NUMERIC => "numeric",
            Oid::UUID => "uuid",
            Oid::JSONB => "jsonb",
            Oid(n) => return format!("oid({})", n),
        };
        known.to_string()
    }
}

// ============================================================================
// Epoch helpers
// ============================================================================

fn pg_epoch_date() -> NaiveDate {
    NaiveDate::from_ymd_opt(2000, 1, 1).unwrap_or_default()
}

fn pg_epoch() -> NaiveDateTime {
    pg_epoch_date().and_time(NaiveTime::MIN)
}

/// Timestamps `infinity` and `-infinity` on the wire.
pub const TIMESTAMP_INFINITY: i64 = i64::MAX;
pub const TIMESTAMP_NEG_INFINITY: i64 = i64::MIN;
/// Dates `infinity` and `-infinity` on the wire.
pub const DATE_INFINITY: i32 = i32::MAX;
pub const DATE_NEG_INFINITY: i32 = i32::MIN;

/// Microseconds since 2000-01-01 00:00:00.
pub fn timestamp_to_micros(ts: NaiveDateTime) -> i64 {
    (ts - pg_epoch()).num_microseconds().unwrap_or(i64::MAX)
}

/// `None` for `infinity` / `-infinity` and anything else chrono can't hold.
pub fn micros_to_timestamp(micros: i64) -> Option<NaiveDateTime> {
    pg_epoch().checked_add_signed(Duration::microseconds(micros))
}

fn timestamp_text(micros: i64, format: &str) -> String {
    match micros {
        TIMESTAMP_INFINITY => "infinity".to_string(),
        TIMESTAMP_NEG_INFINITY => "-infinity".to_string(),
        _ => micros_to_timestamp(micros)
            .map(|ts| ts.format(format).to_string())
            .unwrap_or_else(|| format!("timestamp({})", micros)),
    }
}

pub fn date_to_days(date: NaiveDate) -> i32 {
    (date - pg_epoch_date()).num_days() as i32
}

/// `None` for `infinity` / `-infinity` and anything else chrono can't hold.
pub fn days_to_date(days: i32) -> Option<NaiveDate> {
    pg_epoch_date().checked_add_signed(Duration::days(days as i64))
}

pub fn time_to_micros(time: NaiveTime) -> i64 {
    (time - NaiveTime::MIN).num_microseconds().unwrap_or(0)
}

pub fn micros_to_time(micros: i64) -> NaiveTime {
    NaiveTime::MIN + Duration::microseconds(micros)
}

// ============================================================================
// PostgreSQL Values
// ============================================================================

/// A PostgreSQL value with type information.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    /// Arbitrary precision, kept in its text form.
    Numeric(String),
    Text(String),
    Bytea(Vec<u8>),
    Uuid([u8; 16]),
    /// Microseconds since 2000-01-01, no zone.
    Timestamp(i64),
    /// Microseconds since 2000-01-01 UTC.
    TimestampTz(i64),
    /// Days since 2000-01-01.
    Date(i32),
    /// Microseconds since midnight.
    Time(i64),
    Json(String),
    /// Types without a codec, in whatever format the server sent.
    Raw { oid: Oid, data: Vec<u8> },
}

impl PgValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, PgValue::Null)
    }

    /// Type sent in Parse and used to choose a parameter format.
    pub fn type_oid(&self) -> Oid {
        match self {
            PgValue::Null => Oid::UNSPECIFIED,
            PgValue::Bool(_) => Oid::BOOL,
            PgValue::Int2(_) => Oid::INT2,
            PgValue::Int4(_) => Oid::INT4,
            PgValue::Int8(_) => Oid::INT8,
            PgValue::Float4(_) => Oid::FLOAT4,
            PgValue::Float8(_) => Oid::FLOAT8,
            PgValue::Numeric(_) => Oid::NUMERIC,
            PgValue::Text(_) => Oid::TEXT,
            PgValue::Bytea(_) => Oid::BYTEA,
            PgValue::Uuid(_) => Oid::UUID,
            PgValue::Timestamp(_) => Oid::TIMESTAMP,
            PgValue::TimestampTz(_) => Oid::TIMESTAMPTZ,
            PgValue::Date(_) => Oid::DATE,
            PgValue::Time(_) => Oid::TIME,
            PgValue::Json(_) => Oid::JSONB,
            PgValue::Raw { oid, .. } => *oid,
        }
    }

    /// Whether [`encode_binary`](Self::encode_binary) produces the server's
    /// binary representation for this value.
    pub fn has_binary_encoding(&self) -> bool {
        !matches!(
            self,
            PgValue::Null | PgValue::Numeric(_) | PgValue::Raw { .. }
        )
    }

    /// Encode this value to binary format.
    pub fn encode_binary(&self) -> Vec<u8> {
        match self {
            PgValue::Null => vec![],
            PgValue::Bool(v) => vec![*v as u8],
            PgValue::Int2(v) => v.to_be_bytes().to_vec(),
            PgValue::Int4(v) => v.to_be_bytes().to_vec(),
            PgValue::Int8(v) => v.to_be_bytes().to_vec(),
            PgValue::Float4(v) => v.to_be_bytes().to_vec(),
            PgValue::Float8(v) => v.to_be_bytes().to_vec(),
            PgValue::Numeric(v) => v.as_bytes().to_vec(),
            PgValue::Text(v) => v.as_bytes().to_vec(),
            PgValue::Bytea(v) => v.clone(),
            PgValue::Uuid(v) => v.to_vec(),
            PgValue::Timestamp(v) | PgValue::TimestampTz(v) | PgValue::Time(v) => {
                v.to_be_bytes().to_vec()
            }
            PgValue::Date(v) => v.to_be_bytes().to_vec(),
            PgValue::Json(v) => {
                // jsonb binary format: version byte, then the text
                let mut out = Vec::with_capacity(v.len() + 1);
                out.push(1);
                out.extend_from_slice(v.as_bytes());
                out
            }
            PgValue::Raw { data, .. } => data.clone(),
        }
    }

    /// Encode this value in the server's text input syntax.
    pub fn encode_text(&self) -> String {
        match self {
            PgValue::Null => String::new(),
            PgValue::Bool(v) => if *v { "t" } else { "f" }.to_string(),
            PgValue::Int2(v) => v.to_string(),
            PgValue::Int4(v) => v.to_string(),
            PgValue::Int8(v) => v.to_string(),
            PgValue::Float4(v) => float_text(*v as f64),
            PgValue::Float8(v) => float_text(*v),
            PgValue::Numeric(v) | PgValue::Text(v) | PgValue::Json(v) => v.clone(),
            PgValue::Bytea(v) => {
                let mut s = String::with_capacity(2 + v.len() * 2);
                s.push_str("\\x");
                for b in v {
                    s.push_str(&format!("{:02x}", b));
                }
                s
            }
            PgValue::Uuid(v) => uuid::Uuid::from_bytes(*v).to_string(),
            PgValue::Timestamp(v) => timestamp_text(*v, "%Y-%m-%d %H:%M:%S%.f"),
            PgValue::TimestampTz(v) => timestamp_text(*v, "%Y-%m-%d %H:%M:%S%.f+00"),
            PgValue::Date(v) => match *v {
                DATE_INFINITY => "infinity".to_string(),
                DATE_NEG_INFINITY => "-infinity".to_string(),
                days => days_to_date(days)
                    .map(|d| d.format("%Y-%m-%d").to_string())
                    .unwrap_or_else(|| format!("date({})", days)),
            },
            PgValue::Time(v) => micros_to_time(*v).format("%H:%M:%S%.f").to_string(),
            PgValue::Raw { data, .. } => String::from_utf8_lossy(data).into_owned(),
        }
    }

    /// Decode a value from binary format.
    pub fn decode_binary(oid: Oid, data: &[u8]) -> Result<Self> {
        match oid {
            Oid::BOOL => match data {
                [b] => Ok(PgValue::Bool(*b != 0)),
                _ => Err(bad_length("BOOL", data)),
            },
            Oid::INT2 => Ok(PgValue::Int2(i16::from_be_bytes(fixed(data, "INT2")?))),
            Oid::INT4 => Ok(PgValue::Int4(i32::from_be_bytes(fixed(data, "INT4")?))),
            Oid::OID_TYPE => Ok(PgValue::Int8(
                u32::from_be_bytes(fixed(data, "OID")?) as i64,
            )),
            Oid::INT8 => Ok(PgValue::Int8(i64::from_be_bytes(fixed(data, "INT8")?))),
            Oid::FLOAT4 => Ok(PgValue::Float4(f32::from_be_bytes(fixed(data, "FLOAT4")?))),
            Oid::FLOAT8 => Ok(PgValue::Float8(f64::from_be_bytes(fixed(data, "FLOAT8")?))),
            _ if oid.is_text_like() => Ok(PgValue::Text(utf8(data, "TEXT")?)),
            Oid::BYTEA => Ok(PgValue::Bytea(data.to_vec())),
            Oid::UUID => Ok(PgValue::Uuid(fixed(data, "UUID")?)),
            Oid::TIMESTAMP => Ok(PgValue::Timestamp(i64::from_be_bytes(fixed(
                data,
                "TIMESTAMP",
            )?))),
            Oid::TIMESTAMPTZ => Ok(PgValue::TimestampTz(i64::from_be_bytes(fixed(
                data,
                "TIMESTAMPTZ",
            )?))),
            Oid::DATE => Ok(PgValue::Date(i32::from_be_bytes(fixed(data, "DATE")?))),
            Oid::TIME => Ok(PgValue::Time(i64::from_be_bytes(fixed(data, "TIME")?))),
            Oid::JSON => Ok(PgValue::Json(utf8(data, "JSON")?)),
            Oid::JSONB => match data.split_first() {
                Some((1, rest)) => Ok(PgValue::Json(utf8(rest, "JSONB")?)),
                Some((v, _)) => Err(Error::Scan(format!("Unsupported JSONB version {}", v))),
                None => Err(bad_length("JSONB", data)),
            },
            _ => Ok(PgValue::Raw {
                oid,
                data: data.to_vec(),
            }),
        }
    }

    /// Decode from text format (simple query protocol and text columns).
    pub fn decode_text(oid: Oid, data: &[u8]) -> Result<Self> {
        let text = utf8(data, "text value")?;

        match oid {
            Oid::BOOL => match text.as_str() {
                "t" | "true" | "1" | "on" | "yes" => Ok(PgValue::Bool(true)),
                "f" | "false" | "0" | "off" | "no" => Ok(PgValue::Bool(false)),
                _ => Err(parse_error("BOOL", &text)),
            },
            Oid::INT2 => text
                .parse()
                .map(PgValue::Int2)
                .map_err(|_| parse_error("INT2", &text)),
            Oid::INT4 => text
                .parse()
                .map(PgValue::Int4)
                .map_err(|_| parse_error("INT4", &text)),
            Oid::INT8 | Oid::OID_TYPE => text
                .parse()
                .map(PgValue::Int8)
                .map_err(|_| parse_error("INT8", &text)),
            Oid::FLOAT4 => parse_float(&text)
                .map(|v| PgValue::Float4(v as f32))
                .ok_or_else(|| parse_error("FLOAT4", &text)),
            Oid::FLOAT8 => parse_float(&text)
                .map(PgValue::Float8)
                .ok_or_else(|| parse_error("FLOAT8", &text)),
            Oid::NUMERIC => Ok(PgValue::Numeric(text)),
            Oid::BYTEA => decode_bytea_hex(&text).map(PgValue::Bytea),
            Oid::UUID => uuid::Uuid::parse_str(&text)
                .map(|u| PgValue::Uuid(*u.as_bytes()))
                .map_err(|_| parse_error("UUID", &text)),
            Oid::TIMESTAMP => match text.as_str() {
                "infinity" => Ok(PgValue::Timestamp(TIMESTAMP_INFINITY)),
                "-infinity" => Ok(PgValue::Timestamp(TIMESTAMP_NEG_INFINITY)),
                _ => NaiveDateTime::parse_from_str(&text, "%Y-%m-%d %H:%M:%S%.f")
                    .map(|ts| PgValue::Timestamp(timestamp_to_micros(ts)))
                    .map_err(|_| parse_error("TIMESTAMP", &text)),
            },
            Oid::TIMESTAMPTZ => match text.as_str() {
                "infinity" => Ok(PgValue::TimestampTz(TIMESTAMP_INFINITY)),
                "-infinity" => Ok(PgValue::TimestampTz(TIMESTAMP_NEG_INFINITY)),
                _ => parse_timestamptz(&text)
                    .map(|ts| PgValue::TimestampTz(timestamp_to_micros(ts.naive_utc())))
                    .ok_or_else(|| parse_error("TIMESTAMPTZ", &text)),
            },
            Oid::DATE => match text.as_str() {
                "infinity" => Ok(PgValue::Date(DATE_INFINITY)),
                "-infinity" => Ok(PgValue::Date(DATE_NEG_INFINITY)),
                _ => NaiveDate::parse_from_str(&text, "%Y-%m-%d")
                    .map(|d| PgValue::Date(date_to_days(d)))
                    .map_err(|_| parse_error("DATE", &text)),
            },
            Oid::TIME => NaiveTime::parse_from_str(&text, "%H:%M:%S%.f")
                .map(|t| PgValue::Time(time_to_micros(t)))
                .map_err(|_| parse_error("TIME", &text)),
            Oid::JSON | Oid::JSONB => Ok(PgValue::Json(text)),
            _ => Ok(PgValue::Text(text)),
        }
    }

    /// JSON rendering used by [`Row::to_json`](crate::scan::Row::to_json).
    pub fn to_json(&self) -> serde_json::Value {
        use serde_json::Value;
        match self {
            PgValue::Null => Value::Null,
            PgValue::Bool(v) => Value::Bool(*v),
            PgValue::Int2(v) => Value::from(*v),
            PgValue::Int4(v) => Value::from(*v),
            PgValue::Int8(v) => Value::from(*v),
            PgValue::Float4(v) => Value::from(*v as f64),
            PgValue::Float8(v) => Value::from(*v),
            PgValue::Json(v) => {
                serde_json::from_str(v).unwrap_or_else(|_| Value::String(v.clone()))
            }
            other => Value::String(other.encode_text()),
        }
    }
}

fn float_text(v: f64) -> String {
    if v.is_nan() {
        "NaN".to_string()
    } else if v.is_infinite() {
        if v > 0.0 { "Infinity" } else { "-Infinity" }.to_string()
    } else {
        v.to_string()
    }
}

fn parse_float(text: &str) -> Option<f64> {
    match text {
        "NaN" => Some(f64::NAN),
        "Infinity" => Some(f64::INFINITY),
        "-Infinity" => Some(f64::NEG_INFINITY),
        _ => text.parse().ok(),
    }
}

fn parse_timestamptz(text: &str) -> Option<DateTime<Utc>> {
    // Server renders offsets as "+00" or "+05:30"
    let normalized = match text.rfind(['+', '-']) {
        Some(pos) if pos > 10 && text.len() - pos == 3 => format!("{}:00", text),
        _ => text.to_string(),
    };
    DateTime::parse_from_str(&normalized, "%Y-%m-%d %H:%M:%S%.f%:z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn decode_bytea_hex(text: &str) -> Result<Vec<u8>> {
    let hex = text
        .strip_prefix("\\x")
        .ok_or_else(|| parse_error("BYTEA", text))?;
    if hex.len() % 2 != 0 {
        return Err(parse_error("BYTEA", text));
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&hex[i..i + 2], 16).map_err(|_| parse_error("BYTEA", text)))
        .collect()
}

fn fixed<const N: usize>(data: &[u8], what: &str) -> Result<[u8; N]> {
    data.try_into().map_err(|_| bad_length(what, data))
}

fn utf8(data: &[u8], what: &str) -> Result<String> {
    std::str::from_utf8(data)
        .map(str::to_owned)
        .map_err(|e| Error::Scan(format!("Invalid UTF-8 in {}: {}", what, e)))
}

fn bad_length(what: &str, data: &[u8]) -> Error {
    Error::Protocol(format!("Invalid {} length: {}", what, data.len()))
}

fn parse_error(what: &str, text: &str) -> Error {
    Error::Scan(format!("Invalid {}: {:?}", what, text))
}

// ============================================================================
// Conversions into PgValue
// ============================================================================

macro_rules! impl_from_value {
    ($($t:ty => $variant:ident),* $(,)?) => {
        $(
            impl From<$t> for PgValue {
                fn from(v: $t) -> Self {
                    PgValue::$variant(v.into())
                }
            }
        )*
    };
}

impl_from_value! {
    bool => Bool,
    i16 => Int2,
    i32 => Int4,
    i64 => Int8,
    f32 => Float4,
    f64 => Float8,
    String => Text,
    &str => Text,
    Vec<u8> => Bytea,
    &[u8] => Bytea,
}

impl From<uuid::Uuid> for PgValue {
    fn from(v: uuid::Uuid) -> Self {
        PgValue::Uuid(*v.as_bytes())
    }
}

impl From<NaiveDateTime> for PgValue {
    fn from(v: NaiveDateTime) -> Self {
        PgValue::Timestamp(timestamp_to_micros(v))
    }
}

impl From<DateTime<Utc>> for PgValue {
    fn from(v: DateTime<Utc>) -> Self {
        PgValue::TimestampTz(timestamp_to_micros(v.naive_utc()))
    }
}

impl From<NaiveDate> for PgValue {
    fn from(v: NaiveDate) -> Self {
        PgValue::Date(date_to_days(v))
    }
}

impl From<NaiveTime> for PgValue {
    fn from(v: NaiveTime) -> Self {
        PgValue::Time(time_to_micros(v))
    }
}

impl From<serde_json::Value> for PgValue {
    fn from(v: serde_json::Value) -> Self {
        PgValue::Json(v.to_string())
    }
}

impl<T: Into<PgValue>> From<Option<T>> for PgValue {
    fn from(v: Option<T>) -> Self {
        v.map_or(PgValue::Null, Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_classification() {
        assert!(Oid::TEXT.is_text_like());
        assert!(Oid::VARCHAR.is_text_like());
        assert!(!Oid::INT4.is_text_like());

        assert!(Oid::INT4.is_integer());
        assert!(Oid::INT8.is_integer());
        assert!(!Oid::FLOAT8.is_integer());

        assert!(Oid::UUID.has_binary_decoder());
        assert!(!Oid::NUMERIC.has_binary_decoder());
        assert!(!Oid::INTERVAL.has_binary_decoder());
        assert_eq!(Oid(99999).name(), "oid(99999)");
    }

    #[test]
    fn test_null_is_untyped() {
        assert_eq!(PgValue::Null.type_oid(), Oid::UNSPECIFIED);
        assert_eq!(PgValue::from(None::<i32>), PgValue::Null);
        assert_eq!(PgValue::from(Some(3i32)), PgValue::Int4(3));
    }

    #[test]
    fn test_binary_length_checks() {
        assert!(PgValue::decode_binary(Oid::INT4, &[0, 1]).is_err());
        assert!(PgValue::decode_binary(Oid::BOOL, &[]).is_err());
        assert_eq!(
            PgValue::decode_binary(Oid::INT8, &42i64.to_be_bytes()).unwrap(),
            PgValue::Int8(42)
        );
    }

    #[test]
    fn test_jsonb_version_byte() {
        let v = PgValue::Json(r#"{"a":1}"#.to_string());
        let encoded = v.encode_binary();
        assert_eq!(encoded[0], 1);
        assert_eq!(PgValue::decode_binary(Oid::JSONB, &encoded).unwrap(), v);
        assert_eq!(PgValue::decode_binary(Oid::JSON, &encoded[1..]).unwrap(), v);
    }

    #[test]
    fn test_text_decoding() {
        assert_eq!(
            PgValue::decode_text(Oid::BOOL, b"t").unwrap(),
            PgValue::Bool(true)
        );
        assert_eq!(
            PgValue::decode_text(Oid::INT8, b"-17").unwrap(),
            PgValue::Int8(-17)
        );
        assert_eq!(
            PgValue::decode_text(Oid::NUMERIC, b"3.14159").unwrap(),
            PgValue::Numeric("3.14159".to_string())
        );
        assert_eq!(
            PgValue::decode_text(Oid::BYTEA, b"\\xdeadbeef").unwrap(),
            PgValue::Bytea(vec![0xde, 0xad, 0xbe, 0xef])
        );
        assert!(PgValue::decode_text(Oid::INT4, b"abc").is_err());
        assert!(matches!(
            PgValue::decode_text(Oid::FLOAT8, b"Infinity").unwrap(),
            PgValue::Float8(v) if v.is_infinite()
        ));
    }

    #[test]
    fn test_datetime_text_forms() {
        let ts = NaiveDate::from_ymd_opt(2024, 3, 5)
            .unwrap()
            .and_hms_micro_opt(12, 30, 1, 500)
            .unwrap();
        let v = PgValue::from(ts);
        assert_eq!(v.encode_text(), "2024-03-05 12:30:01.000500");
        assert_eq!(
            PgValue::decode_text(Oid::TIMESTAMP, v.encode_text().as_bytes()).unwrap(),
            v
        );

        let tz = PgValue::decode_text(Oid::TIMESTAMPTZ, b"2024-03-05 14:30:01.0005+02").unwrap();
        assert_eq!(tz, PgValue::TimestampTz(timestamp_to_micros(ts)));

        assert_eq!(
            PgValue::decode_text(Oid::DATE, b"2000-01-02").unwrap(),
            PgValue::Date(1)
        );
        assert_eq!(PgValue::Date(-1).encode_text(), "1999-12-31");
    }

    #[test]
    fn test_infinite_dates_and_timestamps() {
        let ts = PgValue::decode_binary(Oid::TIMESTAMP, &i64::MAX.to_be_bytes()).unwrap();
        assert_eq!(ts.encode_text(), "infinity");
        let tz = PgValue::decode_binary(Oid::TIMESTAMPTZ, &i64::MIN.to_be_bytes()).unwrap();
        assert_eq!(tz.encode_text(), "-infinity");
        let date = PgValue::decode_binary(Oid::DATE, &i32::MAX.to_be_bytes()).unwrap();
        assert_eq!(date.encode_text(), "infinity");
        assert_eq!(date.to_json(), serde_json::json!("infinity"));

        assert_eq!(
            PgValue::decode_text(Oid::TIMESTAMP, b"infinity").unwrap(),
            PgValue::Timestamp(TIMESTAMP_INFINITY)
        );
        assert_eq!(
            PgValue::decode_text(Oid::TIMESTAMPTZ, b"-infinity").unwrap(),
            PgValue::TimestampTz(TIMESTAMP_NEG_INFINITY)
        );
        assert_eq!(
            PgValue::decode_text(Oid::DATE, b"-infinity").unwrap(),
            PgValue::Date(DATE_NEG_INFINITY)
        );

        assert!(micros_to_timestamp(TIMESTAMP_INFINITY).is_none());
        assert!(days_to_date(DATE_INFINITY).is_none());
        assert_eq!(days_to_date(1), NaiveDate::from_ymd_opt(2000, 1, 2));
    }

    #[test]
    fn test_text_encoding() {
        assert_eq!(PgValue::Bool(false).encode_text(), "f");
        assert_eq!(PgValue::Bytea(vec![0, 255]).encode_text(), "\\x00ff");
        assert_eq!(PgValue::Float8(f64::NEG_INFINITY).encode_text(), "-Infinity");
        let id = uuid::Uuid::new_v4();
        assert_eq!(PgValue::from(id).encode_text(), id.to_string());
    }

    #[test]
    fn test_to_json() {
        assert_eq!(PgValue::Int4(5).to_json(), serde_json::json!(5));
        assert_eq!(
            PgValue::Json(r#"{"k":[1,2]}"#.to_string()).to_json(),
            serde_json::json!({"k": [1, 2]})
        );
        assert_eq!(PgValue::Null.to_json(), serde_json::Value::Null);
    }
}
