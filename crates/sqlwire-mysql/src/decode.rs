//! Column value decoding.
//!
//! [`ColumnDecoder`] turns the bytes of one column into a caller-chosen
//! representation. It parses the wire layout (binary or text protocol) and
//! hands primitive parts to a [`ValueFactory`], which builds the final value.
//!
//! Null handling comes first: absent bytes, or zero-length bytes for a
//! nullable column, always produce `from_null` regardless of the declared type.

use std::fmt;

use sqlwire_core::error::{DecodeError, DecodeErrorKind};
use sqlwire_core::{Error, Result, Value};

use crate::charset::decode_text;
use crate::types::{ColumnDefinition, FieldType};

/// Calendar date as sent by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalDate {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl InternalDate {
    pub const fn is_zero(&self) -> bool {
        self.year == 0 && self.month == 0 && self.day == 0
    }

    /// Days since 1970-01-01 in the proleptic Gregorian calendar.
    pub fn days_since_epoch(&self) -> i32 {
        let (m, d) = (u32::from(self.month), u32::from(self.day));
        let y = i32::from(self.year) - i32::from(m <= 2);
        let era = if y >= 0 { y } else { y - 399 } / 400;
        #[allow(clippy::cast_sign_loss)]
        let yoe = (y - era * 400) as u32;
        let doy = (153 * ((m + 9) % 12) + 2) / 5 + d.saturating_sub(1);
        let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
        #[allow(clippy::cast_possible_wrap)]
        let doe = doe as i32;
        era * 146_097 + doe - 719_468
    }
}

impl fmt::Display for InternalDate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}-{:02}", self.year, self.month, self.day)
    }
}

/// TIME value: a signed duration, hours may exceed 23.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalTime {
    pub negative: bool,
    pub hours: u32,
    pub minutes: u8,
    pub seconds: u8,
    pub nanos: u32,
    /// Fractional digits to render
    pub scale: u8,
}

impl InternalTime {
    /// Signed duration in microseconds, `None` when it does not fit an `i64`.
    pub fn total_micros(&self) -> Option<i64> {
        let secs = i64::from(self.hours) * 3600 + i64::from(self.minutes) * 60 + i64::from(self.seconds);
        let micros = secs
            .checked_mul(1_000_000)?
            .checked_add(i64::from(self.nanos / 1000))?;
        Some(if self.negative { -micros } else { micros })
    }
}

impl fmt::Display for InternalTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.negative {
            f.write_str("-")?;
        }
        write!(f, "{:02}:{:02}:{:02}", self.hours, self.minutes, self.seconds)?;
        write_fraction(f, self.nanos, self.scale)
    }
}

/// DATETIME / TIMESTAMP value without a zone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct InternalTimestamp {
    pub date: InternalDate,
    pub hour: u8,
    pub minute: u8,
    pub second: u8,
    pub nanos: u32,
    pub scale: u8,
}

impl InternalTimestamp {
    pub const fn is_zero(&self) -> bool {
        self.date.is_zero()
    }

    /// Microseconds since 1970-01-01 00:00:00.
    pub fn micros_since_epoch(&self) -> i64 {
        let days = i64::from(self.date.days_since_epoch());
        let secs = days * 86_400
            + i64::from(self.hour) * 3600
            + i64::from(self.minute) * 60
            + i64::from(self.second);
        secs * 1_000_000 + i64::from(self.nanos / 1000)
    }
}

impl fmt::Display for InternalTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:02}:{:02}:{:02}",
            self.date, self.hour, self.minute, self.second
        )?;
        write_fraction(f, self.nanos, self.scale)
    }
}

fn write_fraction(f: &mut fmt::Formatter<'_>, nanos: u32, scale: u8) -> fmt::Result {
    let scale = u32::from(scale.min(9));
    if scale == 0 {
        return Ok(());
    }
    let digits = nanos / 10u32.pow(9 - scale);
    write!(f, ".{digits:0width$}", width = scale as usize)
}

/// What to do with `0000-00-00` dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ZeroDateBehavior {
    /// Fail with `DecodeError::ZeroDate`
    #[default]
    Exception,
    /// Treat the value as NULL
    ConvertToNull,
    /// Replace with `0001-01-01`
    Round,
}

impl ZeroDateBehavior {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "exception" => Some(Self::Exception),
            "converttonull" | "convert_to_null" => Some(Self::ConvertToNull),
            "round" => Some(Self::Round),
            _ => None,
        }
    }
}

/// Builds values of one target representation from decoded parts.
pub trait ValueFactory {
    type Output;

    fn from_null(&self) -> Result<Self::Output>;
    fn from_i64(&self, value: i64) -> Result<Self::Output>;
    fn from_u64(&self, value: u64) -> Result<Self::Output>;
    fn from_f64(&self, value: f64) -> Result<Self::Output>;

    fn from_f32(&self, value: f32) -> Result<Self::Output> {
        self.from_f64(f64::from(value))
    }

    /// Validated fixed-point text.
    fn from_decimal(&self, text: &str) -> Result<Self::Output>;
    fn from_date(&self, date: InternalDate) -> Result<Self::Output>;
    fn from_time(&self, time: InternalTime) -> Result<Self::Output>;
    fn from_timestamp(&self, ts: InternalTimestamp) -> Result<Self::Output>;

    /// Character or binary data; `field` carries the collation.
    fn from_bytes(&self, bytes: &[u8], field: &ColumnDefinition) -> Result<Self::Output>;

    /// BIT(n) value, big-endian.
    fn from_bit(&self, bytes: &[u8]) -> Result<Self::Output>;

    fn from_year(&self, year: u16) -> Result<Self::Output> {
        self.from_i64(i64::from(year))
    }

    /// Name used in conversion errors.
    fn target_type_name(&self) -> &'static str;
}

/// Produces driver-native [`Value`]s.
#[derive(Debug, Clone, Copy, Default)]
pub struct SqlValueFactory;

impl ValueFactory for SqlValueFactory {
    type Output = Value;

    fn from_null(&self) -> Result<Value> {
        Ok(Value::Null)
    }

    fn from_i64(&self, value: i64) -> Result<Value> {
        Ok(Value::BigInt(value))
    }

    fn from_u64(&self, value: u64) -> Result<Value> {
        Ok(Value::UBigInt(value))
    }

    fn from_f64(&self, value: f64) -> Result<Value> {
        Ok(Value::Double(value))
    }

    fn from_f32(&self, value: f32) -> Result<Value> {
        Ok(Value::Float(value))
    }

    fn from_decimal(&self, text: &str) -> Result<Value> {
        Ok(Value::Decimal(text.to_string()))
    }

    fn from_date(&self, date: InternalDate) -> Result<Value> {
        Ok(Value::Date(date.days_since_epoch()))
    }

    fn from_time(&self, time: InternalTime) -> Result<Value> {
        time.total_micros().map(Value::Time).ok_or_else(|| {
            DecodeError::new(
                DecodeErrorKind::OutOfRange,
                format!("TIME {time} does not fit in microseconds"),
            )
            .into()
        })
    }

    fn from_timestamp(&self, ts: InternalTimestamp) -> Result<Value> {
        Ok(Value::Timestamp(ts.micros_since_epoch()))
    }

    fn from_bytes(&self, bytes: &[u8], field: &ColumnDefinition) -> Result<Value> {
        if field.field_type()? == FieldType::Json {
            return serde_json::from_slice(bytes).map(Value::Json).map_err(|e| {
                DecodeError::new(DecodeErrorKind::Malformed, format!("invalid JSON: {e}")).into()
            });
        }
        if field.is_binary() {
            return Ok(Value::Bytes(bytes.to_vec()));
        }
        decode_text(bytes, field.charset).map(Value::Text)
    }

    fn from_bit(&self, bytes: &[u8]) -> Result<Value> {
        bit_to_u64(bytes).map(Value::UBigInt)
    }

    fn from_year(&self, year: u16) -> Result<Value> {
        #[allow(clippy::cast_possible_wrap)]
        Ok(Value::SmallInt(year as i16))
    }

    fn target_type_name(&self) -> &'static str {
        "Value"
    }
}

/// Renders every value as its SQL text form.
#[derive(Debug, Clone, Copy, Default)]
pub struct StringValueFactory;

impl ValueFactory for StringValueFactory {
    type Output = Option<String>;

    fn from_null(&self) -> Result<Option<String>> {
        Ok(None)
    }

    fn from_i64(&self, value: i64) -> Result<Option<String>> {
        Ok(Some(value.to_string()))
    }

    fn from_u64(&self, value: u64) -> Result<Option<String>> {
        Ok(Some(value.to_string()))
    }

    fn from_f64(&self, value: f64) -> Result<Option<String>> {
        Ok(Some(value.to_string()))
    }

    fn from_f32(&self, value: f32) -> Result<Option<String>> {
        Ok(Some(value.to_string()))
    }

    fn from_decimal(&self, text: &str) -> Result<Option<String>> {
        Ok(Some(text.to_string()))
    }

    fn from_date(&self, date: InternalDate) -> Result<Option<String>> {
        Ok(Some(date.to_string()))
    }

    fn from_time(&self, time: InternalTime) -> Result<Option<String>> {
        Ok(Some(time.to_string()))
    }

    fn from_timestamp(&self, ts: InternalTimestamp) -> Result<Option<String>> {
        Ok(Some(ts.to_string()))
    }

    fn from_bytes(&self, bytes: &[u8], field: &ColumnDefinition) -> Result<Option<String>> {
        decode_text(bytes, field.charset).map(Some)
    }

    fn from_bit(&self, bytes: &[u8]) -> Result<Option<String>> {
        bit_to_u64(bytes).map(|v| Some(v.to_string()))
    }

    fn target_type_name(&self) -> &'static str {
        "String"
    }
}

/// Converts numeric columns to `i64`, refusing values that do not fit.
#[derive(Debug, Clone, Copy, Default)]
pub struct I64ValueFactory;

impl I64ValueFactory {
    fn unsupported(&self, what: &str) -> Error {
        DecodeError::new(
            DecodeErrorKind::OutOfRange,
            format!("cannot convert {what} to {}", self.target_type_name()),
        )
        .into()
    }
}

impl ValueFactory for I64ValueFactory {
    type Output = Option<i64>;

    fn from_null(&self) -> Result<Option<i64>> {
        Ok(None)
    }

    fn from_i64(&self, value: i64) -> Result<Option<i64>> {
        Ok(Some(value))
    }

    fn from_u64(&self, value: u64) -> Result<Option<i64>> {
        i64::try_from(value)
            .map(Some)
            .map_err(|_| self.unsupported(&format!("unsigned value {value}")))
    }

    #[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
    fn from_f64(&self, value: f64) -> Result<Option<i64>> {
        if value.is_finite() && value >= i64::MIN as f64 && value < i64::MAX as f64 {
            Ok(Some(value.trunc() as i64))
        } else {
            Err(self.unsupported(&format!("floating value {value}")))
        }
    }

    fn from_decimal(&self, text: &str) -> Result<Option<i64>> {
        let integral = text.split('.').next().unwrap_or_default();
        let integral = match integral {
            "" | "-" | "+" => "0",
            other => other,
        };
        integral
            .parse::<i64>()
            .map(Some)
            .map_err(|_| self.unsupported(&format!("decimal {text}")))
    }

    fn from_date(&self, _date: InternalDate) -> Result<Option<i64>> {
        Err(self.unsupported("DATE"))
    }

    fn from_time(&self, _time: InternalTime) -> Result<Option<i64>> {
        Err(self.unsupported("TIME"))
    }

    fn from_timestamp(&self, _ts: InternalTimestamp) -> Result<Option<i64>> {
        Err(self.unsupported("TIMESTAMP"))
    }

    fn from_bytes(&self, bytes: &[u8], field: &ColumnDefinition) -> Result<Option<i64>> {
        let text = decode_text(bytes, field.charset)?;
        text.trim()
            .parse::<i64>()
            .map(Some)
            .map_err(|_| self.unsupported(&format!("string '{text}'")))
    }

    fn from_bit(&self, bytes: &[u8]) -> Result<Option<i64>> {
        self.from_u64(bit_to_u64(bytes)?)
    }

    fn target_type_name(&self) -> &'static str {
        "i64"
    }
}

fn bit_to_u64(bytes: &[u8]) -> Result<u64> {
    if bytes.len() > 8 {
        return Err(DecodeError::new(
            DecodeErrorKind::OutOfRange,
            format!("BIT value of {} bytes does not fit 64 bits", bytes.len()),
        )
        .into());
    }
    Ok(bytes.iter().fold(0u64, |acc, &b| (acc << 8) | u64::from(b)))
}

/// Decodes columns of one row, remembering whether the last value was NULL.
#[derive(Debug, Clone)]
pub struct ColumnDecoder {
    zero_date: ZeroDateBehavior,
    was_null: bool,
}

impl Default for ColumnDecoder {
    fn default() -> Self {
        Self::new(ZeroDateBehavior::default())
    }
}

impl ColumnDecoder {
    pub fn new(zero_date: ZeroDateBehavior) -> Self {
        Self {
            zero_date,
            was_null: false,
        }
    }

    /// Whether the last decoded value was NULL.
    pub fn was_null(&self) -> bool {
        self.was_null
    }

    pub fn zero_date_behavior(&self) -> ZeroDateBehavior {
        self.zero_date
    }

    /// Decode a binary protocol value.
    pub fn decode<F: ValueFactory>(
        &mut self,
        field: &ColumnDefinition,
        bytes: Option<&[u8]>,
        factory: &F,
    ) -> Result<F::Output> {
        self.was_null = false;
        let Some(bytes) = self.present(field, bytes) else {
            return self.null(factory);
        };
        let result = field
            .field_type()
            .and_then(|ty| self.decode_binary(ty, field, bytes, factory));
        result.map_err(|e| in_column(e, field))
    }

    /// Decode a text protocol value.
    pub fn decode_text<F: ValueFactory>(
        &mut self,
        field: &ColumnDefinition,
        bytes: Option<&[u8]>,
        factory: &F,
    ) -> Result<F::Output> {
        self.was_null = false;
        let Some(bytes) = self.present(field, bytes) else {
            return self.null(factory);
        };
        let result = field
            .field_type()
            .and_then(|ty| self.decode_textual(ty, field, bytes, factory));
        result.map_err(|e| in_column(e, field))
    }

    fn present<'b>(&self, field: &ColumnDefinition, bytes: Option<&'b [u8]>) -> Option<&'b [u8]> {
        bytes.filter(|b| !(b.is_empty() && field.is_nullable()))
    }

    fn null<F: ValueFactory>(&mut self, factory: &F) -> Result<F::Output> {
        self.was_null = true;
        factory.from_null()
    }

    fn decode_binary<F: ValueFactory>(
        &mut self,
        ty: FieldType,
        field: &ColumnDefinition,
        bytes: &[u8],
        factory: &F,
    ) -> Result<F::Output> {
        let unsigned = field.is_unsigned();
        match ty {
            FieldType::Null => self.null(factory),
            FieldType::Tiny => {
                let [b] = fixed::<1>(bytes, ty)?;
                if unsigned {
                    factory.from_i64(i64::from(b))
                } else {
                    factory.from_i64(i64::from(i8::from_le_bytes([b])))
                }
            }
            FieldType::Short => {
                let raw = fixed::<2>(bytes, ty)?;
                if unsigned {
                    factory.from_i64(i64::from(u16::from_le_bytes(raw)))
                } else {
                    factory.from_i64(i64::from(i16::from_le_bytes(raw)))
                }
            }
            FieldType::Year => factory.from_year(u16::from_le_bytes(fixed::<2>(bytes, ty)?)),
            FieldType::Long | FieldType::Int24 => {
                let raw = fixed::<4>(bytes, ty)?;
                if unsigned {
                    factory.from_i64(i64::from(u32::from_le_bytes(raw)))
                } else {
                    factory.from_i64(i64::from(i32::from_le_bytes(raw)))
                }
            }
            FieldType::LongLong => {
                let raw = fixed::<8>(bytes, ty)?;
                if unsigned {
                    factory.from_u64(u64::from_le_bytes(raw))
                } else {
                    factory.from_i64(i64::from_le_bytes(raw))
                }
            }
            FieldType::Float => factory.from_f32(f32::from_le_bytes(fixed::<4>(bytes, ty)?)),
            FieldType::Double => factory.from_f64(f64::from_le_bytes(fixed::<8>(bytes, ty)?)),
            FieldType::Decimal | FieldType::NewDecimal => factory.from_decimal(decimal_text(bytes)?),
            FieldType::Date | FieldType::NewDate => {
                let date = binary_date(bytes)?;
                self.date(date, factory)
            }
            FieldType::Time | FieldType::Time2 => {
                let time = binary_time(bytes, temporal_scale(field))?;
                factory.from_time(time)
            }
            FieldType::DateTime
            | FieldType::DateTime2
            | FieldType::Timestamp
            | FieldType::Timestamp2 => {
                let ts = binary_timestamp(bytes, temporal_scale(field))?;
                self.timestamp(ts, factory)
            }
            FieldType::Bit => factory.from_bit(bytes),
            FieldType::Json
            | FieldType::VarChar
            | FieldType::VarString
            | FieldType::String
            | FieldType::Enum
            | FieldType::Set
            | FieldType::TinyBlob
            | FieldType::MediumBlob
            | FieldType::LongBlob
            | FieldType::Blob
            | FieldType::Geometry => factory.from_bytes(bytes, field),
        }
    }

    fn decode_textual<F: ValueFactory>(
        &mut self,
        ty: FieldType,
        field: &ColumnDefinition,
        bytes: &[u8],
        factory: &F,
    ) -> Result<F::Output> {
        match ty {
            FieldType::Null => self.null(factory),
            FieldType::Tiny
            | FieldType::Short
            | FieldType::Long
            | FieldType::Int24
            | FieldType::LongLong => {
                let text = ascii(bytes, ty)?;
                if field.is_unsigned() {
                    let value: u64 = parse(text, ty)?;
                    match i64::try_from(value) {
                        Ok(v) if ty != FieldType::LongLong => factory.from_i64(v),
                        _ => factory.from_u64(value),
                    }
                } else {
                    factory.from_i64(parse(text, ty)?)
                }
            }
            FieldType::Year => factory.from_year(parse(ascii(bytes, ty)?, ty)?),
            FieldType::Float => factory.from_f32(parse(ascii(bytes, ty)?, ty)?),
            FieldType::Double => factory.from_f64(parse(ascii(bytes, ty)?, ty)?),
            FieldType::Decimal | FieldType::NewDecimal => factory.from_decimal(decimal_text(bytes)?),
            FieldType::Date | FieldType::NewDate => {
                let date = text_date(ascii(bytes, ty)?)?;
                self.date(date, factory)
            }
            FieldType::Time | FieldType::Time2 => {
                let time = text_time(ascii(bytes, ty)?, temporal_scale(field))?;
                factory.from_time(time)
            }
            FieldType::DateTime
            | FieldType::DateTime2
            | FieldType::Timestamp
            | FieldType::Timestamp2 => {
                let ts = text_timestamp(ascii(bytes, ty)?, temporal_scale(field))?;
                self.timestamp(ts, factory)
            }
            FieldType::Bit => factory.from_bit(bytes),
            FieldType::Json
            | FieldType::VarChar
            | FieldType::VarString
            | FieldType::String
            | FieldType::Enum
            | FieldType::Set
            | FieldType::TinyBlob
            | FieldType::MediumBlob
            | FieldType::LongBlob
            | FieldType::Blob
            | FieldType::Geometry => factory.from_bytes(bytes, field),
        }
    }

    fn date<F: ValueFactory>(&mut self, date: InternalDate, factory: &F) -> Result<F::Output> {
        if !date.is_zero() {
            return factory.from_date(date);
        }
        match self.zero_date {
            ZeroDateBehavior::Exception => Err(zero_date_error()),
            ZeroDateBehavior::ConvertToNull => self.null(factory),
            ZeroDateBehavior::Round => factory.from_date(ROUNDED_DATE),
        }
    }

    fn timestamp<F: ValueFactory>(&mut self, ts: InternalTimestamp, factory: &F) -> Result<F::Output> {
        if !ts.is_zero() {
            return factory.from_timestamp(ts);
        }
        match self.zero_date {
            ZeroDateBehavior::Exception => Err(zero_date_error()),
            ZeroDateBehavior::ConvertToNull => self.null(factory),
            ZeroDateBehavior::Round => factory.from_timestamp(InternalTimestamp {
                date: ROUNDED_DATE,
                scale: ts.scale,
                ..InternalTimestamp::default()
            }),
        }
    }
}

const ROUNDED_DATE: InternalDate = InternalDate {
    year: 1,
    month: 1,
    day: 1,
};

fn zero_date_error() -> Error {
    DecodeError::new(
        DecodeErrorKind::ZeroDate,
        "zero date value cannot be represented",
    )
    .into()
}

fn in_column(err: Error, field: &ColumnDefinition) -> Error {
    match err {
        Error::Decode(mut e) if e.column.is_none() => {
            e.column = Some(field.name.clone());
            Error::Decode(e)
        }
        other => other,
    }
}

fn malformed(ty: FieldType, detail: impl fmt::Display) -> Error {
    DecodeError::new(
        DecodeErrorKind::Malformed,
        format!("malformed {} value: {detail}", ty.name()),
    )
    .into()
}

fn fixed<const N: usize>(bytes: &[u8], ty: FieldType) -> Result<[u8; N]> {
    <[u8; N]>::try_from(bytes)
        .ok()
        .ok_or_else(|| malformed(ty, format_args!("expected {N} bytes, got {}", bytes.len())))
}

fn ascii(bytes: &[u8], ty: FieldType) -> Result<&str> {
    std::str::from_utf8(bytes)
        .map(str::trim)
        .map_err(|_| malformed(ty, "not ASCII text"))
}

fn parse<T: std::str::FromStr>(text: &str, ty: FieldType) -> Result<T> {
    text.parse().map_err(|_| malformed(ty, format_args!("'{text}'")))
}

/// Fractional-seconds precision of a temporal column, capped at 6.
fn temporal_scale(field: &ColumnDefinition) -> u8 {
    field.decimals.min(6)
}

/// Drop digits beyond `scale` from a nanosecond fraction.
fn truncate_nanos(nanos: u32, scale: u8) -> u32 {
    let div = 10u32.pow(9 - u32::from(scale.min(9)));
    nanos - nanos % div
}

/// Check fixed-point text: optional sign, digits, optional fraction.
pub fn is_valid_decimal(text: &str) -> bool {
    let body = text.strip_prefix(['-', '+']).unwrap_or(text);
    let (int, frac) = match body.split_once('.') {
        Some((int, frac)) => (int, Some(frac)),
        None => (body, None),
    };
    let digits = |s: &str| s.bytes().all(|b| b.is_ascii_digit());
    let has_digit = !int.is_empty() || frac.is_some_and(|f| !f.is_empty());
    has_digit && digits(int) && frac.is_none_or(digits)
}

fn decimal_text(bytes: &[u8]) -> Result<&str> {
    let text = std::str::from_utf8(bytes).ok().map(str::trim);
    match text {
        Some(text) if is_valid_decimal(text) => Ok(text),
        _ => Err(DecodeError::new(
            DecodeErrorKind::MalformedDecimal,
            format!("'{}' is not a fixed-point number", String::from_utf8_lossy(bytes)),
        )
        .into()),
    }
}

fn binary_date(bytes: &[u8]) -> Result<InternalDate> {
    match bytes.len() {
        0 => Ok(InternalDate::default()),
        4 | 7 | 11 => Ok(InternalDate {
            year: u16::from_le_bytes([bytes[0], bytes[1]]),
            month: bytes[2],
            day: bytes[3],
        }),
        n => Err(malformed(FieldType::Date, format_args!("unexpected length {n}"))),
    }
}

fn binary_time(bytes: &[u8], scale: u8) -> Result<InternalTime> {
    match bytes.len() {
        0 => Ok(InternalTime {
            scale,
            ..InternalTime::default()
        }),
        8 | 12 => {
            let days = u32::from_le_bytes([bytes[1], bytes[2], bytes[3], bytes[4]]);
            let hours = days
                .checked_mul(24)
                .and_then(|h| h.checked_add(u32::from(bytes[5])))
                .ok_or_else(|| {
                    malformed(FieldType::Time, format_args!("{days} days overflows hours"))
                })?;
            let micros = if bytes.len() == 12 {
                micros_field(&bytes[8..12], FieldType::Time)?
            } else {
                0
            };
            Ok(InternalTime {
                negative: bytes[0] == 1,
                hours,
                minutes: bytes[6],
                seconds: bytes[7],
                nanos: truncate_nanos(micros * 1000, scale),
                scale,
            })
        }
        n => Err(malformed(FieldType::Time, format_args!("unexpected length {n}"))),
    }
}

fn binary_timestamp(bytes: &[u8], scale: u8) -> Result<InternalTimestamp> {
    let mut ts = InternalTimestamp {
        scale,
        ..InternalTimestamp::default()
    };
    match bytes.len() {
        0 => {}
        4 | 7 | 11 => {
            ts.date = binary_date(bytes)?;
            if bytes.len() >= 7 {
                ts.hour = bytes[4];
                ts.minute = bytes[5];
                ts.second = bytes[6];
            }
            if bytes.len() == 11 {
                let micros = micros_field(&bytes[7..11], FieldType::DateTime)?;
                ts.nanos = truncate_nanos(micros * 1000, scale);
            }
        }
        n => return Err(malformed(FieldType::DateTime, format_args!("unexpected length {n}"))),
    }
    Ok(ts)
}

fn micros_field(bytes: &[u8], ty: FieldType) -> Result<u32> {
    let micros = u32::from_le_bytes(fixed::<4>(bytes, ty)?);
    if micros >= 1_000_000 {
        return Err(malformed(ty, format_args!("{micros} microseconds")));
    }
    Ok(micros)
}

fn text_date(text: &str) -> Result<InternalDate> {
    let bad = || malformed(FieldType::Date, format_args!("'{text}'"));
    let mut parts = text.splitn(3, '-');
    let mut next = || parts.next().ok_or_else(bad);
    let year = next()?.parse().map_err(|_| bad())?;
    let month = next()?.parse().map_err(|_| bad())?;
    let day = next()?.parse().map_err(|_| bad())?;
    Ok(InternalDate { year, month, day })
}

/// `HH:MM:SS[.fraction]` with an optional leading minus; hours may exceed 23.
fn text_time(text: &str, scale: u8) -> Result<InternalTime> {
    let bad = || malformed(FieldType::Time, format_args!("'{text}'"));
    let (negative, body) = match text.strip_prefix('-') {
        Some(rest) => (true, rest),
        None => (false, text),
    };
    let (clock, fraction) = match body.split_once('.') {
        Some((clock, fraction)) => (clock, fraction),
        None => (body, ""),
    };
    let mut parts = clock.splitn(3, ':');
    let mut next = || parts.next().ok_or_else(bad);
    let hours = next()?.parse().map_err(|_| bad())?;
    let minutes = next()?.parse().map_err(|_| bad())?;
    let seconds = next()?.parse().map_err(|_| bad())?;
    let nanos = fraction_nanos(fraction).ok_or_else(bad)?;
    Ok(InternalTime {
        negative,
        hours,
        minutes,
        seconds,
        nanos: truncate_nanos(nanos, scale),
        scale,
    })
}

fn text_timestamp(text: &str, scale: u8) -> Result<InternalTimestamp> {
    let bad = || malformed(FieldType::DateTime, format_args!("'{text}'"));
    let (date, clock) = match text.split_once([' ', 'T']) {
        Some((date, clock)) => (date, Some(clock)),
        None => (text, None),
    };
    let date = text_date(date).map_err(|_| bad())?;
    let mut ts = InternalTimestamp {
        date,
        scale,
        ..InternalTimestamp::default()
    };
    if let Some(clock) = clock {
        let time = text_time(clock, scale).map_err(|_| bad())?;
        if time.negative || time.hours > 23 {
            return Err(bad());
        }
        #[allow(clippy::cast_possible_truncation)]
        {
            ts.hour = time.hours as u8;
        }
        ts.minute = time.minutes;
        ts.second = time.seconds;
        ts.nanos = time.nanos;
    }
    Ok(ts)
}

/// Right-pad a decimal fraction to nine digits.
fn fraction_nanos(fraction: &str) -> Option<u32> {
    if fraction.is_empty() {
        return Some(0);
    }
    if fraction.len() > 9 || !fraction.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let value: u32 = fraction.parse().ok()?;
    #[allow(clippy::cast_possible_truncation)]
    Some(value * 10u32.pow(9 - fraction.len() as u32))
}
