//! Column types and column metadata.
//!
//! `FieldType` mirrors the `MYSQL_TYPE_*` ids sent in column definitions.
//! Unknown ids are an error: the decoder never guesses a representation.

use sqlwire_core::Result;
use sqlwire_core::error::{DecodeError, DecodeErrorKind, ProtocolError};

use crate::charset::BINARY_COLLATION;
use crate::protocol::PacketReader;

/// Wire type ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FieldType {
    Decimal = 0x00,
    Tiny = 0x01,
    Short = 0x02,
    Long = 0x03,
    Float = 0x04,
    Double = 0x05,
    Null = 0x06,
    Timestamp = 0x07,
    LongLong = 0x08,
    Int24 = 0x09,
    Date = 0x0A,
    Time = 0x0B,
    DateTime = 0x0C,
    Year = 0x0D,
    NewDate = 0x0E,
    VarChar = 0x0F,
    Bit = 0x10,
    Timestamp2 = 0x11,
    DateTime2 = 0x12,
    Time2 = 0x13,
    Json = 0xF5,
    NewDecimal = 0xF6,
    Enum = 0xF7,
    Set = 0xF8,
    TinyBlob = 0xF9,
    MediumBlob = 0xFA,
    LongBlob = 0xFB,
    Blob = 0xFC,
    VarString = 0xFD,
    String = 0xFE,
    Geometry = 0xFF,
}

impl FieldType {
    /// Resolve a wire type id.
    pub fn try_from_u8(value: u8) -> Result<Self> {
        let ty = match value {
            0x00 => FieldType::Decimal,
            0x01 => FieldType::Tiny,
            0x02 => FieldType::Short,
            0x03 => FieldType::Long,
            0x04 => FieldType::Float,
            0x05 => FieldType::Double,
            0x06 => FieldType::Null,
            0x07 => FieldType::Timestamp,
            0x08 => FieldType::LongLong,
            0x09 => FieldType::Int24,
            0x0A => FieldType::Date,
            0x0B => FieldType::Time,
            0x0C => FieldType::DateTime,
            0x0D => FieldType::Year,
            0x0E => FieldType::NewDate,
            0x0F => FieldType::VarChar,
            0x10 => FieldType::Bit,
            0x11 => FieldType::Timestamp2,
            0x12 => FieldType::DateTime2,
            0x13 => FieldType::Time2,
            0xF5 => FieldType::Json,
            0xF6 => FieldType::NewDecimal,
            0xF7 => FieldType::Enum,
            0xF8 => FieldType::Set,
            0xF9 => FieldType::TinyBlob,
            0xFA => FieldType::MediumBlob,
            0xFB => FieldType::LongBlob,
            0xFC => FieldType::Blob,
            0xFD => FieldType::VarString,
            0xFE => FieldType::String,
            0xFF => FieldType::Geometry,
            other => {
                return Err(DecodeError::new(
                    DecodeErrorKind::UnknownType,
                    format!("unknown column type id 0x{other:02x}"),
                )
                .into());
            }
        };
        Ok(ty)
    }

    /// Resolve a SQL type name such as `"BIGINT UNSIGNED"` or `"varchar"`.
    ///
    /// Used only for rows synthesized without wire metadata.
    pub fn from_name(name: &str) -> Result<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let base = upper
            .split(|c: char| c == '(' || c.is_whitespace())
            .next()
            .unwrap_or_default();
        let ty = match base {
            "DECIMAL" | "NUMERIC" | "DEC" => FieldType::NewDecimal,
            "TINYINT" | "BOOL" | "BOOLEAN" => FieldType::Tiny,
            "SMALLINT" => FieldType::Short,
            "MEDIUMINT" => FieldType::Int24,
            "INT" | "INTEGER" => FieldType::Long,
            "BIGINT" => FieldType::LongLong,
            "FLOAT" => FieldType::Float,
            "DOUBLE" | "REAL" => FieldType::Double,
            "NULL" => FieldType::Null,
            "TIMESTAMP" => FieldType::Timestamp,
            "DATE" => FieldType::Date,
            "TIME" => FieldType::Time,
            "DATETIME" => FieldType::DateTime,
            "YEAR" => FieldType::Year,
            "VARCHAR" => FieldType::VarChar,
            "BIT" => FieldType::Bit,
            "JSON" => FieldType::Json,
            "ENUM" => FieldType::Enum,
            "SET" => FieldType::Set,
            "TINYBLOB" | "TINYTEXT" => FieldType::TinyBlob,
            "MEDIUMBLOB" | "MEDIUMTEXT" => FieldType::MediumBlob,
            "LONGBLOB" | "LONGTEXT" => FieldType::LongBlob,
            "BLOB" | "TEXT" => FieldType::Blob,
            "VARBINARY" => FieldType::VarString,
            "CHAR" | "BINARY" => FieldType::String,
            "GEOMETRY" => FieldType::Geometry,
            _ => {
                return Err(DecodeError::new(
                    DecodeErrorKind::UnknownType,
                    format!("unknown column type name '{name}'"),
                )
                .into());
            }
        };
        Ok(ty)
    }

    pub const fn is_integer(self) -> bool {
        matches!(
            self,
            FieldType::Tiny
                | FieldType::Short
                | FieldType::Long
                | FieldType::LongLong
                | FieldType::Int24
                | FieldType::Year
        )
    }

    pub const fn is_temporal(self) -> bool {
        matches!(
            self,
            FieldType::Date
                | FieldType::Time
                | FieldType::DateTime
                | FieldType::Timestamp
                | FieldType::NewDate
                | FieldType::Timestamp2
                | FieldType::DateTime2
                | FieldType::Time2
        )
    }

    pub const fn name(self) -> &'static str {
        match self {
            FieldType::Decimal | FieldType::NewDecimal => "DECIMAL",
            FieldType::Tiny => "TINYINT",
            FieldType::Short => "SMALLINT",
            FieldType::Long => "INT",
            FieldType::Float => "FLOAT",
            FieldType::Double => "DOUBLE",
            FieldType::Null => "NULL",
            FieldType::Timestamp | FieldType::Timestamp2 => "TIMESTAMP",
            FieldType::LongLong => "BIGINT",
            FieldType::Int24 => "MEDIUMINT",
            FieldType::Date | FieldType::NewDate => "DATE",
            FieldType::Time | FieldType::Time2 => "TIME",
            FieldType::DateTime | FieldType::DateTime2 => "DATETIME",
            FieldType::Year => "YEAR",
            FieldType::VarChar | FieldType::VarString => "VARCHAR",
            FieldType::Bit => "BIT",
            FieldType::Json => "JSON",
            FieldType::Enum => "ENUM",
            FieldType::Set => "SET",
            FieldType::TinyBlob => "TINYBLOB",
            FieldType::MediumBlob => "MEDIUMBLOB",
            FieldType::LongBlob => "LONGBLOB",
            FieldType::Blob => "BLOB",
            FieldType::String => "CHAR",
            FieldType::Geometry => "GEOMETRY",
        }
    }
}

/// Column flags in result set metadata.
#[allow(dead_code)]
pub mod column_flags {
    pub const NOT_NULL: u16 = 1;
    pub const PRIMARY_KEY: u16 = 2;
    pub const UNIQUE_KEY: u16 = 4;
    pub const MULTIPLE_KEY: u16 = 8;
    pub const BLOB: u16 = 16;
    pub const UNSIGNED: u16 = 32;
    pub const ZEROFILL: u16 = 64;
    pub const BINARY: u16 = 128;
    pub const ENUM: u16 = 256;
    pub const AUTO_INCREMENT: u16 = 512;
    pub const TIMESTAMP: u16 = 1024;
    pub const SET: u16 = 2048;
    pub const NO_DEFAULT_VALUE: u16 = 4096;
    pub const ON_UPDATE_NOW: u16 = 8192;
    pub const NUM: u16 = 32768;
}

/// `decimals` value for columns without a fixed scale.
pub const NOT_FIXED_DEC: u8 = 31;

/// Metadata for one result-set column.
///
/// `type_id` is authoritative; `type_name` is consulted only when the id is
/// absent, which happens for rows built in memory rather than read off the wire.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnDefinition {
    pub schema: String,
    pub table: String,
    pub org_table: String,
    pub name: String,
    pub org_name: String,
    /// Collation id
    pub charset: u16,
    pub column_length: u32,
    pub type_id: Option<u8>,
    pub type_name: Option<String>,
    pub flags: u16,
    /// Decimal scale, or fractional-seconds precision for temporal columns
    pub decimals: u8,
}

impl ColumnDefinition {
    /// Parse a protocol 4.1 column definition packet.
    pub fn parse(payload: &[u8]) -> Result<Self> {
        let malformed = || ProtocolError {
            message: "truncated column definition".to_string(),
            raw_data: Some(payload.to_vec()),
        };
        let mut reader = PacketReader::new(payload);
        let _catalog = reader.read_lenenc_bytes().ok_or_else(malformed)?;
        let schema = reader.read_lenenc_string().ok_or_else(malformed)?;
        let table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_table = reader.read_lenenc_string().ok_or_else(malformed)?;
        let name = reader.read_lenenc_string().ok_or_else(malformed)?;
        let org_name = reader.read_lenenc_string().ok_or_else(malformed)?;
        let _fixed_len = reader.read_lenenc_int().ok_or_else(malformed)?;
        let charset = reader.read_u16_le().ok_or_else(malformed)?;
        let column_length = reader.read_u32_le().ok_or_else(malformed)?;
        let type_id = reader.read_u8().ok_or_else(malformed)?;
        let flags = reader.read_u16_le().ok_or_else(malformed)?;
        let decimals = reader.read_u8().ok_or_else(malformed)?;

        Ok(Self {
            schema,
            table,
            org_table,
            name,
            org_name,
            charset,
            column_length,
            type_id: Some(type_id),
            type_name: None,
            flags,
            decimals,
        })
    }

    /// A column known only by name and SQL type name.
    pub fn synthesized(name: impl Into<String>, type_name: impl Into<String>, nullable: bool) -> Self {
        let type_name = type_name.into();
        let mut flags = 0;
        if !nullable {
            flags |= column_flags::NOT_NULL;
        }
        if type_name.to_ascii_uppercase().contains("UNSIGNED") {
            flags |= column_flags::UNSIGNED;
        }
        Self {
            name: name.into(),
            charset: crate::charset::UTF8MB4_0900_AI_CI,
            type_name: Some(type_name),
            flags,
            decimals: NOT_FIXED_DEC,
            ..Self::default()
        }
    }

    /// A column with wire metadata, as the decoder sees it.
    pub fn with_type(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            charset: crate::charset::UTF8MB4_0900_AI_CI,
            type_id: Some(field_type as u8),
            ..Self::default()
        }
    }

    pub fn unsigned(mut self) -> Self {
        self.flags |= column_flags::UNSIGNED;
        self
    }

    pub fn not_null(mut self) -> Self {
        self.flags |= column_flags::NOT_NULL;
        self
    }

    pub fn scale(mut self, decimals: u8) -> Self {
        self.decimals = decimals;
        self
    }

    pub fn collation(mut self, charset: u16) -> Self {
        self.charset = charset;
        self
    }

    /// Resolve the column type: wire id first, then type name.
    pub fn field_type(&self) -> Result<FieldType> {
        match (&self.type_id, &self.type_name) {
            (Some(id), _) => FieldType::try_from_u8(*id),
            (None, Some(name)) => FieldType::from_name(name),
            (None, None) => Err(DecodeError::new(
                DecodeErrorKind::UnknownType,
                "column has neither a type id nor a type name",
            )
            .with_column(&self.name)
            .into()),
        }
    }

    pub const fn is_nullable(&self) -> bool {
        self.flags & column_flags::NOT_NULL == 0
    }

    pub const fn is_unsigned(&self) -> bool {
        self.flags & column_flags::UNSIGNED != 0
    }

    /// Binary collation: bytes are not text.
    pub const fn is_binary(&self) -> bool {
        self.charset == BINARY_COLLATION
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketWriter;

    #[test]
    fn test_unknown_type_id_is_error() {
        let err = FieldType::try_from_u8(0x42).unwrap_err();
        assert_eq!(err.decode_kind(), Some(DecodeErrorKind::UnknownType));
        assert_eq!(FieldType::try_from_u8(0xF6).unwrap(), FieldType::NewDecimal);
    }

    #[test]
    fn test_from_name() {
        assert_eq!(FieldType::from_name("bigint unsigned").unwrap(), FieldType::LongLong);
        assert_eq!(FieldType::from_name("VARCHAR(255)").unwrap(), FieldType::VarChar);
        assert_eq!(FieldType::from_name("text").unwrap(), FieldType::Blob);
        assert!(FieldType::from_name("HYPERLOGLOG").is_err());
    }

    #[test]
    fn test_type_id_wins_over_name() {
        let mut col = ColumnDefinition::synthesized("c", "VARCHAR", true);
        col.type_id = Some(FieldType::Long as u8);
        assert_eq!(col.field_type().unwrap(), FieldType::Long);
        col.type_id = None;
        assert_eq!(col.field_type().unwrap(), FieldType::VarChar);
    }

    #[test]
    fn test_synthesized_flags() {
        let col = ColumnDefinition::synthesized("id", "BIGINT UNSIGNED", false);
        assert!(col.is_unsigned());
        assert!(!col.is_nullable());
    }

    #[test]
    fn test_parse_column_definition() {
        let mut w = PacketWriter::new();
        for s in ["def", "shop", "o", "orders", "total", "total"] {
            w.write_lenenc_string(s);
        }
        w.write_lenenc_int(0x0c);
        w.write_u16_le(63);
        w.write_u32_le(12);
        w.write_u8(FieldType::NewDecimal as u8);
        w.write_u16_le(column_flags::NOT_NULL);
        w.write_u8(2);
        w.write_zeros(2);

        let col = ColumnDefinition::parse(w.as_bytes()).unwrap();
        assert_eq!(col.schema, "shop");
        assert_eq!(col.name, "total");
        assert_eq!(col.field_type().unwrap(), FieldType::NewDecimal);
        assert_eq!(col.decimals, 2);
        assert!(col.is_binary());
        assert!(!col.is_nullable());
    }
}
