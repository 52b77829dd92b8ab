//! Splitting row packets into per-column byte slices.

use sqlwire_core::error::ProtocolError;
use sqlwire_core::{Result, Value};

use crate::decode::{ColumnDecoder, SqlValueFactory, ValueFactory};
use crate::protocol::PacketReader;
use crate::types::{ColumnDefinition, FieldType};

// Canonical encodings for the zero-length temporal shorthand of binary rows.
static ZERO_DATE: [u8; 4] = [0; 4];
static ZERO_TIME: [u8; 8] = [0; 8];

/// Null bitmap offset for binary result rows.
const BINARY_ROW_BITMAP_OFFSET: usize = 2;

fn truncated(payload: &[u8], what: &str) -> sqlwire_core::Error {
    ProtocolError {
        message: format!("truncated {what}"),
        raw_data: Some(payload.to_vec()),
    }
    .into()
}

/// Split a text protocol row: one length-encoded field per column, `0xFB` for NULL.
pub fn split_text_row(payload: &[u8], column_count: usize) -> Result<Vec<Option<&[u8]>>> {
    let mut reader = PacketReader::new(payload);
    let mut values = Vec::with_capacity(column_count);
    for _ in 0..column_count {
        let field = reader
            .read_lenenc_field()
            .ok_or_else(|| truncated(payload, "text row"))?;
        values.push(field);
    }
    Ok(values)
}

/// Split a binary protocol row.
///
/// Layout: `0x00` header, null bitmap of `(n + 7 + 2) / 8` bytes whose first
/// two bits are reserved, then the non-null values in column order.
pub fn split_binary_row<'a>(
    payload: &'a [u8],
    columns: &[ColumnDefinition],
) -> Result<Vec<Option<&'a [u8]>>> {
    let mut reader = PacketReader::new(payload);
    if reader.read_u8() != Some(0x00) {
        return Err(ProtocolError {
            message: "binary row does not start with 0x00".to_string(),
            raw_data: Some(payload.to_vec()),
        }
        .into());
    }
    let bitmap_len = (columns.len() + 7 + BINARY_ROW_BITMAP_OFFSET) / 8;
    let bitmap = reader
        .read_bytes(bitmap_len)
        .ok_or_else(|| truncated(payload, "binary row null bitmap"))?;

    let mut values = Vec::with_capacity(columns.len());
    for (i, column) in columns.iter().enumerate() {
        let bit = i + BINARY_ROW_BITMAP_OFFSET;
        if bitmap[bit / 8] & (1 << (bit % 8)) != 0 {
            values.push(None);
            continue;
        }
        let value = binary_value(&mut reader, column)?.ok_or_else(|| truncated(payload, "binary row value"))?;
        values.push(Some(value));
    }
    Ok(values)
}

fn binary_value<'a>(reader: &mut PacketReader<'a>, column: &ColumnDefinition) -> Result<Option<&'a [u8]>> {
    let ty = column.field_type()?;
    let value = match ty {
        FieldType::Null => Some(&[][..]),
        FieldType::Tiny => reader.read_bytes(1),
        FieldType::Short | FieldType::Year => reader.read_bytes(2),
        FieldType::Long | FieldType::Int24 | FieldType::Float => reader.read_bytes(4),
        FieldType::LongLong | FieldType::Double => reader.read_bytes(8),
        FieldType::Date
        | FieldType::NewDate
        | FieldType::DateTime
        | FieldType::DateTime2
        | FieldType::Timestamp
        | FieldType::Timestamp2 => match reader.read_u8() {
            Some(0) => Some(&ZERO_DATE[..]),
            Some(len) => reader.read_bytes(usize::from(len)),
            None => None,
        },
        FieldType::Time | FieldType::Time2 => match reader.read_u8() {
            Some(0) => Some(&ZERO_TIME[..]),
            Some(len) => reader.read_bytes(usize::from(len)),
            None => None,
        },
        _ => reader.read_lenenc_bytes(),
    };
    Ok(value)
}

/// Decode a whole text protocol row.
pub fn decode_text_row<F: ValueFactory>(
    payload: &[u8],
    columns: &[ColumnDefinition],
    decoder: &mut ColumnDecoder,
    factory: &F,
) -> Result<Vec<F::Output>> {
    split_text_row(payload, columns.len())?
        .into_iter()
        .zip(columns)
        .map(|(bytes, column)| decoder.decode_text(column, bytes, factory))
        .collect()
}

/// Decode a whole binary protocol row.
pub fn decode_binary_row<F: ValueFactory>(
    payload: &[u8],
    columns: &[ColumnDefinition],
    decoder: &mut ColumnDecoder,
    factory: &F,
) -> Result<Vec<F::Output>> {
    split_binary_row(payload, columns)?
        .into_iter()
        .zip(columns)
        .map(|(bytes, column)| decoder.decode(column, bytes, factory))
        .collect()
}

/// A decoded row of driver-native values.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    values: Vec<Value>,
}

impl Row {
    pub fn new(values: Vec<Value>) -> Self {
        Self { values }
    }

    /// Decode a text protocol row into `Value`s.
    pub fn from_text(payload: &[u8], columns: &[ColumnDefinition], decoder: &mut ColumnDecoder) -> Result<Self> {
        decode_text_row(payload, columns, decoder, &SqlValueFactory).map(Self::new)
    }

    pub fn get(&self, index: usize) -> Option<&Value> {
        self.values.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn into_values(self) -> Vec<Value> {
        self.values
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::ZeroDateBehavior;
    use crate::protocol::PacketWriter;

    fn columns() -> Vec<ColumnDefinition> {
        vec![
            ColumnDefinition::with_type("id", FieldType::Long).not_null(),
            ColumnDefinition::with_type("note", FieldType::VarString),
            ColumnDefinition::with_type("at", FieldType::Time).not_null(),
            ColumnDefinition::with_type("n", FieldType::Tiny),
        ]
    }

    #[test]
    fn test_split_text_row_with_null() {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("7");
        w.write_u8(0xFB);
        w.write_lenenc_string("01:02:03");
        w.write_lenenc_string("");
        let values = split_text_row(w.as_bytes(), 4).unwrap();
        assert_eq!(values[0], Some(&b"7"[..]));
        assert_eq!(values[1], None);
        assert_eq!(values[3], Some(&b""[..]));
        assert!(split_text_row(w.as_bytes(), 5).is_err());
    }

    #[test]
    fn test_split_binary_row_bitmap_offset() {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        // column 1 null -> bit 3; column 3 null -> bit 5
        w.write_u8(0b0010_1000);
        w.write_u32_le(42);
        w.write_u8(0); // zero TIME shorthand
        let cols = columns();
        let values = split_binary_row(w.as_bytes(), &cols).unwrap();
        assert_eq!(values[0], Some(&42u32.to_le_bytes()[..]));
        assert_eq!(values[1], None);
        assert_eq!(values[2], Some(&[0u8; 8][..]));
        assert_eq!(values[3], None);
    }

    #[test]
    fn test_decode_binary_row() {
        let mut w = PacketWriter::new();
        w.write_u8(0x00);
        w.write_u8(0);
        w.write_u32_le(5);
        w.write_lenenc_string("hi");
        w.write_u8(8);
        w.write_bytes(&[0, 0, 0, 0, 0, 1, 0, 0]);
        w.write_u8(0xFF);

        let mut decoder = ColumnDecoder::new(ZeroDateBehavior::Exception);
        let row = decode_binary_row(w.as_bytes(), &columns(), &mut decoder, &SqlValueFactory).unwrap();
        assert_eq!(
            row,
            vec![
                Value::BigInt(5),
                Value::Text("hi".into()),
                Value::Time(3_600_000_000),
                Value::BigInt(-1),
            ]
        );
    }

    #[test]
    fn test_truncated_binary_row() {
        let payload = [0x00, 0x00, 0x01];
        assert!(split_binary_row(&payload, &columns()).is_err());
    }

    #[test]
    fn test_row_from_text() {
        let mut w = PacketWriter::new();
        w.write_lenenc_string("9");
        w.write_lenenc_string("x");
        w.write_lenenc_string("00:00:01");
        w.write_u8(0xFB);
        let row = Row::from_text(w.as_bytes(), &columns(), &mut ColumnDecoder::default()).unwrap();
        assert_eq!(row.len(), 4);
        assert_eq!(row.get(0), Some(&Value::BigInt(9)));
        assert_eq!(row.get(3), Some(&Value::Null));
    }
}
