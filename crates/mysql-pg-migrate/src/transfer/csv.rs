//! Record encoder for `COPY ... WITH (FORMAT csv)`.
//!
//! NULL is an unquoted empty field and an empty string is `""`, so the two
//! stay distinct. A field is quoted when it contains the delimiter, a quote,
//! CR or LF, or is exactly `\.`; inner quotes are doubled.

use bytes::{BufMut, BytesMut};

use crate::core::value::SqlValue;
use crate::error::{MigrateError, Result};

const QUOTE: u8 = b'"';

/// Encodes source rows as CSV records.
#[derive(Debug, Clone)]
pub struct CsvEncoder {
    delimiter: u8,
    width: Option<(String, usize)>,
}

impl CsvEncoder {
    pub fn new(delimiter: u8) -> Self {
        Self {
            delimiter,
            width: None,
        }
    }

    /// Reject rows of `table` whose field count differs from `width`.
    pub fn with_width(mut self, table: impl Into<String>, width: usize) -> Self {
        self.width = Some((table.into(), width));
        self
    }

    /// Append one record, including its trailing newline.
    pub fn encode_row(&self, row: &[SqlValue], buf: &mut BytesMut) -> Result<()> {
        if let Some((table, width)) = &self.width {
            if row.len() != *width {
                return Err(MigrateError::transfer(
                    table.as_str(),
                    format!("row has {} fields, expected {}", row.len(), width),
                ));
            }
        }

        for (i, value) in row.iter().enumerate() {
            if i > 0 {
                buf.put_u8(self.delimiter);
            }
            self.encode_value(value, buf);
        }
        buf.put_u8(b'\n');
        Ok(())
    }

    fn encode_value(&self, value: &SqlValue, buf: &mut BytesMut) {
        match value {
            SqlValue::Null => {}
            SqlValue::Bool(b) => buf.put_u8(if *b { b't' } else { b'f' }),
            SqlValue::Int(n) => self.write_field(n.to_string().as_bytes(), buf),
            SqlValue::UInt(n) => self.write_field(n.to_string().as_bytes(), buf),
            SqlValue::Float(f) => self.write_field(float_text(*f).as_bytes(), buf),
            SqlValue::Decimal(d) => self.write_field(d.to_string().as_bytes(), buf),
            SqlValue::Text(bytes) => {
                if bytes.is_empty() {
                    buf.put_slice(b"\"\"");
                } else {
                    self.write_field(bytes, buf);
                }
            }
            SqlValue::Bytes(bytes) => {
                let text = format!("\\x{}", hex::encode(bytes));
                self.write_field(text.as_bytes(), buf);
            }
            SqlValue::Date(d) => {
                self.write_field(d.format("%Y-%m-%d").to_string().as_bytes(), buf)
            }
            SqlValue::Time(t) => {
                self.write_field(t.format("%H:%M:%S%.f").to_string().as_bytes(), buf)
            }
            SqlValue::DateTime(dt) => self.write_field(
                dt.format("%Y-%m-%d %H:%M:%S%.f").to_string().as_bytes(),
                buf,
            ),
        }
    }

    fn write_field(&self, field: &[u8], buf: &mut BytesMut) {
        if !self.needs_quotes(field) {
            buf.put_slice(field);
            return;
        }
        buf.reserve(field.len() + 2);
        buf.put_u8(QUOTE);
        for &b in field {
            if b == QUOTE {
                buf.put_u8(QUOTE);
            }
            buf.put_u8(b);
        }
        buf.put_u8(QUOTE);
    }

    fn needs_quotes(&self, field: &[u8]) -> bool {
        field == b"\\."
            || field
                .iter()
                .any(|&b| b == self.delimiter || b == QUOTE || b == b'\r' || b == b'\n')
    }
}

fn float_text(f: f64) -> String {
    if f.is_nan() {
        "NaN".to_string()
    } else if f == f64::INFINITY {
        "Infinity".to_string()
    } else if f == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else {
        f.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    fn encode(encoder: &CsvEncoder, row: Vec<SqlValue>) -> String {
        let mut buf = BytesMut::new();
        encoder.encode_row(&row, &mut buf).unwrap();
        String::from_utf8(buf.to_vec()).unwrap()
    }

    #[test]
    fn test_null_and_empty_string_differ() {
        let enc = CsvEncoder::new(b',');
        assert_eq!(
            encode(&enc, vec![SqlValue::Null, SqlValue::text(""), SqlValue::Int(3)]),
            ",\"\",3\n"
        );
    }

    #[test]
    fn test_quoting() {
        let enc = CsvEncoder::new(b',');
        assert_eq!(encode(&enc, vec![SqlValue::text("a,b")]), "\"a,b\"\n");
        assert_eq!(
            encode(&enc, vec![SqlValue::text("say \"hi\"")]),
            "\"say \"\"hi\"\"\"\n"
        );
        assert_eq!(
            encode(&enc, vec![SqlValue::text("line1\nline2")]),
            "\"line1\nline2\"\n"
        );
        assert_eq!(encode(&enc, vec![SqlValue::text("\\.")]), "\"\\.\"\n");
        assert_eq!(encode(&enc, vec![SqlValue::text("plain")]), "plain\n");
    }

    #[test]
    fn test_custom_delimiter() {
        let enc = CsvEncoder::new(b'|');
        assert_eq!(
            encode(&enc, vec![SqlValue::text("a,b"), SqlValue::text("c|d")]),
            "a,b|\"c|d\"\n"
        );
    }

    #[test]
    fn test_typed_values() {
        let enc = CsvEncoder::new(b',');
        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        let row = vec![
            SqlValue::Bool(true),
            SqlValue::Bool(false),
            SqlValue::UInt(u64::MAX),
            SqlValue::Float(f64::NEG_INFINITY),
            SqlValue::Float(f64::NAN),
            SqlValue::Decimal(Decimal::from_str("12.50").unwrap()),
            SqlValue::Bytes(vec![0xde, 0xad]),
            SqlValue::Date(date),
            SqlValue::DateTime(date.and_hms_micro_opt(1, 2, 3, 400).unwrap()),
        ];
        assert_eq!(
            encode(&enc, row),
            "t,f,18446744073709551615,-Infinity,NaN,12.50,\\xdead,2024-02-29,2024-02-29 01:02:03.000400\n"
        );
    }

    #[test]
    fn test_width_mismatch_is_rejected() {
        let enc = CsvEncoder::new(b',').with_width("orders", 2);
        let mut buf = BytesMut::new();
        let err = enc.encode_row(&[SqlValue::Int(1)], &mut buf).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Transfer failed for table orders: row has 1 fields, expected 2"
        );
        assert!(enc
            .encode_row(&[SqlValue::Int(1), SqlValue::Null], &mut buf)
            .is_ok());
    }
}
