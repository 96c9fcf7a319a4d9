use std::io::Write;

use crate::{Error, Kv, MAX_OBJECT_DEPTH, Result, Value};

/// Writes `value` as JSON into `out`.
///
/// Integers print as JSON integers; floats use the shortest representation
/// that parses back to the same bits, always carrying a fraction or exponent
/// marker so they decode as floats again. Non-finite floats and non-UTF-8
/// buffers fail with `Invalid`; no extensions are emitted.
pub fn encode<W: Write>(value: &Value<'_>, out: &mut W) -> Result<()> {
    encode_at(value, out, 0)
}

/// Writes map `pairs` as a JSON object without materializing a `Value::Map`.
pub fn encode_map<W: Write>(pairs: &[Kv<'_>], out: &mut W) -> Result<()> {
    encode_pairs(pairs, out, 0)
}

fn sink_err(err: &std::io::Error) -> Error {
    // SliceWriter overflow surfaces as WriteZero; anything else is the sink's
    // own failure.
    if err.kind() == std::io::ErrorKind::WriteZero { Error::NoMem } else { Error::Failure }
}

fn put<W: Write>(out: &mut W, bytes: &[u8]) -> Result<()> {
    out.write_all(bytes).map_err(|e| sink_err(&e))
}

fn encode_at<W: Write>(value: &Value<'_>, out: &mut W, depth: usize) -> Result<()> {
    if depth > MAX_OBJECT_DEPTH {
        return Err(Error::Range);
    }
    match value {
        Value::Null => put(out, b"null"),
        Value::Bool(true) => put(out, b"true"),
        Value::Bool(false) => put(out, b"false"),
        Value::I64(i) => {
            let mut scratch = itoa_buf();
            let text = write_display(&mut scratch, format_args!("{i}"));
            put(out, text)
        }
        Value::F64(f) => {
            if !f.is_finite() {
                return Err(Error::Invalid);
            }
            let mut scratch = itoa_buf();
            // {:?} keeps a ".0" on whole numbers, so the value reads back as
            // a float rather than an integer.
            let text = write_display(&mut scratch, format_args!("{f:?}"));
            put(out, text)
        }
        Value::Buf(b) => encode_string(b, out),
        Value::List(items) => {
            put(out, b"[")?;
            for (i, item) in items.iter().enumerate() {
                if i != 0 {
                    put(out, b",")?;
                }
                encode_at(item, out, depth + 1)?;
            }
            put(out, b"]")
        }
        Value::Map(pairs) => encode_pairs(pairs, out, depth),
    }
}

fn encode_pairs<W: Write>(pairs: &[Kv<'_>], out: &mut W, depth: usize) -> Result<()> {
    if depth > MAX_OBJECT_DEPTH {
        return Err(Error::Range);
    }
    put(out, b"{")?;
    for (i, kv) in pairs.iter().enumerate() {
        if i != 0 {
            put(out, b",")?;
        }
        encode_string(kv.key, out)?;
        put(out, b":")?;
        encode_at(&kv.value, out, depth + 1)?;
    }
    put(out, b"}")
}

fn encode_string<W: Write>(bytes: &[u8], out: &mut W) -> Result<()> {
    let text = core::str::from_utf8(bytes).map_err(|_| Error::Invalid)?;

    put(out, b"\"")?;
    let mut run_start = 0;
    for (i, byte) in text.bytes().enumerate() {
        let escape: Option<&[u8]> = match byte {
            b'"' => Some(b"\\\""),
            b'\\' => Some(b"\\\\"),
            0x08 => Some(b"\\b"),
            0x0C => Some(b"\\f"),
            b'\n' => Some(b"\\n"),
            b'\r' => Some(b"\\r"),
            b'\t' => Some(b"\\t"),
            _ => None,
        };
        if let Some(esc) = escape {
            put(out, &text.as_bytes()[run_start..i])?;
            put(out, esc)?;
            run_start = i + 1;
        } else if byte < 0x20 {
            put(out, &text.as_bytes()[run_start..i])?;
            let mut scratch = itoa_buf();
            let hex = write_display(&mut scratch, format_args!("\\u{byte:04x}"));
            put(out, hex)?;
            run_start = i + 1;
        }
    }
    put(out, &text.as_bytes()[run_start..])?;
    put(out, b"\"")
}

// Stack scratch for number and escape formatting; f64 shortest form tops out
// well under this.
fn itoa_buf() -> [u8; 32] {
    [0; 32]
}

fn write_display<'b>(buf: &'b mut [u8; 32], args: core::fmt::Arguments<'_>) -> &'b [u8] {
    struct Cursor<'a> {
        buf: &'a mut [u8],
        len: usize,
    }
    impl core::fmt::Write for Cursor<'_> {
        fn write_str(&mut self, s: &str) -> core::fmt::Result {
            let end = self.len + s.len();
            if end > self.buf.len() {
                return Err(core::fmt::Error);
            }
            self.buf[self.len..end].copy_from_slice(s.as_bytes());
            self.len = end;
            Ok(())
        }
    }

    let mut cursor = Cursor { buf, len: 0 };
    // i64 and shortest-f64 text always fit the scratch buffer.
    let _ = core::fmt::write(&mut cursor, args);
    let len = cursor.len;
    &buf[..len]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SliceWriter;

    fn encode_to_string(value: &Value<'_>) -> String {
        let mut out = Vec::new();
        encode(value, &mut out).unwrap();
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn scalars() {
        assert_eq!(encode_to_string(&Value::Null), "null");
        assert_eq!(encode_to_string(&Value::Bool(true)), "true");
        assert_eq!(encode_to_string(&Value::Bool(false)), "false");
        assert_eq!(encode_to_string(&Value::I64(-17)), "-17");
        assert_eq!(encode_to_string(&Value::I64(i64::MAX)), "9223372036854775807");
    }

    #[test]
    fn floats_keep_a_float_marker() {
        assert_eq!(encode_to_string(&Value::F64(1.0)), "1.0");
        assert_eq!(encode_to_string(&Value::F64(123.456)), "123.456");
        assert_eq!(encode_to_string(&Value::F64(1e300)), "1e300");
    }

    #[test]
    fn non_finite_floats_rejected() {
        let mut out = Vec::new();
        assert_eq!(encode(&Value::F64(f64::NAN), &mut out).unwrap_err(), Error::Invalid);
        assert_eq!(encode(&Value::F64(f64::INFINITY), &mut out).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn string_escapes() {
        assert_eq!(
            encode_to_string(&Value::Buf(b"a\"b\\c\nd\te")),
            r#""a\"b\\c\nd\te""#
        );
        assert_eq!(encode_to_string(&Value::Buf(&[0x01])), r#""\u0001""#);
    }

    #[test]
    fn invalid_utf8_rejected() {
        let mut out = Vec::new();
        assert_eq!(encode(&Value::Buf(&[0xFF, 0xFE]), &mut out).unwrap_err(), Error::Invalid);
    }

    #[test]
    fn containers() {
        let value = Value::Map(vec![
            Kv::new(b"keyPath", Value::List(vec![Value::Buf(b"config"), Value::Buf(b"key")])),
            Kv::new(b"componentName", Value::Buf(b"MyComponent")),
        ]);
        assert_eq!(
            encode_to_string(&value),
            r#"{"keyPath":["config","key"],"componentName":"MyComponent"}"#
        );
    }

    #[test]
    fn sink_overflow_is_nomem() {
        let mut buf = [0u8; 4];
        let mut w = SliceWriter::new(&mut buf);
        let err = encode(&Value::Buf(b"too long for four"), &mut w).unwrap_err();
        assert_eq!(err, Error::NoMem);
    }

    #[test]
    fn depth_bound() {
        let mut value = Value::I64(0);
        for _ in 0..(MAX_OBJECT_DEPTH + 1) {
            value = Value::List(vec![value]);
        }
        let mut out = Vec::new();
        assert_eq!(encode(&value, &mut out).unwrap_err(), Error::Range);
    }
}
