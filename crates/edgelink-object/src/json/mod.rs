//! JSON bridge for the dynamic value model.
//!
//! The encoder streams canonical JSON into any [`std::io::Write`] sink, so a
//! payload can be emitted straight into a frame under construction. The
//! decoder parses in place: string escapes are rewritten within the input
//! buffer and the returned value's buffers alias it, so decoding a receive
//! buffer allocates only container storage.

mod decode;
mod encode;

pub use decode::decode_destructive;
pub use encode::{encode, encode_map};

#[cfg(test)]
mod tests {
    use crate::{Kv, Value, canonicalize, json};

    fn round_trip(value: &Value<'_>) -> Vec<u8> {
        let mut out = Vec::new();
        json::encode(value, &mut out).unwrap();
        out
    }

    #[test]
    fn encode_decode_round_trips_under_canonicalization() {
        let cases: Vec<Value<'static>> = vec![
            Value::Null,
            Value::Bool(true),
            Value::I64(-123_456_789),
            Value::F64(123.456),
            Value::Buf(b"Hello World!"),
            Value::Buf(b"esc \" \\ \n tab\t"),
            Value::List(vec![Value::I64(1), Value::Buf(b"two"), Value::Null]),
            Value::Map(vec![
                Kv::new(b"value", Value::Map(vec![Kv::new(b"key", Value::Buf(b"v"))])),
                Kv::new(b"componentName", Value::Buf(b"MyComponent")),
            ]),
        ];

        for original in cases {
            let mut bytes = round_trip(&original);
            let mut decoded = json::decode_destructive(&mut bytes).unwrap();
            let mut expected = original.clone();
            canonicalize(&mut decoded).unwrap();
            canonicalize(&mut expected).unwrap();
            assert_eq!(decoded, expected, "round trip mismatch for {original:?}");
        }
    }

    #[test]
    fn output_is_valid_json_per_oracle() {
        let value = Value::Map(vec![
            Kv::new(b"i", Value::I64(42)),
            Kv::new(b"f", Value::F64(0.25)),
            Kv::new(b"s", Value::Buf("uni \u{00e9}\u{2603}".as_bytes())),
            Kv::new(b"l", Value::List(vec![Value::Bool(false), Value::Null])),
        ]);
        let bytes = round_trip(&value);

        let oracle: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(oracle["i"], serde_json::json!(42));
        assert_eq!(oracle["f"], serde_json::json!(0.25));
        assert_eq!(oracle["s"], serde_json::json!("uni \u{00e9}\u{2603}"));
        assert_eq!(oracle["l"], serde_json::json!([false, null]));
    }

    #[test]
    fn floats_round_trip_as_floats() {
        let mut bytes = round_trip(&Value::F64(1.0));
        assert_eq!(bytes, b"1.0");
        let decoded = json::decode_destructive(&mut bytes).unwrap();
        assert_eq!(decoded, Value::F64(1.0));
    }
}
