//! Binary wire format: two header versions over one type grammar.
//!
//! Version 1 is the classic byte-aligned encoding: every value is padded to
//! its natural alignment, arrays carry a byte length, strings are
//! NUL-terminated, and the correlation cookie is 32 bits.
//!
//! Version 2 is the compact encoding: values are packed with no padding,
//! strings are length-prefixed, variable-size containers carry a
//! length-prefixed table of end offsets, and the cookie is 64 bits.
//!
//! Layout:
//!
//! ```text
//! v1: | endian u8 | type u8 | flags u8 | 1u8 | body u32 | cookie u32 | fields u32 |
//!     | field block (aligned) | pad to 8 | body |
//! v2: | endian u8 | type u8 | flags u8 | 2u8 | cookie u64 | fields u32 | body u32 |
//!     | field block (packed) | body |
//! ```
//!
//! Both decoders are bounds-checked against the supplied buffer; declared
//! sizes are verified, never trusted.

mod decode;
mod encode;

pub use decode::{decode_message, peek_frame_len};
pub use encode::encode_message;

use crate::error::Error;

/// Maximum total size of one message.
pub const MAX_MESSAGE_SIZE: usize = 128 * 1024 * 1024;
/// Maximum byte size of one array, from the bus specification.
pub const MAX_ARRAY_SIZE: usize = 64 * 1024 * 1024;
/// Maximum number of attached file descriptors.
pub const MAX_FDS: usize = 1024;
/// Ceiling on container nesting while marshaling, enforced as a stack-size
/// check.
pub const MAX_CONTAINER_DEPTH: usize = 128;

/// Fixed header length per version.
pub(crate) const HDR_V1_LEN: usize = 16;
pub(crate) const HDR_V2_LEN: usize = 20;

/// Header field codes. Unknown codes are skipped on decode.
pub(crate) mod field {
    pub const PATH: u8 = 1;
    pub const INTERFACE: u8 = 2;
    pub const MEMBER: u8 = 3;
    pub const ERROR_NAME: u8 = 4;
    pub const REPLY_COOKIE: u8 = 5;
    pub const DESTINATION: u8 = 6;
    pub const SENDER: u8 = 7;
    pub const SIGNATURE: u8 = 8;
    pub const UNIX_FDS: u8 = 9;
}

/// Per-message byte order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endian {
    Little,
    Big,
}

impl Endian {
    pub fn native() -> Endian {
        if cfg!(target_endian = "big") {
            Endian::Big
        } else {
            Endian::Little
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Endian::Little => b'l',
            Endian::Big => b'B',
        }
    }

    pub fn from_tag(tag: u8) -> Option<Endian> {
        match tag {
            b'l' => Some(Endian::Little),
            b'B' => Some(Endian::Big),
            _ => None,
        }
    }
}

/// Wire sub-format, selected by the header version byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireVersion {
    /// Classic byte-aligned format.
    V1,
    /// Compact offset-table format.
    V2,
}

impl WireVersion {
    pub fn from_byte(v: u8) -> Option<WireVersion> {
        match v {
            1 => Some(WireVersion::V1),
            2 => Some(WireVersion::V2),
            _ => None,
        }
    }

    pub fn as_byte(self) -> u8 {
        match self {
            WireVersion::V1 => 1,
            WireVersion::V2 => 2,
        }
    }
}

pub(crate) fn protocol_err(msg: impl Into<String>) -> Error {
    Error::Protocol(msg.into())
}

pub(crate) fn pad_to(pos: usize, align: usize) -> usize {
    debug_assert!(align.is_power_of_two());
    (align - (pos & (align - 1))) & (align - 1)
}

/// Alignment of an array's elements, from the element signature.
pub(crate) fn elem_alignment(elem: &str) -> usize {
    elem.chars()
        .next()
        .and_then(crate::types::TypeCode::from_char)
        .map_or(1, crate::types::TypeCode::alignment)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::name;
    use crate::message::{Message, MessageType};
    use crate::types::Value;
    use crate::BusError;
    use static_assertions::const_assert;

    // The v1 field block starts right after the fixed header and relies on
    // that offset being 8-aligned.
    const_assert!(HDR_V1_LEN % 8 == 0);
    const_assert!(MAX_ARRAY_SIZE < MAX_MESSAGE_SIZE);

    fn sample_call() -> Message {
        let mut m = Message::new_method_call(
            Some("org.example.Peer"),
            "/org/example/Obj",
            Some("org.example.Iface"),
            "Frob",
        )
        .unwrap();
        m.append("text").unwrap();
        m.append(17i32).unwrap();
        m.append(-4i32).unwrap();
        m.append(true).unwrap();
        m.append("tail").unwrap();
        m.seal(41, None).unwrap();
        m
    }

    fn roundtrip(m: &Message, v: WireVersion) -> Message {
        let bytes = encode_message(m, v).unwrap();
        let total = peek_frame_len(&bytes).unwrap().unwrap();
        assert_eq!(total, bytes.len());
        decode_message(&bytes[..total], 0).unwrap()
    }

    #[test]
    fn header_roundtrip_both_versions() {
        let m = sample_call();
        for v in [WireVersion::V1, WireVersion::V2] {
            let d = roundtrip(&m, v);
            assert_eq!(d.message_type(), MessageType::MethodCall);
            assert_eq!(d.cookie(), 41);
            assert_eq!(d.path(), Some("/org/example/Obj"));
            assert_eq!(d.interface(), Some("org.example.Iface"));
            assert_eq!(d.member(), Some("Frob"));
            assert_eq!(d.destination(), Some("org.example.Peer"));
            assert_eq!(d.signature(), "siibs");
            assert_eq!(d.body_values(), m.body_values());
        }
    }

    #[test]
    fn body_value_roundtrip_law() {
        let cases: Vec<Vec<Value>> = vec![
            vec![],
            vec![Value::Byte(0xff), Value::Byte(0)],
            vec![Value::Boolean(false), Value::Double(1.25)],
            vec![
                Value::Int16(-2),
                Value::UInt16(65535),
                Value::Int64(i64::MIN),
                Value::UInt64(u64::MAX),
            ],
            vec![Value::String(String::new()), Value::String("héllo".into())],
            vec![Value::ObjectPath("/a/b".into()), Value::Signature("a{sv}".into())],
            vec![Value::Array("i".into(), vec![])],
            vec![Value::Array(
                "s".into(),
                vec![Value::String("x".into()), Value::String("yy".into())],
            )],
            vec![Value::Array(
                "(ib)".into(),
                vec![
                    Value::Struct(vec![Value::Int32(1), Value::Boolean(true)]),
                    Value::Struct(vec![Value::Int32(2), Value::Boolean(false)]),
                ],
            )],
            vec![Value::Array(
                "{sv}".into(),
                vec![
                    Value::DictEntry(
                        Box::new(Value::String("k1".into())),
                        Box::new(Value::Variant(Box::new(Value::UInt32(7)))),
                    ),
                    Value::DictEntry(
                        Box::new(Value::String("k2".into())),
                        Box::new(Value::Variant(Box::new(Value::Array(
                            "y".into(),
                            vec![Value::Byte(1), Value::Byte(2)],
                        )))),
                    ),
                ],
            )],
            vec![Value::Variant(Box::new(Value::Struct(vec![
                Value::String("deep".into()),
                Value::Array("ai".into(), vec![Value::Array("i".into(), vec![Value::Int32(3)])]),
            ])))],
        ];

        for body in cases {
            for v in [WireVersion::V1, WireVersion::V2] {
                let mut m = Message::new_signal("/t", "t.t", "T").unwrap();
                for val in &body {
                    m.append(val.clone()).unwrap();
                }
                m.seal(1, None).unwrap();
                let d = roundtrip(&m, v);
                assert_eq!(d.body_values(), &body[..], "format {v:?} body {body:?}");
            }
        }
    }

    #[test]
    fn remarshal_is_lossless() {
        let m = sample_call();
        let v1 = encode_message(&m, WireVersion::V1).unwrap();
        let d1 = decode_message(&v1, 0).unwrap();
        let v2 = encode_message(&d1, WireVersion::V2).unwrap();
        let d2 = decode_message(&v2, 0).unwrap();
        assert_eq!(d2.body_values(), m.body_values());
        assert_eq!(d2.cookie(), m.cookie());
        assert_eq!(d2.path(), m.path());
        assert_eq!(d2.member(), m.member());
        let v1_again = encode_message(&d2, WireVersion::V1).unwrap();
        assert_eq!(v1, v1_again);
    }

    #[test]
    fn truncated_prefixes_never_panic() {
        let m = sample_call();
        for v in [WireVersion::V1, WireVersion::V2] {
            let bytes = encode_message(&m, v).unwrap();
            for n in 0..bytes.len() {
                match peek_frame_len(&bytes[..n]) {
                    Ok(Some(total)) => {
                        // Frame length known but bytes missing: decode of the
                        // short slice must fail cleanly.
                        assert!(total > n);
                        assert!(decode_message(&bytes[..n], 0).is_err());
                    }
                    Ok(None) => {}
                    Err(_) => panic!("peek on a valid prefix must not error"),
                }
            }
        }
    }

    #[test]
    fn declared_size_larger_than_input_is_rejected() {
        let m = sample_call();
        let mut bytes = encode_message(&m, WireVersion::V2).unwrap();
        // Claim 10 extra body bytes that are not there.
        let decl = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
        bytes[16..20].copy_from_slice(&(decl + 10).to_le_bytes());
        assert!(decode_message(&bytes, 0).is_err());
    }

    #[test]
    fn trailing_garbage_is_rejected() {
        let m = sample_call();
        for v in [WireVersion::V1, WireVersion::V2] {
            let mut bytes = encode_message(&m, v).unwrap();
            bytes.push(0);
            assert!(decode_message(&bytes, 0).is_err());
        }
    }

    #[test]
    fn fd_count_must_match() {
        let mut m = Message::new_signal("/t", "t.t", "T").unwrap();
        m.seal(1, None).unwrap();
        let bytes = encode_message(&m, WireVersion::V1).unwrap();
        assert!(decode_message(&bytes, 0).is_ok());
        assert!(matches!(
            decode_message(&bytes, 2),
            Err(Error::FdCountMismatch { .. })
        ));
    }

    #[test]
    fn big_endian_roundtrip() {
        let mut m = Message::new_signal("/t", "t.t", "T").unwrap();
        m.endian = Endian::Big;
        m.append(0x01020304u32).unwrap();
        m.append("be").unwrap();
        m.seal(9, None).unwrap();
        for v in [WireVersion::V1, WireVersion::V2] {
            let bytes = encode_message(&m, v).unwrap();
            assert_eq!(bytes[0], b'B');
            let d = decode_message(&bytes, 0).unwrap();
            assert_eq!(d.body_values()[0], Value::UInt32(0x01020304));
            assert_eq!(d.body_values()[1], Value::String("be".into()));
        }
    }

    #[test]
    fn unknown_header_field_is_skipped() {
        let m = sample_call();
        let mut bytes = encode_message(&m, WireVersion::V2).unwrap();
        // Append a fabricated field (code 200, signature "u") to the field
        // block and fix up the declared size.
        let fields_len = u32::from_le_bytes(bytes[12..16].try_into().unwrap()) as usize;
        let extra = [200u8, 1, b'u', 0xde, 0xad, 0xbe, 0xef];
        let insert_at = HDR_V2_LEN + fields_len;
        for (i, b) in extra.iter().enumerate() {
            bytes.insert(insert_at + i, *b);
        }
        let new_len = (fields_len + extra.len()) as u32;
        bytes[12..16].copy_from_slice(&new_len.to_le_bytes());
        let d = decode_message(&bytes, 0).unwrap();
        assert_eq!(d.member(), Some("Frob"));
    }

    #[test]
    fn error_message_roundtrip() {
        let mut call = Message::new_method_call(None, "/o", Some("a.b"), "M").unwrap();
        call.set_sender(":1.1").unwrap();
        call.seal(5, None).unwrap();
        let mut reply =
            Message::new_method_error(&call, &BusError::new(name::UNKNOWN_METHOD, "nope"))
                .unwrap();
        reply.seal(6, None).unwrap();
        for v in [WireVersion::V1, WireVersion::V2] {
            let d = roundtrip(&reply, v);
            assert_eq!(d.reply_cookie(), Some(5));
            let e = d.as_bus_error().unwrap();
            assert_eq!(e.name, name::UNKNOWN_METHOD);
            assert_eq!(e.message, "nope");
        }
    }
}
