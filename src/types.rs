//! The bus type system: type codes, signatures and dynamic values.
//!
//! A signature is a string of type codes describing the body of a message,
//! e.g. `"sa{sv}"`. Values decoded from or appended to a message body are
//! held as a [`Value`] tree.

use std::fmt;

use crate::error::{Error, Result};

/// Maximum nesting of arrays and structs in one signature.
pub const MAX_SIGNATURE_DEPTH: usize = 64;
/// Maximum length of a signature string in bytes.
pub const MAX_SIGNATURE_LEN: usize = 255;

/// One basic or container type code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeCode {
    Byte,       // y
    Boolean,    // b
    Int16,      // n
    UInt16,     // q
    Int32,      // i
    UInt32,     // u
    Int64,      // x
    UInt64,     // t
    Double,     // d
    UnixFd,     // h
    String,     // s
    ObjectPath, // o
    Signature,  // g
    Array,      // a
    Struct,     // ( ... )
    DictEntry,  // { ... }
    Variant,    // v
}

impl TypeCode {
    pub fn from_char(c: char) -> Option<TypeCode> {
        Some(match c {
            'y' => TypeCode::Byte,
            'b' => TypeCode::Boolean,
            'n' => TypeCode::Int16,
            'q' => TypeCode::UInt16,
            'i' => TypeCode::Int32,
            'u' => TypeCode::UInt32,
            'x' => TypeCode::Int64,
            't' => TypeCode::UInt64,
            'd' => TypeCode::Double,
            'h' => TypeCode::UnixFd,
            's' => TypeCode::String,
            'o' => TypeCode::ObjectPath,
            'g' => TypeCode::Signature,
            'a' => TypeCode::Array,
            '(' => TypeCode::Struct,
            '{' => TypeCode::DictEntry,
            'v' => TypeCode::Variant,
            _ => return None,
        })
    }

    /// Alignment of this type in the byte-aligned wire sub-format.
    pub fn alignment(self) -> usize {
        match self {
            TypeCode::Byte | TypeCode::Signature | TypeCode::Variant => 1,
            TypeCode::Int16 | TypeCode::UInt16 => 2,
            TypeCode::Boolean
            | TypeCode::Int32
            | TypeCode::UInt32
            | TypeCode::UnixFd
            | TypeCode::String
            | TypeCode::ObjectPath
            | TypeCode::Array => 4,
            TypeCode::Int64
            | TypeCode::UInt64
            | TypeCode::Double
            | TypeCode::Struct
            | TypeCode::DictEntry => 8,
        }
    }

    pub fn is_basic(self) -> bool {
        !matches!(
            self,
            TypeCode::Array | TypeCode::Struct | TypeCode::DictEntry | TypeCode::Variant
        )
    }
}

fn bad(signature: &str, reason: &'static str) -> Error {
    Error::BadSignature {
        signature: signature.to_owned(),
        reason,
    }
}

/// Split off the first single complete type from `sig`, returning
/// `(first, rest)`. `sig` must be non-empty.
pub fn split_first_type(sig: &str) -> Result<(&str, &str)> {
    let n = first_type_len(sig.as_bytes(), 0)?;
    if n == 0 {
        return Err(bad(sig, "empty signature"));
    }
    Ok(sig.split_at(n))
}

fn first_type_len(sig: &[u8], depth: usize) -> Result<usize> {
    let full = std::str::from_utf8(sig).unwrap_or("");
    if depth > MAX_SIGNATURE_DEPTH {
        return Err(bad(full, "nesting too deep"));
    }
    let Some(&c) = sig.first() else {
        return Ok(0);
    };
    match c {
        b'a' => {
            let n = first_type_len(&sig[1..], depth + 1)?;
            if n == 0 {
                return Err(bad(full, "array missing element type"));
            }
            Ok(1 + n)
        }
        b'(' => {
            let mut i = 1;
            loop {
                if i >= sig.len() {
                    return Err(bad(full, "unterminated struct"));
                }
                if sig[i] == b')' {
                    if i == 1 {
                        return Err(bad(full, "empty struct"));
                    }
                    return Ok(i + 1);
                }
                let n = first_type_len(&sig[i..], depth + 1)?;
                if n == 0 {
                    return Err(bad(full, "unterminated struct"));
                }
                i += n;
            }
        }
        b'{' => {
            // dict entries are exactly two types, the first basic
            let k = first_type_len(&sig[1..], depth + 1)?;
            if k != 1 || !TypeCode::from_char(sig[1] as char).is_some_and(TypeCode::is_basic) {
                return Err(bad(full, "dict entry key must be a basic type"));
            }
            let v = first_type_len(&sig[1 + k..], depth + 1)?;
            if v == 0 {
                return Err(bad(full, "dict entry missing value type"));
            }
            let end = 1 + k + v;
            if sig.get(end) != Some(&b'}') {
                return Err(bad(full, "unterminated dict entry"));
            }
            Ok(end + 1)
        }
        _ => {
            if TypeCode::from_char(c as char).is_none() || c == b')' || c == b'}' {
                return Err(bad(full, "unknown type code"));
            }
            Ok(1)
        }
    }
}

/// Validate a full signature string (zero or more complete types).
pub fn validate_signature(sig: &str) -> Result<()> {
    if sig.len() > MAX_SIGNATURE_LEN {
        return Err(bad(sig, "signature too long"));
    }
    if !sig.is_ascii() {
        return Err(bad(sig, "signature not ASCII"));
    }
    let mut rest = sig;
    while !rest.is_empty() {
        let (_, r) = split_first_type(rest)?;
        rest = r;
    }
    Ok(())
}

/// True if `p` is a structurally valid object path.
pub fn object_path_is_valid(p: &str) -> bool {
    if p.is_empty() || !p.starts_with('/') {
        return false;
    }
    if p == "/" {
        return true;
    }
    if p.ends_with('/') {
        return false;
    }
    let mut last_was_slash = false;
    for c in p.chars() {
        match c {
            '/' => {
                if last_was_slash {
                    return false;
                }
                last_was_slash = true;
            }
            'a'..='z' | 'A'..='Z' | '0'..='9' | '_' => last_was_slash = false,
            _ => return false,
        }
    }
    true
}

/// True if `prefix` is `path` itself or an ancestor of it on a `/` boundary.
pub fn object_path_startswith(path: &str, prefix: &str) -> bool {
    if !object_path_is_valid(path) || !object_path_is_valid(prefix) {
        return false;
    }
    if prefix == "/" {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

/// True if `name` is a valid interface (or error) name.
pub fn interface_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let mut dots = 0;
    for part in name.split('.') {
        let mut chars = part.chars();
        match chars.next() {
            Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
            _ => return false,
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return false;
        }
        dots += 1;
    }
    dots >= 2
}

/// True if `name` is a valid member (method/signal) name.
pub fn member_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// True if `name` is a valid bus name (unique or well-known).
pub fn service_name_is_valid(name: &str) -> bool {
    if name.is_empty() || name.len() > 255 {
        return false;
    }
    let unique = name.starts_with(':');
    let body = if unique { &name[1..] } else { name };
    let mut parts = 0;
    for part in body.split('.') {
        if part.is_empty() {
            return false;
        }
        for (i, c) in part.chars().enumerate() {
            let ok = c.is_ascii_alphanumeric() || c == '_' || c == '-';
            if !ok {
                return false;
            }
            if i == 0 && c.is_ascii_digit() && !unique {
                return false;
            }
        }
        parts += 1;
    }
    parts >= 2
}

/// A dynamically typed body value.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Byte(u8),
    Boolean(bool),
    Int16(i16),
    UInt16(u16),
    Int32(i32),
    UInt32(u32),
    Int64(i64),
    UInt64(u64),
    Double(f64),
    /// Index into the message's out-of-band descriptor list.
    UnixFd(u32),
    String(String),
    ObjectPath(String),
    Signature(String),
    /// Homogeneous array; the signature of the element type is kept so that
    /// empty arrays stay typed.
    Array(String, Vec<Value>),
    Struct(Vec<Value>),
    /// Key/value pair inside an `a{..}` array.
    DictEntry(Box<Value>, Box<Value>),
    Variant(Box<Value>),
}

impl Value {
    pub fn type_code(&self) -> TypeCode {
        match self {
            Value::Byte(_) => TypeCode::Byte,
            Value::Boolean(_) => TypeCode::Boolean,
            Value::Int16(_) => TypeCode::Int16,
            Value::UInt16(_) => TypeCode::UInt16,
            Value::Int32(_) => TypeCode::Int32,
            Value::UInt32(_) => TypeCode::UInt32,
            Value::Int64(_) => TypeCode::Int64,
            Value::UInt64(_) => TypeCode::UInt64,
            Value::Double(_) => TypeCode::Double,
            Value::UnixFd(_) => TypeCode::UnixFd,
            Value::String(_) => TypeCode::String,
            Value::ObjectPath(_) => TypeCode::ObjectPath,
            Value::Signature(_) => TypeCode::Signature,
            Value::Array(..) => TypeCode::Array,
            Value::Struct(_) => TypeCode::Struct,
            Value::DictEntry(..) => TypeCode::DictEntry,
            Value::Variant(_) => TypeCode::Variant,
        }
    }

    /// The single complete type describing this value.
    pub fn signature(&self) -> String {
        match self {
            Value::Byte(_) => "y".into(),
            Value::Boolean(_) => "b".into(),
            Value::Int16(_) => "n".into(),
            Value::UInt16(_) => "q".into(),
            Value::Int32(_) => "i".into(),
            Value::UInt32(_) => "u".into(),
            Value::Int64(_) => "x".into(),
            Value::UInt64(_) => "t".into(),
            Value::Double(_) => "d".into(),
            Value::UnixFd(_) => "h".into(),
            Value::String(_) => "s".into(),
            Value::ObjectPath(_) => "o".into(),
            Value::Signature(_) => "g".into(),
            Value::Array(elem, _) => format!("a{elem}"),
            Value::Struct(fields) => {
                let mut s = String::from("(");
                for f in fields {
                    s.push_str(&f.signature());
                }
                s.push(')');
                s
            }
            Value::DictEntry(k, v) => format!("{{{}{}}}", k.signature(), v.signature()),
            Value::Variant(_) => "v".into(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_u32(&self) -> Option<u32> {
        match self {
            Value::UInt32(v) => Some(*v),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => {
                write!(f, "{s:?}")
            }
            Value::Byte(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Int16(v) => write!(f, "{v}"),
            Value::UInt16(v) => write!(f, "{v}"),
            Value::Int32(v) => write!(f, "{v}"),
            Value::UInt32(v) => write!(f, "{v}"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::UInt64(v) => write!(f, "{v}"),
            Value::Double(v) => write!(f, "{v}"),
            Value::UnixFd(v) => write!(f, "fd#{v}"),
            Value::Array(_, items) => {
                write!(f, "[")?;
                for (i, v) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "]")
            }
            Value::Struct(fields) => {
                write!(f, "(")?;
                for (i, v) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
            Value::DictEntry(k, v) => write!(f, "{k}: {v}"),
            Value::Variant(v) => write!(f, "<{v}>"),
        }
    }
}

/// Compute the joint signature of a value slice.
pub fn signature_of(values: &[Value]) -> String {
    values.iter().map(Value::signature).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_signatures() {
        for sig in ["", "y", "sii", "a{sv}", "a(ii)", "aas", "v", "(a{sv}x)", "h"] {
            validate_signature(sig).unwrap_or_else(|e| panic!("{sig}: {e}"));
        }
    }

    #[test]
    fn invalid_signatures() {
        for sig in ["z", "(", "()", "a", "aa", "(ia", "ia", "{sv}", "a{vs}", "(s", "{s}", "r"] {
            assert!(validate_signature(sig).is_err(), "{sig} should be invalid");
        }
    }

    #[test]
    fn signature_depth_ceiling() {
        let deep = "a".repeat(MAX_SIGNATURE_DEPTH + 1) + "y";
        assert!(validate_signature(&deep).is_err());
        let ok = "a".repeat(32) + "y";
        validate_signature(&ok).unwrap();
    }

    #[test]
    fn split_first() {
        let (t, rest) = split_first_type("a{sv}ix").unwrap();
        assert_eq!(t, "a{sv}");
        assert_eq!(rest, "ix");
        let (t, rest) = split_first_type("(ii)s").unwrap();
        assert_eq!(t, "(ii)");
        assert_eq!(rest, "s");
    }

    #[test]
    fn object_paths() {
        assert!(object_path_is_valid("/"));
        assert!(object_path_is_valid("/a/b_c/D9"));
        assert!(!object_path_is_valid(""));
        assert!(!object_path_is_valid("/a/"));
        assert!(!object_path_is_valid("/a//b"));
        assert!(!object_path_is_valid("a/b"));
        assert!(!object_path_is_valid("/a-b"));
    }

    #[test]
    fn path_prefix_boundaries() {
        assert!(object_path_startswith("/a/b", "/a"));
        assert!(object_path_startswith("/a/b", "/"));
        assert!(object_path_startswith("/a/b", "/a/b"));
        assert!(!object_path_startswith("/ab", "/a"));
        assert!(!object_path_startswith("/a", "/a/b"));
    }

    #[test]
    fn names() {
        assert!(interface_name_is_valid("org.freedesktop.DBus"));
        assert!(!interface_name_is_valid("nodots"));
        assert!(!interface_name_is_valid("org..x"));
        assert!(!interface_name_is_valid("org.1bad"));
        assert!(member_name_is_valid("Ping"));
        assert!(!member_name_is_valid("1Ping"));
        assert!(!member_name_is_valid("Pi-ng"));
        assert!(service_name_is_valid(":1.42"));
        assert!(service_name_is_valid("org.freedesktop.login1"));
        assert!(!service_name_is_valid("org"));
        assert!(!service_name_is_valid("org.4two"));
    }

    #[test]
    fn value_signatures() {
        let v = Value::Struct(vec![
            Value::String("hi".into()),
            Value::Int32(1),
            Value::Array("s".into(), vec![]),
        ]);
        assert_eq!(v.signature(), "(sias)");
        let d = Value::Array(
            "{sv}".into(),
            vec![Value::DictEntry(
                Box::new(Value::String("k".into())),
                Box::new(Value::Variant(Box::new(Value::UInt32(7)))),
            )],
        );
        assert_eq!(d.signature(), "a{sv}");
        assert_eq!(signature_of(&[Value::Byte(1), Value::Double(0.0)]), "yd");
    }
}
