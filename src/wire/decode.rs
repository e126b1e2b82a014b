//! Deserialization of messages and values.
//!
//! Every read is bounds-checked against the region being parsed and the
//! declared sizes in the header are verified against the bytes actually
//! supplied. Container recursion is an explicit frame stack with a fixed
//! nesting ceiling, so hostile input can neither overflow the call stack
//! nor read out of bounds.

use std::cmp::Ordering;

use crate::error::{Error, Result};
use crate::message::{Message, MessageFlags, MessageType};
use crate::types::{
    interface_name_is_valid, member_name_is_valid, object_path_is_valid, service_name_is_valid,
    split_first_type, validate_signature, Value,
};

use super::{
    elem_alignment, field, pad_to, protocol_err, Endian, WireVersion, HDR_V1_LEN, HDR_V2_LEN,
    MAX_ARRAY_SIZE, MAX_CONTAINER_DEPTH, MAX_FDS, MAX_MESSAGE_SIZE,
};

fn read_u32_at(buf: &[u8], at: usize, endian: Endian) -> u32 {
    let b = [buf[at], buf[at + 1], buf[at + 2], buf[at + 3]];
    match endian {
        Endian::Little => u32::from_le_bytes(b),
        Endian::Big => u32::from_be_bytes(b),
    }
}

/// Inspect the start of `buf` for a complete frame. Returns the total frame
/// length once the fixed header is available, `None` while more bytes are
/// needed, and an error if the bytes cannot start a valid message.
pub fn peek_frame_len(buf: &[u8]) -> Result<Option<usize>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let endian = Endian::from_tag(buf[0])
        .ok_or_else(|| protocol_err(format!("bad endianness tag {:#04x}", buf[0])))?;
    let version = WireVersion::from_byte(buf[3])
        .ok_or_else(|| protocol_err(format!("unsupported wire version {}", buf[3])))?;
    let total = match version {
        WireVersion::V1 => {
            if buf.len() < HDR_V1_LEN {
                return Ok(None);
            }
            let body = read_u32_at(buf, 4, endian) as usize;
            let fields = read_u32_at(buf, 12, endian) as usize;
            HDR_V1_LEN + fields + pad_to(HDR_V1_LEN + fields, 8) + body
        }
        WireVersion::V2 => {
            if buf.len() < HDR_V2_LEN {
                return Ok(None);
            }
            let fields = read_u32_at(buf, 12, endian) as usize;
            let body = read_u32_at(buf, 16, endian) as usize;
            HDR_V2_LEN + fields + body
        }
    };
    if total > MAX_MESSAGE_SIZE {
        return Err(protocol_err(format!(
            "message of {total} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit"
        )));
    }
    Ok(Some(total))
}

struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
    /// Reads past this offset fail; tightened per region.
    limit: usize,
    endian: Endian,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if n > self.limit - self.pos {
            return Err(protocol_err("value extends past its container"));
        }
        let s = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(s)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn u16(&mut self) -> Result<u16> {
        let b = self.take(2)?;
        let b = [b[0], b[1]];
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(b),
            Endian::Big => u16::from_be_bytes(b),
        })
    }

    fn u32(&mut self) -> Result<u32> {
        let b = self.take(4)?;
        let b = [b[0], b[1], b[2], b[3]];
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(b),
            Endian::Big => u32::from_be_bytes(b),
        })
    }

    fn u64(&mut self) -> Result<u64> {
        let b = self.take(8)?;
        let b = [b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]];
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(b),
            Endian::Big => u64::from_be_bytes(b),
        })
    }

    /// Skip alignment padding, which must be all zero bytes.
    fn align(&mut self, align: usize) -> Result<()> {
        let n = pad_to(self.pos, align);
        let pad = self.take(n)?;
        if pad.iter().any(|&b| b != 0) {
            return Err(protocol_err("non-zero alignment padding"));
        }
        Ok(())
    }

    fn str_bytes(&mut self, len: usize) -> Result<String> {
        let bytes = self.take(len)?;
        if bytes.contains(&0) {
            return Err(protocol_err("string contains an embedded NUL"));
        }
        let s = std::str::from_utf8(bytes).map_err(|_| protocol_err("string is not UTF-8"))?;
        Ok(s.to_owned())
    }
}

enum FrameKind {
    Root,
    Struct,
    Dict,
    Variant,
    ArrayV1 {
        elem_end: usize,
    },
    ArrayV2 {
        offsets: Vec<u32>,
        next: usize,
        data_start: usize,
    },
}

struct Frame {
    kind: FrameKind,
    /// Signature driving this level; the element signature for arrays.
    sig: String,
    idx: usize,
    out: Vec<Value>,
}

impl Frame {
    fn new(kind: FrameKind, sig: String) -> Frame {
        Frame {
            kind,
            sig,
            idx: 0,
            out: Vec::new(),
        }
    }
}

enum Step {
    Pop,
    Basic(u8),
    OpenArray(String),
    OpenStruct(String),
    OpenDict(String),
    OpenVariant,
}

fn classify(t: &str) -> Step {
    let bytes = t.as_bytes();
    match bytes[0] {
        b'a' => Step::OpenArray(t[1..].to_owned()),
        b'(' => Step::OpenStruct(t[1..t.len() - 1].to_owned()),
        b'{' => Step::OpenDict(t[1..t.len() - 1].to_owned()),
        b'v' => Step::OpenVariant,
        c => Step::Basic(c),
    }
}

fn decode_basic(r: &mut Reader<'_>, c: u8, version: WireVersion, fd_limit: u32) -> Result<Value> {
    let v1 = version == WireVersion::V1;
    Ok(match c {
        b'y' => Value::Byte(r.u8()?),
        b'b' => {
            let raw = if v1 {
                r.align(4)?;
                r.u32()?
            } else {
                u32::from(r.u8()?)
            };
            match raw {
                0 => Value::Boolean(false),
                1 => Value::Boolean(true),
                _ => return Err(protocol_err("boolean must be 0 or 1")),
            }
        }
        b'n' => {
            if v1 {
                r.align(2)?;
            }
            Value::Int16(r.u16()? as i16)
        }
        b'q' => {
            if v1 {
                r.align(2)?;
            }
            Value::UInt16(r.u16()?)
        }
        b'i' => {
            if v1 {
                r.align(4)?;
            }
            Value::Int32(r.u32()? as i32)
        }
        b'u' => {
            if v1 {
                r.align(4)?;
            }
            Value::UInt32(r.u32()?)
        }
        b'x' => {
            if v1 {
                r.align(8)?;
            }
            Value::Int64(r.u64()? as i64)
        }
        b't' => {
            if v1 {
                r.align(8)?;
            }
            Value::UInt64(r.u64()?)
        }
        b'd' => {
            if v1 {
                r.align(8)?;
            }
            Value::Double(f64::from_bits(r.u64()?))
        }
        b'h' => {
            if v1 {
                r.align(4)?;
            }
            let idx = r.u32()?;
            if idx >= fd_limit {
                return Err(protocol_err("fd handle index out of range"));
            }
            Value::UnixFd(idx)
        }
        b's' | b'o' => {
            if v1 {
                r.align(4)?;
            }
            let len = r.u32()? as usize;
            let s = r.str_bytes(len)?;
            if v1 && r.u8()? != 0 {
                return Err(protocol_err("string missing NUL terminator"));
            }
            if c == b'o' {
                if !object_path_is_valid(&s) {
                    return Err(protocol_err(format!("invalid object path {s:?}")));
                }
                Value::ObjectPath(s)
            } else {
                Value::String(s)
            }
        }
        b'g' => {
            let len = if v1 {
                usize::from(r.u8()?)
            } else {
                r.u32()? as usize
            };
            let s = r.str_bytes(len)?;
            if v1 && r.u8()? != 0 {
                return Err(protocol_err("signature missing NUL terminator"));
            }
            validate_signature(&s)?;
            Value::Signature(s)
        }
        other => {
            return Err(protocol_err(format!(
                "unexpected type code {:?}",
                other as char
            )))
        }
    })
}

/// Read a single-complete-type signature embedded in the stream (variants).
fn read_inline_signature(r: &mut Reader<'_>, version: WireVersion) -> Result<String> {
    let len = usize::from(r.u8()?);
    let s = r.str_bytes(len)?;
    if version == WireVersion::V1 && r.u8()? != 0 {
        return Err(protocol_err("signature missing NUL terminator"));
    }
    validate_signature(&s)?;
    let (t, rest) = split_first_type(&s)?;
    if t.is_empty() || !rest.is_empty() {
        return Err(protocol_err("variant signature must be one complete type"));
    }
    Ok(s)
}

/// Decode a sequence of values described by `sig`, consuming from `r`.
fn decode_values(
    r: &mut Reader<'_>,
    sig: &str,
    version: WireVersion,
    fd_limit: u32,
) -> Result<Vec<Value>> {
    let v1 = version == WireVersion::V1;
    let mut stack = vec![Frame::new(FrameKind::Root, sig.to_owned())];
    loop {
        let pre = {
            let frame = stack
                .last_mut()
                .ok_or_else(|| protocol_err("decoder state underflow"))?;
            let at_end = frame.idx >= frame.sig.len();
            match &mut frame.kind {
                FrameKind::ArrayV1 { elem_end } => {
                    if at_end {
                        frame.idx = 0;
                    }
                    match r.pos.cmp(elem_end) {
                        Ordering::Equal => Some(Step::Pop),
                        Ordering::Greater => {
                            return Err(protocol_err("array contents overran declared length"))
                        }
                        Ordering::Less => None,
                    }
                }
                FrameKind::ArrayV2 {
                    offsets,
                    next,
                    data_start,
                } => {
                    if at_end && frame.idx != 0 {
                        let want = *offsets
                            .get(*next)
                            .ok_or_else(|| protocol_err("array offset table overrun"))?;
                        if r.pos - *data_start != want as usize {
                            return Err(protocol_err("array offset table mismatch"));
                        }
                        *next += 1;
                        frame.idx = 0;
                    }
                    if *next == offsets.len() {
                        Some(Step::Pop)
                    } else {
                        None
                    }
                }
                _ => at_end.then_some(Step::Pop),
            }
        };

        let step = match pre {
            Some(s) => s,
            None => {
                let frame = stack
                    .last_mut()
                    .ok_or_else(|| protocol_err("decoder state underflow"))?;
                let (t, _) = split_first_type(&frame.sig[frame.idx..])?;
                let step = classify(t);
                frame.idx += t.len();
                step
            }
        };

        match step {
            Step::Pop => {
                let frame = stack
                    .pop()
                    .ok_or_else(|| protocol_err("decoder state underflow"))?;
                let value = match frame.kind {
                    FrameKind::Root => return Ok(frame.out),
                    FrameKind::Struct => Value::Struct(frame.out),
                    FrameKind::Dict => {
                        let mut it = frame.out.into_iter();
                        match (it.next(), it.next(), it.next()) {
                            (Some(k), Some(v), None) => {
                                Value::DictEntry(Box::new(k), Box::new(v))
                            }
                            _ => return Err(protocol_err("malformed dict entry")),
                        }
                    }
                    FrameKind::Variant => {
                        let mut out = frame.out;
                        match (out.pop(), out.pop()) {
                            (Some(v), None) => Value::Variant(Box::new(v)),
                            _ => return Err(protocol_err("malformed variant")),
                        }
                    }
                    FrameKind::ArrayV1 { .. } | FrameKind::ArrayV2 { .. } => {
                        Value::Array(frame.sig, frame.out)
                    }
                };
                stack
                    .last_mut()
                    .ok_or_else(|| protocol_err("container outside any frame"))?
                    .out
                    .push(value);
            }
            Step::Basic(c) => {
                let v = decode_basic(r, c, version, fd_limit)?;
                stack
                    .last_mut()
                    .ok_or_else(|| protocol_err("decoder state underflow"))?
                    .out
                    .push(v);
            }
            Step::OpenStruct(inner) => {
                if v1 {
                    r.align(8)?;
                }
                check_depth(&stack)?;
                stack.push(Frame::new(FrameKind::Struct, inner));
            }
            Step::OpenDict(inner) => {
                if v1 {
                    r.align(8)?;
                }
                check_depth(&stack)?;
                stack.push(Frame::new(FrameKind::Dict, inner));
            }
            Step::OpenArray(elem) => {
                check_depth(&stack)?;
                if v1 {
                    r.align(4)?;
                    let len = r.u32()? as usize;
                    if len > MAX_ARRAY_SIZE {
                        return Err(protocol_err(format!(
                            "array of {len} bytes exceeds the {MAX_ARRAY_SIZE} byte limit"
                        )));
                    }
                    r.align(elem_alignment(&elem))?;
                    let elem_end = r.pos + len;
                    if elem_end > r.limit {
                        return Err(protocol_err("array extends past its container"));
                    }
                    stack.push(Frame::new(FrameKind::ArrayV1 { elem_end }, elem));
                } else {
                    let count = r.u32()? as usize;
                    if count > (r.limit - r.pos) / 4 {
                        return Err(protocol_err("array count larger than remaining input"));
                    }
                    let mut offsets = Vec::with_capacity(count);
                    for _ in 0..count {
                        offsets.push(r.u32()?);
                    }
                    if let Some(&last) = offsets.last() {
                        if last as usize > MAX_ARRAY_SIZE {
                            return Err(protocol_err(format!(
                                "array of {last} bytes exceeds the {MAX_ARRAY_SIZE} byte limit"
                            )));
                        }
                    }
                    let data_start = r.pos;
                    stack.push(Frame::new(
                        FrameKind::ArrayV2 {
                            offsets,
                            next: 0,
                            data_start,
                        },
                        elem,
                    ));
                }
            }
            Step::OpenVariant => {
                check_depth(&stack)?;
                let vsig = read_inline_signature(r, version)?;
                stack.push(Frame::new(FrameKind::Variant, vsig));
            }
        }
    }
}

fn check_depth(stack: &[Frame]) -> Result<()> {
    // The root frame is not a container.
    if stack.len() > MAX_CONTAINER_DEPTH {
        return Err(Error::DepthExceeded(MAX_CONTAINER_DEPTH));
    }
    Ok(())
}

#[derive(Default)]
struct HeaderFields {
    path: Option<String>,
    interface: Option<String>,
    member: Option<String>,
    error_name: Option<String>,
    destination: Option<String>,
    sender: Option<String>,
    reply_cookie: Option<u64>,
    signature: Option<String>,
    unix_fds: Option<u32>,
}

fn set_once<T>(slot: &mut Option<T>, v: T) -> Result<()> {
    if slot.is_some() {
        return Err(protocol_err("duplicate header field"));
    }
    *slot = Some(v);
    Ok(())
}

fn field_type_err(code: u8) -> Error {
    protocol_err(format!("header field {code} has the wrong type"))
}

fn apply_field(h: &mut HeaderFields, code: u8, v: Value, version: WireVersion) -> Result<()> {
    match code {
        field::PATH => match v {
            // Path validity was checked when the value was decoded.
            Value::ObjectPath(p) => set_once(&mut h.path, p),
            _ => Err(field_type_err(code)),
        },
        field::INTERFACE => match v {
            Value::String(s) if interface_name_is_valid(&s) => set_once(&mut h.interface, s),
            _ => Err(field_type_err(code)),
        },
        field::MEMBER => match v {
            Value::String(s) if member_name_is_valid(&s) => set_once(&mut h.member, s),
            _ => Err(field_type_err(code)),
        },
        // Error names follow the interface grammar.
        field::ERROR_NAME => match v {
            Value::String(s) if interface_name_is_valid(&s) => set_once(&mut h.error_name, s),
            _ => Err(field_type_err(code)),
        },
        field::REPLY_COOKIE => {
            let rc = match (version, v) {
                (WireVersion::V1, Value::UInt32(n)) => u64::from(n),
                (WireVersion::V2, Value::UInt64(n)) => n,
                _ => return Err(field_type_err(code)),
            };
            if rc == 0 {
                return Err(protocol_err("reply cookie must not be zero"));
            }
            set_once(&mut h.reply_cookie, rc)
        }
        field::DESTINATION => match v {
            Value::String(s) if service_name_is_valid(&s) => set_once(&mut h.destination, s),
            _ => Err(field_type_err(code)),
        },
        field::SENDER => match v {
            Value::String(s) if service_name_is_valid(&s) => set_once(&mut h.sender, s),
            _ => Err(field_type_err(code)),
        },
        field::SIGNATURE => match v {
            Value::Signature(s) => set_once(&mut h.signature, s),
            _ => Err(field_type_err(code)),
        },
        field::UNIX_FDS => match v {
            Value::UInt32(n) => set_once(&mut h.unix_fds, n),
            _ => Err(field_type_err(code)),
        },
        // Forward compatibility: unknown fields are skipped. The variant
        // wrapper has already consumed their bytes.
        _ => Ok(()),
    }
}

fn required(cond: bool, what: &'static str) -> Result<()> {
    if cond {
        Ok(())
    } else {
        Err(protocol_err(format!("message is missing the {what} field")))
    }
}

/// Parse one complete frame into a message.
///
/// `buf` must hold exactly the frame, as delimited by [`peek_frame_len`].
/// `n_fds` is the number of descriptors that arrived out of band with this
/// frame; it is checked against the declared count. The caller attaches the
/// descriptors themselves afterwards.
pub fn decode_message(buf: &[u8], n_fds: usize) -> Result<Message> {
    let total = peek_frame_len(buf)?.ok_or_else(|| protocol_err("truncated fixed header"))?;
    if total != buf.len() {
        return Err(Error::SizeMismatch {
            declared: total,
            actual: buf.len(),
        });
    }

    let endian = Endian::from_tag(buf[0]).ok_or_else(|| protocol_err("bad endianness tag"))?;
    let mtype = MessageType::from_u8(buf[1])
        .ok_or_else(|| protocol_err(format!("unknown message type {}", buf[1])))?;
    // Unknown flag bits are ignored for forward compatibility.
    let flags = MessageFlags::from_bits_truncate(buf[2]);
    let version = WireVersion::from_byte(buf[3])
        .ok_or_else(|| protocol_err(format!("unsupported wire version {}", buf[3])))?;

    let mut r = Reader {
        buf,
        pos: 4,
        limit: buf.len(),
        endian,
    };
    let (cookie, fields_len, body_len, fields_start) = match version {
        WireVersion::V1 => {
            let body = r.u32()? as usize;
            let cookie = u64::from(r.u32()?);
            let fields = r.u32()? as usize;
            (cookie, fields, body, HDR_V1_LEN)
        }
        WireVersion::V2 => {
            let cookie = r.u64()?;
            let fields = r.u32()? as usize;
            let body = r.u32()? as usize;
            (cookie, fields, body, HDR_V2_LEN)
        }
    };
    if cookie == 0 {
        return Err(protocol_err("message cookie must not be zero"));
    }

    // Header fields, confined to their declared region.
    let fields_end = fields_start + fields_len;
    r.limit = fields_end;
    let mut h = HeaderFields::default();
    while r.pos < fields_end {
        if version == WireVersion::V1 {
            r.align(8)?;
        }
        let code = r.u8()?;
        let mut vals = decode_values(&mut r, "v", version, u32::MAX)?;
        let value = match vals.pop() {
            Some(Value::Variant(inner)) => *inner,
            _ => return Err(protocol_err("malformed header field variant")),
        };
        apply_field(&mut h, code, value, version)?;
    }

    // Body, confined likewise. In v1 it starts on the next 8 boundary.
    r.limit = buf.len();
    if version == WireVersion::V1 {
        r.align(8)?;
    }
    let body_start = r.pos;
    r.limit = body_start + body_len;

    let declared_fds = h.unix_fds.unwrap_or(0) as usize;
    if declared_fds > MAX_FDS {
        return Err(protocol_err(format!(
            "message declares more than {MAX_FDS} file descriptors"
        )));
    }
    if declared_fds != n_fds {
        return Err(Error::FdCountMismatch {
            declared: declared_fds,
            received: n_fds,
        });
    }

    let sig = h.signature.take().unwrap_or_default();
    if sig.is_empty() && body_len != 0 {
        return Err(protocol_err("non-empty body without a signature field"));
    }
    let fd_limit = if declared_fds == 0 {
        0
    } else {
        declared_fds as u32
    };
    let body = decode_values(&mut r, &sig, version, fd_limit)?;
    if r.pos != body_start + body_len {
        return Err(Error::SizeMismatch {
            declared: body_len,
            actual: r.pos - body_start,
        });
    }

    // Per-type completeness, mirroring what sealing enforces on the way out.
    match mtype {
        MessageType::MethodCall => {
            required(h.path.is_some(), "path")?;
            required(h.member.is_some(), "member")?;
        }
        MessageType::MethodReturn => required(h.reply_cookie.is_some(), "reply cookie")?,
        MessageType::MethodError => {
            required(h.reply_cookie.is_some(), "reply cookie")?;
            required(h.error_name.is_some(), "error name")?;
        }
        MessageType::Signal => {
            required(h.path.is_some(), "path")?;
            required(h.interface.is_some(), "interface")?;
            required(h.member.is_some(), "member")?;
        }
    }

    Ok(Message {
        mtype,
        flags,
        endian,
        cookie,
        reply_cookie: h.reply_cookie,
        path: h.path,
        interface: h.interface,
        member: h.member,
        error_name: h.error_name,
        destination: h.destination,
        sender: h.sender,
        body,
        fds: Vec::new(),
        sealed: true,
        timeout: None,
    })
}
