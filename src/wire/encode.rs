//! Serialization of messages and values.
//!
//! Container recursion is modeled as an explicit work stack so that deeply
//! nested payloads cost heap, not call stack. Array sizes that are only
//! known after the elements are written get patched in afterwards.

use crate::error::{Error, Result};
use crate::message::Message;
use crate::types::Value;

use super::{
    elem_alignment, field, pad_to, Endian, WireVersion, HDR_V1_LEN, HDR_V2_LEN, MAX_ARRAY_SIZE,
    MAX_CONTAINER_DEPTH, MAX_FDS, MAX_MESSAGE_SIZE,
};

struct Writer {
    buf: Vec<u8>,
    endian: Endian,
}

impl Writer {
    fn new(endian: Endian) -> Writer {
        Writer {
            buf: Vec::new(),
            endian,
        }
    }

    fn pos(&self) -> usize {
        self.buf.len()
    }

    fn pad(&mut self, align: usize) {
        let n = pad_to(self.buf.len(), align);
        self.buf.resize(self.buf.len() + n, 0);
    }

    fn put(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    fn u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    fn u16(&mut self, v: u16) {
        match self.endian {
            Endian::Little => self.put(&v.to_le_bytes()),
            Endian::Big => self.put(&v.to_be_bytes()),
        }
    }

    fn u32(&mut self, v: u32) {
        match self.endian {
            Endian::Little => self.put(&v.to_le_bytes()),
            Endian::Big => self.put(&v.to_be_bytes()),
        }
    }

    fn u64(&mut self, v: u64) {
        match self.endian {
            Endian::Little => self.put(&v.to_le_bytes()),
            Endian::Big => self.put(&v.to_be_bytes()),
        }
    }

    fn patch_u32(&mut self, at: usize, v: u32) {
        let b = match self.endian {
            Endian::Little => v.to_le_bytes(),
            Endian::Big => v.to_be_bytes(),
        };
        self.buf[at..at + 4].copy_from_slice(&b);
    }
}

fn bump_depth(depth: &mut usize) -> Result<()> {
    *depth += 1;
    if *depth > MAX_CONTAINER_DEPTH {
        return Err(Error::DepthExceeded(MAX_CONTAINER_DEPTH));
    }
    Ok(())
}

fn array_too_big(len: usize) -> Result<()> {
    if len > MAX_ARRAY_SIZE {
        return Err(Error::Protocol(format!(
            "array of {len} bytes exceeds the {MAX_ARRAY_SIZE} byte limit"
        )));
    }
    Ok(())
}

enum WorkV1<'a> {
    Val(&'a Value),
    /// Close a struct, dict entry or variant.
    Close,
    /// Close an array: patch its byte length.
    CloseArray { len_at: usize, data_start: usize },
}

fn encode_values_v1(w: &mut Writer, values: &[Value]) -> Result<()> {
    let mut stack: Vec<WorkV1<'_>> = values.iter().rev().map(WorkV1::Val).collect();
    let mut depth = 0usize;
    while let Some(work) = stack.pop() {
        let v = match work {
            WorkV1::Val(v) => v,
            WorkV1::Close => {
                depth -= 1;
                continue;
            }
            WorkV1::CloseArray { len_at, data_start } => {
                let len = w.pos() - data_start;
                array_too_big(len)?;
                w.patch_u32(len_at, len as u32);
                depth -= 1;
                continue;
            }
        };
        match v {
            Value::Byte(b) => w.u8(*b),
            Value::Boolean(b) => {
                w.pad(4);
                w.u32(*b as u32);
            }
            Value::Int16(n) => {
                w.pad(2);
                w.u16(*n as u16);
            }
            Value::UInt16(n) => {
                w.pad(2);
                w.u16(*n);
            }
            Value::Int32(n) => {
                w.pad(4);
                w.u32(*n as u32);
            }
            Value::UInt32(n) => {
                w.pad(4);
                w.u32(*n);
            }
            Value::Int64(n) => {
                w.pad(8);
                w.u64(*n as u64);
            }
            Value::UInt64(n) => {
                w.pad(8);
                w.u64(*n);
            }
            Value::Double(d) => {
                w.pad(8);
                w.u64(d.to_bits());
            }
            Value::UnixFd(idx) => {
                w.pad(4);
                w.u32(*idx);
            }
            Value::String(s) | Value::ObjectPath(s) => {
                w.pad(4);
                w.u32(s.len() as u32);
                w.put(s.as_bytes());
                w.u8(0);
            }
            Value::Signature(s) => {
                w.u8(s.len() as u8);
                w.put(s.as_bytes());
                w.u8(0);
            }
            Value::Array(elem, items) => {
                w.pad(4);
                let len_at = w.pos();
                w.u32(0);
                // Padding to the element alignment belongs to the array but
                // not to its declared length, even when it stays empty.
                w.pad(elem_alignment(elem));
                let data_start = w.pos();
                bump_depth(&mut depth)?;
                stack.push(WorkV1::CloseArray { len_at, data_start });
                for it in items.iter().rev() {
                    stack.push(WorkV1::Val(it));
                }
            }
            Value::Struct(fields) => {
                w.pad(8);
                bump_depth(&mut depth)?;
                stack.push(WorkV1::Close);
                for f in fields.iter().rev() {
                    stack.push(WorkV1::Val(f));
                }
            }
            Value::DictEntry(k, val) => {
                w.pad(8);
                bump_depth(&mut depth)?;
                stack.push(WorkV1::Close);
                stack.push(WorkV1::Val(val));
                stack.push(WorkV1::Val(k));
            }
            Value::Variant(inner) => {
                let sig = inner.signature();
                w.u8(sig.len() as u8);
                w.put(sig.as_bytes());
                w.u8(0);
                bump_depth(&mut depth)?;
                stack.push(WorkV1::Close);
                stack.push(WorkV1::Val(inner));
            }
        }
    }
    Ok(())
}

enum WorkV2<'a> {
    Val(&'a Value),
    Close,
    /// Close an array: verify its total size.
    CloseArray { data_start: usize },
    /// One array element finished: record its end offset in the table.
    Mark {
        table_at: usize,
        index: usize,
        data_start: usize,
    },
}

fn encode_values_v2(w: &mut Writer, values: &[Value]) -> Result<()> {
    let mut stack: Vec<WorkV2<'_>> = values.iter().rev().map(WorkV2::Val).collect();
    let mut depth = 0usize;
    while let Some(work) = stack.pop() {
        let v = match work {
            WorkV2::Val(v) => v,
            WorkV2::Close => {
                depth -= 1;
                continue;
            }
            WorkV2::CloseArray { data_start } => {
                array_too_big(w.pos() - data_start)?;
                depth -= 1;
                continue;
            }
            WorkV2::Mark {
                table_at,
                index,
                data_start,
            } => {
                w.patch_u32(table_at + 4 * index, (w.pos() - data_start) as u32);
                continue;
            }
        };
        match v {
            Value::Byte(b) => w.u8(*b),
            Value::Boolean(b) => w.u8(*b as u8),
            Value::Int16(n) => w.u16(*n as u16),
            Value::UInt16(n) => w.u16(*n),
            Value::Int32(n) => w.u32(*n as u32),
            Value::UInt32(n) => w.u32(*n),
            Value::Int64(n) => w.u64(*n as u64),
            Value::UInt64(n) => w.u64(*n),
            Value::Double(d) => w.u64(d.to_bits()),
            Value::UnixFd(idx) => w.u32(*idx),
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => {
                w.u32(s.len() as u32);
                w.put(s.as_bytes());
            }
            Value::Array(_, items) => {
                w.u32(items.len() as u32);
                let table_at = w.pos();
                for _ in items {
                    w.u32(0);
                }
                let data_start = w.pos();
                bump_depth(&mut depth)?;
                stack.push(WorkV2::CloseArray { data_start });
                for (i, it) in items.iter().enumerate().rev() {
                    stack.push(WorkV2::Mark {
                        table_at,
                        index: i,
                        data_start,
                    });
                    stack.push(WorkV2::Val(it));
                }
            }
            Value::Struct(fields) => {
                bump_depth(&mut depth)?;
                stack.push(WorkV2::Close);
                for f in fields.iter().rev() {
                    stack.push(WorkV2::Val(f));
                }
            }
            Value::DictEntry(k, val) => {
                bump_depth(&mut depth)?;
                stack.push(WorkV2::Close);
                stack.push(WorkV2::Val(val));
                stack.push(WorkV2::Val(k));
            }
            Value::Variant(inner) => {
                let sig = inner.signature();
                w.u8(sig.len() as u8);
                w.put(sig.as_bytes());
                bump_depth(&mut depth)?;
                stack.push(WorkV2::Close);
                stack.push(WorkV2::Val(inner));
            }
        }
    }
    Ok(())
}

fn header_fields(m: &Message, version: WireVersion) -> Result<Vec<(u8, Value)>> {
    let mut fields = Vec::new();
    if let Some(p) = &m.path {
        fields.push((field::PATH, Value::ObjectPath(p.clone())));
    }
    if let Some(i) = &m.interface {
        fields.push((field::INTERFACE, Value::String(i.clone())));
    }
    if let Some(mb) = &m.member {
        fields.push((field::MEMBER, Value::String(mb.clone())));
    }
    if let Some(e) = &m.error_name {
        fields.push((field::ERROR_NAME, Value::String(e.clone())));
    }
    if let Some(rc) = m.reply_cookie {
        let v = match version {
            WireVersion::V1 => {
                let rc = u32::try_from(rc)
                    .map_err(|_| Error::NotSupported("reply cookie exceeds the 32 bit header"))?;
                Value::UInt32(rc)
            }
            WireVersion::V2 => Value::UInt64(rc),
        };
        fields.push((field::REPLY_COOKIE, v));
    }
    if let Some(d) = &m.destination {
        fields.push((field::DESTINATION, Value::String(d.clone())));
    }
    if let Some(s) = &m.sender {
        fields.push((field::SENDER, Value::String(s.clone())));
    }
    let sig = m.signature();
    if !sig.is_empty() {
        fields.push((field::SIGNATURE, Value::Signature(sig)));
    }
    if !m.fds.is_empty() {
        fields.push((field::UNIX_FDS, Value::UInt32(m.fds.len() as u32)));
    }
    Ok(fields)
}

/// Serialize a sealed message in the requested sub-format.
pub fn encode_message(m: &Message, version: WireVersion) -> Result<Vec<u8>> {
    if !m.sealed {
        return Err(Error::NotSealed);
    }
    if m.fds.len() > MAX_FDS {
        return Err(Error::InvalidArgument(format!(
            "more than {MAX_FDS} file descriptors attached"
        )));
    }

    let mut body = Writer::new(m.endian);
    match version {
        WireVersion::V1 => encode_values_v1(&mut body, &m.body)?,
        WireVersion::V2 => encode_values_v2(&mut body, &m.body)?,
    }

    // Fields are wrapped in variants so unknown codes stay skippable. The
    // v1 block is encoded relative to an 8-aligned start.
    let mut fw = Writer::new(m.endian);
    for (code, value) in header_fields(m, version)? {
        let wrapped = Value::Variant(Box::new(value));
        match version {
            WireVersion::V1 => {
                fw.pad(8);
                fw.u8(code);
                encode_values_v1(&mut fw, std::slice::from_ref(&wrapped))?;
            }
            WireVersion::V2 => {
                fw.u8(code);
                encode_values_v2(&mut fw, std::slice::from_ref(&wrapped))?;
            }
        }
    }

    let mut out = Writer::new(m.endian);
    out.u8(m.endian.tag());
    out.u8(m.mtype as u8);
    out.u8(m.flags.bits());
    out.u8(version.as_byte());
    match version {
        WireVersion::V1 => {
            let cookie = u32::try_from(m.cookie)
                .map_err(|_| Error::NotSupported("cookie exceeds the 32 bit header"))?;
            out.u32(body.pos() as u32);
            out.u32(cookie);
            out.u32(fw.pos() as u32);
            debug_assert_eq!(out.pos(), HDR_V1_LEN);
            out.put(&fw.buf);
            out.pad(8);
            out.put(&body.buf);
        }
        WireVersion::V2 => {
            out.u64(m.cookie);
            out.u32(fw.pos() as u32);
            out.u32(body.pos() as u32);
            debug_assert_eq!(out.pos(), HDR_V2_LEN);
            out.put(&fw.buf);
            out.put(&body.buf);
        }
    }
    if out.pos() > MAX_MESSAGE_SIZE {
        return Err(Error::Protocol(format!(
            "message of {} bytes exceeds the {MAX_MESSAGE_SIZE} byte limit",
            out.pos()
        )));
    }
    Ok(out.buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;

    #[test]
    fn unsealed_messages_do_not_encode() {
        let m = Message::new_signal("/t", "t.t", "T").unwrap();
        assert!(matches!(
            encode_message(&m, WireVersion::V1),
            Err(Error::NotSealed)
        ));
    }

    #[test]
    fn v1_pads_and_terminates_strings() {
        let mut w = Writer::new(Endian::Little);
        encode_values_v1(&mut w, &[Value::Byte(7), Value::String("ab".into())]).unwrap();
        // byte, pad to 4, length 2, "ab", NUL
        assert_eq!(w.buf, vec![7, 0, 0, 0, 2, 0, 0, 0, b'a', b'b', 0]);
    }

    #[test]
    fn v2_is_packed() {
        let mut w = Writer::new(Endian::Little);
        encode_values_v2(&mut w, &[Value::Byte(7), Value::String("ab".into())]).unwrap();
        assert_eq!(w.buf, vec![7, 2, 0, 0, 0, b'a', b'b']);
    }

    #[test]
    fn v1_empty_array_keeps_element_padding() {
        let mut w = Writer::new(Endian::Little);
        encode_values_v1(&mut w, &[Value::Array("t".into(), vec![])]).unwrap();
        // length 0, then pad up to the 8-alignment of t
        assert_eq!(w.buf, vec![0, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn v2_array_offset_table() {
        let mut w = Writer::new(Endian::Little);
        encode_values_v2(
            &mut w,
            &[Value::Array(
                "s".into(),
                vec![Value::String("a".into()), Value::String("bc".into())],
            )],
        )
        .unwrap();
        let mut expect = vec![2, 0, 0, 0]; // count
        expect.extend_from_slice(&[5, 0, 0, 0]); // end of "a" element
        expect.extend_from_slice(&[11, 0, 0, 0]); // end of "bc" element
        expect.extend_from_slice(&[1, 0, 0, 0, b'a']);
        expect.extend_from_slice(&[2, 0, 0, 0, b'b', b'c']);
        assert_eq!(w.buf, expect);
    }

    #[test]
    fn nesting_ceiling_is_enforced() {
        let mut v = Value::Byte(0);
        for _ in 0..(MAX_CONTAINER_DEPTH + 1) {
            v = Value::Variant(Box::new(v));
        }
        let mut w = Writer::new(Endian::Little);
        assert!(matches!(
            encode_values_v2(&mut w, std::slice::from_ref(&v)),
            Err(Error::DepthExceeded(_))
        ));
    }

    #[test]
    fn wide_cookie_cannot_downgrade_to_v1() {
        let mut m = Message::new_signal("/t", "t.t", "T").unwrap();
        m.seal(u64::from(u32::MAX) + 1, None).unwrap();
        assert!(matches!(
            encode_message(&m, WireVersion::V1),
            Err(Error::NotSupported(_))
        ));
        assert!(encode_message(&m, WireVersion::V2).is_ok());
    }
}
