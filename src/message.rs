//! Bus messages: the unit of exchange between peers.
//!
//! A message is built incrementally through the append API, sealed exactly
//! once (which fixes its cookie), and from then on immutable. Incoming
//! messages arrive sealed; their body is traversed with a [`BodyCursor`].

use std::os::fd::OwnedFd;
use std::time::Duration;

use bitflags::bitflags;

use crate::error::{BusError, Error, Result};
use crate::types::{
    interface_name_is_valid, member_name_is_valid, object_path_is_valid, signature_of,
    validate_signature, Value,
};
use crate::wire::Endian;

/// Sender/path/interface used for messages the runtime synthesizes locally.
pub const LOCAL_SENDER: &str = "org.freedesktop.DBus.Local";
pub const LOCAL_PATH: &str = "/org/freedesktop/DBus/Local";
pub const LOCAL_INTERFACE: &str = "org.freedesktop.DBus.Local";

/// Cookie value carried by locally synthesized messages. Real cookies are
/// monotonic and never zero.
pub const SYNTHETIC_COOKIE: u64 = 0;

/// Kind of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    MethodCall = 1,
    MethodReturn = 2,
    MethodError = 3,
    Signal = 4,
}

impl MessageType {
    pub fn from_u8(v: u8) -> Option<MessageType> {
        Some(match v {
            1 => MessageType::MethodCall,
            2 => MessageType::MethodReturn,
            3 => MessageType::MethodError,
            4 => MessageType::Signal,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MessageType::MethodCall => "method_call",
            MessageType::MethodReturn => "method_return",
            MessageType::MethodError => "error",
            MessageType::Signal => "signal",
        }
    }

    pub fn from_str(s: &str) -> Option<MessageType> {
        Some(match s {
            "method_call" => MessageType::MethodCall,
            "method_return" => MessageType::MethodReturn,
            "error" => MessageType::MethodError,
            "signal" => MessageType::Signal,
            _ => return None,
        })
    }

    /// Replies correlate back to a call.
    pub fn is_reply(self) -> bool {
        matches!(self, MessageType::MethodReturn | MessageType::MethodError)
    }
}

bitflags! {
    /// Header flag bitset.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct MessageFlags: u8 {
        const NO_REPLY_EXPECTED = 1;
        const NO_AUTO_START = 2;
        const ALLOW_INTERACTIVE_AUTHORIZATION = 4;
    }
}

/// One request, reply, error or signal.
#[derive(Debug)]
pub struct Message {
    pub(crate) mtype: MessageType,
    pub(crate) flags: MessageFlags,
    pub(crate) endian: Endian,
    pub(crate) cookie: u64,
    pub(crate) reply_cookie: Option<u64>,
    pub(crate) path: Option<String>,
    pub(crate) interface: Option<String>,
    pub(crate) member: Option<String>,
    pub(crate) error_name: Option<String>,
    pub(crate) destination: Option<String>,
    pub(crate) sender: Option<String>,
    pub(crate) body: Vec<Value>,
    pub(crate) fds: Vec<OwnedFd>,
    pub(crate) sealed: bool,
    /// Relative timeout recorded at seal time; consumed by the correlator.
    pub(crate) timeout: Option<Duration>,
}

impl Message {
    fn empty(mtype: MessageType) -> Message {
        Message {
            mtype,
            flags: MessageFlags::default(),
            endian: Endian::native(),
            cookie: 0,
            reply_cookie: None,
            path: None,
            interface: None,
            member: None,
            error_name: None,
            destination: None,
            sender: None,
            body: Vec::new(),
            fds: Vec::new(),
            sealed: false,
            timeout: None,
        }
    }

    /// Create a method call addressed to `destination`.
    pub fn new_method_call(
        destination: Option<&str>,
        path: &str,
        interface: Option<&str>,
        member: &str,
    ) -> Result<Message> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("bad object path {path:?}")));
        }
        if !member_name_is_valid(member) {
            return Err(Error::InvalidArgument(format!("bad member name {member:?}")));
        }
        if let Some(i) = interface {
            if !interface_name_is_valid(i) {
                return Err(Error::InvalidArgument(format!("bad interface {i:?}")));
            }
        }
        let mut m = Message::empty(MessageType::MethodCall);
        m.destination = destination.map(str::to_owned);
        m.path = Some(path.to_owned());
        m.interface = interface.map(str::to_owned);
        m.member = Some(member.to_owned());
        Ok(m)
    }

    /// Create a broadcast signal.
    pub fn new_signal(path: &str, interface: &str, member: &str) -> Result<Message> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("bad object path {path:?}")));
        }
        if !interface_name_is_valid(interface) {
            return Err(Error::InvalidArgument(format!("bad interface {interface:?}")));
        }
        if !member_name_is_valid(member) {
            return Err(Error::InvalidArgument(format!("bad member name {member:?}")));
        }
        let mut m = Message::empty(MessageType::Signal);
        m.path = Some(path.to_owned());
        m.interface = Some(interface.to_owned());
        m.member = Some(member.to_owned());
        Ok(m)
    }

    /// Create the successful reply to `call`.
    pub fn new_method_return(call: &Message) -> Result<Message> {
        if call.mtype != MessageType::MethodCall {
            return Err(Error::InvalidArgument("reply to a non-call".into()));
        }
        if call.cookie == 0 {
            return Err(Error::NotSealed);
        }
        let mut m = Message::empty(MessageType::MethodReturn);
        m.reply_cookie = Some(call.cookie);
        m.destination = call.sender.clone();
        Ok(m)
    }

    /// Create the error reply to `call`. The error message text becomes the
    /// first body argument, as peers expect.
    pub fn new_method_error(call: &Message, error: &BusError) -> Result<Message> {
        if call.mtype != MessageType::MethodCall {
            return Err(Error::InvalidArgument("error reply to a non-call".into()));
        }
        if call.cookie == 0 {
            return Err(Error::NotSealed);
        }
        let mut m = Message::empty(MessageType::MethodError);
        m.reply_cookie = Some(call.cookie);
        m.destination = call.sender.clone();
        m.error_name = Some(error.name.clone().into_owned());
        if !error.message.is_empty() {
            m.body.push(Value::String(error.message.clone().into_owned()));
        }
        Ok(m)
    }

    /// Synthesize an error reply correlated to `reply_cookie`, as if the
    /// peer had sent it. Used for timeouts and connection teardown.
    pub(crate) fn new_synthetic_error(reply_cookie: u64, error: &BusError) -> Message {
        let mut m = Message::empty(MessageType::MethodError);
        m.reply_cookie = Some(reply_cookie);
        m.sender = Some(LOCAL_SENDER.to_owned());
        m.error_name = Some(error.name.clone().into_owned());
        if !error.message.is_empty() {
            m.body.push(Value::String(error.message.clone().into_owned()));
        }
        m.seal_synthetic();
        m
    }

    /// Synthesize the local Connected/Disconnected signal.
    pub(crate) fn new_local_signal(member: &str) -> Message {
        let mut m = Message::empty(MessageType::Signal);
        m.path = Some(LOCAL_PATH.to_owned());
        m.interface = Some(LOCAL_INTERFACE.to_owned());
        m.member = Some(member.to_owned());
        m.sender = Some(LOCAL_SENDER.to_owned());
        m.seal_synthetic();
        m
    }

    // --- accessors ---

    pub fn message_type(&self) -> MessageType {
        self.mtype
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn cookie(&self) -> u64 {
        self.cookie
    }

    pub fn reply_cookie(&self) -> Option<u64> {
        self.reply_cookie
    }

    pub fn path(&self) -> Option<&str> {
        self.path.as_deref()
    }

    pub fn interface(&self) -> Option<&str> {
        self.interface.as_deref()
    }

    pub fn member(&self) -> Option<&str> {
        self.member.as_deref()
    }

    pub fn error_name(&self) -> Option<&str> {
        self.error_name.as_deref()
    }

    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    pub fn sender(&self) -> Option<&str> {
        self.sender.as_deref()
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed
    }

    /// Signature of the body, e.g. `"sa{sv}"`.
    pub fn signature(&self) -> String {
        signature_of(&self.body)
    }

    /// Number of attached file descriptors.
    pub fn fd_count(&self) -> usize {
        self.fds.len()
    }

    /// The error carried by a `MethodError` message.
    pub fn as_bus_error(&self) -> Option<BusError> {
        if self.mtype != MessageType::MethodError {
            return None;
        }
        let name = self.error_name.clone().unwrap_or_default();
        let text = self
            .body
            .first()
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        Some(BusError::new(name, text))
    }

    /// True if this message matches the local-loop signal identity.
    pub fn is_local(&self) -> bool {
        self.sender.as_deref() == Some(LOCAL_SENDER)
    }

    // --- mutation (unsealed only) ---

    pub fn set_flags(&mut self, flags: MessageFlags) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        self.flags = flags;
        Ok(())
    }

    pub fn set_destination(&mut self, destination: &str) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        self.destination = Some(destination.to_owned());
        Ok(())
    }

    /// Stamp the sender name, as a bus does before forwarding a message.
    pub fn set_sender(&mut self, sender: &str) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        self.sender = Some(sender.to_owned());
        Ok(())
    }

    /// Append one body value.
    pub fn append(&mut self, value: impl Into<Value>) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        let value = value.into();
        validate_signature(&value.signature())?;
        self.body.push(value);
        Ok(())
    }

    /// Append several body values at once.
    pub fn append_all<I>(&mut self, values: I) -> Result<()>
    where
        I: IntoIterator,
        I::Item: Into<Value>,
    {
        for v in values {
            self.append(v)?;
        }
        Ok(())
    }

    /// Attach a file descriptor, appending the `h` handle referencing it.
    pub fn append_fd(&mut self, fd: OwnedFd) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        let index = self.fds.len() as u32;
        self.fds.push(fd);
        self.body.push(Value::UnixFd(index));
        Ok(())
    }

    /// Seal the message with its final cookie. Sealing twice is a
    /// programming error and does not touch the message.
    pub fn seal(&mut self, cookie: u64, timeout: Option<Duration>) -> Result<()> {
        if self.sealed {
            return Err(Error::Sealed);
        }
        if cookie == 0 {
            return Err(Error::InvalidArgument("cookie must not be zero".into()));
        }
        self.check_complete()?;
        self.cookie = cookie;
        self.timeout = timeout;
        self.sealed = true;
        Ok(())
    }

    fn seal_synthetic(&mut self) {
        self.cookie = SYNTHETIC_COOKIE;
        self.sealed = true;
    }

    fn check_complete(&self) -> Result<()> {
        let missing = |what: &str| {
            Error::InvalidArgument(format!("{} message without {what}", self.mtype.as_str()))
        };
        match self.mtype {
            MessageType::MethodCall => {
                if self.path.is_none() {
                    return Err(missing("path"));
                }
                if self.member.is_none() {
                    return Err(missing("member"));
                }
            }
            MessageType::MethodReturn => {
                if self.reply_cookie.is_none() {
                    return Err(missing("reply cookie"));
                }
            }
            MessageType::MethodError => {
                if self.reply_cookie.is_none() {
                    return Err(missing("reply cookie"));
                }
                if self.error_name.is_none() {
                    return Err(missing("error name"));
                }
            }
            MessageType::Signal => {
                if self.path.is_none() || self.interface.is_none() || self.member.is_none() {
                    return Err(missing("path/interface/member"));
                }
            }
        }
        Ok(())
    }

    /// Read-side cursor positioned at the first body value.
    pub fn body(&self) -> BodyCursor<'_> {
        BodyCursor::new(&self.body)
    }

    /// The raw body values.
    pub fn body_values(&self) -> &[Value] {
        &self.body
    }

    /// String argument at `index`, if the body has one there. Used by
    /// argument matching.
    pub(crate) fn string_arg(&self, index: usize) -> Option<&str> {
        self.body.get(index).and_then(Value::as_str)
    }
}

/// Traverses a message body, entering and exiting nested containers.
///
/// The cursor holds an explicit frame stack; `rewind` returns to the first
/// top-level value.
pub struct BodyCursor<'m> {
    root: &'m [Value],
    stack: Vec<Frame<'m>>,
}

struct Frame<'m> {
    values: &'m [Value],
    index: usize,
}

impl<'m> BodyCursor<'m> {
    fn new(root: &'m [Value]) -> Self {
        BodyCursor {
            root,
            stack: vec![Frame {
                values: root,
                index: 0,
            }],
        }
    }

    fn top(&mut self) -> &mut Frame<'m> {
        // The bottom frame is never popped.
        self.stack.last_mut().expect("cursor stack underflow")
    }

    /// Next value at the current level, advancing past it.
    pub fn next(&mut self) -> Option<&'m Value> {
        let frame = self.top();
        let v = frame.values.get(frame.index)?;
        frame.index += 1;
        Some(v)
    }

    /// Peek without advancing.
    pub fn peek(&self) -> Option<&'m Value> {
        let frame = self.stack.last()?;
        frame.values.get(frame.index)
    }

    /// Enter the container at the cursor; subsequent `next` calls yield its
    /// children.
    pub fn enter(&mut self) -> Result<()> {
        let frame = self.top();
        let v = frame
            .values
            .get(frame.index)
            .ok_or_else(|| Error::InvalidArgument("no container to enter".into()))?;
        let children: &'m [Value] = match v {
            Value::Array(_, items) => items,
            Value::Struct(fields) => fields,
            Value::Variant(inner) => std::slice::from_ref(inner),
            Value::DictEntry(..) => {
                return Err(Error::InvalidArgument(
                    "enter dict entries via their array".into(),
                ));
            }
            other => {
                return Err(Error::TypeMismatch {
                    expected: "container".into(),
                    actual: other.signature(),
                });
            }
        };
        self.stack.push(Frame {
            values: children,
            index: 0,
        });
        Ok(())
    }

    /// Leave the innermost container, stepping past it at the outer level.
    pub fn exit(&mut self) -> Result<()> {
        if self.stack.len() <= 1 {
            return Err(Error::InvalidArgument("not inside a container".into()));
        }
        self.stack.pop();
        self.top().index += 1;
        Ok(())
    }

    /// Reset to the first top-level value.
    pub fn rewind(&mut self) {
        self.stack.clear();
        self.stack.push(Frame {
            values: self.root,
            index: 0,
        });
    }

    fn expect<T>(&mut self, what: &str, f: impl Fn(&'m Value) -> Option<T>) -> Result<T> {
        match self.next() {
            Some(v) => f(v).ok_or_else(|| Error::TypeMismatch {
                expected: what.into(),
                actual: v.signature(),
            }),
            None => Err(Error::TypeMismatch {
                expected: what.into(),
                actual: "end of body".into(),
            }),
        }
    }

    pub fn read_str(&mut self) -> Result<&'m str> {
        self.expect("string", |v| match v {
            Value::String(s) | Value::ObjectPath(s) | Value::Signature(s) => Some(s.as_str()),
            _ => None,
        })
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        self.expect("u32", |v| match v {
            Value::UInt32(n) => Some(*n),
            _ => None,
        })
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        self.expect("i32", |v| match v {
            Value::Int32(n) => Some(*n),
            _ => None,
        })
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        self.expect("bool", |v| match v {
            Value::Boolean(b) => Some(*b),
            _ => None,
        })
    }

    pub fn read_byte(&mut self) -> Result<u8> {
        self.expect("byte", |v| match v {
            Value::Byte(b) => Some(*b),
            _ => None,
        })
    }
}

// Conversions so call sites can append plain Rust values.
impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Value::Byte(v)
    }
}
impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Boolean(v)
    }
}
impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Value::Int16(v)
    }
}
impl From<u16> for Value {
    fn from(v: u16) -> Self {
        Value::UInt16(v)
    }
}
impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int32(v)
    }
}
impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::UInt32(v)
    }
}
impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int64(v)
    }
}
impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Value::UInt64(v)
    }
}
impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}
impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}
impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::name;

    #[test]
    fn call_requires_path_and_member() {
        assert!(Message::new_method_call(None, "no-slash", None, "Ping").is_err());
        assert!(Message::new_method_call(None, "/x", None, "bad name").is_err());
        let m = Message::new_method_call(Some("org.example.Svc"), "/x", None, "Ping").unwrap();
        assert_eq!(m.message_type(), MessageType::MethodCall);
    }

    #[test]
    fn seal_is_one_shot() {
        let mut m = Message::new_signal("/a", "a.b", "Changed").unwrap();
        m.append(1u32).unwrap();
        m.seal(7, None).unwrap();
        assert_eq!(m.cookie(), 7);
        assert!(matches!(m.seal(8, None), Err(Error::Sealed)));
        assert!(matches!(m.append(2u32), Err(Error::Sealed)));
        assert_eq!(m.cookie(), 7);
    }

    #[test]
    fn seal_rejects_zero_cookie() {
        let mut m = Message::new_signal("/a", "a.b", "Changed").unwrap();
        assert!(m.seal(0, None).is_err());
        assert!(!m.is_sealed());
    }

    #[test]
    fn error_reply_carries_text_in_body() {
        let mut call = Message::new_method_call(None, "/a", Some("a.b"), "M").unwrap();
        call.sender = Some(":1.5".into());
        call.seal(3, None).unwrap();
        let e = BusError::new(name::ACCESS_DENIED, "not for you");
        let reply = Message::new_method_error(&call, &e).unwrap();
        assert_eq!(reply.reply_cookie(), Some(3));
        assert_eq!(reply.destination(), Some(":1.5"));
        assert_eq!(reply.as_bus_error().unwrap(), e);
    }

    #[test]
    fn synthetic_error_is_sealed_and_local() {
        let e = BusError::new(name::NO_REPLY, "Method call timed out");
        let m = Message::new_synthetic_error(42, &e);
        assert!(m.is_sealed());
        assert!(m.is_local());
        assert_eq!(m.cookie(), SYNTHETIC_COOKIE);
        assert_eq!(m.reply_cookie(), Some(42));
    }

    #[test]
    fn cursor_traverses_nested_containers() {
        let mut m = Message::new_signal("/a", "a.b", "S").unwrap();
        m.append(Value::String("head".into())).unwrap();
        m.append(Value::Array(
            "i".into(),
            vec![Value::Int32(1), Value::Int32(2)],
        ))
        .unwrap();
        m.append(Value::Struct(vec![
            Value::Boolean(true),
            Value::Variant(Box::new(Value::UInt32(9))),
        ]))
        .unwrap();

        let mut c = m.body();
        assert_eq!(c.read_str().unwrap(), "head");
        c.enter().unwrap();
        assert_eq!(c.read_i32().unwrap(), 1);
        assert_eq!(c.read_i32().unwrap(), 2);
        assert!(c.next().is_none());
        c.exit().unwrap();
        c.enter().unwrap();
        assert!(c.read_bool().unwrap());
        c.enter().unwrap();
        assert_eq!(c.read_u32().unwrap(), 9);
        c.exit().unwrap();
        c.exit().unwrap();
        assert!(c.next().is_none());

        c.rewind();
        assert_eq!(c.read_str().unwrap(), "head");
    }

    #[test]
    fn signature_reflects_body() {
        let mut m = Message::new_signal("/a", "a.b", "S").unwrap();
        m.append("s").unwrap();
        m.append(1i32).unwrap();
        m.append(2i32).unwrap();
        m.append(true).unwrap();
        m.append("tail").unwrap();
        assert_eq!(m.signature(), "siibs");
    }
}
