//! Bus address parsing.
//!
//! An address string is a `;`-separated list of transport elements, each of
//! the form `transport:key=value,key=value`. Values use `%XX` escapes for
//! bytes outside the unreserved set. Connecting walks the list in order and
//! uses the first element that works.

use std::env;
use std::path::PathBuf;

use crate::error::{Error, Result};

/// Fallback location of the system bus socket.
pub const DEFAULT_SYSTEM_SOCKET: &str = "/var/run/dbus/system_bus_socket";

/// Upper bound on `argvN` indices in an exec address.
const MAX_EXEC_ARGS: usize = 256;

/// Address family restriction for TCP elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TcpFamily {
    V4,
    V6,
}

/// One parsed transport element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    /// `unix:path=...` or `unix:abstract=...`
    Unix { path: PathBuf, abstract_ns: bool },
    /// `tcp:host=...,port=...,family=...`
    Tcp {
        host: String,
        port: u16,
        family: Option<TcpFamily>,
    },
    /// `unixexec:path=...,argv1=...` — speak the protocol over the stdio of
    /// a spawned child.
    Exec { path: PathBuf, argv: Vec<String> },
    /// `x-machine-unix:machine=...` or `x-machine-unix:pid=...` — the system
    /// bus of a container.
    Machine {
        machine: Option<String>,
        pid: Option<u32>,
    },
}

fn bad(offset: usize, reason: &'static str) -> Error {
    Error::BadAddress { offset, reason }
}

fn unhex(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Decode one `key=value` value. `base` is the value's offset in the full
/// address string, for error reporting.
fn percent_decode(raw: &str, base: usize) -> Result<String> {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let (hi, lo) = match (bytes.get(i + 1), bytes.get(i + 2)) {
                    (Some(&h), Some(&l)) => (unhex(h), unhex(l)),
                    _ => (None, None),
                };
                match (hi, lo) {
                    (Some(h), Some(l)) => {
                        out.push(h << 4 | l);
                        i += 3;
                    }
                    _ => return Err(bad(base + i, "incomplete % escape")),
                }
            }
            c if c.is_ascii_alphanumeric() || matches!(c, b'-' | b'_' | b'/' | b'.' | b'\\' | b'*') =>
            {
                out.push(c);
                i += 1;
            }
            _ => return Err(bad(base + i, "character must be % escaped")),
        }
    }
    String::from_utf8(out).map_err(|_| bad(base, "value is not UTF-8"))
}

/// Split one element into `(key, value)` pairs with their value offsets.
fn split_pairs(body: &str, base: usize) -> Result<Vec<(&str, &str, usize)>> {
    let mut pairs = Vec::new();
    let mut offset = base;
    for pair in body.split(',') {
        let Some(eq) = pair.find('=') else {
            return Err(bad(offset, "expected key=value"));
        };
        let (key, value) = (&pair[..eq], &pair[eq + 1..]);
        if key.is_empty() {
            return Err(bad(offset, "empty key"));
        }
        pairs.push((key, value, offset + eq + 1));
        offset += pair.len() + 1;
    }
    Ok(pairs)
}

fn parse_unix(body: &str, base: usize) -> Result<Address> {
    let mut path = None;
    let mut abstract_ns = false;
    for (key, value, at) in split_pairs(body, base)? {
        match key {
            "path" => {
                path = Some(percent_decode(value, at)?);
                abstract_ns = false;
            }
            "abstract" => {
                path = Some(percent_decode(value, at)?);
                abstract_ns = true;
            }
            // Unknown keys (and guid=) are accepted and ignored.
            _ => {}
        }
    }
    let path = path.ok_or_else(|| bad(base, "unix transport needs path= or abstract="))?;
    Ok(Address::Unix {
        path: PathBuf::from(path),
        abstract_ns,
    })
}

fn parse_tcp(body: &str, base: usize) -> Result<Address> {
    let mut host = None;
    let mut port = None;
    let mut family = None;
    for (key, value, at) in split_pairs(body, base)? {
        match key {
            "host" => host = Some(percent_decode(value, at)?),
            "port" => {
                let p: u16 = percent_decode(value, at)?
                    .parse()
                    .map_err(|_| bad(at, "port is not a number in 1..=65535"))?;
                if p == 0 {
                    return Err(bad(at, "port must not be zero"));
                }
                port = Some(p);
            }
            "family" => {
                family = Some(match percent_decode(value, at)?.as_str() {
                    "ipv4" => TcpFamily::V4,
                    "ipv6" => TcpFamily::V6,
                    _ => return Err(bad(at, "family must be ipv4 or ipv6")),
                });
            }
            _ => {}
        }
    }
    let host = host.ok_or_else(|| bad(base, "tcp transport needs host="))?;
    let port = port.ok_or_else(|| bad(base, "tcp transport needs port="))?;
    Ok(Address::Tcp { host, port, family })
}

fn parse_exec(body: &str, base: usize) -> Result<Address> {
    let mut path = None;
    // Indexed argv slots; holes other than argv0 are an error.
    let mut argv: Vec<Option<String>> = Vec::new();
    for (key, value, at) in split_pairs(body, base)? {
        if key == "path" {
            path = Some(percent_decode(value, at)?);
            continue;
        }
        if let Some(n) = key.strip_prefix("argv") {
            let n: usize = n.parse().map_err(|_| bad(at, "bad argv index"))?;
            if n >= MAX_EXEC_ARGS {
                return Err(bad(at, "argv index out of range"));
            }
            if argv.len() <= n {
                argv.resize(n + 1, None);
            }
            argv[n] = Some(percent_decode(value, at)?);
            continue;
        }
    }
    let path = path.ok_or_else(|| bad(base, "unixexec transport needs path="))?;
    // argv0 defaults to the executable path.
    if argv.is_empty() {
        argv.push(Some(path.clone()));
    } else if argv[0].is_none() {
        argv[0] = Some(path.clone());
    }
    let argv = argv
        .into_iter()
        .map(|a| a.ok_or_else(|| bad(base, "argv indices must be contiguous")))
        .collect::<Result<Vec<_>>>()?;
    Ok(Address::Exec {
        path: PathBuf::from(path),
        argv,
    })
}

fn parse_machine(body: &str, base: usize) -> Result<Address> {
    let mut machine = None;
    let mut pid = None;
    for (key, value, at) in split_pairs(body, base)? {
        match key {
            "machine" => machine = Some(percent_decode(value, at)?),
            "pid" => {
                let p: u32 = percent_decode(value, at)?
                    .parse()
                    .map_err(|_| bad(at, "pid is not a number"))?;
                if p == 0 {
                    return Err(bad(at, "pid must not be zero"));
                }
                pid = Some(p);
            }
            _ => {}
        }
    }
    if machine.is_some() == pid.is_some() {
        return Err(bad(base, "exactly one of machine= and pid= is required"));
    }
    Ok(Address::Machine { machine, pid })
}

/// Parse one `transport:...` element. `base` is its offset in the full
/// string.
fn parse_element(element: &str, base: usize) -> Result<Address> {
    let Some(colon) = element.find(':') else {
        return Err(bad(base, "expected transport:"));
    };
    let (transport, body) = (&element[..colon], &element[colon + 1..]);
    let body_base = base + colon + 1;
    match transport {
        "unix" => parse_unix(body, body_base),
        "tcp" => parse_tcp(body, body_base),
        "unixexec" => parse_exec(body, body_base),
        "x-machine-unix" => parse_machine(body, body_base),
        _ => Err(bad(base, "unknown transport")),
    }
}

/// An ordered list of transport elements to try.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressList {
    addrs: Vec<Address>,
}

impl AddressList {
    /// Parse a full address string. Every element must parse; an empty list
    /// is an error.
    pub fn parse(s: &str) -> Result<AddressList> {
        let mut addrs = Vec::new();
        let mut offset = 0;
        for element in s.split(';') {
            if !element.is_empty() {
                addrs.push(parse_element(element, offset)?);
            }
            offset += element.len() + 1;
        }
        if addrs.is_empty() {
            return Err(Error::NoAddresses);
        }
        Ok(AddressList { addrs })
    }

    pub fn iter(&self) -> impl Iterator<Item = &Address> {
        self.addrs.iter()
    }

    pub fn len(&self) -> usize {
        self.addrs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.addrs.is_empty()
    }
}

/// Where a connection should go when the caller names a well-known bus
/// rather than an address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    System,
    Session,
    /// The bus that activated us, falling back to the session bus.
    Starter,
}

/// Resolve the address string for a well-known bus from the environment.
pub fn bus_address(kind: BusKind) -> Result<String> {
    match kind {
        BusKind::System => Ok(env::var("DBUS_SYSTEM_BUS_ADDRESS")
            .unwrap_or_else(|_| format!("unix:path={DEFAULT_SYSTEM_SOCKET}"))),
        BusKind::Session => {
            if let Ok(a) = env::var("DBUS_SESSION_BUS_ADDRESS") {
                return Ok(a);
            }
            let runtime = env::var("XDG_RUNTIME_DIR").map_err(|_| Error::NoAddresses)?;
            Ok(format!("unix:path={}/bus", escape_value(&runtime)))
        }
        BusKind::Starter => {
            if let Ok(a) = env::var("DBUS_STARTER_ADDRESS") {
                return Ok(a);
            }
            match env::var("DBUS_STARTER_BUS_TYPE").as_deref() {
                Ok("system") => bus_address(BusKind::System),
                _ => bus_address(BusKind::Session),
            }
        }
    }
}

/// Escape a value for embedding in an address string.
pub fn escape_value(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for &b in s.as_bytes() {
        if b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'/' | b'.' | b'\\' | b'*') {
            out.push(b as char);
        } else {
            out.push_str(&format!("%{b:02x}"));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unix_path_and_abstract() {
        let l = AddressList::parse("unix:path=/run/bus").unwrap();
        assert_eq!(
            l.iter().next().unwrap(),
            &Address::Unix {
                path: "/run/bus".into(),
                abstract_ns: false,
            }
        );
        let l = AddressList::parse("unix:abstract=/tmp/hidden").unwrap();
        assert!(matches!(
            l.iter().next().unwrap(),
            Address::Unix {
                abstract_ns: true,
                ..
            }
        ));
    }

    #[test]
    fn unknown_keys_are_skipped() {
        let l = AddressList::parse("unix:path=/run/bus,guid=0011223344,newfangled=1").unwrap();
        assert_eq!(
            l.iter().next().unwrap(),
            &Address::Unix {
                path: "/run/bus".into(),
                abstract_ns: false,
            }
        );
    }

    #[test]
    fn percent_escapes_decode() {
        let l = AddressList::parse("unix:path=/run/a%20b%3db").unwrap();
        assert_eq!(
            l.iter().next().unwrap(),
            &Address::Unix {
                path: "/run/a b=b".into(),
                abstract_ns: false,
            }
        );
        // Raw space must be escaped.
        assert!(AddressList::parse("unix:path=/run/a b").is_err());
        // Dangling escape.
        assert!(AddressList::parse("unix:path=/run/a%2").is_err());
    }

    #[test]
    fn tcp_with_family() {
        let l = AddressList::parse("tcp:host=localhost,port=4444,family=ipv4").unwrap();
        assert_eq!(
            l.iter().next().unwrap(),
            &Address::Tcp {
                host: "localhost".into(),
                port: 4444,
                family: Some(TcpFamily::V4),
            }
        );
        assert!(AddressList::parse("tcp:host=x").is_err());
        assert!(AddressList::parse("tcp:host=x,port=0").is_err());
        assert!(AddressList::parse("tcp:host=x,port=70000").is_err());
        assert!(AddressList::parse("tcp:host=x,port=1,family=ipx").is_err());
    }

    #[test]
    fn exec_argv_slots() {
        let l = AddressList::parse("unixexec:path=/bin/sh,argv1=-c,argv2=cat").unwrap();
        match l.iter().next().unwrap() {
            Address::Exec { path, argv } => {
                assert_eq!(path, &PathBuf::from("/bin/sh"));
                assert_eq!(argv, &["/bin/sh", "-c", "cat"]);
            }
            other => panic!("{other:?}"),
        }
        // A hole anywhere but argv0 is an error.
        assert!(AddressList::parse("unixexec:path=/bin/sh,argv2=x").is_err());
        assert!(AddressList::parse("unixexec:path=/bin/sh,argv999=x").is_err());
    }

    #[test]
    fn machine_is_exclusive() {
        assert!(AddressList::parse("x-machine-unix:machine=web1").is_ok());
        assert!(AddressList::parse("x-machine-unix:pid=1234").is_ok());
        assert!(AddressList::parse("x-machine-unix:machine=a,pid=1").is_err());
        assert!(AddressList::parse("x-machine-unix:").is_err());
    }

    #[test]
    fn lists_preserve_order_and_report_offsets() {
        let l = AddressList::parse("unix:path=/a;tcp:host=h,port=1").unwrap();
        assert_eq!(l.len(), 2);
        assert!(matches!(l.iter().next().unwrap(), Address::Unix { .. }));

        let err = AddressList::parse("unix:path=/a;bogus:x=y").unwrap_err();
        match err {
            Error::BadAddress { offset, .. } => assert_eq!(offset, 13),
            other => panic!("{other}"),
        }
    }

    #[test]
    fn empty_list_is_an_error() {
        assert!(matches!(
            AddressList::parse(""),
            Err(Error::NoAddresses)
        ));
        assert!(matches!(
            AddressList::parse(";;"),
            Err(Error::NoAddresses)
        ));
    }

    #[test]
    fn escape_round_trip() {
        let raw = "/run/user/1000/spaced dir/bus";
        let escaped = escape_value(raw);
        assert_eq!(percent_decode(&escaped, 0).unwrap(), raw);
    }
}
