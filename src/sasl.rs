//! The line-based authentication handshake that precedes message exchange.
//!
//! Both roles are sans-io state machines: bytes in via [`SaslClient::handle_input`]
//! / [`SaslServer::handle_input`], bytes out via `take_output`. The caller
//! owns the socket and the 90 second handshake deadline.
//!
//! The client opens with a single NUL (credentials byte on unix sockets),
//! offers EXTERNAL with its uid, falls back to ANONYMOUS on rejection, then
//! optionally negotiates fd passing before `BEGIN`.

use log::{debug, trace};

use crate::error::{Error, Result};

/// Ceiling on one handshake line, against unbounded buffering.
const MAX_LINE: usize = 64 * 1024;

/// Outcome of feeding handshake bytes.
#[derive(Debug, PartialEq, Eq)]
pub enum SaslStatus {
    /// More bytes needed.
    InProgress,
    /// Handshake finished; message exchange may begin.
    Done,
}

fn hex_encode(s: &str) -> String {
    s.bytes().map(|b| format!("{b:02x}")).collect()
}

fn hex_decode(s: &str) -> Option<String> {
    if s.len() % 2 != 0 {
        return None;
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for pair in bytes.chunks(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        out.push((hi * 16 + lo) as u8);
    }
    String::from_utf8(out).ok()
}

/// Accumulates input and yields complete `\r\n`-terminated lines.
#[derive(Default)]
struct LineBuffer {
    buf: Vec<u8>,
    scanned: usize,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Result<()> {
        if self.buf.len() + bytes.len() > MAX_LINE {
            return Err(Error::AuthFailed("handshake line too long".into()));
        }
        self.buf.extend_from_slice(bytes);
        Ok(())
    }

    fn next_line(&mut self) -> Result<Option<String>> {
        let start = self.scanned.saturating_sub(1);
        if let Some(i) = self.buf[start..].windows(2).position(|w| w == b"\r\n") {
            let end = start + i;
            let line = std::str::from_utf8(&self.buf[..end])
                .map_err(|_| Error::AuthFailed("handshake line is not UTF-8".into()))?
                .to_owned();
            self.buf.drain(..end + 2);
            self.scanned = 0;
            return Ok(Some(line));
        }
        self.scanned = self.buf.len();
        Ok(None)
    }

    fn take_rest(&mut self) -> Vec<u8> {
        self.scanned = 0;
        std::mem::take(&mut self.buf)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ClientState {
    WaitOk,
    /// EXTERNAL was rejected, ANONYMOUS offered.
    WaitOkAnonymous,
    WaitFdAgreement,
    Done,
}

/// Client half of the handshake.
pub struct SaslClient {
    state: ClientState,
    lines: LineBuffer,
    out: Vec<u8>,
    negotiate_fds: bool,
    /// Agreed during the handshake; valid once done.
    fds_agreed: bool,
    server_guid: Option<String>,
}

impl SaslClient {
    pub fn new(uid: u32, negotiate_fds: bool) -> SaslClient {
        let mut out = Vec::new();
        out.push(0);
        out.extend_from_slice(
            format!("AUTH EXTERNAL {}\r\n", hex_encode(&uid.to_string())).as_bytes(),
        );
        SaslClient {
            state: ClientState::WaitOk,
            lines: LineBuffer::default(),
            out,
            negotiate_fds,
            fds_agreed: false,
            server_guid: None,
        }
    }

    /// Bytes that must be written to the peer.
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    /// Bytes that arrived after the handshake finished; they belong to the
    /// message stream.
    pub fn take_leftover(&mut self) -> Vec<u8> {
        self.lines.take_rest()
    }

    pub fn fds_agreed(&self) -> bool {
        self.fds_agreed
    }

    pub fn server_guid(&self) -> Option<&str> {
        self.server_guid.as_deref()
    }

    pub fn handle_input(&mut self, bytes: &[u8]) -> Result<SaslStatus> {
        self.lines.push(bytes)?;
        while self.state != ClientState::Done {
            let Some(line) = self.lines.next_line()? else {
                return Ok(SaslStatus::InProgress);
            };
            trace!("auth <- {line}");
            self.handle_line(&line)?;
        }
        Ok(SaslStatus::Done)
    }

    fn finish_or_negotiate(&mut self) {
        if self.negotiate_fds {
            self.out.extend_from_slice(b"NEGOTIATE_UNIX_FD\r\n");
            self.state = ClientState::WaitFdAgreement;
        } else {
            self.begin();
        }
    }

    fn begin(&mut self) {
        self.out.extend_from_slice(b"BEGIN\r\n");
        self.state = ClientState::Done;
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match (self.state, verb) {
            (ClientState::WaitOk | ClientState::WaitOkAnonymous, "OK") => {
                self.server_guid = Some(rest.to_owned());
                self.finish_or_negotiate();
                Ok(())
            }
            (ClientState::WaitOk, "REJECTED") => {
                // One fallback: ANONYMOUS, if offered.
                if rest.split(' ').any(|m| m == "ANONYMOUS") {
                    debug!("EXTERNAL rejected, retrying with ANONYMOUS");
                    self.out.extend_from_slice(b"AUTH ANONYMOUS\r\n");
                    self.state = ClientState::WaitOkAnonymous;
                    Ok(())
                } else {
                    Err(Error::AuthRejected(rest.to_owned()))
                }
            }
            (ClientState::WaitOkAnonymous, "REJECTED") => {
                Err(Error::AuthRejected(rest.to_owned()))
            }
            (ClientState::WaitFdAgreement, "AGREE_UNIX_FD") => {
                self.fds_agreed = true;
                self.begin();
                Ok(())
            }
            (ClientState::WaitFdAgreement, "ERROR") => {
                // Peer cannot pass fds; carry on without.
                self.begin();
                Ok(())
            }
            _ => Err(Error::AuthFailed(format!(
                "unexpected handshake line {line:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    WaitNul,
    WaitAuth,
    WaitBegin,
    Done,
}

/// Server half of the handshake.
pub struct SaslServer {
    state: ServerState,
    lines: LineBuffer,
    out: Vec<u8>,
    guid: String,
    /// Uid from SO_PEERCRED; EXTERNAL must claim the same identity.
    peer_uid: Option<u32>,
    allow_anonymous: bool,
    fds_agreed: bool,
    /// Identity the peer authenticated as, once done.
    auth_uid: Option<u32>,
}

impl SaslServer {
    pub fn new(guid: String, peer_uid: Option<u32>, allow_anonymous: bool) -> SaslServer {
        SaslServer {
            state: ServerState::WaitNul,
            lines: LineBuffer::default(),
            out: Vec::new(),
            guid,
            peer_uid,
            allow_anonymous,
            fds_agreed: false,
            auth_uid: None,
        }
    }

    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }

    pub fn take_leftover(&mut self) -> Vec<u8> {
        self.lines.take_rest()
    }

    pub fn fds_agreed(&self) -> bool {
        self.fds_agreed
    }

    pub fn auth_uid(&self) -> Option<u32> {
        self.auth_uid
    }

    pub fn handle_input(&mut self, bytes: &[u8]) -> Result<SaslStatus> {
        let bytes = if self.state == ServerState::WaitNul {
            let Some((&first, rest)) = bytes.split_first() else {
                return Ok(SaslStatus::InProgress);
            };
            if first != 0 {
                return Err(Error::AuthFailed("missing credentials byte".into()));
            }
            self.state = ServerState::WaitAuth;
            rest
        } else {
            bytes
        };
        self.lines.push(bytes)?;
        while self.state != ServerState::Done {
            let Some(line) = self.lines.next_line()? else {
                return Ok(SaslStatus::InProgress);
            };
            trace!("auth <- {line}");
            self.handle_line(&line)?;
        }
        Ok(SaslStatus::Done)
    }

    fn reject(&mut self) {
        let mechs = if self.allow_anonymous {
            "EXTERNAL ANONYMOUS"
        } else {
            "EXTERNAL"
        };
        self.out
            .extend_from_slice(format!("REJECTED {mechs}\r\n").as_bytes());
        self.state = ServerState::WaitAuth;
    }

    fn accept(&mut self, uid: Option<u32>) {
        self.auth_uid = uid;
        self.out
            .extend_from_slice(format!("OK {}\r\n", self.guid).as_bytes());
        self.state = ServerState::WaitBegin;
    }

    fn handle_auth(&mut self, rest: &str) -> Result<()> {
        let (mech, initial) = rest.split_once(' ').unwrap_or((rest, ""));
        match mech {
            "EXTERNAL" => {
                let claimed = hex_decode(initial).and_then(|s| s.parse::<u32>().ok());
                match (claimed, self.peer_uid) {
                    // The claimed identity must match the socket credentials
                    // when we have them.
                    (Some(c), Some(p)) if c == p => self.accept(Some(c)),
                    (Some(c), None) => self.accept(Some(c)),
                    _ => self.reject(),
                }
            }
            "ANONYMOUS" if self.allow_anonymous => self.accept(None),
            _ => self.reject(),
        }
        Ok(())
    }

    fn handle_line(&mut self, line: &str) -> Result<()> {
        let (verb, rest) = line.split_once(' ').unwrap_or((line, ""));
        match (self.state, verb) {
            (ServerState::WaitAuth, "AUTH") => self.handle_auth(rest),
            (ServerState::WaitAuth, "ERROR") => {
                self.reject();
                Ok(())
            }
            (ServerState::WaitBegin, "NEGOTIATE_UNIX_FD") => {
                self.fds_agreed = true;
                self.out.extend_from_slice(b"AGREE_UNIX_FD\r\n");
                Ok(())
            }
            (ServerState::WaitBegin, "BEGIN") => {
                self.state = ServerState::Done;
                Ok(())
            }
            (ServerState::WaitBegin, "CANCEL") | (ServerState::WaitAuth, "CANCEL") => {
                self.reject();
                Ok(())
            }
            (_, "ERROR") => Ok(()),
            _ => Err(Error::AuthFailed(format!(
                "unexpected handshake line {line:?}"
            ))),
        }
    }
}
