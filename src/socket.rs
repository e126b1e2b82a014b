//! Stream transports beneath a connection.
//!
//! A [`Transport`] carries the byte stream (and, on unix sockets, the
//! out-of-band descriptors) for one peer. Connecting walks an address list
//! in order; the first element that yields a socket wins.

use std::io;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::Path;
use std::process::{Child, Command, Stdio};

use log::{debug, warn};

use crate::address::{Address, AddressList, TcpFamily, DEFAULT_SYSTEM_SOCKET};
use crate::error::{map_io, Error, Result};
use crate::wire::MAX_FDS;

/// Credentials of the peer, from the socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerCredentials {
    pub uid: u32,
    pub gid: u32,
    pub pid: i32,
}

/// One connected transport.
pub enum Transport {
    Unix(UnixStream),
    Tcp(TcpStream),
    /// Socketpair to a spawned child; the child is reaped when the
    /// transport drops.
    Exec { stream: UnixStream, child: Child },
}

impl Transport {
    /// Connect the first usable element of `addrs`. Elements that fail are
    /// logged and skipped.
    pub fn connect(addrs: &AddressList) -> Result<Transport> {
        let mut last: Option<Error> = None;
        for addr in addrs.iter() {
            match Transport::connect_one(addr) {
                Ok(t) => return Ok(t),
                Err(e) => {
                    debug!("connect to {addr:?} failed: {e}");
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or(Error::NoAddresses))
    }

    fn connect_one(addr: &Address) -> Result<Transport> {
        match addr {
            Address::Unix { path, abstract_ns } => {
                let stream = if *abstract_ns {
                    connect_abstract(path)?
                } else {
                    UnixStream::connect(path).map_err(map_io)?
                };
                Ok(Transport::Unix(stream))
            }
            Address::Tcp { host, port, family } => {
                let addrs = (host.as_str(), *port).to_socket_addrs().map_err(map_io)?;
                let mut last = None;
                for sa in addrs {
                    let ok = match family {
                        Some(TcpFamily::V4) => sa.is_ipv4(),
                        Some(TcpFamily::V6) => sa.is_ipv6(),
                        None => true,
                    };
                    if !ok {
                        continue;
                    }
                    match TcpStream::connect(sa) {
                        Ok(s) => return Ok(Transport::Tcp(s)),
                        Err(e) => last = Some(e),
                    }
                }
                Err(last.map_or(Error::NoAddresses, map_io))
            }
            Address::Exec { path, argv } => connect_exec(path, argv),
            Address::Machine { machine, pid } => match (machine, pid) {
                (None, Some(pid)) => {
                    // The container's system bus socket through its root
                    // directory view.
                    let path = format!("/proc/{pid}/root{DEFAULT_SYSTEM_SOCKET}");
                    let stream = UnixStream::connect(path).map_err(map_io)?;
                    Ok(Transport::Unix(stream))
                }
                _ => Err(Error::NotSupported(
                    "machine name resolution needs a machine registry",
                )),
            },
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Transport::Unix(s) | Transport::Exec { stream: s, .. } => {
                s.set_nonblocking(nonblocking).map_err(map_io)
            }
            Transport::Tcp(s) => s.set_nonblocking(nonblocking).map_err(map_io),
        }
    }

    /// Whether descriptor passing can even be negotiated here.
    pub fn can_pass_fds(&self) -> bool {
        matches!(self, Transport::Unix(_))
    }

    pub fn peer_credentials(&self) -> Option<PeerCredentials> {
        match self {
            Transport::Unix(s) | Transport::Exec { stream: s, .. } => peer_creds(s.as_raw_fd()),
            Transport::Tcp(_) => None,
        }
    }

    /// Write bytes, attaching `fds` to the first byte. Returns the number
    /// of bytes accepted; on a short write the caller retries without fds.
    pub fn send(&mut self, buf: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
        match self {
            Transport::Unix(s) | Transport::Exec { stream: s, .. } => {
                send_with_fds(s.as_raw_fd(), buf, fds)
            }
            Transport::Tcp(s) => {
                if !fds.is_empty() {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "descriptors cannot pass over tcp",
                    ));
                }
                io::Write::write(s, buf)
            }
        }
    }

    /// Read bytes, collecting any passed descriptors into `fds`. A return
    /// of 0 on a non-empty buffer means the peer closed.
    pub fn recv(&mut self, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
        match self {
            Transport::Unix(s) | Transport::Exec { stream: s, .. } => {
                recv_with_fds(s.as_raw_fd(), buf, fds)
            }
            Transport::Tcp(s) => io::Read::read(s, buf),
        }
    }

    pub fn shutdown(&self) {
        let _ = match self {
            Transport::Unix(s) | Transport::Exec { stream: s, .. } => {
                s.shutdown(std::net::Shutdown::Both)
            }
            Transport::Tcp(s) => s.shutdown(std::net::Shutdown::Both),
        };
    }
}

impl AsRawFd for Transport {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Transport::Unix(s) | Transport::Exec { stream: s, .. } => s.as_raw_fd(),
            Transport::Tcp(s) => s.as_raw_fd(),
        }
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Transport::Exec { child, .. } = self {
            if let Err(e) = child.kill() {
                if e.kind() != io::ErrorKind::InvalidInput {
                    warn!("killing transport child failed: {e}");
                }
            }
            let _ = child.wait();
        }
    }
}

impl From<UnixStream> for Transport {
    fn from(s: UnixStream) -> Transport {
        Transport::Unix(s)
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn connect_abstract(path: &Path) -> Result<UnixStream> {
    use std::os::linux::net::SocketAddrExt;
    let name = path.as_os_str().as_encoded_bytes();
    let addr =
        std::os::unix::net::SocketAddr::from_abstract_name(name).map_err(map_io)?;
    UnixStream::connect_addr(&addr).map_err(map_io)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn connect_abstract(_path: &Path) -> Result<UnixStream> {
    Err(Error::NotSupported("abstract sockets"))
}

fn connect_exec(path: &Path, argv: &[String]) -> Result<Transport> {
    use std::os::unix::process::CommandExt;
    let (ours, theirs) = UnixStream::pair().map_err(map_io)?;
    let stdin_end = theirs.try_clone().map_err(map_io)?;
    let mut cmd = Command::new(path);
    if let Some(argv0) = argv.first() {
        cmd.arg0(argv0);
    }
    cmd.args(&argv[1..]);
    cmd.stdin(Stdio::from(OwnedFd::from(stdin_end)));
    cmd.stdout(Stdio::from(OwnedFd::from(theirs)));
    cmd.stderr(Stdio::inherit());
    let child = cmd.spawn().map_err(map_io)?;
    Ok(Transport::Exec {
        stream: ours,
        child,
    })
}

fn peer_creds(fd: RawFd) -> Option<PeerCredentials> {
    let mut ucred = libc::ucred {
        pid: 0,
        uid: 0,
        gid: 0,
    };
    let mut len = std::mem::size_of::<libc::ucred>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_PEERCRED,
            &mut ucred as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return None;
    }
    Some(PeerCredentials {
        uid: ucred.uid,
        gid: ucred.gid,
        pid: ucred.pid,
    })
}

fn send_with_fds(fd: RawFd, buf: &[u8], fds: &[OwnedFd]) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let fd_bytes = fds.len() * std::mem::size_of::<RawFd>();
    // u64-backed buffer keeps cmsghdr alignment.
    let mut cmsg_buf: Vec<u64> = Vec::new();
    if !fds.is_empty() {
        let space = unsafe { libc::CMSG_SPACE(fd_bytes as u32) } as usize;
        cmsg_buf.resize(space.div_ceil(8), 0);
        msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
        msg.msg_controllen = space;
        unsafe {
            let hdr = libc::CMSG_FIRSTHDR(&msg);
            (*hdr).cmsg_level = libc::SOL_SOCKET;
            (*hdr).cmsg_type = libc::SCM_RIGHTS;
            (*hdr).cmsg_len = libc::CMSG_LEN(fd_bytes as u32) as usize;
            let raw: Vec<RawFd> = fds.iter().map(AsRawFd::as_raw_fd).collect();
            std::ptr::copy_nonoverlapping(
                raw.as_ptr() as *const u8,
                libc::CMSG_DATA(hdr),
                fd_bytes,
            );
        }
    }

    let n = unsafe { libc::sendmsg(fd, &msg, libc::MSG_NOSIGNAL) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

fn recv_with_fds(fd: RawFd, buf: &mut [u8], fds: &mut Vec<OwnedFd>) -> io::Result<usize> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr() as *mut libc::c_void,
        iov_len: buf.len(),
    };
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;

    let space = unsafe { libc::CMSG_SPACE((MAX_FDS * std::mem::size_of::<RawFd>()) as u32) };
    let mut cmsg_buf: Vec<u64> = vec![0; (space as usize).div_ceil(8)];
    msg.msg_control = cmsg_buf.as_mut_ptr() as *mut libc::c_void;
    msg.msg_controllen = space as usize;

    let n = unsafe { libc::recvmsg(fd, &mut msg, libc::MSG_CMSG_CLOEXEC) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    unsafe {
        let mut hdr = libc::CMSG_FIRSTHDR(&msg);
        while !hdr.is_null() {
            if (*hdr).cmsg_level == libc::SOL_SOCKET && (*hdr).cmsg_type == libc::SCM_RIGHTS {
                let data_len =
                    (*hdr).cmsg_len - libc::CMSG_LEN(0) as usize;
                let count = data_len / std::mem::size_of::<RawFd>();
                let data = libc::CMSG_DATA(hdr) as *const RawFd;
                for i in 0..count {
                    let raw = std::ptr::read_unaligned(data.add(i));
                    fds.push(OwnedFd::from_raw_fd(raw));
                }
            }
            hdr = libc::CMSG_NXTHDR(&msg, hdr);
        }
    }
    Ok(n as usize)
}

/// Listening side of a transport, for the server role.
pub enum Listener {
    Unix(UnixListener),
    Tcp(TcpListener),
}

impl Listener {
    /// Bind the first bindable element of `addrs`. Exec and machine
    /// elements cannot be listened on.
    pub fn bind(addrs: &AddressList) -> Result<Listener> {
        let mut last: Option<Error> = None;
        for addr in addrs.iter() {
            match Listener::bind_one(addr) {
                Ok(l) => return Ok(l),
                Err(e) => last = Some(e),
            }
        }
        Err(last.unwrap_or(Error::NoAddresses))
    }

    fn bind_one(addr: &Address) -> Result<Listener> {
        match addr {
            Address::Unix {
                path,
                abstract_ns: false,
            } => {
                // A stale socket file from a previous run blocks bind.
                if path.exists() {
                    let _ = std::fs::remove_file(path);
                }
                Ok(Listener::Unix(UnixListener::bind(path).map_err(map_io)?))
            }
            Address::Unix {
                path,
                abstract_ns: true,
            } => bind_abstract(path),
            Address::Tcp { host, port, .. } => Ok(Listener::Tcp(
                TcpListener::bind((host.as_str(), *port)).map_err(map_io)?,
            )),
            _ => Err(Error::NotSupported("transport cannot be listened on")),
        }
    }

    pub fn accept(&self) -> Result<Transport> {
        match self {
            Listener::Unix(l) => {
                let (s, _) = l.accept().map_err(map_io)?;
                Ok(Transport::Unix(s))
            }
            Listener::Tcp(l) => {
                let (s, _) = l.accept().map_err(map_io)?;
                Ok(Transport::Tcp(s))
            }
        }
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        match self {
            Listener::Unix(l) => l.set_nonblocking(nonblocking).map_err(map_io),
            Listener::Tcp(l) => l.set_nonblocking(nonblocking).map_err(map_io),
        }
    }
}

impl AsRawFd for Listener {
    fn as_raw_fd(&self) -> RawFd {
        match self {
            Listener::Unix(l) => l.as_raw_fd(),
            Listener::Tcp(l) => l.as_raw_fd(),
        }
    }
}

#[cfg(any(target_os = "linux", target_os = "android"))]
fn bind_abstract(path: &Path) -> Result<Listener> {
    use std::os::linux::net::SocketAddrExt;
    let name = path.as_os_str().as_encoded_bytes();
    let addr =
        std::os::unix::net::SocketAddr::from_abstract_name(name).map_err(map_io)?;
    Ok(Listener::Unix(
        UnixListener::bind_addr(&addr).map_err(map_io)?,
    ))
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
fn bind_abstract(_path: &Path) -> Result<Listener> {
    Err(Error::NotSupported("abstract sockets"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_round_trip_over_a_pair() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut ta = Transport::Unix(a);
        let mut tb = Transport::Unix(b);
        let n = ta.send(b"hello", &[]).unwrap();
        assert_eq!(n, 5);
        let mut buf = [0u8; 16];
        let mut fds = Vec::new();
        let n = tb.recv(&mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert!(fds.is_empty());
    }

    #[test]
    fn descriptors_ride_along() {
        let (a, b) = UnixStream::pair().unwrap();
        let mut ta = Transport::Unix(a);
        let mut tb = Transport::Unix(b);

        let file = tempfile::tempfile().unwrap();
        ta.send(b"x", &[OwnedFd::from(file)]).unwrap();

        let mut buf = [0u8; 4];
        let mut fds = Vec::new();
        let n = tb.recv(&mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"x");
        assert_eq!(fds.len(), 1);
    }

    #[test]
    fn peer_credentials_match_ourselves() {
        let (a, _b) = UnixStream::pair().unwrap();
        let t = Transport::Unix(a);
        let creds = t.peer_credentials().unwrap();
        assert_eq!(creds.pid, std::process::id() as i32);
    }

    #[test]
    fn unix_listen_and_connect() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sock");
        let addr = format!("unix:path={}", crate::address::escape_value(path.to_str().unwrap()));
        let addrs = AddressList::parse(&addr).unwrap();
        let listener = Listener::bind(&addrs).unwrap();
        let mut client = Transport::connect(&addrs).unwrap();
        let mut server = listener.accept().unwrap();
        client.send(b"ping", &[]).unwrap();
        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        let n = server.recv(&mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[test]
    fn exec_transport_talks_to_the_child_stdio() {
        let addrs = AddressList::parse("unixexec:path=/bin/cat").unwrap();
        let mut t = Transport::connect(&addrs).unwrap();
        t.send(b"echo?", &[]).unwrap();
        let mut buf = [0u8; 8];
        let mut fds = Vec::new();
        let n = t.recv(&mut buf, &mut fds).unwrap();
        assert_eq!(&buf[..n], b"echo?");
    }
}
