//! Event loop integration.
//!
//! A connection exposes the readiness triple an external loop needs: the
//! transport fd, the poll events of interest, and the earliest call
//! deadline. [`Connection::wait`] is the built-in single-connection loop
//! body, a thin `poll(2)` wrapper honoring the same triple.

use std::io;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};

use crate::connection::{Connection, ConnectionState};
use crate::error::{Error, Result};

/// What a connection wants an event loop to poll for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest {
    pub readable: bool,
    pub writable: bool,
}

impl Interest {
    /// As `poll(2)` event bits.
    pub fn poll_events(self) -> i16 {
        let mut ev = 0;
        if self.readable {
            ev |= libc::POLLIN;
        }
        if self.writable {
            ev |= libc::POLLOUT;
        }
        ev
    }

    pub fn is_empty(self) -> bool {
        !self.readable && !self.writable
    }
}

impl Connection {
    /// The fd to poll, while the connection has a transport.
    pub fn event_fd(&self) -> Option<RawFd> {
        self.raw_fd()
    }

    /// Current poll interest. Empty for a closed connection; a connection
    /// in `WatchBind` has no fd and is driven by `process` retries.
    pub fn event_interest(&self) -> Interest {
        Interest {
            readable: self.wants_read(),
            writable: self.wants_write(),
        }
    }

    /// Time until the earliest armed deadline (the authentication timeout
    /// while authenticating, else the earliest pending call), clamped at
    /// zero. `None` means no deadline is armed.
    pub fn event_timeout(&mut self) -> Option<Duration> {
        let d = self.next_deadline()?;
        Some(d.saturating_duration_since(Instant::now()))
    }

    /// Block until the transport is ready or a deadline expires. Returns
    /// whether the fd became ready. `timeout` bounds the wait; call
    /// deadlines shorten it further.
    pub fn wait(&mut self, timeout: Option<Duration>) -> Result<bool> {
        if self.state() == ConnectionState::Closed {
            return Err(Error::NotConnected);
        }
        let budget = match (timeout, self.event_timeout()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self.poll_transport(budget)
    }

    /// Poll the transport fd for the current interest, ignoring armed
    /// deadlines.
    pub(crate) fn poll_transport(&mut self, budget: Option<Duration>) -> Result<bool> {
        let millis: libc::c_int = match budget {
            // Round up so a sub-millisecond budget still sleeps.
            Some(d) => d
                .as_millis()
                .max(if d.is_zero() { 0 } else { 1 })
                .try_into()
                .unwrap_or(libc::c_int::MAX),
            None => -1,
        };
        let Some(fd) = self.event_fd() else {
            // No transport (bind watch): just sleep out the budget.
            if let Some(d) = budget {
                std::thread::sleep(d);
            }
            return Ok(false);
        };
        let interest = self.event_interest();
        let mut fds = [libc::pollfd {
            fd,
            events: interest.poll_events(),
            revents: 0,
        }];
        loop {
            let rc = unsafe { libc::poll(fds.as_mut_ptr(), 1, millis) };
            if rc >= 0 {
                return Ok(rc > 0);
            }
            let e = io::Error::last_os_error();
            if e.kind() != io::ErrorKind::Interrupted {
                return Err(Error::Io(e));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Message;
    use crate::socket::Transport;
    use std::os::unix::net::UnixStream;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        let server = Connection::new_server(Transport::from(a), true).unwrap();
        let client = Connection::new_client(Transport::from(b)).unwrap();
        (client, server)
    }

    fn pump(a: &mut Connection, b: &mut Connection) {
        for _ in 0..200 {
            if !(a.process().unwrap() | b.process().unwrap()) {
                return;
            }
        }
        panic!("connections did not go quiescent");
    }

    #[test]
    fn fresh_client_wants_to_write_its_auth_greeting() {
        let (client, _server) = pair();
        let i = client.event_interest();
        assert!(i.readable);
        assert!(i.writable);
        assert!(client.event_fd().is_some());
    }

    #[test]
    fn quiescent_connection_only_reads() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let i = client.event_interest();
        assert!(i.readable);
        assert!(!i.writable);
    }

    #[test]
    fn deadline_shows_up_in_the_timeout() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        assert_eq!(client.event_timeout(), None);
        let m = Message::new_method_call(None, "/slow", Some("a.b"), "Never").unwrap();
        client
            .call_async(m, |_, _| Ok(true), Some(Duration::from_secs(60)))
            .unwrap();
        let t = client.event_timeout().expect("no deadline armed");
        assert!(t <= Duration::from_secs(60));
        assert!(t > Duration::from_secs(50));
    }

    #[test]
    fn wait_sees_incoming_bytes() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        // Nothing to read yet: a zero wait returns not-ready.
        assert!(!client.wait(Some(Duration::ZERO)).unwrap());
        let sig = Message::new_signal("/ev", "a.b", "Pulse").unwrap();
        server.send(sig).unwrap();
        assert!(client.wait(Some(Duration::from_secs(5))).unwrap());
    }

    #[test]
    fn wait_on_a_closed_connection_fails() {
        let (mut client, _server) = pair();
        client.close();
        assert!(matches!(
            client.wait(Some(Duration::ZERO)),
            Err(Error::NotConnected)
        ));
    }
}
