//! The connection: transport, authentication, queues and dispatch.
//!
//! A connection moves through a fixed set of states. Client side:
//! `Opening` while the transport connects, `Authenticating` for the SASL
//! exchange, `Hello` while waiting for the bus to assign a unique name
//! (skipped for direct peer connections), then `Running`. `WatchBind` is
//! entered when the socket does not exist yet; every `process` call retries
//! the connect. Closing drains outstanding calls in send order with
//! synthesized `Disconnected` errors and ends in `Closed`.
//!
//! All I/O is non-blocking. [`Connection::process`] performs one unit of
//! work; the readiness accessors in the event module tell a caller's loop
//! what to poll for.

use std::collections::VecDeque;
use std::io;
use std::os::fd::OwnedFd;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, trace, warn};

use crate::address::{bus_address, AddressList, BusKind};
use crate::error::{map_io, name, BusError, Error, Result};
use crate::matchrule::{MatchRule, MatchTree};
use crate::message::{Message, MessageFlags, MessageType};
use crate::object::{
    default_authorizer, interfaces_added_body, interfaces_removed_body, properties_changed_body,
    properties_invalidated_body, resolve_call, signal_declaration_allows, AuthorizationContext,
    Authorizer, Dispatch, EmitsChanged, NodeEnumerator, ObjectServer, Registration, Vtable,
    OBJECT_MANAGER_IFACE, PROPERTIES_IFACE,
};
use crate::pending::{PendingCalls, ReplyCallback, DEFAULT_CALL_TIMEOUT};
use crate::sasl::{SaslClient, SaslServer, SaslStatus};
use crate::slot::{Slot, SlotArena, SlotKind};
use crate::socket::{Listener, Transport};
use crate::types::{object_path_is_valid, object_path_startswith, Value};
use crate::wire::{decode_message, encode_message, peek_frame_len, WireVersion, MAX_FDS};

/// The message bus itself.
pub const BUS_SERVICE: &str = "org.freedesktop.DBus";
pub const BUS_PATH: &str = "/org/freedesktop/DBus";
pub const BUS_INTERFACE: &str = "org.freedesktop.DBus";

/// Hard ceiling on queued outgoing frames.
const MAX_WRITE_QUEUE: usize = 1024;
/// Hard ceiling on decoded-but-undispatched incoming messages.
const MAX_READ_QUEUE: usize = 1024;
/// Read chunk size.
const RECV_CHUNK: usize = 16 * 1024;
/// How long the SASL exchange may take before the connection is failed.
const AUTH_TIMEOUT: Duration = Duration::from_secs(90);

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unset,
    /// The socket does not exist yet; connect is retried on `process`.
    WatchBind,
    Opening,
    Authenticating,
    /// Waiting for the bus to answer Hello with our unique name.
    Hello,
    Running,
    Closing,
    Closed,
}

/// Invoked for matched signals and for filters. Returning `Ok(true)`
/// consumes the message; later handlers do not see it.
pub type MessageCallback = Box<dyn FnMut(&mut Connection, &Message) -> Result<bool>>;

struct MatchRegistration {
    rule: MatchRule,
    callback: Option<MessageCallback>,
    /// Dispatch iteration this was installed in; fences the registration
    /// out of the dispatch that installed it.
    installed_at: u64,
}

struct FilterRegistration {
    callback: Option<MessageCallback>,
    installed_at: u64,
}

struct OutFrame {
    buf: Vec<u8>,
    fds: Vec<OwnedFd>,
}

/// One connection to a bus or to a direct peer.
pub struct Connection {
    state: ConnectionState,
    transport: Option<Transport>,
    /// Kept for `WatchBind` retries.
    retry_addrs: Option<AddressList>,
    wire_version: WireVersion,
    is_server: bool,
    /// Client of a message bus: performs the Hello exchange.
    bus_client: bool,
    anonymous_ok: bool,
    unique_name: Option<String>,
    guid: Option<String>,
    can_fds: bool,
    sasl_client: Option<SaslClient>,
    sasl_server: Option<SaslServer>,
    auth_deadline: Option<Instant>,
    auth_out: Vec<u8>,
    rbuf: Vec<u8>,
    rfds: Vec<OwnedFd>,
    rqueue: VecDeque<Message>,
    wqueue: VecDeque<OutFrame>,
    /// Bytes of the front frame already written.
    wpos: usize,
    next_cookie: u64,
    pending: PendingCalls,
    matches: SlotArena<MatchRegistration>,
    match_tree: MatchTree,
    filters: SlotArena<FilterRegistration>,
    objects: ObjectServer,
    authorizer: Authorizer,
    /// Bumped once per dispatched message.
    iteration: u64,
    exit_on_disconnect: bool,
    creator_pid: u32,
}

impl Connection {
    fn empty() -> Connection {
        Connection {
            state: ConnectionState::Unset,
            transport: None,
            retry_addrs: None,
            wire_version: WireVersion::V1,
            is_server: false,
            bus_client: false,
            anonymous_ok: false,
            unique_name: None,
            guid: None,
            can_fds: false,
            sasl_client: None,
            sasl_server: None,
            auth_deadline: None,
            auth_out: Vec::new(),
            rbuf: Vec::new(),
            rfds: Vec::new(),
            rqueue: VecDeque::new(),
            wqueue: VecDeque::new(),
            wpos: 0,
            next_cookie: 1,
            pending: PendingCalls::default(),
            matches: SlotArena::default(),
            match_tree: MatchTree::default(),
            filters: SlotArena::default(),
            objects: ObjectServer::default(),
            authorizer: default_authorizer(),
            iteration: 0,
            exit_on_disconnect: false,
            creator_pid: cached_pid(),
        }
    }

    /// Connect to a well-known bus and acquire a unique name.
    pub fn open(kind: BusKind) -> Result<Connection> {
        let addrs = AddressList::parse(&bus_address(kind)?)?;
        Connection::open_list(addrs, true)
    }

    pub fn open_system() -> Result<Connection> {
        Connection::open(BusKind::System)
    }

    pub fn open_session() -> Result<Connection> {
        Connection::open(BusKind::Session)
    }

    /// Connect to an explicit address. `bus_client` selects whether the
    /// peer is a message bus (Hello exchange) or a direct peer.
    pub fn open_address(address: &str, bus_client: bool) -> Result<Connection> {
        Connection::open_list(AddressList::parse(address)?, bus_client)
    }

    fn open_list(addrs: AddressList, bus_client: bool) -> Result<Connection> {
        let mut c = Connection::empty();
        c.bus_client = bus_client;
        c.state = ConnectionState::Opening;
        match Transport::connect(&addrs) {
            Ok(t) => c.attach_client_transport(t)?,
            Err(Error::Io(e)) if socket_not_there(&e) => {
                debug!("bus socket not available yet, entering bind watch");
                c.retry_addrs = Some(addrs);
                c.state = ConnectionState::WatchBind;
            }
            Err(e) => return Err(e),
        }
        Ok(c)
    }

    /// Client end of an already-connected transport. No Hello exchange.
    pub fn new_client(transport: Transport) -> Result<Connection> {
        let mut c = Connection::empty();
        c.attach_client_transport(transport)?;
        Ok(c)
    }

    /// Server end of an accepted transport.
    pub fn new_server(transport: Transport, anonymous_ok: bool) -> Result<Connection> {
        let mut c = Connection::empty();
        c.is_server = true;
        c.anonymous_ok = anonymous_ok;
        let guid = random_guid();
        let peer_uid = transport.peer_credentials().map(|cr| cr.uid);
        let mut sasl = SaslServer::new(guid.clone(), peer_uid, anonymous_ok);
        c.auth_out.extend(sasl.take_output());
        c.sasl_server = Some(sasl);
        c.guid = Some(guid);
        transport.set_nonblocking(true)?;
        c.transport = Some(transport);
        c.state = ConnectionState::Authenticating;
        c.auth_deadline = Some(Instant::now() + AUTH_TIMEOUT);
        Ok(c)
    }

    /// Accept one client on a listener.
    pub fn accept(listener: &Listener, anonymous_ok: bool) -> Result<Connection> {
        Connection::new_server(listener.accept()?, anonymous_ok)
    }

    fn attach_client_transport(&mut self, transport: Transport) -> Result<()> {
        let uid = unsafe { libc::geteuid() } as u32;
        let mut sasl = SaslClient::new(uid, transport.can_pass_fds());
        self.auth_out.extend(sasl.take_output());
        self.sasl_client = Some(sasl);
        transport.set_nonblocking(true)?;
        self.transport = Some(transport);
        self.state = ConnectionState::Authenticating;
        self.auth_deadline = Some(Instant::now() + AUTH_TIMEOUT);
        Ok(())
    }

    // --- accessors ---

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Our unique bus name, once Hello has completed.
    pub fn unique_name(&self) -> Option<&str> {
        self.unique_name.as_deref()
    }

    /// The server's authentication GUID.
    pub fn server_guid(&self) -> Option<&str> {
        self.guid.as_deref()
    }

    pub fn is_server(&self) -> bool {
        self.is_server
    }

    /// True once both sides agreed to pass file descriptors.
    pub fn can_pass_fds(&self) -> bool {
        self.can_fds
    }

    pub fn wire_version(&self) -> WireVersion {
        self.wire_version
    }

    /// Select the wire format for outgoing messages. Both peers must use
    /// the same format; there is no negotiation.
    pub fn set_wire_version(&mut self, version: WireVersion) {
        self.wire_version = version;
    }

    /// Credentials of the peer, where the transport provides them.
    pub fn peer_credentials(&self) -> Option<crate::socket::PeerCredentials> {
        self.transport.as_ref().and_then(Transport::peer_credentials)
    }

    /// Terminate the process when the connection is torn down by the peer
    /// or by a fatal protocol error. For programs whose only job is to
    /// serve this connection.
    pub fn set_exit_on_disconnect(&mut self, exit: bool) {
        self.exit_on_disconnect = exit;
    }

    /// Replace the authorizer consulted before privileged methods run.
    pub fn set_authorizer(
        &mut self,
        authorizer: impl Fn(&AuthorizationContext<'_>) -> bool + 'static,
    ) {
        self.authorizer = Arc::new(authorizer);
    }

    pub(crate) fn raw_fd(&self) -> Option<std::os::fd::RawFd> {
        use std::os::fd::AsRawFd;
        self.transport.as_ref().map(|t| t.as_raw_fd())
    }

    pub(crate) fn wants_write(&self) -> bool {
        !self.auth_out.is_empty() || !self.wqueue.is_empty()
    }

    pub(crate) fn wants_read(&self) -> bool {
        matches!(
            self.state,
            ConnectionState::Authenticating | ConnectionState::Hello | ConnectionState::Running
        )
    }

    pub(crate) fn next_deadline(&mut self) -> Option<Instant> {
        // Queued messages want an immediate `process` call.
        if !self.rqueue.is_empty() || self.state == ConnectionState::Closing {
            return Some(Instant::now());
        }
        if self.state == ConnectionState::Authenticating {
            return self.auth_deadline;
        }
        self.pending.next_deadline()
    }

    fn assert_same_process(&self) -> Result<()> {
        if cached_pid() != self.creator_pid {
            return Err(Error::ChildOfFork);
        }
        Ok(())
    }

    fn alloc_cookie(&mut self) -> u64 {
        let c = self.next_cookie;
        self.next_cookie += 1;
        c
    }

    // --- sending ---

    /// Queue a message for sending, sealing it if necessary. Returns the
    /// message cookie.
    pub fn send(&mut self, m: Message) -> Result<u64> {
        self.assert_same_process()?;
        if m.message_type() == MessageType::Signal
            && !signal_declaration_allows(&self.objects, &m)
        {
            return Err(Error::InvalidArgument(format!(
                "signal {:?} does not carry its declared signature",
                m.member().unwrap_or_default()
            )));
        }
        match self.queue_send(m) {
            Err(e) => Err(self.fail_on_fatal(e)),
            ok => ok,
        }
    }

    fn queue_send(&mut self, mut m: Message) -> Result<u64> {
        match self.state {
            ConnectionState::Unset
            | ConnectionState::WatchBind
            | ConnectionState::Closing
            | ConnectionState::Closed => return Err(Error::NotConnected),
            _ => {}
        }
        if !m.is_sealed() {
            let cookie = self.alloc_cookie();
            m.seal(cookie, None)?;
        }
        if m.fd_count() > 0 && !self.can_fds {
            return Err(Error::NotSupported("file descriptor passing"));
        }
        if self.wqueue.len() >= MAX_WRITE_QUEUE {
            return Err(Error::QueueFull(MAX_WRITE_QUEUE));
        }
        let cookie = m.cookie();
        let buf = encode_message(&m, self.wire_version)?;
        trace!(
            "queue {} cookie={cookie} {} bytes",
            m.message_type().as_str(),
            buf.len()
        );
        self.wqueue.push_back(OutFrame { buf, fds: m.fds });
        self.flush_write()?;
        Ok(cookie)
    }

    /// Send a method call and invoke `callback` with the reply, or with a
    /// synthesized error on timeout or disconnect.
    pub fn call_async(
        &mut self,
        m: Message,
        callback: impl FnMut(&mut Connection, Message) -> Result<bool> + 'static,
        timeout: Option<Duration>,
    ) -> Result<Slot> {
        self.assert_same_process()?;
        self.call_async_boxed(m, Box::new(callback), timeout)
    }

    fn call_async_boxed(
        &mut self,
        mut m: Message,
        callback: ReplyCallback,
        timeout: Option<Duration>,
    ) -> Result<Slot> {
        if m.message_type() != MessageType::MethodCall {
            return Err(Error::InvalidArgument("call_async needs a method call".into()));
        }
        if m.flags().contains(MessageFlags::NO_REPLY_EXPECTED) {
            return Err(Error::InvalidArgument(
                "call_async on a message expecting no reply".into(),
            ));
        }
        let timeout = timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        if !m.is_sealed() {
            let cookie = self.alloc_cookie();
            m.seal(cookie, Some(timeout))?;
        }
        let cookie = match self.queue_send(m) {
            Ok(c) => c,
            Err(e) => return Err(self.fail_on_fatal(e)),
        };
        // Deadlines start ticking only once the connection is up.
        let anchor = match self.state {
            ConnectionState::Hello | ConnectionState::Running => Some(Instant::now()),
            _ => None,
        };
        let id = self.pending.insert(cookie, callback, timeout, anchor);
        Ok(Slot::new(SlotKind::PendingCall, id))
    }

    /// Send a method call and block until its reply arrives. Messages other
    /// than the awaited reply are queued for later `process` calls.
    pub fn call(&mut self, m: Message, timeout: Option<Duration>) -> Result<Message> {
        self.assert_same_process()?;
        if let (Some(dest), Some(us)) = (m.destination(), self.unique_name.as_deref()) {
            if dest == us {
                return Err(Error::SelfLoop);
            }
        }
        let timeout = timeout.unwrap_or(DEFAULT_CALL_TIMEOUT);
        let deadline = Instant::now() + timeout;

        while self.state != ConnectionState::Running {
            match self.state {
                ConnectionState::Unset | ConnectionState::Closing | ConnectionState::Closed => {
                    return Err(Error::NotConnected);
                }
                _ => {}
            }
            if !self.process()? {
                self.wait_until(deadline)?;
            }
        }

        let mut m = m;
        if !m.is_sealed() {
            let cookie = self.alloc_cookie();
            m.seal(cookie, Some(timeout))?;
        }
        let cookie = match self.queue_send(m) {
            Ok(c) => c,
            Err(e) => return Err(self.fail_on_fatal(e)),
        };
        loop {
            if let Some(pos) = self
                .rqueue
                .iter()
                .position(|r| r.message_type().is_reply() && r.reply_cookie() == Some(cookie))
            {
                let reply = match self.rqueue.remove(pos) {
                    Some(r) => r,
                    None => return Err(Error::Timeout),
                };
                return match reply.as_bus_error() {
                    Some(e) => Err(Error::Method(e)),
                    None => Ok(reply),
                };
            }
            if let Err(e) = self.flush_write() {
                return Err(self.fail_on_fatal(e));
            }
            match self.read_input() {
                Ok(true) => {}
                Ok(false) => self.wait_until(deadline)?,
                Err(e) => return Err(self.fail_on_fatal(e)),
            }
        }
    }

    fn wait_until(&mut self, deadline: Instant) -> Result<()> {
        let now = Instant::now();
        if now >= deadline {
            return Err(Error::Timeout);
        }
        // Plain poll, not `wait`: queued messages we are not interested in
        // must not turn this into a busy loop.
        if let Err(e) = self.poll_transport(Some(deadline - now)) {
            return Err(self.fail_on_fatal(e));
        }
        Ok(())
    }

    // --- registrations ---

    /// Subscribe to signals matching `rule`. On a bus connection the
    /// subscription is also installed on the bus.
    pub fn add_match(
        &mut self,
        rule: &str,
        callback: impl FnMut(&mut Connection, &Message) -> Result<bool> + 'static,
    ) -> Result<Slot> {
        let rule = MatchRule::parse(rule)?;
        self.sync_bus_match("AddMatch", &rule)?;
        let id = self.matches.insert(MatchRegistration {
            rule: rule.clone(),
            callback: Some(Box::new(callback)),
            installed_at: self.iteration,
        });
        self.match_tree.insert(&rule, id);
        Ok(Slot::new(SlotKind::Match, id))
    }

    /// Install a filter that sees every incoming message not consumed by
    /// reply correlation, in installation order.
    pub fn add_filter(
        &mut self,
        callback: impl FnMut(&mut Connection, &Message) -> Result<bool> + 'static,
    ) -> Result<Slot> {
        let id = self.filters.insert(FilterRegistration {
            callback: Some(Box::new(callback)),
            installed_at: self.iteration,
        });
        Ok(Slot::new(SlotKind::Filter, id))
    }

    /// Publish `vtable` at `path`.
    pub fn add_object(&mut self, path: &str, vtable: Vtable) -> Result<Slot> {
        self.add_object_inner(path, vtable, false)
    }

    /// Publish `vtable` for `path` and everything below it.
    pub fn add_fallback(&mut self, path: &str, vtable: Vtable) -> Result<Slot> {
        self.add_object_inner(path, vtable, true)
    }

    fn add_object_inner(&mut self, path: &str, vtable: Vtable, fallback: bool) -> Result<Slot> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("bad object path {path:?}")));
        }
        let interface = vtable.interface().to_owned();
        let id = self.objects.regs.insert(Registration {
            path: path.to_owned(),
            fallback,
            vtable: Arc::new(vtable),
        });
        if !fallback && self.path_is_managed(path) {
            let body = interfaces_added_body(&self.objects, path, &[&interface]);
            self.try_emit_manager_signal(path, "InterfacesAdded", body);
        }
        let kind = if fallback {
            SlotKind::Fallback
        } else {
            SlotKind::Object
        };
        Ok(Slot::new(kind, id))
    }

    /// Announce objects below `path` through the ObjectManager interface.
    pub fn add_object_manager(&mut self, path: &str) -> Result<Slot> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("bad object path {path:?}")));
        }
        let id = self.objects.managers.insert(path.to_owned());
        Ok(Slot::new(SlotKind::ObjectManager, id))
    }

    /// Provide dynamic child node names for introspection below `path`.
    pub fn add_node_enumerator(
        &mut self,
        path: &str,
        enumerate: impl Fn(&str) -> Vec<String> + 'static,
    ) -> Result<Slot> {
        if !object_path_is_valid(path) {
            return Err(Error::InvalidArgument(format!("bad object path {path:?}")));
        }
        let e: NodeEnumerator = Arc::new(enumerate);
        let id = self.objects.enumerators.insert((path.to_owned(), e));
        Ok(Slot::new(SlotKind::NodeEnumerator, id))
    }

    /// Release a registration. Releasing twice is a no-op; returns whether
    /// the slot was still live.
    pub fn release(&mut self, slot: Slot) -> bool {
        // A floating registration belongs to the connection; the handle no
        // longer controls its lifetime.
        if slot.is_floating() {
            return false;
        }
        match slot.kind() {
            SlotKind::PendingCall => self.pending.cancel(slot.id),
            SlotKind::Match => match self.matches.remove(slot.id) {
                Some(reg) => {
                    self.match_tree.remove(&reg.rule, slot.id);
                    if let Err(e) = self.sync_bus_match("RemoveMatch", &reg.rule) {
                        debug!("RemoveMatch not sent: {e}");
                    }
                    true
                }
                None => false,
            },
            SlotKind::Filter => self.filters.remove(slot.id).is_some(),
            SlotKind::Object | SlotKind::Fallback => match self.objects.regs.remove(slot.id) {
                Some(reg) => {
                    if !reg.fallback && self.path_is_managed(&reg.path) {
                        let body =
                            interfaces_removed_body(&reg.path, &[reg.vtable.interface()]);
                        self.try_emit_manager_signal(&reg.path, "InterfacesRemoved", body);
                    }
                    true
                }
                None => false,
            },
            SlotKind::ObjectManager => self.objects.managers.remove(slot.id).is_some(),
            SlotKind::NodeEnumerator => self.objects.enumerators.remove(slot.id).is_some(),
        }
    }

    fn path_is_managed(&self, path: &str) -> bool {
        self.objects
            .managers
            .iter()
            .any(|(_, root)| root != path && object_path_startswith(path, root))
    }

    fn try_emit_manager_signal(&mut self, path: &str, member: &str, body: Vec<Value>) {
        let Some(root) = self
            .objects
            .managers
            .iter()
            .map(|(_, r)| r.clone())
            .find(|r| r != path && object_path_startswith(path, r))
        else {
            return;
        };
        let result = Message::new_signal(&root, OBJECT_MANAGER_IFACE, member)
            .and_then(|mut m| {
                m.append_all(body)?;
                Ok(m)
            })
            .and_then(|m| self.queue_send(m));
        if let Err(e) = result {
            debug!("{member} signal not sent: {e}");
        }
    }

    /// Emit `PropertiesChanged` for the named properties of `interface` at
    /// `path`. Properties whose getter fails are reported as invalidated.
    pub fn emit_properties_changed(
        &mut self,
        path: &str,
        interface: &str,
        names: &[&str],
    ) -> Result<u64> {
        let body = properties_changed_body(&self.objects, path, interface, names);
        let mut m = Message::new_signal(path, PROPERTIES_IFACE, "PropertiesChanged")?;
        m.append_all(body)?;
        self.send(m)
    }

    /// Emit `PropertiesChanged` naming the properties as invalidated,
    /// without their values.
    pub fn emit_properties_invalidated(
        &mut self,
        path: &str,
        interface: &str,
        names: &[&str],
    ) -> Result<u64> {
        let body = properties_invalidated_body(interface, names);
        let mut m = Message::new_signal(path, PROPERTIES_IFACE, "PropertiesChanged")?;
        m.append_all(body)?;
        self.send(m)
    }

    fn sync_bus_match(&mut self, verb: &str, rule: &MatchRule) -> Result<()> {
        if !self.bus_client {
            return Ok(());
        }
        if !matches!(
            self.state,
            ConnectionState::Authenticating | ConnectionState::Hello | ConnectionState::Running
        ) {
            return Ok(());
        }
        let mut m = Message::new_method_call(Some(BUS_SERVICE), BUS_PATH, Some(BUS_INTERFACE), verb)?;
        m.append(rule.to_string())?;
        m.set_flags(MessageFlags::NO_REPLY_EXPECTED)?;
        self.queue_send(m)?;
        Ok(())
    }

    // --- processing ---

    /// Perform one unit of work: expire a timeout, move bytes, or dispatch
    /// one incoming message. Returns whether anything was done; call again
    /// until it returns `false`, then poll.
    pub fn process(&mut self) -> Result<bool> {
        self.assert_same_process()?;
        match self.process_inner() {
            Err(e) => Err(self.fail_on_fatal(e)),
            ok => ok,
        }
    }

    /// Tear the connection down when `e` is unrecoverable. Every path that
    /// performs I/O routes its errors through here so a transport failure
    /// reaches `Closing` no matter which entry point hit it. A rejected
    /// Hello is unrecoverable too: the bus will not talk to us.
    fn fail_on_fatal(&mut self, e: Error) -> Error {
        let hello_refused =
            self.state == ConnectionState::Hello && matches!(e, Error::Method(_));
        if e.is_fatal()
            || hello_refused
            || matches!(e, Error::AuthFailed(_) | Error::AuthRejected(_))
        {
            warn!("connection failed: {e}");
            self.close();
            if self.exit_on_disconnect {
                std::process::exit(1);
            }
        }
        e
    }

    fn process_inner(&mut self) -> Result<bool> {
        match self.state {
            ConnectionState::Unset => Err(Error::NotConnected),
            ConnectionState::Closed | ConnectionState::Closing => Ok(false),
            ConnectionState::WatchBind => self.try_reconnect(),
            _ => {
                if self.state == ConnectionState::Authenticating {
                    if let Some(dl) = self.auth_deadline {
                        if Instant::now() >= dl {
                            return Err(Error::AuthFailed("handshake timed out".into()));
                        }
                    }
                }
                let mut progress = false;
                progress |= self.dispatch_expired()?;
                progress |= self.flush_write()?;
                progress |= self.read_input()?;
                if let Some(m) = self.rqueue.pop_front() {
                    self.dispatch_message(m)?;
                    progress = true;
                }
                Ok(progress)
            }
        }
    }

    fn try_reconnect(&mut self) -> Result<bool> {
        let Some(addrs) = self.retry_addrs.take() else {
            return Err(Error::NotConnected);
        };
        match Transport::connect(&addrs) {
            Ok(t) => {
                self.attach_client_transport(t)?;
                Ok(true)
            }
            Err(Error::Io(e)) if socket_not_there(&e) => {
                self.retry_addrs = Some(addrs);
                Ok(false)
            }
            Err(e) => Err(e),
        }
    }

    fn flush_write(&mut self) -> Result<bool> {
        let Some(t) = self.transport.as_mut() else {
            return Ok(false);
        };
        let mut progress = false;
        while !self.auth_out.is_empty() {
            match t.send(&self.auth_out, &[]) {
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(n) => {
                    self.auth_out.drain(..n);
                    progress = true;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(progress),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(e)),
            }
        }
        // Frames only flow once authentication is over.
        if matches!(
            self.state,
            ConnectionState::Opening | ConnectionState::Authenticating
        ) {
            return Ok(progress);
        }
        while let Some(front) = self.wqueue.front_mut() {
            let fds: &[OwnedFd] = if self.wpos == 0 { &front.fds } else { &[] };
            match t.send(&front.buf[self.wpos..], fds) {
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(n) => {
                    if self.wpos == 0 {
                        front.fds.clear();
                    }
                    self.wpos += n;
                    progress = true;
                    if self.wpos >= front.buf.len() {
                        self.wqueue.pop_front();
                        self.wpos = 0;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(e)),
            }
        }
        Ok(progress)
    }

    fn read_input(&mut self) -> Result<bool> {
        if !self.wants_read() || self.rqueue.len() >= MAX_READ_QUEUE {
            return Ok(false);
        }
        let mut progress = false;
        let mut chunk = [0u8; RECV_CHUNK];
        loop {
            let Some(t) = self.transport.as_mut() else {
                return Ok(progress);
            };
            let n = match t.recv(&mut chunk, &mut self.rfds) {
                Ok(0) => return Err(Error::ConnectionReset),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(map_io(e)),
            };
            progress = true;
            if self.rfds.len() > MAX_FDS {
                self.close();
                return Err(Error::Protocol("too many queued file descriptors".into()));
            }
            if self.state == ConnectionState::Authenticating {
                self.advance_auth(&chunk[..n])?;
                if self.state == ConnectionState::Authenticating {
                    continue;
                }
                break;
            }
            self.rbuf.extend_from_slice(&chunk[..n]);
            self.extract_frames()?;
            if self.rqueue.len() >= MAX_READ_QUEUE {
                break;
            }
        }
        Ok(progress)
    }

    fn advance_auth(&mut self, bytes: &[u8]) -> Result<()> {
        let status = if let Some(c) = self.sasl_client.as_mut() {
            let s = c.handle_input(bytes)?;
            self.auth_out.extend(c.take_output());
            s
        } else if let Some(s) = self.sasl_server.as_mut() {
            let st = s.handle_input(bytes)?;
            self.auth_out.extend(s.take_output());
            st
        } else {
            return Err(Error::AuthFailed("no authentication exchange".into()));
        };
        if status == SaslStatus::Done {
            self.finish_auth()?;
        }
        Ok(())
    }

    fn finish_auth(&mut self) -> Result<()> {
        self.auth_deadline = None;
        let transport_fds = self
            .transport
            .as_ref()
            .is_some_and(Transport::can_pass_fds);
        if let Some(mut c) = self.sasl_client.take() {
            self.can_fds = c.fds_agreed() && transport_fds;
            self.guid = c.server_guid().map(str::to_owned);
            self.rbuf.extend(c.take_leftover());
        } else if let Some(mut s) = self.sasl_server.take() {
            self.can_fds = s.fds_agreed() && transport_fds;
            self.rbuf.extend(s.take_leftover());
        }
        debug!(
            "authenticated, fd passing {}",
            if self.can_fds { "on" } else { "off" }
        );
        if self.bus_client {
            self.send_hello()?;
        } else {
            self.enter_running();
        }
        // Leftover bytes may already hold complete frames.
        self.extract_frames()?;
        self.flush_write()?;
        Ok(())
    }

    fn send_hello(&mut self) -> Result<()> {
        self.state = ConnectionState::Hello;
        let m = Message::new_method_call(Some(BUS_SERVICE), BUS_PATH, Some(BUS_INTERFACE), "Hello")?;
        let slot = self.call_async_boxed(
            m,
            Box::new(|conn: &mut Connection, reply: Message| {
                if let Some(e) = reply.as_bus_error() {
                    return Err(Error::Method(e));
                }
                conn.unique_name = reply.string_arg(0).map(str::to_owned);
                debug!("unique name {:?}", conn.unique_name);
                conn.enter_running();
                Ok(true)
            }),
            None,
        )?;
        let _ = slot;
        Ok(())
    }

    fn enter_running(&mut self) {
        self.state = ConnectionState::Running;
        self.pending.anchor_all(Instant::now());
        let sig = Message::new_local_signal("Connected");
        self.iteration = self.iteration.wrapping_add(1);
        if let Err(e) = self
            .run_filters(&sig)
            .and_then(|consumed| if consumed { Ok(()) } else { self.run_matches(&sig) })
        {
            debug!("connect-time dispatch failed: {e}");
        }
    }

    fn extract_frames(&mut self) -> Result<()> {
        loop {
            let len = match peek_frame_len(&self.rbuf) {
                Ok(Some(len)) => len,
                Ok(None) => return Ok(()),
                Err(e) => {
                    // The stream cannot be re-framed after a bad header.
                    self.close();
                    return Err(e);
                }
            };
            if self.rbuf.len() < len {
                return Ok(());
            }
            let frame: Vec<u8> = self.rbuf.drain(..len).collect();
            match decode_message(&frame, self.rfds.len()) {
                Ok(mut m) => {
                    m.fds = std::mem::take(&mut self.rfds);
                    trace!(
                        "recv {} cookie={} sig={:?}",
                        m.message_type().as_str(),
                        m.cookie(),
                        m.signature()
                    );
                    self.rqueue.push_back(m);
                }
                Err(e) => {
                    // Frame-scoped: the stream stays framed, drop the
                    // message and any descriptors that rode with it.
                    warn!("discarding undecodable message: {e}");
                    self.rfds.clear();
                }
            }
        }
    }

    fn dispatch_expired(&mut self) -> Result<bool> {
        let now = Instant::now();
        let mut progress = false;
        while let Some(id) = self.pending.pop_expired(now) {
            let Some((cookie, mut cb)) = self.pending.take_callback(id) else {
                self.pending.finish(id);
                continue;
            };
            self.pending.finish(id);
            debug!("call cookie={cookie} timed out");
            let m = Message::new_synthetic_error(cookie, &Error::Timeout.to_bus_error());
            progress = true;
            cb(self, m)?;
        }
        Ok(progress)
    }

    fn dispatch_message(&mut self, m: Message) -> Result<()> {
        self.iteration = self.iteration.wrapping_add(1);
        let m = match self.dispatch_reply(m)? {
            Some(m) => m,
            None => return Ok(()),
        };
        if self.run_filters(&m)? {
            return Ok(());
        }
        match m.message_type() {
            MessageType::Signal => self.run_matches(&m),
            MessageType::MethodCall => self.dispatch_call(&m),
            _ => {
                debug!("dropping unexpected reply cookie={:?}", m.reply_cookie());
                Ok(())
            }
        }
    }

    /// Route a reply to its pending call. Returns the message back if no
    /// call claims it.
    fn dispatch_reply(&mut self, m: Message) -> Result<Option<Message>> {
        if !m.message_type().is_reply() {
            return Ok(Some(m));
        }
        let Some(rc) = m.reply_cookie() else {
            return Ok(Some(m));
        };
        let Some(id) = self.pending.id_for_cookie(rc) else {
            return Ok(Some(m));
        };
        let Some((_, mut cb)) = self.pending.take_callback(id) else {
            self.pending.finish(id);
            return Ok(Some(m));
        };
        let r = cb(self, m);
        self.pending.finish(id);
        r.map(|_| None)
    }

    fn run_filters(&mut self, m: &Message) -> Result<bool> {
        for id in self.filters.ids() {
            let Some(reg) = self.filters.get_mut(id) else {
                continue;
            };
            if reg.installed_at == self.iteration {
                continue;
            }
            let Some(mut cb) = reg.callback.take() else {
                continue;
            };
            let r = cb(self, m);
            if let Some(reg) = self.filters.get_mut(id) {
                reg.callback = Some(cb);
            }
            if r? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn run_matches(&mut self, m: &Message) -> Result<()> {
        for id in self.match_tree.candidates(m) {
            let Some(reg) = self.matches.get_mut(id) else {
                continue;
            };
            if reg.installed_at == self.iteration || !reg.rule.matches(m) {
                continue;
            }
            let Some(mut cb) = reg.callback.take() else {
                continue;
            };
            let r = cb(self, m);
            if let Some(reg) = self.matches.get_mut(id) {
                reg.callback = Some(cb);
            }
            if r? {
                return Ok(());
            }
        }
        Ok(())
    }

    fn dispatch_call(&mut self, m: &Message) -> Result<()> {
        let plan = resolve_call(&mut self.objects, m);
        let result: std::result::Result<Vec<Value>, BusError> = match plan {
            Dispatch::Immediate(values) => Ok(values),
            Dispatch::Error(e) => Err(e),
            Dispatch::Handler {
                handler,
                privileged,
                interface,
            } => {
                if privileged && !self.authorize(m, &interface) {
                    Err(BusError::new(
                        name::ACCESS_DENIED,
                        format!(
                            "not authorized to call {interface}.{}",
                            m.member().unwrap_or_default()
                        ),
                    ))
                } else {
                    (*handler)(self, m)
                }
            }
            Dispatch::SetProperty {
                setter,
                value,
                emits_changed,
                interface,
                property,
            } => match (*setter)(value) {
                Ok(()) => {
                    if let Some(path) = m.path() {
                        let path = path.to_owned();
                        let sent = match emits_changed {
                            EmitsChanged::True => {
                                self.emit_properties_changed(&path, &interface, &[&property])
                            }
                            EmitsChanged::Invalidates => {
                                self.emit_properties_invalidated(&path, &interface, &[&property])
                            }
                            EmitsChanged::False | EmitsChanged::Const => Ok(0),
                        };
                        if let Err(e) = sent {
                            debug!("PropertiesChanged not sent: {e}");
                        }
                    }
                    Ok(vec![])
                }
                Err(e) => Err(e),
            },
        };
        if m.flags().contains(MessageFlags::NO_REPLY_EXPECTED) {
            return Ok(());
        }
        let reply = match result {
            Ok(values) => {
                let mut r = Message::new_method_return(m)?;
                r.append_all(values)?;
                r
            }
            Err(e) => Message::new_method_error(m, &e)?,
        };
        self.queue_send(reply)?;
        Ok(())
    }

    fn authorize(&self, m: &Message, interface: &str) -> bool {
        let ctx = AuthorizationContext {
            path: m.path().unwrap_or("/"),
            interface,
            member: m.member().unwrap_or_default(),
            sender: m.sender(),
            peer: self.peer_credentials(),
        };
        (*self.authorizer)(&ctx)
    }

    // --- teardown ---

    /// Close the connection: fail outstanding calls in send order with a
    /// `Disconnected` error, deliver the local `Disconnected` signal, and
    /// shut the transport down. Idempotent.
    pub fn close(&mut self) {
        if matches!(self.state, ConnectionState::Closing | ConnectionState::Closed) {
            return;
        }
        self.state = ConnectionState::Closing;
        let err = BusError::new(name::DISCONNECTED, "Connection terminated");
        for (cookie, mut cb) in self.pending.drain_in_order() {
            let m = Message::new_synthetic_error(cookie, &err);
            if let Err(e) = cb(self, m) {
                debug!("close-time callback failed: {e}");
            }
        }
        let sig = Message::new_local_signal("Disconnected");
        self.iteration = self.iteration.wrapping_add(1);
        if let Err(e) = self
            .run_filters(&sig)
            .and_then(|consumed| if consumed { Ok(()) } else { self.run_matches(&sig) })
        {
            debug!("close-time dispatch failed: {e}");
        }
        if let Some(t) = &self.transport {
            t.shutdown();
        }
        self.transport = None;
        self.wqueue.clear();
        self.rqueue.clear();
        self.rbuf.clear();
        self.rfds.clear();
        self.state = ConnectionState::Closed;
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Some(t) = &self.transport {
            t.shutdown();
        }
    }
}

static CACHED_PID: std::sync::atomic::AtomicU32 = std::sync::atomic::AtomicU32::new(0);

fn cached_pid() -> u32 {
    use std::sync::atomic::Ordering;
    match CACHED_PID.load(Ordering::Relaxed) {
        0 => {
            let pid = std::process::id();
            CACHED_PID.store(pid, Ordering::Relaxed);
            pid
        }
        pid => pid,
    }
}

/// Invalidate the process-wide cached pid. Must be called in the child
/// after `fork()` so connections inherited from the parent refuse use
/// instead of corrupting the shared socket.
pub fn reset_cached_pid_after_fork() {
    CACHED_PID.store(0, std::sync::atomic::Ordering::Relaxed);
}

fn socket_not_there(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::NotFound | io::ErrorKind::ConnectionRefused
    )
}

/// 32 hex digit server GUID for the SASL exchange.
fn random_guid() -> String {
    use std::io::Read;
    let mut bytes = [0u8; 16];
    let filled = std::fs::File::open("/dev/urandom")
        .and_then(|mut f| f.read_exact(&mut bytes))
        .is_ok();
    if !filled {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        bytes[..16].copy_from_slice(&nanos.to_le_bytes());
        let pid = std::process::id().to_le_bytes();
        for (b, p) in bytes.iter_mut().zip(pid.iter().cycle()) {
            *b ^= p;
        }
    }
    let mut s = String::with_capacity(32);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(s, "{b:02x}");
    }
    s
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::os::unix::net::UnixStream;
    use std::rc::Rc;

    fn pair() -> (Connection, Connection) {
        let (a, b) = UnixStream::pair().unwrap();
        let server = Connection::new_server(Transport::from(a), true).unwrap();
        let client = Connection::new_client(Transport::from(b)).unwrap();
        (client, server)
    }

    fn pump(a: &mut Connection, b: &mut Connection) {
        for _ in 0..200 {
            let pa = a.process().unwrap();
            let pb = b.process().unwrap();
            if !pa && !pb {
                return;
            }
        }
        panic!("connections did not go quiescent");
    }

    fn calc_vtable(log: Rc<RefCell<Vec<String>>>) -> Vtable {
        let log2 = log.clone();
        Vtable::new("org.example.Calc")
            .method("Add", "ii", "i", |_, m| {
                let mut c = m.body();
                let a = c.read_i32().map_err(|e| BusError::failed(e.to_string()))?;
                let b = c.read_i32().map_err(|e| BusError::failed(e.to_string()))?;
                Ok(vec![Value::Int32(a + b)])
            })
            .privileged_method("Reset", "", "", move |_, _| {
                log2.borrow_mut().push("reset".into());
                Ok(vec![])
            })
    }

    #[test]
    fn local_connected_signal_reaches_filters() {
        let (mut client, mut server) = pair();
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        client
            .add_filter(move |_, m| {
                if let Some(member) = m.member() {
                    s.borrow_mut().push(member.to_owned());
                }
                Ok(false)
            })
            .unwrap();
        pump(&mut client, &mut server);
        assert_eq!(client.state(), ConnectionState::Running);
        assert!(seen.borrow().iter().any(|m| m == "Connected"));
    }

    #[test]
    fn handshake_reaches_running_on_both_ends() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        assert_eq!(client.state(), ConnectionState::Running);
        assert_eq!(server.state(), ConnectionState::Running);
        // A socketpair supports fd passing, so negotiation must land on it.
        assert!(client.can_pass_fds());
        assert!(server.can_pass_fds());
        assert_eq!(client.server_guid().map(str::len), Some(32));
    }

    #[test]
    fn method_call_round_trip() {
        let (mut client, mut server) = pair();
        let log = Rc::new(RefCell::new(Vec::new()));
        server.add_object("/calc", calc_vtable(log)).unwrap();
        pump(&mut client, &mut server);

        let mut m =
            Message::new_method_call(None, "/calc", Some("org.example.Calc"), "Add").unwrap();
        m.append_all([2i32, 40i32]).unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        client
            .call_async(
                m,
                move |_, reply| {
                    *got2.borrow_mut() = Some(reply);
                    Ok(true)
                },
                None,
            )
            .unwrap();
        pump(&mut client, &mut server);

        let reply = got.borrow_mut().take().expect("no reply");
        assert_eq!(reply.message_type(), MessageType::MethodReturn);
        assert_eq!(reply.body_values(), &[Value::Int32(42)]);
    }

    #[test]
    fn missing_object_reports_unknown_object() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let m = Message::new_method_call(None, "/nowhere", Some("a.b"), "Poke").unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        client
            .call_async(
                m,
                move |_, reply| {
                    *got2.borrow_mut() = reply.as_bus_error();
                    Ok(true)
                },
                None,
            )
            .unwrap();
        pump(&mut client, &mut server);
        let err = got.borrow_mut().take().expect("no error reply");
        assert_eq!(err.name, name::UNKNOWN_OBJECT);
    }

    #[test]
    fn denied_privileged_call_never_runs_the_handler() {
        let (mut client, mut server) = pair();
        let log = Rc::new(RefCell::new(Vec::new()));
        server.add_object("/calc", calc_vtable(log.clone())).unwrap();
        server.set_authorizer(|_| false);
        pump(&mut client, &mut server);

        let m =
            Message::new_method_call(None, "/calc", Some("org.example.Calc"), "Reset").unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        client
            .call_async(
                m,
                move |_, reply| {
                    *got2.borrow_mut() = reply.as_bus_error();
                    Ok(true)
                },
                None,
            )
            .unwrap();
        pump(&mut client, &mut server);
        let err = got.borrow_mut().take().expect("no error reply");
        assert_eq!(err.name, name::ACCESS_DENIED);
        assert!(log.borrow().is_empty());
    }

    #[test]
    fn authorized_privileged_call_runs() {
        let (mut client, mut server) = pair();
        let log = Rc::new(RefCell::new(Vec::new()));
        server.add_object("/calc", calc_vtable(log.clone())).unwrap();
        // The default authorizer accepts our own uid over a socketpair.
        pump(&mut client, &mut server);

        let m =
            Message::new_method_call(None, "/calc", Some("org.example.Calc"), "Reset").unwrap();
        client.call_async(m, |_, _| Ok(true), None).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(log.borrow().as_slice(), ["reset"]);
    }

    #[test]
    fn signals_reach_every_subscriber() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);

        let hits = Rc::new(RefCell::new(0u32));
        let (h1, h2) = (hits.clone(), hits.clone());
        client
            .add_match("type='signal',interface='org.example.Ev'", move |_, _| {
                *h1.borrow_mut() += 1;
                Ok(false)
            })
            .unwrap();
        client
            .add_match("type='signal',member='Pulse'", move |_, _| {
                *h2.borrow_mut() += 1;
                Ok(false)
            })
            .unwrap();

        let sig = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        server.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 2);

        // An unrelated signal reaches neither.
        let sig = Message::new_signal("/ev", "org.other.Ev", "Tick").unwrap();
        server.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 2);
    }

    #[test]
    fn consuming_subscriber_stops_later_ones() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let hits = Rc::new(RefCell::new(0u32));
        let h = hits.clone();
        client
            .add_match("interface='org.example.Ev'", move |_, _| {
                *h.borrow_mut() += 1;
                Ok(true)
            })
            .unwrap();
        let h = hits.clone();
        client
            .add_match("interface='org.example.Ev'", move |_, _| {
                *h.borrow_mut() += 1;
                Ok(false)
            })
            .unwrap();
        let sig = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        server.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn timed_out_call_gets_a_synthesized_no_reply() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let m = Message::new_method_call(None, "/slow", Some("a.b"), "Never").unwrap();
        let got = Rc::new(RefCell::new(None));
        let got2 = got.clone();
        client
            .call_async(
                m,
                move |_, reply| {
                    assert!(reply.is_local());
                    *got2.borrow_mut() = reply.as_bus_error();
                    Ok(true)
                },
                Some(Duration::ZERO),
            )
            .unwrap();
        // Only the client runs; the server never answers.
        while client.process().unwrap() {}
        let err = got.borrow_mut().take().expect("no synthesized error");
        assert_eq!(err.name, name::NO_REPLY);
    }

    #[test]
    fn close_fails_outstanding_calls_in_send_order() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let order = Rc::new(RefCell::new(Vec::new()));
        for tag in ["first", "second"] {
            let m = Message::new_method_call(None, "/slow", Some("a.b"), "Never").unwrap();
            let o = order.clone();
            client
                .call_async(
                    m,
                    move |_, reply| {
                        let e = reply.as_bus_error().expect("not an error");
                        assert_eq!(e.name, name::DISCONNECTED);
                        o.borrow_mut().push(tag);
                        Ok(true)
                    },
                    None,
                )
                .unwrap();
        }
        let disconnected = Rc::new(RefCell::new(false));
        let d = disconnected.clone();
        client
            .add_filter(move |_, m| {
                if m.is_local() && m.member() == Some("Disconnected") {
                    *d.borrow_mut() = true;
                }
                Ok(false)
            })
            .unwrap();
        client.close();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert_eq!(order.borrow().as_slice(), ["first", "second"]);
        assert!(*disconnected.borrow());
        // Idempotent.
        client.close();
        let _ = server;
    }

    #[test]
    fn released_match_slot_stops_delivery() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let hits = Rc::new(RefCell::new(0u32));
        let h = hits.clone();
        let slot = client
            .add_match("interface='org.example.Ev'", move |_, _| {
                *h.borrow_mut() += 1;
                Ok(false)
            })
            .unwrap();
        assert!(client.release(slot));
        assert!(!client.release(slot));
        let sig = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        server.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 0);
    }

    #[test]
    fn floating_slot_release_is_ignored() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let hits = Rc::new(RefCell::new(0u32));
        let h = hits.clone();
        let mut slot = client
            .add_match("interface='org.example.Ev'", move |_, _| {
                *h.borrow_mut() += 1;
                Ok(false)
            })
            .unwrap();
        slot.set_floating(true);
        assert!(!client.release(slot));
        // The subscription stays with the connection.
        let sig = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        server.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn blocking_call_failure_tears_the_connection_down() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        server.close();
        drop(server);
        let m = Message::new_method_call(None, "/x", Some("a.b"), "Poke").unwrap();
        let err = client
            .call(m, Some(Duration::from_millis(100)))
            .expect_err("peer is gone");
        assert!(err.is_fatal());
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn rejected_hello_closes_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let addr = format!("unix:path={}", dir.path().join("bus").display());
        let listener = Listener::bind(&AddressList::parse(&addr).unwrap()).unwrap();
        let mut client = Connection::open_address(&addr, true).unwrap();
        let mut server = Connection::accept(&listener, true).unwrap();

        // The peer is not a bus: it has no driver object, so Hello comes
        // back as an error reply.
        let mut rejected = None;
        for _ in 0..200 {
            let _ = server.process().unwrap();
            match client.process() {
                Ok(_) => {}
                Err(e) => {
                    rejected = Some(e);
                    break;
                }
            }
        }
        assert!(matches!(rejected, Some(Error::Method(_))));
        assert_eq!(client.state(), ConnectionState::Closed);
    }

    #[test]
    fn declared_signal_signature_is_enforced() {
        let (mut client, mut server) = pair();
        server
            .add_object("/clock", Vtable::new("org.example.Clock").signal("Tick", "u"))
            .unwrap();
        pump(&mut client, &mut server);

        let mut bad = Message::new_signal("/clock", "org.example.Clock", "Tick").unwrap();
        bad.append("late").unwrap();
        assert!(matches!(server.send(bad), Err(Error::InvalidArgument(_))));

        let mut ok = Message::new_signal("/clock", "org.example.Clock", "Tick").unwrap();
        ok.append(7u32).unwrap();
        server.send(ok).unwrap();

        // Signals nothing at the path declares pass through untouched.
        let free = Message::new_signal("/ev", "org.other.Ev", "Pulse").unwrap();
        server.send(free).unwrap();
    }

    #[test]
    fn fds_ride_along_once_negotiated() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        let got = Rc::new(RefCell::new(0usize));
        let g = got.clone();
        server
            .add_match("interface='org.example.Fd'", move |_, m| {
                *g.borrow_mut() = m.fd_count();
                Ok(true)
            })
            .unwrap();
        let mut sig = Message::new_signal("/fd", "org.example.Fd", "Take").unwrap();
        let file = std::fs::File::open("/dev/null").unwrap();
        sig.append_fd(OwnedFd::from(file)).unwrap();
        client.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*got.borrow(), 1);
    }

    #[test]
    fn properties_changed_is_emitted_after_a_set() {
        let (mut client, mut server) = pair();
        let label = Rc::new(RefCell::new(String::from("old")));
        let (l1, l2) = (label.clone(), label.clone());
        let vtable = Vtable::new("org.example.Cfg").writable_property(
            "Label",
            "s",
            move || Ok(Value::String(l1.borrow().clone())),
            move |v| match v {
                Value::String(s) => {
                    *l2.borrow_mut() = s;
                    Ok(())
                }
                _ => Err(BusError::invalid_args("expected a string")),
            },
        );
        server.add_object("/cfg", vtable).unwrap();
        pump(&mut client, &mut server);

        let changed = Rc::new(RefCell::new(false));
        let c = changed.clone();
        client
            .add_match(
                "interface='org.freedesktop.DBus.Properties',member='PropertiesChanged'",
                move |_, m| {
                    assert_eq!(m.string_arg(0), Some("org.example.Cfg"));
                    *c.borrow_mut() = true;
                    Ok(true)
                },
            )
            .unwrap();

        let mut m = Message::new_method_call(None, "/cfg", Some(PROPERTIES_IFACE), "Set").unwrap();
        m.append_all([
            Value::String("org.example.Cfg".into()),
            Value::String("Label".into()),
            Value::Variant(Box::new(Value::String("new".into()))),
        ])
        .unwrap();
        client.call_async(m, |_, _| Ok(true), None).unwrap();
        pump(&mut client, &mut server);

        assert_eq!(label.borrow().as_str(), "new");
        assert!(*changed.borrow());
    }

    #[test]
    fn invalidating_property_set_reports_no_value() {
        let (mut client, mut server) = pair();
        let vtable = Vtable::new("org.example.Vault")
            .writable_property(
                "Secret",
                "s",
                || Ok(Value::String("hidden".into())),
                |_| Ok(()),
            )
            .emits_changed(EmitsChanged::Invalidates);
        server.add_object("/vault", vtable).unwrap();
        pump(&mut client, &mut server);

        let body = Rc::new(RefCell::new(None));
        let b = body.clone();
        client
            .add_match(
                "interface='org.freedesktop.DBus.Properties',member='PropertiesChanged'",
                move |_, m| {
                    *b.borrow_mut() = Some(m.body_values().to_vec());
                    Ok(true)
                },
            )
            .unwrap();

        let mut m =
            Message::new_method_call(None, "/vault", Some(PROPERTIES_IFACE), "Set").unwrap();
        m.append_all([
            Value::String("org.example.Vault".into()),
            Value::String("Secret".into()),
            Value::Variant(Box::new(Value::String("new".into()))),
        ])
        .unwrap();
        client.call_async(m, |_, _| Ok(true), None).unwrap();
        pump(&mut client, &mut server);

        let body = body.borrow_mut().take().expect("no PropertiesChanged");
        assert_eq!(body[0], Value::String("org.example.Vault".into()));
        assert_eq!(body[1], Value::Array("{sv}".into(), vec![]));
        assert_eq!(
            body[2],
            Value::Array("s".into(), vec![Value::String("Secret".into())])
        );
    }

    #[test]
    fn silent_change_policy_suppresses_the_signal() {
        let (mut client, mut server) = pair();
        let stored = Rc::new(RefCell::new(String::new()));
        let s = stored.clone();
        let vtable = Vtable::new("org.example.Cfg")
            .writable_property(
                "Scratch",
                "s",
                || Ok(Value::String("x".into())),
                move |v| match v {
                    Value::String(v) => {
                        *s.borrow_mut() = v;
                        Ok(())
                    }
                    _ => Err(BusError::invalid_args("expected a string")),
                },
            )
            .emits_changed(EmitsChanged::False);
        server.add_object("/cfg", vtable).unwrap();
        pump(&mut client, &mut server);

        let signalled = Rc::new(RefCell::new(false));
        let f = signalled.clone();
        client
            .add_match("member='PropertiesChanged'", move |_, _| {
                *f.borrow_mut() = true;
                Ok(true)
            })
            .unwrap();

        let mut m = Message::new_method_call(None, "/cfg", Some(PROPERTIES_IFACE), "Set").unwrap();
        m.append_all([
            Value::String("org.example.Cfg".into()),
            Value::String("Scratch".into()),
            Value::Variant(Box::new(Value::String("quiet".into()))),
        ])
        .unwrap();
        client.call_async(m, |_, _| Ok(true), None).unwrap();
        pump(&mut client, &mut server);

        // The setter ran, the change was not announced.
        assert_eq!(stored.borrow().as_str(), "quiet");
        assert!(!*signalled.borrow());
    }

    #[test]
    fn undecodable_frame_is_dropped_without_closing() {
        let (mut client, mut server) = pair();
        pump(&mut client, &mut server);
        // A frame with a valid length header but an unknown message type.
        let mut sig = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        sig.seal(9, None).unwrap();
        let mut frame = encode_message(&sig, WireVersion::V1).unwrap();
        frame[1] = 77;
        server.rbuf.extend_from_slice(&frame);
        server.extract_frames().unwrap();
        assert!(server.rqueue.is_empty());
        assert_eq!(server.state(), ConnectionState::Running);

        // The connection still works afterwards.
        let ok = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        client.send(ok).unwrap();
        let hits = Rc::new(RefCell::new(0u32));
        let h = hits.clone();
        server
            .add_match("interface='org.example.Ev'", move |_, _| {
                *h.borrow_mut() += 1;
                Ok(true)
            })
            .unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 1);
    }

    #[test]
    fn send_before_open_is_rejected() {
        let mut c = Connection::empty();
        let sig = Message::new_signal("/a", "a.b", "S").unwrap();
        assert!(matches!(c.send(sig), Err(Error::NotConnected)));
    }

    #[test]
    fn v2_wire_format_between_peers() {
        let (mut client, mut server) = pair();
        client.set_wire_version(WireVersion::V2);
        server.set_wire_version(WireVersion::V2);
        pump(&mut client, &mut server);
        let hits = Rc::new(RefCell::new(0u32));
        let h = hits.clone();
        server
            .add_match("interface='org.example.Ev'", move |_, m| {
                assert!(m.cookie() > 0);
                *h.borrow_mut() += 1;
                Ok(true)
            })
            .unwrap();
        let sig = Message::new_signal("/ev", "org.example.Ev", "Pulse").unwrap();
        client.send(sig).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(*hits.borrow(), 1);
    }
}
