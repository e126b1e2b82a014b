//!Client and server runtime for a D-Bus style message bus.
//!
//!The crate speaks the classic binary wire format (and a compact second
//!format for peers that opt into it), authenticates over SASL, correlates
//!method calls with replies, routes signals through match rules, and
//!dispatches incoming calls to objects published on the connection. All
//!I/O is non-blocking; a connection plugs into any poll-based event loop
//!through its readiness accessors, or drives itself with
//![`Connection::wait`].
//!
//!Calling a method on the system bus:
//!
//!```rust,no_run
//!use sdbus::{Connection, Message};
//!
//!fn main() -> sdbus::Result<()> {
//!    let mut conn = Connection::open_system()?;
//!    let m = Message::new_method_call(
//!        Some("org.freedesktop.DBus"),
//!        "/org/freedesktop/DBus",
//!        Some("org.freedesktop.DBus"),
//!        "ListNames",
//!    )?;
//!    let reply = conn.call(m, None)?;
//!    let mut body = reply.body();
//!    body.enter()?;
//!    while let Some(name) = body.next() {
//!        println!("{name:?}");
//!    }
//!    Ok(())
//!}
//!```
//!
//!Serving an object to a directly connected peer:
//!
//!```rust,no_run
//!use sdbus::{Connection, Listener, Value, Vtable};
//!use sdbus::address::AddressList;
//!
//!fn main() -> sdbus::Result<()> {
//!    let addrs = AddressList::parse("unix:path=/run/example/socket")?;
//!    let listener = Listener::bind(&addrs)?;
//!    let mut conn = Connection::accept(&listener, false)?;
//!    let vtable = Vtable::new("org.example.Echo").method("Echo", "s", "s", |_, m| {
//!        let text = m.body_values().first().cloned();
//!        Ok(text.into_iter().collect::<Vec<Value>>())
//!    });
//!    conn.add_object("/org/example/echo", vtable)?;
//!    loop {
//!        while conn.process()? {}
//!        conn.wait(None)?;
//!    }
//!}
//!```
//!
//!Signals are received through match rules, with the same string syntax
//!buses use:
//!
//!```rust,no_run
//!# use sdbus::Connection;
//!# fn main() -> sdbus::Result<()> {
//!# let mut conn = Connection::open_session()?;
//!conn.add_match(
//!    "type='signal',interface='org.freedesktop.DBus',member='NameOwnerChanged'",
//!    |_conn, m| {
//!        println!("name owner changed: {:?}", m.body_values());
//!        Ok(false)
//!    },
//!)?;
//!# Ok(())
//!# }
//!```

pub mod address;
pub mod connection;
pub mod error;
pub mod event;
pub mod matchrule;
pub mod message;
pub mod object;
mod pending;
mod sasl;
mod slot;
pub mod socket;
pub mod types;
pub mod wire;

pub use crate::address::{bus_address, Address, AddressList, BusKind};
pub use crate::connection::{
    reset_cached_pid_after_fork, Connection, ConnectionState, MessageCallback,
};
pub use crate::error::{name as error_name, BusError, Error, Result};
pub use crate::event::Interest;
pub use crate::matchrule::MatchRule;
pub use crate::message::{BodyCursor, Message, MessageFlags, MessageType};
pub use crate::object::{AuthorizationContext, Authorizer, EmitsChanged, MethodResult, Vtable};
pub use crate::pending::DEFAULT_CALL_TIMEOUT;
pub use crate::slot::{Slot, SlotKind};
pub use crate::socket::{Listener, PeerCredentials, Transport};
pub use crate::types::Value;
pub use crate::wire::WireVersion;
