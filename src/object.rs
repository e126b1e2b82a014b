//! Objects, vtables and method dispatch.
//!
//! Callers publish a [`Vtable`] at a path (exactly, or as a fallback for a
//! whole subtree). Incoming calls resolve to a handler or to one of the
//! built-in interfaces, which are answered for every published object:
//! Peer, Introspectable, Properties and (where registered) ObjectManager.
//!
//! Resolution is split from invocation: [`resolve_call`] inspects the
//! registry and returns a [`Dispatch`] plan holding cloned handles, so the
//! connection can run user code with the registry borrow released.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use log::debug;

use crate::error::{name, BusError};
use crate::message::Message;
use crate::slot::SlotArena;
use crate::socket::PeerCredentials;
use crate::types::{object_path_startswith, signature_of, Value};

/// Names of the built-in interfaces.
pub const PEER_IFACE: &str = "org.freedesktop.DBus.Peer";
pub const INTROSPECTABLE_IFACE: &str = "org.freedesktop.DBus.Introspectable";
pub const PROPERTIES_IFACE: &str = "org.freedesktop.DBus.Properties";
pub const OBJECT_MANAGER_IFACE: &str = "org.freedesktop.DBus.ObjectManager";

/// Reported when `/etc/machine-id` is unreadable; answering Peer calls must
/// not depend on its presence.
const NIL_MACHINE_ID: &str = "00000000000000000000000000000000";

pub type MethodResult = std::result::Result<Vec<Value>, BusError>;
/// A method implementation. The connection is available for sending
/// signals or follow-up calls.
pub type MethodHandler =
    Arc<dyn Fn(&mut crate::connection::Connection, &Message) -> MethodResult>;
pub type PropertyGetter = Arc<dyn Fn() -> std::result::Result<Value, BusError>>;
pub type PropertySetter = Arc<dyn Fn(Value) -> std::result::Result<(), BusError>>;
/// Yields the direct children (single path segments) of a subtree path.
pub type NodeEnumerator = Arc<dyn Fn(&str) -> Vec<String>>;

/// Consulted before a privileged method runs.
pub type Authorizer = Arc<dyn Fn(&AuthorizationContext<'_>) -> bool>;

pub struct AuthorizationContext<'a> {
    pub path: &'a str,
    pub interface: &'a str,
    pub member: &'a str,
    pub sender: Option<&'a str>,
    pub peer: Option<PeerCredentials>,
}

/// Allow root and our own uid, when socket credentials are available.
pub fn default_authorizer() -> Authorizer {
    let own = unsafe { libc::geteuid() };
    Arc::new(move |ctx: &AuthorizationContext<'_>| match ctx.peer {
        Some(c) => c.uid == 0 || c.uid == own,
        None => false,
    })
}

pub struct MethodSpec {
    pub(crate) name: String,
    pub(crate) in_sig: String,
    pub(crate) out_sig: String,
    pub(crate) privileged: bool,
    pub(crate) handler: MethodHandler,
}

/// How changes to a property are announced, mirroring the
/// `org.freedesktop.DBus.Property.EmitsChangedSignal` annotation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmitsChanged {
    /// `PropertiesChanged` carries the new value.
    #[default]
    True,
    /// `PropertiesChanged` names the property as invalidated, without the
    /// value.
    Invalidates,
    /// Changes are not announced.
    False,
    /// The property never changes while the object exists.
    Const,
}

impl EmitsChanged {
    fn annotation(self) -> &'static str {
        match self {
            EmitsChanged::True => "true",
            EmitsChanged::Invalidates => "invalidates",
            EmitsChanged::False => "false",
            EmitsChanged::Const => "const",
        }
    }
}

pub struct PropertySpec {
    pub(crate) name: String,
    pub(crate) sig: String,
    pub(crate) getter: PropertyGetter,
    pub(crate) setter: Option<PropertySetter>,
    pub(crate) emits_changed: EmitsChanged,
}

pub struct SignalSpec {
    pub(crate) name: String,
    pub(crate) sig: String,
}

/// The members of one interface implementation.
pub struct Vtable {
    interface: String,
    methods: Vec<MethodSpec>,
    properties: Vec<PropertySpec>,
    signals: Vec<SignalSpec>,
}

impl Vtable {
    pub fn new(interface: &str) -> Vtable {
        Vtable {
            interface: interface.to_owned(),
            methods: Vec::new(),
            properties: Vec::new(),
            signals: Vec::new(),
        }
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    pub fn method(
        mut self,
        name: &str,
        in_sig: &str,
        out_sig: &str,
        handler: impl Fn(&mut crate::connection::Connection, &Message) -> MethodResult + 'static,
    ) -> Vtable {
        self.methods.push(MethodSpec {
            name: name.to_owned(),
            in_sig: in_sig.to_owned(),
            out_sig: out_sig.to_owned(),
            privileged: false,
            handler: Arc::new(handler),
        });
        self
    }

    /// A method gated behind the connection's authorizer.
    pub fn privileged_method(
        mut self,
        name: &str,
        in_sig: &str,
        out_sig: &str,
        handler: impl Fn(&mut crate::connection::Connection, &Message) -> MethodResult + 'static,
    ) -> Vtable {
        self.methods.push(MethodSpec {
            name: name.to_owned(),
            in_sig: in_sig.to_owned(),
            out_sig: out_sig.to_owned(),
            privileged: true,
            handler: Arc::new(handler),
        });
        self
    }

    pub fn property(
        mut self,
        name: &str,
        sig: &str,
        getter: impl Fn() -> std::result::Result<Value, BusError> + 'static,
    ) -> Vtable {
        self.properties.push(PropertySpec {
            name: name.to_owned(),
            sig: sig.to_owned(),
            getter: Arc::new(getter),
            setter: None,
            emits_changed: EmitsChanged::True,
        });
        self
    }

    pub fn writable_property(
        mut self,
        name: &str,
        sig: &str,
        getter: impl Fn() -> std::result::Result<Value, BusError> + 'static,
        setter: impl Fn(Value) -> std::result::Result<(), BusError> + 'static,
    ) -> Vtable {
        self.properties.push(PropertySpec {
            name: name.to_owned(),
            sig: sig.to_owned(),
            getter: Arc::new(getter),
            setter: Some(Arc::new(setter)),
            emits_changed: EmitsChanged::True,
        });
        self
    }

    /// Set the change-announcement policy of the most recently added
    /// property.
    pub fn emits_changed(mut self, policy: EmitsChanged) -> Vtable {
        if let Some(p) = self.properties.last_mut() {
            p.emits_changed = policy;
        }
        self
    }

    pub fn signal(mut self, name: &str, sig: &str) -> Vtable {
        self.signals.push(SignalSpec {
            name: name.to_owned(),
            sig: sig.to_owned(),
        });
        self
    }

    fn find_method(&self, name: &str) -> Option<&MethodSpec> {
        self.methods.iter().find(|m| m.name == name)
    }

    fn find_property(&self, name: &str) -> Option<&PropertySpec> {
        self.properties.iter().find(|p| p.name == name)
    }
}

pub(crate) struct Registration {
    pub path: String,
    pub fallback: bool,
    pub vtable: Arc<Vtable>,
}

/// Registry of everything published on one connection.
#[derive(Default)]
pub(crate) struct ObjectServer {
    pub(crate) regs: SlotArena<Registration>,
    /// Roots with an ObjectManager.
    pub(crate) managers: SlotArena<String>,
    pub(crate) enumerators: SlotArena<(String, NodeEnumerator)>,
    machine_id: Option<String>,
}

/// Plan for answering one method call.
pub(crate) enum Dispatch {
    /// Successful reply with this body; no user code involved.
    Immediate(Vec<Value>),
    /// Run a vtable method handler.
    Handler {
        handler: MethodHandler,
        privileged: bool,
        interface: String,
    },
    /// Run a property setter.
    SetProperty {
        setter: PropertySetter,
        value: Value,
        emits_changed: EmitsChanged,
        interface: String,
        property: String,
    },
    Error(BusError),
}

impl ObjectServer {
    /// Vtables applicable at `path`: exact registrations first, then
    /// fallbacks, nearest subtree first.
    fn vtables_at(&self, path: &str) -> Vec<&Registration> {
        let mut out: Vec<&Registration> = self
            .regs
            .iter()
            .map(|(_, r)| r)
            .filter(|r| {
                if r.fallback {
                    object_path_startswith(path, &r.path)
                } else {
                    r.path == path
                }
            })
            .collect();
        out.sort_by(|a, b| {
            (a.fallback, std::cmp::Reverse(a.path.len()))
                .cmp(&(b.fallback, std::cmp::Reverse(b.path.len())))
        });
        out
    }

    /// Does anything exist at or below `path`?
    fn path_is_known(&self, path: &str) -> bool {
        self.regs.iter().any(|(_, r)| {
            r.path == path
                || object_path_startswith(path, &r.path) && r.fallback
                || object_path_startswith(&r.path, path)
        }) || self
            .managers
            .iter()
            .any(|(_, root)| object_path_startswith(path, root) || object_path_startswith(root, path))
    }

    /// Direct child node names under `path`.
    fn children_of(&self, path: &str) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        let prefix_len = if path == "/" { 1 } else { path.len() + 1 };
        for (_, r) in self.regs.iter() {
            if r.path != path && object_path_startswith(&r.path, path) {
                if let Some(rest) = r.path.get(prefix_len..) {
                    let first = rest.split('/').next().unwrap_or(rest);
                    if !first.is_empty() {
                        names.push(first.to_owned());
                    }
                }
            }
        }
        for (_, (root, enumerate)) in self.enumerators.iter() {
            if object_path_startswith(path, root) {
                for child in (**enumerate)(path) {
                    if !child.is_empty() {
                        names.push(child);
                    }
                }
            }
        }
        names.sort();
        names.dedup();
        names
    }

    fn machine_id(&mut self) -> String {
        if self.machine_id.is_none() {
            let id = std::fs::read_to_string("/etc/machine-id")
                .map(|s| s.trim().to_owned())
                .ok()
                .filter(|s| s.len() == 32 && s.bytes().all(|b| b.is_ascii_hexdigit()));
            if id.is_none() {
                debug!("machine id unavailable, reporting nil id");
            }
            self.machine_id = Some(id.unwrap_or_else(|| NIL_MACHINE_ID.to_owned()));
        }
        self.machine_id.clone().unwrap_or_default()
    }

    fn properties_of(&self, path: &str, interface: &str) -> Vec<(String, Value)> {
        let mut out = Vec::new();
        for reg in self.vtables_at(path) {
            if !interface.is_empty() && reg.vtable.interface != interface {
                continue;
            }
            for p in &reg.vtable.properties {
                match (*p.getter)() {
                    Ok(v) => out.push((p.name.clone(), v)),
                    Err(e) => debug!("property {} read failed: {e}", p.name),
                }
            }
        }
        out
    }

    fn introspect(&self, path: &str) -> String {
        let mut xml = String::from(
            "<!DOCTYPE node PUBLIC \"-//freedesktop//DTD D-BUS Object Introspection 1.0//EN\" \
             \"http://www.freedesktop.org/standards/dbus/1.0/introspect.dtd\">\n<node>\n",
        );
        let regs = self.vtables_at(path);
        if !regs.is_empty() {
            xml.push_str(BUILTIN_XML);
        }
        for reg in &regs {
            let v = &reg.vtable;
            let _ = writeln!(xml, " <interface name=\"{}\">", v.interface);
            for m in &v.methods {
                let _ = writeln!(xml, "  <method name=\"{}\">", m.name);
                for (i, t) in split_types(&m.in_sig).iter().enumerate() {
                    let _ = writeln!(
                        xml,
                        "   <arg type=\"{t}\" name=\"arg{i}\" direction=\"in\"/>"
                    );
                }
                for (i, t) in split_types(&m.out_sig).iter().enumerate() {
                    let _ = writeln!(
                        xml,
                        "   <arg type=\"{t}\" name=\"ret{i}\" direction=\"out\"/>"
                    );
                }
                xml.push_str("  </method>\n");
            }
            for s in &v.signals {
                let _ = writeln!(xml, "  <signal name=\"{}\">", s.name);
                for (i, t) in split_types(&s.sig).iter().enumerate() {
                    let _ = writeln!(xml, "   <arg type=\"{t}\" name=\"arg{i}\"/>");
                }
                xml.push_str("  </signal>\n");
            }
            for p in &v.properties {
                let access = if p.setter.is_some() {
                    "readwrite"
                } else {
                    "read"
                };
                if p.emits_changed == EmitsChanged::True {
                    let _ = writeln!(
                        xml,
                        "  <property name=\"{}\" type=\"{}\" access=\"{access}\"/>",
                        p.name, p.sig
                    );
                } else {
                    let _ = writeln!(
                        xml,
                        "  <property name=\"{}\" type=\"{}\" access=\"{access}\">",
                        p.name, p.sig
                    );
                    let _ = writeln!(
                        xml,
                        "   <annotation name=\"org.freedesktop.DBus.Property.EmitsChangedSignal\" \
                         value=\"{}\"/>",
                        p.emits_changed.annotation()
                    );
                    xml.push_str("  </property>\n");
                }
            }
            xml.push_str(" </interface>\n");
        }
        for child in self.children_of(path) {
            let _ = writeln!(xml, " <node name=\"{child}\"/>");
        }
        xml.push_str("</node>\n");
        xml
    }

    /// Objects at or below `root`, as the ObjectManager reports them.
    fn managed_objects(&self, root: &str) -> Vec<Value> {
        let mut by_path: BTreeMap<String, Vec<Value>> = BTreeMap::new();
        for (_, r) in self.regs.iter() {
            if r.fallback || !object_path_startswith(&r.path, root) || r.path == root {
                continue;
            }
            let props: Vec<Value> = r
                .vtable
                .properties
                .iter()
                .filter_map(|p| {
                    (*p.getter)().ok().map(|v| {
                        Value::DictEntry(
                            Box::new(Value::String(p.name.clone())),
                            Box::new(Value::Variant(Box::new(v))),
                        )
                    })
                })
                .collect();
            by_path.entry(r.path.clone()).or_default().push(Value::DictEntry(
                Box::new(Value::String(r.vtable.interface.clone())),
                Box::new(Value::Array("{sv}".into(), props)),
            ));
        }
        by_path
            .into_iter()
            .map(|(path, ifaces)| {
                Value::DictEntry(
                    Box::new(Value::ObjectPath(path)),
                    Box::new(Value::Array("{sa{sv}}".into(), ifaces)),
                )
            })
            .collect()
    }
}

fn split_types(sig: &str) -> Vec<String> {
    let mut out = Vec::new();
    let mut rest = sig;
    while !rest.is_empty() {
        match crate::types::split_first_type(rest) {
            Ok((t, r)) => {
                out.push(t.to_owned());
                rest = r;
            }
            Err(_) => break,
        }
    }
    out
}

fn args_err(expected: &str, m: &Message) -> BusError {
    BusError::invalid_args(format!(
        "expected signature {:?}, got {:?}",
        expected,
        m.signature()
    ))
}

/// Resolve a method call against the registry into a dispatch plan.
pub(crate) fn resolve_call(server: &mut ObjectServer, m: &Message) -> Dispatch {
    let Some(path) = m.path() else {
        return Dispatch::Error(BusError::invalid_args("call without a path"));
    };
    let Some(member) = m.member() else {
        return Dispatch::Error(BusError::invalid_args("call without a member"));
    };

    // The Peer interface is answered for any path.
    if m.interface() == Some(PEER_IFACE) {
        return match member {
            "Ping" => Dispatch::Immediate(vec![]),
            "GetMachineId" => Dispatch::Immediate(vec![Value::String(server.machine_id())]),
            _ => Dispatch::Error(BusError::new(
                name::UNKNOWN_METHOD,
                format!("no method {member} on {PEER_IFACE}"),
            )),
        };
    }

    if !server.path_is_known(path) {
        return Dispatch::Error(BusError::new(
            name::UNKNOWN_OBJECT,
            format!("no object at {path}"),
        ));
    }

    match m.interface() {
        Some(INTROSPECTABLE_IFACE) => {
            if member != "Introspect" {
                return Dispatch::Error(BusError::new(
                    name::UNKNOWN_METHOD,
                    format!("no method {member} on {INTROSPECTABLE_IFACE}"),
                ));
            }
            Dispatch::Immediate(vec![Value::String(server.introspect(path))])
        }
        Some(PROPERTIES_IFACE) => resolve_properties_call(server, m, path, member),
        Some(OBJECT_MANAGER_IFACE) => {
            let is_manager = server.managers.iter().any(|(_, root)| root == path);
            if !is_manager {
                return Dispatch::Error(BusError::new(
                    name::UNKNOWN_INTERFACE,
                    format!("no object manager at {path}"),
                ));
            }
            if member != "GetManagedObjects" {
                return Dispatch::Error(BusError::new(
                    name::UNKNOWN_METHOD,
                    format!("no method {member} on {OBJECT_MANAGER_IFACE}"),
                ));
            }
            Dispatch::Immediate(vec![Value::Array(
                "{oa{sa{sv}}}".into(),
                server.managed_objects(path),
            )])
        }
        Some(interface) => {
            let mut iface_seen = false;
            for reg in server.vtables_at(path) {
                if reg.vtable.interface != interface {
                    continue;
                }
                iface_seen = true;
                if let Some(spec) = reg.vtable.find_method(member) {
                    if m.signature() != spec.in_sig {
                        return Dispatch::Error(args_err(&spec.in_sig, m));
                    }
                    return Dispatch::Handler {
                        handler: spec.handler.clone(),
                        privileged: spec.privileged,
                        interface: interface.to_owned(),
                    };
                }
            }
            if iface_seen {
                Dispatch::Error(BusError::new(
                    name::UNKNOWN_METHOD,
                    format!("no method {interface}.{member} at {path}"),
                ))
            } else {
                Dispatch::Error(BusError::new(
                    name::UNKNOWN_INTERFACE,
                    format!("no interface {interface} at {path}"),
                ))
            }
        }
        // No interface: first member match wins.
        None => {
            for reg in server.vtables_at(path) {
                if let Some(spec) = reg.vtable.find_method(member) {
                    if m.signature() != spec.in_sig {
                        return Dispatch::Error(args_err(&spec.in_sig, m));
                    }
                    return Dispatch::Handler {
                        handler: spec.handler.clone(),
                        privileged: spec.privileged,
                        interface: reg.vtable.interface.clone(),
                    };
                }
            }
            Dispatch::Error(BusError::new(
                name::UNKNOWN_METHOD,
                format!("no method {member} at {path}"),
            ))
        }
    }
}

fn resolve_properties_call(
    server: &mut ObjectServer,
    m: &Message,
    path: &str,
    member: &str,
) -> Dispatch {
    match member {
        "Get" => {
            if m.signature() != "ss" {
                return Dispatch::Error(args_err("ss", m));
            }
            let (iface, prop) = match (m.string_arg(0), m.string_arg(1)) {
                (Some(i), Some(p)) => (i.to_owned(), p.to_owned()),
                _ => return Dispatch::Error(args_err("ss", m)),
            };
            for reg in server.vtables_at(path) {
                if reg.vtable.interface != iface {
                    continue;
                }
                let Some(spec) = reg.vtable.find_property(&prop) else {
                    return Dispatch::Error(BusError::new(
                        name::UNKNOWN_PROPERTY,
                        format!("no property {iface}.{prop}"),
                    ));
                };
                return match (*spec.getter)() {
                    Ok(v) => Dispatch::Immediate(vec![Value::Variant(Box::new(v))]),
                    Err(e) => Dispatch::Error(e),
                };
            }
            Dispatch::Error(BusError::new(
                name::UNKNOWN_INTERFACE,
                format!("no interface {iface} at {path}"),
            ))
        }
        "Set" => {
            if m.signature() != "ssv" {
                return Dispatch::Error(args_err("ssv", m));
            }
            let (iface, prop) = match (m.string_arg(0), m.string_arg(1)) {
                (Some(i), Some(p)) => (i.to_owned(), p.to_owned()),
                _ => return Dispatch::Error(args_err("ssv", m)),
            };
            let Some(Value::Variant(value)) = m.body_values().get(2) else {
                return Dispatch::Error(args_err("ssv", m));
            };
            for reg in server.vtables_at(path) {
                if reg.vtable.interface != iface {
                    continue;
                }
                let Some(spec) = reg.vtable.find_property(&prop) else {
                    return Dispatch::Error(BusError::new(
                        name::UNKNOWN_PROPERTY,
                        format!("no property {iface}.{prop}"),
                    ));
                };
                let Some(setter) = spec.setter.clone() else {
                    return Dispatch::Error(BusError::new(
                        name::PROPERTY_READ_ONLY,
                        format!("{iface}.{prop} is read-only"),
                    ));
                };
                if value.signature() != spec.sig {
                    return Dispatch::Error(args_err(&spec.sig, m));
                }
                return Dispatch::SetProperty {
                    setter,
                    value: (**value).clone(),
                    emits_changed: spec.emits_changed,
                    interface: iface,
                    property: prop,
                };
            }
            Dispatch::Error(BusError::new(
                name::UNKNOWN_INTERFACE,
                format!("no interface {iface} at {path}"),
            ))
        }
        "GetAll" => {
            if m.signature() != "s" {
                return Dispatch::Error(args_err("s", m));
            }
            let iface = m.string_arg(0).unwrap_or_default().to_owned();
            let props = server
                .properties_of(path, &iface)
                .into_iter()
                .map(|(n, v)| {
                    Value::DictEntry(
                        Box::new(Value::String(n)),
                        Box::new(Value::Variant(Box::new(v))),
                    )
                })
                .collect();
            Dispatch::Immediate(vec![Value::Array("{sv}".into(), props)])
        }
        _ => Dispatch::Error(BusError::new(
            name::UNKNOWN_METHOD,
            format!("no method {member} on {PROPERTIES_IFACE}"),
        )),
    }
}

/// Body of a `PropertiesChanged` signal for the named properties.
pub(crate) fn properties_changed_body(
    server: &ObjectServer,
    path: &str,
    interface: &str,
    names: &[&str],
) -> Vec<Value> {
    let current = server.properties_of(path, interface);
    let mut changed = Vec::new();
    let mut invalidated = Vec::new();
    for n in names {
        match current.iter().find(|(pn, _)| pn == n) {
            Some((pn, v)) => changed.push(Value::DictEntry(
                Box::new(Value::String(pn.clone())),
                Box::new(Value::Variant(Box::new(v.clone()))),
            )),
            None => invalidated.push(Value::String((*n).to_owned())),
        }
    }
    vec![
        Value::String(interface.to_owned()),
        Value::Array("{sv}".into(), changed),
        Value::Array("s".into(), invalidated),
    ]
}

/// Body of a `PropertiesChanged` signal that only invalidates, without
/// carrying values.
pub(crate) fn properties_invalidated_body(interface: &str, names: &[&str]) -> Vec<Value> {
    vec![
        Value::String(interface.to_owned()),
        Value::Array("{sv}".into(), Vec::new()),
        Value::Array(
            "s".into(),
            names.iter().map(|n| Value::String((*n).to_owned())).collect(),
        ),
    ]
}

/// Body of an `InterfacesAdded` signal for one object.
pub(crate) fn interfaces_added_body(
    server: &ObjectServer,
    path: &str,
    interfaces: &[&str],
) -> Vec<Value> {
    let entries: Vec<Value> = interfaces
        .iter()
        .map(|iface| {
            let props: Vec<Value> = server
                .properties_of(path, iface)
                .into_iter()
                .map(|(n, v)| {
                    Value::DictEntry(
                        Box::new(Value::String(n)),
                        Box::new(Value::Variant(Box::new(v))),
                    )
                })
                .collect();
            Value::DictEntry(
                Box::new(Value::String((*iface).to_owned())),
                Box::new(Value::Array("{sv}".into(), props)),
            )
        })
        .collect();
    vec![
        Value::ObjectPath(path.to_owned()),
        Value::Array("{sa{sv}}".into(), entries),
    ]
}

/// Body of an `InterfacesRemoved` signal.
pub(crate) fn interfaces_removed_body(path: &str, interfaces: &[&str]) -> Vec<Value> {
    vec![
        Value::ObjectPath(path.to_owned()),
        Value::Array(
            "s".into(),
            interfaces
                .iter()
                .map(|i| Value::String((*i).to_owned()))
                .collect(),
        ),
    ]
}

/// Sanity check for outgoing signals published through a vtable.
pub(crate) fn signal_signature_matches(vtable: &Vtable, member: &str, body: &[Value]) -> bool {
    match vtable.signals.iter().find(|s| s.name == member) {
        Some(spec) => spec.sig == signature_of(body),
        None => false,
    }
}

/// May this signal leave the connection? A signal declared by a vtable at
/// its path must carry the declared signature; signals on paths or
/// interfaces nothing here declares pass through untouched.
pub(crate) fn signal_declaration_allows(server: &ObjectServer, m: &Message) -> bool {
    let (Some(path), Some(iface), Some(member)) = (m.path(), m.interface(), m.member()) else {
        return true;
    };
    let mut declared = false;
    for reg in server.vtables_at(path) {
        if reg.vtable.interface != iface {
            continue;
        }
        if reg.vtable.signals.iter().any(|s| s.name == member) {
            declared = true;
            if signal_signature_matches(&reg.vtable, member, m.body_values()) {
                return true;
            }
        }
    }
    !declared
}

const BUILTIN_XML: &str = "\
 <interface name=\"org.freedesktop.DBus.Peer\">\n\
  <method name=\"Ping\"/>\n\
  <method name=\"GetMachineId\">\n\
   <arg type=\"s\" name=\"machine_uuid\" direction=\"out\"/>\n\
  </method>\n\
 </interface>\n\
 <interface name=\"org.freedesktop.DBus.Introspectable\">\n\
  <method name=\"Introspect\">\n\
   <arg type=\"s\" name=\"xml_data\" direction=\"out\"/>\n\
  </method>\n\
 </interface>\n\
 <interface name=\"org.freedesktop.DBus.Properties\">\n\
  <method name=\"Get\">\n\
   <arg type=\"s\" name=\"interface_name\" direction=\"in\"/>\n\
   <arg type=\"s\" name=\"property_name\" direction=\"in\"/>\n\
   <arg type=\"v\" name=\"value\" direction=\"out\"/>\n\
  </method>\n\
  <method name=\"GetAll\">\n\
   <arg type=\"s\" name=\"interface_name\" direction=\"in\"/>\n\
   <arg type=\"a{sv}\" name=\"props\" direction=\"out\"/>\n\
  </method>\n\
  <method name=\"Set\">\n\
   <arg type=\"s\" name=\"interface_name\" direction=\"in\"/>\n\
   <arg type=\"s\" name=\"property_name\" direction=\"in\"/>\n\
   <arg type=\"v\" name=\"value\" direction=\"in\"/>\n\
  </method>\n\
  <signal name=\"PropertiesChanged\">\n\
   <arg type=\"s\" name=\"interface_name\"/>\n\
   <arg type=\"a{sv}\" name=\"changed_properties\"/>\n\
   <arg type=\"as\" name=\"invalidated_properties\"/>\n\
  </signal>\n\
 </interface>\n";
