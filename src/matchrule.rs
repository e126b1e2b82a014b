//! Match rules: which incoming messages a subscription wants.
//!
//! A rule is a comma-separated list of `key='value'` comparisons, all of
//! which must hold. Rules are normalized on parse: components are sorted
//! and duplicate keys rejected, so equal rules compare equal.

use std::collections::HashMap;
use std::fmt;

use crate::error::{Error, Result};
use crate::message::{Message, MessageType};
use crate::slot::SlotId;
use crate::types::{object_path_is_valid, object_path_startswith};

/// Highest `argN` index a rule may compare.
const MAX_ARG_INDEX: u8 = 63;

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
enum Component {
    Type(u8),
    Sender(String),
    Destination(String),
    Interface(String),
    Member(String),
    Path(String),
    PathNamespace(String),
    Arg(u8, String),
    ArgPath(u8, String),
}

/// A parsed, normalized match rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MatchRule {
    components: Vec<Component>,
}

fn bad_rule(reason: impl Into<String>) -> Error {
    Error::InvalidArgument(format!("bad match rule: {}", reason.into()))
}

/// Split `rule` into `(key, value)` pairs, honoring single quotes.
fn split_rule(rule: &str) -> Result<Vec<(&str, String)>> {
    let mut pairs = Vec::new();
    let mut rest = rule.trim();
    while !rest.is_empty() {
        let Some(eq) = rest.find('=') else {
            return Err(bad_rule("expected key='value'"));
        };
        let key = rest[..eq].trim();
        let after = &rest[eq + 1..];
        let (value, remainder) = if let Some(stripped) = after.strip_prefix('\'') {
            let Some(close) = stripped.find('\'') else {
                return Err(bad_rule("unterminated quote"));
            };
            (stripped[..close].to_owned(), &stripped[close + 1..])
        } else {
            match after.find(',') {
                Some(c) => (after[..c].to_owned(), &after[c..]),
                None => (after.to_owned(), ""),
            }
        };
        pairs.push((key, value));
        rest = remainder.trim_start();
        if let Some(r) = rest.strip_prefix(',') {
            rest = r.trim_start();
        } else if !rest.is_empty() {
            return Err(bad_rule("expected , between comparisons"));
        }
    }
    Ok(pairs)
}

impl MatchRule {
    pub fn parse(rule: &str) -> Result<MatchRule> {
        let mut components = Vec::new();
        for (key, value) in split_rule(rule)? {
            let c = match key {
                "type" => {
                    let t = MessageType::from_str(&value)
                        .ok_or_else(|| bad_rule(format!("unknown type {value:?}")))?;
                    Component::Type(t as u8)
                }
                "sender" => Component::Sender(value),
                "destination" => Component::Destination(value),
                "interface" => Component::Interface(value),
                "member" => Component::Member(value),
                "path" => {
                    if !object_path_is_valid(&value) {
                        return Err(bad_rule(format!("invalid path {value:?}")));
                    }
                    Component::Path(value)
                }
                "path_namespace" => {
                    if !object_path_is_valid(&value) {
                        return Err(bad_rule(format!("invalid path namespace {value:?}")));
                    }
                    Component::PathNamespace(value)
                }
                // Ignored for compatibility; local connections never
                // eavesdrop.
                "eavesdrop" => continue,
                _ => {
                    let (name, n) = key
                        .strip_prefix("arg")
                        .and_then(|k| match k.strip_suffix("path") {
                            Some(n) => n.parse::<u8>().ok().map(|n| ("argpath", n)),
                            None => k.parse::<u8>().ok().map(|n| ("arg", n)),
                        })
                        .ok_or_else(|| bad_rule(format!("unknown key {key:?}")))?;
                    if n > MAX_ARG_INDEX {
                        return Err(bad_rule("arg index out of range"));
                    }
                    match name {
                        "arg" => Component::Arg(n, value),
                        _ => Component::ArgPath(n, value),
                    }
                }
            };
            components.push(c);
        }
        components.sort();
        let before = components.len();
        components.dedup();
        if components.len() != before {
            return Err(bad_rule("duplicate comparison"));
        }
        // Two different values for the same key can never match; catch the
        // common mistake early.
        for pair in components.windows(2) {
            if same_key(&pair[0], &pair[1]) {
                return Err(bad_rule("conflicting values for one key"));
            }
        }
        if components.iter().filter(|c| matches!(c, Component::Path(_) | Component::PathNamespace(_))).count() > 1 {
            return Err(bad_rule("path and path_namespace are exclusive"));
        }
        Ok(MatchRule { components })
    }

    /// Flat evaluation against one message.
    pub fn matches(&self, m: &Message) -> bool {
        self.components.iter().all(|c| match c {
            Component::Type(t) => m.message_type() as u8 == *t,
            Component::Sender(s) => m.sender() == Some(s.as_str()),
            Component::Destination(d) => m.destination() == Some(d.as_str()),
            Component::Interface(i) => m.interface() == Some(i.as_str()),
            Component::Member(mb) => m.member() == Some(mb.as_str()),
            Component::Path(p) => m.path() == Some(p.as_str()),
            Component::PathNamespace(ns) => m
                .path()
                .is_some_and(|p| object_path_startswith(p, ns)),
            Component::Arg(n, want) => m.string_arg(*n as usize) == Some(want.as_str()),
            Component::ArgPath(n, want) => m
                .string_arg(*n as usize)
                .is_some_and(|arg| arg_path_matches(arg, want)),
        })
    }

    fn interface(&self) -> Option<&str> {
        self.components.iter().find_map(|c| match c {
            Component::Interface(i) => Some(i.as_str()),
            _ => None,
        })
    }

    fn member(&self) -> Option<&str> {
        self.components.iter().find_map(|c| match c {
            Component::Member(m) => Some(m.as_str()),
            _ => None,
        })
    }
}

fn same_key(a: &Component, b: &Component) -> bool {
    use Component::*;
    matches!(
        (a, b),
        (Type(_), Type(_))
            | (Sender(_), Sender(_))
            | (Destination(_), Destination(_))
            | (Interface(_), Interface(_))
            | (Member(_), Member(_))
            | (Path(_), Path(_))
            | (PathNamespace(_), PathNamespace(_))
    ) || matches!((a, b), (Arg(x, _), Arg(y, _)) if x == y)
        || matches!((a, b), (ArgPath(x, _), ArgPath(y, _)) if x == y)
}

/// Path-style argument comparison: equal, or one is a `/`-terminated
/// prefix of the other.
fn arg_path_matches(arg: &str, want: &str) -> bool {
    arg == want
        || (want.ends_with('/') && arg.starts_with(want))
        || (arg.ends_with('/') && want.starts_with(arg))
}

impl fmt::Display for MatchRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, c) in self.components.iter().enumerate() {
            if i > 0 {
                write!(f, ",")?;
            }
            match c {
                Component::Type(t) => {
                    let name = MessageType::from_u8(*t).map_or("?", MessageType::as_str);
                    write!(f, "type='{name}'")?;
                }
                Component::Sender(v) => write!(f, "sender='{v}'")?,
                Component::Destination(v) => write!(f, "destination='{v}'")?,
                Component::Interface(v) => write!(f, "interface='{v}'")?,
                Component::Member(v) => write!(f, "member='{v}'")?,
                Component::Path(v) => write!(f, "path='{v}'")?,
                Component::PathNamespace(v) => write!(f, "path_namespace='{v}'")?,
                Component::Arg(n, v) => write!(f, "arg{n}='{v}'")?,
                Component::ArgPath(n, v) => write!(f, "arg{n}path='{v}'")?,
            }
        }
        Ok(())
    }
}

/// Routing trie over subscriptions. The root level narrows by the rule's
/// interface comparison, the next by its member comparison, the two
/// attributes nearly every signal match carries; rules that omit an
/// attribute go to the level's wildcard child. A walk follows both the
/// exact and the wildcard child at each level, and the union of subscriber
/// sets at all reached leaves is the delivery set. Leaves keep a
/// registration sequence number so that set can be replayed in
/// registration order across leaves. Callers still run the full rule and
/// the per-message fence; the trie is purely an index.
#[derive(Default)]
pub(crate) struct MatchTree {
    root: MatchNode,
    next_seq: u64,
}

#[derive(Default)]
struct MatchNode {
    /// Children narrowing by this level's attribute value.
    exact: HashMap<String, MatchNode>,
    /// Child for rules that do not compare this attribute.
    any: Option<Box<MatchNode>>,
    /// Subscribers whose rule ends here; leaves only.
    subscribers: Vec<(u64, SlotId)>,
}

impl MatchTree {
    fn leaf_for(&mut self, rule: &MatchRule) -> &mut MatchNode {
        let mut node = &mut self.root;
        for attr in [rule.interface(), rule.member()] {
            node = match attr {
                Some(v) => node.exact.entry(v.to_owned()).or_default(),
                None => node.any.get_or_insert_with(Box::default).as_mut(),
            };
        }
        node
    }

    pub fn insert(&mut self, rule: &MatchRule, id: SlotId) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.leaf_for(rule).subscribers.push((seq, id));
    }

    pub fn remove(&mut self, rule: &MatchRule, id: SlotId) {
        self.leaf_for(rule).subscribers.retain(|(_, x)| *x != id);
    }

    /// Candidate subscriptions for `m`, in registration order across all
    /// reached leaves.
    pub fn candidates(&self, m: &Message) -> Vec<SlotId> {
        let attrs = [m.interface(), m.member()];
        let mut hits: Vec<(u64, SlotId)> = Vec::new();
        collect_leaves(&self.root, &attrs, &mut hits);
        hits.sort_unstable_by_key(|(seq, _)| *seq);
        hits.into_iter().map(|(_, id)| id).collect()
    }
}

fn collect_leaves(node: &MatchNode, attrs: &[Option<&str>], hits: &mut Vec<(u64, SlotId)>) {
    let Some((attr, rest)) = attrs.split_first() else {
        hits.extend_from_slice(&node.subscribers);
        return;
    };
    if let Some(v) = attr {
        if let Some(child) = node.exact.get(*v) {
            collect_leaves(child, rest, hits);
        }
    }
    if let Some(any) = &node.any {
        collect_leaves(any, rest, hits);
    }
}
