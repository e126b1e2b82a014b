//! Correlation of method calls with their replies.
//!
//! Outstanding calls live in a slot arena, are findable by reply cookie
//! through a hash map, and expire through a min-heap of deadlines. Heap
//! entries are never deleted eagerly; a popped entry whose slot is gone or
//! whose deadline moved is simply skipped.
//!
//! Deadlines are relative until the connection reaches its running state;
//! only then are they anchored to the clock, so that slow connection setup
//! does not eat into call timeouts.

use std::cmp::Reverse;
use std::collections::hash_map::Entry;
use std::collections::{BinaryHeap, HashMap};
use std::time::{Duration, Instant};

use log::trace;

use crate::connection::Connection;
use crate::error::Result;
use crate::message::Message;
use crate::slot::{SlotArena, SlotId};

/// Default timeout for method calls that do not specify one.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(25);

/// Invoked with the reply (or synthesized error), which it consumes.
pub(crate) type ReplyCallback = Box<dyn FnMut(&mut Connection, Message) -> Result<bool>>;

pub(crate) struct PendingCall {
    pub cookie: u64,
    pub callback: Option<ReplyCallback>,
    /// Set once anchored; `relative` until then.
    pub deadline: Option<Instant>,
    pub relative: Option<Duration>,
    /// Insertion order, for the close-time drain.
    seq: u64,
}

#[derive(Default)]
pub(crate) struct PendingCalls {
    arena: SlotArena<PendingCall>,
    by_cookie: HashMap<u64, SlotId>,
    deadlines: BinaryHeap<Reverse<(Instant, SlotId)>>,
    next_seq: u64,
}

impl PendingCalls {
    /// Track a sealed call. `anchor` is the clock time to measure the
    /// timeout from, or `None` while the connection is still starting up.
    pub fn insert(
        &mut self,
        cookie: u64,
        callback: ReplyCallback,
        timeout: Duration,
        anchor: Option<Instant>,
    ) -> SlotId {
        let seq = self.next_seq;
        self.next_seq += 1;
        let (deadline, relative) = match anchor {
            Some(now) => (Some(now + timeout), None),
            None => (None, Some(timeout)),
        };
        let id = self.arena.insert(PendingCall {
            cookie,
            callback: Some(callback),
            deadline,
            relative,
            seq,
        });
        self.by_cookie.insert(cookie, id);
        if let Some(d) = deadline {
            self.deadlines.push(Reverse((d, id)));
        }
        trace!("pending call cookie={cookie} deadline={deadline:?}");
        id
    }

    /// Anchor every relative deadline to `now`. Called once, on entering
    /// the running state.
    pub fn anchor_all(&mut self, now: Instant) {
        for id in self.arena.ids() {
            if let Some(p) = self.arena.get_mut(id) {
                if let Some(rel) = p.relative.take() {
                    let d = now + rel;
                    p.deadline = Some(d);
                    self.deadlines.push(Reverse((d, id)));
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.arena.is_empty()
    }

    pub fn len(&self) -> usize {
        self.arena.len()
    }

    pub fn contains_cookie(&self, cookie: u64) -> bool {
        self.by_cookie
            .get(&cookie)
            .is_some_and(|id| self.arena.get(*id).is_some())
    }

    pub fn id_for_cookie(&self, cookie: u64) -> Option<SlotId> {
        let id = *self.by_cookie.get(&cookie)?;
        self.arena.get(id)?;
        Some(id)
    }

    /// Take the callback out for invocation. The entry stays reserved so a
    /// re-entrant registration cannot recycle its slot.
    pub fn take_callback(&mut self, id: SlotId) -> Option<(u64, ReplyCallback)> {
        let p = self.arena.get_mut(id)?;
        let cb = p.callback.take()?;
        Some((p.cookie, cb))
    }

    /// Drop the entry after its callback ran (or was abandoned).
    pub fn finish(&mut self, id: SlotId) {
        if let Some(p) = self.arena.remove(id) {
            self.remove_cookie_mapping(p.cookie, id);
        }
    }

    /// Put a callback back after an invocation that did not consume the
    /// call (callback returned `Ok(false)` semantics are decided above).
    pub fn restore_callback(&mut self, id: SlotId, cb: ReplyCallback) {
        if let Some(p) = self.arena.get_mut(id) {
            p.callback = Some(cb);
        }
    }

    /// Cancel an outstanding call. Idempotent.
    pub fn cancel(&mut self, id: SlotId) -> bool {
        match self.arena.remove(id) {
            Some(p) => {
                self.remove_cookie_mapping(p.cookie, id);
                true
            }
            None => false,
        }
    }

    fn remove_cookie_mapping(&mut self, cookie: u64, id: SlotId) {
        if let Entry::Occupied(e) = self.by_cookie.entry(cookie) {
            if *e.get() == id {
                e.remove();
            }
        }
    }

    /// Earliest live deadline, skimming stale heap entries off the top.
    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((d, id))) = self.deadlines.peek().copied() {
            match self.arena.get(id) {
                Some(p) if p.deadline == Some(d) => return Some(d),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    /// Pop one call whose deadline has passed.
    pub fn pop_expired(&mut self, now: Instant) -> Option<SlotId> {
        loop {
            let Reverse((d, id)) = self.deadlines.peek().copied()?;
            let live = self.arena.get(id).is_some_and(|p| p.deadline == Some(d));
            if !live {
                self.deadlines.pop();
                continue;
            }
            if d > now {
                return None;
            }
            self.deadlines.pop();
            return Some(id);
        }
    }

    /// Remove every outstanding call, oldest first, for the close-time
    /// drain.
    pub fn drain_in_order(&mut self) -> Vec<(u64, ReplyCallback)> {
        let mut calls: Vec<PendingCall> = self.arena.drain();
        calls.sort_by_key(|p| p.seq);
        self.by_cookie.clear();
        self.deadlines.clear();
        calls
            .into_iter()
            .filter_map(|p| p.callback.map(|cb| (p.cookie, cb)))
            .collect()
    }
}
