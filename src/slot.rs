//! Registration handles.
//!
//! Every registration on a connection — a pending call, a match
//! subscription, a filter, an object at a path — lives in a generational
//! arena and is referred to by a [`Slot`]. Releasing a slot twice is a
//! no-op: the generation in the handle no longer matches the arena entry.

/// Index-plus-generation handle into one arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

/// What a [`Slot`] refers to; used to route a release to the right
/// registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    PendingCall,
    Match,
    Filter,
    Object,
    Fallback,
    ObjectManager,
    NodeEnumerator,
}

/// Handle for one registration on a connection.
///
/// By default the caller owns the registration and is expected to release
/// it through the connection. A slot marked *floating* reverses ownership:
/// the connection keeps the registration alive until it closes, and the
/// handle may simply be discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Slot {
    pub(crate) kind: SlotKind,
    pub(crate) id: SlotId,
    pub(crate) floating: bool,
}

impl Slot {
    pub(crate) fn new(kind: SlotKind, id: SlotId) -> Slot {
        Slot {
            kind,
            id,
            floating: false,
        }
    }

    pub fn kind(&self) -> SlotKind {
        self.kind
    }

    pub fn is_floating(&self) -> bool {
        self.floating
    }

    /// Tie the registration's lifetime to the connection instead of this
    /// handle. A floating slot passed to release is ignored; the
    /// registration stays until the connection closes.
    pub fn set_floating(&mut self, floating: bool) {
        self.floating = floating;
    }
}

pub(crate) struct Entry<T> {
    generation: u32,
    value: Option<T>,
}

/// Slab with generation checks; indices are recycled, handles are not.
pub(crate) struct SlotArena<T> {
    entries: Vec<Entry<T>>,
    free: Vec<u32>,
    len: usize,
}

impl<T> Default for SlotArena<T> {
    fn default() -> Self {
        SlotArena {
            entries: Vec::new(),
            free: Vec::new(),
            len: 0,
        }
    }
}

impl<T> SlotArena<T> {
    pub fn insert(&mut self, value: T) -> SlotId {
        self.len += 1;
        if let Some(index) = self.free.pop() {
            let entry = &mut self.entries[index as usize];
            entry.value = Some(value);
            return SlotId {
                index,
                generation: entry.generation,
            };
        }
        let index = self.entries.len() as u32;
        self.entries.push(Entry {
            generation: 0,
            value: Some(value),
        });
        SlotId {
            index,
            generation: 0,
        }
    }

    pub fn get(&self, id: SlotId) -> Option<&T> {
        let entry = self.entries.get(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.value.as_ref()
    }

    pub fn get_mut(&mut self, id: SlotId) -> Option<&mut T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.value.as_mut()
    }

    /// Remove the value behind `id`. Stale handles return `None`.
    pub fn remove(&mut self, id: SlotId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        let value = entry.value.take()?;
        entry.generation = entry.generation.wrapping_add(1);
        self.free.push(id.index);
        self.len -= 1;
        Some(value)
    }

    /// Take the value out while keeping the entry reserved, so re-entrant
    /// registrations cannot recycle the index. Pair with `put_back` or
    /// `remove`.
    pub fn take(&mut self, id: SlotId) -> Option<T> {
        let entry = self.entries.get_mut(id.index as usize)?;
        if entry.generation != id.generation {
            return None;
        }
        entry.value.take()
    }

    pub fn put_back(&mut self, id: SlotId, value: T) {
        if let Some(entry) = self.entries.get_mut(id.index as usize) {
            if entry.generation == id.generation && entry.value.is_none() {
                entry.value = Some(value);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &T)> {
        self.entries.iter().enumerate().filter_map(|(i, e)| {
            e.value.as_ref().map(|v| {
                (
                    SlotId {
                        index: i as u32,
                        generation: e.generation,
                    },
                    v,
                )
            })
        })
    }

    pub fn ids(&self) -> Vec<SlotId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Drain every live entry, oldest index first.
    pub fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len);
        for entry in &mut self.entries {
            if let Some(v) = entry.value.take() {
                entry.generation = entry.generation.wrapping_add(1);
                out.push(v);
            }
        }
        self.free = (0..self.entries.len() as u32).collect();
        self.len = 0;
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_is_idempotent() {
        let mut arena: SlotArena<&str> = SlotArena::default();
        let id = arena.insert("a");
        assert_eq!(arena.remove(id), Some("a"));
        assert_eq!(arena.remove(id), None);
        assert_eq!(arena.get(id), None);
    }

    #[test]
    fn recycled_indices_get_fresh_generations() {
        let mut arena: SlotArena<u32> = SlotArena::default();
        let a = arena.insert(1);
        arena.remove(a);
        let b = arena.insert(2);
        assert_eq!(a.index, b.index);
        assert_ne!(a.generation, b.generation);
        // The stale handle cannot reach the new value.
        assert_eq!(arena.get(a), None);
        assert_eq!(arena.get(b), Some(&2));
    }

    #[test]
    fn take_reserves_the_entry() {
        let mut arena: SlotArena<u32> = SlotArena::default();
        let id = arena.insert(5);
        assert_eq!(arena.take(id), Some(5));
        // The index is not reusable while taken out.
        let other = arena.insert(6);
        assert_ne!(other.index, id.index);
        arena.put_back(id, 5);
        assert_eq!(arena.get(id), Some(&5));
    }

    #[test]
    fn drain_empties_in_index_order() {
        let mut arena: SlotArena<u32> = SlotArena::default();
        arena.insert(1);
        arena.insert(2);
        arena.insert(3);
        assert_eq!(arena.drain(), vec![1, 2, 3]);
        assert!(arena.is_empty());
    }
}
