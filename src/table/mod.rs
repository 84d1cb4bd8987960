//! The fixed arena of connection entries and its membership lists.

use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::entry::ConnectionEntry;
use crate::{Result, ToeError};

#[cfg(test)]
mod tests;

/// Stable reference to a table entry.
///
/// The generation changes every time the entry is acquired, so a handle kept
/// past the entry's release is detected instead of silently aliasing the
/// next connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle {
    index: usize,
    generation: u64,
}

impl EntryHandle {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// List membership of an entry. Exactly one holds at all times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Membership {
    Free,
    /// Acquired but not yet bound to a socket.
    Reserved,
    Used,
    PendingRemoval,
}

#[derive(Debug, Clone, Copy)]
struct Link {
    prev: Option<usize>,
    next: Option<usize>,
    membership: Membership,
}

#[derive(Debug, Clone, Copy, Default)]
struct ListHead {
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
}

#[derive(Debug)]
struct Lists {
    links: Vec<Link>,
    free: ListHead,
    used: ListHead,
    pending: ListHead,
}

impl Lists {
    fn head_mut(&mut self, membership: Membership) -> Option<&mut ListHead> {
        match membership {
            Membership::Free => Some(&mut self.free),
            Membership::Used => Some(&mut self.used),
            Membership::PendingRemoval => Some(&mut self.pending),
            Membership::Reserved => None,
        }
    }

    fn push_back(&mut self, idx: usize, membership: Membership) {
        let tail = match self.head_mut(membership) {
            Some(list) => list.tail,
            None => {
                self.links[idx] = Link {
                    prev: None,
                    next: None,
                    membership,
                };
                return;
            }
        };

        self.links[idx] = Link {
            prev: tail,
            next: None,
            membership,
        };
        if let Some(tail) = tail {
            self.links[tail].next = Some(idx);
        }

        if let Some(list) = self.head_mut(membership) {
            if list.head.is_none() {
                list.head = Some(idx);
            }
            list.tail = Some(idx);
            list.len += 1;
        }
    }

    fn unlink(&mut self, idx: usize) {
        let Link {
            prev,
            next,
            membership,
        } = self.links[idx];

        if let Some(prev) = prev {
            self.links[prev].next = next;
        }
        if let Some(next) = next {
            self.links[next].prev = prev;
        }
        if let Some(list) = self.head_mut(membership) {
            if list.head == Some(idx) {
                list.head = next;
            }
            if list.tail == Some(idx) {
                list.tail = prev;
            }
            list.len -= 1;
        }

        self.links[idx].prev = None;
        self.links[idx].next = None;
    }

    fn move_to(&mut self, idx: usize, membership: Membership) {
        self.unlink(idx);
        self.push_back(idx, membership);
    }
}

/// Fixed pool of connection entries.
///
/// The arena is allocated once and never reallocated, so references to
/// entries stay valid for the lifetime of the table. All list manipulation
/// happens under the table lock, which is always taken before any entry
/// lock.
pub struct ConnectionTable {
    entries: Box<[ConnectionEntry]>,
    lists: Mutex<Lists>,
    outstanding: AtomicUsize,
}

impl ConnectionTable {
    pub fn new(capacity: usize, first_channel: u32) -> Self {
        let entries = (0..capacity)
            .map(|i| ConnectionEntry::new(i, first_channel + i as u32))
            .collect::<Vec<_>>()
            .into_boxed_slice();

        let mut lists = Lists {
            links: vec![
                Link {
                    prev: None,
                    next: None,
                    membership: Membership::Reserved,
                };
                capacity
            ],
            free: ListHead::default(),
            used: ListHead::default(),
            pending: ListHead::default(),
        };
        for i in 0..capacity {
            lists.push_back(i, Membership::Free);
        }

        Self {
            entries,
            lists: Mutex::new(lists),
            outstanding: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Takes an entry off the free list and marks it reserved.
    pub fn acquire_free_entry(&self) -> Result<EntryHandle> {
        let mut lists = self.lists.lock();
        let Some(idx) = lists.free.head else {
            log::debug!(target: "inet-toe/table", "no free entry left");
            return Err(ToeError::ResourceExhausted);
        };
        lists.move_to(idx, Membership::Reserved);

        let generation = self.entries[idx].generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        log::trace!(target: "inet-toe/table", "acquired entry {idx} (generation {generation})");
        Ok(EntryHandle {
            index: idx,
            generation,
        })
    }

    /// Returns a reserved or removed entry to the free list.
    ///
    /// The entry must have no owner and empty queues. Violations are logged
    /// and the queues are cleared before the entry is recycled.
    pub fn release_entry(&self, handle: EntryHandle) -> Result<()> {
        let entry = self.get(handle)?;
        if entry.has_owner() {
            log::error!(target: "inet-toe/table", "releasing entry {} with owner still bound", handle.index);
            return Err(ToeError::InvariantViolation(format!(
                "entry {} released while owned",
                handle.index
            )));
        }
        if !entry.queues_empty() {
            log::warn!(target: "inet-toe/table", "releasing entry {} with non-empty queues", handle.index);
            drop(entry.take_queues());
        }

        let mut lists = self.lists.lock();
        match lists.links[handle.index].membership {
            Membership::Reserved | Membership::PendingRemoval => {}
            other => {
                return Err(ToeError::InvariantViolation(format!(
                    "entry {} released from {other:?}",
                    handle.index
                )))
            }
        }
        lists.move_to(handle.index, Membership::Free);
        drop(lists);

        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        log::trace!(target: "inet-toe/table", "released entry {}", handle.index);
        Ok(())
    }

    /// Moves an entry from `from` to `to`, failing if it is not in `from`.
    pub(crate) fn transition(
        &self,
        handle: EntryHandle,
        from: Membership,
        to: Membership,
    ) -> Result<()> {
        self.get(handle)?;
        let mut lists = self.lists.lock();
        let current = lists.links[handle.index].membership;
        if current != from {
            return Err(ToeError::InvariantViolation(format!(
                "entry {} is {current:?}, expected {from:?}",
                handle.index
            )));
        }
        lists.move_to(handle.index, to);
        Ok(())
    }

    /// Resolves a handle, rejecting stale ones.
    pub fn get(&self, handle: EntryHandle) -> Result<&ConnectionEntry> {
        let entry = self
            .entries
            .get(handle.index)
            .ok_or(ToeError::InvalidHandle(handle.index))?;
        if entry.generation.load(Ordering::Acquire) != handle.generation {
            return Err(ToeError::InvalidHandle(handle.index));
        }
        Ok(entry)
    }

    /// Looks up the current handle of the entry programmed on `channel`.
    pub fn handle_for_channel(&self, channel: u32) -> Option<EntryHandle> {
        let first = self.entries.first()?.channel();
        let index = channel.checked_sub(first)? as usize;
        let entry = self.entries.get(index)?;
        Some(EntryHandle {
            index,
            generation: entry.generation.load(Ordering::Acquire),
        })
    }

    pub fn membership(&self, handle: EntryHandle) -> Result<Membership> {
        self.get(handle)?;
        Ok(self.lists.lock().links[handle.index].membership)
    }

    /// Lazily walks the used list. Each step takes the table lock; the walk
    /// ends early if the current entry left the used list in between.
    pub fn list_active(&self) -> ActiveIter<'_> {
        ActiveIter {
            table: self,
            cursor: Cursor::Start,
        }
    }

    /// First entry of the used list, if any.
    pub fn first_active(&self) -> Option<EntryHandle> {
        let idx = self.lists.lock().used.head?;
        Some(self.handle_of(idx))
    }

    fn handle_of(&self, index: usize) -> EntryHandle {
        EntryHandle {
            index,
            generation: self.entries[index].generation.load(Ordering::Acquire),
        }
    }

    pub fn len_free(&self) -> usize {
        self.lists.lock().free.len
    }

    pub fn len_used(&self) -> usize {
        self.lists.lock().used.len
    }

    pub fn len_pending(&self) -> usize {
        self.lists.lock().pending.len
    }

    /// Entries acquired and not yet released.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    /// Membership of every entry, in index order.
    pub fn memberships(&self) -> Vec<Membership> {
        self.lists.lock().links.iter().map(|l| l.membership).collect()
    }
}

impl std::fmt::Debug for ConnectionTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lists = self.lists.lock();
        f.debug_struct("ConnectionTable")
            .field("capacity", &self.entries.len())
            .field("free", &lists.free.len)
            .field("used", &lists.used.len)
            .field("pending", &lists.pending.len)
            .finish()
    }
}

#[derive(Debug, Clone, Copy)]
enum Cursor {
    Start,
    At(usize),
    Done,
}

/// Iterator over the used entries of a [`ConnectionTable`].
pub struct ActiveIter<'a> {
    table: &'a ConnectionTable,
    cursor: Cursor,
}

impl Iterator for ActiveIter<'_> {
    type Item = EntryHandle;

    fn next(&mut self) -> Option<EntryHandle> {
        let lists = self.table.lists.lock();
        let next = match self.cursor {
            Cursor::Start => lists.used.head,
            Cursor::At(idx) if lists.links[idx].membership == Membership::Used => {
                lists.links[idx].next
            }
            Cursor::At(_) | Cursor::Done => None,
        };
        drop(lists);

        match next {
            Some(idx) => {
                self.cursor = Cursor::At(idx);
                Some(self.table.handle_of(idx))
            }
            None => {
                self.cursor = Cursor::Done;
                None
            }
        }
    }
}
