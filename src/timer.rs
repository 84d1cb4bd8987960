//! Per-connection timers: zero-window probe, keepalive check and the
//! delayed return of removed entries to the free list.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use fxhash::FxHashSet;
use parking_lot::{Condvar, Mutex};

use crate::manager::OffloadManager;
use crate::table::{EntryHandle, Membership};

/// Identifies a scheduled timer for cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct Entry<T> {
    at: Instant,
    id: TimerId,
    task: T,
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.id == other.id
    }
}

impl<T> Eq for Entry<T> {}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        self.at.cmp(&other.at).then(self.id.cmp(&other.id))
    }
}

/// A queue of deadlines, earliest first. Timers added for the same instant
/// fire in insertion order.
pub struct TimerQueue<T> {
    // BinaryHeap is a max heap, we need a min heap.
    heap: BinaryHeap<Reverse<Entry<T>>>,
    pending: FxHashSet<TimerId>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        Self {
            heap: BinaryHeap::new(),
            pending: FxHashSet::default(),
            next_id: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn add_at(&mut self, at: Instant, task: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.pending.insert(id);
        self.heap.push(Reverse(Entry { at, id, task }));
        id
    }

    /// Cancels a pending timer. Returns false if it already fired or was
    /// cancelled before.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        self.pending.remove(&id)
    }

    pub fn is_pending(&self, id: TimerId) -> bool {
        self.pending.contains(&id)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    fn purge_cancelled(&mut self) {
        while let Some(Reverse(head)) = self.heap.peek() {
            if self.pending.contains(&head.id) {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn next_at(&mut self) -> Option<Instant> {
        self.purge_cancelled();
        self.heap.peek().map(|Reverse(e)| e.at)
    }

    /// Pops the earliest timer due at or before `now`.
    pub fn pop_at(&mut self, now: Instant) -> Option<(TimerId, T)> {
        if self.next_at()? > now {
            return None;
        }
        let Reverse(entry) = self.heap.pop()?;
        self.pending.remove(&entry.id);
        Some((entry.id, entry.task))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerTask {
    WindowProbe(EntryHandle),
    KeepaliveCheck(EntryHandle),
    DeferredFree(EntryHandle),
}

/// Timer queue shared between the manager and its timer thread.
pub(crate) struct TimerService {
    queue: Mutex<TimerQueue<TimerTask>>,
    wake: Condvar,
    shutdown: AtomicBool,
}

impl TimerService {
    pub(crate) fn new() -> Self {
        Self {
            queue: Mutex::new(TimerQueue::default()),
            wake: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    pub(crate) fn schedule_at(&self, at: Instant, task: TimerTask) -> TimerId {
        let id = self.queue.lock().add_at(at, task);
        self.wake.notify_one();
        id
    }

    pub(crate) fn cancel(&self, id: TimerId) -> bool {
        self.queue.lock().cancel(id)
    }

    pub(crate) fn pending(&self) -> usize {
        self.queue.lock().len()
    }

    pub(crate) fn pop_due(&self, now: Instant) -> Option<(TimerId, TimerTask)> {
        self.queue.lock().pop_at(now)
    }

    /// Blocks until a timer is due. Returns false once the service is shut
    /// down.
    pub(crate) fn wait_due(&self) -> bool {
        let mut queue = self.queue.lock();
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return false;
            }
            match queue.next_at() {
                Some(at) if at <= Instant::now() => return true,
                Some(at) => {
                    self.wake.wait_until(&mut queue, at);
                }
                None => self.wake.wait(&mut queue),
            }
        }
    }

    pub(crate) fn shutdown(&self) {
        let _queue = self.queue.lock();
        self.shutdown.store(true, Ordering::Release);
        self.wake.notify_all();
    }
}

impl OffloadManager {
    /// Runs every timer due at `now`. Periodic timers re-arm relative to
    /// `now`. Returns the number of timers fired.
    pub fn fire_due_timers(&self, now: Instant) -> usize {
        let mut fired = 0;
        while let Some((id, task)) = self.timers.pop_due(now) {
            log::trace!(target: "inet-toe/timer", "firing {task:?}");
            match task {
                TimerTask::WindowProbe(handle) => self.window_probe(handle, id, now),
                TimerTask::KeepaliveCheck(handle) => self.keepalive_check(handle, id, now),
                TimerTask::DeferredFree(handle) => self.deferred_free(handle, now),
            }
            fired += 1;
        }
        fired
    }

    /// Number of timers currently armed.
    pub fn pending_timers(&self) -> usize {
        self.timers.pending()
    }

    /// Starts the keepalive check of a connection, e.g. after the socket
    /// sent a keepalive probe through the engine.
    pub fn arm_keepalive_check(&self, handle: EntryHandle) -> crate::Result<()> {
        let Some(interval) = self.config.keepalive_interval else {
            return Ok(());
        };
        let entry = self.table.get(handle)?;
        let mut state = entry.lock();
        if state.owner.is_none() {
            return Ok(());
        }
        if let Some(old) = state.keepalive_timer.take() {
            self.timers.cancel(old);
        }
        state.keepalive_timer = Some(
            self.timers
                .schedule_at(Instant::now() + interval, TimerTask::KeepaliveCheck(handle)),
        );
        Ok(())
    }

    pub(crate) fn arm_connection_timers(&self, handle: EntryHandle, now: Instant) {
        let Ok(entry) = self.table.get(handle) else {
            return;
        };
        let mut state = entry.lock();
        if let Some(interval) = self.config.persist_interval {
            state.probe_timer = Some(
                self.timers
                    .schedule_at(now + interval, TimerTask::WindowProbe(handle)),
            );
        }
        if let Some(interval) = self.config.keepalive_interval {
            state.keepalive_timer = Some(
                self.timers
                    .schedule_at(now + interval, TimerTask::KeepaliveCheck(handle)),
            );
        }
    }

    pub(crate) fn cancel_connection_timers(&self, handle: EntryHandle) {
        let Ok(entry) = self.table.get(handle) else {
            return;
        };
        let mut state = entry.lock();
        for id in [state.probe_timer.take(), state.keepalive_timer.take()]
            .into_iter()
            .flatten()
        {
            self.timers.cancel(id);
        }
    }

    fn window_probe(&self, handle: EntryHandle, id: TimerId, now: Instant) {
        let Ok(entry) = self.table.get(handle) else {
            return;
        };
        let mut state = entry.lock();
        if state.probe_timer != Some(id) {
            return;
        }
        state.probe_timer = None;
        let Some(owner) = state.owner() else {
            return;
        };

        let snap = self.hw.connection_snapshot(entry.channel());
        let (mss, idle) = {
            let tcp = owner.tcp().lock();
            (u32::from(tcp.mss), tcp.snd_nxt == tcp.snd_una)
        };

        let stalled = state.probe.primed
            && snap.peer_window < mss
            && snap.rx_ack_num == state.probe.last_ack
            && snap.next_tx_seq == state.probe.last_snd_nxt;
        state.probe.primed = true;
        state.probe.last_ack = snap.rx_ack_num;
        state.probe.last_snd_nxt = snap.next_tx_seq;

        let outstanding = !idle || snap.in_flight() != 0 || !entry.transmit.lock().is_empty();

        if let Some(interval) = self.config.persist_interval {
            state.probe_timer = Some(
                self.timers
                    .schedule_at(now + interval, TimerTask::WindowProbe(handle)),
            );
        }
        drop(state);

        if stalled && outstanding {
            log::debug!(
                target: "inet-toe/timer",
                "channel {} stalled on peer window {}, probing",
                entry.channel(),
                snap.peer_window
            );
            owner.send_window_probe();
        }
    }

    fn keepalive_check(&self, handle: EntryHandle, id: TimerId, now: Instant) {
        let Ok(entry) = self.table.get(handle) else {
            return;
        };
        let mut state = entry.lock();
        if state.keepalive_timer != Some(id) {
            return;
        }
        state.keepalive_timer = None;
        let Some(owner) = state.owner() else {
            return;
        };

        let channel = entry.channel();
        if self.hw.keepalive_acked(channel) {
            owner.tcp().lock().probes_out = 0;
            self.hw.clear_keepalive(channel);
            drop(state);
            log::trace!(target: "inet-toe/timer", "channel {channel} keepalive answered");
            owner.keepalive_acked();
        } else if let Some(interval) = self.config.keepalive_interval {
            state.keepalive_timer = Some(
                self.timers
                    .schedule_at(now + interval, TimerTask::KeepaliveCheck(handle)),
            );
        }
    }

    fn deferred_free(&self, handle: EntryHandle, now: Instant) {
        if !matches!(self.table.membership(handle), Ok(Membership::PendingRemoval)) {
            return;
        }
        let Ok(entry) = self.table.get(handle) else {
            return;
        };

        if !self.hw.channel_quiesced(entry.channel()) {
            if let Some(delay) = self.config.deferred_free {
                log::debug!(
                    target: "inet-toe/timer",
                    "channel {} not quiesced, delaying free",
                    entry.channel()
                );
                self.timers
                    .schedule_at(now + delay, TimerTask::DeferredFree(handle));
                return;
            }
        }

        if let Err(e) = self.table.release_entry(handle) {
            log::error!(target: "inet-toe/timer", "deferred free of entry {}: {e}", handle.index());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn ordered_by_deadline() {
        let now = Instant::now();
        let mut q = TimerQueue::default();
        q.add_at(now + Duration::from_secs(3), 3);
        q.add_at(now + Duration::from_secs(1), 1);
        q.add_at(now + Duration::from_secs(2), 2);

        assert_eq!(q.pop_at(now), None);
        assert_eq!(q.next_at(), Some(now + Duration::from_secs(1)));

        let later = now + Duration::from_secs(5);
        let order = std::iter::from_fn(|| q.pop_at(later).map(|(_, t)| t)).collect::<Vec<_>>();
        assert_eq!(order, vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn same_deadline_fifo() {
        let now = Instant::now();
        let mut q = TimerQueue::default();
        for i in 0..4 {
            q.add_at(now, i);
        }
        let order = std::iter::from_fn(|| q.pop_at(now).map(|(_, t)| t)).collect::<Vec<_>>();
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[test]
    fn cancelled_timers_never_fire() {
        let now = Instant::now();
        let mut q = TimerQueue::default();
        let a = q.add_at(now, "a");
        let _b = q.add_at(now + Duration::from_millis(1), "b");

        assert!(q.cancel(a));
        assert!(!q.cancel(a));
        assert_eq!(q.len(), 1);
        assert_eq!(q.next_at(), Some(now + Duration::from_millis(1)));

        let (_, task) = q.pop_at(now + Duration::from_secs(1)).unwrap();
        assert_eq!(task, "b");
        assert_eq!(q.pop_at(now + Duration::from_secs(1)), None);
    }

    #[test]
    fn service_shutdown_unblocks() {
        let service = std::sync::Arc::new(TimerService::new());
        let waiter = {
            let service = service.clone();
            std::thread::spawn(move || service.wait_due())
        };
        std::thread::sleep(Duration::from_millis(20));
        service.shutdown();
        assert!(!waiter.join().unwrap());
    }
}
