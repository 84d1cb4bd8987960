//! Binding sockets to table entries and tearing them down again.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::entry::{ProbeState, WindowState};
use crate::error::HwError;
use crate::host::HostSocket;
use crate::hw::{HwDescriptor, SendRejected};
use crate::manager::OffloadManager;
use crate::segment::Segment;
use crate::stats::Stats;
use crate::table::{EntryHandle, Membership};
use crate::timer::TimerTask;
use crate::window::update_advertised_window;
use crate::{Result, ToeError};

// Upper bound of a single wait while draining the backlog in `stop`.
const DRAIN_POLL: Duration = Duration::from_millis(50);

impl OffloadManager {
    /// Binds `owner` to a reserved entry and hands the connection to the
    /// engine. The channel stays disabled until [`enable`](Self::enable).
    ///
    /// On failure the entry is released and the caller keeps processing
    /// the connection in the host stack.
    pub fn create(&self, owner: &Arc<dyn HostSocket>, handle: EntryHandle) -> Result<EntryHandle> {
        let entry = self.table.get(handle)?;
        let membership = self.table.membership(handle)?;
        if membership != Membership::Reserved {
            return Err(ToeError::InvariantViolation(format!(
                "create on entry {} in state {membership:?}",
                handle.index()
            )));
        }

        let endpoint = owner.endpoint();
        let channel = entry.channel();
        let now = Instant::now();

        let (desc, stale) = {
            let mut state = entry.lock();
            entry.reset_flags();

            let stale = if entry.queues_empty() {
                None
            } else {
                log::warn!(
                    target: "inet-toe/lifecycle",
                    "entry {} reserved with non-empty queues",
                    handle.index()
                );
                Stats::inc(&self.stats.invariant_violations);
                Some(entry.take_queues())
            };

            let desc = {
                let mut tcp = owner.tcp().lock();
                // In-flight data is re-sent through the engine.
                tcp.snd_nxt = tcp.snd_una;
                HwDescriptor {
                    channel,
                    interface: endpoint.interface,
                    local: endpoint.local,
                    remote: endpoint.remote,
                    ttl: tcp.ttl,
                    tos: tcp.tos,
                    mss: tcp.mss.min(self.config.max_mss),
                    snd_wscale: tcp.snd_wscale,
                    rcv_wscale: tcp.rcv_wscale,
                    snd_una: tcp.snd_una,
                    rcv_nxt: tcp.rcv_nxt,
                    snd_wnd: tcp.snd_wnd,
                    snd_cwnd: tcp.snd_cwnd,
                    snd_ssthresh: tcp.snd_ssthresh,
                    rto_ms: tcp.rto_ms,
                    advertised_window: tcp.rcvbuf.min(0xffff),
                }
            };

            state.owner = Some(Arc::downgrade(owner));
            state.interface = endpoint.interface;
            state.rcv_wscale = desc.rcv_wscale;
            state.window = WindowState::Open(desc.advertised_window);
            state.next_rtt_poll = now;
            state.tx_timeout_ms = desc.rto_ms;
            state.probe = ProbeState::default();
            (desc, stale)
        };
        drop(stale);

        self.table
            .transition(handle, Membership::Reserved, Membership::Used)?;

        if let Err(e) = self.hw.program_connection(&desc) {
            log::warn!(
                target: "inet-toe/lifecycle",
                "engine refused connection {} -> {} on channel {channel}: {e}",
                desc.local,
                desc.remote
            );
            entry.lock().owner = None;
            self.table
                .transition(handle, Membership::Used, Membership::Reserved)?;
            self.table.release_entry(handle)?;
            return Err(e.into());
        }
        self.hw.set_window_scale(channel, desc.rcv_wscale);

        Stats::inc(&self.stats.connection_count);
        Stats::inc(&self.stats.active_connections);
        self.arm_connection_timers(handle, now);

        log::debug!(
            target: "inet-toe/lifecycle",
            "offloaded {} -> {} on channel {channel}",
            desc.local,
            desc.remote
        );
        Ok(handle)
    }

    /// Starts traffic on a created connection.
    pub fn enable(&self, handle: EntryHandle) -> Result<()> {
        let entry = self.table.get(handle)?;
        let state = entry.lock();
        if state.owner.is_none() {
            return Err(ToeError::InvariantViolation(format!(
                "enable on unbound entry {}",
                handle.index()
            )));
        }
        if state.window != WindowState::Closed {
            self.hw.enable_channel(entry.channel());
        }
        Ok(())
    }

    /// Drains the transmit backlog and waits for the engine to get every
    /// byte acknowledged, for at most `drain_timeout` (`None` waits
    /// indefinitely). An RST or [`interrupt_stop`](Self::interrupt_stop)
    /// ends the flush early but the engine is still asked to drain.
    ///
    /// Whatever is left in the backlog afterwards is discarded. Bytes still
    /// unacknowledged, or left in the backlog when the deadline passed, are
    /// reported as [`ToeError::Timeout`].
    pub fn stop(&self, handle: EntryHandle, drain_timeout: Option<Duration>) -> Result<()> {
        let entry = self.table.get(handle)?;
        let deadline = drain_timeout.map(|d| Instant::now() + d);
        let expired = |now: Instant| deadline.is_some_and(|d| now >= d);
        let aborted = || {
            entry.reset_received() || entry.stop_interrupted.load(Ordering::Acquire)
        };

        while !entry.transmit.lock().is_empty() && !aborted() && !expired(Instant::now()) {
            update_advertised_window(entry, &*self.hw, &self.policy);
            let limit = entry.transmit_len();
            if let Err(e) = self.flush_backlog(handle, false, Some(limit)) {
                log::debug!(target: "inet-toe/lifecycle", "flush during stop: {e}");
            }

            let mut tx = entry.transmit.lock();
            if tx.is_empty() || aborted() {
                break;
            }
            let wait_until = match deadline {
                Some(d) => d.min(Instant::now() + DRAIN_POLL),
                None => Instant::now() + DRAIN_POLL,
            };
            entry.tx_drained.wait_until(&mut tx, wait_until);
        }

        // Backlog the engine never saw counts as undrained once the deadline passed.
        let stranded = if expired(Instant::now()) {
            entry.transmit.lock().iter().map(Segment::len).sum::<usize>()
        } else {
            0
        };

        let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let unacked = self
            .hw
            .tx_done_wait(entry.channel(), remaining)
            .saturating_add(u32::try_from(stranded).unwrap_or(u32::MAX));
        let result = match unacked {
            0 => Ok(()),
            unacked => {
                log::warn!(
                    target: "inet-toe/lifecycle",
                    "channel {} failed to drain, {unacked} bytes outstanding ({stranded} never sent)",
                    entry.channel()
                );
                Stats::inc(&self.stats.tx_drain_fails);
                Err(ToeError::Timeout { unacked })
            }
        };

        if let Err(e) = self.flush_backlog(handle, true, None) {
            log::debug!(target: "inet-toe/lifecycle", "discarding backlog: {e}");
        }
        self.cancel_connection_timers(handle);
        result
    }

    pub(crate) fn stop_without_drain(&self, handle: EntryHandle) {
        if let Err(e) = self.flush_backlog(handle, true, None) {
            log::debug!(target: "inet-toe/lifecycle", "discarding backlog: {e}");
        }
        self.cancel_connection_timers(handle);
    }

    /// Wakes a `stop` blocked on `handle` and makes it give up draining.
    pub fn interrupt_stop(&self, handle: EntryHandle) -> Result<()> {
        let entry = self.table.get(handle)?;
        entry.stop_interrupted.store(true, Ordering::Release);
        let _tx = entry.transmit.lock();
        entry.tx_drained.notify_all();
        Ok(())
    }

    /// Takes the connection away from the engine and unbinds its socket.
    ///
    /// The entry returns to the free list immediately, or after the
    /// configured deferred-free delay.
    pub fn remove(&self, handle: EntryHandle) -> Result<()> {
        let entry = self.table.get(handle)?;
        self.table
            .transition(handle, Membership::Used, Membership::PendingRemoval)?;
        Stats::dec(&self.stats.active_connections);

        let channel = entry.channel();
        let deferred = self.config.deferred_free.is_some();
        let (owner, snap) = {
            let mut state = entry.lock();
            let snap = self.hw.withdraw_connection(channel, deferred);
            let owner = state.owner();
            state.owner = None;
            for id in [state.probe_timer.take(), state.keepalive_timer.take()]
                .into_iter()
                .flatten()
            {
                self.timers.cancel(id);
            }
            (owner, snap)
        };

        let (rx, ofo, tx) = entry.take_queues();
        let charged = rx.iter().chain(ofo.iter()).map(Segment::charge).sum::<usize>();
        entry.uncharge_rx(charged);
        let tx_bytes = tx.iter().map(Segment::len).sum::<usize>();
        if !tx.is_empty() {
            log::debug!(
                target: "inet-toe/lifecycle",
                "channel {channel} removed with {} backlog segments",
                tx.len()
            );
            Stats::add(&self.stats.discards, tx.len() as u64);
        }
        drop((rx, ofo, tx));

        update_advertised_window(entry, &*self.hw, &self.policy);

        if let Some(owner) = owner {
            let mut tcp = owner.tcp().lock();
            tcp.wmem_queued = tcp.wmem_queued.saturating_sub(tx_bytes);
            tcp.snd_nxt = snap.next_tx_seq;
            if tcp.snd_una != tcp.snd_nxt {
                log::debug!(
                    target: "inet-toe/lifecycle",
                    "channel {channel} una {} behind nxt {}, resyncing",
                    tcp.snd_una,
                    tcp.snd_nxt
                );
                tcp.snd_una = tcp.snd_nxt;
            }
        }

        match self.config.deferred_free {
            None => self.table.release_entry(handle)?,
            Some(delay) => {
                self.timers
                    .schedule_at(Instant::now() + delay, TimerTask::DeferredFree(handle));
            }
        }

        log::debug!(target: "inet-toe/lifecycle", "removed channel {channel}");
        Ok(())
    }

    /// Stops and removes every active connection. Returns how many were
    /// closed.
    pub fn close_active_connections(&self) -> usize {
        let mut closed = 0;
        while let Some(handle) = self.table.first_active() {
            self.stop_without_drain(handle);
            if let Err(e) = self.remove(handle) {
                log::error!(target: "inet-toe/lifecycle", "closing entry {}: {e}", handle.index());
                break;
            }
            closed += 1;
        }
        closed
    }

    /// Enables or disables every active channel on `interface`. Returns the
    /// number of channels touched.
    pub fn link_state_update(&self, interface: u32, up: bool) -> usize {
        let mut touched = 0;
        for handle in self.table.list_active() {
            let Ok(entry) = self.table.get(handle) else {
                continue;
            };
            let state = entry.lock();
            if state.owner.is_none() || state.interface != interface {
                continue;
            }
            if up {
                if state.window != WindowState::Closed {
                    self.hw.enable_channel(entry.channel());
                }
            } else {
                self.hw.disable_channel(entry.channel());
            }
            touched += 1;
        }
        log::debug!(
            target: "inet-toe/lifecycle",
            "interface {interface} link {}, {touched} channels",
            if up { "up" } else { "down" }
        );
        touched
    }

    /// Queues a segment for transmission, optionally sending right away.
    pub fn enqueue_tx(&self, handle: EntryHandle, segment: Segment, flush: bool) -> Result<()> {
        let entry = self.table.get(handle)?;
        if entry.max_retries_exceeded() {
            return Err(ToeError::MaxRetriesExceeded);
        }
        let Some(owner) = entry.owner() else {
            return Err(ToeError::InvariantViolation(format!(
                "transmit on unbound entry {}",
                handle.index()
            )));
        };

        let len = segment.len();
        entry.transmit.lock().push_back(segment);
        owner.tcp().lock().wmem_queued += len;

        if flush {
            self.flush_backlog(handle, false, None)?;
        }
        Ok(())
    }

    /// Hands backlog segments to the engine in order, or discards them.
    ///
    /// Stops at the first segment the engine cannot take yet, which stays at
    /// the head of the backlog. Any other engine error discards that segment
    /// and is returned. Returns the number of segments sent.
    pub fn flush_backlog(&self, handle: EntryHandle, discard: bool, limit: Option<usize>) -> Result<usize> {
        let entry = self.table.get(handle)?;
        let owner = entry.owner();
        let channel = entry.channel();

        let mut sent = 0;
        let mut discarded = 0;
        let mut left_bytes = 0;
        let mut error = None;
        let mut limit = limit.unwrap_or(usize::MAX);

        let mut tx = entry.transmit.lock();
        while limit > 0 {
            let Some(segment) = tx.pop_front() else {
                break;
            };
            limit -= 1;
            let len = segment.len();

            if discard || segment.is_empty() {
                discarded += 1;
                left_bytes += len;
                continue;
            }

            match self.hw.send(channel, segment) {
                Ok(()) => {
                    sent += 1;
                    left_bytes += len;
                }
                Err(SendRejected {
                    error: HwError::WouldBlock,
                    segment,
                }) => {
                    tx.push_front(segment);
                    break;
                }
                Err(SendRejected { error: e, segment }) => {
                    log::warn!(target: "inet-toe/tx", "channel {channel} send failed: {e}");
                    drop(segment);
                    discarded += 1;
                    left_bytes += len;
                    error = Some(e);
                    break;
                }
            }
        }
        if tx.is_empty() {
            entry.tx_drained.notify_all();
        }
        drop(tx);

        if discarded > 0 {
            Stats::add(&self.stats.discards, discarded);
        }
        if let Some(owner) = owner {
            if left_bytes > 0 {
                let mut tcp = owner.tcp().lock();
                tcp.wmem_queued = tcp.wmem_queued.saturating_sub(left_bytes);
            }
            if sent > 0 {
                owner.write_space();
            }
        }

        match error {
            Some(e) => Err(e.into()),
            None => Ok(sent),
        }
    }

    /// The socket consumed `bytes` of received data. Returns whether the
    /// advertised window changed.
    pub fn release_rx(&self, handle: EntryHandle, bytes: usize) -> Result<bool> {
        let entry = self.table.get(handle)?;
        entry.uncharge_rx(bytes);
        Ok(update_advertised_window(entry, &*self.hw, &self.policy))
    }

    /// Pops the next in-order segment for the socket. Its receive charge
    /// stays accounted until [`release_rx`](Self::release_rx).
    pub fn dequeue_rx(&self, handle: EntryHandle) -> Result<Option<Segment>> {
        let entry = self.table.get(handle)?;
        Ok(entry.receive.lock().pop_front())
    }

    /// Drops further data segments for the connection. FIN and RST still
    /// reach the host stack.
    pub fn disable_receive(&self, handle: EntryHandle) -> Result<()> {
        let entry = self.table.get(handle)?;
        entry.rx_disabled.store(true, Ordering::Release);
        Ok(())
    }
}
