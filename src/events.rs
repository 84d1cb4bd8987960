//! Handlers for the callbacks the engine delivers during a dispatcher pass.

use std::cell::RefCell;
use std::io;
use std::sync::atomic::Ordering;
use std::time::Instant;

use fxhash::FxHashSet;

use crate::dispatch::Work;
use crate::hw::EventSink;
use crate::manager::OffloadManager;
use crate::reassembly::{drain_contiguous, enqueue_out_of_order};
use crate::segment::Segment;
use crate::stats::Stats;
use crate::table::EntryHandle;
use crate::window::update_advertised_window;

/// Event sink of one dispatcher pass. Remembers which connections it
/// touched so their windows can be updated after the pass.
pub(crate) struct DispatchSink<'a> {
    manager: &'a OffloadManager,
    touched: RefCell<FxHashSet<EntryHandle>>,
}

impl<'a> DispatchSink<'a> {
    pub(crate) fn new(manager: &'a OffloadManager) -> Self {
        Self {
            manager,
            touched: RefCell::new(FxHashSet::default()),
        }
    }

    pub(crate) fn touched(&self) -> Vec<EntryHandle> {
        self.touched.borrow().iter().copied().collect()
    }

    fn touch(&self, handle: Option<EntryHandle>) {
        if let Some(handle) = handle {
            self.touched.borrow_mut().insert(handle);
        }
    }
}

impl EventSink for DispatchSink<'_> {
    fn on_receive(&self, channel: u32, segment: Segment) {
        self.touch(self.manager.on_receive(channel, segment));
    }

    fn on_tx_complete(&self, channel: u32, acked: usize) {
        self.touch(self.manager.on_tx_complete(channel, acked));
    }

    fn on_max_retries(&self, channel: u32) {
        self.manager.on_max_retries(channel);
    }
}

impl OffloadManager {
    fn rx_charge(&self, segment: &Segment) -> usize {
        self.config
            .rx_charge_per_segment
            .unwrap_or_else(|| segment.len())
    }

    /// A segment arrived for `channel`. Returns the connection it was
    /// queued on.
    pub fn on_receive(&self, channel: u32, mut segment: Segment) -> Option<EntryHandle> {
        Stats::inc(&self.stats.rx_segments);

        let Some(handle) = self.table.handle_for_channel(channel) else {
            log::warn!(target: "inet-toe/rx", "segment for unknown channel {channel}");
            return None;
        };
        let entry = self.table.get(handle).ok()?;

        let state = entry.lock();
        let Some(owner) = state.owner() else {
            log::trace!(target: "inet-toe/rx", "channel {channel} has no socket, dropping {segment:?}");
            return None;
        };

        let is_control = segment.is_full_packet();
        if !is_control && entry.rx_disabled() {
            log::trace!(target: "inet-toe/rx", "channel {channel} receive disabled, dropping {segment:?}");
            return None;
        }

        let charge = self.rx_charge(&segment);
        segment.set_charge(charge);
        entry.charge_rx(charge);

        if segment.is_rst() {
            entry.reset_received.store(true, Ordering::Release);
            let _tx = entry.transmit.lock();
            entry.tx_drained.notify_all();
        }

        let start_rcv_nxt = owner.tcp().lock().rcv_nxt;
        let mut rcv_nxt = start_rcv_nxt;
        let mut control = None;
        let mut dropped = Vec::new();

        let mut receive = entry.receive.lock();
        let was_empty = receive.is_empty();

        if segment.seq() == rcv_nxt {
            if is_control {
                control = Some(segment);
            } else if segment.is_empty() {
                dropped.push(segment);
            } else {
                rcv_nxt = segment.end_seq();
                receive.push_back(segment);
            }
        } else {
            dropped.extend(enqueue_out_of_order(&mut entry.out_of_order.lock(), segment));
        }

        if control.is_none() {
            let drained = drain_contiguous(&mut entry.out_of_order.lock(), rcv_nxt, &mut receive);
            rcv_nxt = drained.rcv_nxt;
            dropped.extend(drained.dropped);
            control = drained.control;
        }
        let now_empty = receive.is_empty();
        drop(receive);

        if rcv_nxt != start_rcv_nxt {
            let mut tcp = owner.tcp().lock();
            tcp.rcv_nxt = rcv_nxt;
            tcp.rcv_wup = rcv_nxt;
        }
        self.hw.update_rx_seq(channel, rcv_nxt);

        let released = dropped.iter().map(Segment::charge).sum::<usize>()
            + control.as_ref().map_or(0, Segment::charge);
        if released > 0 {
            entry.uncharge_rx(released);
        }
        Stats::add(&self.stats.ofo_dropped, dropped.len() as u64);
        drop(state);

        drop(dropped);
        update_advertised_window(entry, &*self.hw, &self.policy);

        if was_empty && !now_empty {
            owner.data_ready();
        }
        if let Some(control) = control {
            log::debug!(target: "inet-toe/rx", "channel {channel} slow path {control:?}");
            owner.deliver_control(control);
        }

        Some(handle)
    }

    /// Transmitted data was acknowledged on `channel`.
    pub fn on_tx_complete(&self, channel: u32, acked: usize) -> Option<EntryHandle> {
        let handle = self.table.handle_for_channel(channel)?;
        let entry = self.table.get(handle).ok()?;

        let mut state = entry.lock();
        let owner = state.owner()?;

        let snap = self.hw.connection_snapshot(channel);
        {
            let mut tcp = owner.tcp().lock();
            tcp.snd_una = snap.rx_ack_num;
            tcp.snd_nxt = snap.next_tx_seq;
        }

        let now = Instant::now();
        let mut sample = None;
        if now >= state.next_rtt_poll {
            sample = self.hw.sample_rtt(channel);
            state.next_rtt_poll = now + self.config.rtt_sample_interval;
        }
        drop(state);

        log::trace!(target: "inet-toe/tx", "channel {channel} acked {acked} bytes, una {}", snap.rx_ack_num);

        if let Some(rtt) = sample {
            let rto = owner.on_rtt_sample(rtt);
            let mut state = entry.lock();
            if state.owner.is_some() && state.tx_timeout_ms != rto {
                log::trace!(target: "inet-toe/tx", "channel {channel} rto {} -> {rto}", state.tx_timeout_ms);
                state.tx_timeout_ms = rto;
                self.hw.set_tx_timeout(channel, rto);
            }
        }

        if let Err(e) = self.flush_backlog(handle, false, None) {
            log::debug!(target: "inet-toe/tx", "channel {channel} flush after ack failed: {e}");
        }
        Some(handle)
    }

    /// The engine gave up on `channel`. The connection is closed from the
    /// dispatcher's deferred work, exactly once.
    pub fn on_max_retries(&self, channel: u32) {
        let Some(handle) = self.table.handle_for_channel(channel) else {
            return;
        };
        let Ok(entry) = self.table.get(handle) else {
            return;
        };
        if !entry.has_owner() {
            return;
        }

        self.hw.disable_channel(channel);
        if entry.max_retries_exceeded.swap(true, Ordering::AcqRel) {
            return;
        }
        log::warn!(target: "inet-toe/tx", "channel {channel} exceeded max retries");
        self.submit(Work::ForcedClose(handle));
    }

    pub(crate) fn forced_close(&self, handle: EntryHandle) {
        let Ok(entry) = self.table.get(handle) else {
            return;
        };
        let Some(owner) = entry.owner() else {
            return;
        };

        self.stop_without_drain(handle);
        if let Err(e) = self.remove(handle) {
            log::error!(target: "inet-toe/tx", "forced close of entry {}: {e}", handle.index());
        }
        Stats::inc(&self.stats.max_retries);
        owner.report_error(io::ErrorKind::BrokenPipe);
    }
}
