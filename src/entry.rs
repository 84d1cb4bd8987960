//! Per-connection state of the offload table.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::host::HostSocket;
use crate::segment::Segment;
use crate::timer::TimerId;

/// State of the window advertised to the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowState {
    Open(u32),
    /// The channel is disabled instead of advertising a zero window.
    Closed,
}

impl WindowState {
    pub fn value(&self) -> u32 {
        match self {
            Self::Open(w) => *w,
            Self::Closed => 0,
        }
    }
}

/// Sequence state seen by the previous zero-window probe tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct ProbeState {
    pub(crate) primed: bool,
    pub(crate) last_ack: u32,
    pub(crate) last_snd_nxt: u32,
}

/// Fields guarded by the entry lock.
pub(crate) struct EntryState {
    pub(crate) owner: Option<Weak<dyn HostSocket>>,
    pub(crate) interface: u32,
    pub(crate) rcv_wscale: u8,
    pub(crate) window: WindowState,
    pub(crate) next_rtt_poll: Instant,
    pub(crate) tx_timeout_ms: u32,
    pub(crate) probe: ProbeState,
    pub(crate) probe_timer: Option<TimerId>,
    pub(crate) keepalive_timer: Option<TimerId>,
}

impl EntryState {
    fn new() -> Self {
        Self {
            owner: None,
            interface: 0,
            rcv_wscale: 0,
            window: WindowState::Closed,
            next_rtt_poll: Instant::now(),
            tx_timeout_ms: 0,
            probe: ProbeState::default(),
            probe_timer: None,
            keepalive_timer: None,
        }
    }

    pub(crate) fn owner(&self) -> Option<Arc<dyn HostSocket>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

/// One slot of the connection table.
///
/// Lock order inside an entry: `state` before any of the queues, and
/// `receive` before `out_of_order`. The socket's [`TcpVars`] lock is a leaf
/// and may be taken under any of them.
///
/// [`TcpVars`]: crate::host::TcpVars
pub struct ConnectionEntry {
    index: usize,
    channel: u32,
    pub(crate) generation: AtomicU64,

    pub(crate) state: Mutex<EntryState>,

    pub(crate) receive: Mutex<VecDeque<Segment>>,
    pub(crate) transmit: Mutex<VecDeque<Segment>>,
    pub(crate) out_of_order: Mutex<VecDeque<Segment>>,
    /// Signalled with `transmit` whenever the backlog becomes empty.
    pub(crate) tx_drained: Condvar,

    pub(crate) rx_queue_bytes: AtomicUsize,

    pub(crate) max_retries_exceeded: AtomicBool,
    pub(crate) reset_received: AtomicBool,
    pub(crate) rx_disabled: AtomicBool,
    pub(crate) stop_interrupted: AtomicBool,
}

impl ConnectionEntry {
    pub(crate) fn new(index: usize, channel: u32) -> Self {
        Self {
            index,
            channel,
            generation: AtomicU64::new(0),
            state: Mutex::new(EntryState::new()),
            receive: Mutex::new(VecDeque::new()),
            transmit: Mutex::new(VecDeque::new()),
            out_of_order: Mutex::new(VecDeque::new()),
            tx_drained: Condvar::new(),
            rx_queue_bytes: AtomicUsize::new(0),
            max_retries_exceeded: AtomicBool::new(false),
            reset_received: AtomicBool::new(false),
            rx_disabled: AtomicBool::new(false),
            stop_interrupted: AtomicBool::new(false),
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn channel(&self) -> u32 {
        self.channel
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, EntryState> {
        self.state.lock()
    }

    pub fn owner(&self) -> Option<Arc<dyn HostSocket>> {
        self.state.lock().owner()
    }

    pub fn has_owner(&self) -> bool {
        self.state.lock().owner.is_some()
    }

    pub fn window(&self) -> WindowState {
        self.state.lock().window
    }

    pub fn rx_queue_bytes(&self) -> usize {
        self.rx_queue_bytes.load(Ordering::Acquire)
    }

    pub fn receive_len(&self) -> usize {
        self.receive.lock().len()
    }

    pub fn transmit_len(&self) -> usize {
        self.transmit.lock().len()
    }

    pub fn out_of_order_len(&self) -> usize {
        self.out_of_order.lock().len()
    }

    pub fn max_retries_exceeded(&self) -> bool {
        self.max_retries_exceeded.load(Ordering::Acquire)
    }

    pub fn reset_received(&self) -> bool {
        self.reset_received.load(Ordering::Acquire)
    }

    pub fn rx_disabled(&self) -> bool {
        self.rx_disabled.load(Ordering::Acquire)
    }

    /// Resets latches and flags for a new binding.
    pub(crate) fn reset_flags(&self) {
        self.max_retries_exceeded.store(false, Ordering::Release);
        self.reset_received.store(false, Ordering::Release);
        self.rx_disabled.store(false, Ordering::Release);
        self.stop_interrupted.store(false, Ordering::Release);
        self.rx_queue_bytes.store(0, Ordering::Release);
    }

    /// Subtracts from the receive occupancy without wrapping below zero.
    pub(crate) fn uncharge_rx(&self, bytes: usize) -> usize {
        let mut current = self.rx_queue_bytes.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(bytes);
            match self.rx_queue_bytes.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub(crate) fn charge_rx(&self, bytes: usize) -> usize {
        self.rx_queue_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes
    }

    /// Removes every queued segment, returning them for disposal outside
    /// the queue locks.
    pub(crate) fn take_queues(&self) -> (Vec<Segment>, Vec<Segment>, Vec<Segment>) {
        let rx = self.receive.lock().drain(..).collect();
        let ofo = self.out_of_order.lock().drain(..).collect();
        let tx = self.transmit.lock().drain(..).collect();
        (rx, ofo, tx)
    }

    pub(crate) fn queues_empty(&self) -> bool {
        self.receive.lock().is_empty()
            && self.out_of_order.lock().is_empty()
            && self.transmit.lock().is_empty()
    }
}

impl std::fmt::Debug for ConnectionEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionEntry")
            .field("index", &self.index)
            .field("channel", &self.channel)
            .field("rx_queue_bytes", &self.rx_queue_bytes())
            .finish()
    }
}
