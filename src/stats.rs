use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Diagnostic counters of an offload manager.
#[derive(Debug, Default)]
pub struct Stats {
    pub(crate) connection_count: AtomicU64,
    pub(crate) active_connections: AtomicU64,
    pub(crate) max_retries: AtomicU64,
    pub(crate) discards: AtomicU64,
    pub(crate) tx_drain_fails: AtomicU64,
    pub(crate) rx_segments: AtomicU64,
    pub(crate) ofo_dropped: AtomicU64,
    pub(crate) invariant_violations: AtomicU64,
    pub(crate) reentrancy: AtomicU64,
    pub(crate) dispatches: AtomicU64,
}

impl Stats {
    pub(crate) fn inc(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub(crate) fn dec(counter: &AtomicU64) {
        let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        StatsSnapshot {
            connection_count: load(&self.connection_count),
            active_connections: load(&self.active_connections),
            max_retries: load(&self.max_retries),
            discards: load(&self.discards),
            tx_drain_fails: load(&self.tx_drain_fails),
            rx_segments: load(&self.rx_segments),
            ofo_dropped: load(&self.ofo_dropped),
            invariant_violations: load(&self.invariant_violations),
            reentrancy: load(&self.reentrancy),
            dispatches: load(&self.dispatches),
        }
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    /// Connections created since start.
    pub connection_count: u64,
    pub active_connections: u64,
    /// Connections torn down because the engine gave up retransmitting.
    pub max_retries: u64,
    /// Transmit segments discarded instead of sent.
    pub discards: u64,
    pub tx_drain_fails: u64,
    pub rx_segments: u64,
    pub ofo_dropped: u64,
    pub invariant_violations: u64,
    pub reentrancy: u64,
    pub dispatches: u64,
}

impl fmt::Display for StatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "connections:          {}", self.connection_count)?;
        writeln!(f, "active connections:   {}", self.active_connections)?;
        writeln!(f, "max retries exceeded: {}", self.max_retries)?;
        writeln!(f, "tx discards:          {}", self.discards)?;
        writeln!(f, "tx drain failures:    {}", self.tx_drain_fails)?;
        writeln!(f, "rx segments:          {}", self.rx_segments)?;
        writeln!(f, "ofo dropped:          {}", self.ofo_dropped)?;
        writeln!(f, "invariant violations: {}", self.invariant_violations)?;
        writeln!(f, "dispatcher overlap:   {}", self.reentrancy)?;
        write!(f, "dispatches:           {}", self.dispatches)
    }
}
