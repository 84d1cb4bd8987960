//! The single deferred-work unit driving the offload engine.
//!
//! Interrupts never process work directly. They disable further interrupts
//! and schedule one activation; an activation reclaims completed
//! transmissions, pulls received segments within a budget and either
//! reschedules itself or re-enables interrupts.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender};

use crate::events::DispatchSink;
use crate::manager::OffloadManager;
use crate::stats::Stats;
use crate::table::EntryHandle;
use crate::window::update_advertised_window;

/// Where scheduled work runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Executor {
    /// On the thread that scheduled it, before the scheduling call returns.
    Inline,
    /// On a dedicated worker thread.
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Work {
    Activation,
    ForcedClose(EntryHandle),
    Shutdown,
}

pub(crate) struct Dispatcher {
    executor: Executor,
    scheduled: AtomicBool,
    running: AtomicUsize,
    draining: AtomicBool,
    tx: Sender<Work>,
    rx: Receiver<Work>,
}

impl Dispatcher {
    pub(crate) fn new(executor: Executor) -> Self {
        let (tx, rx) = crossbeam_channel::unbounded();
        Self {
            executor,
            scheduled: AtomicBool::new(false),
            running: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            tx,
            rx,
        }
    }

    pub(crate) fn receiver(&self) -> Receiver<Work> {
        self.rx.clone()
    }

    pub(crate) fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::Acquire)
    }

    pub(crate) fn shutdown(&self) {
        if self.executor == Executor::Worker {
            let _ = self.tx.send(Work::Shutdown);
        }
    }
}

impl OffloadManager {
    /// Hardware interrupt entry point.
    pub fn interrupt(&self) {
        self.hw.interrupt_disable();
        self.schedule();
    }

    /// Schedules one dispatcher activation unless one is already pending.
    pub fn schedule(&self) {
        if self
            .dispatcher
            .scheduled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.submit(Work::Activation);
        }
    }

    /// Whether an activation is scheduled and has not started yet.
    pub fn dispatch_pending(&self) -> bool {
        self.dispatcher.is_scheduled()
    }

    pub(crate) fn submit(&self, work: Work) {
        if self.dispatcher.tx.send(work).is_err() {
            log::error!(target: "inet-toe/dispatch", "work queue closed, dropping {work:?}");
            return;
        }
        if self.dispatcher.executor == Executor::Inline {
            self.drain_inline();
        }
    }

    fn drain_inline(&self) {
        let d = &self.dispatcher;
        loop {
            if d
                .draining
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // The thread already draining picks the work up.
                return;
            }
            while let Ok(work) = d.rx.try_recv() {
                self.execute(work);
            }
            d.draining.store(false, Ordering::Release);
            if d.rx.is_empty() {
                return;
            }
        }
    }

    /// Runs one unit of deferred work. Returns false on shutdown.
    pub(crate) fn execute(&self, work: Work) -> bool {
        match work {
            Work::Activation => self.run_dispatch(),
            Work::ForcedClose(handle) => self.forced_close(handle),
            Work::Shutdown => return false,
        }
        true
    }

    /// One dispatcher activation.
    pub fn run_dispatch(&self) {
        let d = &self.dispatcher;
        d.scheduled.store(false, Ordering::Release);

        if d.running.fetch_add(1, Ordering::AcqRel) > 0 {
            log::warn!(target: "inet-toe/dispatch", "dispatcher activation overlaps a running one");
            Stats::inc(&self.stats.reentrancy);
        }
        Stats::inc(&self.stats.dispatches);

        let sink = DispatchSink::new(self);
        let dma = self.config.dma_channel;

        let reclaimed = self.hw.reclaim_transmitted(dma, &sink);
        if reclaimed > 0 {
            for handle in self.table.list_active() {
                if let Ok(entry) = self.table.get(handle) {
                    self.hw.reclaim_channel(entry.channel(), &sink);
                }
            }
        }

        let budget = self.config.rx_poll_budget;
        let received = self.hw.receive(budget, dma, &sink);
        log::trace!(
            target: "inet-toe/dispatch",
            "activation reclaimed {reclaimed}, received {received}"
        );

        if received >= budget || self.hw.has_pending_work() {
            self.schedule();
        } else {
            self.hw.interrupt_enable();
        }

        for handle in sink.touched() {
            if let Ok(entry) = self.table.get(handle) {
                update_advertised_window(entry, &*self.hw, &self.policy);
            }
        }

        d.running.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::ToeConfig;
    use crate::testing::{HwCall, MockHardware};

    #[test]
    fn overlapping_activation_is_counted_and_completes() -> crate::Result<()> {
        let hw = Arc::new(MockHardware::new());
        let manager = OffloadManager::new(ToeConfig::default(), hw.clone())?;

        // Pretend another activation is still running.
        manager.dispatcher.running.fetch_add(1, Ordering::AcqRel);
        manager.run_dispatch();

        let stats = manager.stats();
        assert_eq!(stats.reentrancy, 1);
        assert_eq!(stats.dispatches, 1);
        assert_eq!(hw.count(|c| *c == HwCall::InterruptEnable), 1);
        assert_eq!(manager.dispatcher.running.load(Ordering::Acquire), 1);

        manager.dispatcher.running.fetch_sub(1, Ordering::AcqRel);
        manager.run_dispatch();
        assert_eq!(manager.stats().reentrancy, 1);
        assert_eq!(manager.stats().dispatches, 2);
        Ok(())
    }

    #[test]
    fn schedule_is_idempotent_while_pending() -> crate::Result<()> {
        let hw = Arc::new(MockHardware::new());
        let manager = OffloadManager::new(ToeConfig::default(), hw)?;

        manager.dispatcher.scheduled.store(true, Ordering::Release);
        manager.schedule();
        assert!(manager.dispatch_pending());
        assert_eq!(manager.stats().dispatches, 0);
        Ok(())
    }
}
