use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Instant;

use parking_lot::Mutex;

use crate::addr::AddressTable;
use crate::config::ToeConfig;
use crate::dispatch::{Dispatcher, Executor};
use crate::entry::ConnectionEntry;
use crate::hw::OffloadHardware;
use crate::stats::{Stats, StatsSnapshot};
use crate::table::{ConnectionTable, EntryHandle};
use crate::timer::TimerService;
use crate::window::WindowPolicy;
use crate::Result;

/// Connection offload manager.
///
/// Owns the connection table and mediates between the host socket layer
/// and the offload engine. Socket-layer operations may be called from any
/// thread; hardware work runs on the dispatcher.
pub struct OffloadManager {
    pub(crate) config: ToeConfig,
    pub(crate) policy: WindowPolicy,
    pub(crate) hw: Arc<dyn OffloadHardware>,
    pub(crate) table: ConnectionTable,
    pub(crate) dispatcher: Dispatcher,
    pub(crate) timers: Arc<TimerService>,
    pub(crate) addrs: AddressTable,
    pub(crate) stats: Stats,

    this: Weak<OffloadManager>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl OffloadManager {
    /// Creates a manager whose dispatcher and timers run on the calling
    /// thread. Work scheduled by interrupts runs before `interrupt` returns;
    /// timers fire on [`fire_due_timers`](Self::fire_due_timers).
    pub fn new(config: ToeConfig, hw: Arc<dyn OffloadHardware>) -> Result<Arc<Self>> {
        Self::build(config, hw, Executor::Inline)
    }

    /// Creates a manager with a dispatcher worker thread and a timer thread.
    pub fn spawn(config: ToeConfig, hw: Arc<dyn OffloadHardware>) -> Result<Arc<Self>> {
        let this = Self::build(config, hw, Executor::Worker)?;
        this.spawn_threads();
        Ok(this)
    }

    fn build(config: ToeConfig, hw: Arc<dyn OffloadHardware>, executor: Executor) -> Result<Arc<Self>> {
        config.validate()?;
        let policy = WindowPolicy::from_config(&config.window);
        let table = ConnectionTable::new(config.max_connections, config.first_channel);

        log::debug!(
            target: "inet-toe",
            "offload manager with {} entries on channels {}..{}",
            config.max_connections,
            config.first_channel,
            config.first_channel as usize + config.max_connections
        );

        Ok(Arc::new_cyclic(|this| Self {
            config,
            policy,
            hw,
            table,
            dispatcher: Dispatcher::new(executor),
            timers: Arc::new(TimerService::new()),
            addrs: AddressTable::default(),
            stats: Stats::default(),
            this: this.clone(),
            threads: Mutex::new(Vec::new()),
        }))
    }

    fn spawn_threads(&self) {
        let mut threads = self.threads.lock();

        let worker = self.dispatcher.receiver();
        let this = self.this.clone();
        threads.push(std::thread::spawn(move || {
            while let Ok(work) = worker.recv() {
                let Some(manager) = this.upgrade() else {
                    break;
                };
                if !manager.execute(work) {
                    break;
                }
            }
            log::trace!(target: "inet-toe/dispatch", "worker exiting");
        }));

        let this = self.this.clone();
        let timers = self.timers.clone();
        threads.push(std::thread::spawn(move || {
            while timers.wait_due() {
                let Some(manager) = this.upgrade() else {
                    break;
                };
                manager.fire_due_timers(Instant::now());
            }
            log::trace!(target: "inet-toe/timer", "timer thread exiting");
        }));
    }

    /// Closes every active connection and stops the worker threads.
    pub fn shutdown(&self) {
        let closed = self.close_active_connections();
        log::debug!(target: "inet-toe", "shutdown closed {closed} connections");

        self.timers.shutdown();
        self.dispatcher.shutdown();
        let threads = std::mem::take(&mut *self.threads.lock());
        for thread in threads {
            if thread.thread().id() == std::thread::current().id() {
                continue;
            }
            let _ = thread.join();
        }
    }

    pub fn config(&self) -> &ToeConfig {
        &self.config
    }

    pub fn table(&self) -> &ConnectionTable {
        &self.table
    }

    pub fn entry(&self, handle: EntryHandle) -> Result<&ConnectionEntry> {
        self.table.get(handle)
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    /// Reserves a table entry for a connection about to be offloaded.
    pub fn acquire_free_entry(&self) -> Result<EntryHandle> {
        self.table.acquire_free_entry()
    }

    /// Gives back a reserved entry the caller decided not to use.
    pub fn release_entry(&self, handle: EntryHandle) -> Result<()> {
        self.table.release_entry(handle)
    }
}

impl Drop for OffloadManager {
    // Threads are not joined here: the last reference may be dropped on
    // one of them.
    fn drop(&mut self) {
        self.timers.shutdown();
        self.dispatcher.shutdown();
    }
}

impl std::fmt::Debug for OffloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadManager")
            .field("table", &self.table)
            .field("stats", &self.stats.snapshot())
            .finish()
    }
}
