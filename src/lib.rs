//! Connection table manager for a TCP offload engine.
//!
//! An [`OffloadManager`] keeps a fixed table of offloaded connections and
//! moves segments between the engine ([`OffloadHardware`]) and the host
//! socket layer ([`HostSocket`]). It reorders received data, throttles the
//! advertised receive window by queue occupancy and tears connections down
//! without racing the engine's callbacks.
//!
//! ```no_run
//! use std::sync::Arc;
//! use inet_toe::{testing::MockHardware, OffloadManager, ToeConfig};
//!
//! let hw = Arc::new(MockHardware::new());
//! let manager = OffloadManager::new(ToeConfig::default(), hw)?;
//! let handle = manager.acquire_free_entry()?;
//! # let _ = handle;
//! # Ok::<(), inet_toe::ToeError>(())
//! ```

mod addr;
mod config;
mod dispatch;
mod entry;
mod error;
mod events;
mod host;
mod hw;
mod lifecycle;
mod manager;
mod stats;
mod table;
mod timer;

pub mod reassembly;
pub mod segment;
pub mod window;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use addr::{AddressEvent, AddressEventKind};
pub use config::{ToeConfig, WindowPolicyConfig, WindowStep};
pub use entry::{ConnectionEntry, WindowState};
pub use error::{HwError, Result, ToeError};
pub use host::{Endpoint, HostSocket, TcpVars};
pub use hw::{AddressFamily, EventSink, HwDescriptor, HwSnapshot, OffloadHardware, SendRejected};
pub use manager::OffloadManager;
pub use segment::{Segment, SegmentFlags};
pub use stats::StatsSnapshot;
pub use table::{ActiveIter, ConnectionTable, EntryHandle, Membership};
pub use timer::{TimerId, TimerQueue};
pub use window::WindowPolicy;
