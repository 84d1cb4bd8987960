//! Scriptable collaborators for exercising the manager without hardware.

mod hw;
mod socket;

pub use hw::{HwCall, MockEvent, MockHardware};
pub use socket::MockSocket;
