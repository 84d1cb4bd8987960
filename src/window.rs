//! Receive window governor.
//!
//! The advertised window follows a step function of the bytes queued on the
//! receive side. A zero window is never written to the engine; the channel
//! is disabled instead and re-enabled once the queue drains.

use crate::config::{WindowPolicyConfig, WindowStep};
use crate::entry::{ConnectionEntry, WindowState};
use crate::hw::OffloadHardware;

/// Step function mapping receive occupancy to an advertised window.
///
/// Occupancy is measured against `rcvbuf * ceiling_multiplier`. The
/// resulting window is `rcvbuf / divisor` of the first matching step, or the
/// whole `rcvbuf` below every step.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowPolicy {
    ceiling_multiplier: u32,
    steps: Vec<WindowStep>,
}

impl WindowPolicy {
    pub fn new(ceiling_multiplier: u32, steps: Vec<WindowStep>) -> Self {
        Self {
            ceiling_multiplier,
            steps,
        }
    }

    pub fn from_config(cfg: &WindowPolicyConfig) -> Self {
        Self::new(cfg.ceiling_multiplier, cfg.steps.clone())
    }

    /// Unscaled window for `occupancy` queued bytes.
    pub fn window_for(&self, occupancy: usize, rcvbuf: u32) -> u32 {
        let ceiling = u64::from(rcvbuf) * u64::from(self.ceiling_multiplier);
        if ceiling == 0 {
            return 0;
        }

        let ratio = occupancy as f64 / ceiling as f64;
        for step in &self.steps {
            if ratio >= step.occupancy_ratio {
                return match step.divisor {
                    0 => 0,
                    d => rcvbuf / d,
                };
            }
        }
        rcvbuf
    }
}

impl Default for WindowPolicy {
    fn default() -> Self {
        Self::from_config(&WindowPolicyConfig::default())
    }
}

/// Recomputes the advertised window of `entry` and reprograms the engine on
/// change. Returns whether the window changed.
pub fn update_advertised_window(
    entry: &ConnectionEntry,
    hw: &dyn OffloadHardware,
    policy: &WindowPolicy,
) -> bool {
    let mut state = entry.lock();
    let Some(owner) = state.owner() else {
        return false;
    };

    let occupancy = entry.rx_queue_bytes();
    let rcvbuf = owner.tcp().lock().rcvbuf;
    let window = policy.window_for(occupancy, rcvbuf) >> state.rcv_wscale;
    let channel = entry.channel();

    match (state.window, window) {
        (WindowState::Closed, 0) => false,
        (WindowState::Open(_), 0) => {
            log::debug!(
                target: "inet-toe/window",
                "closing channel {channel}: {occupancy} bytes queued"
            );
            hw.disable_channel(channel);
            state.window = WindowState::Closed;
            true
        }
        (WindowState::Closed, window) => {
            log::debug!(target: "inet-toe/window", "re-enabling channel {channel} with window {window}");
            hw.enable_channel(channel);
            hw.set_advertised_window(channel, window);
            owner.tcp().lock().rcv_wnd = window;
            state.window = WindowState::Open(window);
            true
        }
        (WindowState::Open(old), window) if old == window => false,
        (WindowState::Open(old), window) => {
            log::trace!(target: "inet-toe/window", "channel {channel} window {old} -> {window}");
            hw.set_advertised_window(channel, window);
            state.window = WindowState::Open(window);
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    use super::*;
    use crate::host::HostSocket;
    use crate::testing::{HwCall, MockHardware, MockSocket};

    const RCVBUF: u32 = 1000;
    const LIMIT: usize = 4000;

    fn bound_entry(sock: &Arc<MockSocket>, wscale: u8) -> ConnectionEntry {
        let entry = ConnectionEntry::new(0, 2);
        let owner: Arc<dyn HostSocket> = sock.clone();
        {
            let mut state = entry.lock();
            state.owner = Some(Arc::downgrade(&owner));
            state.rcv_wscale = wscale;
            state.window = WindowState::Open(RCVBUF >> wscale);
        }
        entry
    }

    fn occupy(entry: &ConnectionEntry, percent: usize) {
        entry
            .rx_queue_bytes
            .store(LIMIT * percent / 100, Ordering::Release);
    }

    #[test]
    fn default_steps() {
        let policy = WindowPolicy::default();
        let windows = [0, 10, 30, 60, 90, 100]
            .iter()
            .map(|p| policy.window_for(LIMIT * p / 100, RCVBUF))
            .collect::<Vec<_>>();
        assert_eq!(
            windows,
            vec![RCVBUF, RCVBUF, RCVBUF / 8, RCVBUF / 32, RCVBUF / 32, 0]
        );
    }

    #[test]
    fn custom_steps() {
        let policy = WindowPolicy::new(
            4,
            vec![
                WindowStep::new(0.875, 0),
                WindowStep::new(0.5, 32),
                WindowStep::new(0.2, 4),
            ],
        );
        let windows = [0, 10, 30, 60, 90, 100]
            .iter()
            .map(|p| policy.window_for(LIMIT * p / 100, RCVBUF))
            .collect::<Vec<_>>();
        assert_eq!(
            windows,
            vec![RCVBUF, RCVBUF, RCVBUF / 4, RCVBUF / 32, 0, 0]
        );
    }

    #[test]
    fn zero_rcvbuf_closes() {
        assert_eq!(WindowPolicy::default().window_for(0, 0), 0);
    }

    #[test]
    fn transition_through_zero() {
        let hw = MockHardware::new();
        let sock = MockSocket::established(0);
        sock.tcp().lock().rcvbuf = RCVBUF;
        let entry = bound_entry(&sock, 0);
        let policy = WindowPolicy::default();

        for percent in [0, 10, 30, 60, 90, 100, 100] {
            occupy(&entry, percent);
            update_advertised_window(&entry, &hw, &policy);
        }
        assert_eq!(entry.window(), WindowState::Closed);
        assert_eq!(hw.count(|c| matches!(c, HwCall::DisableChannel(2))), 1);
        assert!(!hw
            .calls()
            .iter()
            .any(|c| matches!(c, HwCall::SetAdvertisedWindow(_, 0))));

        occupy(&entry, 0);
        assert!(update_advertised_window(&entry, &hw, &policy));
        assert!(!update_advertised_window(&entry, &hw, &policy));
        assert_eq!(entry.window(), WindowState::Open(RCVBUF));
        assert_eq!(hw.count(|c| matches!(c, HwCall::EnableChannel(2))), 1);
        assert_eq!(sock.tcp().lock().rcv_wnd, RCVBUF);

        let calls = hw.calls();
        let enable = calls
            .iter()
            .rposition(|c| matches!(c, HwCall::EnableChannel(2)))
            .unwrap();
        assert_eq!(calls[enable + 1], HwCall::SetAdvertisedWindow(2, RCVBUF));
    }

    #[test]
    fn window_scale_applied() {
        let hw = MockHardware::new();
        let sock = MockSocket::established(0);
        sock.tcp().lock().rcvbuf = RCVBUF;
        let entry = bound_entry(&sock, 2);
        let policy = WindowPolicy::default();

        occupy(&entry, 30);
        assert!(update_advertised_window(&entry, &hw, &policy));
        assert_eq!(entry.window(), WindowState::Open((RCVBUF / 8) >> 2));
        assert_eq!(hw.count(|c| matches!(c, HwCall::SetAdvertisedWindow(..))), 1);
    }

    #[test]
    fn unchanged_window_not_rewritten() {
        let hw = MockHardware::new();
        let sock = MockSocket::established(0);
        sock.tcp().lock().rcvbuf = RCVBUF;
        let entry = bound_entry(&sock, 0);
        let policy = WindowPolicy::default();

        occupy(&entry, 5);
        assert!(!update_advertised_window(&entry, &hw, &policy));
        assert!(hw.calls().is_empty());
    }

    #[test]
    fn no_owner_is_noop() {
        let hw = MockHardware::new();
        let entry = ConnectionEntry::new(0, 2);
        entry.rx_queue_bytes.store(LIMIT, Ordering::Release);
        assert!(!update_advertised_window(&entry, &hw, &WindowPolicy::default()));
        assert!(hw.calls().is_empty());
    }
}
