use std::sync::Arc;
use std::time::{Duration, Instant};

use inet_toe::testing::{HwCall, MockHardware, MockSocket};
use inet_toe::{EntryHandle, HostSocket, HwSnapshot, Membership, OffloadManager, ToeConfig, ToeError};
use serial_test::serial;

fn setup(config: ToeConfig) -> (Arc<MockHardware>, Arc<OffloadManager>) {
    let hw = Arc::new(MockHardware::new());
    let manager = OffloadManager::new(config, hw.clone()).unwrap();
    (hw, manager)
}

fn offload(manager: &OffloadManager, socket: &Arc<MockSocket>) -> EntryHandle {
    let owner: Arc<dyn HostSocket> = socket.clone();
    let handle = manager.acquire_free_entry().unwrap();
    manager.create(&owner, handle).unwrap();
    manager.enable(handle).unwrap();
    handle
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

#[test]
fn deferred_free_waits_for_timer() {
    let config = ToeConfig {
        max_connections: 1,
        deferred_free: Some(ms(50)),
        persist_interval: None,
        ..ToeConfig::default()
    };
    let (hw, manager) = setup(config);
    let socket = MockSocket::established(1);
    let handle = offload(&manager, &socket);
    let channel = manager.entry(handle).unwrap().channel();

    let t0 = Instant::now();
    manager.remove(handle).unwrap();
    assert!(hw.calls().contains(&HwCall::Withdraw {
        channel,
        deferred: true
    }));
    assert_eq!(manager.table().membership(handle), Ok(Membership::PendingRemoval));
    assert_eq!(manager.table().len_pending(), 1);
    assert_eq!(manager.acquire_free_entry(), Err(ToeError::ResourceExhausted));

    assert_eq!(manager.fire_due_timers(t0), 0);
    assert_eq!(manager.table().len_pending(), 1);

    assert_eq!(manager.fire_due_timers(t0 + ms(100)), 1);
    assert_eq!(manager.table().membership(handle), Ok(Membership::Free));
    assert!(manager.acquire_free_entry().is_ok());
}

#[test]
fn deferred_free_waits_for_quiesced_channel() {
    let config = ToeConfig {
        deferred_free: Some(ms(50)),
        persist_interval: None,
        ..ToeConfig::default()
    };
    let (hw, manager) = setup(config);
    let socket = MockSocket::established(1);
    let handle = offload(&manager, &socket);
    let channel = manager.entry(handle).unwrap().channel();

    hw.set_quiesced(channel, false);
    let t0 = Instant::now();
    manager.remove(handle).unwrap();

    assert_eq!(manager.fire_due_timers(t0 + ms(100)), 1);
    assert_eq!(manager.table().membership(handle), Ok(Membership::PendingRemoval));
    assert_eq!(manager.pending_timers(), 1);

    hw.set_quiesced(channel, true);
    assert_eq!(manager.fire_due_timers(t0 + ms(200)), 1);
    assert_eq!(manager.table().membership(handle), Ok(Membership::Free));
    assert_eq!(manager.pending_timers(), 0);
}

#[test]
fn window_probe_on_stalled_peer() {
    let config = ToeConfig {
        persist_interval: Some(ms(200)),
        ..ToeConfig::default()
    };
    let (hw, manager) = setup(config);
    let socket = MockSocket::established(1);
    let handle = offload(&manager, &socket);
    let channel = manager.entry(handle).unwrap().channel();
    let t0 = Instant::now();

    hw.set_snapshot(
        channel,
        HwSnapshot {
            rx_ack_num: 5000,
            next_tx_seq: 5100,
            rx_seq: 1000,
            peer_window: 0,
        },
    );

    // The first tick only records the engine's progress.
    assert_eq!(manager.fire_due_timers(t0 + ms(250)), 1);
    assert_eq!(socket.window_probe_count(), 0);

    assert_eq!(manager.fire_due_timers(t0 + ms(500)), 1);
    assert_eq!(socket.window_probe_count(), 1);

    // Progress resets the stall detection.
    hw.set_snapshot(
        channel,
        HwSnapshot {
            rx_ack_num: 5050,
            next_tx_seq: 5100,
            rx_seq: 1000,
            peer_window: 0,
        },
    );
    assert_eq!(manager.fire_due_timers(t0 + ms(750)), 1);
    assert_eq!(socket.window_probe_count(), 1);
}

#[test]
fn no_window_probe_while_idle_or_open() {
    let config = ToeConfig {
        persist_interval: Some(ms(200)),
        ..ToeConfig::default()
    };
    let (hw, manager) = setup(config);
    let socket = MockSocket::established(1);
    let handle = offload(&manager, &socket);
    let channel = manager.entry(handle).unwrap().channel();
    let t0 = Instant::now();

    // idle
    hw.set_snapshot(
        channel,
        HwSnapshot {
            rx_ack_num: 5000,
            next_tx_seq: 5000,
            rx_seq: 1000,
            peer_window: 0,
        },
    );
    manager.fire_due_timers(t0 + ms(250));
    manager.fire_due_timers(t0 + ms(500));
    assert_eq!(socket.window_probe_count(), 0);

    // open peer window
    hw.set_snapshot(
        channel,
        HwSnapshot {
            rx_ack_num: 5000,
            next_tx_seq: 5100,
            rx_seq: 1000,
            peer_window: 8192,
        },
    );
    manager.fire_due_timers(t0 + ms(750));
    manager.fire_due_timers(t0 + ms(1000));
    assert_eq!(socket.window_probe_count(), 0);
}

#[test]
fn keepalive_check_rearms_until_answered() {
    let config = ToeConfig {
        persist_interval: None,
        keepalive_interval: Some(ms(100)),
        ..ToeConfig::default()
    };
    let (hw, manager) = setup(config);
    let socket = MockSocket::established(1);
    socket.tcp().lock().probes_out = 3;
    let handle = offload(&manager, &socket);
    let channel = manager.entry(handle).unwrap().channel();
    let t0 = Instant::now();

    assert_eq!(manager.fire_due_timers(t0 + ms(150)), 1);
    assert_eq!(socket.keepalive_ack_count(), 0);
    assert_eq!(manager.pending_timers(), 1);

    hw.set_keepalive_acked(channel, true);
    assert_eq!(manager.fire_due_timers(t0 + ms(300)), 1);
    assert_eq!(socket.keepalive_ack_count(), 1);
    assert_eq!(socket.vars().probes_out, 0);
    assert!(hw.calls().contains(&HwCall::ClearKeepalive(channel)));
    assert_eq!(manager.pending_timers(), 0);

    manager.arm_keepalive_check(handle).unwrap();
    assert_eq!(manager.pending_timers(), 1);
}

#[test]
fn timers_stop_with_connection() {
    let config = ToeConfig {
        persist_interval: Some(ms(200)),
        keepalive_interval: Some(ms(100)),
        ..ToeConfig::default()
    };
    let (hw, manager) = setup(config);
    let socket = MockSocket::established(1);
    let handle = offload(&manager, &socket);
    assert_eq!(manager.pending_timers(), 2);

    manager.remove(handle).unwrap();
    assert_eq!(manager.pending_timers(), 0);

    let later = Instant::now() + Duration::from_secs(10);
    assert_eq!(manager.fire_due_timers(later), 0);
    assert_eq!(socket.window_probe_count(), 0);
    assert_eq!(socket.keepalive_ack_count(), 0);
    assert!(!hw.calls().iter().any(|c| matches!(c, HwCall::ClearKeepalive(_))));
}

#[test]
fn stale_handle_after_reuse() {
    let config = ToeConfig {
        max_connections: 1,
        ..ToeConfig::default()
    };
    let (_hw, manager) = setup(config);
    let first = MockSocket::established(1);
    let old = offload(&manager, &first);
    manager.remove(old).unwrap();

    let second = MockSocket::established(1);
    let new = offload(&manager, &second);
    assert_eq!(old.index(), new.index());

    assert_eq!(manager.entry(old).err(), Some(ToeError::InvalidHandle(old.index())));
    assert!(manager.remove(old).is_err());
    assert!(manager.arm_keepalive_check(old).is_err());
    assert!(manager.entry(new).unwrap().has_owner());
}

#[test]
#[serial]
fn spawned_manager_fires_timers() {
    let config = ToeConfig {
        deferred_free: Some(ms(20)),
        persist_interval: None,
        ..ToeConfig::default()
    };
    let hw = Arc::new(MockHardware::new());
    let manager = OffloadManager::spawn(config, hw.clone()).unwrap();
    let socket = MockSocket::established(1);
    let handle = offload(&manager, &socket);

    manager.remove(handle).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while manager.table().membership(handle) != Ok(Membership::Free) {
        assert!(Instant::now() < deadline, "deferred free never ran");
        std::thread::sleep(ms(5));
    }

    manager.shutdown();
}
