use std::sync::Arc;
use std::time::{Duration, Instant};

use inet_toe::testing::{MockHardware, MockSocket};
use inet_toe::{HostSocket, OffloadManager, Segment, ToeConfig};

fn main() {
    env_logger::builder()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    let args = Vec::from_iter(std::env::args());
    let config = match args.get(1) {
        Some(path) => match ToeConfig::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Error reading config file '{path}': {e}");
                std::process::exit(1);
            }
        },
        None => ToeConfig {
            persist_interval: Some(Duration::from_millis(100)),
            deferred_free: Some(Duration::from_millis(50)),
            ..ToeConfig::default()
        },
    };

    let hw = Arc::new(MockHardware::new());
    hw.add_interface(1);
    let manager = match OffloadManager::new(config, hw.clone()) {
        Ok(manager) => manager,
        Err(e) => {
            eprintln!("invalid configuration: {e}");
            std::process::exit(1);
        }
    };

    if let Err(e) = run(&manager, &hw) {
        eprintln!("simulation failed: {e}");
        std::process::exit(1);
    }

    manager.shutdown();
    let later = Instant::now() + Duration::from_secs(1);
    manager.fire_due_timers(later);
    println!("{}", manager.stats());
}

fn run(manager: &OffloadManager, hw: &MockHardware) -> inet_toe::Result<()> {
    let client = MockSocket::established(1);
    let owner: Arc<dyn HostSocket> = client.clone();
    let handle = manager.create(&owner, manager.acquire_free_entry()?)?;
    manager.enable(handle)?;
    let channel = manager.entry(handle)?.channel();

    // Out of order delivery, a duplicate and a trailing FIN.
    for seq in [1200, 1100, 1200, 1000] {
        hw.push_rx(channel, Segment::data(seq, vec![b'x'; 100]));
    }
    hw.push_rx(channel, Segment::fin(1300, b"fin".as_slice()));
    manager.interrupt();

    let mut consumed = 0;
    while let Some(segment) = manager.dequeue_rx(handle)? {
        consumed += segment.charge();
    }
    manager.release_rx(handle, consumed)?;
    log::info!(
        "received up to {}, {} control segments",
        client.vars().rcv_nxt,
        client.take_control().len()
    );

    hw.set_tx_blocked(true);
    for i in 0..4 {
        manager.enqueue_tx(handle, Segment::data(5000 + i * 500, vec![b'y'; 500]), true)?;
    }
    hw.set_tx_blocked(false);
    hw.push_tx_complete(channel, 0);
    manager.interrupt();
    log::info!("engine accepted {} segments", hw.sent_len());

    let doomed = MockSocket::established(1);
    let owner: Arc<dyn HostSocket> = doomed.clone();
    let other = manager.create(&owner, manager.acquire_free_entry()?)?;
    manager.enable(other)?;
    hw.push_max_retries(manager.entry(other)?.channel());
    manager.interrupt();
    log::info!("second connection closed with {:?}", doomed.errors());

    if let Err(e) = manager.stop(handle, Some(Duration::from_millis(200))) {
        log::warn!("drain: {e}");
    }
    manager.remove(handle)
}
