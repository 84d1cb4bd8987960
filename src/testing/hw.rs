use std::collections::VecDeque;
use std::net::IpAddr;
use std::time::Duration;

use fxhash::{FxHashMap, FxHashSet};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::HwError;
use crate::hw::{AddressFamily, EventSink, HwDescriptor, HwSnapshot, OffloadHardware, SendRejected};
use crate::segment::Segment;

/// A call the manager made into the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HwCall {
    Program(HwDescriptor),
    Withdraw { channel: u32, deferred: bool },
    EnableChannel(u32),
    DisableChannel(u32),
    Send { channel: u32, seq: u32, len: usize },
    SetAdvertisedWindow(u32, u32),
    SetWindowScale(u32, u8),
    UpdateRxSeq(u32, u32),
    SetTxTimeout(u32, u32),
    TxDoneWait(u32),
    ClearKeepalive(u32),
    SetAddress { interface: u32, addr: IpAddr },
    ClearAddress { interface: u32, family: AddressFamily },
    InterruptEnable,
    InterruptDisable,
}

/// An event delivered from [`OffloadHardware::receive`].
#[derive(Debug)]
pub enum MockEvent {
    Receive(u32, Segment),
    MaxRetries(u32),
}

#[derive(Default)]
struct Inner {
    calls: Vec<HwCall>,
    rx: VecDeque<MockEvent>,
    tx_complete: VecDeque<(u32, usize)>,
    sent: Vec<(u32, Segment)>,

    snapshots: FxHashMap<u32, HwSnapshot>,
    rtt: FxHashMap<u32, u32>,
    unacked: FxHashMap<u32, u32>,
    keepalive_acked: FxHashSet<u32>,
    not_quiesced: FxHashSet<u32>,
    interfaces: FxHashSet<u32>,

    interrupts_enabled: bool,
    tx_blocked: bool,
    fail_next_send: Option<HwError>,
    refuse_program: Option<HwError>,
    flaky: Option<(StdRng, f64)>,
}

/// In-memory offload engine that records every call.
///
/// Events queued with [`push_rx`](Self::push_rx) and friends are delivered
/// to the sink on the next dispatcher pass. No internal lock is held while
/// the sink runs.
#[derive(Default)]
pub struct MockHardware {
    inner: Mutex<Inner>,
}

impl MockHardware {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes roughly `probability` of all sends fail with `WouldBlock`.
    pub fn with_flaky_sends(probability: f64, seed: u64) -> Self {
        let hw = Self::new();
        hw.inner.lock().flaky = Some((StdRng::seed_from_u64(seed), probability));
        hw
    }

    pub fn calls(&self) -> Vec<HwCall> {
        self.inner.lock().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&HwCall) -> bool) -> usize {
        self.inner.lock().calls.iter().filter(|c| pred(c)).count()
    }

    pub fn clear_calls(&self) {
        self.inner.lock().calls.clear();
    }

    pub fn push_rx(&self, channel: u32, segment: Segment) {
        self.inner
            .lock()
            .rx
            .push_back(MockEvent::Receive(channel, segment));
    }

    pub fn push_max_retries(&self, channel: u32) {
        self.inner.lock().rx.push_back(MockEvent::MaxRetries(channel));
    }

    pub fn push_tx_complete(&self, channel: u32, acked: usize) {
        self.inner.lock().tx_complete.push_back((channel, acked));
    }

    /// Segments accepted by `send`, in order.
    pub fn take_sent(&self) -> Vec<(u32, Segment)> {
        std::mem::take(&mut self.inner.lock().sent)
    }

    pub fn sent_len(&self) -> usize {
        self.inner.lock().sent.len()
    }

    pub fn set_snapshot(&self, channel: u32, snapshot: HwSnapshot) {
        self.inner.lock().snapshots.insert(channel, snapshot);
    }

    pub fn set_rtt_sample(&self, channel: u32, rtt_ms: Option<u32>) {
        let mut inner = self.inner.lock();
        match rtt_ms {
            Some(rtt) => inner.rtt.insert(channel, rtt),
            None => inner.rtt.remove(&channel),
        };
    }

    pub fn set_unacked(&self, channel: u32, unacked: u32) {
        self.inner.lock().unacked.insert(channel, unacked);
    }

    pub fn set_keepalive_acked(&self, channel: u32, acked: bool) {
        let mut inner = self.inner.lock();
        if acked {
            inner.keepalive_acked.insert(channel);
        } else {
            inner.keepalive_acked.remove(&channel);
        }
    }

    pub fn set_quiesced(&self, channel: u32, quiesced: bool) {
        let mut inner = self.inner.lock();
        if quiesced {
            inner.not_quiesced.remove(&channel);
        } else {
            inner.not_quiesced.insert(channel);
        }
    }

    pub fn add_interface(&self, interface: u32) {
        self.inner.lock().interfaces.insert(interface);
    }

    /// While blocked every send fails with `WouldBlock`.
    pub fn set_tx_blocked(&self, blocked: bool) {
        self.inner.lock().tx_blocked = blocked;
    }

    pub fn fail_next_send(&self, error: HwError) {
        self.inner.lock().fail_next_send = Some(error);
    }

    pub fn refuse_program(&self, error: Option<HwError>) {
        self.inner.lock().refuse_program = error;
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.inner.lock().interrupts_enabled
    }

    fn record(&self, call: HwCall) {
        self.inner.lock().calls.push(call);
    }
}

impl OffloadHardware for MockHardware {
    fn program_connection(&self, desc: &HwDescriptor) -> Result<(), HwError> {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::Program(desc.clone()));
        if let Some(e) = inner.refuse_program.clone() {
            return Err(e);
        }
        let snapshot = inner.snapshots.entry(desc.channel).or_default();
        snapshot.rx_ack_num = desc.snd_una;
        snapshot.next_tx_seq = desc.snd_una;
        snapshot.rx_seq = desc.rcv_nxt;
        snapshot.peer_window = desc.snd_wnd;
        Ok(())
    }

    fn withdraw_connection(&self, channel: u32, deferred: bool) -> HwSnapshot {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::Withdraw { channel, deferred });
        inner.snapshots.get(&channel).copied().unwrap_or_default()
    }

    fn enable_channel(&self, channel: u32) {
        self.record(HwCall::EnableChannel(channel));
    }

    fn disable_channel(&self, channel: u32) {
        self.record(HwCall::DisableChannel(channel));
    }

    fn send(&self, channel: u32, segment: Segment) -> Result<(), SendRejected> {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::Send {
            channel,
            seq: segment.seq(),
            len: segment.len(),
        });

        let flaky = match inner.flaky.as_mut() {
            Some((rng, p)) => rng.gen_bool(*p),
            None => false,
        };
        if inner.tx_blocked || flaky {
            return Err(SendRejected {
                error: HwError::WouldBlock,
                segment,
            });
        }
        if let Some(error) = inner.fail_next_send.take() {
            return Err(SendRejected { error, segment });
        }

        let len = segment.len() as u32;
        let snapshot = inner.snapshots.entry(channel).or_default();
        snapshot.next_tx_seq = snapshot.next_tx_seq.wrapping_add(len);
        inner.sent.push((channel, segment));
        Ok(())
    }

    fn reclaim_transmitted(&self, _dma_channel: u32, sink: &dyn EventSink) -> usize {
        let mut n = 0;
        loop {
            let Some((channel, acked)) = self.inner.lock().tx_complete.pop_front() else {
                break;
            };
            sink.on_tx_complete(channel, acked);
            n += 1;
        }
        n
    }

    fn reclaim_channel(&self, _channel: u32, _sink: &dyn EventSink) -> usize {
        0
    }

    fn receive(&self, budget: usize, _dma_channel: u32, sink: &dyn EventSink) -> usize {
        let mut n = 0;
        while n < budget {
            let Some(event) = self.inner.lock().rx.pop_front() else {
                break;
            };
            match event {
                MockEvent::Receive(channel, segment) => sink.on_receive(channel, segment),
                MockEvent::MaxRetries(channel) => sink.on_max_retries(channel),
            }
            n += 1;
        }
        n
    }

    fn has_pending_work(&self) -> bool {
        let inner = self.inner.lock();
        !inner.rx.is_empty() || !inner.tx_complete.is_empty()
    }

    fn set_advertised_window(&self, channel: u32, window: u32) {
        self.record(HwCall::SetAdvertisedWindow(channel, window));
    }

    fn set_window_scale(&self, channel: u32, scale: u8) {
        self.record(HwCall::SetWindowScale(channel, scale));
    }

    fn update_rx_seq(&self, channel: u32, rcv_nxt: u32) {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::UpdateRxSeq(channel, rcv_nxt));
        inner.snapshots.entry(channel).or_default().rx_seq = rcv_nxt;
    }

    fn set_tx_timeout(&self, channel: u32, rto_ms: u32) {
        self.record(HwCall::SetTxTimeout(channel, rto_ms));
    }

    fn sample_rtt(&self, channel: u32) -> Option<u32> {
        self.inner.lock().rtt.get(&channel).copied()
    }

    fn connection_snapshot(&self, channel: u32) -> HwSnapshot {
        self.inner
            .lock()
            .snapshots
            .get(&channel)
            .copied()
            .unwrap_or_default()
    }

    fn tx_done_wait(&self, channel: u32, _timeout: Option<Duration>) -> u32 {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::TxDoneWait(channel));
        inner.unacked.get(&channel).copied().unwrap_or(0)
    }

    fn keepalive_acked(&self, channel: u32) -> bool {
        self.inner.lock().keepalive_acked.contains(&channel)
    }

    fn clear_keepalive(&self, channel: u32) {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::ClearKeepalive(channel));
        inner.keepalive_acked.remove(&channel);
    }

    fn owns_interface(&self, interface: u32) -> bool {
        self.inner.lock().interfaces.contains(&interface)
    }

    fn set_address(&self, interface: u32, addr: IpAddr, _vlan: Option<u16>, _mac: [u8; 6]) {
        self.record(HwCall::SetAddress { interface, addr });
    }

    fn clear_address(&self, interface: u32, family: AddressFamily) {
        self.record(HwCall::ClearAddress { interface, family });
    }

    fn interrupt_enable(&self) {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::InterruptEnable);
        inner.interrupts_enabled = true;
    }

    fn interrupt_disable(&self) {
        let mut inner = self.inner.lock();
        inner.calls.push(HwCall::InterruptDisable);
        inner.interrupts_enabled = false;
    }

    fn channel_quiesced(&self, channel: u32) -> bool {
        !self.inner.lock().not_quiesced.contains(&channel)
    }
}
