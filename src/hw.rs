//! The offload engine as seen from the connection manager.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::error::HwError;
use crate::segment::Segment;

/// Everything the offload engine needs to take over an established
/// connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HwDescriptor {
    pub channel: u32,
    pub interface: u32,
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub ttl: u8,
    pub tos: u8,
    pub mss: u16,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    pub snd_una: u32,
    pub rcv_nxt: u32,
    pub snd_wnd: u32,
    pub snd_cwnd: u32,
    pub snd_ssthresh: u32,
    pub rto_ms: u32,
    pub advertised_window: u32,
}

/// Sequence state the engine reports for a channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwSnapshot {
    /// Highest acknowledgement received from the peer.
    pub rx_ack_num: u32,
    /// Next sequence number the engine will transmit.
    pub next_tx_seq: u32,
    /// Receive sequence the engine last acknowledged.
    pub rx_seq: u32,
    /// Window currently advertised by the peer.
    pub peer_window: u32,
}

impl HwSnapshot {
    pub fn in_flight(&self) -> u32 {
        self.next_tx_seq.wrapping_sub(self.rx_ack_num)
    }
}

/// A transmit request the engine did not accept. The segment is handed
/// back to the caller.
pub struct SendRejected {
    pub error: HwError,
    pub segment: Segment,
}

impl fmt::Debug for SendRejected {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendRejected")
            .field("error", &self.error)
            .field("segment", &self.segment)
            .finish()
    }
}

/// Address family of an interface address slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    pub fn of(addr: &IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::V4,
            IpAddr::V6(_) => Self::V6,
        }
    }
}

/// Callbacks the engine invokes while the dispatcher pulls work from it.
pub trait EventSink {
    /// A segment arrived on `channel`. Ownership moves to the sink.
    fn on_receive(&self, channel: u32, segment: Segment);

    /// Transmitted data on `channel` was acknowledged by the peer.
    fn on_tx_complete(&self, channel: u32, acked: usize);

    /// The engine gave up retransmitting on `channel`.
    fn on_max_retries(&self, channel: u32);
}

/// The TCP offload engine.
///
/// Channel numbers are those of the connection table; channels below the
/// table's first channel belong to the host path.
pub trait OffloadHardware: Send + Sync {
    /// Programs the connection into the engine with the channel disabled.
    fn program_connection(&self, desc: &HwDescriptor) -> Result<(), HwError>;

    /// Removes the channel and returns its final sequence state. With
    /// `deferred` the engine may still touch the channel's buffers until it
    /// quiesces.
    fn withdraw_connection(&self, channel: u32, deferred: bool) -> HwSnapshot;

    fn enable_channel(&self, channel: u32);
    fn disable_channel(&self, channel: u32);

    fn send(&self, channel: u32, segment: Segment) -> Result<(), SendRejected>;

    /// Reclaims completed transmissions on the shared DMA channel.
    fn reclaim_transmitted(&self, dma_channel: u32, sink: &dyn EventSink) -> usize;

    /// Reclaims completed transmissions of one connection channel.
    fn reclaim_channel(&self, channel: u32, sink: &dyn EventSink) -> usize;

    /// Delivers up to `budget` received segments to the sink.
    fn receive(&self, budget: usize, dma_channel: u32, sink: &dyn EventSink) -> usize;

    fn has_pending_work(&self) -> bool;

    fn set_advertised_window(&self, channel: u32, window: u32);
    fn set_window_scale(&self, channel: u32, scale: u8);
    fn update_rx_seq(&self, channel: u32, rcv_nxt: u32);
    fn set_tx_timeout(&self, channel: u32, rto_ms: u32);

    /// A fresh round-trip sample in milliseconds, if one completed.
    fn sample_rtt(&self, channel: u32) -> Option<u32>;

    fn connection_snapshot(&self, channel: u32) -> HwSnapshot;

    /// Waits until all transmitted bytes are acknowledged or the timeout
    /// expires. Returns the bytes still unacknowledged.
    fn tx_done_wait(&self, channel: u32, timeout: Option<Duration>) -> u32;

    fn keepalive_acked(&self, channel: u32) -> bool;
    fn clear_keepalive(&self, channel: u32);

    /// Whether `interface` is attached to the offload engine.
    fn owns_interface(&self, interface: u32) -> bool;
    fn set_address(&self, interface: u32, addr: IpAddr, vlan: Option<u16>, mac: [u8; 6]);
    fn clear_address(&self, interface: u32, family: AddressFamily);

    fn interrupt_enable(&self);
    fn interrupt_disable(&self);

    /// Whether a withdrawn channel no longer references host buffers.
    fn channel_quiesced(&self, _channel: u32) -> bool {
        true
    }
}
