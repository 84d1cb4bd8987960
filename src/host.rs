//! The host socket layer as seen from the connection manager.

use std::io;
use std::net::SocketAddr;

use parking_lot::Mutex;

use crate::segment::Segment;

/// Protocol variables of a host TCP socket.
///
/// The manager reads these to program the engine and writes back the
/// sequence state the engine reports. The lock guarding them is a leaf: it
/// is never held while another lock of this crate is acquired.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TcpVars {
    pub snd_una: u32,
    pub snd_nxt: u32,
    pub snd_wnd: u32,
    pub snd_cwnd: u32,
    pub snd_ssthresh: u32,

    pub rcv_nxt: u32,
    pub rcv_wup: u32,
    pub rcv_wnd: u32,

    pub rcvbuf: u32,
    /// Bytes accounted against the socket send buffer.
    pub wmem_queued: usize,

    pub mss: u16,
    pub snd_wscale: u8,
    pub rcv_wscale: u8,
    pub ttl: u8,
    pub tos: u8,
    pub rto_ms: u32,

    /// Keepalive probes sent without answer.
    pub probes_out: u32,
}

/// Addressing of a socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub interface: u32,
}

/// A host socket whose connection is (or is about to be) offloaded.
///
/// Callbacks are never invoked while the manager holds one of its locks.
pub trait HostSocket: Send + Sync {
    fn tcp(&self) -> &Mutex<TcpVars>;

    fn endpoint(&self) -> Endpoint;

    /// New data is available in the receive queue.
    fn data_ready(&self);

    /// Space became available in the transmit backlog.
    fn write_space(&self);

    /// A segment that must be processed by the host protocol stack.
    fn deliver_control(&self, segment: Segment);

    fn report_error(&self, kind: io::ErrorKind);

    /// Feeds a round-trip sample to the socket. Returns the resulting RTO in
    /// milliseconds.
    fn on_rtt_sample(&self, rtt_ms: u32) -> u32;

    /// Asks the socket to send a zero-window probe.
    fn send_window_probe(&self);

    /// The engine saw the peer answer a keepalive probe.
    fn keepalive_acked(&self);
}
