use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::host::{Endpoint, HostSocket, TcpVars};
use crate::segment::Segment;

/// Host socket that counts notifications and stores what it is handed.
pub struct MockSocket {
    tcp: Mutex<TcpVars>,
    endpoint: Endpoint,

    data_ready: AtomicUsize,
    write_space: AtomicUsize,
    window_probes: AtomicUsize,
    keepalive_acks: AtomicUsize,
    rto_ms: AtomicU32,

    control: Mutex<Vec<Segment>>,
    errors: Mutex<Vec<io::ErrorKind>>,
    rtt_samples: Mutex<Vec<u32>>,
}

impl MockSocket {
    pub fn new(endpoint: Endpoint, tcp: TcpVars) -> Arc<Self> {
        Arc::new(Self {
            rto_ms: AtomicU32::new(tcp.rto_ms),
            tcp: Mutex::new(tcp),
            endpoint,
            data_ready: AtomicUsize::new(0),
            write_space: AtomicUsize::new(0),
            window_probes: AtomicUsize::new(0),
            keepalive_acks: AtomicUsize::new(0),
            control: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
            rtt_samples: Mutex::new(Vec::new()),
        })
    }

    /// An established connection on `interface` expecting receive sequence
    /// 1000 and with send sequence 5000 acknowledged.
    pub fn established(interface: u32) -> Arc<Self> {
        let endpoint = Endpoint {
            local: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 80)),
            remote: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 2), 40000)),
            interface,
        };
        let tcp = TcpVars {
            snd_una: 5000,
            snd_nxt: 5100,
            snd_wnd: 65535,
            snd_cwnd: 14600,
            snd_ssthresh: 65535,
            rcv_nxt: 1000,
            rcv_wup: 1000,
            rcv_wnd: 65535,
            rcvbuf: 65536,
            mss: 1460,
            ttl: 64,
            rto_ms: 200,
            ..TcpVars::default()
        };
        Self::new(endpoint, tcp)
    }

    pub fn data_ready_count(&self) -> usize {
        self.data_ready.load(Ordering::Acquire)
    }

    pub fn write_space_count(&self) -> usize {
        self.write_space.load(Ordering::Acquire)
    }

    pub fn window_probe_count(&self) -> usize {
        self.window_probes.load(Ordering::Acquire)
    }

    pub fn keepalive_ack_count(&self) -> usize {
        self.keepalive_acks.load(Ordering::Acquire)
    }

    /// The RTO returned for subsequent RTT samples.
    pub fn set_rto(&self, rto_ms: u32) {
        self.rto_ms.store(rto_ms, Ordering::Release);
    }

    pub fn take_control(&self) -> Vec<Segment> {
        std::mem::take(&mut *self.control.lock())
    }

    pub fn errors(&self) -> Vec<io::ErrorKind> {
        self.errors.lock().clone()
    }

    pub fn rtt_samples(&self) -> Vec<u32> {
        self.rtt_samples.lock().clone()
    }

    pub fn vars(&self) -> TcpVars {
        self.tcp.lock().clone()
    }
}

impl HostSocket for MockSocket {
    fn tcp(&self) -> &Mutex<TcpVars> {
        &self.tcp
    }

    fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    fn data_ready(&self) {
        self.data_ready.fetch_add(1, Ordering::AcqRel);
    }

    fn write_space(&self) {
        self.write_space.fetch_add(1, Ordering::AcqRel);
    }

    fn deliver_control(&self, segment: Segment) {
        self.control.lock().push(segment);
    }

    fn report_error(&self, kind: io::ErrorKind) {
        self.errors.lock().push(kind);
    }

    fn on_rtt_sample(&self, rtt_ms: u32) -> u32 {
        self.rtt_samples.lock().push(rtt_ms);
        self.rto_ms.load(Ordering::Acquire)
    }

    fn send_window_probe(&self) {
        self.window_probes.fetch_add(1, Ordering::AcqRel);
    }

    fn keepalive_acked(&self) {
        self.keepalive_acks.fetch_add(1, Ordering::AcqRel);
    }
}
