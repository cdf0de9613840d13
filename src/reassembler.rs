//! Event reassembly on the worker node.
//!
//! The Reassembler binds a contiguous range of UDP ports (`2^port_range`
//! starting at the given port), spreads them round-robin over receive
//! threads and rebuilds events from RE-headed fragments. Because the LB
//! hashes on the per-event entropy, all fragments of one event land on one
//! port and thus one thread, so assembly state is thread-local.
//!
//! Completed events go into a bounded queue for the consumer; overflow is
//! counted as enqueue loss, fragments that never complete within
//! `event_timeout_ms` as reassembly loss. A state thread samples queue fill,
//! runs a PID controller over a sliding epoch window and reports both to the
//! control plane via `SendState`.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering::Relaxed};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, Sender, TrySendError};
use socket2::{Domain, Protocol, Socket, Type};

use crate::affinity;
use crate::config::FlagFile;
use crate::error::{AtomicErrorKind, E2sarError, ErrorKind, Result};
use crate::headers::{ReHdr, LB_HDR_LEN, RE_HDR_LEN};
use crate::lbmanager::{port_range_from_source_count, LbManager, TlsOptions};
use crate::net_util::{interface_and_mtu, interface_ips, unix_time_micros};
use crate::uri::EjfatUri;

/// Depth of the assembled-event queue toward the consumer.
const QSIZE: usize = 1000;

/// Depth of the lost-event diagnostic queue.
const LOST_QSIZE: usize = 20;

/// Receive buffer size; fits a jumbo-frame datagram.
const RECV_BUFFER_SIZE: usize = 9000;

/// How the receive threads are provisioned.
#[derive(Debug, Clone)]
pub enum RecvThreads {
    /// N threads, no pinning.
    Count(usize),
    /// One thread per listed core, each pinned to it.
    Cores(Vec<usize>),
}

/// Knobs governing Reassembler behavior; `..Default::default()` fills the rest.
#[derive(Debug, Clone)]
pub struct ReassemblerFlags {
    /// Register, send state and deregister via the control plane.
    pub use_cp: bool,
    /// Dial the CP by resolved address even when named by DNS (disables cert
    /// validation).
    pub use_host_address: bool,
    /// Validate the CP TLS certificate.
    pub validate_cert: bool,
    /// SendState cadence.
    pub period_ms: u16,
    /// PID integration window.
    pub epoch_ms: u32,
    pub kp: f32,
    pub ki: f32,
    pub kd: f32,
    /// Queue-fill target the PID drives toward.
    pub set_point: f32,
    /// 2^port_range ports to bind; -1 derives it from the thread count.
    pub port_range: i32,
    /// Expect the LB header on receive (testing; production strips it).
    pub with_lb_header: bool,
    /// Give up on a partial event after this long.
    pub event_timeout_ms: u32,
    /// SO_RCVBUF size.
    pub rcv_socket_buf_size: usize,
    /// Worker capacity descriptors passed to the CP on registration.
    pub weight: f32,
    pub min_factor: f32,
    pub max_factor: f32,
}

impl Default for ReassemblerFlags {
    fn default() -> Self {
        ReassemblerFlags {
            use_cp: true,
            use_host_address: false,
            validate_cert: true,
            period_ms: 100,
            epoch_ms: 1000,
            kp: 0.0,
            ki: 0.0,
            kd: 0.0,
            set_point: 0.0,
            port_range: -1,
            with_lb_header: false,
            event_timeout_ms: 500,
            rcv_socket_buf_size: 1024 * 1024 * 3,
            weight: 1.0,
            min_factor: 0.5,
            max_factor: 2.0,
        }
    }
}

impl ReassemblerFlags {
    /// Load flags from an INI-style file; absent keys keep defaults.
    pub fn from_file(path: &str) -> Result<ReassemblerFlags> {
        let f = FlagFile::load(path)?;
        let mut flags = ReassemblerFlags::default();
        if let Some(v) = f.general.use_cp {
            flags.use_cp = v;
        }
        if let Some(v) = f.control_plane.use_host_address {
            flags.use_host_address = v;
        }
        if let Some(v) = f.control_plane.validate_cert {
            flags.validate_cert = v;
        }
        if let Some(v) = f.control_plane.period_ms {
            flags.period_ms = v;
        }
        if let Some(v) = f.data_plane.port_range {
            flags.port_range = v;
        }
        if let Some(v) = f.data_plane.with_lb_header {
            flags.with_lb_header = v;
        }
        if let Some(v) = f.data_plane.event_timeout_ms {
            flags.event_timeout_ms = v;
        }
        if let Some(v) = f.data_plane.rcv_socket_buf_size {
            flags.rcv_socket_buf_size = v;
        }
        if let Some(v) = f.data_plane.epoch_ms {
            flags.epoch_ms = v;
        }
        if let Some(v) = f.pid.set_point {
            flags.set_point = v;
        }
        if let Some(v) = f.pid.kp {
            flags.kp = v;
        }
        if let Some(v) = f.pid.ki {
            flags.ki = v;
        }
        if let Some(v) = f.pid.kd {
            flags.kd = v;
        }
        if let Some(v) = f.pid.weight {
            flags.weight = v;
        }
        if let Some(v) = f.pid.min_factor {
            flags.min_factor = v;
        }
        if let Some(v) = f.pid.max_factor {
            flags.max_factor = v;
        }
        Ok(flags)
    }
}

/// A fully reassembled event; the consumer owns the buffer.
#[derive(Debug)]
pub struct ReassembledEvent {
    pub event: Vec<u8>,
    pub event_num: u64,
    pub data_id: u16,
}

/// Diagnostic record of a lost event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LostEventInfo {
    pub event_num: u64,
    pub data_id: u16,
    /// Fragments that had arrived before the event was given up on.
    pub num_fragments: usize,
}

/// Point-in-time receive statistics.
#[derive(Debug, Clone, Copy)]
pub struct RecvStats {
    /// Events completed but dropped because the consumer queue was full.
    pub enqueue_loss: u64,
    /// Events dropped after `event_timeout_ms` without completing.
    pub reassembly_loss: u64,
    /// Events fully reassembled.
    pub event_success: u64,
    pub last_errno: i32,
    pub grpc_err_cnt: u64,
    pub data_err_cnt: u64,
    pub last_e2sar_error: ErrorKind,
}

#[derive(Debug, Default)]
struct AtomicRecvStats {
    enqueue_loss: AtomicU64,
    reassembly_loss: AtomicU64,
    event_success: AtomicU64,
    last_errno: AtomicI32,
    grpc_err_cnt: AtomicU64,
    data_err_cnt: AtomicU64,
    last_e2sar_error: AtomicErrorKind,
}

impl AtomicRecvStats {
    fn record_os_error(&self) {
        self.data_err_cnt.fetch_add(1, Relaxed);
        self.last_errno
            .store(std::io::Error::last_os_error().raw_os_error().unwrap_or(0), Relaxed);
        self.last_e2sar_error.store(ErrorKind::Socket);
    }

    fn snapshot(&self) -> RecvStats {
        RecvStats {
            enqueue_loss: self.enqueue_loss.load(Relaxed),
            reassembly_loss: self.reassembly_loss.load(Relaxed),
            event_success: self.event_success.load(Relaxed),
            last_errno: self.last_errno.load(Relaxed),
            grpc_err_cnt: self.grpc_err_cnt.load(Relaxed),
            data_err_cnt: self.data_err_cnt.load(Relaxed),
            last_e2sar_error: self.last_e2sar_error.load(),
        }
    }
}

/// An out-of-order segment parked until its offset comes up.
struct OodSegment {
    offset: u32,
    data: Vec<u8>,
}

impl PartialEq for OodSegment {
    fn eq(&self, other: &Self) -> bool {
        self.offset == other.offset
    }
}
impl Eq for OodSegment {}
impl PartialOrd for OodSegment {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for OodSegment {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.offset.cmp(&other.offset)
    }
}

/// Per-(eventNum, dataId) assembly state, owned by one receive thread.
struct EventInProgress {
    buf: Vec<u8>,
    /// Expected offset of the next in-order segment.
    cur_end: usize,
    num_fragments: usize,
    first_segment: Instant,
    /// Min-heap keyed by offset for out-of-order arrivals.
    ood: BinaryHeap<Reverse<OodSegment>>,
}

impl EventInProgress {
    fn new(total_length: usize) -> EventInProgress {
        EventInProgress {
            buf: vec![0u8; total_length],
            cur_end: 0,
            num_fragments: 0,
            first_segment: Instant::now(),
            ood: BinaryHeap::new(),
        }
    }

    /// Take in one segment; returns true when the event became complete.
    /// Segments with impossible extents are rejected (the caller counts a
    /// data error).
    fn insert_segment(&mut self, offset: u32, data: &[u8]) -> std::result::Result<bool, ()> {
        let offset = offset as usize;
        if offset + data.len() > self.buf.len() {
            return Err(());
        }
        self.num_fragments += 1;

        if offset == self.cur_end {
            self.buf[offset..offset + data.len()].copy_from_slice(data);
            self.cur_end += data.len();
            self.drain_ood();
        } else if offset > self.cur_end {
            self.ood.push(Reverse(OodSegment { offset: offset as u32, data: data.to_vec() }));
        }
        // offset < cur_end is a duplicate or stale retransmit; dropped

        Ok(self.cur_end == self.buf.len())
    }

    fn drain_ood(&mut self) {
        while let Some(Reverse(top)) = self.ood.peek() {
            let offset = top.offset as usize;
            if offset == self.cur_end {
                let Reverse(seg) = self.ood.pop().unwrap();
                self.buf[offset..offset + seg.data.len()].copy_from_slice(&seg.data);
                self.cur_end += seg.data.len();
            } else if offset < self.cur_end {
                // stale duplicate parked earlier
                self.ood.pop();
            } else {
                break;
            }
        }
    }
}

struct ReassemblerInner {
    flags: ReassemblerFlags,
    data_ip: IpAddr,
    data_port: u16,
    port_range: i32,
    num_recv_ports: usize,
    num_recv_threads: usize,
    threads_to_ports: Vec<Vec<u16>>,
    thread_cores: Vec<Option<usize>>,

    stop: AtomicBool,
    stats: AtomicRecvStats,
    /// fragments per port, indexed by port - data_port
    fragments_per_port: Vec<AtomicU64>,

    event_tx: Sender<ReassembledEvent>,
    event_rx: Receiver<ReassembledEvent>,
    lost_tx: Sender<LostEventInfo>,
    lost_rx: Receiver<LostEventInfo>,
}

impl ReassemblerInner {
    fn log_lost_event(
        &self,
        seen: &mut HashSet<(u64, u16)>,
        key: (u64, u16),
        num_fragments: usize,
        enqueue_loss: bool,
    ) {
        if !seen.insert(key) {
            return;
        }
        let _ = self.lost_tx.try_send(LostEventInfo {
            event_num: key.0,
            data_id: key.1,
            num_fragments,
        });
        if enqueue_loss {
            self.stats.enqueue_loss.fetch_add(1, Relaxed);
        } else {
            self.stats.reassembly_loss.fetch_add(1, Relaxed);
        }
    }
}

pub struct Reassembler {
    inner: Arc<ReassemblerInner>,
    lbman: Option<Arc<Mutex<LbManager>>>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
    registered: bool,
}

impl std::fmt::Debug for Reassembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Reassembler")
            .field("started", &self.started)
            .field("registered", &self.registered)
            .finish_non_exhaustive()
    }
}

impl Reassembler {
    /// Build a Reassembler listening on `data_ip` (or, with `None`, on the
    /// local address the routing table picks for the URI's data address),
    /// starting at `starting_port`. Call [`Reassembler::open_and_start`] to
    /// begin receiving.
    pub fn new(
        uri: EjfatUri,
        data_ip: Option<IpAddr>,
        starting_port: u16,
        recv_threads: RecvThreads,
        flags: ReassemblerFlags,
    ) -> Result<Reassembler> {
        if !uri.has_data_addr() {
            return Err(E2sarError::Parameter(
                "data address not present in the URI".to_string(),
            ));
        }
        if starting_port < 1024 {
            return Err(E2sarError::Parameter(
                "base receive port in the privileged range (<1024)".to_string(),
            ));
        }
        if flags.event_timeout_ms > 5000 {
            return Err(E2sarError::Parameter(
                "event timeout unreasonably long, limit 5s".to_string(),
            ));
        }
        if flags.port_range > 14 {
            return Err(E2sarError::Parameter("port range out of bounds: [0, 14]".to_string()));
        }
        if flags.period_ms == 0 || flags.epoch_ms < flags.period_ms as u32 {
            return Err(E2sarError::Parameter(
                "epoch must cover at least one reporting period".to_string(),
            ));
        }

        let (num_recv_threads, thread_cores) = match recv_threads {
            RecvThreads::Count(n) => (n, vec![None; n]),
            RecvThreads::Cores(cores) => {
                let n = cores.len();
                (n, cores.into_iter().map(Some).collect())
            }
        };
        if num_recv_threads == 0 || num_recv_threads > 128 {
            return Err(E2sarError::Parameter(
                "number of receive threads must be in [1, 128]".to_string(),
            ));
        }

        let port_range = if flags.port_range >= 0 {
            flags.port_range
        } else {
            port_range_from_source_count(num_recv_threads)
        };
        let num_recv_ports = 1usize << port_range;

        let data_ip = match data_ip {
            Some(ip) => ip,
            None => discover_local_data_ip(&uri)?,
        };

        // deal ports round-robin across threads; with an explicit port_range
        // override some threads may own more ports than others
        let mut threads_to_ports = vec![Vec::new(); num_recv_threads];
        for i in 0..num_recv_ports {
            threads_to_ports[i % num_recv_threads].push(starting_port + i as u16);
        }

        let lbman = if flags.use_cp {
            Some(Arc::new(Mutex::new(LbManager::new(
                uri,
                flags.validate_cert,
                flags.use_host_address,
                TlsOptions::default(),
            )?)))
        } else {
            None
        };

        let (event_tx, event_rx) = bounded(QSIZE);
        let (lost_tx, lost_rx) = bounded(LOST_QSIZE);

        Ok(Reassembler {
            inner: Arc::new(ReassemblerInner {
                data_ip,
                data_port: starting_port,
                port_range,
                num_recv_ports,
                num_recv_threads,
                threads_to_ports,
                thread_cores,
                stop: AtomicBool::new(false),
                stats: AtomicRecvStats::default(),
                fragments_per_port: (0..num_recv_ports).map(|_| AtomicU64::new(0)).collect(),
                event_tx,
                event_rx,
                lost_tx,
                lost_rx,
                flags,
            }),
            lbman,
            threads: Vec::new(),
            started: false,
            registered: false,
        })
    }

    /// Register this worker with the control plane; call before
    /// [`Reassembler::open_and_start`]. The CP expects the first SendState
    /// within 10 s of registration.
    pub fn register_worker(&mut self, node_name: &str) -> Result<()> {
        let Some(lbman) = &self.lbman else {
            return Ok(());
        };
        lbman.lock().unwrap().register_worker(
            node_name,
            (self.inner.data_ip, self.inner.data_port),
            self.inner.flags.weight,
            self.inner.num_recv_ports,
            self.inner.flags.min_factor,
            self.inner.flags.max_factor,
        )?;
        self.registered = true;
        Ok(())
    }

    /// Notify the control plane this worker is going away.
    pub fn deregister_worker(&mut self) -> Result<()> {
        if self.registered {
            self.registered = false;
            if let Some(lbman) = &self.lbman {
                return lbman.lock().unwrap().deregister_worker();
            }
            Ok(())
        } else if self.lbman.is_some() {
            Err(E2sarError::Logic(
                "attempting to deregister a worker that hasn't been registered".to_string(),
            ))
        } else {
            Ok(())
        }
    }

    /// Bind all ports and start the receive (and SendState) threads.
    pub fn open_and_start(&mut self) -> Result<()> {
        if self.started {
            return Err(E2sarError::Logic("reassembler already started".to_string()));
        }
        let inner = &self.inner;

        for (i, ports) in inner.threads_to_ports.iter().enumerate() {
            let mut sockets = Vec::with_capacity(ports.len());
            for &port in ports {
                sockets.push((open_recv_socket(inner, port)?, port));
            }
            let thread_inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("e2sar-recv-{}", i))
                .spawn(move || recv_thread_body(thread_inner, i, sockets))
                .map_err(|e| E2sarError::System(format!("unable to spawn recv thread: {}", e)))?;
            self.threads.push(handle);
        }

        if let Some(lbman) = &self.lbman {
            let state_inner = inner.clone();
            let state_lbman = lbman.clone();
            let handle = std::thread::Builder::new()
                .name("e2sar-sendstate".into())
                .spawn(move || sendstate_thread_body(state_inner, state_lbman))
                .map_err(|e| {
                    E2sarError::System(format!("unable to spawn sendstate thread: {}", e))
                })?;
            self.threads.push(handle);
        }

        self.started = true;
        tracing::info!(
            ip = %inner.data_ip,
            first_port = inner.data_port,
            last_port = inner.data_port + inner.num_recv_ports as u16 - 1,
            threads = inner.num_recv_threads,
            "reassembler started"
        );
        Ok(())
    }

    /// Non-blocking dequeue of an assembled event.
    pub fn get_event(&self) -> Option<ReassembledEvent> {
        self.inner.event_rx.try_recv().ok()
    }

    /// Blocking dequeue. `wait_ms` of 0 waits until shutdown; otherwise it is
    /// a soft deadline checked about every 10 ms.
    pub fn recv_event(&self, wait_ms: u64) -> Option<ReassembledEvent> {
        let deadline =
            if wait_ms == 0 { None } else { Some(Instant::now() + Duration::from_millis(wait_ms)) };
        loop {
            match self.inner.event_rx.recv_timeout(Duration::from_millis(10)) {
                Ok(ev) => return Some(ev),
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => return None,
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => {}
            }
            if self.inner.stop.load(Relaxed) {
                return None;
            }
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return None;
                }
            }
        }
    }

    /// Pop one lost-event diagnostic record, if any.
    pub fn get_lost_event(&self) -> Option<LostEventInfo> {
        self.inner.lost_rx.try_recv().ok()
    }

    pub fn stats(&self) -> RecvStats {
        self.inner.stats.snapshot()
    }

    /// Per-port received-fragment counters; only available once the threads
    /// have stopped.
    pub fn fd_stats(&self) -> Result<Vec<(u16, u64)>> {
        if !self.inner.stop.load(Relaxed) {
            return Err(E2sarError::Logic(
                "per-port stats are only available after the threads have been stopped"
                    .to_string(),
            ));
        }
        Ok(self
            .inner
            .fragments_per_port
            .iter()
            .enumerate()
            .map(|(i, c)| (self.inner.data_port + i as u16, c.load(Relaxed)))
            .collect())
    }

    pub fn num_recv_threads(&self) -> usize {
        self.inner.num_recv_threads
    }

    /// Inclusive port span this reassembler listens on.
    pub fn recv_ports(&self) -> (u16, u16) {
        (
            self.inner.data_port,
            self.inner.data_port + self.inner.num_recv_ports as u16 - 1,
        )
    }

    /// The PortRange exponent reported to the CP.
    pub fn port_range(&self) -> i32 {
        self.inner.port_range
    }

    pub fn data_ip(&self) -> IpAddr {
        self.inner.data_ip
    }

    /// Stop all threads; deregisters first when registered.
    pub fn stop(&mut self) {
        if self.registered {
            let _ = self.deregister_worker();
        }
        self.inner.stop.store(true, Relaxed);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        self.started = false;
    }
}

impl Drop for Reassembler {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Pick the local address the kernel would source from toward the URI's data
/// address.
fn discover_local_data_ip(uri: &EjfatUri) -> Result<IpAddr> {
    let (dest, v6) = if uri.has_data_addr_v4() {
        (IpAddr::V4(uri.data_addr_v4()?.0), false)
    } else {
        (IpAddr::V6(uri.data_addr_v6()?.0), true)
    };
    let (iface, _) = interface_and_mtu(dest)?;
    let ips = interface_ips(&iface, v6)?;
    ips.into_iter().next().ok_or_else(|| {
        E2sarError::NotFound(format!("no usable address on interface {}", iface))
    })
}

fn open_recv_socket(inner: &ReassemblerInner, port: u16) -> Result<Socket> {
    let domain = if inner.data_ip.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        inner.stats.record_os_error();
        E2sarError::Socket(format!("unable to open receive socket: {}", e))
    })?;
    sock.set_recv_buffer_size(inner.flags.rcv_socket_buf_size).map_err(|e| {
        inner.stats.record_os_error();
        E2sarError::Socket(format!("unable to set SO_RCVBUF: {}", e))
    })?;
    let local: SocketAddr = SocketAddr::new(inner.data_ip, port);
    sock.bind(&local.into()).map_err(|e| {
        inner.stats.record_os_error();
        E2sarError::Socket(format!("unable to bind port {}: {}", port, e))
    })?;
    Ok(sock)
}

fn recv_thread_body(inner: Arc<ReassemblerInner>, index: usize, sockets: Vec<(Socket, u16)>) {
    use std::os::fd::AsRawFd;

    if let Some(core) = inner.thread_cores[index] {
        if let Err(e) = affinity::set_thread(core) {
            tracing::warn!(core, "unable to pin receive thread: {}", e);
        }
    }
    tracing::debug!(index, ports = sockets.len(), "receive thread started");

    let timeout = Duration::from_millis(inner.flags.event_timeout_ms as u64);
    let mut events_in_progress: HashMap<(u64, u16), EventInProgress> = HashMap::new();
    let mut lost_seen: HashSet<(u64, u16)> = HashSet::new();
    let mut recv_buf = vec![0u8; RECV_BUFFER_SIZE];

    let max_fd = sockets.iter().map(|(s, _)| s.as_raw_fd()).max().unwrap_or(0);

    while !inner.stop.load(Relaxed) {
        // wait for traffic on any owned socket
        let mut readfds: libc::fd_set = unsafe { std::mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut readfds);
            for (s, _) in &sockets {
                libc::FD_SET(s.as_raw_fd(), &mut readfds);
            }
        }
        let mut tv = libc::timeval { tv_sec: 0, tv_usec: 10_000 };
        let rc = unsafe {
            libc::select(
                max_fd + 1,
                &mut readfds,
                std::ptr::null_mut(),
                std::ptr::null_mut(),
                &mut tv,
            )
        };

        // expire partial events this thread owns
        let now = Instant::now();
        events_in_progress.retain(|key, item| {
            if now.duration_since(item.first_segment) > timeout {
                inner.log_lost_event(&mut lost_seen, *key, item.num_fragments, false);
                tracing::debug!(event = key.0, data_id = key.1, "reassembly timeout");
                false
            } else {
                true
            }
        });

        if rc == -1 {
            inner.stats.record_os_error();
            continue;
        }
        if rc == 0 {
            continue;
        }

        for (sock, port) in &sockets {
            let fd = sock.as_raw_fd();
            if !unsafe { libc::FD_ISSET(fd, &readfds) } {
                continue;
            }
            let n = unsafe {
                libc::recvfrom(
                    fd,
                    recv_buf.as_mut_ptr() as *mut libc::c_void,
                    RECV_BUFFER_SIZE,
                    0,
                    std::ptr::null_mut(),
                    std::ptr::null_mut(),
                )
            };
            if n == -1 {
                inner.stats.record_os_error();
                continue;
            }
            inner.fragments_per_port[(*port - inner.data_port) as usize]
                .fetch_add(1, Relaxed);

            process_datagram(
                &inner,
                &mut events_in_progress,
                &mut lost_seen,
                &recv_buf[..n as usize],
            );
        }
    }
    tracing::debug!(index, "receive thread exiting");
}

/// Parse one datagram and fold its segment into the assembly state.
fn process_datagram(
    inner: &ReassemblerInner,
    events_in_progress: &mut HashMap<(u64, u16), EventInProgress>,
    lost_seen: &mut HashSet<(u64, u16)>,
    datagram: &[u8],
) {
    // in testing the LB header may still be attached
    let re_offset = if inner.flags.with_lb_header { LB_HDR_LEN } else { 0 };
    if datagram.len() < re_offset + RE_HDR_LEN {
        inner.stats.data_err_cnt.fetch_add(1, Relaxed);
        inner.stats.last_e2sar_error.store(ErrorKind::Parse);
        return;
    }
    let Some(re) = ReHdr::decode(&datagram[re_offset..]) else {
        inner.stats.data_err_cnt.fetch_add(1, Relaxed);
        inner.stats.last_e2sar_error.store(ErrorKind::Parse);
        return;
    };
    let payload = &datagram[re_offset + RE_HDR_LEN..];

    let key = (re.event_num, re.data_id);
    let item = events_in_progress
        .entry(key)
        .or_insert_with(|| EventInProgress::new(re.buffer_length as usize));

    match item.insert_segment(re.buffer_offset, payload) {
        Err(()) => {
            inner.stats.data_err_cnt.fetch_add(1, Relaxed);
            inner.stats.last_e2sar_error.store(ErrorKind::Parse);
            // don't let a record created by a bad first segment linger
            if events_in_progress.get(&key).is_some_and(|it| it.num_fragments == 0) {
                events_in_progress.remove(&key);
            }
        }
        Ok(false) => {}
        Ok(true) => {
            let item = events_in_progress.remove(&key).unwrap();
            inner.stats.event_success.fetch_add(1, Relaxed);
            let num_fragments = item.num_fragments;
            let ev = ReassembledEvent {
                event: item.buf,
                event_num: key.0,
                data_id: key.1,
            };
            if let Err(TrySendError::Full(_)) = inner.event_tx.try_send(ev) {
                inner.log_lost_event(lost_seen, key, num_fragments, true);
            }
        }
    }
}

/// One PID step over the oldest and current samples.
/// Returns (control, error, integral).
fn pid(
    set_point: f32,
    process_value: f32,
    delta_t: f32,
    kp: f32,
    ki: f32,
    kd: f32,
    oldest_error: f32,
    oldest_integral: f32,
) -> (f32, f32, f32) {
    let error = set_point - process_value;
    let integral = oldest_integral + error * delta_t;
    let derivative = (error - oldest_error) / delta_t;
    (kp * error + ki * integral + kd * derivative, error, integral)
}

struct PidSample {
    /// usec since epoch
    time: u64,
    error: f32,
    integral: f32,
}

fn sendstate_thread_body(inner: Arc<ReassemblerInner>, lbman: Arc<Mutex<LbManager>>) {
    tracing::debug!("sendstate thread started");
    let period = Duration::from_millis(inner.flags.period_ms as u64);
    let depth = (inner.flags.epoch_ms / inner.flags.period_ms as u32).max(1) as usize;
    let mut samples: VecDeque<PidSample> = VecDeque::with_capacity(depth + 1);

    // prime the window so the first tick has an oldest sample to difference
    samples.push_back(PidSample { time: unix_time_micros(), error: 0.0, integral: 0.0 });
    sleep_with_stop(&inner, period);

    // The CP schedules per epoch but worker clocks are not synchronized with
    // it, so the PID is evaluated every period over a sliding epoch-long
    // window and reported each time.
    while !inner.stop.load(Relaxed) {
        let tick = Instant::now();
        let now = unix_time_micros();
        let oldest = samples.front().unwrap();
        let delta_t = ((now - oldest.time) as f32 / 1_000_000.0).max(1e-6);
        let fill_percent = inner.event_rx.len() as f32 / QSIZE as f32;

        let (control, error, integral) = pid(
            inner.flags.set_point,
            fill_percent,
            delta_t,
            inner.flags.kp,
            inner.flags.ki,
            inner.flags.kd,
            oldest.error,
            oldest.integral,
        );

        samples.push_back(PidSample { time: now, error, integral });
        if samples.len() > depth {
            samples.pop_front();
        }

        if let Err(e) = lbman.lock().unwrap().send_state(fill_percent, control, true) {
            inner.stats.grpc_err_cnt.fetch_add(1, Relaxed);
            inner.stats.last_e2sar_error.store(e.kind());
        }

        while tick.elapsed() < period && !inner.stop.load(Relaxed) {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    tracing::debug!("sendstate thread exiting");
}

fn sleep_with_stop(inner: &ReassemblerInner, period: Duration) {
    let start = Instant::now();
    while start.elapsed() < period && !inner.stop.load(Relaxed) {
        std::thread::sleep(Duration::from_millis(5));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::uri::TokenType;

    fn test_uri() -> EjfatUri {
        EjfatUri::parse("ejfat://127.0.0.1:18020/lb/1?data=127.0.0.1", TokenType::Admin, false)
            .unwrap()
    }

    fn no_cp_flags() -> ReassemblerFlags {
        ReassemblerFlags { use_cp: false, ..Default::default() }
    }

    #[test]
    fn test_port_range_from_thread_count() {
        // 7 threads -> range 3 -> 8 ports starting at 19522
        let r = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            19522,
            RecvThreads::Count(7),
            no_cp_flags(),
        )
        .unwrap();
        assert_eq!(r.port_range(), 3);
        assert_eq!(r.recv_ports(), (19522, 19529));
    }

    #[test]
    fn test_port_range_override() {
        // 4 threads with an explicit range of 10 -> 1024 ports
        let r = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            19522,
            RecvThreads::Count(4),
            ReassemblerFlags { port_range: 10, ..no_cp_flags() },
        )
        .unwrap();
        assert_eq!(r.port_range(), 10);
        assert_eq!(r.recv_ports(), (19522, 20545));
    }

    #[test]
    fn test_single_thread_single_port() {
        let r = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            19522,
            RecvThreads::Count(1),
            no_cp_flags(),
        )
        .unwrap();
        assert_eq!(r.port_range(), 0);
        assert_eq!(r.recv_ports(), (19522, 19522));
    }

    #[test]
    fn test_ports_dealt_round_robin() {
        let r = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            19522,
            RecvThreads::Count(3),
            ReassemblerFlags { port_range: 2, ..no_cp_flags() },
        )
        .unwrap();
        // 4 ports over 3 threads: first thread owns two
        let ports = &r.inner.threads_to_ports;
        assert_eq!(ports[0], vec![19522, 19525]);
        assert_eq!(ports[1], vec![19523]);
        assert_eq!(ports[2], vec![19524]);
    }

    #[test]
    fn test_privileged_port_rejected() {
        let e = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            80,
            RecvThreads::Count(1),
            no_cp_flags(),
        )
        .unwrap_err();
        assert!(matches!(e, E2sarError::Parameter(_)));
    }

    #[test]
    fn test_oversized_timeout_rejected() {
        let e = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            19522,
            RecvThreads::Count(1),
            ReassemblerFlags { event_timeout_ms: 10_000, ..no_cp_flags() },
        )
        .unwrap_err();
        assert!(matches!(e, E2sarError::Parameter(_)));
    }

    #[test]
    fn test_deregister_without_register() {
        let mut r = Reassembler::new(
            test_uri(),
            Some("127.0.0.1".parse().unwrap()),
            19522,
            RecvThreads::Count(1),
            ReassemblerFlags {
                // CP configured but never registered
                ..Default::default()
            },
        )
        .unwrap();
        let e = r.deregister_worker().unwrap_err();
        assert!(matches!(e, E2sarError::Logic(_)));
    }

    #[test]
    fn test_assembly_in_order() {
        let mut item = EventInProgress::new(9);
        assert_eq!(item.insert_segment(0, b"abc"), Ok(false));
        assert_eq!(item.insert_segment(3, b"def"), Ok(false));
        assert_eq!(item.insert_segment(6, b"ghi"), Ok(true));
        assert_eq!(item.buf, b"abcdefghi");
        assert_eq!(item.num_fragments, 3);
    }

    #[test]
    fn test_assembly_out_of_order() {
        let mut item = EventInProgress::new(9);
        assert_eq!(item.insert_segment(6, b"ghi"), Ok(false));
        assert_eq!(item.insert_segment(3, b"def"), Ok(false));
        assert!(item.cur_end == 0);
        assert_eq!(item.insert_segment(0, b"abc"), Ok(true));
        assert_eq!(item.buf, b"abcdefghi");
    }

    #[test]
    fn test_assembly_duplicate_segments() {
        let mut item = EventInProgress::new(6);
        assert_eq!(item.insert_segment(3, b"def"), Ok(false));
        assert_eq!(item.insert_segment(3, b"def"), Ok(false));
        assert_eq!(item.insert_segment(0, b"abc"), Ok(true));
        assert_eq!(item.buf, b"abcdef");
    }

    #[test]
    fn test_assembly_rejects_overrun() {
        let mut item = EventInProgress::new(4);
        assert_eq!(item.insert_segment(2, b"abc"), Err(()));
        assert_eq!(item.insert_segment(0, b"abcd"), Ok(true));
    }

    #[test]
    fn test_zero_length_event_completes_immediately() {
        let mut item = EventInProgress::new(0);
        assert_eq!(item.insert_segment(0, b""), Ok(true));
    }

    #[test]
    fn test_pid_proportional_only() {
        let (control, error, integral) = pid(0.5, 0.25, 1.0, 2.0, 0.0, 0.0, 0.0, 0.0);
        assert!((error - 0.25).abs() < f32::EPSILON);
        assert!((control - 0.5).abs() < f32::EPSILON);
        assert!((integral - 0.25).abs() < f32::EPSILON);
    }

    #[test]
    fn test_pid_integral_accumulates() {
        // two steps with constant error 0.1 over 1s windows
        let (_, e1, i1) = pid(0.1, 0.0, 1.0, 0.0, 1.0, 0.0, 0.0, 0.0);
        let (c2, _, i2) = pid(0.1, 0.0, 1.0, 0.0, 1.0, 0.0, e1, i1);
        assert!((i1 - 0.1).abs() < 1e-6);
        assert!((i2 - 0.2).abs() < 1e-6);
        assert!((c2 - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_pid_derivative() {
        let (control, _, _) = pid(1.0, 0.0, 2.0, 0.0, 0.0, 1.0, 0.5, 0.0);
        // derivative = (1.0 - 0.5) / 2.0
        assert!((control - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_flags_from_file() {
        let path = std::env::temp_dir().join("e2sar_reas_flags.ini");
        std::fs::write(
            &path,
            "[data-plane]\nportRange = 5\neventTimeoutMS = 250\n\n[pid]\nKp = 1.5\nweight = 2.0\n",
        )
        .unwrap();
        let f = ReassemblerFlags::from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(f.port_range, 5);
        assert_eq!(f.event_timeout_ms, 250);
        assert_eq!(f.kp, 1.5);
        assert_eq!(f.weight, 2.0);
        assert_eq!(f.period_ms, 100);
        std::fs::remove_file(&path).ok();
    }
}
