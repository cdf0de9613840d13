//! Event segmentation and transmission toward the load balancer.
//!
//! The Segmenter fragments application events into UDP datagrams carrying
//! concatenated LB+RE headers, spreads them over several source ports to
//! randomize LAG hashing on the LB side, paces the send rate and emits
//! periodic Sync datagrams to the LB's sync endpoint.
//!
//! ## Thread layout
//! * 1 sync thread (when the control plane is in use)
//! * 1 dispatch thread draining the bounded send queue
//! * one send worker per socket, fed round-robin by the dispatch thread
//! * 1 CQE reaper thread when the io_uring transport is selected
//!
//! ## Transports
//! Exactly one of plain `sendmsg`, batched `sendmmsg` or io_uring SendMsg
//! (SQPOLL + fixed files) is active process-wide, chosen with
//! [`select_send_mode`] before the first Segmenter is built. Missing kernel
//! support surfaces as a startup error, never a silent fallback.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering::Relaxed};
use std::sync::{Arc, OnceLock};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use socket2::{Domain, Protocol, Socket, Type};

use crate::affinity;
use crate::config::FlagFile;
use crate::error::{AtomicErrorKind, E2sarError, ErrorKind, Result};
use crate::headers::{encode_lbre, LbHdr, ReHdr, SyncHdr, LBRE_HDR_LEN, SYNC_HDR_LEN,
    total_header_length};
use crate::net_util::{busy_wait_micros, clock_entropy_test, interface_and_mtu, unix_time_micros,
    unix_time_nanos};
use crate::uri::EjfatUri;

/// Depth of the internal queue holding events to be sent.
const QSIZE: usize = 2047;

/// Below this many bits of low-byte clock entropy the LB tick gets a PRNG
/// supplement.
const MIN_CLOCK_ENTROPY: f32 = 6.0;

/// The process-wide send transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
    /// One `sendmsg` syscall per segment.
    SendMsg,
    /// One `sendmmsg` syscall per event, covering all its segments.
    SendMmsg,
    /// io_uring SendMsg submissions with a SQPOLL kernel thread and a CQE
    /// reaper thread completing callbacks.
    IoUringSend,
}

static SELECTED_SEND_MODE: OnceLock<SendMode> = OnceLock::new();

/// Select the send transport for this process. May be called once; a second
/// call with a different mode is a logic error. Unselected defaults to
/// [`SendMode::SendMsg`].
pub fn select_send_mode(mode: SendMode) -> Result<()> {
    #[cfg(not(target_os = "linux"))]
    if mode != SendMode::SendMsg {
        return Err(E2sarError::Socket(format!(
            "{:?} transport requires Linux kernel support",
            mode
        )));
    }
    let set = *SELECTED_SEND_MODE.get_or_init(|| mode);
    if set != mode {
        return Err(E2sarError::Logic(format!(
            "send transport already selected as {:?}",
            set
        )));
    }
    Ok(())
}

/// The transport in effect for this process.
pub fn selected_send_mode() -> SendMode {
    *SELECTED_SEND_MODE.get_or_init(|| SendMode::SendMsg)
}

/// Completion callback invoked exactly once per event after its last segment
/// was sent (or submitted, for io_uring — the callback then runs on the CQE
/// reaper thread).
pub type EventCallback = Box<dyn FnOnce() + Send + 'static>;

/// Knobs governing Segmenter behavior; `..Default::default()` fills the rest.
#[derive(Debug, Clone)]
pub struct SegmenterFlags {
    /// Prefer the IPv6 data address when the URI carries both.
    pub dp_v6: bool,
    /// Use connect() + send() rather than sendto() semantics.
    pub connected_socket: bool,
    /// Emit sync packets (and allow CP interactions).
    pub use_cp: bool,
    /// Sync-only warm-up before data sockets open.
    pub warm_up_ms: u16,
    /// Sync cadence.
    pub sync_period_ms: u16,
    /// Depth of the rate-history ring.
    pub sync_periods: u16,
    /// Outgoing MTU; 0 = autodetect from the routing table.
    pub mtu: u16,
    /// Parallel source ports feeding the LAG.
    pub num_send_sockets: usize,
    /// SO_SNDBUF size.
    pub snd_socket_buf_size: usize,
    /// Send shaping in Gbps; <= 0 means unlimited.
    pub rate_gbps: f32,
    /// Target consecutive destination ports (back-to-back testing only).
    pub multi_port: bool,
    /// Per-frame pacing instead of per-event; only valid with `use_cp` and a
    /// positive rate, and only sensible at a few Gbps.
    pub smooth: bool,
    /// LB tick source: microsecond clock (true) or the sequential event
    /// number (false).
    pub usec_as_event_num: bool,
}

impl Default for SegmenterFlags {
    fn default() -> Self {
        SegmenterFlags {
            dp_v6: false,
            connected_socket: true,
            use_cp: true,
            warm_up_ms: 1000,
            sync_period_ms: 1000,
            sync_periods: 2,
            mtu: 1500,
            num_send_sockets: 4,
            snd_socket_buf_size: 1024 * 1024 * 3,
            rate_gbps: -1.0,
            multi_port: false,
            smooth: false,
            usec_as_event_num: true,
        }
    }
}

impl SegmenterFlags {
    /// Load flags from an INI-style file; absent keys keep defaults.
    pub fn from_file(path: &str) -> Result<SegmenterFlags> {
        let f = FlagFile::load(path)?;
        let mut flags = SegmenterFlags::default();
        if let Some(v) = f.general.use_cp {
            flags.use_cp = v;
        }
        if let Some(v) = f.control_plane.warm_up_ms {
            flags.warm_up_ms = v;
        }
        if let Some(v) = f.control_plane.sync_period_ms {
            flags.sync_period_ms = v;
        }
        if let Some(v) = f.control_plane.sync_periods {
            flags.sync_periods = v;
        }
        if let Some(v) = f.data_plane.dp_v6 {
            flags.dp_v6 = v;
        }
        if let Some(v) = f.data_plane.connected_socket {
            flags.connected_socket = v;
        }
        if let Some(v) = f.data_plane.mtu {
            flags.mtu = v;
        }
        if let Some(v) = f.data_plane.num_send_sockets {
            flags.num_send_sockets = v;
        }
        if let Some(v) = f.data_plane.snd_socket_buf_size {
            flags.snd_socket_buf_size = v;
        }
        if let Some(v) = f.data_plane.rate_gbps {
            flags.rate_gbps = v;
        }
        if let Some(v) = f.data_plane.smooth {
            flags.smooth = v;
        }
        if let Some(v) = f.data_plane.multi_port {
            flags.multi_port = v;
        }
        if let Some(v) = f.data_plane.usec_as_event_num {
            flags.usec_as_event_num = v;
        }
        Ok(flags)
    }
}

/// Atomic counters for one direction (sync or data).
#[derive(Debug, Default)]
struct AtomicStats {
    msg_cnt: AtomicU64,
    err_cnt: AtomicU64,
    last_errno: AtomicI32,
    last_e2sar_error: AtomicErrorKind,
}

impl AtomicStats {
    fn record_os_error(&self) {
        self.err_cnt.fetch_add(1, Relaxed);
        self.last_errno
            .store(std::io::Error::last_os_error().raw_os_error().unwrap_or(0), Relaxed);
        self.last_e2sar_error.store(ErrorKind::Socket);
    }

    fn snapshot(&self) -> ReportedStats {
        ReportedStats {
            msg_cnt: self.msg_cnt.load(Relaxed),
            err_cnt: self.err_cnt.load(Relaxed),
            last_errno: self.last_errno.load(Relaxed),
            last_e2sar_error: self.last_e2sar_error.load(),
        }
    }
}

/// Point-in-time statistics snapshot for one direction.
#[derive(Debug, Clone, Copy)]
pub struct ReportedStats {
    /// Datagrams sent (fragments for the data direction).
    pub msg_cnt: u64,
    pub err_cnt: u64,
    pub last_errno: i32,
    pub last_e2sar_error: ErrorKind,
}

struct EventQueueItem {
    event: Arc<Vec<u8>>,
    event_num: u64,
    data_id: u16,
    entropy: u16,
    callback: Option<EventCallback>,
}

/// One bound-and-connected data socket plus its destination, kept as a raw
/// sockaddr so unconnected sendmsg/mmsg paths have a stable msg_name.
struct SendSocket {
    sock: Socket,
    dest: libc::sockaddr_storage,
    dest_len: libc::socklen_t,
}

// the sockaddr_storage is plain bytes; sending on a socket from several
// threads is allowed
unsafe impl Send for SendSocket {}
unsafe impl Sync for SendSocket {}

struct SegmenterInner {
    uri: EjfatUri,
    data_id: u16,
    event_src_id: u32,
    flags: SegmenterFlags,
    send_mode: SendMode,
    mtu: usize,
    max_pld_len: usize,
    iface: String,
    add_entropy: bool,
    use_v6: bool,

    stop: AtomicBool,
    user_event_num: AtomicU64,
    round_robin: AtomicUsize,

    // sync rate accounting, shared with the sync thread
    events_in_current_sync: AtomicU64,
    current_sync_start_nano: AtomicU64,

    sync_stats: AtomicStats,
    send_stats: AtomicStats,

    sockets: OnceLock<Vec<SendSocket>>,

    #[cfg(target_os = "linux")]
    urings: OnceLock<Vec<std::sync::Mutex<io_uring::IoUring>>>,
    #[cfg(target_os = "linux")]
    outstanding_sends: AtomicU64,
}

thread_local! {
    static THREAD_RNG: std::cell::RefCell<SmallRng> =
        std::cell::RefCell::new(SmallRng::from_entropy());
}

fn random_u16() -> u16 {
    THREAD_RNG.with(|r| r.borrow_mut().gen())
}

fn random_u8() -> u8 {
    THREAD_RNG.with(|r| r.borrow_mut().gen())
}

fn random_ephemeral_port() -> u16 {
    THREAD_RNG.with(|r| r.borrow_mut().gen_range(10000..=u16::MAX))
}

/// Number of datagrams an event of `bytes` occupies at a given payload size.
fn segment_count(bytes: usize, max_pld_len: usize) -> usize {
    bytes.div_ceil(max_pld_len)
}

impl SegmenterInner {
    /// The 64-bit tick placed in the LB header for one event.
    fn lb_tick(&self, event_num: u64) -> u64 {
        if !self.flags.usec_as_event_num {
            return event_num;
        }
        let now = unix_time_micros();
        if self.add_entropy {
            (now & !0xff) | random_u8() as u64
        } else {
            now
        }
    }

    fn sockets(&self) -> &[SendSocket] {
        self.sockets.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Fragment one event and hand every segment to the active transport.
    /// `inter_frame_usec` > 0 enables per-frame pacing (smooth mode).
    fn send_event_segments(
        &self,
        rri: usize,
        mut item: EventQueueItem,
        inter_frame_usec: u64,
    ) -> Result<()> {
        let entropy = if item.entropy == 0 { random_u16() } else { item.entropy };
        let lb_event_num = self.lb_tick(item.event_num);
        let mut callback = item.callback.take();

        let result = match self.send_mode {
            SendMode::SendMsg => self.send_with_sendmsg(
                rri,
                &item,
                entropy,
                lb_event_num,
                inter_frame_usec,
            ),
            SendMode::SendMmsg => self.send_with_sendmmsg(rri, &item, entropy, lb_event_num),
            SendMode::IoUringSend => {
                #[cfg(target_os = "linux")]
                {
                    self.send_with_uring(rri, &item, entropy, lb_event_num, &mut callback)
                }
                #[cfg(not(target_os = "linux"))]
                {
                    Err(E2sarError::Socket("io_uring requires Linux".to_string()))
                }
            }
        };

        self.events_in_current_sync.fetch_add(1, Relaxed);

        // io_uring hands the callback to the CQE reaper with the last SQE and
        // leaves None here; everything else completes on the sending thread
        if let Some(cb) = callback {
            cb();
        }
        result
    }

    fn send_with_sendmsg(
        &self,
        rri: usize,
        item: &EventQueueItem,
        entropy: u16,
        lb_event_num: u64,
        inter_frame_usec: u64,
    ) -> Result<()> {
        use std::os::fd::AsRawFd;
        let sock = &self.sockets()[rri];
        let fd = sock.sock.as_raw_fd();
        let event = item.event.as_slice();
        let bytes = event.len();
        let mut offset = 0usize;

        while offset < bytes {
            let frame_start = if inter_frame_usec > 0 { Some(Instant::now()) } else { None };
            let seg_len = (bytes - offset).min(self.max_pld_len);
            let mut hdr = encode_lbre(
                &LbHdr::new(entropy, lb_event_num),
                &ReHdr::new(item.data_id, offset as u32, bytes as u32, item.event_num),
            );
            let mut iov = [
                libc::iovec {
                    iov_base: hdr.as_mut_ptr() as *mut libc::c_void,
                    iov_len: LBRE_HDR_LEN,
                },
                libc::iovec {
                    iov_base: event[offset..].as_ptr() as *mut libc::c_void,
                    iov_len: seg_len,
                },
            ];
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = 2;
            if !self.flags.connected_socket {
                msg.msg_name = &sock.dest as *const _ as *mut libc::c_void;
                msg.msg_namelen = sock.dest_len;
            }

            self.send_stats.msg_cnt.fetch_add(1, Relaxed);
            let rc = unsafe { libc::sendmsg(fd, &msg, 0) };
            if rc == -1 {
                self.send_stats.record_os_error();
                return Err(E2sarError::last_os_socket_error("sendmsg"));
            }

            offset += seg_len;
            if let Some(start) = frame_start {
                busy_wait_micros(start, inter_frame_usec);
            }
        }
        Ok(())
    }

    #[cfg(target_os = "linux")]
    fn send_with_sendmmsg(
        &self,
        rri: usize,
        item: &EventQueueItem,
        entropy: u16,
        lb_event_num: u64,
    ) -> Result<()> {
        use std::os::fd::AsRawFd;
        let sock = &self.sockets()[rri];
        let fd = sock.sock.as_raw_fd();
        let event = item.event.as_slice();
        let bytes = event.len();
        let n = segment_count(bytes, self.max_pld_len);
        if n == 0 {
            return Ok(());
        }

        // all headers first so their addresses stay stable for the iovecs
        let mut hdrs: Vec<[u8; LBRE_HDR_LEN]> = Vec::with_capacity(n);
        let mut offsets = Vec::with_capacity(n);
        let mut offset = 0usize;
        while offset < bytes {
            hdrs.push(encode_lbre(
                &LbHdr::new(entropy, lb_event_num),
                &ReHdr::new(item.data_id, offset as u32, bytes as u32, item.event_num),
            ));
            offsets.push(offset);
            offset += (bytes - offset).min(self.max_pld_len);
        }

        let mut iovs: Vec<[libc::iovec; 2]> = Vec::with_capacity(n);
        for (hdr, &off) in hdrs.iter_mut().zip(&offsets) {
            let seg_len = (bytes - off).min(self.max_pld_len);
            iovs.push([
                libc::iovec {
                    iov_base: hdr.as_mut_ptr() as *mut libc::c_void,
                    iov_len: LBRE_HDR_LEN,
                },
                libc::iovec {
                    iov_base: event[off..].as_ptr() as *mut libc::c_void,
                    iov_len: seg_len,
                },
            ]);
        }

        let mut mmsgs: Vec<libc::mmsghdr> = Vec::with_capacity(n);
        for iov in iovs.iter_mut() {
            let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
            msg.msg_iov = iov.as_mut_ptr();
            msg.msg_iovlen = 2;
            if !self.flags.connected_socket {
                msg.msg_name = &sock.dest as *const _ as *mut libc::c_void;
                msg.msg_namelen = sock.dest_len;
            }
            mmsgs.push(libc::mmsghdr { msg_hdr: msg, msg_len: 0 });
        }

        self.send_stats.msg_cnt.fetch_add(n as u64, Relaxed);
        let sent = unsafe {
            libc::sendmmsg(fd, mmsgs.as_mut_ptr(), n as libc::c_uint, 0)
        };
        if sent < 0 {
            self.send_stats.record_os_error();
            return Err(E2sarError::last_os_socket_error("sendmmsg"));
        }
        if (sent as usize) < n {
            self.send_stats.err_cnt.fetch_add((n - sent as usize) as u64, Relaxed);
            self.send_stats.last_e2sar_error.store(ErrorKind::Socket);
            return Err(E2sarError::Socket(format!(
                "sendmmsg sent {} of {} datagrams",
                sent, n
            )));
        }
        Ok(())
    }

    #[cfg(not(target_os = "linux"))]
    fn send_with_sendmmsg(
        &self,
        _rri: usize,
        _item: &EventQueueItem,
        _entropy: u16,
        _lb_event_num: u64,
    ) -> Result<()> {
        Err(E2sarError::Socket("sendmmsg requires Linux".to_string()))
    }

    #[cfg(target_os = "linux")]
    fn send_with_uring(
        &self,
        rri: usize,
        item: &EventQueueItem,
        entropy: u16,
        lb_event_num: u64,
        callback: &mut Option<EventCallback>,
    ) -> Result<()> {
        use io_uring::{opcode, types};

        let event = item.event.as_slice();
        let bytes = event.len();
        if bytes == 0 {
            return Ok(());
        }
        let rings = self
            .urings
            .get()
            .ok_or_else(|| E2sarError::Logic("io_uring rings not initialized".to_string()))?;
        let mut ring = rings[rri].lock().unwrap();
        let sock = &self.sockets()[rri];

        let mut offset = 0usize;
        while offset < bytes {
            let seg_len = (bytes - offset).min(self.max_pld_len);
            let last = offset + seg_len >= bytes;

            let mut user = Box::new(SqeUserData {
                hdr: encode_lbre(
                    &LbHdr::new(entropy, lb_event_num),
                    &ReHdr::new(item.data_id, offset as u32, bytes as u32, item.event_num),
                ),
                iov: [libc::iovec { iov_base: std::ptr::null_mut(), iov_len: 0 }; 2],
                msg: unsafe { std::mem::zeroed() },
                _event: item.event.clone(),
                // the last segment carries the event callback to the reaper
                callback: if last { callback.take() } else { None },
            });
            user.iov[0] = libc::iovec {
                iov_base: user.hdr.as_ptr() as *mut libc::c_void,
                iov_len: LBRE_HDR_LEN,
            };
            user.iov[1] = libc::iovec {
                iov_base: event[offset..].as_ptr() as *mut libc::c_void,
                iov_len: seg_len,
            };
            user.msg.msg_iov = user.iov.as_ptr() as *mut libc::iovec;
            user.msg.msg_iovlen = 2;
            if !self.flags.connected_socket {
                user.msg.msg_name = &sock.dest as *const _ as *mut libc::c_void;
                user.msg.msg_namelen = sock.dest_len;
            }

            let msg_ptr: *const libc::msghdr = &user.msg;
            let sqe = opcode::SendMsg::new(types::Fixed(rri as u32), msg_ptr)
                .build()
                .user_data(Box::into_raw(user) as u64);

            self.send_stats.msg_cnt.fetch_add(1, Relaxed);
            self.outstanding_sends.fetch_add(1, Relaxed);
            // wait for a submission slot if the queue is full
            loop {
                let pushed = unsafe { ring.submission().push(&sqe) };
                if pushed.is_ok() {
                    break;
                }
                ring.submit().map_err(|e| {
                    self.send_stats.record_os_error();
                    E2sarError::Socket(format!("io_uring submit: {}", e))
                })?;
            }

            offset += seg_len;
        }
        ring.submit().map_err(|e| {
            self.send_stats.record_os_error();
            E2sarError::Socket(format!("io_uring submit: {}", e))
        })?;
        Ok(())
    }

    /// Drain available CQEs on all rings; invoked by the reaper thread.
    #[cfg(target_os = "linux")]
    fn reap_cqes(&self) -> usize {
        let Some(rings) = self.urings.get() else { return 0 };
        let mut drained = 0;
        for ring in rings {
            let mut guard = ring.lock().unwrap();
            while let Some(cqe) = guard.completion().next() {
                drained += 1;
                self.outstanding_sends.fetch_sub(1, Relaxed);
                // SAFETY: the user_data pointer was created by Box::into_raw
                // in send_with_uring and is completed exactly once
                let mut user = unsafe { Box::from_raw(cqe.user_data() as *mut SqeUserData) };
                if cqe.result() < 0 {
                    self.send_stats.err_cnt.fetch_add(1, Relaxed);
                    self.send_stats.last_errno.store(-cqe.result(), Relaxed);
                    self.send_stats.last_e2sar_error.store(ErrorKind::Socket);
                }
                if let Some(cb) = user.callback.take() {
                    cb();
                }
            }
        }
        drained
    }
}

#[cfg(target_os = "linux")]
struct SqeUserData {
    hdr: [u8; LBRE_HDR_LEN],
    iov: [libc::iovec; 2],
    msg: libc::msghdr,
    /// keeps the event buffer alive until the CQE lands
    _event: Arc<Vec<u8>>,
    callback: Option<EventCallback>,
}

#[cfg(target_os = "linux")]
unsafe impl Send for SqeUserData {}

pub struct Segmenter {
    inner: Arc<SegmenterInner>,
    queue_tx: Sender<EventQueueItem>,
    queue_rx: Receiver<EventQueueItem>,
    threads: Vec<JoinHandle<()>>,
    started: bool,
}

impl std::fmt::Debug for Segmenter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segmenter")
            .field("started", &self.started)
            .finish_non_exhaustive()
    }
}

impl Segmenter {
    /// Build a Segmenter. `data_id` labels events in the RE header,
    /// `event_src_id` identifies this sender in Sync packets. Pass CPU cores
    /// in `cpu_core_list` to pin the whole process. Call
    /// [`Segmenter::open_and_start`] to begin operation.
    pub fn new(
        uri: EjfatUri,
        data_id: u16,
        event_src_id: u32,
        cpu_core_list: &[usize],
        flags: SegmenterFlags,
    ) -> Result<Segmenter> {
        if flags.num_send_sockets == 0 || flags.num_send_sockets > 128 {
            return Err(E2sarError::Parameter(
                "number of send sockets must be in [1, 128]".to_string(),
            ));
        }
        if flags.sync_period_ms > 10000 {
            return Err(E2sarError::Parameter("sync period too long, limit 10s".to_string()));
        }
        if flags.mtu > 9000 {
            return Err(E2sarError::Parameter("MTU set too long, limit 9000".to_string()));
        }
        if flags.use_cp && !uri.has_sync_addr() {
            return Err(E2sarError::Parameter(
                "sync address not present in the URI".to_string(),
            ));
        }
        if !uri.has_data_addr() {
            return Err(E2sarError::Parameter(
                "data address is not present in the URI".to_string(),
            ));
        }
        if flags.smooth && (!flags.use_cp || flags.rate_gbps <= 0.0) {
            return Err(E2sarError::Logic(
                "smooth pacing requires the control plane and a positive rate".to_string(),
            ));
        }

        let use_v6 = flags.dp_v6;
        let data_addr: IpAddr = if use_v6 {
            IpAddr::V6(uri.data_addr_v6()?.0)
        } else {
            IpAddr::V4(uri.data_addr_v4()?.0)
        };

        // outgoing interface and MTU from the routing table where available
        let (iface, mtu) = match interface_and_mtu(data_addr) {
            Ok((iface, detected)) => {
                let mtu = if flags.mtu == 0 {
                    if detected == 0 {
                        return Err(E2sarError::Socket(
                            "outgoing interface MTU reported as 0, use a manual MTU override"
                                .to_string(),
                        ));
                    }
                    detected as usize
                } else if detected > 0 && flags.mtu as u32 > detected {
                    return Err(E2sarError::Socket(format!(
                        "MTU override {} exceeds outgoing interface MTU of {}",
                        flags.mtu, iface
                    )));
                } else {
                    flags.mtu as usize
                };
                (iface, mtu)
            }
            Err(_) if flags.mtu != 0 => (String::new(), flags.mtu as usize),
            Err(e) => return Err(e),
        };

        let hdr_len = total_header_length(use_v6);
        if mtu <= hdr_len {
            return Err(E2sarError::Socket(format!(
                "insufficient MTU length {} to accommodate {} bytes of headers",
                mtu, hdr_len
            )));
        }

        if !cpu_core_list.is_empty() {
            affinity::set_process(cpu_core_list)?;
        }

        // clock entropy self-test: decides whether LB ticks need PRNG bits
        let add_entropy = flags.usec_as_event_num
            && clock_entropy_test(1000, 1) < MIN_CLOCK_ENTROPY;
        if add_entropy {
            tracing::info!("low clock entropy detected, supplementing LB ticks with PRNG bits");
        }

        let (queue_tx, queue_rx) = bounded(QSIZE);

        Ok(Segmenter {
            inner: Arc::new(SegmenterInner {
                uri,
                data_id,
                event_src_id,
                send_mode: selected_send_mode(),
                mtu,
                max_pld_len: mtu - hdr_len,
                iface,
                add_entropy,
                use_v6,
                flags,
                stop: AtomicBool::new(false),
                user_event_num: AtomicU64::new(1),
                round_robin: AtomicUsize::new(0),
                events_in_current_sync: AtomicU64::new(0),
                current_sync_start_nano: AtomicU64::new(0),
                sync_stats: AtomicStats::default(),
                send_stats: AtomicStats::default(),
                sockets: OnceLock::new(),
                #[cfg(target_os = "linux")]
                urings: OnceLock::new(),
                #[cfg(target_os = "linux")]
                outstanding_sends: AtomicU64::new(0),
            }),
            queue_tx,
            queue_rx,
            threads: Vec::new(),
            started: false,
        })
    }

    /// Open sockets and start the threads. Sync emission begins first; data
    /// sockets open only after the warm-up period.
    pub fn open_and_start(&mut self) -> Result<()> {
        if self.started {
            return Err(E2sarError::Logic("segmenter already started".to_string()));
        }
        let inner = &self.inner;

        if inner.flags.use_cp {
            let sync_sock = open_sync_socket(inner)?;
            let sync_inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name("e2sar-sync".into())
                .spawn(move || sync_thread_body(sync_inner, sync_sock))
                .map_err(|e| E2sarError::System(format!("unable to spawn sync thread: {}", e)))?;
            self.threads.push(handle);
            std::thread::sleep(Duration::from_millis(inner.flags.warm_up_ms as u64));
        }

        let sockets = open_data_sockets(inner)?;
        #[cfg(target_os = "linux")]
        if inner.send_mode == SendMode::IoUringSend {
            let rings = setup_urings(&sockets)?;
            let _ = inner.urings.set(rings);
        }
        let _ = inner.sockets.set(sockets);

        // per-socket workers fed round-robin by the dispatch thread
        let mut worker_txs = Vec::with_capacity(inner.flags.num_send_sockets);
        for i in 0..inner.flags.num_send_sockets {
            let (tx, rx) = unbounded::<EventQueueItem>();
            worker_txs.push(tx);
            let worker_inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name(format!("e2sar-send-{}", i))
                .spawn(move || send_worker_body(worker_inner, i, rx))
                .map_err(|e| E2sarError::System(format!("unable to spawn send worker: {}", e)))?;
            self.threads.push(handle);
        }

        let dispatch_inner = inner.clone();
        let dispatch_rx = self.queue_rx.clone();
        let handle = std::thread::Builder::new()
            .name("e2sar-dispatch".into())
            .spawn(move || dispatch_thread_body(dispatch_inner, dispatch_rx, worker_txs))
            .map_err(|e| E2sarError::System(format!("unable to spawn dispatch thread: {}", e)))?;
        self.threads.push(handle);

        #[cfg(target_os = "linux")]
        if inner.send_mode == SendMode::IoUringSend {
            let reaper_inner = inner.clone();
            let handle = std::thread::Builder::new()
                .name("e2sar-cqe".into())
                .spawn(move || cqe_reaper_body(reaper_inner))
                .map_err(|e| E2sarError::System(format!("unable to spawn CQE reaper: {}", e)))?;
            self.threads.push(handle);
        }

        self.started = true;
        tracing::info!(
            mtu = inner.mtu,
            max_payload = inner.max_pld_len,
            sockets = inner.flags.num_send_sockets,
            mode = ?inner.send_mode,
            "segmenter started"
        );
        Ok(())
    }

    /// Queue an event for sending. `event_num`/`data_id`/`entropy` of `None`
    /// mean: next sequential number, the constructor dataId, and a fresh
    /// random entropy respectively. The callback (if any) fires exactly once
    /// after the event's last segment is sent.
    pub fn add_to_send_queue(
        &self,
        event: Vec<u8>,
        event_num: Option<u64>,
        data_id: Option<u16>,
        entropy: Option<u16>,
        callback: Option<EventCallback>,
    ) -> Result<()> {
        let item = self.make_item(event, event_num, data_id, entropy, callback)?;
        match self.queue_tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(E2sarError::Memory(
                "send queue is temporarily full, try again later".to_string(),
            )),
            Err(TrySendError::Disconnected(_)) => {
                Err(E2sarError::Logic("segmenter is shut down".to_string()))
            }
        }
    }

    /// Send an event synchronously on the caller's thread, bypassing the
    /// queue (no pacing is applied).
    pub fn send_event(
        &self,
        event: Vec<u8>,
        event_num: Option<u64>,
        data_id: Option<u16>,
        entropy: Option<u16>,
    ) -> Result<()> {
        if !self.started {
            return Err(E2sarError::Logic("segmenter not started".to_string()));
        }
        let item = self.make_item(event, event_num, data_id, entropy, None)?;
        let rri =
            self.inner.round_robin.fetch_add(1, Relaxed) % self.inner.flags.num_send_sockets;
        self.inner.send_event_segments(rri, item, 0)
    }

    fn make_item(
        &self,
        event: Vec<u8>,
        event_num: Option<u64>,
        data_id: Option<u16>,
        entropy: Option<u16>,
        callback: Option<EventCallback>,
    ) -> Result<EventQueueItem> {
        if event.len() > u32::MAX as usize {
            return Err(E2sarError::Parameter(
                "event longer than 4 GiB cannot be carried in an RE header".to_string(),
            ));
        }
        if let Some(n) = event_num {
            if n != 0 {
                self.inner.user_event_num.store(n, Relaxed);
            }
        }
        let event_num = self.inner.user_event_num.fetch_add(1, Relaxed);
        Ok(EventQueueItem {
            event: Arc::new(event),
            event_num,
            data_id: data_id.filter(|&d| d != 0).unwrap_or(self.inner.data_id),
            entropy: entropy.unwrap_or(0),
            callback,
        })
    }

    pub fn sync_stats(&self) -> ReportedStats {
        self.inner.sync_stats.snapshot()
    }

    pub fn send_stats(&self) -> ReportedStats {
        self.inner.send_stats.snapshot()
    }

    /// Outgoing interface name, when the routing query found one.
    pub fn interface(&self) -> &str {
        &self.inner.iface
    }

    pub fn mtu(&self) -> usize {
        self.inner.mtu
    }

    pub fn max_pld_len(&self) -> usize {
        self.inner.max_pld_len
    }

    /// Signal all threads to stop, drain in-flight work and close sockets.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.inner.stop.store(true, Relaxed);
        for t in self.threads.drain(..) {
            let _ = t.join();
        }
        // let the kernel drain socket buffers before closing
        if let Some(sockets) = self.inner.sockets.get() {
            for s in sockets {
                wait_send_buffer_drained(&s.sock);
            }
        }
        self.started = false;
    }
}

impl Drop for Segmenter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn open_sync_socket(inner: &SegmenterInner) -> Result<Socket> {
    let (addr, port) = inner.uri.sync_addr()?;
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
        inner.sync_stats.record_os_error();
        E2sarError::Socket(format!("unable to open sync socket: {}", e))
    })?;
    if inner.flags.connected_socket {
        let dest: SocketAddr = SocketAddr::new(addr, port);
        sock.connect(&dest.into()).map_err(|e| {
            inner.sync_stats.record_os_error();
            E2sarError::Socket(format!("unable to connect sync socket: {}", e))
        })?;
    }
    Ok(sock)
}

fn open_data_sockets(inner: &SegmenterInner) -> Result<Vec<SendSocket>> {
    let (dest_ip, dest_port): (IpAddr, u16) = if inner.use_v6 {
        let (a, p) = inner.uri.data_addr_v6()?;
        (IpAddr::V6(a), p)
    } else {
        let (a, p) = inner.uri.data_addr_v4()?;
        (IpAddr::V4(a), p)
    };
    let domain = if inner.use_v6 { Domain::IPV6 } else { Domain::IPV4 };
    let bind_ip: IpAddr = if inner.use_v6 {
        IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED)
    } else {
        IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED)
    };

    let mut out = Vec::with_capacity(inner.flags.num_send_sockets);
    for i in 0..inner.flags.num_send_sockets {
        let sock = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP)).map_err(|e| {
            inner.send_stats.record_os_error();
            E2sarError::Socket(format!("unable to open socket: {}", e))
        })?;

        // bind to a fresh random ephemeral source port to spread the LAG
        // hashing on the LB side
        let mut bound = false;
        for _ in 0..5 {
            let port = random_ephemeral_port();
            let local: SocketAddr = SocketAddr::new(bind_ip, port);
            if sock.bind(&local.into()).is_ok() {
                bound = true;
                break;
            }
        }
        if !bound {
            inner.send_stats.record_os_error();
            return Err(E2sarError::Socket(
                "unable to bind send socket to a random port".to_string(),
            ));
        }

        sock.set_send_buffer_size(inner.flags.snd_socket_buf_size)
            .map_err(|e| {
                inner.send_stats.record_os_error();
                E2sarError::Socket(format!("unable to set SO_SNDBUF: {}", e))
            })?;

        // consecutive destination ports in multi-port testing mode
        let port = if inner.flags.multi_port { dest_port + i as u16 } else { dest_port };
        let dest: SocketAddr = SocketAddr::new(dest_ip, port);
        let dest_sa: socket2::SockAddr = dest.into();
        if inner.flags.connected_socket {
            sock.connect(&dest_sa).map_err(|e| {
                inner.send_stats.record_os_error();
                E2sarError::Socket(format!("unable to connect: {}", e))
            })?;
        }

        let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
        unsafe {
            std::ptr::copy_nonoverlapping(
                dest_sa.as_ptr() as *const u8,
                &mut storage as *mut _ as *mut u8,
                dest_sa.len() as usize,
            );
        }
        out.push(SendSocket { sock, dest: storage, dest_len: dest_sa.len() });
    }
    Ok(out)
}

#[cfg(target_os = "linux")]
fn setup_urings(sockets: &[SendSocket]) -> Result<Vec<std::sync::Mutex<io_uring::IoUring>>> {
    use std::os::fd::AsRawFd;
    const URING_SIZE: u32 = 1024;
    // SQPOLL kernel thread idle time before it sleeps
    const SQPOLL_IDLE_MS: u32 = 2000;

    let fds: Vec<i32> = sockets.iter().map(|s| s.sock.as_raw_fd()).collect();
    let mut rings = Vec::with_capacity(sockets.len());
    for _ in sockets {
        let ring = io_uring::IoUring::builder()
            .setup_sqpoll(SQPOLL_IDLE_MS)
            .build(URING_SIZE)
            .map_err(|e| {
                E2sarError::Socket(format!(
                    "kernel does not support the requested io_uring setup: {}",
                    e
                ))
            })?;
        ring.submitter().register_files(&fds).map_err(|e| {
            E2sarError::Socket(format!("unable to register files with io_uring: {}", e))
        })?;
        rings.push(std::sync::Mutex::new(ring));
    }
    Ok(rings)
}

/// Wait until TIOCOUTQ reports the kernel send buffer empty, then let the
/// socket close. Avoids truncating the last frames on shutdown.
fn wait_send_buffer_drained(sock: &Socket) {
    #[cfg(target_os = "linux")]
    {
        use std::os::fd::AsRawFd;
        let fd = sock.as_raw_fd();
        loop {
            let mut outq: libc::c_int = 0;
            let rc = unsafe { libc::ioctl(fd, libc::TIOCOUTQ, &mut outq) };
            if rc != 0 || outq == 0 {
                break;
            }
            std::thread::sleep(Duration::from_micros(100));
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = sock;
}

/// Average event rate in Hz over the rate-history ring.
fn event_rate(ring: &std::collections::VecDeque<(u64, u64)>, now_nanos: u64) -> u32 {
    if ring.is_empty() {
        return 1;
    }
    let events: u64 = ring.iter().map(|(_, e)| e).sum();
    let oldest = ring.front().unwrap().0;
    let elapsed = now_nanos.saturating_sub(oldest);
    if elapsed == 0 {
        return 1;
    }
    ((events as f64 * 1_000_000_000.0) / elapsed as f64).round() as u32
}

fn sync_thread_body(inner: Arc<SegmenterInner>, sock: Socket) {
    tracing::debug!("sync thread started");
    let mut rate_ring: std::collections::VecDeque<(u64, u64)> =
        std::collections::VecDeque::with_capacity(inner.flags.sync_periods as usize);
    let period = Duration::from_millis(inner.flags.sync_period_ms as u64);
    let dest = inner.uri.sync_addr().ok().map(|(a, p)| SocketAddr::new(a, p));

    while !inner.stop.load(Relaxed) {
        let tick_start = Instant::now();
        let now_nanos = unix_time_nanos();

        // roll the rate window, except on the very first tick
        if inner.current_sync_start_nano.load(Relaxed) != 0 {
            let start = inner.current_sync_start_nano.swap(now_nanos, Relaxed);
            let events = inner.events_in_current_sync.swap(0, Relaxed);
            if rate_ring.len() == inner.flags.sync_periods as usize {
                rate_ring.pop_front();
            }
            rate_ring.push_back((start, events));
        } else {
            inner.current_sync_start_nano.store(now_nanos, Relaxed);
        }

        // with microsecond ticks the LB sees a constant 1 MHz event clock;
        // with sequential numbering report the measured rate
        let (reported_event_num, reported_rate) = if inner.flags.usec_as_event_num {
            (unix_time_micros(), 1_000_000)
        } else {
            (inner.user_event_num.load(Relaxed), event_rate(&rate_ring, now_nanos))
        };

        let hdr = SyncHdr::new(inner.event_src_id, reported_event_num, reported_rate, now_nanos);
        let mut buf = [0u8; SYNC_HDR_LEN];
        hdr.encode(&mut buf);

        inner.sync_stats.msg_cnt.fetch_add(1, Relaxed);
        let res = if inner.flags.connected_socket {
            sock.send(&buf)
        } else {
            match dest {
                Some(d) => sock.send_to(&buf, &d.into()),
                None => Ok(0),
            }
        };
        if res.is_err() {
            inner.sync_stats.record_os_error();
        }

        // sleep out the period in slices so shutdown stays prompt
        while tick_start.elapsed() < period && !inner.stop.load(Relaxed) {
            std::thread::sleep(Duration::from_millis(
                10.min(inner.flags.sync_period_ms as u64).max(1),
            ));
        }
    }
    tracing::debug!("sync thread exiting");
}

fn dispatch_thread_body(
    inner: Arc<SegmenterInner>,
    queue_rx: Receiver<EventQueueItem>,
    worker_txs: Vec<Sender<EventQueueItem>>,
) {
    tracing::debug!("dispatch thread started");
    let rate_limit = !inner.flags.smooth && inner.flags.rate_gbps > 0.0;
    let mut rri = 0usize;

    let mut dispatch = |item: EventQueueItem, rri: &mut usize| {
        let pace_start = Instant::now();
        let sleep_usec = if rate_limit {
            (item.event.len() as f64 * 8.0 / (inner.flags.rate_gbps as f64 * 1000.0)) as u64
        } else {
            0
        };
        *rri = (*rri + 1) % worker_txs.len();
        let _ = worker_txs[*rri].send(item);
        if sleep_usec > 0 {
            busy_wait_micros(pace_start, sleep_usec);
        }
    };

    loop {
        match queue_rx.recv_timeout(Duration::from_millis(10)) {
            Ok(item) => dispatch(item, &mut rri),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => {
                if inner.stop.load(Relaxed) {
                    break;
                }
            }
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    // drain whatever the application already queued
    while let Ok(item) = queue_rx.try_recv() {
        dispatch(item, &mut rri);
    }
    // dropping the worker senders lets the workers run dry and exit
    drop(worker_txs);
    tracing::debug!("dispatch thread exiting");
}

fn send_worker_body(inner: Arc<SegmenterInner>, index: usize, rx: Receiver<EventQueueItem>) {
    // per-frame pacing interval when smooth mode splits the rate per socket
    let inter_frame_usec = if inner.flags.smooth {
        let per_thread_rate = inner.flags.rate_gbps as f64 / inner.flags.num_send_sockets as f64;
        (inner.mtu as f64 * 8.0 / (per_thread_rate * 1000.0)) as u64
    } else {
        0
    };

    // runs until the dispatch thread hangs up and the backlog is drained
    while let Ok(item) = rx.recv() {
        let _ = inner.send_event_segments(index, item, inter_frame_usec);
    }

    #[cfg(target_os = "linux")]
    if inner.send_mode == SendMode::IoUringSend {
        // reap leftovers so outstanding counters can reach zero
        inner.reap_cqes();
    }
}

#[cfg(target_os = "linux")]
fn cqe_reaper_body(inner: Arc<SegmenterInner>) {
    tracing::debug!("CQE reaper started");
    loop {
        let drained = inner.reap_cqes();
        if inner.stop.load(Relaxed) && inner.outstanding_sends.load(Relaxed) == 0 {
            break;
        }
        if drained == 0 {
            std::thread::sleep(Duration::from_micros(200));
        }
    }
    tracing::debug!("CQE reaper exiting");
}
