//! End-to-end Segmenter → Reassembler scenarios over 127.0.0.1.
//!
//! The control plane is disabled on the senders and the receivers expect the
//! LB header still attached, exactly as in back-to-back testing without a
//! load balancer in the path. Each test uses its own port base so the
//! harness can run them in parallel.

use std::collections::HashMap;
use std::net::UdpSocket;
use std::time::Duration;

use e2sar::headers::{encode_lbre, total_header_length, LbHdr, ReHdr, SyncHdr, SYNC_HDR_LEN};
use e2sar::reassembler::{Reassembler, ReassemblerFlags, RecvThreads};
use e2sar::segmenter::{Segmenter, SegmenterFlags};
use e2sar::uri::{EjfatUri, TokenType};

const EVENT_MSG: &[u8] = b"THIS IS A VERY LONG EVENT MESSAGE WE WANT TO SEND EVERY 1 SECONDS.";

fn init_tracing() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "warn".into()),
            )
            .try_init();
    });
}

fn data_uri(port: u16) -> EjfatUri {
    EjfatUri::parse(
        &format!("ejfat://127.0.0.1:18020/lb/1?data=127.0.0.1:{}", port),
        TokenType::Admin,
        false,
    )
    .unwrap()
}

fn no_cp_segmenter(mtu: u16) -> SegmenterFlags {
    SegmenterFlags { use_cp: false, mtu, ..Default::default() }
}

fn receiver_flags() -> ReassemblerFlags {
    ReassemblerFlags {
        use_cp: false,
        with_lb_header: true,
        ..Default::default()
    }
}

fn start_receiver(port: u16, threads: usize, flags: ReassemblerFlags) -> Reassembler {
    let mut reas = Reassembler::new(
        data_uri(port),
        Some("127.0.0.1".parse().unwrap()),
        port,
        RecvThreads::Count(threads),
        flags,
    )
    .unwrap();
    reas.open_and_start().unwrap();
    reas
}

#[test]
fn test_single_frame_loopback() {
    init_tracing();
    const PORT: u16 = 20100;
    let reas = start_receiver(PORT, 1, receiver_flags());

    let mut seg = Segmenter::new(data_uri(PORT), 17, 1, &[], no_cp_segmenter(1500)).unwrap();
    seg.open_and_start().unwrap();

    for _ in 0..5 {
        seg.add_to_send_queue(EVENT_MSG.to_vec(), None, None, None, None).unwrap();
    }

    let mut received = Vec::new();
    for _ in 0..5 {
        let ev = reas.recv_event(2000).expect("event not delivered");
        received.push(ev);
    }

    seg.stop();
    let send_stats = seg.send_stats();
    assert_eq!(send_stats.msg_cnt, 5, "one datagram per event at full MTU");
    assert_eq!(send_stats.err_cnt, 0);

    let recv_stats = reas.stats();
    assert_eq!(recv_stats.event_success, 5);
    assert_eq!(recv_stats.enqueue_loss, 0);
    assert_eq!(recv_stats.reassembly_loss, 0);
    assert_eq!(recv_stats.data_err_cnt, 0);

    for ev in &received {
        assert_eq!(ev.event, EVENT_MSG);
        assert_eq!(ev.data_id, 17);
    }
    // sequential numbering from the internal counter
    let mut nums: Vec<u64> = received.iter().map(|e| e.event_num).collect();
    nums.sort_unstable();
    assert_eq!(nums, vec![1, 2, 3, 4, 5]);
}

#[test]
fn test_multi_frame_loopback() {
    init_tracing();
    const PORT: u16 = 20200;
    const MTU: u16 = 80;
    let reas = start_receiver(PORT, 1, receiver_flags());

    let mut seg = Segmenter::new(data_uri(PORT), 5, 1, &[], no_cp_segmenter(MTU)).unwrap();
    seg.open_and_start().unwrap();

    let max_pld = MTU as usize - total_header_length(false);
    let frags_per_event = EVENT_MSG.len().div_ceil(max_pld);
    assert_eq!(frags_per_event, 5);

    for _ in 0..5 {
        seg.add_to_send_queue(EVENT_MSG.to_vec(), None, None, None, None).unwrap();
    }

    for _ in 0..5 {
        let ev = reas.recv_event(2000).expect("event not delivered");
        assert_eq!(ev.event, EVENT_MSG);
    }

    seg.stop();
    assert_eq!(seg.send_stats().msg_cnt, 25, "5 events x 5 fragments");
    assert_eq!(seg.send_stats().err_cnt, 0);

    let recv_stats = reas.stats();
    assert_eq!(recv_stats.event_success, 5);
    assert_eq!(recv_stats.enqueue_loss + recv_stats.reassembly_loss, 0);
}

#[test]
fn test_four_senders_one_receiver() {
    init_tracing();
    // the receiver covers 2^2 consecutive ports starting at the default
    // dataplane port; each sender targets one of them
    const BASE: u16 = 19522;
    let reas = start_receiver(
        BASE,
        1,
        ReassemblerFlags { port_range: 2, ..receiver_flags() },
    );
    assert_eq!(reas.recv_ports(), (19522, 19525));

    let mut segs = Vec::new();
    for i in 0..4u16 {
        let flags = SegmenterFlags { num_send_sockets: 1, ..no_cp_segmenter(1500) };
        let mut seg = Segmenter::new(data_uri(BASE + i), 100 + i, i as u32, &[], flags).unwrap();
        seg.open_and_start().unwrap();
        segs.push(seg);
    }

    for (i, seg) in segs.iter().enumerate() {
        let base = 1000 * (i as u64 + 1);
        for j in 0..5u64 {
            let payload = format!("sender {} event {}", i, j).into_bytes();
            seg.add_to_send_queue(payload, Some(base + j), None, None, None).unwrap();
        }
    }

    let mut by_num: HashMap<u64, Vec<u8>> = HashMap::new();
    for _ in 0..20 {
        let ev = reas.recv_event(2000).expect("event not delivered");
        by_num.insert(ev.event_num, ev.event);
    }

    for seg in segs.iter_mut() {
        seg.stop();
        assert_eq!(seg.send_stats().msg_cnt, 5);
    }

    let recv_stats = reas.stats();
    assert_eq!(recv_stats.event_success, 20);
    assert_eq!(recv_stats.enqueue_loss, 0);
    assert_eq!(recv_stats.reassembly_loss, 0);

    for i in 0..4u64 {
        for j in 0..5u64 {
            let num = 1000 * (i + 1) + j;
            let expected = format!("sender {} event {}", i, j).into_bytes();
            assert_eq!(by_num.get(&num), Some(&expected), "event {}", num);
        }
    }
}

#[test]
fn test_sync_cadence() {
    init_tracing();
    const SYNC_PORT: u16 = 20300;
    const DATA_PORT: u16 = 20301;

    let listener = UdpSocket::bind(("127.0.0.1", SYNC_PORT)).unwrap();
    listener.set_read_timeout(Some(Duration::from_millis(500))).unwrap();

    let uri = EjfatUri::parse(
        &format!(
            "ejfat://127.0.0.1:18020/lb/1?data=127.0.0.1:{}&sync=127.0.0.1:{}",
            DATA_PORT, SYNC_PORT
        ),
        TokenType::Admin,
        false,
    )
    .unwrap();

    let flags = SegmenterFlags {
        sync_period_ms: 100,
        warm_up_ms: 50,
        ..Default::default()
    };
    let mut seg = Segmenter::new(uri, 1, 0xbeef, &[], flags).unwrap();
    seg.open_and_start().unwrap();

    // ten periods' worth of runtime
    std::thread::sleep(Duration::from_millis(1200));
    seg.stop();

    let stats = seg.sync_stats();
    assert!(stats.msg_cnt >= 10, "expected >= 10 sync messages, got {}", stats.msg_cnt);
    assert_eq!(stats.err_cnt, 0);

    // the datagrams on the wire are well-formed sync headers
    let mut buf = [0u8; 64];
    let mut seen = 0;
    while seen < 3 {
        let Ok((n, _)) = listener.recv_from(&mut buf) else { break };
        assert_eq!(n, SYNC_HDR_LEN);
        let hdr = SyncHdr::decode(&buf[..n]).expect("invalid sync header on the wire");
        assert_eq!(hdr.event_src_id, 0xbeef);
        assert!(hdr.unix_time_nano > 0);
        seen += 1;
    }
    assert_eq!(seen, 3);
}

#[test]
fn test_reassembly_timeout_counts_loss() {
    init_tracing();
    const PORT: u16 = 20500;
    let reas = start_receiver(
        PORT,
        1,
        ReassemblerFlags { event_timeout_ms: 100, ..receiver_flags() },
    );

    // a lone fragment of a 100-byte event that never completes
    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut datagram = encode_lbre(
        &LbHdr::new(7, 123),
        &ReHdr::new(3, 0, 100, 42),
    )
    .to_vec();
    datagram.extend_from_slice(&[0xabu8; 10]);
    sender.send_to(&datagram, ("127.0.0.1", PORT)).unwrap();

    std::thread::sleep(Duration::from_millis(400));

    let stats = reas.stats();
    assert_eq!(stats.reassembly_loss, 1);
    assert_eq!(stats.event_success, 0);
    let lost = reas.get_lost_event().expect("lost event not recorded");
    assert_eq!(lost.event_num, 42);
    assert_eq!(lost.data_id, 3);
    assert_eq!(lost.num_fragments, 1);
}

#[test]
fn test_bad_version_dropped() {
    init_tracing();
    const PORT: u16 = 20600;
    let reas = start_receiver(PORT, 1, receiver_flags());

    let sender = UdpSocket::bind("127.0.0.1:0").unwrap();
    let mut datagram = encode_lbre(&LbHdr::new(1, 1), &ReHdr::new(1, 0, 4, 1)).to_vec();
    datagram.extend_from_slice(b"data");
    // corrupt the RE version nibble
    datagram[e2sar::LB_HDR_LEN] = 0x20;
    sender.send_to(&datagram, ("127.0.0.1", PORT)).unwrap();

    std::thread::sleep(Duration::from_millis(200));

    let stats = reas.stats();
    assert_eq!(stats.data_err_cnt, 1);
    assert_eq!(stats.event_success, 0);
}

#[test]
fn test_enqueue_loss_when_consumer_stalls() {
    init_tracing();
    const PORT: u16 = 20400;
    // nobody consumes: the 1000-deep queue must overflow
    let reas = start_receiver(PORT, 1, receiver_flags());

    let flags = SegmenterFlags { num_send_sockets: 1, ..no_cp_segmenter(1500) };
    let mut seg = Segmenter::new(data_uri(PORT), 9, 1, &[], flags).unwrap();
    seg.open_and_start().unwrap();

    const TOTAL: u64 = 1200;
    for i in 0..TOTAL {
        seg.send_event(vec![0x5a; 32], Some(i + 1), None, None).unwrap();
        // pace lightly so the receive thread keeps up
        if i % 100 == 0 {
            std::thread::sleep(Duration::from_millis(5));
        }
    }
    std::thread::sleep(Duration::from_millis(500));
    seg.stop();

    let stats = reas.stats();
    assert!(
        stats.event_success > 1000,
        "most events should assemble, got {}",
        stats.event_success
    );
    assert!(stats.enqueue_loss >= 1, "queue overflow must be counted");
    assert!(reas.get_lost_event().is_some());

    // the queue still hands out the first 1000 events
    let mut drained = 0;
    while reas.get_event().is_some() {
        drained += 1;
    }
    assert_eq!(drained, 1000);
}

#[test]
fn test_fd_stats_after_stop() {
    init_tracing();
    const PORT: u16 = 20700;
    let mut reas = start_receiver(PORT, 1, receiver_flags());

    assert!(reas.fd_stats().is_err(), "per-port stats require stopped threads");

    let mut seg = Segmenter::new(data_uri(PORT), 2, 1, &[], no_cp_segmenter(1500)).unwrap();
    seg.open_and_start().unwrap();
    seg.send_event(EVENT_MSG.to_vec(), None, None, None).unwrap();

    assert!(reas.recv_event(2000).is_some());
    seg.stop();
    reas.stop();

    let fd_stats = reas.fd_stats().unwrap();
    assert_eq!(fd_stats.len(), 1);
    assert_eq!(fd_stats[0].0, PORT);
    assert_eq!(fd_stats[0].1, 1);
}
