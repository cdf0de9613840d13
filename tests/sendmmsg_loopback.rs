//! Loopback round-trip over the batched `sendmmsg` transport.
//!
//! Lives in its own test binary because the send transport is selected once
//! per process.

#![cfg(target_os = "linux")]

use e2sar::reassembler::{Reassembler, ReassemblerFlags, RecvThreads};
use e2sar::segmenter::{select_send_mode, Segmenter, SegmenterFlags, SendMode};
use e2sar::uri::{EjfatUri, TokenType};

#[test]
fn test_multi_frame_over_sendmmsg() {
    select_send_mode(SendMode::SendMmsg).unwrap();

    const PORT: u16 = 21100;
    let uri = EjfatUri::parse(
        &format!("ejfat://127.0.0.1:18020/lb/1?data=127.0.0.1:{}", PORT),
        TokenType::Admin,
        false,
    )
    .unwrap();

    let mut reas = Reassembler::new(
        uri.clone(),
        Some("127.0.0.1".parse().unwrap()),
        PORT,
        RecvThreads::Count(1),
        ReassemblerFlags { use_cp: false, with_lb_header: true, ..Default::default() },
    )
    .unwrap();
    reas.open_and_start().unwrap();

    // mtu 100 over IPv4 leaves 36 bytes of payload per datagram
    let flags = SegmenterFlags { use_cp: false, mtu: 100, ..Default::default() };
    let mut seg = Segmenter::new(uri, 11, 1, &[], flags).unwrap();
    seg.open_and_start().unwrap();

    let payload: Vec<u8> = (0..500u32).map(|i| (i % 251) as u8).collect();
    let fragments = payload.len().div_ceil(seg.max_pld_len());
    assert!(fragments > 1);

    for _ in 0..3 {
        seg.add_to_send_queue(payload.clone(), None, None, None, None).unwrap();
    }

    for _ in 0..3 {
        let ev = reas.recv_event(2000).expect("event not delivered");
        assert_eq!(ev.event, payload);
        assert_eq!(ev.data_id, 11);
    }

    seg.stop();
    assert_eq!(seg.send_stats().msg_cnt, 3 * fragments as u64);
    assert_eq!(seg.send_stats().err_cnt, 0);
    assert_eq!(reas.stats().event_success, 3);
}
