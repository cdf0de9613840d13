//! On-wire header codecs.
//!
//! Three fixed-size headers couple the Segmenter and Reassembler through the
//! load balancer, all big-endian on the wire:
//!
//! * LB header (16 B) — consumed and stripped by the LB; carries the entropy
//!   that picks the destination worker port and a 64-bit tick.
//! * RE header (20 B) — preserved end-to-end; carries dataId, the segment's
//!   offset into the event and the event's total length.
//! * Sync header (28 B) — periodic source→LB control datagram.
//!
//! Headers are plain byte-array codecs with explicit offset constants, no
//! packed structs.

pub const LB_HDR_LEN: usize = 16;
pub const RE_HDR_LEN: usize = 20;
pub const SYNC_HDR_LEN: usize = 28;
/// LB and RE headers are kept concatenated so a single iovec entry covers
/// both ahead of the payload entry.
pub const LBRE_HDR_LEN: usize = LB_HDR_LEN + RE_HDR_LEN;

pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const UDP_HDR_LEN: usize = 8;

const LB_VERSION: u8 = 2;
const RE_VERSION: u8 = 1;
const RE_VERSION_NIBBLE: u8 = RE_VERSION << 4;
const SYNC_VERSION: u8 = 2;

/// Total bytes of IP + UDP + LB + RE headers that an MTU must accommodate.
pub const fn total_header_length(v6: bool) -> usize {
    (if v6 { IPV6_HDR_LEN } else { IPV4_HDR_LEN }) + UDP_HDR_LEN + LBRE_HDR_LEN
}

/// Load balancer header, version 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LbHdr {
    pub entropy: u16,
    /// The LB tick: either UNIX microseconds or a sequential event number.
    pub event_num: u64,
}

impl LbHdr {
    pub fn new(entropy: u16, event_num: u64) -> Self {
        LbHdr { entropy, event_num }
    }

    pub fn encode(&self, buf: &mut [u8; LB_HDR_LEN]) {
        buf[0] = b'L';
        buf[1] = b'B';
        buf[2] = LB_VERSION;
        buf[3] = RE_VERSION; // next protocol
        buf[4..6].copy_from_slice(&[0, 0]);
        buf[6..8].copy_from_slice(&self.entropy.to_be_bytes());
        buf[8..16].copy_from_slice(&self.event_num.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<LbHdr> {
        if buf.len() < LB_HDR_LEN {
            return None;
        }
        if &buf[0..2] != b"LB" || buf[2] != LB_VERSION {
            return None;
        }
        Some(LbHdr {
            entropy: u16::from_be_bytes([buf[6], buf[7]]),
            event_num: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
        })
    }
}

/// Reassembly header, version 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReHdr {
    pub data_id: u16,
    /// Start of this segment within the event.
    pub buffer_offset: u32,
    /// Total event length, NOT the segment length.
    pub buffer_length: u32,
    pub event_num: u64,
}

impl ReHdr {
    pub fn new(data_id: u16, buffer_offset: u32, buffer_length: u32, event_num: u64) -> Self {
        ReHdr { data_id, buffer_offset, buffer_length, event_num }
    }

    pub fn encode(&self, buf: &mut [u8; RE_HDR_LEN]) {
        buf[0] = RE_VERSION_NIBBLE;
        buf[1] = 0; // reserved
        buf[2..4].copy_from_slice(&self.data_id.to_be_bytes());
        buf[4..8].copy_from_slice(&self.buffer_offset.to_be_bytes());
        buf[8..12].copy_from_slice(&self.buffer_length.to_be_bytes());
        buf[12..20].copy_from_slice(&self.event_num.to_be_bytes());
    }

    /// Decode and validate: version nibble must be 1 and the reserved byte 0.
    /// A mismatch is a data error and the datagram is dropped by the caller.
    pub fn decode(buf: &[u8]) -> Option<ReHdr> {
        if buf.len() < RE_HDR_LEN {
            return None;
        }
        if buf[0] != RE_VERSION_NIBBLE || buf[1] != 0 {
            return None;
        }
        Some(ReHdr {
            data_id: u16::from_be_bytes([buf[2], buf[3]]),
            buffer_offset: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            buffer_length: u32::from_be_bytes(buf[8..12].try_into().unwrap()),
            event_num: u64::from_be_bytes(buf[12..20].try_into().unwrap()),
        })
    }
}

/// Encode concatenated LB+RE headers into one 36-byte buffer.
pub fn encode_lbre(lb: &LbHdr, re: &ReHdr) -> [u8; LBRE_HDR_LEN] {
    let mut out = [0u8; LBRE_HDR_LEN];
    let mut lbbuf = [0u8; LB_HDR_LEN];
    lb.encode(&mut lbbuf);
    let mut rebuf = [0u8; RE_HDR_LEN];
    re.encode(&mut rebuf);
    out[..LB_HDR_LEN].copy_from_slice(&lbbuf);
    out[LB_HDR_LEN..].copy_from_slice(&rebuf);
    out
}

/// Sync header, version 2.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncHdr {
    pub event_src_id: u32,
    pub event_number: u64,
    pub avg_event_rate_hz: u32,
    pub unix_time_nano: u64,
}

impl SyncHdr {
    pub fn new(event_src_id: u32, event_number: u64, avg_event_rate_hz: u32, unix_time_nano: u64) -> Self {
        SyncHdr { event_src_id, event_number, avg_event_rate_hz, unix_time_nano }
    }

    pub fn encode(&self, buf: &mut [u8; SYNC_HDR_LEN]) {
        buf[0] = b'L';
        buf[1] = b'C';
        buf[2] = SYNC_VERSION;
        buf[3] = 0; // reserved
        buf[4..8].copy_from_slice(&self.event_src_id.to_be_bytes());
        buf[8..16].copy_from_slice(&self.event_number.to_be_bytes());
        buf[16..20].copy_from_slice(&self.avg_event_rate_hz.to_be_bytes());
        buf[20..28].copy_from_slice(&self.unix_time_nano.to_be_bytes());
    }

    pub fn decode(buf: &[u8]) -> Option<SyncHdr> {
        if buf.len() < SYNC_HDR_LEN {
            return None;
        }
        if &buf[0..2] != b"LC" || buf[2] != SYNC_VERSION {
            return None;
        }
        Some(SyncHdr {
            event_src_id: u32::from_be_bytes(buf[4..8].try_into().unwrap()),
            event_number: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            avg_event_rate_hz: u32::from_be_bytes(buf[16..20].try_into().unwrap()),
            unix_time_nano: u64::from_be_bytes(buf[20..28].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lb_hdr_reference_bytes() {
        let hdr = LbHdr::new(0x0102, 0x0405060708090a0b);
        let mut buf = [0u8; LB_HDR_LEN];
        hdr.encode(&mut buf);
        // preamble "LB", version 2, nextProto 1, reserved, entropy, eventNum
        assert_eq!(
            buf,
            [
                0x4c, 0x42, 0x02, 0x01, 0x00, 0x00, 0x01, 0x02, //
                0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b
            ]
        );
        assert_eq!(LbHdr::decode(&buf), Some(hdr));
    }

    #[test]
    fn test_re_hdr_reference_bytes() {
        let hdr = ReHdr::new(0x0102, 0x03040506, 0x0708090a, 0x1112131415161718);
        let mut buf = [0u8; RE_HDR_LEN];
        hdr.encode(&mut buf);
        assert_eq!(
            buf,
            [
                0x10, 0x00, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06, //
                0x07, 0x08, 0x09, 0x0a, 0x11, 0x12, 0x13, 0x14, //
                0x15, 0x16, 0x17, 0x18
            ]
        );
        assert_eq!(ReHdr::decode(&buf), Some(hdr));
    }

    #[test]
    fn test_sync_hdr_roundtrip() {
        let hdr = SyncHdr::new(0x05060708, 12345678, 1_000_000, 0xfeedfacecafebeef);
        let mut buf = [0u8; SYNC_HDR_LEN];
        hdr.encode(&mut buf);
        assert_eq!(&buf[0..2], b"LC");
        assert_eq!(buf[2], 2);
        assert_eq!(SyncHdr::decode(&buf), Some(hdr));
    }

    #[test]
    fn test_re_hdr_rejects_bad_version() {
        let hdr = ReHdr::new(1, 0, 10, 1);
        let mut buf = [0u8; RE_HDR_LEN];
        hdr.encode(&mut buf);
        buf[0] = 0x20; // version nibble 2
        assert!(ReHdr::decode(&buf).is_none());
        buf[0] = 0x10;
        buf[1] = 0xff; // reserved byte must be 0
        assert!(ReHdr::decode(&buf).is_none());
    }

    #[test]
    fn test_re_hdr_rejects_short_buffer() {
        assert!(ReHdr::decode(&[0u8; RE_HDR_LEN - 1]).is_none());
        assert!(LbHdr::decode(&[0u8; LB_HDR_LEN - 1]).is_none());
        assert!(SyncHdr::decode(&[0u8; SYNC_HDR_LEN - 1]).is_none());
    }

    #[test]
    fn test_lbre_concatenation() {
        let lb = LbHdr::new(7, 42);
        let re = ReHdr::new(3, 100, 4096, 42);
        let buf = encode_lbre(&lb, &re);
        assert_eq!(buf.len(), 36);
        assert_eq!(LbHdr::decode(&buf[..LB_HDR_LEN]), Some(lb));
        assert_eq!(ReHdr::decode(&buf[LB_HDR_LEN..]), Some(re));
    }

    #[test]
    fn test_total_header_length() {
        assert_eq!(total_header_length(false), 20 + 8 + 36);
        assert_eq!(total_header_length(true), 40 + 8 + 36);
    }
}
