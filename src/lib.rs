//! E2SAR dataplane: event segmentation, UDP transport through a hardware
//! load balancer, and reassembly on worker nodes, with a gRPC control-plane
//! client for reservation, registration and state reporting.

pub mod affinity;
pub mod config;
pub mod error;
pub mod headers;
pub mod lbmanager;
pub mod net_util;
pub mod proto;
pub mod reassembler;
pub mod segmenter;
pub mod uri;

pub use error::{E2sarError, ErrorKind, Result};
pub use headers::{LbHdr, ReHdr, SyncHdr, LB_HDR_LEN, LBRE_HDR_LEN, RE_HDR_LEN, SYNC_HDR_LEN};
pub use lbmanager::{LbManager, LbStatus, OverviewEntry, TlsOptions};
pub use reassembler::{
    LostEventInfo, ReassembledEvent, Reassembler, ReassemblerFlags, RecvThreads,
};
pub use segmenter::{select_send_mode, Segmenter, SegmenterFlags, SendMode};
pub use uri::{EjfatUri, TokenType, DATAPLANE_PORT};
