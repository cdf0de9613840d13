//! Protobuf message types and a typed client for the `loadbalancer.LoadBalancer`
//! control plane service.
//!
//! Defined manually using prost derives — no proto files or protoc needed.
//! Wire format matches `loadbalancer.proto` from the UDPLBd control plane:
//!
//! ```text
//! service LoadBalancer {
//!   rpc ReserveLoadBalancer(ReserveLoadBalancerRequest) returns (ReserveLoadBalancerReply);
//!   rpc GetLoadBalancer(GetLoadBalancerRequest) returns (ReserveLoadBalancerReply);
//!   rpc LoadBalancerStatus(LoadBalancerStatusRequest) returns (LoadBalancerStatusReply);
//!   rpc FreeLoadBalancer(FreeLoadBalancerRequest) returns (FreeLoadBalancerReply);
//!   rpc AddSenders(AddSendersRequest) returns (AddSendersReply);
//!   rpc RemoveSenders(RemoveSendersRequest) returns (RemoveSendersReply);
//!   rpc Register(RegisterRequest) returns (RegisterReply);
//!   rpc Deregister(DeregisterRequest) returns (DeregisterReply);
//!   rpc SendState(SendStateRequest) returns (SendStateReply);
//!   rpc Overview(OverviewRequest) returns (OverviewReply);
//!   rpc Version(VersionRequest) returns (VersionReply);
//! }
//! ```
//!
//! Authorization travels in the `authorization: Bearer <token>` request
//! metadata; the `token` body fields exist only for compatibility with old
//! servers and are left empty.

use prost_types::Timestamp;
use tonic::codegen::http::uri::PathAndQuery;
use tonic::transport::Channel;
use tonic::{Request, Status};
use tonic_prost::ProstCodec;

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReserveLoadBalancerRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub name: String,
    #[prost(message, optional, tag = "3")]
    pub until: Option<Timestamp>,
    #[prost(string, repeated, tag = "4")]
    pub sender_addresses: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct ReserveLoadBalancerReply {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
    #[prost(string, tag = "3")]
    pub sync_ip_address: String,
    #[prost(uint32, tag = "4")]
    pub sync_udp_port: u32,
    #[prost(string, tag = "5")]
    pub data_ipv4_address: String,
    #[prost(string, tag = "6")]
    pub data_ipv6_address: String,
    #[prost(uint32, tag = "7")]
    pub fpga_lb_id: u32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct GetLoadBalancerRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoadBalancerStatusRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct WorkerStatus {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(float, tag = "2")]
    pub fill_percent: f32,
    #[prost(float, tag = "3")]
    pub control_signal: f32,
    #[prost(uint32, tag = "4")]
    pub slots_assigned: u32,
    #[prost(message, optional, tag = "5")]
    pub last_updated: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoadBalancerStatusReply {
    #[prost(message, optional, tag = "1")]
    pub timestamp: Option<Timestamp>,
    #[prost(uint64, tag = "2")]
    pub current_epoch: u64,
    #[prost(uint64, tag = "3")]
    pub current_predicted_event_number: u64,
    #[prost(message, repeated, tag = "4")]
    pub workers: Vec<WorkerStatus>,
    #[prost(string, repeated, tag = "5")]
    pub sender_addresses: Vec<String>,
    #[prost(message, optional, tag = "6")]
    pub expires_at: Option<Timestamp>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FreeLoadBalancerRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct FreeLoadBalancerReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddSendersRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
    #[prost(string, repeated, tag = "3")]
    pub sender_addresses: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddSendersReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveSendersRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
    #[prost(string, repeated, tag = "3")]
    pub sender_addresses: Vec<String>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RemoveSendersReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
    #[prost(string, tag = "3")]
    pub name: String,
    #[prost(float, tag = "4")]
    pub weight: f32,
    #[prost(string, tag = "5")]
    pub ip_address: String,
    #[prost(uint32, tag = "6")]
    pub udp_port: u32,
    /// PortRange enum value: the worker listens on 2^port_range consecutive
    /// ports starting at udp_port.
    #[prost(int32, tag = "7")]
    pub port_range: i32,
    #[prost(float, tag = "8")]
    pub min_factor: f32,
    #[prost(float, tag = "9")]
    pub max_factor: f32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RegisterReply {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeregisterRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub lb_id: String,
    #[prost(string, tag = "3")]
    pub session_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeregisterReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendStateRequest {
    #[prost(string, tag = "1")]
    pub token: String,
    #[prost(string, tag = "2")]
    pub session_id: String,
    #[prost(message, optional, tag = "3")]
    pub timestamp: Option<Timestamp>,
    #[prost(float, tag = "4")]
    pub fill_percent: f32,
    #[prost(float, tag = "5")]
    pub control_signal: f32,
    #[prost(bool, tag = "6")]
    pub is_ready: bool,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct SendStateReply {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OverviewRequest {
    #[prost(string, tag = "1")]
    pub token: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct LoadBalancerSummary {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(message, optional, tag = "2")]
    pub reservation: Option<ReserveLoadBalancerReply>,
    #[prost(message, optional, tag = "3")]
    pub status: Option<LoadBalancerStatusReply>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct OverviewReply {
    #[prost(message, repeated, tag = "1")]
    pub load_balancers: Vec<LoadBalancerSummary>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct VersionReply {
    #[prost(string, tag = "1")]
    pub commit: String,
    #[prost(string, tag = "2")]
    pub build: String,
    #[prost(string, tag = "3")]
    pub compat_tag: String,
}

/// Typed unary client over a tonic channel.
pub struct LoadBalancerClient {
    grpc: tonic::client::Grpc<Channel>,
}

macro_rules! unary {
    ($name:ident, $path:literal, $req:ty, $rep:ty) => {
        pub async fn $name(&mut self, request: Request<$req>) -> Result<$rep, Status> {
            self.grpc
                .ready()
                .await
                .map_err(|e| Status::unavailable(format!("service not ready: {}", e)))?;
            let path = PathAndQuery::from_static($path);
            let codec = ProstCodec::<$req, $rep>::default();
            Ok(self.grpc.unary(request, path, codec).await?.into_inner())
        }
    };
}

impl LoadBalancerClient {
    pub fn new(channel: Channel) -> Self {
        LoadBalancerClient { grpc: tonic::client::Grpc::new(channel) }
    }

    unary!(
        reserve_load_balancer,
        "/loadbalancer.LoadBalancer/ReserveLoadBalancer",
        ReserveLoadBalancerRequest,
        ReserveLoadBalancerReply
    );
    unary!(
        get_load_balancer,
        "/loadbalancer.LoadBalancer/GetLoadBalancer",
        GetLoadBalancerRequest,
        ReserveLoadBalancerReply
    );
    unary!(
        load_balancer_status,
        "/loadbalancer.LoadBalancer/LoadBalancerStatus",
        LoadBalancerStatusRequest,
        LoadBalancerStatusReply
    );
    unary!(
        free_load_balancer,
        "/loadbalancer.LoadBalancer/FreeLoadBalancer",
        FreeLoadBalancerRequest,
        FreeLoadBalancerReply
    );
    unary!(
        add_senders,
        "/loadbalancer.LoadBalancer/AddSenders",
        AddSendersRequest,
        AddSendersReply
    );
    unary!(
        remove_senders,
        "/loadbalancer.LoadBalancer/RemoveSenders",
        RemoveSendersRequest,
        RemoveSendersReply
    );
    unary!(
        register,
        "/loadbalancer.LoadBalancer/Register",
        RegisterRequest,
        RegisterReply
    );
    unary!(
        deregister,
        "/loadbalancer.LoadBalancer/Deregister",
        DeregisterRequest,
        DeregisterReply
    );
    unary!(
        send_state,
        "/loadbalancer.LoadBalancer/SendState",
        SendStateRequest,
        SendStateReply
    );
    unary!(
        overview,
        "/loadbalancer.LoadBalancer/Overview",
        OverviewRequest,
        OverviewReply
    );
    unary!(
        version,
        "/loadbalancer.LoadBalancer/Version",
        VersionRequest,
        VersionReply
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use prost::Message;

    #[test]
    fn test_register_request_roundtrip() {
        let req = RegisterRequest {
            token: String::new(),
            lb_id: "36".into(),
            name: "worker-1".into(),
            weight: 1.0,
            ip_address: "10.0.0.5".into(),
            udp_port: 19522,
            port_range: 3,
            min_factor: 0.5,
            max_factor: 2.0,
        };
        let bytes = req.encode_to_vec();
        let back = RegisterRequest::decode(bytes.as_slice()).unwrap();
        assert_eq!(req, back);
    }

    #[test]
    fn test_status_reply_defaults() {
        // an empty buffer decodes to all-default fields
        let rep = LoadBalancerStatusReply::decode(&[][..]).unwrap();
        assert_eq!(rep.current_epoch, 0);
        assert!(rep.workers.is_empty());
    }
}
