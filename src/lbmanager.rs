//! Synchronous gRPC façade over the `LoadBalancer` control plane service.
//!
//! The manager owns the URI it was built from and writes reservation and
//! registration results back into it: `reserve_lb` populates the instance
//! token, LB id, sync and data addresses; `register_worker` records the
//! session id and session token. Every RPC statically selects one of the
//! three token slots and refuses to run when that slot is empty.
//!
//! The dataplane never blocks on this module; calls run on the caller's
//! thread via a private current-thread tokio runtime.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use prost_types::Timestamp;
use tonic::metadata::MetadataValue;
use tonic::transport::{Certificate, Channel, ClientTlsConfig, Endpoint, Identity};
use tonic::Request;

use crate::error::{E2sarError, Result};
use crate::proto::{self, LoadBalancerClient};
use crate::uri::{EjfatUri, TokenType};

/// Default reservation lifetime when the caller does not care.
pub const DEFAULT_LB_RESERVE_DURATION: Duration = Duration::from_secs(24 * 3600);

/// Map the max number of data sources a worker will see to the control
/// plane's PortRange enum value: ceil(log2(max(count, 2))) clamped to [0, 14].
pub fn port_range_from_source_count(source_count: usize) -> i32 {
    if source_count < 2 {
        return 0;
    }
    if source_count > 16384 {
        return 14;
    }
    let mut max_count = 2usize;
    let mut iteration = 1;
    while source_count > max_count {
        iteration += 1;
        max_count <<= 1;
    }
    iteration
}

/// TLS material for `ejfats://` control planes. All parts are optional PEM
/// strings; when `validate_server` is false on the manager (or the CP is
/// dialed by address), server-name pinning is skipped and a custom root is
/// the only way to accept self-signed servers.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub root_certificate: Option<String>,
    pub client_key: Option<String>,
    pub client_certificate: Option<String>,
}

impl TlsOptions {
    /// Read PEM files into options; any path may be empty.
    pub fn from_files(
        root_certificate: Option<&str>,
        client_key: Option<&str>,
        client_certificate: Option<&str>,
    ) -> Result<TlsOptions> {
        let read = |p: Option<&str>| -> Result<Option<String>> {
            match p {
                None | Some("") => Ok(None),
                Some(path) => std::fs::read_to_string(path).map(Some).map_err(|_| {
                    E2sarError::NotFound(format!("unable to open file {}", path))
                }),
            }
        };
        Ok(TlsOptions {
            root_certificate: read(root_certificate)?,
            client_key: read(client_key)?,
            client_certificate: read(client_certificate)?,
        })
    }
}

/// Status of one worker as reported by `LoadBalancerStatus`.
#[derive(Debug, Clone)]
pub struct WorkerStatusItem {
    pub name: String,
    pub fill_percent: f32,
    pub control_signal: f32,
    pub slots_assigned: u32,
    pub last_updated: Option<Timestamp>,
}

/// Plain-struct rendering of a `LoadBalancerStatusReply`.
#[derive(Debug, Clone, Default)]
pub struct LbStatus {
    pub timestamp: Option<Timestamp>,
    pub current_epoch: u64,
    pub current_predicted_event_number: u64,
    pub workers: Vec<WorkerStatusItem>,
    pub sender_addresses: Vec<String>,
    pub expires_at: Option<Timestamp>,
}

impl From<proto::LoadBalancerStatusReply> for LbStatus {
    fn from(rep: proto::LoadBalancerStatusReply) -> Self {
        LbStatus {
            timestamp: rep.timestamp,
            current_epoch: rep.current_epoch,
            current_predicted_event_number: rep.current_predicted_event_number,
            workers: rep
                .workers
                .into_iter()
                .map(|w| WorkerStatusItem {
                    name: w.name,
                    fill_percent: w.fill_percent,
                    control_signal: w.control_signal,
                    slots_assigned: w.slots_assigned,
                    last_updated: w.last_updated,
                })
                .collect(),
            sender_addresses: rep.sender_addresses,
            expires_at: rep.expires_at,
        }
    }
}

/// One reserved LB instance from `Overview`.
#[derive(Debug, Clone)]
pub struct OverviewEntry {
    pub name: String,
    pub lb_id: String,
    pub sync_addr: Option<(IpAddr, u16)>,
    pub data_ipv4: Option<IpAddr>,
    pub data_ipv6: Option<IpAddr>,
    pub fpga_lb_id: u32,
    pub status: LbStatus,
}

pub struct LbManager {
    uri: EjfatUri,
    validate_server: bool,
    tls: TlsOptions,
    endpoint: String,
    /// server name for TLS verification, when the CP was named by DNS
    domain: Option<String>,
    runtime: tokio::runtime::Runtime,
    client: Option<LoadBalancerClient>,
}


macro_rules! rpc {
    ($self:ident, $method:ident, $req:expr, $ctx:literal) => {{
        $self.connect()?;
        $self
            .runtime
            .block_on($self.client.as_mut().unwrap().$method($req))
            .map_err(|s| E2sarError::Rpc(format!("error in {}: {}", $ctx, s.message())))
    }};
}

impl LbManager {
    /// Build a manager for the control plane named by `uri`.
    ///
    /// `validate_server = false` skips server-name pinning (for self-signed
    /// test servers); `use_host_address = true` resolves a DNS CP host
    /// client-side, dials the IP literal and implies no server validation.
    pub fn new(
        uri: EjfatUri,
        validate_server: bool,
        use_host_address: bool,
        tls: TlsOptions,
    ) -> Result<LbManager> {
        let mut validate_server = validate_server;
        if use_host_address {
            validate_server = false;
        }

        let scheme = if uri.use_tls() { "https" } else { "http" };
        let (endpoint, domain) = if !use_host_address {
            if let Ok((host, port)) = uri.cp_host() {
                (format!("{}://{}:{}", scheme, host, port), Some(host))
            } else {
                let (addr, port) = uri.cp_addr()?;
                (format_addr_endpoint(scheme, addr, port), None)
            }
        } else {
            let (addr, port) = uri.cp_addr()?;
            (format_addr_endpoint(scheme, addr, port), None)
        };

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| E2sarError::CaughtException(format!("unable to build runtime: {}", e)))?;

        Ok(LbManager {
            uri,
            validate_server,
            tls,
            endpoint,
            domain,
            runtime,
            client: None,
        })
    }

    /// The managed URI, including fields written back by the CP.
    pub fn uri(&self) -> &EjfatUri {
        &self.uri
    }

    fn connect(&mut self) -> Result<&mut LoadBalancerClient> {
        if self.client.is_none() {
            let mut endpoint = Endpoint::from_shared(self.endpoint.clone())
                .map_err(|e| E2sarError::Parameter(format!("bad CP endpoint: {}", e)))?;
            if self.uri.use_tls() {
                let mut tls = ClientTlsConfig::new();
                if let Some(ca) = &self.tls.root_certificate {
                    tls = tls.ca_certificate(Certificate::from_pem(ca));
                }
                if let (Some(cert), Some(key)) =
                    (&self.tls.client_certificate, &self.tls.client_key)
                {
                    tls = tls.identity(Identity::from_pem(cert, key));
                }
                if self.validate_server {
                    if let Some(domain) = &self.domain {
                        tls = tls.domain_name(domain.clone());
                    }
                }
                endpoint = endpoint
                    .tls_config(tls)
                    .map_err(|e| E2sarError::Rpc(format!("TLS configuration: {}", e)))?;
            }
            let channel: Channel = self
                .runtime
                .block_on(endpoint.connect())
                .map_err(|e| E2sarError::Rpc(format!("error connecting to LB CP: {}", e)))?;
            self.client = Some(LoadBalancerClient::new(channel));
        }
        Ok(self.client.as_mut().unwrap())
    }

    fn token_for(&self, tt: TokenType) -> Result<String> {
        self.uri.token(tt)
    }

    /// Reserve a new LB instance for `duration`, allowing `senders` to feed
    /// it. On success the URI gains the instance token, LB id, sync address
    /// and data addresses; the FPGA LB id is returned.
    pub fn reserve_lb(
        &mut self,
        lb_name: &str,
        duration: Duration,
        senders: &[String],
    ) -> Result<u32> {
        let token = self.token_for(TokenType::Admin)?;
        for s in senders {
            s.parse::<IpAddr>()
                .map_err(|_| E2sarError::Parameter(format!("invalid sender IP address {}", s)))?;
        }
        let req = proto::ReserveLoadBalancerRequest {
            token: String::new(),
            name: lb_name.to_string(),
            until: Some(timestamp_after(duration)),
            sender_addresses: senders.to_vec(),
        };
        let req = with_bearer(req, &token)?;
        self.uri.set_lb_name(lb_name);
        let rep = rpc!(self, reserve_load_balancer, req, "reserveLB()")?;

        let fpga_lb_id = rep.fpga_lb_id;
        self.absorb_reservation(rep)?;
        Ok(fpga_lb_id)
    }

    /// Fold a reservation reply into the URI.
    fn absorb_reservation(&mut self, rep: proto::ReserveLoadBalancerReply) -> Result<()> {
        if !rep.token.is_empty() {
            self.uri.set_instance_token(&rep.token);
        }
        if !rep.lb_id.is_empty() {
            self.uri.set_lb_id(&rep.lb_id);
        }
        if !rep.sync_ip_address.is_empty() {
            let addr: IpAddr = rep.sync_ip_address.parse().map_err(|_| {
                E2sarError::Parameter(format!("bad sync address {}", rep.sync_ip_address))
            })?;
            self.uri.set_sync_addr(addr, rep.sync_udp_port as u16);
        }
        if !rep.data_ipv4_address.is_empty() {
            let addr: IpAddr = rep.data_ipv4_address.parse().map_err(|_| {
                E2sarError::Parameter(format!("bad data address {}", rep.data_ipv4_address))
            })?;
            self.uri.set_data_addr(addr);
        }
        if !rep.data_ipv6_address.is_empty() {
            let addr: IpAddr = rep.data_ipv6_address.parse().map_err(|_| {
                E2sarError::Parameter(format!("bad data address {}", rep.data_ipv6_address))
            })?;
            self.uri.set_data_addr(addr);
        }
        Ok(())
    }

    fn lb_id_or(&self, lb_id: Option<&str>) -> Result<String> {
        match lb_id {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ if !self.uri.lb_id().is_empty() => Ok(self.uri.lb_id().to_string()),
            _ => Err(E2sarError::ParameterNotAvailable(
                "LB ID not available - have you reserved it previously?".to_string(),
            )),
        }
    }

    /// Look up an existing LB, updating the URI's sync/data addresses just
    /// like `reserve_lb` (no instance token is issued by the CP here).
    pub fn get_lb(&mut self, lb_id: Option<&str>) -> Result<()> {
        let token = self.token_for(TokenType::Admin)?;
        let id = self.lb_id_or(lb_id)?;
        let req = with_bearer(
            proto::GetLoadBalancerRequest { token: String::new(), lb_id: id },
            &token,
        )?;
        let rep = rpc!(self, get_load_balancer, req, "getLB()")?;
        self.absorb_reservation(rep)
    }

    /// Release a reserved LB.
    pub fn free_lb(&mut self, lb_id: Option<&str>) -> Result<()> {
        let token = self.token_for(TokenType::Admin)?;
        let id = self.lb_id_or(lb_id)?;
        let req = with_bearer(
            proto::FreeLoadBalancerRequest { token: String::new(), lb_id: id },
            &token,
        )?;
        rpc!(self, free_load_balancer, req, "freeLB()")?;
        Ok(())
    }

    /// Current status of an LB: workers, senders, epoch and expiry.
    pub fn get_lb_status(&mut self, lb_id: Option<&str>) -> Result<LbStatus> {
        let token = self.token_for(TokenType::Admin)?;
        let id = self.lb_id_or(lb_id)?;
        let req = with_bearer(
            proto::LoadBalancerStatusRequest { token: String::new(), lb_id: id },
            &token,
        )?;
        let rep = rpc!(self, load_balancer_status, req, "getLBStatus()")?;
        Ok(rep.into())
    }

    /// Overview of all reserved LB instances.
    pub fn overview(&mut self) -> Result<Vec<OverviewEntry>> {
        let token = self.token_for(TokenType::Admin)?;
        let req = with_bearer(proto::OverviewRequest { token: String::new() }, &token)?;
        let rep = rpc!(self, overview, req, "overview()")?;

        let mut out = Vec::with_capacity(rep.load_balancers.len());
        for lb in rep.load_balancers {
            let reservation = lb.reservation.unwrap_or_default();
            let sync_addr = reservation
                .sync_ip_address
                .parse::<IpAddr>()
                .ok()
                .map(|a| (a, reservation.sync_udp_port as u16));
            out.push(OverviewEntry {
                name: lb.name,
                lb_id: reservation.lb_id,
                sync_addr,
                data_ipv4: reservation.data_ipv4_address.parse().ok(),
                data_ipv6: reservation.data_ipv6_address.parse().ok(),
                fpga_lb_id: reservation.fpga_lb_id,
                status: lb.status.unwrap_or_default().into(),
            });
        }
        Ok(out)
    }

    /// Allow more sender addresses to feed the LB.
    pub fn add_senders(&mut self, senders: &[String]) -> Result<()> {
        self.change_senders(senders, true)
    }

    /// Disallow sender addresses.
    pub fn remove_senders(&mut self, senders: &[String]) -> Result<()> {
        self.change_senders(senders, false)
    }

    fn change_senders(&mut self, senders: &[String], add: bool) -> Result<()> {
        let token = self.token_for(TokenType::Admin)?;
        let id = self.lb_id_or(None)?;
        for s in senders {
            s.parse::<IpAddr>()
                .map_err(|_| E2sarError::Parameter(format!("invalid sender IP address {}", s)))?;
        }
        if add {
            let req = with_bearer(
                proto::AddSendersRequest {
                    token: String::new(),
                    lb_id: id,
                    sender_addresses: senders.to_vec(),
                },
                &token,
            )?;
            rpc!(self, add_senders, req, "addSenders()")?;
        } else {
            let req = with_bearer(
                proto::RemoveSendersRequest {
                    token: String::new(),
                    lb_id: id,
                    sender_addresses: senders.to_vec(),
                },
                &token,
            )?;
            rpc!(self, remove_senders, req, "removeSenders()")?;
        }
        Ok(())
    }

    /// Register this worker with the LB. Uses the instance token; on success
    /// the session id and session token land on the URI. A registered worker
    /// must send its first state update within 10 s or the CP deregisters it.
    pub fn register_worker(
        &mut self,
        node_name: &str,
        node_addr: (IpAddr, u16),
        weight: f32,
        source_count: usize,
        min_factor: f32,
        max_factor: f32,
    ) -> Result<()> {
        let token = self.token_for(TokenType::Instance)?;
        let id = self.lb_id_or(None)?;
        let req = with_bearer(
            proto::RegisterRequest {
                token: String::new(),
                lb_id: id,
                name: node_name.to_string(),
                weight,
                ip_address: node_addr.0.to_string(),
                udp_port: node_addr.1 as u32,
                port_range: port_range_from_source_count(source_count),
                min_factor,
                max_factor,
            },
            &token,
        )?;
        let rep = rpc!(self, register, req, "registerWorker()")?;
        if !rep.token.is_empty() {
            self.uri.set_session_token(&rep.token);
        }
        if !rep.session_id.is_empty() {
            self.uri.set_session_id(&rep.session_id);
        }
        Ok(())
    }

    /// Deregister the worker registered on this URI.
    pub fn deregister_worker(&mut self) -> Result<()> {
        let token = self.token_for(TokenType::Session)?;
        let id = self.lb_id_or(None)?;
        let session_id = self.uri.session_id().to_string();
        if session_id.is_empty() {
            return Err(E2sarError::ParameterNotAvailable(
                "session id not available - have you registered this worker?".to_string(),
            ));
        }
        let req = with_bearer(
            proto::DeregisterRequest { token: String::new(), lb_id: id, session_id },
            &token,
        )?;
        rpc!(self, deregister, req, "deregisterWorker()")?;
        Ok(())
    }

    /// Send a worker state sample, stamped with the local clock.
    pub fn send_state(&mut self, fill_percent: f32, control_signal: f32, is_ready: bool) -> Result<()> {
        self.send_state_at(fill_percent, control_signal, is_ready, SystemTime::now())
    }

    /// Send a worker state sample with an explicit timestamp.
    pub fn send_state_at(
        &mut self,
        fill_percent: f32,
        control_signal: f32,
        is_ready: bool,
        when: SystemTime,
    ) -> Result<()> {
        let token = self.token_for(TokenType::Session)?;
        let session_id = self.uri.session_id().to_string();
        if session_id.is_empty() {
            return Err(E2sarError::ParameterNotAvailable(
                "session id not available - have you registered this worker?".to_string(),
            ));
        }
        let req = with_bearer(
            proto::SendStateRequest {
                token: String::new(),
                session_id,
                timestamp: Some(timestamp_from(when)),
                fill_percent,
                control_signal,
                is_ready,
            },
            &token,
        )?;
        rpc!(self, send_state, req, "sendState()")?;
        Ok(())
    }

    /// Control plane version triple: (commit, build, compatTag).
    pub fn version(&mut self) -> Result<(String, String, String)> {
        let token = self.token_for(TokenType::Admin)?;
        let req = with_bearer(proto::VersionRequest {}, &token)?;
        let rep = rpc!(self, version, req, "version()")?;
        Ok((rep.commit, rep.build, rep.compat_tag))
    }
}

fn format_addr_endpoint(scheme: &str, addr: IpAddr, port: u16) -> String {
    match addr {
        IpAddr::V4(a) => format!("{}://{}:{}", scheme, a, port),
        IpAddr::V6(a) => format!("{}://[{}]:{}", scheme, a, port),
    }
}

/// Attach `authorization: Bearer <token>` metadata to a request.
fn with_bearer<T>(msg: T, token: &str) -> Result<Request<T>> {
    let mut req = Request::new(msg);
    let value: MetadataValue<_> = format!("Bearer {}", token)
        .parse()
        .map_err(|_| E2sarError::Parameter("token not valid in a metadata header".to_string()))?;
    req.metadata_mut().insert("authorization", value);
    Ok(req)
}

fn timestamp_from(t: SystemTime) -> Timestamp {
    let d = t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
    Timestamp { seconds: d.as_secs() as i64, nanos: d.subsec_nanos() as i32 }
}

fn timestamp_after(duration: Duration) -> Timestamp {
    timestamp_from(SystemTime::now() + duration)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uri(s: &str) -> EjfatUri {
        EjfatUri::parse(s, TokenType::Admin, false).unwrap()
    }

    #[test]
    fn test_port_range_edges() {
        assert_eq!(port_range_from_source_count(0), 0);
        assert_eq!(port_range_from_source_count(1), 0);
        assert_eq!(port_range_from_source_count(2), 1);
        assert_eq!(port_range_from_source_count(3), 2);
        assert_eq!(port_range_from_source_count(7), 3);
        assert_eq!(port_range_from_source_count(8), 3);
        assert_eq!(port_range_from_source_count(1024), 10);
        assert_eq!(port_range_from_source_count(16384), 14);
        assert_eq!(port_range_from_source_count(16385), 14);
        assert_eq!(port_range_from_source_count(usize::MAX), 14);
    }

    #[test]
    fn test_bearer_metadata() {
        let req = with_bearer(proto::VersionRequest {}, "abc123").unwrap();
        assert_eq!(
            req.metadata().get("authorization").unwrap().to_str().unwrap(),
            "Bearer abc123"
        );
    }

    #[test]
    fn test_missing_admin_token_refused_before_dialing() {
        let mut m = LbManager::new(
            uri("ejfat://192.0.2.1:18020/lb/1"),
            true,
            false,
            TlsOptions::default(),
        )
        .unwrap();
        let e = m.reserve_lb("lb", Duration::from_secs(60), &[]).unwrap_err();
        assert!(matches!(e, E2sarError::ParameterNotAvailable(_)));
    }

    #[test]
    fn test_missing_session_token_refused() {
        let mut m = LbManager::new(
            uri("ejfat://tok@192.0.2.1:18020/lb/1"),
            true,
            false,
            TlsOptions::default(),
        )
        .unwrap();
        let e = m.send_state(0.1, 0.0, true).unwrap_err();
        assert!(matches!(e, E2sarError::ParameterNotAvailable(_)));
    }

    #[test]
    fn test_invalid_sender_address_rejected() {
        let mut m = LbManager::new(
            uri("ejfat://tok@192.0.2.1:18020/lb/1"),
            true,
            false,
            TlsOptions::default(),
        )
        .unwrap();
        let e = m
            .reserve_lb("lb", Duration::from_secs(60), &["not-an-ip".to_string()])
            .unwrap_err();
        assert!(matches!(e, E2sarError::Parameter(_)));
    }

    #[test]
    fn test_missing_lb_id_detected() {
        let mut m = LbManager::new(
            uri("ejfat://tok@192.0.2.1:18020"),
            true,
            false,
            TlsOptions::default(),
        )
        .unwrap();
        let e = m.free_lb(None).unwrap_err();
        assert!(matches!(e, E2sarError::ParameterNotAvailable(_)));
    }

    #[test]
    fn test_endpoint_formatting() {
        assert_eq!(
            format_addr_endpoint("http", "10.0.0.1".parse().unwrap(), 18020),
            "http://10.0.0.1:18020"
        );
        assert_eq!(
            format_addr_endpoint("https", "2001:db8::1".parse().unwrap(), 18020),
            "https://[2001:db8::1]:18020"
        );
    }

    #[test]
    fn test_absorb_reservation_updates_uri() {
        let mut m = LbManager::new(
            uri("ejfat://tok@192.0.2.1:18020"),
            true,
            false,
            TlsOptions::default(),
        )
        .unwrap();
        m.absorb_reservation(proto::ReserveLoadBalancerReply {
            token: "itoken".into(),
            lb_id: "42".into(),
            sync_ip_address: "192.0.2.5".into(),
            sync_udp_port: 19020,
            data_ipv4_address: "192.0.2.6".into(),
            data_ipv6_address: "2001:db8::6".into(),
            fpga_lb_id: 9,
        })
        .unwrap();
        let u = m.uri();
        assert_eq!(u.lb_id(), "42");
        assert_eq!(u.token(TokenType::Instance).unwrap(), "itoken");
        assert_eq!(u.sync_addr().unwrap(), ("192.0.2.5".parse().unwrap(), 19020));
        assert!(u.has_data_addr_v4() && u.has_data_addr_v6());
    }
}
