//! `ejfat[s]://` URI parsing and serialization.
//!
//! The URI is the persistent configuration record tying a Segmenter or
//! Reassembler to a control plane and LB instance:
//!
//! ```text
//! ejfat[s]://[<token>@]<cphost>:<cpport>/[lb/<lbid>]
//!            [?data=<addr>[:<port>](&data=<addr>[:<port>])?
//!             &sync=<addr>:<port>&sessionid=<id>]
//! ```
//!
//! Addresses are literal IPv4, bracketed IPv6, or a DNS name for the CP. At
//! most one IPv4 and one IPv6 data address are kept. Three distinct token
//! slots (admin, instance, session) live on the URI; parsing assigns the
//! `<token>@` prefix to the slot named by the caller's hint and serializing
//! renders exactly one slot.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, ToSocketAddrs};

use crate::error::{E2sarError, Result};

/// Default dataplane UDP port.
pub const DATAPLANE_PORT: u16 = 19522;

/// Default environment variable consulted by [`EjfatUri::from_env`].
pub const EJFAT_URI_ENV: &str = "EJFAT_URI";

/// Conventional URI file location for [`EjfatUri::from_file`].
pub const EJFAT_URI_FILE: &str = "/tmp/ejfat_uri";

/// The three capability levels the control plane distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenType {
    /// reserve/free/get/status/overview
    Admin = 0,
    /// registerWorker
    Instance = 1,
    /// sendState/deregister
    Session = 2,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EjfatUri {
    use_tls: bool,
    prefer_v6: bool,
    cp_host: Option<String>,
    cp_addr: Option<IpAddr>,
    cp_port: u16,
    lb_name: String,
    lb_id: String,
    session_id: String,
    tokens: [String; 3],
    sync_addr: Option<(IpAddr, u16)>,
    data_addr_v4: Option<Ipv4Addr>,
    data_addr_v6: Option<Ipv6Addr>,
    data_port: u16,
}

/// Strip optional square brackets and parse an IP address.
fn string_to_ip(s: &str) -> Result<IpAddr> {
    let stripped = if s.starts_with('[') && s.ends_with(']') {
        &s[1..s.len() - 1]
    } else {
        s
    };
    stripped
        .parse()
        .map_err(|_| E2sarError::Parameter(format!("unable to convert IP address from {}", s)))
}

/// Parse a port, checking the unprivileged range.
fn string_to_port(s: &str) -> Result<u16> {
    let port: u32 = s
        .parse()
        .map_err(|_| E2sarError::Parameter(format!("unable to convert {} to integer", s)))?;
    if !(1024..=65535).contains(&port) {
        return Err(E2sarError::OutOfRange(format!("port value {} is out of range", s)));
    }
    Ok(port as u16)
}

/// Split `host[:port]` where host may be a bracketed IPv6 literal that itself
/// contains colons. The split point is the last of `]` or `:`.
fn split_host_port(s: &str) -> (&str, Option<&str>) {
    match s.rfind([']', ':']) {
        Some(pos) if s.as_bytes()[pos] == b':' => (&s[..pos], Some(&s[pos + 1..])),
        _ => (s, None),
    }
}

/// Resolve a DNS name to all of its addresses.
pub fn resolve_host(host: &str) -> Result<Vec<IpAddr>> {
    let addrs: Vec<IpAddr> = (host, 443u16)
        .to_socket_addrs()
        .map_err(|_| E2sarError::NotFound(format!("unable to convert {} to ip address", host)))?
        .map(|sa| sa.ip())
        .collect();
    if addrs.is_empty() {
        return Err(E2sarError::NotFound(format!("unable to convert {} to ip address", host)));
    }
    Ok(addrs)
}

impl EjfatUri {
    /// Parse a URI string. `token_type` decides which slot receives the
    /// `<token>@` prefix; `prefer_v6` selects the IPv6 address when the CP
    /// host is a DNS name resolving to both families.
    pub fn parse(uri: &str, token_type: TokenType, prefer_v6: bool) -> Result<EjfatUri> {
        let (use_tls, rest) = if let Some(r) = uri.strip_prefix("ejfats://") {
            (true, r)
        } else if let Some(r) = uri.strip_prefix("ejfat://") {
            (false, r)
        } else {
            return Err(E2sarError::Parse(format!("unrecognized URI scheme in {}", uri)));
        };

        let mut out = EjfatUri {
            use_tls,
            prefer_v6,
            data_port: DATAPLANE_PORT,
            ..EjfatUri::default()
        };

        let (before_query, query) = match rest.split_once('?') {
            Some((b, q)) => (b, Some(q)),
            None => (rest, None),
        };

        let (authority, path) = match before_query.split_once('/') {
            Some((a, p)) => (a, p),
            None => (before_query, ""),
        };

        // optional token@ prefix
        let hostport = match authority.rsplit_once('@') {
            Some((token, hp)) => {
                if token.is_empty() {
                    return Err(E2sarError::Parse("empty token in URI".to_string()));
                }
                out.tokens[token_type as usize] = token.to_string();
                hp
            }
            None => authority,
        };

        let (host, port) = split_host_port(hostport);
        let port = port.ok_or_else(|| {
            E2sarError::Parse(format!("control plane port missing in {}", hostport))
        })?;
        out.cp_port = string_to_port(port)?;
        if host.is_empty() {
            return Err(E2sarError::Parse("control plane host missing".to_string()));
        }
        match string_to_ip(host) {
            Ok(addr) => out.cp_addr = Some(addr),
            // not a literal; keep the DNS name and resolve lazily
            Err(_) => out.cp_host = Some(host.to_string()),
        }

        // path is either empty, "/" leftovers, or lb/<id>
        if !path.is_empty() {
            if let Some(id) = path.strip_prefix("lb/") {
                if id.is_empty() {
                    return Err(E2sarError::Parse("empty LB id in URI".to_string()));
                }
                out.lb_id = id.to_string();
            } else if !path.chars().all(|c| c == '/') {
                return Err(E2sarError::Parse(format!("unexpected URI path {}", path)));
            }
        }

        if let Some(query) = query {
            for kv in query.split('&') {
                let (key, value) = kv
                    .split_once('=')
                    .ok_or_else(|| E2sarError::Parse(format!("malformed query item {}", kv)))?;
                match key {
                    "data" => {
                        let (addr, port) = split_host_port(value);
                        match string_to_ip(addr)? {
                            IpAddr::V4(a) => out.data_addr_v4 = Some(a),
                            IpAddr::V6(a) => out.data_addr_v6 = Some(a),
                        }
                        if let Some(p) = port {
                            out.data_port = string_to_port(p)?;
                        }
                    }
                    "sync" => {
                        let (addr, port) = split_host_port(value);
                        let port = port.ok_or_else(|| {
                            E2sarError::Parse(format!("sync port missing in {}", value))
                        })?;
                        out.sync_addr = Some((string_to_ip(addr)?, string_to_port(port)?));
                    }
                    "sessionid" => out.session_id = value.to_string(),
                    // unknown query keys are ignored
                    _ => {}
                }
            }
        }

        Ok(out)
    }

    /// Parse from a string (alias of [`EjfatUri::parse`] matching the
    /// original API family).
    pub fn from_string(uri: &str, token_type: TokenType, prefer_v6: bool) -> Result<EjfatUri> {
        Self::parse(uri, token_type, prefer_v6)
    }

    /// Parse the URI held in an environment variable (default `EJFAT_URI`).
    pub fn from_env(var: Option<&str>, token_type: TokenType, prefer_v6: bool) -> Result<EjfatUri> {
        let var = var.unwrap_or(EJFAT_URI_ENV);
        match std::env::var(var) {
            Ok(v) => Self::parse(&v, token_type, prefer_v6),
            Err(_) => Err(E2sarError::NotFound(format!(
                "environment variable {} not defined",
                var
            ))),
        }
    }

    /// Parse the URI from the first line of a file (default `/tmp/ejfat_uri`).
    pub fn from_file(path: Option<&str>, token_type: TokenType, prefer_v6: bool) -> Result<EjfatUri> {
        let path = path.unwrap_or(EJFAT_URI_FILE);
        let contents = std::fs::read_to_string(path)
            .map_err(|_| E2sarError::NotFound(format!("unable to find file {}", path)))?;
        let line = contents
            .lines()
            .next()
            .ok_or_else(|| E2sarError::Undefined("unable to parse URI".to_string()))?;
        Self::parse(line.trim(), token_type, prefer_v6)
    }

    /// Serialize, exporting exactly the requested token slot (if set).
    pub fn to_string_with(&self, token_type: TokenType) -> String {
        let mut out = String::from(if self.use_tls { "ejfats://" } else { "ejfat://" });
        let token = &self.tokens[token_type as usize];
        if !token.is_empty() {
            out.push_str(token);
            out.push('@');
        }
        match (&self.cp_host, &self.cp_addr) {
            (Some(host), _) => out.push_str(host),
            (None, Some(IpAddr::V6(a))) => out.push_str(&format!("[{}]", a)),
            (None, Some(IpAddr::V4(a))) => out.push_str(&a.to_string()),
            (None, None) => {}
        }
        out.push_str(&format!(":{}", self.cp_port));
        if !self.lb_id.is_empty() {
            out.push_str(&format!("/lb/{}", self.lb_id));
        }
        let mut sep = '?';
        let mut push_kv = |out: &mut String, k: &str, v: String| {
            out.push(sep);
            out.push_str(k);
            out.push('=');
            out.push_str(&v);
            sep = '&';
        };
        if let Some(a) = self.data_addr_v4 {
            let v = if self.data_port != DATAPLANE_PORT {
                format!("{}:{}", a, self.data_port)
            } else {
                a.to_string()
            };
            push_kv(&mut out, "data", v);
        }
        if let Some(a) = self.data_addr_v6 {
            let v = if self.data_port != DATAPLANE_PORT {
                format!("[{}]:{}", a, self.data_port)
            } else {
                format!("[{}]", a)
            };
            push_kv(&mut out, "data", v);
        }
        if let Some((addr, port)) = self.sync_addr {
            let v = match addr {
                IpAddr::V6(a) => format!("[{}]:{}", a, port),
                IpAddr::V4(a) => format!("{}:{}", a, port),
            };
            push_kv(&mut out, "sync", v);
        }
        if !self.session_id.is_empty() {
            push_kv(&mut out, "sessionid", self.session_id.clone());
        }
        out
    }

    pub fn use_tls(&self) -> bool {
        self.use_tls
    }

    pub fn prefer_v6(&self) -> bool {
        self.prefer_v6
    }

    /// Control plane address and port. Resolves the CP host if the URI named
    /// it by DNS, preferring the family selected at parse time.
    pub fn cp_addr(&self) -> Result<(IpAddr, u16)> {
        if let Some(addr) = self.cp_addr {
            return Ok((addr, self.cp_port));
        }
        let host = self.cp_host.as_ref().ok_or_else(|| {
            E2sarError::ParameterNotAvailable("control plane address not available".to_string())
        })?;
        let addrs = resolve_host(host)?;
        let pick = addrs
            .iter()
            .find(|a| if self.prefer_v6 { a.is_ipv6() } else { a.is_ipv4() })
            .or_else(|| addrs.first())
            .copied()
            .ok_or_else(|| E2sarError::NotFound(format!("no addresses for {}", host)))?;
        Ok((pick, self.cp_port))
    }

    /// Control plane hostname and port, when the URI named a DNS host.
    pub fn cp_host(&self) -> Result<(String, u16)> {
        match &self.cp_host {
            Some(h) => Ok((h.clone(), self.cp_port)),
            None => Err(E2sarError::ParameterNotAvailable(
                "control plane hostname not available".to_string(),
            )),
        }
    }

    pub fn has_data_addr_v4(&self) -> bool {
        self.data_addr_v4.is_some()
    }

    pub fn has_data_addr_v6(&self) -> bool {
        self.data_addr_v6.is_some()
    }

    pub fn has_data_addr(&self) -> bool {
        self.data_addr_v4.is_some() || self.data_addr_v6.is_some()
    }

    pub fn has_sync_addr(&self) -> bool {
        self.sync_addr.is_some()
    }

    pub fn data_addr_v4(&self) -> Result<(Ipv4Addr, u16)> {
        self.data_addr_v4
            .map(|a| (a, self.data_port))
            .ok_or_else(|| {
                E2sarError::ParameterNotAvailable("data plane address not available".to_string())
            })
    }

    pub fn data_addr_v6(&self) -> Result<(Ipv6Addr, u16)> {
        self.data_addr_v6
            .map(|a| (a, self.data_port))
            .ok_or_else(|| {
                E2sarError::ParameterNotAvailable("data plane address not available".to_string())
            })
    }

    pub fn sync_addr(&self) -> Result<(IpAddr, u16)> {
        self.sync_addr.ok_or_else(|| {
            E2sarError::ParameterNotAvailable("sync address not available".to_string())
        })
    }

    pub fn lb_id(&self) -> &str {
        &self.lb_id
    }

    pub fn lb_name(&self) -> &str {
        &self.lb_name
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn token(&self, token_type: TokenType) -> Result<String> {
        let t = &self.tokens[token_type as usize];
        if t.is_empty() {
            let name = match token_type {
                TokenType::Admin => "admin",
                TokenType::Instance => "instance",
                TokenType::Session => "session",
            };
            Err(E2sarError::ParameterNotAvailable(format!("{} token not available", name)))
        } else {
            Ok(t.clone())
        }
    }

    pub fn set_token(&mut self, token_type: TokenType, token: &str) {
        self.tokens[token_type as usize] = token.to_string();
    }

    pub fn set_instance_token(&mut self, token: &str) {
        self.set_token(TokenType::Instance, token);
    }

    pub fn set_session_token(&mut self, token: &str) {
        self.set_token(TokenType::Session, token);
    }

    pub fn set_lb_name(&mut self, name: &str) {
        self.lb_name = name.to_string();
    }

    pub fn set_lb_id(&mut self, id: &str) {
        self.lb_id = id.to_string();
    }

    pub fn set_session_id(&mut self, id: &str) {
        self.session_id = id.to_string();
    }

    pub fn set_sync_addr(&mut self, addr: IpAddr, port: u16) {
        self.sync_addr = Some((addr, port));
    }

    /// Record a data plane address; one v4 and one v6 slot are kept.
    pub fn set_data_addr(&mut self, addr: IpAddr) {
        match addr {
            IpAddr::V4(a) => self.data_addr_v4 = Some(a),
            IpAddr::V6(a) => self.data_addr_v6 = Some(a),
        }
    }
}

impl std::fmt::Display for EjfatUri {
    /// Prints the session token if set, otherwise instance, otherwise admin.
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tt = if !self.tokens[TokenType::Session as usize].is_empty() {
            TokenType::Session
        } else if !self.tokens[TokenType::Instance as usize].is_empty() {
            TokenType::Instance
        } else {
            TokenType::Admin
        };
        write!(f, "{}", self.to_string_with(tt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const URI1: &str = "ejfat://token@192.188.29.6:18020/lb/36?sync=192.188.29.6:19020&data=192.188.29.20";

    #[test]
    fn test_parse_full_uri() {
        let u = EjfatUri::parse(URI1, TokenType::Admin, false).unwrap();
        assert_eq!(u.token(TokenType::Admin).unwrap(), "token");
        assert_eq!(u.lb_id(), "36");
        assert_eq!(u.cp_addr().unwrap(), ("192.188.29.6".parse().unwrap(), 18020));
        assert_eq!(u.data_addr_v4().unwrap(), ("192.188.29.20".parse().unwrap(), DATAPLANE_PORT));
        assert_eq!(u.sync_addr().unwrap(), ("192.188.29.6".parse().unwrap(), 19020));
        assert!(!u.use_tls());
    }

    #[test]
    fn test_parse_rejects_unknown_scheme() {
        assert!(EjfatUri::parse(
            "ejfact://token@192.188.29.6:18020/lb/36",
            TokenType::Admin,
            false
        )
        .is_err());
    }

    #[test]
    fn test_parse_sync_only() {
        let u = EjfatUri::parse(
            "ejfat://token@192.188.29.6:18020/lb/36?sync=192.188.29.6:19020",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert!(u.data_addr_v4().is_err());
        assert!(u.has_sync_addr());
    }

    #[test]
    fn test_parse_data_only() {
        let u = EjfatUri::parse(
            "ejfat://token@192.188.29.6:18020/lb/36?data=192.188.29.20",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert!(u.sync_addr().is_err());
        assert_eq!(u.data_addr_v4().unwrap().1, DATAPLANE_PORT);
    }

    #[test]
    fn test_parse_no_query_no_lb() {
        for s in [
            "ejfat://token@192.188.29.6:18020/",
            "ejfat://token@192.188.29.6:18020",
        ] {
            let u = EjfatUri::parse(s, TokenType::Admin, false).unwrap();
            assert!(u.lb_id().is_empty());
            assert!(u.data_addr_v4().is_err());
            assert!(u.sync_addr().is_err());
        }
    }

    #[test]
    fn test_parse_no_token() {
        let u = EjfatUri::parse(
            "ejfat://192.188.29.6:18020/lb/36?sync=192.188.29.6:19020",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert!(u.token(TokenType::Admin).is_err());
    }

    #[test]
    fn test_parse_ipv6() {
        let u = EjfatUri::parse(
            "ejfat://[2001:4860:0:2001::68]:18020/lb/36?data=[2001:4860:0:2021::68]&sync=[2001:4860:0:2031::68]:19020",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert_eq!(u.cp_addr().unwrap().0, "2001:4860:0:2001::68".parse::<IpAddr>().unwrap());
        assert_eq!(
            u.data_addr_v6().unwrap().0,
            "2001:4860:0:2021::68".parse::<Ipv6Addr>().unwrap()
        );
        assert!(u.data_addr_v4().is_err());
    }

    #[test]
    fn test_parse_tls_and_hostname() {
        let u = EjfatUri::parse(
            "ejfats://ejfat-lb.es.net:18020/lb/36?sync=192.188.29.6:19020",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert!(u.use_tls());
        assert_eq!(u.cp_host().unwrap(), ("ejfat-lb.es.net".to_string(), 18020));
    }

    #[test]
    fn test_parse_session_id() {
        let u = EjfatUri::parse(
            "ejfats://ejfat-lb.es.net:18020/lb/36?sync=192.188.29.6:19020&sessionid=mysessionid",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert_eq!(u.session_id(), "mysessionid");
    }

    #[test]
    fn test_parse_dual_stack_data_and_port() {
        let u = EjfatUri::parse(
            "ejfats://89f9afdb6972597@ejfat-lb.es.net:18008/lb/17?sync=192.188.29.6:19010&data=192.188.29.10&data=[2001:400:a300::10]:10000",
            TokenType::Admin,
            false,
        )
        .unwrap();
        assert!(u.has_data_addr_v4());
        assert!(u.has_data_addr_v6());
        assert_eq!(u.data_addr_v6().unwrap().1, 10000);
    }

    #[test]
    fn test_port_out_of_range() {
        let e = EjfatUri::parse("ejfat://h@192.188.29.6:80/lb/1", TokenType::Admin, false)
            .unwrap_err();
        assert!(matches!(e, E2sarError::OutOfRange(_)));
    }

    #[test]
    fn test_token_type_hint() {
        let u = EjfatUri::parse(URI1, TokenType::Instance, false).unwrap();
        assert!(u.token(TokenType::Admin).is_err());
        assert_eq!(u.token(TokenType::Instance).unwrap(), "token");
    }

    #[test]
    fn test_serialize_roundtrip() {
        let u = EjfatUri::parse(URI1, TokenType::Admin, false).unwrap();
        let s = u.to_string_with(TokenType::Admin);
        let u2 = EjfatUri::parse(&s, TokenType::Admin, false).unwrap();
        assert_eq!(u, u2);
    }

    #[test]
    fn test_serialize_selects_single_token() {
        let mut u = EjfatUri::parse(URI1, TokenType::Admin, false).unwrap();
        u.set_instance_token("itoken");
        let s = u.to_string_with(TokenType::Instance);
        assert!(s.starts_with("ejfat://itoken@"));
        assert!(!s.contains("token@192") || s.contains("itoken@192"));
    }

    #[test]
    fn test_from_env() {
        std::env::set_var("EJFAT_URI_TEST_VAR", URI1);
        let u = EjfatUri::from_env(Some("EJFAT_URI_TEST_VAR"), TokenType::Admin, false).unwrap();
        assert_eq!(u.lb_id(), "36");
        let e = EjfatUri::from_env(Some("EJFAT_URI_TEST_MISSING"), TokenType::Admin, false)
            .unwrap_err();
        assert!(matches!(e, E2sarError::NotFound(_)));
    }

    #[test]
    fn test_from_file() {
        let dir = std::env::temp_dir().join("e2sar_uri_test_file");
        std::fs::write(&dir, format!("{}\n", URI1)).unwrap();
        let u = EjfatUri::from_file(Some(dir.to_str().unwrap()), TokenType::Admin, false).unwrap();
        assert_eq!(u.lb_id(), "36");
        std::fs::remove_file(&dir).ok();
        let e = EjfatUri::from_file(Some("/nonexistent/ejfat_uri"), TokenType::Admin, false)
            .unwrap_err();
        assert!(matches!(e, E2sarError::NotFound(_)));
    }

    #[test]
    fn test_mutators_used_by_lbmanager() {
        let mut u = EjfatUri::parse("ejfat://tok@10.0.0.1:18020", TokenType::Admin, false).unwrap();
        u.set_lb_id("77");
        u.set_instance_token("inst");
        u.set_sync_addr("10.0.0.2".parse().unwrap(), 19020);
        u.set_data_addr("10.0.0.3".parse().unwrap());
        u.set_data_addr("2001:db8::1".parse().unwrap());
        u.set_session_id("sess-1");
        assert_eq!(u.lb_id(), "77");
        assert!(u.has_data_addr_v4() && u.has_data_addr_v6());
        let s = u.to_string_with(TokenType::Instance);
        assert!(s.contains("inst@") && s.contains("/lb/77") && s.contains("sessionid=sess-1"));
    }

    #[test]
    fn test_display_prefers_most_specific_token() {
        let mut u = EjfatUri::parse(URI1, TokenType::Admin, false).unwrap();
        u.set_session_token("stoken");
        assert!(u.to_string().starts_with("ejfat://stoken@"));
    }
}
