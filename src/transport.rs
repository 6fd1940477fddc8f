// Endpoints, byte transports and dialing.

use crate::error::{ConnectPhase, LdapError, Result};
use crate::tls::TlsSettings;
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tracing::debug;

pub const DEFAULT_LDAP_PORT: u16 = 389;
pub const DEFAULT_LDAPS_PORT: u16 = 636;

/// How the byte stream to an endpoint is protected.
#[derive(Debug, Clone)]
pub enum TransportSecurity {
    Plain,
    /// TLS from the first byte (ldaps://).
    Ldaps(Arc<TlsSettings>),
    /// Plain TCP upgraded with the StartTLS extended operation after connect.
    StartTls(Arc<TlsSettings>),
}

/// One directory server address. Immutable once built.
#[derive(Debug, Clone)]
pub struct ServerEndpoint {
    host: String,
    port: u16,
    security: TransportSecurity,
}

impl ServerEndpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: TransportSecurity::Plain,
        }
    }

    pub fn ldaps(host: impl Into<String>, port: u16, tls: Arc<TlsSettings>) -> Self {
        Self {
            host: host.into(),
            port,
            security: TransportSecurity::Ldaps(tls),
        }
    }

    pub fn start_tls(host: impl Into<String>, port: u16, tls: Arc<TlsSettings>) -> Self {
        Self {
            host: host.into(),
            port,
            security: TransportSecurity::StartTls(tls),
        }
    }

    /// Parse `ldap://host[:port]` or `ldaps://host[:port]`. `tls` is required
    /// for ldaps:// and, when given for ldap://, selects StartTLS.
    pub fn from_uri(uri: &str, tls: Option<Arc<TlsSettings>>) -> Result<Self> {
        let (secure, host, port) = parse_ldap_uri(uri)?;
        match (secure, tls) {
            (true, Some(tls)) => Ok(Self::ldaps(host, port, tls)),
            (true, None) => Err(LdapError::Config(format!(
                "{} requires TLS settings",
                uri
            ))),
            (false, Some(tls)) => Ok(Self::start_tls(host, port, tls)),
            (false, None) => Ok(Self::new(host, port)),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn security(&self) -> &TransportSecurity {
        &self.security
    }

    pub fn uses_start_tls(&self) -> bool {
        matches!(self.security, TransportSecurity::StartTls(_))
    }

    /// Same security settings, different address (referral targets).
    pub fn with_address(&self, host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            security: self.security.clone(),
        }
    }
}

impl fmt::Display for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = match self.security {
            TransportSecurity::Ldaps(_) => "ldaps",
            _ => "ldap",
        };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Parse "ldap://host:port" or "ldaps://host:port" to (is_ldaps, host, port).
/// The port defaults by scheme; a trailing "/dn?..." part is ignored.
pub fn parse_ldap_uri(uri: &str) -> Result<(bool, String, u16)> {
    let (secure, rest) = if let Some(rest) = uri.strip_prefix("ldaps://") {
        (true, rest)
    } else if let Some(rest) = uri.strip_prefix("ldap://") {
        (false, rest)
    } else {
        return Err(LdapError::Config(format!("Invalid LDAP URI scheme: {}", uri)));
    };
    let authority = rest.split('/').next().unwrap_or("");
    let default_port = if secure { DEFAULT_LDAPS_PORT } else { DEFAULT_LDAP_PORT };

    let (host, port_str) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| LdapError::Config(format!("Unterminated IPv6 address in URI: {}", uri)))?;
        (host, after.strip_prefix(':'))
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (host, Some(port)),
            None => (authority, None),
        }
    };
    if host.is_empty() {
        return Err(LdapError::Config(format!("No host in URI: {}", uri)));
    }
    let port = match port_str {
        Some(p) => p
            .parse::<u16>()
            .map_err(|_| LdapError::Config(format!("Invalid port in URI: {}", uri)))?,
        None => default_port,
    };
    Ok((secure, host.to_string(), port))
}

/// Stream to a server: plain TCP or TLS over TCP.
pub enum Transport {
    Tcp(TcpStream),
    Tls(ClientTlsStream<TcpStream>),
}

impl Transport {
    pub fn is_tls(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }
}

impl AsyncRead for Transport {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut tokio::io::ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Transport {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            Transport::Tls(s) => Pin::new(s).poll_write(cx, buf),
        }
    }
    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_flush(cx),
            Transport::Tls(s) => Pin::new(s).poll_flush(cx),
        }
    }
    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match &mut *self {
            Transport::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            Transport::Tls(s) => Pin::new(s).poll_shutdown(cx),
        }
    }
}

fn connect_error(endpoint: &ServerEndpoint, phase: ConnectPhase, reason: impl fmt::Display) -> LdapError {
    LdapError::Connect {
        endpoint: endpoint.to_string(),
        phase,
        reason: reason.to_string(),
    }
}

/// Resolve, connect and (for ldaps://) handshake, all within `timeout`.
pub(crate) async fn dial(endpoint: &ServerEndpoint, timeout: Duration) -> Result<Transport> {
    let attempt = async {
        let addrs: Vec<_> = tokio::net::lookup_host((endpoint.host(), endpoint.port()))
            .await
            .map_err(|e| connect_error(endpoint, ConnectPhase::Resolve, e))?
            .collect();
        if addrs.is_empty() {
            return Err(connect_error(endpoint, ConnectPhase::Resolve, "no addresses"));
        }

        let mut last_err = None;
        let mut tcp = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(stream) => {
                    tcp = Some(stream);
                    break;
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, %addr, error = %e, "TCP connect failed");
                    last_err = Some(e);
                }
            }
        }
        let tcp = match (tcp, last_err) {
            (Some(tcp), _) => tcp,
            (None, Some(e)) => return Err(connect_error(endpoint, ConnectPhase::TcpConnect, e)),
            (None, None) => return Err(connect_error(endpoint, ConnectPhase::TcpConnect, "no address tried")),
        };
        let _ = tcp.set_nodelay(true);

        match endpoint.security() {
            TransportSecurity::Ldaps(tls) => {
                let stream = tls_handshake(endpoint, tls, tcp)
                    .await
                    .map_err(|e| connect_error(endpoint, ConnectPhase::TlsHandshake, e))?;
                Ok(Transport::Tls(stream))
            }
            _ => Ok(Transport::Tcp(tcp)),
        }
    };
    tokio::time::timeout(timeout, attempt).await.map_err(|_| {
        connect_error(endpoint, ConnectPhase::TcpConnect, format!("timed out after {:?}", timeout))
    })?
}

/// TLS client handshake over an established TCP stream.
pub(crate) async fn tls_handshake(
    endpoint: &ServerEndpoint,
    tls: &TlsSettings,
    tcp: TcpStream,
) -> std::result::Result<ClientTlsStream<TcpStream>, String> {
    let server_name = tls.server_name_for(endpoint.host()).map_err(|e| e.to_string())?;
    tls.connector()
        .connect(server_name, tcp)
        .await
        .map_err(|e| format!("TLS handshake failed: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ldap_uri_ldap() {
        let (secure, host, port) = parse_ldap_uri("ldap://localhost:389").unwrap();
        assert!(!secure);
        assert_eq!(host, "localhost");
        assert_eq!(port, 389);
    }

    #[test]
    fn test_parse_ldap_uri_default_ports() {
        assert_eq!(parse_ldap_uri("ldap://dc1").unwrap(), (false, "dc1".to_string(), 389));
        assert_eq!(parse_ldap_uri("ldaps://dc1").unwrap(), (true, "dc1".to_string(), 636));
    }

    #[test]
    fn test_parse_ldap_uri_ignores_dn_part() {
        let (_, host, port) = parse_ldap_uri("ldap://dc1.example.com:3389/dc=example,dc=com??sub").unwrap();
        assert_eq!(host, "dc1.example.com");
        assert_eq!(port, 3389);
    }

    #[test]
    fn test_parse_ldap_uri_ipv6() {
        let (_, host, port) = parse_ldap_uri("ldap://[::1]:1389").unwrap();
        assert_eq!(host, "::1");
        assert_eq!(port, 1389);
        let endpoint = ServerEndpoint::new(host, port);
        assert_eq!(endpoint.to_string(), "ldap://[::1]:1389");
    }

    #[test]
    fn test_parse_ldap_uri_errors() {
        assert!(parse_ldap_uri("http://localhost:389").is_err());
        assert!(parse_ldap_uri("ldap://:389").is_err());
        assert!(parse_ldap_uri("ldap://host:notaport").is_err());
        assert!(parse_ldap_uri("ldap://host:70000").is_err());
    }

    #[test]
    fn test_endpoint_from_uri_security() {
        let tls = Arc::new(TlsSettings::insecure());
        let e = ServerEndpoint::from_uri("ldaps://dc1", Some(Arc::clone(&tls))).unwrap();
        assert!(matches!(e.security(), TransportSecurity::Ldaps(_)));
        assert_eq!(e.to_string(), "ldaps://dc1:636");
        let e = ServerEndpoint::from_uri("ldap://dc1", Some(tls)).unwrap();
        assert!(e.uses_start_tls());
        assert!(ServerEndpoint::from_uri("ldaps://dc1", None).is_err());
    }

    #[tokio::test]
    async fn test_dial_refused_reports_tcp_phase() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let endpoint = ServerEndpoint::new("127.0.0.1", port);
        match dial(&endpoint, Duration::from_secs(2)).await {
            Err(LdapError::Connect { phase, .. }) => assert_eq!(phase, ConnectPhase::TcpConnect),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("connect to a closed port succeeded"),
        }
    }
}
