//! Endpoint selection and connection establishment.
//!
//! A `ServerSet` turns an ordered endpoint list into ready-to-use connections:
//! it picks endpoints by strategy, dials, runs StartTLS and any post-connect
//! processors, and binds. Each endpoint is tried at most once per call.

use crate::config::{ClientConfig, ReferralRebindPolicy, ServerSetStrategy};
use crate::connection::{ConnectionOptions, LdapConnection};
use crate::error::{ConnectAttempt, ConnectPhase, LdapError, Result};
use crate::metrics::ClientMetrics;
use crate::sasl::SaslMechanism;
use crate::tls::TlsSettings;
use crate::transport::{ServerEndpoint, TransportSecurity};
use rand::thread_rng;
use rand::Rng;
use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Hooks run on every new connection before it is handed out.
///
/// `pre_authentication` runs after the transport is up and before the bind;
/// `post_authentication` runs after a successful bind (or right after
/// `pre_authentication` when no bind is configured). An error discards the
/// connection and counts as a failed attempt for that endpoint.
pub trait PostConnectProcessor: Send + Sync {
    fn pre_authentication<'a>(&'a self, _connection: &'a LdapConnection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }

    fn post_authentication<'a>(&'a self, _connection: &'a LdapConnection) -> BoxFuture<'a, Result<()>> {
        Box::pin(async { Ok(()) })
    }
}

/// Upgrades every new connection with StartTLS.
#[derive(Debug, Clone)]
pub struct StartTlsPostConnectProcessor {
    tls: Arc<TlsSettings>,
}

impl StartTlsPostConnectProcessor {
    pub fn new(tls: Arc<TlsSettings>) -> Self {
        Self { tls }
    }
}

impl PostConnectProcessor for StartTlsPostConnectProcessor {
    fn pre_authentication<'a>(&'a self, connection: &'a LdapConnection) -> BoxFuture<'a, Result<()>> {
        Box::pin(connection.start_tls(&self.tls))
    }
}

pub type MechanismFactory = Arc<dyn Fn() -> Box<dyn SaslMechanism> + Send + Sync>;

/// Bind performed on each new connection.
#[derive(Clone)]
pub enum BindCredentials {
    Simple { dn: String, password: String },
    /// `factory` builds a fresh mechanism for every bind.
    Sasl { bind_dn: String, factory: MechanismFactory },
}

impl BindCredentials {
    pub fn simple(dn: impl Into<String>, password: impl Into<String>) -> Self {
        BindCredentials::Simple {
            dn: dn.into(),
            password: password.into(),
        }
    }

    pub fn sasl<F>(bind_dn: impl Into<String>, factory: F) -> Self
    where
        F: Fn() -> Box<dyn SaslMechanism> + Send + Sync + 'static,
    {
        BindCredentials::Sasl {
            bind_dn: bind_dn.into(),
            factory: Arc::new(factory),
        }
    }
}

impl fmt::Debug for BindCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindCredentials::Simple { dn, .. } => f
                .debug_struct("Simple")
                .field("dn", dn)
                .field("password", &"<redacted>")
                .finish(),
            BindCredentials::Sasl { bind_dn, .. } => f
                .debug_struct("Sasl")
                .field("bind_dn", bind_dn)
                .finish_non_exhaustive(),
        }
    }
}

struct EndpointEntry {
    endpoint: ServerEndpoint,
    label: String,
    weight: u32,
    attempts: AtomicU64,
    failures: AtomicU64,
}

/// Per-endpoint counters.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EndpointStats {
    pub endpoint: String,
    pub weight: u32,
    pub attempts: u64,
    pub failures: u64,
}

pub struct ServerSet {
    strategy: ServerSetStrategy,
    endpoints: Vec<EndpointEntry>,
    round_robin_next: AtomicUsize,
    options: ConnectionOptions,
    bind: Option<BindCredentials>,
    processors: Vec<Arc<dyn PostConnectProcessor>>,
    referral_rebind: ReferralRebindPolicy,
    metrics: Arc<ClientMetrics>,
}

impl fmt::Debug for ServerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerSet")
            .field("strategy", &self.strategy)
            .field(
                "endpoints",
                &self.endpoints.iter().map(|e| e.label.as_str()).collect::<Vec<_>>(),
            )
            .field("bind", &self.bind)
            .field("processors", &self.processors.len())
            .finish()
    }
}

impl ServerSet {
    pub fn new(strategy: ServerSetStrategy, endpoints: Vec<ServerEndpoint>) -> Result<Self> {
        Self::weighted(strategy, endpoints.into_iter().map(|e| (e, 1)).collect())
    }

    /// Endpoints with relative weights; weights only matter for `Random`.
    pub fn weighted(strategy: ServerSetStrategy, endpoints: Vec<(ServerEndpoint, u32)>) -> Result<Self> {
        if endpoints.is_empty() {
            return Err(LdapError::Config("server set needs at least one endpoint".to_string()));
        }
        if strategy == ServerSetStrategy::Single && endpoints.len() != 1 {
            return Err(LdapError::Config(format!(
                "single server set needs exactly one endpoint, got {}",
                endpoints.len()
            )));
        }
        Ok(Self::build(strategy, endpoints))
    }

    pub fn single(endpoint: ServerEndpoint) -> Self {
        Self::build(ServerSetStrategy::Single, vec![(endpoint, 1)])
    }

    fn build(strategy: ServerSetStrategy, endpoints: Vec<(ServerEndpoint, u32)>) -> Self {
        let endpoints = endpoints
            .into_iter()
            .map(|(endpoint, weight)| EndpointEntry {
                label: endpoint.to_string(),
                endpoint,
                weight: weight.max(1),
                attempts: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            })
            .collect();
        Self {
            strategy,
            endpoints,
            round_robin_next: AtomicUsize::new(0),
            options: ConnectionOptions::default(),
            bind: None,
            processors: Vec::new(),
            referral_rebind: ReferralRebindPolicy::default(),
            metrics: Arc::new(ClientMetrics::new()),
        }
    }

    /// Build from the `servers`, `connection`, `auth` and `bind` sections.
    pub fn from_config(config: &ClientConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let set = Self::weighted(config.servers.strategy, config.endpoints()?)?
            .with_options(config.connection_options())
            .with_referral_rebind_policy(config.auth.referral_rebind);
        Ok(match config.bind_credentials()? {
            Some(bind) => set.with_bind(bind),
            None => set,
        })
    }

    pub fn with_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    pub fn with_bind(mut self, bind: BindCredentials) -> Self {
        self.bind = Some(bind);
        self
    }

    /// Processors run in the order added, after StartTLS.
    pub fn with_post_connect_processor(mut self, processor: Arc<dyn PostConnectProcessor>) -> Self {
        self.processors.push(processor);
        self
    }

    pub fn with_referral_rebind_policy(mut self, policy: ReferralRebindPolicy) -> Self {
        self.referral_rebind = policy;
        self
    }

    pub fn strategy(&self) -> ServerSetStrategy {
        self.strategy
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.options
    }

    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    pub fn endpoints(&self) -> impl Iterator<Item = &ServerEndpoint> {
        self.endpoints.iter().map(|e| &e.endpoint)
    }

    pub fn endpoint_stats(&self) -> Vec<EndpointStats> {
        self.endpoints
            .iter()
            .map(|e| EndpointStats {
                endpoint: e.label.clone(),
                weight: e.weight,
                attempts: e.attempts.load(Ordering::Relaxed),
                failures: e.failures.load(Ordering::Relaxed),
            })
            .collect()
    }

    /// Endpoint indices in the order this call will try them.
    fn attempt_order(&self) -> Vec<usize> {
        let n = self.endpoints.len();
        let start = match self.strategy {
            ServerSetStrategy::Single | ServerSetStrategy::FailoverOrdered => 0,
            ServerSetStrategy::RoundRobin => self.round_robin_next.fetch_add(1, Ordering::Relaxed) % n,
            ServerSetStrategy::Random => self.weighted_pick(),
        };
        if self.strategy == ServerSetStrategy::Single {
            return vec![start];
        }
        (0..n).map(|offset| (start + offset) % n).collect()
    }

    fn weighted_pick(&self) -> usize {
        let total: u64 = self.endpoints.iter().map(|e| e.weight as u64).sum();
        let mut roll = thread_rng().gen_range(0..total);
        for (index, entry) in self.endpoints.iter().enumerate() {
            let weight = entry.weight as u64;
            if roll < weight {
                return index;
            }
            roll -= weight;
        }
        self.endpoints.len() - 1
    }

    fn connection_options(&self) -> ConnectionOptions {
        let mut options = self.options.clone();
        options.metrics = Some(Arc::clone(&self.metrics));
        options
    }

    /// Dial one endpoint chosen by strategy and return it established (and
    /// bound, when credentials are configured). Unreachable endpoints fail
    /// over to the next; a rejected bind does not.
    pub async fn get_connection(&self) -> Result<LdapConnection> {
        let mut attempts = Vec::new();
        for index in self.attempt_order() {
            let entry = &self.endpoints[index];
            entry.attempts.fetch_add(1, Ordering::Relaxed);
            self.options.debug.other(&entry.label, "selected endpoint");
            match self.establish(&entry.endpoint, false).await {
                Ok(connection) => {
                    if !attempts.is_empty() {
                        info!(endpoint = %entry.label, failed = attempts.len(), "connected after failover");
                    }
                    return Ok(connection);
                }
                Err(e) => {
                    entry.failures.fetch_add(1, Ordering::Relaxed);
                    warn!(endpoint = %entry.label, error = %e, "connection attempt failed");
                    if self.strategy == ServerSetStrategy::Single || e.is_authentication_failure() {
                        return Err(e);
                    }
                    attempts.push(ConnectAttempt {
                        endpoint: entry.label.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }
        Err(LdapError::ServerSetExhausted { attempts })
    }

    /// Connect to a referral target, reusing the security settings of the
    /// first endpoint and the configured bind.
    pub async fn connect_for_referral(&self, host: &str, port: u16) -> Result<LdapConnection> {
        let endpoint = self.endpoints[0].endpoint.with_address(host, port);
        debug!(endpoint = %endpoint, "following referral");
        self.establish(&endpoint, true).await
    }

    async fn establish(&self, endpoint: &ServerEndpoint, referral: bool) -> Result<LdapConnection> {
        let connection = LdapConnection::connect(endpoint.clone(), self.connection_options()).await?;

        if let TransportSecurity::StartTls(tls) = endpoint.security() {
            StartTlsPostConnectProcessor::new(Arc::clone(tls))
                .pre_authentication(&connection)
                .await?;
        }
        for processor in &self.processors {
            processor
                .pre_authentication(&connection)
                .await
                .map_err(|e| post_connect_error(endpoint, e))?;
        }

        if let Some(bind) = &self.bind {
            self.bind(&connection, bind, referral).await?;
        }

        for processor in &self.processors {
            processor
                .post_authentication(&connection)
                .await
                .map_err(|e| post_connect_error(endpoint, e))?;
        }
        Ok(connection)
    }

    async fn bind(&self, connection: &LdapConnection, bind: &BindCredentials, referral: bool) -> Result<()> {
        match bind {
            BindCredentials::Simple { dn, password } => {
                connection.bind_simple(dn, password).await?;
            }
            BindCredentials::Sasl { bind_dn, factory } => {
                let mut mechanism = factory();
                if referral && !mechanism.supports_rebind() {
                    let name = mechanism.name().to_string();
                    match self.referral_rebind {
                        ReferralRebindPolicy::FailOperation => {
                            connection.close().await;
                            return Err(LdapError::ReferralRebindUnavailable { mechanism: name });
                        }
                        ReferralRebindPolicy::SkipRebind => {
                            warn!(endpoint = %connection.endpoint(), mechanism = %name, "skipping rebind on referral connection");
                            return Ok(());
                        }
                    }
                }
                connection.bind_sasl(bind_dn, mechanism.as_mut()).await?;
            }
        }
        Ok(())
    }
}

/// Connection-fatal and connect errors from a processor pass through; anything
/// else is reported as a post-connect failure of the endpoint.
fn post_connect_error(endpoint: &ServerEndpoint, error: LdapError) -> LdapError {
    match error {
        e @ (LdapError::Connect { .. } | LdapError::Tls { .. } | LdapError::ConnectionClosed { .. }) => e,
        e if e.is_authentication_failure() => e,
        e => LdapError::Connect {
            endpoint: endpoint.to_string(),
            phase: ConnectPhase::PostConnect,
            reason: e.to_string(),
        },
    }
}
