use crate::ber::DecodeLimits;
use crate::connection::ConnectionOptions;
use crate::debug::{DebugCategory, DebugHandle, DebugSettings};
use crate::pool::{HealthCheckKind, PoolOptions};
use crate::sasl::{AnonymousMechanism, ExternalMechanism, PlainMechanism, SaslMechanism, DEFAULT_MAX_SASL_ROUNDS};
use crate::server_set::BindCredentials;
use crate::tls::{TlsOptions, TlsSettings};
use crate::transport::{parse_ldap_uri, ServerEndpoint};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientConfig {
    pub servers: ServersConfig,
    #[serde(default)]
    pub connection: ConnectionConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    pub pool: Option<PoolConfig>,
    pub bind: Option<BindConfig>,
    pub tls: Option<TlsConfig>,
    #[serde(default)]
    pub debug: DebugConfig,
}

/// How a server set picks the endpoint to dial.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerSetStrategy {
    /// One fixed endpoint.
    Single,
    /// Endpoints in configured order; first reachable wins.
    #[default]
    FailoverOrdered,
    RoundRobin,
    /// Weighted random choice of the first endpoint to try.
    Random,
}

/// What to do when following a referral needs a rebind the configured
/// mechanism cannot repeat.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReferralRebindPolicy {
    #[default]
    FailOperation,
    /// Return the referral connection unauthenticated.
    SkipRebind,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServersConfig {
    /// single, failover_ordered (default), round_robin, random.
    #[serde(default)]
    pub strategy: ServerSetStrategy,
    pub endpoints: Vec<EndpointConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// ldap://host[:port] or ldaps://host[:port].
    pub uri: String,
    /// Upgrade ldap:// connections with StartTLS.
    pub starttls: Option<bool>,
    /// Relative weight for the random strategy (default 1).
    pub weight: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Default 10000.
    pub connect_timeout_ms: Option<u64>,
    /// Per-request deadline. Unset means requests wait indefinitely.
    pub response_timeout_ms: Option<u64>,
    /// Close the connection when requests are outstanding and nothing arrives for this long.
    pub idle_timeout_sec: Option<u64>,
    /// Largest inbound element accepted (default 20 MiB).
    pub max_element_size: Option<usize>,
    /// Deepest nesting accepted (default 64).
    pub max_depth: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    /// Default 10.
    pub max_sasl_rounds: Option<u32>,
    #[serde(default)]
    pub referral_rebind: ReferralRebindPolicy,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Label used in logs and metrics (default "default").
    pub name: Option<String>,
    pub min_connections: Option<usize>,
    pub max_connections: Option<usize>,
    pub checkout_timeout_ms: Option<u64>,
    /// Seconds between health-check passes; 0 disables the background task.
    pub health_check_interval_sec: Option<u64>,
    /// Idle connections unused for this long are health checked.
    pub staleness_threshold_sec: Option<u64>,
    /// who_am_i (default) or connection_state.
    pub health_check: Option<HealthCheckKind>,
    pub health_check_timeout_sec: Option<u64>,
    /// Connections older than this are closed on release.
    pub max_connection_age_sec: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BindConfig {
    /// simple, plain, external or anonymous.
    pub method: String,
    pub binddn: Option<String>,
    pub credentials: Option<String>,
    /// Authorization identity for plain / external.
    pub authzid: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Load the platform trust store (default true).
    pub native_roots: Option<bool>,
    pub ca_file: Option<String>,
    pub cert_file: Option<String>,
    pub key_file: Option<String>,
    /// Do not verify server certificates (test setups only).
    pub skip_verify: Option<bool>,
    pub server_name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DebugConfig {
    pub enabled: Option<bool>,
    /// Default: all categories.
    pub categories: Option<Vec<DebugCategory>>,
    pub include_hex: Option<bool>,
}

impl ClientConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Read config file {}", path.display()))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let config: ClientConfig = serde_yaml::from_str(content).context("Parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Config for the given URIs with every other setting at its default.
    pub fn from_uris(uris: &[String]) -> Self {
        Self {
            servers: ServersConfig {
                strategy: if uris.len() == 1 {
                    ServerSetStrategy::Single
                } else {
                    ServerSetStrategy::FailoverOrdered
                },
                endpoints: uris
                    .iter()
                    .map(|uri| EndpointConfig {
                        uri: uri.clone(),
                        starttls: None,
                        weight: None,
                    })
                    .collect(),
            },
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.servers.endpoints.is_empty() {
            anyhow::bail!("servers.endpoints must list at least one endpoint");
        }
        if self.servers.strategy == ServerSetStrategy::Single && self.servers.endpoints.len() != 1 {
            anyhow::bail!(
                "strategy single requires exactly one endpoint, got {}",
                self.servers.endpoints.len()
            );
        }
        for endpoint in &self.servers.endpoints {
            let (secure, _, _) = parse_ldap_uri(&endpoint.uri)
                .with_context(|| format!("Invalid endpoint uri {}", endpoint.uri))?;
            if secure && endpoint.starttls.unwrap_or(false) {
                anyhow::bail!("{}: starttls cannot be combined with ldaps://", endpoint.uri);
            }
        }
        if self.pool.is_some() {
            let options = self.pool_options();
            if options.max_connections == 0 {
                anyhow::bail!("pool.max_connections must be at least 1");
            }
            if options.min_connections > options.max_connections {
                anyhow::bail!(
                    "pool.min_connections ({}) exceeds pool.max_connections ({})",
                    options.min_connections,
                    options.max_connections
                );
            }
        }
        if let Some(bind) = &self.bind {
            match bind.method.to_lowercase().as_str() {
                "simple" | "plain" => {
                    if bind.credentials.is_none() {
                        anyhow::bail!("bind method {} requires credentials", bind.method);
                    }
                }
                "external" | "anonymous" => {}
                other => anyhow::bail!("unknown bind method {}", other),
            }
        }
        Ok(())
    }

    pub fn decode_limits(&self) -> DecodeLimits {
        let defaults = DecodeLimits::default();
        DecodeLimits {
            max_element_size: self.connection.max_element_size.unwrap_or(defaults.max_element_size),
            max_depth: self.connection.max_depth.unwrap_or(defaults.max_depth),
        }
    }

    pub fn debug_settings(&self) -> DebugSettings {
        let categories = self
            .debug
            .categories
            .clone()
            .unwrap_or_else(|| DebugCategory::ALL.to_vec());
        let mut settings = DebugSettings::with_categories(categories);
        settings.enabled = self.debug.enabled.unwrap_or(false);
        settings.include_hex = self.debug.include_hex.unwrap_or(false);
        settings
    }

    pub fn connection_options(&self) -> ConnectionOptions {
        let defaults = ConnectionOptions::default();
        ConnectionOptions {
            connect_timeout: self
                .connection
                .connect_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.connect_timeout),
            response_timeout: self.connection.response_timeout_ms.map(Duration::from_millis),
            idle_timeout: self.connection.idle_timeout_sec.map(Duration::from_secs),
            decode_limits: self.decode_limits(),
            max_sasl_rounds: self.auth.max_sasl_rounds.unwrap_or(DEFAULT_MAX_SASL_ROUNDS),
            debug: DebugHandle::new(self.debug_settings()),
            metrics: None,
        }
    }

    pub fn pool_options(&self) -> PoolOptions {
        let defaults = PoolOptions::default();
        let Some(pool) = &self.pool else {
            return defaults;
        };
        PoolOptions {
            name: pool.name.clone().unwrap_or(defaults.name),
            min_connections: pool.min_connections.unwrap_or(defaults.min_connections),
            max_connections: pool.max_connections.unwrap_or(defaults.max_connections),
            checkout_timeout: pool
                .checkout_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(defaults.checkout_timeout),
            health_check_interval: pool
                .health_check_interval_sec
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_interval),
            staleness_threshold: pool
                .staleness_threshold_sec
                .map(Duration::from_secs)
                .unwrap_or(defaults.staleness_threshold),
            health_check: pool.health_check.unwrap_or(defaults.health_check),
            health_check_timeout: pool
                .health_check_timeout_sec
                .map(Duration::from_secs)
                .unwrap_or(defaults.health_check_timeout),
            max_connection_age: pool.max_connection_age_sec.map(Duration::from_secs),
        }
    }

    /// TLS settings shared by every ldaps:// and StartTLS endpoint. `None`
    /// when no endpoint needs TLS and no tls section is present.
    pub fn tls_settings(&self) -> Result<Option<Arc<TlsSettings>>> {
        let needs_tls = self.servers.endpoints.iter().any(|e| {
            e.starttls.unwrap_or(false) || e.uri.to_ascii_lowercase().starts_with("ldaps://")
        });
        let Some(tls) = &self.tls else {
            if needs_tls {
                return Ok(Some(Arc::new(TlsSettings::with_native_roots()?)));
            }
            return Ok(None);
        };
        let options = TlsOptions {
            use_native_roots: tls.native_roots.unwrap_or(true),
            ca_file: tls.ca_file.as_ref().map(PathBuf::from),
            ca_pem: None,
            client_cert_file: tls.cert_file.as_ref().map(PathBuf::from),
            client_key_file: tls.key_file.as_ref().map(PathBuf::from),
            skip_verify: tls.skip_verify.unwrap_or(false),
            server_name: tls.server_name.clone(),
        };
        Ok(Some(Arc::new(TlsSettings::from_options(&options)?)))
    }

    /// Endpoints with their weights, in configured order.
    pub fn endpoints(&self) -> Result<Vec<(ServerEndpoint, u32)>> {
        let tls = self.tls_settings()?;
        self.servers
            .endpoints
            .iter()
            .map(|e| {
                let (secure, host, port) = parse_ldap_uri(&e.uri)
                    .with_context(|| format!("Invalid endpoint uri {}", e.uri))?;
                let require_tls = || {
                    tls.clone()
                        .ok_or_else(|| anyhow::anyhow!("{}: TLS settings missing", e.uri))
                };
                let endpoint = if secure {
                    ServerEndpoint::ldaps(host, port, require_tls()?)
                } else if e.starttls.unwrap_or(false) {
                    ServerEndpoint::start_tls(host, port, require_tls()?)
                } else {
                    ServerEndpoint::new(host, port)
                };
                Ok((endpoint, e.weight.unwrap_or(1).max(1)))
            })
            .collect()
    }

    pub fn bind_credentials(&self) -> Result<Option<BindCredentials>> {
        let Some(bind) = &self.bind else {
            return Ok(None);
        };
        let binddn = bind.binddn.clone().unwrap_or_default();
        let credentials = bind.credentials.clone().unwrap_or_default();
        let authzid = bind.authzid.clone();
        let credentials = match bind.method.to_lowercase().as_str() {
            "simple" => BindCredentials::Simple {
                dn: binddn,
                password: credentials,
            },
            "plain" => {
                let authcid = binddn.clone();
                BindCredentials::sasl("", move || {
                    let mut mechanism = PlainMechanism::new(authcid.clone(), credentials.clone());
                    if let Some(authzid) = &authzid {
                        mechanism = mechanism.with_authzid(authzid.clone());
                    }
                    Box::new(mechanism) as Box<dyn SaslMechanism>
                })
            }
            "external" => BindCredentials::sasl(binddn, move || match &authzid {
                Some(authzid) => Box::new(ExternalMechanism::with_authzid(authzid.clone())) as Box<dyn SaslMechanism>,
                None => Box::new(ExternalMechanism::new()) as Box<dyn SaslMechanism>,
            }),
            "anonymous" => BindCredentials::sasl("", move || {
                Box::new(AnonymousMechanism::new(binddn.clone())) as Box<dyn SaslMechanism>
            }),
            other => anyhow::bail!("unknown bind method {}", other),
        };
        Ok(Some(credentials))
    }
}
