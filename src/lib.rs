pub mod ber;
pub mod config;
pub mod connection;
pub mod debug;
pub mod error;
pub mod message;
pub mod metrics;
pub mod pending;
pub mod pool;
pub mod protocol;
pub mod sasl;
pub mod server_set;
pub mod stream;
pub mod tls;
pub mod transport;

pub use ber::{DecodeLimits, Element, Tag, TagClass, Value};
pub use config::{ClientConfig, ReferralRebindPolicy, ServerSetStrategy};
pub use connection::{ConnectionOptions, ConnectionState, LdapConnection};
pub use debug::{DebugCategory, DebugHandle, DebugSettings};
pub use error::{ConnectPhase, ErrorScope, LdapError, Result};
pub use message::{Control, LdapMessage};
pub use metrics::ClientMetrics;
pub use pool::{HealthCheckKind, LdapConnectionPool, PoolOptions, PooledConnection};
pub use protocol::{LdapResult, ResultCode};
pub use sasl::{SaslMechanism, StepResult};
pub use server_set::{BindCredentials, PostConnectProcessor, ServerSet};
pub use stream::StreamDecoder;
pub use tls::TlsSettings;
pub use transport::ServerEndpoint;
