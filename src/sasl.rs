//! SASL bind exchange.
//!
//! A [`SaslMechanism`] is a pure state machine over opaque byte payloads. The
//! exchange driver feeds it server challenges and sends what it produces in
//! bind requests until the server returns a final result, the mechanism
//! finishes or fails, or the round limit is hit.

use crate::error::{LdapError, Result};
use crate::protocol::{BindRequest, BindResponse, ResultCode};
use bytes::Bytes;
use std::future::Future;
use tracing::{debug, trace};

/// Default bound on client->server messages in one exchange.
pub const DEFAULT_MAX_SASL_ROUNDS: u32 = 10;

/// What a mechanism wants to do next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepResult {
    /// Send these credentials and expect another challenge.
    SendAndContinue(Vec<u8>),
    /// Send these credentials; nothing more will be produced.
    SendAndDone(Vec<u8>),
    /// Nothing more to send. As the first step this means "send the mechanism
    /// name without credentials".
    Done,
    Fail(String),
}

pub trait SaslMechanism: Send {
    fn name(&self) -> &str;

    /// `challenge` is `None` for the initial step, then each server challenge
    /// (empty when the server sent none).
    fn step(&mut self, challenge: Option<&[u8]>) -> StepResult;

    /// Whether a fresh instance can authenticate again without user input,
    /// e.g. when following a referral. One-time credentials cannot.
    fn supports_rebind(&self) -> bool {
        true
    }
}

/// Drive `mechanism` to completion, using `send` to perform each bind round
/// trip. Returns the final successful bind response.
pub async fn run_exchange<F, Fut>(
    mechanism: &mut dyn SaslMechanism,
    bind_dn: &str,
    max_rounds: u32,
    endpoint: &str,
    mut send: F,
) -> Result<BindResponse>
where
    F: FnMut(BindRequest) -> Fut,
    Fut: Future<Output = Result<BindResponse>>,
{
    let name = mechanism.name().to_string();
    let failed = |reason: String| LdapError::AuthenticationFailed {
        mechanism: name.clone(),
        reason,
    };

    let mut rounds: u32 = 0;
    let mut step = mechanism.step(None);
    loop {
        let (credentials, mechanism_done) = match step {
            StepResult::SendAndContinue(bytes) => (Some(Bytes::from(bytes)), false),
            StepResult::SendAndDone(bytes) => (Some(Bytes::from(bytes)), true),
            StepResult::Done if rounds == 0 => (None, true),
            StepResult::Done => {
                return Err(failed(
                    "mechanism finished before the server completed the bind".to_string(),
                ))
            }
            StepResult::Fail(reason) => return Err(failed(reason)),
        };

        if rounds >= max_rounds {
            debug!(endpoint, mechanism = %name, max_rounds, "SASL exchange exceeded round limit");
            return Err(LdapError::AuthenticationRoundsExceeded {
                mechanism: name.clone(),
                max_rounds,
            });
        }
        rounds += 1;
        trace!(endpoint, mechanism = %name, round = rounds, "sending SASL bind request");

        let response = send(BindRequest::sasl(bind_dn, name.as_str(), credentials)).await?;
        match response.result.result_code {
            ResultCode::SUCCESS => {
                // final server data (e.g. a server signature) goes to the mechanism
                if let (Some(creds), false) = (&response.server_sasl_creds, mechanism_done) {
                    if let StepResult::Fail(reason) = mechanism.step(Some(creds)) {
                        return Err(failed(reason));
                    }
                }
                debug!(endpoint, mechanism = %name, rounds, "SASL bind succeeded");
                return Ok(response);
            }
            ResultCode::SASL_BIND_IN_PROGRESS => {
                if mechanism_done {
                    return Err(failed(
                        "server requested another round after the mechanism finished".to_string(),
                    ));
                }
                let challenge = response.server_sasl_creds.unwrap_or_default();
                step = mechanism.step(Some(&challenge));
            }
            code => {
                return Err(LdapError::AuthenticationRejected {
                    endpoint: endpoint.to_string(),
                    mechanism: name.clone(),
                    result_code: code.0,
                    diagnostic: response.result.diagnostic_message,
                })
            }
        }
    }
}

/// RFC 4616 PLAIN.
#[derive(Clone)]
pub struct PlainMechanism {
    authzid: Option<String>,
    authcid: String,
    password: String,
}

impl PlainMechanism {
    pub fn new(authcid: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            authzid: None,
            authcid: authcid.into(),
            password: password.into(),
        }
    }

    pub fn with_authzid(mut self, authzid: impl Into<String>) -> Self {
        self.authzid = Some(authzid.into());
        self
    }
}

impl std::fmt::Debug for PlainMechanism {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlainMechanism")
            .field("authzid", &self.authzid)
            .field("authcid", &self.authcid)
            .finish_non_exhaustive()
    }
}

impl SaslMechanism for PlainMechanism {
    fn name(&self) -> &str {
        "PLAIN"
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> StepResult {
        if challenge.is_some() {
            return StepResult::Fail("PLAIN does not accept server challenges".to_string());
        }
        let mut message = Vec::with_capacity(self.authcid.len() + self.password.len() + 2);
        if let Some(authzid) = &self.authzid {
            message.extend_from_slice(authzid.as_bytes());
        }
        message.push(0);
        message.extend_from_slice(self.authcid.as_bytes());
        message.push(0);
        message.extend_from_slice(self.password.as_bytes());
        StepResult::SendAndDone(message)
    }
}

/// RFC 4422 EXTERNAL: identity comes from the transport (e.g. a TLS client
/// certificate).
#[derive(Debug, Clone, Default)]
pub struct ExternalMechanism {
    authzid: Option<String>,
}

impl ExternalMechanism {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_authzid(authzid: impl Into<String>) -> Self {
        Self {
            authzid: Some(authzid.into()),
        }
    }
}

impl SaslMechanism for ExternalMechanism {
    fn name(&self) -> &str {
        "EXTERNAL"
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> StepResult {
        if challenge.is_some() {
            return StepResult::Fail("EXTERNAL does not accept server challenges".to_string());
        }
        match &self.authzid {
            Some(authzid) => StepResult::SendAndDone(authzid.as_bytes().to_vec()),
            None => StepResult::Done,
        }
    }
}

/// RFC 4505 ANONYMOUS with an optional trace string.
#[derive(Debug, Clone, Default)]
pub struct AnonymousMechanism {
    trace: String,
}

impl AnonymousMechanism {
    pub fn new(trace: impl Into<String>) -> Self {
        Self {
            trace: trace.into(),
        }
    }
}

impl SaslMechanism for AnonymousMechanism {
    fn name(&self) -> &str {
        "ANONYMOUS"
    }

    fn step(&mut self, challenge: Option<&[u8]>) -> StepResult {
        if challenge.is_some() {
            return StepResult::Fail("ANONYMOUS does not accept server challenges".to_string());
        }
        StepResult::SendAndDone(self.trace.as_bytes().to_vec())
    }
}
