//! Scriptable in-process LDAP server for integration tests.

#![allow(dead_code)]

use bytes::Bytes;
use ldap_client_core::ber::DecodeLimits;
use ldap_client_core::message::{unframe, LdapMessage};
use ldap_client_core::protocol::{
    BindAuthentication, BindRequest, BindResponse, ExtendedRequest, ExtendedResponse, FromElement, LdapResult,
    ResultCode, ToElement, CANCEL_OID, LDAP_TAG_ABANDON_REQUEST, LDAP_TAG_BIND_REQUEST, LDAP_TAG_EXTENDED_REQUEST,
    LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_SEARCH_REQUEST, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_TAG_SEARCH_RESULT_ENTRY,
    LDAP_TAG_UNBIND_REQUEST, NOTICE_OF_DISCONNECTION_OID, START_TLS_OID, WHO_AM_I_OID,
};
use ldap_client_core::stream::ElementReader;
use ldap_client_core::tls::{TlsOptions, TlsSettings};
use ldap_client_core::{Element, ServerEndpoint};
use rcgen::{BasicConstraints, CertificateParams, DnType, IsCa, KeyPair};
use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;

pub const BIND_DN: &str = "cn=admin,dc=example,dc=com";
pub const PASSWORD: &str = "secret";

/// What the server does in answer to one request.
pub enum Reply {
    Message(LdapMessage),
    Raw(Vec<u8>),
    Sleep(Duration),
    Close,
    /// Run a TLS server handshake on the connection, then keep serving over it.
    UpgradeTls,
}

pub type Handler = Arc<dyn Fn(&LdapMessage) -> Vec<Reply> + Send + Sync>;

pub struct MockServer {
    addr: SocketAddr,
    requests: Arc<Mutex<Vec<LdapMessage>>>,
    accepted: Arc<AtomicUsize>,
    task: JoinHandle<()>,
}

impl MockServer {
    pub async fn start(handler: Handler) -> Self {
        Self::start_with_greeting(handler, Vec::new()).await
    }

    /// `greeting` is written to every connection as soon as it is accepted.
    pub async fn start_with_greeting(handler: Handler, greeting: Vec<Reply>) -> Self {
        Self::spawn(handler, greeting, None).await
    }

    /// `Reply::UpgradeTls` completes a handshake with `acceptor`.
    pub async fn start_with_tls(handler: Handler, acceptor: TlsAcceptor) -> Self {
        Self::spawn(handler, Vec::new(), Some(acceptor)).await
    }

    async fn spawn(handler: Handler, greeting: Vec<Reply>, acceptor: Option<TlsAcceptor>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let accepted = Arc::new(AtomicUsize::new(0));
        let greeting = Arc::new(greeting.into_iter().map(Scripted::from).collect::<Vec<_>>());
        let task = {
            let requests = Arc::clone(&requests);
            let accepted = Arc::clone(&accepted);
            tokio::spawn(async move {
                loop {
                    let Ok((socket, _)) = listener.accept().await else {
                        return;
                    };
                    accepted.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(serve(
                        socket,
                        Arc::clone(&handler),
                        Arc::clone(&requests),
                        Arc::clone(&greeting),
                        acceptor.clone(),
                    ));
                }
            })
        };
        Self {
            addr,
            requests,
            accepted,
            task,
        }
    }

    pub fn endpoint(&self) -> ServerEndpoint {
        ServerEndpoint::new("127.0.0.1", self.addr.port())
    }

    pub fn uri(&self) -> String {
        format!("ldap://127.0.0.1:{}", self.addr.port())
    }

    pub fn requests(&self) -> Vec<LdapMessage> {
        self.requests.lock().unwrap().clone()
    }

    pub fn requests_with_tag(&self, tag: ldap_client_core::Tag) -> Vec<LdapMessage> {
        self.requests().into_iter().filter(|m| m.op_tag() == tag).collect()
    }

    pub fn connections(&self) -> usize {
        self.accepted.load(Ordering::SeqCst)
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Cloneable form of `Reply` for the per-connection greeting.
#[derive(Clone)]
enum Scripted {
    Message(LdapMessage),
    Raw(Vec<u8>),
    Sleep(Duration),
    Close,
    UpgradeTls,
}

impl From<Reply> for Scripted {
    fn from(reply: Reply) -> Self {
        match reply {
            Reply::Message(m) => Scripted::Message(m),
            Reply::Raw(b) => Scripted::Raw(b),
            Reply::Sleep(d) => Scripted::Sleep(d),
            Reply::Close => Scripted::Close,
            Reply::UpgradeTls => Scripted::UpgradeTls,
        }
    }
}

enum Next {
    Continue,
    Stop,
    UpgradeTls,
}

async fn play<W: AsyncWrite + Unpin>(socket: &mut W, reply: Scripted) -> Next {
    let ok = match reply {
        Scripted::Message(message) => socket.write_all(&message.encode()).await.is_ok(),
        Scripted::Raw(bytes) => socket.write_all(&bytes).await.is_ok(),
        Scripted::Sleep(duration) => {
            tokio::time::sleep(duration).await;
            true
        }
        Scripted::Close => {
            let _ = socket.shutdown().await;
            false
        }
        Scripted::UpgradeTls => return Next::UpgradeTls,
    };
    if ok {
        Next::Continue
    } else {
        Next::Stop
    }
}

async fn serve(
    socket: TcpStream,
    handler: Handler,
    requests: Arc<Mutex<Vec<LdapMessage>>>,
    greeting: Arc<Vec<Scripted>>,
    acceptor: Option<TlsAcceptor>,
) {
    let (read_half, mut write_half) = tokio::io::split(socket);
    for reply in greeting.iter().cloned() {
        if !matches!(play(&mut write_half, reply).await, Next::Continue) {
            return;
        }
    }
    let mut reader = ElementReader::new(read_half, DecodeLimits::default());
    if !matches!(serve_requests(&mut reader, &mut write_half, &handler, &requests).await, Next::UpgradeTls) {
        return;
    }
    let Some(acceptor) = acceptor else {
        return;
    };
    let (read_half, _) = reader.into_parts();
    let Ok(tls) = acceptor.accept(read_half.unsplit(write_half)).await else {
        return;
    };
    let (read_half, mut write_half) = tokio::io::split(tls);
    let mut reader = ElementReader::new(read_half, DecodeLimits::default());
    serve_requests(&mut reader, &mut write_half, &handler, &requests).await;
}

/// Answer requests until the peer leaves, a reply closes the connection, or a
/// reply asks for a TLS upgrade.
async fn serve_requests<R, W>(
    reader: &mut ElementReader<R>,
    writer: &mut W,
    handler: &Handler,
    requests: &Mutex<Vec<LdapMessage>>,
) -> Next
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while let Ok(Some(element)) = reader.read_element().await {
        let Ok(message) = unframe(element) else {
            return Next::Stop;
        };
        requests.lock().unwrap().push(message.clone());
        if message.op_tag() == LDAP_TAG_UNBIND_REQUEST {
            return Next::Stop;
        }
        for reply in handler(&message) {
            match play(writer, Scripted::from(reply)).await {
                Next::Continue => {}
                next => return next,
            }
        }
    }
    Next::Stop
}

// -----------------------------------------------------------------------------
// TLS fixture
// -----------------------------------------------------------------------------

/// A throwaway CA, a "localhost" server certificate it signed, and a client
/// configuration that trusts only that CA.
pub struct TlsFixture {
    pub acceptor: TlsAcceptor,
    pub client: TlsSettings,
}

pub fn tls_fixture() -> TlsFixture {
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name.push(DnType::CommonName, "Test CA");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate().unwrap();
    let ca_cert = ca_params.self_signed(&ca_key).unwrap();

    let mut params = CertificateParams::new(vec!["localhost".to_string()]).unwrap();
    params.distinguished_name.push(DnType::CommonName, "localhost");
    let key = KeyPair::generate().unwrap();
    let cert = params.signed_by(&key, &ca_cert, &ca_key).unwrap();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![cert.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
        )
        .unwrap();
    let client = TlsSettings::from_options(&TlsOptions {
        use_native_roots: false,
        ca_pem: Some(ca_cert.pem().into_bytes()),
        server_name: Some("localhost".to_string()),
        ..TlsOptions::default()
    })
    .unwrap();
    TlsFixture {
        acceptor: TlsAcceptor::from(Arc::new(server_config)),
        client,
    }
}

// -----------------------------------------------------------------------------
// Reply builders
// -----------------------------------------------------------------------------

pub fn extended_response(id: i32, code: ResultCode, value: Option<&str>) -> Reply {
    let response = ExtendedResponse {
        result: LdapResult::new(code, ""),
        oid: None,
        value: value.map(|v| Bytes::copy_from_slice(v.as_bytes())),
    };
    Reply::Message(LdapMessage::new(id, response.to_element()))
}

pub fn bind_response(id: i32, code: ResultCode, server_creds: Option<&[u8]>) -> Reply {
    let response = BindResponse {
        result: LdapResult::new(code, if code.is_success() { "" } else { "rejected" }),
        server_sasl_creds: server_creds.map(Bytes::copy_from_slice),
    };
    Reply::Message(LdapMessage::new(id, response.to_element()))
}

pub fn search_entry(id: i32, dn: &str) -> Reply {
    let entry = Element::constructed(
        LDAP_TAG_SEARCH_RESULT_ENTRY,
        vec![Element::string(dn), Element::sequence(Vec::new())],
    );
    Reply::Message(LdapMessage::new(id, entry))
}

pub fn search_done(id: i32) -> Reply {
    Reply::Message(LdapMessage::new(
        id,
        LdapResult::success().to_response(LDAP_TAG_SEARCH_RESULT_DONE),
    ))
}

/// Unsolicited notification (message id 0) that does not end the session.
pub fn unsolicited_notification(oid: &str) -> Reply {
    let response = ExtendedResponse {
        result: LdapResult::new(ResultCode::SUCCESS, ""),
        oid: Some(oid.to_string()),
        value: None,
    };
    Reply::Message(LdapMessage::new(0, response.to_element()))
}

pub fn notice_of_disconnection() -> Reply {
    let response = ExtendedResponse {
        result: LdapResult::new(ResultCode::UNAVAILABLE, "server shutting down"),
        oid: Some(NOTICE_OF_DISCONNECTION_OID.to_string()),
        value: None,
    };
    Reply::Message(LdapMessage::new(0, response.to_element()))
}

/// A minimal search request; the mock only looks at the tag.
pub fn search_request(base: &str) -> Element {
    Element::constructed(
        LDAP_TAG_SEARCH_REQUEST,
        vec![
            Element::string(base),
            Element::enumerated(2),
            Element::enumerated(0),
            Element::integer(0),
            Element::integer(0),
            Element::boolean(false),
            Element::primitive(ldap_client_core::Tag::context(7), Bytes::from_static(b"objectClass")),
            Element::sequence(Vec::new()),
        ],
    )
}

// -----------------------------------------------------------------------------
// Canned handlers
// -----------------------------------------------------------------------------

/// A well-behaved directory:
/// * simple bind succeeds for `BIND_DN` / `PASSWORD`, anything else is invalidCredentials
/// * SASL PLAIN succeeds for authcid "user" / `PASSWORD`
/// * "Who am I?" answers `dn:<BIND_DN>`
/// * StartTLS is refused with unavailable
/// * searches return two entries and a done
/// * cancel succeeds; abandon gets no response
pub fn directory() -> Handler {
    Arc::new(|request: &LdapMessage| {
        let id = request.message_id;
        match request.op_tag() {
            LDAP_TAG_BIND_REQUEST => {
                let Ok(bind) = BindRequest::from_element(&request.protocol_op) else {
                    return vec![bind_response(id, ResultCode::PROTOCOL_ERROR, None)];
                };
                let ok = match &bind.authentication {
                    BindAuthentication::Simple(password) => {
                        bind.name == BIND_DN && password.as_ref() == PASSWORD.as_bytes()
                    }
                    BindAuthentication::Sasl { mechanism, credentials } => {
                        mechanism == "PLAIN"
                            && credentials.as_deref() == Some(b"\0user\0secret".as_slice())
                    }
                };
                let code = if ok {
                    ResultCode::SUCCESS
                } else {
                    ResultCode::INVALID_CREDENTIALS
                };
                vec![bind_response(id, code, None)]
            }
            LDAP_TAG_EXTENDED_REQUEST => {
                let Ok(ext) = ExtendedRequest::from_element(&request.protocol_op) else {
                    return vec![extended_response(id, ResultCode::PROTOCOL_ERROR, None)];
                };
                match ext.oid.as_str() {
                    WHO_AM_I_OID => vec![extended_response(id, ResultCode::SUCCESS, Some(&format!("dn:{}", BIND_DN)))],
                    START_TLS_OID => vec![extended_response(id, ResultCode::UNAVAILABLE, None)],
                    CANCEL_OID => vec![extended_response(id, ResultCode::SUCCESS, None)],
                    _ => vec![extended_response(id, ResultCode::PROTOCOL_ERROR, None)],
                }
            }
            LDAP_TAG_SEARCH_REQUEST => vec![
                search_entry(id, "cn=a,dc=example,dc=com"),
                search_entry(id, "cn=b,dc=example,dc=com"),
                search_done(id),
            ],
            LDAP_TAG_ABANDON_REQUEST => Vec::new(),
            _ => vec![Reply::Message(LdapMessage::new(
                id,
                LdapResult::new(ResultCode::PROTOCOL_ERROR, "unsupported").to_response(LDAP_TAG_EXTENDED_RESPONSE),
            ))],
        }
    })
}

/// Like `directory`, except StartTLS succeeds and upgrades the connection.
pub fn tls_directory() -> Handler {
    let inner = directory();
    Arc::new(move |request: &LdapMessage| {
        let start_tls = request.op_tag() == LDAP_TAG_EXTENDED_REQUEST
            && ExtendedRequest::from_element(&request.protocol_op).is_ok_and(|ext| ext.oid == START_TLS_OID);
        if start_tls {
            return vec![
                extended_response(request.message_id, ResultCode::SUCCESS, None),
                Reply::UpgradeTls,
            ];
        }
        inner(request)
    })
}

/// Never answers anything.
pub fn silent() -> Handler {
    Arc::new(|_| Vec::new())
}

/// Answers through `directory`, after `delay`.
pub fn slow(delay: Duration) -> Handler {
    let inner = directory();
    Arc::new(move |request| {
        let mut replies = vec![Reply::Sleep(delay)];
        replies.extend(inner(request));
        replies
    })
}
