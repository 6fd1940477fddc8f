mod common;

use common::*;
use bytes::Bytes;
use ldap_client_core::protocol::{
    ExtendedRequest, FromElement, ResultCode, ToElement, LDAP_TAG_ABANDON_REQUEST, LDAP_TAG_EXTENDED_REQUEST,
    LDAP_TAG_EXTENDED_RESPONSE, LDAP_TAG_SEARCH_REQUEST, LDAP_TAG_SEARCH_RESULT_DONE, LDAP_TAG_SEARCH_RESULT_ENTRY,
    LDAP_TAG_UNBIND_REQUEST, WHO_AM_I_OID,
};
use ldap_client_core::sasl::PlainMechanism;
use ldap_client_core::{
    ConnectPhase, ConnectionOptions, ConnectionState, DebugHandle, DebugSettings, Element, LdapConnection, LdapError,
    LdapMessage, TlsSettings,
};
use std::sync::{Arc, Mutex};
use std::time::Duration;

async fn connect(server: &MockServer) -> LdapConnection {
    LdapConnection::connect(server.endpoint(), ConnectionOptions::default())
        .await
        .unwrap()
}

async fn wait_for_state(conn: &LdapConnection, state: ConnectionState) {
    for _ in 0..100 {
        if conn.state() == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection never reached {state}, still {}", conn.state());
}

#[tokio::test]
async fn test_who_am_i_round_trip() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;
    assert_eq!(conn.state(), ConnectionState::Established);
    assert!(!conn.is_secure());

    let identity = conn.who_am_i().await.unwrap();
    assert_eq!(identity, format!("dn:{}", BIND_DN));

    let stats = conn.statistics();
    assert_eq!(stats.requests_sent, 1);
    assert_eq!(stats.responses_received, 1);
    assert_eq!(conn.outstanding_requests(), 0);
}

#[tokio::test]
async fn test_simple_bind_success_and_rejection() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;

    let err = conn.bind_simple(BIND_DN, "wrong").await.unwrap_err();
    match err {
        LdapError::AuthenticationRejected {
            mechanism, result_code, ..
        } => {
            assert_eq!(mechanism, "SIMPLE");
            assert_eq!(result_code, ResultCode::INVALID_CREDENTIALS.0);
        }
        other => panic!("unexpected error {other:?}"),
    }
    // a rejected bind leaves the connection usable
    assert_eq!(conn.state(), ConnectionState::Established);

    conn.bind_simple(BIND_DN, PASSWORD).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Bound);
    assert_eq!(conn.bound_as().as_deref(), Some(BIND_DN));
}

#[tokio::test]
async fn test_sasl_plain_bind() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;
    let mut mechanism = PlainMechanism::new("user", PASSWORD);
    conn.bind_sasl("", &mut mechanism).await.unwrap();
    assert_eq!(conn.state(), ConnectionState::Bound);
    assert_eq!(conn.bound_as().as_deref(), Some("SASL/PLAIN"));

    let mut wrong = PlainMechanism::new("user", "nope");
    let err = conn.bind_sasl("", &mut wrong).await.unwrap_err();
    assert!(err.is_authentication_failure());
}

#[tokio::test]
async fn test_out_of_order_responses_reach_their_callers() {
    // hold the first request and answer it after the second
    let held: Arc<Mutex<Option<i32>>> = Arc::new(Mutex::new(None));
    let handler: Handler = Arc::new(move |request: &LdapMessage| {
        let mut held = held.lock().unwrap();
        match held.take() {
            None => {
                *held = Some(request.message_id);
                Vec::new()
            }
            Some(first) => vec![
                extended_response(request.message_id, ResultCode::SUCCESS, Some("second")),
                extended_response(first, ResultCode::SUCCESS, Some("first")),
            ],
        }
    });
    let server = MockServer::start(handler).await;
    let conn = connect(&server).await;

    let first = conn
        .send_async(ExtendedRequest::who_am_i().to_element(), Vec::new(), None)
        .await
        .unwrap();
    let second = conn
        .send_async(ExtendedRequest::who_am_i().to_element(), Vec::new(), None)
        .await
        .unwrap();
    assert_ne!(first.message_id(), second.message_id());
    assert_eq!(conn.outstanding_requests(), 2);

    let (first_id, second_id) = (first.message_id(), second.message_id());
    let second = second.wait().await.unwrap();
    let first = first.wait().await.unwrap();
    assert_eq!(first.message_id, first_id);
    assert_eq!(second.message_id, second_id);
}

#[tokio::test]
async fn test_streaming_search_delivers_entries_then_done() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;

    let (pending, mut entries) = conn
        .send_streaming(search_request("dc=example,dc=com"), Vec::new(), None)
        .await
        .unwrap();
    let done = pending.wait().await.unwrap();
    assert_eq!(done.op_tag(), LDAP_TAG_SEARCH_RESULT_DONE);

    let mut dns = Vec::new();
    while let Some(entry) = entries.next().await {
        assert_eq!(entry.op_tag(), LDAP_TAG_SEARCH_RESULT_ENTRY);
        let children = entry.protocol_op.as_sequence().unwrap();
        dns.push(children[0].as_str().unwrap().to_string());
    }
    assert_eq!(dns, vec!["cn=a,dc=example,dc=com", "cn=b,dc=example,dc=com"]);
    assert_eq!(conn.statistics().intermediate_responses_received, 2);
}

#[tokio::test]
async fn test_response_timeout_is_request_local() {
    let server = MockServer::start(silent()).await;
    let conn = connect(&server).await;

    let err = conn
        .send_with_timeout(
            ExtendedRequest::who_am_i().to_element(),
            Vec::new(),
            Some(Duration::from_millis(100)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LdapError::Timeout { .. }));
    assert!(!err.is_connection_fatal());
    assert!(conn.is_usable());
    assert_eq!(conn.outstanding_requests(), 0);
    assert_eq!(conn.statistics().timeouts, 1);
}

#[tokio::test]
async fn test_late_response_after_timeout_is_discarded() {
    let server = MockServer::start(slow(Duration::from_millis(200))).await;
    let conn = connect(&server).await;

    let err = conn
        .send_with_timeout(
            ExtendedRequest::who_am_i().to_element(),
            Vec::new(),
            Some(Duration::from_millis(50)),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, LdapError::Timeout { .. }));

    // the late answer to the first request must not complete this one
    let identity = conn.who_am_i().await.unwrap();
    assert!(identity.starts_with("dn:"));
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_server_close_fails_outstanding_requests() {
    let handler: Handler = Arc::new(|_| vec![Reply::Close]);
    let server = MockServer::start(handler).await;
    let conn = connect(&server).await;

    let err = conn.who_am_i().await.unwrap_err();
    assert!(matches!(err, LdapError::ConnectionClosed { .. }), "{err:?}");
    wait_for_state(&conn, ConnectionState::Closed).await;
    assert!(conn.close_reason().is_some());

    let err = conn.who_am_i().await.unwrap_err();
    assert!(matches!(err, LdapError::InvalidState { .. }));
}

#[tokio::test]
async fn test_notice_of_disconnection_closes_connection() {
    let handler: Handler = Arc::new(|_| vec![notice_of_disconnection()]);
    let server = MockServer::start(handler).await;
    let conn = connect(&server).await;

    let err = conn.who_am_i().await.unwrap_err();
    match err {
        LdapError::ConnectionClosed { reason, .. } => assert!(reason.contains("notice of disconnection"), "{reason}"),
        other => panic!("unexpected error {other:?}"),
    }
    wait_for_state(&conn, ConnectionState::Closed).await;
    assert_eq!(conn.statistics().unsolicited_notifications, 1);
}

#[tokio::test]
async fn test_unsolicited_notification_is_counted_and_ignored() {
    let greeting = vec![unsolicited_notification("1.3.6.1.4.1.99999.2")];
    let server = MockServer::start_with_greeting(directory(), greeting).await;
    let options = ConnectionOptions {
        debug: DebugHandle::new(DebugSettings::all()),
        ..ConnectionOptions::default()
    };
    let conn = LdapConnection::connect(server.endpoint(), options).await.unwrap();

    assert_eq!(conn.who_am_i().await.unwrap(), format!("dn:{}", BIND_DN));
    assert_eq!(conn.statistics().unsolicited_notifications, 1);
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_malformed_stream_is_connection_fatal() {
    // SEQUENCE with an absurd 4-byte length
    let handler: Handler = Arc::new(|_| vec![Reply::Raw(vec![0x30, 0x84, 0x7f, 0xff, 0xff, 0xff])]);
    let server = MockServer::start(handler).await;
    let conn = connect(&server).await;

    let err = conn.who_am_i().await.unwrap_err();
    assert!(matches!(err, LdapError::ConnectionClosed { .. }), "{err:?}");
    wait_for_state(&conn, ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_invalid_operation_body_fails_only_that_request() {
    let calls = Arc::new(Mutex::new(0));
    let handler: Handler = Arc::new(move |request: &LdapMessage| {
        let mut calls = calls.lock().unwrap();
        *calls += 1;
        if *calls == 1 {
            // extended response without its LDAPResult components
            vec![Reply::Message(LdapMessage::new(
                request.message_id,
                Element::constructed(LDAP_TAG_EXTENDED_RESPONSE, Vec::new()),
            ))]
        } else {
            vec![extended_response(request.message_id, ResultCode::SUCCESS, Some("dn:x"))]
        }
    });
    let server = MockServer::start(handler).await;
    let conn = connect(&server).await;

    let err = conn.who_am_i().await.unwrap_err();
    assert!(matches!(err, LdapError::Decoding { .. }), "{err:?}");
    assert!(conn.is_usable());
    assert_eq!(conn.who_am_i().await.unwrap(), "dn:x");
}

#[tokio::test]
async fn test_idle_timeout_closes_stalled_connection() {
    let server = MockServer::start(silent()).await;
    let options = ConnectionOptions {
        idle_timeout: Some(Duration::from_millis(150)),
        ..ConnectionOptions::default()
    };
    let conn = LdapConnection::connect(server.endpoint(), options).await.unwrap();

    let started = std::time::Instant::now();
    let err = conn.who_am_i().await.unwrap_err();
    assert!(matches!(err, LdapError::ConnectionClosed { .. }), "{err:?}");
    assert!(started.elapsed() >= Duration::from_millis(150));
    wait_for_state(&conn, ConnectionState::Closed).await;
}

#[tokio::test]
async fn test_idle_timeout_ignores_quiet_connection_without_requests() {
    let server = MockServer::start(directory()).await;
    let options = ConnectionOptions {
        idle_timeout: Some(Duration::from_millis(50)),
        ..ConnectionOptions::default()
    };
    let conn = LdapConnection::connect(server.endpoint(), options).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(conn.is_usable());
    conn.who_am_i().await.unwrap();
}

#[tokio::test]
async fn test_close_sends_unbind() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;
    conn.who_am_i().await.unwrap();
    conn.close().await;
    assert_eq!(conn.state(), ConnectionState::Closed);

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.requests_with_tag(LDAP_TAG_UNBIND_REQUEST).len(), 1);
    assert!(conn.who_am_i().await.is_err());
}

#[tokio::test]
async fn test_close_fails_outstanding_requests() {
    let server = MockServer::start(silent()).await;
    let conn = connect(&server).await;
    let pending = conn
        .send_async(ExtendedRequest::who_am_i().to_element(), Vec::new(), None)
        .await
        .unwrap();
    conn.close().await;
    assert!(matches!(pending.wait().await.unwrap_err(), LdapError::ConnectionClosed { .. }));
}

#[tokio::test]
async fn test_abandon_sends_request_and_cancels_locally() {
    let server = MockServer::start(silent()).await;
    let conn = connect(&server).await;
    let pending = conn
        .send_async(search_request("dc=example,dc=com"), Vec::new(), None)
        .await
        .unwrap();
    let id = pending.message_id();
    conn.abandon(id).await.unwrap();

    assert!(matches!(pending.wait().await.unwrap_err(), LdapError::Cancelled { message_id } if message_id == id));
    tokio::time::sleep(Duration::from_millis(50)).await;
    let abandons = server.requests_with_tag(LDAP_TAG_ABANDON_REQUEST);
    assert_eq!(abandons.len(), 1);
    assert_eq!(abandons[0].protocol_op.as_integer().unwrap(), i64::from(id));
    assert_ne!(abandons[0].message_id, id);
}

#[tokio::test]
async fn test_cancel_operation_returns_result_code() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;
    assert_eq!(conn.cancel_operation(7).await.unwrap(), ResultCode::SUCCESS);
}

#[tokio::test]
async fn test_start_tls_refused() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;
    let err = conn.start_tls(&TlsSettings::insecure()).await.unwrap_err();
    assert!(
        matches!(err, LdapError::Connect { phase: ConnectPhase::StartTls, .. }),
        "{err:?}"
    );
    assert!(!conn.is_secure());
    assert!(conn.is_usable());
}

#[tokio::test]
async fn test_start_tls_requires_established_state() {
    let server = MockServer::start(directory()).await;
    let conn = connect(&server).await;
    conn.bind_simple(BIND_DN, PASSWORD).await.unwrap();
    let err = conn.start_tls(&TlsSettings::insecure()).await.unwrap_err();
    assert!(matches!(err, LdapError::InvalidState { .. }));
}

#[tokio::test]
async fn test_failed_tls_upgrade_closes_connection() {
    // the mock does not speak TLS, so the handshake cannot complete
    let server = MockServer::start(directory()).await;
    let options = ConnectionOptions {
        connect_timeout: Duration::from_secs(2),
        ..ConnectionOptions::default()
    };
    let conn = LdapConnection::connect(server.endpoint(), options).await.unwrap();
    let err = conn.upgrade_transport(&TlsSettings::insecure()).await.unwrap_err();
    assert!(matches!(err, LdapError::Tls { .. }), "{err:?}");
    assert_eq!(conn.state(), ConnectionState::Closed);
}

#[tokio::test]
async fn test_start_tls_upgrade_keeps_outstanding_request() {
    let fixture = tls_fixture();
    let held = Arc::new(Mutex::new(None));
    let handler: Handler = {
        let held = Arc::clone(&held);
        let inner = tls_directory();
        Arc::new(move |request: &LdapMessage| {
            if request.op_tag() == LDAP_TAG_SEARCH_REQUEST {
                *held.lock().unwrap() = Some(request.message_id);
                return Vec::new();
            }
            let mut replies = inner(request);
            // answer the held search once the upgrade is behind us
            if !replies.iter().any(|r| matches!(r, Reply::UpgradeTls)) {
                if let Some(id) = held.lock().unwrap().take() {
                    replies.insert(0, search_done(id));
                }
            }
            replies
        })
    };
    let server = MockServer::start_with_tls(handler, fixture.acceptor).await;
    let conn = connect(&server).await;

    let pending = conn
        .send_async(search_request("dc=example,dc=com"), Vec::new(), None)
        .await
        .unwrap();
    let search_id = pending.message_id();

    conn.start_tls(&fixture.client).await.unwrap();
    assert!(conn.is_secure());
    assert_eq!(conn.state(), ConnectionState::Established);
    assert_eq!(conn.outstanding_requests(), 1);

    assert_eq!(conn.who_am_i().await.unwrap(), format!("dn:{}", BIND_DN));
    let done = pending.wait().await.unwrap();
    assert_eq!(done.message_id, search_id);
    assert_eq!(done.op_tag(), LDAP_TAG_SEARCH_RESULT_DONE);
    assert_eq!(conn.outstanding_requests(), 0);
    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests().len(), 3);
}

#[tokio::test]
async fn test_cancelled_send_still_writes_whole_request() {
    // the server reads nothing for a while, so a large request cannot be
    // written before the caller gives up
    let greeting = vec![Reply::Sleep(Duration::from_millis(300))];
    let server = MockServer::start_with_greeting(directory(), greeting).await;
    let conn = connect(&server).await;

    let payload = Bytes::from(vec![0x5a; 16 * 1024 * 1024]);
    let large = ExtendedRequest::new("1.3.6.1.4.1.99999.1", Some(payload.clone())).to_element();
    let gave_up = tokio::time::timeout(Duration::from_millis(50), conn.send(large, Vec::new())).await;
    assert!(gave_up.is_err());
    assert_eq!(conn.outstanding_requests(), 0);

    assert_eq!(conn.who_am_i().await.unwrap(), format!("dn:{}", BIND_DN));
    assert!(conn.is_usable());

    let requests = server.requests_with_tag(LDAP_TAG_EXTENDED_REQUEST);
    assert_eq!(requests.len(), 2);
    let first = ExtendedRequest::from_element(&requests[0].protocol_op).unwrap();
    assert_eq!(first.value, Some(payload));
    let second = ExtendedRequest::from_element(&requests[1].protocol_op).unwrap();
    assert_eq!(second.oid, WHO_AM_I_OID);
}

#[tokio::test]
async fn test_drop_fails_outstanding_requests() {
    let server = MockServer::start(silent()).await;
    let conn = connect(&server).await;
    let pending = conn
        .send_async(ExtendedRequest::who_am_i().to_element(), Vec::new(), None)
        .await
        .unwrap();
    drop(conn);
    assert!(pending.wait().await.is_err());
}
