//! Session scenarios against an in-memory relay transport.
//!
//! The fake relay records every emitted frame, answers emit-with-ack via a
//! pluggable responder (playing the part of the relay and of the remote
//! peer), and lets tests inject inbound frames and disconnects. REST calls
//! made during authentication hit a mockito server.

use async_trait::async_trait;
use p256::ecdsa::{SigningKey, VerifyingKey};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

use gladys_gateway_core::api::{ApiClient, Role};
use gladys_gateway_core::crypto::envelope::{self, DecryptOptions, Envelope};
use gladys_gateway_core::crypto::{jwk, keys};
use gladys_gateway_core::session::{
    AckHandle, Delivery, GatewayEvent, RelayTransport, SessionKeys, SessionState, SocketSession,
    TransportError, TransportEvent,
};
use gladys_gateway_core::Error;

type AckResponder = Box<dyn Fn(&str, &Value) -> Option<Value> + Send + Sync>;

/// In-memory transport standing in for the relay socket.
struct FakeRelay {
    events: Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>,
    emitted: Mutex<Vec<(String, Value)>>,
    pending: Mutex<Vec<oneshot::Sender<Value>>>,
    responder: Mutex<AckResponder>,
    closed: AtomicBool,
}

impl FakeRelay {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(None),
            emitted: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            responder: Mutex::new(Box::new(|event, _| {
                if event.ends_with("-authentication") {
                    Some(json!({ "authenticated": true }))
                } else {
                    None
                }
            })),
            closed: AtomicBool::new(false),
        })
    }

    fn set_responder(
        &self,
        responder: impl Fn(&str, &Value) -> Option<Value> + Send + Sync + 'static,
    ) {
        *self.responder.lock().unwrap() = Box::new(responder);
    }

    fn push_frame(&self, event: &str, data: Value) {
        let tx = self.events.lock().unwrap().clone().expect("not started");
        tx.send(TransportEvent::Frame {
            event: event.to_string(),
            data,
            ack: None,
        })
        .unwrap();
    }

    fn push_frame_with_ack(&self, event: &str, data: Value) -> oneshot::Receiver<Value> {
        let (handle, rx) = AckHandle::new();
        let tx = self.events.lock().unwrap().clone().expect("not started");
        tx.send(TransportEvent::Frame {
            event: event.to_string(),
            data,
            ack: Some(handle),
        })
        .unwrap();
        rx
    }

    fn push_disconnect(&self, reason: &str) {
        let tx = self.events.lock().unwrap().clone().expect("not started");
        tx.send(TransportEvent::Disconnected {
            reason: reason.to_string(),
        })
        .unwrap();
    }

    fn emitted(&self) -> Vec<(String, Value)> {
        self.emitted.lock().unwrap().clone()
    }

    fn resolve_pending(&self, value: Value) {
        for tx in self.pending.lock().unwrap().drain(..) {
            let _ = tx.send(value.clone());
        }
    }
}

#[async_trait]
impl RelayTransport for FakeRelay {
    async fn start(&self) -> Result<mpsc::UnboundedReceiver<TransportEvent>, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        tx.send(TransportEvent::Connected)
            .map_err(|_| TransportError::Closed)?;
        *self.events.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn emit(&self, event: &str, data: Value) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.emitted.lock().unwrap().push((event.to_string(), data));
        Ok(())
    }

    async fn emit_with_ack(&self, event: &str, data: Value) -> Result<Value, TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.emitted
            .lock()
            .unwrap()
            .push((event.to_string(), data.clone()));
        let reply = (self.responder.lock().unwrap())(event, &data);
        match reply {
            Some(reply) => Ok(reply),
            None => {
                let (tx, rx) = oneshot::channel();
                self.pending.lock().unwrap().push(tx);
                rx.await.map_err(|_| TransportError::Closed)
            }
        }
    }

    async fn reconnect(&self) -> Result<(), TransportError> {
        let tx = self
            .events
            .lock()
            .unwrap()
            .clone()
            .ok_or(TransportError::NotConnected)?;
        tx.send(TransportEvent::Connected)
            .map_err(|_| TransportError::Closed)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().unwrap().clear();
    }
}

struct Principal {
    keys: keys::GeneratedKeys,
    signer: SigningKey,
    verifier: VerifyingKey,
}

fn principal() -> Principal {
    let generated = keys::generate_keys().unwrap();
    let signer = SigningKey::from(&generated.ecdsa_private);
    let verifier = VerifyingKey::from(&generated.ecdsa_public);
    Principal {
        keys: generated,
        signer,
        verifier,
    }
}

fn session_keys(p: &Principal) -> SessionKeys {
    SessionKeys {
        rsa_private: p.keys.rsa_private.clone(),
        ecdsa_private: p.signer.clone(),
    }
}

fn instance_list_body(instance: &Principal) -> String {
    json!([{
        "id": "instance-1",
        "name": "home",
        "rsa_public_key": jwk::rsa_public_to_jwk(&instance.keys.rsa_public).unwrap(),
        "ecdsa_public_key": jwk::ec_public_to_jwk(&instance.keys.ecdsa_public),
        "primary_instance": true,
    }])
    .to_string()
}

fn user_entry(id: &str, gladys4: &str, connected: bool, user: &Principal) -> Value {
    json!({
        "id": id,
        "gladys_4_user_id": gladys4,
        "connected": connected,
        "rsa_public_key": jwk::rsa_public_to_jwk(&user.keys.rsa_public).unwrap(),
        "ecdsa_public_key": jwk::ec_public_to_jwk(&user.keys.ecdsa_public),
    })
}

async fn mount_user_rest(server: &mut mockito::Server, instance: &Principal) -> Vec<mockito::Mock> {
    let refresh = server
        .mock("GET", "/users/access-token")
        .with_status(200)
        .with_body(r#"{"access_token":"at-user"}"#)
        .create_async()
        .await;
    let instances = server
        .mock("GET", "/instances")
        .with_status(200)
        .with_body(instance_list_body(instance))
        .create_async()
        .await;
    vec![refresh, instances]
}

async fn mount_instance_rest(server: &mut mockito::Server, users: Value) -> Vec<mockito::Mock> {
    let refresh = server
        .mock("GET", "/instances/access-token")
        .with_status(200)
        .with_body(r#"{"access_token":"at-instance"}"#)
        .create_async()
        .await;
    let users = server
        .mock("GET", "/instances/users")
        .with_status(200)
        .with_body(users.to_string())
        .create_async()
        .await;
    vec![refresh, users]
}

async fn next_event(rx: &mut mpsc::UnboundedReceiver<GatewayEvent>) -> GatewayEvent {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a gateway event")
        .expect("event channel closed")
}

#[tokio::test]
async fn test_user_session_authenticates_and_reaches_ready() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    let (session, mut events) =
        SocketSession::connect(api, session_keys(&user), relay.clone())
            .await
            .unwrap();

    assert_eq!(session.state(), SessionState::Ready);
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    // The authentication frame carried the freshly refreshed token.
    let emitted = relay.emitted();
    let (event, data) = emitted.first().unwrap();
    assert_eq!(event, "user-authentication");
    assert_eq!(data["access_token"], "at-user");

    // Instance keys were primed for later envelope work.
    let peer = session.instance().unwrap();
    assert_eq!(peer.id, "instance-1");
}

#[tokio::test]
async fn test_rejected_refresh_token_closes_session() {
    let user = principal();

    let mut server = mockito::Server::new_async().await;
    let _refresh = server
        .mock("GET", "/users/access-token")
        .with_status(401)
        .create_async()
        .await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("revoked".to_string()));

    let relay = FakeRelay::new();
    let result = SocketSession::connect(api, session_keys(&user), relay).await;
    assert!(matches!(result, Err(Error::AuthExpired)));
}

#[tokio::test]
async fn test_auth_rejection_closes_session() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    relay.set_responder(|event, _| {
        if event.ends_with("-authentication") {
            Some(json!({ "authenticated": false }))
        } else {
            None
        }
    });

    let result = SocketSession::connect(api, session_keys(&user), relay).await;
    assert!(matches!(result, Err(Error::AuthRejected)));
}

#[tokio::test]
async fn test_api_call_over_e2ee_roundtrip() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    {
        // The responder plays the instance: decrypt the request, check its
        // shape, answer with an encrypted 200.
        let instance_rsa = instance.keys.rsa_private.clone();
        let instance_signer = instance.signer.clone();
        let user_verifier = user.verifier.clone();
        let user_rsa_pub = user.keys.rsa_public.clone();
        relay.set_responder(move |event, data| match event {
            e if e.ends_with("-authentication") => Some(json!({ "authenticated": true })),
            "message" => {
                assert_eq!(data["instance_id"], "instance-1");
                let sealed: Envelope =
                    serde_json::from_value(data["encryptedMessage"].clone()).unwrap();
                let payload = envelope::decrypt(
                    &instance_rsa,
                    &user_verifier,
                    &sealed,
                    DecryptOptions::default(),
                )
                .unwrap();
                assert_eq!(
                    payload,
                    json!({
                        "version": "1.0",
                        "type": "gladys-api-call",
                        "options": { "url": "/devices", "method": "GET", "query": { "limit": 10 } },
                    })
                );
                let response = envelope::encrypt(
                    &user_rsa_pub,
                    &instance_signer,
                    &json!({ "status": 200, "body": [{ "id": "lamp" }] }),
                )
                .unwrap();
                Some(serde_json::to_value(response).unwrap())
            }
            _ => None,
        });
    }

    let (session, _events) = SocketSession::connect(api, session_keys(&user), relay)
        .await
        .unwrap();

    let response = session
        .send_request_get("/devices", Some(json!({ "limit": 10 })))
        .await
        .unwrap();
    assert_eq!(response["status"], 200);
    assert_eq!(response["body"][0]["id"], "lamp");
}

#[tokio::test]
async fn test_api_call_error_status_rejects_with_payload() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    {
        let instance_signer = instance.signer.clone();
        let user_rsa_pub = user.keys.rsa_public.clone();
        relay.set_responder(move |event, _| match event {
            e if e.ends_with("-authentication") => Some(json!({ "authenticated": true })),
            "message" => {
                let response = envelope::encrypt(
                    &user_rsa_pub,
                    &instance_signer,
                    &json!({ "status": 404, "error": "Route not found" }),
                )
                .unwrap();
                Some(serde_json::to_value(response).unwrap())
            }
            _ => None,
        });
    }

    let (session, _events) = SocketSession::connect(api, session_keys(&user), relay)
        .await
        .unwrap();

    match session.send_request_get("/nope", None).await {
        Err(Error::RequestFailed(payload)) => assert_eq!(payload["status"], 404),
        other => panic!("expected RequestFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transport_level_error_ack_rejects_as_is() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    relay.set_responder(|event, _| match event {
        e if e.ends_with("-authentication") => Some(json!({ "authenticated": true })),
        "message" => Some(json!({ "status": 500, "error_code": "SERVER_ERROR" })),
        _ => None,
    });

    let (session, _events) = SocketSession::connect(api, session_keys(&user), relay)
        .await
        .unwrap();

    match session.send_request_get("/devices", None).await {
        Err(Error::RequestFailed(payload)) => {
            assert_eq!(payload["error_code"], "SERVER_ERROR");
        }
        other => panic!("expected RequestFailed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_instance_session_decrypts_and_responds() {
    let instance = principal();
    let user = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([user_entry("peer-user", "g4-user", true, &user)]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (_session, mut events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    // The user sends an API call through the relay.
    let request = envelope::encrypt(
        &instance.keys.rsa_public,
        &user.signer,
        &json!({
            "version": "1.0",
            "type": "gladys-api-call",
            "options": { "url": "/devices", "method": "GET", "query": { "limit": 10 } },
        }),
    )
    .unwrap();
    let ack_rx = relay.push_frame_with_ack(
        "message",
        json!({
            "sender_id": "peer-user",
            "encryptedMessage": request,
        }),
    );

    let (payload, responder) = match next_event(&mut events).await {
        GatewayEvent::Message { payload, responder } => (payload, responder),
        _ => panic!("expected a message event"),
    };
    assert_eq!(payload["type"], "gladys-api-call");
    assert_eq!(payload["options"]["url"], "/devices");

    // Answer through the continuation; the user can decrypt the ack.
    responder
        .expect("instance messages carry a responder")
        .respond(&json!({ "status": 200, "body": [] }))
        .unwrap();

    let ack = tokio::time::timeout(Duration::from_secs(5), ack_rx)
        .await
        .unwrap()
        .unwrap();
    let sealed: Envelope = serde_json::from_value(ack).unwrap();
    let response = envelope::decrypt(
        &user.keys.rsa_private,
        &instance.verifier,
        &sealed,
        DecryptOptions::default(),
    )
    .unwrap();
    assert_eq!(response["status"], 200);
}

#[tokio::test]
async fn test_unknown_sender_frame_is_dropped_after_one_refresh() {
    let instance = principal();
    let user = principal();

    let mut server = mockito::Server::new_async().await;
    let _refresh = server
        .mock("GET", "/instances/access-token")
        .with_status(200)
        .with_body(r#"{"access_token":"at-instance"}"#)
        .create_async()
        .await;
    // One fetch during authentication, exactly one more for the miss.
    let users_mock = server
        .mock("GET", "/instances/users")
        .with_status(200)
        .with_body(json!([user_entry("peer-user", "g4-user", true, &user)]).to_string())
        .expect(2)
        .create_async()
        .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (_session, mut events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    let sealed = envelope::encrypt(&instance.keys.rsa_public, &user.signer, &json!({"x": 1}))
        .unwrap();
    relay.push_frame(
        "message",
        json!({ "sender_id": "ghost", "encryptedMessage": sealed }),
    );

    // The payload never reaches the caller; only the typed drop reason does.
    match next_event(&mut events).await {
        GatewayEvent::FrameDropped {
            error: Error::UnknownSender(id),
        } => assert_eq!(id, "ghost"),
        GatewayEvent::Message { .. } => panic!("unknown-sender frame must not be delivered"),
        _ => panic!("expected a frame-dropped notification"),
    }
    assert!(events.try_recv().is_err());
    users_mock.assert_async().await;
}

#[tokio::test]
async fn test_impostor_signature_surfaces_crypto_drop() {
    let instance = principal();
    let user = principal();
    let impostor = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([user_entry("peer-user", "g4-user", true, &user)]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (_session, mut events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    // Signed with the impostor's key but claiming peer-user as sender.
    let sealed = envelope::encrypt(
        &instance.keys.rsa_public,
        &impostor.signer,
        &json!({ "x": 1 }),
    )
    .unwrap();
    relay.push_frame(
        "message",
        json!({ "sender_id": "peer-user", "encryptedMessage": sealed }),
    );

    match next_event(&mut events).await {
        GatewayEvent::FrameDropped {
            error: Error::Crypto(e),
        } => assert!(matches!(
            e,
            gladys_gateway_core::crypto::CryptoError::BadSignature
        )),
        GatewayEvent::Message { .. } => panic!("forged frame must not be delivered"),
        _ => panic!("expected a frame-dropped notification"),
    }
}

#[tokio::test]
async fn test_broadcast_skips_disconnected_users() {
    let instance = principal();
    let alice = principal();
    let bob = principal();
    let carol = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([
            user_entry("peer-alice", "g4-alice", true, &alice),
            user_entry("peer-bob", "g4-bob", false, &bob),
            user_entry("peer-carol", "g4-carol", true, &carol),
        ]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (session, _events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();

    let sent = session
        .new_event_instance("deviceStateChange", json!({ "id": "x" }))
        .await
        .unwrap();
    assert_eq!(sent, 2);

    let frames: Vec<(String, Value)> = relay
        .emitted()
        .into_iter()
        .filter(|(event, _)| event == "message")
        .collect();
    assert_eq!(frames.len(), 2);

    let mut recipients: Vec<String> = frames
        .iter()
        .map(|(_, data)| data["user_id"].as_str().unwrap().to_string())
        .collect();
    recipients.sort();
    assert_eq!(recipients, ["peer-alice", "peer-carol"]);

    // The delivered payload is the exact gladys-event document.
    let alice_frame = frames
        .iter()
        .find(|(_, data)| data["user_id"] == "peer-alice")
        .unwrap();
    let sealed: Envelope =
        serde_json::from_value(alice_frame.1["encryptedMessage"].clone()).unwrap();
    let payload = envelope::decrypt(
        &alice.keys.rsa_private,
        &instance.verifier,
        &sealed,
        DecryptOptions::default(),
    )
    .unwrap();
    assert_eq!(
        payload,
        json!({
            "version": "1.0",
            "type": "gladys-event",
            "event": "deviceStateChange",
            "data": { "id": "x" },
        })
    );
}

#[tokio::test]
async fn test_send_message_to_offline_user_is_skipped() {
    let instance = principal();
    let bob = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([user_entry("peer-bob", "g4-bob", false, &bob)]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (session, _events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();

    let outcome = session
        .send_message_to_user("g4-bob", &json!({ "hello": "bob" }))
        .await
        .unwrap();
    assert_eq!(outcome, Delivery::Skipped);
    assert!(
        relay
            .emitted()
            .iter()
            .all(|(event, _)| event != "message")
    );
}

#[tokio::test]
async fn test_server_initiated_disconnect_reconnects_and_pending_survives() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    // Authentication acks immediately; message acks stay pending until the
    // test resolves them, simulating a response that arrives late.
    relay.set_responder(|event, _| {
        if event.ends_with("-authentication") {
            Some(json!({ "authenticated": true }))
        } else {
            None
        }
    });

    let (session, mut events) =
        SocketSession::connect(api, session_keys(&user), relay.clone())
            .await
            .unwrap();
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    // Queue a request whose ack has not arrived yet.
    let pending_session = session;
    let request = tokio::spawn(async move {
        let result = pending_session
            .send_request_get("/devices", None)
            .await;
        (pending_session, result)
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    // The relay kicks the socket; the session reconnects by itself.
    relay.push_disconnect("io server disconnect");
    assert!(matches!(
        next_event(&mut events).await,
        GatewayEvent::Disconnected { .. }
    ));
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    // The in-flight request resolves once its ack finally lands.
    let response = envelope::encrypt(
        &user.keys.rsa_public,
        &instance.signer,
        &json!({ "status": 200, "body": [] }),
    )
    .unwrap();
    relay.resolve_pending(serde_json::to_value(response).unwrap());

    let (session, result) = tokio::time::timeout(Duration::from_secs(5), request)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(result.unwrap()["status"], 200);
    assert_eq!(session.state(), SessionState::Ready);
}

#[tokio::test]
async fn test_clear_key_cache_rotates_peer_keys() {
    let instance = principal();
    let old_user = principal();
    let new_user = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([user_entry("peer-user", "g4-user", true, &old_user)]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (session, _events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();

    let before = session.peers().get("peer-user").await.unwrap();

    // The peer rotated its keys; the relay now serves the new JWKs (the
    // later mock wins) and notifies with clear-key-cache.
    let _rotated_users = server
        .mock("GET", "/instances/users")
        .with_status(200)
        .with_body(json!([user_entry("peer-user", "g4-user", true, &new_user)]).to_string())
        .create_async()
        .await;
    relay.push_frame("clear-key-cache", Value::Null);

    // Wait for the directory to pick up the rotated keys.
    let mut rotated = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if let Some(entry) = session.peers().get("peer-user").await {
            if entry.rsa_public_key_raw != before.rsa_public_key_raw {
                rotated = true;
                break;
            }
        }
    }
    assert!(rotated, "peer directory never picked up the rotated keys");

    // The next outbound message is encrypted under the new key...
    session
        .send_message_to_user("g4-user", &json!({ "hello": "again" }))
        .await
        .unwrap();
    let (_, data) = relay
        .emitted()
        .into_iter()
        .rev()
        .find(|(event, _)| event == "message")
        .unwrap();
    let sealed: Envelope = serde_json::from_value(data["encryptedMessage"].clone()).unwrap();

    let decrypted_new = envelope::decrypt(
        &new_user.keys.rsa_private,
        &instance.verifier,
        &sealed,
        DecryptOptions::default(),
    );
    assert!(decrypted_new.is_ok());

    // ...and a relay still holding the old key cannot read it.
    let decrypted_old = envelope::decrypt(
        &old_user.keys.rsa_private,
        &instance.verifier,
        &sealed,
        DecryptOptions::default(),
    );
    assert!(decrypted_old.is_err());
}

#[tokio::test]
async fn test_disconnect_closes_session_and_rejects_requests() {
    let user = principal();
    let instance = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_user_rest(&mut server, &instance).await;

    let api = ApiClient::new(server.url(), Role::User).unwrap();
    api.set_tokens(None, Some("rt-user".to_string()));

    let relay = FakeRelay::new();
    let (session, _events) = SocketSession::connect(api, session_keys(&user), relay)
        .await
        .unwrap();

    session.disconnect().await;
    assert_eq!(session.state(), SessionState::Closed);

    let result = session.send_request_get("/devices", None).await;
    assert!(matches!(result, Err(Error::SessionClosed)));
}

#[tokio::test]
async fn test_hello_frame_is_forwarded() {
    let instance = principal();
    let user = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([user_entry("peer-user", "g4-user", true, &user)]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (_session, mut events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    relay.push_frame("hello", json!({ "user_id": "peer-user" }));
    match next_event(&mut events).await {
        GatewayEvent::Hello { data } => assert_eq!(data["user_id"], "peer-user"),
        _ => panic!("expected a hello event"),
    }
}

#[tokio::test]
async fn test_open_api_message_passes_through_unencrypted() {
    let instance = principal();
    let user = principal();

    let mut server = mockito::Server::new_async().await;
    let _mocks = mount_instance_rest(
        &mut server,
        json!([user_entry("peer-user", "g4-user", true, &user)]),
    )
    .await;

    let api = ApiClient::new(server.url(), Role::Instance).unwrap();
    api.set_tokens(None, Some("rt-instance".to_string()));

    let relay = FakeRelay::new();
    let (_session, mut events) =
        SocketSession::connect(api, session_keys(&instance), relay.clone())
            .await
            .unwrap();
    assert!(matches!(next_event(&mut events).await, GatewayEvent::Ready));

    let ack_rx = relay.push_frame_with_ack(
        "open-api-message",
        json!({ "open_api_key": "k1", "data": { "text": "turn on the lamp" } }),
    );

    match next_event(&mut events).await {
        GatewayEvent::OpenApiMessage { payload, responder } => {
            assert_eq!(payload["data"]["text"], "turn on the lamp");
            responder
                .expect("open api messages carry a responder")
                .respond(json!({ "status": 200 }));
        }
        _ => panic!("expected an open-api message"),
    }

    let ack = tokio::time::timeout(Duration::from_secs(5), ack_rx)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ack["status"], 200);
}
