//! Request/response and broadcast messaging over the socket.
//!
//! API-over-E2EE calls are fire-and-forget `message` emits whose transport
//! ack carries the encrypted response; the ack is the only correlation
//! mechanism, there is no explicit request id. Requests impose no timeout
//! of their own and stay valid across a reconnect until the transport
//! itself gives up.

use chrono::Utc;
use serde_json::{Value, json};

use super::socket::{SessionState, SocketSession};
use crate::crypto::envelope::{self, DecryptOptions, Envelope};
use crate::error::{Error, Result};

/// Outcome of a single-recipient send.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// The frame was emitted.
    Sent,
    /// The recipient is offline; nothing was emitted.
    Skipped,
}

impl SocketSession {
    fn ensure_open(&self) -> Result<()> {
        if self.state() == SessionState::Closed {
            return Err(Error::SessionClosed);
        }
        Ok(())
    }

    /// Call the instance's API through the encrypted channel.
    ///
    /// Composes a `gladys-api-call` payload, encrypts it for the instance,
    /// and emits it with an ack. A `GET` body travels as `query`, any other
    /// body as `data`.
    ///
    /// # Errors
    /// [`Error::RequestFailed`] carrying either the transport-level error
    /// object from the relay or a decrypted payload with `status >= 400`.
    pub async fn send_request_to_instance(
        &self,
        method: &str,
        path: &str,
        body: Option<Value>,
    ) -> Result<Value> {
        self.ensure_open()?;
        let instance = self.inner.instance_peer().ok_or(Error::NoInstanceId)?;

        let mut options = json!({ "url": path, "method": method });
        if let Some(body) = body {
            let key = if method.eq_ignore_ascii_case("GET") {
                "query"
            } else {
                "data"
            };
            options[key] = body;
        }
        let payload = json!({
            "version": "1.0",
            "type": "gladys-api-call",
            "options": options,
        });

        let sealed = envelope::encrypt(
            &instance.rsa_public_key,
            &self.inner.keys.ecdsa_private,
            &payload,
        )?;
        let ack = self
            .inner
            .transport
            .emit_with_ack(
                "message",
                json!({
                    "instance_id": instance.id,
                    "encryptedMessage": sealed,
                    "sent_at": sealed.sent_at,
                }),
            )
            .await?;

        // A relay-level failure comes back as a plain `{status, error_code}`
        // object instead of an envelope; it is rejected as-is.
        if ack.get("wrappedSymKey").is_none() {
            return Err(Error::RequestFailed(ack));
        }

        let response: Envelope = serde_json::from_value(ack)?;
        let payload = envelope::decrypt(
            &self.inner.keys.rsa_private,
            &instance.ecdsa_public_key,
            &response,
            DecryptOptions::default(),
        )?;

        if payload
            .get("status")
            .and_then(Value::as_i64)
            .is_some_and(|status| status >= 400)
        {
            return Err(Error::RequestFailed(payload));
        }
        Ok(payload)
    }

    /// `GET` through the encrypted channel; `query` carries the parameters.
    pub async fn send_request_get(&self, path: &str, query: Option<Value>) -> Result<Value> {
        self.send_request_to_instance("GET", path, query).await
    }

    /// `POST` through the encrypted channel.
    pub async fn send_request_post(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.send_request_to_instance("POST", path, body).await
    }

    /// `PATCH` through the encrypted channel.
    pub async fn send_request_patch(&self, path: &str, body: Option<Value>) -> Result<Value> {
        self.send_request_to_instance("PATCH", path, body).await
    }

    /// `DELETE` through the encrypted channel.
    pub async fn send_request_delete(&self, path: &str) -> Result<Value> {
        self.send_request_to_instance("DELETE", path, None).await
    }

    /// Send a payload to one user, addressed by Gladys 4 user id
    /// (instance sessions).
    ///
    /// Offline recipients are skipped without emitting anything; the
    /// [`Delivery::Skipped`] outcome makes that visible to the caller.
    ///
    /// # Errors
    /// [`Error::UnknownRecipient`] when the id is absent from the peer
    /// directory even after a refresh.
    pub async fn send_message_to_user(
        &self,
        gladys_4_user_id: &str,
        payload: &Value,
    ) -> Result<Delivery> {
        self.ensure_open()?;
        let peer = self
            .inner
            .peers
            .find_by_gladys4_user_id(&self.inner.api, gladys_4_user_id)
            .await?
            .ok_or_else(|| Error::UnknownRecipient(gladys_4_user_id.to_string()))?;

        if !peer.connected {
            return Ok(Delivery::Skipped);
        }

        let sealed = envelope::encrypt(
            &peer.rsa_public_key,
            &self.inner.keys.ecdsa_private,
            payload,
        )?;
        self.inner
            .transport
            .emit(
                "message",
                json!({
                    "user_id": peer.id,
                    "encryptedMessage": sealed,
                    "sent_at": sealed.sent_at,
                }),
            )
            .await?;
        Ok(Delivery::Sent)
    }

    /// Broadcast a payload to every connected user (instance sessions).
    ///
    /// Best-effort: no acks are awaited and a failure for one peer does not
    /// stop the others.
    ///
    /// # Returns
    /// The number of frames actually emitted.
    pub async fn send_message_all_users(&self, payload: &Value) -> Result<usize> {
        self.ensure_open()?;
        let peers = self.inner.peers.snapshot().await;
        let mut sent = 0;

        for peer in peers.into_iter().filter(|peer| peer.connected) {
            let sealed = match envelope::encrypt(
                &peer.rsa_public_key,
                &self.inner.keys.ecdsa_private,
                payload,
            ) {
                Ok(sealed) => sealed,
                Err(e) => {
                    log::warn!("broadcast encrypt for {} failed: {e}", peer.id);
                    continue;
                }
            };
            let frame = json!({
                "user_id": peer.id,
                "encryptedMessage": sealed,
                "sent_at": sealed.sent_at,
            });
            match self.inner.transport.emit("message", frame).await {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("broadcast emit to {} failed: {e}", peer.id),
            }
        }
        Ok(sent)
    }

    /// Broadcast a Gladys event to every connected user (instance sessions).
    pub async fn new_event_instance(&self, event: &str, data: Value) -> Result<usize> {
        let payload = json!({
            "version": "1.0",
            "type": "gladys-event",
            "event": event,
            "data": data,
        });
        self.send_message_all_users(&payload).await
    }

    /// Round-trip latency to the relay in milliseconds.
    ///
    /// Emits a `latency` frame carrying the current clock as the sentinel;
    /// the relay echoes it and the difference to now is the answer.
    pub async fn calculate_latency(&self) -> Result<i64> {
        self.ensure_open()?;
        let sentinel = Utc::now().timestamp_millis();
        self.inner
            .transport
            .emit_with_ack("latency", json!(sentinel))
            .await?;
        Ok(Utc::now().timestamp_millis() - sentinel)
    }
}
