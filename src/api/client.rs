//! HTTP client for the relay API.
//!
//! Thin wrapper over reqwest that attaches the access token, transparently
//! refreshes it once on a 401, and exposes typed helpers for the endpoints
//! the core consumes.

use reqwest::Method;
use reqwest::header::AUTHORIZATION;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::{Mutex, PoisonError};

use super::models::{
    AccessTokenResponse, InstanceDto, InstanceUserDto, LoginEphemeralRequest,
    LoginEphemeralResponse, LoginFinalizeRequest, LoginFinalizeResponse, LoginSaltRequest,
    LoginSaltResponse, SignupRequest, TwoFactorRequest,
};
use crate::error::{Error, Result};

/// User-agent sent on every HTTP call.
pub const USER_AGENT: &str = concat!("Gladys/", env!("CARGO_PKG_VERSION"));

/// Which kind of principal this client authenticates as. Determines the
/// token-refresh endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// A user device (phone, browser).
    User,
    /// A Gladys instance behind a NAT.
    Instance,
}

/// Relay HTTP client.
///
/// Tokens are interior state so one client can be shared by the session,
/// the peer directory and application code; the refresh-on-401 path updates
/// the access token for every holder at once.
pub struct ApiClient {
    http: reqwest::Client,
    server_url: String,
    role: Role,
    access_token: Mutex<Option<String>>,
    refresh_token: Mutex<Option<String>>,
}

impl ApiClient {
    /// Create a client for `server_url`.
    pub fn new(server_url: impl Into<String>, role: Role) -> Result<Self> {
        let http = reqwest::Client::builder().user_agent(USER_AGENT).build()?;
        let server_url = server_url.into().trim_end_matches('/').to_string();
        Ok(Self {
            http,
            server_url,
            role,
            access_token: Mutex::new(None),
            refresh_token: Mutex::new(None),
        })
    }

    /// The role this client authenticates as.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Install or replace the session tokens.
    pub fn set_tokens(&self, access_token: Option<String>, refresh_token: Option<String>) {
        *self.access_token.lock().unwrap_or_else(PoisonError::into_inner) = access_token;
        *self.refresh_token.lock().unwrap_or_else(PoisonError::into_inner) = refresh_token;
    }

    /// The current access token, if any.
    pub fn access_token(&self) -> Option<String> {
        self.access_token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn refresh_token(&self) -> Option<String> {
        self.refresh_token.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Exchange the refresh token for a fresh access token.
    ///
    /// # Errors
    /// [`Error::AuthExpired`] when there is no refresh token or the relay
    /// rejects it; the session cannot continue past this point.
    pub async fn refresh_access_token(&self) -> Result<String> {
        let refresh_token = self.refresh_token().ok_or(Error::AuthExpired)?;
        let path = match self.role {
            Role::User => "/users/access-token",
            Role::Instance => "/instances/access-token",
        };

        let response = self
            .http
            .get(format!("{}{}", self.server_url, path))
            .header(AUTHORIZATION, refresh_token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Error::AuthExpired);
        }

        let parsed: AccessTokenResponse = response.json().await?;
        *self.access_token.lock().unwrap_or_else(PoisonError::into_inner) = Some(parsed.access_token.clone());
        Ok(parsed.access_token)
    }

    async fn send_once(
        &self,
        method: &Method,
        path: &str,
        body: Option<&Value>,
    ) -> Result<reqwest::Response> {
        let mut request = self
            .http
            .request(method.clone(), format!("{}{}", self.server_url, path));
        if let Some(token) = self.access_token() {
            request = request.header(AUTHORIZATION, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    /// Perform a request with refresh-once-on-401 semantics.
    async fn request(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value> {
        let mut response = self.send_once(&method, path, body).await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            log::debug!("401 on {path}, refreshing access token");
            self.refresh_access_token().await?;
            response = self.send_once(&method, path, body).await?;
            if response.status() == reqwest::StatusCode::UNAUTHORIZED {
                return Err(Error::AuthExpired);
            }
        }

        let status = response.status();
        let text = response.text().await?;
        let parsed = if text.is_empty() {
            Value::Null
        } else {
            serde_json::from_str(&text).unwrap_or(Value::String(text))
        };

        if !status.is_success() {
            return Err(Error::Api {
                status: status.as_u16(),
                body: parsed,
            });
        }
        Ok(parsed)
    }

    /// `GET path`.
    pub async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    /// `POST path` with a JSON body.
    pub async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }

    /// `PATCH path` with a JSON body.
    pub async fn patch(&self, path: &str, body: &Value) -> Result<Value> {
        self.request(Method::PATCH, path, Some(body)).await
    }

    /// `DELETE path`.
    pub async fn delete(&self, path: &str) -> Result<Value> {
        self.request(Method::DELETE, path, None).await
    }

    async fn get_typed<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let value = self.get(path).await?;
        Ok(serde_json::from_value(value)?)
    }

    async fn post_typed<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &impl Serialize,
    ) -> Result<T> {
        let value = self.post(path, &serde_json::to_value(body)?).await?;
        Ok(serde_json::from_value(value)?)
    }

    // ---- login -------------------------------------------------------------

    /// SRP step 1: fetch the account's SRP salt.
    pub async fn login_salt(&self, email: &str) -> Result<LoginSaltResponse> {
        self.post_typed(
            "/users/login-salt",
            &LoginSaltRequest {
                email: email.to_string(),
            },
        )
        .await
    }

    /// SRP step 2: send the client ephemeral, receive the server's.
    pub async fn login_generate_ephemeral(
        &self,
        email: &str,
        client_ephemeral_public: &str,
    ) -> Result<LoginEphemeralResponse> {
        self.post_typed(
            "/users/login-generate-ephemeral",
            &LoginEphemeralRequest {
                email: email.to_string(),
                client_ephemeral_public: client_ephemeral_public.to_string(),
            },
        )
        .await
    }

    /// SRP step 3: send the client proof, receive the server proof and
    /// either a two-factor challenge or the final grant.
    pub async fn login_finalize(
        &self,
        login_session_key: &str,
        client_session_proof: &str,
    ) -> Result<LoginFinalizeResponse> {
        self.post_typed(
            "/users/login-finalize",
            &LoginFinalizeRequest {
                login_session_key: login_session_key.to_string(),
                client_session_proof: client_session_proof.to_string(),
            },
        )
        .await
    }

    /// Present a TOTP code for a pending two-factor challenge.
    pub async fn login_two_factor(
        &self,
        two_factor_token: &str,
        two_factor_code: &str,
    ) -> Result<LoginFinalizeResponse> {
        self.post_typed(
            "/users/login-two-factor",
            &TwoFactorRequest {
                two_factor_token: two_factor_token.to_string(),
                two_factor_code: two_factor_code.to_string(),
            },
        )
        .await
    }

    // ---- account -----------------------------------------------------------

    /// Register a new account.
    pub async fn signup(&self, request: &SignupRequest) -> Result<Value> {
        self.post("/users/signup", &serde_json::to_value(request)?)
            .await
    }

    /// Register under an invitation token.
    pub async fn accept_invitation(&self, request: &SignupRequest) -> Result<Value> {
        self.post("/invitations/accept", &serde_json::to_value(request)?)
            .await
    }

    /// Confirm an email address.
    pub async fn verify_email(&self, email_confirmation_token: &str) -> Result<Value> {
        self.post(
            "/users/verify",
            &serde_json::json!({ "email_confirmation_token": email_confirmation_token }),
        )
        .await
    }

    /// Start the password recovery flow.
    pub async fn forgot_password(&self, email: &str) -> Result<Value> {
        self.post("/users/forgot-password", &serde_json::json!({ "email": email }))
            .await
    }

    /// Finish the password recovery flow with fresh SRP credentials and
    /// re-wrapped keys.
    pub async fn reset_password(&self, request: &Value) -> Result<Value> {
        self.post("/users/reset-password", request).await
    }

    /// Fetch the current user.
    pub async fn get_myself(&self) -> Result<Value> {
        self.get("/users/me").await
    }

    /// Update the current user.
    pub async fn update_myself(&self, patch: &Value) -> Result<Value> {
        self.patch("/users/me", patch).await
    }

    // ---- instances ---------------------------------------------------------

    /// Create an instance on this account.
    pub async fn create_instance(&self, name: &str) -> Result<Value> {
        self.post("/instances", &serde_json::json!({ "name": name }))
            .await
    }

    /// List the account's instances.
    pub async fn list_instances(&self) -> Result<Vec<InstanceDto>> {
        self.get_typed("/instances").await
    }

    /// The account's primary instance.
    ///
    /// # Errors
    /// [`Error::NoInstance`] when the account has none.
    pub async fn primary_instance(&self) -> Result<InstanceDto> {
        let instances = self.list_instances().await?;
        instances
            .into_iter()
            .find(|instance| instance.primary_instance)
            .ok_or(Error::NoInstance)
    }

    /// The peer users of the instance this client belongs to.
    pub async fn instance_users(&self) -> Result<Vec<InstanceUserDto>> {
        self.get_typed("/instances/users").await
    }
}
