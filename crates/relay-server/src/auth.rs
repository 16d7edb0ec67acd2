//! Authentication handshake and token service.
//!
//! Every connection starts `Unauthenticated` with a timer armed. Until AUTH
//! succeeds, any other message is answered with AUTH_RESULT 401 and the
//! connection closes. Afterwards each message must carry a token whose
//! subject matches both the header and the connection identity.

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Validation};
use metrics::counter;
use relay_core::body::{AUTH_TIMEOUT, UNAUTHORIZED};
use relay_core::{AuthRequest, AuthResult, Header, Message, ProtocolKey, StatusBody};
use relay_settings::{AuthSettings, ReauthPolicy};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{AuthState, Connection};
use crate::errors::AuthError;
use crate::metrics::AUTH_TOTAL;

// ── Tokens ──────────────────────────────────────────────────────────

/// Verified token contents.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenClaims {
    /// User the token was issued to.
    pub subject: String,
    /// Issue time, epoch seconds.
    pub issued_at: i64,
    /// Expiry, epoch seconds.
    pub expires_at: i64,
}

/// Issues and verifies bearer tokens.
pub trait TokenService: Send + Sync {
    /// Token for `subject` valid for `ttl_minutes`.
    fn issue(&self, subject: &str, ttl_minutes: u32) -> Result<String, AuthError>;

    /// Check signature and expiry.
    fn verify(&self, token: &str) -> Result<TokenClaims, AuthError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct JwtClaims {
    sub: String,
    iat: i64,
    exp: i64,
}

/// HS256 JWT tokens.
pub struct JwtTokenService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtTokenService {
    /// Service signing with `secret`.
    pub fn new(secret: &[u8]) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            validation,
        }
    }
}

impl TokenService for JwtTokenService {
    fn issue(&self, subject: &str, ttl_minutes: u32) -> Result<String, AuthError> {
        let iat = relay_core::now_millis() / 1000;
        let claims = JwtClaims {
            sub: subject.to_owned(),
            iat,
            exp: iat + i64::from(ttl_minutes) * 60,
        };
        let header = jsonwebtoken::Header::new(Algorithm::HS256);
        Ok(jsonwebtoken::encode(&header, &claims, &self.encoding)?)
    }

    fn verify(&self, token: &str) -> Result<TokenClaims, AuthError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.decoding, &self.validation)?;
        Ok(TokenClaims {
            subject: data.claims.sub,
            issued_at: data.claims.iat,
            expires_at: data.claims.exp,
        })
    }
}

// ── Credentials ─────────────────────────────────────────────────────

/// Checks the user id and password carried by AUTH.
#[async_trait]
pub trait CredentialVerifier: Send + Sync {
    /// `Ok` accepts. [`AuthError::InvalidCredentials`] refuses with 401; any
    /// other error is reported as 500.
    async fn verify(&self, request: &AuthRequest) -> Result<(), AuthError>;
}

/// Fixed user/password table.
#[derive(Debug, Default)]
pub struct StaticCredentials {
    users: HashMap<String, String>,
}

impl StaticCredentials {
    /// Empty table; every AUTH is refused.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an account.
    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>, password: impl Into<String>) -> Self {
        let _ = self.users.insert(user_id.into(), password.into());
        self
    }
}

#[async_trait]
impl CredentialVerifier for StaticCredentials {
    async fn verify(&self, request: &AuthRequest) -> Result<(), AuthError> {
        match self.users.get(&request.user_id) {
            Some(password) if *password == request.password => Ok(()),
            Some(_) => Err(AuthError::InvalidCredentials("wrong password".into())),
            None => Err(AuthError::InvalidCredentials(format!(
                "unknown user {}",
                request.user_id
            ))),
        }
    }
}

// ── Handshake ───────────────────────────────────────────────────────

/// What the receive path does with a message after the auth gate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GateOutcome {
    /// Continue to spoof-correction and the inbound queue.
    Forward,
    /// The gate answered (or dropped) it.
    Consumed,
}

/// Per-connection authentication state machine.
pub struct AuthGate {
    enabled: bool,
    timeout: Duration,
    token_ttl_minutes: u32,
    reauth_policy: ReauthPolicy,
    tokens: Arc<dyn TokenService>,
    verifier: Arc<dyn CredentialVerifier>,
}

impl AuthGate {
    /// Gate configured from settings.
    pub fn new(
        settings: &AuthSettings,
        timeout: Duration,
        tokens: Arc<dyn TokenService>,
        verifier: Arc<dyn CredentialVerifier>,
    ) -> Self {
        Self {
            enabled: settings.enabled,
            timeout,
            token_ttl_minutes: settings.token_ttl_minutes,
            reauth_policy: settings.reauth_policy,
            tokens,
            verifier,
        }
    }

    /// Whether AUTH is required at all.
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Arm the auth timer, or admit immediately when auth is off.
    pub fn on_connect(&self, connection: &Arc<Connection>) {
        if !self.enabled {
            let _ = connection.mark_authenticated("", "");
            return;
        }

        let weak = Arc::downgrade(connection);
        let timeout = self.timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(connection) = weak.upgrade() else {
                return;
            };
            if connection.auth_state() == AuthState::Unauthenticated {
                counter!(AUTH_TOTAL, "result" => "timeout").increment(1);
                info!(session_id = connection.session_id, "auth timeout");
                let header = connection.header(ProtocolKey::AUTH_RESULT, 0);
                let body = AuthResult::failure(AUTH_TIMEOUT, "auth timeout");
                let _ = connection.send_body(header, &body);
                connection.close();
            }
        });
        connection.set_auth_timer(timer.abort_handle());
    }

    /// Run the gate for one received message.
    pub async fn check(&self, connection: &Arc<Connection>, message: &Message) -> GateOutcome {
        if !self.enabled {
            return GateOutcome::Forward;
        }

        match connection.auth_state() {
            AuthState::Closed => GateOutcome::Consumed,
            AuthState::Unauthenticated => {
                if message.key() == ProtocolKey::AUTH {
                    self.authenticate(connection, message).await;
                } else {
                    debug!(
                        session_id = connection.session_id,
                        protocol = %message.key(),
                        "message before AUTH"
                    );
                    let error = AuthError::InvalidCredentials("invalid protocol".into());
                    reject(connection, auth_result_header(&message.header), &error);
                }
                GateOutcome::Consumed
            }
            AuthState::Authenticated => {
                if message.key() == ProtocolKey::AUTH && self.reauth_policy == ReauthPolicy::Reauthenticate {
                    self.authenticate(connection, message).await;
                    return GateOutcome::Consumed;
                }
                match self.verify_identity(connection, &message.header) {
                    Ok(()) => GateOutcome::Forward,
                    Err(error) => {
                        counter!(AUTH_TOTAL, "result" => "identity_mismatch").increment(1);
                        warn!(
                            session_id = connection.session_id,
                            protocol = %message.key(),
                            request_id = message.request_id(),
                            %error,
                            "identity check failed"
                        );
                        let body = StatusBody::new(error.code(), error.to_string());
                        let _ = connection.send_body(message.header.reply(), &body);
                        connection.close();
                        GateOutcome::Consumed
                    }
                }
            }
        }
    }

    async fn authenticate(&self, connection: &Arc<Connection>, message: &Message) {
        let header = auth_result_header(&message.header);
        let request: AuthRequest = match message.body(connection.format) {
            Ok(request) => request,
            Err(error) => {
                let error = AuthError::InvalidCredentials(format!("malformed auth body: {error}"));
                reject(connection, header, &error);
                return;
            }
        };

        let checked = AssertUnwindSafe(self.verifier.verify(&request))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(AuthError::Verifier("verifier panicked".into())));
        let issued = checked.and_then(|()| self.tokens.issue(&request.user_id, self.token_ttl_minutes));

        match issued {
            Ok(token) => {
                if !connection.mark_authenticated(&request.user_id, &token) {
                    return;
                }
                counter!(AUTH_TOTAL, "result" => "success").increment(1);
                info!(
                    session_id = connection.session_id,
                    user_id = %request.user_id,
                    "auth success"
                );
                let body = AuthResult::success(token, connection.session_id);
                let _ = connection.send_body(header, &body);
            }
            Err(error) => reject(connection, header, &error),
        }
    }

    fn verify_identity(&self, connection: &Connection, header: &Header) -> Result<(), AuthError> {
        if header.token.is_empty() {
            return Err(AuthError::MissingToken);
        }
        let claims = self.tokens.verify(&header.token)?;
        if claims.subject != header.user_id || claims.subject != connection.user_id() {
            return Err(AuthError::SubjectMismatch {
                subject: claims.subject,
                user: header.user_id.clone(),
            });
        }
        Ok(())
    }
}

fn auth_result_header(request: &Header) -> Header {
    let mut header = request.reply();
    header.set_key(ProtocolKey::AUTH_RESULT);
    header
}

fn reject(connection: &Connection, header: Header, error: &AuthError) {
    let result = if error.code() == UNAUTHORIZED { "rejected" } else { "error" };
    counter!(AUTH_TOTAL, "result" => result).increment(1);
    warn!(session_id = connection.session_id, %error, "auth refused");
    let _ = connection.send_body(header, &AuthResult::failure(error.code(), error.to_string()));
    connection.close();
}
