//! Credential gate: login against the host, bearer tokens, route guards.
//!
//! - `POST /api/auth/login` checks the credentials through a
//!   [`CredentialVerifier`] (the host sshd in production) and mints a
//!   `session`-class token.
//! - Protected HTTP routes require `Authorization: Bearer <session token>`;
//!   [`require_session`] resolves it to a [`Principal`] request extension.
//! - `/ws` and the proxy mount take `?token=` instead (browsers can't set
//!   headers on WebSocket upgrades).
//! - `GET /api/terminal/url` mints a `proxy`-class token that only the proxy
//!   mount accepts.
//!
//! Tokens live in memory only and are gone after a restart.

pub mod ssh;
pub mod store;

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Request, State},
    http::{header::AUTHORIZATION, HeaderMap},
    middleware::Next,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::state::AppState;
pub use ssh::{CredentialVerifier, SshVerifier, VerifyError};
pub use store::{TokenClass, TokenInfo, TokenStore};

/// Authentication failures. All of them end the request at the boundary.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("Invalid username or password")]
    BadCredentials,
    #[error("Unauthorized")]
    MissingToken,
    #[error("Unauthorized")]
    InvalidToken,
    #[error("Token not valid for this resource")]
    WrongTokenClass,
}

/// The identity a valid token resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub username: String,
}

/// A freshly minted token and its owner.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub username: String,
}

/// Issues, resolves and revokes tokens. Cloneable handle over shared state.
#[derive(Clone)]
pub struct CredentialGate {
    store: Arc<TokenStore>,
    verifier: Arc<dyn CredentialVerifier>,
    session_ttl: Duration,
    proxy_ttl: Duration,
}

impl CredentialGate {
    pub fn new(
        verifier: Arc<dyn CredentialVerifier>,
        session_ttl: Duration,
        proxy_ttl: Duration,
    ) -> Self {
        Self {
            store: Arc::new(TokenStore::new()),
            verifier,
            session_ttl,
            proxy_ttl,
        }
    }

    /// Check credentials against the oracle and mint a session token.
    ///
    /// Every oracle failure (rejection, timeout, refused connection) is
    /// reported as [`AuthError::BadCredentials`]; the distinction only goes to
    /// the log. The password is dropped when this returns.
    pub async fn login(&self, username: &str, password: &str) -> Result<IssuedToken, AuthError> {
        if let Err(e) = self.verifier.verify(username, password).await {
            match e {
                VerifyError::Rejected => info!(user = %username, "Login rejected"),
                VerifyError::Timeout(_) | VerifyError::Handshake(_) => {
                    warn!(user = %username, "Login failed: {e}");
                }
            }
            return Err(AuthError::BadCredentials);
        }

        let token = self
            .store
            .issue(username, TokenClass::Session, self.session_ttl);
        info!(user = %username, "Login succeeded, session token issued");
        Ok(IssuedToken {
            token,
            username: username.to_string(),
        })
    }

    /// Revoke a token. Unknown tokens are ignored.
    pub fn logout(&self, token: &str) {
        if self.store.revoke(token) {
            debug!("Token revoked");
        }
    }

    /// Mint a short-lived token usable only on the proxy mount.
    pub fn issue_proxy_token(&self, principal: &Principal) -> IssuedToken {
        let token = self
            .store
            .issue(&principal.username, TokenClass::Proxy, self.proxy_ttl);
        debug!(user = %principal.username, "Proxy token issued");
        IssuedToken {
            token,
            username: principal.username.clone(),
        }
    }

    /// Resolve `token` to its principal, requiring the given class.
    pub fn authenticate(
        &self,
        token: Option<&str>,
        class: TokenClass,
    ) -> Result<Principal, AuthError> {
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::MissingToken)?;
        let info = self.store.lookup(token).ok_or(AuthError::InvalidToken)?;
        if info.class != class {
            return Err(AuthError::WrongTokenClass);
        }
        Ok(Principal {
            username: info.username,
        })
    }

    /// Remove every token past its TTL. Called from one periodic task.
    pub fn sweep_expired(&self) -> usize {
        self.store.sweep(Instant::now())
    }

    /// Number of tokens currently held.
    pub fn token_count(&self) -> usize {
        self.store.len()
    }
}

/// Extract the token from an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Axum middleware guarding protected routes with a session token.
///
/// On success the resolved [`Principal`] is inserted as a request extension.
/// Any failure is a `401` with a JSON `{"error": ...}` body.
pub async fn require_session(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let principal = match state
        .gate
        .authenticate(bearer_token(request.headers()), TokenClass::Session)
    {
        Ok(p) => p,
        Err(e) => {
            let e = match e {
                // A proxy token on an API route is simply not a session token.
                AuthError::WrongTokenClass => AuthError::InvalidToken,
                other => other,
            };
            return ApiError::from(e).into_response();
        }
    };
    request.extensions_mut().insert(principal);
    next.run(request).await
}
