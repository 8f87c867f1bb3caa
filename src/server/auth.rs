//! Bearer-token authentication for sockets and HTTP routes.
//!
//! Tokens are HS256 JWTs signed with the shared pool secret. They are read
//! from the `Authorization: Bearer` header or from the `token` query
//! parameter, since browsers cannot set headers on WebSocket upgrades.

use super::state::ServerState;
use axum::{
    extract::{FromRequestParts, Query},
    http::{header, request::Parts, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use jsonwebtoken::{errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

use super::metrics::record_auth_failure;

/// What a connection is allowed to do once authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Submits jobs and reads the queue.
    Client,
    /// Executes jobs.
    Worker,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Worker => "worker",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub role: Role,
    pub exp: i64,
    pub iat: i64,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum TokenError {
    #[error("No token provided")]
    Missing,

    #[error("Invalid token: {0}")]
    Invalid(String),

    #[error("Token expired")]
    Expired,

    #[error("Authentication failed: {0}")]
    Unexpected(String),
}

/// Body of the `error` frame or 401 response sent on a rejected token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthErrorPayload {
    pub name: String,
    pub message: String,
}

impl TokenError {
    pub fn name(&self) -> &'static str {
        match self {
            TokenError::Missing | TokenError::Invalid(_) => "TokenInvalid",
            TokenError::Expired => "TokenExpired",
            TokenError::Unexpected(_) => "AuthenticationError",
        }
    }

    /// Failures we can explain to the peer. Anything else gets a generic
    /// message.
    pub fn is_recognised(&self) -> bool {
        !matches!(self, TokenError::Unexpected(_))
    }

    pub fn payload(&self) -> AuthErrorPayload {
        let message = if self.is_recognised() {
            self.to_string()
        } else {
            "Authentication failed".to_string()
        };
        AuthErrorPayload {
            name: self.name().to_string(),
            message,
        }
    }
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        match err.kind() {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidToken
            | ErrorKind::InvalidSignature
            | ErrorKind::InvalidAlgorithm
            | ErrorKind::MissingRequiredClaim(_)
            | ErrorKind::ImmatureSignature
            | ErrorKind::Base64(_)
            | ErrorKind::Json(_)
            | ErrorKind::Utf8(_) => TokenError::Invalid(err.to_string()),
            _ => TokenError::Unexpected(err.to_string()),
        }
    }
}

/// Verifies and mints pool tokens.
#[derive(Clone)]
pub struct TokenVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    validation: Validation,
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_required_spec_claims(&["exp", "sub"]);
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding_key, &self.validation)?;
        Ok(data.claims)
    }

    pub fn issue(&self, sub: &str, role: Role, ttl: Duration) -> Result<String, TokenError> {
        let iat = Utc::now().timestamp();
        let claims = Claims {
            sub: sub.to_string(),
            role,
            iat,
            exp: iat + ttl.as_secs() as i64,
        };
        self.encode(&claims)
    }

    /// Sign arbitrary claims, including already expired ones.
    pub fn encode(&self, claims: &Claims) -> Result<String, TokenError> {
        jsonwebtoken::encode(&Header::default(), claims, &self.encoding_key)
            .map_err(|e| TokenError::Unexpected(e.to_string()))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

/// Read the bearer token off a request, header first.
pub fn extract_token(parts: &Parts) -> Option<String> {
    let from_header = parts
        .headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    from_header.or_else(|| {
        Query::<TokenQuery>::try_from_uri(&parts.uri)
            .ok()
            .and_then(|Query(q)| q.token)
            .filter(|v| !v.is_empty())
    })
}

fn authenticate(parts: &Parts, state: &ServerState) -> Result<Claims, TokenError> {
    let token = extract_token(parts).ok_or(TokenError::Missing)?;
    let result = state.token_verifier.verify(&token);
    match &result {
        Ok(claims) => debug!("Authenticated {} as {:?}", claims.sub, claims.role),
        Err(e) if e.is_recognised() => {
            debug!("Rejected token: {}", e);
            record_auth_failure(e.name());
        }
        Err(e) => {
            warn!("Unexpected authentication failure: {}", e);
            record_auth_failure(e.name());
        }
    }
    result
}

/// Outcome of authenticating a socket upgrade.
///
/// Never rejects: the socket is upgraded either way so the failure can be
/// reported as an `error` frame before closing.
pub struct ConnectionAuth(pub Result<Claims, TokenError>);

impl FromRequestParts<ServerState> for ConnectionAuth {
    type Rejection = Infallible;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        Ok(ConnectionAuth(authenticate(parts, state)))
    }
}

/// Verified claims for HTTP routes.
pub struct AuthClaims(pub Claims);

pub struct AuthRejection(pub TokenError);

impl IntoResponse for AuthRejection {
    fn into_response(self) -> Response {
        (StatusCode::UNAUTHORIZED, Json(self.0.payload())).into_response()
    }
}

impl FromRequestParts<ServerState> for AuthClaims {
    type Rejection = AuthRejection;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &ServerState,
    ) -> Result<Self, Self::Rejection> {
        authenticate(parts, state)
            .map(AuthClaims)
            .map_err(AuthRejection)
    }
}
