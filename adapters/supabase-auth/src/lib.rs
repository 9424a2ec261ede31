//! supabase-auth — access token validation for Supabase-issued sessions.
//!
//! Purpose
//! - Turn an `Authorization` header into an authenticated user plus the raw
//!   access token, which callers forward to the data API.
//! - Two verification strategies:
//!   - `Remote`: ask the auth server (`GET {SUPABASE_URL}/auth/v1/user`) who
//!     the token belongs to. Always reflects revocation.
//!   - `Jwt`: verify the HS256 signature locally with the project JWT secret
//!     and validate `aud = authenticated` and `exp`.
//! - For development, signature checks in `Jwt` mode can be skipped
//!   (claims-only decoding that still checks `aud` and `exp`).
//!
//! API
//! - `SupabaseAuth::validate_user_and_token(auth_header)` →
//!   `Result<AuthenticatedUser, AuthError>`

use base64::Engine;
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, trace};

/// Audience Supabase puts on tokens of signed-in users.
pub const AUTHENTICATED_AUDIENCE: &str = "authenticated";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthenticatedUser {
    pub id: String,
    pub email: Option<String>,
    /// The bearer token the user was authenticated with.
    pub token: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("missing or malformed token")]
    Malformed,
    #[error("invalid token payload: {0}")]
    InvalidPayload(&'static str),
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("token expired")]
    Expired,
    #[error("audience mismatch")]
    BadAudience,
    #[error("token rejected by auth server")]
    Rejected,
    #[error("auth server returned status {0}")]
    Upstream(u16),
    #[error("network error talking to auth server")]
    Network,
}

/// Extract the token from an `Authorization` header value.
///
/// A leading `Bearer ` is stripped when present; a bare token is accepted as-is.
pub fn bearer_token(auth_header: Option<&str>) -> Result<&str, AuthError> {
    let raw = auth_header.ok_or(AuthError::MissingToken)?;
    let token = raw.strip_prefix("Bearer ").unwrap_or(raw).trim();
    if token.is_empty() {
        return Err(AuthError::MissingToken);
    }
    Ok(token)
}

#[derive(Debug, Deserialize)]
struct Claims {
    sub: Option<String>,
    aud: Option<serde_json::Value>,
    exp: Option<u64>,
    email: Option<String>,
}

// Subset of the user object returned by `GET /auth/v1/user`.
#[derive(Debug, Deserialize)]
struct RemoteUser {
    id: String,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Clone, Debug)]
enum Strategy {
    Remote {
        user_url: String,
        anon_key: String,
        http: reqwest::Client,
    },
    Jwt {
        secret: Option<String>,
        insecure_skip_signature: bool,
    },
}

/// Token validator configured with one verification strategy.
#[derive(Clone, Debug)]
pub struct SupabaseAuth {
    strategy: Strategy,
}

impl SupabaseAuth {
    /// Validate tokens by asking the auth server at `{supabase_url}/auth/v1/user`.
    pub fn remote(supabase_url: &str, anon_key: impl Into<String>) -> Self {
        Self {
            strategy: Strategy::Remote {
                user_url: format!("{}/auth/v1/user", supabase_url.trim_end_matches('/')),
                anon_key: anon_key.into(),
                http: reqwest::Client::new(),
            },
        }
    }

    /// Validate tokens locally against the project's HS256 JWT secret.
    ///
    /// With `insecure_skip_signature` only the claims are checked. Without a
    /// secret and with signature checks on, every token is rejected.
    pub fn jwt(secret: Option<String>, insecure_skip_signature: bool) -> Self {
        Self {
            strategy: Strategy::Jwt {
                secret,
                insecure_skip_signature,
            },
        }
    }

    /// Authenticate the caller behind an `Authorization` header.
    pub async fn validate_user_and_token(
        &self,
        auth_header: Option<&str>,
    ) -> Result<AuthenticatedUser, AuthError> {
        let token = bearer_token(auth_header)?;
        match &self.strategy {
            Strategy::Remote {
                user_url,
                anon_key,
                http,
            } => fetch_user(http, user_url, anon_key, token).await,
            Strategy::Jwt {
                secret,
                insecure_skip_signature,
            } => {
                if *insecure_skip_signature {
                    trace!("supabase-auth: insecure mode, skipping signature verification");
                    return verify_claims_only(token);
                }
                let secret = secret.as_deref().ok_or(AuthError::SignatureInvalid)?;
                verify_hs256(token, secret)
            }
        }
    }
}

async fn fetch_user(
    http: &reqwest::Client,
    user_url: &str,
    anon_key: &str,
    token: &str,
) -> Result<AuthenticatedUser, AuthError> {
    let resp = http
        .get(user_url)
        .header("apikey", anon_key)
        .bearer_auth(token)
        .send()
        .await
        .map_err(|e| {
            debug!(err = %e, "supabase-auth: user lookup failed");
            AuthError::Network
        })?;
    let status = resp.status();
    if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
        return Err(AuthError::Rejected);
    }
    if !status.is_success() {
        return Err(AuthError::Upstream(status.as_u16()));
    }
    let user: RemoteUser = resp
        .json()
        .await
        .map_err(|_| AuthError::InvalidPayload("user"))?;
    if user.id.is_empty() {
        return Err(AuthError::InvalidPayload("id"));
    }
    Ok(AuthenticatedUser {
        id: user.id,
        email: user.email,
        token: token.to_string(),
    })
}

fn verify_hs256(token: &str, secret: &str) -> Result<AuthenticatedUser, AuthError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_audience(&[AUTHENTICATED_AUDIENCE]);

    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::InvalidToken
        | jsonwebtoken::errors::ErrorKind::InvalidSignature
        | jsonwebtoken::errors::ErrorKind::InvalidAlgorithm => AuthError::SignatureInvalid,
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
        jsonwebtoken::errors::ErrorKind::InvalidAudience => AuthError::BadAudience,
        _ => AuthError::Malformed,
    })?;
    user_from_claims(data.claims, token)
}

fn verify_claims_only(token: &str) -> Result<AuthenticatedUser, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Malformed);
    }
    let payload_bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(parts[1].as_bytes())
        .map_err(|_| AuthError::Malformed)?;
    let claims: Claims =
        serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::InvalidPayload("json"))?;

    match &claims.aud {
        Some(serde_json::Value::String(s)) if s == AUTHENTICATED_AUDIENCE => {}
        Some(serde_json::Value::Array(arr))
            if arr.iter().any(|v| v.as_str() == Some(AUTHENTICATED_AUDIENCE)) => {}
        _ => return Err(AuthError::BadAudience),
    }

    let exp = claims.exp.ok_or(AuthError::InvalidPayload("exp"))?;
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();
    if exp <= now {
        return Err(AuthError::Expired);
    }

    user_from_claims(claims, token)
}

fn user_from_claims(claims: Claims, token: &str) -> Result<AuthenticatedUser, AuthError> {
    let id = claims
        .sub
        .filter(|s| !s.is_empty())
        .ok_or(AuthError::InvalidPayload("sub"))?;
    Ok(AuthenticatedUser {
        id,
        email: claims.email,
        token: token.to_string(),
    })
}
