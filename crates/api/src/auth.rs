//! JWT verification and the authenticated-caller extractor
//!
//! Tokens are issued by the account service; this process only verifies
//! them. The verified claims become [`chatwire_shared::Claims`], which the
//! engine treats as trusted input.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use chatwire_shared::{Claims, Role};

use crate::error::ApiError;
use crate::state::AppState;

/// Wire shape of a chatwire JWT
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JwtClaims {
    /// Subject (user ID)
    pub sub: Uuid,
    pub tenant_id: Uuid,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub site_id: Option<Uuid>,
    pub iat: i64,
    pub exp: i64,
}

/// Verifies bearer tokens with the shared HS256 secret
#[derive(Clone)]
pub struct JwtVerifier {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn verify(&self, token: &str) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = decode::<JwtClaims>(token, &self.decoding_key, &validation)
            .map_err(|_| ApiError::InvalidToken)?;
        Ok(Claims {
            user_id: data.claims.sub,
            tenant_id: data.claims.tenant_id,
            role: data.claims.role,
            site_id: data.claims.site_id,
        })
    }

    /// Mint a token for the given identity. Used by tests and local tooling.
    pub fn issue(&self, claims: &Claims, ttl: Duration) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let wire = JwtClaims {
            sub: claims.user_id,
            tenant_id: claims.tenant_id,
            role: claims.role,
            site_id: claims.site_id,
            iat: now.unix_timestamp(),
            exp: (now + ttl).unix_timestamp(),
        };
        encode(&Header::new(Algorithm::HS256), &wire, &self.encoding_key)
            .map_err(|_| ApiError::Internal)
    }
}

/// Extractor for the authenticated caller on REST routes
pub struct AuthedUser(pub Claims);

#[async_trait]
impl FromRequestParts<AppState> for AuthedUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError::Unauthorized)?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError::Unauthorized)?;
        Ok(AuthedUser(state.verifier.verify(token)?))
    }
}
