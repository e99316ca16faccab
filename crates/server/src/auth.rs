use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use shared::{
    domain::UserId,
    error::{ApiException, ErrorCode},
};

/// Issues and validates the signed identity token carried on every HTTP
/// request and socket handshake.
#[derive(Clone)]
pub struct Authenticator {
    secret: String,
    ttl_seconds: i64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: i64,
    iat: i64,
    exp: i64,
}

impl Authenticator {
    pub fn new(secret: impl Into<String>, ttl_seconds: i64) -> Self {
        Self {
            secret: secret.into(),
            ttl_seconds,
        }
    }

    pub fn issue(&self, user_id: UserId) -> Result<String, ApiException> {
        let now = Utc::now();
        let claims = Claims {
            sub: user_id.0,
            iat: now.timestamp(),
            exp: (now + Duration::seconds(self.ttl_seconds)).timestamp(),
        };
        encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.secret.as_bytes()),
        )
        .map_err(|e| ApiException::new(ErrorCode::Internal, format!("token issue failed: {e}")))
    }

    pub fn verify(&self, token: &str) -> Result<UserId, ApiException> {
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.secret.as_bytes()),
            &Validation::default(),
        )
        .map_err(|_| ApiException::new(ErrorCode::Unauthorized, "invalid or expired token"))?;
        Ok(UserId(data.claims.sub))
    }
}
