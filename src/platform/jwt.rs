//! RS256 bearer tokens for browser sessions.

use std::time::Duration;

use chrono::Utc;
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde_json::{Map, Value};

use crate::errors::AuthError;

pub type Claims = Map<String, Value>;

pub const DEFAULT_ISSUER: &str = "treenq";

pub struct JwtIssuer {
    issuer: String,
    ttl: Duration,
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl std::fmt::Debug for JwtIssuer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtIssuer")
            .field("issuer", &self.issuer)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl JwtIssuer {
    /// Build an issuer from PEM-encoded RSA keys.
    pub fn new(
        issuer: impl Into<String>,
        private_pem: &str,
        public_pem: &str,
        ttl: Duration,
    ) -> Result<Self, AuthError> {
        if ttl.is_zero() {
            return Err(AuthError::Other(anyhow::anyhow!("auth ttl must be positive")));
        }
        let encoding = EncodingKey::from_rsa_pem(private_pem.as_bytes())
            .map_err(|e| AuthError::Other(anyhow::anyhow!("invalid auth private key: {}", e)))?;
        let decoding = DecodingKey::from_rsa_pem(public_pem.as_bytes())
            .map_err(|e| AuthError::Other(anyhow::anyhow!("invalid auth public key: {}", e)))?;
        Ok(Self {
            issuer: issuer.into(),
            ttl,
            encoding,
            decoding,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Sign `claims` plus `iat`, `exp` and `iss`.
    pub fn issue(&self, claims: Claims) -> Result<String, AuthError> {
        self.issue_at(claims, Utc::now().timestamp())
    }

    fn issue_at(&self, mut claims: Claims, now: i64) -> Result<String, AuthError> {
        let exp = now + self.ttl.as_secs() as i64;
        claims.insert("iat".into(), now.into());
        claims.insert("exp".into(), exp.into());
        claims.insert("iss".into(), self.issuer.clone().into());
        jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &self.encoding)
            .map_err(|e| AuthError::Other(anyhow::anyhow!("failed to sign token: {}", e)))
    }

    /// Verify signature, algorithm, expiry and issuer.
    ///
    /// Malformed tokens are `Unauthorized`; tokens that parse but fail a check
    /// are `Forbidden`.
    pub fn verify(&self, token: &str) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(Algorithm::RS256);
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss"]);
        validation.leeway = 0;

        jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidToken
                | ErrorKind::Base64(_)
                | ErrorKind::Json(_)
                | ErrorKind::Utf8(_) => AuthError::Unauthorized(format!("malformed token: {}", e)),
                _ => AuthError::Forbidden(e.to_string()),
            })
    }
}

/// Reads a string claim, empty when absent.
pub fn claim_str(claims: &Claims, key: &str) -> String {
    claims
        .get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

#[cfg(test)]
pub(crate) mod test_keys {
    pub const PRIVATE: &str = include_str!("../../tests/fixtures/auth_private.pem");
    pub const PUBLIC: &str = include_str!("../../tests/fixtures/auth_public.pem");
    pub const OTHER_PRIVATE: &str = include_str!("../../tests/fixtures/other_private.pem");

    pub fn issuer() -> super::JwtIssuer {
        super::JwtIssuer::new(
            super::DEFAULT_ISSUER,
            PRIVATE,
            PUBLIC,
            std::time::Duration::from_secs(3600),
        )
        .unwrap()
    }
}
