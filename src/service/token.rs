use crate::config::JwtConfig;
use crate::error::app_error::AppError;
use crate::models::token::{Claims, IssuedToken, TokenType};
use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use thiserror::Error;
use uuid::Uuid;

/// Why a presented token was not accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TokenError {
    #[error("Invalid token")]
    InvalidSignature,
    #[error("Token has expired")]
    Expired,
    #[error("Malformed token")]
    Malformed,
    #[error("Token is not valid for this operation")]
    WrongType,
}

impl TokenError {
    fn from_kind(kind: &ErrorKind) -> Self {
        match kind {
            ErrorKind::ExpiredSignature => TokenError::Expired,
            ErrorKind::InvalidSignature | ErrorKind::InvalidIssuer | ErrorKind::InvalidAlgorithm => TokenError::InvalidSignature,
            _ => TokenError::Malformed,
        }
    }
}

/// Mints and verifies HS256 tokens for the access, refresh and approval flows.
pub struct TokenService {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    issuer: String,
    validation: Validation,
}

impl TokenService {
    pub fn new(config: &JwtConfig) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        validation.set_issuer(&[config.issuer.as_str()]);
        validation.set_required_spec_claims(&["exp", "iss", "sub"]);

        Self {
            encoding_key: EncodingKey::from_secret(config.secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(config.secret.as_bytes()),
            issuer: config.issuer.clone(),
            validation,
        }
    }

    pub fn issue(&self, subject: &str, token_type: TokenType, ttl_seconds: i64) -> Result<IssuedToken, AppError> {
        self.issue_at(subject, token_type, ttl_seconds, Utc::now())
    }

    /// Mint a token as if the current time were `now`. Each call gets a fresh `jti`.
    pub fn issue_at(&self, subject: &str, token_type: TokenType, ttl_seconds: i64, now: DateTime<Utc>) -> Result<IssuedToken, AppError> {
        let iat = now.timestamp();
        let claims = Claims {
            sub: subject.to_string(),
            token_type,
            iat,
            exp: iat + ttl_seconds,
            iss: self.issuer.clone(),
            jti: Uuid::new_v4().to_string(),
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::signing(format!("Failed to sign {token_type} token"), e))?;

        Ok(IssuedToken { token, claims })
    }

    /// Check signature, expiry (no leeway) and issuer.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        decode::<Claims>(token, &self.decoding_key, &self.validation)
            .map(|data| data.claims)
            .map_err(|e| TokenError::from_kind(e.kind()))
    }

    pub fn verify_typed(&self, token: &str, expected: TokenType) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.token_type != expected {
            return Err(TokenError::WrongType);
        }
        Ok(claims)
    }

    /// Decode claims WITHOUT checking signature, issuer or expiry.
    ///
    /// Only for diagnostics such as logging who a rejected token claimed to be.
    /// Never base an authorization decision on the result.
    pub fn extract_claims_unverified(&self, token: &str) -> Result<Claims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        decode::<Claims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|e| TokenError::from_kind(e.kind()))
    }
}
