use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Purpose a token was minted for. Serialized into the `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum TokenType {
    Access,
    Refresh,
    Approval,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
            TokenType::Approval => "approval",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Claims {
    /// Subject: the account email.
    pub sub: String,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub exp: i64,
    pub iss: String,
    pub jti: String,
}

impl Claims {
    pub fn issued_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.iat, 0).unwrap_or_default()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.exp, 0).unwrap_or_default()
    }
}

/// A freshly signed token together with the claims it carries.
#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: Claims,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn token_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&TokenType::Approval).unwrap(), "\"approval\"");
        assert_eq!(serde_json::from_str::<TokenType>("\"refresh\"").unwrap(), TokenType::Refresh);
        assert!(serde_json::from_str::<TokenType>("\"approved\"").is_err());
    }

    #[test]
    fn claims_use_type_field_name() {
        let claims = Claims {
            sub: "alice@example.com".to_string(),
            token_type: TokenType::Access,
            iat: 1_700_000_000,
            exp: 1_700_000_900,
            iss: "device-trust".to_string(),
            jti: "id".to_string(),
        };
        let value = serde_json::to_value(&claims).unwrap();
        assert_eq!(value["type"], "access");
        assert_eq!(claims.expires_at().timestamp() - claims.issued_at().timestamp(), 900);
    }
}
