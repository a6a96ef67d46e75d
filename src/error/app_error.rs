use crate::service::token::TokenError;
use rocket::http::{ContentType, Header, Status};
use rocket::response::Responder;
use rocket::{Request, Response};
use rocket_okapi::OpenApiError;
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::Responses;
use rocket_okapi::response::OpenApiResponderInner;
use std::io::Cursor;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};
use validator::ValidationErrors;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Internal server error")]
    Db {
        message: String,
        #[source]
        source: sqlx::error::Error,
    },
    #[error("Internal server error")]
    Redis {
        message: String,
        #[source]
        source: redis::RedisError,
    },
    #[error("Internal server error")]
    Signing {
        message: String,
        #[source]
        source: jsonwebtoken::errors::Error,
    },
    #[error("{0}")]
    Token(#[from] TokenError),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Internal server error")]
    PasswordHash { message: String },
    #[error("Bad request: {0}")]
    BadRequest(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Too many requests, please retry later")]
    RateLimited { retry_after: Duration },
    #[error("Internal server error")]
    Timeout { operation: &'static str },
    #[error("Internal server error")]
    Email { message: String },
    #[error("Internal server error")]
    Internal(String),
    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationErrors),
    #[error("Internal server error")]
    ConfigurationError {
        message: String,
        #[source]
        source: figment::Error,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
}

impl AppError {
    pub fn db(message: impl Into<String>, source: sqlx::error::Error) -> Self {
        Self::Db {
            message: message.into(),
            source,
        }
    }

    pub fn redis(message: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            message: message.into(),
            source,
        }
    }

    pub fn signing(message: impl Into<String>, source: jsonwebtoken::errors::Error) -> Self {
        Self::Signing {
            message: message.into(),
            source,
        }
    }

    pub fn password_hash(message: impl Into<String>, source: password_hash::Error) -> Self {
        Self::PasswordHash {
            message: format!("{}: {}", message.into(), source),
        }
    }

    pub fn email(message: impl Into<String>) -> Self {
        Self::Email { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    fn is_server_error(&self) -> bool {
        Status::from(self).class().is_server_error()
    }
}

impl From<password_hash::Error> for AppError {
    fn from(e: password_hash::Error) -> Self {
        AppError::password_hash("Password hashing failed", e)
    }
}

impl From<redis::RedisError> for AppError {
    fn from(e: redis::RedisError) -> Self {
        AppError::redis("Redis error", e)
    }
}

impl From<&AppError> for Status {
    fn from(e: &AppError) -> Self {
        match e {
            AppError::InvalidCredentials => Status::BadRequest,
            AppError::Unauthorized => Status::Unauthorized,
            AppError::Token(_) => Status::Unauthorized,
            AppError::BadRequest(_) => Status::BadRequest,
            AppError::ValidationError(_) => Status::BadRequest,
            AppError::NotFound(_) => Status::NotFound,
            AppError::RateLimited { .. } => Status::TooManyRequests,
            AppError::Db { .. }
            | AppError::Redis { .. }
            | AppError::Signing { .. }
            | AppError::PasswordHash { .. }
            | AppError::Timeout { .. }
            | AppError::Email { .. }
            | AppError::Internal(_)
            | AppError::ConfigurationError { .. }
            | AppError::InvalidConfiguration(_) => Status::InternalServerError,
        }
    }
}

impl<'r> Responder<'r, 'static> for AppError {
    fn respond_to(self, req: &Request<'_>) -> rocket::response::Result<'static> {
        let method = req.method();
        let uri = req.uri();

        let request_id = req
            .local_cache(|| None::<crate::middleware::RequestId>)
            .as_ref()
            .map(|r| r.0.as_str())
            .unwrap_or("unknown");

        let subject = req
            .local_cache(|| None::<crate::auth::BearerAuth>)
            .as_ref()
            .map(|auth| auth.email.clone())
            .unwrap_or_else(|| "anonymous".to_string());

        if self.is_server_error() {
            error!(
                error = ?self,
                request_id = %request_id,
                subject = %subject,
                method = %method,
                uri = %uri,
                "request failed"
            );
        } else {
            warn!(
                error = %self,
                request_id = %request_id,
                subject = %subject,
                method = %method,
                uri = %uri,
                "request rejected"
            );
        }

        let status = Status::from(&self);
        let body = serde_json::json!({ "message": self.to_string() }).to_string();

        let mut response = Response::build();
        response.status(status).header(ContentType::JSON);
        if let AppError::RateLimited { retry_after } = &self {
            response.header(Header::new("Retry-After", retry_after.as_secs().max(1).to_string()));
        }

        response.sized_body(body.len(), Cursor::new(body)).ok()
    }
}

impl OpenApiResponderInner for AppError {
    fn responses(_gen: &mut OpenApiGenerator) -> Result<Responses, OpenApiError> {
        use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse};
        let mut responses = Responses::default();
        for (code, description) in [
            ("400", "Bad Request"),
            ("401", "Unauthorized"),
            ("404", "Not Found"),
            ("429", "Too Many Requests"),
            ("500", "Internal Server Error"),
        ] {
            responses.responses.insert(
                code.to_string(),
                RefOr::Object(OpenApiResponse {
                    description: description.to_string(),
                    ..Default::default()
                }),
            );
        }
        Ok(responses)
    }
}

impl From<figment::Error> for AppError {
    fn from(e: figment::Error) -> Self {
        AppError::ConfigurationError {
            message: "Failed to read configuration".to_string(),
            source: e,
        }
    }
}

impl From<sqlx::Error> for AppError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => AppError::NotFound("Resource not found".to_string()),
            _ => AppError::db("Database error", e),
        }
    }
}
