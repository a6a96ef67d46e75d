use crate::error::app_error::AppError;
use crate::models::token::{Claims, TokenType};
use crate::service::token::TokenService;
use rocket::http::Status;
use rocket::outcome::Outcome;
use rocket::request::{FromRequest, Outcome as RequestOutcome, Request};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{Object, Responses, SecurityRequirement, SecurityScheme, SecuritySchemeData};
use rocket_okapi::request::{OpenApiFromRequest, RequestHeaderInput};
use std::sync::Arc;
use tracing::debug;

/// Caller authenticated by an `Authorization: Bearer <token>` header.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    pub email: String,
    pub claims: Claims,
}

pub(crate) fn parse_bearer(value: &str) -> Option<&str> {
    let (scheme, token) = value.trim().split_once(' ')?;
    let token = token.trim();
    (scheme.eq_ignore_ascii_case("bearer") && !token.is_empty()).then_some(token)
}

#[rocket::async_trait]
impl<'r> FromRequest<'r> for BearerAuth {
    type Error = AppError;

    async fn from_request(req: &'r Request<'_>) -> RequestOutcome<Self, Self::Error> {
        let Some(tokens) = req.rocket().state::<Arc<TokenService>>() else {
            return Outcome::Error((Status::InternalServerError, AppError::internal("token service is not managed")));
        };

        let Some(token) = req.headers().get_one("Authorization").and_then(parse_bearer) else {
            return Outcome::Error((Status::Unauthorized, AppError::Unauthorized));
        };

        match tokens.verify(token) {
            // Approval tokens only ever resolve a pending device.
            Ok(claims) if claims.token_type == TokenType::Approval => Outcome::Error((Status::Unauthorized, AppError::Unauthorized)),
            Ok(claims) => {
                let auth = BearerAuth {
                    email: claims.sub.clone(),
                    claims,
                };
                req.local_cache(|| Some(auth.clone()));
                Outcome::Success(auth)
            }
            Err(err) => {
                if let Ok(claimed) = tokens.extract_claims_unverified(token) {
                    debug!(reason = %err, claimed_subject = %claimed.sub, claimed_type = %claimed.token_type, "bearer token rejected");
                }
                Outcome::Error((Status::Unauthorized, AppError::Token(err)))
            }
        }
    }
}

impl<'a> OpenApiFromRequest<'a> for BearerAuth {
    fn from_request_input(_gen: &mut OpenApiGenerator, _name: String, _required: bool) -> rocket_okapi::Result<RequestHeaderInput> {
        let security_scheme = SecurityScheme {
            description: Some("Access token from POST /auth/login, sent as `Authorization: Bearer <token>`.".to_string()),
            data: SecuritySchemeData::Http {
                scheme: "bearer".to_string(),
                bearer_format: Some("JWT".to_string()),
            },
            extensions: Object::default(),
        };

        let mut security_req = SecurityRequirement::new();
        security_req.insert("bearerAuth".to_string(), Vec::new());

        Ok(RequestHeaderInput::Security("bearerAuth".to_string(), security_scheme, security_req))
    }

    fn get_responses(_gen: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        use rocket_okapi::okapi::openapi3::{RefOr, Response};
        let mut responses = Responses::default();
        responses.responses.insert(
            "401".to_string(),
            RefOr::Object(Response {
                description: "Unauthorized - Authentication required".to_string(),
                ..Default::default()
            }),
        );
        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::parse_bearer;

    #[test]
    fn parse_bearer_accepts_case_insensitive_scheme() {
        assert_eq!(parse_bearer("Bearer abc.def"), Some("abc.def"));
        assert_eq!(parse_bearer("bearer  abc.def "), Some("abc.def"));
    }

    #[test]
    fn parse_bearer_rejects_other_schemes_and_empty_tokens() {
        assert_eq!(parse_bearer("Basic dXNlcjpwYXNz"), None);
        assert_eq!(parse_bearer("Bearer "), None);
        assert_eq!(parse_bearer("abc.def"), None);
    }
}
