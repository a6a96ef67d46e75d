use crate::auth::BearerAuth;
use crate::error::app_error::AppError;
use crate::middleware::DeviceId;
use crate::middleware::rate_limit::LoginRateLimit;
use crate::models::auth::{ConfirmResponse, LoginRequest, LoginResponse, MeResponse, RefreshRequest, RefreshResponse, SessionTokensResponse};
use crate::service::approval::ApprovalOutcome;
use crate::service::auth::{DeviceTrustService, LoginOutcome};
use rocket::http::Status;
use rocket::serde::json::Json;
use rocket::{Responder, State, get, post};
use rocket_okapi::r#gen::OpenApiGenerator;
use rocket_okapi::okapi::openapi3::{RefOr, Response as OpenApiResponse, Responses};
use rocket_okapi::openapi;
use rocket_okapi::response::OpenApiResponderInner;
use std::sync::Arc;
use validator::Validate;

/// Log in from a device. Returns tokens when the device may be trusted right
/// away, or a pending status when the account owner has to approve it first.
#[openapi(tag = "Authentication")]
#[post("/login", data = "<payload>")]
pub async fn post_login(
    service: &State<Arc<DeviceTrustService>>,
    _rate_limit: LoginRateLimit,
    device: DeviceId,
    payload: Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    payload.validate()?;

    let response = match service.login(&payload.email, &payload.password, &device.0).await? {
        LoginOutcome::Granted(grant) => LoginResponse::Authenticated {
            message: "Login successful".to_string(),
            data: SessionTokensResponse::from(&grant),
        },
        LoginOutcome::PendingApproval { .. } => LoginResponse::PendingApproval {
            message: "New device detected. Confirm the sign-in from the email we sent you.".to_string(),
        },
    };

    Ok(Json(response))
}

#[derive(Responder)]
pub enum ConfirmReply {
    #[response(status = 200)]
    Confirmed(Json<ConfirmResponse>),
    #[response(status = 400)]
    Rejected(Json<ConfirmResponse>),
}

impl OpenApiResponderInner for ConfirmReply {
    fn responses(generator: &mut OpenApiGenerator) -> rocket_okapi::Result<Responses> {
        let mut responses = Json::<ConfirmResponse>::responses(generator)?;
        responses.responses.insert(
            "400".to_string(),
            RefOr::Object(OpenApiResponse {
                description: "Device rejected, or the approval token is unknown or already used".to_string(),
                ..Default::default()
            }),
        );
        Ok(responses)
    }
}

/// Target of the links in the new-device email.
///
/// `confirm=true` trusts the pending device and signs out the oldest trusted
/// one; anything else removes the pending device.
#[openapi(tag = "Authentication")]
#[get("/sessions/confirm?<confirm>&<approved_token>")]
pub async fn get_confirm_session(
    service: &State<Arc<DeviceTrustService>>,
    confirm: Option<bool>,
    approved_token: Option<String>,
) -> Result<ConfirmReply, AppError> {
    let token = approved_token
        .filter(|token| !token.is_empty())
        .ok_or_else(|| AppError::BadRequest("approved_token is required".to_string()))?;

    match service.resolve_approval(confirm.unwrap_or(false), &token).await {
        Ok(ApprovalOutcome::Confirmed(grant)) => Ok(ConfirmReply::Confirmed(Json(ConfirmResponse::Confirmed {
            message: "Device confirmed".to_string(),
            data: SessionTokensResponse::from(&grant),
        }))),
        Ok(ApprovalOutcome::Rejected { .. }) => Ok(ConfirmReply::Rejected(Json(ConfirmResponse::Rejected {
            message: "Device rejected".to_string(),
        }))),
        Err(AppError::NotFound(_)) => Err(AppError::BadRequest("Approval token does not exist".to_string())),
        Err(e) => Err(e),
    }
}

#[openapi(tag = "Authentication")]
#[post("/refresh", data = "<payload>")]
pub async fn post_refresh(
    service: &State<Arc<DeviceTrustService>>,
    device: DeviceId,
    payload: Json<RefreshRequest>,
) -> Result<Json<RefreshResponse>, AppError> {
    payload.validate()?;
    let refreshed = service.refresh(&payload.refresh_token, &device.0).await?;
    Ok(Json(RefreshResponse::from(&refreshed)))
}

/// Revoke this device's session and free its trusted device slot.
#[openapi(tag = "Authentication")]
#[post("/logout")]
pub async fn post_logout(service: &State<Arc<DeviceTrustService>>, auth: BearerAuth, device: DeviceId) -> Result<Status, AppError> {
    service.logout(&auth.email, &device.0).await?;
    Ok(Status::NoContent)
}

#[openapi(tag = "Authentication")]
#[get("/me")]
pub async fn get_me(auth: BearerAuth) -> Json<MeResponse> {
    Json(MeResponse {
        expires_at: auth.claims.expires_at(),
        token_type: auth.claims.token_type,
        email: auth.email,
    })
}

pub fn routes() -> (Vec<rocket::Route>, okapi::openapi3::OpenApi) {
    rocket_okapi::openapi_get_routes_spec![post_login, get_confirm_session, post_refresh, post_logout, get_me]
}
