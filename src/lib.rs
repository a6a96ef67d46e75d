mod auth;
mod config;
mod database;
mod db;
mod error;
mod maintenance;
mod middleware;
mod models;
mod routes;
mod service;

#[cfg(test)]
pub mod test_utils;

pub use config::Config;
pub use error::app_error::AppError;
pub use maintenance::{ReconcileResult, reconcile};

use crate::database::postgres_repository::PostgresRepository;
use crate::database::rate_limit::RedisBucketStore;
use crate::db::{stage_db, stage_redis};
use crate::middleware::RequestLogger;
use crate::middleware::rate_limit::RateLimiter;
use crate::routes as app_routes;
use crate::service::auth::{DeviceTrustService, DeviceTrustSettings};
use crate::service::email::EmailService;
use crate::service::token::TokenService;
use redis::aio::ConnectionManager;
use rocket::figment::Figment;
use rocket::fairing::AdHoc;
use rocket::{Build, Rocket, catchers, http::Method};
use rocket_cors::{AllowedOrigins, Cors, CorsOptions};
use rocket_okapi::swagger_ui::{SwaggerUIConfig, make_swagger_ui};
use rocket_okapi::{get_openapi_route, okapi::merge::marge_spec_list};
use sqlx::PgPool;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Shared services managed by Rocket and looked up by handlers and guards.
#[derive(Clone)]
pub struct AppState {
    pub device_trust: Arc<DeviceTrustService>,
    pub tokens: Arc<TokenService>,
    pub rate_limiter: Arc<RateLimiter>,
}

pub fn init_tracing(log_level: &str, json_format: bool) {
    // RUST_LOG takes precedence, e.g. RUST_LOG=info,device_trust::service=debug
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let subscriber = tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_line_number(true);

    // A subscriber may already be installed (tests, the maint binary).
    let _ = if json_format { subscriber.json().try_init() } else { subscriber.try_init() };
}

fn build_cors(cors_config: &config::CorsConfig) -> Result<Cors, AppError> {
    let is_wildcard = cors_config.allowed_origins.len() == 1 && cors_config.allowed_origins[0] == "*";

    if is_wildcard && cors_config.allow_credentials {
        return Err(AppError::InvalidConfiguration(
            "wildcard CORS origins cannot be combined with credentials".to_string(),
        ));
    }

    let allowed_origins = if cors_config.allowed_origins.is_empty() {
        AllowedOrigins::some_exact::<&str>(&[])
    } else if is_wildcard {
        AllowedOrigins::all()
    } else {
        AllowedOrigins::some_exact(&cors_config.allowed_origins.iter().map(String::as_str).collect::<Vec<_>>())
    };

    CorsOptions {
        allowed_origins,
        allowed_methods: vec![Method::Get, Method::Post, Method::Options, Method::Head]
            .into_iter()
            .map(From::from)
            .collect(),
        allowed_headers: rocket_cors::AllowedHeaders::some(&["Content-Type", "Authorization", "Accept", middleware::DEVICE_ID_HEADER]),
        allow_credentials: cors_config.allow_credentials,
        ..Default::default()
    }
    .to_cors()
    .map_err(|e| AppError::InvalidConfiguration(format!("invalid CORS settings: {e}")))
}

fn get_swagger_config(openapi_url: &str) -> SwaggerUIConfig {
    SwaggerUIConfig {
        url: openapi_url.to_string(),
        ..Default::default()
    }
}

fn normalize_base_path(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return config::DEFAULT_API_BASE_PATH.to_string();
    }

    let mut normalized = if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    };

    while normalized.ends_with('/') && normalized.len() > 1 {
        normalized.pop();
    }

    normalized
}

fn join_base_path(base_path: &str, path: &str) -> String {
    let base = base_path.trim_end_matches('/');
    let suffix = path.trim_start_matches('/');

    if base.is_empty() {
        format!("/{}", suffix)
    } else {
        format!("{}/{}", base, suffix)
    }
}

struct RouteSpec {
    path: &'static str,
    routes: Vec<rocket::Route>,
    openapi: rocket_okapi::okapi::openapi3::OpenApi,
}

fn collect_route_specs() -> Vec<RouteSpec> {
    let (auth_routes, auth_openapi) = app_routes::auth::routes();
    let (health_routes, health_openapi) = app_routes::health::routes();

    vec![
        RouteSpec {
            path: "/auth",
            routes: auth_routes,
            openapi: auth_openapi,
        },
        RouteSpec {
            path: "/health",
            routes: health_routes,
            openapi: health_openapi,
        },
    ]
}

fn mount_api_routes(mut rocket: Rocket<Build>, base_path: &str, enable_swagger: bool) -> Rocket<Build> {
    let route_specs = collect_route_specs();

    if !enable_swagger {
        for spec in route_specs {
            rocket = rocket.mount(join_base_path(base_path, spec.path), spec.routes);
        }
        return rocket;
    }

    let mut openapi_list = Vec::new();
    for spec in route_specs {
        rocket = rocket.mount(join_base_path(base_path, spec.path), spec.routes);
        openapi_list.push((spec.path, spec.openapi));
    }

    match marge_spec_list(&openapi_list) {
        Ok(docs) => {
            let settings = rocket_okapi::settings::OpenApiSettings::default();
            rocket = rocket.mount(base_path, vec![get_openapi_route(docs, &settings)]);

            let docs_path = join_base_path(base_path, "docs");
            let openapi_url = join_base_path(base_path, "openapi.json");
            rocket = rocket.mount(docs_path, make_swagger_ui(&get_swagger_config(&openapi_url)));
        }
        Err(err) => tracing::error!("Could not merge OpenAPI spec, serving without docs: {}", err),
    }

    rocket
}

fn mount_app(rocket: Rocket<Build>, config: &Config) -> Rocket<Build> {
    let base_path = normalize_base_path(&config.api.base_path);

    let rocket = mount_api_routes(rocket.attach(RequestLogger), &base_path, config.api.enable_swagger);

    rocket.register(
        base_path.as_str(),
        catchers![
            app_routes::error::bad_request,
            app_routes::error::unauthorized,
            app_routes::error::not_found,
            app_routes::error::unprocessable_entity,
            app_routes::error::too_many_requests,
            app_routes::error::internal_error,
        ],
    )
}

fn manage_state(rocket: Rocket<Build>, state: AppState) -> Rocket<Build> {
    rocket.manage(state.device_trust).manage(state.tokens).manage(state.rate_limiter)
}

/// Build the services on top of the pool and Redis connection managed by the
/// earlier stages.
fn stage_device_trust(config: Config) -> AdHoc {
    AdHoc::try_on_ignite("Device Trust", |rocket| async move {
        let (Some(pool), Some(redis)) = (rocket.state::<PgPool>().cloned(), rocket.state::<ConnectionManager>().cloned()) else {
            tracing::error!("Device trust stage requires the Postgres and Redis stages");
            return Err(rocket);
        };

        let repository = Arc::new(PostgresRepository::new(pool));
        let tokens = Arc::new(TokenService::new(&config.jwt));
        let device_trust = DeviceTrustService::new(
            repository.clone(),
            repository,
            Arc::new(EmailService::new(config.email.clone())),
            tokens.clone(),
            DeviceTrustSettings::from_config(&config),
        );
        let buckets = Arc::new(RedisBucketStore::new(redis, config.rate_limit.key_ttl_seconds));
        let rate_limiter = RateLimiter::new(buckets, &config.rate_limit, config.service.store_timeout());

        tracing::info!(
            max_trusted_devices = config.device_trust.max_trusted_devices,
            rate_limit_capacity = config.rate_limit.capacity,
            "device trust services initialized"
        );

        Ok(manage_state(
            rocket,
            AppState {
                device_trust: Arc::new(device_trust),
                tokens,
                rate_limiter: Arc::new(rate_limiter),
            },
        ))
    })
}

/// Rocket settings derived from [`Config`]. Forwarded client address headers
/// are ignored unless a trusted proxy header is configured.
fn rocket_figment(config: &Config) -> Figment {
    let figment = rocket::Config::figment()
        .merge(("address", config.server.address.clone()))
        .merge(("port", config.server.port));

    match &config.server.trusted_ip_header {
        Some(header) => figment.merge(("ip_header", header.clone())),
        None => figment.merge(("ip_header", false)),
    }
}

pub fn build_rocket(config: Config) -> Result<Rocket<Build>, AppError> {
    init_tracing(&config.logging.level, config.logging.json_format);
    config.validate()?;

    let cors = build_cors(&config.cors)?;
    let rocket = rocket::custom(rocket_figment(&config))
        .attach(cors)
        .attach(stage_db(config.database.clone()))
        .attach(stage_redis(config.redis.clone()))
        .attach(stage_device_trust(config.clone()));

    Ok(mount_app(rocket, &config))
}

/// Same routes and catchers as [`build_rocket`], over already built services.
pub fn build_rocket_with(config: Config, state: AppState) -> Rocket<Build> {
    mount_app(manage_state(rocket::custom(rocket_figment(&config)), state), &config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_paths_are_normalized() {
        assert_eq!(normalize_base_path(""), config::DEFAULT_API_BASE_PATH);
        assert_eq!(normalize_base_path("api/v2/"), "/api/v2");
        assert_eq!(normalize_base_path("/"), "/");
        assert_eq!(join_base_path("/api/v1", "/auth"), "/api/v1/auth");
        assert_eq!(join_base_path("/", "docs"), "/docs");
    }

    #[test]
    fn forwarded_ip_header_is_opt_in() {
        let mut config = Config::default();
        let rocket_config: rocket::Config = rocket_figment(&config).extract().unwrap();
        assert!(rocket_config.ip_header.is_none());

        config.server.trusted_ip_header = Some("X-Forwarded-For".to_string());
        let rocket_config: rocket::Config = rocket_figment(&config).extract().unwrap();
        assert_eq!(rocket_config.ip_header.as_deref().map(|h| h.as_str()), Some("X-Forwarded-For"));
    }

    #[test]
    fn wildcard_cors_with_credentials_is_rejected() {
        let cors = config::CorsConfig {
            allowed_origins: vec!["*".to_string()],
            allow_credentials: true,
        };
        assert!(matches!(build_cors(&cors), Err(AppError::InvalidConfiguration(_))));

        let cors = config::CorsConfig {
            allowed_origins: vec!["https://app.example.com".to_string()],
            allow_credentials: true,
        };
        assert!(build_cors(&cors).is_ok());
    }
}
