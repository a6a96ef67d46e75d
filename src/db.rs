use crate::config::{DatabaseConfig, RedisConfig};
use redis::aio::ConnectionManager;
use rocket::fairing::AdHoc;
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use std::time::Duration;

pub async fn init_pool(db_config: &DatabaseConfig) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(db_config.max_connections)
        .min_connections(db_config.min_connections)
        .acquire_timeout(Duration::from_secs(db_config.acquire_timeout))
        .idle_timeout(Duration::from_secs(30))
        .max_lifetime(Duration::from_secs(1800))
        .connect(&db_config.url)
        .await
}

pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

pub async fn init_redis(redis_config: &RedisConfig) -> Result<ConnectionManager, redis::RedisError> {
    let client = redis::Client::open(redis_config.url.as_str())?;
    ConnectionManager::new(client).await
}

pub fn stage_db(db_config: DatabaseConfig) -> AdHoc {
    AdHoc::try_on_ignite("Postgres (sqlx)", |rocket| async move {
        let pool = match init_pool(&db_config).await {
            Ok(pool) => pool,
            Err(e) => {
                tracing::error!("Failed to initialize database pool: {}", e);
                return Err(rocket);
            }
        };

        if db_config.run_migrations {
            if let Err(e) = run_migrations(&pool).await {
                tracing::error!("Failed to run database migrations: {}", e);
                return Err(rocket);
            }
            tracing::info!("Database migrations applied");
        }

        tracing::info!("Database pool initialized successfully");
        Ok(rocket.manage(pool))
    })
}

pub fn stage_redis(redis_config: RedisConfig) -> AdHoc {
    AdHoc::try_on_ignite("Redis", |rocket| async move {
        match init_redis(&redis_config).await {
            Ok(connection) => {
                tracing::info!("Redis connection manager initialized successfully");
                Ok(rocket.manage(connection))
            }
            Err(e) => {
                tracing::error!("Failed to connect to Redis: {}", e);
                Err(rocket)
            }
        }
    })
}
