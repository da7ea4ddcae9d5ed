//! Connection pooling and migrations for the session store.

use diesel_async::pooled_connection::{
    bb8::Pool, bb8::PooledConnection, AsyncDieselConnectionManager,
};
use diesel_async::AsyncPgConnection;
use std::time::Duration;
use tracing::info;

use crate::error::{AppError, AppResult};

/// Type alias for the database pool
pub type DatabasePool = Pool<AsyncPgConnection>;

/// Type alias for a pooled connection
pub type PooledConn<'a> = PooledConnection<'a, AsyncPgConnection>;

const POOL_MAX_CONNECTIONS: u32 = 20;
const POOL_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Open the bb8 pool over async Postgres connections
pub async fn create_pool(database_url: &str) -> AppResult<DatabasePool> {
    let manager = AsyncDieselConnectionManager::<AsyncPgConnection>::new(database_url);

    let pool = Pool::builder()
        .max_size(POOL_MAX_CONNECTIONS)
        .connection_timeout(POOL_CONNECT_TIMEOUT)
        .idle_timeout(Some(POOL_IDLE_TIMEOUT))
        .build(manager)
        .await
        .map_err(|e| AppError::DatabasePool(format!("Cannot open Postgres pool: {}", e)))?;

    info!(max_connections = POOL_MAX_CONNECTIONS, "Postgres pool ready");
    Ok(pool)
}

/// Round-trip a trivial query to prove the pool hands out live connections
pub async fn test_connection(pool: &DatabasePool) -> AppResult<()> {
    let mut conn = pool.get().await?;

    let probe: i32 = diesel_async::RunQueryDsl::get_result(
        diesel::select(diesel::dsl::sql::<diesel::sql_types::Integer>("1")),
        &mut conn,
    )
    .await
    .map_err(|e| AppError::DatabasePool(format!("Connectivity probe failed: {}", e)))?;

    if probe != 1 {
        return Err(AppError::DatabasePool(
            "Connectivity probe returned an unexpected value".to_string(),
        ));
    }
    Ok(())
}

/// Apply pending migrations. Diesel migrations drive a synchronous
/// connection, so the whole step runs on the blocking pool.
pub async fn run_migrations(database_url: &str) -> AppResult<()> {
    use diesel::Connection;
    use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};

    const MIGRATIONS: EmbeddedMigrations = embed_migrations!();

    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> AppResult<()> {
        let mut conn = diesel::PgConnection::establish(&database_url).map_err(|e| {
            AppError::MigrationError(format!("No sync connection for migrations: {}", e))
        })?;

        let applied = conn
            .run_pending_migrations(MIGRATIONS)
            .map_err(|e| AppError::MigrationError(e.to_string()))?;

        if !applied.is_empty() {
            info!(count = applied.len(), "Applied pending migrations");
        }
        Ok(())
    })
    .await
    .map_err(|e| AppError::MigrationError(format!("Migration task panicked: {}", e)))??;

    info!("Schema is up to date");
    Ok(())
}

/// Check database health
pub async fn check_database_health(pool: &DatabasePool) -> AppResult<()> {
    test_connection(pool).await
}
