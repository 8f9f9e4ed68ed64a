//! Durable store for tandem sessions.
//!
//! - [`repositories`]: Postgres queries. Every mutation is a guarded
//!   `UPDATE ... WHERE status = ANY(...) RETURNING ...`; a miss returns
//!   `None` so the caller can re-read instead of overwriting.
//! - [`store::SessionStore`]: the async seam over those rows, implemented by
//!   [`store::PgStore`] and [`memory::MemoryStore`].
//! - [`procedures::StoreProcedures`]: the server side of the remote
//!   procedures clients call, built on any `SessionStore`.

use sqlx::postgres::PgPoolOptions;

pub mod memory;
pub mod models;
pub mod procedures;
pub mod repositories;
pub mod store;

pub use memory::MemoryStore;
pub use procedures::{NeutralScoring, ProcedureConfig, Scoring, StoreProcedures};
pub use store::{PgStore, SessionStore, StoreError, StoreResult};

pub type DbPool = sqlx::PgPool;

/// Create a connection pool from a database URL.
pub async fn create_pool(database_url: &str) -> Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(20)
        .connect(database_url)
        .await
}

/// Round-trip a trivial query to confirm the pool can reach the database.
pub async fn health_check(pool: &DbPool) -> Result<(), sqlx::Error> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// Apply pending migrations from `db/migrations`.
pub async fn run_migrations(pool: &DbPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../db/migrations").run(pool).await
}
