//! Dual sqlite/postgres persistence layer for the MoonMind agent-job queue.
//!
//! Compile-time feature selection mirrors the teacher crate: one concrete pool type is
//! picked (`sqlite` by default, `postgres` when selected instead) so `#[derive(FromRow)]`
//! and typed binds work without going through `sqlx::Any`. See `pool.rs`.

pub mod pool;
pub mod repository;
pub mod schema;

pub use pool::{create_pool, DatabaseType, DbConfig, DbPool};
pub use repository::{Repository, WorkerTokenRecord};
pub use schema::migrate;
