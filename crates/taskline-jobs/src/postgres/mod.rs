//! PostgreSQL storage backend.

mod pool;
mod store;

pub use pool::{create_pool, DatabasePool};
pub use store::PostgresJobStore;
