//! Persistence for the GraphRAG pipeline
//!
//! The engine talks to storage through three narrow traits (see [`store`]):
//! cache entries with per-key claims, graph and community persistence, and
//! shared rate-limit buckets. [`Repository`] implements all three on
//! SurrealDB; [`MemoryStore`] is an in-process stand-in for tests.

pub mod error;
pub mod memory;
pub mod repository;
pub mod schema;
pub mod store;

pub use error::{DbError, Result};
pub use memory::MemoryStore;
pub use repository::Repository;
pub use store::{BucketStore, CacheStore, DbStats, GraphMeta, GraphStore};

use surrealdb::engine::local::{Db, Mem};
use surrealdb::Surreal;

/// Database connection type
pub type DbConnection = Surreal<Db>;

/// Initialize database with RocksDB (persistent)
#[cfg(feature = "rocksdb")]
pub async fn init_persistent(path: impl AsRef<std::path::Path>) -> Result<DbConnection> {
    use surrealdb::engine::local::RocksDb;

    let db = Surreal::new::<RocksDb>(path.as_ref())
        .await
        .map_err(|e| DbError::Connection(format!("{}: {}", path.as_ref().display(), e)))?;
    setup_database(&db).await?;
    Ok(db)
}

/// Initialize database in-memory (for testing)
pub async fn init_memory() -> Result<DbConnection> {
    let db = Surreal::new::<Mem>(()).await?;
    setup_database(&db).await?;
    Ok(db)
}

/// Setup database namespace, database, and schema
async fn setup_database(db: &DbConnection) -> Result<()> {
    db.use_ns("graphrag").use_db("pipeline").await?;
    schema::initialize_schema(db).await?;
    Ok(())
}
