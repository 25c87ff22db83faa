use migration::{Migrator, MigratorTrait};
use sea_orm::{ConnectionTrait, Database, DatabaseConnection, DatabaseTransaction, DbBackend, TransactionTrait};

use crate::error::Result;

pub mod queue;
pub mod vm;

pub use vm::{LeasedVm, StagingAttempt};

/// Unified access layer over the pool database.
///
/// All methods are `async fn` on SeaORM. The store is shared across every
/// control loop and every assignment request; mutating primitives are
/// single statements or short transactions, so callers never hold an
/// in-process lock across them.
pub struct VmStore {
    pub(crate) db: DatabaseConnection,
}

impl VmStore {
    /// Connects and runs any pending migrations.
    pub async fn connect(url: &str) -> Result<Self> {
        let db = Database::connect(url).await?;

        if db.get_database_backend() == DbBackend::Sqlite {
            db.execute_unprepared("PRAGMA journal_mode=WAL;").await?;
        }

        Migrator::up(&db, None).await?;
        tracing::info!(backend = ?db.get_database_backend(), "Initialized VM store");

        Ok(Self { db })
    }

    pub fn db(&self) -> &DatabaseConnection {
        &self.db
    }

    /// Opens a private transaction, isolated from the background loops.
    pub async fn begin(&self) -> Result<DatabaseTransaction> {
        Ok(self.db.begin().await?)
    }
}
