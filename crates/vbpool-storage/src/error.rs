/// Errors surfaced by the state store.
///
/// Background loops treat every variant as transient: they log and fall
/// through to the next tick. The assignment path rolls back and reports
/// "no VM" to its caller.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage: database error: {0}")]
    Db(#[from] sea_orm::DbErr),

    #[error("storage: JSON error in cached descriptor: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;
