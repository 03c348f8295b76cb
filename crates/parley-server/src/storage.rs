use std::sync::{Arc, Mutex};

use parley_store::Database;

use crate::error::ServerError;

/// The process-wide store handle. rusqlite connections are not `Sync`, so all
/// access goes through this mutex on the blocking pool.
pub type SharedDatabase = Arc<Mutex<Database>>;

pub fn shared(db: Database) -> SharedDatabase {
    Arc::new(Mutex::new(db))
}

/// Run `f` against the database on the blocking thread pool.
pub async fn with_db<T, F>(db: &SharedDatabase, f: F) -> Result<T, ServerError>
where
    F: FnOnce(&mut Database) -> parley_store::Result<T> + Send + 'static,
    T: Send + 'static,
{
    let db = Arc::clone(db);
    tokio::task::spawn_blocking(move || {
        let mut guard = db
            .lock()
            .map_err(|e| ServerError::Internal(format!("Database lock poisoned: {e}")))?;
        f(&mut *guard).map_err(ServerError::from)
    })
    .await?
}
