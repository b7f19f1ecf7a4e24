use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use sea_orm::{Database, DatabaseConnection, DbErr};

static POOLS: OnceLock<Mutex<HashMap<String, DatabaseConnection>>> = OnceLock::new();

/// One pooled connection per DSN for the whole process. A gateway normally
/// talks to a single store, but tests and migrations may hold a SQLite and a
/// Postgres DSN at once.
pub async fn connect_shared(dsn: &str) -> Result<DatabaseConnection, DbErr> {
    let pools = POOLS.get_or_init(|| Mutex::new(HashMap::new()));
    if let Ok(guard) = pools.lock()
        && let Some(connection) = guard.get(dsn)
    {
        return Ok(connection.clone());
    }

    let connection = Database::connect(dsn).await?;
    if let Ok(mut guard) = pools.lock() {
        guard
            .entry(dsn.to_string())
            .or_insert_with(|| connection.clone());
    }
    Ok(connection)
}
