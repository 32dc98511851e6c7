//! Connection PRAGMAs shared by every SQLite connection the repository opens

use rusqlite::Connection;
use std::time::Duration;

/// Apply WAL journaling, relaxed sync, foreign keys, in-memory temp storage,
/// autocheckpoint and a busy timeout so concurrent capture/poll connections
/// wait instead of failing on a locked database.
pub fn apply_optimized_pragmas(conn: &Connection) -> rusqlite::Result<()> {
    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "wal_autocheckpoint", 1000)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    Ok(())
}
