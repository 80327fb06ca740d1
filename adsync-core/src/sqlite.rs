use std::path::Path;

use rusqlite::{Connection, OpenFlags};

/// Pragmas shared by the telemetry store and the operation ledger.
pub fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA foreign_keys = ON;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = 5000;\n",
    )
}

/// Opens `path` with `flags` and applies [`configure_connection`].
pub fn open_configured(path: &Path, flags: OpenFlags) -> rusqlite::Result<Connection> {
    let conn = Connection::open_with_flags(path, flags)?;
    configure_connection(&conn)?;
    Ok(conn)
}
