use diesel::prelude::*;
use diesel::SqliteConnection;
use diesel_migrations::MigrationHarness;

/// Fresh in-memory database with every migration applied.
pub fn memory_conn() -> SqliteConnection {
    let mut conn = SqliteConnection::establish(":memory:").expect("open in-memory sqlite");
    conn.run_pending_migrations(crate::MIGRATIONS).expect("apply migrations");
    conn
}
