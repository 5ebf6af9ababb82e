//! Forward-only schema migrations with a `schema_migrations` ledger.
//!
//! The base schema is created idempotently on every open. Databases from
//! builds that predate the ledger are detected by the presence of columns
//! the early migrations would add, and those versions are seeded into the
//! ledger instead of re-applied. Column-adding migrations check
//! `PRAGMA table_info` first so a half-migrated database does not wedge
//! the daemon into degraded mode over a benign duplicate column.

use chrono::Utc;
use rusqlite::Connection;
use tracing::{info, warn};

use crate::errors::StoreError;

pub(crate) enum MigrationKind {
    /// Arbitrary DDL, executed as-is.
    Sql(&'static str),
    /// `ALTER TABLE ... ADD COLUMN`, skipped when the column exists.
    AddColumn {
        table: &'static str,
        column: &'static str,
        ddl: &'static str,
    },
}

pub(crate) struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub kind: MigrationKind,
}

/// The single ordered migration list. Append-only; versions never reuse.
pub(crate) const MIGRATION_LIST: &[Migration] = &[
    Migration {
        version: 1,
        description: "sessions: add resume_session_id",
        kind: MigrationKind::AddColumn {
            table: "sessions",
            column: "resume_session_id",
            ddl: "ALTER TABLE sessions ADD COLUMN resume_session_id TEXT",
        },
    },
    Migration {
        version: 2,
        description: "create prs mirror table",
        kind: MigrationKind::Sql(
            "CREATE TABLE IF NOT EXISTS prs (
                id TEXT PRIMARY KEY,
                repo TEXT NOT NULL,
                number INTEGER NOT NULL,
                title TEXT NOT NULL,
                author TEXT NOT NULL,
                url TEXT NOT NULL,
                head_sha TEXT NOT NULL,
                ci_status TEXT,
                comment_count INTEGER NOT NULL DEFAULT 0,
                state TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                muted INTEGER NOT NULL DEFAULT 0,
                last_seen_head_sha TEXT,
                last_seen_comment_count INTEGER
            )",
        ),
    },
    Migration {
        version: 3,
        description: "create repo/author mute tables",
        kind: MigrationKind::Sql(
            "CREATE TABLE IF NOT EXISTS repo_mutes (
                repo TEXT PRIMARY KEY
            );
            CREATE TABLE IF NOT EXISTS author_mutes (
                author TEXT PRIMARY KEY
            )",
        ),
    },
    Migration {
        version: 4,
        description: "create recent_locations",
        kind: MigrationKind::Sql(
            "CREATE TABLE IF NOT EXISTS recent_locations (
                path TEXT PRIMARY KEY,
                last_used_at TEXT NOT NULL
            )",
        ),
    },
    Migration {
        version: 5,
        description: "create review_comments",
        kind: MigrationKind::Sql(
            "CREATE TABLE IF NOT EXISTS review_comments (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                session_id TEXT NOT NULL,
                file TEXT NOT NULL,
                line INTEGER,
                body TEXT NOT NULL,
                created_at TEXT NOT NULL,
                resolved INTEGER NOT NULL DEFAULT 0
            )",
        ),
    },
    Migration {
        version: 6,
        description: "prs: add last_seen_ci_status",
        kind: MigrationKind::AddColumn {
            table: "prs",
            column: "last_seen_ci_status",
            ddl: "ALTER TABLE prs ADD COLUMN last_seen_ci_status TEXT",
        },
    },
];

/// Declared migration versions, in order. Exposed for ledger checks.
pub const MIGRATIONS: &[i64] = &[1, 2, 3, 4, 5, 6];

/// Create base schema, seed the ledger for pre-ledger databases, then
/// apply all pending migrations.
pub(crate) fn initialize(conn: &Connection) -> Result<(), StoreError> {
    create_base_schema(conn)?;
    seed_legacy(conn)?;
    apply_pending(conn)?;
    Ok(())
}

/// The schema as it existed before the migration ledger. Idempotent.
fn create_base_schema(conn: &Connection) -> Result<(), StoreError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version INTEGER PRIMARY KEY,
            description TEXT NOT NULL,
            applied_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            label TEXT NOT NULL,
            cwd TEXT NOT NULL,
            agent TEXT NOT NULL,
            state TEXT NOT NULL,
            state_since TEXT NOT NULL,
            state_updated_at TEXT NOT NULL,
            todos TEXT NOT NULL DEFAULT '[]',
            branch TEXT,
            worktree TEXT,
            created_at TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Record early migrations as applied when a pre-ledger database already
/// carries their effects (detected by column presence).
fn seed_legacy(conn: &Connection) -> Result<(), StoreError> {
    let applied = applied_versions(conn)?;
    if !applied.is_empty() {
        return Ok(());
    }
    if column_exists(conn, "sessions", "resume_session_id")? {
        warn!(
            event = "store.migrations.legacy_seeded",
            version = 1,
            reason = "column present before ledger existed",
        );
        record(conn, 1, "seed: resume_session_id predates ledger")?;
    }
    Ok(())
}

fn apply_pending(conn: &Connection) -> Result<(), StoreError> {
    let applied = applied_versions(conn)?;

    // The ledger must be a strict prefix of the declared list.
    for (i, &version) in applied.iter().enumerate() {
        match MIGRATIONS.get(i) {
            Some(&declared) if declared == version => {}
            _ => {
                return Err(StoreError::LedgerCorrupt(format!(
                    "applied version {version} at position {i} does not match declared list"
                )));
            }
        }
    }

    for migration in MIGRATION_LIST {
        if applied.contains(&migration.version) {
            continue;
        }
        let tx = conn.unchecked_transaction()?;
        match &migration.kind {
            MigrationKind::Sql(sql) => {
                tx.execute_batch(sql)?;
            }
            MigrationKind::AddColumn { table, column, ddl } => {
                if column_exists(&tx, table, column)? {
                    warn!(
                        event = "store.migrations.column_already_present",
                        version = migration.version,
                        table = table,
                        column = column,
                    );
                } else {
                    tx.execute(ddl, [])?;
                }
            }
        }
        tx.execute(
            "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![
                migration.version,
                migration.description,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        info!(
            event = "store.migrations.applied",
            version = migration.version,
            description = migration.description,
        );
    }
    Ok(())
}

fn record(conn: &Connection, version: i64, description: &str) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO schema_migrations (version, description, applied_at) VALUES (?1, ?2, ?3)",
        rusqlite::params![version, description, Utc::now().to_rfc3339()],
    )?;
    Ok(())
}

/// Versions recorded in the ledger, ascending.
pub fn applied_versions(conn: &Connection) -> Result<Vec<i64>, StoreError> {
    let mut stmt = conn.prepare("SELECT version FROM schema_migrations ORDER BY version")?;
    let versions = stmt
        .query_map([], |row| row.get(0))?
        .collect::<Result<Vec<i64>, _>>()?;
    Ok(versions)
}

fn column_exists(
    conn: &Connection,
    table: &str,
    column: &str,
) -> Result<bool, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(names.iter().any(|n| n == column))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_database_applies_all_migrations() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        assert_eq!(applied_versions(&conn).unwrap(), MIGRATIONS);
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        initialize(&conn).unwrap();
        assert_eq!(applied_versions(&conn).unwrap(), MIGRATIONS);
    }

    #[test]
    fn test_ledger_versions_unique_and_prefix() {
        let conn = Connection::open_in_memory().unwrap();
        initialize(&conn).unwrap();
        let applied = applied_versions(&conn).unwrap();
        let mut deduped = applied.clone();
        deduped.dedup();
        assert_eq!(applied, deduped);
        assert!(applied.len() <= MIGRATIONS.len());
        assert_eq!(&MIGRATIONS[..applied.len()], applied.as_slice());
    }

    #[test]
    fn test_legacy_database_seeds_instead_of_reapplying() {
        let conn = Connection::open_in_memory().unwrap();
        // Simulate a pre-ledger database: base schema plus the column that
        // migration 1 would add, but an empty ledger.
        create_base_schema(&conn).unwrap();
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN resume_session_id TEXT",
            [],
        )
        .unwrap();

        initialize(&conn).unwrap();
        let applied = applied_versions(&conn).unwrap();
        assert_eq!(applied, MIGRATIONS);

        let desc: String = conn
            .query_row(
                "SELECT description FROM schema_migrations WHERE version = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert!(desc.starts_with("seed:"), "got: {desc}");
    }

    #[test]
    fn test_duplicate_column_does_not_fail() {
        let conn = Connection::open_in_memory().unwrap();
        create_base_schema(&conn).unwrap();
        // Ledger says nothing applied, but migration 6's column already
        // exists (half-migrated database). Must not error.
        conn.execute_batch(
            "CREATE TABLE prs (
                id TEXT PRIMARY KEY, repo TEXT NOT NULL, number INTEGER NOT NULL,
                title TEXT NOT NULL, author TEXT NOT NULL, url TEXT NOT NULL,
                head_sha TEXT NOT NULL, ci_status TEXT,
                comment_count INTEGER NOT NULL DEFAULT 0, state TEXT NOT NULL,
                updated_at TEXT NOT NULL, muted INTEGER NOT NULL DEFAULT 0,
                last_seen_head_sha TEXT, last_seen_comment_count INTEGER,
                last_seen_ci_status TEXT
            )",
        )
        .unwrap();
        initialize(&conn).unwrap();
        assert_eq!(applied_versions(&conn).unwrap(), MIGRATIONS);
    }

    #[test]
    fn test_unknown_applied_version_is_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        create_base_schema(&conn).unwrap();
        conn.execute(
            "INSERT INTO schema_migrations (version, description, applied_at)
             VALUES (999, 'from the future', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();
        let err = initialize(&conn).unwrap_err();
        assert!(matches!(err, StoreError::LedgerCorrupt(_)));
    }

    #[test]
    fn test_partial_ledger_resumes() {
        let conn = Connection::open_in_memory().unwrap();
        create_base_schema(&conn).unwrap();
        // Apply only migration 1 manually, then let initialize finish.
        conn.execute(
            "ALTER TABLE sessions ADD COLUMN resume_session_id TEXT",
            [],
        )
        .unwrap();
        record(&conn, 1, "sessions: add resume_session_id").unwrap();

        initialize(&conn).unwrap();
        assert_eq!(applied_versions(&conn).unwrap(), MIGRATIONS);
    }
}
