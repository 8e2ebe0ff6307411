use rusqlite::Connection;
use std::path::Path;
use uuid::Uuid;

pub const REGISTRY_FILE: &str = "registry.sqlite3";

/// Opens (creating if needed) the per-workspace registry that tracks the
/// contest database files living alongside it.
pub fn open_registry(workspace: &Path) -> anyhow::Result<Connection> {
    std::fs::create_dir_all(workspace)?;
    let db_path = workspace.join(REGISTRY_FILE);
    let conn = Connection::open(db_path)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS database_metadata(
            id TEXT PRIMARY KEY,
            file_name TEXT NOT NULL UNIQUE,
            label TEXT NOT NULL,
            contest_year INTEGER,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    Ok(conn)
}

/// Opens one contest-year database file and brings its schema up to date.
pub fn open_contest_db(path: &Path) -> anyhow::Result<Connection> {
    let conn = Connection::open(path)?;
    init_contest_schema(&conn)?;
    Ok(conn)
}

pub fn init_contest_schema(conn: &Connection) -> anyhow::Result<()> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS roster(
            student_name TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            class_name TEXT NOT NULL,
            home_room TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            team_name TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roster_student ON roster(student_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_roster_class ON roster(class_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS class_info(
            class_name TEXT NOT NULL,
            home_room TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            grade_level INTEGER NOT NULL,
            team_name TEXT NOT NULL,
            total_students INTEGER NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS grade_rules(
            grade_level INTEGER PRIMARY KEY,
            min_daily_minutes INTEGER NOT NULL,
            max_daily_minutes_credit INTEGER NOT NULL DEFAULT 120
        )",
        [],
    )?;
    // Early contest files only carried the goal threshold.
    ensure_grade_rules_max_credit(conn)?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS daily_logs(
            id TEXT PRIMARY KEY,
            log_date TEXT NOT NULL,
            student_name TEXT NOT NULL,
            minutes_read INTEGER NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_logs_date ON daily_logs(log_date)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_daily_logs_student ON daily_logs(student_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS reader_cumulative(
            id TEXT PRIMARY KEY,
            student_name TEXT NOT NULL,
            donation_amount REAL NOT NULL,
            sponsors INTEGER NOT NULL,
            cumulative_minutes INTEGER NOT NULL,
            team_name TEXT NOT NULL,
            teacher_name TEXT NOT NULL,
            upload_timestamp TEXT NOT NULL
        )",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reader_cumulative_student ON reader_cumulative(student_name)",
        [],
    )?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_reader_cumulative_team ON reader_cumulative(team_name)",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS team_color_bonus(
            event_date TEXT NOT NULL,
            class_name TEXT NOT NULL,
            team_name TEXT NOT NULL,
            students_count INTEGER NOT NULL,
            bonus_minutes INTEGER NOT NULL,
            bonus_participation_points INTEGER NOT NULL,
            PRIMARY KEY(event_date, class_name)
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS upload_history(
            id TEXT PRIMARY KEY,
            upload_timestamp TEXT NOT NULL,
            log_date TEXT,
            filename TEXT NOT NULL,
            rows_processed INTEGER NOT NULL,
            minutes_processed INTEGER NOT NULL,
            students_affected INTEGER NOT NULL,
            upload_type TEXT NOT NULL,
            status TEXT NOT NULL,
            action_taken TEXT NOT NULL,
            records_replaced INTEGER NOT NULL,
            audit_details TEXT NOT NULL
        )",
        [],
    )?;
    ensure_upload_history_audit_details(conn)?;
    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_upload_history_timestamp ON upload_history(upload_timestamp)",
        [],
    )?;

    Ok(())
}

fn ensure_grade_rules_max_credit(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "grade_rules", "max_daily_minutes_credit")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE grade_rules ADD COLUMN max_daily_minutes_credit INTEGER NOT NULL DEFAULT 120",
        [],
    )?;
    Ok(())
}

fn ensure_upload_history_audit_details(conn: &Connection) -> anyhow::Result<()> {
    if table_has_column(conn, "upload_history", "audit_details")? {
        return Ok(());
    }
    conn.execute(
        "ALTER TABLE upload_history ADD COLUMN audit_details TEXT NOT NULL DEFAULT '{}'",
        [],
    )?;
    Ok(())
}

fn table_has_column(conn: &Connection, table: &str, column: &str) -> anyhow::Result<bool> {
    let sql = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

#[derive(Debug, Clone)]
pub struct DatabaseEntry {
    pub id: String,
    pub file_name: String,
    pub label: String,
    pub contest_year: Option<i64>,
    pub is_active: bool,
    pub created_at: String,
}

pub fn register_database(
    registry: &Connection,
    file_name: &str,
    label: &str,
    contest_year: Option<i64>,
) -> anyhow::Result<String> {
    let id = Uuid::new_v4().to_string();
    registry.execute(
        "INSERT INTO database_metadata(id, file_name, label, contest_year, is_active, created_at)
         VALUES(?, ?, ?, ?, 0, strftime('%Y-%m-%dT%H:%M:%SZ','now'))",
        (&id, file_name, label, contest_year),
    )?;
    Ok(id)
}

pub fn list_databases(registry: &Connection) -> anyhow::Result<Vec<DatabaseEntry>> {
    let mut stmt = registry.prepare(
        "SELECT id, file_name, label, contest_year, is_active, created_at
         FROM database_metadata
         ORDER BY created_at, file_name",
    )?;
    let rows = stmt
        .query_map([], |r| {
            Ok(DatabaseEntry {
                id: r.get(0)?,
                file_name: r.get(1)?,
                label: r.get(2)?,
                contest_year: r.get(3)?,
                is_active: r.get::<_, i64>(4)? != 0,
                created_at: r.get(5)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Flips the single active flag to `file_name`. Returns false (and changes
/// nothing) when the file is not registered.
pub fn activate_database(registry: &Connection, file_name: &str) -> anyhow::Result<bool> {
    let known: i64 = registry.query_row(
        "SELECT COUNT(*) FROM database_metadata WHERE file_name = ?",
        [file_name],
        |r| r.get(0),
    )?;
    if known == 0 {
        return Ok(false);
    }
    let tx = registry.unchecked_transaction()?;
    tx.execute("UPDATE database_metadata SET is_active = 0", [])?;
    tx.execute(
        "UPDATE database_metadata SET is_active = 1 WHERE file_name = ?",
        [file_name],
    )?;
    tx.commit()?;
    Ok(true)
}
