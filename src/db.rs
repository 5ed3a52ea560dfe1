// ==========================================
// 标本导入对账系统 - SQLite 连接初始化与建库
// ==========================================
// 目标:
// - 统一所有 Connection::open 的 PRAGMA 行为（外键 + busy_timeout）
// - 幂等建库: 三层主表 DDL 由列目录生成，查找表 DDL 由查找表目录生成
// ==========================================

use crate::domain::columns::{LookupKind, COL_EXTERNAL_ID};
use crate::repository::table_layout::TableLayout;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::PathBuf;
use std::time::Duration;

/// 默认 busy_timeout（毫秒）
pub const DEFAULT_BUSY_TIMEOUT_MS: u64 = 5_000;

/// 当前代码所期望的 schema_version
pub const CURRENT_SCHEMA_VERSION: i64 = 1;

/// 配置 SQLite 连接的统一 PRAGMA
///
/// 说明：
/// - foreign_keys 需要“每个连接”单独开启
/// - busy_timeout 需要“每个连接”单独配置
pub fn configure_sqlite_connection(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch("PRAGMA foreign_keys = ON;")?;
    conn.busy_timeout(Duration::from_millis(DEFAULT_BUSY_TIMEOUT_MS))?;
    Ok(())
}

/// 打开 SQLite 连接并应用统一配置
pub fn open_sqlite_connection(db_path: &str) -> rusqlite::Result<Connection> {
    let conn = Connection::open(db_path)?;
    configure_sqlite_connection(&conn)?;
    Ok(conn)
}

/// 读取 schema_version（若表不存在则返回 None）
pub fn read_schema_version(conn: &Connection) -> rusqlite::Result<Option<i64>> {
    let has_table: bool = conn
        .query_row(
            "SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_version' LIMIT 1",
            [],
            |_row| Ok(true),
        )
        .optional()?
        .unwrap_or(false);

    if !has_table {
        return Ok(None);
    }

    let v: Option<i64> = conn.query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))?;
    Ok(v)
}

/// 查找表建表语句
fn lookup_table_sql(kind: LookupKind) -> String {
    let mut sql = format!(
        "CREATE TABLE IF NOT EXISTS {} (\n    row_id INTEGER PRIMARY KEY AUTOINCREMENT,\n    container TEXT NOT NULL,\n    entity_id TEXT NOT NULL",
        kind.table_name()
    );
    for column in kind.columns() {
        sql.push_str(",\n    ");
        sql.push_str(column.db_name);
        sql.push(' ');
        sql.push_str(column.field_type.sql_type());
        if column.db_name == COL_EXTERNAL_ID {
            sql.push_str(" NOT NULL");
        }
    }
    if kind == LookupKind::Location {
        sql.push_str(",\n    in_use INTEGER NOT NULL DEFAULT 0");
    }
    sql.push_str(&format!(",\n    UNIQUE (container, {})\n)", COL_EXTERNAL_ID));
    sql
}

const STUDY_TABLES_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS participant (
    container TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    PRIMARY KEY (container, participant_id)
);

CREATE TABLE IF NOT EXISTS participant_visit (
    container TEXT NOT NULL,
    participant_id TEXT NOT NULL,
    sequence_num REAL NOT NULL,
    participant_sequence_num TEXT NOT NULL,
    PRIMARY KEY (container, participant_id, sequence_num)
);

CREATE TABLE IF NOT EXISTS visit (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    container TEXT NOT NULL,
    sequence_num_min REAL NOT NULL,
    sequence_num_max REAL NOT NULL,
    label TEXT
);

CREATE TABLE IF NOT EXISTS sample_request (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    container TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'NEW',
    final_state INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS sample_request_specimen (
    row_id INTEGER PRIMARY KEY AUTOINCREMENT,
    container TEXT NOT NULL,
    sample_request_id INTEGER NOT NULL REFERENCES sample_request(row_id),
    specimen_global_unique_id TEXT NOT NULL,
    orphaned INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS specimen_sequence (
    container TEXT PRIMARY KEY,
    next_value INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS config_kv (
    scope_id TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (scope_id, key)
);

CREATE TABLE IF NOT EXISTS schema_version (
    version INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

const INDEXES_SQL: &str = r#"
CREATE UNIQUE INDEX IF NOT EXISTS ux_specimen_hash ON specimen (container, specimen_hash);
CREATE UNIQUE INDEX IF NOT EXISTS ux_vial_guid ON vial (container, global_unique_id);
CREATE INDEX IF NOT EXISTS ix_vial_specimen ON vial (specimen_id);
CREATE INDEX IF NOT EXISTS ix_event_vial ON specimen_event (vial_id);
CREATE INDEX IF NOT EXISTS ix_request_specimen_guid ON sample_request_specimen (container, specimen_global_unique_id);
"#;

/// 幂等建库
///
/// # 说明
/// - 全部使用 IF NOT EXISTS，可在已有库上重复执行
/// - 首次建库写入 CURRENT_SCHEMA_VERSION
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    for kind in LookupKind::all() {
        conn.execute_batch(&lookup_table_sql(kind))?;
    }
    for layout in [TableLayout::specimen(), TableLayout::vial(), TableLayout::event()] {
        conn.execute_batch(&layout.create_table_sql())?;
    }
    conn.execute_batch(STUDY_TABLES_SQL)?;
    conn.execute_batch(INDEXES_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        params![CURRENT_SCHEMA_VERSION],
    )?;
    Ok(())
}

/// 默认数据库路径
///
/// # 查找顺序
/// - 环境变量 SPECIMEN_SYNC_DB_PATH
/// - 用户数据目录/specimen-sync/specimen_sync.db
/// - 当前目录 ./specimen_sync.db
pub fn default_db_path() -> String {
    if let Ok(path) = std::env::var("SPECIMEN_SYNC_DB_PATH") {
        let trimmed = path.trim();
        if !trimmed.is_empty() {
            return trimmed.to_string();
        }
    }

    let mut path = PathBuf::from("./specimen_sync.db");
    if let Some(data_dir) = dirs::data_local_dir() {
        let dir = data_dir.join("specimen-sync");
        if std::fs::create_dir_all(&dir).is_ok() {
            path = dir.join("specimen_sync.db");
        }
    }
    path.to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        configure_sqlite_connection(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), Some(CURRENT_SCHEMA_VERSION));

        let tables: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name IN ('specimen','vial','specimen_event','location')",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(tables, 4);
    }

    #[test]
    fn test_schema_version_absent() {
        let conn = Connection::open_in_memory().unwrap();
        assert_eq!(read_schema_version(&conn).unwrap(), None);
    }
}
