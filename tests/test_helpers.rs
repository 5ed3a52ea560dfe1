// ==========================================
// 测试辅助函数
// ==========================================
// 职责: 提供测试所需的数据库初始化、导入器构造、文件内容生成等功能
// ==========================================

#![allow(dead_code)]

use rusqlite::Connection;
use specimen_sync::config::ConfigManager;
use specimen_sync::importer::{RawTable, SpecimenImporterImpl, TsvParser};
use std::error::Error;
use std::sync::{Arc, Mutex};
use tempfile::NamedTempFile;

/// 测试容器
pub const CONTAINER: &str = "study-1";

/// 标本文件默认表头
pub const SPECIMEN_HEADERS: &[&str] = &[
    "global_unique_specimen_id",
    "ptid",
    "visit_value",
    "lab_id",
    "lab_receipt_date",
    "volume",
    "volume_units",
];

/// 创建临时测试数据库并初始化 schema
///
/// # 返回
/// - NamedTempFile: 临时数据库文件（需要保持存活）
/// - String: 数据库文件路径
pub fn create_test_db() -> Result<(NamedTempFile, String), Box<dyn Error>> {
    let temp_file = NamedTempFile::new()?;
    let db_path = temp_file.path().to_str().ok_or("路径不是 UTF-8")?.to_string();

    let conn = specimen_sync::db::open_sqlite_connection(&db_path)?;
    specimen_sync::db::init_schema(&conn)?;

    Ok((temp_file, db_path))
}

/// 打开共享连接（导入器与配置管理器共用）
pub fn open_shared(db_path: &str) -> Arc<Mutex<Connection>> {
    let conn = specimen_sync::db::open_sqlite_connection(db_path).expect("Failed to open db");
    Arc::new(Mutex::new(conn))
}

/// 创建使用默认协作者的导入器
pub fn create_test_importer(db_path: &str) -> SpecimenImporterImpl<ConfigManager> {
    let conn = open_shared(db_path);
    let config = ConfigManager::from_connection(conn.clone()).expect("Failed to create ConfigManager");
    SpecimenImporterImpl::new(conn, config)
}

/// 写入容器配置
pub fn set_config(db_path: &str, scope: &str, key: &str, value: &str) {
    let config = ConfigManager::new(db_path).expect("Failed to create ConfigManager");
    config.set(scope, key, value).expect("Failed to set config");
}

/// 由表名/表头/数据行构造文件内容并解析
pub fn tsv(table: &str, headers: &[&str], rows: &[&[&str]]) -> RawTable {
    let mut content = format!("#{}\n{}\n", table, headers.join("\t"));
    for row in rows {
        content.push_str(&row.join("\t"));
        content.push('\n');
    }
    TsvParser
        .parse_str(&format!("{}.tsv", table), &content)
        .expect("Failed to parse test table")
}

/// 实验室表: 11 = Lab A, 12 = Lab B（标本库）
pub fn labs() -> RawTable {
    tsv(
        "labs",
        &["lab_id", "lab_name", "is_repository"],
        &[&["11", "Lab A", "0"], &["12", "Lab B", "1"]],
    )
}

/// 标本文件（默认表头）
pub fn specimens(rows: &[&[&str]]) -> RawTable {
    tsv("specimens", SPECIMEN_HEADERS, rows)
}

/// 单值查询
pub fn query_i64(db_path: &str, sql: &str) -> i64 {
    let conn = Connection::open(db_path).expect("Failed to open db");
    conn.query_row(sql, [], |row| row.get(0)).expect("Query failed")
}

pub fn query_opt_f64(db_path: &str, sql: &str) -> Option<f64> {
    let conn = Connection::open(db_path).expect("Failed to open db");
    conn.query_row(sql, [], |row| row.get(0)).expect("Query failed")
}

/// 三层主表行数
pub fn core_counts(db_path: &str) -> (i64, i64, i64) {
    (
        query_i64(db_path, "SELECT COUNT(*) FROM specimen"),
        query_i64(db_path, "SELECT COUNT(*) FROM vial"),
        query_i64(db_path, "SELECT COUNT(*) FROM specimen_event"),
    )
}
