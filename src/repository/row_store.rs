// ==========================================
// 标本导入对账系统 - 按布局读写行
// ==========================================
// 职责: 基于 TableLayout 的通用 SELECT / INSERT / UPDATE
// 红线: 列名只来自布局常量，取值一律参数化
// ==========================================

use crate::domain::record::{Record, StoredRow};
use crate::domain::types::FieldValue;
use crate::repository::error::RepositoryResult;
use crate::repository::table_layout::TableLayout;
use rusqlite::types::ToSql;
use rusqlite::{Connection, Transaction};

/// IN 列表单批参数上限
pub const IN_CHUNK_SIZE: usize = 500;

/// `?N, ?N+1, ...` 占位符（从 start 开始编号）
pub fn placeholders(start: usize, count: usize) -> String {
    (start..start + count)
        .map(|i| format!("?{}", i))
        .collect::<Vec<_>>()
        .join(", ")
}

/// 按布局读取行
///
/// # 参数
/// - where_sql: WHERE 之后的条件（不含 WHERE 关键字）
/// - order_sql: ORDER BY 之后的排序（不含 ORDER BY 关键字）
pub fn select_rows(
    conn: &Connection,
    layout: &TableLayout,
    where_sql: &str,
    order_sql: &str,
    params: &[&dyn ToSql],
) -> RepositoryResult<Vec<StoredRow>> {
    let column_list = layout
        .columns
        .iter()
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "SELECT row_id, {} FROM {} WHERE {} ORDER BY {}",
        column_list, layout.name, where_sql, order_sql
    );

    let mut stmt = conn.prepare(&sql)?;
    let mut rows = stmt.query(params)?;
    let mut result = Vec::new();
    while let Some(row) = rows.next()? {
        let row_id: i64 = row.get(0)?;
        let mut record = Record::new();
        for (idx, (name, field_type)) in layout.columns.iter().enumerate() {
            record.set(name, FieldValue::from_sql_ref(row.get_ref(idx + 1)?, *field_type));
        }
        result.push(StoredRow { row_id, record });
    }
    Ok(result)
}

/// 插入一行（只写记录中出现且属于布局的列）
///
/// # 返回
/// - 新行 row_id
pub fn insert_row_tx(
    tx: &Transaction,
    layout: &TableLayout,
    container: &str,
    record: &Record,
) -> RepositoryResult<i64> {
    let columns: Vec<&str> = layout
        .columns
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| record.contains(name))
        .collect();

    let mut sql = format!("INSERT INTO {} (container", layout.name);
    for column in &columns {
        sql.push_str(", ");
        sql.push_str(column);
    }
    sql.push_str(&format!(") VALUES ({})", placeholders(1, columns.len() + 1)));

    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(columns.len() + 1);
    params.push(&container);
    for column in &columns {
        params.push(record.get(column));
    }

    tx.prepare_cached(&sql)?.execute(params.as_slice())?;
    Ok(tx.last_insert_rowid())
}

/// 按 row_id 更新指定列
pub fn update_row_tx(
    tx: &Transaction,
    layout: &TableLayout,
    row_id: i64,
    record: &Record,
    columns: &[&str],
) -> RepositoryResult<usize> {
    if columns.is_empty() {
        return Ok(0);
    }
    let assignments = columns
        .iter()
        .enumerate()
        .map(|(idx, column)| format!("{} = ?{}", column, idx + 1))
        .collect::<Vec<_>>()
        .join(", ");
    let sql = format!(
        "UPDATE {} SET {} WHERE row_id = ?{}",
        layout.name,
        assignments,
        columns.len() + 1
    );

    let mut params: Vec<&dyn ToSql> = Vec::with_capacity(columns.len() + 1);
    for column in columns {
        params.push(record.get(column));
    }
    params.push(&row_id);

    Ok(tx.prepare_cached(&sql)?.execute(params.as_slice())?)
}

/// 候选记录相对存量行发生变化的列
///
/// # 参数
/// - skip: 不参与比较的列（标识列等）
pub fn changed_columns<'a>(
    layout: &'a TableLayout,
    stored: &Record,
    candidate: &Record,
    skip: &[&str],
) -> Vec<&'a str> {
    layout
        .columns
        .iter()
        .map(|(name, _)| *name)
        .filter(|name| candidate.contains(name) && !skip.contains(name))
        .filter(|name| !stored.get(name).same_as(candidate.get(name)))
        .collect()
}
