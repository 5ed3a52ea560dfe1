// ==========================================
// 标本导入对账系统 - 标本三层主表 Repository 实现
// ==========================================
// 职责: 只读查询（trait 实现）+ 导入事务内的 *_tx 读写函数
// 红线: Repository 不含业务规则，只做数据 CRUD
// ==========================================

use crate::domain::columns::{specimen_defining_columns, COL_GLOBAL_UNIQUE_ID};
use crate::domain::record::{Record, StoredRow};
use crate::domain::types::{FieldType, FieldValue};
use crate::repository::error::{RepositoryError, RepositoryResult};
use crate::repository::row_store::{placeholders, select_rows, IN_CHUNK_SIZE};
use crate::repository::specimen_repo::SpecimenRepository;
use crate::repository::table_layout::TableLayout;
use async_trait::async_trait;
use rusqlite::types::ToSql;
use rusqlite::{params, Connection, Transaction};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

// ==========================================
// SpecimenRepositoryImpl
// ==========================================
pub struct SpecimenRepositoryImpl {
    conn: Arc<Mutex<Connection>>,
}

impl SpecimenRepositoryImpl {
    /// 创建新的 Repository 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> RepositoryResult<Self> {
        let conn = crate::db::open_sqlite_connection(db_path)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建仓储实例
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> Self {
        Self { conn }
    }

    fn get_conn(&self) -> RepositoryResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|e| RepositoryError::LockError(e.to_string()))
    }

    fn count(&self, table: &str, container: &str) -> RepositoryResult<usize> {
        let conn = self.get_conn()?;
        let count: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE container = ?1", table),
            params![container],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    // ===== 事务内读取 =====

    pub fn load_specimens_tx(conn: &Connection, container: &str) -> RepositoryResult<Vec<StoredRow>> {
        select_rows(conn, &TableLayout::specimen(), "container = ?1", "row_id", &[&container])
    }

    pub fn load_vials_tx(conn: &Connection, container: &str) -> RepositoryResult<Vec<StoredRow>> {
        select_rows(conn, &TableLayout::vial(), "container = ?1", "row_id", &[&container])
    }

    pub fn load_events_tx(conn: &Connection, container: &str) -> RepositoryResult<Vec<StoredRow>> {
        select_rows(conn, &TableLayout::event(), "container = ?1", "row_id", &[&container])
    }

    /// 指定样品管的事件（分批 IN 查询）
    pub fn load_events_for_vials_tx(conn: &Connection, vial_ids: &[i64]) -> RepositoryResult<Vec<StoredRow>> {
        let layout = TableLayout::event();
        let mut events = Vec::new();
        for chunk in vial_ids.chunks(IN_CHUNK_SIZE) {
            let where_sql = format!("vial_id IN ({})", placeholders(1, chunk.len()));
            let params: Vec<&dyn ToSql> = chunk.iter().map(|id| id as &dyn ToSql).collect();
            events.extend(select_rows(conn, &layout, &where_sql, "vial_id, row_id", &params)?);
        }
        Ok(events)
    }

    /// 按 row_id 顺序取一批样品管
    ///
    /// # 参数
    /// - after_row_id: 上一批最后一个 row_id（首批传 0）
    pub fn vial_batch_tx(
        conn: &Connection,
        container: &str,
        after_row_id: i64,
        limit: usize,
    ) -> RepositoryResult<Vec<StoredRow>> {
        let limit = limit as i64;
        select_rows(
            conn,
            &TableLayout::vial(),
            "container = ?1 AND row_id > ?2",
            "row_id LIMIT ?3",
            &[&container, &after_row_id, &limit],
        )
    }

    /// 某一 row_id 区间内样品管的事件（按 vial_id 排序，供双指针合并）
    pub fn events_for_vial_range_tx(
        conn: &Connection,
        container: &str,
        min_vial_id: i64,
        max_vial_id: i64,
    ) -> RepositoryResult<Vec<StoredRow>> {
        select_rows(
            conn,
            &TableLayout::event(),
            "container = ?1 AND vial_id BETWEEN ?2 AND ?3",
            "vial_id, row_id",
            &[&container, &min_vial_id, &max_vial_id],
        )
    }

    /// 已存在的 GlobalUniqueId
    pub fn existing_guids_tx(
        conn: &Connection,
        container: &str,
        guids: &[String],
    ) -> RepositoryResult<HashSet<String>> {
        let mut existing = HashSet::new();
        for chunk in guids.chunks(IN_CHUNK_SIZE) {
            let sql = format!(
                "SELECT global_unique_id FROM vial WHERE container = ?1 AND global_unique_id IN ({})",
                placeholders(2, chunk.len())
            );
            let mut params: Vec<&dyn ToSql> = vec![&container];
            params.extend(chunk.iter().map(|g| g as &dyn ToSql));

            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params.as_slice(), |row| row.get::<_, String>(0))?;
            for guid in rows {
                existing.insert(guid?);
            }
        }
        Ok(existing)
    }

    /// 批次内 GlobalUniqueId 的存量标本定义字段（样品管 ⋈ 标本）
    pub fn persisted_defining_rows_tx(
        conn: &Connection,
        container: &str,
        guids: &[String],
    ) -> RepositoryResult<Vec<Record>> {
        let columns: Vec<(&str, FieldType)> = specimen_defining_columns()
            .map(|c| (c.db_name, c.field_type))
            .collect();
        let select_list = columns
            .iter()
            .map(|(name, _)| format!("s.{}", name))
            .collect::<Vec<_>>()
            .join(", ");

        let mut records = Vec::new();
        for chunk in guids.chunks(IN_CHUNK_SIZE) {
            let sql = format!(
                "SELECT v.global_unique_id, {} FROM vial v JOIN specimen s ON s.row_id = v.specimen_id \
                 WHERE v.container = ?1 AND v.global_unique_id IN ({})",
                select_list,
                placeholders(2, chunk.len())
            );
            let mut params: Vec<&dyn ToSql> = vec![&container];
            params.extend(chunk.iter().map(|g| g as &dyn ToSql));

            let mut stmt = conn.prepare(&sql)?;
            let mut rows = stmt.query(params.as_slice())?;
            while let Some(row) = rows.next()? {
                let mut record = Record::new();
                record.set(COL_GLOBAL_UNIQUE_ID, FieldValue::Text(row.get(0)?));
                for (idx, (name, field_type)) in columns.iter().enumerate() {
                    record.set(name, FieldValue::from_sql_ref(row.get_ref(idx + 1)?, *field_type));
                }
                records.push(record);
            }
        }
        Ok(records)
    }

    // ===== 事务内写入 =====

    /// 删除容器内全部 事件 / 样品管 / 标本（全量替换）
    ///
    /// # 返回
    /// - (事件数, 样品管数, 标本数)
    pub fn delete_container_tx(tx: &Transaction, container: &str) -> RepositoryResult<(usize, usize, usize)> {
        let events = tx.execute("DELETE FROM specimen_event WHERE container = ?1", params![container])?;
        let vials = tx.execute("DELETE FROM vial WHERE container = ?1", params![container])?;
        let specimens = tx.execute("DELETE FROM specimen WHERE container = ?1", params![container])?;
        Ok((events, vials, specimens))
    }

    /// 删除已无样品管引用的标本
    pub fn delete_specimens_without_vials_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let deleted = tx.execute(
            r#"
            DELETE FROM specimen
            WHERE container = ?1
              AND row_id NOT IN (SELECT specimen_id FROM vial WHERE container = ?1)
            "#,
            params![container],
        )?;
        Ok(deleted)
    }

    /// 预留一段连续的样品管序号
    ///
    /// # 参数
    /// - initial: 容器首次取号时的起始值
    ///
    /// # 返回
    /// - 本段起始序号（[start, start + count)）
    pub fn reserve_sequence_tx(
        tx: &Transaction,
        container: &str,
        count: usize,
        initial: i64,
    ) -> RepositoryResult<i64> {
        tx.execute(
            "INSERT OR IGNORE INTO specimen_sequence (container, next_value) VALUES (?1, ?2)",
            params![container, initial],
        )?;
        let start: i64 = tx.query_row(
            "SELECT next_value FROM specimen_sequence WHERE container = ?1",
            params![container],
            |row| row.get(0),
        )?;
        tx.execute(
            "UPDATE specimen_sequence SET next_value = next_value + ?2 WHERE container = ?1",
            params![container, count as i64],
        )?;
        Ok(start)
    }

    /// 默认可请求规则: available = (requestable 非空取之，否则 at_repository) 且未被请求锁定
    pub fn apply_default_requestability_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let rule = "CASE WHEN locked_in_request = 1 THEN 0 \
                    WHEN requestable IS NOT NULL THEN requestable \
                    ELSE COALESCE(at_repository, 0) END";
        let sql = format!(
            "UPDATE vial SET available = {rule} WHERE container = ?1 AND available IS NOT ({rule})",
            rule = rule
        );
        Ok(tx.execute(&sql, params![container])?)
    }
}

#[async_trait]
impl SpecimenRepository for SpecimenRepositoryImpl {
    async fn count_specimens(&self, container: &str) -> RepositoryResult<usize> {
        self.count("specimen", container)
    }

    async fn count_vials(&self, container: &str) -> RepositoryResult<usize> {
        self.count("vial", container)
    }

    async fn count_events(&self, container: &str) -> RepositoryResult<usize> {
        self.count("specimen_event", container)
    }

    async fn find_vial(&self, container: &str, global_unique_id: &str) -> RepositoryResult<Option<StoredRow>> {
        let conn = self.get_conn()?;
        let rows = select_rows(
            &conn,
            &TableLayout::vial(),
            "container = ?1 AND global_unique_id = ?2",
            "row_id",
            &[&container, &global_unique_id],
        )?;
        Ok(rows.into_iter().next())
    }

    async fn find_specimen(&self, row_id: i64) -> RepositoryResult<Option<StoredRow>> {
        let conn = self.get_conn()?;
        let rows = select_rows(&conn, &TableLayout::specimen(), "row_id = ?1", "row_id", &[&row_id])?;
        Ok(rows.into_iter().next())
    }

    async fn list_specimens(&self, container: &str) -> RepositoryResult<Vec<StoredRow>> {
        let conn = self.get_conn()?;
        Self::load_specimens_tx(&conn, container)
    }

    async fn list_vials(&self, container: &str) -> RepositoryResult<Vec<StoredRow>> {
        let conn = self.get_conn()?;
        Self::load_vials_tx(&conn, container)
    }

    async fn list_events_for_vial(&self, vial_row_id: i64) -> RepositoryResult<Vec<StoredRow>> {
        let conn = self.get_conn()?;
        Self::load_events_for_vials_tx(&conn, &[vial_row_id])
    }
}
