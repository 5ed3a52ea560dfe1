// ==========================================
// 标本导入对账系统 - 查找表 Repository
// ==========================================
// 职责: 实验室 / 添加剂 / 衍生物 / 原始类型 四张查找表的事务内读写
// 说明: 外部 ID（external_id）在容器内唯一，导入时按它对齐
// ==========================================

use crate::domain::columns::{LookupKind, COL_EXTERNAL_ID, LOOKUP_COL_REPOSITORY};
use crate::domain::record::{Record, StoredRow};
use crate::domain::types::FieldValue;
use crate::engine::vial_derivation::RepositoryFlags;
use crate::repository::error::RepositoryResult;
use crate::repository::row_store::{insert_row_tx, select_rows, update_row_tx};
use crate::repository::table_layout::{TableLayout, COL_ENTITY_ID};
use rusqlite::{params, Connection, Transaction};
use std::collections::HashMap;
use uuid::Uuid;

pub struct LookupRepository;

impl LookupRepository {
    /// 容器内某查找表的全部行（按 row_id）
    pub fn load_tx(conn: &Connection, container: &str, kind: LookupKind) -> RepositoryResult<Vec<StoredRow>> {
        select_rows(conn, &TableLayout::lookup(kind), "container = ?1", "row_id", &[&container])
    }

    /// 插入查找表行（分配新的 entity_id）
    ///
    /// # 返回
    /// - 新行 row_id
    pub fn insert_tx(
        tx: &Transaction,
        container: &str,
        kind: LookupKind,
        record: &Record,
    ) -> RepositoryResult<i64> {
        let record = record
            .clone()
            .with(COL_ENTITY_ID, FieldValue::Text(Uuid::new_v4().to_string()));
        insert_row_tx(tx, &TableLayout::lookup(kind), container, &record)
    }

    pub fn update_tx(
        tx: &Transaction,
        kind: LookupKind,
        row_id: i64,
        record: &Record,
        columns: &[&str],
    ) -> RepositoryResult<usize> {
        update_row_tx(tx, &TableLayout::lookup(kind), row_id, record, columns)
    }

    pub fn delete_all_tx(tx: &Transaction, container: &str, kind: LookupKind) -> RepositoryResult<usize> {
        let sql = format!("DELETE FROM {} WHERE container = ?1", kind.table_name());
        Ok(tx.execute(&sql, params![container])?)
    }

    /// 外部 ID → row_id
    pub fn external_id_map_tx(
        conn: &Connection,
        container: &str,
        kind: LookupKind,
    ) -> RepositoryResult<HashMap<i64, i64>> {
        let sql = format!(
            "SELECT {}, row_id FROM {} WHERE container = ?1",
            COL_EXTERNAL_ID,
            kind.table_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![container], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, i64>(1)?))
        })?;

        let mut map = HashMap::new();
        for row in rows {
            let (external_id, row_id) = row?;
            map.insert(external_id, row_id);
        }
        Ok(map)
    }

    /// 地点 row_id → 是否为标本库
    pub fn repository_flags_tx(conn: &Connection, container: &str) -> RepositoryResult<RepositoryFlags> {
        let sql = format!(
            "SELECT row_id, COALESCE({}, 0) FROM {} WHERE container = ?1",
            LOOKUP_COL_REPOSITORY,
            LookupKind::Location.table_name()
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![container], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, bool>(1)?))
        })?;

        let mut flags = RepositoryFlags::new();
        for row in rows {
            let (row_id, is_repository) = row?;
            flags.insert(row_id, is_repository);
        }
        Ok(flags)
    }

    /// 重算地点 in_use（被事件实验室或标本来源地点引用）
    ///
    /// # 返回
    /// - 标记发生变化的地点数
    pub fn refresh_in_use_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let updated = tx.execute(
            r#"
            UPDATE location
            SET in_use = CASE WHEN (
                    EXISTS (SELECT 1 FROM specimen_event e
                            WHERE e.container = location.container AND e.lab_id = location.row_id)
                 OR EXISTS (SELECT 1 FROM specimen s
                            WHERE s.container = location.container
                              AND s.originating_location_id = location.row_id)
                ) THEN 1 ELSE 0 END
            WHERE container = ?1
              AND in_use <> CASE WHEN (
                    EXISTS (SELECT 1 FROM specimen_event e
                            WHERE e.container = location.container AND e.lab_id = location.row_id)
                 OR EXISTS (SELECT 1 FROM specimen s
                            WHERE s.container = location.container
                              AND s.originating_location_id = location.row_id)
                ) THEN 1 ELSE 0 END
            "#,
            params![container],
        )?;
        Ok(updated)
    }
}
