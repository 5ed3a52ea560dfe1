// ==========================================
// 标本导入对账系统 - 标本请求关联 Repository
// ==========================================
// 职责: 请求明细的孤儿标记 + 样品管 locked_in_request 缓存刷新
// 说明: 请求本身由外部系统维护，本模块只读写关联状态
// ==========================================

use crate::repository::error::RepositoryResult;
use rusqlite::{params, Transaction};

/// 未结束请求引用的 GlobalUniqueId
const OPEN_REQUEST_GUIDS_SQL: &str = r#"
    SELECT srs.specimen_global_unique_id
    FROM sample_request_specimen srs
    JOIN sample_request sr ON sr.row_id = srs.sample_request_id
    WHERE srs.container = ?1 AND sr.final_state = 0
"#;

pub struct RequestRepository;

impl RequestRepository {
    /// 孤儿标记
    ///
    /// # 规则
    /// - 未结束请求引用、但样品管已不存在 → orphaned = 1
    /// - 已标记孤儿、样品管重新出现 → orphaned = 0
    ///
    /// # 返回
    /// - (新标记数, 取消标记数)
    pub fn mark_orphans_tx(tx: &Transaction, container: &str) -> RepositoryResult<(usize, usize)> {
        let marked = tx.execute(
            r#"
            UPDATE sample_request_specimen
            SET orphaned = 1
            WHERE container = ?1
              AND orphaned = 0
              AND sample_request_id IN (SELECT row_id FROM sample_request WHERE final_state = 0)
              AND specimen_global_unique_id NOT IN
                  (SELECT global_unique_id FROM vial WHERE container = ?1)
            "#,
            params![container],
        )?;

        let unmarked = tx.execute(
            r#"
            UPDATE sample_request_specimen
            SET orphaned = 0
            WHERE container = ?1
              AND orphaned = 1
              AND specimen_global_unique_id IN
                  (SELECT global_unique_id FROM vial WHERE container = ?1)
            "#,
            params![container],
        )?;

        Ok((marked, unmarked))
    }

    /// 刷新 locked_in_request（被未结束请求引用即锁定）
    ///
    /// # 返回
    /// - 发生变化的样品管数
    pub fn refresh_locked_in_request_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let locked = format!(
            "CASE WHEN global_unique_id IN ({}) THEN 1 ELSE 0 END",
            OPEN_REQUEST_GUIDS_SQL
        );
        let sql = format!(
            "UPDATE vial SET locked_in_request = {locked} WHERE container = ?1 AND locked_in_request <> {locked}",
            locked = locked
        );
        Ok(tx.execute(&sql, params![container])?)
    }

    /// 当前孤儿请求明细数
    pub fn count_orphans_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let count: i64 = tx.query_row(
            "SELECT COUNT(*) FROM sample_request_specimen WHERE container = ?1 AND orphaned = 1",
            params![container],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}
