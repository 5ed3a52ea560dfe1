// ==========================================
// 标本导入对账系统 - 外部协作者默认实现
// ==========================================
// 职责: 受试者 ID / 序列号 / 全局唯一 ID / 可请求规则 的默认实现
//       + 协作式取消标志
// 说明: 调用方可通过 SpecimenImporterImpl 的 with_* 方法替换
// ==========================================

use crate::domain::types::TimepointType;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::specimen_importer_trait::{
    ParticipantIdTranslator, RequestabilityEngine, SequenceNumTranslator, UniqueIdGenerator,
};
use crate::repository::specimen_repo_impl::SpecimenRepositoryImpl;
use chrono::{Datelike, NaiveDateTime};
use rusqlite::Transaction;
use tokio_util::sync::CancellationToken;

/// 自动生成 ID 的起始序号
pub const GENERATED_ID_START: i64 = 70_000;

// ==========================================
// IdentityParticipantTranslator - 原样返回
// ==========================================
#[derive(Debug, Default, Clone, Copy)]
pub struct IdentityParticipantTranslator;

impl ParticipantIdTranslator for IdentityParticipantTranslator {
    fn translate(&self, _container: &str, ptid: &str) -> ImportResult<String> {
        Ok(ptid.to_string())
    }
}

// ==========================================
// DefaultSequenceNumTranslator
// ==========================================
// VISIT: 访视值即序列号
// DATE: 采样日期 yyyymmdd
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSequenceNumTranslator;

impl SequenceNumTranslator for DefaultSequenceNumTranslator {
    fn sequence_num(
        &self,
        timepoint: TimepointType,
        visit_value: Option<f64>,
        draw_timestamp: Option<NaiveDateTime>,
    ) -> Option<f64> {
        match timepoint {
            TimepointType::Visit => visit_value,
            TimepointType::Date => draw_timestamp.map(|dt| {
                let date = dt.date();
                (date.year() as f64) * 10_000.0 + (date.month() as f64) * 100.0 + date.day() as f64
            }),
        }
    }
}

// ==========================================
// SequenceIdGenerator - 容器级序号
// ==========================================
// 从 GENERATED_ID_START 起取号，跳过样品管表中已存在的 ID
#[derive(Debug, Default, Clone, Copy)]
pub struct SequenceIdGenerator;

impl UniqueIdGenerator for SequenceIdGenerator {
    fn next_ids(&self, tx: &Transaction, container: &str, count: usize) -> ImportResult<Vec<String>> {
        let mut ids = Vec::with_capacity(count);
        while ids.len() < count {
            let remaining = count - ids.len();
            let start = SpecimenRepositoryImpl::reserve_sequence_tx(tx, container, remaining, GENERATED_ID_START)?;
            let candidates: Vec<String> = (start..start + remaining as i64).map(|v| v.to_string()).collect();
            let existing = SpecimenRepositoryImpl::existing_guids_tx(tx, container, &candidates)?;
            ids.extend(candidates.into_iter().filter(|id| !existing.contains(id)));
        }
        Ok(ids)
    }
}

// ==========================================
// DefaultRequestabilityRules
// ==========================================
// available = (requestable 非空取之，否则 at_repository) 且未被请求锁定
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultRequestabilityRules;

impl RequestabilityEngine for DefaultRequestabilityRules {
    fn apply(&self, tx: &Transaction, container: &str) -> ImportResult<usize> {
        Ok(SpecimenRepositoryImpl::apply_default_requestability_tx(tx, container)?)
    }
}

// ==========================================
// CancelHandle - 协作式取消
// ==========================================
// 阶段之间轮询；置位后当前运行回滚
// 令牌不可复位: 取消后的导入器需换新句柄（with_cancel_handle）
#[derive(Debug, Default, Clone)]
pub struct CancelHandle {
    token: CancellationToken,
}

impl CancelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// 取消当前及后续导入
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// 底层令牌（可与其他 tokio 任务共享）
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// 父令牌取消时一并取消
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    /// 已取消 → Err(Cancelled)
    pub fn check(&self) -> ImportResult<()> {
        if self.token.is_cancelled() {
            Err(ImportError::Cancelled)
        } else {
            Ok(())
        }
    }
}

impl From<CancellationToken> for CancelHandle {
    fn from(token: CancellationToken) -> Self {
        Self { token }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rusqlite::Connection;

    #[test]
    fn test_sequence_num_translation() {
        let translator = DefaultSequenceNumTranslator;
        let draw = NaiveDate::from_ymd_opt(2024, 3, 7)
            .and_then(|d| d.and_hms_opt(10, 0, 0))
            .unwrap();
        assert_eq!(translator.sequence_num(TimepointType::Visit, Some(2.5), Some(draw)), Some(2.5));
        assert_eq!(translator.sequence_num(TimepointType::Visit, None, Some(draw)), None);
        assert_eq!(translator.sequence_num(TimepointType::Date, None, Some(draw)), Some(20240307.0));
    }

    #[test]
    fn test_sequence_generator_skips_existing() {
        let mut conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();
        conn.execute_batch(
            r#"
            INSERT INTO specimen (container, specimen_hash) VALUES ('c1', 'H1');
            INSERT INTO vial (container, global_unique_id, lsid, specimen_id, specimen_hash)
                VALUES ('c1', '70001', 'lsid:70001', 1, 'H1');
            "#,
        )
        .unwrap();
        let tx = conn.transaction().unwrap();
        let ids = SequenceIdGenerator.next_ids(&tx, "c1", 3).unwrap();
        assert_eq!(ids, vec!["70000", "70002", "70003"]);
        let more = SequenceIdGenerator.next_ids(&tx, "c1", 1).unwrap();
        assert_eq!(more, vec!["70004"]);
    }

    #[test]
    fn test_cancel_handle() {
        let handle = CancelHandle::new();
        let shared = handle.clone();
        assert!(handle.check().is_ok());
        shared.cancel();
        assert!(matches!(handle.check(), Err(ImportError::Cancelled)));
        assert!(handle.token().is_cancelled());
    }

    #[test]
    fn test_cancel_handle_follows_parent_token() {
        let parent = CancellationToken::new();
        let handle = CancelHandle::child_of(&parent);
        let sibling = CancelHandle::from(parent.child_token());
        assert!(handle.check().is_ok());

        parent.cancel();
        assert!(handle.is_cancelled());
        assert!(matches!(sibling.check(), Err(ImportError::Cancelled)));

        // 子令牌取消不影响父令牌
        let other_parent = CancellationToken::new();
        let child = CancelHandle::child_of(&other_parent);
        child.cancel();
        assert!(!other_parent.is_cancelled());
    }
}
