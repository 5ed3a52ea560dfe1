// ==========================================
// 标本导入对账系统 - 导入结果与冲突报告
// ==========================================
// 用途: 成功时的分表计数 / 失败时的冲突明细
// ==========================================

use crate::domain::types::ImportMode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::AddAssign;

// ==========================================
// SyncCounts - 单表同步计数
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub deleted: usize,
}

impl SyncCounts {
    /// 本次运行是否改动了该表
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

// 同一张表出现在多个文件中时累加
impl AddAssign for SyncCounts {
    fn add_assign(&mut self, other: Self) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.deleted += other.deleted;
    }
}

// ==========================================
// ImportSummary - 导入结果
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub run_id: String,
    pub container: String,
    pub mode: Option<ImportMode>,

    // ===== 查找表 =====
    pub locations: SyncCounts,
    pub additives: SyncCounts,
    pub derivatives: SyncCounts,
    pub primary_types: SyncCounts,

    // ===== 三层主表 =====
    pub staged_rows: usize,
    pub staging_attempts: usize,
    pub specimens: SyncCounts,
    pub vials: SyncCounts,
    pub events: SyncCounts,

    // ===== 派生计算 =====
    pub derived_vials_updated: usize,
    pub specimens_rollup_updated: usize,
    pub orphaned_request_vials: usize,
    pub created_visits: Vec<f64>,

    pub elapsed_ms: u64,
}

impl ImportSummary {
    /// 三层主表是否有任何行变动
    pub fn core_rows_changed(&self) -> usize {
        self.specimens.changed() + self.vials.changed() + self.events.changed()
    }
}

// ==========================================
// SpecimenConflict - 标本定义字段冲突
// ==========================================
// 同一 GlobalUniqueId 在存量与新导入间定义字段取值不一致
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecimenConflict {
    pub global_unique_id: String,
    /// (列名, 互相冲突的取值列表)
    pub fields: Vec<(String, Vec<String>)>,
    /// 各组完整定义字段 (列名, 取值)，存量与新导入各占一组或多组
    #[serde(default)]
    pub groups: Vec<Vec<(String, String)>>,
}

impl fmt::Display for SpecimenConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Conflicting specimens found for GlobalUniqueId '{}':",
            self.global_unique_id
        )?;
        for (column, values) in &self.fields {
            write!(f, "\n  {}={}", column, values.join(", "))?;
        }
        for (idx, group) in self.groups.iter().enumerate() {
            let tuple = group
                .iter()
                .map(|(column, value)| format!("{}={}", column, value))
                .collect::<Vec<_>>()
                .join("; ");
            write!(f, "\n    #{} {}", idx + 1, tuple)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_conflict_display() {
        let conflict = SpecimenConflict {
            global_unique_id: "V1".to_string(),
            fields: vec![("ptid".to_string(), vec!["101".to_string(), "102".to_string()])],
            groups: vec![
                vec![("ptid".to_string(), "101".to_string()), ("visit_value".to_string(), "1".to_string())],
                vec![("ptid".to_string(), "102".to_string()), ("visit_value".to_string(), "1".to_string())],
            ],
        };
        assert_eq!(
            conflict.to_string(),
            "Conflicting specimens found for GlobalUniqueId 'V1':\n  ptid=101, 102\n    #1 ptid=101; visit_value=1\n    #2 ptid=102; visit_value=1"
        );
    }

    #[test]
    fn test_changed_counts() {
        let counts = SyncCounts {
            inserted: 1,
            updated: 2,
            unchanged: 5,
            deleted: 0,
        };
        assert_eq!(counts.changed(), 3);
    }
}
