// ==========================================
// 标本导入对账系统 - 记录结构
// ==========================================
// 用途: 暂存行 / 标本行 / 样品管行 / 事件行 / 查找表行 的统一载体
// 说明: 列集合由列目录决定，按存储列名存取
// ==========================================

use crate::domain::types::FieldValue;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

static NULL_VALUE: FieldValue = FieldValue::Null;

// ==========================================
// Record - 列名 → 字段值
// ==========================================
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Record {
    values: BTreeMap<String, FieldValue>,
}

impl Record {
    pub fn new() -> Self {
        Self::default()
    }

    /// 读取字段（缺失视为 NULL）
    pub fn get(&self, column: &str) -> &FieldValue {
        self.values.get(column).unwrap_or(&NULL_VALUE)
    }

    pub fn set(&mut self, column: &str, value: FieldValue) {
        self.values.insert(column.to_string(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.values.contains_key(column)
    }

    pub fn text(&self, column: &str) -> Option<&str> {
        self.get(column).as_text()
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(|k| k.as_str())
    }

    pub fn with(mut self, column: &str, value: FieldValue) -> Self {
        self.set(column, value);
        self
    }
}

// ==========================================
// StagingRow - 暂存行
// ==========================================
// 生命周期: 仅在一次导入运行内
#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    /// 源文件行号（从 1 开始，含表名行与表头行）
    pub row_number: usize,
    pub record: Record,
}

impl StagingRow {
    pub fn new(row_number: usize, record: Record) -> Self {
        Self { row_number, record }
    }

    pub fn get(&self, column: &str) -> &FieldValue {
        self.record.get(column)
    }
}

// ==========================================
// StoredRow - 已落库行（带 row_id）
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct StoredRow {
    pub row_id: i64,
    pub record: Record,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_column_is_null() {
        let record = Record::new().with("ptid", FieldValue::Text("101".to_string()));
        assert_eq!(record.text("ptid"), Some("101"));
        assert!(record.get("visit_value").is_null());
        assert!(!record.contains("visit_value"));
    }
}
