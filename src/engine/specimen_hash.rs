// ==========================================
// 标本导入对账系统 - 标本哈希计算
// ==========================================
// 职责: 由标本定义字段计算确定性 SpecimenHash
// 红线: 暂存行与已落库标本行必须走同一函数
// 红线: 未声明的定义列仍保留位置占位符
// ==========================================

use crate::domain::columns::{specimen_defining_columns, SpecimenColumn};
use crate::domain::record::Record;
use sha2::{Digest, Sha256};
use std::collections::HashSet;

/// 字段分隔符
const FIELD_SEPARATOR: char = '~';

// ==========================================
// HashComputer - 标本哈希计算器
// ==========================================
#[derive(Debug, Clone)]
pub struct HashComputer {
    salt: String,
    columns: Vec<&'static SpecimenColumn>,
}

impl HashComputer {
    /// 创建容器级哈希计算器
    ///
    /// # 参数
    /// - container: 容器（研究）标识，作为盐值前缀
    pub fn new(container: &str) -> Self {
        Self {
            salt: format!("Fld-{}", container),
            columns: specimen_defining_columns().collect(),
        }
    }

    /// 参与哈希的定义列（固定顺序）
    pub fn columns(&self) -> &[&'static SpecimenColumn] {
        &self.columns
    }

    /// 拼接哈希原文
    ///
    /// # 参数
    /// - record: 暂存行或已落库标本行
    /// - declared: 本次导入声明的列（None 表示全部列均已声明）
    pub fn hash_source(&self, record: &Record, declared: Option<&HashSet<String>>) -> String {
        let mut source = String::with_capacity(self.salt.len() + self.columns.len() * 8);
        source.push_str(&self.salt);

        for column in &self.columns {
            source.push(FIELD_SEPARATOR);
            let is_declared = declared.map_or(true, |d| d.contains(column.db_name));
            if !is_declared {
                // 未声明列只保留占位
                continue;
            }
            if let Some(text) = record.get(column.db_name).canonical_text() {
                source.push_str(&text);
            }
        }

        source
    }

    /// 计算 SpecimenHash（SHA-256 小写十六进制）
    pub fn compute(&self, record: &Record, declared: Option<&HashSet<String>>) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.hash_source(record, declared).as_bytes());
        hex::encode(hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::columns::{COL_PTID, COL_VISIT_VALUE, COL_VOLUME};
    use crate::domain::types::FieldValue;

    fn sample() -> Record {
        Record::new()
            .with(COL_PTID, FieldValue::Text("101".to_string()))
            .with(COL_VISIT_VALUE, FieldValue::Float(1.0))
            .with(COL_VOLUME, FieldValue::Float(1.0))
    }

    #[test]
    fn test_hash_deterministic() {
        let computer = HashComputer::new("study-a");
        let h1 = computer.compute(&sample(), None);
        let h2 = computer.compute(&sample(), None);
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_defining_field_changes_hash() {
        let computer = HashComputer::new("study-a");
        let changed = sample().with(COL_PTID, FieldValue::Text("102".to_string()));
        assert_ne!(computer.compute(&sample(), None), computer.compute(&changed, None));
    }

    #[test]
    fn test_non_defining_field_keeps_hash() {
        let computer = HashComputer::new("study-a");
        let changed = sample().with(COL_VOLUME, FieldValue::Float(2.0));
        assert_eq!(computer.compute(&sample(), None), computer.compute(&changed, None));
    }

    #[test]
    fn test_container_salt() {
        let a = HashComputer::new("study-a").compute(&sample(), None);
        let b = HashComputer::new("study-b").compute(&sample(), None);
        assert_ne!(a, b);
    }

    #[test]
    fn test_undeclared_column_keeps_position() {
        let computer = HashComputer::new("c");
        let declared: HashSet<String> = [COL_PTID.to_string()].into_iter().collect();
        let source = computer.hash_source(&sample(), Some(&declared));
        // 每个定义列一个分隔符
        assert_eq!(
            source.matches(FIELD_SEPARATOR).count(),
            computer.columns().len()
        );
        assert!(source.contains("101"));
        // visit_value 未声明，不计入
        let full = computer.hash_source(&sample(), None);
        assert_ne!(source, full);
    }
}
