// ==========================================
// 标本导入对账系统 - 冲突检测
// ==========================================
// 职责: 合并模式下比对存量与新导入的标本定义字段
//       可编辑库下统计引用存量样品管的导入行
// 规则: (存量行 ∪ 暂存行) 按 (GlobalUniqueId, 全部定义字段) 分组
//       同一 GlobalUniqueId 出现多于一组 → 冲突
// 红线: 收集全部冲突后一次性报告，不在首个冲突处中止
// ==========================================

use crate::domain::columns::{specimen_defining_columns, COL_GLOBAL_UNIQUE_ID};
use crate::domain::record::{Record, StagingRow};
use crate::domain::summary::SpecimenConflict;
use std::collections::{BTreeMap, BTreeSet, HashSet};

const NULL_TEXT: &str = "NULL";

fn defining_tuple(record: &Record, columns: &[&str]) -> Vec<String> {
    columns
        .iter()
        .map(|c| {
            record
                .get(c)
                .canonical_text()
                .unwrap_or_else(|| NULL_TEXT.to_string())
        })
        .collect()
}

// ==========================================
// ConflictDetector
// ==========================================
pub struct ConflictDetector;

impl ConflictDetector {
    /// 检测标本定义字段冲突
    ///
    /// # 参数
    /// - persisted: 批次内 GlobalUniqueId 对应的存量行（样品管 ⋈ 标本）
    /// - staged: 本次暂存行
    /// - declared: 本次导入声明的列（None 表示全部定义列参与比对）
    ///
    /// # 返回
    /// - 按 GlobalUniqueId 排序的全部冲突
    pub fn find_conflicts(
        persisted: &[Record],
        staged: &[StagingRow],
        declared: Option<&HashSet<String>>,
    ) -> Vec<SpecimenConflict> {
        // 未声明的列本次没有取值，不参与比对
        let columns: Vec<&str> = specimen_defining_columns()
            .map(|c| c.db_name)
            .filter(|name| declared.map_or(true, |d| d.contains(*name)))
            .collect();

        let mut groups: BTreeMap<String, BTreeSet<Vec<String>>> = BTreeMap::new();

        let all_records = persisted.iter().chain(staged.iter().map(|r| &r.record));
        for record in all_records {
            let guid = match record.get(COL_GLOBAL_UNIQUE_ID).canonical_text() {
                Some(g) => g,
                None => continue,
            };
            groups
                .entry(guid)
                .or_default()
                .insert(defining_tuple(record, &columns));
        }

        groups
            .into_iter()
            .filter(|(_, tuples)| tuples.len() > 1)
            .map(|(guid, tuples)| {
                let fields = columns
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, column)| {
                        let values: BTreeSet<&String> = tuples.iter().map(|t| &t[idx]).collect();
                        if values.len() > 1 {
                            Some((
                                column.to_string(),
                                values.into_iter().cloned().collect::<Vec<_>>(),
                            ))
                        } else {
                            None
                        }
                    })
                    .collect();
                let groups: Vec<Vec<(String, String)>> = tuples
                    .iter()
                    .map(|tuple| {
                        columns
                            .iter()
                            .zip(tuple)
                            .map(|(column, value)| (column.to_string(), value.clone()))
                            .collect()
                    })
                    .collect();
                SpecimenConflict {
                    global_unique_id: guid,
                    fields,
                    groups,
                }
            })
            .collect()
    }

    /// 统计引用存量样品管的暂存行数（可编辑库不允许）
    pub fn count_existing_references(staged: &[StagingRow], existing: &HashSet<String>) -> usize {
        staged
            .iter()
            .filter(|r| {
                r.get(COL_GLOBAL_UNIQUE_ID)
                    .canonical_text()
                    .map_or(false, |g| existing.contains(&g))
            })
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::columns::{COL_PTID, COL_VISIT_VALUE, COL_VOLUME};
    use crate::domain::types::FieldValue;

    fn record(guid: &str, ptid: &str, visit: f64) -> Record {
        Record::new()
            .with(COL_GLOBAL_UNIQUE_ID, FieldValue::Text(guid.to_string()))
            .with(COL_PTID, FieldValue::Text(ptid.to_string()))
            .with(COL_VISIT_VALUE, FieldValue::Float(visit))
    }

    #[test]
    fn test_no_conflict_when_values_agree() {
        let persisted = vec![record("V1", "101", 1.0)];
        let staged = vec![
            StagingRow::new(1, record("V1", "101", 1.0).with(COL_VOLUME, FieldValue::Float(9.0))),
            StagingRow::new(2, record("V2", "102", 1.0)),
        ];
        assert!(ConflictDetector::find_conflicts(&persisted, &staged, None).is_empty());
    }

    #[test]
    fn test_all_conflicts_collected() {
        let persisted = vec![record("V1", "101", 1.0), record("V2", "101", 1.0)];
        let staged = vec![
            StagingRow::new(1, record("V1", "999", 1.0)),
            StagingRow::new(2, record("V2", "101", 2.0)),
            StagingRow::new(3, record("V3", "101", 1.0)),
        ];
        let conflicts = ConflictDetector::find_conflicts(&persisted, &staged, None);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(conflicts[0].global_unique_id, "V1");
        assert_eq!(
            conflicts[0].fields,
            vec![(COL_PTID.to_string(), vec!["101".to_string(), "999".to_string()])]
        );
        assert_eq!(conflicts[1].global_unique_id, "V2");
        assert_eq!(conflicts[1].fields[0].0, COL_VISIT_VALUE);

        // 每组完整定义字段都列出
        assert_eq!(conflicts[0].groups.len(), 2);
        let ptids: Vec<&str> = conflicts[0]
            .groups
            .iter()
            .filter_map(|g| g.iter().find(|(c, _)| c == COL_PTID).map(|(_, v)| v.as_str()))
            .collect();
        assert_eq!(ptids, vec!["101", "999"]);
        assert!(conflicts[0].groups[0].iter().any(|(c, v)| c == COL_VISIT_VALUE && v == "1"));
    }

    #[test]
    fn test_undeclared_columns_ignored() {
        let persisted = vec![record("V1", "101", 1.0)];
        // 本次文件未声明 visit_value
        let staged = vec![StagingRow::new(
            1,
            Record::new()
                .with(COL_GLOBAL_UNIQUE_ID, FieldValue::Text("V1".to_string()))
                .with(COL_PTID, FieldValue::Text("101".to_string())),
        )];
        let declared: HashSet<String> = [COL_GLOBAL_UNIQUE_ID, COL_PTID]
            .iter()
            .map(|c| c.to_string())
            .collect();
        assert!(ConflictDetector::find_conflicts(&persisted, &staged, Some(&declared)).is_empty());
        assert_eq!(ConflictDetector::find_conflicts(&persisted, &staged, None).len(), 1);
    }

    #[test]
    fn test_count_existing_references() {
        let staged = vec![
            StagingRow::new(1, record("V1", "101", 1.0)),
            StagingRow::new(2, record("V1", "101", 1.0)),
            StagingRow::new(3, record("V9", "101", 1.0)),
        ];
        let existing: HashSet<String> = ["V1".to_string()].into_iter().collect();
        assert_eq!(ConflictDetector::count_existing_references(&staged, &existing), 2);
    }
}
