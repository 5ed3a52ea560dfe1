// ==========================================
// 标本导入对账系统 - 分组对账投影
// ==========================================
// 职责: 暂存行 → 标本候选行（按 SpecimenHash 分组）
//       暂存行 → 样品管候选行（按 GlobalUniqueId 分组）
// 规则: 配置了聚合函数 → 取聚合值
//       否则 COUNT(DISTINCT 非空值) = 1 → 取该值
//       否则 → NULL（冲突不择一）
// ==========================================

use crate::domain::columns::{
    specimen_defining_columns, specimen_target_columns, vial_target_columns, COL_AVAILABLE,
    COL_DRAW_DATE, COL_DRAW_TIME, COL_DRAW_TIMESTAMP, COL_GLOBAL_UNIQUE_ID, COL_LSID,
    COL_PARTICIPANT_SEQUENCE_NUM, COL_SPECIMEN_HASH,
};
use crate::domain::record::{Record, StagingRow};
use crate::domain::types::{AggregateFn, FieldValue};
use std::collections::{BTreeMap, HashSet};

// ==========================================
// 投影结果
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct SpecimenCandidate {
    pub specimen_hash: String,
    pub record: Record,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VialCandidate {
    pub global_unique_id: String,
    pub specimen_hash: String,
    pub record: Record,
}

/// 单字段对账
///
/// # 参数
/// - values: 同组内该字段的全部取值（含 NULL）
/// - aggregate: 列上配置的聚合函数
pub fn reconcile_values<'a>(
    values: impl Iterator<Item = &'a FieldValue>,
    aggregate: Option<AggregateFn>,
) -> FieldValue {
    let non_null: Vec<&FieldValue> = values.filter(|v| !v.is_null()).collect();

    match aggregate {
        Some(AggregateFn::Sum) => {
            let any_float = non_null.iter().any(|v| matches!(v, FieldValue::Float(_)));
            if non_null.is_empty() {
                FieldValue::Null
            } else if any_float {
                FieldValue::Float(non_null.iter().filter_map(|v| v.as_f64()).sum())
            } else {
                FieldValue::Integer(non_null.iter().filter_map(|v| v.as_i64()).sum())
            }
        }
        Some(agg @ (AggregateFn::Max | AggregateFn::Min)) => {
            let pick_max = agg == AggregateFn::Max;
            non_null
                .into_iter()
                .reduce(|best, v| {
                    let replace = match (v.as_f64(), best.as_f64()) {
                        (Some(a), Some(b)) => (pick_max && a > b) || (!pick_max && a < b),
                        _ => {
                            let (a, b) = (v.canonical_text(), best.canonical_text());
                            (pick_max && a > b) || (!pick_max && a < b)
                        }
                    };
                    if replace {
                        v
                    } else {
                        best
                    }
                })
                .cloned()
                .unwrap_or_default()
        }
        None => {
            let distinct: HashSet<String> = non_null.iter().filter_map(|v| v.canonical_text()).collect();
            if distinct.len() == 1 {
                // MIN(col) 口径: 取规范文本最小者（同值时即该值）
                non_null
                    .into_iter()
                    .min_by_key(|v| v.canonical_text())
                    .cloned()
                    .unwrap_or_default()
            } else {
                FieldValue::Null
            }
        }
    }
}

fn reconcile_column(rows: &[&StagingRow], column: &str, aggregate: Option<AggregateFn>) -> FieldValue {
    reconcile_values(rows.iter().map(|r| r.get(column)), aggregate)
}

/// 采样时间拆分为日期 / 时间
fn split_draw_timestamp(record: &mut Record, draw: &FieldValue) {
    match draw.as_datetime() {
        Some(dt) => {
            record.set(COL_DRAW_DATE, FieldValue::Date(dt.date()));
            record.set(COL_DRAW_TIME, FieldValue::Time(dt.time()));
        }
        None => {
            record.set(COL_DRAW_DATE, FieldValue::Null);
            record.set(COL_DRAW_TIME, FieldValue::Null);
        }
    }
}

fn group_by<'a>(rows: &'a [StagingRow], column: &str) -> BTreeMap<String, Vec<&'a StagingRow>> {
    let mut groups: BTreeMap<String, Vec<&StagingRow>> = BTreeMap::new();
    for row in rows {
        if let Some(key) = row.get(column).canonical_text() {
            groups.entry(key).or_default().push(row);
        }
    }
    groups
}

/// 每个样品管的定义字段对账值（用于计算哈希）
///
/// # 返回
/// - GlobalUniqueId → 定义字段记录
pub fn defining_values_by_vial(rows: &[StagingRow]) -> BTreeMap<String, Record> {
    group_by(rows, COL_GLOBAL_UNIQUE_ID)
        .into_iter()
        .map(|(guid, group)| {
            let mut record = Record::new();
            for column in specimen_defining_columns() {
                record.set(column.db_name, reconcile_column(&group, column.db_name, None));
            }
            (guid, record)
        })
        .collect()
}

/// 标本投影: GROUP BY SpecimenHash
pub fn project_specimens(rows: &[StagingRow]) -> Vec<SpecimenCandidate> {
    group_by(rows, COL_SPECIMEN_HASH)
        .into_iter()
        .map(|(hash, group)| {
            let mut record = Record::new();
            record.set(COL_SPECIMEN_HASH, FieldValue::Text(hash.clone()));
            for column in specimen_target_columns() {
                let value = reconcile_column(&group, column.db_name, column.aggregate);
                record.set(column.db_name, value.coerce_to(column.field_type));
            }
            let draw = record.get(COL_DRAW_TIMESTAMP).clone();
            split_draw_timestamp(&mut record, &draw);
            record.set(
                COL_PARTICIPANT_SEQUENCE_NUM,
                reconcile_column(&group, COL_PARTICIPANT_SEQUENCE_NUM, None),
            );
            SpecimenCandidate {
                specimen_hash: hash,
                record,
            }
        })
        .collect()
}

/// 样品管投影: GROUP BY GlobalUniqueId（携带 LSID / SpecimenHash）
pub fn project_vials(rows: &[StagingRow]) -> Vec<VialCandidate> {
    group_by(rows, COL_GLOBAL_UNIQUE_ID)
        .into_iter()
        .map(|(guid, group)| {
            let mut record = Record::new();
            record.set(COL_GLOBAL_UNIQUE_ID, FieldValue::Text(guid.clone()));
            record.set(COL_LSID, reconcile_column(&group, COL_LSID, None));
            let hash = reconcile_column(&group, COL_SPECIMEN_HASH, None);
            record.set(COL_SPECIMEN_HASH, hash.clone());
            for column in vial_target_columns().filter(|c| c.db_name != COL_GLOBAL_UNIQUE_ID) {
                let value = reconcile_column(&group, column.db_name, column.aggregate);
                record.set(column.db_name, value.coerce_to(column.field_type));
            }
            record.set(COL_AVAILABLE, FieldValue::Boolean(true));
            VialCandidate {
                global_unique_id: guid,
                specimen_hash: hash.canonical_text().unwrap_or_default(),
                record,
            }
        })
        .collect()
}
