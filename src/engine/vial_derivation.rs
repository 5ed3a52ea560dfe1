// ==========================================
// 标本导入对账系统 - 样品管派生字段规则
// ==========================================
// 职责: 事件时间排序 / 处理地点 / 当前地点 / 是否在库 / 最新备注
//       + 事件 → 样品管 汇总规则求值
// 红线: 纯函数，不访问数据库
// ==========================================

use crate::domain::columns::{
    COL_AT_REPOSITORY, COL_COMMENTS, COL_CURRENT_LOCATION, COL_EXTERNAL_ID,
    COL_FIRST_PROCESSED_BY_INITIALS, COL_LAB_ID, COL_LAB_RECEIPT_DATE, COL_LATEST_COMMENTS,
    COL_OBSOLETE, COL_ORIGINATING_LOCATION_ID, COL_PROCESSED_BY_INITIALS,
    COL_PROCESSING_LOCATION, COL_SHIP_BATCH_NUMBER, COL_SHIP_DATE, COL_SHIP_FLAG,
    COL_STORAGE_DATE,
};
use crate::domain::record::{Record, StoredRow};
use crate::domain::types::FieldValue;
use crate::engine::rollup::{RollupError, RollupMap};
use chrono::NaiveDateTime;
use std::cmp::Ordering;
use std::collections::HashMap;

/// 地点 row_id → 是否为标本库
pub type RepositoryFlags = HashMap<i64, bool>;

// ==========================================
// 事件时间排序
// ==========================================
// 顺序: 作废事件在前 → 任一日期（接收 > 入库 > 发运 依次取第一个非空，NULL 在前）
//       → 同日期按 接收 < 入库 < 发运 → 事件外部 ID → row_id
fn event_date_key(event: &Record) -> (Option<NaiveDateTime>, u8) {
    let candidates = [
        (COL_LAB_RECEIPT_DATE, 1u8),
        (COL_STORAGE_DATE, 2u8),
        (COL_SHIP_DATE, 3u8),
    ];
    candidates
        .iter()
        .find_map(|(column, kind)| event.get(column).as_datetime().map(|dt| (Some(dt), *kind)))
        .unwrap_or((None, 0))
}

fn is_obsolete(event: &Record) -> bool {
    event.get(COL_OBSOLETE).as_bool().unwrap_or(false)
}

pub fn compare_events(a: &StoredRow, b: &StoredRow) -> Ordering {
    is_obsolete(&b.record)
        .cmp(&is_obsolete(&a.record))
        .then_with(|| event_date_key(&a.record).cmp(&event_date_key(&b.record)))
        .then_with(|| {
            let ea = a.record.get(COL_EXTERNAL_ID).as_i64();
            let eb = b.record.get(COL_EXTERNAL_ID).as_i64();
            ea.cmp(&eb)
        })
        .then_with(|| a.row_id.cmp(&b.row_id))
}

/// 按时间顺序排序事件
pub fn sort_events_chronologically(events: &mut [StoredRow]) {
    events.sort_by(compare_events);
}

// ==========================================
// 地点规则
// ==========================================

fn is_zero_or_null(value: &FieldValue) -> bool {
    value.as_i64().map_or(true, |v| v == 0)
}

/// 首个处理事件
///
/// # 规则
/// - 跳过无接收/入库/发运日期且实验室不等于来源地点的前导事件
/// - 最后一个事件不跳过
pub fn first_processing_event(events: &[StoredRow]) -> Option<&StoredRow> {
    if events.is_empty() {
        return None;
    }
    let mut idx = 0;
    while idx + 1 < events.len() {
        let event = &events[idx].record;
        let undated = event.get(COL_LAB_RECEIPT_DATE).is_null()
            && event.get(COL_STORAGE_DATE).is_null()
            && event.get(COL_SHIP_DATE).is_null();
        let at_origin = event
            .get(COL_LAB_ID)
            .same_as(event.get(COL_ORIGINATING_LOCATION_ID));
        if undated && !at_origin {
            idx += 1;
        } else {
            break;
        }
    }
    events.get(idx)
}

/// 当前地点: 末事件未发运时取其实验室
pub fn current_location_id(events: &[StoredRow]) -> Option<i64> {
    let last = &events.last()?.record;
    let shipped = !last.get(COL_SHIP_DATE).is_null()
        || !is_zero_or_null(last.get(COL_SHIP_BATCH_NUMBER))
        || !is_zero_or_null(last.get(COL_SHIP_FLAG));
    if shipped {
        None
    } else {
        last.get(COL_LAB_ID).as_i64()
    }
}

pub fn processing_location_id(events: &[StoredRow]) -> Option<i64> {
    first_processing_event(events).and_then(|e| e.record.get(COL_LAB_ID).as_i64())
}

pub fn first_processed_by_initials(events: &[StoredRow]) -> FieldValue {
    first_processing_event(events)
        .map(|e| e.record.get(COL_PROCESSED_BY_INITIALS).clone())
        .unwrap_or_default()
}

fn optional_integer(value: Option<i64>) -> FieldValue {
    value.map(FieldValue::Integer).unwrap_or_default()
}

/// 计算样品管全部派生字段（含事件 → 样品管 汇总）
///
/// # 参数
/// - events: 已按时间排序的事件
/// - repositories: 地点标本库标记
/// - rollups: 事件字段 → 汇总绑定
pub fn derive_vial_fields(
    events: &[StoredRow],
    repositories: &RepositoryFlags,
    rollups: &RollupMap,
) -> Result<Record, RollupError> {
    let mut derived = Record::new();

    let current = current_location_id(events);
    let at_repository = current
        .and_then(|id| repositories.get(&id).copied())
        .unwrap_or(false);

    derived.set(COL_CURRENT_LOCATION, optional_integer(current));
    derived.set(COL_PROCESSING_LOCATION, optional_integer(processing_location_id(events)));
    derived.set(COL_FIRST_PROCESSED_BY_INITIALS, first_processed_by_initials(events));
    derived.set(COL_AT_REPOSITORY, FieldValue::Boolean(at_repository));
    derived.set(
        COL_LATEST_COMMENTS,
        events
            .last()
            .map(|e| e.record.get(COL_COMMENTS).clone())
            .unwrap_or_default(),
    );

    let records: Vec<&Record> = events.iter().map(|e| &e.record).collect();
    for instances in rollups.values() {
        for instance in instances {
            derived.set(&instance.to.name, instance.evaluate(&records)?);
        }
    }

    Ok(derived)
}
