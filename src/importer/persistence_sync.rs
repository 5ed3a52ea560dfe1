// ==========================================
// 标本导入对账系统 - 落库同步
// ==========================================
// 职责: 查找表同步 + 标本 / 样品管 / 事件 三层同步 + 派生字段重算
// 策略: REPLACE 先删后插；MERGE 按各表身份键 upsert
// 身份键: 标本 = (容器, SpecimenHash); 样品管 = GlobalUniqueId;
//         事件 = (样品管, 实验室, 入库日期, 发运日期, 接收日期)
// 红线: 标识列 / LSID 不随合并更新
// 红线: 只写入真正发生变化的列
// ==========================================

use crate::domain::columns::{
    event_field_defs, to_field_defs, vial_field_defs, LookupKind, COL_AVAILABLE, COL_EXTERNAL_ID,
    COL_FIRST_PROCESSED_BY_INITIALS, COL_GLOBAL_UNIQUE_ID, COL_LAB_ID, COL_LAB_RECEIPT_DATE,
    COL_LSID, COL_PROCESSING_LOCATION, COL_SHIP_DATE, COL_SPECIMEN_HASH, COL_STORAGE_DATE,
    COL_VIAL_COUNT, SPECIMEN_ROLLUP_TARGETS, VIAL_DERIVED_COLUMNS, VIAL_ROLLUP_TARGETS,
};
use crate::domain::record::{Record, StagingRow, StoredRow};
use crate::domain::summary::SyncCounts;
use crate::domain::types::{FieldValue, ImportMode};
use crate::engine::rollup::{RollupDirection, RollupRegistry};
use crate::engine::set_reconciler::{project_specimens, project_vials, reconcile_values};
use crate::engine::vial_derivation::{derive_vial_fields, sort_events_chronologically};
use crate::importer::error::ImportResult;
use crate::importer::field_mapper::MappedLookup;
use crate::importer::specimen_importer_trait::RequestabilityEngine;
use crate::repository::lookup_repo::LookupRepository;
use crate::repository::request_repo::RequestRepository;
use crate::repository::row_store::{changed_columns, insert_row_tx, update_row_tx};
use crate::repository::specimen_repo_impl::SpecimenRepositoryImpl;
use crate::repository::table_layout::{TableLayout, COL_ENTITY_ID, COL_SPECIMEN_ID, COL_VIAL_ID};
use rusqlite::Transaction;
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

/// 派生字段重算批大小
pub const DERIVED_BATCH_SIZE: usize = 1_000;

/// 派生字段重算进度日志间隔
const PROGRESS_LOG_INTERVAL: usize = 10_000;

/// 事件身份列（除样品管外）
const EVENT_KEY_COLUMNS: &[&str] = &[COL_LAB_ID, COL_STORAGE_DATE, COL_SHIP_DATE, COL_LAB_RECEIPT_DATE];

// ==========================================
// 同步结果
// ==========================================
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreCounts {
    pub specimens: SyncCounts,
    pub vials: SyncCounts,
    pub events: SyncCounts,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DerivedCounts {
    pub vials_updated: usize,
    pub specimens_updated: usize,
    pub orphaned_request_vials: usize,
    pub availability_changed: usize,
}

fn event_key(vial_id: i64, record: &Record) -> Vec<String> {
    let mut key = vec![vial_id.to_string()];
    key.extend(
        EVENT_KEY_COLUMNS
            .iter()
            .map(|c| record.get(c).canonical_text().unwrap_or_default()),
    );
    key
}

// ==========================================
// PersistenceSync
// ==========================================
pub struct PersistenceSync<'a> {
    container: &'a str,
    registry: &'a RollupRegistry,
}

impl<'a> PersistenceSync<'a> {
    pub fn new(container: &'a str, registry: &'a RollupRegistry) -> Self {
        Self { container, registry }
    }

    // ==========================================
    // 查找表
    // ==========================================

    /// 同步一张查找表文件
    ///
    /// # 说明
    /// - 实验室表总是 MERGE；其余查找表跟随运行模式
    /// - MERGE 按外部 ID 对齐，非键列有变化才更新
    pub fn sync_lookup(&self, tx: &Transaction, lookup: &MappedLookup, mode: ImportMode) -> ImportResult<SyncCounts> {
        let mode = if lookup.kind == LookupKind::Location {
            ImportMode::Merge
        } else {
            mode
        };
        let layout = TableLayout::lookup(lookup.kind);
        let mut counts = SyncCounts::default();

        if mode == ImportMode::Replace {
            counts.deleted = LookupRepository::delete_all_tx(tx, self.container, lookup.kind)?;
        }

        let mut existing: HashMap<i64, StoredRow> = LookupRepository::load_tx(tx, self.container, lookup.kind)?
            .into_iter()
            .filter_map(|row| row.record.get(COL_EXTERNAL_ID).as_i64().map(|id| (id, row)))
            .collect();

        for row in &lookup.rows {
            let external_id = match row.get(COL_EXTERNAL_ID).as_i64() {
                Some(id) => id,
                None => continue,
            };
            match existing.get_mut(&external_id) {
                Some(stored) => {
                    let columns = changed_columns(&layout, &stored.record, &row.record, &[COL_EXTERNAL_ID, COL_ENTITY_ID]);
                    if columns.is_empty() {
                        counts.unchanged += 1;
                    } else {
                        LookupRepository::update_tx(tx, lookup.kind, stored.row_id, &row.record, &columns)?;
                        for column in &columns {
                            stored.record.set(column, row.get(column).clone());
                        }
                        counts.updated += 1;
                    }
                }
                None => {
                    let row_id = LookupRepository::insert_tx(tx, self.container, lookup.kind, &row.record)?;
                    existing.insert(
                        external_id,
                        StoredRow {
                            row_id,
                            record: row.record.clone(),
                        },
                    );
                    counts.inserted += 1;
                }
            }
        }

        info!(
            container = %self.container,
            table = %lookup.kind,
            source = %lookup.source,
            inserted = counts.inserted,
            updated = counts.updated,
            unchanged = counts.unchanged,
            deleted = counts.deleted,
            "查找表同步完成"
        );
        Ok(counts)
    }

    // ==========================================
    // 三层主表
    // ==========================================

    /// 同步 标本 → 样品管 → 事件
    pub fn sync_core(&self, tx: &Transaction, rows: &[StagingRow], mode: ImportMode) -> ImportResult<CoreCounts> {
        let mut counts = CoreCounts::default();

        if mode == ImportMode::Replace {
            let (events, vials, specimens) = SpecimenRepositoryImpl::delete_container_tx(tx, self.container)?;
            counts.events.deleted = events;
            counts.vials.deleted = vials;
            counts.specimens.deleted = specimens;
            debug!(container = %self.container, events, vials, specimens, "已清空容器三层数据");
        }

        // === 步骤 1: 标本 ===
        let specimen_input = match mode {
            ImportMode::Replace => rows.to_vec(),
            ImportMode::Merge => self.with_sibling_events(tx, rows)?,
        };
        let specimen_ids = self.sync_specimens(tx, &specimen_input, &mut counts.specimens)?;

        // === 步骤 2: 样品管 ===
        let vial_ids = self.sync_vials(tx, rows, &specimen_ids, &mut counts.vials)?;

        // === 步骤 3: 事件 ===
        self.sync_events(tx, rows, &vial_ids, mode, &mut counts.events)?;

        // === 步骤 4: 清理无样品管的标本 ===
        if mode == ImportMode::Merge {
            counts.specimens.deleted += SpecimenRepositoryImpl::delete_specimens_without_vials_tx(tx, self.container)?;
        }

        info!(
            container = %self.container,
            mode = %mode,
            specimens_inserted = counts.specimens.inserted,
            specimens_updated = counts.specimens.updated,
            vials_inserted = counts.vials.inserted,
            vials_updated = counts.vials.updated,
            events_inserted = counts.events.inserted,
            events_updated = counts.events.updated,
            "三层主表同步完成"
        );
        Ok(counts)
    }

    /// 合并模式的标本投影输入: 暂存行 + 同标本下未在本批次出现的样品管的存量事件
    ///
    /// 标本级字段按整组样品管对账，而不只按本批次行
    fn with_sibling_events(&self, tx: &Transaction, rows: &[StagingRow]) -> ImportResult<Vec<StagingRow>> {
        let staged_hashes: HashSet<&str> = rows.iter().filter_map(|r| r.record.text(COL_SPECIMEN_HASH)).collect();
        let staged_guids: HashSet<&str> = rows.iter().filter_map(|r| r.record.text(COL_GLOBAL_UNIQUE_ID)).collect();

        let siblings: HashMap<i64, StoredRow> = SpecimenRepositoryImpl::load_vials_tx(tx, self.container)?
            .into_iter()
            .filter(|v| {
                v.record.text(COL_SPECIMEN_HASH).map_or(false, |h| staged_hashes.contains(h))
                    && v.record.text(COL_GLOBAL_UNIQUE_ID).map_or(false, |g| !staged_guids.contains(g))
            })
            .map(|v| (v.row_id, v))
            .collect();

        let mut input = rows.to_vec();
        if siblings.is_empty() {
            return Ok(input);
        }

        let vial_ids: Vec<i64> = siblings.keys().copied().collect();
        for event in SpecimenRepositoryImpl::load_events_for_vials_tx(tx, &vial_ids)? {
            let vial = match event.record.get(COL_VIAL_ID).as_i64().and_then(|id| siblings.get(&id)) {
                Some(v) => v,
                None => continue,
            };
            let record = event
                .record
                .with(COL_SPECIMEN_HASH, vial.record.get(COL_SPECIMEN_HASH).clone())
                .with(COL_GLOBAL_UNIQUE_ID, vial.record.get(COL_GLOBAL_UNIQUE_ID).clone());
            input.push(StagingRow::new(0, record));
        }
        debug!(
            container = %self.container,
            sibling_vials = siblings.len(),
            rows = input.len(),
            "标本投影纳入同组存量样品管"
        );
        Ok(input)
    }

    /// # 返回
    /// - SpecimenHash → 标本 row_id
    fn sync_specimens(
        &self,
        tx: &Transaction,
        rows: &[StagingRow],
        counts: &mut SyncCounts,
    ) -> ImportResult<HashMap<String, i64>> {
        let layout = TableLayout::specimen();
        let existing: HashMap<String, StoredRow> = SpecimenRepositoryImpl::load_specimens_tx(tx, self.container)?
            .into_iter()
            .filter_map(|row| row.record.text(COL_SPECIMEN_HASH).map(str::to_string).map(|h| (h, row)))
            .collect();

        let mut ids = HashMap::new();
        for candidate in project_specimens(rows) {
            let row_id = match existing.get(&candidate.specimen_hash) {
                Some(stored) => {
                    let columns = changed_columns(&layout, &stored.record, &candidate.record, &[COL_SPECIMEN_HASH]);
                    if columns.is_empty() {
                        counts.unchanged += 1;
                    } else {
                        update_row_tx(tx, &layout, stored.row_id, &candidate.record, &columns)?;
                        counts.updated += 1;
                    }
                    stored.row_id
                }
                None => {
                    counts.inserted += 1;
                    insert_row_tx(tx, &layout, self.container, &candidate.record)?
                }
            };
            ids.insert(candidate.specimen_hash, row_id);
        }
        Ok(ids)
    }

    /// # 返回
    /// - GlobalUniqueId → 样品管 row_id
    fn sync_vials(
        &self,
        tx: &Transaction,
        rows: &[StagingRow],
        specimen_ids: &HashMap<String, i64>,
        counts: &mut SyncCounts,
    ) -> ImportResult<HashMap<String, i64>> {
        let layout = TableLayout::vial();
        let existing: HashMap<String, StoredRow> = SpecimenRepositoryImpl::load_vials_tx(tx, self.container)?
            .into_iter()
            .filter_map(|row| row.record.text(COL_GLOBAL_UNIQUE_ID).map(str::to_string).map(|g| (g, row)))
            .collect();

        let mut ids = HashMap::new();
        for candidate in project_vials(rows) {
            let specimen_id = specimen_ids
                .get(&candidate.specimen_hash)
                .copied()
                .map(FieldValue::Integer)
                .unwrap_or_default();
            let record = candidate.record.with(COL_SPECIMEN_ID, specimen_id);

            let row_id = match existing.get(&candidate.global_unique_id) {
                Some(stored) => {
                    // available 由可请求规则维护，合并时不覆盖
                    let columns = changed_columns(
                        &layout,
                        &stored.record,
                        &record,
                        &[COL_GLOBAL_UNIQUE_ID, COL_LSID, COL_AVAILABLE],
                    );
                    if columns.is_empty() {
                        counts.unchanged += 1;
                    } else {
                        update_row_tx(tx, &layout, stored.row_id, &record, &columns)?;
                        counts.updated += 1;
                    }
                    stored.row_id
                }
                None => {
                    counts.inserted += 1;
                    insert_row_tx(tx, &layout, self.container, &record)?
                }
            };
            ids.insert(candidate.global_unique_id, row_id);
        }
        Ok(ids)
    }

    fn sync_events(
        &self,
        tx: &Transaction,
        rows: &[StagingRow],
        vial_ids: &HashMap<String, i64>,
        mode: ImportMode,
        counts: &mut SyncCounts,
    ) -> ImportResult<()> {
        let layout = TableLayout::event();

        let mut existing: HashMap<Vec<String>, StoredRow> = HashMap::new();
        if mode == ImportMode::Merge {
            let ids: Vec<i64> = vial_ids.values().copied().collect();
            for event in SpecimenRepositoryImpl::load_events_for_vials_tx(tx, &ids)? {
                if let Some(vial_id) = event.record.get(COL_VIAL_ID).as_i64() {
                    existing.entry(event_key(vial_id, &event.record)).or_insert(event);
                }
            }
        }

        for row in rows {
            let vial_id = match row.record.text(COL_GLOBAL_UNIQUE_ID).and_then(|g| vial_ids.get(g)) {
                Some(id) => *id,
                None => continue,
            };
            let record = row.record.clone().with(COL_VIAL_ID, FieldValue::Integer(vial_id));

            if mode == ImportMode::Replace {
                insert_row_tx(tx, &layout, self.container, &record)?;
                counts.inserted += 1;
                continue;
            }

            let key = event_key(vial_id, &record);
            match existing.get_mut(&key) {
                Some(stored) => {
                    let mut skip = vec![COL_VIAL_ID];
                    skip.extend_from_slice(EVENT_KEY_COLUMNS);
                    let columns = changed_columns(&layout, &stored.record, &record, &skip);
                    if columns.is_empty() {
                        counts.unchanged += 1;
                    } else {
                        update_row_tx(tx, &layout, stored.row_id, &record, &columns)?;
                        for column in &columns {
                            stored.record.set(column, record.get(column).clone());
                        }
                        counts.updated += 1;
                    }
                }
                None => {
                    let row_id = insert_row_tx(tx, &layout, self.container, &record)?;
                    existing.insert(key, StoredRow { row_id, record });
                    counts.inserted += 1;
                }
            }
        }
        Ok(())
    }

    // ==========================================
    // 派生字段
    // ==========================================

    /// 派生字段重算
    ///
    /// # 顺序
    /// 1. 请求明细孤儿标记
    /// 2. locked_in_request
    /// 3. 样品管派生列 + 事件汇总（分批）
    /// 4. 标本处理地点 / 首个处理人
    /// 5. 可请求规则
    /// 6. 样品管数 + 样品管 → 标本 汇总
    pub fn refresh_derived(
        &self,
        tx: &Transaction,
        requestability: &dyn RequestabilityEngine,
    ) -> ImportResult<DerivedCounts> {
        let mut counts = DerivedCounts::default();

        // === 步骤 1: 孤儿标记 ===
        let (marked, unmarked) = RequestRepository::mark_orphans_tx(tx, self.container)?;
        counts.orphaned_request_vials = RequestRepository::count_orphans_tx(tx, self.container)?;
        if marked + unmarked > 0 {
            info!(container = %self.container, marked, unmarked, "请求明细孤儿状态已更新");
        }

        // === 步骤 2: 请求锁定 ===
        let locked = RequestRepository::refresh_locked_in_request_tx(tx, self.container)?;
        debug!(container = %self.container, changed = locked, "locked_in_request 已刷新");

        // === 步骤 3: 样品管派生列 ===
        counts.vials_updated = self.refresh_vial_fields(tx)?;

        // === 步骤 4: 标本处理信息 ===
        let mut touched: HashSet<i64> = self.refresh_specimen_processing(tx)?;

        // === 步骤 5: 可请求规则 ===
        counts.availability_changed = requestability.apply(tx, self.container)?;

        // === 步骤 6: 标本汇总 ===
        touched.extend(self.refresh_specimen_rollups(tx)?);
        counts.specimens_updated = touched.len();

        info!(
            container = %self.container,
            vials_updated = counts.vials_updated,
            specimens_updated = counts.specimens_updated,
            availability_changed = counts.availability_changed,
            orphaned = counts.orphaned_request_vials,
            "派生字段重算完成"
        );
        Ok(counts)
    }

    /// 按 row_id 分批，每批一次性取事件（按 vial_id 排序）双指针对齐
    fn refresh_vial_fields(&self, tx: &Transaction) -> ImportResult<usize> {
        let layout = TableLayout::vial();
        let repositories = LookupRepository::repository_flags_tx(tx, self.container)?;
        let rollups = self.registry.rollups(
            RollupDirection::EventToVial,
            &event_field_defs(),
            &to_field_defs(VIAL_ROLLUP_TARGETS),
        );

        let mut updated = 0;
        let mut processed = 0;
        let mut after_row_id = 0;
        loop {
            let vials = SpecimenRepositoryImpl::vial_batch_tx(tx, self.container, after_row_id, DERIVED_BATCH_SIZE)?;
            let (first, last) = match (vials.first(), vials.last()) {
                (Some(f), Some(l)) => (f.row_id, l.row_id),
                _ => break,
            };
            let events = SpecimenRepositoryImpl::events_for_vial_range_tx(tx, self.container, first, last)?;

            let mut cursor = 0;
            for vial in &vials {
                while cursor < events.len() && events[cursor].record.get(COL_VIAL_ID).as_i64() < Some(vial.row_id) {
                    cursor += 1;
                }
                let start = cursor;
                while cursor < events.len() && events[cursor].record.get(COL_VIAL_ID).as_i64() == Some(vial.row_id) {
                    cursor += 1;
                }
                let mut vial_events = events[start..cursor].to_vec();
                sort_events_chronologically(&mut vial_events);

                let derived = derive_vial_fields(&vial_events, &repositories, &rollups)?;
                let columns = changed_columns(&layout, &vial.record, &derived, &[]);
                if !columns.is_empty() {
                    update_row_tx(tx, &layout, vial.row_id, &derived, &columns)?;
                    updated += 1;
                }
            }

            processed += vials.len();
            if processed % PROGRESS_LOG_INTERVAL < vials.len() {
                info!(container = %self.container, processed, updated, "样品管派生字段重算进度");
            }
            after_row_id = last;
        }

        debug!(
            container = %self.container,
            derived_columns = VIAL_DERIVED_COLUMNS.len(),
            rollup_columns = VIAL_ROLLUP_TARGETS.len(),
            processed,
            updated,
            "样品管派生字段重算完成"
        );
        Ok(updated)
    }

    /// 样品管 row 按所属标本分组
    fn vials_by_specimen(&self, tx: &Transaction) -> ImportResult<BTreeMap<i64, Vec<Record>>> {
        let mut groups: BTreeMap<i64, Vec<Record>> = BTreeMap::new();
        for vial in SpecimenRepositoryImpl::load_vials_tx(tx, self.container)? {
            if let Some(specimen_id) = vial.record.get(COL_SPECIMEN_ID).as_i64() {
                groups.entry(specimen_id).or_default().push(vial.record);
            }
        }
        Ok(groups)
    }

    /// 写回标本变化列
    ///
    /// # 返回
    /// - 发生更新的标本 row_id
    fn update_specimens(
        &self,
        tx: &Transaction,
        candidates: impl Iterator<Item = (i64, Record)>,
    ) -> ImportResult<HashSet<i64>> {
        let layout = TableLayout::specimen();
        let stored: HashMap<i64, Record> = SpecimenRepositoryImpl::load_specimens_tx(tx, self.container)?
            .into_iter()
            .map(|row| (row.row_id, row.record))
            .collect();

        let mut touched = HashSet::new();
        for (row_id, candidate) in candidates {
            let current = match stored.get(&row_id) {
                Some(r) => r,
                None => continue,
            };
            let columns = changed_columns(&layout, current, &candidate, &[]);
            if !columns.is_empty() {
                update_row_tx(tx, &layout, row_id, &candidate, &columns)?;
                touched.insert(row_id);
            }
        }
        Ok(touched)
    }

    /// 标本的处理地点 / 首个处理人: 所属样品管取值唯一时才写入
    fn refresh_specimen_processing(&self, tx: &Transaction) -> ImportResult<HashSet<i64>> {
        let groups = self.vials_by_specimen(tx)?;
        let candidates = groups.into_iter().map(|(specimen_id, vials)| {
            let mut record = Record::new();
            for column in [COL_PROCESSING_LOCATION, COL_FIRST_PROCESSED_BY_INITIALS] {
                record.set(column, reconcile_values(vials.iter().map(|v| v.get(column)), None));
            }
            (specimen_id, record)
        });
        self.update_specimens(tx, candidates)
    }

    /// 样品管数 + 样品管 → 标本 汇总
    fn refresh_specimen_rollups(&self, tx: &Transaction) -> ImportResult<HashSet<i64>> {
        let rollups = self.registry.rollups(
            RollupDirection::VialToSpecimen,
            &vial_field_defs(),
            &to_field_defs(SPECIMEN_ROLLUP_TARGETS),
        );
        let groups = self.vials_by_specimen(tx)?;

        let mut candidates = Vec::with_capacity(groups.len());
        for (specimen_id, vials) in groups {
            let refs: Vec<&Record> = vials.iter().collect();
            let mut record = Record::new().with(COL_VIAL_COUNT, FieldValue::Integer(vials.len() as i64));
            for instances in rollups.values() {
                for instance in instances {
                    record.set(&instance.to.name, instance.evaluate(&refs)?);
                }
            }
            candidates.push((specimen_id, record));
        }
        self.update_specimens(tx, candidates.into_iter())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::columns::{COL_PTID, COL_VISIT_VALUE, COL_VOLUME};
    use crate::engine::specimen_hash::HashComputer;
    use crate::importer::collaborators::DefaultRequestabilityRules;
    use rusqlite::Connection;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();
        conn
    }

    fn staged(line: usize, guid: &str, lab: i64, day: u32, volume: f64) -> StagingRow {
        let hasher = HashComputer::new("c1");
        let mut record = Record::new()
            .with(COL_GLOBAL_UNIQUE_ID, FieldValue::Text(guid.to_string()))
            .with(COL_LSID, FieldValue::Text(format!("lsid:{}", guid)))
            .with(COL_PTID, FieldValue::Text("101".to_string()))
            .with(COL_VISIT_VALUE, FieldValue::Float(1.0))
            .with(COL_LAB_ID, FieldValue::Integer(lab))
            .with(COL_VOLUME, FieldValue::Float(volume))
            .with(
                COL_LAB_RECEIPT_DATE,
                FieldValue::DateTime(
                    chrono::NaiveDate::from_ymd_opt(2024, 1, day)
                        .and_then(|d| d.and_hms_opt(0, 0, 0))
                        .unwrap(),
                ),
            );
        let hash = hasher.compute(&record, None);
        record.set(COL_SPECIMEN_HASH, FieldValue::Text(hash));
        StagingRow::new(line, record)
    }

    fn lookup(kind: LookupKind, ids: &[(i64, &str)]) -> MappedLookup {
        MappedLookup {
            source: "test".to_string(),
            kind,
            rows: ids
                .iter()
                .enumerate()
                .map(|(i, (id, label))| {
                    StagingRow::new(
                        i + 3,
                        Record::new()
                            .with(COL_EXTERNAL_ID, FieldValue::Integer(*id))
                            .with("label", FieldValue::Text(label.to_string())),
                    )
                })
                .collect(),
        }
    }

    #[test]
    fn test_lookup_merge_counts() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        let registry = RollupRegistry::new();
        let sync = PersistenceSync::new("c1", &registry);

        let first = sync
            .sync_lookup(&tx, &lookup(LookupKind::Additive, &[(1, "EDTA"), (2, "Heparin")]), ImportMode::Merge)
            .unwrap();
        assert_eq!(first.inserted, 2);

        let second = sync
            .sync_lookup(&tx, &lookup(LookupKind::Additive, &[(1, "EDTA"), (2, "Heparin Li")]), ImportMode::Merge)
            .unwrap();
        assert_eq!((second.inserted, second.updated, second.unchanged), (0, 1, 1));

        let replaced = sync
            .sync_lookup(&tx, &lookup(LookupKind::Additive, &[(3, "None")]), ImportMode::Replace)
            .unwrap();
        assert_eq!((replaced.deleted, replaced.inserted), (2, 1));
    }

    #[test]
    fn test_labs_always_merge() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        let registry = RollupRegistry::new();
        let sync = PersistenceSync::new("c1", &registry);
        sync.sync_lookup(&tx, &lookup(LookupKind::Location, &[(1, "A")]), ImportMode::Merge).unwrap();
        let counts = sync
            .sync_lookup(&tx, &lookup(LookupKind::Location, &[(2, "B")]), ImportMode::Replace)
            .unwrap();
        assert_eq!((counts.deleted, counts.inserted), (0, 1));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        let registry = RollupRegistry::new();
        let sync = PersistenceSync::new("c1", &registry);
        let rows = vec![staged(3, "V1", 1, 1, 1.0), staged(4, "V1", 2, 5, 1.0), staged(5, "V2", 1, 2, 1.0)];

        let first = sync.sync_core(&tx, &rows, ImportMode::Merge).unwrap();
        assert_eq!(first.specimens.inserted, 1);
        assert_eq!(first.vials.inserted, 2);
        assert_eq!(first.events.inserted, 3);
        sync.refresh_derived(&tx, &DefaultRequestabilityRules).unwrap();

        let second = sync.sync_core(&tx, &rows, ImportMode::Merge).unwrap();
        assert_eq!(second.specimens.changed(), 0);
        assert_eq!(second.vials.changed(), 0);
        assert_eq!(second.events.changed(), 0);
        assert_eq!(second.events.unchanged, 3);
        let derived = sync.refresh_derived(&tx, &DefaultRequestabilityRules).unwrap();
        assert_eq!(derived.vials_updated, 0);
        assert_eq!(derived.specimens_updated, 0);
    }

    #[test]
    fn test_replace_counts_deletions() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        let registry = RollupRegistry::new();
        let sync = PersistenceSync::new("c1", &registry);
        sync.sync_core(&tx, &[staged(3, "V1", 1, 1, 1.0)], ImportMode::Replace).unwrap();
        let counts = sync.sync_core(&tx, &[staged(3, "V2", 1, 1, 1.0)], ImportMode::Replace).unwrap();
        assert_eq!((counts.vials.deleted, counts.vials.inserted), (1, 1));
        assert_eq!((counts.events.deleted, counts.events.inserted), (1, 1));
        assert_eq!(SpecimenRepositoryImpl::load_vials_tx(&tx, "c1").unwrap().len(), 1);
    }

    #[test]
    fn test_derived_vial_rollups() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        let registry = RollupRegistry::new();
        let sync = PersistenceSync::new("c1", &registry);
        let rows = vec![staged(3, "V1", 11, 1, 1.0), staged(4, "V1", 12, 5, 1.0), staged(5, "V2", 11, 2, 1.0)];
        sync.sync_core(&tx, &rows, ImportMode::Merge).unwrap();
        let derived = sync.refresh_derived(&tx, &DefaultRequestabilityRules).unwrap();
        assert_eq!(derived.vials_updated, 2);

        let vials = SpecimenRepositoryImpl::load_vials_tx(&tx, "c1").unwrap();
        let v1 = vials.iter().find(|v| v.record.text(COL_GLOBAL_UNIQUE_ID) == Some("V1")).unwrap();
        assert_eq!(v1.record.get("first_lab_id"), &FieldValue::Integer(11));
        assert_eq!(v1.record.get("latest_lab_id"), &FieldValue::Integer(12));

        let specimens = SpecimenRepositoryImpl::load_specimens_tx(&tx, "c1").unwrap();
        assert_eq!(specimens[0].record.get(COL_VIAL_COUNT), &FieldValue::Integer(2));
        assert_eq!(specimens[0].record.get("total_volume"), &FieldValue::Float(2.0));
    }
}
