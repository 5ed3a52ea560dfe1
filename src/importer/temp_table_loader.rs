// ==========================================
// 标本导入对账系统 - 暂存装载
// ==========================================
// 职责: 标本文件行 → 暂存行
//       GlobalUniqueId / LSID / 受试者 / 序列号 / 外键重映射 / 标本哈希
// 红线: 同一样品管的所有暂存行必须携带同一 SpecimenHash
// 红线: 自动生成的 ID 与存量冲突 → 乐观并发错误（由调用方重试）
// ==========================================

use crate::config::ImportSettings;
use crate::domain::columns::{
    LookupKind, COL_DRAW_TIMESTAMP, COL_GLOBAL_UNIQUE_ID, COL_LSID, COL_PARTICIPANT_SEQUENCE_NUM,
    COL_PTID, COL_SPECIMEN_HASH, COL_SPECIMEN_NUMBER, COL_VISIT_VALUE, SPECIMEN_COLUMNS,
};
use crate::domain::record::StagingRow;
use crate::domain::types::{FieldValue, TimepointType};
use crate::engine::set_reconciler::defining_values_by_vial;
use crate::engine::specimen_hash::HashComputer;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::field_mapper::MappedSpecimens;
use crate::importer::specimen_importer_trait::{
    ParticipantIdTranslator, SequenceNumTranslator, UniqueIdGenerator,
};
use crate::repository::lookup_repo::LookupRepository;
use crate::repository::specimen_repo_impl::SpecimenRepositoryImpl;
use rusqlite::Transaction;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

/// 样品管 LSID
pub fn vial_lsid(container: &str, global_unique_id: &str) -> String {
    format!("urn:lsid:specimen:Folder-{}:{}", container, global_unique_id)
}

// ==========================================
// StagedBatch - 一次暂存的结果
// ==========================================
#[derive(Debug, Clone, Default)]
pub struct StagedBatch {
    pub rows: Vec<StagingRow>,
    /// 各文件声明列的并集（含装载阶段补出的列）
    pub declared: HashSet<String>,
    pub generated_ids: Vec<String>,
    /// 外键未匹配而置空的单元格数
    pub unmatched_lookups: usize,
}

// ==========================================
// TempTableLoader
// ==========================================
pub struct TempTableLoader<'a> {
    container: &'a str,
    hasher: HashComputer,
    participants: &'a dyn ParticipantIdTranslator,
    sequences: &'a dyn SequenceNumTranslator,
}

impl<'a> TempTableLoader<'a> {
    pub fn new(
        container: &'a str,
        participants: &'a dyn ParticipantIdTranslator,
        sequences: &'a dyn SequenceNumTranslator,
    ) -> Self {
        Self {
            container,
            hasher: HashComputer::new(container),
            participants,
            sequences,
        }
    }

    /// 装载暂存行
    ///
    /// # 参数
    /// - tx: 导入事务（读取查找表 / 存量 ID）
    /// - specimens: 已映射的标本文件（可多个，按顺序拼接）
    /// - settings: 容器配置
    /// - id_generator: 可编辑库下补全缺失的 GlobalUniqueId
    ///
    /// # 返回
    /// - Err(GlobalUniqueIdMissing): 非可编辑库缺少 ID
    /// - Err(OptimisticConcurrency): 生成的 ID 与已有 ID 冲突
    pub fn populate(
        &self,
        tx: &Transaction,
        specimens: &[MappedSpecimens],
        settings: &ImportSettings,
        id_generator: &dyn UniqueIdGenerator,
    ) -> ImportResult<StagedBatch> {
        let mut batch = StagedBatch::default();
        for file in specimens {
            batch.rows.extend(file.rows.iter().cloned());
            batch.declared.extend(file.declared.iter().cloned());
        }
        if batch.rows.is_empty() {
            return Ok(batch);
        }

        // === 步骤 1: GlobalUniqueId ===
        batch.generated_ids = self.resolve_unique_ids(tx, &mut batch.rows, settings, id_generator)?;
        batch.declared.insert(COL_GLOBAL_UNIQUE_ID.to_string());

        // === 步骤 2: LSID / 受试者 / 序列号 ===
        for row in batch.rows.iter_mut() {
            self.fill_identity_columns(row, settings.timepoint_type)?;
        }
        if settings.timepoint_type == TimepointType::Date {
            batch.declared.insert(COL_VISIT_VALUE.to_string());
        }

        // === 步骤 3: 外键重映射 ===
        batch.unmatched_lookups = self.remap_lookups(tx, &mut batch.rows)?;
        if batch.unmatched_lookups > 0 {
            warn!(
                container = %self.container,
                unmatched = batch.unmatched_lookups,
                "存在未匹配的查找表外部 ID，已置空"
            );
        }

        // === 步骤 4: 标本哈希 ===
        let defining = defining_values_by_vial(&batch.rows);
        let hashes: HashMap<&str, String> = defining
            .iter()
            .map(|(guid, record)| (guid.as_str(), self.hasher.compute(record, Some(&batch.declared))))
            .collect();
        for row in batch.rows.iter_mut() {
            let hash = row
                .record
                .text(COL_GLOBAL_UNIQUE_ID)
                .and_then(|guid| hashes.get(guid))
                .cloned();
            if let Some(hash) = hash {
                row.record.set(COL_SPECIMEN_HASH, FieldValue::Text(hash));
            }
        }

        debug!(
            container = %self.container,
            rows = batch.rows.len(),
            vials = hashes.len(),
            generated = batch.generated_ids.len(),
            "暂存装载完成"
        );
        Ok(batch)
    }

    /// 缺失 ID 依次取 specimen_number、生成 ID
    fn resolve_unique_ids(
        &self,
        tx: &Transaction,
        rows: &mut [StagingRow],
        settings: &ImportSettings,
        id_generator: &dyn UniqueIdGenerator,
    ) -> ImportResult<Vec<String>> {
        let mut missing = Vec::new();
        for (idx, row) in rows.iter_mut().enumerate() {
            if !row.get(COL_GLOBAL_UNIQUE_ID).is_null() {
                continue;
            }
            match row.get(COL_SPECIMEN_NUMBER).canonical_text() {
                Some(number) => row.record.set(COL_GLOBAL_UNIQUE_ID, FieldValue::Text(number)),
                None if settings.editable_repository => missing.push(idx),
                None => return Err(ImportError::GlobalUniqueIdMissing(row.row_number)),
            }
        }
        if missing.is_empty() {
            return Ok(Vec::new());
        }

        let generated = id_generator.next_ids(tx, self.container, missing.len())?;
        if generated.len() != missing.len() {
            return Err(anyhow::anyhow!(
                "ID 生成数量不符: 需要 {}，得到 {}",
                missing.len(),
                generated.len()
            )
            .into());
        }

        // 生成的 ID 不得重复，也不得与文件内或库内已有 ID 相同
        let supplied: HashSet<String> = rows
            .iter()
            .filter_map(|r| r.record.text(COL_GLOBAL_UNIQUE_ID).map(str::to_string))
            .collect();
        let distinct: HashSet<&String> = generated.iter().collect();
        let existing = SpecimenRepositoryImpl::existing_guids_tx(tx, self.container, &generated)?;
        if distinct.len() != generated.len()
            || !existing.is_empty()
            || generated.iter().any(|id| supplied.contains(id))
        {
            warn!(
                container = %self.container,
                requested = generated.len(),
                collisions = existing.len(),
                "生成的 GlobalUniqueId 与已有 ID 冲突"
            );
            return Err(ImportError::OptimisticConcurrency);
        }

        for (idx, id) in missing.iter().zip(&generated) {
            rows[*idx]
                .record
                .set(COL_GLOBAL_UNIQUE_ID, FieldValue::Text(id.clone()));
        }
        Ok(generated)
    }

    fn fill_identity_columns(&self, row: &mut StagingRow, timepoint: TimepointType) -> ImportResult<()> {
        if let Some(guid) = row.record.text(COL_GLOBAL_UNIQUE_ID).map(str::to_string) {
            row.record
                .set(COL_LSID, FieldValue::Text(vial_lsid(self.container, &guid)));
        }

        let ptid = match row.record.text(COL_PTID) {
            Some(raw) => Some(self.participants.translate(self.container, raw)?),
            None => None,
        };
        if let Some(ptid) = &ptid {
            row.record.set(COL_PTID, FieldValue::Text(ptid.clone()));
        }

        let draw = row.get(COL_DRAW_TIMESTAMP).as_datetime();
        if timepoint == TimepointType::Date && row.get(COL_VISIT_VALUE).is_null() {
            if let Some(derived) = self.sequences.sequence_num(TimepointType::Date, None, draw) {
                row.record.set(COL_VISIT_VALUE, FieldValue::Float(derived));
            }
        }

        let visit = row.get(COL_VISIT_VALUE).as_f64();
        let psn = match (ptid, self.sequences.sequence_num(timepoint, visit, draw)) {
            (Some(ptid), Some(seq)) => FieldValue::Text(format!("{}|{}", ptid, seq)),
            _ => FieldValue::Null,
        };
        row.record.set(COL_PARTICIPANT_SEQUENCE_NUM, psn);
        Ok(())
    }

    /// 外部 ID → 查找表 row_id；未匹配置空
    fn remap_lookups(&self, tx: &Transaction, rows: &mut [StagingRow]) -> ImportResult<usize> {
        let mut maps: HashMap<LookupKind, HashMap<i64, i64>> = HashMap::new();
        for kind in LookupKind::all() {
            maps.insert(kind, LookupRepository::external_id_map_tx(tx, self.container, kind)?);
        }

        let lookup_columns: Vec<(&str, LookupKind)> = SPECIMEN_COLUMNS
            .iter()
            .filter_map(|c| c.lookup.map(|kind| (c.db_name, kind)))
            .collect();

        let mut unmatched = 0;
        for row in rows.iter_mut() {
            for (column, kind) in &lookup_columns {
                let external = match row.get(column).as_i64() {
                    Some(id) => id,
                    None => continue,
                };
                let mapped = maps.get(kind).and_then(|m| m.get(&external)).copied();
                match mapped {
                    Some(row_id) => row.record.set(column, FieldValue::Integer(row_id)),
                    None => {
                        unmatched += 1;
                        row.record.set(column, FieldValue::Null);
                    }
                }
            }
        }
        Ok(unmatched)
    }
}
