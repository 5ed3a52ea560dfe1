// ==========================================
// 标本导入对账系统 - 标本导入器实现
// ==========================================
// 职责: 整合导入流程，从文件到数据库
// 流程: 解析 → 映射 →（事务）查找表 → 暂存 + 冲突检测 → 访视校验
//       → 三层主表 → 派生字段 → 研究同步 → 提交 →（事务外）通知
// 红线: 一次导入 = 一个事务；任一阶段失败整体回滚
// 红线: 只有暂存阶段的乐观并发错误允许重试（最多 3 次）
// ==========================================

use crate::config::{ImportSettings, ImportSettingsReader};
use crate::domain::columns::{LookupKind, COL_GLOBAL_UNIQUE_ID, COL_VISIT_VALUE};
use crate::domain::summary::ImportSummary;
use crate::domain::types::{ImportMode, TimepointType};
use crate::engine::conflict_detector::ConflictDetector;
use crate::engine::rollup::RollupRegistry;
use crate::importer::collaborators::{
    CancelHandle, DefaultRequestabilityRules, DefaultSequenceNumTranslator,
    IdentityParticipantTranslator, SequenceIdGenerator,
};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::field_mapper::{FieldMapper as DefaultFieldMapper, MappedLookup, MappedSpecimens, MappedTable};
use crate::importer::file_parser::{RawTable, TsvParser};
use crate::importer::persistence_sync::PersistenceSync;
use crate::importer::specimen_importer_trait::{
    FieldMapper, FileParser, ImportListener, ParticipantIdTranslator, RequestabilityEngine,
    SequenceNumTranslator, SpecimenImporter, UniqueIdGenerator,
};
use crate::importer::temp_table_loader::{StagedBatch, TempTableLoader};
use crate::perf::PerfGuard;
use crate::repository::specimen_repo_impl::SpecimenRepositoryImpl;
use crate::repository::lookup_repo::LookupRepository;
use crate::repository::study_repo::StudyRepository;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// 暂存阶段最大尝试次数
pub const MAX_STAGING_ATTEMPTS: usize = 3;

fn lookup_order(kind: LookupKind) -> u8 {
    match kind {
        LookupKind::Location => 0,
        LookupKind::Additive => 1,
        LookupKind::Derivative => 2,
        LookupKind::PrimaryType => 3,
    }
}

// ==========================================
// SpecimenImporterImpl - 标本导入器实现
// ==========================================
pub struct SpecimenImporterImpl<C>
where
    C: ImportSettingsReader,
{
    // 数据库连接
    conn: Arc<Mutex<Connection>>,

    // 配置读取器
    config: C,

    // 导入组件
    file_parser: Box<dyn FileParser>,
    field_mapper: Box<dyn FieldMapper>,

    // 外部协作者
    participants: Box<dyn ParticipantIdTranslator>,
    sequences: Box<dyn SequenceNumTranslator>,
    id_generator: Box<dyn UniqueIdGenerator>,
    requestability: Box<dyn RequestabilityEngine>,
    listeners: Vec<Box<dyn ImportListener>>,

    // 汇总匹配缓存（跨运行复用）
    registry: RollupRegistry,

    cancel: CancelHandle,
}

impl<C> SpecimenImporterImpl<C>
where
    C: ImportSettingsReader,
{
    /// 创建新的 SpecimenImporter 实例（协作者使用默认实现）
    ///
    /// # 参数
    /// - conn: 已初始化 schema 的数据库连接
    /// - config: 配置读取器
    pub fn new(conn: Arc<Mutex<Connection>>, config: C) -> Self {
        Self {
            conn,
            config,
            file_parser: Box::new(TsvParser),
            field_mapper: Box::new(DefaultFieldMapper),
            participants: Box::new(IdentityParticipantTranslator),
            sequences: Box::new(DefaultSequenceNumTranslator),
            id_generator: Box::new(SequenceIdGenerator),
            requestability: Box::new(DefaultRequestabilityRules),
            listeners: Vec::new(),
            registry: RollupRegistry::new(),
            cancel: CancelHandle::new(),
        }
    }

    pub fn with_participant_translator(mut self, translator: Box<dyn ParticipantIdTranslator>) -> Self {
        self.participants = translator;
        self
    }

    pub fn with_sequence_translator(mut self, translator: Box<dyn SequenceNumTranslator>) -> Self {
        self.sequences = translator;
        self
    }

    pub fn with_id_generator(mut self, generator: Box<dyn UniqueIdGenerator>) -> Self {
        self.id_generator = generator;
        self
    }

    pub fn with_requestability(mut self, engine: Box<dyn RequestabilityEngine>) -> Self {
        self.requestability = engine;
        self
    }

    pub fn with_listener(mut self, listener: Box<dyn ImportListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn with_cancel_handle(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// 取消句柄（可在其他任务中置位）
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn registry(&self) -> &RollupRegistry {
        &self.registry
    }

    // ==========================================
    // 事务内流程
    // ==========================================

    #[allow(clippy::too_many_arguments)]
    fn run_in_transaction(
        &self,
        conn: &mut Connection,
        container: &str,
        mode: ImportMode,
        settings: &ImportSettings,
        lookups: &[MappedLookup],
        specimens: &[MappedSpecimens],
        summary: &mut ImportSummary,
    ) -> ImportResult<()> {
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let sync = PersistenceSync::new(container, &self.registry);

        // === 阶段 1: 查找表（实验室在前）===
        {
            let _perf = PerfGuard::new("lookups", container);
            for lookup in lookups {
                let counts = sync.sync_lookup(&tx, lookup, mode)?;
                match lookup.kind {
                    LookupKind::Location => summary.locations += counts,
                    LookupKind::Additive => summary.additives += counts,
                    LookupKind::Derivative => summary.derivatives += counts,
                    LookupKind::PrimaryType => summary.primary_types += counts,
                }
            }
        }
        self.cancel.check()?;

        if !specimens.is_empty() {
            // === 阶段 2: 暂存 + 冲突检测 ===
            let batch = {
                let _perf = PerfGuard::new("staging", container);
                let (batch, attempts) = self.stage_with_retry(&tx, container, mode, settings, specimens)?;
                summary.staging_attempts = attempts;
                summary.staged_rows = batch.rows.len();
                batch
            };
            self.cancel.check()?;

            // 无暂存行时保留存量标本/样品管/事件（REPLACE 也不清表）
            if batch.rows.is_empty() {
                info!(container = %container, mode = %mode, "标本文件无数据行，跳过主表同步");
            } else {
                // === 阶段 3: 未定义访视 ===
                if settings.timepoint_type == TimepointType::Visit {
                    let _perf = PerfGuard::new("visits", container);
                    summary.created_visits = self.validate_visits(&tx, container, settings, &batch)?;
                }
                self.cancel.check()?;

                // === 阶段 4: 三层主表 ===
                {
                    let _perf = PerfGuard::new("core_tables", container);
                    let counts = sync.sync_core(&tx, &batch.rows, mode)?;
                    summary.specimens = counts.specimens;
                    summary.vials = counts.vials;
                    summary.events = counts.events;
                }
                self.cancel.check()?;

                // === 阶段 5: 派生字段 ===
                {
                    let _perf = PerfGuard::new("derived_fields", container);
                    let derived = sync.refresh_derived(&tx, self.requestability.as_ref())?;
                    summary.derived_vials_updated = derived.vials_updated;
                    summary.specimens_rollup_updated = derived.specimens_updated;
                    summary.orphaned_request_vials = derived.orphaned_request_vials;
                }
                self.cancel.check()?;
            }
        }

        // === 阶段 6: 研究同步 ===
        {
            let _perf = PerfGuard::new("study_sync", container);
            self.sync_study(&tx, container, settings)?;
        }
        self.cancel.check()?;

        tx.commit()?;
        Ok(())
    }

    /// 暂存 + 冲突检测；乐观并发错误时整体重建暂存
    ///
    /// # 返回
    /// - (暂存结果, 尝试次数)
    fn stage_with_retry(
        &self,
        tx: &Transaction,
        container: &str,
        mode: ImportMode,
        settings: &ImportSettings,
        specimens: &[MappedSpecimens],
    ) -> ImportResult<(StagedBatch, usize)> {
        let loader = TempTableLoader::new(container, self.participants.as_ref(), self.sequences.as_ref());

        let mut attempt = 0;
        loop {
            attempt += 1;
            let staged = loader
                .populate(tx, specimens, settings, self.id_generator.as_ref())
                .and_then(|batch| {
                    self.check_conflicts(tx, container, mode, settings, &batch)?;
                    Ok(batch)
                });

            match staged {
                Ok(batch) => {
                    info!(
                        container = %container,
                        rows = batch.rows.len(),
                        attempt,
                        "暂存完成"
                    );
                    return Ok((batch, attempt));
                }
                Err(e) if e.is_retryable() && attempt < MAX_STAGING_ATTEMPTS => {
                    warn!(container = %container, attempt, error = %e, "暂存发生乐观并发冲突，重试");
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// 冲突检测（仅 MERGE；REPLACE 先清空容器，不存在存量可冲突）
    ///
    /// # 规则
    /// - 可编辑库: 不允许引用任何已存在的样品管
    /// - 不可编辑库: 同一 GlobalUniqueId 的标本定义字段必须与存量一致
    fn check_conflicts(
        &self,
        tx: &Transaction,
        container: &str,
        mode: ImportMode,
        settings: &ImportSettings,
        batch: &StagedBatch,
    ) -> ImportResult<()> {
        if mode != ImportMode::Merge {
            return Ok(());
        }
        let guids: Vec<String> = batch
            .rows
            .iter()
            .filter_map(|r| r.record.text(COL_GLOBAL_UNIQUE_ID).map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        if settings.editable_repository {
            let existing = SpecimenRepositoryImpl::existing_guids_tx(tx, container, &guids)?;
            let references = ConflictDetector::count_existing_references(&batch.rows, &existing);
            if references > 0 {
                warn!(container = %container, references, "可编辑库导入引用了已有样品管");
                return Err(ImportError::ExistingSpecimenReferenced(references));
            }
        } else {
            let persisted = SpecimenRepositoryImpl::persisted_defining_rows_tx(tx, container, &guids)?;
            let conflicts = ConflictDetector::find_conflicts(&persisted, &batch.rows, Some(&batch.declared));
            if !conflicts.is_empty() {
                warn!(container = %container, conflicts = conflicts.len(), "标本定义字段冲突");
                return Err(ImportError::ConflictingSpecimens(conflicts));
            }
        }
        Ok(())
    }

    /// 未定义访视: 失败或补建
    fn validate_visits(
        &self,
        tx: &Transaction,
        container: &str,
        settings: &ImportSettings,
        batch: &StagedBatch,
    ) -> ImportResult<Vec<f64>> {
        let values = batch.rows.iter().filter_map(|r| r.get(COL_VISIT_VALUE).as_f64());
        let undefined = StudyRepository::undefined_visits_tx(tx, container, values)?;
        if undefined.is_empty() {
            return Ok(undefined);
        }
        if settings.fail_for_undefined_visits {
            return Err(ImportError::UndefinedVisits(undefined));
        }
        for sequence_num in &undefined {
            StudyRepository::create_visit_tx(tx, container, *sequence_num)?;
        }
        info!(container = %container, visits = ?undefined, "已补建未定义访视");
        Ok(undefined)
    }

    fn sync_study(&self, tx: &Transaction, container: &str, settings: &ImportSettings) -> ImportResult<()> {
        let participants = StudyRepository::sync_participants_tx(tx, container)?;
        let participant_visits = if settings.sync_participant_visits {
            StudyRepository::sync_participant_visits_tx(tx, container)?
        } else {
            0
        };
        let locations = LookupRepository::refresh_in_use_tx(tx, container)?;
        debug!(
            container = %container,
            participants,
            participant_visits,
            locations,
            "研究数据同步完成"
        );
        Ok(())
    }

    /// 提交后通知（失败只记日志）
    fn notify_listeners(&self, container: &str, summary: &ImportSummary) {
        for listener in &self.listeners {
            if let Err(e) = listener.clear_caches(container) {
                warn!(container = %container, error = %e, "缓存失效通知失败");
            }
            if let Err(e) = listener.specimens_changed(container, summary) {
                warn!(container = %container, error = %e, "数据变更通知失败");
            }
        }
    }
}

#[async_trait::async_trait]
impl<C> SpecimenImporter for SpecimenImporterImpl<C>
where
    C: ImportSettingsReader + Send + Sync,
{
    #[instrument(skip(self, paths), fields(files = paths.len()))]
    async fn import_files(
        &self,
        container: &str,
        mode: ImportMode,
        paths: &[PathBuf],
    ) -> ImportResult<ImportSummary> {
        let mut tables = Vec::with_capacity(paths.len());
        for path in paths {
            let table = self.file_parser.parse_file(path)?;
            debug!(file = %path.display(), table = %table.table, rows = table.rows.len(), "文件解析完成");
            tables.push(table);
        }
        self.import_parsed(container, mode, tables).await
    }

    #[instrument(skip(self, tables), fields(run_id))]
    async fn import_parsed(
        &self,
        container: &str,
        mode: ImportMode,
        tables: Vec<RawTable>,
    ) -> ImportResult<ImportSummary> {
        let start_time = Instant::now();
        let run_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("run_id", run_id.as_str());
        info!(run_id = %run_id, container = %container, mode = %mode, tables = tables.len(), "开始导入标本数据");

        // === 步骤 1: 字段映射（事务外）===
        let mut lookups = Vec::new();
        let mut specimens = Vec::new();
        for raw in &tables {
            match self.field_mapper.map_table(raw)? {
                MappedTable::Lookup(lookup) => lookups.push(lookup),
                MappedTable::Specimens(file) => specimens.push(file),
            }
        }
        lookups.sort_by_key(|l| lookup_order(l.kind));

        // === 步骤 2: 读取配置 ===
        let settings = self.config.import_settings(container).await?;
        debug!(container = %container, settings = ?settings, "导入配置");
        self.cancel.check()?;

        // === 步骤 3: 事务 ===
        let mut summary = ImportSummary {
            run_id: run_id.clone(),
            container: container.to_string(),
            mode: Some(mode),
            ..ImportSummary::default()
        };
        {
            let mut conn = self
                .conn
                .lock()
                .map_err(|e| ImportError::LockError(e.to_string()))?;
            if let Err(e) = self.run_in_transaction(&mut conn, container, mode, &settings, &lookups, &specimens, &mut summary) {
                warn!(run_id = %run_id, container = %container, error = %e, "导入失败，事务已回滚");
                return Err(e);
            }
        }
        summary.elapsed_ms = start_time.elapsed().as_millis() as u64;

        // === 步骤 4: 提交后通知 ===
        self.notify_listeners(container, &summary);

        info!(
            run_id = %run_id,
            container = %container,
            staged_rows = summary.staged_rows,
            specimens_inserted = summary.specimens.inserted,
            vials_inserted = summary.vials.inserted,
            events_inserted = summary.events.inserted,
            elapsed_ms = summary.elapsed_ms,
            "标本数据导入完成"
        );
        Ok(summary)
    }
}
