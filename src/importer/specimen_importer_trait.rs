// ==========================================
// 标本导入对账系统 - 标本导入 Trait
// ==========================================
// 职责: 定义导入主接口 + 流水线组件接口 + 外部协作者接口（不包含实现）
// 红线: 协作者只通过本文件的 trait 接入，引擎不感知具体实现
// ==========================================

use crate::domain::summary::ImportSummary;
use crate::domain::types::{ImportMode, TimepointType};
use crate::importer::error::ImportResult;
use crate::importer::field_mapper::MappedTable;
use crate::importer::file_parser::RawTable;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rusqlite::Transaction;
use std::path::{Path, PathBuf};

// ==========================================
// SpecimenImporter Trait
// ==========================================
// 用途: 标本导入主接口
// 实现者: SpecimenImporterImpl
#[async_trait]
pub trait SpecimenImporter: Send + Sync {
    /// 从文件导入
    ///
    /// # 参数
    /// - container: 目标容器（研究）
    /// - mode: MERGE / REPLACE
    /// - paths: 制表符分隔文件（每个文件首行为 `#表名`）
    ///
    /// # 返回
    /// - Ok(ImportSummary): 分表计数
    /// - Err: 任一错误，整个事务回滚
    ///
    /// # 阶段
    /// 1. 解析 + 字段映射（事务外）
    /// 2. 地点表 → 其余查找表
    /// 3. 暂存（标识 / 受试者 / 访视 / 外键 / 哈希）+ 冲突检测
    /// 4. 未定义访视校验
    /// 5. 标本 → 样品管 → 事件
    /// 6. 派生字段重算
    /// 7. 受试者 / 访视 / 地点同步 → 提交
    /// 8. 提交后通知（缓存失效 + 数据变更）
    async fn import_files(
        &self,
        container: &str,
        mode: ImportMode,
        paths: &[PathBuf],
    ) -> ImportResult<ImportSummary>;

    /// 导入已解析的表（调用方自行读取文件时使用）
    async fn import_parsed(
        &self,
        container: &str,
        mode: ImportMode,
        tables: Vec<RawTable>,
    ) -> ImportResult<ImportSummary>;
}

// ==========================================
// FileParser Trait
// ==========================================
// 用途: 文件解析接口
// 实现者: TsvParser
pub trait FileParser: Send + Sync {
    /// 解析文件为原始表（首行表名 + 表头 + 数据行）
    fn parse_file(&self, path: &Path) -> ImportResult<RawTable>;
}

// ==========================================
// FieldMapper Trait
// ==========================================
// 用途: 表头映射与类型转换接口
// 实现者: FieldMapper
pub trait FieldMapper: Send + Sync {
    /// 原始表 → 按列目录类型化的记录
    fn map_table(&self, raw: &RawTable) -> ImportResult<MappedTable>;
}

// ==========================================
// 外部协作者
// ==========================================

/// 受试者 ID 转换（例如别名 → 标准 ID）
pub trait ParticipantIdTranslator: Send + Sync {
    fn translate(&self, container: &str, ptid: &str) -> ImportResult<String>;
}

/// 序列号转换（访视型 / 日期型研究）
pub trait SequenceNumTranslator: Send + Sync {
    /// # 返回
    /// - None: 无法确定序列号（participant_sequence_num 置空）
    fn sequence_num(
        &self,
        timepoint: TimepointType,
        visit_value: Option<f64>,
        draw_timestamp: Option<NaiveDateTime>,
    ) -> Option<f64>;
}

/// 样品管全局唯一 ID 生成（仅可编辑库使用）
pub trait UniqueIdGenerator: Send + Sync {
    /// 生成 count 个新 ID
    ///
    /// # 说明
    /// - 在导入事务内调用；与存量冲突时由调用方判定为乐观并发错误
    fn next_ids(&self, tx: &Transaction, container: &str, count: usize) -> ImportResult<Vec<String>>;
}

/// 可请求规则（重算 available）
pub trait RequestabilityEngine: Send + Sync {
    /// # 返回
    /// - 变更了 available 的样品管数
    fn apply(&self, tx: &Transaction, container: &str) -> ImportResult<usize>;
}

/// 提交后通知（失败只记日志）
pub trait ImportListener: Send + Sync {
    fn clear_caches(&self, container: &str) -> anyhow::Result<()>;

    fn specimens_changed(&self, container: &str, summary: &ImportSummary) -> anyhow::Result<()>;
}
