// ==========================================
// 标本导入对账系统 - 导入层
// ==========================================
// 职责: 文件解析 → 字段映射 → 暂存 → 冲突检测 → 落库 → 派生重算
// 支持: 制表符分隔文本（首行 `#表名`）
// ==========================================

// 模块声明
pub mod collaborators;
pub mod error;
pub mod field_mapper;
pub mod file_parser;
pub mod persistence_sync;
pub mod specimen_importer_impl;
pub mod specimen_importer_trait;
pub mod temp_table_loader;

// 重导出核心类型
pub use collaborators::{
    CancelHandle, DefaultRequestabilityRules, DefaultSequenceNumTranslator,
    IdentityParticipantTranslator, SequenceIdGenerator,
};
pub use error::{ErrorKind, ImportError, ImportResult};
pub use field_mapper::{FieldMapper as FieldMapperImpl, MappedLookup, MappedSpecimens, MappedTable};
pub use file_parser::{ImportTable, RawTable, TsvParser};
pub use persistence_sync::{CoreCounts, DerivedCounts, PersistenceSync};
pub use specimen_importer_impl::{SpecimenImporterImpl, MAX_STAGING_ATTEMPTS};
pub use temp_table_loader::{StagedBatch, TempTableLoader};

// 重导出 Trait 接口
pub use specimen_importer_trait::{
    FieldMapper, FileParser, ImportListener, ParticipantIdTranslator, RequestabilityEngine,
    SequenceNumTranslator, SpecimenImporter, UniqueIdGenerator,
};
