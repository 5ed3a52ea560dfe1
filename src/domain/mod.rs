// ==========================================
// 标本导入对账系统 - 领域模型层
// ==========================================
// 职责: 定义字段类型、列目录、记录结构、导入结果
// 红线: 不含数据访问逻辑,不含引擎逻辑
// ==========================================

pub mod columns;
pub mod record;
pub mod summary;
pub mod types;

// 重导出核心类型
pub use columns::{FieldDef, LookupColumn, LookupKind, SpecimenColumn, TargetTable};
pub use record::{Record, StagingRow, StoredRow};
pub use summary::{ImportSummary, SpecimenConflict, SyncCounts};
pub use types::{AggregateFn, FieldType, FieldValue, ImportMode, TimepointType};
