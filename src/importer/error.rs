// ==========================================
// 标本导入对账系统 - 导入模块错误类型
// ==========================================
// 分类: 校验 / 冲突 / 乐观并发 / 配置 / 取消 / 存储
// 工具: thiserror 派生宏
// ==========================================

use crate::domain::summary::SpecimenConflict;
use crate::engine::rollup::RollupError;
use crate::repository::error::RepositoryError;
use thiserror::Error;

/// 错误大类（对调用方可见的分类）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    Conflict,
    OptimisticConcurrency,
    Configuration,
    Cancelled,
    Storage,
}

/// 导入模块错误类型
#[derive(Error, Debug)]
pub enum ImportError {
    // ===== 文件相关错误 =====
    #[error("文件不存在: {0}")]
    FileNotFound(String),

    #[error("文件读取失败: {0}")]
    FileReadError(String),

    #[error("制表符文本解析失败: {0}")]
    TsvParseError(String),

    // ===== 校验错误 =====
    #[error("Import files are expected to start with a comment indicating table name: {0}")]
    MissingTableName(String),

    #[error("缺少必需列: {0}")]
    MissingColumn(String),

    #[error("类型转换失败 (行 {row}, 字段 {field}): 无法解析 '{value}'")]
    TypeConversionError {
        row: usize,
        field: String,
        value: String,
    },

    #[error("值超长 (行 {row}, 字段 {field}): 长度 {len} 超过上限 {max}")]
    ValueTooLong {
        row: usize,
        field: String,
        len: usize,
        max: usize,
    },

    #[error("必填值缺失 (行 {row}, 字段 {field})")]
    RequiredValueMissing { row: usize, field: String },

    #[error("GlobalUniqueId is required but was not supplied (行 {0})")]
    GlobalUniqueIdMissing(usize),

    #[error("The following undefined visits exist in the specimen data: {}", format_visits(.0))]
    UndefinedVisits(Vec<f64>),

    // ===== 冲突错误 =====
    #[error("{}", format_conflicts(.0))]
    ConflictingSpecimens(Vec<SpecimenConflict>),

    #[error("With an editable specimen repository, importing may not reference any existing specimen. {0} imported specimen events refer to existing specimens.")]
    ExistingSpecimenReferenced(usize),

    // ===== 乐观并发错误 =====
    #[error("Attempt to generate global unique ids failed.")]
    OptimisticConcurrency,

    // ===== 配置错误 =====
    #[error("无可用导入策略: 未识别的表名 '{0}'")]
    UnknownImportTable(String),

    #[error("配置值格式错误 (key: {key}, value: {value}): {message}")]
    ConfigValueError {
        key: String,
        value: String,
        message: String,
    },

    #[error("汇总规则配置错误: {0}")]
    Rollup(#[from] RollupError),

    #[error("可请求规则执行失败: {0}")]
    RequestabilityRule(String),

    // ===== 运行控制 =====
    #[error("导入已取消")]
    Cancelled,

    // ===== 数据库错误 =====
    #[error("数据库锁获取失败: {0}")]
    LockError(String),

    #[error("数据库查询失败: {0}")]
    DatabaseQueryError(String),

    #[error(transparent)]
    Repository(#[from] RepositoryError),

    // ===== 通用错误 =====
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn format_visits(visits: &[f64]) -> String {
    visits
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_conflicts(conflicts: &[SpecimenConflict]) -> String {
    conflicts
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join("\n")
}

impl ImportError {
    /// 错误大类
    pub fn kind(&self) -> ErrorKind {
        match self {
            ImportError::FileNotFound(_)
            | ImportError::FileReadError(_)
            | ImportError::TsvParseError(_)
            | ImportError::MissingTableName(_)
            | ImportError::MissingColumn(_)
            | ImportError::TypeConversionError { .. }
            | ImportError::ValueTooLong { .. }
            | ImportError::RequiredValueMissing { .. }
            | ImportError::GlobalUniqueIdMissing(_)
            | ImportError::UndefinedVisits(_) => ErrorKind::Validation,
            ImportError::ConflictingSpecimens(_) | ImportError::ExistingSpecimenReferenced(_) => {
                ErrorKind::Conflict
            }
            ImportError::OptimisticConcurrency => ErrorKind::OptimisticConcurrency,
            ImportError::UnknownImportTable(_)
            | ImportError::ConfigValueError { .. }
            | ImportError::Rollup(_)
            | ImportError::RequestabilityRule(_) => ErrorKind::Configuration,
            ImportError::Cancelled => ErrorKind::Cancelled,
            ImportError::LockError(_)
            | ImportError::DatabaseQueryError(_)
            | ImportError::Repository(_)
            | ImportError::Other(_) => ErrorKind::Storage,
        }
    }

    /// 仅乐观并发错误允许重试
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::OptimisticConcurrency
    }
}

// 实现 From<std::io::Error>
impl From<std::io::Error> for ImportError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => ImportError::FileNotFound(err.to_string()),
            _ => ImportError::FileReadError(err.to_string()),
        }
    }
}

// 实现 From<rusqlite::Error>
impl From<rusqlite::Error> for ImportError {
    fn from(err: rusqlite::Error) -> Self {
        ImportError::Repository(RepositoryError::from(err))
    }
}

// 实现 From<csv::Error>
impl From<csv::Error> for ImportError {
    fn from(err: csv::Error) -> Self {
        ImportError::TsvParseError(err.to_string())
    }
}

/// Result 类型别名
pub type ImportResult<T> = Result<T, ImportError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kinds() {
        assert_eq!(ImportError::UndefinedVisits(vec![1.0]).kind(), ErrorKind::Validation);
        assert_eq!(ImportError::ExistingSpecimenReferenced(2).kind(), ErrorKind::Conflict);
        assert_eq!(
            ImportError::UnknownImportTable("x".to_string()).kind(),
            ErrorKind::Configuration
        );
        assert!(ImportError::OptimisticConcurrency.is_retryable());
        assert!(!ImportError::Cancelled.is_retryable());
    }

    #[test]
    fn test_messages() {
        assert_eq!(
            ImportError::UndefinedVisits(vec![1.0, 3.5]).to_string(),
            "The following undefined visits exist in the specimen data: 1, 3.5"
        );
        assert_eq!(
            ImportError::ExistingSpecimenReferenced(3).to_string(),
            "With an editable specimen repository, importing may not reference any existing specimen. 3 imported specimen events refer to existing specimens."
        );
        let conflicts = vec![
            SpecimenConflict {
                global_unique_id: "A".to_string(),
                fields: vec![("ptid".to_string(), vec!["1".to_string(), "2".to_string()])],
                groups: Vec::new(),
            },
            SpecimenConflict {
                global_unique_id: "B".to_string(),
                fields: vec![],
                groups: Vec::new(),
            },
        ];
        let message = ImportError::ConflictingSpecimens(conflicts).to_string();
        assert!(message.contains("GlobalUniqueId 'A'"));
        assert!(message.contains("GlobalUniqueId 'B'"));
    }
}
