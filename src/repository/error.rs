// ==========================================
// 标本导入对账系统 - 仓储层错误类型
// ==========================================

use thiserror::Error;

/// 仓储层错误
#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("{entity} 不存在: {key}")]
    NotFound { entity: &'static str, key: String },

    #[error("数据库锁获取失败: {0}")]
    LockError(String),

    /// SQLITE_BUSY / SQLITE_LOCKED，其他写者持有库锁
    #[error("数据库忙: {0}")]
    Busy(String),

    #[error("唯一约束违反: {0}")]
    UniqueConstraintViolation(String),

    #[error("外键约束违反: {0}")]
    ForeignKeyViolation(String),

    #[error("数据库查询失败: {0}")]
    DatabaseQueryError(String),
}

impl From<rusqlite::Error> for RepositoryError {
    fn from(err: rusqlite::Error) -> Self {
        use rusqlite::ErrorCode;

        match err {
            rusqlite::Error::SqliteFailure(ref code, ref msg) => {
                let text = msg.clone().unwrap_or_else(|| code.to_string());
                match code.code {
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => RepositoryError::Busy(text),
                    ErrorCode::ConstraintViolation if text.contains("UNIQUE") => {
                        RepositoryError::UniqueConstraintViolation(text)
                    }
                    ErrorCode::ConstraintViolation if text.contains("FOREIGN KEY") => {
                        RepositoryError::ForeignKeyViolation(text)
                    }
                    _ => RepositoryError::DatabaseQueryError(text),
                }
            }
            rusqlite::Error::QueryReturnedNoRows => RepositoryError::NotFound {
                entity: "row",
                key: String::new(),
            },
            other => RepositoryError::DatabaseQueryError(other.to_string()),
        }
    }
}

pub type RepositoryResult<T> = Result<T, RepositoryError>;
