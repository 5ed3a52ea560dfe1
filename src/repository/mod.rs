// ==========================================
// 标本导入对账系统 - 数据仓储层
// ==========================================
// 红线: Repository 不含业务逻辑
// ==========================================
// 职责: 提供数据访问接口,屏蔽数据库细节
// 约束: 所有查询使用参数化,防止 SQL 注入
// 写入: 导入事务内的 *_tx 函数，由调用方持有事务
// ==========================================

pub mod error;
pub mod lookup_repo;
pub mod request_repo;
pub mod row_store;
pub mod specimen_repo;
pub mod specimen_repo_impl;
pub mod study_repo;
pub mod table_layout;

// 重导出核心仓储
pub use error::{RepositoryError, RepositoryResult};
pub use lookup_repo::LookupRepository;
pub use request_repo::RequestRepository;
pub use specimen_repo::SpecimenRepository;
pub use specimen_repo_impl::SpecimenRepositoryImpl;
pub use study_repo::StudyRepository;
pub use table_layout::TableLayout;
