// ==========================================
// 标本导入对账系统 - 标本三层主表 Repository Trait
// ==========================================
// 职责: 定义只读查询接口（写入在导入事务内通过 *_tx 函数完成）
// 红线: Repository 不含业务规则，只做数据访问
// ==========================================

use crate::domain::record::StoredRow;
use crate::repository::error::RepositoryResult;
use async_trait::async_trait;

// ==========================================
// SpecimenRepository Trait
// ==========================================
// 用途: 导入结果查询（CLI / 测试 / 外部调用方）
// 实现者: SpecimenRepositoryImpl（使用 rusqlite）
#[async_trait]
pub trait SpecimenRepository: Send + Sync {
    // ===== 计数 =====
    async fn count_specimens(&self, container: &str) -> RepositoryResult<usize>;

    async fn count_vials(&self, container: &str) -> RepositoryResult<usize>;

    async fn count_events(&self, container: &str) -> RepositoryResult<usize>;

    // ===== 查询 =====

    /// 按 GlobalUniqueId 查询样品管
    ///
    /// # 返回
    /// - Ok(None): 不存在
    async fn find_vial(&self, container: &str, global_unique_id: &str) -> RepositoryResult<Option<StoredRow>>;

    async fn find_specimen(&self, row_id: i64) -> RepositoryResult<Option<StoredRow>>;

    /// 容器内全部标本（按 row_id）
    async fn list_specimens(&self, container: &str) -> RepositoryResult<Vec<StoredRow>>;

    /// 容器内全部样品管（按 row_id）
    async fn list_vials(&self, container: &str) -> RepositoryResult<Vec<StoredRow>>;

    /// 某样品管的事件（按 row_id，未做时间排序）
    async fn list_events_for_vial(&self, vial_row_id: i64) -> RepositoryResult<Vec<StoredRow>>;
}
