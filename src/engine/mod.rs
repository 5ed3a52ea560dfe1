// ==========================================
// 标本导入对账系统 - 引擎层
// ==========================================
// 职责: 标本哈希 / 汇总规则 / 分组对账 / 冲突检测 / 样品管派生规则
// 红线: Engine 不拼 SQL, 不持有连接
// ==========================================

pub mod conflict_detector;
pub mod rollup;
pub mod set_reconciler;
pub mod specimen_hash;
pub mod vial_derivation;

// 重导出核心引擎
pub use conflict_detector::ConflictDetector;
pub use rollup::{
    build_rollups, Rollup, RollupDirection, RollupError, RollupInstance, RollupMap,
    RollupRegistry,
};
pub use set_reconciler::{
    defining_values_by_vial, project_specimens, project_vials, reconcile_values,
    SpecimenCandidate, VialCandidate,
};
pub use specimen_hash::HashComputer;
pub use vial_derivation::{derive_vial_fields, sort_events_chronologically, RepositoryFlags};
