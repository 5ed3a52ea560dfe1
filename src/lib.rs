// ==========================================
// 标本导入对账系统 - 核心库
// ==========================================
// 技术栈: Rust + SQLite
// 系统定位: 批量标本 / 样品管 / 事件文件落库，并重算汇总字段
// ==========================================

// ==========================================
// 模块声明
// ==========================================

// 领域层 - 列目录与字段值
pub mod domain;

// 数据仓储层 - 数据访问
pub mod repository;

// 引擎层 - 哈希 / 汇总 / 对账规则
pub mod engine;

// 导入层 - 外部数据
pub mod importer;

// 配置层 - 容器配置
pub mod config;

// 数据库基础设施（连接初始化/PRAGMA 统一/建库）
pub mod db;

// 日志系统
pub mod logging;

// 性能埋点
pub mod perf;

// ==========================================
// 重导出核心类型
// ==========================================

// 领域类型
pub use domain::{
    FieldType, FieldValue, ImportMode, ImportSummary, LookupKind, Record, SpecimenConflict,
    StagingRow, SyncCounts, TimepointType,
};

// 引擎
pub use engine::{ConflictDetector, HashComputer, RollupRegistry};

// 导入
pub use importer::{
    CancelHandle, ImportError, ImportListener, ImportResult, SpecimenImporter,
    SpecimenImporterImpl,
};

// 配置
pub use config::{ConfigManager, ImportSettings, ImportSettingsReader};

// ==========================================
// 常量定义
// ==========================================

// 系统版本
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

// 系统名称
pub const APP_NAME: &str = "标本导入对账系统";
