// ==========================================
// 标本导入对账系统 - 配置层
// ==========================================
// 职责: 容器级导入配置，支持 容器 → global → 默认值 覆写
// 存储: config_kv 表
// ==========================================

pub mod config_manager;
pub mod import_settings_trait;

// 重导出核心配置管理器
pub use config_manager::{config_keys, ConfigManager, GLOBAL_SCOPE};
pub use import_settings_trait::{ImportSettings, ImportSettingsReader};
