// ==========================================
// 标本导入对账系统 - 导入配置读取 Trait
// ==========================================
// 职责: 定义导入模块所需的容器级配置读取接口（不包含实现）
// 红线: 不包含配置写入、不包含业务逻辑
// ==========================================

use crate::domain::types::TimepointType;
use crate::importer::error::ImportResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

// ==========================================
// ImportSettings - 单次导入使用的配置快照
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSettings {
    /// 可编辑标本库（标本数据由系统内维护）
    pub editable_repository: bool,
    pub timepoint_type: TimepointType,
    /// 发现未定义访视时失败（否则自动建访视）
    pub fail_for_undefined_visits: bool,
    /// 同步受试者/访视对
    pub sync_participant_visits: bool,
}

impl Default for ImportSettings {
    fn default() -> Self {
        Self {
            editable_repository: false,
            timepoint_type: TimepointType::Visit,
            fail_for_undefined_visits: false,
            sync_participant_visits: true,
        }
    }
}

// ==========================================
// ImportSettingsReader Trait
// ==========================================
// 用途: 导入模块所需的配置读取接口
// 实现者: ConfigManager（从 config_kv 表读取）
#[async_trait]
pub trait ImportSettingsReader: Send + Sync {
    /// 读取容器配置
    ///
    /// # 查找顺序
    /// - 容器作用域 → global 作用域 → 默认值
    ///
    /// # 返回
    /// - Err(ConfigValueError): 配置值无法解析
    async fn import_settings(&self, container: &str) -> ImportResult<ImportSettings>;
}
