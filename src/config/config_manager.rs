// ==========================================
// 标本导入对账系统 - 配置管理器
// ==========================================
// 职责: 配置查询、覆写管理
// 存储: config_kv 表 (scope_id + key → value)
// 作用域: 容器 ID 或 'global'
// ==========================================

use crate::config::import_settings_trait::{ImportSettings, ImportSettingsReader};
use crate::db::open_sqlite_connection;
use crate::domain::types::TimepointType;
use crate::importer::error::{ImportError, ImportResult};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// 全局作用域
pub const GLOBAL_SCOPE: &str = "global";

// ==========================================
// 配置键常量
// ==========================================
pub mod config_keys {
    // 标本库
    pub const EDITABLE_REPOSITORY: &str = "specimen.editable_repository";
    pub const FAIL_FOR_UNDEFINED_VISITS: &str = "specimen.fail_for_undefined_visits";

    // 研究
    pub const TIMEPOINT_TYPE: &str = "study.timepoint_type";
    pub const SYNC_PARTICIPANT_VISITS: &str = "study.sync_participant_visits";
}

fn parse_bool(key: &str, value: &str) -> ImportResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "y" | "on" => Ok(true),
        "0" | "false" | "no" | "n" | "off" => Ok(false),
        _ => Err(ImportError::ConfigValueError {
            key: key.to_string(),
            value: value.to_string(),
            message: "应为布尔值".to_string(),
        }),
    }
}

// ==========================================
// ConfigManager - 配置管理器
// ==========================================
pub struct ConfigManager {
    conn: Arc<Mutex<Connection>>,
}

impl ConfigManager {
    /// 创建新的 ConfigManager 实例
    ///
    /// # 参数
    /// - db_path: 数据库文件路径
    pub fn new(db_path: &str) -> ImportResult<Self> {
        let conn = open_sqlite_connection(db_path)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 从已有连接创建 ConfigManager
    ///
    /// 说明：会对传入连接再次应用统一 PRAGMA（幂等）。
    pub fn from_connection(conn: Arc<Mutex<Connection>>) -> ImportResult<Self> {
        {
            let conn_guard = conn
                .lock()
                .map_err(|e| ImportError::LockError(e.to_string()))?;
            crate::db::configure_sqlite_connection(&conn_guard)?;
        }

        Ok(Self { conn })
    }

    /// 读取单一作用域的配置值
    ///
    /// # 返回
    /// - Some(String): 配置值
    /// - None: 配置不存在
    pub fn get_scoped(&self, scope_id: &str, key: &str) -> ImportResult<Option<String>> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ImportError::LockError(e.to_string()))?;

        let value = conn
            .query_row(
                "SELECT value FROM config_kv WHERE scope_id = ?1 AND key = ?2",
                params![scope_id, key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// 读取配置值: 容器作用域优先，其次 global
    pub fn get(&self, container: &str, key: &str) -> ImportResult<Option<String>> {
        match self.get_scoped(container, key)? {
            Some(value) => Ok(Some(value)),
            None => self.get_scoped(GLOBAL_SCOPE, key),
        }
    }

    /// 写入配置值（UPSERT）
    pub fn set(&self, scope_id: &str, key: &str, value: &str) -> ImportResult<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ImportError::LockError(e.to_string()))?;

        conn.execute(
            "INSERT INTO config_kv (scope_id, key, value, updated_at) VALUES (?1, ?2, ?3, datetime('now'))
             ON CONFLICT(scope_id, key) DO UPDATE SET value = ?3, updated_at = datetime('now')",
            params![scope_id, key, value],
        )?;
        Ok(())
    }

    /// 某作用域全部配置的快照（JSON）
    pub fn get_config_snapshot(&self, scope_id: &str) -> ImportResult<String> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| ImportError::LockError(e.to_string()))?;

        let mut stmt =
            conn.prepare("SELECT key, value FROM config_kv WHERE scope_id = ?1 ORDER BY key")?;
        let rows = stmt.query_map(params![scope_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut config_map: BTreeMap<String, String> = BTreeMap::new();
        for row in rows {
            let (key, value) = row?;
            config_map.insert(key, value);
        }

        serde_json::to_string(&json!(config_map)).map_err(|e| ImportError::Other(e.into()))
    }

    fn get_bool_or(&self, container: &str, key: &str, default: bool) -> ImportResult<bool> {
        match self.get(container, key)? {
            Some(value) => parse_bool(key, &value),
            None => Ok(default),
        }
    }
}

#[async_trait]
impl ImportSettingsReader for ConfigManager {
    async fn import_settings(&self, container: &str) -> ImportResult<ImportSettings> {
        let defaults = ImportSettings::default();

        let timepoint_type = match self.get(container, config_keys::TIMEPOINT_TYPE)? {
            Some(raw) => TimepointType::parse(&raw).ok_or_else(|| ImportError::ConfigValueError {
                key: config_keys::TIMEPOINT_TYPE.to_string(),
                value: raw.clone(),
                message: "应为 VISIT 或 DATE".to_string(),
            })?,
            None => defaults.timepoint_type,
        };

        Ok(ImportSettings {
            editable_repository: self.get_bool_or(
                container,
                config_keys::EDITABLE_REPOSITORY,
                defaults.editable_repository,
            )?,
            timepoint_type,
            fail_for_undefined_visits: self.get_bool_or(
                container,
                config_keys::FAIL_FOR_UNDEFINED_VISITS,
                defaults.fail_for_undefined_visits,
            )?,
            sync_participant_visits: self.get_bool_or(
                container,
                config_keys::SYNC_PARTICIPANT_VISITS,
                defaults.sync_participant_visits,
            )?,
        })
    }
}
