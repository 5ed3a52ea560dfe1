// ==========================================
// 标本导入对账系统 - 领域类型定义
// ==========================================
// 职责: 导入模式 / 时间点类型 / 字段类型 / 字段值
// 红线: 字段值的规范文本是哈希与去重的唯一口径
// ==========================================

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rusqlite::types::{ToSql, ToSqlOutput, Value, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 日期时间存储格式（秒级精度）
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// 日期存储格式
pub const DATE_FORMAT: &str = "%Y-%m-%d";
/// 时间存储格式
pub const TIME_FORMAT: &str = "%H:%M:%S";

// ==========================================
// 导入模式 (Import Mode)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ImportMode {
    Merge,   // 增量合并
    Replace, // 全量替换
}

impl fmt::Display for ImportMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ImportMode::Merge => write!(f, "MERGE"),
            ImportMode::Replace => write!(f, "REPLACE"),
        }
    }
}

// ==========================================
// 时间点类型 (Timepoint Type)
// ==========================================
// VISIT: 按访视号; DATE: 按采样日期
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimepointType {
    Visit,
    Date,
}

impl TimepointType {
    /// 从配置值解析（大小写不敏感）
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_uppercase().as_str() {
            "VISIT" => Some(TimepointType::Visit),
            "DATE" => Some(TimepointType::Date),
            _ => None,
        }
    }
}

impl fmt::Display for TimepointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimepointType::Visit => write!(f, "VISIT"),
            TimepointType::Date => write!(f, "DATE"),
        }
    }
}

// ==========================================
// 字段类型 (Field Type)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FieldType {
    Text,
    Integer,
    Float,
    Boolean,
    DateTime,
    Date,
    Time,
}

impl FieldType {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldType::Integer | FieldType::Float)
    }

    /// from 类型的值能否写入 to 类型字段（相同或数值提升 Integer → Float）
    pub fn promotes_to(self, to: FieldType) -> bool {
        self == to || (self == FieldType::Integer && to == FieldType::Float)
    }

    /// SQLite 列声明类型
    pub fn sql_type(self) -> &'static str {
        match self {
            FieldType::Text | FieldType::DateTime | FieldType::Date | FieldType::Time => "TEXT",
            FieldType::Integer | FieldType::Boolean => "INTEGER",
            FieldType::Float => "REAL",
        }
    }
}

// ==========================================
// 聚合函数 (Aggregate)
// ==========================================
// 配置了聚合函数的字段不参与标本定义（不进哈希）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AggregateFn {
    Max,
    Min,
    Sum,
}

// ==========================================
// 字段值 (Field Value)
// ==========================================
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub enum FieldValue {
    #[default]
    Null,
    Text(String),
    Integer(i64),
    Float(f64),
    Boolean(bool),
    DateTime(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
}

impl FieldValue {
    pub fn is_null(&self) -> bool {
        matches!(self, FieldValue::Null)
    }

    /// 非空且（文本时）非空白
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Text(s) => s.trim().is_empty(),
            _ => false,
        }
    }

    /// 规范文本（NULL → None）
    ///
    /// 用于: 标本哈希、COUNT(DISTINCT) 口径、新旧值比较
    pub fn canonical_text(&self) -> Option<String> {
        match self {
            FieldValue::Null => None,
            FieldValue::Text(s) => Some(s.clone()),
            FieldValue::Integer(v) => Some(v.to_string()),
            FieldValue::Float(v) => Some(v.to_string()),
            FieldValue::Boolean(b) => Some(if *b { "1" } else { "0" }.to_string()),
            FieldValue::DateTime(dt) => Some(dt.format(DATETIME_FORMAT).to_string()),
            FieldValue::Date(d) => Some(d.format(DATE_FORMAT).to_string()),
            FieldValue::Time(t) => Some(t.format(TIME_FORMAT).to_string()),
        }
    }

    /// 值相同判定（NULL 与 NULL 视为相同）
    pub fn same_as(&self, other: &FieldValue) -> bool {
        self.canonical_text() == other.canonical_text()
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s.as_str()),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::Integer(v) => Some(*v),
            FieldValue::Boolean(b) => Some(i64::from(*b)),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FieldValue::Float(v) => Some(*v),
            FieldValue::Integer(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FieldValue::Boolean(b) => Some(*b),
            FieldValue::Integer(v) => Some(*v != 0),
            _ => None,
        }
    }

    pub fn as_datetime(&self) -> Option<NaiveDateTime> {
        match self {
            FieldValue::DateTime(dt) => Some(*dt),
            FieldValue::Date(d) => d.and_hms_opt(0, 0, 0),
            _ => None,
        }
    }

    /// 数值提升: Integer 写入 Float 字段时转换
    pub fn coerce_to(self, to: FieldType) -> FieldValue {
        match (self, to) {
            (FieldValue::Integer(v), FieldType::Float) => FieldValue::Float(v as f64),
            (v, _) => v,
        }
    }

    /// 从 SQLite 读取并按声明类型还原
    ///
    /// # 说明
    /// - 类型不匹配的存量值按文本保留，不报错
    pub fn from_sql_ref(value: ValueRef<'_>, field_type: FieldType) -> FieldValue {
        match value {
            ValueRef::Null => FieldValue::Null,
            ValueRef::Integer(v) => match field_type {
                FieldType::Boolean => FieldValue::Boolean(v != 0),
                FieldType::Float => FieldValue::Float(v as f64),
                _ => FieldValue::Integer(v),
            },
            ValueRef::Real(v) => match field_type {
                FieldType::Integer => FieldValue::Integer(v as i64),
                _ => FieldValue::Float(v),
            },
            ValueRef::Text(bytes) => {
                let text = String::from_utf8_lossy(bytes).to_string();
                match field_type {
                    FieldType::DateTime => NaiveDateTime::parse_from_str(&text, DATETIME_FORMAT)
                        .map(FieldValue::DateTime)
                        .unwrap_or(FieldValue::Text(text)),
                    FieldType::Date => NaiveDate::parse_from_str(&text, DATE_FORMAT)
                        .map(FieldValue::Date)
                        .unwrap_or(FieldValue::Text(text)),
                    FieldType::Time => NaiveTime::parse_from_str(&text, TIME_FORMAT)
                        .map(FieldValue::Time)
                        .unwrap_or(FieldValue::Text(text)),
                    _ => FieldValue::Text(text),
                }
            }
            ValueRef::Blob(_) => FieldValue::Null,
        }
    }

    /// 截断到秒（存储口径为秒级）
    pub fn datetime_to_seconds(dt: NaiveDateTime) -> NaiveDateTime {
        dt.with_nanosecond(0).unwrap_or(dt)
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.canonical_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "NULL"),
        }
    }
}

impl ToSql for FieldValue {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        let value = match self {
            FieldValue::Null => Value::Null,
            FieldValue::Text(s) => return Ok(ToSqlOutput::Borrowed(ValueRef::Text(s.as_bytes()))),
            FieldValue::Integer(v) => Value::Integer(*v),
            FieldValue::Float(v) => Value::Real(*v),
            FieldValue::Boolean(b) => Value::Integer(i64::from(*b)),
            FieldValue::DateTime(_) | FieldValue::Date(_) | FieldValue::Time(_) => {
                Value::Text(self.canonical_text().unwrap_or_default())
            }
        };
        Ok(ToSqlOutput::Owned(value))
    }
}
