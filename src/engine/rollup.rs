// ==========================================
// 标本导入对账系统 - 汇总规则注册表
// ==========================================
// 职责: 固定的汇总规则目录（按名称模式 + 类型兼容匹配字段对）
//       + 规则求值（事件 → 样品管 / 样品管 → 标本）
//       + 匹配结果缓存（按 方向 + 来源/目标字段集）
// 红线: 规则集合封闭，新增规则只能在此枚举中添加
// ==========================================

use crate::domain::columns::FieldDef;
use crate::domain::record::Record;
use crate::domain::types::{FieldType, FieldValue};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

/// 汇总求值错误
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RollupError {
    #[error("汇总规则 {rollup:?} 不支持字段 {field} 的类型 {field_type:?}")]
    UnsupportedType {
        rollup: Rollup,
        field: String,
        field_type: FieldType,
    },
}

// ==========================================
// 汇总方向
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RollupDirection {
    EventToVial,
    VialToSpecimen,
}

// ==========================================
// Rollup - 汇总规则
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Rollup {
    // ===== 事件 → 样品管 =====
    Latest,
    First,
    LatestNonBlank,
    CombineAll,
    // ===== 样品管 → 标本 =====
    Count,
    Total,
    Max,
    Min,
}

impl Rollup {
    /// 某方向下可用的规则（按匹配优先级）
    pub fn for_direction(direction: RollupDirection) -> &'static [Rollup] {
        match direction {
            RollupDirection::EventToVial => &[
                Rollup::Latest,
                Rollup::First,
                Rollup::LatestNonBlank,
                Rollup::CombineAll,
            ],
            RollupDirection::VialToSpecimen => {
                &[Rollup::Count, Rollup::Total, Rollup::Max, Rollup::Min]
            }
        }
    }

    /// 名称模式（% 替换为来源字段名）
    pub fn patterns(self) -> &'static [&'static str] {
        match self {
            Rollup::Latest => &["%", "latest_%"],
            Rollup::First => &["first_%"],
            Rollup::LatestNonBlank => &["latest_non_blank_%"],
            Rollup::CombineAll => &["combine_all_%"],
            Rollup::Count => &["count_%", "%_count"],
            Rollup::Total => &["total_%", "%_total"],
            Rollup::Max => &["max_%", "%_max"],
            Rollup::Min => &["min_%", "%_min"],
        }
    }

    /// 类型约束
    pub fn types_compatible(self, from: FieldType, to: FieldType) -> bool {
        match self {
            Rollup::Latest | Rollup::First | Rollup::LatestNonBlank => from.promotes_to(to),
            Rollup::CombineAll => {
                from.promotes_to(to) && (from == FieldType::Text || from.is_numeric())
            }
            Rollup::Count => from == FieldType::Boolean && to == FieldType::Integer,
            Rollup::Total => from.is_numeric() && to.is_numeric() && from.promotes_to(to),
            Rollup::Max | Rollup::Min => {
                from != FieldType::Boolean && to != FieldType::Boolean && from.promotes_to(to)
            }
        }
    }

    /// 名称匹配（大小写不敏感）
    pub fn name_matches(self, from_name: &str, to_name: &str) -> bool {
        self.patterns()
            .iter()
            .any(|p| p.replace('%', from_name).eq_ignore_ascii_case(to_name))
    }

    /// 判断 (from, to) 字段对是否适用本规则
    ///
    /// # 参数
    /// - allow_type_mismatch: 仅探测名称适用性时为 true
    pub fn matches(self, from: &FieldDef, to: &FieldDef, allow_type_mismatch: bool) -> bool {
        self.name_matches(&from.name, &to.name)
            && (allow_type_mismatch || self.types_compatible(from.field_type, to.field_type))
    }

    /// 在有序子记录上求值
    ///
    /// # 参数
    /// - records: 事件按时间升序 / 样品管任意顺序
    /// - field: 来源字段
    pub fn evaluate(self, records: &[&Record], field: &FieldDef) -> Result<FieldValue, RollupError> {
        let name = field.name.as_str();
        let value = match self {
            Rollup::Latest => records.last().map(|r| r.get(name).clone()).unwrap_or_default(),
            Rollup::First => records.first().map(|r| r.get(name).clone()).unwrap_or_default(),
            Rollup::LatestNonBlank => records
                .iter()
                .rev()
                .map(|r| r.get(name))
                .find(|v| !v.is_blank())
                .cloned()
                .unwrap_or_default(),
            Rollup::CombineAll => self.combine_all(records, field)?,
            Rollup::Count => {
                let count = records
                    .iter()
                    .filter(|r| r.get(name).as_bool() == Some(true))
                    .count();
                FieldValue::Integer(count as i64)
            }
            Rollup::Total => sum_numeric(records.iter().map(|r| r.get(name)), field.field_type),
            Rollup::Max => extremum(records.iter().map(|r| r.get(name)), true),
            Rollup::Min => extremum(records.iter().map(|r| r.get(name)), false),
        };
        Ok(value)
    }

    fn combine_all(self, records: &[&Record], field: &FieldDef) -> Result<FieldValue, RollupError> {
        let name = field.name.as_str();
        match field.field_type {
            FieldType::Text => {
                let parts: Vec<&str> = records
                    .iter()
                    .filter_map(|r| r.get(name).as_text())
                    .filter(|s| !s.trim().is_empty())
                    .collect();
                if parts.is_empty() {
                    Ok(FieldValue::Null)
                } else {
                    Ok(FieldValue::Text(parts.join(", ")))
                }
            }
            FieldType::Integer | FieldType::Float => Ok(sum_numeric(
                records.iter().map(|r| r.get(name)),
                field.field_type,
            )),
            other => Err(RollupError::UnsupportedType {
                rollup: self,
                field: field.name.clone(),
                field_type: other,
            }),
        }
    }
}

/// 数值求和（忽略 NULL；全 NULL → NULL）
fn sum_numeric<'a>(values: impl Iterator<Item = &'a FieldValue>, field_type: FieldType) -> FieldValue {
    let mut int_sum: i64 = 0;
    let mut float_sum: f64 = 0.0;
    let mut any = false;
    for value in values {
        match value {
            FieldValue::Integer(v) => {
                int_sum = int_sum.saturating_add(*v);
                float_sum += *v as f64;
                any = true;
            }
            FieldValue::Float(v) => {
                float_sum += *v;
                any = true;
            }
            _ => {}
        }
    }
    if !any {
        return FieldValue::Null;
    }
    if field_type == FieldType::Integer {
        FieldValue::Integer(int_sum)
    } else {
        FieldValue::Float(float_sum)
    }
}

/// 极值（忽略 NULL）: 数值按大小，其余按规范文本
fn extremum<'a>(values: impl Iterator<Item = &'a FieldValue>, max: bool) -> FieldValue {
    let mut best: Option<&FieldValue> = None;
    for value in values.filter(|v| !v.is_null()) {
        best = match best {
            None => Some(value),
            Some(current) => {
                let greater = match (value.as_f64(), current.as_f64()) {
                    (Some(a), Some(b)) => a > b,
                    _ => value.canonical_text() > current.canonical_text(),
                };
                let less = match (value.as_f64(), current.as_f64()) {
                    (Some(a), Some(b)) => a < b,
                    _ => value.canonical_text() < current.canonical_text(),
                };
                if (max && greater) || (!max && less) {
                    Some(value)
                } else {
                    Some(current)
                }
            }
        };
    }
    best.cloned().unwrap_or_default()
}

// ==========================================
// RollupInstance - 具体字段对绑定
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct RollupInstance {
    pub from: FieldDef,
    pub to: FieldDef,
    pub rollup: Rollup,
}

impl RollupInstance {
    /// 求值并按目标类型提升
    pub fn evaluate(&self, records: &[&Record]) -> Result<FieldValue, RollupError> {
        Ok(self
            .rollup
            .evaluate(records, &self.from)?
            .coerce_to(self.to.field_type))
    }
}

/// 来源字段 → 汇总绑定
pub type RollupMap = HashMap<String, Vec<RollupInstance>>;

/// 计算字段对匹配
///
/// # 规则
/// - 每个目标字段绑定第一个匹配的 (来源字段, 规则)
pub fn build_rollups(direction: RollupDirection, from: &[FieldDef], to: &[FieldDef]) -> RollupMap {
    let mut map: RollupMap = HashMap::new();
    for target in to {
        let found = from.iter().find_map(|source| {
            Rollup::for_direction(direction)
                .iter()
                .find(|r| r.matches(source, target, false))
                .map(|r| (source, *r))
        });
        if let Some((source, rollup)) = found {
            map.entry(source.name.clone()).or_default().push(RollupInstance {
                from: source.clone(),
                to: target.clone(),
                rollup,
            });
        }
    }
    map
}

// ==========================================
// RollupRegistry - 匹配缓存
// ==========================================
type CacheKey = (RollupDirection, Vec<FieldDef>, Vec<FieldDef>);

#[derive(Debug, Default, Clone)]
pub struct RollupRegistry {
    cache: Arc<Mutex<HashMap<CacheKey, Arc<RollupMap>>>>,
}

impl RollupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// 获取（或首次计算并缓存）字段对匹配结果
    pub fn rollups(&self, direction: RollupDirection, from: &[FieldDef], to: &[FieldDef]) -> Arc<RollupMap> {
        let key = (direction, from.to_vec(), to.to_vec());
        if let Ok(cache) = self.cache.lock() {
            if let Some(hit) = cache.get(&key) {
                return Arc::clone(hit);
            }
        }

        let built = Arc::new(build_rollups(direction, from, to));
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(key, Arc::clone(&built));
        }
        built
    }

    pub fn cached_entries(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}
