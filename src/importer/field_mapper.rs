// ==========================================
// 标本导入对账系统 - 字段映射器实现
// ==========================================
// 职责: 表头 → 列目录映射（大小写不敏感 + 别名）+ 类型转换 + 长度校验
// 红线: 未识别的表头忽略（只记 debug 日志），不报错
// ==========================================

use crate::domain::columns::{LookupKind, COL_EXTERNAL_ID, SPECIMEN_COLUMNS};
use crate::domain::record::{Record, StagingRow};
use crate::domain::types::{FieldType, FieldValue};
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::file_parser::RawTable;
use crate::importer::specimen_importer_trait::FieldMapper as FieldMapperTrait;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::collections::HashSet;
use tracing::debug;

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%d %H:%M",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%m/%d/%Y", "%Y%m%d"];

const TIME_FORMATS: &[&str] = &["%H:%M:%S", "%H:%M"];

// ==========================================
// 映射结果
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct MappedSpecimens {
    pub source: String,
    /// 本文件声明的存储列名
    pub declared: HashSet<String>,
    pub rows: Vec<StagingRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedLookup {
    pub source: String,
    pub kind: LookupKind,
    pub rows: Vec<StagingRow>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MappedTable {
    Lookup(MappedLookup),
    Specimens(MappedSpecimens),
}

/// 按字段类型解析单元格
///
/// # 参数
/// - raw: 已去除首尾空白的原始文本（空串 → NULL）
/// - max_len: 文本长度上限（按字符计）
pub fn parse_value(
    raw: &str,
    field_type: FieldType,
    max_len: Option<usize>,
    row: usize,
    field: &str,
) -> ImportResult<FieldValue> {
    let value = raw.trim();
    if value.is_empty() {
        return Ok(FieldValue::Null);
    }

    let conversion_error = || ImportError::TypeConversionError {
        row,
        field: field.to_string(),
        value: value.to_string(),
    };

    match field_type {
        FieldType::Text => {
            let len = value.chars().count();
            match max_len {
                Some(max) if len > max => Err(ImportError::ValueTooLong {
                    row,
                    field: field.to_string(),
                    len,
                    max,
                }),
                _ => Ok(FieldValue::Text(value.to_string())),
            }
        }
        FieldType::Integer => value
            .parse::<i64>()
            .ok()
            .or_else(|| {
                value
                    .parse::<f64>()
                    .ok()
                    .filter(|f| f.fract() == 0.0)
                    .map(|f| f as i64)
            })
            .map(FieldValue::Integer)
            .ok_or_else(conversion_error),
        FieldType::Float => value
            .parse::<f64>()
            .map(FieldValue::Float)
            .map_err(|_| conversion_error()),
        FieldType::Boolean => match value.to_lowercase().as_str() {
            "1" | "true" | "t" | "yes" | "y" => Ok(FieldValue::Boolean(true)),
            "0" | "false" | "f" | "no" | "n" => Ok(FieldValue::Boolean(false)),
            _ => Err(conversion_error()),
        },
        FieldType::DateTime => parse_datetime(value)
            .map(|dt| FieldValue::DateTime(FieldValue::datetime_to_seconds(dt)))
            .ok_or_else(conversion_error),
        FieldType::Date => DATE_FORMATS
            .iter()
            .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
            .map(FieldValue::Date)
            .ok_or_else(conversion_error),
        FieldType::Time => TIME_FORMATS
            .iter()
            .find_map(|f| NaiveTime::parse_from_str(value, f).ok())
            .map(FieldValue::Time)
            .ok_or_else(conversion_error),
    }
}

/// 解析日期时间；仅有日期时取零点
fn parse_datetime(value: &str) -> Option<NaiveDateTime> {
    DATETIME_FORMATS
        .iter()
        .find_map(|f| NaiveDateTime::parse_from_str(value, f).ok())
        .or_else(|| {
            DATE_FORMATS
                .iter()
                .find_map(|f| NaiveDate::parse_from_str(value, f).ok())
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

pub struct FieldMapper;

impl FieldMapper {
    /// 标本文件映射
    fn map_specimens(&self, raw: &RawTable) -> ImportResult<MappedSpecimens> {
        let bindings: Vec<Option<usize>> = raw
            .headers
            .iter()
            .map(|h| SPECIMEN_COLUMNS.iter().position(|c| c.matches_header(h)))
            .collect();
        self.log_unmatched(raw, &bindings);

        let declared: HashSet<String> = bindings
            .iter()
            .flatten()
            .map(|idx| SPECIMEN_COLUMNS[*idx].db_name.to_string())
            .collect();

        let mut rows = Vec::with_capacity(raw.rows.len());
        for (line, values) in &raw.rows {
            let mut record = Record::new();
            for (value, binding) in values.iter().zip(&bindings) {
                let column = match binding {
                    Some(idx) => &SPECIMEN_COLUMNS[*idx],
                    None => continue,
                };
                if record.contains(column.db_name) {
                    continue;
                }
                let parsed = parse_value(value, column.field_type, column.max_len, *line, column.tsv_name)?;
                record.set(column.db_name, parsed);
            }
            rows.push(StagingRow::new(*line, record));
        }

        Ok(MappedSpecimens {
            source: raw.source.clone(),
            declared,
            rows,
        })
    }

    /// 查找表文件映射（外部 ID 必填）
    fn map_lookup(&self, raw: &RawTable, kind: LookupKind) -> ImportResult<MappedLookup> {
        let columns = kind.columns();
        let bindings: Vec<Option<usize>> = raw
            .headers
            .iter()
            .map(|h| columns.iter().position(|c| c.matches_header(h)))
            .collect();
        self.log_unmatched(raw, &bindings);

        let external_id = columns
            .iter()
            .position(|c| c.db_name == COL_EXTERNAL_ID)
            .ok_or_else(|| ImportError::MissingColumn(COL_EXTERNAL_ID.to_string()))?;
        if !bindings.contains(&Some(external_id)) {
            return Err(ImportError::MissingColumn(format!(
                "{} ({})",
                columns[external_id].tsv_name, raw.source
            )));
        }

        let mut rows = Vec::with_capacity(raw.rows.len());
        for (line, values) in &raw.rows {
            let mut record = Record::new();
            for (value, binding) in values.iter().zip(&bindings) {
                let column = match binding {
                    Some(idx) => &columns[*idx],
                    None => continue,
                };
                if record.contains(column.db_name) {
                    continue;
                }
                let parsed = parse_value(value, column.field_type, column.max_len, *line, column.tsv_name)?;
                record.set(column.db_name, parsed);
            }
            if record.get(COL_EXTERNAL_ID).is_null() {
                return Err(ImportError::RequiredValueMissing {
                    row: *line,
                    field: columns[external_id].tsv_name.to_string(),
                });
            }
            rows.push(StagingRow::new(*line, record));
        }

        Ok(MappedLookup {
            source: raw.source.clone(),
            kind,
            rows,
        })
    }

    fn log_unmatched(&self, raw: &RawTable, bindings: &[Option<usize>]) {
        for (header, binding) in raw.headers.iter().zip(bindings) {
            if binding.is_none() && !header.is_empty() {
                debug!(source = %raw.source, header = %header, "忽略未识别的列");
            }
        }
    }
}

impl FieldMapperTrait for FieldMapper {
    fn map_table(&self, raw: &RawTable) -> ImportResult<MappedTable> {
        match raw.table.lookup_kind() {
            Some(kind) => Ok(MappedTable::Lookup(self.map_lookup(raw, kind)?)),
            None => Ok(MappedTable::Specimens(self.map_specimens(raw)?)),
        }
    }
}
