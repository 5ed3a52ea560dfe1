// ==========================================
// 标本导入对账系统 - 文件解析器实现
// ==========================================
// 格式: 首行 `#表名` + 表头行 + 制表符分隔数据行
// 职责: 识别目标表 / 读取表头 / 读取数据行（跳过空白行）
// ==========================================

use crate::domain::columns::LookupKind;
use crate::importer::error::{ImportError, ImportResult};
use crate::importer::specimen_importer_trait::FileParser;
use csv::ReaderBuilder;
use std::fmt;
use std::fs;
use std::path::Path;

// ==========================================
// ImportTable - 文件目标表
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImportTable {
    Labs,
    Additives,
    Derivatives,
    PrimaryTypes,
    Specimens,
}

impl ImportTable {
    /// 从首行注释中的表名解析（大小写不敏感）
    pub fn parse(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "labs" => Some(ImportTable::Labs),
            "additives" => Some(ImportTable::Additives),
            "derivatives" => Some(ImportTable::Derivatives),
            "primary_types" => Some(ImportTable::PrimaryTypes),
            "specimens" => Some(ImportTable::Specimens),
            _ => None,
        }
    }

    pub fn lookup_kind(self) -> Option<LookupKind> {
        match self {
            ImportTable::Labs => Some(LookupKind::Location),
            ImportTable::Additives => Some(LookupKind::Additive),
            ImportTable::Derivatives => Some(LookupKind::Derivative),
            ImportTable::PrimaryTypes => Some(LookupKind::PrimaryType),
            ImportTable::Specimens => None,
        }
    }
}

impl fmt::Display for ImportTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ImportTable::Labs => "labs",
            ImportTable::Additives => "additives",
            ImportTable::Derivatives => "derivatives",
            ImportTable::PrimaryTypes => "primary_types",
            ImportTable::Specimens => "specimens",
        };
        write!(f, "{}", name)
    }
}

// ==========================================
// RawTable - 解析结果（未做类型转换）
// ==========================================
#[derive(Debug, Clone, PartialEq)]
pub struct RawTable {
    /// 来源（文件路径或调用方给定名称）
    pub source: String,
    pub table: ImportTable,
    pub headers: Vec<String>,
    /// (文件行号, 按表头对齐的取值)
    pub rows: Vec<(usize, Vec<String>)>,
}

// ==========================================
// TsvParser - 制表符分隔文件解析器
// ==========================================
pub struct TsvParser;

impl TsvParser {
    /// 解析文本内容
    ///
    /// # 参数
    /// - source: 来源描述（用于错误信息）
    /// - content: 文件全文
    pub fn parse_str(&self, source: &str, content: &str) -> ImportResult<RawTable> {
        let content = content.trim_start_matches('\u{feff}');
        let (first_line, rest) = match content.split_once('\n') {
            Some((first, rest)) => (first.trim(), rest),
            None => (content.trim(), ""),
        };

        let table_name = first_line
            .strip_prefix('#')
            .ok_or_else(|| ImportError::MissingTableName(source.to_string()))?;
        let table = ImportTable::parse(table_name)
            .ok_or_else(|| ImportError::UnknownImportTable(table_name.trim().to_string()))?;

        let mut reader = ReaderBuilder::new()
            .delimiter(b'\t')
            .has_headers(true)
            .flexible(true) // 允许行长度不一致
            .quoting(false)
            .from_reader(rest.as_bytes());

        let headers: Vec<String> = reader
            .headers()?
            .iter()
            .map(|h| h.trim().to_string())
            .collect();

        let mut rows = Vec::new();
        for result in reader.records() {
            let record = result?;
            // 表名行占一行
            let line = record.position().map(|p| p.line() as usize + 1).unwrap_or(0);
            let values: Vec<String> = (0..headers.len())
                .map(|idx| record.get(idx).unwrap_or("").trim().to_string())
                .collect();

            // 跳过完全空白的行
            if values.iter().all(|v| v.is_empty()) {
                continue;
            }
            rows.push((line, values));
        }

        Ok(RawTable {
            source: source.to_string(),
            table,
            headers,
            rows,
        })
    }
}

impl FileParser for TsvParser {
    fn parse_file(&self, path: &Path) -> ImportResult<RawTable> {
        if !path.exists() {
            return Err(ImportError::FileNotFound(path.display().to_string()));
        }
        let content = fs::read_to_string(path)?;
        self.parse_str(&path.display().to_string(), &content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::importer::error::ErrorKind;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_parse_valid_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "# Labs").unwrap();
        writeln!(temp_file, "lab_id\tlab_name\tis_repository").unwrap();
        writeln!(temp_file, "1\tLab A\t1").unwrap();
        writeln!(temp_file, "2\tLab B\t0").unwrap();

        let parsed = TsvParser.parse_file(temp_file.path()).unwrap();
        assert_eq!(parsed.table, ImportTable::Labs);
        assert_eq!(parsed.headers, vec!["lab_id", "lab_name", "is_repository"]);
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].1[1], "Lab A");
        assert_eq!(parsed.rows[0].0, 3);
    }

    #[test]
    fn test_missing_table_comment() {
        let err = TsvParser.parse_str("inline", "lab_id\tlab_name\n1\tA\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("comment indicating table name"));
    }

    #[test]
    fn test_unknown_table_is_configuration_error() {
        let err = TsvParser.parse_str("inline", "#freezers\nid\n1\n").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Configuration);
    }

    #[test]
    fn test_skip_blank_rows_and_pad_short_rows() {
        let content = "#specimens\nrecord_id\tptid\tcomments\n1\t101\n\t\t\n2\t102\tok\n";
        let parsed = TsvParser.parse_str("inline", content).unwrap();
        assert_eq!(parsed.rows.len(), 2);
        assert_eq!(parsed.rows[0].1, vec!["1", "101", ""]);
        assert_eq!(parsed.rows[1].1[2], "ok");
    }

    #[test]
    fn test_file_not_found() {
        let result = TsvParser.parse_file(Path::new("non_existent.tsv"));
        assert!(matches!(result, Err(ImportError::FileNotFound(_))));
    }
}
