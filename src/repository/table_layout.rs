// ==========================================
// 标本导入对账系统 - 三层主表列布局
// ==========================================
// 职责: 由列目录生成 specimen / vial / specimen_event 的存储列
// 红线: 建表 DDL、读取、写入共用同一布局，不单独维护列清单
// ==========================================

use crate::domain::columns::{
    event_target_columns, LookupKind, specimen_target_columns, vial_target_columns, COL_AVAILABLE,
    COL_DRAW_DATE, COL_DRAW_TIME, COL_FIRST_PROCESSED_BY_INITIALS, COL_GLOBAL_UNIQUE_ID,
    COL_LOCKED_IN_REQUEST, COL_LSID, COL_OBSOLETE, COL_PARTICIPANT_SEQUENCE_NUM,
    COL_PROCESSING_LOCATION, COL_SPECIMEN_HASH, COL_VIAL_COUNT, SPECIMEN_ROLLUP_TARGETS,
    VIAL_DERIVED_COLUMNS, VIAL_ROLLUP_TARGETS,
};
use crate::domain::types::FieldType;

pub const TABLE_SPECIMEN: &str = "specimen";
pub const TABLE_VIAL: &str = "vial";
pub const TABLE_EVENT: &str = "specimen_event";

pub const COL_SPECIMEN_ID: &str = "specimen_id";
pub const COL_ENTITY_ID: &str = "entity_id";
pub const COL_VIAL_ID: &str = "vial_id";

// ==========================================
// TableLayout
// ==========================================
// 不含 row_id / container（所有表固定携带）
#[derive(Debug, Clone, PartialEq)]
pub struct TableLayout {
    pub name: &'static str,
    pub columns: Vec<(&'static str, FieldType)>,
}

impl TableLayout {
    pub fn field_type(&self, column: &str) -> Option<FieldType> {
        self.columns
            .iter()
            .find(|(name, _)| *name == column)
            .map(|(_, t)| *t)
    }

    fn push(&mut self, name: &'static str, field_type: FieldType) {
        if self.field_type(name).is_none() {
            self.columns.push((name, field_type));
        }
    }

    /// 标本表: 哈希 + 标本目标列 + 采样日期/时间 + 派生列 + 汇总列
    pub fn specimen() -> Self {
        let mut layout = TableLayout {
            name: TABLE_SPECIMEN,
            columns: vec![(COL_SPECIMEN_HASH, FieldType::Text)],
        };
        for column in specimen_target_columns() {
            layout.push(column.db_name, column.field_type);
        }
        layout.push(COL_DRAW_DATE, FieldType::Date);
        layout.push(COL_DRAW_TIME, FieldType::Time);
        layout.push(COL_PARTICIPANT_SEQUENCE_NUM, FieldType::Text);
        layout.push(COL_PROCESSING_LOCATION, FieldType::Integer);
        layout.push(COL_FIRST_PROCESSED_BY_INITIALS, FieldType::Text);
        layout.push(COL_VIAL_COUNT, FieldType::Integer);
        for (name, field_type) in SPECIMEN_ROLLUP_TARGETS {
            layout.push(name, *field_type);
        }
        layout
    }

    /// 样品管表: 标识 + 所属标本 + 样品管目标列 + 状态列 + 派生列 + 汇总列
    pub fn vial() -> Self {
        let mut layout = TableLayout {
            name: TABLE_VIAL,
            columns: vec![
                (COL_GLOBAL_UNIQUE_ID, FieldType::Text),
                (COL_LSID, FieldType::Text),
                (COL_SPECIMEN_ID, FieldType::Integer),
                (COL_SPECIMEN_HASH, FieldType::Text),
            ],
        };
        for column in vial_target_columns() {
            layout.push(column.db_name, column.field_type);
        }
        layout.push(COL_AVAILABLE, FieldType::Boolean);
        layout.push(COL_LOCKED_IN_REQUEST, FieldType::Boolean);
        for (name, field_type) in VIAL_DERIVED_COLUMNS {
            layout.push(name, *field_type);
        }
        for (name, field_type) in VIAL_ROLLUP_TARGETS {
            layout.push(name, *field_type);
        }
        layout
    }

    /// 事件表: 所属样品管 + 事件目标列 + 作废标记
    pub fn event() -> Self {
        let mut layout = TableLayout {
            name: TABLE_EVENT,
            columns: vec![(COL_VIAL_ID, FieldType::Integer)],
        };
        for column in event_target_columns() {
            layout.push(column.db_name, column.field_type);
        }
        layout.push(COL_OBSOLETE, FieldType::Boolean);
        layout
    }

    /// 查找表: 实体 ID + 查找表目录列（建表见 db::init_schema）
    pub fn lookup(kind: LookupKind) -> Self {
        let mut layout = TableLayout {
            name: kind.table_name(),
            columns: vec![(COL_ENTITY_ID, FieldType::Text)],
        };
        for column in kind.columns() {
            layout.push(column.db_name, column.field_type);
        }
        layout
    }

    /// 建表语句
    pub fn create_table_sql(&self) -> String {
        let mut sql = format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    row_id INTEGER PRIMARY KEY AUTOINCREMENT,\n    container TEXT NOT NULL",
            self.name
        );
        for (name, field_type) in &self.columns {
            sql.push_str(",\n    ");
            sql.push_str(name);
            sql.push(' ');
            sql.push_str(field_type.sql_type());
            match *name {
                COL_SPECIMEN_ID => sql.push_str(" NOT NULL REFERENCES specimen(row_id)"),
                COL_VIAL_ID => sql.push_str(" NOT NULL REFERENCES vial(row_id)"),
                COL_SPECIMEN_HASH | COL_GLOBAL_UNIQUE_ID | COL_LSID => sql.push_str(" NOT NULL"),
                COL_AVAILABLE | COL_LOCKED_IN_REQUEST | COL_OBSOLETE => {
                    sql.push_str(" NOT NULL DEFAULT 0")
                }
                COL_VIAL_COUNT => sql.push_str(" NOT NULL DEFAULT 0"),
                _ => {}
            }
        }
        sql.push_str("\n)");
        sql
    }
}
