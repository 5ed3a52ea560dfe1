// ==========================================
// 标本导入对账系统 - 可导入列目录
// ==========================================
// 职责: 标本文件列定义（文件列名/别名/存储列名/类型/落库目标/聚合/外键）
//       + 查找表（实验室/添加剂/衍生物/原始类型）列定义
//       + 派生列与汇总目标列
// 红线: 列顺序即标本哈希的字段顺序，只能追加不能重排
// ==========================================

use crate::domain::types::{AggregateFn, FieldType};
use serde::{Deserialize, Serialize};
use std::fmt;

// ===== 计算列（暂存行）=====
pub const COL_GLOBAL_UNIQUE_ID: &str = "global_unique_id";
pub const COL_LSID: &str = "lsid";
pub const COL_SPECIMEN_HASH: &str = "specimen_hash";
pub const COL_PARTICIPANT_SEQUENCE_NUM: &str = "participant_sequence_num";
pub const COL_DRAW_TIMESTAMP: &str = "draw_timestamp";
pub const COL_DRAW_DATE: &str = "draw_date";
pub const COL_DRAW_TIME: &str = "draw_time";
pub const COL_PTID: &str = "ptid";
pub const COL_VISIT_VALUE: &str = "visit_value";
pub const COL_SPECIMEN_NUMBER: &str = "specimen_number";
pub const COL_EXTERNAL_ID: &str = "external_id";
pub const COL_LAB_ID: &str = "lab_id";
pub const COL_ORIGINATING_LOCATION_ID: &str = "originating_location_id";
pub const COL_VOLUME: &str = "volume";
pub const COL_REQUESTABLE: &str = "requestable";
pub const COL_COMMENTS: &str = "comments";
pub const COL_LAB_RECEIPT_DATE: &str = "lab_receipt_date";
pub const COL_STORAGE_DATE: &str = "storage_date";
pub const COL_SHIP_DATE: &str = "ship_date";
pub const COL_SHIP_FLAG: &str = "ship_flag";
pub const COL_SHIP_BATCH_NUMBER: &str = "ship_batch_number";
pub const COL_PROCESSED_BY_INITIALS: &str = "processed_by_initials";
pub const COL_OBSOLETE: &str = "obsolete";

// ===== 标本派生列 =====
pub const COL_PROCESSING_LOCATION: &str = "processing_location";
pub const COL_FIRST_PROCESSED_BY_INITIALS: &str = "first_processed_by_initials";
pub const COL_VIAL_COUNT: &str = "vial_count";

// ===== 样品管缓存列 =====
pub const COL_AVAILABLE: &str = "available";
pub const COL_LOCKED_IN_REQUEST: &str = "locked_in_request";
pub const COL_AT_REPOSITORY: &str = "at_repository";
pub const COL_CURRENT_LOCATION: &str = "current_location";
pub const COL_LATEST_COMMENTS: &str = "latest_comments";

// ==========================================
// 落库目标 (Target Table)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetTable {
    Events,
    Vials,
    Specimens,
    VialsAndEvents,
    SpecimensAndEvents,
    All,
}

impl TargetTable {
    pub fn is_specimens(self) -> bool {
        matches!(
            self,
            TargetTable::Specimens | TargetTable::SpecimensAndEvents | TargetTable::All
        )
    }

    pub fn is_vials(self) -> bool {
        matches!(
            self,
            TargetTable::Vials | TargetTable::VialsAndEvents | TargetTable::All
        )
    }

    pub fn is_events(self) -> bool {
        matches!(
            self,
            TargetTable::Events
                | TargetTable::VialsAndEvents
                | TargetTable::SpecimensAndEvents
                | TargetTable::All
        )
    }
}

// ==========================================
// 查找表类型 (Lookup Kind)
// ==========================================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LookupKind {
    Location,
    Additive,
    Derivative,
    PrimaryType,
}

impl LookupKind {
    pub fn table_name(self) -> &'static str {
        match self {
            LookupKind::Location => "location",
            LookupKind::Additive => "specimen_additive",
            LookupKind::Derivative => "specimen_derivative",
            LookupKind::PrimaryType => "specimen_primary_type",
        }
    }

    pub fn columns(self) -> &'static [LookupColumn] {
        match self {
            LookupKind::Location => LOCATION_COLUMNS,
            LookupKind::Additive => ADDITIVE_COLUMNS,
            LookupKind::Derivative => DERIVATIVE_COLUMNS,
            LookupKind::PrimaryType => PRIMARY_TYPE_COLUMNS,
        }
    }

    pub fn all() -> [LookupKind; 4] {
        [
            LookupKind::Location,
            LookupKind::Additive,
            LookupKind::Derivative,
            LookupKind::PrimaryType,
        ]
    }
}

impl fmt::Display for LookupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.table_name())
    }
}

// ==========================================
// SpecimenColumn - 标本文件列
// ==========================================
#[derive(Debug, Clone, Copy)]
pub struct SpecimenColumn {
    pub tsv_name: &'static str,
    pub db_name: &'static str,
    pub field_type: FieldType,
    pub target: TargetTable,
    pub aggregate: Option<AggregateFn>,
    pub lookup: Option<LookupKind>,
    pub max_len: Option<usize>,
    /// 落在标本表但不参与标本身份（不进哈希）
    pub identity_excluded: bool,
    pub aliases: &'static [&'static str],
}

const fn col(
    tsv_name: &'static str,
    db_name: &'static str,
    field_type: FieldType,
    target: TargetTable,
) -> SpecimenColumn {
    SpecimenColumn {
        tsv_name,
        db_name,
        field_type,
        target,
        aggregate: None,
        lookup: None,
        max_len: None,
        identity_excluded: false,
        aliases: &[],
    }
}

const fn text(tsv_name: &'static str, db_name: &'static str, target: TargetTable, max_len: usize) -> SpecimenColumn {
    let c = col(tsv_name, db_name, FieldType::Text, target);
    SpecimenColumn { max_len: Some(max_len), ..c }
}

impl SpecimenColumn {
    const fn lookup(self, kind: LookupKind) -> Self {
        SpecimenColumn { lookup: Some(kind), ..self }
    }

    const fn aggregate(self, agg: AggregateFn) -> Self {
        SpecimenColumn { aggregate: Some(agg), ..self }
    }

    const fn aliases(self, aliases: &'static [&'static str]) -> Self {
        SpecimenColumn { aliases, ..self }
    }

    const fn identity_excluded(self) -> Self {
        SpecimenColumn { identity_excluded: true, ..self }
    }

    /// 标本定义列: 落标本表 + 无聚合 + 未排除
    pub fn is_specimen_defining(&self) -> bool {
        self.target.is_specimens() && self.aggregate.is_none() && !self.identity_excluded
    }

    /// 文件列头匹配（大小写不敏感，含别名）
    pub fn matches_header(&self, header: &str) -> bool {
        let header = header.trim();
        self.tsv_name.eq_ignore_ascii_case(header)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(header))
    }
}

use FieldType::{Boolean, DateTime, Float, Integer};
use TargetTable::{All, Events, SpecimensAndEvents, Vials};

/// 标本/样品管/事件文件的全部可导入列（顺序固定）
pub static SPECIMEN_COLUMNS: &[SpecimenColumn] = &[
    col("record_id", COL_EXTERNAL_ID, Integer, Events).aliases(&["recordid"]),
    text("record_source", "record_source", Events, 20),
    text("global_unique_specimen_id", COL_GLOBAL_UNIQUE_ID, Vials, 50)
        .aliases(&["globaluniqueid", "global_unique_id", "guid"]),
    col("lab_id", COL_LAB_ID, Integer, Events)
        .lookup(LookupKind::Location)
        .aliases(&["labid", "site_id"]),
    col("originating_location", COL_ORIGINATING_LOCATION_ID, Integer, SpecimensAndEvents)
        .lookup(LookupKind::Location)
        .aliases(&["originating_location_id"]),
    text("unique_specimen_id", "unique_specimen_id", Events, 50),
    text("ptid", COL_PTID, SpecimensAndEvents, 32).aliases(&["participant_id", "participantid"]),
    col("parent_specimen_id", "parent_specimen_id", Integer, Events),
    col("draw_timestamp", COL_DRAW_TIMESTAMP, DateTime, SpecimensAndEvents)
        .aliases(&["drawtimestamp"]),
    col("sal_receipt_date", "sal_receipt_date", DateTime, SpecimensAndEvents),
    text("specimen_number", COL_SPECIMEN_NUMBER, Events, 50),
    text("class_id", "class_id", SpecimensAndEvents, 20),
    col("visit_value", COL_VISIT_VALUE, Float, SpecimensAndEvents)
        .aliases(&["visit", "sequencenum", "sequence_num"]),
    text("protocol_number", "protocol_number", SpecimensAndEvents, 20),
    text("visit_description", "visit_description", SpecimensAndEvents, 10),
    text("other_specimen_id", "other_specimen_id", Events, 50),
    col("volume", COL_VOLUME, Float, All).identity_excluded(),
    text("volume_units", "volume_units", SpecimensAndEvents, 20),
    col("stored", "stored", Integer, Events),
    col("storage_flag", "storage_flag", Integer, Events),
    col("storage_date", COL_STORAGE_DATE, DateTime, Events),
    col("ship_flag", COL_SHIP_FLAG, Integer, Events),
    col("ship_batch_number", COL_SHIP_BATCH_NUMBER, Integer, Events),
    col("ship_date", COL_SHIP_DATE, DateTime, Events),
    col("imported_batch_number", "imported_batch_number", Integer, Events),
    col("lab_receipt_date", COL_LAB_RECEIPT_DATE, DateTime, Events),
    col("expected_time_value", "expected_time_value", Float, Events),
    text("expected_time_unit", "expected_time_unit", Events, 15),
    col("group_protocol", "group_protocol", Integer, Events),
    text("sub_additive_derivative", "sub_additive_derivative", SpecimensAndEvents, 50),
    text("comments", COL_COMMENTS, Events, 500),
    col("primary_specimen_type_id", "primary_type_id", Integer, SpecimensAndEvents)
        .lookup(LookupKind::PrimaryType)
        .aliases(&["primary_type_id"]),
    col("derivative_type_id", "derivative_type_id", Integer, SpecimensAndEvents)
        .lookup(LookupKind::Derivative),
    col("derivative_type_id_2", "derivative_type_id2", Integer, SpecimensAndEvents)
        .lookup(LookupKind::Derivative),
    col("additive_type_id", "additive_type_id", Integer, SpecimensAndEvents)
        .lookup(LookupKind::Additive),
    text("specimen_condition", "specimen_condition", Events, 30),
    text("sample_number", "sample_number", Events, 20),
    text("x_sample_origin", "x_sample_origin", Events, 50),
    text("external_location", "external_location", Events, 50),
    col("update_timestamp", "update_timestamp", DateTime, Events),
    col("requestable", COL_REQUESTABLE, Boolean, Vials),
    text("freezer", "freezer", Events, 200),
    text("fr_level1", "fr_level1", Events, 200),
    text("fr_level2", "fr_level2", Events, 200),
    text("fr_container", "fr_container", Events, 200),
    text("fr_position", "fr_position", Events, 200),
    text("shipped_from_lab", "shipped_from_lab", Events, 32),
    text("shipped_to_lab", "shipped_to_lab", Events, 32),
    col("frozen_time", "frozen_time", DateTime, SpecimensAndEvents),
    col("primary_volume", "primary_volume", Float, SpecimensAndEvents).aggregate(AggregateFn::Max),
    text("primary_volume_units", "primary_volume_units", SpecimensAndEvents, 20),
    col("processing_time", "processing_time", DateTime, SpecimensAndEvents),
    text("processed_by_initials", COL_PROCESSED_BY_INITIALS, Events, 32),
    col("yield", "yield", Float, Events),
    col("concentration", "concentration", Float, Events),
    col("integrity", "integrity", Float, Events),
    col("ratio", "ratio", Float, Events),
    text("quality_comments", "quality_comments", Events, 500),
    text("deviation_code1", "deviation_code1", Events, 50),
];

/// 按存储列名查找
pub fn specimen_column(db_name: &str) -> Option<&'static SpecimenColumn> {
    SPECIMEN_COLUMNS.iter().find(|c| c.db_name == db_name)
}

/// 标本定义列（哈希字段，按目录顺序）
pub fn specimen_defining_columns() -> impl Iterator<Item = &'static SpecimenColumn> {
    SPECIMEN_COLUMNS.iter().filter(|c| c.is_specimen_defining())
}

pub fn specimen_target_columns() -> impl Iterator<Item = &'static SpecimenColumn> {
    SPECIMEN_COLUMNS.iter().filter(|c| c.target.is_specimens())
}

pub fn vial_target_columns() -> impl Iterator<Item = &'static SpecimenColumn> {
    SPECIMEN_COLUMNS.iter().filter(|c| c.target.is_vials())
}

pub fn event_target_columns() -> impl Iterator<Item = &'static SpecimenColumn> {
    SPECIMEN_COLUMNS.iter().filter(|c| c.target.is_events())
}

// ==========================================
// FieldDef - 汇总/派生字段定义
// ==========================================
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
}

impl FieldDef {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            field_type,
        }
    }
}

/// 样品管派生列（由事件序列计算，不含汇总列）
pub static VIAL_DERIVED_COLUMNS: &[(&str, FieldType)] = &[
    (COL_CURRENT_LOCATION, Integer),
    (COL_PROCESSING_LOCATION, Integer),
    (COL_FIRST_PROCESSED_BY_INITIALS, FieldType::Text),
    (COL_AT_REPOSITORY, Boolean),
    (COL_LATEST_COMMENTS, FieldType::Text),
];

/// 事件 → 样品管 汇总目标列
pub static VIAL_ROLLUP_TARGETS: &[(&str, FieldType)] = &[
    ("first_lab_id", Integer),
    ("latest_lab_id", Integer),
    ("latest_yield", Float),
    ("latest_concentration", Float),
    ("latest_integrity", Float),
    ("latest_ratio", Float),
    ("latest_quality_comments", FieldType::Text),
    ("first_specimen_condition", FieldType::Text),
    ("latest_non_blank_deviation_code1", FieldType::Text),
    ("combine_all_comments", FieldType::Text),
];

/// 样品管 → 标本 汇总目标列
pub static SPECIMEN_ROLLUP_TARGETS: &[(&str, FieldType)] = &[
    ("available_count", Integer),
    ("locked_in_request_count", Integer),
    ("at_repository_count", Integer),
    ("total_volume", Float),
    ("max_volume", Float),
    ("min_volume", Float),
];

/// 事件表字段（汇总来源）
pub fn event_field_defs() -> Vec<FieldDef> {
    event_target_columns()
        .map(|c| FieldDef::new(c.db_name, c.field_type))
        .collect()
}

/// 样品管字段（标本汇总来源）: 导入列 + 缓存状态列
pub fn vial_field_defs() -> Vec<FieldDef> {
    let mut defs: Vec<FieldDef> = vial_target_columns()
        .filter(|c| c.db_name != COL_GLOBAL_UNIQUE_ID)
        .map(|c| FieldDef::new(c.db_name, c.field_type))
        .collect();
    defs.push(FieldDef::new(COL_AVAILABLE, Boolean));
    defs.push(FieldDef::new(COL_LOCKED_IN_REQUEST, Boolean));
    defs.push(FieldDef::new(COL_AT_REPOSITORY, Boolean));
    defs
}

pub fn to_field_defs(list: &[(&str, FieldType)]) -> Vec<FieldDef> {
    list.iter().map(|(n, t)| FieldDef::new(n, *t)).collect()
}

// ==========================================
// LookupColumn - 查找表列
// ==========================================
#[derive(Debug, Clone, Copy)]
pub struct LookupColumn {
    pub tsv_name: &'static str,
    pub db_name: &'static str,
    pub field_type: FieldType,
    pub max_len: Option<usize>,
    pub aliases: &'static [&'static str],
}

const fn lk(tsv_name: &'static str, db_name: &'static str, field_type: FieldType) -> LookupColumn {
    LookupColumn {
        tsv_name,
        db_name,
        field_type,
        max_len: None,
        aliases: &[],
    }
}

const fn lk_text(tsv_name: &'static str, db_name: &'static str, max_len: usize) -> LookupColumn {
    LookupColumn {
        tsv_name,
        db_name,
        field_type: FieldType::Text,
        max_len: Some(max_len),
        aliases: &[],
    }
}

impl LookupColumn {
    pub fn matches_header(&self, header: &str) -> bool {
        let header = header.trim();
        self.tsv_name.eq_ignore_ascii_case(header)
            || self.aliases.iter().any(|a| a.eq_ignore_ascii_case(header))
    }
}

pub const LOOKUP_COL_REPOSITORY: &str = "repository";

pub static LOCATION_COLUMNS: &[LookupColumn] = &[
    LookupColumn { aliases: &["site_id"], ..lk("lab_id", COL_EXTERNAL_ID, Integer) },
    lk_text("ldms_lab_code", "ldms_code", 20),
    lk_text("labware_lab_code", "labware_code", 20),
    lk_text("lab_name", "label", 200),
    lk_text("lab_upload_code", "lab_upload_code", 10),
    lk("is_sal", "sal", Boolean),
    lk("is_repository", LOOKUP_COL_REPOSITORY, Boolean),
    lk("is_clinic", "clinic", Boolean),
    lk("is_endpoint", "endpoint", Boolean),
];

pub static ADDITIVE_COLUMNS: &[LookupColumn] = &[
    lk("additive_id", COL_EXTERNAL_ID, Integer),
    lk_text("ldms_additive_code", "ldms_code", 30),
    lk_text("labware_additive_code", "labware_code", 20),
    lk_text("additive", "label", 100),
];

pub static DERIVATIVE_COLUMNS: &[LookupColumn] = &[
    lk("derivative_id", COL_EXTERNAL_ID, Integer),
    lk_text("ldms_derivative_code", "ldms_code", 20),
    lk_text("labware_derivative_code", "labware_code", 20),
    lk_text("derivative", "label", 100),
];

pub static PRIMARY_TYPE_COLUMNS: &[LookupColumn] = &[
    lk("primary_type_id", COL_EXTERNAL_ID, Integer),
    lk_text("primary_type_ldms_code", "ldms_code", 5),
    lk_text("primary_type_labware_code", "labware_code", 5),
    lk_text("primary_type", "label", 100),
];
