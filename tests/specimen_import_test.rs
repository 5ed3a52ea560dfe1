// ==========================================
// SpecimenImporter 集成测试
// ==========================================
// 测试目标: 验证完整的标本导入流程（文件 → 事务 → 派生字段 → 通知）
// ==========================================

mod test_helpers;

use rusqlite::Transaction;
use specimen_sync::config::config_keys;
use specimen_sync::domain::{ImportMode, ImportSummary};
use specimen_sync::importer::{
    CancelHandle, DefaultRequestabilityRules, ImportError, ImportListener, ImportResult,
    RequestabilityEngine, SpecimenImporter, UniqueIdGenerator,
};
use specimen_sync::logging;
use std::io::Write;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use test_helpers::{
    core_counts, create_test_db, create_test_importer, labs, query_i64, query_opt_f64, set_config,
    specimens, tsv, CONTAINER,
};

const SCENARIO_ROWS: &[&[&str]] = &[
    &["V1", "101", "1", "11", "2024-01-01", "1.0", "ML"],
    &["V1", "101", "1", "12", "2024-01-05", "1.0", "ML"],
    &["V2", "101", "1", "11", "2024-01-02", "1.0", "ML"],
];

const NO_GUID_ROWS: &[&[&str]] = &[&["", "101", "1", "11", "2024-01-03", "1.0", "ML"]];

fn lab_of(db_path: &str, guid: &str, column: &str) -> i64 {
    query_i64(
        db_path,
        &format!(
            "SELECT l.external_id FROM vial v JOIN location l ON l.row_id = v.{} WHERE v.global_unique_id = '{}'",
            column, guid
        ),
    )
}

#[tokio::test]
async fn test_import_files_scenario() {
    logging::init_test();
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);

    let files = vec![
        PathBuf::from("tests/fixtures/specimens_scenario.tsv"),
        PathBuf::from("tests/fixtures/labs.tsv"),
    ];
    let summary = importer
        .import_files(CONTAINER, ImportMode::Merge, &files)
        .await
        .expect("Import should succeed");

    // 实验室先于标本落库
    assert_eq!(summary.locations.inserted, 2);
    assert_eq!(summary.staged_rows, 3);
    assert_eq!(summary.staging_attempts, 1);
    assert_eq!(summary.specimens.inserted, 1);
    assert_eq!(summary.vials.inserted, 2);
    assert_eq!(summary.events.inserted, 3);
    assert_eq!(summary.created_visits, vec![1.0]);
    assert_eq!(core_counts(&db_path), (1, 2, 3));

    assert_eq!(lab_of(&db_path, "V1", "first_lab_id"), 11);
    assert_eq!(lab_of(&db_path, "V1", "latest_lab_id"), 12);
    assert_eq!(lab_of(&db_path, "V2", "latest_lab_id"), 11);

    assert_eq!(query_i64(&db_path, "SELECT vial_count FROM specimen"), 2);
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM participant"), 1);
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM participant_visit"), 1);
    assert_eq!(
        query_i64(&db_path, "SELECT COUNT(*) FROM vial WHERE lsid = 'urn:lsid:specimen:Folder-study-1:V1'"),
        1
    );
}

#[tokio::test]
async fn test_merge_volume_conflict_nulls_specimen_value() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);
    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial import should succeed");

    let summary = importer
        .import_files(
            CONTAINER,
            ImportMode::Merge,
            &[PathBuf::from("tests/fixtures/specimens_v1_volume.tsv")],
        )
        .await
        .expect("Merge import should succeed");

    assert_eq!(summary.specimens.updated, 1);
    assert_eq!(summary.events.updated, 2);
    assert_eq!(core_counts(&db_path), (1, 2, 3));

    // 同组样品管取值不一致 → 标本层置空，样品管保留各自取值
    assert_eq!(query_opt_f64(&db_path, "SELECT volume FROM specimen"), None);
    assert_eq!(
        query_opt_f64(&db_path, "SELECT volume FROM vial WHERE global_unique_id = 'V1'"),
        Some(2.0)
    );
    assert_eq!(
        query_opt_f64(&db_path, "SELECT volume FROM vial WHERE global_unique_id = 'V2'"),
        Some(1.0)
    );
}

#[tokio::test]
async fn test_merge_reimport_changes_nothing() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);
    let tables = || vec![labs(), specimens(SCENARIO_ROWS)];

    importer
        .import_parsed(CONTAINER, ImportMode::Merge, tables())
        .await
        .expect("First import should succeed");
    let second = importer
        .import_parsed(CONTAINER, ImportMode::Merge, tables())
        .await
        .expect("Second import should succeed");

    assert_eq!(second.core_rows_changed(), 0);
    assert_eq!(second.events.unchanged, 3);
    assert_eq!(second.locations.unchanged, 2);
    assert_eq!(second.derived_vials_updated, 0);
    assert_eq!(second.specimens_rollup_updated, 0);
    assert!(second.created_visits.is_empty());
    assert_eq!(core_counts(&db_path), (1, 2, 3));
}

#[tokio::test]
async fn test_replace_drops_rows_missing_from_file() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);
    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial import should succeed");

    let summary = importer
        .import_parsed(
            CONTAINER,
            ImportMode::Replace,
            vec![specimens(&[&["V2", "101", "1", "11", "2024-01-02", "1.0", "ML"]])],
        )
        .await
        .expect("Replace import should succeed");

    assert_eq!(summary.vials.deleted, 2);
    assert_eq!(summary.events.deleted, 3);
    assert_eq!(core_counts(&db_path), (1, 1, 1));
    // 实验室不随 REPLACE 删除
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM location"), 2);
}

#[tokio::test]
async fn test_conflicting_specimens_reported_per_guid() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);
    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial import should succeed");

    let result = importer
        .import_parsed(
            CONTAINER,
            ImportMode::Merge,
            vec![specimens(&[
                &["V1", "102", "1", "11", "2024-01-01", "1.0", "ML"],
                &["V2", "103", "1", "11", "2024-01-02", "1.0", "ML"],
            ])],
        )
        .await;

    match result {
        Err(ImportError::ConflictingSpecimens(conflicts)) => {
            let mut guids: Vec<&str> = conflicts.iter().map(|c| c.global_unique_id.as_str()).collect();
            guids.sort();
            assert_eq!(guids, vec!["V1", "V2"]);
        }
        other => panic!("Expected ConflictingSpecimens, got {:?}", other),
    }

    // 事务回滚，存量不变
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM specimen WHERE ptid = '101'"), 1);
}

#[tokio::test]
async fn test_editable_repository_rejects_existing_vials() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, CONTAINER, config_keys::EDITABLE_REPOSITORY, "true");
    let importer = create_test_importer(&db_path);

    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Fresh vials should import");

    let result = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![specimens(SCENARIO_ROWS)])
        .await;
    assert!(
        matches!(result, Err(ImportError::ExistingSpecimenReferenced(n)) if n > 0),
        "Expected ExistingSpecimenReferenced, got {:?}",
        result
    );
}

#[tokio::test]
async fn test_undefined_visits_fail_when_configured() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, "global", config_keys::FAIL_FOR_UNDEFINED_VISITS, "true");
    let importer = create_test_importer(&db_path);

    let result = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await;
    match result {
        Err(ImportError::UndefinedVisits(visits)) => assert_eq!(visits, vec![1.0]),
        other => panic!("Expected UndefinedVisits, got {:?}", other),
    }

    // 查找表与主表一并回滚
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM location"), 0);
    assert_eq!(core_counts(&db_path), (0, 0, 0));
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM visit"), 0);
}

#[tokio::test]
async fn test_date_timepoint_derives_sequence_num() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, CONTAINER, config_keys::TIMEPOINT_TYPE, "DATE");
    let importer = create_test_importer(&db_path);

    let file = tsv(
        "specimens",
        &["global_unique_specimen_id", "ptid", "draw_timestamp"],
        &[&["D1", "201", "2024-03-01 08:30:00"]],
    );
    let summary = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![file])
        .await
        .expect("Import should succeed");

    assert!(summary.created_visits.is_empty());
    assert_eq!(
        query_opt_f64(&db_path, "SELECT sequence_num FROM participant_visit WHERE participant_id = '201'"),
        Some(20240301.0)
    );
}

#[tokio::test]
async fn test_unmatched_lookup_ids_are_nulled() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);

    // 未导入实验室表
    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![specimens(SCENARIO_ROWS)])
        .await
        .expect("Import should succeed");

    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM specimen_event WHERE lab_id IS NULL"), 3);
}

#[tokio::test]
async fn test_request_rows_marked_orphaned() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    {
        let conn = rusqlite::Connection::open(&db_path).expect("Failed to open db");
        conn.execute_batch(
            r#"
            INSERT INTO sample_request (container, status, final_state) VALUES ('study-1', 'NEW', 0);
            INSERT INTO sample_request_specimen (container, sample_request_id, specimen_global_unique_id)
                VALUES ('study-1', 1, 'V1'), ('study-1', 1, 'V9');
            "#,
        )
        .expect("Failed to insert requests");
    }
    let importer = create_test_importer(&db_path);

    let summary = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Import should succeed");

    assert_eq!(summary.orphaned_request_vials, 1);
    assert_eq!(
        query_i64(&db_path, "SELECT orphaned FROM sample_request_specimen WHERE specimen_global_unique_id = 'V9'"),
        1
    );
    assert_eq!(query_i64(&db_path, "SELECT locked_in_request FROM vial WHERE global_unique_id = 'V1'"), 1);
    assert_eq!(query_i64(&db_path, "SELECT available FROM vial WHERE global_unique_id = 'V1'"), 0);
    assert_eq!(query_i64(&db_path, "SELECT locked_in_request FROM vial WHERE global_unique_id = 'V2'"), 0);

    // V9 出现后取消孤儿标记
    let summary = importer
        .import_parsed(
            CONTAINER,
            ImportMode::Merge,
            vec![specimens(&[&["V9", "109", "1", "11", "2024-01-09", "1.0", "ML"]])],
        )
        .await
        .expect("Import should succeed");
    assert_eq!(summary.orphaned_request_vials, 0);
    assert_eq!(
        query_i64(&db_path, "SELECT orphaned FROM sample_request_specimen WHERE specimen_global_unique_id = 'V9'"),
        0
    );
}

#[tokio::test]
async fn test_missing_table_name_rejected() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);

    let mut file = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(file, "global_unique_specimen_id\tptid").expect("write");
    writeln!(file, "V1\t101").expect("write");

    let result = importer
        .import_files(CONTAINER, ImportMode::Merge, &[file.path().to_path_buf()])
        .await;
    assert!(matches!(result, Err(ImportError::MissingTableName(_))));

    let mut unknown = tempfile::NamedTempFile::new().expect("Failed to create temp file");
    writeln!(unknown, "#freezers").expect("write");
    writeln!(unknown, "id").expect("write");
    let result = importer
        .import_files(CONTAINER, ImportMode::Merge, &[unknown.path().to_path_buf()])
        .await;
    assert!(matches!(result, Err(ImportError::UnknownImportTable(ref t)) if t == "freezers"));
}

// ==========================================
// 乐观并发重试
// ==========================================

/// 前 collide_times 次返回已存在的 ID
struct CollidingGenerator {
    calls: Arc<AtomicUsize>,
    collide_times: usize,
}

impl UniqueIdGenerator for CollidingGenerator {
    fn next_ids(&self, _tx: &Transaction, _container: &str, count: usize) -> ImportResult<Vec<String>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.collide_times {
            Ok(vec!["V1".to_string(); count])
        } else {
            Ok((0..count).map(|i| format!("G-{}", 100 + i)).collect())
        }
    }
}

#[tokio::test]
async fn test_generated_id_collision_retried() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, CONTAINER, config_keys::EDITABLE_REPOSITORY, "true");
    create_test_importer(&db_path)
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial import should succeed");

    let calls = Arc::new(AtomicUsize::new(0));
    let importer = create_test_importer(&db_path).with_id_generator(Box::new(CollidingGenerator {
        calls: calls.clone(),
        collide_times: 1,
    }));
    let summary = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![specimens(NO_GUID_ROWS)])
        .await
        .expect("Retry should succeed");

    assert_eq!(summary.staging_attempts, 2);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM vial WHERE global_unique_id = 'G-100'"), 1);
}

#[tokio::test]
async fn test_generated_id_collision_gives_up() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, CONTAINER, config_keys::EDITABLE_REPOSITORY, "true");
    create_test_importer(&db_path)
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial import should succeed");

    let calls = Arc::new(AtomicUsize::new(0));
    let importer = create_test_importer(&db_path).with_id_generator(Box::new(CollidingGenerator {
        calls: calls.clone(),
        collide_times: usize::MAX,
    }));
    let result = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![specimens(NO_GUID_ROWS)])
        .await;

    assert!(matches!(result, Err(ImportError::OptimisticConcurrency)));
    assert_eq!(calls.load(Ordering::SeqCst), specimen_sync::importer::MAX_STAGING_ATTEMPTS);
    assert_eq!(core_counts(&db_path), (1, 2, 3));
}

// ==========================================
// 取消与通知
// ==========================================

/// 在派生阶段置位取消标志
struct CancellingRules {
    handle: CancelHandle,
}

impl RequestabilityEngine for CancellingRules {
    fn apply(&self, tx: &Transaction, container: &str) -> ImportResult<usize> {
        self.handle.cancel();
        DefaultRequestabilityRules.apply(tx, container)
    }
}

#[tokio::test]
async fn test_cancel_rolls_back_whole_run() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let handle = CancelHandle::new();
    let importer = create_test_importer(&db_path)
        .with_cancel_handle(handle.clone())
        .with_requestability(Box::new(CancellingRules { handle: handle.clone() }));

    let result = importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await;

    assert!(matches!(result, Err(ImportError::Cancelled)));
    assert!(handle.is_cancelled());
    assert_eq!(core_counts(&db_path), (0, 0, 0));
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM location"), 0);
}

#[derive(Default)]
struct ListenerCounts {
    cleared: AtomicUsize,
    changed: AtomicUsize,
}

struct CountingListener(Arc<ListenerCounts>);

impl ImportListener for CountingListener {
    fn clear_caches(&self, _container: &str) -> anyhow::Result<()> {
        self.0.cleared.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn specimens_changed(&self, _container: &str, summary: &ImportSummary) -> anyhow::Result<()> {
        self.0.changed.fetch_add(summary.vials.inserted, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingListener;

impl ImportListener for FailingListener {
    fn clear_caches(&self, _container: &str) -> anyhow::Result<()> {
        anyhow::bail!("cache service unavailable")
    }

    fn specimens_changed(&self, _container: &str, _summary: &ImportSummary) -> anyhow::Result<()> {
        anyhow::bail!("listener unavailable")
    }
}

#[tokio::test]
async fn test_listeners_notified_after_commit() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let counts = Arc::new(ListenerCounts::default());
    let importer = create_test_importer(&db_path)
        .with_listener(Box::new(FailingListener))
        .with_listener(Box::new(CountingListener(counts.clone())));

    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Listener failures must not fail the import");

    assert_eq!(counts.cleared.load(Ordering::SeqCst), 1);
    assert_eq!(counts.changed.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_repository_queries_after_import() {
    use specimen_sync::repository::{SpecimenRepository, SpecimenRepositoryImpl};

    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    create_test_importer(&db_path)
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Import should succeed");

    let repo = SpecimenRepositoryImpl::new(&db_path).expect("Failed to create repository");
    assert_eq!(repo.count_specimens(CONTAINER).await.expect("count"), 1);
    assert_eq!(repo.count_vials(CONTAINER).await.expect("count"), 2);
    assert_eq!(repo.count_events(CONTAINER).await.expect("count"), 3);
    assert_eq!(repo.count_vials("other").await.expect("count"), 0);

    let vial = repo
        .find_vial(CONTAINER, "V1")
        .await
        .expect("query")
        .expect("V1 should exist");
    let events = repo.list_events_for_vial(vial.row_id).await.expect("query");
    assert_eq!(events.len(), 2);

    let specimen_id = vial.record.get("specimen_id").as_i64().expect("specimen_id");
    let specimen = repo.find_specimen(specimen_id).await.expect("query");
    assert!(specimen.is_some());
    assert!(repo.find_vial(CONTAINER, "V404").await.expect("query").is_none());
    assert_eq!(repo.list_vials(CONTAINER).await.expect("query").len(), 2);
    assert_eq!(repo.list_specimens(CONTAINER).await.expect("query").len(), 1);
}

// ==========================================
// REPLACE 边界
// ==========================================

#[tokio::test]
async fn test_editable_repository_replace_reimport() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, CONTAINER, config_keys::EDITABLE_REPOSITORY, "true");
    let importer = create_test_importer(&db_path);

    importer
        .import_parsed(CONTAINER, ImportMode::Replace, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial replace should succeed");

    // REPLACE 先清空容器，同一文件重复导入不算引用存量样品管
    let summary = importer
        .import_parsed(CONTAINER, ImportMode::Replace, vec![specimens(SCENARIO_ROWS)])
        .await
        .expect("Replace re-import should succeed");

    assert_eq!(summary.vials.deleted, 2);
    assert_eq!(summary.vials.inserted, 2);
    assert_eq!(core_counts(&db_path), (1, 2, 3));
}

#[tokio::test]
async fn test_replace_with_header_only_file_keeps_rows() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);
    importer
        .import_parsed(CONTAINER, ImportMode::Replace, vec![labs(), specimens(SCENARIO_ROWS)])
        .await
        .expect("Initial replace should succeed");
    assert_eq!(core_counts(&db_path), (1, 2, 3));

    let summary = importer
        .import_parsed(CONTAINER, ImportMode::Replace, vec![specimens(&[])])
        .await
        .expect("Empty replace should succeed");

    assert_eq!(summary.staged_rows, 0);
    assert_eq!(summary.vials.deleted, 0);
    assert_eq!(summary.events.deleted, 0);
    assert_eq!(core_counts(&db_path), (1, 2, 3));
}

// ==========================================
// 存量行重算哈希
// ==========================================

#[tokio::test]
async fn test_stored_specimen_rehashes_to_same_value() {
    use specimen_sync::engine::HashComputer;
    use specimen_sync::repository::SpecimenRepositoryImpl;

    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    let importer = create_test_importer(&db_path);
    let rows: &[&[&str]] = &[
        &["V1", "101", "1.5", "11", "2024-01-01", "1.0", "ML"],
        &["V1", "101", "1.5", "12", "2024-01-05", "1.0", "ML"],
    ];
    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![labs(), specimens(rows)])
        .await
        .expect("Import should succeed");
    importer
        .import_parsed(CONTAINER, ImportMode::Merge, vec![specimens(rows)])
        .await
        .expect("Merge re-import should succeed");

    let conn = rusqlite::Connection::open(&db_path).expect("Failed to open db");
    let stored = SpecimenRepositoryImpl::load_specimens_tx(&conn, CONTAINER).expect("Failed to load specimens");
    assert_eq!(stored.len(), 1);

    let stored_hash = stored[0].record.text("specimen_hash").expect("specimen_hash").to_string();
    let recomputed = HashComputer::new(CONTAINER).compute(&stored[0].record, None);
    assert_eq!(recomputed, stored_hash);
    assert_eq!(recomputed.len(), 64);
}
