// ==========================================
// 并发导入测试
// ==========================================
// 测试目标: 多容器并发导入互不干扰；配置错误在写库前失败
// ==========================================

mod test_helpers;

use specimen_sync::config::config_keys;
use specimen_sync::domain::ImportMode;
use specimen_sync::importer::{ImportError, SpecimenImporter};
use specimen_sync::logging;
use test_helpers::{core_counts, create_test_db, create_test_importer, labs, query_i64, set_config, specimens};

const ROWS: &[&[&str]] = &[
    &["V1", "101", "1", "11", "2024-01-01", "1.0", "ML"],
    &["V2", "102", "1", "12", "2024-01-02", "0.5", "ML"],
];

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_containers_import_concurrently() {
    logging::init_test();
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");

    let mut handles = Vec::new();
    for container in ["study-a", "study-b", "study-c"] {
        let importer = create_test_importer(&db_path);
        handles.push(tokio::spawn(async move {
            importer
                .import_parsed(container, ImportMode::Merge, vec![labs(), specimens(ROWS)])
                .await
        }));
    }

    for handle in handles {
        let summary = handle
            .await
            .expect("Task panicked")
            .expect("Import should succeed");
        assert_eq!(summary.vials.inserted, 2);
        assert_eq!(summary.specimens.inserted, 2);
    }

    assert_eq!(core_counts(&db_path), (6, 6, 6));
    for container in ["study-a", "study-b", "study-c"] {
        assert_eq!(
            query_i64(&db_path, &format!("SELECT COUNT(*) FROM location WHERE container = '{}'", container)),
            2
        );
    }
}

#[tokio::test]
async fn test_invalid_setting_fails_before_writes() {
    let (_temp_file, db_path) = create_test_db().expect("Failed to create test db");
    set_config(&db_path, "study-a", config_keys::TIMEPOINT_TYPE, "WEEKLY");
    let importer = create_test_importer(&db_path);

    let result = importer
        .import_parsed("study-a", ImportMode::Merge, vec![labs(), specimens(ROWS)])
        .await;
    assert!(matches!(result, Err(ImportError::ConfigValueError { .. })));
    assert_eq!(query_i64(&db_path, "SELECT COUNT(*) FROM location"), 0);

    // 其他容器不受影响
    importer
        .import_parsed("study-b", ImportMode::Merge, vec![labs(), specimens(ROWS)])
        .await
        .expect("Other container should import");
    assert_eq!(core_counts(&db_path), (2, 2, 2));
}
