// ==========================================
// 标本导入对账系统 - 研究对象 / 访视 Repository
// ==========================================
// 职责: 访视区间查询与补建 + 参与者 / 参与者访视 同步
// ==========================================

use crate::repository::error::RepositoryResult;
use rusqlite::{params, Connection, Transaction};

pub struct StudyRepository;

impl StudyRepository {
    /// 容器内全部访视区间 [min, max]
    pub fn visit_ranges_tx(conn: &Connection, container: &str) -> RepositoryResult<Vec<(f64, f64)>> {
        let mut stmt = conn.prepare(
            "SELECT sequence_num_min, sequence_num_max FROM visit WHERE container = ?1 ORDER BY sequence_num_min",
        )?;
        let rows = stmt.query_map(params![container], |row| Ok((row.get(0)?, row.get(1)?)))?;
        let mut ranges = Vec::new();
        for row in rows {
            ranges.push(row?);
        }
        Ok(ranges)
    }

    /// 未落在任何访视区间内的取值（去重、升序）
    pub fn undefined_visits_tx(
        conn: &Connection,
        container: &str,
        values: impl IntoIterator<Item = f64>,
    ) -> RepositoryResult<Vec<f64>> {
        let ranges = Self::visit_ranges_tx(conn, container)?;
        let mut undefined: Vec<f64> = values
            .into_iter()
            .filter(|v| !ranges.iter().any(|(min, max)| v >= min && v <= max))
            .collect();
        undefined.sort_by(|a, b| a.total_cmp(b));
        undefined.dedup();
        Ok(undefined)
    }

    /// 补建单值访视
    pub fn create_visit_tx(tx: &Transaction, container: &str, sequence_num: f64) -> RepositoryResult<i64> {
        tx.execute(
            r#"
            INSERT INTO visit (container, sequence_num_min, sequence_num_max, label)
            VALUES (?1, ?2, ?2, ?3)
            "#,
            params![container, sequence_num, sequence_num.to_string()],
        )?;
        Ok(tx.last_insert_rowid())
    }

    /// 补齐标本中出现的参与者
    pub fn sync_participants_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let inserted = tx.execute(
            r#"
            INSERT OR IGNORE INTO participant (container, participant_id)
            SELECT DISTINCT container, ptid FROM specimen
            WHERE container = ?1 AND ptid IS NOT NULL
            "#,
            params![container],
        )?;
        Ok(inserted)
    }

    /// 补齐标本中出现的参与者访视（由 participant_sequence_num 拆分）
    pub fn sync_participant_visits_tx(tx: &Transaction, container: &str) -> RepositoryResult<usize> {
        let pairs: Vec<String> = {
            let mut stmt = tx.prepare(
                r#"
                SELECT DISTINCT participant_sequence_num FROM specimen
                WHERE container = ?1 AND participant_sequence_num IS NOT NULL
                "#,
            )?;
            let rows = stmt.query_map(params![container], |row| row.get::<_, String>(0))?;
            let mut pairs = Vec::new();
            for row in rows {
                pairs.push(row?);
            }
            pairs
        };

        let mut insert = tx.prepare_cached(
            r#"
            INSERT OR IGNORE INTO participant_visit
                (container, participant_id, sequence_num, participant_sequence_num)
            VALUES (?1, ?2, ?3, ?4)
            "#,
        )?;
        let mut inserted = 0;
        for psn in &pairs {
            let parsed = psn
                .rsplit_once('|')
                .and_then(|(ptid, seq)| seq.parse::<f64>().ok().map(|s| (ptid, s)));
            if let Some((ptid, sequence_num)) = parsed {
                inserted += insert.execute(params![container, ptid, sequence_num, psn])?;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn test_undefined_visits() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        tx.execute(
            "INSERT INTO visit (container, sequence_num_min, sequence_num_max) VALUES ('c1', 1.0, 2.0)",
            [],
        )
        .unwrap();
        let undefined = StudyRepository::undefined_visits_tx(&tx, "c1", vec![3.0, 1.5, 0.5, 3.0]).unwrap();
        assert_eq!(undefined, vec![0.5, 3.0]);

        StudyRepository::create_visit_tx(&tx, "c1", 3.0).unwrap();
        let undefined = StudyRepository::undefined_visits_tx(&tx, "c1", vec![3.0]).unwrap();
        assert!(undefined.is_empty());
    }

    #[test]
    fn test_sync_participants_and_visits() {
        let mut conn = setup();
        let tx = conn.transaction().unwrap();
        tx.execute_batch(
            r#"
            INSERT INTO specimen (container, specimen_hash, ptid, participant_sequence_num)
                VALUES ('c1', 'H1', '101', '101|1'), ('c1', 'H2', '101', '101|2'), ('c1', 'H3', '102', '102|1');
            "#,
        )
        .unwrap();
        assert_eq!(StudyRepository::sync_participants_tx(&tx, "c1").unwrap(), 2);
        assert_eq!(StudyRepository::sync_participants_tx(&tx, "c1").unwrap(), 0);
        assert_eq!(StudyRepository::sync_participant_visits_tx(&tx, "c1").unwrap(), 3);
        assert_eq!(StudyRepository::sync_participant_visits_tx(&tx, "c1").unwrap(), 0);
    }
}
