//! 초기 전체 스냅샷 (Full Dump)
//!
//! 1. 소스 스키마의 테이블 목록 조회 (필터 적용)
//! 2. 대상 데이터베이스 삭제
//! 3. 테이블별로 전체 행을 읽어 같은 이름의 컬렉션에 벌크 삽입 (제한된 동시성)
//!
//! 한 테이블의 실패는 다른 테이블 처리를 막지 않고, 모든 시도가 끝난 뒤 모아서 보고합니다.

use crate::config::TableFilter;
use crate::document::{document_key, field_document, key_repr, row_to_document, FALLBACK_KEY_COLUMN};
use crate::error::{CdcError, SnapshotError};
use crate::events::{CellValue, Row};
use crate::source::SourceRowReader;
use crate::store::TargetCollectionStore;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// 테이블 목록 쿼리의 가짜 테이블명 (에러 문맥용)
const TABLE_LIST: &str = "information_schema.TABLES";

/// 테이블 하나의 스냅샷 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableReport {
    pub table: String,
    /// 읽은 행 수
    pub rows: usize,
    /// 새로 삽입된 문서 수
    pub inserted: usize,
    /// 같은 키가 반복되어 upsert로 덮어쓴 행 수
    pub merged: usize,
    /// 키 값이 NULL이라 건너뛴 행 수
    pub skipped: usize,
}

/// 스냅샷 전체 결과
#[derive(Debug, Default)]
pub struct SnapshotReport {
    /// 성공한 테이블
    pub tables: Vec<TableReport>,
    /// 실패한 테이블
    pub failed: Vec<SnapshotError>,
    pub elapsed: Duration,
}

impl SnapshotReport {
    pub fn total_rows(&self) -> usize {
        self.tables.iter().map(|t| t.rows).sum()
    }

    /// 실패한 테이블이 있으면 [`SnapshotError::Multiple`]
    pub fn into_result(self) -> Result<SnapshotReport, SnapshotError> {
        if self.failed.is_empty() {
            Ok(self)
        } else {
            Err(SnapshotError::Multiple(self.failed))
        }
    }
}

/// 스냅샷 로더
pub struct SnapshotLoader {
    reader: Arc<dyn SourceRowReader>,
    store: Arc<dyn TargetCollectionStore>,
    filter: TableFilter,
    parallelism: usize,
}

impl SnapshotLoader {
    pub fn new(
        reader: Arc<dyn SourceRowReader>,
        store: Arc<dyn TargetCollectionStore>,
        filter: TableFilter,
        parallelism: usize,
    ) -> Self {
        SnapshotLoader {
            reader,
            store,
            filter,
            parallelism: parallelism.max(1),
        }
    }

    /// 전체 스냅샷. 한 테이블이라도 실패하면 [`SnapshotError::Multiple`]
    pub async fn load_all(&self) -> Result<SnapshotReport, SnapshotError> {
        self.load().await?.into_result()
    }

    /// 전체 스냅샷. 테이블 단위 실패는 보고서에 담아 반환
    ///
    /// 테이블 목록 조회 실패와 대상 초기화 실패만 즉시 에러입니다.
    pub async fn load(&self) -> Result<SnapshotReport, SnapshotError> {
        let started = Instant::now();
        let schema = self.reader.schema().to_string();
        info!("Starting snapshot of {}", schema);

        let tables = self.list_tables(&schema).await?;
        info!("Found {} tables to snapshot: {:?}", tables.len(), tables);

        self.store.drop_all().await.map_err(SnapshotError::Clear)?;

        let results: Vec<Result<TableReport, SnapshotError>> = stream::iter(tables)
            .map(|table| {
                let schema = schema.as_str();
                async move { self.load_table(schema, &table).await }
            })
            .buffer_unordered(self.parallelism)
            .collect()
            .await;

        let mut report = SnapshotReport::default();
        for result in results {
            match result {
                Ok(table) => report.tables.push(table),
                Err(e) => {
                    warn!("Snapshot failed: {}", e);
                    report.failed.push(e);
                }
            }
        }
        report.tables.sort_by(|a, b| a.table.cmp(&b.table));
        report.elapsed = started.elapsed();

        info!(
            "Full Dump: {} tables, {} rows in {:?} ({} failed)",
            report.tables.len(),
            report.total_rows(),
            report.elapsed,
            report.failed.len()
        );
        Ok(report)
    }

    async fn list_tables(&self, schema: &str) -> Result<Vec<String>, SnapshotError> {
        let rows = self
            .reader
            .query(TABLE_LIST, &list_tables_sql(schema))
            .await
            .map_err(|source| SnapshotError::SourceRead {
                table: TABLE_LIST.to_string(),
                source,
            })?;

        Ok(rows
            .iter()
            .filter_map(|row| row.get("table_name").and_then(CellValue::as_string))
            .filter(|table| self.filter.matches(table))
            .collect())
    }

    /// 키 컬럼 결정: 기본 키, 없으면 `id` 컬럼
    async fn key_columns(&self, schema: &str, table: &str) -> Result<Vec<String>, CdcError> {
        let rows = self
            .reader
            .query(table, &primary_key_sql(schema, table))
            .await?;
        let columns: Vec<String> = rows
            .iter()
            .filter_map(|row| row.get("column_name").and_then(CellValue::as_string))
            .collect();

        if columns.is_empty() {
            debug!("{} has no primary key, falling back to `{}`", table, FALLBACK_KEY_COLUMN);
            Ok(vec![FALLBACK_KEY_COLUMN.to_string()])
        } else {
            Ok(columns)
        }
    }

    async fn load_table(&self, schema: &str, table: &str) -> Result<TableReport, SnapshotError> {
        let source_read = |source| SnapshotError::SourceRead {
            table: table.to_string(),
            source,
        };
        let target_write = |source| SnapshotError::TargetWrite {
            table: table.to_string(),
            source,
        };

        let key_columns = self.key_columns(schema, table).await.map_err(source_read)?;
        let rows = self
            .reader
            .query(table, &select_all_sql(schema, table))
            .await
            .map_err(source_read)?;

        let mut report = TableReport {
            table: table.to_string(),
            rows: rows.len(),
            inserted: 0,
            merged: 0,
            skipped: 0,
        };
        if rows.is_empty() {
            debug!("{} is empty, nothing to insert", table);
            return Ok(report);
        }
        if !has_key_columns(&rows[0], &key_columns) {
            return Err(SnapshotError::MissingKey {
                table: table.to_string(),
            });
        }

        let mut documents = Vec::with_capacity(rows.len());
        let mut source_rows = Vec::with_capacity(rows.len());
        for row in &rows {
            match document_key(row, &key_columns) {
                Some(key) => {
                    documents.push(row_to_document(row, key.clone()));
                    source_rows.push((key, row));
                }
                None => report.skipped += 1,
            }
        }
        if report.skipped > 0 {
            warn!("{}: skipped {} rows with NULL key", table, report.skipped);
        }

        let result = self
            .store
            .bulk_insert(table, documents)
            .await
            .map_err(target_write)?;

        if let Some((index, reason)) = result.rejected.first() {
            let key = key_repr(&source_rows[*index].0);
            return Err(target_write(crate::error::StoreError::Rejected(format!(
                "{} rows rejected, first {}: {}",
                result.rejected.len(),
                key,
                reason
            ))));
        }

        // 같은 키가 여러 번 나오면 뒤의 행이 이김
        for index in &result.duplicates {
            let (key, row) = &source_rows[*index];
            self.store
                .upsert_by_key(table, key, field_document(row))
                .await
                .map_err(target_write)?;
        }

        report.inserted = result.inserted;
        report.merged = result.duplicates.len();
        info!("Snapshot complete for {}: {} rows", table, report.rows);
        Ok(report)
    }
}

fn has_key_columns(row: &Row, key_columns: &[String]) -> bool {
    key_columns.iter().all(|column| row.get(column).is_some())
}

fn quote_ident(name: &str) -> String {
    format!("`{}`", name.replace('`', "``"))
}

fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "''"))
}

/// 스키마의 기본 테이블 목록 (뷰 제외)
pub fn list_tables_sql(schema: &str) -> String {
    format!(
        "SELECT TABLE_NAME AS table_name FROM information_schema.TABLES \
         WHERE TABLE_SCHEMA = {} AND TABLE_TYPE = 'BASE TABLE' ORDER BY TABLE_NAME",
        quote_literal(schema)
    )
}

/// 테이블의 기본 키 컬럼 (키 순서)
pub fn primary_key_sql(schema: &str, table: &str) -> String {
    format!(
        "SELECT COLUMN_NAME AS column_name FROM information_schema.KEY_COLUMN_USAGE \
         WHERE TABLE_SCHEMA = {} AND TABLE_NAME = {} AND CONSTRAINT_NAME = 'PRIMARY' \
         ORDER BY ORDINAL_POSITION",
        quote_literal(schema),
        quote_literal(table)
    )
}

pub fn select_all_sql(schema: &str, table: &str) -> String {
    format!("SELECT * FROM {}.{}", quote_ident(schema), quote_ident(table))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::memory_store::MemoryStore;
    use async_trait::async_trait;
    use bson::{doc, Bson};
    use std::collections::{BTreeMap, HashMap, HashSet};

    /// 테이블 데이터를 메모리에 들고 있는 소스
    #[derive(Default)]
    pub(crate) struct FakeReader {
        pub tables: BTreeMap<String, Vec<Row>>,
        pub keys: HashMap<String, Vec<String>>,
        pub failing: HashSet<String>,
    }

    impl FakeReader {
        pub fn with_table(mut self, table: &str, key: &[&str], rows: Vec<Row>) -> Self {
            self.tables.insert(table.to_string(), rows);
            self.keys
                .insert(table.to_string(), key.iter().map(|k| k.to_string()).collect());
            self
        }
    }

    #[async_trait]
    impl SourceRowReader for FakeReader {
        fn schema(&self) -> &str {
            "shop"
        }

        async fn ping(&self) -> crate::error::Result<()> {
            Ok(())
        }

        async fn query(&self, table: &str, statement: &str) -> crate::error::Result<Vec<Row>> {
            if statement == list_tables_sql("shop") {
                return Ok(self
                    .tables
                    .keys()
                    .map(|t| Row::new().with("table_name", CellValue::String(t.clone())))
                    .collect());
            }
            if statement == primary_key_sql("shop", table) {
                return Ok(self
                    .keys
                    .get(table)
                    .into_iter()
                    .flatten()
                    .map(|k| Row::new().with("column_name", CellValue::String(k.clone())))
                    .collect());
            }
            if statement == select_all_sql("shop", table) {
                if self.failing.contains(table) {
                    return Err(CdcError::QueryError(format!("{}: table is corrupted", table)));
                }
                return Ok(self.tables.get(table).cloned().unwrap_or_default());
            }
            Err(CdcError::QueryError(format!("unexpected statement: {}", statement)))
        }

        async fn close(&self) -> crate::error::Result<()> {
            Ok(())
        }
    }

    pub(crate) fn user(id: i64, name: &str) -> Row {
        Row::new()
            .with("id", CellValue::Int64(id))
            .with("name", CellValue::String(name.to_string()))
    }

    fn loader(reader: FakeReader, store: Arc<MemoryStore>) -> SnapshotLoader {
        SnapshotLoader::new(Arc::new(reader), store, TableFilter::all(), 2)
    }

    #[tokio::test]
    async fn test_snapshot_converges_to_source_rows() {
        let reader = FakeReader::default().with_table(
            "users",
            &["id"],
            vec![user(1, "a"), user(2, "b"), user(3, "c")],
        );
        let store = Arc::new(MemoryStore::new());
        store.seed("users", doc! { "_id": 99_i64, "name": "stale" });

        let report = loader(reader, store.clone()).load_all().await.unwrap();

        assert_eq!(report.total_rows(), 3);
        assert_eq!(
            store.documents("users"),
            vec![
                doc! { "_id": 1_i64, "id": 1_i64, "name": "a" },
                doc! { "_id": 2_i64, "id": 2_i64, "name": "b" },
                doc! { "_id": 3_i64, "id": 3_i64, "name": "c" },
            ]
        );
        assert_eq!(store.drop_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_table_does_not_block_others() {
        let mut reader = FakeReader::default()
            .with_table("t1", &["id"], vec![user(1, "a")])
            .with_table("t2", &["id"], vec![user(1, "b"), user(2, "c")]);
        reader.failing.insert("t1".to_string());
        let store = Arc::new(MemoryStore::new());

        let report = loader(reader, store.clone()).load().await.unwrap();

        assert_eq!(report.tables.len(), 1);
        assert_eq!(report.tables[0].table, "t2");
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].table(), Some("t1"));
        assert_eq!(store.count("t2"), 2);
        assert_eq!(store.count("t1"), 0);

        let err = report.into_result().unwrap_err();
        assert!(matches!(err, SnapshotError::Multiple(ref errors) if errors.len() == 1));
    }

    #[tokio::test]
    async fn test_empty_table_is_noop() {
        let reader = FakeReader::default().with_table("empty", &["id"], vec![]);
        let store = Arc::new(MemoryStore::new());

        let report = loader(reader, store.clone()).load_all().await.unwrap();

        assert_eq!(report.tables[0].rows, 0);
        assert!(store.collection_names().is_empty());
    }

    #[tokio::test]
    async fn test_composite_key_and_id_fallback() {
        let order = |tenant: &str, seq: i64| {
            Row::new()
                .with("tenant", CellValue::String(tenant.to_string()))
                .with("seq", CellValue::Int64(seq))
        };
        let reader = FakeReader::default()
            .with_table("orders", &["tenant", "seq"], vec![order("acme", 1), order("acme", 2)])
            .with_table("logs", &[], vec![user(1, "first"), user(1, "second")]);
        let store = Arc::new(MemoryStore::new());

        let report = loader(reader, store.clone()).load_all().await.unwrap();

        let key = Bson::Document(doc! { "tenant": "acme", "seq": 2_i64 });
        assert_eq!(store.get("orders", &key).unwrap().get_i64("seq").unwrap(), 2);

        // 키가 반복되면 마지막 행이 남음
        assert_eq!(store.count("logs"), 1);
        assert_eq!(
            store.get("logs", &Bson::Int64(1)).unwrap().get_str("name").unwrap(),
            "second"
        );
        let logs = report.tables.iter().find(|t| t.table == "logs").unwrap();
        assert_eq!(logs.merged, 1);
    }

    #[tokio::test]
    async fn test_table_without_key_fails() {
        let row = Row::new().with("message", CellValue::String("hi".to_string()));
        let reader = FakeReader::default().with_table("notes", &[], vec![row]);
        let store = Arc::new(MemoryStore::new());

        let report = loader(reader, store).load().await.unwrap();

        assert!(matches!(
            report.failed.as_slice(),
            [SnapshotError::MissingKey { table }] if table == "notes"
        ));
    }

    #[tokio::test]
    async fn test_target_unreachable_fails_before_loading() {
        let reader = FakeReader::default().with_table("users", &["id"], vec![user(1, "a")]);
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);

        let err = loader(reader, store).load_all().await.unwrap_err();
        assert!(matches!(err, SnapshotError::Clear(_)));
    }

    #[tokio::test]
    async fn test_filter_limits_tables() {
        let reader = FakeReader::default()
            .with_table("users", &["id"], vec![user(1, "a")])
            .with_table("audit_log", &["id"], vec![user(1, "x")]);
        let store = Arc::new(MemoryStore::new());
        let filter = TableFilter::from_patterns("", "audit_.*").unwrap();

        SnapshotLoader::new(Arc::new(reader), store.clone(), filter, 4)
            .load_all()
            .await
            .unwrap();

        assert_eq!(store.collection_names(), vec!["users".to_string()]);
    }

    #[test]
    fn test_sql_quoting() {
        assert_eq!(select_all_sql("shop", "we`ird"), "SELECT * FROM `shop`.`we``ird`");
        assert!(list_tables_sql("o'brien").contains("'o''brien'"));
    }
}
