//! MongoDB 대상 저장소

use crate::config::MongoConfig;
use crate::document::ID_FIELD;
use crate::error::StoreError;
use crate::store::{BulkInsertReport, StoreResult, TargetCollectionStore};
use async_trait::async_trait;
use bson::{doc, Bson, Document};
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure, RETRYABLE_WRITE_ERROR};
use mongodb::{Client, Collection, Database};
use tracing::{debug, info};

/// 중복 키 에러 코드
const DUPLICATE_KEY: i32 = 11000;

/// 일시적 장애로 보는 서버 에러 코드
/// (HostUnreachable, HostNotFound, NetworkTimeout, ShutdownInProgress, PrimarySteppedDown,
/// NotWritablePrimary, InterruptedAtShutdown, InterruptedDueToReplStateChange, NotPrimaryOrSecondary,
/// NotPrimaryNoSecondaryOk, ExceededTimeLimit)
const TRANSIENT_CODES: [i32; 11] = [6, 7, 89, 91, 189, 10107, 11600, 11602, 13436, 13435, 262];

/// MongoDB 저장소
pub struct MongoStore {
    client: Client,
    database: Database,
}

impl MongoStore {
    pub async fn connect(config: &MongoConfig) -> StoreResult<Self> {
        let client = Client::with_uri_str(&config.url)
            .await
            .map_err(classify)?;
        let database = client.database(&config.database);

        info!("Using MongoDB database {}", config.database);
        Ok(MongoStore { client, database })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.database.collection(name)
    }
}

#[async_trait]
impl TargetCollectionStore for MongoStore {
    async fn ping(&self) -> StoreResult<()> {
        self.database
            .run_command(doc! { "ping": 1 })
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn drop_all(&self) -> StoreResult<()> {
        info!("Dropping MongoDB database {}", self.database.name());
        self.database.drop().await.map_err(classify)
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<BulkInsertReport> {
        let total = documents.len();
        if total == 0 {
            return Ok(BulkInsertReport::default());
        }

        let result = self
            .collection(collection)
            .insert_many(documents)
            .ordered(false)
            .await;

        let err = match result {
            Ok(inserted) => return Ok(BulkInsertReport::all_inserted(inserted.inserted_ids.len())),
            Err(err) => err,
        };

        let ErrorKind::InsertMany(failure) = err.kind.as_ref() else {
            return Err(classify(err));
        };
        if failure.write_concern_error.is_some() {
            return Err(StoreError::Unavailable(err.to_string()));
        }

        let mut report = BulkInsertReport::default();
        for write_error in failure.write_errors.iter().flatten() {
            if write_error.code == DUPLICATE_KEY {
                report.duplicates.push(write_error.index);
            } else if TRANSIENT_CODES.contains(&write_error.code) {
                return Err(StoreError::Unavailable(write_error.message.clone()));
            } else {
                report
                    .rejected
                    .push((write_error.index, write_error.message.clone()));
            }
        }
        report.inserted = total - report.duplicates.len() - report.rejected.len();

        debug!(
            "insert_many into {}: {} inserted, {} duplicates, {} rejected",
            collection,
            report.inserted,
            report.duplicates.len(),
            report.rejected.len()
        );
        Ok(report)
    }

    async fn upsert_by_key(&self, collection: &str, key: &Bson, fields: Document) -> StoreResult<()> {
        let filter = doc! { ID_FIELD: key.clone() };
        let coll = self.collection(collection);

        if !needs_literal_merge(&fields) {
            return coll
                .update_one(filter, doc! { "$set": fields })
                .upsert(true)
                .await
                .map(|_| ())
                .map_err(classify);
        }

        // 같은 키는 한 작업자만 쓰므로 읽고 합친 뒤 교체해도 안전
        let mut document = coll
            .find_one(filter.clone())
            .await
            .map_err(classify)?
            .unwrap_or_else(|| doc! { ID_FIELD: key.clone() });
        for (name, value) in fields {
            if name != ID_FIELD {
                document.insert(name, value);
            }
        }
        coll.replace_one(filter, document)
            .upsert(true)
            .await
            .map(|_| ())
            .map_err(classify)
    }

    async fn delete_by_key(&self, collection: &str, key: &Bson) -> StoreResult<bool> {
        let result = self
            .collection(collection)
            .delete_one(doc! { ID_FIELD: key.clone() })
            .await
            .map_err(classify)?;
        Ok(result.deleted_count > 0)
    }

    async fn close(&self) -> StoreResult<()> {
        self.client.clone().shutdown().await;
        Ok(())
    }
}

/// `$set`이 경로로 해석할 필드명이 있으면 `true`
///
/// `insert_many`는 `a.b` 같은 필드명을 그대로 저장하므로, 같은 행이 같은 모양의
/// 문서가 되도록 이 경우엔 문서 전체를 교체합니다. 빈 필드는 기존 문서를 지우지 않도록
/// 같은 경로로 처리합니다.
fn needs_literal_merge(fields: &Document) -> bool {
    fields.is_empty()
        || fields
            .keys()
            .any(|name| name.contains('.') || name.starts_with('$'))
}

/// 드라이버 에러를 재시도 가능 / 불가로 분류
fn classify(err: MongoError) -> StoreError {
    let code = match err.kind.as_ref() {
        ErrorKind::Command(command) => Some(command.code),
        ErrorKind::Write(WriteFailure::WriteError(write)) => Some(write.code),
        _ => None,
    };

    let transient = err.contains_label(RETRYABLE_WRITE_ERROR)
        || code.is_some_and(|c| TRANSIENT_CODES.contains(&c))
        || matches!(
            err.kind.as_ref(),
            ErrorKind::Io(_)
                | ErrorKind::ServerSelection { .. }
                | ErrorKind::ConnectionPoolCleared { .. }
                | ErrorKind::Shutdown
        );

    if transient {
        StoreError::Unavailable(err.to_string())
    } else {
        StoreError::Rejected(err.to_string())
    }
}
