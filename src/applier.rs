//! 변경 이벤트 적용
//!
//! 모든 쓰기는 `_id` 기준 upsert / delete로 표현해 같은 이벤트를 다시 적용해도
//! 결과가 같습니다 (at-least-once 전달 대응).
//!
//! - INSERT: 순서 없는 벌크 삽입, 중복 키는 upsert로 전환 (배치 내 중복은 뒤의 행이 이김)
//! - UPDATE: 행 순서대로 upsert. 키가 바뀌었으면 이전 키 문서를 먼저 삭제
//! - DELETE: 키로 삭제. 문서가 없으면 no-op

use crate::document::{document_key, field_document, key_repr, row_to_document};
use crate::error::{ApplyError, StoreError};
use crate::events::{ChangeEvent, ChangeKind, Row};
use crate::store::TargetCollectionStore;
use bson::Bson;
use std::sync::Arc;
use tracing::debug;

/// 배치 안에서 실패한 행
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowFailure {
    /// 이벤트 내 행 인덱스
    pub index: usize,
    /// 키 표현 (키를 못 구했으면 `None`)
    pub key: Option<String>,
    pub error: ApplyError,
}

/// 이벤트 하나의 적용 결과
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOutcome {
    pub table: String,
    pub kind: ChangeKind,
    /// 쓰기가 반영된 행 수
    pub applied: usize,
    /// 이미 반영되어 있어 바뀐 것이 없는 행 수 (없는 문서 삭제 등)
    pub noop: usize,
    /// 건너뛴 행
    pub failures: Vec<RowFailure>,
}

impl ApplyOutcome {
    fn new(event: &ChangeEvent) -> Self {
        ApplyOutcome {
            table: event.table.clone(),
            kind: event.kind,
            applied: 0,
            noop: 0,
            failures: Vec::new(),
        }
    }

    /// 일부 행만 반영됨
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    /// 실패한 행의 키 목록
    pub fn failed_keys(&self) -> Vec<&str> {
        self.failures
            .iter()
            .filter_map(|f| f.key.as_deref())
            .collect()
    }
}

/// 키를 구한 행
struct KeyedRow<'a> {
    index: usize,
    key: Bson,
    row: &'a Row,
}

/// 변경 이벤트 적용기
#[derive(Clone)]
pub struct ChangeApplier {
    store: Arc<dyn TargetCollectionStore>,
}

impl ChangeApplier {
    pub fn new(store: Arc<dyn TargetCollectionStore>) -> Self {
        ChangeApplier { store }
    }

    /// 이벤트 적용
    ///
    /// 대상 연결 장애는 이벤트 전체를 [`ApplyError::TargetUnavailable`]로 돌려주고
    /// (다시 적용해도 안전), 행 단위 실패는 결과에 담습니다.
    /// 모든 행이 실패하면 첫 번째 행의 에러를 돌려줍니다.
    pub async fn apply(&self, event: &ChangeEvent) -> Result<ApplyOutcome, ApplyError> {
        if event.table.is_empty() {
            return Err(ApplyError::MalformedEvent {
                table: event.table.clone(),
                reason: "event has no table".to_string(),
            });
        }
        if event.key_columns.is_empty() {
            return Err(self.malformed(event, "table has no key columns"));
        }

        let mut outcome = ApplyOutcome::new(event);
        let rows = self.keyed_rows(event, &mut outcome);

        match event.kind {
            ChangeKind::Insert => self.apply_insert(event, rows, &mut outcome).await?,
            ChangeKind::Update => self.apply_update(event, rows, &mut outcome).await?,
            ChangeKind::Delete => self.apply_delete(event, rows, &mut outcome).await?,
        }

        if !event.rows.is_empty() && outcome.failures.len() == event.rows.len() {
            return Err(outcome.failures.swap_remove(0).error);
        }

        debug!(
            "DONE {} {}: {} applied, {} noop, {} failed",
            event.kind,
            event.table,
            outcome.applied,
            outcome.noop,
            outcome.failures.len()
        );
        Ok(outcome)
    }

    fn malformed(&self, event: &ChangeEvent, reason: impl Into<String>) -> ApplyError {
        ApplyError::MalformedEvent {
            table: event.table.clone(),
            reason: reason.into(),
        }
    }

    /// 행 이미지와 키를 구하고, 못 구한 행은 실패로 기록
    fn keyed_rows<'a>(&self, event: &'a ChangeEvent, outcome: &mut ApplyOutcome) -> Vec<KeyedRow<'a>> {
        let mut keyed = Vec::with_capacity(event.rows.len());
        for (index, change) in event.rows.iter().enumerate() {
            let Some(row) = event.image(change) else {
                outcome.failures.push(RowFailure {
                    index,
                    key: None,
                    error: self.malformed(event, format!("row {} has no image", index)),
                });
                continue;
            };
            match document_key(row, &event.key_columns) {
                Some(key) => keyed.push(KeyedRow { index, key, row }),
                None => outcome.failures.push(RowFailure {
                    index,
                    key: None,
                    error: self.malformed(
                        event,
                        format!("row {} is missing key {:?}", index, event.key_columns),
                    ),
                }),
            }
        }
        keyed
    }

    /// 저장소 에러 분류. 연결 장애는 이벤트 전체 실패, 거부는 행 실패
    fn row_error(
        &self,
        event: &ChangeEvent,
        row: &KeyedRow<'_>,
        err: StoreError,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), ApplyError> {
        match err {
            StoreError::Unavailable(message) => Err(ApplyError::TargetUnavailable {
                table: event.table.clone(),
                message,
            }),
            StoreError::Rejected(reason) => {
                outcome.failures.push(RowFailure {
                    index: row.index,
                    key: Some(key_repr(&row.key)),
                    error: ApplyError::WriteRejected {
                        table: event.table.clone(),
                        reason,
                    },
                });
                Ok(())
            }
        }
    }

    async fn upsert(
        &self,
        event: &ChangeEvent,
        row: &KeyedRow<'_>,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), ApplyError> {
        match self
            .store
            .upsert_by_key(&event.table, &row.key, field_document(row.row))
            .await
        {
            Ok(()) => {
                outcome.applied += 1;
                Ok(())
            }
            Err(err) => self.row_error(event, row, err, outcome),
        }
    }

    async fn apply_insert(
        &self,
        event: &ChangeEvent,
        rows: Vec<KeyedRow<'_>>,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), ApplyError> {
        if rows.is_empty() {
            return Ok(());
        }

        let documents = rows
            .iter()
            .map(|r| row_to_document(r.row, r.key.clone()))
            .collect();
        let report = match self.store.bulk_insert(&event.table, documents).await {
            Ok(report) => report,
            Err(StoreError::Unavailable(message)) => {
                return Err(ApplyError::TargetUnavailable {
                    table: event.table.clone(),
                    message,
                })
            }
            // 배치 전체 거부면 행마다 upsert로 다시 시도해 실패 행을 가려냄
            Err(StoreError::Rejected(_)) => {
                for row in &rows {
                    self.upsert(event, row, outcome).await?;
                }
                return Ok(());
            }
        };
        outcome.applied += report.inserted;

        for (index, reason) in report.rejected {
            let row = &rows[index];
            self.row_error(event, row, StoreError::Rejected(reason), outcome)?;
        }

        // 재전달 또는 배치 내 중복: upsert로 전환 (요청 순서대로라 뒤의 행이 이김)
        let mut duplicates = report.duplicates;
        duplicates.sort_unstable();
        for index in duplicates {
            self.upsert(event, &rows[index], outcome).await?;
        }
        Ok(())
    }

    async fn apply_update(
        &self,
        event: &ChangeEvent,
        rows: Vec<KeyedRow<'_>>,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), ApplyError> {
        for row in &rows {
            let old_key = event.rows[row.index]
                .before
                .as_ref()
                .and_then(|before| document_key(before, &event.key_columns))
                .filter(|old| *old != row.key);

            if let Some(old_key) = old_key {
                debug!(
                    "{}: key changed {} -> {}",
                    event.table,
                    key_repr(&old_key),
                    key_repr(&row.key)
                );
                if let Err(err) = self.store.delete_by_key(&event.table, &old_key).await {
                    self.row_error(event, row, err, outcome)?;
                    continue;
                }
            }

            self.upsert(event, row, outcome).await?;
        }
        Ok(())
    }

    async fn apply_delete(
        &self,
        event: &ChangeEvent,
        rows: Vec<KeyedRow<'_>>,
        outcome: &mut ApplyOutcome,
    ) -> Result<(), ApplyError> {
        for row in &rows {
            match self.store.delete_by_key(&event.table, &row.key).await {
                Ok(true) => outcome.applied += 1,
                Ok(false) => outcome.noop += 1,
                Err(err) => self.row_error(event, row, err, outcome)?,
            }
        }
        Ok(())
    }
}
