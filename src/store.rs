//! 대상 문서 저장소 인터페이스
//!
//! 컬렉션명은 소스 테이블명과 같고, 모든 키 기반 연산은 `_id` 필드로 매칭합니다.

use crate::error::StoreError;
use async_trait::async_trait;
use bson::{Bson, Document};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// 벌크 삽입 결과
///
/// 인덱스는 요청한 문서 목록 기준입니다.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BulkInsertReport {
    /// 새로 삽입된 문서 수
    pub inserted: usize,
    /// `_id` 중복으로 삽입되지 않은 문서
    pub duplicates: Vec<usize>,
    /// 검증 실패로 거부된 문서와 사유
    pub rejected: Vec<(usize, String)>,
}

impl BulkInsertReport {
    pub fn all_inserted(count: usize) -> Self {
        BulkInsertReport {
            inserted: count,
            ..Default::default()
        }
    }
}

/// 문서 저장소 연산
#[async_trait]
pub trait TargetCollectionStore: Send + Sync {
    /// 연결 확인
    async fn ping(&self) -> StoreResult<()>;

    /// 대상 데이터베이스 전체 삭제
    async fn drop_all(&self) -> StoreResult<()>;

    /// 순서 없는 벌크 삽입. 일부 문서 실패는 보고서에 담고 나머지는 계속 삽입
    async fn bulk_insert(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<BulkInsertReport>;

    /// `_id`가 `key`인 문서에 필드를 병합. 없으면 생성
    async fn upsert_by_key(&self, collection: &str, key: &Bson, fields: Document)
        -> StoreResult<()>;

    /// `_id`가 `key`인 문서 삭제. 삭제했으면 `true`, 없었으면 `false`
    async fn delete_by_key(&self, collection: &str, key: &Bson) -> StoreResult<bool>;

    /// 연결 해제
    async fn close(&self) -> StoreResult<()>;
}
