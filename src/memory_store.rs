//! 인메모리 대상 저장소
//!
//! MongoDB와 같은 `_id` 매칭 의미를 가지며, 장애 주입을 지원합니다.
//! 테스트와 드라이런 용도입니다.

use crate::document::{key_repr, ID_FIELD};
use crate::error::StoreError;
use crate::store::{BulkInsertReport, StoreResult, TargetCollectionStore};
use async_trait::async_trait;
use bson::{Bson, Document};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

#[derive(Default)]
struct State {
    collections: HashMap<String, BTreeMap<String, Document>>,
    /// 남은 장애 횟수. `u32::MAX`이면 해제될 때까지 장애
    unavailable: u32,
    /// 거부할 (컬렉션, 키) 쌍
    rejected_keys: HashSet<(String, String)>,
    drops: usize,
}

impl State {
    fn check_available(&mut self) -> StoreResult<()> {
        match self.unavailable {
            0 => Ok(()),
            u32::MAX => Err(StoreError::Unavailable("store is down".to_string())),
            _ => {
                self.unavailable -= 1;
                Err(StoreError::Unavailable("transient store failure".to_string()))
            }
        }
    }

    fn is_rejected(&self, collection: &str, key: &str) -> bool {
        self.rejected_keys
            .contains(&(collection.to_string(), key.to_string()))
    }
}

/// 인메모리 저장소
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 저장소 전체 장애 설정 / 해제
    pub fn set_unavailable(&self, down: bool) {
        self.state.write().unavailable = if down { u32::MAX } else { 0 };
    }

    /// 다음 `count`번의 연산을 장애로 실패시킴
    pub fn fail_next(&self, count: u32) {
        self.state.write().unavailable = count;
    }

    /// 해당 키 문서의 쓰기를 거부
    pub fn reject_key(&self, collection: &str, key: &Bson) {
        self.state
            .write()
            .rejected_keys
            .insert((collection.to_string(), key_repr(key)));
    }

    /// 컬렉션의 문서 목록 (키 표현 순)
    pub fn documents(&self, collection: &str) -> Vec<Document> {
        self.state
            .read()
            .collections
            .get(collection)
            .map(|docs| docs.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, collection: &str, key: &Bson) -> Option<Document> {
        self.state
            .read()
            .collections
            .get(collection)
            .and_then(|docs| docs.get(&key_repr(key)).cloned())
    }

    pub fn count(&self, collection: &str) -> usize {
        self.state
            .read()
            .collections
            .get(collection)
            .map_or(0, BTreeMap::len)
    }

    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.read().collections.keys().cloned().collect();
        names.sort();
        names
    }

    /// `drop_all` 호출 횟수
    pub fn drop_count(&self) -> usize {
        self.state.read().drops
    }

    /// 테스트 준비용 직접 삽입
    pub fn seed(&self, collection: &str, document: Document) {
        let Some(key) = document.get(ID_FIELD).map(key_repr) else {
            return;
        };
        self.state
            .write()
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(key, document);
    }
}

#[async_trait]
impl TargetCollectionStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        self.state.write().check_available()
    }

    async fn drop_all(&self) -> StoreResult<()> {
        let mut state = self.state.write();
        state.check_available()?;
        state.collections.clear();
        state.drops += 1;
        Ok(())
    }

    async fn bulk_insert(
        &self,
        collection: &str,
        documents: Vec<Document>,
    ) -> StoreResult<BulkInsertReport> {
        let mut state = self.state.write();
        state.check_available()?;

        let mut report = BulkInsertReport::default();
        let mut accepted = Vec::with_capacity(documents.len());
        {
            let existing = state.collections.get(collection);
            let mut seen = HashSet::new();
            for (index, document) in documents.into_iter().enumerate() {
                let Some(key) = document.get(ID_FIELD).map(key_repr) else {
                    report.rejected.push((index, "document has no _id".to_string()));
                    continue;
                };
                if state.is_rejected(collection, &key) {
                    report.rejected.push((index, format!("write rejected for {}", key)));
                } else if existing.is_some_and(|docs| docs.contains_key(&key))
                    || !seen.insert(key.clone())
                {
                    report.duplicates.push(index);
                } else {
                    accepted.push((key, document));
                }
            }
        }

        report.inserted = accepted.len();
        state
            .collections
            .entry(collection.to_string())
            .or_default()
            .extend(accepted);
        Ok(report)
    }

    async fn upsert_by_key(&self, collection: &str, key: &Bson, fields: Document) -> StoreResult<()> {
        let mut state = self.state.write();
        state.check_available()?;

        let repr = key_repr(key);
        if state.is_rejected(collection, &repr) {
            return Err(StoreError::Rejected(format!("write rejected for {}", repr)));
        }

        let docs = state.collections.entry(collection.to_string()).or_default();
        let document = docs.entry(repr).or_insert_with(|| {
            let mut doc = Document::new();
            doc.insert(ID_FIELD, key.clone());
            doc
        });
        for (name, value) in fields {
            if name != ID_FIELD {
                document.insert(name, value);
            }
        }
        Ok(())
    }

    async fn delete_by_key(&self, collection: &str, key: &Bson) -> StoreResult<bool> {
        let mut state = self.state.write();
        state.check_available()?;

        Ok(state
            .collections
            .get_mut(collection)
            .is_some_and(|docs| docs.remove(&key_repr(key)).is_some()))
    }

    async fn close(&self) -> StoreResult<()> {
        Ok(())
    }
}
