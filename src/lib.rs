//! MySQL → MongoDB 변경 데이터 복제 (CDC)
//!
//! 시작 시 MySQL 스키마 전체를 MongoDB로 덤프한 뒤, binlog의 행 변경 이벤트를
//! 테이블별 순서를 지키며 같은 이름의 컬렉션에 반영합니다.
//! 주요 기능:
//! - 초기 전체 스냅샷 (테이블 단위 병렬, 실패 집계)
//! - 멱등 적용 (`_id` 기준 upsert / delete)
//! - 테이블별 순서 보장과 테이블 간 병렬 처리
//! - 연결 장애 시 백오프 재시도와 정상 종료

pub mod applier;
pub mod backoff;
pub mod binlog_client;
pub mod config;
pub mod connection;
pub mod coordinator;
pub mod dispatch;
pub mod document;
pub mod error;
pub mod events;
pub mod memory_store;
pub mod mongo_store;
pub mod offset;
pub mod snapshot;
pub mod source;
pub mod store;

pub use applier::{ApplyOutcome, ChangeApplier};
pub use binlog_client::BinlogEventSource;
pub use config::SyncConfig;
pub use connection::MySqlConnection;
pub use coordinator::{ReplicationCoordinator, RunSummary};
pub use error::{ApplyError, CdcError, CoordinatorError, Result, SnapshotError, StoreError};
pub use events::{ChangeEvent, ChangeKind, Row};
pub use mongo_store::MongoStore;
pub use offset::{LogPosition, ReplicationState};
pub use snapshot::SnapshotLoader;
pub use source::{ChangeEventSource, SourceRowReader};
pub use store::TargetCollectionStore;
