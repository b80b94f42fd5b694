//! 소스 측 협력자 인터페이스
//!
//! - [`SourceRowReader`]: 스냅샷용 임의 쿼리 실행
//! - [`ChangeEventSource`]: 로그 위치부터의 순서 있는 변경 이벤트 스트림

use crate::config::TableFilter;
use crate::error::{CdcError, Result};
use crate::events::{ChangeEvent, Row};
use crate::offset::LogPosition;
use async_trait::async_trait;
use tokio::sync::mpsc;

/// 변경 이벤트 스트림
///
/// `Some(Err(_))`는 소스 장애(재구독 대상), `None`은 소스가 정상 종료했음을 뜻합니다.
/// 채널이 bounded이므로 소비를 멈추면 소스에 배압이 걸립니다.
pub type EventStream = mpsc::Receiver<std::result::Result<ChangeEvent, CdcError>>;

/// 관계형 소스에 대한 쿼리 실행기
#[async_trait]
pub trait SourceRowReader: Send + Sync {
    /// 소스 스키마(데이터베이스)명
    fn schema(&self) -> &str;

    /// 연결 확인
    async fn ping(&self) -> Result<()>;

    /// 쿼리 실행. `table`은 에러 문맥용
    async fn query(&self, table: &str, statement: &str) -> Result<Vec<Row>>;

    /// 연결 해제
    async fn close(&self) -> Result<()>;
}

/// 변경 로그 리더
#[async_trait]
pub trait ChangeEventSource: Send {
    /// 현재 로그 끝 위치
    async fn current_position(&mut self) -> Result<LogPosition>;

    /// `from` 위치부터 필터에 맞는 테이블의 이벤트 구독
    async fn subscribe(&mut self, from: LogPosition, filter: TableFilter) -> Result<EventStream>;
}
