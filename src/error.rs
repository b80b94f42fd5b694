//! 복제 파이프라인 에러 타입
//!
//! 컴포넌트 경계에서 드라이버 에러를 이 타입들로 변환하고,
//! 코디네이터는 [`FailureClass`] 분류만 보고 분기합니다.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// 소스(MySQL) 측 에러
#[derive(Error, Debug)]
pub enum CdcError {
    #[error("MySQL 연결 에러: {0}")]
    ConnectionError(String),

    #[error("Binlog 파싱 에러: {0}")]
    BinlogParseError(String),

    #[error("유효하지 않은 이벤트: {0}")]
    InvalidEvent(String),

    #[error("쿼리 실행 에러: {0}")]
    QueryError(String),

    #[error("I/O 에러: {0}")]
    IoError(String),
}

impl CdcError {
    /// 같은 위치에서 다시 읽어도 반복되는 에러는 Fatal, 연결 문제는 Retryable
    pub fn class(&self) -> FailureClass {
        match self {
            CdcError::BinlogParseError(_) | CdcError::InvalidEvent(_) => FailureClass::Fatal,
            CdcError::ConnectionError(_) | CdcError::QueryError(_) | CdcError::IoError(_) => {
                FailureClass::Retryable
            }
        }
    }
}

impl From<io::Error> for CdcError {
    fn from(err: io::Error) -> Self {
        CdcError::IoError(err.to_string())
    }
}

impl From<mysql_async::Error> for CdcError {
    fn from(err: mysql_async::Error) -> Self {
        match err {
            mysql_async::Error::Server(e) => CdcError::QueryError(e.to_string()),
            other => CdcError::ConnectionError(other.to_string()),
        }
    }
}

/// 대상 저장소(문서 DB) 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// 연결 끊김, 서버 선택 실패 등 (재시도 가능)
    #[error("대상 저장소에 연결할 수 없습니다: {0}")]
    Unavailable(String),

    /// 대상 측 검증 실패 (재시도 불가)
    #[error("대상 저장소가 쓰기를 거부했습니다: {0}")]
    Rejected(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// 스냅샷 에러
#[derive(Error, Debug)]
pub enum SnapshotError {
    #[error("테이블 `{table}` 읽기 실패: {source}")]
    SourceRead {
        table: String,
        #[source]
        source: CdcError,
    },

    #[error("컬렉션 `{table}` 쓰기 실패: {source}")]
    TargetWrite {
        table: String,
        #[source]
        source: StoreError,
    },

    #[error("테이블 `{table}`에 기본 키도 `id` 컬럼도 없습니다")]
    MissingKey { table: String },

    #[error("대상 데이터베이스 초기화 실패: {0}")]
    Clear(#[source] StoreError),

    #[error("{} 개 테이블 스냅샷 실패: [{}]", .0.len(), failed_tables(.0))]
    Multiple(Vec<SnapshotError>),
}

impl SnapshotError {
    /// 실패한 테이블명 (테이블 단위 에러만)
    pub fn table(&self) -> Option<&str> {
        match self {
            SnapshotError::SourceRead { table, .. }
            | SnapshotError::TargetWrite { table, .. }
            | SnapshotError::MissingKey { table } => Some(table),
            SnapshotError::Clear(_) | SnapshotError::Multiple(_) => None,
        }
    }
}

fn failed_tables(errors: &[SnapshotError]) -> String {
    errors
        .iter()
        .filter_map(SnapshotError::table)
        .collect::<Vec<_>>()
        .join(", ")
}

/// 변경 이벤트 적용 에러
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApplyError {
    #[error("대상 저장소 연결 끊김 ({table}): {message}")]
    TargetUnavailable { table: String, message: String },

    #[error("잘못된 이벤트 ({table}): {reason}")]
    MalformedEvent { table: String, reason: String },

    #[error("대상 저장소가 쓰기를 거부함 ({table}): {reason}")]
    WriteRejected { table: String, reason: String },
}

impl ApplyError {
    pub fn class(&self) -> FailureClass {
        match self {
            ApplyError::TargetUnavailable { .. } => FailureClass::Retryable,
            ApplyError::MalformedEvent { .. } | ApplyError::WriteRejected { .. } => {
                FailureClass::Skip
            }
        }
    }
}

/// 코디네이터로 전달되는 에러 분류
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// 프로세스 중단
    Fatal,
    /// 백오프 후 재시도
    Retryable,
    /// 기록 후 다음 이벤트로 진행
    Skip,
}

/// 코디네이터 에러 (모두 Fatal)
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("설정 에러: {0}")]
    Config(#[from] ConfigError),

    #[error("소스 데이터베이스에 연결할 수 없습니다: {0}")]
    SourceUnreachable(#[source] CdcError),

    #[error("대상 저장소에 연결할 수 없습니다: {0}")]
    TargetUnreachable(#[source] StoreError),

    #[error("변경 로그를 읽을 수 없습니다: {0}")]
    SourceFailed(#[source] CdcError),

    #[error("스냅샷 실패: {0}")]
    Snapshot(#[from] SnapshotError),

    #[error("재시도 한도 초과 ({attempts}회, {elapsed:?}): {cause}")]
    BackoffExhausted {
        attempts: u32,
        elapsed: Duration,
        cause: String,
    },

    #[error("테이블 `{0}` 작업자가 예기치 않게 종료되었습니다")]
    LaneClosed(String),

    #[error("내부 작업 실패: {0}")]
    Task(String),
}

/// 설정 에러
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("필수 환경 변수 `{0}`가 없습니다")]
    Missing(String),

    #[error("환경 변수 `{key}` 값 `{value}`를 해석할 수 없습니다")]
    Invalid { key: String, value: String },

    #[error("테이블 필터 정규식 에러: {0}")]
    Pattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, CdcError>;
