//! Binlog 처리 위치 추적 및 복제 상태
//!
//! Binlog 파일명 + 위치로 스트리밍 재개 지점을 표시합니다.
//! 예: "mysql-bin.000003" 파일의 4097 바이트 위치

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// 소스 변경 로그 위치. 코디네이터는 내용을 해석하지 않고 그대로 전달합니다.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LogPosition {
    /// 바이너리 로그 파일명 (e.g., "mysql-bin.000001")
    pub filename: String,
    /// 바이트 위치
    pub position: u64,
}

impl LogPosition {
    pub fn new(filename: impl Into<String>, position: u64) -> Self {
        LogPosition {
            filename: filename.into(),
            position,
        }
    }

    /// 파일명에서 시퀀스 번호 추출
    pub fn file_sequence(&self) -> Option<u64> {
        self.filename
            .rsplit('.')
            .next()
            .and_then(|s| s.parse().ok())
    }
}

impl PartialOrd for LogPosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for LogPosition {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.file_sequence(), other.file_sequence()) {
            (Some(a), Some(b)) => a.cmp(&b),
            _ => self.filename.cmp(&other.filename),
        }
        .then(self.position.cmp(&other.position))
    }
}

impl fmt::Display for LogPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.filename, self.position)
    }
}

/// 복제 코디네이터 상태
///
/// `Initializing → Snapshotting → Streaming → (Degraded ⇄ Streaming) → ShuttingDown`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicationState {
    /// 연결 확인 및 시작 위치 고정
    Initializing,
    /// 전체 스냅샷 처리 중
    Snapshotting,
    /// 스트리밍 처리 중
    Streaming,
    /// 연결 장애로 소비 중단, 백오프 재시도 중
    Degraded,
    /// 종료 중 (종착 상태)
    ShuttingDown,
}

impl ReplicationState {
    /// 허용된 상태 전이인지 확인
    pub fn can_transition_to(self, next: ReplicationState) -> bool {
        use ReplicationState::*;
        matches!(
            (self, next),
            (Initializing, Snapshotting)
                | (Initializing, Streaming)
                | (Snapshotting, Streaming)
                | (Streaming, Degraded)
                | (Degraded, Streaming)
                | (_, ShuttingDown)
        ) && self != ShuttingDown
    }
}

impl fmt::Display for ReplicationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_position_parse() {
        let pos = LogPosition::new("mysql-bin.000123", 4096);
        assert_eq!(pos.file_sequence(), Some(123));
        assert_eq!(pos.to_string(), "mysql-bin.000123:4096");
    }

    #[test]
    fn test_log_position_order_across_files() {
        let a = LogPosition::new("mysql-bin.000009", 90_000);
        let b = LogPosition::new("mysql-bin.000010", 4);
        let c = LogPosition::new("mysql-bin.000010", 120);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_state_transitions() {
        use ReplicationState::*;
        assert!(Initializing.can_transition_to(Snapshotting));
        assert!(Streaming.can_transition_to(Degraded));
        assert!(Degraded.can_transition_to(Streaming));
        assert!(Snapshotting.can_transition_to(ShuttingDown));
        assert!(!Snapshotting.can_transition_to(Degraded));
        assert!(!ShuttingDown.can_transition_to(ShuttingDown));
    }
}
