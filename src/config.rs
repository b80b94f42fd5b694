//! 복제 설정 (환경 변수 기반)

use crate::backoff::BackoffConfig;
use crate::connection::ConnectionConfig;
use crate::error::ConfigError;
use regex::Regex;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// 스냅샷 모드
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotMode {
    /// 초기 스냅샷 + 스트리밍
    Initial,
    /// 스냅샷 스킵
    Never,
}

impl FromStr for SnapshotMode {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "initial" => Ok(SnapshotMode::Initial),
            "never" => Ok(SnapshotMode::Never),
            _ => Err(()),
        }
    }
}

/// 테이블 포함/제외 필터
///
/// 포함 목록이 비어 있으면 모든 테이블이 대상입니다. 제외가 포함보다 우선합니다.
#[derive(Debug, Clone, Default)]
pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TableFilter {
    pub fn all() -> Self {
        TableFilter::default()
    }

    /// 쉼표로 구분된 정규식 목록에서 생성 (각 패턴은 테이블명 전체와 매칭)
    pub fn from_patterns(include: &str, exclude: &str) -> Result<Self, ConfigError> {
        Ok(TableFilter {
            include: compile_patterns(include)?,
            exclude: compile_patterns(exclude)?,
        })
    }

    pub fn matches(&self, table: &str) -> bool {
        if self.exclude.iter().any(|re| re.is_match(table)) {
            return false;
        }
        self.include.is_empty() || self.include.iter().any(|re| re.is_match(table))
    }
}

fn compile_patterns(list: &str) -> Result<Vec<Regex>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .map(|p| Regex::new(&format!("^(?:{})$", p)).map_err(ConfigError::from))
        .collect()
}

/// 대상 MongoDB 설정
#[derive(Debug, Clone)]
pub struct MongoConfig {
    pub url: String,
    pub database: String,
}

/// 전체 복제 설정
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub mysql: ConnectionConfig,
    pub mongodb: MongoConfig,
    pub snapshot_mode: SnapshotMode,
    pub tables: TableFilter,
    /// 스냅샷 시 동시에 처리할 테이블 수
    pub snapshot_parallelism: usize,
    /// 스트리밍 시 동시에 적용할 이벤트 수 (테이블 간)
    pub apply_concurrency: usize,
    /// 테이블별 대기 이벤트 버퍼 크기
    pub table_buffer: usize,
    /// 소스 이벤트 채널 버퍼 크기
    pub event_buffer: usize,
    pub backoff: BackoffConfig,
    /// 종료 시 진행 중인 적용을 기다리는 최대 시간
    pub drain_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        SyncConfig {
            mysql: ConnectionConfig::default(),
            mongodb: MongoConfig {
                url: "mongodb://localhost:27017".to_string(),
                database: String::new(),
            },
            snapshot_mode: SnapshotMode::Initial,
            tables: TableFilter::all(),
            snapshot_parallelism: 4,
            apply_concurrency: 8,
            table_buffer: 256,
            event_buffer: 1024,
            backoff: BackoffConfig::default(),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    /// 프로세스 환경 변수에서 읽기
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// 임의의 조회 함수에서 읽기
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = SyncConfig::default();
        let vars = Vars { lookup: &lookup };

        let database = vars
            .get("MYSQL_DATABASE")
            .or_else(|| vars.get("MYSQL_DB_NAME"))
            .ok_or_else(|| ConfigError::Missing("MYSQL_DATABASE".to_string()))?;

        let mysql = ConnectionConfig {
            hostname: vars.get("MYSQL_HOST").unwrap_or(defaults.mysql.hostname),
            port: vars.parse("MYSQL_PORT", defaults.mysql.port)?,
            username: vars.get("MYSQL_USER").unwrap_or(defaults.mysql.username),
            password: vars.get("MYSQL_ROOT_PASSWORD").unwrap_or_default(),
            database: Some(database),
            server_id: vars.parse("MYSQL_SERVER_ID", defaults.mysql.server_id)?,
            timeout: defaults.mysql.timeout,
        };

        let mongodb = MongoConfig {
            url: vars.get("MONGODB_URL").unwrap_or(defaults.mongodb.url),
            database: vars
                .get("MONGODB_NAME")
                .ok_or_else(|| ConfigError::Missing("MONGODB_NAME".to_string()))?,
        };

        let snapshot_mode = match vars.get("SYNC_SNAPSHOT_MODE") {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key: "SYNC_SNAPSHOT_MODE".to_string(),
                value,
            })?,
            None => defaults.snapshot_mode,
        };

        let tables = TableFilter::from_patterns(
            &vars.get("SYNC_INCLUDE_TABLES").unwrap_or_default(),
            &vars.get("SYNC_EXCLUDE_TABLES").unwrap_or_default(),
        )?;

        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(vars.parse(
                "SYNC_BACKOFF_INITIAL_MS",
                defaults.backoff.initial_delay.as_millis() as u64,
            )?),
            max_delay: Duration::from_millis(vars.parse(
                "SYNC_BACKOFF_MAX_MS",
                defaults.backoff.max_delay.as_millis() as u64,
            )?),
            ceiling: Duration::from_secs(
                vars.parse("SYNC_BACKOFF_CEILING_SECS", defaults.backoff.ceiling.as_secs())?,
            ),
        };

        Ok(SyncConfig {
            mysql,
            mongodb,
            snapshot_mode,
            tables,
            snapshot_parallelism: vars
                .parse("SYNC_SNAPSHOT_PARALLELISM", defaults.snapshot_parallelism)?
                .max(1),
            apply_concurrency: vars
                .parse("SYNC_APPLY_CONCURRENCY", defaults.apply_concurrency)?
                .max(1),
            table_buffer: vars.parse("SYNC_TABLE_BUFFER", defaults.table_buffer)?.max(1),
            event_buffer: vars.parse("SYNC_EVENT_BUFFER", defaults.event_buffer)?.max(1),
            backoff,
            drain_timeout: Duration::from_secs(
                vars.parse("SYNC_DRAIN_TIMEOUT_SECS", defaults.drain_timeout.as_secs())?,
            ),
        })
    }
}

struct Vars<'a, F: Fn(&str) -> Option<String>> {
    lookup: &'a F,
}

impl<F: Fn(&str) -> Option<String>> Vars<'_, F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|v| !v.trim().is_empty())
    }

    fn parse<T: FromStr>(&self, key: &str, default: T) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
            None => Ok(default),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_from_lookup_defaults() {
        let config =
            SyncConfig::from_lookup(lookup(&[("MYSQL_DATABASE", "shop"), ("MONGODB_NAME", "mirror")]))
                .unwrap();
        assert_eq!(config.mysql.hostname, "localhost");
        assert_eq!(config.mysql.port, 3306);
        assert_eq!(config.mysql.database.as_deref(), Some("shop"));
        assert_eq!(config.mongodb.database, "mirror");
        assert_eq!(config.snapshot_mode, SnapshotMode::Initial);
        assert!(config.tables.matches("anything"));
    }

    #[test]
    fn test_legacy_database_variable() {
        let config =
            SyncConfig::from_lookup(lookup(&[("MYSQL_DB_NAME", "shop"), ("MONGODB_NAME", "mirror")]))
                .unwrap();
        assert_eq!(config.mysql.database.as_deref(), Some("shop"));
    }

    #[test]
    fn test_missing_target_namespace() {
        let err = SyncConfig::from_lookup(lookup(&[("MYSQL_DATABASE", "shop")])).unwrap_err();
        assert!(matches!(err, ConfigError::Missing(key) if key == "MONGODB_NAME"));
    }

    #[test]
    fn test_invalid_number_is_rejected() {
        let err = SyncConfig::from_lookup(lookup(&[
            ("MYSQL_DATABASE", "shop"),
            ("MONGODB_NAME", "mirror"),
            ("MYSQL_PORT", "not-a-port"),
        ]))
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key, .. } if key == "MYSQL_PORT"));
    }

    #[test]
    fn test_tuning_overrides() {
        let config = SyncConfig::from_lookup(lookup(&[
            ("MYSQL_DATABASE", "shop"),
            ("MONGODB_NAME", "mirror"),
            ("SYNC_SNAPSHOT_MODE", "never"),
            ("SYNC_SNAPSHOT_PARALLELISM", "0"),
            ("SYNC_BACKOFF_CEILING_SECS", "5"),
        ]))
        .unwrap();
        assert_eq!(config.snapshot_mode, SnapshotMode::Never);
        assert_eq!(config.snapshot_parallelism, 1);
        assert_eq!(config.backoff.ceiling, Duration::from_secs(5));
    }

    #[test]
    fn test_table_filter() {
        let filter = TableFilter::from_patterns("users, order_.*", "order_archive").unwrap();
        assert!(filter.matches("users"));
        assert!(filter.matches("order_items"));
        assert!(!filter.matches("order_archive"));
        assert!(!filter.matches("audit_users"));
    }
}
