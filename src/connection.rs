//! MySQL 데이터베이스 연결 관리

use crate::error::{CdcError, Result};
use crate::events::{CellValue, Row};
use crate::offset::LogPosition;
use crate::source::SourceRowReader;
use async_trait::async_trait;
use chrono::NaiveDate;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::*;
use mysql_async::{Conn, Opts, OptsBuilder, Pool, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// MySQL binary 문자셋 번호
const BINARY_CHARSET: u16 = 63;

/// MySQL 연결 설정
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub hostname: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub database: Option<String>,
    /// binlog 복제 연결에 사용할 replica server id
    pub server_id: u32,
    pub timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            hostname: "localhost".to_string(),
            port: 3306,
            username: "root".to_string(),
            password: String::new(),
            database: None,
            server_id: 1001,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ConnectionConfig {
    pub fn new(hostname: impl Into<String>, username: impl Into<String>) -> Self {
        ConnectionConfig {
            hostname: hostname.into(),
            username: username.into(),
            ..Default::default()
        }
    }

    pub(crate) fn build_opts(&self) -> Result<Opts> {
        let connection_string = if let Some(ref db) = self.database {
            format!(
                "mysql://{}:{}@{}:{}/{}",
                self.username, self.password, self.hostname, self.port, db
            )
        } else {
            format!(
                "mysql://{}:{}@{}:{}",
                self.username, self.password, self.hostname, self.port
            )
        };

        let opts: Opts = connection_string
            .parse()
            .map_err(|_| CdcError::ConnectionError("Failed to parse connection string".to_string()))?;

        // binlog의 TIMESTAMP는 UTC epoch이므로 스냅샷도 UTC로 읽음
        Ok(OptsBuilder::from_opts(opts)
            .init(vec!["SET time_zone = '+00:00'"])
            .into())
    }
}

/// MySQL 연결 풀 래퍼
pub struct MySqlConnection {
    pool: Pool,
    config: ConnectionConfig,
    schema: String,
}

impl MySqlConnection {
    pub async fn connect(config: ConnectionConfig) -> Result<Self> {
        let schema = config
            .database
            .clone()
            .ok_or_else(|| CdcError::ConnectionError("No database selected".to_string()))?;
        let pool = Pool::new(config.build_opts()?);

        let conn = tokio::time::timeout(config.timeout, pool.get_conn())
            .await
            .map_err(|_| CdcError::ConnectionError("Timed out connecting to MySQL".to_string()))?
            .map_err(|e| CdcError::ConnectionError(format!("Failed to connect to MySQL: {}", e)))?;
        drop(conn);

        debug!("Connected to MySQL at {}:{}", config.hostname, config.port);
        Ok(MySqlConnection {
            pool,
            config,
            schema,
        })
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    async fn conn(&self) -> Result<Conn> {
        self.pool
            .get_conn()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to get connection: {}", e)))
    }

    /// 현재 binlog 끝 위치 조회
    pub async fn get_binlog_status(&self) -> Result<LogPosition> {
        let mut conn = self.conn().await?;

        // MySQL 8.2+는 SHOW BINARY LOG STATUS, 그 이전은 SHOW MASTER STATUS
        let row: Option<mysql_async::Row> = match conn.query_first("SHOW BINARY LOG STATUS").await {
            Ok(row) => row,
            Err(_) => conn
                .query_first("SHOW MASTER STATUS")
                .await
                .map_err(|e| CdcError::QueryError(format!("Failed to query binlog status: {}", e)))?,
        };

        let row = row.ok_or_else(|| {
            CdcError::QueryError("No binlog status available (is log_bin enabled?)".to_string())
        })?;
        let file: String = row
            .get(0)
            .ok_or_else(|| CdcError::QueryError("Missing binlog file".to_string()))?;
        let position: u64 = row
            .get(1)
            .ok_or_else(|| CdcError::QueryError("Missing binlog position".to_string()))?;

        Ok(LogPosition::new(file, position))
    }

    /// 변수 조회
    pub async fn get_variable(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.conn().await?;
        let query = format!("SHOW GLOBAL VARIABLES LIKE '{}'", name);
        let result: Vec<(String, String)> = conn
            .query(&query)
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query {}: {}", name, e)))?;

        Ok(result.into_iter().next().map(|(_, v)| v))
    }

    /// Binlog 형식 확인 (ROW, STATEMENT, MIXED)
    pub async fn get_binlog_format(&self) -> Result<String> {
        self.get_variable("binlog_format")
            .await?
            .ok_or_else(|| CdcError::QueryError("Binlog format not found".to_string()))
    }

    /// 테이블 스키마 조회
    pub async fn get_table_schema(&self, database: &str, table: &str) -> Result<Vec<ColumnInfo>> {
        let mut conn = self.conn().await?;
        let result: Vec<(String, String)> = conn
            .exec(
                "SELECT COLUMN_NAME, COLUMN_TYPE \
                 FROM INFORMATION_SCHEMA.COLUMNS \
                 WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? \
                 ORDER BY ORDINAL_POSITION",
                (database, table),
            )
            .await
            .map_err(|e| CdcError::QueryError(format!("Failed to query table schema: {}", e)))?;

        Ok(result
            .into_iter()
            .map(|(name, column_type)| ColumnInfo { name, column_type })
            .collect())
    }

    /// 기본 키 컬럼 (키 순서)
    pub async fn get_primary_key(&self, database: &str, table: &str) -> Result<Vec<String>> {
        let mut conn = self.conn().await?;
        conn.exec(
            "SELECT COLUMN_NAME FROM INFORMATION_SCHEMA.KEY_COLUMN_USAGE \
             WHERE TABLE_SCHEMA = ? AND TABLE_NAME = ? AND CONSTRAINT_NAME = 'PRIMARY' \
             ORDER BY ORDINAL_POSITION",
            (database, table),
        )
        .await
        .map_err(|e| CdcError::QueryError(format!("Failed to query primary key: {}", e)))
    }
}

#[async_trait]
impl SourceRowReader for MySqlConnection {
    fn schema(&self) -> &str {
        &self.schema
    }

    async fn ping(&self) -> Result<()> {
        let mut conn = self.conn().await?;
        conn.ping()
            .await
            .map_err(|e| CdcError::ConnectionError(format!("MySQL ping failed: {}", e)))
    }

    async fn query(&self, table: &str, statement: &str) -> Result<Vec<Row>> {
        let mut conn = self.conn().await?;
        let rows: Vec<mysql_async::Row> = conn
            .exec(statement, ())
            .await
            .map_err(|e| CdcError::QueryError(format!("{}: {}", table, e)))?;

        Ok(rows.into_iter().map(convert_row).collect())
    }

    async fn close(&self) -> Result<()> {
        self.pool.clone().disconnect().await?;
        Ok(())
    }
}

/// 테이블 컬럼 정보
#[derive(Debug, Clone)]
pub struct ColumnInfo {
    pub name: String,
    /// INFORMATION_SCHEMA.COLUMNS.COLUMN_TYPE (e.g., "enum('a','b')")
    pub column_type: String,
}

impl ColumnInfo {
    /// 값 해석 힌트 (COLUMN_TYPE 문자열 기준)
    pub fn hint(&self) -> ValueHint {
        let ty = self.column_type.to_ascii_lowercase();
        if ty.starts_with("decimal") {
            ValueHint::Decimal
        } else if ty == "json" {
            ValueHint::Json
        } else if ty == "date" {
            ValueHint::Date
        } else if ty.starts_with("timestamp") {
            ValueHint::Timestamp
        } else if ty.starts_with("year") {
            ValueHint::Year
        } else if ty.starts_with("enum(") {
            ValueHint::Enum(parse_members(self.column_type.get(5..).unwrap_or_default()))
        } else if ty.starts_with("set(") {
            ValueHint::Set(parse_members(self.column_type.get(4..).unwrap_or_default()))
        } else if ty.starts_with("bit") || ty.contains("binary") || ty.contains("blob") {
            ValueHint::Binary
        } else {
            ValueHint::Text
        }
    }
}

/// `'a','b''c')` 형태의 ENUM/SET 멤버 목록
fn parse_members(list: &str) -> Vec<String> {
    let mut members = Vec::new();
    let mut chars = list.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\'' {
            continue;
        }
        let mut member = String::new();
        while let Some(c) = chars.next() {
            if c != '\'' {
                member.push(c);
            } else if chars.peek() == Some(&'\'') {
                chars.next();
                member.push('\'');
            } else {
                break;
            }
        }
        members.push(member);
    }
    members
}

/// MySQL 값 → 셀 값 변환 시 타입 힌트
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueHint {
    Text,
    Binary,
    Decimal,
    Json,
    Date,
    Timestamp,
    Year,
    /// 선언 순서의 ENUM 멤버
    Enum(Vec<String>),
    /// 선언 순서의 SET 멤버
    Set(Vec<String>),
}

impl ValueHint {
    fn from_column(column: &mysql_async::Column) -> Self {
        match column.column_type() {
            ColumnType::MYSQL_TYPE_DECIMAL | ColumnType::MYSQL_TYPE_NEWDECIMAL => ValueHint::Decimal,
            ColumnType::MYSQL_TYPE_JSON => ValueHint::Json,
            ColumnType::MYSQL_TYPE_DATE | ColumnType::MYSQL_TYPE_NEWDATE => ValueHint::Date,
            ColumnType::MYSQL_TYPE_TIMESTAMP | ColumnType::MYSQL_TYPE_TIMESTAMP2 => {
                ValueHint::Timestamp
            }
            ColumnType::MYSQL_TYPE_YEAR => ValueHint::Year,
            _ if column.character_set() == BINARY_CHARSET => ValueHint::Binary,
            _ => ValueHint::Text,
        }
    }
}

fn convert_row(row: mysql_async::Row) -> Row {
    let columns = row.columns();
    let values = row.unwrap();
    columns
        .iter()
        .zip(values)
        .map(|(column, value)| {
            (
                column.name_str().into_owned(),
                convert_value(&ValueHint::from_column(column), value),
            )
        })
        .collect()
}

/// YEAR는 프로토콜에 따라 정수 또는 문자열로 옴
fn year_value(value: &Value) -> Option<i32> {
    match value {
        Value::Int(y) => i32::try_from(*y).ok(),
        Value::UInt(y) => i32::try_from(*y).ok(),
        Value::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.trim().parse().ok(),
        _ => None,
    }
}

/// MySQL 값을 셀 값으로 변환
pub fn convert_value(hint: &ValueHint, value: Value) -> CellValue {
    if *hint == ValueHint::Year {
        if let Some(year) = year_value(&value) {
            return CellValue::Int32(year);
        }
    }

    match value {
        Value::NULL => CellValue::Null,
        Value::Int(i) => CellValue::Int64(i),
        Value::UInt(u) => CellValue::UInt64(u),
        Value::Float(f) => CellValue::Float(f),
        Value::Double(d) => CellValue::Double(d),
        Value::Bytes(bytes) => match hint {
            ValueHint::Decimal => CellValue::Decimal(String::from_utf8_lossy(&bytes).into_owned()),
            ValueHint::Json => match serde_json::from_slice(&bytes) {
                Ok(json) => CellValue::Json(json),
                Err(e) => {
                    warn!("Invalid JSON column value, keeping as string: {}", e);
                    CellValue::String(String::from_utf8_lossy(&bytes).into_owned())
                }
            },
            ValueHint::Binary => CellValue::Bytes(bytes),
            _ => match String::from_utf8(bytes) {
                Ok(s) => CellValue::String(s),
                Err(e) => CellValue::Bytes(e.into_bytes()),
            },
        },
        Value::Date(year, month, day, hour, minute, second, micros) => {
            let date_str = format!("{:04}-{:02}-{:02}", year, month, day);
            if *hint == ValueHint::Date {
                return CellValue::Date(date_str);
            }
            NaiveDate::from_ymd_opt(i32::from(year), u32::from(month), u32::from(day))
                .and_then(|d| {
                    d.and_hms_micro_opt(u32::from(hour), u32::from(minute), u32::from(second), micros)
                })
                .map(|naive| CellValue::DateTime(naive.and_utc()))
                // 0000-00-00 같은 값은 문자열로 보존
                .unwrap_or_else(|| {
                    CellValue::String(format!(
                        "{} {:02}:{:02}:{:02}.{:06}",
                        date_str, hour, minute, second, micros
                    ))
                })
        }
        Value::Time(negative, days, hours, minutes, seconds, micros) => {
            let total_hours = days * 24 + u32::from(hours);
            let sign = if negative { "-" } else { "" };
            let time = if micros > 0 {
                format!("{}{:02}:{:02}:{:02}.{:06}", sign, total_hours, minutes, seconds, micros)
            } else {
                format!("{}{:02}:{:02}:{:02}", sign, total_hours, minutes, seconds)
            };
            CellValue::Time(time)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_config_default() {
        let config = ConnectionConfig::default();
        assert_eq!(config.hostname, "localhost");
        assert_eq!(config.port, 3306);
    }

    #[test]
    fn test_connection_config_new() {
        let config = ConnectionConfig::new("127.0.0.1", "root");
        assert_eq!(config.hostname, "127.0.0.1");
        assert_eq!(config.username, "root");
    }

    #[test]
    fn test_convert_decimal_and_json() {
        assert_eq!(
            convert_value(&ValueHint::Decimal, Value::Bytes(b"12.50".to_vec())),
            CellValue::Decimal("12.50".to_string())
        );
        assert_eq!(
            convert_value(&ValueHint::Json, Value::Bytes(br#"{"a":1}"#.to_vec())),
            CellValue::Json(serde_json::json!({ "a": 1 }))
        );
    }

    #[test]
    fn test_convert_datetime_and_zero_date() {
        let value = convert_value(&ValueHint::Text, Value::Date(2024, 3, 1, 12, 30, 0, 0));
        assert!(matches!(value, CellValue::DateTime(dt) if dt.to_rfc3339() == "2024-03-01T12:30:00+00:00"));

        let zero = convert_value(&ValueHint::Text, Value::Date(0, 0, 0, 0, 0, 0, 0));
        assert!(matches!(zero, CellValue::String(s) if s.starts_with("0000-00-00")));

        let date = convert_value(&ValueHint::Date, Value::Date(2024, 3, 1, 0, 0, 0, 0));
        assert_eq!(date, CellValue::Date("2024-03-01".to_string()));
    }

    #[test]
    fn test_convert_time() {
        assert_eq!(
            convert_value(&ValueHint::Text, Value::Time(true, 1, 2, 3, 4, 0)),
            CellValue::Time("-26:03:04".to_string())
        );
    }

    #[test]
    fn test_column_hint() {
        let column = |column_type: &str| ColumnInfo {
            name: "c".to_string(),
            column_type: column_type.to_string(),
        };
        assert_eq!(column("decimal(10,2)").hint(), ValueHint::Decimal);
        assert_eq!(column("timestamp(3)").hint(), ValueHint::Timestamp);
        assert_eq!(column("year").hint(), ValueHint::Year);
        assert_eq!(column("bit(8)").hint(), ValueHint::Binary);
        assert_eq!(column("bigint unsigned").hint(), ValueHint::Text);
        assert_eq!(
            column("enum('new','paid','it''s, done')").hint(),
            ValueHint::Enum(vec![
                "new".to_string(),
                "paid".to_string(),
                "it's, done".to_string()
            ])
        );
        assert_eq!(
            column("SET('a','b','c')").hint(),
            ValueHint::Set(vec!["a".to_string(), "b".to_string(), "c".to_string()])
        );
    }

    #[test]
    fn test_convert_year_from_any_form() {
        for value in [
            Value::UInt(2024),
            Value::Int(2024),
            Value::Bytes(b"2024".to_vec()),
        ] {
            assert_eq!(convert_value(&ValueHint::Year, value), CellValue::Int32(2024));
        }
    }
}
