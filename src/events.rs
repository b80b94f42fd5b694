//! 변경 이벤트 및 행 데이터 구조 정의

use crate::offset::LogPosition;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 셀 값 (다양한 MySQL 타입 지원)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CellValue {
    Null,
    Int8(i8),
    Int16(i16),
    Int32(i32),
    Int64(i64),
    UInt8(u8),
    UInt16(u16),
    UInt32(u32),
    UInt64(u64),
    Float(f32),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
    DateTime(DateTime<Utc>),
    Date(String),
    Time(String),
    Decimal(String),
    Json(serde_json::Value),
}

impl CellValue {
    pub fn as_string(&self) -> Option<String> {
        match self {
            CellValue::String(s) | CellValue::Decimal(s) => Some(s.clone()),
            CellValue::Bytes(b) => String::from_utf8(b.clone()).ok(),
            CellValue::Int32(i) => Some(i.to_string()),
            CellValue::Int64(i) => Some(i.to_string()),
            CellValue::UInt64(u) => Some(u.to_string()),
            CellValue::Double(d) => Some(d.to_string()),
            CellValue::DateTime(dt) => Some(dt.to_rfc3339()),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, CellValue::Null)
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Null => write!(f, "NULL"),
            CellValue::Int8(v) => write!(f, "{}", v),
            CellValue::Int16(v) => write!(f, "{}", v),
            CellValue::Int32(v) => write!(f, "{}", v),
            CellValue::Int64(v) => write!(f, "{}", v),
            CellValue::UInt8(v) => write!(f, "{}", v),
            CellValue::UInt16(v) => write!(f, "{}", v),
            CellValue::UInt32(v) => write!(f, "{}", v),
            CellValue::UInt64(v) => write!(f, "{}", v),
            CellValue::Float(v) => write!(f, "{}", v),
            CellValue::Double(v) => write!(f, "{}", v),
            CellValue::String(s)
            | CellValue::Date(s)
            | CellValue::Time(s)
            | CellValue::Decimal(s) => write!(f, "{}", s),
            CellValue::Bytes(b) => write!(f, "0x{}", b.iter().map(|x| format!("{:02x}", x)).collect::<String>()),
            CellValue::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            CellValue::Json(v) => write!(f, "{}", v),
        }
    }
}

/// 한 테이블의 행 (컬럼 순서 유지)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Row {
    columns: Vec<(String, CellValue)>,
}

impl Row {
    pub fn new() -> Self {
        Row::default()
    }

    /// 컬럼 추가. 같은 이름이 있으면 값만 교체 (위치 유지)
    pub fn insert(&mut self, column: impl Into<String>, value: CellValue) {
        let column = column.into();
        match self.columns.iter_mut().find(|(name, _)| *name == column) {
            Some((_, existing)) => *existing = value,
            None => self.columns.push((column, value)),
        }
    }

    /// 빌더 형태의 컬럼 추가
    pub fn with(mut self, column: impl Into<String>, value: CellValue) -> Self {
        self.insert(column, value);
        self
    }

    pub fn get(&self, column: &str) -> Option<&CellValue> {
        self.columns
            .iter()
            .find(|(name, _)| name == column)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CellValue)> {
        self.columns.iter().map(|(name, value)| (name.as_str(), value))
    }

    pub fn column_names(&self) -> impl Iterator<Item = &str> {
        self.columns.iter().map(|(name, _)| name.as_str())
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

impl FromIterator<(String, CellValue)> for Row {
    fn from_iter<I: IntoIterator<Item = (String, CellValue)>>(iter: I) -> Self {
        let mut row = Row::new();
        for (column, value) in iter {
            row.insert(column, value);
        }
        row
    }
}

/// 영향받은 행 하나의 변경 전후 이미지
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    pub before: Option<Row>,
    pub after: Option<Row>,
}

impl RowChange {
    pub fn inserted(after: Row) -> Self {
        RowChange {
            before: None,
            after: Some(after),
        }
    }

    pub fn updated(before: Row, after: Row) -> Self {
        RowChange {
            before: Some(before),
            after: Some(after),
        }
    }

    pub fn deleted(before: Row) -> Self {
        RowChange {
            before: Some(before),
            after: None,
        }
    }
}

/// 변경 연산 타입
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl ChangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        }
    }
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// CDC 변경 이벤트 (한 binlog rows 이벤트 = 한 테이블의 행 묶음)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// 데이터베이스명
    pub database: String,
    /// 테이블명 (대상 컬렉션명과 동일)
    pub table: String,
    /// 연산 타입
    pub kind: ChangeKind,
    /// 식별 키 컬럼 (순서 유지)
    pub key_columns: Vec<String>,
    /// 영향받은 행들
    pub rows: Vec<RowChange>,
    /// 이 이벤트 이후의 로그 위치
    pub position: Option<LogPosition>,
    /// 타임스탬프
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    pub fn new(table: impl Into<String>, kind: ChangeKind, key_columns: Vec<String>) -> Self {
        ChangeEvent {
            database: String::new(),
            table: table.into(),
            kind,
            key_columns,
            rows: Vec::new(),
            position: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_row(mut self, row: RowChange) -> Self {
        self.rows.push(row);
        self
    }

    pub fn with_position(mut self, position: LogPosition) -> Self {
        self.position = Some(position);
        self
    }

    /// 연산에 맞는 대표 이미지 (Insert/Update: after, Delete: before)
    pub fn image<'a>(&self, change: &'a RowChange) -> Option<&'a Row> {
        match self.kind {
            ChangeKind::Insert | ChangeKind::Update => change.after.as_ref(),
            ChangeKind::Delete => change.before.as_ref().or(change.after.as_ref()),
        }
    }
}
