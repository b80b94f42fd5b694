//! MySQL Binlog 변경 이벤트 소스
//!
//! 복제 연결로 binlog를 구독하고 ROWS 이벤트를 [`ChangeEvent`]로 변환합니다.
//! binlog에는 컬럼명이 없으므로 INFORMATION_SCHEMA에서 읽은 테이블 메타데이터로
//! 순서대로 이름을 붙입니다.

use crate::config::TableFilter;
use crate::connection::{convert_value, ColumnInfo, MySqlConnection, ValueHint};
use crate::document::FALLBACK_KEY_COLUMN;
use crate::error::{CdcError, Result};
use crate::events::{CellValue, ChangeEvent, ChangeKind, Row, RowChange};
use crate::offset::LogPosition;
use crate::source::{ChangeEventSource, EventStream, SourceRowReader as _};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::StreamExt;
use mysql_async::binlog::events::{Event, EventData, RowsEventData};
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::{BinlogStream, BinlogStreamRequest, Conn, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// 테이블 메타데이터 캐시 항목
#[derive(Debug, Clone)]
struct TableMetadata {
    columns: Vec<ColumnInfo>,
    hints: Vec<ValueHint>,
    primary_key: Vec<String>,
}

impl TableMetadata {
    fn new(columns: Vec<ColumnInfo>, mut primary_key: Vec<String>) -> Self {
        if primary_key.is_empty() && columns.iter().any(|c| c.name == FALLBACK_KEY_COLUMN) {
            primary_key.push(FALLBACK_KEY_COLUMN.to_string());
        }
        let hints = columns.iter().map(ColumnInfo::hint).collect();
        TableMetadata {
            columns,
            hints,
            primary_key,
        }
    }

    /// binlog 행 이미지를 컬럼명이 붙은 행으로 변환
    ///
    /// MINIMAL row image에서 빠진 컬럼이나 부분 JSON 업데이트는 건너뜁니다.
    fn to_row(&self, row: &BinlogRow) -> Row {
        let mut out = Row::new();
        for index in 0..row.len() {
            let Some(value) = row.as_ref(index) else {
                continue;
            };
            let name = match self.columns.get(index) {
                Some(column) => column.name.clone(),
                None => format!("@{}", index),
            };
            match value {
                BinlogValue::Value(v) => {
                    let hint = self.hints.get(index).unwrap_or(&ValueHint::Text);
                    out.insert(name, convert_binlog_value(hint, v.clone()));
                }
                BinlogValue::Jsonb(jsonb) => {
                    let json = serde_json::Value::try_from(jsonb.clone())
                        .map(CellValue::Json)
                        .unwrap_or_else(|e| {
                            warn!("Failed to decode JSONB column {}: {}", name, e);
                            CellValue::Null
                        });
                    out.insert(name, json);
                }
                BinlogValue::JsonDiff(_) => {
                    debug!("Skipping partial JSON update for column {}", name);
                }
            }
        }
        out
    }
}

/// binlog 값을 스냅샷 쿼리로 읽은 값과 같은 셀 값으로 변환
///
/// binlog는 TIMESTAMP를 epoch 초, ENUM을 1부터 시작하는 멤버 번호,
/// SET을 리틀 엔디언 비트마스크로 기록합니다.
fn convert_binlog_value(hint: &ValueHint, value: Value) -> CellValue {
    match (hint, value) {
        (ValueHint::Timestamp, Value::Int(secs)) => timestamp_cell(secs, 0),
        (ValueHint::Timestamp, Value::Bytes(bytes)) => match parse_epoch(&bytes) {
            Some((secs, micros)) => timestamp_cell(secs, micros),
            None => convert_value(hint, Value::Bytes(bytes)),
        },
        (ValueHint::Enum(members), Value::Int(index)) => enum_member(members, index),
        (ValueHint::Set(members), Value::Bytes(mask)) => set_members(members, &mask),
        (hint, value) => convert_value(hint, value),
    }
}

/// "초" 또는 "초.마이크로초"
fn parse_epoch(bytes: &[u8]) -> Option<(i64, u32)> {
    let text = std::str::from_utf8(bytes).ok()?;
    let (secs, frac) = text.split_once('.').unwrap_or((text, ""));
    let micros = if frac.is_empty() {
        0
    } else {
        format!("{:0<6}", frac).get(..6)?.parse().ok()?
    };
    Some((secs.parse().ok()?, micros))
}

fn timestamp_cell(secs: i64, micros: u32) -> CellValue {
    if secs == 0 && micros == 0 {
        // 스냅샷 쪽 0000-00-00 표현과 맞춤
        return CellValue::String("0000-00-00 00:00:00.000000".to_string());
    }
    match Utc.timestamp_opt(secs, micros * 1_000).single() {
        Some(dt) => CellValue::DateTime(dt),
        None => CellValue::String(secs.to_string()),
    }
}

fn enum_member(members: &[String], index: i64) -> CellValue {
    match usize::try_from(index) {
        // 0은 잘못된 값이 들어간 ENUM (빈 문자열)
        Ok(0) => CellValue::String(String::new()),
        Ok(i) => members
            .get(i - 1)
            .map(|member| CellValue::String(member.clone()))
            .unwrap_or(CellValue::Int64(index)),
        Err(_) => CellValue::Int64(index),
    }
}

fn set_members(members: &[String], mask: &[u8]) -> CellValue {
    let selected: Vec<&str> = members
        .iter()
        .enumerate()
        .filter(|(bit, _)| {
            mask.get(bit / 8)
                .is_some_and(|byte| byte & (1 << (bit % 8)) != 0)
        })
        .map(|(_, member)| member.as_str())
        .collect();
    CellValue::String(selected.join(","))
}

/// 재구독에 쓸 수 있는 binlog 위치 추적
///
/// ROWS 이벤트는 앞선 TABLE_MAP 이벤트가 있어야 해석되므로, TABLE_MAP부터
/// 트랜잭션 경계(XID, QUERY)까지는 묶음 시작 위치에 고정합니다.
#[derive(Debug, Clone)]
struct ResumeCursor {
    /// 마지막으로 읽은 이벤트의 다음 위치
    current: LogPosition,
    /// TABLE_MAP 묶음 시작 위치
    pinned: Option<LogPosition>,
}

impl ResumeCursor {
    fn new(from: LogPosition) -> Self {
        ResumeCursor {
            current: from,
            pinned: None,
        }
    }

    fn rotate(&mut self, position: LogPosition) {
        self.current = position;
        self.pinned = None;
    }

    fn table_map(&mut self, next_pos: u64) {
        if self.pinned.is_none() {
            self.pinned = Some(self.current.clone());
        }
        self.advance(next_pos);
    }

    fn boundary(&mut self, next_pos: u64) {
        self.pinned = None;
        self.advance(next_pos);
    }

    /// `log_pos`가 0인 이벤트(인공 이벤트)는 위치를 바꾸지 않음
    fn advance(&mut self, next_pos: u64) {
        if next_pos > 0 {
            self.current.position = next_pos;
        }
    }

    fn resume_position(&self) -> LogPosition {
        self.pinned.clone().unwrap_or_else(|| self.current.clone())
    }
}

/// binlog 기반 변경 이벤트 소스
pub struct BinlogEventSource {
    connection: Arc<MySqlConnection>,
    buffer: usize,
}

impl BinlogEventSource {
    /// `buffer`는 소스 → 코디네이터 채널 크기 (배압 기준)
    pub fn new(connection: Arc<MySqlConnection>, buffer: usize) -> Self {
        BinlogEventSource {
            connection,
            buffer: buffer.max(1),
        }
    }
}

#[async_trait]
impl ChangeEventSource for BinlogEventSource {
    async fn current_position(&mut self) -> Result<LogPosition> {
        let format = self.connection.get_binlog_format().await?;
        if !format.eq_ignore_ascii_case("ROW") {
            warn!(
                "binlog_format is {}, row events will be missing (ROW is required)",
                format
            );
        }

        let position = self.connection.get_binlog_status().await?;
        info!("Current binlog: {}", position);
        Ok(position)
    }

    async fn subscribe(&mut self, from: LogPosition, filter: TableFilter) -> Result<EventStream> {
        let config = self.connection.config();
        let conn = Conn::new(config.build_opts()?)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to open replication connection: {}", e)))?;

        let request = BinlogStreamRequest::new(config.server_id)
            .with_filename(from.filename.as_bytes())
            .with_pos(from.position);
        let stream = conn
            .get_binlog_stream(request)
            .await
            .map_err(|e| CdcError::ConnectionError(format!("Failed to request binlog dump: {}", e)))?;

        info!("Starting binlog streaming from {}", from);

        let (tx, rx) = mpsc::channel(self.buffer);
        let reader = BinlogReader {
            connection: Arc::clone(&self.connection),
            schema: self.connection.schema().to_string(),
            filter,
            cursor: ResumeCursor::new(from),
            metadata: HashMap::new(),
        };
        tokio::spawn(reader.run(stream, tx));

        Ok(rx)
    }
}

/// ROWS 이벤트의 대상 테이블 정보
struct RowsTarget {
    database: String,
    table: String,
    kind: ChangeKind,
    column_count: usize,
    timestamp: u32,
}

/// 백그라운드 binlog 읽기 작업
struct BinlogReader {
    connection: Arc<MySqlConnection>,
    schema: String,
    filter: TableFilter,
    cursor: ResumeCursor,
    metadata: HashMap<String, Arc<TableMetadata>>,
}

impl BinlogReader {
    async fn run(
        mut self,
        mut stream: BinlogStream,
        tx: mpsc::Sender<std::result::Result<ChangeEvent, CdcError>>,
    ) {
        let mut event_count: u64 = 0;

        while let Some(next) = stream.next().await {
            let event = match next {
                Ok(event) => event,
                Err(e) => {
                    error!("Binlog streaming error: {}", e);
                    let _ = tx.send(Err(CdcError::from(e))).await;
                    return;
                }
            };

            let (target, rows_event) = match self.inspect(&stream, &event) {
                Ok(Some(found)) => found,
                Ok(None) => continue,
                Err(e) => {
                    error!("Failed to read binlog event after {}: {}", self.cursor.current, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            };

            let change = match self.resolve_metadata(&target).await {
                Ok(metadata) => Self::decode_rows(&stream, &rows_event, &metadata)
                    .map(|rows| self.build_event(target, &metadata, rows)),
                Err(e) => Err(e),
            };

            match change {
                Ok(change) => {
                    event_count += 1;
                    if tx.send(Ok(change)).await.is_err() {
                        debug!("Event receiver dropped, stopping binlog reader");
                        return;
                    }
                }
                Err(e) => {
                    error!("Failed to decode binlog event after {}: {}", self.cursor.current, e);
                    let _ = tx.send(Err(e)).await;
                    return;
                }
            }
        }

        info!(
            "Binlog streaming ended at {}. Total change events: {}",
            self.cursor.current, event_count
        );
        let _ = tx
            .send(Err(CdcError::ConnectionError("Binlog stream closed".to_string())))
            .await;
    }

    /// 위치 갱신 및 구독 대상 ROWS 이벤트 확인
    fn inspect<'e>(
        &mut self,
        stream: &BinlogStream,
        event: &'e Event,
    ) -> Result<Option<(RowsTarget, RowsEventData<'e>)>> {
        let next_pos = u64::from(event.header().log_pos());
        let data = event
            .read_data()
            .map_err(|e| CdcError::BinlogParseError(e.to_string()))?;

        let rows_event = match data {
            Some(EventData::RowsEvent(rows_event)) => rows_event,
            Some(EventData::RotateEvent(rotate)) => {
                self.cursor
                    .rotate(LogPosition::new(rotate.name().to_string(), rotate.position()));
                debug!("Binlog rotated to {}", self.cursor.current);
                return Ok(None);
            }
            Some(EventData::TableMapEvent(_)) => {
                self.cursor.table_map(next_pos);
                return Ok(None);
            }
            Some(EventData::XidEvent(_)) | Some(EventData::QueryEvent(_)) => {
                self.cursor.boundary(next_pos);
                return Ok(None);
            }
            _ => {
                self.cursor.advance(next_pos);
                return Ok(None);
            }
        };
        self.cursor.advance(next_pos);

        let tme = stream.get_tme(rows_event.table_id()).ok_or_else(|| {
            CdcError::InvalidEvent(format!("No table map for table id {}", rows_event.table_id()))
        })?;

        let database = tme.database_name().to_string();
        let table = tme.table_name().to_string();
        if database != self.schema || !self.filter.matches(&table) {
            return Ok(None);
        }

        let kind = match rows_event {
            RowsEventData::WriteRowsEvent(_) | RowsEventData::WriteRowsEventV1(_) => {
                ChangeKind::Insert
            }
            RowsEventData::DeleteRowsEvent(_) | RowsEventData::DeleteRowsEventV1(_) => {
                ChangeKind::Delete
            }
            _ => ChangeKind::Update,
        };

        let target = RowsTarget {
            database,
            table,
            kind,
            column_count: tme.columns_count() as usize,
            timestamp: event.header().timestamp(),
        };
        Ok(Some((target, rows_event)))
    }

    /// 캐시된 메타데이터가 binlog 컬럼 수와 다르면 다시 읽음
    async fn resolve_metadata(&mut self, target: &RowsTarget) -> Result<Arc<TableMetadata>> {
        let metadata = self.table_metadata(&target.database, &target.table, false).await?;
        if metadata.columns.len() == target.column_count {
            return Ok(metadata);
        }
        debug!(
            "Column count changed for {}.{}, reloading metadata",
            target.database, target.table
        );
        self.table_metadata(&target.database, &target.table, true).await
    }

    fn build_event(
        &self,
        target: RowsTarget,
        metadata: &TableMetadata,
        rows: Vec<RowChange>,
    ) -> ChangeEvent {
        debug!(
            "INCOMING: {}, TYPE: {}, TABLE: {}",
            rows.len(),
            target.kind,
            target.table
        );

        ChangeEvent {
            database: target.database,
            table: target.table,
            kind: target.kind,
            key_columns: metadata.primary_key.clone(),
            rows,
            position: Some(self.cursor.resume_position()),
            timestamp: Utc
                .timestamp_opt(i64::from(target.timestamp), 0)
                .single()
                .unwrap_or_else(Utc::now),
        }
    }

    /// ROWS 이벤트의 전후 이미지 변환
    fn decode_rows(
        stream: &BinlogStream,
        rows_event: &RowsEventData<'_>,
        metadata: &TableMetadata,
    ) -> Result<Vec<RowChange>> {
        let tme = stream.get_tme(rows_event.table_id()).ok_or_else(|| {
            CdcError::InvalidEvent(format!("No table map for table id {}", rows_event.table_id()))
        })?;

        rows_event
            .rows(tme)
            .map(|row| {
                let (before, after) = row.map_err(|e| CdcError::BinlogParseError(e.to_string()))?;
                Ok(RowChange {
                    before: before.as_ref().map(|r| metadata.to_row(r)),
                    after: after.as_ref().map(|r| metadata.to_row(r)),
                })
            })
            .collect()
    }

    /// 테이블 메타데이터 조회 (캐시)
    async fn table_metadata(
        &mut self,
        database: &str,
        table: &str,
        reload: bool,
    ) -> Result<Arc<TableMetadata>> {
        if !reload {
            if let Some(metadata) = self.metadata.get(table) {
                return Ok(Arc::clone(metadata));
            }
        }

        let columns = self.connection.get_table_schema(database, table).await?;
        let primary_key = self.connection.get_primary_key(database, table).await?;
        let metadata = Arc::new(TableMetadata::new(columns, primary_key));
        if metadata.primary_key.is_empty() {
            warn!(
                "Table {}.{} has no primary key or `{}` column; its events cannot be applied",
                database, table, FALLBACK_KEY_COLUMN
            );
        }
        debug!("Loaded metadata for {}.{}", database, table);

        self.metadata.insert(table.to_string(), Arc::clone(&metadata));
        Ok(metadata)
    }
}
