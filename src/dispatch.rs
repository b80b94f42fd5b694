//! 테이블별 순서 보장 디스패처
//!
//! 테이블마다 bounded 채널과 작업자 하나를 두어 같은 테이블 이벤트는 받은 순서대로,
//! 다른 테이블 이벤트는 세마포어가 허용하는 만큼 동시에 적용합니다.
//! 대상 연결 장애가 나면 작업자는 [`HealthSignal`]에 보고하고 복구될 때까지 기다립니다.

use crate::applier::{ApplyOutcome, ChangeApplier};
use crate::document::{document_key, key_repr};
use crate::error::FailureClass;
use crate::events::ChangeEvent;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// 대상 연결 상태
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkHealth {
    Healthy,
    /// 장애 보고됨, 복구 대기
    Degraded,
    /// 복구 포기
    Failed,
}

/// 작업자와 코디네이터가 공유하는 대상 연결 상태
#[derive(Clone)]
pub struct HealthSignal {
    tx: Arc<watch::Sender<LinkHealth>>,
}

impl Default for HealthSignal {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(LinkHealth::Healthy);
        HealthSignal { tx: Arc::new(tx) }
    }

    pub fn current(&self) -> LinkHealth {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LinkHealth> {
        self.tx.subscribe()
    }

    /// 장애 보고. Healthy에서 Degraded로 바뀌었으면 `true`
    pub fn report_unavailable(&self) -> bool {
        self.tx.send_if_modified(|health| {
            if *health == LinkHealth::Healthy {
                *health = LinkHealth::Degraded;
                true
            } else {
                false
            }
        })
    }

    pub fn set(&self, health: LinkHealth) {
        self.tx.send_replace(health);
    }

    /// Degraded가 끝날 때까지 대기. 복구되면 `true`, 포기되면 `false`
    pub async fn wait_healthy(&self) -> bool {
        let mut rx = self.tx.subscribe();
        let healthy = match rx.wait_for(|health| *health != LinkHealth::Degraded).await {
            Ok(health) => *health == LinkHealth::Healthy,
            Err(_) => false,
        };
        healthy
    }
}

/// 적용 통계
#[derive(Debug, Default)]
pub struct ApplyStats {
    events_applied: AtomicU64,
    events_skipped: AtomicU64,
    rows_applied: AtomicU64,
    rows_failed: AtomicU64,
    retries: AtomicU64,
}

/// 적용 통계 스냅샷
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub events_applied: u64,
    pub events_skipped: u64,
    pub rows_applied: u64,
    pub rows_failed: u64,
    pub retries: u64,
}

impl ApplyStats {
    fn record(&self, outcome: &ApplyOutcome) {
        self.events_applied.fetch_add(1, Ordering::Relaxed);
        self.rows_applied
            .fetch_add((outcome.applied + outcome.noop) as u64, Ordering::Relaxed);
        self.rows_failed
            .fetch_add(outcome.failures.len() as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            events_applied: self.events_applied.load(Ordering::Relaxed),
            events_skipped: self.events_skipped.load(Ordering::Relaxed),
            rows_applied: self.rows_applied.load(Ordering::Relaxed),
            rows_failed: self.rows_failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

/// 테이블별 작업자 묶음
pub struct TableDispatcher {
    applier: ChangeApplier,
    health: HealthSignal,
    stats: Arc<ApplyStats>,
    permits: Arc<Semaphore>,
    buffer: usize,
    lanes: HashMap<String, mpsc::Sender<ChangeEvent>>,
    workers: JoinSet<()>,
}

impl TableDispatcher {
    pub fn new(applier: ChangeApplier, health: HealthSignal, concurrency: usize, buffer: usize) -> Self {
        TableDispatcher {
            applier,
            health,
            stats: Arc::new(ApplyStats::default()),
            permits: Arc::new(Semaphore::new(concurrency.max(1))),
            buffer: buffer.max(1),
            lanes: HashMap::new(),
            workers: JoinSet::new(),
        }
    }

    /// 테이블 작업자의 입력 채널. 처음 보는 테이블이면 작업자를 띄움
    pub fn lane(&mut self, table: &str) -> mpsc::Sender<ChangeEvent> {
        if let Some(tx) = self.lanes.get(table) {
            return tx.clone();
        }

        let (tx, rx) = mpsc::channel(self.buffer);
        let worker = LaneWorker {
            table: table.to_string(),
            applier: self.applier.clone(),
            health: self.health.clone(),
            stats: self.stats.clone(),
            permits: self.permits.clone(),
        };
        self.workers.spawn(worker.run(rx));
        self.lanes.insert(table.to_string(), tx.clone());
        debug!("Started apply lane for {}", table);
        tx
    }

    pub fn lane_count(&self) -> usize {
        self.lanes.len()
    }

    /// 새 이벤트 수신을 멈추고 대기 중인 이벤트를 모두 적용한 뒤 종료
    ///
    /// `timeout` 안에 끝나지 않은 작업자는 중단합니다.
    pub async fn shutdown(mut self, timeout: Duration) -> StatsSnapshot {
        self.lanes.clear();

        let workers = &mut self.workers;
        let drained = tokio::time::timeout(timeout, async {
            while let Some(result) = workers.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        error!("Apply lane panicked: {}", e);
                    }
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(
                "Drain timed out after {:?}, aborting {} lanes",
                timeout,
                self.workers.len()
            );
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        self.stats.snapshot()
    }
}

struct LaneWorker {
    table: String,
    applier: ChangeApplier,
    health: HealthSignal,
    stats: Arc<ApplyStats>,
    permits: Arc<Semaphore>,
}

impl LaneWorker {
    async fn run(self, mut rx: mpsc::Receiver<ChangeEvent>) {
        while let Some(event) = rx.recv().await {
            if !self.apply_with_retry(&event).await {
                error!("Target gave up, stopping apply lane for {}", self.table);
                return;
            }
        }
        debug!("Apply lane for {} drained", self.table);
    }

    /// 적용하거나 건너뜀. 대상 복구를 포기했으면 `false`
    async fn apply_with_retry(&self, event: &ChangeEvent) -> bool {
        loop {
            let result = {
                let Ok(_permit) = self.permits.acquire().await else {
                    return false;
                };
                self.applier.apply(event).await
            };

            let err = match result {
                Ok(outcome) => {
                    for failure in &outcome.failures {
                        warn!(
                            table = %event.table,
                            kind = %event.kind,
                            row = failure.index,
                            key = failure.key.as_deref().unwrap_or("-"),
                            error = %failure.error,
                            "Skipping row"
                        );
                    }
                    self.stats.record(&outcome);
                    return true;
                }
                Err(err) => err,
            };

            match err.class() {
                FailureClass::Retryable => {
                    self.stats.retries.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        table = %event.table,
                        kind = %event.kind,
                        error = %err,
                        "Target unavailable, waiting for recovery"
                    );
                    self.health.report_unavailable();
                    if !self.health.wait_healthy().await {
                        return false;
                    }
                }
                FailureClass::Skip | FailureClass::Fatal => {
                    self.stats.events_skipped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        table = %event.table,
                        kind = %event.kind,
                        keys = ?event_keys(event),
                        error = %err,
                        "Skipping event"
                    );
                    return true;
                }
            }
        }
    }
}

/// 이벤트가 건드린 행들의 키 (로그용)
fn event_keys(event: &ChangeEvent) -> Vec<String> {
    event
        .rows
        .iter()
        .filter_map(|change| event.image(change))
        .map(|row| {
            document_key(row, &event.key_columns)
                .map(|key| key_repr(&key))
                .unwrap_or_else(|| "-".to_string())
        })
        .collect()
}
