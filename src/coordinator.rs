//! 복제 코디네이터
//!
//! 상태 전이: `Initializing → Snapshotting → Streaming → (Degraded ⇄ Streaming) → ShuttingDown`
//!
//! 1. 양쪽 연결 확인 후 binlog 시작 위치 고정 (스냅샷 읽기 전에 고정해야 누락이 없음)
//! 2. 전체 스냅샷. 실패하면 프로세스 중단
//! 3. 고정한 위치부터 구독해 테이블별 작업자로 분배
//! 4. 종료 신호나 스트림 종료 시 대기 중인 적용을 마치고 연결 해제
//!
//! 대상 연결 장애는 별도 감시 작업이 백오프로 복구를 시도하고,
//! 소스 스트림 장애는 마지막으로 받은 위치부터 다시 구독합니다.
//! 다시 읽어도 반복될 binlog 해석 에러는 재시도하지 않고 중단합니다.

use crate::applier::ChangeApplier;
use crate::backoff::{Backoff, BackoffConfig};
use crate::config::{SnapshotMode, SyncConfig};
use crate::dispatch::{HealthSignal, LinkHealth, StatsSnapshot, TableDispatcher};
use crate::error::{CdcError, CoordinatorError, FailureClass};
use crate::events::ChangeEvent;
use crate::offset::{LogPosition, ReplicationState};
use crate::snapshot::{SnapshotLoader, SnapshotReport};
use crate::source::{ChangeEventSource, EventStream, SourceRowReader};
use crate::store::TargetCollectionStore;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// 스트리밍이 끝난 이유
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// 종료 신호
    Signal,
    /// 소스 스트림이 정상 종료
    SourceEnded,
}

/// 실행 결과 요약
#[derive(Debug, Default)]
pub struct RunSummary {
    pub start_position: Option<LogPosition>,
    /// 마지막으로 분배한 이벤트의 위치 (재시작 시 재개 지점)
    pub last_position: Option<LogPosition>,
    pub snapshot: Option<SnapshotReport>,
    pub stats: StatsSnapshot,
    pub degraded_episodes: u32,
    pub stop_reason: Option<StopReason>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Link {
    Source,
    Target,
}

/// 코디네이터 상태와 장애 구간 추적
///
/// 소스와 대상이 동시에 장애일 수 있으므로 둘 다 복구되어야 Streaming으로 돌아갑니다.
#[derive(Clone)]
struct StateCell {
    inner: Arc<StateInner>,
}

struct StateInner {
    tx: watch::Sender<ReplicationState>,
    degraded: Mutex<HashSet<Link>>,
    episodes: AtomicU32,
}

impl StateCell {
    fn new() -> Self {
        let (tx, _rx) = watch::channel(ReplicationState::Initializing);
        StateCell {
            inner: Arc::new(StateInner {
                tx,
                degraded: Mutex::new(HashSet::new()),
                episodes: AtomicU32::new(0),
            }),
        }
    }

    fn current(&self) -> ReplicationState {
        *self.inner.tx.borrow()
    }

    fn transition(&self, next: ReplicationState) {
        let mut from = None;
        self.inner.tx.send_if_modified(|state| {
            if *state == next || !state.can_transition_to(next) {
                return false;
            }
            from = Some(*state);
            *state = next;
            true
        });

        match from {
            Some(from) => info!(from = %from, to = %next, "State transition"),
            None => debug!(state = %self.current(), requested = %next, "Transition ignored"),
        }
    }

    fn degrade(&self, link: Link) {
        let mut degraded = self.inner.degraded.lock();
        if degraded.insert(link) {
            self.inner.episodes.fetch_add(1, Ordering::Relaxed);
            warn!(link = ?link, "Connection degraded");
            self.transition(ReplicationState::Degraded);
        }
    }

    fn restore(&self, link: Link) {
        let mut degraded = self.inner.degraded.lock();
        if degraded.remove(&link) && degraded.is_empty() {
            self.transition(ReplicationState::Streaming);
        }
    }

    fn episodes(&self) -> u32 {
        self.inner.episodes.load(Ordering::Relaxed)
    }
}

/// 대기 중 끼어든 사건
enum Interrupt {
    Shutdown,
    TargetFailed(CoordinatorError),
}

impl Interrupt {
    /// 종료 신호면 `Ok`, 대상 복구 실패면 `Err`
    fn into_result(self) -> Result<(), CoordinatorError> {
        match self {
            Interrupt::Shutdown => Ok(()),
            Interrupt::TargetFailed(e) => Err(e),
        }
    }
}

type Monitor = JoinHandle<Result<(), CoordinatorError>>;

async fn interrupted<S>(shutdown: Pin<&mut S>, monitor: &mut Monitor) -> Interrupt
where
    S: Future<Output = ()>,
{
    tokio::select! {
        biased;
        _ = shutdown => Interrupt::Shutdown,
        result = monitor => Interrupt::TargetFailed(match result {
            Ok(Err(e)) => e,
            Ok(Ok(())) => CoordinatorError::Task("target monitor exited".to_string()),
            Err(e) => CoordinatorError::Task(format!("target monitor: {}", e)),
        }),
    }
}

/// 대상 연결 감시
///
/// 작업자가 장애를 보고하면 백오프하며 ping으로 복구를 확인합니다.
/// 누적 대기가 상한을 넘으면 `Failed`를 알리고 에러로 끝납니다.
async fn monitor_target(
    store: Arc<dyn TargetCollectionStore>,
    health: HealthSignal,
    config: BackoffConfig,
    state: StateCell,
) -> Result<(), CoordinatorError> {
    let mut rx = health.subscribe();
    loop {
        if rx.wait_for(|h| *h == LinkHealth::Degraded).await.is_err() {
            return Ok(());
        }
        state.degrade(Link::Target);

        let mut backoff = Backoff::new(config);
        let mut cause = String::from("target unavailable");
        loop {
            let Some(delay) = backoff.next_delay() else {
                health.set(LinkHealth::Failed);
                return Err(CoordinatorError::BackoffExhausted {
                    attempts: backoff.attempts(),
                    elapsed: backoff.elapsed(),
                    cause,
                });
            };
            tokio::time::sleep(delay).await;

            match store.ping().await {
                Ok(()) => {
                    info!(
                        attempts = backoff.attempts(),
                        "Target connection restored after {:?}",
                        backoff.elapsed()
                    );
                    break;
                }
                Err(e) => {
                    warn!(attempt = backoff.attempts(), "Target still unavailable: {}", e);
                    cause = e.to_string();
                }
            }
        }

        health.set(LinkHealth::Healthy);
        state.restore(Link::Target);
    }
}

/// 복제 코디네이터
pub struct ReplicationCoordinator {
    config: SyncConfig,
    reader: Arc<dyn SourceRowReader>,
    events: Box<dyn ChangeEventSource>,
    store: Arc<dyn TargetCollectionStore>,
    state: StateCell,
}

impl ReplicationCoordinator {
    pub fn new(
        config: SyncConfig,
        reader: Arc<dyn SourceRowReader>,
        events: Box<dyn ChangeEventSource>,
        store: Arc<dyn TargetCollectionStore>,
    ) -> Self {
        ReplicationCoordinator {
            config,
            reader,
            events,
            store,
            state: StateCell::new(),
        }
    }

    pub fn state(&self) -> ReplicationState {
        self.state.current()
    }

    /// 상태 변화 구독
    pub fn subscribe_state(&self) -> watch::Receiver<ReplicationState> {
        self.state.inner.tx.subscribe()
    }

    /// 복제 실행
    ///
    /// `shutdown`이 완료되면 새 이벤트 수신을 멈추고 대기 중인 적용을 마친 뒤 돌아옵니다.
    /// 에러는 모두 Fatal입니다.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<RunSummary, CoordinatorError>
    where
        F: Future<Output = ()>,
    {
        let shutdown = shutdown.fuse();
        tokio::pin!(shutdown);

        let mut summary = RunSummary::default();
        let result = self.run_stages(&mut summary, shutdown.as_mut()).await;

        self.state.transition(ReplicationState::ShuttingDown);
        self.release().await;
        summary.degraded_episodes = self.state.episodes();

        match result {
            Ok(reason) => {
                summary.stop_reason = Some(reason);
                info!(
                    "Replication stopped ({:?}): {} events applied, {} skipped, {} rows failed, last position {}",
                    reason,
                    summary.stats.events_applied,
                    summary.stats.events_skipped,
                    summary.stats.rows_failed,
                    summary
                        .last_position
                        .as_ref()
                        .or(summary.start_position.as_ref())
                        .map(ToString::to_string)
                        .unwrap_or_else(|| "-".to_string())
                );
                Ok(summary)
            }
            Err(e) => {
                error!("Replication failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run_stages<S>(
        &mut self,
        summary: &mut RunSummary,
        mut shutdown: Pin<&mut S>,
    ) -> Result<StopReason, CoordinatorError>
    where
        S: Future<Output = ()>,
    {
        let start = self.initialize().await?;
        summary.start_position = Some(start.clone());

        if self.config.snapshot_mode == SnapshotMode::Initial {
            self.state.transition(ReplicationState::Snapshotting);
            let loader = SnapshotLoader::new(
                self.reader.clone(),
                self.store.clone(),
                self.config.tables.clone(),
                self.config.snapshot_parallelism,
            );

            tokio::select! {
                biased;
                _ = shutdown.as_mut() => {
                    warn!("Shutdown during snapshot, target is incomplete");
                    return Ok(StopReason::Signal);
                }
                report = loader.load_all() => summary.snapshot = Some(report?),
            }
        } else {
            info!("Snapshot mode is NEVER, skipping snapshot");
        }

        self.state.transition(ReplicationState::Streaming);
        self.stream_changes(start, summary, shutdown).await
    }

    /// 연결 확인 후 시작 위치 고정
    async fn initialize(&mut self) -> Result<LogPosition, CoordinatorError> {
        info!("Checking source and target connections");
        self.reader
            .ping()
            .await
            .map_err(CoordinatorError::SourceUnreachable)?;
        self.store
            .ping()
            .await
            .map_err(CoordinatorError::TargetUnreachable)?;

        let start = self
            .events
            .current_position()
            .await
            .map_err(CoordinatorError::SourceUnreachable)?;
        info!("Replication start position fixed at {}", start);
        Ok(start)
    }

    async fn stream_changes<S>(
        &mut self,
        start: LogPosition,
        summary: &mut RunSummary,
        mut shutdown: Pin<&mut S>,
    ) -> Result<StopReason, CoordinatorError>
    where
        S: Future<Output = ()>,
    {
        let health = HealthSignal::new();
        let mut dispatcher = TableDispatcher::new(
            ChangeApplier::new(self.store.clone()),
            health.clone(),
            self.config.apply_concurrency,
            self.config.table_buffer,
        );
        let mut monitor: Monitor = tokio::spawn(monitor_target(
            self.store.clone(),
            health.clone(),
            self.config.backoff,
            self.state.clone(),
        ));

        let result = self
            .consume(&mut dispatcher, start, summary, shutdown.as_mut(), &mut monitor)
            .await;

        self.state.transition(ReplicationState::ShuttingDown);
        if result.is_err() {
            health.set(LinkHealth::Failed);
        }
        info!("Draining {} apply lanes", dispatcher.lane_count());
        summary.stats = dispatcher.shutdown(self.config.drain_timeout).await;
        monitor.abort();

        result
    }

    async fn consume<S>(
        &mut self,
        dispatcher: &mut TableDispatcher,
        start: LogPosition,
        summary: &mut RunSummary,
        mut shutdown: Pin<&mut S>,
        monitor: &mut Monitor,
    ) -> Result<StopReason, CoordinatorError>
    where
        S: Future<Output = ()>,
    {
        let mut position = start;
        let first = self
            .events
            .subscribe(position.clone(), self.config.tables.clone())
            .await;
        let mut stream = match first {
            Ok(stream) => stream,
            Err(e) => match self
                .resubscribe(&position, e, shutdown.as_mut(), monitor)
                .await?
            {
                Some(stream) => stream,
                None => return Ok(StopReason::Signal),
            },
        };
        info!("Streaming changes from {}", position);

        loop {
            let item = tokio::select! {
                biased;
                interrupt = interrupted(shutdown.as_mut(), monitor) => {
                    interrupt.into_result()?;
                    info!("Shutdown signal received");
                    return Ok(StopReason::Signal);
                }
                item = stream.recv() => item,
            };

            match item {
                Some(Ok(event)) => {
                    let next = event.position.clone();
                    if !dispatch(dispatcher, event, shutdown.as_mut(), monitor).await? {
                        info!("Shutdown signal received");
                        return Ok(StopReason::Signal);
                    }
                    if let Some(next) = next {
                        position = next;
                        summary.last_position = Some(position.clone());
                    }
                }
                Some(Err(e)) => {
                    match self
                        .resubscribe(&position, e, shutdown.as_mut(), monitor)
                        .await?
                    {
                        Some(resumed) => stream = resumed,
                        None => return Ok(StopReason::Signal),
                    }
                }
                None => {
                    info!("Change stream ended at {}", position);
                    return Ok(StopReason::SourceEnded);
                }
            }
        }
    }

    /// 소스 스트림 재구독. 종료 신호를 받으면 `None`
    async fn resubscribe<S>(
        &mut self,
        from: &LogPosition,
        cause: CdcError,
        mut shutdown: Pin<&mut S>,
        monitor: &mut Monitor,
    ) -> Result<Option<EventStream>, CoordinatorError>
    where
        S: Future<Output = ()>,
    {
        if cause.class() == FailureClass::Fatal {
            error!("Change stream cannot continue at {}: {}", from, cause);
            return Err(CoordinatorError::SourceFailed(cause));
        }
        warn!("Change stream failed at {}: {}", from, cause);
        self.state.degrade(Link::Source);

        let mut backoff = Backoff::new(self.config.backoff);
        let mut cause = cause.to_string();
        loop {
            let Some(delay) = backoff.next_delay() else {
                return Err(CoordinatorError::BackoffExhausted {
                    attempts: backoff.attempts(),
                    elapsed: backoff.elapsed(),
                    cause,
                });
            };

            tokio::select! {
                biased;
                interrupt = interrupted(shutdown.as_mut(), monitor) => {
                    interrupt.into_result()?;
                    return Ok(None);
                }
                _ = tokio::time::sleep(delay) => {}
            }

            match self
                .events
                .subscribe(from.clone(), self.config.tables.clone())
                .await
            {
                Ok(stream) => {
                    info!(
                        attempts = backoff.attempts(),
                        "Resubscribed to change stream at {}", from
                    );
                    self.state.restore(Link::Source);
                    return Ok(Some(stream));
                }
                Err(e) if e.class() == FailureClass::Fatal => {
                    error!("Resubscribe at {} failed: {}", from, e);
                    return Err(CoordinatorError::SourceFailed(e));
                }
                Err(e) => {
                    warn!(attempt = backoff.attempts(), "Resubscribe failed: {}", e);
                    cause = e.to_string();
                }
            }
        }
    }

    async fn release(&self) {
        if let Err(e) = self.reader.close().await {
            warn!("Failed to close source connection: {}", e);
        }
        if let Err(e) = self.store.close().await {
            warn!("Failed to close target connection: {}", e);
        }
        info!("Connections released");
    }
}

/// 이벤트를 테이블 작업자에 넘김. 작업자 버퍼가 차 있으면 자리가 날 때까지 대기 (배압)
///
/// 종료 신호를 받으면 `false`.
async fn dispatch<S>(
    dispatcher: &mut TableDispatcher,
    event: ChangeEvent,
    mut shutdown: Pin<&mut S>,
    monitor: &mut Monitor,
) -> Result<bool, CoordinatorError>
where
    S: Future<Output = ()>,
{
    let lane = dispatcher.lane(&event.table);
    tokio::select! {
        biased;
        interrupt = interrupted(shutdown.as_mut(), monitor) => {
            interrupt.into_result()?;
            Ok(false)
        }
        permit = lane.reserve() => match permit {
            Ok(permit) => {
                permit.send(event);
                Ok(true)
            }
            Err(_) => Err(CoordinatorError::LaneClosed(event.table)),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SnapshotError;
    use crate::events::{CellValue, ChangeKind, Row, RowChange};
    use crate::memory_store::MemoryStore;
    use crate::snapshot::tests::{user, FakeReader};
    use async_trait::async_trait;
    use bson::Bson;
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::mpsc;

    type Item = std::result::Result<ChangeEvent, CdcError>;

    struct Script {
        items: Vec<Item>,
        hold_open: bool,
    }

    /// 구독할 때마다 준비된 이벤트 목록을 차례로 내보내는 소스
    struct ScriptedSource {
        scripts: VecDeque<Script>,
        subscriptions: Arc<Mutex<Vec<LogPosition>>>,
        held: Arc<Mutex<Vec<mpsc::Sender<Item>>>>,
        on_subscribe: Option<Box<dyn Fn() + Send>>,
    }

    impl ScriptedSource {
        fn new(scripts: Vec<Script>) -> Self {
            ScriptedSource {
                scripts: scripts.into(),
                subscriptions: Arc::new(Mutex::new(Vec::new())),
                held: Arc::new(Mutex::new(Vec::new())),
                on_subscribe: None,
            }
        }
    }

    #[async_trait]
    impl ChangeEventSource for ScriptedSource {
        async fn current_position(&mut self) -> crate::error::Result<LogPosition> {
            Ok(LogPosition::new("mysql-bin.000001", 4))
        }

        async fn subscribe(
            &mut self,
            from: LogPosition,
            _filter: crate::config::TableFilter,
        ) -> crate::error::Result<EventStream> {
            self.subscriptions.lock().push(from);
            if let Some(hook) = &self.on_subscribe {
                hook();
            }
            let script = self
                .scripts
                .pop_front()
                .ok_or_else(|| CdcError::ConnectionError("no more scripts".to_string()))?;

            let (tx, rx) = mpsc::channel(script.items.len() + 1);
            for item in script.items {
                tx.try_send(item).unwrap();
            }
            if script.hold_open {
                self.held.lock().push(tx);
            }
            Ok(rx)
        }
    }

    fn row(id: i64, x: i64) -> Row {
        Row::new()
            .with("id", CellValue::Int64(id))
            .with("x", CellValue::Int64(x))
    }

    fn insert(table: &str, id: i64, pos: u64) -> Item {
        Ok(
            ChangeEvent::new(table, ChangeKind::Insert, vec!["id".to_string()])
                .with_row(RowChange::inserted(row(id, 0)))
                .with_position(LogPosition::new("mysql-bin.000001", pos)),
        )
    }

    fn update(table: &str, id: i64, x: i64, pos: u64) -> Item {
        Ok(
            ChangeEvent::new(table, ChangeKind::Update, vec!["id".to_string()])
                .with_row(RowChange::updated(row(id, x - 1), row(id, x)))
                .with_position(LogPosition::new("mysql-bin.000001", pos)),
        )
    }

    fn config(mode: SnapshotMode, ceiling_ms: u64) -> SyncConfig {
        SyncConfig {
            snapshot_mode: mode,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                ceiling: Duration::from_millis(ceiling_ms),
            },
            drain_timeout: Duration::from_secs(5),
            ..SyncConfig::default()
        }
    }

    fn coordinator(
        config: SyncConfig,
        reader: FakeReader,
        source: ScriptedSource,
        store: Arc<MemoryStore>,
    ) -> ReplicationCoordinator {
        ReplicationCoordinator::new(config, Arc::new(reader), Box::new(source), store)
    }

    #[tokio::test]
    async fn test_snapshot_then_stream_keeps_table_order() {
        let reader = FakeReader::default().with_table("a", &["id"], vec![user(1, "first")]);
        let source = ScriptedSource::new(vec![Script {
            items: vec![
                insert("b", 1, 100),
                update("a", 1, 1, 200),
                insert("b", 2, 300),
                update("a", 1, 2, 400),
            ],
            hold_open: false,
        }]);
        let store = Arc::new(MemoryStore::new());
        let mut coordinator =
            coordinator(config(SnapshotMode::Initial, 1000), reader, source, store.clone());

        let summary = coordinator.run(futures::future::pending()).await.unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::SourceEnded));
        assert_eq!(summary.snapshot.as_ref().unwrap().total_rows(), 1);
        assert_eq!(summary.stats.events_applied, 4);
        assert_eq!(
            summary.last_position,
            Some(LogPosition::new("mysql-bin.000001", 400))
        );
        let doc = store.get("a", &Bson::Int64(1)).unwrap();
        assert_eq!(doc.get_i64("x").unwrap(), 2);
        assert_eq!(doc.get_str("name").unwrap(), "first");
        assert_eq!(store.count("b"), 2);
        assert_eq!(coordinator.state(), ReplicationState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_source_failure_resubscribes_from_last_position() {
        let source = ScriptedSource::new(vec![
            Script {
                items: vec![
                    insert("a", 1, 100),
                    Err(CdcError::ConnectionError("connection reset".to_string())),
                ],
                hold_open: false,
            },
            Script {
                items: vec![insert("a", 2, 200)],
                hold_open: false,
            },
        ]);
        let subscriptions = source.subscriptions.clone();
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(
            config(SnapshotMode::Never, 1000),
            FakeReader::default(),
            source,
            store.clone(),
        );

        let summary = coordinator.run(futures::future::pending()).await.unwrap();

        assert_eq!(
            *subscriptions.lock(),
            vec![
                LogPosition::new("mysql-bin.000001", 4),
                LogPosition::new("mysql-bin.000001", 100),
            ]
        );
        assert_eq!(summary.degraded_episodes, 1);
        assert_eq!(store.count("a"), 2);
    }

    #[tokio::test]
    async fn test_target_outage_recovers_without_losing_events() {
        let store = Arc::new(MemoryStore::new());
        let mut source = ScriptedSource::new(vec![Script {
            items: vec![insert("a", 1, 100), insert("a", 2, 200)],
            hold_open: false,
        }]);
        let flaky = store.clone();
        source.on_subscribe = Some(Box::new(move || flaky.fail_next(1)));
        let mut coordinator = coordinator(
            config(SnapshotMode::Never, 1000),
            FakeReader::default(),
            source,
            store.clone(),
        );

        let summary = coordinator.run(futures::future::pending()).await.unwrap();

        assert_eq!(store.count("a"), 2);
        assert_eq!(summary.stats.retries, 1);
        assert_eq!(summary.stats.events_applied, 2);
        assert_eq!(summary.degraded_episodes, 1);
    }

    #[tokio::test]
    async fn test_target_outage_beyond_ceiling_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        let mut source = ScriptedSource::new(vec![Script {
            items: vec![insert("a", 1, 100)],
            hold_open: true,
        }]);
        let down = store.clone();
        source.on_subscribe = Some(Box::new(move || down.set_unavailable(true)));
        let mut coordinator = coordinator(
            config(SnapshotMode::Never, 20),
            FakeReader::default(),
            source,
            store,
        );

        let err = coordinator.run(futures::future::pending()).await.unwrap_err();

        assert!(matches!(err, CoordinatorError::BackoffExhausted { .. }));
        assert_eq!(coordinator.state(), ReplicationState::ShuttingDown);
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_fatal() {
        let mut reader = FakeReader::default()
            .with_table("t1", &["id"], vec![user(1, "a")])
            .with_table("t2", &["id"], vec![user(1, "b")]);
        reader.failing.insert("t1".to_string());
        let source = ScriptedSource::new(vec![]);
        let subscriptions = source.subscriptions.clone();
        let store = Arc::new(MemoryStore::new());
        let mut coordinator =
            coordinator(config(SnapshotMode::Initial, 1000), reader, source, store.clone());

        let err = coordinator.run(futures::future::pending()).await.unwrap_err();

        assert!(matches!(
            err,
            CoordinatorError::Snapshot(SnapshotError::Multiple(ref errors)) if errors.len() == 1
        ));
        assert!(subscriptions.lock().is_empty());
        assert_eq!(store.count("t2"), 1);
    }

    #[tokio::test]
    async fn test_unreachable_target_at_startup_is_fatal() {
        let store = Arc::new(MemoryStore::new());
        store.set_unavailable(true);
        let mut coordinator = coordinator(
            config(SnapshotMode::Never, 1000),
            FakeReader::default(),
            ScriptedSource::new(vec![]),
            store,
        );

        let err = coordinator.run(futures::future::pending()).await.unwrap_err();
        assert!(matches!(err, CoordinatorError::TargetUnreachable(_)));
    }

    #[tokio::test]
    async fn test_shutdown_signal_stops_streaming() {
        let source = ScriptedSource::new(vec![Script {
            items: vec![insert("a", 1, 100)],
            hold_open: true,
        }]);
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(
            config(SnapshotMode::Never, 1000),
            FakeReader::default(),
            source,
            store.clone(),
        );
        let mut states = coordinator.subscribe_state();

        let shutdown = async move {
            states
                .wait_for(|s| *s == ReplicationState::Streaming)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
        };
        let summary = coordinator.run(shutdown).await.unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::Signal));
        assert_eq!(store.count("a"), 1);
    }

    #[tokio::test]
    async fn test_undecodable_source_event_is_fatal_without_retry() {
        let source = ScriptedSource::new(vec![
            Script {
                items: vec![
                    insert("a", 1, 100),
                    Err(CdcError::InvalidEvent("No table map for table id 7".to_string())),
                ],
                hold_open: false,
            },
            Script {
                items: vec![insert("a", 2, 200)],
                hold_open: false,
            },
        ]);
        let subscriptions = source.subscriptions.clone();
        let store = Arc::new(MemoryStore::new());
        let mut coordinator = coordinator(
            config(SnapshotMode::Never, 1000),
            FakeReader::default(),
            source,
            store.clone(),
        );

        let err = coordinator.run(futures::future::pending()).await.unwrap_err();

        assert!(matches!(err, CoordinatorError::SourceFailed(CdcError::InvalidEvent(_))));
        assert_eq!(subscriptions.lock().len(), 1);
        assert_eq!(store.count("a"), 1);
    }

    #[tokio::test]
    async fn test_consumption_pauses_while_target_degraded() {
        let store = Arc::new(MemoryStore::new());
        let mut source = ScriptedSource::new(vec![Script {
            items: (1..=6).map(|id| insert("a", id, id as u64 * 100)).collect(),
            hold_open: true,
        }]);
        let held = source.held.clone();
        let down = store.clone();
        source.on_subscribe = Some(Box::new(move || down.set_unavailable(true)));

        let mut config = config(SnapshotMode::Never, 10_000);
        config.table_buffer = 1;
        let mut coordinator =
            coordinator(config, FakeReader::default(), source, store.clone());
        let mut states = coordinator.subscribe_state();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();

        let pending = |held: &Arc<Mutex<Vec<mpsc::Sender<Item>>>>| {
            let held = held.lock();
            held[0].max_capacity() - held[0].capacity()
        };

        let observe = async {
            states
                .wait_for(|s| *s == ReplicationState::Degraded)
                .await
                .unwrap();
            tokio::time::sleep(Duration::from_millis(50)).await;
            let paused = pending(&held);
            tokio::time::sleep(Duration::from_millis(50)).await;
            assert_eq!(pending(&held), paused);
            assert!(paused >= 2, "only {} events left unread", paused);
            assert_eq!(store.count("a"), 0);

            store.set_unavailable(false);
            while store.count("a") < 6 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
            assert_eq!(pending(&held), 0);
            let _ = stop_tx.send(());
        };
        let shutdown = async {
            let _ = stop_rx.await;
        };

        let (summary, ()) = tokio::join!(coordinator.run(shutdown), observe);
        let summary = summary.unwrap();

        assert_eq!(summary.stop_reason, Some(StopReason::Signal));
        assert_eq!(summary.stats.events_applied, 6);
        assert_eq!(summary.degraded_episodes, 1);
    }
}
