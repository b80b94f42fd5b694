/// MySQL → MongoDB 복제 실행 파일
///
/// 환경 변수로 설정을 읽고, 종료 신호(Ctrl+C)를 받을 때까지 복제합니다.
/// 정상 종료는 0, 복구할 수 없는 에러는 1로 끝납니다.
use mysql_mongo_sync::{
    BinlogEventSource, CoordinatorError, MongoStore, MySqlConnection, ReplicationCoordinator,
    RunSummary, SyncConfig,
};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
}

async fn run() -> Result<RunSummary, CoordinatorError> {
    let config = SyncConfig::from_env()?;

    info!(
        "Connecting to MySQL {}:{}",
        config.mysql.hostname, config.mysql.port
    );
    let source = MySqlConnection::connect(config.mysql.clone())
        .await
        .map_err(CoordinatorError::SourceUnreachable)?;
    let source = Arc::new(source);

    info!("Connecting to MongoDB database {}", config.mongodb.database);
    let store = MongoStore::connect(&config.mongodb)
        .await
        .map_err(CoordinatorError::TargetUnreachable)?;

    let events = BinlogEventSource::new(source.clone(), config.event_buffer);
    let mut coordinator =
        ReplicationCoordinator::new(config, source, Box::new(events), Arc::new(store));

    coordinator.run(shutdown_signal()).await
}

#[tokio::main]
async fn main() -> ExitCode {
    // 로깅 초기화
    tracing_subscriber::fmt::init();

    match run().await {
        Ok(summary) => {
            if let Some(snapshot) = &summary.snapshot {
                info!(
                    "Snapshot: {} tables, {} rows in {:?}",
                    snapshot.tables.len(),
                    snapshot.total_rows(),
                    snapshot.elapsed
                );
            }
            if let Some(position) = summary.last_position.as_ref().or(summary.start_position.as_ref()) {
                info!("Resume position: {}", position);
            }
            info!(
                "Applied {} events ({} rows), skipped {}, {} retries, {} degraded episodes",
                summary.stats.events_applied,
                summary.stats.rows_applied,
                summary.stats.events_skipped,
                summary.stats.retries,
                summary.degraded_episodes
            );
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Fatal: {}", e);
            ExitCode::FAILURE
        }
    }
}
