mod buffer;
mod config;
mod cycle;
mod distance;
mod http;
mod pipeline;
mod store;
mod supervisor;
mod transport;
mod types;

use crate::config::Config;
use crate::store::{MemoryStore, MonitorStore};
use crate::supervisor::StreamSupervisor;
use crate::types::StreamEvent;
use anyhow::Result;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

fn init_tracing() -> Result<()> {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cycle_monitor=info".into());
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(true)
        .try_init()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    Ok(())
}

/// Logs the event fan-out so completions and analysis results are visible
/// even with no external subscriber attached.
async fn run_event_logger(handle: supervisor::SupervisorHandle) {
    let mut events = handle.subscribe();
    loop {
        match events.recv().await {
            Ok(StreamEvent::StateChange {
                stream_id, state, ..
            }) => {
                tracing::info!(stream=%stream_id, state=%state, "state change");
            }
            Ok(StreamEvent::CycleComplete {
                stream_id,
                cycle_id,
                cycle_number,
                state,
                duration_secs,
                sample_count,
                abort_reason,
            }) => {
                tracing::info!(
                    stream=%stream_id,
                    cycle=%cycle_id,
                    cycle_number,
                    state=%state,
                    duration_secs,
                    sample_count,
                    abort_reason = abort_reason.as_deref().unwrap_or("-"),
                    "cycle complete"
                );
            }
            Ok(StreamEvent::AnalysisResult {
                stream_id,
                cycle_id,
                health_score,
                anomaly_flag,
                ..
            }) => {
                tracing::info!(
                    stream=%stream_id,
                    cycle=%cycle_id,
                    health = health_score.unwrap_or(f64::NAN),
                    anomaly = anomaly_flag,
                    "analysis result"
                );
            }
            Ok(StreamEvent::BufferHealth {
                stream_id,
                backlog,
                dropped_count,
                degraded,
            }) => {
                if degraded || dropped_count > 0 {
                    tracing::warn!(stream=%stream_id, backlog, dropped_count, degraded, "buffer health");
                } else {
                    tracing::debug!(stream=%stream_id, backlog, "buffer health");
                }
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "event logger lagged");
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env()?;
    init_tracing()?;

    std::fs::create_dir_all(&config.buffer_dir)?;

    let store: Arc<dyn MonitorStore> = Arc::new(MemoryStore::new());
    let cancel = CancellationToken::new();
    let supervisor = StreamSupervisor::new(config.clone(), store.clone()).start(cancel.clone());

    tokio::spawn(run_event_logger(supervisor.clone()));

    let app = http::router(http::HttpState {
        supervisor: supervisor.clone(),
        store,
    });
    let listener = tokio::net::TcpListener::bind(&config.http_bind).await?;
    tracing::info!(bind=%config.http_bind, "cycle-monitor HTTP listening");
    let http_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.ok();
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
        _ = http_handle => {}
    }
    cancel.cancel();

    Ok(())
}
