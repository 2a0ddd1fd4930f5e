use crate::buffer::{spawn_buffer_thread, AcceptResult, BufferHandle, BufferSettings, BufferStatus};
use crate::config::Config;
use crate::cycle::{
    spawn_cycle_actor, CompletionNotice, CycleEvent, CycleHandle, CycleStatus, StreamTimers,
};
use crate::pipeline::{run_analysis, AnalysisSettings};
use crate::store::MonitorStore;
use crate::transport::{run_flush_loop, FlushSettings, LocalDelivery, Transport};
use crate::types::{IncomingSample, SensorMeta, StreamEvent};
use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Deserialize)]
pub struct RegisterRequest {
    pub device_name: String,
    pub sensors: Vec<SensorMeta>,
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
    #[serde(default)]
    pub sample_timeout_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegisterResponse {
    pub stream_id: Uuid,
    pub sensor_count: usize,
}

#[derive(Debug, Clone)]
pub enum ControlAction {
    CycleStart { reference_cycle_id: Option<Uuid> },
    CycleStop,
    ManualAbort,
    CompletionAck,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamStatus {
    pub stream_id: Uuid,
    pub device_name: String,
    pub sensors: Vec<SensorMeta>,
    pub cycle: CycleStatus,
    pub buffer: BufferStatus,
}

#[derive(Debug)]
pub enum SupervisorCommand {
    Register {
        request: RegisterRequest,
        respond_to: oneshot::Sender<Result<RegisterResponse>>,
    },
    Ingest {
        stream_id: Uuid,
        samples: Vec<IncomingSample>,
        respond_to: oneshot::Sender<Result<AcceptResult>>,
    },
    Control {
        stream_id: Uuid,
        action: ControlAction,
        respond_to: oneshot::Sender<Result<()>>,
    },
    Status {
        stream_id: Uuid,
        respond_to: oneshot::Sender<Result<StreamStatus>>,
    },
    Unregister {
        stream_id: Uuid,
        respond_to: oneshot::Sender<Result<()>>,
    },
}

#[derive(Clone)]
pub struct SupervisorHandle {
    tx: mpsc::Sender<SupervisorCommand>,
    events_tx: broadcast::Sender<StreamEvent>,
}

impl SupervisorHandle {
    pub fn subscribe(&self) -> broadcast::Receiver<StreamEvent> {
        self.events_tx.subscribe()
    }

    pub async fn register(&self, request: RegisterRequest) -> Result<RegisterResponse> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Register {
                request,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("supervisor stopped"))?;
        rx.await.context("supervisor dropped response")?
    }

    pub async fn ingest(
        &self,
        stream_id: Uuid,
        samples: Vec<IncomingSample>,
    ) -> Result<AcceptResult> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Ingest {
                stream_id,
                samples,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("supervisor stopped"))?;
        rx.await.context("supervisor dropped response")?
    }

    pub async fn control(&self, stream_id: Uuid, action: ControlAction) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Control {
                stream_id,
                action,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("supervisor stopped"))?;
        rx.await.context("supervisor dropped response")?
    }

    pub async fn status(&self, stream_id: Uuid) -> Result<StreamStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Status {
                stream_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("supervisor stopped"))?;
        rx.await.context("supervisor dropped response")?
    }

    pub async fn unregister(&self, stream_id: Uuid) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SupervisorCommand::Unregister {
                stream_id,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("supervisor stopped"))?;
        rx.await.context("supervisor dropped response")?
    }
}

pub struct StreamSupervisor {
    pub config: Config,
    pub store: Arc<dyn MonitorStore>,
}

impl StreamSupervisor {
    pub fn new(config: Config, store: Arc<dyn MonitorStore>) -> Self {
        Self { config, store }
    }

    pub fn start(self, cancel: CancellationToken) -> SupervisorHandle {
        let (tx, rx) = mpsc::channel(1024);
        let (events_tx, _) = broadcast::channel(1024);
        let (completion_tx, completion_rx) = mpsc::channel(256);
        let (done_tx, done_rx) = mpsc::channel(256);

        let runtime = SupervisorRuntime {
            config: self.config,
            store: self.store,
            events_tx: events_tx.clone(),
            completion_tx,
            done_tx,
            streams: HashMap::new(),
            inflight: HashSet::new(),
            analyzed: HashSet::new(),
            analyzed_order: VecDeque::new(),
        };
        tokio::spawn(run_supervisor(runtime, rx, completion_rx, done_rx, cancel));

        SupervisorHandle { tx, events_tx }
    }
}

struct StreamEntry {
    device_name: String,
    sensors: Vec<SensorMeta>,
    buffer: BufferHandle,
    cycle: CycleHandle,
    cancel: CancellationToken,
}

// Completed cycle ids kept for duplicate suppression; older entries age out.
const ANALYZED_CAP: usize = 4096;

struct SupervisorRuntime {
    config: Config,
    store: Arc<dyn MonitorStore>,
    events_tx: broadcast::Sender<StreamEvent>,
    completion_tx: mpsc::Sender<CompletionNotice>,
    done_tx: mpsc::Sender<Uuid>,
    streams: HashMap<Uuid, StreamEntry>,
    inflight: HashSet<Uuid>,
    analyzed: HashSet<Uuid>,
    analyzed_order: VecDeque<Uuid>,
}

async fn run_supervisor(
    mut runtime: SupervisorRuntime,
    mut rx: mpsc::Receiver<SupervisorCommand>,
    mut completion_rx: mpsc::Receiver<CompletionNotice>,
    mut done_rx: mpsc::Receiver<Uuid>,
    cancel: CancellationToken,
) {
    let mut health_ticker = tokio::time::interval(runtime.config.buffer_health_interval);
    health_ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_cmd = rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                runtime.handle_command(cmd).await;
            }
            Some(notice) = completion_rx.recv() => {
                runtime.handle_completion(notice);
            }
            Some(cycle_id) = done_rx.recv() => {
                runtime.mark_analyzed(cycle_id);
            }
            _ = health_ticker.tick() => {
                runtime.publish_buffer_health().await;
            }
        }
    }

    for (stream_id, entry) in runtime.streams.drain() {
        tracing::info!(stream=%stream_id, "stopping stream");
        entry.cancel.cancel();
    }
}

impl SupervisorRuntime {
    async fn handle_command(&mut self, cmd: SupervisorCommand) {
        match cmd {
            SupervisorCommand::Register {
                request,
                respond_to,
            } => {
                let res = self.register(request).await;
                let _ = respond_to.send(res);
            }
            SupervisorCommand::Ingest {
                stream_id,
                samples,
                respond_to,
            } => {
                let res = match self.streams.get(&stream_id) {
                    Some(entry) => entry.buffer.accept(samples).await,
                    None => Err(anyhow!("unknown stream {stream_id}")),
                };
                let _ = respond_to.send(res);
            }
            SupervisorCommand::Control {
                stream_id,
                action,
                respond_to,
            } => {
                let res = self.control(stream_id, action).await;
                let _ = respond_to.send(res);
            }
            SupervisorCommand::Status {
                stream_id,
                respond_to,
            } => {
                let res = self.status(stream_id).await;
                let _ = respond_to.send(res);
            }
            SupervisorCommand::Unregister {
                stream_id,
                respond_to,
            } => {
                let res = self.unregister(stream_id).await;
                let _ = respond_to.send(res);
            }
        }
    }

    async fn register(&mut self, request: RegisterRequest) -> Result<RegisterResponse> {
        if request.sensors.is_empty() {
            return Err(anyhow!("registration requires at least one sensor"));
        }
        let stream_id = Uuid::new_v4();
        let sensor_names: Vec<String> = request
            .sensors
            .iter()
            .map(|s| s.name.trim().to_string())
            .collect();

        let timers = StreamTimers {
            grace_period: request
                .grace_period_secs
                .map(Duration::from_secs)
                .unwrap_or(self.config.grace_period),
            sample_timeout: request
                .sample_timeout_secs
                .map(Duration::from_secs)
                .unwrap_or(self.config.sample_timeout),
        };

        let stream_cancel = CancellationToken::new();
        let buffer = spawn_buffer_thread(
            BufferSettings {
                dir: self.config.buffer_dir.clone(),
                capacity_per_sensor: self.config.buffer_capacity_per_sensor,
                notify_threshold: self.config.batch_size,
            },
            stream_id,
            sensor_names,
        )?;
        let cycle = spawn_cycle_actor(
            stream_id,
            timers,
            self.store.clone(),
            self.events_tx.clone(),
            self.completion_tx.clone(),
            stream_cancel.clone(),
        );

        let transport: Arc<dyn Transport> = Arc::new(LocalDelivery::new(cycle.clone()));
        tokio::spawn(run_flush_loop(
            stream_id,
            buffer.clone(),
            transport,
            FlushSettings {
                batch_size: self.config.batch_size,
                flush_interval: self.config.flush_interval,
                retry_base: self.config.retry_base,
                retry_max_attempts: self.config.retry_max_attempts,
            },
            stream_cancel.clone(),
        ));

        cycle.control(CycleEvent::Register).await?;

        tracing::info!(
            stream=%stream_id,
            device=%request.device_name,
            sensors = request.sensors.len(),
            "stream registered"
        );
        let sensor_count = request.sensors.len();
        self.streams.insert(
            stream_id,
            StreamEntry {
                device_name: request.device_name,
                sensors: request.sensors,
                buffer,
                cycle,
                cancel: stream_cancel,
            },
        );
        Ok(RegisterResponse {
            stream_id,
            sensor_count,
        })
    }

    async fn control(&mut self, stream_id: Uuid, action: ControlAction) -> Result<()> {
        let entry = self
            .streams
            .get(&stream_id)
            .ok_or_else(|| anyhow!("unknown stream {stream_id}"))?;
        match action {
            ControlAction::CycleStart { reference_cycle_id } => {
                entry
                    .cycle
                    .control(CycleEvent::CycleStart {
                        timestamp: Utc::now(),
                        reference_cycle_id,
                    })
                    .await
            }
            ControlAction::CycleStop => {
                entry
                    .cycle
                    .control(CycleEvent::CycleStop {
                        timestamp: Utc::now(),
                    })
                    .await
            }
            ControlAction::ManualAbort => entry.cycle.control(CycleEvent::ManualAbort).await,
            ControlAction::CompletionAck => {
                // The ack drops the stream back to idle; re-registering arms
                // it for the next cycle without tearing anything down.
                entry.cycle.control(CycleEvent::CompletionAck).await?;
                entry.cycle.control(CycleEvent::Register).await
            }
        }
    }

    async fn status(&self, stream_id: Uuid) -> Result<StreamStatus> {
        let entry = self
            .streams
            .get(&stream_id)
            .ok_or_else(|| anyhow!("unknown stream {stream_id}"))?;
        let cycle = entry.cycle.status().await?;
        let buffer = entry.buffer.status().await?;
        Ok(StreamStatus {
            stream_id,
            device_name: entry.device_name.clone(),
            sensors: entry.sensors.clone(),
            cycle,
            buffer,
        })
    }

    async fn unregister(&mut self, stream_id: Uuid) -> Result<()> {
        let entry = self
            .streams
            .remove(&stream_id)
            .ok_or_else(|| anyhow!("unknown stream {stream_id}"))?;
        // An open cycle aborts as a lost connection before teardown. The
        // acknowledged send makes sure the abort has been applied before the
        // token cancels the actor, so the cycle row cannot stay non-terminal.
        entry.cycle.control_acked(CycleEvent::Unregister).await.ok();
        entry.cancel.cancel();
        tracing::info!(stream=%stream_id, "stream unregistered");
        Ok(())
    }

    fn mark_analyzed(&mut self, cycle_id: Uuid) {
        self.inflight.remove(&cycle_id);
        if self.analyzed.insert(cycle_id) {
            self.analyzed_order.push_back(cycle_id);
            while self.analyzed_order.len() > ANALYZED_CAP {
                if let Some(oldest) = self.analyzed_order.pop_front() {
                    self.analyzed.remove(&oldest);
                }
            }
        }
    }

    /// At most one analysis run ever starts per cycle_id; a duplicate
    /// completion is a logged no-op.
    fn should_analyze(&mut self, cycle_id: Uuid) -> bool {
        if self.inflight.contains(&cycle_id) || self.analyzed.contains(&cycle_id) {
            return false;
        }
        self.inflight.insert(cycle_id);
        true
    }

    fn handle_completion(&mut self, notice: CompletionNotice) {
        if !self.should_analyze(notice.cycle_id) {
            tracing::warn!(cycle=%notice.cycle_id, "duplicate completion event ignored");
            return;
        }
        let store = self.store.clone();
        let settings = analysis_settings(&self.config);
        let events_tx = self.events_tx.clone();
        let done_tx = self.done_tx.clone();
        tokio::spawn(async move {
            match run_analysis(&store, &settings, &notice).await {
                Ok(event) => {
                    let _ = events_tx.send(event);
                }
                Err(err) => {
                    tracing::error!(error=%err, cycle=%notice.cycle_id, "analysis failed");
                }
            }
            let _ = done_tx.send(notice.cycle_id).await;
        });
    }

    async fn publish_buffer_health(&self) {
        for (stream_id, entry) in &self.streams {
            match entry.buffer.status().await {
                Ok(status) => {
                    let _ = self.events_tx.send(StreamEvent::BufferHealth {
                        stream_id: *stream_id,
                        backlog: status.backlog,
                        dropped_count: status.dropped_count,
                        degraded: status.degraded,
                    });
                }
                Err(err) => {
                    tracing::warn!(error=%err, stream=%stream_id, "buffer status unavailable");
                }
            }
        }
    }
}

fn analysis_settings(config: &Config) -> AnalysisSettings {
    AnalysisSettings {
        distance: crate::distance::DistanceParams {
            smoothing_window: config.smoothing_window,
            dtw_band_fraction: config.dtw_band_fraction,
        },
        weight_euclidean: config.weight_euclidean,
        weight_dtw: config.weight_dtw,
        warning_threshold: config.warning_threshold,
        critical_threshold: config.critical_threshold,
        health_top_k: config.health_top_k,
        anomaly_threshold: config.anomaly_threshold,
        budget: config.analysis_budget,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::{CycleState, ABORT_CONNECTION_LOST};
    use chrono::Utc;
    use tempfile::TempDir;
    use tokio::time::timeout;

    fn test_config(dir: &std::path::Path) -> Config {
        Config {
            http_bind: "127.0.0.1:0".to_string(),
            buffer_dir: dir.to_path_buf(),
            buffer_capacity_per_sensor: 1000,
            batch_size: 10,
            flush_interval: Duration::from_millis(20),
            retry_base: Duration::from_millis(5),
            retry_max_attempts: 3,
            grace_period: Duration::from_secs(10),
            sample_timeout: Duration::from_secs(30),
            smoothing_window: 5,
            dtw_band_fraction: 0.10,
            weight_euclidean: 0.5,
            weight_dtw: 0.5,
            warning_threshold: 0.4,
            critical_threshold: 0.7,
            health_top_k: 3,
            anomaly_threshold: 70.0,
            analysis_budget: Duration::from_secs(5),
            buffer_health_interval: Duration::from_millis(50),
        }
    }

    fn sample(value: f64) -> IncomingSample {
        IncomingSample {
            sensor_name: "temp".to_string(),
            timestamp: Utc::now(),
            value,
            quality: 1.0,
        }
    }

    fn test_runtime(dir: &std::path::Path) -> SupervisorRuntime {
        SupervisorRuntime {
            config: test_config(dir),
            store: Arc::new(MemoryStore::new()),
            events_tx: broadcast::channel(16).0,
            completion_tx: mpsc::channel(16).0,
            done_tx: mpsc::channel(16).0,
            streams: HashMap::new(),
            inflight: HashSet::new(),
            analyzed: HashSet::new(),
            analyzed_order: VecDeque::new(),
        }
    }

    #[test]
    fn duplicate_completions_are_analyzed_once() {
        let dir = TempDir::new().unwrap();
        let mut runtime = test_runtime(dir.path());

        let cycle_id = Uuid::new_v4();
        assert!(runtime.should_analyze(cycle_id));
        assert!(!runtime.should_analyze(cycle_id));

        // Still a no-op after the run finished.
        runtime.mark_analyzed(cycle_id);
        assert!(!runtime.should_analyze(cycle_id));
    }

    #[test]
    fn analyzed_history_is_bounded() {
        let dir = TempDir::new().unwrap();
        let mut runtime = test_runtime(dir.path());

        let first = Uuid::new_v4();
        runtime.mark_analyzed(first);
        for _ in 0..ANALYZED_CAP {
            runtime.mark_analyzed(Uuid::new_v4());
        }

        assert_eq!(runtime.analyzed.len(), ANALYZED_CAP);
        assert_eq!(runtime.analyzed_order.len(), ANALYZED_CAP);
        // The oldest entry aged out of the duplicate-suppression window.
        assert!(!runtime.analyzed.contains(&first));
    }

    #[tokio::test]
    async fn unregister_aborts_open_cycle_before_teardown() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let store_seam: Arc<dyn MonitorStore> = store.clone();
        let handle = StreamSupervisor::new(config, store_seam).start(cancel.clone());

        let response = handle
            .register(RegisterRequest {
                device_name: "machine-02".to_string(),
                sensors: vec![SensorMeta {
                    name: "temp".to_string(),
                    sensor_type: None,
                    unit: None,
                }],
                grace_period_secs: Some(60),
                sample_timeout_secs: Some(120),
            })
            .await
            .unwrap();
        let stream_id = response.stream_id;

        handle
            .control(
                stream_id,
                ControlAction::CycleStart {
                    reference_cycle_id: None,
                },
            )
            .await
            .unwrap();
        let status = handle.status(stream_id).await.unwrap();
        let cycle_id = status.cycle.cycle_id.unwrap();

        handle.unregister(stream_id).await.unwrap();

        // The abort must be applied and persisted before teardown returns.
        let row = store.get_cycle(cycle_id).await.unwrap().unwrap();
        assert_eq!(row.state, CycleState::Aborted);
        assert_eq!(row.abort_reason.as_deref(), Some(ABORT_CONNECTION_LOST));
        cancel.cancel();
    }

    #[tokio::test]
    async fn full_stream_lifecycle_produces_completion_and_analysis() {
        let dir = TempDir::new().unwrap();
        let config = test_config(dir.path());
        let store = Arc::new(MemoryStore::new());
        let cancel = CancellationToken::new();
        let store_seam: Arc<dyn MonitorStore> = store.clone();
        let handle = StreamSupervisor::new(config, store_seam).start(cancel.clone());
        let mut events = handle.subscribe();

        let response = handle
            .register(RegisterRequest {
                device_name: "machine-01".to_string(),
                sensors: vec![SensorMeta {
                    name: "temp".to_string(),
                    sensor_type: Some("temperature".to_string()),
                    unit: Some("C".to_string()),
                }],
                grace_period_secs: Some(0),
                sample_timeout_secs: Some(60),
            })
            .await
            .unwrap();
        let stream_id = response.stream_id;

        handle
            .control(
                stream_id,
                ControlAction::CycleStart {
                    reference_cycle_id: None,
                },
            )
            .await
            .unwrap();

        let accepted = handle
            .ingest(stream_id, (0..5).map(|i| sample(60.0 + i as f64)).collect())
            .await
            .unwrap();
        assert_eq!(accepted.accepted, 5);

        // Let the flush loop deliver before stopping.
        tokio::time::sleep(Duration::from_millis(200)).await;
        handle
            .control(stream_id, ControlAction::CycleStop)
            .await
            .unwrap();

        let mut saw_complete = false;
        let mut saw_analysis = false;
        while !(saw_complete && saw_analysis) {
            let event = timeout(Duration::from_secs(5), events.recv())
                .await
                .expect("timed out waiting for events")
                .unwrap();
            match event {
                StreamEvent::CycleComplete {
                    state,
                    sample_count,
                    ..
                } => {
                    assert_eq!(state, CycleState::Stopped);
                    assert_eq!(sample_count, 5);
                    saw_complete = true;
                }
                StreamEvent::AnalysisResult {
                    health_score,
                    anomaly_flag,
                    ..
                } => {
                    // First cycle: no reference or predecessor to compare to.
                    assert_eq!(health_score, None);
                    assert!(!anomaly_flag);
                    saw_analysis = true;
                }
                _ => {}
            }
        }

        let status = handle.status(stream_id).await.unwrap();
        assert_eq!(status.cycle.state, CycleState::Stopped);

        // Acknowledging the completion arms the stream for the next cycle.
        handle
            .control(stream_id, ControlAction::CompletionAck)
            .await
            .unwrap();
        let status = handle.status(stream_id).await.unwrap();
        assert_eq!(status.cycle.state, CycleState::WaitingStart);

        handle.unregister(stream_id).await.unwrap();
        assert!(handle.status(stream_id).await.is_err());
        cancel.cancel();
    }
}
