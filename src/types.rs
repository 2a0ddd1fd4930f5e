use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorMeta {
    pub name: String,
    #[serde(default)]
    pub sensor_type: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

fn default_quality() -> f64 {
    1.0
}

/// Sample as produced by the sampling source, before the buffer assigns a seq.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingSample {
    pub sensor_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    #[serde(default = "default_quality")]
    pub quality: f64,
}

/// Buffered sample with its locally assigned monotonic sequence id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedSample {
    pub seq: u64,
    pub sensor_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub quality: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    WaitingStart,
    Active,
    Stopping,
    Stopped,
    Aborted,
}

impl CycleState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CycleState::Stopped | CycleState::Aborted)
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CycleState::Idle => "idle",
            CycleState::WaitingStart => "waiting_start",
            CycleState::Active => "active",
            CycleState::Stopping => "stopping",
            CycleState::Stopped => "stopped",
            CycleState::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

pub const ABORT_SAMPLE_TIMEOUT: &str = "sample_timeout";
pub const ABORT_CONNECTION_LOST: &str = "connection_lost";
pub const ABORT_MANUAL: &str = "manual_abort";

#[derive(Debug, Clone, Serialize)]
pub struct Cycle {
    pub cycle_id: Uuid,
    pub stream_id: Uuid,
    pub cycle_number: u64,
    pub state: CycleState,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub sample_count: u64,
    pub is_reference: bool,
    pub health_score: Option<f64>,
    pub anomaly_flag: Option<bool>,
    pub abort_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Normal => "normal",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonTarget {
    Reference,
    Previous,
}

impl fmt::Display for ComparisonTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComparisonTarget::Reference => "reference",
            ComparisonTarget::Previous => "previous",
        };
        f.write_str(name)
    }
}

/// One sensor's deviation against one comparison target; written once, never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct DeviationRecord {
    pub cycle_id: Uuid,
    pub sensor_name: String,
    pub compared_to: ComparisonTarget,
    pub euclidean_distance: Option<f64>,
    pub dtw_distance: Option<f64>,
    pub max_abs_deviation: Option<f64>,
    pub mean_abs_deviation: Option<f64>,
    pub composite_score: Option<f64>,
    pub contribution_rank: Option<u32>,
    pub severity: Severity,
    pub not_computable_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Alert {
    pub cycle_id: Uuid,
    pub sensor_name: String,
    pub severity: Severity,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

/// Broadcast to all subscribers; every externally visible state change flows through here.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    StateChange {
        stream_id: Uuid,
        cycle_id: Option<Uuid>,
        state: CycleState,
        timestamp: DateTime<Utc>,
    },
    CycleComplete {
        stream_id: Uuid,
        cycle_id: Uuid,
        cycle_number: u64,
        state: CycleState,
        duration_secs: f64,
        sample_count: u64,
        abort_reason: Option<String>,
    },
    AnalysisResult {
        stream_id: Uuid,
        cycle_id: Uuid,
        health_score: Option<f64>,
        anomaly_flag: bool,
        reference_comparison: ComparisonStatus,
        previous_comparison: ComparisonStatus,
        deviations: Vec<DeviationRecord>,
        alerts: Vec<Alert>,
        top_sensors: Vec<String>,
    },
    BufferHealth {
        stream_id: Uuid,
        backlog: u64,
        dropped_count: u64,
        degraded: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ComparisonStatus {
    Ok,
    NotAvailable,
}
