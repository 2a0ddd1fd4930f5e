use crate::types::{Alert, BufferedSample, Cycle, DeviationRecord};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct SamplePoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub quality: f64,
}

/// Storage seam. Real time-series and relational engines live outside this
/// service; everything in the crate talks to this trait so backends stay
/// swappable.
#[async_trait]
pub trait MonitorStore: Send + Sync {
    /// Samples without an open cycle are written with `cycle_id = None` and
    /// are not queryable per cycle.
    async fn write_samples(
        &self,
        stream_id: Uuid,
        cycle_id: Option<Uuid>,
        samples: &[BufferedSample],
    ) -> Result<()>;

    /// Per-sensor series for one cycle, points ordered by timestamp.
    async fn query_cycle_samples(
        &self,
        stream_id: Uuid,
        cycle_id: Uuid,
        sensor: Option<&str>,
    ) -> Result<HashMap<String, Vec<SamplePoint>>>;

    async fn upsert_cycle(&self, cycle: &Cycle) -> Result<()>;
    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<Cycle>>;
    async fn previous_cycle(&self, stream_id: Uuid, before_number: u64) -> Result<Option<Cycle>>;
    async fn reference_cycle(&self, stream_id: Uuid) -> Result<Option<Cycle>>;
    async fn update_cycle_health(
        &self,
        cycle_id: Uuid,
        health_score: Option<f64>,
        anomaly_flag: bool,
    ) -> Result<()>;

    /// Flags a terminal cycle as its stream's reference baseline.
    async fn set_reference(&self, cycle_id: Uuid) -> Result<()>;

    async fn insert_deviations(&self, records: &[DeviationRecord]) -> Result<()>;
    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<()>;
}

#[derive(Default)]
struct MemoryInner {
    // cycle_id -> sensor_name -> ordered points
    samples: HashMap<Uuid, HashMap<String, Vec<SamplePoint>>>,
    cycles: HashMap<Uuid, Cycle>,
    deviations: Vec<DeviationRecord>,
    alerts: Vec<Alert>,
}

/// In-memory store used as the default backend and in tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn deviation_count(&self) -> usize {
        self.inner.lock().await.deviations.len()
    }

    pub async fn alerts_for_cycle(&self, cycle_id: Uuid) -> Vec<Alert> {
        self.inner
            .lock()
            .await
            .alerts
            .iter()
            .filter(|a| a.cycle_id == cycle_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MonitorStore for MemoryStore {
    async fn write_samples(
        &self,
        _stream_id: Uuid,
        cycle_id: Option<Uuid>,
        samples: &[BufferedSample],
    ) -> Result<()> {
        let Some(cycle_id) = cycle_id else {
            return Ok(());
        };
        let mut inner = self.inner.lock().await;
        let per_sensor = inner.samples.entry(cycle_id).or_default();
        for sample in samples {
            let series = per_sensor.entry(sample.sensor_name.clone()).or_default();
            let point = SamplePoint {
                timestamp: sample.timestamp,
                value: sample.value,
                quality: sample.quality,
            };
            // Flush order is seq order, which normally matches time order;
            // keep the series sorted when it does not.
            match series.last() {
                Some(last) if last.timestamp > point.timestamp => {
                    let pos = series.partition_point(|p| p.timestamp <= point.timestamp);
                    series.insert(pos, point);
                }
                _ => series.push(point),
            }
        }
        Ok(())
    }

    async fn query_cycle_samples(
        &self,
        _stream_id: Uuid,
        cycle_id: Uuid,
        sensor: Option<&str>,
    ) -> Result<HashMap<String, Vec<SamplePoint>>> {
        let inner = self.inner.lock().await;
        let Some(per_sensor) = inner.samples.get(&cycle_id) else {
            return Ok(HashMap::new());
        };
        let mut out = HashMap::new();
        for (name, series) in per_sensor {
            if let Some(wanted) = sensor {
                if name != wanted {
                    continue;
                }
            }
            out.insert(name.clone(), series.clone());
        }
        Ok(out)
    }

    async fn upsert_cycle(&self, cycle: &Cycle) -> Result<()> {
        let mut inner = self.inner.lock().await;
        inner.cycles.insert(cycle.cycle_id, cycle.clone());
        Ok(())
    }

    async fn get_cycle(&self, cycle_id: Uuid) -> Result<Option<Cycle>> {
        Ok(self.inner.lock().await.cycles.get(&cycle_id).cloned())
    }

    async fn previous_cycle(&self, stream_id: Uuid, before_number: u64) -> Result<Option<Cycle>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cycles
            .values()
            .filter(|c| c.stream_id == stream_id && c.cycle_number < before_number)
            .max_by_key(|c| c.cycle_number)
            .cloned())
    }

    async fn reference_cycle(&self, stream_id: Uuid) -> Result<Option<Cycle>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .cycles
            .values()
            .filter(|c| c.stream_id == stream_id && c.is_reference)
            .max_by_key(|c| c.cycle_number)
            .cloned())
    }

    async fn update_cycle_health(
        &self,
        cycle_id: Uuid,
        health_score: Option<f64>,
        anomaly_flag: bool,
    ) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(cycle) = inner.cycles.get_mut(&cycle_id) {
            cycle.health_score = health_score;
            cycle.anomaly_flag = Some(anomaly_flag);
        }
        Ok(())
    }

    async fn set_reference(&self, cycle_id: Uuid) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let Some(cycle) = inner.cycles.get(&cycle_id) else {
            return Err(anyhow::anyhow!("unknown cycle {cycle_id}"));
        };
        let stream_id = cycle.stream_id;
        for other in inner.cycles.values_mut() {
            if other.stream_id == stream_id {
                other.is_reference = other.cycle_id == cycle_id;
            }
        }
        Ok(())
    }

    async fn insert_deviations(&self, records: &[DeviationRecord]) -> Result<()> {
        self.inner
            .lock()
            .await
            .deviations
            .extend(records.iter().cloned());
        Ok(())
    }

    async fn insert_alerts(&self, alerts: &[Alert]) -> Result<()> {
        self.inner.lock().await.alerts.extend(alerts.iter().cloned());
        Ok(())
    }
}
