use crate::cycle::CompletionNotice;
use crate::distance::{compare_series, DistanceOutcome, DistanceParams};
use crate::store::{MonitorStore, SamplePoint};
use crate::types::{
    Alert, ComparisonStatus, ComparisonTarget, Cycle, DeviationRecord, Severity, StreamEvent,
};
use anyhow::{Context, Result};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct AnalysisSettings {
    pub distance: DistanceParams,
    pub weight_euclidean: f64,
    pub weight_dtw: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub health_top_k: usize,
    pub anomaly_threshold: f64,
    pub budget: Duration,
}

/// Runs the full deviation analysis for one completed cycle. The budget is
/// advisory: overruns are logged, the result is always produced.
pub async fn run_analysis(
    store: &Arc<dyn MonitorStore>,
    settings: &AnalysisSettings,
    notice: &CompletionNotice,
) -> Result<StreamEvent> {
    let started = Instant::now();

    let completed = store
        .query_cycle_samples(notice.stream_id, notice.cycle_id, None)
        .await
        .context("fetch completed cycle samples")?;

    let reference = resolve_reference(store, notice).await?;
    let predecessor = store
        .previous_cycle(notice.stream_id, notice.cycle_number)
        .await
        .context("fetch predecessor cycle")?
        .filter(|c| c.cycle_id != notice.cycle_id);

    let mut records = Vec::new();
    let mut reference_comparison = ComparisonStatus::NotAvailable;
    let mut previous_comparison = ComparisonStatus::NotAvailable;
    let mut health_source: Option<Vec<DeviationRecord>> = None;

    for (target, cycle) in [
        (ComparisonTarget::Reference, reference.as_ref()),
        (ComparisonTarget::Previous, predecessor.as_ref()),
    ] {
        let Some(cycle) = cycle else {
            tracing::info!(
                cycle=%notice.cycle_id,
                target=%target,
                "comparison target not available"
            );
            continue;
        };
        let baseline = store
            .query_cycle_samples(notice.stream_id, cycle.cycle_id, None)
            .await
            .with_context(|| format!("fetch {target} cycle samples"))?;
        let target_records = compare_cycles(settings, notice.cycle_id, target, &baseline, &completed);
        if target_records.is_empty() {
            continue;
        }
        match target {
            ComparisonTarget::Reference => reference_comparison = ComparisonStatus::Ok,
            ComparisonTarget::Previous => previous_comparison = ComparisonStatus::Ok,
        }
        // Health and alerts come from the reference comparison when there is
        // one, from the predecessor otherwise.
        if target == ComparisonTarget::Reference || health_source.is_none() {
            health_source = Some(target_records.clone());
        }
        records.extend(target_records);
    }

    let (health_score, anomaly_flag, alerts, top_sensors) = match &health_source {
        Some(source) => summarize(settings, notice.cycle_id, source),
        None => (None, false, Vec::new(), Vec::new()),
    };

    store
        .insert_deviations(&records)
        .await
        .context("persist deviation records")?;
    if !alerts.is_empty() {
        store.insert_alerts(&alerts).await.context("persist alerts")?;
    }
    store
        .update_cycle_health(notice.cycle_id, health_score, anomaly_flag)
        .await
        .context("persist cycle health")?;

    let elapsed = started.elapsed();
    if elapsed > settings.budget {
        tracing::warn!(
            cycle=%notice.cycle_id,
            elapsed_ms = elapsed.as_millis() as u64,
            budget_ms = settings.budget.as_millis() as u64,
            "analysis exceeded its time budget"
        );
    }

    Ok(StreamEvent::AnalysisResult {
        stream_id: notice.stream_id,
        cycle_id: notice.cycle_id,
        health_score,
        anomaly_flag,
        reference_comparison,
        previous_comparison,
        deviations: records,
        alerts,
        top_sensors,
    })
}

/// Explicit selection wins; otherwise the stream's flagged reference cycle.
async fn resolve_reference(
    store: &Arc<dyn MonitorStore>,
    notice: &CompletionNotice,
) -> Result<Option<Cycle>> {
    if let Some(explicit) = notice.reference_cycle_id {
        let cycle = store
            .get_cycle(explicit)
            .await
            .context("fetch explicit reference cycle")?;
        if cycle.is_none() {
            tracing::warn!(
                cycle=%notice.cycle_id,
                reference=%explicit,
                "explicit reference cycle not found"
            );
        }
        return Ok(cycle.filter(|c| c.cycle_id != notice.cycle_id));
    }
    Ok(store
        .reference_cycle(notice.stream_id)
        .await
        .context("fetch flagged reference cycle")?
        .filter(|c| c.cycle_id != notice.cycle_id))
}

/// Distances for every sensor present in both series sets, ranked by the
/// composite score with ties broken by sensor name.
fn compare_cycles(
    settings: &AnalysisSettings,
    cycle_id: Uuid,
    target: ComparisonTarget,
    baseline: &HashMap<String, Vec<SamplePoint>>,
    completed: &HashMap<String, Vec<SamplePoint>>,
) -> Vec<DeviationRecord> {
    let mut computed: Vec<DeviationRecord> = Vec::new();
    let mut excluded: Vec<DeviationRecord> = Vec::new();

    let mut sensors: Vec<&String> = completed
        .keys()
        .filter(|name| baseline.contains_key(*name))
        .collect();
    sensors.sort();

    for sensor in sensors {
        let base_values: Vec<f64> = baseline[sensor].iter().map(|p| p.value).collect();
        let cand_values: Vec<f64> = completed[sensor].iter().map(|p| p.value).collect();

        match compare_series(&base_values, &cand_values, &settings.distance) {
            DistanceOutcome::Computed(out) => {
                let composite = settings.weight_euclidean * out.euclidean_distance
                    + settings.weight_dtw * out.dtw_distance;
                computed.push(DeviationRecord {
                    cycle_id,
                    sensor_name: sensor.clone(),
                    compared_to: target,
                    euclidean_distance: Some(out.euclidean_distance),
                    dtw_distance: Some(out.dtw_distance),
                    max_abs_deviation: Some(out.max_abs_deviation),
                    mean_abs_deviation: Some(out.mean_abs_deviation),
                    composite_score: Some(composite),
                    contribution_rank: None,
                    severity: classify(settings, composite),
                    not_computable_reason: None,
                });
            }
            DistanceOutcome::NotComputable { reason } => {
                tracing::info!(cycle=%cycle_id, sensor=%sensor, reason, "sensor not computable");
                excluded.push(DeviationRecord {
                    cycle_id,
                    sensor_name: sensor.clone(),
                    compared_to: target,
                    euclidean_distance: None,
                    dtw_distance: None,
                    max_abs_deviation: None,
                    mean_abs_deviation: None,
                    composite_score: None,
                    contribution_rank: None,
                    severity: Severity::Normal,
                    not_computable_reason: Some(reason.to_string()),
                });
            }
        }
    }

    // Rank 1 = most deviant; ties fall back to name order, which the sort
    // above already established as the secondary key.
    computed.sort_by(|a, b| {
        b.composite_score
            .unwrap_or(0.0)
            .total_cmp(&a.composite_score.unwrap_or(0.0))
            .then_with(|| a.sensor_name.cmp(&b.sensor_name))
    });
    for (idx, record) in computed.iter_mut().enumerate() {
        record.contribution_rank = Some(idx as u32 + 1);
    }

    computed.extend(excluded);
    computed
}

fn classify(settings: &AnalysisSettings, composite: f64) -> Severity {
    if composite >= settings.critical_threshold {
        Severity::Critical
    } else if composite >= settings.warning_threshold {
        Severity::Warning
    } else {
        Severity::Normal
    }
}

fn summarize(
    settings: &AnalysisSettings,
    cycle_id: Uuid,
    records: &[DeviationRecord],
) -> (Option<f64>, bool, Vec<Alert>, Vec<String>) {
    let mut ranked: Vec<&DeviationRecord> = records
        .iter()
        .filter(|r| r.composite_score.is_some())
        .collect();
    ranked.sort_by_key(|r| r.contribution_rank.unwrap_or(u32::MAX));

    if ranked.is_empty() {
        return (None, false, Vec::new(), Vec::new());
    }

    let top: Vec<&DeviationRecord> = ranked
        .iter()
        .take(settings.health_top_k.max(1))
        .copied()
        .collect();
    let mean_top = top
        .iter()
        .filter_map(|r| r.composite_score)
        .sum::<f64>()
        / top.len() as f64;
    let health = (100.0 * (1.0 - mean_top)).clamp(0.0, 100.0);
    let anomaly = health < settings.anomaly_threshold;

    let now = Utc::now();
    let alerts: Vec<Alert> = ranked
        .iter()
        .filter(|r| r.severity >= Severity::Warning)
        .map(|r| Alert {
            cycle_id,
            sensor_name: r.sensor_name.clone(),
            severity: r.severity,
            message: format!("{} shows {} deviation", r.sensor_name, r.severity),
            created_at: now,
        })
        .collect();

    let top_sensors = top.iter().map(|r| r.sensor_name.clone()).collect();
    (Some(health), anomaly, alerts, top_sensors)
}
