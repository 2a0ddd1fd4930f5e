use anyhow::{anyhow, Context, Result};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub http_bind: String,
    pub buffer_dir: PathBuf,

    pub buffer_capacity_per_sensor: usize,
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_base: Duration,
    pub retry_max_attempts: u32,

    pub grace_period: Duration,
    pub sample_timeout: Duration,

    pub smoothing_window: usize,
    pub dtw_band_fraction: f64,
    pub weight_euclidean: f64,
    pub weight_dtw: f64,
    pub warning_threshold: f64,
    pub critical_threshold: f64,
    pub health_top_k: usize,
    pub anomaly_threshold: f64,
    pub analysis_budget: Duration,

    pub buffer_health_interval: Duration,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let http_bind = env_string("CM_HTTP_BIND", Some("127.0.0.1:9310".to_string()))?;
        let buffer_dir = PathBuf::from(env_string(
            "CM_BUFFER_DIR",
            Some("/var/lib/cycle-monitor/buffer".to_string()),
        )?);

        let buffer_capacity_per_sensor =
            env_u64("CM_BUFFER_CAPACITY_PER_SENSOR", Some(1000))? as usize;
        let batch_size = env_u64("CM_BATCH_SIZE", Some(10))? as usize;
        if batch_size == 0 {
            return Err(anyhow!("CM_BATCH_SIZE must be at least 1"));
        }
        let flush_interval = Duration::from_millis(env_u64("CM_FLUSH_INTERVAL_MS", Some(1000))?);
        let retry_base = Duration::from_millis(env_u64("CM_RETRY_BASE_MS", Some(2000))?);
        let retry_max_attempts = env_u64("CM_RETRY_MAX_ATTEMPTS", Some(5))? as u32;

        // Stream defaults; registration may override both per stream.
        let grace_period = Duration::from_secs(env_u64("CM_GRACE_PERIOD_SECONDS", Some(10))?);
        let sample_timeout = Duration::from_secs(env_u64("CM_SAMPLE_TIMEOUT_SECONDS", Some(30))?);

        let smoothing_window = env_u64("CM_SMOOTHING_WINDOW", Some(5))? as usize;
        let dtw_band_fraction = env_f64("CM_DTW_BAND_FRACTION", Some(0.10))?;
        let weight_euclidean = env_f64("CM_WEIGHT_EUCLIDEAN", Some(0.5))?;
        let weight_dtw = env_f64("CM_WEIGHT_DTW", Some(0.5))?;
        let warning_threshold = env_f64("CM_WARNING_THRESHOLD", Some(0.4))?;
        let critical_threshold = env_f64("CM_CRITICAL_THRESHOLD", Some(0.7))?;
        let health_top_k = env_u64("CM_HEALTH_TOP_K", Some(3))? as usize;
        let anomaly_threshold = env_f64("CM_ANOMALY_THRESHOLD", Some(70.0))?;
        let analysis_budget = Duration::from_millis(env_u64("CM_ANALYSIS_BUDGET_MS", Some(5000))?);

        let buffer_health_interval =
            Duration::from_millis(env_u64("CM_BUFFER_HEALTH_INTERVAL_MS", Some(5000))?);

        Ok(Self {
            http_bind,
            buffer_dir,
            buffer_capacity_per_sensor,
            batch_size,
            flush_interval,
            retry_base,
            retry_max_attempts,
            grace_period,
            sample_timeout,
            smoothing_window,
            dtw_band_fraction,
            weight_euclidean,
            weight_dtw,
            warning_threshold,
            critical_threshold,
            health_top_k,
            anomaly_threshold,
            analysis_budget,
            buffer_health_interval,
        })
    }
}

fn env_string(key: &str, default: Option<String>) -> Result<String> {
    match env::var(key) {
        Ok(value) => Ok(value.trim().to_string()),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_u64(key: &str, default: Option<u64>) -> Result<u64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}

fn env_f64(key: &str, default: Option<f64>) -> Result<f64> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse::<f64>()
            .with_context(|| format!("invalid {key}")),
        Err(_) => default.ok_or_else(|| anyhow!("missing env var {key}")),
    }
}
