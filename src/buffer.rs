use crate::types::{BufferedSample, IncomingSample};
use anyhow::{anyhow, Context, Result};
use crc32c::crc32c;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::fs;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Notify};
use uuid::Uuid;

const MAX_FRAME_LEN: usize = 64 * 1024;
// Rewrite the journal once acked/evicted frames clearly dominate live ones.
const COMPACT_SLACK_FRAMES: u64 = 256;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "reason")]
pub enum RejectReason {
    #[error("sensor name is empty")]
    EmptySensor,
    #[error("sensor is not registered for this stream")]
    UnknownSensor,
    #[error("value is not finite")]
    NonFiniteValue,
    #[error("quality outside [0, 1]")]
    QualityOutOfRange,
}

#[derive(Debug, Clone, Serialize)]
pub struct RejectedSample {
    pub index: usize,
    pub sensor_name: String,
    pub reason: RejectReason,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcceptResult {
    pub accepted: u64,
    pub last_seq: Option<u64>,
    pub rejected: Vec<RejectedSample>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BufferStatus {
    pub stream_id: Uuid,
    pub next_seq: u64,
    pub acked_seq: u64,
    pub backlog: u64,
    pub dropped_count: u64,
    pub degraded: bool,
}

#[derive(Debug)]
pub enum BufferCommand {
    Accept {
        samples: Vec<IncomingSample>,
        respond_to: oneshot::Sender<Result<AcceptResult>>,
    },
    TakeBatch {
        max: usize,
        respond_to: oneshot::Sender<Vec<BufferedSample>>,
    },
    Ack {
        upto_seq: u64,
    },
    SetDegraded {
        degraded: bool,
    },
    GetStatus {
        respond_to: oneshot::Sender<BufferStatus>,
    },
}

#[derive(Clone)]
pub struct BufferHandle {
    tx: mpsc::UnboundedSender<BufferCommand>,
    backlog_notify: Arc<Notify>,
}

impl BufferHandle {
    pub async fn accept(&self, samples: Vec<IncomingSample>) -> Result<AcceptResult> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::Accept {
                samples,
                respond_to: tx,
            })
            .map_err(|_| anyhow!("buffer thread stopped"))?;
        rx.await.context("buffer thread dropped response")?
    }

    pub async fn take_batch(&self, max: usize) -> Result<Vec<BufferedSample>> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::TakeBatch {
                max,
                respond_to: tx,
            })
            .map_err(|_| anyhow!("buffer thread stopped"))?;
        Ok(rx.await.context("buffer thread dropped response")?)
    }

    pub fn ack(&self, upto_seq: u64) {
        let _ = self.tx.send(BufferCommand::Ack { upto_seq });
    }

    pub fn set_degraded(&self, degraded: bool) {
        let _ = self.tx.send(BufferCommand::SetDegraded { degraded });
    }

    pub async fn status(&self) -> Result<BufferStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(BufferCommand::GetStatus { respond_to: tx })
            .map_err(|_| anyhow!("buffer thread stopped"))?;
        Ok(rx.await.context("buffer thread dropped response")?)
    }

    /// Signalled whenever the backlog reaches the flush batch size.
    pub fn backlog_notify(&self) -> Arc<Notify> {
        self.backlog_notify.clone()
    }
}

#[derive(Debug, Clone)]
pub struct BufferSettings {
    pub dir: PathBuf,
    pub capacity_per_sensor: usize,
    pub notify_threshold: usize,
}

#[derive(Debug, Serialize, Deserialize)]
struct BufferStateDisk {
    stream_id: String,
    next_seq: u64,
    acked_seq: u64,
    dropped_count: u64,
    // Per sensor, the lowest seq still live; frames below it were evicted.
    evicted_floor: HashMap<String, u64>,
}

pub fn spawn_buffer_thread(
    settings: BufferSettings,
    stream_id: Uuid,
    sensors: Vec<String>,
) -> Result<BufferHandle> {
    let (tx, mut rx) = mpsc::unbounded_channel::<BufferCommand>();
    let backlog_notify = Arc::new(Notify::new());
    let notify = backlog_notify.clone();

    let short = stream_id.simple().to_string();
    std::thread::Builder::new()
        .name(format!("buffer-{}", &short[..8]))
        .spawn(move || {
            let mut runtime = match BufferRuntime::open(settings, stream_id, sensors, notify) {
                Ok(runtime) => runtime,
                Err(err) => {
                    tracing::error!(error=%err, stream=%stream_id, "buffer failed to open");
                    return;
                }
            };
            while let Some(cmd) = rx.blocking_recv() {
                runtime.handle(cmd);
            }
        })
        .context("failed to spawn buffer thread")?;

    Ok(BufferHandle { tx, backlog_notify })
}

struct BufferRuntime {
    settings: BufferSettings,
    stream_id: Uuid,
    known_sensors: HashSet<String>,
    journal_path: PathBuf,
    state_path: PathBuf,
    journal: fs::File,
    journal_frames: u64,
    next_seq: u64,
    acked_seq: u64,
    dropped_count: u64,
    degraded: bool,
    evicted_floor: HashMap<String, u64>,
    pending: BTreeMap<u64, BufferedSample>,
    per_sensor: HashMap<String, VecDeque<u64>>,
    backlog_notify: Arc<Notify>,
}

impl BufferRuntime {
    fn open(
        settings: BufferSettings,
        stream_id: Uuid,
        sensors: Vec<String>,
        backlog_notify: Arc<Notify>,
    ) -> Result<Self> {
        fs::create_dir_all(&settings.dir)
            .with_context(|| format!("failed to create {}", settings.dir.display()))?;

        let journal_path = settings.dir.join(format!("buf-{stream_id}.log"));
        let state_path = settings.dir.join(format!("state-{stream_id}.json"));

        let state = load_or_init_state(&state_path, stream_id)?;

        let mut journal = fs::OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&journal_path)
            .with_context(|| format!("open {}", journal_path.display()))?;

        let (recovered, frames) = recover_journal(&mut journal)?;

        let mut runtime = Self {
            settings,
            stream_id,
            known_sensors: sensors.into_iter().collect(),
            journal_path,
            state_path,
            journal,
            journal_frames: frames,
            next_seq: state.next_seq,
            acked_seq: state.acked_seq,
            dropped_count: state.dropped_count,
            degraded: false,
            evicted_floor: state.evicted_floor,
            pending: BTreeMap::new(),
            per_sensor: HashMap::new(),
            backlog_notify,
        };

        for sample in recovered {
            if sample.seq <= runtime.acked_seq {
                continue;
            }
            let floor = runtime
                .evicted_floor
                .get(&sample.sensor_name)
                .copied()
                .unwrap_or(0);
            if sample.seq < floor {
                continue;
            }
            runtime.next_seq = runtime.next_seq.max(sample.seq + 1);
            runtime.insert_pending(sample);
        }
        runtime.enforce_capacity();
        runtime.persist_state()?;

        Ok(runtime)
    }

    fn handle(&mut self, cmd: BufferCommand) {
        match cmd {
            BufferCommand::Accept {
                samples,
                respond_to,
            } => {
                let res = self.accept(samples);
                let _ = respond_to.send(res);
            }
            BufferCommand::TakeBatch { max, respond_to } => {
                let batch = self
                    .pending
                    .values()
                    .take(max)
                    .cloned()
                    .collect::<Vec<_>>();
                let _ = respond_to.send(batch);
            }
            BufferCommand::Ack { upto_seq } => {
                self.ack(upto_seq);
            }
            BufferCommand::SetDegraded { degraded } => {
                if self.degraded != degraded {
                    self.degraded = degraded;
                    if degraded {
                        tracing::warn!(stream=%self.stream_id, "stream marked degraded");
                    } else {
                        tracing::info!(stream=%self.stream_id, "stream recovered from degraded");
                    }
                }
            }
            BufferCommand::GetStatus { respond_to } => {
                let _ = respond_to.send(self.status());
            }
        }
    }

    fn accept(&mut self, samples: Vec<IncomingSample>) -> Result<AcceptResult> {
        let mut accepted = 0u64;
        let mut last_seq = None;
        let mut rejected = Vec::new();

        for (index, sample) in samples.into_iter().enumerate() {
            let sensor_name = sample.sensor_name.trim().to_string();
            if let Some(reason) = self.validate(&sensor_name, &sample) {
                rejected.push(RejectedSample {
                    index,
                    sensor_name,
                    reason,
                });
                continue;
            }

            let seq = self.next_seq;
            self.next_seq = self.next_seq.saturating_add(1);

            let buffered = BufferedSample {
                seq,
                sensor_name,
                timestamp: sample.timestamp,
                value: sample.value,
                quality: sample.quality,
            };
            self.append_frame(&buffered)?;
            self.insert_pending(buffered);

            accepted += 1;
            last_seq = Some(seq);
        }

        self.enforce_capacity();
        self.persist_state()?;

        if !rejected.is_empty() {
            tracing::warn!(
                stream=%self.stream_id,
                rejected = rejected.len(),
                "rejected malformed samples at accept"
            );
        }
        if self.pending.len() >= self.settings.notify_threshold {
            self.backlog_notify.notify_one();
        }

        Ok(AcceptResult {
            accepted,
            last_seq,
            rejected,
        })
    }

    fn validate(&self, sensor_name: &str, sample: &IncomingSample) -> Option<RejectReason> {
        if sensor_name.is_empty() {
            return Some(RejectReason::EmptySensor);
        }
        if !self.known_sensors.is_empty() && !self.known_sensors.contains(sensor_name) {
            return Some(RejectReason::UnknownSensor);
        }
        if !sample.value.is_finite() {
            return Some(RejectReason::NonFiniteValue);
        }
        if !sample.quality.is_finite() || !(0.0..=1.0).contains(&sample.quality) {
            return Some(RejectReason::QualityOutOfRange);
        }
        None
    }

    fn insert_pending(&mut self, sample: BufferedSample) {
        self.per_sensor
            .entry(sample.sensor_name.clone())
            .or_default()
            .push_back(sample.seq);
        self.pending.insert(sample.seq, sample);
    }

    fn enforce_capacity(&mut self) {
        let capacity = self.settings.capacity_per_sensor;
        if capacity == 0 {
            return;
        }
        let mut evicted = 0u64;
        for (sensor, seqs) in self.per_sensor.iter_mut() {
            while seqs.len() > capacity {
                // Oldest unacked entry for this sensor goes first.
                let Some(seq) = seqs.pop_front() else {
                    break;
                };
                self.pending.remove(&seq);
                self.dropped_count += 1;
                evicted += 1;
                let floor = self.evicted_floor.entry(sensor.clone()).or_insert(0);
                *floor = (*floor).max(seq + 1);
            }
        }
        if evicted > 0 {
            tracing::warn!(
                stream=%self.stream_id,
                evicted,
                dropped_total = self.dropped_count,
                "buffer at capacity; evicted oldest unacked samples"
            );
        }
    }

    fn ack(&mut self, upto_seq: u64) {
        if upto_seq <= self.acked_seq {
            return;
        }
        self.acked_seq = upto_seq;
        let live = self.pending.split_off(&(upto_seq + 1));
        self.pending = live;
        for seqs in self.per_sensor.values_mut() {
            while seqs.front().is_some_and(|seq| *seq <= upto_seq) {
                seqs.pop_front();
            }
        }
        if let Err(err) = self.maybe_compact() {
            tracing::warn!(error=%err, stream=%self.stream_id, "journal compaction failed");
        }
        if let Err(err) = self.persist_state() {
            tracing::warn!(error=%err, stream=%self.stream_id, "failed to persist buffer state");
        }
    }

    fn append_frame(&mut self, sample: &BufferedSample) -> Result<()> {
        let payload = serde_json::to_vec(sample)?;
        let len = payload.len() as u32;
        let crc = crc32c(&payload);
        self.journal.write_all(&len.to_le_bytes())?;
        self.journal.write_all(&crc.to_le_bytes())?;
        self.journal.write_all(&payload)?;
        self.journal_frames += 1;
        Ok(())
    }

    fn maybe_compact(&mut self) -> Result<()> {
        let live = self.pending.len() as u64;
        if self.journal_frames <= live.saturating_mul(2) + COMPACT_SLACK_FRAMES {
            return Ok(());
        }
        let tmp_path = self.journal_path.with_extension("log.tmp");
        {
            let mut tmp = fs::OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&tmp_path)
                .with_context(|| format!("create {}", tmp_path.display()))?;
            for sample in self.pending.values() {
                let payload = serde_json::to_vec(sample)?;
                tmp.write_all(&(payload.len() as u32).to_le_bytes())?;
                tmp.write_all(&crc32c(&payload).to_le_bytes())?;
                tmp.write_all(&payload)?;
            }
            tmp.sync_data().ok();
        }
        fs::rename(&tmp_path, &self.journal_path).context("rename compacted journal")?;
        self.journal = fs::OpenOptions::new()
            .read(true)
            .append(true)
            .open(&self.journal_path)
            .with_context(|| format!("reopen {}", self.journal_path.display()))?;
        self.journal.seek(SeekFrom::End(0))?;
        self.journal_frames = live;
        Ok(())
    }

    fn persist_state(&self) -> Result<()> {
        let tmp = self.state_path.with_extension("json.tmp");
        let disk = BufferStateDisk {
            stream_id: self.stream_id.to_string(),
            next_seq: self.next_seq,
            acked_seq: self.acked_seq,
            dropped_count: self.dropped_count,
            evicted_floor: self.evicted_floor.clone(),
        };
        fs::write(&tmp, serde_json::to_string_pretty(&disk)?).context("write state tmp")?;
        fs::rename(&tmp, &self.state_path).context("rename state")?;
        Ok(())
    }

    fn status(&self) -> BufferStatus {
        BufferStatus {
            stream_id: self.stream_id,
            next_seq: self.next_seq,
            acked_seq: self.acked_seq,
            backlog: self.pending.len() as u64,
            dropped_count: self.dropped_count,
            degraded: self.degraded,
        }
    }
}

fn load_or_init_state(state_path: &Path, stream_id: Uuid) -> Result<BufferStateDisk> {
    if state_path.exists() {
        let raw = fs::read_to_string(state_path).context("read buffer state")?;
        let parsed: BufferStateDisk = serde_json::from_str(&raw).context("parse buffer state")?;
        if parsed.stream_id != stream_id.to_string() {
            return Err(anyhow!("buffer state belongs to another stream"));
        }
        let mut parsed = parsed;
        parsed.next_seq = parsed.next_seq.max(1);
        return Ok(parsed);
    }
    Ok(BufferStateDisk {
        stream_id: stream_id.to_string(),
        next_seq: 1,
        acked_seq: 0,
        dropped_count: 0,
        evicted_floor: HashMap::new(),
    })
}

/// Reads every intact frame and truncates any corrupt tail so appends resume
/// from a clean boundary.
fn recover_journal(file: &mut fs::File) -> Result<(Vec<BufferedSample>, u64)> {
    file.seek(SeekFrom::Start(0))?;
    let mut samples = Vec::new();
    let mut frames = 0u64;
    let mut pos = 0u64;
    loop {
        let mut header = [0u8; 8];
        match file.read_exact(&mut header) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        let len = u32::from_le_bytes(header[0..4].try_into().unwrap()) as usize;
        let crc = u32::from_le_bytes(header[4..8].try_into().unwrap());
        if len == 0 || len > MAX_FRAME_LEN {
            break;
        }
        let mut payload = vec![0u8; len];
        match file.read_exact(&mut payload) {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
            Err(err) => return Err(err.into()),
        }
        if crc32c(&payload) != crc {
            break;
        }
        let Ok(sample) = serde_json::from_slice::<BufferedSample>(&payload) else {
            break;
        };
        samples.push(sample);
        frames += 1;
        pos += 8 + len as u64;
    }
    file.set_len(pos)?;
    file.seek(SeekFrom::End(0))?;
    Ok((samples, frames))
}
