use crate::buffer::BufferHandle;
use crate::cycle::{CycleEvent, CycleHandle};
use crate::types::BufferedSample;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone, Copy)]
pub struct TransportAck {
    /// Contiguous prefix watermark: everything up to and including this seq
    /// is delivered; anything above stays pending regardless of what bytes
    /// made it onto the wire.
    pub acked_seq: u64,
}

/// Unreliable delivery channel between the buffer and the processing side.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, batch: Vec<BufferedSample>) -> Result<TransportAck>;

    /// Called after a drain round leaves the backlog empty, so the receiving
    /// side can finalize a pending stop without waiting out the grace period.
    async fn flush_idle(&self) -> Result<()> {
        Ok(())
    }
}

/// In-process delivery: the batch goes to the stream's cycle actor, which
/// writes it to the store and returns the ack watermark.
pub struct LocalDelivery {
    cycle: CycleHandle,
}

impl LocalDelivery {
    pub fn new(cycle: CycleHandle) -> Self {
        Self { cycle }
    }
}

#[async_trait]
impl Transport for LocalDelivery {
    async fn send(&self, batch: Vec<BufferedSample>) -> Result<TransportAck> {
        let acked_seq = self.cycle.deliver(batch).await?;
        Ok(TransportAck { acked_seq })
    }

    async fn flush_idle(&self) -> Result<()> {
        self.cycle.control(CycleEvent::FlushComplete).await
    }
}

#[derive(Debug, Clone)]
pub struct FlushSettings {
    pub batch_size: usize,
    pub flush_interval: Duration,
    pub retry_base: Duration,
    pub retry_max_attempts: u32,
}

pub fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.min(16))
}

/// Drains one stream's buffer: batches by size or interval, whichever comes
/// first, and never drops data on a failed send.
pub async fn run_flush_loop(
    stream_id: Uuid,
    buffer: BufferHandle,
    transport: Arc<dyn Transport>,
    settings: FlushSettings,
    cancel: CancellationToken,
) {
    let notify = buffer.backlog_notify();
    let mut ticker = tokio::time::interval(settings.flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
            _ = notify.notified() => {}
        }

        let mut drained_after_send = false;
        loop {
            let batch = match buffer.take_batch(settings.batch_size).await {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::error!(error=%err, stream=%stream_id, "buffer unavailable");
                    return;
                }
            };
            if batch.is_empty() {
                break;
            }
            let full = batch.len() == settings.batch_size;

            drained_after_send = false;
            if !send_with_retry(stream_id, &buffer, &transport, &settings, batch, &cancel).await {
                break;
            }
            drained_after_send = true;
            if !full {
                break;
            }
        }
        // Only rounds that actually delivered something report the drain;
        // idle ticks stay quiet.
        if drained_after_send {
            if let Err(err) = transport.flush_idle().await {
                tracing::warn!(error=%err, stream=%stream_id, "flush idle notification failed");
            }
        }
    }
}

/// Returns false once the batch has been given up on for this round; the
/// samples stay buffered either way.
async fn send_with_retry(
    stream_id: Uuid,
    buffer: &BufferHandle,
    transport: &Arc<dyn Transport>,
    settings: &FlushSettings,
    batch: Vec<BufferedSample>,
    cancel: &CancellationToken,
) -> bool {
    for attempt in 0..settings.retry_max_attempts {
        match transport.send(batch.clone()).await {
            Ok(ack) => {
                buffer.ack(ack.acked_seq);
                if attempt > 0 {
                    tracing::info!(stream=%stream_id, attempt, "send recovered after retry");
                }
                buffer.set_degraded(false);
                return true;
            }
            Err(err) => {
                let last = attempt + 1 == settings.retry_max_attempts;
                if last {
                    tracing::warn!(
                        error=%err,
                        stream=%stream_id,
                        attempts = settings.retry_max_attempts,
                        "send failed after max attempts; marking stream degraded"
                    );
                    buffer.set_degraded(true);
                    return false;
                }
                let delay = backoff_delay(settings.retry_base, attempt);
                tracing::warn!(
                    error=%err,
                    stream=%stream_id,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "send failed; backing off"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::{spawn_buffer_thread, BufferSettings};
    use crate::cycle::{spawn_cycle_actor, StreamTimers};
    use crate::store::MemoryStore;
    use crate::types::{CycleState, IncomingSample};
    use anyhow::anyhow;
    use chrono::Utc;
    use std::sync::atomic::{AtomicU64, Ordering};
    use tempfile::TempDir;
    use tokio::sync::{broadcast, mpsc};

    #[test]
    fn backoff_is_monotonically_non_decreasing() {
        let base = Duration::from_secs(2);
        let mut last = Duration::ZERO;
        for attempt in 0..5 {
            let delay = backoff_delay(base, attempt);
            assert!(delay >= last);
            last = delay;
        }
        assert_eq!(backoff_delay(base, 0), Duration::from_secs(2));
        assert_eq!(backoff_delay(base, 1), Duration::from_secs(4));
        assert_eq!(backoff_delay(base, 2), Duration::from_secs(8));
    }

    struct FailingTransport {
        calls: AtomicU64,
    }

    #[async_trait]
    impl Transport for FailingTransport {
        async fn send(&self, _batch: Vec<BufferedSample>) -> Result<TransportAck> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow!("connection refused"))
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

    async fn wait_for<F, Fut>(mut check: F) -> bool
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        false
    }

    #[tokio::test]
    async fn failed_sends_mark_degraded_and_keep_backlog() {
        let dir = TempDir::new().unwrap();
        let stream_id = Uuid::new_v4();
        let buffer = spawn_buffer_thread(
            BufferSettings {
                dir: dir.path().to_path_buf(),
                capacity_per_sensor: 100,
                notify_threshold: 3,
            },
            stream_id,
            vec!["temp".to_string()],
        )
        .unwrap();

        buffer
            .accept((0..3).map(|i| sample(i as f64)).collect())
            .await
            .unwrap();

        let transport = Arc::new(FailingTransport {
            calls: AtomicU64::new(0),
        });
        let settings = FlushSettings {
            batch_size: 3,
            flush_interval: Duration::from_millis(50),
            retry_base: Duration::from_millis(5),
            retry_max_attempts: 3,
        };
        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(run_flush_loop(
            stream_id,
            buffer.clone(),
            transport.clone(),
            settings,
            cancel.clone(),
        ));

        let buffer_poll = buffer.clone();
        let degraded = wait_for(|| {
            let buffer = buffer_poll.clone();
            async move { buffer.status().await.map(|s| s.degraded).unwrap_or(false) }
        })
        .await;
        cancel.cancel();
        loop_handle.await.unwrap();

        assert!(degraded);
        assert!(transport.calls.load(Ordering::SeqCst) >= 3);
        let status = buffer.status().await.unwrap();
        assert_eq!(status.backlog, 3);
        assert_eq!(status.acked_seq, 0);
    }

    #[tokio::test]
    async fn stop_finalizes_once_backlog_drains() {
        let dir = TempDir::new().unwrap();
        let stream_id = Uuid::new_v4();
        let buffer = spawn_buffer_thread(
            BufferSettings {
                dir: dir.path().to_path_buf(),
                capacity_per_sensor: 100,
                notify_threshold: 10,
            },
            stream_id,
            vec!["temp".to_string()],
        )
        .unwrap();

        let store = Arc::new(MemoryStore::new());
        let (events_tx, _events_rx) = broadcast::channel(64);
        let (completion_tx, mut completions) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        // Grace long enough that only the drain signal can finalize in time.
        let cycle = spawn_cycle_actor(
            stream_id,
            StreamTimers {
                grace_period: Duration::from_secs(60),
                sample_timeout: Duration::from_secs(120),
            },
            store,
            events_tx,
            completion_tx,
            cancel.clone(),
        );
        cycle.control(CycleEvent::Register).await.unwrap();
        cycle
            .control(CycleEvent::CycleStart {
                timestamp: Utc::now(),
                reference_cycle_id: None,
            })
            .await
            .unwrap();
        cycle
            .control(CycleEvent::CycleStop {
                timestamp: Utc::now(),
            })
            .await
            .unwrap();

        buffer
            .accept((0..3).map(|i| sample(i as f64)).collect())
            .await
            .unwrap();

        let transport: Arc<dyn Transport> = Arc::new(LocalDelivery::new(cycle.clone()));
        tokio::spawn(run_flush_loop(
            stream_id,
            buffer.clone(),
            transport,
            FlushSettings {
                batch_size: 10,
                flush_interval: Duration::from_millis(20),
                retry_base: Duration::from_millis(5),
                retry_max_attempts: 3,
            },
            cancel.clone(),
        ));

        let notice = tokio::time::timeout(Duration::from_secs(5), completions.recv())
            .await
            .expect("stop was not finalized by the drained backlog")
            .unwrap();
        assert_eq!(notice.state, CycleState::Stopped);
        assert_eq!(notice.sample_count, 3);
        assert!(notice.abort_reason.is_none());
        cancel.cancel();
    }

    struct FlakyTransport {
        calls: AtomicU64,
        fail_first: u64,
    }

    #[async_trait]
    impl Transport for FlakyTransport {
        async fn send(&self, batch: Vec<BufferedSample>) -> Result<TransportAck> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.fail_first {
                return Err(anyhow!("timeout"));
            }
            let acked_seq = batch.iter().map(|s| s.seq).max().unwrap_or(0);
            Ok(TransportAck { acked_seq })
        }
    }

    #[tokio::test]
    async fn recovery_acks_and_clears_degraded() {
        let dir = TempDir::new().unwrap();
        let stream_id = Uuid::new_v4();
        let buffer = spawn_buffer_thread(
            BufferSettings {
                dir: dir.path().to_path_buf(),
                capacity_per_sensor: 100,
                notify_threshold: 2,
            },
            stream_id,
            vec!["temp".to_string()],
        )
        .unwrap();

        buffer
            .accept((0..2).map(|i| sample(i as f64)).collect())
            .await
            .unwrap();

        let transport = Arc::new(FlakyTransport {
            calls: AtomicU64::new(0),
            fail_first: 2,
        });
        let settings = FlushSettings {
            batch_size: 2,
            flush_interval: Duration::from_millis(50),
            retry_base: Duration::from_millis(5),
            retry_max_attempts: 5,
        };
        let cancel = CancellationToken::new();
        let loop_handle = tokio::spawn(run_flush_loop(
            stream_id,
            buffer.clone(),
            transport.clone(),
            settings,
            cancel.clone(),
        ));

        let buffer_poll = buffer.clone();
        let drained = wait_for(|| {
            let buffer = buffer_poll.clone();
            async move {
                buffer
                    .status()
                    .await
                    .map(|s| s.acked_seq == 2 && !s.degraded)
                    .unwrap_or(false)
            }
        })
        .await;
        cancel.cancel();
        loop_handle.await.unwrap();

        assert!(drained);
        let status = buffer.status().await.unwrap();
        assert_eq!(status.backlog, 0);
    }
}
