use crate::store::MonitorStore;
use crate::types::{
    BufferedSample, Cycle, CycleState, StreamEvent, ABORT_CONNECTION_LOST, ABORT_MANUAL,
    ABORT_SAMPLE_TIMEOUT,
};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, Sleep};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Clone)]
pub enum CycleEvent {
    Register,
    CycleStart {
        timestamp: DateTime<Utc>,
        reference_cycle_id: Option<Uuid>,
    },
    SampleArrived {
        timestamp: DateTime<Utc>,
    },
    CycleStop {
        timestamp: DateTime<Utc>,
    },
    FlushComplete,
    GraceElapsed,
    SampleTimeout,
    ManualAbort,
    Unregister,
    CompletionAck,
}

impl CycleEvent {
    fn name(&self) -> &'static str {
        match self {
            CycleEvent::Register => "register",
            CycleEvent::CycleStart { .. } => "cycle_start",
            CycleEvent::SampleArrived { .. } => "sample_arrived",
            CycleEvent::CycleStop { .. } => "cycle_stop",
            CycleEvent::FlushComplete => "flush_complete",
            CycleEvent::GraceElapsed => "grace_elapsed",
            CycleEvent::SampleTimeout => "sample_timeout",
            CycleEvent::ManualAbort => "manual_abort",
            CycleEvent::Unregister => "unregister",
            CycleEvent::CompletionAck => "completion_ack",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect {
    OpenCycle,
    CountSample,
    RecordStopRequested,
    /// Terminal entry; the single source of the completion event.
    Complete {
        abort_reason: Option<&'static str>,
    },
    ArmGrace,
    ArmSampleTimeout,
    DisarmTimers,
    IgnoreEvent,
}

#[derive(Debug, Clone)]
pub struct Transition {
    pub next: CycleState,
    pub effects: Vec<Effect>,
}

fn stay(state: CycleState, effects: Vec<Effect>) -> Transition {
    Transition {
        next: state,
        effects,
    }
}

fn go(next: CycleState, effects: Vec<Effect>) -> Transition {
    Transition { next, effects }
}

/// The entire lifecycle in one place. Everything around it only executes the
/// effects this function returns.
pub fn transition(state: CycleState, event: &CycleEvent) -> Transition {
    use CycleState::*;

    match (state, event) {
        (Idle, CycleEvent::Register) => go(WaitingStart, vec![]),
        (WaitingStart, CycleEvent::CycleStart { .. }) => {
            go(Active, vec![Effect::OpenCycle, Effect::ArmSampleTimeout])
        }
        (Active, CycleEvent::SampleArrived { .. }) => stay(
            Active,
            vec![Effect::CountSample, Effect::ArmSampleTimeout],
        ),
        (Active, CycleEvent::CycleStop { .. }) => go(
            Stopping,
            // The sample timeout stays armed: a stop request does not protect
            // a silently dead stream from aborting.
            vec![Effect::RecordStopRequested, Effect::ArmGrace],
        ),
        (Stopping, CycleEvent::SampleArrived { .. }) => stay(
            Stopping,
            vec![
                Effect::CountSample,
                Effect::ArmGrace,
                Effect::ArmSampleTimeout,
            ],
        ),
        (Stopping, CycleEvent::GraceElapsed) | (Stopping, CycleEvent::FlushComplete) => go(
            Stopped,
            vec![
                Effect::Complete { abort_reason: None },
                Effect::DisarmTimers,
            ],
        ),
        (Active | Stopping, CycleEvent::SampleTimeout) => go(
            Aborted,
            vec![
                Effect::Complete {
                    abort_reason: Some(ABORT_SAMPLE_TIMEOUT),
                },
                Effect::DisarmTimers,
            ],
        ),
        (Active | Stopping, CycleEvent::ManualAbort) => go(
            Aborted,
            vec![
                Effect::Complete {
                    abort_reason: Some(ABORT_MANUAL),
                },
                Effect::DisarmTimers,
            ],
        ),
        (Active | Stopping, CycleEvent::Unregister) => go(
            Aborted,
            vec![
                Effect::Complete {
                    abort_reason: Some(ABORT_CONNECTION_LOST),
                },
                Effect::DisarmTimers,
            ],
        ),
        // Terminal states hold their cycle until the completion is
        // acknowledged, so analysis results cannot be lost unobserved.
        (Stopped | Aborted, CycleEvent::CompletionAck) => go(Idle, vec![]),
        // Samples outside an open cycle pass through the transport but belong
        // to no cycle; nothing to count.
        (Idle | WaitingStart | Stopped | Aborted, CycleEvent::SampleArrived { .. }) => {
            stay(state, vec![])
        }
        (_, CycleEvent::Unregister) => stay(state, vec![]),
        // The flush side reports a drained backlog whenever it happens; the
        // signal only means something while a stop is pending.
        (_, CycleEvent::FlushComplete) => stay(state, vec![]),
        // Everything else is out of order: logged and ignored, never fatal.
        _ => stay(state, vec![Effect::IgnoreEvent]),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct StreamTimers {
    pub grace_period: Duration,
    pub sample_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct CompletionNotice {
    pub stream_id: Uuid,
    pub cycle_id: Uuid,
    pub cycle_number: u64,
    pub state: CycleState,
    pub abort_reason: Option<String>,
    pub sample_count: u64,
    pub reference_cycle_id: Option<Uuid>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleStatus {
    pub stream_id: Uuid,
    pub state: CycleState,
    pub cycle_id: Option<Uuid>,
    pub cycle_number: Option<u64>,
    pub sample_count: u64,
    pub last_delivered_seq: u64,
}

#[derive(Debug)]
pub enum CycleCommand {
    Control {
        event: CycleEvent,
        respond_to: Option<oneshot::Sender<()>>,
    },
    Deliver {
        samples: Vec<BufferedSample>,
        respond_to: oneshot::Sender<Result<u64>>,
    },
    GetStatus {
        respond_to: oneshot::Sender<CycleStatus>,
    },
}

#[derive(Clone)]
pub struct CycleHandle {
    tx: mpsc::Sender<CycleCommand>,
}

impl CycleHandle {
    pub async fn control(&self, event: CycleEvent) -> Result<()> {
        self.tx
            .send(CycleCommand::Control {
                event,
                respond_to: None,
            })
            .await
            .map_err(|_| anyhow!("cycle actor stopped"))
    }

    /// Like `control`, but resolves only after the actor has applied the
    /// transition. Callers that tear the actor down right after an event
    /// must use this so the event cannot race the shutdown.
    pub async fn control_acked(&self, event: CycleEvent) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CycleCommand::Control {
                event,
                respond_to: Some(tx),
            })
            .await
            .map_err(|_| anyhow!("cycle actor stopped"))?;
        rx.await.context("cycle actor dropped response")?;
        Ok(())
    }

    /// Hands a transport batch to the actor; returns the highest delivered
    /// seq as the contiguous ack watermark.
    pub async fn deliver(&self, samples: Vec<BufferedSample>) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CycleCommand::Deliver {
                samples,
                respond_to: tx,
            })
            .await
            .map_err(|_| anyhow!("cycle actor stopped"))?;
        rx.await.context("cycle actor dropped response")?
    }

    pub async fn status(&self) -> Result<CycleStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(CycleCommand::GetStatus { respond_to: tx })
            .await
            .map_err(|_| anyhow!("cycle actor stopped"))?;
        Ok(rx.await.context("cycle actor dropped response")?)
    }
}

#[derive(Debug, Clone)]
struct OpenCycle {
    cycle_id: Uuid,
    cycle_number: u64,
    start_time: DateTime<Utc>,
    stop_time: Option<DateTime<Utc>>,
    sample_count: u64,
    reference_cycle_id: Option<Uuid>,
}

pub struct CycleRuntime {
    stream_id: Uuid,
    timers: StreamTimers,
    state: CycleState,
    current: Option<OpenCycle>,
    next_cycle_number: u64,
    last_delivered_seq: u64,
    store: Arc<dyn MonitorStore>,
    events_tx: broadcast::Sender<StreamEvent>,
    completion_tx: mpsc::Sender<CompletionNotice>,
}

#[derive(Debug, Default, Clone, Copy)]
struct TimerPlan {
    arm_grace: bool,
    arm_sample_timeout: bool,
    disarm: bool,
}

pub fn spawn_cycle_actor(
    stream_id: Uuid,
    timers: StreamTimers,
    store: Arc<dyn MonitorStore>,
    events_tx: broadcast::Sender<StreamEvent>,
    completion_tx: mpsc::Sender<CompletionNotice>,
    cancel: CancellationToken,
) -> CycleHandle {
    let (tx, rx) = mpsc::channel(256);
    let runtime = CycleRuntime {
        stream_id,
        timers,
        state: CycleState::Idle,
        current: None,
        next_cycle_number: 1,
        last_delivered_seq: 0,
        store,
        events_tx,
        completion_tx,
    };
    tokio::spawn(run_cycle_actor(runtime, rx, cancel));
    CycleHandle { tx }
}

async fn run_cycle_actor(
    mut runtime: CycleRuntime,
    mut rx: mpsc::Receiver<CycleCommand>,
    cancel: CancellationToken,
) {
    let grace = tokio::time::sleep(Duration::from_secs(0));
    tokio::pin!(grace);
    let mut grace_armed = false;
    let timeout = tokio::time::sleep(Duration::from_secs(0));
    tokio::pin!(timeout);
    let mut timeout_armed = false;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            maybe_cmd = rx.recv() => {
                let Some(cmd) = maybe_cmd else { break };
                match cmd {
                    CycleCommand::Control { event, respond_to } => {
                        let plan = runtime.apply(event).await;
                        apply_plan(
                            plan,
                            &runtime.timers,
                            grace.as_mut(),
                            &mut grace_armed,
                            timeout.as_mut(),
                            &mut timeout_armed,
                        );
                        if let Some(ack) = respond_to {
                            let _ = ack.send(());
                        }
                    }
                    CycleCommand::Deliver { samples, respond_to } => {
                        let result = runtime.deliver(samples).await;
                        match result {
                            Ok((acked_seq, plan)) => {
                                apply_plan(
                                    plan,
                                    &runtime.timers,
                                    grace.as_mut(),
                                    &mut grace_armed,
                                    timeout.as_mut(),
                                    &mut timeout_armed,
                                );
                                let _ = respond_to.send(Ok(acked_seq));
                            }
                            Err(err) => {
                                let _ = respond_to.send(Err(err));
                            }
                        }
                    }
                    CycleCommand::GetStatus { respond_to } => {
                        let _ = respond_to.send(runtime.status());
                    }
                }
            }
            _ = &mut grace, if grace_armed => {
                grace_armed = false;
                let plan = runtime.apply(CycleEvent::GraceElapsed).await;
                apply_plan(
                    plan,
                    &runtime.timers,
                    grace.as_mut(),
                    &mut grace_armed,
                    timeout.as_mut(),
                    &mut timeout_armed,
                );
            }
            _ = &mut timeout, if timeout_armed => {
                timeout_armed = false;
                let plan = runtime.apply(CycleEvent::SampleTimeout).await;
                apply_plan(
                    plan,
                    &runtime.timers,
                    grace.as_mut(),
                    &mut grace_armed,
                    timeout.as_mut(),
                    &mut timeout_armed,
                );
            }
        }
    }
}

fn apply_plan(
    plan: TimerPlan,
    timers: &StreamTimers,
    grace: Pin<&mut Sleep>,
    grace_armed: &mut bool,
    timeout: Pin<&mut Sleep>,
    timeout_armed: &mut bool,
) {
    if plan.disarm {
        *grace_armed = false;
        *timeout_armed = false;
        return;
    }
    if plan.arm_grace {
        grace.reset(Instant::now() + timers.grace_period);
        *grace_armed = true;
    }
    if plan.arm_sample_timeout {
        timeout.reset(Instant::now() + timers.sample_timeout);
        *timeout_armed = true;
    }
}

impl CycleRuntime {
    async fn apply(&mut self, event: CycleEvent) -> TimerPlan {
        let before = self.state;
        let Transition { next, effects } = transition(before, &event);

        let mut plan = TimerPlan::default();
        for effect in &effects {
            match effect {
                Effect::OpenCycle => self.open_cycle(&event).await,
                Effect::CountSample => {
                    if let Some(current) = self.current.as_mut() {
                        current.sample_count += 1;
                    }
                }
                Effect::RecordStopRequested => {
                    if let Some(current) = self.current.as_mut() {
                        current.stop_time = Some(match &event {
                            CycleEvent::CycleStop { timestamp } => *timestamp,
                            _ => Utc::now(),
                        });
                    }
                }
                Effect::Complete { abort_reason } => {
                    self.complete(next, abort_reason.map(str::to_string)).await;
                }
                Effect::ArmGrace => plan.arm_grace = true,
                Effect::ArmSampleTimeout => plan.arm_sample_timeout = true,
                Effect::DisarmTimers => plan.disarm = true,
                Effect::IgnoreEvent => {
                    tracing::warn!(
                        stream=%self.stream_id,
                        state=%before,
                        event=%event.name(),
                        "out-of-order control event ignored"
                    );
                }
            }
        }

        self.state = next;
        if next != before {
            if next == CycleState::Idle {
                self.current = None;
            }
            let _ = self.events_tx.send(StreamEvent::StateChange {
                stream_id: self.stream_id,
                cycle_id: self.current.as_ref().map(|c| c.cycle_id),
                state: next,
                timestamp: Utc::now(),
            });
        }
        plan
    }

    async fn open_cycle(&mut self, event: &CycleEvent) {
        let (start_time, reference_cycle_id) = match event {
            CycleEvent::CycleStart {
                timestamp,
                reference_cycle_id,
            } => (*timestamp, *reference_cycle_id),
            _ => (Utc::now(), None),
        };
        let cycle_number = self.next_cycle_number;
        self.next_cycle_number += 1;
        let current = OpenCycle {
            cycle_id: Uuid::new_v4(),
            cycle_number,
            start_time,
            stop_time: None,
            sample_count: 0,
            reference_cycle_id,
        };
        tracing::info!(
            stream=%self.stream_id,
            cycle=%current.cycle_id,
            cycle_number,
            "cycle started"
        );
        let row = self.cycle_row(&current, CycleState::Active);
        if let Err(err) = self.store.upsert_cycle(&row).await {
            tracing::error!(error=%err, stream=%self.stream_id, "failed to persist cycle start");
        }
        self.current = Some(current);
    }

    async fn complete(&mut self, terminal: CycleState, abort_reason: Option<String>) {
        let Some(current) = self.current.clone() else {
            tracing::error!(stream=%self.stream_id, "terminal transition with no open cycle");
            return;
        };
        let end_time = Utc::now().max(current.start_time);
        let duration_secs = (end_time - current.start_time).num_milliseconds() as f64 / 1000.0;

        let mut row = self.cycle_row(&current, terminal);
        row.end_time = Some(end_time);
        row.abort_reason = abort_reason.clone();
        if let Err(err) = self.store.upsert_cycle(&row).await {
            tracing::error!(error=%err, stream=%self.stream_id, "failed to persist cycle end");
        }

        tracing::info!(
            stream=%self.stream_id,
            cycle=%current.cycle_id,
            state=%terminal,
            sample_count = current.sample_count,
            abort_reason = abort_reason.as_deref().unwrap_or("none"),
            "cycle completed"
        );
        let _ = self.events_tx.send(StreamEvent::CycleComplete {
            stream_id: self.stream_id,
            cycle_id: current.cycle_id,
            cycle_number: current.cycle_number,
            state: terminal,
            duration_secs,
            sample_count: current.sample_count,
            abort_reason: abort_reason.clone(),
        });
        let notice = CompletionNotice {
            stream_id: self.stream_id,
            cycle_id: current.cycle_id,
            cycle_number: current.cycle_number,
            state: terminal,
            abort_reason,
            sample_count: current.sample_count,
            reference_cycle_id: current.reference_cycle_id,
        };
        if self.completion_tx.send(notice).await.is_err() {
            tracing::warn!(stream=%self.stream_id, "completion listener gone");
        }
    }

    fn cycle_row(&self, current: &OpenCycle, state: CycleState) -> Cycle {
        Cycle {
            cycle_id: current.cycle_id,
            stream_id: self.stream_id,
            cycle_number: current.cycle_number,
            state,
            start_time: current.start_time,
            end_time: None,
            sample_count: current.sample_count,
            is_reference: false,
            health_score: None,
            anomaly_flag: None,
            abort_reason: None,
        }
    }

    /// Applies a transport batch. Already delivered seqs are skipped so a
    /// redelivered batch never produces duplicate writes; the returned seq is
    /// the ack watermark.
    async fn deliver(
        &mut self,
        samples: Vec<BufferedSample>,
    ) -> Result<(u64, TimerPlan)> {
        let fresh: Vec<BufferedSample> = samples
            .into_iter()
            .filter(|s| s.seq > self.last_delivered_seq)
            .collect();
        if fresh.is_empty() {
            return Ok((self.last_delivered_seq, TimerPlan::default()));
        }

        let attributed_cycle = self
            .current
            .as_ref()
            .filter(|_| matches!(self.state, CycleState::Active | CycleState::Stopping))
            .map(|c| c.cycle_id);
        self.store
            .write_samples(self.stream_id, attributed_cycle, &fresh)
            .await
            .context("store write failed")?;

        let mut plan = TimerPlan::default();
        for sample in &fresh {
            // Arrival clock: a trailing sample whose own timestamp is past
            // the grace deadline finalizes the cycle before being processed.
            if self.state == CycleState::Stopping {
                let past_grace = self
                    .current
                    .as_ref()
                    .and_then(|c| c.stop_time)
                    .map(|stop| {
                        sample.timestamp
                            > stop
                                + chrono::Duration::from_std(self.timers.grace_period)
                                    .unwrap_or_else(|_| chrono::Duration::seconds(10))
                    })
                    .unwrap_or(false);
                if past_grace {
                    merge_plan(&mut plan, self.apply(CycleEvent::GraceElapsed).await);
                }
            }
            let sample_plan = self
                .apply(CycleEvent::SampleArrived {
                    timestamp: sample.timestamp,
                })
                .await;
            merge_plan(&mut plan, sample_plan);
            self.last_delivered_seq = sample.seq;
        }
        Ok((self.last_delivered_seq, plan))
    }

    fn status(&self) -> CycleStatus {
        CycleStatus {
            stream_id: self.stream_id,
            state: self.state,
            cycle_id: self.current.as_ref().map(|c| c.cycle_id),
            cycle_number: self.current.as_ref().map(|c| c.cycle_number),
            sample_count: self.current.as_ref().map(|c| c.sample_count).unwrap_or(0),
            last_delivered_seq: self.last_delivered_seq,
        }
    }
}

fn merge_plan(into: &mut TimerPlan, from: TimerPlan) {
    // A later disarm wins over earlier arms within one batch.
    if from.disarm {
        *into = TimerPlan {
            disarm: true,
            ..TimerPlan::default()
        };
        return;
    }
    if into.disarm {
        return;
    }
    into.arm_grace |= from.arm_grace;
    into.arm_sample_timeout |= from.arm_sample_timeout;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn ts() -> DateTime<Utc> {
        Utc::now()
    }

    fn start_event() -> CycleEvent {
        CycleEvent::CycleStart {
            timestamp: ts(),
            reference_cycle_id: None,
        }
    }

    fn has_complete(effects: &[Effect]) -> Option<Option<&'static str>> {
        effects.iter().find_map(|e| match e {
            Effect::Complete { abort_reason } => Some(*abort_reason),
            _ => None,
        })
    }

    #[test]
    fn happy_path_reaches_stopped_with_one_completion() {
        let t = transition(CycleState::Idle, &CycleEvent::Register);
        assert_eq!(t.next, CycleState::WaitingStart);

        let t = transition(CycleState::WaitingStart, &start_event());
        assert_eq!(t.next, CycleState::Active);
        assert!(t.effects.contains(&Effect::OpenCycle));
        assert!(t.effects.contains(&Effect::ArmSampleTimeout));

        let t = transition(
            CycleState::Active,
            &CycleEvent::SampleArrived { timestamp: ts() },
        );
        assert_eq!(t.next, CycleState::Active);
        assert!(t.effects.contains(&Effect::CountSample));

        let t = transition(CycleState::Active, &CycleEvent::CycleStop { timestamp: ts() });
        assert_eq!(t.next, CycleState::Stopping);
        assert!(t.effects.contains(&Effect::ArmGrace));
        assert!(has_complete(&t.effects).is_none());

        let t = transition(CycleState::Stopping, &CycleEvent::GraceElapsed);
        assert_eq!(t.next, CycleState::Stopped);
        assert_eq!(has_complete(&t.effects), Some(None));
    }

    #[test]
    fn flush_complete_finalizes_immediately() {
        let t = transition(CycleState::Stopping, &CycleEvent::FlushComplete);
        assert_eq!(t.next, CycleState::Stopped);
        assert_eq!(has_complete(&t.effects), Some(None));
    }

    #[test]
    fn sample_timeout_aborts_even_while_stopping() {
        for state in [CycleState::Active, CycleState::Stopping] {
            let t = transition(state, &CycleEvent::SampleTimeout);
            assert_eq!(t.next, CycleState::Aborted);
            assert_eq!(has_complete(&t.effects), Some(Some(ABORT_SAMPLE_TIMEOUT)));
        }
    }

    #[test]
    fn abort_reasons_for_manual_and_unregister() {
        let t = transition(CycleState::Active, &CycleEvent::ManualAbort);
        assert_eq!(has_complete(&t.effects), Some(Some(ABORT_MANUAL)));

        let t = transition(CycleState::Stopping, &CycleEvent::Unregister);
        assert_eq!(t.next, CycleState::Aborted);
        assert_eq!(has_complete(&t.effects), Some(Some(ABORT_CONNECTION_LOST)));
    }

    #[test]
    fn out_of_order_controls_are_ignored_not_fatal() {
        let t = transition(CycleState::Active, &start_event());
        assert_eq!(t.next, CycleState::Active);
        assert_eq!(t.effects, vec![Effect::IgnoreEvent]);

        for state in [CycleState::Idle, CycleState::WaitingStart] {
            let t = transition(state, &CycleEvent::CycleStop { timestamp: ts() });
            assert_eq!(t.next, state);
            assert_eq!(t.effects, vec![Effect::IgnoreEvent]);
        }
    }

    #[test]
    fn flush_signal_outside_stopping_is_a_silent_no_op() {
        for state in [
            CycleState::Idle,
            CycleState::WaitingStart,
            CycleState::Active,
            CycleState::Stopped,
            CycleState::Aborted,
        ] {
            let t = transition(state, &CycleEvent::FlushComplete);
            assert_eq!(t.next, state);
            assert!(t.effects.is_empty());
        }
    }

    #[test]
    fn terminal_states_return_to_idle_only_on_ack() {
        for state in [CycleState::Stopped, CycleState::Aborted] {
            let t = transition(state, &start_event());
            assert_eq!(t.next, state);

            let t = transition(state, &CycleEvent::CompletionAck);
            assert_eq!(t.next, CycleState::Idle);
        }
    }

    #[test]
    fn trailing_samples_during_grace_are_counted_and_rearm() {
        let t = transition(
            CycleState::Stopping,
            &CycleEvent::SampleArrived { timestamp: ts() },
        );
        assert_eq!(t.next, CycleState::Stopping);
        assert!(t.effects.contains(&Effect::CountSample));
        assert!(t.effects.contains(&Effect::ArmGrace));
    }

    fn actor_fixture(
        timers: StreamTimers,
    ) -> (
        CycleHandle,
        mpsc::Receiver<CompletionNotice>,
        broadcast::Receiver<StreamEvent>,
        CancellationToken,
    ) {
        let store = Arc::new(MemoryStore::new());
        let (events_tx, events_rx) = broadcast::channel(64);
        let (completion_tx, completion_rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let handle = spawn_cycle_actor(
            Uuid::new_v4(),
            timers,
            store,
            events_tx,
            completion_tx,
            cancel.clone(),
        );
        (handle, completion_rx, events_rx, cancel)
    }

    fn buffered(seq: u64, at: DateTime<Utc>) -> BufferedSample {
        BufferedSample {
            seq,
            sensor_name: "temp".to_string(),
            timestamp: at,
            value: 65.0,
            quality: 1.0,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stop_then_silence_stops_with_sample_count() {
        let timers = StreamTimers {
            grace_period: Duration::from_secs(10),
            sample_timeout: Duration::from_secs(30),
        };
        let (handle, mut completions, _events, _cancel) = actor_fixture(timers);

        handle.control(CycleEvent::Register).await.unwrap();
        handle.control(start_event()).await.unwrap();
        let now = ts();
        let acked = handle
            .deliver(vec![buffered(1, now), buffered(2, now), buffered(3, now)])
            .await
            .unwrap();
        assert_eq!(acked, 3);

        handle
            .control(CycleEvent::CycleStop { timestamp: ts() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let notice = completions.recv().await.unwrap();
        assert_eq!(notice.state, CycleState::Stopped);
        assert_eq!(notice.sample_count, 3);
        assert!(notice.abort_reason.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn silence_longer_than_timeout_aborts_despite_pending_stop() {
        let timers = StreamTimers {
            grace_period: Duration::from_secs(10),
            sample_timeout: Duration::from_secs(30),
        };
        let (handle, mut completions, _events, _cancel) = actor_fixture(timers);

        handle.control(CycleEvent::Register).await.unwrap();
        handle.control(start_event()).await.unwrap();
        handle.deliver(vec![buffered(1, ts())]).await.unwrap();

        // Stop arrives 25s into the silence; the grace deadline would be at
        // t+35s but the sample timeout lands at t+30s and must win.
        tokio::time::sleep(Duration::from_secs(25)).await;
        handle
            .control(CycleEvent::CycleStop { timestamp: ts() })
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(6)).await;

        let notice = completions.recv().await.unwrap();
        assert_eq!(notice.state, CycleState::Aborted);
        assert_eq!(notice.abort_reason.as_deref(), Some(ABORT_SAMPLE_TIMEOUT));
    }

    #[tokio::test(start_paused = true)]
    async fn redelivered_batch_is_not_double_counted() {
        let timers = StreamTimers {
            grace_period: Duration::from_secs(10),
            sample_timeout: Duration::from_secs(30),
        };
        let (handle, _completions, _events, _cancel) = actor_fixture(timers);

        handle.control(CycleEvent::Register).await.unwrap();
        handle.control(start_event()).await.unwrap();

        let now = ts();
        let batch = vec![buffered(1, now), buffered(2, now)];
        handle.deliver(batch.clone()).await.unwrap();
        let acked = handle.deliver(batch).await.unwrap();
        assert_eq!(acked, 2);

        let status = handle.status().await.unwrap();
        assert_eq!(status.sample_count, 2);
    }
}
