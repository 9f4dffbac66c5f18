//! Periodic target-tracking control loop over the worker pool.
//!
//! The autoscaler reads one signal per period, asks `WorkerPoolState` for a
//! decision and pushes it to the `CapacityKnob`. It never waits on workers:
//! shrinking only tells surplus loops to stop after their current batch.

use anyhow::Result;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::domain::{
    event::{Event, EventTransport, Payload, ScaleDecision},
    policy::ScalingPolicy,
    repository::{ArtifactStore, JobQueue, Renderer},
    scaling::{backlog, utilization, CapacityKnob, Decision, SignalSource, WorkerPoolState},
};
use crate::worker::WorkerPool;

/// Busy pull loops over allocated pull loops.
pub struct PoolUtilization<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    pool: WorkerPool<Q, S, R, E>,
}

impl<Q, S, R, E> PoolUtilization<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    pub fn new(pool: WorkerPool<Q, S, R, E>) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl<Q, S, R, E> SignalSource for PoolUtilization<Q, S, R, E>
where
    Q: JobQueue,
    S: ArtifactStore,
    R: Renderer,
    E: EventTransport,
{
    async fn observe(&self) -> Result<f64> {
        let allocated = self.pool.size().await;
        Ok(utilization(self.pool.busy(), allocated))
    }
}

/// Approximate queue depth against what the knob's current capacity is
/// sized to absorb.
pub struct QueueBacklog<Q: JobQueue, K: CapacityKnob> {
    queue: Q,
    knob: K,
    target_per_worker: f64,
}

impl<Q: JobQueue, K: CapacityKnob> QueueBacklog<Q, K> {
    pub fn new(queue: Q, knob: K, target_per_worker: f64) -> Self {
        Self {
            queue,
            knob,
            target_per_worker,
        }
    }
}

#[async_trait::async_trait]
impl<Q: JobQueue, K: CapacityKnob> SignalSource for QueueBacklog<Q, K> {
    async fn observe(&self) -> Result<f64> {
        let depth = self.queue.approximate_depth().await?;
        let capacity = self.knob.current().await;
        Ok(backlog(depth, capacity, self.target_per_worker))
    }
}

pub struct Autoscaler<K: CapacityKnob, E: EventTransport> {
    knob: K,
    signal: Box<dyn SignalSource>,
    event: E,
    policy: ScalingPolicy,
    state: WorkerPoolState,
}

impl<K: CapacityKnob, E: EventTransport> Autoscaler<K, E> {
    /// Starts from `initial` capacity, clamped to the policy bounds.
    pub fn new(
        knob: K,
        signal: Box<dyn SignalSource>,
        event: E,
        policy: ScalingPolicy,
        initial: usize,
    ) -> Self {
        let initial = initial.clamp(policy.min_capacity, policy.max_capacity);
        Self {
            knob,
            signal,
            event,
            policy,
            state: WorkerPoolState::new(initial),
        }
    }

    pub fn state(&self) -> &WorkerPoolState {
        &self.state
    }

    /// Applies the starting capacity to the knob.
    pub async fn start(&self) -> Result<()> {
        self.knob.set_desired(self.state.desired_concurrency).await
    }

    /// One evaluation. A failed observation skips the period; a failed
    /// resize leaves the state untouched so the next period retries.
    pub async fn tick(&mut self, now: Instant) -> Option<Decision> {
        let signal = match self.signal.observe().await {
            Ok(signal) => signal,
            Err(e) => {
                warn!(error = %e, "failed to observe scaling signal");
                return None;
            }
        };

        let previous = self.state.clone();
        let decision = match self.state.decide(&self.policy, signal, now) {
            Some(decision) => decision,
            None => {
                debug!(signal, desired = self.state.desired_concurrency, "capacity unchanged");
                return None;
            }
        };

        if let Err(e) = self.knob.set_desired(decision.desired).await {
            error!(error = %e, desired = decision.desired, "failed to resize worker pool");
            self.state = previous;
            return None;
        }

        info!(
            signal,
            direction = ?decision.direction,
            previous = decision.previous,
            desired = decision.desired,
            "scaled worker pool"
        );

        let event = Event::new(Payload::ScaleDecision(ScaleDecision {
            signal,
            previous: decision.previous,
            desired: decision.desired,
        }));
        if let Err(e) = self.event.publish(&event).await {
            warn!(error = %e, "failed to publish scale decision");
        }

        Some(decision)
    }

    /// Runs until `cancel` fires. The first evaluation happens one full
    /// period after start.
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(
            period_secs = self.policy.period.as_secs(),
            min = self.policy.min_capacity,
            max = self.policy.max_capacity,
            "autoscaler started"
        );

        let mut interval = interval_at(Instant::now() + self.policy.period, self.policy.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("autoscaler stopping");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(Instant::now()).await;
                }
            }
        }
    }
}
