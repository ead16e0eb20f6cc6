//! Asynchronous replication fan-out.
//!
//! A write applied at its source region is delivered to every other target
//! region as an independent unit of work with its own retry budget. Deliveries
//! for the same (key, target) pair run through one FIFO lane, so a target never
//! applies an older value after a newer one. Different keys and different
//! targets proceed independently.

use crate::config::ReplicationConfig;
use crate::core::{age, now, Error, Result, Sequence, Timestamp, WritePayload};
use crate::monitoring::events::{CoordinatorEvent, EventSink};
use crate::monitoring::metrics::CoordinatorMetrics;
use crate::region::store::RegionStore;
use crate::region::topology::{Region, TopologySnapshot};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::mpsc::error::TryRecvError;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Delivery status of one target.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Queued behind earlier writes for the same key
    Pending,
    /// Being delivered or waiting for a retry
    InFlight,
    /// Applied at the target
    Acked,
    /// Retries exhausted
    Failed,
    /// Skipped, the target already holds a newer write for the key
    Superseded,
}

impl DeliveryStatus {
    /// Whether no further automatic attempts will happen.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, DeliveryStatus::Pending | DeliveryStatus::InFlight)
    }

    /// Whether the target holds this write or a newer one.
    pub fn is_caught_up(&self) -> bool {
        matches!(self, DeliveryStatus::Acked | DeliveryStatus::Superseded)
    }
}

/// Per-target delivery state.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetState {
    /// Current status
    pub status: DeliveryStatus,
    /// Attempts made so far
    pub attempts: u32,
    /// Reason of the last failed attempt
    pub last_error: Option<String>,
    /// When the next retry is due
    pub next_retry_at: Option<Timestamp>,
    /// When the target acknowledged
    pub acked_at: Option<Timestamp>,
}

impl TargetState {
    fn pending() -> Self {
        Self {
            status: DeliveryStatus::Pending,
            attempts: 0,
            last_error: None,
            next_retry_at: None,
            acked_at: None,
        }
    }
}

/// Overall state of a task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicationOutcome {
    /// Some target is not terminal yet
    InProgress,
    /// Every target acknowledged
    FullyReplicated,
    /// Some targets acknowledged, some failed
    PartiallyReplicated,
    /// Every target failed
    Failed,
}

/// One write being propagated to its targets.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReplicationTask {
    /// Task ID
    pub id: String,
    /// The write
    pub payload: WritePayload,
    /// Region where the write was first applied
    pub source_region: String,
    /// Delivery state per target region
    pub targets: BTreeMap<String, TargetState>,
    /// Creation time
    pub created_at: Timestamp,
    /// Time every target became terminal
    pub completed_at: Option<Timestamp>,
}

impl ReplicationTask {
    /// Logical key of the write.
    pub fn key(&self) -> &str {
        &self.payload.key
    }

    /// Whether every target is terminal.
    pub fn is_complete(&self) -> bool {
        self.targets.values().all(|t| t.status.is_terminal())
    }

    /// Whether every target holds this write or a newer one.
    pub fn is_fully_replicated(&self) -> bool {
        self.targets.values().all(|t| t.status.is_caught_up())
    }

    /// Overall outcome.
    pub fn outcome(&self) -> ReplicationOutcome {
        if !self.is_complete() {
            return ReplicationOutcome::InProgress;
        }
        let failed = self.failed_targets().len();
        if failed == 0 {
            ReplicationOutcome::FullyReplicated
        } else if failed == self.targets.len() {
            ReplicationOutcome::Failed
        } else {
            ReplicationOutcome::PartiallyReplicated
        }
    }

    /// Targets whose delivery failed.
    pub fn failed_targets(&self) -> Vec<&str> {
        self.targets_with(DeliveryStatus::Failed)
    }

    /// Targets that acknowledged.
    pub fn acked_targets(&self) -> Vec<&str> {
        self.targets_with(DeliveryStatus::Acked)
    }

    /// State of one target.
    pub fn target(&self, region_id: &str) -> Option<&TargetState> {
        self.targets.get(region_id)
    }

    fn targets_with(&self, status: DeliveryStatus) -> Vec<&str> {
        self.targets
            .iter()
            .filter(|(_, t)| t.status == status)
            .map(|(id, _)| id.as_str())
            .collect()
    }
}

/// Exponential backoff with a cap and an attempt budget.
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// First retry delay
    pub base_delay: Duration,
    /// Delay cap
    pub max_delay: Duration,
    /// Attempts per target
    pub max_attempts: u32,
    /// Random spread, fraction of the delay
    pub jitter: f64,
}

impl RetryPolicy {
    /// Build from configuration.
    pub fn from_config(config: &ReplicationConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_attempts: config.max_attempts,
            jitter: config.jitter,
        }
    }

    /// Delay after failed attempt `attempt` (1-based): `min(base * 2^(attempt-1), cap)`.
    ///
    /// Only attempts below `max_attempts` are followed by a sleep. With the
    /// defaults the fifth delay (16s) is never slept: five attempts are
    /// separated by 1s, 2s, 4s and 8s.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u32
            .checked_shl(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// [`Self::delay_for`] with jitter applied.
    pub fn jittered_delay(&self, attempt: u32) -> Duration {
        let delay = self.delay_for(attempt);
        if self.jitter <= 0.0 {
            return delay;
        }
        let spread = rand::thread_rng().gen_range(-1.0..=1.0) * self.jitter;
        delay.mul_f64((1.0 + spread).max(0.0))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&ReplicationConfig::default())
    }
}

/// Source of per-region replication lag.
pub trait ReplicationLag: Send + Sync {
    /// Deliveries submitted to a region but not acknowledged by it.
    fn replication_lag(&self, region_id: &str) -> u64;
}

/// Summary of tracked tasks by outcome.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationStats {
    pub total: usize,
    pub in_progress: usize,
    pub fully_replicated: usize,
    pub partially_replicated: usize,
    pub failed: usize,
}

struct Delivery {
    task_id: String,
    target: String,
    payload: Arc<WritePayload>,
}

type LaneKey = (String, String);
type Lanes = HashMap<LaneKey, UnboundedSender<Delivery>>;

/// Outcome of a gated apply.
enum Applied {
    Written,
    Superseded,
}

/// Newest sequence applied at one region for one key.
type ApplyGate = Arc<tokio::sync::Mutex<u64>>;

#[derive(Default)]
struct TaskBook {
    tasks: HashMap<String, ReplicationTask>,
    /// Newest task per key
    latest: HashMap<String, String>,
}

struct Inner {
    topology: watch::Receiver<Arc<TopologySnapshot>>,
    store: Arc<dyn RegionStore>,
    config: ReplicationConfig,
    policy: RetryPolicy,
    events: Arc<dyn EventSink>,
    metrics: Arc<CoordinatorMetrics>,
    /// Lock order: `lanes` before `book`.
    lanes: Mutex<Lanes>,
    book: RwLock<TaskBook>,
    lag: RwLock<HashMap<String, u64>>,
    /// Serializes applies per (key, region), whether sourced or delivered
    gates: Mutex<HashMap<LaneKey, ApplyGate>>,
    sequence: Sequence,
    completed: Notify,
}

/// Fans writes out to replica regions and tracks delivery state.
#[derive(Clone)]
pub struct ReplicationCoordinator {
    inner: Arc<Inner>,
}

impl ReplicationCoordinator {
    /// Create a coordinator following a topology channel.
    pub fn new(
        topology: watch::Receiver<Arc<TopologySnapshot>>,
        store: Arc<dyn RegionStore>,
        config: ReplicationConfig,
        events: Arc<dyn EventSink>,
        metrics: Arc<CoordinatorMetrics>,
    ) -> Self {
        let policy = RetryPolicy::from_config(&config);
        Self {
            inner: Arc::new(Inner {
                topology,
                store,
                config,
                policy,
                events,
                metrics,
                lanes: Mutex::new(HashMap::new()),
                book: RwLock::new(TaskBook::default()),
                lag: RwLock::new(HashMap::new()),
                gates: Mutex::new(HashMap::new()),
                sequence: Sequence::default(),
                completed: Notify::new(),
            }),
        }
    }

    /// Retry policy in use.
    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    /// Build a payload carrying the next submission sequence.
    pub fn prepare(&self, key: &str, data: Vec<u8>) -> WritePayload {
        WritePayload::new(key, data).with_sequence(self.inner.sequence.next())
    }

    /// Fan out a write already applied at the current primary.
    pub fn submit_replication(&self, key: &str, data: Vec<u8>) -> Result<String> {
        let snapshot = self.inner.topology.borrow().clone();
        if snapshot.healthy_count() == 0 {
            return Err(Error::NoHealthyRegion);
        }
        let primary = snapshot.primary().ok_or(Error::NoPrimary)?.id.clone();
        self.replicate_from(&primary, self.prepare(key, data))
    }

    /// Apply a write at `source` and fan it out to the other regions.
    ///
    /// Fails with `ApplyFailed` when the source does not accept the write; no
    /// task is created in that case. The source apply shares the per-key gate
    /// with deliveries, so a retry of an older write never lands after it.
    pub async fn apply_and_replicate(&self, source: &str, key: &str, data: Vec<u8>) -> Result<String> {
        let region = self
            .inner
            .region(source)
            .ok_or_else(|| Error::UnknownRegion(source.to_string()))?;
        let payload = self.prepare(key, data);

        match self.inner.apply_gated(&region, &payload).await {
            Ok(Applied::Written) => {}
            Ok(Applied::Superseded) => {
                debug!(key, source, sequence = payload.sequence, "source already holds a newer write");
            }
            Err(reason) => {
                return Err(Error::ApplyFailed {
                    region: source.to_string(),
                    reason,
                })
            }
        }

        self.replicate_from(source, payload)
    }

    /// Fan out a payload applied at `source`. Returns the task id.
    pub fn replicate_from(&self, source: &str, payload: WritePayload) -> Result<String> {
        let snapshot = self.inner.topology.borrow().clone();
        if !snapshot.contains(source) {
            return Err(Error::UnknownRegion(source.to_string()));
        }

        let targets = self.inner.targets_for(&snapshot, source);
        let task = ReplicationTask {
            id: uuid::Uuid::new_v4().to_string(),
            payload,
            source_region: source.to_string(),
            targets: targets
                .iter()
                .map(|t| (t.clone(), TargetState::pending()))
                .collect(),
            created_at: now(),
            completed_at: if targets.is_empty() { Some(now()) } else { None },
        };
        let task_id = task.id.clone();
        let payload = Arc::new(task.payload.clone());

        debug!(
            task = %task_id,
            key = %payload.key,
            sequence = payload.sequence,
            source,
            targets = targets.len(),
            "replication task created"
        );

        let mut lanes = self.inner.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        {
            let mut book = self.inner.book.write().unwrap_or_else(PoisonError::into_inner);
            book.latest.insert(payload.key.clone(), task_id.clone());
            book.tasks.insert(task_id.clone(), task);
        }
        {
            let mut lag = self.inner.lag.write().unwrap_or_else(PoisonError::into_inner);
            for target in &targets {
                *lag.entry(target.clone()).or_insert(0) += 1;
            }
        }
        for target in targets {
            self.inner.enqueue(
                &mut lanes,
                Delivery {
                    task_id: task_id.clone(),
                    target,
                    payload: Arc::clone(&payload),
                },
            );
        }
        drop(lanes);

        if self.task(&task_id).map(|t| t.is_complete()).unwrap_or(false) {
            self.inner.completed.notify_waiters();
        }
        Ok(task_id)
    }

    /// Get a copy of a task.
    pub fn task(&self, task_id: &str) -> Option<ReplicationTask> {
        self.inner.read_book().tasks.get(task_id).cloned()
    }

    /// Copies of all tracked tasks.
    pub fn tasks(&self) -> Vec<ReplicationTask> {
        self.inner.read_book().tasks.values().cloned().collect()
    }

    /// Wait until every target of a task is terminal.
    pub async fn wait_for(&self, task_id: &str) -> Result<ReplicationTask> {
        loop {
            let notified = self.inner.completed.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.task(task_id) {
                Some(task) if task.is_complete() => return Ok(task),
                Some(_) => {}
                None => return Err(Error::UnknownTask(task_id.to_string())),
            }
            notified.await;
        }
    }

    /// Re-drive the failed targets of a task.
    ///
    /// Rejected when a newer write for the same key exists, since the old value
    /// would overwrite it. Returns the number of targets re-queued.
    pub fn redrive(&self, task_id: &str) -> Result<usize> {
        let mut lanes = self.inner.lanes.lock().unwrap_or_else(PoisonError::into_inner);

        let (payload, targets) = {
            let mut book = self.inner.book.write().unwrap_or_else(PoisonError::into_inner);
            let newest = book.latest.get(
                book.tasks
                    .get(task_id)
                    .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?
                    .key(),
            );
            if newest.map(String::as_str) != Some(task_id) {
                return Err(Error::RedriveRejected(format!(
                    "task {} has been superseded by a newer write for its key",
                    task_id
                )));
            }

            let task = book
                .tasks
                .get_mut(task_id)
                .ok_or_else(|| Error::UnknownTask(task_id.to_string()))?;
            let failed: Vec<String> = task.failed_targets().iter().map(|t| t.to_string()).collect();
            for target in &failed {
                if let Some(state) = task.targets.get_mut(target) {
                    *state = TargetState::pending();
                }
            }
            if !failed.is_empty() {
                task.completed_at = None;
            }
            (Arc::new(task.payload.clone()), failed)
        };

        for target in &targets {
            info!(task = %task_id, target = %target, "re-driving failed delivery");
            self.inner.enqueue(
                &mut lanes,
                Delivery {
                    task_id: task_id.to_string(),
                    target: target.clone(),
                    payload: Arc::clone(&payload),
                },
            );
        }
        Ok(targets.len())
    }

    /// Drop completed tasks older than `retention`. Returns how many were removed.
    pub fn prune_completed(&self, retention: Duration) -> usize {
        let mut book = self.inner.book.write().unwrap_or_else(PoisonError::into_inner);
        let expired: Vec<String> = book
            .tasks
            .values()
            .filter(|t| t.completed_at.map(|at| age(at) >= retention).unwrap_or(false))
            .map(|t| t.id.clone())
            .collect();

        for id in &expired {
            book.tasks.remove(id);
        }
        book.latest.retain(|_, id| !expired.contains(id));

        let live_keys: HashSet<&str> = book.tasks.values().map(|t| t.key()).collect();
        self.inner
            .gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|(key, _), gate| live_keys.contains(key.as_str()) || Arc::strong_count(gate) > 1);

        if !expired.is_empty() {
            debug!(removed = expired.len(), "pruned completed replication tasks");
        }
        expired.len()
    }

    /// Task counts by outcome.
    pub fn stats(&self) -> ReplicationStats {
        let book = self.inner.read_book();
        let mut stats = ReplicationStats {
            total: book.tasks.len(),
            ..Default::default()
        };
        for task in book.tasks.values() {
            match task.outcome() {
                ReplicationOutcome::InProgress => stats.in_progress += 1,
                ReplicationOutcome::FullyReplicated => stats.fully_replicated += 1,
                ReplicationOutcome::PartiallyReplicated => stats.partially_replicated += 1,
                ReplicationOutcome::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Spawn the periodic garbage collector.
    pub fn spawn_gc(&self, mut shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        let coordinator = self.clone();
        let retention = self.inner.config.retention();
        let period = self.inner.config.gc_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = ticker.tick() => {
                        coordinator.prune_completed(retention);
                    }
                }
            }
        })
    }
}

impl ReplicationLag for ReplicationCoordinator {
    fn replication_lag(&self, region_id: &str) -> u64 {
        self.inner
            .lag
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(region_id)
            .copied()
            .unwrap_or(0)
    }
}

impl Inner {
    fn read_book(&self) -> std::sync::RwLockReadGuard<'_, TaskBook> {
        self.book.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn region(&self, region_id: &str) -> Option<Region> {
        self.topology.borrow().get(region_id).cloned()
    }

    fn targets_for(&self, snapshot: &TopologySnapshot, source: &str) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }
        snapshot
            .regions()
            .filter(|r| r.id != source)
            .filter(|r| match &self.config.targets {
                Some(allowed) => allowed.iter().any(|a| a == &r.id),
                None => true,
            })
            .map(|r| r.id.clone())
            .collect()
    }

    /// Queue a delivery on its (key, target) lane, starting the lane if idle.
    fn enqueue(self: &Arc<Self>, lanes: &mut Lanes, delivery: Delivery) {
        let lane = (delivery.payload.key.clone(), delivery.target.clone());
        let delivery = match lanes.get(&lane) {
            Some(tx) => match tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => returned,
            },
            None => delivery,
        };

        let (tx, rx) = mpsc::unbounded_channel();
        if tx.send(delivery).is_ok() {
            lanes.insert(lane.clone(), tx);
            tokio::spawn(Arc::clone(self).run_lane(lane, rx));
        }
    }

    /// Drain a lane in order; the lane retires itself once empty.
    async fn run_lane(self: Arc<Self>, lane: LaneKey, mut rx: UnboundedReceiver<Delivery>) {
        while let Some(delivery) = self.next_delivery(&lane, &mut rx) {
            self.deliver(delivery).await;
        }
    }

    /// Next queued delivery, or `None` after removing the drained lane.
    fn next_delivery(&self, lane: &LaneKey, rx: &mut UnboundedReceiver<Delivery>) -> Option<Delivery> {
        match rx.try_recv() {
            Ok(delivery) => Some(delivery),
            Err(TryRecvError::Empty) => {
                let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
                match rx.try_recv() {
                    Ok(delivery) => Some(delivery),
                    Err(_) => {
                        lanes.remove(lane);
                        None
                    }
                }
            }
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn gate(&self, key: &str, region_id: &str) -> ApplyGate {
        self.gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((key.to_string(), region_id.to_string()))
            .or_default()
            .clone()
    }

    /// Apply one write at a region unless it already holds a newer one for the key.
    ///
    /// The gate stays held for the single attempt, bounded by the attempt timeout.
    async fn apply_gated(
        &self,
        region: &Region,
        payload: &WritePayload,
    ) -> std::result::Result<Applied, String> {
        let gate = self.gate(&payload.key, &region.id);
        let mut newest = gate.lock().await;
        if *newest > payload.sequence {
            return Ok(Applied::Superseded);
        }

        let timeout = self.config.attempt_timeout();
        match tokio::time::timeout(timeout, self.store.apply(region, payload)).await {
            Ok(Ok(())) => {
                *newest = payload.sequence;
                Ok(Applied::Written)
            }
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("attempt timed out after {:?}", timeout)),
        }
    }

    async fn deliver(&self, delivery: Delivery) {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            self.update_target(&delivery, |state| {
                state.status = DeliveryStatus::InFlight;
                state.attempts = attempt;
                state.next_retry_at = None;
            });

            let reason = match self.region(&delivery.target) {
                None => Error::UnknownRegion(delivery.target.clone()).to_string(),
                Some(region) => match self.apply_gated(&region, &delivery.payload).await {
                    Ok(Applied::Written) => {
                        self.acknowledge(&delivery);
                        return;
                    }
                    Ok(Applied::Superseded) => {
                        self.supersede(&delivery);
                        return;
                    }
                    Err(reason) => reason,
                },
            };

            if attempt >= max_attempts {
                self.exhaust(&delivery, attempt, reason);
                return;
            }

            let delay = self.policy.jittered_delay(attempt);
            self.metrics.delivery_retries.inc();
            debug!(
                task = %delivery.task_id,
                target = %delivery.target,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %reason,
                "delivery failed, retrying"
            );
            self.update_target(&delivery, |state| {
                state.last_error = Some(reason);
                state.next_retry_at = chrono::Duration::from_std(delay).ok().map(|d| now() + d);
            });
            tokio::time::sleep(delay).await;
        }
    }

    fn acknowledge(&self, delivery: &Delivery) {
        self.metrics.deliveries_acked.inc();
        self.settle(delivery, DeliveryStatus::Acked);
    }

    fn supersede(&self, delivery: &Delivery) {
        self.metrics.deliveries_superseded.inc();
        debug!(
            task = %delivery.task_id,
            key = %delivery.payload.key,
            target = %delivery.target,
            sequence = delivery.payload.sequence,
            "target holds a newer write, delivery skipped"
        );
        self.settle(delivery, DeliveryStatus::Superseded);
    }

    fn settle(&self, delivery: &Delivery, status: DeliveryStatus) {
        {
            let mut lag = self.lag.write().unwrap_or_else(PoisonError::into_inner);
            if let Some(pending) = lag.get_mut(&delivery.target) {
                *pending = pending.saturating_sub(1);
            }
        }
        self.update_target(delivery, |state| {
            state.status = status;
            state.acked_at = Some(now());
            state.last_error = None;
            state.next_retry_at = None;
        });
    }

    fn exhaust(&self, delivery: &Delivery, attempts: u32, reason: String) {
        self.metrics.deliveries_failed.inc();
        let err = Error::ReplicationFailed {
            target: delivery.target.clone(),
            attempts,
            reason: reason.clone(),
        };
        warn!(task = %delivery.task_id, key = %delivery.payload.key, error = %err, "replication delivery exhausted");

        self.events.emit(CoordinatorEvent::ReplicationExhausted {
            task_id: delivery.task_id.clone(),
            key: delivery.payload.key.clone(),
            target: delivery.target.clone(),
            attempts,
            error: reason.clone(),
        });
        self.update_target(delivery, |state| {
            state.status = DeliveryStatus::Failed;
            state.last_error = Some(reason);
            state.next_retry_at = None;
        });
    }

    /// Mutate one target's state and mark the task complete when all targets are terminal.
    fn update_target(&self, delivery: &Delivery, f: impl FnOnce(&mut TargetState)) {
        let finished = {
            let mut book = self.book.write().unwrap_or_else(PoisonError::into_inner);
            let Some(task) = book.tasks.get_mut(&delivery.task_id) else {
                return;
            };
            if let Some(state) = task.targets.get_mut(&delivery.target) {
                f(state);
            }
            if task.completed_at.is_none() && task.is_complete() {
                task.completed_at = Some(now());
                Some(task.outcome())
            } else {
                None
            }
        };

        if let Some(outcome) = finished {
            info!(task = %delivery.task_id, outcome = ?outcome, "replication task complete");
            self.completed.notify_waiters();
        }
    }
}
