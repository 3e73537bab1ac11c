//! Durable priority queue for objectives.
//!
//! Ordering is priority-descending with FIFO tie-break on enqueue time.
//! Dequeued items stay in an in-flight set until `ack`; a `nack` puts
//! them back with an incremented attempt count or, once the budget is
//! spent, appends them to the dead-letter log. Every mutation rewrites
//! the snapshot file (write-to-temp then atomic rename), so a crash
//! re-offers any un-acked item on restart.

use crate::config::QueueSettings;
use crate::constants::MAX_QUEUE_SIZE;
use crate::models::Objective;
use crate::{HephaestusError, Result};
use serde::Serialize;
use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::{Mutex, Notify};
use tokio::time::{timeout_at, Duration, Instant};
use tracing::{debug, error, info, warn};

pub mod snapshot;

struct HeapEntry {
    seq: u64,
    objective: Objective,
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // BinaryHeap pops the greatest entry: higher priority first,
        // then earlier enqueue time, then earlier arrival.
        self.objective
            .priority
            .cmp(&other.objective.priority)
            .then_with(|| other.objective.enqueued_at.cmp(&self.objective.enqueued_at))
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for HeapEntry {}

struct QueueInner {
    heap: BinaryHeap<HeapEntry>,
    in_flight: HashMap<String, Objective>,
    seq: u64,
    dead_lettered: u64,
}

#[derive(Serialize)]
struct DeadLetterRecord<'a> {
    id: &'a str,
    priority: i64,
    attempts: u32,
    max_attempts: u32,
    reason: &'a str,
    at: chrono::DateTime<chrono::Utc>,
    payload: &'a serde_json::Value,
}

pub struct ObjectiveQueue {
    inner: Mutex<QueueInner>,
    notify: Notify,
    path: PathBuf,
    dead_letter_path: PathBuf,
    max_size: usize,
    default_max_retries: u32,
}

impl ObjectiveQueue {
    /// Open the queue, restoring state from the snapshot file when one
    /// exists. In-flight items that were never acknowledged are
    /// re-offered with their attempt count incremented; items past their
    /// retry budget go straight to the dead-letter log.
    pub fn open(settings: &QueueSettings) -> Result<Self> {
        let path = PathBuf::from(&settings.path);
        let dead_letter_path = PathBuf::from(format!("{}.dead", settings.path));

        let mut inner = QueueInner {
            heap: BinaryHeap::new(),
            in_flight: HashMap::new(),
            seq: 0,
            dead_lettered: 0,
        };

        if path.exists() {
            let bytes = std::fs::read(&path)?;
            let (data, truncated) = snapshot::decode(&bytes)?;
            if truncated {
                warn!("Queue snapshot had a corrupt tail; recovered prefix");
            }

            for objective in data.heap {
                inner.seq += 1;
                let seq = inner.seq;
                inner.heap.push(HeapEntry { seq, objective });
            }
            for mut objective in data.in_flight {
                objective.attempts += 1;
                if objective.attempts >= objective.max_attempts {
                    info!(
                        "Objective {} exhausted retries during recovery, dead-lettering",
                        objective.id
                    );
                    Self::append_dead_letter(
                        &dead_letter_path,
                        &objective,
                        "retries exhausted during crash recovery",
                    );
                    inner.dead_lettered += 1;
                } else {
                    inner.seq += 1;
                    let seq = inner.seq;
                    inner.heap.push(HeapEntry { seq, objective });
                }
            }
            info!(
                "Queue restored: {} queued, {} dead-lettered during recovery",
                inner.heap.len(),
                inner.dead_lettered
            );
        }

        let queue = Self {
            inner: Mutex::new(inner),
            notify: Notify::new(),
            path,
            dead_letter_path,
            max_size: MAX_QUEUE_SIZE,
            default_max_retries: settings.max_retries,
        };
        Ok(queue)
    }

    /// Producer convenience: wrap a payload in an objective carrying the
    /// configured retry budget. Returns the objective id.
    pub async fn enqueue_payload(
        &self,
        payload: serde_json::Value,
        priority: i64,
    ) -> Result<String> {
        let objective = Objective::new(payload, priority, self.default_max_retries);
        let id = objective.id.clone();
        self.enqueue(objective).await?;
        Ok(id)
    }

    pub async fn enqueue(&self, objective: Objective) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.heap.len() + inner.in_flight.len() >= self.max_size {
            return Err(HephaestusError::QueueFull);
        }

        inner.seq += 1;
        let seq = inner.seq;
        debug!(
            "Objective {} enqueued (priority {}, attempt {})",
            objective.id, objective.priority, objective.attempts
        );
        inner.heap.push(HeapEntry { seq, objective });
        self.persist(&inner)?;
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    /// Pop the highest-priority objective, waiting up to `wait` for one
    /// to arrive. The item stays in the in-flight set until `ack`.
    pub async fn dequeue(&self, wait: Duration) -> Option<Objective> {
        let deadline = Instant::now() + wait;
        loop {
            {
                let mut inner = self.inner.lock().await;
                if let Some(entry) = inner.heap.pop() {
                    let objective = entry.objective;
                    inner
                        .in_flight
                        .insert(objective.id.clone(), objective.clone());
                    if let Err(e) = self.persist(&inner) {
                        error!("Queue snapshot failed after dequeue: {}", e);
                    }
                    debug!("Objective {} dequeued", objective.id);
                    return Some(objective);
                }
            }
            if timeout_at(deadline, self.notify.notified()).await.is_err() {
                return None;
            }
        }
    }

    /// Acknowledge successful completion; the objective leaves the queue
    /// for good.
    pub async fn ack(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.in_flight.remove(id).is_none() {
            return Err(HephaestusError::NotFound(format!(
                "objective {id} is not in flight"
            )));
        }
        info!("Objective {} acknowledged", id);
        self.persist(&inner)
    }

    /// Report failure; the objective is re-enqueued with its attempt
    /// count incremented, or dead-lettered once the budget is spent.
    pub async fn nack(&self, id: &str, reason: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut objective = inner.in_flight.remove(id).ok_or_else(|| {
            HephaestusError::NotFound(format!("objective {id} is not in flight"))
        })?;

        objective.attempts += 1;
        if objective.attempts >= objective.max_attempts {
            warn!(
                "Objective {} failed permanently after {} attempts: {}",
                id, objective.attempts, reason
            );
            Self::append_dead_letter(&self.dead_letter_path, &objective, reason);
            inner.dead_lettered += 1;
            self.persist(&inner)?;
            return Ok(());
        }

        info!(
            "Objective {} re-enqueued (attempt {}/{}): {}",
            id, objective.attempts, objective.max_attempts, reason
        );
        inner.seq += 1;
        let seq = inner.seq;
        inner.heap.push(HeapEntry { seq, objective });
        self.persist(&inner)?;
        drop(inner);
        self.notify.notify_one();
        Ok(())
    }

    pub async fn depth(&self) -> usize {
        self.inner.lock().await.heap.len()
    }

    pub async fn in_flight_count(&self) -> usize {
        self.inner.lock().await.in_flight.len()
    }

    pub async fn dead_letter_count(&self) -> u64 {
        self.inner.lock().await.dead_lettered
    }

    /// Force a snapshot write; used on shutdown.
    pub async fn flush(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        self.persist(&inner)
    }

    fn persist(&self, inner: &QueueInner) -> Result<()> {
        let data = snapshot::SnapshotData {
            heap: inner.heap.iter().map(|e| e.objective.clone()).collect(),
            in_flight: inner.in_flight.values().cloned().collect(),
        };
        let bytes = snapshot::encode(&data);

        let tmp = self.path.with_extension("tmp");
        {
            let mut file = std::fs::File::create(&tmp)?;
            file.write_all(&bytes)?;
            file.sync_all()?;
        }
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn append_dead_letter(path: &PathBuf, objective: &Objective, reason: &str) {
        let record = DeadLetterRecord {
            id: &objective.id,
            priority: objective.priority,
            attempts: objective.attempts,
            max_attempts: objective.max_attempts,
            reason,
            at: chrono::Utc::now(),
            payload: &objective.payload,
        };
        let line = match serde_json::to_string(&record) {
            Ok(line) => line,
            Err(e) => {
                error!("Failed to serialize dead-letter record: {}", e);
                return;
            }
        };
        let result = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            error!("Failed to append dead-letter record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(dir: &tempfile::TempDir) -> QueueSettings {
        QueueSettings {
            path: dir
                .path()
                .join("queue.snapshot")
                .to_string_lossy()
                .into_owned(),
            max_retries: 3,
        }
    }

    fn objective(priority: i64, max_attempts: u32) -> Objective {
        Objective::new(json!({"work": priority}), priority, max_attempts)
    }

    #[tokio::test]
    async fn dequeue_returns_highest_priority_first() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ObjectiveQueue::open(&settings(&dir)).unwrap();

        queue.enqueue(objective(1, 3)).await.unwrap();
        queue.enqueue(objective(9, 3)).await.unwrap();
        queue.enqueue(objective(5, 3)).await.unwrap();

        let first = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        let second = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        let third = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.priority, 9);
        assert_eq!(second.priority, 5);
        assert_eq!(third.priority, 1);
    }

    #[tokio::test]
    async fn equal_priority_is_fifo() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ObjectiveQueue::open(&settings(&dir)).unwrap();

        let a = objective(5, 3);
        let b = objective(5, 3);
        let (a_id, b_id) = (a.id.clone(), b.id.clone());
        queue.enqueue(a).await.unwrap();
        queue.enqueue(b).await.unwrap();

        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap().id, a_id);
        assert_eq!(queue.dequeue(Duration::from_millis(10)).await.unwrap().id, b_id);
    }

    #[tokio::test]
    async fn dequeue_times_out_on_empty_queue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ObjectiveQueue::open(&settings(&dir)).unwrap();
        assert!(queue.dequeue(Duration::from_millis(20)).await.is_none());
    }

    #[tokio::test]
    async fn nack_re_enqueues_with_incremented_attempts() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ObjectiveQueue::open(&settings(&dir)).unwrap();

        queue.enqueue(objective(5, 3)).await.unwrap();
        let obj = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.nack(&obj.id, "planner unavailable").await.unwrap();

        let retried = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(retried.id, obj.id);
        assert_eq!(retried.attempts, 1);
    }

    #[tokio::test]
    async fn exhausted_objective_goes_to_dead_letter() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir);
        let queue = ObjectiveQueue::open(&s).unwrap();

        queue.enqueue(objective(5, 1)).await.unwrap();
        let obj = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.nack(&obj.id, "agent melted down").await.unwrap();

        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());
        assert_eq!(queue.dead_letter_count().await, 1);

        let dead = std::fs::read_to_string(format!("{}.dead", s.path)).unwrap();
        assert!(dead.contains(&obj.id));
        assert!(dead.contains("agent melted down"));
    }

    #[tokio::test]
    async fn ack_removes_item_for_good() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ObjectiveQueue::open(&settings(&dir)).unwrap();

        queue.enqueue(objective(5, 3)).await.unwrap();
        let obj = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        queue.ack(&obj.id).await.unwrap();

        assert_eq!(queue.in_flight_count().await, 0);
        assert!(queue.dequeue(Duration::from_millis(10)).await.is_none());
        assert!(queue.ack(&obj.id).await.is_err());
    }

    #[tokio::test]
    async fn crash_between_dequeue_and_ack_re_offers_item() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir);

        {
            let queue = ObjectiveQueue::open(&s).unwrap();
            queue.enqueue(objective(5, 3)).await.unwrap();
            queue.enqueue(objective(5, 3)).await.unwrap();
            queue.enqueue(objective(9, 3)).await.unwrap();

            let taken = queue.dequeue(Duration::from_millis(10)).await.unwrap();
            assert_eq!(taken.priority, 9);
            // Queue dropped without ack: simulated crash.
        }

        let revived = ObjectiveQueue::open(&s).unwrap();
        let first = revived.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(first.priority, 9);
        assert_eq!(first.attempts, 1);

        let second = revived.dequeue(Duration::from_millis(10)).await.unwrap();
        let third = revived.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(second.priority, 5);
        assert_eq!(third.priority, 5);
        assert!(second.enqueued_at <= third.enqueued_at);
    }

    #[tokio::test]
    async fn recovery_dead_letters_exhausted_in_flight_items() {
        let dir = tempfile::tempdir().unwrap();
        let s = settings(&dir);

        {
            let queue = ObjectiveQueue::open(&s).unwrap();
            queue.enqueue(objective(5, 1)).await.unwrap();
            let _ = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        }

        let revived = ObjectiveQueue::open(&s).unwrap();
        assert!(revived.dequeue(Duration::from_millis(10)).await.is_none());
        assert_eq!(revived.dead_letter_count().await, 1);
    }

    #[tokio::test]
    async fn enqueue_payload_applies_configured_retry_budget() {
        let dir = tempfile::tempdir().unwrap();
        let queue = ObjectiveQueue::open(&settings(&dir)).unwrap();

        let id = queue
            .enqueue_payload(json!({"goal": "polish"}), 2)
            .await
            .unwrap();
        let obj = queue.dequeue(Duration::from_millis(10)).await.unwrap();
        assert_eq!(obj.id, id);
        assert_eq!(obj.max_attempts, 3);
    }

    #[tokio::test]
    async fn dequeue_wakes_on_concurrent_enqueue() {
        let dir = tempfile::tempdir().unwrap();
        let queue = std::sync::Arc::new(ObjectiveQueue::open(&settings(&dir)).unwrap());

        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.enqueue(objective(7, 3)).await.unwrap();

        let got = waiter.await.unwrap().unwrap();
        assert_eq!(got.priority, 7);
    }
}
