//! Per-partition watcher: FIFO queue, staleness timer, busy flag, and the
//! slot carrying changed fields from a previously failed commit.
//!
//! The watcher never drains itself. It signals staleness to the table
//! manager over a channel and the manager decides when to process; the busy
//! flag is the sole serialization point guaranteeing at most one concurrent
//! drain per partition.
use crate::ChangeRequest;
use parking_lot::Mutex;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub struct PartitionWatcher<R> {
    partition_key: String,
    stale_after: Duration,
    stale_tx: mpsc::Sender<String>,
    queue: Mutex<VecDeque<ChangeRequest<R>>>,
    busy: AtomicBool,
    // Single-shot timer task; present while armed or fired-but-not-cleared.
    timer: Mutex<Option<JoinHandle<()>>>,
    failed_commit: Mutex<Option<Value>>,
}

impl<R> PartitionWatcher<R> {
    pub fn new(
        partition_key: String,
        stale_after: Duration,
        stale_tx: mpsc::Sender<String>,
    ) -> Self {
        Self {
            partition_key,
            stale_after,
            stale_tx,
            queue: Mutex::new(VecDeque::new()),
            busy: AtomicBool::new(false),
            timer: Mutex::new(None),
            failed_commit: Mutex::new(None),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Append a change request to the back of the queue.
    pub fn enqueue(&self, request: ChangeRequest<R>) {
        self.queue.lock().push_back(request);
    }

    /// Remove the change request at the front of the queue. Callers check
    /// `len` first; an empty dequeue inside a drain is a bug.
    pub fn dequeue(&self) -> Option<ChangeRequest<R>> {
        self.queue.lock().pop_front()
    }

    /// Arm the staleness timer. Suppressed while the timer is already armed
    /// or the partition is busy; idempotent either way.
    pub fn start_timer(&self) {
        if self.is_busy() {
            return;
        }
        let mut timer = self.timer.lock();
        if let Some(handle) = timer.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let partition_key = self.partition_key.clone();
        let stale_tx = self.stale_tx.clone();
        let stale_after = self.stale_after;
        *timer = Some(tokio::spawn(async move {
            tokio::time::sleep(stale_after).await;
            // A closed receiver means the manager is gone; nothing to signal.
            let _ = stale_tx.send(partition_key).await;
        }));
    }

    /// Cancel the staleness timer if armed; idempotent.
    pub fn stop_timer(&self) {
        if let Some(handle) = self.timer.lock().take() {
            handle.abort();
        }
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Acquire the exclusive right to drain this partition. Exactly one
    /// caller wins between a threshold trigger and a stale trigger racing.
    pub fn try_begin_drain(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Release the partition after a drain, successful or not.
    pub fn finish_drain(&self) {
        self.busy.store(false, Ordering::Release);
    }

    pub fn failed_commit(&self) -> Option<Value> {
        self.failed_commit.lock().clone()
    }

    /// Retain changed fields that could not be committed; the next drain
    /// folds them back in so they are never silently dropped.
    pub fn set_failed_commit(&self, changes: Value) {
        *self.failed_commit.lock() = Some(changes);
    }

    pub fn clear_failed_commit(&self) {
        *self.failed_commit.lock() = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::time::{sleep, timeout};
    use uuid::Uuid;

    fn watcher(stale_after: Duration) -> (PartitionWatcher<()>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(8);
        (PartitionWatcher::new("7".to_string(), stale_after, tx), rx)
    }

    fn request(key: &str) -> ChangeRequest<()> {
        ChangeRequest {
            request_token: Uuid::new_v4(),
            modified_resource: (),
            patch_json: json!({}),
            partition_key: key.to_string(),
        }
    }

    #[tokio::test]
    async fn queue_is_fifo() {
        let (watcher, _rx) = watcher(Duration::from_secs(60));
        assert!(watcher.is_empty());
        watcher.enqueue(request("7"));
        watcher.enqueue(request("7"));
        assert_eq!(watcher.len(), 2);
        let first = watcher.dequeue().unwrap();
        let second = watcher.dequeue().unwrap();
        assert_ne!(first.request_token, second.request_token);
        assert!(watcher.dequeue().is_none());
    }

    #[tokio::test]
    async fn timer_signals_the_partition_key_once() {
        let (watcher, mut rx) = watcher(Duration::from_millis(10));
        watcher.start_timer();
        // Re-arming while armed is suppressed; only one signal arrives.
        watcher.start_timer();
        let key = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(key.as_deref(), Some("7"));
        sleep(Duration::from_millis(30)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn timer_can_rearm_after_firing() {
        let (watcher, mut rx) = watcher(Duration::from_millis(10));
        watcher.start_timer();
        timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        watcher.start_timer();
        let key = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
        assert_eq!(key.as_deref(), Some("7"));
    }

    #[tokio::test]
    async fn stop_timer_cancels_the_pending_signal() {
        let (watcher, mut rx) = watcher(Duration::from_millis(20));
        watcher.start_timer();
        watcher.stop_timer();
        sleep(Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn busy_partition_suppresses_the_timer() {
        let (watcher, mut rx) = watcher(Duration::from_millis(10));
        assert!(watcher.try_begin_drain());
        watcher.start_timer();
        sleep(Duration::from_millis(40)).await;
        assert!(rx.try_recv().is_err());
        watcher.finish_drain();
    }

    #[tokio::test]
    async fn only_one_drain_wins_the_busy_flag() {
        let (watcher, _rx) = watcher(Duration::from_secs(60));
        assert!(watcher.try_begin_drain());
        assert!(!watcher.try_begin_drain());
        assert!(watcher.is_busy());
        watcher.finish_drain();
        assert!(watcher.try_begin_drain());
        watcher.finish_drain();
    }

    #[tokio::test]
    async fn failed_commit_slot_round_trips() {
        let (watcher, _rx) = watcher(Duration::from_secs(60));
        assert!(watcher.failed_commit().is_none());
        watcher.set_failed_commit(json!({"A": 1}));
        assert_eq!(watcher.failed_commit(), Some(json!({"A": 1})));
        watcher.clear_failed_commit();
        assert!(watcher.failed_commit().is_none());
    }
}
