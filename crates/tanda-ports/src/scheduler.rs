//! The `Scheduler` port (SPEC_FULL.md §6.4 / §4.8): arms and cancels deadline
//! timers. The core never owns wall-clock scheduling itself — it only arms,
//! cancels, and reacts to advisory fires.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::warn;

use tanda_core::{Error, Timestamp};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimerHandle(pub String);

/// A fired timer: `task_id` plus the payload it was armed with.
#[derive(Clone, Debug)]
pub struct TimerFire {
    pub task_id: String,
    pub payload: serde_json::Value,
}

#[async_trait]
pub trait Scheduler: Send + Sync {
    async fn arm(
        &self,
        task_id: &str,
        fire_at: Timestamp,
        payload: serde_json::Value,
    ) -> Result<TimerHandle, Error>;

    /// A cancel after the timer already fired is a no-op, not an error —
    /// fires are advisory and the FSM re-checks state before acting on one.
    async fn cancel(&self, handle: &TimerHandle) -> Result<(), Error>;
}

/// Production adapter: one `tokio::time::sleep` task per armed timer,
/// delivering fires on an mpsc channel for `TimerDispatcher` to drain.
/// Stands in for an external cron/task-queue system (SPEC_FULL.md §6.4).
pub struct InProcessScheduler {
    armed: StdMutex<HashMap<String, JoinHandle<()>>>,
    fire_tx: mpsc::Sender<TimerFire>,
}

impl InProcessScheduler {
    pub fn new(fire_tx: mpsc::Sender<TimerFire>) -> Self {
        Self {
            armed: StdMutex::new(HashMap::new()),
            fire_tx,
        }
    }
}

#[async_trait]
impl Scheduler for InProcessScheduler {
    async fn arm(
        &self,
        task_id: &str,
        fire_at: Timestamp,
        payload: serde_json::Value,
    ) -> Result<TimerHandle, Error> {
        let delay = (fire_at - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        let tx = self.fire_tx.clone();
        let id = task_id.to_string();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if tx
                .send(TimerFire {
                    task_id: id.clone(),
                    payload,
                })
                .await
                .is_err()
            {
                warn!(task_id = %id, "timer fired but dispatcher channel is closed");
            }
        });
        self.armed
            .lock()
            .expect("scheduler armed-set poisoned")
            .insert(task_id.to_string(), handle);
        Ok(TimerHandle(task_id.to_string()))
    }

    async fn cancel(&self, handle: &TimerHandle) -> Result<(), Error> {
        if let Some(h) = self
            .armed
            .lock()
            .expect("scheduler armed-set poisoned")
            .remove(&handle.0)
        {
            h.abort();
        }
        Ok(())
    }
}

/// Test adapter: records arm/cancel calls instead of actually sleeping.
#[derive(Default)]
pub struct StubScheduler {
    pub armed: StdMutex<Vec<(String, Timestamp, serde_json::Value)>>,
    pub cancelled: StdMutex<Vec<String>>,
}

impl StubScheduler {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Scheduler for StubScheduler {
    async fn arm(
        &self,
        task_id: &str,
        fire_at: Timestamp,
        payload: serde_json::Value,
    ) -> Result<TimerHandle, Error> {
        self.armed
            .lock()
            .expect("stub scheduler poisoned")
            .push((task_id.to_string(), fire_at, payload));
        Ok(TimerHandle(task_id.to_string()))
    }

    async fn cancel(&self, handle: &TimerHandle) -> Result<(), Error> {
        self.cancelled
            .lock()
            .expect("stub scheduler poisoned")
            .push(handle.0.clone());
        Ok(())
    }
}

/// Spawns the loop draining a scheduler's fire channel and invoking `on_fire`
/// for each. Mirrors `tanda-locks::spawn_expiry_sweeper`'s background-task
/// shape.
pub fn spawn_timer_dispatcher<F, Fut>(
    mut fire_rx: mpsc::Receiver<TimerFire>,
    on_fire: F,
) -> JoinHandle<()>
where
    F: Fn(TimerFire) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let on_fire = Arc::new(on_fire);
    tokio::spawn(async move {
        while let Some(fire) = fire_rx.recv().await {
            let on_fire = on_fire.clone();
            tokio::spawn(async move { on_fire(fire).await });
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stub_scheduler_records_arm_and_cancel() {
        let sched = StubScheduler::new();
        let handle = sched
            .arm("task-1", Utc::now(), serde_json::json!({"group_id": "g1"}))
            .await
            .unwrap();
        assert_eq!(handle.0, "task-1");
        sched.cancel(&handle).await.unwrap();
        assert_eq!(sched.armed.lock().unwrap().len(), 1);
        assert_eq!(sched.cancelled.lock().unwrap(), vec!["task-1".to_string()]);
    }

    #[tokio::test]
    async fn in_process_scheduler_delivers_fire_after_delay() {
        let (tx, mut rx) = mpsc::channel(8);
        let sched = InProcessScheduler::new(tx);
        let fire_at = Utc::now() + chrono::Duration::milliseconds(5);
        sched
            .arm("task-2", fire_at, serde_json::json!({"transaction_id": "t1"}))
            .await
            .unwrap();
        let fire = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
            .await
            .expect("fire should arrive")
            .expect("channel open");
        assert_eq!(fire.task_id, "task-2");
    }

    #[tokio::test]
    async fn cancel_after_fire_is_a_no_op() {
        let (tx, _rx) = mpsc::channel(8);
        let sched = InProcessScheduler::new(tx);
        let handle = sched
            .arm("task-3", Utc::now() - chrono::Duration::seconds(1), serde_json::json!({}))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        // The timer already fired; cancelling must not error.
        sched.cancel(&handle).await.unwrap();
    }
}
