use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::{DownloadTask, TaskId};

/// FIFO of tasks waiting for a worker of one receiver unit.
#[derive(Debug, Default)]
pub struct UnitQueue {
    pending: Mutex<VecDeque<DownloadTask>>,
    notify: Notify,
}

impl UnitQueue {
    /// Create a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task at the back and wake one idle worker.
    pub fn push(&self, task: DownloadTask) {
        self.pending.lock().push_back(task);
        self.notify.notify_one();
    }

    /// Take a task out of the queue before any worker picks it up.
    pub fn remove(&self, id: TaskId) -> Option<DownloadTask> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|t| t.id == id)?;
        pending.remove(index)
    }

    /// Wait for the next task. Returns `None` once `shutdown` fires.
    pub async fn pop(&self, shutdown: &CancellationToken) -> Option<DownloadTask> {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.pending.lock().pop_front() {
                return Some(task);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of the waiting tasks, front first.
    pub fn ids(&self) -> Vec<TaskId> {
        self.pending.lock().iter().map(|t| t.id).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ErrorMode, Recording, SourceLocator};
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn task(id: TaskId) -> DownloadTask {
        let rec = Recording::new(id.to_string(), "t", SourceLocator::Local { path: "/x".into() });
        DownloadTask::new(id, rec, "/tmp".into(), 1, ErrorMode::None, false, Utc::now())
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = UnitQueue::new();
        let shutdown = CancellationToken::new();
        for id in 1..=3 {
            queue.push(task(id));
        }
        assert_eq!(queue.ids(), vec![1, 2, 3]);
        assert_eq!(queue.pop(&shutdown).await.map(|t| t.id), Some(1));
        assert_eq!(queue.pop(&shutdown).await.map(|t| t.id), Some(2));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn removed_task_is_never_popped() {
        let queue = UnitQueue::new();
        queue.push(task(1));
        queue.push(task(2));
        assert_eq!(queue.remove(1).map(|t| t.id), Some(1));
        assert!(queue.remove(1).is_none());
        assert_eq!(queue.pop(&CancellationToken::new()).await.map(|t| t.id), Some(2));
    }

    #[tokio::test]
    async fn waiting_worker_wakes_on_push_and_on_shutdown() {
        let queue = Arc::new(UnitQueue::new());
        let shutdown = CancellationToken::new();

        let waiter = {
            let (queue, shutdown) = (queue.clone(), shutdown.clone());
            tokio::spawn(async move { queue.pop(&shutdown).await.map(|t| t.id) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.push(task(7));
        assert_eq!(waiter.await.unwrap(), Some(7));

        let idle = {
            let (queue, shutdown) = (queue.clone(), shutdown.clone());
            tokio::spawn(async move { queue.pop(&shutdown).await })
        };
        shutdown.cancel();
        assert!(idle.await.unwrap().is_none());
    }
}
