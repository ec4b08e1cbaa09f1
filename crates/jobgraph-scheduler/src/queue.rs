//! Ready queue for job instances waiting on a worker slot.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};

/// An instance waiting for a worker slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedInstance {
    /// Index of the instance in the run plan.
    pub index: usize,
    pub job: String,
    pub queued_at: DateTime<Utc>,
}

impl QueuedInstance {
    pub fn new(index: usize, job: impl Into<String>) -> Self {
        Self {
            index,
            job: job.into(),
            queued_at: Utc::now(),
        }
    }
}

/// FIFO queue bounded by a global worker limit and optional per-job limits.
///
/// `dequeue` hands out the oldest entry whose job is under its own limit, so an
/// instance held back by `max_parallel` never blocks other jobs queued behind it.
pub struct QueueManager {
    queue: VecDeque<QueuedInstance>,
    max_workers: usize,
    running: usize,
    job_limits: HashMap<String, usize>,
    job_running: HashMap<String, usize>,
}

impl QueueManager {
    pub fn new(max_workers: usize) -> Self {
        Self {
            queue: VecDeque::new(),
            max_workers: max_workers.max(1),
            running: 0,
            job_limits: HashMap::new(),
            job_running: HashMap::new(),
        }
    }

    /// Cap concurrently running instances of one job.
    pub fn set_job_limit(&mut self, job: impl Into<String>, limit: usize) {
        self.job_limits.insert(job.into(), limit.max(1));
    }

    pub fn enqueue(&mut self, entry: QueuedInstance) {
        self.queue.push_back(entry);
    }

    /// Take the next instance that may start, marking it running.
    pub fn dequeue(&mut self) -> Option<QueuedInstance> {
        self.dequeue_if(|_| true)
    }

    /// Like [`dequeue`](Self::dequeue), but only entries accepted by `admit`
    /// are considered.
    pub fn dequeue_if(&mut self, mut admit: impl FnMut(&QueuedInstance) -> bool) -> Option<QueuedInstance> {
        if self.running >= self.max_workers {
            return None;
        }
        let position = self
            .queue
            .iter()
            .position(|entry| self.can_execute(&entry.job) && admit(entry))?;
        let entry = self.queue.remove(position)?;
        self.running += 1;
        *self.job_running.entry(entry.job.clone()).or_insert(0) += 1;
        Some(entry)
    }

    /// Release the slot held by a finished instance of `job`.
    pub fn complete(&mut self, job: &str) {
        self.running = self.running.saturating_sub(1);
        if let Some(count) = self.job_running.get_mut(job) {
            *count = count.saturating_sub(1);
        }
    }

    /// Drop queued entries matching `predicate`, returning them.
    pub fn remove_where(&mut self, mut predicate: impl FnMut(&QueuedInstance) -> bool) -> Vec<QueuedInstance> {
        let mut removed = Vec::new();
        self.queue.retain(|entry| {
            if predicate(entry) {
                removed.push(entry.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Whether an entry accepted by `admit` could start now.
    pub fn has_startable(&self, mut admit: impl FnMut(&QueuedInstance) -> bool) -> bool {
        self.running < self.max_workers
            && self
                .queue
                .iter()
                .any(|entry| self.can_execute(&entry.job) && admit(entry))
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn running(&self) -> usize {
        self.running
    }

    /// Position of a plan index in the queue.
    pub fn position(&self, index: usize) -> Option<usize> {
        self.queue.iter().position(|entry| entry.index == index)
    }

    fn can_execute(&self, job: &str) -> bool {
        match self.job_limits.get(job) {
            Some(&limit) => self.job_running.get(job).copied().unwrap_or(0) < limit,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut queue = QueueManager::new(4);
        queue.enqueue(QueuedInstance::new(0, "a"));
        queue.enqueue(QueuedInstance::new(1, "b"));
        queue.enqueue(QueuedInstance::new(2, "c"));

        assert_eq!(queue.dequeue().unwrap().index, 0);
        assert_eq!(queue.dequeue().unwrap().index, 1);
        assert_eq!(queue.position(2), Some(0));
    }

    #[test]
    fn test_worker_limit() {
        let mut queue = QueueManager::new(1);
        queue.enqueue(QueuedInstance::new(0, "deploy-1"));
        queue.enqueue(QueuedInstance::new(1, "deploy-2"));

        let first = queue.dequeue().unwrap();
        assert_eq!(first.job, "deploy-1");

        // Second is blocked until a slot frees up
        assert!(queue.dequeue().is_none());

        queue.complete(&first.job);

        let second = queue.dequeue().unwrap();
        assert_eq!(second.job, "deploy-2");
    }

    #[test]
    fn test_job_limit_does_not_block_other_jobs() {
        let mut queue = QueueManager::new(4);
        queue.set_job_limit("test", 1);
        queue.enqueue(QueuedInstance::new(0, "test"));
        queue.enqueue(QueuedInstance::new(1, "test"));
        queue.enqueue(QueuedInstance::new(2, "lint"));

        assert_eq!(queue.dequeue().unwrap().index, 0);
        // index 1 is held back by the job limit, lint goes ahead of it
        assert_eq!(queue.dequeue().unwrap().index, 2);
        assert!(queue.dequeue().is_none());

        queue.complete("test");
        assert_eq!(queue.dequeue().unwrap().index, 1);
        assert_eq!(queue.running(), 2);
    }

    #[test]
    fn test_dequeue_if_skips_rejected_entries() {
        let mut queue = QueueManager::new(2);
        queue.enqueue(QueuedInstance::new(0, "unit"));
        queue.enqueue(QueuedInstance::new(1, "release"));

        assert!(queue.has_startable(|entry| entry.job == "release"));
        assert_eq!(queue.dequeue_if(|entry| entry.job == "release").unwrap().index, 1);
        assert!(!queue.has_startable(|entry| entry.job == "release"));
        assert!(queue.dequeue_if(|entry| entry.job == "release").is_none());

        assert_eq!(queue.dequeue().unwrap().index, 0);
        assert!(!queue.has_startable(|_| true));
    }

    #[test]
    fn test_remove_where() {
        let mut queue = QueueManager::new(2);
        queue.enqueue(QueuedInstance::new(0, "test"));
        queue.enqueue(QueuedInstance::new(1, "lint"));
        queue.enqueue(QueuedInstance::new(2, "test"));

        let removed = queue.remove_where(|entry| entry.job == "test");
        assert_eq!(removed.len(), 2);
        assert_eq!(queue.len(), 1);
    }
}
