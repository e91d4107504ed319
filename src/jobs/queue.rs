use std::collections::VecDeque;

use super::model::{Job, JobStatus};

/// Pending jobs ordered by ascending priority, FIFO among equal priorities.
///
/// Lives inside one scheduler; not shared across processes.
#[derive(Debug, Default)]
pub struct JobQueue {
    pending: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut job: Job) {
        job.set_status(JobStatus::Pending);
        // Insert after every job of equal or higher precedence to keep ties FIFO.
        let index = self
            .pending
            .partition_point(|queued| queued.priority <= job.priority);
        self.pending.insert(index, job);
    }

    /// Remove and return up to `n` jobs, highest precedence first.
    pub fn pop_available(&mut self, n: usize) -> Vec<Job> {
        let take = n.min(self.pending.len());
        self.pending.drain(..take).collect()
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobPayload;

    fn job(label: &str, priority: u32) -> Job {
        Job::new(label, JobPayload::QualityCheck).with_priority(priority)
    }

    #[test]
    fn pops_in_priority_order() {
        let mut queue = JobQueue::new();
        queue.push(job("three", 3));
        queue.push(job("one", 1));
        queue.push(job("two", 2));

        let popped: Vec<u32> = queue.pop_available(3).iter().map(|j| j.priority).collect();
        assert_eq!(popped, vec![1, 2, 3]);
        assert!(queue.is_empty());
    }

    #[test]
    fn equal_priorities_keep_insertion_order() {
        let mut queue = JobQueue::new();
        queue.push(job("a", 2));
        queue.push(job("b", 1));
        queue.push(job("c", 2));
        queue.push(job("d", 2));

        let order: Vec<String> = queue
            .pop_available(10)
            .into_iter()
            .map(|j| j.session_id)
            .collect();
        assert_eq!(order, vec!["b", "a", "c", "d"]);
    }

    #[test]
    fn pop_available_respects_limit() {
        let mut queue = JobQueue::new();
        for p in [5, 4, 3, 2, 1] {
            queue.push(job("x", p));
        }

        let first: Vec<u32> = queue.pop_available(2).iter().map(|j| j.priority).collect();
        assert_eq!(first, vec![1, 2]);
        assert_eq!(queue.len(), 3);
        assert!(queue.pop_available(0).is_empty());
    }
}
