use std::collections::VecDeque;

use uuid::Uuid;

use crate::Job;

/// Pending jobs in dispatch order. Dispatched jobs are no longer in here, so
/// nothing done to the queue can recall them.
#[derive(Debug, Default)]
pub struct JobQueue {
    jobs: VecDeque<Job>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends to the tail, keeping the given order.
    pub fn enqueue(&mut self, jobs: impl IntoIterator<Item = Job>) -> usize {
        let before = self.jobs.len();
        self.jobs.extend(jobs);
        self.jobs.len() - before
    }

    pub fn pop(&mut self) -> Option<Job> {
        self.jobs.pop_front()
    }

    pub fn remove_by_id(&mut self, id: Uuid) -> bool {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.id != id);
        self.jobs.len() != before
    }

    pub fn clear(&mut self) -> usize {
        let dropped = self.jobs.len();
        self.jobs.clear();
        dropped
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Settings;
    use bytes::Bytes;

    fn job(id: Uuid) -> Job {
        Job {
            id,
            source: Bytes::from_static(b"src"),
            mime: "image/png".into(),
            settings: Settings::default(),
            generation: 1,
        }
    }

    #[test]
    fn fifo_order() {
        let ids: Vec<Uuid> = (0..3).map(|_| Uuid::new_v4()).collect();
        let mut queue = JobQueue::new();
        assert_eq!(queue.enqueue(ids[..2].iter().copied().map(job)), 2);
        queue.enqueue([job(ids[2])]);

        let popped: Vec<Uuid> = std::iter::from_fn(|| queue.pop()).map(|j| j.id).collect();
        assert_eq!(popped, ids);
        assert!(queue.is_empty());
    }

    #[test]
    fn remove_and_clear() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let mut queue = JobQueue::new();
        queue.enqueue([job(a), job(b), job(c)]);

        assert!(queue.remove_by_id(b));
        assert!(!queue.remove_by_id(b));
        assert_eq!(queue.pop().map(|j| j.id), Some(a));

        assert_eq!(queue.clear(), 1);
        assert!(queue.pop().is_none());
    }
}
