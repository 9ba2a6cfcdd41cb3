//! Admission bookkeeping: a FIFO of waiting jobs and a count of slots in use.

use std::collections::VecDeque;

use crate::core::model::JobId;
use crate::errors::{CallError, CallResult};

#[derive(Debug)]
pub struct AdmissionQueue {
    waiting: VecDeque<JobId>,
    in_flight: usize,
    limit: usize,
    max_queued: Option<usize>,
}

impl AdmissionQueue {
    pub fn new(limit: usize, max_queued: Option<usize>) -> Self {
        Self {
            waiting: VecDeque::new(),
            in_flight: 0,
            limit: limit.max(1),
            max_queued,
        }
    }

    pub fn has_room(&self) -> bool {
        self.max_queued.is_none_or(|bound| self.waiting.len() < bound)
    }

    /// Append to the back of the queue, refusing when the hard bound is hit.
    pub fn enqueue(&mut self, job_id: JobId) -> CallResult<()> {
        if let Some(bound) = self.max_queued {
            if self.waiting.len() >= bound {
                return Err(CallError::CapacityExceeded {
                    queued: self.waiting.len(),
                    bound,
                });
            }
        }
        self.waiting.push_back(job_id);
        Ok(())
    }

    /// Append regardless of the bound. Used for retries of work that was
    /// already accepted once.
    pub fn enqueue_unbounded(&mut self, job_id: JobId) {
        self.waiting.push_back(job_id);
    }

    /// Pop the head of the queue if a slot is free, taking the slot.
    pub fn admit_next(&mut self) -> Option<JobId> {
        if self.in_flight >= self.limit {
            return None;
        }
        let job_id = self.waiting.pop_front()?;
        self.in_flight += 1;
        Some(job_id)
    }

    pub fn release(&mut self) {
        debug_assert!(self.in_flight > 0, "slot released twice");
        self.in_flight = self.in_flight.saturating_sub(1);
    }

    pub fn remove(&mut self, job_id: JobId) -> bool {
        match self.waiting.iter().position(|id| *id == job_id) {
            Some(position) => {
                self.waiting.remove(position);
                true
            }
            None => false,
        }
    }

    pub fn queued(&self) -> usize {
        self.waiting.len()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_in_fifo_order_up_to_limit() {
        let mut queue = AdmissionQueue::new(2, None);
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            queue.enqueue(*id).unwrap();
        }

        assert_eq!(queue.admit_next(), Some(ids[0]));
        assert_eq!(queue.admit_next(), Some(ids[1]));
        assert_eq!(queue.admit_next(), None);
        assert_eq!(queue.in_flight(), 2);

        queue.release();
        assert_eq!(queue.admit_next(), Some(ids[2]));
        assert_eq!(queue.queued(), 0);
    }

    #[test]
    fn test_hard_bound() {
        let mut queue = AdmissionQueue::new(1, Some(1));
        queue.enqueue(JobId::new()).unwrap();
        assert!(!queue.has_room());

        let err = queue.enqueue(JobId::new()).unwrap_err();
        assert!(matches!(err, CallError::CapacityExceeded { queued: 1, bound: 1 }));

        queue.enqueue_unbounded(JobId::new());
        assert_eq!(queue.queued(), 2);
    }

    #[test]
    fn test_remove_from_middle() {
        let mut queue = AdmissionQueue::new(1, None);
        let ids: Vec<JobId> = (0..3).map(|_| JobId::new()).collect();
        for id in &ids {
            queue.enqueue(*id).unwrap();
        }

        assert!(queue.remove(ids[1]));
        assert!(!queue.remove(ids[1]));
        assert_eq!(queue.admit_next(), Some(ids[0]));
        queue.release();
        assert_eq!(queue.admit_next(), Some(ids[2]));
    }

    #[test]
    fn test_zero_limit_is_clamped() {
        let queue = AdmissionQueue::new(0, None);
        assert_eq!(queue.limit(), 1);
    }
}
