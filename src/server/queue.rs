use crate::server::job::{Job, JobPriority};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

/// Pending jobs for one function: three FIFO buckets drained in strict
/// HIGH, NORMAL, LOW order.
///
/// Every operation takes the single internal lock, so enqueue and poll are
/// individually atomic; a job can never be lost or handed out twice by
/// concurrent pollers. Multi-step sequences (submit-or-coalesce, grabbing
/// across functions) are serialized one level up, in the job table and
/// dispatcher.
#[derive(Debug, Default)]
pub struct JobQueue {
    buckets: Mutex<[VecDeque<Arc<Job>>; JobPriority::LEVELS]>,
}

impl JobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append to the tail of the job's priority bucket.
    pub fn push(&self, job: Arc<Job>) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets[job.priority.bucket()].push_back(job);
    }

    /// Prepend to the head of the job's priority bucket; used when a job is
    /// returned after its worker disconnected so it does not lose its turn.
    pub fn push_front(&self, job: Arc<Job>) {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets[job.priority.bucket()].push_front(job);
    }

    /// Remove and return the head job across buckets, highest priority first.
    pub fn poll(&self) -> Option<Arc<Job>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.iter_mut().find_map(|bucket| bucket.pop_front())
    }

    /// Remove a specific job by handle identity. Returns whether it was
    /// present.
    pub fn remove(&self, job: &Job) -> bool {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = &mut buckets[job.priority.bucket()];
        let before = bucket.len();
        bucket.retain(|queued| queued.handle != job.handle);
        bucket.len() != before
    }

    pub fn contains(&self, job: &Job) -> bool {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets[job.priority.bucket()]
            .iter()
            .any(|queued| queued.handle == job.handle)
    }

    pub fn len(&self) -> usize {
        let buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        buckets.iter().map(|b| b.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Empty every bucket, returning the jobs in delivery order. Used on
    /// shutdown release.
    pub fn drain(&self) -> Vec<Arc<Job>> {
        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let mut drained = Vec::new();
        for bucket in buckets.iter_mut() {
            drained.extend(bucket.drain(..));
        }
        drained
    }
}
