//! Keyed, priority-ordered job queue.
//!
//! Jobs dequeue by ascending priority, FIFO within a priority. The heap is
//! never rewritten on upsert or removal: a heap entry whose key no longer
//! matches its job's registered key is stale and is discarded lazily at
//! dequeue time. All operations run under a single mutex region, and
//! nothing suspends while it is held.

use chrono::{DateTime, Utc};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;

use crate::domain::config::SiteConfig;
use crate::domain::models::{Job, JobStatus};

/// Min-order heap key: (priority, created_at, job_id).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
struct HeapEntry {
    priority: i64,
    created_at: DateTime<Utc>,
    job_id: String,
}

/// A pending job plus the heap key it is currently registered under.
struct PendingSlot {
    job: Job,
    key: (i64, DateTime<Utc>),
}

#[derive(Default)]
struct QueueInner {
    heap: BinaryHeap<Reverse<HeapEntry>>,
    pending: HashMap<String, PendingSlot>,
    running: HashMap<String, Job>,
}

/// Thread-safe priority queue of scraping jobs.
#[derive(Default)]
pub struct PriorityJobQueue {
    inner: Mutex<QueueInner>,
}

impl PriorityJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().expect("queue mutex poisoned")
    }

    /// Add a job, upserting by `job_id`.
    ///
    /// A PENDING job with the same id is replaced in place: the heap entry
    /// is untouched, so the job keeps its original position. A RUNNING job
    /// has its snapshot updated only; the in-flight execution keeps the
    /// config it started with.
    pub fn enqueue(&self, job: Job) {
        let mut inner = self.lock();
        if inner.running.contains_key(&job.job_id) {
            log::info!("Updating RUNNING job: {}", job.job_id);
            inner.running.insert(job.job_id.clone(), job);
            return;
        }
        if let Some(slot) = inner.pending.get_mut(&job.job_id) {
            log::info!("Updating PENDING job: {}", job.job_id);
            // The heap entry stays valid under the slot's registered key.
            slot.job = job;
            return;
        }

        log::info!("Enqueuing new job: {} (priority={})", job.job_id, job.priority);
        let entry = HeapEntry {
            priority: job.priority,
            created_at: job.created_at,
            job_id: job.job_id.clone(),
        };
        inner.pending.insert(
            job.job_id.clone(),
            PendingSlot {
                key: (entry.priority, entry.created_at),
                job,
            },
        );
        inner.heap.push(Reverse(entry));
    }

    /// Pop the highest-priority PENDING job and transition it to RUNNING.
    /// Stale heap entries encountered along the way are dropped.
    pub fn dequeue(&self) -> Option<Job> {
        let mut inner = self.lock();
        while let Some(Reverse(entry)) = inner.heap.pop() {
            let matches = inner
                .pending
                .get(&entry.job_id)
                .is_some_and(|slot| slot.key == (entry.priority, entry.created_at));
            if !matches {
                continue;
            }
            let slot = inner
                .pending
                .remove(&entry.job_id)
                .expect("pending slot checked above");
            let running_job = slot.job.with_status(JobStatus::Running);
            inner
                .running
                .insert(running_job.job_id.clone(), running_job.clone());
            return Some(running_job);
        }
        None
    }

    /// Remove a PENDING job, or mark a RUNNING job as CANCELLED. The
    /// orchestrator checks the cancelled flag at phase boundaries;
    /// completion of an in-flight scrape is best-effort.
    pub fn remove(&self, job_id: &str) {
        let mut inner = self.lock();
        if inner.pending.remove(job_id).is_some() {
            log::info!("Removing PENDING job: {job_id}");
            // The heap entry is now stale and will be dropped at dequeue.
            return;
        }
        if let Some(job) = inner.running.get(job_id).cloned() {
            log::info!("Cancelling RUNNING job: {job_id}");
            inner
                .running
                .insert(job_id.to_string(), job.with_status(JobStatus::Cancelled));
        }
    }

    /// Replace the config on a PENDING job. A priority change pushes a new
    /// heap entry; the old one becomes stale. A RUNNING job only has its
    /// snapshot updated.
    pub fn update(&self, job_id: &str, new_config: SiteConfig) {
        let mut guard = self.lock();
        let inner = &mut *guard;
        if let Some(slot) = inner.pending.get_mut(job_id) {
            log::info!("Updating config for PENDING job: {job_id}");
            let old_priority = slot.job.priority;
            let new_job = slot.job.with_config(new_config);
            let new_priority = new_job.priority;
            let created_at = new_job.created_at;
            slot.job = new_job;
            if new_priority != old_priority {
                slot.key = (new_priority, created_at);
                inner.heap.push(Reverse(HeapEntry {
                    priority: new_priority,
                    created_at,
                    job_id: job_id.to_string(),
                }));
            }
            return;
        }
        if let Some(job) = inner.running.get(job_id).cloned() {
            log::info!("Updating config for RUNNING job: {job_id} (deferred)");
            inner
                .running
                .insert(job_id.to_string(), job.with_config(new_config));
        }
    }

    /// All jobs with their current status, pending first.
    pub fn list_jobs(&self) -> Vec<Job> {
        let inner = self.lock();
        let mut jobs: Vec<Job> = inner.pending.values().map(|slot| slot.job.clone()).collect();
        jobs.extend(inner.running.values().cloned());
        jobs
    }

    /// Count of PENDING jobs. The heap length is not usable here because
    /// of stale entries.
    pub fn size(&self) -> usize {
        self.lock().pending.len()
    }

    /// Whether a RUNNING job has been cancelled out from under the
    /// orchestrator.
    pub fn is_cancelled(&self, job_id: &str) -> bool {
        self.lock()
            .running
            .get(job_id)
            .is_some_and(|job| job.status == JobStatus::Cancelled)
    }

    /// Mark a RUNNING job finished and drop it from the running set.
    pub fn complete(&self, job_id: &str, success: bool) {
        let mut inner = self.lock();
        if inner.running.remove(job_id).is_some() {
            let status = if success {
                JobStatus::Completed
            } else {
                JobStatus::Failed
            };
            log::info!("Job {job_id} finished with status {status}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(site: &str, priority: i64) -> SiteConfig {
        SiteConfig::from_value(&json!({
            "version": "1.0",
            "site_name": site,
            "base_url": "http://example.com",
            "priority": priority,
            "selectors": {"container": "div", "fields": {"a": {"selector": "b", "kind": "css"}}}
        }))
        .unwrap()
    }

    fn job(site: &str, priority: i64) -> Job {
        Job::new(config(site, priority))
    }

    #[test]
    fn dequeues_by_priority_then_fifo() {
        let queue = PriorityJobQueue::new();
        // A(prio=5) first, B(prio=1) second, C(prio=5) third.
        queue.enqueue(job("a", 5));
        queue.enqueue(job("b", 1));
        queue.enqueue(job("c", 5));

        let order: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|j| j.job_id)
            .collect();
        assert_eq!(order, vec!["b", "a", "c"]);
    }

    #[test]
    fn dequeue_order_is_monotone_in_priority() {
        let queue = PriorityJobQueue::new();
        for (site, priority) in [("s1", 30), ("s2", 10), ("s3", 20), ("s4", 10), ("s5", 1)] {
            queue.enqueue(job(site, priority));
        }
        let mut last_priority = i64::MIN;
        while let Some(job) = queue.dequeue() {
            assert!(job.priority >= last_priority);
            assert_eq!(job.status, JobStatus::Running);
            last_priority = job.priority;
        }
    }

    #[test]
    fn enqueue_upsert_replaces_pending_in_place() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("a", 5));
        assert_eq!(queue.size(), 1);

        let mut replacement = config("a", 5);
        replacement.base_url = "http://example.com/v2".to_string();
        queue.enqueue(Job::new(replacement));
        assert_eq!(queue.size(), 1);

        let dequeued = queue.dequeue().unwrap();
        assert_eq!(dequeued.config.base_url, "http://example.com/v2");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn removed_pending_job_never_dequeues() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("a", 5));
        queue.enqueue(job("b", 6));
        queue.remove("a");
        assert_eq!(queue.size(), 1);

        let ids: Vec<String> = std::iter::from_fn(|| queue.dequeue())
            .map(|j| j.job_id)
            .collect();
        assert_eq!(ids, vec!["b"]);
    }

    #[test]
    fn update_with_new_priority_reorders() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("slow", 50));
        queue.enqueue(job("other", 10));
        // Raise "slow" above "other"; the old heap entry goes stale.
        queue.update("slow", config("slow", 1));
        assert_eq!(queue.size(), 2);

        let first = queue.dequeue().unwrap();
        assert_eq!(first.job_id, "slow");
        assert_eq!(first.priority, 1);
        let second = queue.dequeue().unwrap();
        assert_eq!(second.job_id, "other");
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn enqueue_while_running_updates_snapshot_without_requeue() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("a", 5));
        let running = queue.dequeue().unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(queue.size(), 0);

        queue.enqueue(job("a", 5));
        // Still nothing pending; the running snapshot absorbed the upsert.
        assert_eq!(queue.size(), 0);
        assert!(queue.dequeue().is_none());
        let listed = queue.list_jobs();
        assert_eq!(listed.len(), 1);
    }

    #[test]
    fn remove_while_running_marks_cancelled() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("a", 5));
        let running = queue.dequeue().unwrap();
        queue.remove(&running.job_id);
        assert!(queue.is_cancelled("a"));

        let listed = queue.list_jobs();
        assert_eq!(listed[0].status, JobStatus::Cancelled);
    }

    #[test]
    fn complete_drops_the_running_entry() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("a", 5));
        let running = queue.dequeue().unwrap();
        queue.complete(&running.job_id, true);
        assert!(queue.list_jobs().is_empty());
        assert!(!queue.is_cancelled("a"));
    }

    #[test]
    fn interleaved_operations_keep_ordering_invariant() {
        let queue = PriorityJobQueue::new();
        queue.enqueue(job("a", 20));
        queue.enqueue(job("b", 10));
        queue.enqueue(job("c", 30));
        queue.update("c", config("c", 5));
        queue.remove("b");
        queue.enqueue(job("d", 15));

        let order: Vec<(String, i64)> = std::iter::from_fn(|| queue.dequeue())
            .map(|j| (j.job_id, j.priority))
            .collect();
        assert_eq!(order, vec![("c".into(), 5), ("d".into(), 15), ("a".into(), 20)]);
    }
}
