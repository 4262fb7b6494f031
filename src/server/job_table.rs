use crate::server::function::FunctionRegistry;
use crate::server::job::{Job, JobListener, JobPriority};
use dashmap::DashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Number of striped locks guarding the lookup-or-create section of
/// [`JobTable::submit`]. Two submissions only contend when their coalescing
/// keys land on the same stripe.
const UNIQUE_LOCK_STRIPES: usize = 64;

/// Result of a submission: the job now representing it and whether it was
/// merged onto an already-live job instead of creating one.
#[derive(Debug)]
pub struct SubmitOutcome {
    pub job: Arc<Job>,
    pub coalesced: bool,
}

/// Global job index and coalescing engine.
///
/// Indexes every live job by server-assigned handle and, when the submitter
/// supplied a unique-id, by `(function, unique-id)`. At most one live job
/// exists per coalescing key; concurrent submissions sharing a key merge
/// deterministically onto one job under a per-key striped lock.
#[derive(Debug)]
pub struct JobTable {
    by_handle: DashMap<String, Arc<Job>>,
    by_unique: DashMap<String, Arc<Job>>,
    unique_locks: Vec<Mutex<()>>,
    handle_seq: AtomicU64,
    handle_prefix: String,
}

impl JobTable {
    pub fn new(handle_prefix: &str) -> Self {
        Self {
            by_handle: DashMap::new(),
            by_unique: DashMap::new(),
            unique_locks: (0..UNIQUE_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            handle_seq: AtomicU64::new(0),
            handle_prefix: handle_prefix.to_string(),
        }
    }

    fn next_handle(&self) -> String {
        let seq = self.handle_seq.fetch_add(1, Ordering::Relaxed) + 1;
        format!("H:{}:{}", self.handle_prefix, seq)
    }

    fn unique_key(function: &str, unique_id: &str) -> String {
        format!("{function}\0{unique_id}")
    }

    fn stripe(&self, key: &str) -> &Mutex<()> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.unique_locks[hasher.finish() as usize % UNIQUE_LOCK_STRIPES]
    }

    /// Submit a job: coalesce onto a live job with the same function and
    /// unique-id if one exists, otherwise create, index, and enqueue a fresh
    /// one. `listener` is attached either way (absent for background jobs).
    #[allow(clippy::too_many_arguments)]
    pub async fn submit(
        &self,
        registry: &FunctionRegistry,
        function: &str,
        unique_id: &str,
        payload: Vec<u8>,
        priority: JobPriority,
        background: bool,
        listener: Option<JobListener>,
    ) -> SubmitOutcome {
        if unique_id.is_empty() {
            let job = self.create_and_enqueue(
                registry, function, unique_id, payload, priority, background, listener,
            );
            return SubmitOutcome {
                job,
                coalesced: false,
            };
        }

        let key = Self::unique_key(function, unique_id);
        // The stripe lock spans lookup through create so two submissions
        // with the same key cannot both miss and create two jobs.
        let _guard = self.stripe(&key).lock().await;

        if let Some(existing) = self.by_unique.get(&key).map(|j| j.clone()) {
            let attached = match listener.clone() {
                Some(listener) => existing.attach_listener(listener),
                None => !existing.is_terminal(),
            };
            if attached {
                return SubmitOutcome {
                    job: existing,
                    coalesced: true,
                };
            }
            // The job finished between index lookup and attach; fall through
            // and build its successor.
        }

        let job = self.create_and_enqueue(
            registry, function, unique_id, payload, priority, background, listener,
        );
        SubmitOutcome {
            job,
            coalesced: false,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn create_and_enqueue(
        &self,
        registry: &FunctionRegistry,
        function: &str,
        unique_id: &str,
        payload: Vec<u8>,
        priority: JobPriority,
        background: bool,
        listener: Option<JobListener>,
    ) -> Arc<Job> {
        let job = Arc::new(Job::new(
            self.next_handle(),
            function.to_string(),
            unique_id.to_string(),
            payload,
            priority,
            background,
        ));
        if let Some(listener) = listener {
            job.attach_listener(listener);
        }

        // Index before enqueue: a worker that polls the job must already be
        // able to find it by handle.
        self.by_handle.insert(job.handle.clone(), Arc::clone(&job));
        if !unique_id.is_empty() {
            self.by_unique
                .insert(Self::unique_key(function, unique_id), Arc::clone(&job));
        }
        registry.enqueue(function, Arc::clone(&job));
        job
    }

    pub fn lookup_by_handle(&self, handle: &str) -> Option<Arc<Job>> {
        self.by_handle.get(handle).map(|j| j.clone())
    }

    pub fn lookup_by_unique(&self, function: &str, unique_id: &str) -> Option<Arc<Job>> {
        self.by_unique
            .get(&Self::unique_key(function, unique_id))
            .map(|j| j.clone())
    }

    /// Drop a terminated job from both indexes. The unique index entry is
    /// only removed if it still points at this job; a successor submitted
    /// after the terminal transition must not be evicted.
    pub fn remove(&self, job: &Job) {
        self.by_handle.remove(&job.handle);
        if !job.unique_id.is_empty() {
            let key = Self::unique_key(&job.function, &job.unique_id);
            self.by_unique
                .remove_if(&key, |_, indexed| indexed.handle == job.handle);
        }
    }

    /// Remove every job without notifying listeners; used on forced server
    /// shutdown.
    pub fn release_all(&self) -> Vec<Arc<Job>> {
        let handles: Vec<String> = self.by_handle.iter().map(|j| j.handle.clone()).collect();
        let mut released = Vec::new();
        for handle in handles {
            if let Some((_, job)) = self.by_handle.remove(&handle) {
                released.push(job);
            }
        }
        self.by_unique.clear();
        released
    }

    pub fn len(&self) -> usize {
        self.by_handle.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_handle.is_empty()
    }
}
