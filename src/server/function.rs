use crate::server::job::Job;
use crate::server::queue::JobQueue;
use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// A named unit of work: the set of worker connections that declared
/// capability for it plus the queue of pending jobs submitted against it.
///
/// Created lazily on first reference and collected from the registry once no
/// worker can perform it and no job is queued for it.
#[derive(Debug)]
pub struct Function {
    pub name: String,
    pub queue: JobQueue,
    workers: Mutex<HashSet<Uuid>>,
}

impl Function {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            queue: JobQueue::new(),
            workers: Mutex::new(HashSet::new()),
        }
    }

    pub fn register_worker(&self, conn_id: Uuid) {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.insert(conn_id);
    }

    pub fn unregister_worker(&self, conn_id: Uuid) -> bool {
        let mut workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.remove(&conn_id)
    }

    pub fn worker_ids(&self) -> Vec<Uuid> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.iter().copied().collect()
    }

    pub fn worker_count(&self) -> usize {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        workers.len()
    }

    /// Liveness predicate: a function with no capable worker and an empty
    /// queue holds nothing anyone can reach and may be collected.
    pub fn is_idle(&self) -> bool {
        self.worker_count() == 0 && self.queue.is_empty()
    }
}

/// Lazily-populated index of [`Function`]s by name.
///
/// Backed by a sharded map, so two connections referencing the same name
/// race on a per-shard lock rather than a global one and always observe a
/// single `Function` instance per name. Callers must tolerate a function
/// being collected between a `get` and its use; re-fetching with
/// `get_or_create` is always safe.
#[derive(Debug, Default)]
pub struct FunctionRegistry {
    functions: DashMap<String, Arc<Function>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the live function for `name`, creating it atomically if absent.
    pub fn get_or_create(&self, name: &str) -> Arc<Function> {
        self.functions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Function::new(name)))
            .clone()
    }

    /// Enqueue a job for `name`, creating the function if absent. The push
    /// happens while the entry's shard lock is held, the same lock
    /// `collect_if_idle` evaluates its predicate under, so the function
    /// cannot be collected between creation and the push.
    pub fn enqueue(&self, name: &str, job: Arc<Job>) -> Arc<Function> {
        let entry = self
            .functions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Function::new(name)));
        entry.queue.push(job);
        entry.clone()
    }

    /// Like [`enqueue`](Self::enqueue) but pushes to the front of the job's
    /// priority bucket; used when returning an interrupted job to its queue.
    pub fn requeue(&self, name: &str, job: Arc<Job>) -> Arc<Function> {
        let entry = self
            .functions
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Function::new(name)));
        entry.queue.push_front(job);
        entry.clone()
    }

    /// Lookup without creating; `None` for names nobody references.
    pub fn get(&self, name: &str) -> Option<Arc<Function>> {
        self.functions.get(name).map(|f| f.clone())
    }

    /// Collect the function if it is idle. The predicate runs under the
    /// shard lock, so a concurrent `get_or_create` either sees the function
    /// alive or recreates it afterwards; it never observes a half-removed
    /// entry.
    pub fn collect_if_idle(&self, name: &str) -> bool {
        self.functions
            .remove_if(name, |_, function| function.is_idle())
            .is_some()
    }

    /// Snapshot of every live function, for admin introspection.
    pub fn snapshot(&self) -> Vec<Arc<Function>> {
        let mut functions: Vec<Arc<Function>> =
            self.functions.iter().map(|f| f.clone()).collect();
        functions.sort_by(|a, b| a.name.cmp(&b.name));
        functions
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }

    /// Remove every function, returning them so shutdown can release the
    /// jobs still queued inside.
    pub fn drain(&self) -> Vec<Arc<Function>> {
        let names: Vec<String> = self.functions.iter().map(|f| f.name.clone()).collect();
        let mut drained = Vec::new();
        for name in names {
            if let Some((_, function)) = self.functions.remove(&name) {
                drained.push(function);
            }
        }
        drained
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::job::{Job, JobPriority};

    fn queued_job(function: &str) -> Arc<Job> {
        Arc::new(Job::new(
            "H:test:1".to_string(),
            function.to_string(),
            String::new(),
            Vec::new(),
            JobPriority::Normal,
            false,
        ))
    }

    #[test]
    fn test_get_or_create_returns_same_instance() {
        let registry = FunctionRegistry::new();
        let a = registry.get_or_create("reverse");
        let b = registry.get_or_create("reverse");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_idle_function_is_collected() {
        let registry = FunctionRegistry::new();
        registry.get_or_create("reverse");
        assert!(registry.collect_if_idle("reverse"));
        assert!(registry.get("reverse").is_none());
    }

    #[test]
    fn test_function_with_worker_survives_collection() {
        let registry = FunctionRegistry::new();
        let function = registry.get_or_create("reverse");
        let worker = Uuid::new_v4();
        function.register_worker(worker);

        assert!(!registry.collect_if_idle("reverse"));

        function.unregister_worker(worker);
        assert!(registry.collect_if_idle("reverse"));
    }

    #[test]
    fn test_function_with_queued_job_survives_collection() {
        let registry = FunctionRegistry::new();
        let function = registry.get_or_create("reverse");
        function.queue.push(queued_job("reverse"));

        assert!(!registry.collect_if_idle("reverse"));

        function.queue.poll();
        assert!(registry.collect_if_idle("reverse"));
    }

    #[test]
    fn test_enqueue_races_with_collection_without_losing_jobs() {
        use std::sync::atomic::{AtomicBool, Ordering};

        let registry = Arc::new(FunctionRegistry::new());
        let stop = Arc::new(AtomicBool::new(false));

        let collectors: Vec<_> = (0..2)
            .map(|_| {
                let registry = Arc::clone(&registry);
                let stop = Arc::clone(&stop);
                std::thread::spawn(move || {
                    while !stop.load(Ordering::Relaxed) {
                        registry.collect_if_idle("reverse");
                    }
                })
            })
            .collect();

        for i in 0..20_000 {
            let job = Arc::new(Job::new(
                format!("H:test:{i}"),
                "reverse".to_string(),
                String::new(),
                Vec::new(),
                JobPriority::Normal,
                false,
            ));
            registry.enqueue("reverse", Arc::clone(&job));
            // The push happened under the shard lock, so the function must
            // still be live and must hold the job.
            let live = registry
                .get("reverse")
                .expect("function collected while a job was queued");
            assert!(live.queue.contains(&job), "queued job lost: {}", job.handle);
            live.queue.poll();
        }

        stop.store(true, Ordering::Relaxed);
        for collector in collectors {
            collector.join().unwrap();
        }
    }

    #[test]
    fn test_collected_function_reappears_cleanly() {
        let registry = FunctionRegistry::new();
        let first = registry.get_or_create("reverse");
        registry.collect_if_idle("reverse");

        let second = registry.get_or_create("reverse");
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.worker_count(), 0);
        assert!(second.queue.is_empty());
    }
}
