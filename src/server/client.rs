use crate::protocol::packet::Packet;
use crate::server::job::{Job, JobListener};
use crate::server::PacketSender;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Mutable state for one binary-mode connection.
///
/// The same connection may act as a submitter, a worker, or both; Gearman
/// does not distinguish roles at connect time. Worker-side fields (declared
/// abilities, sleep flag, in-flight jobs) stay empty for pure submitters.
#[derive(Debug)]
pub struct ClientConn {
    pub id: Uuid,
    pub addr: SocketAddr,
    sender: PacketSender,
    /// Free-form label from SET_CLIENT_ID; informational only.
    client_id: Mutex<String>,
    /// Function names in registration order; GRAB_JOB scans them in order.
    abilities: Mutex<Vec<String>>,
    sleeping: AtomicBool,
    /// Jobs this worker is executing, keyed by handle.
    running: Mutex<HashMap<String, Arc<Job>>>,
}

impl ClientConn {
    pub fn new(addr: SocketAddr, sender: PacketSender) -> Self {
        Self {
            id: Uuid::new_v4(),
            addr,
            sender,
            client_id: Mutex::new(String::from("-")),
            abilities: Mutex::new(Vec::new()),
            sleeping: AtomicBool::new(false),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Queue a packet on the connection's outbound channel. Returns `false`
    /// if the writer side already hung up.
    pub fn send(&self, packet: Packet) -> bool {
        self.sender.send(packet).is_ok()
    }

    /// Listener identity handed to jobs this connection submits.
    pub fn listener(&self) -> JobListener {
        JobListener {
            conn_id: self.id,
            sender: self.sender.clone(),
        }
    }

    pub fn set_client_id(&self, label: &str) {
        let mut client_id = self.client_id.lock().unwrap_or_else(|e| e.into_inner());
        *client_id = label.to_string();
    }

    pub fn client_id(&self) -> String {
        self.client_id
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Declare capability for a function. Returns `false` when it was
    /// already declared (registration order is preserved either way).
    pub fn add_ability(&self, function: &str) -> bool {
        let mut abilities = self.abilities.lock().unwrap_or_else(|e| e.into_inner());
        if abilities.iter().any(|a| a == function) {
            return false;
        }
        abilities.push(function.to_string());
        true
    }

    pub fn remove_ability(&self, function: &str) -> bool {
        let mut abilities = self.abilities.lock().unwrap_or_else(|e| e.into_inner());
        let before = abilities.len();
        abilities.retain(|a| a != function);
        abilities.len() != before
    }

    pub fn abilities(&self) -> Vec<String> {
        self.abilities
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn take_abilities(&self) -> Vec<String> {
        let mut abilities = self.abilities.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::take(&mut *abilities)
    }

    pub fn set_sleeping(&self, sleeping: bool) {
        self.sleeping.store(sleeping, Ordering::SeqCst);
    }

    pub fn is_sleeping(&self) -> bool {
        self.sleeping.load(Ordering::SeqCst)
    }

    /// Atomically claim this worker for a wake-up. Only one waker wins while
    /// the worker stays asleep; it goes back to sleep via a later PRE_SLEEP.
    pub fn try_wake(&self) -> bool {
        self.sleeping
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn start_job(&self, job: Arc<Job>) {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.insert(job.handle.clone(), job);
    }

    /// Look up an in-flight job by handle; `None` means this connection does
    /// not own it.
    pub fn running_job(&self, handle: &str) -> Option<Arc<Job>> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.get(handle).cloned()
    }

    pub fn finish_job(&self, handle: &str) -> Option<Arc<Job>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.remove(handle)
    }

    pub fn running_handles(&self) -> Vec<String> {
        let running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.keys().cloned().collect()
    }

    /// Remove and return every in-flight job; used on disconnect.
    pub fn take_running(&self) -> Vec<Arc<Job>> {
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        running.drain().map(|(_, job)| job).collect()
    }

    pub fn running_count(&self) -> usize {
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}
