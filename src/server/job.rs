use crate::protocol::packet::{Packet, PacketMagic, PacketType};
use crate::server::PacketSender;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use uuid::Uuid;

/// Job priority, ordered so that a plain comparison matches delivery order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum JobPriority {
    Low,
    Normal,
    High,
}

impl JobPriority {
    pub const LEVELS: usize = 3;

    /// Bucket index in delivery order: HIGH drains before NORMAL before LOW.
    pub fn bucket(self) -> usize {
        match self {
            JobPriority::High => 0,
            JobPriority::Normal => 1,
            JobPriority::Low => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    /// Sitting in its function's queue, waiting for a worker.
    Queued,
    /// Held by exactly one worker connection.
    Running,
}

/// Non-terminal event recorded on a job so late-joining coalesced submitters
/// can be caught up before they start receiving live relays.
#[derive(Debug, Clone)]
pub enum JobEvent {
    Data(Vec<u8>),
    Warning(Vec<u8>),
    Exception(Vec<u8>),
    Status(Vec<u8>, Vec<u8>),
}

/// One submitter awaiting events for a job. The sender is the submitter
/// connection's outbound channel, so notification never blocks.
#[derive(Debug, Clone)]
pub struct JobListener {
    pub conn_id: Uuid,
    pub sender: PacketSender,
}

#[derive(Debug, Default)]
struct ListenerState {
    listeners: Vec<JobListener>,
    events: Vec<JobEvent>,
    terminal: bool,
}

/// One unit of work. Owned by the [`crate::server::job_table::JobTable`];
/// shared as `Arc<Job>` with the queue holding it while pending and the
/// worker connection holding it while running.
#[derive(Debug)]
pub struct Job {
    pub handle: String,
    pub function: String,
    /// Client-supplied coalescing key; empty means "never coalesce".
    pub unique_id: String,
    pub payload: Vec<u8>,
    pub priority: JobPriority,
    pub background: bool,
    pub created_at: DateTime<Utc>,
    state: Mutex<JobState>,
    notify: Mutex<ListenerState>,
}

impl Job {
    pub fn new(
        handle: String,
        function: String,
        unique_id: String,
        payload: Vec<u8>,
        priority: JobPriority,
        background: bool,
    ) -> Self {
        Self {
            handle,
            function,
            unique_id,
            payload,
            priority,
            background,
            created_at: Utc::now(),
            state: Mutex::new(JobState::Queued),
            notify: Mutex::new(ListenerState::default()),
        }
    }

    pub fn state(&self) -> JobState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Claim the job for a worker. Only one claimant can win the
    /// Queued -> Running transition; everyone else sees `false`.
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == JobState::Queued {
            *state = JobState::Running;
            true
        } else {
            false
        }
    }

    /// Return the job to the queued state (worker disconnect requeue).
    pub fn mark_queued(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        *state = JobState::Queued;
    }

    /// Attach an additional submitter, replaying any events recorded so far.
    /// Returns `false` if the job already reached a terminal state, in which
    /// case the caller must treat it as dead and not coalesce onto it.
    pub fn attach_listener(&self, listener: JobListener) -> bool {
        let mut notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        if notify.terminal {
            return false;
        }
        for event in &notify.events {
            let packet = self.replay_packet(event);
            let _ = listener.sender.send(packet);
        }
        if !notify
            .listeners
            .iter()
            .any(|l| l.conn_id == listener.conn_id)
        {
            notify.listeners.push(listener);
        }
        true
    }

    /// Record a non-terminal event and relay `packet` to every live listener.
    /// Listeners whose connection has gone away are pruned here.
    pub fn record_event(&self, event: JobEvent, packet: Packet) {
        let mut notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        if notify.terminal {
            return;
        }
        notify.events.push(event);
        notify
            .listeners
            .retain(|l| l.sender.send(packet.clone()).is_ok());
    }

    /// Transition to terminal: deliver `packet` to every listener exactly
    /// once and refuse all future attaches and events.
    pub fn finish(&self, packet: Option<Packet>) {
        let mut notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        notify.terminal = true;
        let listeners = std::mem::take(&mut notify.listeners);
        if let Some(packet) = packet {
            for listener in listeners {
                let _ = listener.sender.send(packet.clone());
            }
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.notify.lock().unwrap_or_else(|e| e.into_inner()).terminal
    }

    /// Drop one submitter (its connection closed) without touching the job.
    pub fn detach_listener(&self, conn_id: Uuid) {
        let mut notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        notify.listeners.retain(|l| l.conn_id != conn_id);
    }

    pub fn listener_count(&self) -> usize {
        self.notify
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .listeners
            .len()
    }

    /// Most recent WORK_STATUS fraction, for GET_STATUS answers.
    pub fn last_status(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let notify = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        notify.events.iter().rev().find_map(|e| match e {
            JobEvent::Status(num, den) => Some((num.clone(), den.clone())),
            _ => None,
        })
    }

    fn replay_packet(&self, event: &JobEvent) -> Packet {
        let handle = self.handle.clone().into_bytes();
        let (kind, args) = match event {
            JobEvent::Data(data) => (PacketType::WorkData, vec![handle, data.clone()]),
            JobEvent::Warning(data) => (PacketType::WorkWarning, vec![handle, data.clone()]),
            JobEvent::Exception(data) => (PacketType::WorkException, vec![handle, data.clone()]),
            JobEvent::Status(num, den) => (
                PacketType::WorkStatus,
                vec![handle, num.clone(), den.clone()],
            ),
        };
        Packet {
            magic: PacketMagic::Res,
            kind,
            args,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn test_job() -> Job {
        Job::new(
            "H:test:1".to_string(),
            "reverse".to_string(),
            "uid".to_string(),
            b"payload".to_vec(),
            JobPriority::Normal,
            false,
        )
    }

    fn listener() -> (JobListener, mpsc::UnboundedReceiver<Packet>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            JobListener {
                conn_id: Uuid::new_v4(),
                sender: tx,
            },
            rx,
        )
    }

    #[test]
    fn test_running_claim_is_exclusive() {
        let job = test_job();
        assert!(job.mark_running());
        assert!(!job.mark_running());
        job.mark_queued();
        assert!(job.mark_running());
    }

    #[test]
    fn test_late_listener_gets_event_replay() {
        let job = test_job();
        let (first, mut first_rx) = listener();
        assert!(job.attach_listener(first));

        let status = Packet::response(
            PacketType::WorkStatus,
            vec![b"H:test:1".to_vec(), b"1".to_vec(), b"2".to_vec()],
        )
        .unwrap();
        job.record_event(
            JobEvent::Status(b"1".to_vec(), b"2".to_vec()),
            status.clone(),
        );
        assert_eq!(first_rx.try_recv().unwrap(), status);

        let (late, mut late_rx) = listener();
        assert!(job.attach_listener(late));
        let replayed = late_rx.try_recv().unwrap();
        assert_eq!(replayed.kind, PacketType::WorkStatus);
        assert_eq!(replayed.arg(1), b"1");
    }

    #[test]
    fn test_no_attach_after_terminal() {
        let job = test_job();
        let (first, mut first_rx) = listener();
        assert!(job.attach_listener(first));

        let done =
            Packet::response(PacketType::WorkFail, vec![b"H:test:1".to_vec()]).unwrap();
        job.finish(Some(done.clone()));
        assert_eq!(first_rx.try_recv().unwrap(), done);

        let (late, _late_rx) = listener();
        assert!(!job.attach_listener(late));
        assert!(job.is_terminal());
    }

    #[test]
    fn test_priority_bucket_order() {
        assert!(JobPriority::High.bucket() < JobPriority::Normal.bucket());
        assert!(JobPriority::Normal.bucket() < JobPriority::Low.bucket());
    }
}
