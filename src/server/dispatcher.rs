use crate::config::{DisconnectPolicy, ServerConfig};
use crate::error::{GearmanError, Result};
use crate::protocol::packet::{Packet, PacketMagic, PacketType};
use crate::server::client::ClientConn;
use crate::server::function::FunctionRegistry;
use crate::server::job::{Job, JobEvent, JobPriority};
use crate::server::job_table::JobTable;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Callback invoked as jobs enter and leave the broker, so an external
/// store can mirror the queue. Durability format and replay are the
/// implementer's concern; the broker never reads anything back.
pub trait PersistenceHook: Send + Sync {
    fn job_created(&self, job: &Job);
    fn job_removed(&self, handle: &str);
}

/// Translates inbound packets into mutations of the registry, job table,
/// and per-connection state, and decides which connections to notify.
///
/// Holds no job state of its own; any number of connection tasks may call
/// [`Dispatcher::dispatch`] concurrently. Queue locks and job locks are
/// never held at the same time, so there is no cross-component lock order
/// to violate.
pub struct Dispatcher {
    config: ServerConfig,
    registry: FunctionRegistry,
    jobs: JobTable,
    connections: DashMap<Uuid, Arc<ClientConn>>,
    persistence: Option<Arc<dyn PersistenceHook>>,
    shutting_down: AtomicBool,
}

impl Dispatcher {
    pub fn new(config: ServerConfig, persistence: Option<Arc<dyn PersistenceHook>>) -> Self {
        let jobs = JobTable::new(&config.handle_prefix);
        Self {
            config,
            registry: FunctionRegistry::new(),
            jobs,
            connections: DashMap::new(),
            persistence,
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn jobs(&self) -> &JobTable {
        &self.jobs
    }

    pub fn register(&self, conn: Arc<ClientConn>) {
        self.connections.insert(conn.id, conn);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    /// Handle one inbound packet. An `Err` is a protocol violation and the
    /// caller must close the connection; state violations are absorbed here
    /// and never escape the dispatch path.
    pub async fn dispatch(&self, conn: &Arc<ClientConn>, packet: Packet) -> Result<()> {
        if packet.magic != PacketMagic::Req {
            return Err(GearmanError::Protocol(format!(
                "{:?} sent with response magic",
                packet.kind
            )));
        }

        use PacketType::*;
        match packet.kind {
            CanDo => self.can_do(conn, &packet),
            CantDo => self.cant_do(conn, &packet),
            ResetAbilities => {
                self.reset_abilities(conn);
                Ok(())
            }
            SetClientId => {
                conn.set_client_id(packet.arg_str(0)?);
                Ok(())
            }
            PreSleep => {
                self.pre_sleep(conn);
                Ok(())
            }
            GrabJob => self.grab_job(conn, false),
            GrabJobUniq => self.grab_job(conn, true),
            SubmitJob | SubmitJobBg | SubmitJobHigh | SubmitJobHighBg | SubmitJobLow
            | SubmitJobLowBg => self.submit_job(conn, &packet).await,
            WorkData => self.work_event(conn, &packet, JobEvent::Data(packet.arg(1).to_vec())),
            WorkWarning => {
                self.work_event(conn, &packet, JobEvent::Warning(packet.arg(1).to_vec()))
            }
            WorkException => {
                self.work_event(conn, &packet, JobEvent::Exception(packet.arg(1).to_vec()))
            }
            WorkStatus => self.work_event(
                conn,
                &packet,
                JobEvent::Status(packet.arg(1).to_vec(), packet.arg(2).to_vec()),
            ),
            WorkComplete => self.work_terminal(conn, &packet, true),
            WorkFail => self.work_terminal(conn, &packet, false),
            GetStatus => self.get_status(conn, &packet),
            EchoReq => {
                self.respond(conn, EchoRes, vec![packet.arg(0).to_vec()]);
                Ok(())
            }
            other => Err(GearmanError::Protocol(format!(
                "{other:?} is not a valid request"
            ))),
        }
    }

    fn can_do(&self, conn: &Arc<ClientConn>, packet: &Packet) -> Result<()> {
        let function = packet.arg_str(0)?;
        conn.add_ability(function);
        self.registry.get_or_create(function).register_worker(conn.id);
        debug!(conn = %conn.id, function, "worker registered ability");
        Ok(())
    }

    fn cant_do(&self, conn: &Arc<ClientConn>, packet: &Packet) -> Result<()> {
        let function = packet.arg_str(0)?;
        if conn.remove_ability(function) {
            self.retract_ability(conn.id, function);
        }
        Ok(())
    }

    fn reset_abilities(&self, conn: &Arc<ClientConn>) {
        for function in conn.take_abilities() {
            self.retract_ability(conn.id, &function);
        }
    }

    fn retract_ability(&self, conn_id: Uuid, function: &str) {
        if let Some(f) = self.registry.get(function) {
            f.unregister_worker(conn_id);
        }
        self.registry.collect_if_idle(function);
    }

    async fn submit_job(&self, conn: &Arc<ClientConn>, packet: &Packet) -> Result<()> {
        use PacketType::*;
        let (priority, background) = match packet.kind {
            SubmitJob => (JobPriority::Normal, false),
            SubmitJobBg => (JobPriority::Normal, true),
            SubmitJobHigh => (JobPriority::High, false),
            SubmitJobHighBg => (JobPriority::High, true),
            SubmitJobLow => (JobPriority::Low, false),
            SubmitJobLowBg => (JobPriority::Low, true),
            _ => unreachable!("submit_job called for non-submit packet"),
        };

        if self.is_shutting_down() {
            self.respond(
                conn,
                Error,
                vec![b"server_shutdown".to_vec(), b"not accepting jobs".to_vec()],
            );
            return Ok(());
        }

        let function = packet.arg_str(0)?.to_string();
        let unique_id = packet.arg_str(1)?.to_string();
        let payload = packet.arg(2).to_vec();
        let listener = (!background).then(|| conn.listener());

        let outcome = self
            .jobs
            .submit(
                &self.registry,
                &function,
                &unique_id,
                payload,
                priority,
                background,
                listener,
            )
            .await;

        debug!(
            handle = %outcome.job.handle,
            function = %function,
            coalesced = outcome.coalesced,
            background,
            "job submitted"
        );

        // A coalesced background submission has nothing to report back: the
        // submitter holds no listener and the handle belongs to a job it
        // does not own.
        if !(background && outcome.coalesced) {
            self.respond(
                conn,
                JobCreated,
                vec![outcome.job.handle.clone().into_bytes()],
            );
        }

        if !outcome.coalesced {
            if let Some(hook) = &self.persistence {
                hook.job_created(&outcome.job);
            }
            self.wake_one(&function);
        }
        Ok(())
    }

    fn grab_job(&self, conn: &Arc<ClientConn>, with_unique: bool) -> Result<()> {
        for function in conn.abilities() {
            let Some(f) = self.registry.get(&function) else {
                continue;
            };
            while let Some(job) = f.queue.poll() {
                if !job.mark_running() {
                    // Stale queue entry for a job some other path already
                    // claimed; skip it.
                    continue;
                }
                conn.start_job(Arc::clone(&job));
                debug!(handle = %job.handle, conn = %conn.id, "job assigned");
                let handle = job.handle.clone().into_bytes();
                if with_unique {
                    self.respond(
                        conn,
                        PacketType::JobAssignUniq,
                        vec![
                            handle,
                            job.function.clone().into_bytes(),
                            job.unique_id.clone().into_bytes(),
                            job.payload.clone(),
                        ],
                    );
                } else {
                    self.respond(
                        conn,
                        PacketType::JobAssign,
                        vec![handle, job.function.clone().into_bytes(), job.payload.clone()],
                    );
                }
                return Ok(());
            }
        }
        // Covers workers with zero declared abilities as well: a state
        // violation answered with NO_JOB rather than an error.
        self.respond(conn, PacketType::NoJob, vec![]);
        Ok(())
    }

    fn pre_sleep(&self, conn: &Arc<ClientConn>) {
        conn.set_sleeping(true);
        // Re-check the queues after flagging: a job submitted between this
        // worker's NO_JOB and its PRE_SLEEP must not leave it asleep
        // forever.
        for function in conn.abilities() {
            let has_work = self
                .registry
                .get(&function)
                .is_some_and(|f| !f.queue.is_empty());
            if has_work && conn.try_wake() {
                self.respond(conn, PacketType::Noop, vec![]);
                return;
            }
        }
    }

    /// Wake at most one sleeping worker capable of `function`.
    fn wake_one(&self, function: &str) {
        let Some(f) = self.registry.get(function) else {
            return;
        };
        for worker_id in f.worker_ids() {
            let Some(worker) = self.connections.get(&worker_id).map(|w| w.clone()) else {
                continue;
            };
            if worker.try_wake() {
                self.respond(&worker, PacketType::Noop, vec![]);
                debug!(conn = %worker.id, function, "woke sleeping worker");
                return;
            }
        }
    }

    /// Non-terminal WORK_* relay: record the event on the job and forward it
    /// to every attached submitter.
    fn work_event(&self, conn: &Arc<ClientConn>, packet: &Packet, event: JobEvent) -> Result<()> {
        let handle = packet.arg_str(0)?;
        let Some(job) = conn.running_job(handle) else {
            warn!(conn = %conn.id, handle, kind = ?packet.kind, "work event for unowned handle dropped");
            return Ok(());
        };
        let relay = Packet {
            magic: PacketMagic::Res,
            kind: packet.kind,
            args: packet.args.clone(),
        };
        job.record_event(event, relay);
        Ok(())
    }

    fn work_terminal(&self, conn: &Arc<ClientConn>, packet: &Packet, complete: bool) -> Result<()> {
        let handle = packet.arg_str(0)?;
        let Some(job) = conn.finish_job(handle) else {
            warn!(conn = %conn.id, handle, kind = ?packet.kind, "terminal event for unowned handle dropped");
            return Ok(());
        };

        let relay = Packet {
            magic: PacketMagic::Res,
            kind: packet.kind,
            args: packet.args.clone(),
        };
        job.finish(Some(relay));
        self.jobs.remove(&job);
        if let Some(hook) = &self.persistence {
            hook.job_removed(&job.handle);
        }
        self.registry.collect_if_idle(&job.function);
        debug!(handle = %job.handle, complete, "job finished");
        Ok(())
    }

    fn get_status(&self, conn: &Arc<ClientConn>, packet: &Packet) -> Result<()> {
        let handle = packet.arg(0).to_vec();
        let job = self.jobs.lookup_by_handle(packet.arg_str(0)?);

        let (known, running, num, den) = match job {
            Some(job) => {
                let (num, den) = job
                    .last_status()
                    .unwrap_or_else(|| (b"0".to_vec(), b"0".to_vec()));
                let running: &[u8] = match job.state() {
                    crate::server::job::JobState::Running => b"1",
                    crate::server::job::JobState::Queued => b"0",
                };
                (b"1".to_vec(), running.to_vec(), num, den)
            }
            None => (
                b"0".to_vec(),
                b"0".to_vec(),
                b"0".to_vec(),
                b"0".to_vec(),
            ),
        };
        self.respond(
            conn,
            PacketType::StatusRes,
            vec![handle, known, running, num, den],
        );
        Ok(())
    }

    /// Tear down everything a dropped connection held: in-flight jobs are
    /// requeued (or failed, per policy) and its abilities retracted. Jobs
    /// it merely listened on prune themselves on the next send.
    pub fn handle_disconnect(&self, conn: &Arc<ClientConn>) {
        self.connections.remove(&conn.id);

        // In-flight jobs first, while this worker's registrations still pin
        // their functions in the registry. Once shutdown has released the
        // job state there is nothing left to hand over; jobs already
        // finished must not be resurrected into the drained registry.
        for job in conn.take_running() {
            if self.is_shutting_down() || job.is_terminal() {
                continue;
            }
            match self.config.disconnect_policy {
                DisconnectPolicy::Requeue => {
                    job.mark_queued();
                    info!(handle = %job.handle, "requeueing job from disconnected worker");
                    self.registry.requeue(&job.function, Arc::clone(&job));
                    self.wake_one(&job.function);
                }
                DisconnectPolicy::FailJob => {
                    info!(handle = %job.handle, "failing job from disconnected worker");
                    let fail = Packet {
                        magic: PacketMagic::Res,
                        kind: PacketType::WorkFail,
                        args: vec![job.handle.clone().into_bytes()],
                    };
                    job.finish(Some(fail));
                    self.jobs.remove(&job);
                    if let Some(hook) = &self.persistence {
                        hook.job_removed(&job.handle);
                    }
                }
            }
        }

        for function in conn.take_abilities() {
            self.retract_ability(conn.id, &function);
        }
        debug!(conn = %conn.id, "connection cleaned up");
    }

    /// Enter shutdown: refuse new submissions, tell every connection, and
    /// release all job state so no job outlives its function.
    pub fn begin_shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("shutdown started, releasing job state");

        for conn in self.connections.iter() {
            conn.send(Packet {
                magic: PacketMagic::Res,
                kind: PacketType::Error,
                args: vec![b"server_shutdown".to_vec(), b"shutting down".to_vec()],
            });
        }

        for function in self.registry.drain() {
            function.queue.drain();
        }
        for job in self.jobs.release_all() {
            job.finish(None);
            if let Some(hook) = &self.persistence {
                hook.job_removed(&job.handle);
            }
        }
    }

    /// One admin `status` line per live function:
    /// `name \t queued \t running \t capable-workers`.
    pub fn status_lines(&self) -> Vec<String> {
        let mut running: HashMap<String, usize> = HashMap::new();
        for name in self.jobs_running_by_function() {
            *running.entry(name).or_insert(0) += 1;
        }

        let mut lines = Vec::new();
        let mut seen: Vec<String> = Vec::new();
        for function in self.registry.snapshot() {
            let r = running.get(&function.name).copied().unwrap_or(0);
            lines.push(format!(
                "{}\t{}\t{}\t{}",
                function.name,
                function.queue.len(),
                r,
                function.worker_count()
            ));
            seen.push(function.name.clone());
        }
        // Functions that only have running jobs left may already be out of
        // the registry; still report them.
        for (name, count) in running {
            if !seen.contains(&name) {
                lines.push(format!("{name}\t0\t{count}\t0"));
            }
        }
        lines.sort();
        lines
    }

    fn jobs_running_by_function(&self) -> Vec<String> {
        let mut names = Vec::new();
        for conn in self.connections.iter() {
            for handle in conn.running_handles() {
                if let Some(job) = self.jobs.lookup_by_handle(&handle) {
                    names.push(job.function.clone());
                }
            }
        }
        names
    }

    /// One admin `workers` line per connection:
    /// `addr client-id : declared functions`.
    pub fn worker_lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self
            .connections
            .iter()
            .map(|conn| {
                let abilities = conn.abilities().join(" ");
                format!("{} {} : {}", conn.addr, conn.client_id(), abilities)
            })
            .collect();
        lines.sort();
        lines
    }

    fn respond(&self, conn: &Arc<ClientConn>, kind: PacketType, args: Vec<Vec<u8>>) {
        let sent = conn.send(Packet {
            magic: PacketMagic::Res,
            kind,
            args,
        });
        if !sent {
            debug!(conn = %conn.id, ?kind, "response dropped, connection gone");
        }
    }
}
