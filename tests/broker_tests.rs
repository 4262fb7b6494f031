//! End-to-end broker tests: a real server on an ephemeral port, driven by
//! raw protocol clients acting as submitters and workers.

use gearbroker::client::Client;
use gearbroker::server::{Job, PersistenceHook};
use gearbroker::{GearmanServer, JobPriority, PacketType, ServerConfig};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

async fn start_server(config: ServerConfig) -> (SocketAddr, CancellationToken) {
    start_server_with(config, None).await
}

async fn start_server_with(
    config: ServerConfig,
    hook: Option<Arc<dyn PersistenceHook>>,
) -> (SocketAddr, CancellationToken) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut server = GearmanServer::new(config);
    if let Some(hook) = hook {
        server = server.with_persistence(hook);
    }
    let token = server.shutdown_token();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (addr, token)
}

fn test_config() -> ServerConfig {
    ServerConfig {
        handle_prefix: "it".to_string(),
        ..ServerConfig::default()
    }
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (addr, _token) = start_server(test_config()).await;
    let mut client = Client::connect(&addr.to_string()).await.unwrap();
    let reply = client.echo(b"hello broker").await.unwrap();
    assert_eq!(reply, b"hello broker");
}

#[tokio::test]
async fn test_submit_grab_complete_round_trip() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("reverse").await.unwrap();

    let handle = submitter
        .submit_job("reverse", "", b"hello")
        .await
        .unwrap();
    assert!(handle.starts_with("H:it:"));

    let assignment = worker.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, handle);
    assert_eq!(assignment.function, "reverse");
    assert_eq!(assignment.payload, b"hello");

    worker.work_complete(&handle, b"olleh").await.unwrap();

    let done = submitter.wait_for(PacketType::WorkComplete).await.unwrap();
    assert_eq!(done.arg_str(0).unwrap(), handle);
    assert_eq!(done.arg(1), b"olleh");
}

#[tokio::test]
async fn test_priority_order_and_fifo_delivery() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let low = submitter
        .submit_job_with("work", "", b"low", JobPriority::Low, false)
        .await
        .unwrap();
    let normal_a = submitter
        .submit_job_with("work", "", b"normal-a", JobPriority::Normal, false)
        .await
        .unwrap();
    let normal_b = submitter
        .submit_job_with("work", "", b"normal-b", JobPriority::Normal, false)
        .await
        .unwrap();
    let high = submitter
        .submit_job_with("work", "", b"high", JobPriority::High, false)
        .await
        .unwrap();

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("work").await.unwrap();

    let mut order = Vec::new();
    for _ in 0..4 {
        let assignment = worker.grab_job().await.unwrap().unwrap();
        order.push(assignment.handle.clone());
        worker.work_complete(&assignment.handle, b"").await.unwrap();
    }

    assert_eq!(order, vec![high, normal_a, normal_b, low]);
    assert!(worker.grab_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_unique_submissions_coalesce_to_one_job() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitters = Vec::new();
    let mut handles = Vec::new();
    for _ in 0..3 {
        let mut client = Client::connect(&addr.to_string()).await.unwrap();
        let handle = client.submit_job("count", "unique", b"payload").await.unwrap();
        handles.push(handle);
        submitters.push(client);
    }
    assert_eq!(handles[0], handles[1]);
    assert_eq!(handles[1], handles[2]);

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("count").await.unwrap();

    // Exactly one worker invocation for the coalesced job.
    let assignment = worker.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, handles[0]);
    worker.work_complete(&assignment.handle, b"1").await.unwrap();
    assert!(worker.grab_job().await.unwrap().is_none());

    // All three submitters get the terminal event.
    for submitter in &mut submitters {
        let done = submitter.wait_for(PacketType::WorkComplete).await.unwrap();
        assert_eq!(done.arg(1), b"1");
    }
}

#[tokio::test]
async fn test_non_unique_submissions_stay_separate() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let mut handles = std::collections::HashSet::new();
    for _ in 0..3 {
        handles.insert(submitter.submit_job("count", "", b"notUnique").await.unwrap());
    }
    assert_eq!(handles.len(), 3);

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("count").await.unwrap();
    let mut invocations = 0;
    while let Some(assignment) = worker.grab_job().await.unwrap() {
        worker.work_complete(&assignment.handle, b"").await.unwrap();
        invocations += 1;
    }
    assert_eq!(invocations, 3);
}

#[tokio::test]
async fn test_late_coalesced_submitter_gets_event_replay() {
    let (addr, _token) = start_server(test_config()).await;

    let mut first = Client::connect(&addr.to_string()).await.unwrap();
    let handle = first.submit_job("slow", "uid-7", b"data").await.unwrap();

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("slow").await.unwrap();
    let assignment = worker.grab_job_uniq().await.unwrap().unwrap();
    assert_eq!(assignment.unique_id.as_deref(), Some("uid-7"));
    worker.work_data(&handle, b"partial").await.unwrap();
    worker.work_status(&handle, 1, 2).await.unwrap();

    // First submitter sees the live events.
    let data = first.wait_for(PacketType::WorkData).await.unwrap();
    assert_eq!(data.arg(1), b"partial");

    // A second submitter joins while the job is running and is caught up
    // with the recorded events before completion.
    let mut late = Client::connect(&addr.to_string()).await.unwrap();
    let late_handle = late.submit_job("slow", "uid-7", b"data").await.unwrap();
    assert_eq!(late_handle, handle);
    let replayed = late.wait_for(PacketType::WorkData).await.unwrap();
    assert_eq!(replayed.arg(1), b"partial");

    worker.work_complete(&handle, b"done").await.unwrap();
    let first_done = first.wait_for(PacketType::WorkComplete).await.unwrap();
    let late_done = late.wait_for(PacketType::WorkComplete).await.unwrap();
    assert_eq!(first_done.arg(1), b"done");
    assert_eq!(late_done.arg(1), b"done");
}

#[tokio::test]
async fn test_worker_disconnect_requeues_job() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter.submit_job("risky", "", b"payload").await.unwrap();

    let mut second = Client::connect(&addr.to_string()).await.unwrap();
    second.can_do("risky").await.unwrap();

    let mut first = Client::connect(&addr.to_string()).await.unwrap();
    first.can_do("risky").await.unwrap();
    let assignment = first.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, handle);

    // Second worker finds nothing and goes to sleep.
    assert!(second.grab_job().await.unwrap().is_none());
    second.pre_sleep().await.unwrap();

    // First worker dies mid-job; the broker requeues and wakes the sleeper.
    drop(first);
    second.wait_for_noop().await.unwrap();
    let retried = second.grab_job().await.unwrap().unwrap();
    assert_eq!(retried.handle, handle);
    assert_eq!(retried.payload, b"payload");
    second.work_complete(&handle, b"recovered").await.unwrap();

    let done = submitter.wait_for(PacketType::WorkComplete).await.unwrap();
    assert_eq!(done.arg(1), b"recovered");
}

#[tokio::test]
async fn test_worker_disconnect_fail_policy() {
    let config = ServerConfig {
        disconnect_policy: gearbroker::DisconnectPolicy::FailJob,
        ..test_config()
    };
    let (addr, _token) = start_server(config).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter.submit_job("risky", "", b"payload").await.unwrap();

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("risky").await.unwrap();
    let assignment = worker.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, handle);
    drop(worker);

    let failed = submitter.wait_for(PacketType::WorkFail).await.unwrap();
    assert_eq!(failed.arg_str(0).unwrap(), handle);
}

#[tokio::test]
async fn test_sleeping_worker_woken_on_submit() {
    let (addr, _token) = start_server(test_config()).await;

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("wakeup").await.unwrap();
    assert!(worker.grab_job().await.unwrap().is_none());
    worker.pre_sleep().await.unwrap();

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter.submit_job("wakeup", "", b"x").await.unwrap();

    worker.wait_for_noop().await.unwrap();
    let assignment = worker.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, handle);
}

#[tokio::test]
async fn test_pre_sleep_with_pending_work_wakes_immediately() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    submitter.submit_job("busy", "", b"x").await.unwrap();

    // Worker declares capability after the job is queued and goes straight
    // to sleep; the broker must not leave it asleep with work pending.
    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("busy").await.unwrap();
    worker.pre_sleep().await.unwrap();
    worker.wait_for_noop().await.unwrap();
    assert!(worker.grab_job().await.unwrap().is_some());
}

#[tokio::test]
async fn test_job_delivered_to_only_one_worker() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    submitter.submit_job("solo", "", b"x").await.unwrap();

    let mut first = Client::connect(&addr.to_string()).await.unwrap();
    first.can_do("solo").await.unwrap();
    let mut second = Client::connect(&addr.to_string()).await.unwrap();
    second.can_do("solo").await.unwrap();

    let first_got = first.grab_job().await.unwrap();
    let second_got = second.grab_job().await.unwrap();
    assert!(first_got.is_some() != second_got.is_some());
}

#[tokio::test]
async fn test_grab_without_abilities_gets_no_job() {
    let (addr, _token) = start_server(test_config()).await;
    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    assert!(worker.grab_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_cant_do_stops_delivery() {
    let (addr, _token) = start_server(test_config()).await;

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("retract").await.unwrap();
    worker.cant_do("retract").await.unwrap();

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    submitter.submit_job("retract", "", b"x").await.unwrap();

    assert!(worker.grab_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_reset_abilities_stops_delivery() {
    let (addr, _token) = start_server(test_config()).await;

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("alpha").await.unwrap();
    worker.can_do("beta").await.unwrap();
    worker.reset_abilities().await.unwrap();

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    submitter.submit_job("alpha", "", b"x").await.unwrap();
    let beta_handle = submitter.submit_job("beta", "", b"y").await.unwrap();

    assert!(worker.grab_job().await.unwrap().is_none());

    // Re-declaring one function restores delivery for that function only.
    worker.can_do("beta").await.unwrap();
    let assignment = worker.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, beta_handle);
    assert!(worker.grab_job().await.unwrap().is_none());
}

#[tokio::test]
async fn test_warning_and_exception_relayed_to_submitter() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter.submit_job("flaky", "", b"x").await.unwrap();

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("flaky").await.unwrap();
    worker.grab_job().await.unwrap().unwrap();
    worker.work_warning(&handle, b"retrying shard").await.unwrap();
    worker.work_exception(&handle, b"shard offline").await.unwrap();
    worker.work_complete(&handle, b"ok").await.unwrap();

    let warning = submitter.wait_for(PacketType::WorkWarning).await.unwrap();
    assert_eq!(warning.arg_str(0).unwrap(), handle);
    assert_eq!(warning.arg(1), b"retrying shard");

    let exception = submitter.wait_for(PacketType::WorkException).await.unwrap();
    assert_eq!(exception.arg(1), b"shard offline");

    let done = submitter.wait_for(PacketType::WorkComplete).await.unwrap();
    assert_eq!(done.arg(1), b"ok");
}

#[tokio::test]
async fn test_background_job_reports_no_events() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter
        .submit_job_with("bg", "", b"x", JobPriority::Normal, true)
        .await
        .unwrap();

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("bg").await.unwrap();
    let assignment = worker.grab_job().await.unwrap().unwrap();
    assert_eq!(assignment.handle, handle);
    worker.work_complete(&handle, b"done").await.unwrap();

    // The submitter holds no listener; completion must not reach it.
    let quiet =
        tokio::time::timeout(Duration::from_millis(200), submitter.next_packet()).await;
    assert!(quiet.is_err());
}

#[tokio::test]
async fn test_get_status_tracks_progress() {
    let (addr, _token) = start_server(test_config()).await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter.submit_job("progress", "", b"x").await.unwrap();

    let queued = submitter.get_status(&handle).await.unwrap();
    assert!(queued.known);
    assert!(!queued.running);

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("progress").await.unwrap();
    worker.grab_job().await.unwrap().unwrap();
    worker.work_status(&handle, 3, 4).await.unwrap();

    // The status relay reaches the submitter before a later GET_STATUS can
    // be answered, so consume it first.
    let status = submitter.wait_for(PacketType::WorkStatus).await.unwrap();
    assert_eq!(status.arg(1), b"3");

    let running = submitter.get_status(&handle).await.unwrap();
    assert!(running.known);
    assert!(running.running);
    assert_eq!(running.numerator, "3");
    assert_eq!(running.denominator, "4");

    let unknown = submitter.get_status("H:it:9999").await.unwrap();
    assert!(!unknown.known);
}

async fn admin_command(addr: SocketAddr, command: &str) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(command.as_bytes()).await.unwrap();
    stream.write_all(b"\n").await.unwrap();
    let mut reply = Vec::new();
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        reply.extend_from_slice(&buf[..n]);
        let text = String::from_utf8_lossy(&reply);
        if text.ends_with(".\n") || text.ends_with("OK\n") || text.contains("ERR")
            || text.starts_with("OK ")
        {
            break;
        }
    }
    String::from_utf8(reply).unwrap()
}

#[tokio::test]
async fn test_admin_status_and_workers() {
    let (addr, _token) = start_server(test_config()).await;

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.set_client_id("w-1").await.unwrap();
    worker.can_do("reverse").await.unwrap();

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    submitter.submit_job("reverse", "", b"x").await.unwrap();

    let status = admin_command(addr, "status").await;
    assert!(status.contains("reverse\t1\t0\t1"), "got: {status}");
    assert!(status.ends_with(".\n"));

    let workers = admin_command(addr, "workers").await;
    assert!(workers.contains("w-1 : reverse"), "got: {workers}");

    let version = admin_command(addr, "version").await;
    assert!(version.starts_with("OK "));

    let unknown = admin_command(addr, "frobnicate").await;
    assert!(unknown.starts_with("ERR unknown_command"));
}

#[tokio::test]
async fn test_admin_shutdown_notifies_and_stops() {
    let (addr, token) = start_server(test_config()).await;

    let mut client = Client::connect(&addr.to_string()).await.unwrap();
    client.echo(b"ping").await.unwrap();

    let reply = admin_command(addr, "shutdown").await;
    assert_eq!(reply, "OK\n");

    // Connected clients are told before sockets close.
    let err = client.wait_for(PacketType::Error).await.unwrap();
    assert_eq!(err.arg_str(0).unwrap(), "server_shutdown");

    token.cancelled().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(addr).await.is_err());
}

#[derive(Default)]
struct RecordingHook {
    events: Mutex<Vec<String>>,
}

impl PersistenceHook for RecordingHook {
    fn job_created(&self, job: &Job) {
        self.events
            .lock()
            .unwrap()
            .push(format!("created {} {}", job.handle, job.function));
    }

    fn job_removed(&self, handle: &str) {
        self.events.lock().unwrap().push(format!("removed {handle}"));
    }
}

#[tokio::test]
async fn test_persistence_hook_sees_lifecycle() {
    let hook = Arc::new(RecordingHook::default());
    let (addr, _token) =
        start_server_with(test_config(), Some(Arc::clone(&hook) as Arc<dyn PersistenceHook>))
            .await;

    let mut submitter = Client::connect(&addr.to_string()).await.unwrap();
    let handle = submitter.submit_job("persist", "", b"x").await.unwrap();

    let mut worker = Client::connect(&addr.to_string()).await.unwrap();
    worker.can_do("persist").await.unwrap();
    let assignment = worker.grab_job().await.unwrap().unwrap();
    worker.work_complete(&assignment.handle, b"").await.unwrap();
    submitter.wait_for(PacketType::WorkComplete).await.unwrap();

    let events = hook.events.lock().unwrap().clone();
    assert_eq!(events[0], format!("created {handle} persist"));
    assert_eq!(events[1], format!("removed {handle}"));
}
