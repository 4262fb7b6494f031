// Local job server engine: tracks worker capabilities, queues jobs by
// priority, coalesces unique submissions, and relays job events between
// submitters and workers over plain TCP.

pub mod admin;
pub mod client;
pub mod dispatcher;
pub mod function;
pub mod job;
pub mod job_table;
pub mod queue;

pub use dispatcher::{Dispatcher, PersistenceHook};
pub use job::{Job, JobPriority, JobState};

use crate::config::ServerConfig;
use crate::error::Result;
use crate::protocol::codec;
use crate::protocol::packet::Packet;
use crate::server::client::ClientConn;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Outbound channel feeding a connection's writer task. Sends never block;
/// the writer drains the channel and reports nothing back to the sender.
pub type PacketSender = mpsc::UnboundedSender<Packet>;

/// The broker server: owns the dispatcher and runs the TCP accept loop,
/// one task per connection.
pub struct GearmanServer {
    dispatcher: Arc<Dispatcher>,
    /// Cancelled by signal handlers or the admin `shutdown` command to
    /// trigger the shutdown sequence.
    trigger: CancellationToken,
    /// Cancelled by the shutdown sequence itself, after clients have been
    /// notified, to stop every connection task.
    conns: CancellationToken,
}

impl GearmanServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(config, None)),
            trigger: CancellationToken::new(),
            conns: CancellationToken::new(),
        }
    }

    /// Install a persistence hook. Must be called before `run`/`serve`.
    pub fn with_persistence(self, hook: Arc<dyn PersistenceHook>) -> Self {
        let config = self.dispatcher.config().clone();
        Self {
            dispatcher: Arc::new(Dispatcher::new(config, Some(hook))),
            trigger: self.trigger,
            conns: self.conns,
        }
    }

    /// Token external code cancels to request a graceful shutdown.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.trigger.clone()
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Bind the configured address and serve until shutdown.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.dispatcher.config().bind_addr).await?;
        info!(addr = %self.dispatcher.config().bind_addr, "listening");
        self.serve(listener).await
    }

    /// Serve on an already-bound listener (lets tests bind port 0 and learn
    /// the address first).
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, addr) = accepted?;
                    debug!(%addr, "accepted connection");
                    let dispatcher = Arc::clone(&self.dispatcher);
                    let conn_token = self.conns.child_token();
                    let trigger = self.trigger.clone();
                    tokio::spawn(async move {
                        handle_connection(dispatcher, stream, addr, conn_token, trigger).await;
                    });
                }
                _ = self.trigger.cancelled() => break,
            }
        }

        // Stop accepting, notify, release job state, then stop connection
        // tasks; the writers flush queued notifications before exiting.
        drop(listener);
        self.dispatcher.begin_shutdown();
        self.conns.cancel();
        info!("server stopped");
        Ok(())
    }
}

/// Sniff the first byte to select the protocol mode: a NUL opens a binary
/// frame, anything else is a line-oriented admin command.
async fn handle_connection(
    dispatcher: Arc<Dispatcher>,
    stream: TcpStream,
    addr: SocketAddr,
    conn_token: CancellationToken,
    trigger: CancellationToken,
) {
    let (mut reader, writer) = stream.into_split();
    let mut first = [0u8; 1];
    let sniffed = tokio::select! {
        res = tokio::io::AsyncReadExt::read_exact(&mut reader, &mut first) => res,
        _ = conn_token.cancelled() => return,
    };
    if sniffed.is_err() {
        return;
    }

    if first[0] == 0 {
        binary_connection(dispatcher, reader, writer, addr, conn_token).await;
    } else if let Err(e) =
        admin_connection(dispatcher, reader, writer, first[0], conn_token, trigger).await
    {
        debug!(%addr, error = %e, "admin connection ended");
    }
}

async fn binary_connection(
    dispatcher: Arc<Dispatcher>,
    mut reader: OwnedReadHalf,
    writer: OwnedWriteHalf,
    addr: SocketAddr,
    conn_token: CancellationToken,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let writer_token = conn_token.clone();
    let writer_task = tokio::spawn(write_loop(writer, rx, writer_token));

    let conn = Arc::new(ClientConn::new(addr, tx));
    dispatcher.register(Arc::clone(&conn));
    info!(conn = %conn.id, %addr, "client connected");

    let max_body = dispatcher.config().max_packet_size;
    // The sniffed NUL is the first byte of the first frame's magic.
    let mut sniffed_byte = Some(0u8);
    loop {
        tokio::select! {
            _ = conn_token.cancelled() => break,
            decoded = codec::read_packet(&mut reader, sniffed_byte.take(), max_body) => {
                match decoded {
                    Ok(Some(packet)) => {
                        if let Err(e) = dispatcher.dispatch(&conn, packet).await {
                            warn!(conn = %conn.id, error = %e, "closing connection");
                            break;
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!(conn = %conn.id, error = %e, "closing connection");
                        break;
                    }
                }
            }
        }
    }

    dispatcher.handle_disconnect(&conn);
    info!(conn = %conn.id, %addr, "client disconnected");
    // Job listeners may still hold clones of the sender, so the channel
    // does not close by itself; tell the writer to drain and stop.
    conn_token.cancel();
    let _ = writer_task.await;
}

async fn write_loop(
    mut writer: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Packet>,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            queued = rx.recv() => match queued {
                Some(packet) => {
                    if writer.write_all(&codec::encode(&packet)).await.is_err() {
                        break;
                    }
                }
                None => break,
            },
            _ = token.cancelled() => {
                // Flush whatever was queued before the cancellation
                // (shutdown notifications included), then stop.
                while let Ok(packet) = rx.try_recv() {
                    if writer.write_all(&codec::encode(&packet)).await.is_err() {
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writer.shutdown().await;
}

async fn admin_connection(
    dispatcher: Arc<Dispatcher>,
    reader: OwnedReadHalf,
    mut writer: OwnedWriteHalf,
    first_byte: u8,
    conn_token: CancellationToken,
    trigger: CancellationToken,
) -> Result<()> {
    let mut reader = BufReader::new(reader);
    let mut line = String::new();
    line.push(first_byte as char);

    loop {
        let read = tokio::select! {
            res = reader.read_line(&mut line) => res?,
            _ = conn_token.cancelled() => break,
        };
        if read == 0 && line.trim().is_empty() {
            break;
        }

        let command = admin::parse(line.trim());
        debug!(?command, "admin command");
        let reply = admin::respond(&dispatcher, &command);
        writer.write_all(reply.text.as_bytes()).await?;

        if reply.shutdown {
            trigger.cancel();
            break;
        }
        if read == 0 {
            break;
        }
        line.clear();
    }
    let _ = writer.shutdown().await;
    Ok(())
}
