use crate::error::{GearmanError, Result};
use crate::protocol::codec;
use crate::protocol::packet::{Packet, PacketType};
use crate::server::job::JobPriority;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

const MAX_PACKET: usize = 16 * 1024 * 1024;

/// A job handed to a worker by GRAB_JOB.
#[derive(Debug, Clone)]
pub struct JobAssignment {
    pub handle: String,
    pub function: String,
    pub unique_id: Option<String>,
    pub payload: Vec<u8>,
}

/// Status answer for GET_STATUS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub known: bool,
    pub running: bool,
    pub numerator: String,
    pub denominator: String,
}

/// Thin request/response wrapper over one broker connection.
///
/// Covers both roles: submitters use the `submit_*`/`get_status` calls,
/// workers use `can_do`/`grab_job`/`work_*`. This is a convenience façade
/// for tests and demos, not part of the broker core.
pub struct Client {
    stream: TcpStream,
    /// Packets that arrived while waiting for a specific response, kept for
    /// later `next_packet` calls (e.g. replayed events delivered before
    /// JOB_CREATED on a coalesced submit).
    pending: std::collections::VecDeque<Packet>,
}

impl Client {
    /// Connect to a broker at the given address.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        Ok(Self {
            stream,
            pending: std::collections::VecDeque::new(),
        })
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<()> {
        self.stream.write_all(&codec::encode(packet)).await?;
        Ok(())
    }

    /// Next packet from the broker, buffered ones first.
    pub async fn next_packet(&mut self) -> Result<Packet> {
        if let Some(packet) = self.pending.pop_front() {
            return Ok(packet);
        }
        codec::read_packet(&mut self.stream, None, MAX_PACKET)
            .await?
            .ok_or(GearmanError::ConnectionClosed)
    }

    /// Read packets until one of kind `wanted` arrives. NOOPs are dropped;
    /// anything else is buffered for `next_packet`.
    pub async fn wait_for(&mut self, wanted: PacketType) -> Result<Packet> {
        if let Some(pos) = self.pending.iter().position(|p| p.kind == wanted) {
            if let Some(packet) = self.pending.remove(pos) {
                return Ok(packet);
            }
        }
        loop {
            let packet = codec::read_packet(&mut self.stream, None, MAX_PACKET)
                .await?
                .ok_or(GearmanError::ConnectionClosed)?;
            if packet.kind == wanted {
                return Ok(packet);
            }
            if packet.kind != PacketType::Noop {
                self.pending.push_back(packet);
            }
        }
    }

    pub async fn echo(&mut self, payload: &[u8]) -> Result<Vec<u8>> {
        self.send(&Packet::request(PacketType::EchoReq, vec![payload.to_vec()])?)
            .await?;
        let reply = self.wait_for(PacketType::EchoRes).await?;
        Ok(reply.arg(0).to_vec())
    }

    /// Submit a foreground NORMAL-priority job and return its handle.
    pub async fn submit_job(
        &mut self,
        function: &str,
        unique_id: &str,
        payload: &[u8],
    ) -> Result<String> {
        self.submit_job_with(function, unique_id, payload, JobPriority::Normal, false)
            .await
    }

    pub async fn submit_job_with(
        &mut self,
        function: &str,
        unique_id: &str,
        payload: &[u8],
        priority: JobPriority,
        background: bool,
    ) -> Result<String> {
        let kind = match (priority, background) {
            (JobPriority::Normal, false) => PacketType::SubmitJob,
            (JobPriority::Normal, true) => PacketType::SubmitJobBg,
            (JobPriority::High, false) => PacketType::SubmitJobHigh,
            (JobPriority::High, true) => PacketType::SubmitJobHighBg,
            (JobPriority::Low, false) => PacketType::SubmitJobLow,
            (JobPriority::Low, true) => PacketType::SubmitJobLowBg,
        };
        self.send(&Packet::request(
            kind,
            vec![
                function.as_bytes().to_vec(),
                unique_id.as_bytes().to_vec(),
                payload.to_vec(),
            ],
        )?)
        .await?;
        let created = self.wait_for(PacketType::JobCreated).await?;
        Ok(created.arg_str(0)?.to_string())
    }

    pub async fn get_status(&mut self, handle: &str) -> Result<JobStatus> {
        self.send(&Packet::request(
            PacketType::GetStatus,
            vec![handle.as_bytes().to_vec()],
        )?)
        .await?;
        let res = self.wait_for(PacketType::StatusRes).await?;
        Ok(JobStatus {
            known: res.arg(1) == b"1",
            running: res.arg(2) == b"1",
            numerator: res.arg_str(3)?.to_string(),
            denominator: res.arg_str(4)?.to_string(),
        })
    }

    pub async fn set_client_id(&mut self, label: &str) -> Result<()> {
        self.send(&Packet::request(
            PacketType::SetClientId,
            vec![label.as_bytes().to_vec()],
        )?)
        .await
    }

    pub async fn can_do(&mut self, function: &str) -> Result<()> {
        self.send(&Packet::request(
            PacketType::CanDo,
            vec![function.as_bytes().to_vec()],
        )?)
        .await
    }

    pub async fn cant_do(&mut self, function: &str) -> Result<()> {
        self.send(&Packet::request(
            PacketType::CantDo,
            vec![function.as_bytes().to_vec()],
        )?)
        .await
    }

    pub async fn reset_abilities(&mut self) -> Result<()> {
        self.send(&Packet::request(PacketType::ResetAbilities, vec![])?)
            .await
    }

    pub async fn pre_sleep(&mut self) -> Result<()> {
        self.send(&Packet::request(PacketType::PreSleep, vec![])?).await
    }

    /// Block until the broker sends a NOOP wake-up.
    pub async fn wait_for_noop(&mut self) -> Result<()> {
        loop {
            if self.next_packet().await?.kind == PacketType::Noop {
                return Ok(());
            }
        }
    }

    /// Ask for a job. `None` means every capable queue was empty.
    pub async fn grab_job(&mut self) -> Result<Option<JobAssignment>> {
        self.send(&Packet::request(PacketType::GrabJob, vec![])?).await?;
        loop {
            let packet = self.next_packet().await?;
            match packet.kind {
                PacketType::Noop => continue,
                PacketType::NoJob => return Ok(None),
                PacketType::JobAssign => {
                    return Ok(Some(JobAssignment {
                        handle: packet.arg_str(0)?.to_string(),
                        function: packet.arg_str(1)?.to_string(),
                        unique_id: None,
                        payload: packet.arg(2).to_vec(),
                    }));
                }
                other => {
                    return Err(GearmanError::Protocol(format!(
                        "unexpected {other:?} while grabbing"
                    )));
                }
            }
        }
    }

    /// GRAB_JOB_UNIQ variant; the assignment carries the unique-id.
    pub async fn grab_job_uniq(&mut self) -> Result<Option<JobAssignment>> {
        self.send(&Packet::request(PacketType::GrabJobUniq, vec![])?)
            .await?;
        loop {
            let packet = self.next_packet().await?;
            match packet.kind {
                PacketType::Noop => continue,
                PacketType::NoJob => return Ok(None),
                PacketType::JobAssignUniq => {
                    return Ok(Some(JobAssignment {
                        handle: packet.arg_str(0)?.to_string(),
                        function: packet.arg_str(1)?.to_string(),
                        unique_id: Some(packet.arg_str(2)?.to_string()),
                        payload: packet.arg(3).to_vec(),
                    }));
                }
                other => {
                    return Err(GearmanError::Protocol(format!(
                        "unexpected {other:?} while grabbing"
                    )));
                }
            }
        }
    }

    pub async fn work_data(&mut self, handle: &str, data: &[u8]) -> Result<()> {
        self.send(&Packet::request(
            PacketType::WorkData,
            vec![handle.as_bytes().to_vec(), data.to_vec()],
        )?)
        .await
    }

    pub async fn work_warning(&mut self, handle: &str, message: &[u8]) -> Result<()> {
        self.send(&Packet::request(
            PacketType::WorkWarning,
            vec![handle.as_bytes().to_vec(), message.to_vec()],
        )?)
        .await
    }

    pub async fn work_exception(&mut self, handle: &str, data: &[u8]) -> Result<()> {
        self.send(&Packet::request(
            PacketType::WorkException,
            vec![handle.as_bytes().to_vec(), data.to_vec()],
        )?)
        .await
    }

    pub async fn work_status(&mut self, handle: &str, num: u64, den: u64) -> Result<()> {
        self.send(&Packet::request(
            PacketType::WorkStatus,
            vec![
                handle.as_bytes().to_vec(),
                num.to_string().into_bytes(),
                den.to_string().into_bytes(),
            ],
        )?)
        .await
    }

    pub async fn work_complete(&mut self, handle: &str, result: &[u8]) -> Result<()> {
        self.send(&Packet::request(
            PacketType::WorkComplete,
            vec![handle.as_bytes().to_vec(), result.to_vec()],
        )?)
        .await
    }

    pub async fn work_fail(&mut self, handle: &str) -> Result<()> {
        self.send(&Packet::request(
            PacketType::WorkFail,
            vec![handle.as_bytes().to_vec()],
        )?)
        .await
    }
}
