use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// What to do with jobs a worker was executing when its connection drops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DisconnectPolicy {
    /// Put the job back at the front of its function's queue so another
    /// capable worker picks it up.
    #[default]
    Requeue,
    /// Report the job as failed to every attached submitter.
    FailJob,
}

/// Server configuration, passed explicitly to [`crate::GearmanServer`] at
/// construction. There is no process-wide settings singleton.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the TCP listener binds to.
    pub bind_addr: String,
    /// Infix used when allocating job handles (`H:{prefix}:{seq}`).
    pub handle_prefix: String,
    /// Policy applied to in-flight jobs when their worker disconnects.
    pub disconnect_policy: DisconnectPolicy,
    /// Hard cap on a single packet's argument block, in bytes. Connections
    /// sending larger frames are closed.
    pub max_packet_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:4730".to_string(),
            handle_prefix: "gearbroker".to_string(),
            disconnect_policy: DisconnectPolicy::default(),
            max_packet_size: 1024 * 1024,
        }
    }
}

impl ServerConfig {
    /// Load a configuration from a JSON file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
