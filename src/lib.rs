pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod server;

pub use client::Client;
pub use config::{DisconnectPolicy, ServerConfig};
pub use error::{GearmanError, Result};
pub use protocol::packet::{Packet, PacketMagic, PacketType};
pub use server::{GearmanServer, JobPriority, PersistenceHook};
