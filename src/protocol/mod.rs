pub mod codec;
pub mod packet;

pub use codec::{encode, read_packet};
pub use packet::{Packet, PacketMagic, PacketType};
