pub mod address;
pub mod clock;
pub mod config;
pub mod connection;
pub mod error;
pub mod nat;
pub mod queue;
pub mod reliability;
pub mod reliable;
pub mod sequence;
pub mod socket;
pub mod stats;

pub use address::Address;
pub use clock::Clock;
pub use config::{ConnectionConfig, PcpConfig, PmpConfig};
pub use connection::{
    Connection, ConnectionEvent, ConnectionState, DisconnectReason, MAX_PACKET_SIZE, Mode,
};
pub use error::{NetError, WireError};
pub use nat::Protocol;
pub use nat::pcp::{PcpSession, PcpState};
pub use nat::pmp::{PmpSession, PmpState};
pub use queue::{PacketQueue, PacketRecord};
pub use reliability::ReliabilitySystem;
pub use reliable::{MAX_RELIABLE_PAYLOAD_SIZE, ReliableConnection, ReliableHeader};
pub use sequence::{bit_index_for_sequence, sequence_more_recent};
pub use socket::{Socket, local_ip_towards};
pub use stats::LinkStats;
