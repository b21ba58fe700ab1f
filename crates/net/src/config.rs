use crate::nat::Protocol;
use crate::sequence::DEFAULT_MAX_SEQUENCE;

pub const DEFAULT_PROTOCOL_ID: u32 = 0x1122_3344;
pub const DEFAULT_MAPPING_LIFETIME: u32 = 7200;
pub const PMP_RENEWAL_PORT: u16 = 5350;

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Shared by both peers, folded into every frame checksum.
    pub protocol_id: u32,
    /// Seconds without traffic before a connect attempt fails or a link drops.
    pub timeout: f32,
    pub max_sequence: u32,
    /// Sends with `local_sequence & mask != 0` are never put on the wire.
    pub packet_loss_mask: u32,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            protocol_id: DEFAULT_PROTOCOL_ID,
            timeout: 10.0,
            max_sequence: DEFAULT_MAX_SEQUENCE,
            packet_loss_mask: 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PcpConfig {
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    /// Requested lease in seconds.
    pub lifetime: u32,
    /// MRC. `None` retries forever.
    pub max_retransmit_count: Option<u32>,
    /// MRD in seconds. `None` retries forever.
    pub max_retransmit_duration: Option<u32>,
}

impl Default for PcpConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            internal_port: 0,
            external_port: 0,
            lifetime: DEFAULT_MAPPING_LIFETIME,
            max_retransmit_count: None,
            max_retransmit_duration: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PmpConfig {
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    /// Requested lease in seconds.
    pub lifetime: u32,
    /// Port for unsolicited gateway announcements. `None` disables listening.
    pub renewal_port: Option<u16>,
}

impl Default for PmpConfig {
    fn default() -> Self {
        Self {
            protocol: Protocol::Udp,
            internal_port: 0,
            external_port: 0,
            lifetime: DEFAULT_MAPPING_LIFETIME,
            renewal_port: Some(PMP_RENEWAL_PORT),
        }
    }
}
