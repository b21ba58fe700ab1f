use crate::address::Address;
use crate::config::ConnectionConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionState, MAX_PAYLOAD_SIZE};
use crate::error::NetError;
use crate::reliability::ReliabilitySystem;

/// `[sequence][ack][ack_bits]`, big-endian.
pub const RELIABLE_HEADER_SIZE: usize = 12;
pub const MAX_RELIABLE_PAYLOAD_SIZE: usize = MAX_PAYLOAD_SIZE - RELIABLE_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl ReliableHeader {
    pub fn write(&self, buf: &mut [u8; RELIABLE_HEADER_SIZE]) {
        buf[0..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..8].copy_from_slice(&self.ack.to_be_bytes());
        buf[8..12].copy_from_slice(&self.ack_bits.to_be_bytes());
    }

    pub fn read(buf: &[u8]) -> Option<Self> {
        let field = |offset: usize| -> Option<u32> {
            let bytes = buf.get(offset..offset + 4)?;
            Some(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
        };

        Some(Self {
            sequence: field(0)?,
            ack: field(4)?,
            ack_bits: field(8)?,
        })
    }
}

/// A [`Connection`] whose every datagram carries sequence and ack state.
pub struct ReliableConnection {
    connection: Connection,
    reliability: ReliabilitySystem,
    packet_loss_mask: u32,
    send_buffer: Vec<u8>,
    recv_buffer: Vec<u8>,
}

impl ReliableConnection {
    pub fn new(config: ConnectionConfig) -> Self {
        Self {
            connection: Connection::new(config.protocol_id, config.timeout),
            reliability: ReliabilitySystem::new(config.max_sequence),
            packet_loss_mask: config.packet_loss_mask,
            send_buffer: Vec::with_capacity(MAX_PAYLOAD_SIZE),
            recv_buffer: vec![0u8; MAX_PAYLOAD_SIZE],
        }
    }

    pub fn start(&mut self, port: u16) -> Result<(), NetError> {
        self.reliability.reset();
        self.connection.start(port)
    }

    pub fn stop(&mut self) {
        self.reliability.reset();
        self.connection.stop();
    }

    pub fn listen(&mut self) {
        self.reliability.reset();
        self.connection.listen();
    }

    pub fn connect(&mut self, address: Address) {
        self.reliability.reset();
        self.connection.connect(address);
    }

    pub fn send_packet(&mut self, payload: &[u8]) -> Result<(), NetError> {
        if payload.len() > MAX_RELIABLE_PAYLOAD_SIZE {
            return Err(NetError::PacketTooLarge {
                size: payload.len(),
                max: MAX_RELIABLE_PAYLOAD_SIZE,
            });
        }

        if self.reliability.local_sequence() & self.packet_loss_mask != 0 {
            self.reliability.packet_sent(payload.len());
            return Ok(());
        }

        let header = ReliableHeader {
            sequence: self.reliability.local_sequence(),
            ack: self.reliability.remote_sequence(),
            ack_bits: self.reliability.generate_ack_bits(),
        };
        let mut header_bytes = [0u8; RELIABLE_HEADER_SIZE];
        header.write(&mut header_bytes);

        self.send_buffer.clear();
        self.send_buffer.extend_from_slice(&header_bytes);
        self.send_buffer.extend_from_slice(payload);

        self.connection.send_packet(&self.send_buffer)?;
        self.reliability.packet_sent(payload.len());
        Ok(())
    }

    /// Same contract as [`Connection::receive_packet`], minus the header.
    /// Headers numbered outside this link's sequence space are dropped.
    pub fn receive_packet(&mut self, buf: &mut [u8]) -> usize {
        let received = self.connection.receive_packet(&mut self.recv_buffer);
        if received <= RELIABLE_HEADER_SIZE {
            return 0;
        }

        let Some(header) = ReliableHeader::read(&self.recv_buffer[..received]) else {
            return 0;
        };

        let max_sequence = self.reliability.max_sequence();
        if header.sequence > max_sequence || header.ack > max_sequence {
            log::debug!(
                "dropping packet {} (ack {}) outside sequence space 0..={}",
                header.sequence,
                header.ack,
                max_sequence
            );
            return 0;
        }

        let payload = &self.recv_buffer[RELIABLE_HEADER_SIZE..received];
        if payload.len() > buf.len() {
            log::debug!(
                "dropping {} byte payload, receive buffer holds {}",
                payload.len(),
                buf.len()
            );
            return 0;
        }

        self.reliability
            .packet_received(header.sequence, payload.len());
        self.reliability.process_ack(header.ack, header.ack_bits);

        buf[..payload.len()].copy_from_slice(payload);
        payload.len()
    }

    pub fn update(&mut self, dt: f32) {
        let before = self.connection.state();
        self.connection.update(dt);
        let after = self.connection.state();

        let was_live = matches!(
            before,
            ConnectionState::Connecting | ConnectionState::Connected
        );
        let is_down = matches!(
            after,
            ConnectionState::Disconnected | ConnectionState::ConnectFailed
        );
        if was_live && is_down {
            self.reliability.reset();
        }

        self.reliability.update(dt);
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.connection.drain_events()
    }

    pub fn reliability_system(&self) -> &ReliabilitySystem {
        &self.reliability
    }

    pub fn reliability_system_mut(&mut self) -> &mut ReliabilitySystem {
        &mut self.reliability
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn set_packet_loss_mask(&mut self, mask: u32) {
        self.packet_loss_mask = mask;
    }

    pub fn packet_loss_mask(&self) -> u32 {
        self.packet_loss_mask
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.connection.local_addr()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn connecting(&self) -> bool {
        self.connection.connecting()
    }

    pub fn connect_failed(&self) -> bool {
        self.connection.connect_failed()
    }

    pub fn connected(&self) -> bool {
        self.connection.connected()
    }

    pub fn listening(&self) -> bool {
        self.connection.listening()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let header = ReliableHeader {
            sequence: 0x0102_0304,
            ack: 0x0506_0708,
            ack_bits: 0xFFFF_0000,
        };
        let mut buf = [0u8; RELIABLE_HEADER_SIZE];
        header.write(&mut buf);

        assert_eq!(
            buf,
            [1, 2, 3, 4, 5, 6, 7, 8, 0xFF, 0xFF, 0x00, 0x00]
        );
        assert_eq!(ReliableHeader::read(&buf), Some(header));
        assert_eq!(ReliableHeader::read(&buf[..11]), None);
    }

    #[test]
    fn test_masked_sends_are_counted_not_sent() {
        let config = ConnectionConfig {
            packet_loss_mask: 1,
            ..Default::default()
        };
        let mut connection = ReliableConnection::new(config);

        // sequence 0 passes the mask and needs a started socket
        assert!(connection.send_packet(&[0u8; 8]).is_err());
        assert_eq!(connection.reliability_system().sent_packets(), 0);

        connection.reliability_system_mut().packet_sent(8);
        assert!(connection.send_packet(&[0u8; 8]).is_ok());
        assert_eq!(connection.reliability_system().sent_packets(), 2);
        assert_eq!(connection.reliability_system().local_sequence(), 2);
    }

    #[test]
    fn test_connect_failure_resets_reliability() {
        let config = ConnectionConfig {
            timeout: 0.1,
            ..Default::default()
        };
        let mut connection = ReliableConnection::new(config);
        connection.start(0).unwrap();
        connection.connect(Address::new(127, 0, 0, 1, 9));
        connection.reliability_system_mut().packet_sent(8);

        connection.update(0.2);

        assert!(connection.connect_failed());
        assert_eq!(connection.reliability_system().local_sequence(), 0);
        assert_eq!(connection.reliability_system().sent_packets(), 0);
    }
}
