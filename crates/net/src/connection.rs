use std::collections::VecDeque;

use crate::address::Address;
use crate::error::NetError;
use crate::socket::Socket;

pub const MAX_PACKET_SIZE: usize = 1200;
/// Protocol id on the way in, checksum on the wire.
pub const FRAME_HEADER_SIZE: usize = 4;
pub const MAX_PAYLOAD_SIZE: usize = MAX_PACKET_SIZE - FRAME_HEADER_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Listening,
    Connecting,
    ConnectFailed,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    None,
    Client,
    Server,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Timeout,
    Stopped,
    /// `listen` or `connect` was called on a live link.
    Replaced,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Timeout => "timed out",
            DisconnectReason::Stopped => "stopped",
            DisconnectReason::Replaced => "replaced",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        peer: Address,
    },
    Disconnected {
        peer: Address,
        reason: DisconnectReason,
    },
}

/// One-peer datagram link with a checksummed frame and a liveness timeout.
pub struct Connection {
    protocol_id: u32,
    timeout: f32,
    socket: Option<Socket>,
    state: ConnectionState,
    mode: Mode,
    address: Address,
    timeout_accumulator: f32,
    pending_events: VecDeque<ConnectionEvent>,
    recv_buffer: [u8; MAX_PACKET_SIZE],
}

impl Connection {
    pub fn new(protocol_id: u32, timeout: f32) -> Self {
        Self {
            protocol_id,
            timeout,
            socket: None,
            state: ConnectionState::Disconnected,
            mode: Mode::None,
            address: Address::UNSPECIFIED,
            timeout_accumulator: 0.0,
            pending_events: VecDeque::new(),
            recv_buffer: [0u8; MAX_PACKET_SIZE],
        }
    }

    pub fn start(&mut self, port: u16) -> Result<(), NetError> {
        if self.socket.is_some() {
            self.stop();
        }

        let socket = Socket::open(port)?;
        log::info!("connection started on {}", socket.local_addr());
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        let was_connected = self.connected();
        let peer = self.address;

        self.clear_data();
        self.socket = None;

        if was_connected {
            self.on_disconnect(peer, DisconnectReason::Stopped);
        }
    }

    pub fn listen(&mut self) {
        log::info!("server listening for connection");

        self.disconnect_replaced();
        self.clear_data();
        self.mode = Mode::Server;
        self.state = ConnectionState::Listening;
    }

    pub fn connect(&mut self, address: Address) {
        log::info!("client connecting to {}", address);

        self.disconnect_replaced();
        self.clear_data();
        self.mode = Mode::Client;
        self.state = ConnectionState::Connecting;
        self.address = address;
    }

    pub fn update(&mut self, dt: f32) {
        if self.socket.is_none() {
            return;
        }

        self.timeout_accumulator += dt;
        if self.timeout_accumulator <= self.timeout {
            return;
        }

        match self.state {
            ConnectionState::Connecting => {
                log::warn!("connect to {} timed out", self.address);
                self.clear_data();
                self.state = ConnectionState::ConnectFailed;
            }
            ConnectionState::Connected => {
                let peer = self.address;
                log::warn!("connection to {} timed out", peer);
                self.clear_data();
                self.on_disconnect(peer, DisconnectReason::Timeout);
            }
            _ => {}
        }
    }

    pub fn send_packet(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let socket = self.socket.as_ref().ok_or(NetError::NotStarted)?;
        if self.address.is_unspecified() {
            return Err(NetError::NoPeer);
        }
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(NetError::PacketTooLarge {
                size: payload.len(),
                max: MAX_PAYLOAD_SIZE,
            });
        }

        let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        frame.extend_from_slice(&self.protocol_id.to_be_bytes());
        frame.extend_from_slice(payload);

        let checksum = crc32fast::hash(&frame);
        frame[..FRAME_HEADER_SIZE].copy_from_slice(&checksum.to_be_bytes());

        if socket.send(self.address, &frame) {
            Ok(())
        } else {
            Err(NetError::SendFailed)
        }
    }

    /// Copies the next valid payload into `buf` and returns its length, or 0
    /// when nothing acceptable is queued. A payload longer than `buf` is
    /// dropped, never truncated.
    pub fn receive_packet(&mut self, buf: &mut [u8]) -> usize {
        let Some(socket) = self.socket.as_ref() else {
            return 0;
        };
        let Some((size, sender)) = socket.receive(&mut self.recv_buffer) else {
            return 0;
        };

        if size <= FRAME_HEADER_SIZE {
            log::debug!("dropping {} byte frame from {}", size, sender);
            return 0;
        }

        let frame = &mut self.recv_buffer[..size];
        let mut received_checksum = [0u8; FRAME_HEADER_SIZE];
        received_checksum.copy_from_slice(&frame[..FRAME_HEADER_SIZE]);
        frame[..FRAME_HEADER_SIZE].copy_from_slice(&self.protocol_id.to_be_bytes());

        if crc32fast::hash(frame) != u32::from_be_bytes(received_checksum) {
            log::debug!("checksum mismatch on frame from {}", sender);
            return 0;
        }

        let payload_size = size - FRAME_HEADER_SIZE;
        if payload_size > buf.len() {
            log::debug!(
                "dropping {} byte payload from {}, receive buffer holds {}",
                payload_size,
                sender,
                buf.len()
            );
            return 0;
        }

        if self.mode == Mode::Server && !self.connected() {
            log::info!("server accepts connection from {}", sender);
            self.state = ConnectionState::Connected;
            self.address = sender;
            self.pending_events
                .push_back(ConnectionEvent::Connected { peer: sender });
        }

        if sender != self.address {
            return 0;
        }

        if self.mode == Mode::Client && self.state == ConnectionState::Connecting {
            log::info!("client completes connection with {}", sender);
            self.state = ConnectionState::Connected;
            self.pending_events
                .push_back(ConnectionEvent::Connected { peer: sender });
        }
        self.timeout_accumulator = 0.0;

        buf[..payload_size].copy_from_slice(&self.recv_buffer[FRAME_HEADER_SIZE..size]);
        payload_size
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.pending_events.drain(..)
    }

    pub fn running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_addr(&self) -> Option<Address> {
        self.socket.as_ref().map(Socket::local_addr)
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn protocol_id(&self) -> u32 {
        self.protocol_id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn connecting(&self) -> bool {
        self.state == ConnectionState::Connecting
    }

    pub fn connect_failed(&self) -> bool {
        self.state == ConnectionState::ConnectFailed
    }

    pub fn connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn listening(&self) -> bool {
        self.state == ConnectionState::Listening
    }

    fn disconnect_replaced(&mut self) {
        if self.connected() {
            let peer = self.address;
            self.on_disconnect(peer, DisconnectReason::Replaced);
        }
    }

    fn on_disconnect(&mut self, peer: Address, reason: DisconnectReason) {
        log::info!("disconnected from {} ({})", peer, reason.as_str());
        self.pending_events
            .push_back(ConnectionEvent::Disconnected { peer, reason });
    }

    fn clear_data(&mut self) {
        self.state = ConnectionState::Disconnected;
        self.timeout_accumulator = 0.0;
        self.address = Address::UNSPECIFIED;
    }
}
