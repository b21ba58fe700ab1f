//! Port Control Protocol (version 2) messages and a MAP session.

use std::net::Ipv4Addr;

use rand::Rng;

use super::{Protocol, read_ipv4, read_u16, read_u32, require_len};
use crate::address::Address;
use crate::config::PcpConfig;
use crate::error::{NetError, WireError};
use crate::socket::{Socket, local_ip_towards};

pub const PCP_VERSION: u8 = 2;
pub const HEADER_SIZE: usize = 24;
pub const MAP_BODY_SIZE: usize = 36;
pub const PEER_BODY_SIZE: usize = 56;
pub const MAX_MESSAGE_SIZE: usize = 1100;

const RESPONSE_FLAG: u8 = 0x80;
const NONCE_SIZE: usize = 12;

/// Initial retransmission time, seconds.
const IRT: f32 = 3.0;
/// Maximum retransmission time, seconds.
const MRT: f32 = 1024.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    Announce = 0,
    Map = 1,
    Peer = 2,
}

impl TryFrom<u8> for Opcode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Announce),
            1 => Ok(Opcode::Map),
            2 => Ok(Opcode::Peer),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    MalformedRequest = 3,
    UnsupportedOpcode = 4,
    UnsupportedOption = 5,
    NetworkFailure = 6,
    NoResources = 7,
    UnsupportedProtocol = 8,
    UserExceededQuota = 9,
    CannotProvideExternal = 10,
    AddressMismatch = 11,
    ExcessiveRemotePeers = 12,
}

impl TryFrom<u8> for ResultCode {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use ResultCode::*;
        Ok(match value {
            0 => Success,
            1 => UnsupportedVersion,
            2 => NotAuthorized,
            3 => MalformedRequest,
            4 => UnsupportedOpcode,
            5 => UnsupportedOption,
            6 => NetworkFailure,
            7 => NoResources,
            8 => UnsupportedProtocol,
            9 => UserExceededQuota,
            10 => CannotProvideExternal,
            11 => AddressMismatch,
            12 => ExcessiveRemotePeers,
            other => return Err(WireError::UnknownResultCode(other as u16)),
        })
    }
}

/// Opaque per-mapping token echoed back by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Nonce(pub [u8; NONCE_SIZE]);

impl Nonce {
    pub fn random() -> Self {
        let mut bytes = [0u8; NONCE_SIZE];
        rand::thread_rng().fill(&mut bytes[..]);
        Self(bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapBody {
    pub nonce: Nonce,
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub external_address: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerBody {
    pub map: MapBody,
    pub remote_port: u16,
    pub remote_address: Ipv4Addr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Body {
    Announce,
    Map(MapBody),
    Peer(PeerBody),
}

impl Body {
    pub fn opcode(&self) -> Opcode {
        match self {
            Body::Announce => Opcode::Announce,
            Body::Map(_) => Opcode::Map,
            Body::Peer(_) => Opcode::Peer,
        }
    }

    fn encoded_len(&self) -> usize {
        match self {
            Body::Announce => 0,
            Body::Map(_) => MAP_BODY_SIZE,
            Body::Peer(_) => PEER_BODY_SIZE,
        }
    }

    fn write(&self, out: &mut Vec<u8>) {
        match self {
            Body::Announce => {}
            Body::Map(map) => write_map(map, out),
            Body::Peer(peer) => {
                write_map(&peer.map, out);
                out.extend_from_slice(&peer.remote_port.to_be_bytes());
                out.extend_from_slice(&[0, 0]);
                write_mapped_ipv4(peer.remote_address, out);
            }
        }
    }

    fn read(opcode: Opcode, body: &[u8]) -> Result<Self, WireError> {
        match opcode {
            Opcode::Announce => Ok(Body::Announce),
            Opcode::Map => {
                require_len(body, MAP_BODY_SIZE)?;
                Ok(Body::Map(read_map(body)?))
            }
            Opcode::Peer => {
                require_len(body, PEER_BODY_SIZE)?;
                Ok(Body::Peer(PeerBody {
                    map: read_map(body)?,
                    remote_port: read_u16(body, 36),
                    remote_address: read_ipv4(body, 52),
                }))
            }
        }
    }
}

fn write_map(map: &MapBody, out: &mut Vec<u8>) {
    out.extend_from_slice(&map.nonce.0);
    out.push(map.protocol.number());
    out.extend_from_slice(&[0, 0, 0]);
    out.extend_from_slice(&map.internal_port.to_be_bytes());
    out.extend_from_slice(&map.external_port.to_be_bytes());
    write_mapped_ipv4(map.external_address, out);
}

fn read_map(body: &[u8]) -> Result<MapBody, WireError> {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce.copy_from_slice(&body[..NONCE_SIZE]);

    Ok(MapBody {
        nonce: Nonce(nonce),
        protocol: Protocol::from_number(body[12])?,
        internal_port: read_u16(body, 16),
        external_port: read_u16(body, 18),
        external_address: read_ipv4(body, 32),
    })
}

/// `::ffff:a.b.c.d`
fn write_mapped_ipv4(ip: Ipv4Addr, out: &mut Vec<u8>) {
    out.extend_from_slice(&[0u8; 10]);
    out.extend_from_slice(&[0xFF, 0xFF]);
    out.extend_from_slice(&ip.octets());
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpRequest {
    pub lifetime: u32,
    pub client_address: Ipv4Addr,
    pub body: Body,
}

impl PcpRequest {
    pub fn announce(client_address: Ipv4Addr) -> Self {
        Self {
            lifetime: 0,
            client_address,
            body: Body::Announce,
        }
    }

    pub fn map(
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        client_address: Ipv4Addr,
        nonce: Nonce,
    ) -> Self {
        Self {
            lifetime,
            client_address,
            body: Body::Map(MapBody {
                nonce,
                protocol,
                internal_port,
                external_port,
                external_address: Ipv4Addr::UNSPECIFIED,
            }),
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn peer(
        protocol: Protocol,
        internal_port: u16,
        external_port: u16,
        lifetime: u32,
        client_address: Ipv4Addr,
        external_address: Ipv4Addr,
        remote_port: u16,
        remote_address: Ipv4Addr,
        nonce: Nonce,
    ) -> Self {
        Self {
            lifetime,
            client_address,
            body: Body::Peer(PeerBody {
                map: MapBody {
                    nonce,
                    protocol,
                    internal_port,
                    external_port,
                    external_address,
                },
                remote_port,
                remote_address,
            }),
        }
    }

    /// Suggested external address for MAP and PEER requests.
    pub fn with_external_address(mut self, address: Ipv4Addr) -> Self {
        match &mut self.body {
            Body::Announce => {}
            Body::Map(map) => map.external_address = address,
            Body::Peer(peer) => peer.map.external_address = address,
        }
        self
    }

    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.encoded_len());
        out.push(PCP_VERSION);
        out.push(self.opcode() as u8);
        out.extend_from_slice(&[0, 0]);
        out.extend_from_slice(&self.lifetime.to_be_bytes());
        write_mapped_ipv4(self.client_address, &mut out);
        self.body.write(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        require_len(buf, HEADER_SIZE)?;
        if buf[0] != PCP_VERSION {
            return Err(WireError::BadVersion(buf[0]));
        }
        if buf[1] & RESPONSE_FLAG != 0 {
            return Err(WireError::UnexpectedDirection);
        }

        let opcode = Opcode::try_from(buf[1] & !RESPONSE_FLAG)?;
        Ok(Self {
            lifetime: read_u32(buf, 4),
            client_address: read_ipv4(buf, 20),
            body: Body::read(opcode, &buf[HEADER_SIZE..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcpResponse {
    pub result_code: ResultCode,
    pub lifetime: u32,
    /// Server epoch time, seconds.
    pub epoch: u32,
    pub body: Body,
}

impl PcpResponse {
    pub fn announce(result_code: ResultCode, epoch: u32) -> Self {
        Self {
            result_code,
            lifetime: 0,
            epoch,
            body: Body::Announce,
        }
    }

    pub fn map(result_code: ResultCode, lifetime: u32, epoch: u32, body: MapBody) -> Self {
        Self {
            result_code,
            lifetime,
            epoch,
            body: Body::Map(body),
        }
    }

    pub fn peer(result_code: ResultCode, lifetime: u32, epoch: u32, body: PeerBody) -> Self {
        Self {
            result_code,
            lifetime,
            epoch,
            body: Body::Peer(body),
        }
    }

    pub fn opcode(&self) -> Opcode {
        self.body.opcode()
    }

    pub fn nonce(&self) -> Option<Nonce> {
        match &self.body {
            Body::Announce => None,
            Body::Map(map) => Some(map.nonce),
            Body::Peer(peer) => Some(peer.map.nonce),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.body.encoded_len());
        out.push(PCP_VERSION);
        out.push(RESPONSE_FLAG | self.opcode() as u8);
        out.push(0);
        out.push(self.result_code as u8);
        out.extend_from_slice(&self.lifetime.to_be_bytes());
        out.extend_from_slice(&self.epoch.to_be_bytes());
        out.extend_from_slice(&[0u8; 12]);
        self.body.write(&mut out);
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        require_len(buf, HEADER_SIZE)?;
        if buf[0] != PCP_VERSION {
            return Err(WireError::BadVersion(buf[0]));
        }
        if buf[1] & RESPONSE_FLAG == 0 {
            return Err(WireError::UnexpectedDirection);
        }

        let opcode = Opcode::try_from(buf[1] & !RESPONSE_FLAG)?;
        Ok(Self {
            result_code: ResultCode::try_from(buf[3])?,
            lifetime: read_u32(buf, 4),
            epoch: read_u32(buf, 8),
            body: Body::read(opcode, &buf[HEADER_SIZE..])?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcpState {
    RequestMapping,
    IdleMapped,
    IdleFailed,
}

/// Keeps one MAP mapping alive against a PCP server. Driven by `update`.
pub struct PcpSession {
    config: PcpConfig,
    server: Address,
    socket: Socket,
    client_ip: Ipv4Addr,
    nonce: Nonce,

    state: PcpState,
    result_code: ResultCode,

    main_timer: u64,
    request_timer: u64,
    request_started: u64,
    rt: f32,
    request_counter: u32,

    external_address: Ipv4Addr,
    external_port: u16,
    granted_lifetime: u32,
    epoch: u32,
    mapped_time: u64,

    recv_buffer: [u8; MAX_MESSAGE_SIZE],
}

impl PcpSession {
    pub fn new(server: Address, config: PcpConfig) -> Result<Self, NetError> {
        let socket = Socket::open(0)?;
        let client_ip = local_ip_towards(server);

        log::info!(
            "pcp session for {:?} port {} via {} (client ip {})",
            config.protocol,
            config.internal_port,
            server,
            client_ip
        );

        Ok(Self {
            external_port: config.external_port,
            granted_lifetime: config.lifetime,
            config,
            server,
            socket,
            client_ip,
            nonce: Nonce::random(),
            state: PcpState::RequestMapping,
            result_code: ResultCode::Success,
            main_timer: 0,
            request_timer: 0,
            request_started: 0,
            rt: initial_rt(),
            request_counter: 0,
            external_address: Ipv4Addr::UNSPECIFIED,
            epoch: 0,
            mapped_time: 0,
            recv_buffer: [0u8; MAX_MESSAGE_SIZE],
        })
    }

    pub fn update(&mut self, dt_ms: u32) {
        self.main_timer += dt_ms as u64;

        match self.state {
            PcpState::RequestMapping => {
                if self.main_timer >= self.request_timer {
                    if self.retransmit_exhausted() {
                        log::warn!(
                            "pcp server {} did not answer after {} requests",
                            self.server,
                            self.request_counter
                        );
                        self.state = PcpState::IdleFailed;
                        return;
                    }
                    self.send_map_request();
                }
                self.receive_responses();
            }
            PcpState::IdleMapped => {
                self.drain_socket();

                let lifetime_ms = self.granted_lifetime as u64 * 1000;
                if self.main_timer - self.mapped_time > lifetime_ms * 5 / 8 {
                    log::info!("refreshing pcp mapping {}", self.external_address);
                    self.rt = initial_rt();
                    self.request_timer = self.main_timer;
                    self.request_started = self.main_timer;
                    self.request_counter = 0;
                    self.state = PcpState::RequestMapping;
                }
            }
            PcpState::IdleFailed => {
                self.drain_socket();
            }
        }
    }

    fn retransmit_exhausted(&self) -> bool {
        let count_exceeded = self
            .config
            .max_retransmit_count
            .is_some_and(|mrc| self.request_counter >= mrc);
        let duration_exceeded = self
            .config
            .max_retransmit_duration
            .is_some_and(|mrd| self.main_timer - self.request_started >= mrd as u64 * 1000);
        count_exceeded || duration_exceeded
    }

    fn send_map_request(&mut self) {
        let request = PcpRequest::map(
            self.config.protocol,
            self.config.internal_port,
            self.config.external_port,
            self.config.lifetime,
            self.client_ip,
            self.nonce,
        )
        .with_external_address(self.external_address);

        if !self.socket.send(self.server, &request.encode()) {
            log::debug!("pcp request to {} was not sent", self.server);
        }

        self.request_counter += 1;
        self.request_timer += (self.rt * 1000.0) as u64;
        self.rt = next_rt(self.rt);
    }

    fn receive_responses(&mut self) {
        while self.state == PcpState::RequestMapping {
            let Some((size, sender)) = self.socket.receive(&mut self.recv_buffer) else {
                return;
            };
            if sender != self.server {
                continue;
            }

            let response = match PcpResponse::decode(&self.recv_buffer[..size]) {
                Ok(response) => response,
                Err(e) => {
                    log::debug!("ignoring pcp message from {}: {}", sender, e);
                    continue;
                }
            };

            let Body::Map(map) = response.body else {
                continue;
            };
            if map.nonce != self.nonce {
                continue;
            }

            if response.result_code == ResultCode::Success {
                self.external_address = map.external_address;
                self.external_port = map.external_port;
                if response.lifetime > 0 {
                    self.granted_lifetime = response.lifetime;
                }
                self.epoch = response.epoch;
                self.mapped_time = self.main_timer;
                self.state = PcpState::IdleMapped;
                log::info!(
                    "pcp mapped {} -> {}:{} for {}s",
                    self.config.internal_port,
                    self.external_address,
                    self.external_port,
                    self.granted_lifetime
                );
            } else {
                self.result_code = response.result_code;
                self.state = PcpState::IdleFailed;
                log::warn!("pcp server refused mapping: {:?}", response.result_code);
            }
        }
    }

    fn drain_socket(&mut self) {
        while self.socket.receive(&mut self.recv_buffer).is_some() {}
    }

    pub fn state(&self) -> PcpState {
        self.state
    }

    pub fn result_code(&self) -> ResultCode {
        self.result_code
    }

    pub fn local_addr(&self) -> Address {
        self.socket.local_addr()
    }

    pub fn server(&self) -> Address {
        self.server
    }

    pub fn nonce(&self) -> Nonce {
        self.nonce
    }

    pub fn external_address(&self) -> Ipv4Addr {
        self.external_address
    }

    pub fn external_port(&self) -> u16 {
        self.external_port
    }

    pub fn lifetime(&self) -> u32 {
        self.granted_lifetime
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn request_count(&self) -> u32 {
        self.request_counter
    }
}

fn jitter() -> f32 {
    rand::thread_rng().gen_range(-0.1f32..=0.1)
}

fn initial_rt() -> f32 {
    (1.0 + jitter()) * IRT
}

fn next_rt(rt: f32) -> f32 {
    (1.0 + jitter()) * (2.0 * rt).min(MRT)
}
