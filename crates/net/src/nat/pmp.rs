//! NAT Port Mapping Protocol messages and a mapping session.

use std::net::Ipv4Addr;

use super::{Protocol, read_ipv4, read_u16, read_u32, require_len};
use crate::address::Address;
use crate::config::{DEFAULT_MAPPING_LIFETIME, PmpConfig};
use crate::error::{NetError, WireError};
use crate::socket::Socket;

pub const PMP_VERSION: u8 = 0;
pub const OP_EXTERNAL_ADDRESS: u8 = 0;
pub const RESPONSE_FLAG: u8 = 128;
pub const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 0, 1);

pub const EXTERNAL_ADDRESS_REQUEST_SIZE: usize = 2;
pub const EXTERNAL_ADDRESS_RESPONSE_SIZE: usize = 12;
pub const MAPPING_REQUEST_SIZE: usize = 12;
pub const MAPPING_RESPONSE_SIZE: usize = 16;
pub const HEADER_RESPONSE_SIZE: usize = 8;

const INITIAL_PERIOD_MS: u64 = 250;
const PHASE_DEADLINE_MS: u64 = 64_000;
/// Slack allowed between an announced epoch and the extrapolated one.
const EPOCH_TOLERANCE_S: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    Refused = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl TryFrom<u16> for ResultCode {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ResultCode::Success),
            1 => Ok(ResultCode::UnsupportedVersion),
            2 => Ok(ResultCode::Refused),
            3 => Ok(ResultCode::NetworkFailure),
            4 => Ok(ResultCode::OutOfResources),
            5 => Ok(ResultCode::UnsupportedOpcode),
            other => Err(WireError::UnknownResultCode(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ExternalAddressRequest;

impl ExternalAddressRequest {
    pub fn encode(&self) -> [u8; EXTERNAL_ADDRESS_REQUEST_SIZE] {
        [PMP_VERSION, OP_EXTERNAL_ADDRESS]
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        require_len(buf, EXTERNAL_ADDRESS_REQUEST_SIZE)?;
        check_version(buf)?;
        match buf[1] {
            OP_EXTERNAL_ADDRESS => Ok(Self),
            op if op & RESPONSE_FLAG != 0 => Err(WireError::UnexpectedDirection),
            op => Err(WireError::UnknownOpcode(op)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingRequest {
    pub protocol: Protocol,
    pub internal_port: u16,
    pub external_port: u16,
    pub lifetime: u32,
}

impl MappingRequest {
    pub fn encode(&self) -> [u8; MAPPING_REQUEST_SIZE] {
        let mut buf = [0u8; MAPPING_REQUEST_SIZE];
        buf[0] = PMP_VERSION;
        buf[1] = self.protocol.pmp_opcode();
        buf[4..6].copy_from_slice(&self.internal_port.to_be_bytes());
        buf[6..8].copy_from_slice(&self.external_port.to_be_bytes());
        buf[8..12].copy_from_slice(&self.lifetime.to_be_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        require_len(buf, MAPPING_REQUEST_SIZE)?;
        check_version(buf)?;
        if buf[1] & RESPONSE_FLAG != 0 {
            return Err(WireError::UnexpectedDirection);
        }

        Ok(Self {
            protocol: Protocol::from_pmp_opcode(buf[1])?,
            internal_port: read_u16(buf, 4),
            external_port: read_u16(buf, 6),
            lifetime: read_u32(buf, 8),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExternalAddressResponse {
    pub result_code: ResultCode,
    /// Seconds since the gateway's mapping table was initialised.
    pub epoch: u32,
    pub external_ip: Ipv4Addr,
}

impl ExternalAddressResponse {
    pub fn encode(&self) -> [u8; EXTERNAL_ADDRESS_RESPONSE_SIZE] {
        let mut buf = [0u8; EXTERNAL_ADDRESS_RESPONSE_SIZE];
        buf[0] = PMP_VERSION;
        buf[1] = RESPONSE_FLAG | OP_EXTERNAL_ADDRESS;
        buf[2..4].copy_from_slice(&(self.result_code as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_be_bytes());
        buf[8..12].copy_from_slice(&self.external_ip.octets());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MappingResponse {
    pub protocol: Protocol,
    pub result_code: ResultCode,
    pub epoch: u32,
    pub internal_port: u16,
    pub external_port: u16,
    pub lifetime: u32,
}

impl MappingResponse {
    pub fn encode(&self) -> [u8; MAPPING_RESPONSE_SIZE] {
        let mut buf = [0u8; MAPPING_RESPONSE_SIZE];
        buf[0] = PMP_VERSION;
        buf[1] = RESPONSE_FLAG | self.protocol.pmp_opcode();
        buf[2..4].copy_from_slice(&(self.result_code as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_be_bytes());
        buf[8..10].copy_from_slice(&self.internal_port.to_be_bytes());
        buf[10..12].copy_from_slice(&self.external_port.to_be_bytes());
        buf[12..16].copy_from_slice(&self.lifetime.to_be_bytes());
        buf
    }
}

/// Common response prefix. Gateways send it alone for errors such as an
/// unsupported version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderResponse {
    /// Request opcode the gateway answers, without the response flag.
    pub opcode: u8,
    pub result_code: ResultCode,
    pub epoch: u32,
}

impl HeaderResponse {
    pub fn encode(&self) -> [u8; HEADER_RESPONSE_SIZE] {
        let mut buf = [0u8; HEADER_RESPONSE_SIZE];
        buf[0] = PMP_VERSION;
        buf[1] = RESPONSE_FLAG | self.opcode;
        buf[2..4].copy_from_slice(&(self.result_code as u16).to_be_bytes());
        buf[4..8].copy_from_slice(&self.epoch.to_be_bytes());
        buf
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpResponse {
    ExternalAddress(ExternalAddressResponse),
    Mapping(MappingResponse),
    Header(HeaderResponse),
}

impl PmpResponse {
    pub fn decode(buf: &[u8]) -> Result<Self, WireError> {
        require_len(buf, HEADER_RESPONSE_SIZE)?;
        check_version(buf)?;
        if buf[1] & RESPONSE_FLAG == 0 {
            return Err(WireError::UnexpectedDirection);
        }

        let opcode = buf[1] & !RESPONSE_FLAG;
        let result_code = ResultCode::try_from(read_u16(buf, 2))?;
        let epoch = read_u32(buf, 4);

        if opcode == OP_EXTERNAL_ADDRESS && buf.len() >= EXTERNAL_ADDRESS_RESPONSE_SIZE {
            return Ok(PmpResponse::ExternalAddress(ExternalAddressResponse {
                result_code,
                epoch,
                external_ip: read_ipv4(buf, 8),
            }));
        }

        if opcode != OP_EXTERNAL_ADDRESS && buf.len() >= MAPPING_RESPONSE_SIZE {
            return Ok(PmpResponse::Mapping(MappingResponse {
                protocol: Protocol::from_pmp_opcode(opcode)?,
                result_code,
                epoch,
                internal_port: read_u16(buf, 8),
                external_port: read_u16(buf, 10),
                lifetime: read_u32(buf, 12),
            }));
        }

        Ok(PmpResponse::Header(HeaderResponse {
            opcode,
            result_code,
            epoch,
        }))
    }

    pub fn opcode(&self) -> u8 {
        match self {
            PmpResponse::ExternalAddress(_) => OP_EXTERNAL_ADDRESS,
            PmpResponse::Mapping(mapping) => mapping.protocol.pmp_opcode(),
            PmpResponse::Header(header) => header.opcode,
        }
    }

    pub fn result_code(&self) -> ResultCode {
        match self {
            PmpResponse::ExternalAddress(r) => r.result_code,
            PmpResponse::Mapping(r) => r.result_code,
            PmpResponse::Header(r) => r.result_code,
        }
    }
}

fn check_version(buf: &[u8]) -> Result<(), WireError> {
    if buf[0] == PMP_VERSION {
        Ok(())
    } else {
        Err(WireError::BadVersion(buf[0]))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmpState {
    RetrieveExternalIp,
    CreatePortMapping,
    IdleMapped,
    IdleRetrieveExternalIpError,
    IdleCreatePortMappingError,
    IdleUnsupported,
}

impl PmpState {
    pub fn is_idle(self) -> bool {
        !matches!(
            self,
            PmpState::RetrieveExternalIp | PmpState::CreatePortMapping
        )
    }
}

/// Learns the gateway's external address, then keeps one port mapping alive.
pub struct PmpSession {
    config: PmpConfig,
    gateway: Address,
    socket: Socket,
    renewal_socket: Option<Socket>,
    renewal_opened: bool,

    state: PmpState,
    result_code: ResultCode,

    external_ip: Ipv4Addr,
    epoch: u32,
    external_port: u16,
    granted_lifetime: u32,

    main_timer: u64,
    request_timer: u64,
    deadline_timer: u64,
    period: u64,
    mapped_time: u64,

    recv_buffer: [u8; MAPPING_RESPONSE_SIZE * 4],
}

impl PmpSession {
    pub fn new(gateway: Address, config: PmpConfig) -> Result<Self, NetError> {
        let socket = Socket::open(0)?;

        log::info!(
            "pmp session for {:?} port {} via {}",
            config.protocol,
            config.internal_port,
            gateway
        );

        Ok(Self {
            external_port: config.external_port,
            granted_lifetime: config.lifetime,
            config,
            gateway,
            socket,
            renewal_socket: None,
            renewal_opened: false,
            state: PmpState::RetrieveExternalIp,
            result_code: ResultCode::Success,
            external_ip: Ipv4Addr::UNSPECIFIED,
            epoch: 0,
            main_timer: 0,
            request_timer: 0,
            deadline_timer: PHASE_DEADLINE_MS,
            period: INITIAL_PERIOD_MS,
            mapped_time: 0,
            recv_buffer: [0u8; MAPPING_RESPONSE_SIZE * 4],
        })
    }

    pub fn update(&mut self, dt_ms: u32) {
        self.main_timer += dt_ms as u64;

        match self.state {
            PmpState::RetrieveExternalIp | PmpState::CreatePortMapping => {
                if self.main_timer >= self.deadline_timer {
                    log::warn!("pmp gateway {} did not answer in time", self.gateway);
                    self.state = PmpState::IdleUnsupported;
                    return;
                }

                if self.main_timer >= self.request_timer {
                    self.send_request();
                    self.request_timer = self.main_timer + self.period;
                    self.period *= 2;
                }

                self.receive_responses();
            }
            PmpState::IdleMapped => self.update_mapped(),
            _ => self.drain_socket(),
        }
    }

    fn send_request(&mut self) {
        let sent = match self.state {
            PmpState::RetrieveExternalIp => self
                .socket
                .send(self.gateway, &ExternalAddressRequest.encode()),
            _ => {
                let request = MappingRequest {
                    protocol: self.config.protocol,
                    internal_port: self.config.internal_port,
                    external_port: self.config.external_port,
                    lifetime: self.config.lifetime,
                };
                self.socket.send(self.gateway, &request.encode())
            }
        };

        if !sent {
            log::debug!("pmp request to {} was not sent", self.gateway);
        }
    }

    fn receive_responses(&mut self) {
        while !self.state.is_idle() {
            let Some((size, sender)) = self.socket.receive(&mut self.recv_buffer) else {
                return;
            };
            if sender != self.gateway {
                continue;
            }

            match PmpResponse::decode(&self.recv_buffer[..size]) {
                Ok(response) => self.handle_response(response),
                Err(e) => log::debug!("ignoring pmp message from {}: {}", sender, e),
            }
        }
    }

    fn handle_response(&mut self, response: PmpResponse) {
        let expected_opcode = match self.state {
            PmpState::RetrieveExternalIp => OP_EXTERNAL_ADDRESS,
            _ => self.config.protocol.pmp_opcode(),
        };
        if response.opcode() != expected_opcode {
            return;
        }
        if let PmpResponse::Mapping(r) = &response {
            if r.internal_port != self.config.internal_port {
                return;
            }
        }

        let result_code = response.result_code();
        if result_code != ResultCode::Success {
            self.fail(result_code);
            return;
        }

        match response {
            PmpResponse::ExternalAddress(r) => {
                self.external_ip = r.external_ip;
                self.epoch = r.epoch;
                log::info!("pmp gateway reports external ip {}", self.external_ip);
                self.begin_port_mapping();
            }
            PmpResponse::Mapping(r) => {
                self.epoch = r.epoch;
                self.external_port = r.external_port;
                self.granted_lifetime = match (r.lifetime, self.config.lifetime) {
                    (0, 0) => DEFAULT_MAPPING_LIFETIME,
                    (0, requested) => requested,
                    (granted, _) => granted,
                };
                self.mapped_time = self.main_timer;
                self.state = PmpState::IdleMapped;
                log::info!(
                    "pmp mapped {} -> {}:{} for {}s",
                    self.config.internal_port,
                    self.external_ip,
                    self.external_port,
                    self.granted_lifetime
                );
            }
            _ => {}
        }
    }

    fn fail(&mut self, result_code: ResultCode) {
        self.result_code = result_code;
        self.state = match (result_code, self.state) {
            (ResultCode::UnsupportedVersion, _) => PmpState::IdleUnsupported,
            (_, PmpState::RetrieveExternalIp) => PmpState::IdleRetrieveExternalIpError,
            _ => PmpState::IdleCreatePortMappingError,
        };
        log::warn!(
            "pmp gateway {} answered {:?}, session is now {:?}",
            self.gateway,
            result_code,
            self.state
        );
    }

    fn begin_port_mapping(&mut self) {
        self.state = PmpState::CreatePortMapping;
        self.period = INITIAL_PERIOD_MS;
        self.request_timer = self.main_timer;
        self.deadline_timer = self.main_timer + PHASE_DEADLINE_MS;
    }

    fn update_mapped(&mut self) {
        self.open_renewal_socket();
        self.drain_socket();

        let elapsed_ms = self.main_timer - self.mapped_time;

        if self.renewal_announcement_requires_remap(elapsed_ms / 1000) {
            self.begin_port_mapping();
            return;
        }

        if elapsed_ms > self.granted_lifetime as u64 * 1000 * 7 / 8 {
            log::info!("renewing pmp mapping on port {}", self.external_port);
            self.begin_port_mapping();
        }
    }

    fn renewal_announcement_requires_remap(&mut self, elapsed_s: u64) -> bool {
        let Some(renewal_socket) = self.renewal_socket.as_ref() else {
            return false;
        };

        let mut remap = false;
        while let Some((size, sender)) = renewal_socket.receive(&mut self.recv_buffer) {
            if sender.ip() != self.gateway.ip() {
                continue;
            }
            let Ok(PmpResponse::ExternalAddress(announcement)) =
                PmpResponse::decode(&self.recv_buffer[..size])
            else {
                continue;
            };
            if announcement.result_code != ResultCode::Success {
                continue;
            }

            let expected_epoch = self.epoch as u64 + elapsed_s * 7 / 8;
            if announcement.external_ip != self.external_ip {
                log::info!(
                    "pmp external ip changed {} -> {}",
                    self.external_ip,
                    announcement.external_ip
                );
                self.external_ip = announcement.external_ip;
                remap = true;
            } else if (announcement.epoch as u64) + EPOCH_TOLERANCE_S < expected_epoch {
                log::info!(
                    "pmp gateway epoch went back from {} to {}, remapping",
                    expected_epoch,
                    announcement.epoch
                );
                remap = true;
            }
        }
        remap
    }

    fn open_renewal_socket(&mut self) {
        if self.renewal_opened {
            return;
        }
        self.renewal_opened = true;

        let Some(port) = self.config.renewal_port else {
            return;
        };

        match Socket::open(port) {
            Ok(socket) => {
                if let Err(e) = socket.join_multicast(MULTICAST_GROUP) {
                    log::warn!("cannot join {} for pmp announcements: {}", MULTICAST_GROUP, e);
                }
                self.renewal_socket = Some(socket);
            }
            Err(e) => log::warn!("pmp announcements unavailable: {}", e),
        }
    }

    fn drain_socket(&mut self) {
        while self.socket.receive(&mut self.recv_buffer).is_some() {}
    }

    pub fn state(&self) -> PmpState {
        self.state
    }

    pub fn result_code(&self) -> ResultCode {
        self.result_code
    }

    pub fn local_addr(&self) -> Address {
        self.socket.local_addr()
    }

    pub fn gateway(&self) -> Address {
        self.gateway
    }

    pub fn external_ip(&self) -> Ipv4Addr {
        self.external_ip
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn external_port(&self) -> u16 {
        self.external_port
    }

    pub fn lifetime(&self) -> u32 {
        self.granted_lifetime
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_external_address_request() {
        let bytes = ExternalAddressRequest.encode();
        assert_eq!(bytes, [0, 0]);
        assert_eq!(ExternalAddressRequest::decode(&bytes), Ok(ExternalAddressRequest));
        assert_eq!(
            ExternalAddressRequest::decode(&[0, 128]),
            Err(WireError::UnexpectedDirection)
        );
    }

    #[test]
    fn test_mapping_request() {
        let request = MappingRequest {
            protocol: Protocol::Udp,
            internal_port: 30000,
            external_port: 30005,
            lifetime: 7200,
        };
        let bytes = request.encode();

        assert_eq!(bytes[..4], [0, 1, 0, 0]);
        assert_eq!(MappingRequest::decode(&bytes), Ok(request));

        let tcp = MappingRequest {
            protocol: Protocol::Tcp,
            ..request
        };
        assert_eq!(tcp.encode()[1], 2);
    }

    #[test]
    fn test_external_address_response() {
        let response = ExternalAddressResponse {
            result_code: ResultCode::Success,
            epoch: 1000,
            external_ip: Ipv4Addr::from(12345u32),
        };
        let bytes = response.encode();

        assert_eq!(bytes[1], 128);
        assert_eq!(&bytes[8..12], &12345u32.to_be_bytes());
        assert_eq!(
            PmpResponse::decode(&bytes),
            Ok(PmpResponse::ExternalAddress(response))
        );
    }

    #[test]
    fn test_mapping_response() {
        let response = MappingResponse {
            protocol: Protocol::Tcp,
            result_code: ResultCode::Success,
            epoch: 1000,
            internal_port: 30000,
            external_port: 30005,
            lifetime: 7200,
        };
        let bytes = response.encode();

        assert_eq!(bytes[1], 130);
        assert_eq!(
            PmpResponse::decode(&bytes),
            Ok(PmpResponse::Mapping(response))
        );
    }

    #[test]
    fn test_header_response() {
        let response = HeaderResponse {
            opcode: OP_EXTERNAL_ADDRESS,
            result_code: ResultCode::Refused,
            epoch: 5,
        };
        let bytes = response.encode();
        assert_eq!(bytes.len(), 8);

        let decoded = PmpResponse::decode(&bytes).unwrap();
        assert_eq!(decoded, PmpResponse::Header(response));
        assert_eq!(decoded.result_code(), ResultCode::Refused);
        assert_eq!(decoded.opcode(), OP_EXTERNAL_ADDRESS);
    }

    #[test]
    fn test_malformed_responses() {
        assert!(matches!(
            PmpResponse::decode(&[0, 128, 0]),
            Err(WireError::TooShort { .. })
        ));
        assert_eq!(
            PmpResponse::decode(&[1, 128, 0, 0, 0, 0, 0, 0]),
            Err(WireError::BadVersion(1))
        );
        assert_eq!(
            PmpResponse::decode(&[0, 0, 0, 0, 0, 0, 0, 0]),
            Err(WireError::UnexpectedDirection)
        );
        assert_eq!(
            PmpResponse::decode(&[0, 128, 0, 9, 0, 0, 0, 0]),
            Err(WireError::UnknownResultCode(9))
        );
    }

    #[test]
    fn test_deadline_moves_to_unsupported() {
        let config = PmpConfig {
            renewal_port: None,
            ..Default::default()
        };
        let mut session = PmpSession::new(Address::new(127, 0, 0, 1, 9), config).unwrap();
        assert_eq!(session.state(), PmpState::RetrieveExternalIp);

        session.update(64_000);
        assert_eq!(session.state(), PmpState::IdleUnsupported);

        session.update(100_000_000);
        assert_eq!(session.state(), PmpState::IdleUnsupported);
    }

    #[test]
    fn test_retry_period_doubles() {
        let config = PmpConfig {
            renewal_port: None,
            ..Default::default()
        };
        let mut session = PmpSession::new(Address::new(127, 0, 0, 1, 9), config).unwrap();

        session.update(0);
        assert_eq!(session.request_timer, 250);
        session.update(250);
        assert_eq!(session.request_timer, 750);
        session.update(100);
        assert_eq!(session.request_timer, 750);
        session.update(400);
        assert_eq!(session.request_timer, 1750);
    }
}
