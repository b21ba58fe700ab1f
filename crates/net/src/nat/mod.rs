//! Client side gateway negotiation for inbound port mappings.

pub mod pcp;
pub mod pmp;

use std::net::Ipv4Addr;

use crate::error::WireError;

/// Gateways listen for both protocols on this port.
pub const GATEWAY_PORT: u16 = 5351;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Udp,
    Tcp,
}

impl Protocol {
    /// IANA protocol number, as carried by PCP.
    pub fn number(self) -> u8 {
        match self {
            Protocol::Udp => 17,
            Protocol::Tcp => 6,
        }
    }

    pub fn from_number(number: u8) -> Result<Self, WireError> {
        match number {
            17 => Ok(Protocol::Udp),
            6 => Ok(Protocol::Tcp),
            other => Err(WireError::UnknownProtocol(other)),
        }
    }

    /// PMP encodes the protocol in the mapping opcode.
    pub fn pmp_opcode(self) -> u8 {
        match self {
            Protocol::Udp => 1,
            Protocol::Tcp => 2,
        }
    }

    pub fn from_pmp_opcode(opcode: u8) -> Result<Self, WireError> {
        match opcode {
            1 => Ok(Protocol::Udp),
            2 => Ok(Protocol::Tcp),
            other => Err(WireError::UnknownOpcode(other)),
        }
    }
}

impl std::str::FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "udp" => Ok(Protocol::Udp),
            "tcp" => Ok(Protocol::Tcp),
            other => Err(format!("unknown protocol '{}'", other)),
        }
    }
}

pub(crate) fn read_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([buf[offset], buf[offset + 1]])
}

pub(crate) fn read_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    ])
}

pub(crate) fn read_ipv4(buf: &[u8], offset: usize) -> Ipv4Addr {
    Ipv4Addr::new(
        buf[offset],
        buf[offset + 1],
        buf[offset + 2],
        buf[offset + 3],
    )
}

pub(crate) fn require_len(buf: &[u8], expected: usize) -> Result<(), WireError> {
    if buf.len() < expected {
        Err(WireError::TooShort {
            expected,
            actual: buf.len(),
        })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_numbers() {
        assert_eq!(Protocol::Udp.number(), 17);
        assert_eq!(Protocol::Tcp.number(), 6);
        assert_eq!(Protocol::from_number(6), Ok(Protocol::Tcp));
        assert_eq!(
            Protocol::from_number(1),
            Err(WireError::UnknownProtocol(1))
        );
    }

    #[test]
    fn test_protocol_pmp_opcodes() {
        assert_eq!(Protocol::Udp.pmp_opcode(), 1);
        assert_eq!(Protocol::from_pmp_opcode(2), Ok(Protocol::Tcp));
        assert!(Protocol::from_pmp_opcode(0).is_err());
    }

    #[test]
    fn test_protocol_from_str() {
        assert_eq!("UDP".parse::<Protocol>(), Ok(Protocol::Udp));
        assert_eq!("tcp".parse::<Protocol>(), Ok(Protocol::Tcp));
        assert!("sctp".parse::<Protocol>().is_err());
    }
}
