use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// IPv4 host + port. Ordering is by host first, then port.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Address {
    address: u32,
    port: u16,
}

impl Address {
    pub const UNSPECIFIED: Address = Address {
        address: 0,
        port: 0,
    };

    pub const fn new(a: u8, b: u8, c: u8, d: u8, port: u16) -> Self {
        Self {
            address: u32::from_be_bytes([a, b, c, d]),
            port,
        }
    }

    pub const fn from_u32(address: u32, port: u16) -> Self {
        Self { address, port }
    }

    pub fn from_ip(ip: Ipv4Addr, port: u16) -> Self {
        Self {
            address: u32::from(ip),
            port,
        }
    }

    #[inline]
    pub fn address(&self) -> u32 {
        self.address
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn ip(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.address)
    }

    pub fn a(&self) -> u8 {
        (self.address >> 24) as u8
    }

    pub fn b(&self) -> u8 {
        (self.address >> 16) as u8
    }

    pub fn c(&self) -> u8 {
        (self.address >> 8) as u8
    }

    pub fn d(&self) -> u8 {
        self.address as u8
    }

    /// True when no host is set; a connection with this peer cannot send.
    pub fn is_unspecified(&self) -> bool {
        self.address == 0
    }

    pub fn with_port(self, port: u16) -> Self {
        Self { port, ..self }
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}.{}.{}:{}",
            self.a(),
            self.b(),
            self.c(),
            self.d(),
            self.port
        )
    }
}

impl From<SocketAddrV4> for Address {
    fn from(addr: SocketAddrV4) -> Self {
        Self::from_ip(*addr.ip(), addr.port())
    }
}

impl From<Address> for SocketAddrV4 {
    fn from(addr: Address) -> Self {
        SocketAddrV4::new(addr.ip(), addr.port)
    }
}

impl From<Address> for SocketAddr {
    fn from(addr: Address) -> Self {
        SocketAddr::V4(addr.into())
    }
}

impl TryFrom<SocketAddr> for Address {
    type Error = SocketAddr;

    fn try_from(addr: SocketAddr) -> Result<Self, Self::Error> {
        match addr {
            SocketAddr::V4(v4) => Ok(v4.into()),
            SocketAddr::V6(v6) => match v6.ip().to_ipv4_mapped() {
                Some(ip) => Ok(Self::from_ip(ip, v6.port())),
                None => Err(addr),
            },
        }
    }
}
