use std::io;
use std::net::{Ipv4Addr, SocketAddrV4, UdpSocket};

use crate::address::Address;
use crate::error::NetError;

/// Non-blocking IPv4 datagram socket. The OS handle is released on drop.
#[derive(Debug)]
pub struct Socket {
    socket: UdpSocket,
    local_addr: Address,
}

impl Socket {
    /// Binds `0.0.0.0:port`; port 0 picks an ephemeral port.
    pub fn open(port: u16) -> Result<Self, NetError> {
        let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port))
            .map_err(|source| NetError::Bind { port, source })?;
        socket.set_nonblocking(true)?;

        let local_addr = match socket.local_addr()? {
            std::net::SocketAddr::V4(addr) => Address::from(addr),
            std::net::SocketAddr::V6(addr) => Address::from_u32(0, addr.port()),
        };

        log::debug!("udp socket bound on {}", local_addr);

        Ok(Self { socket, local_addr })
    }

    pub fn local_addr(&self) -> Address {
        self.local_addr
    }

    /// Returns true when the whole datagram was handed to the OS.
    pub fn send(&self, destination: Address, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }

        match self
            .socket
            .send_to(data, SocketAddrV4::from(destination))
        {
            Ok(sent) => sent == data.len(),
            Err(e) => {
                log::debug!("send to {} failed: {}", destination, e);
                false
            }
        }
    }

    /// Pops one queued datagram. `None` when nothing is queued.
    pub fn receive(&self, buf: &mut [u8]) -> Option<(usize, Address)> {
        match self.socket.recv_from(buf) {
            Ok((0, _)) => None,
            Ok((size, from)) => match Address::try_from(from) {
                Ok(sender) => Some((size, sender)),
                Err(_) => None,
            },
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => None,
            Err(e) => {
                // ICMP unreachable surfaces here on some platforms
                log::debug!("receive on {} failed: {}", self.local_addr, e);
                None
            }
        }
    }

    pub fn join_multicast(&self, group: Ipv4Addr) -> io::Result<()> {
        self.socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
    }

    pub fn leave_multicast(&self, group: Ipv4Addr) -> io::Result<()> {
        self.socket
            .leave_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
    }
}

/// Local IPv4 address the OS would route through to reach `remote`.
/// No packet is sent.
pub fn local_ip_towards(remote: Address) -> Ipv4Addr {
    let probe = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect(SocketAddrV4::from(remote))?;
            socket.local_addr()
        });

    match probe {
        Ok(std::net::SocketAddr::V4(addr)) => *addr.ip(),
        _ => Ipv4Addr::UNSPECIFIED,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_receive_is_non_blocking() {
        let socket = Socket::open(0).unwrap();
        let mut buf = [0u8; 64];
        assert!(socket.receive(&mut buf).is_none());
        assert_ne!(socket.local_addr().port(), 0);
    }

    #[test]
    fn test_send_receive_loopback() {
        let a = Socket::open(0).unwrap();
        let b = Socket::open(0).unwrap();
        let b_addr = Address::new(127, 0, 0, 1, b.local_addr().port());

        assert!(a.send(b_addr, b"ping"));
        assert!(!a.send(b_addr, &[]));

        let mut buf = [0u8; 64];
        let mut received = None;
        for _ in 0..200 {
            received = b.receive(&mut buf);
            if received.is_some() {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }

        let (size, sender) = received.expect("no datagram received");
        assert_eq!(&buf[..size], b"ping");
        assert_eq!(sender.port(), a.local_addr().port());
    }

    #[test]
    fn test_local_ip_towards_loopback() {
        let ip = local_ip_towards(Address::new(127, 0, 0, 1, 5351));
        assert!(ip.is_loopback());
    }
}
