//! Socket construction for proxy workers
//!
//! Proxy workers bind ephemeral UDP sockets through a [`SocketFactory`] so
//! that hosts can interpose policy (bind address selection, marks, vrf) or
//! tests can count allocations. The default factory builds sockets with
//! `socket2` and hands them to tokio.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

/// Address family of a proxied flow
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressFamily {
    Ipv4,
    Ipv6,
}

impl AddressFamily {
    /// The family of a socket address
    pub fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Ipv4,
            SocketAddr::V6(_) => AddressFamily::Ipv6,
        }
    }

    /// The wildcard bind address with an ephemeral port for this family
    pub fn unspecified(&self) -> SocketAddr {
        match self {
            AddressFamily::Ipv4 => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            AddressFamily::Ipv6 => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::Ipv4 => write!(f, "IPv4"),
            AddressFamily::Ipv6 => write!(f, "IPv6"),
        }
    }
}

/// Factory for the UDP sockets proxy workers own
#[async_trait]
pub trait SocketFactory: Send + Sync {
    /// Bind a UDP socket to an ephemeral local endpoint of the given family
    async fn bind_udp(&self, family: AddressFamily) -> io::Result<UdpSocket>;
}

/// Default socket factory binding wildcard ephemeral sockets
pub struct SystemSocketFactory;

#[async_trait]
impl SocketFactory for SystemSocketFactory {
    async fn bind_udp(&self, family: AddressFamily) -> io::Result<UdpSocket> {
        let domain = match family {
            AddressFamily::Ipv4 => Domain::IPV4,
            AddressFamily::Ipv6 => Domain::IPV6,
        };

        let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_nonblocking(true)?;
        socket.bind(&family.unspecified().into())?;

        let std_socket: std::net::UdpSocket = socket.into();
        UdpSocket::from_std(std_socket)
    }
}

/// Forbid IP fragmentation on a socket's outgoing datagrams.
///
/// Linux only; elsewhere the no-fragment hint is best effort and this is a
/// no-op.
#[cfg(target_os = "linux")]
pub fn set_dont_fragment(socket: &UdpSocket) -> io::Result<()> {
    use std::os::fd::AsRawFd;

    let local = socket.local_addr()?;
    let (level, option) = if local.is_ipv4() {
        (libc::IPPROTO_IP, libc::IP_MTU_DISCOVER)
    } else {
        (libc::IPPROTO_IPV6, libc::IPV6_MTU_DISCOVER)
    };
    let optval: libc::c_int = libc::IP_PMTUDISC_DO;
    // SAFETY: the fd is owned by `socket` and outlives the call; optval is a
    // valid c_int for the option.
    let ret = unsafe {
        libc::setsockopt(
            socket.as_raw_fd(),
            level,
            option,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn set_dont_fragment(_socket: &UdpSocket) -> io::Result<()> {
    Ok(())
}
