//! UDP flow proxying
//!
//! Multiplexes client UDP flows onto a bounded set of proxy sockets. A flow
//! is a `(client source endpoint, destination endpoint)` pair; the pool maps
//! flows onto workers so that each worker holds at most one client per
//! remote destination, which keeps the inbound demux a plain per-worker
//! lookup by remote endpoint.

mod pool;
mod worker;

use std::fmt;
use std::net::SocketAddr;

use async_trait::async_trait;

pub use pool::{UdpProxyPool, DEFAULT_REMOTE_ENDPOINT_TIMEOUT, DEFAULT_UDP_TIMEOUT};
pub use worker::UdpProxyWorker;

/// A proxied flow: where the client sent from, and where it sent to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub source: SocketAddr,
    pub destination: SocketAddr,
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source, self.destination)
    }
}

/// The UDP segment of a client packet handed to the pool
#[derive(Debug, Clone, Copy)]
pub struct UdpPayload<'a> {
    pub source_port: u16,
    pub dest_port: u16,
    /// Datagram body; `None` is transmitted as an empty datagram
    pub data: Option<&'a [u8]>,
}

/// Transport protocol tagged onto endpoint events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportProtocol {
    Udp,
    Tcp,
}

impl fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportProtocol::Udp => write!(f, "UDP"),
            TransportProtocol::Tcp => write!(f, "TCP"),
        }
    }
}

/// Events emitted synchronously from the pool's allocation path
#[derive(Debug, Clone)]
pub enum PoolEvent {
    NewEndpoint {
        protocol: TransportProtocol,
        local: SocketAddr,
        remote: SocketAddr,
        is_new_local: bool,
        is_new_remote: bool,
    },
}

/// Observer for [`PoolEvent`]s; delivery is synchronous, keep it cheap
pub trait PoolEventHandler: Send + Sync {
    fn on_pool_event(&self, event: &PoolEvent);
}

/// Upward callback for inbound proxy datagrams.
///
/// The owning tunnel layer wraps the datagram in an IP/UDP packet addressed
/// from `remote` to `client_source` and pushes it toward the client.
#[async_trait]
pub trait DatagramSink: Send + Sync {
    async fn on_datagram(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        client_source: SocketAddr,
        data: &[u8],
    );
}
