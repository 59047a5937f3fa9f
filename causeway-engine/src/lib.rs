//! Causeway VPN server data plane
//!
//! The engine sits between the tunnel transports (owned by the host) and
//! the access authority (an external service). It tracks client sessions
//! and proxies their UDP flows to the public Internet:
//!
//! - [`SessionManager`]: session lifecycle. Creation, key-authenticated
//!   lookup, recovery, cleanup, heartbeat, disposal.
//! - [`Session`]: one authorized client context with its usage counters
//!   and data-plane state.
//! - [`proxy::UdpProxyPool`]: NAT-style multiplexing of client UDP flows
//!   over a bounded set of worker sockets.
//!
//! The host injects the collaborator seams: an
//! [`AccessAuthority`](causeway_core::AccessAuthority) client, a
//! [`SocketFactory`](socket::SocketFactory), the
//! [`DatagramSink`](proxy::DatagramSink) that pushes inbound datagrams back
//! into client tunnels, and optionally a [`Tracker`](tracker::Tracker) for
//! analytics.

pub mod config;
pub mod error;
pub mod keyed_mutex;
pub mod manager;
pub mod proxy;
pub mod session;
pub mod socket;
pub mod timeout_map;
pub mod tracker;

pub use config::{EngineConfig, SessionConfig, UdpConfig};
pub use error::{Error, Result, ACCESS_ERROR_MESSAGE};
pub use manager::SessionManager;
pub use session::Session;
