//! Access authority contract
//!
//! The access authority is the external service that issues session
//! credentials, authorizes session recovery, and accepts usage reports.
//! This module defines the request/response schema and the async trait the
//! server consumes; transport (HTTP, gRPC, in-process) is an implementation
//! concern of the authority client.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::SystemTime;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::session::{SessionId, SessionKey};

/// Protocol version assumed when a session carries no extra data
pub const DEFAULT_PROTOCOL_VERSION: i32 = 3;

/// Error codes returned by the access authority
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionErrorCode {
    #[default]
    Ok,
    GeneralError,
    AccessError,
    SessionError,
    SessionClosed,
    SessionSuppressed,
    Maintenance,
}

impl SessionErrorCode {
    /// Check whether this code represents success
    pub const fn is_ok(&self) -> bool {
        matches!(self, SessionErrorCode::Ok)
    }
}

impl fmt::Display for SessionErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionErrorCode::Ok => write!(f, "ok"),
            SessionErrorCode::GeneralError => write!(f, "general error"),
            SessionErrorCode::AccessError => write!(f, "access error"),
            SessionErrorCode::SessionError => write!(f, "session error"),
            SessionErrorCode::SessionClosed => write!(f, "session closed"),
            SessionErrorCode::SessionSuppressed => write!(f, "session suppressed"),
            SessionErrorCode::Maintenance => write!(f, "maintenance"),
        }
    }
}

/// Byte counters for one direction of accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Traffic {
    /// Bytes sent by the client toward the Internet
    pub sent: u64,
    /// Bytes received from the Internet toward the client
    pub received: u64,
}

impl Traffic {
    /// Create counters from raw values
    pub const fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    /// Total bytes in both directions
    pub const fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }

    /// Accumulate another sample into this one
    pub fn add(&mut self, other: Traffic) {
        self.sent = self.sent.saturating_add(other.sent);
        self.received = self.received.saturating_add(other.received);
    }
}

/// Usage granted to a session by the authority
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccessUsage {
    /// When the access expires; `None` means no expiration
    pub expiration_time: Option<SystemTime>,
    /// Traffic quota in bytes; zero means unlimited
    pub max_traffic: u64,
    /// Traffic consumed in the current cycle
    pub cycle_traffic: Traffic,
}

impl AccessUsage {
    /// Check whether the access has expired at `now`
    pub fn is_expired(&self, now: SystemTime) -> bool {
        self.expiration_time.is_some_and(|t| t < now)
    }
}

/// The mutable per-session snapshot mirrored between the authority and the
/// server. Updated on every usage report.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionResponse {
    pub error_code: SessionErrorCode,
    pub error_message: Option<String>,
    pub access_usage: Option<AccessUsage>,
}

impl SessionResponse {
    /// A successful response with no usage information
    pub fn ok() -> Self {
        Self::default()
    }

    /// A failure response
    pub fn error(code: SessionErrorCode, message: impl Into<String>) -> Self {
        Self {
            error_code: code,
            error_message: Some(message.into()),
            access_usage: None,
        }
    }
}

impl fmt::Display for SessionResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.error_message {
            Some(message) => write!(f, "{}: {}", self.error_code, message),
            None => write!(f, "{}", self.error_code),
        }
    }
}

/// Full response to session creation or recovery
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponseEx {
    #[serde(flatten)]
    pub response: SessionResponse,
    pub session_id: SessionId,
    pub session_key: SessionKey,
    pub created_time: SystemTime,
    /// Opaque serialized blob carried for the session, see [`SessionExtraData`]
    pub extra_data: Option<String>,
}

impl fmt::Display for SessionResponseEx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "session {}: {}", self.session_id, self.response)
    }
}

/// Client identity reported at session creation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: String,
    pub client_version: String,
    pub user_agent: Option<String>,
}

/// Parameters for creating a session with the authority
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionCreateParams {
    pub host_endpoint: SocketAddr,
    pub client_ip: IpAddr,
    pub extra_data: Option<String>,
    pub client_info: ClientInfo,
    pub encrypted_client_id: Vec<u8>,
    pub token_id: String,
}

/// A client's request to create a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelloRequest {
    pub request_id: String,
    pub token_id: String,
    pub client_info: ClientInfo,
    pub encrypted_client_id: Vec<u8>,
    pub extra_data: Option<String>,
}

/// A client's request addressing an existing session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub request_id: String,
    pub session_id: SessionId,
    pub session_key: SessionKey,
}

/// The local/remote endpoints a request arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointPair {
    /// The server endpoint the client connected to
    pub local: SocketAddr,
    /// The client endpoint as seen by the server
    pub remote: SocketAddr,
}

impl EndpointPair {
    pub const fn new(local: SocketAddr, remote: SocketAddr) -> Self {
        Self { local, remote }
    }
}

/// Session-scoped data serialized through the authority as an opaque blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionExtraData {
    #[serde(default = "default_protocol_version")]
    pub protocol_version: i32,
}

fn default_protocol_version() -> i32 {
    DEFAULT_PROTOCOL_VERSION
}

impl Default for SessionExtraData {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION,
        }
    }
}

impl SessionExtraData {
    /// Deserialize from the authority blob, defaulting when absent
    pub fn from_json(json: Option<&str>) -> Result<Self> {
        match json {
            Some(json) => Ok(serde_json::from_str(json)?),
            None => Ok(Self::default()),
        }
    }

    /// Serialize back into the authority blob form
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Client interface to the access authority.
///
/// Implementations are transport-specific; every method call is a
/// suspension point on the request path and honors the caller's deadline.
#[async_trait]
pub trait AccessAuthority: Send + Sync {
    /// Create a new session for an authenticated client
    async fn session_create(&self, params: SessionCreateParams) -> Result<SessionResponseEx>;

    /// Fetch an existing session, authorizing recovery after a restart
    async fn session_get(
        &self,
        session_id: SessionId,
        host_endpoint: SocketAddr,
        client_ip: IpAddr,
    ) -> Result<SessionResponseEx>;

    /// Report traffic usage; `closing` marks the final report of a session
    async fn session_add_usage(
        &self,
        session_id: SessionId,
        usage: Traffic,
        closing: bool,
    ) -> Result<SessionResponse>;
}
