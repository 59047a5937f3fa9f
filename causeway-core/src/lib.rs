//! Causeway protocol types
//!
//! Shared, runtime-agnostic building blocks of the Causeway VPN server:
//! session identity, the access-authority contract, API-key derivation, and
//! the packet utility routines used around the data plane. The running
//! server lives in `causeway-engine`.

mod access;
mod crypto;
mod error;
pub mod packet;
mod session;

pub use access::{
    AccessAuthority, AccessUsage, ClientInfo, EndpointPair, HelloRequest, SessionCreateParams,
    SessionErrorCode, SessionExtraData, SessionRequest, SessionResponse, SessionResponseEx,
    Traffic, DEFAULT_PROTOCOL_VERSION,
};
pub use crypto::{
    derive_api_key, derive_key, DERIVED_KEY_LEN, SERVER_SECRET_LEN, TUNNEL_HTTP_PASS_CHECK,
};
pub use error::{Error, Result};
pub use session::{SessionId, SessionKey, SESSION_KEY_LEN};
