//! A single authorized client context
//!
//! A session is created by the manager from an access-authority response
//! and owns the client's data-plane state. The manager only touches the
//! narrow surface here: identity, the response snapshot, activity time,
//! usage sync, and teardown.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use causeway_core::{
    AccessAuthority, EndpointPair, SessionErrorCode, SessionExtraData, SessionId, SessionKey,
    SessionResponse, SessionResponseEx, Traffic,
};

use crate::error::Result;
use crate::proxy::{UdpPayload, UdpProxyPool};

/// An authorized client tunnel context
pub struct Session {
    session_id: SessionId,
    session_key: SessionKey,
    extra_data: SessionExtraData,
    created_time: SystemTime,
    endpoints: EndpointPair,
    response: RwLock<SessionResponse>,
    last_activity: Mutex<Instant>,
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    closed: AtomicBool,
    disposed: AtomicBool,
    access: Arc<dyn AccessAuthority>,
    udp_pool: Arc<UdpProxyPool>,
    owns_pool: bool,
}

impl Session {
    pub(crate) fn new(
        response: &SessionResponseEx,
        endpoints: EndpointPair,
        access: Arc<dyn AccessAuthority>,
        udp_pool: Arc<UdpProxyPool>,
        owns_pool: bool,
    ) -> Result<Arc<Self>> {
        let extra_data = SessionExtraData::from_json(response.extra_data.as_deref())?;
        Ok(Arc::new(Self {
            session_id: response.session_id,
            session_key: response.session_key,
            extra_data,
            created_time: response.created_time,
            endpoints,
            response: RwLock::new(response.response.clone()),
            last_activity: Mutex::new(Instant::now()),
            sent_bytes: AtomicU64::new(0),
            received_bytes: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            access,
            udp_pool,
            owns_pool,
        }))
    }

    pub fn session_id(&self) -> SessionId {
        self.session_id
    }

    pub fn session_key(&self) -> &SessionKey {
        &self.session_key
    }

    pub fn protocol_version(&self) -> i32 {
        self.extra_data.protocol_version
    }

    pub fn created_time(&self) -> SystemTime {
        self.created_time
    }

    pub fn endpoints(&self) -> EndpointPair {
        self.endpoints
    }

    /// Snapshot of the current session response
    pub fn response(&self) -> SessionResponse {
        self.response.read().unwrap().clone()
    }

    /// Snapshot including the session identity, for error reporting
    pub fn response_ex(&self) -> SessionResponseEx {
        SessionResponseEx {
            response: self.response(),
            session_id: self.session_id,
            session_key: self.session_key,
            created_time: self.created_time,
            extra_data: None,
        }
    }

    /// Overwrite the session response unconditionally
    pub(crate) fn set_response(&self, response: SessionResponse) {
        *self.response.write().unwrap() = response;
    }

    /// Merge an authority response into the session: usage always follows
    /// the authority, but a latched error code is never downgraded to Ok.
    fn merge_response(&self, incoming: SessionResponse) {
        let mut response = self.response.write().unwrap();
        if response.error_code.is_ok() {
            response.error_code = incoming.error_code;
            response.error_message = incoming.error_message;
        }
        if incoming.access_usage.is_some() {
            response.access_usage = incoming.access_usage;
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Refresh the activity clock
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether the granted access has expired at `now`
    pub fn is_access_expired(&self, now: SystemTime) -> bool {
        self.response
            .read()
            .unwrap()
            .access_usage
            .as_ref()
            .is_some_and(|usage| usage.is_expired(now))
    }

    /// Record bytes delivered from the Internet toward the client
    pub fn record_received(&self, bytes: u64) {
        self.received_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.touch();
    }

    /// The pool carrying this session's UDP flows
    pub fn udp_pool(&self) -> &Arc<UdpProxyPool> {
        &self.udp_pool
    }

    /// Forward one client UDP datagram outward
    pub async fn send_udp_packet(
        &self,
        source_addr: IpAddr,
        dest_addr: IpAddr,
        payload: UdpPayload<'_>,
        no_fragment: Option<bool>,
    ) -> Result<()> {
        self.touch();
        self.sent_bytes.fetch_add(
            payload.data.map_or(0, |data| data.len() as u64),
            Ordering::Relaxed,
        );
        self.udp_pool
            .send_packet(source_addr, dest_addr, payload, no_fragment)
            .await
    }

    fn drain_usage(&self) -> Traffic {
        Traffic::new(
            self.sent_bytes.swap(0, Ordering::AcqRel),
            self.received_bytes.swap(0, Ordering::AcqRel),
        )
    }

    fn restore_usage(&self, usage: Traffic) {
        self.sent_bytes.fetch_add(usage.sent, Ordering::AcqRel);
        self.received_bytes.fetch_add(usage.received, Ordering::AcqRel);
    }

    /// Report collected usage to the authority and mirror its response.
    ///
    /// When the authority answers with a failure code the session is
    /// disposed; cleanup relies on this to retire expired sessions.
    pub async fn sync(&self) -> Result<()> {
        self.report_usage(false).await
    }

    async fn report_usage(&self, closing: bool) -> Result<()> {
        let usage = self.drain_usage();
        match self
            .access
            .session_add_usage(self.session_id, usage, closing)
            .await
        {
            Ok(response) => {
                let failed = !response.error_code.is_ok();
                self.merge_response(response);
                if failed {
                    log::info!(
                        "session {} retired by authority: {}",
                        self.session_id,
                        self.response()
                    );
                    self.dispose().await;
                }
                Ok(())
            }
            Err(e) => {
                // Keep the sample for the next report
                self.restore_usage(usage);
                Err(e.into())
            }
        }
    }

    /// Cooperative close: flush usage, mark closed, tear down. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        {
            let mut response = self.response.write().unwrap();
            if response.error_code.is_ok() {
                response.error_code = SessionErrorCode::SessionClosed;
                response.error_message = Some("Session closed.".into());
            }
        }
        let result = self.report_usage(true).await;
        self.dispose().await;
        result
    }

    /// Unconditional teardown. Idempotent; never fails.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.owns_pool {
            self.udp_pool.dispose().await;
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
