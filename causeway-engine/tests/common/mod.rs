//! Shared mock collaborators for engine integration tests
#![allow(dead_code)]

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use tokio::sync::Notify;

use causeway_core::{
    AccessAuthority, ClientInfo, EndpointPair, Error as CoreError, HelloRequest,
    Result as CoreResult, SessionCreateParams, SessionErrorCode, SessionId, SessionKey,
    SessionRequest, SessionResponse, SessionResponseEx, Traffic,
};
use causeway_engine::proxy::{DatagramSink, PoolEvent, PoolEventHandler};
use causeway_engine::tracker::{TrackEvent, Tracker};

/// What the mock authority answers with
#[derive(Clone)]
pub enum MockReply {
    Response(SessionResponseEx),
    Failure(String),
}

/// Scripted access authority with call counters
pub struct MockAccessAuthority {
    create_reply: Mutex<Option<MockReply>>,
    get_reply: Mutex<Option<MockReply>>,
    get_delay: Mutex<Option<Duration>>,
    usage_reply: Mutex<SessionResponse>,
    usage_reports: Mutex<Vec<(SessionId, Traffic, bool)>>,
    pub create_calls: AtomicUsize,
    pub get_calls: AtomicUsize,
    pub usage_calls: AtomicUsize,
}

impl MockAccessAuthority {
    pub fn new() -> Self {
        Self {
            create_reply: Mutex::new(None),
            get_reply: Mutex::new(None),
            get_delay: Mutex::new(None),
            usage_reply: Mutex::new(SessionResponse::ok()),
            usage_reports: Mutex::new(Vec::new()),
            create_calls: AtomicUsize::new(0),
            get_calls: AtomicUsize::new(0),
            usage_calls: AtomicUsize::new(0),
        }
    }

    pub fn set_create_reply(&self, reply: MockReply) {
        *self.create_reply.lock().unwrap() = Some(reply);
    }

    pub fn set_get_reply(&self, reply: MockReply) {
        *self.get_reply.lock().unwrap() = Some(reply);
    }

    pub fn set_get_delay(&self, delay: Duration) {
        *self.get_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_usage_reply(&self, reply: SessionResponse) {
        *self.usage_reply.lock().unwrap() = reply;
    }

    /// All usage reports seen, in order
    pub fn usage_reports(&self) -> Vec<(SessionId, Traffic, bool)> {
        self.usage_reports.lock().unwrap().clone()
    }

    /// Number of closing usage reports seen
    pub fn closing_reports(&self) -> usize {
        self.usage_reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(_, _, closing)| *closing)
            .count()
    }

    fn resolve(reply: Option<MockReply>) -> CoreResult<SessionResponseEx> {
        match reply {
            Some(MockReply::Response(response)) => Ok(response),
            Some(MockReply::Failure(message)) => Err(CoreError::Authority(message)),
            None => Err(CoreError::Authority("no reply configured".into())),
        }
    }
}

#[async_trait]
impl AccessAuthority for MockAccessAuthority {
    async fn session_create(&self, _params: SessionCreateParams) -> CoreResult<SessionResponseEx> {
        self.create_calls.fetch_add(1, Ordering::SeqCst);
        Self::resolve(self.create_reply.lock().unwrap().clone())
    }

    async fn session_get(
        &self,
        _session_id: SessionId,
        _host_endpoint: SocketAddr,
        _client_ip: IpAddr,
    ) -> CoreResult<SessionResponseEx> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *self.get_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Self::resolve(self.get_reply.lock().unwrap().clone())
    }

    async fn session_add_usage(
        &self,
        session_id: SessionId,
        usage: Traffic,
        closing: bool,
    ) -> CoreResult<SessionResponse> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        self.usage_reports
            .lock()
            .unwrap()
            .push((session_id, usage, closing));
        Ok(self.usage_reply.lock().unwrap().clone())
    }
}

/// One inbound datagram delivered through the pool
#[derive(Debug, Clone)]
pub struct ReceivedDatagram {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub client_source: SocketAddr,
    pub data: Vec<u8>,
}

/// Sink capturing every delivered datagram
pub struct CaptureSink {
    datagrams: Mutex<Vec<ReceivedDatagram>>,
    notify: Notify,
}

impl CaptureSink {
    pub fn new() -> Self {
        Self {
            datagrams: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }

    pub fn received(&self) -> Vec<ReceivedDatagram> {
        self.datagrams.lock().unwrap().clone()
    }

    /// Wait until at least `count` datagrams have arrived
    pub async fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.datagrams.lock().unwrap().len() >= count {
                return true;
            }
            let notified = self.notify.notified();
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.datagrams.lock().unwrap().len() >= count;
            }
        }
    }
}

#[async_trait]
impl DatagramSink for CaptureSink {
    async fn on_datagram(
        &self,
        local: SocketAddr,
        remote: SocketAddr,
        client_source: SocketAddr,
        data: &[u8],
    ) {
        self.datagrams.lock().unwrap().push(ReceivedDatagram {
            local,
            remote,
            client_source,
            data: data.to_vec(),
        });
        self.notify.notify_waiters();
    }
}

/// Tracker capturing emitted events
pub struct CaptureTracker {
    events: Mutex<Vec<TrackEvent>>,
}

impl CaptureTracker {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<TrackEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, name: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| event.name == name)
            .count()
    }
}

#[async_trait]
impl Tracker for CaptureTracker {
    async fn track(&self, event: TrackEvent) -> causeway_engine::Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Pool event handler capturing endpoint events
pub struct CaptureEvents {
    events: Mutex<Vec<PoolEvent>>,
}

impl CaptureEvents {
    pub fn new() -> Self {
        Self {
            events: Mutex::new(Vec::new()),
        }
    }

    pub fn events(&self) -> Vec<PoolEvent> {
        self.events.lock().unwrap().clone()
    }
}

impl PoolEventHandler for CaptureEvents {
    fn on_pool_event(&self, event: &PoolEvent) {
        self.events.lock().unwrap().push(event.clone());
    }
}

pub const TEST_KEY: SessionKey = SessionKey::new([
    0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, 0x0D, 0x0E, 0x0F,
    0x10,
]);

/// A successful authority response for the given identity
pub fn ok_response(session_id: u64, session_key: SessionKey) -> SessionResponseEx {
    SessionResponseEx {
        response: SessionResponse::ok(),
        session_id: SessionId::new(session_id),
        session_key,
        created_time: SystemTime::now(),
        extra_data: None,
    }
}

pub fn error_response(
    session_id: u64,
    code: SessionErrorCode,
    message: &str,
) -> SessionResponseEx {
    SessionResponseEx {
        response: SessionResponse::error(code, message),
        session_id: SessionId::new(session_id),
        session_key: TEST_KEY,
        created_time: SystemTime::now(),
        extra_data: None,
    }
}

pub fn hello_request() -> HelloRequest {
    HelloRequest {
        request_id: "req-1".into(),
        token_id: "token-1".into(),
        client_info: ClientInfo {
            client_id: "client-1".into(),
            client_version: "1.2.3".into(),
            user_agent: Some("test-agent".into()),
        },
        encrypted_client_id: vec![0xAB; 16],
        extra_data: None,
    }
}

pub fn session_request(session_id: u64, session_key: SessionKey) -> SessionRequest {
    SessionRequest {
        request_id: "req-2".into(),
        session_id: SessionId::new(session_id),
        session_key,
    }
}

pub fn endpoints() -> EndpointPair {
    EndpointPair::new(
        "10.0.0.1:443".parse().unwrap(),
        "203.0.113.5:50000".parse().unwrap(),
    )
}
