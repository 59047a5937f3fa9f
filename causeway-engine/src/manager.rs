//! Session manager
//!
//! Owns the set of live sessions: creates them against the access
//! authority, authenticates requests by (session id, session key), recovers
//! sessions lost from memory, and drives periodic cleanup and heartbeat.
//! Many request handlers call in concurrently; the session map is the only
//! shared structure and all mutations go through its lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::{Instant, SystemTime};

use rand::Rng;
use tokio::sync::{broadcast, watch, Mutex, RwLock};

use causeway_core::{
    derive_api_key, AccessAuthority, EndpointPair, HelloRequest, SessionCreateParams,
    SessionErrorCode, SessionId, SessionRequest, SessionResponse, SessionResponseEx,
    DERIVED_KEY_LEN, SERVER_SECRET_LEN,
};

use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::keyed_mutex::KeyedMutex;
use crate::proxy::{DatagramSink, UdpProxyPool};
use crate::session::Session;
use crate::socket::SocketFactory;
use crate::tracker::{TrackEvent, Tracker};

struct SecretState {
    server_secret: Vec<u8>,
    api_key: [u8; DERIVED_KEY_LEN],
}

/// Process-wide owner of all client sessions
pub struct SessionManager {
    access: Arc<dyn AccessAuthority>,
    socket_factory: Arc<dyn SocketFactory>,
    sink: Arc<dyn DatagramSink>,
    tracker: Option<Arc<dyn Tracker>>,
    config: EngineConfig,
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    /// One server-wide pool when configured; otherwise sessions own theirs
    shared_pool: Option<Arc<UdpProxyPool>>,
    secret: StdRwLock<SecretState>,
    recover_locks: KeyedMutex<SessionId>,
    last_heartbeat: Mutex<Option<Instant>>,
    disposal: Mutex<Option<watch::Receiver<bool>>>,
    disposed: AtomicBool,
    job_shutdown: StdMutex<Option<broadcast::Sender<()>>>,
}

impl SessionManager {
    pub fn new(
        access: Arc<dyn AccessAuthority>,
        socket_factory: Arc<dyn SocketFactory>,
        sink: Arc<dyn DatagramSink>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;

        let shared_pool = config.udp.shared_pool.then(|| {
            let pool = UdpProxyPool::new(
                socket_factory.clone(),
                sink.clone(),
                config.udp.worker_max_count,
            );
            pool.set_udp_timeout(config.udp.udp_timeout());
            Arc::new(pool)
        });

        let mut server_secret = vec![0u8; SERVER_SECRET_LEN];
        rand::thread_rng().fill(server_secret.as_mut_slice());
        let api_key = derive_api_key(&server_secret);

        Ok(Self {
            access,
            socket_factory,
            sink,
            tracker: None,
            config,
            sessions: RwLock::new(HashMap::new()),
            shared_pool,
            secret: StdRwLock::new(SecretState {
                server_secret,
                api_key,
            }),
            recover_locks: KeyedMutex::new(),
            last_heartbeat: Mutex::new(None),
            disposal: Mutex::new(None),
            disposed: AtomicBool::new(false),
            job_shutdown: StdMutex::new(None),
        })
    }

    /// Set the analytics tracker
    pub fn with_tracker(mut self, tracker: Arc<dyn Tracker>) -> Self {
        self.tracker = Some(tracker);
        self
    }

    /// The server version reported in analytics
    pub fn server_version(&self) -> &str {
        &self.config.session.server_version
    }

    /// The current server secret
    pub fn server_secret(&self) -> Vec<u8> {
        self.secret.read().unwrap().server_secret.clone()
    }

    /// Replace the server secret, recomputing the derived API key with it
    pub fn set_server_secret(&self, server_secret: Vec<u8>) {
        let api_key = derive_api_key(&server_secret);
        *self.secret.write().unwrap() = SecretState {
            server_secret,
            api_key,
        };
    }

    /// The API key derived from the current server secret
    pub fn api_key(&self) -> [u8; DERIVED_KEY_LEN] {
        self.secret.read().unwrap().api_key
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }
        Ok(())
    }

    /// Create a session for a client greeting the server.
    ///
    /// An `AccessError` from the authority is answered with a generic
    /// unauthorized error; the authority's detail stays server-side.
    pub async fn create_session(
        &self,
        hello: &HelloRequest,
        endpoints: EndpointPair,
    ) -> Result<SessionResponseEx> {
        self.ensure_not_disposed()?;

        let params = SessionCreateParams {
            host_endpoint: endpoints.local,
            client_ip: endpoints.remote.ip(),
            extra_data: hello.extra_data.clone(),
            client_info: hello.client_info.clone(),
            encrypted_client_id: hello.encrypted_client_id.clone(),
            token_id: hello.token_id.clone(),
        };
        let response = self.access.session_create(params).await?;

        match response.response.error_code {
            SessionErrorCode::AccessError => {
                log::info!(
                    "access denied for token {}: {}",
                    hello.token_id,
                    response.response
                );
                return Err(Error::unauthorized_generic());
            }
            SessionErrorCode::Ok => {}
            _ => return Err(Error::session(response, Some(hello.request_id.clone()))),
        }

        self.create_session_internal(&response, endpoints, Some(&hello.request_id))
            .await?;
        self.track_new_session(&hello.client_info.client_version);
        Ok(response)
    }

    /// Materialize a session from an authority response and install it
    async fn create_session_internal(
        &self,
        response: &SessionResponseEx,
        endpoints: EndpointPair,
        request_id: Option<&str>,
    ) -> Result<Arc<Session>> {
        let (pool, owns_pool) = match &self.shared_pool {
            Some(pool) => (pool.clone(), false),
            None => {
                let pool = UdpProxyPool::new(
                    self.socket_factory.clone(),
                    self.sink.clone(),
                    self.config.udp.worker_max_count,
                );
                pool.set_udp_timeout(self.config.udp.udp_timeout());
                (Arc::new(pool), true)
            }
        };
        let session = Session::new(response, endpoints, self.access.clone(), pool, owns_pool)?;

        let inserted = {
            let mut sessions = self.sessions.write().await;
            if sessions.contains_key(&response.session_id) {
                false
            } else {
                sessions.insert(response.session_id, session.clone());
                true
            }
        };

        if !inserted {
            // The authority must never hand out a live id twice
            session.set_response(SessionResponse::error(
                SessionErrorCode::SessionError,
                "Could not add session to collection.",
            ));
            session.dispose().await;
            let mut failed = response.clone();
            failed.response = session.response();
            return Err(Error::session(failed, request_id.map(str::to_string)));
        }

        log::info!(
            "session {} created for {}",
            response.session_id,
            endpoints.remote
        );
        Ok(session)
    }

    fn track_new_session(&self, client_version: &str) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        let event = TrackEvent::page_view(client_version, self.server_version());
        // Fire and forget; analytics never touches the request path
        tokio::spawn(async move {
            let _ = tracker.track(event).await;
        });
    }

    /// Resolve a request to its session, recovering from the authority when
    /// the session is not in memory.
    pub async fn get_session(
        &self,
        request: &SessionRequest,
        endpoints: EndpointPair,
    ) -> Result<Arc<Session>> {
        self.ensure_not_disposed()?;

        let existing = {
            let sessions = self.sessions.read().await;
            sessions.get(&request.session_id).cloned()
        };
        let session = match existing {
            Some(session) => {
                if !session.session_key().ct_eq(request.session_key.as_bytes()) {
                    return Err(Error::unauthorized("Invalid session key."));
                }
                session
            }
            None => self.recover_session(request, endpoints).await?,
        };

        let response = session.response();
        if !response.error_code.is_ok() {
            return Err(Error::session(
                session.response_ex(),
                Some(request.request_id.clone()),
            ));
        }
        if session.is_disposed() {
            let mut response_ex = session.response_ex();
            response_ex.response.error_code = SessionErrorCode::SessionClosed;
            if response_ex.response.error_message.is_none() {
                response_ex.response.error_message = Some("Session closed.".into());
            }
            return Err(Error::session(
                response_ex,
                Some(request.request_id.clone()),
            ));
        }

        session.touch();
        Ok(session)
    }

    /// Recover an unknown session from the authority.
    ///
    /// Serialized per session id so concurrent recovery attempts coalesce
    /// into one `session_get`. A failed recovery caches a dead session so
    /// immediate retries are answered without another authority round trip.
    async fn recover_session(
        &self,
        request: &SessionRequest,
        endpoints: EndpointPair,
    ) -> Result<Arc<Session>> {
        let _guard = self.recover_locks.lock(request.session_id).await;

        // Someone may have recovered it while we waited for the lock
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(&request.session_id).cloned() {
                if !session.session_key().ct_eq(request.session_key.as_bytes()) {
                    return Err(Error::unauthorized("Invalid session key."));
                }
                return Ok(session);
            }
        }

        let recovered: Result<Arc<Session>> = async {
            let response = self
                .access
                .session_get(request.session_id, endpoints.local, endpoints.remote.ip())
                .await?;
            // The session is only authorized once the keys match
            if !response.session_key.ct_eq(request.session_key.as_bytes()) {
                return Err(Error::unauthorized("Invalid session key."));
            }
            if !response.response.error_code.is_ok() {
                return Err(Error::session(response, Some(request.request_id.clone())));
            }
            self.create_session_internal(&response, endpoints, Some(&request.request_id))
                .await
        }
        .await;

        match recovered {
            Ok(session) => Ok(session),
            Err(err) => {
                log::warn!("could not recover session {}: {}", request.session_id, err);
                self.cache_dead_session(request, endpoints, &err).await;
                Err(err)
            }
        }
    }

    /// Install a disposed placeholder session recording a recovery failure
    async fn cache_dead_session(
        &self,
        request: &SessionRequest,
        endpoints: EndpointPair,
        err: &Error,
    ) {
        let dead_response = SessionResponseEx {
            response: SessionResponse::error(SessionErrorCode::SessionError, err.to_string()),
            session_id: request.session_id,
            session_key: request.session_key,
            created_time: SystemTime::now(),
            extra_data: None,
        };
        let dead = match Session::new(
            &dead_response,
            endpoints,
            self.access.clone(),
            Arc::new(UdpProxyPool::new(
                self.socket_factory.clone(),
                self.sink.clone(),
                self.config.udp.worker_max_count,
            )),
            true,
        ) {
            Ok(session) => session,
            Err(e) => {
                log::warn!("could not cache dead session {}: {}", request.session_id, e);
                return;
            }
        };
        {
            let mut sessions = self.sessions.write().await;
            sessions.entry(request.session_id).or_insert_with(|| dead.clone());
        }
        dead.dispose().await;
    }

    /// Look up a session without authenticating
    pub async fn find_session(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Number of live (non-disposed) sessions
    pub async fn session_count(&self) -> usize {
        self.sessions
            .read()
            .await
            .values()
            .filter(|session| !session.is_disposed())
            .count()
    }

    /// Close a session cooperatively. Unknown ids are ignored.
    pub async fn close_session(&self, session_id: SessionId) {
        let Some(session) = self.find_session(session_id).await else {
            return;
        };
        if let Err(e) = session.close().await {
            log::warn!("failed to close session {}: {}", session_id, e);
        }
    }

    /// Sync every live session with the authority concurrently.
    /// Per-session failures are logged; the batch never aborts.
    pub async fn sync_sessions(&self) {
        let sessions: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();
        let jobs = sessions.into_iter().map(|session| async move {
            if let Err(e) = session.sync().await {
                log::warn!("session {} sync failed: {}", session.session_id(), e);
            }
        });
        futures::future::join_all(jobs).await;
    }

    /// Periodic job: heartbeat then cleanup. Invoked by the job runner on
    /// the cleanup interval; safe to call more often.
    pub async fn run_job(&self) {
        self.send_heartbeat().await;
        self.cleanup_sessions().await;
    }

    /// Emit the heartbeat event, at most once per heartbeat interval
    async fn send_heartbeat(&self) {
        let Some(tracker) = self.tracker.clone() else {
            return;
        };
        {
            let mut last_heartbeat = self.last_heartbeat.lock().await;
            let interval = self.config.session.heartbeat_interval();
            if last_heartbeat.is_some_and(|last| last.elapsed() < interval) {
                return;
            }
            *last_heartbeat = Some(Instant::now());
        }
        let session_count = self.session_count().await;
        tokio::spawn(async move {
            let _ = tracker.track(TrackEvent::heartbeat(session_count)).await;
        });
    }

    async fn cleanup_sessions(&self) {
        self.close_expired_sessions().await;
        self.remove_timed_out_sessions().await;
    }

    /// Sync sessions whose granted access has expired; the authority's
    /// failure response retires them.
    async fn close_expired_sessions(&self) {
        let now = SystemTime::now();
        let expired: Vec<Arc<Session>> = self
            .sessions
            .read()
            .await
            .values()
            .filter(|session| !session.is_disposed() && session.is_access_expired(now))
            .cloned()
            .collect();

        for session in expired {
            if let Err(e) = session.sync().await {
                log::warn!(
                    "failed to sync expired session {}: {}",
                    session.session_id(),
                    e
                );
            }
        }
    }

    /// Drop sessions that are disposed or idle past the session timeout.
    /// Removal precedes disposal; a concurrent `get_session` may observe
    /// the disposed session and reports it as closed.
    async fn remove_timed_out_sessions(&self) {
        let timeout = self.config.session.session_timeout();
        let now = Instant::now();

        let removed: Vec<Arc<Session>> = {
            let mut sessions = self.sessions.write().await;
            let expired: Vec<SessionId> = sessions
                .iter()
                .filter(|(_, session)| {
                    session.is_disposed()
                        || now.duration_since(session.last_activity()) > timeout
                })
                .map(|(session_id, _)| *session_id)
                .collect();
            expired
                .into_iter()
                .filter_map(|session_id| sessions.remove(&session_id))
                .collect()
        };

        for session in removed {
            log::info!("session {} timed out", session.session_id());
            session.dispose().await;
        }
    }

    /// Spawn the in-process job runner invoking [`run_job`] on the cleanup
    /// interval. Returns the shutdown handle; [`dispose`] also stops it.
    ///
    /// [`run_job`]: SessionManager::run_job
    /// [`dispose`]: SessionManager::dispose
    pub fn start(self: &Arc<Self>) -> broadcast::Sender<()> {
        let mut job_shutdown = self.job_shutdown.lock().unwrap();
        if let Some(shutdown_tx) = job_shutdown.as_ref() {
            return shutdown_tx.clone();
        }

        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        *job_shutdown = Some(shutdown_tx.clone());

        let manager = self.clone();
        let cleanup_interval = self.config.session.cleanup_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => manager.run_job().await,
                    _ = shutdown_rx.recv() => break,
                }
            }
        });
        shutdown_tx
    }

    /// Dispose the manager and every session. Idempotent; a concurrent
    /// second caller joins the same in-flight disposal.
    pub async fn dispose(&self) {
        let (first, mut latch_rx) = {
            let mut disposal = self.disposal.lock().await;
            match disposal.as_ref() {
                Some(latch_rx) => (None, latch_rx.clone()),
                None => {
                    let (latch_tx, latch_rx) = watch::channel(false);
                    *disposal = Some(latch_rx.clone());
                    (Some(latch_tx), latch_rx)
                }
            }
        };

        match first {
            Some(latch_tx) => {
                self.disposed.store(true, Ordering::Release);
                if let Some(shutdown_tx) = self.job_shutdown.lock().unwrap().take() {
                    let _ = shutdown_tx.send(());
                }

                let sessions: Vec<Arc<Session>> = {
                    let mut sessions = self.sessions.write().await;
                    sessions.drain().map(|(_, session)| session).collect()
                };
                futures::future::join_all(
                    sessions.iter().map(|session| session.dispose()),
                )
                .await;

                if let Some(pool) = &self.shared_pool {
                    pool.dispose().await;
                }
                let _ = latch_tx.send(true);
            }
            None => {
                while !*latch_rx.borrow_and_update() {
                    if latch_rx.changed().await.is_err() {
                        break;
                    }
                }
            }
        }
    }
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("disposed", &self.is_disposed())
            .finish_non_exhaustive()
    }
}
