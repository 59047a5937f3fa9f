//! UDP proxy pool
//!
//! Maps client flows onto workers, allocating lazily under a worker quota
//! and reclaiming idle workers with a watchdog driven from the send path.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::proxy::worker::UdpProxyWorker;
use crate::proxy::{DatagramSink, FlowKey, PoolEvent, PoolEventHandler, TransportProtocol, UdpPayload};
use crate::socket::{AddressFamily, SocketFactory};
use crate::timeout_map::TimeoutMap;

/// Default idle timeout for workers and flow mappings
pub const DEFAULT_UDP_TIMEOUT: Duration = Duration::from_secs(120);

/// Default timeout of the remote-endpoint set until overridden
pub const DEFAULT_REMOTE_ENDPOINT_TIMEOUT: Duration = Duration::from_secs(60);

/// A bounded set of proxy workers multiplexing client UDP flows
pub struct UdpProxyPool {
    socket_factory: Arc<dyn SocketFactory>,
    sink: Arc<dyn DatagramSink>,
    event_handler: Option<Arc<dyn PoolEventHandler>>,
    /// Flow -> the worker currently carrying it
    flows: TimeoutMap<FlowKey, Arc<UdpProxyWorker>>,
    /// Worker list; the single pool lock for allocation and removal
    workers: Mutex<Vec<Arc<UdpProxyWorker>>>,
    /// Remote endpoints seen recently, for new-endpoint event flags
    remote_endpoints: TimeoutMap<SocketAddr, ()>,
    worker_max_count: usize,
    udp_timeout: StdMutex<Duration>,
    last_watch: StdMutex<Instant>,
    disposed: AtomicBool,
}

impl UdpProxyPool {
    pub fn new(
        socket_factory: Arc<dyn SocketFactory>,
        sink: Arc<dyn DatagramSink>,
        worker_max_count: usize,
    ) -> Self {
        Self {
            socket_factory,
            sink,
            event_handler: None,
            flows: TimeoutMap::new(DEFAULT_UDP_TIMEOUT),
            workers: Mutex::new(Vec::new()),
            remote_endpoints: TimeoutMap::new(DEFAULT_REMOTE_ENDPOINT_TIMEOUT),
            worker_max_count,
            udp_timeout: StdMutex::new(DEFAULT_UDP_TIMEOUT),
            last_watch: StdMutex::new(Instant::now()),
            disposed: AtomicBool::new(false),
        }
    }

    /// Set an observer for endpoint events
    pub fn with_event_handler(mut self, handler: Arc<dyn PoolEventHandler>) -> Self {
        self.event_handler = Some(handler);
        self
    }

    /// Change the idle timeout. Propagates to the flow map, the
    /// remote-endpoint set, and the watchdog interval before returning.
    /// Existing workers adopt it for their destination maps on the next
    /// watchdog sweep; new workers pick it up at creation.
    pub fn set_udp_timeout(&self, timeout: Duration) {
        *self.udp_timeout.lock().unwrap() = timeout;
        self.flows.set_timeout(timeout);
        self.remote_endpoints.set_timeout(timeout);
    }

    /// The current idle timeout
    pub fn udp_timeout(&self) -> Duration {
        *self.udp_timeout.lock().unwrap()
    }

    /// Number of live workers
    pub async fn worker_count(&self) -> usize {
        self.workers.lock().await.len()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Forward one client datagram toward `dest_addr`.
    ///
    /// Looks up the flow, allocating a worker first-fit when the flow is
    /// new, and hands the payload to the worker for transmission. Transmit
    /// failures are logged and swallowed; UDP proxying is best effort.
    pub async fn send_packet(
        &self,
        source_addr: IpAddr,
        dest_addr: IpAddr,
        payload: UdpPayload<'_>,
        no_fragment: Option<bool>,
    ) -> Result<()> {
        if self.is_disposed() {
            return Err(Error::Disposed);
        }

        let key = FlowKey {
            source: SocketAddr::new(source_addr, payload.source_port),
            destination: SocketAddr::new(dest_addr, payload.dest_port),
        };

        self.watch_if_due().await;

        let worker = match self.flows.get(&key) {
            Some(worker) if !worker.is_disposed() => worker,
            _ => self.allocate(key).await?,
        };

        let data = payload.data.unwrap_or(&[]);
        if let Err(e) = worker.send_to(key.destination, data, no_fragment).await {
            log::warn!("udp send to {} failed: {}", key.destination, e);
        }
        Ok(())
    }

    /// Allocate a worker for a new flow.
    ///
    /// First fit over the existing workers keeps the NAT footprint small;
    /// a worker already holding the destination is skipped so that inbound
    /// replies from the destination stay attributable to one client.
    async fn allocate(&self, key: FlowKey) -> Result<Arc<UdpProxyWorker>> {
        let family = AddressFamily::of(&key.destination);
        let mut workers = self.workers.lock().await;

        // Another task may have allocated this flow while we waited
        if let Some(worker) = self.flows.get(&key) {
            if !worker.is_disposed() {
                return Ok(worker);
            }
        }

        let mut is_new_local = false;
        let worker = match workers
            .iter()
            .find(|worker| worker.can_accept(family, &key.destination))
        {
            Some(worker) => worker.clone(),
            None => {
                if workers.len() >= self.worker_max_count {
                    return Err(Error::UdpClientQuota {
                        worker_count: workers.len(),
                    });
                }
                let socket = self.socket_factory.bind_udp(family).await?;
                let worker = UdpProxyWorker::start(
                    socket,
                    family,
                    self.sink.clone(),
                    self.udp_timeout(),
                )?;
                log::debug!(
                    "new {} proxy worker on {} ({} of {})",
                    family,
                    worker.local_endpoint(),
                    workers.len() + 1,
                    self.worker_max_count
                );
                workers.push(worker.clone());
                is_new_local = true;
                worker
            }
        };

        worker.register_flow(key.destination, key.source);
        let is_new_remote = self.remote_endpoints.insert(key.destination, ()).is_none();
        self.flows.insert(key, worker.clone());
        drop(workers);

        if let Some(handler) = &self.event_handler {
            handler.on_pool_event(&PoolEvent::NewEndpoint {
                protocol: TransportProtocol::Udp,
                local: worker.local_endpoint(),
                remote: key.destination,
                is_new_local,
                is_new_remote,
            });
        }
        Ok(worker)
    }

    async fn watch_if_due(&self) {
        let due = {
            let mut last_watch = self.last_watch.lock().unwrap();
            if last_watch.elapsed() < self.udp_timeout() {
                false
            } else {
                *last_watch = Instant::now();
                true
            }
        };
        if due {
            self.do_watch().await;
        }
    }

    /// Drop workers idle past the timeout and sweep the maps.
    ///
    /// Removal happens under the pool lock; disposal happens after it is
    /// released so the sweep never blocks the hot path on socket teardown.
    pub async fn do_watch(&self) {
        let timeout = self.udp_timeout();
        let now = Instant::now();

        let idle: Vec<Arc<UdpProxyWorker>> = {
            let mut workers = self.workers.lock().await;
            let (idle, keep) = workers
                .drain(..)
                .partition(|worker| worker.is_idle(timeout, now));
            *workers = keep;
            for worker in workers.iter() {
                worker.set_destination_timeout(timeout);
                worker.cleanup_destinations();
            }
            idle
        };

        for worker in idle {
            log::debug!("removing idle proxy worker {}", worker.local_endpoint());
            worker.dispose();
        }

        self.flows.cleanup();
        self.remote_endpoints.cleanup();
    }

    /// Dispose every worker and clear the maps. Idempotent.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<Arc<UdpProxyWorker>> = {
            let mut workers = self.workers.lock().await;
            workers.drain(..).collect()
        };
        for worker in drained {
            worker.dispose();
        }
        self.flows.clear();
        self.remote_endpoints.clear();
    }
}
