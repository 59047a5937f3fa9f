//! UDP proxy worker
//!
//! One worker owns one local UDP socket plus the map of remote destinations
//! currently proxied through it. The recv task delivers inbound datagrams
//! upward through the pool's sink; datagrams from remotes absent from the
//! destination map are dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use crate::proxy::DatagramSink;
use crate::socket::{set_dont_fragment, AddressFamily};
use crate::timeout_map::TimeoutMap;

const RECV_BUFFER_SIZE: usize = 0xFFFF;

/// One proxy socket and the flows multiplexed over it
pub struct UdpProxyWorker {
    family: AddressFamily,
    socket: Arc<UdpSocket>,
    local_endpoint: SocketAddr,
    /// Remote destination -> client source endpoint
    destinations: TimeoutMap<SocketAddr, SocketAddr>,
    last_activity: Mutex<Instant>,
    dont_fragment: AtomicBool,
    disposed: AtomicBool,
    recv_task: Mutex<Option<JoinHandle<()>>>,
}

impl UdpProxyWorker {
    /// Wrap a bound socket and spawn the recv task
    pub(crate) fn start(
        socket: UdpSocket,
        family: AddressFamily,
        sink: Arc<dyn DatagramSink>,
        udp_timeout: Duration,
    ) -> io::Result<Arc<Self>> {
        let local_endpoint = socket.local_addr()?;
        let worker = Arc::new(Self {
            family,
            socket: Arc::new(socket),
            local_endpoint,
            destinations: TimeoutMap::new(udp_timeout),
            last_activity: Mutex::new(Instant::now()),
            dont_fragment: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            recv_task: Mutex::new(None),
        });

        let task = tokio::spawn(Self::recv_loop(worker.clone(), sink));
        *worker.recv_task.lock().unwrap() = Some(task);
        Ok(worker)
    }

    async fn recv_loop(worker: Arc<UdpProxyWorker>, sink: Arc<dyn DatagramSink>) {
        let mut buf = vec![0u8; RECV_BUFFER_SIZE];
        loop {
            match worker.socket.recv_from(&mut buf).await {
                Ok((len, remote)) => {
                    let Some(client_source) = worker.destinations.get(&remote) else {
                        log::debug!(
                            "worker {} dropping datagram from unmapped remote {}",
                            worker.local_endpoint,
                            remote
                        );
                        continue;
                    };
                    worker.touch();
                    sink.on_datagram(worker.local_endpoint, remote, client_source, &buf[..len])
                        .await;
                }
                Err(e) => {
                    if worker.disposed.load(Ordering::Acquire) {
                        break;
                    }
                    // Transient per-datagram failures must not kill the worker
                    log::warn!("worker {} recv error: {}", worker.local_endpoint, e);
                }
            }
        }
    }

    pub fn family(&self) -> AddressFamily {
        self.family
    }

    pub fn local_endpoint(&self) -> SocketAddr {
        self.local_endpoint
    }

    /// Time of the most recent send or delivered receive
    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    pub(crate) fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub(crate) fn is_idle(&self, timeout: Duration, now: Instant) -> bool {
        now.duration_since(self.last_activity()) > timeout
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Whether this worker can take a new flow toward `destination`.
    ///
    /// A worker serves one client per remote destination; a second client
    /// speaking to the same destination needs a different worker so inbound
    /// replies stay unambiguous.
    pub(crate) fn can_accept(&self, family: AddressFamily, destination: &SocketAddr) -> bool {
        self.family == family && !self.destinations.contains_key(destination)
    }

    /// Record that datagrams from `destination` belong to `client_source`
    pub(crate) fn register_flow(&self, destination: SocketAddr, client_source: SocketAddr) {
        self.destinations.insert(destination, client_source);
    }

    /// Number of distinct remote destinations currently mapped
    pub fn destination_count(&self) -> usize {
        self.destinations.len()
    }

    pub(crate) fn set_destination_timeout(&self, timeout: Duration) {
        self.destinations.set_timeout(timeout);
    }

    pub(crate) fn destination_timeout(&self) -> Duration {
        self.destinations.timeout()
    }

    pub(crate) fn cleanup_destinations(&self) {
        self.destinations.cleanup();
    }

    /// Transmit a datagram to `destination`
    pub(crate) async fn send_to(
        &self,
        destination: SocketAddr,
        data: &[u8],
        no_fragment: Option<bool>,
    ) -> io::Result<()> {
        if no_fragment == Some(true) && !self.dont_fragment.swap(true, Ordering::AcqRel) {
            if let Err(e) = set_dont_fragment(&self.socket) {
                log::debug!(
                    "worker {} could not set don't-fragment: {}",
                    self.local_endpoint,
                    e
                );
            }
        }
        self.touch();
        // Refresh the destination entry so an active flow outlives idle inbound
        let _ = self.destinations.get(&destination);
        self.socket.send_to(data, destination).await?;
        Ok(())
    }

    /// Stop the recv task and release the socket. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.recv_task.lock().unwrap().take() {
            task.abort();
        }
        self.destinations.clear();
    }
}

impl Drop for UdpProxyWorker {
    fn drop(&mut self) {
        self.dispose();
    }
}
