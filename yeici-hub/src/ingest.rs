//! NatNet ingestion: multicast socket, receive loop, bounded frame queue.
//!
//! The receive loop never blocks on the queue. When the consumer falls behind and the
//! queue is full, the frame just decoded is dropped and counted; frames already queued
//! are kept in order.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use yeici_core::natnet::{self, Packet, DEFAULT_DATA_PORT, DEFAULT_MULTICAST_GROUP, MAX_PACKET_SIZE};
use yeici_core::DecodedFrame;

/// Log one of every this many malformed datagrams / queue drops.
const LOG_EVERY: u64 = 100;
/// Pause after a failed receive before reading again.
const RECV_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where and how to listen.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub multicast_group: Ipv4Addr,
    /// Interface to join the group on; `0.0.0.0` lets the OS choose.
    pub interface: Ipv4Addr,
    pub port: u16,
    pub queue_capacity: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            multicast_group: DEFAULT_MULTICAST_GROUP,
            interface: Ipv4Addr::UNSPECIFIED,
            port: DEFAULT_DATA_PORT,
            queue_capacity: 100,
        }
    }
}

/// Failure to bring the multicast socket up. Nothing is left running.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("socket setup failed: {0}")]
    Socket(#[source] std::io::Error),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot join multicast group {group} on {interface}: {source}")]
    Join {
        group: Ipv4Addr,
        interface: Ipv4Addr,
        #[source]
        source: std::io::Error,
    },
}

/// Counters shared with the receive loop.
#[derive(Debug, Default)]
struct Counters {
    datagrams: AtomicU64,
    frames: AtomicU64,
    skipped: AtomicU64,
    malformed: AtomicU64,
    dropped: AtomicU64,
    recv_errors: AtomicU64,
}

/// Snapshot of ingestion counters since the pipeline was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Datagrams read from the socket.
    pub datagrams: u64,
    /// Frames of Data decoded and queued.
    pub frames: u64,
    /// Datagrams of other message types.
    pub skipped: u64,
    /// Datagrams that failed to decode.
    pub malformed: u64,
    /// Decoded frames dropped because the queue was full.
    pub dropped: u64,
    /// Socket receive errors.
    pub recv_errors: u64,
}

impl Counters {
    fn snapshot(&self) -> IngestStats {
        IngestStats {
            datagrams: self.datagrams.load(Ordering::Relaxed),
            frames: self.frames.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

struct Running {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
    frames: mpsc::Receiver<DecodedFrame>,
    local_addr: SocketAddr,
}

/// Multicast receive pipeline. `start`/`stop` may be called any number of times in any order.
pub struct Ingestion {
    config: IngestConfig,
    counters: Arc<Counters>,
    running: Option<Running>,
}

impl Ingestion {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            counters: Arc::new(Counters::default()),
            running: None,
        }
    }

    pub fn config(&self) -> &IngestConfig {
        &self.config
    }

    /// Open the socket, join the group and spawn the receive loop.
    /// Must be called from within a Tokio runtime. No-op if already running.
    pub fn start(&mut self) -> Result<(), IngestError> {
        if self.is_running() {
            debug!("ingestion already running");
            return Ok(());
        }
        // A stopped pipeline may still hold its old state.
        self.running = None;

        let socket = make_multicast_socket(&self.config)?;
        let local_addr = socket.local_addr().map_err(IngestError::Socket)?;
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let counters = self.counters.clone();
        let task = tokio::spawn(recv_loop(socket, tx, counters, shutdown_rx));

        info!(
            group = %self.config.multicast_group,
            port = self.config.port,
            "NatNet ingestion listening"
        );
        self.running = Some(Running {
            shutdown: shutdown_tx,
            task,
            frames: rx,
            local_addr,
        });
        Ok(())
    }

    /// Stop the receive loop and close the socket. Safe when never started or already stopped.
    pub fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            // Aborting drops the loop future, and with it the socket, even mid-receive.
            running.task.abort();
            info!("NatNet ingestion stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.task.is_finished())
            .unwrap_or(false)
    }

    /// Address the socket is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    /// Next decoded frame in receipt order, or `None` once `timeout` elapses.
    /// Without a live receive loop this just waits out the timeout, so callers can poll.
    pub async fn pull_frame(&mut self, timeout: Duration) -> Option<DecodedFrame> {
        let Some(running) = self.running.as_mut() else {
            tokio::time::sleep(timeout).await;
            return None;
        };
        match tokio::time::timeout(timeout, running.frames.recv()).await {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                // Receive loop gone and queue drained.
                tokio::time::sleep(timeout).await;
                None
            }
            Err(_) => None,
        }
    }

    pub fn stats(&self) -> IngestStats {
        self.counters.snapshot()
    }
}

impl Drop for Ingestion {
    fn drop(&mut self) {
        self.stop();
    }
}

/// UDP socket with address reuse, bound to `0.0.0.0:port` and joined to the group.
fn make_multicast_socket(config: &IngestConfig) -> Result<UdpSocket, IngestError> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(IngestError::Socket)?;
    socket.set_reuse_address(true).map_err(IngestError::Socket)?;

    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port));
    socket.bind(&addr.into()).map_err(|source| IngestError::Bind { addr, source })?;
    socket
        .join_multicast_v4(&config.multicast_group, &config.interface)
        .map_err(|source| IngestError::Join {
            group: config.multicast_group,
            interface: config.interface,
            source,
        })?;
    socket.set_nonblocking(true).map_err(IngestError::Socket)?;

    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock).map_err(IngestError::Socket)
}

/// Outcome of offering a frame to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    Queued,
    /// Queue full; this (newest) frame was discarded.
    Dropped,
    /// Consumer gone.
    Closed,
}

/// Non-blocking push. A full queue drops `frame`, never a queued one.
pub fn offer(tx: &mpsc::Sender<DecodedFrame>, frame: DecodedFrame) -> Offer {
    match tx.try_send(frame) {
        Ok(()) => Offer::Queued,
        Err(mpsc::error::TrySendError::Full(_)) => Offer::Dropped,
        Err(mpsc::error::TrySendError::Closed(_)) => Offer::Closed,
    }
}

async fn recv_loop(
    socket: UdpSocket,
    tx: mpsc::Sender<DecodedFrame>,
    counters: Arc<Counters>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; MAX_PACKET_SIZE];
    loop {
        let (n, from) = tokio::select! {
            _ = shutdown.changed() => break,
            r = socket.recv_from(&mut buf) => match r {
                Ok(v) => v,
                Err(e) => {
                    // e.g. ICMP port unreachable surfaced on Windows; the socket stays usable.
                    back_off_after_recv_error(&counters, &e).await;
                    continue;
                }
            },
        };
        counters.datagrams.fetch_add(1, Ordering::Relaxed);

        match natnet::decode(&buf[..n]) {
            Ok(Packet::FrameOfData(frame)) => match offer(&tx, frame) {
                Offer::Queued => {
                    counters.frames.fetch_add(1, Ordering::Relaxed);
                }
                Offer::Dropped => {
                    let dropped = counters.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if dropped % LOG_EVERY == 1 {
                        warn!(dropped, "frame queue full, dropping newest frames");
                    }
                }
                Offer::Closed => break,
            },
            Ok(Packet::Skip { message_id }) => {
                counters.skipped.fetch_add(1, Ordering::Relaxed);
                trace!(message_id, %from, "skipping NatNet message");
            }
            Err(e) => {
                let malformed = counters.malformed.fetch_add(1, Ordering::Relaxed) + 1;
                if malformed % LOG_EVERY == 1 {
                    warn!(%from, len = n, error = %e, malformed, "dropping malformed datagram");
                } else {
                    debug!(%from, len = n, error = %e, "dropping malformed datagram");
                }
            }
        }
    }
    debug!("NatNet receive loop exiting");
}

/// Count a failed receive, log it (throttled) and pause before the next read.
async fn back_off_after_recv_error(counters: &Counters, e: &std::io::Error) {
    let errors = counters.recv_errors.fetch_add(1, Ordering::Relaxed) + 1;
    if errors % LOG_EVERY == 1 {
        error!(error = %e, errors, "NatNet socket receive failed");
    } else {
        debug!(error = %e, "NatNet socket receive failed");
    }
    tokio::time::sleep(RECV_RETRY_DELAY).await;
}
