//! Driver loop: pull a decoded frame, transform it, broadcast it, repeat.

use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, info};
use yeici_core::{DecodedFrame, MocapTransformer};

use crate::config::Config;
use crate::ingest::{IngestError, IngestStats, Ingestion};
use crate::server::{ServerError, StreamServer};

/// How long one pull waits before the loop re-checks for shutdown.
pub const PULL_TIMEOUT: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("ingestion: {0}")]
    Ingest(#[from] IngestError),
    #[error("distribution: {0}")]
    Server(#[from] ServerError),
}

/// Totals since the bridge was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgeStats {
    /// Frames transformed and handed to the server.
    pub frames: u64,
    /// Sum over frames of clients reached.
    pub deliveries: u64,
    /// Subjects emitted with fallback data.
    pub stale_subjects: u64,
}

/// Ingestion, transform engine and distribution server wired together.
pub struct Bridge {
    ingestion: Ingestion,
    transformer: MocapTransformer,
    server: StreamServer,
    stats: BridgeStats,
}

impl Bridge {
    pub fn new(config: &Config) -> Self {
        Self::from_parts(
            Ingestion::new(config.ingest()),
            StreamServer::new(config.server()),
        )
    }

    pub fn from_parts(ingestion: Ingestion, server: StreamServer) -> Self {
        Self {
            ingestion,
            transformer: MocapTransformer::new(),
            server,
            stats: BridgeStats::default(),
        }
    }

    /// Start the server, then ingestion. If ingestion cannot start the server is stopped
    /// again, so a failed start leaves nothing running.
    pub async fn start(&mut self) -> Result<(), BridgeError> {
        self.server.start()?;
        if let Err(e) = self.ingestion.start() {
            self.server.stop().await;
            return Err(e.into());
        }
        Ok(())
    }

    pub async fn stop(&mut self) {
        self.ingestion.stop();
        self.server.stop().await;
    }

    pub fn ingestion(&self) -> &Ingestion {
        &self.ingestion
    }

    pub fn server(&self) -> &StreamServer {
        &self.server
    }

    pub fn stats(&self) -> BridgeStats {
        self.stats
    }

    /// Transform one frame and broadcast it. Returns the number of clients reached.
    pub async fn forward(&mut self, frame: &DecodedFrame) -> usize {
        let processed = self.transformer.process(frame);
        let stale = processed.stale_count();
        if stale > 0 {
            debug!(frame_number = processed.frame_number, stale, "frame carries fallback data");
        }
        let reached = self.server.broadcast(&processed).await;
        self.stats.frames += 1;
        self.stats.deliveries += reached as u64;
        self.stats.stale_subjects += stale as u64;
        reached
    }

    /// One pull-transform-broadcast round. `None` if no frame arrived within `timeout`.
    pub async fn step(&mut self, timeout: Duration) -> Option<usize> {
        let frame = self.ingestion.pull_frame(timeout).await?;
        Some(self.forward(&frame).await)
    }

    /// Run until `shutdown` flips (or its sender goes away). A status line is logged every
    /// `stats_interval` when given.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
        stats_interval: Option<Duration>,
    ) {
        let mut report = StatusReport::new(self.stats, self.ingestion.stats());
        loop {
            if *shutdown.borrow() {
                break;
            }
            // Only the pull is raced against shutdown; a broadcast always runs to completion.
            let frame = tokio::select! {
                _ = shutdown.changed() => break,
                f = self.ingestion.pull_frame(PULL_TIMEOUT) => f,
            };
            if let Some(frame) = frame {
                self.forward(&frame).await;
            }
            if let Some(interval) = stats_interval {
                if report.since.elapsed() >= interval {
                    let clients = self.server.client_count().await;
                    report.log(self.stats, self.ingestion.stats(), clients);
                }
            }
        }
        debug!("bridge loop exiting");
    }
}

/// Periodic status line: frame rate over the last period plus running totals.
struct StatusReport {
    since: Instant,
    frames: u64,
    datagrams: u64,
}

impl StatusReport {
    fn new(stats: BridgeStats, ingest: IngestStats) -> Self {
        Self {
            since: Instant::now(),
            frames: stats.frames,
            datagrams: ingest.datagrams,
        }
    }

    fn log(&mut self, stats: BridgeStats, ingest: IngestStats, clients: usize) {
        let secs = self.since.elapsed().as_secs_f64().max(f64::EPSILON);
        let fps = (stats.frames - self.frames) as f64 / secs;
        let pps = (ingest.datagrams - self.datagrams) as f64 / secs;
        info!(
            fps = format_args!("{:.1}", fps),
            packets_per_sec = format_args!("{:.0}", pps),
            clients,
            dropped = ingest.dropped,
            malformed = ingest.malformed,
            stale = stats.stale_subjects,
            "bridge status"
        );
        *self = Self::new(stats, ingest);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestConfig;
    use crate::server::ServerConfig;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpStream;
    use yeici_core::{encode_frame_of_data, RigidBody};

    fn loopback_bridge() -> Bridge {
        Bridge::from_parts(
            Ingestion::new(IngestConfig {
                port: 0,
                ..IngestConfig::default()
            }),
            StreamServer::new(ServerConfig {
                port: 0,
                ..ServerConfig::default()
            }),
        )
    }

    async fn wait_for_clients(bridge: &Bridge, n: usize) {
        for _ in 0..200 {
            if bridge.server().client_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("client never registered");
    }

    #[tokio::test]
    async fn datagram_in_json_line_out() {
        let mut bridge = loopback_bridge();
        if let Err(e) = bridge.start().await {
            eprintln!("skipping: {}", e);
            return;
        }
        let server_addr = bridge.server().local_addr().unwrap();
        let ingest_port = bridge.ingestion().local_addr().unwrap().port();

        let mut client = BufReader::new(TcpStream::connect(server_addr).await.unwrap());
        wait_for_clients(&bridge, 1).await;

        let datagram = encode_frame_of_data(&DecodedFrame {
            frame_number: 501,
            rigid_bodies: vec![RigidBody::new(9, [0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0])],
            skeletons: vec![],
        });
        let sender = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        sender.send_to(&datagram, ("127.0.0.1", ingest_port)).unwrap();

        assert_eq!(bridge.step(Duration::from_secs(2)).await, Some(1));
        let mut line = String::new();
        client.read_line(&mut line).await.unwrap();
        assert_eq!(
            line,
            concat!(
                r#"{"frame_number":501,"subjects":{"RB_9":{"#,
                r#""unreal":{"pos":[0.0,0.0,100.0],"rot":[0.0,0.0,0.0,-1.0]},"#,
                r#""maya":{"pos":[0.0,100.0,0.0],"rot":[0.0,0.0,0.0,1.0]}}}}"#,
                "\n"
            )
        );
        assert_eq!(
            bridge.stats(),
            BridgeStats {
                frames: 1,
                deliveries: 1,
                stale_subjects: 0
            }
        );
        bridge.stop().await;
        assert!(!bridge.ingestion().is_running());
        assert!(!bridge.server().is_running());
    }

    #[tokio::test]
    async fn forward_without_clients_still_counts() {
        let mut bridge = loopback_bridge();
        let frame = DecodedFrame {
            frame_number: 1,
            rigid_bodies: vec![RigidBody::new(1, [f32::NAN; 3], [0.0, 0.0, 0.0, 1.0])],
            skeletons: vec![],
        };
        assert_eq!(bridge.forward(&frame).await, 0);
        assert_eq!(bridge.stats().frames, 1);
        assert_eq!(bridge.stats().stale_subjects, 1);
    }

    #[tokio::test]
    async fn run_exits_on_shutdown() {
        let mut bridge = loopback_bridge();
        let (tx, rx) = watch::channel(false);
        let stopper = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let _ = tx.send(true);
        });
        tokio::time::timeout(
            Duration::from_secs(2),
            bridge.run(rx, Some(Duration::from_millis(10))),
        )
        .await
        .unwrap();
        stopper.await.unwrap();
    }

    #[tokio::test]
    async fn failed_ingestion_leaves_server_stopped() {
        let mut bridge = Bridge::from_parts(
            Ingestion::new(IngestConfig {
                multicast_group: std::net::Ipv4Addr::new(127, 0, 0, 1),
                port: 0,
                ..IngestConfig::default()
            }),
            StreamServer::new(ServerConfig {
                port: 0,
                ..ServerConfig::default()
            }),
        );
        assert!(matches!(bridge.start().await, Err(BridgeError::Ingest(_))));
        assert!(!bridge.server().is_running());
        assert!(!bridge.ingestion().is_running());
    }
}
