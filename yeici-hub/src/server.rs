//! Distribution server: TCP listener, live client set, newline-delimited JSON fan-out.
//!
//! Each accepted connection is split. The write half joins the client set; the read half
//! goes to a small task that only watches for EOF or errors and then removes the client.
//! `broadcast` holds the set's lock for the whole fan-out, so clients joining or leaving
//! never observe (or cause) a half-finished broadcast.

use std::collections::BTreeMap;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};
use yeici_core::{encode_line, ProcessedFrame};

const LISTEN_BACKLOG: i32 = 128;
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Where to listen and how long one client may stall a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub write_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 54321,
            write_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot resolve {host}:{port}: {source}")]
    Resolve {
        host: String,
        port: u16,
        #[source]
        source: std::io::Error,
    },
    #[error("socket setup failed: {0}")]
    Socket(#[source] std::io::Error),
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type ClientId = u64;

struct Client<W> {
    peer: SocketAddr,
    writer: W,
    reader: Option<AbortHandle>,
}

impl<W> Drop for Client<W> {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Connected clients, iterated in connection order.
pub struct ClientSet<W> {
    next_id: ClientId,
    clients: BTreeMap<ClientId, Client<W>>,
}

impl<W> Default for ClientSet<W> {
    fn default() -> Self {
        Self {
            next_id: 1,
            clients: BTreeMap::new(),
        }
    }
}

impl<W: AsyncWrite + Unpin> ClientSet<W> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, peer: SocketAddr, writer: W) -> ClientId {
        let id = self.next_id;
        self.next_id += 1;
        self.clients.insert(
            id,
            Client {
                peer,
                writer,
                reader: None,
            },
        );
        id
    }

    /// Tie a liveness task to a client; it is aborted when the client leaves the set.
    pub fn attach_reader(&mut self, id: ClientId, reader: AbortHandle) {
        match self.clients.get_mut(&id) {
            Some(client) => client.reader = Some(reader),
            None => reader.abort(),
        }
    }

    /// Remove and close a client. Returns false if it was already gone.
    pub fn remove(&mut self, id: ClientId) -> bool {
        self.clients.remove(&id).is_some()
    }

    pub fn ids(&self) -> Vec<ClientId> {
        self.clients.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn clear(&mut self) {
        self.clients.clear();
    }

    /// Write `msg` to every client in turn. Clients whose write fails or exceeds
    /// `write_timeout` are removed after the pass; the rest still get the message.
    /// Returns the number of clients written to.
    pub async fn send_all(&mut self, msg: &[u8], write_timeout: Duration) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (id, client) in self.clients.iter_mut() {
            match tokio::time::timeout(write_timeout, client.writer.write_all(msg)).await {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    debug!(peer = %client.peer, error = %e, "client write failed");
                    failed.push(*id);
                }
                Err(_) => {
                    warn!(peer = %client.peer, ?write_timeout, "client write stalled, dropping");
                    failed.push(*id);
                }
            }
        }
        for id in failed {
            if let Some(client) = self.clients.remove(&id) {
                info!(peer = %client.peer, "client removed");
            }
        }
        delivered
    }
}

type SharedClients = Arc<Mutex<ClientSet<OwnedWriteHalf>>>;

struct Running {
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// TCP fan-out of processed frames to any number of consumers.
pub struct StreamServer {
    config: ServerConfig,
    clients: SharedClients,
    running: Option<Running>,
}

impl StreamServer {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            clients: Arc::new(Mutex::new(ClientSet::new())),
            running: None,
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Bind the listener and spawn the accept loop.
    /// Must be called from within a Tokio runtime. No-op if already running.
    pub fn start(&mut self) -> Result<(), ServerError> {
        if self.is_running() {
            debug!("stream server already running");
            return Ok(());
        }
        self.running = None;

        let listener = make_listener(&self.config.host, self.config.port)?;
        let local_addr = listener.local_addr().map_err(ServerError::Socket)?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let accept_task = tokio::spawn(accept_loop(listener, self.clients.clone(), shutdown_rx));

        info!(addr = %local_addr, "stream server listening");
        self.running = Some(Running {
            shutdown: shutdown_tx,
            accept_task,
            local_addr,
        });
        Ok(())
    }

    /// Close every client and the listener. Safe when never started or already stopped.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            let _ = running.shutdown.send(true);
            running.accept_task.abort();
            let mut clients = self.clients.lock().await;
            let n = clients.len();
            clients.clear();
            info!(clients = n, "stream server stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
            .as_ref()
            .map(|r| !r.accept_task.is_finished())
            .unwrap_or(false)
    }

    /// Bound address while running (resolves port 0).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|r| r.local_addr)
    }

    pub async fn client_count(&self) -> usize {
        self.clients.lock().await.len()
    }

    /// Send one JSON line to every connected client. Does nothing without clients.
    /// Per-client failures only remove that client. Returns the number of clients reached.
    pub async fn broadcast(&self, frame: &ProcessedFrame) -> usize {
        let mut clients = self.clients.lock().await;
        if clients.is_empty() {
            return 0;
        }
        let line = match encode_line(frame) {
            Ok(line) => line,
            Err(e) => {
                error!(frame_number = frame.frame_number, error = %e, "cannot encode frame");
                return 0;
            }
        };
        clients.send_all(&line, self.config.write_timeout).await
    }
}

impl Drop for StreamServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.take() {
            running.accept_task.abort();
            if let Ok(mut clients) = self.clients.try_lock() {
                clients.clear();
            }
        }
    }
}

fn make_listener(host: &str, port: u16) -> Result<TcpListener, ServerError> {
    let addr = (host, port)
        .to_socket_addrs()
        .and_then(|mut addrs| {
            addrs.next().ok_or_else(|| {
                std::io::Error::new(std::io::ErrorKind::NotFound, "no addresses")
            })
        })
        .map_err(|source| ServerError::Resolve {
            host: host.to_string(),
            port,
            source,
        })?;

    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(ServerError::Socket)?;
    socket.set_reuse_address(true).map_err(ServerError::Socket)?;
    socket
        .bind(&addr.into())
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket
        .listen(LISTEN_BACKLOG)
        .map_err(|source| ServerError::Bind { addr, source })?;
    socket.set_nonblocking(true).map_err(ServerError::Socket)?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(ServerError::Socket)
}

async fn accept_loop(
    listener: TcpListener,
    clients: SharedClients,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = shutdown.changed() => break,
            r = listener.accept() => match r {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    tokio::time::sleep(ACCEPT_RETRY_DELAY).await;
                    continue;
                }
            },
        };
        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();

        // Held across insert and spawn so the watcher cannot remove before the insert lands.
        let mut set = clients.lock().await;
        let id = set.insert(peer, writer);
        let watcher = tokio::spawn(watch_client(reader, id, peer, clients.clone()));
        set.attach_reader(id, watcher.abort_handle());
        info!(%peer, clients = set.len(), "client connected");
    }
    debug!("accept loop exiting");
}

/// Drain and ignore client input; remove the client on EOF or error.
async fn watch_client(
    mut reader: OwnedReadHalf,
    id: ClientId,
    peer: SocketAddr,
    clients: SharedClients,
) {
    let mut buf = [0u8; 1024];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(%peer, error = %e, "client read failed");
                break;
            }
        }
    }
    if clients.lock().await.remove(id) {
        info!(%peer, "client disconnected");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader, DuplexStream};
    use tokio::net::TcpStream;
    use yeici_core::{decode_line, DecodedFrame, MocapTransformer, RigidBody};

    fn peer(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn processed(n: u32) -> ProcessedFrame {
        MocapTransformer::new().process(&DecodedFrame {
            frame_number: n,
            rigid_bodies: vec![RigidBody::new(9, [0.0, 1.0, 0.0], [0.0, 0.0, 0.0, 1.0])],
            skeletons: vec![],
        })
    }

    async fn read_all_available(stream: &mut DuplexStream, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        stream.read_exact(&mut buf).await.unwrap();
        buf
    }

    #[tokio::test]
    async fn failed_client_removed_others_delivered() {
        let mut set: ClientSet<DuplexStream> = ClientSet::new();
        let (w1, mut r1) = tokio::io::duplex(4096);
        let (w2, r2) = tokio::io::duplex(4096);
        let (w3, mut r3) = tokio::io::duplex(4096);
        let id1 = set.insert(peer(1), w1);
        let _id2 = set.insert(peer(2), w2);
        let id3 = set.insert(peer(3), w3);
        drop(r2);

        let msg = b"{\"frame_number\":1}\n";
        let delivered = set.send_all(msg, Duration::from_secs(1)).await;
        assert_eq!(delivered, 2);
        assert_eq!(set.ids(), vec![id1, id3]);
        assert_eq!(read_all_available(&mut r1, msg.len()).await, msg);
        assert_eq!(read_all_available(&mut r3, msg.len()).await, msg);
    }

    #[tokio::test]
    async fn stalled_client_times_out() {
        let mut set: ClientSet<DuplexStream> = ClientSet::new();
        let (w1, mut r1) = tokio::io::duplex(4096);
        // Tiny buffer nobody drains.
        let (w2, _r2) = tokio::io::duplex(8);
        set.insert(peer(1), w1);
        set.insert(peer(2), w2);

        let msg = vec![b'x'; 64];
        let delivered = set.send_all(&msg, Duration::from_millis(50)).await;
        assert_eq!(delivered, 1);
        assert_eq!(set.len(), 1);
        assert_eq!(read_all_available(&mut r1, msg.len()).await, msg);
    }

    #[tokio::test]
    async fn removing_client_aborts_its_reader() {
        let mut set: ClientSet<DuplexStream> = ClientSet::new();
        let (w, _r) = tokio::io::duplex(64);
        let id = set.insert(peer(1), w);
        let task = tokio::spawn(std::future::pending::<()>());
        set.attach_reader(id, task.abort_handle());
        assert!(set.remove(id));
        assert!(!set.remove(id));
        assert!(task.await.unwrap_err().is_cancelled());
    }

    async fn started() -> StreamServer {
        let mut server = StreamServer::new(ServerConfig {
            port: 0,
            ..ServerConfig::default()
        });
        server.start().unwrap();
        server
    }

    async fn wait_for_clients(server: &StreamServer, n: usize) {
        for _ in 0..200 {
            if server.client_count().await == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {} clients, have {}", n, server.client_count().await);
    }

    #[tokio::test]
    async fn broadcast_reaches_every_tcp_client() {
        let mut server = started().await;
        let addr = server.local_addr().unwrap();
        let mut readers = Vec::new();
        for _ in 0..3 {
            readers.push(BufReader::new(TcpStream::connect(addr).await.unwrap()));
        }
        wait_for_clients(&server, 3).await;

        assert_eq!(server.broadcast(&processed(812)).await, 3);
        for r in readers.iter_mut() {
            let mut line = String::new();
            r.read_line(&mut line).await.unwrap();
            assert!(line.ends_with('\n'));
            let (frame, n) = decode_line(line.as_bytes()).unwrap();
            assert_eq!(n, line.len());
            assert_eq!(frame, processed(812));
        }
        server.stop().await;
    }

    #[tokio::test]
    async fn disconnect_detected_by_watcher() {
        let mut server = started().await;
        let addr = server.local_addr().unwrap();
        let a = TcpStream::connect(addr).await.unwrap();
        let b = TcpStream::connect(addr).await.unwrap();
        wait_for_clients(&server, 2).await;
        drop(a);
        wait_for_clients(&server, 1).await;
        drop(b);
        wait_for_clients(&server, 0).await;
        assert_eq!(server.broadcast(&processed(1)).await, 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn client_input_is_ignored() {
        let mut server = started().await;
        let mut c = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        wait_for_clients(&server, 1).await;
        c.write_all(b"hello hub\n").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(server.client_count().await, 1);
        server.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_clients_and_is_idempotent() {
        let mut never = StreamServer::new(ServerConfig::default());
        never.stop().await;
        assert!(!never.is_running());
        assert_eq!(never.broadcast(&processed(1)).await, 0);

        let mut server = started().await;
        let mut c = TcpStream::connect(server.local_addr().unwrap()).await.unwrap();
        wait_for_clients(&server, 1).await;
        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
        assert_eq!(server.broadcast(&processed(2)).await, 0);

        let mut buf = [0u8; 16];
        let n = tokio::time::timeout(Duration::from_secs(2), c.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn port_in_use_is_bind_error() {
        let mut first = started().await;
        let port = first.local_addr().unwrap().port();
        let mut second = StreamServer::new(ServerConfig {
            port,
            ..ServerConfig::default()
        });
        assert!(matches!(second.start(), Err(ServerError::Bind { .. })));
        assert!(!second.is_running());
        first.stop().await;
    }
}
