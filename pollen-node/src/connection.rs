//! Connection manager: one worker task per transport handle, a short-lived
//! task per decoded PDU, and the shared peer ↔ connection mapping. Transport
//! is anything that yields a byte reader/writer pair.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use pollen_core::engine::PduSink;
use pollen_core::protocol::{self, FrameDecodeError, Pdu, PduHeader};
use pollen_core::registry::{EngineRegistry, RegistryError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::task::JoinHandle;

/// Default cap on a single PDU execution.
pub const DEFAULT_MAX_EXECUTION_TIME: Duration = Duration::from_secs(30);

const EVENT_CHANNEL_CAPACITY: usize = 64;
const READ_BUF_SIZE: usize = 4096;

/// Why a connection ended. A clean close by the peer carries no cause.
#[derive(Debug, Clone)]
pub enum TerminateCause {
    Io(String),
    Protocol(String),
    Timeout,
}

/// Connection lifecycle. Identified is entered at most once; Active toggles
/// per dispatched PDU.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Opened,
    Identified,
    Active,
    Terminated,
}

/// Lifecycle notifications for subscribers (the online router, tests).
#[derive(Clone)]
pub enum ConnectionEvent {
    Identified {
        peer: String,
        connection: Arc<ConnectionHandle>,
    },
    Terminated {
        peer: Option<String>,
        cause: Option<TerminateCause>,
    },
}

impl fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Identified { peer, connection } => f
                .debug_struct("Identified")
                .field("peer", peer)
                .field("connection", &connection.id())
                .finish(),
            ConnectionEvent::Terminated { peer, cause } => f
                .debug_struct("Terminated")
                .field("peer", peer)
                .field("cause", cause)
                .finish(),
        }
    }
}

/// Something that drains pending outbound application messages into a
/// connection once it is ready to send. Implemented by the online router.
pub trait MessageSource: Send + Sync {
    fn send_messages(&self, connection: &Arc<ConnectionHandle>);
}

enum Outbound {
    Frame(Vec<u8>),
    /// Shut the write direction down; sent before the read side is dropped.
    Close,
}

/// Shared handle to one open connection.
pub struct ConnectionHandle {
    id: u64,
    signed: bool,
    outbound: mpsc::UnboundedSender<Outbound>,
    peer: Mutex<Option<String>>,
    state: Mutex<ConnectionState>,
    sources: Mutex<Vec<Arc<dyn MessageSource>>>,
    ready: Notify,
}

impl ConnectionHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote peer name; `None` until the handshake identified it.
    pub fn peer(&self) -> Option<String> {
        self.peer.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Whether PDUs on this session are cryptographically signed.
    pub fn is_signed(&self) -> bool {
        self.signed
    }

    /// Queue one encoded frame for sending. Silently dropped when the write
    /// direction is already gone; the worker notices on its own.
    pub fn send_frame(&self, frame: Vec<u8>) {
        let _ = self.outbound.send(Outbound::Frame(frame));
    }

    /// Attach a message source. Idempotent per source instance.
    pub fn add_message_source(&self, source: Arc<dyn MessageSource>) {
        let mut sources = self.sources.lock().unwrap_or_else(|e| e.into_inner());
        if !sources.iter().any(|s| Arc::ptr_eq(s, &source)) {
            sources.push(source);
        }
    }

    pub fn remove_message_source(&self, source: &Arc<dyn MessageSource>) {
        self.sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|s| !Arc::ptr_eq(s, source));
    }

    /// Nudge the worker to drain attached message sources.
    pub fn notify_ready(&self) {
        self.ready.notify_one();
    }

    fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != ConnectionState::Terminated {
            *state = next;
        }
    }

    fn drain_sources(self: &Arc<Self>) {
        let sources: Vec<Arc<dyn MessageSource>> = self
            .sources
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for source in sources {
            source.send_messages(self);
        }
    }

    fn close_outbound(&self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

impl PduSink for ConnectionHandle {
    fn send_frame(&self, frame: Vec<u8>) {
        ConnectionHandle::send_frame(self, frame);
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("peer", &self.peer())
            .field("state", &self.state())
            .finish()
    }
}

/// Tracks all running connection workers and the peer mapping; spawns one
/// worker per handed-in transport.
pub struct ConnectionManager {
    registry: Arc<EngineRegistry>,
    max_execution_time: Duration,
    next_id: AtomicU64,
    running: Mutex<HashSet<u64>>,
    by_peer: Mutex<HashMap<String, Arc<ConnectionHandle>>>,
    events: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(registry: Arc<EngineRegistry>, max_execution_time: Duration) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(ConnectionManager {
            registry,
            max_execution_time,
            next_id: AtomicU64::new(1),
            running: Mutex::new(HashSet::new()),
            by_peer: Mutex::new(HashMap::new()),
            events,
        })
    }

    pub fn registry(&self) -> &Arc<EngineRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn connection_for(&self, peer: &str) -> Option<Arc<ConnectionHandle>> {
        self.by_peer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(peer)
            .cloned()
    }

    pub fn exists_connection(&self, peer: &str) -> bool {
        self.connection_for(peer).is_some()
    }

    pub fn running_workers(&self) -> usize {
        self.running.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Take over a transport: spawn the write loop and one worker task that
    /// runs the interest push and the PDU loop until the stream ends.
    pub fn handle_connection<R, W>(
        self: &Arc<Self>,
        reader: R,
        writer: W,
        signed: bool,
    ) -> Arc<ConnectionHandle>
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let conn = Arc::new(ConnectionHandle {
            id,
            signed,
            outbound,
            peer: Mutex::new(None),
            state: Mutex::new(ConnectionState::Opened),
            sources: Mutex::new(Vec::new()),
            ready: Notify::new(),
        });
        self.running
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id);
        let writer_task = tokio::spawn(write_loop(writer, outbound_rx));
        let manager = self.clone();
        let worker_conn = conn.clone();
        tokio::spawn(async move {
            run_worker(manager, worker_conn, reader, writer_task).await;
        });
        tracing::info!(id, total = self.running_workers(), "launched connection worker");
        conn
    }

    /// Remove a worker from the running set. Idempotent: a report without a
    /// worker, or a duplicate, is logged and ignored.
    pub fn finished(&self, report: Option<u64>) {
        let Some(id) = report else {
            tracing::warn!("completion report without a worker - ignored");
            return;
        };
        let mut running = self.running.lock().unwrap_or_else(|e| e.into_inner());
        if !running.remove(&id) {
            tracing::warn!(id, "completion report for unknown worker - ignored");
            return;
        }
        tracing::info!(id, remaining = running.len(), "connection worker finished");
    }

    /// Bind the peer name learned from the first PDU. Fires the Identified
    /// event exactly once per connection.
    fn identify(&self, peer: &str, conn: &Arc<ConnectionHandle>) {
        {
            let mut bound = conn.peer.lock().unwrap_or_else(|e| e.into_inner());
            if bound.is_some() {
                return;
            }
            *bound = Some(peer.to_string());
        }
        conn.set_state(ConnectionState::Identified);
        self.by_peer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(peer.to_string(), conn.clone());
        tracing::info!(id = conn.id, peer, "connection identified");
        let _ = self.events.send(ConnectionEvent::Identified {
            peer: peer.to_string(),
            connection: conn.clone(),
        });
    }

    /// Tear down the mapping and fire the Terminated event exactly once.
    fn terminate(&self, conn: &Arc<ConnectionHandle>, cause: Option<TerminateCause>) {
        {
            let mut state = conn.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == ConnectionState::Terminated {
                return;
            }
            *state = ConnectionState::Terminated;
        }
        let peer = conn.peer();
        if let Some(p) = &peer {
            let mut by_peer = self.by_peer.lock().unwrap_or_else(|e| e.into_inner());
            if by_peer.get(p).is_some_and(|c| c.id == conn.id) {
                by_peer.remove(p);
            }
        }
        match &cause {
            Some(c) => tracing::warn!(id = conn.id, peer = peer.as_deref(), cause = ?c, "connection terminated"),
            None => tracing::info!(id = conn.id, peer = peer.as_deref(), "connection closed by peer"),
        }
        let _ = self.events.send(ConnectionEvent::Terminated { peer, cause });
    }

    /// Run one decoded PDU in a short-lived task under the execution cap.
    /// Returns the terminating cause when the connection must go down.
    async fn dispatch(&self, conn: &Arc<ConnectionHandle>, pdu: Pdu) -> Option<TerminateCause> {
        let header = match pdu.header() {
            Some(h) => h.clone(),
            None => {
                if let Pdu::Unknown(tag) = pdu {
                    tracing::warn!(id = conn.id, tag, "unknown command - discarded");
                }
                return None;
            }
        };
        if conn.peer().is_none() {
            self.identify(&header.sender, conn);
        }
        conn.set_state(ConnectionState::Active);
        tracing::debug!(id = conn.id, command = pdu.command_name(), format = %header.format, "dispatching pdu");

        let registry = self.registry.clone();
        let task_conn = conn.clone();
        let task = tokio::task::spawn_blocking(move || execute_pdu(&registry, &task_conn, pdu));
        let outcome = tokio::time::timeout(self.max_execution_time, task).await;
        conn.set_state(ConnectionState::Identified);
        match outcome {
            Err(_) => Some(TerminateCause::Timeout),
            Ok(Err(join)) => Some(TerminateCause::Protocol(format!("pdu task failed: {join}"))),
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(e))) => Some(TerminateCause::Protocol(e.to_string())),
        }
    }
}

fn execute_pdu(
    registry: &EngineRegistry,
    conn: &Arc<ConnectionHandle>,
    pdu: Pdu,
) -> Result<(), RegistryError> {
    match pdu {
        Pdu::Interest(header) => {
            let engine = registry.resolve(&header.format)?;
            engine.handle_interest(&header, conn.as_ref())?;
        }
        Pdu::Offer(header) => {
            let engine = registry.resolve(&header.format)?;
            engine.handle_offer(&header)?;
        }
        Pdu::Assimilate { header, payload } => {
            let engine = registry.resolve(&header.format)?;
            let listener = registry.listener(&header.format)?;
            engine.handle_assimilate(&header, &payload, listener.as_ref())?;
        }
        Pdu::Unknown(_) => {}
    }
    Ok(())
}

async fn write_loop<W>(mut writer: W, mut rx: mpsc::UnboundedReceiver<Outbound>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Frame(frame) => {
                if writer.write_all(&frame).await.is_err() {
                    break;
                }
            }
            Outbound::Close => break,
        }
    }
    let _ = writer.shutdown().await;
}

async fn run_worker<R>(
    manager: Arc<ConnectionManager>,
    conn: Arc<ConnectionHandle>,
    mut reader: R,
    writer_task: JoinHandle<()>,
) where
    R: AsyncRead + Unpin,
{
    push_interests(&manager, &conn);

    let mut buf: Vec<u8> = Vec::new();
    let mut scratch = [0u8; READ_BUF_SIZE];
    let cause: Option<TerminateCause> = loop {
        // drain every complete frame already buffered
        match protocol::decode_frame(&buf) {
            Ok((pdu, consumed)) => {
                buf.drain(..consumed);
                if let Some(cause) = manager.dispatch(&conn, pdu).await {
                    break Some(cause);
                }
                conn.drain_sources();
                continue;
            }
            Err(FrameDecodeError::NeedMore) => {}
            Err(e) => break Some(TerminateCause::Protocol(e.to_string())),
        }
        tokio::select! {
            _ = conn.ready.notified() => {
                conn.drain_sources();
            }
            read = reader.read(&mut scratch) => match read {
                Ok(0) => {
                    if buf.is_empty() {
                        // end-of-stream at a frame boundary: peer closed, not an error
                        break None;
                    }
                    break Some(TerminateCause::Protocol("stream ended mid frame".to_string()));
                }
                Ok(n) => buf.extend_from_slice(&scratch[..n]),
                Err(e) => break Some(TerminateCause::Io(e.to_string())),
            },
        }
    };

    manager.terminate(&conn, cause);
    // output direction first, then the reader is dropped with this task
    conn.close_outbound();
    let _ = writer_task.await;
    manager.finished(Some(conn.id));
}

/// Issue one INTEREST per registered format, sender is the owner. The peer
/// does the same; its first PDU identifies it.
fn push_interests(manager: &ConnectionManager, conn: &Arc<ConnectionHandle>) {
    for format in manager.registry.formats() {
        let interest = Pdu::Interest(PduHeader {
            sender: manager.registry.owner().to_string(),
            recipient: None,
            format,
            uri: None,
            era: None,
            signed: conn.is_signed(),
        });
        match protocol::encode_frame(&interest) {
            Ok(frame) => conn.send_frame(frame),
            Err(e) => tracing::warn!(id = conn.id, "could not encode interest: {e}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pollen_core::codec::ChunkReceivedListener;
    use pollen_core::era::Era;
    use pollen_core::registry::EngineSetting;
    use tokio::io::{duplex, split, AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);

    struct NullListener;

    impl ChunkReceivedListener for NullListener {
        fn chunk_received(&self, _sender: &str, _uri: &str, _era: Era) {}
    }

    struct SlowListener(Duration);

    impl ChunkReceivedListener for SlowListener {
        fn chunk_received(&self, _sender: &str, _uri: &str, _era: Era) {
            std::thread::sleep(self.0);
        }
    }

    fn test_manager(
        dir: &tempfile::TempDir,
        listener: Arc<dyn ChunkReceivedListener>,
    ) -> Arc<ConnectionManager> {
        let registry = EngineRegistry::from_settings(
            "owner",
            dir.path(),
            vec![EngineSetting {
                format: "chat".into(),
                folder: "chat".into(),
                listener,
            }],
        )
        .unwrap();
        ConnectionManager::new(Arc::new(registry), DEFAULT_MAX_EXECUTION_TIME)
    }

    fn attach(
        manager: &Arc<ConnectionManager>,
        buffer: usize,
    ) -> (
        Arc<ConnectionHandle>,
        ReadHalf<DuplexStream>,
        WriteHalf<DuplexStream>,
    ) {
        let (client, server) = duplex(buffer);
        let (server_r, server_w) = split(server);
        let conn = manager.handle_connection(server_r, server_w, false);
        let (client_r, client_w) = split(client);
        (conn, client_r, client_w)
    }

    fn interest_frame(sender: &str) -> Vec<u8> {
        protocol::encode_frame(&Pdu::Interest(PduHeader {
            sender: sender.into(),
            recipient: None,
            format: "chat".into(),
            uri: None,
            era: None,
            signed: false,
        }))
        .unwrap()
    }

    async fn wait_identified(
        events: &mut broadcast::Receiver<ConnectionEvent>,
        peer: &str,
    ) -> Arc<ConnectionHandle> {
        loop {
            let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let ConnectionEvent::Identified { peer: p, connection } = event {
                if p == peer {
                    return connection;
                }
            }
        }
    }

    async fn wait_terminated(
        events: &mut broadcast::Receiver<ConnectionEvent>,
    ) -> (Option<String>, Option<TerminateCause>) {
        loop {
            let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
            if let ConnectionEvent::Terminated { peer, cause } = event {
                return (peer, cause);
            }
        }
    }

    #[tokio::test]
    async fn first_pdu_identifies_the_peer() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        let mut events = manager.subscribe();
        let (conn, _client_r, mut client_w) = attach(&manager, 64 * 1024);
        assert_eq!(conn.state(), ConnectionState::Opened);
        assert!(conn.peer().is_none());

        client_w.write_all(&interest_frame("bob")).await.unwrap();
        let identified = wait_identified(&mut events, "bob").await;
        assert_eq!(identified.id(), conn.id());
        assert!(manager.exists_connection("bob"));
        assert_eq!(conn.peer().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn open_pushes_one_interest_per_format() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        let (_conn, mut client_r, _client_w) = attach(&manager, 64 * 1024);

        let mut buf = Vec::new();
        let mut scratch = [0u8; 1024];
        let pdu = loop {
            match protocol::decode_frame(&buf) {
                Ok((pdu, _)) => break pdu,
                Err(FrameDecodeError::NeedMore) => {
                    let n = timeout(WAIT, client_r.read(&mut scratch)).await.unwrap().unwrap();
                    assert!(n > 0);
                    buf.extend_from_slice(&scratch[..n]);
                }
                Err(e) => panic!("decode failed: {e}"),
            }
        };
        match pdu {
            Pdu::Interest(h) => {
                assert_eq!(h.sender, "owner");
                assert_eq!(h.format, "chat");
            }
            other => panic!("expected interest, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn clean_close_terminates_without_cause() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        let mut events = manager.subscribe();
        let (conn, client_r, mut client_w) = attach(&manager, 64 * 1024);

        client_w.write_all(&interest_frame("bob")).await.unwrap();
        wait_identified(&mut events, "bob").await;

        client_w.shutdown().await.unwrap();
        drop(client_w);
        drop(client_r);
        let (peer, cause) = wait_terminated(&mut events).await;
        assert_eq!(peer.as_deref(), Some("bob"));
        assert!(cause.is_none());
        assert!(!manager.exists_connection("bob"));
        assert_eq!(conn.state(), ConnectionState::Terminated);
    }

    #[tokio::test]
    async fn unknown_command_is_discarded_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        let mut events = manager.subscribe();
        let (_conn, _client_r, mut client_w) = attach(&manager, 64 * 1024);

        // unknown tag 0x99, minimal body
        let mut frame = Vec::new();
        frame.extend_from_slice(&2u32.to_le_bytes());
        frame.push(0x99);
        frame.push(0);
        client_w.write_all(&frame).await.unwrap();
        // the connection survives and still identifies from the next PDU
        client_w.write_all(&interest_frame("bob")).await.unwrap();
        wait_identified(&mut events, "bob").await;
        assert!(manager.exists_connection("bob"));
    }

    #[tokio::test]
    async fn assimilate_lands_in_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        let mut events = manager.subscribe();
        let (_conn, _client_r, mut client_w) = attach(&manager, 64 * 1024);

        let payload = pollen_core::codec::encode_unit("pollen://topic", &["hello"]);
        let frame = protocol::encode_frame(&Pdu::Assimilate {
            header: PduHeader {
                sender: "bob".into(),
                recipient: Some("owner".into()),
                format: "chat".into(),
                uri: Some("pollen://topic".into()),
                era: None,
                signed: false,
            },
            payload,
        })
        .unwrap();
        client_w.write_all(&frame).await.unwrap();
        wait_identified(&mut events, "bob").await;

        let engine = manager.registry().resolve("chat").unwrap();
        let era = engine.era();
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            if engine.storage().exists_chunk("pollen://topic", era) {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "chunk never stored");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            engine
                .storage()
                .chunk("pollen://topic", era)
                .unwrap()
                .messages()
                .unwrap(),
            ["hello"]
        );
    }

    #[tokio::test]
    async fn execution_cap_terminates_the_connection() {
        let dir = tempfile::tempdir().unwrap();
        let registry = EngineRegistry::from_settings(
            "owner",
            dir.path(),
            vec![EngineSetting {
                format: "chat".into(),
                folder: "chat".into(),
                listener: Arc::new(SlowListener(Duration::from_millis(500))),
            }],
        )
        .unwrap();
        let manager = ConnectionManager::new(Arc::new(registry), Duration::from_millis(50));
        let mut events = manager.subscribe();
        let (_conn, _client_r, mut client_w) = attach(&manager, 64 * 1024);

        let payload = pollen_core::codec::encode_unit("u", &["slow"]);
        let frame = protocol::encode_frame(&Pdu::Assimilate {
            header: PduHeader {
                sender: "bob".into(),
                recipient: None,
                format: "chat".into(),
                uri: Some("u".into()),
                era: None,
                signed: false,
            },
            payload,
        })
        .unwrap();
        client_w.write_all(&frame).await.unwrap();
        let (_, cause) = wait_terminated(&mut events).await;
        assert!(matches!(cause, Some(TerminateCause::Timeout)));
    }

    #[tokio::test]
    async fn two_connections_keep_independent_mappings() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        let mut events = manager.subscribe();
        let (_c1, r1, mut w1) = attach(&manager, 64 * 1024);
        let (_c2, r2, mut w2) = attach(&manager, 64 * 1024);

        w1.write_all(&interest_frame("bert")).await.unwrap();
        w2.write_all(&interest_frame("clara")).await.unwrap();
        for _ in 0..2 {
            let event = timeout(WAIT, events.recv()).await.unwrap().unwrap();
            assert!(matches!(event, ConnectionEvent::Identified { .. }));
        }
        assert!(manager.exists_connection("bert"));
        assert!(manager.exists_connection("clara"));

        w1.shutdown().await.unwrap();
        drop(w1);
        drop(r1);
        let (peer, _) = wait_terminated(&mut events).await;
        assert_eq!(peer.as_deref(), Some("bert"));
        // the other worker never observed its own mapping disappear
        assert!(!manager.exists_connection("bert"));
        assert!(manager.exists_connection("clara"));
        drop(w2);
        drop(r2);
    }

    #[tokio::test]
    async fn completion_reports_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let manager = test_manager(&dir, Arc::new(NullListener));
        // a report without a worker and a report for an unknown worker are
        // both quiet no-ops
        manager.finished(None);
        manager.finished(Some(4711));
        assert_eq!(manager.running_workers(), 0);
    }
}
