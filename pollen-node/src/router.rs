//! Online message router: accelerates delivery of application messages over
//! connections that are already open. Recipients without a live connection
//! are NOT queued here; they are served by the durable chunk-store path.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use pollen_core::codec;
use pollen_core::era::Era;
use pollen_core::protocol::{encode_frame, Pdu, PduHeader};

use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionManager, MessageSource};

/// Buffers serialized ASSIMILATE frames per recipient and flushes them, in
/// order, into the recipient's connection.
pub struct OnlineMessageRouter {
    manager: Arc<ConnectionManager>,
    /// recipient -> FIFO of serialized PDU frames
    pending: Mutex<HashMap<String, VecDeque<Vec<u8>>>>,
    /// connection id -> recipient the subscription is bound to
    subscriptions: Mutex<HashMap<u64, String>>,
    /// handle to self, for (un)registering as a connection message source
    self_ref: Weak<OnlineMessageRouter>,
}

impl OnlineMessageRouter {
    pub fn new(manager: Arc<ConnectionManager>) -> Arc<Self> {
        Arc::new_cyclic(|weak| OnlineMessageRouter {
            manager,
            pending: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            self_ref: weak.clone(),
        })
    }

    /// Spawn the lifecycle listener: a connection identifying a recipient
    /// with backlog triggers a flush.
    pub fn run(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let router = self.clone();
        let mut events = router.manager.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Identified { peer, connection }) => {
                        if router.has_pending(&peer) {
                            router.subscribe_connection(&connection, &peer);
                            router.flush(&connection);
                        }
                    }
                    Ok(ConnectionEvent::Terminated { .. }) => {}
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "router lagged behind lifecycle events");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// Queue `payload` as one ASSIMILATE unit for every recipient that has a
    /// live connection right now. Recipients without one are skipped; the
    /// chunk store carries their copy.
    pub fn submit(
        &self,
        format: &str,
        uri: &str,
        recipients: &[String],
        payload: &str,
        era: Era,
    ) -> anyhow::Result<()> {
        for recipient in recipients {
            if !self.manager.exists_connection(recipient) {
                tracing::debug!(recipient, "no connection - leaving delivery to the store");
                continue;
            }
            let Some(conn) = self.manager.connection_for(recipient) else {
                continue;
            };
            self.subscribe_connection(&conn, recipient);
            let frame = encode_frame(&Pdu::Assimilate {
                header: PduHeader {
                    sender: self.manager.registry().owner().to_string(),
                    recipient: Some(recipient.clone()),
                    format: format.to_string(),
                    uri: Some(uri.to_string()),
                    era: Some(era),
                    signed: conn.is_signed(),
                },
                payload: codec::encode_unit(uri, &[payload]),
            })?;
            self.pending
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(recipient.clone())
                .or_default()
                .push_back(frame);
            tracing::debug!(recipient, uri, "online message queued");
            conn.notify_ready();
        }
        Ok(())
    }

    /// Like [`submit`](Self::submit), but the recipients come from the
    /// chunk's persisted recipient set at the format engine's current era.
    pub fn submit_to_stored_recipients(
        &self,
        format: &str,
        uri: &str,
        payload: &str,
    ) -> anyhow::Result<()> {
        let engine = self.manager.registry().resolve(format)?;
        let era = engine.era();
        let recipients = engine.storage().chunk(uri, era)?.recipients()?;
        self.submit(format, uri, &recipients, payload, era)
    }

    /// Detach from the connection, then hand every queued frame for its
    /// recipient over, FIFO. Detaching first means a concurrent submit
    /// re-subscribes and gets drained again instead of parking its frame
    /// behind a dead subscription. A missing subscription is a no-op.
    pub fn flush(&self, conn: &Arc<ConnectionHandle>) {
        let recipient = match self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&conn.id())
        {
            Some(r) => r,
            None => {
                tracing::trace!(id = conn.id(), "flush without subscription - nothing to do");
                return;
            }
        };
        if let Some(source) = self.as_source() {
            conn.remove_message_source(&source);
        }
        let queue = self
            .pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&recipient);
        let mut sent = 0usize;
        if let Some(mut queue) = queue {
            // a frame leaves the queue at handoff: at-most-once
            while let Some(frame) = queue.pop_front() {
                conn.send_frame(frame);
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::debug!(recipient, sent, "online messages flushed");
        }
    }

    pub fn has_pending(&self, recipient: &str) -> bool {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(recipient)
            .is_some_and(|q| !q.is_empty())
    }

    /// Attach this router to the connection; once per (connection, recipient).
    fn subscribe_connection(&self, conn: &Arc<ConnectionHandle>, recipient: &str) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(conn.id())
            .or_insert_with(|| recipient.to_string());
        if let Some(source) = self.as_source() {
            conn.add_message_source(source);
        }
    }

    fn as_source(&self) -> Option<Arc<dyn MessageSource>> {
        self.self_ref
            .upgrade()
            .map(|me| me as Arc<dyn MessageSource>)
    }
}

impl MessageSource for OnlineMessageRouter {
    fn send_messages(&self, connection: &Arc<ConnectionHandle>) {
        self.flush(connection);
    }
}
