//! Server communicator
//!
//! The instance that owns the music library. Accepts any number of client
//! connections, keeps a retained message per state topic so late joiners
//! get a full snapshot on subscribe, fans local changes out to every
//! subscribed connection, and applies inbound client publishes to its own
//! model before forwarding them to the other clients.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tremolo_common::model::{AudioService, ChangeBus, ModelEvent, ObserverId};

use crate::error::{Error, Result};
use crate::status::StatusToken;
use crate::sync::locks::TopicLocks;
use crate::sync::queue::PublishQueue;
use crate::sync::topics::{self, Command, TopicRef};
use crate::sync::transport::{read_frame, write_frame, Frame, QoS, WireMessage};
use crate::sync::{wait_closed, AckRegistry, ConnState, ACK_TIMEOUT};

struct ConnEntry {
    writer: mpsc::Sender<Frame>,
    topics: HashSet<String>,
}

struct ServerShared {
    service: Arc<RwLock<AudioService>>,
    locks: TopicLocks,
    queue: PublishQueue,
    acks: AckRegistry,
    retain: Mutex<HashMap<String, WireMessage>>,
    conns: Mutex<HashMap<u64, ConnEntry>>,
    next_conn: AtomicU64,
    backfill: Notify,
    state: watch::Sender<ConnState>,
}

impl ServerShared {
    fn set_state(&self, state: ConnState) {
        let _ = self.state.send(state);
    }

    /// Writers of every connection subscribed to `topic`, optionally
    /// excluding the connection the message arrived on. Senders are
    /// cloned out so no await happens under the table lock.
    fn subscribers(&self, topic: &str, except: Option<u64>) -> Vec<mpsc::Sender<Frame>> {
        self.conns
            .lock()
            .expect("connection table poisoned")
            .iter()
            .filter(|(id, entry)| Some(**id) != except && entry.topics.contains(topic))
            .map(|(_, entry)| entry.writer.clone())
            .collect()
    }

    fn report_apply_error(&self, topic: &str, error: &Error) {
        error!("failed to apply {}: {}", topic, error);
        self.queue
            .enqueue(topics::encode_debug(&format!("{topic}: {error}")));
    }

    fn store_retained(&self, message: &WireMessage) {
        if message.retain {
            self.retain
                .lock()
                .expect("retain store poisoned")
                .insert(message.topic.clone(), message.clone());
        }
    }
}

/// Communicator in the server role.
pub struct SyncServer {
    shared: Arc<ServerShared>,
    bus: Arc<ChangeBus>,
    observer: ObserverId,
    state_rx: watch::Receiver<ConnState>,
    local_addr: SocketAddr,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncServer {
    /// Bind the listening socket (the Opening stage). Port 0 picks an
    /// ephemeral port, readable afterwards through [`local_addr`].
    ///
    /// [`local_addr`]: SyncServer::local_addr
    pub async fn bind(service: Arc<RwLock<AudioService>>, port: u16) -> Result<Self> {
        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|e| Error::Transport(format!("bind port {port}: {e}")))?;
        let local_addr = listener.local_addr()?;
        info!("listening on {}", local_addr);

        let (state_tx, state_rx) = watch::channel(ConnState::Opening);
        let bus = service.read().await.bus().clone();
        let shared = Arc::new(ServerShared {
            service,
            locks: TopicLocks::new(),
            queue: PublishQueue::new(),
            acks: AckRegistry::new(),
            retain: Mutex::new(HashMap::new()),
            conns: Mutex::new(HashMap::new()),
            next_conn: AtomicU64::new(0),
            backfill: Notify::new(),
            state: state_tx,
        });

        let tasks = vec![
            tokio::spawn(accept_loop(listener, shared.clone())),
            tokio::spawn(dispatch_loop(shared.clone(), state_rx.clone())),
            tokio::spawn(backfill_loop(shared.clone(), state_rx.clone())),
        ];

        let observer = {
            let weak = Arc::downgrade(&shared);
            bus.observe(move |event| {
                let Some(shared) = weak.upgrade() else { return };
                // The observer may run under the model write lock, so the
                // retained-state backfill happens on its own task.
                if matches!(event, ModelEvent::Playlists { .. }) {
                    shared.backfill.notify_one();
                }
                if let Some(message) = topics::encode_event(event) {
                    if shared.locks.is_locked(&message.topic, &message.payload) {
                        return;
                    }
                    shared.queue.enqueue(message);
                }
            })
        };

        Ok(Self {
            shared,
            bus,
            observer,
            state_rx,
            local_addr,
            tasks: Mutex::new(tasks),
        })
    }

    /// The bound address, mainly useful after binding port 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The server's sync stage: publish the entire current state as
    /// retained messages so any client connecting later receives a full
    /// snapshot without request/response. Completes without waiting on
    /// clients; there may be none yet.
    pub async fn sync(&self, _token: &StatusToken) -> Result<()> {
        self.shared.set_state(ConnState::Syncing);
        self.publish_snapshot().await;
        self.shared.set_state(ConnState::Open);
        info!("snapshot published, communicator open");
        Ok(())
    }

    /// Write the current state into the retain store and queue it out to
    /// whoever is already subscribed.
    pub async fn publish_snapshot(&self) {
        let messages = {
            let service = self.shared.service.read().await;
            topics::snapshot_messages(&service)
        };
        for message in messages {
            self.shared.store_retained(&message);
            self.shared.queue.enqueue(message);
        }
    }

    /// Run a transport command against the local model and replay it to
    /// connected clients.
    pub async fn send_command(&self, command: Command) -> Result<()> {
        let message = topics::encode_command(command);
        {
            let mut service = self.shared.service.write().await;
            topics::apply_message(&mut service, &TopicRef::Commands, &message.payload)?;
        }
        self.shared.queue.enqueue(message);
        Ok(())
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    pub async fn wait_closed(&self) {
        wait_closed(self.state_rx.clone()).await;
    }

    /// Stop listening and drop all client connections.
    pub async fn close(&self) {
        self.bus.unobserve(self.observer);
        self.shared.set_state(ConnState::Closed);
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
        self.shared
            .conns
            .lock()
            .expect("connection table poisoned")
            .clear();
    }
}

impl Drop for SyncServer {
    fn drop(&mut self) {
        self.bus.unobserve(self.observer);
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let _ = stream.set_nodelay(true);
                let conn_id = shared.next_conn.fetch_add(1, Ordering::Relaxed);
                info!("client {} connected from {}", conn_id, peer);

                let (read_half, write_half) = stream.into_split();
                let (writer_tx, writer_rx) = mpsc::channel(64);
                shared
                    .conns
                    .lock()
                    .expect("connection table poisoned")
                    .insert(
                        conn_id,
                        ConnEntry {
                            writer: writer_tx,
                            topics: HashSet::new(),
                        },
                    );
                tokio::spawn(conn_writer_loop(write_half, writer_rx));
                tokio::spawn(conn_read_loop(shared.clone(), conn_id, read_half));
            }
            Err(e) => {
                warn!("accept failed: {}", e);
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

async fn conn_writer_loop(mut stream: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            debug!("client write failed: {}", e);
            break;
        }
    }
}

async fn conn_read_loop(shared: Arc<ServerShared>, conn_id: u64, mut stream: OwnedReadHalf) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Frame::Publish { id, message }) => {
                handle_inbound(&shared, conn_id, id, message).await;
            }
            Ok(Frame::Ack { id }) => shared.acks.resolve(id),
            Ok(Frame::Subscribe { topics }) => handle_subscribe(&shared, conn_id, topics).await,
            Ok(Frame::Unsubscribe { topics }) => {
                let mut conns = shared.conns.lock().expect("connection table poisoned");
                if let Some(entry) = conns.get_mut(&conn_id) {
                    for topic in &topics {
                        entry.topics.remove(topic);
                    }
                }
            }
            Err(Error::ConnectionClosed) => break,
            Err(e) => {
                error!("client {} receive failed: {}", conn_id, e);
                break;
            }
        }
    }
    shared
        .conns
        .lock()
        .expect("connection table poisoned")
        .remove(&conn_id);
    info!("client {} disconnected", conn_id);
}

/// Record the subscription and deliver the retained message of every
/// newly subscribed topic, so a fresh client drains its sync countdown
/// without any request/response exchange.
///
/// The subscription is recorded before the retain store is read. Every
/// publish path stores retained state before fanning out, so a message
/// stored concurrently with this subscribe reaches the connection at
/// least once: through the fan-out, the retained delivery, or both.
async fn handle_subscribe(shared: &Arc<ServerShared>, conn_id: u64, topics: Vec<String>) {
    let writer = {
        let mut conns = shared.conns.lock().expect("connection table poisoned");
        let Some(entry) = conns.get_mut(&conn_id) else { return };
        entry.topics.extend(topics.iter().cloned());
        entry.writer.clone()
    };
    let retained: Vec<WireMessage> = {
        let retain = shared.retain.lock().expect("retain store poisoned");
        topics.iter().filter_map(|t| retain.get(t).cloned()).collect()
    };
    for message in retained {
        // Acks for retained deliveries are not tracked; the registry
        // ignores them on arrival.
        let id = shared.acks.next_id();
        let _ = writer.send(Frame::Publish { id, message }).await;
    }
}

/// One inbound client publish: forward to the other subscribed clients,
/// apply to the local model under the topic lock, then acknowledge.
async fn handle_inbound(shared: &Arc<ServerShared>, conn_id: u64, id: u32, message: WireMessage) {
    let needs_ack = message.qos == QoS::AtLeastOnce;
    shared.store_retained(&message);

    for writer in shared.subscribers(&message.topic, Some(conn_id)) {
        let forward_id = shared.acks.next_id();
        let _ = writer
            .send(Frame::Publish {
                id: forward_id,
                message: message.clone(),
            })
            .await;
    }

    if message.topic == topics::TOPIC_DEBUG {
        warn!("client {}: {}", conn_id, String::from_utf8_lossy(&message.payload));
    } else {
        match topics::parse_topic(&message.topic) {
            Err(e) => shared.report_apply_error(&message.topic, &e),
            Ok(topic_ref) => {
                shared
                    .locks
                    .lock(&message.topic, message.payload.clone())
                    .await;
                let applied = {
                    let mut service = shared.service.write().await;
                    topics::apply_message(&mut service, &topic_ref, &message.payload)
                };
                shared.locks.unlock(&message.topic);
                if let Err(e) = applied {
                    shared.report_apply_error(&message.topic, &e);
                }
            }
        }
    }

    if needs_ack {
        let writer = {
            let conns = shared.conns.lock().expect("connection table poisoned");
            conns.get(&conn_id).map(|entry| entry.writer.clone())
        };
        if let Some(writer) = writer {
            let _ = writer.send(Frame::Ack { id }).await;
        }
    }
}

/// Fan one queued local change out to every subscribed connection. For
/// guaranteed-delivery topics the dispatcher waits for the first ack from
/// any recipient; with nobody subscribed it proceeds immediately.
async fn dispatch_loop(shared: Arc<ServerShared>, state_rx: watch::Receiver<ConnState>) {
    loop {
        let message = tokio::select! {
            message = shared.queue.dequeue() => message,
            _ = wait_closed(state_rx.clone()) => break,
        };
        shared.store_retained(&message);

        let writers = shared.subscribers(&message.topic, None);
        if writers.is_empty() {
            continue;
        }
        let id = shared.acks.next_id();
        let ack_rx = (message.qos == QoS::AtLeastOnce).then(|| shared.acks.register(id));
        for writer in writers {
            let _ = writer
                .send(Frame::Publish {
                    id,
                    message: message.clone(),
                })
                .await;
        }
        if let Some(rx) = ack_rx {
            if tokio::time::timeout(ACK_TIMEOUT, rx).await.is_err() {
                shared.acks.forget(id);
                if !shared.queue.is_enqueued(&message.topic) {
                    debug!("no ack for {} in time, re-enqueueing", message.topic);
                    shared.queue.enqueue(message);
                }
            }
        }
    }
}

/// A playlist added after the start snapshot publishes only the topics
/// that actually changed; its remaining topics would have no retained
/// entry, and a client syncing later would wait on them forever. Whenever
/// the playlist list changes, fill the gaps from the current state.
async fn backfill_loop(shared: Arc<ServerShared>, state_rx: watch::Receiver<ConnState>) {
    loop {
        let notified = shared.backfill.notified();
        tokio::select! {
            _ = notified => {}
            _ = wait_closed(state_rx.clone()) => break,
        }
        let messages = {
            let service = shared.service.read().await;
            topics::snapshot_messages(&service)
        };
        let missing: Vec<WireMessage> = {
            let retain = shared.retain.lock().expect("retain store poisoned");
            messages
                .into_iter()
                .filter(|message| !retain.contains_key(&message.topic))
                .collect()
        };
        if missing.is_empty() {
            continue;
        }
        debug!("backfilling {} retained topics", missing.len());
        for message in missing {
            shared.store_retained(&message);
            shared.queue.enqueue(message);
        }
    }
}
