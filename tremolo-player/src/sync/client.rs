//! Client communicator
//!
//! Mirrors a remote server instance: connects, subscribes to the full
//! topic set derived from the current snapshot, and blocks in the sync
//! stage until every retained topic has delivered an initial message, so
//! a partially-synced model is never exposed as open. While open, local
//! changes publish outbound (echo-suppressed) and inbound messages apply
//! through the entity setters under the topic lock.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tremolo_common::model::{AudioService, ChangeBus, ModelEvent, ObserverId};

use crate::error::{Error, Result};
use crate::status::StatusToken;
use crate::sync::countdown::SyncCountdown;
use crate::sync::locks::TopicLocks;
use crate::sync::queue::PublishQueue;
use crate::sync::topics::{self, Command, ServiceProp, TopicRef};
use crate::sync::transport::{read_frame, write_frame, Frame, QoS, WireMessage};
use crate::sync::{wait_closed, AckRegistry, ConnState, ACK_TIMEOUT};

struct ClientShared {
    service: Arc<RwLock<AudioService>>,
    locks: TopicLocks,
    queue: PublishQueue,
    countdown: SyncCountdown,
    acks: AckRegistry,
    writer: mpsc::Sender<Frame>,
    state: watch::Sender<ConnState>,
    subscribed: Mutex<HashSet<String>>,
    resync: Notify,
    syncing: AtomicBool,
}

impl ClientShared {
    fn set_state(&self, state: ConnState) {
        let _ = self.state.send(state);
    }

    /// Report a per-message failure on the debug channel and keep going.
    fn report_apply_error(&self, topic: &str, error: &Error) {
        error!("failed to apply {}: {}", topic, error);
        self.queue
            .enqueue(topics::encode_debug(&format!("{topic}: {error}")));
    }

    /// Recompute the subscription set after a playlist add/remove and
    /// (un)subscribe the difference. While syncing, newly subscribed
    /// retained topics also extend the countdown.
    async fn resync_subscriptions(&self) {
        let desired: HashSet<String> = {
            let service = self.service.read().await;
            topics::subscription_topics(&service).into_iter().collect()
        };
        let (added, removed) = {
            let mut subscribed = self.subscribed.lock().expect("subscription set poisoned");
            let added: Vec<String> = desired.difference(&subscribed).cloned().collect();
            let removed: Vec<String> = subscribed.difference(&desired).cloned().collect();
            *subscribed = desired;
            (added, removed)
        };
        if self.syncing.load(Ordering::SeqCst) {
            self.countdown
                .add(added.iter().filter(|t| topics::retain_for(t)).cloned());
        }
        if !added.is_empty() {
            debug!("subscribing {} new topics", added.len());
            let _ = self.writer.send(Frame::Subscribe { topics: added }).await;
        }
        if !removed.is_empty() {
            debug!("unsubscribing {} stale topics", removed.len());
            let _ = self
                .writer
                .send(Frame::Unsubscribe { topics: removed })
                .await;
        }
    }
}

/// Communicator in the client role.
pub struct SyncClient {
    shared: Arc<ClientShared>,
    bus: Arc<ChangeBus>,
    observer: ObserverId,
    state_rx: watch::Receiver<ConnState>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SyncClient {
    /// Open the transport connection (the Opening stage). Failures
    /// propagate to the caller, which decides about retrying.
    pub async fn connect(service: Arc<RwLock<AudioService>>, addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| Error::Transport(format!("connect {addr}: {e}")))?;
        let _ = stream.set_nodelay(true);
        info!("connected to {}", addr);

        let (read_half, write_half) = stream.into_split();
        let (writer_tx, writer_rx) = mpsc::channel(64);
        let (state_tx, state_rx) = watch::channel(ConnState::Opening);

        let bus = service.read().await.bus().clone();
        let shared = Arc::new(ClientShared {
            service,
            locks: TopicLocks::new(),
            queue: PublishQueue::new(),
            countdown: SyncCountdown::new(),
            acks: AckRegistry::new(),
            writer: writer_tx,
            state: state_tx,
            subscribed: Mutex::new(HashSet::new()),
            resync: Notify::new(),
            syncing: AtomicBool::new(false),
        });

        let tasks = vec![
            tokio::spawn(writer_loop(write_half, writer_rx, shared.clone())),
            tokio::spawn(read_loop(read_half, shared.clone())),
            tokio::spawn(dispatch_loop(shared.clone(), state_rx.clone())),
            tokio::spawn(resync_loop(shared.clone(), state_rx.clone())),
        ];

        // Local model changes feed the publish path synchronously, so the
        // echo check runs while the inbound topic lock is still held.
        let observer = {
            let weak = Arc::downgrade(&shared);
            bus.observe(move |event| {
                let Some(shared) = weak.upgrade() else { return };
                // A changed playlist list changes the subscription set,
                // and the observer cannot await; wake the resync task.
                if matches!(event, ModelEvent::Playlists { .. }) {
                    shared.resync.notify_one();
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
            tasks: Mutex::new(tasks),
        })
    }

    /// Subscribe to the full topic set and block until every retained
    /// topic delivered an initial message, the token ended, or the
    /// connection dropped. There is no internal timeout.
    pub async fn sync(&self, token: &StatusToken) -> Result<()> {
        self.shared.syncing.store(true, Ordering::SeqCst);
        self.shared.set_state(ConnState::Syncing);

        let (all_topics, retained) = {
            let service = self.shared.service.read().await;
            (
                topics::subscription_topics(&service),
                topics::retained_topics(&service),
            )
        };
        self.shared
            .subscribed
            .lock()
            .expect("subscription set poisoned")
            .extend(all_topics.iter().cloned());
        self.shared.countdown.add(retained);
        self.shared
            .writer
            .send(Frame::Subscribe { topics: all_topics })
            .await
            .map_err(|_| Error::ConnectionClosed)?;

        tokio::select! {
            _ = self.shared.countdown.wait_empty() => {
                self.shared.syncing.store(false, Ordering::SeqCst);
                self.shared.set_state(ConnState::Open);
                info!("sync complete, communicator open");
                Ok(())
            }
            outcome = token.wait() => {
                Err(Error::Sync(format!("sync ended externally: {outcome:?}")))
            }
            _ = wait_closed(self.state_rx.clone()) => Err(Error::ConnectionClosed),
        }
    }

    pub fn state(&self) -> ConnState {
        *self.state_rx.borrow()
    }

    /// Resolves when the transport drops; the owning lifecycle restarts
    /// the build, the client does not self-heal.
    pub async fn wait_closed(&self) {
        wait_closed(self.state_rx.clone()).await;
    }

    /// Publish a transport command to the server.
    pub fn send_command(&self, command: Command) {
        self.shared.queue.enqueue(topics::encode_command(command));
    }

    /// Deliberate close: detach from the model and stop all loops.
    pub async fn close(&self) {
        self.bus.unobserve(self.observer);
        self.shared.set_state(ConnState::Closed);
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }
}

impl Drop for SyncClient {
    fn drop(&mut self) {
        self.bus.unobserve(self.observer);
        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }
}

async fn writer_loop(
    mut stream: OwnedWriteHalf,
    mut rx: mpsc::Receiver<Frame>,
    shared: Arc<ClientShared>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut stream, &frame).await {
            warn!("write failed: {}", e);
            break;
        }
    }
    shared.set_state(ConnState::Closed);
}

async fn read_loop(mut stream: OwnedReadHalf, shared: Arc<ClientShared>) {
    loop {
        match read_frame(&mut stream).await {
            Ok(Frame::Publish { id, message }) => handle_publish(&shared, id, message).await,
            Ok(Frame::Ack { id }) => shared.acks.resolve(id),
            Ok(frame) => debug!("ignoring unexpected frame from server: {:?}", frame),
            Err(Error::ConnectionClosed) => {
                info!("server closed the connection");
                break;
            }
            Err(e) => {
                error!("receive failed: {}", e);
                break;
            }
        }
    }
    shared.set_state(ConnState::Closed);
}

/// Reworks the subscription set when the local playlist list changes, so
/// a playlist added on this side still receives remote updates to it (the
/// server suppresses the echo of the list itself, so no inbound message
/// triggers the rework). Inbound list changes resubscribe directly in
/// [`handle_publish`].
async fn resync_loop(shared: Arc<ClientShared>, state_rx: watch::Receiver<ConnState>) {
    loop {
        let notified = shared.resync.notified();
        tokio::select! {
            _ = notified => shared.resync_subscriptions().await,
            _ = wait_closed(state_rx.clone()) => break,
        }
    }
}

/// Apply one inbound publish. Failures are reported on the debug channel
/// and never crash the loop; the lock is released on every path.
async fn handle_publish(shared: &Arc<ClientShared>, id: u32, message: WireMessage) {
    let needs_ack = message.qos == QoS::AtLeastOnce;

    if message.topic == topics::TOPIC_DEBUG {
        warn!("remote: {}", String::from_utf8_lossy(&message.payload));
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
                match applied {
                    Ok(()) => {
                        if topic_ref == TopicRef::Service(ServiceProp::Playlists) {
                            shared.resync_subscriptions().await;
                        }
                    }
                    Err(e) => shared.report_apply_error(&message.topic, &e),
                }
            }
        }
    }

    // Count the topic as delivered even when its payload was bad: a
    // single malformed message must not wedge the sync stage.
    if shared.syncing.load(Ordering::SeqCst) {
        shared.countdown.deliver(&message.topic);
    }
    if needs_ack {
        let _ = shared.writer.send(Frame::Ack { id }).await;
    }
}

/// Single-writer dispatcher: dequeue, send, await the ack or time out,
/// and re-enqueue on timeout unless a newer message took the slot.
async fn dispatch_loop(shared: Arc<ClientShared>, state_rx: watch::Receiver<ConnState>) {
    loop {
        let message = tokio::select! {
            message = shared.queue.dequeue() => message,
            _ = wait_closed(state_rx.clone()) => break,
        };
        let id = shared.acks.next_id();
        let ack_rx = (message.qos == QoS::AtLeastOnce).then(|| shared.acks.register(id));
        if shared
            .writer
            .send(Frame::Publish {
                id,
                message: message.clone(),
            })
            .await
            .is_err()
        {
            break;
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
