//! The in-process broadcast engine.
//!
//! The Hub owns the live session set, the live room set, and the
//! client-to-room assignment, and reconciles three sources of concurrent
//! mutation: local socket events, local admin operations, and remote bus
//! deliveries. All state-changing operations that need strict
//! serialization pass through the event loop in [`Hub::run`].

pub mod bridge;
pub mod fanout;
pub mod membership;
pub mod rooms;

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::bus::Bus;
use crate::config::Config;
use crate::envelope::{clock_prefix, Envelope, EnvelopeKind};
use crate::error::HubError;
use crate::repository::Repository;
use crate::room::Room;
use crate::session::{CloseCode, Session, SessionId};

use bridge::BridgeSubscriptions;

/// Channel capacity for Register, Unregister, and Broadcast. Buffered to
/// absorb bursts without blocking the event loop's peers.
const CHANNEL_CAPACITY: usize = 100;

/// Deadline for inter-task channel sends that are not the event loop's own
/// inbound. On timeout the message is logged and dropped.
pub const SEND_DEADLINE: Duration = Duration::from_secs(1);

/// How long the transport waits for the event loop to complete a
/// registration.
pub const REGISTRATION_DEADLINE: Duration = Duration::from_secs(5);

/// Registries and the client-to-room index, all guarded by the registry
/// lock. Lock acquisition order: registry lock, then the room-operation
/// lock, then any room's own lock.
pub(crate) struct HubState {
    pub(crate) sessions: HashMap<SessionId, Arc<Session>>,
    pub(crate) rooms: HashMap<String, Arc<Room>>,
    /// Mirrors the rooms' member sets so Leave/Unregister locate the
    /// current room in O(1).
    pub(crate) session_rooms: HashMap<SessionId, Arc<Room>>,
    pub(crate) user_count: usize,
}

struct Inbox {
    register_rx: mpsc::Receiver<Arc<Session>>,
    unregister_rx: mpsc::Receiver<Arc<Session>>,
    broadcast_rx: mpsc::Receiver<Envelope>,
}

pub struct Hub {
    pub(crate) state: RwLock<HubState>,
    /// Serializes join/leave sequences so a single session cannot be
    /// half-joined to two rooms. Acquired after the registry lock.
    pub(crate) room_op: Mutex<()>,
    register_tx: mpsc::Sender<Arc<Session>>,
    unregister_tx: mpsc::Sender<Arc<Session>>,
    broadcast_tx: mpsc::Sender<Envelope>,
    inbox: Mutex<Option<Inbox>>,
    pub(crate) repo: Option<Arc<dyn Repository>>,
    pub(crate) bus: Option<Arc<dyn Bus>>,
    pub(crate) subscriptions: Mutex<BridgeSubscriptions>,
    /// Self-reference handed to bus delivery handlers; a dead Weak makes a
    /// late delivery a no-op instead of keeping the Hub alive.
    pub(crate) self_ref: Weak<Hub>,
    shutdown: CancellationToken,
    pub(crate) server_id: String,
    pub(crate) max_message_size: usize,
    pub(crate) default_room_capacity: usize,
}

impl Hub {
    pub fn new(
        config: &Config,
        repo: Option<Arc<dyn Repository>>,
        bus: Option<Arc<dyn Bus>>,
        shutdown: CancellationToken,
    ) -> Arc<Self> {
        let (register_tx, register_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = mpsc::channel(CHANNEL_CAPACITY);

        Arc::new_cyclic(|self_ref| Self {
            state: RwLock::new(HubState {
                sessions: HashMap::new(),
                rooms: HashMap::new(),
                session_rooms: HashMap::new(),
                user_count: 0,
            }),
            room_op: Mutex::new(()),
            register_tx,
            unregister_tx,
            broadcast_tx,
            inbox: Mutex::new(Some(Inbox {
                register_rx,
                unregister_rx,
                broadcast_rx,
            })),
            repo,
            bus,
            subscriptions: Mutex::new(BridgeSubscriptions::default()),
            self_ref: self_ref.clone(),
            shutdown,
            server_id: config.server_id.clone(),
            max_message_size: config.max_message_size,
            default_room_capacity: config.default_room_capacity,
        })
    }

    /// Submit a session for registration. The caller then waits on the
    /// session's Registered latch (bounded by [`REGISTRATION_DEADLINE`]).
    pub async fn register(&self, session: Arc<Session>) -> Result<(), HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Shutdown);
        }
        self.register_tx
            .send(session)
            .await
            .map_err(|_| HubError::Shutdown)
    }

    /// Schedule a session for unregistration. Degrades to log-and-drop if
    /// the channel stays full past the send deadline.
    pub async fn unregister(&self, session: Arc<Session>) {
        let name = session.name.clone();
        if tokio::time::timeout(SEND_DEADLINE, self.unregister_tx.send(session))
            .await
            .is_err()
        {
            tracing::warn!(session = %name, "unregister queue full; dropping");
        }
    }

    /// Queue an envelope for the event loop's Broadcast path. Degrades to
    /// log-and-drop on timeout.
    pub async fn broadcast(&self, envelope: Envelope) {
        if tokio::time::timeout(SEND_DEADLINE, self.broadcast_tx.send(envelope))
            .await
            .is_err()
        {
            tracing::warn!("broadcast queue full; dropping envelope");
        }
    }

    /// The room a session currently occupies, if any.
    pub fn current_room(&self, id: &SessionId) -> Option<Arc<Room>> {
        self.state.read().session_rooms.get(id).cloned()
    }

    pub fn session_count(&self) -> usize {
        self.state.read().user_count
    }

    pub fn is_registered(&self, id: &SessionId) -> bool {
        self.state.read().sessions.contains_key(id)
    }

    /// The event loop. Runs until the cancellation token fires; spawn it
    /// exactly once.
    pub async fn run(self: Arc<Self>) {
        let inbox = self.inbox.lock().take();
        let Some(Inbox {
            mut register_rx,
            mut unregister_rx,
            mut broadcast_rx,
        }) = inbox
        else {
            tracing::error!("hub event loop started twice");
            return;
        };

        if self.repo.is_some() {
            self.load_rooms().await;
        }
        if self.bus.is_some() {
            self.install_bridge().await;
        }

        tracing::info!(server_id = %self.server_id, "hub event loop started");

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    self.shut_down().await;
                    return;
                }
                Some(session) = register_rx.recv() => {
                    self.handle_register(session);
                }
                Some(session) = unregister_rx.recv() => {
                    self.handle_unregister(session).await;
                }
                Some(envelope) = broadcast_rx.recv() => {
                    self.handle_broadcast(envelope).await;
                }
            }
        }
    }

    fn handle_register(&self, session: Arc<Session>) {
        let installed = {
            let mut state = self.state.write();
            if state.sessions.contains_key(&session.id) {
                false
            } else {
                state.sessions.insert(session.id.clone(), session.clone());
                state.user_count += 1;
                true
            }
        };

        // The latch opens at most once either way; re-registration is a
        // no-op beyond that.
        session.registered().open();

        if installed {
            tracing::info!(
                session = %session.name,
                total = self.session_count(),
                "session registered"
            );
        }
    }

    async fn handle_unregister(&self, session: Arc<Session>) {
        // Run the membership leave path first so the index and the room's
        // member set stay in agreement.
        let left = {
            let mut state = self.state.write();
            let _op = self.room_op.lock();
            membership::leave_locked(&mut state, &session)
        };

        let removed = {
            let mut state = self.state.write();
            if state.sessions.remove(&session.id).is_some() {
                state.user_count -= 1;
                true
            } else {
                false
            }
        };

        if let Some(room) = left {
            self.run_leave_effects(&session, &room, false).await;
        }

        if !removed {
            return;
        }

        session.close(CloseCode::Normal, "").await;
        tracing::info!(
            session = %session.name,
            total = self.session_count(),
            "session disconnected"
        );

        let notice = Envelope::local(
            EnvelopeKind::Leave,
            format!("{} {} has left the chat", clock_prefix(), session.name),
        );
        self.handle_broadcast(notice).await;
    }

    /// Deliver an envelope. Room-targeted envelopes route through fan-out;
    /// the rest go to every registered session (minus the sender for
    /// `chat`), with failed writers removed afterwards.
    pub(crate) async fn handle_broadcast(&self, envelope: Envelope) {
        if let Some(target) = &envelope.target {
            let room = self.get_room(target);
            match room {
                Some(room) => self.broadcast_to_room(&room, envelope).await,
                None => tracing::debug!(room = %target, "dropping envelope for unknown room"),
            }
            return;
        }

        self.persist_global_chat(&envelope).await;

        let recipients: Vec<Arc<Session>> =
            self.state.read().sessions.values().cloned().collect();

        let mut failed: Vec<Arc<Session>> = Vec::new();
        for session in &recipients {
            // Chat skips its sender; join/leave/delete-room notifications
            // go to everyone.
            if envelope.kind == EnvelopeKind::Chat
                && envelope.sender.as_ref() == Some(&session.id)
            {
                continue;
            }
            if !session.has_transport() {
                continue;
            }
            if session.send(&envelope.content).await.is_err() {
                failed.push(session.clone());
            }
        }

        if !failed.is_empty() {
            {
                let mut state = self.state.write();
                let _op = self.room_op.lock();
                for session in &failed {
                    // Silent index cleanup; the session is gone, nobody is
                    // left to notify it.
                    membership::leave_locked(&mut state, session);
                    if state.sessions.remove(&session.id).is_some() {
                        state.user_count -= 1;
                    }
                }
            }
            for session in &failed {
                tracing::warn!(session = %session.name, "write failed; removing session");
                session.close(CloseCode::Internal, "write error").await;
            }
        }

        // Locally originated global envelopes also go out on the bus.
        if envelope.message_id.is_none() {
            self.publish_global(&envelope).await;
        }
    }

    async fn persist_global_chat(&self, envelope: &Envelope) {
        if envelope.kind != EnvelopeKind::Chat || envelope.message_id.is_some() {
            return;
        }
        let Some(repo) = &self.repo else { return };
        let Some(sender_id) = &envelope.sender else { return };
        let sender = self.state.read().sessions.get(sender_id).cloned();
        let Some(sender) = sender else { return };
        let Some(user_id) = &sender.user_id else { return };
        if !sender.authenticated {
            return;
        }
        // Global messages persist with a null room id. They are not
        // surfaced through get_messages.
        if let Err(err) = repo
            .create_message(None, user_id, &sender.name, &envelope.content)
            .await
        {
            tracing::warn!(?err, "failed to persist global chat message");
        }
    }

    async fn shut_down(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut state = self.state.write();
            state.session_rooms.clear();
            state.user_count = 0;
            state.sessions.drain().map(|(_, s)| s).collect()
        };

        for session in sessions {
            session.close(CloseCode::Normal, "server shutting down").await;
        }

        self.teardown_bridge();
        tracing::info!(server_id = %self.server_id, "hub event loop stopped");
    }
}
