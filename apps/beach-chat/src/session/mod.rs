//! One chat session: a single task that owns the handshake, the transport and the chat state.
//!
//! Callers talk to it through [`SessionHandle`]. Everything that waits on the network is
//! spawned and reports back as an internal event, so the loop only ever handles one event at a
//! time and never blocks on signaling or transport work.

use std::future::Future;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::time::{Instant, sleep_until};

use crate::chat::{ChatEffect, ChatEngine, ChatMessage};
use crate::config::SessionSettings;
use crate::error::{ChatError, Result};
use crate::handshake::{CandidateAction, HandshakeController, Role};
use crate::record::{SessionResources, lookup_record, open_record};
use crate::signaling::{
    RecordId, SessionRecord, SignalingStore, Subscription, SubscriptionItem,
};
use crate::transport::{
    DataChannel, IceCandidateBlob, PeerConnection, SessionDescription, TransportEvent,
    TransportFactory,
};

mod state;

pub use state::SessionState;

const UPDATE_CAPACITY: usize = 256;

/// Snapshot of a session for UIs that poll instead of following [`SessionUpdate`]s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionView {
    pub state: SessionState,
    pub role: Option<Role>,
    pub session_id: Option<RecordId>,
    pub peer_nickname: String,
    pub peer_typing: bool,
    pub messages: Vec<ChatMessage>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionUpdate {
    StateChanged(SessionState),
    /// The record id is known and can be shared with the other person.
    SessionId(RecordId),
    Message(ChatMessage),
    PeerNamed(String),
    Typing(bool),
    Notification,
    /// Sent once when the session has finished tearing down after a disconnect.
    DisconnectComplete,
    Failed(ChatError),
}

enum Command {
    BeginAsInitiator {
        reply: oneshot::Sender<Result<RecordId>>,
    },
    JoinAsResponder {
        id: RecordId,
        reply: oneshot::Sender<Result<()>>,
    },
    SendChat(String),
    NotifyTyping,
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

type Subscriptions = (Subscription<Option<SessionRecord>>, Subscription<IceCandidateBlob>);

/// Completions of spawned work, fed back into the loop.
enum Internal {
    RecordCreated(Result<RecordId>),
    RecordFetched(Result<SessionRecord>),
    ConnectionCreated(Result<Arc<dyn PeerConnection>>),
    OfferReady(Result<(Arc<dyn DataChannel>, SessionDescription)>),
    Subscribed(Result<Subscriptions>),
    RemoteDescriptionApplied(Result<()>),
    AnswerReady(Result<SessionDescription>),
    AnswerPublished(Result<()>),
    RecordSnapshot(SubscriptionItem<Option<SessionRecord>>),
    RemoteCandidate(SubscriptionItem<IceCandidateBlob>),
    CandidateApplied(Result<()>),
    LocalCandidatePublished(Result<()>),
}

pub struct Session;

impl Session {
    /// Starts the session task. Fails if the settings are unusable, e.g. a blank display name.
    pub fn spawn(
        settings: SessionSettings,
        store: Arc<dyn SignalingStore>,
        transport: Arc<dyn TransportFactory>,
    ) -> Result<SessionHandle> {
        let settings = settings.validate()?;
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);

        let chat = ChatEngine::new(settings.display_name.clone(), settings.typing_timeout);
        let initial_view = SessionView {
            state: SessionState::Idle,
            role: None,
            session_id: None,
            peer_nickname: chat.peer_nickname().to_string(),
            peer_typing: false,
            messages: Vec::new(),
        };
        let (view_tx, view_rx) = watch::channel(initial_view);

        let actor = SessionActor {
            settings,
            transport,
            resources: SessionResources::new(store),
            handshake: None,
            chat,
            state: SessionState::Idle,
            session_id: None,
            pending_begin: None,
            pending_join: None,
            pending_offer: None,
            grace_deadline: None,
            negotiation_deadline: None,
            completion_sent: false,
            internal_tx,
            events_tx,
            updates: updates.clone(),
            view: view_tx,
        };
        tokio::spawn(actor.run(commands_rx, internal_rx, events_rx));

        Ok(SessionHandle {
            commands: commands_tx,
            updates,
            view: view_rx,
        })
    }
}

/// Cheap to clone. The session shuts down (best effort, in the background) once every handle
/// is dropped.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    updates: broadcast::Sender<SessionUpdate>,
    view: watch::Receiver<SessionView>,
}

impl SessionHandle {
    /// Creates a record, publishes the offer and returns the id to share with the peer.
    pub async fn begin_as_initiator(&self) -> Result<RecordId> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::BeginAsInitiator { reply })
            .map_err(|_| ChatError::Closed)?;
        rx.await.map_err(|_| ChatError::Closed)?
    }

    /// Answers the offer stored under `id`. Resolves once the answer is published.
    pub async fn join_as_responder(&self, id: impl Into<RecordId>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::JoinAsResponder {
                id: id.into(),
                reply,
            })
            .map_err(|_| ChatError::Closed)?;
        rx.await.map_err(|_| ChatError::Closed)?
    }

    /// Sends trimmed `text` if the channel is open. Blank text and closed channels are ignored.
    pub fn send_chat_message(&self, text: impl Into<String>) {
        let _ = self.commands.send(Command::SendChat(text.into()));
    }

    pub fn notify_typing(&self) {
        let _ = self.commands.send(Command::NotifyTyping);
    }

    /// Tears the session down. Safe to call repeatedly and after the session already ended.
    pub async fn disconnect(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Disconnect { reply }).is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionUpdate> {
        self.updates.subscribe()
    }

    pub fn watch(&self) -> watch::Receiver<SessionView> {
        self.view.clone()
    }

    pub fn view(&self) -> SessionView {
        self.view.borrow().clone()
    }

    pub fn state(&self) -> SessionState {
        self.view.borrow().state
    }

    /// Waits until the session reaches `target`. Fails with [`ChatError::Closed`] if it closes
    /// first.
    pub async fn wait_for_state(&self, target: SessionState) -> Result<()> {
        let mut view = self.view.clone();
        let reached = view
            .wait_for(|v| v.state == target || v.state.is_closed())
            .await
            .map_err(|_| ChatError::Closed)?
            .state;
        if reached == target {
            Ok(())
        } else {
            Err(ChatError::Closed)
        }
    }
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending::<()>().await,
    }
}

async fn subscribe(
    store: Arc<dyn SignalingStore>,
    id: RecordId,
    role: Role,
) -> Result<Subscriptions> {
    let records = store.subscribe_record(&id).await?;
    let candidates = store.subscribe_list(&id, role.remote_list()).await?;
    Ok((records, candidates))
}

struct SessionActor {
    settings: SessionSettings,
    transport: Arc<dyn TransportFactory>,
    resources: SessionResources,
    handshake: Option<HandshakeController>,
    chat: ChatEngine,
    state: SessionState,
    session_id: Option<RecordId>,
    pending_begin: Option<oneshot::Sender<Result<RecordId>>>,
    pending_join: Option<oneshot::Sender<Result<()>>>,
    pending_offer: Option<SessionDescription>,
    grace_deadline: Option<Instant>,
    negotiation_deadline: Option<Instant>,
    completion_sent: bool,
    internal_tx: mpsc::UnboundedSender<Internal>,
    events_tx: mpsc::UnboundedSender<TransportEvent>,
    updates: broadcast::Sender<SessionUpdate>,
    view: watch::Sender<SessionView>,
}

impl SessionActor {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut internal: mpsc::UnboundedReceiver<Internal>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
    ) {
        while !self.state.is_closed() {
            let typing_deadline = self.chat.typing_deadline();
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        tracing::debug!(target = "beach_chat::session", state = ?self.state, "all handles dropped");
                        self.resources.abandon();
                        break;
                    }
                },
                Some(event) = internal.recv() => self.handle_internal(event).await,
                Some(event) = events.recv() => self.handle_transport(event).await,
                _ = sleep_until_opt(typing_deadline) => {
                    if let Some(effect) = self.chat.expire_typing(Instant::now()) {
                        self.apply_effects(vec![effect]);
                    }
                }
                _ = sleep_until_opt(self.grace_deadline) => self.finish_disconnect().await,
                _ = sleep_until_opt(self.negotiation_deadline) => {
                    self.negotiation_deadline = None;
                    if self.state == SessionState::Negotiating {
                        self.fail(ChatError::HandshakeFailed("negotiation timed out".into())).await;
                    }
                }
            }
            self.publish_view();
        }
        while let Ok(event) = internal.try_recv() {
            self.release_late(event).await;
        }
        tracing::debug!(target = "beach_chat::session", session_id = ?self.session_id, "session loop ended");
    }

    /// Work that finished after the session closed may still hold a record, connection or
    /// channel. Nothing else owns them any more, so they are released here.
    async fn release_late(&self, event: Internal) {
        match event {
            Internal::RecordCreated(Ok(id)) => {
                if let Err(err) = self.resources.store().delete_record(&id).await {
                    tracing::debug!(target = "beach_chat::session", session_id = %id, error = %err, "late record not deleted");
                }
            }
            Internal::ConnectionCreated(Ok(connection)) => {
                tracing::debug!(target = "beach_chat::session", "closing connection created after close");
                if let Err(err) = connection.close().await {
                    tracing::debug!(target = "beach_chat::session", error = %err, "late connection close failed");
                }
            }
            Internal::OfferReady(Ok((channel, _))) => {
                let _ = channel.close().await;
            }
            _ => {}
        }
    }

    fn role(&self) -> Option<Role> {
        self.handshake.as_ref().map(HandshakeController::role)
    }

    fn emit(&self, update: SessionUpdate) {
        let _ = self.updates.send(update);
    }

    fn publish_view(&self) {
        let view = SessionView {
            state: self.state,
            role: self.role(),
            session_id: self.session_id.clone(),
            peer_nickname: self.chat.peer_nickname().to_string(),
            peer_typing: self.chat.peer_typing(),
            messages: self.chat.messages().to_vec(),
        };
        self.view.send_if_modified(|current| {
            if *current == view {
                false
            } else {
                *current = view;
                true
            }
        });
    }

    fn set_state(&mut self, next: SessionState) {
        if !self.state.can_transition_to(next) {
            tracing::debug!(target = "beach_chat::session", from = ?self.state, to = ?next, "ignoring transition");
            return;
        }
        tracing::info!(
            target = "beach_chat::session",
            session_id = ?self.session_id,
            role = ?self.role(),
            from = ?self.state,
            state = ?next,
            "state changed"
        );
        self.state = next;
        self.emit(SessionUpdate::StateChanged(next));
        self.publish_view();
    }

    fn spawn_step<F>(&mut self, step: F)
    where
        F: Future<Output = Internal> + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            let _ = tx.send(step.await);
        });
        self.resources.track(handle);
    }

    fn spawn_forwarder<T, F>(&mut self, mut subscription: Subscription<T>, wrap: F)
    where
        T: Send + 'static,
        F: Fn(SubscriptionItem<T>) -> Internal + Send + 'static,
    {
        let tx = self.internal_tx.clone();
        let handle = tokio::spawn(async move {
            while let Some(item) = subscription.next().await {
                if tx.send(wrap(item)).is_err() {
                    break;
                }
            }
        });
        self.resources.track(handle);
    }

    fn apply_effects(&mut self, effects: Vec<ChatEffect>) {
        for effect in effects {
            let update = match effect {
                ChatEffect::Appended(message) => SessionUpdate::Message(message),
                ChatEffect::Typing(on) => SessionUpdate::Typing(on),
                ChatEffect::PeerNamed(name) => SessionUpdate::PeerNamed(name),
                ChatEffect::Notify => SessionUpdate::Notification,
            };
            self.emit(update);
        }
    }

    fn open_channel(&self) -> Option<Arc<dyn DataChannel>> {
        if !self.state.is_connected() || self.grace_deadline.is_some() {
            return None;
        }
        self.resources
            .channel()
            .filter(|channel| channel.is_open())
            .cloned()
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::BeginAsInitiator { reply } => {
                if self.state != SessionState::Idle || self.handshake.is_some() {
                    let _ = reply.send(Err(ChatError::InvalidState(self.state)));
                    return;
                }
                self.handshake = Some(HandshakeController::new(Role::Initiator));
                self.pending_begin = Some(reply);
                let store = self.resources.store().clone();
                self.spawn_step(async move {
                    Internal::RecordCreated(open_record(store.as_ref()).await)
                });
            }
            Command::JoinAsResponder { id, reply } => {
                if self.state != SessionState::Idle || self.handshake.is_some() {
                    let _ = reply.send(Err(ChatError::InvalidState(self.state)));
                    return;
                }
                self.handshake = Some(HandshakeController::new(Role::Responder));
                self.pending_join = Some(reply);
                let store = self.resources.store().clone();
                self.spawn_step(async move {
                    Internal::RecordFetched(lookup_record(store.as_ref(), &id).await)
                });
            }
            Command::SendChat(text) => {
                let Some(channel) = self.open_channel() else {
                    tracing::debug!(target = "beach_chat::session", state = ?self.state, "dropping message, channel not open");
                    return;
                };
                let Some((payload, message)) = self.chat.compose(&text, Utc::now()) else {
                    return;
                };
                if let Err(err) = channel.send(payload) {
                    tracing::warn!(target = "beach_chat::session", error = %err, "failed to send chat message");
                }
                self.emit(SessionUpdate::Message(message));
            }
            Command::NotifyTyping => {
                if let Some(channel) = self.open_channel() {
                    if let Err(err) = channel.send(self.chat.typing_envelope()) {
                        tracing::debug!(target = "beach_chat::session", error = %err, "failed to send typing");
                    }
                }
            }
            Command::Disconnect { reply } => {
                tracing::info!(target = "beach_chat::session", session_id = ?self.session_id, "disconnect requested");
                self.grace_deadline = None;
                self.resources.teardown().await;
                self.reply_pending(ChatError::Closed);
                self.complete_disconnect();
                self.set_state(SessionState::Closed);
                let _ = reply.send(());
            }
        }
    }

    async fn handle_internal(&mut self, event: Internal) {
        if self.state.is_closed() {
            self.release_late(event).await;
            return;
        }
        match event {
            Internal::RecordCreated(Ok(id)) => {
                self.accept(id);
                self.create_connection();
            }
            Internal::RecordFetched(Ok(record)) => {
                self.pending_offer = self
                    .handshake
                    .as_mut()
                    .and_then(|h| h.on_record_snapshot(&record));
                self.accept(record.id.clone());
                self.emit(SessionUpdate::SessionId(record.id));
                self.create_connection();
            }
            Internal::RecordCreated(Err(err)) | Internal::RecordFetched(Err(err)) => {
                // Nothing was created; the session stays usable for another attempt.
                tracing::warn!(target = "beach_chat::session", error = %err, "session not started");
                self.handshake = None;
                self.reply_pending(err);
            }
            Internal::ConnectionCreated(Ok(connection)) => {
                self.resources.set_connection(connection.clone());
                match self.role() {
                    Some(Role::Initiator) => {
                        let label = self.settings.channel_label.clone();
                        self.spawn_step(async move {
                            let prepared = async {
                                let channel = connection.create_data_channel(&label).await?;
                                let offer = connection.create_offer().await?;
                                connection.set_local_description(offer.clone()).await?;
                                Ok::<_, ChatError>((channel, offer))
                            };
                            Internal::OfferReady(prepared.await)
                        });
                    }
                    Some(Role::Responder) => {
                        self.subscribe_remote();
                        if let Some(offer) = self.pending_offer.take() {
                            self.apply_remote_description(offer);
                        }
                    }
                    None => {}
                }
            }
            Internal::OfferReady(Ok((channel, offer))) => {
                self.resources.set_channel(channel);
                let Some(id) = self.session_id.clone() else {
                    return;
                };
                let store = self.resources.store().clone();
                self.spawn_step(async move {
                    let published = async {
                        store
                            .set_field(&id, Role::Initiator.local_field(), offer)
                            .await?;
                        subscribe(store, id, Role::Initiator).await
                    };
                    Internal::Subscribed(published.await)
                });
            }
            Internal::Subscribed(Ok((records, candidates))) => {
                self.spawn_forwarder(records, Internal::RecordSnapshot);
                self.spawn_forwarder(candidates, Internal::RemoteCandidate);
                if let (Some(reply), Some(id)) = (self.pending_begin.take(), &self.session_id) {
                    self.emit(SessionUpdate::SessionId(id.clone()));
                    let _ = reply.send(Ok(id.clone()));
                }
            }
            Internal::RemoteDescriptionApplied(Ok(())) => {
                let flushed = self
                    .handshake
                    .as_mut()
                    .map(HandshakeController::on_remote_description_applied)
                    .unwrap_or_default();
                self.apply_flushed(flushed);
                if self.role() == Some(Role::Responder) {
                    if let Some(connection) = self.resources.connection().cloned() {
                        self.spawn_step(async move {
                            let answered = async {
                                let answer = connection.create_answer().await?;
                                connection.set_local_description(answer.clone()).await?;
                                Ok::<_, ChatError>(answer)
                            };
                            Internal::AnswerReady(answered.await)
                        });
                    }
                }
            }
            Internal::AnswerReady(Ok(answer)) => {
                let Some(id) = self.session_id.clone() else {
                    return;
                };
                let store = self.resources.store().clone();
                self.spawn_step(async move {
                    let written = store
                        .set_field(&id, Role::Responder.local_field(), answer)
                        .await
                        .map_err(ChatError::from);
                    Internal::AnswerPublished(written)
                });
            }
            Internal::AnswerPublished(Ok(())) => {
                if let Some(reply) = self.pending_join.take() {
                    let _ = reply.send(Ok(()));
                }
            }
            Internal::RecordSnapshot(Ok(Some(record))) => {
                if let Some(description) = self
                    .handshake
                    .as_mut()
                    .and_then(|h| h.on_record_snapshot(&record))
                {
                    self.apply_remote_description(description);
                }
            }
            Internal::RecordSnapshot(Ok(None)) => {
                if self.state == SessionState::Negotiating {
                    self.fail(ChatError::HandshakeFailed("session record deleted".into()))
                        .await;
                }
            }
            Internal::RecordSnapshot(Err(err)) | Internal::RemoteCandidate(Err(err)) => {
                if self.state == SessionState::Negotiating {
                    self.fail(ChatError::HandshakeFailed(err.to_string())).await;
                } else {
                    tracing::debug!(target = "beach_chat::session", error = %err, "subscription error after open");
                }
            }
            Internal::RemoteCandidate(Ok(candidate)) => self.apply_candidate(candidate),
            Internal::CandidateApplied(Err(err)) => {
                tracing::warn!(target = "beach_chat::session", error = %err, "failed to apply remote candidate");
            }
            Internal::LocalCandidatePublished(Err(err)) => {
                tracing::warn!(target = "beach_chat::session", error = %err, "failed to publish local candidate");
            }
            Internal::CandidateApplied(Ok(())) | Internal::LocalCandidatePublished(Ok(())) => {}
            Internal::ConnectionCreated(Err(err))
            | Internal::OfferReady(Err(err))
            | Internal::Subscribed(Err(err))
            | Internal::RemoteDescriptionApplied(Err(err))
            | Internal::AnswerReady(Err(err))
            | Internal::AnswerPublished(Err(err)) => self.fail(err).await,
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        if !matches!(
            self.state,
            SessionState::Negotiating | SessionState::Open | SessionState::Chatting
        ) {
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let (Some(id), Some(role)) = (self.session_id.clone(), self.role()) else {
                    return;
                };
                let store = self.resources.store().clone();
                self.spawn_step(async move {
                    let appended = store
                        .append_to_list(&id, role.local_list(), candidate)
                        .await
                        .map_err(ChatError::from);
                    Internal::LocalCandidatePublished(appended)
                });
            }
            TransportEvent::DataChannel(channel) => {
                if channel.label() != self.settings.channel_label {
                    tracing::warn!(target = "beach_chat::session", label = channel.label(), "ignoring unexpected data channel");
                    return;
                }
                self.resources.set_channel(channel);
            }
            TransportEvent::ChannelOpen => self.channel_opened(),
            TransportEvent::ChannelMessage(payload) => {
                if self.state.is_connected() {
                    let effects = self.chat.receive(&payload, Instant::now(), Utc::now());
                    self.apply_effects(effects);
                }
            }
            TransportEvent::ChannelClosed => self.peer_gone("data channel closed").await,
            TransportEvent::ConnectionFailed(reason) => self.peer_gone(&reason).await,
        }
    }

    fn accept(&mut self, id: RecordId) {
        self.resources.set_record(id.clone());
        self.session_id = Some(id);
        self.set_state(SessionState::Negotiating);
        self.negotiation_deadline = self
            .settings
            .negotiation_timeout
            .map(|timeout| Instant::now() + timeout);
    }

    fn create_connection(&mut self) {
        let transport = self.transport.clone();
        let events = self.events_tx.clone();
        self.spawn_step(async move {
            let created = transport
                .create_connection(events)
                .await
                .map_err(ChatError::from);
            Internal::ConnectionCreated(created)
        });
    }

    fn subscribe_remote(&mut self) {
        let (Some(id), Some(role)) = (self.session_id.clone(), self.role()) else {
            return;
        };
        let store = self.resources.store().clone();
        self.spawn_step(async move { Internal::Subscribed(subscribe(store, id, role).await) });
    }

    fn apply_remote_description(&mut self, description: SessionDescription) {
        let Some(connection) = self.resources.connection().cloned() else {
            return;
        };
        self.spawn_step(async move {
            let applied = connection
                .set_remote_description(description)
                .await
                .map_err(ChatError::from);
            Internal::RemoteDescriptionApplied(applied)
        });
    }

    fn apply_candidate(&mut self, candidate: IceCandidateBlob) {
        let Some(action) = self
            .handshake
            .as_mut()
            .map(|h| h.on_remote_candidate(candidate))
        else {
            return;
        };
        match action {
            CandidateAction::Apply(candidate) => self.add_to_connection(candidate),
            other => {
                tracing::trace!(target = "beach_chat::handshake", action = ?other, "candidate not applied now");
            }
        }
    }

    /// Candidates released from the queue were already recorded as seen, so they skip the
    /// controller and go straight to the connection.
    fn apply_flushed(&mut self, flushed: Vec<IceCandidateBlob>) {
        for candidate in flushed {
            self.add_to_connection(candidate);
        }
    }

    fn add_to_connection(&mut self, candidate: IceCandidateBlob) {
        let Some(connection) = self.resources.connection().cloned() else {
            return;
        };
        self.spawn_step(async move {
            let applied = connection
                .add_remote_candidate(candidate)
                .await
                .map_err(ChatError::from);
            Internal::CandidateApplied(applied)
        });
    }

    fn channel_opened(&mut self) {
        if self.state != SessionState::Negotiating {
            return;
        }
        if !self.handshake.as_mut().is_some_and(|h| h.on_channel_open()) {
            return;
        }
        self.negotiation_deadline = None;
        self.set_state(SessionState::Open);

        match self.resources.channel() {
            Some(channel) => {
                if let Err(err) = channel.send(self.chat.greeting()) {
                    tracing::warn!(target = "beach_chat::session", error = %err, "failed to send nickname");
                }
            }
            None => tracing::warn!(target = "beach_chat::session", "channel opened before it was announced"),
        }
        self.set_state(SessionState::Chatting);
    }

    async fn peer_gone(&mut self, reason: &str) {
        match self.state {
            SessionState::Negotiating => {
                self.fail(ChatError::HandshakeFailed(reason.to_string())).await;
            }
            SessionState::Open | SessionState::Chatting if self.grace_deadline.is_none() => {
                tracing::info!(target = "beach_chat::session", session_id = ?self.session_id, reason, "peer disconnected");
                let effects = self.chat.peer_disconnected(Utc::now());
                self.apply_effects(effects);
                self.grace_deadline = Some(Instant::now() + self.settings.disconnect_grace);
            }
            _ => {}
        }
    }

    async fn finish_disconnect(&mut self) {
        self.grace_deadline = None;
        self.resources.teardown().await;
        self.complete_disconnect();
        self.set_state(SessionState::Closed);
    }

    fn complete_disconnect(&mut self) {
        if !self.completion_sent {
            self.completion_sent = true;
            self.emit(SessionUpdate::DisconnectComplete);
        }
    }

    async fn fail(&mut self, err: ChatError) {
        if self.state.is_closed() {
            return;
        }
        if let Some(handshake) = self.handshake.as_mut() {
            handshake.fail(&err.to_string());
        }
        self.resources.teardown().await;
        self.emit(SessionUpdate::Failed(err.clone()));
        self.set_state(SessionState::Closed);
        self.reply_pending(err);
    }

    fn reply_pending(&mut self, err: ChatError) {
        if let Some(reply) = self.pending_begin.take() {
            let _ = reply.send(Err(err.clone()));
        }
        if let Some(reply) = self.pending_join.take() {
            let _ = reply.send(Err(err));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::MemorySignalingStore;
    use crate::transport::loopback::LoopbackTransport;
    use crate::transport::{TransportError, TransportEvents};
    use async_trait::async_trait;
    use tokio::sync::Notify;

    /// Holds every connection request until the test lets it through.
    struct GatedTransport {
        inner: LoopbackTransport,
        entered: Arc<Notify>,
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl TransportFactory for GatedTransport {
        async fn create_connection(
            &self,
            events: TransportEvents,
        ) -> std::result::Result<Arc<dyn PeerConnection>, TransportError> {
            self.entered.notify_one();
            self.gate.notified().await;
            self.inner.create_connection(events).await
        }
    }

    fn spawn_session(
        name: &str,
        store: &MemorySignalingStore,
        transport: &LoopbackTransport,
    ) -> SessionHandle {
        Session::spawn(
            SessionSettings::new(name),
            Arc::new(store.clone()),
            Arc::new(transport.clone()),
        )
        .unwrap()
    }

    #[test_timeout::tokio_timeout_test]
    async fn blank_display_name_is_rejected() {
        let result = Session::spawn(
            SessionSettings::new("  "),
            Arc::new(MemorySignalingStore::new()),
            Arc::new(LoopbackTransport::new()),
        );
        assert!(matches!(result, Err(ChatError::InvalidConfig(_))));
    }

    #[test_timeout::tokio_timeout_test]
    async fn join_unknown_session_stays_idle() {
        let store = MemorySignalingStore::new();
        let transport = LoopbackTransport::new();
        let session = spawn_session("bo", &store, &transport);

        let err = session.join_as_responder("does-not-exist").await.unwrap_err();
        assert_eq!(err, ChatError::SessionNotFound("does-not-exist".into()));
        assert_eq!(session.state(), SessionState::Idle);
        assert_eq!(store.record_count(), 0);
        assert_eq!(transport.endpoint_count(), 0);
    }

    #[test_timeout::tokio_timeout_test]
    async fn second_begin_is_rejected() {
        let store = MemorySignalingStore::new();
        let transport = LoopbackTransport::new();
        let session = spawn_session("ana", &store, &transport);

        session.begin_as_initiator().await.unwrap();
        assert_eq!(session.state(), SessionState::Negotiating);
        assert_eq!(
            session.begin_as_initiator().await,
            Err(ChatError::InvalidState(SessionState::Negotiating))
        );
        session.disconnect().await.unwrap();
    }

    #[test_timeout::tokio_timeout_test]
    async fn chat_before_open_is_dropped() {
        let store = MemorySignalingStore::new();
        let transport = LoopbackTransport::new();
        let session = spawn_session("ana", &store, &transport);
        let mut updates = session.subscribe();

        session.send_chat_message("too early");
        session.notify_typing();
        session.disconnect().await.unwrap();

        let mut seen = Vec::new();
        while let Ok(update) = updates.try_recv() {
            seen.push(update);
        }
        assert!(!seen.iter().any(|u| matches!(u, SessionUpdate::Message(_))));
        assert!(seen.contains(&SessionUpdate::DisconnectComplete));
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[test_timeout::tokio_timeout_test]
    async fn connection_finished_during_disconnect_is_closed() {
        for _ in 0..16 {
            let store = MemorySignalingStore::new();
            let loopback = LoopbackTransport::new();
            let entered = Arc::new(Notify::new());
            let gate = Arc::new(Notify::new());
            let transport = GatedTransport {
                inner: loopback.clone(),
                entered: entered.clone(),
                gate: gate.clone(),
            };
            let session = Session::spawn(
                SessionSettings::new("ana"),
                Arc::new(store.clone()),
                Arc::new(transport),
            )
            .unwrap();

            let begin = {
                let session = session.clone();
                tokio::spawn(async move { session.begin_as_initiator().await })
            };
            entered.notified().await;
            gate.notify_one();
            session.disconnect().await.unwrap();
            assert_eq!(begin.await.unwrap(), Err(ChatError::Closed));
            drop(session);
            for _ in 0..8 {
                tokio::task::yield_now().await;
            }

            for endpoint in 0..loopback.endpoint_count() {
                assert!(loopback.stats(endpoint).unwrap().closed);
            }
            assert_eq!(store.record_count(), 0);
        }
    }
}
