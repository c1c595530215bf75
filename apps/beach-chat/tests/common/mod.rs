#![allow(dead_code)]

use std::sync::Arc;

use beach_chat::signaling::{MemorySignalingStore, RecordId};
use beach_chat::transport::loopback::LoopbackTransport;
use beach_chat::{Session, SessionHandle, SessionSettings, SessionState, SessionUpdate};
use tokio::sync::broadcast;

/// Endpoint index of the initiator's connection on the shared loopback network.
pub const INITIATOR_ENDPOINT: usize = 0;
pub const RESPONDER_ENDPOINT: usize = 1;

pub struct Harness {
    pub store: MemorySignalingStore,
    pub transport: LoopbackTransport,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            store: MemorySignalingStore::new(),
            transport: LoopbackTransport::new(),
        }
    }

    pub fn spawn(&self, settings: SessionSettings) -> SessionHandle {
        Session::spawn(
            settings,
            Arc::new(self.store.clone()),
            Arc::new(self.transport.clone()),
        )
        .expect("valid settings")
    }

    /// Runs both handshakes to completion and waits until each side is chatting.
    pub async fn connect(
        &self,
        initiator: SessionSettings,
        responder: SessionSettings,
    ) -> ConnectedPair {
        let initiator = self.spawn(initiator);
        let responder = self.spawn(responder);
        let initiator_updates = initiator.subscribe();
        let responder_updates = responder.subscribe();

        let id = initiator.begin_as_initiator().await.expect("begin");
        responder
            .join_as_responder(id.clone())
            .await
            .expect("join");
        initiator
            .wait_for_state(SessionState::Chatting)
            .await
            .expect("initiator chatting");
        responder
            .wait_for_state(SessionState::Chatting)
            .await
            .expect("responder chatting");

        ConnectedPair {
            id,
            initiator,
            responder,
            initiator_updates,
            responder_updates,
        }
    }
}

pub struct ConnectedPair {
    pub id: RecordId,
    pub initiator: SessionHandle,
    pub responder: SessionHandle,
    pub initiator_updates: broadcast::Receiver<SessionUpdate>,
    pub responder_updates: broadcast::Receiver<SessionUpdate>,
}

/// Receives until `matches` accepts an update, returning everything seen on the way.
pub async fn collect_until(
    updates: &mut broadcast::Receiver<SessionUpdate>,
    matches: impl Fn(&SessionUpdate) -> bool,
) -> Vec<SessionUpdate> {
    let mut seen = Vec::new();
    loop {
        let update = updates.recv().await.expect("update stream open");
        let done = matches(&update);
        seen.push(update);
        if done {
            return seen;
        }
    }
}

pub fn drain(updates: &mut broadcast::Receiver<SessionUpdate>) -> Vec<SessionUpdate> {
    let mut seen = Vec::new();
    while let Ok(update) = updates.try_recv() {
        seen.push(update);
    }
    seen
}

/// Lets every spawned task run until the runtime is idle. Only meaningful on a paused clock.
pub async fn settle() {
    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
}
