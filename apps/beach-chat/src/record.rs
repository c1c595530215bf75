use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::ChatError;
use crate::signaling::{RecordId, SessionRecord, SignalingError, SignalingStore};
use crate::transport::{DataChannel, PeerConnection};

pub async fn open_record(store: &dyn SignalingStore) -> Result<RecordId, ChatError> {
    store.create_record().await.map_err(ChatError::from)
}

/// Fetches a record a responder can join: it must exist and carry an offer.
pub async fn lookup_record(
    store: &dyn SignalingStore,
    id: &RecordId,
) -> Result<SessionRecord, ChatError> {
    match store.get_record(id).await {
        Ok(Some(record)) if record.offer.is_some() => Ok(record),
        Ok(_) | Err(SignalingError::NotFound(_)) => {
            Err(ChatError::SessionNotFound(id.to_string()))
        }
        Err(err) => Err(err.into()),
    }
}

/// Everything a session must release when it ends. Teardown runs at most once; whatever is
/// still held on drop is released in the background.
pub struct SessionResources {
    store: Arc<dyn SignalingStore>,
    record: Option<RecordId>,
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    listeners: Vec<JoinHandle<()>>,
}

impl SessionResources {
    pub fn new(store: Arc<dyn SignalingStore>) -> Self {
        Self {
            store,
            record: None,
            connection: None,
            channel: None,
            listeners: Vec::new(),
        }
    }

    pub fn store(&self) -> &Arc<dyn SignalingStore> {
        &self.store
    }

    pub fn record(&self) -> Option<&RecordId> {
        self.record.as_ref()
    }

    pub fn set_record(&mut self, id: RecordId) {
        self.record = Some(id);
    }

    pub fn connection(&self) -> Option<&Arc<dyn PeerConnection>> {
        self.connection.as_ref()
    }

    pub fn set_connection(&mut self, connection: Arc<dyn PeerConnection>) {
        self.connection = Some(connection);
    }

    pub fn channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.channel.as_ref()
    }

    pub fn set_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.channel = Some(channel);
    }

    pub fn track(&mut self, listener: JoinHandle<()>) {
        self.listeners.retain(|handle| !handle.is_finished());
        self.listeners.push(listener);
    }

    fn is_empty(&self) -> bool {
        self.record.is_none()
            && self.connection.is_none()
            && self.channel.is_none()
            && self.listeners.is_empty()
    }

    fn take(&mut self) -> Released {
        Released {
            record: self.record.take(),
            connection: self.connection.take(),
            channel: self.channel.take(),
            listeners: std::mem::take(&mut self.listeners),
        }
    }

    /// Stops listeners, deletes the record, then closes the channel and the connection.
    /// A record that is already gone counts as deleted; nothing here returns an error.
    pub async fn teardown(&mut self) {
        let released = self.take();
        released.run(self.store.as_ref()).await;
    }

    /// Fire-and-forget teardown for paths that must not wait.
    pub fn abandon(&mut self) {
        if self.is_empty() {
            return;
        }
        let released = self.take();
        let store = self.store.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move { released.run(store.as_ref()).await });
            }
            Err(_) => {
                for listener in &released.listeners {
                    listener.abort();
                }
                tracing::warn!(target = "beach_chat::record", "no runtime available for teardown");
            }
        }
    }
}

impl Drop for SessionResources {
    fn drop(&mut self) {
        self.abandon();
    }
}

struct Released {
    record: Option<RecordId>,
    connection: Option<Arc<dyn PeerConnection>>,
    channel: Option<Arc<dyn DataChannel>>,
    listeners: Vec<JoinHandle<()>>,
}

impl Released {
    async fn run(self, store: &dyn SignalingStore) {
        for listener in &self.listeners {
            listener.abort();
        }
        if let Some(id) = &self.record {
            match store.delete_record(id).await {
                Ok(()) => {
                    tracing::debug!(target = "beach_chat::record", session_id = %id, "record deleted")
                }
                Err(SignalingError::NotFound(_)) => {
                    tracing::debug!(target = "beach_chat::record", session_id = %id, "record already gone")
                }
                Err(err) => {
                    tracing::warn!(target = "beach_chat::record", session_id = %id, error = %err, "failed to delete record")
                }
            }
        }
        if let Some(channel) = &self.channel {
            if let Err(err) = channel.close().await {
                tracing::debug!(target = "beach_chat::record", error = %err, "data channel close failed");
            }
        }
        if let Some(connection) = &self.connection {
            if let Err(err) = connection.close().await {
                tracing::debug!(target = "beach_chat::record", error = %err, "connection close failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signaling::{MemorySignalingStore, RecordField};
    use crate::transport::SessionDescription;
    use crate::transport::loopback::LoopbackTransport;
    use crate::transport::TransportFactory;
    use tokio::sync::mpsc;

    #[test_timeout::tokio_timeout_test]
    async fn lookup_requires_an_offer() {
        let store = MemorySignalingStore::new();
        let missing = RecordId::from("does-not-exist");
        assert_eq!(
            lookup_record(&store, &missing).await.unwrap_err(),
            ChatError::SessionNotFound("does-not-exist".into())
        );
        assert_eq!(store.record_count(), 0);

        let id = open_record(&store).await.unwrap();
        assert!(matches!(
            lookup_record(&store, &id).await,
            Err(ChatError::SessionNotFound(_))
        ));
        store
            .set_field(&id, RecordField::Offer, SessionDescription::offer("o"))
            .await
            .unwrap();
        assert_eq!(lookup_record(&store, &id).await.unwrap().id, id);

        store.set_available(false);
        assert!(matches!(
            lookup_record(&store, &id).await,
            Err(ChatError::SignalingUnavailable(_))
        ));
    }

    #[test_timeout::tokio_timeout_test]
    async fn teardown_is_idempotent_and_tolerates_missing_record() {
        let store = Arc::new(MemorySignalingStore::new());
        let transport = LoopbackTransport::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let id = store.create_record().await.unwrap();
        let mut resources = SessionResources::new(store.clone());
        resources.set_record(id.clone());
        resources.set_connection(transport.create_connection(tx).await.unwrap());
        let listener = tokio::spawn(std::future::pending::<()>());
        resources.track(listener);

        store.delete_record(&id).await.unwrap();
        resources.teardown().await;
        resources.teardown().await;
        assert!(!store.contains(&id));
        assert!(transport.stats(0).unwrap().closed);
        assert!(resources.record().is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn dropping_resources_releases_in_background() {
        let store = Arc::new(MemorySignalingStore::new());
        let id = store.create_record().await.unwrap();
        {
            let mut resources = SessionResources::new(store.clone());
            resources.set_record(id.clone());
        }
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert!(!store.contains(&id));
    }
}
