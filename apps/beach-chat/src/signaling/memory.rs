use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::{
    CandidateList, RecordField, RecordId, SessionRecord, SignalingError, SignalingStore,
    Subscription, SubscriptionItem,
};
use crate::transport::{IceCandidateBlob, SessionDescription};

type RecordSender = mpsc::UnboundedSender<SubscriptionItem<Option<SessionRecord>>>;
type ListSender = mpsc::UnboundedSender<SubscriptionItem<IceCandidateBlob>>;

#[derive(Default)]
struct Entry {
    record: Option<SessionRecord>,
    initiator: Vec<IceCandidateBlob>,
    responder: Vec<IceCandidateBlob>,
    record_listeners: Vec<RecordSender>,
    initiator_listeners: Vec<ListSender>,
    responder_listeners: Vec<ListSender>,
}

impl Entry {
    fn list(&self, list: CandidateList) -> &Vec<IceCandidateBlob> {
        match list {
            CandidateList::Initiator => &self.initiator,
            CandidateList::Responder => &self.responder,
        }
    }

    fn list_mut(&mut self, list: CandidateList) -> &mut Vec<IceCandidateBlob> {
        match list {
            CandidateList::Initiator => &mut self.initiator,
            CandidateList::Responder => &mut self.responder,
        }
    }

    fn listeners_mut(&mut self, list: CandidateList) -> &mut Vec<ListSender> {
        match list {
            CandidateList::Initiator => &mut self.initiator_listeners,
            CandidateList::Responder => &mut self.responder_listeners,
        }
    }

    fn publish_record(&mut self) {
        let snapshot = self.record.clone();
        self.record_listeners
            .retain(|tx| tx.send(Ok(snapshot.clone())).is_ok());
    }
}

/// In-process store shared by both peers of a test. Cloning shares the same state.
#[derive(Clone, Default)]
pub struct MemorySignalingStore {
    entries: Arc<Mutex<HashMap<RecordId, Entry>>>,
    unavailable: Arc<AtomicBool>,
}

impl MemorySignalingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// While unavailable every operation fails with a backend error.
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    pub fn contains(&self, id: &RecordId) -> bool {
        self.entries
            .lock()
            .get(id)
            .is_some_and(|entry| entry.record.is_some())
    }

    pub fn record_count(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|entry| entry.record.is_some())
            .count()
    }

    pub fn snapshot(&self, id: &RecordId) -> Option<SessionRecord> {
        self.entries
            .lock()
            .get(id)
            .and_then(|entry| entry.record.clone())
    }

    pub fn list_len(&self, id: &RecordId, list: CandidateList) -> usize {
        self.entries
            .lock()
            .get(id)
            .map_or(0, |entry| entry.list(list).len())
    }

    pub fn candidates(&self, id: &RecordId, list: CandidateList) -> Vec<IceCandidateBlob> {
        self.entries
            .lock()
            .get(id)
            .map(|entry| entry.list(list).clone())
            .unwrap_or_default()
    }

    /// Pushes the current snapshot to every record subscriber again, unchanged.
    pub fn redeliver(&self, id: &RecordId) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            entry.publish_record();
        }
    }

    /// Pushes every known candidate of `list` to its subscribers again.
    pub fn redeliver_list(&self, id: &RecordId, list: CandidateList) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            let items = entry.list(list).clone();
            entry
                .listeners_mut(list)
                .retain(|tx| items.iter().all(|item| tx.send(Ok(item.clone())).is_ok()));
        }
    }

    /// Delivers an error to every subscriber of `id`.
    pub fn fail_subscriptions(&self, id: &RecordId, reason: &str) {
        if let Some(entry) = self.entries.lock().get_mut(id) {
            let err = SignalingError::Backend(reason.to_string());
            entry
                .record_listeners
                .retain(|tx| tx.send(Err(err.clone())).is_ok());
            for list in [CandidateList::Initiator, CandidateList::Responder] {
                entry
                    .listeners_mut(list)
                    .retain(|tx| tx.send(Err(err.clone())).is_ok());
            }
        }
    }

    fn ensure_available(&self) -> Result<(), SignalingError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(SignalingError::Backend("memory store offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SignalingStore for MemorySignalingStore {
    async fn create_record(&self) -> Result<RecordId, SignalingError> {
        self.ensure_available()?;
        let id = RecordId::generate();
        let mut entries = self.entries.lock();
        entries.insert(
            id.clone(),
            Entry {
                record: Some(SessionRecord::new(id.clone())),
                ..Default::default()
            },
        );
        tracing::debug!(target = "signaling", session_id = %id, "created record");
        Ok(id)
    }

    async fn get_record(&self, id: &RecordId) -> Result<Option<SessionRecord>, SignalingError> {
        self.ensure_available()?;
        Ok(self.snapshot(id))
    }

    async fn set_field(
        &self,
        id: &RecordId,
        field: RecordField,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .filter(|entry| entry.record.is_some())
            .ok_or_else(|| SignalingError::NotFound(id.clone()))?;
        if let Some(record) = entry.record.as_mut() {
            record.set_once(field, description)?;
        }
        entry.publish_record();
        Ok(())
    }

    async fn append_to_list(
        &self,
        id: &RecordId,
        list: CandidateList,
        candidate: IceCandidateBlob,
    ) -> Result<(), SignalingError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .filter(|entry| entry.record.is_some())
            .ok_or_else(|| SignalingError::NotFound(id.clone()))?;
        entry.list_mut(list).push(candidate.clone());
        entry
            .listeners_mut(list)
            .retain(|tx| tx.send(Ok(candidate.clone())).is_ok());
        Ok(())
    }

    async fn subscribe_record(
        &self,
        id: &RecordId,
    ) -> Result<Subscription<Option<SessionRecord>>, SignalingError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .filter(|entry| entry.record.is_some())
            .ok_or_else(|| SignalingError::NotFound(id.clone()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(entry.record.clone()));
        entry.record_listeners.push(tx);
        Ok(Subscription::new(rx))
    }

    async fn subscribe_list(
        &self,
        id: &RecordId,
        list: CandidateList,
    ) -> Result<Subscription<IceCandidateBlob>, SignalingError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        let entry = entries
            .get_mut(id)
            .filter(|entry| entry.record.is_some())
            .ok_or_else(|| SignalingError::NotFound(id.clone()))?;
        let (tx, rx) = mpsc::unbounded_channel();
        for item in entry.list(list) {
            let _ = tx.send(Ok(item.clone()));
        }
        entry.listeners_mut(list).push(tx);
        Ok(Subscription::new(rx))
    }

    async fn delete_record(&self, id: &RecordId) -> Result<(), SignalingError> {
        self.ensure_available()?;
        let mut entries = self.entries.lock();
        match entries.remove(id) {
            Some(mut entry) if entry.record.is_some() => {
                entry.record = None;
                entry.publish_record();
                tracing::debug!(target = "signaling", session_id = %id, "deleted record");
                Ok(())
            }
            _ => Err(SignalingError::NotFound(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::tokio_timeout_test]
    async fn record_subscription_starts_with_snapshot_and_ends_on_delete() {
        let store = MemorySignalingStore::new();
        let id = store.create_record().await.unwrap();
        let mut sub = store.subscribe_record(&id).await.unwrap();

        let first = sub.next().await.unwrap().unwrap().unwrap();
        assert!(first.offer.is_none());

        store
            .set_field(&id, RecordField::Offer, SessionDescription::offer("o"))
            .await
            .unwrap();
        let second = sub.next().await.unwrap().unwrap().unwrap();
        assert_eq!(second.offer.unwrap().sdp, "o");

        store.delete_record(&id).await.unwrap();
        assert_eq!(sub.next().await.unwrap().unwrap(), None);
        assert!(sub.next().await.is_none());
    }

    #[test_timeout::tokio_timeout_test]
    async fn list_subscription_replays_backlog() {
        let store = MemorySignalingStore::new();
        let id = store.create_record().await.unwrap();
        store
            .append_to_list(&id, CandidateList::Initiator, IceCandidateBlob::new("a"))
            .await
            .unwrap();

        let mut sub = store
            .subscribe_list(&id, CandidateList::Initiator)
            .await
            .unwrap();
        store
            .append_to_list(&id, CandidateList::Initiator, IceCandidateBlob::new("b"))
            .await
            .unwrap();
        store
            .append_to_list(&id, CandidateList::Responder, IceCandidateBlob::new("r"))
            .await
            .unwrap();

        assert_eq!(sub.next().await.unwrap().unwrap().candidate, "a");
        assert_eq!(sub.next().await.unwrap().unwrap().candidate, "b");
        assert_eq!(store.list_len(&id, CandidateList::Responder), 1);
    }

    #[test_timeout::tokio_timeout_test]
    async fn fields_are_never_overwritten() {
        let store = MemorySignalingStore::new();
        let id = store.create_record().await.unwrap();
        store
            .set_field(&id, RecordField::Answer, SessionDescription::answer("a1"))
            .await
            .unwrap();
        let err = store
            .set_field(&id, RecordField::Answer, SessionDescription::answer("a2"))
            .await
            .unwrap_err();
        assert_eq!(err, SignalingError::FieldAlreadySet(RecordField::Answer));
        assert_eq!(store.snapshot(&id).unwrap().answer.unwrap().sdp, "a1");
    }

    #[test_timeout::tokio_timeout_test]
    async fn missing_records_and_outages() {
        let store = MemorySignalingStore::new();
        let missing = RecordId::from("does-not-exist");
        assert!(store.get_record(&missing).await.unwrap().is_none());
        assert_eq!(
            store.delete_record(&missing).await.unwrap_err(),
            SignalingError::NotFound(missing.clone())
        );
        assert!(store.subscribe_record(&missing).await.is_err());

        store.set_available(false);
        assert!(matches!(
            store.create_record().await,
            Err(SignalingError::Backend(_))
        ));
        store.set_available(true);
        assert!(store.create_record().await.is_ok());
        assert_eq!(store.record_count(), 1);
    }
}
