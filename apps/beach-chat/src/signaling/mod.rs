use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::transport::{IceCandidateBlob, SessionDescription};

pub mod memory;
pub mod redis;

pub use memory::MemorySignalingStore;
pub use redis::RedisSignalingStore;

/// Identifier of a session record, shared between the two humans out of band.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for RecordId {
    type Err = SignalingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(SignalingError::InvalidId(s.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl From<&str> for RecordId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for RecordId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: RecordId,
    pub offer: Option<SessionDescription>,
    pub answer: Option<SessionDescription>,
}

impl SessionRecord {
    pub fn new(id: RecordId) -> Self {
        Self {
            id,
            offer: None,
            answer: None,
        }
    }

    pub fn field(&self, field: RecordField) -> Option<&SessionDescription> {
        match field {
            RecordField::Offer => self.offer.as_ref(),
            RecordField::Answer => self.answer.as_ref(),
        }
    }

    fn field_mut(&mut self, field: RecordField) -> &mut Option<SessionDescription> {
        match field {
            RecordField::Offer => &mut self.offer,
            RecordField::Answer => &mut self.answer,
        }
    }

    /// Writes a field that has never been written. Existing values are never replaced.
    pub fn set_once(
        &mut self,
        field: RecordField,
        description: SessionDescription,
    ) -> Result<(), SignalingError> {
        let slot = self.field_mut(field);
        if slot.is_some() {
            return Err(SignalingError::FieldAlreadySet(field));
        }
        *slot = Some(description);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    Offer,
    Answer,
}

impl RecordField {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordField::Offer => "offer",
            RecordField::Answer => "answer",
        }
    }
}

/// The two append-only candidate lists hanging off a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CandidateList {
    Initiator,
    Responder,
}

impl CandidateList {
    pub fn as_str(&self) -> &'static str {
        match self {
            CandidateList::Initiator => "initiator_candidates",
            CandidateList::Responder => "responder_candidates",
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum SignalingError {
    #[error("record {0} not found")]
    NotFound(RecordId),
    #[error("record field {} already set", .0.as_str())]
    FieldAlreadySet(RecordField),
    #[error("invalid record id {0:?}")]
    InvalidId(String),
    #[error("malformed signaling payload: {0}")]
    Malformed(String),
    #[error("signaling backend error: {0}")]
    Backend(String),
}

impl From<::redis::RedisError> for SignalingError {
    fn from(err: ::redis::RedisError) -> Self {
        SignalingError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for SignalingError {
    fn from(err: serde_json::Error) -> Self {
        SignalingError::Malformed(err.to_string())
    }
}

pub type SubscriptionItem<T> = Result<T, SignalingError>;

/// Stream of changes pushed by a store. Dropping it stops the store-side forwarder.
pub struct Subscription<T> {
    receiver: mpsc::UnboundedReceiver<SubscriptionItem<T>>,
    forwarder: Option<JoinHandle<()>>,
}

impl<T> Subscription<T> {
    pub fn new(receiver: mpsc::UnboundedReceiver<SubscriptionItem<T>>) -> Self {
        Self {
            receiver,
            forwarder: None,
        }
    }

    pub fn with_forwarder(
        receiver: mpsc::UnboundedReceiver<SubscriptionItem<T>>,
        forwarder: JoinHandle<()>,
    ) -> Self {
        Self {
            receiver,
            forwarder: Some(forwarder),
        }
    }

    /// `None` once the store has nothing more to say, e.g. after the record was deleted.
    pub async fn next(&mut self) -> Option<SubscriptionItem<T>> {
        self.receiver.recv().await
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.forwarder.take() {
            handle.abort();
        }
    }
}

/// Shared store both peers read and write during a handshake.
#[async_trait]
pub trait SignalingStore: Send + Sync {
    async fn create_record(&self) -> Result<RecordId, SignalingError>;

    /// `Ok(None)` when no record with this id exists.
    async fn get_record(&self, id: &RecordId) -> Result<Option<SessionRecord>, SignalingError>;

    /// Fails with [`SignalingError::FieldAlreadySet`] instead of overwriting.
    async fn set_field(
        &self,
        id: &RecordId,
        field: RecordField,
        description: SessionDescription,
    ) -> Result<(), SignalingError>;

    async fn append_to_list(
        &self,
        id: &RecordId,
        list: CandidateList,
        candidate: IceCandidateBlob,
    ) -> Result<(), SignalingError>;

    /// Yields the current snapshot first, then one snapshot per change. `None` means the record
    /// was deleted.
    async fn subscribe_record(
        &self,
        id: &RecordId,
    ) -> Result<Subscription<Option<SessionRecord>>, SignalingError>;

    /// Yields every entry already in the list, then each new one as it is appended.
    async fn subscribe_list(
        &self,
        id: &RecordId,
        list: CandidateList,
    ) -> Result<Subscription<IceCandidateBlob>, SignalingError>;

    /// Removes the record and both candidate lists. [`SignalingError::NotFound`] if absent.
    async fn delete_record(&self, id: &RecordId) -> Result<(), SignalingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn record_fields_are_write_once() {
        let mut record = SessionRecord::new(RecordId::from("abc"));
        record
            .set_once(RecordField::Offer, SessionDescription::offer("o1"))
            .unwrap();
        let err = record
            .set_once(RecordField::Offer, SessionDescription::offer("o2"))
            .unwrap_err();
        assert_eq!(err, SignalingError::FieldAlreadySet(RecordField::Offer));
        assert_eq!(record.offer.as_ref().unwrap().sdp, "o1");
        assert!(record.field(RecordField::Answer).is_none());
    }

    #[test_timeout::timeout]
    fn record_id_parsing_trims() {
        let id: RecordId = "  7f3c  ".parse().unwrap();
        assert_eq!(id.as_str(), "7f3c");
        assert!("   ".parse::<RecordId>().is_err());
        assert_ne!(RecordId::generate(), RecordId::generate());
    }
}
