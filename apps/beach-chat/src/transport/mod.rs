use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub mod loopback;
pub mod webrtc;

/// Label of the single ordered channel both peers speak the chat protocol on.
pub const CHAT_CHANNEL_LABEL: &str = "chat";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport setup failed: {0}")]
    Setup(String),
    #[error("remote description has not been applied")]
    RemoteDescriptionMissing,
    #[error("data channel closed")]
    ChannelClosed,
    #[error("connection closed")]
    ConnectionClosed,
}

pub(crate) fn to_setup_error<E: fmt::Display>(err: E) -> TransportError {
    TransportError::Setup(err.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
}

/// Opaque offer/answer blob. Serialized as `{"type": "offer", "sdp": "..."}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpKind::Answer,
            sdp: sdp.into(),
        }
    }
}

/// One network path candidate, in the JSON shape browsers produce from `candidate.toJSON()`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IceCandidateBlob {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

impl IceCandidateBlob {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        }
    }
}

/// Everything a connection reports back to its owner. Delivered on the sender handed to
/// [`TransportFactory::create_connection`], so all callbacks funnel into one queue.
pub enum TransportEvent {
    LocalCandidate(IceCandidateBlob),
    /// The remote side opened a channel towards us.
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen,
    ChannelMessage(Bytes),
    ChannelClosed,
    ConnectionFailed(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::LocalCandidate(candidate) => {
                f.debug_tuple("LocalCandidate").field(candidate).finish()
            }
            TransportEvent::DataChannel(channel) => {
                f.debug_tuple("DataChannel").field(&channel.label()).finish()
            }
            TransportEvent::ChannelOpen => f.write_str("ChannelOpen"),
            TransportEvent::ChannelMessage(bytes) => f
                .debug_struct("ChannelMessage")
                .field("len", &bytes.len())
                .finish(),
            TransportEvent::ChannelClosed => f.write_str("ChannelClosed"),
            TransportEvent::ConnectionFailed(reason) => {
                f.debug_tuple("ConnectionFailed").field(reason).finish()
            }
        }
    }
}

pub type TransportEvents = mpsc::UnboundedSender<TransportEvent>;

#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create_connection(
        &self,
        events: TransportEvents,
    ) -> Result<Arc<dyn PeerConnection>, TransportError>;
}

#[async_trait]
pub trait PeerConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;
    async fn create_answer(&self) -> Result<SessionDescription, TransportError>;
    async fn set_local_description(&self, description: SessionDescription)
    -> Result<(), TransportError>;
    async fn set_remote_description(
        &self,
        description: SessionDescription,
    ) -> Result<(), TransportError>;
    /// Fails with [`TransportError::RemoteDescriptionMissing`] when called too early.
    async fn add_remote_candidate(&self, candidate: IceCandidateBlob)
    -> Result<(), TransportError>;
    async fn create_data_channel(&self, label: &str)
    -> Result<Arc<dyn DataChannel>, TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;
    fn is_open(&self) -> bool;
    /// Queues one message; delivery order matches call order.
    fn send(&self, payload: Bytes) -> Result<(), TransportError>;
    async fn close(&self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn candidate_blob_matches_browser_json() {
        let json = r#"{"candidate":"candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host","sdpMid":"0","sdpMLineIndex":0,"usernameFragment":"abcd"}"#;
        let blob: IceCandidateBlob = serde_json::from_str(json).unwrap();
        assert_eq!(blob.sdp_mid.as_deref(), Some("0"));
        assert_eq!(blob.sdp_mline_index, Some(0));
        assert_eq!(blob.username_fragment.as_deref(), Some("abcd"));

        let encoded = serde_json::to_value(IceCandidateBlob::new("candidate:x")).unwrap();
        assert_eq!(encoded["sdpMid"], "0");
        assert!(encoded.get("usernameFragment").is_none());
    }

    #[test_timeout::timeout]
    fn description_uses_type_key() {
        let encoded = serde_json::to_value(SessionDescription::answer("v=0")).unwrap();
        assert_eq!(encoded["type"], "answer");
        assert_eq!(encoded["sdp"], "v=0");
    }
}
