use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// One message on the chat channel. The `type` key matches the browser client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Envelope {
    Nickname { name: String },
    Chat { message: String },
    Typing,
    #[serde(other)]
    Unknown,
}

impl Envelope {
    pub fn encode(&self) -> Bytes {
        // Serializing these variants cannot fail: every field is a plain string.
        Bytes::from(serde_json::to_vec(self).unwrap_or_default())
    }

    /// `None` for anything that isn't a well-formed envelope of a known kind.
    pub fn decode(payload: &[u8]) -> Option<Self> {
        match serde_json::from_slice::<Envelope>(payload) {
            Ok(Envelope::Unknown) => None,
            Ok(envelope) => Some(envelope),
            Err(err) => {
                tracing::debug!(target = "beach_chat::protocol", error = %err, "dropping malformed envelope");
                None
            }
        }
    }
}
