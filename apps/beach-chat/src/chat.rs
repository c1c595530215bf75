use std::time::Duration;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::DEFAULT_PEER_NICKNAME;
use crate::protocol::Envelope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageOrigin {
    Local,
    Peer,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub origin: MessageOrigin,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    pub fn new(origin: MessageOrigin, text: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            origin,
            text: text.into(),
            timestamp,
        }
    }

    /// `HH:MM` in local time.
    pub fn clock(&self) -> String {
        self.timestamp
            .with_timezone(&chrono::Local)
            .format("%H:%M")
            .to_string()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatEffect {
    Appended(ChatMessage),
    Typing(bool),
    PeerNamed(String),
    /// Something arrived the user should be alerted to.
    Notify,
}

/// Chat protocol state for one session: transcript, peer identity and the typing indicator.
#[derive(Debug)]
pub struct ChatEngine {
    display_name: String,
    peer_nickname: String,
    messages: Vec<ChatMessage>,
    typing_timeout: Duration,
    typing_deadline: Option<Instant>,
}

impl ChatEngine {
    pub fn new(display_name: impl Into<String>, typing_timeout: Duration) -> Self {
        Self {
            display_name: display_name.into(),
            peer_nickname: DEFAULT_PEER_NICKNAME.to_string(),
            messages: Vec::new(),
            typing_timeout,
            typing_deadline: None,
        }
    }

    pub fn display_name(&self) -> &str {
        &self.display_name
    }

    pub fn peer_nickname(&self) -> &str {
        &self.peer_nickname
    }

    pub fn messages(&self) -> &[ChatMessage] {
        &self.messages
    }

    pub fn peer_typing(&self) -> bool {
        self.typing_deadline.is_some()
    }

    pub fn typing_deadline(&self) -> Option<Instant> {
        self.typing_deadline
    }

    /// The envelope sent once when the channel opens.
    pub fn greeting(&self) -> Bytes {
        Envelope::Nickname {
            name: self.display_name.clone(),
        }
        .encode()
    }

    pub fn typing_envelope(&self) -> Bytes {
        Envelope::Typing.encode()
    }

    fn append(&mut self, message: ChatMessage) -> ChatEffect {
        self.messages.push(message.clone());
        ChatEffect::Appended(message)
    }

    pub fn receive(&mut self, payload: &[u8], now: Instant, at: DateTime<Utc>) -> Vec<ChatEffect> {
        let Some(envelope) = Envelope::decode(payload) else {
            return Vec::new();
        };
        match envelope {
            Envelope::Nickname { name } => {
                self.peer_nickname = name.clone();
                let joined = ChatMessage::new(
                    MessageOrigin::System,
                    format!("{name} has joined."),
                    at,
                );
                vec![ChatEffect::PeerNamed(name), self.append(joined)]
            }
            Envelope::Chat { message } => {
                let mut effects = Vec::with_capacity(3);
                if self.typing_deadline.take().is_some() {
                    effects.push(ChatEffect::Typing(false));
                }
                effects.push(self.append(ChatMessage::new(MessageOrigin::Peer, message, at)));
                effects.push(ChatEffect::Notify);
                effects
            }
            Envelope::Typing => {
                let was_typing = self.typing_deadline.replace(now + self.typing_timeout);
                if was_typing.is_some() {
                    Vec::new()
                } else {
                    vec![ChatEffect::Typing(true)]
                }
            }
            Envelope::Unknown => Vec::new(),
        }
    }

    /// Turns the indicator off if its deadline has passed.
    pub fn expire_typing(&mut self, now: Instant) -> Option<ChatEffect> {
        match self.typing_deadline {
            Some(deadline) if deadline <= now => {
                self.typing_deadline = None;
                Some(ChatEffect::Typing(false))
            }
            _ => None,
        }
    }

    /// Encodes an outbound message. `None` when the trimmed text is empty.
    pub fn compose(&mut self, text: &str, at: DateTime<Utc>) -> Option<(Bytes, ChatMessage)> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        let envelope = Envelope::Chat {
            message: text.to_string(),
        };
        let message = ChatMessage::new(MessageOrigin::Local, text, at);
        self.messages.push(message.clone());
        Some((envelope.encode(), message))
    }

    pub fn peer_disconnected(&mut self, at: DateTime<Utc>) -> Vec<ChatEffect> {
        let mut effects = Vec::with_capacity(2);
        if self.typing_deadline.take().is_some() {
            effects.push(ChatEffect::Typing(false));
        }
        let text = format!("{} has disconnected.", self.peer_nickname);
        effects.push(self.append(ChatMessage::new(MessageOrigin::System, text, at)));
        effects
    }
}
