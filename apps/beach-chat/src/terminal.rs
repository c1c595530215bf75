use beach_chat::SessionState;
use beach_chat::SessionUpdate;
use beach_chat::chat::{ChatMessage, MessageOrigin};
use beach_chat::config::DEFAULT_PEER_NICKNAME;

pub const QUIT_COMMAND: &str = "/quit";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Output {
    Line(String),
    Bell,
}

/// Turns session updates into terminal lines.
pub struct Renderer {
    local_name: String,
    peer_name: String,
}

impl Renderer {
    pub fn new(local_name: impl Into<String>) -> Self {
        Self {
            local_name: local_name.into(),
            peer_name: DEFAULT_PEER_NICKNAME.to_string(),
        }
    }

    fn message_line(&self, message: &ChatMessage) -> String {
        let clock = message.clock();
        match message.origin {
            MessageOrigin::Local => format!("[{clock}] {}: {}", self.local_name, message.text),
            MessageOrigin::Peer => format!("[{clock}] {}: {}", self.peer_name, message.text),
            MessageOrigin::System => format!("[{clock}] * {}", message.text),
        }
    }

    pub fn render(&mut self, update: &SessionUpdate) -> Option<Output> {
        let line = match update {
            SessionUpdate::Message(message) => self.message_line(message),
            SessionUpdate::PeerNamed(name) => {
                self.peer_name = name.clone();
                return None;
            }
            SessionUpdate::Typing(true) => format!("{} is typing...", self.peer_name),
            SessionUpdate::Notification => return Some(Output::Bell),
            SessionUpdate::StateChanged(SessionState::Negotiating) => {
                "Waiting for the other side...".to_string()
            }
            SessionUpdate::StateChanged(SessionState::Chatting) => {
                format!("Connected. Type a message, {QUIT_COMMAND} to leave.")
            }
            SessionUpdate::StateChanged(SessionState::Closed) => "Session closed.".to_string(),
            SessionUpdate::Failed(err) => format!("Connection failed: {err}"),
            SessionUpdate::Typing(false)
            | SessionUpdate::StateChanged(_)
            | SessionUpdate::SessionId(_)
            | SessionUpdate::DisconnectComplete => return None,
        };
        Some(Output::Line(line))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test_timeout::timeout]
    fn peer_messages_use_bound_nickname() {
        let mut renderer = Renderer::new("me");
        let message = ChatMessage::new(MessageOrigin::Peer, "hello", Utc::now());

        let Some(Output::Line(line)) = renderer.render(&SessionUpdate::Message(message.clone()))
        else {
            panic!("expected a line");
        };
        assert!(line.ends_with("] Peer: hello"));

        assert_eq!(renderer.render(&SessionUpdate::PeerNamed("ana".into())), None);
        assert_eq!(
            renderer.render(&SessionUpdate::Typing(true)),
            Some(Output::Line("ana is typing...".into()))
        );
        let Some(Output::Line(line)) = renderer.render(&SessionUpdate::Message(message)) else {
            panic!("expected a line");
        };
        assert!(line.ends_with("] ana: hello"));
        assert_eq!(
            renderer.render(&SessionUpdate::Notification),
            Some(Output::Bell)
        );
    }
}
