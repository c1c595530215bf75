//! Two-person chat over a WebRTC data channel, negotiated through a shared signaling store.

pub mod chat;
pub mod config;
pub mod error;
pub mod handshake;
pub mod protocol;
pub mod record;
pub mod session;
pub mod signaling;
pub mod telemetry;
pub mod transport;

pub use config::{ChatConfig, SessionSettings};
pub use error::ChatError;
pub use session::{Session, SessionHandle, SessionState, SessionUpdate, SessionView};
