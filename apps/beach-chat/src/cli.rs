use std::path::PathBuf;

use clap::{Parser, Subcommand};

use beach_chat::ChatConfig;
use beach_chat::telemetry::LogLevel;

#[derive(Parser, Debug)]
#[command(name = "beach-chat")]
#[command(about = "Peer-to-peer terminal chat over WebRTC")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Name shown to the other person
    #[arg(long, short = 'n', env = "BEACH_CHAT_NAME")]
    pub name: Option<String>,

    /// Redis instance used for signaling
    #[arg(long, env = "BEACH_CHAT_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Only gather loopback candidates and skip STUN/TURN
    #[arg(long)]
    pub localhost: bool,

    #[arg(long, value_enum, default_value_t = LogLevel::Warn)]
    pub log_level: LogLevel,

    /// Write logs here instead of stderr
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start a session and print the id to share
    Host,
    /// Join a session by id
    Join {
        /// Session id printed by the host
        session_id: String,
    },
}

impl Cli {
    /// Flags win over the environment.
    pub fn apply(&self, config: &mut ChatConfig) {
        if let Some(name) = &self.name {
            config.session.display_name = name.clone();
        }
        if let Some(url) = &self.redis_url {
            config.redis_url = url.clone();
        }
        if self.localhost {
            config.localhost_only = true;
            config.ice_servers.clear();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn flags_override_config() {
        let cli = Cli::parse_from([
            "beach-chat",
            "--name",
            "ana",
            "--redis-url",
            "redis://elsewhere:6379",
            "--localhost",
            "join",
            "abc",
        ]);
        let mut config = ChatConfig::default();
        cli.apply(&mut config);
        assert_eq!(config.session.display_name, "ana");
        assert_eq!(config.redis_url, "redis://elsewhere:6379");
        assert!(config.ice_servers.is_empty());
        assert!(matches!(cli.command, Commands::Join { ref session_id } if session_id == "abc"));
    }
}
