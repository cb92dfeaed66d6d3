pub mod config;
pub mod orchestrator;
pub mod server;
pub mod statistics;

pub mod prelude {
    pub use codec::{LineDecoder, MessageKind, SignalingMessage};
    pub use service::{negotiation::*, topology::*};

    pub use super::{
        orchestrator::{Orchestrator, OrchestratorOptions, SessionError},
        server::{ChannelEvent, SignalingChannel, SignalingOptions},
    };
}

use std::str::FromStr;

use codec::{MessageKind, SignalingMessage};
use service::topology::Role;
use tokio::io::{AsyncBufReadExt, BufReader};

use self::{
    config::{Command, Config},
    server::{ChannelEvent, SignalingChannel},
};

/// Parse a line typed on the console, `<type> <data>`.
///
/// Returns `None` for blank lines.
///
/// # Test
///
/// ```
/// use mirror_link::parse_console_line;
/// use mirror_link::prelude::*;
///
/// let message = parse_console_line("ice_candidate candidate:1 1 udp").unwrap().unwrap();
/// assert_eq!(message, SignalingMessage::ice_candidate("candidate:1 1 udp"));
///
/// assert!(parse_console_line("   ").is_none());
/// assert!(parse_console_line("bye now").unwrap().is_err());
/// ```
pub fn parse_console_line(line: &str) -> Option<Result<SignalingMessage, codec::Error>> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }

    let (kind, payload) = line.split_once(' ').unwrap_or((line, ""));
    Some(MessageKind::from_str(kind).map(|kind| SignalingMessage::new(kind, payload.trim_start())))
}

/// Run a bare signaling channel on the console.
///
/// Lines typed on stdin are sent to the counterpart, received messages are
/// logged. Handy to poke at the other side of a session by hand, no media is
/// involved.
pub async fn startup(config: Config, command: Command) -> anyhow::Result<()> {
    let role = match command {
        Command::Listen => Role::Listener,
        Command::Dial { address } => Role::Peer(address),
    };

    let options = config.orchestrator_options();
    log::info!(
        "probe starting: role={role:?}, port={}, ice_servers={:?}",
        options.signaling.port,
        options.media.ice_servers,
    );

    let channel = SignalingChannel::new(role.clone(), options.signaling);
    let mut inbound = channel.start().await?;
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            Some(event) = inbound.recv() => {
                match event {
                    ChannelEvent::Connected(address) => {
                        log::info!("signaling link up: addr={address}");
                    }
                    ChannelEvent::Message(message) => {
                        log::info!("signaling message: type={}, data={}", message.kind, message.payload);
                    }
                    ChannelEvent::Disconnected(address) => {
                        log::info!("signaling link down: addr={address}");

                        // A dialed link is never re-established.
                        if role != Role::Listener {
                            break;
                        }
                    }
                }
            }
            ret = lines.next_line() => {
                let Some(line) = ret? else {
                    break;
                };

                match parse_console_line(&line) {
                    Some(Ok(message)) => {
                        channel.send(&message);
                    }
                    Some(Err(e)) => log::warn!("console line ignored: err={e}"),
                    None => (),
                }
            }
        }
    }

    channel.stop();
    log::info!("signaling statistics: {:?}", channel.statistics().get());

    Ok(())
}
