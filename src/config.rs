use std::{fs::read_to_string, net::IpAddr, time::Duration};

use anyhow::Result;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use service::negotiation::{CaptureConfig, MediaConfig};

use crate::{orchestrator::OrchestratorOptions, server::SignalingOptions};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Signaling {
    ///
    /// Listen address of the group owner
    ///
    /// The address the signaling listener binds to when this device ends up
    /// as the group owner. The dialing side ignores it.
    ///
    #[serde(default = "Signaling::bind")]
    pub bind: IpAddr,
    ///
    /// Signaling port
    ///
    /// Both sides must agree on it, the dialing side connects to the owner
    /// address on this port.
    ///
    #[serde(default = "Signaling::port")]
    pub port: u16,
}

impl Signaling {
    fn bind() -> IpAddr {
        IpAddr::from([0, 0, 0, 0])
    }

    fn port() -> u16 {
        8888
    }

    pub fn options(&self) -> SignalingOptions {
        SignalingOptions {
            bind: self.bind,
            port: self.port,
        }
    }
}

impl Default for Signaling {
    fn default() -> Self {
        Self {
            bind: Self::bind(),
            port: Self::port(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Discovery {
    ///
    /// Discovery timeout
    ///
    /// Discovery stops by itself after this many seconds unless it was
    /// stopped explicitly before.
    ///
    #[serde(default = "Discovery::timeout")]
    pub timeout: u64,
}

impl Discovery {
    fn timeout() -> u64 {
        30
    }

    pub fn get_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            timeout: Self::timeout(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Capture {
    #[serde(default = "Capture::width")]
    pub width: u32,
    #[serde(default = "Capture::height")]
    pub height: u32,
    #[serde(default = "Capture::fps")]
    pub fps: u32,
}

impl Capture {
    fn width() -> u32 {
        1280
    }

    fn height() -> u32 {
        720
    }

    fn fps() -> u32 {
        30
    }
}

impl Default for Capture {
    fn default() -> Self {
        Self {
            width: Self::width(),
            height: Self::height(),
            fps: Self::fps(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Media {
    ///
    /// ice servers
    ///
    /// STUN/TURN urls handed to the media engine for connectivity checks.
    ///
    #[serde(default = "Media::ice_servers")]
    pub ice_servers: Vec<String>,
    #[serde(default)]
    pub capture: Capture,
}

impl Media {
    fn ice_servers() -> Vec<String> {
        vec!["stun:stun.l.google.com:19302".to_string()]
    }

    pub fn as_media_config(&self) -> MediaConfig {
        MediaConfig {
            ice_servers: self.ice_servers.clone(),
            capture: CaptureConfig {
                width: self.capture.width,
                height: self.capture.height,
                fps: self.capture.fps,
            },
        }
    }
}

impl Default for Media {
    fn default() -> Self {
        Self {
            ice_servers: Self::ice_servers(),
            capture: Capture::default(),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Default for LogLevel {
    fn default() -> Self {
        Self::Info
    }
}

impl LogLevel {
    pub fn as_level(&self) -> log::Level {
        match *self {
            Self::Error => log::Level::Error,
            Self::Debug => log::Level::Debug,
            Self::Trace => log::Level::Trace,
            Self::Warn => log::Level::Warn,
            Self::Info => log::Level::Info,
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Log {
    ///
    /// log level
    ///
    /// An enum representing the available verbosity levels of the logger.
    ///
    #[serde(default)]
    pub level: LogLevel,
}

#[derive(Deserialize, Debug, Default, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    #[serde(default)]
    pub signaling: Signaling,
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub media: Media,
    #[serde(default)]
    pub log: Log,
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Run the signaling listener, as the group owner does.
    Listen,
    /// Dial a signaling listener, as a group client does.
    Dial {
        /// Address of the listener, the port comes from the configuration.
        address: String,
    },
}

#[derive(Parser, Debug)]
#[command(
    about = env!("CARGO_PKG_DESCRIPTION"),
    version = env!("CARGO_PKG_VERSION"),
)]
pub struct Cli {
    ///
    /// Specify the configuration file path
    ///
    /// Example: mirror-link --config /etc/mirror-link/config.json5 listen
    ///
    #[arg(long, short)]
    pub config: Option<String>,
    #[command(subcommand)]
    pub command: Command,
}

impl Config {
    ///
    /// Load configure from config file and command line parameters.
    ///
    /// If the configuration file path is specified, the configuration is read
    /// from the configuration file, otherwise the default configuration is
    /// used.
    ///
    pub fn load(cli: &Cli) -> Result<Self> {
        Ok(match &cli.config {
            Some(path) => Self::parse(&read_to_string(path)?)?,
            None => Self::default(),
        })
    }

    pub fn parse(text: &str) -> Result<Self> {
        Ok(serde_json5::from_str::<Self>(text)?)
    }

    pub fn orchestrator_options(&self) -> OrchestratorOptions {
        OrchestratorOptions {
            signaling: self.signaling.options(),
            media: self.media.as_media_config(),
            discovery_timeout: self.discovery.get_timeout(),
        }
    }
}
