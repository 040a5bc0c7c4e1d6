//! Recorder configuration
//!
//! Values come from an optional TOML file and are then overridden by command
//! line flags. Everything is checked once by [`AppConfig::validate`] before
//! capture starts; a failed check is fatal.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::capture::rtp::RTP_HEADER_SIZE;
use crate::constants::*;
use crate::error::ConfigError;

/// Datagram framing of the input stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputKind {
    /// Raw transport stream in the UDP payload
    Udp,
    /// Transport stream behind a 12 byte RTP header
    Rtp,
}

impl InputKind {
    /// Largest datagram read from the socket for this framing
    pub fn max_datagram(&self) -> usize {
        match self {
            InputKind::Udp => FRAME_SIZE,
            InputKind::Rtp => FRAME_SIZE + RTP_HEADER_SIZE,
        }
    }

    fn scheme(&self) -> &'static str {
        match self {
            InputKind::Udp => "udp",
            InputKind::Rtp => "rtp",
        }
    }
}

/// Address family restriction used when resolving the input host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    #[default]
    Any,
    V4,
    V6,
}

/// Parsed input address, `udp://host:port` or `rtp://[v6addr]:port/`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InputUrl {
    pub kind: InputKind,
    pub host: String,
    pub port: u16,
}

impl FromStr for InputUrl {
    type Err = ConfigError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        if input.is_empty() {
            return Err(ConfigError::InvalidInput("empty input address".into()));
        }

        let (kind, rest) = if let Some(rest) = input.strip_prefix("udp://") {
            (InputKind::Udp, rest)
        } else if let Some(rest) = input.strip_prefix("rtp://") {
            (InputKind::Rtp, rest)
        } else {
            return Err(ConfigError::UnsupportedProtocol(input.to_string()));
        };

        let (host, service) = if let Some(v6) = rest.strip_prefix('[') {
            let end = v6.rfind(']').ok_or_else(|| {
                ConfigError::InvalidInput(format!("Invalid IPv6 address format: {}", input))
            })?;
            let after = &v6[end + 1..];
            (&v6[..end], after.find(':').map(|i| &after[i + 1..]))
        } else {
            match rest.rfind(':') {
                Some(i) => (&rest[..i], Some(&rest[i + 1..])),
                None => (rest, None),
            }
        };

        let service = service
            .ok_or_else(|| ConfigError::InvalidInput(format!("Port is not set in {}", input)))?;
        // Anything after the port is a path and is ignored.
        let service = service.split('/').next().unwrap_or_default();
        let port = service
            .parse::<u16>()
            .map_err(|_| {
                ConfigError::InvalidInput(format!("Invalid port '{}' in {}", service, input))
            })?;

        if host.is_empty() {
            return Err(ConfigError::InvalidInput(format!("Host is not set in {}", input)));
        }

        Ok(Self {
            kind,
            host: host.to_string(),
            port,
        })
    }
}

impl fmt::Display for InputUrl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}/", self.kind.scheme(), self.host, self.port)
        } else {
            write!(f, "{}://{}:{}/", self.kind.scheme(), self.host, self.port)
        }
    }
}

/// Network input configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Input URL, see [`InputUrl`]
    pub url: Option<String>,

    /// Address family restriction
    pub family: AddressFamily,

    /// Log RTP sequence discontinuities
    pub report_discontinuity: bool,

    /// Socket read timeout in milliseconds
    pub read_timeout_ms: u64,

    /// Socket receive buffer size in bytes
    pub recv_buffer_size: usize,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            url: None,
            family: AddressFamily::Any,
            report_discontinuity: true,
            read_timeout_ms: DEFAULT_READ_TIMEOUT_MS,
            recv_buffer_size: DEFAULT_RECV_BUFFER_SIZE,
        }
    }
}

impl InputConfig {
    /// Parse the configured input URL
    pub fn input_url(&self) -> Result<InputUrl, ConfigError> {
        match self.url.as_deref() {
            Some(url) => url.parse(),
            None => Err(ConfigError::InvalidInput("input address is not set".into())),
        }
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

/// Output file configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// File name prefix
    pub prefix: Option<String>,

    /// Base directory for output files
    pub dir: PathBuf,

    /// Rotation interval in seconds
    pub rotate_secs: u64,

    /// Also link files into YYYY/MM/DD/HH subdirectories
    pub create_dirs: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            prefix: None,
            dir: PathBuf::from("."),
            rotate_secs: DEFAULT_ROTATE_SECS,
            create_dirs: false,
        }
    }
}

/// Packet buffering configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Bytes per packet
    pub packet_capacity: usize,

    /// Preallocated packets
    pub pool_slots: usize,

    /// Maximum time a packet is filled before it is written, in milliseconds
    pub max_fill_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            packet_capacity: PACKET_MAX_LENGTH,
            pool_slots: NUM_PACKETS,
            max_fill_ms: PACKET_MAX_TIME_MS,
        }
    }
}

impl BufferConfig {
    pub fn max_fill_time(&self) -> Duration {
        Duration::from_millis(self.max_fill_ms)
    }
}

/// Complete application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub input: InputConfig,
    pub output: OutputConfig,
    pub buffer: BufferConfig,
}

impl AppConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&text)
    }

    /// Parse configuration from TOML text
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(text)?)
    }

    /// Per-user config file location, e.g. `~/.config/ts-recorder/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "ts-recorder")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load the per-user config file if it exists, defaults otherwise
    pub fn load_default() -> Result<Self, ConfigError> {
        match Self::default_path() {
            Some(path) if path.is_file() => Self::from_file(path),
            _ => Ok(Self::default()),
        }
    }

    /// The configured prefix, checked for presence and length
    pub fn prefix(&self) -> Result<&str, ConfigError> {
        let prefix = self
            .output
            .prefix
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or(ConfigError::PrefixMissing)?;
        if prefix.len() >= PREFIX_MAX_LENGTH {
            return Err(ConfigError::PrefixTooLong {
                len: prefix.len(),
                max: PREFIX_MAX_LENGTH,
            });
        }
        Ok(prefix)
    }

    /// Check everything that must hold before capture begins
    pub fn validate(&self) -> Result<InputUrl, ConfigError> {
        self.prefix()?;
        let url = self.input.input_url()?;

        if self.output.rotate_secs == 0 {
            return Err(ConfigError::InvalidRotation);
        }

        let dir = &self.output.dir;
        match std::fs::metadata(dir) {
            Ok(meta) if meta.is_dir() => {
                if meta.permissions().readonly() {
                    return Err(ConfigError::OutputDir {
                        path: dir.clone(),
                        reason: "directory is read-only".into(),
                    });
                }
            }
            Ok(_) => {
                return Err(ConfigError::OutputDir {
                    path: dir.clone(),
                    reason: "not a directory".into(),
                })
            }
            Err(e) => {
                return Err(ConfigError::OutputDir {
                    path: dir.clone(),
                    reason: e.to_string(),
                })
            }
        }

        let datagram = url.kind.max_datagram();
        if self.buffer.packet_capacity <= datagram {
            return Err(ConfigError::PacketCapacity {
                capacity: self.buffer.packet_capacity,
                datagram,
            });
        }

        Ok(url)
    }
}
