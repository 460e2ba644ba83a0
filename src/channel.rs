//! Channel identities and the static feed configuration table.
//!
//! A channel is one logical market-data stream, delivered redundantly
//! over two multicast paths (primary + secondary). The table mapping
//! stream ids to endpoint pairs is loaded once at startup and immutable
//! for the process lifetime; components that need it receive it as an
//! explicit constructor parameter.
//!
//! # Configuration format
//!
//! ```toml
//! [[channel]]
//! stream_id = 1
//! primary = { group = "239.70.70.41", port = 17741 }
//! secondary = { group = "239.70.70.31", port = 10831 }
//! ```
//!
//! `group` may be omitted for a plain bound UDP socket (unicast feeds,
//! loopback tests).

use std::collections::BTreeMap;
use std::fmt;
use std::net::Ipv4Addr;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Identifier of one logical feed stream.
///
/// Matches the wire header's 16-bit signed stream-id field. Valid ids
/// are small positive integers; zero and negative ids are configuration
/// errors.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize,
)]
#[serde(transparent)]
pub struct StreamId(pub i16);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<i16> for StreamId {
    fn from(v: i16) -> Self {
        Self(v)
    }
}

/// One receive endpoint of a feed: multicast group + UDP port.
///
/// `group: None` means no multicast join is performed; the socket is
/// simply bound to the port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct FeedEndpoint {
    /// Multicast group to join, if any.
    #[serde(default)]
    pub group: Option<Ipv4Addr>,
    /// UDP port to bind.
    pub port: u16,
}

impl fmt::Display for FeedEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.group {
            Some(group) => write!(f, "{group}:{}", self.port),
            None => write!(f, "*:{}", self.port),
        }
    }
}

/// Static configuration of one channel: id plus its two redundant
/// endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct ChannelConfig {
    pub stream_id: StreamId,
    pub primary: FeedEndpoint,
    pub secondary: FeedEndpoint,
}

/// Errors validating or loading a channel table.
#[derive(Debug, Error)]
pub enum ChannelConfigError {
    /// Stream ids must be small positive integers.
    #[error("stream id {0} is not a positive integer")]
    NonPositiveId(i16),
    /// The same stream id appeared twice.
    #[error("duplicate stream id {0}")]
    DuplicateId(StreamId),
    /// Primary and secondary endpoints must differ.
    #[error("stream {0}: primary and secondary endpoints are identical")]
    IdenticalEndpoints(StreamId),
    /// The table contained no channels at all.
    #[error("channel table is empty")]
    Empty,
    /// Configuration file could not be read.
    #[error("failed to read channel table from `{path}`")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    /// Configuration file could not be parsed.
    #[error("failed to parse channel table")]
    Parse(#[from] toml::de::Error),
}

/// Immutable mapping from stream id to channel configuration.
///
/// Iteration order is ascending by stream id, which fixes the socket
/// creation order in the multiplexer and the file layout of the capture
/// writer.
#[derive(Debug, Clone)]
pub struct ChannelTable {
    channels: BTreeMap<StreamId, ChannelConfig>,
}

#[derive(Deserialize)]
struct TableFile {
    channel: Vec<ChannelConfig>,
}

impl ChannelTable {
    /// Builds a table from a list of channel configurations.
    ///
    /// # Errors
    ///
    /// Rejects non-positive ids, duplicate ids, identical
    /// primary/secondary endpoint pairs, and empty tables.
    pub fn new(
        channels: impl IntoIterator<Item = ChannelConfig>,
    ) -> Result<Self, ChannelConfigError> {
        let mut map = BTreeMap::new();
        for config in channels {
            if config.stream_id.0 <= 0 {
                return Err(ChannelConfigError::NonPositiveId(config.stream_id.0));
            }
            if config.primary == config.secondary {
                return Err(ChannelConfigError::IdenticalEndpoints(config.stream_id));
            }
            if map.insert(config.stream_id, config.clone()).is_some() {
                return Err(ChannelConfigError::DuplicateId(config.stream_id));
            }
        }
        if map.is_empty() {
            return Err(ChannelConfigError::Empty);
        }
        Ok(Self { channels: map })
    }

    /// Parses a table from TOML text.
    ///
    /// # Errors
    ///
    /// Returns parse errors and the same validation errors as [`new`].
    ///
    /// [`new`]: ChannelTable::new
    pub fn from_toml_str(text: &str) -> Result<Self, ChannelConfigError> {
        let file: TableFile = toml::from_str(text)?;
        Self::new(file.channel)
    }

    /// Reads and parses a table from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns I/O errors, parse errors, and validation errors.
    pub fn from_toml_path(path: impl AsRef<Path>) -> Result<Self, ChannelConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ChannelConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Looks up one channel by stream id.
    #[must_use]
    pub fn get(&self, stream: StreamId) -> Option<&ChannelConfig> {
        self.channels.get(&stream)
    }

    /// Iterates channels in ascending stream-id order.
    pub fn iter(&self) -> impl Iterator<Item = &ChannelConfig> {
        self.channels.values()
    }

    /// Number of configured channels.
    #[must_use]
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}
