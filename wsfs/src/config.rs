use crate::fs::{DEFAULT_BLOCK_SIZE, DEFAULT_CHUNK_SIZE};
use crate::proto::codec::MAX_FIELD_LEN;
use crate::proto::server::DEFAULT_MAX_MESSAGE_SIZE;
use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

const DEFAULT_CAPACITY_BYTES: u64 = 1 << 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub filesystem: FilesystemConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ServerConfig {
    #[serde(default)]
    pub addresses: Vec<SocketAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unix_socket: Option<PathBuf>,
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FilesystemConfig {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u32,
    #[serde(default = "default_block_size")]
    pub block_size: u32,
    #[serde(default = "default_capacity_bytes")]
    pub capacity_bytes: u64,
}

fn default_max_message_size() -> usize {
    DEFAULT_MAX_MESSAGE_SIZE
}

fn default_chunk_size() -> u32 {
    DEFAULT_CHUNK_SIZE
}

fn default_block_size() -> u32 {
    DEFAULT_BLOCK_SIZE
}

fn default_capacity_bytes() -> u64 {
    DEFAULT_CAPACITY_BYTES
}

impl Default for FilesystemConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            capacity_bytes: DEFAULT_CAPACITY_BYTES,
        }
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                addresses: vec![SocketAddr::from(([127, 0, 0, 1], 3030))],
                unix_socket: None,
                max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            },
            filesystem: FilesystemConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let fs = &self.filesystem;
        if fs.chunk_size == 0 {
            bail!("filesystem.chunk_size must be greater than zero");
        }
        if fs.chunk_size as usize > MAX_FIELD_LEN {
            bail!(
                "filesystem.chunk_size {} exceeds the {} byte wire buffer limit",
                fs.chunk_size,
                MAX_FIELD_LEN
            );
        }
        if fs.block_size == 0 {
            bail!("filesystem.block_size must be greater than zero");
        }
        if self.server.addresses.is_empty() && self.server.unix_socket.is_none() {
            bail!("server needs at least one TCP address or a unix_socket");
        }
        // Smallest useful frame holds a write of one full chunk.
        if self.server.max_message_size < MAX_FIELD_LEN + 64 {
            bail!(
                "server.max_message_size must be at least {}",
                MAX_FIELD_LEN + 64
            );
        }
        Ok(())
    }

    pub fn generate_default() -> String {
        let body = toml::to_string_pretty(&Self::default()).unwrap_or_default();
        format!(
            "# wsfs configuration\n\
             #\n\
             # [server] unix_socket = \"/run/wsfs.sock\" adds a Unix listener.\n\
             # RUST_LOG controls log verbosity (default: info).\n\n{body}"
        )
    }

    pub fn write_default_config(path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, Self::generate_default())
            .with_context(|| format!("Failed to write config file {}", path.display()))
    }
}
