//! Server settings. Every field has a default so the server runs without
//! any arguments.

use crate::error::{ServerError, ServerResult};
use flate2::Crc;
use shared::{Color, DEFAULT_PORT};
use std::path::{Path, PathBuf};
use std::time::Duration;
use std::{fs, io};

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Simulation ticks per second
    pub tick_rate: u32,
    /// Raw transport connections, including peers still handshaking
    pub max_connections: usize,
    /// Respawns happen on a shared cadence of this many seconds
    pub max_respawn_time: u32,
    pub map_width: i32,
    pub map_length: i32,
    pub map_depth: i32,
    pub ground_height: i32,
    /// Content packs offered to every client during the handshake
    pub packs: Vec<PathBuf>,
    /// How long to wait for a client's answer to a pack offer
    pub handshake_timeout: Duration,
    pub fog_color: Color,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: DEFAULT_PORT,
            tick_rate: 60,
            max_connections: 64,
            max_respawn_time: 5,
            map_width: 512,
            map_length: 512,
            map_depth: 64,
            ground_height: 32,
            packs: Vec::new(),
            handshake_timeout: Duration::from_secs(10),
            fog_color: Color::new(128, 232, 255),
        }
    }
}

impl ServerConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn tick_duration(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.tick_rate.max(1) as f64)
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.tick_rate == 0 || self.tick_rate > 1000 {
            return Err(ServerError::Config(format!(
                "tick rate must be between 1 and 1000, got {}",
                self.tick_rate
            )));
        }
        if self.max_respawn_time == 0 {
            return Err(ServerError::Config("max respawn time must be positive".into()));
        }
        if self.map_width <= 0 || self.map_length <= 0 || self.map_width > u16::MAX as i32 {
            return Err(ServerError::Config(format!(
                "invalid map size {}x{}",
                self.map_width, self.map_length
            )));
        }
        if !(2..=255).contains(&self.map_depth) || !(0..self.map_depth).contains(&self.ground_height)
        {
            return Err(ServerError::Config(format!(
                "ground height {} does not fit a map {} deep",
                self.ground_height, self.map_depth
            )));
        }
        Ok(())
    }
}

/// A content pack offered to clients during the handshake. Clients that
/// already hold a pack with the same checksum skip the download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pack {
    pub data: Vec<u8>,
    pub checksum: u32,
}

impl Pack {
    pub fn new(data: Vec<u8>) -> Self {
        let mut crc = Crc::new();
        crc.update(&data);
        Self {
            data,
            checksum: crc.sum(),
        }
    }

    pub fn load(path: &Path) -> io::Result<Self> {
        Ok(Self::new(fs::read(path)?))
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

/// Reads every configured pack, failing on the first unreadable file.
pub fn load_packs(paths: &[PathBuf]) -> ServerResult<Vec<Pack>> {
    paths
        .iter()
        .map(|path| Pack::load(path).map_err(ServerError::from))
        .collect()
}
