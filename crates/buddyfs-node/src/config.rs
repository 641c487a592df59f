use std::{net::SocketAddr, path::PathBuf, str::FromStr};

use buddyfs_proto::NetAddress;
use buddyfs_utils::directories::buddy_dir;
use serde::Deserialize;

/// On-disk node configuration (`buddyfs-node.toml`). Every field has a
/// sensible default so a bare config file of `listen_addr = "0.0.0.0:9000"`
/// is enough to run.
#[derive(Debug, Deserialize)]
pub struct NodeConfig {
    pub listen_addr: SocketAddr,
    #[serde(default)]
    pub seeds: Vec<String>,
    #[serde(default)]
    pub snapshot_path: Option<PathBuf>,
    #[serde(default)]
    pub log_filter: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("couldn't read config file {path}: {source}")]
    Read { path: PathBuf, #[source] source: std::io::Error },
    #[error("couldn't parse config file {path}: {source}")]
    Parse { path: PathBuf, #[source] source: toml::de::Error },
    #[error("seed {seed:?} is not a valid IPv4 host:port")]
    BadSeed { seed: String },
}

impl NodeConfig {
    pub fn load(path: &std::path::Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)
            .map_err(|source| ConfigError::Read { path: path.to_path_buf(), source })?;
        toml::from_str(&text).map_err(|source| ConfigError::Parse { path: path.to_path_buf(), source })
    }

    /// Snapshot path, falling back to `buddy_dir("buddyfs")/snapshot.bin`
    /// (grounded on `buddyfs_utils::directories::buddy_dir`, the same
    /// helper `FilesystemTree::load_local`/`save_local`'s callers use).
    pub fn snapshot_path(&self) -> PathBuf {
        self.snapshot_path.clone().unwrap_or_else(|| buddy_dir("buddyfs").join("snapshot.bin"))
    }

    pub fn seed_addrs(&self) -> Result<Vec<NetAddress>, ConfigError> {
        self.seeds
            .iter()
            .map(|seed| {
                std::net::SocketAddrV4::from_str(seed)
                    .map(NetAddress::from)
                    .map_err(|_| ConfigError::BadSeed { seed: seed.clone() })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buddyfs-node.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:9000\"\nseeds = [\"10.0.0.1:9000\"]\n").unwrap();

        let cfg = NodeConfig::load(&path).unwrap();
        assert_eq!(cfg.listen_addr.port(), 9000);
        assert_eq!(cfg.seed_addrs().unwrap(), vec![NetAddress::new(std::net::Ipv4Addr::new(10, 0, 0, 1), 9000)]);
    }

    #[test]
    fn rejects_unparseable_seed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buddyfs-node.toml");
        std::fs::write(&path, "listen_addr = \"0.0.0.0:9000\"\nseeds = [\"not-an-address\"]\n").unwrap();

        let cfg = NodeConfig::load(&path).unwrap();
        assert!(matches!(cfg.seed_addrs(), Err(ConfigError::BadSeed { .. })));
    }
}
