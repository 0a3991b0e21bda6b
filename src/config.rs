//! Server configuration, read from `CHUNKDROP_*` environment variables.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

use crate::hash::HashAlgorithm;

const MEG: u64 = 1024 * 1024;

#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// How long a session may go without receiving a chunk.
    pub inactivity_timeout: Duration,
    /// Largest accepted single chunk body, in bytes.
    pub max_chunk_size: u64,
    pub hash_algorithm: HashAlgorithm,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            inactivity_timeout: Duration::from_secs(60),
            max_chunk_size: 16 * MEG,
            hash_algorithm: HashAlgorithm::Sha1,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub listen_addr: SocketAddr,
    /// Repository root; every client directory is resolved below it.
    pub root: PathBuf,
    pub upload: UploadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3024)),
            root: PathBuf::from("open-dir"),
            upload: UploadConfig::default(),
        }
    }
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from `lookup`, falling back to defaults for unset keys.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(addr) = lookup("CHUNKDROP_ADDR") {
            config.listen_addr = addr
                .parse()
                .with_context(|| format!("invalid CHUNKDROP_ADDR `{addr}`"))?;
        }
        if let Some(root) = lookup("CHUNKDROP_ROOT") {
            config.root = PathBuf::from(root);
        }
        if let Some(secs) = lookup("CHUNKDROP_UPLOAD_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("invalid CHUNKDROP_UPLOAD_TIMEOUT_SECS `{secs}`"))?;
            anyhow::ensure!(secs > 0, "CHUNKDROP_UPLOAD_TIMEOUT_SECS must be positive");
            config.upload.inactivity_timeout = Duration::from_secs(secs);
        }
        if let Some(bytes) = lookup("CHUNKDROP_MAX_CHUNK_BYTES") {
            config.upload.max_chunk_size = bytes
                .parse()
                .with_context(|| format!("invalid CHUNKDROP_MAX_CHUNK_BYTES `{bytes}`"))?;
        }
        if let Some(algorithm) = lookup("CHUNKDROP_HASH") {
            config.upload.hash_algorithm = algorithm
                .parse()
                .map_err(anyhow::Error::msg)
                .context("invalid CHUNKDROP_HASH")?;
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| vars.get(key).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.listen_addr.port(), 3024);
        assert_eq!(config.root, PathBuf::from("open-dir"));
        assert_eq!(config.upload.inactivity_timeout, Duration::from_secs(60));
        assert_eq!(config.upload.hash_algorithm, HashAlgorithm::Sha1);
    }

    #[test]
    fn reads_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("CHUNKDROP_ADDR", "127.0.0.1:8080"),
            ("CHUNKDROP_ROOT", "/srv/files"),
            ("CHUNKDROP_UPLOAD_TIMEOUT_SECS", "5"),
            ("CHUNKDROP_MAX_CHUNK_BYTES", "1024"),
            ("CHUNKDROP_HASH", "blake3"),
        ]))
        .unwrap();
        assert_eq!(config.listen_addr, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(config.root, PathBuf::from("/srv/files"));
        assert_eq!(config.upload.inactivity_timeout, Duration::from_secs(5));
        assert_eq!(config.upload.max_chunk_size, 1024);
        assert_eq!(config.upload.hash_algorithm, HashAlgorithm::Blake3);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(Config::from_lookup(lookup(&[("CHUNKDROP_ADDR", "nowhere")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CHUNKDROP_UPLOAD_TIMEOUT_SECS", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("CHUNKDROP_HASH", "md5")])).is_err());
    }
}
