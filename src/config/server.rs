use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::pipeline::{DEFAULT_CONCURRENCY, DEFAULT_MAX_RETRIES, DEFAULT_RETRY_DELAY, RetryPolicy};

pub const PRESIGN_SECRET_FILE: &str = ".presign_secret";

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub data_dir: PathBuf,
    /// Public base URL for external access (e.g., "https://maps.example.com").
    /// Presigned storage URLs are built from it; defaults to `http://{host}:{port}`.
    pub public_base_url: Option<String>,
    pub bucket: String,
    /// Read from `data_dir/.presign_secret` when not set.
    pub presign_secret: Option<String>,
    pub presign_ttl_secs: u64,
    pub job: JobConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct JobConfig {
    pub max_retries: u32,
    pub retry_delay_secs: u64,
    pub concurrency: usize,
}

impl ServerConfig {
    /// Reads a TOML file; keys it leaves out keep their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)?;
        toml::from_str(&raw)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
    }

    pub fn socket_addr(&self) -> std::result::Result<SocketAddr, std::net::AddrParseError> {
        format!("{}:{}", self.host, self.port).parse()
    }

    #[must_use]
    pub fn db_path(&self) -> PathBuf {
        self.data_dir.join("mapvault.db")
    }

    #[must_use]
    pub fn storage_dir(&self) -> PathBuf {
        self.data_dir.join("objects")
    }

    #[must_use]
    pub fn presign_secret_path(&self) -> PathBuf {
        self.data_dir.join(PRESIGN_SECRET_FILE)
    }

    #[must_use]
    pub fn base_url(&self) -> String {
        match &self.public_base_url {
            Some(url) => url.trim_end_matches('/').to_string(),
            None => format!("http://{}:{}", self.host, self.port),
        }
    }

    /// The configured secret, or the one `admin init` wrote to the data dir.
    pub fn resolve_presign_secret(&self) -> Result<String> {
        if let Some(secret) = &self.presign_secret {
            return Ok(secret.clone());
        }
        let path = self.presign_secret_path();
        match fs::read_to_string(&path) {
            Ok(secret) if !secret.trim().is_empty() => Ok(secret.trim().to_string()),
            Ok(_) => Err(Error::Config(format!("{} is empty", path.display()))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(Error::Config(format!(
                "no presign secret configured and {} does not exist",
                path.display()
            ))),
            Err(e) => Err(e.into()),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            data_dir: PathBuf::from("./data"),
            public_base_url: None,
            bucket: "mapvault".to_string(),
            presign_secret: None,
            presign_ttl_secs: 3600,
            job: JobConfig::default(),
        }
    }
}

impl JobConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            delay: Duration::from_secs(self.retry_delay_secs),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay_secs: DEFAULT_RETRY_DELAY.as_secs(),
            concurrency: DEFAULT_CONCURRENCY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.socket_addr().unwrap().port(), 8080);
        assert_eq!(config.db_path(), PathBuf::from("./data/mapvault.db"));
        assert_eq!(config.storage_dir(), PathBuf::from("./data/objects"));
        assert_eq!(config.base_url(), "http://127.0.0.1:8080");
        assert_eq!(config.job.max_retries, 2);
        assert_eq!(config.job.retry_policy().delay, Duration::from_secs(60));
    }

    #[test]
    fn test_load_partial_toml() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapvault.toml");
        fs::write(
            &path,
            "port = 9000\npublic_base_url = \"https://maps.example.com/\"\n\n[job]\nconcurrency = 4\n",
        )
        .unwrap();

        let config = ServerConfig::load(&path).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.host, "127.0.0.1");
        assert_eq!(config.base_url(), "https://maps.example.com");
        assert_eq!(config.job.concurrency, 4);
        assert_eq!(config.job.max_retries, 2);
    }

    #[test]
    fn test_load_rejects_unknown_keys() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("mapvault.toml");
        fs::write(&path, "prot = 9000\n").unwrap();
        assert!(matches!(ServerConfig::load(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_presign_secret_resolution() {
        let temp = TempDir::new().unwrap();
        let mut config = ServerConfig {
            data_dir: temp.path().to_path_buf(),
            ..Default::default()
        };
        assert!(config.resolve_presign_secret().is_err());

        fs::write(config.presign_secret_path(), "abc123\n").unwrap();
        assert_eq!(config.resolve_presign_secret().unwrap(), "abc123");

        config.presign_secret = Some("explicit".to_string());
        assert_eq!(config.resolve_presign_secret().unwrap(), "explicit");
    }
}
