//! Configuration Storage
//!
//! Handles reading/writing the saved tunnel profile and locating the trust store.
//! Config location: ~/.sshtunnel on macOS/Linux, %APPDATA%\SSHTunnel on Windows

use std::path::PathBuf;
use tokio::fs;
use tokio::io::AsyncWriteExt;

use super::tunnel::{ConfigError, TunnelConfig};

/// Get the SSHTunnel configuration directory
/// Returns %APPDATA%\SSHTunnel on Windows, ~/.sshtunnel on macOS/Linux
pub fn config_dir() -> Result<PathBuf, ConfigError> {
    #[cfg(windows)]
    {
        if let Some(app_data) = dirs::config_dir() {
            return Ok(app_data.join("SSHTunnel"));
        }
        dirs::home_dir()
            .map(|home| home.join(".sshtunnel"))
            .ok_or(ConfigError::NoConfigDir)
    }

    #[cfg(not(windows))]
    {
        dirs::home_dir()
            .map(|home| home.join(".sshtunnel"))
            .ok_or(ConfigError::NoConfigDir)
    }
}

/// Get the trust store database path
pub fn known_hosts_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("known_hosts.redb"))
}

/// Get the saved tunnel profile path
pub fn tunnel_file() -> Result<PathBuf, ConfigError> {
    Ok(config_dir()?.join("tunnel.json"))
}

/// Storage for the saved tunnel profile
pub struct ConfigStorage {
    path: PathBuf,
}

impl ConfigStorage {
    /// Create a new storage manager with default path
    pub fn new() -> Result<Self, ConfigError> {
        Ok(Self {
            path: tunnel_file()?,
        })
    }

    /// Create storage manager with custom path (for testing)
    pub fn with_path(path: PathBuf) -> Self {
        Self { path }
    }

    /// Load the saved profile, `None` if nothing has been saved yet
    pub async fn load(&self) -> Result<Option<TunnelConfig>, ConfigError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ConfigError::Io(e)),
        }
    }

    /// Save the profile to disk
    ///
    /// The user-approved `trustedKey` is a one-shot decision and is never persisted here;
    /// once accepted it lives in the trust store.
    pub async fn save(&self, config: &TunnelConfig) -> Result<(), ConfigError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut config = config.clone();
        config.trusted_key = None;

        // Write to temp file first, then rename (atomic write)
        let temp_path = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(&config)?;

        let mut file = fs::File::create(&temp_path).await?;
        file.write_all(json.as_bytes()).await?;
        file.sync_all().await?;

        fs::rename(&temp_path, &self.path).await?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Err(e) =
                std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))
            {
                tracing::warn!("Failed to restrict tunnel profile permissions: {}", e);
            }
        }

        Ok(())
    }

    /// Get config file path
    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_load_nonexistent() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("tunnel.json"));

        assert!(storage.load().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let temp = tempdir().unwrap();
        let storage = ConfigStorage::with_path(temp.path().join("nested").join("tunnel.json"));

        let config = TunnelConfig::with_password("ssh.example.com", 2222, "alice", "secret")
            .via_proxy("10.0.0.1", 8080, "CONNECT [host_port] [protocol]\\r\\n\\r\\n")
            .with_trusted_key("AAAAC3NzaC1lZDI1NTE5");

        storage.save(&config).await.unwrap();

        let loaded = storage.load().await.unwrap().unwrap();
        assert_eq!(loaded.host, "ssh.example.com");
        assert_eq!(loaded.port, 2222);
        assert_eq!(loaded.proxy_port, Some(8080));
        assert!(loaded.trusted_key.is_none());
    }
}
