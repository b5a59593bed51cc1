//! Vault configuration
//!
//! Stored as a plain JSON file next to the database. Nothing here is
//! sensitive; cost parameters and timeouts only.

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::cache::CacheConfig;
use crate::crypto::{HashParameters, KeyDerivationParams};
use crate::error::{ConfigurationError, Result};

const CONFIG_FILE: &str = "config.json";

/// Vault configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VaultConfig {
    /// Config file version
    pub version: u32,
    /// Cost parameters for new and rehashed verification records
    pub kdf: KeyDerivationParams,
    /// Idle time after which a session expires
    pub session_timeout_secs: u64,
    pub cache: CacheConfig,
    /// Re-derive records stored under other parameters on successful login
    pub rehash_on_login: bool,
    /// Database location; the platform data directory when unset
    pub database_path: Option<PathBuf>,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            version: 1,
            kdf: KeyDerivationParams::default(),
            session_timeout_secs: 900,
            cache: CacheConfig::default(),
            rehash_on_login: true,
            database_path: None,
        }
    }
}

impl VaultConfig {
    /// Cheapest settings the vault accepts, for tests and tooling
    pub fn minimal() -> Self {
        Self {
            kdf: KeyDerivationParams::minimum(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> std::result::Result<(), ConfigurationError> {
        self.kdf
            .validate()
            .map_err(|e| ConfigurationError::Invalid(e.to_string()))?;

        if self.session_timeout_secs == 0 {
            return Err(ConfigurationError::Invalid(
                "session timeout must be at least one second".to_string(),
            ));
        }
        if self.cache.capacity > 0 && self.cache.ttl.is_zero() {
            return Err(ConfigurationError::Invalid(
                "cache TTL must be positive when the cache is enabled".to_string(),
            ));
        }
        Ok(())
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_secs(self.session_timeout_secs)
    }

    pub fn cache_config(&self) -> CacheConfig {
        self.cache
    }

    /// Parameters new verification records are written with
    pub fn hash_parameters(&self) -> HashParameters {
        HashParameters::new(self.kdf)
    }
}

/// Loads and saves [`VaultConfig`]
pub struct ConfigManager {
    config_file: PathBuf,
    config: VaultConfig,
}

impl ConfigManager {
    /// Load the config in `dir`, falling back to defaults when no file exists
    pub fn load(dir: &Path) -> Result<Self> {
        let config_file = dir.join(CONFIG_FILE);
        let config = Self::load_from_file(&config_file)?;
        Ok(Self {
            config_file,
            config,
        })
    }

    /// Platform config directory, e.g. `~/.config/secret-vault` on Linux
    pub fn default_dir() -> Option<PathBuf> {
        ProjectDirs::from("com", "symbia-labs", "secret-vault")
            .map(|dirs| dirs.config_dir().to_path_buf())
    }

    fn load_from_file(path: &Path) -> Result<VaultConfig> {
        if !path.exists() {
            debug!("No config file found, using defaults");
            return Ok(VaultConfig::default());
        }

        let contents = std::fs::read_to_string(path)?;
        let config: VaultConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        debug!("Loaded config from {:?}", path);
        Ok(config)
    }

    /// Write the config atomically
    pub async fn save(&self) -> Result<()> {
        self.config.validate()?;
        let contents = serde_json::to_string_pretty(&self.config)?;

        if let Some(parent) = self.config_file.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let temp_path = self.config_file.with_extension("tmp");
        tokio::fs::write(&temp_path, &contents).await?;
        tokio::fs::rename(&temp_path, &self.config_file).await?;

        debug!("Saved config to {:?}", self.config_file);
        Ok(())
    }

    pub fn get(&self) -> &VaultConfig {
        &self.config
    }

    pub fn get_mut(&mut self) -> &mut VaultConfig {
        &mut self.config
    }

    pub fn path(&self) -> &Path {
        &self.config_file
    }

    /// Replace the config and save
    pub async fn update(&mut self, config: VaultConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        self.save().await
    }

    /// Back to defaults; removes the config file
    pub async fn reset(&mut self) -> Result<()> {
        self.config = VaultConfig::default();
        if self.config_file.exists() {
            tokio::fs::remove_file(&self.config_file).await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_config_default() {
        let temp_dir = TempDir::new().unwrap();
        let manager = ConfigManager::load(temp_dir.path()).unwrap();

        let config = manager.get();
        assert_eq!(config.session_timeout_secs, 900);
        assert_eq!(config.cache.capacity, 256);
        assert!(config.rehash_on_login);
        assert!(config.validate().is_ok());
    }

    #[tokio::test]
    async fn test_config_persistence() {
        let temp_dir = TempDir::new().unwrap();

        {
            let mut manager = ConfigManager::load(temp_dir.path()).unwrap();
            manager.get_mut().session_timeout_secs = 60;
            manager.get_mut().cache.capacity = 0;
            manager.get_mut().database_path = Some(temp_dir.path().join("vault.db"));
            manager.save().await.unwrap();
        }

        {
            let manager = ConfigManager::load(temp_dir.path()).unwrap();
            assert_eq!(manager.get().session_timeout_secs, 60);
            assert_eq!(manager.get().cache.capacity, 0);
            assert_eq!(
                manager.get().database_path,
                Some(temp_dir.path().join("vault.db"))
            );
        }
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE),
            r#"{ "sessionTimeoutSecs": 120, "cache": { "capacity": 8, "ttlSecs": 30 } }"#,
        )
        .unwrap();

        let manager = ConfigManager::load(temp_dir.path()).unwrap();
        assert_eq!(manager.get().session_timeout(), Duration::from_secs(120));
        assert_eq!(manager.get().cache.ttl, Duration::from_secs(30));
        assert_eq!(manager.get().kdf, KeyDerivationParams::default());
    }

    #[tokio::test]
    async fn test_partial_cache_section_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE),
            r#"{ "cache": { "capacity": 8 } }"#,
        )
        .unwrap();

        let manager = ConfigManager::load(temp_dir.path()).unwrap();
        assert_eq!(manager.get().cache.capacity, 8);
        assert_eq!(manager.get().cache.ttl, CacheConfig::default().ttl);
    }

    #[tokio::test]
    async fn test_invalid_file_rejected() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            temp_dir.path().join(CONFIG_FILE),
            r#"{ "kdf": { "memoryCost": 16, "timeCost": 1, "parallelism": 1 } }"#,
        )
        .unwrap();

        assert!(ConfigManager::load(temp_dir.path()).is_err());
    }

    #[tokio::test]
    async fn test_update_refuses_invalid_config() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::load(temp_dir.path()).unwrap();

        let bad = VaultConfig {
            session_timeout_secs: 0,
            ..VaultConfig::default()
        };
        assert!(manager.update(bad).await.is_err());
        assert_eq!(manager.get().session_timeout_secs, 900);
    }

    #[tokio::test]
    async fn test_reset_removes_file() {
        let temp_dir = TempDir::new().unwrap();
        let mut manager = ConfigManager::load(temp_dir.path()).unwrap();
        manager.update(VaultConfig::minimal()).await.unwrap();
        assert!(manager.path().exists());

        manager.reset().await.unwrap();

        assert!(!manager.path().exists());
        assert_eq!(manager.get(), &VaultConfig::default());
    }
}
