use crate::obfuscate::ObfuscatedSecret;
use crate::types::BackupFilter;
use crate::{Error, Result};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_DROPBOX_CHUNK_THRESHOLD: u64 = 150_000_000;
pub const DEFAULT_DROPBOX_CHUNK_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_NEXTCLOUD_CHUNK_SIZE: u64 = 10_000_000;

/// Resolved configuration consumed by the upload subsystem.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub advanced: AdvancedConfig,
    pub dropbox: Option<DropboxConfig>,
    pub ftp: Option<FtpConfig>,
    pub webdav: Option<WebDavConfig>,
    pub nextcloud: Option<NextcloudConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub remote_directory: String,
    pub local_directory: PathBuf,
    /// `-1` keeps every backup.
    pub keep_count: i64,
    pub backup_extensions: Vec<String>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            remote_directory: "backups".to_string(),
            local_directory: PathBuf::from("."),
            keep_count: -1,
            backup_extensions: vec!["zip".to_string()],
        }
    }
}

impl StorageConfig {
    pub fn retention(&self) -> Result<RetentionPolicy> {
        RetentionPolicy::from_keep_count(self.keep_count)
    }

    pub fn backup_filter(&self) -> BackupFilter {
        BackupFilter::new(&self.backup_extensions)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdvancedConfig {
    /// Log failures as a single line instead of the full error chain.
    pub suppress_errors: bool,
    pub test_file_delay_secs: u64,
}

impl Default for AdvancedConfig {
    fn default() -> Self {
        Self {
            suppress_errors: false,
            test_file_delay_secs: 5,
        }
    }
}

impl AdvancedConfig {
    pub fn test_file_delay(&self) -> Duration {
        Duration::from_secs(self.test_file_delay_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DropboxConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub client_id: String,
    pub client_secret: ObfuscatedSecret,
    pub refresh_token: ObfuscatedSecret,
    #[serde(default = "default_dropbox_threshold")]
    pub chunk_threshold: u64,
    #[serde(default = "default_dropbox_chunk_size")]
    pub chunk_size: u64,
    #[serde(default = "default_token_url")]
    pub token_url: String,
    #[serde(default = "default_api_url")]
    pub api_url: String,
    #[serde(default = "default_content_url")]
    pub content_url: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct FtpConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub hostname: String,
    pub port: Option<u16>,
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub sftp: bool,
    /// Private key path for SFTP public-key authentication.
    pub public_key: Option<PathBuf>,
    pub passphrase: Option<String>,
    #[serde(default)]
    pub base_directory: String,
}

impl FtpConfig {
    pub fn port(&self) -> u16 {
        self.port.unwrap_or(if self.sftp { 22 } else { 21 })
    }

    /// `base_directory/remote_directory`, or just the remote directory.
    pub fn remote_base(&self, remote_directory: &str) -> String {
        if self.base_directory.trim().is_empty() {
            remote_directory.to_string()
        } else {
            format!(
                "{}/{}",
                self.base_directory.trim_end_matches('/'),
                remote_directory
            )
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct WebDavConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    /// Full DAV URL of the account root.
    pub hostname: String,
    pub username: String,
    pub password: String,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct NextcloudConfig {
    #[serde(default = "enabled")]
    pub enabled: bool,
    pub hostname: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_nextcloud_chunk_size")]
    pub chunk_size: u64,
}

impl fmt::Debug for FtpConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FtpConfig")
            .field("enabled", &self.enabled)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("sftp", &self.sftp)
            .field("public_key", &self.public_key)
            .field("base_directory", &self.base_directory)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for WebDavConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebDavConfig")
            .field("enabled", &self.enabled)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl fmt::Debug for NextcloudConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NextcloudConfig")
            .field("enabled", &self.enabled)
            .field("hostname", &self.hostname)
            .field("username", &self.username)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}

fn enabled() -> bool {
    true
}

fn default_dropbox_threshold() -> u64 {
    DEFAULT_DROPBOX_CHUNK_THRESHOLD
}

fn default_dropbox_chunk_size() -> u64 {
    DEFAULT_DROPBOX_CHUNK_SIZE
}

fn default_nextcloud_chunk_size() -> u64 {
    DEFAULT_NEXTCLOUD_CHUNK_SIZE
}

fn default_token_url() -> String {
    "https://api.dropbox.com/oauth2/token".to_string()
}

fn default_api_url() -> String {
    "https://api.dropboxapi.com/2".to_string()
}

fn default_content_url() -> String {
    "https://content.dropboxapi.com/2".to_string()
}

impl Config {
    /// `<config_dir>/offsite/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        ProjectDirs::from("", "", "offsite").map(|dirs| dirs.config_dir().join("config.toml"))
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = tokio::fs::read_to_string(path).await.map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::parse(&raw)?;
        tracing::debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(raw).map_err(|e| Error::Config(format!("Invalid config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.storage.retention()?;

        if let Some(dropbox) = self.dropbox.as_ref().filter(|d| d.enabled) {
            if dropbox.chunk_size == 0 {
                return Err(Error::Config("dropbox.chunk_size must be positive".to_string()));
            }
            if dropbox.chunk_threshold < dropbox.chunk_size {
                return Err(Error::Config(
                    "dropbox.chunk_threshold must not be smaller than dropbox.chunk_size"
                        .to_string(),
                ));
            }
        }

        if let Some(ftp) = self.ftp.as_ref().filter(|f| f.enabled) {
            require_host("ftp", &ftp.hostname)?;
        }

        if let Some(webdav) = self.webdav.as_ref().filter(|w| w.enabled) {
            require_host("webdav", &webdav.hostname)?;
        }

        if let Some(nextcloud) = self.nextcloud.as_ref().filter(|n| n.enabled) {
            require_host("nextcloud", &nextcloud.hostname)?;
            if nextcloud.chunk_size == 0 {
                return Err(Error::Config("nextcloud.chunk_size must be positive".to_string()));
            }
        }

        Ok(())
    }
}

fn require_host(section: &str, hostname: &str) -> Result<()> {
    if hostname.trim().is_empty() {
        return Err(Error::Config(format!("{}.hostname is required", section)));
    }
    Ok(())
}

/// How many backups to keep per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetentionPolicy {
    KeepAll,
    KeepLatest(usize),
}

impl RetentionPolicy {
    pub fn from_keep_count(keep_count: i64) -> Result<Self> {
        match keep_count {
            -1 => Ok(RetentionPolicy::KeepAll),
            n if n >= 0 => Ok(RetentionPolicy::KeepLatest(n as usize)),
            n => Err(Error::Config(format!(
                "keep_count must be -1 or non-negative, got {}",
                n
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retention_from_keep_count() {
        assert_eq!(RetentionPolicy::from_keep_count(-1).unwrap(), RetentionPolicy::KeepAll);
        assert_eq!(RetentionPolicy::from_keep_count(0).unwrap(), RetentionPolicy::KeepLatest(0));
        assert_eq!(RetentionPolicy::from_keep_count(7).unwrap(), RetentionPolicy::KeepLatest(7));
        assert!(RetentionPolicy::from_keep_count(-2).is_err());
    }

    #[test]
    fn test_parse_full_config() {
        let refresh = crate::obfuscate::obfuscate("refresh").unwrap();
        let secret = crate::obfuscate::obfuscate("app-secret").unwrap();
        let raw = format!(
            r#"
            [storage]
            remote_directory = "mc-backups"
            keep_count = 3

            [advanced]
            suppress_errors = true

            [dropbox]
            client_id = "app"
            client_secret = "{secret}"
            refresh_token = "{refresh}"

            [ftp]
            hostname = "ftp.example.com"
            username = "me"
            password = "pw"
            base_directory = "/srv/"

            [nextcloud]
            hostname = "https://cloud.example.com/remote.php/dav/files/me"
            username = "me"
            password = "pw"
            "#
        );

        let config = Config::parse(&raw).unwrap();
        assert_eq!(config.storage.retention().unwrap(), RetentionPolicy::KeepLatest(3));
        assert!(config.advanced.suppress_errors);
        assert_eq!(config.advanced.test_file_delay_secs, 5);

        let dropbox = config.dropbox.unwrap();
        assert_eq!(dropbox.chunk_threshold, DEFAULT_DROPBOX_CHUNK_THRESHOLD);
        assert_eq!(dropbox.chunk_size, DEFAULT_DROPBOX_CHUNK_SIZE);
        assert_eq!(dropbox.refresh_token.reveal().unwrap(), "refresh");

        let ftp = config.ftp.unwrap();
        assert_eq!(ftp.port(), 21);
        assert_eq!(ftp.remote_base("mc-backups"), "/srv/mc-backups");

        assert_eq!(config.nextcloud.unwrap().chunk_size, DEFAULT_NEXTCLOUD_CHUNK_SIZE);
        assert!(config.webdav.is_none());
    }

    #[test]
    fn test_debug_output_hides_passwords() {
        let config = Config::parse(
            r#"
            [ftp]
            hostname = "ftp.example.com"
            username = "me"
            password = "ftp-hunter2"
            passphrase = "key-hunter2"

            [webdav]
            hostname = "https://dav.example.com/files/me"
            username = "me"
            password = "dav-hunter2"

            [nextcloud]
            hostname = "https://cloud.example.com"
            username = "me"
            password = "cloud-hunter2"
            "#,
        )
        .unwrap();

        let rendered = format!("{:?}", config);
        assert!(rendered.contains("ftp.example.com"));
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(Config::parse("[storage]\nkeep_count = -5\n").is_err());
        assert!(Config::parse("[ftp]\nhostname = \"\"\nusername = \"u\"\n").is_err());
        assert!(Config::parse("[ftp]\nenabled = false\nhostname = \"\"\nusername = \"u\"\n").is_ok());
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        tokio::fs::write(&path, "[storage]\nkeep_count = 2\n").await.unwrap();

        let config = Config::load(&path).await.unwrap();
        assert_eq!(config.storage.keep_count, 2);
        assert_eq!(config.storage.backup_filter(), BackupFilter::default());

        assert!(Config::load(dir.path().join("missing.toml")).await.is_err());
    }
}
