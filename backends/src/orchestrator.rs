use crate::backend::{Backend, BackendType};
use crate::dropbox::DropboxBackend;
use crate::ftp::FtpBackend;
use crate::nextcloud;
use crate::uploader::{Outcome, Uploader, UploaderOptions};
use crate::webdav::WebDavBackend;
use offsite_core::{BackupArtifact, Config, ErrorKind, Result, RetentionPruner};
use std::path::PathBuf;
use tracing::{info, warn};

/// Per-backend result of an orchestrated call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub backend: BackendType,
    pub success: bool,
    pub error: Option<ErrorKind>,
}

impl UploadReport {
    fn from_outcome<T>(backend: BackendType, outcome: &Outcome<T>) -> Self {
        Self {
            backend,
            success: outcome.is_ok(),
            error: outcome.as_ref().err().copied(),
        }
    }
}

/// Runs every configured [`Uploader`] in turn and collects their results.
pub struct UploadOrchestrator {
    uploaders: Vec<Uploader>,
}

impl UploadOrchestrator {
    pub fn new(uploaders: Vec<Uploader>) -> Self {
        Self { uploaders }
    }

    /// Connects one uploader per enabled method. A method that fails to
    /// connect is kept with its error flag set.
    pub async fn from_config(config: &Config) -> Result<Self> {
        let policy = config.storage.retention()?;
        let filter = config.storage.backup_filter();
        let options = UploaderOptions::from_config(config);
        let remote = config.storage.remote_directory.as_str();

        let assemble = |backend_type: BackendType, connected: Result<Box<dyn Backend>>| {
            let pruner = RetentionPruner::new(policy, filter.clone());
            match connected {
                Ok(backend) => Uploader::new(backend, pruner, options.clone()),
                Err(e) => Uploader::unavailable(backend_type, e, pruner, options.clone()),
            }
        };

        let mut uploaders = Vec::new();

        if let Some(dropbox) = config.dropbox.as_ref().filter(|c| c.enabled) {
            let connected = DropboxBackend::connect(dropbox, remote).await;
            uploaders.push(assemble(BackendType::Dropbox, boxed(connected)));
        }

        if let Some(ftp) = config.ftp.as_ref().filter(|c| c.enabled) {
            let backend_type = if ftp.sftp { BackendType::Sftp } else { BackendType::Ftp };
            let connected = FtpBackend::connect(ftp, remote).await;
            uploaders.push(assemble(backend_type, boxed(connected)));
        }

        if let Some(webdav) = config.webdav.as_ref().filter(|c| c.enabled) {
            let connected = WebDavBackend::connect(webdav, remote);
            uploaders.push(assemble(BackendType::WebDav, boxed(connected)));
        }

        if let Some(cloud) = config.nextcloud.as_ref().filter(|c| c.enabled) {
            let connected = nextcloud::connect(cloud, remote).await;
            uploaders.push(assemble(BackendType::Nextcloud, boxed(connected)));
        }

        if uploaders.is_empty() {
            warn!("No backup method is enabled");
        }
        Ok(Self::new(uploaders))
    }

    pub fn uploaders(&self) -> &[Uploader] {
        &self.uploaders
    }

    pub fn is_empty(&self) -> bool {
        self.uploaders.is_empty()
    }

    pub async fn test_all(&mut self, artifact: &BackupArtifact) -> Vec<UploadReport> {
        let mut reports = Vec::with_capacity(self.uploaders.len());
        for uploader in &mut self.uploaders {
            info!(backend = uploader.name(), "Testing");
            let outcome = uploader.test(artifact).await;
            reports.push(UploadReport::from_outcome(uploader.backend_type(), &outcome));
        }
        reports
    }

    /// Uploads `artifact` through each backend, one after another.
    pub async fn upload_all(&mut self, artifact: &BackupArtifact) -> Vec<UploadReport> {
        let mut reports = Vec::with_capacity(self.uploaders.len());
        for uploader in &mut self.uploaders {
            info!(backend = uploader.name(), file = %artifact.path().display(), "Uploading");
            let outcome = uploader.upload_file(artifact).await;
            reports.push(UploadReport::from_outcome(uploader.backend_type(), &outcome));
        }
        reports
    }

    /// Downloads from the first backend that has the file.
    pub async fn download(&mut self, remote_path: &str, category: &str) -> Option<PathBuf> {
        for uploader in &mut self.uploaders {
            if let Ok(path) = uploader.download_file(remote_path, category).await {
                return Some(path);
            }
        }
        None
    }

    pub async fn list_all(&mut self, folder: &str) -> Vec<(BackendType, Outcome<Vec<String>>)> {
        let mut listings = Vec::with_capacity(self.uploaders.len());
        for uploader in &mut self.uploaders {
            listings.push((uploader.backend_type(), uploader.list_files(folder).await));
        }
        listings
    }

    pub async fn close_all(&mut self) {
        for uploader in &mut self.uploaders {
            uploader.close().await;
        }
    }

    /// True if any uploader has latched its error flag.
    pub fn has_errors(&self) -> bool {
        self.uploaders.iter().any(Uploader::is_error_while_uploading)
    }
}

fn boxed<B: Backend + 'static>(connected: Result<B>) -> Result<Box<dyn Backend>> {
    connected.map(|b| Box::new(b) as Box<dyn Backend>)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_config_builds_no_uploaders() {
        let orchestrator = UploadOrchestrator::from_config(&Config::default()).await.unwrap();
        assert!(orchestrator.is_empty());
        assert!(!orchestrator.has_errors());
    }

    #[tokio::test]
    async fn test_disabled_methods_are_skipped() {
        let config = Config::parse(
            r#"
            [webdav]
            enabled = false
            hostname = "https://dav.example.com/files/me"
            username = "me"
            password = "pw"
            "#,
        )
        .unwrap();
        let orchestrator = UploadOrchestrator::from_config(&config).await.unwrap();
        assert!(orchestrator.is_empty());
    }

    #[tokio::test]
    async fn test_webdav_uploader_is_built_without_network() {
        let config = Config::parse(
            r#"
            [webdav]
            hostname = "https://dav.example.com/files/me"
            username = "me"
            password = "pw"
            "#,
        )
        .unwrap();
        let orchestrator = UploadOrchestrator::from_config(&config).await.unwrap();
        assert_eq!(orchestrator.uploaders().len(), 1);
        assert_eq!(orchestrator.uploaders()[0].backend_type(), BackendType::WebDav);
        assert!(!orchestrator.has_errors());
    }
}
