use crate::backend::{Backend, BackendType};
use offsite_core::{
    BackupArtifact, Config, Error, ErrorKind, PruneReport, Result, RetentionPruner,
    sanitize_category,
};
use std::path::PathBuf;
use std::time::Duration;
use tracing::{error, info, warn};

/// What an [`Uploader`] operation returns instead of propagating a fault.
pub type Outcome<T> = std::result::Result<T, ErrorKind>;

#[derive(Debug, Clone)]
pub struct UploaderOptions {
    /// Log failures as one line instead of the full error.
    pub suppress_errors: bool,
    /// Pause between uploading and deleting the test file.
    pub test_file_delay: Duration,
    /// Downloads land in `<local_directory>/<category>/`.
    pub local_directory: PathBuf,
}

impl Default for UploaderOptions {
    fn default() -> Self {
        Self {
            suppress_errors: false,
            test_file_delay: Duration::from_secs(5),
            local_directory: PathBuf::from("."),
        }
    }
}

impl UploaderOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            suppress_errors: config.advanced.suppress_errors,
            test_file_delay: config.advanced.test_file_delay(),
            local_directory: config.storage.local_directory.clone(),
        }
    }
}

/// Result of a successful upload. A failed prune does not fail the upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadOutcome {
    pub prune: Outcome<PruneReport>,
}

/// One configured backend behind the non-throwing upload contract.
///
/// Every failure is logged and latches [`Uploader::is_error_while_uploading`];
/// the flag is never cleared.
pub struct Uploader {
    backend: Option<Box<dyn Backend>>,
    backend_type: BackendType,
    pruner: RetentionPruner,
    options: UploaderOptions,
    error_occurred: bool,
}

impl Uploader {
    pub fn new(backend: Box<dyn Backend>, pruner: RetentionPruner, options: UploaderOptions) -> Self {
        Self {
            backend_type: backend.backend_type(),
            backend: Some(backend),
            pruner,
            options,
            error_occurred: false,
        }
    }

    /// An uploader whose backend could not be set up. It reports the error
    /// flag from the start and every operation fails.
    pub fn unavailable(
        backend_type: BackendType,
        cause: Error,
        pruner: RetentionPruner,
        options: UploaderOptions,
    ) -> Self {
        let mut uploader = Self {
            backend: None,
            backend_type,
            pruner,
            options,
            error_occurred: false,
        };
        uploader.fail("connect", cause);
        uploader
    }

    pub fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    pub fn name(&self) -> &'static str {
        self.backend_type.name()
    }

    pub fn id(&self) -> &'static str {
        self.backend_type.id()
    }

    /// Uploads `artifact` to the remote base, waits, then deletes it again.
    pub async fn test(&mut self, artifact: &BackupArtifact) -> Outcome<()> {
        let delay = self.options.test_file_delay;
        let result: Result<()> = async {
            let backend = connected(&mut self.backend, self.backend_type)?;
            let name = artifact.file_name()?;
            backend.put_test_file(artifact).await?;
            tokio::time::sleep(delay).await;
            backend.delete_test_file(name).await
        }
        .await;

        match result {
            Ok(()) => {
                info!(backend = %self.backend_type, "Test file uploaded and removed");
                Ok(())
            }
            Err(e) => Err(self.fail("test", e)),
        }
    }

    /// Uploads `artifact` to `<base>/<category>/<file name>`, then prunes the category.
    pub async fn upload_file(&mut self, artifact: &BackupArtifact) -> Outcome<UploadOutcome> {
        let result: Result<()> = async {
            let backend = connected(&mut self.backend, self.backend_type)?;
            backend.upload(artifact).await
        }
        .await;

        if let Err(e) = result {
            return Err(self.fail("upload", e));
        }
        info!(
            backend = %self.backend_type,
            category = artifact.category(),
            length = artifact.len(),
            "Upload complete"
        );

        let prune = match self.backend.as_deref_mut() {
            Some(backend) => {
                self.pruner
                    .prune(backend, artifact.category(), self.backend_type.name())
                    .await
            }
            None => Err(Error::NotConnected(self.backend_type.name().to_string())),
        };

        let prune = prune.map_err(|e| {
            if self.options.suppress_errors {
                warn!(backend = %self.backend_type, category = artifact.category(), error = %e, "Pruning old backups failed");
            } else {
                warn!(backend = %self.backend_type, category = artifact.category(), error = ?e, "Pruning old backups failed");
            }
            e.kind()
        });

        Ok(UploadOutcome { prune })
    }

    /// Fetches `remote_path` (relative to the remote base) into
    /// `<local_directory>/<category>/`, creating the directory if needed.
    pub async fn download_file(&mut self, remote_path: &str, category: &str) -> Outcome<PathBuf> {
        let directory = self.options.local_directory.join(sanitize_category(category));
        let result: Result<PathBuf> = async {
            let backend = connected(&mut self.backend, self.backend_type)?;
            let name = remote_path
                .trim_end_matches('/')
                .rsplit('/')
                .next()
                .filter(|n| !n.is_empty())
                .ok_or_else(|| Error::Other(format!("Invalid remote path: {}", remote_path)))?;

            tokio::fs::create_dir_all(&directory).await?;
            let destination = directory.join(name);
            backend.download(remote_path, &destination).await?;
            Ok(destination)
        }
        .await;

        match result {
            Ok(destination) => {
                info!(backend = %self.backend_type, path = %destination.display(), "Downloaded");
                Ok(destination)
            }
            Err(e) => Err(self.fail("download", e)),
        }
    }

    /// Relative paths of every file below `folder`.
    pub async fn list_files(&mut self, folder: &str) -> Outcome<Vec<String>> {
        let result: Result<Vec<String>> = async {
            let backend = connected(&mut self.backend, self.backend_type)?;
            backend.list_files(folder).await
        }
        .await;

        result.map_err(|e| self.fail("list", e))
    }

    pub fn is_authenticated(&self) -> bool {
        self.backend.as_ref().is_some_and(|b| b.is_authenticated())
    }

    pub fn is_error_while_uploading(&self) -> bool {
        self.error_occurred
    }

    /// Releases the backend's connection. Safe to call repeatedly.
    pub async fn close(&mut self) {
        let result = match self.backend.as_deref_mut() {
            Some(backend) => backend.close().await,
            None => Ok(()),
        };
        if let Err(e) = result {
            self.fail("close", e);
        }
    }

    fn fail(&mut self, action: &str, error: Error) -> ErrorKind {
        self.error_occurred = true;
        let kind = error.kind();
        if self.options.suppress_errors {
            error!(backend = %self.backend_type, action, kind = ?kind, error = %error, "Operation failed");
        } else {
            error!(backend = %self.backend_type, action, kind = ?kind, error = ?error, "Operation failed");
        }
        kind
    }
}

fn connected(
    backend: &mut Option<Box<dyn Backend>>,
    backend_type: BackendType,
) -> Result<&mut (dyn Backend + 'static)> {
    backend
        .as_deref_mut()
        .ok_or_else(|| Error::NotConnected(backend_type.name().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use offsite_core::{BackupFilter, RemoteDirectory, RemoteFileEntry, RetentionPolicy};
    use std::path::Path;

    #[derive(Default)]
    struct ScriptedBackend {
        fail_upload: bool,
        fail_listing: bool,
        uploads: Vec<String>,
        closed: u32,
    }

    #[async_trait]
    impl RemoteDirectory for ScriptedBackend {
        async fn list_entries(&mut self, _category: &str) -> Result<Vec<RemoteFileEntry>> {
            if self.fail_listing {
                return Err(Error::http(500, "listing broke"));
            }
            Ok(Vec::new())
        }

        async fn delete_entry(&mut self, _category: &str, _name: &str) -> Result<()> {
            Ok(())
        }
    }

    #[async_trait]
    impl Backend for ScriptedBackend {
        fn backend_type(&self) -> BackendType {
            BackendType::WebDav
        }

        fn is_authenticated(&self) -> bool {
            self.closed == 0
        }

        async fn put_test_file(&mut self, _artifact: &BackupArtifact) -> Result<()> {
            Ok(())
        }

        async fn delete_test_file(&mut self, _name: &str) -> Result<()> {
            Ok(())
        }

        async fn upload(&mut self, artifact: &BackupArtifact) -> Result<()> {
            if self.fail_upload {
                return Err(Error::http(507, "Insufficient Storage"));
            }
            self.uploads.push(artifact.file_name()?.to_string());
            Ok(())
        }

        async fn download(&mut self, _remote_path: &str, destination: &Path) -> Result<()> {
            tokio::fs::write(destination, b"restored").await?;
            Ok(())
        }

        async fn list_files(&mut self, _folder: &str) -> Result<Vec<String>> {
            Ok(self.uploads.clone())
        }

        async fn close(&mut self) -> Result<()> {
            self.closed += 1;
            Ok(())
        }
    }

    fn uploader(backend: ScriptedBackend, local: &Path) -> Uploader {
        let pruner = RetentionPruner::new(RetentionPolicy::KeepLatest(2), BackupFilter::default());
        let options = UploaderOptions {
            test_file_delay: Duration::ZERO,
            local_directory: local.to_path_buf(),
            ..Default::default()
        };
        Uploader::new(Box::new(backend), pruner, options)
    }

    async fn artifact(dir: &Path) -> BackupArtifact {
        let path = dir.join("2024-03-01.zip");
        tokio::fs::write(&path, b"zip").await.unwrap();
        BackupArtifact::open(&path, "world").await.unwrap()
    }

    #[tokio::test]
    async fn test_flag_starts_clear_and_latches() {
        let dir = tempfile::tempdir().unwrap();
        let mut up = uploader(
            ScriptedBackend {
                fail_upload: true,
                ..Default::default()
            },
            dir.path(),
        );
        assert!(!up.is_error_while_uploading());

        let artifact = artifact(dir.path()).await;
        assert_eq!(up.upload_file(&artifact).await, Err(ErrorKind::Rejected));
        assert!(up.is_error_while_uploading());

        assert!(up.test(&artifact).await.is_ok());
        assert!(up.is_error_while_uploading());
    }

    #[tokio::test]
    async fn test_prune_failure_keeps_upload_successful() {
        let dir = tempfile::tempdir().unwrap();
        let mut up = uploader(
            ScriptedBackend {
                fail_listing: true,
                ..Default::default()
            },
            dir.path(),
        );

        let outcome = up.upload_file(&artifact(dir.path()).await).await.unwrap();
        assert_eq!(outcome.prune, Err(ErrorKind::Transient));
        assert!(!up.is_error_while_uploading());
    }

    #[tokio::test]
    async fn test_download_creates_category_directory() {
        let dir = tempfile::tempdir().unwrap();
        let mut up = uploader(ScriptedBackend::default(), dir.path());

        let path = up.download_file("world/2024-03-01.zip", "../world").await.unwrap();
        assert_eq!(path, dir.path().join("world").join("2024-03-01.zip"));
        assert_eq!(tokio::fs::read(&path).await.unwrap(), b"restored");
        assert!(up.download_file("", "world").await.is_err());
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_every_operation() {
        let dir = tempfile::tempdir().unwrap();
        let pruner = RetentionPruner::new(RetentionPolicy::KeepAll, BackupFilter::default());
        let mut up = Uploader::unavailable(
            BackendType::Dropbox,
            Error::Unauthorized("invalid_grant".into()),
            pruner,
            UploaderOptions::default(),
        );

        assert!(up.is_error_while_uploading());
        assert!(!up.is_authenticated());
        assert_eq!(
            up.upload_file(&artifact(dir.path()).await).await,
            Err(ErrorKind::Transient)
        );
        up.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut up = uploader(ScriptedBackend::default(), dir.path());

        assert!(up.is_authenticated());
        up.close().await;
        up.close().await;
        assert!(!up.is_authenticated());
        assert!(!up.is_error_while_uploading());
    }
}
