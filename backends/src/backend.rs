use async_trait::async_trait;
use offsite_core::{BackupArtifact, RemoteDirectory, Result};
use std::fmt;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendType {
    Dropbox,
    Ftp,
    Sftp,
    WebDav,
    Nextcloud,
}

impl BackendType {
    pub fn name(&self) -> &'static str {
        match self {
            BackendType::Dropbox => "Dropbox",
            BackendType::Ftp => "FTP",
            BackendType::Sftp => "SFTP",
            BackendType::WebDav => "WebDAV",
            BackendType::Nextcloud => "Nextcloud",
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            BackendType::Dropbox => "dropbox",
            BackendType::Ftp | BackendType::Sftp => "ftp",
            BackendType::WebDav => "webdav",
            BackendType::Nextcloud => "nextcloud",
        }
    }
}

impl fmt::Display for BackendType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One remote storage provider. Paths are relative to the configured remote base.
///
/// Implementations return errors freely; [`crate::Uploader`] absorbs them into
/// its sticky error flag.
#[async_trait]
pub trait Backend: RemoteDirectory + Send {
    fn backend_type(&self) -> BackendType;

    fn is_authenticated(&self) -> bool;

    /// Stores `artifact` directly in the remote base directory.
    async fn put_test_file(&mut self, artifact: &BackupArtifact) -> Result<()>;

    async fn delete_test_file(&mut self, name: &str) -> Result<()>;

    /// Stores `artifact` at `<base>/<category>/<file name>`, creating missing folders.
    async fn upload(&mut self, artifact: &BackupArtifact) -> Result<()>;

    /// Writes the object at `remote_path` to the local file `destination`.
    async fn download(&mut self, remote_path: &str, destination: &Path) -> Result<()>;

    /// Relative paths of every file under `folder`, recursing into subfolders.
    async fn list_files(&mut self, folder: &str) -> Result<Vec<String>>;

    async fn close(&mut self) -> Result<()>;
}
