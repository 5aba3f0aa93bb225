use crate::backend::{Backend, BackendType};
use crate::sftp::SftpTransport;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use offsite_core::config::FtpConfig;
use offsite_core::{BackupArtifact, Error, RemoteDirectory, RemoteFileEntry, Result};
use std::io::{Read, Write};
use std::path::Path;
use suppaftp::types::FileType;
use suppaftp::{FtpError, FtpStream, Mode};
use tracing::{debug, info, warn};

/// A connection-oriented file transfer session with a current working directory.
///
/// Calls block until the server answers.
pub trait FileTransport: Send {
    fn working_directory(&mut self) -> Result<String>;

    /// Enters `path`. Returns `false` if the server refused because it does not exist.
    fn change_directory(&mut self, path: &str) -> Result<bool>;

    fn make_directory(&mut self, name: &str) -> Result<()>;

    fn store(&mut self, name: &str, reader: &mut dyn Read) -> Result<()>;

    fn retrieve(&mut self, name: &str, writer: &mut dyn Write) -> Result<()>;

    fn remove(&mut self, name: &str) -> Result<()>;

    /// Entries of the current working directory, without `.` and `..`.
    fn list(&mut self) -> Result<Vec<RemoteFileEntry>>;

    fn is_connected(&self) -> bool;

    fn disconnect(&mut self) -> Result<()>;
}

fn ftp_error(error: FtpError) -> Error {
    match error {
        FtpError::ConnectionError(e) => Error::Network(format!("FTP connection: {}", e)),
        other => Error::Backend(format!("FTP: {}", other)),
    }
}

/// Plain FTP in passive binary mode.
pub struct FtpTransport {
    stream: Option<FtpStream>,
}

impl FtpTransport {
    pub fn connect(hostname: &str, port: u16, username: &str, password: &str) -> Result<Self> {
        let mut stream = FtpStream::connect((hostname, port)).map_err(ftp_error)?;
        stream
            .login(username, password)
            .map_err(|e| Error::Unauthorized(format!("FTP login as {} failed: {}", username, e)))?;
        stream.set_mode(Mode::Passive);
        stream.transfer_type(FileType::Binary).map_err(ftp_error)?;

        debug!(hostname, port, "FTP session established");
        Ok(Self {
            stream: Some(stream),
        })
    }

    fn stream(&mut self) -> Result<&mut FtpStream> {
        self.stream
            .as_mut()
            .ok_or_else(|| Error::NotConnected("FTP server".to_string()))
    }
}

impl FileTransport for FtpTransport {
    fn working_directory(&mut self) -> Result<String> {
        self.stream()?.pwd().map_err(ftp_error)
    }

    fn change_directory(&mut self, path: &str) -> Result<bool> {
        match self.stream()?.cwd(path) {
            Ok(()) => Ok(true),
            Err(FtpError::UnexpectedResponse(_)) => Ok(false),
            Err(e) => Err(ftp_error(e)),
        }
    }

    fn make_directory(&mut self, name: &str) -> Result<()> {
        self.stream()?.mkdir(name).map_err(ftp_error)
    }

    fn store(&mut self, name: &str, mut reader: &mut dyn Read) -> Result<()> {
        let written = self.stream()?.put_file(name, &mut reader).map_err(ftp_error)?;
        debug!(name, written, "Stored file");
        Ok(())
    }

    fn retrieve(&mut self, name: &str, writer: &mut dyn Write) -> Result<()> {
        let mut buffer = self.stream()?.retr_as_buffer(name).map_err(ftp_error)?;
        std::io::copy(&mut buffer, writer)?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        self.stream()?.rm(name).map_err(ftp_error)
    }

    /// Prefers `MLSD`, whose timestamps carry seconds and a year. Servers that
    /// refuse it are listed with `LIST`.
    fn list(&mut self) -> Result<Vec<RemoteFileEntry>> {
        let stream = self.stream()?;
        match stream.mlsd(None) {
            Ok(lines) => Ok(lines.iter().filter_map(|line| parse_mlsd_line(line)).collect()),
            Err(FtpError::UnexpectedResponse(response)) => {
                debug!(status = ?response.status, "MLSD refused, falling back to LIST");
                let lines = stream.list(None).map_err(ftp_error)?;
                Ok(lines.iter().filter_map(|line| parse_list_line(line)).collect())
            }
            Err(e) => Err(ftp_error(e)),
        }
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn disconnect(&mut self) -> Result<()> {
        if let Some(mut stream) = self.stream.take() {
            stream.quit().map_err(ftp_error)?;
        }
        Ok(())
    }
}

/// Parses one `MLSD` fact line, e.g. `type=file;modify=20240301101530; a.zip`.
pub fn parse_mlsd_line(line: &str) -> Option<RemoteFileEntry> {
    let facts = line.split_once(' ').map_or(line, |(facts, _)| facts).to_ascii_lowercase();
    if facts.contains("type=cdir") || facts.contains("type=pdir") {
        return None;
    }

    let file = match suppaftp::list::File::from_mlsx_line(line) {
        Ok(file) => file,
        Err(e) => {
            debug!(line, error = ?e, "Skipping unparseable MLSD line");
            return None;
        }
    };
    entry_from(file)
}

/// Parses one line of `LIST` output (UNIX or DOS style).
pub fn parse_list_line(line: &str) -> Option<RemoteFileEntry> {
    let file = match line.parse::<suppaftp::list::File>() {
        Ok(file) => file,
        Err(e) => {
            debug!(line, error = ?e, "Skipping unparseable LIST line");
            return None;
        }
    };
    entry_from(file)
}

fn entry_from(file: suppaftp::list::File) -> Option<RemoteFileEntry> {
    let name = file.name();
    if name == "." || name == ".." {
        return None;
    }

    Some(RemoteFileEntry {
        name: name.to_string(),
        modified: Some(DateTime::<Utc>::from(file.modified())),
        is_dir: file.is_directory(),
    })
}

/// FTP or SFTP storage. Every operation starts from the directory the session
/// was opened in, then walks to its folder, creating missing segments.
pub struct FtpBackend {
    transport: Box<dyn FileTransport>,
    backend_type: BackendType,
    initial_directory: String,
    remote_base: String,
}

impl FtpBackend {
    /// Connects over FTP or SFTP, depending on `config.sftp`.
    pub async fn connect(config: &FtpConfig, remote_directory: &str) -> Result<Self> {
        let (transport, backend_type): (Box<dyn FileTransport>, _) = if config.sftp {
            let transport = SftpTransport::connect(
                &config.hostname,
                config.port(),
                &config.username,
                &config.password,
                config.public_key.as_deref(),
                config.passphrase.as_deref(),
            )?;
            (Box::new(transport), BackendType::Sftp)
        } else {
            let transport = FtpTransport::connect(
                &config.hostname,
                config.port(),
                &config.username,
                &config.password,
            )?;
            (Box::new(transport), BackendType::Ftp)
        };

        let backend = Self::with_transport(
            transport,
            backend_type,
            &config.remote_base(remote_directory),
        )?;
        info!(
            backend = %backend_type,
            hostname = %config.hostname,
            initial_directory = %backend.initial_directory,
            "Connected"
        );
        Ok(backend)
    }

    /// Wraps an open transport and records its current directory as the anchor.
    pub fn with_transport(
        mut transport: Box<dyn FileTransport>,
        backend_type: BackendType,
        remote_base: &str,
    ) -> Result<Self> {
        let initial_directory = transport.working_directory()?;
        Ok(Self {
            transport,
            backend_type,
            initial_directory,
            remote_base: remote_base.trim_end_matches('/').to_string(),
        })
    }

    fn folder(&self, sub: &str) -> String {
        let sub = sub.trim_matches('/');
        if sub.is_empty() {
            self.remote_base.clone()
        } else if self.remote_base.is_empty() {
            sub.to_string()
        } else {
            format!("{}/{}", self.remote_base, sub)
        }
    }

    /// Resets to the initial directory, then enters `path` one segment at a time.
    fn enter(&mut self, path: &str) -> Result<()> {
        if !self.transport.change_directory(&self.initial_directory)? {
            return Err(Error::Backend(format!(
                "initial directory {} is no longer reachable",
                self.initial_directory
            )));
        }

        if path.starts_with('/') && !self.transport.change_directory("/")? {
            return Err(Error::Backend("cannot enter the root directory".to_string()));
        }

        for segment in path.split('/').filter(|s| !s.is_empty()) {
            if self.transport.change_directory(segment)? {
                continue;
            }
            debug!(segment, "Creating remote directory");
            self.transport.make_directory(segment)?;
            if !self.transport.change_directory(segment)? {
                return Err(Error::Backend(format!("cannot enter created directory {}", segment)));
            }
        }
        Ok(())
    }

    fn store_in(&mut self, folder: &str, local: &Path, name: &str) -> Result<()> {
        self.enter(folder)?;
        let mut file = std::fs::File::open(local)?;
        self.transport.store(name, &mut file)
    }
}

#[async_trait]
impl RemoteDirectory for FtpBackend {
    async fn list_entries(&mut self, category: &str) -> Result<Vec<RemoteFileEntry>> {
        let folder = self.folder(category);
        self.enter(&folder)?;
        self.transport.list()
    }

    async fn delete_entry(&mut self, category: &str, name: &str) -> Result<()> {
        let folder = self.folder(category);
        self.enter(&folder)?;
        self.transport.remove(name)
    }
}

#[async_trait]
impl Backend for FtpBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn is_authenticated(&self) -> bool {
        self.transport.is_connected()
    }

    async fn put_test_file(&mut self, artifact: &BackupArtifact) -> Result<()> {
        let folder = self.folder("");
        self.store_in(&folder, artifact.path(), artifact.file_name()?)
    }

    async fn delete_test_file(&mut self, name: &str) -> Result<()> {
        let folder = self.folder("");
        self.enter(&folder)?;
        self.transport.remove(name)
    }

    async fn upload(&mut self, artifact: &BackupArtifact) -> Result<()> {
        let folder = self.folder(artifact.category());
        self.store_in(&folder, artifact.path(), artifact.file_name()?)
    }

    async fn download(&mut self, remote_path: &str, destination: &Path) -> Result<()> {
        let remote_path = remote_path.trim_matches('/');
        let (parent, name) = match remote_path.rsplit_once('/') {
            Some((parent, name)) => (parent, name),
            None => ("", remote_path),
        };
        let folder = self.folder(parent);
        self.enter(&folder)?;

        let mut file = std::fs::File::create(destination)?;
        self.transport.retrieve(name, &mut file)?;
        file.flush()?;
        Ok(())
    }

    async fn list_files(&mut self, folder: &str) -> Result<Vec<String>> {
        let root = self.folder(folder);
        let mut files = Vec::new();
        let mut pending = vec![String::new()];

        while let Some(relative) = pending.pop() {
            let path = if relative.is_empty() {
                root.clone()
            } else {
                format!("{}/{}", root, relative)
            };
            self.enter(&path)?;

            for entry in self.transport.list()? {
                let child = if relative.is_empty() {
                    entry.name
                } else {
                    format!("{}/{}", relative, entry.name)
                };
                if entry.is_dir {
                    pending.push(child);
                } else {
                    files.push(child);
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn close(&mut self) -> Result<()> {
        if self.transport.is_connected() {
            if let Err(e) = self.transport.disconnect() {
                warn!(backend = %self.backend_type, error = %e, "Error while disconnecting");
            }
        }
        Ok(())
    }
}
