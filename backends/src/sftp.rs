use crate::ftp::FileTransport;
use chrono::DateTime;
use offsite_core::{Error, RemoteFileEntry, Result};
use ssh2::{Session, Sftp};
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

const CONNECTION_TIMEOUT: Duration = Duration::from_secs(30);

fn ssh_error(context: &str, error: ssh2::Error) -> Error {
    Error::Backend(format!("SFTP {}: {}", context, error))
}

/// SFTP over an SSH session. SFTP has no server-side working directory, so it
/// is tracked here and every path is resolved against it.
pub struct SftpTransport {
    session: Session,
    sftp: Option<Sftp>,
    cwd: String,
}

impl SftpTransport {
    /// Connects and authenticates with the private key at `public_key` if one is
    /// configured, with `password` otherwise.
    pub fn connect(
        hostname: &str,
        port: u16,
        username: &str,
        password: &str,
        public_key: Option<&Path>,
        passphrase: Option<&str>,
    ) -> Result<Self> {
        let tcp = TcpStream::connect((hostname, port))
            .map_err(|e| Error::Network(format!("Failed to connect to {}:{}: {}", hostname, port, e)))?;
        tcp.set_read_timeout(Some(CONNECTION_TIMEOUT))?;
        tcp.set_write_timeout(Some(CONNECTION_TIMEOUT))?;

        let mut session = Session::new().map_err(|e| ssh_error("session", e))?;
        session.set_tcp_stream(tcp);
        session.handshake().map_err(|e| ssh_error("handshake", e))?;

        let auth = match public_key {
            Some(key) => session.userauth_pubkey_file(username, None, key, passphrase),
            None => session.userauth_password(username, password),
        };
        auth.map_err(|e| Error::Unauthorized(format!("SFTP login as {} failed: {}", username, e)))?;
        if !session.authenticated() {
            return Err(Error::Unauthorized(format!("SFTP login as {} failed", username)));
        }

        let sftp = session.sftp().map_err(|e| ssh_error("subsystem", e))?;
        let cwd = sftp
            .realpath(Path::new("."))
            .map_err(|e| ssh_error("realpath", e))?
            .to_string_lossy()
            .into_owned();

        debug!(hostname, port, cwd = %cwd, "SFTP session established");
        Ok(Self {
            session,
            sftp: Some(sftp),
            cwd,
        })
    }

    fn sftp(&self) -> Result<&Sftp> {
        self.sftp
            .as_ref()
            .ok_or_else(|| Error::NotConnected("SFTP server".to_string()))
    }

    fn resolve(&self, path: &str) -> String {
        resolve_path(&self.cwd, path)
    }
}

/// Resolves `path` against `cwd`, folding `.` and `..` segments.
pub(crate) fn resolve_path(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{}/{}", cwd, path)
    };

    let mut segments: Vec<&str> = Vec::new();
    for segment in joined.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }
    format!("/{}", segments.join("/"))
}

impl FileTransport for SftpTransport {
    fn working_directory(&mut self) -> Result<String> {
        Ok(self.cwd.clone())
    }

    fn change_directory(&mut self, path: &str) -> Result<bool> {
        let target = self.resolve(path);
        match self.sftp()?.stat(Path::new(&target)) {
            Ok(stat) if stat.is_dir() => {
                self.cwd = target;
                Ok(true)
            }
            Ok(_) => Ok(false),
            Err(e) => {
                debug!(path = %target, error = %e, "Cannot enter directory");
                Ok(false)
            }
        }
    }

    fn make_directory(&mut self, name: &str) -> Result<()> {
        let target = self.resolve(name);
        self.sftp()?
            .mkdir(Path::new(&target), 0o755)
            .map_err(|e| ssh_error(&format!("mkdir {}", target), e))
    }

    fn store(&mut self, name: &str, reader: &mut dyn Read) -> Result<()> {
        let target = self.resolve(name);
        let mut remote = self
            .sftp()?
            .create(Path::new(&target))
            .map_err(|e| ssh_error(&format!("create {}", target), e))?;
        let written = std::io::copy(reader, &mut remote)?;
        remote.flush()?;
        debug!(path = %target, written, "Stored file");
        Ok(())
    }

    fn retrieve(&mut self, name: &str, writer: &mut dyn Write) -> Result<()> {
        let target = self.resolve(name);
        let mut remote = self
            .sftp()?
            .open(Path::new(&target))
            .map_err(|e| ssh_error(&format!("open {}", target), e))?;
        std::io::copy(&mut remote, writer)?;
        Ok(())
    }

    fn remove(&mut self, name: &str) -> Result<()> {
        let target = self.resolve(name);
        self.sftp()?
            .unlink(Path::new(&target))
            .map_err(|e| ssh_error(&format!("unlink {}", target), e))
    }

    fn list(&mut self) -> Result<Vec<RemoteFileEntry>> {
        let listing = self
            .sftp()?
            .readdir(Path::new(&self.cwd))
            .map_err(|e| ssh_error(&format!("readdir {}", self.cwd), e))?;

        Ok(listing
            .into_iter()
            .filter_map(|(path, stat)| {
                let name = path.file_name()?.to_string_lossy().into_owned();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteFileEntry {
                    name,
                    modified: stat.mtime.and_then(|t| DateTime::from_timestamp(t as i64, 0)),
                    is_dir: stat.is_dir(),
                })
            })
            .collect())
    }

    fn is_connected(&self) -> bool {
        self.sftp.is_some()
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.sftp.take().is_some() {
            self.session
                .disconnect(None, "closing", None)
                .map_err(|e| ssh_error("disconnect", e))?;
        }
        Ok(())
    }
}
