use crate::obfuscate::ObfuscatedSecret;
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::fmt;
use std::path::{Path, PathBuf};

/// A local file scheduled for transfer. Immutable for the duration of one upload.
#[derive(Debug, Clone)]
pub struct BackupArtifact {
    path: PathBuf,
    length: u64,
    category: String,
}

impl BackupArtifact {
    /// Stats the file and records its length. `category` is sanitized before use.
    pub async fn open<P: AsRef<Path>>(path: P, category: &str) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let metadata = tokio::fs::metadata(&path).await?;
        if !metadata.is_file() {
            return Err(Error::Other(format!("{} is not a file", path.display())));
        }

        Ok(Self {
            path,
            length: metadata.len(),
            category: sanitize_category(category),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn file_name(&self) -> Result<&str> {
        self.path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Other(format!("Invalid file name: {}", self.path.display())))
    }
}

/// Strips relative traversal (`../`, `./`) so a category can only name a sub-path.
pub fn sanitize_category(category: &str) -> String {
    let mut cleaned = category.replace('\\', "/");
    while cleaned.contains("../") || cleaned.contains("./") {
        cleaned = cleaned.replace("../", "").replace("./", "");
    }
    cleaned.trim_matches('/').to_string()
}

/// Joins remote path segments with `/`, skipping empty ones.
pub fn join_remote(segments: &[&str]) -> String {
    segments
        .iter()
        .map(|s| s.trim_matches('/'))
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join("/")
}

/// Provider identity. Owned by exactly one backend.
#[derive(Clone)]
pub enum RemoteCredential {
    Bearer {
        refresh_token: ObfuscatedSecret,
    },
    Password {
        username: String,
        password: String,
    },
    PublicKey {
        username: String,
        public_key: PathBuf,
        passphrase: Option<String>,
    },
}

impl RemoteCredential {
    pub fn username(&self) -> Option<&str> {
        match self {
            RemoteCredential::Bearer { .. } => None,
            RemoteCredential::Password { username, .. }
            | RemoteCredential::PublicKey { username, .. } => Some(username),
        }
    }
}

impl fmt::Debug for RemoteCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemoteCredential::Bearer { .. } => f.write_str("Bearer { .. }"),
            RemoteCredential::Password { username, .. } => {
                write!(f, "Password {{ username: {:?}, .. }}", username)
            }
            RemoteCredential::PublicKey {
                username,
                public_key,
                ..
            } => write!(
                f,
                "PublicKey {{ username: {:?}, public_key: {:?}, .. }}",
                username, public_key
            ),
        }
    }
}

/// Transient state of a session-based chunked transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadSession {
    pub session_id: String,
    pub offset: u64,
    pub target: String,
    pub chunk_size: u64,
}

/// One listed remote object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileEntry {
    pub name: String,
    /// `None` when the server reported no usable timestamp.
    pub modified: Option<DateTime<Utc>>,
    pub is_dir: bool,
}

impl RemoteFileEntry {
    pub fn file(name: impl Into<String>, modified: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            modified: Some(modified),
            is_dir: false,
        }
    }

    /// Oldest first, ties broken by name.
    pub fn age_order(&self, other: &Self) -> Ordering {
        self.modified
            .cmp(&other.modified)
            .then_with(|| self.name.cmp(&other.name))
    }
}

/// The single "is this a backup artifact" predicate shared by every backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupFilter {
    extensions: Vec<String>,
}

impl BackupFilter {
    pub fn new<I, S>(extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            extensions: extensions
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .filter(|e| !e.is_empty())
                .collect(),
        }
    }

    pub fn matches(&self, name: &str) -> bool {
        let lower = name.to_ascii_lowercase();
        self.extensions.iter().any(|ext| {
            lower.len() > ext.len() + 1
                && lower.ends_with(ext.as_str())
                && lower.as_bytes()[lower.len() - ext.len() - 1] == b'.'
        })
    }
}

impl Default for BackupFilter {
    fn default() -> Self {
        Self::new(["zip"])
    }
}
