use crate::auth::{AuthTokenManager, OAuthTokenEndpoint};
use crate::backend::{Backend, BackendType};
use crate::http::{check_status, transport_error};
use crate::session::{SessionTransport, upload_in_session};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use offsite_core::config::DropboxConfig;
use offsite_core::{
    BackupArtifact, RemoteDirectory, RemoteFileEntry, Result, UploadSession, join_remote,
};
use reqwest::Response;
use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

const OCTET_STREAM: &str = "application/octet-stream";

#[derive(Clone)]
enum Payload {
    Empty,
    Json(Value),
    Octets(Bytes),
    File(PathBuf),
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ListFolderResult {
    entries: Vec<ListedEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct ListedEntry {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    #[serde(default)]
    path_display: Option<String>,
    #[serde(default)]
    server_modified: Option<DateTime<Utc>>,
}

impl ListedEntry {
    fn is_file(&self) -> bool {
        self.tag == "file"
    }

    fn into_remote_entry(self) -> RemoteFileEntry {
        RemoteFileEntry {
            is_dir: !self.is_file(),
            modified: self.server_modified,
            name: self.name,
        }
    }
}

/// Dropbox HTTP API v2 with OAuth2 refresh tokens and upload sessions for large files.
pub struct DropboxBackend {
    client: reqwest::Client,
    auth: AuthTokenManager,
    api_url: String,
    content_url: String,
    remote_base: String,
    chunk_threshold: u64,
    chunk_size: u64,
}

impl DropboxBackend {
    /// Builds the backend without contacting Dropbox.
    pub fn new(
        client: reqwest::Client,
        auth: AuthTokenManager,
        config: &DropboxConfig,
        remote_base: &str,
    ) -> Self {
        Self {
            client,
            auth,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            content_url: config.content_url.trim_end_matches('/').to_string(),
            remote_base: remote_base.trim_matches('/').to_string(),
            chunk_threshold: config.chunk_threshold,
            chunk_size: config.chunk_size,
        }
    }

    /// Builds the backend and exchanges the refresh token for a first access token.
    pub async fn connect(config: &DropboxConfig, remote_base: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(transport_error)?;
        let endpoint = OAuthTokenEndpoint::new(
            client.clone(),
            &config.token_url,
            &config.client_id,
            config.client_secret.clone(),
        );
        let auth = AuthTokenManager::new(Box::new(endpoint), config.refresh_token.clone());

        let mut backend = Self::new(client, auth, config, remote_base);
        backend.auth.refresh().await?;
        info!(remote_base = %backend.remote_base, "Connected to Dropbox");
        Ok(backend)
    }

    fn remote_path(&self, segments: &[&str]) -> String {
        let mut all = vec![self.remote_base.as_str()];
        all.extend_from_slice(segments);
        dropbox_path(&join_remote(&all))
    }

    async fn call(&mut self, url: String, arg: Option<Value>, payload: Payload) -> Result<Response> {
        let arg = arg.map(|a| api_arg_header(&a)).transpose()?;
        let client = &self.client;

        self.auth
            .authorized(|token| {
                let mut request = client.post(&url).bearer_auth(token);
                if let Some(arg) = &arg {
                    request = request.header("Dropbox-API-Arg", arg.as_str());
                }
                let payload = payload.clone();
                async move {
                    let request = match payload {
                        Payload::Empty => request,
                        Payload::Json(value) => request.json(&value),
                        Payload::Octets(bytes) => request.header(CONTENT_TYPE, OCTET_STREAM).body(bytes),
                        Payload::File(path) => {
                            let file = tokio::fs::File::open(&path).await?;
                            request
                                .header(CONTENT_TYPE, OCTET_STREAM)
                                .body(reqwest::Body::from(file))
                        }
                    };
                    let response = request.send().await.map_err(transport_error)?;
                    check_status(response).await
                }
            })
            .await
    }

    async fn api<T: DeserializeOwned>(&mut self, endpoint: &str, body: Value) -> Result<T> {
        let url = format!("{}/{}", self.api_url, endpoint);
        let response = self.call(url, None, Payload::Json(body)).await?;
        read_json(response).await
    }

    async fn content(&mut self, endpoint: &str, arg: Value, payload: Payload) -> Result<Response> {
        let url = format!("{}/{}", self.content_url, endpoint);
        self.call(url, Some(arg), payload).await
    }

    async fn list_folder(&mut self, path: &str, recursive: bool) -> Result<Vec<ListedEntry>> {
        let mut page: ListFolderResult = self
            .api("files/list_folder", json!({ "path": path, "recursive": recursive }))
            .await?;
        let mut entries = std::mem::take(&mut page.entries);

        while page.has_more {
            debug!(path, fetched = entries.len(), "Fetching next listing page");
            page = self
                .api("files/list_folder/continue", json!({ "cursor": page.cursor }))
                .await?;
            entries.append(&mut page.entries);
        }
        Ok(entries)
    }

    async fn delete_path(&mut self, path: String) -> Result<()> {
        let _: Value = self.api("files/delete_v2", json!({ "path": path })).await?;
        Ok(())
    }

    async fn upload_single(&mut self, local: &Path, path: String) -> Result<()> {
        self.content(
            "files/upload",
            json!({ "path": path }),
            Payload::File(local.to_path_buf()),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionTransport for DropboxBackend {
    async fn start(&mut self, chunk: Bytes) -> Result<String> {
        let response = self
            .content(
                "files/upload_session/start",
                json!({ "close": false }),
                Payload::Octets(chunk),
            )
            .await?;
        let started: SessionStart = read_json(response).await?;
        Ok(started.session_id)
    }

    async fn append(&mut self, session: &UploadSession, chunk: Bytes) -> Result<()> {
        self.content(
            "files/upload_session/append_v2",
            json!({ "cursor": cursor(session), "close": false }),
            Payload::Octets(chunk),
        )
        .await?;
        Ok(())
    }

    async fn finish(&mut self, session: &UploadSession, chunk: Bytes) -> Result<()> {
        self.content(
            "files/upload_session/finish",
            json!({ "cursor": cursor(session), "commit": { "path": session.target } }),
            Payload::Octets(chunk),
        )
        .await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteDirectory for DropboxBackend {
    async fn list_entries(&mut self, category: &str) -> Result<Vec<RemoteFileEntry>> {
        let path = self.remote_path(&[category]);
        let entries = self.list_folder(&path, false).await?;
        Ok(entries.into_iter().map(ListedEntry::into_remote_entry).collect())
    }

    async fn delete_entry(&mut self, category: &str, name: &str) -> Result<()> {
        let path = self.remote_path(&[category, name]);
        self.delete_path(path).await
    }
}

#[async_trait]
impl Backend for DropboxBackend {
    fn backend_type(&self) -> BackendType {
        BackendType::Dropbox
    }

    fn is_authenticated(&self) -> bool {
        self.auth.is_authenticated()
    }

    async fn put_test_file(&mut self, artifact: &BackupArtifact) -> Result<()> {
        let path = self.remote_path(&[artifact.file_name()?]);
        self.upload_single(artifact.path(), path).await
    }

    async fn delete_test_file(&mut self, name: &str) -> Result<()> {
        let path = self.remote_path(&[name]);
        self.delete_path(path).await
    }

    async fn upload(&mut self, artifact: &BackupArtifact) -> Result<()> {
        let target = self.remote_path(&[artifact.category(), artifact.file_name()?]);

        if artifact.len() > self.chunk_threshold {
            let chunk_size = self.chunk_size;
            info!(
                target_path = %target,
                length = artifact.len(),
                chunk_size,
                "Uploading in session"
            );
            let mut file = tokio::fs::File::open(artifact.path()).await?;
            upload_in_session(&mut file, artifact.len(), chunk_size, &target, self).await?;
        } else {
            self.upload_single(artifact.path(), target).await?;
        }
        Ok(())
    }

    async fn download(&mut self, remote_path: &str, destination: &Path) -> Result<()> {
        let path = self.remote_path(&[remote_path]);
        let response = self
            .content("files/download", json!({ "path": path }), Payload::Empty)
            .await?;

        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk.map_err(transport_error)?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    async fn list_files(&mut self, folder: &str) -> Result<Vec<String>> {
        let root = self.remote_path(&[folder]);
        let entries = self.list_folder(&root, true).await?;

        Ok(entries
            .into_iter()
            .filter(ListedEntry::is_file)
            .map(|entry| match entry.path_display.as_deref() {
                Some(display) => relative_to(&root, display).unwrap_or(entry.name),
                None => entry.name,
            })
            .collect())
    }

    async fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

fn cursor(session: &UploadSession) -> Value {
    json!({ "session_id": session.session_id, "offset": session.offset })
}

async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
    let body = response.bytes().await.map_err(transport_error)?;
    Ok(serde_json::from_slice(&body)?)
}

/// Dropbox addresses the root as `""` and everything else with a leading slash.
fn dropbox_path(joined: &str) -> String {
    if joined.is_empty() {
        String::new()
    } else {
        format!("/{}", joined)
    }
}

/// Serializes a `Dropbox-API-Arg` value. HTTP headers must be ASCII, so every
/// other character is written as a JSON `\uXXXX` escape.
fn api_arg_header(arg: &Value) -> Result<String> {
    let raw = serde_json::to_string(arg)?;
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() && c != '\x7f' {
            escaped.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(escaped, "\\u{:04x}", unit);
            }
        }
    }
    Ok(escaped)
}

/// `display` relative to `root`, compared case-insensitively as Dropbox paths are.
fn relative_to(root: &str, display: &str) -> Option<String> {
    let head = display.get(..root.len())?;
    if !head.eq_ignore_ascii_case(root) {
        return None;
    }
    let rest = display[root.len()..].trim_start_matches('/');
    if rest.is_empty() { None } else { Some(rest.to_string()) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_arg_header_escapes_non_ascii() {
        let header = api_arg_header(&json!({ "path": "/backups/wörld/a.zip" })).unwrap();
        assert_eq!(header, r#"{"path":"/backups/w\u00f6rld/a.zip"}"#);
        assert!(header.is_ascii());

        let emoji = api_arg_header(&json!({ "path": "/🎮" })).unwrap();
        assert_eq!(emoji, r#"{"path":"/\ud83c\udfae"}"#);
    }

    #[test]
    fn test_dropbox_path() {
        assert_eq!(dropbox_path(""), "");
        assert_eq!(dropbox_path(&join_remote(&["backups", "world", "a.zip"])), "/backups/world/a.zip");
    }

    #[test]
    fn test_relative_to() {
        assert_eq!(
            relative_to("/backups/world", "/Backups/World/2024/a.zip").as_deref(),
            Some("2024/a.zip")
        );
        assert_eq!(relative_to("/backups/world", "/other/a.zip"), None);
        assert_eq!(relative_to("/backups/world", "/backups/world"), None);
    }

    #[test]
    fn test_session_cursor() {
        let session = UploadSession {
            session_id: "AAA".into(),
            offset: 10_485_760,
            target: "/backups/world/big.zip".into(),
            chunk_size: 10_485_760,
        };
        assert_eq!(cursor(&session), json!({ "session_id": "AAA", "offset": 10_485_760u64 }));
    }

    #[test]
    fn test_parse_list_folder_page() {
        let raw = r#"{
            "entries": [
                {".tag": "file", "name": "a.zip", "path_display": "/backups/world/a.zip",
                 "server_modified": "2024-03-01T10:00:00Z", "size": 10},
                {".tag": "folder", "name": "old", "path_display": "/backups/world/old"}
            ],
            "cursor": "c1",
            "has_more": true
        }"#;
        let page: ListFolderResult = serde_json::from_str(raw).unwrap();
        assert!(page.has_more);
        assert_eq!(page.cursor, "c1");

        let entries: Vec<_> = page.entries.into_iter().map(ListedEntry::into_remote_entry).collect();
        assert_eq!(entries[0].name, "a.zip");
        assert!(!entries[0].is_dir);
        assert_eq!(entries[0].modified.unwrap().to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(entries[1].is_dir);
    }
}
