use crate::backend::{Backend, BackendType};
use crate::fragment::{FragmentStore, FragmentUpload};
use crate::http::{check_status, transport_error};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use offsite_core::config::WebDavConfig;
use offsite_core::{BackupArtifact, Error, RemoteDirectory, RemoteFileEntry, Result};
use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, percent_decode_str, utf8_percent_encode};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use reqwest::{Method, RequestBuilder, Response, Url};
use std::collections::VecDeque;
use std::path::Path;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Characters left unescaped inside one path segment.
const SEGMENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
  <d:prop>
    <d:resourcetype/>
    <d:getlastmodified/>
  </d:prop>
</d:propfind>"#;

pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// One `<response>` of a PROPFIND multistatus body.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavEntry {
    /// Decoded path component of the href, without a trailing slash.
    pub path: String,
    pub is_collection: bool,
    pub modified: Option<DateTime<Utc>>,
}

impl DavEntry {
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

#[derive(Clone, Copy)]
enum Field {
    Href,
    Modified,
}

fn xml_error(error: impl std::fmt::Display) -> Error {
    Error::Protocol(format!("invalid PROPFIND response: {}", error))
}

/// Parses a `207 Multi-Status` body. Namespace prefixes are ignored.
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut entries = Vec::new();
    let mut current: Option<DavEntry> = None;
    let mut field: Option<Field> = None;

    loop {
        match reader.read_event().map_err(xml_error)? {
            Event::Start(e) => match e.local_name().as_ref() {
                b"response" => current = Some(DavEntry::default()),
                b"href" => field = Some(Field::Href),
                b"getlastmodified" => field = Some(Field::Modified),
                b"collection" => {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
                _ => {}
            },
            Event::Empty(e) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = current.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Event::Text(text) => {
                if let (Some(entry), Some(field)) = (current.as_mut(), field) {
                    let text = text.unescape().map_err(xml_error)?;
                    match field {
                        Field::Href if entry.path.is_empty() => entry.path = href_path(&text),
                        Field::Href => {}
                        Field::Modified => {
                            entry.modified = DateTime::parse_from_rfc2822(text.trim())
                                .ok()
                                .map(|d| d.with_timezone(&Utc));
                        }
                    }
                }
            }
            Event::End(e) => match e.local_name().as_ref() {
                b"response" => {
                    if let Some(entry) = current.take() {
                        entries.push(entry);
                    }
                }
                b"href" | b"getlastmodified" => field = None,
                _ => {}
            },
            Event::Eof => break,
            _ => {}
        }
    }

    Ok(entries)
}

/// Decoded path of an href that may be a full URL or an absolute path.
fn href_path(href: &str) -> String {
    let raw = match Url::parse(href) {
        Ok(url) => url.path().to_string(),
        Err(_) => href.to_string(),
    };
    let decoded = percent_decode_str(&raw).decode_utf8_lossy();
    let trimmed = decoded.trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    }
}

fn dav_method(name: &'static str) -> Result<Method> {
    Method::from_bytes(name.as_bytes())
        .map_err(|e| Error::Other(format!("invalid HTTP method {}: {}", name, e)))
}

/// Basic-auth WebDAV client addressing resources by absolute URL.
#[derive(Clone)]
pub struct WebDavClient {
    client: reqwest::Client,
    username: String,
    password: String,
}

impl WebDavClient {
    pub fn new(client: reqwest::Client, username: &str, password: &str) -> Self {
        Self {
            client,
            username: username.to_string(),
            password: password.to_string(),
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        self.client
            .request(method, url)
            .basic_auth(&self.username, Some(&self.password))
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.send().await.map_err(transport_error)?;
        check_status(response).await
    }

    async fn propfind(&self, url: &str, depth: u8) -> Result<Vec<DavEntry>> {
        let request = self
            .request(dav_method("PROPFIND")?, url)
            .header("Depth", depth.to_string())
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(PROPFIND_BODY);
        let body = self.send(request).await?.text().await.map_err(transport_error)?;
        parse_multistatus(&body)
    }

    pub async fn exists(&self, url: &str) -> Result<bool> {
        match self.propfind(url, 0).await {
            Ok(_) => Ok(true),
            Err(e) if e.status() == Some(404) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Entries directly below `url`, excluding the collection itself.
    pub async fn list(&self, url: &str) -> Result<Vec<DavEntry>> {
        let own_path = href_path(url);
        let entries = self.propfind(url, 1).await?;
        Ok(entries.into_iter().filter(|e| e.path != own_path).collect())
    }

    /// Creates a collection. An already existing one is not an error.
    pub async fn mkcol(&self, url: &str) -> Result<()> {
        match self.send(self.request(dav_method("MKCOL")?, url)).await {
            Ok(_) => Ok(()),
            Err(e) if e.status() == Some(405) => Ok(()),
            Err(e) => Err(e),
        }
    }

    pub async fn put_file(&self, url: &str, local: &Path, length: u64) -> Result<()> {
        let file = tokio::fs::File::open(local).await?;
        let request = self
            .request(Method::PUT, url)
            .header(CONTENT_LENGTH, length)
            .body(reqwest::Body::from(file));
        self.send(request).await?;
        Ok(())
    }

    pub async fn put_bytes(&self, url: &str, data: Bytes) -> Result<()> {
        self.send(self.request(Method::PUT, url).body(data)).await?;
        Ok(())
    }

    pub async fn get_to_file(&self, url: &str, destination: &Path) -> Result<()> {
        let response = self.send(self.request(Method::GET, url)).await?;
        let mut file = tokio::fs::File::create(destination).await?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            file.write_all(&chunk.map_err(transport_error)?).await?;
        }
        file.flush().await?;
        Ok(())
    }

    pub async fn delete(&self, url: &str) -> Result<()> {
        self.send(self.request(Method::DELETE, url)).await?;
        Ok(())
    }

    pub async fn move_to(&self, from: &str, to: &str) -> Result<()> {
        let request = self
            .request(dav_method("MOVE")?, from)
            .header("Destination", to)
            .header("Overwrite", "T");
        self.send(request).await?;
        Ok(())
    }
}

#[async_trait]
impl FragmentStore for WebDavClient {
    async fn create_collection(&self, url: &str) -> Result<()> {
        self.mkcol(url).await
    }

    async fn put_fragment(&self, url: &str, data: Bytes) -> Result<()> {
        self.put_bytes(url, data).await
    }

    async fn move_resource(&self, from: &str, to: &str) -> Result<()> {
        self.move_to(from, to).await
    }

    async fn delete_resource(&self, url: &str) -> Result<()> {
        self.delete(url).await
    }
}

/// Generic WebDAV storage, optionally uploading large files as assembled fragments.
pub struct WebDavBackend {
    dav: WebDavClient,
    backend_type: BackendType,
    base_url: String,
    remote_base: String,
    fragments: Option<FragmentUpload>,
    open: bool,
}

impl WebDavBackend {
    pub fn new(
        dav: WebDavClient,
        backend_type: BackendType,
        base_url: &str,
        remote_base: &str,
    ) -> Self {
        Self {
            dav,
            backend_type,
            base_url: base_url.trim_end_matches('/').to_string(),
            remote_base: remote_base.trim_matches('/').to_string(),
            fragments: None,
            open: true,
        }
    }

    pub fn connect(config: &WebDavConfig, remote_base: &str) -> Result<Self> {
        Url::parse(&config.hostname)
            .map_err(|e| Error::Config(format!("webdav.hostname is not a URL: {}", e)))?;
        let client = reqwest::Client::builder().build().map_err(transport_error)?;
        let dav = WebDavClient::new(client, &config.username, &config.password);
        Ok(Self::new(dav, BackendType::WebDav, &config.hostname, remote_base))
    }

    /// Uploads files larger than the engine's chunk size as fragments.
    pub fn with_fragments(mut self, fragments: FragmentUpload) -> Self {
        self.fragments = Some(fragments);
        self
    }

    pub fn client(&self) -> &WebDavClient {
        &self.dav
    }

    fn segments<'a>(&'a self, relative: &'a str) -> Vec<&'a str> {
        self.remote_base
            .split('/')
            .chain(relative.split('/'))
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn url(&self, relative: &str) -> String {
        let mut url = self.base_url.clone();
        for segment in self.segments(relative) {
            url.push('/');
            url.push_str(&encode_segment(segment));
        }
        url
    }

    /// Creates every missing collection on the way to `relative`.
    async fn ensure_collections(&self, relative: &str) -> Result<()> {
        let mut url = self.base_url.clone();
        for segment in self.segments(relative) {
            url.push('/');
            url.push_str(&encode_segment(segment));
            if !self.dav.exists(&url).await? {
                debug!(url = %url, "Creating collection");
                self.dav.mkcol(&url).await?;
            }
        }
        Ok(())
    }

    async fn put(&self, folder: &str, artifact: &BackupArtifact) -> Result<()> {
        self.ensure_collections(folder).await?;
        let name = artifact.file_name()?;
        let target = if folder.is_empty() {
            self.url(name)
        } else {
            self.url(&format!("{}/{}", folder, name))
        };

        match &self.fragments {
            Some(fragments) if artifact.len() > fragments.chunk_size() => {
                info!(
                    backend = %self.backend_type,
                    length = artifact.len(),
                    chunk_size = fragments.chunk_size(),
                    "Uploading in fragments"
                );
                let mut file = tokio::fs::File::open(artifact.path()).await?;
                fragments.run(&mut file, artifact.len(), &target, &self.dav).await
            }
            _ => self.dav.put_file(&target, artifact.path(), artifact.len()).await,
        }
    }
}

#[async_trait]
impl RemoteDirectory for WebDavBackend {
    async fn list_entries(&mut self, category: &str) -> Result<Vec<RemoteFileEntry>> {
        let entries = self.dav.list(&self.url(category)).await?;
        Ok(entries
            .into_iter()
            .map(|e| RemoteFileEntry {
                name: e.name().to_string(),
                modified: e.modified,
                is_dir: e.is_collection,
            })
            .collect())
    }

    async fn delete_entry(&mut self, category: &str, name: &str) -> Result<()> {
        let url = self.url(&format!("{}/{}", category, name));
        self.dav.delete(&url).await
    }
}

#[async_trait]
impl Backend for WebDavBackend {
    fn backend_type(&self) -> BackendType {
        self.backend_type
    }

    fn is_authenticated(&self) -> bool {
        self.open
    }

    async fn put_test_file(&mut self, artifact: &BackupArtifact) -> Result<()> {
        self.put("", artifact).await
    }

    async fn delete_test_file(&mut self, name: &str) -> Result<()> {
        self.dav.delete(&self.url(name)).await
    }

    async fn upload(&mut self, artifact: &BackupArtifact) -> Result<()> {
        self.put(artifact.category(), artifact).await
    }

    async fn download(&mut self, remote_path: &str, destination: &Path) -> Result<()> {
        self.dav.get_to_file(&self.url(remote_path), destination).await
    }

    async fn list_files(&mut self, folder: &str) -> Result<Vec<String>> {
        let root_url = self.url(folder);
        let root_path = href_path(&root_url);
        let mut files = Vec::new();
        let mut pending = VecDeque::from([root_url]);

        while let Some(url) = pending.pop_front() {
            for entry in self.dav.list(&url).await? {
                if entry.is_collection {
                    pending.push_back(format!("{}/{}", url, encode_segment(entry.name())));
                } else if let Some(relative) = entry.path.strip_prefix(&root_path) {
                    files.push(relative.trim_start_matches('/').to_string());
                }
            }
        }

        files.sort();
        Ok(files)
    }

    async fn close(&mut self) -> Result<()> {
        self.open = false;
        Ok(())
    }
}
