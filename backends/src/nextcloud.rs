use crate::backend::BackendType;
use crate::fragment::FragmentUpload;
use crate::http::transport_error;
use crate::webdav::{WebDavBackend, WebDavClient, encode_segment};
use offsite_core::config::NextcloudConfig;
use offsite_core::{Error, Result};
use reqwest::Url;
use tracing::{debug, info};

/// Possible locations of the chunked-upload staging area, most likely first.
///
/// For `https://host/remote.php/dav/files/me` and user `me` these are
/// `https://host/remote.php/dav/uploads/me`, `https://host/uploads/me`, then
/// `uploads/me` below every prefix of the account path.
pub fn staging_candidates(hostname: &str, username: &str) -> Result<Vec<String>> {
    let url = Url::parse(hostname)
        .map_err(|e| Error::Config(format!("nextcloud.hostname is not a URL: {}", e)))?;
    let origin = url.origin().ascii_serialization();
    let user = encode_segment(username);

    let mut candidates = vec![
        format!("{}/remote.php/dav/uploads/{}", origin, user),
        format!("{}/uploads/{}", origin, user),
    ];

    let mut prefix = origin;
    for segment in url.path().split('/').filter(|s| !s.is_empty()) {
        prefix.push('/');
        prefix.push_str(segment);
        let candidate = format!("{}/uploads/{}", prefix, user);
        if !candidates.contains(&candidate) {
            candidates.push(candidate);
        }
    }

    Ok(candidates)
}

/// Returns the first candidate that exists on the server.
pub async fn discover_staging(dav: &WebDavClient, candidates: &[String]) -> Option<String> {
    for candidate in candidates {
        match dav.exists(candidate).await {
            Ok(true) => return Some(candidate.clone()),
            Ok(false) => debug!(candidate = %candidate, "No staging directory"),
            Err(e) => debug!(candidate = %candidate, error = %e, "Staging check failed"),
        }
    }
    None
}

/// A WebDAV backend that uploads files above `chunk_size` through the
/// Nextcloud chunking staging area when one is found, and in one request otherwise.
pub async fn connect(config: &NextcloudConfig, remote_base: &str) -> Result<WebDavBackend> {
    let candidates = staging_candidates(&config.hostname, &config.username)?;
    let client = reqwest::Client::builder().build().map_err(transport_error)?;
    let dav = WebDavClient::new(client, &config.username, &config.password);

    let staging = discover_staging(&dav, &candidates).await;
    let backend = WebDavBackend::new(dav, BackendType::Nextcloud, &config.hostname, remote_base);

    Ok(match staging {
        Some(root) => {
            info!(staging = %root, chunk_size = config.chunk_size, "Chunked uploads enabled");
            backend.with_fragments(FragmentUpload::new(root, config.chunk_size))
        }
        None => {
            info!("No staging directory found, uploading files in one request");
            backend
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_staging_candidates_order() {
        let candidates =
            staging_candidates("https://cloud.example.com/remote.php/dav/files/me", "me").unwrap();
        assert_eq!(
            candidates,
            vec![
                "https://cloud.example.com/remote.php/dav/uploads/me",
                "https://cloud.example.com/uploads/me",
                "https://cloud.example.com/remote.php/uploads/me",
                "https://cloud.example.com/remote.php/dav/files/uploads/me",
                "https://cloud.example.com/remote.php/dav/files/me/uploads/me",
            ]
        );
    }

    #[test]
    fn test_staging_candidates_keep_port_and_encode_user() {
        let candidates = staging_candidates("http://nas:8080/dav", "jane doe").unwrap();
        assert_eq!(candidates[0], "http://nas:8080/remote.php/dav/uploads/jane%20doe");
        assert_eq!(candidates.last().unwrap(), "http://nas:8080/dav/uploads/jane%20doe");
    }

    #[test]
    fn test_staging_candidates_reject_bad_url() {
        assert!(matches!(staging_candidates("not a url", "me"), Err(Error::Config(_))));
    }
}
