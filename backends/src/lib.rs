pub mod auth;
pub mod backend;
pub mod dropbox;
pub mod fragment;
pub mod ftp;
mod http;
pub mod nextcloud;
pub mod orchestrator;
pub mod retry;
pub mod session;
pub mod sftp;
pub mod uploader;
pub mod webdav;

pub use auth::{AuthTokenManager, OAuthTokenEndpoint, TokenEndpoint, TokenState};
pub use backend::{Backend, BackendType};
pub use dropbox::DropboxBackend;
pub use fragment::{FragmentStore, FragmentUpload, fragment_name};
pub use ftp::{FileTransport, FtpBackend, FtpTransport};
pub use orchestrator::{UploadOrchestrator, UploadReport};
pub use retry::{Backoff, RetryConfig, Retryable, retry_with_backoff};
pub use session::{SessionTransport, upload_in_session};
pub use sftp::SftpTransport;
pub use uploader::{Outcome, UploadOutcome, Uploader, UploaderOptions};
pub use webdav::{WebDavBackend, WebDavClient};
