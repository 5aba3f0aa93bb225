pub mod config;
pub mod error;
pub mod obfuscate;
pub mod retention;
pub mod types;

pub use config::{Config, RetentionPolicy};
pub use error::{Error, ErrorKind, Result};
pub use obfuscate::ObfuscatedSecret;
pub use retention::{PruneReport, RemoteDirectory, RetentionPruner};
pub use types::*;
