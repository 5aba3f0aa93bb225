pub mod download;
pub mod list;
pub mod obfuscate;
pub mod upload;
pub mod verify;

use anyhow::{Context, Result, anyhow};
use offsite_backends::{UploadOrchestrator, UploadReport};
use offsite_core::Config;
use tracing::info;

pub async fn load_config(cli: &crate::Cli) -> Result<Config> {
    let path = match &cli.config {
        Some(path) => path.clone(),
        None => Config::default_path()
            .ok_or_else(|| anyhow!("No config directory on this platform, pass --config"))?,
    };

    Config::load(&path)
        .await
        .with_context(|| format!("Loading {}", path.display()))
}

pub async fn connect(cli: &crate::Cli) -> Result<UploadOrchestrator> {
    let config = load_config(cli).await?;
    let orchestrator = UploadOrchestrator::from_config(&config).await?;
    if orchestrator.is_empty() {
        return Err(anyhow!("No backup method is enabled in the configuration"));
    }
    Ok(orchestrator)
}

/// Prints one line per backend and fails if any of them reported an error.
pub fn summarize(action: &str, reports: &[UploadReport]) -> Result<()> {
    for report in reports {
        match report.error {
            None => println!("{:<10} {} ok", report.backend.name(), action),
            Some(kind) => println!("{:<10} {} failed ({:?})", report.backend.name(), action, kind),
        }
    }

    let failed = reports.iter().filter(|r| !r.success).count();
    if failed > 0 {
        return Err(anyhow!("{} of {} backends failed", failed, reports.len()));
    }
    info!(backends = reports.len(), "All backends succeeded");
    Ok(())
}
