use anyhow::{Result, anyhow};
use clap::Args;
use offsite_core::BackupArtifact;
use std::path::PathBuf;

#[derive(Args)]
pub struct UploadCommand {
    #[arg(help = "Backup archive to upload")]
    file: PathBuf,

    #[arg(long, short, help = "Remote sub-folder, e.g. world or plugins")]
    category: String,
}

impl UploadCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let artifact = BackupArtifact::open(&self.file, &self.category).await?;
        if artifact.category().is_empty() {
            return Err(anyhow!("Category {:?} is empty after sanitizing", self.category));
        }

        let mut orchestrator = super::connect(cli).await?;
        let reports = orchestrator.upload_all(&artifact).await;
        orchestrator.close_all().await;
        super::summarize("upload", &reports)
    }
}
