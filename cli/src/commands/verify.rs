use anyhow::Result;
use clap::Args;
use offsite_core::BackupArtifact;
use std::path::PathBuf;

#[derive(Args)]
pub struct VerifyCommand {
    #[arg(help = "Small file to upload as a connectivity check")]
    file: PathBuf,
}

impl VerifyCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let artifact = BackupArtifact::open(&self.file, "").await?;
        let mut orchestrator = super::connect(cli).await?;

        let reports = orchestrator.test_all(&artifact).await;
        orchestrator.close_all().await;
        super::summarize("test", &reports)
    }
}
