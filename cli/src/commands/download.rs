use anyhow::{Result, anyhow};
use clap::Args;

#[derive(Args)]
pub struct DownloadCommand {
    #[arg(help = "Path below the remote directory, e.g. world/2024-03-01.zip")]
    remote_path: String,

    #[arg(long, short, help = "Local sub-folder to download into")]
    category: String,
}

impl DownloadCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut orchestrator = super::connect(cli).await?;
        let downloaded = orchestrator.download(&self.remote_path, &self.category).await;
        orchestrator.close_all().await;

        match downloaded {
            Some(path) => {
                println!("Downloaded to {}", path.display());
                Ok(())
            }
            None => Err(anyhow!("No backend could provide {}", self.remote_path)),
        }
    }
}
