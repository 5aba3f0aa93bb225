use anyhow::{Result, anyhow};
use clap::Args;

#[derive(Args)]
pub struct ListCommand {
    #[arg(default_value = "", help = "Folder below the remote directory")]
    folder: String,
}

impl ListCommand {
    pub async fn run(&self, cli: &crate::Cli) -> Result<()> {
        let mut orchestrator = super::connect(cli).await?;
        let listings = orchestrator.list_all(&self.folder).await;
        orchestrator.close_all().await;

        let mut failed = 0;
        for (backend, listing) in listings {
            match listing {
                Ok(files) => {
                    println!("{} ({} files)", backend.name(), files.len());
                    for file in files {
                        println!("  {}", file);
                    }
                }
                Err(kind) => {
                    failed += 1;
                    println!("{} failed ({:?})", backend.name(), kind);
                }
            }
        }

        if failed > 0 {
            return Err(anyhow!("{} backends could not be listed", failed));
        }
        Ok(())
    }
}
