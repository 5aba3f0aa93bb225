use anyhow::Result;
use clap::Args;
use offsite_core::obfuscate::obfuscate;

#[derive(Args)]
pub struct ObfuscateCommand {
    #[arg(help = "Secret to encode, e.g. a refresh token")]
    secret: String,
}

impl ObfuscateCommand {
    pub fn run(&self) -> Result<()> {
        println!("{}", obfuscate(&self.secret)?);
        Ok(())
    }
}
