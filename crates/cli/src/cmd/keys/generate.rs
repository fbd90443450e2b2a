use std::path::PathBuf;

use color_eyre::eyre::Result;
use tracing::info;

use pricefeed_oracle::Signer;

#[derive(clap::Args, Clone, Debug)]
pub struct GenerateCmd {
    #[clap(short, long, value_name = "OUTPUT_FILE")]
    output: PathBuf,
}

impl GenerateCmd {
    pub fn run(&self) -> Result<()> {
        let signer = Signer::random();

        info!(address = %signer.address(), "Generated key");
        info!(peer_id = %signer.peer_id()?, "Network identity");

        info!("Saving private key to {:?}", self.output);
        signer.write_file(&self.output)?;

        Ok(())
    }
}
