use clap::Subcommand;
use color_eyre::eyre::Result;

pub mod generate;

/// Manage keys
#[derive(Subcommand, Clone, Debug)]
pub enum KeysCmd {
    /// Generate a new signing key
    Generate(generate::GenerateCmd),
}

impl KeysCmd {
    pub fn run(&self) -> Result<()> {
        match self {
            KeysCmd::Generate(cmd) => cmd.run(),
        }
    }
}
