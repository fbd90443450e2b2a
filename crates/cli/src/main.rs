use color_eyre::eyre::Result;
use tracing::{error, info, trace};

use pricefeed_config::{Config, RuntimeConfig};

use crate::args::{Args, Commands};
use crate::cmd::init::InitCmd;
use crate::cmd::keys::KeysCmd;
use crate::cmd::start::StartCmd;

mod args;
mod cmd;
mod logging;
mod metrics;

pub fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::new();
    let config = args.load_config();
    let logging = config
        .as_ref()
        .map(|c| c.logging)
        .unwrap_or_default();

    logging::init(logging.log_level, logging.log_format);

    trace!("Command-line parameters: {args:?}");

    match &args.command {
        Commands::Start(cmd) => {
            let config = config.map_err(|e| {
                error!("Failed to load configuration: {e}");
                e
            })?;

            info!(
                "Loaded configuration from {:?}",
                args.get_config_file_path().unwrap_or_default().display()
            );

            start(&args, config, cmd)
        }
        Commands::Init(cmd) => init(&args, cmd),
        Commands::Keys(cmd) => keys(cmd),
    }
}

fn start(args: &Args, cfg: Config, cmd: &StartCmd) -> Result<()> {
    use tokio::runtime::Builder as RtBuilder;

    let mut builder = match cfg.runtime {
        RuntimeConfig::SingleThreaded => RtBuilder::new_current_thread(),
        RuntimeConfig::MultiThreaded { worker_threads } => {
            let mut builder = RtBuilder::new_multi_thread();
            if worker_threads > 0 {
                builder.worker_threads(worker_threads);
            }
            builder
        }
    };

    let rt = builder.enable_all().build()?;
    rt.block_on(cmd.run(cfg, &args.get_key_file_path()?))
}

fn init(args: &Args, cmd: &InitCmd) -> Result<()> {
    let logging = pricefeed_config::LoggingConfig {
        log_level: args.get_log_level_or_default(),
        log_format: args.log_format.unwrap_or_default(),
    };

    cmd.run(
        &args.get_config_file_path()?,
        &args.get_key_file_path()?,
        logging,
    )
}

fn keys(cmd: &KeysCmd) -> Result<()> {
    cmd.run()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::PathBuf;

    use clap::Parser;
    use color_eyre::eyre;

    use super::*;

    #[test]
    fn running_init_creates_config_files() -> eyre::Result<()> {
        let tmp = tempfile::tempdir()?;
        let config_dir = tmp.path().join("config");

        let args = Args::parse_from([
            "test",
            "--home",
            tmp.path().to_str().unwrap(),
            "init",
            "--feeder",
        ]);

        let Commands::Init(ref cmd) = args.command else {
            panic!("not init command");
        };

        init(&args, cmd)?;

        let files = fs::read_dir(&config_dir)?.flatten().collect::<Vec<_>>();

        assert!(has_file(&files, &config_dir.join("config.toml")));
        assert!(has_file(&files, &config_dir.join("node_key.hex")));

        let config = args.load_config()?;
        assert_eq!(config.p2p.listen_addrs.len(), 1);

        Ok(())
    }

    #[test]
    fn relay_init_creates_no_key() -> eyre::Result<()> {
        let tmp = tempfile::tempdir()?;

        let args = Args::parse_from(["test", "--home", tmp.path().to_str().unwrap(), "init"]);
        init(&args, &InitCmd::default())?;

        assert!(args.get_config_file_path()?.exists());
        assert!(!args.get_key_file_path()?.exists());

        Ok(())
    }

    fn has_file(files: &[fs::DirEntry], path: &PathBuf) -> bool {
        files.iter().any(|f| &f.path() == path)
    }
}
