use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::FmtSubscriber;

use pricefeed_config::{LogFormat, LogLevel};

pub fn init(log_level: LogLevel, log_format: LogFormat) {
    let log_level = if let Ok(rust_log) = std::env::var("RUST_LOG") {
        rust_log
    } else {
        log_level.to_string()
    };

    let filter = build_tracing_filter(&log_level);

    let builder = FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_ansi(enable_ansi())
        .with_thread_ids(false);

    match log_format {
        LogFormat::Plaintext => builder.finish().init(),
        LogFormat::Json => builder.json().finish().init(),
    };
}

/// Check if both stdout and stderr are proper terminal (tty),
/// so that we know whether or not to enable colored output,
/// using ANSI escape codes. If either is not, eg. because
/// stdout is redirected to a file, we don't enable colored output.
pub fn enable_ansi() -> bool {
    use std::io::IsTerminal;
    std::io::stdout().is_terminal() && std::io::stderr().is_terminal()
}

/// Common prefixes of the crates targeted by the default log level.
const TARGET_CRATES: &[&str] = &["pricefeed", "libp2p_gossipsub"];

/// Build a tracing directive setting the log level for our crates to `log_level`.
pub fn default_directive(log_level: &str) -> String {
    use itertools::Itertools;

    TARGET_CRATES
        .iter()
        .map(|&c| format!("{c}={log_level}"))
        .join(",")
}

/// Builds a tracing filter from a comma-separated list of levels or directives.
/// A bare level applies to our crates only.
fn build_tracing_filter(log_levels: &str) -> EnvFilter {
    let mut filter = EnvFilter::from_default_env();

    for log_level in log_levels.split(',').filter(|l| !l.is_empty()) {
        let directives = if log_level.contains('=') {
            log_level.to_string()
        } else {
            default_directive(log_level)
        };

        for directive in directives.split(',') {
            match directive.parse() {
                Ok(directive) => filter = filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring invalid log directive '{directive}': {e}"),
            }
        }
    }

    filter
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_level_targets_our_crates() {
        assert_eq!(
            default_directive("debug"),
            "pricefeed=debug,libp2p_gossipsub=debug"
        );
    }

    #[test]
    fn filter_keeps_explicit_directives() {
        let filter = build_tracing_filter("warn,libp2p_swarm=trace");
        let rendered = filter.to_string();

        assert!(rendered.contains("pricefeed=warn"));
        assert!(rendered.contains("libp2p_swarm=trace"));
    }
}
