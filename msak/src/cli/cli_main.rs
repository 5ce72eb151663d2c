//! Main CLI entrypoint
// (c) 2025 Ross Younger

use std::sync::Arc;

use clap::Parser as _;
use tracing::debug;

use super::CliArgs;
use crate::config::Configuration;
use crate::results::FileSink;
use crate::server::Server;
use crate::util::setup_tracing;

/// Computes the trace level for a given set of [`CliArgs`]
fn trace_level(args: &CliArgs) -> &'static str {
    if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    }
}

/// Main CLI entrypoint
///
/// Call this from `main`. It reads argv.
pub fn cli() -> anyhow::Result<()> {
    let args = CliArgs::parse();
    setup_tracing(trace_level(&args))?;
    let config = Configuration::load(&args)?;
    debug!("resolved configuration: {config:?}");
    run(config)
}

#[tokio::main]
async fn run(config: Configuration) -> anyhow::Result<()> {
    // Token verification is pluggable; this binary does not bundle a
    // verifier, so refusing is safer than quietly running open.
    anyhow::ensure!(
        !config.token_verify,
        "token.verify requires an access token verifier, which this build does not include"
    );
    let sink = Arc::new(FileSink::new(config.datadir.clone()));
    let server = Server::bind(&config, sink, None).await?;
    server.run().await
}

#[cfg(test)]
mod tests {
    use super::trace_level;
    use crate::cli::CliArgs;
    use pretty_assertions::assert_eq;

    #[test]
    fn trace_levels() {
        let args = CliArgs {
            debug: true,
            ..Default::default()
        };
        assert_eq!(trace_level(&args), "debug");
        let args = CliArgs {
            quiet: true,
            ..Default::default()
        };
        assert_eq!(trace_level(&args), "error");
        assert_eq!(trace_level(&CliArgs::default()), "info");
    }
}
