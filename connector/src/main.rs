mod app;
mod ingest;
mod model;
mod normalize;
mod pipeline;
mod store;
mod watermark;

/// In-memory feed and store doubles.
#[cfg(test)]
mod testing;

use clap::Parser;
use connector_core::config::TelemetryConfig;
use connector_core::{telemetry, Config, Error, Result};
use std::future::Future;
use std::process;
use tracing::{error, warn};
use watermark::Watermark;

#[derive(Parser, Debug)]
#[clap(name = "otx-connector")]
#[clap(about = "Incremental AlienVault OTX pulse ingestion", version)]
struct Cli {
    /// Resume from this timestamp (ISO-8601), overriding any persisted watermark
    #[clap(long)]
    since: Option<Watermark>,

    /// Ignore the persisted watermark file
    #[clap(long)]
    no_watermark: bool,

    /// Extract and normalize only; nothing is written to storage
    #[clap(long)]
    dry_run: bool,
}

impl From<Cli> for app::RunOptions {
    fn from(cli: Cli) -> Self {
        Self {
            since: cli.since,
            ignore_persisted: cli.no_watermark,
            dry_run: cli.dry_run,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    // Values already in the environment win over the .env file
    let _ = dotenvy::dotenv();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            process::exit(usage_exit_code(&e));
        }
    };

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            let _ = telemetry::init(&TelemetryConfig::default());
            error!(error = %e, "Fatal error: invalid configuration");
            process::exit(Error::Config(e.to_string()).exit_code());
        }
    };

    if let Err(e) = telemetry::init(&config.telemetry) {
        eprintln!("[warn] telemetry setup failed: {e}");
    }

    let code = until_interrupted(run(config, cli.into()), tokio::signal::ctrl_c()).await;

    telemetry::shutdown();
    process::exit(code);
}

/// `--help`/`--version` exit 0; any other argument error is a fatal error.
fn usage_exit_code(e: &clap::Error) -> i32 {
    if e.use_stderr() {
        1
    } else {
        0
    }
}

/// Drives `run` to completion unless `interrupt` fires first. A signal
/// listener that fails to install is logged and the run carries on.
async fn until_interrupted<R, S>(run: R, interrupt: S) -> i32
where
    R: Future<Output = Result<()>>,
    S: Future<Output = std::io::Result<()>>,
{
    let mut run = std::pin::pin!(run);
    let mut interrupt = std::pin::pin!(interrupt);
    let mut listening = true;

    loop {
        tokio::select! {
            result = &mut run => {
                return match result {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(error = %e, "Fatal error");
                        e.exit_code()
                    }
                };
            }
            signal = &mut interrupt, if listening => match signal {
                Ok(()) => {
                    warn!("Interrupted by user.");
                    return Error::Interrupted.exit_code();
                }
                Err(e) => {
                    warn!(error = %e, "Could not listen for Ctrl-C");
                    listening = false;
                }
            },
        }
    }
}

async fn run(config: Config, options: app::RunOptions) -> Result<()> {
    let app = app::App::new(config)?;
    app.run(&options).await?;
    Ok(())
}
