use anyhow::{Context, Result};
use rpn_eval::config::Config;
use std::{env, path::PathBuf, sync::Arc};
use structopt::StructOpt;
use tracing::{info_span, Instrument};
use tracing_subscriber::{filter::LevelFilter, prelude::*, EnvFilter};

#[derive(Debug, Clone, StructOpt)]
/// Evaluate region proposals
struct Args {
    #[structopt(long, default_value = "rpn-eval.json5")]
    /// configuration file
    pub config_file: PathBuf,
    #[structopt(long)]
    /// only write the result file, do not score it
    pub skip_eval: bool,
}

#[tokio::main]
pub async fn main() -> Result<()> {
    // setup tracing
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true).compact();
    let filter_layer = {
        let filter = EnvFilter::from_default_env();
        if env::var("RUST_LOG").is_err() {
            filter.add_directive(LevelFilter::INFO.into())
        } else {
            filter
        }
    };

    tracing_subscriber::registry()
        .with(filter_layer)
        .with(fmt_layer)
        .init();

    // parse arguments
    let Args {
        config_file,
        skip_eval,
    } = Args::from_args();
    let config = Arc::new(
        Config::open(&config_file)
            .with_context(|| format!("failed to load config file '{}'", config_file.display()))?,
    );

    // start evaluation
    rpn_eval::start(config, skip_eval)
        .instrument(info_span!("rpn-eval"))
        .await?;

    Ok(())
}
