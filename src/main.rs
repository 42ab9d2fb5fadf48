use std::path::PathBuf;

use clap::Parser;
use tracing::error;

use auditmux::app;
use auditmux::config::Config;

#[derive(Debug, Parser)]
#[command(name = "auditmux", about = "Audit event collection and forwarding daemon")]
struct Opts {
    /// Path to the configuration file.
    #[arg(short, long, default_value = "/etc/auditmux/auditmux.toml")]
    config: PathBuf,

    /// Override the data directory from the config file.
    #[arg(long)]
    data_dir: Option<PathBuf>,
}

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
}

fn main() {
    let opts = Opts::parse();
    init_logging();

    let mut config = if opts.config.exists() {
        match Config::load(&opts.config) {
            Ok(config) => config,
            Err(error) => {
                error!(%error, "Invalid configuration.");
                std::process::exit(exitcode::CONFIG);
            }
        }
    } else {
        Config::default()
    };
    if let Some(data_dir) = opts.data_dir {
        config.queue.data_dir = data_dir;
    }

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(error) => {
            error!(%error, "Failed to start the runtime.");
            std::process::exit(exitcode::OSERR);
        }
    };

    if let Err(error) = runtime.block_on(app::run(config)) {
        error!(%error, "Initialization failed.");
        std::process::exit(exitcode::SOFTWARE);
    }
}
