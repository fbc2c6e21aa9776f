use std::io;
use std::process::ExitCode;

use clap::Parser;
use tracing::{Level, error, info};

use wrasse::opts::Cli;
use wrasse::pipeline;

fn main() -> ExitCode {
    let cli_args = Cli::parse();

    let quiet = cli_args.quiet;
    if quiet {
        tracing_subscriber::fmt()
            .with_max_level(Level::WARN)
            .with_writer(io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(Level::INFO)
            .with_writer(io::stderr)
            .init();
    }

    let cmd = std::env::args().collect::<Vec<_>>().join(" ");

    let cfg = match cli_args.into_config() {
        Ok(cfg) => cfg,
        Err(e) => {
            error!("{e:#}");
            return ExitCode::from(1);
        }
    };

    let code = match pipeline::run(&cfg) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    };

    info!("version: {}", env!("CARGO_PKG_VERSION"));
    info!("CMD: {}", cmd);
    code
}
