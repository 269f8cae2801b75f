mod backlight;
#[cfg(feature = "capture")]
mod capture;
mod cli;
#[cfg(feature = "gamma")]
mod color;
mod dispatcher;
#[cfg(feature = "gamma")]
mod gamma;
mod rpc;
mod sampler;
mod sensor;
mod smooth;

use std::process::ExitCode;

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cli::Opts;
use dispatcher::{Daemon, Verdict};

fn run(opts: &Opts) -> Result<Verdict> {
    let mut daemon = Daemon::new(&opts.socket)?;
    info!(
        "lumad {} listening on {}",
        env!("CARGO_PKG_VERSION"),
        opts.socket.display()
    );
    Ok(daemon.run())
}

fn main() -> ExitCode {
    let opts = Opts::parse();

    let filter = EnvFilter::try_from_env("LUMAD_LOG")
        .unwrap_or_else(|_| EnvFilter::new(&opts.log));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(&opts) {
        Ok(Verdict::Shutdown) | Ok(Verdict::Continue) => ExitCode::SUCCESS,
        Ok(Verdict::Fatal) => ExitCode::FAILURE,
        Err(err) => {
            error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}
