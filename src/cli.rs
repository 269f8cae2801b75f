use clap::Parser;
use std::path::PathBuf;

#[derive(Parser, Debug, Clone)]
#[command(
    name = "lumad",
    version,
    about = "Hardware control daemon: screen temperature, backlight, light sensors"
)]
pub struct Opts {
    /// Path of the Unix control socket
    #[arg(long = "socket", default_value = "/run/lumad.sock")]
    pub socket: PathBuf,

    /// Log filter (overridden by LUMAD_LOG)
    #[arg(long = "log", default_value = "info")]
    pub log: String,
}
