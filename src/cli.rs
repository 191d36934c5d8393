use clap::ValueHint;
use url::Url;

use std::path::PathBuf;

#[derive(clap::Parser, Debug, Clone)]
#[command(version, about)]
pub struct Args {
    /// Path to the config file.
    ///
    /// By default, feedqueue looks for a file named `feedqueue.toml` in the following directories
    /// (in order):
    ///
    /// - `./` (the current directory)
    /// - `/etc`
    #[arg(
        short,
        env = "FEEDQUEUE_CONFIG",
        value_hint(ValueHint::FilePath)
    )]
    pub config_path: Option<PathBuf>,

    /// HTTP server address to bind to.
    #[arg(long, env = "FEEDQUEUE_BIND_ADDR")]
    pub bind_addr: Option<String>,

    /// Path to the database file.
    #[arg(long, env = "FEEDQUEUE_DB", value_hint(ValueHint::FilePath))]
    pub db_path: Option<PathBuf>,

    /// Directory the rendered feeds are written to.
    #[arg(long, env = "FEEDQUEUE_OUTPUT_DIR", value_hint(ValueHint::DirPath))]
    pub output_dir: Option<PathBuf>,

    /// Base URL the feeds are reachable at from the outside.
    #[arg(long, env = "FEEDQUEUE_PUBLIC_URL", value_hint(ValueHint::Url))]
    pub public_url: Option<Url>,
}

impl Args {
    pub fn parse() -> Self {
        clap::Parser::parse()
    }
}
