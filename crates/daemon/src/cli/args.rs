pub use clap::Parser;

use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "livesite")]
#[command(about = "Serve a directory of pages, templates and scripts, reloading browsers on change")]
#[command(version)]
pub struct Args {
    /// Path to a livesite.toml (defaults to ./livesite.toml when present)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Defaults to `serve`
    #[command(subcommand)]
    pub command: Option<crate::Command>,
}
