//! CLI surface (§6.5). Grounded on the teacher's companion `docs/src/main.rs`
//! (`clap::Parser` derive over a small positional-args struct).

use camino::Utf8PathBuf;
use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "hot", about = "Watch-and-compile supervisor with hot reload")]
pub struct Cli {
    /// Substring filters selecting which configured targets to enable.
    /// With none given, every target is enabled.
    pub filter: Vec<String>,

    /// Path to the watch configuration file.
    #[arg(long, default_value = "hot-watch.json")]
    pub config: Utf8PathBuf,

    /// Increases log verbosity; repeatable.
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,
}
