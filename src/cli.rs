use clap::{Parser, Subcommand};

/// nimbus cli
#[derive(Parser)]
#[command(name = "nimbus")]
#[command(about = "Distributed, politeness-aware web crawler")]
#[command(version)]
pub struct Cli {
    /// config file (environment variables override it)
    #[arg(
        short,
        long,
        default_value = "configs/development.yaml",
        help = "Path to the YAML config file"
    )]
    pub config: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the crawl workers that drain the frontier stream
    Crawler,

    /// Run the parse workers that drain the parse stream
    Parser,

    /// Publish a file of seed URLs onto the frontier
    Seed {
        /// seed file, one URL per line ('#' starts a comment)
        #[arg(short, long, default_value = "seeds.txt")]
        file: String,
    },
}

impl Cli {
    /// parse args
    pub fn parse_args() -> Self {
        Self::parse()
    }
}
