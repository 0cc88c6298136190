use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
pub struct Args {
    /// Verbose mode (-v, --verbose)
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example fsbench.toml to the current directory
    Init,

    /// Run a benchmark campaign
    Run {
        /// Path to the campaign configuration file
        #[arg(short, long, default_value = "./fsbench.toml")]
        config: String,

        /// Run only the named filesystems
        #[arg(long, num_args = 1..)]
        filesystems: Vec<String>,

        /// Run only the named workloads
        #[arg(long, num_args = 1..)]
        workloads: Vec<String>,
    },

    /// Re-aggregate an existing results directory into a report
    Aggregate {
        /// Path to the campaign configuration file
        #[arg(short, long, default_value = "./fsbench.toml")]
        config: String,
    },
}

pub fn parse() -> Args {
    Args::parse()
}
