use std::path::PathBuf;

use clap::{Parser, Subcommand};
use doccat::processor::DEFAULT_QUEUE;

#[derive(Debug, Parser)]
#[command(
    name = "doccat",
    about = "Inspect and drain the doccat deferred indexing queue"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Operate on the durable action queue
    Queue(QueueArgs),
    /// Validate catalog declarations
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

// -- Queue subcommands --

#[derive(Debug, Parser)]
pub struct QueueArgs {
    /// Name of the queue
    #[arg(long, default_value = DEFAULT_QUEUE)]
    pub queue: String,

    #[command(subcommand)]
    pub action: QueueAction,
}

#[derive(Debug, Subcommand)]
pub enum QueueAction {
    /// Show the queue state and its pending actions
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Create the queue and mark it active
    Engage,
    /// Remove the queue, printing any actions still in it
    Disengage,
    /// Append an action to an engaged queue
    Push {
        catalog: String,
        index: String,
        oid: i64,
        #[arg(
            long,
            default_value = "add",
            value_parser = ["add", "change", "remove"]
        )]
        kind: String,
    },
    /// Pop and print queued actions as JSON lines, then disengage
    Drain(DrainArgs),
}

#[derive(Debug, Parser)]
pub struct DrainArgs {
    /// Keep draining until interrupted
    #[arg(long)]
    pub follow: bool,

    /// Seconds to wait between batches when following
    #[arg(long, default_value = "5")]
    pub sleep: u64,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Merge declaration files and print the resolved index table
    Check {
        /// JSON declaration files, merged in order (default:
        /// `catalogs.json` in the data directory)
        files: Vec<PathBuf>,

        /// Include the system catalog
        #[arg(long)]
        system: bool,
    },
}
