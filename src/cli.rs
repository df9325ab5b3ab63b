use std::path::PathBuf;

use clap::{Parser, Subcommand};

#[derive(Debug, Parser)]
#[command(
    name = "folioscan",
    about = "Full-text search over uploaded documents, located down to the line"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Store and index documents (.pdf or .txt)
    Index(IndexArgs),
    /// Remove a stored document and its pages
    Remove {
        /// Filename as listed by `folioscan list`
        filename: String,
    },
    /// List stored documents
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show system status and statistics
    Status {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Re-index every stored document from scratch
    Rebuild,
    /// Search stored documents, printing matches as they are found
    Search(SearchArgs),
    /// Serve search sessions over stdin/stdout as JSON lines
    Serve,
    /// Show or change settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Debug, Parser)]
pub struct IndexArgs {
    /// Files to add
    #[arg(required = true)]
    pub paths: Vec<PathBuf>,

    /// User recorded in the audit log
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Output events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// User recorded in the audit log
    #[arg(long)]
    pub user: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Print every setting with its effective value
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in the catalog
    Set { key: String, value: String },
    /// Clear a stored setting (revert to default)
    Unset { key: String },
}
