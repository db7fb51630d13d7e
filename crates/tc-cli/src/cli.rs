use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tc_types::{Index, IndexEntry};

#[derive(Parser)]
#[command(
    name = "tc",
    about = "tensorchunk: chunked tensor storage",
    version,
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// Dataset root directory
    #[arg(long, global = true, default_value = ".")]
    pub root: PathBuf,

    /// Engine settings (TOML)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Command {
    /// Create an empty tensor
    Create(CreateArgs),
    /// Append files as samples
    Append(AppendArgs),
    /// Append links to external resources
    Link(LinkArgs),
    /// Show tensor metadata and byte counters
    Info(InfoArgs),
    /// Read samples
    Read(ReadArgs),
    /// Remove the last samples
    Pop(PopArgs),
    /// Manage link credential keys
    Creds(CredsArgs),
    /// Report credential keys that stored links need but nobody populated
    CheckLinks,
}

#[derive(Args)]
pub struct CreateArgs {
    pub tensor: String,
    /// e.g. `image`, `video`, `link[image]`
    #[arg(long)]
    pub htype: Option<String>,
    #[arg(long)]
    pub dtype: Option<String>,
    #[arg(long)]
    pub sample_compression: Option<String>,
    #[arg(long)]
    pub chunk_compression: Option<String>,
    #[arg(long)]
    pub max_chunk_size: Option<u64>,
    /// Link tensors: skip probing linked resources at append time
    #[arg(long)]
    pub no_verify: bool,
}

#[derive(Args)]
pub struct AppendArgs {
    pub tensor: String,
    #[arg(required = true)]
    pub files: Vec<PathBuf>,
}

#[derive(Args)]
pub struct LinkArgs {
    pub tensor: String,
    #[arg(required = true)]
    pub paths: Vec<String>,
    #[arg(long)]
    pub creds_key: Option<String>,
}

#[derive(Args)]
pub struct InfoArgs {
    pub tensor: String,
}

#[derive(Args)]
pub struct ReadArgs {
    pub tensor: String,
    /// Comma-separated axes, e.g. `3`, `0:4`, `2,::2,1`
    #[arg(value_parser = parse_index)]
    pub index: Index,
    /// Return stored bytes without decompressing
    #[arg(long)]
    pub raw: bool,
    /// Print the stored path instead of the data (link tensors)
    #[arg(long)]
    pub path: bool,
}

#[derive(Args)]
pub struct PopArgs {
    pub tensor: String,
    #[arg(short = 'n', long, default_value = "1")]
    pub count: u64,
}

#[derive(Args)]
pub struct CredsArgs {
    #[command(subcommand)]
    pub action: Option<CredsAction>,
}

#[derive(Subcommand)]
pub enum CredsAction {
    /// Declare a credential key
    Add {
        key: String,
        #[arg(long)]
        managed: bool,
    },
}

/// Parse `a`, `a:b`, `a:b:c` (any part optional) per axis, comma-separated.
pub fn parse_index(s: &str) -> Result<Index, String> {
    let entries = s
        .split(',')
        .map(|part| parse_entry(part.trim()))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Index::new(entries))
}

fn parse_entry(s: &str) -> Result<IndexEntry, String> {
    if !s.contains(':') {
        return s
            .parse::<i64>()
            .map(IndexEntry::Int)
            .map_err(|e| format!("bad index `{s}`: {e}"));
    }
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() > 3 {
        return Err(format!("bad slice `{s}`"));
    }
    let bound = |i: usize| -> Result<Option<i64>, String> {
        match parts.get(i).map(|p| p.trim()) {
            None | Some("") => Ok(None),
            Some(p) => p
                .parse::<i64>()
                .map(Some)
                .map_err(|e| format!("bad slice bound `{p}`: {e}")),
        }
    };
    Ok(IndexEntry::Slice {
        start: bound(0)?,
        stop: bound(1)?,
        step: bound(2)?,
    })
}
