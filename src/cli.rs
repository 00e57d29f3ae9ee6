use crate::model::Table;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(
    name = "navidx",
    version,
    about = "Cross-reference serving tables and queries",
    after_help = r#"Examples:
  navidx build --input nodes.jsonl
  navidx request --method decorations --params '{"location":{"ticket":"kythe:?path=src/lib.rs"},"references":true}'
  navidx request --method cross_references --params '{"ticket":["kythe:#main"],"reference_kind":"ALL_REFERENCES"}'
  navidx request --input nodes.jsonl --method stats
  navidx dump --table xrefs --limit 20
  navidx serve
"#
)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Build serving tables from JSONL graph nodes.
    Build {
        /// Graph nodes, one JSON object per line. `-` reads stdin.
        #[arg(long)]
        input: PathBuf,
        #[arg(long)]
        db: Option<PathBuf>,
    },
    /// Run JSONL RPC server over stdin/stdout.
    Serve {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Serve nodes built in memory instead of a store on disk.
        #[arg(long, conflicts_with = "db")]
        input: Option<PathBuf>,
    },
    /// Run a single JSONL request and exit.
    Request {
        #[arg(long)]
        db: Option<PathBuf>,
        /// Serve nodes built in memory instead of a store on disk.
        #[arg(long, conflicts_with = "db")]
        input: Option<PathBuf>,
        #[arg(long)]
        method: String,
        #[arg(long, default_value = "{}")]
        params: String,
        #[arg(long, value_name = "PATH")]
        params_file: Option<PathBuf>,
        #[arg(long, default_value = "1")]
        id: String,
    },
    /// List the tickets stored in one table.
    Dump {
        #[arg(long)]
        db: Option<PathBuf>,
        /// decor or xrefs.
        #[arg(long, default_value = "decor")]
        table: Table,
        #[arg(long)]
        limit: Option<usize>,
    },
}
