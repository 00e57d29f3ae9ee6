use anyhow::{Context, Result};
use clap::Parser;
use navidx::db::{KeyValueWriter, MemoryStore, SqliteStore};
use navidx::service::XRefService;
use navidx::{cli, pipeline, rpc};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

fn default_db_path() -> PathBuf {
    PathBuf::from(".navidx").join("serving.sqlite")
}

fn load_nodes(input: &Path) -> Result<pipeline::PipelineOutput> {
    let (nodes, skipped) = if input == Path::new("-") {
        pipeline::read_nodes(io::stdin().lock())?
    } else {
        let file = File::open(input).with_context(|| format!("open {}", input.display()))?;
        pipeline::read_nodes(BufReader::new(file))?
    };
    if skipped > 0 {
        tracing::warn!(skipped, "malformed input lines skipped");
    }
    Ok(pipeline::run(&nodes))
}

fn memory_service(input: &Path) -> Result<XRefService<MemoryStore>> {
    let output = load_nodes(input)?;
    let store = MemoryStore::new();
    let mut writer = store.writer();
    output.write_to(&mut writer)?;
    writer.close()?;
    Ok(XRefService::open(store)?)
}

fn sqlite_service(db: Option<PathBuf>) -> Result<XRefService<SqliteStore>> {
    let db_path = db.unwrap_or_else(default_db_path);
    let store = SqliteStore::open(&db_path)
        .with_context(|| format!("open serving store {}", db_path.display()))?;
    Ok(XRefService::open(store)?)
}

fn main() -> Result<()> {
    navidx::init_logging();
    let args = cli::Args::parse();

    match args.command {
        cli::Command::Build { input, db } => {
            let db_path = db.unwrap_or_else(default_db_path);
            let output = load_nodes(&input)?;
            let mut writer = SqliteStore::create(&db_path)?;
            output.write_to(&mut writer)?;
            writer.close()?;
            println!("{}", serde_json::to_string_pretty(&output.stats)?);
            Ok(())
        }
        cli::Command::Serve { db, input } => match input {
            Some(input) => rpc::serve(&memory_service(&input)?),
            None => rpc::serve(&sqlite_service(db)?),
        },
        cli::Command::Request {
            db,
            input,
            method,
            params,
            params_file,
            id,
        } => {
            let params_raw = if let Some(path) = params_file {
                std::fs::read_to_string(&path)?
            } else {
                params
            };
            let response = match input {
                Some(input) => rpc::call(&memory_service(&input)?, method, &params_raw, &id)?,
                None => rpc::call(&sqlite_service(db)?, method, &params_raw, &id)?,
            };
            println!("{response}");
            Ok(())
        }
        cli::Command::Dump { db, table, limit } => {
            let service = sqlite_service(db)?;
            for entry in service.entries(table, limit)? {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
    }
}
