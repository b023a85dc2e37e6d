//! arcwrap - publish web archives as a browsable site
//!
//! ## Commands
//!
//! - `publish`: upload archives, link them into a template and publish the site
//! - `template`: store an empty site directory to use as a template
//! - `inspect`: list the roots and blocks of a CAR file
//! - `history`: show previously published sites

mod history;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arcwrap_core::{
    codec::DAG_PB, read_car, Backend, ContainerPackager, DirectoryNode, FsBackend, InputFile,
    PublishReport, Publisher, SizePolicy, TracingSink, WrapError, WrapperConfig,
    DEFAULT_MANIFEST_NAME, DEFAULT_TEMPLATE,
};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};

use history::{History, HistoryEntry};

#[derive(Parser)]
#[command(name = "arcwrap")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Wrap web archives into a replay site and publish it", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Block store directory
    #[arg(long, global = true, env = "ARCWRAP_STORE", default_value = ".arcwrap/store")]
    store: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload archives and publish them as a site
    Publish(PublishArgs),

    /// Store an empty site directory and print its URL
    Template,

    /// List the roots and blocks of a CAR file
    Inspect {
        /// Path to the container
        path: PathBuf,
    },

    /// Show previously published sites
    History {
        /// History file
        #[arg(long, env = "ARCWRAP_HISTORY", default_value = ".arcwrap/history.json")]
        file: PathBuf,
    },
}

#[derive(Args, Debug, Clone)]
struct PublishArgs {
    /// Archive files to publish (.wacz / .warc)
    #[arg(required = true)]
    files: Vec<PathBuf>,

    /// Template site URL
    #[arg(long, env = "ARCWRAP_TEMPLATE", default_value = DEFAULT_TEMPLATE)]
    template: String,

    /// Link name of the generated manifest
    #[arg(long, env = "ARCWRAP_MANIFEST_NAME", default_value = DEFAULT_MANIFEST_NAME)]
    manifest_name: String,

    /// Where link sizes come from: `local` or `backend`
    #[arg(long, env = "ARCWRAP_SIZE_POLICY", default_value = "local")]
    size_policy: SizePolicy,

    /// Display name for a file, as FILE=NAME (repeatable)
    #[arg(long = "name", value_parser = parse_assignment)]
    names: Vec<(String, String)>,

    /// Description for a file, as FILE=TEXT (repeatable)
    #[arg(long = "description", value_parser = parse_assignment)]
    descriptions: Vec<(String, String)>,

    /// Publish the uploads that succeeded even if some failed
    #[arg(long)]
    allow_partial: bool,

    /// Accept files that are not web archives
    #[arg(long)]
    accept_any: bool,

    /// History file
    #[arg(long, env = "ARCWRAP_HISTORY", default_value = ".arcwrap/history.json")]
    history: PathBuf,
}

impl PublishArgs {
    fn config(&self) -> WrapperConfig {
        WrapperConfig {
            template_url: self.template.clone(),
            manifest_name: self.manifest_name.clone(),
            size_policy: self.size_policy,
            accept_any: self.accept_any,
        }
    }
}

fn parse_assignment(s: &str) -> std::result::Result<(String, String), String> {
    match s.split_once('=') {
        Some((file, value)) if !file.is_empty() => Ok((file.to_string(), value.to_string())),
        _ => Err(format!("expected FILE=VALUE, got {s:?}")),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    arcwrap_core::init_tracing(cli.json, level);

    match cli.command {
        Commands::Publish(args) => {
            let report = cmd_publish(&cli.store, &args).await?;
            print_report(&report);
            Ok(())
        }
        Commands::Template => {
            let url = cmd_template(&cli.store).await?;
            println!("{}", url);
            Ok(())
        }
        Commands::Inspect { path } => cmd_inspect(&path),
        Commands::History { file } => cmd_history(&file),
    }
}

fn open_store(store: &Path) -> Result<Arc<FsBackend>> {
    let backend = FsBackend::new(store).context(format!("Failed to open store {:?}", store))?;
    Ok(Arc::new(backend))
}

async fn read_inputs(args: &PublishArgs) -> Result<Vec<InputFile>> {
    let mut files = Vec::with_capacity(args.files.len());
    for path in &args.files {
        let mut file = InputFile::read(path)
            .await
            .context(format!("Failed to read {:?}", path))?;
        if let Some((_, name)) = args.names.iter().find(|(f, _)| f == file.name()) {
            file = file.with_display_name(name.clone());
        }
        if let Some((_, text)) = args.descriptions.iter().find(|(f, _)| f == file.name()) {
            file = file.with_description(text.clone());
        }
        files.push(file);
    }
    Ok(files)
}

/// Upload, wrap and publish `args.files`, then record the result.
async fn cmd_publish(store: &Path, args: &PublishArgs) -> Result<PublishReport> {
    let backend = open_store(store)?;
    let publisher = Publisher::new(backend, Arc::new(TracingSink), args.config())
        .context("Invalid configuration")?;
    let files = read_inputs(args).await?;

    let report = match publisher.run(files, args.allow_partial).await {
        Ok(report) => report,
        Err(WrapError::IncompleteBatch(batch)) => {
            for rejected in &batch.rejected {
                eprintln!("failed: {}: {}", rejected.source.name, rejected.error);
            }
            anyhow::bail!(
                "{} of {} uploads failed; pass --allow-partial to publish the rest",
                batch.rejected.len(),
                batch.len()
            );
        }
        Err(e) => return Err(e).context("Publish failed"),
    };

    let history = History::new(&args.history);
    let added = history.record(HistoryEntry {
        url: report.outcome.url.clone(),
        published_at: Utc::now(),
        archives: report
            .batch
            .completed
            .iter()
            .map(|u| u.source.name.clone())
            .collect(),
    })?;
    info!(url = %report.outcome.url, new = added, history = ?history.path(), "recorded publish");

    Ok(report)
}

fn print_report(report: &PublishReport) {
    for name in &report.filtered {
        println!("skipped:  {}", name);
    }
    for rejected in &report.batch.rejected {
        println!("failed:   {}: {}", rejected.source.name, rejected.error);
    }
    for archive in &report.outcome.manifest.archives {
        println!("archive:  {} {}", archive.name, archive.url);
    }
    println!("Root:     {}", report.outcome.root);
    println!("Manifest: {}", report.outcome.manifest_url);
    println!("Site:     {}", report.outcome.url);
}

/// Store an empty UnixFS directory and return its URL.
async fn cmd_template(store: &Path) -> Result<String> {
    let backend = open_store(store)?;
    let packaged = ContainerPackager::package(DirectoryNode::empty_unixfs_dir())?;
    let urls = backend
        .publish_container(&packaged.bytes)
        .await
        .context("Failed to store template")?;
    urls.into_iter()
        .next()
        .context("Store returned no template URL")
}

fn cmd_inspect(path: &Path) -> Result<()> {
    let bytes = std::fs::read(path).context(format!("Failed to read {:?}", path))?;
    let car = read_car(&bytes).context(format!("Invalid container {:?}", path))?;

    for root in &car.roots {
        println!("root  {}", root);
    }
    for block in &car.blocks {
        let cid = block.cid();
        if cid.codec() == DAG_PB {
            match DirectoryNode::decode(block.bytes()) {
                Ok(node) => println!(
                    "block {} {} bytes, {} links",
                    cid,
                    block.bytes().len(),
                    node.len()
                ),
                Err(e) => println!("block {} {} bytes, undecodable: {}", cid, block.bytes().len(), e),
            }
        } else {
            println!("block {} {} bytes", cid, block.bytes().len());
        }
    }
    Ok(())
}

fn cmd_history(file: &Path) -> Result<()> {
    let entries = History::new(file).entries()?;
    if entries.is_empty() {
        println!("No published sites in {:?}", file);
        return Ok(());
    }
    for entry in entries {
        println!(
            "{}  {}",
            entry.published_at.format("%Y-%m-%d %H:%M:%S UTC"),
            entry.url
        );
        for archive in &entry.archives {
            println!("    {}", archive);
        }
    }
    Ok(())
}
