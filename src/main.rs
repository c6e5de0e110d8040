use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};

use pampax::config::load_config;
use pampax::retrieval::SearchScope;

fn spinner() -> ProgressBar {
    let bar = ProgressBar::new_spinner();
    bar.set_style(
        ProgressStyle::with_template("{spinner} {msg}")
            .unwrap()
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]),
    );
    bar.enable_steady_tick(std::time::Duration::from_millis(80));
    bar
}

#[derive(Debug, Parser)]
#[command(name = "pampax")]
#[command(version)]
#[command(about = "Local, git-friendly semantic code memory")]
struct Cli {
    /// Repo root to operate on (defaults to the current directory)
    #[arg(long, global = true)]
    path: Option<PathBuf>,

    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Build a fresh index of the whole repo
    Index {
        /// Embedding provider: transformers (local, default), ollama, openai, cohere, auto
        #[arg(long)]
        provider: Option<String>,
    },
    /// Incrementally reindex specific files
    Update {
        /// Files to (re)index; files that no longer exist are treated as deletions
        files: Vec<PathBuf>,
        #[arg(long)]
        provider: Option<String>,
    },
    /// Watch the repo and reindex on change
    Watch {
        #[arg(long)]
        provider: Option<String>,
    },
    /// Run a hybrid search query
    Search {
        query: String,
        #[arg(long)]
        provider: Option<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long = "path-glob")]
        path_glob: Vec<String>,
        #[arg(long)]
        tags: Vec<String>,
        #[arg(long)]
        lang: Vec<String>,
        /// Apply a saved context pack (merged under any explicit scope flags above)
        #[arg(long = "context-pack")]
        context_pack: Option<String>,
    },
    /// Print indexing stats (chunk/file counts, providers in use)
    Stats,
    /// Print the per-file symbol overview from the codemap
    Overview,
    /// List saved context packs
    ContextPacks,
}

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();
    let repo_root = match cli.path {
        Some(p) => p,
        None => std::env::current_dir().context("failed to get current dir")?,
    };
    let config = load_config(&repo_root);

    match cli.cmd {
        Command::Index { provider } => {
            let bar = spinner();
            bar.set_message("indexing repository...");
            let stats = pampax::index(&repo_root, provider.as_deref(), &config).await?;
            bar.finish_with_message(format!("indexed {} chunk(s)", stats.processed_chunks));
            println!("{}", serde_json::to_string_pretty(&pretty_stats(&stats))?);
        }
        Command::Update { files, provider } => {
            let (changed, deleted): (Vec<PathBuf>, Vec<PathBuf>) = files.into_iter().partition(|f| f.exists());
            let bar = spinner();
            bar.set_message("reindexing changed files...");
            let stats = pampax::update(&repo_root, provider.as_deref(), &config, changed, deleted).await?;
            bar.finish_with_message(format!("indexed {} chunk(s)", stats.processed_chunks));
            println!("{}", serde_json::to_string_pretty(&pretty_stats(&stats))?);
        }
        Command::Watch { provider } => {
            let handle = pampax::watch(&repo_root, provider.as_deref(), config, |batch| {
                eprintln!("watch: {} changed, {} deleted", batch.changed.len(), batch.deleted.len());
            })
            .await?;
            eprintln!("watching {} (ctrl-c to stop)", repo_root.display());
            tokio::signal::ctrl_c().await.context("failed to listen for ctrl-c")?;
            handle.close().await;
        }
        Command::Search { query, provider, limit, path_glob, tags, lang, context_pack } => {
            let scope = SearchScope { path_glob, tags, lang, ..Default::default() };
            let results = match context_pack {
                Some(pack) => pampax::search_with_context_pack(&repo_root, provider.as_deref(), &config, &query, limit, scope, &pack).await?,
                None => pampax::search(&repo_root, provider.as_deref(), &config, &query, limit, scope).await?,
            };
            println!("{}", serde_json::to_string_pretty(&results.into_iter().map(pretty_result).collect::<Vec<_>>())?);
        }
        Command::Stats => {
            let stats = pampax::get_stats(&repo_root)?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Overview => {
            let overview = pampax::get_overview(&repo_root)?;
            println!("{}", serde_json::to_string_pretty(&overview)?);
        }
        Command::ContextPacks => {
            let packs = pampax::list_context_packs(&repo_root)?;
            println!("{}", serde_json::to_string_pretty(&packs)?);
        }
    }

    Ok(())
}

fn pretty_stats(stats: &pampax::indexer::IndexStats) -> serde_json::Value {
    serde_json::json!({
        "processedChunks": stats.processed_chunks,
        "totalChunks": stats.total_chunks,
        "provider": stats.provider,
        "errors": stats.errors,
    })
}

fn pretty_result(r: pampax::retrieval::SearchResult) -> serde_json::Value {
    serde_json::json!({
        "chunkId": r.chunk_id,
        "symbol": r.symbol,
        "filePath": r.file_path,
        "score": r.score,
        "searchType": r.search_type,
    })
}
