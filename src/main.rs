// src/main.rs
// Thin CLI over the mira_memory library: owns process exit codes, console
// formatting, and logging setup. All actual behavior lives in the library.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

use mira_types::SourceKind;

use mira_memory::db::pool::PoolOptions;
use mira_memory::embed::EmbeddingClient;
use mira_memory::orchestrator::TranscriptFolder;
use mira_memory::search::SearchFilter;
use mira_memory::{Config, DatabasePool, GlobalIndex, IndexOrchestrator};

#[derive(Parser)]
#[command(name = "mira-memory")]
#[command(about = "Local conversation-memory engine for AI coding agents")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Emit machine-readable JSON instead of human-readable text.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Index a project's transcript folders.
    Index {
        /// Project path (default: current directory).
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Explicit transcript source in `path=source-kind` form (source-kind is
        /// `assistant-a` or `assistant-b`). May be repeated. Defaults to the
        /// conventional per-assistant session directories under the home folder
        /// when omitted.
        #[arg(long = "source", value_name = "PATH=KIND")]
        sources: Vec<String>,
    },

    /// Search indexed conversations for a project.
    Search {
        /// Project path (default: current directory).
        #[arg(short, long)]
        path: Option<PathBuf>,

        /// Query text.
        query: String,

        /// Maximum number of results.
        #[arg(short, long, default_value_t = 10)]
        limit: usize,

        /// Search across every registered project instead of just one.
        #[arg(long)]
        all_projects: bool,
    },

    /// Print store statistics for a project.
    Stats {
        /// Project path (default: current directory).
        #[arg(short, long)]
        path: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env from ~/.config/mira-memory/.env only, never from the CWD — a
    // malicious repo could otherwise override API keys.
    if let Some(home) = dirs::home_dir()
        && let Err(e) = dotenvy::from_path(home.join(".config/mira-memory/.env"))
    {
        tracing::debug!("no global .env file loaded: {e}");
    }

    let cli = Cli::parse();

    let log_level = match &cli.command {
        Commands::Index { .. } => Level::INFO,
        Commands::Search { .. } | Commands::Stats { .. } => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).with_writer(std::io::stderr).with_ansi(false).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    match cli.command {
        Commands::Index { path, sources } => run_index(path, sources, cli.json).await,
        Commands::Search { path, query, limit, all_projects } => run_search(path, query, limit, all_projects, cli.json).await,
        Commands::Stats { path } => run_stats(path, cli.json).await,
    }
}

fn resolve_project_dir(path: Option<PathBuf>) -> anyhow::Result<PathBuf> {
    let dir = path.unwrap_or(std::env::current_dir()?);
    Ok(dir)
}

fn global_index_path() -> PathBuf {
    dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config/mira-memory/global-index.sqlite3")
}

fn project_db_path(config: &Config, project_dir: &Path) -> PathBuf {
    if let Some(explicit) = &config.store.db_path {
        return explicit.clone();
    }
    match config.store.db_mode {
        mira_memory::config::DbMode::Single => {
            dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")).join(".config/mira-memory/store.sqlite3")
        }
        mira_memory::config::DbMode::PerProject => project_dir.join(".mira-memory").join("store.sqlite3"),
    }
}

/// Conventional per-assistant transcript directories, keyed off a sanitized
/// encoding of the project's canonical path. Neither assistant ships a
/// documented discovery API, so this mirrors the common on-disk convention:
/// a `projects` directory under the assistant's home folder, one subfolder
/// per project, named by replacing path separators with dashes.
fn default_transcript_folders(project_dir: &Path) -> Vec<TranscriptFolder> {
    let Some(home) = dirs::home_dir() else { return Vec::new() };
    let Ok(canonical) = std::fs::canonicalize(project_dir) else { return Vec::new() };
    let slug = canonical.to_string_lossy().trim_start_matches('/').replace(['/', '.'], "-");

    [(SourceKind::AssistantA, ".assistant-a"), (SourceKind::AssistantB, ".assistant-b")]
        .into_iter()
        .map(|(source_kind, home_dir)| TranscriptFolder { path: home.join(home_dir).join("projects").join(&slug), source_kind })
        .collect()
}

fn parse_source_flag(raw: &str) -> anyhow::Result<TranscriptFolder> {
    let (path_str, kind_str) = raw.split_once('=').ok_or_else(|| anyhow::anyhow!("--source must be PATH=KIND, got {raw:?}"))?;
    let source_kind = match kind_str {
        "assistant-a" => SourceKind::AssistantA,
        "assistant-b" => SourceKind::AssistantB,
        other => anyhow::bail!("unknown source kind {other:?}, expected assistant-a or assistant-b"),
    };
    Ok(TranscriptFolder { path: PathBuf::from(path_str), source_kind })
}

async fn run_index(path: Option<PathBuf>, sources: Vec<String>, json: bool) -> anyhow::Result<()> {
    let project_dir = resolve_project_dir(path)?;
    let config = Config::load(Some(&project_dir));

    let transcript_folders = if sources.is_empty() {
        default_transcript_folders(&project_dir)
    } else {
        sources.iter().map(|s| parse_source_flag(s)).collect::<anyhow::Result<Vec<_>>>()?
    };

    let db_path = project_db_path(&config, &project_dir);
    let pool_opts = PoolOptions { cache_size_kb: config.store.cache_size_kb, mmap_size: config.store.mmap_size };
    let pool = Arc::new(DatabasePool::open(&db_path, pool_opts).await?);

    let mut embedder = EmbeddingClient::from_config(&config).await;
    embedder.initialize().await;

    let global_index = GlobalIndex::open(&global_index_path())?;
    let orchestrator = IndexOrchestrator::new(Arc::clone(&pool), embedder, config);

    match orchestrator.index_project(&project_dir, &transcript_folders, &global_index).await {
        Ok(result) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                    "success": result.success,
                    "indexed_folders": result.indexed_folders,
                    "db_path": result.db_path,
                    "conversations": result.stats.conversations,
                    "messages": result.stats.messages,
                    "decisions": result.stats.decisions,
                    "mistakes": result.stats.mistakes,
                    "embeddings_generated": result.embeddings_generated,
                    "embedding_error": result.embedding_error,
                }))?);
            } else {
                println!(
                    "Indexed {} folder(s): {} conversations, {} messages, {} decisions, {} mistakes",
                    result.indexed_folders.len(),
                    result.stats.conversations,
                    result.stats.messages,
                    result.stats.decisions,
                    result.stats.mistakes,
                );
                if !result.embeddings_generated {
                    if let Some(err) = &result.embedding_error {
                        eprintln!("warning: embeddings not generated ({err}); search will be FTS-only");
                    }
                }
            }
            Ok(())
        }
        Err(e) => {
            eprintln!("index failed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_search(path: Option<PathBuf>, query: String, limit: usize, all_projects: bool, json: bool) -> anyhow::Result<()> {
    let project_dir = resolve_project_dir(path)?;
    let config = Config::load(Some(&project_dir));

    let mut embedder = EmbeddingClient::from_config(&config).await;
    embedder.initialize().await;

    if all_projects {
        let global_index = GlobalIndex::open(&global_index_path())?;
        let result = global_index.search_all(&embedder, &query, limit, &config.chunking, &config.rerank).await?;
        if json {
            println!("{}", serde_json::to_string_pretty(&serde_json::json!({
                "projects_searched": result.projects_searched,
                "projects_succeeded": result.projects_succeeded,
                "failed_projects": result.failed_projects,
                "hits": result.hits.iter().map(|(project, hit)| serde_json::json!({
                    "project": project,
                    "message_id": hit.message_id,
                    "conversation_id": hit.conversation_id,
                    "similarity": hit.similarity,
                    "snippet": hit.snippet,
                })).collect::<Vec<_>>(),
            }))?);
        } else {
            for (project, hit) in &result.hits {
                println!("[{:.3}] {project}: {}", hit.similarity, hit.snippet);
            }
            if !result.failed_projects.is_empty() {
                eprintln!("warning: {} project(s) could not be searched: {:?}", result.failed_projects.len(), result.failed_projects);
            }
        }
        return Ok(());
    }

    let config_for_pool = config.clone();
    let db_path = project_db_path(&config_for_pool, &project_dir);
    let pool_opts = PoolOptions { cache_size_kb: config.store.cache_size_kb, mmap_size: config.store.mmap_size };
    let pool = Arc::new(DatabasePool::open(&db_path, pool_opts).await?);
    let search = mira_memory::search::SemanticSearch::new(pool, embedder, &config.chunking, &config.rerank);

    let hits = search.search_conversations(&query, limit, &SearchFilter::default(), None).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&hits.iter().map(|hit| serde_json::json!({
            "message_id": hit.message_id,
            "conversation_id": hit.conversation_id,
            "similarity": hit.similarity,
            "snippet": hit.snippet,
        })).collect::<Vec<_>>())?);
    } else if hits.is_empty() {
        println!("no results");
    } else {
        for hit in &hits {
            println!("[{:.3}] conversation {}: {}", hit.similarity, hit.conversation_id, hit.snippet);
        }
    }
    Ok(())
}

async fn run_stats(path: Option<PathBuf>, json: bool) -> anyhow::Result<()> {
    let project_dir = resolve_project_dir(path)?;
    let config = Config::load(Some(&project_dir));
    let db_path = project_db_path(&config, &project_dir);
    let pool_opts = PoolOptions { cache_size_kb: config.store.cache_size_kb, mmap_size: config.store.mmap_size };
    let pool = DatabasePool::open(&db_path, pool_opts).await?;
    let stats = pool.run(mira_memory::db::store::stats).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&serde_json::json!({
            "projects": stats.projects,
            "conversations": stats.conversations,
            "messages": stats.messages,
            "decisions": stats.decisions,
            "mistakes": stats.mistakes,
            "requirements": stats.requirements,
            "validations": stats.validations,
            "chunks": stats.chunks,
            "git_commits": stats.git_commits,
        }))?);
    } else {
        println!(
            "projects: {}\nconversations: {}\nmessages: {}\ndecisions: {}\nmistakes: {}\nrequirements: {}\nvalidations: {}\nchunks: {}\ngit_commits: {}",
            stats.projects, stats.conversations, stats.messages, stats.decisions, stats.mistakes,
            stats.requirements, stats.validations, stats.chunks, stats.git_commits,
        );
    }
    Ok(())
}
