//! # Merkle Sync CLI (`msync`)
//!
//! The `msync` binary drives both sides of the protocol: it maintains a
//! project's local hash tree and dirty queue, pushes changes to a sync
//! server, and runs that server.
//!
//! ## Usage
//!
//! ```bash
//! msync --config ./config/msync.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `msync init` | Create the SQLite database, run migrations, create the state dir |
//! | `msync snapshot` | Rescan the project, save the tree, mark changed files dirty |
//! | `msync status` | Show the saved root and pending dirty files |
//! | `msync mark <paths..>` | Apply changes to specific files without a full rescan |
//! | `msync sync` | Run root check, Phase 1, and Phase 2 against the server |
//! | `msync serve` | Start the sync server |
//! | `msync token <caller>` | Mint an HMAC credential for a caller |
//! | `msync cache sweep` | Delete expired cache entries |
//! | `msync cache stats` | Count live entries by kind |
//!
//! Logs go to stderr and follow `RUST_LOG` (default
//! `merkle_sync=info,tower_http=info`).

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use merkle_sync::auth::HmacVerifier;
use merkle_sync::client::{SyncClient, SyncState};
use merkle_sync::config::{self, Config};
use merkle_sync::scan::ProjectFilter;
use merkle_sync::sqlite_kv::SqliteKv;
use merkle_sync::state_store::TreeStateStore;
use merkle_sync::watcher::{FileEvent, FileEventKind, WatchPipeline};
use merkle_sync::{db, migrate, server};

/// Merkle Sync CLI: incremental, content-addressed sync of a source tree
/// to a remote code index.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/msync.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "msync",
    about = "Merkle Sync: incremental, content-addressed sync of a source tree to a remote index",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/msync.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema and the project state directory.
    ///
    /// Idempotent: running it multiple times is safe.
    Init,

    /// Rescan the project and reconcile it with the saved snapshot.
    ///
    /// Files that changed since the last snapshot are added to the dirty
    /// queue. Without a usable snapshot every file is marked dirty.
    Snapshot,

    /// Show the saved root, leaf count, and pending dirty files.
    Status,

    /// Apply changes to specific files, as a change watcher would.
    ///
    /// Existing files are rehashed; missing files are removed from the tree.
    Mark {
        /// Files to update (absolute or relative to the project root).
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Push local changes to the sync server.
    Sync,

    /// Start the sync server.
    ///
    /// Requires the HMAC secret in the environment variable named by
    /// `[auth].secret_env`.
    Serve,

    /// Mint a bearer credential for a caller.
    Token {
        /// Caller identity to embed in the credential.
        caller: String,
    },

    /// Maintain the server-side cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },
}

/// Cache maintenance subcommands.
#[derive(Subcommand)]
enum CacheAction {
    /// Delete expired entries.
    Sweep,
    /// Count live fragment, payload, and project-root entries.
    Stats,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "merkle_sync=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => run_init(&cfg).await?,
        Commands::Snapshot => run_snapshot(&cfg)?,
        Commands::Status => run_status(&cfg)?,
        Commands::Mark { paths } => run_mark(&cfg, &paths)?,
        Commands::Sync => run_sync(&cfg).await?,
        Commands::Serve => run_serve(&cfg).await?,
        Commands::Token { caller } => {
            let verifier = HmacVerifier::from_env(&cfg.auth)?;
            println!("{}", verifier.issue(&caller)?);
        }
        Commands::Cache { action } => run_cache(&cfg, action).await?,
    }

    Ok(())
}

fn open_state(cfg: &Config) -> anyhow::Result<(ProjectFilter, TreeStateStore)> {
    let filter = ProjectFilter::from_config(&cfg.project)?;
    let store = TreeStateStore::open(cfg.project.state_path())?;
    Ok((filter, store))
}

async fn run_init(cfg: &Config) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;
    pool.close().await;

    let store = TreeStateStore::open(cfg.project.state_path())?;
    println!("Database initialized at {}", cfg.db.path.display());
    println!("State directory: {}", store.dir().display());
    Ok(())
}

fn run_snapshot(cfg: &Config) -> anyhow::Result<()> {
    let (filter, store) = open_state(cfg)?;
    let pipeline = WatchPipeline::open(filter, store)?;
    let dirty = pipeline.store().dirty();

    println!("root:    {}", pipeline.tree().root());
    println!("files:   {}", pipeline.tree().len());
    println!("dirty:   {}", dirty.pending.len());
    Ok(())
}

fn run_status(cfg: &Config) -> anyhow::Result<()> {
    let (_filter, store) = open_state(cfg)?;
    let Some(snapshot) = store.load() else {
        println!("No snapshot yet. Run `msync snapshot`.");
        return Ok(());
    };
    let dirty = store.dirty();

    println!("project: {}", cfg.project.id);
    println!("root:    {}", snapshot.root);
    println!("files:   {}", snapshot.leaves.len());
    println!("taken:   {}", snapshot.taken_at.to_rfc3339());
    match dirty.last_synced_at {
        Some(at) => println!("synced:  {}", at.to_rfc3339()),
        None => println!("synced:  never"),
    }
    println!("dirty:   {}", dirty.pending.len());
    for id in &dirty.pending {
        println!("  {}", id);
    }
    Ok(())
}

fn run_mark(cfg: &Config, paths: &[PathBuf]) -> anyhow::Result<()> {
    let (filter, store) = open_state(cfg)?;
    let mut pipeline = WatchPipeline::resume(filter, store)?;

    let mut changed = 0;
    for path in paths {
        let absolute = if path.is_absolute() {
            path.clone()
        } else {
            cfg.project.root.join(path)
        };
        let kind = if absolute.exists() {
            FileEventKind::Update
        } else {
            FileEventKind::Delete
        };
        if pipeline.handle_event(&FileEvent::new(absolute, kind))?.is_some() {
            changed += 1;
        }
    }

    println!("changed: {}", changed);
    println!("root:    {}", pipeline.tree().root());
    Ok(())
}

async fn run_sync(cfg: &Config) -> anyhow::Result<()> {
    let (filter, store) = open_state(cfg)?;
    let client = SyncClient::from_config(cfg)?;
    let outcome = client
        .sync(&filter, &store, cfg.project.max_fragment_lines)
        .await?;

    match outcome.state {
        SyncState::UpToDate => println!("Up to date ({})", outcome.root),
        SyncState::FullIndexed => println!(
            "Full index: {} fragments sent, {} already cached, {} bytes",
            outcome.content_fragments, outcome.cached_fragments, outcome.content_bytes
        ),
        SyncState::Synced => println!(
            "Synced: {} fragments checked, {} sent, {} cached, {} bytes",
            outcome.phase1_fragments,
            outcome.content_fragments,
            outcome.cached_fragments,
            outcome.content_bytes
        ),
    }
    println!("root:    {}", outcome.root);
    Ok(())
}

async fn run_serve(cfg: &Config) -> anyhow::Result<()> {
    let verifier = Arc::new(HmacVerifier::from_env(&cfg.auth)?);

    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;
    let kv = Arc::new(SqliteKv::new(pool.clone()));

    let result = server::run_server(cfg, kv, verifier).await;
    pool.close().await;
    result
}

async fn run_cache(cfg: &Config, action: CacheAction) -> anyhow::Result<()> {
    let pool = db::connect(&cfg.db).await?;
    migrate::run_migrations(&pool).await?;
    let kv = SqliteKv::new(pool.clone());

    match action {
        CacheAction::Sweep => {
            let removed = kv.sweep_expired().await?;
            println!("Removed {} expired entries.", removed);
        }
        CacheAction::Stats => {
            println!("fragments: {}", kv.count_prefix("frag:").await?);
            println!("payloads:  {}", kv.count_prefix("payload:").await?);
            println!("projects:  {}", kv.count_prefix("root:").await?);
        }
    }

    pool.close().await;
    Ok(())
}
