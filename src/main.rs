use anyhow::Result;
use clap::{Parser, Subcommand};
use kbvault::cache::QueryVectorCache;
use kbvault::db::{Db, MutationQueue};
use kbvault::embeddings::build_embedder;
use kbvault::ingest::IngestionPipeline;
use kbvault::kb::{KnowledgeBaseService, ScanState};
use kbvault::notify::Notifier;
use kbvault::scan::{ChangeDetector, ScanScheduler};
use kbvault::search::RetrievalRanker;
use kbvault::store::Store;
use kbvault::Config;
use log::LevelFilter;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Parser, Debug)]
#[command(name = "kbvault")]
#[command(about = "Local knowledge bases: change detection, loading and similarity search")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Register a directory as a knowledge base and scan it
    Add { dir: PathBuf },
    /// Run one change-detection pass over every knowledge base
    Scan,
    /// Run one change-detection pass, then load every pending document
    Load,
    /// Run the background scheduler until Enter is pressed or the time is up
    Run {
        #[arg(long)]
        seconds: Option<u64>,
    },
    /// Rank documents for a query and print their matching text
    Search {
        query: String,
        /// Limit the search to one knowledge base and its subdirectories
        #[arg(long)]
        kb: Option<String>,
        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show pending work and registered knowledge bases
    Status,
    /// Remove a knowledge base and everything indexed below it
    Remove { id: String },
}

fn open_store(config: &Config) -> Result<Store> {
    let queue = MutationQueue::new(Db::new(config.db_path()), config.submit_timeout());
    queue.start()?;
    Ok(Store::new(Arc::new(queue)))
}

fn scheduler(config: &Config, store: &Store, notifier: &Notifier) -> Result<ScanScheduler> {
    let embedder = build_embedder(&config.embeddings)?;
    let pipeline = IngestionPipeline::new(store.clone(), embedder, config.embeddings.max_chunks);
    Ok(ScanScheduler::new(
        store.clone(),
        pipeline,
        notifier.clone(),
        config.scan_interval(),
        config.item_pause(),
    ))
}

fn main() -> Result<()> {
    // Without RUST_LOG the logger admits everything and the global max level
    // does the filtering, so the configured level can take over after loading.
    let level_from_env = std::env::var_os("RUST_LOG").is_some();
    env_logger::Builder::from_env(env_logger::Env::default().filter_or("RUST_LOG", "trace"))
        .init();
    if !level_from_env {
        log::set_max_level(LevelFilter::Info);
    }

    let args = Args::parse();
    let config = Config::load()?;

    if !level_from_env {
        match config.storage.log_level.parse::<LevelFilter>() {
            Ok(level) => log::set_max_level(level),
            Err(_) => log::warn!(
                "Unknown log_level {:?}, staying at info",
                config.storage.log_level
            ),
        }
    }
    log::debug!("Database path: {}", config.db_path().display());

    let store = open_store(&config)?;
    let notifier = Notifier::log();

    match args.command {
        Command::Add { dir } => {
            let service = KnowledgeBaseService::new(store.clone(), notifier);
            let (root, report) = service.add_root(&dir)?;
            println!("{}  {}", root.id, root.location_path);
            println!(
                "{} director(ies), {} document(s) queued",
                report.added_nodes, report.added_documents
            );
        }
        Command::Scan => {
            let started = Instant::now();
            let report = ChangeDetector::new(store.clone(), notifier).detect_all()?;
            println!(
                "added {} node(s), {} document(s); {} modified, {} deleted, {} missing root(s) in {:?}",
                report.added_nodes,
                report.added_documents,
                report.modified,
                report.deleted,
                report.missing_roots,
                started.elapsed()
            );
            println!("pending: {}", store.pending_count()?);
        }
        Command::Load => {
            let started = Instant::now();
            let scheduler = scheduler(&config, &store, &notifier)?;
            scheduler.set_state(ScanState::Running);
            let summary = scheduler.run_once()?;
            scheduler.set_state(ScanState::Stopped);
            println!(
                "{} document(s) added, {} modified, {} deleted",
                summary.scan.added_documents, summary.scan.modified, summary.scan.deleted
            );
            println!(
                "ingested {}, failed {}, purged {} in {:?}",
                summary.ingested,
                summary.failed,
                summary.purged,
                started.elapsed()
            );
            println!("pending: {}", store.pending_count()?);
        }
        Command::Run { seconds } => {
            let scheduler = scheduler(&config, &store, &notifier)?;
            scheduler.start()?;
            match seconds {
                Some(secs) => std::thread::sleep(Duration::from_secs(secs)),
                None => {
                    log::info!("Scheduler running; press Enter to stop");
                    let mut line = String::new();
                    std::io::stdin().read_line(&mut line)?;
                }
            }
            if !scheduler.stop_and_wait(Duration::from_secs(60)) {
                log::warn!("Gave up waiting for the in-flight document to finish");
            }
            scheduler.shutdown();
            println!("pending: {}", store.pending_count()?);
        }
        Command::Search { query, kb, json } => {
            let embedder = build_embedder(&config.embeddings)?;
            let mut ranker = RetrievalRanker::new(store.clone(), embedder, config.ranking_options())
                .with_top_n(config.search.top_n)
                .with_context_budget(config.search.context_budget_chars);
            if config.embeddings.cache_capacity > 0 {
                ranker = ranker.with_cache(Arc::new(QueryVectorCache::new(
                    config.embeddings.cache_capacity,
                )));
            }

            let started = Instant::now();
            let context = ranker.retrieve_context(&query, kb.as_deref())?;
            log::info!(
                "{} document(s), {} chars in {:?}",
                context.entries.len(),
                context.total_chars,
                started.elapsed()
            );
            if json {
                println!("{}", serde_json::to_string_pretty(&context)?);
            } else if context.entries.is_empty() {
                println!("No matching documents");
            } else {
                print!("{}", context.render());
            }
        }
        Command::Status => {
            let service = KnowledgeBaseService::new(store.clone(), notifier);
            println!("pending: {}", service.pending_count()?);
            for root in service.list_roots()? {
                println!("{}  {:<20}  {}", root.id, root.load_state, root.location_path);
            }
        }
        Command::Remove { id } => {
            let service = KnowledgeBaseService::new(store.clone(), notifier);
            let removed = service.remove_knowledge_base(&id)?;
            println!("removed {} knowledge base node(s)", removed);
        }
    }

    store.queue().stop();
    Ok(())
}
