//! GraphRAG CLI
//!
//! A command-line interface for indexing documents into a community graph
//! and answering questions against it.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand};
use graphrag_core::{Document, Query};
use graphrag_db::{init_memory, init_persistent, Repository};
use graphrag_pipeline::{HttpCompletionClient, Pipeline, PipelineConfig, ProviderConfig};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

const DEFAULT_DEADLINE_SECS: u64 = 3600;

/// GraphRAG - index documents into a community graph and query it
#[derive(Parser)]
#[command(name = "graphrag")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Database path (defaults to ~/.graphrag/data)
    #[arg(short, long)]
    db_path: Option<PathBuf>,

    /// Use in-memory database (for testing)
    #[arg(long)]
    memory: bool,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Index text files into one graph
    Index {
        /// Files to index
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },

    /// Ask a question against an indexed graph
    Query {
        /// Graph id printed by `index`
        graph_id: String,

        /// The question
        question: String,

        /// Only use communities built from these document ids
        #[arg(long = "doc")]
        docs: Vec<String>,

        /// Hierarchy level to answer from (0 is the finest)
        #[arg(short, long)]
        level: Option<u32>,
    },

    /// Drop cached results for a document or a graph
    #[command(group(ArgGroup::new("target").required(true).args(["document", "graph"])))]
    Invalidate {
        /// Document id
        #[arg(long)]
        document: Option<String>,

        /// Graph id
        #[arg(long)]
        graph: Option<String>,
    },

    /// List indexed graphs
    Graphs,

    /// Show the community hierarchy of a graph
    Communities {
        /// Graph id
        graph_id: String,
    },

    /// Show database statistics
    Stats,

    /// Delete the local database (fresh start)
    ResetDb {
        /// Database path (defaults to ~/.graphrag/data)
        #[arg(short, long)]
        db_path: Option<PathBuf>,
    },
}

fn default_db_path() -> Result<PathBuf> {
    let mut path = dirs::home_dir().context("Could not find home directory")?;
    path.push(".graphrag");
    path.push("data");
    Ok(path)
}

fn command_deadline() -> Result<Instant> {
    let secs = match std::env::var("GRAPHRAG_DEADLINE_SECS") {
        Ok(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("Invalid GRAPHRAG_DEADLINE_SECS: {}", raw))?,
        Err(_) => DEFAULT_DEADLINE_SECS,
    };
    Ok(Instant::now() + Duration::from_secs(secs))
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env if present.
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    // Setup logging
    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if let Commands::ResetDb { db_path } = &cli.command {
        let path = match db_path.clone().or_else(|| cli.db_path.clone()) {
            Some(path) => path,
            None => default_db_path()?,
        };
        return cmd_reset_db(&path);
    }

    // Initialize database
    let db = if cli.memory {
        info!("Using in-memory database");
        init_memory().await?
    } else {
        let db_path = match cli.db_path {
            Some(path) => path,
            None => default_db_path()?,
        };

        // Ensure directory exists
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        info!("Using database at: {}", db_path.display());
        init_persistent(&db_path).await?
    };

    let mut config = PipelineConfig::from_env().context("Invalid pipeline configuration")?;
    if let Commands::Query { level: Some(level), .. } = &cli.command {
        config = config.with_query_level(*level);
    }
    let provider = ProviderConfig::from_env().context("Invalid provider configuration")?;
    let client = HttpCompletionClient::new(provider, config.call_timeout);

    // Only indexing is worth refusing up front; queries on unknown graphs fail without a call
    if matches!(cli.command, Commands::Index { .. }) {
        let healthy = client.health().await.unwrap_or(false);
        if !healthy {
            eprintln!("Error: completion provider is not reachable.");
            eprintln!("  Provider: {}", client.base_url());
            eprintln!("Check GRAPHRAG_PROVIDER and GRAPHRAG_LLM_URL.");
            anyhow::bail!("Completion provider unavailable");
        }
    }

    let pipeline = Pipeline::new(config, Arc::new(Repository::new(db)), Arc::new(client));

    // Execute command
    match cli.command {
        Commands::Index { paths } => {
            cmd_index(&pipeline, paths).await?;
        }
        Commands::Query {
            graph_id,
            question,
            docs,
            ..
        } => {
            cmd_query(&pipeline, &graph_id, question, docs).await?;
        }
        Commands::Invalidate { document, graph } => {
            cmd_invalidate(&pipeline, document, graph).await?;
        }
        Commands::Graphs => {
            cmd_graphs(&pipeline).await?;
        }
        Commands::Communities { graph_id } => {
            cmd_communities(&pipeline, &graph_id).await?;
        }
        Commands::Stats => {
            cmd_stats(&pipeline).await?;
        }
        Commands::ResetDb { .. } => {
            // Handled before database init.
        }
    }

    Ok(())
}

fn cmd_reset_db(path: &Path) -> Result<()> {
    if path.exists() {
        std::fs::remove_dir_all(path)
            .with_context(|| format!("Failed to remove db at {}", path.display()))?;
        println!("✓ Removed database at {}", path.display());
    } else {
        println!("Database not found at {}, nothing to remove", path.display());
    }
    Ok(())
}

async fn cmd_index(pipeline: &Pipeline, paths: Vec<PathBuf>) -> Result<()> {
    let mut documents = Vec::with_capacity(paths.len());
    for path in &paths {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read file: {}", path.display()))?;
        if text.trim().is_empty() {
            eprintln!("Skipping empty file {}", path.display());
            continue;
        }
        documents.push(Document::new(text).with_source(path.display().to_string()));
    }
    if documents.is_empty() {
        anyhow::bail!("Nothing to index");
    }

    let report = pipeline
        .index_corpus(documents, command_deadline()?)
        .await
        .context("Indexing failed")?;

    println!("✓ Indexed graph {}", report.graph_id);
    println!("  • Documents: {}", report.document_ids.len());
    println!("  • Chunks: {}/{} extracted", report.chunks_extracted, report.chunks_total);
    println!("  • Nodes: {}", report.node_count);
    println!("  • Edges: {}", report.edge_count);
    println!("  • Merged descriptions: {}", report.described);
    println!(
        "  • Communities: {} over {} level(s)",
        report.community_count, report.levels
    );
    println!("  • Summaries: {}", report.summaries);

    if !report.failures.is_empty() {
        println!("\nFailed units (re-run `index` to retry them):");
        for failure in &report.failures {
            println!("  • {}: {}", failure.unit, failure.error);
        }
    }
    Ok(())
}

async fn cmd_query(pipeline: &Pipeline, graph_id: &str, question: String, docs: Vec<String>) -> Result<()> {
    if question.trim().is_empty() {
        anyhow::bail!("Question cannot be empty");
    }
    let mut query = Query::new(question);
    if !docs.is_empty() {
        query = query.for_documents(docs);
    }

    let answer = pipeline.query(graph_id, &query, command_deadline()?).await?;

    println!("{}", answer.text);
    if !answer.communities.is_empty() {
        let cited: Vec<String> = answer.communities.iter().map(|c| c.to_string()).collect();
        println!("\nSources: {}", cited.join(", "));
    }
    Ok(())
}

async fn cmd_invalidate(pipeline: &Pipeline, document: Option<String>, graph: Option<String>) -> Result<()> {
    let report = match (document, graph) {
        (Some(document), _) => pipeline.invalidate_document(&document).await?,
        (None, Some(graph)) => pipeline.invalidate_graph(&graph).await?,
        (None, None) => anyhow::bail!("Pass --document or --graph"),
    };

    println!("✓ Removed {} cache entries", report.cache_entries);
    for graph_id in &report.graphs {
        println!("  • Dropped graph {}", graph_id);
    }
    Ok(())
}

async fn cmd_graphs(pipeline: &Pipeline) -> Result<()> {
    let graphs = pipeline.list_graphs().await?;

    if graphs.is_empty() {
        println!("No graphs indexed yet. Create one with: graphrag index <files>");
        return Ok(());
    }

    println!("Indexed graphs ({}):\n", graphs.len());
    for meta in graphs {
        println!("• {}", meta.graph_id);
        println!(
            "  {} document(s), {} nodes, {} edges, {} communities over {} level(s)",
            meta.document_ids.len(),
            meta.node_count,
            meta.edge_count,
            meta.community_count,
            meta.levels()
        );
        println!();
    }
    Ok(())
}

async fn cmd_communities(pipeline: &Pipeline, graph_id: &str) -> Result<()> {
    let hierarchy = pipeline.load_communities(graph_id).await?;

    if hierarchy.is_empty() {
        println!("No communities stored for graph {}", graph_id);
        return Ok(());
    }

    for (level, communities) in hierarchy.levels().enumerate() {
        let modularity = hierarchy
            .modularity(level as u32)
            .map(|q| format!(", modularity {:.3}", q))
            .unwrap_or_default();
        println!("Level {} ({} communities{}):", level, communities.len(), modularity);
        for community in communities {
            let members: Vec<&str> = community.members.iter().map(|k| k.as_str()).collect();
            println!("  • {} [{}]", community.id, members.join(", "));
        }
        println!();
    }
    Ok(())
}

async fn cmd_stats(pipeline: &Pipeline) -> Result<()> {
    let stats = pipeline.stats().await?;

    println!("Database Statistics:");
    println!("  • Cache entries: {}", stats.cache_entries);
    println!("  • Graphs: {}", stats.graphs);
    println!("  • Nodes: {}", stats.nodes);
    println!("  • Edges: {}", stats.edges);
    println!("  • Communities: {}", stats.communities);
    println!("  • Summaries: {}", stats.summaries);

    Ok(())
}
