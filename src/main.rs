use clap::{Parser, Subcommand};
use medctx::commands::{
    build_index, delete_index, evaluate, ingest, load_config, migrate_to_managed, purge,
    resolve_home, search, show_status,
};
use medctx::config::{ConfigError, run_interactive_config, show_config};
use medctx::index::SearchFilter;
use medctx::{ErrorCategory, RagError};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::error;

#[derive(Parser)]
#[command(name = "medctx")]
#[command(about = "Semantic search over medical guideline chunks, stored locally or in Azure")]
#[command(version)]
struct Cli {
    /// Application directory (defaults to $MEDCTX_HOME or ~/.medctx)
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Configure storage mode, Azure services and embeddings
    Config {
        /// Show current configuration
        #[arg(long)]
        show: bool,
    },
    /// Show record counts and index size for the configured mode
    Status,
    /// Store documents and chunks from JSON files
    Ingest {
        /// JSON array of documents
        documents: PathBuf,
        /// JSON array of chunks
        chunks: PathBuf,
    },
    /// Build the vector index over the stored chunks
    Index {
        /// Rebuild even when an index with the same size exists
        #[arg(long)]
        force: bool,
    },
    /// Search the index
    Search {
        query: String,
        /// Number of results
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
        /// Only chunks from this document
        #[arg(long)]
        doc_id: Option<String>,
        /// Only chunks from this publishing organisation
        #[arg(long)]
        source_org: Option<String>,
        /// Only chunks under this section
        #[arg(long)]
        section: Option<String>,
        /// Earliest publication date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        from: Option<String>,
        /// Latest publication date, inclusive (YYYY-MM-DD)
        #[arg(long)]
        to: Option<String>,
        /// Print results as JSON
        #[arg(long)]
        json: bool,
    },
    /// Delete the vector index
    DeleteIndex,
    /// Delete every stored document and chunk
    Purge {
        /// Confirm the deletion
        #[arg(long)]
        yes: bool,
    },
    /// Copy local records and embeddings into Cosmos DB and Azure AI Search
    Migrate {
        /// Rebuild the managed index even if it already matches
        #[arg(long)]
        force: bool,
    },
    /// Evaluate retrieval quality on labelled queries
    Eval {
        /// JSON array of {query, expected_terms, category}
        queries: PathBuf,
        #[arg(long, short = 'k', default_value_t = 5)]
        top_k: usize,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            eprintln!("Error ({}): {e:#}", categorize(&e));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let home = resolve_home(cli.home)?;

    match cli.command {
        Commands::Config { show } => {
            if show {
                show_config(&load_config(&home)?)?;
            } else {
                run_interactive_config(&home)?;
            }
        }
        Commands::Status => show_status(&load_config(&home)?).await?,
        Commands::Ingest { documents, chunks } => {
            ingest(&load_config(&home)?, &documents, &chunks).await?;
        }
        Commands::Index { force } => build_index(&load_config(&home)?, force).await?,
        Commands::Search {
            query,
            top_k,
            doc_id,
            source_org,
            section,
            from,
            to,
            json,
        } => {
            let filter = SearchFilter {
                doc_id,
                source_org,
                section_path: section,
                published_after: from,
                published_before: to,
            };
            search(&load_config(&home)?, &query, top_k, &filter, json).await?;
        }
        Commands::DeleteIndex => delete_index(&load_config(&home)?).await?,
        Commands::Purge { yes } => purge(&load_config(&home)?, yes).await?,
        Commands::Migrate { force } => migrate_to_managed(&load_config(&home)?, force).await?,
        Commands::Eval {
            queries,
            top_k,
            json,
        } => evaluate(&load_config(&home)?, &queries, top_k, json).await?,
    }

    Ok(())
}

/// User-facing class of a failure; the full chain goes to the log.
fn categorize(error: &anyhow::Error) -> ErrorCategory {
    error
        .chain()
        .find_map(|cause| {
            cause
                .downcast_ref::<RagError>()
                .map(RagError::category)
                .or_else(|| {
                    cause
                        .downcast_ref::<ConfigError>()
                        .map(|_| ErrorCategory::Configuration)
                })
        })
        .unwrap_or(ErrorCategory::Request)
}
