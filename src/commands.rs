use anyhow::{Context, Result, bail};
use indicatif::{ProgressBar, ProgressStyle};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::backends::{Backends, migrate};
use crate::config::{Config, get_config_dir};
use crate::embeddings::{AzureOpenAiClient, EmbeddingProvider};
use crate::eval::{EvalQuery, run_benchmark};
use crate::index::{BuildOrigin, SearchFilter};
use crate::models::{Chunk, Document, RetrievalResult};

const PREVIEW_CHARS: usize = 240;

/// Application directory from `--home`, else the default location.
#[inline]
pub fn resolve_home(home: Option<PathBuf>) -> Result<PathBuf> {
    match home {
        Some(dir) => Ok(dir),
        None => Ok(get_config_dir()?),
    }
}

#[inline]
pub fn load_config(home: &Path) -> Result<Config> {
    Config::load(home)
}

fn embedder(config: &Config) -> Result<Arc<dyn EmbeddingProvider>> {
    let client = AzureOpenAiClient::new(&config.embedding, &config.http)
        .context("Embedding provider is not configured")?;
    Ok(Arc::new(client))
}

fn spinner(message: &str) -> ProgressBar {
    let bar = if console::user_attended_stderr() {
        ProgressBar::new_spinner().with_style(
            ProgressStyle::with_template("{spinner} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        )
    } else {
        ProgressBar::hidden()
    };
    bar.set_message(message.to_string());
    bar.enable_steady_tick(Duration::from_millis(120));
    bar
}

async fn read_json_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

/// Print the storage mode, record counts and index size.
#[inline]
pub async fn show_status(config: &Config) -> Result<()> {
    let backends = Backends::open(config)?;

    println!("📊 medctx Status Report");
    println!("{}", "=".repeat(50));
    println!();
    println!("⚙️  Storage mode: {}", backends.mode);
    println!(
        "   Embeddings: {} dimensions, batches of {}",
        config.embedding.dimension, config.embedding.batch_size
    );
    println!();

    println!("🗄️  Records:");
    match backends.records.get_stats().await {
        Ok(stats) => {
            println!("   ✅ {}", stats.location);
            println!("   📄 Documents: {}", stats.document_count);
            println!("   🧩 Chunks: {}", stats.chunk_count);
        }
        Err(e) => {
            warn!("Record store unavailable: {e}");
            println!("   ❌ Unavailable ({}): {}", e.category(), e);
        }
    }
    println!();

    println!("🔍 Vector index:");
    match backends.index.get_document_count().await {
        Ok(0) => println!("   ⚠️  No index built yet. Run 'medctx index'."),
        Ok(count) => println!("   ✅ {} vectors", count),
        Err(e) => {
            warn!("Vector index unavailable: {e}");
            println!("   ❌ Unavailable ({}): {}", e.category(), e);
        }
    }

    Ok(())
}

/// Load documents and chunks from JSON arrays and store them.
#[inline]
pub async fn ingest(config: &Config, documents_path: &Path, chunks_path: &Path) -> Result<()> {
    let documents: Vec<Document> = read_json_file(documents_path).await?;
    let chunks: Vec<Chunk> = read_json_file(chunks_path).await?;
    let backends = Backends::open(config)?;

    let bar = spinner(&format!("Saving {} chunks", chunks.len()));
    let saved = backends.ingest(&documents, &chunks).await;
    bar.finish_and_clear();
    saved?;

    println!(
        "✓ Stored {} documents and {} chunks ({} storage)",
        documents.len(),
        chunks.len(),
        backends.mode
    );
    Ok(())
}

/// Build the index over the stored chunks, or reuse a matching one.
#[inline]
pub async fn build_index(config: &Config, force: bool) -> Result<()> {
    let backends = Backends::open(config)?;
    let embedder = embedder(config)?;

    let bar = spinner("Building vector index");
    let built = backends.build_index(embedder.as_ref(), force).await;
    bar.finish_and_clear();
    let build = built?;

    match build.origin {
        BuildOrigin::Loaded => println!(
            "✓ Existing index already covers {} chunks; nothing to do (use --force to rebuild)",
            build.metadata.len()
        ),
        BuildOrigin::Built => println!("✓ Indexed {} chunks", build.metadata.len()),
    }
    Ok(())
}

/// Run one query and print the ranked results.
#[inline]
pub async fn search(
    config: &Config,
    query: &str,
    top_k: usize,
    filter: &SearchFilter,
    json: bool,
) -> Result<()> {
    let backends = Backends::open(config)?;
    let retriever = backends.retriever(embedder(config)?);
    let results = retriever.search(query, top_k, filter).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&results)?);
    } else if results.is_empty() {
        println!("No results. Has the index been built?");
    } else {
        for result in &results {
            print_result(result);
        }
    }
    Ok(())
}

fn print_result(result: &RetrievalResult) {
    let chunk = &result.chunk;
    println!(
        "{}. [{:.3}] {} ({}, {})",
        result.rank, result.similarity_score, chunk.doc_title, chunk.source_org, chunk.pub_date
    );
    if !chunk.section_path.is_empty() {
        println!("   § {}", chunk.section_path);
    }
    let preview: String = chunk.raw_chunk.chars().take(PREVIEW_CHARS).collect();
    if preview.len() < chunk.raw_chunk.len() {
        println!("   {preview}…");
    } else {
        println!("   {preview}");
    }
    if !chunk.source_url.is_empty() {
        println!("   {}", chunk.source_url);
    }
    println!();
}

#[inline]
pub async fn delete_index(config: &Config) -> Result<()> {
    let backends = Backends::open(config)?;
    backends.index.delete_index().await?;
    println!("✓ Vector index deleted ({} storage)", backends.mode);
    Ok(())
}

/// Delete every stored document and chunk. Requires explicit confirmation.
#[inline]
pub async fn purge(config: &Config, confirmed: bool) -> Result<()> {
    if !confirmed {
        bail!("Refusing to delete all records without --yes");
    }
    let backends = Backends::open(config)?;
    backends.records.purge().await?;
    info!("Purged all records from {} storage", backends.mode);
    println!("✓ All documents and chunks deleted");
    Ok(())
}

/// Copy local records and vectors into the managed services.
#[inline]
pub async fn migrate_to_managed(config: &Config, force: bool) -> Result<()> {
    let source = Backends::local(config);
    let target = Backends::managed(config).context("Managed backends are not configured")?;
    let embedder = embedder(config)?;

    let bar = spinner("Migrating local data to Cosmos DB and Azure AI Search");
    let migrated = migrate(&source, &target, embedder.as_ref(), force).await;
    bar.finish_and_clear();
    let report = migrated?;

    println!("✓ Migration complete");
    println!("   📄 Documents: {}", report.documents);
    println!("   🧩 Chunks: {}", report.chunks);
    println!("   ♻️  Reused embeddings: {}", report.reused_embeddings);
    println!("   🔍 Vectors in index: {}", report.indexed);
    if report.indexed < report.chunks {
        println!("   ⚠️  The index may still be catching up; check again with 'medctx status'.");
    }
    Ok(())
}

/// Score retrieval on labelled queries.
#[inline]
pub async fn evaluate(config: &Config, queries_path: &Path, top_k: usize, json: bool) -> Result<()> {
    let queries: Vec<EvalQuery> = read_json_file(queries_path).await?;
    let backends = Backends::open(config)?;
    let retriever = backends.retriever(embedder(config)?);

    let bar = spinner(&format!("Evaluating {} queries", queries.len()));
    let ran = run_benchmark(&queries, &retriever, top_k).await;
    bar.finish_and_clear();
    let report = ran?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(());
    }

    let metrics = &report.aggregate_metrics;
    println!("📈 Retrieval evaluation ({} queries, top {})", metrics.total_queries, top_k);
    println!("{}", "=".repeat(50));
    println!("   Mean relevance:        {:.3}", metrics.avg_relevance_overall);
    println!("   Mean max relevance:    {:.3}", metrics.avg_max_relevance);
    println!("   Precision@1:           {:.3}", metrics.avg_precision_at_1);
    println!("   Top-3 relevance:       {:.3}", metrics.avg_top_3_relevance);
    println!("   Queries with a hit:    {:.1}%", metrics.percent_with_relevant_results);
    println!("   Mean similarity:       {:.3}", metrics.avg_similarity_score);
    println!(
        "   Time:                  {:.2}s ({:.3}s per query)",
        metrics.benchmark_time_seconds, metrics.avg_time_per_query
    );
    println!();
    for (category, m) in &report.category_metrics {
        println!(
            "   {category}: {} queries, relevance {:.3}, max {:.3}, {:.1}% with a hit",
            m.count, m.avg_relevance, m.avg_max_relevance, m.percent_relevant
        );
    }
    Ok(())
}
