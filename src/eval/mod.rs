// Retrieval evaluation
// Term-match relevance for labelled queries, aggregated overall and per category


use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{debug, info};

use crate::Result;
use crate::index::SearchFilter;
use crate::models::RetrievalResult;
use crate::retriever::Retriever;

/// A result counts as relevant above this term-match score.
pub const RELEVANT_THRESHOLD: f64 = 0.3;
pub const DEFAULT_CATEGORY: &str = "uncategorized";

/// One labelled query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvalQuery {
    pub query: String,
    #[serde(default)]
    pub expected_terms: Vec<String>,
    #[serde(default = "default_category")]
    pub category: String,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryEvaluation {
    pub query: String,
    pub category: String,
    pub num_results: usize,
    pub relevance_scores: Vec<f64>,
    pub avg_relevance: f64,
    pub max_relevance: f64,
    pub top_3_avg_relevance: f64,
    pub precision_at_1: f64,
    pub has_relevant_result: bool,
    pub avg_similarity_score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AggregateMetrics {
    pub total_queries: usize,
    pub avg_relevance_overall: f64,
    pub avg_max_relevance: f64,
    pub avg_precision_at_1: f64,
    pub avg_top_3_relevance: f64,
    pub percent_with_relevant_results: f64,
    pub avg_similarity_score: f64,
    pub benchmark_time_seconds: f64,
    pub avg_time_per_query: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CategoryMetrics {
    pub count: usize,
    pub avg_relevance: f64,
    pub avg_max_relevance: f64,
    pub percent_relevant: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkReport {
    pub aggregate_metrics: AggregateMetrics,
    pub category_metrics: BTreeMap<String, CategoryMetrics>,
    pub individual_evaluations: Vec<QueryEvaluation>,
}

/// Fraction of `expected_terms` found in `text`, case-insensitively.
/// No expected terms scores zero.
#[inline]
pub fn term_match_relevance<S: AsRef<str>>(text: &str, expected_terms: &[S]) -> f64 {
    if expected_terms.is_empty() {
        return 0.0;
    }
    let lower = text.to_lowercase();
    let matches = expected_terms
        .iter()
        .filter(|term| lower.contains(&term.as_ref().to_lowercase()))
        .count();
    matches as f64 / expected_terms.len() as f64
}

/// Score the first `top_k` results of one query against its expected terms.
#[inline]
pub fn evaluate_query_results(
    query: &EvalQuery,
    results: &[RetrievalResult],
    top_k: usize,
) -> QueryEvaluation {
    let considered = &results[..results.len().min(top_k)];
    let relevance_scores: Vec<f64> = considered
        .iter()
        .map(|r| {
            let combined = format!("{} {}", r.chunk.ctx_header, r.chunk.raw_chunk);
            term_match_relevance(&combined, &query.expected_terms)
        })
        .collect();
    let top_3 = &relevance_scores[..relevance_scores.len().min(3)];

    QueryEvaluation {
        query: query.query.clone(),
        category: query.category.clone(),
        num_results: results.len(),
        avg_relevance: mean(relevance_scores.iter().copied()),
        max_relevance: relevance_scores.iter().copied().fold(0.0, f64::max),
        top_3_avg_relevance: mean(top_3.iter().copied()),
        precision_at_1: relevance_scores.first().copied().unwrap_or(0.0),
        has_relevant_result: relevance_scores.iter().any(|s| *s > RELEVANT_THRESHOLD),
        avg_similarity_score: mean(considered.iter().map(|r| f64::from(r.similarity_score))),
        relevance_scores,
    }
}

/// Means over all evaluations. Timing fields are left at zero.
#[inline]
pub fn aggregate_metrics(evaluations: &[QueryEvaluation]) -> AggregateMetrics {
    if evaluations.is_empty() {
        return AggregateMetrics::default();
    }
    AggregateMetrics {
        total_queries: evaluations.len(),
        avg_relevance_overall: mean(evaluations.iter().map(|e| e.avg_relevance)),
        avg_max_relevance: mean(evaluations.iter().map(|e| e.max_relevance)),
        avg_precision_at_1: mean(evaluations.iter().map(|e| e.precision_at_1)),
        avg_top_3_relevance: mean(evaluations.iter().map(|e| e.top_3_avg_relevance)),
        percent_with_relevant_results: percent_relevant(evaluations.iter()),
        avg_similarity_score: mean(evaluations.iter().map(|e| e.avg_similarity_score)),
        ..AggregateMetrics::default()
    }
}

#[inline]
pub fn category_metrics(evaluations: &[QueryEvaluation]) -> BTreeMap<String, CategoryMetrics> {
    evaluations
        .iter()
        .into_group_map_by(|e| e.category.clone())
        .into_iter()
        .map(|(category, group)| {
            let metrics = CategoryMetrics {
                count: group.len(),
                avg_relevance: mean(group.iter().map(|e| e.avg_relevance)),
                avg_max_relevance: mean(group.iter().map(|e| e.max_relevance)),
                percent_relevant: percent_relevant(group.iter().copied()),
            };
            (category, metrics)
        })
        .collect()
}

/// Run every query through `retriever` and score the results.
#[inline]
pub async fn run_benchmark(
    queries: &[EvalQuery],
    retriever: &Retriever,
    top_k: usize,
) -> Result<BenchmarkReport> {
    let start = Instant::now();
    let mut evaluations = Vec::with_capacity(queries.len());

    for (i, query) in queries.iter().enumerate() {
        let results = retriever
            .search(&query.query, top_k, &SearchFilter::default())
            .await?;
        evaluations.push(evaluate_query_results(query, &results, top_k));
        debug!("Evaluated query {}/{}: {}", i + 1, queries.len(), query.query);
    }

    let elapsed = start.elapsed().as_secs_f64();
    let mut aggregate = aggregate_metrics(&evaluations);
    aggregate.benchmark_time_seconds = elapsed;
    aggregate.avg_time_per_query = if queries.is_empty() {
        0.0
    } else {
        elapsed / queries.len() as f64
    };
    info!(
        "Evaluated {} queries in {:.2}s, mean relevance {:.3}",
        queries.len(),
        elapsed,
        aggregate.avg_relevance_overall
    );

    Ok(BenchmarkReport {
        category_metrics: category_metrics(&evaluations),
        aggregate_metrics: aggregate,
        individual_evaluations: evaluations,
    })
}

fn percent_relevant<'a, I>(evaluations: I) -> f64
where
    I: Iterator<Item = &'a QueryEvaluation>,
{
    mean(evaluations.map(|e| if e.has_relevant_result { 100.0 } else { 0.0 }))
}

fn mean<I: Iterator<Item = f64>>(values: I) -> f64 {
    let (sum, count) = values.fold((0.0, 0_usize), |(sum, count), v| (sum + v, count + 1));
    if count == 0 { 0.0 } else { sum / count as f64 }
}
