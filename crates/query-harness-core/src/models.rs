//! Wire and internal data types for the query orchestration pipeline.
//!
//! These types are plain data: no I/O, no tokio. Concrete transport
//! (broker, result store, metadata reader) lives in the `query-harness`
//! app crate and (de)serializes through the types here.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A validated query submission, published by Intake and consumed once by
/// the Orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySearchJob {
    pub job_id: Uuid,
    pub query: String,
    pub session_id: Option<String>,
    pub max_results: i64,
    pub score_threshold: f64,
    pub created_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

/// A validated article→similar-article submission.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecommendationJob {
    pub job_id: Uuid,
    pub source_article_id: Uuid,
    pub max_results: i64,
    pub score_threshold: f64,
    pub created_at: DateTime<Utc>,
    pub correlation_id: Option<String>,
}

/// One outstanding request to the external ML service. Exactly one reply
/// is expected per `search_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchRequest {
    Query(QuerySearchRequest),
    Chunk(ChunkSearchRequest),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuerySearchRequest {
    pub search_id: Uuid,
    pub job_id: Uuid,
    pub query: String,
    pub max_results: i64,
    pub score_threshold: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkSearchRequest {
    pub search_id: Uuid,
    pub job_id: Uuid,
    pub chunk_id: Uuid,
    pub source_article_id: Uuid,
    pub top_k: i64,
    pub score_threshold: f64,
}

impl SearchRequest {
    pub fn search_id(&self) -> Uuid {
        match self {
            SearchRequest::Query(q) => q.search_id,
            SearchRequest::Chunk(c) => c.search_id,
        }
    }
}

/// One per-chunk hit inside a success reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResultItem {
    pub chunk_id: Uuid,
    pub similarity_score: f64,
    pub article_id: Uuid,
    pub chunk_index: i64,
    pub article_title: String,
    pub category: String,
    pub content_preview: String,
    pub url: String,
}

/// Reply from the ML service, decoded by field presence: a message with a
/// `results` array decodes as `Response`; otherwise `Error`. `serde`'s
/// untagged enum already tries variants in declaration order, which is
/// exactly this decode-by-shape contract.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SearchReply {
    Response(SearchResponse),
    Error(SearchErrorReply),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    pub search_id: Uuid,
    pub results: Vec<SearchResultItem>,
    pub total_found: i64,
    pub processing_time: String,
    pub service_instance_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchErrorReply {
    pub search_id: Uuid,
    pub error_message: String,
    pub error_code: String,
    pub service_instance_id: String,
}

impl SearchReply {
    pub fn search_id(&self) -> Uuid {
        match self {
            SearchReply::Response(r) => r.search_id,
            SearchReply::Error(e) => e.search_id,
        }
    }
}

/// A single chunk match carried forward into aggregation. Lighter than
/// [`SearchResultItem`]: article metadata is filled in later by
/// enrichment, not carried through scoring.
#[derive(Debug, Clone)]
pub struct ChunkMatch {
    pub article_id: Uuid,
    pub chunk_id: Uuid,
    pub chunk_index: i64,
    pub similarity_score: f64,
    pub content_preview: String,
}

impl From<SearchResultItem> for ChunkMatch {
    fn from(item: SearchResultItem) -> Self {
        ChunkMatch {
            article_id: item.article_id,
            chunk_id: item.chunk_id,
            chunk_index: item.chunk_index,
            similarity_score: item.similarity_score,
            content_preview: item.content_preview,
        }
    }
}

/// Which hybrid-score formula the Aggregator applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RankingMode {
    Query,
    Article,
}

/// One chunk-level match surfaced on a ranked recommendation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkMatchSummary {
    pub chunk_id: Uuid,
    pub score: f64,
    pub chunk_index: i64,
    pub content_preview: String,
}

/// A ranked article, before or after metadata enrichment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleRecommendation {
    pub article_id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    pub hybrid_score: f64,
    pub max_similarity: f64,
    pub avg_similarity: f64,
    pub chunk_matches: Vec<ChunkMatchSummary>,
    pub matched_chunks: i64,
}

/// Outcome of Intake's poll-style operations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PollOutcome {
    Processing,
    Completed(QueryResult),
}

/// The terminal record written once per job and never mutated afterward.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub job_id: Uuid,
    pub query: String,
    pub recommendations: Vec<ArticleRecommendation>,
    pub total_found: i64,
    pub processing_time: String,
    pub status: QueryResultStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryResultStatus {
    Completed,
    Error,
}
