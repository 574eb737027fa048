//! Query Orchestrator: the heart of the pipeline. Consumes jobs, issues one
//! search request per job (query mode) or one per chunk (article mode),
//! correlates async replies under a deadline, aggregates, enriches, and
//! persists the terminal result.
//!
//! State machine per job: `Queued -> Issued -> Awaiting ->
//! (AllRepliesReceived | TimeoutReached) -> Aggregating -> Persisted ->
//! Acked`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use query_harness_core::aggregate::aggregate;
use query_harness_core::models::{
    ArticleRecommendation, ChunkMatch, ChunkSearchRequest, QueryResult, QueryResultStatus,
    QuerySearchJob, QuerySearchRequest, RankingMode, RecommendationJob, SearchReply, SearchRequest,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Broker, Delivery};
use crate::error::OrchestratorError;
use crate::metadata::ArticleMetadataReader;
use crate::pending::{PendingEntry, PendingMap};
use crate::queues::{CHUNK_SEARCH, QUERY_SEARCH, QUERY_SEARCH_JOBS, RECOMMENDATION_JOBS};
use crate::result_store::{query_result_key, recommendation_result_key, ResultStore};

const TIMEOUT_MESSAGE: &str = "Search timeout - no response from ML service";
/// Capacity of the rendezvous channel per `search_id` registration. One
/// reply is expected per request; a small cushion tolerates a stray
/// redelivery from the broker without blocking the non-blocking sender.
const REPLY_CHANNEL_CAPACITY: usize = 4;

pub struct Orchestrator {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    metadata: Arc<dyn ArticleMetadataReader>,
    pending: Arc<PendingMap>,
    await_timeout: Duration,
    prefetch: u16,
}

impl Orchestrator {
    pub fn new(
        broker: Arc<dyn Broker>,
        store: Arc<dyn ResultStore>,
        metadata: Arc<dyn ArticleMetadataReader>,
        await_timeout: Duration,
        prefetch: u16,
    ) -> Self {
        Self {
            broker,
            store,
            metadata,
            pending: Arc::new(PendingMap::new()),
            await_timeout,
            prefetch,
        }
    }

    pub fn pending_map(&self) -> Arc<PendingMap> {
        self.pending.clone()
    }

    /// Consume `query_search_jobs` until the shutdown signal fires. Each
    /// job is handled on its own task so a slow job cannot hold up the
    /// consumer loop beyond the broker's own prefetch limit.
    pub async fn run_query_jobs(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let mut consumer = self.broker.consume(QUERY_SEARCH_JOBS, self.prefetch).await?;
        loop {
            tokio::select! {
                delivery = consumer.recv() => {
                    match delivery {
                        Some(delivery) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_query_job(delivery).await });
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signal received, stopping query job consumer");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    pub async fn run_recommendation_jobs(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut consumer = self.broker.consume(RECOMMENDATION_JOBS, self.prefetch).await?;
        loop {
            tokio::select! {
                delivery = consumer.recv() => {
                    match delivery {
                        Some(delivery) => {
                            let this = self.clone();
                            tokio::spawn(async move { this.handle_recommendation_job(delivery).await });
                        }
                        None => break,
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("shutdown signal received, stopping recommendation job consumer");
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Dispatch a failure to the right broker acknowledgement: validation
    /// failures are poison messages and must never be requeued, transient
    /// failures get a chance to succeed on redelivery.
    async fn nack_for(&self, delivery: &Delivery, err: OrchestratorError) {
        match &err {
            OrchestratorError::Validation(_) => {
                warn!(error = %err, "nack-drop, message will not be requeued");
                let _ = delivery.nack(false).await;
            }
            OrchestratorError::Transient(_) => {
                warn!(error = %err, "nack-requeue after transient failure");
                let _ = delivery.nack(true).await;
            }
            OrchestratorError::UpstreamFailure(_) | OrchestratorError::Timeout => {
                warn!(error = %err, "nack-requeue");
                let _ = delivery.nack(true).await;
            }
        }
    }

    async fn handle_query_job(&self, delivery: Delivery) {
        let job: QuerySearchJob = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                self.nack_for(&delivery, OrchestratorError::Validation(e.to_string()))
                    .await;
                return;
            }
        };

        info!(job_id = %job.job_id, "query job received");
        let search_id = Uuid::new_v4();
        let (tx, mut rx) = mpsc::channel(REPLY_CHANNEL_CAPACITY);
        self.pending.register(
            search_id,
            PendingEntry {
                job_id: job.job_id,
                reply_tx: tx,
            },
        );

        let request = SearchRequest::Query(QuerySearchRequest {
            search_id,
            job_id: job.job_id,
            query: job.query.clone(),
            max_results: job.max_results,
            score_threshold: job.score_threshold,
        });

        let started_at = tokio::time::Instant::now();
        if let Err(e) = self.publish_request(QUERY_SEARCH, &request).await {
            self.pending.remove(&search_id);
            self.nack_for(&delivery, OrchestratorError::Transient(e)).await;
            return;
        }

        let replies = self.await_replies(&mut rx, 1, started_at).await;
        self.pending.remove(&search_id);

        let result = self.finalize(
            job.job_id,
            job.query.clone(),
            replies,
            RankingMode::Query,
            started_at,
        )
        .await;

        self.persist_and_ack(query_result_key(job.job_id), result, delivery)
            .await;
    }

    async fn handle_recommendation_job(&self, delivery: Delivery) {
        let job: RecommendationJob = match serde_json::from_slice(&delivery.payload) {
            Ok(job) => job,
            Err(e) => {
                self.nack_for(&delivery, OrchestratorError::Validation(e.to_string()))
                    .await;
                return;
            }
        };

        info!(job_id = %job.job_id, "recommendation job received");
        let chunks = match self.metadata.list_chunks(job.source_article_id).await {
            Ok(chunks) => chunks,
            Err(e) => {
                self.nack_for(&delivery, OrchestratorError::Transient(e)).await;
                return;
            }
        };

        if chunks.is_empty() {
            let result = QueryResult {
                job_id: job.job_id,
                query: format!("similar-to:{}", job.source_article_id),
                recommendations: vec![],
                total_found: 0,
                processing_time: "0.00s".to_string(),
                status: QueryResultStatus::Error,
                error: Some("source article has no chunks to search".to_string()),
                created_at: Utc::now(),
            };
            self.persist_and_ack(recommendation_result_key(job.job_id), result, delivery)
                .await;
            return;
        }

        let (tx, mut rx) = mpsc::channel(chunks.len().max(1));
        let started_at = tokio::time::Instant::now();
        let mut issued_search_ids = Vec::with_capacity(chunks.len());
        let mut publish_error = None;
        for chunk in &chunks {
            let search_id = Uuid::new_v4();
            self.pending.register(
                search_id,
                PendingEntry {
                    job_id: job.job_id,
                    reply_tx: tx.clone(),
                },
            );
            issued_search_ids.push(search_id);
            let request = SearchRequest::Chunk(ChunkSearchRequest {
                search_id,
                job_id: job.job_id,
                chunk_id: chunk.chunk_id,
                source_article_id: job.source_article_id,
                top_k: job.max_results,
                score_threshold: job.score_threshold,
            });
            if let Err(e) = self.publish_request(CHUNK_SEARCH, &request).await {
                publish_error = Some(e);
                break;
            }
        }
        drop(tx);

        if let Some(e) = publish_error {
            for search_id in &issued_search_ids {
                self.pending.remove(search_id);
            }
            self.nack_for(&delivery, OrchestratorError::Transient(e)).await;
            return;
        }

        let replies = self.await_replies(&mut rx, chunks.len(), started_at).await;

        let result = self.finalize(
            job.job_id,
            format!("similar-to:{}", job.source_article_id),
            replies,
            RankingMode::Article,
            started_at,
        )
        .await;

        self.persist_and_ack(recommendation_result_key(job.job_id), result, delivery)
            .await;
    }

    async fn publish_request(&self, queue: &str, request: &SearchRequest) -> Result<()> {
        let payload = serde_json::to_vec(request).context("failed to serialize search request")?;
        self.broker.publish(queue, payload).await
    }

    /// Await phase: collect replies until either the expected count has
    /// arrived or the deadline (armed from `started_at`) passes.
    async fn await_replies(
        &self,
        rx: &mut mpsc::Receiver<SearchReply>,
        expected: usize,
        started_at: tokio::time::Instant,
    ) -> Vec<SearchReply> {
        let deadline = started_at + self.await_timeout;
        let mut received = Vec::with_capacity(expected);

        while received.len() < expected {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(reply)) => received.push(reply),
                Ok(None) => break,
                Err(_) => break,
            }
        }

        received
    }

    async fn finalize(
        &self,
        job_id: Uuid,
        query: String,
        replies: Vec<SearchReply>,
        mode: RankingMode,
        started_at: tokio::time::Instant,
    ) -> QueryResult {
        let processing_time = format_duration(started_at.elapsed());

        let mut successes = Vec::new();
        let mut first_error: Option<String> = None;
        for reply in replies {
            match reply {
                SearchReply::Response(r) => successes.extend(r.results),
                SearchReply::Error(e) => {
                    if first_error.is_none() {
                        first_error = Some(e.error_message);
                    }
                }
            }
        }

        if successes.is_empty() {
            let error = match first_error {
                Some(msg) => OrchestratorError::UpstreamFailure(msg).to_string(),
                None => OrchestratorError::Timeout.to_string(),
            };
            debug!(job_id = %job_id, %error, "job finished with no successful results");
            return QueryResult {
                job_id,
                query,
                recommendations: vec![],
                total_found: 0,
                processing_time,
                status: QueryResultStatus::Error,
                error: Some(error),
                created_at: Utc::now(),
            };
        }

        let matches: Vec<ChunkMatch> = successes.into_iter().map(ChunkMatch::from).collect();
        let mut recommendations = aggregate(&matches, mode);
        self.enrich(&mut recommendations).await;

        let total_found = recommendations.len() as i64;
        QueryResult {
            job_id,
            query,
            recommendations,
            total_found,
            processing_time,
            status: QueryResultStatus::Completed,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// One `get_article` lookup per recommendation. On `NotFound`, the
    /// recommendation is kept with empty metadata fields rather than
    /// dropped.
    async fn enrich(&self, recommendations: &mut [ArticleRecommendation]) {
        for rec in recommendations.iter_mut() {
            match self.metadata.get_article(rec.article_id).await {
                Ok(Some(article)) => {
                    rec.title = Some(article.title);
                    rec.category = Some(article.category);
                    rec.url = Some(article.url);
                }
                Ok(None) => {
                    debug!(article_id = %rec.article_id, "article metadata not found, leaving empty");
                }
                Err(e) => {
                    warn!(article_id = %rec.article_id, error = %e, "metadata lookup failed, leaving empty");
                }
            }
        }
    }

    async fn persist_and_ack(&self, key: String, result: QueryResult, delivery: Delivery) {
        let payload = match serde_json::to_vec(&result) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.nack_for(&delivery, OrchestratorError::Transient(e.into()))
                    .await;
                return;
            }
        };

        let ttl = Duration::from_secs(24 * 60 * 60);
        match self.store.put(&key, payload, ttl).await {
            Ok(()) => {
                info!(job_id = %result.job_id, status = ?result.status, "query result persisted");
                let _ = delivery.ack().await;
            }
            Err(e) => {
                self.nack_for(&delivery, OrchestratorError::Transient(e)).await;
            }
        }
    }
}

fn format_duration(d: Duration) -> String {
    format!("{:.2}s", d.as_secs_f64())
}
