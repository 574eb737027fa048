//! Job Intake: validates a query submission, assigns a `job_id`, publishes
//! a `QuerySearchJob`, and either returns immediately (async mode) or polls
//! the Result Store for a bounded budget (immediate mode).
//!
//! Intake never blocks on broker acknowledgements beyond the publish call,
//! and never reads from the results queue.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use query_harness_core::models::{PollOutcome, QuerySearchJob, QueryResult};
use uuid::Uuid;

use crate::broker::Broker;
use crate::config::IntakeConfig;
use crate::queues::QUERY_SEARCH_JOBS;
use crate::result_store::{query_result_key, ResultStore};

#[derive(Debug, Clone)]
pub struct SubmitQueryRequest {
    pub query: String,
    pub session_id: Option<String>,
    pub max_results: Option<i64>,
    pub score_threshold: Option<f64>,
    pub correlation_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub poll_url: String,
}

pub struct Intake {
    broker: Arc<dyn Broker>,
    store: Arc<dyn ResultStore>,
    config: IntakeConfig,
}

impl Intake {
    pub fn new(broker: Arc<dyn Broker>, store: Arc<dyn ResultStore>, config: IntakeConfig) -> Self {
        Self {
            broker,
            store,
            config,
        }
    }

    fn validate_and_build_job(&self, req: SubmitQueryRequest) -> Result<QuerySearchJob> {
        let trimmed = req.query.trim();
        if trimmed.is_empty() || trimmed.chars().count() > 1000 {
            bail!(
                "query must be between 1 and 1000 characters after trimming, got {}",
                trimmed.chars().count()
            );
        }

        let max_results = req
            .max_results
            .filter(|n| *n >= 1)
            .map(|n| n.min(self.config.max_results_cap))
            .unwrap_or(self.config.max_results_default);

        let score_threshold = req
            .score_threshold
            .filter(|s| (0.0..=1.0).contains(s))
            .unwrap_or(self.config.score_threshold_default);

        Ok(QuerySearchJob {
            job_id: Uuid::new_v4(),
            query: trimmed.to_string(),
            session_id: req.session_id,
            max_results,
            score_threshold,
            created_at: Utc::now(),
            correlation_id: req.correlation_id,
        })
    }

    async fn publish_job(&self, job: &QuerySearchJob) -> Result<()> {
        let payload = serde_json::to_vec(job).context("failed to serialize job")?;
        self.broker
            .publish(QUERY_SEARCH_JOBS, payload)
            .await
            .context("failed to publish query search job")
    }

    /// Validate, publish, and return immediately with the job id.
    pub async fn submit_async(&self, req: SubmitQueryRequest) -> Result<SubmitResponse> {
        let job = self.validate_and_build_job(req)?;
        self.publish_job(&job).await?;
        Ok(SubmitResponse {
            job_id: job.job_id,
            poll_url: format!("/api/v1/search/jobs/{}", job.job_id),
        })
    }

    /// Validate, publish, then poll up to `immediate_budget_secs` before
    /// falling back to a `processing` response.
    pub async fn submit_immediate(&self, req: SubmitQueryRequest) -> Result<PollOutcome> {
        let job = self.validate_and_build_job(req)?;
        self.publish_job(&job).await?;

        let deadline =
            tokio::time::Instant::now() + Duration::from_secs(self.config.immediate_budget_secs);
        let interval = Duration::from_millis(self.config.poll_interval_ms);

        loop {
            if let Some(result) = self.fetch_result(job.job_id).await? {
                return Ok(PollOutcome::Completed(result));
            }
            if tokio::time::Instant::now() >= deadline {
                return Ok(PollOutcome::Processing);
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// A single, non-blocking check of the Result Store.
    pub async fn poll(&self, job_id: Uuid) -> Result<PollOutcome> {
        match self.fetch_result(job_id).await? {
            Some(result) => Ok(PollOutcome::Completed(result)),
            None => Ok(PollOutcome::Processing),
        }
    }

    async fn fetch_result(&self, job_id: Uuid) -> Result<Option<QueryResult>> {
        let key = query_result_key(job_id);
        match self.store.get(&key).await? {
            Some(bytes) => {
                let result: QueryResult =
                    serde_json::from_slice(&bytes).context("corrupt result store entry")?;
                Ok(Some(result))
            }
            None => Ok(None),
        }
    }
}
