//! End-to-end exercises of the orchestration pipeline against in-memory
//! fakes of the Broker, Result Store, and Article Metadata Reader — no
//! external services required.

use std::sync::Arc;
use std::time::Duration;

use query_harness::broker::{Broker, MemoryBroker};
use query_harness::intake::{Intake, SubmitQueryRequest};
use query_harness::metadata::{ChunkRef, InMemoryMetadataReader};
use query_harness::orchestrator::Orchestrator;
use query_harness::queues::{CHUNK_SEARCH, QUERY_SEARCH, RECOMMENDATION_JOBS, SEARCH_RESULTS};
use query_harness::result_store::{
    query_result_key, recommendation_result_key, InMemoryResultStore, ResultStore,
};
use query_harness_core::models::{
    ChunkSearchRequest, QueryResultStatus, RecommendationJob, SearchReply, SearchRequest,
    SearchResponse, SearchResultItem,
};
use tokio::sync::watch;
use tokio::time::timeout;

fn default_intake_config() -> query_harness::config::IntakeConfig {
    query_harness::config::Config::default().intake
}

/// A stand-in for the external ML service: reads one `SearchRequest` off
/// `query_search` and publishes a canned reply back.
async fn fake_ml_service_once(
    broker: Arc<MemoryBroker>,
    reply_for: impl Fn(SearchRequest) -> SearchReply + Send + 'static,
) {
    let mut consumer = broker.consume(QUERY_SEARCH, 1).await.unwrap();
    let delivery = consumer.recv().await.expect("expected one search request");
    let request: SearchRequest = serde_json::from_slice(&delivery.payload).unwrap();
    delivery.ack().await.unwrap();
    let reply = reply_for(request);
    broker
        .publish(
            query_harness::queues::QUERY_SEARCH_RESULTS,
            serde_json::to_vec(&reply).unwrap(),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn happy_path_end_to_end_through_the_result_store() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(InMemoryResultStore::new());
    let metadata = Arc::new(InMemoryMetadataReader::new());
    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        store.clone(),
        metadata,
        Duration::from_secs(5),
        1,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router =
        query_harness::router::ReplyRouter::new(broker.clone(), orchestrator.pending_map(), 1);
    let router_rx = shutdown_rx.clone();
    let router_task = tokio::spawn(async move {
        router
            .run(query_harness::queues::QUERY_SEARCH_RESULTS, router_rx)
            .await
    });

    let o = orchestrator.clone();
    let orchestrator_rx = shutdown_rx.clone();
    let orchestrator_task = tokio::spawn(async move { o.run_query_jobs(orchestrator_rx).await });

    let article_a = uuid::Uuid::new_v4();
    let ml_broker = broker.clone();
    let ml_task = tokio::spawn(fake_ml_service_once(ml_broker, move |request| {
        let search_id = match request {
            SearchRequest::Query(q) => q.search_id,
            SearchRequest::Chunk(_) => panic!("expected a query-mode request"),
        };
        SearchReply::Response(SearchResponse {
            search_id,
            results: vec![SearchResultItem {
                chunk_id: uuid::Uuid::new_v4(),
                similarity_score: 0.9,
                article_id: article_a,
                chunk_index: 0,
                article_title: "ignored".to_string(),
                category: "ignored".to_string(),
                content_preview: "preview".to_string(),
                url: "ignored".to_string(),
            }],
            total_found: 1,
            processing_time: "0.01s".to_string(),
            service_instance_id: "svc-1".to_string(),
        })
    }));

    let intake = Intake::new(broker.clone(), store.clone(), default_intake_config());
    let submitted = intake
        .submit_async(SubmitQueryRequest {
            query: "trump politics".to_string(),
            session_id: None,
            max_results: None,
            score_threshold: None,
            correlation_id: None,
        })
        .await
        .unwrap();

    ml_task.await.unwrap();

    let result = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(bytes) = store.get(&query_result_key(submitted.job_id)).await.unwrap() {
                return bytes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("result should appear within the timeout");

    let result: query_harness_core::models::QueryResult = serde_json::from_slice(&result).unwrap();
    assert_eq!(result.status, QueryResultStatus::Completed);
    assert_eq!(result.recommendations.len(), 1);
    assert_eq!(result.recommendations[0].article_id, article_a);

    shutdown_tx.send(true).unwrap();
    let _ = router_task.await;
    let _ = orchestrator_task.await;
}

#[tokio::test]
async fn job_with_no_reply_times_out_and_is_stored_as_error() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(InMemoryResultStore::new());
    let metadata = Arc::new(InMemoryMetadataReader::new());
    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        store.clone(),
        metadata,
        Duration::from_millis(100),
        1,
    ));

    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    let o = orchestrator.clone();
    let orchestrator_task = tokio::spawn(async move { o.run_query_jobs(shutdown_rx).await });

    let intake = Intake::new(broker.clone(), store.clone(), default_intake_config());
    let submitted = intake
        .submit_async(SubmitQueryRequest {
            query: "nobody answers".to_string(),
            session_id: None,
            max_results: None,
            score_threshold: None,
            correlation_id: None,
        })
        .await
        .unwrap();

    // Drain the search request so nothing piles up, but never reply to it.
    let mut consumer = broker.consume(QUERY_SEARCH, 1).await.unwrap();
    let delivery = timeout(Duration::from_secs(1), consumer.recv())
        .await
        .unwrap()
        .unwrap();
    delivery.ack().await.unwrap();

    let result = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(bytes) = store.get(&query_result_key(submitted.job_id)).await.unwrap() {
                return bytes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("timeout result should still be stored");

    let result: query_harness_core::models::QueryResult = serde_json::from_slice(&result).unwrap();
    assert_eq!(result.status, QueryResultStatus::Error);
    assert_eq!(
        result.error.as_deref(),
        Some("Search timeout - no response from ML service")
    );
    assert!(result.recommendations.is_empty());

    orchestrator_task.abort();
}

/// A stand-in for the external ML service in article mode: reads `expected`
/// chunk search requests off `chunk_search`, replying to each in turn.
async fn fake_ml_service_for_chunks(
    broker: Arc<MemoryBroker>,
    expected: usize,
    reply_for: impl Fn(ChunkSearchRequest) -> SearchReply + Send + 'static,
) {
    let mut consumer = broker.consume(CHUNK_SEARCH, 1).await.unwrap();
    for _ in 0..expected {
        let delivery = consumer
            .recv()
            .await
            .expect("expected a chunk search request");
        let request: SearchRequest = serde_json::from_slice(&delivery.payload).unwrap();
        delivery.ack().await.unwrap();
        let chunk_request = match request {
            SearchRequest::Chunk(c) => c,
            SearchRequest::Query(_) => panic!("expected a chunk-mode request"),
        };
        let reply = reply_for(chunk_request);
        broker
            .publish(SEARCH_RESULTS, serde_json::to_vec(&reply).unwrap())
            .await
            .unwrap();
    }
}

fn result_item(article_id: uuid::Uuid, chunk_index: i64, score: f64) -> SearchResultItem {
    SearchResultItem {
        chunk_id: uuid::Uuid::new_v4(),
        similarity_score: score,
        article_id,
        chunk_index,
        article_title: "ignored".to_string(),
        category: "ignored".to_string(),
        content_preview: "preview".to_string(),
        url: "ignored".to_string(),
    }
}

#[tokio::test]
async fn recommendation_mode_end_to_end_through_the_result_store() {
    let broker = Arc::new(MemoryBroker::new());
    let store = Arc::new(InMemoryResultStore::new());

    let source_article_id = uuid::Uuid::new_v4();
    let chunk_a = ChunkRef {
        chunk_id: uuid::Uuid::new_v4(),
        chunk_index: 0,
        content: "first chunk".to_string(),
    };
    let chunk_b = ChunkRef {
        chunk_id: uuid::Uuid::new_v4(),
        chunk_index: 1,
        content: "second chunk".to_string(),
    };
    let metadata = Arc::new(InMemoryMetadataReader::new().with_chunks(
        source_article_id,
        vec![chunk_a.clone(), chunk_b.clone()],
    ));

    let orchestrator = Arc::new(Orchestrator::new(
        broker.clone(),
        store.clone(),
        metadata,
        Duration::from_secs(5),
        1,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let router =
        query_harness::router::ReplyRouter::new(broker.clone(), orchestrator.pending_map(), 1);
    let router_rx = shutdown_rx.clone();
    let router_task = tokio::spawn(async move { router.run(SEARCH_RESULTS, router_rx).await });

    let o = orchestrator.clone();
    let orchestrator_rx = shutdown_rx.clone();
    let orchestrator_task =
        tokio::spawn(async move { o.run_recommendation_jobs(orchestrator_rx).await });

    let article_x = uuid::Uuid::new_v4();
    let article_y = uuid::Uuid::new_v4();
    let first_chunk_id = chunk_a.chunk_id;
    let ml_broker = broker.clone();
    let ml_task = tokio::spawn(fake_ml_service_for_chunks(ml_broker, 2, move |request| {
        let (article_id, score) = if request.chunk_id == first_chunk_id {
            (article_x, 0.9)
        } else {
            (article_y, 0.5)
        };
        SearchReply::Response(SearchResponse {
            search_id: request.search_id,
            results: vec![result_item(article_id, 0, score)],
            total_found: 1,
            processing_time: "0.01s".to_string(),
            service_instance_id: "svc-1".to_string(),
        })
    }));

    let job_id = uuid::Uuid::new_v4();
    let job = RecommendationJob {
        job_id,
        source_article_id,
        max_results: 10,
        score_threshold: 0.0,
        created_at: chrono::Utc::now(),
        correlation_id: None,
    };
    broker
        .publish(RECOMMENDATION_JOBS, serde_json::to_vec(&job).unwrap())
        .await
        .unwrap();

    ml_task.await.unwrap();

    let result = timeout(Duration::from_secs(2), async {
        loop {
            if let Some(bytes) = store.get(&recommendation_result_key(job_id)).await.unwrap() {
                return bytes;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("result should appear within the timeout");

    let result: query_harness_core::models::QueryResult = serde_json::from_slice(&result).unwrap();
    assert_eq!(result.status, QueryResultStatus::Completed);
    assert_eq!(result.recommendations.len(), 2);
    assert_eq!(result.recommendations[0].article_id, article_x);
    assert_eq!(result.recommendations[1].article_id, article_y);

    shutdown_tx.send(true).unwrap();
    let _ = router_task.await;
    let _ = orchestrator_task.await;
}
