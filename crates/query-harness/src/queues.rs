//! Broker queue names. The names themselves are the contract between
//! Intake, the Orchestrator, the external ML service, and the Reply
//! Router — see the external interfaces this pipeline honors.

pub const QUERY_SEARCH_JOBS: &str = "query_search_jobs";
pub const QUERY_SEARCH: &str = "query_search";
pub const QUERY_SEARCH_RESULTS: &str = "query_search_results";

pub const RECOMMENDATION_JOBS: &str = "recommendation_jobs";
pub const CHUNK_SEARCH: &str = "chunk_search";
pub const SEARCH_RESULTS: &str = "search_results";
