//! Pure data model and ranking logic for the query orchestration pipeline.
//!
//! This crate has no knowledge of brokers, result stores, or databases: it
//! is safe to call from any async runtime (or none at all). The app crate
//! (`query-harness`) owns every I/O boundary and serializes through the
//! types defined here.
//!
//! # Modules
//!
//! | Module | Responsibility |
//! |---|---|
//! | [`models`] | Wire and internal data types (jobs, requests, replies, results) |
//! | [`aggregate`] | Groups chunk matches by article and ranks them by hybrid score |

pub mod aggregate;
pub mod models;
