//! Article Metadata Reader: a read-only view over the persistent article
//! and chunk store. The store's own schema and ingestion are out of scope
//! here; this module only pins the read interface the Orchestrator needs.

use std::collections::HashMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct ArticleMetadata {
    pub title: String,
    pub category: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChunkRef {
    pub chunk_id: Uuid,
    pub chunk_index: i64,
    pub content: String,
}

#[async_trait]
pub trait ArticleMetadataReader: Send + Sync {
    async fn get_article(&self, article_id: Uuid) -> Result<Option<ArticleMetadata>>;
    async fn list_chunks(&self, article_id: Uuid) -> Result<Vec<ChunkRef>>;
}

// --- SQLite implementation --------------------------------------------------

pub struct SqliteMetadataReader {
    pool: SqlitePool,
}

impl SqliteMetadataReader {
    pub async fn connect(db_path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(false)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to open article metadata db at {db_path}"))?;
        Ok(Self { pool })
    }
}

#[async_trait]
impl ArticleMetadataReader for SqliteMetadataReader {
    async fn get_article(&self, article_id: Uuid) -> Result<Option<ArticleMetadata>> {
        let row = sqlx::query("SELECT title, category, url FROM articles WHERE id = ?")
            .bind(article_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .context("failed to query article metadata")?;
        Ok(row.map(|r| ArticleMetadata {
            title: r.get("title"),
            category: r.get("category"),
            url: r.get("url"),
        }))
    }

    async fn list_chunks(&self, article_id: Uuid) -> Result<Vec<ChunkRef>> {
        let rows = sqlx::query(
            "SELECT id, chunk_index, content FROM chunks WHERE article_id = ? ORDER BY chunk_index ASC",
        )
        .bind(article_id.to_string())
        .fetch_all(&self.pool)
        .await
        .context("failed to list article chunks")?;

        rows.iter()
            .map(|r| {
                let chunk_id: String = r.get("id");
                Ok(ChunkRef {
                    chunk_id: Uuid::parse_str(&chunk_id)
                        .with_context(|| format!("invalid chunk id in store: {chunk_id}"))?,
                    chunk_index: r.get("chunk_index"),
                    content: r.get("content"),
                })
            })
            .collect()
    }
}

// --- in-memory fake, for tests ----------------------------------------------

#[derive(Default)]
pub struct InMemoryMetadataReader {
    articles: HashMap<Uuid, ArticleMetadata>,
    chunks: HashMap<Uuid, Vec<ChunkRef>>,
}

impl InMemoryMetadataReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_article(mut self, id: Uuid, metadata: ArticleMetadata) -> Self {
        self.articles.insert(id, metadata);
        self
    }

    pub fn with_chunks(mut self, article_id: Uuid, chunks: Vec<ChunkRef>) -> Self {
        self.chunks.insert(article_id, chunks);
        self
    }
}

#[async_trait]
impl ArticleMetadataReader for InMemoryMetadataReader {
    async fn get_article(&self, article_id: Uuid) -> Result<Option<ArticleMetadata>> {
        Ok(self.articles.get(&article_id).cloned())
    }

    async fn list_chunks(&self, article_id: Uuid) -> Result<Vec<ChunkRef>> {
        Ok(self.chunks.get(&article_id).cloned().unwrap_or_default())
    }
}
