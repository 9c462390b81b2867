// src/search/mod.rs
// SemanticSearch: embed -> index -> search orchestration for messages, decisions, and
// mistakes. Falls back to lexical search whenever embeddings are unavailable or a
// vector query comes back empty.

pub mod keyword;
pub mod rank;
pub mod snippet;

use std::collections::HashSet;
use std::sync::Arc;

use rusqlite::OptionalExtension;

use crate::chunk::{self, ChunkerOptions};
use crate::config::{ChunkingConfig, RerankConfig};
use crate::db::vector::{self, EmbeddingKind};
use crate::db::{store, DatabasePool};
use crate::embed::EmbeddingClient;
use crate::error::Result;

use keyword::SearchTarget;
use rank::RankerConfig;

#[derive(Debug, Clone, Default)]
pub struct SearchFilter {
    pub since: Option<i64>,
    pub until: Option<i64>,
    pub conversation_id: Option<i64>,
    pub message_kinds: Option<Vec<String>>,
}

impl SearchFilter {
    fn matches(&self, timestamp: i64, conversation_id: i64, kind: &str) -> bool {
        if let Some(since) = self.since {
            if timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if timestamp > until {
                return false;
            }
        }
        if let Some(cid) = self.conversation_id {
            if cid != conversation_id {
                return false;
            }
        }
        if let Some(kinds) = &self.message_kinds {
            if !kinds.iter().any(|k| k == kind) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone)]
pub struct MessageHit {
    pub message_id: i64,
    pub conversation_id: i64,
    pub similarity: f32,
    pub snippet: String,
}

#[derive(Debug, Clone)]
pub struct TextHit {
    pub id: i64,
    pub similarity: f32,
    pub snippet: String,
}

pub struct SemanticSearch {
    pool: Arc<DatabasePool>,
    embedder: EmbeddingClient,
    chunk_opts: ChunkerOptions,
    ranker_cfg: RankerConfig,
    rerank_enabled: bool,
}

fn dynamic_min_similarity(query: &str) -> f64 {
    let word_count = query.split_whitespace().count() as f64;
    (0.30 + 0.01 * word_count).min(0.55)
}

impl SemanticSearch {
    pub fn new(pool: Arc<DatabasePool>, embedder: EmbeddingClient, chunking: &ChunkingConfig, rerank: &RerankConfig) -> Self {
        Self {
            pool,
            embedder,
            chunk_opts: ChunkerOptions {
                strategy: chunking.strategy,
                chunk_size: chunking.chunk_size,
                overlap: chunking.overlap,
                min_chunk_size: chunking.min_chunk_size,
            },
            ranker_cfg: RankerConfig::from(rerank),
            rerank_enabled: rerank.enabled,
        }
    }

    /// Embed and persist all messages lacking an embedding (or all messages when
    /// `incremental` is false). Long messages are chunked; chunk #0's embedding is also
    /// written as the message-level representative embedding.
    pub async fn index_messages(&self, incremental: bool) -> Result<usize> {
        if !self.embedder.is_available() {
            return Ok(0);
        }

        let existing: HashSet<i64> = if incremental {
            self.pool.run(|conn| vector::existing_ids(conn, EmbeddingKind::Message)).await?
        } else {
            HashSet::new()
        };

        let pending: Vec<(i64, String)> = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare("SELECT id, content FROM messages WHERE content IS NOT NULL")?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                    .filter_map(|r| r.ok())
                    .collect::<Vec<_>>();
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        let model_name = self.embedder.model_info().model;
        let batch_size = self.embedder.batch_size();
        let mut indexed = 0usize;

        for (id, content) in pending {
            if incremental && existing.contains(&id) {
                continue;
            }

            let chunk_result = chunk::chunk_text(&content, &self.chunk_opts);
            let model_name = model_name.clone();

            if chunk_result.was_chunked {
                let texts: Vec<String> = chunk_result.chunks.iter().map(|c| c.content.clone()).collect();
                let mut embeddings = Vec::with_capacity(texts.len());
                for batch in texts.chunks(batch_size) {
                    embeddings.extend(self.embedder.embed_batch(batch).await?);
                }

                let message_embedding = embeddings.first().cloned();
                let chunks = chunk_result.chunks.clone();
                self.pool
                    .run(move |conn| {
                        for (chunk, embedding) in chunks.iter().zip(embeddings.iter()) {
                            let chunk_external_id = format!("{id}:chunk:{}", chunk.index);
                            let chunk_id = store::insert_chunk_if_new(
                                conn,
                                &store::NewChunk {
                                    external_id: &chunk_external_id,
                                    message_id: id,
                                    chunk_index: chunk.index,
                                    total: chunk.total,
                                    start_offset: chunk.start_offset,
                                    end_offset: chunk.end_offset,
                                    content: &chunk.content,
                                },
                            )?;
                            vector::store_chunk_embedding(conn, chunk_id, id, Some(&chunk.content), embedding, &model_name)?;
                        }
                        if let Some(rep) = &message_embedding {
                            vector::store_embedding(conn, EmbeddingKind::Message, id, None, rep, &model_name)?;
                        }
                        Ok::<_, crate::error::MemoryError>(())
                    })
                    .await?;
            } else {
                let embedding = self.embedder.embed(&content).await?;
                self.pool
                    .run(move |conn| vector::store_embedding(conn, EmbeddingKind::Message, id, Some(&content), &embedding, &model_name))
                    .await?;
            }
            indexed += 1;
        }

        Ok(indexed)
    }

    async fn index_text_entities(&self, kind: EmbeddingKind, table: &'static str, content_col: &'static str, incremental: bool) -> Result<usize> {
        if !self.embedder.is_available() {
            return Ok(0);
        }
        let existing: HashSet<i64> = if incremental {
            self.pool.run(move |conn| vector::existing_ids(conn, kind)).await?
        } else {
            HashSet::new()
        };

        let sql = format!("SELECT id, {content_col} FROM {table}");
        let pending: Vec<(i64, String)> = self
            .pool
            .run(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?)))?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok::<_, rusqlite::Error>(rows)
            })
            .await?;

        let model_name = self.embedder.model_info().model;
        let mut indexed = 0usize;
        for batch in pending
            .into_iter()
            .filter(|(id, _)| !incremental || !existing.contains(id))
            .collect::<Vec<_>>()
            .chunks(self.embedder.batch_size())
        {
            let texts: Vec<String> = batch.iter().map(|(_, c)| c.clone()).collect();
            let embeddings = self.embedder.embed_batch(&texts).await?;
            let ids: Vec<i64> = batch.iter().map(|(id, _)| *id).collect();
            let contents: Vec<String> = texts.clone();
            let model_name = model_name.clone();
            self.pool
                .run(move |conn| {
                    for ((id, content), embedding) in ids.iter().zip(contents.iter()).zip(embeddings.iter()) {
                        vector::store_embedding(conn, kind, *id, Some(content), embedding, &model_name)?;
                    }
                    Ok::<_, crate::error::MemoryError>(())
                })
                .await?;
            indexed += batch.len();
        }
        Ok(indexed)
    }

    pub async fn index_decisions(&self, incremental: bool) -> Result<usize> {
        self.index_text_entities(EmbeddingKind::Decision, "decisions", "text", incremental).await
    }

    pub async fn index_mistakes(&self, incremental: bool) -> Result<usize> {
        self.index_text_entities(EmbeddingKind::Mistake, "mistakes", "what_went_wrong", incremental).await
    }

    pub async fn index_missing_decision_embeddings(&self) -> Result<usize> {
        self.index_decisions(true).await
    }

    pub async fn index_missing_mistake_embeddings(&self) -> Result<usize> {
        self.index_mistakes(true).await
    }

    /// Hybrid query over messages. Falls back to FTS when embeddings are unavailable
    /// or the vector query returns nothing.
    pub async fn search_conversations(
        &self,
        query: &str,
        limit: usize,
        filter: &SearchFilter,
        precomputed_embedding: Option<&[f32]>,
    ) -> Result<Vec<MessageHit>> {
        let query_embedding = if let Some(e) = precomputed_embedding {
            Some(e.to_vec())
        } else if self.embedder.is_available() {
            self.embedder.embed(query).await.ok()
        } else {
            None
        };

        let hits = if let Some(embedding) = query_embedding {
            self.hybrid_message_search(query, &embedding, limit, filter).await?
        } else {
            Vec::new()
        };

        if !hits.is_empty() {
            return Ok(hits);
        }
        self.fts_message_search(query, limit, filter).await
    }

    async fn hybrid_message_search(&self, query: &str, embedding: &[f32], limit: usize, filter: &SearchFilter) -> Result<Vec<MessageHit>> {
        let min_sim = dynamic_min_similarity(query);
        let embedding = embedding.to_vec();
        let query_owned = query.to_string();
        let filter = filter.clone();
        let rerank_enabled = self.rerank_enabled;
        let ranker_cfg = self.ranker_cfg;

        let rows: Vec<(i64, i64, f32, String)> = self
            .pool
            .run(move |conn| {
                let chunk_hits = vector::search(conn, EmbeddingKind::Chunk, &embedding, limit * 3)?;
                let message_hits = vector::search(conn, EmbeddingKind::Message, &embedding, limit * 2)?;

                let mut best: std::collections::HashMap<i64, (f32, String)> = std::collections::HashMap::new();
                for hit in chunk_hits {
                    if (hit.similarity as f64) < min_sim {
                        continue;
                    }
                    let message_id: Option<i64> = conn
                        .query_row("SELECT message_id FROM chunk_embeddings WHERE chunk_id = ?", [hit.rowid], |row| row.get(0))
                        .optional()?;
                    let Some(message_id) = message_id else { continue };
                    let entry = best.entry(message_id).or_insert((hit.similarity, hit.content.clone().unwrap_or_default()));
                    if hit.similarity > entry.0 {
                        *entry = (hit.similarity, hit.content.unwrap_or_default());
                    }
                }
                for hit in message_hits {
                    if (hit.similarity as f64) < min_sim {
                        continue;
                    }
                    let entry = best.entry(hit.rowid).or_insert((hit.similarity, hit.content.clone().unwrap_or_default()));
                    if hit.similarity > entry.0 {
                        *entry = (hit.similarity, hit.content.unwrap_or_default());
                    }
                }

                let vector_ranking: Vec<i64> = {
                    let mut v: Vec<(i64, f32)> = best.iter().map(|(id, (sim, _))| (*id, *sim)).collect();
                    v.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
                    v.into_iter().map(|(id, _)| id).collect()
                };

                let ordered_ids: Vec<i64> = if rerank_enabled {
                    let fts_hits =
                        crate::search::keyword::search_with_fallback(conn, SearchTarget::Messages, &query_owned, limit * 2).unwrap_or_default();
                    for hit in &fts_hits {
                        best.entry(hit.rowid).or_insert((0.0, hit.content.clone()));
                    }
                    let fts_ranking: Vec<i64> = fts_hits.iter().map(|h| h.rowid).collect();
                    rank::reciprocal_rank_fusion(&vector_ranking, &fts_ranking, &ranker_cfg)
                        .into_iter()
                        .map(|(id, _)| id)
                        .collect()
                } else {
                    vector_ranking
                };

                let mut out = Vec::new();
                for message_id in &ordered_ids {
                    let (timestamp, conversation_id, kind): (i64, i64, String) = conn.query_row(
                        "SELECT timestamp, conversation_id, kind FROM messages WHERE id = ?",
                        [*message_id],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?;
                    if !filter.matches(timestamp, conversation_id, &kind) {
                        continue;
                    }
                    let (similarity, content) = best.get(message_id).cloned().unwrap_or((0.0, String::new()));
                    out.push((*message_id, conversation_id, similarity, content));
                    if out.len() >= limit {
                        break;
                    }
                }
                Ok::<_, crate::error::MemoryError>(out)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(message_id, conversation_id, similarity, content)| MessageHit {
                message_id,
                conversation_id,
                similarity,
                snippet: snippet::generate_snippet(&content, query, 240),
            })
            .collect())
    }

    async fn fts_message_search(&self, query: &str, limit: usize, filter: &SearchFilter) -> Result<Vec<MessageHit>> {
        let query_owned = query.to_string();
        let filter = filter.clone();
        let rows = self
            .pool
            .run(move |conn| {
                let hits = crate::search::keyword::search_with_fallback(conn, SearchTarget::Messages, &query_owned, limit)?;
                let mut out = Vec::new();
                for hit in hits {
                    let (timestamp, conversation_id, kind): (i64, i64, String) = conn.query_row(
                        "SELECT timestamp, conversation_id, kind FROM messages WHERE id = ?",
                        [hit.rowid],
                        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                    )?;
                    if !filter.matches(timestamp, conversation_id, &kind) {
                        continue;
                    }
                    out.push((hit.rowid, conversation_id, hit.content));
                }
                Ok::<_, crate::error::MemoryError>(out)
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(message_id, conversation_id, content)| MessageHit {
                message_id,
                conversation_id,
                similarity: 0.0,
                snippet: snippet::generate_snippet(&content, query, 240),
            })
            .collect())
    }

    async fn search_text_entities(&self, kind: EmbeddingKind, target: SearchTarget, query: &str, limit: usize) -> Result<Vec<TextHit>> {
        let embedding = if self.embedder.is_available() { self.embedder.embed(query).await.ok() } else { None };
        let query_owned = query.to_string();

        let rows: Vec<(i64, f32, String)> = self
            .pool
            .run(move |conn| {
                if let Some(embedding) = &embedding {
                    let hits = vector::search(conn, kind, embedding, limit)?;
                    if !hits.is_empty() {
                        return Ok::<_, crate::error::MemoryError>(
                            hits.into_iter().map(|h| (h.rowid, h.similarity, h.content.unwrap_or_default())).collect(),
                        );
                    }
                }
                let hits = crate::search::keyword::search_with_fallback(conn, target, &query_owned, limit)?;
                Ok(hits.into_iter().map(|h| (h.rowid, 0.0, h.content)).collect())
            })
            .await?;

        Ok(rows
            .into_iter()
            .map(|(id, similarity, content)| TextHit { id, similarity, snippet: snippet::generate_snippet(&content, query, 240) })
            .collect())
    }

    pub async fn search_decisions(&self, query: &str, limit: usize) -> Result<Vec<TextHit>> {
        self.search_text_entities(EmbeddingKind::Decision, SearchTarget::Decisions, query, limit).await
    }

    pub async fn search_mistakes(&self, query: &str, limit: usize) -> Result<Vec<TextHit>> {
        self.search_text_entities(EmbeddingKind::Mistake, SearchTarget::Mistakes, query, limit).await
    }

    pub fn rerank_enabled(&self) -> bool {
        self.rerank_enabled
    }

    pub fn ranker_config(&self) -> &RankerConfig {
        &self.ranker_cfg
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dynamic_min_similarity_scales_with_word_count() {
        assert!((dynamic_min_similarity("one") - 0.31).abs() < 1e-9);
        assert!((dynamic_min_similarity("a b c d e f g h i j k l m n o p q r s t u v w x y z aa bb") - 0.55).abs() < 1e-9);
    }

    #[test]
    fn test_filter_matches_date_range() {
        let filter = SearchFilter { since: Some(100), until: Some(200), conversation_id: None, message_kinds: None };
        assert!(filter.matches(150, 1, "text"));
        assert!(!filter.matches(50, 1, "text"));
        assert!(!filter.matches(250, 1, "text"));
    }

    #[test]
    fn test_filter_matches_conversation_id() {
        let filter = SearchFilter { since: None, until: None, conversation_id: Some(7), message_kinds: None };
        assert!(filter.matches(0, 7, "text"));
        assert!(!filter.matches(0, 8, "text"));
    }

    #[test]
    fn test_filter_matches_message_kinds() {
        let filter = SearchFilter {
            since: None,
            until: None,
            conversation_id: None,
            message_kinds: Some(vec!["summary".to_string()]),
        };
        assert!(filter.matches(0, 1, "summary"));
        assert!(!filter.matches(0, 1, "text"));
    }

    #[test]
    fn test_filter_with_no_message_kinds_accepts_any_kind() {
        let filter = SearchFilter::default();
        assert!(filter.matches(0, 1, "text"));
        assert!(filter.matches(0, 1, "summary"));
    }
}
