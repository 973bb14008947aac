// src/engine.rs
// MemoryEngine: explicit engine instance over injected storage pools and
// validated configuration. No global state: construct one and pass it
// around.

use crate::config::EngineConfig;
use crate::db::pool::StoreKind;
use crate::db::DatabasePool;
use crate::error::Result;
use crate::housekeeping::{FlushEngine, FlushOptions, FlushPhase, FlushReport, RunSummary};
use crate::knowledge::{KnowledgeGraph, Pattern, PatternEvidence, SearchOutcome};
use crate::transfer::{self, TransferSummary};
use crate::working::{Conversation, NewTurn, Turn, WorkingMemory};
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Aggregate store counters for the operations surface.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    pub conversations_open: i64,
    pub conversations_closed: i64,
    pub conversations_archived: i64,
    pub turns: i64,
    pub patterns_live: i64,
    pub patterns_archived: i64,
    pub patterns_forwarded: i64,
    pub average_confidence: f64,
    pub relationships: i64,
    pub retry_buffer_turns: usize,
    pub retry_buffer_bytes: usize,
    pub flush_phase: String,
    pub last_run: Option<RunSummary>,
}

impl EngineStats {
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Working memory: {} open, {} closed, {} archived ({} turns)\n",
            self.conversations_open,
            self.conversations_closed,
            self.conversations_archived,
            self.turns
        ));
        out.push_str(&format!(
            "Knowledge graph: {} live patterns (avg confidence {:.2}), {} archived, {} forwarded, {} edges\n",
            self.patterns_live,
            self.average_confidence,
            self.patterns_archived,
            self.patterns_forwarded,
            self.relationships
        ));
        out.push_str(&format!(
            "Retry buffer: {} turn(s), {} bytes\n",
            self.retry_buffer_turns, self.retry_buffer_bytes
        ));
        out.push_str(&format!("Housekeeping: {}", self.flush_phase));
        match &self.last_run {
            Some(run) => out.push_str(&format!(
                "; last run {} ({}) at {}\n",
                run.id, run.status, run.started_at
            )),
            None => out.push_str("; no runs recorded\n"),
        }
        out
    }
}

/// The tiered knowledge-memory engine: working memory, knowledge graph,
/// and housekeeping behind one handle.
pub struct MemoryEngine {
    config: Arc<tokio::sync::RwLock<EngineConfig>>,
    working: WorkingMemory,
    knowledge: KnowledgeGraph,
    flush: FlushEngine,
}

impl MemoryEngine {
    /// Open the engine over `working.db` and `knowledge.db` in `data_dir`.
    pub async fn open(data_dir: &Path, config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let working_pool = Arc::new(
            DatabasePool::open(&data_dir.join("working.db"), StoreKind::Working).await?,
        );
        let knowledge_pool = Arc::new(
            DatabasePool::open(&data_dir.join("knowledge.db"), StoreKind::Knowledge).await?,
        );
        info!("Engine stores opened under {}", data_dir.display());
        Ok(Self::assemble(working_pool, knowledge_pool, config))
    }

    /// Fully in-memory engine (tests and throwaway sessions).
    pub async fn open_in_memory(config: EngineConfig) -> Result<Self> {
        config.validate()?;
        let working_pool = Arc::new(DatabasePool::open_in_memory(StoreKind::Working).await?);
        let knowledge_pool = Arc::new(DatabasePool::open_in_memory(StoreKind::Knowledge).await?);
        Ok(Self::assemble(working_pool, knowledge_pool, config))
    }

    /// Wire services over already-opened pools (injected storage handles).
    pub fn assemble(
        working_pool: Arc<DatabasePool>,
        knowledge_pool: Arc<DatabasePool>,
        config: EngineConfig,
    ) -> Self {
        let config = Arc::new(tokio::sync::RwLock::new(config));
        let working = WorkingMemory::new(working_pool.clone(), config.clone());
        let knowledge = KnowledgeGraph::new(knowledge_pool.clone(), config.clone());
        let flush = FlushEngine::new(working_pool, knowledge_pool, config.clone());
        Self {
            config,
            working,
            knowledge,
            flush,
        }
    }

    pub fn working(&self) -> &WorkingMemory {
        &self.working
    }

    pub fn knowledge(&self) -> &KnowledgeGraph {
        &self.knowledge
    }

    pub fn config(&self) -> &Arc<tokio::sync::RwLock<EngineConfig>> {
        &self.config
    }

    /// Swap in a new configuration without restarting. Rejected unless it
    /// validates; takes effect for subsequent operations.
    pub async fn update_config(&self, config: EngineConfig) -> Result<()> {
        config.validate()?;
        *self.config.write().await = config;
        info!("Engine configuration reloaded");
        Ok(())
    }

    // ── Capture path ──

    pub async fn append_turn(
        &self,
        conversation_id: Option<&str>,
        turn: NewTurn,
    ) -> Result<String> {
        self.working.append_turn(conversation_id, turn).await
    }

    pub async fn close_conversation(&self, id: &str) -> Result<()> {
        self.working.close_conversation(id).await
    }

    pub async fn get_recent(&self, k: usize) -> Result<Vec<Conversation>> {
        self.working.get_recent(k).await
    }

    pub async fn get_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        self.working.get_turns(conversation_id).await
    }

    // ── Learning path ──

    pub async fn upsert_pattern(
        &self,
        signature: &str,
        category: &str,
        evidence: PatternEvidence,
    ) -> Result<String> {
        self.knowledge.upsert_pattern(signature, category, evidence).await
    }

    pub async fn record_relationship(
        &self,
        from_id: &str,
        to_id: &str,
        relation_type: &str,
    ) -> Result<()> {
        self.knowledge
            .record_relationship(from_id, to_id, relation_type)
            .await
    }

    pub async fn merge_patterns(&self, a: &str, b: &str) -> Result<String> {
        self.knowledge.merge(a, b).await
    }

    // ── Retrieval path ──

    pub async fn search(
        &self,
        query: &str,
        min_confidence: f64,
        limit: usize,
    ) -> Result<SearchOutcome> {
        self.knowledge.search(query, min_confidence, limit).await
    }

    pub async fn get_pattern(&self, id: &str) -> Result<Option<Pattern>> {
        self.knowledge.get_pattern(id).await
    }

    // ── Operations surface ──

    pub async fn run_housekeeping(&self, dry_run: bool, force: bool) -> Result<FlushReport> {
        self.flush.run(FlushOptions { dry_run, force }).await
    }

    pub fn flush_phase(&self) -> FlushPhase {
        self.flush.phase()
    }

    pub async fn stats(&self) -> Result<EngineStats> {
        let (open, closed, archived, turns) = self
            .working
            .pool()
            .interact_raw(crate::working::store::working_counts_sync)
            .await?;
        let (live, pattern_archived, forwarded, average_confidence) = self
            .knowledge
            .pool()
            .interact_raw(crate::knowledge::store::pattern_counts_sync)
            .await?;
        let relationships = self
            .knowledge
            .pool()
            .interact_raw(crate::knowledge::store::relationship_count_sync)
            .await?;
        let (retry_buffer_turns, retry_buffer_bytes) = self.working.retry_backlog();
        let last_run = self.flush.last_run().await?;

        Ok(EngineStats {
            conversations_open: open,
            conversations_closed: closed,
            conversations_archived: archived,
            turns,
            patterns_live: live,
            patterns_archived: pattern_archived,
            patterns_forwarded: forwarded,
            average_confidence,
            relationships,
            retry_buffer_turns,
            retry_buffer_bytes,
            flush_phase: self.flush.phase().as_str().to_string(),
            last_run,
        })
    }

    /// Write both stores to a JSON file.
    pub async fn export(&self, path: &Path) -> Result<TransferSummary> {
        transfer::export_to_path(self.working.pool(), self.knowledge.pool(), path).await
    }

    /// Load a JSON export into empty stores.
    pub async fn import(&self, path: &Path) -> Result<TransferSummary> {
        transfer::import_from_path(self.working.pool(), self.knowledge.pool(), path).await
    }
}
