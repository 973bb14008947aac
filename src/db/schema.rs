// src/db/schema.rs
// Per-store schemas and migrations

use anyhow::Result;
use rusqlite::Connection;

/// Working store schema: recent conversations and their turns.
pub const WORKING_SCHEMA: &str = r#"
-- =======================================
-- WORKING MEMORY: Conversations
-- =======================================
CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    status TEXT NOT NULL DEFAULT 'open',   -- 'open' | 'closed' | 'archived'
    entities TEXT,                         -- JSON array of extracted tokens
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    touched_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    closed_at TEXT,
    archived_at TEXT
);
CREATE INDEX IF NOT EXISTS idx_conversations_touched ON conversations(touched_at DESC);
CREATE INDEX IF NOT EXISTS idx_conversations_status ON conversations(status);

CREATE TABLE IF NOT EXISTS turns (
    id INTEGER PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    role TEXT NOT NULL,                    -- 'user' | 'assistant' | 'tool'
    content TEXT NOT NULL,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_turns_conversation ON turns(conversation_id);
"#;

/// Knowledge store schema: patterns, relationship edges, housekeeping runs,
/// and the FTS5 retrieval index.
pub const KNOWLEDGE_SCHEMA: &str = r#"
-- =======================================
-- KNOWLEDGE GRAPH: Patterns
-- =======================================
CREATE TABLE IF NOT EXISTS patterns (
    id TEXT PRIMARY KEY,
    signature TEXT NOT NULL,
    category TEXT NOT NULL DEFAULT 'general',
    confidence REAL NOT NULL DEFAULT 0.5,
    match_quality REAL NOT NULL DEFAULT 0.5,   -- running average of evidence quality
    usage_count INTEGER NOT NULL DEFAULT 1,
    success_count INTEGER NOT NULL DEFAULT 0,
    tags TEXT,                                 -- JSON array
    source_conversations TEXT,                 -- JSON array, provenance
    forwarding_id TEXT REFERENCES patterns(id),-- set when merged away
    archived_at TEXT,
    last_used_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
);
CREATE INDEX IF NOT EXISTS idx_patterns_category ON patterns(category);
CREATE INDEX IF NOT EXISTS idx_patterns_confidence ON patterns(confidence DESC);
CREATE INDEX IF NOT EXISTS idx_patterns_last_used ON patterns(last_used_at DESC);
CREATE INDEX IF NOT EXISTS idx_patterns_live
    ON patterns(category, last_used_at DESC)
    WHERE archived_at IS NULL AND forwarding_id IS NULL;

-- =======================================
-- KNOWLEDGE GRAPH: Relationship edges
-- =======================================
CREATE TABLE IF NOT EXISTS relationships (
    id INTEGER PRIMARY KEY,
    from_id TEXT NOT NULL REFERENCES patterns(id),
    to_id TEXT NOT NULL REFERENCES patterns(id),
    relation_type TEXT NOT NULL,
    strength REAL NOT NULL DEFAULT 1.0,
    occurrence_count INTEGER NOT NULL DEFAULT 1,
    first_seen TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    last_seen TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP,
    UNIQUE(from_id, to_id, relation_type)
);
CREATE INDEX IF NOT EXISTS idx_relationships_from ON relationships(from_id);
CREATE INDEX IF NOT EXISTS idx_relationships_to ON relationships(to_id);

-- =======================================
-- HOUSEKEEPING: Run records
-- =======================================
CREATE TABLE IF NOT EXISTS housekeeping_runs (
    id TEXT PRIMARY KEY,
    started_at TEXT NOT NULL,
    finished_at TEXT,
    dry_run INTEGER NOT NULL DEFAULT 0,
    conversations_archived INTEGER NOT NULL DEFAULT 0,
    conversations_deleted INTEGER NOT NULL DEFAULT 0,
    patterns_archived INTEGER NOT NULL DEFAULT 0,
    patterns_deleted INTEGER NOT NULL DEFAULT 0,
    patterns_merged INTEGER NOT NULL DEFAULT 0,
    resulting_conversations INTEGER NOT NULL DEFAULT 0,
    resulting_patterns INTEGER NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'completed',  -- 'completed' | 'dry_run' | 'failed' | 'rolled_back'
    report TEXT
);
CREATE INDEX IF NOT EXISTS idx_runs_started ON housekeeping_runs(started_at DESC);

-- =======================================
-- FULL-TEXT SEARCH (FTS5)
-- =======================================
-- External-content index over patterns, kept in sync by triggers so the
-- retrieval path never rescans the base table.
CREATE VIRTUAL TABLE IF NOT EXISTS patterns_fts USING fts5(
    signature,
    category,
    tags,
    content='patterns',
    content_rowid='rowid',
    tokenize='porter unicode61 remove_diacritics 1'
);

CREATE TRIGGER IF NOT EXISTS patterns_fts_ai AFTER INSERT ON patterns BEGIN
    INSERT INTO patterns_fts(rowid, signature, category, tags)
    VALUES (new.rowid, new.signature, new.category, new.tags);
END;

CREATE TRIGGER IF NOT EXISTS patterns_fts_ad AFTER DELETE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, signature, category, tags)
    VALUES ('delete', old.rowid, old.signature, old.category, old.tags);
END;

CREATE TRIGGER IF NOT EXISTS patterns_fts_au AFTER UPDATE ON patterns BEGIN
    INSERT INTO patterns_fts(patterns_fts, rowid, signature, category, tags)
    VALUES ('delete', old.rowid, old.signature, old.category, old.tags);
    INSERT INTO patterns_fts(rowid, signature, category, tags)
    VALUES (new.rowid, new.signature, new.category, new.tags);
END;
"#;

/// Run working-store schema setup. Idempotent, safe at every startup.
pub fn run_working_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(WORKING_SCHEMA)?;
    Ok(())
}

/// Run knowledge-store schema setup. Idempotent, safe at every startup.
pub fn run_knowledge_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(KNOWLEDGE_SCHEMA)?;
    Ok(())
}

/// Rebuild the FTS5 index from the patterns table.
/// Call after bulk row manipulation that bypasses normal write paths
/// (snapshot restore, import).
pub fn rebuild_patterns_fts(conn: &Connection) -> rusqlite::Result<()> {
    tracing::debug!("Rebuilding patterns FTS index");
    conn.execute("INSERT INTO patterns_fts(patterns_fts) VALUES('rebuild')", [])?;
    Ok(())
}
