// src/housekeeping/snapshot.rs
// Full-store row snapshots: the backup taken before Executing writes
// anything, and the payload for export/import.

use crate::db::schema::rebuild_patterns_fts;
use crate::knowledge::store as knowledge_store;
use crate::knowledge::types::{Pattern, Relationship};
use crate::working::store as working_store;
use crate::working::types::{Conversation, Turn};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkingSnapshot {
    pub conversations: Vec<Conversation>,
    pub turns: Vec<Turn>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KnowledgeSnapshot {
    pub patterns: Vec<Pattern>,
    pub relationships: Vec<Relationship>,
}

/// Both stores, captured consistently enough to restore byte-for-byte.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSnapshot {
    pub working: WorkingSnapshot,
    pub knowledge: KnowledgeSnapshot,
}

impl EngineSnapshot {
    pub fn conversation_count(&self) -> usize {
        self.working.conversations.len()
    }

    pub fn pattern_count(&self) -> usize {
        self.knowledge.patterns.len()
    }
}

pub fn capture_working_sync(conn: &Connection) -> rusqlite::Result<WorkingSnapshot> {
    Ok(WorkingSnapshot {
        conversations: working_store::list_conversations_sync(conn)?,
        turns: working_store::list_turns_sync(conn)?,
    })
}

pub fn capture_knowledge_sync(conn: &Connection) -> rusqlite::Result<KnowledgeSnapshot> {
    Ok(KnowledgeSnapshot {
        patterns: knowledge_store::list_patterns_sync(conn)?,
        relationships: knowledge_store::list_relationships_sync(conn)?,
    })
}

/// Replace the working store's contents with the snapshot, atomically.
pub fn restore_working_sync(conn: &Connection, snapshot: &WorkingSnapshot) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute("DELETE FROM turns", [])?;
    tx.execute("DELETE FROM conversations", [])?;

    for conversation in &snapshot.conversations {
        tx.execute(
            "INSERT INTO conversations (id, status, entities, created_at, touched_at, closed_at, archived_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                conversation.id,
                conversation.status.as_str(),
                serde_json::to_string(&conversation.entities).unwrap_or_else(|_| "[]".into()),
                conversation.created_at,
                conversation.touched_at,
                conversation.closed_at,
                conversation.archived_at,
            ],
        )?;
    }
    for turn in &snapshot.turns {
        tx.execute(
            "INSERT INTO turns (id, conversation_id, role, content, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                turn.id,
                turn.conversation_id,
                turn.role,
                turn.content,
                turn.created_at,
            ],
        )?;
    }
    tx.commit()?;
    Ok(())
}

/// Replace the knowledge store's contents with the snapshot, atomically.
///
/// Foreign-key checks are deferred to commit: forwarding pointers may
/// reference patterns that appear later in the row list.
pub fn restore_knowledge_sync(
    conn: &Connection,
    snapshot: &KnowledgeSnapshot,
) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch("PRAGMA defer_foreign_keys = ON")?;
    tx.execute("DELETE FROM relationships", [])?;
    tx.execute("DELETE FROM patterns", [])?;

    for pattern in &snapshot.patterns {
        knowledge_store::insert_pattern_sync(&tx, pattern)?;
    }
    for relationship in &snapshot.relationships {
        knowledge_store::insert_relationship_sync(&tx, relationship)?;
    }

    // Trigger-maintained FTS entries survive the delete/insert churn, but a
    // rebuild guarantees index and table agree after bulk restore.
    rebuild_patterns_fts(&tx)?;
    tx.commit()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{run_knowledge_migrations, run_working_migrations};

    fn knowledge_conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        run_knowledge_migrations(&conn).unwrap();
        conn
    }

    #[test]
    fn test_knowledge_capture_restore_round_trip() {
        let conn = knowledge_conn();
        conn.execute_batch(
            "INSERT INTO patterns (id, signature, category, confidence) VALUES ('a', 'keep tests green', 'testing', 0.8);
             INSERT INTO patterns (id, signature, category, confidence, forwarding_id, archived_at)
                 VALUES ('b', 'old duplicate', 'testing', 0.4, 'a', '2026-01-01 00:00:00');
             INSERT INTO relationships (from_id, to_id, relation_type, strength) VALUES ('a', 'b', 'related', 2.0);",
        )
        .unwrap();

        let snapshot = capture_knowledge_sync(&conn).unwrap();
        assert_eq!(snapshot.patterns.len(), 2);
        assert_eq!(snapshot.relationships.len(), 1);

        // Wreck the store, then restore
        conn.execute("DELETE FROM relationships", []).unwrap();
        conn.execute("DELETE FROM patterns", []).unwrap();
        restore_knowledge_sync(&conn, &snapshot).unwrap();

        let restored = capture_knowledge_sync(&conn).unwrap();
        assert_eq!(restored.patterns.len(), 2);
        assert_eq!(restored.relationships.len(), 1);
        let forwarded = restored
            .patterns
            .iter()
            .find(|p| p.id == "b")
            .expect("forwarded row restored");
        assert_eq!(forwarded.forwarding_id.as_deref(), Some("a"));

        // FTS is queryable after restore
        let hits: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM patterns_fts WHERE patterns_fts MATCH 'tests'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(hits, 1);
    }

    #[test]
    fn test_working_capture_restore_round_trip() {
        let conn = Connection::open_in_memory().unwrap();
        run_working_migrations(&conn).unwrap();
        conn.execute_batch(
            "INSERT INTO conversations (id, status, entities) VALUES ('c1', 'closed', '[\"main.rs\"]');
             INSERT INTO turns (conversation_id, role, content) VALUES ('c1', 'user', 'fix main.rs');",
        )
        .unwrap();

        let snapshot = capture_working_sync(&conn).unwrap();
        conn.execute("DELETE FROM turns", []).unwrap();
        conn.execute("DELETE FROM conversations", []).unwrap();
        restore_working_sync(&conn, &snapshot).unwrap();

        let restored = capture_working_sync(&conn).unwrap();
        assert_eq!(restored.conversations.len(), 1);
        assert_eq!(restored.turns.len(), 1);
        assert_eq!(restored.conversations[0].entities, vec!["main.rs"]);
    }
}
