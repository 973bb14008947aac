// src/working/store.rs
// Sync SQL operations for the working store (run inside pool.interact()).

use super::entities::merge_entities;
use super::types::{Conversation, ConversationStatus, Turn};
use crate::db::log_and_discard;
use rusqlite::{params, Connection, OptionalExtension};
use std::str::FromStr;

/// Outcome of an append attempt, decided inside the transaction.
///
/// Rejections (unknown or non-open target conversation) are data the caller
/// maps to a ValidationError; they are not SQL failures.
#[derive(Debug)]
pub enum AppendOutcome {
    Appended {
        conversation_id: String,
        evicted: Vec<String>,
    },
    Rejected(String),
}

fn parse_conversation_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Conversation> {
    let status_raw: String = row.get("status")?;
    let entities_json: Option<String> = row.get("entities")?;
    Ok(Conversation {
        id: row.get("id")?,
        status: ConversationStatus::from_str(&status_raw)
            .unwrap_or(ConversationStatus::Closed),
        entities: entities_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default(),
        created_at: row.get("created_at")?,
        touched_at: row.get("touched_at")?,
        closed_at: row.get("closed_at")?,
        archived_at: row.get("archived_at")?,
        turn_count: row.get("turn_count").unwrap_or(0),
    })
}

/// Append a turn, resolving the target conversation and enforcing capacity,
/// all inside one transaction.
///
/// Resolution order: an explicit id must name an open conversation; with no
/// explicit id the current open conversation is reused unless it has idled
/// past `idle_cutoff` (then it is closed and a fresh one is opened as
/// `new_id`).
#[allow(clippy::too_many_arguments)]
pub fn append_turn_sync(
    conn: &Connection,
    explicit_id: Option<&str>,
    role: &str,
    content: &str,
    fresh_entities: &[String],
    idle_cutoff: &str,
    capacity: usize,
    now: &str,
    new_id: &str,
) -> rusqlite::Result<AppendOutcome> {
    let tx = conn.unchecked_transaction()?;

    let conversation_id = match explicit_id {
        Some(id) => {
            let status: Option<String> = tx
                .query_row(
                    "SELECT status FROM conversations WHERE id = ?1",
                    [id],
                    |row| row.get(0),
                )
                .optional()?;
            match status.as_deref() {
                None => {
                    return Ok(AppendOutcome::Rejected(format!(
                        "conversation {id} does not exist"
                    )))
                }
                Some("open") => id.to_string(),
                Some(other) => {
                    return Ok(AppendOutcome::Rejected(format!(
                        "conversation {id} is {other}, not open"
                    )))
                }
            }
        }
        None => {
            let open: Option<(String, String)> = tx
                .query_row(
                    "SELECT id, touched_at FROM conversations
                     WHERE status = 'open'
                     ORDER BY touched_at DESC LIMIT 1",
                    [],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;

            match open {
                Some((id, touched_at)) if touched_at.as_str() >= idle_cutoff => id,
                Some((stale_id, _)) => {
                    // Idle timeout reached: close the stale conversation and
                    // start a fresh one for this turn.
                    tx.execute(
                        "UPDATE conversations SET status = 'closed', closed_at = ?1
                         WHERE id = ?2",
                        params![now, stale_id],
                    )?;
                    create_conversation(&tx, new_id, now)?;
                    new_id.to_string()
                }
                None => {
                    create_conversation(&tx, new_id, now)?;
                    new_id.to_string()
                }
            }
        }
    };

    tx.execute(
        "INSERT INTO turns (conversation_id, role, content, created_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![conversation_id, role, content, now],
    )?;

    if !fresh_entities.is_empty() {
        let existing_json: Option<String> = tx.query_row(
            "SELECT entities FROM conversations WHERE id = ?1",
            [conversation_id.as_str()],
            |row| row.get(0),
        )?;
        let existing: Vec<String> = existing_json
            .as_deref()
            .and_then(|s| serde_json::from_str(s).ok())
            .unwrap_or_default();
        let merged = merge_entities(&existing, fresh_entities);
        let merged_json =
            serde_json::to_string(&merged).unwrap_or_else(|_| "[]".to_string());
        tx.execute(
            "UPDATE conversations SET entities = ?1 WHERE id = ?2",
            params![merged_json, conversation_id],
        )?;
    }

    tx.execute(
        "UPDATE conversations SET touched_at = ?1 WHERE id = ?2",
        params![now, conversation_id],
    )?;

    let evicted = evict_over_capacity(&tx, capacity, now)?;

    tx.commit()?;
    Ok(AppendOutcome::Appended {
        conversation_id,
        evicted,
    })
}

fn create_conversation(conn: &Connection, id: &str, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO conversations (id, status, entities, created_at, touched_at)
         VALUES (?1, 'open', '[]', ?2, ?2)",
        params![id, now],
    )?;
    Ok(())
}

/// Archive oldest-closed conversations until open+closed fit the capacity.
/// The open conversation is never touched. Returns archived ids.
pub fn evict_over_capacity(
    conn: &Connection,
    capacity: usize,
    now: &str,
) -> rusqlite::Result<Vec<String>> {
    let mut evicted = Vec::new();
    loop {
        let active: i64 = conn.query_row(
            "SELECT COUNT(*) FROM conversations WHERE status IN ('open', 'closed')",
            [],
            |row| row.get(0),
        )?;
        if active <= capacity as i64 {
            break;
        }

        // FIFO: oldest closed conversation by creation order
        let oldest: Option<String> = conn
            .query_row(
                "SELECT id FROM conversations WHERE status = 'closed'
                 ORDER BY created_at ASC, id ASC LIMIT 1",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match oldest {
            Some(id) => {
                archive_conversation_sync(conn, &id, now)?;
                evicted.push(id);
            }
            // Only the open conversation remains; capacity cannot shrink further
            None => break,
        }
    }
    Ok(evicted)
}

/// Stamp closed_at and leave the capacity window.
/// Returns false when the conversation does not exist.
pub fn close_conversation_sync(
    conn: &Connection,
    id: &str,
    now: &str,
) -> rusqlite::Result<Option<ConversationStatus>> {
    let status: Option<String> = conn
        .query_row(
            "SELECT status FROM conversations WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;

    match status.as_deref() {
        None => Ok(None),
        Some("open") => {
            conn.execute(
                "UPDATE conversations SET status = 'closed', closed_at = ?1 WHERE id = ?2",
                params![now, id],
            )?;
            Ok(Some(ConversationStatus::Closed))
        }
        Some(other) => Ok(ConversationStatus::from_str(other).ok()),
    }
}

/// Close every open conversation idle since before `cutoff`.
pub fn close_idle_sync(conn: &Connection, cutoff: &str, now: &str) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE conversations SET status = 'closed', closed_at = ?1
         WHERE status = 'open' AND touched_at < ?2",
        params![now, cutoff],
    )
}

/// Most recently touched open/closed conversations, most recent first.
pub fn get_recent_sync(conn: &Connection, k: usize) -> rusqlite::Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.status, c.entities, c.created_at, c.touched_at, c.closed_at, c.archived_at,
                (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.id) AS turn_count
         FROM conversations c
         WHERE c.status IN ('open', 'closed')
         ORDER BY c.touched_at DESC, c.id ASC
         LIMIT ?1",
    )?;

    let rows = stmt
        .query_map([k as i64], parse_conversation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Every conversation row, archived included (snapshot/export).
pub fn list_conversations_sync(conn: &Connection) -> rusqlite::Result<Vec<Conversation>> {
    let mut stmt = conn.prepare(
        "SELECT c.id, c.status, c.entities, c.created_at, c.touched_at, c.closed_at, c.archived_at,
                (SELECT COUNT(*) FROM turns t WHERE t.conversation_id = c.id) AS turn_count
         FROM conversations c
         ORDER BY c.created_at ASC, c.id ASC",
    )?;
    let rows = stmt
        .query_map([], parse_conversation_row)?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Every turn row (snapshot/export), in insertion order.
pub fn list_turns_sync(conn: &Connection) -> rusqlite::Result<Vec<Turn>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, created_at
         FROM turns ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok(Turn {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

/// Turns of one conversation, oldest first.
pub fn get_turns_sync(conn: &Connection, conversation_id: &str) -> rusqlite::Result<Vec<Turn>> {
    let mut stmt = conn.prepare(
        "SELECT id, conversation_id, role, content, created_at
         FROM turns WHERE conversation_id = ?1 ORDER BY id ASC",
    )?;
    let rows = stmt
        .query_map([conversation_id], |row| {
            Ok(Turn {
                id: row.get(0)?,
                conversation_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?
        .filter_map(log_and_discard)
        .collect();
    Ok(rows)
}

pub fn archive_conversation_sync(conn: &Connection, id: &str, now: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE conversations SET status = 'archived', archived_at = ?1 WHERE id = ?2",
        params![now, id],
    )?;
    Ok(())
}

/// Hard delete; turns cascade.
pub fn delete_conversation_sync(conn: &Connection, id: &str) -> rusqlite::Result<bool> {
    let deleted = conn.execute("DELETE FROM conversations WHERE id = ?1", [id])? > 0;
    Ok(deleted)
}

/// (open, closed, archived, turns) counts for stats and verification.
pub fn working_counts_sync(conn: &Connection) -> rusqlite::Result<(i64, i64, i64, i64)> {
    conn.query_row(
        "SELECT
            (SELECT COUNT(*) FROM conversations WHERE status = 'open'),
            (SELECT COUNT(*) FROM conversations WHERE status = 'closed'),
            (SELECT COUNT(*) FROM conversations WHERE status = 'archived'),
            (SELECT COUNT(*) FROM turns)",
        [],
        |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
    )
}
