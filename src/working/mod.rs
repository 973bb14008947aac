// src/working/mod.rs
// Working Memory: bounded, FIFO-evicted store of recent conversations.

pub mod entities;
pub mod retry;
pub mod store;
pub mod types;

pub use types::{Conversation, ConversationStatus, NewTurn, Turn, TurnRole};

use crate::config::EngineConfig;
use crate::db::{now_ts, DatabasePool, TS_FORMAT};
use crate::error::{EngramError, Result};
use chrono::{Duration, Utc};
use retry::{PendingTurn, RetryBuffer};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

/// Working Memory service.
///
/// Owns the conversation/turn tables of `working.db` plus the in-process
/// retry buffer. All writes ride the pool's contention backoff; when a write
/// still fails the turn is parked in the buffer and replayed on the next
/// successful append.
pub struct WorkingMemory {
    pool: Arc<DatabasePool>,
    config: Arc<tokio::sync::RwLock<EngineConfig>>,
    buffer: Mutex<RetryBuffer>,
}

impl WorkingMemory {
    pub fn new(pool: Arc<DatabasePool>, config: Arc<tokio::sync::RwLock<EngineConfig>>) -> Self {
        Self {
            pool,
            config,
            buffer: Mutex::new(RetryBuffer::new()),
        }
    }

    pub fn pool(&self) -> &Arc<DatabasePool> {
        &self.pool
    }

    /// Append a turn, opening a conversation if none is active.
    ///
    /// Returns the id of the conversation the turn landed in. May archive
    /// the oldest closed conversation when capacity is exceeded; the open
    /// conversation is never evicted.
    pub async fn append_turn(
        &self,
        conversation_id: Option<&str>,
        turn: NewTurn,
    ) -> Result<String> {
        let working = self.config.read().await.working.clone();

        if turn.content.trim().is_empty() {
            return Err(EngramError::Validation("turn content is empty".into()));
        }
        if turn.content.len() > working.max_turn_bytes {
            return Err(EngramError::CapacityExceeded(format!(
                "turn of {} bytes exceeds the {} byte ceiling",
                turn.content.len(),
                working.max_turn_bytes
            )));
        }

        // Replay anything parked from earlier failures before taking new work.
        self.flush_retry_buffer(&working).await;

        let conversation_owned = conversation_id.map(str::to_string);
        match self
            .try_append(conversation_owned.clone(), &turn, &working)
            .await
        {
            Ok(id) => Ok(id),
            Err(EngramError::Validation(msg)) => Err(EngramError::Validation(msg)),
            Err(store_err) => {
                // Park the turn so it is not lost, then surface the failure.
                let pending = PendingTurn::new(conversation_owned, &turn);
                let parked = {
                    let mut buffer = self.buffer.lock().expect("retry buffer lock poisoned");
                    buffer.push(pending, working.retry_buffer_bytes)
                };
                match parked {
                    Ok(()) => {
                        warn!("Turn parked in retry buffer after store failure: {store_err}");
                        Err(store_err)
                    }
                    Err(_rejected) => Err(EngramError::CapacityExceeded(format!(
                        "retry buffer full ({} bytes); turn rejected after store failure: {store_err}",
                        working.retry_buffer_bytes
                    ))),
                }
            }
        }
    }

    async fn try_append(
        &self,
        conversation_id: Option<String>,
        turn: &NewTurn,
        working: &crate::config::WorkingConfig,
    ) -> Result<String> {
        let fresh_entities = entities::extract_entities(&turn.content);
        let now = now_ts();
        let idle_cutoff = (Utc::now() - Duration::minutes(working.idle_timeout_minutes))
            .naive_utc()
            .format(TS_FORMAT)
            .to_string();
        let capacity = working.capacity;
        let role = turn.role.as_str().to_string();
        let content = turn.content.clone();
        let new_id = uuid::Uuid::new_v4().to_string();

        let outcome = self
            .pool
            .interact_with_retry(move |conn| {
                store::append_turn_sync(
                    conn,
                    conversation_id.as_deref(),
                    &role,
                    &content,
                    &fresh_entities,
                    &idle_cutoff,
                    capacity,
                    &now,
                    &new_id,
                )
                .map_err(Into::into)
            })
            .await
            .map_err(|e| EngramError::StoreUnavailable(format!("{e:#}")))?;

        match outcome {
            store::AppendOutcome::Appended {
                conversation_id,
                evicted,
            } => {
                if !evicted.is_empty() {
                    info!(
                        "Working memory over capacity: archived {} conversation(s): {:?}",
                        evicted.len(),
                        evicted
                    );
                }
                Ok(conversation_id)
            }
            store::AppendOutcome::Rejected(reason) => Err(EngramError::Validation(reason)),
        }
    }

    /// Replay parked turns, oldest first. Stops at the first failure and
    /// requeues the remainder.
    async fn flush_retry_buffer(&self, working: &crate::config::WorkingConfig) {
        let pending = {
            let mut buffer = self.buffer.lock().expect("retry buffer lock poisoned");
            if buffer.is_empty() {
                return;
            }
            buffer.drain()
        };

        let total = pending.len();
        let mut replayed = 0usize;
        let mut iter = pending.into_iter();
        while let Some(turn) = iter.next() {
            let as_new = NewTurn {
                role: turn.role,
                content: turn.content.clone(),
            };
            match self
                .try_append(turn.conversation_id.clone(), &as_new, working)
                .await
            {
                Ok(_) => replayed += 1,
                Err(e) => {
                    let mut remaining = vec![turn];
                    remaining.extend(iter);
                    let mut buffer = self.buffer.lock().expect("retry buffer lock poisoned");
                    buffer.requeue_front(remaining);
                    warn!(
                        "Retry buffer replay stopped after {replayed}/{total} turn(s): {e}"
                    );
                    return;
                }
            }
        }
        if replayed > 0 {
            info!("Replayed {replayed} buffered turn(s) into working memory");
        }
    }

    /// Close a conversation explicitly. Idempotent for already-closed ids.
    pub async fn close_conversation(&self, id: &str) -> Result<()> {
        let id = id.to_string();
        let now = now_ts();
        let status = self
            .pool
            .interact_raw(move |conn| store::close_conversation_sync(conn, &id, &now))
            .await?;

        match status {
            None => Err(EngramError::Validation(
                "cannot close unknown conversation".into(),
            )),
            Some(_) => Ok(()),
        }
    }

    /// Close every conversation that has idled past the timeout.
    /// The scheduler calls this on each tick.
    pub async fn close_idle(&self) -> Result<usize> {
        let idle_minutes = self.config.read().await.working.idle_timeout_minutes;
        let cutoff = (Utc::now() - Duration::minutes(idle_minutes))
            .naive_utc()
            .format(TS_FORMAT)
            .to_string();
        let now = now_ts();

        let closed = self
            .pool
            .interact_raw(move |conn| store::close_idle_sync(conn, &cutoff, &now))
            .await?;
        if closed > 0 {
            debug!("Auto-closed {closed} idle conversation(s)");
        }
        Ok(closed)
    }

    /// The k most recently touched conversations, most recent first.
    pub async fn get_recent(&self, k: usize) -> Result<Vec<Conversation>> {
        self.pool
            .interact_raw(move |conn| store::get_recent_sync(conn, k))
            .await
            .map_err(Into::into)
    }

    /// Turns of one conversation, oldest first.
    pub async fn get_turns(&self, conversation_id: &str) -> Result<Vec<Turn>> {
        let id = conversation_id.to_string();
        self.pool
            .interact_raw(move |conn| store::get_turns_sync(conn, &id))
            .await
            .map_err(Into::into)
    }

    /// (queued turns, queued bytes) in the retry buffer.
    pub fn retry_backlog(&self) -> (usize, usize) {
        let buffer = self.buffer.lock().expect("retry buffer lock poisoned");
        (buffer.len(), buffer.bytes())
    }
}
