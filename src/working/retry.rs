// src/working/retry.rs
// Bounded in-process retry buffer for turns that could not be persisted.
//
// Best-effort and non-durable: the buffer lives in process memory and is
// gone on restart. Callers that need durability retry at the application
// layer. What the buffer guarantees is signal: a turn is either queued for
// retry or rejected with CapacityExceeded, never silently dropped.

use super::types::{NewTurn, TurnRole};
use std::collections::VecDeque;

/// Fixed bookkeeping cost per queued turn, on top of its content bytes.
const PER_TURN_OVERHEAD: usize = 64;

/// A turn waiting to be replayed against the store.
#[derive(Debug, Clone)]
pub struct PendingTurn {
    pub conversation_id: Option<String>,
    pub role: TurnRole,
    pub content: String,
}

impl PendingTurn {
    pub fn new(conversation_id: Option<String>, turn: &NewTurn) -> Self {
        Self {
            conversation_id,
            role: turn.role,
            content: turn.content.clone(),
        }
    }

    /// Accounting size of this turn inside the buffer.
    fn cost(&self) -> usize {
        self.content.len()
            + self.conversation_id.as_ref().map_or(0, |id| id.len())
            + PER_TURN_OVERHEAD
    }
}

/// FIFO queue of unpersisted turns with a byte ceiling.
#[derive(Debug, Default)]
pub struct RetryBuffer {
    queue: VecDeque<PendingTurn>,
    bytes: usize,
}

impl RetryBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a turn for retry. Returns the turn back when the ceiling would
    /// be exceeded so the caller can surface CapacityExceeded.
    pub fn push(&mut self, turn: PendingTurn, max_bytes: usize) -> Result<(), PendingTurn> {
        let cost = turn.cost();
        if self.bytes + cost > max_bytes {
            return Err(turn);
        }
        self.bytes += cost;
        self.queue.push_back(turn);
        Ok(())
    }

    /// Put previously accepted turns back at the front, oldest first.
    /// Bypasses the ceiling: these bytes were already admitted once.
    pub fn requeue_front(&mut self, turns: Vec<PendingTurn>) {
        for turn in turns.into_iter().rev() {
            self.bytes += turn.cost();
            self.queue.push_front(turn);
        }
    }

    /// Take everything queued, oldest first.
    pub fn drain(&mut self) -> Vec<PendingTurn> {
        self.bytes = 0;
        self.queue.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(content: &str) -> PendingTurn {
        PendingTurn::new(None, &NewTurn::user(content))
    }

    #[test]
    fn test_push_and_drain_fifo() {
        let mut buffer = RetryBuffer::new();
        buffer.push(pending("first"), 1024).unwrap();
        buffer.push(pending("second"), 1024).unwrap();

        let drained = buffer.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].content, "first");
        assert_eq!(drained[1].content, "second");
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
    }

    #[test]
    fn test_ceiling_rejects_and_returns_turn() {
        let mut buffer = RetryBuffer::new();
        buffer.push(pending("kept"), 1024).unwrap();

        let big = pending(&"x".repeat(2048));
        let rejected = buffer.push(big, 1024).unwrap_err();
        assert_eq!(rejected.content.len(), 2048);
        assert_eq!(buffer.len(), 1, "existing contents are untouched");
    }

    #[test]
    fn test_requeue_front_restores_order() {
        let mut buffer = RetryBuffer::new();
        buffer.push(pending("c"), 4096).unwrap();

        buffer.requeue_front(vec![pending("a"), pending("b")]);
        let drained = buffer.drain();
        let contents: Vec<&str> = drained.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_bytes_tracks_content() {
        let mut buffer = RetryBuffer::new();
        buffer.push(pending("abcd"), 4096).unwrap();
        assert!(buffer.bytes() >= 4);
        buffer.drain();
        assert_eq!(buffer.bytes(), 0);
    }
}
