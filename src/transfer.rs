// src/transfer.rs
// JSON export/import of both stores. Import targets empty stores only and
// reproduces counts and confidences exactly.

use crate::db::{now_ts, DatabasePool};
use crate::error::{EngramError, Result};
use crate::housekeeping::snapshot::{
    capture_knowledge_sync, capture_working_sync, restore_knowledge_sync, restore_working_sync,
    EngineSnapshot,
};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::info;

const EXPORT_VERSION: u32 = 1;

/// On-disk export document.
#[derive(Debug, Serialize, Deserialize)]
pub struct ExportFile {
    pub version: u32,
    pub exported_at: String,
    pub snapshot: EngineSnapshot,
}

/// What moved, for reporting.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TransferSummary {
    pub conversations: usize,
    pub turns: usize,
    pub patterns: usize,
    pub relationships: usize,
}

/// Export both stores to a JSON file at `path`.
pub async fn export_to_path(
    working: &DatabasePool,
    knowledge: &DatabasePool,
    path: &Path,
) -> Result<TransferSummary> {
    let working_snapshot = working.interact_raw(capture_working_sync).await?;
    let knowledge_snapshot = knowledge.interact_raw(capture_knowledge_sync).await?;

    let snapshot = EngineSnapshot {
        working: working_snapshot,
        knowledge: knowledge_snapshot,
    };
    let summary = TransferSummary {
        conversations: snapshot.working.conversations.len(),
        turns: snapshot.working.turns.len(),
        patterns: snapshot.knowledge.patterns.len(),
        relationships: snapshot.knowledge.relationships.len(),
    };

    let document = ExportFile {
        version: EXPORT_VERSION,
        exported_at: now_ts(),
        snapshot,
    };

    let file = File::create(path)?;
    serde_json::to_writer_pretty(BufWriter::new(file), &document)?;
    info!(
        "Exported {} conversations and {} patterns to {}",
        summary.conversations,
        summary.patterns,
        path.display()
    );
    Ok(summary)
}

/// Import a JSON export into both stores. Fails with a ValidationError if
/// either store already holds data; import never merges.
pub async fn import_from_path(
    working: &DatabasePool,
    knowledge: &DatabasePool,
    path: &Path,
) -> Result<TransferSummary> {
    let file = File::open(path)?;
    let document: ExportFile = serde_json::from_reader(BufReader::new(file))?;
    if document.version != EXPORT_VERSION {
        return Err(EngramError::Validation(format!(
            "unsupported export version {} (expected {EXPORT_VERSION})",
            document.version
        )));
    }

    let (open, closed, archived, turns) = working
        .interact_raw(crate::working::store::working_counts_sync)
        .await?;
    if open + closed + archived + turns > 0 {
        return Err(EngramError::Validation(
            "import requires an empty working store".into(),
        ));
    }
    let existing_patterns: i64 = knowledge
        .interact_raw(|conn| {
            conn.query_row(
                "SELECT (SELECT COUNT(*) FROM patterns) + (SELECT COUNT(*) FROM relationships)",
                [],
                |row| row.get(0),
            )
        })
        .await?;
    if existing_patterns > 0 {
        return Err(EngramError::Validation(
            "import requires an empty knowledge store".into(),
        ));
    }

    let summary = TransferSummary {
        conversations: document.snapshot.working.conversations.len(),
        turns: document.snapshot.working.turns.len(),
        patterns: document.snapshot.knowledge.patterns.len(),
        relationships: document.snapshot.knowledge.relationships.len(),
    };

    let working_snapshot = document.snapshot.working;
    working
        .interact_raw(move |conn| restore_working_sync(conn, &working_snapshot))
        .await?;
    let knowledge_snapshot = document.snapshot.knowledge;
    knowledge
        .interact_raw(move |conn| restore_knowledge_sync(conn, &knowledge_snapshot))
        .await?;

    info!(
        "Imported {} conversations and {} patterns from {}",
        summary.conversations,
        summary.patterns,
        path.display()
    );
    Ok(summary)
}
