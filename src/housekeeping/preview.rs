// src/housekeeping/preview.rs
// Flush preview: the full, read-only plan emitted before any destructive
// transition. Dry runs stop here.

use serde::Serialize;

/// Which store an action touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StoreTier {
    WorkingMemory,
    KnowledgeGraph,
}

impl StoreTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            StoreTier::WorkingMemory => "working-memory",
            StoreTier::KnowledgeGraph => "knowledge-graph",
        }
    }
}

/// What executing would do to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ActionKind {
    Archive,
    Delete,
    Merge,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Archive => "archive",
            ActionKind::Delete => "delete",
            ActionKind::Merge => "merge",
        }
    }
}

/// One planned mutation with its rationale.
#[derive(Debug, Clone, Serialize)]
pub struct PlannedAction {
    pub tier: StoreTier,
    pub kind: ActionKind,
    pub record_id: String,
    /// For merges: the surviving canonical id.
    pub merge_into: Option<String>,
    pub rationale: String,
    /// Estimated bytes reclaimed if this action lands.
    pub reclaim_bytes: i64,
}

/// The complete read-only plan for one housekeeping run.
#[derive(Debug, Clone, Serialize)]
pub struct FlushPreview {
    pub actions: Vec<PlannedAction>,
    pub estimated_reclaim_bytes: i64,
    /// Set when the merge scan was capped and may have missed pairs.
    pub merge_scan_truncated: bool,
    pub generated_at: String,
}

impl FlushPreview {
    pub fn new(actions: Vec<PlannedAction>, merge_scan_truncated: bool, generated_at: String) -> Self {
        let estimated_reclaim_bytes = actions.iter().map(|a| a.reclaim_bytes).sum();
        Self {
            actions,
            estimated_reclaim_bytes,
            merge_scan_truncated,
            generated_at,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    fn count(&self, tier: StoreTier, kind: ActionKind) -> usize {
        self.actions
            .iter()
            .filter(|a| a.tier == tier && a.kind == kind)
            .count()
    }

    pub fn conversation_archive_candidates(&self) -> usize {
        self.count(StoreTier::WorkingMemory, ActionKind::Archive)
    }

    pub fn conversation_delete_candidates(&self) -> usize {
        self.count(StoreTier::WorkingMemory, ActionKind::Delete)
    }

    pub fn pattern_delete_candidates(&self) -> usize {
        self.count(StoreTier::KnowledgeGraph, ActionKind::Delete)
    }

    pub fn pattern_merge_candidates(&self) -> usize {
        self.count(StoreTier::KnowledgeGraph, ActionKind::Merge)
    }

    /// Human-readable preview: counts first, then per-item rationale.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.is_empty() {
            out.push_str("Nothing to do: every record is within policy.\n");
            return out;
        }

        out.push_str(&format!(
            "Planned actions: {} (≈{} bytes reclaimable)\n",
            self.actions.len(),
            self.estimated_reclaim_bytes
        ));
        out.push_str(&format!(
            "  working memory: {} archive, {} delete\n",
            self.conversation_archive_candidates(),
            self.conversation_delete_candidates(),
        ));
        out.push_str(&format!(
            "  knowledge graph: {} delete, {} merge\n",
            self.pattern_delete_candidates(),
            self.pattern_merge_candidates(),
        ));
        if self.merge_scan_truncated {
            out.push_str("  note: merge scan hit its cap; rerun to find further pairs\n");
        }
        for action in &self.actions {
            match &action.merge_into {
                Some(into) => out.push_str(&format!(
                    "  [{} {}] {} -> {}: {}\n",
                    action.tier.as_str(),
                    action.kind.as_str(),
                    action.record_id,
                    into,
                    action.rationale
                )),
                None => out.push_str(&format!(
                    "  [{} {}] {}: {}\n",
                    action.tier.as_str(),
                    action.kind.as_str(),
                    action.record_id,
                    action.rationale
                )),
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn action(tier: StoreTier, kind: ActionKind, id: &str, bytes: i64) -> PlannedAction {
        PlannedAction {
            tier,
            kind,
            record_id: id.to_string(),
            merge_into: None,
            rationale: "test".to_string(),
            reclaim_bytes: bytes,
        }
    }

    #[test]
    fn test_empty_preview_renders_no_op() {
        let preview = FlushPreview::new(Vec::new(), false, "2026-01-01 00:00:00".into());
        assert!(preview.is_empty());
        assert!(preview.render().contains("Nothing to do"));
    }

    #[test]
    fn test_counts_by_tier_and_kind() {
        let preview = FlushPreview::new(
            vec![
                action(StoreTier::WorkingMemory, ActionKind::Archive, "c1", 10),
                action(StoreTier::KnowledgeGraph, ActionKind::Delete, "p1", 100),
                action(StoreTier::KnowledgeGraph, ActionKind::Delete, "p2", 50),
                action(StoreTier::KnowledgeGraph, ActionKind::Merge, "p3", 0),
            ],
            false,
            "2026-01-01 00:00:00".into(),
        );
        assert_eq!(preview.conversation_archive_candidates(), 1);
        assert_eq!(preview.pattern_delete_candidates(), 2);
        assert_eq!(preview.pattern_merge_candidates(), 1);
        assert_eq!(preview.estimated_reclaim_bytes, 160);
    }

    #[test]
    fn test_render_lists_rationale_per_item() {
        let preview = FlushPreview::new(
            vec![action(StoreTier::KnowledgeGraph, ActionKind::Delete, "p9", 1)],
            true,
            "2026-01-01 00:00:00".into(),
        );
        let rendered = preview.render();
        assert!(rendered.contains("p9"));
        assert!(rendered.contains("merge scan hit its cap"));
    }
}
