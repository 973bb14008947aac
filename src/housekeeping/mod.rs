// src/housekeeping/mod.rs
// Flush engine: the transactional maintenance state machine.
//
//   Idle → Analyzing → PreviewReady → (Confirmed | Aborted)
//        → Executing → Verifying → Idle | RolledBack
//
// Analyzing is read-only; PreviewReady is the whole output of a dry run and
// mandatory before anything destructive; Executing snapshots both stores
// first and mutates each inside a single transaction; Verifying re-reads
// post-state and restores the snapshots on any violation.

pub mod execute;
pub mod policy;
pub mod preview;
pub mod scheduler;
pub mod snapshot;

pub use preview::{ActionKind, FlushPreview, PlannedAction, StoreTier};

use crate::config::EngineConfig;
use crate::db::{now_ts, DatabasePool};
use crate::error::{EngramError, Result};
use chrono::Utc;
use execute::{DeleteTrace, ExecutedCounts};
use rusqlite::OptionalExtension;
use serde::Serialize;
use std::sync::{Arc, Mutex};
use tracing::{error, info, warn};

/// Where the state machine currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FlushPhase {
    Idle,
    Analyzing,
    PreviewReady,
    Executing,
    Verifying,
    RolledBack,
}

impl FlushPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            FlushPhase::Idle => "idle",
            FlushPhase::Analyzing => "analyzing",
            FlushPhase::PreviewReady => "preview-ready",
            FlushPhase::Executing => "executing",
            FlushPhase::Verifying => "verifying",
            FlushPhase::RolledBack => "rolled-back",
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunStatus {
    Completed,
    DryRun,
    Failed,
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Completed => "completed",
            RunStatus::DryRun => "dry_run",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolled_back",
        }
    }
}

/// Options for one run.
#[derive(Debug, Clone, Copy)]
pub struct FlushOptions {
    /// Stop at PreviewReady; mutate nothing.
    pub dry_run: bool,
    /// Collapse archive-then-purge staging: delete candidates are removed
    /// in this run, archival happening in the same transaction.
    pub force: bool,
}

/// The user-visible result of a run: plan, what landed, what failed.
#[derive(Debug, Clone, Serialize)]
pub struct FlushReport {
    pub run_id: String,
    pub status: RunStatus,
    pub preview: FlushPreview,
    pub conversations_archived: i64,
    pub conversations_deleted: i64,
    pub patterns_archived: i64,
    pub patterns_deleted: i64,
    pub patterns_merged: i64,
    pub verification_errors: Vec<String>,
    pub started_at: String,
    pub finished_at: String,
}

impl FlushReport {
    /// Readable, itemized report. On rollback it says so explicitly.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!(
            "Housekeeping run {} [{}]\n",
            self.run_id,
            self.status.as_str()
        ));
        out.push_str(&self.preview.render());
        match self.status {
            RunStatus::DryRun => {
                out.push_str("Dry run: nothing was modified.\n");
            }
            RunStatus::Completed => {
                out.push_str(&format!(
                    "Applied: {} conversations archived, {} deleted; {} patterns archived, {} deleted, {} merged.\n",
                    self.conversations_archived,
                    self.conversations_deleted,
                    self.patterns_archived,
                    self.patterns_deleted,
                    self.patterns_merged,
                ));
            }
            RunStatus::RolledBack => {
                out.push_str("Verification failed:\n");
                for violation in &self.verification_errors {
                    out.push_str(&format!("  - {violation}\n"));
                }
                out.push_str(
                    "Both stores were restored from the pre-run snapshot; no data was lost.\n",
                );
            }
            RunStatus::Failed => {
                out.push_str("Execution failed; the open transaction was rolled back.\n");
            }
        }
        out
    }
}

/// Summary of a recorded run, as read back from housekeeping_runs.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub id: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub dry_run: bool,
    pub status: String,
    pub patterns_deleted: i64,
    pub patterns_merged: i64,
}

/// The housekeeping engine. One run at a time; concurrent callers are
/// rejected rather than queued.
pub struct FlushEngine {
    working: Arc<DatabasePool>,
    knowledge: Arc<DatabasePool>,
    config: Arc<tokio::sync::RwLock<EngineConfig>>,
    phase: Mutex<FlushPhase>,
}

impl FlushEngine {
    pub fn new(
        working: Arc<DatabasePool>,
        knowledge: Arc<DatabasePool>,
        config: Arc<tokio::sync::RwLock<EngineConfig>>,
    ) -> Self {
        Self {
            working,
            knowledge,
            config,
            phase: Mutex::new(FlushPhase::Idle),
        }
    }

    pub fn phase(&self) -> FlushPhase {
        *self.phase.lock().expect("flush phase lock poisoned")
    }

    fn set_phase(&self, next: FlushPhase) {
        let mut phase = self.phase.lock().expect("flush phase lock poisoned");
        info!("Housekeeping phase: {} -> {}", phase.as_str(), next.as_str());
        *phase = next;
    }

    /// Run housekeeping. Dry runs stop at the preview. Returns the full
    /// report; a verification failure comes back as a RolledBack report,
    /// not an Err.
    pub async fn run(&self, options: FlushOptions) -> Result<FlushReport> {
        {
            let mut phase = self.phase.lock().expect("flush phase lock poisoned");
            match *phase {
                FlushPhase::Idle | FlushPhase::RolledBack => {
                    info!("Housekeeping phase: {} -> analyzing", phase.as_str());
                    *phase = FlushPhase::Analyzing;
                }
                busy => {
                    return Err(EngramError::Validation(format!(
                        "housekeeping already in progress (phase: {})",
                        busy.as_str()
                    )))
                }
            }
        }

        let result = self.drive(options).await;
        if result.is_err() {
            self.set_phase(FlushPhase::Idle);
        }
        result
    }

    async fn drive(&self, options: FlushOptions) -> Result<FlushReport> {
        let config = self.config.read().await.clone();
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = now_ts();
        let now_naive = Utc::now().naive_utc();

        // ── Analyzing ──
        let working_cfg = config.clone();
        let working_actions = self
            .working
            .interact_raw(move |conn| {
                policy::analyze_working_sync(
                    conn,
                    working_cfg.working.capacity,
                    working_cfg.working.retention_days,
                    now_naive,
                )
            })
            .await?;

        let knowledge_cfg = config.clone();
        let (knowledge_actions, merge_scan_truncated) = self
            .knowledge
            .interact_raw(move |conn| policy::analyze_knowledge_sync(conn, &knowledge_cfg, now_naive))
            .await?;

        let mut all_actions = working_actions;
        all_actions.extend(knowledge_actions);
        let preview = FlushPreview::new(all_actions, merge_scan_truncated, now_ts());
        self.set_phase(FlushPhase::PreviewReady);

        if options.dry_run {
            // Aborted: preview only, nothing mutated.
            let report = self
                .finish_run(
                    run_id,
                    RunStatus::DryRun,
                    preview,
                    ExecutedCounts::default(),
                    Vec::new(),
                    started_at,
                    true,
                )
                .await?;
            self.set_phase(FlushPhase::Idle);
            return Ok(report);
        }

        if preview.is_empty() {
            let report = self
                .finish_run(
                    run_id,
                    RunStatus::Completed,
                    preview,
                    ExecutedCounts::default(),
                    Vec::new(),
                    started_at,
                    false,
                )
                .await?;
            self.set_phase(FlushPhase::Idle);
            return Ok(report);
        }

        // ── Confirmed: snapshot both stores before the first write ──
        let working_snapshot = self
            .working
            .interact_raw(snapshot::capture_working_sync)
            .await?;
        let knowledge_snapshot = self
            .knowledge
            .interact_raw(snapshot::capture_knowledge_sync)
            .await?;

        // ── Executing ──
        self.set_phase(FlushPhase::Executing);
        let actions = Arc::new(preview.actions.clone());
        let now = now_ts();

        let exec_actions = actions.clone();
        let exec_now = now.clone();
        let working_result = self
            .working
            .interact_raw(move |conn| execute::execute_working_sync(conn, &exec_actions, &exec_now))
            .await;
        let (working_counts, working_traces) = match working_result {
            Ok(v) => v,
            Err(e) => {
                error!("Working-store execution failed, transaction rolled back: {e:#}");
                self.record_failed_run(&run_id, &started_at, &preview).await;
                return Err(EngramError::StoreUnavailable(format!("{e:#}")));
            }
        };

        let exec_actions = actions.clone();
        let exec_now = now.clone();
        let scoring = config.scoring.clone();
        let strength_cap = config.knowledge.strength_cap;
        let force = options.force;
        let knowledge_result = self
            .knowledge
            .interact_raw(move |conn| {
                execute::execute_knowledge_sync(
                    conn,
                    &exec_actions,
                    &scoring,
                    strength_cap,
                    force,
                    &exec_now,
                    now_naive,
                )
            })
            .await;
        let (knowledge_counts, knowledge_traces) = match knowledge_result {
            Ok(v) => v,
            Err(e) => {
                // The working store already committed; restore its snapshot
                // so the run is all-or-nothing across both stores.
                error!("Knowledge-store execution failed, restoring working snapshot: {e:#}");
                self.restore_snapshots(Some(working_snapshot), None).await?;
                self.record_failed_run(&run_id, &started_at, &preview).await;
                return Err(EngramError::StoreUnavailable(format!("{e:#}")));
            }
        };

        let counts = ExecutedCounts {
            conversations_archived: working_counts.conversations_archived,
            conversations_deleted: working_counts.conversations_deleted,
            patterns_archived: knowledge_counts.patterns_archived,
            patterns_deleted: knowledge_counts.patterns_deleted,
            patterns_merged: knowledge_counts.patterns_merged,
        };

        // ── Verifying ──
        self.set_phase(FlushPhase::Verifying);
        let violations = self
            .verify(&config, working_traces, knowledge_traces, options.force)
            .await?;

        if !violations.is_empty() {
            warn!(
                "Housekeeping verification failed with {} violation(s); rolling back",
                violations.len()
            );
            self.restore_snapshots(Some(working_snapshot), Some(knowledge_snapshot))
                .await?;
            let report = self
                .finish_run(
                    run_id,
                    RunStatus::RolledBack,
                    preview,
                    counts,
                    violations,
                    started_at,
                    false,
                )
                .await?;
            self.set_phase(FlushPhase::RolledBack);
            return Ok(report);
        }

        let report = self
            .finish_run(
                run_id,
                RunStatus::Completed,
                preview,
                counts,
                Vec::new(),
                started_at,
                false,
            )
            .await?;
        self.set_phase(FlushPhase::Idle);
        Ok(report)
    }

    async fn verify(
        &self,
        config: &EngineConfig,
        working_traces: Vec<DeleteTrace>,
        knowledge_traces: Vec<DeleteTrace>,
        force: bool,
    ) -> Result<Vec<String>> {
        let capacity = config.working.capacity;
        let mut violations = self
            .working
            .interact_raw(move |conn| execute::verify_working_sync(conn, capacity, &working_traces))
            .await?;

        let strength_cap = config.knowledge.strength_cap;
        let knowledge_violations = self
            .knowledge
            .interact_raw(move |conn| {
                execute::verify_knowledge_sync(conn, strength_cap, &knowledge_traces, force)
            })
            .await?;
        violations.extend(knowledge_violations);
        Ok(violations)
    }

    async fn restore_snapshots(
        &self,
        working: Option<snapshot::WorkingSnapshot>,
        knowledge: Option<snapshot::KnowledgeSnapshot>,
    ) -> Result<()> {
        if let Some(working_snapshot) = working {
            self.working
                .interact_raw(move |conn| snapshot::restore_working_sync(conn, &working_snapshot))
                .await
                .map_err(|e| {
                    EngramError::Integrity(format!("working-store rollback failed: {e:#}"))
                })?;
        }
        if let Some(knowledge_snapshot) = knowledge {
            self.knowledge
                .interact_raw(move |conn| {
                    snapshot::restore_knowledge_sync(conn, &knowledge_snapshot)
                })
                .await
                .map_err(|e| {
                    EngramError::Integrity(format!("knowledge-store rollback failed: {e:#}"))
                })?;
        }
        info!("Pre-run snapshots restored");
        Ok(())
    }

    /// Persist the run record and assemble the report.
    #[allow(clippy::too_many_arguments)]
    async fn finish_run(
        &self,
        run_id: String,
        status: RunStatus,
        preview: FlushPreview,
        counts: ExecutedCounts,
        verification_errors: Vec<String>,
        started_at: String,
        dry_run: bool,
    ) -> Result<FlushReport> {
        let finished_at = now_ts();
        let report = FlushReport {
            run_id: run_id.clone(),
            status,
            preview,
            conversations_archived: counts.conversations_archived,
            conversations_deleted: counts.conversations_deleted,
            patterns_archived: counts.patterns_archived,
            patterns_deleted: counts.patterns_deleted,
            patterns_merged: counts.patterns_merged,
            verification_errors,
            started_at: started_at.clone(),
            finished_at: finished_at.clone(),
        };

        let (open, closed, archived, _) = self
            .working
            .interact_raw(crate::working::store::working_counts_sync)
            .await?;
        let resulting_conversations = open + closed + archived;
        let rendered = report.render();

        let status_str = status.as_str().to_string();
        self.knowledge
            .interact_raw(move |conn| {
                let resulting_patterns: i64 = conn.query_row(
                    "SELECT COUNT(*) FROM patterns WHERE archived_at IS NULL AND forwarding_id IS NULL",
                    [],
                    |row| row.get(0),
                )?;
                conn.execute(
                    "INSERT INTO housekeeping_runs
                        (id, started_at, finished_at, dry_run,
                         conversations_archived, conversations_deleted,
                         patterns_archived, patterns_deleted, patterns_merged,
                         resulting_conversations, resulting_patterns, status, report)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                    rusqlite::params![
                        run_id,
                        started_at,
                        finished_at,
                        dry_run as i64,
                        counts.conversations_archived,
                        counts.conversations_deleted,
                        counts.patterns_archived,
                        counts.patterns_deleted,
                        counts.patterns_merged,
                        resulting_conversations,
                        resulting_patterns,
                        status_str,
                        rendered,
                    ],
                )?;
                Ok(())
            })
            .await?;

        Ok(report)
    }

    /// Best-effort failure record; the run already failed, so a second
    /// failure here is only logged.
    async fn record_failed_run(&self, run_id: &str, started_at: &str, preview: &FlushPreview) {
        let run_id = run_id.to_string();
        let started_at = started_at.to_string();
        let rendered = preview.render();
        let finished_at = now_ts();
        let result = self
            .knowledge
            .interact_raw(move |conn| {
                conn.execute(
                    "INSERT INTO housekeeping_runs (id, started_at, finished_at, dry_run, status, report)
                     VALUES (?1, ?2, ?3, 0, 'failed', ?4)",
                    rusqlite::params![run_id, started_at, finished_at, rendered],
                )?;
                Ok(())
            })
            .await;
        if let Err(e) = result {
            warn!("Could not record failed housekeeping run: {e:#}");
        }
    }

    /// Most recent recorded run, if any.
    pub async fn last_run(&self) -> Result<Option<RunSummary>> {
        self.knowledge
            .interact_raw(|conn| {
                conn.query_row(
                    "SELECT id, started_at, finished_at, dry_run, status, patterns_deleted, patterns_merged
                     FROM housekeeping_runs ORDER BY started_at DESC, rowid DESC LIMIT 1",
                    [],
                    |row| {
                        Ok(RunSummary {
                            id: row.get(0)?,
                            started_at: row.get(1)?,
                            finished_at: row.get(2)?,
                            dry_run: row.get::<_, i64>(3)? != 0,
                            status: row.get(4)?,
                            patterns_deleted: row.get(5)?,
                            patterns_merged: row.get(6)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(Into::into)
    }
}
