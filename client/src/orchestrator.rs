//! Sync orchestrator - the state machine driving push/pull/reconcile cycles.
//!
//! A cycle runs `Idle -> Pushing -> Pulling -> Reconciling -> Idle`. Any
//! phase may fall into `Error`, which logs and routes back to `Idle`. Only one
//! cycle runs at a time. Operator calls wait for a running cycle; background
//! triggers that arrive mid-cycle set a pending flag and produce exactly one
//! follow-up cycle.
//!
//! The shared state lock is never held across an `.await`, so application
//! writes proceed while a cycle waits on the network.

use crate::backoff::Backoff;
use crate::config::SyncConfig;
use crate::error::{ErrorKind, Result, SyncError};
use crate::local::{lock, save_snapshot, Counts, LocalHandle, SharedState, SyncState};
use crate::persist::SnapshotFile;
use crate::remote::RemoteAdapter;
use crate::status::StatusPublisher;
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tillsync_engine::{
    conflict, AckOutcome, Change, ChangeEntry, ConflictRecord, ConflictResolver, EntityType,
    LocalStore, PullDecision, PullQuery, PushRequest, PushResponse, RejectReason, RemoteApply,
    Resolution, Schema, ServerClock, Side, SyncLogEntry, SyncType, Timestamp,
};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Phase of the sync state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Pushing,
    Pulling,
    Reconciling,
    Error,
}

impl SyncPhase {
    /// Whether a cycle is in progress.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            SyncPhase::Pushing | SyncPhase::Pulling | SyncPhase::Reconciling
        )
    }

    /// Legal transitions of the state machine.
    pub fn can_transition_to(&self, next: SyncPhase) -> bool {
        use SyncPhase::*;
        match (self, next) {
            (Error, Error) => false,
            (_, Error) => true,
            (Idle, Pushing) | (Idle, Pulling) => true,
            (Pushing, Pulling) | (Pushing, Idle) => true,
            (Pulling, Reconciling) => true,
            (Reconciling, Idle) => true,
            (Error, Idle) => true,
            _ => false,
        }
    }
}

/// What started a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncTrigger {
    Manual,
    ConnectivityRestored,
    Interval,
    Startup,
    /// Follow-up for triggers that arrived mid-cycle
    Coalesced,
}

impl SyncTrigger {
    /// Whether the trigger may be folded into a cycle already running.
    ///
    /// Operator triggers are never folded: the caller waits for its own cycle.
    pub fn is_background(&self) -> bool {
        !matches!(self, SyncTrigger::Manual)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Full,
    PushOnly,
    PullOnly,
    Reset,
}

/// Summary of one cycle.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub trigger: Option<SyncTrigger>,
    /// The trigger was folded into a cycle already running
    pub coalesced: bool,
    /// Changes confirmed by the remote
    pub pushed: usize,
    /// Changes rescheduled after a transient failure
    pub retried: usize,
    /// Changes marked failed (validation or retry budget exhausted)
    pub failed: usize,
    pub pulled: usize,
    /// Pulled records written to the local store
    pub applied: usize,
    /// Conflicts outstanding at the end of the cycle
    pub conflicts: usize,
    /// Conflicts resolved automatically by policy
    pub auto_resolved: usize,
    /// Records loaded by a reset
    pub reset_records: usize,
    pub watermark: Option<ServerClock>,
    pub watermark_committed: bool,
}

/// Result of an operator action, suitable for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperationOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl OperationOutcome {
    pub fn ok(count: usize) -> Self {
        Self {
            success: true,
            count: Some(count),
            error: None,
        }
    }

    pub fn failed(error: impl ToString) -> Self {
        Self {
            success: false,
            count: None,
            error: Some(error.to_string()),
        }
    }

    fn from_result(result: Result<usize>) -> Self {
        match result {
            Ok(count) => Self::ok(count),
            Err(e) => Self::failed(e),
        }
    }
}

/// Coordinates the local store, the remote, and the conflict resolver.
pub struct SyncOrchestrator {
    config: SyncConfig,
    remote: Arc<dyn RemoteAdapter>,
    state: SharedState,
    status: StatusPublisher,
    persistence: Option<SnapshotFile>,
    backoff: Backoff,
    phase: Mutex<SyncPhase>,
    cycle: tokio::sync::Mutex<()>,
    pending_trigger: AtomicBool,
    auth_paused: AtomicBool,
    schema_error: AtomicBool,
    trigger_tx: mpsc::UnboundedSender<SyncTrigger>,
    trigger_rx: Mutex<Option<mpsc::UnboundedReceiver<SyncTrigger>>>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("device_id", &self.config.device_id)
            .field("phase", &self.phase())
            .finish()
    }
}

impl SyncOrchestrator {
    /// Build an orchestrator around an existing store.
    pub fn new(config: SyncConfig, store: LocalStore, remote: Arc<dyn RemoteAdapter>) -> Arc<Self> {
        let persistence = config.state_path.clone().map(SnapshotFile::new);
        let backoff = Backoff::new(config.backoff_base, config.backoff_max);
        let (trigger_tx, trigger_rx) = mpsc::unbounded_channel();

        let orchestrator = Arc::new(Self {
            config,
            remote,
            state: Arc::new(Mutex::new(SyncState::new(store, ConflictResolver::new()))),
            status: StatusPublisher::new(),
            persistence,
            backoff,
            phase: Mutex::new(SyncPhase::Idle),
            cycle: tokio::sync::Mutex::new(()),
            pending_trigger: AtomicBool::new(false),
            auth_paused: AtomicBool::new(false),
            schema_error: AtomicBool::new(false),
            trigger_tx,
            trigger_rx: Mutex::new(Some(trigger_rx)),
        });

        let counts = Counts::of(&lock(&orchestrator.state));
        counts.publish(&orchestrator.status);
        orchestrator
    }

    /// Open the persisted store (if `state_path` is set) and build an orchestrator.
    pub fn open(config: SyncConfig, schema: Schema, remote: Arc<dyn RemoteAdapter>) -> Result<Arc<Self>> {
        let store = match &config.state_path {
            Some(path) => SnapshotFile::new(path).open_store(schema, &config.device_id)?,
            None => LocalStore::new(schema, config.device_id.clone()),
        };
        Ok(Self::new(config, store, remote))
    }

    /// Handle for application reads and writes.
    pub fn local(&self) -> LocalHandle {
        LocalHandle::new(
            Arc::clone(&self.state),
            self.status.clone(),
            self.persistence.clone(),
        )
    }

    pub fn status(&self) -> &StatusPublisher {
        &self.status
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn phase(&self) -> SyncPhase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Outstanding conflicts.
    pub fn conflicts(&self) -> Vec<ConflictRecord> {
        lock(&self.state)
            .conflicts
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Outstanding conflicts grouped by entity type.
    pub fn conflicts_by_type(&self) -> Vec<(EntityType, Vec<ConflictRecord>)> {
        lock(&self.state)
            .conflicts
            .by_entity_type()
            .into_iter()
            .map(|(ty, list)| (ty, list.into_iter().cloned().collect()))
            .collect()
    }

    /// Retained sync log entries, oldest first.
    pub fn sync_log(&self) -> Vec<SyncLogEntry> {
        lock(&self.state).store.log().entries().to_vec()
    }

    /// Queue entries, FIFO.
    pub fn pending_changes(&self) -> Vec<ChangeEntry> {
        lock(&self.state).store.tracker().iter().cloned().collect()
    }

    /// Connectivity signal. Going online may trigger a cycle.
    pub fn set_online(&self, online: bool) {
        let was_online = self.status.snapshot().is_online;
        self.status.set_online(online);
        tracing::info!(online, "connectivity changed");

        if online && !was_online && self.config.sync_on_reconnect {
            self.send_trigger(SyncTrigger::ConnectivityRestored);
        }
    }

    /// Ask the background task for a cycle without waiting for it.
    pub fn request_sync(&self) {
        self.send_trigger(SyncTrigger::Manual);
    }

    fn send_trigger(&self, trigger: SyncTrigger) {
        if self.trigger_tx.send(trigger).is_err() {
            tracing::debug!(?trigger, "background sync not running; trigger dropped");
        }
    }

    /// Lift the auth pause after re-authentication.
    pub fn resume_after_auth(&self) {
        self.auth_paused.store(false, Ordering::SeqCst);
        self.status.update(|s| s.auth_paused = false);
    }

    /// Clear the schema-error flag once the remote schema is repaired.
    pub fn clear_schema_error(&self) {
        self.schema_error.store(false, Ordering::SeqCst);
        self.status.update(|s| s.schema_error = false);
    }

    // ------------------------------------------------------------------
    // Operator surface
    // ------------------------------------------------------------------

    /// Full push/pull/reconcile cycle.
    pub async fn manual_sync(&self) -> OperationOutcome {
        OperationOutcome::from_result(
            self.run_cycle(SyncTrigger::Manual)
                .await
                .map(|r| r.pushed + r.applied),
        )
    }

    /// Push only.
    pub async fn push_changes(&self) -> OperationOutcome {
        OperationOutcome::from_result(
            self.run_exclusive(SyncTrigger::Manual, Mode::PushOnly)
                .await
                .map(|r| r.pushed),
        )
    }

    /// Pull and reconcile only.
    pub async fn pull_changes(&self) -> OperationOutcome {
        OperationOutcome::from_result(
            self.run_exclusive(SyncTrigger::Manual, Mode::PullOnly)
                .await
                .map(|r| r.applied),
        )
    }

    /// Discard every local change and reload the remote's snapshot.
    pub async fn reset_and_resync(&self) -> OperationOutcome {
        OperationOutcome::from_result(
            self.run_exclusive(SyncTrigger::Manual, Mode::Reset)
                .await
                .map(|r| r.reset_records),
        )
    }

    /// Resolve one conflict.
    pub fn resolve(&self, conflict_id: &str, resolution: Resolution) -> OperationOutcome {
        let now = crate::now_ms();
        let (result, counts) = {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let resolved = state
                .conflicts
                .resolve(&mut state.store, conflict_id, resolution, now);
            if let Ok(conflict) = &resolved {
                log_resolution(&mut state.store, conflict, now);
            }
            (resolved.map(|_| 1).map_err(SyncError::from), Counts::of(state))
        };
        counts.publish(&self.status);
        self.after_local_change();
        OperationOutcome::from_result(result)
    }

    /// Resolve every outstanding conflict in favour of `side`.
    pub fn resolve_all(&self, side: Side) -> OperationOutcome {
        let (result, counts) = {
            let mut state = lock(&self.state);
            let result = resolve_all_locked(&mut state, side, crate::now_ms());
            (result, Counts::of(&state))
        };
        counts.publish(&self.status);
        self.after_local_change();
        OperationOutcome::from_result(result)
    }

    /// Re-arm changes that exhausted their retries or failed validation.
    pub fn retry_failed(&self) -> OperationOutcome {
        let (count, counts) = {
            let mut state = lock(&self.state);
            let count = state.store.tracker_mut().retry_failed();
            (count, Counts::of(&state))
        };
        counts.publish(&self.status);
        self.after_local_change();
        OperationOutcome::ok(count)
    }

    // ------------------------------------------------------------------
    // Cycle control
    // ------------------------------------------------------------------

    /// Run a full cycle.
    ///
    /// A background trigger is folded into a cycle already running; a manual
    /// trigger waits for it and then runs its own.
    pub async fn run_cycle(&self, trigger: SyncTrigger) -> Result<CycleReport> {
        self.run_exclusive(trigger, Mode::Full).await
    }

    async fn run_exclusive(&self, trigger: SyncTrigger, mode: Mode) -> Result<CycleReport> {
        let guard = if trigger.is_background() {
            match self.cycle.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    self.pending_trigger.store(true, Ordering::SeqCst);
                    tracing::debug!(?trigger, "sync in progress; trigger coalesced");
                    return Ok(CycleReport {
                        trigger: Some(trigger),
                        coalesced: true,
                        ..CycleReport::default()
                    });
                }
            }
        } else {
            self.cycle.lock().await
        };

        let result = self.guarded(trigger, mode).await;
        drop(guard);
        self.drain_pending().await;
        result
    }

    /// Run the follow-up cycle owed to triggers coalesced while we held the guard.
    async fn drain_pending(&self) {
        while self.pending_trigger.swap(false, Ordering::SeqCst) {
            let guard = match self.cycle.try_lock() {
                Ok(guard) => guard,
                Err(_) => {
                    // Hand the follow-up to the current holder, unless it released in between.
                    self.pending_trigger.store(true, Ordering::SeqCst);
                    match self.cycle.try_lock() {
                        Ok(guard) if self.pending_trigger.swap(false, Ordering::SeqCst) => guard,
                        _ => return,
                    }
                }
            };
            if let Err(e) = self.guarded(SyncTrigger::Coalesced, Mode::Full).await {
                tracing::debug!(error = %e, "follow-up cycle failed");
            }
            drop(guard);
        }
    }

    /// One cycle with the exclusivity guard held.
    async fn guarded(&self, trigger: SyncTrigger, mode: Mode) -> Result<CycleReport> {
        self.check_runnable()?;

        let sync_type = match mode {
            Mode::PushOnly | Mode::Full => SyncType::Push,
            Mode::PullOnly => SyncType::Pull,
            Mode::Reset => SyncType::Reset,
        };
        tracing::info!(?trigger, ?mode, "sync cycle started");

        let mut report = CycleReport {
            trigger: Some(trigger),
            ..CycleReport::default()
        };
        let outcome = match mode {
            Mode::Reset => self.reset_phase(&mut report).await,
            _ => self.sync_phases(mode, &mut report).await,
        };

        match outcome {
            Ok(()) => {
                self.flush_log().await;
                self.persist();
                let committed = report.watermark_committed;
                let counts = Counts::of(&lock(&self.state));
                counts.publish(&self.status);
                self.status.update(|s| {
                    s.last_error = None;
                    if committed {
                        s.last_sync_time = Some(chrono::Utc::now());
                    }
                });
                tracing::info!(
                    pushed = report.pushed,
                    applied = report.applied,
                    conflicts = report.conflicts,
                    "sync cycle finished"
                );
                Ok(report)
            }
            Err(e) => {
                self.fail_cycle(sync_type, &e);
                self.persist();
                Err(e)
            }
        }
    }

    fn check_runnable(&self) -> Result<()> {
        if self.auth_paused.load(Ordering::SeqCst) {
            return Err(SyncError::Paused("re-authentication required".into()));
        }
        if self.schema_error.load(Ordering::SeqCst) {
            return Err(SyncError::Paused("remote schema needs repair".into()));
        }
        if !self.status.snapshot().is_online {
            return Err(SyncError::Transient("device is offline".into()));
        }
        Ok(())
    }

    async fn sync_phases(&self, mode: Mode, report: &mut CycleReport) -> Result<()> {
        if mode != Mode::PullOnly {
            self.transition(SyncPhase::Pushing);
            self.push_phase(report).await?;
        }
        if mode == Mode::PushOnly {
            self.transition(SyncPhase::Idle);
            return Ok(());
        }

        self.transition(SyncPhase::Pulling);
        let server_clock = self.pull_phase(report).await?;

        self.transition(SyncPhase::Reconciling);
        self.reconcile(server_clock, report)?;

        self.transition(SyncPhase::Idle);
        Ok(())
    }

    fn transition(&self, next: SyncPhase) {
        {
            let mut phase = self.phase.lock().unwrap_or_else(|e| e.into_inner());
            if !phase.can_transition_to(next) {
                tracing::error!(from = ?*phase, to = ?next, "illegal sync phase transition");
                return;
            }
            *phase = next;
        }
        tracing::debug!(phase = ?next, "sync phase");
        self.status.set_phase(next);
    }

    /// Route a cycle-level error through `Error` back to `Idle`.
    fn fail_cycle(&self, sync_type: SyncType, error: &SyncError) {
        match error.kind() {
            ErrorKind::AuthRequired => {
                self.auth_paused.store(true, Ordering::SeqCst);
                self.status.update(|s| s.auth_paused = true);
            }
            ErrorKind::SchemaMismatch => {
                self.schema_error.store(true, Ordering::SeqCst);
                self.status.update(|s| s.schema_error = true);
            }
            _ => {}
        }

        self.transition(SyncPhase::Error);
        tracing::warn!(kind = %error.kind(), error = %error, "sync cycle aborted");
        let counts = {
            let mut state = lock(&self.state);
            let device_id = state.store.device_id().clone();
            let entry = SyncLogEntry::for_store(
                device_id,
                sync_type,
                Err(error.to_string()),
                crate::now_ms(),
            );
            // A failure repeating cycle after cycle is recorded once until shipped.
            if !state.store.log().repeats_unflushed(&entry) {
                state.store.log_mut().append(entry);
            }
            Counts::of(&state)
        };
        counts.publish(&self.status);
        self.status.update(|s| s.last_error = Some(error.to_string()));
        self.transition(SyncPhase::Idle);
    }

    /// Bound a remote call by the request timeout.
    async fn call<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::time::timeout(self.config.request_timeout, fut).await?
    }

    // ------------------------------------------------------------------
    // Phases
    // ------------------------------------------------------------------

    async fn push_phase(&self, report: &mut CycleReport) -> Result<()> {
        let mut cursor = None;
        loop {
            let now = crate::now_ms();
            let (batch, request) = {
                let state = lock(&self.state);
                let batch = state
                    .store
                    .tracker()
                    .drain_after(cursor, self.config.push_batch_size, now);
                if batch.is_empty() {
                    return Ok(());
                }
                let request = build_push_request(&state.store, &batch);
                (batch, request)
            };
            cursor = batch.last().map(|e| e.id);

            tracing::debug!(changes = batch.len(), "pushing batch");
            let result = self.call(self.remote.push(&request)).await;

            let counts = {
                let mut state = lock(&self.state);
                match result {
                    Ok(response) => {
                        self.apply_push_response(&mut state, &batch, response, report);
                        Counts::of(&state)
                    }
                    Err(e) if e.is_retryable() => {
                        // The whole batch counts as one failed attempt per change.
                        for entry in &batch {
                            self.retry_or_fail(&mut state.store, entry, &e.to_string(), report);
                        }
                        let counts = Counts::of(&state);
                        drop(state);
                        counts.publish(&self.status);
                        return Err(e);
                    }
                    Err(e) => return Err(e),
                }
            };
            counts.publish(&self.status);
        }
    }

    fn apply_push_response(
        &self,
        state: &mut SyncState,
        batch: &[ChangeEntry],
        response: PushResponse,
        report: &mut CycleReport,
    ) {
        let now = crate::now_ms();
        let by_change: HashMap<&str, &ChangeEntry> =
            batch.iter().map(|e| (e.change_id.as_str(), e)).collect();
        let device_id = state.store.device_id().clone();

        for accepted in &response.accepted {
            let Some(entry) = by_change.get(accepted.change_id.as_str()) else {
                tracing::warn!(change_id = %accepted.change_id, "ack for unknown change");
                continue;
            };
            let confirmed = match state.store.tracker_mut().ack(entry.id, &accepted.change_id) {
                Ok(AckOutcome::Removed) => true,
                Ok(AckOutcome::Superseded) => false,
                // Discarded by a resolution while in flight
                Err(_) => false,
            };
            state.store.confirm_push(accepted, confirmed);
            state.store.log_mut().append(SyncLogEntry::for_record(
                device_id.clone(),
                SyncType::Push,
                entry.entity_type,
                entry.entity_id.clone(),
                Some(entry.operation),
                Ok(()),
                now,
            ));
            report.pushed += 1;
        }

        for rejected in response.rejected {
            let Some(entry) = by_change.get(rejected.change_id.as_str()) else {
                tracing::warn!(change_id = %rejected.change_id, "rejection for unknown change");
                continue;
            };
            tracing::debug!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                reason = ?rejected.reason,
                message = %rejected.message,
                "change rejected"
            );

            match (rejected.reason, rejected.current) {
                (RejectReason::Transient, _) => {
                    self.retry_or_fail(&mut state.store, entry, &rejected.message, report);
                }
                (RejectReason::Conflict, Some(current)) => {
                    if state.store.tracker().get(entry.id).is_none() {
                        continue;
                    }
                    if let Err(e) = state.conflicts.raise(&mut state.store, current, now) {
                        tracing::warn!(error = %e, "could not raise conflict");
                        continue;
                    }
                    state.store.log_mut().append(SyncLogEntry::for_record(
                        device_id.clone(),
                        SyncType::Push,
                        entry.entity_type,
                        entry.entity_id.clone(),
                        Some(entry.operation),
                        Err("conflict: awaiting resolution".to_string()),
                        now,
                    ));
                }
                (reason, _) => {
                    let message = format!("{:?}: {}", reason, rejected.message).to_lowercase();
                    if state.store.tracker_mut().mark_failed(entry.id, &message).is_ok() {
                        report.failed += 1;
                    }
                    state.store.log_mut().append(SyncLogEntry::for_record(
                        device_id.clone(),
                        SyncType::Push,
                        entry.entity_type,
                        entry.entity_id.clone(),
                        Some(entry.operation),
                        Err(message),
                        now,
                    ));
                }
            }
        }
    }

    /// Count a transient failure; mark the change failed once the budget is spent.
    fn retry_or_fail(
        &self,
        store: &mut LocalStore,
        entry: &ChangeEntry,
        error: &str,
        report: &mut CycleReport,
    ) {
        let now = crate::now_ms();
        let attempts = entry.retry_count + 1;
        let retry_at = now + self.backoff.jittered(attempts).as_millis() as Timestamp;

        let Ok(attempts) = store.tracker_mut().requeue(entry.id, error, retry_at) else {
            return;
        };

        let message = if attempts >= self.config.max_attempts {
            let message = format!("gave up after {attempts} attempts: {error}");
            if store.tracker_mut().mark_failed(entry.id, &message).is_ok() {
                report.failed += 1;
            }
            tracing::warn!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                attempts,
                "change marked failed"
            );
            message
        } else {
            report.retried += 1;
            tracing::debug!(
                entity_type = %entry.entity_type,
                entity_id = %entry.entity_id,
                attempt = attempts,
                "change rescheduled"
            );
            error.to_string()
        };

        let device_id = store.device_id().clone();
        store.log_mut().append(SyncLogEntry::for_record(
            device_id,
            SyncType::Push,
            entry.entity_type,
            entry.entity_id.clone(),
            Some(entry.operation),
            Err(message),
            now,
        ));
    }

    /// Page through remote changes since the watermark.
    ///
    /// Returns the server clock the pull reached.
    async fn pull_phase(&self, report: &mut CycleReport) -> Result<ServerClock> {
        let mut since = lock(&self.state).store.watermark();
        loop {
            let query = PullQuery {
                since,
                limit: Some(self.config.pull_page_size),
            };
            let response = self.call(self.remote.pull_since(&query)).await?;
            let now = crate::now_ms();

            let counts = {
                let mut guard = lock(&self.state);
                let state = &mut *guard;
                let device_id = state.store.device_id().clone();
                for record in response.records {
                    report.pulled += 1;
                    match conflict::detect(&state.store, &record) {
                        PullDecision::ApplyRemote => {
                            if state.store.apply_remote(&record, now) == RemoteApply::Applied {
                                report.applied += 1;
                            }
                        }
                        PullDecision::KeepLocal => {}
                        PullDecision::Conflict => {
                            let (entity_type, entity_id) = (record.entity_type, record.id.clone());
                            if let Err(e) = state.conflicts.raise(&mut state.store, record, now) {
                                tracing::warn!(error = %e, "could not raise conflict");
                                continue;
                            }
                            tracing::info!(
                                entity_type = %entity_type,
                                entity_id = %entity_id,
                                "conflict detected"
                            );
                            state.store.log_mut().append(SyncLogEntry::for_record(
                                device_id.clone(),
                                SyncType::Pull,
                                entity_type,
                                entity_id,
                                None,
                                Err("conflict: awaiting resolution".to_string()),
                                now,
                            ));
                        }
                    }
                }
                Counts::of(state)
            };
            counts.publish(&self.status);

            since = Some(response.server_clock);
            if !response.has_more {
                return Ok(response.server_clock);
            }
        }
    }

    /// Apply the automatic conflict policy and commit the watermark if clean.
    fn reconcile(&self, server_clock: ServerClock, report: &mut CycleReport) -> Result<()> {
        let mut state = lock(&self.state);

        if let Some(side) = self.config.conflict_policy.side() {
            if !state.conflicts.is_empty() {
                report.auto_resolved = resolve_all_locked(&mut state, side, crate::now_ms())?;
                tracing::info!(?side, resolved = report.auto_resolved, "conflicts resolved by policy");
            }
        }

        report.conflicts = state.conflicts.len();
        if state.conflicts.is_empty() {
            state.store.set_watermark(server_clock);
            report.watermark_committed = true;
        } else {
            tracing::info!(
                conflicts = report.conflicts,
                "watermark held until conflicts are resolved"
            );
        }
        report.watermark = state.store.watermark();
        Ok(())
    }

    async fn reset_phase(&self, report: &mut CycleReport) -> Result<()> {
        self.transition(SyncPhase::Pulling);
        let snapshot = self.call(self.remote.fetch_snapshot()).await?;

        self.transition(SyncPhase::Reconciling);
        {
            let mut guard = lock(&self.state);
            let state = &mut *guard;
            let now = crate::now_ms();
            let discarded = state.store.pending_count();
            report.reset_records =
                state
                    .store
                    .replace_all(&snapshot.records, snapshot.server_clock, now);
            state.conflicts.clear();
            report.watermark = Some(snapshot.server_clock);
            report.watermark_committed = true;

            let device_id = state.store.device_id().clone();
            state
                .store
                .log_mut()
                .append(SyncLogEntry::for_store(device_id, SyncType::Reset, Ok(()), now));
            tracing::warn!(
                discarded,
                loaded = report.reset_records,
                "local store reset from remote snapshot"
            );
        }
        self.transition(SyncPhase::Idle);
        Ok(())
    }

    /// Ship unflushed log entries. Failures are retried after the next cycle.
    async fn flush_log(&self) {
        let entries = lock(&self.state).store.log().unflushed().to_vec();
        if entries.is_empty() {
            return;
        }

        match self.call(self.remote.append_logs(&entries)).await {
            Ok(()) => lock(&self.state).store.log_mut().mark_flushed(entries.len()),
            Err(e) => tracing::debug!(error = %e, pending = entries.len(), "sync log flush deferred"),
        }
    }

    fn after_local_change(&self) {
        self.persist();
    }

    fn persist(&self) {
        let Some(file) = &self.persistence else {
            return;
        };
        let exported = lock(&self.state).export();
        save_snapshot(file, &self.status, exported);
    }

    // ------------------------------------------------------------------
    // Background task
    // ------------------------------------------------------------------

    /// Run triggers in the background until `shutdown` changes.
    ///
    /// Handles the startup trigger, the interval timer, connectivity-restored
    /// events and [`request_sync`](Self::request_sync). A cycle in flight at
    /// shutdown is abandoned, not rolled back.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = Arc::clone(self);
        let receiver = self
            .trigger_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();

        tokio::spawn(async move {
            let Some(mut triggers) = receiver else {
                tracing::warn!("background sync already running");
                return;
            };
            if this.config.sync_on_startup {
                this.send_trigger(SyncTrigger::Startup);
            }

            let mut interval = this.config.sync_interval.map(|period| {
                let mut interval =
                    tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                interval
            });

            loop {
                let trigger = tokio::select! {
                    _ = shutdown.changed() => break,
                    Some(trigger) = triggers.recv() => trigger,
                    _ = next_tick(interval.as_mut()) => SyncTrigger::Interval,
                };

                tokio::select! {
                    _ = shutdown.changed() => {
                        tracing::info!("shutdown during sync; cycle abandoned");
                        this.abandon();
                        break;
                    }
                    result = this.run_cycle(trigger) => {
                        if let Err(e) = result {
                            tracing::debug!(?trigger, error = %e, "background cycle failed");
                        }
                    }
                }
            }
            tracing::info!("sync task stopped");
        })
    }

    fn abandon(&self) {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = SyncPhase::Idle;
        self.status.set_phase(SyncPhase::Idle);
        self.persist();
    }
}

async fn next_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn build_push_request(store: &LocalStore, batch: &[ChangeEntry]) -> PushRequest {
    PushRequest {
        device_id: store.device_id().clone(),
        schema_version: store.schema().version,
        changes: batch
            .iter()
            .map(|entry| {
                let base = store.observed_version(entry.entity_type, &entry.entity_id);
                Change::from_entry(entry, base)
            })
            .collect(),
    }
}

fn resolve_all_locked(state: &mut SyncState, side: Side, now: Timestamp) -> Result<usize> {
    let resolved: Vec<ConflictRecord> = state.conflicts.list().into_iter().cloned().collect();
    let count = state.conflicts.resolve_all(&mut state.store, side, now)?;
    for conflict in &resolved {
        log_resolution(&mut state.store, conflict, now);
    }
    Ok(count)
}

fn log_resolution(store: &mut LocalStore, conflict: &ConflictRecord, now: Timestamp) {
    let device_id = store.device_id().clone();
    store.log_mut().append(SyncLogEntry::for_record(
        device_id,
        SyncType::Resolve,
        conflict.entity_type,
        conflict.entity_id.clone(),
        None,
        Ok(()),
        now,
    ));
}
