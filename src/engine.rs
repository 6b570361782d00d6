//! Scan lifecycle: creation, runs racing a deadline, cancellation and cleanup.
//!
//! Every run ends in exactly one terminal state. Worker completion, the
//! deadline and cancellation all go through the run's [`TerminalGate`]: the
//! first arrival writes the terminal state and publishes it, later arrivals
//! change nothing. Disarming the timer or signalling the worker only saves
//! work; the gate is what keeps the state consistent.
use crate::error::{Error, Result};
use crate::events::{EventPublisher, ScanEvent};
use crate::message::{parse_http_request, ParsedRequest};
use crate::settings::SettingsProvider;
use crate::store::ScanStore;
use crate::types::{
    NewScan, Scan, ScanId, ScanPatch, ScanState, ScanUpdate, Target, TemplateResult,
};
use crate::worker::Worker;
use ::time::OffsetDateTime;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The target must carry a request that parses.
pub fn validate_target(target: &Target) -> Result<ParsedRequest> {
    let raw = target.request.as_deref().ok_or_else(Error::missing_request)?;
    parse_http_request(raw).map_err(Error::unparseable_request)
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Settlement {
    Completed(Vec<TemplateResult>),
    Failed(String),
    TimedOut,
    Cancelled,
}

impl Settlement {
    pub fn state(&self) -> ScanState {
        match self {
            Settlement::Completed(_) => ScanState::Completed,
            Settlement::Failed(_) => ScanState::Failed,
            Settlement::TimedOut => ScanState::TimedOut,
            Settlement::Cancelled => ScanState::Cancelled,
        }
    }

    fn into_patch(self, at: OffsetDateTime) -> ScanPatch {
        let state = self.state();
        let mut patch = ScanPatch {
            state: Some(state),
            finished_at: Some(Some(at)),
            ..ScanPatch::default()
        };
        match self {
            Settlement::Completed(results) => patch.results = Some(results),
            Settlement::Failed(message) => patch.error = Some(Some(message)),
            Settlement::TimedOut | Settlement::Cancelled => {}
        }
        patch
    }
}

/// Single-writer latch for one run.
///
/// Both transitions hold the lock across their store write, so a competitor
/// that arrives second waits for the first write to land and then sees the
/// run as settled.
#[derive(Debug, Default)]
pub struct TerminalGate {
    settled: Mutex<Option<ScanState>>,
}

impl TerminalGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the scan to `Running` unless the run was settled first.
    pub async fn open(&self, store: &dyn ScanStore, id: ScanId) -> Result<Option<Scan>> {
        let settled = self.settled.lock().await;
        if settled.is_some() {
            return Ok(None);
        }
        Ok(store.update(id, running_patch()).await?)
    }

    /// Apply `settlement` if nothing settled this run yet. Returns the updated
    /// scan for the winner and `None` for everyone else.
    pub async fn settle(
        &self,
        store: &dyn ScanStore,
        id: ScanId,
        settlement: Settlement,
    ) -> Result<Option<Scan>> {
        let mut settled = self.settled.lock().await;
        if settled.is_some() {
            return Ok(None);
        }
        // Only a Running scan has a terminal edge. A gate settled while the
        // scan is still Pending keeps the run from ever opening.
        match store.get(id).await? {
            None => {
                *settled = Some(settlement.state());
                return Ok(None);
            }
            Some(current) if current.state != ScanState::Running => {
                *settled = Some(current.state);
                return Ok(None);
            }
            Some(_) => {}
        }
        let state = settlement.state();
        let updated = store
            .update(id, settlement.into_patch(OffsetDateTime::now_utc()))
            .await?;
        *settled = Some(state);
        Ok(updated)
    }

    pub async fn outcome(&self) -> Option<ScanState> {
        *self.settled.lock().await
    }
}

fn running_patch() -> ScanPatch {
    ScanPatch {
        state: Some(ScanState::Running),
        results: Some(Vec::new()),
        finished_at: Some(None),
        error: Some(None),
        ..ScanPatch::default()
    }
}

fn terminal_changes(scan: &Scan) -> ScanPatch {
    ScanPatch {
        state: Some(scan.state),
        results: Some(scan.results.clone()),
        finished_at: Some(scan.finished_at),
        error: Some(scan.error.clone()),
        ..ScanPatch::default()
    }
}

#[derive(Debug, Clone)]
struct ActiveRun {
    cancel: CancellationToken,
    gate: Arc<TerminalGate>,
}

impl ActiveRun {
    fn new() -> Self {
        Self {
            cancel: CancellationToken::new(),
            gate: Arc::new(TerminalGate::new()),
        }
    }

    fn is(&self, other: &ActiveRun) -> bool {
        Arc::ptr_eq(&self.gate, &other.gate)
    }
}

/// Orchestrates scans over injected collaborators. Cheap to clone; clones
/// share the same runs.
#[derive(Clone)]
pub struct ScanEngine {
    store: Arc<dyn ScanStore>,
    settings: Arc<dyn SettingsProvider>,
    worker: Arc<dyn Worker>,
    events: Arc<dyn EventPublisher>,
    runs: Arc<DashMap<ScanId, ActiveRun>>,
}

impl ScanEngine {
    pub fn new(
        store: Arc<dyn ScanStore>,
        settings: Arc<dyn SettingsProvider>,
        worker: Arc<dyn Worker>,
        events: Arc<dyn EventPublisher>,
    ) -> Self {
        Self {
            store,
            settings,
            worker,
            events,
            runs: Arc::new(DashMap::new()),
        }
    }

    pub async fn create_scan(&self, new: NewScan) -> Result<Scan> {
        if new.target.request.is_some() {
            validate_target(&new.target)?;
        }
        let scan = self.store.create(Scan::pending(new.name, new.target)).await?;
        info!(scan_id = scan.id, "scan created");
        self.publish(ScanEvent::Created(scan.clone()));
        Ok(scan)
    }

    pub async fn get_scan(&self, id: ScanId) -> Result<Scan> {
        self.store.get(id).await?.ok_or(Error::NotFound(id))
    }

    pub async fn get_scans(&self) -> Result<Vec<Scan>> {
        Ok(self.store.list().await?)
    }

    pub async fn get_template_results(&self, id: ScanId) -> Result<Vec<TemplateResult>> {
        Ok(self.get_scan(id).await?.results)
    }

    pub async fn get_template_result(&self, id: ScanId, result_id: u64) -> Result<TemplateResult> {
        self.get_scan(id)
            .await?
            .result(result_id)
            .cloned()
            .ok_or(Error::ResultNotFound {
                scan_id: id,
                result_id,
            })
    }

    /// Merge user-editable fields. The target of a running scan is frozen.
    pub async fn update_scan(&self, id: ScanId, update: ScanUpdate) -> Result<Scan> {
        // A target edit holds the run slot, so it cannot interleave with a
        // run validating the target.
        let edit = match update.target {
            Some(_) => Some(self.claim(id)?),
            None => None,
        };
        let changes = ScanPatch::from(update);
        let updated = self.store.update(id, changes.clone()).await;
        if let Some(run) = &edit {
            self.release(id, run);
        }
        let scan = updated?.ok_or(Error::NotFound(id))?;
        debug!(scan_id = id, "scan updated");
        self.publish(ScanEvent::Updated { id, changes });
        Ok(scan)
    }

    /// Run a scan to its terminal state.
    ///
    /// A worker failure is recorded on the scan and also returned as
    /// [`Error::WorkerFailure`]. A timeout or cancellation is not an error:
    /// the returned scan carries the state.
    pub async fn run_scan(&self, id: ScanId) -> Result<Scan> {
        self.begin_run(id).await?.finish().await
    }

    /// Claim, validate and start a run, leaving the race to
    /// [`RunHandle::finish`]. The deadline is armed here.
    pub async fn begin_run(&self, id: ScanId) -> Result<RunHandle> {
        let run = self.claim(id)?;
        let timeout = match self.prepare_run(id).await {
            Ok(timeout) => timeout,
            Err(e) => {
                self.release(id, &run);
                return Err(e);
            }
        };

        let opened = match run.gate.open(self.store.as_ref(), id).await {
            Ok(opened) => opened,
            Err(e) => {
                self.release(id, &run);
                return Err(e);
            }
        };
        let Some(running) = opened else {
            // Cancelled or deleted before it could start.
            self.release(id, &run);
            let current = self.get_scan(id).await?;
            return Ok(RunHandle {
                engine: self.clone(),
                id,
                run,
                timeout,
                deadline: Instant::now(),
                task: None,
                scan: current,
                done: true,
            });
        };

        info!(scan_id = id, timeout_ms = timeout.as_millis() as u64, "scan started");
        self.publish(ScanEvent::Updated {
            id,
            changes: running_patch(),
        });

        let worker = self.worker.clone();
        let token = run.cancel.clone();
        let snapshot = running.clone();
        let task = tokio::spawn(async move { worker.execute(&snapshot, token).await });

        Ok(RunHandle {
            engine: self.clone(),
            id,
            run,
            timeout,
            deadline: Instant::now() + timeout,
            task: Some(task),
            scan: running,
            done: false,
        })
    }

    /// Request cancellation. Returns whether this call moved the scan to
    /// `Cancelled`. A scan with no active run is left untouched; a run that
    /// has been claimed but is not Running yet is stopped before it starts and
    /// the scan keeps its state.
    pub async fn cancel_scan(&self, id: ScanId) -> Result<bool> {
        let active = self.runs.get(&id).map(|r| r.value().clone());
        let Some(run) = active else {
            self.get_scan(id).await?;
            debug!(scan_id = id, "cancel requested for a scan that is not running");
            return Ok(false);
        };

        // Settle first so a worker reacting to the signal cannot win as Failed.
        let settled = run
            .gate
            .settle(self.store.as_ref(), id, Settlement::Cancelled)
            .await;
        run.cancel.cancel();
        match settled? {
            Some(scan) => {
                self.release(id, &run);
                info!(scan_id = id, "scan cancelled");
                self.publish(ScanEvent::Updated {
                    id,
                    changes: terminal_changes(&scan),
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Start a new scan with the original's target and name.
    pub async fn begin_re_run(&self, id: ScanId) -> Result<RunHandle> {
        let original = self.get_scan(id).await?;
        let copy = self
            .create_scan(NewScan {
                name: original.name,
                target: original.target,
            })
            .await?;
        info!(scan_id = copy.id, original_id = id, "re-running scan");
        self.begin_run(copy.id).await
    }

    pub async fn re_run_scan(&self, id: ScanId) -> Result<Scan> {
        self.begin_re_run(id).await?.finish().await
    }

    pub async fn delete_scan(&self, id: ScanId) -> Result<()> {
        self.cancel_scan(id).await?;
        if !self.store.delete(id).await? {
            return Err(Error::NotFound(id));
        }
        info!(scan_id = id, "scan deleted");
        self.publish(ScanEvent::Deleted { id });
        Ok(())
    }

    /// Cancel every active run, then drop all scans.
    pub async fn clear_scans(&self) -> Result<()> {
        let mut cancelled = 0usize;
        for id in self.active_runs() {
            match self.cancel_scan(id).await {
                Ok(true) => cancelled += 1,
                Ok(false) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        self.store.clear().await?;
        info!(cancelled, "scans cleared");
        self.publish(ScanEvent::Cleared);
        Ok(())
    }

    /// Ids of scans with a run in flight.
    pub fn active_runs(&self) -> Vec<ScanId> {
        let mut ids: Vec<ScanId> = self.runs.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Load the scan and the timeout, and check the target. Runs with the
    /// slot already claimed.
    async fn prepare_run(&self, id: ScanId) -> Result<Duration> {
        let scan = self.get_scan(id).await?;
        let timeout = self.settings.scan_timeout();
        validate_target(&scan.target)?;
        Ok(timeout)
    }

    /// Register a new run for `id`; at most one run per scan at a time.
    fn claim(&self, id: ScanId) -> Result<ActiveRun> {
        match self.runs.entry(id) {
            Entry::Occupied(_) => Err(Error::ScanBusy(id)),
            Entry::Vacant(slot) => {
                let run = ActiveRun::new();
                slot.insert(run.clone());
                Ok(run)
            }
        }
    }

    fn release(&self, id: ScanId, run: &ActiveRun) {
        self.runs.remove_if(&id, |_, active| active.is(run));
    }

    fn publish(&self, event: ScanEvent) {
        let name = event.name();
        if let Err(e) = self.events.publish(event) {
            warn!(event = name, error = %e, "failed to publish scan event");
        }
    }

    /// Settle a run whose handle went away before finishing.
    async fn abandon(&self, id: ScanId, run: ActiveRun) {
        let settled = run
            .gate
            .settle(self.store.as_ref(), id, Settlement::Cancelled)
            .await;
        self.release(id, &run);
        match settled {
            Ok(Some(scan)) => {
                warn!(scan_id = id, "run dropped before finishing; marked cancelled");
                self.publish(ScanEvent::Updated {
                    id,
                    changes: terminal_changes(&scan),
                });
            }
            Ok(None) => {}
            Err(e) => warn!(scan_id = id, error = %e, "failed to settle abandoned run"),
        }
    }
}

/// A started run. [`RunHandle::finish`] must be awaited to drive it to its
/// terminal state; dropping the handle early cancels the run.
pub struct RunHandle {
    engine: ScanEngine,
    id: ScanId,
    run: ActiveRun,
    timeout: Duration,
    deadline: Instant,
    task: Option<JoinHandle<anyhow::Result<Vec<TemplateResult>>>>,
    scan: Scan,
    done: bool,
}

impl RunHandle {
    pub fn id(&self) -> ScanId {
        self.id
    }

    /// The scan as it was when the run began.
    pub fn scan(&self) -> &Scan {
        &self.scan
    }

    /// Race the worker against the deadline and cancellation, and apply the
    /// winner through the gate.
    pub async fn finish(mut self) -> Result<Scan> {
        let id = self.id;
        let Some(task) = self.task.take() else {
            return self.engine.get_scan(id).await;
        };

        let settlement = tokio::select! {
            joined = task => match joined {
                Ok(Ok(results)) => Settlement::Completed(results),
                Ok(Err(e)) => Settlement::Failed(format!("{e:#}")),
                Err(e) => Settlement::Failed(format!("worker task failed: {e}")),
            },
            _ = time::sleep_until(self.deadline) => Settlement::TimedOut,
            _ = self.run.cancel.cancelled() => Settlement::Cancelled,
        };
        // Losing branches are dropped with the select; a detached worker
        // still gets the signal.
        self.run.cancel.cancel();

        let attempted = settlement.clone();
        let settled = self
            .run
            .gate
            .settle(self.engine.store.as_ref(), id, settlement)
            .await;
        self.engine.release(id, &self.run);
        self.done = true;

        let Some(scan) = settled? else {
            debug!(scan_id = id, attempted = ?attempted.state(), "run already settled");
            return self.engine.get_scan(id).await;
        };

        match &attempted {
            Settlement::TimedOut => warn!(
                scan_id = id,
                timeout_ms = self.timeout.as_millis() as u64,
                "scan timed out"
            ),
            Settlement::Failed(message) => warn!(scan_id = id, error = %message, "scan failed"),
            _ => info!(scan_id = id, state = ?scan.state, results = scan.results.len(), "scan finished"),
        }
        self.engine.publish(ScanEvent::Updated {
            id,
            changes: terminal_changes(&scan),
        });

        match attempted {
            Settlement::Failed(message) => Err(Error::WorkerFailure { id, message }),
            _ => Ok(scan),
        }
    }
}

impl Drop for RunHandle {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.run.cancel.cancel();
        let engine = self.engine.clone();
        let run = self.run.clone();
        let id = self.id;
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move { engine.abandon(id, run).await });
            }
            Err(_) => engine.release(id, &run),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    async fn running_scan(store: &MemoryStore) -> Scan {
        let scan = store
            .create(Scan::pending(None, Target::default()))
            .await
            .unwrap();
        store.update(scan.id, running_patch()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn first_settlement_wins() {
        let store = MemoryStore::new();
        let scan = running_scan(&store).await;
        let gate = TerminalGate::new();

        let won = gate
            .settle(&store, scan.id, Settlement::Completed(Vec::new()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(won.state, ScanState::Completed);
        let finished_at = won.finished_at;
        assert!(finished_at.is_some());

        // A late deadline must not touch the scan.
        let late = gate
            .settle(&store, scan.id, Settlement::TimedOut)
            .await
            .unwrap();
        assert!(late.is_none());
        let stored = store.get(scan.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ScanState::Completed);
        assert_eq!(stored.finished_at, finished_at);
        assert_eq!(gate.outcome().await, Some(ScanState::Completed));
    }

    #[tokio::test]
    async fn settled_gate_refuses_to_open() {
        let store = MemoryStore::new();
        let scan = store
            .create(Scan::pending(None, Target::default()))
            .await
            .unwrap();
        let gate = TerminalGate::new();
        let settled = gate
            .settle(&store, scan.id, Settlement::Cancelled)
            .await
            .unwrap();
        assert!(settled.is_none());
        assert!(gate.open(&store, scan.id).await.unwrap().is_none());
        let stored = store.get(scan.id).await.unwrap().unwrap();
        assert_eq!(stored.state, ScanState::Pending);
        assert!(stored.finished_at.is_none());
        assert_eq!(gate.outcome().await, Some(ScanState::Pending));
    }

    #[tokio::test]
    async fn concurrent_settlements_apply_once() {
        let store = Arc::new(MemoryStore::new());
        let id = running_scan(&store).await.id;
        let gate = Arc::new(TerminalGate::new());

        let mut handles = Vec::new();
        for s in [
            Settlement::TimedOut,
            Settlement::Cancelled,
            Settlement::Failed("boom".into()),
            Settlement::Completed(Vec::new()),
        ] {
            let store = store.clone();
            let gate = gate.clone();
            handles.push(tokio::spawn(async move {
                gate.settle(store.as_ref(), id, s).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap().is_some() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
        let stored = store.get(id).await.unwrap().unwrap();
        assert_eq!(Some(stored.state), gate.outcome().await);
        assert_eq!(stored.error.is_some(), stored.state == ScanState::Failed);
    }

    #[test]
    fn failed_patch_carries_error_only_when_failed() {
        let at = OffsetDateTime::now_utc();
        let failed = Settlement::Failed("x".into()).into_patch(at);
        assert_eq!(failed.error, Some(Some("x".into())));
        let timed_out = Settlement::TimedOut.into_patch(at);
        assert_eq!(timed_out.error, None);
        assert_eq!(timed_out.finished_at, Some(Some(at)));
    }

    #[test]
    fn validate_target_requires_request() {
        assert!(matches!(
            validate_target(&Target::default()),
            Err(Error::InvalidTarget { .. })
        ));
        let target = Target {
            request: Some("GET".into()),
            ..Target::default()
        };
        assert!(matches!(
            validate_target(&target),
            Err(Error::InvalidTarget { source: Some(_), .. })
        ));
    }
}
