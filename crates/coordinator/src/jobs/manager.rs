//! Owns the active job set and hands jobs to idle workers.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use chrono::Utc;
use futures_util::future::join_all;
use scan_pool_types::{ConnectionId, FoundInfo, Job, JobId, JobOptions, JobStatus, SearchMode};
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::store::JobStore;
use super::types::{reports_idle, WorkerStatus};
use crate::correlator::Correlator;
use crate::error::{CoordinatorError, Result};
use crate::registry::{ConnectionInfo, Registry, RegistryEvent};

/// Central job manager.
///
/// The job list and worker status live behind std `RwLock`s that are never
/// held across an await. Durable writes go through the [`JobStore`] lock.
pub struct JobManager {
    correlator: Correlator,
    store: JobStore,
    rel_dir: PathBuf,
    jobs: RwLock<Vec<Job>>,
    worker_status: RwLock<HashMap<ConnectionId, WorkerStatus>>,
    /// Serializes `assign_job` so two passes cannot pick the same job.
    assigning: tokio::sync::Mutex<()>,
}

impl JobManager {
    pub fn new(correlator: Correlator, store: JobStore, rel_dir: impl Into<PathBuf>) -> Self {
        Self {
            correlator,
            store,
            rel_dir: rel_dir.into(),
            jobs: RwLock::new(Vec::new()),
            worker_status: RwLock::new(HashMap::new()),
            assigning: tokio::sync::Mutex::new(()),
        }
    }

    pub fn registry(&self) -> &Registry {
        self.correlator.registry()
    }

    pub fn store(&self) -> &JobStore {
        &self.store
    }

    /// Load the persisted job list, replacing the in-memory set. Jobs that
    /// were running come back pending since no worker is bound after a restart.
    pub async fn read_config(&self) -> Result<usize> {
        let mut loaded = self.store.load().await?;
        for job in &mut loaded {
            job.unbind();
        }
        let count = loaded.len();
        *self.jobs_mut() = loaded;
        info!(jobs = count, path = %self.store.path().display(), "job list loaded");
        Ok(count)
    }

    /// Build a job and store its rel file under the rel directory. The job is
    /// not added to the active set and not assigned. Invalid cube bounds fail
    /// before anything is written.
    pub async fn new_job(
        &self,
        worker: Option<ConnectionId>,
        rel_file: &[u8],
        name: impl Into<String>,
        job_options: JobOptions,
        rel_file_path: &Path,
    ) -> Result<Job> {
        job_options.validate()?;
        let mut job = Job::new(name, job_options);
        job.requested_worker = worker;

        let file_name = rel_file_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "rel".to_string());
        tokio::fs::create_dir_all(&self.rel_dir)
            .await
            .map_err(|e| CoordinatorError::io(&self.rel_dir, e))?;
        let stored = self.rel_dir.join(format!("{}-{}", job.id, file_name));
        tokio::fs::write(&stored, rel_file)
            .await
            .map_err(|e| CoordinatorError::io(&stored, e))?;

        job.rel_file_name = file_name;
        job.rel_file_path = Some(stored);
        debug!(job_id = %job.id, name = %job.name, mode = %job.mode(), "job created");
        Ok(job)
    }

    /// Insert into the active set. False if a job with the same id exists
    /// or its options are invalid.
    pub async fn add_job(&self, job: Job) -> bool {
        if let Err(e) = job.job_options.validate() {
            error!(job_id = %job.id, error = %e, "rejecting job with invalid options");
            return false;
        }
        {
            let mut jobs = self.jobs_mut();
            if jobs.iter().any(|j| j.id == job.id) {
                warn!(job_id = %job.id, "job already exists");
                return false;
            }
            info!(job_id = %job.id, name = %job.name, "job added");
            jobs.push(job);
        }
        self.persist_logged().await;
        true
    }

    pub async fn remove_job(&self, id: &str) -> bool {
        let removed = {
            let mut jobs = self.jobs_mut();
            let before = jobs.len();
            jobs.retain(|j| j.id != id);
            jobs.len() != before
        };
        if removed {
            info!(job_id = %id, "job removed");
            self.persist_logged().await;
        }
        removed
    }

    /// Overwrite a job's progress. Unknown ids are ignored and return false.
    pub fn update_job_progress(&self, id: &str, progress: f64, distance: Option<f64>) -> bool {
        let mut jobs = self.jobs_mut();
        match jobs.iter_mut().find(|j| j.id == id) {
            Some(job) => {
                job.record_progress(progress, distance, Utc::now());
                true
            }
            None => false,
        }
    }

    pub fn get_last_progress(&self, id: &str) -> Option<f64> {
        self.read_jobs()
            .iter()
            .find(|j| j.id == id)
            .and_then(Job::last_progress)
    }

    pub fn jobs(&self) -> Vec<Job> {
        self.read_jobs().clone()
    }

    pub fn job(&self, id: &str) -> Option<Job> {
        self.read_jobs().iter().find(|j| j.id == id).cloned()
    }

    pub fn workers(&self) -> Vec<ConnectionInfo> {
        self.registry().connections()
    }

    pub fn worker_status(&self) -> HashMap<ConnectionId, WorkerStatus> {
        self.worker_status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Rebuild worker availability from the registry. Workers with a bound
    /// job are busy; the rest are asked for their current job concurrently.
    /// A worker that does not answer counts as busy.
    pub async fn refresh_worker_status(&self) {
        let connections = self.registry().connections();
        let bound: HashSet<ConnectionId> = self.read_jobs().iter().filter_map(|j| j.client).collect();
        let bound = &bound;

        let polls = connections.into_iter().map(|c| async move {
            let is_working = if bound.contains(&c.id) {
                true
            } else {
                match self.correlator.get_current_job(c.id).await {
                    Ok(Some(status)) => !reports_idle(&status),
                    Ok(None) => true,
                    Err(e) => {
                        debug!(connection_id = %c.id, error = %e, "worker vanished during refresh");
                        true
                    }
                }
            };
            (
                c.id,
                WorkerStatus {
                    is_working,
                    client_num: c.client_num,
                },
            )
        });
        let statuses: HashMap<_, _> = join_all(polls).await.into_iter().collect();

        let idle = statuses.values().filter(|s| !s.is_working).count();
        debug!(workers = statuses.len(), idle, "worker status refreshed");
        *self
            .worker_status
            .write()
            .unwrap_or_else(PoisonError::into_inner) = statuses;
    }

    /// Start the first pending job on an idle worker.
    ///
    /// Returns false, leaving the job untouched, when there is no pending
    /// job, no idle worker, or the worker does not acknowledge. A pending job
    /// with invalid options is stopped and skipped without contacting a worker.
    pub async fn assign_job(&self) -> bool {
        let _assigning = self.assigning.lock().await;

        let job = loop {
            let Some(job) = self.read_jobs().iter().find(|j| j.is_assignable()).cloned() else {
                debug!("no pending job to assign");
                return false;
            };
            match job.job_options.validate() {
                Ok(()) => break job,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "invalid job options, stopping job");
                    self.mark_stopped(&job.id);
                    self.persist_logged().await;
                }
            }
        };
        let Some(worker) = self.pick_idle_worker(job.requested_worker) else {
            debug!(job_id = %job.id, "no idle worker");
            return false;
        };

        if let Some(path) = &job.rel_file_path {
            if let Err(e) = self.correlator.upload_file(worker, path).await {
                warn!(job_id = %job.id, connection_id = %worker, error = %e, "rel file upload failed");
                return false;
            }
        }

        match self.start_job(worker, &job).await {
            Ok(Some(_)) => {}
            Ok(None) => return false,
            Err(e) => {
                error!(job_id = %job.id, connection_id = %worker, error = %e, "cannot start job");
                return false;
            }
        }

        let bound = {
            let mut jobs = self.jobs_mut();
            match jobs.iter_mut().find(|j| j.id == job.id) {
                Some(stored) => {
                    stored.bind(worker);
                    true
                }
                None => false,
            }
        };
        if !bound {
            warn!(job_id = %job.id, "job removed while it was being started");
            return false;
        }
        self.set_working(worker, true);
        info!(job_id = %job.id, connection_id = %worker, "job assigned");
        self.persist_logged().await;
        true
    }

    /// Send `job_start` to one worker. See [`Correlator::start_job`].
    pub async fn start_job(&self, connection: ConnectionId, job: &Job) -> Result<Option<JobId>> {
        self.correlator.start_job(connection, job).await
    }

    /// [`JobManager::start_job`] addressed by display client number.
    pub async fn start_job_at(&self, client_num: usize, job: &Job) -> Result<Option<JobId>> {
        let connection = self
            .registry()
            .resolve_client_num(client_num)
            .ok_or(CoordinatorError::ClientNumNotFound(client_num))?;
        self.start_job(connection, job).await
    }

    /// Stop a job. A bound job is only marked stopped once its worker
    /// acknowledges `job_stop`; `Ok(false)` means it did not.
    pub async fn stop_job(&self, id: &str) -> Result<bool> {
        let client = self
            .read_jobs()
            .iter()
            .find(|j| j.id == id)
            .map(|j| j.client)
            .ok_or_else(|| CoordinatorError::JobNotFound(id.to_string()))?;

        if let Some(connection) = client {
            match self.correlator.stop_job(connection).await {
                Ok(true) => self.set_working(connection, false),
                Ok(false) => return Ok(false),
                Err(CoordinatorError::ConnectionNotFound(_)) => {
                    debug!(job_id = %id, connection_id = %connection, "worker already gone");
                }
                Err(e) => return Err(e),
            }
        }

        self.mark_stopped(id);
        info!(job_id = %id, "job stopped");
        self.persist_logged().await;
        Ok(true)
    }

    /// Append a found record, stamping the receive time if the worker sent none.
    pub async fn add_found(&self, job_id: &str, mut found: FoundInfo) -> bool {
        if found.date.is_none() {
            found.date = Some(Utc::now().timestamp_millis());
        }
        {
            let mut jobs = self.jobs_mut();
            let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
                debug!(job_id = %job_id, "found for unknown job");
                return false;
            };
            info!(job_id = %job_id, x = found.x, z = found.z, "found");
            job.found.push(found);
        }
        self.persist_logged().await;
        true
    }

    pub async fn finish_job(&self, job_id: &str) -> bool {
        let client = {
            let mut jobs = self.jobs_mut();
            let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
                debug!(job_id = %job_id, "job_finished for unknown job");
                return false;
            };
            job.status = JobStatus::Finished;
            job.client.take()
        };
        if let Some(connection) = client {
            self.set_working(connection, false);
        }
        info!(job_id = %job_id, "job finished");
        self.persist_logged().await;
        true
    }

    /// Clear every reference to a vanished connection.
    pub async fn connection_lost(&self, connection: ConnectionId) {
        let orphaned = {
            let mut jobs = self.jobs_mut();
            let mut n = 0;
            for job in jobs.iter_mut().filter(|j| j.client == Some(connection)) {
                job.unbind();
                n += 1;
            }
            n
        };
        self.worker_status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection);
        if orphaned > 0 {
            warn!(connection_id = %connection, jobs = orphaned, "worker lost, jobs returned to pending");
            self.persist_logged().await;
        }
    }

    pub async fn handle_event(&self, event: RegistryEvent) {
        match event {
            RegistryEvent::Progress(p) => {
                let declared = self.job_mode(&p.job_id);
                if let Some(declared) = declared.filter(|d| *d != p.mode) {
                    debug!(job_id = %p.job_id, reported = %p.mode, declared = %declared, "progress mode differs from job");
                }
                if !self.update_job_progress(&p.job_id, p.maps, p.distance) {
                    debug!(job_id = %p.job_id, "progress for unknown job");
                }
            }
            RegistryEvent::Found {
                connection,
                job_id,
                payload,
            } => match FoundInfo::from_payload(&payload) {
                Some(found) => {
                    self.add_found(&job_id, found).await;
                }
                None => warn!(connection_id = %connection, job_id = %job_id, "unreadable found payload"),
            },
            RegistryEvent::JobFinished { job_id, .. } => {
                self.finish_job(&job_id).await;
            }
            RegistryEvent::Disconnected { connection, .. } => {
                self.connection_lost(connection).await;
            }
            RegistryEvent::Nick { connection, nick } => {
                debug!(connection_id = %connection, nick = %nick, "worker renamed");
            }
            RegistryEvent::Connected { .. } | RegistryEvent::Message { .. } => {}
        }
    }

    /// Consume registry events until cancelled.
    pub fn spawn_event_loop(
        self: &Arc<Self>,
        mut events: broadcast::Receiver<RegistryEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => manager.handle_event(event).await,
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "job manager lagged behind registry events");
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }
            debug!("job event loop stopped");
        })
    }

    /// Periodically refresh worker status and assign pending jobs.
    pub fn spawn_assign_loop(self: &Arc<Self>, period: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {
                        if !manager.read_jobs().iter().any(Job::is_assignable) {
                            continue;
                        }
                        manager.refresh_worker_status().await;
                        while manager.assign_job().await {}
                    }
                }
            }
        })
    }

    /// Write the current job list under the store lock.
    pub async fn persist(&self) -> Result<usize> {
        self.store.save_with(|| self.jobs()).await
    }

    async fn persist_logged(&self) {
        if let Err(e) = self.persist().await {
            error!(error = %e, "failed to persist job list");
        }
    }

    fn pick_idle_worker(&self, preferred: Option<ConnectionId>) -> Option<ConnectionId> {
        let statuses = self
            .worker_status
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        let registry = self.registry();
        let idle = |id: &ConnectionId| {
            statuses.get(id).is_some_and(|s| !s.is_working) && registry.contains(*id)
        };

        if let Some(preferred) = preferred.filter(|p| idle(p)) {
            return Some(preferred);
        }
        statuses
            .iter()
            .filter(|(id, _)| idle(*id))
            .min_by_key(|(_, s)| s.client_num)
            .map(|(id, _)| *id)
    }

    fn mark_stopped(&self, id: &str) {
        let mut jobs = self.jobs_mut();
        if let Some(job) = jobs.iter_mut().find(|j| j.id == id) {
            job.client = None;
            job.status = JobStatus::Stopped;
        }
    }

    fn job_mode(&self, id: &str) -> Option<SearchMode> {
        self.read_jobs().iter().find(|j| j.id == id).map(Job::mode)
    }

    fn set_working(&self, connection: ConnectionId, working: bool) {
        if let Some(status) = self
            .worker_status
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&connection)
        {
            status.is_working = working;
        }
    }

    fn read_jobs(&self) -> RwLockReadGuard<'_, Vec<Job>> {
        self.jobs.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn jobs_mut(&self) -> RwLockWriteGuard<'_, Vec<Job>> {
        self.jobs.write().unwrap_or_else(PoisonError::into_inner)
    }
}
