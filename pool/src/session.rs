/// Mining session - one per wallet address
///
/// Owns:
/// - The current block template and its generation counter
/// - Connected workers, each with its own vardiff controller
/// - Outstanding jobs, keyed by job id
///
/// All of that lives behind one per-session mutex, so job issuance, share
/// resolution, template swaps and teardown for one wallet are serialized
/// while different wallets never contend.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::blockchain::{BlockTemplate, Daemon, DaemonConnector, DaemonHandle, DaemonSettings, TemplateMonitor};
use crate::difficulty;
use crate::error::{PoolError, Result};
use crate::jobs::Job;
use crate::metrics::prometheus as metrics;
use crate::pow::PowBackend;
use crate::vardiff::{VarDiffConfig, VarDiffState};

/// Job pushed to a connection outside a request/reply exchange.
#[derive(Debug, Clone)]
pub struct JobPush {
    pub connection_id: String,
    pub job: Job,
}

pub type JobSink = mpsc::UnboundedSender<JobPush>;

#[derive(Debug)]
pub struct Worker {
    pub connection_id: String,
    pub rig_id: Option<String>,
    pub pass: String,
    pub vardiff: VarDiffState,
    pub last_activity: Instant,
}

/// Diagnostic view of a worker
#[derive(Debug, Clone, Serialize)]
pub struct WorkerStats {
    pub id: String,
    pub rig_id: Option<String>,
    pub pass: String,
    pub hashrate: u64,
    pub difficulty: u64,
    pub next_difficulty: u64,
}

#[derive(Debug, Clone)]
struct IssuedJob {
    job: Job,
    generation: u64,
}

/// A job that is still valid, with the template it was cut from.
#[derive(Debug, Clone)]
pub struct ResolvedJob {
    pub job: Job,
    pub template: BlockTemplate,
}

struct SessionState {
    template: Option<BlockTemplate>,
    generation: u64,
    /// Jobs issued against the current template; the next pool nonce.
    issued: u32,
    jobs: HashMap<String, IssuedJob>,
    workers: HashMap<String, Worker>,
    last_touch: Instant,
    stopped: bool,
}

/// Tunables shared by every session of a pool
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub vardiff: VarDiffConfig,
    pub poll_interval: Duration,
    pub first_template_timeout: Duration,
}

pub struct MiningSession {
    address: String,
    options: SessionOptions,
    connector: Arc<dyn DaemonConnector>,
    daemon: watch::Sender<DaemonHandle>,
    monitor: Arc<TemplateMonitor>,
    backend: Arc<dyn PowBackend>,
    state: Mutex<SessionState>,
    pushes: JobSink,
    cancel: CancellationToken,
}

impl MiningSession {
    pub fn new(
        address: String,
        settings: &DaemonSettings,
        connector: Arc<dyn DaemonConnector>,
        backend: Arc<dyn PowBackend>,
        options: SessionOptions,
        pushes: JobSink,
    ) -> Result<Arc<Self>> {
        let handle = connector.handle(settings)?;
        let (daemon, daemon_rx) = watch::channel(handle);
        let monitor = TemplateMonitor::new(address.clone(), daemon_rx, options.poll_interval);

        Ok(Arc::new(Self {
            address,
            options,
            connector,
            daemon,
            monitor,
            backend,
            state: Mutex::new(SessionState {
                template: None,
                generation: 0,
                issued: 0,
                jobs: HashMap::new(),
                workers: HashMap::new(),
                last_touch: Instant::now(),
                stopped: false,
            }),
            pushes,
            cancel: CancellationToken::new(),
        }))
    }

    /// Start polling and wait (bounded) for the first template. Later
    /// templates are applied by a background task until `stop`.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.monitor.start();

        let first = match self.monitor.wait_first(self.options.first_template_timeout).await {
            Ok(t) => t,
            Err(e) => {
                self.stop().await;
                return Err(e);
            }
        };

        let mut updates = self.monitor.subscribe();
        let latest = updates.borrow_and_update().clone().unwrap_or(first);
        self.set_template(latest).await;

        let session = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = session.cancel.cancelled() => break,
                    changed = updates.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }

                let template = updates.borrow_and_update().clone();
                if let Some(template) = template {
                    session.set_template(template).await;
                }
            }
        });

        Ok(())
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Replace the template. Every outstanding job is dropped; unless this is
    /// the first template, each worker gets a fresh job pushed.
    pub async fn set_template(&self, template: BlockTemplate) {
        let mut state = self.state.lock().await;
        if state.stopped {
            return;
        }

        let first = state.template.is_none();
        tracing::debug!(
            "Session {}: template height={} difficulty={}",
            self.address,
            template.height,
            template.difficulty
        );

        state.template = Some(template);
        state.generation += 1;
        state.issued = 0;
        state.jobs.clear();

        if !first {
            self.push_to_all(&mut state);
        }
    }

    /// Issue a job for `connection_id` at its vardiff target (or the default
    /// difficulty for unknown connections).
    pub async fn issue_job(&self, connection_id: &str) -> Result<Job> {
        let mut state = self.state.lock().await;
        self.issue_locked(&mut state, Some(connection_id), None)
    }

    /// Issue a job at network difficulty for an external miner and return
    /// the raw template it was cut from.
    pub async fn next_core_job(&self) -> Result<BlockTemplate> {
        let mut state = self.state.lock().await;
        let template = state
            .template
            .clone()
            .ok_or_else(|| PoolError::upstream("no block template yet"))?;
        self.issue_locked(&mut state, None, Some(template.difficulty))?;
        Ok(template)
    }

    /// Drop all jobs and push a fresh one to every worker. The pool nonce
    /// keeps counting so refreshed jobs never reuse earlier search space.
    pub async fn force_refresh(&self) -> usize {
        let mut state = self.state.lock().await;
        state.jobs.clear();
        metrics::inc_forced_refreshes();
        self.push_to_all(&mut state)
    }

    fn push_to_all(&self, state: &mut SessionState) -> usize {
        let ids: Vec<String> = state.workers.keys().cloned().collect();
        let mut pushed = 0;

        for id in ids {
            match self.issue_locked(state, Some(&id), None) {
                Ok(job) => {
                    if self.pushes.send(JobPush { connection_id: id, job }).is_ok() {
                        pushed += 1;
                    }
                }
                Err(e) => tracing::warn!("Session {}: job for {} failed: {}", self.address, id, e),
            }
        }

        pushed
    }

    fn issue_locked(
        &self,
        state: &mut SessionState,
        connection_id: Option<&str>,
        difficulty: Option<u64>,
    ) -> Result<Job> {
        let template = state
            .template
            .as_ref()
            .ok_or_else(|| PoolError::upstream("no block template yet"))?;

        let now = Instant::now();
        let worker = connection_id.and_then(|id| state.workers.get_mut(id));
        let target_difficulty = match (difficulty, worker) {
            (Some(d), _) => d,
            (None, Some(w)) => {
                w.last_activity = now;
                w.vardiff.next_target(true)
            }
            (None, None) => self.options.vardiff.start_difficulty,
        };

        let pool_nonce = state.issued;
        let blob = self.backend.hashing_blob(template, pool_nonce)?;
        let job = Job::new(
            hex::encode(blob),
            difficulty::target_hex(target_difficulty)?,
            template.height,
            pool_nonce,
            target_difficulty,
        );

        state.issued = state.issued.wrapping_add(1);
        state.jobs.insert(
            job.job_id.clone(),
            IssuedJob {
                job: job.clone(),
                generation: state.generation,
            },
        );
        state.last_touch = now;

        Ok(job)
    }

    /// Look up a job that is still valid for the current template.
    pub async fn resolve_job(&self, job_id: &str) -> Option<ResolvedJob> {
        let mut state = self.state.lock().await;
        let issued = state.jobs.get(job_id)?;
        if issued.generation != state.generation {
            return None;
        }
        let job = issued.job.clone();
        let template = state.template.clone()?;
        state.last_touch = Instant::now();
        Some(ResolvedJob { job, template })
    }

    pub async fn record_share(&self, connection_id: &str, difficulty: u64) {
        let mut state = self.state.lock().await;
        if let Some(worker) = state.workers.get_mut(connection_id) {
            worker.vardiff.insert(difficulty);
            worker.last_activity = Instant::now();
        }
    }

    pub async fn add_worker(&self, connection_id: &str, pass: &str, rig_id: Option<String>) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(PoolError::SessionClosed(self.address.clone()));
        }

        let now = Instant::now();
        let vardiff = self.options.vardiff;
        state
            .workers
            .entry(connection_id.to_string())
            .or_insert_with(|| Worker {
                connection_id: connection_id.to_string(),
                rig_id,
                pass: pass.to_string(),
                vardiff: VarDiffState::new(vardiff),
                last_activity: now,
            });
        state.last_touch = now;
        Ok(())
    }

    /// Remove a worker, returning how many remain. Removing the last worker
    /// stops the session before the lock is released, so a login racing the
    /// teardown sees `SessionClosed` instead of joining a dying session.
    pub async fn remove_worker(&self, connection_id: &str) -> usize {
        let mut state = self.state.lock().await;
        if state.workers.remove(connection_id).is_none() {
            return state.workers.len();
        }
        state.last_touch = Instant::now();
        if state.workers.is_empty() && !state.stopped {
            tracing::debug!("Last worker left {}, stopping session", self.address);
            self.close_locked(&mut state);
        }
        state.workers.len()
    }

    /// Stop the session if it has not been touched within `stale_after` of
    /// `now`. Returns the connections it still held, or `None` if it is
    /// live or already stopped.
    pub async fn stop_if_idle(&self, now: Instant, stale_after: Duration) -> Option<Vec<String>> {
        let mut state = self.state.lock().await;
        if state.stopped {
            return None;
        }
        let idle = now.saturating_duration_since(state.last_touch);
        if idle <= stale_after {
            return None;
        }
        tracing::info!("Session {} idle for {}s, stopping", self.address, idle.as_secs());
        Some(self.close_locked(&mut state))
    }

    pub async fn touch(&self) {
        self.state.lock().await.last_touch = Instant::now();
    }

    pub async fn last_touch(&self) -> Instant {
        self.state.lock().await.last_touch
    }

    pub async fn worker_count(&self) -> usize {
        self.state.lock().await.workers.len()
    }

    pub async fn job_count(&self) -> usize {
        self.state.lock().await.jobs.len()
    }

    pub async fn template(&self) -> Option<BlockTemplate> {
        self.state.lock().await.template.clone()
    }

    pub async fn workers(&self) -> Vec<WorkerStats> {
        let state = self.state.lock().await;
        state
            .workers
            .values()
            .map(|w| WorkerStats {
                id: w.connection_id.clone(),
                rig_id: w.rig_id.clone(),
                pass: w.pass.clone(),
                hashrate: w.vardiff.hashrate(),
                difficulty: w.vardiff.last_target(),
                next_difficulty: w.vardiff.preview(),
            })
            .collect()
    }

    pub async fn hashrate(&self) -> u64 {
        let state = self.state.lock().await;
        state.workers.values().map(|w| w.vardiff.hashrate()).sum()
    }

    pub fn daemon(&self) -> Arc<dyn Daemon> {
        self.daemon.borrow().client.clone()
    }

    pub fn settings(&self) -> DaemonSettings {
        self.daemon.borrow().settings.clone()
    }

    /// Point the session (and its template monitor) at another daemon.
    pub fn reconfigure(&self, settings: DaemonSettings) -> Result<()> {
        let handle = self.connector.handle(&settings)?;
        tracing::info!(
            "Session {} now using node [{}:{}] SSL:{}",
            self.address,
            settings.host,
            settings.port,
            if settings.ssl { "ON" } else { "OFF" }
        );
        self.daemon.send_replace(handle);
        Ok(())
    }

    /// Stop polling and drop all jobs and workers. Returns the connection ids
    /// that were still attached.
    pub async fn stop(&self) -> Vec<String> {
        let mut state = self.state.lock().await;
        self.close_locked(&mut state)
    }

    fn close_locked(&self, state: &mut SessionState) -> Vec<String> {
        self.cancel.cancel();
        self.monitor.stop();
        state.stopped = true;
        state.jobs.clear();
        state.workers.drain().map(|(id, _)| id).collect()
    }

    pub async fn is_stopped(&self) -> bool {
        self.state.lock().await.stopped
    }
}
