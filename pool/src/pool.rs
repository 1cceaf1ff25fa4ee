/// Pool orchestrator
///
/// Owns the per-wallet mining sessions and the connection -> wallet map, and
/// drives one actor per connection so that every request on a connection is
/// parsed, handled and answered in order. Job pushes from sessions are routed
/// through the same actor mailbox.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::blockchain::{BlockTemplate, Daemon, DaemonConnector, DaemonSettings};
use crate::error::{PoolError, Result};
use crate::jobs::Job;
use crate::metrics::prometheus as metrics;
use crate::pow::PowBackend;
use crate::session::{JobPush, JobSink, MiningSession, ResolvedJob, SessionOptions};
use crate::storage::BlockStore;
use crate::stratum::{LoginParams, StratumController, StratumError, StratumRequest, SubmitParams, TransportEvent};

/// Address blocks from the HTTP core-miner route are recorded under
pub const HTTP_MINER: &str = "HTTP";

#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Daemon used by sessions whose login carries no overrides
    pub default_settings: DaemonSettings,
    pub session: SessionOptions,
    /// Idle time after which the reaper destroys a session
    pub stale_after: Duration,
    pub reaper_interval: Duration,
}

/// What happened to a submitted share
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShareOutcome {
    Accepted,
    /// Accepted, and the block it completed was taken by the daemon
    BlockFound(String),
    /// Accepted, but the block submission failed and jobs were refreshed
    BlockRejected(String),
    Rejected(&'static str),
}

enum Inbound {
    Transport(TransportEvent),
    Push(Job),
}

type SessionSlot = Arc<OnceCell<Arc<MiningSession>>>;

pub struct Pool {
    options: PoolOptions,
    controller: Arc<StratumController>,
    connector: Arc<dyn DaemonConnector>,
    backend: Arc<dyn PowBackend>,
    store: Arc<dyn BlockStore>,
    sessions: RwLock<HashMap<String, SessionSlot>>,
    /// connection id -> wallet address
    miner_ids: RwLock<HashMap<String, String>>,
    mailboxes: RwLock<HashMap<String, mpsc::UnboundedSender<Inbound>>>,
    pushes: JobSink,
    push_rx: std::sync::Mutex<Option<mpsc::UnboundedReceiver<JobPush>>>,
    cancel: CancellationToken,
}

impl Pool {
    pub fn new(
        options: PoolOptions,
        controller: Arc<StratumController>,
        connector: Arc<dyn DaemonConnector>,
        backend: Arc<dyn PowBackend>,
        store: Arc<dyn BlockStore>,
    ) -> Arc<Self> {
        let (pushes, push_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            options,
            controller,
            connector,
            backend,
            store,
            sessions: RwLock::new(HashMap::new()),
            miner_ids: RwLock::new(HashMap::new()),
            mailboxes: RwLock::new(HashMap::new()),
            pushes,
            push_rx: std::sync::Mutex::new(Some(push_rx)),
            cancel: CancellationToken::new(),
        })
    }

    pub fn options(&self) -> &PoolOptions {
        &self.options
    }

    pub fn controller(&self) -> &Arc<StratumController> {
        &self.controller
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.store
    }

    /// Consume transport events until the transport goes away or `shutdown`
    /// is called. Starts the reaper and the job push router.
    pub async fn run(self: Arc<Self>, mut events: mpsc::UnboundedReceiver<TransportEvent>) {
        self.start_reaper();
        self.start_push_router();

        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => break,
                event = events.recv() => event,
            };
            let Some(event) = event else { break };

            match event {
                TransportEvent::Connected { connection_id, peer_addr } => {
                    let (tx, rx) = mpsc::unbounded_channel();
                    self.mailboxes.write().await.insert(connection_id.clone(), tx);

                    let pool = Arc::clone(&self);
                    let id = connection_id.clone();
                    tokio::spawn(async move { pool.connection_actor(id, rx).await });

                    self.controller.accept(&connection_id).await;
                    tracing::info!("New connection from [{}]: {}", peer_addr, connection_id);
                }
                TransportEvent::Closed { connection_id } => {
                    let mailbox = self.mailboxes.write().await.remove(&connection_id);
                    if let Some(mailbox) = mailbox {
                        let _ = mailbox.send(Inbound::Transport(TransportEvent::Closed { connection_id }));
                    }
                }
                event => {
                    let mailbox = self.mailboxes.read().await.get(event.connection_id()).cloned();
                    if let Some(mailbox) = mailbox {
                        let _ = mailbox.send(Inbound::Transport(event));
                    }
                }
            }
        }

        tracing::info!("Pool event loop stopped");
    }

    async fn connection_actor(self: Arc<Self>, connection_id: String, mut inbox: mpsc::UnboundedReceiver<Inbound>) {
        while let Some(inbound) = inbox.recv().await {
            match inbound {
                Inbound::Transport(TransportEvent::Closed { .. }) => {
                    self.handle_disconnect(&connection_id).await;
                    break;
                }
                Inbound::Transport(event) => {
                    if let Some(request) = self.controller.route(event).await {
                        self.dispatch(&connection_id, request).await;
                    }
                }
                Inbound::Push(job) => {
                    if self.miner_ids.read().await.contains_key(&connection_id) {
                        let _ = self.controller.job(&connection_id, &job).await;
                        metrics::inc_job_pushes();
                    }
                }
            }
        }
    }

    fn start_push_router(self: &Arc<Self>) {
        let rx = self.push_rx.lock().ok().and_then(|mut guard| guard.take());
        let Some(mut rx) = rx else { return };

        let pool = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let push = tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    push = rx.recv() => push,
                };
                let Some(JobPush { connection_id, job }) = push else { break };

                let mailbox = pool.mailboxes.read().await.get(&connection_id).cloned();
                if let Some(mailbox) = mailbox {
                    let _ = mailbox.send(Inbound::Push(job));
                }
            }
        });
    }

    fn start_reaper(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        let period = self.options.reaper_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            loop {
                tokio::select! {
                    _ = pool.cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let reaped = pool.reap_stale(Instant::now()).await;
                if reaped > 0 {
                    tracing::info!("Reaped {} stale session(s)", reaped);
                }
            }
        });
    }

    pub async fn dispatch(&self, connection_id: &str, request: StratumRequest) {
        tracing::trace!("{} (id {}) from {}", request.method(), request.id(), connection_id);
        match request {
            StratumRequest::Login { id, params } => {
                self.handle_login(connection_id, id, params).await;
            }
            StratumRequest::GetJob { id } => {
                self.handle_getjob(connection_id, id).await;
            }
            StratumRequest::KeepAlive { id } => {
                self.handle_keepalive(connection_id, id).await;
            }
            StratumRequest::Submit { id, params } => {
                self.handle_submit(connection_id, id, params).await;
            }
        }
    }

    /// Existing session for `address`, without creating one.
    pub async fn session(&self, address: &str) -> Option<Arc<MiningSession>> {
        let slot = self.sessions.read().await.get(address).cloned()?;
        slot.get().cloned()
    }

    pub async fn sessions(&self) -> Vec<Arc<MiningSession>> {
        let slots: Vec<SessionSlot> = self.sessions.read().await.values().cloned().collect();
        slots.iter().filter_map(|slot| slot.get().cloned()).collect()
    }

    /// Session registered for a logged-in connection.
    pub async fn registered(&self, connection_id: &str) -> Option<Arc<MiningSession>> {
        let address = self.miner_ids.read().await.get(connection_id).cloned()?;
        self.session(&address).await
    }

    /// Get or create the session for `address`. Concurrent callers for the
    /// same address share one creation; a failed creation leaves no entry.
    pub async fn session_for(&self, address: &str, pass: &str) -> Result<Arc<MiningSession>> {
        let slot = {
            let mut sessions = self.sessions.write().await;
            sessions
                .entry(address.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let created = slot
            .get_or_try_init(|| self.create_session(address, pass))
            .await
            .cloned();

        if created.is_err() {
            let mut sessions = self.sessions.write().await;
            if sessions.get(address).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                sessions.remove(address);
            }
        }
        self.publish_session_count().await;

        created
    }

    async fn create_session(&self, address: &str, pass: &str) -> Result<Arc<MiningSession>> {
        let settings = self.options.default_settings.with_overrides(pass);
        tracing::info!(
            "Creating miner instance for {} using node [{}:{}] SSL:{}",
            address,
            settings.host,
            settings.port,
            if settings.ssl { "ON" } else { "OFF" }
        );

        let session = MiningSession::new(
            address.to_string(),
            &settings,
            Arc::clone(&self.connector),
            Arc::clone(&self.backend),
            self.options.session.clone(),
            self.pushes.clone(),
        )?;
        session.start().await?;

        tracing::info!("New miner instance created for {}", address);
        Ok(session)
    }

    /// Stop `session` and forget it, unless the map already holds a newer
    /// session for the same address.
    pub async fn destroy_session(&self, address: &str, session: &Arc<MiningSession>) {
        let workers = session.stop().await;
        self.unlink_session(address, session, workers).await;
    }

    /// Drop an already stopped session from the registries.
    async fn unlink_session(&self, address: &str, session: &Arc<MiningSession>, workers: Vec<String>) {
        {
            let mut sessions = self.sessions.write().await;
            let current = sessions
                .get(address)
                .and_then(|slot| slot.get())
                .is_some_and(|s| Arc::ptr_eq(s, session));
            if current {
                sessions.remove(address);
            }
        }

        if !workers.is_empty() {
            let mut miner_ids = self.miner_ids.write().await;
            for id in workers {
                if miner_ids.get(&id).is_some_and(|a| a == address) {
                    miner_ids.remove(&id);
                }
            }
        }

        self.publish_session_count().await;
        tracing::debug!("Destroyed session for {}", address);
    }

    async fn publish_session_count(&self) {
        let count = self.sessions.read().await.len();
        metrics::set_active_sessions(count);
    }

    /// Destroy every session idle for longer than the stale timeout as of
    /// `now`. Returns how many were destroyed.
    pub async fn reap_stale(&self, now: Instant) -> usize {
        let mut reaped = 0;
        for session in self.sessions().await {
            if let Some(workers) = session.stop_if_idle(now, self.options.stale_after).await {
                self.unlink_session(session.address(), &session, workers).await;
                reaped += 1;
            }
        }
        reaped
    }

    pub async fn handle_login(&self, connection_id: &str, id: serde_json::Value, params: LoginParams) -> bool {
        let address = params.login.as_str();

        let previous = self.miner_ids.read().await.get(connection_id).cloned();
        if previous.as_deref().is_some_and(|p| p != address) {
            self.handle_disconnect(connection_id).await;
        }

        // Registered before joining, so a teardown that catches this worker
        // also clears the entry.
        self.miner_ids
            .write()
            .await
            .insert(connection_id.to_string(), address.to_string());

        let mut retried = false;
        let session = loop {
            let session = match self.session_for(address, &params.pass).await {
                Ok(session) => session,
                Err(e) => return self.reject_login(connection_id, id, address, e).await,
            };

            match session.add_worker(connection_id, &params.pass, params.rig_id.clone()).await {
                Ok(()) => break session,
                // Lost the race with a teardown; build a fresh session
                Err(PoolError::SessionClosed(_)) if !retried => {
                    retried = true;
                    self.destroy_session(address, &session).await;
                }
                Err(e) => return self.reject_login(connection_id, id, address, e).await,
            }
        };

        let job = match session.issue_job(connection_id).await {
            Ok(job) => job,
            Err(e) => {
                self.handle_disconnect(connection_id).await;
                return self.reject_login(connection_id, id, address, e).await;
            }
        };

        tracing::info!(
            "New miner connected: {} ({}{})",
            connection_id,
            address,
            params.agent.as_deref().map(|a| format!(", {}", a)).unwrap_or_default()
        );
        let _ = self.controller.login_accepted(connection_id, id, &job).await;
        true
    }

    async fn reject_login(&self, connection_id: &str, id: serde_json::Value, address: &str, error: PoolError) -> bool {
        tracing::warn!("Login for {} from {} failed: {}", address, connection_id, error);
        {
            let mut miner_ids = self.miner_ids.write().await;
            if miner_ids.get(connection_id).is_some_and(|a| a == address) {
                miner_ids.remove(connection_id);
            }
        }
        let _ = self.controller.login_rejected(connection_id, id).await;
        false
    }

    pub async fn handle_getjob(&self, connection_id: &str, id: serde_json::Value) -> Option<Job> {
        let Some(session) = self.registered(connection_id).await else {
            let _ = self.controller.error(connection_id, id, StratumError::NOT_LOGGED_IN).await;
            return None;
        };
        session.touch().await;

        match session.issue_job(connection_id).await {
            Ok(job) => {
                tracing::info!("Miner {} send new job: {}", connection_id, job.job_id);
                let _ = self.controller.job(connection_id, &job).await;
                Some(job)
            }
            Err(e) => {
                tracing::warn!("No job for {}: {}", connection_id, e);
                let _ = self.controller.error(connection_id, id, &e.to_string()).await;
                None
            }
        }
    }

    pub async fn handle_keepalive(&self, connection_id: &str, id: serde_json::Value) {
        if let Some(session) = self.registered(connection_id).await {
            session.touch().await;
        }
        let _ = self.controller.keepalive(connection_id, id).await;
    }

    pub async fn handle_submit(&self, connection_id: &str, id: serde_json::Value, params: SubmitParams) -> ShareOutcome {
        let outcome = self.check_share(connection_id, &params).await;

        match &outcome {
            ShareOutcome::Rejected(message) => {
                metrics::inc_rejected();
                let _ = self.controller.share_rejected(connection_id, id, message).await;
            }
            _ => {
                metrics::inc_accepted();
                let _ = self.controller.share_accepted(connection_id, id).await;
            }
        }

        outcome
    }

    async fn check_share(&self, connection_id: &str, params: &SubmitParams) -> ShareOutcome {
        let Some(session) = self.registered(connection_id).await else {
            return ShareOutcome::Rejected(StratumError::NOT_LOGGED_IN);
        };
        session.touch().await;

        let Some(resolved) = session.resolve_job(&params.job_id).await else {
            return ShareOutcome::Rejected(StratumError::JOB_EXPIRED);
        };

        let hash = match self.share_hash(&resolved.job, params.nonce).await {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!("Could not hash share from {}: {}", connection_id, e);
                return ShareOutcome::Rejected(StratumError::INVALID_SHARE);
            }
        };

        if !hex::encode(hash).eq_ignore_ascii_case(&params.result) {
            tracing::error!("Miner {} submitted an invalid share", connection_id);
            return ShareOutcome::Rejected(StratumError::INVALID_SHARE);
        }

        let mut outcome = ShareOutcome::Accepted;
        if self.backend.meets_difficulty(&hash, resolved.template.difficulty) {
            outcome = self.submit_block(connection_id, &session, &resolved, params.nonce).await;
        }

        tracing::debug!(
            "Miner {} submitted valid share of {} difficulty for block {}",
            connection_id,
            resolved.job.difficulty,
            resolved.template.height
        );
        session.record_share(connection_id, resolved.job.difficulty).await;

        outcome
    }

    async fn share_hash(&self, job: &Job, nonce: u32) -> Result<[u8; 32]> {
        let blob = hex::decode(&job.blob).map_err(|e| PoolError::request(format!("job blob: {}", e)))?;
        let backend = Arc::clone(&self.backend);
        tokio::task::spawn_blocking(move || backend.hash(&blob, nonce))
            .await
            .map_err(PoolError::upstream)?
    }

    async fn submit_block(
        &self,
        connection_id: &str,
        session: &Arc<MiningSession>,
        resolved: &ResolvedJob,
        nonce: u32,
    ) -> ShareOutcome {
        let template = &resolved.template;
        let block = match self.backend.finalize(template, resolved.job.pool_nonce, nonce) {
            Ok(block) => block,
            Err(e) => {
                tracing::error!("Could not finalize block from {}: {}", connection_id, e);
                session.force_refresh().await;
                return ShareOutcome::BlockRejected(String::new());
            }
        };

        tracing::warn!(
            "Miner {} found block [{}] meeting {} difficulty for block {}",
            connection_id,
            block.hash,
            template.difficulty,
            template.height
        );
        tracing::debug!("Submitting raw block to node: {}", block.raw);

        match session.daemon().submit_block(&block.raw).await {
            Ok(accepted) if accepted.eq_ignore_ascii_case(&block.hash) => {
                metrics::inc_blocks_found();
                tracing::info!("Block accepted by node: {}", block.hash);
                if let Err(e) = self.store.add_block(session.address(), &block.hash, block.timestamp).await {
                    tracing::warn!("Failed to record block {}: {}", block.hash, e);
                }
                ShareOutcome::BlockFound(block.hash)
            }
            Ok(accepted) => {
                metrics::inc_block_submit_rejected();
                tracing::error!("Block rejected by node: {} (node returned {})", block.hash, accepted);
                session.force_refresh().await;
                ShareOutcome::BlockRejected(block.hash)
            }
            Err(e) => {
                metrics::inc_block_submit_rejected();
                tracing::error!("Error submitting block to node: {} => {}", block.hash, e);
                session.force_refresh().await;
                ShareOutcome::BlockRejected(block.hash)
            }
        }
    }

    pub async fn handle_disconnect(&self, connection_id: &str) {
        let address = self.miner_ids.write().await.remove(connection_id);

        if let Some(address) = address {
            if let Some(session) = self.session(&address).await {
                // The session stops itself as the last worker leaves
                if session.remove_worker(connection_id).await == 0 && session.is_stopped().await {
                    tracing::debug!("Last miner for {} disconnected, deleting instance...", address);
                    self.unlink_session(&address, &session, Vec::new()).await;
                }
            }
        }

        tracing::info!("Miner disconnected: {}", connection_id);
    }

    /// Pass a block built by an external core miner to `daemon` and record
    /// it under `HTTP_MINER`. Returns what the daemon answered.
    pub async fn submit_raw_block(&self, daemon: &dyn Daemon, raw: &str) -> Result<String> {
        let bytes = hex::decode(raw).map_err(|e| PoolError::request(format!("block is not hex: {}", e)))?;
        let hash = self.backend.block_id(&bytes)?;

        let result = daemon.submit_block(raw).await.map_err(PoolError::upstream)?;
        metrics::inc_blocks_found();
        tracing::info!("Core miner block {} submitted, node returned {}", hash, result);

        self.store
            .add_block(HTTP_MINER, &hash, chrono::Utc::now().timestamp())
            .await
            .map_err(PoolError::upstream)?;
        Ok(result)
    }

    /// Template for an external core miner, creating the session if needed.
    pub async fn core_job(&self, address: &str) -> Result<BlockTemplate> {
        let session = self.session_for(address, "").await?;
        session.touch().await;
        session.next_core_job().await
    }

    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let slots: Vec<(String, SessionSlot)> = self.sessions.write().await.drain().collect();
        for (_, slot) in slots {
            if let Some(session) = slot.get() {
                session.stop().await;
            }
        }
        self.miner_ids.write().await.clear();
        self.publish_session_count().await;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blockchain::DaemonInfo;
    use crate::pow::{Keccak256Backend, PrefixAddressValidator};
    use crate::session::tests::{FakeConnector, FakeDaemon};
    use crate::storage::MemoryBlockStore;
    use crate::stratum::Transport;
    use crate::vardiff::VarDiffConfig;
    use async_trait::async_trait;
    use serde_json::json;
    use sha3::{Digest, Keccak256};
    use std::sync::atomic::{AtomicU64, Ordering};

    const ADDR: &str = "TRTLaddr";

    /// Accepts every block and answers with its Keccak-256 id.
    pub(crate) struct AcceptingDaemon {
        pub inner: FakeDaemon,
    }

    #[async_trait]
    impl Daemon for AcceptingDaemon {
        async fn block_template(&self, wallet: &str, reserve: usize) -> anyhow::Result<BlockTemplate> {
            self.inner.block_template(wallet, reserve).await
        }

        async fn submit_block(&self, hex_block: &str) -> anyhow::Result<String> {
            let bytes = hex::decode(hex_block)?;
            Ok(hex::encode(Keccak256::digest(&bytes)))
        }

        async fn last_block(&self) -> anyhow::Result<serde_json::Value> {
            self.inner.last_block().await
        }

        async fn info(&self) -> anyhow::Result<DaemonInfo> {
            self.inner.info().await
        }
    }

    pub(crate) struct StaticConnector(pub Arc<dyn Daemon>);

    impl DaemonConnector for StaticConnector {
        fn connect(&self, _settings: &DaemonSettings) -> anyhow::Result<Arc<dyn Daemon>> {
            Ok(self.0.clone())
        }
    }

    pub(crate) fn fake(height: u64, difficulty: u64) -> FakeDaemon {
        FakeDaemon {
            height: AtomicU64::new(height),
            difficulty,
        }
    }

    pub(crate) async fn pool_with(connector: Arc<dyn DaemonConnector>) -> (Arc<Pool>, Arc<MemoryBlockStore>) {
        let (transport, _events) = Transport::start("127.0.0.1".parse().unwrap(), 0).await.unwrap();
        let controller = Arc::new(StratumController::new(
            transport,
            Arc::new(PrefixAddressValidator::new("TRTL", 8)),
        ));
        let store = Arc::new(MemoryBlockStore::new());
        let options = PoolOptions {
            default_settings: DaemonSettings::new("127.0.0.1", 11898, false, Duration::from_secs(1)),
            session: SessionOptions {
                vardiff: VarDiffConfig::with_start(10_000),
                poll_interval: Duration::from_millis(20),
                first_template_timeout: Duration::from_millis(300),
            },
            stale_after: Duration::from_secs(120),
            reaper_interval: Duration::from_secs(60),
        };
        let pool = Pool::new(options, controller, connector, Arc::new(Keccak256Backend), store.clone());
        (pool, store)
    }

    async fn pool(height: u64, difficulty: u64) -> (Arc<Pool>, Arc<FakeDaemon>) {
        let daemon = Arc::new(fake(height, difficulty));
        let (pool, _) = pool_with(Arc::new(FakeConnector { daemon: daemon.clone() })).await;
        (pool, daemon)
    }

    fn login(address: &str) -> LoginParams {
        LoginParams {
            login: address.to_string(),
            pass: String::new(),
            rig_id: None,
            agent: None,
        }
    }

    fn solve(job: &Job, nonce: u32) -> SubmitParams {
        let blob = hex::decode(&job.blob).unwrap();
        let hash = Keccak256Backend.hash(&blob, nonce).unwrap();
        SubmitParams {
            id: "c1".into(),
            job_id: job.job_id.clone(),
            nonce,
            result: hex::encode(hash),
        }
    }

    #[tokio::test]
    async fn login_creates_one_session_per_address() {
        let (pool, _) = pool(5, u64::MAX).await;
        assert!(pool.handle_login("c1", json!(1), login(ADDR)).await);
        assert!(pool.handle_login("c2", json!(1), login(ADDR)).await);

        assert_eq!(pool.sessions().await.len(), 1);
        let session = pool.registered("c1").await.unwrap();
        assert_eq!(session.worker_count().await, 2);
        assert_eq!(session.job_count().await, 2);
    }

    #[tokio::test]
    async fn login_fails_without_template_and_leaves_no_session() {
        let (pool, _) = pool(0, u64::MAX).await;
        assert!(!pool.handle_login("c1", json!(1), login(ADDR)).await);
        assert!(pool.sessions().await.is_empty());
        assert!(pool.registered("c1").await.is_none());
    }

    #[tokio::test]
    async fn getjob_and_submit_require_login() {
        let (pool, _) = pool(5, u64::MAX).await;
        assert!(pool.handle_getjob("c1", json!(1)).await.is_none());

        let params = SubmitParams {
            id: "c1".into(),
            job_id: "j".into(),
            nonce: 0,
            result: "00".into(),
        };
        assert_eq!(
            pool.handle_submit("c1", json!(2), params).await,
            ShareOutcome::Rejected(StratumError::NOT_LOGGED_IN)
        );
    }

    #[tokio::test]
    async fn getjob_advances_pool_nonce() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let job = pool.handle_getjob("c1", json!(2)).await.unwrap();
        assert_eq!(job.pool_nonce, 1);
    }

    #[tokio::test]
    async fn forged_and_expired_shares_are_rejected() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let job = pool.handle_getjob("c1", json!(2)).await.unwrap();

        let mut forged = solve(&job, 7);
        forged.result = "ff".repeat(32);
        assert_eq!(
            pool.handle_submit("c1", json!(3), forged).await,
            ShareOutcome::Rejected(StratumError::INVALID_SHARE)
        );

        let mut unknown = solve(&job, 7);
        unknown.job_id = "nope".into();
        assert_eq!(
            pool.handle_submit("c1", json!(4), unknown).await,
            ShareOutcome::Rejected(StratumError::JOB_EXPIRED)
        );

        assert_eq!(pool.handle_submit("c1", json!(5), solve(&job, 7)).await, ShareOutcome::Accepted);
    }

    #[tokio::test]
    async fn failed_block_submission_forces_one_refresh() {
        // Network difficulty 1: every valid share is a block candidate.
        let (pool, _) = pool(5, 1).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        pool.handle_login("c2", json!(1), login(ADDR)).await;
        let session = pool.registered("c1").await.unwrap();
        let job = pool.handle_getjob("c1", json!(2)).await.unwrap();
        assert_eq!(session.job_count().await, 3);

        let outcome = pool.handle_submit("c1", json!(3), solve(&job, 9)).await;
        assert!(matches!(outcome, ShareOutcome::BlockRejected(_)));

        // old jobs cleared, one fresh job per worker
        assert_eq!(session.job_count().await, 2);
        assert!(session.resolve_job(&job.job_id).await.is_none());
    }

    #[tokio::test]
    async fn accepted_block_is_recorded() {
        let daemon: Arc<dyn Daemon> = Arc::new(AcceptingDaemon { inner: fake(5, 1) });
        let (pool, store) = pool_with(Arc::new(StaticConnector(daemon))).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let job = pool.handle_getjob("c1", json!(2)).await.unwrap();

        let outcome = pool.handle_submit("c1", json!(3), solve(&job, 11)).await;
        let ShareOutcome::BlockFound(hash) = outcome else {
            panic!("unexpected {:?}", outcome);
        };

        let last = store.last_block().await.unwrap();
        assert_eq!(last.hash, hash);
        assert_eq!(last.address, ADDR);
        assert_eq!(store.last_miner_block(ADDR).await.unwrap().hash, hash);
    }

    #[tokio::test]
    async fn last_disconnect_destroys_session() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        pool.handle_login("c2", json!(1), login(ADDR)).await;
        let session = pool.registered("c1").await.unwrap();

        pool.handle_disconnect("c1").await;
        assert_eq!(pool.sessions().await.len(), 1);
        pool.handle_disconnect("c2").await;
        assert!(pool.sessions().await.is_empty());
        assert!(session.is_stopped().await);
    }

    #[tokio::test]
    async fn login_between_last_disconnect_and_teardown_gets_a_fresh_session() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let old = pool.registered("c1").await.unwrap();

        // first half of a disconnect: the session empties and stops itself
        pool.miner_ids.write().await.remove("c1");
        assert_eq!(old.remove_worker("c1").await, 0);
        assert!(old.is_stopped().await);

        // a login lands before the pool unlinks the old session
        assert!(pool.handle_login("c2", json!(1), login(ADDR)).await);

        // second half of the disconnect
        pool.unlink_session(ADDR, &old, Vec::new()).await;

        let current = pool.registered("c2").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &current));
        assert!(!current.is_stopped().await);
        assert_eq!(current.worker_count().await, 1);
        assert!(pool.handle_getjob("c2", json!(2)).await.is_some());
    }

    #[tokio::test]
    async fn idle_stop_turns_away_late_joiners() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let old = pool.registered("c1").await.unwrap();
        let touched = old.last_touch().await;

        assert!(old.stop_if_idle(touched + Duration::from_secs(119), Duration::from_secs(120)).await.is_none());
        let held = old
            .stop_if_idle(touched + Duration::from_secs(121), Duration::from_secs(120))
            .await
            .unwrap();
        assert_eq!(held, vec!["c1".to_string()]);
        assert!(matches!(old.add_worker("c2", "", None).await, Err(PoolError::SessionClosed(_))));

        // the old session is still mapped; login replaces it
        assert!(pool.handle_login("c2", json!(1), login(ADDR)).await);
        let current = pool.registered("c2").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &current));

        assert_eq!(pool.sessions().await.len(), 1);
    }

    #[tokio::test]
    async fn raw_block_is_submitted_and_recorded_under_http() {
        let (pool, store) = pool_with(Arc::new(FakeConnector { daemon: Arc::new(fake(5, 1)) })).await;
        let raw = "07".repeat(96);
        let id = hex::encode(Keccak256::digest(hex::decode(&raw).unwrap()));

        let accepting = AcceptingDaemon { inner: fake(5, 1) };
        assert_eq!(pool.submit_raw_block(&accepting, &raw).await.unwrap(), id);
        let last = store.last_block().await.unwrap();
        assert_eq!(last.address, HTTP_MINER);
        assert_eq!(last.hash, id);

        // FakeDaemon refuses every block
        let refusing = fake(5, 1);
        assert!(matches!(
            pool.submit_raw_block(&refusing, &"08".repeat(96)).await,
            Err(PoolError::Upstream(_))
        ));
        assert!(matches!(
            pool.submit_raw_block(&accepting, "not hex").await,
            Err(PoolError::Request(_))
        ));
        assert_eq!(store.last_blocks(10).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn relogin_to_other_address_moves_worker() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        pool.handle_login("c1", json!(2), login("TRTLother")).await;

        assert!(pool.session(ADDR).await.is_none());
        assert_eq!(pool.registered("c1").await.unwrap().address(), "TRTLother");
    }

    #[tokio::test]
    async fn reaper_respects_stale_timeout() {
        let (pool, _) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let session = pool.registered("c1").await.unwrap();
        let touched = session.last_touch().await;

        assert_eq!(pool.reap_stale(touched + Duration::from_secs(119)).await, 0);
        assert_eq!(pool.sessions().await.len(), 1);

        assert_eq!(pool.reap_stale(touched + Duration::from_secs(121)).await, 1);
        assert!(pool.sessions().await.is_empty());
        assert!(session.is_stopped().await);
        assert!(pool.registered("c1").await.is_none());
    }

    #[tokio::test]
    async fn reaped_session_is_rebuilt_on_next_login() {
        let (pool, daemon) = pool(5, u64::MAX).await;
        pool.handle_login("c1", json!(1), login(ADDR)).await;
        let first = pool.registered("c1").await.unwrap();
        pool.reap_stale(first.last_touch().await + Duration::from_secs(121)).await;

        daemon.height.store(6, Ordering::SeqCst);
        assert!(pool.handle_login("c1", json!(2), login(ADDR)).await);
        let second = pool.registered("c1").await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.template().await.unwrap().height, 6);
    }

    #[tokio::test]
    async fn core_job_creates_session_at_network_difficulty() {
        let (pool, _) = pool(5, 777).await;
        let template = pool.core_job(ADDR).await.unwrap();
        assert_eq!(template.difficulty, 777);
        assert_eq!(pool.session(ADDR).await.unwrap().job_count().await, 1);
    }
}
