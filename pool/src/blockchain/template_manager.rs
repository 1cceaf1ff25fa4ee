/// Block Template Monitor - polls the daemon for new block templates
///
/// One monitor runs per mining session. A template is published only when
/// its height is above the last published one; subscribers observe it
/// through a `watch` channel.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time;
use tokio_util::sync::CancellationToken;

use super::daemon::{BlockTemplate, DaemonHandle};
use crate::error::{PoolError, Result};
use crate::metrics::prometheus as metrics;

/// Reserved bytes requested for the pool nonce.
pub const RESERVE_SIZE: usize = 8;

pub struct TemplateMonitor {
    wallet: String,
    poll_interval: Duration,
    daemon: watch::Receiver<DaemonHandle>,
    current: watch::Sender<Option<BlockTemplate>>,
    cancel: CancellationToken,
}

impl TemplateMonitor {
    pub fn new(
        wallet: String,
        daemon: watch::Receiver<DaemonHandle>,
        poll_interval: Duration,
    ) -> Arc<Self> {
        let (current, _) = watch::channel(None);

        Arc::new(Self {
            wallet,
            poll_interval,
            daemon,
            current,
            cancel: CancellationToken::new(),
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<BlockTemplate>> {
        self.current.subscribe()
    }

    pub fn current(&self) -> Option<BlockTemplate> {
        self.current.borrow().clone()
    }

    /// Start the poll loop. It runs until `stop` is called.
    pub fn start(self: &Arc<Self>) {
        let monitor = Arc::clone(self);

        tokio::spawn(async move {
            let mut interval = time::interval(monitor.poll_interval);
            interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = monitor.cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }

                if let Err(e) = monitor.poll_once().await {
                    metrics::inc_template_fetch_errors();
                    tracing::warn!("Template fetch for {} failed: {}", monitor.wallet, e);
                }
            }

            tracing::debug!("Template monitor for {} stopped", monitor.wallet);
        });
    }

    /// Fetch once and publish if the height advanced. Returns whether a new
    /// template was published.
    pub async fn poll_once(&self) -> Result<bool> {
        let daemon = self.daemon.borrow().client.clone();
        let template = daemon
            .block_template(&self.wallet, RESERVE_SIZE)
            .await
            .map_err(PoolError::from)?;

        let advanced = self.current.send_if_modified(|current| {
            let newer = current
                .as_ref()
                .map(|t| template.height > t.height)
                .unwrap_or(true);
            if newer {
                *current = Some(template.clone());
            }
            newer
        });

        if advanced {
            metrics::inc_template_updates();
            tracing::debug!(
                "New block template for {}: height={}, difficulty={}",
                self.wallet,
                template.height,
                template.difficulty
            );
        }

        Ok(advanced)
    }

    /// Suspend until the first template is available, at most `timeout`.
    pub async fn wait_first(&self, timeout: Duration) -> Result<BlockTemplate> {
        let mut rx = self.subscribe();
        let wait = async {
            rx.wait_for(|t| t.is_some())
                .await
                .ok()
                .and_then(|t| t.clone())
        };

        match time::timeout(timeout, wait).await {
            Ok(Some(template)) => Ok(template),
            Ok(None) => Err(PoolError::upstream("template monitor closed")),
            Err(_) => Err(PoolError::Upstream(format!(
                "no block template for {} within {}s",
                self.wallet,
                timeout.as_secs()
            ))),
        }
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for TemplateMonitor {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
