use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntGauge, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounter> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();
static FORCED_REFRESHES: OnceLock<IntCounter> = OnceLock::new();
static JOB_PUSHES: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_CONNECTIONS: OnceLock<IntGauge> = OnceLock::new();
static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();

// Metric names and help strings are constants; construction cannot fail.
fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).unwrap_or_else(|e| panic!("metric {}: {}", name, e))
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).unwrap_or_else(|e| panic!("metric {}: {}", name, e))
}

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| counter("shares_accepted_total", "Total accepted shares"))
}

fn rejected() -> &'static IntCounter {
    REJECTED.get_or_init(|| counter("shares_rejected_total", "Total rejected shares"))
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| counter("blocks_found_total", "Total blocks accepted by the daemon"))
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        counter(
            "block_submit_rejected_total",
            "Total block submissions the daemon refused",
        )
    })
}

fn forced_refreshes() -> &'static IntCounter {
    FORCED_REFRESHES.get_or_init(|| {
        counter(
            "forced_refreshes_total",
            "Total job refreshes forced by failed block submissions",
        )
    })
}

fn job_pushes() -> &'static IntCounter {
    JOB_PUSHES.get_or_init(|| counter("job_pushes_total", "Total unsolicited job pushes sent"))
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| counter("rpc_requests_total", "Total RPC requests to the daemon"))
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| counter("rpc_errors_total", "Total daemon RPC errors"))
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES.get_or_init(|| counter("block_template_updates_total", "Total template updates"))
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        counter(
            "block_template_fetch_errors_total",
            "Total template fetch errors",
        )
    })
}

fn active_connections() -> &'static IntGauge {
    ACTIVE_CONNECTIONS.get_or_init(|| gauge("stratum_active_connections", "Active Stratum connections"))
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| gauge("mining_sessions_active", "Active per-wallet mining sessions"))
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected() {
    rejected().inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_forced_refreshes() {
    forced_refreshes().inc();
}

pub fn inc_job_pushes() {
    job_pushes().inc();
}

pub fn inc_rpc_requests() {
    rpc_requests().inc();
}

pub fn inc_rpc_errors() {
    rpc_errors().inc();
}

pub fn inc_template_updates() {
    template_updates().inc();
}

pub fn inc_template_fetch_errors() {
    template_fetch_errors().inc();
}

pub fn inc_connections() {
    active_connections().inc();
}

pub fn dec_connections() {
    active_connections().dec();
}

pub fn set_active_sessions(count: usize) {
    active_sessions().set(count as i64);
}

pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(forced_refreshes().collect());
    mfs.extend(job_pushes().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(active_connections().collect());
    mfs.extend(active_sessions().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_lists_every_family() {
        inc_accepted();
        set_active_sessions(2);
        let text = render();
        for name in [
            "shares_accepted_total",
            "shares_rejected_total",
            "blocks_found_total",
            "forced_refreshes_total",
            "job_pushes_total",
            "rpc_requests_total",
            "stratum_active_connections",
            "mining_sessions_active",
        ] {
            assert!(text.contains(name), "missing {}", name);
        }
    }
}
