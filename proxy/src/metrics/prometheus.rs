use prometheus::core::Collector;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGauge, Opts, TextEncoder};
use std::sync::OnceLock;

static ACCEPTED: OnceLock<IntCounter> = OnceLock::new();
static REJECTED: OnceLock<IntCounterVec> = OnceLock::new();
static BLOCKS_FOUND: OnceLock<IntCounter> = OnceLock::new();
static JOB_BROADCASTS: OnceLock<IntCounter> = OnceLock::new();

static RPC_REQUESTS: OnceLock<IntCounter> = OnceLock::new();
static RPC_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_UPDATES: OnceLock<IntCounter> = OnceLock::new();
static TEMPLATE_FETCH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static BLOCK_SUBMIT_REJECTED: OnceLock<IntCounter> = OnceLock::new();

static PUBLISH_ERRORS: OnceLock<IntCounter> = OnceLock::new();
static PUBLISH_DROPPED: OnceLock<IntCounter> = OnceLock::new();

static ACTIVE_SESSIONS: OnceLock<IntGauge> = OnceLock::new();
static TEMPLATE_HEIGHT: OnceLock<IntGauge> = OnceLock::new();

fn counter(name: &str, help: &str) -> IntCounter {
    IntCounter::new(name, help).expect("static metric definition")
}

fn gauge(name: &str, help: &str) -> IntGauge {
    IntGauge::new(name, help).expect("static metric definition")
}

fn accepted() -> &'static IntCounter {
    ACCEPTED.get_or_init(|| counter("shares_accepted_total", "Total accepted shares"))
}

fn rejected() -> &'static IntCounterVec {
    REJECTED.get_or_init(|| {
        IntCounterVec::new(
            Opts::new("shares_rejected_total", "Total rejected shares by reason"),
            &["reason"],
        )
        .expect("static metric definition")
    })
}

fn blocks_found() -> &'static IntCounter {
    BLOCKS_FOUND.get_or_init(|| counter("blocks_found_total", "Total block solutions found"))
}

fn job_broadcasts() -> &'static IntCounter {
    JOB_BROADCASTS.get_or_init(|| {
        counter(
            "job_broadcasts_total",
            "Total mining.notify broadcasts sent",
        )
    })
}

fn rpc_requests() -> &'static IntCounter {
    RPC_REQUESTS.get_or_init(|| counter("rpc_requests_total", "Total RPC requests to the node"))
}

fn rpc_errors() -> &'static IntCounter {
    RPC_ERRORS.get_or_init(|| counter("rpc_errors_total", "Total RPC errors"))
}

fn template_updates() -> &'static IntCounter {
    TEMPLATE_UPDATES
        .get_or_init(|| counter("block_template_updates_total", "Total template updates"))
}

fn template_fetch_errors() -> &'static IntCounter {
    TEMPLATE_FETCH_ERRORS.get_or_init(|| {
        counter(
            "block_template_fetch_errors_total",
            "Total template fetch errors",
        )
    })
}

fn block_submit_rejected() -> &'static IntCounter {
    BLOCK_SUBMIT_REJECTED.get_or_init(|| {
        counter(
            "block_submit_rejected_total",
            "Total block submits rejected by the node",
        )
    })
}

fn publish_errors() -> &'static IntCounter {
    PUBLISH_ERRORS.get_or_init(|| counter("share_publish_errors_total", "Total failed share publishes"))
}

fn publish_dropped() -> &'static IntCounter {
    PUBLISH_DROPPED.get_or_init(|| {
        counter(
            "share_publish_dropped_total",
            "Shares dropped because the publish queue was full",
        )
    })
}

fn active_sessions() -> &'static IntGauge {
    ACTIVE_SESSIONS.get_or_init(|| gauge("stratum_active_sessions", "Registered Stratum sessions"))
}

fn template_height() -> &'static IntGauge {
    TEMPLATE_HEIGHT.get_or_init(|| gauge("block_template_height", "Current block template height"))
}

pub fn inc_accepted() {
    accepted().inc();
}

pub fn inc_rejected(reason: &str) {
    rejected().with_label_values(&[reason]).inc();
}

pub fn inc_blocks_found() {
    blocks_found().inc();
}

pub fn inc_job_broadcasts() {
    job_broadcasts().inc();
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

pub fn inc_block_submit_rejected() {
    block_submit_rejected().inc();
}

pub fn inc_publish_errors() {
    publish_errors().inc();
}

pub fn inc_publish_dropped() {
    publish_dropped().inc();
}

pub fn set_active_sessions(n: usize) {
    active_sessions().set(n as i64);
}

pub fn set_template_height(height: u64) {
    template_height().set(height as i64);
}

/// Text exposition of every proxy metric.
pub fn render() -> String {
    let enc = TextEncoder::new();
    let mut mfs = Vec::new();

    mfs.extend(accepted().collect());
    mfs.extend(rejected().collect());
    mfs.extend(blocks_found().collect());
    mfs.extend(job_broadcasts().collect());
    mfs.extend(rpc_requests().collect());
    mfs.extend(rpc_errors().collect());
    mfs.extend(template_updates().collect());
    mfs.extend(template_fetch_errors().collect());
    mfs.extend(block_submit_rejected().collect());
    mfs.extend(publish_errors().collect());
    mfs.extend(publish_dropped().collect());
    mfs.extend(active_sessions().collect());
    mfs.extend(template_height().collect());

    let mut buf = Vec::new();
    let _ = enc.encode(&mfs, &mut buf);
    String::from_utf8_lossy(&buf).to_string()
}
