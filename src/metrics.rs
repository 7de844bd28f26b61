use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};
use std::net::SocketAddr;
use warp::Filter;

lazy_static::lazy_static! {
    pub static ref SPANS_CONSUMED: IntCounter = register_int_counter!(
        "ingestor_spans_consumed_total",
        "Spans accepted from the log and routed to a shard"
    ).unwrap();

    pub static ref SPANS_REJECTED: IntCounterVec = register_int_counter_vec!(
        "ingestor_spans_rejected_total",
        "Log messages dropped before routing",
        &["reason"]
    ).unwrap();

    pub static ref TRACES_FLUSHED: IntCounter = register_int_counter!(
        "ingestor_traces_flushed_total",
        "Traces emitted by merger shards after their grace period"
    ).unwrap();

    pub static ref TRACES_SAMPLED: IntCounterVec = register_int_counter_vec!(
        "ingestor_traces_sampled_total",
        "Tail sampling decisions",
        &["decision"]
    ).unwrap();

    pub static ref TRACES_SHED: IntCounter = register_int_counter!(
        "ingestor_traces_shed_total",
        "Traces dropped by non-blocking storage submission"
    ).unwrap();

    pub static ref SPANS_WRITTEN: IntCounter = register_int_counter!(
        "ingestor_spans_written_total",
        "Spans inserted into the analytical store"
    ).unwrap();

    pub static ref SPANS_SPOOLED: IntCounter = register_int_counter!(
        "ingestor_spans_spooled_total",
        "Spans written to the local spool after a failed insert"
    ).unwrap();

    pub static ref SPOOL_FILES_RECOVERED: IntCounter = register_int_counter!(
        "ingestor_spool_files_recovered_total",
        "Spool files replayed into the store and deleted"
    ).unwrap();

    pub static ref SPOOL_LINES_SKIPPED: IntCounter = register_int_counter!(
        "ingestor_spool_lines_skipped_total",
        "Corrupt spool lines skipped during recovery"
    ).unwrap();

    pub static ref PENDING_TRACES: IntGauge = register_int_gauge!(
        "ingestor_pending_traces",
        "Trace ids currently armed in the timing wheel"
    ).unwrap();
}

/// Render the default registry in Prometheus text format
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = vec![];
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("failed to encode metrics: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

pub async fn start_metrics_server(addr: SocketAddr) {
    let metrics_route = warp::path("metrics").map(render);
    let health_route = warp::path("health").map(|| "OK");

    tracing::info!("Starting metrics server on http://{}/metrics", addr);
    warp::serve(metrics_route.or(health_route)).run(addr).await;
}
