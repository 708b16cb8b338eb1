use lazy_static::lazy_static;
use prometheus::{
    register_gauge, register_gauge_vec, register_int_counter_vec, Encoder, Gauge, GaugeVec,
    IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref ACTIVE_SESSIONS: GaugeVec = register_gauge_vec!(
        "stbrelay_active_sessions",
        "Viewer sessions currently holding a MAC slot, per portal",
        &["portal_id"]
    )
    .unwrap();
    pub static ref MAC_ROTATIONS: IntCounterVec = register_int_counter_vec!(
        "stbrelay_mac_rotations_total",
        "MACs moved to the back of their portal's pool after a failure",
        &["portal_id"]
    )
    .unwrap();
    pub static ref EXHAUSTED: IntCounterVec = register_int_counter_vec!(
        "stbrelay_exhausted_total",
        "Play requests that found no working MAC",
        &["portal_id", "reason"]
    )
    .unwrap();
    pub static ref HLS_SESSIONS: Gauge = register_gauge!(
        "stbrelay_hls_sessions",
        "Shared HLS sessions currently registered"
    )
    .unwrap();
}

pub fn gather_metrics() -> String {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!("Failed to encode metrics: {}", e);
    }
    String::from_utf8_lossy(&buffer).into_owned()
}
