use once_cell::sync::Lazy;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, Encoder, Histogram, IntCounter,
    IntGauge, TextEncoder,
};

pub static SEARCHES_TOTAL: Lazy<IntCounter> =
    Lazy::new(|| register_int_counter!("shelfdb_searches_total", "Total k-NN searches").unwrap());
pub static SEARCH_LATENCY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("shelfdb_search_latency_seconds", "Search latency").unwrap()
});
pub static MUTATIONS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("shelfdb_mutations_total", "Total mutating operations").unwrap()
});
pub static EMBED_REQUESTS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    register_int_counter!("shelfdb_embed_requests_total", "Total embedding provider calls").unwrap()
});
pub static LIBRARIES: Lazy<IntGauge> =
    Lazy::new(|| register_int_gauge!("shelfdb_libraries", "Libraries currently loaded").unwrap());
pub static RECOVERY_SECONDS: Lazy<Histogram> = Lazy::new(|| {
    register_histogram!("shelfdb_recovery_seconds", "Startup recovery duration").unwrap()
});

pub fn render() -> String {
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    let mf = prometheus::gather();
    encoder.encode(&mf, &mut buf).unwrap_or_default();
    String::from_utf8_lossy(&buf).into_owned()
}
