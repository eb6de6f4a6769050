use prometheus::{register_histogram_vec, register_int_counter_vec, HistogramVec, IntCounterVec};

lazy_static::lazy_static! {
    pub static ref QUERIES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cumulus_queries_total", "Total retrieval queries", &["horizon", "status"]
    ).unwrap();
    pub static ref QUERY_DURATION: HistogramVec = register_histogram_vec!(
        "cumulus_query_duration_seconds", "Retrieval duration", &["horizon"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5]
    ).unwrap();
    pub static ref FALLBACKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cumulus_fallbacks_total", "Retrievals that declined the primary path", &["horizon", "reason"]
    ).unwrap();
    pub static ref REBUILDS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cumulus_rebuilds_total", "Rebuild pipeline runs", &["horizon", "status"]
    ).unwrap();
    pub static ref BUILD_DURATION: HistogramVec = register_histogram_vec!(
        "cumulus_build_duration_seconds", "Index build duration", &["horizon", "strategy"],
        vec![0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0]
    ).unwrap();
    pub static ref DEPLOYS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cumulus_deploys_total", "Generation deployments", &["horizon", "strategy", "status"]
    ).unwrap();
    pub static ref BACKUPS_PRUNED_TOTAL: IntCounterVec = register_int_counter_vec!(
        "cumulus_backups_pruned_total", "Backups removed by retention", &["horizon", "strategy"]
    ).unwrap();
}

pub fn init() {
    lazy_static::initialize(&QUERIES_TOTAL);
    lazy_static::initialize(&QUERY_DURATION);
    lazy_static::initialize(&FALLBACKS_TOTAL);
    lazy_static::initialize(&REBUILDS_TOTAL);
    lazy_static::initialize(&BUILD_DURATION);
    lazy_static::initialize(&DEPLOYS_TOTAL);
    lazy_static::initialize(&BACKUPS_PRUNED_TOTAL);
}
