use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct Metrics {
    pub sync_count: AtomicU64,
    pub sync_errors: AtomicU64,
    pub workloads_skipped: AtomicU64,
    pub policy_updates: AtomicU64,
}

impl Metrics {
    pub fn record_sync(&self) {
        self.sync_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sync_error(&self) {
        self.sync_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_workload_skipped(&self) {
        self.workloads_skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_policy_update(&self) {
        self.policy_updates.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(not(debug_assertions))]
pub fn init() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("microseg_controller=info".parse().unwrap())
                .add_directive("kube=info".parse().unwrap()),
        )
        .json()
        .init();
}

#[cfg(debug_assertions)]
pub fn init() {
    tracing_subscriber::fmt()
        .pretty()
        .without_time()
        .with_file(false)
        .with_line_number(false)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("microseg_controller=info".parse().unwrap())
                .add_directive("kube=info".parse().unwrap()),
        )
        .init();
}
