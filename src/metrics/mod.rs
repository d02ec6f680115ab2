//! Prometheus metrics for monitoring
//!
//! Exposes metrics for:
//! - Transactions sent and failed broadcasts per job type
//! - Nonce recoveries per chain
//! - Hash mismatches reported by nodes
//! - Failed jobs and job processing time

use crate::error::{SenderError, SenderResult};
use crate::types::JobType;

use axum::{http::StatusCode, routing::get, Router};
use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, CounterVec, Encoder, HistogramVec, TextEncoder,
};
use std::net::SocketAddr;
use tower_http::trace::TraceLayer;
use tracing::info;

lazy_static! {
    pub static ref TX_SENT: CounterVec = register_counter_vec!(
        "tx_sender_transactions_sent_total",
        "Total transactions broadcast",
        &["job_type"]
    ).unwrap();

    pub static ref SEND_FAILURES: CounterVec = register_counter_vec!(
        "tx_sender_send_failures_total",
        "Total failed broadcasts",
        &["job_type"]
    ).unwrap();

    pub static ref NONCE_RECOVERIES: CounterVec = register_counter_vec!(
        "tx_sender_nonce_recoveries_total",
        "Total nonce conflict recoveries",
        &["chain_id"]
    ).unwrap();

    pub static ref HASH_MISMATCH: CounterVec = register_counter_vec!(
        "tx_sender_hash_mismatch_total",
        "Total transactions hashed differently by the node",
        &["job_type"]
    ).unwrap();

    pub static ref JOBS_FAILED: CounterVec = register_counter_vec!(
        "tx_sender_jobs_failed_total",
        "Total jobs reported as failed",
        &["job_type"]
    ).unwrap();

    pub static ref JOB_DURATION: HistogramVec = register_histogram_vec!(
        "tx_sender_job_duration_seconds",
        "Job processing time, recoveries included",
        &["job_type"],
        vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]
    ).unwrap();
}

/// Prometheus metrics server
pub struct MetricsServer {
    port: u16,
}

impl MetricsServer {
    pub fn new(port: u16) -> Self {
        Self { port }
    }

    pub async fn run(&self) -> SenderResult<()> {
        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/health", get(|| async { "OK" }))
            .layer(TraceLayer::new_for_http());

        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        info!("Starting metrics server on {}", addr);

        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .map_err(|e| SenderError::Config(format!("cannot bind metrics port: {}", e)))?;
        axum::serve(listener, app)
            .await
            .map_err(|e| SenderError::Internal(format!("metrics server: {}", e)))
    }
}

async fn metrics_handler() -> Result<String, (StatusCode, String)> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder
        .encode(&metric_families, &mut buffer)
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    String::from_utf8(buffer).map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

// Helper functions to record metrics

pub fn record_transaction_sent(job_type: JobType) {
    TX_SENT.with_label_values(&[job_type.as_str()]).inc();
}

pub fn record_send_failure(job_type: JobType) {
    SEND_FAILURES.with_label_values(&[job_type.as_str()]).inc();
}

pub fn record_nonce_recovery(chain_id: u64) {
    NONCE_RECOVERIES
        .with_label_values(&[&chain_id.to_string()])
        .inc();
}

pub fn record_hash_mismatch(job_type: JobType) {
    HASH_MISMATCH.with_label_values(&[job_type.as_str()]).inc();
}

pub fn record_job_failed(job_type: JobType) {
    JOBS_FAILED.with_label_values(&[job_type.as_str()]).inc();
}

pub fn record_job_duration(job_type: JobType, duration_secs: f64) {
    JOB_DURATION
        .with_label_values(&[job_type.as_str()])
        .observe(duration_secs);
}
