//! Job state reporting
//!
//! Jobs are persisted by the job API; the sender only pushes status
//! transitions and the transaction fields computed so far.

mod api;

pub use api::HttpJobStatusReporter;

use crate::error::SenderResult;
use crate::types::{EthTransaction, JobStatus};

use async_trait::async_trait;
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateJobRequest {
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub transaction: EthTransaction,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobStatusReporter: Send + Sync {
    async fn update_job(&self, job_uuid: Uuid, update: &UpdateJobRequest) -> SenderResult<()>;
}
