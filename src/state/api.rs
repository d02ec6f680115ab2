//! HTTP client for the job API

use super::{JobStatusReporter, UpdateJobRequest};
use crate::error::{SenderError, SenderResult};

use async_trait::async_trait;
use tracing::debug;
use uuid::Uuid;

pub struct HttpJobStatusReporter {
    client: reqwest::Client,
    base_url: String,
}

impl HttpJobStatusReporter {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    fn job_url(&self, job_uuid: Uuid) -> String {
        format!("{}/jobs/{}", self.base_url, job_uuid)
    }
}

#[async_trait]
impl JobStatusReporter for HttpJobStatusReporter {
    async fn update_job(&self, job_uuid: Uuid, update: &UpdateJobRequest) -> SenderResult<()> {
        debug!(%job_uuid, status = ?update.status, "updating job");

        let response = self
            .client
            .patch(self.job_url(job_uuid))
            .json(update)
            .send()
            .await
            .map_err(|e| SenderError::JobApi(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SenderError::JobApi(format!(
                "update of job {} failed ({}): {}",
                job_uuid, status, body
            )));
        }

        Ok(())
    }
}
