//! Job definitions

use super::transaction::EthTransaction;

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Tenant used when a job does not name one
pub const DEFAULT_TENANT: &str = "_";

/// Transaction variant a job asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobType {
    #[serde(rename = "eth://ethereum/transaction")]
    EthTransaction,
    #[serde(rename = "eth://ethereum/rawTransaction")]
    EthRawTransaction,
    #[serde(rename = "eth://eea/privateTransaction")]
    EeaPrivateTransaction,
    #[serde(rename = "eth://eea/markingTransaction")]
    EeaMarkingTransaction,
    #[serde(rename = "eth://tessera/privateTransaction")]
    TesseraPrivateTransaction,
    #[serde(rename = "eth://tessera/markingTransaction")]
    TesseraMarkingTransaction,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::EthTransaction => "eth://ethereum/transaction",
            JobType::EthRawTransaction => "eth://ethereum/rawTransaction",
            JobType::EeaPrivateTransaction => "eth://eea/privateTransaction",
            JobType::EeaMarkingTransaction => "eth://eea/markingTransaction",
            JobType::TesseraPrivateTransaction => "eth://tessera/privateTransaction",
            JobType::TesseraMarkingTransaction => "eth://tessera/markingTransaction",
        }
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    #[default]
    Created,
    Started,
    Pending,
    Resending,
    Recovering,
    Warning,
    Stored,
    Mined,
    NeverMined,
    Failed,
}

/// Fee priority requested for a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Priority {
    VeryLow,
    Low,
    #[default]
    Medium,
    High,
    VeryHigh,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InternalData {
    pub chain_id: Option<u64>,
    pub priority: Priority,
    pub one_time_key: bool,
    /// Job is the root of its own resend chain: its transaction was already
    /// signed and broadcast once and must go out again as is.
    pub resend: bool,
    /// Lineage only
    pub parent_job_uuid: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub uuid: Uuid,
    pub chain_uuid: Uuid,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub internal_data: InternalData,
    #[serde(default)]
    pub transaction: EthTransaction,
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

impl Job {
    pub fn new(job_type: JobType, chain_uuid: Uuid) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            chain_uuid,
            job_type,
            tenant_id: default_tenant(),
            status: JobStatus::Created,
            internal_data: InternalData::default(),
            transaction: EthTransaction::default(),
        }
    }

    pub fn is_resend(&self) -> bool {
        self.internal_data.resend
    }

    pub fn is_one_time_key(&self) -> bool {
        self.internal_data.one_time_key
    }
}
