//! Job and transaction types exchanged with the scheduler and the job API

mod job;
mod transaction;

pub use job::{InternalData, Job, JobStatus, JobType, Priority, DEFAULT_TENANT};
pub use transaction::{EthTransaction, SignedTransaction, TransactionType};
