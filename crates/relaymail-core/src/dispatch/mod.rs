//! Campaign dispatch: job creation, operator actions and the polling engine

mod engine;
mod jobs;

pub use engine::{DispatchEngine, TickReport, ITEM_HEADER, JOB_HEADER};
pub use jobs::{CreateJobRequest, JobManager, RetryAction};
