use std::{any::Any, panic::AssertUnwindSafe, sync::Arc};

use async_trait::async_trait;
use common::{DatasetJob, DatasetResult, FailureStage};
use futures_util::FutureExt;
use log::{error, info};
use tokio::{sync::Semaphore, task::JoinSet};

/// Upper bound on datasets uploaded at the same time.
pub const MAX_WORKERS: usize = 5;

/// Something that can take one dataset job to completion.
#[async_trait]
pub trait JobRunner: Send + Sync + 'static {
    async fn run(&self, job: DatasetJob) -> DatasetResult;
}

pub struct BatchScheduler<R> {
    runner: Arc<R>,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

impl<R: JobRunner> BatchScheduler<R> {
    pub fn new(runner: Arc<R>) -> Self {
        Self { runner }
    }

    pub fn workers_for(&self, jobs: usize) -> usize {
        jobs.min(MAX_WORKERS)
    }

    /// Runs every job with at most [`workers_for`](Self::workers_for) of them
    /// in flight. One result per job, in completion order. A job that panics
    /// is reported as an internal failure and does not affect the others.
    pub async fn run(&self, jobs: Vec<DatasetJob>) -> Vec<DatasetResult> {
        if jobs.is_empty() {
            return Vec::new();
        }
        let total = jobs.len();
        let workers = self.workers_for(total);
        info!("uploading {total} dataset(s) with {workers} worker(s)");

        let permits = Arc::new(Semaphore::new(workers));
        let mut tasks = JoinSet::new();
        for job in jobs {
            let runner = self.runner.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await;
                let name = job.dataset_name().to_string();
                let dataset_id = job.dataset_id();
                match AssertUnwindSafe(runner.run(job)).catch_unwind().await {
                    Ok(result) => result,
                    Err(payload) => {
                        let message = panic_message(payload.as_ref());
                        error!("upload of {name} panicked: {message}");
                        DatasetResult::failed(name, dataset_id, None, FailureStage::Internal, message)
                    }
                }
            });
        }

        let mut results = Vec::with_capacity(total);
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => {
                    info!(
                        "dataset {} finished ({}/{total})",
                        result.dataset_name,
                        results.len() + 1
                    );
                    results.push(result);
                }
                Err(e) => error!("upload task did not finish: {e}"),
            }
        }
        results
    }
}
