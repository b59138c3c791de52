use std::sync::Arc;

use anyhow::anyhow;
use tokio_util::sync::CancellationToken;

use crate::context::JudgeContext;
use crate::queue::{EvaluationJob, JobQueue};
use crate::solutions::{RunPlan, run_testcase};
use crate::verdict::Evaluation;

/// Pulls jobs until the queue is drained or the token is cancelled
///
/// Each job runs on the blocking pool. A job failing for infrastructure
/// reasons cancels the token so that the other workers stop too.
pub async fn worker(
    id: u32,
    ctx: Arc<JudgeContext>,
    plan: Arc<RunPlan>,
    queue: Arc<JobQueue>,
    token: CancellationToken,
) -> anyhow::Result<Vec<(EvaluationJob, Evaluation)>> {
    log::info!("Worker {id} started");
    let mut done = Vec::new();

    loop {
        if token.is_cancelled() {
            log::info!("Worker {id} received shutdown signal, stopping");
            break;
        }
        let Some(job) = queue.pop().await else {
            break;
        };
        log::debug!(
            "Worker {id} got solution {} on {}/{}",
            job.solution,
            job.group_name,
            job.index
        );

        let ctx_ref = Arc::clone(&ctx);
        let plan_ref = Arc::clone(&plan);
        let result_handle = tokio::task::spawn_blocking(move || {
            let evaluation = run_testcase(&ctx_ref, &plan_ref, &job);
            evaluation.map(|evaluation| (job, evaluation))
        });

        tokio::select! {
            _ = token.cancelled() => {
                log::info!("Worker {id} abandoning its running job after shutdown signal");
                break;
            }
            result = result_handle => match result {
                Ok(Ok(pair)) => done.push(pair),
                Ok(Err(e)) => {
                    log::error!("Worker {id} hit a fatal error: {e:#}");
                    token.cancel();
                    let discarded = queue.clear().await;
                    log::debug!("Discarded {discarded} queued jobs");
                    return Err(e);
                }
                Err(e) => {
                    token.cancel();
                    return Err(anyhow!("evaluation task on worker {id} failed: {e}"));
                }
            },
        }
    }

    log::info!("Worker {id} has shut down gracefully");
    Ok(done)
}
