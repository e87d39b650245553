use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;

use crate::bucket::TokenBucket;

/// One independent unit of work. The caller guarantees independence;
/// the executor never resolves dependencies itself.
pub struct BatchTask<T> {
    pub id: String,
    pub work: BoxFuture<'static, anyhow::Result<T>>,
}

impl<T> BatchTask<T> {
    pub fn new(
        id: impl Into<String>,
        work: impl std::future::Future<Output = anyhow::Result<T>> + Send + 'static,
    ) -> Self {
        Self {
            id: id.into(),
            work: work.boxed(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Succeeded,
    Failed,
}

#[derive(Debug)]
pub struct TaskReport<T> {
    pub id: String,
    pub status: TaskStatus,
    pub output: Option<T>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl<T> TaskReport<T> {
    pub fn succeeded(&self) -> bool {
        self.status == TaskStatus::Succeeded
    }
}

/// Runs a batch of independent tasks with bounded parallelism,
/// per-task failure isolation, and input-order-preserving results.
///
/// Retry policy deliberately lives with the caller: only it knows
/// whether a failure should trigger a fallback, a replan, or nothing.
#[derive(Clone)]
pub struct BatchExecutor {
    max_workers: usize,
    bucket: Option<Arc<TokenBucket>>,
}

impl BatchExecutor {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            bucket: None,
        }
    }

    /// Gate each task start on a shared token bucket.
    pub fn with_rate_limit(mut self, per_sec: f64, burst: f64) -> anyhow::Result<Self> {
        self.bucket = Some(Arc::new(TokenBucket::new(per_sec, burst)?));
        Ok(self)
    }

    pub fn with_bucket(mut self, bucket: Arc<TokenBucket>) -> Self {
        self.bucket = Some(bucket);
        self
    }

    /// Execute all tasks and return one report per task, in input order
    /// regardless of completion order. A task error (or panic) becomes
    /// a Failed report and never aborts its siblings.
    pub async fn execute_batch<T: Send + 'static>(
        &self,
        tasks: Vec<BatchTask<T>>,
    ) -> Vec<TaskReport<T>> {
        if tasks.is_empty() {
            return Vec::new();
        }

        // Single task or single worker: run in-line, no spawn overhead.
        if tasks.len() <= 1 || self.max_workers <= 1 {
            let mut reports = Vec::with_capacity(tasks.len());
            for task in tasks {
                if let Some(bucket) = self.bucket.as_ref() {
                    bucket.acquire().await;
                }
                reports.push(run_one(task).await);
            }
            return reports;
        }

        let worker_count = self.max_workers.min(tasks.len());
        let semaphore = Arc::new(Semaphore::new(worker_count));
        let task_count = tasks.len();
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();

        let mut join_set: JoinSet<(usize, TaskReport<T>)> = JoinSet::new();
        for (index, task) in tasks.into_iter().enumerate() {
            let semaphore = semaphore.clone();
            let bucket = self.bucket.clone();
            join_set.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return (
                            index,
                            failed_report(task.id, "worker pool closed".to_string(), 0),
                        )
                    }
                };
                if let Some(bucket) = bucket.as_ref() {
                    bucket.acquire().await;
                }
                (index, run_one(task).await)
            });
        }

        let mut slots: Vec<Option<TaskReport<T>>> = Vec::with_capacity(task_count);
        slots.resize_with(task_count, || None);
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, report)) => slots[index] = Some(report),
                Err(err) => tracing::error!("batch worker join error: {}", err),
            }
        }

        slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    failed_report(ids[index].clone(), "worker did not report".to_string(), 0)
                })
            })
            .collect()
    }
}

async fn run_one<T>(task: BatchTask<T>) -> TaskReport<T> {
    let id = task.id;
    let started = Instant::now();
    let outcome = std::panic::AssertUnwindSafe(task.work).catch_unwind().await;
    let duration_ms = started.elapsed().as_millis() as u64;
    match outcome {
        Ok(Ok(output)) => TaskReport {
            id,
            status: TaskStatus::Succeeded,
            output: Some(output),
            error: None,
            duration_ms,
        },
        Ok(Err(err)) => failed_report(id, format!("{:#}", err), duration_ms),
        Err(_) => failed_report(id, "task panicked".to_string(), duration_ms),
    }
}

fn failed_report<T>(id: String, error: String, duration_ms: u64) -> TaskReport<T> {
    TaskReport {
        id,
        status: TaskStatus::Failed,
        output: None,
        error: Some(error),
        duration_ms,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Mutex;

    #[tokio::test]
    async fn empty_batch_returns_empty_results() {
        let executor = BatchExecutor::new(4);
        let reports = executor.execute_batch::<u32>(Vec::new()).await;
        assert!(reports.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn results_preserve_input_order_despite_completion_order() {
        let executor = BatchExecutor::new(8);
        // Later tasks finish earlier on purpose.
        let tasks: Vec<BatchTask<usize>> = (0..8)
            .map(|i| {
                BatchTask::new(format!("t{}", i), async move {
                    tokio::time::sleep(Duration::from_millis((8 - i as u64) * 20)).await;
                    Ok(i)
                })
            })
            .collect();

        let reports = executor.execute_batch(tasks).await;
        assert_eq!(reports.len(), 8);
        for (i, report) in reports.iter().enumerate() {
            assert_eq!(report.id, format!("t{}", i));
            assert_eq!(report.output, Some(i));
        }
    }

    #[tokio::test]
    async fn one_failure_does_not_abort_siblings() {
        let executor = BatchExecutor::new(4);
        let tasks: Vec<BatchTask<u32>> = (0u32..5)
            .map(|i| {
                BatchTask::new(format!("t{}", i), async move {
                    if i == 2 {
                        anyhow::bail!("relaxation diverged");
                    }
                    Ok(i * 10)
                })
            })
            .collect();

        let reports = executor.execute_batch(tasks).await;
        assert_eq!(reports.len(), 5);
        assert_eq!(reports[2].status, TaskStatus::Failed);
        assert!(reports[2].error.as_deref().unwrap().contains("diverged"));
        for i in [0usize, 1, 3, 4] {
            assert_eq!(reports[i].status, TaskStatus::Succeeded);
            assert_eq!(reports[i].output, Some(i as u32 * 10));
        }
    }

    #[tokio::test]
    async fn panicking_task_is_isolated() {
        let executor = BatchExecutor::new(2);
        let tasks = vec![
            BatchTask::new("ok", async { Ok(1u32) }),
            BatchTask::new("boom", async { panic!("unreachable input") }),
        ];
        let reports = executor.execute_batch(tasks).await;
        assert_eq!(reports[0].status, TaskStatus::Succeeded);
        assert_eq!(reports[1].status, TaskStatus::Failed);
        assert!(reports[1].error.as_deref().unwrap().contains("panicked"));
    }

    #[tokio::test]
    async fn single_worker_runs_tasks_in_input_order() {
        let executor = BatchExecutor::new(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let tasks: Vec<BatchTask<()>> = (0..4)
            .map(|i| {
                let order = order.clone();
                BatchTask::new(format!("t{}", i), async move {
                    order.lock().await.push(i);
                    Ok(())
                })
            })
            .collect();

        executor.execute_batch(tasks).await;
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn parallelism_is_bounded_by_max_workers() {
        let executor = BatchExecutor::new(2);
        let running = Arc::new(AtomicUsize::new(0));
        let high_water = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<BatchTask<()>> = (0..6)
            .map(|i| {
                let running = running.clone();
                let high_water = high_water.clone();
                BatchTask::new(format!("t{}", i), async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    high_water.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                })
            })
            .collect();

        executor.execute_batch(tasks).await;
        let peak = high_water.load(Ordering::SeqCst);
        assert!(peak <= 2, "peak parallelism {} exceeded bound", peak);
        assert_eq!(peak, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_spaces_out_task_starts() {
        let executor = BatchExecutor::new(4)
            .with_rate_limit(2.0, 1.0)
            .expect("rate limit");
        let tasks: Vec<BatchTask<()>> = (0..5)
            .map(|i| BatchTask::new(format!("t{}", i), async { Ok(()) }))
            .collect();

        let started = Instant::now();
        let reports = executor.execute_batch(tasks).await;
        assert_eq!(reports.len(), 5);
        assert!(reports.iter().all(|r| r.succeeded()));
        // One token up front, then four admitted at 2/s.
        assert!(started.elapsed() >= Duration::from_millis(1900));
    }
}
