//! Fixed-size pool of tokio tasks draining one shared job queue.

use crate::error::WosError;
use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::debug;

/// Runs jobs on at most `size` concurrent workers.
///
/// A pool lives for one transfer. Once any job fails the stop flag is raised
/// and idle workers stop taking jobs from the queue.
#[derive(Debug)]
pub struct WorkerPool {
    size: usize,
    stop: Arc<AtomicBool>,
}

type Outcomes<T, R> = mpsc::UnboundedReceiver<(T, Result<R, WosError>)>;

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        Self {
            size: size.max(1),
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn stop_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.stop)
    }

    pub fn stop(&self) {
        self.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    /// Runs `work` over `jobs` and returns every job that was started along
    /// with its outcome. After the first failure no new job starts, but jobs
    /// already running finish.
    pub async fn run<T, R, F, Fut>(
        &self,
        jobs: Vec<T>,
        work: F,
    ) -> Result<Vec<(T, Result<R, WosError>)>, WosError>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WosError>> + Send + 'static,
    {
        let (mut workers, mut outcomes) = self.spawn(jobs, work);
        while let Some(joined) = workers.join_next().await {
            joined?;
        }

        let mut results = Vec::new();
        while let Some(outcome) = outcomes.recv().await {
            results.push(outcome);
        }
        Ok(results)
    }

    /// Runs `work` over `jobs`, bailing out on the first failure.
    ///
    /// On failure the remaining workers are aborted, in-flight jobs included,
    /// and the error is returned. On success there is exactly one result per
    /// job, in completion order.
    pub async fn run_fail_fast<T, R, F, Fut>(
        &self,
        jobs: Vec<T>,
        work: F,
    ) -> Result<Vec<R>, WosError>
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WosError>> + Send + 'static,
    {
        let expected = jobs.len();
        let (mut workers, mut outcomes) = self.spawn(jobs, work);

        let mut results = Vec::with_capacity(expected);
        while let Some((_, outcome)) = outcomes.recv().await {
            match outcome {
                Ok(result) => results.push(result),
                Err(e) => {
                    self.stop();
                    workers.abort_all();
                    return Err(e);
                }
            }
        }
        while let Some(joined) = workers.join_next().await {
            joined?;
        }

        if results.len() != expected {
            return Err(WosError::UnexpectedResponse(format!(
                "expected {} results, got {}",
                expected,
                results.len()
            )));
        }
        Ok(results)
    }

    fn spawn<T, R, F, Fut>(&self, jobs: Vec<T>, work: F) -> (JoinSet<()>, Outcomes<T, R>)
    where
        T: Clone + Send + 'static,
        R: Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, WosError>> + Send + 'static,
    {
        let worker_count = self.size.min(jobs.len());
        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let work = Arc::new(work);
        let (tx, rx) = mpsc::unbounded_channel();
        let mut workers = JoinSet::new();

        for worker in 0..worker_count {
            let queue = Arc::clone(&queue);
            let work = Arc::clone(&work);
            let stop = Arc::clone(&self.stop);
            let tx = tx.clone();
            workers.spawn(async move {
                loop {
                    if stop.load(Ordering::Acquire) {
                        debug!("Worker {} stopping early", worker);
                        break;
                    }
                    let Some(job) = queue.lock().await.pop_front() else {
                        break;
                    };
                    let outcome = work(job.clone()).await;
                    if outcome.is_err() {
                        stop.store(true, Ordering::Release);
                    }
                    if tx.send((job, outcome)).is_err() {
                        break;
                    }
                }
            });
        }
        (workers, rx)
    }
}
