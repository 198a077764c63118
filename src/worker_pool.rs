//! Fixed-size worker pool
//!
//! `N` long-lived workers pull connection tasks from one shared FIFO queue
//! and run each to completion. Shutdown stops the workers from taking new
//! tasks: tasks already taken finish, tasks still queued never start.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error};

type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("worker pool is shut down")]
    ShutDown,
}

pub struct WorkerPool {
    sender: mpsc::UnboundedSender<Task>,
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    /// Spawn `size` workers (at least one)
    pub fn start(size: usize) -> Self {
        let size = size.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let (shutdown, _) = watch::channel(false);

        let workers = (0..size)
            .map(|worker_id| {
                let receiver = Arc::clone(&receiver);
                let stop = shutdown.subscribe();
                tokio::spawn(worker_loop(worker_id, receiver, stop))
            })
            .collect();

        debug!(workers = size, "Worker pool started");

        Self {
            sender,
            shutdown,
            workers,
        }
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queue a task; wakes one idle worker
    pub fn submit<F>(&self, task: F) -> Result<(), PoolError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if *self.shutdown.borrow() {
            return Err(PoolError::ShutDown);
        }
        self.sender
            .send(Box::pin(task))
            .map_err(|_| PoolError::ShutDown)
    }

    /// Stop handing out queued tasks; in-flight tasks keep running
    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    /// Stop and wait for every worker to finish its current task
    pub async fn shutdown(self) {
        self.stop();
        let WorkerPool {
            sender, workers, ..
        } = self;
        drop(sender);

        for (worker_id, worker) in workers.into_iter().enumerate() {
            if let Err(e) = worker.await {
                error!(worker_id, error = %e, "Worker exited abnormally");
            }
        }
        debug!("Worker pool shut down");
    }
}

async fn worker_loop(
    worker_id: usize,
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let task = {
            let mut queue = receiver.lock().await;
            tokio::select! {
                biased;
                _ = stop.wait_for(|stopped| *stopped) => break,
                task = queue.recv() => match task {
                    Some(task) => task,
                    None => break,
                },
            }
        };

        // A panicking task must not take the worker down with it
        if let Err(e) = tokio::spawn(task).await {
            error!(worker_id, error = %e, "Worker task panicked");
        }
    }
    debug!(worker_id, "Worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::oneshot;

    #[tokio::test]
    async fn test_each_task_runs_once() {
        let pool = WorkerPool::start(4);
        assert_eq!(pool.size(), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();

        for id in 0..50 {
            let tx = tx.clone();
            pool.submit(async move {
                tx.send(id).unwrap();
            })
            .unwrap();
        }
        drop(tx);

        let mut seen = Vec::new();
        while let Some(id) = rx.recv().await {
            seen.push(id);
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..50).collect::<Vec<_>>());

        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_finishes_in_flight_and_skips_queued() {
        let pool = WorkerPool::start(1);
        let finished = Arc::new(AtomicBool::new(false));
        let queued_runs = Arc::new(AtomicUsize::new(0));
        let (started_tx, started_rx) = oneshot::channel();
        let (gate_tx, gate_rx) = oneshot::channel::<()>();

        let done = finished.clone();
        pool.submit(async move {
            started_tx.send(()).unwrap();
            let _ = gate_rx.await;
            done.store(true, Ordering::SeqCst);
        })
        .unwrap();
        started_rx.await.unwrap();

        for _ in 0..5 {
            let runs = queued_runs.clone();
            pool.submit(async move {
                runs.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let shutdown = tokio::spawn(pool.shutdown());
        tokio::time::sleep(Duration::from_millis(50)).await;
        gate_tx.send(()).unwrap();
        shutdown.await.unwrap();

        assert!(finished.load(Ordering::SeqCst));
        assert_eq!(queued_runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_submit_after_stop_is_rejected() {
        let pool = WorkerPool::start(2);
        pool.stop();
        assert_eq!(pool.submit(async {}), Err(PoolError::ShutDown));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_panicking_task_keeps_worker_alive() {
        let pool = WorkerPool::start(1);
        pool.submit(async { panic!("task failure") }).unwrap();

        let (tx, rx) = oneshot::channel();
        pool.submit(async move {
            tx.send(42).unwrap();
        })
        .unwrap();
        assert_eq!(rx.await.unwrap(), 42);

        pool.shutdown().await;
    }
}
