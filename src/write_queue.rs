use crate::types::*;
use dashmap::DashMap;
use log::{debug, info};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

// The storage engine is a single sqlite file, so concurrent writers gain
// nothing and interleave badly. Instead every write is funneled through a
// per-user worker: one bounded channel and one task per active uid. Writes
// of the same user are strictly FIFO, writes of different users run in
// parallel, and a full channel surfaces backpressure instead of queueing
// without bound.

struct Job {
    run: Box<dyn FnOnce() + Send + 'static>,
}

#[derive(Clone)]
struct QueueHandle {
    sender: mpsc::Sender<Job>,
    /// Items accepted but not yet finished executing.
    pending: Arc<AtomicUsize>,
    last_activity: Arc<Mutex<Instant>>,
    worker: Arc<Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

pub struct WriteQueue {
    queues: DashMap<Uid, QueueHandle>,
    capacity: usize,
    timeout: Duration,
    idle_time: Duration,
    closed: AtomicBool,
}

impl WriteQueue {
    /// Create the queue registry and start the idle sweeper.
    pub fn new(capacity: usize, timeout: Duration, idle_time: Duration) -> Arc<WriteQueue> {
        let queue = Arc::new(WriteQueue {
            queues: DashMap::new(),
            capacity,
            timeout,
            idle_time,
            closed: AtomicBool::new(false),
        });
        let weak = Arc::downgrade(&queue);
        tokio::spawn(async move {
            // Reap idle queues at half the idle cutoff so a queue is gone
            // at most 1.5 * idle_time after its last write.
            loop {
                let Some(queue) = weak.upgrade() else { return };
                if queue.closed.load(Ordering::SeqCst) {
                    return;
                }
                let interval = queue.idle_time / 2;
                drop(queue);
                tokio::time::sleep(interval).await;
                let Some(queue) = weak.upgrade() else { return };
                queue.reap_idle();
            }
        });
        queue
    }

    /// Run `work` on the caller's per-user worker and wait for its result.
    ///
    /// Guarantees: at most one closure per uid executes at a time, in
    /// submission order. Returns `QueueFull` when the per-user channel is
    /// at capacity, `QueueTimeout` when the result does not arrive within
    /// the configured window (the closure, once started, still runs to
    /// completion because the storage engine is not cancellation-safe
    /// mid-write), and `Cancelled` when `cancel` fires first.
    pub async fn execute<T, F>(
        &self,
        uid: Uid,
        cancel: &CancellationToken,
        work: F,
    ) -> SyncResult<T>
    where
        F: FnOnce() -> SyncResult<T> + Send + 'static,
        T: Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SyncError::QueueClosed);
        }
        if cancel.is_cancelled() {
            return Err(SyncError::Cancelled);
        }

        let (result_tx, result_rx) = oneshot::channel();
        let job_cancel = cancel.clone();
        let mut job = Job {
            run: Box::new(move || {
                // Items whose connection died before their turn are not
                // worth running.
                if job_cancel.is_cancelled() {
                    let _ = result_tx.send(Err(SyncError::Cancelled));
                    return;
                }
                let _ = result_tx.send(work());
            }),
        };

        // Load-or-store the worker, then try-send. A handle can be stale
        // if the sweeper reaped the queue between lookup and send; in
        // that case the channel is closed and we retry with a fresh one.
        loop {
            let handle = self
                .queues
                .entry(uid)
                .or_insert_with(|| self.spawn_worker(uid))
                .value()
                .clone();
            // Count the item before it can possibly run, so the worker's
            // decrement never races the increment.
            handle.pending.fetch_add(1, Ordering::SeqCst);
            match handle.sender.try_send(job) {
                Ok(()) => {
                    *handle.last_activity.lock().unwrap() = Instant::now();
                    break;
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    handle.pending.fetch_sub(1, Ordering::SeqCst);
                    debug!("write queue full for uid {}", uid);
                    return Err(SyncError::QueueFull);
                }
                Err(mpsc::error::TrySendError::Closed(returned)) => {
                    handle.pending.fetch_sub(1, Ordering::SeqCst);
                    self.queues.remove_if(&uid, |_, h| h.sender.is_closed());
                    job = returned;
                }
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = tokio::time::timeout(self.timeout, result_rx) => match result {
                Ok(Ok(result)) => result,
                // The worker dropped the slot without answering; only
                // shutdown does that.
                Ok(Err(_)) => Err(SyncError::QueueClosed),
                Err(_) => Err(SyncError::QueueTimeout),
            },
        }
    }

    fn spawn_worker(&self, uid: Uid) -> QueueHandle {
        debug!("starting write queue worker for uid {}", uid);
        let (sender, mut receiver) = mpsc::channel::<Job>(self.capacity);
        let pending = Arc::new(AtomicUsize::new(0));
        let last_activity = Arc::new(Mutex::new(Instant::now()));
        let worker_pending = Arc::clone(&pending);
        let worker_activity = Arc::clone(&last_activity);
        let worker = tokio::spawn(async move {
            while let Some(job) = receiver.recv().await {
                (job.run)();
                worker_pending.fetch_sub(1, Ordering::SeqCst);
                *worker_activity.lock().unwrap() = Instant::now();
            }
            debug!("write queue worker for uid {} exiting", uid);
        });
        QueueHandle {
            sender,
            pending,
            last_activity,
            worker: Arc::new(Mutex::new(Some(worker))),
        }
    }

    /// Destroy queues that have been empty past the idle cutoff. The next
    /// `execute` for that uid lazily recreates one.
    fn reap_idle(&self) {
        let cutoff = self.idle_time;
        let mut reaped = 0;
        self.queues.retain(|uid, handle| {
            let idle = handle.last_activity.lock().unwrap().elapsed();
            let keep =
                handle.pending.load(Ordering::SeqCst) > 0 || idle < cutoff;
            if !keep {
                debug!("reaping idle write queue for uid {}", uid);
                reaped += 1;
            }
            keep
        });
        if reaped > 0 {
            debug!("reaped {} idle write queue(s)", reaped);
        }
    }

    /// Number of live per-user queues.
    pub fn queue_count(&self) -> usize {
        self.queues.len()
    }

    /// Stop accepting submissions, drain what is already queued until the
    /// deadline, then abort. Items that never ran see `QueueClosed`.
    pub async fn shutdown(&self, deadline: Duration) {
        self.closed.store(true, Ordering::SeqCst);
        info!("write queue shutting down, draining {} queue(s)", self.queues.len());

        let mut handles = vec![];
        for entry in self.queues.iter() {
            handles.push(entry.value().clone());
        }
        // Dropping every sender lets each worker drain its channel and
        // exit on its own.
        self.queues.clear();

        let drained = tokio::time::timeout(deadline, async {
            for handle in &handles {
                let worker = handle.worker.lock().unwrap().take();
                if let Some(worker) = worker {
                    let _ = worker.await;
                }
            }
        })
        .await;
        if drained.is_err() {
            for handle in &handles {
                let worker = handle.worker.lock().unwrap().take();
                if let Some(worker) = worker {
                    worker.abort();
                }
            }
            info!("write queue drain deadline hit, aborted remaining workers");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    fn queue(capacity: usize) -> Arc<WriteQueue> {
        WriteQueue::new(capacity, Duration::from_secs(5), Duration::from_secs(600))
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn same_user_writes_never_overlap() {
        let queue = queue(100);
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));
        let order = Arc::new(Mutex::new(vec![]));

        let mut tasks = vec![];
        for i in 0..20 {
            let queue = Arc::clone(&queue);
            let in_flight = Arc::clone(&in_flight);
            let overlapped = Arc::clone(&overlapped);
            let order = Arc::clone(&order);
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue
                    .execute(7, &cancel, move || {
                        if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        std::thread::sleep(Duration::from_millis(2));
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        order.lock().unwrap().push(i);
                        Ok(i)
                    })
                    .await
            }));
        }
        for task in tasks {
            assert!(task.await.unwrap().is_ok());
        }
        assert!(!overlapped.load(Ordering::SeqCst));
        assert_eq!(order.lock().unwrap().len(), 20);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn distinct_users_run_in_parallel() {
        let queue = queue(100);
        let start = Instant::now();
        let mut tasks = vec![];
        for uid in [1, 2] {
            let queue = Arc::clone(&queue);
            tasks.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue
                    .execute(uid, &cancel, || {
                        std::thread::sleep(Duration::from_millis(150));
                        Ok(())
                    })
                    .await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }
        // Serial execution would take 300ms.
        assert!(start.elapsed() < Duration::from_millis(280));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn full_queue_rejects_instead_of_dropping() {
        let capacity = 3;
        let queue = queue(capacity);
        let (block_tx, block_rx) = std::sync::mpsc::channel::<()>();

        // One job occupies the worker...
        let first = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue
                    .execute(7, &cancel, move || {
                        block_rx.recv().unwrap();
                        Ok(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ...then `capacity` more fill the channel...
        let mut queued = vec![];
        for _ in 0..capacity {
            let queue = Arc::clone(&queue);
            queued.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                queue.execute(7, &cancel, || Ok(())).await
            }));
        }
        tokio::time::sleep(Duration::from_millis(50)).await;

        // ...so the next submission must be told, not silently dropped.
        let cancel = CancellationToken::new();
        let overflow = queue.execute(7, &cancel, || Ok(())).await;
        assert!(matches!(overflow, Err(SyncError::QueueFull)));

        block_tx.send(()).unwrap();
        first.await.unwrap().unwrap();
        for task in queued {
            task.await.unwrap().unwrap();
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn idle_queue_is_reaped_and_recreated() {
        let queue = WriteQueue::new(100, Duration::from_secs(5), Duration::from_millis(100));
        let cancel = CancellationToken::new();
        queue.execute(7, &cancel, || Ok(())).await.unwrap();
        assert_eq!(queue.queue_count(), 1);

        // Sweeper runs every idle/2; give it a few rounds.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(queue.queue_count(), 0);

        // A fresh worker appears on the next submit.
        queue.execute(7, &cancel, || Ok(2)).await.unwrap();
        assert_eq!(queue.queue_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn timed_out_closure_still_completes() {
        let queue = WriteQueue::new(100, Duration::from_millis(50), Duration::from_secs(600));
        let effect = Arc::new(AtomicI64::new(0));
        let cancel = CancellationToken::new();
        let closure_effect = Arc::clone(&effect);
        let result = queue
            .execute(7, &cancel, move || {
                std::thread::sleep(Duration::from_millis(150));
                closure_effect.store(42, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(SyncError::QueueTimeout)));

        // The caller gave up but the write still landed.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(effect.load(Ordering::SeqCst), 42);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn cancelled_item_returns_promptly() {
        let queue = queue(100);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = queue.execute(7, &cancel, || Ok(())).await;
        assert!(matches!(result, Err(SyncError::Cancelled)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn shutdown_rejects_new_submissions() {
        let queue = queue(100);
        let cancel = CancellationToken::new();
        queue.execute(7, &cancel, || Ok(())).await.unwrap();
        queue.shutdown(Duration::from_millis(500)).await;
        let result = queue.execute(7, &cancel, || Ok(())).await;
        assert!(matches!(result, Err(SyncError::QueueClosed)));
    }
}
