//! Fixed-size worker pool with a priority queue and per-task timeouts.
//!
//! Tasks carry plain JSON payloads; a [`TaskHandler`] turns a payload into a
//! JSON result on a worker thread. Each submitted task is delivered to at most
//! one worker and its outcome to the caller at most once.

use crate::error::DispatchError;
use crate::rule_executor::panic_message;
use futures::channel::oneshot;
use futures::future::{BoxFuture, Either};
use futures::{FutureExt as _, StreamExt as _};
use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{self, AtomicBool, AtomicU64, AtomicUsize};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerTask {
    pub id: u64,
    #[serde(rename = "type")]
    pub task_type: String,
    pub data: Value,
    pub priority: i32,
}

pub trait TaskHandler: Send + Sync {
    fn handle(&self, task: &WorkerTask) -> anyhow::Result<Value>;
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub max_workers: usize,
    pub task_timeout: Duration,
    pub shutdown_timeout: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            max_workers: cpu_count(),
            task_timeout: Duration::from_secs(30),
            shutdown_timeout: Duration::from_secs(5),
        }
    }
}

pub fn cpu_count() -> usize {
    std::thread::available_parallelism().map_or(1, |count| count.get())
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatcherStats {
    pub workers: usize,
    pub queued: usize,
    pub in_flight: usize,
    pub completed: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub replaced: u64,
}

type TaskResult = Result<Value, DispatchError>;

struct QueuedTask {
    task: WorkerTask,
    seq: u64,
    started: oneshot::Sender<usize>,
    reply: oneshot::Sender<TaskResult>,
}

// Highest priority first; FIFO among equal priorities.
impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        self.task
            .priority
            .cmp(&other.task.priority)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.seq == other.seq
    }
}

impl Eq for QueuedTask {}

struct InFlight {
    worker_id: usize,
    reply: oneshot::Sender<TaskResult>,
}

struct Worker {
    thread: JoinHandle<()>,
    retired: Arc<AtomicBool>,
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<QueuedTask>,
    shutting_down: bool,
}

#[derive(Default)]
struct Counters {
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    replaced: AtomicU64,
}

struct Shared {
    handler: Arc<dyn TaskHandler>,
    target_size: usize,
    queue: Mutex<QueueState>,
    available: Condvar,
    in_flight: Mutex<HashMap<u64, InFlight>>,
    workers: Mutex<HashMap<usize, Worker>>,
    next_worker_id: AtomicUsize,
    next_task_id: AtomicU64,
    next_seq: AtomicU64,
    counters: Counters,
}

impl Shared {
    fn spawn_worker(self: &Arc<Self>) {
        let worker_id = self.next_worker_id.fetch_add(1, atomic::Ordering::SeqCst);
        let retired = Arc::new(AtomicBool::new(false));
        let mut workers = self.workers.lock();
        let shared = self.clone();
        let worker_retired = retired.clone();
        match std::thread::Builder::new()
            .name(format!("vault-lint-worker-{worker_id}"))
            .spawn(move || shared.worker_loop(worker_id, worker_retired))
        {
            Ok(thread) => {
                workers.insert(worker_id, Worker { thread, retired });
            }
            Err(error) => log::error!("Failed to spawn worker {worker_id}: {error}"),
        }
    }

    fn next_task(&self, retired: &AtomicBool) -> Option<QueuedTask> {
        let mut queue = self.queue.lock();
        loop {
            if retired.load(atomic::Ordering::SeqCst) {
                return None;
            }
            if let Some(task) = queue.heap.pop() {
                return Some(task);
            }
            if queue.shutting_down {
                return None;
            }
            self.available.wait(&mut queue);
        }
    }

    fn worker_loop(self: Arc<Self>, worker_id: usize, retired: Arc<AtomicBool>) {
        while let Some(queued) = self.next_task(&retired) {
            let QueuedTask {
                task,
                started,
                reply,
                ..
            } = queued;

            self.in_flight
                .lock()
                .insert(task.id, InFlight { worker_id, reply });
            if started.send(worker_id).is_err() {
                self.in_flight.lock().remove(&task.id);
                continue;
            }

            let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.handler.handle(&task)));
            let panicked = outcome.is_err();
            let result = match outcome {
                Ok(Ok(value)) => {
                    self.counters.completed.fetch_add(1, atomic::Ordering::SeqCst);
                    Ok(value)
                }
                Ok(Err(error)) => {
                    self.counters.failed.fetch_add(1, atomic::Ordering::SeqCst);
                    Err(DispatchError::TaskFailed {
                        task_id: task.id,
                        message: format!("{error:#}"),
                    })
                }
                Err(payload) => {
                    self.counters.failed.fetch_add(1, atomic::Ordering::SeqCst);
                    Err(DispatchError::TaskFailed {
                        task_id: task.id,
                        message: format!("worker panicked: {}", panic_message(payload.as_ref())),
                    })
                }
            };

            match self.in_flight.lock().remove(&task.id) {
                Some(in_flight) => {
                    in_flight.reply.send(result).ok();
                }
                None => log::debug!("Discarding late result of task {}", task.id),
            }

            if panicked {
                log::warn!("Worker {worker_id} panicked on task {}, replacing it", task.id);
                self.retire_worker(worker_id);
                return;
            }
        }
    }

    /// Remove a worker from the pool and top the pool back up.
    fn retire_worker(self: &Arc<Self>, worker_id: usize) {
        if let Some(worker) = self.workers.lock().remove(&worker_id) {
            worker.retired.store(true, atomic::Ordering::SeqCst);
        }
        if self.queue.lock().shutting_down {
            return;
        }
        if self.workers.lock().len() < self.target_size {
            self.counters.replaced.fetch_add(1, atomic::Ordering::SeqCst);
            self.spawn_worker();
        }
    }

    /// Claim the reply slot of a timed-out task. False when the worker
    /// already took it, in which case a result is on its way.
    fn expire(self: &Arc<Self>, task_id: u64, worker_id: usize) -> bool {
        if self.in_flight.lock().remove(&task_id).is_none() {
            return false;
        }
        self.counters.timed_out.fetch_add(1, atomic::Ordering::SeqCst);
        log::warn!("Task {task_id} timed out on worker {worker_id}, retiring the worker");
        self.retire_worker(worker_id);
        true
    }
}

pub struct TaskDispatcher {
    config: DispatcherConfig,
    shared: Arc<Shared>,
}

impl TaskDispatcher {
    pub fn new(config: DispatcherConfig, handler: Arc<dyn TaskHandler>) -> Self {
        let target_size = cpu_count().min(config.max_workers).max(1);
        let shared = Arc::new(Shared {
            handler,
            target_size,
            queue: Mutex::new(QueueState::default()),
            available: Condvar::new(),
            in_flight: Mutex::new(HashMap::new()),
            workers: Mutex::new(HashMap::new()),
            next_worker_id: AtomicUsize::new(0),
            next_task_id: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            counters: Counters::default(),
        });
        for _ in 0..target_size {
            shared.spawn_worker();
        }
        log::debug!("Task dispatcher started with {target_size} worker(s)");
        Self { config, shared }
    }

    pub fn pool_size(&self) -> usize {
        self.shared.workers.lock().len()
    }

    pub fn target_size(&self) -> usize {
        self.shared.target_size
    }

    pub fn is_shut_down(&self) -> bool {
        self.shared.queue.lock().shutting_down
    }

    /// Queue a task. The returned future resolves with the handler's result,
    /// or fails once the task has run longer than the task timeout. Time spent
    /// waiting in the queue does not count against the timeout.
    pub fn submit(
        &self,
        task_type: impl Into<String>,
        data: Value,
        priority: i32,
    ) -> BoxFuture<'static, TaskResult> {
        let task_id = self.shared.next_task_id.fetch_add(1, atomic::Ordering::SeqCst);
        let task = WorkerTask {
            id: task_id,
            task_type: task_type.into(),
            data,
            priority,
        };
        let (started_tx, started_rx) = oneshot::channel();
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut queue = self.shared.queue.lock();
            if queue.shutting_down {
                return futures::future::ready(Err(DispatchError::ShutDown)).boxed();
            }
            queue.heap.push(QueuedTask {
                task,
                seq: self.shared.next_seq.fetch_add(1, atomic::Ordering::SeqCst),
                started: started_tx,
                reply: reply_tx,
            });
        }
        self.shared.available.notify_one();

        let shared = self.shared.clone();
        let timeout = self.config.task_timeout;
        async move {
            let worker_id = match started_rx.await {
                Ok(worker_id) => worker_id,
                Err(_) => {
                    return reply_rx
                        .await
                        .unwrap_or(Err(DispatchError::Cancelled { task_id }));
                }
            };

            match futures::future::select(reply_rx, smol::Timer::after(timeout)).await {
                Either::Left((reply, _)) => {
                    reply.unwrap_or(Err(DispatchError::Cancelled { task_id }))
                }
                Either::Right((_, reply_rx)) => {
                    if shared.expire(task_id, worker_id) {
                        Err(DispatchError::Timeout {
                            task_id,
                            timeout_ms: timeout.as_millis() as u64,
                        })
                    } else {
                        reply_rx
                            .await
                            .unwrap_or(Err(DispatchError::Cancelled { task_id }))
                    }
                }
            }
        }
        .boxed()
    }

    pub fn stats(&self) -> DispatcherStats {
        let counters = &self.shared.counters;
        DispatcherStats {
            workers: self.pool_size(),
            queued: self.shared.queue.lock().heap.len(),
            in_flight: self.shared.in_flight.lock().len(),
            completed: counters.completed.load(atomic::Ordering::SeqCst),
            failed: counters.failed.load(atomic::Ordering::SeqCst),
            timed_out: counters.timed_out.load(atomic::Ordering::SeqCst),
            replaced: counters.replaced.load(atomic::Ordering::SeqCst),
        }
    }

    pub fn shutdown(&self) {
        self.shutdown_within(self.config.shutdown_timeout);
    }

    /// Stop accepting work, cancel queued tasks, give in-flight tasks until
    /// `timeout` to finish, then cancel whatever is still running. Safe to
    /// call more than once.
    pub fn shutdown_within(&self, timeout: Duration) {
        let cancelled: Vec<QueuedTask> = {
            let mut queue = self.shared.queue.lock();
            if queue.shutting_down {
                return;
            }
            queue.shutting_down = true;
            queue.heap.drain().collect()
        };
        self.shared.available.notify_all();
        for queued in cancelled {
            let task_id = queued.task.id;
            queued.reply.send(Err(DispatchError::Cancelled { task_id })).ok();
        }

        let deadline = Instant::now() + timeout;
        let workers: Vec<(usize, Worker)> = self.shared.workers.lock().drain().collect();
        let mut abandoned = 0;
        for (worker_id, worker) in workers {
            while !worker.thread.is_finished() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if worker.thread.is_finished() {
                if worker.thread.join().is_err() {
                    log::warn!("Worker {worker_id} exited abnormally");
                }
            } else {
                worker.retired.store(true, atomic::Ordering::SeqCst);
                abandoned += 1;
            }
        }

        let remaining: Vec<(u64, InFlight)> = self.shared.in_flight.lock().drain().collect();
        for (task_id, in_flight) in remaining {
            in_flight
                .reply
                .send(Err(DispatchError::Cancelled { task_id }))
                .ok();
        }
        if abandoned > 0 {
            log::warn!("Abandoned {abandoned} worker(s) still busy at shutdown");
        }
        log::debug!("Task dispatcher shut down");
    }
}

impl Drop for TaskDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Run futures with at most `limit` in flight, without the queue machinery.
/// Results come back in completion order.
pub async fn run_bounded<I, F, T>(tasks: I, limit: usize) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    futures::stream::iter(tasks)
        .buffer_unordered(limit.max(1))
        .collect()
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use crossbeam::channel::{Receiver, Sender, unbounded};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    struct TestHandler {
        seen: Mutex<Vec<i64>>,
        gate: Receiver<()>,
    }

    impl TaskHandler for TestHandler {
        fn handle(&self, task: &WorkerTask) -> anyhow::Result<Value> {
            match task.task_type.as_str() {
                "echo" => {
                    if let Some(n) = task.data.as_i64() {
                        self.seen.lock().push(n);
                    }
                    Ok(task.data.clone())
                }
                "block" => {
                    self.gate.recv_timeout(Duration::from_secs(10)).ok();
                    Ok(json!("unblocked"))
                }
                "fail" => Err(anyhow!("handler refused")),
                "panic" => panic!("handler crashed"),
                other => Err(anyhow!("unknown task type {other}")),
            }
        }
    }

    fn dispatcher(timeout: Duration) -> (TaskDispatcher, Arc<TestHandler>, Sender<()>) {
        let (gate_tx, gate_rx) = unbounded();
        let handler = Arc::new(TestHandler {
            seen: Mutex::new(Vec::new()),
            gate: gate_rx,
        });
        let dispatcher = TaskDispatcher::new(
            DispatcherConfig {
                max_workers: 1,
                task_timeout: timeout,
                shutdown_timeout: Duration::from_secs(2),
            },
            handler.clone(),
        );
        (dispatcher, handler, gate_tx)
    }

    fn wait_until(condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_results_and_failures() {
        let (dispatcher, _, _gate) = dispatcher(Duration::from_secs(5));
        assert_eq!(dispatcher.pool_size(), 1);
        assert_eq!(smol::block_on(dispatcher.submit("echo", json!(7), 0)), Ok(json!(7)));
        assert!(matches!(
            smol::block_on(dispatcher.submit("fail", json!(null), 0)),
            Err(DispatchError::TaskFailed { .. })
        ));
        assert_eq!(dispatcher.stats().completed, 1);
        assert_eq!(dispatcher.stats().failed, 1);
    }

    #[test]
    fn test_queue_drains_by_priority() {
        let (dispatcher, handler, gate) = dispatcher(Duration::from_secs(5));
        let blocker = dispatcher.submit("block", json!(null), 0);
        wait_until(|| dispatcher.stats().in_flight == 1);

        let low = dispatcher.submit("echo", json!(1), 1);
        let high = dispatcher.submit("echo", json!(10), 10);
        let mid = dispatcher.submit("echo", json!(5), 5);
        let mid_again = dispatcher.submit("echo", json!(6), 5);
        gate.send(()).unwrap();

        smol::block_on(async {
            assert_eq!(blocker.await, Ok(json!("unblocked")));
            for future in [low, high, mid, mid_again] {
                assert!(future.await.is_ok());
            }
        });
        assert_eq!(*handler.seen.lock(), vec![10, 5, 6, 1]);
    }

    #[test]
    fn test_timeout_keeps_pool_usable() {
        let (dispatcher, _, gate) = dispatcher(Duration::from_millis(50));
        let result = smol::block_on(dispatcher.submit("block", json!(null), 0));
        assert!(matches!(result, Err(DispatchError::Timeout { timeout_ms: 50, .. })));

        assert_eq!(smol::block_on(dispatcher.submit("echo", json!(3), 0)), Ok(json!(3)));
        assert_eq!(dispatcher.stats().timed_out, 1);
        assert_eq!(dispatcher.pool_size(), 1);
        gate.send(()).unwrap();
    }

    #[test]
    fn test_panicking_worker_is_replaced() {
        let (dispatcher, _, _gate) = dispatcher(Duration::from_secs(5));
        let result = smol::block_on(dispatcher.submit("panic", json!(null), 0));
        match result {
            Err(DispatchError::TaskFailed { message, .. }) => {
                assert!(message.contains("handler crashed"))
            }
            other => panic!("unexpected result {other:?}"),
        }
        assert_eq!(smol::block_on(dispatcher.submit("echo", json!(1), 0)), Ok(json!(1)));
        assert_eq!(dispatcher.stats().replaced, 1);
    }

    #[test]
    fn test_shutdown_cancels_and_is_idempotent() {
        let (dispatcher, _, gate) = dispatcher(Duration::from_secs(30));
        let running = dispatcher.submit("block", json!(null), 0);
        wait_until(|| dispatcher.stats().in_flight == 1);
        let queued = dispatcher.submit("echo", json!(1), 0);

        dispatcher.shutdown_within(Duration::from_millis(20));
        dispatcher.shutdown_within(Duration::from_millis(20));
        assert!(dispatcher.is_shut_down());

        smol::block_on(async {
            assert!(matches!(queued.await, Err(DispatchError::Cancelled { .. })));
            assert!(matches!(running.await, Err(DispatchError::Cancelled { .. })));
        });
        assert_eq!(
            smol::block_on(dispatcher.submit("echo", json!(2), 0)),
            Err(DispatchError::ShutDown)
        );
        gate.send(()).unwrap();
    }

    #[test]
    fn test_run_bounded() {
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let tasks = (0..12).map(|index| {
            let active = active.clone();
            let peak = peak.clone();
            async move {
                let now = active.fetch_add(1, atomic::Ordering::SeqCst) + 1;
                peak.fetch_max(now, atomic::Ordering::SeqCst);
                smol::Timer::after(Duration::from_millis(2)).await;
                active.fetch_sub(1, atomic::Ordering::SeqCst);
                index
            }
        });
        let mut results = smol::block_on(run_bounded(tasks, 3));
        results.sort();
        assert_eq!(results, (0..12).collect::<Vec<_>>());
        assert!(peak.load(atomic::Ordering::SeqCst) <= 3);
    }
}
