use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

type Task = BoxFuture<'static, ()>;

#[derive(Default)]
struct DispatchState {
    /// Regions with a task submitted to the pool.
    handling: HashSet<String>,
    /// Tasks waiting for their region's running task, oldest first.
    queued: HashMap<String, VecDeque<Task>>,
}

struct Inner {
    state: Mutex<DispatchState>,
    permits: Arc<Semaphore>,
    cancel: CancellationToken,
}

/// Runs transition handlers on a bounded pool with at most one handler per
/// region at a time, in submission order for each region. Handlers for
/// different regions run concurrently.
#[derive(Clone)]
pub struct TransitionDispatcher {
    inner: Arc<Inner>,
}

impl TransitionDispatcher {
    pub fn new(workers: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(DispatchState::default()),
                permits: Arc::new(Semaphore::new(workers.max(1))),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn submit<F>(&self, region: impl Into<String>, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        submit(&self.inner, region.into(), task.boxed());
    }

    /// Drop every queued task and stop starting new ones. Running handlers
    /// finish on their own.
    pub fn shutdown_now(&self) {
        self.inner.cancel.cancel();
        let dropped: usize = {
            let mut state = self.inner.state.lock();
            let dropped = state.queued.values().map(VecDeque::len).sum();
            state.queued.clear();
            dropped
        };
        tracing::info!(dropped, "transition dispatcher shut down");
    }

    pub fn is_idle(&self) -> bool {
        self.inner.state.lock().handling.is_empty()
    }

    pub fn queued(&self, region: &str) -> usize {
        self.inner
            .state
            .lock()
            .queued
            .get(region)
            .map_or(0, VecDeque::len)
    }
}

fn submit(inner: &Arc<Inner>, region: String, task: Task) {
    if inner.cancel.is_cancelled() {
        tracing::debug!(region = %region, "dispatcher shut down, dropping task");
        return;
    }
    {
        let mut state = inner.state.lock();
        if state.handling.contains(&region) {
            state.queued.entry(region).or_default().push_back(task);
            return;
        }
        state.handling.insert(region.clone());
    }
    spawn(Arc::clone(inner), region, task);
}

fn spawn(inner: Arc<Inner>, region: String, task: Task) {
    tokio::spawn(async move {
        // Runs on completion, cancellation or panic.
        let _completion = Completion {
            inner: Arc::clone(&inner),
            region,
        };
        let permit = tokio::select! {
            _ = inner.cancel.cancelled() => return,
            permit = Arc::clone(&inner.permits).acquire_owned() => permit,
        };
        let Ok(_permit) = permit else {
            return;
        };
        task.await;
    });
}

struct Completion {
    inner: Arc<Inner>,
    region: String,
}

impl Drop for Completion {
    fn drop(&mut self) {
        let mut state = self.inner.state.lock();
        let next = if self.inner.cancel.is_cancelled() {
            None
        } else {
            state
                .queued
                .get_mut(&self.region)
                .and_then(VecDeque::pop_front)
        };
        if state
            .queued
            .get(&self.region)
            .is_some_and(VecDeque::is_empty)
        {
            state.queued.remove(&self.region);
        }
        match next {
            // The region stays in `handling` across the hand-off so a task
            // submitted meanwhile queues behind this one.
            Some(task) => spawn(Arc::clone(&self.inner), self.region.clone(), task),
            None => {
                state.handling.remove(&self.region);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    async fn wait_idle(dispatcher: &TransitionDispatcher) {
        for _ in 0..200 {
            if dispatcher.is_idle() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dispatcher never became idle");
    }

    #[tokio::test]
    async fn same_region_runs_in_order_and_never_concurrently() {
        let dispatcher = TransitionDispatcher::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        for i in 0..10 {
            let order = Arc::clone(&order);
            let running = Arc::clone(&running);
            dispatcher.submit("r1", async move {
                assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                tokio::time::sleep(Duration::from_millis(2)).await;
                order.lock().push(i);
                running.fetch_sub(1, Ordering::SeqCst);
            });
        }

        wait_idle(&dispatcher).await;
        assert_eq!(*order.lock(), (0..10).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submissions_racing_a_finishing_handler_keep_their_order() {
        const SUBMITTERS: usize = 4;
        const PER_SUBMITTER: usize = 300;
        let dispatcher = TransitionDispatcher::new(4);
        let order = Arc::new(Mutex::new(Vec::new()));
        let running = Arc::new(AtomicUsize::new(0));

        let mut submitters = Vec::new();
        for submitter in 0..SUBMITTERS {
            let dispatcher = dispatcher.clone();
            let order = Arc::clone(&order);
            let running = Arc::clone(&running);
            submitters.push(tokio::spawn(async move {
                for seq in 0..PER_SUBMITTER {
                    let order = Arc::clone(&order);
                    let running = Arc::clone(&running);
                    dispatcher.submit("r1", async move {
                        assert_eq!(running.fetch_add(1, Ordering::SeqCst), 0);
                        order.lock().push((submitter, seq));
                        running.fetch_sub(1, Ordering::SeqCst);
                    });
                    tokio::task::yield_now().await;
                }
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }

        wait_idle(&dispatcher).await;
        let order = order.lock();
        assert_eq!(order.len(), SUBMITTERS * PER_SUBMITTER);
        for submitter in 0..SUBMITTERS {
            let seqs: Vec<usize> = order
                .iter()
                .filter(|(s, _)| *s == submitter)
                .map(|(_, seq)| *seq)
                .collect();
            assert_eq!(seqs, (0..PER_SUBMITTER).collect::<Vec<_>>());
        }
    }

    #[tokio::test]
    async fn different_regions_run_concurrently() {
        let dispatcher = TransitionDispatcher::new(4);
        let gate = Arc::new(tokio::sync::Barrier::new(2));
        let done = Arc::new(AtomicUsize::new(0));

        for region in ["r1", "r2"] {
            let gate = Arc::clone(&gate);
            let done = Arc::clone(&done);
            dispatcher.submit(region, async move {
                // Deadlocks unless both regions are being handled at once.
                gate.wait().await;
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        tokio::time::timeout(Duration::from_secs(2), wait_idle(&dispatcher))
            .await
            .unwrap();
        assert_eq!(done.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_task_releases_region() {
        let dispatcher = TransitionDispatcher::new(2);
        let ran = Arc::new(AtomicUsize::new(0));

        dispatcher.submit("r1", async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            panic!("handler failed");
        });
        {
            let ran = Arc::clone(&ran);
            dispatcher.submit("r1", async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(dispatcher.queued("r1"), 1);

        wait_idle(&dispatcher).await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.queued("r1"), 0);
    }

    #[tokio::test]
    async fn shutdown_drops_queued_tasks() {
        let dispatcher = TransitionDispatcher::new(1);
        let ran = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        dispatcher.submit("r1", async move {
            drop(release_rx.await);
        });
        for _ in 0..3 {
            let ran = Arc::clone(&ran);
            dispatcher.submit("r1", async move {
                ran.fetch_add(1, Ordering::SeqCst);
            });
        }

        dispatcher.shutdown_now();
        drop(release_tx.send(()));
        wait_idle(&dispatcher).await;
        assert_eq!(ran.load(Ordering::SeqCst), 0);

        dispatcher.submit("r2", async {});
        assert!(dispatcher.is_idle());
    }
}
