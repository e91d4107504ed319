//! Groups storage writes that arrive close together into one dispatch wave.
//!
//! A wave is released when `batch_max_size` operations are waiting or when
//! `window` has passed since the first of them arrived, whichever comes first.
//! Operations are not merged: each still runs on its own, goes through the
//! [`DbThrottle`](super::DbThrottle) for its database calls and reports its
//! own result to its own caller. Operations enqueued under the same ordering
//! key run one after another in enqueue order, across waves.

use std::{
    any::Any,
    collections::HashMap,
    fmt,
    future::Future,
    panic::AssertUnwindSafe,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use futures::future::{BoxFuture, FutureExt};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{PipelineError, Result};
use crate::{log_debug, log_error, log_warn};

const ENABLE_LOGS: bool = true;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    AppendInteraction,
    StatusUpdate,
    ScreenshotRecord,
    Read,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperationKind::AppendInteraction => "append_interaction",
            OperationKind::StatusUpdate => "status_update",
            OperationKind::ScreenshotRecord => "screenshot_record",
            OperationKind::Read => "read",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy)]
enum FlushReason {
    Full,
    Window,
    Manual,
}

struct QueuedOp {
    kind: OperationKind,
    run: BoxFuture<'static, ()>,
}

#[derive(Default)]
struct BatchState {
    pending: Vec<QueuedOp>,
    timer: Option<(u64, CancellationToken)>,
    generation: u64,
    /// Completion signal of the latest operation per ordering key.
    tails: HashMap<String, (u64, oneshot::Receiver<()>)>,
    next_ticket: u64,
}

struct BatcherInner {
    state: Mutex<BatchState>,
    max_batch_size: usize,
    window: Duration,
}

#[derive(Clone)]
pub struct OperationBatcher {
    inner: Arc<BatcherInner>,
}

impl OperationBatcher {
    pub fn new(max_batch_size: usize, window: Duration) -> Self {
        Self {
            inner: Arc::new(BatcherInner {
                state: Mutex::new(BatchState::default()),
                max_batch_size: max_batch_size.max(1),
                window,
            }),
        }
    }

    /// Queue `operation` for the current wave.
    ///
    /// The operation is registered immediately; the returned future resolves
    /// with its own result once its wave has been released and it finished.
    pub fn enqueue<F, Fut, T>(
        &self,
        kind: OperationKind,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(kind, None, operation)
    }

    /// Like [`enqueue`](Self::enqueue), but the operation does not start
    /// before every earlier operation queued under `key` has finished.
    pub fn enqueue_ordered<F, Fut, T>(
        &self,
        kind: OperationKind,
        key: impl Into<String>,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        self.submit(kind, Some(key.into()), operation)
    }

    fn submit<F, Fut, T>(
        &self,
        kind: OperationKind,
        key: Option<String>,
        operation: F,
    ) -> impl Future<Output = Result<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let run = async move {
            let result = match AssertUnwindSafe(async move { operation().await })
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => {
                    let message = panic_message(panic.as_ref());
                    log_error!("batched {kind} operation panicked: {message}");
                    Err(PipelineError::OperationPanicked {
                        kind: kind.to_string(),
                        message,
                    })
                }
            };
            if reply_tx.send(result).is_err() {
                log_warn!("batched {kind} caller dropped before receiving result");
            }
        }
        .boxed();

        self.push(kind, key, run);

        async move { reply_rx.await.map_err(|_| PipelineError::Shutdown)? }
    }

    /// Release whatever is waiting without waiting for the window.
    pub fn flush(&self) {
        let batch = {
            let mut state = self.inner.lock();
            if let Some((_, token)) = state.timer.take() {
                token.cancel();
            }
            std::mem::take(&mut state.pending)
        };
        dispatch(batch, FlushReason::Manual);
    }

    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    fn push(&self, kind: OperationKind, key: Option<String>, run: BoxFuture<'static, ()>) {
        let full_batch = {
            let mut state = self.inner.lock();
            let run = match key {
                Some(key) => self.chain_behind_key(&mut state, key, run),
                None => run,
            };
            state.pending.push(QueuedOp { kind, run });

            if state.pending.len() >= self.inner.max_batch_size {
                if let Some((_, token)) = state.timer.take() {
                    token.cancel();
                }
                Some(std::mem::take(&mut state.pending))
            } else {
                if state.timer.is_none() {
                    state.generation += 1;
                    let generation = state.generation;
                    let token = CancellationToken::new();
                    state.timer = Some((generation, token.clone()));
                    self.spawn_window_timer(generation, token);
                }
                None
            }
        };

        if let Some(batch) = full_batch {
            dispatch(batch, FlushReason::Full);
        }
    }

    /// Make `run` wait for the previous operation under `key`. Called with
    /// the state lock held so the chain follows enqueue order.
    fn chain_behind_key(
        &self,
        state: &mut BatchState,
        key: String,
        run: BoxFuture<'static, ()>,
    ) -> BoxFuture<'static, ()> {
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        let (done_tx, done_rx) = oneshot::channel();
        let previous = state
            .tails
            .insert(key.clone(), (ticket, done_rx))
            .map(|(_, done)| done);

        let inner = Arc::clone(&self.inner);
        async move {
            if let Some(previous) = previous {
                // An error only means the predecessor's task went away.
                let _ = previous.await;
            }
            run.await;
            let _ = done_tx.send(());
            inner.release_tail(&key, ticket);
        }
        .boxed()
    }

    fn spawn_window_timer(&self, generation: u64, token: CancellationToken) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(inner.window) => {
                    let batch = {
                        let mut state = inner.lock();
                        let current = matches!(&state.timer, Some((g, _)) if *g == generation);
                        if current {
                            state.timer = None;
                            std::mem::take(&mut state.pending)
                        } else {
                            // A size-triggered flush already took this wave.
                            Vec::new()
                        }
                    };
                    dispatch(batch, FlushReason::Window);
                }
            }
        });
    }
}

impl BatcherInner {
    fn lock(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn release_tail(&self, key: &str, ticket: u64) {
        let mut state = self.lock();
        if matches!(state.tails.get(key), Some((current, _)) if *current == ticket) {
            state.tails.remove(key);
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

fn dispatch(batch: Vec<QueuedOp>, reason: FlushReason) {
    if batch.is_empty() {
        return;
    }

    let kinds: Vec<String> = batch.iter().map(|op| op.kind.to_string()).collect();
    log_debug!(
        "releasing batch of {} operations ({:?}): {}",
        batch.len(),
        reason,
        kinds.join(", ")
    );

    for op in batch {
        tokio::spawn(op.run);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use futures::future::join_all;
    use tokio::time::Instant;

    use super::*;

    const WINDOW: Duration = Duration::from_secs(2);

    fn timed_op(
        started: Instant,
        value: u32,
    ) -> impl FnOnce() -> BoxFuture<'static, Result<(u32, Duration)>> {
        move || async move { Ok((value, started.elapsed())) }.boxed()
    }

    #[tokio::test(start_paused = true)]
    async fn full_batch_flushes_without_waiting_for_window() {
        let batcher = OperationBatcher::new(5, WINDOW);
        let started = Instant::now();

        let futures: Vec<_> = (0..5)
            .map(|i| batcher.enqueue(OperationKind::AppendInteraction, timed_op(started, i)))
            .collect();
        assert_eq!(batcher.pending(), 0);

        let results = join_all(futures).await;
        for (i, result) in results.into_iter().enumerate() {
            let (value, ran_at) = result.unwrap();
            assert_eq!(value as usize, i);
            assert!(ran_at < WINDOW);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn partial_batch_waits_for_window() {
        let batcher = OperationBatcher::new(5, WINDOW);
        let started = Instant::now();

        let first = batcher.enqueue(OperationKind::StatusUpdate, timed_op(started, 1));
        let second = batcher.enqueue(OperationKind::StatusUpdate, timed_op(started, 2));
        assert_eq!(batcher.pending(), 2);

        let (first, second) = tokio::join!(first, second);
        assert!(first.unwrap().1 >= WINDOW);
        assert!(second.unwrap().1 >= WINDOW);
    }

    #[tokio::test(start_paused = true)]
    async fn size_flush_cancels_timer_and_next_op_opens_new_window() {
        let batcher = OperationBatcher::new(2, WINDOW);
        let started = Instant::now();

        let a = batcher.enqueue(OperationKind::Read, timed_op(started, 1));
        tokio::time::sleep(Duration::from_millis(1500)).await;
        let b = batcher.enqueue(OperationKind::Read, timed_op(started, 2));
        let c = batcher.enqueue(OperationKind::Read, timed_op(started, 3));

        let (a, b, c) = tokio::join!(a, b, c);
        assert_eq!(a.unwrap().1, Duration::from_millis(1500));
        assert_eq!(b.unwrap().1, Duration::from_millis(1500));
        // The cancelled first timer must not release `c` at the 2s mark.
        assert_eq!(c.unwrap().1, Duration::from_millis(3500));
    }

    #[tokio::test(start_paused = true)]
    async fn each_operation_reports_its_own_outcome() {
        let batcher = OperationBatcher::new(3, WINDOW);
        let attempts = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let make = |fail: bool| {
            let attempts = Arc::clone(&attempts);
            move || async move {
                attempts.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if fail {
                    Err(PipelineError::SessionNotFound("ghost".into()))
                } else {
                    Ok(())
                }
            }
        };

        let ok_a = batcher.enqueue(OperationKind::AppendInteraction, make(false));
        let bad = batcher.enqueue(OperationKind::AppendInteraction, make(true));
        let ok_b = batcher.enqueue(OperationKind::AppendInteraction, make(false));

        let (ok_a, bad, ok_b) = tokio::join!(ok_a, bad, ok_b);
        assert!(ok_a.is_ok());
        assert!(ok_b.is_ok());
        assert!(matches!(bad, Err(PipelineError::SessionNotFound(_))));
        assert_eq!(attempts.load(std::sync::atomic::Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn same_key_operations_finish_in_enqueue_order() {
        let batcher = OperationBatcher::new(3, WINDOW);
        let finished = Arc::new(Mutex::new(Vec::new()));

        // Later operations are faster, so unordered execution would invert them.
        let futures: Vec<_> = (0..7u64)
            .map(|i| {
                let finished = Arc::clone(&finished);
                batcher.enqueue_ordered(OperationKind::AppendInteraction, "s1", move || async move {
                    tokio::time::sleep(Duration::from_millis(70 - i * 10)).await;
                    finished.lock().unwrap().push(i);
                    Ok(())
                })
            })
            .collect();
        batcher.flush();

        for result in join_all(futures).await {
            result.unwrap();
        }
        assert_eq!(*finished.lock().unwrap(), (0..7).collect::<Vec<_>>());
        assert!(batcher.inner.lock().tails.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn different_keys_do_not_wait_on_each_other() {
        let batcher = OperationBatcher::new(2, WINDOW);
        let started = Instant::now();

        let slow = |key: &'static str| {
            batcher.enqueue_ordered(OperationKind::AppendInteraction, key, move || async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(started.elapsed())
            })
        };
        let (a, b) = tokio::join!(slow("s1"), slow("s2"));

        assert_eq!(a.unwrap(), Duration::from_millis(100));
        assert_eq!(b.unwrap(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_operation_is_reported_and_does_not_stall_its_key() {
        let batcher = OperationBatcher::new(2, WINDOW);

        let broken = batcher.enqueue_ordered(OperationKind::StatusUpdate, "s1", || async {
            if true {
                panic!("disk on fire");
            }
            Ok::<(), PipelineError>(())
        });
        let next = batcher.enqueue_ordered(OperationKind::StatusUpdate, "s1", || async {
            Ok::<u32, PipelineError>(7)
        });

        let (broken, next) = tokio::join!(broken, next);
        match broken {
            Err(PipelineError::OperationPanicked { kind, message }) => {
                assert_eq!(kind, "status_update");
                assert_eq!(message, "disk on fire");
            }
            other => panic!("expected a panic report, got {other:?}"),
        }
        assert_eq!(next.unwrap(), 7);
    }

    #[tokio::test(start_paused = true)]
    async fn manual_flush_releases_partial_batch() {
        let batcher = OperationBatcher::new(5, WINDOW);
        let started = Instant::now();

        let op = batcher.enqueue(OperationKind::ScreenshotRecord, timed_op(started, 9));
        batcher.flush();
        let (value, ran_at) = op.await.unwrap();
        assert_eq!(value, 9);
        assert!(ran_at < WINDOW);
    }
}
