//! Deferred, batched persistence.
//!
//! Reads never wait on writes: every write-back is queued here and runs once the queue
//! has been quiet for `delay`. Each enqueue restarts the timer.

use color_eyre::{Report, Result};
use futures::future::BoxFuture;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;

/// Receives every failed write, after it has been logged.
pub type ErrorSink = Arc<dyn Fn(&str, &Report) + Send + Sync>;

/// A zero-argument deferred write. Runs at most once; failures are reported, never retried.
pub struct PendingWrite {
  label: String,
  task: Box<dyn FnOnce() -> BoxFuture<'static, Result<()>> + Send>,
}

impl PendingWrite {
  pub fn new<F, Fut>(label: impl Into<String>, task: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
  {
    Self {
      label: label.into(),
      task: Box::new(move || Box::pin(task())),
    }
  }

  pub fn label(&self) -> &str {
    &self.label
  }
}

impl std::fmt::Debug for PendingWrite {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("PendingWrite")
      .field("label", &self.label)
      .finish()
  }
}

/// Outcome of one flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FlushReport {
  pub executed: usize,
  pub failed: usize,
}

/// Awaitable handle on a flush in progress.
pub struct FlushHandle {
  count: usize,
  inner: JoinHandle<FlushReport>,
}

impl Future for FlushHandle {
  type Output = FlushReport;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    let count = self.count;
    Pin::new(&mut self.inner).poll(cx).map(|res| {
      res.unwrap_or_else(|err| {
        tracing::error!(error = %err, "flush task did not complete");
        FlushReport {
          executed: count,
          failed: count,
        }
      })
    })
  }
}

struct QueueState {
  tasks: Vec<PendingWrite>,
  timer: Option<JoinHandle<()>>,
}

struct QueueInner {
  state: Mutex<QueueState>,
  delay: Duration,
  automatic: AtomicBool,
  flushes: AtomicU64,
  sink: Mutex<Option<ErrorSink>>,
}

/// Debounced batcher of [`PendingWrite`]s. Cloning shares the queue.
#[derive(Clone)]
pub struct WritingQueue {
  inner: Arc<QueueInner>,
}

impl WritingQueue {
  /// Default quiet period, roughly the time the cache takes to answer a read.
  pub const DEFAULT_DELAY: Duration = Duration::from_millis(3000);

  pub fn new(delay: Duration) -> Self {
    Self {
      inner: Arc::new(QueueInner {
        state: Mutex::new(QueueState {
          tasks: Vec::new(),
          timer: None,
        }),
        delay,
        automatic: AtomicBool::new(true),
        flushes: AtomicU64::new(0),
        sink: Mutex::new(None),
      }),
    }
  }

  /// Turn the timer on or off. With it off, queued writes only run on [`flush`](Self::flush).
  pub fn set_automatic(&self, automatic: bool) {
    self.inner.automatic.store(automatic, Ordering::SeqCst);
    if !automatic {
      if let Some(timer) = self.lock_state().timer.take() {
        timer.abort();
      }
    }
  }

  pub fn is_automatic(&self) -> bool {
    self.inner.automatic.load(Ordering::SeqCst)
  }

  /// Install the sink that receives failed writes.
  pub fn set_error_sink(&self, sink: ErrorSink) {
    *self.inner.sink.lock().unwrap_or_else(|e| e.into_inner()) = Some(sink);
  }

  /// Number of writes waiting for the next flush.
  pub fn len(&self) -> usize {
    self.lock_state().tasks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Number of flushes that executed at least one write.
  pub fn flush_count(&self) -> u64 {
    self.inner.flushes.load(Ordering::SeqCst)
  }

  /// Queue a write and restart the quiet-period timer.
  ///
  /// Must be called from within a tokio runtime when the queue is automatic.
  pub fn enqueue(&self, write: PendingWrite) {
    let mut state = self.lock_state();
    tracing::trace!(write = write.label(), queued = state.tasks.len() + 1, "enqueued write");
    state.tasks.push(write);

    if !self.is_automatic() {
      return;
    }

    if let Some(timer) = state.timer.take() {
      timer.abort();
    }

    let queue = self.clone();
    let delay = self.inner.delay;
    state.timer = Some(tokio::spawn(async move {
      tokio::time::sleep(delay).await;
      queue.drain(false);
    }));
  }

  /// Cancel the pending timer and run every queued write now.
  pub fn flush(&self) -> FlushHandle {
    self.drain(true)
  }

  fn drain(&self, cancel_timer: bool) -> FlushHandle {
    let (tasks, timer) = {
      let mut state = self.lock_state();
      (std::mem::take(&mut state.tasks), state.timer.take())
    };
    if let (true, Some(timer)) = (cancel_timer, timer) {
      timer.abort();
    }

    let count = tasks.len();
    if count > 0 {
      self.inner.flushes.fetch_add(1, Ordering::SeqCst);
      tracing::debug!(writes = count, "flushing writing queue");
    }
    let sink = self
      .inner
      .sink
      .lock()
      .unwrap_or_else(|e| e.into_inner())
      .clone();

    // Every write gets its own task so one failure or panic cannot stall its siblings.
    let running: Vec<(String, JoinHandle<Result<()>>)> = tasks
      .into_iter()
      .map(|write| {
        let PendingWrite { label, task } = write;
        (label, tokio::spawn(task()))
      })
      .collect();

    let inner = tokio::spawn(async move {
      let mut report = FlushReport {
        executed: running.len(),
        failed: 0,
      };
      for (label, handle) in running {
        let err = match handle.await {
          Ok(Ok(())) => continue,
          Ok(Err(err)) => err,
          Err(join) => Report::msg(format!("write task aborted: {}", join)),
        };
        report.failed += 1;
        tracing::error!(write = %label, error = %err, "queued write failed");
        if let Some(sink) = &sink {
          sink(&label, &err);
        }
      }
      report
    });

    FlushHandle { count, inner }
  }

  fn lock_state(&self) -> std::sync::MutexGuard<'_, QueueState> {
    // Queue state is only mutated inside short synchronous sections.
    self.inner.state.lock().unwrap_or_else(|e| e.into_inner())
  }
}

impl Default for WritingQueue {
  fn default() -> Self {
    Self::new(Self::DEFAULT_DELAY)
  }
}
