//! The periodic task driver.
//!
//! A [`Driver`] owns one repeating unit of work: it invokes the work on a
//! fixed interval, retries transient failures with jittered exponential
//! backoff, and runs optional setup/teardown hooks exactly once per run. The
//! loop executes as a spawned tokio task; cancellation is cooperative via a
//! watch channel and is observed at every suspension point.

use std::collections::HashSet;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tokio::runtime;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::backoff::RetryBackoff;
use crate::error::{DriverError, FailureKind, HookKind, WorkError};

/// Ceiling on the total interval. Tokio's timer rejects sleeps beyond
/// roughly 2.2 years.
const MAX_INTERVAL: Duration = Duration::from_millis(68_719_476_734);

/// Future type produced by work and hook callables.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), WorkError>> + Send>>;

/// The unit of work driven by a [`Driver`].
///
/// Invoked with a clone of the bound context on every iteration.
pub type Work<C> = Arc<dyn Fn(C) -> TaskFuture + Send + Sync>;

/// A lifecycle hook, invoked once at the start or end of a run.
pub type Hook<C> = Arc<dyn Fn(C) -> TaskFuture + Send + Sync>;

fn into_callable<C, F, Fut>(f: F) -> Arc<dyn Fn(C) -> TaskFuture + Send + Sync>
where
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
{
    Arc::new(move |ctx: C| -> TaskFuture { Box::pin(f(ctx)) })
}

/// Failure kinds treated as transient unless the caller says otherwise.
///
/// These are generic categories; the driver carries no knowledge of any
/// particular network stack.
fn default_retryable() -> HashSet<FailureKind> {
    HashSet::from([
        FailureKind::Io,
        FailureKind::Timeout,
        FailureKind::ConnectionLost,
    ])
}

/// Handle to a running driver loop.
///
/// Cancellation through the handle is cooperative: the loop observes the
/// signal at its next suspension point, runs the teardown hook, and resolves
/// to `Ok(())`.
pub struct TaskHandle {
    join: JoinHandle<Result<(), DriverError>>,
    shutdown_tx: watch::Sender<bool>,
}

impl TaskHandle {
    /// Request cooperative shutdown of the loop. Does not wait.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Whether the loop has finished.
    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    /// Wait for the loop to finish and return its outcome.
    pub async fn join(self) -> Result<(), DriverError> {
        match self.join.await {
            Ok(outcome) => outcome,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // The loop is never aborted directly; a cancelled join means the
            // runtime shut down underneath it. Treat like cancellation.
            Err(_) => Ok(()),
        }
    }
}

/// A periodic task driver.
///
/// Construct one with [`Driver::builder`], then call [`start`](Self::start)
/// to launch the loop in the background. The context type `C` is bound at
/// build time and passed (cloned) to the work and both hooks on every
/// invocation; stateless tasks bind `()`.
pub struct Driver<C>
where
    C: Clone + Send + Sync + 'static,
{
    work: Work<C>,
    ctx: C,
    interval: Duration,
    max_iterations: Option<u64>,
    retry_on_failure: bool,
    retryable: Arc<RwLock<HashSet<FailureKind>>>,
    before: Option<Hook<C>>,
    after: Option<Hook<C>>,
    iterations: Arc<AtomicU64>,
    runtime: Option<runtime::Handle>,
    handle: Option<TaskHandle>,
}

impl<C> Driver<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Create a builder around the given unit of work.
    pub fn builder<F, Fut>(work: F) -> DriverBuilder<C>
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        DriverBuilder::new(work)
    }

    /// Launch the loop as a background task and return its handle.
    ///
    /// Fails with [`DriverError::AlreadyRunning`] if a run is still in
    /// flight. The call itself never blocks on the loop; loop-internal
    /// failures are only observable through the handle.
    pub fn start(&mut self) -> Result<&TaskHandle, DriverError> {
        if self.is_running() {
            return Err(DriverError::AlreadyRunning);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = DriverLoop {
            work: Arc::clone(&self.work),
            ctx: self.ctx.clone(),
            interval: self.interval,
            max_iterations: self.max_iterations,
            retry_on_failure: self.retry_on_failure,
            retryable: Arc::clone(&self.retryable),
            before: self.before.clone(),
            after: self.after.clone(),
            iterations: Arc::clone(&self.iterations),
        };

        let join = match &self.runtime {
            Some(handle) => handle.spawn(task.run(shutdown_rx)),
            None => match runtime::Handle::try_current() {
                Ok(handle) => handle.spawn(task.run(shutdown_rx)),
                Err(_) => {
                    return Err(DriverError::Configuration(
                        "start() requires a tokio runtime; set one with DriverBuilder::runtime"
                            .to_string(),
                    ));
                }
            },
        };

        debug!(
            interval_secs = self.interval.as_secs_f64(),
            max_iterations = ?self.max_iterations,
            "driver started"
        );
        let handle = self.handle.insert(TaskHandle { join, shutdown_tx });
        Ok(&*handle)
    }

    /// Request cooperative shutdown and clear the handle without waiting.
    ///
    /// The loop finishes in the background, teardown hook included. No-op
    /// when not running.
    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.cancel();
            debug!("driver cancellation requested");
        }
    }

    /// Request shutdown, wait for the loop to unwind, and return its outcome.
    ///
    /// Returns `None` when no run was in flight.
    pub async fn shutdown(&mut self) -> Option<Result<(), DriverError>> {
        let handle = self.handle.take()?;
        handle.cancel();
        Some(handle.join().await)
    }

    /// Wait for the current run to finish naturally and return its outcome.
    ///
    /// Returns `None` when no run was in flight.
    pub async fn join(&mut self) -> Option<Result<(), DriverError>> {
        let handle = self.handle.take()?;
        Some(handle.join().await)
    }

    /// The current run's handle, or `None` when not started.
    pub fn handle(&self) -> Option<&TaskHandle> {
        self.handle.as_ref()
    }

    /// Whether a run is in flight.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Number of successfully completed iterations.
    pub fn current_iteration(&self) -> u64 {
        self.iterations.load(Ordering::SeqCst)
    }

    /// The fixed interval between successful iterations.
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// The iteration bound, if any.
    pub fn count(&self) -> Option<u64> {
        self.max_iterations
    }

    /// Whether retryable failures trigger backoff-and-continue.
    pub fn retry_on_failure(&self) -> bool {
        self.retry_on_failure
    }

    /// Mark a failure kind as transient.
    ///
    /// Takes effect on the loop's next failure check.
    pub fn add_retryable(&self, kind: FailureKind) {
        self.retryable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind);
    }

    /// Stop treating a failure kind as transient.
    ///
    /// Returns whether the kind was present.
    pub fn remove_retryable(&self, kind: &FailureKind) -> bool {
        self.retryable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(kind)
    }

    /// Drop every kind from the retryable set.
    pub fn clear_retryable(&self) {
        self.retryable
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Snapshot of the kinds currently treated as transient.
    pub fn retryable_kinds(&self) -> Vec<FailureKind> {
        self.retryable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    /// Register the setup hook. Captured by the loop at [`start`](Self::start).
    pub fn set_before_hook<F, Fut>(&mut self, hook: F)
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.before = Some(into_callable(hook));
    }

    /// Register the teardown hook. Captured by the loop at [`start`](Self::start).
    pub fn set_after_hook<F, Fut>(&mut self, hook: F)
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.after = Some(into_callable(hook));
    }
}

/// State captured by one run of the loop.
struct DriverLoop<C>
where
    C: Clone + Send + Sync + 'static,
{
    work: Work<C>,
    ctx: C,
    interval: Duration,
    max_iterations: Option<u64>,
    retry_on_failure: bool,
    retryable: Arc<RwLock<HashSet<FailureKind>>>,
    before: Option<Hook<C>>,
    after: Option<Hook<C>>,
    iterations: Arc<AtomicU64>,
}

impl<C> DriverLoop<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Run the loop to completion.
    ///
    /// The teardown hook runs on every exit path. If it fails while
    /// unwinding from an earlier failure, the hook failure is logged and the
    /// original failure is the one propagated; the original cause is never
    /// lost. A teardown failure on an otherwise clean run is propagated as
    /// [`DriverError::Hook`].
    #[tracing::instrument(skip_all)]
    async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> Result<(), DriverError> {
        let outcome = self.drive(&mut shutdown_rx).await;

        if let Some(after) = &self.after {
            if let Err(hook_err) = (after)(self.ctx.clone()).await {
                return match outcome {
                    Err(original) => {
                        error!(error = %hook_err, "after hook failed during unwind");
                        Err(original)
                    }
                    Ok(()) => Err(DriverError::Hook {
                        hook: HookKind::After,
                        source: hook_err,
                    }),
                };
            }
        }

        outcome
    }

    /// The setup hook plus the iteration state machine.
    async fn drive(&self, shutdown_rx: &mut watch::Receiver<bool>) -> Result<(), DriverError> {
        if let Some(before) = &self.before {
            let setup = tokio::select! {
                biased;
                _ = cancelled(shutdown_rx) => {
                    info!("driver loop cancelled");
                    return Ok(());
                }
                setup = (before)(self.ctx.clone()) => setup,
            };
            setup.map_err(|source| DriverError::Hook {
                hook: HookKind::Before,
                source,
            })?;
        }

        let mut backoff = RetryBackoff::new();

        loop {
            // A restarted bounded driver that already hit its count runs no
            // further iterations; the counter never exceeds the bound.
            if self.limit_reached() {
                info!(
                    iterations = self.iterations.load(Ordering::SeqCst),
                    "driver loop completed"
                );
                return Ok(());
            }

            let result = tokio::select! {
                biased;
                _ = cancelled(shutdown_rx) => {
                    info!("driver loop cancelled");
                    return Ok(());
                }
                result = (self.work)(self.ctx.clone()) => result,
            };

            match result {
                Ok(()) => {
                    let completed = self.iterations.fetch_add(1, Ordering::SeqCst) + 1;
                    backoff.reset();

                    if self.max_iterations.is_some_and(|max| completed >= max) {
                        info!(iterations = completed, "driver loop completed");
                        return Ok(());
                    }
                    if !self.sleep_or_cancel(shutdown_rx, self.interval).await {
                        info!("driver loop cancelled");
                        return Ok(());
                    }
                }
                Err(err) if self.retry_on_failure && self.is_retryable(&err) => {
                    let delay = backoff.next_delay();
                    warn!(
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "retryable failure, backing off"
                    );
                    if !self.sleep_or_cancel(shutdown_rx, delay).await {
                        info!("driver loop cancelled");
                        return Ok(());
                    }
                }
                Err(err) => {
                    error!(error = %err, "fatal failure, stopping driver loop");
                    return Err(DriverError::Fatal(err));
                }
            }
        }
    }

    fn limit_reached(&self) -> bool {
        self.max_iterations
            .is_some_and(|max| self.iterations.load(Ordering::SeqCst) >= max)
    }

    /// Classification is read fresh on every failure; callers may change the
    /// retryable set between iterations.
    fn is_retryable(&self, err: &WorkError) -> bool {
        self.retryable
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(err.kind())
    }

    /// Sleep raced against the shutdown signal. Returns `false` on shutdown.
    async fn sleep_or_cancel(
        &self,
        shutdown_rx: &mut watch::Receiver<bool>,
        duration: Duration,
    ) -> bool {
        tokio::select! {
            biased;
            _ = cancelled(shutdown_rx) => false,
            _ = sleep(duration) => true,
        }
    }
}

/// Resolves when cooperative shutdown is requested.
///
/// Never resolves if the sender side is gone without a signal: a detached
/// loop keeps running after its driver was dropped.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Builder for [`Driver`].
///
/// The interval is composed from independently specified seconds, minutes,
/// and hours. A context must be bound with [`bind`](Self::bind) before
/// [`build`](Self::build); stateless tasks bind `()`.
pub struct DriverBuilder<C>
where
    C: Clone + Send + Sync + 'static,
{
    work: Work<C>,
    seconds: f64,
    minutes: f64,
    hours: f64,
    count: Option<u64>,
    retry_on_failure: bool,
    retryable: HashSet<FailureKind>,
    before: Option<Hook<C>>,
    after: Option<Hook<C>>,
    ctx: Option<C>,
    runtime: Option<runtime::Handle>,
}

impl<C> DriverBuilder<C>
where
    C: Clone + Send + Sync + 'static,
{
    /// Create a builder around the given unit of work.
    pub fn new<F, Fut>(work: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        Self {
            work: into_callable(work),
            seconds: 0.0,
            minutes: 0.0,
            hours: 0.0,
            count: None,
            retry_on_failure: true,
            retryable: default_retryable(),
            before: None,
            after: None,
            ctx: None,
            runtime: None,
        }
    }

    /// Seconds component of the interval.
    #[must_use]
    pub fn seconds(mut self, seconds: f64) -> Self {
        self.seconds = seconds;
        self
    }

    /// Minutes component of the interval.
    #[must_use]
    pub fn minutes(mut self, minutes: f64) -> Self {
        self.minutes = minutes;
        self
    }

    /// Hours component of the interval.
    #[must_use]
    pub fn hours(mut self, hours: f64) -> Self {
        self.hours = hours;
        self
    }

    /// Bound the number of iterations; unbounded when unset.
    #[must_use]
    pub fn count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Whether retryable failures trigger backoff-and-continue (default true).
    #[must_use]
    pub fn retry_on_failure(mut self, retry: bool) -> Self {
        self.retry_on_failure = retry;
        self
    }

    /// Replace the default transient set.
    #[must_use]
    pub fn retryable_kinds(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retryable = kinds.into_iter().collect();
        self
    }

    /// Bind the context passed to the work and hooks on every invocation.
    #[must_use]
    pub fn bind(mut self, ctx: C) -> Self {
        self.ctx = Some(ctx);
        self
    }

    /// Runtime to spawn the loop on; defaults to the ambient runtime of the
    /// `start()` caller.
    #[must_use]
    pub fn runtime(mut self, handle: runtime::Handle) -> Self {
        self.runtime = Some(handle);
        self
    }

    /// Register the setup hook, invoked once before the first iteration.
    #[must_use]
    pub fn before<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.before = Some(into_callable(hook));
        self
    }

    /// Register the teardown hook, invoked once after the loop ends.
    #[must_use]
    pub fn after<F, Fut>(mut self, hook: F) -> Self
    where
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), WorkError>> + Send + 'static,
    {
        self.after = Some(into_callable(hook));
        self
    }

    /// Validate the configuration and build the driver.
    pub fn build(self) -> Result<Driver<C>, DriverError> {
        if let Some(count) = self.count {
            if count == 0 {
                return Err(DriverError::Configuration(
                    "count must be at least 1".to_string(),
                ));
            }
        }

        let interval = compose_interval(self.seconds, self.minutes, self.hours)?;

        let ctx = self.ctx.ok_or_else(|| {
            DriverError::Configuration(
                "no context bound; bind(()) for stateless tasks".to_string(),
            )
        })?;

        Ok(Driver {
            work: self.work,
            ctx,
            interval,
            max_iterations: self.count,
            retry_on_failure: self.retry_on_failure,
            retryable: Arc::new(RwLock::new(self.retryable)),
            before: self.before,
            after: self.after,
            iterations: Arc::new(AtomicU64::new(0)),
            runtime: self.runtime,
            handle: None,
        })
    }
}

fn compose_interval(seconds: f64, minutes: f64, hours: f64) -> Result<Duration, DriverError> {
    for (name, value) in [("seconds", seconds), ("minutes", minutes), ("hours", hours)] {
        if !value.is_finite() || value < 0.0 {
            return Err(DriverError::Configuration(format!(
                "{name} must be a finite non-negative number"
            )));
        }
    }

    let total = seconds + minutes * 60.0 + hours * 3600.0;
    if total > MAX_INTERVAL.as_secs_f64() {
        return Err(DriverError::Configuration(format!(
            "total interval of {total} seconds exceeds the maximum schedulable delay"
        )));
    }

    Ok(Duration::from_secs_f64(total))
}
