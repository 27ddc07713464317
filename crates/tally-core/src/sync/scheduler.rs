//! Debounced, periodic and on-demand scheduling of sync passes
//!
//! [`SyncScheduler`] runs as a single actor task. Callers talk to it through a
//! cloneable [`SchedulerHandle`]; progress is published as [`SyncEvent`]s on
//! a broadcast channel.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};

use super::orchestrator::{PassMode, SyncOrchestrator};
use super::report::SyncReport;
use super::retry::RetryPolicy;
use crate::error::{Error, Result};
use crate::store::StatementBackend;

const EVENT_CAPACITY: usize = 64;

/// Anything that can run one guarded reconciliation pass.
pub trait SyncRunner: Send + Sync + 'static {
    fn run_pass(&self, mode: PassMode) -> impl Future<Output = Result<SyncReport>> + Send;

    /// Whether `interval` has passed since the last full reconciliation.
    fn full_pass_due(&self, interval: Duration) -> impl Future<Output = bool> + Send;
}

impl<R: StatementBackend + 'static> SyncRunner for SyncOrchestrator<R> {
    fn run_pass(&self, mode: PassMode) -> impl Future<Output = Result<SyncReport>> + Send {
        Self::run_pass(self, mode)
    }

    fn full_pass_due(&self, interval: Duration) -> impl Future<Output = bool> + Send {
        Self::full_pass_due(self, interval)
    }
}

/// Scheduler timing and retry settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Quiet interval after the last trigger before a debounced pass starts
    pub debounce: Duration,
    /// Background pass interval while online; `None` disables it
    pub periodic_interval: Option<Duration>,
    /// Age of the last full reconciliation at which a periodic pass becomes a
    /// full one; `None` keeps periodic passes incremental
    pub full_interval: Option<Duration>,
    pub retry: RetryPolicy,
    /// Connectivity assumed until the first report
    pub start_online: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            periodic_interval: Some(Duration::from_secs(300)),
            full_interval: Some(Duration::from_secs(24 * 60 * 60)),
            retry: RetryPolicy::default(),
            start_online: true,
        }
    }
}

impl SchedulerConfig {
    #[must_use]
    pub const fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    #[must_use]
    pub const fn with_periodic_interval(mut self, interval: Option<Duration>) -> Self {
        self.periodic_interval = interval;
        self
    }

    #[must_use]
    pub const fn with_full_interval(mut self, interval: Option<Duration>) -> Self {
        self.full_interval = interval;
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub const fn with_start_online(mut self, online: bool) -> Self {
        self.start_online = online;
        self
    }
}

/// Scheduler progress notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SyncEvent {
    ConnectivityChanged {
        online: bool,
    },
    PassStarted {
        mode: PassMode,
        attempt: u32,
    },
    PassCompleted {
        mode: PassMode,
        report: SyncReport,
    },
    PassFailed {
        mode: PassMode,
        attempt: u32,
        error: String,
        retry_in_ms: Option<u64>,
    },
    PassSkipped {
        reason: String,
    },
    RetriesExhausted {
        attempts: u32,
        error: String,
    },
}

type Reply = oneshot::Sender<Result<SyncReport>>;

enum Command {
    ConnectivityRestored,
    ConnectivityLost,
    Debounced(Duration),
    Trigger { mode: PassMode, reply: Reply },
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable entry point to a running scheduler.
#[derive(Clone, Debug)]
pub struct SchedulerHandle {
    commands: mpsc::UnboundedSender<Command>,
    events: broadcast::Sender<SyncEvent>,
}

impl SchedulerHandle {
    fn send(&self, command: Command) {
        if self.commands.send(command).is_err() {
            tracing::debug!("Sync scheduler is no longer running");
        }
    }

    pub fn on_connectivity_restored(&self) {
        self.send(Command::ConnectivityRestored);
    }

    pub fn on_connectivity_lost(&self) {
        self.send(Command::ConnectivityLost);
    }

    /// Request a pass once `delay` has passed without further requests.
    pub fn schedule_debounced(&self, delay: Duration) {
        self.send(Command::Debounced(delay));
    }

    /// Run an incremental pass now and wait for its final outcome.
    pub async fn trigger_manual(&self) -> Result<SyncReport> {
        self.trigger(PassMode::Incremental).await
    }

    /// Run a full reconciliation now and wait for its final outcome.
    pub async fn trigger_full(&self) -> Result<SyncReport> {
        self.trigger(PassMode::Full).await
    }

    async fn trigger(&self, mode: PassMode) -> Result<SyncReport> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Trigger { mode, reply })
            .map_err(|_| Error::ExecutorClosed)?;
        response.await.map_err(|_| Error::ExecutorClosed)?
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.commands.is_closed()
    }

    /// Stop the scheduler. A pass already running finishes in the background.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

struct Running {
    attempt: u32,
    reply: Option<Reply>,
}

/// A pass result, tagged with the mode it actually ran in.
struct Finished {
    mode: PassMode,
    result: Result<SyncReport>,
}

struct PendingRetry {
    at: Instant,
    mode: PassMode,
    attempt: u32,
    reply: Option<Reply>,
}

/// Actor that owns scheduling state.
pub struct SyncScheduler<S> {
    runner: Arc<S>,
    config: SchedulerConfig,
    events: broadcast::Sender<SyncEvent>,
    online: bool,
    debounce_at: Option<Instant>,
    debounce_mode: PassMode,
    running: Option<Running>,
    retry: Option<PendingRetry>,
    finished: mpsc::UnboundedSender<Finished>,
}

impl<S: SyncRunner> SyncScheduler<S> {
    /// Start the actor on the current Tokio runtime.
    pub fn spawn(runner: S, config: SchedulerConfig) -> SchedulerHandle {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (finished, finished_rx) = mpsc::unbounded_channel();

        let scheduler = Self {
            runner: Arc::new(runner),
            online: config.start_online,
            config,
            events: events.clone(),
            debounce_at: None,
            debounce_mode: PassMode::Incremental,
            running: None,
            retry: None,
            finished,
        };
        tokio::spawn(scheduler.run(command_rx, finished_rx));

        SchedulerHandle {
            commands: command_tx,
            events,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut finished: mpsc::UnboundedReceiver<Finished>,
    ) {
        let period = self.config.periodic_interval;
        let tick_every = period.unwrap_or(Duration::from_secs(3600));
        let mut periodic = tokio::time::interval_at(Instant::now() + tick_every, tick_every);
        periodic.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let debounce_at = self.debounce_at;
            let retry_at = self.retry.as_ref().map(|retry| retry.at);
            let idle = !self.is_busy();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown(ack)) => {
                        let _ = ack.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(done) = finished.recv() => self.finish_pass(done),
                () = sleep_until(debounce_at), if debounce_at.is_some() && idle => {
                    self.debounce_at = None;
                    let mode = std::mem::replace(&mut self.debounce_mode, PassMode::Incremental);
                    if self.online {
                        self.start_pass(mode, 1, None);
                    } else {
                        self.emit(SyncEvent::PassSkipped { reason: "offline".into() });
                    }
                },
                () = sleep_until(retry_at), if retry_at.is_some() && self.running.is_none() => {
                    if let Some(retry) = self.retry.take() {
                        self.start_pass(retry.mode, retry.attempt, retry.reply);
                    }
                },
                _ = periodic.tick(), if period.is_some() => {
                    if self.online && idle {
                        self.start_periodic_pass();
                    }
                },
            }
        }

        tracing::debug!("Sync scheduler stopped");
    }

    const fn is_busy(&self) -> bool {
        self.running.is_some() || self.retry.is_some()
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    fn arm_debounce(&mut self, delay: Duration, mode: PassMode) {
        self.debounce_at = Some(Instant::now() + delay);
        if mode == PassMode::Full {
            self.debounce_mode = PassMode::Full;
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::ConnectivityRestored => {
                if !self.online {
                    tracing::info!("Connectivity restored");
                }
                self.online = true;
                self.emit(SyncEvent::ConnectivityChanged { online: true });
                self.arm_debounce(self.config.debounce, PassMode::Incremental);
            }
            Command::ConnectivityLost => {
                if self.online {
                    tracing::info!("Connectivity lost");
                }
                self.online = false;
                self.emit(SyncEvent::ConnectivityChanged { online: false });
            }
            Command::Debounced(delay) => self.arm_debounce(delay, PassMode::Incremental),
            Command::Trigger { mode, reply } => {
                if self.is_busy() {
                    let _ = reply.send(Err(Error::SyncAlreadyInProgress));
                    self.arm_debounce(self.config.debounce, mode);
                } else {
                    self.start_pass(mode, 1, Some(reply));
                }
            }
            Command::Shutdown(_) => {}
        }
    }

    fn start_pass(&mut self, mode: PassMode, attempt: u32, reply: Option<Reply>) {
        self.launch(attempt, reply, std::future::ready(mode));
    }

    /// Periodic pass: full once the last full reconciliation is old enough.
    fn start_periodic_pass(&mut self) {
        let runner = Arc::clone(&self.runner);
        let full_interval = self.config.full_interval;
        self.launch(1, None, async move {
            match full_interval {
                Some(interval) if runner.full_pass_due(interval).await => PassMode::Full,
                _ => PassMode::Incremental,
            }
        });
    }

    fn launch(
        &mut self,
        attempt: u32,
        reply: Option<Reply>,
        mode: impl Future<Output = PassMode> + Send + 'static,
    ) {
        self.running = Some(Running { attempt, reply });

        let runner = Arc::clone(&self.runner);
        let finished = self.finished.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let mode = mode.await;
            tracing::debug!(?mode, attempt, "Starting sync pass");
            let _ = events.send(SyncEvent::PassStarted { mode, attempt });
            let result = runner.run_pass(mode).await;
            let _ = finished.send(Finished { mode, result });
        });
    }

    fn finish_pass(&mut self, done: Finished) {
        let Some(Running { attempt, reply }) = self.running.take() else {
            return;
        };
        let Finished { mode, result } = done;

        let outcome = match result {
            Ok(report) => {
                self.emit(SyncEvent::PassCompleted {
                    mode,
                    report: report.clone(),
                });
                Ok(report)
            }
            Err(error) if error.is_retryable() => {
                if self.config.retry.allows_another(attempt) {
                    let delay = self.config.retry.delay_for_retry(attempt);
                    tracing::warn!(%error, attempt, ?delay, "Sync pass failed, retrying");
                    self.emit(SyncEvent::PassFailed {
                        mode,
                        attempt,
                        error: error.to_string(),
                        retry_in_ms: Some(u64::try_from(delay.as_millis()).unwrap_or(u64::MAX)),
                    });
                    self.retry = Some(PendingRetry {
                        at: Instant::now() + delay,
                        mode,
                        attempt: attempt + 1,
                        reply,
                    });
                    return;
                }

                tracing::error!(%error, attempts = attempt, "Sync retries exhausted");
                self.emit(SyncEvent::RetriesExhausted {
                    attempts: attempt,
                    error: error.to_string(),
                });
                Err(Error::RetriesExhausted {
                    attempts: attempt,
                    last_error: error.to_string(),
                })
            }
            Err(error) => {
                match &error {
                    Error::RemoteUnavailable(_) | Error::SyncAlreadyInProgress => {
                        self.emit(SyncEvent::PassSkipped {
                            reason: error.to_string(),
                        });
                    }
                    _ => self.emit(SyncEvent::PassFailed {
                        mode,
                        attempt,
                        error: error.to_string(),
                        retry_in_ms: None,
                    }),
                }
                Err(error)
            }
        };

        if let Some(reply) = reply {
            let _ = reply.send(outcome);
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
