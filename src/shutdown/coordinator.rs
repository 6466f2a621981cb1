//! Shutdown coordination.
//!
//! The coordinator waits for a termination event, broadcasts that shutdown
//! has been initiated, then waits for in-flight operations to drain. A second
//! termination event (when hard shutdown is allowed) or an elapsed grace
//! period races against the drain and forces an immediate exit.
//!
//! With hard shutdown disabled and no grace period the coordinator waits for
//! in-flight operations indefinitely. That is pure graceful mode: additional
//! termination events are ignored and there is no forced-exit path.

use crate::shutdown::exit::{ExitAction, ProcessExit};
use crate::shutdown::signal::{Signal, SignalWatch};
use crate::shutdown::source::{SignalSource, TerminationEvent, TerminationSource};
use crate::shutdown::tracker::{OperationGuard, OperationTracker, TrackerError};
use futures::stream::{BoxStream, StreamExt};
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exit code passed to the exit action on a forced shutdown.
pub const FORCED_EXIT_CODE: i32 = 1;

/// Errors returned when configuring or arming the coordinator.
#[derive(Debug, Error)]
pub enum ShutdownError {
    #[error("shutdown coordinator is already listening")]
    AlreadyListening,

    #[error("failed to subscribe to termination source: {0}")]
    Source(#[from] io::Error),

    #[error("termination source closed before any event was received")]
    SourceClosed,
}

/// Coarse shutdown progress, mostly for reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownPhase {
    Running,
    Draining,
    Complete,
    Forced,
}

/// Coordinates graceful process termination.
///
/// Construct one at startup and hand clones to everything that needs to
/// observe shutdown or register in-flight work.
#[derive(Clone)]
pub struct ShutdownCoordinator {
    inner: Arc<Inner>,
}

struct Inner {
    tracker: OperationTracker,
    signals: Signals,
    settings: Mutex<Settings>,
    task: Mutex<Option<JoinHandle<()>>>,
}

struct Settings {
    armed: bool,
    hard_shutdown: bool,
    source: Box<dyn TerminationSource>,
    exit: Arc<dyn ExitAction>,
}

#[derive(Clone)]
struct Signals {
    initiated: Signal,
    complete: Signal,
    forced: Signal,
    /// The termination source ended without producing an event.
    source_closed: Signal,
}

impl ShutdownCoordinator {
    /// Create a coordinator using OS signals and `std::process::exit`.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                tracker: OperationTracker::new(),
                signals: Signals {
                    initiated: Signal::new(),
                    complete: Signal::new(),
                    forced: Signal::new(),
                    source_closed: Signal::new(),
                },
                settings: Mutex::new(Settings {
                    armed: false,
                    hard_shutdown: true,
                    source: Box::new(SignalSource),
                    exit: Arc::new(ProcessExit),
                }),
                task: Mutex::new(None),
            }),
        }
    }

    /// Replace the termination event source. Must be called before `listen`.
    pub fn register_termination_source(
        &self,
        source: impl TerminationSource,
    ) -> Result<(), ShutdownError> {
        self.configure(|settings| settings.source = Box::new(source))
    }

    /// Replace the action invoked on forced shutdown. Must be called before `listen`.
    pub fn register_exit_action(&self, exit: impl ExitAction) -> Result<(), ShutdownError> {
        self.configure(|settings| settings.exit = Arc::new(exit))
    }

    /// Allow or forbid a second termination event to force an exit.
    pub fn set_hard_shutdown_allowed(&self, allowed: bool) -> Result<(), ShutdownError> {
        self.configure(|settings| settings.hard_shutdown = allowed)
    }

    fn configure(&self, apply: impl FnOnce(&mut Settings)) -> Result<(), ShutdownError> {
        let mut settings = self.inner.settings.lock();
        if settings.armed {
            return Err(ShutdownError::AlreadyListening);
        }
        apply(&mut settings);
        Ok(())
    }

    /// Arm the coordinator without a grace period.
    ///
    /// Returns once armed, or after shutdown finishes when `blocking` is set.
    /// A blocking call fails with [`ShutdownError::SourceClosed`] if the
    /// termination source ends before producing an event.
    ///
    /// If subscribing to the source fails the coordinator stays unarmed and
    /// keeps its configuration, so the call may be retried.
    pub async fn listen(&self, blocking: bool) -> Result<(), ShutdownError> {
        self.arm(blocking, None).await
    }

    /// Arm the coordinator, forcing an exit if in-flight operations have not
    /// drained within `grace` of shutdown being initiated.
    pub async fn listen_with_timeout(
        &self,
        blocking: bool,
        grace: Duration,
    ) -> Result<(), ShutdownError> {
        self.arm(blocking, Some(grace)).await
    }

    async fn arm(&self, blocking: bool, grace: Option<Duration>) -> Result<(), ShutdownError> {
        let (events, exit, hard_shutdown) = {
            let mut settings = self.inner.settings.lock();
            if settings.armed {
                return Err(ShutdownError::AlreadyListening);
            }

            let events = settings.source.events()?;
            settings.armed = true;

            (events, Arc::clone(&settings.exit), settings.hard_shutdown)
        };

        debug!(
            hard_shutdown,
            grace_period = ?grace,
            blocking,
            "shutdown coordinator armed"
        );

        let race = Race {
            tracker: self.inner.tracker.clone(),
            signals: self.inner.signals.clone(),
            exit,
            hard_shutdown,
            grace,
        };
        *self.inner.task.lock() = Some(tokio::spawn(race.run(events)));

        if !blocking {
            return Ok(());
        }

        let signals = &self.inner.signals;
        tokio::select! {
            _ = signals.complete.wait() => Ok(()),
            _ = signals.forced.wait() => Ok(()),
            _ = signals.source_closed.wait() => Err(ShutdownError::SourceClosed),
        }
    }

    /// Set once the first termination event has been processed.
    pub fn shutdown_initiated(&self) -> SignalWatch {
        self.inner.signals.initiated.watch()
    }

    /// Set once in-flight operations have drained after initiation.
    ///
    /// A forced exit does not set this signal.
    pub fn shutdown_complete(&self) -> SignalWatch {
        self.inner.signals.complete.watch()
    }

    /// Whether shutdown has been initiated.
    pub fn is_initiated(&self) -> bool {
        self.inner.signals.initiated.is_set()
    }

    /// Whether shutdown has completed gracefully.
    pub fn is_complete(&self) -> bool {
        self.inner.signals.complete.is_set()
    }

    /// Current shutdown phase.
    pub fn phase(&self) -> ShutdownPhase {
        let signals = &self.inner.signals;
        if signals.forced.is_set() {
            ShutdownPhase::Forced
        } else if signals.complete.is_set() {
            ShutdownPhase::Complete
        } else if signals.initiated.is_set() {
            ShutdownPhase::Draining
        } else {
            ShutdownPhase::Running
        }
    }

    /// Register an in-flight operation.
    pub fn begin_operation(&self) {
        self.inner.tracker.begin();
    }

    /// Finish an in-flight operation registered with `begin_operation`.
    pub fn end_operation(&self) -> Result<(), TrackerError> {
        self.inner.tracker.end()
    }

    /// Register an in-flight operation that ends when the guard is dropped.
    pub fn track_operation(&self) -> OperationGuard {
        self.inner.tracker.track()
    }

    /// The operation tracker shared by this coordinator.
    pub fn tracker(&self) -> &OperationTracker {
        &self.inner.tracker
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("phase", &self.phase())
            .field("operations", &self.inner.tracker.count())
            .finish()
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

/// Why a forced shutdown was triggered.
#[derive(Debug)]
enum Escalation {
    AdditionalEvent(TerminationEvent),
    GraceElapsed(Duration),
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Escalation::AdditionalEvent(event) => write!(f, "received additional {event}"),
            Escalation::GraceElapsed(grace) => write!(
                f,
                "grace period of {} elapsed",
                humantime::format_duration(*grace)
            ),
        }
    }
}

/// State owned by the background task that runs the shutdown sequence.
struct Race {
    tracker: OperationTracker,
    signals: Signals,
    exit: Arc<dyn ExitAction>,
    hard_shutdown: bool,
    grace: Option<Duration>,
}

impl Race {
    async fn run(self, mut events: BoxStream<'static, TerminationEvent>) {
        let Some(event) = events.next().await else {
            warn!("termination source ended before any event was received");
            self.signals.source_closed.fire();
            return;
        };

        self.signals.initiated.fire();
        match self.grace {
            Some(grace) => info!(
                signal = %event,
                grace_period = %humantime::format_duration(grace),
                in_flight = self.tracker.count(),
                "signal received, attempting soft shutdown"
            ),
            None => info!(
                signal = %event,
                in_flight = self.tracker.count(),
                "signal received, attempting soft shutdown"
            ),
        }

        // The losing branch is dropped here, which cancels its timer and
        // releases its hold on the event stream.
        tokio::select! {
            biased;

            _ = self.tracker.wait_zero() => {
                self.signals.complete.fire();
                info!("soft shutdown complete");
            }

            reason = escalate(&mut events, self.hard_shutdown, self.grace) => {
                warn!(
                    reason = %reason,
                    in_flight = self.tracker.count(),
                    "hard shutdown initiated"
                );
                self.signals.forced.fire();
                self.exit.exit(FORCED_EXIT_CODE);
            }
        }
    }
}

/// Resolve when either a further termination event (if allowed) arrives or
/// the grace period elapses. Never resolves when neither is configured.
async fn escalate(
    events: &mut BoxStream<'static, TerminationEvent>,
    hard_shutdown: bool,
    grace: Option<Duration>,
) -> Escalation {
    let additional_event = async {
        while let Some(event) = events.next().await {
            if hard_shutdown {
                return event;
            }
            debug!(signal = %event, "hard shutdown disabled, ignoring additional signal");
        }
        std::future::pending().await
    };

    let grace_elapsed = async {
        match grace {
            Some(grace) => {
                tokio::time::sleep(grace).await;
                grace
            }
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        event = additional_event => Escalation::AdditionalEvent(event),
        grace = grace_elapsed => Escalation::GraceElapsed(grace),
    }
}
