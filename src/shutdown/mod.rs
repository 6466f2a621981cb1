//! Shutdown coordination primitives.
//!
//! - [`OperationTracker`] counts in-flight operations
//! - [`Signal`] is a one-shot broadcast; the shutdown phases are exposed as
//!   read-only [`SignalWatch`]es
//! - [`ShutdownCoordinator`] sequences initiation, drain and forced exit

mod coordinator;
mod exit;
mod signal;
mod source;
mod tracker;

pub use coordinator::{ShutdownCoordinator, ShutdownError, ShutdownPhase, FORCED_EXIT_CODE};
pub use exit::{ExitAction, ProcessExit};
pub use signal::{Signal, SignalWatch};
pub use source::{trigger_source, SignalSource, TerminationEvent, TerminationSource, Trigger, TriggerSource};
pub use tracker::{OperationGuard, OperationTracker, TrackerError};
