//! Termination event sources.
//!
//! A source turns some external trigger (OS signals, an admin command, a
//! failing health check) into a stream of termination events.

use futures::stream::{self, BoxStream, StreamExt};
use std::fmt;
use std::io;
use tokio::sync::mpsc;

/// A request to terminate the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminationEvent {
    /// SIGINT or Ctrl-C.
    Interrupt,
    /// SIGTERM.
    Terminate,
    /// SIGHUP.
    Hangup,
    /// Programmatic request with a free-form reason.
    Requested(String),
}

impl fmt::Display for TerminationEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TerminationEvent::Interrupt => write!(f, "SIGINT"),
            TerminationEvent::Terminate => write!(f, "SIGTERM"),
            TerminationEvent::Hangup => write!(f, "SIGHUP"),
            TerminationEvent::Requested(reason) => write!(f, "requested ({reason})"),
        }
    }
}

/// Produces termination events for the coordinator.
pub trait TerminationSource: Send + 'static {
    /// Subscribe to the source.
    ///
    /// Dropping the returned stream unsubscribes. A source that fails to
    /// subscribe is left as it was.
    fn events(&mut self) -> io::Result<BoxStream<'static, TerminationEvent>>;
}

/// Source backed by the process's interrupt, terminate and hangup signals.
#[derive(Debug, Default, Clone, Copy)]
pub struct SignalSource;

impl TerminationSource for SignalSource {
    #[cfg(unix)]
    fn events(&mut self) -> io::Result<BoxStream<'static, TerminationEvent>> {
        use tokio::signal::unix::{signal, SignalKind};

        let interrupt = signal(SignalKind::interrupt())?;
        let terminate = signal(SignalKind::terminate())?;
        let hangup = signal(SignalKind::hangup())?;

        let events = stream::unfold(
            (interrupt, terminate, hangup),
            |(mut interrupt, mut terminate, mut hangup)| async move {
                let event = tokio::select! {
                    Some(()) = interrupt.recv() => TerminationEvent::Interrupt,
                    Some(()) = terminate.recv() => TerminationEvent::Terminate,
                    Some(()) = hangup.recv() => TerminationEvent::Hangup,
                    else => return None,
                };
                Some((event, (interrupt, terminate, hangup)))
            },
        );

        Ok(events.boxed())
    }

    #[cfg(not(unix))]
    fn events(&mut self) -> io::Result<BoxStream<'static, TerminationEvent>> {
        let events = stream::unfold((), |()| async {
            tokio::signal::ctrl_c().await.ok()?;
            Some((TerminationEvent::Interrupt, ()))
        });

        Ok(events.boxed())
    }
}

/// Create a programmatic termination source and the handle that feeds it.
pub fn trigger_source() -> (Trigger, TriggerSource) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (
        Trigger { sender },
        TriggerSource {
            receiver: Some(receiver),
        },
    )
}

/// Handle used to request termination from application code.
#[derive(Debug, Clone)]
pub struct Trigger {
    sender: mpsc::UnboundedSender<TerminationEvent>,
}

impl Trigger {
    /// Request termination with the given reason.
    ///
    /// Returns `false` if the coordinator is no longer listening.
    pub fn fire(&self, reason: impl Into<String>) -> bool {
        self.send(TerminationEvent::Requested(reason.into()))
    }

    /// Deliver an arbitrary termination event.
    pub fn send(&self, event: TerminationEvent) -> bool {
        self.sender.send(event).is_ok()
    }
}

/// Termination source fed by [`Trigger`] handles.
///
/// Can be subscribed to once.
#[derive(Debug)]
pub struct TriggerSource {
    receiver: Option<mpsc::UnboundedReceiver<TerminationEvent>>,
}

impl TerminationSource for TriggerSource {
    fn events(&mut self) -> io::Result<BoxStream<'static, TerminationEvent>> {
        let receiver = self.receiver.take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "trigger source already subscribed")
        })?;

        let events = stream::unfold(receiver, |mut receiver| async move {
            let event = receiver.recv().await?;
            Some((event, receiver))
        });

        Ok(events.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_events_arrive_in_order() {
        let (trigger, mut source) = trigger_source();
        let mut events = source.events().unwrap();

        assert!(trigger.fire("admin"));
        assert!(trigger.send(TerminationEvent::Terminate));

        assert_eq!(
            events.next().await,
            Some(TerminationEvent::Requested("admin".to_string()))
        );
        assert_eq!(events.next().await, Some(TerminationEvent::Terminate));
    }

    #[tokio::test]
    async fn test_trigger_reports_dropped_source() {
        let (trigger, mut source) = trigger_source();
        let events = source.events().unwrap();
        drop(events);
        assert!(!trigger.fire("too late"));
    }

    #[test]
    fn test_trigger_source_subscribes_once() {
        let (_trigger, mut source) = trigger_source();
        assert!(source.events().is_ok());

        let err = source.events().err().unwrap();
        assert_eq!(err.kind(), io::ErrorKind::AlreadyExists);
    }

    #[test]
    fn test_event_display() {
        assert_eq!(TerminationEvent::Interrupt.to_string(), "SIGINT");
        assert_eq!(TerminationEvent::Hangup.to_string(), "SIGHUP");
        assert_eq!(
            TerminationEvent::Requested("health check failed".to_string()).to_string(),
            "requested (health check failed)"
        );
    }
}
