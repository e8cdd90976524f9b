//! Broadcast event bus for run lifecycle events.
//!
//! Built on `tokio::sync::broadcast`. The executor publishes and never waits:
//! with no subscribers an event is dropped, and a slow subscriber lags instead
//! of applying backpressure. [`EventStream`] is the consumer side most callers
//! want. It narrows the bus to one run, skips over lag and ends after that
//! run's `RunFinished`.

use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use uuid::Uuid;
use weft_types::event::RunEvent;

/// Multi-consumer bus for run lifecycle events.
///
/// Clones share one channel, so any clone may publish or subscribe.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<RunEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Raw receiver for every future event of every run.
    pub fn subscribe(&self) -> broadcast::Receiver<RunEvent> {
        self.sender.subscribe()
    }

    /// Events of the next run to finish, whichever run that is.
    pub fn stream(&self) -> EventStream {
        EventStream::new(self.subscribe(), None)
    }

    /// Events of one run only.
    pub fn stream_run(&self, run_id: Uuid) -> EventStream {
        EventStream::new(self.subscribe(), Some(run_id))
    }

    pub fn publish(&self, event: RunEvent) {
        // Err only means nobody is listening.
        let _ = self.sender.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("receiver_count", &self.sender.receiver_count())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// EventStream
// ---------------------------------------------------------------------------

/// A lag-tolerant view of the bus that ends with a run.
#[derive(Debug)]
pub struct EventStream {
    rx: broadcast::Receiver<RunEvent>,
    run_id: Option<Uuid>,
    finished: bool,
    missed: u64,
}

impl EventStream {
    fn new(rx: broadcast::Receiver<RunEvent>, run_id: Option<Uuid>) -> Self {
        Self {
            rx,
            run_id,
            finished: false,
            missed: 0,
        }
    }

    /// Next matching event; `None` once the run has finished or the bus is gone.
    pub async fn next(&mut self) -> Option<RunEvent> {
        if self.finished {
            return None;
        }
        loop {
            match self.rx.recv().await {
                Ok(event) => {
                    if self.run_id.is_some_and(|id| id != event.run_id()) {
                        continue;
                    }
                    if matches!(event, RunEvent::RunFinished { .. }) {
                        self.finished = true;
                    }
                    return Some(event);
                }
                Err(RecvError::Lagged(n)) => {
                    self.missed += n;
                    tracing::warn!(missed = n, "event subscriber lagged; events dropped");
                }
                Err(RecvError::Closed) => {
                    self.finished = true;
                    return None;
                }
            }
        }
    }

    /// Events dropped so far because this subscriber fell behind.
    pub fn missed(&self) -> u64 {
        self.missed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_types::run::RunStatus;

    fn started(run_id: Uuid, step: &str) -> RunEvent {
        RunEvent::StepStarted {
            run_id,
            step_id: step.to_string(),
            attempt: 1,
        }
    }

    fn finished(run_id: Uuid) -> RunEvent {
        RunEvent::RunFinished {
            run_id,
            status: RunStatus::Completed,
        }
    }

    #[tokio::test]
    async fn test_stream_ends_after_run_finished() {
        let bus = EventBus::new(16);
        let run_id = Uuid::now_v7();
        let mut stream = bus.stream();

        bus.publish(started(run_id, "build"));
        bus.publish(finished(run_id));
        bus.publish(started(Uuid::now_v7(), "late"));

        assert!(matches!(stream.next().await, Some(RunEvent::StepStarted { .. })));
        assert!(matches!(stream.next().await, Some(RunEvent::RunFinished { .. })));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_run_ignores_other_runs() {
        let bus = EventBus::new(16);
        let mine = Uuid::now_v7();
        let other = Uuid::now_v7();
        let mut stream = bus.stream_run(mine);

        bus.publish(started(other, "a"));
        bus.publish(finished(other));
        bus.publish(started(mine, "b"));

        match stream.next().await {
            Some(RunEvent::StepStarted { step_id, .. }) => assert_eq!(step_id, "b"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_stream_skips_over_lag() {
        let bus = EventBus::new(2);
        let run_id = Uuid::now_v7();
        let mut stream = bus.stream();

        for i in 0..5 {
            bus.publish(started(run_id, &format!("s{i}")));
        }
        bus.publish(finished(run_id));

        let mut seen = Vec::new();
        while let Some(event) = stream.next().await {
            seen.push(event);
        }
        assert!(stream.missed() > 0);
        assert!(matches!(seen.last(), Some(RunEvent::RunFinished { .. })));
    }

    #[tokio::test]
    async fn test_stream_ends_when_bus_dropped() {
        let bus = EventBus::new(4);
        let mut stream = bus.stream();
        drop(bus);
        assert!(stream.next().await.is_none());
    }

    #[test]
    fn test_publish_without_subscribers_is_noop() {
        let bus = EventBus::default();
        bus.publish(finished(Uuid::now_v7()));
        assert_eq!(bus.receiver_count(), 0);
    }
}
