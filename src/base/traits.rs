use crate::engine::EngineEvent;

/// Receives every lifecycle event the protocol engine produces.
///
/// The engine calls this from whichever thread drove the transition (the link worker for wire
/// events, the enqueuing caller for `Queued`), never while holding its own lock, so an
/// implementation may call back into the engine.
pub trait EventSink: Send + Sync {
    /// Handles one event. Must not block for long: the link worker is waiting on it.
    fn on_event(&self, event: EngineEvent);
}

impl<F> EventSink for F
where
    F: Fn(EngineEvent) + Send + Sync,
{
    fn on_event(&self, event: EngineEvent) {
        self(event)
    }
}
