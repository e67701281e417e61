//! Single-threaded observer wiring between the machine levels.
//!
//! ```text
//! RunController.bus ──► Inbox<RunEvent>  (drained by CaseMachine)
//! CaseMachine.bus   ──► Inbox<CaseEvent> (drained by StudyMachine)
//! StudyMachine.bus  ──► taps only
//! ```
//!
//! `emit` invokes every listener synchronously in subscription order. A
//! machine only ever subscribes to the machine directly below it, so the
//! wiring cannot form a cycle.

use crate::events::Envelope;
use smallvec::SmallVec;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};

/// Receives events synchronously from an [`EventBus`].
pub trait Listener<E>: Send + Sync {
    fn on_event(&self, envelope: &Envelope<E>);
}

impl<E, F> Listener<E> for F
where
    F: Fn(&Envelope<E>) + Send + Sync,
{
    fn on_event(&self, envelope: &Envelope<E>) {
        self(envelope)
    }
}

/// Ordered list of listeners for one emitting machine.
pub struct EventBus<E> {
    source: i64,
    listeners: SmallVec<[Arc<dyn Listener<E>>; 4]>,
}

impl<E> EventBus<E> {
    pub fn new(source: i64) -> Self {
        Self {
            source,
            listeners: SmallVec::new(),
        }
    }

    pub fn source(&self) -> i64 {
        self.source
    }

    /// Rebinds the emitter id, for machines whose aggregate id is only known
    /// after loading.
    pub fn set_source(&mut self, source: i64) {
        self.source = source;
    }

    pub fn subscribe(&mut self, listener: Arc<dyn Listener<E>>) {
        self.listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// Delivers `event` to every listener, in insertion order.
    pub fn emit(&self, event: E) {
        let envelope = Envelope::new(self.source, event);
        for listener in &self.listeners {
            listener.on_event(&envelope);
        }
    }
}

impl<E> fmt::Debug for EventBus<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.source)
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

/// FIFO listener a parent machine registers on its child.
///
/// The parent drains it after every call into the child and handles the
/// events in emission order.
pub struct Inbox<E> {
    queue: Arc<Mutex<VecDeque<Envelope<E>>>>,
}

impl<E> Clone for Inbox<E> {
    fn clone(&self) -> Self {
        Self {
            queue: Arc::clone(&self.queue),
        }
    }
}

impl<E> Default for Inbox<E> {
    fn default() -> Self {
        Self {
            queue: Arc::new(Mutex::new(VecDeque::new())),
        }
    }
}

impl<E> Inbox<E> {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<Envelope<E>>> {
        self.queue.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn pop(&self) -> Option<Envelope<E>> {
        self.lock().pop_front()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }
}

impl<E: Clone + Send + 'static> Listener<E> for Inbox<E> {
    fn on_event(&self, envelope: &Envelope<E>) {
        self.lock().push_back(envelope.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::RunEvent;

    #[test]
    fn test_listeners_invoked_in_insertion_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let mut bus = EventBus::new(7);

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            bus.subscribe(Arc::new(move |env: &Envelope<RunEvent>| {
                order.lock().unwrap().push((tag, env.source, env.event));
            }));
        }

        bus.emit(RunEvent::ExecutionStart);

        let seen = order.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                ("first", 7, RunEvent::ExecutionStart),
                ("second", 7, RunEvent::ExecutionStart),
                ("third", 7, RunEvent::ExecutionStart),
            ]
        );
    }

    #[test]
    fn test_inbox_preserves_emission_order() {
        let inbox = Inbox::new();
        let mut bus = EventBus::new(1);
        bus.subscribe(Arc::new(inbox.clone()));

        bus.emit(RunEvent::SubmissionRequested);
        bus.emit(RunEvent::SubmissionSuccess);
        bus.emit(RunEvent::ExecutionStart);

        assert_eq!(inbox.len(), 3);
        let drained: Vec<_> = std::iter::from_fn(|| inbox.pop()).map(|e| e.event).collect();
        assert_eq!(
            drained,
            vec![
                RunEvent::SubmissionRequested,
                RunEvent::SubmissionSuccess,
                RunEvent::ExecutionStart,
            ]
        );
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_emit_without_listeners_is_noop() {
        let bus: EventBus<RunEvent> = EventBus::new(3);
        bus.emit(RunEvent::DeletionSuccess);
        assert_eq!(bus.listener_count(), 0);
    }
}
